//! Read / write / notify primitives.
//!
//! Every successful read and write is routed through the signal router,
//! which persists the history row; notifications arrive through the bus
//! stream and take the same path. Peers that reject the optioned call
//! signature get one retry with an explicit empty options dictionary.

use std::collections::BTreeMap;
use std::sync::Arc;

use lib_bus::{
    empty_options, BusError, BusResult, IpcValue, OpClass, Proxy, BLUEZ_SERVICE,
    GATT_CHARACTERISTIC_IFACE, GATT_DESCRIPTOR_IFACE,
};
use tracing::debug;

use crate::device::Device;
use crate::gatt::resolve::{ResolvedCharacteristic, ResolvedDescriptor};
use crate::signals::{SignalEvent, SignalType};

/// Write payload in any of the accepted input shapes.
#[derive(Debug, Clone)]
pub enum WriteInput {
    Hex(String),
    Ascii(String),
    Int(u64),
    Bytes(Vec<u8>),
}

impl WriteInput {
    /// Normalise to raw bytes. Integers become the minimal big-endian
    /// encoding; zero is a single byte.
    pub fn to_bytes(&self) -> BusResult<Vec<u8>> {
        match self {
            WriteInput::Bytes(bytes) => Ok(bytes.clone()),
            WriteInput::Ascii(text) => Ok(text.as_bytes().to_vec()),
            WriteInput::Hex(text) => {
                let cleaned = text.trim().trim_start_matches("0x").replace([' ', ':'], "");
                hex::decode(&cleaned)
                    .map_err(|e| BusError::InvalidArgs(format!("hex payload: {e}")))
            }
            WriteInput::Int(value) => {
                let bytes = value.to_be_bytes();
                let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
                Ok(bytes[first..].to_vec())
            }
        }
    }
}

/// Write flavour, selected from the property flags when `Auto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    #[default]
    Auto,
    /// Write with response.
    Request,
    /// Write without response.
    Command,
}

async fn char_proxy(device: &Device, chr: &ResolvedCharacteristic) -> BusResult<Arc<Proxy>> {
    device
        .ctx
        .pool
        .get_proxy(BLUEZ_SERVICE, &chr.path, GATT_CHARACTERISTIC_IFACE)
        .await
}

fn emit_history(
    device: &Device,
    chr: &ResolvedCharacteristic,
    service_uuid: &str,
    signal_type: SignalType,
    value: &[u8],
) {
    let event = SignalEvent::new(signal_type, &chr.path)
        .with_identity(device.mac(), service_uuid, &chr.uuid)
        .with_value(IpcValue::Bytes(value.to_vec()));
    device.ctx.router.dispatch(event);
}

/// Single reconnect-and-retry wrapper for the not-connected race.
async fn with_reconnect<T, F, Fut>(device: &Device, operation: F) -> BusResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = BusResult<T>>,
{
    match operation().await {
        Err(BusError::NotConnected) => {
            debug!(
                target: "bleep::gatt",
                mac = %device.mac(),
                "operation raced a disconnect; reconnecting once"
            );
            device.connect(0).await?;
            operation().await
        }
        other => other,
    }
}

/// Read a characteristic value.
///
/// `service_uuid` feeds the history row identity. With `enforce_hints` the
/// read is refused locally when the flags advertise no read access; the
/// aggressive variants pass `false` and let the peer decide.
pub async fn read_characteristic(
    device: &Device,
    chr: &ResolvedCharacteristic,
    service_uuid: &str,
    enforce_hints: bool,
) -> BusResult<Vec<u8>> {
    if enforce_hints && !chr.is_readable() {
        return Err(BusError::NotSupported(format!(
            "{} advertises no read access",
            chr.uuid
        )));
    }
    let proxy = char_proxy(device, chr).await?;
    let value = with_reconnect(device, || async {
        match proxy.call_as(OpClass::Read, "ReadValue", vec![]).await {
            Err(BusError::InvalidArgs(_)) => {
                proxy
                    .call_as(OpClass::Read, "ReadValue", vec![empty_options()])
                    .await
            }
            other => other,
        }
    })
    .await?;
    let bytes = value
        .to_byte_vec()
        .ok_or_else(|| BusError::Failed(format!("non-byte read reply from {}", chr.uuid)))?;
    emit_history(device, chr, service_uuid, SignalType::Read, &bytes);
    Ok(bytes)
}

/// Write a characteristic value with the selected flavour.
pub async fn write_characteristic(
    device: &Device,
    chr: &ResolvedCharacteristic,
    service_uuid: &str,
    payload: &WriteInput,
    mode: WriteMode,
) -> BusResult<()> {
    let bytes = payload.to_bytes()?;
    let write_type = match mode {
        WriteMode::Request => "request",
        WriteMode::Command => "command",
        WriteMode::Auto => {
            if chr.flags.iter().any(|f| f == "write") {
                "request"
            } else {
                "command"
            }
        }
    };
    let mut options = BTreeMap::new();
    options.insert("type".to_string(), IpcValue::Str(write_type.to_string()));

    let proxy = char_proxy(device, chr).await?;
    with_reconnect(device, || {
        let proxy = proxy.clone();
        let bytes = bytes.clone();
        let options = options.clone();
        async move {
            match proxy
                .call_as(
                    OpClass::Write,
                    "WriteValue",
                    vec![IpcValue::Bytes(bytes.clone()), IpcValue::Dict(options)],
                )
                .await
            {
                Err(BusError::InvalidArgs(_)) => {
                    proxy
                        .call_as(
                            OpClass::Write,
                            "WriteValue",
                            vec![IpcValue::Bytes(bytes), empty_options()],
                        )
                        .await
                }
                other => other,
            }
        }
    })
    .await?;
    emit_history(device, chr, service_uuid, SignalType::Write, &bytes);
    Ok(())
}

/// Enable notifications; the router receives them as `Value` property
/// changes. Subscription intent is noted on the device for recovery.
pub async fn start_notify(
    device: &Device,
    chr: &ResolvedCharacteristic,
) -> BusResult<()> {
    start_notify_raw(device, chr).await?;
    device.note_subscription(&chr.uuid, true);
    Ok(())
}

/// StartNotify without touching subscription intent (recovery re-arm path).
pub async fn start_notify_raw(device: &Device, chr: &ResolvedCharacteristic) -> BusResult<()> {
    let proxy = char_proxy(device, chr).await?;
    proxy
        .call_as(OpClass::NotifyStart, "StartNotify", vec![])
        .await
        .map(|_| ())
}

pub async fn stop_notify(device: &Device, chr: &ResolvedCharacteristic) -> BusResult<()> {
    let proxy = char_proxy(device, chr).await?;
    proxy
        .call_as(OpClass::NotifyStop, "StopNotify", vec![])
        .await?;
    device.note_subscription(&chr.uuid, false);
    Ok(())
}

pub async fn read_descriptor(device: &Device, desc: &ResolvedDescriptor) -> BusResult<Vec<u8>> {
    let proxy = device
        .ctx
        .pool
        .get_proxy(BLUEZ_SERVICE, &desc.path, GATT_DESCRIPTOR_IFACE)
        .await?;
    let value = match proxy.call_as(OpClass::Read, "ReadValue", vec![]).await {
        Err(BusError::InvalidArgs(_)) => {
            proxy
                .call_as(OpClass::Read, "ReadValue", vec![empty_options()])
                .await?
        }
        other => other?,
    };
    value
        .to_byte_vec()
        .ok_or_else(|| BusError::Failed(format!("non-byte descriptor reply from {}", desc.uuid)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_input_normalisation() {
        assert_eq!(
            WriteInput::Hex("0xDEADbeef".into()).to_bytes().unwrap(),
            vec![0xde, 0xad, 0xbe, 0xef]
        );
        assert_eq!(
            WriteInput::Hex("de ad be ef".into()).to_bytes().unwrap(),
            vec![0xde, 0xad, 0xbe, 0xef]
        );
        assert_eq!(WriteInput::Ascii("AB".into()).to_bytes().unwrap(), vec![0x41, 0x42]);
        assert_eq!(WriteInput::Int(0).to_bytes().unwrap(), vec![0x00]);
        assert_eq!(WriteInput::Int(0x0102).to_bytes().unwrap(), vec![0x01, 0x02]);
        assert!(WriteInput::Hex("zz".into()).to_bytes().is_err());
    }
}
