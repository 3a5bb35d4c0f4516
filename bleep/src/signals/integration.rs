//! Bus-to-router signal bridge.
//!
//! Subscribes to the raw bus stream so `PropertiesChanged` and
//! `InterfacesAdded`/`InterfacesRemoved` all land through the router.
//! Deserialisation already happened on the transport; this task only
//! classifies and re-shapes events, and keeps the proxy cache honest on
//! interface removal.

use std::sync::Arc;

use lib_bus::{
    BusSignal, BusTransport, IpcValue, GATT_CHARACTERISTIC_IFACE,
};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::context::Context;
use crate::signals::{SignalEvent, SignalType};

/// Map one raw bus signal onto router events.
pub fn events_for_signal(signal: &BusSignal) -> Vec<SignalEvent> {
    match signal {
        BusSignal::PropertiesChanged {
            path,
            interface,
            changed,
            ..
        } => changed
            .iter()
            .map(|(name, value)| {
                let is_notification =
                    interface == GATT_CHARACTERISTIC_IFACE && name == "Value";
                let signal_type = if is_notification {
                    SignalType::Notification
                } else {
                    SignalType::PropertyChange
                };
                let mut event = SignalEvent::new(signal_type, path);
                event.interface = Some(interface.clone());
                event.property_name = Some(name.clone());
                event.value = Some(value.clone());
                event
            })
            .collect(),
        BusSignal::InterfacesAdded { path, interfaces } => {
            // Surface as a property-change-shaped event carrying the
            // interface list, so routes can watch device arrival.
            let mut event = SignalEvent::new(SignalType::PropertyChange, path);
            event.property_name = Some("InterfacesAdded".to_string());
            event.value = Some(IpcValue::Array(
                interfaces
                    .keys()
                    .cloned()
                    .map(IpcValue::Str)
                    .collect(),
            ));
            vec![event]
        }
        BusSignal::InterfacesRemoved { path, interfaces } => {
            let mut event = SignalEvent::new(SignalType::PropertyChange, path);
            event.property_name = Some("InterfacesRemoved".to_string());
            event.value = Some(IpcValue::Array(
                interfaces.iter().cloned().map(IpcValue::Str).collect(),
            ));
            vec![event]
        }
    }
}

/// Spawn the bridge task for a context. Runs until the bus stream closes.
pub fn attach_router(ctx: &Arc<Context>) -> JoinHandle<()> {
    let mut rx = ctx.bus.subscribe();
    let ctx = ctx.clone();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(signal) => {
                    if let BusSignal::InterfacesRemoved { path, .. } = &signal {
                        ctx.pool.invalidate_path(path);
                    }
                    for event in events_for_signal(&signal) {
                        ctx.router.dispatch(event);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    ctx.metrics.increment_counter("router.lagged_signals");
                    debug!(
                        target: "bleep::signals",
                        missed,
                        "bus signal stream lagged"
                    );
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_bus::PropertyMap;

    #[test]
    fn value_change_on_characteristic_is_a_notification() {
        let mut changed = PropertyMap::new();
        changed.insert("Value".into(), IpcValue::Bytes(vec![1, 2]));
        let signal = BusSignal::PropertiesChanged {
            path: "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_01/service0028/char002a".into(),
            interface: GATT_CHARACTERISTIC_IFACE.into(),
            changed,
            invalidated: vec![],
        };
        let events = events_for_signal(&signal);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].signal_type, SignalType::Notification);
        assert_eq!(events[0].device_mac.as_deref(), Some("aa:bb:cc:dd:ee:01"));
    }

    #[test]
    fn connected_flip_is_a_property_change() {
        let mut changed = PropertyMap::new();
        changed.insert("Connected".into(), IpcValue::Bool(true));
        let signal = BusSignal::PropertiesChanged {
            path: "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_01".into(),
            interface: lib_bus::transport::DEVICE_IFACE.into(),
            changed,
            invalidated: vec![],
        };
        let events = events_for_signal(&signal);
        assert_eq!(events[0].signal_type, SignalType::PropertyChange);
        assert_eq!(events[0].property_name.as_deref(), Some("Connected"));
    }
}
