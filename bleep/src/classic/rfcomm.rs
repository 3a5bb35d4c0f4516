//! Generic RFCOMM stream access.
//!
//! Higher OBEX profiles need a raw serial stream to a (MAC, channel) pair.
//! The connector is a trait so the engine stays independent of how the host
//! provides the socket; tests pair the loopback connector with a scripted
//! peer.

use std::collections::HashMap;

use async_trait::async_trait;
use lib_bus::{BusError, BusResult};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional serial stream.
pub trait RfcommStream: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug> RfcommStream for T {}

#[async_trait]
pub trait RfcommConnector: Send + Sync {
    /// Open a stream to `channel` on `mac`.
    async fn open(&self, mac: &str, channel: u8) -> BusResult<Box<dyn RfcommStream>>;
}

/// In-process connector: each registered (MAC, channel) endpoint hands out
/// one end of a duplex pipe, the test holds the other.
#[derive(Default)]
pub struct LoopbackRfcommConnector {
    endpoints: Mutex<HashMap<(String, u8), tokio::io::DuplexStream>>,
}

impl LoopbackRfcommConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint; returns the peer half for the caller to drive.
    pub fn register(&self, mac: &str, channel: u8) -> tokio::io::DuplexStream {
        let (local, remote) = tokio::io::duplex(4096);
        self.endpoints
            .lock()
            .insert((mac.to_ascii_lowercase(), channel), local);
        remote
    }
}

#[async_trait]
impl RfcommConnector for LoopbackRfcommConnector {
    async fn open(&self, mac: &str, channel: u8) -> BusResult<Box<dyn RfcommStream>> {
        self.endpoints
            .lock()
            .remove(&(mac.to_ascii_lowercase(), channel))
            .map(|stream| Box::new(stream) as Box<dyn RfcommStream>)
            .ok_or_else(|| {
                BusError::DeviceUnreachable(format!("no RFCOMM endpoint at {mac} channel {channel}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn loopback_round_trips_bytes() {
        let connector = LoopbackRfcommConnector::new();
        let mut peer = connector.register("AA:BB:CC:DD:EE:70", 3);
        let mut stream = connector.open("aa:bb:cc:dd:ee:70", 3).await.unwrap();

        stream.write_all(b"AT+BRSF=27\r").await.unwrap();
        let mut buf = [0u8; 16];
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"AT+BRSF=27\r");

        peer.write_all(b"OK\r\n").await.unwrap();
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"OK\r\n");
    }

    #[tokio::test]
    async fn unknown_endpoint_is_unreachable() {
        let connector = LoopbackRfcommConnector::new();
        let err = connector.open("aa:bb:cc:dd:ee:71", 1).await.unwrap_err();
        assert!(matches!(err, BusError::DeviceUnreachable(_)));
    }
}
