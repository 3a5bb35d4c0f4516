//! Agent IO handlers.
//!
//! Every agent request routes through a handler: auto-accept for unattended
//! reconnaissance, reject-all for observation-only runs, or a programmatic
//! handler supplied by the embedding application. CLI prompting belongs to
//! the interface layer, not the core.

use async_trait::async_trait;
use lib_bus::BusResult;

#[async_trait]
pub trait AgentIo: Send + Sync {
    async fn request_pin(&self, device: &str) -> BusResult<String>;
    async fn request_passkey(&self, device: &str) -> BusResult<u32>;
    /// Numeric-comparison confirmation; `false` rejects the pairing.
    async fn confirm(&self, device: &str, passkey: u32) -> BusResult<bool>;
    async fn authorize(&self, device: &str) -> BusResult<bool>;
    async fn authorize_service(&self, device: &str, uuid: &str) -> BusResult<bool>;
    async fn display_pin(&self, device: &str, pin: &str);
    async fn display_passkey(&self, device: &str, passkey: u32, entered: u16);
}

/// Accepts every prompt with fixed credentials.
pub struct AutoAcceptIo {
    pub pin: String,
    pub passkey: u32,
}

impl Default for AutoAcceptIo {
    fn default() -> Self {
        Self {
            pin: "0000".to_string(),
            passkey: 0,
        }
    }
}

#[async_trait]
impl AgentIo for AutoAcceptIo {
    async fn request_pin(&self, _device: &str) -> BusResult<String> {
        Ok(self.pin.clone())
    }

    async fn request_passkey(&self, _device: &str) -> BusResult<u32> {
        Ok(self.passkey)
    }

    async fn confirm(&self, device: &str, passkey: u32) -> BusResult<bool> {
        tracing::debug!(target: "bleep::agent", device, passkey, "auto-confirming");
        Ok(true)
    }

    async fn authorize(&self, _device: &str) -> BusResult<bool> {
        Ok(true)
    }

    async fn authorize_service(&self, _device: &str, _uuid: &str) -> BusResult<bool> {
        Ok(true)
    }

    async fn display_pin(&self, device: &str, pin: &str) {
        tracing::info!(target: "bleep::agent", device, pin, "peer displays PIN");
    }

    async fn display_passkey(&self, device: &str, passkey: u32, entered: u16) {
        tracing::info!(target: "bleep::agent", device, passkey, entered, "peer displays passkey");
    }
}

/// Declines every prompt; useful for strictly passive assessments.
pub struct RejectAllIo;

#[async_trait]
impl AgentIo for RejectAllIo {
    async fn request_pin(&self, _device: &str) -> BusResult<String> {
        Err(lib_bus::BusError::AuthenticationCancelled)
    }

    async fn request_passkey(&self, _device: &str) -> BusResult<u32> {
        Err(lib_bus::BusError::AuthenticationCancelled)
    }

    async fn confirm(&self, _device: &str, _passkey: u32) -> BusResult<bool> {
        Ok(false)
    }

    async fn authorize(&self, _device: &str) -> BusResult<bool> {
        Ok(false)
    }

    async fn authorize_service(&self, _device: &str, _uuid: &str) -> BusResult<bool> {
        Ok(false)
    }

    async fn display_pin(&self, _device: &str, _pin: &str) {}

    async fn display_passkey(&self, _device: &str, _passkey: u32, _entered: u16) {}
}
