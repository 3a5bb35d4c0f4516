//! Bus Error Taxonomy
//!
//! Typed errors for every IPC-facing operation. Wire-level error names
//! (the `org.bluez.*` / `org.freedesktop.DBus.*` vocabulary inherited from
//! the host stack) are mapped onto these kinds in one place so callers never
//! match on strings.

use std::time::Duration;

use thiserror::Error;

/// Error raised by transport, reliability and device-facing bus operations
#[derive(Error, Debug, Clone)]
pub enum BusError {
    // Transport
    #[error("IPC bus unavailable: {0}")]
    IpcUnavailable(String),

    #[error("operation '{op}' timed out after {budget:?} ({context})")]
    OperationTimeout {
        op: String,
        budget: Duration,
        context: String,
    },

    #[error("no reply from bus peer: {0}")]
    NoReply(String),

    #[error("introspection yielded no interfaces for {path}")]
    IntrospectionFailed { path: String },

    // State
    #[error("device not connected")]
    NotConnected,

    #[error("services not resolved")]
    NotResolved,

    #[error("operation already in progress")]
    InProgress,

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("unknown object: {0}")]
    UnknownObject(String),

    // Authorisation
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("not permitted: {0}")]
    NotPermitted(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("authentication cancelled")]
    AuthenticationCancelled,

    // Arguments
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("invalid UUID: {0}")]
    InvalidUuid(String),

    // Device
    #[error("controller stall on {0}")]
    ControllerStall(String),

    #[error("device unreachable: {0}")]
    DeviceUnreachable(String),

    #[error("pairing failed: {0}")]
    PairingFailed(String),

    #[error("bus operation failed: {0}")]
    Failed(String),
}

/// Result alias for bus operations
pub type BusResult<T> = Result<T, BusError>;

impl BusError {
    /// Map a wire-level error name and message onto the typed taxonomy.
    ///
    /// Unknown names fall back to [`BusError::Failed`] so the original name
    /// is preserved in the message.
    pub fn from_wire(name: &str, message: &str) -> Self {
        match name {
            "org.freedesktop.DBus.Error.NoReply" => BusError::NoReply(message.to_string()),
            "org.freedesktop.DBus.Error.ServiceUnknown" => {
                BusError::IpcUnavailable(message.to_string())
            }
            "org.freedesktop.DBus.Error.UnknownObject" => {
                BusError::UnknownObject(message.to_string())
            }
            "org.freedesktop.DBus.Error.InvalidArgs" => BusError::InvalidArgs(message.to_string()),
            "org.freedesktop.DBus.Error.AccessDenied" => {
                BusError::NotAuthorized(message.to_string())
            }
            "org.bluez.Error.NotPermitted" => BusError::NotPermitted(message.to_string()),
            "org.bluez.Error.NotAuthorized" => BusError::NotAuthorized(message.to_string()),
            "org.bluez.Error.NotSupported" => BusError::NotSupported(message.to_string()),
            "org.bluez.Error.InvalidValueLength" => BusError::InvalidArgs(message.to_string()),
            "org.bluez.Error.InProgress" => BusError::InProgress,
            "org.bluez.Error.AlreadyExists" => BusError::AlreadyExists(message.to_string()),
            "org.bluez.Error.NotConnected" => BusError::NotConnected,
            "org.bluez.Error.NotReady" => BusError::IpcUnavailable(message.to_string()),
            "org.bluez.Error.DoesNotExist" | "org.bluez.Error.NotAvailable" => {
                BusError::UnknownObject(message.to_string())
            }
            "org.bluez.Error.AuthenticationFailed" => {
                BusError::AuthenticationFailed(message.to_string())
            }
            "org.bluez.Error.AuthenticationCanceled"
            | "org.bluez.Error.AuthenticationCancelled" => BusError::AuthenticationCancelled,
            "org.bluez.Error.ConnectionAttemptFailed" => {
                BusError::DeviceUnreachable(message.to_string())
            }
            "org.bluez.Error.Failed" if message.contains("Not connected") => BusError::NotConnected,
            _ => BusError::Failed(format!("{name}: {message}")),
        }
    }

    /// True for errors the staged recovery pipeline should attempt to heal.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BusError::OperationTimeout { .. }
                | BusError::NoReply(_)
                | BusError::ControllerStall(_)
                | BusError::NotConnected
                | BusError::IpcUnavailable(_)
        )
    }

    /// True for permission-wall errors that are recorded and skipped, never
    /// fatal to an enumeration pass.
    pub fn is_authorization(&self) -> bool {
        matches!(
            self,
            BusError::NotAuthorized(_)
                | BusError::NotPermitted(_)
                | BusError::AuthenticationFailed(_)
                | BusError::AuthenticationCancelled
        )
    }

    /// Short stable label used in permission maps and metrics.
    pub fn kind_label(&self) -> &'static str {
        match self {
            BusError::IpcUnavailable(_) => "IpcUnavailable",
            BusError::OperationTimeout { .. } => "OperationTimeout",
            BusError::NoReply(_) => "NoReply",
            BusError::IntrospectionFailed { .. } => "IntrospectionFailed",
            BusError::NotConnected => "NotConnected",
            BusError::NotResolved => "NotResolved",
            BusError::InProgress => "InProgress",
            BusError::AlreadyExists(_) => "AlreadyExists",
            BusError::UnknownObject(_) => "UnknownObject",
            BusError::NotAuthorized(_) => "NotAuthorized",
            BusError::NotPermitted(_) => "NotPermitted",
            BusError::AuthenticationFailed(_) => "AuthenticationFailed",
            BusError::AuthenticationCancelled => "AuthenticationCancelled",
            BusError::InvalidArgs(_) => "InvalidArgs",
            BusError::NotSupported(_) => "NotSupported",
            BusError::InvalidUuid(_) => "InvalidUuid",
            BusError::ControllerStall(_) => "ControllerStall",
            BusError::DeviceUnreachable(_) => "DeviceUnreachable",
            BusError::PairingFailed(_) => "PairingFailed",
            BusError::Failed(_) => "Failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_map_to_kinds() {
        assert!(matches!(
            BusError::from_wire("org.bluez.Error.NotPermitted", "write denied"),
            BusError::NotPermitted(_)
        ));
        assert!(matches!(
            BusError::from_wire("org.bluez.Error.NotConnected", ""),
            BusError::NotConnected
        ));
        assert!(matches!(
            BusError::from_wire("org.freedesktop.DBus.Error.NoReply", "timeout"),
            BusError::NoReply(_)
        ));
        // The legacy single-l spelling shows up on older daemons
        assert!(matches!(
            BusError::from_wire("org.bluez.Error.AuthenticationCanceled", ""),
            BusError::AuthenticationCancelled
        ));
    }

    #[test]
    fn failed_preserves_unknown_name() {
        let err = BusError::from_wire("org.example.Weird", "boom");
        assert!(err.to_string().contains("org.example.Weird"));
    }

    #[test]
    fn authorization_kinds_are_not_recoverable() {
        let err = BusError::NotAuthorized("read".into());
        assert!(err.is_authorization());
        assert!(!err.is_recoverable());
    }
}
