//! Pairing state machine.
//!
//! `Idle → Requested → WaitingForInput → Confirming → Bonding →
//! (Complete | Failed | Cancelled)`. External cancel is accepted in any
//! state; terminal states reset to `Idle` when the next pairing begins.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Idle,
    Requested,
    WaitingForInput,
    Confirming,
    Bonding,
    Complete,
    Failed,
    Cancelled,
}

impl PairingState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PairingState::Complete | PairingState::Failed | PairingState::Cancelled
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid pairing transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: PairingState,
    pub to: PairingState,
}

#[derive(Debug)]
pub struct PairingMachine {
    state: PairingState,
    device_path: Option<String>,
    last_error: Option<String>,
}

impl Default for PairingMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PairingMachine {
    pub fn new() -> Self {
        Self {
            state: PairingState::Idle,
            device_path: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    pub fn device_path(&self) -> Option<&str> {
        self.device_path.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn valid(from: PairingState, to: PairingState) -> bool {
        use PairingState::*;
        // Cancel is accepted from any non-terminal state.
        if to == Cancelled && !from.is_terminal() {
            return true;
        }
        matches!(
            (from, to),
            (Idle, Requested)
                | (Requested, WaitingForInput)
                | (Requested, Bonding)
                | (Requested, Failed)
                | (WaitingForInput, Confirming)
                | (WaitingForInput, Failed)
                | (Confirming, Bonding)
                | (Confirming, Failed)
                | (Bonding, Complete)
                | (Bonding, Failed)
                | (Complete, Idle)
                | (Failed, Idle)
                | (Cancelled, Idle)
        )
    }

    pub fn transition(&mut self, to: PairingState) -> Result<(), InvalidTransition> {
        if Self::valid(self.state, to) {
            self.state = to;
            Ok(())
        } else {
            Err(InvalidTransition {
                from: self.state,
                to,
            })
        }
    }

    /// Begin a pairing interaction for a device; resets a terminal state.
    pub fn begin(&mut self, device_path: &str) -> Result<(), InvalidTransition> {
        if self.state.is_terminal() {
            self.transition(PairingState::Idle)?;
        }
        self.device_path = Some(device_path.to_string());
        self.last_error = None;
        self.transition(PairingState::Requested)
    }

    pub fn fail(&mut self, reason: &str) {
        self.last_error = Some(reason.to_string());
        // Failure is reachable from every active state.
        if !self.state.is_terminal() {
            self.state = PairingState::Failed;
        }
    }

    pub fn cancel(&mut self) {
        if !self.state.is_terminal() {
            self.state = PairingState::Cancelled;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_reaches_complete() {
        let mut machine = PairingMachine::new();
        machine.begin("/org/bluez/hci0/dev_X").unwrap();
        machine.transition(PairingState::WaitingForInput).unwrap();
        machine.transition(PairingState::Confirming).unwrap();
        machine.transition(PairingState::Bonding).unwrap();
        machine.transition(PairingState::Complete).unwrap();
        assert!(machine.state().is_terminal());
        // Next pairing resets through Idle.
        machine.begin("/org/bluez/hci0/dev_Y").unwrap();
        assert_eq!(machine.state(), PairingState::Requested);
    }

    #[test]
    fn illegal_jumps_are_rejected() {
        let mut machine = PairingMachine::new();
        assert!(machine.transition(PairingState::Bonding).is_err());
        machine.begin("/dev").unwrap();
        assert!(machine.transition(PairingState::Complete).is_err());
    }

    #[test]
    fn cancel_is_accepted_anywhere() {
        let mut machine = PairingMachine::new();
        machine.begin("/dev").unwrap();
        machine.transition(PairingState::WaitingForInput).unwrap();
        machine.cancel();
        assert_eq!(machine.state(), PairingState::Cancelled);
        // but not after a terminal state
        machine.cancel();
        assert_eq!(machine.state(), PairingState::Cancelled);
    }
}
