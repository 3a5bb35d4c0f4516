//! Pairing agent.
//!
//! The agent is an object the engine exposes to the host stack; the stack
//! calls back into it during pairing attempts. Requests route through the
//! configured IO handler and the pairing state machine; completed pairings
//! under a bondable capability persist a bond record.

pub mod bond_store;
pub mod io;
pub mod state;

pub use bond_store::{BondRecord, BondStore};
pub use io::{AgentIo, AutoAcceptIo, RejectAllIo};
pub use state::{InvalidTransition, PairingMachine, PairingState};

use std::sync::Arc;

use async_trait::async_trait;
use lib_bus::{
    AgentCallbacks, AgentCapability, BusError, BusResult, BusTransport, HealthEvent,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::device::Device;

pub const AGENT_PATH: &str = "/bleep/agent";

#[derive(Debug, Clone)]
pub enum PairingEvent {
    StateChanged(PairingState),
    Complete { device: String },
    Failed { device: String, reason: String },
    Cancelled { device: String },
}

pub struct PairingAgent {
    capability: AgentCapability,
    io: Arc<dyn AgentIo>,
    bonds: Arc<BondStore>,
    machine: Mutex<PairingMachine>,
    events: broadcast::Sender<PairingEvent>,
}

impl PairingAgent {
    pub fn new(capability: AgentCapability, io: Arc<dyn AgentIo>, bonds: Arc<BondStore>) -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        Arc::new(Self {
            capability,
            io,
            bonds,
            machine: Mutex::new(PairingMachine::new()),
            events,
        })
    }

    pub fn capability(&self) -> AgentCapability {
        self.capability
    }

    pub fn state(&self) -> PairingState {
        self.machine.lock().state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PairingEvent> {
        self.events.subscribe()
    }

    fn set_state(&self, state: PairingState) {
        let mut machine = self.machine.lock();
        if let Err(err) = machine.transition(state) {
            debug!(target: "bleep::agent", %err, "out-of-order agent callback");
        }
        let _ = self.events.send(PairingEvent::StateChanged(machine.state()));
    }

    fn begin(&self, device_path: &str) {
        let mut machine = self.machine.lock();
        if let Err(err) = machine.begin(device_path) {
            debug!(target: "bleep::agent", %err, "pairing begin while busy");
        }
        let _ = self.events.send(PairingEvent::StateChanged(machine.state()));
    }

    fn fail(&self, device: &str, reason: &str) {
        self.machine.lock().fail(reason);
        let _ = self.events.send(PairingEvent::Failed {
            device: device.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Register with the host stack and claim default-agent status.
    pub async fn register(self: &Arc<Self>, ctx: &Arc<Context>) -> BusResult<()> {
        ctx.bus
            .register_agent(AGENT_PATH, self.capability, self.clone())
            .await?;
        ctx.bus.request_default_agent(AGENT_PATH).await?;
        info!(
            target: "bleep::agent",
            capability = self.capability.wire_name(),
            "pairing agent registered"
        );
        Ok(())
    }

    pub async fn unregister(&self, ctx: &Arc<Context>) -> BusResult<()> {
        ctx.bus.unregister_agent(AGENT_PATH).await
    }

    /// Re-register automatically whenever the host daemon restarts.
    pub fn attach_monitor(self: &Arc<Self>, ctx: &Arc<Context>) {
        let agent = self.clone();
        let ctx = ctx.clone();
        let mut events = ctx.health.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if event == HealthEvent::Restarted {
                    info!(target: "bleep::agent", "daemon restarted; re-registering agent");
                    if let Err(err) = agent.register(&ctx).await {
                        warn!(target: "bleep::agent", error = %err, "agent re-registration failed");
                    }
                }
            }
        });
    }

    /// Drive a full pairing of `device`, persisting the bond on success.
    ///
    /// The prompts themselves arrive through the agent callbacks while the
    /// host stack processes the pair call.
    pub async fn pair_device(
        self: &Arc<Self>,
        device: &Arc<Device>,
        keys: Option<Vec<u8>>,
    ) -> BusResult<()> {
        self.begin(device.path());
        match device.pair().await {
            Ok(()) => {
                {
                    let mut machine = self.machine.lock();
                    if machine.transition(PairingState::Complete).is_err() {
                        // JustWorks pairings skip the input states; walk the
                        // chain forward to the terminal state.
                        for state in [
                            PairingState::WaitingForInput,
                            PairingState::Confirming,
                            PairingState::Bonding,
                            PairingState::Complete,
                        ] {
                            let _ = machine.transition(state);
                        }
                    }
                    if machine.state() != PairingState::Complete {
                        machine.fail("state machine desynchronised");
                    }
                }
                if self.capability.is_bondable() {
                    let record = BondRecord::new(
                        device.mac(),
                        self.capability,
                        keys.unwrap_or_default(),
                    );
                    if let Err(err) = self.bonds.store(&record).await {
                        warn!(target: "bleep::agent", error = %err, "bond persist failed");
                    }
                }
                let _ = self.events.send(PairingEvent::Complete {
                    device: device.mac().to_string(),
                });
                Ok(())
            }
            Err(err) => {
                self.fail(device.mac(), &err.to_string());
                Err(err)
            }
        }
    }
}

#[async_trait]
impl AgentCallbacks for PairingAgent {
    async fn release(&self) {
        info!(target: "bleep::agent", "host stack released the agent");
        let mut machine = self.machine.lock();
        machine.cancel();
    }

    async fn request_pin_code(&self, device_path: &str) -> BusResult<String> {
        self.begin(device_path);
        self.set_state(PairingState::WaitingForInput);
        match self.io.request_pin(device_path).await {
            Ok(pin) => {
                self.set_state(PairingState::Confirming);
                self.set_state(PairingState::Bonding);
                Ok(pin)
            }
            Err(err) => {
                self.fail(device_path, "PIN entry rejected");
                Err(err)
            }
        }
    }

    async fn display_pin_code(&self, device_path: &str, pin: &str) -> BusResult<()> {
        self.io.display_pin(device_path, pin).await;
        Ok(())
    }

    async fn request_passkey(&self, device_path: &str) -> BusResult<u32> {
        self.begin(device_path);
        self.set_state(PairingState::WaitingForInput);
        match self.io.request_passkey(device_path).await {
            Ok(passkey) => {
                self.set_state(PairingState::Confirming);
                self.set_state(PairingState::Bonding);
                Ok(passkey)
            }
            Err(err) => {
                self.fail(device_path, "passkey entry rejected");
                Err(err)
            }
        }
    }

    async fn display_passkey(&self, device_path: &str, passkey: u32, entered: u16) {
        self.io.display_passkey(device_path, passkey, entered).await;
    }

    async fn request_confirmation(&self, device_path: &str, passkey: u32) -> BusResult<()> {
        self.begin(device_path);
        self.set_state(PairingState::WaitingForInput);
        match self.io.confirm(device_path, passkey).await {
            Ok(true) => {
                self.set_state(PairingState::Confirming);
                self.set_state(PairingState::Bonding);
                Ok(())
            }
            Ok(false) => {
                self.fail(device_path, "confirmation rejected");
                Err(BusError::NotAuthorized("confirmation rejected".to_string()))
            }
            Err(err) => {
                self.fail(device_path, &err.to_string());
                Err(err)
            }
        }
    }

    async fn request_authorization(&self, device_path: &str) -> BusResult<()> {
        match self.io.authorize(device_path).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(BusError::NotAuthorized("authorization refused".to_string())),
            Err(err) => Err(err),
        }
    }

    async fn authorize_service(&self, device_path: &str, uuid: &str) -> BusResult<()> {
        match self.io.authorize_service(device_path, uuid).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(BusError::NotAuthorized(format!(
                "service {uuid} authorization refused"
            ))),
            Err(err) => Err(err),
        }
    }

    async fn cancel(&self) {
        let device = self
            .machine
            .lock()
            .device_path()
            .unwrap_or_default()
            .to_string();
        self.machine.lock().cancel();
        let _ = self.events.send(PairingEvent::Cancelled { device });
    }
}
