//! Core context.
//!
//! One explicit object owns the shared subsystems (bus pool, observation
//! store, signal router, metrics, health monitor, recovery manager) and is
//! passed down through orchestrators. Process-wide state stays inside the
//! constructor and drop; nothing here is a global.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use lib_bus::{
    BusPool, BusTransport, HealthMonitor, MetricsCollector, RecoveryManager,
};
use lib_observations::ObservationStore;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::CoreConfig;
use crate::signals::{attach_router, default_config, SignalRouter};

pub struct Context {
    pub config: CoreConfig,
    pub bus: Arc<dyn BusTransport>,
    pub pool: Arc<BusPool>,
    pub store: Arc<ObservationStore>,
    pub metrics: Arc<MetricsCollector>,
    pub router: Arc<SignalRouter>,
    pub recovery: Arc<RecoveryManager>,
    pub health: Arc<HealthMonitor>,
    /// Discovery variants serialise on the adapter.
    pub adapter_lock: AsyncMutex<()>,
    device_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Context {
    /// Build a context over an opened store and transport, start the signal
    /// bridge and health monitor.
    pub async fn start(config: CoreConfig, bus: Arc<dyn BusTransport>) -> Result<Arc<Self>> {
        let store = Arc::new(ObservationStore::open(&config.db_path).await?);
        Self::start_with_store(config, bus, store).await
    }

    /// Context over an in-memory store; tests and ephemeral runs.
    pub async fn start_in_memory(config: CoreConfig, bus: Arc<dyn BusTransport>) -> Result<Arc<Self>> {
        let store = Arc::new(ObservationStore::open_in_memory().await?);
        Self::start_with_store(config, bus, store).await
    }

    async fn start_with_store(
        config: CoreConfig,
        bus: Arc<dyn BusTransport>,
        store: Arc<ObservationStore>,
    ) -> Result<Arc<Self>> {
        let metrics = Arc::new(MetricsCollector::new());
        let pool = Arc::new(BusPool::with_transport(bus.clone(), metrics.clone()));
        let router = SignalRouter::start(
            store.clone(),
            metrics.clone(),
            config.signals_dir().join("output"),
            default_config(),
        );
        let recovery = Arc::new(RecoveryManager::new(metrics.clone()));
        let health = Arc::new(HealthMonitor::new(
            bus.clone(),
            Duration::from_secs(5),
            metrics.clone(),
        ));

        let ctx = Arc::new(Self {
            config,
            bus,
            pool,
            store,
            metrics,
            router,
            recovery,
            health,
            adapter_lock: AsyncMutex::new(()),
            device_locks: Mutex::new(HashMap::new()),
        });
        let _bridge = attach_router(&ctx);
        let _heartbeat = ctx.health.start();
        Ok(ctx)
    }

    /// Per-device lock serialising evidence collection and recovery; two
    /// holders for the same MAC never run concurrently, different MACs may.
    pub fn device_lock(&self, mac: &str) -> Arc<AsyncMutex<()>> {
        self.device_locks
            .lock()
            .entry(mac.to_ascii_lowercase())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub fn adapter_path(&self) -> String {
        format!("/org/bluez/{}", self.config.adapter)
    }
}
