//! Bus pool and proxy cache.
//!
//! Scoped bus acquisition with health validation before reuse, transparent
//! replacement of unhealthy members, and a per-(service, path, interface)
//! proxy cache. Proxies wrap every call in the per-operation timeout layer
//! and feed the shared metrics collector.

use std::num::NonZeroUsize;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::error::{BusError, BusResult};
use crate::metrics::MetricsCollector;
use crate::timeout::{with_timeout, OpClass};
use crate::transport::BusTransport;
use crate::value::{IpcValue, PropertyMap};

/// Creates fresh transports when the pool runs dry or a member goes bad.
pub type BusFactory = Arc<dyn Fn() -> BusResult<Arc<dyn BusTransport>> + Send + Sync>;

const PROXY_CACHE_CAPACITY: usize = 256;
/// Members idle longer than this are health-checked before reuse.
const VALIDATE_AFTER: Duration = Duration::from_secs(30);

struct PoolMember {
    bus: Arc<dyn BusTransport>,
    last_used: Instant,
    uses: u64,
}

#[derive(Hash, PartialEq, Eq, Clone)]
struct ProxyKey {
    service: String,
    path: String,
    interface: String,
}

/// Shared pool of bus transports plus the proxy cache.
pub struct BusPool {
    factory: BusFactory,
    members: Mutex<Vec<PoolMember>>,
    proxies: Mutex<LruCache<ProxyKey, Arc<Proxy>>>,
    metrics: Arc<MetricsCollector>,
    max_members: usize,
}

impl BusPool {
    pub fn new(factory: BusFactory, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            factory,
            members: Mutex::new(Vec::new()),
            proxies: Mutex::new(LruCache::new(
                NonZeroUsize::new(PROXY_CACHE_CAPACITY).expect("nonzero capacity"),
            )),
            metrics,
            max_members: 4,
        }
    }

    /// Pool built over a single pre-existing transport (tests, embedded use).
    pub fn with_transport(bus: Arc<dyn BusTransport>, metrics: Arc<MetricsCollector>) -> Self {
        let shared = bus.clone();
        Self::new(Arc::new(move || Ok(shared.clone())), metrics)
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    /// Acquire a healthy bus for the duration of the returned guard.
    ///
    /// Members idle past the validation window are probed and replaced when
    /// the probe fails. Fails with `IpcUnavailable` only when no member can
    /// be created at all.
    pub async fn with_bus(self: &Arc<Self>) -> BusResult<BusGuard> {
        loop {
            let candidate = self.members.lock().pop();
            match candidate {
                Some(member) => {
                    let needs_validation = member.last_used.elapsed() > VALIDATE_AFTER;
                    if !needs_validation || member.bus.is_healthy().await {
                        return Ok(BusGuard {
                            bus: member.bus,
                            uses: member.uses + 1,
                            pool: Arc::downgrade(self),
                        });
                    }
                    tracing::debug!(target: "bleep::bus", "dropping unhealthy pool member");
                    self.metrics.increment_counter("pool.replaced_unhealthy");
                    // fall through and try the next member or create anew
                }
                None => {
                    let bus = (self.factory)().map_err(|err| {
                        BusError::IpcUnavailable(format!("bus factory failed: {err}"))
                    })?;
                    return Ok(BusGuard {
                        bus,
                        uses: 1,
                        pool: Arc::downgrade(self),
                    });
                }
            }
        }
    }

    fn release(&self, bus: Arc<dyn BusTransport>, uses: u64) {
        let mut members = self.members.lock();
        if members.len() < self.max_members {
            members.push(PoolMember {
                bus,
                last_used: Instant::now(),
                uses,
            });
        }
    }

    /// Cached proxy for one interface of one object.
    pub async fn get_proxy(
        self: &Arc<Self>,
        service: &str,
        path: &str,
        interface: &str,
    ) -> BusResult<Arc<Proxy>> {
        let key = ProxyKey {
            service: service.to_string(),
            path: path.to_string(),
            interface: interface.to_string(),
        };
        if let Some(proxy) = self.proxies.lock().get(&key) {
            return Ok(proxy.clone());
        }
        let guard = self.with_bus().await?;
        let proxy = Arc::new(Proxy {
            bus: guard.bus.clone(),
            service: key.service.clone(),
            path: key.path.clone(),
            interface: key.interface.clone(),
            metrics: self.metrics.clone(),
        });
        self.proxies.lock().put(key, proxy.clone());
        Ok(proxy)
    }

    /// Drop every cached proxy under `path` (interface-removed handling).
    pub fn invalidate_path(&self, path: &str) {
        let mut proxies = self.proxies.lock();
        let stale: Vec<ProxyKey> = proxies
            .iter()
            .filter(|(key, _)| key.path == path || key.path.starts_with(&format!("{path}/")))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            proxies.pop(&key);
        }
    }

    /// Explicit full reset of the proxy cache.
    pub fn reset_proxies(&self) {
        self.proxies.lock().clear();
    }

    /// Interface set for a path; `IntrospectionFailed` when empty.
    pub async fn introspect(self: &Arc<Self>, service: &str, path: &str) -> BusResult<Vec<String>> {
        let guard = self.with_bus().await?;
        guard.bus.introspect(service, path).await
    }
}

/// Scoped bus handle; returns the member to the pool on drop.
pub struct BusGuard {
    bus: Arc<dyn BusTransport>,
    uses: u64,
    pool: std::sync::Weak<BusPool>,
}

impl BusGuard {
    pub fn bus(&self) -> &Arc<dyn BusTransport> {
        &self.bus
    }
}

impl Deref for BusGuard {
    type Target = dyn BusTransport;

    fn deref(&self) -> &Self::Target {
        self.bus.as_ref()
    }
}

impl Drop for BusGuard {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release(self.bus.clone(), self.uses);
        }
    }
}

/// Typed handle to one interface of one object, with timeout enforcement.
pub struct Proxy {
    bus: Arc<dyn BusTransport>,
    service: String,
    path: String,
    interface: String,
    metrics: Arc<MetricsCollector>,
}

impl Proxy {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub async fn call(&self, method: &str, args: Vec<IpcValue>) -> BusResult<IpcValue> {
        self.call_as(OpClass::Default, method, args).await
    }

    pub async fn call_as(
        &self,
        op: OpClass,
        method: &str,
        args: Vec<IpcValue>,
    ) -> BusResult<IpcValue> {
        let context = format!("{}.{}", self.path, method);
        with_timeout(
            op,
            &context,
            &self.metrics,
            self.bus
                .call(&self.service, &self.path, &self.interface, method, args),
        )
        .await
    }

    pub async fn get(&self, name: &str) -> BusResult<IpcValue> {
        let context = format!("{}.{}", self.path, name);
        with_timeout(
            OpClass::GetProperty,
            &context,
            &self.metrics,
            self.bus
                .get_property(&self.service, &self.path, &self.interface, name),
        )
        .await
    }

    /// Property read that treats missing/unsupported as absent.
    pub async fn get_optional(&self, name: &str) -> Option<IpcValue> {
        match self.get(name).await {
            Ok(value) => Some(value),
            Err(BusError::UnknownObject(_)) | Err(BusError::NotSupported(_)) => None,
            Err(err) => {
                tracing::debug!(
                    target: "bleep::bus",
                    path = %self.path,
                    property = name,
                    error = %err,
                    "optional property read failed"
                );
                None
            }
        }
    }

    pub async fn set(&self, name: &str, value: IpcValue) -> BusResult<()> {
        let context = format!("{}.{}", self.path, name);
        with_timeout(
            OpClass::SetProperty,
            &context,
            &self.metrics,
            self.bus
                .set_property(&self.service, &self.path, &self.interface, name, value),
        )
        .await
    }

    pub async fn get_all(&self) -> BusResult<PropertyMap> {
        with_timeout(
            OpClass::GetProperty,
            &self.path,
            &self.metrics,
            self.bus
                .get_all_properties(&self.service, &self.path, &self.interface),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBus;
    use crate::transport::{ADAPTER_IFACE, BLUEZ_SERVICE};

    fn pool_over_mock() -> (Arc<BusPool>, Arc<MockBus>) {
        let mock = Arc::new(MockBus::new());
        let metrics = Arc::new(MetricsCollector::new());
        let pool = Arc::new(BusPool::with_transport(mock.clone(), metrics));
        (pool, mock)
    }

    #[tokio::test]
    async fn guard_returns_member_to_pool() {
        let (pool, _mock) = pool_over_mock();
        {
            let _guard = pool.with_bus().await.unwrap();
        }
        assert_eq!(pool.members.lock().len(), 1);
        {
            let _guard = pool.with_bus().await.unwrap();
            assert_eq!(pool.members.lock().len(), 0);
        }
        assert_eq!(pool.members.lock().len(), 1);
    }

    #[tokio::test]
    async fn proxy_cache_hits_by_key() {
        let (pool, _mock) = pool_over_mock();
        let first = pool
            .get_proxy(BLUEZ_SERVICE, "/org/bluez/hci0", ADAPTER_IFACE)
            .await
            .unwrap();
        let second = pool
            .get_proxy(BLUEZ_SERVICE, "/org/bluez/hci0", ADAPTER_IFACE)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        pool.invalidate_path("/org/bluez/hci0");
        let third = pool
            .get_proxy(BLUEZ_SERVICE, "/org/bluez/hci0", ADAPTER_IFACE)
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[tokio::test]
    async fn proxy_reads_adapter_property() {
        let (pool, _mock) = pool_over_mock();
        let proxy = pool
            .get_proxy(BLUEZ_SERVICE, "/org/bluez/hci0", ADAPTER_IFACE)
            .await
            .unwrap();
        let powered = proxy.get("Powered").await.unwrap();
        assert_eq!(powered.as_bool(), Some(true));
    }

    #[tokio::test]
    async fn introspection_failure_is_typed() {
        let (pool, _mock) = pool_over_mock();
        let err = pool
            .introspect(BLUEZ_SERVICE, "/org/bluez/hci9")
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::IntrospectionFailed { .. }));
    }
}
