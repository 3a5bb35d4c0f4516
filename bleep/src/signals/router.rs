//! Signal router and action executor.
//!
//! A single dispatcher task walks enabled routes in declaration order for
//! every received event and runs each route's actions in order. One failing
//! action never cancels the remaining actions or routes. Under back-pressure
//! events feeding only droppable actions (log, forward) go first; a dropped
//! store or callback is always recorded on a metric counter.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use lib_bus::{IpcValue, MetricsCollector};
use lib_observations::{DeviceAttrs, HistorySource, ObservationStore};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::signals::config::{SaveFormat, SignalAction, SignalCaptureConfig, SignalType};
use crate::signals::SignalEvent;

const QUEUE_CAPACITY: usize = 1024;

pub type SignalCallback = Arc<dyn Fn(&SignalEvent) + Send + Sync>;
pub type SignalTransform = Arc<dyn Fn(SignalEvent) -> SignalEvent + Send + Sync>;

enum RouterMsg {
    Event(SignalEvent),
    Flush(oneshot::Sender<()>),
}

struct RouterShared {
    config: RwLock<SignalCaptureConfig>,
    callbacks: RwLock<HashMap<String, SignalCallback>>,
    transforms: RwLock<HashMap<String, SignalTransform>>,
    forwards: RwLock<HashMap<String, mpsc::Sender<SignalEvent>>>,
    store: Arc<ObservationStore>,
    metrics: Arc<MetricsCollector>,
    output_dir: PathBuf,
}

/// The router handle. Dispatch is non-blocking; processing happens on the
/// dedicated dispatcher task so action I/O never stalls the signal source.
pub struct SignalRouter {
    tx: mpsc::Sender<RouterMsg>,
    shared: Arc<RouterShared>,
}

impl SignalRouter {
    pub fn start(
        store: Arc<ObservationStore>,
        metrics: Arc<MetricsCollector>,
        output_dir: PathBuf,
        config: SignalCaptureConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let shared = Arc::new(RouterShared {
            config: RwLock::new(config),
            callbacks: RwLock::new(HashMap::new()),
            transforms: RwLock::new(HashMap::new()),
            forwards: RwLock::new(HashMap::new()),
            store,
            metrics,
            output_dir,
        });
        let router = Arc::new(Self {
            tx,
            shared: shared.clone(),
        });
        tokio::spawn(dispatcher_loop(rx, shared));
        router
    }

    /// Swap the active configuration.
    pub fn reload_config(&self, config: SignalCaptureConfig) {
        *self.shared.config.write() = config;
    }

    pub fn config_snapshot(&self) -> SignalCaptureConfig {
        self.shared.config.read().clone()
    }

    pub fn register_callback(&self, name: &str, callback: SignalCallback) {
        self.shared
            .callbacks
            .write()
            .insert(name.to_string(), callback);
    }

    pub fn unregister_callback(&self, name: &str) {
        self.shared.callbacks.write().remove(name);
    }

    pub fn register_transform(&self, name: &str, transform: SignalTransform) {
        self.shared
            .transforms
            .write()
            .insert(name.to_string(), transform);
    }

    /// Register a forward target; events matching a `forward` action for
    /// `target` are sent on the returned channel's sender side.
    pub fn register_forward(&self, target: &str, sender: mpsc::Sender<SignalEvent>) {
        self.shared
            .forwards
            .write()
            .insert(target.to_string(), sender);
    }

    /// Enqueue an event. Never blocks the caller; drops are accounted.
    pub fn dispatch(&self, event: SignalEvent) {
        match self.tx.try_send(RouterMsg::Event(event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(RouterMsg::Event(event))) => {
                self.shared.metrics.increment_counter("router.dropped.signal");
                if self.event_feeds_persistent_action(&event) {
                    // Store/callback drops are never silent.
                    self.shared
                        .metrics
                        .increment_counter("router.dropped.persistent");
                    warn!(
                        target: "bleep::signals",
                        path = %event.path,
                        "router queue full; dropped an event with persistent actions"
                    );
                }
            }
            Err(_) => {
                self.shared.metrics.increment_counter("router.dropped.signal");
            }
        }
    }

    fn event_feeds_persistent_action(&self, event: &SignalEvent) -> bool {
        let config = self.shared.config.read();
        config
            .routes
            .iter()
            .filter(|route| route.enabled && route.filter.matches(event))
            .any(|route| route.actions.iter().any(SignalAction::is_persistent))
    }

    /// Wait until every event enqueued before this call has been processed.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(RouterMsg::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

async fn dispatcher_loop(mut rx: mpsc::Receiver<RouterMsg>, shared: Arc<RouterShared>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            RouterMsg::Event(event) => process_event(&shared, event).await,
            RouterMsg::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!(target: "bleep::signals", "signal router dispatcher stopped");
}

async fn process_event(shared: &Arc<RouterShared>, event: SignalEvent) {
    let routes = {
        let config = shared.config.read();
        config
            .routes
            .iter()
            .filter(|route| route.enabled && route.filter.matches(&event))
            .cloned()
            .collect::<Vec<_>>()
    };
    for route in routes {
        // Transforms rewrite the event for the rest of this route only.
        let mut current = event.clone();
        for action in &route.actions {
            if let Err(err) = run_action(shared, action, &mut current).await {
                warn!(
                    target: "bleep::signals",
                    route = %route.name,
                    error = %err,
                    "action failed; continuing with remaining actions"
                );
            }
        }
    }
}

fn event_value_bytes(event: &SignalEvent) -> Option<Vec<u8>> {
    event.value.as_ref().and_then(IpcValue::to_byte_vec)
}

fn display_value(event: &SignalEvent) -> String {
    match &event.value {
        None => "-".to_string(),
        Some(IpcValue::Bytes(b)) => hex::encode(b),
        Some(IpcValue::Str(s)) => s.clone(),
        Some(other) => match other.to_byte_vec() {
            Some(bytes) => hex::encode(bytes),
            None => format!("{other:?}"),
        },
    }
}

async fn run_action(
    shared: &Arc<RouterShared>,
    action: &SignalAction,
    event: &mut SignalEvent,
) -> anyhow::Result<()> {
    match action {
        SignalAction::Log { level } => {
            let mut value = display_value(event);
            if value.len() > 100 {
                value.truncate(97);
                value.push_str("...");
            }
            match level.as_str() {
                "debug" => debug!(
                    target: "bleep::signals",
                    "[SIGNAL] {} on {}: {}",
                    event.signal_type.as_str(), event.path, value
                ),
                _ => info!(
                    target: "bleep::signals",
                    "[SIGNAL] {} on {}: {}",
                    event.signal_type.as_str(), event.path, value
                ),
            }
            Ok(())
        }
        SignalAction::Save { path, format } => save_event(shared, path, *format, event),
        SignalAction::Callback { name } => {
            let callback = shared.callbacks.read().get(name).cloned();
            match callback {
                Some(callback) => {
                    callback(event);
                    Ok(())
                }
                None => anyhow::bail!("no callback registered under '{name}'"),
            }
        }
        SignalAction::StoreInObservation => store_event(shared, event).await,
        SignalAction::Forward { target } => {
            let sender = shared.forwards.read().get(target).cloned();
            match sender {
                Some(sender) => {
                    if sender.try_send(event.clone()).is_err() {
                        shared.metrics.increment_counter("router.dropped.forward");
                    }
                    Ok(())
                }
                None => anyhow::bail!("no forward target registered under '{target}'"),
            }
        }
        SignalAction::Transform { name } => {
            let transform = shared.transforms.read().get(name).cloned();
            match transform {
                Some(transform) => {
                    *event = transform(event.clone());
                    Ok(())
                }
                None => anyhow::bail!("no transform registered under '{name}'"),
            }
        }
    }
}

fn save_event(
    shared: &Arc<RouterShared>,
    file: &str,
    format: SaveFormat,
    event: &SignalEvent,
) -> anyhow::Result<()> {
    use std::io::Write;

    std::fs::create_dir_all(&shared.output_dir)?;
    let path = shared.output_dir.join(file);
    let new_file = !path.exists();
    let mut handle = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    match format {
        SaveFormat::Csv => {
            if new_file {
                writeln!(
                    handle,
                    "timestamp,signal_type,path,interface,property_name,value,device_mac,service_uuid,char_uuid"
                )?;
            }
            writeln!(
                handle,
                "{},{},{},{},{},{},{},{},{}",
                event.timestamp_ms,
                event.signal_type.as_str(),
                event.path,
                event.interface.as_deref().unwrap_or(""),
                event.property_name.as_deref().unwrap_or(""),
                display_value(event),
                event.device_mac.as_deref().unwrap_or(""),
                event.service_uuid.as_deref().unwrap_or(""),
                event.char_uuid.as_deref().unwrap_or(""),
            )?;
        }
        SaveFormat::Json => {
            let record = serde_json::json!({
                "timestamp": event.timestamp_ms,
                "signal_type": event.signal_type.as_str(),
                "path": event.path,
                "interface": event.interface,
                "property_name": event.property_name,
                "value": event.value.as_ref().map(|_| display_value(event)),
                "device_mac": event.device_mac,
                "service_uuid": event.service_uuid,
                "char_uuid": event.char_uuid,
            });
            writeln!(handle, "{record}")?;
        }
    }
    Ok(())
}

async fn store_event(shared: &Arc<RouterShared>, event: &SignalEvent) -> anyhow::Result<()> {
    match event.signal_type {
        SignalType::Read | SignalType::Write | SignalType::Notification | SignalType::Indication => {
            let Some(mac) = event.device_mac.clone() else {
                debug!(target: "bleep::signals", path = %event.path, "store skipped: no device identity");
                return Ok(());
            };
            let Some(value) = event_value_bytes(event) else {
                return Ok(());
            };
            let source = match event.signal_type {
                SignalType::Read => HistorySource::Read,
                SignalType::Write => HistorySource::Write,
                _ => HistorySource::Notification,
            };
            let service_uuid = event
                .service_uuid
                .clone()
                .unwrap_or_else(|| "unknown-service".to_string());
            let char_uuid = event
                .char_uuid
                .clone()
                .unwrap_or_else(|| "unknown-characteristic".to_string());
            shared
                .store
                .insert_char_history(
                    &mac,
                    &service_uuid,
                    &char_uuid,
                    event.timestamp_ms,
                    &value,
                    source,
                )
                .await?;
            Ok(())
        }
        SignalType::PropertyChange => {
            if let (Some(mac), Some("Connected")) =
                (event.device_mac.clone(), event.property_name.as_deref())
            {
                shared.store.upsert_device(&mac, DeviceAttrs::default()).await?;
            }
            Ok(())
        }
        SignalType::Any => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::config::{default_config, SignalFilter, SignalRoute};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn test_router() -> (Arc<SignalRouter>, Arc<ObservationStore>, tempfile::TempDir) {
        let store = Arc::new(ObservationStore::open_in_memory().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        let router = SignalRouter::start(
            store.clone(),
            Arc::new(MetricsCollector::new()),
            dir.path().to_path_buf(),
            default_config(),
        );
        (router, store, dir)
    }

    fn read_event(mac: &str, value: Vec<u8>) -> SignalEvent {
        SignalEvent::new(SignalType::Read, "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_30")
            .with_identity(mac, "180f", "2a19")
            .with_value(IpcValue::Bytes(value))
    }

    #[tokio::test]
    async fn default_routes_store_reads() {
        let (router, store, _dir) = test_router().await;
        store
            .upsert_device("aa:bb:cc:dd:ee:30", DeviceAttrs::default())
            .await
            .unwrap();
        router.dispatch(read_event("aa:bb:cc:dd:ee:30", vec![0x64]));
        router.flush().await;
        let timeline = store
            .get_characteristic_timeline("aa:bb:cc:dd:ee:30", None, None, 10)
            .await
            .unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].source, "read");
        assert_eq!(timeline[0].value.as_deref(), Some(&[0x64u8][..]));
    }

    #[tokio::test]
    async fn failing_action_does_not_cancel_rest_of_route() {
        let (router, store, _dir) = test_router().await;
        store
            .upsert_device("aa:bb:cc:dd:ee:31", DeviceAttrs::default())
            .await
            .unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        router.register_callback(
            "count",
            Arc::new(move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let mut config = default_config();
        config.routes = vec![
            SignalRoute {
                name: "broken_then_working".to_string(),
                description: String::new(),
                enabled: true,
                filter: SignalFilter::default(),
                actions: vec![
                    SignalAction::Callback {
                        name: "missing".to_string(),
                    },
                    SignalAction::Callback {
                        name: "count".to_string(),
                    },
                ],
            },
            SignalRoute {
                name: "second_route_still_runs".to_string(),
                description: String::new(),
                enabled: true,
                filter: SignalFilter::default(),
                actions: vec![SignalAction::StoreInObservation],
            },
        ];
        router.reload_config(config);

        router.dispatch(read_event("aa:bb:cc:dd:ee:31", vec![0x01]));
        router.flush().await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let timeline = store
            .get_characteristic_timeline("aa:bb:cc:dd:ee:31", None, None, 10)
            .await
            .unwrap();
        assert_eq!(timeline.len(), 1);
    }

    #[tokio::test]
    async fn transform_rewrites_event_for_chained_actions() {
        let (router, store, _dir) = test_router().await;
        store
            .upsert_device("aa:bb:cc:dd:ee:32", DeviceAttrs::default())
            .await
            .unwrap();
        router.register_transform(
            "mask",
            Arc::new(|mut event| {
                event.value = Some(IpcValue::Bytes(vec![0xff]));
                event
            }),
        );
        let mut config = default_config();
        config.routes = vec![SignalRoute {
            name: "masked_store".to_string(),
            description: String::new(),
            enabled: true,
            filter: SignalFilter::default(),
            actions: vec![
                SignalAction::Transform {
                    name: "mask".to_string(),
                },
                SignalAction::StoreInObservation,
            ],
        }];
        router.reload_config(config);

        router.dispatch(read_event("aa:bb:cc:dd:ee:32", vec![0x11]));
        router.flush().await;
        let timeline = store
            .get_characteristic_timeline("aa:bb:cc:dd:ee:32", None, None, 10)
            .await
            .unwrap();
        assert_eq!(timeline[0].value.as_deref(), Some(&[0xffu8][..]));
    }

    #[tokio::test]
    async fn save_action_appends_csv_rows() {
        let (router, _store, dir) = test_router().await;
        let mut config = default_config();
        config.routes = vec![SignalRoute {
            name: "save_csv".to_string(),
            description: String::new(),
            enabled: true,
            filter: SignalFilter::default(),
            actions: vec![SignalAction::Save {
                path: "captured.csv".to_string(),
                format: SaveFormat::Csv,
            }],
        }];
        router.reload_config(config);

        router.dispatch(read_event("aa:bb:cc:dd:ee:33", vec![0xde, 0xad]));
        router.dispatch(read_event("aa:bb:cc:dd:ee:33", vec![0xbe, 0xef]));
        router.flush().await;

        let content = std::fs::read_to_string(dir.path().join("captured.csv")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3); // header + 2 rows
        assert!(lines[1].contains("dead"));
        assert!(lines[2].contains("beef"));
    }
}
