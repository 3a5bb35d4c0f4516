//! Evidence collectors.
//!
//! Each collector declares which scan modes it may run in; the costly ones
//! (SDP, GATT) stay out of passive. Collectors read the supplied context
//! snapshot only and never mutate device state.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use lib_observations::EvidenceWeight;

use crate::classify::{EvidenceSet, EvidenceType};
use crate::modes::scan::ScanMode;

/// Snapshot of current device context handed to the collectors. Built by
/// the orchestrators from live properties and the current pass's results;
/// never from history.
#[derive(Debug, Clone, Default)]
pub struct ClassifyContext {
    pub device_class: Option<u32>,
    pub address_type: Option<String>,
    pub uuids: Vec<String>,
    pub has_advertising_data: bool,
    pub connected: bool,
    /// GATT services resolved in the current pass.
    pub gatt_service_count: Option<usize>,
    /// SDP records discovered in the current pass.
    pub sdp_record_count: Option<usize>,
}

impl ClassifyContext {
    /// Evidence types this context could produce in `mode`; cheap
    /// prediction used for the cache signature comparison.
    pub fn candidate_types(&self, mode: ScanMode) -> BTreeSet<EvidenceType> {
        let mut types = BTreeSet::new();
        if self.device_class.is_some() {
            types.insert(EvidenceType::ClassicDeviceClass);
        }
        match self.address_type.as_deref() {
            Some("random") => {
                types.insert(EvidenceType::LeAddressTypeRandom);
            }
            Some("public") => {
                types.insert(EvidenceType::LeAddressTypePublic);
            }
            _ => {}
        }
        if self.uuids.iter().any(|u| lib_ref::is_classic_service_uuid(u)) {
            types.insert(EvidenceType::ClassicServiceUuids);
        }
        if self.uuids.iter().any(|u| lib_ref::is_gatt_service_uuid(u)) {
            types.insert(EvidenceType::LeServiceUuids);
        }
        if self.has_advertising_data && matches!(mode, ScanMode::Passive | ScanMode::Naggy) {
            types.insert(EvidenceType::LeAdvertisingData);
        }
        if self.gatt_service_count.unwrap_or(0) > 0 && mode != ScanMode::Passive {
            types.insert(EvidenceType::LeGattServices);
        }
        if self.sdp_record_count.unwrap_or(0) > 0
            && matches!(mode, ScanMode::Pokey | ScanMode::Brute)
        {
            types.insert(EvidenceType::ClassicSdpRecords);
        }
        types
    }
}

#[async_trait]
pub trait EvidenceCollector: Send + Sync {
    fn name(&self) -> &'static str;
    fn supported_modes(&self) -> &'static [ScanMode];
    async fn collect(&self, mac: &str, context: &ClassifyContext, evidence: &mut EvidenceSet);
}

const ALL_MODES: [ScanMode; 4] = [
    ScanMode::Passive,
    ScanMode::Naggy,
    ScanMode::Pokey,
    ScanMode::Brute,
];
const CONNECTED_MODES: [ScanMode; 3] = [ScanMode::Naggy, ScanMode::Pokey, ScanMode::Brute];
const AGGRESSIVE_MODES: [ScanMode; 2] = [ScanMode::Pokey, ScanMode::Brute];
const ADVERTISING_MODES: [ScanMode; 2] = [ScanMode::Passive, ScanMode::Naggy];

/// Device-class property: conclusive Classic.
pub struct ClassicDeviceClassCollector;

#[async_trait]
impl EvidenceCollector for ClassicDeviceClassCollector {
    fn name(&self) -> &'static str {
        "classic_device_class"
    }

    fn supported_modes(&self) -> &'static [ScanMode] {
        &ALL_MODES
    }

    async fn collect(&self, _mac: &str, context: &ClassifyContext, evidence: &mut EvidenceSet) {
        if let Some(class) = context.device_class {
            evidence.add(
                EvidenceType::ClassicDeviceClass,
                EvidenceWeight::Conclusive,
                "bus_property",
                serde_json::json!(class),
            );
        }
    }
}

/// SDP record presence: conclusive Classic; aggressive modes only.
pub struct ClassicSdpRecordsCollector;

#[async_trait]
impl EvidenceCollector for ClassicSdpRecordsCollector {
    fn name(&self) -> &'static str {
        "classic_sdp_records"
    }

    fn supported_modes(&self) -> &'static [ScanMode] {
        &AGGRESSIVE_MODES
    }

    async fn collect(&self, _mac: &str, context: &ClassifyContext, evidence: &mut EvidenceSet) {
        if context.sdp_record_count.unwrap_or(0) > 0 {
            evidence.add(
                EvidenceType::ClassicSdpRecords,
                EvidenceWeight::Conclusive,
                "sdp_query",
                serde_json::json!(context.sdp_record_count),
            );
        }
    }
}

/// Classic profile UUIDs in the UUIDs property: strong Classic.
pub struct ClassicServiceUuidsCollector;

#[async_trait]
impl EvidenceCollector for ClassicServiceUuidsCollector {
    fn name(&self) -> &'static str {
        "classic_service_uuids"
    }

    fn supported_modes(&self) -> &'static [ScanMode] {
        &ALL_MODES
    }

    async fn collect(&self, _mac: &str, context: &ClassifyContext, evidence: &mut EvidenceSet) {
        let classic: Vec<&String> = context
            .uuids
            .iter()
            .filter(|uuid| lib_ref::is_classic_service_uuid(uuid))
            .collect();
        if !classic.is_empty() {
            evidence.add(
                EvidenceType::ClassicServiceUuids,
                EvidenceWeight::Strong,
                "bus_property",
                serde_json::json!(classic),
            );
        }
    }
}

/// Address type: random is conclusive LE; public is recorded but
/// inconclusive and never classifies.
pub struct LeAddressTypeCollector;

#[async_trait]
impl EvidenceCollector for LeAddressTypeCollector {
    fn name(&self) -> &'static str {
        "le_address_type"
    }

    fn supported_modes(&self) -> &'static [ScanMode] {
        &ALL_MODES
    }

    async fn collect(&self, _mac: &str, context: &ClassifyContext, evidence: &mut EvidenceSet) {
        match context.address_type.as_deref() {
            Some("random") => evidence.add(
                EvidenceType::LeAddressTypeRandom,
                EvidenceWeight::Conclusive,
                "bus_property",
                serde_json::json!("random"),
            ),
            Some("public") => evidence.add(
                EvidenceType::LeAddressTypePublic,
                EvidenceWeight::Inconclusive,
                "bus_property",
                serde_json::json!("public"),
            ),
            _ => {}
        }
    }
}

/// Resolved GATT services: strong LE; needs a connection.
pub struct LeGattServicesCollector;

#[async_trait]
impl EvidenceCollector for LeGattServicesCollector {
    fn name(&self) -> &'static str {
        "le_gatt_services"
    }

    fn supported_modes(&self) -> &'static [ScanMode] {
        &CONNECTED_MODES
    }

    async fn collect(&self, _mac: &str, context: &ClassifyContext, evidence: &mut EvidenceSet) {
        if !context.connected {
            return;
        }
        if context.gatt_service_count.unwrap_or(0) > 0 {
            evidence.add(
                EvidenceType::LeGattServices,
                EvidenceWeight::Strong,
                "gatt_enumeration",
                serde_json::json!(context.gatt_service_count),
            );
        }
    }
}

/// GATT service UUIDs in the UUIDs property: strong LE.
pub struct LeServiceUuidsCollector;

#[async_trait]
impl EvidenceCollector for LeServiceUuidsCollector {
    fn name(&self) -> &'static str {
        "le_service_uuids"
    }

    fn supported_modes(&self) -> &'static [ScanMode] {
        &ALL_MODES
    }

    async fn collect(&self, _mac: &str, context: &ClassifyContext, evidence: &mut EvidenceSet) {
        let gatt: Vec<&String> = context
            .uuids
            .iter()
            .filter(|uuid| lib_ref::is_gatt_service_uuid(uuid))
            .collect();
        if !gatt.is_empty() {
            evidence.add(
                EvidenceType::LeServiceUuids,
                EvidenceWeight::Strong,
                "bus_property",
                serde_json::json!(gatt),
            );
        }
    }
}

/// Advertising payload presence: weak LE, scan modes only.
pub struct LeAdvertisingDataCollector;

#[async_trait]
impl EvidenceCollector for LeAdvertisingDataCollector {
    fn name(&self) -> &'static str {
        "le_advertising_data"
    }

    fn supported_modes(&self) -> &'static [ScanMode] {
        &ADVERTISING_MODES
    }

    async fn collect(&self, _mac: &str, context: &ClassifyContext, evidence: &mut EvidenceSet) {
        if context.has_advertising_data {
            evidence.add(
                EvidenceType::LeAdvertisingData,
                EvidenceWeight::Weak,
                "bus_property",
                serde_json::json!(true),
            );
        }
    }
}

pub fn default_collectors() -> Vec<Arc<dyn EvidenceCollector>> {
    vec![
        Arc::new(ClassicDeviceClassCollector),
        Arc::new(ClassicSdpRecordsCollector),
        Arc::new(ClassicServiceUuidsCollector),
        Arc::new(LeAddressTypeCollector),
        Arc::new(LeGattServicesCollector),
        Arc::new(LeServiceUuidsCollector),
        Arc::new(LeAdvertisingDataCollector),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_collect(context: &ClassifyContext, mode: ScanMode) -> EvidenceSet {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(async {
            let mut evidence = EvidenceSet::default();
            for collector in default_collectors() {
                if collector.supported_modes().contains(&mode) {
                    collector.collect("aa:bb:cc:dd:ee:ff", context, &mut evidence).await;
                }
            }
            evidence
        })
    }

    #[test]
    fn passive_mode_skips_expensive_collectors() {
        let context = ClassifyContext {
            sdp_record_count: Some(3),
            gatt_service_count: Some(2),
            connected: true,
            ..Default::default()
        };
        let evidence = run_collect(&context, ScanMode::Passive);
        assert!(!evidence.has(EvidenceType::ClassicSdpRecords, EvidenceWeight::Conclusive));
        assert!(!evidence.has(EvidenceType::LeGattServices, EvidenceWeight::Strong));

        let evidence = run_collect(&context, ScanMode::Pokey);
        assert!(evidence.has(EvidenceType::ClassicSdpRecords, EvidenceWeight::Conclusive));
        assert!(evidence.has(EvidenceType::LeGattServices, EvidenceWeight::Strong));
    }

    #[test]
    fn uuid_collectors_split_classic_and_gatt() {
        let context = ClassifyContext {
            uuids: vec![
                "0000110b-0000-1000-8000-00805f9b34fb".to_string(),
                "00001800-0000-1000-8000-00805f9b34fb".to_string(),
            ],
            ..Default::default()
        };
        let evidence = run_collect(&context, ScanMode::Passive);
        assert!(evidence.has(EvidenceType::ClassicServiceUuids, EvidenceWeight::Strong));
        assert!(evidence.has(EvidenceType::LeServiceUuids, EvidenceWeight::Strong));
    }

    #[test]
    fn address_type_weights() {
        let random = ClassifyContext {
            address_type: Some("random".to_string()),
            ..Default::default()
        };
        let evidence = run_collect(&random, ScanMode::Passive);
        assert!(evidence.has(EvidenceType::LeAddressTypeRandom, EvidenceWeight::Conclusive));

        let public = ClassifyContext {
            address_type: Some("public".to_string()),
            ..Default::default()
        };
        let evidence = run_collect(&public, ScanMode::Passive);
        assert!(evidence.has(EvidenceType::LeAddressTypePublic, EvidenceWeight::Inconclusive));
        assert!(!evidence.has(EvidenceType::LeAddressTypePublic, EvidenceWeight::Conclusive));
    }
}
