//! Evidence-based device-type classification.
//!
//! Stateless and mode-aware: collectors contribute weighted evidence from
//! the current device context only, the decision rule aggregates. Dual is
//! strict: it requires at least one conclusive Classic piece AND one
//! conclusive LE piece; a public LE address is never classifying evidence.

pub mod collectors;

pub use collectors::{default_collectors, ClassifyContext, EvidenceCollector};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use lib_observations::{DeviceType, EvidenceInput, EvidenceWeight};
use serde::Serialize;
use tracing::{debug, info};

use crate::context::Context;
use crate::modes::scan::ScanMode;

/// Classifying signal types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum EvidenceType {
    ClassicDeviceClass,
    ClassicSdpRecords,
    ClassicServiceUuids,
    LeAddressTypeRandom,
    LeAddressTypePublic,
    LeGattServices,
    LeServiceUuids,
    LeAdvertisingData,
}

impl EvidenceType {
    pub fn as_str(self) -> &'static str {
        match self {
            EvidenceType::ClassicDeviceClass => "classic_device_class",
            EvidenceType::ClassicSdpRecords => "classic_sdp_records",
            EvidenceType::ClassicServiceUuids => "classic_service_uuids",
            EvidenceType::LeAddressTypeRandom => "le_address_type_random",
            EvidenceType::LeAddressTypePublic => "le_address_type_public",
            EvidenceType::LeGattServices => "le_gatt_services",
            EvidenceType::LeServiceUuids => "le_service_uuids",
            EvidenceType::LeAdvertisingData => "le_advertising_data",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "classic_device_class" => EvidenceType::ClassicDeviceClass,
            "classic_sdp_records" => EvidenceType::ClassicSdpRecords,
            "classic_service_uuids" => EvidenceType::ClassicServiceUuids,
            "le_address_type_random" => EvidenceType::LeAddressTypeRandom,
            "le_address_type_public" => EvidenceType::LeAddressTypePublic,
            "le_gatt_services" => EvidenceType::LeGattServices,
            "le_service_uuids" => EvidenceType::LeServiceUuids,
            "le_advertising_data" => EvidenceType::LeAdvertisingData,
            _ => return None,
        })
    }

    pub fn is_classic(self) -> bool {
        matches!(
            self,
            EvidenceType::ClassicDeviceClass
                | EvidenceType::ClassicSdpRecords
                | EvidenceType::ClassicServiceUuids
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Evidence {
    pub evidence_type: EvidenceType,
    pub weight: EvidenceWeight,
    pub source: String,
    pub value: serde_json::Value,
}

/// Collected evidence for one classification run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvidenceSet {
    items: BTreeMap<EvidenceType, Vec<Evidence>>,
}

impl EvidenceSet {
    pub fn add(
        &mut self,
        evidence_type: EvidenceType,
        weight: EvidenceWeight,
        source: &str,
        value: serde_json::Value,
    ) {
        self.items.entry(evidence_type).or_default().push(Evidence {
            evidence_type,
            weight,
            source: source.to_string(),
            value,
        });
    }

    pub fn has(&self, evidence_type: EvidenceType, weight: EvidenceWeight) -> bool {
        self.items
            .get(&evidence_type)
            .map(|items| items.iter().any(|e| e.weight == weight))
            .unwrap_or(false)
    }

    pub fn types(&self) -> BTreeSet<EvidenceType> {
        self.items.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Evidence> {
        self.items.values().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn conclusive_classic(&self) -> Vec<EvidenceType> {
        [
            EvidenceType::ClassicDeviceClass,
            EvidenceType::ClassicSdpRecords,
        ]
        .into_iter()
        .filter(|t| self.has(*t, EvidenceWeight::Conclusive))
        .collect()
    }

    fn conclusive_le(&self) -> Vec<EvidenceType> {
        [EvidenceType::LeAddressTypeRandom]
            .into_iter()
            .filter(|t| self.has(*t, EvidenceWeight::Conclusive))
            .collect()
    }

    fn strong_le_count(&self) -> usize {
        [EvidenceType::LeGattServices, EvidenceType::LeServiceUuids]
            .into_iter()
            .filter(|t| self.has(*t, EvidenceWeight::Strong))
            .count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassificationResult {
    pub device_type: DeviceType,
    pub confidence: f64,
    pub reasoning: String,
    pub cited: Vec<EvidenceType>,
    pub cached: bool,
}

/// Apply the decision rule to an evidence set.
///
/// - `classic`: at least one conclusive Classic piece.
/// - `le`: at least one conclusive LE piece, or two or more strong LE
///   pieces.
/// - `dual`: conclusive Classic AND conclusive LE, independently.
/// - otherwise `unknown`. A lone public address type never classifies.
pub fn classify(evidence: &EvidenceSet) -> ClassificationResult {
    let conclusive_classic = evidence.conclusive_classic();
    let conclusive_le = evidence.conclusive_le();
    let strong_le = evidence.strong_le_count();

    let has_classic = !conclusive_classic.is_empty();
    let has_le = !conclusive_le.is_empty() || strong_le >= 2;

    let (device_type, mut cited) = if has_classic && !conclusive_le.is_empty() {
        let mut cited = conclusive_classic.clone();
        cited.extend(conclusive_le.iter().copied());
        (DeviceType::Dual, cited)
    } else if has_classic {
        (DeviceType::Classic, conclusive_classic.clone())
    } else if has_le {
        let mut cited = conclusive_le.clone();
        if conclusive_le.is_empty() {
            cited.extend([EvidenceType::LeGattServices, EvidenceType::LeServiceUuids]
                .into_iter()
                .filter(|t| evidence.has(*t, EvidenceWeight::Strong)));
        }
        (DeviceType::Le, cited)
    } else {
        (DeviceType::Unknown, Vec::new())
    };
    cited.sort();
    cited.dedup();

    let conclusive_count = evidence
        .iter()
        .filter(|e| e.weight == EvidenceWeight::Conclusive)
        .map(|e| e.evidence_type)
        .collect::<BTreeSet<_>>()
        .len();
    let strong_count = evidence
        .iter()
        .filter(|e| e.weight == EvidenceWeight::Strong)
        .map(|e| e.evidence_type)
        .collect::<BTreeSet<_>>()
        .len();
    let weak_count = evidence
        .iter()
        .filter(|e| e.weight == EvidenceWeight::Weak)
        .map(|e| e.evidence_type)
        .collect::<BTreeSet<_>>()
        .len();
    let confidence = if device_type == DeviceType::Unknown {
        0.0
    } else {
        (conclusive_count as f64 * 0.5 + strong_count as f64 * 0.3 + weak_count as f64 * 0.1)
            .min(1.0)
    };

    let reasoning = if cited.is_empty() {
        "not enough evidence to determine device type".to_string()
    } else {
        format!(
            "classified as {} based on: {}",
            device_type.as_str(),
            cited
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )
    };

    ClassificationResult {
        device_type,
        confidence,
        reasoning,
        cited,
        cached: false,
    }
}

/// Jaccard similarity over evidence-type sets, used by the cache check.
fn jaccard(a: &BTreeSet<EvidenceType>, b: &BTreeSet<EvidenceType>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

const CACHE_JACCARD_TOLERANCE: f64 = 0.8;

pub struct DeviceTypeClassifier {
    collectors: Vec<Arc<dyn EvidenceCollector>>,
}

impl Default for DeviceTypeClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTypeClassifier {
    pub fn new() -> Self {
        Self {
            collectors: default_collectors(),
        }
    }

    /// Extensibility point for additional collectors.
    pub fn register_collector(&mut self, collector: Arc<dyn EvidenceCollector>) {
        self.collectors.push(collector);
    }

    /// Collect evidence appropriate for the scan mode. Collection for one
    /// MAC is serialised on the per-device lock.
    pub async fn collect_evidence(
        &self,
        ctx: &Arc<Context>,
        mac: &str,
        context: &ClassifyContext,
        mode: ScanMode,
    ) -> EvidenceSet {
        let lock = ctx.device_lock(mac);
        let _guard = lock.lock().await;
        let mut evidence = EvidenceSet::default();
        for collector in &self.collectors {
            if !collector.supported_modes().contains(&mode) {
                continue;
            }
            collector.collect(mac, context, &mut evidence).await;
        }
        evidence
    }

    /// Classify with mode-aware collection and the signature cache.
    ///
    /// The cache is a performance hint only: a hit requires a non-unknown
    /// stored classification whose evidence-type set overlaps the candidate
    /// set with Jaccard ≥ 0.8; cached results are never themselves
    /// evidence.
    pub async fn classify_with_mode(
        &self,
        ctx: &Arc<Context>,
        mac: &str,
        context: &ClassifyContext,
        mode: ScanMode,
        use_cache: bool,
    ) -> ClassificationResult {
        if use_cache {
            if let Some(cached) = self.check_cache(ctx, mac, context, mode).await {
                return cached;
            }
        }

        let evidence = self.collect_evidence(ctx, mac, context, mode).await;
        let result = classify(&evidence);
        info!(
            target: "bleep::classify",
            mac,
            device_type = result.device_type.as_str(),
            confidence = result.confidence,
            "{}", result.reasoning
        );

        // Persist evidence for audit and future cache checks; failures are
        // logged, never fatal.
        for item in evidence.iter() {
            let input = EvidenceInput {
                evidence_type: item.evidence_type.as_str().to_string(),
                weight: item.weight,
                source: item.source.clone(),
                value: Some(item.value.clone()),
                metadata: None,
            };
            if let Err(err) = ctx.store.store_device_type_evidence(mac, &input).await {
                debug!(target: "bleep::classify", error = %err, "evidence persist failed");
            }
        }
        if result.device_type != DeviceType::Unknown {
            if let Err(err) = ctx
                .store
                .set_device_classification(mac, result.device_type)
                .await
            {
                debug!(target: "bleep::classify", error = %err, "classification cache write failed");
            }
        }
        result
    }

    async fn check_cache(
        &self,
        ctx: &Arc<Context>,
        mac: &str,
        context: &ClassifyContext,
        mode: ScanMode,
    ) -> Option<ClassificationResult> {
        let device = ctx.store.get_device(mac).await.ok()??;
        let stored_type = DeviceType::parse(&device.device_type);
        if stored_type == DeviceType::Unknown {
            return None;
        }
        let stored_rows = ctx.store.get_device_evidence(mac).await.ok()?;
        if stored_rows.is_empty() {
            return None;
        }
        let stored_types: BTreeSet<EvidenceType> = stored_rows
            .iter()
            .filter_map(|row| EvidenceType::parse(&row.evidence_type))
            .collect();
        let candidate_types = context.candidate_types(mode);
        let similarity = jaccard(&stored_types, &candidate_types);
        if similarity < CACHE_JACCARD_TOLERANCE {
            return None;
        }
        debug!(
            target: "bleep::classify",
            mac,
            similarity,
            "evidence signature match; serving cached classification"
        );
        Some(ClassificationResult {
            device_type: stored_type,
            confidence: 0.9,
            reasoning: format!("cached classification (signature overlap {similarity:.2})"),
            cited: stored_types.into_iter().collect(),
            cached: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(entries: &[(EvidenceType, EvidenceWeight)]) -> EvidenceSet {
        let mut evidence = EvidenceSet::default();
        for (t, w) in entries {
            evidence.add(*t, *w, "test", serde_json::Value::Null);
        }
        evidence
    }

    #[test]
    fn dual_requires_conclusive_on_both_sides() {
        let evidence = set(&[
            (EvidenceType::ClassicDeviceClass, EvidenceWeight::Conclusive),
            (EvidenceType::LeAddressTypeRandom, EvidenceWeight::Conclusive),
        ]);
        let result = classify(&evidence);
        assert_eq!(result.device_type, DeviceType::Dual);
        assert!(result.cited.contains(&EvidenceType::ClassicDeviceClass));
        assert!(result.cited.contains(&EvidenceType::LeAddressTypeRandom));
    }

    #[test]
    fn strong_only_evidence_never_yields_dual() {
        let evidence = set(&[
            (EvidenceType::ClassicServiceUuids, EvidenceWeight::Strong),
            (EvidenceType::LeGattServices, EvidenceWeight::Strong),
            (EvidenceType::LeServiceUuids, EvidenceWeight::Strong),
        ]);
        let result = classify(&evidence);
        assert_ne!(result.device_type, DeviceType::Dual);
        assert_eq!(result.device_type, DeviceType::Le);
    }

    #[test]
    fn two_strong_le_pieces_classify_le() {
        let evidence = set(&[
            (EvidenceType::LeGattServices, EvidenceWeight::Strong),
            (EvidenceType::LeServiceUuids, EvidenceWeight::Strong),
        ]);
        assert_eq!(classify(&evidence).device_type, DeviceType::Le);

        let one = set(&[(EvidenceType::LeGattServices, EvidenceWeight::Strong)]);
        assert_eq!(classify(&one).device_type, DeviceType::Unknown);
    }

    #[test]
    fn public_address_alone_is_inconclusive() {
        let evidence = set(&[(
            EvidenceType::LeAddressTypePublic,
            EvidenceWeight::Inconclusive,
        )]);
        let result = classify(&evidence);
        assert_eq!(result.device_type, DeviceType::Unknown);
        assert_eq!(result.confidence, 0.0);

        // Even combined with conclusive Classic, public never makes dual.
        let with_classic = set(&[
            (EvidenceType::LeAddressTypePublic, EvidenceWeight::Inconclusive),
            (EvidenceType::ClassicDeviceClass, EvidenceWeight::Conclusive),
        ]);
        assert_eq!(classify(&with_classic).device_type, DeviceType::Classic);
    }

    #[test]
    fn conclusive_classic_classifies_classic() {
        let evidence = set(&[(
            EvidenceType::ClassicSdpRecords,
            EvidenceWeight::Conclusive,
        )]);
        assert_eq!(classify(&evidence).device_type, DeviceType::Classic);
    }

    #[test]
    fn jaccard_tolerance_boundary() {
        let a: BTreeSet<_> = [
            EvidenceType::ClassicDeviceClass,
            EvidenceType::LeAddressTypeRandom,
            EvidenceType::LeServiceUuids,
            EvidenceType::LeAdvertisingData,
        ]
        .into_iter()
        .collect();
        let mut b = a.clone();
        assert_eq!(jaccard(&a, &b), 1.0);
        b.insert(EvidenceType::ClassicSdpRecords);
        assert!(jaccard(&a, &b) >= 0.8);
        b.remove(&EvidenceType::ClassicDeviceClass);
        b.remove(&EvidenceType::LeAddressTypeRandom);
        assert!(jaccard(&a, &b) < 0.8);
    }
}
