//! Mode orchestrators: scan tiers, connect-and-enumerate flows, CTF.

pub mod ctf;
pub mod enumerate;
pub mod scan;

pub use ctf::{extract_flag_candidate, run_ctf, CtfReport, FlagCandidate};
pub use enumerate::{
    brute_enum, connect_and_enumerate, naggy_enum, passive_enum, pokey_enum,
};
pub use scan::{scan_with_mode, ScanMode, ScanSummary};

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};

use crate::context::Context;

/// Write everything known about a device as a dated JSON result bundle
/// under the reports directory; returns the bundle path.
pub async fn save_device_report(ctx: &Arc<Context>, mac: &str) -> Result<PathBuf> {
    let export = ctx
        .store
        .export_device_data(mac)
        .await?
        .with_context(|| format!("{mac} has no observations to report"))?;
    let dir = ctx.config.reports_dir();
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!(
        "{}.json",
        mac.trim().to_ascii_lowercase().replace(':', "")
    ));
    std::fs::write(&path, serde_json::to_string_pretty(&export)?)?;
    tracing::info!(target: "bleep::modes", mac, path = %path.display(), "report bundle written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use lib_bus::mock::MockBus;
    use lib_observations::{DeviceAttrs, HistorySource};

    #[tokio::test]
    async fn report_bundle_lands_in_dated_directory() {
        let bus = Arc::new(MockBus::new());
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::start_in_memory(CoreConfig::rooted_at(dir.path()), bus)
            .await
            .unwrap();
        ctx.store
            .upsert_device("aa:bb:cc:dd:ee:c0", DeviceAttrs::default())
            .await
            .unwrap();
        ctx.store
            .insert_char_history("aa:bb:cc:dd:ee:c0", "180f", "2a19", 1, &[0x64], HistorySource::Read)
            .await
            .unwrap();

        let path = save_device_report(&ctx, "AA:BB:CC:DD:EE:C0").await.unwrap();
        assert!(path.exists());
        assert!(path.to_string_lossy().contains("reports"));
        let bundle: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(bundle["characteristic_history"][0]["value"], "64");
    }
}
