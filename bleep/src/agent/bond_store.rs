//! Persistent bond records.
//!
//! One file per MAC under the bonds directory. Key material is opaque to
//! the engine (the host daemon owns the real LTKs); records carry whatever
//! blob the embedding application supplies. Writes are atomic
//! (write-temp-then-rename) and access is serialised.

use std::path::PathBuf;

use chrono::Utc;
use lib_bus::AgentCapability;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BondRecord {
    pub mac: String,
    pub capability: String,
    /// Opaque long-term key material, hex-encoded on disk.
    #[serde(with = "hex_blob")]
    pub keys: Vec<u8>,
    pub created_at: i64,
    pub updated_at: i64,
}

mod hex_blob {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(&text).map_err(serde::de::Error::custom)
    }
}

impl BondRecord {
    pub fn new(mac: &str, capability: AgentCapability, keys: Vec<u8>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            mac: mac.to_ascii_lowercase(),
            capability: capability.wire_name().to_string(),
            keys,
            created_at: now,
            updated_at: now,
        }
    }
}

pub struct BondStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl BondStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            lock: Mutex::new(()),
        }
    }

    fn record_path(&self, mac: &str) -> PathBuf {
        self.dir
            .join(format!("{}.dat", mac.to_ascii_lowercase().replace(':', "_")))
    }

    pub async fn store(&self, record: &BondRecord) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        std::fs::create_dir_all(&self.dir)?;
        let path = self.record_path(&record.mac);

        // Preserve the original creation time on re-bond.
        let mut record = record.clone();
        if let Ok(existing) = std::fs::read_to_string(&path) {
            if let Ok(existing) = serde_json::from_str::<BondRecord>(&existing) {
                record.created_at = existing.created_at;
            }
        }
        record.updated_at = Utc::now().timestamp_millis();

        let tmp = path.with_extension("dat.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&record)?)?;
        std::fs::rename(&tmp, &path)?;
        tracing::debug!(target: "bleep::agent", mac = %record.mac, "bond record stored");
        Ok(())
    }

    pub async fn load(&self, mac: &str) -> Option<BondRecord> {
        let _guard = self.lock.lock().await;
        let raw = std::fs::read_to_string(self.record_path(mac)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub async fn list(&self) -> Vec<String> {
        let _guard = self.lock.lock().await;
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut macs: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                name.strip_suffix(".dat")
                    .map(|stem| stem.replace('_', ":"))
            })
            .collect();
        macs.sort();
        macs
    }

    pub async fn remove(&self, mac: &str) -> bool {
        let _guard = self.lock.lock().await;
        std::fs::remove_file(self.record_path(mac)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_load_round_trip_with_hex_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = BondStore::new(dir.path().to_path_buf());
        let record = BondRecord::new(
            "AA:BB:CC:DD:EE:90",
            AgentCapability::KeyboardDisplay,
            vec![0xde, 0xad, 0xbe, 0xef],
        );
        store.store(&record).await.unwrap();

        let loaded = store.load("aa:bb:cc:dd:ee:90").await.unwrap();
        assert_eq!(loaded.keys, vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(loaded.capability, "KeyboardDisplay");

        // On-disk blob is hex, not a byte array.
        let raw = std::fs::read_to_string(
            dir.path().join("aa_bb_cc_dd_ee_90.dat"),
        )
        .unwrap();
        assert!(raw.contains("deadbeef"));

        assert_eq!(store.list().await, vec!["aa:bb:cc:dd:ee:90".to_string()]);
        assert!(store.remove("aa:bb:cc:dd:ee:90").await);
        assert!(store.load("aa:bb:cc:dd:ee:90").await.is_none());
    }

    #[tokio::test]
    async fn rebond_preserves_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = BondStore::new(dir.path().to_path_buf());
        let first = BondRecord::new("aa:bb:cc:dd:ee:91", AgentCapability::DisplayYesNo, vec![1]);
        store.store(&first).await.unwrap();
        let stored_first = store.load("aa:bb:cc:dd:ee:91").await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = BondRecord::new("aa:bb:cc:dd:ee:91", AgentCapability::DisplayYesNo, vec![2]);
        store.store(&second).await.unwrap();
        let stored_second = store.load("aa:bb:cc:dd:ee:91").await.unwrap();

        assert_eq!(stored_first.created_at, stored_second.created_at);
        assert!(stored_second.updated_at >= stored_first.updated_at);
        assert_eq!(stored_second.keys, vec![2]);
    }

    #[tokio::test]
    async fn missing_directory_lists_empty() {
        let store = BondStore::new(PathBuf::from("/nonexistent/bleep-bonds"));
        assert!(store.list().await.is_empty());
        assert!(store.load("aa:bb:cc:dd:ee:92").await.is_none());
    }
}
