//! Observation store over embedded SQLite.
//!
//! Single store for everything the engine observes: devices, advertisement
//! reports, GATT trees, characteristic history, classic service records,
//! PBAP metadata, classification evidence and AoI snapshots.
//!
//! # Features
//!
//! - WAL journal, connection pool via sqlx
//! - Linear, forward-only schema migrations (current v6), idempotent under
//!   retry
//! - Single-writer discipline: every write batch holds a short-lived mutex
//! - Write failures surface as typed errors but must never abort the
//!   enclosing enumeration pass (callers log and continue)

use std::path::Path;
use std::str::FromStr;

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::rows::*;

/// Current schema version.
pub const SCHEMA_VERSION: i64 = 6;

/// The store handle. Cheap to clone behind an `Arc` by callers.
pub struct ObservationStore {
    pool: SqlitePool,
    writer: Mutex<()>,
}

pub(crate) fn normalize_mac(mac: &str) -> String {
    mac.trim().to_ascii_lowercase()
}

pub(crate) fn normalize_uuid_key(uuid: &str) -> String {
    uuid.trim().to_ascii_lowercase()
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl ObservationStore {
    /// Open or create the store at `path`, running migrations.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::InvalidInput(format!("create {parent:?}: {e}")))?;
            }
        }
        info!(target: "bleep::db", path = %path.display(), "opening observation store");
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(StoreError::Database)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self {
            pool,
            writer: Mutex::new(()),
        };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::Database)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self {
            pool,
            writer: Mutex::new(()),
        };
        store.migrate().await?;
        Ok(store)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ========================================================================
    // Schema migrations
    // ========================================================================

    pub async fn schema_version(&self) -> StoreResult<i64> {
        sqlx::query_scalar::<_, i64>("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map(|v| v.unwrap_or(0))
            .map_err(StoreError::Database)
    }

    async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
        )
        .execute(&self.pool)
        .await?;

        let mut version = self.schema_version().await?;
        if version > SCHEMA_VERSION {
            return Err(StoreError::SchemaMismatch {
                found: version,
                supported: SCHEMA_VERSION,
            });
        }
        while version < SCHEMA_VERSION {
            let next = version + 1;
            debug!(target: "bleep::db", from = version, to = next, "running migration");
            self.apply_migration(next)
                .await
                .map_err(|e| StoreError::MigrationFailed {
                    version: next,
                    reason: e.to_string(),
                })?;
            sqlx::query("DELETE FROM schema_version")
                .execute(&self.pool)
                .await?;
            sqlx::query("INSERT INTO schema_version(version) VALUES (?)")
                .bind(next)
                .execute(&self.pool)
                .await?;
            version = next;
        }
        Ok(())
    }

    async fn apply_migration(&self, version: i64) -> Result<(), sqlx::Error> {
        let sql = match version {
            1 => {
                r#"
CREATE TABLE IF NOT EXISTS devices (
    mac TEXT PRIMARY KEY,
    addr_type TEXT,
    name TEXT,
    appearance INTEGER,
    device_class INTEGER,
    manufacturer_id INTEGER,
    manufacturer_data BLOB,
    rssi_last INTEGER,
    rssi_min INTEGER,
    rssi_max INTEGER,
    first_seen INTEGER NOT NULL,
    last_seen INTEGER NOT NULL,
    notes TEXT
);

CREATE TABLE IF NOT EXISTS adv_reports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mac TEXT NOT NULL REFERENCES devices(mac) ON DELETE CASCADE,
    ts INTEGER NOT NULL,
    rssi INTEGER,
    data BLOB,
    decoded TEXT
);

CREATE TABLE IF NOT EXISTS services (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mac TEXT NOT NULL REFERENCES devices(mac) ON DELETE CASCADE,
    uuid TEXT NOT NULL,
    handle_start INTEGER,
    handle_end INTEGER,
    name TEXT,
    first_seen INTEGER NOT NULL,
    last_seen INTEGER NOT NULL,
    UNIQUE(mac, uuid)
);

CREATE TABLE IF NOT EXISTS characteristics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    service_id INTEGER NOT NULL REFERENCES services(id) ON DELETE CASCADE,
    uuid TEXT NOT NULL,
    handle INTEGER,
    properties TEXT,
    value BLOB,
    last_read INTEGER,
    permission_map TEXT,
    UNIQUE(service_id, uuid)
);
"#
            }
            2 => {
                r#"
CREATE TABLE IF NOT EXISTS char_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mac TEXT NOT NULL REFERENCES devices(mac) ON DELETE CASCADE,
    service_uuid TEXT NOT NULL,
    char_uuid TEXT NOT NULL,
    ts INTEGER NOT NULL,
    value BLOB,
    source TEXT NOT NULL DEFAULT 'unknown'
);

CREATE TABLE IF NOT EXISTS classic_services (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mac TEXT NOT NULL REFERENCES devices(mac) ON DELETE CASCADE,
    uuid TEXT NOT NULL,
    channel INTEGER,
    name TEXT,
    handle INTEGER,
    profiles TEXT,
    version INTEGER,
    description TEXT,
    ts INTEGER NOT NULL,
    UNIQUE(mac, uuid, channel)
);
"#
            }
            3 => {
                // ALTER TABLE is not idempotent on its own; guard on the
                // column being absent.
                let columns: Vec<String> = sqlx::query("PRAGMA table_info(devices)")
                    .fetch_all(&self.pool)
                    .await?
                    .into_iter()
                    .map(|row| row.get::<String, _>("name"))
                    .collect();
                if !columns.iter().any(|c| c == "device_type") {
                    sqlx::raw_sql(
                        "ALTER TABLE devices ADD COLUMN device_type TEXT NOT NULL DEFAULT 'unknown'",
                    )
                    .execute(&self.pool)
                    .await?;
                }
                return Ok(());
            }
            4 => {
                r#"
CREATE TABLE IF NOT EXISTS aoi_analysis (
    mac TEXT PRIMARY KEY REFERENCES devices(mac) ON DELETE CASCADE,
    analysis_timestamp INTEGER NOT NULL,
    security_concerns TEXT,
    unusual_characteristics TEXT,
    notable_services TEXT,
    recommendations TEXT
);

CREATE TABLE IF NOT EXISTS pbap_metadata (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mac TEXT NOT NULL REFERENCES devices(mac) ON DELETE CASCADE,
    repo TEXT NOT NULL,
    entries INTEGER NOT NULL,
    hash TEXT NOT NULL,
    ts INTEGER NOT NULL,
    UNIQUE(mac, repo)
);
"#
            }
            5 => {
                r#"
CREATE INDEX IF NOT EXISTS idx_devices_device_type ON devices(device_type);
CREATE INDEX IF NOT EXISTS idx_devices_last_seen ON devices(last_seen);
CREATE INDEX IF NOT EXISTS idx_adv_reports_mac ON adv_reports(mac);
CREATE INDEX IF NOT EXISTS idx_adv_reports_ts ON adv_reports(ts);
CREATE INDEX IF NOT EXISTS idx_char_history_mac_service_char ON char_history(mac, service_uuid, char_uuid);
CREATE INDEX IF NOT EXISTS idx_char_history_ts ON char_history(ts);
CREATE INDEX IF NOT EXISTS idx_char_history_source ON char_history(source);
"#
            }
            6 => {
                r#"
CREATE TABLE IF NOT EXISTS device_type_evidence (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mac TEXT NOT NULL REFERENCES devices(mac) ON DELETE CASCADE,
    evidence_type TEXT NOT NULL,
    weight TEXT NOT NULL,
    source TEXT NOT NULL,
    value TEXT,
    metadata TEXT,
    ts INTEGER NOT NULL,
    UNIQUE(mac, evidence_type, source)
);

CREATE TABLE IF NOT EXISTS descriptors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    characteristic_id INTEGER NOT NULL REFERENCES characteristics(id) ON DELETE CASCADE,
    uuid TEXT NOT NULL,
    value BLOB,
    ts INTEGER NOT NULL,
    UNIQUE(characteristic_id, uuid)
);
"#
            }
            other => {
                return Err(sqlx::Error::Protocol(format!(
                    "no migration defined for v{other}"
                )))
            }
        };
        sqlx::raw_sql(sql).execute(&self.pool).await?;
        Ok(())
    }

    // ========================================================================
    // Device writes
    // ========================================================================

    /// Insert or update a device row.
    ///
    /// `first_seen` is set only for new rows; `last_seen` only ever
    /// advances; RSSI extrema are folded in; the cached classification is
    /// replaced only by a strictly stronger one.
    pub async fn upsert_device(&self, mac: &str, attrs: DeviceAttrs) -> StoreResult<()> {
        let mac = normalize_mac(mac);
        if mac.is_empty() {
            return Err(StoreError::InvalidInput("empty MAC".into()));
        }
        let now = now_ms();
        let _guard = self.writer.lock().await;

        let existing = sqlx::query_as::<_, DeviceRow>("SELECT * FROM devices WHERE mac = ?")
            .bind(&mac)
            .fetch_optional(&self.pool)
            .await?;

        match existing {
            None => {
                let device_type = attrs.device_type.unwrap_or(DeviceType::Unknown);
                sqlx::query(
                    r#"
                    INSERT INTO devices
                        (mac, addr_type, name, appearance, device_class, manufacturer_id,
                         manufacturer_data, rssi_last, rssi_min, rssi_max,
                         first_seen, last_seen, notes, device_type)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&mac)
                .bind(&attrs.addr_type)
                .bind(&attrs.name)
                .bind(attrs.appearance)
                .bind(attrs.device_class)
                .bind(attrs.manufacturer_id)
                .bind(&attrs.manufacturer_data)
                .bind(attrs.rssi)
                .bind(attrs.rssi)
                .bind(attrs.rssi)
                .bind(now)
                .bind(now)
                .bind(&attrs.notes)
                .bind(device_type.as_str())
                .execute(&self.pool)
                .await?;
            }
            Some(row) => {
                let current_type = DeviceType::parse(&row.device_type);
                let device_type = match attrs.device_type {
                    Some(new_type) if new_type.rank() > current_type.rank() => new_type,
                    _ => current_type,
                };
                let rssi_last = attrs.rssi.or(row.rssi_last);
                let rssi_min = match (attrs.rssi, row.rssi_min) {
                    (Some(new), Some(old)) => Some(new.min(old)),
                    (Some(new), None) => Some(new),
                    (None, old) => old,
                };
                let rssi_max = match (attrs.rssi, row.rssi_max) {
                    (Some(new), Some(old)) => Some(new.max(old)),
                    (Some(new), None) => Some(new),
                    (None, old) => old,
                };
                sqlx::query(
                    r#"
                    UPDATE devices SET
                        addr_type = COALESCE(?, addr_type),
                        name = COALESCE(?, name),
                        appearance = COALESCE(?, appearance),
                        device_class = COALESCE(?, device_class),
                        manufacturer_id = COALESCE(?, manufacturer_id),
                        manufacturer_data = COALESCE(?, manufacturer_data),
                        rssi_last = ?,
                        rssi_min = ?,
                        rssi_max = ?,
                        last_seen = MAX(last_seen, ?),
                        notes = COALESCE(?, notes),
                        device_type = ?
                    WHERE mac = ?
                    "#,
                )
                .bind(&attrs.addr_type)
                .bind(&attrs.name)
                .bind(attrs.appearance)
                .bind(attrs.device_class)
                .bind(attrs.manufacturer_id)
                .bind(&attrs.manufacturer_data)
                .bind(rssi_last)
                .bind(rssi_min)
                .bind(rssi_max)
                .bind(now)
                .bind(&attrs.notes)
                .bind(device_type.as_str())
                .bind(&mac)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Replace the cached classification if and only if it is stronger.
    pub async fn set_device_classification(
        &self,
        mac: &str,
        classification: DeviceType,
    ) -> StoreResult<()> {
        self.upsert_device(
            mac,
            DeviceAttrs {
                device_type: Some(classification),
                ..Default::default()
            },
        )
        .await
    }

    /// A device row is created on first observation; child-table writers
    /// call this so a late-arriving observation never trips the foreign
    /// key. Caller holds the writer lock.
    async fn ensure_device(&self, mac: &str, ts: i64) -> StoreResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO devices(mac, first_seen, last_seen, device_type) VALUES (?, ?, ?, 'unknown')",
        )
        .bind(mac)
        .bind(ts)
        .bind(ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append one advertisement report.
    pub async fn insert_adv(
        &self,
        mac: &str,
        ts: i64,
        rssi: Option<i64>,
        raw: &[u8],
        decoded: &serde_json::Value,
    ) -> StoreResult<()> {
        let mac = normalize_mac(mac);
        let _guard = self.writer.lock().await;
        self.ensure_device(&mac, ts).await?;
        sqlx::query("INSERT INTO adv_reports(mac, ts, rssi, data, decoded) VALUES (?, ?, ?, ?, ?)")
            .bind(&mac)
            .bind(ts)
            .bind(rssi)
            .bind(raw)
            .bind(decoded.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // GATT writes
    // ========================================================================

    /// Upsert services for a device; returns uuid -> row id.
    ///
    /// UUID keys reconcile case-insensitively against stored rows.
    pub async fn upsert_services(
        &self,
        mac: &str,
        services: &[ServiceInput],
    ) -> StoreResult<std::collections::HashMap<String, i64>> {
        let mac = normalize_mac(mac);
        let now = now_ms();
        let mut ids = std::collections::HashMap::new();
        let _guard = self.writer.lock().await;
        self.ensure_device(&mac, now).await?;
        for service in services {
            let uuid = normalize_uuid_key(&service.uuid);
            sqlx::query(
                r#"
                INSERT INTO services(mac, uuid, handle_start, handle_end, name, first_seen, last_seen)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(mac, uuid) DO UPDATE SET
                    handle_start = COALESCE(excluded.handle_start, handle_start),
                    handle_end = COALESCE(excluded.handle_end, handle_end),
                    name = COALESCE(excluded.name, name),
                    last_seen = excluded.last_seen
                "#,
            )
            .bind(&mac)
            .bind(&uuid)
            .bind(service.handle_start.as_ref().and_then(HandleInput::to_int))
            .bind(service.handle_end.as_ref().and_then(HandleInput::to_int))
            .bind(&service.name)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
            let id: i64 =
                sqlx::query_scalar("SELECT id FROM services WHERE mac = ? AND uuid = ?")
                    .bind(&mac)
                    .bind(&uuid)
                    .fetch_one(&self.pool)
                    .await?;
            ids.insert(uuid, id);
        }
        Ok(ids)
    }

    /// Upsert characteristics under one service row. A failure on one
    /// characteristic is logged and does not abort the batch.
    pub async fn upsert_characteristics(
        &self,
        service_id: i64,
        characteristics: &[CharacteristicInput],
    ) -> StoreResult<usize> {
        let now = now_ms();
        let mut written = 0;
        let _guard = self.writer.lock().await;
        for chr in characteristics {
            let uuid = normalize_uuid_key(&chr.uuid);
            let properties = if chr.properties.is_empty() {
                None
            } else {
                Some(chr.properties.join(","))
            };
            let permission_map = chr.permission_map.as_ref().map(|v| v.to_string());
            let result = sqlx::query(
                r#"
                INSERT INTO characteristics(service_id, uuid, handle, properties, value, last_read, permission_map)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(service_id, uuid) DO UPDATE SET
                    handle = COALESCE(excluded.handle, handle),
                    properties = COALESCE(excluded.properties, properties),
                    value = COALESCE(excluded.value, value),
                    last_read = CASE WHEN excluded.value IS NULL THEN last_read ELSE excluded.last_read END,
                    permission_map = COALESCE(excluded.permission_map, permission_map)
                "#,
            )
            .bind(service_id)
            .bind(&uuid)
            .bind(chr.handle.as_ref().and_then(HandleInput::to_int))
            .bind(&properties)
            .bind(&chr.value)
            .bind(chr.value.as_ref().map(|_| now))
            .bind(&permission_map)
            .execute(&self.pool)
            .await;
            match result {
                Ok(_) => written += 1,
                Err(e) => {
                    warn!(target: "bleep::db", uuid = %uuid, error = %e, "characteristic upsert failed");
                }
            }
        }
        Ok(written)
    }

    pub async fn upsert_descriptors(
        &self,
        characteristic_id: i64,
        descriptors: &[DescriptorInput],
    ) -> StoreResult<()> {
        let now = now_ms();
        let _guard = self.writer.lock().await;
        for desc in descriptors {
            sqlx::query(
                r#"
                INSERT INTO descriptors(characteristic_id, uuid, value, ts)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(characteristic_id, uuid) DO UPDATE SET
                    value = COALESCE(excluded.value, value),
                    ts = excluded.ts
                "#,
            )
            .bind(characteristic_id)
            .bind(normalize_uuid_key(&desc.uuid))
            .bind(&desc.value)
            .bind(now)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Append one characteristic history row. History is append-only; rows
    /// are never updated or deleted by the engine.
    pub async fn insert_char_history(
        &self,
        mac: &str,
        service_uuid: &str,
        char_uuid: &str,
        ts: i64,
        value: &[u8],
        source: HistorySource,
    ) -> StoreResult<i64> {
        let mac = normalize_mac(mac);
        let _guard = self.writer.lock().await;
        self.ensure_device(&mac, ts).await?;
        let result = sqlx::query(
            "INSERT INTO char_history(mac, service_uuid, char_uuid, ts, value, source) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&mac)
        .bind(normalize_uuid_key(service_uuid))
        .bind(normalize_uuid_key(char_uuid))
        .bind(ts)
        .bind(value)
        .bind(source.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    // ========================================================================
    // Classic writes
    // ========================================================================

    pub async fn upsert_classic_services(
        &self,
        mac: &str,
        services: &[ClassicServiceInput],
    ) -> StoreResult<()> {
        let mac = normalize_mac(mac);
        let now = now_ms();
        let _guard = self.writer.lock().await;
        self.ensure_device(&mac, now).await?;
        for service in services {
            let profiles = if service.profiles.is_empty() {
                None
            } else {
                serde_json::to_string(&service.profiles).ok()
            };
            sqlx::query(
                r#"
                INSERT INTO classic_services(mac, uuid, channel, name, handle, profiles, version, description, ts)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(mac, uuid, channel) DO UPDATE SET
                    name = COALESCE(excluded.name, name),
                    handle = COALESCE(excluded.handle, handle),
                    profiles = COALESCE(excluded.profiles, profiles),
                    version = COALESCE(excluded.version, version),
                    description = COALESCE(excluded.description, description),
                    ts = excluded.ts
                "#,
            )
            .bind(&mac)
            .bind(normalize_uuid_key(&service.uuid))
            .bind(service.channel)
            .bind(&service.name)
            .bind(service.handle)
            .bind(&profiles)
            .bind(service.version)
            .bind(&service.description)
            .bind(now)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn upsert_pbap_metadata(
        &self,
        mac: &str,
        repo: &str,
        entries: i64,
        hash: &str,
    ) -> StoreResult<()> {
        let mac = normalize_mac(mac);
        let _guard = self.writer.lock().await;
        self.ensure_device(&mac, now_ms()).await?;
        sqlx::query(
            r#"
            INSERT INTO pbap_metadata(mac, repo, entries, hash, ts)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(mac, repo) DO UPDATE SET
                entries = excluded.entries,
                hash = excluded.hash,
                ts = excluded.ts
            "#,
        )
        .bind(&mac)
        .bind(repo)
        .bind(entries)
        .bind(hash)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Evidence
    // ========================================================================

    /// Upsert one evidence item keyed by (mac, type, source).
    pub async fn store_device_type_evidence(
        &self,
        mac: &str,
        evidence: &EvidenceInput,
    ) -> StoreResult<()> {
        let mac = normalize_mac(mac);
        let _guard = self.writer.lock().await;
        self.ensure_device(&mac, now_ms()).await?;
        sqlx::query(
            r#"
            INSERT INTO device_type_evidence(mac, evidence_type, weight, source, value, metadata, ts)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(mac, evidence_type, source) DO UPDATE SET
                weight = excluded.weight,
                value = excluded.value,
                metadata = excluded.metadata,
                ts = excluded.ts
            "#,
        )
        .bind(&mac)
        .bind(&evidence.evidence_type)
        .bind(evidence.weight.as_str())
        .bind(&evidence.source)
        .bind(evidence.value.as_ref().map(|v| v.to_string()))
        .bind(evidence.metadata.as_ref().map(|v| v.to_string()))
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_device_evidence(&self, mac: &str) -> StoreResult<Vec<EvidenceRow>> {
        let rows = sqlx::query_as::<_, EvidenceRow>(
            "SELECT * FROM device_type_evidence WHERE mac = ? ORDER BY evidence_type, source",
        )
        .bind(normalize_mac(mac))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Stable hash of the current evidence set, for classifier cache keying.
    pub async fn get_device_evidence_signature(&self, mac: &str) -> StoreResult<Option<String>> {
        let rows = self.get_device_evidence(mac).await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let mut hasher = Sha256::new();
        for row in &rows {
            hasher.update(row.evidence_type.as_bytes());
            hasher.update(b"|");
            hasher.update(row.source.as_bytes());
            hasher.update(b"|");
            hasher.update(row.weight.as_bytes());
            hasher.update(b"|");
            if let Some(value) = &row.value {
                hasher.update(value.as_bytes());
            }
            hasher.update(b"\n");
        }
        Ok(Some(hex::encode(hasher.finalize())))
    }

    // ========================================================================
    // AoI
    // ========================================================================

    pub async fn store_aoi_analysis(
        &self,
        mac: &str,
        security_concerns: &serde_json::Value,
        unusual_characteristics: &serde_json::Value,
        notable_services: &serde_json::Value,
        recommendations: &serde_json::Value,
    ) -> StoreResult<()> {
        let mac = normalize_mac(mac);
        let _guard = self.writer.lock().await;
        self.ensure_device(&mac, now_ms()).await?;
        sqlx::query(
            r#"
            INSERT INTO aoi_analysis(mac, analysis_timestamp, security_concerns,
                                     unusual_characteristics, notable_services, recommendations)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(mac) DO UPDATE SET
                analysis_timestamp = excluded.analysis_timestamp,
                security_concerns = excluded.security_concerns,
                unusual_characteristics = excluded.unusual_characteristics,
                notable_services = excluded.notable_services,
                recommendations = excluded.recommendations
            "#,
        )
        .bind(&mac)
        .bind(now_ms())
        .bind(security_concerns.to_string())
        .bind(unusual_characteristics.to_string())
        .bind(notable_services.to_string())
        .bind(recommendations.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> ObservationStore {
        ObservationStore::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn migrations_reach_current_version_and_are_rerunnable() {
        let s = store().await;
        assert_eq!(s.schema_version().await.unwrap(), SCHEMA_VERSION);
        // Re-running is a no-op.
        s.migrate().await.unwrap();
        assert_eq!(s.schema_version().await.unwrap(), SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_except_last_seen() {
        let s = store().await;
        let attrs = DeviceAttrs {
            name: Some("widget".into()),
            addr_type: Some("random".into()),
            rssi: Some(-48),
            ..Default::default()
        };
        s.upsert_device("AA:BB:CC:DD:EE:10", attrs.clone()).await.unwrap();
        let first = s.get_device("aa:bb:cc:dd:ee:10").await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        s.upsert_device("aa:bb:cc:dd:ee:10", attrs).await.unwrap();
        let second = s.get_device("aa:bb:cc:dd:ee:10").await.unwrap().unwrap();

        assert_eq!(first.first_seen, second.first_seen);
        assert_eq!(first.name, second.name);
        assert_eq!(first.rssi_min, second.rssi_min);
        assert!(second.last_seen >= first.last_seen);
    }

    #[tokio::test]
    async fn timestamps_are_monotone() {
        let s = store().await;
        s.upsert_device("aa:bb:cc:dd:ee:11", DeviceAttrs::default())
            .await
            .unwrap();
        for _ in 0..3 {
            s.upsert_device("aa:bb:cc:dd:ee:11", DeviceAttrs::default())
                .await
                .unwrap();
            let row = s.get_device("aa:bb:cc:dd:ee:11").await.unwrap().unwrap();
            assert!(row.first_seen <= row.last_seen);
        }
    }

    #[tokio::test]
    async fn rssi_extrema_fold_across_observations() {
        let s = store().await;
        for rssi in [-40i64, -42, -41] {
            s.upsert_device(
                "aa:bb:cc:dd:ee:01",
                DeviceAttrs {
                    rssi: Some(rssi),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }
        let row = s.get_device("aa:bb:cc:dd:ee:01").await.unwrap().unwrap();
        assert_eq!(row.rssi_last, Some(-41));
        assert_eq!(row.rssi_min, Some(-42));
        assert_eq!(row.rssi_max, Some(-40));
    }

    #[tokio::test]
    async fn classification_only_strengthens() {
        let s = store().await;
        s.upsert_device("aa:bb:cc:dd:ee:12", DeviceAttrs::default())
            .await
            .unwrap();
        s.set_device_classification("aa:bb:cc:dd:ee:12", DeviceType::Le)
            .await
            .unwrap();
        // A weaker write must not downgrade.
        s.set_device_classification("aa:bb:cc:dd:ee:12", DeviceType::Unknown)
            .await
            .unwrap();
        let row = s.get_device("aa:bb:cc:dd:ee:12").await.unwrap().unwrap();
        assert_eq!(row.device_type, "le");
        s.set_device_classification("aa:bb:cc:dd:ee:12", DeviceType::Dual)
            .await
            .unwrap();
        let row = s.get_device("aa:bb:cc:dd:ee:12").await.unwrap().unwrap();
        assert_eq!(row.device_type, "dual");
    }

    #[tokio::test]
    async fn services_and_characteristics_reconcile_case_insensitively() {
        let s = store().await;
        s.upsert_device("aa:bb:cc:dd:ee:13", DeviceAttrs::default())
            .await
            .unwrap();
        let ids = s
            .upsert_services(
                "aa:bb:cc:dd:ee:13",
                &[ServiceInput {
                    uuid: "0000180F-0000-1000-8000-00805F9B34FB".into(),
                    handle_start: Some(HandleInput::Hex("0x0028".into())),
                    handle_end: None,
                    name: Some("Battery".into()),
                }],
            )
            .await
            .unwrap();
        let sid = ids["0000180f-0000-1000-8000-00805f9b34fb"];

        // Second pass in lowercase reconciles onto the same row.
        let ids2 = s
            .upsert_services(
                "AA:BB:CC:DD:EE:13",
                &[ServiceInput {
                    uuid: "0000180f-0000-1000-8000-00805f9b34fb".into(),
                    handle_start: None,
                    handle_end: None,
                    name: None,
                }],
            )
            .await
            .unwrap();
        assert_eq!(ids2["0000180f-0000-1000-8000-00805f9b34fb"], sid);

        let written = s
            .upsert_characteristics(
                sid,
                &[CharacteristicInput {
                    uuid: "00002A19-0000-1000-8000-00805F9B34FB".into(),
                    handle: Some(HandleInput::Hex("002a".into())),
                    properties: vec!["read".into(), "notify".into()],
                    value: Some(vec![0x64]),
                    permission_map: None,
                }],
            )
            .await
            .unwrap();
        assert_eq!(written, 1);
        let chars = s.get_service_characteristics(sid).await.unwrap();
        assert_eq!(chars.len(), 1);
        assert_eq!(chars[0].handle, Some(0x2a));
        assert_eq!(chars[0].value.as_deref(), Some(&[0x64u8][..]));
    }

    #[tokio::test]
    async fn history_is_append_only_with_ordering() {
        let s = store().await;
        s.upsert_device("aa:bb:cc:dd:ee:14", DeviceAttrs::default())
            .await
            .unwrap();
        let ts = 1_700_000_000_000i64;
        let id1 = s
            .insert_char_history("aa:bb:cc:dd:ee:14", "180f", "2a19", ts, &[1], HistorySource::Read)
            .await
            .unwrap();
        // Same-millisecond rows keep insertion order through the sequence id.
        let id2 = s
            .insert_char_history("aa:bb:cc:dd:ee:14", "180f", "2a19", ts, &[2], HistorySource::Write)
            .await
            .unwrap();
        assert!(id2 > id1);
        let timeline = s
            .get_characteristic_timeline("aa:bb:cc:dd:ee:14", Some("180f"), Some("2a19"), 10)
            .await
            .unwrap();
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].source, "read");
        assert_eq!(timeline[1].source, "write");
    }

    #[tokio::test]
    async fn evidence_upserts_by_unique_key_and_hashes_stably() {
        let s = store().await;
        s.upsert_device("cc:dd:ee:00:11:22", DeviceAttrs::default())
            .await
            .unwrap();
        let evidence = EvidenceInput {
            evidence_type: "classic_device_class".into(),
            weight: EvidenceWeight::Conclusive,
            source: "bus_property".into(),
            value: Some(serde_json::json!(0x5a020c)),
            metadata: None,
        };
        s.store_device_type_evidence("cc:dd:ee:00:11:22", &evidence)
            .await
            .unwrap();
        let sig1 = s
            .get_device_evidence_signature("cc:dd:ee:00:11:22")
            .await
            .unwrap()
            .unwrap();
        // Re-storing the same evidence does not change the signature.
        s.store_device_type_evidence("cc:dd:ee:00:11:22", &evidence)
            .await
            .unwrap();
        let sig2 = s
            .get_device_evidence_signature("cc:dd:ee:00:11:22")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sig1, sig2);
        assert_eq!(
            s.get_device_evidence("cc:dd:ee:00:11:22").await.unwrap().len(),
            1
        );

        // A different source is a new evidence row and a new signature.
        let mut other = evidence.clone();
        other.source = "sdp_query".into();
        s.store_device_type_evidence("cc:dd:ee:00:11:22", &other)
            .await
            .unwrap();
        let sig3 = s
            .get_device_evidence_signature("cc:dd:ee:00:11:22")
            .await
            .unwrap()
            .unwrap();
        assert_ne!(sig1, sig3);
    }

    #[tokio::test]
    async fn child_writes_create_the_device_row() {
        let s = store().await;
        // History and service writes for a never-before-seen device must
        // not trip the foreign key.
        s.insert_char_history("aa:bb:cc:dd:ee:16", "180f", "2a19", 5, &[1], HistorySource::Read)
            .await
            .unwrap();
        let row = s.get_device("aa:bb:cc:dd:ee:16").await.unwrap().unwrap();
        assert_eq!(row.device_type, "unknown");

        s.upsert_services(
            "aa:bb:cc:dd:ee:17",
            &[ServiceInput {
                uuid: "180a".into(),
                handle_start: None,
                handle_end: None,
                name: None,
            }],
        )
        .await
        .unwrap();
        assert!(s.get_device("aa:bb:cc:dd:ee:17").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn classic_services_and_pbap_metadata_round_trip() {
        let s = store().await;
        s.upsert_device("aa:bb:cc:dd:ee:15", DeviceAttrs::default())
            .await
            .unwrap();
        s.upsert_classic_services(
            "aa:bb:cc:dd:ee:15",
            &[ClassicServiceInput {
                uuid: "0000112f-0000-1000-8000-00805f9b34fb".into(),
                channel: Some(19),
                name: Some("Phonebook Access PSE".into()),
                handle: Some(0x10005),
                profiles: vec![("0000112f-0000-1000-8000-00805f9b34fb".into(), 0x0102)],
                version: Some(0x0102),
                description: None,
            }],
        )
        .await
        .unwrap();
        s.upsert_pbap_metadata("aa:bb:cc:dd:ee:15", "PB", 42, "deadbeef")
            .await
            .unwrap();

        let detail = s.get_device_detail("aa:bb:cc:dd:ee:15").await.unwrap().unwrap();
        assert_eq!(detail.classic_services.len(), 1);
        assert_eq!(detail.classic_services[0].channel, Some(19));
        assert_eq!(detail.pbap_metadata.len(), 1);
        assert_eq!(detail.pbap_metadata[0].entries, 42);
    }
}
