//! Read-side queries and JSON export.

use sqlx::Row;

use crate::error::StoreResult;
use crate::rows::*;
use crate::store::{normalize_mac, ObservationStore};

/// Status filters accepted by [`ObservationStore::get_devices`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFilter {
    Recent,
    Ble,
    Classic,
    Dual,
    Unknown,
}

impl ObservationStore {
    pub async fn get_device(&self, mac: &str) -> StoreResult<Option<DeviceRow>> {
        let row = sqlx::query_as::<_, DeviceRow>("SELECT * FROM devices WHERE mac = ?")
            .bind(normalize_mac(mac))
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    /// Paged device listing, optionally filtered; ordered by recency.
    pub async fn get_devices(
        &self,
        filter: Option<DeviceFilter>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<DeviceRow>> {
        let base = "SELECT * FROM devices".to_string();
        let clause = match filter {
            None => String::new(),
            Some(DeviceFilter::Recent) => {
                let cutoff = chrono::Utc::now().timestamp_millis() - 86_400_000;
                format!(" WHERE last_seen > {cutoff}")
            }
            Some(DeviceFilter::Ble) => {
                " WHERE device_type = 'le' OR device_type = 'dual'".to_string()
            }
            Some(DeviceFilter::Classic) => {
                " WHERE device_type = 'classic' OR device_type = 'dual'".to_string()
            }
            Some(DeviceFilter::Dual) => " WHERE device_type = 'dual'".to_string(),
            Some(DeviceFilter::Unknown) => " WHERE device_type = 'unknown'".to_string(),
        };
        let sql = format!("{base}{clause} ORDER BY last_seen DESC LIMIT ? OFFSET ?");
        let rows = sqlx::query_as::<_, DeviceRow>(&sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(self.pool())
            .await?;
        Ok(rows)
    }

    pub async fn get_device_services(&self, mac: &str) -> StoreResult<Vec<ServiceRow>> {
        let rows = sqlx::query_as::<_, ServiceRow>(
            "SELECT * FROM services WHERE mac = ? ORDER BY handle_start, uuid",
        )
        .bind(normalize_mac(mac))
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn get_service_characteristics(
        &self,
        service_id: i64,
    ) -> StoreResult<Vec<CharacteristicRow>> {
        let rows = sqlx::query_as::<_, CharacteristicRow>(
            "SELECT * FROM characteristics WHERE service_id = ? ORDER BY handle, uuid",
        )
        .bind(service_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn get_characteristic_descriptors(
        &self,
        characteristic_id: i64,
    ) -> StoreResult<Vec<DescriptorRow>> {
        let rows = sqlx::query_as::<_, DescriptorRow>(
            "SELECT * FROM descriptors WHERE characteristic_id = ? ORDER BY uuid",
        )
        .bind(characteristic_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Time-ordered characteristic history; sequence id breaks timestamp
    /// ties so same-millisecond events keep receipt order.
    pub async fn get_characteristic_timeline(
        &self,
        mac: &str,
        service_uuid: Option<&str>,
        char_uuid: Option<&str>,
        limit: i64,
    ) -> StoreResult<Vec<CharHistoryRow>> {
        let mut sql = "SELECT * FROM char_history WHERE mac = ?".to_string();
        if service_uuid.is_some() {
            sql.push_str(" AND service_uuid = ?");
        }
        if char_uuid.is_some() {
            sql.push_str(" AND char_uuid = ?");
        }
        sql.push_str(" ORDER BY ts ASC, id ASC LIMIT ?");

        let mut query = sqlx::query_as::<_, CharHistoryRow>(&sql).bind(normalize_mac(mac));
        if let Some(svc) = service_uuid {
            query = query.bind(svc.to_ascii_lowercase());
        }
        if let Some(chr) = char_uuid {
            query = query.bind(chr.to_ascii_lowercase());
        }
        let rows = query.bind(limit).fetch_all(self.pool()).await?;
        Ok(rows)
    }

    pub async fn get_adv_reports(&self, mac: &str, limit: i64) -> StoreResult<Vec<AdvReportRow>> {
        let rows = sqlx::query_as::<_, AdvReportRow>(
            "SELECT * FROM adv_reports WHERE mac = ? ORDER BY ts ASC, id ASC LIMIT ?",
        )
        .bind(normalize_mac(mac))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn get_classic_services(&self, mac: &str) -> StoreResult<Vec<ClassicServiceRow>> {
        let rows = sqlx::query_as::<_, ClassicServiceRow>(
            "SELECT * FROM classic_services WHERE mac = ? ORDER BY uuid, channel",
        )
        .bind(normalize_mac(mac))
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn get_pbap_metadata(&self, mac: &str) -> StoreResult<Vec<PbapMetadataRow>> {
        let rows = sqlx::query_as::<_, PbapMetadataRow>(
            "SELECT * FROM pbap_metadata WHERE mac = ? ORDER BY repo",
        )
        .bind(normalize_mac(mac))
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn get_aoi_analysis(&self, mac: &str) -> StoreResult<Option<AoiAnalysisRow>> {
        let row = sqlx::query_as::<_, AoiAnalysisRow>("SELECT * FROM aoi_analysis WHERE mac = ?")
            .bind(normalize_mac(mac))
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    pub async fn has_aoi_analysis(&self, mac: &str) -> StoreResult<bool> {
        Ok(self.get_aoi_analysis(mac).await?.is_some())
    }

    /// Full per-device aggregate, or `None` when the device is unknown.
    pub async fn get_device_detail(&self, mac: &str) -> StoreResult<Option<DeviceDetail>> {
        let Some(device) = self.get_device(mac).await? else {
            return Ok(None);
        };
        let services = self.get_device_services(mac).await?;
        let mut characteristics = Vec::new();
        for service in &services {
            characteristics.extend(self.get_service_characteristics(service.id).await?);
        }
        Ok(Some(DeviceDetail {
            device,
            services,
            characteristics,
            classic_services: self.get_classic_services(mac).await?,
            pbap_metadata: self.get_pbap_metadata(mac).await?,
            evidence: self.get_device_evidence(mac).await?,
        }))
    }

    /// Device count per cached classification, for summaries.
    pub async fn count_devices_by_type(&self) -> StoreResult<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT device_type, COUNT(*) AS n FROM devices GROUP BY device_type ORDER BY n DESC",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("device_type"), row.get::<i64, _>("n")))
            .collect())
    }

    /// JSON export of everything known about a device. Byte blobs are
    /// hex-encoded.
    pub async fn export_device_data(&self, mac: &str) -> StoreResult<Option<serde_json::Value>> {
        let Some(detail) = self.get_device_detail(mac).await? else {
            return Ok(None);
        };
        let history = self
            .get_characteristic_timeline(mac, None, None, 500)
            .await?;
        let adv_reports = self.get_adv_reports(mac, 100).await?;

        let mut value = serde_json::to_value(&detail)
            .map_err(|e| crate::error::StoreError::InvalidInput(e.to_string()))?;
        if let serde_json::Value::Object(map) = &mut value {
            map.insert(
                "characteristic_history".into(),
                serde_json::to_value(&history)
                    .map_err(|e| crate::error::StoreError::InvalidInput(e.to_string()))?,
            );
            map.insert(
                "adv_reports".into(),
                serde_json::to_value(&adv_reports)
                    .map_err(|e| crate::error::StoreError::InvalidInput(e.to_string()))?,
            );
        }
        Ok(Some(hex_encode_blobs(value)))
    }
}

/// Recursively rewrite serialized byte arrays into hex strings.
///
/// Serde renders `Vec<u8>` as a JSON array of numbers; exports must carry
/// hex strings instead.
fn hex_encode_blobs(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Array(items) => {
            let all_bytes = !items.is_empty()
                && items
                    .iter()
                    .all(|item| item.as_u64().map(|n| n <= 0xff).unwrap_or(false));
            if all_bytes {
                let bytes: Vec<u8> = items
                    .iter()
                    .filter_map(|item| item.as_u64().map(|n| n as u8))
                    .collect();
                serde_json::Value::String(hex::encode(bytes))
            } else {
                serde_json::Value::Array(items.into_iter().map(hex_encode_blobs).collect())
            }
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, hex_encode_blobs(v)))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::{DeviceAttrs, HistorySource};

    #[tokio::test]
    async fn export_hex_encodes_blobs() {
        let s = ObservationStore::open_in_memory().await.unwrap();
        s.upsert_device(
            "aa:bb:cc:dd:ee:20",
            DeviceAttrs {
                manufacturer_data: Some(vec![0xde, 0xad, 0xbe, 0xef]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        s.insert_char_history(
            "aa:bb:cc:dd:ee:20",
            "180f",
            "2a19",
            1,
            &[0x64],
            HistorySource::Read,
        )
        .await
        .unwrap();

        let export = s
            .export_device_data("aa:bb:cc:dd:ee:20")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            export["device"]["manufacturer_data"],
            serde_json::json!("deadbeef")
        );
        assert_eq!(
            export["characteristic_history"][0]["value"],
            serde_json::json!("64")
        );
    }

    #[tokio::test]
    async fn device_filters_select_by_classification() {
        let s = ObservationStore::open_in_memory().await.unwrap();
        for (mac, device_type) in [
            ("aa:00:00:00:00:01", crate::rows::DeviceType::Le),
            ("aa:00:00:00:00:02", crate::rows::DeviceType::Classic),
            ("aa:00:00:00:00:03", crate::rows::DeviceType::Dual),
        ] {
            s.upsert_device(
                mac,
                DeviceAttrs {
                    device_type: Some(device_type),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }
        let ble = s.get_devices(Some(DeviceFilter::Ble), 100, 0).await.unwrap();
        assert_eq!(ble.len(), 2);
        let dual = s.get_devices(Some(DeviceFilter::Dual), 100, 0).await.unwrap();
        assert_eq!(dual.len(), 1);
        let all = s.get_devices(None, 100, 0).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn missing_device_detail_is_none() {
        let s = ObservationStore::open_in_memory().await.unwrap();
        assert!(s.get_device_detail("00:00:00:00:00:00").await.unwrap().is_none());
        assert!(s.export_device_data("00:00:00:00:00:00").await.unwrap().is_none());
    }
}
