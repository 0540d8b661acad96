use crate::db::{DataTarget, DbError, DeliveryLogEntry, SendStatus, Store};
use crate::sender::{SendError, SendReport};

use chrono::Utc;
use std::sync::Arc;

/// Writes the outcome of every send attempt: the target's last message date
/// and a delivery log entry.
#[derive(Clone)]
pub struct OutcomeRecorder {
    store: Arc<Store>,
    max_events: usize,
}

impl OutcomeRecorder {
    /// `max_events` is the per-target log size; 0 keeps everything.
    pub fn new(store: Arc<Store>, max_events: usize) -> Self {
        Self { store, max_events }
    }

    pub fn record(
        &self,
        target: &DataTarget,
        device_id: i64,
        payload_decoder_id: Option<i64>,
        outcome: &Result<SendReport, SendError>,
    ) -> Result<DeliveryLogEntry, DbError> {
        let now = Utc::now();
        self.store.update_last_message_date(target.id, now)?;

        let (status, status_code, message) = match outcome {
            Ok(report) => {
                tracing::debug!(target_id = target.id, device_id, status_code = ?report.status_code, "Send OK");
                (SendStatus::Ok, report.status_code, report.message.clone())
            }
            Err(e) => {
                tracing::warn!(target_id = target.id, device_id, target_type = target.target_type().as_str(), "Send failed: {}", e);
                (SendStatus::Error, None, Some(e.to_string()))
            }
        };

        let mut entry = DeliveryLogEntry {
            id: 0,
            created_at: now,
            data_target_id: target.id,
            device_id: Some(device_id),
            payload_decoder_id,
            status,
            status_code,
            message,
        };
        self.store.add_delivery_log_entry(&mut entry, self.max_events)?;
        Ok(entry)
    }

    /// Log an error for a connected target whose configuration cannot be
    /// used, so it shows up in that target's delivery log. No send happened,
    /// so the last message date is left alone.
    pub fn record_unusable(
        &self,
        data_target_id: i64,
        device_id: i64,
        payload_decoder_id: Option<i64>,
        reason: &DbError,
    ) -> Result<DeliveryLogEntry, DbError> {
        let mut entry = DeliveryLogEntry {
            id: 0,
            created_at: Utc::now(),
            data_target_id,
            device_id: Some(device_id),
            payload_decoder_id,
            status: SendStatus::Error,
            status_code: None,
            message: Some(format!("unusable data target configuration: {}", reason)),
        };
        self.store.add_delivery_log_entry(&mut entry, self.max_events)?;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Fixtures;
    use crate::secrets::AesGcmSecretStore;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_outcomes_are_logged_and_pruned() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let secrets = AesGcmSecretStore::from_base64_key(&AesGcmSecretStore::generate_key()).unwrap();
        let fixtures: Fixtures = serde_json::from_str(
            r#"{
                "applications": [{ "name": "app" }],
                "devices": [{ "name": "d", "application": "app", "type": "GENERIC_HTTP", "apiKey": "k" }],
                "dataTargets": [{ "name": "t", "application": "app", "type": "HTTP_PUSH", "url": "http://a.invalid" }]
            }"#,
        )
        .unwrap();
        let ids = store.load_fixtures(&fixtures, &secrets).unwrap();
        let target = store.get_data_target(ids.data_targets["t"]).unwrap();
        assert!(target.last_message_date.is_none());

        let recorder = OutcomeRecorder::new(store.clone(), 2);
        let device_id = ids.devices["d"];

        let ok = recorder
            .record(&target, device_id, None, &Ok(SendReport { status_code: Some(202), message: None }))
            .unwrap();
        assert_eq!(ok.status, SendStatus::Ok);
        assert_eq!(ok.status_code, Some(202));

        let err = recorder
            .record(&target, device_id, None, &Err(SendError::Timeout(Duration::from_secs(1))))
            .unwrap();
        assert_eq!(err.status, SendStatus::Error);
        assert!(err.message.unwrap().contains("timed out"));

        recorder
            .record(&target, device_id, None, &Ok(SendReport::default()))
            .unwrap();

        let log = store.list_delivery_log(target.id).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].status, SendStatus::Error);
        assert!(store.get_data_target(target.id).unwrap().last_message_date.is_some());
    }
}
