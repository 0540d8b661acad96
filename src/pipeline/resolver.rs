use crate::db::{DataTargetKind, DbError, LoadedTargets, Store};

use std::sync::Arc;

/// Finds the data targets a payload should be pushed to.
#[derive(Clone)]
pub struct TargetResolver {
    store: Arc<Store>,
}

impl TargetResolver {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Distinct targets connected to `device_id` through `payload_decoder_id`,
    /// or through a decoder-less connection when it is `None`. Pull-based
    /// targets are left out. Connected rows that cannot be turned into a
    /// target come back in `invalid` without hiding their siblings.
    pub fn resolve(
        &self,
        device_id: i64,
        payload_decoder_id: Option<i64>,
    ) -> Result<LoadedTargets, DbError> {
        let ids = self
            .store
            .find_target_ids_by_device_and_decoder(device_id, payload_decoder_id)?;
        let mut loaded = self.store.get_data_targets(&ids)?;

        loaded
            .targets
            .retain(|t| !matches!(t.kind, DataTargetKind::OpenDataDk));
        for (target_id, e) in &loaded.invalid {
            tracing::warn!(target_id, device_id, "Skipping unusable data target: {}", e);
        }
        Ok(loaded)
    }
}
