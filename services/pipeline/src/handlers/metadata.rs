//! Metadata handler: merges one annotation key into a record.

use super::{EventHandler, HandlerError};
use crate::message::{Envelope, MetadataUpdateEvent, Payload};
use crate::record::{RecordPatch, RecordStore};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Upserts a single metadata key; other keys are never touched, so
/// concurrent updates to different keys both land.
pub struct MetadataHandler {
    records: Arc<dyn RecordStore>,
}

impl MetadataHandler {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }

    #[instrument(skip(self, event), fields(id = %event.id, key = event.kind.record_key()))]
    async fn merge(&self, event: &MetadataUpdateEvent) -> Result<(), HandlerError> {
        let patch = RecordPatch::annotation(event.kind.record_key(), event.value.clone());
        let Some(updated) = self.records.update_fields(&event.id, patch).await? else {
            return Err(HandlerError::NotFound(format!(
                "image {} does not exist",
                event.id
            )));
        };

        info!(
            id = %updated.id,
            key = event.kind.record_key(),
            "Metadata merged"
        );
        metrics::counter!("pipeline.metadata.merged").increment(1);
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventHandler for MetadataHandler {
    fn name(&self) -> &'static str {
        "metadata"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        match &envelope.payload {
            Payload::MetadataUpdate(event) => self.merge(event).await,
            other => {
                debug!(kind = %other.kind(), "Ignoring unexpected payload on metadata queue");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MetadataKind;
    use crate::record::{test_record, MemoryRecordStore};

    fn metadata_envelope(id: &str, kind: MetadataKind, value: &str) -> Envelope {
        Envelope::new(Payload::MetadataUpdate(MetadataUpdateEvent {
            id: id.to_string(),
            kind,
            value: value.to_string(),
        }))
    }

    async fn handler_with_record() -> (MetadataHandler, Arc<MemoryRecordStore>) {
        let records = Arc::new(MemoryRecordStore::new());
        records.create(&test_record("img-1")).await.unwrap();
        (MetadataHandler::new(records.clone()), records)
    }

    #[tokio::test]
    async fn test_caption_is_stored_under_lowercase_key() {
        let (handler, records) = handler_with_record().await;

        handler
            .handle(&metadata_envelope("img-1", MetadataKind::Caption, "Sunset"))
            .await
            .unwrap();

        let record = records.get("img-1").await.unwrap().unwrap();
        assert_eq!(record.metadata.get("caption").map(String::as_str), Some("Sunset"));
    }

    #[tokio::test]
    async fn test_updates_to_distinct_keys_commute() {
        let (handler, records) = handler_with_record().await;
        let caption = metadata_envelope("img-1", MetadataKind::Caption, "Sunset");
        let date = metadata_envelope("img-1", MetadataKind::Date, "01/05/2025");

        // Apply in one order...
        handler.handle(&caption).await.unwrap();
        handler.handle(&date).await.unwrap();
        let forward = records.get("img-1").await.unwrap().unwrap().metadata;

        // ...then reset and apply in the other.
        records.delete("img-1").await.unwrap();
        records.create(&test_record("img-1")).await.unwrap();
        handler.handle(&date).await.unwrap();
        handler.handle(&caption).await.unwrap();
        let reverse = records.get("img-1").await.unwrap().unwrap().metadata;

        assert_eq!(forward, reverse);
        assert_eq!(forward.get("caption").map(String::as_str), Some("Sunset"));
        assert_eq!(forward.get("date").map(String::as_str), Some("01/05/2025"));
    }

    #[tokio::test]
    async fn test_reapplying_the_same_update_is_idempotent() {
        let (handler, records) = handler_with_record().await;
        let envelope = metadata_envelope("img-1", MetadataKind::Name, "Ann");

        handler.handle(&envelope).await.unwrap();
        handler.handle(&envelope).await.unwrap();

        let record = records.get("img-1").await.unwrap().unwrap();
        assert_eq!(record.metadata.len(), 1);
        assert_eq!(record.metadata.get("name").map(String::as_str), Some("Ann"));
    }

    #[tokio::test]
    async fn test_unknown_id_is_dropped() {
        let (handler, _records) = handler_with_record().await;

        let err = handler
            .handle(&metadata_envelope("ghost", MetadataKind::Caption, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::NotFound(_)));
    }
}
