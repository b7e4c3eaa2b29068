//! Ingestion handler: object-created events become pending records.

use super::{EventHandler, HandlerError};
use crate::message::{Envelope, ObjectCreatedEvent, Payload};
use crate::object_store::{ObjectStore, ObjectStoreError};
use crate::record::{ImageRecord, ImageStatus, RecordStore};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const PHOTOGRAPHER_TAG: &str = "photographer";

/// Creates a new pending [`ImageRecord`] for each uploaded object.
///
/// This handler sits on the legacy unfiltered subscription, so it receives
/// every message kind and acts only on object-created payloads.
pub struct IngestHandler {
    records: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
}

impl IngestHandler {
    pub fn new(records: Arc<dyn RecordStore>, objects: Arc<dyn ObjectStore>) -> Self {
        Self { records, objects }
    }

    #[instrument(skip(self, event), fields(bucket = %event.bucket, key = %event.key))]
    async fn ingest(&self, event: &ObjectCreatedEvent) -> Result<(), HandlerError> {
        let stat = match self.objects.stat(&event.bucket, &event.key).await {
            Ok(stat) => stat,
            Err(ObjectStoreError::NotFound { .. }) => {
                return Err(HandlerError::NotFound(format!(
                    "uploaded object s3://{}/{} is gone",
                    event.bucket, event.key
                )));
            }
            Err(e) => return Err(HandlerError::Transient(e.to_string())),
        };

        let photographer = stat
            .tags
            .get(PHOTOGRAPHER_TAG)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());

        let now = Utc::now();
        let record = ImageRecord {
            id: Uuid::new_v4().to_string(),
            bucket: event.bucket.clone(),
            object_key: event.key.clone(),
            uploaded_at: now,
            size: stat.size,
            content_type: stat.content_type,
            metadata: stat.tags.into_iter().collect(),
            status: ImageStatus::Pending,
            reason: None,
            photographer,
            last_updated: now,
        };

        let created = self.records.create(&record).await?;
        if created {
            info!(id = %record.id, key = %record.object_key, "Image record created");
            metrics::counter!("pipeline.records.created").increment(1);
        } else {
            debug!(id = %record.id, "Record id already present, create skipped");
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl EventHandler for IngestHandler {
    fn name(&self) -> &'static str {
        "ingest"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        match &envelope.payload {
            Payload::ObjectCreated(event) => self.ingest(event).await,
            // Unfiltered subscription: everything else is not ours.
            other => {
                debug!(kind = %other.kind(), "Ignoring non-upload payload on ingest queue");
                Ok(())
            }
        }
    }
}
