//! Invalid-image handler: purges the stored object and terminates the record.

use super::{EventHandler, HandlerError};
use crate::message::{Envelope, InvalidAction, InvalidImageEvent, Payload};
use crate::object_store::ObjectStore;
use crate::record::{ImageStatus, RecordPatch, RecordStore};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Deletes the referenced object, then either marks the record invalid or
/// removes it entirely.
///
/// The two side effects are irreversible, so the handler is written to be
/// resumable: a redelivery after the object was already deleted proceeds to
/// the record step instead of failing.
pub struct InvalidImageHandler {
    records: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
}

impl InvalidImageHandler {
    pub fn new(records: Arc<dyn RecordStore>, objects: Arc<dyn ObjectStore>) -> Self {
        Self { records, objects }
    }

    #[instrument(skip(self, event), fields(id = %event.id, action = ?event.action))]
    async fn purge(&self, event: &InvalidImageEvent) -> Result<(), HandlerError> {
        let Some(record) = self.records.get(&event.id).await? else {
            return Err(HandlerError::NotFound(format!(
                "image {} does not exist",
                event.id
            )));
        };

        if !record.bucket.is_empty() && !record.object_key.is_empty() {
            // Backends treat an already-missing object as success, which is
            // what makes redelivery after a partial run safe.
            self.objects
                .delete(&record.bucket, &record.object_key)
                .await
                .map_err(|e| HandlerError::Transient(e.to_string()))?;
            debug!(key = %record.object_key, "Stored object removed");
        } else {
            warn!(id = %record.id, "Record has no object locator, nothing to delete");
        }

        match event.action {
            InvalidAction::DeleteRecord => {
                let removed = self.records.delete(&event.id).await?;
                if removed {
                    info!(id = %event.id, "Image record deleted");
                    metrics::counter!("pipeline.records.deleted").increment(1);
                } else {
                    debug!(id = %event.id, "Record already deleted");
                }
            }
            InvalidAction::MarkInvalid => {
                let patch = RecordPatch::review(ImageStatus::Invalid, event.reason.clone());
                match self.records.update_fields(&event.id, patch).await? {
                    Some(_) => {
                        info!(id = %event.id, "Image record marked invalid");
                        metrics::counter!("pipeline.records.invalidated").increment(1);
                    }
                    None => debug!(id = %event.id, "Record vanished before mark-invalid"),
                }
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl EventHandler for InvalidImageHandler {
    fn name(&self) -> &'static str {
        "invalid-image"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        match &envelope.payload {
            Payload::InvalidImage(event) => self.purge(event).await,
            other => {
                debug!(kind = %other.kind(), "Ignoring unexpected payload on invalid-image queue");
                Ok(())
            }
        }
    }
}
