//! Status handler: applies Pass/Reject review transitions.

use super::{EventHandler, HandlerError};
use crate::mailer::is_email_address;
use crate::message::{Envelope, NotifyEvent, Payload, StatusUpdateEvent};
use crate::record::{RecordPatch, RecordStore};
use crate::topic::NotificationTopic;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Transitions a record's review state and republishes a notify event.
///
/// Value validation (`Pass`/`Reject` only) happens at the ingress codec, so
/// an envelope reaching this handler already carries a well-formed payload;
/// the remaining checks are record existence and echo suppression.
pub struct StatusHandler {
    records: Arc<dyn RecordStore>,
    topic: Arc<NotificationTopic>,
}

impl StatusHandler {
    pub fn new(records: Arc<dyn RecordStore>, topic: Arc<NotificationTopic>) -> Self {
        Self { records, topic }
    }

    #[instrument(skip(self, event), fields(id = %event.id, status = %event.status))]
    async fn transition(&self, event: &StatusUpdateEvent) -> Result<(), HandlerError> {
        let patch = RecordPatch::review(event.status.into(), event.reason.clone());
        let Some(updated) = self.records.update_fields(&event.id, patch).await? else {
            return Err(HandlerError::NotFound(format!(
                "image {} does not exist",
                event.id
            )));
        };

        info!(id = %updated.id, status = %updated.status, "Image status updated");
        metrics::counter!("pipeline.status.transitions").increment(1);

        // The notify event carries the record's current photographer, but
        // only when it is email-shaped; the notification handler falls back
        // to the configured address otherwise.
        let photographer_email = if is_email_address(&updated.photographer) {
            Some(updated.photographer.clone())
        } else {
            warn!(
                id = %updated.id,
                photographer = %updated.photographer,
                "Photographer is not an email address, notification will use the fallback"
            );
            None
        };

        let notify = NotifyEvent {
            image_id: updated.id.clone(),
            new_status: event.status,
            reason: event.reason.clone(),
            photographer_email,
            object_locator: Some(updated.locator()),
        };

        self.topic
            .publish(Envelope::new(Payload::Notify(notify)))
            .await
            .map_err(|e| HandlerError::Transient(e.to_string()))?;

        debug!(id = %updated.id, "Status notification published");
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventHandler for StatusHandler {
    fn name(&self) -> &'static str {
        "status"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        match &envelope.payload {
            Payload::StatusUpdate(event) => self.transition(event).await,
            // An internally-generated echo must never be reprocessed as a
            // fresh transition.
            Payload::Notify(_) => {
                debug!("Skipping internally-generated notification echo");
                Ok(())
            }
            other => {
                debug!(kind = %other.kind(), "Ignoring unexpected payload on status queue");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageKind, ReviewStatus};
    use crate::record::{test_record, ImageStatus, MemoryRecordStore, RecordPatch};
    use crate::topic::{MessageFilter, NotificationTopic};

    fn status_envelope(id: &str, status: ReviewStatus, reason: &str) -> Envelope {
        Envelope::new(Payload::StatusUpdate(StatusUpdateEvent {
            id: id.to_string(),
            status,
            reason: reason.to_string(),
        }))
    }

    async fn handler_with_record(
        photographer: &str,
    ) -> (StatusHandler, Arc<MemoryRecordStore>, Arc<NotificationTopic>) {
        let records = Arc::new(MemoryRecordStore::new());
        let mut record = test_record("img-1");
        record.photographer = photographer.to_string();
        records.create(&record).await.unwrap();

        let topic = Arc::new(NotificationTopic::new());
        let handler = StatusHandler::new(records.clone(), topic.clone());
        (handler, records, topic)
    }

    #[tokio::test]
    async fn test_transition_updates_record_and_publishes_one_notify() {
        let (handler, records, topic) = handler_with_record("ann@example.com").await;
        let mut notify_queue = topic.subscribe(
            "notify",
            MessageFilter::AllowList(vec![MessageKind::Notify]),
            8,
        );

        handler
            .handle(&status_envelope("img-1", ReviewStatus::Pass, ""))
            .await
            .unwrap();

        let record = records.get("img-1").await.unwrap().unwrap();
        assert_eq!(record.status, ImageStatus::Pass);
        assert_eq!(record.reason.as_deref(), Some(""));

        let envelope = notify_queue_recv(&mut notify_queue).await;
        match envelope.payload {
            Payload::Notify(e) => {
                assert_eq!(e.image_id, "img-1");
                assert_eq!(e.new_status, ReviewStatus::Pass);
                assert_eq!(e.photographer_email.as_deref(), Some("ann@example.com"));
                assert_eq!(e.object_locator.unwrap().key, "img-1.jpeg");
            }
            other => panic!("unexpected payload: {:?}", other),
        }
        assert!(notify_queue_empty(&mut notify_queue));
    }

    #[tokio::test]
    async fn test_reject_records_reason() {
        let (handler, records, _topic) = handler_with_record("ann@example.com").await;

        handler
            .handle(&status_envelope("img-1", ReviewStatus::Reject, "blurry"))
            .await
            .unwrap();

        let record = records.get("img-1").await.unwrap().unwrap();
        assert_eq!(record.status, ImageStatus::Reject);
        assert_eq!(record.reason.as_deref(), Some("blurry"));
    }

    #[tokio::test]
    async fn test_non_email_photographer_is_omitted_from_notify() {
        let (handler, _records, topic) = handler_with_record("unknown").await;
        let mut notify_queue = topic.subscribe(
            "notify",
            MessageFilter::AllowList(vec![MessageKind::Notify]),
            8,
        );

        handler
            .handle(&status_envelope("img-1", ReviewStatus::Pass, ""))
            .await
            .unwrap();

        match notify_queue_recv(&mut notify_queue).await.payload {
            Payload::Notify(e) => assert!(e.photographer_email.is_none()),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_id_is_dropped_without_notify() {
        let records = Arc::new(MemoryRecordStore::new());
        let topic = Arc::new(NotificationTopic::new());
        let mut notify_queue = topic.subscribe(
            "notify",
            MessageFilter::AllowList(vec![MessageKind::Notify]),
            8,
        );
        let handler = StatusHandler::new(records, topic.clone());

        let err = handler
            .handle(&status_envelope("ghost", ReviewStatus::Pass, ""))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::NotFound(_)));
        assert!(notify_queue_empty(&mut notify_queue));
    }

    #[tokio::test]
    async fn test_notify_echo_is_skipped() {
        let (handler, records, _topic) = handler_with_record("ann@example.com").await;

        let echo = Envelope::new(Payload::Notify(NotifyEvent {
            image_id: "img-1".to_string(),
            new_status: ReviewStatus::Reject,
            reason: "echo".to_string(),
            photographer_email: None,
            object_locator: None,
        }));
        handler.handle(&echo).await.unwrap();

        // The echo must not have touched the record.
        let record = records.get("img-1").await.unwrap().unwrap();
        assert_eq!(record.status, ImageStatus::Pending);
        assert!(record.reason.is_none());
    }

    #[tokio::test]
    async fn test_redelivery_reapplies_without_corruption() {
        let (handler, records, _topic) = handler_with_record("ann@example.com").await;
        records
            .update_fields("img-1", RecordPatch::annotation("caption", "Sunset"))
            .await
            .unwrap();

        let envelope = status_envelope("img-1", ReviewStatus::Pass, "");
        handler.handle(&envelope).await.unwrap();
        handler.handle(&envelope).await.unwrap();

        let record = records.get("img-1").await.unwrap().unwrap();
        assert_eq!(record.status, ImageStatus::Pass);
        assert_eq!(record.metadata.get("caption").map(String::as_str), Some("Sunset"));
        assert_eq!(record.photographer, "ann@example.com");
    }

    async fn notify_queue_recv(queue: &mut crate::topic::SubscriberQueue) -> Envelope {
        tokio::time::timeout(std::time::Duration::from_secs(1), queue_recv(queue))
            .await
            .expect("expected a notify envelope")
    }

    async fn queue_recv(queue: &mut crate::topic::SubscriberQueue) -> Envelope {
        queue.recv().await.expect("queue closed")
    }

    fn notify_queue_empty(queue: &mut crate::topic::SubscriberQueue) -> bool {
        queue.try_recv().is_none()
    }
}
