//! Pipeline assembly.
//!
//! Builds the notification topic, subscribes the five routed queues with
//! their filters, and spawns a worker per queue. Capability handles are
//! injected, never constructed here, so tests drive the exact wiring the
//! service runs.

use crate::handlers::{
    EventHandler, IngestHandler, InvalidImageHandler, MetadataHandler, NotifyHandler,
    StatusHandler,
};
use crate::mailer::Mailer;
use crate::message::MessageKind;
use crate::object_store::ObjectStore;
use crate::record::RecordStore;
use crate::topic::{MessageFilter, NotificationTopic, QueueSettings, QueueWorker};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Injected capability handles for the pipeline.
pub struct Capabilities {
    pub records: Arc<dyn RecordStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub mailer: Arc<dyn Mailer>,
}

/// A running pipeline: the topic plus its queue workers.
pub struct Pipeline {
    pub topic: Arc<NotificationTopic>,
    workers: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Wire up queues and handlers and start the workers.
    pub fn build(
        capabilities: Capabilities,
        settings: QueueSettings,
        fallback_address: impl Into<String>,
    ) -> Self {
        let topic = Arc::new(NotificationTopic::new());

        // The ingest queue keeps the legacy unfiltered subscription: it
        // receives every kind and its handler re-checks the payload shape.
        let ingest_queue = topic.subscribe("ingest", MessageFilter::All, settings.capacity);
        let status_queue = topic.subscribe(
            "status-update",
            MessageFilter::AllowList(vec![MessageKind::StatusUpdate]),
            settings.capacity,
        );
        let metadata_queue = topic.subscribe(
            "metadata-update",
            MessageFilter::AllowList(vec![MessageKind::MetadataUpdate]),
            settings.capacity,
        );
        let invalid_queue = topic.subscribe(
            "invalid-image",
            MessageFilter::AllowList(vec![MessageKind::InvalidImage]),
            settings.capacity,
        );
        let notify_queue = topic.subscribe(
            "notify",
            MessageFilter::AllowList(vec![MessageKind::Notify, MessageKind::ObjectCreated]),
            settings.capacity,
        );

        let ingest: Arc<dyn EventHandler> = Arc::new(IngestHandler::new(
            capabilities.records.clone(),
            capabilities.objects.clone(),
        ));
        let status: Arc<dyn EventHandler> = Arc::new(StatusHandler::new(
            capabilities.records.clone(),
            topic.clone(),
        ));
        let metadata: Arc<dyn EventHandler> =
            Arc::new(MetadataHandler::new(capabilities.records.clone()));
        let invalid: Arc<dyn EventHandler> = Arc::new(InvalidImageHandler::new(
            capabilities.records.clone(),
            capabilities.objects.clone(),
        ));
        let notify: Arc<dyn EventHandler> = Arc::new(NotifyHandler::new(
            capabilities.mailer.clone(),
            fallback_address,
        ));

        let queues = [
            (ingest_queue, ingest),
            (status_queue, status),
            (metadata_queue, metadata),
            (invalid_queue, invalid),
            (notify_queue, notify),
        ];

        let mut workers = Vec::with_capacity(queues.len());
        for (queue, handler) in queues {
            let worker =
                QueueWorker::new(queue, handler, &settings, topic.shutdown_receiver());
            workers.push(tokio::spawn(worker.run()));
        }

        info!(workers = workers.len(), "Pipeline started");

        Self { topic, workers }
    }

    /// Signal workers to stop after draining their current batch.
    pub fn shutdown(&self) {
        self.topic.shutdown();
    }

    /// Wait for all workers to finish.
    pub async fn join(self) {
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::MemoryMailer;
    use crate::message::{
        self, Envelope, InvalidAction, InvalidImageEvent, MetadataKind, MetadataUpdateEvent,
        ObjectCreatedEvent, Payload, ReviewStatus, StatusUpdateEvent, ATTR_STATUS_UPDATE,
        HEADER_MESSAGE_TYPE,
    };
    use crate::object_store::{MemoryObjectStore, ObjectStat};
    use crate::record::{test_record, FilterCriteria, ImageStatus, MemoryRecordStore};
    use std::collections::HashMap;
    use std::future::Future;
    use std::time::Duration;

    struct Harness {
        pipeline: Pipeline,
        records: Arc<MemoryRecordStore>,
        objects: Arc<MemoryObjectStore>,
        mailer: Arc<MemoryMailer>,
    }

    const FALLBACK: &str = "moderation@darkroom.local";

    fn harness() -> Harness {
        let records = Arc::new(MemoryRecordStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let mailer = Arc::new(MemoryMailer::new());

        let pipeline = Pipeline::build(
            Capabilities {
                records: records.clone(),
                objects: objects.clone(),
                mailer: mailer.clone(),
            },
            QueueSettings::default(),
            FALLBACK,
        );

        Harness {
            pipeline,
            records,
            objects,
            mailer,
        }
    }

    async fn wait_until<F, Fut>(what: &str, mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if condition().await {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(result.is_ok(), "timed out waiting for: {what}");
    }

    /// Let in-flight deliveries settle so negative assertions mean something.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_upload_creates_pending_record_and_sends_ack() {
        let h = harness();
        let mut tags = HashMap::new();
        tags.insert("photographer".to_string(), "ann@example.com".to_string());
        h.objects
            .put(
                "images",
                "sunset.jpeg",
                ObjectStat {
                    content_type: Some("image/jpeg".to_string()),
                    size: Some(2048),
                    tags,
                },
            )
            .await;

        h.pipeline
            .topic
            .publish(Envelope::new(Payload::ObjectCreated(ObjectCreatedEvent {
                bucket: "images".to_string(),
                key: "sunset.jpeg".to_string(),
            })))
            .await
            .unwrap();

        let records = h.records.clone();
        wait_until("record creation", || {
            let records = records.clone();
            async move {
                !records
                    .query(&FilterCriteria::default())
                    .await
                    .unwrap()
                    .is_empty()
            }
        })
        .await;

        let all = h.records.query(&FilterCriteria::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, ImageStatus::Pending);
        assert_eq!(all[0].object_key, "sunset.jpeg");
        assert_eq!(all[0].photographer, "ann@example.com");

        let mailer = h.mailer.clone();
        wait_until("upload acknowledgement", || {
            let mailer = mailer.clone();
            async move { !mailer.sent().await.is_empty() }
        })
        .await;

        let sent = h.mailer.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, FALLBACK);
        assert_eq!(sent[0].subject, "New image Upload");
        assert!(sent[0].html_body.contains("s3://images/sunset.jpeg"));

        h.pipeline.shutdown();
        h.pipeline.join().await;
    }

    #[tokio::test]
    async fn test_status_update_transitions_and_mails_photographer() {
        let h = harness();
        let mut record = test_record("img-1");
        record.photographer = "ann@example.com".to_string();
        h.records.create(&record).await.unwrap();

        h.pipeline
            .topic
            .publish(Envelope::new(Payload::StatusUpdate(StatusUpdateEvent {
                id: "img-1".to_string(),
                status: ReviewStatus::Pass,
                reason: String::new(),
            })))
            .await
            .unwrap();

        let mailer = h.mailer.clone();
        wait_until("status email", || {
            let mailer = mailer.clone();
            async move { !mailer.sent().await.is_empty() }
        })
        .await;

        let record = h.records.get("img-1").await.unwrap().unwrap();
        assert_eq!(record.status, ImageStatus::Pass);

        settle().await;
        let sent = h.mailer.sent().await;
        assert_eq!(sent.len(), 1, "exactly one status email expected");
        assert_eq!(sent[0].to, "ann@example.com");
        assert_eq!(sent[0].subject, "Your image has been approved");

        h.pipeline.shutdown();
        h.pipeline.join().await;
    }

    #[tokio::test]
    async fn test_status_update_for_unmailable_photographer_uses_fallback() {
        let h = harness();
        h.records.create(&test_record("img-1")).await.unwrap();

        h.pipeline
            .topic
            .publish(Envelope::new(Payload::StatusUpdate(StatusUpdateEvent {
                id: "img-1".to_string(),
                status: ReviewStatus::Reject,
                reason: "blurry".to_string(),
            })))
            .await
            .unwrap();

        let mailer = h.mailer.clone();
        wait_until("fallback email", || {
            let mailer = mailer.clone();
            async move { !mailer.sent().await.is_empty() }
        })
        .await;

        let sent = h.mailer.sent().await;
        assert_eq!(sent[0].to, FALLBACK);
        assert!(sent[0].html_body.contains("Reason: blurry"));

        h.pipeline.shutdown();
        h.pipeline.join().await;
    }

    #[tokio::test]
    async fn test_metadata_update_merges_single_key() {
        let h = harness();
        let mut record = test_record("img-1");
        record
            .metadata
            .insert("name".to_string(), "Ann".to_string());
        h.records.create(&record).await.unwrap();

        h.pipeline
            .topic
            .publish(Envelope::new(Payload::MetadataUpdate(MetadataUpdateEvent {
                id: "img-1".to_string(),
                kind: MetadataKind::Caption,
                value: "Sunset".to_string(),
            })))
            .await
            .unwrap();

        let records = h.records.clone();
        wait_until("metadata merge", || {
            let records = records.clone();
            async move {
                records
                    .get("img-1")
                    .await
                    .unwrap()
                    .unwrap()
                    .metadata
                    .contains_key("caption")
            }
        })
        .await;

        let record = h.records.get("img-1").await.unwrap().unwrap();
        assert_eq!(record.metadata.get("caption").map(String::as_str), Some("Sunset"));
        // The pre-existing key is untouched.
        assert_eq!(record.metadata.get("name").map(String::as_str), Some("Ann"));

        h.pipeline.shutdown();
        h.pipeline.join().await;
    }

    #[tokio::test]
    async fn test_invalid_image_with_unknown_id_has_no_side_effects() {
        let h = harness();
        h.records.create(&test_record("img-1")).await.unwrap();
        h.objects
            .put("images", "img-1.jpeg", ObjectStat::default())
            .await;

        h.pipeline
            .topic
            .publish(Envelope::new(Payload::InvalidImage(InvalidImageEvent {
                id: "ghost".to_string(),
                reason: "corrupt".to_string(),
                action: InvalidAction::DeleteRecord,
            })))
            .await
            .unwrap();

        settle().await;
        assert!(h.records.get("img-1").await.unwrap().is_some());
        assert!(h.objects.contains("images", "img-1.jpeg").await);
        assert!(h.mailer.sent().await.is_empty());

        h.pipeline.shutdown();
        h.pipeline.join().await;
    }

    #[tokio::test]
    async fn test_notify_echo_from_the_wire_does_not_retrigger_transition() {
        let h = harness();
        let mut record = test_record("img-1");
        record.photographer = "ann@example.com".to_string();
        h.records.create(&record).await.unwrap();

        // A notify echo arriving on the wire is classified once at ingress
        // and must only produce an email, never a record mutation.
        let mut headers = HashMap::new();
        headers.insert(
            HEADER_MESSAGE_TYPE.to_string(),
            ATTR_STATUS_UPDATE.to_string(),
        );
        let body = br#"{
            "type": "STATUS_UPDATE",
            "imageId": "img-1",
            "newStatus": "Pass",
            "reason": "",
            "photographerEmail": "ann@example.com",
            "objectLocator": {"bucket": "images", "key": "img-1.jpeg"}
        }"#;
        let payload = message::decode_wire(&headers, body).unwrap();
        h.pipeline
            .topic
            .publish(Envelope::new(payload))
            .await
            .unwrap();

        let mailer = h.mailer.clone();
        wait_until("echo email", || {
            let mailer = mailer.clone();
            async move { !mailer.sent().await.is_empty() }
        })
        .await;

        settle().await;
        // One email, and the record still holds its original state.
        assert_eq!(h.mailer.sent().await.len(), 1);
        let record = h.records.get("img-1").await.unwrap().unwrap();
        assert_eq!(record.status, ImageStatus::Pending);

        h.pipeline.shutdown();
        h.pipeline.join().await;
    }
}
