//! The notification topic and its routed queues.
//!
//! A single [`NotificationTopic`] is the publish point for every domain
//! event. Subscriber queues declare a [`MessageFilter`] over message kinds;
//! a publish is delivered to every queue whose filter matches (fan-out, not
//! load balancing), and a publish that matches no subscriber is a silent
//! no-op from the publisher's perspective.
//!
//! Each queue is drained in batches by a [`QueueWorker`] that processes
//! items with per-item isolation and re-enqueues transient failures.

use crate::batch::{BatchSummary, ItemOutcome};
use crate::handlers::EventHandler;
use crate::message::{Envelope, MessageKind};
use std::sync::Arc;
use std::sync::RwLock;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur while publishing to the topic.
#[derive(Error, Debug)]
pub enum TopicError {
    #[error("Subscriber queue '{0}' rejected delivery")]
    QueueClosed(String),
}

/// Allow-list filter a subscriber declares over message kinds.
#[derive(Debug, Clone)]
pub enum MessageFilter {
    /// Receive every message. Handlers behind an unfiltered subscription
    /// must re-check the payload before acting.
    All,
    /// Receive only the listed kinds.
    AllowList(Vec<MessageKind>),
}

impl MessageFilter {
    pub fn matches(&self, kind: MessageKind) -> bool {
        match self {
            MessageFilter::All => true,
            MessageFilter::AllowList(kinds) => kinds.contains(&kind),
        }
    }
}

/// Tuning for a subscriber queue and its worker.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Buffered capacity of the queue.
    pub capacity: usize,
    /// Maximum messages drained per batch.
    pub batch_size: usize,
    /// Delivery attempts before a transiently-failing item is abandoned.
    pub max_attempts: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 256,
            batch_size: 5,
            max_attempts: 5,
        }
    }
}

struct Subscriber {
    name: String,
    filter: MessageFilter,
    sender: mpsc::Sender<Envelope>,
}

/// A subscribed queue: the receiving end plus a sender used for re-enqueues.
pub struct SubscriberQueue {
    pub name: String,
    sender: mpsc::Sender<Envelope>,
    receiver: mpsc::Receiver<Envelope>,
}

impl SubscriberQueue {
    /// Await the next delivered envelope.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }

    /// Take an envelope if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.receiver.try_recv().ok()
    }
}

/// Fan-out publish point with attribute-filtered subscriber queues.
pub struct NotificationTopic {
    subscribers: RwLock<Vec<Subscriber>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Default for NotificationTopic {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationTopic {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            subscribers: RwLock::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Register a new subscriber queue with the given filter.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        filter: MessageFilter,
        capacity: usize,
    ) -> SubscriberQueue {
        let name = name.into();
        let (sender, receiver) = mpsc::channel(capacity);

        info!(queue = %name, filter = ?filter, "Subscribing queue to topic");
        self.subscribers
            .write()
            .expect("subscriber registry poisoned")
            .push(Subscriber {
                name: name.clone(),
                filter,
                sender: sender.clone(),
            });

        SubscriberQueue {
            name,
            sender,
            receiver,
        }
    }

    /// Publish an envelope to every queue whose filter matches its kind.
    ///
    /// Returns the number of queues the message was delivered to; zero
    /// matches is not an error.
    #[instrument(skip(self, envelope), fields(message_id = %envelope.id, kind = %envelope.kind()))]
    pub async fn publish(&self, envelope: Envelope) -> Result<usize, TopicError> {
        let kind = envelope.kind();

        // Senders are cloned out so no lock is held across the awaits below.
        let matching: Vec<(String, mpsc::Sender<Envelope>)> = {
            let subscribers = self
                .subscribers
                .read()
                .expect("subscriber registry poisoned");
            subscribers
                .iter()
                .filter(|s| s.filter.matches(kind))
                .map(|s| (s.name.clone(), s.sender.clone()))
                .collect()
        };

        if matching.is_empty() {
            debug!(kind = %kind, "No subscriber filter matched, dropping publish");
            metrics::counter!("pipeline.topic.unrouted").increment(1);
            return Ok(0);
        }

        let mut delivered = 0;
        for (name, sender) in matching {
            if sender.send(envelope.clone()).await.is_err() {
                warn!(queue = %name, "Subscriber queue closed during delivery");
                return Err(TopicError::QueueClosed(name));
            }
            delivered += 1;
        }

        metrics::counter!("pipeline.topic.published").increment(1);
        debug!(delivered = delivered, "Envelope fanned out");
        Ok(delivered)
    }

    /// Get a shutdown receiver for queue workers.
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal all queue workers to stop.
    pub fn shutdown(&self) {
        info!("Signaling topic shutdown");
        let _ = self.shutdown_tx.send(());
    }
}

/// Process one delivered batch with per-item isolation.
///
/// A failing item is recorded and never aborts its siblings; the returned
/// [`BatchSummary`] names what succeeded, what was dropped, and what should
/// be redelivered.
pub async fn process_batch(handler: &dyn EventHandler, batch: &[Envelope]) -> BatchSummary {
    let mut summary = BatchSummary::with_capacity(batch.len());

    for envelope in batch {
        match handler.handle(envelope).await {
            Ok(()) => {
                metrics::counter!("pipeline.messages.processed").increment(1);
                summary.record(envelope.id, ItemOutcome::Succeeded, None);
            }
            Err(e) => {
                let outcome = e.outcome();
                match outcome {
                    ItemOutcome::Retry => {
                        warn!(
                            handler = handler.name(),
                            message_id = %envelope.id,
                            attempt = envelope.attempt,
                            error = %e,
                            "Message failed, will redeliver"
                        );
                        metrics::counter!("pipeline.messages.retried").increment(1);
                    }
                    _ => {
                        warn!(
                            handler = handler.name(),
                            message_id = %envelope.id,
                            error = %e,
                            "Message dropped"
                        );
                        metrics::counter!("pipeline.messages.dropped").increment(1);
                    }
                }
                summary.record(envelope.id, outcome, Some(e.to_string()));
            }
        }
    }

    summary
}

/// Drains one subscriber queue in batches and feeds them to its handler.
pub struct QueueWorker {
    name: String,
    receiver: mpsc::Receiver<Envelope>,
    redeliver: mpsc::Sender<Envelope>,
    handler: Arc<dyn EventHandler>,
    batch_size: usize,
    max_attempts: u32,
    shutdown: broadcast::Receiver<()>,
}

impl QueueWorker {
    pub fn new(
        queue: SubscriberQueue,
        handler: Arc<dyn EventHandler>,
        settings: &QueueSettings,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            name: queue.name,
            receiver: queue.receiver,
            redeliver: queue.sender,
            handler,
            batch_size: settings.batch_size.max(1),
            max_attempts: settings.max_attempts.max(1),
            shutdown,
        }
    }

    /// Run until the queue closes or shutdown is signaled.
    pub async fn run(mut self) {
        info!(queue = %self.name, handler = self.handler.name(), "Queue worker started");

        while let Some(batch) = self.next_batch().await {
            let summary = process_batch(self.handler.as_ref(), &batch).await;
            self.redeliver_failures(&batch, &summary);

            debug!(
                queue = %self.name,
                succeeded = summary.succeeded(),
                dropped = summary.dropped(),
                retries = summary.retries(),
                "Batch complete"
            );
        }

        info!(queue = %self.name, "Queue worker stopped");
    }

    /// Await the next message, then drain up to `batch_size` without waiting.
    async fn next_batch(&mut self) -> Option<Vec<Envelope>> {
        let first = tokio::select! {
            _ = self.shutdown.recv() => return None,
            received = self.receiver.recv() => received?,
        };

        let mut batch = vec![first];
        while batch.len() < self.batch_size {
            match self.receiver.try_recv() {
                Ok(envelope) => batch.push(envelope),
                Err(_) => break,
            }
        }
        Some(batch)
    }

    fn redeliver_failures(&self, batch: &[Envelope], summary: &BatchSummary) {
        for (envelope, item) in batch.iter().zip(&summary.items) {
            if item.outcome != ItemOutcome::Retry {
                continue;
            }
            if envelope.attempt >= self.max_attempts {
                error!(
                    queue = %self.name,
                    message_id = %envelope.id,
                    attempts = envelope.attempt,
                    "Delivery attempts exhausted, abandoning message"
                );
                metrics::counter!("pipeline.messages.exhausted").increment(1);
                continue;
            }
            // try_send so a full queue cannot wedge its own worker.
            if self.redeliver.try_send(envelope.next_attempt()).is_err() {
                error!(
                    queue = %self.name,
                    message_id = %envelope.id,
                    "Redelivery queue full or closed, abandoning message"
                );
                metrics::counter!("pipeline.messages.exhausted").increment(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::HandlerError;
    use crate::message::{ObjectCreatedEvent, Payload, StatusUpdateEvent, ReviewStatus};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn object_created(key: &str) -> Envelope {
        Envelope::new(Payload::ObjectCreated(ObjectCreatedEvent {
            bucket: "images".to_string(),
            key: key.to_string(),
        }))
    }

    fn status_update(id: &str) -> Envelope {
        Envelope::new(Payload::StatusUpdate(StatusUpdateEvent {
            id: id.to_string(),
            status: ReviewStatus::Pass,
            reason: String::new(),
        }))
    }

    struct CountingHandler {
        handled: AtomicU32,
        fail_first: u32,
    }

    impl CountingHandler {
        fn new(fail_first: u32) -> Self {
            Self {
                handled: AtomicU32::new(0),
                fail_first,
            }
        }
    }

    #[async_trait::async_trait]
    impl EventHandler for CountingHandler {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn handle(&self, _envelope: &Envelope) -> Result<(), HandlerError> {
            let seen = self.handled.fetch_add(1, Ordering::SeqCst);
            if seen < self.fail_first {
                Err(HandlerError::Transient("simulated outage".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_filter_matching() {
        let allow = MessageFilter::AllowList(vec![MessageKind::StatusUpdate]);
        assert!(allow.matches(MessageKind::StatusUpdate));
        assert!(!allow.matches(MessageKind::Notify));
        assert!(MessageFilter::All.matches(MessageKind::ObjectCreated));
    }

    #[tokio::test]
    async fn test_fan_out_delivers_to_every_matching_queue() {
        let topic = NotificationTopic::new();
        let mut status_queue = topic.subscribe(
            "status",
            MessageFilter::AllowList(vec![MessageKind::StatusUpdate]),
            8,
        );
        let mut legacy_queue = topic.subscribe("legacy", MessageFilter::All, 8);

        let delivered = topic.publish(status_update("img-1")).await.unwrap();
        assert_eq!(delivered, 2);

        assert_eq!(
            status_queue.receiver.recv().await.unwrap().kind(),
            MessageKind::StatusUpdate
        );
        assert_eq!(
            legacy_queue.receiver.recv().await.unwrap().kind(),
            MessageKind::StatusUpdate
        );
    }

    #[tokio::test]
    async fn test_publish_without_matching_subscriber_is_noop() {
        let topic = NotificationTopic::new();
        let _queue = topic.subscribe(
            "metadata",
            MessageFilter::AllowList(vec![MessageKind::MetadataUpdate]),
            8,
        );

        let delivered = topic.publish(status_update("img-1")).await.unwrap();
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_unfiltered_subscriber_receives_all_kinds() {
        let topic = NotificationTopic::new();
        let mut queue = topic.subscribe("legacy", MessageFilter::All, 8);

        topic.publish(object_created("a.jpeg")).await.unwrap();
        topic.publish(status_update("img-1")).await.unwrap();

        assert_eq!(
            queue.receiver.recv().await.unwrap().kind(),
            MessageKind::ObjectCreated
        );
        assert_eq!(
            queue.receiver.recv().await.unwrap().kind(),
            MessageKind::StatusUpdate
        );
    }

    #[tokio::test]
    async fn test_batch_isolation_one_failure_does_not_abort_siblings() {
        struct FailOn {
            key: String,
        }

        #[async_trait::async_trait]
        impl EventHandler for FailOn {
            fn name(&self) -> &'static str {
                "fail-on"
            }

            async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
                match &envelope.payload {
                    Payload::ObjectCreated(e) if e.key == self.key => {
                        Err(HandlerError::Validation("poisoned".to_string()))
                    }
                    _ => Ok(()),
                }
            }
        }

        let handler = FailOn {
            key: "bad.jpeg".to_string(),
        };
        let batch = vec![
            object_created("a.jpeg"),
            object_created("bad.jpeg"),
            object_created("b.jpeg"),
        ];

        let summary = process_batch(&handler, &batch).await;
        assert_eq!(summary.succeeded(), 2);
        assert_eq!(summary.dropped(), 1);
        assert_eq!(summary.retries(), 0);
    }

    #[tokio::test]
    async fn test_worker_redelivers_transient_failures() {
        let topic = NotificationTopic::new();
        let queue = topic.subscribe("ingest", MessageFilter::All, 8);
        let handler = Arc::new(CountingHandler::new(2));
        let settings = QueueSettings {
            capacity: 8,
            batch_size: 1,
            max_attempts: 5,
        };

        let worker = QueueWorker::new(queue, handler.clone(), &settings, topic.shutdown_receiver());
        let worker_handle = tokio::spawn(worker.run());

        topic.publish(object_created("retry.jpeg")).await.unwrap();

        // Two failures then a success: three handler invocations in total.
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while handler.handled.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("message was not redelivered to completion");

        topic.shutdown();
        worker_handle.await.unwrap();
        assert_eq!(handler.handled.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_worker_abandons_after_max_attempts() {
        let topic = NotificationTopic::new();
        let queue = topic.subscribe("ingest", MessageFilter::All, 8);
        let handler = Arc::new(CountingHandler::new(u32::MAX));
        let settings = QueueSettings {
            capacity: 8,
            batch_size: 1,
            max_attempts: 3,
        };

        let worker = QueueWorker::new(queue, handler.clone(), &settings, topic.shutdown_receiver());
        let worker_handle = tokio::spawn(worker.run());

        topic.publish(object_created("doomed.jpeg")).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while handler.handled.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("message never reached max attempts");

        // Give the worker a moment to prove no fourth attempt arrives.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(handler.handled.load(Ordering::SeqCst), 3);

        topic.shutdown();
        worker_handle.await.unwrap();
    }
}
