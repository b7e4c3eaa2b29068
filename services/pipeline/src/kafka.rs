//! Kafka wire bridge.
//!
//! External publishers (review tooling, storage notifications) produce to a
//! single inbound topic with the `message-type` attribute carried as a
//! header. The [`IngressBridge`] consumes that topic, classifies each wire
//! message exactly once through the codec, and hands the typed envelope to
//! the in-process notification topic for filtered fan-out.

use crate::config::KafkaConfig;
use crate::message::{self, Envelope, Payload};
use crate::topic::NotificationTopic;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur on the wire bridge.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("Failed to create Kafka client: {0}")]
    Creation(String),

    #[error("Failed to subscribe to topic: {0}")]
    Subscription(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    Send { topic: String, message: String },
}

fn base_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();

    client_config
        .set("bootstrap.servers", &config.bootstrap_servers)
        .set("client.id", &config.client_id);

    if config.ssl_enabled {
        client_config.set("security.protocol", "SASL_SSL");
        if let Some(ref ca_location) = config.ssl_ca_location {
            client_config.set("ssl.ca.location", ca_location);
        }
    }

    if let (Some(ref username), Some(ref password)) =
        (&config.sasl_username, &config.sasl_password)
    {
        client_config
            .set("sasl.mechanisms", "PLAIN")
            .set("sasl.username", username)
            .set("sasl.password", password);
    }

    client_config
}

/// Producer publishing typed payloads to the inbound wire topic.
///
/// Used by the CLI publisher; the wire body/header mapping is the contract
/// external tools rely on.
pub struct WirePublisher {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl WirePublisher {
    pub fn new(config: &KafkaConfig) -> Result<Self, WireError> {
        info!("Creating Kafka producer for {}", config.bootstrap_servers);

        let mut client_config = base_client_config(config);
        client_config
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set(
                "request.timeout.ms",
                config.request_timeout_ms.to_string(),
            );

        let producer: FutureProducer = client_config
            .create()
            .map_err(|e| WireError::Creation(e.to_string()))?;

        Ok(Self {
            producer,
            topic: config.inbound_topic.clone(),
            timeout: Duration::from_millis(config.request_timeout_ms),
        })
    }

    /// Publish a payload to the wire topic with its attribute headers.
    #[instrument(skip(self, payload), fields(kind = %payload.kind()))]
    pub async fn publish(&self, payload: &Payload) -> Result<(), WireError> {
        let (body, headers) = message::encode_wire(payload);

        let mut owned_headers = OwnedHeaders::new();
        for (key, value) in &headers {
            owned_headers = owned_headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let key = partition_key(payload);
        let mut record = FutureRecord::to(&self.topic)
            .payload(&body)
            .headers(owned_headers);
        if let Some(ref k) = key {
            record = record.key(k);
        }

        self.producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| WireError::Send {
                topic: self.topic.clone(),
                message: e.to_string(),
            })?;

        debug!(topic = %self.topic, "Wire message published");
        Ok(())
    }

    /// Flush all pending messages.
    pub fn flush(&self, timeout: Duration) -> Result<(), WireError> {
        use rdkafka::producer::Producer;
        self.producer.flush(Timeout::After(timeout)).map_err(|e| WireError::Send {
            topic: self.topic.clone(),
            message: e.to_string(),
        })
    }
}

/// Partition key: the record id where the payload carries one, so events for
/// the same image land in order on one partition.
fn partition_key(payload: &Payload) -> Option<String> {
    match payload {
        Payload::ObjectCreated(e) => Some(e.key.clone()),
        Payload::StatusUpdate(e) => Some(e.id.clone()),
        Payload::MetadataUpdate(e) => Some(e.id.clone()),
        Payload::InvalidImage(e) => Some(e.id.clone()),
        Payload::Notify(e) => Some(e.image_id.clone()),
    }
}

/// Consumes the inbound wire topic and feeds the notification topic.
pub struct IngressBridge {
    consumer: StreamConsumer,
    topic: Arc<NotificationTopic>,
}

impl IngressBridge {
    pub fn new(config: &KafkaConfig, topic: Arc<NotificationTopic>) -> Result<Self, WireError> {
        let mut client_config = base_client_config(config);
        client_config
            .set("group.id", &config.group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set(
                "max.poll.interval.ms",
                config.max_poll_interval_ms.to_string(),
            );

        let consumer: StreamConsumer = client_config
            .create()
            .map_err(|e| WireError::Creation(e.to_string()))?;

        consumer
            .subscribe(&[&config.inbound_topic])
            .map_err(|e| WireError::Subscription(e.to_string()))?;

        info!(
            topic = %config.inbound_topic,
            group = %config.group_id,
            "Subscribed to inbound wire topic"
        );

        Ok(Self { consumer, topic })
    }

    /// Start consuming and routing wire messages.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), WireError> {
        info!("Starting ingress bridge");

        let mut message_stream = self.consumer.stream();

        while let Some(message_result) = message_stream.next().await {
            match message_result {
                Ok(wire_message) => {
                    self.route_message(&wire_message).await;
                    if let Err(e) = self.consumer.commit_message(&wire_message, CommitMode::Async) {
                        warn!(error = %e, "Failed to commit offset");
                    }
                }
                Err(e) => {
                    error!(error = %e, "Kafka consumer error");
                    metrics::counter!("pipeline.kafka.errors").increment(1);
                }
            }
        }

        Ok(())
    }

    /// Decode one wire message and publish it in-process.
    ///
    /// A message that fails decoding is permanently unprocessable: it is
    /// logged, counted, and committed past, with no side effects.
    async fn route_message(&self, wire_message: &BorrowedMessage<'_>) {
        let headers = header_map(wire_message);
        let body = wire_message.payload().unwrap_or(&[]);

        match message::decode_wire(&headers, body) {
            Ok(payload) => {
                let envelope = Envelope::new(payload);
                debug!(
                    message_id = %envelope.id,
                    kind = %envelope.kind(),
                    partition = wire_message.partition(),
                    offset = wire_message.offset(),
                    "Wire message classified"
                );
                if let Err(e) = self.topic.publish(envelope).await {
                    error!(error = %e, "Failed to fan out wire message");
                }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    partition = wire_message.partition(),
                    offset = wire_message.offset(),
                    "Dropping unprocessable wire message"
                );
                metrics::counter!("pipeline.wire.rejected").increment(1);
            }
        }
    }
}

/// Collect a message's headers into a string map for the codec.
fn header_map(wire_message: &BorrowedMessage<'_>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(headers) = wire_message.headers() {
        for header in headers.iter() {
            if let Some(value) = header.value {
                if let Ok(text) = String::from_utf8(value.to_vec()) {
                    map.insert(header.key.to_string(), text);
                }
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{InvalidAction, InvalidImageEvent, StatusUpdateEvent, ReviewStatus};

    #[test]
    fn test_partition_key_follows_record_identity() {
        let status = Payload::StatusUpdate(StatusUpdateEvent {
            id: "img-1".to_string(),
            status: ReviewStatus::Pass,
            reason: String::new(),
        });
        assert_eq!(partition_key(&status).as_deref(), Some("img-1"));

        let invalid = Payload::InvalidImage(InvalidImageEvent {
            id: "img-2".to_string(),
            reason: String::new(),
            action: InvalidAction::MarkInvalid,
        });
        assert_eq!(partition_key(&invalid).as_deref(), Some("img-2"));
    }
}
