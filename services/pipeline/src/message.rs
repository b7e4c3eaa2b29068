//! Message kinds, payloads, and the wire codec for the Darkroom pipeline.
//!
//! Every event in the system is represented as an [`Envelope`] carrying a
//! typed [`Payload`]. The envelope's kind discriminator is fixed when the
//! envelope is built and is the only thing routing ever looks at; payload
//! shapes are inspected exactly once, in [`decode_wire`], when a raw wire
//! message enters the process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Wire attribute values carried in the `message-type` header.
pub const ATTR_STATUS_UPDATE: &str = "STATUS_UPDATE";
pub const ATTR_METADATA_UPDATE: &str = "METADATA_UPDATE";
pub const ATTR_INVALID_IMAGE: &str = "INVALID_IMAGE";

/// Header carrying the message type attribute.
pub const HEADER_MESSAGE_TYPE: &str = "message-type";
/// Header carrying the out-of-band metadata type for metadata updates.
pub const HEADER_METADATA_TYPE: &str = "metadata_type";

/// Errors produced while decoding or validating a wire message.
///
/// Every variant marks the message as permanently unprocessable: it is
/// dropped, logged, and never retried.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Message payload is not valid JSON: {0}")]
    MalformedJson(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid status value: {0} (must be 'Pass' or 'Reject')")]
    InvalidStatus(String),

    #[error("Invalid or missing metadata type: {0:?}")]
    InvalidMetadataType(Option<String>),

    #[error("Invalid action value: {0}")]
    InvalidAction(String),

    #[error("Unknown message type attribute: {0}")]
    UnknownMessageType(String),
}

/// The five message kinds routed by the notification topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    ObjectCreated,
    StatusUpdate,
    MetadataUpdate,
    InvalidImage,
    Notify,
}

impl MessageKind {
    /// The `message-type` attribute this kind carries on the wire.
    ///
    /// Object-created events are raw storage notifications and carry no
    /// attribute; internally-generated notify events reuse the legacy
    /// `STATUS_UPDATE` attribute with an inner tag (see [`decode_wire`]).
    pub fn wire_attribute(&self) -> Option<&'static str> {
        match self {
            MessageKind::ObjectCreated => None,
            MessageKind::StatusUpdate | MessageKind::Notify => Some(ATTR_STATUS_UPDATE),
            MessageKind::MetadataUpdate => Some(ATTR_METADATA_UPDATE),
            MessageKind::InvalidImage => Some(ATTR_INVALID_IMAGE),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::ObjectCreated => "object_created",
            MessageKind::StatusUpdate => "status_update",
            MessageKind::MetadataUpdate => "metadata_update",
            MessageKind::InvalidImage => "invalid_image",
            MessageKind::Notify => "notify",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectLocator {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocator {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// `s3://bucket/key` form used in notification bodies.
    pub fn url(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }
}

/// Review outcome carried by a status-update event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewStatus {
    Pass,
    Reject,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pass => "Pass",
            ReviewStatus::Reject => "Reject",
        }
    }

    fn parse(value: &str) -> Result<Self, CodecError> {
        match value {
            "Pass" => Ok(ReviewStatus::Pass),
            "Reject" => Ok(ReviewStatus::Reject),
            other => Err(CodecError::InvalidStatus(other.to_string())),
        }
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Annotation categories accepted by metadata updates.
///
/// Wire values are matched case-sensitively (`Caption`, `Date`, `name`) and
/// lowercased when merged into a record's metadata map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataKind {
    Caption,
    Date,
    Name,
}

impl MetadataKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Caption" => Some(MetadataKind::Caption),
            "Date" => Some(MetadataKind::Date),
            "name" => Some(MetadataKind::Name),
            _ => None,
        }
    }

    /// The lowercase key under which this annotation is stored.
    pub fn record_key(&self) -> &'static str {
        match self {
            MetadataKind::Caption => "caption",
            MetadataKind::Date => "date",
            MetadataKind::Name => "name",
        }
    }

    /// The wire spelling used in the `metadata_type` attribute.
    pub fn wire_value(&self) -> &'static str {
        match self {
            MetadataKind::Caption => "Caption",
            MetadataKind::Date => "Date",
            MetadataKind::Name => "name",
        }
    }
}

/// Action requested by an invalid-image event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidAction {
    MarkInvalid,
    DeleteRecord,
}

impl InvalidAction {
    pub fn wire_value(&self) -> &'static str {
        match self {
            InvalidAction::MarkInvalid => "MARK_INVALID",
            InvalidAction::DeleteRecord => "DELETE_RECORD",
        }
    }

    fn parse(value: &str) -> Result<Self, CodecError> {
        match value {
            "MARK_INVALID" => Ok(InvalidAction::MarkInvalid),
            "DELETE_RECORD" => Ok(InvalidAction::DeleteRecord),
            other => Err(CodecError::InvalidAction(other.to_string())),
        }
    }
}

/// A new object landed in the bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectCreatedEvent {
    pub bucket: String,
    pub key: String,
}

/// A reviewer accepted or rejected an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdateEvent {
    pub id: String,
    pub status: ReviewStatus,
    #[serde(default)]
    pub reason: String,
}

/// An annotation for a single metadata key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataUpdateEvent {
    pub id: String,
    // The envelope tag owns the `kind` key.
    #[serde(rename = "metadataType")]
    pub kind: MetadataKind,
    pub value: String,
}

/// An image was flagged as invalid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidImageEvent {
    pub id: String,
    #[serde(default)]
    pub reason: String,
    pub action: InvalidAction,
}

/// Internally-generated notification of a completed status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyEvent {
    pub image_id: String,
    pub new_status: ReviewStatus,
    #[serde(default)]
    pub reason: String,
    pub photographer_email: Option<String>,
    pub object_locator: Option<ObjectLocator>,
}

/// Typed payload of an envelope. The variant is the kind discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    ObjectCreated(ObjectCreatedEvent),
    StatusUpdate(StatusUpdateEvent),
    MetadataUpdate(MetadataUpdateEvent),
    InvalidImage(InvalidImageEvent),
    Notify(NotifyEvent),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::ObjectCreated(_) => MessageKind::ObjectCreated,
            Payload::StatusUpdate(_) => MessageKind::StatusUpdate,
            Payload::MetadataUpdate(_) => MessageKind::MetadataUpdate,
            Payload::InvalidImage(_) => MessageKind::InvalidImage,
            Payload::Notify(_) => MessageKind::Notify,
        }
    }
}

/// A routable message: typed payload plus delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique id of this message, assigned at publish.
    pub id: Uuid,
    pub payload: Payload,
    /// When the envelope was first published.
    pub published_at: DateTime<Utc>,
    /// Delivery attempt, starting at 1. Incremented on re-enqueue.
    pub attempt: u32,
}

impl Envelope {
    pub fn new(payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            published_at: Utc::now(),
            attempt: 1,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Copy of this envelope with the attempt counter bumped, for
    /// re-enqueueing after a transient failure.
    pub fn next_attempt(&self) -> Self {
        let mut redelivery = self.clone();
        redelivery.attempt += 1;
        redelivery
    }
}

/// Legacy notify echo shape: `STATUS_UPDATE` attribute with an inner tag.
///
/// Only the ingress codec knows about this shape; once classified, the
/// envelope kind is authoritative everywhere else.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyNotifyWire {
    #[serde(rename = "type")]
    inner_type: String,
    image_id: String,
    new_status: String,
    #[serde(default)]
    reason: String,
    photographer_email: Option<String>,
    object_locator: Option<ObjectLocator>,
}

#[derive(Debug, Deserialize)]
struct StatusUpdateWire {
    id: String,
    status: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct MetadataUpdateWire {
    id: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct InvalidImageWire {
    id: String,
    #[serde(default)]
    reason: String,
    action: String,
}

#[derive(Debug, Deserialize)]
struct ObjectCreatedWire {
    bucket: String,
    key: String,
}

/// Decode a raw wire message (headers + JSON body) into a typed payload.
///
/// This is the single point where payload shapes are inspected. Messages
/// that fail here are permanently unprocessable and must be dropped by the
/// caller with no side effects.
pub fn decode_wire(
    headers: &HashMap<String, String>,
    body: &[u8],
) -> Result<Payload, CodecError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| CodecError::MalformedJson(e.to_string()))?;

    match headers.get(HEADER_MESSAGE_TYPE).map(String::as_str) {
        Some(ATTR_STATUS_UPDATE) => decode_status_or_notify(value),
        Some(ATTR_METADATA_UPDATE) => {
            let kind = headers
                .get(HEADER_METADATA_TYPE)
                .and_then(|v| MetadataKind::parse(v))
                .ok_or_else(|| {
                    CodecError::InvalidMetadataType(headers.get(HEADER_METADATA_TYPE).cloned())
                })?;
            let wire: MetadataUpdateWire = serde_json::from_value(value)
                .map_err(|_| CodecError::MissingField("id/value"))?;
            if wire.id.is_empty() {
                return Err(CodecError::MissingField("id"));
            }
            if wire.value.is_empty() {
                return Err(CodecError::MissingField("value"));
            }
            Ok(Payload::MetadataUpdate(MetadataUpdateEvent {
                id: wire.id,
                kind,
                value: wire.value,
            }))
        }
        Some(ATTR_INVALID_IMAGE) => {
            let wire: InvalidImageWire = serde_json::from_value(value)
                .map_err(|_| CodecError::MissingField("id/action"))?;
            if wire.id.is_empty() {
                return Err(CodecError::MissingField("id"));
            }
            let action = InvalidAction::parse(&wire.action)?;
            Ok(Payload::InvalidImage(InvalidImageEvent {
                id: wire.id,
                reason: wire.reason,
                action,
            }))
        }
        Some(other) => Err(CodecError::UnknownMessageType(other.to_string())),
        // No attribute: raw storage notification.
        None => {
            let wire: ObjectCreatedWire = serde_json::from_value(value)
                .map_err(|_| CodecError::MissingField("bucket/key"))?;
            Ok(Payload::ObjectCreated(ObjectCreatedEvent {
                bucket: wire.bucket,
                key: wire.key,
            }))
        }
    }
}

/// Classify a `STATUS_UPDATE`-attributed body as either an external status
/// update or the legacy internal notify echo.
fn decode_status_or_notify(value: serde_json::Value) -> Result<Payload, CodecError> {
    // The echo carries an inner `type` tag; an external update does not.
    if value.get("type").and_then(|t| t.as_str()) == Some(ATTR_STATUS_UPDATE) {
        let wire: LegacyNotifyWire = serde_json::from_value(value)
            .map_err(|_| CodecError::MissingField("imageId/newStatus"))?;
        let new_status = ReviewStatus::parse(&wire.new_status)?;
        return Ok(Payload::Notify(NotifyEvent {
            image_id: wire.image_id,
            new_status,
            reason: wire.reason,
            photographer_email: wire.photographer_email,
            object_locator: wire.object_locator,
        }));
    }

    let wire: StatusUpdateWire =
        serde_json::from_value(value).map_err(|_| CodecError::MissingField("id/status"))?;
    if wire.id.is_empty() {
        return Err(CodecError::MissingField("id"));
    }
    let status = ReviewStatus::parse(&wire.status)?;
    Ok(Payload::StatusUpdate(StatusUpdateEvent {
        id: wire.id,
        status,
        reason: wire.reason,
    }))
}

/// Encode a payload into its wire body and headers.
///
/// This is the inverse of [`decode_wire`] and is what the CLI publisher and
/// any future egress path use; the attribute/payload mapping is the wire
/// contract external tools rely on.
pub fn encode_wire(payload: &Payload) -> (Vec<u8>, Vec<(String, String)>) {
    let mut headers = Vec::new();
    if let Some(attr) = payload.kind().wire_attribute() {
        headers.push((HEADER_MESSAGE_TYPE.to_string(), attr.to_string()));
    }

    let body = match payload {
        Payload::ObjectCreated(e) => serde_json::json!({
            "bucket": e.bucket,
            "key": e.key,
        }),
        Payload::StatusUpdate(e) => serde_json::json!({
            "id": e.id,
            "status": e.status.as_str(),
            "reason": e.reason,
        }),
        Payload::MetadataUpdate(e) => {
            headers.push((
                HEADER_METADATA_TYPE.to_string(),
                e.kind.wire_value().to_string(),
            ));
            serde_json::json!({
                "id": e.id,
                "value": e.value,
            })
        }
        Payload::InvalidImage(e) => serde_json::json!({
            "id": e.id,
            "reason": e.reason,
            "action": e.action.wire_value(),
        }),
        Payload::Notify(e) => serde_json::json!({
            "type": ATTR_STATUS_UPDATE,
            "imageId": e.image_id,
            "newStatus": e.new_status.as_str(),
            "reason": e.reason,
            "photographerEmail": e.photographer_email,
            "objectLocator": e.object_locator,
        }),
    };

    (serde_json::to_vec(&body).unwrap_or_default(), headers)
}
