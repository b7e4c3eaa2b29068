//! Darkroom Pipeline
//!
//! Event routing and state-transition engine for the Darkroom photo album.
//! Uploaded images are cataloged, reviewed (approved/rejected), annotated,
//! or purged, with email notifications on key transitions. Delivery is
//! at-least-once and possibly reordered or duplicated, so every handler is
//! written to be idempotent over field-level record updates.
//!
//! ## Architecture
//!
//! ```text
//! Kafka wire topic          Notification Topic            Record Store
//! ┌──────────────┐  decode  ┌──────────────────┐          ┌────────────┐
//! │ darkroom.    │─────────▶│ filtered fan-out │          │ images     │
//! │ events       │   once   └──────────────────┘          └────────────┘
//! └──────────────┘            │  │  │  │  │                     ▲
//!                       ┌─────┘  │  │  │  └──────┐              │
//!                       ▼        ▼  ▼  ▼         ▼              │
//!                  ┌────────┐ ┌──────────────┐ ┌────────┐       │
//!                  │ ingest │ │ status/meta/ │ │ notify │───▶ email
//!                  │        │ │ invalid      │ │        │
//!                  └────────┘ └──────────────┘ └────────┘
//!                       │          │    │
//!                       ▼          ▼    ▼
//!                   S3 bucket   record patches (idempotent)
//! ```
//!
//! The status handler republishes a notify event through the topic; the
//! notification handler is a terminal sink with no publisher handle, which
//! is what prevents notification loops.

pub mod batch;
pub mod config;
pub mod filter_api;
pub mod handlers;
pub mod kafka;
pub mod mailer;
pub mod message;
pub mod object_store;
pub mod pipeline;
pub mod record;
pub mod topic;

pub use batch::{BatchSummary, ItemOutcome, ItemResult};
pub use config::Config;
pub use handlers::{EventHandler, HandlerError};
pub use mailer::{HttpMailer, Mailer, MemoryMailer};
pub use message::{Envelope, MessageKind, Payload};
pub use object_store::{MemoryObjectStore, ObjectStore, S3ObjectStore};
pub use pipeline::{Capabilities, Pipeline};
pub use record::{FilterCriteria, ImageRecord, ImageStatus, MemoryRecordStore, PgRecordStore, RecordStore};
pub use topic::{MessageFilter, NotificationTopic, QueueSettings};
