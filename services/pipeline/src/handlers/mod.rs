//! Event handlers for the moderation pipeline.
//!
//! Each queue feeds exactly one handler. Handlers are stateless between
//! invocations: every piece of state they touch lives in the record store,
//! and every write is a conditional field-level update, so re-delivering any
//! event is harmless.

pub mod ingest;
pub mod invalid;
pub mod metadata;
pub mod notify;
pub mod status;

pub use ingest::IngestHandler;
pub use invalid::InvalidImageHandler;
pub use metadata::MetadataHandler;
pub use notify::NotifyHandler;
pub use status::StatusHandler;

use crate::batch::ItemOutcome;
use crate::message::Envelope;
use thiserror::Error;

/// Errors a handler can surface for a single message.
///
/// The variants map one-to-one onto the per-item outcomes: validation and
/// not-found failures drop the message (retrying cannot fix them), while
/// transient infrastructure failures mark it for redelivery.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transient failure: {0}")]
    Transient(String),
}

impl HandlerError {
    /// The batch outcome this error maps to.
    pub fn outcome(&self) -> ItemOutcome {
        match self {
            HandlerError::Validation(_) | HandlerError::NotFound(_) => ItemOutcome::Dropped,
            HandlerError::Transient(_) => ItemOutcome::Retry,
        }
    }
}

impl From<crate::record::StoreError> for HandlerError {
    fn from(err: crate::record::StoreError) -> Self {
        HandlerError::Transient(err.to_string())
    }
}

impl From<crate::mailer::MailError> for HandlerError {
    fn from(err: crate::mailer::MailError) -> Self {
        HandlerError::Transient(err.to_string())
    }
}

/// A stateless unit of processing invoked per queued message.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Handler name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Process a single envelope.
    ///
    /// Handlers on unfiltered subscriptions receive kinds other than their
    /// own and must ignore them with `Ok(())` rather than an error.
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}
