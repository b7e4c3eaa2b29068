//! Notification handler: the terminal email sink.

use super::{EventHandler, HandlerError};
use crate::mailer::{is_email_address, Mailer};
use crate::message::{Envelope, NotifyEvent, ObjectCreatedEvent, Payload, ReviewStatus};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Sends status-change and upload-received emails.
///
/// This handler holds no publisher handle at all: it cannot re-enter the
/// topic, which is what breaks notification loops.
pub struct NotifyHandler {
    mailer: Arc<dyn Mailer>,
    fallback_address: String,
}

impl NotifyHandler {
    pub fn new(mailer: Arc<dyn Mailer>, fallback_address: impl Into<String>) -> Self {
        Self {
            mailer,
            fallback_address: fallback_address.into(),
        }
    }

    #[instrument(skip(self, event), fields(id = %event.image_id))]
    async fn send_status_email(&self, event: &NotifyEvent) -> Result<(), HandlerError> {
        let to = event
            .photographer_email
            .as_deref()
            .filter(|address| is_email_address(address))
            .unwrap_or(&self.fallback_address);

        let status_text = match event.new_status {
            ReviewStatus::Pass => "approved",
            ReviewStatus::Reject => "rejected",
        };
        let subject = format!("Your image has been {status_text}");

        let object_name = event
            .object_locator
            .as_ref()
            .map(|locator| locator.key.clone())
            .unwrap_or_else(|| event.image_id.clone());
        let reason_line = if event.reason.is_empty() {
            String::new()
        } else {
            format!("<p>Reason: {}</p>", event.reason)
        };
        let body = format!(
            "<html><body>\
             <h2>Image Status Update</h2>\
             <p>Your image ({object_name}) has been <strong>{status_text}</strong>.</p>\
             {reason_line}\
             <p>Thank you for using our service.</p>\
             </body></html>"
        );

        self.mailer.send(to, &subject, &body).await?;
        info!(to = %to, status = %event.new_status, "Status email sent");
        Ok(())
    }

    #[instrument(skip(self, event), fields(key = %event.key))]
    async fn send_upload_ack(&self, event: &ObjectCreatedEvent) -> Result<(), HandlerError> {
        let body = format!(
            "<html><body>\
             <h2>New Upload</h2>\
             <p>We received your image. Its URL is s3://{}/{}</p>\
             </body></html>",
            event.bucket, event.key
        );

        self.mailer
            .send(&self.fallback_address, "New image Upload", &body)
            .await?;
        info!(key = %event.key, "Upload acknowledgement sent");
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventHandler for NotifyHandler {
    fn name(&self) -> &'static str {
        "notify"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        match &envelope.payload {
            Payload::Notify(event) => self.send_status_email(event).await,
            Payload::ObjectCreated(event) => self.send_upload_ack(event).await,
            other => {
                debug!(kind = %other.kind(), "Ignoring unexpected payload on notify queue");
                Ok(())
            }
        }
    }
}
