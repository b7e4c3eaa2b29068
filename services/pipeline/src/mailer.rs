//! Outbound email capability.
//!
//! Production sends go through an HTTP mail relay; tests use the recording
//! in-memory mailer.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Errors surfaced while sending mail. All are retryable.
#[derive(Error, Debug)]
pub enum MailError {
    #[error("Mail relay request failed: {0}")]
    Request(String),

    #[error("Mail relay returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Email delivery capability.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<(), MailError>;
}

/// Syntactic email check: one `@` with a non-empty local part and a dotted,
/// whitespace-free domain. Matches the shape the review tooling accepts;
/// anything else falls back to the configured notification address.
pub fn is_email_address(value: &str) -> bool {
    let mut parts = value.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    if local.is_empty() || domain.is_empty() {
        return false;
    }
    if value.chars().any(char::is_whitespace) {
        return false;
    }
    let (host, tld) = match domain.rsplit_once('.') {
        Some(split) => split,
        None => return false,
    };
    !host.is_empty() && !tld.is_empty()
}

#[derive(Serialize)]
struct RelayRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html: &'a str,
}

/// Mailer that POSTs messages to an HTTP mail relay.
pub struct HttpMailer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    sender: String,
}

impl HttpMailer {
    pub fn new(config: &crate::config::MailerConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build HTTP client: {}", e);
                reqwest::Client::new()
            });

        info!(endpoint = %config.endpoint, sender = %config.sender, "Mail relay client initialized");

        Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            sender: config.sender.clone(),
        }
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<(), MailError> {
        let request = RelayRequest {
            from: &self.sender,
            to,
            subject,
            html: html_body,
        };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| MailError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(MailError::Rejected { status, body });
        }

        debug!(to = %to, subject = %subject, "Email accepted by relay");
        metrics::counter!("pipeline.emails.sent").increment(1);
        Ok(())
    }
}

/// A sent message captured by [`MemoryMailer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub html_body: String,
}

/// Recording mailer used by tests.
#[derive(Default)]
pub struct MemoryMailer {
    sent: tokio::sync::Mutex<Vec<SentMail>>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<(), MailError> {
        self.sent.lock().await.push(SentMail {
            to: to.to_string(),
            subject: subject.to_string(),
            html_body: html_body.to_string(),
        });
        Ok(())
    }
}
