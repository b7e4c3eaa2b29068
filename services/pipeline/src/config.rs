use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the pipeline service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka wire bridge configuration
    pub kafka: KafkaConfig,
    /// Queue and worker tuning
    #[serde(default)]
    pub queues: QueueTuning,
    /// S3 configuration
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Mail relay configuration
    pub mailer: MailerConfig,
    /// Filter API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Kafka configuration for the ingress bridge and CLI publisher.
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Consumer group ID
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Client ID
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Inbound topic carrying all domain events
    #[serde(default = "default_inbound_topic")]
    pub inbound_topic: String,
    /// Auto offset reset policy
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Max poll interval in milliseconds
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
    /// Producer request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
}

/// Tuning for the routed queues and their workers.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueTuning {
    /// Buffered capacity per queue
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    /// Maximum messages per delivered batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Delivery attempts before a transiently-failing item is abandoned
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Mail relay configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MailerConfig {
    /// Mail relay endpoint URL
    pub endpoint: String,
    /// Bearer token for the relay
    pub api_key: Option<String>,
    /// Sender address
    #[serde(default = "default_sender")]
    pub sender: String,
    /// Destination used when a record has no usable photographer address
    #[serde(default = "default_fallback_address")]
    pub fallback_address: String,
    /// Request timeout in seconds
    #[serde(default = "default_mail_timeout_secs")]
    pub timeout_secs: u64,
}

/// Filter API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions

fn default_service_name() -> String {
    "darkroom-pipeline".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_group_id() -> String {
    "darkroom-pipeline".to_string()
}

fn default_client_id() -> String {
    "darkroom-pipeline".to_string()
}

fn default_inbound_topic() -> String {
    "darkroom.events".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_max_poll_interval_ms() -> u32 {
    300000
}

fn default_request_timeout_ms() -> u64 {
    30000
}

fn default_queue_capacity() -> usize {
    256
}

fn default_batch_size() -> usize {
    5
}

fn default_max_attempts() -> u32 {
    5
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_sender() -> String {
    "no-reply@darkroom.local".to_string()
}

fn default_fallback_address() -> String {
    "moderation@darkroom.local".to_string()
}

fn default_mail_timeout_secs() -> u64 {
    10
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from defaults, optional files, and environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/pipeline").required(false))
            .add_source(config::File::with_name("/etc/darkroom/pipeline").required(false))
            // DARKROOM__KAFKA__BOOTSTRAP_SERVERS -> kafka.bootstrap_servers
            .add_source(
                config::Environment::with_prefix("DARKROOM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Producer request timeout as Duration
    pub fn kafka_request_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka.request_timeout_ms)
    }

    /// Queue settings for the topic workers
    pub fn queue_settings(&self) -> crate::topic::QueueSettings {
        crate::topic::QueueSettings {
            capacity: self.queues.capacity,
            batch_size: self.queues.batch_size,
            max_attempts: self.queues.max_attempts,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for QueueTuning {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_batch_size(), 5);
        assert_eq!(default_max_attempts(), 5);
        assert_eq!(default_inbound_topic(), "darkroom.events");
        assert_eq!(default_fallback_address(), "moderation@darkroom.local");
    }

    #[test]
    fn test_queue_tuning_defaults() {
        let tuning = QueueTuning::default();
        assert_eq!(tuning.capacity, 256);
        assert_eq!(tuning.batch_size, 5);
    }
}
