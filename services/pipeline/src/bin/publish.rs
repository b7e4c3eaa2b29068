//! Command-line event publisher for the Darkroom pipeline.
//!
//! Constructs the wire payloads and attribute headers reviewers use to drive
//! the pipeline, and produces them to the inbound Kafka topic.

use anyhow::{bail, Context, Result};
use darkroom_pipeline::config::KafkaConfig;
use darkroom_pipeline::kafka::WirePublisher;
use darkroom_pipeline::message::{
    InvalidAction, InvalidImageEvent, MetadataKind, MetadataUpdateEvent, ObjectCreatedEvent,
    Payload, ReviewStatus, StatusUpdateEvent,
};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mode = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    let payload = match mode {
        "created" => parse_created(&args[2..])?,
        "status" => parse_status(&args[2..])?,
        "metadata" => parse_metadata(&args[2..])?,
        "invalid" => parse_invalid(&args[2..])?,
        _ => {
            usage();
            return Ok(());
        }
    };

    let config = kafka_config_from_env();
    let publisher = WirePublisher::new(&config).context("Failed to create Kafka producer")?;

    publisher.publish(&payload).await.context("Failed to publish event")?;
    publisher.flush(Duration::from_secs(5))?;

    match payload {
        Payload::ObjectCreated(e) => {
            println!("Object-created event sent for s3://{}/{}", e.bucket, e.key)
        }
        Payload::StatusUpdate(e) => {
            println!("Status update sent: {} for image {}", e.status, e.id)
        }
        Payload::MetadataUpdate(e) => println!(
            "Metadata update sent: {}={} for image {}",
            e.kind.record_key(),
            e.value,
            e.id
        ),
        Payload::InvalidImage(e) => println!(
            "Invalid-image event sent: {} for image {}",
            e.action.wire_value(),
            e.id
        ),
        Payload::Notify(_) => unreachable!("notify events are internal"),
    }

    Ok(())
}

fn parse_created(args: &[String]) -> Result<Payload> {
    let [bucket, key] = args else {
        bail!("Usage: darkroom-publish created <bucket> <key>");
    };
    Ok(Payload::ObjectCreated(ObjectCreatedEvent {
        bucket: bucket.clone(),
        key: key.clone(),
    }))
}

fn parse_status(args: &[String]) -> Result<Payload> {
    let (id, status, reason) = match args {
        [id, status] => (id, status, String::new()),
        [id, status, reason] => (id, status, reason.clone()),
        _ => bail!("Usage: darkroom-publish status <imageId> <Pass|Reject> [reason]"),
    };
    let status = match status.as_str() {
        "Pass" => ReviewStatus::Pass,
        "Reject" => ReviewStatus::Reject,
        other => bail!("Status must be either 'Pass' or 'Reject', got '{other}'"),
    };
    Ok(Payload::StatusUpdate(StatusUpdateEvent {
        id: id.clone(),
        status,
        reason,
    }))
}

fn parse_metadata(args: &[String]) -> Result<Payload> {
    let [id, metadata_type, value] = args else {
        bail!("Usage: darkroom-publish metadata <imageId> <Caption|Date|name> <value>");
    };
    let kind = MetadataKind::parse(metadata_type)
        .with_context(|| format!("Invalid metadata type '{metadata_type}'. Must be one of: Caption, Date, name"))?;
    Ok(Payload::MetadataUpdate(MetadataUpdateEvent {
        id: id.clone(),
        kind,
        value: value.clone(),
    }))
}

fn parse_invalid(args: &[String]) -> Result<Payload> {
    let (id, reason, delete_record) = match args {
        [id, reason] => (id, reason.clone(), false),
        [id, reason, flag] if flag == "--delete-record" => (id, reason.clone(), true),
        _ => bail!("Usage: darkroom-publish invalid <imageId> <reason> [--delete-record]"),
    };
    let action = if delete_record {
        InvalidAction::DeleteRecord
    } else {
        InvalidAction::MarkInvalid
    };
    Ok(Payload::InvalidImage(InvalidImageEvent {
        id: id.clone(),
        reason,
        action,
    }))
}

fn kafka_config_from_env() -> KafkaConfig {
    KafkaConfig {
        bootstrap_servers: std::env::var("KAFKA_BOOTSTRAP_SERVERS")
            .unwrap_or_else(|_| "localhost:9092".to_string()),
        group_id: "darkroom-publish".to_string(),
        client_id: "darkroom-publish".to_string(),
        inbound_topic: std::env::var("DARKROOM_TOPIC")
            .unwrap_or_else(|_| "darkroom.events".to_string()),
        auto_offset_reset: "earliest".to_string(),
        session_timeout_ms: 30000,
        max_poll_interval_ms: 300000,
        request_timeout_ms: 30000,
        ssl_enabled: false,
        ssl_ca_location: None,
        sasl_username: std::env::var("KAFKA_SASL_USERNAME").ok(),
        sasl_password: std::env::var("KAFKA_SASL_PASSWORD").ok(),
    }
}

fn usage() {
    println!("Usage: darkroom-publish <mode> [args]");
    println!();
    println!("Modes:");
    println!("  created <bucket> <key>                      - announce an uploaded object");
    println!("  status <imageId> <Pass|Reject> [reason]     - review an image");
    println!("  metadata <imageId> <Caption|Date|name> <v>  - annotate an image");
    println!("  invalid <imageId> <reason> [--delete-record] - purge an invalid image");
    println!();
    println!("Environment variables:");
    println!("  KAFKA_BOOTSTRAP_SERVERS - Kafka broker addresses (default: localhost:9092)");
    println!("  DARKROOM_TOPIC          - Inbound event topic (default: darkroom.events)");
    println!("  KAFKA_SASL_USERNAME     - SASL username");
    println!("  KAFKA_SASL_PASSWORD     - SASL password");
}
