use std::time::Duration;

use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use thiserror::Error;
use tracing::{error, info};

use crate::config::Config;
use crate::types::SchemaChangeNotification;

const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON Schema registered for the notification value at startup. Consumers
/// of the target topic resolve it through the schema registry instead of
/// guessing at the payload shape.
const NOTIFICATION_VALUE_SCHEMA: &str = r#"{
  "$schema": "http://json-schema.org/draft-07/schema#",
  "title": "SchemaChangeNotification",
  "type": "object",
  "properties": {
    "event_type": {
      "type": "string",
      "enum": [
        "SCHEMA_REGISTERED",
        "SCHEMA_DELETED",
        "SUBJECT_DELETED",
        "COMPATIBILITY_UPDATED",
        "MODE_UPDATED"
      ]
    },
    "schema_id": { "type": "integer" },
    "subject": { "type": "string" },
    "version": { "type": "integer" },
    "schema_type": { "type": "string" },
    "timestamp": { "type": "string" },
    "audit_log_event_id": { "type": "string" },
    "environment_id": { "type": "string" },
    "data_contract_registered": {
      "type": "object",
      "properties": {
        "schema": { "type": "string" },
        "references": {}
      }
    },
    "data_contract_deleted": {
      "type": "object",
      "properties": { "permanent": { "type": "boolean" } },
      "required": ["permanent"]
    },
    "subject_deleted": {
      "type": "object",
      "properties": {
        "permanent": { "type": "boolean" },
        "versions_deleted": { "type": "integer" }
      },
      "required": ["permanent"]
    },
    "compatibility_updated": {
      "type": "object",
      "properties": { "new_compatibility": { "type": "string" } }
    },
    "mode_updated": {
      "type": "object",
      "properties": { "new_mode": { "type": "string" } }
    }
  },
  "required": ["event_type"]
}"#;

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("failed to register notification schema for subject {subject}: {reason}")]
    SchemaRegistration { subject: String, reason: String },
    #[error("failed to create notification producer: {0}")]
    Kafka(#[from] KafkaError),
}

enum Sink {
    /// Notifications are logged instead of produced.
    DryRun,
    Live(FutureProducer),
}

/// Publishes schema change notifications to the target topic, keyed by
/// subject so consumers see per-subject ordering. The notification value
/// schema is registered against the target schema registry at construction
/// so connectivity or credential problems fail the process at startup
/// instead of on the first send.
pub struct NotificationProducer {
    sink: Sink,
    target_topic: String,
}

impl std::fmt::Debug for NotificationProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationProducer")
            .field("target_topic", &self.target_topic)
            .finish_non_exhaustive()
    }
}

impl NotificationProducer {
    pub async fn new(config: &Config) -> Result<Self, ProducerError> {
        let target_topic = config.target_topic.clone().unwrap_or_default();

        if config.dry_run {
            info!("Notification producer in dry-run mode");
            return Ok(Self {
                sink: Sink::DryRun,
                target_topic,
            });
        }

        let subject = format!("{target_topic}-value");
        register_schema_upfront(config, &subject).await?;

        let producer = create_producer(config)?;
        info!("Notification producer initialized for topic: {target_topic}");
        Ok(Self {
            sink: Sink::Live(producer),
            target_topic,
        })
    }

    /// The record key giving per-subject ordering on the target topic.
    pub fn record_key(notification: &SchemaChangeNotification) -> &str {
        notification.subject.as_deref().unwrap_or("unknown")
    }

    /// Sends one notification and waits for broker confirmation. Returns
    /// true on confirmed delivery (or in dry-run mode).
    pub async fn send(&self, notification: &SchemaChangeNotification) -> bool {
        let key = Self::record_key(notification);
        let payload = match serde_json::to_string(notification) {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    "Failed to serialize notification for subject {key}: {e}"
                );
                return false;
            }
        };

        let producer = match &self.sink {
            Sink::DryRun => {
                info!(
                    "[DRY RUN] Would produce {:?} notification for subject: {key}, schema_id: {:?}",
                    notification.event_type, notification.schema_id
                );
                return true;
            }
            Sink::Live(producer) => producer,
        };

        let record = FutureRecord::to(&self.target_topic)
            .key(key)
            .payload(&payload);

        match producer.send(record, SEND_TIMEOUT).await {
            Ok((partition, offset)) => {
                info!(
                    "Produced {:?} notification for subject {key} (schema_id={:?}) to partition {partition} offset {offset}",
                    notification.event_type, notification.schema_id
                );
                true
            }
            Err((e, _record)) => {
                error!("Failed to send notification for subject {key}: {e}");
                false
            }
        }
    }

    /// Flushes pending messages and releases the client.
    pub fn close(&self) {
        if let Sink::Live(producer) = &self.sink {
            if let Err(e) = producer.flush(CLOSE_TIMEOUT) {
                error!("Error flushing notification producer: {e}");
            }
            info!("Notification producer closed");
        }
    }
}

/// Registers the notification value schema under `<topic>-value` against
/// the target schema registry. Runtime sends rely on the registered
/// version; nothing is auto-registered later.
async fn register_schema_upfront(config: &Config, subject: &str) -> Result<(), ProducerError> {
    let base_url = config
        .target_schema_registry_url
        .as_deref()
        .unwrap_or_default()
        .trim_end_matches('/');
    let url = format!("{base_url}/subjects/{subject}/versions");

    info!("Registering notification schema for subject: {subject}");

    let client = reqwest::Client::builder()
        .timeout(REGISTRATION_TIMEOUT)
        .build()
        .map_err(|e| ProducerError::SchemaRegistration {
            subject: subject.to_string(),
            reason: e.to_string(),
        })?;

    let response = client
        .post(&url)
        .basic_auth(
            config
                .target_schema_registry_api_key
                .as_deref()
                .unwrap_or_default(),
            config.target_schema_registry_api_secret.as_deref(),
        )
        .json(&serde_json::json!({
            "schema": NOTIFICATION_VALUE_SCHEMA,
            "schemaType": "JSON",
        }))
        .send()
        .await
        .map_err(|e| ProducerError::SchemaRegistration {
            subject: subject.to_string(),
            reason: e.to_string(),
        })?;

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(ProducerError::SchemaRegistration {
            subject: subject.to_string(),
            reason: format!("registry returned {status}: {body}"),
        });
    }

    let schema_id = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v["id"].as_i64());
    info!("Schema registered successfully: subject={subject}, schema_id={schema_id:?}");
    Ok(())
}

fn create_producer(config: &Config) -> Result<FutureProducer, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set(
            "bootstrap.servers",
            config.target_bootstrap_servers.clone().unwrap_or_default(),
        )
        .set("security.protocol", &config.security_protocol)
        .set("acks", "all")
        .set("enable.idempotence", "true")
        .set("retries", "3")
        .set("retry.backoff.ms", "1000")
        .set("batch.size", "16384")
        .set("linger.ms", "10")
        .set("compression.type", "snappy")
        .set("message.timeout.ms", "30000");

    if config.security_protocol.contains("SASL") {
        client_config
            .set("sasl.mechanism", &config.sasl_mechanism)
            .set(
                "sasl.username",
                config.target_api_key.clone().unwrap_or_default(),
            )
            .set(
                "sasl.password",
                config.target_api_secret.clone().unwrap_or_default(),
            );
    }

    client_config.create()
}
