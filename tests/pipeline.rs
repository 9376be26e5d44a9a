//! End-to-end pipeline scenarios: audit event in, notification out, with
//! deduplication across restarts. Runs against a stub registry and a
//! dry-run producer; the per-event sequence mirrors the runner.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use schema_change_notifier::config::{Config, EnvironmentConfig};
use schema_change_notifier::processor::SchemaChangeProcessor;
use schema_change_notifier::producer::NotificationProducer;
use schema_change_notifier::registry::{RegistryError, SchemaInfo, SchemaRegistry};
use schema_change_notifier::state::DeduplicationStore;
use schema_change_notifier::types::{AuditLogEvent, EventType, SchemaChangeNotification};

/// Stub registry serving the orders-value schema for id 100001.
#[derive(Default)]
struct StubRegistry {
    schemas: HashMap<(String, i32), SchemaInfo>,
    lookups: AtomicUsize,
}

impl StubRegistry {
    fn with_order_schema() -> Self {
        let mut schemas = HashMap::new();
        schemas.insert(
            ("env-test123".to_string(), 100001),
            SchemaInfo {
                environment_id: "env-test123".to_string(),
                schema_id: Some(100001),
                subject: Some("orders-value".to_string()),
                version: Some(1),
                schema: Some("{\"type\":\"record\",\"name\":\"Order\"}".to_string()),
                schema_type: "AVRO".to_string(),
                references: None,
            },
        );
        Self {
            schemas,
            lookups: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SchemaRegistry for StubRegistry {
    async fn schema_by_id(
        &self,
        environment_id: &str,
        schema_id: i32,
    ) -> Result<Option<SchemaInfo>, RegistryError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .schemas
            .get(&(environment_id.to_string(), schema_id))
            .cloned())
    }

    async fn schema_by_subject_version(
        &self,
        _environment_id: &str,
        _subject: &str,
        _version: i32,
    ) -> Result<Option<SchemaInfo>, RegistryError> {
        Ok(None)
    }

    fn has_environment(&self, environment_id: &str) -> bool {
        environment_id == "env-test123"
    }
}

struct Pipeline {
    processor: SchemaChangeProcessor,
    producer: NotificationProducer,
    store: DeduplicationStore,
}

impl Pipeline {
    async fn new(config: Config) -> Self {
        let state_path = config.state_file_path.clone();
        let config = Arc::new(config);
        let processor = SchemaChangeProcessor::new(
            config.clone(),
            Arc::new(StubRegistry::with_order_schema()),
        );
        let producer = NotificationProducer::new(&config).await.unwrap();
        let store = DeduplicationStore::new(state_path);
        Self {
            processor,
            producer,
            store,
        }
    }

    /// One event through dedup, classification and (dry-run) publishing.
    /// Returns the published notification, if any.
    async fn handle(&self, event: &AuditLogEvent) -> Option<SchemaChangeNotification> {
        let key = self.processor.deduplication_key(event);
        if self.store.is_duplicate(&key) {
            return None;
        }
        let notification = self.processor.process(event).await?;
        assert!(self.producer.send(&notification).await);
        self.store.mark_processed(&key);
        Some(notification)
    }
}

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config {
        dry_run: true,
        target_topic: Some("schema-changes".to_string()),
        state_file_path: dir
            .path()
            .join("state.json")
            .to_string_lossy()
            .into_owned(),
        ..Config::default()
    };
    config.add_environment(EnvironmentConfig::new(
        "env-test123",
        "https://psrc-x.confluent.cloud",
        "sr-key",
        "sr-secret",
    ));
    config
}

fn register_schema_event() -> AuditLogEvent {
    serde_json::from_value(json!({
        "id": "e1",
        "type": "io.confluent.sg.server/request",
        "source": "crn://confluent.cloud/organization=org-1",
        "time": "2024-01-15T10:30:00Z",
        "data": {
            "methodName": "schema-registry.RegisterSchema",
            "resourceName": "crn://confluent.cloud/organization=org-1/environment=env-test123/schema-registry=lsrc-x/subject/orders-value",
            "request": { "data": { "subject": "orders-value" } },
            "result": { "status": "SUCCESS", "data": { "id": 100001.0 } }
        }
    }))
    .unwrap()
}

#[tokio::test]
async fn register_schema_yields_enriched_notification() {
    let dir = TempDir::new().unwrap();
    let pipeline = Pipeline::new(test_config(&dir)).await;

    let notification = pipeline.handle(&register_schema_event()).await.unwrap();

    assert_eq!(notification.event_type, EventType::SchemaRegistered);
    assert_eq!(notification.schema_id, Some(100001));
    assert_eq!(notification.subject.as_deref(), Some("orders-value"));
    assert_eq!(notification.version, Some(1));
    assert_eq!(notification.schema_type.as_deref(), Some("AVRO"));
    assert_eq!(notification.environment_id.as_deref(), Some("env-test123"));
    assert_eq!(
        notification.timestamp.as_deref(),
        Some("2024-01-15T10:30:00Z")
    );
    assert_eq!(notification.audit_log_event_id.as_deref(), Some("e1"));
    assert_eq!(
        notification
            .data_contract_registered
            .as_ref()
            .unwrap()
            .schema
            .as_deref(),
        Some("{\"type\":\"record\",\"name\":\"Order\"}")
    );
    assert_eq!(
        NotificationProducer::record_key(&notification),
        "orders-value"
    );
    assert!(pipeline
        .store
        .is_duplicate("orders-value:schema-registry.RegisterSchema:100001"));
}

#[tokio::test]
async fn failed_operations_are_filtered() {
    let dir = TempDir::new().unwrap();
    let pipeline = Pipeline::new(test_config(&dir)).await;

    let mut event = register_schema_event();
    event.data.as_mut().unwrap().result.as_mut().unwrap().status = Some("FAILURE".to_string());

    assert!(pipeline.handle(&event).await.is_none());
    assert_eq!(pipeline.store.size(), 0);
}

#[tokio::test]
async fn unmonitored_environments_are_filtered() {
    let dir = TempDir::new().unwrap();
    let pipeline = Pipeline::new(test_config(&dir)).await;

    let mut event = register_schema_event();
    event.data.as_mut().unwrap().resource_name = Some(
        "crn://confluent.cloud/organization=org-1/environment=env-other/schema-registry=lsrc-y/subject/orders-value"
            .to_string(),
    );
    event.source = None;

    assert!(pipeline.handle(&event).await.is_none());
}

#[tokio::test]
async fn subject_glob_mismatch_is_filtered() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.subject_filters = ["payments-*".to_string()].into_iter().collect();
    let pipeline = Pipeline::new(config).await;

    assert!(pipeline.handle(&register_schema_event()).await.is_none());
}

#[tokio::test]
async fn delete_subject_carries_full_resource_name() {
    let dir = TempDir::new().unwrap();
    let pipeline = Pipeline::new(test_config(&dir)).await;

    let event: AuditLogEvent = serde_json::from_value(json!({
        "id": "e5",
        "type": "io.confluent.sg.server/request",
        "time": "2024-02-01T08:00:00Z",
        "data": {
            "methodName": "schema-registry.DeleteSubject",
            "resourceName": "crn://confluent.cloud/organization=org-1/environment=env-test123/schema-registry=lsrc-x/subject/legacy-value",
            "result": { "status": "SUCCESS" }
        }
    }))
    .unwrap();

    let notification = pipeline.handle(&event).await.unwrap();
    assert_eq!(notification.event_type, EventType::SubjectDeleted);
    assert_eq!(
        notification.subject.as_deref(),
        Some("crn://confluent.cloud/organization=org-1/environment=env-test123/schema-registry=lsrc-x/subject/legacy-value")
    );
    assert_eq!(notification.environment_id.as_deref(), Some("env-test123"));
    assert!(!notification.subject_deleted.as_ref().unwrap().permanent);
}

#[tokio::test]
async fn same_event_twice_publishes_once() {
    let dir = TempDir::new().unwrap();
    let pipeline = Pipeline::new(test_config(&dir)).await;

    let event = register_schema_event();
    assert!(pipeline.handle(&event).await.is_some());
    assert!(pipeline.handle(&event).await.is_none());
    assert_eq!(pipeline.store.size(), 1);
}

#[tokio::test]
async fn deduplication_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let event = register_schema_event();

    // first run publishes and persists its state on close
    {
        let pipeline = Pipeline::new(config.clone()).await;
        assert!(pipeline.handle(&event).await.is_some());
        pipeline.store.close();
    }

    // a fresh process with the same state file skips the replay
    {
        let pipeline = Pipeline::new(config).await;
        assert!(pipeline.handle(&event).await.is_none());
    }
}

#[tokio::test]
async fn replayed_batch_after_crash_produces_nothing_new() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let batch: Vec<AuditLogEvent> = (0..5)
        .map(|i| {
            let mut event = register_schema_event();
            event.id = Some(format!("e{i}"));
            event
                .data
                .as_mut()
                .unwrap()
                .result
                .as_mut()
                .unwrap()
                .data
                .as_mut()
                .unwrap()
                .id = Some(100_000.0 + i as f64);
            event
        })
        .collect();

    {
        let pipeline = Pipeline::new(config.clone()).await;
        for event in &batch {
            assert!(pipeline.handle(event).await.is_some());
        }
        pipeline.store.close();
    }

    {
        let pipeline = Pipeline::new(config).await;
        for event in &batch {
            assert!(pipeline.handle(event).await.is_none());
        }
        assert_eq!(pipeline.store.size(), 5);
    }
}
