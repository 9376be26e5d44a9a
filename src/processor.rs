use std::sync::Arc;

use regex::Regex;
use tracing::{debug, error, info, trace, warn};

use crate::config::{Config, DEFAULT_SCHEMA_TYPE, SCHEMA_REGISTRY_EVENT_TYPE, STATUS_SUCCESS};
use crate::registry::SchemaRegistry;
use crate::types::{
    AuditLogEvent, CompatibilityUpdated, DataContractDeleted, DataContractRegistered, EventType,
    ModeUpdated, SchemaChangeNotification, SubjectDeleted,
};

/// Filters schema registry operations out of the audit log stream and turns
/// them into notifications, enriching registrations with schema content
/// fetched from the owning environment's registry.
///
/// Supported methods: RegisterSchema, DeleteSchema, DeleteSubject, and
/// (when config changes are included) UpdateCompatibility and UpdateMode.
pub struct SchemaChangeProcessor {
    config: Arc<Config>,
    registry: Arc<dyn SchemaRegistry>,
    environment_pattern: Regex,
}

impl SchemaChangeProcessor {
    pub fn new(config: Arc<Config>, registry: Arc<dyn SchemaRegistry>) -> Self {
        info!("Schema change processor initialized");
        Self {
            config,
            registry,
            // CRN segment, e.g. .../environment=env-abc123/...
            environment_pattern: Regex::new("environment=([^/]+)").expect("valid pattern"),
        }
    }

    /// Extracts the environment id from the event's resource name, falling
    /// back to the event source.
    pub fn extract_environment_id(&self, event: &AuditLogEvent) -> Option<String> {
        if let Some(resource_name) = event.resource_name() {
            if let Some(captures) = self.environment_pattern.captures(resource_name) {
                return Some(captures[1].to_string());
            }
        }
        if let Some(source) = event.source.as_deref() {
            if let Some(captures) = self.environment_pattern.captures(source) {
                return Some(captures[1].to_string());
            }
        }
        None
    }

    /// Ordered relevance checks. An event is processed only when it is a
    /// schema registry request with data, a monitored method, a monitored
    /// environment, a passing result status, and a matching subject.
    pub fn is_relevant_event(&self, event: &AuditLogEvent) -> bool {
        if event.event_type.as_deref() != Some(SCHEMA_REGISTRY_EVENT_TYPE) {
            trace!("Skipping event with type: {:?}", event.event_type);
            return false;
        }

        let Some(data) = event.data.as_ref() else {
            trace!("Skipping event with null data");
            return false;
        };

        let method_name = data.method_name.as_deref();
        if !method_name.is_some_and(|m| self.config.include_methods.contains(m)) {
            if method_name.is_some_and(|m| m.starts_with("schema-registry.")) {
                debug!("Skipping SR event with method: {:?}", method_name);
            }
            return false;
        }

        let Some(environment_id) = self.extract_environment_id(event) else {
            debug!(
                "Skipping {:?} event with no environment id in source: {:?}",
                method_name, event.source
            );
            return false;
        };
        if !self.config.has_environment(&environment_id) {
            debug!(
                "Skipping {:?} event from non-monitored environment: {environment_id}",
                method_name
            );
            return false;
        }

        if self.config.only_successful {
            let status = data.result.as_ref().and_then(|r| r.status.as_deref());
            if !status.is_some_and(|s| s.eq_ignore_ascii_case(STATUS_SUCCESS)) {
                debug!("Skipping failed event: {:?} - {:?}", method_name, status);
                return false;
            }
        }

        if self.config.has_subject_filters() {
            let subject = self.subject_from_event(event);
            if !self.matches_subject_filter(subject.as_deref()) {
                debug!("Skipping event for non-matching subject: {subject:?}");
                return false;
            }
        }

        true
    }

    /// The subject for filtering: the request subject when present,
    /// otherwise the full resource name (delete operations carry no request
    /// subject).
    fn subject_from_event(&self, event: &AuditLogEvent) -> Option<String> {
        let data = event.data.as_ref()?;
        data.request
            .as_ref()
            .and_then(|r| r.subject())
            .or(data.resource_name.as_deref())
            .map(str::to_string)
    }

    /// Glob filters support `*` only, matched against the whole subject;
    /// filters without `*` require exact equality.
    fn matches_subject_filter(&self, subject: Option<&str>) -> bool {
        let Some(subject) = subject else {
            return false;
        };

        for filter in &self.config.subject_filters {
            if filter.contains('*') {
                let pattern = format!("^{}$", filter.replace('.', "\\.").replace('*', ".*"));
                if Regex::new(&pattern).is_ok_and(|re| re.is_match(subject)) {
                    return true;
                }
            } else if filter == subject {
                return true;
            }
        }
        false
    }

    /// Builds the notification for a relevant event, or `None` when the
    /// event is filtered or processing fails.
    pub async fn process(&self, event: &AuditLogEvent) -> Option<SchemaChangeNotification> {
        if !self.is_relevant_event(event) {
            return None;
        }

        let method_name = event.method_name()?.to_string();
        let notification = match method_name.as_str() {
            "schema-registry.RegisterSchema" => self.process_register_schema(event).await,
            "schema-registry.DeleteSchema" => Some(self.process_delete_schema(event)),
            "schema-registry.DeleteSubject" => Some(self.process_delete_subject(event)),
            "schema-registry.UpdateCompatibility" => {
                Some(self.process_update_compatibility(event))
            }
            "schema-registry.UpdateMode" => Some(self.process_update_mode(event)),
            other => {
                warn!("Unknown method name: {other}");
                None
            }
        };

        if let Some(notification) = &notification {
            info!(
                "Processed {:?} event for subject: {:?}",
                notification.event_type, notification.subject
            );
        }
        notification
    }

    async fn process_register_schema(
        &self,
        event: &AuditLogEvent,
    ) -> Option<SchemaChangeNotification> {
        let data = event.data.as_ref()?;
        let request = data.request.as_ref();
        let environment_id = self.extract_environment_id(event);
        let schema_id = data.result.as_ref().and_then(|r| r.schema_id());
        let subject = request
            .and_then(|r| r.subject())
            .or(data.resource_name.as_deref())
            .map(str::to_string);

        let mut schema = None;
        let mut schema_type = None;
        let mut references = None;
        let mut version = None;

        if let (Some(env_id), Some(id)) = (environment_id.as_deref(), schema_id) {
            match self.registry.schema_by_id(env_id, id).await {
                Ok(Some(info)) => {
                    schema = info.schema;
                    schema_type = Some(info.schema_type);
                    references = info.references;
                    version = info.version;
                }
                Ok(None) => {
                    warn!(
                        "Could not fetch schema {id} from schema registry for environment {env_id}"
                    );
                }
                Err(e) => {
                    error!("Error processing event {:?}: {e}", event.id);
                    return None;
                }
            }
        } else if schema_id.is_none() {
            warn!("No schema id in RegisterSchema event for subject: {subject:?}");
        }

        if schema_type.is_none() {
            schema_type = request.and_then(|r| r.schema_type()).map(str::to_string);
        }

        let mut notification = SchemaChangeNotification::new(EventType::SchemaRegistered);
        notification.schema_id = schema_id;
        notification.subject = subject;
        notification.version = version;
        notification.schema_type = Some(schema_type.unwrap_or(DEFAULT_SCHEMA_TYPE.to_string()));
        notification.timestamp = event.time.clone();
        notification.environment_id = environment_id;
        notification.audit_log_event_id = event.id.clone();
        notification.data_contract_registered = Some(DataContractRegistered { schema, references });
        Some(notification)
    }

    fn process_delete_schema(&self, event: &AuditLogEvent) -> SchemaChangeNotification {
        let mut notification = SchemaChangeNotification::new(EventType::SchemaDeleted);
        // deletes carry the full resource name as the subject
        notification.subject = event.resource_name().map(str::to_string);
        notification.version = event
            .data
            .as_ref()
            .and_then(|d| d.request.as_ref())
            .and_then(|r| r.version);
        notification.timestamp = event.time.clone();
        notification.environment_id = self.extract_environment_id(event);
        notification.audit_log_event_id = event.id.clone();
        notification.data_contract_deleted = Some(DataContractDeleted { permanent: false });
        notification
    }

    fn process_delete_subject(&self, event: &AuditLogEvent) -> SchemaChangeNotification {
        let mut notification = SchemaChangeNotification::new(EventType::SubjectDeleted);
        notification.subject = event.resource_name().map(str::to_string);
        notification.timestamp = event.time.clone();
        notification.environment_id = self.extract_environment_id(event);
        notification.audit_log_event_id = event.id.clone();
        notification.subject_deleted = Some(SubjectDeleted {
            permanent: false,
            versions_deleted: None,
        });
        notification
    }

    fn process_update_compatibility(&self, event: &AuditLogEvent) -> SchemaChangeNotification {
        let mut notification = SchemaChangeNotification::new(EventType::CompatibilityUpdated);
        notification.subject = event.resource_name().map(str::to_string);
        notification.timestamp = event.time.clone();
        notification.environment_id = self.extract_environment_id(event);
        notification.audit_log_event_id = event.id.clone();
        notification.compatibility_updated = Some(CompatibilityUpdated {
            new_compatibility: event
                .data
                .as_ref()
                .and_then(|d| d.request.as_ref())
                .and_then(|r| r.compatibility.clone()),
        });
        notification
    }

    fn process_update_mode(&self, event: &AuditLogEvent) -> SchemaChangeNotification {
        let mut notification = SchemaChangeNotification::new(EventType::ModeUpdated);
        notification.subject = event.resource_name().map(str::to_string);
        notification.timestamp = event.time.clone();
        notification.environment_id = self.extract_environment_id(event);
        notification.audit_log_event_id = event.id.clone();
        notification.mode_updated = Some(ModeUpdated {
            new_mode: event
                .data
                .as_ref()
                .and_then(|d| d.request.as_ref())
                .and_then(|r| r.mode.clone()),
        });
        notification
    }

    /// The deduplication key: `subject:methodName:schemaId`. A new schema
    /// version gets a fresh schema id and therefore a fresh key, while
    /// replayed audit records for the same registration collapse onto one
    /// key. Missing pieces render as `unknown` (subject, method) or `null`
    /// (schema id).
    pub fn deduplication_key(&self, event: &AuditLogEvent) -> String {
        let data = event.data.as_ref();
        let method_name = data
            .and_then(|d| d.method_name.as_deref())
            .unwrap_or("unknown");
        let subject = data
            .and_then(|d| {
                d.request
                    .as_ref()
                    .and_then(|r| r.subject())
                    .or(d.resource_name.as_deref())
            })
            .unwrap_or("unknown");
        let schema_id = data
            .and_then(|d| d.result.as_ref())
            .and_then(|r| r.schema_id())
            .map_or("null".to_string(), |id| id.to_string());

        format!("{subject}:{method_name}:{schema_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvironmentConfig;
    use crate::registry::{RegistryError, SchemaInfo};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Registry stub serving canned schemas and counting lookups.
    #[derive(Default)]
    struct StubRegistry {
        schemas: HashMap<(String, i32), SchemaInfo>,
        lookups: AtomicUsize,
        fail: bool,
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
                ..Default::default()
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
            if self.fail {
                return Err(RegistryError::Http {
                    environment_id: environment_id.to_string(),
                    schema_id: Some(schema_id),
                    status: 500,
                    body: "boom".to_string(),
                });
            }
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

    fn test_config() -> Config {
        let mut config = Config::default();
        config.add_environment(EnvironmentConfig::new(
            "env-test123",
            "https://psrc-x.confluent.cloud",
            "sr-key",
            "sr-secret",
        ));
        config
    }

    fn processor_with(config: Config, registry: StubRegistry) -> SchemaChangeProcessor {
        SchemaChangeProcessor::new(Arc::new(config), Arc::new(registry))
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
    async fn register_schema_produces_enriched_notification() {
        let processor = processor_with(test_config(), StubRegistry::with_order_schema());
        let event = register_schema_event();

        let notification = processor.process(&event).await.unwrap();
        assert_eq!(notification.event_type, EventType::SchemaRegistered);
        assert_eq!(notification.schema_id, Some(100001));
        assert_eq!(notification.subject.as_deref(), Some("orders-value"));
        assert_eq!(notification.version, Some(1));
        assert_eq!(notification.schema_type.as_deref(), Some("AVRO"));
        assert_eq!(notification.environment_id.as_deref(), Some("env-test123"));
        assert_eq!(notification.timestamp.as_deref(), Some("2024-01-15T10:30:00Z"));
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
            processor.deduplication_key(&event),
            "orders-value:schema-registry.RegisterSchema:100001"
        );
    }

    #[tokio::test]
    async fn failed_status_is_filtered() {
        let processor = processor_with(test_config(), StubRegistry::with_order_schema());
        let mut event = register_schema_event();
        event.data.as_mut().unwrap().result.as_mut().unwrap().status =
            Some("FAILURE".to_string());

        assert!(!processor.is_relevant_event(&event));
        assert!(processor.process(&event).await.is_none());
    }

    #[tokio::test]
    async fn success_status_check_is_case_insensitive() {
        let processor = processor_with(test_config(), StubRegistry::with_order_schema());
        let mut event = register_schema_event();
        event.data.as_mut().unwrap().result.as_mut().unwrap().status =
            Some("success".to_string());
        assert!(processor.is_relevant_event(&event));
    }

    #[tokio::test]
    async fn non_monitored_environment_is_filtered() {
        let processor = processor_with(test_config(), StubRegistry::with_order_schema());
        let mut event = register_schema_event();
        event.data.as_mut().unwrap().resource_name = Some(
            "crn://confluent.cloud/organization=org-1/environment=env-other/schema-registry=lsrc-y"
                .to_string(),
        );
        event.source = None;

        assert!(!processor.is_relevant_event(&event));
        assert!(processor.process(&event).await.is_none());
    }

    #[tokio::test]
    async fn unknown_method_is_filtered() {
        let processor = processor_with(test_config(), StubRegistry::with_order_schema());
        let mut event = register_schema_event();
        event.data.as_mut().unwrap().method_name =
            Some("schema-registry.GetSchema".to_string());
        assert!(!processor.is_relevant_event(&event));
    }

    #[tokio::test]
    async fn config_change_methods_require_opt_in() {
        let mut event = register_schema_event();
        event.data.as_mut().unwrap().method_name =
            Some("schema-registry.UpdateCompatibility".to_string());
        event
            .data
            .as_mut()
            .unwrap()
            .request
            .as_mut()
            .unwrap()
            .compatibility = Some("FULL".to_string());

        let processor = processor_with(test_config(), StubRegistry::default());
        assert!(!processor.is_relevant_event(&event));

        let mut config = test_config();
        config.set_include_config_changes(true);
        let processor = processor_with(config, StubRegistry::default());
        let notification = processor.process(&event).await.unwrap();
        assert_eq!(notification.event_type, EventType::CompatibilityUpdated);
        assert_eq!(
            notification
                .compatibility_updated
                .as_ref()
                .unwrap()
                .new_compatibility
                .as_deref(),
            Some("FULL")
        );
    }

    #[tokio::test]
    async fn subject_glob_mismatch_is_filtered() {
        let mut config = test_config();
        config.subject_filters = ["payments-*".to_string()].into_iter().collect();
        let processor = processor_with(config, StubRegistry::with_order_schema());
        assert!(!processor.is_relevant_event(&register_schema_event()));
    }

    #[tokio::test]
    async fn subject_glob_match_passes() {
        let mut config = test_config();
        config.subject_filters = ["orders-*".to_string()].into_iter().collect();
        let processor = processor_with(config, StubRegistry::with_order_schema());
        assert!(processor.is_relevant_event(&register_schema_event()));
    }

    #[test]
    fn glob_matches_entire_subject_with_dots_escaped() {
        let mut config = test_config();
        config.subject_filters = ["com.acme.*".to_string()].into_iter().collect();
        let processor = processor_with(config, StubRegistry::default());

        assert!(processor.matches_subject_filter(Some("com.acme.orders")));
        // the dot must not act as a wildcard
        assert!(!processor.matches_subject_filter(Some("comXacmeXorders")));
        // a glob is anchored, not a substring match
        assert!(!processor.matches_subject_filter(Some("prefix-com.acme.orders")));
        assert!(!processor.matches_subject_filter(None));
    }

    #[test]
    fn exact_filter_requires_equality() {
        let mut config = test_config();
        config.subject_filters = ["orders-value".to_string()].into_iter().collect();
        let processor = processor_with(config, StubRegistry::default());

        assert!(processor.matches_subject_filter(Some("orders-value")));
        assert!(!processor.matches_subject_filter(Some("orders-value-v2")));
    }

    #[tokio::test]
    async fn delete_subject_keeps_resource_name_as_subject() {
        let processor = processor_with(test_config(), StubRegistry::default());
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

        let notification = processor.process(&event).await.unwrap();
        assert_eq!(notification.event_type, EventType::SubjectDeleted);
        assert_eq!(
            notification.subject.as_deref(),
            Some("crn://confluent.cloud/organization=org-1/environment=env-test123/schema-registry=lsrc-x/subject/legacy-value")
        );
        assert_eq!(notification.environment_id.as_deref(), Some("env-test123"));
        let deleted = notification.subject_deleted.as_ref().unwrap();
        assert!(!deleted.permanent);
        assert!(deleted.versions_deleted.is_none());
    }

    #[tokio::test]
    async fn delete_schema_carries_version_from_request() {
        let processor = processor_with(test_config(), StubRegistry::default());
        let event: AuditLogEvent = serde_json::from_value(json!({
            "id": "e6",
            "type": "io.confluent.sg.server/request",
            "time": "2024-02-01T08:00:00Z",
            "data": {
                "methodName": "schema-registry.DeleteSchema",
                "resourceName": "crn://confluent.cloud/environment=env-test123/schema-registry=lsrc-x/subject/orders-value",
                "request": { "subject": "orders-value", "version": 3 },
                "result": { "status": "SUCCESS" }
            }
        }))
        .unwrap();

        let notification = processor.process(&event).await.unwrap();
        assert_eq!(notification.event_type, EventType::SchemaDeleted);
        assert_eq!(notification.version, Some(3));
        assert_eq!(
            notification.subject.as_deref(),
            Some("crn://confluent.cloud/environment=env-test123/schema-registry=lsrc-x/subject/orders-value")
        );
        assert!(!notification.data_contract_deleted.as_ref().unwrap().permanent);
    }

    #[tokio::test]
    async fn registry_failure_yields_no_notification() {
        let registry = StubRegistry {
            fail: true,
            ..Default::default()
        };
        let processor = processor_with(test_config(), registry);
        assert!(processor.process(&register_schema_event()).await.is_none());
    }

    #[tokio::test]
    async fn missing_schema_falls_back_to_request_schema_type() {
        // registry has no entry for the id, the request carries PROTOBUF
        let processor = processor_with(test_config(), StubRegistry::default());
        let event: AuditLogEvent = serde_json::from_value(json!({
            "id": "e7",
            "type": "io.confluent.sg.server/request",
            "time": "2024-02-01T08:00:00Z",
            "data": {
                "methodName": "schema-registry.RegisterSchema",
                "resourceName": "crn://confluent.cloud/environment=env-test123/schema-registry=lsrc-x/subject/metrics-value",
                "request": { "data": { "subject": "metrics-value", "schemaType": "PROTOBUF" } },
                "result": { "status": "SUCCESS", "data": { "id": 42.0 } }
            }
        }))
        .unwrap();

        let notification = processor.process(&event).await.unwrap();
        assert_eq!(notification.schema_type.as_deref(), Some("PROTOBUF"));
        assert!(notification
            .data_contract_registered
            .as_ref()
            .unwrap()
            .schema
            .is_none());
    }

    #[test]
    fn environment_id_falls_back_to_event_source() {
        let processor = processor_with(test_config(), StubRegistry::default());
        let event: AuditLogEvent = serde_json::from_value(json!({
            "type": "io.confluent.sg.server/request",
            "source": "crn://confluent.cloud/organization=org-1/environment=env-test123",
            "data": { "methodName": "schema-registry.RegisterSchema" }
        }))
        .unwrap();
        assert_eq!(
            processor.extract_environment_id(&event).as_deref(),
            Some("env-test123")
        );
    }

    #[test]
    fn dedup_key_uses_request_subject_then_resource_name() {
        let processor = processor_with(test_config(), StubRegistry::default());

        let event = register_schema_event();
        assert_eq!(
            processor.deduplication_key(&event),
            "orders-value:schema-registry.RegisterSchema:100001"
        );

        let delete: AuditLogEvent = serde_json::from_value(json!({
            "type": "io.confluent.sg.server/request",
            "data": {
                "methodName": "schema-registry.DeleteSubject",
                "resourceName": "crn://x/subject/legacy-value"
            }
        }))
        .unwrap();
        assert_eq!(
            processor.deduplication_key(&delete),
            "crn://x/subject/legacy-value:schema-registry.DeleteSubject:null"
        );

        let empty = AuditLogEvent::default();
        assert_eq!(processor.deduplication_key(&empty), "unknown:unknown:null");
    }

    #[test]
    fn dedup_key_depends_only_on_subject_method_and_id() {
        let processor = processor_with(test_config(), StubRegistry::default());
        let first = register_schema_event();
        let mut second = register_schema_event();
        second.id = Some("different-audit-id".to_string());
        second.time = Some("2024-06-01T00:00:00Z".to_string());

        assert_eq!(
            processor.deduplication_key(&first),
            processor.deduplication_key(&second)
        );
    }
}
