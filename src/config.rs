use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;

/// Default Confluent Cloud audit log topic.
pub const DEFAULT_AUDIT_LOG_TOPIC: &str = "confluent-audit-log-events";

/// Event type emitted by the schema registry gateway in audit logs.
pub const SCHEMA_REGISTRY_EVENT_TYPE: &str = "io.confluent.sg.server/request";

/// Result status marking a successful operation.
pub const STATUS_SUCCESS: &str = "SUCCESS";

/// Schema type assumed when the registry or the event does not carry one.
pub const DEFAULT_SCHEMA_TYPE: &str = "AVRO";

pub const DEFAULT_CONSUMER_GROUP: &str = "schema-change-notifier";
pub const DEFAULT_STATE_FILE_PATH: &str = "./schema-change-notifier-state.json";
pub const DEFAULT_SECURITY_PROTOCOL: &str = "SASL_SSL";
pub const DEFAULT_SASL_MECHANISM: &str = "PLAIN";
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Upper bound on tracked deduplication keys.
pub const MAX_DEDUP_EVENTS: usize = 100_000;

const SCHEMA_CHANGE_METHODS: [&str; 3] = [
    "schema-registry.RegisterSchema",
    "schema-registry.DeleteSchema",
    "schema-registry.DeleteSubject",
];

const CONFIG_CHANGE_METHODS: [&str; 2] = [
    "schema-registry.UpdateCompatibility",
    "schema-registry.UpdateMode",
];

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ConfigError(pub String);

/// How the consumer positions itself on the audit log topic at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    /// Only process new events, starting from the latest offset.
    Stream,
    /// Process all historical events from the beginning.
    Backfill,
    /// Start processing from a specific timestamp.
    Timestamp,
    /// Continue from the last committed offset.
    Resume,
}

impl ProcessingMode {
    /// The `auto.offset.reset` value matching this mode.
    pub fn auto_offset_reset(&self) -> &'static str {
        match self {
            ProcessingMode::Stream => "latest",
            ProcessingMode::Backfill | ProcessingMode::Timestamp | ProcessingMode::Resume => {
                "earliest"
            }
        }
    }
}

impl FromStr for ProcessingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "STREAM" => Ok(ProcessingMode::Stream),
            "BACKFILL" => Ok(ProcessingMode::Backfill),
            "TIMESTAMP" => Ok(ProcessingMode::Timestamp),
            "RESUME" => Ok(ProcessingMode::Resume),
            other => Err(ConfigError(format!(
                "Unknown processing mode: {other}, must be STREAM, BACKFILL, TIMESTAMP or RESUME"
            ))),
        }
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessingMode::Stream => "STREAM",
            ProcessingMode::Backfill => "BACKFILL",
            ProcessingMode::Timestamp => "TIMESTAMP",
            ProcessingMode::Resume => "RESUME",
        };
        f.write_str(s)
    }
}

/// Schema Registry connection settings for a single Confluent Cloud
/// environment. Registries are environment scoped, so every monitored
/// environment carries its own credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct EnvironmentConfig {
    pub environment_id: String,
    pub schema_registry_url: String,
    pub schema_registry_api_key: String,
    pub schema_registry_api_secret: String,
}

impl EnvironmentConfig {
    pub fn new(
        environment_id: impl Into<String>,
        schema_registry_url: impl Into<String>,
        schema_registry_api_key: impl Into<String>,
        schema_registry_api_secret: impl Into<String>,
    ) -> Self {
        Self {
            environment_id: environment_id.into(),
            schema_registry_url: schema_registry_url.into(),
            schema_registry_api_key: schema_registry_api_key.into(),
            schema_registry_api_secret: schema_registry_api_secret.into(),
        }
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        if self.environment_id.trim().is_empty() {
            errors.push("Environment ID is required.".to_string());
        }
        if self.schema_registry_url.trim().is_empty() {
            errors.push(format!(
                "Schema Registry URL is required for environment: {}",
                self.environment_id
            ));
        }
        if self.schema_registry_api_key.trim().is_empty() {
            errors.push(format!(
                "Schema Registry API key is required for environment: {}",
                self.environment_id
            ));
        }
        if self.schema_registry_api_secret.trim().is_empty() {
            errors.push(format!(
                "Schema Registry API secret is required for environment: {}",
                self.environment_id
            ));
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for EnvironmentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentConfig")
            .field("environment_id", &self.environment_id)
            .field("schema_registry_url", &self.schema_registry_url)
            .finish()
    }
}

/// Application configuration covering the audit log cluster, per-environment
/// schema registries, the target cluster and registry, and processing
/// behavior. Built from a properties file and/or CLI flags, validated once
/// at startup, immutable afterwards.
#[derive(Clone)]
pub struct Config {
    pub audit_log_bootstrap_servers: Option<String>,
    pub audit_log_api_key: Option<String>,
    pub audit_log_api_secret: Option<String>,
    pub audit_log_topic: String,

    /// Monitored environments, keyed by environment id.
    pub environments: HashMap<String, EnvironmentConfig>,

    pub target_bootstrap_servers: Option<String>,
    pub target_api_key: Option<String>,
    pub target_api_secret: Option<String>,
    pub target_topic: Option<String>,

    pub target_schema_registry_url: Option<String>,
    pub target_schema_registry_api_key: Option<String>,
    pub target_schema_registry_api_secret: Option<String>,

    pub processing_mode: ProcessingMode,
    pub start_timestamp: Option<String>,
    pub end_timestamp: Option<String>,
    pub stop_at_current: bool,

    pub consumer_group_id: String,

    pub include_methods: HashSet<String>,
    pub only_successful: bool,
    pub subject_filters: HashSet<String>,

    pub enable_deduplication: bool,
    pub state_file_path: String,

    pub security_protocol: String,
    pub sasl_mechanism: String,

    pub health_port: u16,
    pub processing_threads: usize,
    pub dry_run: bool,
    pub poll_timeout_ms: u64,
    pub batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audit_log_bootstrap_servers: None,
            audit_log_api_key: None,
            audit_log_api_secret: None,
            audit_log_topic: DEFAULT_AUDIT_LOG_TOPIC.to_string(),
            environments: HashMap::new(),
            target_bootstrap_servers: None,
            target_api_key: None,
            target_api_secret: None,
            target_topic: None,
            target_schema_registry_url: None,
            target_schema_registry_api_key: None,
            target_schema_registry_api_secret: None,
            processing_mode: ProcessingMode::Stream,
            start_timestamp: None,
            end_timestamp: None,
            stop_at_current: false,
            consumer_group_id: DEFAULT_CONSUMER_GROUP.to_string(),
            include_methods: SCHEMA_CHANGE_METHODS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            only_successful: true,
            subject_filters: HashSet::new(),
            enable_deduplication: true,
            state_file_path: DEFAULT_STATE_FILE_PATH.to_string(),
            security_protocol: DEFAULT_SECURITY_PROTOCOL.to_string(),
            sasl_mechanism: DEFAULT_SASL_MECHANISM.to_string(),
            health_port: 0,
            processing_threads: 1,
            dry_run: false,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl Config {
    /// Loads configuration from a java-style properties file
    /// (`key.with.dots=value`, `#`/`!` comments) on top of the defaults.
    pub fn from_properties_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            ConfigError(format!("Cannot read config file {}: {e}", path.display()))
        })?;
        let mut config = Config::default();
        config.apply_properties(&text)?;
        Ok(config)
    }

    /// Applies `key=value` properties onto this configuration. Unrecognized
    /// keys are ignored.
    pub fn apply_properties(&mut self, text: &str) -> Result<(), ConfigError> {
        let mut properties = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                properties.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        let get = |key: &str| properties.get(key).cloned();

        if let Some(v) = get("audit.log.bootstrap.servers") {
            self.audit_log_bootstrap_servers = Some(v);
        }
        if let Some(v) = get("audit.log.api.key") {
            self.audit_log_api_key = Some(v);
        }
        if let Some(v) = get("audit.log.api.secret") {
            self.audit_log_api_secret = Some(v);
        }
        if let Some(v) = get("audit.log.topic") {
            self.audit_log_topic = v;
        }

        self.load_environments(&properties);

        if let Some(v) = get("target.bootstrap.servers") {
            self.target_bootstrap_servers = Some(v);
        }
        if let Some(v) = get("target.api.key") {
            self.target_api_key = Some(v);
        }
        if let Some(v) = get("target.api.secret") {
            self.target_api_secret = Some(v);
        }
        if let Some(v) = get("target.topic") {
            self.target_topic = Some(v);
        }

        if let Some(v) = get("target.schema.registry.url") {
            self.target_schema_registry_url = Some(v);
        }
        if let Some(v) = get("target.schema.registry.api.key") {
            self.target_schema_registry_api_key = Some(v);
        }
        if let Some(v) = get("target.schema.registry.api.secret") {
            self.target_schema_registry_api_secret = Some(v);
        }

        if let Some(v) = get("processing.mode") {
            self.processing_mode = v.parse()?;
        }
        if let Some(v) = get("start.timestamp") {
            self.start_timestamp = Some(v);
        }
        if let Some(v) = get("end.timestamp") {
            self.end_timestamp = Some(v);
        }
        if let Some(v) = get("stop.at.current") {
            self.stop_at_current = parse_bool(&v);
        }

        if let Some(v) = get("consumer.group.id") {
            self.consumer_group_id = v;
        }

        if let Some(v) = get("filter.method.names") {
            self.include_methods = split_list(&v);
        }
        if let Some(v) = get("include.config.changes") {
            self.set_include_config_changes(parse_bool(&v));
        }
        if let Some(v) = get("filter.subjects") {
            self.subject_filters = split_list(&v);
        }
        if let Some(v) = get("only.successful") {
            self.only_successful = parse_bool(&v);
        }

        if let Some(v) = get("enable.deduplication") {
            self.enable_deduplication = parse_bool(&v);
        }
        if let Some(v) = get("state.store.path") {
            self.state_file_path = v;
        }

        if let Some(v) = get("security.protocol") {
            self.security_protocol = v;
        }
        if let Some(v) = get("sasl.mechanism") {
            self.sasl_mechanism = v;
        }

        if let Some(v) = get("health.port") {
            self.health_port = parse_number(&v, "health.port")?;
        }
        if let Some(v) = get("processing.threads") {
            self.processing_threads = parse_number(&v, "processing.threads")?;
        }
        if let Some(v) = get("dry.run") {
            self.dry_run = parse_bool(&v);
        }
        if let Some(v) = get("poll.timeout.ms") {
            self.poll_timeout_ms = parse_number(&v, "poll.timeout.ms")?;
        }
        if let Some(v) = get("batch.size") {
            self.batch_size = parse_number(&v, "batch.size")?;
        }

        Ok(())
    }

    /// Collects `environments.<env-id>.schema.registry.*` properties. An
    /// environment is added only once all three of url, key and secret are
    /// present.
    fn load_environments(&mut self, properties: &HashMap<String, String>) {
        let mut env_ids = HashSet::new();
        for key in properties.keys() {
            if let Some(rest) = key.strip_prefix("environments.") {
                if let Some(idx) = rest.find(".schema.registry.") {
                    env_ids.insert(rest[..idx].to_string());
                }
            }
        }

        for env_id in env_ids {
            let prefix = format!("environments.{env_id}.schema.registry.");
            let url = properties.get(&format!("{prefix}url"));
            let api_key = properties.get(&format!("{prefix}api.key"));
            let api_secret = properties.get(&format!("{prefix}api.secret"));

            if let (Some(url), Some(api_key), Some(api_secret)) = (url, api_key, api_secret) {
                self.environments.insert(
                    env_id.clone(),
                    EnvironmentConfig::new(env_id, url, api_key, api_secret),
                );
            }
        }
    }

    /// Adds the compatibility and mode update methods to the include list
    /// when enabled.
    pub fn set_include_config_changes(&mut self, include: bool) {
        if include {
            for method in CONFIG_CHANGE_METHODS {
                self.include_methods.insert(method.to_string());
            }
        }
    }

    pub fn add_environment(&mut self, env: EnvironmentConfig) {
        self.environments.insert(env.environment_id.clone(), env);
    }

    pub fn has_environment(&self, environment_id: &str) -> bool {
        self.environments.contains_key(environment_id)
    }

    pub fn has_subject_filters(&self) -> bool {
        !self.subject_filters.is_empty()
    }

    /// Validates that all required settings are present, aggregating every
    /// problem into a single error message.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if is_blank(&self.audit_log_bootstrap_servers) {
            errors.push("audit.log.bootstrap.servers is required.".to_string());
        }
        if is_blank(&self.audit_log_api_key) {
            errors.push("audit.log.api.key is required.".to_string());
        }
        if is_blank(&self.audit_log_api_secret) {
            errors.push("audit.log.api.secret is required.".to_string());
        }
        if self.environments.is_empty() {
            errors.push("At least one environment must be configured.".to_string());
        } else {
            for env in self.environments.values() {
                env.collect_errors(&mut errors);
            }
        }
        if is_blank(&self.target_bootstrap_servers) {
            errors.push("target.bootstrap.servers is required.".to_string());
        }
        if is_blank(&self.target_api_key) {
            errors.push("target.api.key is required.".to_string());
        }
        if is_blank(&self.target_api_secret) {
            errors.push("target.api.secret is required.".to_string());
        }
        if is_blank(&self.target_topic) {
            errors.push("target.topic is required.".to_string());
        }
        if self.processing_mode == ProcessingMode::Timestamp && is_blank(&self.start_timestamp) {
            errors.push("start.timestamp is required for TIMESTAMP mode.".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )))
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field(
                "audit_log_bootstrap_servers",
                &self.audit_log_bootstrap_servers,
            )
            .field("audit_log_topic", &self.audit_log_topic)
            .field("environments", &self.environments)
            .field("target_bootstrap_servers", &self.target_bootstrap_servers)
            .field("target_topic", &self.target_topic)
            .field(
                "target_schema_registry_url",
                &self.target_schema_registry_url,
            )
            .field("processing_mode", &self.processing_mode)
            .field("start_timestamp", &self.start_timestamp)
            .field("end_timestamp", &self.end_timestamp)
            .field("stop_at_current", &self.stop_at_current)
            .field("consumer_group_id", &self.consumer_group_id)
            .field("include_methods", &self.include_methods)
            .field("only_successful", &self.only_successful)
            .field("subject_filters", &self.subject_filters)
            .field("enable_deduplication", &self.enable_deduplication)
            .field("state_file_path", &self.state_file_path)
            .field("security_protocol", &self.security_protocol)
            .field("sasl_mechanism", &self.sasl_mechanism)
            .field("health_port", &self.health_port)
            .field("processing_threads", &self.processing_threads)
            .field("dry_run", &self.dry_run)
            .field("poll_timeout_ms", &self.poll_timeout_ms)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

fn parse_bool(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

fn parse_number<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError(format!("Invalid value for {key}: {value}")))
}

fn split_list(value: &str) -> HashSet<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
