use std::path::PathBuf;

use clap::Parser;

use crate::config::{Config, ConfigError, ProcessingMode};

/// Command line interface. Flags override values loaded from the
/// configuration file.
#[derive(Parser, Debug)]
#[command(
    name = "schema-change-notifier",
    version,
    about = "Monitor Confluent Cloud audit logs for schema changes and produce notifications"
)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Audit log cluster bootstrap servers
    #[arg(long)]
    pub audit_bootstrap_servers: Option<String>,

    /// Audit log cluster API key
    #[arg(long)]
    pub audit_api_key: Option<String>,

    /// Audit log cluster API secret
    #[arg(long)]
    pub audit_api_secret: Option<String>,

    /// Audit log topic
    #[arg(long)]
    pub audit_topic: Option<String>,

    /// Target cluster bootstrap servers
    #[arg(long)]
    pub target_bootstrap_servers: Option<String>,

    /// Target cluster API key
    #[arg(long)]
    pub target_api_key: Option<String>,

    /// Target cluster API secret
    #[arg(long)]
    pub target_api_secret: Option<String>,

    /// Output topic for notifications
    #[arg(short = 'o', long)]
    pub output_topic: Option<String>,

    /// Target schema registry URL
    #[arg(long)]
    pub target_schema_registry_url: Option<String>,

    /// Target schema registry API key
    #[arg(long)]
    pub target_schema_registry_api_key: Option<String>,

    /// Target schema registry API secret
    #[arg(long)]
    pub target_schema_registry_api_secret: Option<String>,

    /// Processing mode: STREAM, BACKFILL, TIMESTAMP, RESUME
    #[arg(short, long)]
    pub mode: Option<ProcessingMode>,

    /// Start timestamp for TIMESTAMP mode (ISO-8601)
    #[arg(long)]
    pub start_timestamp: Option<String>,

    /// End timestamp for TIMESTAMP mode (ISO-8601)
    #[arg(long)]
    pub end_timestamp: Option<String>,

    /// Stop after reaching the current end of the topic (for BACKFILL)
    #[arg(long)]
    pub stop_at_current: bool,

    /// Consumer group ID
    #[arg(long)]
    pub consumer_group: Option<String>,

    /// Comma-separated list of methods to include
    #[arg(long)]
    pub include_methods: Option<String>,

    /// Include compatibility and mode updates
    #[arg(long)]
    pub include_config_changes: bool,

    /// Comma-separated list of subject patterns to filter
    #[arg(long)]
    pub filter_subjects: Option<String>,

    /// Process only successful operations
    #[arg(long)]
    pub only_successful: Option<bool>,

    /// Enable event deduplication
    #[arg(long)]
    pub enable_deduplication: Option<bool>,

    /// Path to state file for deduplication
    #[arg(long)]
    pub state_file: Option<String>,

    /// Security protocol: PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL
    #[arg(long)]
    pub security_protocol: Option<String>,

    /// SASL mechanism: PLAIN, SCRAM-SHA-256, SCRAM-SHA-512, OAUTHBEARER
    #[arg(long)]
    pub sasl_mechanism: Option<String>,

    /// Health check server port (0 to disable)
    #[arg(long)]
    pub health_port: Option<u16>,

    /// Number of workers for parallel event processing
    #[arg(long)]
    pub processing_threads: Option<usize>,

    /// Print notifications without producing
    #[arg(long)]
    pub dry_run: bool,

    /// Poll timeout in milliseconds
    #[arg(long)]
    pub poll_timeout: Option<u64>,

    /// Maximum records per poll
    #[arg(long)]
    pub batch_size: Option<usize>,
}

impl Cli {
    /// Builds the application configuration from the config file (when
    /// given) with CLI flags layered on top.
    pub fn build_config(&self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::from_properties_file(path)?,
            None => Config::default(),
        };
        self.apply_overrides(&mut config);
        Ok(config)
    }

    fn apply_overrides(&self, config: &mut Config) {
        if let Some(v) = &self.audit_bootstrap_servers {
            config.audit_log_bootstrap_servers = Some(v.clone());
        }
        if let Some(v) = &self.audit_api_key {
            config.audit_log_api_key = Some(v.clone());
        }
        if let Some(v) = &self.audit_api_secret {
            config.audit_log_api_secret = Some(v.clone());
        }
        if let Some(v) = &self.audit_topic {
            config.audit_log_topic = v.clone();
        }

        if let Some(v) = &self.target_bootstrap_servers {
            config.target_bootstrap_servers = Some(v.clone());
        }
        if let Some(v) = &self.target_api_key {
            config.target_api_key = Some(v.clone());
        }
        if let Some(v) = &self.target_api_secret {
            config.target_api_secret = Some(v.clone());
        }
        if let Some(v) = &self.output_topic {
            config.target_topic = Some(v.clone());
        }

        if let Some(v) = &self.target_schema_registry_url {
            config.target_schema_registry_url = Some(v.clone());
        }
        if let Some(v) = &self.target_schema_registry_api_key {
            config.target_schema_registry_api_key = Some(v.clone());
        }
        if let Some(v) = &self.target_schema_registry_api_secret {
            config.target_schema_registry_api_secret = Some(v.clone());
        }

        if let Some(v) = self.mode {
            config.processing_mode = v;
        }
        if let Some(v) = &self.start_timestamp {
            config.start_timestamp = Some(v.clone());
        }
        if let Some(v) = &self.end_timestamp {
            config.end_timestamp = Some(v.clone());
        }
        if self.stop_at_current {
            config.stop_at_current = true;
        }

        if let Some(v) = &self.consumer_group {
            config.consumer_group_id = v.clone();
        }

        if let Some(v) = &self.include_methods {
            config.include_methods = v
                .split(',')
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect();
        }
        if self.include_config_changes {
            config.set_include_config_changes(true);
        }
        if let Some(v) = &self.filter_subjects {
            config.subject_filters = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = self.only_successful {
            config.only_successful = v;
        }

        if let Some(v) = self.enable_deduplication {
            config.enable_deduplication = v;
        }
        if let Some(v) = &self.state_file {
            config.state_file_path = v.clone();
        }

        if let Some(v) = &self.security_protocol {
            config.security_protocol = v.clone();
        }
        if let Some(v) = &self.sasl_mechanism {
            config.sasl_mechanism = v.clone();
        }

        if let Some(v) = self.health_port {
            config.health_port = v;
        }
        if let Some(v) = self.processing_threads {
            config.processing_threads = v;
        }
        if self.dry_run {
            config.dry_run = true;
        }
        if let Some(v) = self.poll_timeout {
            config.poll_timeout_ms = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
    }
}
