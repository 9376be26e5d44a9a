use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::circuit::CircuitBreaker;
use crate::config::{Config, EnvironmentConfig, DEFAULT_SCHEMA_TYPE};
use crate::retry::{RetryPolicy, Retryable};

const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP_READ_TIMEOUT: Duration = Duration::from_secs(30);
const SCHEMA_REGISTRY_CONTENT_TYPE: &str = "application/vnd.schemaregistry.v1+json";

const BREAKER_FAILURE_THRESHOLD: u32 = 5;
const BREAKER_RESET_TIMEOUT: Duration = Duration::from_secs(30);

const RETRY_MAX_ATTEMPTS: u32 = 2;
const RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const RETRY_MAX_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("schema registry returned {status} for environment {environment_id} (schema id {schema_id:?}): {body}")]
    Http {
        environment_id: String,
        schema_id: Option<i32>,
        status: u16,
        body: String,
    },
    #[error("network error fetching schema from environment {environment_id}: {source}")]
    Network {
        environment_id: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid schema registry response from environment {environment_id}: {source}")]
    Parse {
        environment_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("schema registry for environment {environment_id} is unavailable (circuit open)")]
    CircuitOpen { environment_id: String },
}

impl Retryable for RegistryError {
    fn is_retryable(&self) -> bool {
        matches!(self, RegistryError::Network { .. })
    }
}

/// Schema details fetched from a registry.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaInfo {
    pub environment_id: String,
    pub schema_id: Option<i32>,
    pub subject: Option<String>,
    pub version: Option<i32>,
    pub schema: Option<String>,
    pub schema_type: String,
    pub references: Option<Value>,
}

/// Capability for looking up schema content. The processor depends on this
/// trait rather than the concrete client so tests can substitute a stub.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    async fn schema_by_id(
        &self,
        environment_id: &str,
        schema_id: i32,
    ) -> Result<Option<SchemaInfo>, RegistryError>;

    async fn schema_by_subject_version(
        &self,
        environment_id: &str,
        subject: &str,
        version: i32,
    ) -> Result<Option<SchemaInfo>, RegistryError>;

    fn has_environment(&self, environment_id: &str) -> bool;
}

/// HTTP client for the per-environment Confluent Schema Registries, with an
/// in-memory cache keyed by `(environment, schema id)`. Lookups retry
/// transient network failures and each environment is guarded by its own
/// circuit breaker.
pub struct SchemaRegistryService {
    client: reqwest::Client,
    environments: HashMap<String, EnvironmentConfig>,
    cache: DashMap<(String, i32), SchemaInfo>,
    breakers: HashMap<String, CircuitBreaker>,
    retry: RetryPolicy,
}

impl SchemaRegistryService {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .timeout(HTTP_READ_TIMEOUT)
            .build()?;

        let breakers = config
            .environments
            .keys()
            .map(|env_id| {
                (
                    env_id.clone(),
                    CircuitBreaker::new(
                        format!("schema-registry-{env_id}"),
                        BREAKER_FAILURE_THRESHOLD,
                        BREAKER_RESET_TIMEOUT,
                    ),
                )
            })
            .collect();

        info!(
            "Schema registry service initialized for {} environment(s): {:?}",
            config.environments.len(),
            config.environments.keys().collect::<Vec<_>>()
        );

        Ok(Self {
            client,
            environments: config.environments.clone(),
            cache: DashMap::new(),
            breakers,
            retry: RetryPolicy::new(RETRY_MAX_ATTEMPTS, RETRY_INITIAL_BACKOFF, RETRY_MAX_BACKOFF),
        })
    }

    /// Issues an authenticated GET, retrying network failures. Returns the
    /// response status and body.
    async fn get(
        &self,
        env: &EnvironmentConfig,
        url: &str,
        operation: &str,
    ) -> Result<(StatusCode, String), RegistryError> {
        let environment_id = env.environment_id.clone();
        self.retry
            .execute(operation, || {
                let client = self.client.clone();
                let url = url.to_string();
                let api_key = env.schema_registry_api_key.clone();
                let api_secret = env.schema_registry_api_secret.clone();
                let environment_id = environment_id.clone();
                async move {
                    let response = client
                        .get(&url)
                        .basic_auth(&api_key, Some(&api_secret))
                        .header(reqwest::header::ACCEPT, SCHEMA_REGISTRY_CONTENT_TYPE)
                        .send()
                        .await
                        .map_err(|source| RegistryError::Network {
                            environment_id: environment_id.clone(),
                            source,
                        })?;
                    let status = response.status();
                    let body = response
                        .text()
                        .await
                        .map_err(|source| RegistryError::Network {
                            environment_id: environment_id.clone(),
                            source,
                        })?;
                    Ok((status, body))
                }
            })
            .await
    }

    /// Fetches `(subject, version)` for a schema id. Failures degrade to
    /// `None` rather than failing the outer lookup.
    async fn fetch_version_info(
        &self,
        env: &EnvironmentConfig,
        schema_id: i32,
    ) -> Option<(Option<String>, Option<i32>)> {
        let base_url = normalize_url(&env.schema_registry_url);
        let url = format!("{base_url}/schemas/ids/{schema_id}/versions");

        let (status, body) = match self.get(env, &url, "fetch schema versions").await {
            Ok(response) => response,
            Err(e) => {
                debug!("Could not fetch version info for schema {schema_id}: {e}");
                return None;
            }
        };
        if status != StatusCode::OK {
            debug!("Version lookup for schema {schema_id} returned {status}");
            return None;
        }

        let json: Value = match serde_json::from_str(&body) {
            Ok(json) => json,
            Err(e) => {
                debug!("Could not parse version info for schema {schema_id}: {e}");
                return None;
            }
        };
        let first = json.as_array()?.first()?;
        let subject = first["subject"].as_str().map(str::to_string);
        let version = first["version"].as_i64().map(|v| v as i32);
        Some((subject, version))
    }

    fn breaker(&self, environment_id: &str) -> Option<&CircuitBreaker> {
        self.breakers.get(environment_id)
    }

    fn check_breaker(&self, environment_id: &str) -> Result<(), RegistryError> {
        if let Some(breaker) = self.breaker(environment_id) {
            breaker.check().map_err(|_| RegistryError::CircuitOpen {
                environment_id: environment_id.to_string(),
            })?;
        }
        Ok(())
    }

    fn record_outcome(&self, environment_id: &str, success: bool) {
        if let Some(breaker) = self.breaker(environment_id) {
            if success {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
        info!("Schema cache cleared");
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    pub fn close(&self) {
        self.cache.clear();
        info!("Schema registry service closed");
    }
}

#[async_trait]
impl SchemaRegistry for SchemaRegistryService {
    /// Fetches a schema by id, enriched with subject and version from the
    /// versions endpoint. Returns `None` for unknown environments and 404s.
    async fn schema_by_id(
        &self,
        environment_id: &str,
        schema_id: i32,
    ) -> Result<Option<SchemaInfo>, RegistryError> {
        let Some(env) = self.environments.get(environment_id) else {
            warn!("No schema registry configured for environment: {environment_id}");
            return Ok(None);
        };

        let cache_key = (environment_id.to_string(), schema_id);
        if let Some(cached) = self.cache.get(&cache_key) {
            debug!("Schema {environment_id}:{schema_id} found in cache");
            return Ok(Some(cached.clone()));
        }

        self.check_breaker(environment_id)?;

        let base_url = normalize_url(&env.schema_registry_url);
        let url = format!("{base_url}/schemas/ids/{schema_id}");
        let (status, body) = match self.get(env, &url, "fetch schema by id").await {
            Ok(response) => response,
            Err(e) => {
                self.record_outcome(environment_id, false);
                return Err(e);
            }
        };

        match status {
            StatusCode::OK => {
                let json: Value =
                    serde_json::from_str(&body).map_err(|source| RegistryError::Parse {
                        environment_id: environment_id.to_string(),
                        source,
                    })?;

                let version_info = self.fetch_version_info(env, schema_id).await;
                let (subject, version) = version_info.unwrap_or((None, None));

                let schema_info = SchemaInfo {
                    environment_id: environment_id.to_string(),
                    schema_id: Some(schema_id),
                    subject,
                    version,
                    schema: json["schema"].as_str().map(str::to_string),
                    schema_type: json["schemaType"]
                        .as_str()
                        .unwrap_or(DEFAULT_SCHEMA_TYPE)
                        .to_string(),
                    references: match &json["references"] {
                        Value::Null => None,
                        refs => Some(refs.clone()),
                    },
                };

                self.cache.insert(cache_key, schema_info.clone());
                self.record_outcome(environment_id, true);
                debug!(
                    "Fetched schema {schema_id} from environment {environment_id} (subject={:?}, version={:?})",
                    schema_info.subject, schema_info.version
                );
                Ok(Some(schema_info))
            }
            StatusCode::NOT_FOUND => {
                self.record_outcome(environment_id, true);
                warn!("Schema {schema_id} not found in environment {environment_id}");
                Ok(None)
            }
            other => {
                self.record_outcome(environment_id, false);
                Err(RegistryError::Http {
                    environment_id: environment_id.to_string(),
                    schema_id: Some(schema_id),
                    status: other.as_u16(),
                    body,
                })
            }
        }
    }

    /// Fetches a schema by subject and version. Returns `None` for unknown
    /// environments and 404s.
    async fn schema_by_subject_version(
        &self,
        environment_id: &str,
        subject: &str,
        version: i32,
    ) -> Result<Option<SchemaInfo>, RegistryError> {
        let Some(env) = self.environments.get(environment_id) else {
            warn!("No schema registry configured for environment: {environment_id}");
            return Ok(None);
        };

        self.check_breaker(environment_id)?;

        let base_url = normalize_url(&env.schema_registry_url);
        let url = format!("{base_url}/subjects/{subject}/versions/{version}");
        let (status, body) = match self.get(env, &url, "fetch schema by subject").await {
            Ok(response) => response,
            Err(e) => {
                self.record_outcome(environment_id, false);
                return Err(e);
            }
        };

        match status {
            StatusCode::OK => {
                let json: Value =
                    serde_json::from_str(&body).map_err(|source| RegistryError::Parse {
                        environment_id: environment_id.to_string(),
                        source,
                    })?;

                let schema_id = json["id"].as_i64().map(|id| id as i32);
                let schema_info = SchemaInfo {
                    environment_id: environment_id.to_string(),
                    schema_id,
                    subject: Some(subject.to_string()),
                    version: Some(version),
                    schema: json["schema"].as_str().map(str::to_string),
                    schema_type: json["schemaType"]
                        .as_str()
                        .unwrap_or(DEFAULT_SCHEMA_TYPE)
                        .to_string(),
                    references: match &json["references"] {
                        Value::Null => None,
                        refs => Some(refs.clone()),
                    },
                };

                if let Some(id) = schema_id {
                    self.cache
                        .insert((environment_id.to_string(), id), schema_info.clone());
                }
                self.record_outcome(environment_id, true);
                debug!(
                    "Fetched schema for subject {subject} version {version} from environment {environment_id}"
                );
                Ok(Some(schema_info))
            }
            StatusCode::NOT_FOUND => {
                self.record_outcome(environment_id, true);
                warn!(
                    "Schema for subject {subject} version {version} not found in environment {environment_id}"
                );
                Ok(None)
            }
            other => {
                self.record_outcome(environment_id, false);
                Err(RegistryError::Http {
                    environment_id: environment_id.to_string(),
                    schema_id: None,
                    status: other.as_u16(),
                    body,
                })
            }
        }
    }

    fn has_environment(&self, environment_id: &str) -> bool {
        self.environments.contains_key(environment_id)
    }
}

fn normalize_url(url: &str) -> &str {
    url.trim_end_matches('/')
}
