use crate::environment::EnvironmentTable;
use crate::pipeline::PartialWritePolicy;
use crate::profile::{ProfileTable, VariantProfile};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    LoadError(String),
}

/// Main configuration for the variant service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka notification consumer
    #[serde(default)]
    pub kafka: KafkaConfig,
    /// Object storage
    #[serde(default)]
    pub s3: S3Config,
    /// Webhook and health API
    #[serde(default)]
    pub api: ApiConfig,
    /// Metadata API client
    #[serde(default)]
    pub notifier: NotifierConfig,
    /// Pipeline behavior
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Variant profiles, evaluated in order (empty = built-in profiles)
    #[serde(default)]
    pub profiles: Vec<VariantProfile>,
    /// Deployment environments keyed by name (production, staging, ...)
    #[serde(default)]
    pub environments: HashMap<String, EnvironmentConfig>,
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

/// Kafka consumer configuration for bucket notifications
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Consume notifications from Kafka
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Kafka bootstrap servers
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    /// Consumer group ID
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Topic the bucket publishes notifications to
    #[serde(default = "default_notification_topic")]
    pub notification_topic: String,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Auto offset reset policy
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Max poll interval in milliseconds
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
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
    /// Static access key; the default credential chain is used when unset
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Cache-Control header set on written variants
    pub cache_control: Option<String>,
}

/// API configuration for the webhook endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

/// Metadata API client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    /// Request timeout in seconds
    #[serde(default = "default_notifier_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    /// What happens to already-written variants when a sibling upload fails
    #[serde(default)]
    pub partial_write_policy: PartialWritePolicy,
}

/// One deployment environment
#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentConfig {
    /// Source bucket served by this environment
    pub bucket: String,
    /// Metadata API base URL
    pub api_base_url: String,
    /// Bearer token for the metadata API
    #[serde(default)]
    pub bearer_token: String,
}

// Default value functions
fn default_service_name() -> String {
    "variant-pipeline".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_true() -> bool {
    true
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_consumer_group() -> String {
    "variant-pipeline".to_string()
}

fn default_notification_topic() -> String {
    "bucket-notifications".to_string()
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

fn default_region() -> String {
    "ap-northeast-3".to_string()
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_notifier_timeout_secs() -> u64 {
    10
}

fn default_user_agent() -> String {
    concat!("variant-pipeline/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Config {
    /// Load configuration from config files and the environment
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/variants").required(false))
            .add_source(config::File::with_name("/etc/variants/variants").required(false))
            // VARIANTS__S3__REGION -> s3.region
            // VARIANTS__ENVIRONMENTS__PRODUCTION__BEARER_TOKEN -> environments.production.bearer_token
            .add_source(
                config::Environment::with_prefix("VARIANTS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;

        let config: Self = config
            .try_deserialize()
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kafka.enabled && self.kafka.bootstrap_servers.is_empty() {
            return Err(ConfigError::MissingRequired(
                "kafka.bootstrap_servers".to_string(),
            ));
        }

        if self.s3.access_key_id.is_some() != self.s3.secret_access_key.is_some() {
            return Err(ConfigError::InvalidValue {
                key: "s3.access_key_id".to_string(),
                message: "access key id and secret must be set together".to_string(),
            });
        }

        if self.notifier.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "notifier.timeout_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        self.profile_table()?;
        self.environment_table()?;

        Ok(())
    }

    /// Profile table from configuration, or the built-in profiles
    pub fn profile_table(&self) -> Result<ProfileTable, ConfigError> {
        if self.profiles.is_empty() {
            return Ok(ProfileTable::builtin());
        }
        ProfileTable::new(self.profiles.clone())
    }

    pub fn environment_table(&self) -> Result<EnvironmentTable, ConfigError> {
        EnvironmentTable::from_config(&self.environments)
    }

    /// Get the metadata request timeout as Duration
    pub fn notifier_timeout(&self) -> Duration {
        Duration::from_secs(self.notifier.timeout_secs)
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

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bootstrap_servers: default_bootstrap_servers(),
            consumer_group: default_consumer_group(),
            notification_topic: default_notification_topic(),
            ssl_enabled: false,
            ssl_ca_location: None,
            sasl_username: None,
            sasl_password: None,
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            access_key_id: None,
            secret_access_key: None,
            cache_control: None,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_notifier_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}
