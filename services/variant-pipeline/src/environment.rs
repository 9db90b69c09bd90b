use crate::config::{ConfigError, EnvironmentConfig};
use std::collections::HashMap;
use tracing::warn;

/// Metadata API endpoint and credential for one deployment environment
#[derive(Clone, Default, PartialEq, Eq)]
pub struct EnvironmentBinding {
    pub api_base_url: String,
    pub bearer_token: String,
}

impl EnvironmentBinding {
    pub fn new(api_base_url: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            bearer_token: bearer_token.into(),
        }
    }

    /// True for the binding returned for an unrecognized bucket
    pub fn is_empty(&self) -> bool {
        self.api_base_url.is_empty() && self.bearer_token.is_empty()
    }
}

// The token never goes to the logs.
impl std::fmt::Debug for EnvironmentBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentBinding")
            .field("api_base_url", &self.api_base_url)
            .field("bearer_token", &"<redacted>")
            .finish()
    }
}

/// Bucket to environment lookup, read-only after construction
#[derive(Debug, Clone, Default)]
pub struct EnvironmentTable {
    by_bucket: HashMap<String, (String, EnvironmentBinding)>,
}

impl EnvironmentTable {
    /// Build the table from named environments (production, staging, ...)
    pub fn from_config(
        environments: &HashMap<String, EnvironmentConfig>,
    ) -> Result<Self, ConfigError> {
        let mut by_bucket = HashMap::new();

        for (name, env) in environments {
            if env.bucket.is_empty() {
                return Err(ConfigError::MissingRequired(format!(
                    "environments.{name}.bucket"
                )));
            }
            let binding = EnvironmentBinding::new(
                env.api_base_url.trim_end_matches('/'),
                env.bearer_token.clone(),
            );
            if by_bucket
                .insert(env.bucket.clone(), (name.clone(), binding))
                .is_some()
            {
                return Err(ConfigError::InvalidValue {
                    key: format!("environments.{name}.bucket"),
                    message: format!("bucket {} is bound to more than one environment", env.bucket),
                });
            }
        }

        Ok(Self { by_bucket })
    }

    pub fn insert(&mut self, name: &str, bucket: &str, binding: EnvironmentBinding) {
        self.by_bucket
            .insert(bucket.to_string(), (name.to_string(), binding));
    }

    /// Binding for a source bucket. Unknown buckets get an empty binding.
    pub fn resolve(&self, bucket: &str) -> EnvironmentBinding {
        match self.by_bucket.get(bucket) {
            Some((_, binding)) => binding.clone(),
            None => {
                warn!(bucket = %bucket, "No environment bound to bucket");
                EnvironmentBinding::default()
            }
        }
    }

    /// Environment name for a source bucket
    pub fn environment_name(&self, bucket: &str) -> Option<&str> {
        self.by_bucket.get(bucket).map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.by_bucket.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_bucket.is_empty()
    }
}
