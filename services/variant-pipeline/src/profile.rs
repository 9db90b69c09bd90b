use crate::config::ConfigError;
use crate::naming::{destination_key, ObjectKey};
use crate::notifier::ORIGINAL_FILENAME_FIELD;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Encoding of a derivative
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Re-encode in the format the source was decoded from
    #[default]
    SameAsSource,
    /// Re-encode as baseline JPEG
    Jpeg,
}

/// One derivative of a profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantSpec {
    /// Size tier, used for the destination path, the filename prefix and the
    /// metadata field name (`{label}Filename`)
    pub label: String,
    /// Output width in pixels; height follows the source aspect ratio
    pub target_width: u32,
    #[serde(default)]
    pub output_format: OutputFormat,
    /// JPEG quality (0-100). Ignored for same-as-source output.
    #[serde(default)]
    pub quality: Option<u8>,
}

impl VariantSpec {
    pub fn jpeg(label: &str, target_width: u32, quality: u8) -> Self {
        Self {
            label: label.to_string(),
            target_width,
            output_format: OutputFormat::Jpeg,
            quality: Some(quality),
        }
    }

    pub fn same_as_source(label: &str, target_width: u32) -> Self {
        Self {
            label: label.to_string(),
            target_width,
            output_format: OutputFormat::SameAsSource,
            quality: None,
        }
    }

    /// Name of this variant's field in the metadata payload
    pub fn metadata_field(&self) -> String {
        format!("{}Filename", self.label)
    }
}

/// Rules applied to objects of a bucket and/or key prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantProfile {
    /// Profile name for logging and metrics
    pub name: String,
    /// Buckets this profile applies to (empty = any bucket)
    #[serde(default)]
    pub buckets: Vec<String>,
    /// Key prefix this profile applies to (unset = any key)
    #[serde(default)]
    pub prefix: Option<String>,
    /// Accepted file extensions, compared case-insensitively
    pub accepted_extensions: Vec<String>,
    /// Derivatives to produce, in order
    pub variants: Vec<VariantSpec>,
    /// First path segment of every derivative key
    pub root_prefix: String,
    /// Path appended to the API base URL for the metadata update
    pub metadata_path: String,
}

impl VariantProfile {
    /// Whether this profile applies to the given bucket and key
    pub fn matches(&self, bucket: &str, key: &str) -> bool {
        let prefix_matches = self
            .prefix
            .as_deref()
            .map(|prefix| key.starts_with(prefix))
            .unwrap_or(true);

        self.covers_bucket(bucket) && prefix_matches
    }

    pub fn covers_bucket(&self, bucket: &str) -> bool {
        self.buckets.is_empty() || self.buckets.iter().any(|b| b == bucket)
    }

    /// Folder a variant is written to: `{root_prefix}/{label}/`
    pub fn output_folder(&self, label: &str) -> String {
        destination_key(&self.root_prefix, label, "")
    }

    /// Whether `key` lies in one of this profile's output folders
    pub fn writes_to(&self, key: &str) -> bool {
        self.variants
            .iter()
            .any(|spec| key.starts_with(&self.output_folder(&spec.label)))
    }

    /// Classify a filename: accepted when the text after its final `.` is one
    /// of the accepted extensions, ignoring case.
    pub fn accepts(&self, filename_with_extension: &str) -> bool {
        match ObjectKey::new(filename_with_extension).extension() {
            Some(ext) if !ext.is_empty() => self
                .accepted_extensions
                .iter()
                .any(|accepted| accepted.eq_ignore_ascii_case(ext)),
            _ => false,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let key = |field: &str| format!("profiles.{}.{}", self.name, field);

        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingRequired("profiles[].name".to_string()));
        }
        if self.root_prefix.trim_matches('/').is_empty() {
            return Err(ConfigError::MissingRequired(key("root_prefix")));
        }
        if self.accepted_extensions.iter().all(|e| e.trim().is_empty()) {
            return Err(ConfigError::MissingRequired(key("accepted_extensions")));
        }
        if self.variants.is_empty() {
            return Err(ConfigError::MissingRequired(key("variants")));
        }

        let mut labels = HashSet::new();
        for spec in &self.variants {
            if spec.label.is_empty() || spec.label.contains('/') {
                return Err(ConfigError::InvalidValue {
                    key: key("variants.label"),
                    message: format!("invalid label {:?}", spec.label),
                });
            }
            if spec.metadata_field() == ORIGINAL_FILENAME_FIELD {
                return Err(ConfigError::InvalidValue {
                    key: key("variants.label"),
                    message: format!(
                        "label {:?} collides with the {} payload field",
                        spec.label, ORIGINAL_FILENAME_FIELD
                    ),
                });
            }
            if !labels.insert(spec.label.as_str()) {
                return Err(ConfigError::InvalidValue {
                    key: key("variants.label"),
                    message: format!("duplicate label {:?}", spec.label),
                });
            }
            if spec.target_width == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key("variants.target_width"),
                    message: format!("{}: width must be greater than zero", spec.label),
                });
            }
            if matches!(spec.quality, Some(q) if q > 100) {
                return Err(ConfigError::InvalidValue {
                    key: key("variants.quality"),
                    message: format!("{}: quality must be within 0-100", spec.label),
                });
            }
            // Outputs under the source prefix would trigger this profile again
            if let Some(prefix) = self.prefix.as_deref() {
                let folder = self.output_folder(&spec.label);
                if folder.starts_with(prefix) || prefix.starts_with(&folder) {
                    return Err(ConfigError::InvalidValue {
                        key: key("variants.label"),
                        message: format!(
                            "{}: output folder {} overlaps source prefix {}",
                            spec.label, folder, prefix
                        ),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Ordered profile lookup table; the first matching profile wins
#[derive(Debug, Clone, Default)]
pub struct ProfileTable {
    profiles: Vec<VariantProfile>,
}

impl ProfileTable {
    pub fn new(profiles: Vec<VariantProfile>) -> Result<Self, ConfigError> {
        for profile in &profiles {
            profile.validate()?;
        }
        Ok(Self { profiles })
    }

    /// The profiles every deployment ships with
    pub fn builtin() -> Self {
        let photo_extensions = vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()];

        Self {
            profiles: vec![
                VariantProfile {
                    name: "places".to_string(),
                    buckets: vec![],
                    prefix: Some("places/original/".to_string()),
                    accepted_extensions: photo_extensions.clone(),
                    variants: vec![
                        VariantSpec::jpeg("small", 350, 25),
                        VariantSpec::jpeg("medium", 650, 60),
                    ],
                    root_prefix: "places".to_string(),
                    metadata_path: "/place-photos/metadata".to_string(),
                },
                VariantProfile {
                    name: "avatars".to_string(),
                    buckets: vec![],
                    prefix: Some("avatars/original/".to_string()),
                    accepted_extensions: photo_extensions,
                    variants: vec![VariantSpec::jpeg("thumbnail", 200, 60)],
                    root_prefix: "avatars".to_string(),
                    metadata_path: "/avatars/metadata".to_string(),
                },
                VariantProfile {
                    name: "places-legacy".to_string(),
                    buckets: vec![],
                    prefix: Some("place-photos/original/".to_string()),
                    accepted_extensions: ["jpg", "jpeg", "png", "gif", "bmp"]
                        .iter()
                        .map(|e| e.to_string())
                        .collect(),
                    variants: vec![
                        VariantSpec::same_as_source("small", 400),
                        VariantSpec::same_as_source("medium", 700),
                    ],
                    root_prefix: "places".to_string(),
                    metadata_path: "/place-photos/metadata".to_string(),
                },
            ],
        }
    }

    /// Profile whose output folders contain `key` in `bucket`, if any.
    ///
    /// Variants are written back to the source bucket, so their own creation
    /// notifications come through here and must not be processed again.
    pub fn derivative_owner(&self, bucket: &str, key: &str) -> Option<&VariantProfile> {
        self.profiles
            .iter()
            .find(|p| p.covers_bucket(bucket) && p.writes_to(key))
    }

    /// Find the profile for an object, if any
    pub fn resolve(&self, bucket: &str, key: &str) -> Option<&VariantProfile> {
        let profile = self.profiles.iter().find(|p| p.matches(bucket, key));
        debug!(
            bucket = %bucket,
            key = %key,
            profile = profile.map(|p| p.name.as_str()).unwrap_or("none"),
            "Resolved variant profile"
        );
        profile
    }

    pub fn profiles(&self) -> &[VariantProfile] {
        &self.profiles
    }
}
