//! Configuration for the customer pipeline.

use crate::record::CountryCode;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Main configuration for the customer pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Pipeline semantics: countries, processing date, thresholds
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Where staging and destination tables live
    pub storage: StorageConfig,

    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// How `age` is derived from the date of birth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgePolicy {
    /// `as_of.year - dob.year`, ignoring month and day. Can be one year too
    /// high before the birthday. This is what the warehouse job computed.
    #[default]
    CalendarYear,

    /// Completed years as of the processing date.
    Exact,
}

/// Pipeline semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline identity, also the name of the run lock
    #[serde(default = "default_pipeline_name")]
    pub name: String,

    /// Country codes that get a destination table
    #[serde(default = "default_supported_countries")]
    pub supported_countries: BTreeSet<CountryCode>,

    /// Processing date override (defaults to today's UTC date)
    #[serde(default)]
    pub as_of_date: Option<NaiveDate>,

    /// Days since last consultation above which `flag_days_gt_30` is set
    #[serde(default = "default_stale_after_days")]
    pub stale_after_days: i64,

    /// Age computation policy
    #[serde(default)]
    pub age_policy: AgePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: default_pipeline_name(),
            supported_countries: default_supported_countries(),
            as_of_date: None,
            stale_after_days: default_stale_after_days(),
            age_policy: AgePolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// The processing date for a run: the override, or today (UTC).
    pub fn resolve_as_of(&self) -> NaiveDate {
        self.as_of_date.unwrap_or_else(|| Utc::now().date_naive())
    }
}

/// Storage destination. Exactly one of `local_path`, `bucket`+`prefix` or
/// `in_memory` must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Local filesystem directory holding the tables
    #[serde(default)]
    pub local_path: Option<String>,

    /// S3 bucket holding the tables (requires prefix)
    #[serde(default)]
    pub bucket: Option<String>,

    /// S3 key prefix (requires bucket)
    #[serde(default)]
    pub prefix: Option<String>,

    /// Keep tables in memory; nothing survives the process
    #[serde(default)]
    pub in_memory: bool,
}

impl StorageConfig {
    pub fn in_memory() -> Self {
        Self {
            in_memory: true,
            ..Default::default()
        }
    }

    /// Get the storage location as a display string.
    pub fn path_display(&self) -> String {
        if self.in_memory {
            "memory://".to_string()
        } else if let Some(path) = &self.local_path {
            path.clone()
        } else {
            format!(
                "s3://{}/{}",
                self.bucket.as_deref().unwrap_or(""),
                self.prefix.as_deref().unwrap_or("")
            )
        }
    }
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Number of destination partitions written concurrently
    #[serde(default = "default_partition_concurrency")]
    pub partition_concurrency: usize,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Rayon thread pool size for enrichment
    #[serde(default)]
    pub rayon_threads: Option<usize>,

    /// Enable metrics reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,

    /// Retry configuration for destination writes
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            partition_concurrency: default_partition_concurrency(),
            worker_threads: None,
            rayon_threads: None,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration for transient store failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Config {
    /// Configuration with defaults and the given storage.
    pub fn with_storage(storage: StorageConfig) -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            storage,
            processing: ProcessingConfig::default(),
        }
    }

    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        let storage = &self.storage;
        let destinations = [
            storage.local_path.is_some(),
            storage.bucket.is_some() || storage.prefix.is_some(),
            storage.in_memory,
        ];
        match destinations.iter().filter(|set| **set).count() {
            0 => anyhow::bail!("Must specify one of local_path, bucket and prefix, or in_memory"),
            1 => {}
            _ => anyhow::bail!("Only one of local_path, bucket/prefix or in_memory may be set"),
        }
        if storage.bucket.is_some() != storage.prefix.is_some() {
            anyhow::bail!("S3 storage requires both bucket and prefix");
        }

        if self.pipeline.name.trim().is_empty() {
            anyhow::bail!("Pipeline name must not be empty");
        }
        if self.pipeline.supported_countries.is_empty() {
            anyhow::bail!("At least one supported country is required");
        }
        if let Some(bad) = self
            .pipeline
            .supported_countries
            .iter()
            .find(|code| !code.is_well_formed())
        {
            anyhow::bail!("Invalid country code '{}': expected uppercase letters", bad);
        }
        if self.pipeline.stale_after_days < 0 {
            anyhow::bail!("stale_after_days must be >= 0");
        }
        if self.processing.partition_concurrency == 0 {
            anyhow::bail!("Partition concurrency must be > 0");
        }
        if self.processing.enable_metrics && self.processing.metrics_interval_secs == 0 {
            anyhow::bail!("Metrics interval must be > 0");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_pipeline_name() -> String { "customer_data_pipeline".to_string() }
fn default_supported_countries() -> BTreeSet<CountryCode> {
    ["IND", "USA"].into_iter().map(CountryCode::from).collect()
}
fn default_stale_after_days() -> i64 { 30 }
fn default_partition_concurrency() -> usize { 8 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }
fn default_max_retries() -> usize { 1 }
fn default_initial_backoff_ms() -> u64 { 500 }
fn default_max_backoff_ms() -> u64 { 10_000 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::with_storage(StorageConfig::in_memory());
        assert_eq!(config.pipeline.name, "customer_data_pipeline");
        assert_eq!(config.pipeline.stale_after_days, 30);
        assert_eq!(config.pipeline.age_policy, AgePolicy::CalendarYear);
        assert!(config.pipeline.supported_countries.contains(&CountryCode::from("IND")));
        assert!(config.pipeline.supported_countries.contains(&CountryCode::from("USA")));
        assert_eq!(config.processing.retry.max_retries, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
pipeline:
  supported_countries: [IND, USA, FRA]
  as_of_date: 2023-03-10
  stale_after_days: 45
  age_policy: exact
storage:
  local_path: /tmp/customers
processing:
  partition_concurrency: 2
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.pipeline.supported_countries.len(), 3);
        assert_eq!(config.pipeline.as_of_date, NaiveDate::from_ymd_opt(2023, 3, 10));
        assert_eq!(config.pipeline.resolve_as_of(), NaiveDate::from_ymd_opt(2023, 3, 10).unwrap());
        assert_eq!(config.pipeline.stale_after_days, 45);
        assert_eq!(config.pipeline.age_policy, AgePolicy::Exact);
        assert_eq!(config.processing.partition_concurrency, 2);
        assert!(config.processing.enable_metrics);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json() {
        let json = r#"{"storage": {"bucket": "b", "prefix": "customers"}}"#;
        let config = Config::from_json(json).unwrap();
        assert_eq!(config.storage.path_display(), "s3://b/customers");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = Config::with_storage(StorageConfig::in_memory());
        let yaml = config.to_yaml().unwrap();
        let back = Config::from_yaml(&yaml).unwrap();
        assert_eq!(back.pipeline.supported_countries, config.pipeline.supported_countries);
        assert!(back.storage.in_memory);
    }

    #[test]
    fn test_validation_storage() {
        let mut config = Config::with_storage(StorageConfig::default());
        assert!(config.validate().is_err());

        config.storage.local_path = Some("/tmp/x".into());
        config.storage.in_memory = true;
        assert!(config.validate().is_err());

        config.storage = StorageConfig {
            bucket: Some("bucket".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_pipeline() {
        let mut config = Config::with_storage(StorageConfig::in_memory());
        config.pipeline.supported_countries.clear();
        assert!(config.validate().is_err());

        let mut config = Config::with_storage(StorageConfig::in_memory());
        config.pipeline.supported_countries.insert(CountryCode::from("fr"));
        assert!(config.validate().is_err());

        let mut config = Config::with_storage(StorageConfig::in_memory());
        config.pipeline.stale_after_days = -1;
        assert!(config.validate().is_err());

        let mut config = Config::with_storage(StorageConfig::in_memory());
        config.processing.partition_concurrency = 0;
        assert!(config.validate().is_err());
    }
}
