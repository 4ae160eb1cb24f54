//! Object store construction for local filesystem, S3 and in-memory tables.

use crate::config::StorageConfig;
use crate::io::ObjectTableStore;
use anyhow::{Context, Result};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{ClientOptions, ObjectStore, RetryConfig};
use std::sync::Arc;
use std::time::Duration;

/// Client options for S3 access. Table objects are small, so the pool is modest.
fn create_client_options() -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(5))
        .with_timeout(Duration::from_secs(30))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_pool_max_idle_per_host(32)
}

/// Retry configuration for transient S3 failures (429 and 5xx).
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        backoff: object_store::BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(120),
    }
}

/// Create an authenticated S3 client.
///
/// Credentials and region are loaded from (in order):
/// - Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_REGION)
/// - AWS config files (~/.aws/credentials, ~/.aws/config)
/// - EC2 instance profile (IMDS)
fn create_s3_store(bucket: &str) -> Result<Arc<dyn ObjectStore>> {
    tracing::info!("Creating S3 client for bucket: {}", bucket);

    let builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_client_options(create_client_options())
        .with_retry(create_retry_config());

    Ok(Arc::new(builder.build()?))
}

/// Create the object store described by the storage configuration.
/// Returns the store and the key prefix the tables live under.
pub fn create_object_store(config: &StorageConfig) -> Result<(Arc<dyn ObjectStore>, String)> {
    if config.in_memory {
        tracing::info!("Using in-memory table store");
        return Ok((Arc::new(InMemory::new()), String::new()));
    }

    match (&config.local_path, &config.bucket) {
        (Some(local_path), _) => {
            let path = std::path::Path::new(local_path);
            if !path.exists() {
                std::fs::create_dir_all(path)
                    .with_context(|| format!("Failed to create table directory {}", path.display()))?;
            }
            tracing::info!("Creating LocalFileSystem store at: {}", path.display());
            // Prefix is baked into the store
            Ok((Arc::new(LocalFileSystem::new_with_prefix(path)?), String::new()))
        }
        (_, Some(bucket)) => {
            let prefix = config.prefix.clone().unwrap_or_default();
            Ok((create_s3_store(bucket)?, prefix))
        }
        _ => anyhow::bail!("Invalid config: no storage destination"),
    }
}

/// Create the table store described by the storage configuration.
pub fn create_table_store(config: &StorageConfig) -> Result<ObjectTableStore> {
    let (store, prefix) = create_object_store(config)?;
    Ok(ObjectTableStore::new(store, &prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_s3_store() {
        let result = create_s3_store("test-bucket");
        assert!(result.is_ok());
    }

    #[test]
    fn test_create_local_store_creates_directory() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("nested").join("tables");
        let config = StorageConfig {
            local_path: Some(target.to_string_lossy().into_owned()),
            ..Default::default()
        };

        let (_, prefix) = create_object_store(&config).unwrap();
        assert!(target.exists());
        assert!(prefix.is_empty());
    }

    #[test]
    fn test_create_s3_store_keeps_prefix() {
        let config = StorageConfig {
            bucket: Some("bucket".into()),
            prefix: Some("warehouse/customers".into()),
            ..Default::default()
        };
        let (_, prefix) = create_object_store(&config).unwrap();
        assert_eq!(prefix, "warehouse/customers");
    }

    #[test]
    fn test_no_destination() {
        assert!(create_object_store(&StorageConfig::default()).is_err());
    }
}
