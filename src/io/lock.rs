//! Run-level mutual exclusion.
//!
//! Replace semantics make two concurrent runs against the same tables unsafe
//! (last writer wins). A run claims `_locks/<pipeline>.lock` with a
//! create-only put before its first stage and deletes it after its last.

use crate::error::{StoreError, StoreResult};
use chrono::Utc;
use object_store::path::Path;
use object_store::{ObjectStore, ObjectStoreExt, PutMode, PutPayload};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const LOCK_DIR: &str = "_locks";

/// Contents of a lock object, for operators inspecting a stale lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pipeline: String,
    pub acquired_at: String,
    pub pid: u32,
}

/// A held run lock. Call [`RunLock::release`] when the run ends.
pub struct RunLock {
    store: Arc<dyn ObjectStore>,
    path: Path,
    pipeline: String,
}

fn lock_path(prefix: &str, pipeline: &str) -> Path {
    let file = format!("{}.lock", pipeline);
    Path::from_iter(
        prefix
            .split('/')
            .filter(|part| !part.is_empty())
            .chain([LOCK_DIR, file.as_str()]),
    )
}

impl RunLock {
    /// Try to take the lock for `pipeline`. Returns `Ok(None)` if another run holds it.
    pub async fn acquire(
        store: Arc<dyn ObjectStore>,
        prefix: &str,
        pipeline: &str,
    ) -> StoreResult<Option<Self>> {
        let path = lock_path(prefix, pipeline);
        let info = LockInfo {
            pipeline: pipeline.to_string(),
            acquired_at: Utc::now().to_rfc3339(),
            pid: std::process::id(),
        };
        let payload = PutPayload::from(serde_json::to_vec(&info)?);

        match store.put_opts(&path, payload, PutMode::Create.into()).await {
            Ok(_) => {
                tracing::debug!("Acquired run lock {}", path);
                Ok(Some(Self {
                    store,
                    path,
                    pipeline: pipeline.to_string(),
                }))
            }
            Err(object_store::Error::AlreadyExists { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// Release the lock.
    pub async fn release(self) -> StoreResult<()> {
        match self.store.delete(&self.path).await {
            Ok(_) | Err(object_store::Error::NotFound { .. }) => {
                tracing::debug!("Released run lock {}", self.path);
                Ok(())
            }
            Err(e) => Err(StoreError::Backend(e)),
        }
    }

    /// Remove a lock left behind by a crashed run. Returns whether one existed.
    pub async fn force_release(
        store: &dyn ObjectStore,
        prefix: &str,
        pipeline: &str,
    ) -> StoreResult<bool> {
        let path = lock_path(prefix, pipeline);

        // Deleting a missing key succeeds on most backends, so check first.
        match store.head(&path).await {
            Ok(_) => {}
            Err(object_store::Error::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        match store.delete(&path).await {
            Ok(_) | Err(object_store::Error::NotFound { .. }) => {
                tracing::warn!("Removed run lock {}", path);
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }
}
