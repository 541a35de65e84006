//! Age-based cleanup of stored backup artifacts.

use crate::{
    operation::Artifact,
    store::ObjectStore,
};
use std::{sync::Arc, time::Duration};
use time::OffsetDateTime;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Sweep {
    pub deleted: Vec<String>,
    pub kept: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct RetentionPolicy {
    store: Arc<dyn ObjectStore>,
    max_age: Duration,
}

impl std::fmt::Debug for RetentionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionPolicy")
            .field("max_age", &self.max_age)
            .finish_non_exhaustive()
    }
}

impl RetentionPolicy {
    pub fn new(store: Arc<dyn ObjectStore>, max_age: Duration) -> Self {
        RetentionPolicy { store, max_age }
    }

    /// Lists the owner's artifacts and applies the policy to them.
    pub async fn sweep(&self, scope_key: &str) -> Sweep {
        let artifacts = match self.store.list(scope_key).await {
            Ok(artifacts) => artifacts,
            Err(error) => {
                // cleanup never fails the run, not even at the listing stage
                tracing::warn!(%error, scope_key, "skipping retention pass, listing failed");
                return Sweep {
                    failed: 1,
                    ..Default::default()
                };
            }
        };
        self.apply(&artifacts, scope_key, OffsetDateTime::now_utc())
            .await
    }

    /// Deletes every artifact older than the retention window that belongs to
    /// `scope_key`. Artifacts of other owners are never touched, even when the
    /// listing was sloppy and included them. Deletion is best-effort per
    /// artifact.
    pub async fn apply(
        &self,
        artifacts: &[Artifact],
        scope_key: &str,
        now: OffsetDateTime,
    ) -> Sweep {
        let mut sweep = Sweep::default();
        for artifact in artifacts {
            if artifact.owner != scope_key {
                sweep.kept += 1;
                continue;
            }
            let expired = match artifact.age(now) {
                Some(age) => age > self.max_age,
                None => {
                    tracing::warn!(id = %artifact.id, "keeping artifact without a creation time");
                    false
                }
            };
            if !expired {
                sweep.kept += 1;
                continue;
            }
            match self.store.delete(artifact).await {
                Ok(()) => {
                    tracing::info!(id = %artifact.id, "deleted expired artifact");
                    sweep.deleted.push(artifact.id.clone());
                }
                Err(error) => {
                    tracing::warn!(%error, id = %artifact.id, "failed to delete expired artifact");
                    sweep.failed += 1;
                }
            }
        }
        sweep
    }
}
