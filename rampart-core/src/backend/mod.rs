//! Backup backends: each variant drives one kind of target system through its
//! vendor tooling and reports a terminal status back to the engine.

use crate::{
    config::database::SecretError,
    exec,
    operation::{Artifact, OperationConfig, OperationHandle, OperationStatus},
    store::StoreError,
};

pub mod pgdump;
pub mod velero;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Exec(#[from] exec::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error("unexpected {tool} output: {detail}")]
    UnexpectedOutput { tool: String, detail: String },
    #[error("unknown operation handle '{0}'")]
    UnknownHandle(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("i/o error during backend operation")]
    Io(#[from] std::io::Error),
}

/// Result of kicking off a backend operation: either a handle to poll, or an
/// operation that already reached a terminal status.
#[derive(Debug)]
pub enum StartOutcome {
    Started(OperationHandle),
    Finished(Finished),
}

#[derive(Debug)]
pub struct Finished {
    pub status: OperationStatus,
    pub artifacts: Vec<Artifact>,
    pub detail: Option<String>,
}

impl Finished {
    pub fn completed(artifacts: Vec<Artifact>) -> Self {
        Finished {
            status: OperationStatus::Completed,
            artifacts,
            detail: None,
        }
    }

    pub fn skipped(detail: impl Into<String>) -> Self {
        Finished {
            status: OperationStatus::Skipped,
            artifacts: vec![],
            detail: Some(detail.into()),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Finished {
            status: OperationStatus::Failed,
            artifacts: vec![],
            detail: Some(detail.into()),
        }
    }
}

#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    fn label(&self) -> &'static str;

    /// Cheap capability probe run before any mutation, e.g. a ping or a list
    /// call against the external service.
    async fn preflight(&self) -> Result<(), BackendError>;

    async fn start_backup(&self, config: &OperationConfig) -> Result<StartOutcome, BackendError>;

    async fn start_restore(
        &self,
        config: &OperationConfig,
        source: &Artifact,
    ) -> Result<StartOutcome, BackendError>;

    /// Read-only, safe to call repeatedly.
    async fn query_status(&self, handle: &OperationHandle)
        -> Result<OperationStatus, BackendError>;

    /// Diagnostic text for a failed operation; included verbatim in the run
    /// report. Never fails, an error while gathering diagnostics becomes part
    /// of the text.
    async fn describe(&self, handle: &OperationHandle) -> String;

    async fn list_artifacts(&self, owner: &str) -> Result<Vec<Artifact>, BackendError>;

    /// Looks up the artifact a completed operation produced, if the backend
    /// can name one for this handle.
    async fn resolve_artifact(
        &self,
        _handle: &OperationHandle,
    ) -> Result<Option<Artifact>, BackendError> {
        Ok(None)
    }

    async fn find_artifact(
        &self,
        owner: &str,
        id: &str,
    ) -> Result<Option<Artifact>, BackendError> {
        Ok(self
            .list_artifacts(owner)
            .await?
            .into_iter()
            .find(|artifact| artifact.id == id))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    /// Scriptable backend for engine and waiter tests. Counts every call.
    #[derive(Debug, Default)]
    pub(crate) struct FakeBackend {
        pub preflight_error: Mutex<Option<String>>,
        pub backup_outcome: Mutex<Option<StartOutcome>>,
        pub restore_outcome: Mutex<Option<StartOutcome>>,
        /// Statuses returned by successive `query_status` calls; the last one
        /// repeats once the script runs out.
        pub statuses: Mutex<Vec<OperationStatus>>,
        pub artifacts: Mutex<Vec<Artifact>>,
        pub describe_text: Mutex<String>,

        pub preflight_calls: AtomicUsize,
        pub backup_calls: AtomicUsize,
        pub restore_calls: AtomicUsize,
        pub status_calls: AtomicUsize,
    }

    impl FakeBackend {
        pub fn mutating_calls(&self) -> usize {
            self.backup_calls.load(Ordering::SeqCst) + self.restore_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Backend for FakeBackend {
        fn label(&self) -> &'static str {
            "fake"
        }

        async fn preflight(&self) -> Result<(), BackendError> {
            self.preflight_calls.fetch_add(1, Ordering::SeqCst);
            match self.preflight_error.lock().unwrap().as_ref() {
                Some(detail) => Err(BackendError::UnexpectedOutput {
                    tool: "fake".to_owned(),
                    detail: detail.clone(),
                }),
                None => Ok(()),
            }
        }

        async fn start_backup(
            &self,
            _config: &OperationConfig,
        ) -> Result<StartOutcome, BackendError> {
            self.backup_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .backup_outcome
                .lock()
                .unwrap()
                .take()
                .unwrap_or(StartOutcome::Finished(Finished::completed(vec![]))))
        }

        async fn start_restore(
            &self,
            _config: &OperationConfig,
            _source: &Artifact,
        ) -> Result<StartOutcome, BackendError> {
            self.restore_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .restore_outcome
                .lock()
                .unwrap()
                .take()
                .unwrap_or(StartOutcome::Finished(Finished::completed(vec![]))))
        }

        async fn query_status(
            &self,
            _handle: &OperationHandle,
        ) -> Result<OperationStatus, BackendError> {
            let n = self.status_calls.fetch_add(1, Ordering::SeqCst);
            let statuses = self.statuses.lock().unwrap();
            Ok(statuses
                .get(n)
                .or_else(|| statuses.last())
                .copied()
                .unwrap_or(OperationStatus::Running))
        }

        async fn describe(&self, _handle: &OperationHandle) -> String {
            self.describe_text.lock().unwrap().clone()
        }

        async fn list_artifacts(&self, owner: &str) -> Result<Vec<Artifact>, BackendError> {
            Ok(self
                .artifacts
                .lock()
                .unwrap()
                .iter()
                .filter(|artifact| artifact.owner == owner)
                .cloned()
                .collect())
        }

        async fn resolve_artifact(
            &self,
            _handle: &OperationHandle,
        ) -> Result<Option<Artifact>, BackendError> {
            Ok(self.artifacts.lock().unwrap().first().cloned())
        }
    }
}
