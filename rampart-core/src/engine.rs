//! The orchestration engine: one run from validation to notification.
//!
//! A run always produces a [`RunReport`] and always notifies exactly once.
//! Internal errors never escape `run`; they become a failed report so the
//! notification and the exit code cannot diverge from what happened.

use crate::{
    backend::{Backend, BackendError, StartOutcome},
    notify::Notifier,
    operation::{Artifact, Mode, OperationConfig, OperationStatus},
    probes::{ProbeResult, ProbeSuite},
    report::RunReport,
    retention::RetentionPolicy,
    wait::PollingWaiter,
};
use std::sync::Arc;
use time::OffsetDateTime;

#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

struct RunOutcome {
    status: OperationStatus,
    detail: Option<String>,
    artifacts: Vec<Artifact>,
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

pub struct OrchestrationEngine {
    backend: Option<Arc<dyn Backend>>,
    waiter: PollingWaiter,
    retention: Option<RetentionPolicy>,
    probes: Option<ProbeSuite>,
    notifier: Arc<dyn Notifier>,
}

impl OrchestrationEngine {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        OrchestrationEngine {
            backend: None,
            waiter: PollingWaiter::default(),
            retention: None,
            probes: None,
            notifier,
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_waiter(mut self, waiter: PollingWaiter) -> Self {
        self.waiter = waiter;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn with_probes(mut self, probes: ProbeSuite) -> Self {
        self.probes = Some(probes);
        self
    }

    /// Runs one operation end to end. Never fails; whatever goes wrong ends
    /// up in the report, and the notifier is called exactly once either way.
    pub async fn run(&self, config: &OperationConfig) -> RunReport {
        let started = OffsetDateTime::now_utc();
        tracing::info!(
            mode = %config.mode,
            target = config.owner(),
            environment = %config.environment,
            "starting run"
        );

        let inner = self.run_inner(config).await;
        // a run that never got past validation has no verdict to probe for
        let probes = match &inner {
            Ok(_) => self.run_probes(config).await,
            Err(_) => vec![],
        };
        let (status, mut detail, artifacts) = match inner {
            Ok(outcome) => (outcome.status, outcome.detail, outcome.artifacts),
            Err(error) => {
                tracing::error!(error = %error_chain(&error), "run failed");
                (OperationStatus::Failed, Some(error_chain(&error)), vec![])
            }
        };

        if let Some(line) = self.sweep_retention(config, status).await {
            detail = Some(match detail {
                Some(detail) => format!("{}\n{}", detail, line),
                None => line,
            });
        }

        let report = RunReport {
            environment: config.environment.clone(),
            mode: config.mode,
            target: config.owner().to_owned(),
            started,
            finished: OffsetDateTime::now_utc(),
            status,
            detail,
            artifacts,
            probes,
        };

        if let Err(error) = self.notifier.send(report.success(), &report.summary()).await {
            // a lost notification must not change the run's outcome
            tracing::error!(error = %error_chain(&error), "failed to send notification");
        }
        report
    }

    async fn run_inner(&self, config: &OperationConfig) -> Result<RunOutcome, RunError> {
        config.validate().map_err(RunError::Configuration)?;

        if config.mode == Mode::Test {
            // the probes carry the verdict; the operation itself has no work
            return Ok(RunOutcome {
                status: OperationStatus::Completed,
                detail: None,
                artifacts: vec![],
            });
        }

        let backend = self.backend.as_ref().ok_or_else(|| {
            RunError::Configuration("no backend configured for this target".to_owned())
        })?;
        backend
            .preflight()
            .await
            .map_err(|error| RunError::Precondition(error_chain(&error)))?;

        let start = match config.mode {
            Mode::Backup => backend.start_backup(config).await?,
            Mode::Restore => {
                let id = config.source_artifact.as_deref().ok_or_else(|| {
                    RunError::Configuration("restore requires a source artifact".to_owned())
                })?;
                let source = backend
                    .find_artifact(config.owner(), id)
                    .await?
                    .ok_or_else(|| {
                        RunError::Precondition(format!(
                            "source artifact '{}' not found for '{}'",
                            id,
                            config.owner()
                        ))
                    })?;
                backend.start_restore(config, &source).await?
            }
            Mode::Test => unreachable!("handled above"),
        };

        match start {
            StartOutcome::Finished(finished) => Ok(RunOutcome {
                status: finished.status,
                detail: finished.detail,
                artifacts: finished.artifacts,
            }),
            StartOutcome::Started(handle) => {
                let status = self.waiter.wait(backend.as_ref(), &handle).await?;
                let mut artifacts = vec![];
                let detail = match status {
                    OperationStatus::Completed => {
                        match backend.resolve_artifact(&handle).await {
                            Ok(resolved) => artifacts.extend(resolved),
                            Err(error) => {
                                tracing::warn!(
                                    error = %error_chain(&error),
                                    "completed, but the resulting artifact could not be resolved"
                                );
                            }
                        }
                        None
                    }
                    OperationStatus::Failed | OperationStatus::PartiallyFailed => {
                        Some(backend.describe(&handle).await)
                    }
                    _ => None,
                };
                Ok(RunOutcome {
                    status,
                    detail,
                    artifacts,
                })
            }
        }
    }

    async fn sweep_retention(
        &self,
        config: &OperationConfig,
        status: OperationStatus,
    ) -> Option<String> {
        if config.mode == Mode::Test || config.dry_run || !status.is_success() {
            return None;
        }
        let retention = self.retention.as_ref()?;
        let sweep = retention.sweep(config.owner()).await;
        Some(format!(
            "retention: {} deleted, {} kept, {} failed",
            sweep.deleted.len(),
            sweep.kept,
            sweep.failed
        ))
    }

    async fn run_probes(&self, config: &OperationConfig) -> Vec<ProbeResult> {
        if config.mode != Mode::Test {
            return vec![];
        }
        match &self.probes {
            Some(suite) if !suite.is_empty() => suite.run(&config.probes).await,
            _ => {
                tracing::warn!("test mode requested but no probes are configured");
                vec![]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{testing::FakeBackend, Finished},
        config::database,
        notify::testing::{BrokenNotifier, RecordingNotifier},
        operation::{Location, OperationHandle, Target},
        probes::{Probe, ProbeOutcome},
        retention::RetentionPolicy,
        store::testing::MemoryStore,
    };
    use std::{sync::atomic::Ordering, time::Duration};
    use time::macros::datetime;

    fn config(mode: Mode) -> OperationConfig {
        OperationConfig {
            environment: "staging".to_owned(),
            mode,
            target: Target::Database(
                database::Name("myapp".to_owned()),
                database::Definition::default(),
            ),
            include_namespaces: vec![],
            exclude_namespaces: vec![],
            retention: Duration::from_secs(30 * 24 * 3600),
            encrypt: false,
            include_volumes: false,
            source_artifact: None,
            restore_namespace: None,
            dry_run: false,
            probes: vec![],
        }
    }

    fn artifact(id: &str, created: OffsetDateTime) -> Artifact {
        Artifact {
            id: id.to_owned(),
            created: Some(created),
            size: 1,
            owner: "myapp".to_owned(),
            location: Location::Remote(format!("mem://{}", id)),
        }
    }

    fn engine(
        backend: Arc<FakeBackend>,
        notifier: Arc<RecordingNotifier>,
    ) -> OrchestrationEngine {
        OrchestrationEngine::new(notifier).with_backend(backend)
    }

    #[tokio::test]
    async fn should_fail_invalid_config_without_touching_the_backend() {
        let backend = Arc::new(FakeBackend::default());
        let notifier = Arc::new(RecordingNotifier::default());
        // restore without a source artifact fails validation
        let report = engine(backend.clone(), notifier.clone())
            .run(&config(Mode::Restore))
            .await;

        assert_eq!(report.status, OperationStatus::Failed);
        assert!(report.detail.unwrap().contains("configuration error"));
        assert_eq!(backend.preflight_calls.load(Ordering::SeqCst), 0);
        assert_eq!(backend.mutating_calls(), 0);
        assert_eq!(notifier.sends.load(Ordering::SeqCst), 1);
        assert!(!notifier.last.lock().unwrap().as_ref().unwrap().0);
    }

    #[tokio::test]
    async fn should_report_skipped_dry_run_as_success() {
        let backend = Arc::new(FakeBackend::default());
        *backend.backup_outcome.lock().unwrap() = Some(StartOutcome::Finished(
            Finished::skipped("would dump database 'myapp'"),
        ));
        let notifier = Arc::new(RecordingNotifier::default());
        let mut config = config(Mode::Backup);
        config.dry_run = true;

        let report = engine(backend, notifier.clone()).run(&config).await;

        assert_eq!(report.status, OperationStatus::Skipped);
        assert_eq!(report.exit_code(), 0);
        assert!(notifier.last.lock().unwrap().as_ref().unwrap().0);
    }

    #[tokio::test]
    async fn should_complete_backup_and_report_artifacts() {
        let backend = Arc::new(FakeBackend::default());
        *backend.backup_outcome.lock().unwrap() = Some(StartOutcome::Finished(
            Finished::completed(vec![artifact(
                "db/myapp/myapp-20260829-101500.dump",
                datetime!(2026-08-29 10:15:00 UTC),
            )]),
        ));
        let notifier = Arc::new(RecordingNotifier::default());

        let report = engine(backend.clone(), notifier.clone())
            .run(&config(Mode::Backup))
            .await;

        assert_eq!(report.status, OperationStatus::Completed);
        assert_eq!(report.artifacts.len(), 1);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(backend.backup_calls.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn should_poll_async_operations_to_completion() {
        let backend = Arc::new(FakeBackend::default());
        *backend.backup_outcome.lock().unwrap() = Some(StartOutcome::Started(OperationHandle(
            "backup:prod-1".to_owned(),
        )));
        *backend.statuses.lock().unwrap() =
            vec![OperationStatus::Running, OperationStatus::Completed];
        *backend.artifacts.lock().unwrap() =
            vec![artifact("prod-1", datetime!(2026-08-29 10:15:00 UTC))];
        let notifier = Arc::new(RecordingNotifier::default());

        let report = engine(backend.clone(), notifier.clone())
            .run(&config(Mode::Backup))
            .await;

        assert_eq!(report.status, OperationStatus::Completed);
        assert_eq!(backend.status_calls.load(Ordering::SeqCst), 2);
        // the completed handle is resolved back to the artifact it produced
        assert_eq!(report.artifacts.len(), 1);
        assert_eq!(report.artifacts[0].id, "prod-1");
    }

    #[tokio::test]
    async fn should_attach_diagnostics_to_failed_async_operations() {
        let backend = Arc::new(FakeBackend::default());
        *backend.backup_outcome.lock().unwrap() = Some(StartOutcome::Started(OperationHandle(
            "backup:prod-1".to_owned(),
        )));
        *backend.statuses.lock().unwrap() = vec![OperationStatus::Failed];
        *backend.describe_text.lock().unwrap() = "volume snapshot quota exceeded".to_owned();
        let notifier = Arc::new(RecordingNotifier::default());

        let report = engine(backend, notifier.clone()).run(&config(Mode::Backup)).await;

        assert_eq!(report.status, OperationStatus::Failed);
        assert_eq!(report.exit_code(), 1);
        assert!(report.detail.unwrap().contains("quota exceeded"));
        assert!(!notifier.last.lock().unwrap().as_ref().unwrap().0);
    }

    #[tokio::test]
    async fn should_fail_restore_when_source_artifact_is_missing() {
        let backend = Arc::new(FakeBackend::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let mut config = config(Mode::Restore);
        config.source_artifact = Some("db/myapp/nope.dump".to_owned());

        let report = engine(backend.clone(), notifier.clone()).run(&config).await;

        assert_eq!(report.status, OperationStatus::Failed);
        assert!(report.detail.unwrap().contains("not found"));
        assert_eq!(backend.restore_calls.load(Ordering::SeqCst), 0);
        assert_eq!(notifier.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_restore_from_a_listed_artifact() {
        let backend = Arc::new(FakeBackend::default());
        *backend.artifacts.lock().unwrap() = vec![artifact(
            "db/myapp/myapp-20260828-000000.dump",
            datetime!(2026-08-28 00:00:00 UTC),
        )];
        let notifier = Arc::new(RecordingNotifier::default());
        let mut config = config(Mode::Restore);
        config.source_artifact = Some("db/myapp/myapp-20260828-000000.dump".to_owned());

        let report = engine(backend.clone(), notifier.clone()).run(&config).await;

        assert_eq!(report.status, OperationStatus::Completed);
        assert_eq!(backend.restore_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_fail_on_preflight_error_without_mutations() {
        let backend = Arc::new(FakeBackend::default());
        *backend.preflight_error.lock().unwrap() = Some("server is not accepting connections".to_owned());
        let notifier = Arc::new(RecordingNotifier::default());

        let report = engine(backend.clone(), notifier.clone())
            .run(&config(Mode::Backup))
            .await;

        assert_eq!(report.status, OperationStatus::Failed);
        assert!(report.detail.unwrap().contains("precondition failed"));
        assert_eq!(backend.mutating_calls(), 0);
        assert_eq!(notifier.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_swallow_notification_failures() {
        let backend = Arc::new(FakeBackend::default());
        let notifier = Arc::new(BrokenNotifier::default());
        let engine =
            OrchestrationEngine::new(notifier.clone()).with_backend(backend);

        let report = engine.run(&config(Mode::Backup)).await;

        assert_eq!(report.status, OperationStatus::Completed);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(notifier.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_sweep_retention_after_successful_backup() {
        let now = OffsetDateTime::now_utc();
        let backend = Arc::new(FakeBackend::default());
        let store = Arc::new(MemoryStore::with_objects(vec![
            artifact("db/myapp/ancient.dump", now - time::Duration::days(90)),
            artifact("db/myapp/recent.dump", now - time::Duration::days(1)),
        ]));
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = engine(backend, notifier)
            .with_retention(RetentionPolicy::new(
                store.clone(),
                Duration::from_secs(30 * 24 * 3600),
            ));

        let report = engine.run(&config(Mode::Backup)).await;

        assert_eq!(report.status, OperationStatus::Completed);
        assert_eq!(
            *store.deleted.lock().unwrap(),
            vec!["db/myapp/ancient.dump".to_owned()]
        );
        assert!(report.detail.unwrap().contains("retention: 1 deleted"));
    }

    #[tokio::test]
    async fn should_not_sweep_retention_after_failed_backup() {
        let now = OffsetDateTime::now_utc();
        let backend = Arc::new(FakeBackend::default());
        *backend.backup_outcome.lock().unwrap() =
            Some(StartOutcome::Finished(Finished::failed("pg_dump exploded")));
        let store = Arc::new(MemoryStore::with_objects(vec![artifact(
            "db/myapp/ancient.dump",
            now - time::Duration::days(90),
        )]));
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = engine(backend, notifier).with_retention(RetentionPolicy::new(
            store.clone(),
            Duration::from_secs(30 * 24 * 3600),
        ));

        let report = engine.run(&config(Mode::Backup)).await;

        assert_eq!(report.status, OperationStatus::Failed);
        assert!(store.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn should_run_probes_in_test_mode_and_fail_the_run_on_probe_failure() {
        let notifier = Arc::new(RecordingNotifier::default());
        let broken_store = Arc::new(MemoryStore::default());
        broken_store.fail_list.store(true, Ordering::SeqCst);
        let engine = OrchestrationEngine::new(notifier.clone()).with_probes(ProbeSuite::new(
            vec![Probe::storage_reachable(broken_store, "myapp")],
        ));
        let mut config = config(Mode::Test);
        config.target = Target::Environment("staging".to_owned());

        let report = engine.run(&config).await;

        assert_eq!(report.status, OperationStatus::Completed);
        assert_eq!(report.probes.len(), 1);
        assert_eq!(report.probes[0].outcome, ProbeOutcome::Fail);
        assert_eq!(report.exit_code(), 1);
        assert!(!notifier.last.lock().unwrap().as_ref().unwrap().0);
    }

    #[tokio::test]
    async fn should_not_run_probes_when_validation_fails() {
        let notifier = Arc::new(RecordingNotifier::default());
        let store = Arc::new(MemoryStore::default());
        let engine = OrchestrationEngine::new(notifier.clone())
            .with_probes(ProbeSuite::new(vec![Probe::storage_reachable(
                store, "myapp",
            )]));
        let mut config = config(Mode::Test);
        // an empty environment target fails validation
        config.target = Target::Environment(String::new());

        let report = engine.run(&config).await;

        assert_eq!(report.status, OperationStatus::Failed);
        assert!(report.probes.is_empty());
        assert_eq!(notifier.sends.load(Ordering::SeqCst), 1);
        assert!(!notifier.last.lock().unwrap().as_ref().unwrap().0);
    }
}
