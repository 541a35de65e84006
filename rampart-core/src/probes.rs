//! Disaster-recovery smoke checks.
//!
//! Each probe is side-effect-free and independent of its siblings; a probe
//! can observe a broken dependency but never abort the suite.

use crate::{
    backend::BackendError,
    operation::{Artifact, OperationStatus},
    store::ObjectStore,
};
use std::{sync::Arc, time::Duration};
use time::OffsetDateTime;
use tokio::net::TcpStream;

#[derive(Debug, PartialEq, Eq, Hash, Copy, Clone)]
pub enum ProbeOutcome {
    Pass,
    Fail,
    Warn,
    Skip,
}

impl std::fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProbeOutcome::Pass => "pass",
            ProbeOutcome::Fail => "FAIL",
            ProbeOutcome::Warn => "warn",
            ProbeOutcome::Skip => "skip",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ProbeResult {
    pub name: String,
    pub outcome: ProbeOutcome,
    pub detail: String,
}

/// Source of the newest labeled snapshot, implemented by the cluster backend.
#[async_trait::async_trait]
pub trait SnapshotStatusSource: Send + Sync {
    async fn latest_snapshot(
        &self,
        owner: &str,
    ) -> Result<Option<(String, OperationStatus)>, BackendError>;
}

enum ProbeKind {
    StorageReachable {
        store: Arc<dyn ObjectStore>,
        scope: String,
    },
    BackupFreshness {
        store: Arc<dyn ObjectStore>,
        scope: String,
        max_age: Duration,
    },
    Connectivity {
        host: String,
        port: u16,
    },
    SnapshotStatus {
        source: Arc<dyn SnapshotStatusSource>,
        owner: String,
    },
    Redundancy {
        name: String,
    },
}

pub struct Probe {
    name: String,
    kind: ProbeKind,
}

impl Probe {
    pub fn storage_reachable(store: Arc<dyn ObjectStore>, scope: impl Into<String>) -> Self {
        Probe {
            name: "storage".to_owned(),
            kind: ProbeKind::StorageReachable {
                store,
                scope: scope.into(),
            },
        }
    }

    pub fn backup_freshness(
        store: Arc<dyn ObjectStore>,
        scope: impl Into<String>,
        max_age: Duration,
    ) -> Self {
        Probe {
            name: "freshness".to_owned(),
            kind: ProbeKind::BackupFreshness {
                store,
                scope: scope.into(),
                max_age,
            },
        }
    }

    pub fn connectivity(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Probe {
            name: format!("connect:{}:{}", host, port),
            kind: ProbeKind::Connectivity { host, port },
        }
    }

    pub fn snapshot_status(
        source: Arc<dyn SnapshotStatusSource>,
        owner: impl Into<String>,
    ) -> Self {
        let owner = owner.into();
        Probe {
            name: format!("snapshots:{}", owner),
            kind: ProbeKind::SnapshotStatus { source, owner },
        }
    }

    pub fn redundancy(name: impl Into<String>) -> Self {
        let name = name.into();
        Probe {
            name: format!("redundancy:{}", name),
            kind: ProbeKind::Redundancy { name },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> (ProbeOutcome, String) {
        match &self.kind {
            ProbeKind::StorageReachable { store, scope } => match store.list(scope).await {
                Ok(artifacts) => (
                    ProbeOutcome::Pass,
                    format!("storage reachable, {} objects listed", artifacts.len()),
                ),
                Err(error) => (ProbeOutcome::Fail, format!("list failed: {}", error)),
            },
            ProbeKind::BackupFreshness {
                store,
                scope,
                max_age,
            } => match store.list(scope).await {
                Ok(artifacts) => {
                    freshness_outcome(&artifacts, *max_age, OffsetDateTime::now_utc())
                }
                Err(error) => (ProbeOutcome::Fail, format!("list failed: {}", error)),
            },
            ProbeKind::Connectivity { host, port } => {
                let connect = TcpStream::connect((host.as_str(), *port));
                match tokio::time::timeout(Duration::from_secs(5), connect).await {
                    Ok(Ok(_)) => (ProbeOutcome::Pass, format!("{}:{} reachable", host, port)),
                    Ok(Err(error)) => (
                        ProbeOutcome::Fail,
                        format!("{}:{} unreachable: {}", host, port, error),
                    ),
                    Err(_) => (
                        ProbeOutcome::Fail,
                        format!("{}:{} unreachable: connect timed out", host, port),
                    ),
                }
            }
            ProbeKind::SnapshotStatus { source, owner } => {
                match source.latest_snapshot(owner).await {
                    Ok(latest) => snapshot_outcome(latest.as_ref()),
                    Err(error) => (
                        ProbeOutcome::Fail,
                        format!("snapshot lookup failed: {}", error),
                    ),
                }
            }
            ProbeKind::Redundancy { name } => {
                match tokio::net::lookup_host((name.as_str(), 0u16)).await {
                    Ok(addrs) => {
                        let mut ips = addrs.map(|a| a.ip()).collect::<Vec<_>>();
                        ips.sort();
                        ips.dedup();
                        redundancy_outcome(name, ips.len())
                    }
                    Err(error) => (
                        ProbeOutcome::Fail,
                        format!("'{}' did not resolve: {}", name, error),
                    ),
                }
            }
        }
    }
}

fn freshness_outcome(
    artifacts: &[Artifact],
    max_age: Duration,
    now: OffsetDateTime,
) -> (ProbeOutcome, String) {
    let latest = artifacts
        .iter()
        .max_by_key(|artifact| artifact.created.unwrap_or(OffsetDateTime::UNIX_EPOCH));
    let latest = match latest {
        Some(latest) => latest,
        None => return (ProbeOutcome::Fail, "no backup artifacts found".to_owned()),
    };
    match latest.age(now) {
        Some(age) if age <= max_age => (
            ProbeOutcome::Pass,
            format!(
                "latest backup '{}' is {} old",
                latest.id,
                humantime::format_duration(round_to_minutes(age))
            ),
        ),
        Some(age) => (
            ProbeOutcome::Fail,
            format!(
                "latest backup '{}' is {} old, allowed {}",
                latest.id,
                humantime::format_duration(round_to_minutes(age)),
                humantime::format_duration(max_age)
            ),
        ),
        None => (
            ProbeOutcome::Warn,
            format!("latest backup '{}' has no parsable timestamp", latest.id),
        ),
    }
}

fn round_to_minutes(age: Duration) -> Duration {
    Duration::from_secs(age.as_secs() / 60 * 60)
}

fn snapshot_outcome(latest: Option<&(String, OperationStatus)>) -> (ProbeOutcome, String) {
    match latest {
        None => (ProbeOutcome::Warn, "no snapshots found".to_owned()),
        Some((name, OperationStatus::Completed)) => {
            (ProbeOutcome::Pass, format!("latest snapshot '{}' completed", name))
        }
        Some((name, status)) => (
            ProbeOutcome::Fail,
            format!("latest snapshot '{}' is {}", name, status),
        ),
    }
}

fn redundancy_outcome(name: &str, addresses: usize) -> (ProbeOutcome, String) {
    match addresses {
        0 => (
            ProbeOutcome::Fail,
            format!("'{}' resolved to no addresses", name),
        ),
        1 => (
            ProbeOutcome::Warn,
            format!("'{}' resolved to a single address", name),
        ),
        n => (
            ProbeOutcome::Pass,
            format!("'{}' resolved to {} addresses", name, n),
        ),
    }
}

/// An ordered set of probes. `run` yields one result per requested probe, in
/// declaration order, and never errors.
pub struct ProbeSuite {
    probes: Vec<Probe>,
}

impl ProbeSuite {
    pub fn new(probes: Vec<Probe>) -> Self {
        ProbeSuite { probes }
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Runs the requested probes; an empty request means all of them.
    /// Requested names that match nothing produce a `Fail` result so a typo
    /// in a check list cannot silently pass.
    pub async fn run(&self, requested: &[String]) -> Vec<ProbeResult> {
        let mut results = Vec::new();
        for probe in &self.probes {
            if !requested.is_empty() && !requested.iter().any(|name| name == probe.name()) {
                continue;
            }
            let (outcome, detail) = probe.check().await;
            tracing::info!(probe = probe.name(), %outcome, detail = %detail, "probe finished");
            results.push(ProbeResult {
                name: probe.name().to_owned(),
                outcome,
                detail,
            });
        }
        for name in requested {
            if !self.probes.iter().any(|probe| probe.name() == name) {
                results.push(ProbeResult {
                    name: name.clone(),
                    outcome: ProbeOutcome::Fail,
                    detail: "unknown probe".to_owned(),
                });
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        operation::Location,
        store::testing::MemoryStore,
    };
    use time::macros::datetime;

    fn artifact(id: &str, created: Option<OffsetDateTime>) -> Artifact {
        Artifact {
            id: id.to_owned(),
            created,
            size: 1,
            owner: "myapp".to_owned(),
            location: Location::Remote(format!("mem://{}", id)),
        }
    }

    mod redundancy {
        use super::*;

        #[test]
        fn should_pass_with_two_addresses() {
            assert_eq!(redundancy_outcome("db", 2).0, ProbeOutcome::Pass);
        }

        #[test]
        fn should_warn_with_single_address() {
            assert_eq!(redundancy_outcome("db", 1).0, ProbeOutcome::Warn);
        }

        #[test]
        fn should_fail_with_no_addresses() {
            assert_eq!(redundancy_outcome("db", 0).0, ProbeOutcome::Fail);
        }
    }

    mod freshness {
        use super::*;

        #[test]
        fn should_pass_for_recent_backup() {
            let now = datetime!(2026-08-29 12:00:00 UTC);
            let artifacts = vec![
                artifact("old", Some(now - time::Duration::days(3))),
                artifact("new", Some(now - time::Duration::hours(2))),
            ];
            let (outcome, detail) =
                freshness_outcome(&artifacts, Duration::from_secs(24 * 3600), now);
            assert_eq!(outcome, ProbeOutcome::Pass);
            assert!(detail.contains("new"), "{}", detail);
        }

        #[test]
        fn should_fail_for_stale_backup() {
            let now = datetime!(2026-08-29 12:00:00 UTC);
            let artifacts = vec![artifact("old", Some(now - time::Duration::days(3)))];
            let (outcome, _) = freshness_outcome(&artifacts, Duration::from_secs(24 * 3600), now);
            assert_eq!(outcome, ProbeOutcome::Fail);
        }

        #[test]
        fn should_warn_for_unparsable_timestamp() {
            let now = datetime!(2026-08-29 12:00:00 UTC);
            let artifacts = vec![artifact("garbled", None)];
            let (outcome, _) = freshness_outcome(&artifacts, Duration::from_secs(24 * 3600), now);
            assert_eq!(outcome, ProbeOutcome::Warn);
        }

        #[test]
        fn should_fail_with_no_artifacts() {
            let now = datetime!(2026-08-29 12:00:00 UTC);
            let (outcome, _) = freshness_outcome(&[], Duration::from_secs(24 * 3600), now);
            assert_eq!(outcome, ProbeOutcome::Fail);
        }
    }

    mod snapshots {
        use super::*;

        #[test]
        fn should_warn_with_no_snapshots() {
            assert_eq!(snapshot_outcome(None).0, ProbeOutcome::Warn);
        }

        #[test]
        fn should_pass_for_completed_snapshot() {
            let latest = ("prod-1".to_owned(), OperationStatus::Completed);
            assert_eq!(snapshot_outcome(Some(&latest)).0, ProbeOutcome::Pass);
        }

        #[test]
        fn should_fail_for_partially_failed_snapshot() {
            let latest = ("prod-1".to_owned(), OperationStatus::PartiallyFailed);
            assert_eq!(snapshot_outcome(Some(&latest)).0, ProbeOutcome::Fail);
        }
    }

    #[tokio::test]
    async fn should_keep_declaration_order_and_probe_independence() {
        let now = OffsetDateTime::now_utc();
        let store = Arc::new(MemoryStore::with_objects(vec![artifact(
            "myapp/fresh",
            Some(now - time::Duration::hours(1)),
        )]));
        let broken_store = Arc::new(MemoryStore::default());
        broken_store
            .fail_list
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let suite = ProbeSuite::new(vec![
            Probe::storage_reachable(broken_store, "myapp"),
            Probe::backup_freshness(store, "myapp", Duration::from_secs(24 * 3600)),
        ]);

        let results = suite.run(&[]).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "storage");
        assert_eq!(results[0].outcome, ProbeOutcome::Fail);
        // the sibling failure does not affect this probe
        assert_eq!(results[1].name, "freshness");
        assert_eq!(results[1].outcome, ProbeOutcome::Pass);
    }

    #[tokio::test]
    async fn should_fail_unknown_requested_probes() {
        let store = Arc::new(MemoryStore::default());
        let suite = ProbeSuite::new(vec![Probe::storage_reachable(store, "myapp")]);

        let results = suite.run(&["storage".to_owned(), "nope".to_owned()]).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "storage");
        assert_eq!(results[1].name, "nope");
        assert_eq!(results[1].outcome, ProbeOutcome::Fail);
        assert_eq!(results[1].detail, "unknown probe");
    }

    #[tokio::test]
    async fn should_check_tcp_connectivity_against_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = Probe::connectivity("127.0.0.1", port);
        let (outcome, _) = probe.check().await;

        assert_eq!(outcome, ProbeOutcome::Pass);
    }
}
