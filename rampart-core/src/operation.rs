//! Core data model for a single engine run.

use crate::config::{cluster, database};
use std::{path::PathBuf, time::Duration};
use time::OffsetDateTime;

#[derive(Debug, PartialEq, Eq, Hash, Copy, Clone)]
pub enum Mode {
    Backup,
    Restore,
    Test,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Mode::Backup => "backup",
            Mode::Restore => "restore",
            Mode::Test => "test",
        };
        write!(f, "{}", s)
    }
}

/// Status of one backend operation. Only the backend (or the polling waiter,
/// for the timeout case) produces these; the engine only reads them.
#[derive(Debug, PartialEq, Eq, Hash, Copy, Clone)]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    PartiallyFailed,
    TimedOut,
    Skipped,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Pending | OperationStatus::Running)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Skipped)
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::PartiallyFailed => "partially failed",
            OperationStatus::TimedOut => "timed out",
            OperationStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// Opaque identifier for a long-running backend operation, e.g. the name of a
/// cluster snapshot. Discarded once a terminal status has been observed.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct OperationHandle(pub String);

impl std::fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub enum Location {
    Local(PathBuf),
    Remote(String),
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Local(path) => write!(f, "{}", path.display()),
            Location::Remote(uri) => write!(f, "{}", uri),
        }
    }
}

/// A produced backup object, as reported by a backend or listed from storage.
///
/// `created` is `None` when the storage listing carried a timestamp we could
/// not parse; retention skips such artifacts and the freshness probe reports
/// a warning for them.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Artifact {
    pub id: String,
    pub created: Option<OffsetDateTime>,
    pub size: u64,
    pub owner: String,
    pub location: Location,
}

impl Artifact {
    pub fn age(&self, now: OffsetDateTime) -> Option<Duration> {
        let created = self.created?;
        let age = now - created;
        age.try_into().ok()
    }
}

/// The logical target of a run.
#[derive(Debug, Clone)]
pub enum Target {
    Database(database::Name, database::Definition),
    Cluster(cluster::Name, cluster::Definition),
    /// Used by the DR-test flow, which checks an environment rather than a
    /// single database or cluster.
    Environment(String),
}

impl Target {
    pub fn name(&self) -> &str {
        match self {
            Target::Database(name, _) => &name.0,
            Target::Cluster(name, _) => &name.0,
            Target::Environment(name) => name,
        }
    }
}

/// Immutable input to one engine run, assembled from configuration and CLI
/// flags. Never mutated after construction.
#[derive(Debug, Clone)]
pub struct OperationConfig {
    pub environment: String,
    pub mode: Mode,
    pub target: Target,
    pub include_namespaces: Vec<String>,
    pub exclude_namespaces: Vec<String>,
    pub retention: Duration,
    pub encrypt: bool,
    pub include_volumes: bool,
    pub source_artifact: Option<String>,
    pub restore_namespace: Option<String>,
    pub dry_run: bool,
    /// Probe names requested for test mode; empty means all configured probes.
    pub probes: Vec<String>,
}

impl OperationConfig {
    pub fn owner(&self) -> &str {
        self.target.name()
    }

    /// Checks required and mode-specific fields. A validation failure is the
    /// only way a run ends without ever touching the backend.
    pub fn validate(&self) -> Result<(), String> {
        if self.owner().is_empty() {
            return Err("target name must not be empty".to_owned());
        }
        if self
            .include_namespaces
            .iter()
            .chain(self.exclude_namespaces.iter())
            .any(|ns| ns.trim().is_empty())
        {
            return Err("namespace filters must not contain empty entries".to_owned());
        }
        if self.mode == Mode::Restore {
            match &self.source_artifact {
                Some(id) if !id.trim().is_empty() => {}
                _ => return Err("restore requires a source artifact identifier".to_owned()),
            }
            if let Target::Cluster(..) = self.target {
                match &self.restore_namespace {
                    Some(ns) if !ns.trim().is_empty() => {}
                    _ => {
                        return Err(
                            "cluster restore requires a distinct restore namespace".to_owned()
                        )
                    }
                }
                if self.include_namespaces.is_empty() {
                    return Err(
                        "cluster restore requires at least one namespace to map".to_owned()
                    );
                }
            }
        }
        Ok(())
    }
}

/// Formats a timestamp as a compact token for artifact and snapshot names,
/// e.g. `20260829-101500`.
pub fn timestamp_token(t: OffsetDateTime) -> String {
    let format = time::macros::format_description!("[year][month][day]-[hour][minute][second]");
    t.format(&format)
        .unwrap_or_else(|_| t.unix_timestamp().to_string())
}
