//! Cluster snapshots via the velero CLI.
//!
//! Snapshots run asynchronously inside the cluster; starting one yields a
//! handle that the engine polls until velero reports a terminal phase.
//! Artifacts are velero backup objects, found again later through an owner
//! label.

use crate::{
    backend::{Backend, BackendError, Finished, StartOutcome},
    config::cluster,
    exec::Tool,
    operation::{
        timestamp_token, Artifact, Location, OperationConfig, OperationHandle, OperationStatus,
    },
    probes::SnapshotStatusSource,
};
use serde::Deserialize;
use std::time::Duration;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

const OWNER_LABEL: &str = "rampart.io/owner";

/// Maps a velero phase string to an operation status. Unknown phases are
/// treated as still running so a newer velero cannot break the wait loop.
fn phase_to_status(phase: &str) -> OperationStatus {
    match phase {
        "" | "New" => OperationStatus::Pending,
        "InProgress" => OperationStatus::Running,
        "Completed" => OperationStatus::Completed,
        "PartiallyFailed" => OperationStatus::PartiallyFailed,
        "Failed" | "FailedValidation" => OperationStatus::Failed,
        other => {
            tracing::debug!(phase = other, "unknown velero phase, treating as running");
            OperationStatus::Running
        }
    }
}

/// Formats a duration the way velero's `--ttl` flag expects, e.g. `720h0m0s`.
fn go_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Lowercases and squashes everything that is not DNS-label-safe, since the
/// result becomes a Kubernetes object name.
fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_owned()
}

#[derive(Debug, PartialEq, Eq)]
enum HandleKind {
    Backup,
    Restore,
}

fn parse_handle(handle: &OperationHandle) -> Result<(HandleKind, &str), BackendError> {
    match handle.0.split_once(':') {
        Some(("backup", name)) if !name.is_empty() => Ok((HandleKind::Backup, name)),
        Some(("restore", name)) if !name.is_empty() => Ok((HandleKind::Restore, name)),
        _ => Err(BackendError::UnknownHandle(handle.0.clone())),
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotDocument {
    metadata: SnapshotMetadata,
    #[serde(default)]
    status: SnapshotStatus,
}

#[derive(Debug, Deserialize)]
struct SnapshotMetadata {
    name: String,
    #[serde(default, rename = "creationTimestamp")]
    creation_timestamp: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SnapshotStatus {
    #[serde(default)]
    phase: Option<String>,
}

impl SnapshotDocument {
    fn created(&self) -> Option<OffsetDateTime> {
        let raw = self.metadata.creation_timestamp.as_deref()?;
        match OffsetDateTime::parse(raw, &Rfc3339) {
            Ok(created) => Some(created),
            Err(error) => {
                tracing::warn!(
                    name = %self.metadata.name,
                    timestamp = raw,
                    %error,
                    "unparsable snapshot timestamp"
                );
                None
            }
        }
    }

    fn status(&self) -> OperationStatus {
        phase_to_status(self.status.phase.as_deref().unwrap_or(""))
    }
}

/// Velero prints a bare object for a single `get NAME` and a `kind: List`
/// document for label queries; accept both.
fn parse_documents(stdout: &str) -> Result<Vec<SnapshotDocument>, serde_json::Error> {
    #[derive(Deserialize)]
    struct List {
        items: Vec<SnapshotDocument>,
    }
    if stdout.trim().is_empty() {
        return Ok(vec![]);
    }
    if let Ok(list) = serde_json::from_str::<List>(stdout) {
        return Ok(list.items);
    }
    serde_json::from_str::<SnapshotDocument>(stdout).map(|doc| vec![doc])
}

/// Builds the namespace filter flags for a snapshot. A non-empty include list
/// wins and disables exclusion; otherwise the cluster's system namespaces plus
/// any requested exclusions are filtered out.
fn namespace_filters(def: &cluster::Definition, config: &OperationConfig) -> Vec<String> {
    if !config.include_namespaces.is_empty() {
        return vec![
            "--include-namespaces".to_owned(),
            config.include_namespaces.join(","),
        ];
    }
    let mut excluded = def.system_namespaces.clone();
    for ns in &config.exclude_namespaces {
        if !excluded.contains(ns) {
            excluded.push(ns.clone());
        }
    }
    if excluded.is_empty() {
        return vec![];
    }
    vec!["--exclude-namespaces".to_owned(), excluded.join(",")]
}

pub struct ClusterSnapshotBackend {
    name: cluster::Name,
    def: cluster::Definition,
    velero: Tool,
    kubectl: Tool,
}

impl ClusterSnapshotBackend {
    pub fn new(
        name: cluster::Name,
        def: cluster::Definition,
        velero: Tool,
        kubectl: Tool,
    ) -> Self {
        ClusterSnapshotBackend {
            name,
            def,
            velero,
            kubectl,
        }
    }

    fn base_args(&self) -> Vec<String> {
        match &self.def.kubecontext {
            Some(context) => vec!["--kubecontext".to_owned(), context.clone()],
            None => vec![],
        }
    }

    async fn namespace_exists(&self, namespace: &str) -> Result<bool, BackendError> {
        let mut args = match &self.def.kubecontext {
            Some(context) => vec!["--context".to_owned(), context.clone()],
            None => vec![],
        };
        args.extend([
            "get".to_owned(),
            "namespace".to_owned(),
            namespace.to_owned(),
            "--ignore-not-found".to_owned(),
            "-o".to_owned(),
            "name".to_owned(),
        ]);
        let captured = self.kubectl.check_output(&args, &[]).await?;
        Ok(!captured.stdout.trim().is_empty())
    }

    async fn get_documents(&self, args: &[String]) -> Result<Vec<SnapshotDocument>, BackendError> {
        let mut full = self.base_args();
        full.extend_from_slice(args);
        let captured = self.velero.check_output(&full, &[]).await?;
        parse_documents(&captured.stdout).map_err(|error| BackendError::UnexpectedOutput {
            tool: "velero".to_owned(),
            detail: format!("bad json listing: {}", error),
        })
    }

    fn document_to_artifact(&self, doc: &SnapshotDocument) -> Artifact {
        Artifact {
            id: doc.metadata.name.clone(),
            created: doc.created(),
            size: 0,
            owner: self.name.0.clone(),
            location: Location::Remote(format!("velero://{}", doc.metadata.name)),
        }
    }
}

#[async_trait::async_trait]
impl Backend for ClusterSnapshotBackend {
    fn label(&self) -> &'static str {
        "cluster-snapshot"
    }

    async fn preflight(&self) -> Result<(), BackendError> {
        let mut args = self.base_args();
        args.extend(["version".to_owned(), "--client-only".to_owned()]);
        self.velero.check_output(&args, &[]).await?;
        Ok(())
    }

    async fn start_backup(&self, config: &OperationConfig) -> Result<StartOutcome, BackendError> {
        let snapshot = format!(
            "{}-{}",
            sanitize_name(&self.name.0),
            timestamp_token(OffsetDateTime::now_utc())
        );
        let ttl = self.def.ttl.unwrap_or(config.retention);
        let mut args = self.base_args();
        args.extend([
            "backup".to_owned(),
            "create".to_owned(),
            snapshot.clone(),
            "--ttl".to_owned(),
            go_duration(ttl),
            "--labels".to_owned(),
            format!("{}={}", OWNER_LABEL, sanitize_name(&self.name.0)),
        ]);
        args.extend(namespace_filters(&self.def, config));
        // velero snapshots volumes unless told otherwise; always say which
        args.push(if config.include_volumes {
            "--snapshot-volumes=true".to_owned()
        } else {
            "--snapshot-volumes=false".to_owned()
        });

        if config.dry_run {
            return Ok(StartOutcome::Finished(Finished::skipped(format!(
                "would run: velero {}",
                args.join(" ")
            ))));
        }

        tracing::info!(snapshot = %snapshot, cluster = %self.name.0, "creating cluster snapshot");
        self.velero.check_output(&args, &[]).await?;
        Ok(StartOutcome::Started(OperationHandle(format!(
            "backup:{}",
            snapshot
        ))))
    }

    async fn start_restore(
        &self,
        config: &OperationConfig,
        source: &Artifact,
    ) -> Result<StartOutcome, BackendError> {
        let restore_namespace = config.restore_namespace.as_deref().ok_or_else(|| {
            BackendError::InvalidRequest("cluster restore requires a restore namespace".to_owned())
        })?;
        let restore = format!(
            "{}-restore-{}",
            sanitize_name(&self.name.0),
            timestamp_token(OffsetDateTime::now_utc())
        );
        let mappings = config
            .include_namespaces
            .iter()
            .map(|ns| format!("{}:{}", ns, restore_namespace))
            .collect::<Vec<_>>()
            .join(",");
        let mut args = self.base_args();
        args.extend([
            "restore".to_owned(),
            "create".to_owned(),
            restore.clone(),
            "--from-backup".to_owned(),
            source.id.clone(),
            "--namespace-mappings".to_owned(),
            mappings,
        ]);

        if config.dry_run {
            return Ok(StartOutcome::Finished(Finished::skipped(format!(
                "would run: velero {}",
                args.join(" ")
            ))));
        }

        // restores must land in a namespace of their own, never a live one
        if self.namespace_exists(restore_namespace).await? {
            return Err(BackendError::InvalidRequest(format!(
                "restore namespace '{}' already exists",
                restore_namespace
            )));
        }

        tracing::info!(restore = %restore, snapshot = %source.id, "creating cluster restore");
        self.velero.check_output(&args, &[]).await?;
        Ok(StartOutcome::Started(OperationHandle(format!(
            "restore:{}",
            restore
        ))))
    }

    async fn query_status(
        &self,
        handle: &OperationHandle,
    ) -> Result<OperationStatus, BackendError> {
        let (kind, name) = parse_handle(handle)?;
        let subcommand = match kind {
            HandleKind::Backup => "backup",
            HandleKind::Restore => "restore",
        };
        let documents = self
            .get_documents(&[
                subcommand.to_owned(),
                "get".to_owned(),
                name.to_owned(),
                "-o".to_owned(),
                "json".to_owned(),
            ])
            .await?;
        match documents.first() {
            Some(doc) => Ok(doc.status()),
            None => Err(BackendError::UnexpectedOutput {
                tool: "velero".to_owned(),
                detail: format!("no object returned for '{}'", name),
            }),
        }
    }

    async fn describe(&self, handle: &OperationHandle) -> String {
        let (kind, name) = match parse_handle(handle) {
            Ok(parsed) => parsed,
            Err(error) => return error.to_string(),
        };
        let subcommand = match kind {
            HandleKind::Backup => "backup",
            HandleKind::Restore => "restore",
        };
        let mut args = self.base_args();
        args.extend([
            subcommand.to_owned(),
            "describe".to_owned(),
            name.to_owned(),
            "--details".to_owned(),
        ]);
        match self.velero.output(&args, &[]).await {
            Ok(captured) if captured.status.success() => captured.stdout,
            Ok(captured) => format!("{}\n{}", captured.stdout, captured.stderr),
            Err(error) => format!("failed to describe '{}': {}", name, error),
        }
    }

    async fn list_artifacts(&self, owner: &str) -> Result<Vec<Artifact>, BackendError> {
        let documents = self
            .get_documents(&[
                "backup".to_owned(),
                "get".to_owned(),
                "-l".to_owned(),
                format!("{}={}", OWNER_LABEL, sanitize_name(owner)),
                "-o".to_owned(),
                "json".to_owned(),
            ])
            .await?;
        Ok(documents
            .iter()
            .map(|doc| self.document_to_artifact(doc))
            .collect())
    }

    async fn resolve_artifact(
        &self,
        handle: &OperationHandle,
    ) -> Result<Option<Artifact>, BackendError> {
        let (kind, name) = parse_handle(handle)?;
        if kind != HandleKind::Backup {
            // a restore produces no artifact of its own
            return Ok(None);
        }
        let documents = self
            .get_documents(&[
                "backup".to_owned(),
                "get".to_owned(),
                name.to_owned(),
                "-o".to_owned(),
                "json".to_owned(),
            ])
            .await?;
        Ok(documents.first().map(|doc| self.document_to_artifact(doc)))
    }
}

#[async_trait::async_trait]
impl SnapshotStatusSource for ClusterSnapshotBackend {
    async fn latest_snapshot(
        &self,
        owner: &str,
    ) -> Result<Option<(String, OperationStatus)>, BackendError> {
        let documents = self
            .get_documents(&[
                "backup".to_owned(),
                "get".to_owned(),
                "-l".to_owned(),
                format!("{}={}", OWNER_LABEL, sanitize_name(owner)),
                "-o".to_owned(),
                "json".to_owned(),
            ])
            .await?;
        Ok(documents
            .into_iter()
            .max_by_key(|doc| doc.created().unwrap_or(OffsetDateTime::UNIX_EPOCH))
            .map(|doc| (doc.metadata.name.clone(), doc.status())))
    }
}
