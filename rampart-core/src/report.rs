//! Per-run reporting: the aggregate run report and the append-only report
//! file written alongside each run.

use crate::{
    operation::{Artifact, Mode, OperationStatus},
    probes::{ProbeOutcome, ProbeResult},
};
use std::{
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};
use time::OffsetDateTime;

/// Aggregate of one engine run. Built incrementally, emitted once at the end
/// of the run to the report file and the notifier.
#[derive(Debug)]
pub struct RunReport {
    pub environment: String,
    pub mode: Mode,
    pub target: String,
    pub started: OffsetDateTime,
    pub finished: OffsetDateTime,
    pub status: OperationStatus,
    pub detail: Option<String>,
    pub artifacts: Vec<Artifact>,
    pub probes: Vec<ProbeResult>,
}

impl RunReport {
    pub fn duration(&self) -> Duration {
        (self.finished - self.started).try_into().unwrap_or_default()
    }

    pub fn failed_probes(&self) -> usize {
        self.probes
            .iter()
            .filter(|probe| probe.outcome == ProbeOutcome::Fail)
            .count()
    }

    /// The run counts as successful only if the operation ended well and no
    /// probe failed; the process exit code follows this.
    pub fn success(&self) -> bool {
        self.status.is_success() && self.failed_probes() == 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() {
            0
        } else {
            1
        }
    }

    /// Single-line summary used for the notification message.
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "[{}] {} {}: {} after {}",
            self.environment,
            self.mode,
            self.target,
            self.status,
            humantime::format_duration(Duration::from_secs(self.duration().as_secs())),
        );
        if !self.artifacts.is_empty() {
            summary.push_str(&format!(", {} artifact(s)", self.artifacts.len()));
        }
        if !self.probes.is_empty() {
            summary.push_str(&format!(
                ", {}/{} probes failed",
                self.failed_probes(),
                self.probes.len()
            ));
        }
        if let Some(detail) = &self.detail {
            if let Some(first_line) = detail.lines().find(|line| !line.trim().is_empty()) {
                summary.push_str(": ");
                summary.push_str(first_line.trim());
            }
        }
        summary
    }
}

/// Append-only, human-readable report file for one run, named by environment
/// and timestamp. Writing is best-effort; a full disk must not fail a backup.
#[derive(Debug)]
pub struct ReportFile {
    path: Option<PathBuf>,
    file: Option<std::fs::File>,
}

pub fn report_file_name(environment: &str, started: OffsetDateTime) -> String {
    format!(
        "{}-{}.log",
        environment,
        crate::operation::timestamp_token(started)
    )
}

impl ReportFile {
    pub fn create(
        dir: &Path,
        environment: &str,
        started: OffsetDateTime,
    ) -> std::io::Result<ReportFile> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(report_file_name(environment, started));
        let file = std::fs::File::options()
            .append(true)
            .create(true)
            .open(&path)?;
        Ok(ReportFile {
            path: Some(path),
            file: Some(file),
        })
    }

    /// A sink that discards everything, for runs without a report directory.
    pub fn null() -> ReportFile {
        ReportFile {
            path: None,
            file: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn append(&mut self, line: &str) {
        if let Some(file) = &mut self.file {
            let stamp = OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_default();
            if let Err(error) = writeln!(file, "{} {}", stamp, line) {
                tracing::warn!(%error, "failed to append to report file");
            }
        }
    }

    /// Writes the final report section and closes the file.
    pub fn finalize(mut self, report: &RunReport) {
        self.append("---");
        for probe in &report.probes {
            self.append(&format!("probe {}: {} ({})", probe.name, probe.outcome, probe.detail));
        }
        for artifact in &report.artifacts {
            self.append(&format!("artifact {} at {}", artifact.id, artifact.location));
        }
        if let Some(detail) = &report.detail {
            for line in detail.lines() {
                self.append(&format!("detail: {}", line));
            }
        }
        self.append(&report.summary());
    }
}
