//! Plumbing for the external command-line tools that rampart wraps.
//!
//! Every vendor tool (pg_dump, velero, the storage CLI, ...) is treated as a
//! black box: we build an argument list, run the process, and look at its exit
//! status and captured output. Nothing in here knows what the tools do.

use std::{ffi::OsStr, path::PathBuf, process::Stdio};
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to start {tool} process")]
    FailedToStart {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("error getting {tool} process status")]
    Status {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{}", failure_message(.tool, .status, .stderr))]
    Failed {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },
}

fn failure_message(tool: &str, status: &ExitStatus, stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("{} {}", tool, status.message())
    } else {
        format!("{} {}: {}", tool, status.message(), stderr)
    }
}

#[derive(Debug, PartialEq, Eq, Hash, Copy, Clone)]
pub enum ExitStatus {
    Successful,
    Failed(Option<i32>),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self == &ExitStatus::Successful
    }

    pub fn message(&self) -> String {
        match self {
            ExitStatus::Successful => "exited successfully".to_owned(),
            ExitStatus::Failed(Some(code)) => format!("exited with error status {}", code),
            ExitStatus::Failed(None) => "exited with unknown error status".to_owned(),
        }
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        if status.success() {
            ExitStatus::Successful
        } else {
            ExitStatus::Failed(status.code())
        }
    }
}

/// One external command-line tool with a resolved binary path.
#[derive(Debug, Clone)]
pub struct Tool {
    name: String,
    path: PathBuf,
}

/// Captured output of a finished tool invocation.
#[derive(Debug)]
pub struct Captured {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl Tool {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Tool {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Runs the tool to completion with both output streams captured.
    pub async fn output(
        &self,
        args: &[impl AsRef<OsStr>],
        envs: &[(&str, &str)],
    ) -> Result<Captured, Error> {
        let mut cmd = Command::new(&self.path);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // final fallback if the engine is dropped mid-run
            .kill_on_drop(true);
        for (name, value) in envs {
            cmd.env(name, value);
        }
        for arg in args {
            cmd.arg(arg.as_ref());
        }
        let child = cmd.spawn().map_err(|source| Error::FailedToStart {
            tool: self.name.clone(),
            source,
        })?;
        let output = child
            .wait_with_output()
            .await
            .map_err(|source| Error::Status {
                tool: self.name.clone(),
                source,
            })?;
        Ok(Captured {
            status: output.status.into(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Like [`Tool::output`] but turns a non-zero exit status into an error
    /// carrying the captured stderr text.
    pub async fn check_output(
        &self,
        args: &[impl AsRef<OsStr>],
        envs: &[(&str, &str)],
    ) -> Result<Captured, Error> {
        let captured = self.output(args, envs).await?;
        if captured.status.success() {
            Ok(captured)
        } else {
            Err(Error::Failed {
                tool: self.name.clone(),
                status: captured.status,
                stderr: captured.stderr,
            })
        }
    }

    pub async fn version_string(&self, args: &[&str]) -> Result<String, Error> {
        let captured = self.check_output(args, &[]).await?;
        captured
            .stdout
            .lines()
            .find_map(version_line)
            .map(str::to_owned)
            .ok_or(Error::Failed {
                tool: self.name.clone(),
                status: ExitStatus::Failed(None),
                stderr: "no version output".to_owned(),
            })
    }
}

fn version_line(line: &str) -> Option<&str> {
    Some(line.trim()).filter(|s| !s.is_empty())
}
