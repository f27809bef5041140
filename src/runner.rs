use async_trait::async_trait;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tempfile::NamedTempFile;
use tokio::process::Command as TokioCommand;
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ExecError;
use crate::model::CommandOutput;
use crate::sections;

/// Single permitted executable. The first token of a command must name it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList {
    executable: String,
}

impl AllowList {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    pub fn check(&self, command: &str) -> Result<(), ExecError> {
        match command.split_whitespace().next() {
            Some(program) if program == self.executable => Ok(()),
            _ => Err(ExecError::Validation {
                executable: self.executable.clone(),
            }),
        }
    }
}

#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn run(&self, command: &str, cancel: CancellationToken)
    -> Result<CommandOutput, ExecError>;
}

/// Runs one command through `sh -c` with a wall-clock timeout.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    allow_list: AllowList,
    timeout: Duration,
    scratch_dir: Option<PathBuf>,
}

impl ProcessRunner {
    pub fn new(allow_list: AllowList, timeout: Duration) -> Self {
        Self {
            allow_list,
            timeout,
            scratch_dir: None,
        }
    }

    pub fn with_scratch_dir(mut self, scratch_dir: Option<PathBuf>) -> Self {
        self.scratch_dir = scratch_dir;
        self
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    pub async fn run(&self, command: &str) -> Result<CommandOutput, ExecError> {
        self.run_cancellable(command, CancellationToken::new()).await
    }

    pub async fn run_cancellable(
        &self,
        command: &str,
        cancel: CancellationToken,
    ) -> Result<CommandOutput, ExecError> {
        self.allow_list.check(command)?;

        let capture = CaptureFiles::create(self.scratch_dir.as_deref())?;
        let mut child = TokioCommand::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(capture.stdout_handle()?)
            .stderr(capture.stderr_handle()?)
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| ExecError::transport(format!("failed to spawn `{command}`: {error}")))?;
        info!(command, "executing");

        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(command, "cancel requested, killing child");
                if let Err(error) = child.start_kill() {
                    warn!(command, "failed to kill cancelled child: {error}");
                }
                let _ = child.wait().await;
                return Err(ExecError::Cancelled);
            }
            waited = timeout(self.timeout, child.wait()) => waited,
        };

        match waited {
            Ok(Ok(status)) => {
                let (stdout, stderr) = capture.read()?;
                Ok(completed_output(command, status, stdout, stderr))
            }
            Ok(Err(error)) => Err(ExecError::transport(format!(
                "failed waiting for `{command}`: {error}"
            ))),
            Err(_) => {
                warn!(command, timeout_ms = self.timeout_ms(), "command timed out");
                if let Err(error) = child.start_kill() {
                    warn!(command, "failed to kill timed out child: {error}");
                }
                let _ = child.wait().await;
                let (stdout, stderr) = capture.read().unwrap_or_default();
                Ok(timed_out_output(self.timeout_ms(), stdout, stderr))
            }
        }
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

#[async_trait]
impl CommandTransport for ProcessRunner {
    async fn run(
        &self,
        command: &str,
        cancel: CancellationToken,
    ) -> Result<CommandOutput, ExecError> {
        self.run_cancellable(command, cancel).await
    }
}

fn completed_output(
    command: &str,
    status: ExitStatus,
    stdout: String,
    stderr: String,
) -> CommandOutput {
    if !status.success() {
        return CommandOutput {
            success: false,
            error: Some(format!("Command failed: {command}\n{stderr}")),
            exit_code: status.code(),
            stdout,
            stderr,
            ..CommandOutput::default()
        };
    }

    let mut output = CommandOutput {
        success: true,
        exit_code: status.code(),
        stdout,
        stderr,
        ..CommandOutput::default()
    };
    if sections::is_multi_resource_listing(command) {
        output.sections = sections::split_sections(&output.stdout);
        if !output.sections.is_empty() {
            output.stdout = sections::render_sections(&output.sections);
        }
    }
    output
}

fn timed_out_output(timeout_ms: u64, stdout: String, stderr: String) -> CommandOutput {
    let partial = format!("{stdout}{stderr}").trim().to_string();
    let error = if partial.is_empty() {
        ExecError::Timeout { timeout_ms }.to_string()
    } else {
        partial
    };
    CommandOutput {
        success: false,
        stdout,
        stderr,
        error: Some(error),
        timed_out: true,
        ..CommandOutput::default()
    }
}

struct CaptureFiles {
    stdout: NamedTempFile,
    stderr: NamedTempFile,
}

impl CaptureFiles {
    fn create(scratch_dir: Option<&Path>) -> Result<Self, ExecError> {
        Ok(Self {
            stdout: capture_file(scratch_dir, ".out")?,
            stderr: capture_file(scratch_dir, ".err")?,
        })
    }

    fn stdout_handle(&self) -> Result<Stdio, ExecError> {
        reopen(&self.stdout)
    }

    fn stderr_handle(&self) -> Result<Stdio, ExecError> {
        reopen(&self.stderr)
    }

    fn read(&self) -> Result<(String, String), ExecError> {
        Ok((read_lossy(self.stdout.path())?, read_lossy(self.stderr.path())?))
    }
}

fn capture_file(scratch_dir: Option<&Path>, suffix: &str) -> Result<NamedTempFile, ExecError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("kubecmds-").suffix(suffix);
    match scratch_dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    }
    .map_err(|error| ExecError::transport(format!("failed to create capture file: {error}")))
}

fn reopen(file: &NamedTempFile) -> Result<Stdio, ExecError> {
    let handle: File = file
        .reopen()
        .map_err(|error| ExecError::transport(format!("failed to open capture file: {error}")))?;
    Ok(Stdio::from(handle))
}

fn read_lossy(path: &Path) -> Result<String, ExecError> {
    let bytes = std::fs::read(path)
        .map_err(|error| ExecError::transport(format!("failed to read capture file: {error}")))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
