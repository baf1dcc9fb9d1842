//! Execution of radio tool command lines.

use async_trait::async_trait;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Ways a radio command can fail.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The shell could not be started.
    #[error("failed to spawn command: {0}")]
    Spawn(#[from] io::Error),

    /// The command exceeded its time budget and was killed with SIGKILL.
    #[error("command was killed")]
    Killed,

    /// The command ran and exited unsuccessfully.
    #[error("command exited with code {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
}

/// Runs a shell command line and returns its stdout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command_line: &str, timeout: Duration) -> Result<String, CommandError>;
}

/// [`CommandRunner`] backed by `sh -c`.
///
/// Each command runs in its own process group so that a timeout kills the
/// whole pipeline, not only the shell.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command_line: &str, timeout: Duration) -> Result<String, CommandError> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command_line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id();

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                if let Some(pid) = pid {
                    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
                }
                return Err(CommandError::Killed);
            }
        };

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        if killed_by_sigkill(&output.status) {
            return Err(CommandError::Killed);
        }
        Err(CommandError::Failed {
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

fn killed_by_sigkill(status: &ExitStatus) -> bool {
    status
        .signal()
        .and_then(|signal| Signal::try_from(signal).ok())
        == Some(Signal::SIGKILL)
}
