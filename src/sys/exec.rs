// agent/src/sys/exec.rs
//
// 🛡️ SOLID: Single-Responsibility: privileged command execution only.
// Every OS/web-server/CA mutation in this agent goes through this seam;
// no other module builds command invocations, and nothing here retries.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{AgentError, Result};

/// Captured result of a completed external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stdout and stderr joined for caller-facing diagnostics
    pub fn combined(&self) -> String {
        let mut out = self.stdout.trim_end().to_string();
        let err = self.stderr.trim_end();
        if !err.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(err);
        }
        out
    }
}

/// Executes privileged external tools with an explicit argument vector.
///
/// Contract: argv execution only (never a concatenated shell string), captured
/// stdout/stderr, non-zero exit mapped to `ExternalCommandError`, deadline
/// overrun mapped to `TimeoutError` with the child terminated. This is a dumb
/// executor: pre/post verification belongs to the caller.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, program: &str, args: &[&str], deadline: Duration) -> Result<CommandOutput>;
}

pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, program: &str, args: &[&str], deadline: Duration) -> Result<CommandOutput> {
        // 🛡️ Zero-Trust Guard: argv-only execution still rejects an empty
        // program name before touching the OS.
        if program.is_empty() {
            return Err(AgentError::Validation("command name cannot be empty".into()));
        }

        debug!(program = %program, args = ?args, "executing privileged command");

        let mut cmd = Command::new(program);
        cmd.args(args)
            // 🛡️ Invariant: a timed-out child must not keep running. Dropping
            // the in-flight future below drops the child handle, and
            // kill_on_drop guarantees the kernel reaps the process.
            .kill_on_drop(true);

        let result = timeout(deadline, cmd.output()).await;

        let output = match result {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                return Err(AgentError::ExternalCommand {
                    program: program.to_string(),
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: format!("failed to spawn process: {}", e),
                });
            }
            Err(_) => {
                return Err(AgentError::Timeout {
                    program: program.to_string(),
                    timeout_secs: deadline.as_secs(),
                });
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let captured = CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };

        if !output.status.success() {
            return Err(AgentError::ExternalCommand {
                program: program.to_string(),
                exit_code,
                stdout: captured.stdout,
                stderr: captured.stderr,
            });
        }

        Ok(captured)
    }
}
