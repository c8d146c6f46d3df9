// agent/src/error.rs

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Outcome of a compensating action attempted after a later step failed.
/// Carried inside `AgentError::Persistence` so the caller can tell an
/// orphaned resource from a cleanly unwound one.
#[derive(Debug, Clone)]
pub struct Compensation {
    /// What the compensating action tried to undo (e.g. "userdel -r alice")
    pub attempted: String,
    pub succeeded: bool,
    /// Captured output or error text from the compensating command
    pub detail: String,
}

/// Errors that can occur while provisioning host resources.
///
/// Validation and conflict errors are rejected before any side effect;
/// everything else is surfaced only after the partially-applied steps
/// have been unwound (or, for `Persistence`, compensated).
#[derive(Debug, Error)]
pub enum AgentError {
    /// Malformed or duplicate input, rejected before any OS action
    #[error("validation failed: {0}")]
    Validation(String),

    /// Lookup by id or unique key found nothing
    #[error("not found: {0}")]
    NotFound(String),

    /// Concurrent claim on the same identifier; exactly one request wins
    #[error("resource conflict: {kind} '{identifier}' is being provisioned by another request")]
    Conflict { kind: &'static str, identifier: String },

    /// A privileged external tool exited non-zero
    #[error("'{program}' exited with status {exit_code}")]
    ExternalCommand {
        program: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// The web server rejected the rendered configuration during its dry run
    #[error("web server configuration self-test failed")]
    ConfigTest { output: String },

    /// A privileged command exceeded its deadline; the process was terminated
    #[error("'{program}' timed out after {timeout_secs}s")]
    Timeout { program: String, timeout_secs: u64 },

    /// Registry write failed after OS-level success. `compensation` records
    /// whether the already-applied OS step could be undone.
    #[error("registry write failed: {message}")]
    Persistence {
        message: String,
        compensation: Option<Compensation>,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Stable wire identifier for the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Validation(_) => "validation",
            AgentError::NotFound(_) => "not_found",
            AgentError::Conflict { .. } => "conflict",
            AgentError::ExternalCommand { .. } => "external_command",
            AgentError::ConfigTest { .. } => "config_test",
            AgentError::Timeout { .. } => "timeout",
            AgentError::Persistence { .. } => "persistence",
            AgentError::Io(_) => "io",
        }
    }

    /// Captured external-tool output, if this failure carries any.
    /// Returned to the caller verbatim so diagnostics can be rendered.
    pub fn captured_output(&self) -> Option<String> {
        match self {
            AgentError::ExternalCommand { stdout, stderr, .. } => {
                let mut out = String::new();
                if !stdout.is_empty() {
                    out.push_str(stdout);
                }
                if !stderr.is_empty() {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(stderr);
                }
                Some(out)
            }
            AgentError::ConfigTest { output } => Some(output.clone()),
            _ => None,
        }
    }
}
