//! Error taxonomy for the runtime.
//!
//! Failures local to one tool call or one subagent are turned into failed
//! [`ToolResult`](crate::messaging::ToolResult)s by the execution loop. Only
//! model-call and session-store failures end a turn with an [`AgentError`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Storage and command execution failures raised by a
/// [`Backend`](crate::backend::Backend).
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Error: File '{0}' not found")]
    NotFound(String),

    #[error("Cannot write to {0} because it already exists. Read and then make an edit, or write to a new path.")]
    AlreadyExists(String),

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Backend does not support {0}")]
    Unsupported(&'static str),

    #[error("{0}")]
    Edit(String),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BackendError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Errors surfaced by the execution loop and its collaborators.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Approval for tool call '{tool_call_id}' timed out after {timeout:?}")]
    ApprovalTimeout {
        tool_call_id: String,
        timeout: Duration,
    },

    #[error("Model call failed after {attempts} attempt(s): {source:#}")]
    ModelCall {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Subagent '{name}' failed: {message}")]
    SubagentFailure { name: String, message: String },

    #[error("Session store failure for thread '{thread_id}': {source:#}")]
    Session {
        thread_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Middleware '{stage}' failed: {source:#}")]
    Middleware {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Turn for thread '{0}' was cancelled")]
    Cancelled(String),
}

/// Errors returned by the approval gate's resolve/request entry points.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("No pending approval request with id '{0}'")]
    UnknownRequest(String),

    #[error("Tool call '{0}' already has a pending approval request")]
    AlreadyPending(String),

    #[error("Decision '{decision}' is not allowed for request '{request_id}'")]
    DecisionNotAllowed { request_id: String, decision: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_render_for_the_model() {
        assert_eq!(
            BackendError::NotFound("/notes.md".into()).to_string(),
            "Error: File '/notes.md' not found"
        );
        let io = BackendError::io(
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(io.to_string(), "I/O error on /tmp/x: denied");
    }

    #[test]
    fn model_call_error_keeps_cause_chain() {
        let err = AgentError::ModelCall {
            attempts: 4,
            source: anyhow::anyhow!("connection reset").context("provider request"),
        };
        assert_eq!(
            err.to_string(),
            "Model call failed after 4 attempt(s): provider request: connection reset"
        );
    }
}
