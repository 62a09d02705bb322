//! Storage and command-execution contract shared by every backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// One entry returned by [`Backend::list`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    /// Absolute virtual path. Directories end with `/`.
    pub path: String,
    pub is_dir: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl FileEntry {
    pub fn file(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            is_dir: false,
            size: Some(size),
        }
    }

    pub fn dir(path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.ends_with('/') {
            path.push('/');
        }
        Self {
            path,
            is_dir: true,
            size: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecuteResponse {
    pub output: String,
    pub exit_code: Option<i32>,
    pub truncated: bool,
}

impl ExecuteResponse {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Uniform storage abstraction for local disks, remote sandboxes, and
/// in-memory state.
///
/// Implementations must serialize conflicting writes to the same path and
/// let reads proceed concurrently.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short identifier used in logs and prompts.
    fn id(&self) -> &str;

    async fn read(&self, path: &str) -> Result<Vec<u8>, BackendError>;

    /// Create or overwrite `path`.
    async fn write(&self, path: &str, content: &[u8]) -> Result<(), BackendError>;

    /// Create `path` only if nothing exists there, failing with
    /// [`BackendError::AlreadyExists`] otherwise. The check and the write are
    /// one step with respect to other writers of the path.
    async fn create(&self, path: &str, content: &[u8]) -> Result<(), BackendError>;

    /// Immediate children of `path`, sorted by path. A missing directory
    /// lists as empty.
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>, BackendError>;

    async fn execute(&self, command: &str) -> Result<ExecuteResponse, BackendError> {
        let _ = command;
        Err(BackendError::Unsupported("command execution"))
    }

    fn supports_execution(&self) -> bool {
        false
    }

    /// Replace `old` with `new` inside `path`, returning the number of
    /// replacements. Implementations hold the path's write lock across the
    /// read-modify-write.
    async fn edit(
        &self,
        path: &str,
        old: &str,
        new: &str,
        replace_all: bool,
    ) -> Result<usize, BackendError>;

    async fn read_to_string(&self, path: &str) -> Result<String, BackendError> {
        let bytes = self.read(path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn exists(&self, path: &str) -> Result<bool, BackendError> {
        match self.read(path).await {
            Ok(_) => Ok(true),
            Err(BackendError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// Apply a string replacement with the uniqueness rule shared by all
/// backends.
pub fn apply_edit(
    path: &str,
    content: &str,
    old: &str,
    new: &str,
    replace_all: bool,
) -> Result<(String, usize), BackendError> {
    if old.is_empty() {
        return Err(BackendError::Edit(format!(
            "Error: old_string must not be empty when editing '{path}'"
        )));
    }
    let occurrences = content.matches(old).count();
    if occurrences == 0 {
        return Err(BackendError::Edit(format!(
            "Error: String not found in file: '{old}'"
        )));
    }
    if occurrences > 1 && !replace_all {
        return Err(BackendError::Edit(format!(
            "Error: String '{old}' appears {occurrences} times in file. Use replace_all=true to replace all instances, or provide a more specific string with surrounding context."
        )));
    }
    let updated = if replace_all {
        content.replace(old, new)
    } else {
        content.replacen(old, new, 1)
    };
    Ok((updated, if replace_all { occurrences } else { 1 }))
}
