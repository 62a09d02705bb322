use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use agentloop_core::backend::{apply_edit, Backend, ExecuteResponse, FileEntry};
use agentloop_core::error::BackendError;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{normalize_path, PathLocks};

pub const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 100_000;

/// A local directory exposed through virtual absolute paths.
///
/// `/` maps to `root`; paths cannot climb out of it. Commands run with
/// `sh -c` inside `root`.
#[derive(Debug)]
pub struct FilesystemBackend {
    root: PathBuf,
    locks: PathLocks,
    execute_timeout: Duration,
    max_output_bytes: usize,
    allow_execute: bool,
}

impl FilesystemBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: PathLocks::new(),
            execute_timeout: DEFAULT_EXECUTE_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            allow_execute: true,
        }
    }

    pub fn with_execute_timeout(mut self, timeout: Duration) -> Self {
        self.execute_timeout = timeout;
        self
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    /// Disable the `execute` primitive, e.g. for read/write-only agents.
    pub fn without_execute(mut self) -> Self {
        self.allow_execute = false;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<(String, PathBuf), BackendError> {
        let virtual_path = normalize_path(path)?;
        let real = self.root.join(virtual_path.trim_start_matches('/'));
        Ok((virtual_path, real))
    }

    fn map_io(virtual_path: &str, real: &Path, err: std::io::Error) -> BackendError {
        match err.kind() {
            ErrorKind::NotFound => BackendError::NotFound(virtual_path.to_string()),
            _ => BackendError::io(real, err),
        }
    }

    fn truncate_output(&self, mut output: String) -> (String, bool) {
        if output.len() <= self.max_output_bytes {
            return (output, false);
        }
        let mut cut = self.max_output_bytes;
        while !output.is_char_boundary(cut) {
            cut -= 1;
        }
        output.truncate(cut);
        (output, true)
    }
}

#[async_trait]
impl Backend for FilesystemBackend {
    fn id(&self) -> &str {
        "filesystem"
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, BackendError> {
        let (virtual_path, real) = self.resolve(path)?;
        let _guard = self.locks.read(&virtual_path).await;
        if tokio::fs::metadata(&real)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(BackendError::invalid_path(virtual_path, "is a directory"));
        }
        tokio::fs::read(&real)
            .await
            .map_err(|e| Self::map_io(&virtual_path, &real, e))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<(), BackendError> {
        let (virtual_path, real) = self.resolve(path)?;
        if virtual_path == "/" {
            return Err(BackendError::invalid_path(virtual_path, "cannot write to the root"));
        }
        let _guard = self.locks.write(&virtual_path).await;
        if let Some(parent) = real.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BackendError::io(parent, e))?;
        }
        tokio::fs::write(&real, content)
            .await
            .map_err(|e| BackendError::io(&real, e))?;
        tracing::debug!(path = %virtual_path, bytes = content.len(), "wrote file");
        Ok(())
    }

    async fn create(&self, path: &str, content: &[u8]) -> Result<(), BackendError> {
        let (virtual_path, real) = self.resolve(path)?;
        if virtual_path == "/" {
            return Err(BackendError::invalid_path(virtual_path, "cannot write to the root"));
        }
        let _guard = self.locks.write(&virtual_path).await;
        if let Some(parent) = real.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BackendError::io(parent, e))?;
        }
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&real)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(BackendError::AlreadyExists(virtual_path))
            }
            Err(e) => return Err(BackendError::io(&real, e)),
        };
        file.write_all(content)
            .await
            .map_err(|e| BackendError::io(&real, e))?;
        file.flush().await.map_err(|e| BackendError::io(&real, e))?;
        tracing::debug!(path = %virtual_path, bytes = content.len(), "created file");
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>, BackendError> {
        let (virtual_path, real) = self.resolve(path)?;
        let mut dir = match tokio::fs::read_dir(&real).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BackendError::io(&real, e)),
        };

        let base = if virtual_path == "/" {
            String::from("/")
        } else {
            format!("{virtual_path}/")
        };
        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| BackendError::io(&real, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| BackendError::io(entry.path(), e))?;
            if metadata.is_dir() {
                entries.push(FileEntry::dir(format!("{base}{name}")));
            } else {
                entries.push(FileEntry::file(format!("{base}{name}"), metadata.len()));
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn supports_execution(&self) -> bool {
        self.allow_execute
    }

    async fn execute(&self, command: &str) -> Result<ExecuteResponse, BackendError> {
        if !self.allow_execute {
            return Err(BackendError::Unsupported("command execution"));
        }
        tracing::debug!(command = %command, root = %self.root.display(), "executing command");

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::io(&self.root, e))?;

        let output = match tokio::time::timeout(self.execute_timeout, child.wait_with_output()).await
        {
            Ok(result) => result.map_err(|e| BackendError::io(&self.root, e))?,
            Err(_) => {
                tracing::warn!(command = %command, timeout = ?self.execute_timeout, "command timed out");
                return Ok(ExecuteResponse {
                    output: format!(
                        "Error: Command timed out after {} seconds",
                        self.execute_timeout.as_secs()
                    ),
                    exit_code: None,
                    truncated: false,
                });
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str("[stderr] ");
            combined.push_str(line);
        }
        let (output_text, truncated) = self.truncate_output(combined);

        Ok(ExecuteResponse {
            output: output_text,
            exit_code: output.status.code(),
            truncated,
        })
    }

    async fn edit(
        &self,
        path: &str,
        old: &str,
        new: &str,
        replace_all: bool,
    ) -> Result<usize, BackendError> {
        let (virtual_path, real) = self.resolve(path)?;
        let _guard = self.locks.write(&virtual_path).await;
        let content = tokio::fs::read_to_string(&real)
            .await
            .map_err(|e| Self::map_io(&virtual_path, &real, e))?;
        let (updated, count) = apply_edit(&virtual_path, &content, old, new, replace_all)?;
        tokio::fs::write(&real, updated)
            .await
            .map_err(|e| BackendError::io(&real, e))?;
        Ok(count)
    }
}
