//! Backend implementations: an in-memory store and a rooted local directory.

mod filesystem;
mod locks;
mod state;

pub use filesystem::{FilesystemBackend, DEFAULT_EXECUTE_TIMEOUT, DEFAULT_MAX_OUTPUT_BYTES};
pub use locks::PathLocks;
pub use state::StateBackend;

use agentloop_core::error::BackendError;

/// Canonical form of a virtual path: absolute, no `.`/`..` segments, no
/// repeated or trailing slashes (except the root itself).
pub fn normalize_path(path: &str) -> Result<String, BackendError> {
    let trimmed = path.trim();
    if !trimmed.starts_with('/') {
        return Err(BackendError::invalid_path(path, "path must be absolute"));
    }
    let mut segments = Vec::new();
    for segment in trimmed.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(BackendError::invalid_path(
                    path,
                    "parent directory references are not allowed",
                ))
            }
            s if s.contains('\0') => {
                return Err(BackendError::invalid_path(path, "path contains a NUL byte"))
            }
            s => segments.push(s),
        }
    }
    Ok(format!("/{}", segments.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_virtual_paths() {
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert_eq!(normalize_path("//src/./lib.rs").unwrap(), "/src/lib.rs");
        assert_eq!(normalize_path("/docs/").unwrap(), "/docs");
    }

    #[test]
    fn rejects_relative_and_escaping_paths() {
        assert!(normalize_path("notes.md").is_err());
        assert!(normalize_path("/a/../../etc/passwd").is_err());
    }
}
