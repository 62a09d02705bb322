use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use agentloop_core::backend::{apply_edit, Backend, FileEntry};
use agentloop_core::error::BackendError;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::normalize_path;

/// Files kept in process memory, keyed by absolute virtual path.
///
/// Writes take the map's write lock, so conflicting writes are serialized
/// and reads run concurrently.
#[derive(Debug, Default)]
pub struct StateBackend {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl StateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a backend from `(path, content)` pairs.
    pub fn with_files<I, P, C>(files: I) -> Result<Self, BackendError>
    where
        I: IntoIterator<Item = (P, C)>,
        P: AsRef<str>,
        C: Into<Vec<u8>>,
    {
        let mut map = BTreeMap::new();
        for (path, content) in files {
            map.insert(normalize_path(path.as_ref())?, content.into());
        }
        Ok(Self {
            files: RwLock::new(map),
        })
    }

    pub async fn paths(&self) -> Vec<String> {
        self.files.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl Backend for StateBackend {
    fn id(&self) -> &str {
        "state"
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, BackendError> {
        let path = normalize_path(path)?;
        self.files
            .read()
            .await
            .get(&path)
            .cloned()
            .ok_or(BackendError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<(), BackendError> {
        let path = normalize_path(path)?;
        if path == "/" {
            return Err(BackendError::invalid_path(path, "cannot write to the root"));
        }
        self.files.write().await.insert(path, content.to_vec());
        Ok(())
    }

    async fn create(&self, path: &str, content: &[u8]) -> Result<(), BackendError> {
        let path = normalize_path(path)?;
        if path == "/" {
            return Err(BackendError::invalid_path(path, "cannot write to the root"));
        }
        match self.files.write().await.entry(path) {
            Entry::Occupied(entry) => Err(BackendError::AlreadyExists(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(content.to_vec());
                Ok(())
            }
        }
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>, BackendError> {
        let dir = normalize_path(path)?;
        let prefix = if dir == "/" { dir } else { format!("{dir}/") };

        let files = self.files.read().await;
        let mut entries = Vec::new();
        let mut subdirs = BTreeSet::new();
        for (key, content) in files.range(prefix.clone()..) {
            let Some(rest) = key.strip_prefix(&prefix) else {
                break;
            };
            match rest.split_once('/') {
                Some((child, _)) => {
                    subdirs.insert(format!("{prefix}{child}/"));
                }
                None => entries.push(FileEntry::file(key.clone(), content.len() as u64)),
            }
        }
        entries.extend(subdirs.into_iter().map(FileEntry::dir));
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn edit(
        &self,
        path: &str,
        old: &str,
        new: &str,
        replace_all: bool,
    ) -> Result<usize, BackendError> {
        let path = normalize_path(path)?;
        let mut files = self.files.write().await;
        let content = files
            .get(&path)
            .ok_or_else(|| BackendError::NotFound(path.clone()))?;
        let (updated, count) =
            apply_edit(&path, &String::from_utf8_lossy(content), old, new, replace_all)?;
        files.insert(path, updated.into_bytes());
        Ok(count)
    }
}
