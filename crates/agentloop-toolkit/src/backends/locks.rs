use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

const PRUNE_THRESHOLD: usize = 1024;

/// One reader/writer lock per path: reads share, writes are exclusive.
#[derive(Debug, Default)]
pub struct PathLocks {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, path: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.len() >= PRUNE_THRESHOLD {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    pub async fn read(&self, path: &str) -> OwnedRwLockReadGuard<()> {
        self.lock_for(path).read_owned().await
    }

    pub async fn write(&self, path: &str) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(path).write_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn readers_share_and_writers_exclude() {
        let locks = Arc::new(PathLocks::new());
        let r1 = locks.read("/a").await;
        let r2 = locks.read("/a").await;

        let pending = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _w = locks.write("/a").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        let _other = locks.write("/b").await;
        drop((r1, r2));
        tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
    }
}
