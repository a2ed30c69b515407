//! Cross-process exclusive lock around update cycles.
//!
//! The in-process mutex in the updater serializes triggers inside one
//! process; this file lock keeps a second process (say, `kbsync update` run
//! by hand while `kbsync schedule` is live) from interleaving with it.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Held for the duration of one update cycle; unlocks on drop.
pub struct UpdateLock {
    file: File,
    path: PathBuf,
}

impl UpdateLock {
    /// Block (off the async runtime) until the lock at `path` is ours.
    pub async fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create lock directory {}", parent.display()))?;
        }

        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<Self> {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .with_context(|| format!("open update lock {}", path.display()))?;

            let start = Instant::now();
            file.lock_exclusive()
                .with_context(|| format!("acquire update lock {}", path.display()))?;
            let waited = start.elapsed();
            if waited > Duration::from_millis(50) {
                info!(waited_ms = waited.as_millis() as u64, "waited for another update to finish");
            } else {
                debug!(path = %path.display(), "update lock acquired");
            }

            Ok(Self { file, path })
        })
        .await
        .context("join update lock task")?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UpdateLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn lock_is_exclusive_until_dropped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/store.lock");

        let held = UpdateLock::acquire(&path).await.unwrap();
        assert!(held.path().exists());

        let other = File::open(&path).unwrap();
        assert!(other.try_lock_exclusive().is_err());

        drop(held);
        assert!(other.try_lock_exclusive().is_ok());
        FileExt::unlock(&other).unwrap();
    }
}
