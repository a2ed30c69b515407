//! Persisted record of what the last successful update indexed.
//!
//! Stored as pretty-printed JSON. `file_hashes` is an ordered map, so two
//! saves of the same state produce byte-identical files.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateManifest {
    /// Completion time of the last successful cycle; `None` before the first.
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    /// Relative path → content hash of every file indexed by that cycle.
    #[serde(default)]
    pub file_hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub total_documents: usize,
    #[serde(default)]
    pub total_chunks: usize,
}

impl UpdateManifest {
    /// Read the manifest at `path`. A missing file is the empty manifest; a
    /// present but unparseable one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse manifest: {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read manifest: {}", path.display())),
        }
    }

    /// Atomically replace the manifest at `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut json = serde_json::to_vec_pretty(self)?;
        json.push(b'\n');
        write_atomic(path, &json)
    }
}

/// Write `bytes` to a sibling temp file, then rename it over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace manifest: {}", path.display()))?;
    Ok(())
}
