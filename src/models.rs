//! Core data models shared by the update pipeline and the question-answering path.
//!
//! These types describe what a scan finds on disk, what the loaders produce,
//! what ends up in the vector index, and what an update cycle reports back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// A supported file found under the knowledge-base root during a scan.
#[derive(Debug, Clone)]
pub struct FileRecord {
    /// Path relative to the knowledge-base root, always `/`-separated.
    pub relative_path: String,
    pub full_path: PathBuf,
    /// Lowercased extension without the leading dot.
    pub extension: String,
    /// Lowercase hex SHA-256 of the file's bytes.
    pub content_hash: String,
    pub size: u64,
    pub modified_time: DateTime<Utc>,
}

/// Provenance attached to every document and chunk derived from a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// Relative path of the originating file; the index's deletion key.
    pub file_path: String,
    pub file_hash: String,
    pub file_size: u64,
    pub last_modified: DateTime<Utc>,
    pub content_type: String,
}

impl SourceMetadata {
    pub fn from_record(record: &FileRecord, content_type: &str) -> Self {
        Self {
            file_path: record.relative_path.clone(),
            file_hash: record.content_hash.clone(),
            file_size: record.size,
            last_modified: record.modified_time,
            content_type: content_type.to_string(),
        }
    }
}

/// Text extracted from one file (or one segment of it) by a loader.
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub text: String,
    pub metadata: SourceMetadata,
}

/// Metadata stored alongside each chunk in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(flatten)]
    pub source: SourceMetadata,
    /// Character offset of the chunk within its document text.
    pub start_index: usize,
    pub chunk_index: usize,
}

/// A window of document text ready to be embedded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

/// Relative paths partitioned by how they changed since the last cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub added: BTreeSet<String>,
    pub modified: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn counts(&self) -> ChangeCounts {
        ChangeCounts {
            added: self.added.len(),
            modified: self.modified.len(),
            deleted: self.deleted.len(),
        }
    }

    /// Paths whose existing index entries must go before new chunks are merged.
    pub fn stale_paths(&self) -> BTreeSet<String> {
        self.modified.union(&self.deleted).cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
}

/// Outcome of one update cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Success,
    NoChanges,
    Error,
}

impl UpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStatus::Success => "success",
            UpdateStatus::NoChanges => "no_changes",
            UpdateStatus::Error => "error",
        }
    }
}

/// Result record returned by every call to the updater. Never an `Err`:
/// failures are reported through `status` and `error`.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateResult {
    pub status: UpdateStatus,
    /// Wall-clock duration of the cycle in seconds.
    pub duration: f64,
    pub changes: ChangeCounts,
    #[serde(skip_serializing_if = "ChangeSet::is_empty")]
    pub files: ChangeSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_documents: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UpdateResult {
    pub fn no_changes(duration: f64) -> Self {
        Self {
            status: UpdateStatus::NoChanges,
            duration,
            changes: ChangeCounts::default(),
            files: ChangeSet::default(),
            total_documents: None,
            total_chunks: None,
            error: None,
        }
    }

    pub fn success(
        duration: f64,
        files: ChangeSet,
        total_documents: usize,
        total_chunks: usize,
    ) -> Self {
        Self {
            status: UpdateStatus::Success,
            duration,
            changes: files.counts(),
            files,
            total_documents: Some(total_documents),
            total_chunks: Some(total_chunks),
            error: None,
        }
    }

    pub fn failed(duration: f64, error: &anyhow::Error) -> Self {
        Self {
            status: UpdateStatus::Error,
            duration,
            changes: ChangeCounts::default(),
            files: ChangeSet::default(),
            total_documents: None,
            total_chunks: None,
            error: Some(format!("{:#}", error)),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == UpdateStatus::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_paths_excludes_added() {
        let mut set = ChangeSet::default();
        set.added.insert("new.md".into());
        set.modified.insert("edited.md".into());
        set.deleted.insert("gone.md".into());

        let stale: Vec<_> = set.stale_paths().into_iter().collect();
        assert_eq!(stale, vec!["edited.md".to_string(), "gone.md".to_string()]);
    }

    #[test]
    fn result_json_shape() {
        let result = UpdateResult::no_changes(0.25);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "no_changes");
        assert_eq!(json["changes"]["added"], 0);
        assert!(json.get("error").is_none());
        assert!(json.get("files").is_none());

        let err = UpdateResult::failed(1.0, &anyhow::anyhow!("embedding backend down"));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"], "embedding backend down");
    }
}
