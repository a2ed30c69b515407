//! Knowledge-base sync status.
//!
//! Summarizes the manifest and the persisted index: when the last cycle
//! committed, how many files and chunks are tracked, and what the index costs
//! on disk. Used by `kbsync status` to confirm that scheduled updates are
//! actually landing.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::Config;
use crate::index::IndexStore;
use crate::manifest::UpdateManifest;
use crate::progress::format_number;

/// Per-extension breakdown of tracked files and indexed chunks.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TypeStats {
    pub files: usize,
    pub chunks: usize,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub last_update: Option<DateTime<Utc>>,
    pub total_documents: usize,
    pub total_chunks: usize,
    pub index_entries: Option<usize>,
    pub index_model: Option<String>,
    pub index_bytes: u64,
    pub by_type: BTreeMap<String, TypeStats>,
}

pub async fn collect_status(manifest_path: &Path, index_dir: &Path) -> Result<StatusReport> {
    let manifest = UpdateManifest::load(manifest_path)?;

    let mut by_type: BTreeMap<String, TypeStats> = BTreeMap::new();
    for path in manifest.file_hashes.keys() {
        by_type.entry(extension_of(path)).or_default().files += 1;
    }

    let mut index_entries = None;
    let mut index_model = None;
    if let Some(store) = IndexStore::open(index_dir)
        .await
        .with_context(|| format!("open index in {}", index_dir.display()))?
    {
        let info = store.info().await?;
        for (path, chunks) in store.chunk_counts().await? {
            by_type.entry(extension_of(&path)).or_default().chunks += chunks;
        }
        store.close().await;
        index_entries = Some(info.entries);
        index_model = Some(info.model.unwrap_or_else(|| "-".to_string()));
    }

    Ok(StatusReport {
        last_update: manifest.last_update,
        total_documents: manifest.total_documents,
        total_chunks: manifest.total_chunks,
        index_entries,
        index_model,
        index_bytes: IndexStore::size_on_disk(index_dir),
        by_type,
    })
}

fn extension_of(path: &str) -> String {
    Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| "-".to_string())
}

/// Run the status command: read the manifest and index and print a summary.
pub async fn run_status(config: &Config) -> Result<()> {
    let report = collect_status(&config.paths.manifest, &config.paths.vector_store).await?;

    println!("kbsync status");
    println!("=============");
    println!();
    println!("  Knowledge base: {}", config.paths.knowledge_base.display());
    println!("  Vector store:   {}", config.paths.vector_store.display());
    println!("  Manifest:       {}", config.paths.manifest.display());
    println!();
    println!(
        "  Last update:    {}",
        report
            .last_update
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );
    println!("  Documents:      {}", format_number(report.total_documents as u64));
    println!("  Chunks:         {}", format_number(report.total_chunks as u64));
    match (&report.index_entries, &report.index_model) {
        (Some(entries), Some(model)) => {
            println!(
                "  Index:          {} entries, {} ({})",
                format_number(*entries as u64),
                format_bytes(report.index_bytes),
                model
            );
            if *entries != report.total_chunks {
                println!("  Warning:        index and manifest chunk counts differ; the next update will reconcile them");
            }
        }
        _ => println!("  Index:          not built"),
    }

    if !report.by_type.is_empty() {
        println!();
        println!("  By type:");
        println!("  {:<8} {:>8} {:>8}", "TYPE", "FILES", "CHUNKS");
        println!("  {}", "-".repeat(26));
        for (ext, stats) in &report.by_type {
            println!("  {:<8} {:>8} {:>8}", ext, stats.files, stats.chunks);
        }
    }
    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a timestamp relative to now (e.g. "3 hours ago").
fn format_ts_relative(ts: DateTime<Utc>) -> String {
    let delta = (Utc::now() - ts).num_seconds();

    if delta < 0 {
        format_ts_iso(ts)
    } else if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::VectorIndex;
    use crate::models::{ChunkMetadata, DocumentChunk, SourceMetadata};
    use chrono::Duration;
    use tempfile::TempDir;

    fn chunk(path: &str, i: usize) -> DocumentChunk {
        DocumentChunk {
            id: format!("{path}#{i}"),
            text: format!("chunk {i}"),
            metadata: ChunkMetadata {
                source: SourceMetadata {
                    file_path: path.to_string(),
                    file_hash: "h".to_string(),
                    file_size: 1,
                    last_modified: Utc::now(),
                    content_type: "text/markdown".to_string(),
                },
                start_index: 0,
                chunk_index: i,
            },
        }
    }

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn timestamps_are_relative() {
        let now = Utc::now();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - Duration::minutes(1)), "1 min ago");
        assert_eq!(format_ts_relative(now - Duration::hours(3)), "3 hours ago");
        assert_eq!(format_ts_relative(now - Duration::days(2)), "2 days ago");
    }

    #[tokio::test]
    async fn status_without_any_update() {
        let tmp = TempDir::new().unwrap();
        let report = collect_status(&tmp.path().join("manifest.json"), &tmp.path().join("store"))
            .await
            .unwrap();
        assert!(report.last_update.is_none());
        assert_eq!(report.total_documents, 0);
        assert!(report.index_entries.is_none());
        assert_eq!(report.index_bytes, 0);
        assert!(report.by_type.is_empty());
    }

    #[tokio::test]
    async fn status_counts_files_by_type() {
        let tmp = TempDir::new().unwrap();
        let manifest = UpdateManifest {
            last_update: Some(Utc::now()),
            file_hashes: [("a.md", "1"), ("docs/b.MD", "2"), ("c.pdf", "3")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            total_documents: 3,
            total_chunks: 0,
        };
        let path = tmp.path().join("manifest.json");
        manifest.save(&path).unwrap();

        let report = collect_status(&path, &tmp.path().join("store")).await.unwrap();
        assert_eq!(report.total_documents, 3);
        assert_eq!(report.by_type["md"], TypeStats { files: 2, chunks: 0 });
        assert_eq!(report.by_type["pdf"].files, 1);
        assert!(report.index_entries.is_none());
    }

    #[tokio::test]
    async fn status_reads_committed_index() {
        let tmp = TempDir::new().unwrap();
        let store_dir = tmp.path().join("store");
        let mut index = VectorIndex::new("model-a", 2);
        for (i, path) in ["a.md", "a.md", "b.pdf"].into_iter().enumerate() {
            index.insert(chunk(path, i), vec![1.0, i as f32]).unwrap();
        }
        let store = IndexStore::create(&store_dir).await.unwrap();
        store.commit(true, &Default::default(), &index).await.unwrap();
        store.close().await;

        let report = collect_status(&tmp.path().join("manifest.json"), &store_dir)
            .await
            .unwrap();
        assert_eq!(report.index_entries, Some(3));
        assert_eq!(report.index_model.as_deref(), Some("model-a"));
        assert_eq!(report.by_type["md"].chunks, 2);
        assert_eq!(report.by_type["pdf"].chunks, 1);
        assert!(report.index_bytes > 0);
    }
}
