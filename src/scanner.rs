//! Knowledge-base directory scanner.
//!
//! Walks the knowledge-base root recursively, keeps files whose extension has
//! a loader, and hashes each one. Per-file problems are logged and skipped;
//! only a missing or unreadable root fails the scan.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::hasher::hash_file;
use crate::loader::supported_extension;
use crate::models::FileRecord;

/// Result of one scan.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Successfully hashed files keyed by relative path.
    pub files: BTreeMap<String, FileRecord>,
    /// Previously tracked files that could not be hashed this time, with the
    /// hash they were last recorded under. They count as unchanged.
    pub unreadable: BTreeMap<String, String>,
}

impl ScanOutcome {
    /// Current content hash for every known path, unreadable ones included.
    pub fn hashes(&self) -> BTreeMap<String, String> {
        let mut hashes: BTreeMap<String, String> = self
            .files
            .iter()
            .map(|(path, record)| (path.clone(), record.content_hash.clone()))
            .collect();
        hashes.extend(self.unreadable.clone());
        hashes
    }

    /// Keep the previously recorded hash of a file that could not be read.
    fn carry_forward(&mut self, relative: String, previous: &BTreeMap<String, String>) {
        if let Some(prior) = previous.get(&relative) {
            debug!(path = %relative, "keeping previous hash");
            self.unreadable.insert(relative, prior.clone());
        }
    }

    /// Hashes of the files that were actually read.
    pub fn readable_hashes(&self) -> BTreeMap<String, String> {
        self.files
            .iter()
            .map(|(path, record)| (path.clone(), record.content_hash.clone()))
            .collect()
    }
}

pub struct KnowledgeBaseScanner {
    root: PathBuf,
    excludes: GlobSet,
    follow_symlinks: bool,
}

impl KnowledgeBaseScanner {
    pub fn new(root: &Path, exclude_globs: &[String], follow_symlinks: bool) -> Result<Self> {
        let mut patterns = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        patterns.extend(exclude_globs.iter().cloned());

        Ok(Self {
            root: root.to_path_buf(),
            excludes: build_globset(&patterns)?,
            follow_symlinks,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative key of `path` if it is a supported, non-excluded file.
    fn tracked_key(&self, path: &Path) -> Option<String> {
        supported_extension(path)?;
        let relative = relative_key(&self.root, path);
        (!self.excludes.is_match(&relative)).then_some(relative)
    }

    /// Walk the root and hash every supported file.
    ///
    /// `previous` is the last manifest's path-to-hash map; it is consulted only
    /// to carry forward files that exist but cannot be read right now.
    pub fn scan(&self, previous: &BTreeMap<String, String>) -> Result<ScanOutcome> {
        if !self.root.is_dir() {
            bail!(
                "knowledge base directory does not exist: {}",
                self.root.display()
            );
        }

        let mut outcome = ScanOutcome::default();
        let walker = WalkDir::new(&self.root).follow_links(self.follow_symlinks);

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    if e.depth() == 0 {
                        bail!("cannot read knowledge base directory: {}", e);
                    }
                    warn!(error = %e, "skipping unreadable entry");
                    // A dangling symlink or a vanished file still has a path.
                    if let Some(relative) = e.path().and_then(|p| self.tracked_key(p)) {
                        outcome.carry_forward(relative, previous);
                    }
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let Some(extension) = supported_extension(path) else {
                continue;
            };
            let relative = relative_key(&self.root, path);
            if self.excludes.is_match(&relative) {
                debug!(path = %relative, "excluded");
                continue;
            }

            let content_hash = match hash_file(path) {
                Ok(hash) => hash,
                Err(e) => {
                    warn!(path = %relative, error = %e, "could not hash file");
                    outcome.carry_forward(relative, previous);
                    continue;
                }
            };

            let metadata = match entry.metadata() {
                Ok(metadata) => Some(metadata),
                Err(e) => {
                    warn!(path = %relative, error = %e, "could not stat file");
                    None
                }
            };
            outcome.files.insert(
                relative.clone(),
                file_record(relative, path, extension, content_hash, metadata.as_ref()),
            );
        }

        Ok(outcome)
    }
}

/// A hashed file. Missing metadata leaves size and mtime at zero; the hash
/// alone decides whether the file changed.
fn file_record(
    relative: String,
    path: &Path,
    extension: String,
    content_hash: String,
    metadata: Option<&std::fs::Metadata>,
) -> FileRecord {
    let modified_time = metadata
        .and_then(|m| m.modified().ok())
        .map(chrono::DateTime::<chrono::Utc>::from)
        .unwrap_or_default();
    FileRecord {
        relative_path: relative,
        full_path: path.to_path_buf(),
        extension,
        content_hash,
        size: metadata.map(|m| m.len()).unwrap_or(0),
        modified_time,
    }
}

/// Relative path of `path` under `root`, joined with `/` on every platform.
pub fn relative_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn scanner(root: &Path) -> KnowledgeBaseScanner {
        KnowledgeBaseScanner::new(root, &[], false).unwrap()
    }

    #[test]
    fn finds_supported_files_recursively() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("guides/setup")).unwrap();
        fs::write(root.join("readme.md"), "# Readme").unwrap();
        fs::write(root.join("guides/setup/install.MD"), "# Install").unwrap();
        fs::write(root.join("notes.txt"), "ignored").unwrap();
        fs::write(root.join("report.pdf"), b"%PDF-1.4").unwrap();

        let outcome = scanner(root).scan(&BTreeMap::new()).unwrap();
        let keys: Vec<_> = outcome.files.keys().cloned().collect();
        assert_eq!(
            keys,
            vec![
                "guides/setup/install.MD".to_string(),
                "readme.md".to_string(),
                "report.pdf".to_string(),
            ]
        );
        assert_eq!(outcome.files["guides/setup/install.MD"].extension, "md");
        assert_eq!(outcome.files["readme.md"].size, 8);
    }

    #[test]
    fn default_excludes_apply() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::write(root.join("node_modules/pkg/readme.md"), "vendored").unwrap();
        fs::write(root.join("kept.md"), "kept").unwrap();

        let outcome = scanner(root).scan(&BTreeMap::new()).unwrap();
        assert_eq!(outcome.files.len(), 1);
        assert!(outcome.files.contains_key("kept.md"));
    }

    #[test]
    fn custom_excludes_apply() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("drafts")).unwrap();
        fs::write(root.join("drafts/wip.md"), "draft").unwrap();
        fs::write(root.join("final.md"), "final").unwrap();

        let outcome = KnowledgeBaseScanner::new(root, &["drafts/**".to_string()], false)
            .unwrap()
            .scan(&BTreeMap::new())
            .unwrap();
        assert_eq!(outcome.files.keys().collect::<Vec<_>>(), vec!["final.md"]);
    }

    #[test]
    fn missing_root_fails() {
        let tmp = TempDir::new().unwrap();
        let err = scanner(&tmp.path().join("absent"))
            .scan(&BTreeMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_keeps_previous_hash() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("kb");
        fs::create_dir_all(&root).unwrap();
        std::os::unix::fs::symlink(tmp.path().join("gone.md"), root.join("linked.md")).unwrap();
        std::os::unix::fs::symlink(tmp.path().join("gone.md"), root.join("new-link.md")).unwrap();
        fs::write(root.join("plain.md"), "plain").unwrap();

        let previous = BTreeMap::from([("linked.md".to_string(), "abc".to_string())]);
        let outcome = KnowledgeBaseScanner::new(&root, &[], true)
            .unwrap()
            .scan(&previous)
            .unwrap();
        assert_eq!(outcome.files.keys().collect::<Vec<_>>(), vec!["plain.md"]);
        assert_eq!(outcome.unreadable, previous, "untracked link is not carried");
        assert_eq!(outcome.hashes()["linked.md"], "abc");
    }

    #[test]
    fn record_without_metadata_keeps_hash() {
        let record = file_record(
            "a.md".to_string(),
            Path::new("/kb/a.md"),
            "md".to_string(),
            "h1".to_string(),
            None,
        );
        assert_eq!(record.content_hash, "h1");
        assert_eq!(record.size, 0);
        assert_eq!(record.modified_time, chrono::DateTime::<chrono::Utc>::default());
    }

    #[test]
    fn hashes_merge_unreadable() {
        let mut outcome = ScanOutcome::default();
        outcome
            .unreadable
            .insert("locked.md".to_string(), "abc".to_string());
        assert_eq!(outcome.hashes().get("locked.md").unwrap(), "abc");
        assert!(outcome.readable_hashes().is_empty());
    }
}
