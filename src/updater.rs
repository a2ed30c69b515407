//! The incremental update cycle.
//!
//! One call to [`IncrementalUpdater::incremental_update`] brings the vector
//! index in line with the knowledge base:
//!
//! 1. load the manifest and scan the knowledge base, hashing every supported file
//! 2. diff the hashes against the manifest (or treat everything as new on a rebuild)
//! 3. stop early if nothing changed
//! 4. open the existing index and check it was built by the same model
//! 5. load, chunk and embed the added and modified files
//! 6. in one index transaction, drop entries of deleted, modified and added
//!    files and insert the new chunks; then write the manifest
//!
//! The manifest is written only after the index transaction commits. If the
//! process dies between the two, the next cycle sees the same files as
//! changed again and replaces their entries; entries for paths being
//! re-indexed are always cleared first, so a replay never duplicates chunks.
//!
//! Cycles are serialized: an in-process mutex orders triggers from the same
//! scheduler, and an exclusive lock file orders separate processes.

use anyhow::Result;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{error, info, warn};

use crate::changes::{detect_changes, rebuild_all};
use crate::chunk::ChunkingPipeline;
use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::index::{IndexStore, VectorIndexAdapter};
use crate::loader::DocumentLoader;
use crate::lock::UpdateLock;
use crate::manifest::UpdateManifest;
use crate::models::{FileRecord, RawDocument, UpdateResult};
use crate::progress::{NoProgress, UpdatePhase, UpdateProgressEvent, UpdateProgressReporter};
use crate::scanner::KnowledgeBaseScanner;

/// Everything the updater needs from the config, in one place.
#[derive(Debug, Clone)]
pub struct UpdaterSettings {
    pub knowledge_base: PathBuf,
    pub vector_store: PathBuf,
    pub manifest: PathBuf,
    pub lock_file: PathBuf,
    pub exclude_globs: Vec<String>,
    pub follow_symlinks: bool,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embed_batch_size: usize,
}

impl UpdaterSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            knowledge_base: config.paths.knowledge_base.clone(),
            vector_store: config.paths.vector_store.clone(),
            manifest: config.paths.manifest.clone(),
            lock_file: config.paths.lock_file(),
            exclude_globs: config.paths.exclude_globs.clone(),
            follow_symlinks: config.paths.follow_symlinks,
            chunk_size: config.chunking.chunk_size,
            chunk_overlap: config.chunking.chunk_overlap,
            embed_batch_size: config.embedding.batch_size,
        }
    }
}

pub struct IncrementalUpdater {
    settings: UpdaterSettings,
    scanner: KnowledgeBaseScanner,
    loader: DocumentLoader,
    chunker: ChunkingPipeline,
    index: VectorIndexAdapter,
    progress: Box<dyn UpdateProgressReporter>,
    phase: Mutex<UpdatePhase>,
    cycle: tokio::sync::Mutex<()>,
}

impl IncrementalUpdater {
    pub fn new(settings: UpdaterSettings, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let scanner = KnowledgeBaseScanner::new(
            &settings.knowledge_base,
            &settings.exclude_globs,
            settings.follow_symlinks,
        )?;
        Ok(Self {
            scanner,
            loader: DocumentLoader::new(),
            chunker: ChunkingPipeline::new(settings.chunk_size, settings.chunk_overlap),
            index: VectorIndexAdapter::new(embedder, settings.embed_batch_size),
            progress: Box::new(NoProgress),
            phase: Mutex::new(UpdatePhase::Idle),
            cycle: tokio::sync::Mutex::new(()),
            settings,
        })
    }

    pub fn with_progress(mut self, progress: Box<dyn UpdateProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn settings(&self) -> &UpdaterSettings {
        &self.settings
    }

    /// Phase of the cycle in flight, or `Idle`.
    pub fn phase(&self) -> UpdatePhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, phase: UpdatePhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
        self.progress.report(UpdateProgressEvent::Phase(phase));
    }

    /// Run one update cycle. Never returns an error: failures come back as a
    /// result with `status = error` and leave the manifest untouched.
    pub async fn incremental_update(&self, force_rebuild: bool) -> UpdateResult {
        let _serial = self.cycle.lock().await;
        let start = Instant::now();

        let result = match self.run_cycle(force_rebuild, start).await {
            Ok(result) => result,
            Err(e) => {
                self.enter(UpdatePhase::Error);
                error!("update failed: {:#}", e);
                UpdateResult::failed(start.elapsed().as_secs_f64(), &e)
            }
        };
        self.enter(UpdatePhase::Idle);
        result
    }

    async fn run_cycle(&self, force_rebuild: bool, start: Instant) -> Result<UpdateResult> {
        let _lock = UpdateLock::acquire(&self.settings.lock_file).await?;

        self.enter(UpdatePhase::Scanning);
        info!(
            knowledge_base = %self.settings.knowledge_base.display(),
            force_rebuild,
            "starting update"
        );
        let previous = UpdateManifest::load(&self.settings.manifest)?;
        let scan = self.scanner.scan(&previous.file_hashes)?;

        self.enter(UpdatePhase::Detecting);
        let (changes, hashes) = if force_rebuild {
            (rebuild_all(scan.files.keys()), scan.readable_hashes())
        } else {
            let hashes = scan.hashes();
            (detect_changes(&hashes, &previous.file_hashes), hashes)
        };
        info!(
            added = changes.added.len(),
            modified = changes.modified.len(),
            deleted = changes.deleted.len(),
            "detected changes"
        );

        if changes.is_empty() && !force_rebuild {
            info!("no changes; index is up to date");
            return Ok(UpdateResult::no_changes(start.elapsed().as_secs_f64()));
        }

        let store = IndexStore::open(&self.settings.vector_store).await?;
        if let (Some(store), false) = (&store, force_rebuild) {
            self.index.ensure_model(store).await?;
        }
        // Added paths can only have entries left over from an interrupted cycle.
        let mut replaced = changes.stale_paths();
        replaced.extend(changes.added.iter().cloned());

        self.enter(UpdatePhase::Loading);
        let changed: Vec<&FileRecord> = changes
            .added
            .iter()
            .chain(&changes.modified)
            .filter_map(|path| scan.files.get(path))
            .collect();
        let documents = self.load_documents(&changed);

        self.enter(UpdatePhase::Chunking);
        let chunks = self.chunker.split(&documents);
        info!(
            files = changed.len(),
            documents = documents.len(),
            chunks = chunks.len(),
            "prepared chunks"
        );

        self.enter(UpdatePhase::Indexing);
        let additions = if chunks.is_empty() {
            self.index.empty()
        } else {
            self.progress.report(UpdateProgressEvent::Embedding {
                chunks: chunks.len() as u64,
            });
            self.index.build(chunks).await?
        };

        self.enter(UpdatePhase::Persisting);
        let store = match store {
            Some(store) => Some(store),
            None if force_rebuild || !additions.is_empty() => {
                Some(IndexStore::create(&self.settings.vector_store).await?)
            }
            None => {
                warn!("no index exists and nothing was indexed; skipping index save");
                None
            }
        };
        let total_chunks = match &store {
            Some(store) => {
                self.index
                    .commit(store, force_rebuild, &replaced, &additions)
                    .await?
            }
            None => 0,
        };

        let total_documents = hashes.len();
        let manifest = UpdateManifest {
            last_update: Some(Utc::now()),
            file_hashes: hashes,
            total_documents,
            total_chunks,
        };
        manifest.save(&self.settings.manifest)?;
        if let Some(store) = store {
            store.close().await;
        }

        let duration = start.elapsed().as_secs_f64();
        info!(
            total_documents,
            total_chunks,
            duration_secs = duration,
            "update complete"
        );
        Ok(UpdateResult::success(
            duration,
            changes,
            total_documents,
            total_chunks,
        ))
    }

    fn load_documents(&self, files: &[&FileRecord]) -> Vec<RawDocument> {
        let total = files.len() as u64;
        let mut documents = Vec::new();
        for (i, record) in files.iter().enumerate() {
            documents.extend(self.loader.load(record));
            self.progress.report(UpdateProgressEvent::Loading {
                n: i as u64 + 1,
                total,
            });
        }
        documents
    }
}
