//! Vector index persisted in SQLite.
//!
//! An index directory holds one database, `index.db`:
//!
//! | Table | Contents |
//! |-------|----------|
//! | `index_meta` | format version, embedding model, dimensionality, commit generation |
//! | `chunks` | one row per chunk: id, source path, text, metadata JSON, vector blob |
//!
//! Every change an update cycle makes (removing stale paths, inserting new
//! chunks, bumping the generation) is applied in a single transaction, so a
//! reader or a crashed writer sees either the previous commit or the new one.
//! Readers load all rows into a [`VectorIndex`] and search it with
//! brute-force cosine similarity, which is ample for a personal knowledge base.

use anyhow::{anyhow, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::Row;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, EmbeddingProvider};
use crate::models::{ChunkMetadata, DocumentChunk};

pub const INDEX_DB: &str = "index.db";
const FORMAT_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("index database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("malformed chunk metadata: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported index format version {0}")]
    Version(i64),
    #[error("chunk {id} holds {found} vector dimensions, index expects {expected}")]
    Corrupt {
        id: String,
        expected: usize,
        found: usize,
    },
    #[error("vector has {found} dimensions, index expects {expected}")]
    Dimensions { expected: usize, found: usize },
    #[error("index was built with model '{index}' but the provider is '{provider}'; run with --force-rebuild")]
    ModelMismatch { index: String, provider: String },
}

/// One indexed chunk without its vector.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

/// A scored search hit.
#[derive(Debug, Clone)]
pub struct SearchHit<'a> {
    pub entry: &'a IndexEntry,
    pub score: f32,
}

/// In-memory chunks and vectors: a loaded snapshot of the store, or a
/// batch of freshly embedded chunks waiting to be committed.
#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    model: String,
    dims: usize,
    generation: i64,
    entries: Vec<IndexEntry>,
    vectors: Vec<Vec<f32>>,
}

impl VectorIndex {
    /// An empty index for `model`. `dims` of `0` is fixed by the first insert.
    pub fn new(model: &str, dims: usize) -> Self {
        Self {
            model: model.to_string(),
            dims,
            ..Self::default()
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Commit generation this snapshot was loaded at; `0` for unsaved batches.
    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn insert(&mut self, chunk: DocumentChunk, vector: Vec<f32>) -> Result<(), IndexError> {
        if self.dims == 0 {
            self.dims = vector.len();
        }
        if vector.len() != self.dims {
            return Err(IndexError::Dimensions {
                expected: self.dims,
                found: vector.len(),
            });
        }
        self.entries.push(IndexEntry {
            id: chunk.id,
            text: chunk.text,
            metadata: chunk.metadata,
        });
        self.vectors.push(vector);
        Ok(())
    }

    pub fn count_for_path(&self, path: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.metadata.source.file_path == path)
            .count()
    }

    /// Top `k` entries by cosine similarity, best first.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit<'_>> {
        let mut hits: Vec<SearchHit<'_>> = self
            .entries
            .iter()
            .zip(&self.vectors)
            .map(|(entry, vector)| SearchHit {
                entry,
                score: cosine_similarity(query, vector),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entry.id.cmp(&b.entry.id))
        });
        hits.truncate(k);
        hits
    }
}

/// Contents of `index_meta` plus the row count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexInfo {
    pub model: Option<String>,
    pub dims: usize,
    pub generation: i64,
    pub entries: usize,
}

/// Handle on the database of one index directory.
#[derive(Clone)]
pub struct IndexStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl IndexStore {
    pub fn db_path(dir: &Path) -> PathBuf {
        dir.join(INDEX_DB)
    }

    /// Whether an index has been created in `dir`.
    pub fn exists(dir: &Path) -> bool {
        Self::db_path(dir).is_file()
    }

    /// Open the index in `dir`. `Ok(None)` when none has been created there.
    pub async fn open(dir: &Path) -> Result<Option<Self>, IndexError> {
        if !Self::exists(dir) {
            return Ok(None);
        }
        Self::connect(dir, false).await.map(Some)
    }

    /// Open the index in `dir`, creating an empty one if needed.
    pub async fn create(dir: &Path) -> Result<Self, IndexError> {
        std::fs::create_dir_all(dir).map_err(|source| IndexError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        Self::connect(dir, true).await
    }

    async fn connect(dir: &Path, create: bool) -> Result<Self, IndexError> {
        let path = Self::db_path(dir);
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(create)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool, path };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), IndexError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS index_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                file_path TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                metadata_json TEXT NOT NULL,
                embedding BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_file_path ON chunks(file_path)")
            .execute(&self.pool)
            .await?;

        sqlx::query("INSERT OR IGNORE INTO index_meta (key, value) VALUES ('format_version', ?)")
            .bind(FORMAT_VERSION.to_string())
            .execute(&self.pool)
            .await?;

        let version: String =
            sqlx::query_scalar("SELECT value FROM index_meta WHERE key = 'format_version'")
                .fetch_one(&self.pool)
                .await?;
        match version.parse::<i64>() {
            Ok(FORMAT_VERSION) => Ok(()),
            Ok(other) => Err(IndexError::Version(other)),
            Err(_) => Err(IndexError::Version(-1)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn info(&self) -> Result<IndexInfo, IndexError> {
        let mut conn = self.pool.acquire().await?;
        read_info(&mut *conn).await
    }

    /// Generation of the last commit; changes whenever the contents do.
    pub async fn generation(&self) -> Result<i64, IndexError> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM index_meta WHERE key = 'generation'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    /// Read every chunk from one consistent snapshot.
    pub async fn load(&self) -> Result<VectorIndex, IndexError> {
        let mut tx = self.pool.begin().await?;
        let info = read_info(&mut *tx).await?;
        let rows = sqlx::query("SELECT id, text, metadata_json, embedding FROM chunks ORDER BY rowid")
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut index = VectorIndex {
            model: info.model.unwrap_or_default(),
            dims: info.dims,
            generation: info.generation,
            entries: Vec::with_capacity(rows.len()),
            vectors: Vec::with_capacity(rows.len()),
        };
        for row in rows {
            let id: String = row.try_get("id")?;
            let blob: Vec<u8> = row.try_get("embedding")?;
            let vector = blob_to_vec(&blob);
            if vector.len() != index.dims || blob.len() != index.dims * 4 {
                return Err(IndexError::Corrupt {
                    id,
                    expected: index.dims,
                    found: blob.len() / 4,
                });
            }
            let metadata_json: String = row.try_get("metadata_json")?;
            index.entries.push(IndexEntry {
                id,
                text: row.try_get("text")?,
                metadata: serde_json::from_str(&metadata_json)?,
            });
            index.vectors.push(vector);
        }
        Ok(index)
    }

    /// Apply one cycle's changes in a single transaction and return the
    /// number of entries afterwards.
    ///
    /// With `replace_all` every existing entry goes; otherwise entries whose
    /// source path is in `remove` are deleted. Then `additions` are inserted.
    pub async fn commit(
        &self,
        replace_all: bool,
        remove: &BTreeSet<String>,
        additions: &VectorIndex,
    ) -> Result<CommitOutcome, IndexError> {
        let mut tx = self.pool.begin().await?;
        let before = read_info(&mut *tx).await?;

        let mut removed = 0u64;
        if replace_all {
            removed = sqlx::query("DELETE FROM chunks")
                .execute(&mut *tx)
                .await?
                .rows_affected();
        } else {
            for path in remove {
                removed += sqlx::query("DELETE FROM chunks WHERE file_path = ?")
                    .bind(path)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
            }
        }

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&mut *tx)
            .await?;
        if remaining > 0 && !additions.is_empty() {
            if let Some(model) = before.model.as_deref().filter(|m| *m != additions.model) {
                return Err(IndexError::ModelMismatch {
                    index: model.to_string(),
                    provider: additions.model.clone(),
                });
            }
            if before.dims != additions.dims {
                return Err(IndexError::Dimensions {
                    expected: before.dims,
                    found: additions.dims,
                });
            }
        }

        for (entry, vector) in additions.entries.iter().zip(&additions.vectors) {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, file_path, chunk_index, text, metadata_json, embedding)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    file_path = excluded.file_path,
                    chunk_index = excluded.chunk_index,
                    text = excluded.text,
                    metadata_json = excluded.metadata_json,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&entry.id)
            .bind(&entry.metadata.source.file_path)
            .bind(entry.metadata.chunk_index as i64)
            .bind(&entry.text)
            .bind(serde_json::to_string(&entry.metadata)?)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
        }

        let dims = if additions.dims > 0 {
            additions.dims
        } else if remaining > 0 {
            before.dims
        } else {
            0
        };
        let generation = before.generation + 1;
        for (key, value) in [
            ("model", additions.model.clone()),
            ("dims", dims.to_string()),
            ("generation", generation.to_string()),
        ] {
            sqlx::query(
                "INSERT INTO index_meta (key, value) VALUES (?, ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }

        let entries: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(CommitOutcome {
            removed: removed as usize,
            entries: entries as usize,
            generation,
        })
    }

    /// Chunk count per source path.
    pub async fn chunk_counts(&self) -> Result<BTreeMap<String, usize>, IndexError> {
        let rows = sqlx::query("SELECT file_path, COUNT(*) AS n FROM chunks GROUP BY file_path")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<(String, usize), IndexError> {
                let path: String = row.try_get("file_path")?;
                let n: i64 = row.try_get("n")?;
                Ok((path, n as usize))
            })
            .collect()
    }

    /// Bytes on disk, write-ahead log included.
    pub fn size_on_disk(dir: &Path) -> u64 {
        ["", "-wal", "-shm"]
            .iter()
            .filter_map(|suffix| {
                let mut name = Self::db_path(dir).into_os_string();
                name.push(suffix);
                std::fs::metadata(name).ok()
            })
            .map(|m| m.len())
            .sum()
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// What [`IndexStore::commit`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    pub removed: usize,
    pub entries: usize,
    pub generation: i64,
}

async fn read_info(conn: &mut SqliteConnection) -> Result<IndexInfo, IndexError> {
    let rows = sqlx::query("SELECT key, value FROM index_meta")
        .fetch_all(&mut *conn)
        .await?;
    let mut info = IndexInfo::default();
    for row in rows {
        let key: String = row.try_get("key")?;
        let value: String = row.try_get("value")?;
        match key.as_str() {
            "model" if !value.is_empty() => info.model = Some(value),
            "dims" => info.dims = value.parse().unwrap_or(0),
            "generation" => info.generation = value.parse().unwrap_or(0),
            _ => {}
        }
    }
    let entries: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(&mut *conn)
        .await?;
    info.entries = entries as usize;
    Ok(info)
}

/// Embeds chunks and commits them to the store on behalf of the updater.
///
/// Owns the embedding provider; chunks are embedded in batches of
/// `batch_size` texts.
pub struct VectorIndexAdapter {
    embedder: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
}

impl VectorIndexAdapter {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, batch_size: usize) -> Self {
        Self {
            embedder,
            batch_size: batch_size.max(1),
        }
    }

    /// Refuse a non-empty store built by a different model.
    pub async fn ensure_model(&self, store: &IndexStore) -> Result<()> {
        let info = store.info().await?;
        match info.model {
            Some(model) if info.entries > 0 && model != self.embedder.model_name() => {
                Err(IndexError::ModelMismatch {
                    index: model,
                    provider: self.embedder.model_name().to_string(),
                }
                .into())
            }
            _ => {
                debug!(entries = info.entries, "index model matches provider");
                Ok(())
            }
        }
    }

    /// An empty batch for the current model.
    pub fn empty(&self) -> VectorIndex {
        VectorIndex::new(self.embedder.model_name(), self.embedder.dims())
    }

    /// Embed `chunks` into an uncommitted batch.
    pub async fn build(&self, chunks: Vec<DocumentChunk>) -> Result<VectorIndex> {
        let mut index = self.empty();
        let total = chunks.len();
        let mut pending = chunks.into_iter().peekable();
        let mut done = 0;

        while pending.peek().is_some() {
            let batch: Vec<DocumentChunk> = pending.by_ref().take(self.batch_size).collect();
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self.embedder.embed(&texts).await?;
            if vectors.len() != batch.len() {
                return Err(anyhow!(
                    "embedding provider returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                ));
            }
            for (chunk, vector) in batch.into_iter().zip(vectors) {
                index.insert(chunk, vector)?;
            }
            done += texts.len();
            debug!(done, total, "embedded batch");
        }

        Ok(index)
    }

    /// Drop entries for `remove` (or everything) and insert `additions`, atomically.
    pub async fn commit(
        &self,
        store: &IndexStore,
        replace_all: bool,
        remove: &BTreeSet<String>,
        additions: &VectorIndex,
    ) -> Result<usize> {
        let outcome = store.commit(replace_all, remove, additions).await?;
        if outcome.removed > 0 {
            info!(removed = outcome.removed, files = remove.len(), "removed stale index entries");
        }
        debug!(
            entries = outcome.entries,
            generation = outcome.generation,
            db = %store.path().display(),
            "committed index"
        );
        Ok(outcome.entries)
    }
}
