//! Retrieval-augmented question answering over the vector index.
//!
//! [`RagHandler`] embeds the question, takes the `top_k` nearest chunks from
//! the index, and asks a chat model to answer from them. It owns everything
//! a request needs (providers, index handle, concurrency limit) and is shared
//! by the CLI and the HTTP server.
//!
//! The index is re-read whenever the updater commits a new generation, so a
//! long-running server answers from fresh content without a restart.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::chat::{create_chat_provider, ChatMessage, ChatProvider};
use crate::config::Config;
use crate::embedding::{create_provider, embed_query, EmbeddingProvider};
use crate::index::{IndexStore, VectorIndex};
use crate::models::ChunkMetadata;

const SYSTEM_PROMPT: &str = "You are a knowledge-base assistant. Answer the user's question \
using only the context below. If the context does not contain the answer, say so plainly \
instead of guessing. Keep answers accurate and concise.\n\nContext:\n";

const APOLOGY: &str = "Sorry, I could not generate an answer to your question right now.";

#[derive(Debug, Clone, Deserialize)]
pub struct AskRequest {
    pub query: String,
    /// Answer with the adapter model; `None` uses the configured default.
    #[serde(default)]
    pub use_adapter: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceDocument {
    pub content: String,
    pub metadata: ChunkMetadata,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModelInfo {
    pub backend: String,
    pub model: String,
    pub adapter_model: Option<String>,
    pub using_adapter: bool,
    pub adapter_by_default: bool,
    pub vector_store: PathBuf,
    pub embedding_model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AskResponse {
    pub answer: String,
    pub source_documents: Vec<SourceDocument>,
    pub model_info: ModelInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}


pub struct RagHandler {
    embedder: Arc<dyn EmbeddingProvider>,
    base: Arc<dyn ChatProvider>,
    adapter: Option<Arc<dyn ChatProvider>>,
    use_adapter_default: bool,
    index_dir: PathBuf,
    top_k: usize,
    store: OnceCell<IndexStore>,
    index: RwLock<Option<VectorIndex>>,
    generation_slots: Semaphore,
}

impl RagHandler {
    pub fn from_config(config: &Config) -> Result<Self> {
        let embedder = create_provider(&config.embedding)?;
        let base = create_chat_provider(&config.chat, &config.chat.model)?;
        let adapter = config
            .chat
            .adapter_model
            .as_deref()
            .map(|model| create_chat_provider(&config.chat, model))
            .transpose()?;

        Ok(Self::new(
            embedder,
            base,
            adapter,
            config.chat.use_adapter,
            config.paths.vector_store.clone(),
            config.retrieval.top_k,
            config.chat.max_concurrency,
        ))
    }

    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        base: Arc<dyn ChatProvider>,
        adapter: Option<Arc<dyn ChatProvider>>,
        use_adapter_default: bool,
        index_dir: PathBuf,
        top_k: usize,
        max_concurrency: usize,
    ) -> Self {
        Self {
            embedder,
            base,
            adapter,
            use_adapter_default,
            index_dir,
            top_k: top_k.max(1),
            store: OnceCell::new(),
            index: RwLock::new(None),
            generation_slots: Semaphore::new(max_concurrency.max(1)),
        }
    }

    pub fn model_info(&self, use_adapter: Option<bool>) -> ModelInfo {
        let (chat, using_adapter) = self.select_model(use_adapter);
        ModelInfo {
            backend: chat.backend().to_string(),
            model: chat.model_name().to_string(),
            adapter_model: self.adapter.as_ref().map(|a| a.model_name().to_string()),
            using_adapter,
            adapter_by_default: self.use_adapter_default && self.adapter.is_some(),
            vector_store: self.index_dir.clone(),
            embedding_model: self.embedder.model_name().to_string(),
        }
    }

    fn select_model(&self, use_adapter: Option<bool>) -> (&Arc<dyn ChatProvider>, bool) {
        let wanted = use_adapter.unwrap_or(self.use_adapter_default);
        match (&self.adapter, wanted) {
            (Some(adapter), true) => (adapter, true),
            _ => (&self.base, false),
        }
    }

    /// Whether an index exists on disk yet.
    pub fn index_ready(&self) -> bool {
        IndexStore::exists(&self.index_dir)
    }

    async fn store(&self) -> Result<&IndexStore> {
        self.store
            .get_or_try_init(|| async {
                IndexStore::open(&self.index_dir)
                    .await
                    .with_context(|| format!("open index in {}", self.index_dir.display()))?
                    .ok_or_else(|| {
                        anyhow!(
                            "no index at {}; run `kbsync update` first",
                            self.index_dir.display()
                        )
                    })
            })
            .await
    }

    /// Reload the index if a newer generation has been committed.
    ///
    /// The load runs without holding the lock; the write guard is taken only
    /// to swap the snapshot in.
    async fn refresh_index(&self) -> Result<()> {
        let store = self.store().await?;
        let generation = store.generation().await?;
        if let Some(loaded) = self.index.read().await.as_ref() {
            if loaded.generation() >= generation {
                return Ok(());
            }
        }

        let index = store
            .load()
            .await
            .with_context(|| format!("load index from {}", self.index_dir.display()))?;
        if !index.is_empty() && index.model() != self.embedder.model_name() {
            warn!(
                index_model = index.model(),
                provider_model = self.embedder.model_name(),
                "index was built with a different embedding model"
            );
        }

        let mut slot = self.index.write().await;
        if slot.as_ref().map_or(true, |l| l.generation() < index.generation()) {
            info!(entries = index.len(), generation = index.generation(), "index loaded");
            *slot = Some(index);
        }
        Ok(())
    }

    /// The `top_k` chunks most similar to `query`.
    pub async fn retrieve(&self, query: &str) -> Result<Vec<SourceDocument>> {
        self.refresh_index().await?;
        let vector = embed_query(self.embedder.as_ref(), query).await?;

        let guard = self.index.read().await;
        let loaded = guard
            .as_ref()
            .ok_or_else(|| anyhow!("index is not loaded"))?;
        let documents = loaded
            .search(&vector, self.top_k)
            .into_iter()
            .map(|hit| SourceDocument {
                content: hit.entry.text.clone(),
                metadata: hit.entry.metadata.clone(),
                score: hit.score,
            })
            .collect();
        Ok(documents)
    }

    /// Answer a question.
    ///
    /// Retrieval failures are errors. A generation failure still returns the
    /// retrieved sources, with an apology as the answer and the cause in `error`.
    pub async fn answer(&self, request: &AskRequest) -> Result<AskResponse> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(anyhow!("query must not be empty"));
        }

        let source_documents = self.retrieve(query).await?;
        let model_info = self.model_info(request.use_adapter);
        let (chat, _) = self.select_model(request.use_adapter);
        let messages = build_messages(&source_documents, query);

        let _permit = self
            .generation_slots
            .acquire()
            .await
            .map_err(|_| anyhow!("generation pool closed"))?;
        debug!(model = chat.model_name(), sources = source_documents.len(), "generating answer");

        match chat.complete(&messages).await {
            Ok(answer) => Ok(AskResponse {
                answer,
                source_documents,
                model_info,
                error: None,
            }),
            Err(e) => {
                warn!("answer generation failed: {:#}", e);
                Ok(AskResponse {
                    answer: APOLOGY.to_string(),
                    source_documents,
                    model_info,
                    error: Some(format!("{:#}", e)),
                })
            }
        }
    }
}

/// System prompt with the retrieved context, then the question.
pub fn build_messages(sources: &[SourceDocument], query: &str) -> Vec<ChatMessage> {
    let mut system = String::from(SYSTEM_PROMPT);
    for (i, doc) in sources.iter().enumerate() {
        system.push_str(&format!(
            "\n[{}] {}\n{}\n",
            i + 1,
            doc.metadata.source.file_path,
            doc.content.trim()
        ));
    }
    vec![ChatMessage::system(system), ChatMessage::user(query)]
}
