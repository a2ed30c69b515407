//! HTTP API tests against a router served on an ephemeral port.

use anyhow::{bail, Result};
use async_trait::async_trait;
use kbsync::chat::{ChatMessage, ChatProvider};
use kbsync::embedding::EmbeddingProvider;
use kbsync::index::{IndexStore, VectorIndex};
use kbsync::models::{ChunkMetadata, DocumentChunk, SourceMetadata};
use kbsync::rag::RagHandler;
use kbsync::server::{router, AppState};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

struct KeywordEmbedder;

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword-3"
    }
    fn dims(&self) -> usize {
        3
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let t = t.to_lowercase();
                vec![
                    t.contains("vpn") as u8 as f32,
                    t.contains("holiday") as u8 as f32,
                    0.1,
                ]
            })
            .collect())
    }
}

struct ScriptedChat {
    model: &'static str,
    fail: bool,
}

#[async_trait]
impl ChatProvider for ScriptedChat {
    fn model_name(&self) -> &str {
        self.model
    }
    fn backend(&self) -> &str {
        "scripted"
    }
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        if self.fail {
            bail!("connection refused");
        }
        Ok(format!("[{}] {}", self.model, messages[1].content))
    }
}

fn chunk(path: &str, text: &str) -> DocumentChunk {
    DocumentChunk {
        id: format!("{path}#0"),
        text: text.to_string(),
        metadata: ChunkMetadata {
            source: SourceMetadata {
                file_path: path.to_string(),
                file_hash: "0".repeat(64),
                file_size: text.len() as u64,
                last_modified: chrono::Utc::now(),
                content_type: "text/markdown".to_string(),
            },
            start_index: 0,
            chunk_index: 0,
        },
    }
}

async fn write_index(dir: &Path) {
    let mut index = VectorIndex::new("keyword-3", 3);
    index
        .insert(chunk("it/vpn.md", "Connect to the VPN with the corporate profile."), vec![1.0, 0.0, 0.1])
        .unwrap();
    index
        .insert(chunk("hr/holidays.md", "Holiday requests need two weeks notice."), vec![0.0, 1.0, 0.1])
        .unwrap();
    let store = IndexStore::create(dir).await.unwrap();
    store.commit(true, &Default::default(), &index).await.unwrap();
    store.close().await;
}

/// Serve the router for `index_dir`; returns the base URL.
async fn serve(index_dir: &Path, fail_chat: bool) -> String {
    let rag = RagHandler::new(
        Arc::new(KeywordEmbedder),
        Arc::new(ScriptedChat { model: "base-model", fail: fail_chat }),
        Some(Arc::new(ScriptedChat { model: "lora-model", fail: fail_chat })),
        false,
        index_dir.to_path_buf(),
        1,
        2,
    );
    let app = router(AppState { rag: Arc::new(rag) });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn health_reports_index_state() {
    let tmp = TempDir::new().unwrap();
    let base = serve(tmp.path(), false).await;
    let client = reqwest::Client::new();

    let body: Value = client.get(format!("{base}/health")).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["index_ready"], false);

    write_index(tmp.path()).await;
    let body: Value = client.get(format!("{base}/health")).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["index_ready"], true);
}

#[tokio::test]
async fn ask_returns_answer_sources_and_model() {
    let tmp = TempDir::new().unwrap();
    write_index(tmp.path()).await;
    let base = serve(tmp.path(), false).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/ask"))
        .json(&json!({ "query": "How do I join the VPN?" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();

    assert_eq!(body["answer"], "[base-model] How do I join the VPN?");
    let sources = body["source_documents"].as_array().unwrap();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0]["metadata"]["file_path"], "it/vpn.md");
    assert!(sources[0]["content"].as_str().unwrap().contains("corporate profile"));
    assert_eq!(body["model_info"]["using_adapter"], false);
    assert!(body.get("error").is_none());
}

#[tokio::test]
async fn ask_can_select_adapter_per_request() {
    let tmp = TempDir::new().unwrap();
    write_index(tmp.path()).await;
    let base = serve(tmp.path(), false).await;

    let body: Value = reqwest::Client::new()
        .post(format!("{base}/ask"))
        .json(&json!({ "query": "holiday policy", "use_adapter": true }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["answer"], "[lora-model] holiday policy");
    assert_eq!(body["model_info"]["model"], "lora-model");
    assert_eq!(body["source_documents"][0]["metadata"]["file_path"], "hr/holidays.md");
}

#[tokio::test]
async fn ask_generation_failure_is_apology_not_http_error() {
    let tmp = TempDir::new().unwrap();
    write_index(tmp.path()).await;
    let base = serve(tmp.path(), true).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/ask"))
        .json(&json!({ "query": "vpn" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert!(body["answer"].as_str().unwrap().starts_with("Sorry"));
    assert!(body["error"].as_str().unwrap().contains("connection refused"));
    assert_eq!(body["source_documents"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn ask_error_contract() {
    let tmp = TempDir::new().unwrap();
    let base = serve(tmp.path(), false).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/ask"))
        .json(&json!({ "query": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let resp = client
        .post(format!("{base}/ask"))
        .json(&json!({ "query": "vpn" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "index_unavailable");
}

#[tokio::test]
async fn model_info_reflects_selection() {
    let tmp = TempDir::new().unwrap();
    let base = serve(tmp.path(), false).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .get(format!("{base}/model_info"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["backend"], "scripted");
    assert_eq!(body["model"], "base-model");
    assert_eq!(body["adapter_model"], "lora-model");
    assert_eq!(body["adapter_by_default"], false);
    assert_eq!(body["embedding_model"], "keyword-3");

    let body: Value = client
        .get(format!("{base}/model_info?use_adapter=true"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["model"], "lora-model");
    assert_eq!(body["using_adapter"], true);
}
