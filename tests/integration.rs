//! CLI tests: run the `kbsync` binary against scratch knowledge bases.
//!
//! Tests that need embeddings or chat point the binary at an in-process fake
//! of the Ollama API.

use axum::{routing::post, Json, Router};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::process::Command;

fn kbsync_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_kbsync"))
}

/// Serve `/api/embed` and `/api/chat` on an ephemeral port; returns the base URL.
async fn spawn_fake_ollama() -> String {
    async fn embed(Json(body): Json<Value>) -> Json<Value> {
        let embeddings: Vec<Vec<f32>> = body["input"]
            .as_array()
            .map(|inputs| {
                inputs
                    .iter()
                    .map(|text| {
                        let text = text.as_str().unwrap_or_default();
                        vec![
                            text.len() as f32,
                            text.split_whitespace().count() as f32,
                            1.0,
                        ]
                    })
                    .collect()
            })
            .unwrap_or_default();
        Json(json!({ "model": body["model"], "embeddings": embeddings }))
    }

    async fn chat(Json(body): Json<Value>) -> Json<Value> {
        let system = body["messages"][0]["content"].as_str().unwrap_or_default();
        let answer = if system.contains("monthly") {
            "<think>the context says monthly</think>Keys are rotated monthly."
        } else {
            "I don't know."
        };
        Json(json!({ "message": { "role": "assistant", "content": answer } }))
    }

    let app = Router::new()
        .route("/api/embed", post(embed))
        .route("/api/chat", post(chat));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Scratch workspace with `kb/`, `data/` and `config/kbsync.toml`.
fn setup_env(embedding: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    fs::create_dir_all(root.join("kb")).unwrap();
    fs::create_dir_all(root.join("config")).unwrap();

    let config = format!(
        r#"[paths]
knowledge_base = "{root}/kb"
vector_store = "{root}/data/vector_store"
manifest = "{root}/data/update_manifest.json"

[chunking]
chunk_size = 500
chunk_overlap = 100

{embedding}

[retrieval]
top_k = 3
"#,
        root = root.display(),
        embedding = embedding,
    );
    let config_path = root.join("config").join("kbsync.toml");
    fs::write(&config_path, config).unwrap();
    (tmp, config_path)
}

fn ollama_sections(url: &str) -> String {
    format!(
        r#"[embedding]
provider = "ollama"
model = "fake-embed"
url = "{url}"
max_retries = 0

[chat]
provider = "ollama"
model = "fake-chat"
url = "{url}"
max_retries = 0
"#
    )
}

async fn run_kbsync(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = kbsync_binary();
    let output = Command::new(&binary)
        .arg("--app-config")
        .arg(config_path)
        .args(args)
        .output()
        .await
        .unwrap_or_else(|e| panic!("Failed to run kbsync binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[tokio::test]
async fn test_update_empty_knowledge_base() {
    let (_tmp, config_path) = setup_env("");

    let (stdout, stderr, success) = run_kbsync(&config_path, &["update"]).await;
    assert!(success, "update failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("No changes detected"));
}

#[tokio::test]
async fn test_update_failure_exits_nonzero_and_keeps_manifest() {
    let (tmp, config_path) = setup_env("");
    fs::write(tmp.path().join("kb/a.md"), "# A\n\nSome text.").unwrap();

    let (stdout, _, success) = run_kbsync(&config_path, &["update"]).await;
    assert!(!success);
    assert!(stdout.contains("Update failed"));
    assert!(!tmp.path().join("data/update_manifest.json").exists());
}

#[tokio::test]
async fn test_missing_knowledge_base_is_config_error() {
    let (tmp, config_path) = setup_env("");
    fs::remove_dir(tmp.path().join("kb")).unwrap();

    let (_, stderr, success) = run_kbsync(&config_path, &["update"]).await;
    assert!(!success);
    assert!(stderr.contains("knowledge_base"), "stderr={}", stderr);
}

#[tokio::test]
async fn test_missing_embedding_model_is_config_error() {
    let (_tmp, config_path) = setup_env("[embedding]\nprovider = \"ollama\"\n");

    let (_, stderr, success) = run_kbsync(&config_path, &["status"]).await;
    assert!(!success);
    assert!(stderr.contains("embedding.model"), "stderr={}", stderr);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_update_then_incremental_noop() {
    let url = spawn_fake_ollama().await;
    let (tmp, config_path) = setup_env(&ollama_sections(&url));
    fs::write(tmp.path().join("kb/security.md"), "# Security\n\nKeys are rotated monthly.").unwrap();
    fs::create_dir_all(tmp.path().join("kb/ops")).unwrap();
    fs::write(tmp.path().join("kb/ops/deploy.md"), "# Deploy\n\nShip on Tuesdays.").unwrap();

    let (stdout, stderr, success) = run_kbsync(&config_path, &["update"]).await;
    assert!(success, "update failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("2 added, 0 modified, 0 deleted"), "stdout={}", stdout);

    let (stdout, _, success) = run_kbsync(&config_path, &["update", "--verbose"]).await;
    assert!(success);
    let result: Value = serde_json::from_str(stdout.trim()).unwrap();
    assert_eq!(result["status"], "no_changes");
    assert_eq!(result["changes"]["added"], 0);

    let manifest: Value =
        serde_json::from_slice(&fs::read(tmp.path().join("data/update_manifest.json")).unwrap())
            .unwrap();
    assert_eq!(manifest["total_documents"], 2);
    assert!(manifest["file_hashes"]["ops/deploy.md"].is_string());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_status_after_update() {
    let url = spawn_fake_ollama().await;
    let (tmp, config_path) = setup_env(&ollama_sections(&url));

    let (stdout, _, success) = run_kbsync(&config_path, &["status"]).await;
    assert!(success);
    assert!(stdout.contains("Last update:    never"));
    assert!(stdout.contains("not built"));

    fs::write(tmp.path().join("kb/a.md"), "alpha").unwrap();
    run_kbsync(&config_path, &["update"]).await;

    let (stdout, _, success) = run_kbsync(&config_path, &["status"]).await;
    assert!(success);
    assert!(stdout.contains("Last update:    just now"), "stdout={}", stdout);
    assert!(stdout.contains("Documents:      1"));
    assert!(stdout.contains("fake-embed"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_schedule_manual_run() {
    let url = spawn_fake_ollama().await;
    let (tmp, config_path) = setup_env(&ollama_sections(&url));
    fs::write(tmp.path().join("kb/a.md"), "alpha").unwrap();

    let log_file = tmp.path().join("logs/scheduler.log");
    let sched_path = tmp.path().join("config/scheduler.json");
    fs::write(
        &sched_path,
        json!({ "logging": { "enabled": true, "log_file": log_file } }).to_string(),
    )
    .unwrap();

    let (stdout, stderr, success) = run_kbsync(
        &config_path,
        &["schedule", "--manual", "--config", sched_path.to_str().unwrap()],
    )
    .await;
    assert!(success, "schedule failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("1 added"));
    assert!(fs::read_to_string(&log_file).unwrap().contains("update complete"));

    let (stdout, _, success) = run_kbsync(
        &config_path,
        &[
            "schedule",
            "--manual",
            "--force-rebuild",
            "--config",
            sched_path.to_str().unwrap(),
        ],
    )
    .await;
    assert!(success);
    assert!(stdout.contains("1 added"));
}

#[tokio::test]
async fn test_schedule_manual_failure_exit_code() {
    let (tmp, config_path) = setup_env("");
    fs::write(tmp.path().join("kb/a.md"), "alpha").unwrap();
    let sched_path = tmp.path().join("config/scheduler.json");
    fs::write(&sched_path, r#"{"logging": {"enabled": false}}"#).unwrap();

    let (_, _, success) = run_kbsync(
        &config_path,
        &["schedule", "--manual", "--config", sched_path.to_str().unwrap()],
    )
    .await;
    assert!(!success);
}

#[tokio::test]
async fn test_schedule_rejects_bad_daily_time() {
    let (tmp, config_path) = setup_env("");
    let sched_path = tmp.path().join("config/scheduler.json");
    fs::write(
        &sched_path,
        r#"{"scheduled_update": {"time": "25:99"}, "logging": {"enabled": false}}"#,
    )
    .unwrap();

    let (_, stderr, success) = run_kbsync(
        &config_path,
        &["schedule", "--manual", "--config", sched_path.to_str().unwrap()],
    )
    .await;
    assert!(!success);
    assert!(stderr.contains("HH:MM"), "stderr={}", stderr);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ask_answers_with_sources() {
    let url = spawn_fake_ollama().await;
    let (tmp, config_path) = setup_env(&ollama_sections(&url));
    fs::write(tmp.path().join("kb/security.md"), "# Security\n\nKeys are rotated monthly.").unwrap();

    let (_, _, success) = run_kbsync(&config_path, &["ask", "How often are keys rotated?"]).await;
    assert!(!success, "ask must fail before the first update");

    run_kbsync(&config_path, &["update"]).await;
    let (stdout, stderr, success) =
        run_kbsync(&config_path, &["ask", "How often are keys rotated?"]).await;
    assert!(success, "ask failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.starts_with("Keys are rotated monthly."), "stdout={}", stdout);
    assert!(stdout.contains("[1] security.md"));
}
