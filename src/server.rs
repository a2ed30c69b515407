//! HTTP surface for the knowledge-base assistant.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ask` | Answer a question from the indexed knowledge base |
//! | `GET`  | `/model_info` | Chat/embedding models and the default selection |
//! | `GET`  | `/health` | Health check (version, whether an index exists) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `index_unavailable` (503),
//! `retrieval_failed` (500). A chat-model failure is not an HTTP error: `/ask`
//! returns 200 with an apology answer and an `error` field.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser front-ends can
//! call the API directly.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::rag::{AskRequest, AskResponse, ModelInfo, RagHandler};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub rag: Arc<RagHandler>,
}

/// Build the router. Separate from [`run_server`] so tests can serve it on an
/// ephemeral port.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ask", post(handle_ask))
        .route("/model_info", get(handle_model_info))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind` and runs until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let rag = RagHandler::from_config(config)?;
    if !rag.index_ready() {
        warn!(
            vector_store = %config.paths.vector_store.display(),
            "no index yet; /ask will fail until `kbsync update` has run"
        );
    }
    let app = router(AppState { rag: Arc::new(rag) });

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "server listening");
    println!("kbsync server listening on http://{}", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn classify_retrieval_error(err: anyhow::Error) -> AppError {
    let message = format!("{:#}", err);
    if message.contains("no index") {
        AppError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "index_unavailable",
            message,
        }
    } else {
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "retrieval_failed",
            message,
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    index_ready: bool,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        index_ready: state.rag.index_ready(),
    })
}

// ============ GET /model_info ============

#[derive(Deserialize)]
struct ModelInfoQuery {
    use_adapter: Option<bool>,
}

async fn handle_model_info(
    State(state): State<AppState>,
    Query(query): Query<ModelInfoQuery>,
) -> Json<ModelInfo> {
    Json(state.rag.model_info(query.use_adapter))
}

// ============ POST /ask ============

/// Returns `400` for an empty query, `503` before the first update has
/// produced an index, and `500` when the query cannot be embedded.
async fn handle_ask(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Result<Json<AskResponse>, AppError> {
    if request.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let response = state
        .rag
        .answer(&request)
        .await
        .map_err(classify_retrieval_error)?;
    Ok(Json(response))
}
