//! HTTP chat server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/chat` | Answer one customer message |
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/stats` | Request metrics, cache stats, escalation queue |
//! | `GET`  | `/tickets` | List tickets (`?status=pending_review&limit=50`) |
//! | `GET`  | `/tickets/{id}` | One ticket with its turns |
//! | `PATCH` | `/tickets/{id}` | Update status, notes, assignee, or read flag |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "message must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404).
//!
//! An escalated chat is a `200` with `"escalated": true`. A chat the
//! agent could not process is also a `200`, with `"error": true`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use support_harness_core::cache::CacheStats;

use crate::app::{build_app, App};
use crate::config::Config;
use crate::graph::{ChatOutcome, ChatRequest, SupportGraph};
use crate::metrics::MetricsSnapshot;
use crate::tickets::{Ticket, TicketStats, TicketStatus, TicketStore};

const DEFAULT_TICKET_LIMIT: usize = 100;

#[derive(Clone)]
struct AppState {
    graph: Arc<SupportGraph>,
    tickets: Arc<TicketStore>,
}

/// Build the index-backed app from `config` and serve it on `[server].bind`.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let app = build_app(config).await?;
    serve(app, &config.server.bind).await
}

/// Serve an already assembled app. Runs until the process is terminated.
pub async fn serve(app: App, bind_addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("support server listening on http://{}", bind_addr);
    axum::serve(listener, router(app)).await?;
    Ok(())
}

pub fn router(app: App) -> Router {
    let state = AppState {
        graph: app.graph,
        tickets: app.tickets,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/chat", post(handle_chat))
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .route("/tickets", get(handle_list_tickets))
        .route("/tickets/{id}", get(handle_get_ticket).patch(handle_update_ticket))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"not_found"`).
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

// ============ POST /chat ============

#[derive(Deserialize)]
struct ChatBody {
    message: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    ticket_id: Option<String>,
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(body): Json<ChatBody>,
) -> Result<Json<ChatOutcome>, AppError> {
    let message = body.message.trim();
    if message.is_empty() {
        return Err(bad_request("message must not be empty"));
    }

    let outcome = state
        .graph
        .run(ChatRequest {
            message: message.to_string(),
            user_id: body.user_id,
            ticket_id: body.ticket_id.filter(|t| !t.trim().is_empty()),
        })
        .await;

    Ok(Json(outcome))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /stats ============

#[derive(Serialize)]
struct CredentialStats {
    total: usize,
    available: usize,
}

#[derive(Serialize)]
struct StatsResponse {
    metrics: MetricsSnapshot,
    cache: Option<CacheStats>,
    tickets: TicketStats,
    indexed_chunks: usize,
    credentials: CredentialStats,
}

async fn handle_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let graph = &state.graph;
    Json(StatsResponse {
        metrics: graph.metrics().snapshot(),
        cache: graph.cache().map(|c| c.stats()),
        tickets: state.tickets.stats(),
        indexed_chunks: graph.index().len(),
        credentials: CredentialStats {
            total: graph.credentials().len(),
            available: graph.credentials().available(),
        },
    })
}

// ============ GET /tickets ============

#[derive(Deserialize)]
struct TicketQuery {
    status: Option<String>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct TicketListResponse {
    tickets: Vec<Ticket>,
}

async fn handle_list_tickets(
    State(state): State<AppState>,
    Query(query): Query<TicketQuery>,
) -> Result<Json<TicketListResponse>, AppError> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(s) => Some(
            TicketStatus::parse(s).ok_or_else(|| bad_request(format!("unknown ticket status: {}", s)))?,
        ),
    };
    let limit = query.limit.unwrap_or(DEFAULT_TICKET_LIMIT);

    Ok(Json(TicketListResponse {
        tickets: state.tickets.list(status, limit),
    }))
}

async fn handle_get_ticket(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Ticket>, AppError> {
    state
        .tickets
        .get(&id)
        .map(Json)
        .ok_or_else(|| not_found(format!("ticket not found: {}", id)))
}

#[derive(Deserialize)]
struct TicketUpdate {
    status: Option<String>,
    notes: Option<String>,
    assigned_to: Option<String>,
    #[serde(default)]
    read: bool,
}

/// Support-team actions on a ticket. Fields are applied in order:
/// assignment, status (with notes), read flag.
async fn handle_update_ticket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<TicketUpdate>,
) -> Result<Json<Ticket>, AppError> {
    let status = update
        .status
        .as_deref()
        .map(|s| TicketStatus::parse(s).ok_or_else(|| bad_request(format!("unknown ticket status: {}", s))))
        .transpose()?;

    let missing = || not_found(format!("ticket not found: {}", id));
    let mut ticket = state.tickets.get(&id).ok_or_else(missing)?;

    if let Some(agent) = update.assigned_to.as_deref() {
        ticket = state.tickets.assign(&id, agent).ok_or_else(missing)?;
    }
    if status.is_some() || update.notes.is_some() {
        let status = status.unwrap_or(ticket.status);
        ticket = state
            .tickets
            .update_status(&id, status, update.notes.as_deref())
            .ok_or_else(missing)?;
    }
    if update.read {
        ticket = state.tickets.mark_read(&id).ok_or_else(missing)?;
    }

    Ok(Json(ticket))
}
