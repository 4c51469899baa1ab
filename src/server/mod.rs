//! HTTP/WebSocket surface over the orchestration core.
//!
//! Every endpoint maps 1:1 onto a state-machine transition or a store
//! query; the progress WebSocket forwards a hub subscription. The server
//! holds no session state of its own.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::errors::{KnowledgeError, SessionError, StoreError};
use crate::knowledge::KnowledgeResolver;
use crate::orchestrator::{RunnerConfig, SessionRunner};
use crate::progress::{ProgressEvent, ProgressHub};
use crate::session::machine::StateMachine;
use crate::session::store::{SessionFilter, SessionStore};
use crate::session::{Feature, SessionStatus};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: Arc<SessionStore>,
    pub machine: Arc<StateMachine>,
    pub hub: Arc<ProgressHub>,
    pub resolver: KnowledgeResolver,
    pub runner: SessionRunner,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub spec: String,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub work_item: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Deserialize)]
pub struct ListSessionsQuery {
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct KnowledgeQuery {
    #[serde(default)]
    pub annotated: bool,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    Conflict(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::InvalidTransition { .. } => ApiError::Conflict(err.to_string()),
            SessionError::Store(store) => store.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<KnowledgeError> for ApiError {
    fn from(err: KnowledgeError) -> Self {
        match err {
            KnowledgeError::SnippetNotFound { .. } => ApiError::NotFound(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/start", post(start_session))
        .route("/api/sessions/{id}/pause", post(pause_session))
        .route("/api/sessions/{id}/resume", post(resume_session))
        .route("/api/sessions/{id}/stop", post(stop_session))
        .route("/api/sessions/{id}/events", get(session_events))
        .route("/api/knowledge", get(knowledge_view))
        .route("/api/knowledge/{name}", get(knowledge_lookup))
        .route("/health", get(health_check))
}

/// Assemble the full application state from config.
pub fn build_state(config: &Config, agent: Arc<dyn crate::agent::CodingAgent>) -> anyhow::Result<SharedState> {
    config.ensure_directories()?;
    let store = Arc::new(SessionStore::open(&config.data_dir)?);
    let hub = Arc::new(ProgressHub::new(config.server.event_buffer));
    let machine = Arc::new(StateMachine::new(Arc::clone(&store), Arc::clone(&hub)));
    let resolver = KnowledgeResolver::new(Arc::new(config.snippet_store()));
    let runner = SessionRunner::new(
        Arc::clone(&store),
        Arc::clone(&machine),
        resolver.clone(),
        agent,
        RunnerConfig {
            max_iterations: config.agent.max_iterations,
            ..Default::default()
        },
    );
    Ok(Arc::new(AppState {
        store,
        machine,
        hub,
        resolver,
        runner,
    }))
}

/// Bind and serve until shutdown.
pub async fn serve(config: Config, agent: Arc<dyn crate::agent::CodingAgent>) -> anyhow::Result<()> {
    let state = build_state(&config, agent)?;
    let app = api_router()
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("127.0.0.1:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "conductor server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ── Session handlers ──────────────────────────────────────────────────

async fn create_session(
    State(state): State<SharedState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Response, ApiError> {
    if req.spec.trim().is_empty() {
        return Err(ApiError::BadRequest("spec must not be empty".into()));
    }
    let features = req.features.into_iter().map(Feature::pending).collect();
    let session = state
        .machine
        .create(req.spec, features, req.work_item, req.branch)
        .await?;
    Ok((StatusCode::CREATED, Json(session)).into_response())
}

async fn list_sessions(
    State(state): State<SharedState>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Response, ApiError> {
    let filter = match query.status.as_deref() {
        None => SessionFilter::all(),
        Some(raw) => {
            let status: SessionStatus = raw
                .parse()
                .map_err(|e: String| ApiError::BadRequest(e))?;
            SessionFilter::with_status(status)
        }
    };
    let sessions = state.store.list(filter).await?;
    Ok(Json(sessions).into_response())
}

async fn get_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let session = state.store.get(id).await?;
    Ok(Json(session).into_response())
}

/// Spawn the orchestration task that drives this session. The claim
/// inside the runner is what prevents double-driving; this handler only
/// rejects the obvious case early.
async fn start_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let session = state.store.get(id).await?;
    if session.status != SessionStatus::Created {
        return Err(ApiError::Conflict(format!(
            "Cannot start a {} session",
            session.status
        )));
    }

    let runner = state.runner.clone();
    tokio::spawn(async move {
        match runner.drive(id).await {
            Ok(final_state) => {
                tracing::info!(id = %id, status = %final_state.status, "drive finished");
            }
            Err(err) => {
                tracing::error!(id = %id, error = %err, "drive aborted");
            }
        }
    });

    Ok((StatusCode::ACCEPTED, Json(session)).into_response())
}

async fn pause_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let session = state.machine.request_pause(id).await?;
    Ok(Json(session).into_response())
}

async fn resume_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let session = state.machine.resume(id).await?;
    Ok(Json(session).into_response())
}

async fn stop_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let session = state.machine.request_stop(id).await?;
    Ok(Json(session).into_response())
}

// ── Progress WebSocket ────────────────────────────────────────────────

async fn session_events(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    // Resolve the session first so unknown ids fail with 404 instead of
    // a dangling socket.
    state.store.get(id).await?;
    let store = Arc::clone(&state.store);
    let hub = Arc::clone(&state.hub);

    Ok(ws.on_upgrade(move |socket| async move {
        // Subscribe before re-reading the record: a transition that lands
        // after the read is then guaranteed to reach the subscription,
        // and one that landed before is caught by the terminal check.
        let subscription = hub.subscribe(id);
        match store.get(id).await {
            Ok(session) if session.status.is_terminal() => {
                // The stream is over; deliver one final snapshot so the
                // client sees the terminal state, then close.
                let mut socket = socket;
                let snapshot = ProgressEvent::snapshot(&session);
                if let Ok(json) = serde_json::to_string(&snapshot) {
                    let _ = socket.send(Message::Text(json.into())).await;
                }
                let _ = socket.send(Message::Close(None)).await;
            }
            Ok(_) => forward_events(socket, subscription).await,
            Err(err) => {
                tracing::error!(id = %id, error = %err, "session vanished during subscribe");
            }
        }
    }))
}

/// Forward hub events to the socket until the subscription ends or the
/// client disconnects.
async fn forward_events(socket: WebSocket, mut subscription: crate::progress::Subscription) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = subscription.recv() => {
                match event {
                    Some(event) => {
                        let json = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(err) => {
                                tracing::error!(error = %err, "failed to serialize progress event");
                                continue;
                            }
                        };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            return;
                        }
                    }
                    None => break,
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => return,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

// ── Knowledge handlers ────────────────────────────────────────────────

async fn knowledge_view(
    State(state): State<SharedState>,
    Query(query): Query<KnowledgeQuery>,
) -> Result<Response, ApiError> {
    if query.annotated {
        let layers = state.resolver.resolve_annotated()?;
        Ok(Json(layers).into_response())
    } else {
        let resolved = state.resolver.resolve()?;
        Ok(Json(resolved).into_response())
    }
}

async fn knowledge_lookup(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    match state.resolver.lookup(&name)? {
        Some(snippet) => Ok(Json(snippet).into_response()),
        None => Err(ApiError::NotFound(format!("Snippet '{}' not found", name))),
    }
}

async fn health_check() -> &'static str {
    "ok"
}

// ── Tests ─────────────────────────────────────────────────────────────
