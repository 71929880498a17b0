//! # chat-viewer
//!
//! Read-only admin viewer for chat transcripts stored in a remote table.
//!
//! This server provides:
//! - Session list built from the store, kept current by a change feed
//! - Transcript lookup for the selected session
//! - Real-time SSE streaming of list and transcript updates
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────────┐
//! │  Frontend   │────▶│  Axum HTTP   │────▶│  REST store     │
//! │             │     │  Server      │     │  (chat_sessions)│
//! └─────────────┘     └──────────────┘     └─────────────────┘
//!       ▲                   │                      │
//!       │ SSE               ▼                      │ poll / webhook
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────────┐
//! │  Real-time  │◀────│    Viewer    │◀────│  Change queue   │
//! │  Updates    │     │  (viewer.rs) │     │  (changes.rs)   │
//! └─────────────┘     └──────────────┘     └─────────────────┘
//! ```
//!
//! ## API Endpoints
//!
//! - `GET /health` - Server health check
//! - `GET /api/stream` - SSE event stream
//! - `GET /api/sessions?q=` - Session list and current transcript
//! - `POST /api/sessions/reload` - Re-run the bulk load
//! - `POST /api/sessions/{id}/select` - Select a session and load its transcript
//! - `POST /api/changes` - Push a change event (database webhook)

mod changes;
mod config;
mod postgrest;
mod registry;
mod store;
mod transcript;
mod viewer;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{sse::{Event, KeepAlive, Sse}, Json},
    routing::{get, post},
    Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::changes::PollingFeed;
use crate::config::Config;
use crate::postgrest::PostgrestStore;
use crate::store::{ChangeEvent, SessionRow, SessionStore};
use crate::viewer::{SessionItem, TranscriptView, ViewState, Viewer};

// ============================================================================
// SSE Event Types
// ============================================================================

/// Server-Sent Events that are broadcast to connected clients.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum SseEvent {
    #[serde(rename = "heartbeat")]
    Heartbeat { timestamp: u64 },
    #[serde(rename = "status")]
    Status { status: String, details: Option<String> },
    #[serde(rename = "sessions")]
    Sessions { sessions: Vec<SessionItem> },
    #[serde(rename = "transcript")]
    Transcript {
        #[serde(rename = "selectedSessionId")]
        selected_session_id: Option<String>,
        transcript: Option<TranscriptView>,
    },
}

impl SseEvent {
    fn name(&self) -> &'static str {
        match self {
            SseEvent::Heartbeat { .. } => "heartbeat",
            SseEvent::Status { .. } => "status",
            SseEvent::Sessions { .. } => "sessions",
            SseEvent::Transcript { .. } => "transcript",
        }
    }

    fn into_sse(self, seq: u64) -> Event {
        let event = Event::default().event(self.name()).id(seq.to_string());
        match serde_json::to_string(&self) {
            Ok(data) => event.data(data),
            Err(e) => {
                tracing::error!("Failed to serialize SSE event: {}", e);
                event.data("{}")
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ============================================================================
// App State - Shared state across all request handlers
// ============================================================================

struct AppState {
    start_time: Instant,                           // Server start time for uptime tracking
    event_tx: broadcast::Sender<(u64, SseEvent)>,  // SSE broadcast channel
    seq: std::sync::atomic::AtomicU64,             // Monotonic event sequence number
    store: Arc<dyn SessionStore>,                  // Remote session table
    viewer: Arc<RwLock<Viewer>>,                   // Session list, selection, transcript
    change_tx: mpsc::Sender<ChangeEvent>,          // Change queue (webhook producer side)
}

impl AppState {
    /// Get next sequence number for SSE events (ensures ordering)
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    /// Broadcast an event to all connected SSE clients
    fn broadcast(&self, event: SseEvent) {
        let seq = self.next_seq();
        let _ = self.event_tx.send((seq, event));  // Ignore error if no subscribers
    }

    fn broadcast_sessions(&self, viewer: &Viewer) {
        self.broadcast(SseEvent::Sessions {
            sessions: viewer.snapshot(None).sessions,
        });
    }

    fn broadcast_transcript(&self, viewer: &Viewer) {
        let state = viewer.snapshot(None);
        self.broadcast(SseEvent::Transcript {
            selected_session_id: state.selected_session_id,
            transcript: state.transcript,
        });
    }

    /// Bulk load into the viewer. Returns the rows on success so the change
    /// feed can start after them.
    async fn load_sessions(&self) -> Vec<SessionRow> {
        let ticket = self.viewer.write().await.begin_load();
        let result = self.store.fetch_sessions().await;
        let rows = result.as_ref().ok().cloned().unwrap_or_default();

        let mut viewer = self.viewer.write().await;
        if viewer.finish_load(ticket, result) {
            self.broadcast_sessions(&viewer);
        }
        rows
    }
}

// ============================================================================
// Health Endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    version: &'static str,
    sessions: usize,
    selected_session: Option<String>,
    transcript_turns: Option<usize>,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let viewer = state.viewer.read().await;
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION"),
        sessions: viewer.registry().count(),
        selected_session: viewer.selected().map(str::to_string),
        transcript_turns: viewer.active().map(|a| a.turns.len()),
    })
}

// ============================================================================
// SSE Stream Endpoint
// ============================================================================

/// Live updates only. Reconnecting clients re-read `GET /api/sessions`
/// rather than replaying missed events.
async fn stream_events(State(state): State<Arc<AppState>>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();

    // Create heartbeat stream
    let heartbeat_state = state.clone();
    let heartbeat = stream::unfold((), move |()| {
        let s = heartbeat_state.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            let seq = s.next_seq();
            let event = SseEvent::Heartbeat { timestamp: unix_now() };
            Some((Ok(event.into_sse(seq)), ()))
        }
    });

    // Create broadcast event stream
    let broadcast_stream = stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok((seq, event)) => return Some((Ok(event.into_sse(seq)), rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("SSE client lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    // Send initial connection event
    let init_seq = state.next_seq();
    let init_event = stream::once(async move {
        let event = SseEvent::Status {
            status: "connected".to_string(),
            details: Some(format!("seq: {}", init_seq)),
        };
        Ok(event.into_sse(init_seq))
    });

    let merged = init_event.chain(
        tokio_stream::StreamExt::merge(heartbeat, broadcast_stream)
    );

    Sse::new(merged).keep_alive(KeepAlive::default())
}

// ============================================================================
// Session Endpoints
// ============================================================================

#[derive(Deserialize, Default)]
struct SessionsQuery {
    #[serde(default)]
    q: Option<String>,
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionsQuery>,
) -> Json<ViewState> {
    let viewer = state.viewer.read().await;
    Json(viewer.snapshot(query.q.as_deref()))
}

async fn reload_sessions(State(state): State<Arc<AppState>>) -> Json<ViewState> {
    state.load_sessions().await;
    Json(state.viewer.read().await.snapshot(None))
}

async fn select_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<ViewState> {
    let ticket = {
        let mut viewer = state.viewer.write().await;
        let ticket = viewer.begin_select(&session_id);
        if ticket.is_some() {
            state.broadcast_sessions(&viewer);
            state.broadcast_transcript(&viewer);
        }
        ticket
    };

    // Lock is released while the store call is in flight
    if let Some(ticket) = ticket {
        let result = state.store.fetch_session(&ticket.session_id).await;
        let mut viewer = state.viewer.write().await;
        if viewer.finish_select(ticket, result) {
            state.broadcast_sessions(&viewer);
            state.broadcast_transcript(&viewer);
        }
    }

    Json(state.viewer.read().await.snapshot(None))
}

// ============================================================================
// Change Webhook
// ============================================================================

async fn push_change(
    State(state): State<Arc<AppState>>,
    Json(event): Json<ChangeEvent>,
) -> StatusCode {
    if event.row().is_none() {
        return StatusCode::NO_CONTENT;
    }
    match state.change_tx.send(event).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => {
            tracing::error!("Change queue closed, dropping pushed event");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("chat_viewer=info,tower_http=info")))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let store: Arc<dyn SessionStore> = match PostgrestStore::from_config(&config) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!("Failed to create store client: {}", e);
            std::process::exit(1);
        }
    };

    let (event_tx, _) = broadcast::channel::<(u64, SseEvent)>(100);
    let (change_tx, change_rx) = mpsc::channel::<ChangeEvent>(changes::QUEUE_CAPACITY);

    let state = Arc::new(AppState {
        start_time: Instant::now(),
        event_tx,
        seq: std::sync::atomic::AtomicU64::new(1),
        store: store.clone(),
        viewer: Arc::new(RwLock::new(Viewer::new())),
        change_tx: change_tx.clone(),
    });

    // Initial bulk load, then follow changes from where it left off
    tracing::info!("Loading sessions from {}", config.store_url);
    let rows = state.load_sessions().await;
    let feed = PollingFeed::after(&rows);

    let poll_store = store.clone();
    let poll_interval = config.poll_interval;
    tokio::spawn(async move {
        changes::start_polling(poll_store, feed, change_tx, poll_interval).await;
    });

    // Single consumer for the change queue
    let consumer_state = state.clone();
    let consumer_viewer = state.viewer.clone();
    tokio::spawn(async move {
        changes::consume(change_rx, consumer_viewer, move |viewer, list_changed, transcript_changed| {
            if list_changed {
                consumer_state.broadcast_sessions(viewer);
            }
            if transcript_changed {
                consumer_state.broadcast_transcript(viewer);
            }
        })
        .await;
    });

    // Build router
    let app = Router::new()
        // Health
        .route("/health", get(health))
        // SSE
        .route("/api/stream", get(stream_events))
        // Sessions
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/reload", post(reload_sessions))
        .route("/api/sessions/{session_id}/select", post(select_session))
        // Change webhook
        .route("/api/changes", post(push_change))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("chat-viewer v{} listening on {}", env!("CARGO_PKG_VERSION"), addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use serde_json::{json, Value};

    fn row(id: &str, messages: Value, updated_at: &str) -> SessionRow {
        SessionRow {
            session_id: id.to_string(),
            messages,
            updated_at: updated_at.to_string(),
        }
    }

    fn test_state(store: Arc<MemoryStore>) -> (Arc<AppState>, mpsc::Receiver<ChangeEvent>) {
        let (event_tx, _) = broadcast::channel(16);
        let (change_tx, change_rx) = mpsc::channel(changes::QUEUE_CAPACITY);
        let state = Arc::new(AppState {
            start_time: Instant::now(),
            event_tx,
            seq: std::sync::atomic::AtomicU64::new(1),
            store,
            viewer: Arc::new(RwLock::new(Viewer::new())),
            change_tx,
        });
        (state, change_rx)
    }

    #[tokio::test]
    async fn test_push_change_without_session_id() {
        let (state, mut rx) = test_state(Arc::new(MemoryStore::new(vec![])));
        let event: ChangeEvent = serde_json::from_value(json!({"new": {"messages": "user:-hi"}})).unwrap();

        let status = push_change(State(state), Json(event)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_push_change_is_queued() {
        let (state, mut rx) = test_state(Arc::new(MemoryStore::new(vec![])));
        let event = ChangeEvent::upsert(row("a", json!("user:-hi"), "2025-01-01T00:00:00Z"));

        let status = push_change(State(state), Json(event.clone())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(rx.try_recv().unwrap(), event);
    }

    #[tokio::test]
    async fn test_push_change_after_queue_closed() {
        let (state, rx) = test_state(Arc::new(MemoryStore::new(vec![])));
        drop(rx);
        let event = ChangeEvent::upsert(row("a", json!([]), "2025-01-01T00:00:00Z"));

        let status = push_change(State(state), Json(event)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_select_session_returns_transcript() {
        let store = MemoryStore::new(vec![
            row("a", json!("user:-hi\nbot:-hello"), "2025-01-02T00:00:00Z"),
            row("b", json!([]), "2025-01-01T00:00:00Z"),
        ]);
        store.set_origin("a", json!("192.0.2.7"));
        let (state, _rx) = test_state(Arc::new(store));
        state.load_sessions().await;
        let mut events = state.event_tx.subscribe();

        let Json(view) = select_session(State(state.clone()), Path("a".to_string())).await;
        assert_eq!(view.selected_session_id.as_deref(), Some("a"));
        assert!(!view.is_loading_transcript);
        let transcript = view.transcript.unwrap();
        assert_eq!(transcript.session_id, "a");
        assert_eq!(transcript.turns.len(), 2);
        assert_eq!(transcript.origin.as_deref(), Some("192.0.2.7"));
        assert!(view.sessions[0].is_selected);

        // begin and finish each broadcast the list and the transcript
        let mut names = Vec::new();
        while let Ok((_, event)) = events.try_recv() {
            names.push(event.name());
        }
        assert_eq!(names, vec!["sessions", "transcript", "sessions", "transcript"]);
    }

    #[tokio::test]
    async fn test_select_missing_session() {
        let (state, _rx) = test_state(Arc::new(MemoryStore::new(vec![])));
        let Json(view) = select_session(State(state), Path("gone".to_string())).await;
        assert_eq!(view.selected_session_id.as_deref(), Some("gone"));
        assert!(!view.is_loading_transcript);
        assert!(view.transcript.is_none());
    }

    #[tokio::test]
    async fn test_reload_and_filter_sessions() {
        let store = Arc::new(MemoryStore::new(vec![row("a", json!("user:-hello"), "2025-01-01T00:00:00Z")]));
        let (state, _rx) = test_state(store.clone());

        let Json(view) = reload_sessions(State(state.clone())).await;
        assert_eq!(view.sessions.len(), 1);

        store.put(row("b", json!("user:-bye"), "2025-01-02T00:00:00Z"));
        let Json(view) = reload_sessions(State(state.clone())).await;
        assert_eq!(view.sessions[0].summary.id, "b");

        let Json(view) = list_sessions(
            State(state),
            Query(SessionsQuery {
                q: Some("HELLO".to_string()),
            }),
        )
        .await;
        assert_eq!(view.sessions.len(), 1);
        assert_eq!(view.sessions[0].summary.id, "a");
    }
}
