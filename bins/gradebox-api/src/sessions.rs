// Interactive session handlers
//
// Sessions live only in this process; a restart discards them. A background
// sweep drops sessions nobody has touched for a while.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use gradebox_engine::{SessionError, SessionManager, SessionState};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::handlers::error_response;
use crate::metrics;
use crate::AppState;

/// Finished sessions stay readable this long after their last output
pub const FINISHED_SESSION_TTL: Duration = Duration::from_secs(10 * 60);
/// Idle or input-waiting sessions are dropped after this much silence
pub const ABANDONED_SESSION_TTL: Duration = Duration::from_secs(30 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub type SessionMap = RwLock<HashMap<Uuid, Arc<SessionManager>>>;

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub header: String,
    pub body: String,
    #[serde(default)]
    pub footer: String,
}

#[derive(Debug, Deserialize)]
pub struct InputRequest {
    pub text: String,
}

fn record_state(state: SessionState) {
    let label = serde_json::to_value(state)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());
    metrics::SESSION_TRANSITIONS.with_label_values(&[label.as_str()]).inc();
}

pub fn status_for(error: &SessionError) -> StatusCode {
    match error {
        SessionError::NotWaitingForInput(_) | SessionError::Terminal(_) => StatusCode::CONFLICT,
    }
}

/// Running sessions are never evicted; their call is still in flight
pub fn should_evict(state: SessionState, idle: Duration) -> bool {
    match state {
        SessionState::Running => false,
        state if state.is_terminal() => idle >= FINISHED_SESSION_TTL,
        _ => idle >= ABANDONED_SESSION_TTL,
    }
}

/// Drop stale sessions, returning how many went
pub async fn evict_stale(sessions: &SessionMap) -> usize {
    let mut sessions = sessions.write().await;
    let before = sessions.len();
    sessions.retain(|id, session| {
        let state = session.state();
        if should_evict(state, session.idle_for()) {
            debug!(session_id = %id, state = ?state, "Evicting stale session");
            session.reset();
            false
        } else {
            true
        }
    });

    let evicted = before - sessions.len();
    if evicted > 0 {
        metrics::ACTIVE_SESSIONS.sub(evicted as i64);
        info!(evicted, remaining = sessions.len(), "Stale sessions evicted");
    }
    evicted
}

pub async fn sweep_sessions(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        evict_stale(&state.sessions).await;
    }
}

async fn lookup(state: &AppState, id: &str) -> Result<Arc<SessionManager>, Response> {
    let id = Uuid::parse_str(id).map_err(|_| error_response(StatusCode::BAD_REQUEST, "Invalid session ID format"))?;
    state
        .sessions
        .read()
        .await
        .get(&id)
        .cloned()
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "Unknown session"))
}

/// POST /sessions - Create a session and run it until it blocks or ends
pub async fn create_session(State(state): State<Arc<AppState>>, Json(payload): Json<RunRequest>) -> Response {
    let session = Arc::new(
        SessionManager::new(state.interpreter.clone()).with_retry_delay(state.config.interpreter_retry_delay()),
    );
    let id = session.id();

    state.sessions.write().await.insert(id, session.clone());
    metrics::SESSIONS_STARTED.inc();
    metrics::ACTIVE_SESSIONS.inc();

    let outcome = session.run(&payload.header, &payload.body, &payload.footer).await;
    record_state(outcome);
    info!(session_id = %id, state = ?outcome, "Session run finished");

    (StatusCode::CREATED, Json(session.snapshot())).into_response()
}

/// GET /sessions/{id}
pub async fn get_session(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match lookup(&state, &id).await {
        Ok(session) => (StatusCode::OK, Json(session.snapshot())).into_response(),
        Err(response) => response,
    }
}

/// POST /sessions/{id}/input - Resume a session waiting for input
pub async fn supply_input(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<InputRequest>,
) -> Response {
    let session = match lookup(&state, &id).await {
        Ok(session) => session,
        Err(response) => return response,
    };

    match session.supply_input(&payload.text).await {
        Ok(outcome) => {
            record_state(outcome);
            (StatusCode::OK, Json(session.snapshot())).into_response()
        }
        Err(e) => {
            warn!(session_id = %id, error = %e, "Input rejected");
            error_response(status_for(&e), e.to_string())
        }
    }
}

/// DELETE /sessions/{id} - Reset and discard
pub async fn delete_session(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let session = match lookup(&state, &id).await {
        Ok(session) => session,
        Err(response) => return response,
    };

    session.reset();
    if state.sessions.write().await.remove(&session.id()).is_some() {
        metrics::ACTIVE_SESSIONS.dec();
    }
    info!(session_id = %id, "Session discarded");
    StatusCode::NO_CONTENT.into_response()
}
