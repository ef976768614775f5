// Prometheus metrics exposed on GET /metrics

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref SESSIONS_STARTED: IntCounter =
        IntCounter::new("gradebox_sessions_started_total", "Interactive sessions started")
            .expect("valid metric definition");
    pub static ref ACTIVE_SESSIONS: IntGauge =
        IntGauge::new("gradebox_active_sessions", "Interactive sessions currently held")
            .expect("valid metric definition");
    pub static ref SESSION_TRANSITIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("gradebox_session_transitions_total", "Session run/resume outcomes by state"),
        &["state"]
    )
    .expect("valid metric definition");
    pub static ref GRADE_RUNS_SUBMITTED: IntCounterVec = IntCounterVec::new(
        Opts::new("gradebox_grade_runs_submitted_total", "Batch grading runs queued by language"),
        &["language"]
    )
    .expect("valid metric definition");
    pub static ref GRADE_RUNS_CANCELLED: IntCounter =
        IntCounter::new("gradebox_grade_runs_cancelled_total", "Cancel requests accepted")
            .expect("valid metric definition");
}

/// Register every collector once at startup
pub fn register() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(SESSIONS_STARTED.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_SESSIONS.clone()))?;
    REGISTRY.register(Box::new(SESSION_TRANSITIONS.clone()))?;
    REGISTRY.register(Box::new(GRADE_RUNS_SUBMITTED.clone()))?;
    REGISTRY.register(Box::new(GRADE_RUNS_CANCELLED.clone()))?;
    Ok(())
}

/// Text exposition format
pub fn render() -> Result<String, String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| e.to_string())?;
    String::from_utf8(buffer).map_err(|e| e.to_string())
}
