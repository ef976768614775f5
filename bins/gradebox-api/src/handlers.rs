// HTTP route handlers for batch grading, health and metrics

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use gradebox_common::config::{clamp_test_timeout, Config};
use gradebox_common::redis;
use gradebox_common::types::{default_language, GradeJob, TestCase};
use gradebox_engine::sandbox::{MAX_SOURCE_CODE_BYTES, MAX_TEST_INPUT_BYTES};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::language_config::LanguageRegistry;
use crate::metrics;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct GradeRequest {
    pub exercise_id: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub header: String,
    pub source: String,
    #[serde(default)]
    pub footer: String,
    pub test_cases: Vec<TestCase>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GradeAccepted {
    pub run_id: Uuid,
}

pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Validate a request and turn it into a queued job
pub fn build_job(
    payload: GradeRequest,
    config: &Config,
    languages: &LanguageRegistry,
) -> Result<GradeJob, (StatusCode, String)> {
    if !languages.is_enabled(&payload.language) {
        return Err((
            StatusCode::BAD_REQUEST,
            format!(
                "Language '{}' is not enabled (available: {:?})",
                payload.language,
                languages.enabled_languages()
            ),
        ));
    }
    if payload.exercise_id.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "exercise_id must not be empty".to_string()));
    }
    if payload.test_cases.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "At least one test case is required".to_string()));
    }

    let source_size = payload.header.len() + payload.source.len() + payload.footer.len();
    if source_size > MAX_SOURCE_CODE_BYTES {
        return Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("Source code exceeds maximum size of {} bytes", MAX_SOURCE_CODE_BYTES),
        ));
    }
    if payload.test_cases.iter().any(|c| c.input.len() > MAX_TEST_INPUT_BYTES) {
        return Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("Test input exceeds maximum size of {} bytes", MAX_TEST_INPUT_BYTES),
        ));
    }

    Ok(GradeJob {
        id: Uuid::new_v4(),
        exercise_id: payload.exercise_id,
        language: payload.language.to_lowercase(),
        header: payload.header,
        source: payload.source,
        footer: payload.footer,
        test_cases: payload.test_cases,
        timeout_ms: clamp_test_timeout(payload.timeout_ms.unwrap_or(config.per_test_timeout_ms)),
        submitted_at: Utc::now(),
    })
}

/// GET /status - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus text format
pub async fn metrics_handler() -> Response {
    match metrics::render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// POST /grade - Queue a batch grading run
pub async fn submit_grade(State(state): State<Arc<AppState>>, Json(payload): Json<GradeRequest>) -> Response {
    let job = match build_job(payload, &state.config, &state.languages) {
        Ok(job) => job,
        Err((status, message)) => return error_response(status, message),
    };

    let mut conn = state.redis.clone();
    match redis::push_job(&mut conn, &job, state.config.result_ttl_seconds).await {
        Ok(()) => {
            info!(
                run_id = %job.id,
                exercise_id = %job.exercise_id,
                language = %job.language,
                test_cases = job.test_cases.len(),
                timeout_ms = job.timeout_ms,
                "Grade run queued"
            );
            metrics::GRADE_RUNS_SUBMITTED.with_label_values(&[job.language.as_str()]).inc();
            (StatusCode::CREATED, Json(GradeAccepted { run_id: job.id })).into_response()
        }
        Err(e) => {
            error!(run_id = %job.id, error = %e, "Failed to queue grade run");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to queue run: {}", e))
        }
    }
}

fn parse_run_id(run_id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(run_id).map_err(|_| error_response(StatusCode::BAD_REQUEST, "Invalid run ID format"))
}

/// GET /grade/{run_id} - Final report, or partial progress while running
pub async fn get_grade(State(state): State<Arc<AppState>>, Path(run_id): Path<String>) -> Response {
    let run_uuid = match parse_run_id(&run_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    let mut conn = state.redis.clone();
    match redis::get_report(&mut conn, &run_uuid).await {
        Ok(Some(report)) => {
            info!(run_id = %run_id, status = ?report.status, "Report retrieved");
            return (StatusCode::OK, Json(report.redacted())).into_response();
        }
        Ok(None) => {}
        Err(e) => {
            error!(run_id = %run_id, error = %e, "Failed to fetch report");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to query run: {}", e));
        }
    }

    let run_state = match redis::get_state(&mut conn, &run_uuid).await {
        Ok(Some(run_state)) => run_state,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Unknown run"),
        Err(e) => {
            error!(run_id = %run_id, error = %e, "Failed to fetch run state");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to query run: {}", e));
        }
    };

    let partial = match redis::get_partial(&mut conn, &run_uuid).await {
        Ok(results) => results,
        Err(e) => {
            error!(run_id = %run_id, error = %e, "Failed to fetch partial results");
            Vec::new()
        }
    };
    let results: Vec<_> = partial.iter().map(|r| r.redacted()).collect();

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "run_id": run_uuid,
            "status": run_state.status,
            "current": run_state.current,
            "total": run_state.total,
            "results": results,
        })),
    )
        .into_response()
}

/// POST /grade/{run_id}/cancel - Ask the worker to stop the run
pub async fn cancel_grade(State(state): State<Arc<AppState>>, Path(run_id): Path<String>) -> Response {
    let run_uuid = match parse_run_id(&run_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    let mut conn = state.redis.clone();
    match redis::request_cancel(&mut conn, &run_uuid, state.config.result_ttl_seconds).await {
        Ok(()) => {
            info!(run_id = %run_id, "Cancellation requested");
            metrics::GRADE_RUNS_CANCELLED.inc();
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "run_id": run_uuid, "status": "cancelling" })),
            )
                .into_response()
        }
        Err(e) => {
            error!(run_id = %run_id, error = %e, "Failed to request cancellation");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to cancel run: {}", e))
        }
    }
}

/// GET /progress/{exercise_id} - Stored progress tuple for an exercise
pub async fn get_progress(State(state): State<Arc<AppState>>, Path(exercise_id): Path<String>) -> Response {
    let mut conn = state.redis.clone();
    match redis::get_progress(&mut conn, &exercise_id).await {
        Ok(progress) => (StatusCode::OK, Json(progress.unwrap_or_default())).into_response(),
        Err(e) => {
            error!(exercise_id = %exercise_id, error = %e, "Failed to fetch progress");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to query progress: {}", e))
        }
    }
}
