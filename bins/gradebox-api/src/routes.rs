use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::sessions;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/status", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/sessions", post(sessions::create_session))
        .route(
            "/sessions/:id",
            get(sessions::get_session).delete(sessions::delete_session),
        )
        .route("/sessions/:id/input", post(sessions::supply_input))
        .route("/grade", post(handlers::submit_grade))
        .route("/grade/:run_id", get(handlers::get_grade))
        .route("/grade/:run_id/cancel", post(handlers::cancel_grade))
        .route("/progress/:exercise_id", get(handlers::get_progress))
}
