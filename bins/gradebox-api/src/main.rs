mod handlers;
mod language_config;
mod metrics;
mod routes;
mod sessions;

use anyhow::Context;
use axum::Router;
use gradebox_common::config::Config;
use gradebox_engine::{PythonInterpreter, SharedInterpreter};
use language_config::LanguageRegistry;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Arc;
use sessions::SessionMap;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub struct AppState {
    pub redis: ConnectionManager,
    pub config: Config,
    pub languages: LanguageRegistry,
    /// Process-wide interpreter shared by every session
    pub interpreter: SharedInterpreter,
    pub sessions: SessionMap,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(config.json_logs);

    info!("Gradebox API booting...");

    let languages = LanguageRegistry::load_default()
        .map_err(anyhow::Error::msg)
        .context("Failed to load language registry")?;
    info!(languages = ?languages.enabled_languages(), "Enabled languages");

    metrics::register().context("Failed to register metrics")?;

    let client = redis::Client::open(config.redis_url.as_str()).context("Failed to create Redis client")?;
    let redis_conn = ConnectionManager::new(client).await.context("Failed to connect to Redis")?;
    info!(redis_url = %config.redis_url, "Connected to Redis");

    let interpreter = SharedInterpreter::new(PythonInterpreter::new(
        config.interpreter_command.clone(),
        config.interpreter_timeout(),
    ));
    // Warm up in the background; sessions retry once if it is still loading
    {
        let interpreter = interpreter.clone();
        tokio::spawn(async move {
            if let Err(e) = interpreter.ensure_ready().await {
                warn!(error = %e, "Interpreter warm-up failed");
            }
        });
    }

    let addr = config.api_addr.clone();
    let state = Arc::new(AppState {
        redis: redis_conn,
        config,
        languages,
        interpreter,
        sessions: RwLock::new(HashMap::new()),
    });

    tokio::spawn(sessions::sweep_sessions(state.clone()));

    let app = Router::new().merge(routes::routes()).with_state(state);

    let listener = TcpListener::bind(&addr).await.context("Failed to bind to address")?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
