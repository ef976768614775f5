mod config;
mod engine;
mod executor;

use anyhow::Context;
use config::LanguageConfigManager;
use engine::DockerSandbox;
use gradebox_common::config::{Config, SandboxBackend};
use gradebox_common::redis;
use gradebox_engine::{BatchHarness, HttpSandbox, Sandbox};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, instrument, warn};

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);
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

    info!("Gradebox worker booting...");

    let languages = LanguageConfigManager::load_default().map_err(|e| {
        error!("Failed to load language configurations: {}", e);
        error!("Make sure config/languages.json exists or set LANGUAGES_CONFIG");
        e
    })?;
    info!(languages = ?languages.list_languages(), "Loaded language configurations");

    let language = std::env::var("WORKER_LANGUAGE").unwrap_or_else(|_| "python".to_string());
    let language_config = languages
        .get_config(&language)
        .with_context(|| format!("available languages: {:?}", languages.list_languages()))?
        .clone();

    let sandbox: Arc<dyn Sandbox> = match config.sandbox_backend {
        SandboxBackend::Docker => {
            info!(image = %language_config.image, "Using Docker sandbox");
            let docker = DockerSandbox::new(language_config.clone())?;
            docker.ensure_image().await?;
            Arc::new(docker)
        }
        SandboxBackend::Http => {
            info!(
                url = %config.sandbox_url,
                language_id = language_config.judge0_language_id,
                "Using HTTP sandbox"
            );
            Arc::new(
                HttpSandbox::new(config.sandbox_url.clone(), language_config.judge0_language_id)
                    .with_token(config.sandbox_token.clone()),
            )
        }
    };
    let harness = BatchHarness::new(sandbox);

    let client = ::redis::Client::open(config.redis_url.as_str())?;
    let mut redis_conn = ::redis::aio::ConnectionManager::new(client).await?;
    info!(redis_url = %config.redis_url, queue = %redis::queue_name(&language), "Connected to Redis");

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
        warn!("Received shutdown signal");
    };

    tokio::select! {
        _ = worker_loop(&mut redis_conn, &language, &harness, config.result_ttl_seconds) => {},
        _ = shutdown => {},
    }

    info!("Worker shutdown complete");
    Ok(())
}

#[instrument(skip(redis_conn, harness), fields(language = %language))]
async fn worker_loop(
    redis_conn: &mut ::redis::aio::ConnectionManager,
    language: &str,
    harness: &BatchHarness,
    ttl_seconds: u64,
) {
    loop {
        // Bounded BLPOP keeps shutdown responsive
        match redis::pop_job(redis_conn, language, 5.0).await {
            Ok(Some(job)) => {
                info!(
                    run_id = %job.id,
                    exercise_id = %job.exercise_id,
                    timeout_ms = job.timeout_ms,
                    test_cases = job.test_cases.len(),
                    source_size = job.source.len(),
                    "Received job"
                );

                let start = std::time::Instant::now();
                match executor::execute_job(&job, harness, redis_conn, ttl_seconds).await {
                    Ok(report) => info!(
                        run_id = %job.id,
                        status = ?report.status,
                        score = report.summary.score,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Job finished"
                    ),
                    Err(e) => error!(run_id = %job.id, error = %e, "Job failed"),
                }
            }
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            }
        }
    }
}
