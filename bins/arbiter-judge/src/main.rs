mod agent;
mod config;
mod error;
mod evaluator;
mod handlers;
mod launcher;
mod metrics;
mod pipeline;
mod problems;
mod routes;
mod sequencer;
mod tracker;

#[cfg(test)]
mod pipeline_tests;
#[cfg(test)]
mod testing;

use anyhow::Context;
use arbiter_common::redis::RedisStatusStore;
use arbiter_common::store::{MemoryStatusStore, StatusStore};
use axum::Router;
use config::{JudgeConfig, ProblemSourceKind, StoreKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

pub struct AppState {
    pub judge: Arc<pipeline::JudgeContext>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Arbiter judge booting...");

    let config = JudgeConfig::from_env().context("Failed to read configuration")?;

    // Connect to Redis only when something is stored there
    let needs_redis =
        config.store == StoreKind::Redis || config.problem_source == ProblemSourceKind::Redis;
    let redis_conn = if needs_redis {
        let client = redis::Client::open(config.redis.url.as_str())
            .context("Failed to create Redis client")?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        info!(url = %config.redis.url, "Connected to Redis");
        Some(conn)
    } else {
        None
    };

    let store: Arc<dyn StatusStore> = match (&config.store, &redis_conn) {
        (StoreKind::Redis, Some(conn)) => Arc::new(RedisStatusStore::new(
            conn.clone(),
            config.redis.submission_ttl_seconds,
        )),
        _ => Arc::new(MemoryStatusStore::with_ttl(Duration::from_secs(
            config.redis.submission_ttl_seconds,
        ))),
    };

    let source: Arc<dyn problems::ProblemSource> = match (&config.problem_source, &redis_conn) {
        (ProblemSourceKind::Redis, Some(conn)) => {
            info!("Loading problem definitions from Redis");
            Arc::new(problems::RedisProblemSource::new(conn.clone()))
        }
        _ => {
            let source = problems::FileProblemSource::new(config.problem_dir.clone());
            info!(dir = %source.dir().display(), "Loading problem definitions from files");
            Arc::new(source)
        }
    };

    let runtime = launcher::DockerRuntime::connect(
        config.container_memory_mb,
        config.container_cpus,
        config.container_network.clone(),
    )
    .context("Failed to connect to Docker")?;
    info!("Connected to Docker");

    let agent = agent::AgentClient::new(
        config.agent_request_timeout,
        config.agent_retry,
        config.settings.stream_limit,
    )?;

    let runner = evaluator::ProcessScriptRunner::node(
        config.evaluator_program.clone(),
        config.settings.stream_limit,
    )
    .with_startup_allowance(config.evaluator_startup_allowance);

    let judge = Arc::new(pipeline::JudgeContext {
        launcher: launcher::Launcher::new(
            Arc::new(runtime),
            config.startup_grace,
            config.agent_host.clone(),
        ),
        agent,
        evaluator: evaluator::Evaluator::new(Arc::new(runner)),
        problems: problems::ProblemCache::new(source),
        store,
        settings: config.settings.clone(),
    });

    let state = Arc::new(AppState { judge });
    let app = Router::new().merge(routes::routes()).with_state(state);

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "HTTP server listening");
    info!("Ready to accept submissions");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
