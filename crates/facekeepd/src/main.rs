use anyhow::{Context, Result};
use facekeep_core::{KvLabelStore, SqliteKv};
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod feed;

use config::Config;
use dbus_interface::{CollectorService, BUS_NAME, OBJECT_PATH};
use engine::{spawn_engine, EngineParts, EngineSettings};
use feed::{FeedSource, JsonOracle, TraceSurface};

/// How long shutdown waits for an in-flight frame grab before abandoning it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn build_runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")
}

/// Stop the runtime without waiting indefinitely on blocking tasks.
/// A grab blocked on an idle feed is left behind once the grace period ends.
fn shutdown(runtime: Runtime) {
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let runtime = build_runtime()?;
    let result = runtime.block_on(run());
    shutdown(runtime);
    result
}

async fn run() -> Result<()> {
    tracing::info!("facekeepd starting");

    let config = Config::from_env().context("loading configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        feed = %config.feed_path,
        interval_ms = config.capture_interval_ms,
        required_samples = config.required_samples,
        match_threshold = config.match_threshold,
        metric = ?config.metric,
        "configuration loaded"
    );

    let kv = SqliteKv::open(&config.db_path)
        .with_context(|| format!("opening label store {}", config.db_path.display()))?;
    let source = FeedSource::open(&config.feed_path)
        .with_context(|| format!("opening detection feed {}", config.feed_path))?;

    let engine = spawn_engine(
        EngineParts {
            source: Box::new(source),
            oracle: Box::new(JsonOracle::new(config.oracle_shape())),
            store: Box::new(KvLabelStore::new(kv)),
            surface: Box::new(TraceSurface),
        },
        EngineSettings::from(&config),
    );

    let mut recognitions = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match recognitions.recv().await {
                Ok(r) => {
                    let matches: Vec<String> = r.matches.iter().map(ToString::to_string).collect();
                    tracing::info!(frame = r.sequence, ?matches, "recognized");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "recognition log lagging");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, CollectorService::new(engine))?
        .build()
        .await
        .context("registering D-Bus service")?;

    tracing::info!(bus_name = BUS_NAME, path = OBJECT_PATH, "facekeepd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facekeepd shutting down");

    Ok(())
}
