use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod collaborators;
mod config;
mod dbus_interface;
mod engine;
mod error;
mod orchestrator;
mod sqlite;
mod upload;

#[cfg(test)]
mod fakes;

use config::Config;
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use engine::LazyEngine;
use orchestrator::Orchestrator;
use rollcall_core::{DecisionEngine, Scorer};
use sqlite::SqliteStore;
use upload::FsUploader;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        db = %config.db_path.display(),
        media = %config.media_dir.display(),
        match_threshold = config.match_threshold,
        near_match_threshold = config.near_match_threshold,
        "configuration loaded"
    );

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::create_dir_all(&config.media_dir)
        .with_context(|| format!("creating {}", config.media_dir.display()))?;

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .await
            .context("opening attendance database")?,
    );
    let uploader = Arc::new(FsUploader::new(config.media_dir.clone()));

    // Models load on the first enroll/verify, not here.
    let engine = Arc::new(LazyEngine::onnx(
        config.model_dir.clone(),
        config.extractor_config(),
    ));

    let orchestrator = Arc::new(
        Orchestrator::new(
            engine,
            store.clone(),
            store.clone(),
            store.clone(),
            uploader,
        )
        .with_scorer(Scorer::new(config.scoring_policy()))
        .with_decision(DecisionEngine::new(config.decision_policy()))
        .with_timeouts(config.timeouts()),
    );

    let service = AttendanceService {
        orchestrator,
        store,
        model_dir: config.model_dir.clone(),
    };

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, system = config.system_bus, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
