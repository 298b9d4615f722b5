mod api;
mod config;
mod db;
mod discovery;
mod error;
mod evaluator;
mod mirror;
mod monitor;
mod points;
mod rest;
mod rotation;
mod scheduler;
mod status;
mod types;
mod ws;

use std::str::FromStr;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::{router, ApiState};
use crate::config::{Config, MeasurementConfig, CLOB_API_URL, GAMMA_API_URL};
use crate::db::{DbWriter, ParameterSetInsert, WriteCommand};
use crate::discovery::MarketDiscovery;
use crate::error::Result;
use crate::rest::ClobRestClient;
use crate::rotation::AssetRotation;
use crate::status::{run_status_logger, StatusBoard};
use crate::types::{ParameterSet, SamplingMode};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    let meas = MeasurementConfig::load(&cfg.config_path)?;
    info!(
        assets = ?meas.markets.crypto_assets,
        parameter_sets = meas.parameter_sets.len(),
        sampling = %meas.sampling.mode,
        "pairscope starting"
    );

    // --- Database ---
    if let Some(parent) = std::path::Path::new(&cfg.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", cfg.db_path))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("database ready at {}", cfg.db_path);

    // Attempt and parameter-set ids are assigned in-process; seed the
    // counters from the store so restarts keep ids monotonic.
    let max_attempt_id: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(attempt_id), 0) FROM attempts")
            .fetch_one(&pool)
            .await?;
    let attempt_id_gen = Arc::new(AtomicI64::new(max_attempt_id));
    let max_ps_id: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(parameter_set_id), 0) FROM parameter_sets")
            .fetch_one(&pool)
            .await?;

    // --- Status board + durable writer ---
    let status = StatusBoard::new();
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    let writer = DbWriter::new(pool.clone(), writer_rx, Arc::clone(&status.write_queue_depth));
    let writer_task = tokio::spawn(writer.run());

    // --- Parameter sets ---
    let mut params_list: Vec<ParameterSet> = meas.parameter_sets();
    for (i, ps) in params_list.iter_mut().enumerate() {
        ps.parameter_set_id = max_ps_id + 1 + i as i64;

        let (ack_tx, ack_rx) = oneshot::channel();
        let insert = ParameterSetInsert {
            set: ps.clone(),
            sampling_mode: meas.sampling.mode,
            cycle_interval_seconds: meas.sampling.cycle_interval_seconds as i64,
            cycles_per_market: i64::from(meas.sampling.cycles_per_market),
            feed_gap_threshold_seconds: meas.quality.feed_gap_threshold_seconds as i64,
        };
        writer_tx
            .send(WriteCommand::InsertParameterSet { insert, ack: ack_tx })
            .map_err(|_| crate::error::AppError::Writer("writer unavailable".to_string()))?;
        let id = ack_rx
            .await
            .map_err(|_| crate::error::AppError::Writer("parameter set insert lost".to_string()))?;
        info!(
            name = %ps.name,
            parameter_set_id = id,
            s0 = ps.s0_points,
            delta = ps.delta_points,
            stop_loss = ?ps.stop_loss_threshold_points,
            "parameter set registered"
        );
    }
    match meas.sampling.mode {
        SamplingMode::FixedInterval => info!(
            "sampling: every {}s until settlement",
            meas.sampling.cycle_interval_seconds
        ),
        SamplingMode::FixedCount => info!(
            "sampling: {} cycles per market",
            meas.sampling.cycles_per_market
        ),
    }

    // --- REST client (shared) ---
    let rest = ClobRestClient::new(CLOB_API_URL.to_string())?;
    if rest.check_health().await {
        info!("CLOB API reachable");
    } else {
        warn!("CLOB API health check failed, continuing with stream only");
    }

    // --- Shutdown signal ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // --- Asset rotations ---
    let mut rotation_tasks = Vec::new();
    for asset in &meas.markets.crypto_assets {
        let rotation = AssetRotation::new(
            asset.clone(),
            params_list.clone(),
            meas.clone(),
            cfg.clone(),
            writer_tx.clone(),
            rest.clone(),
            MarketDiscovery::new(GAMMA_API_URL.to_string())?,
            Arc::clone(&status),
            Arc::clone(&attempt_id_gen),
            shutdown_rx.clone(),
        );
        rotation_tasks.push(tokio::spawn(rotation.run()));
    }
    info!("started {} asset rotation(s)", rotation_tasks.len());

    // --- Status logger ---
    tokio::spawn(run_status_logger(Arc::clone(&status), shutdown_rx.clone()));

    // --- HTTP API ---
    let api_state = ApiState { pool: pool.clone(), status: Arc::clone(&status) };
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, router(api_state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // --- Graceful drain: monitors → writer → store ---
    info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);

    let mut totals = Vec::new();
    for task in rotation_tasks {
        match task.await {
            Ok(t) => totals.push(t),
            Err(e) => warn!("rotation task failed during shutdown: {e}"),
        }
    }

    // Dropping the last sender lets the writer drain its queue and exit.
    drop(writer_tx);
    if let Err(e) = writer_task.await {
        warn!("writer task failed during shutdown: {e}");
    }
    pool.close().await;

    // --- Session summary ---
    let markets: i64 = totals.iter().map(|t| t.markets_monitored).sum();
    let attempts: i64 = totals.iter().map(|t| t.total_attempts).sum();
    let pairs: i64 = totals.iter().map(|t| t.total_pairs).sum();
    let failed: i64 = totals.iter().map(|t| t.total_failed).sum();
    for t in &totals {
        info!(
            "[SESSION] {}: {} markets | {} attempts | {} pairs ({:.1}%)",
            t.asset.to_uppercase(),
            t.markets_monitored,
            t.total_attempts,
            t.total_pairs,
            t.total_pairs as f64 / t.total_attempts.max(1) as f64 * 100.0,
        );
    }
    info!(
        "[SESSION] totals: {markets} markets | {attempts} attempts | {pairs} pairs | {failed} failed | pair rate {:.1}%",
        pairs as f64 / attempts.max(1) as f64 * 100.0,
    );
    info!("shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
