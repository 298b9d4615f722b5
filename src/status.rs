//! Shared runtime status: per-asset monitor state, anomaly ring, writer
//! queue depth. Written by monitors and the writer, read by the periodic
//! status logger and the HTTP surface. Nothing here sits on the data path.

use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::config::STATUS_INTERVAL_SECS;

const ANOMALY_RING_CAP: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorPhase {
    Discovering,
    Starting,
    Active,
    Draining,
    Settled,
}

impl std::fmt::Display for MonitorPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MonitorPhase::Discovering => "discovering",
            MonitorPhase::Starting => "starting",
            MonitorPhase::Active => "active",
            MonitorPhase::Draining => "draining",
            MonitorPhase::Settled => "settled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AssetStatus {
    pub phase: MonitorPhase,
    pub market_id: Option<String>,
    pub cycle: i64,
    pub planned_cycles: i64,
    pub time_remaining_secs: i64,
    pub active_attempts: i64,
    pub total_attempts: i64,
    pub total_pairs: i64,
    pub markets_monitored: i64,
    pub stream_connected: bool,
}

impl Default for AssetStatus {
    fn default() -> Self {
        Self {
            phase: MonitorPhase::Discovering,
            market_id: None,
            cycle: 0,
            planned_cycles: 0,
            time_remaining_secs: 0,
            active_attempts: 0,
            total_attempts: 0,
            total_pairs: 0,
            markets_monitored: 0,
            stream_connected: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnomalyNote {
    pub at: DateTime<Utc>,
    pub asset: String,
    pub detail: String,
}

#[derive(Default)]
pub struct StatusBoard {
    assets: DashMap<String, AssetStatus>,
    anomalies: Mutex<VecDeque<AnomalyNote>>,
    pub write_queue_depth: Arc<AtomicU64>,
}

impl StatusBoard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn update_asset(&self, asset: &str, apply: impl FnOnce(&mut AssetStatus)) {
        let mut entry = self.assets.entry(asset.to_string()).or_default();
        apply(&mut entry);
    }

    pub fn record_anomaly(&self, asset: &str, detail: impl Into<String>) {
        let mut ring = self.anomalies.lock().unwrap();
        if ring.len() >= ANOMALY_RING_CAP {
            ring.pop_front();
        }
        ring.push_back(AnomalyNote {
            at: Utc::now(),
            asset: asset.to_string(),
            detail: detail.into(),
        });
    }

    pub fn asset_statuses(&self) -> Vec<(String, AssetStatus)> {
        let mut out: Vec<_> = self
            .assets
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn recent_anomalies(&self) -> Vec<AnomalyNote> {
        self.anomalies.lock().unwrap().iter().cloned().collect()
    }

    fn status_line(asset: &str, s: &AssetStatus) -> String {
        let tag = asset.to_uppercase();
        match s.phase {
            MonitorPhase::Active | MonitorPhase::Draining => {
                let mins = s.time_remaining_secs / 60;
                let secs = s.time_remaining_secs % 60;
                let pct = s.total_pairs as f64 / s.total_attempts.max(1) as f64 * 100.0;
                format!(
                    "{tag}: {} | {mins}m {secs:02}s left | cycle {}/{} | attempts: {} | pairs: {} ({pct:.0}%)",
                    s.market_id.as_deref().unwrap_or("?"),
                    s.cycle,
                    s.planned_cycles,
                    s.total_attempts,
                    s.total_pairs,
                )
            }
            phase => format!("{tag}: {phase}"),
        }
    }
}

/// Logs one status line per asset on a fixed cadence until shutdown.
pub async fn run_status_logger(board: Arc<StatusBoard>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(STATUS_INTERVAL_SECS));
    ticker.tick().await; // consume immediate first tick

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for (asset, status) in board.asset_statuses() {
                    info!("[STATUS] {}", StatusBoard::status_line(&asset, &status));
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anomaly_ring_is_bounded() {
        let board = StatusBoard::new();
        for i in 0..60 {
            board.record_anomaly("btc", format!("anomaly {i}"));
        }
        let notes = board.recent_anomalies();
        assert_eq!(notes.len(), ANOMALY_RING_CAP);
        assert_eq!(notes.last().unwrap().detail, "anomaly 59");
        assert_eq!(notes.first().unwrap().detail, "anomaly 10");
    }

    #[test]
    fn status_line_shows_progress_when_active() {
        let board = StatusBoard::new();
        board.update_asset("btc", |s| {
            s.phase = MonitorPhase::Active;
            s.market_id = Some("btc-updown-15m-1770356700".to_string());
            s.cycle = 12;
            s.planned_cycles = 90;
            s.time_remaining_secs = 754;
            s.total_attempts = 4;
            s.total_pairs = 2;
        });
        let (asset, status) = &board.asset_statuses()[0];
        let line = StatusBoard::status_line(asset, status);
        assert!(line.contains("BTC"));
        assert!(line.contains("cycle 12/90"));
        assert!(line.contains("pairs: 2 (50%)"));
    }
}
