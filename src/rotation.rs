//! Per-asset rotation: discover the live window, monitor it to settlement,
//! then roll straight into the next one. Pre-discovers the successor while
//! the current market still has runway so the hand-off is seamless.

use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{
    Config, MeasurementConfig, DISCOVERY_RETRY_BASE_DELAY_SECS, MAX_DISCOVERY_RETRIES,
    ROTATION_TICK_SECS, WINDOW_SECONDS,
};
use crate::db::WriterHandle;
use crate::discovery::{slug_timestamp, window_slug, MarketDiscovery};
use crate::monitor::MarketMonitor;
use crate::rest::ClobRestClient;
use crate::status::{MonitorPhase, StatusBoard};
use crate::types::{MarketInfo, ParameterSet};

/// Lifetime totals for one asset, for the session summary.
#[derive(Debug, Default, Clone)]
pub struct RotationTotals {
    pub asset: String,
    pub markets_monitored: i64,
    pub total_attempts: i64,
    pub total_pairs: i64,
    pub total_failed: i64,
}

pub struct AssetRotation {
    asset: String,
    params_list: Vec<ParameterSet>,
    meas: MeasurementConfig,
    flags: Config,
    writer: WriterHandle,
    rest: ClobRestClient,
    discovery: MarketDiscovery,
    status: Arc<StatusBoard>,
    id_gen: Arc<AtomicI64>,
    shutdown: watch::Receiver<bool>,
    last_slug_ts: Option<i64>,
    pre_discovered: Option<MarketInfo>,
    totals: RotationTotals,
}

impl AssetRotation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        asset: String,
        params_list: Vec<ParameterSet>,
        meas: MeasurementConfig,
        flags: Config,
        writer: WriterHandle,
        rest: ClobRestClient,
        discovery: MarketDiscovery,
        status: Arc<StatusBoard>,
        id_gen: Arc<AtomicI64>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            totals: RotationTotals { asset: asset.clone(), ..Default::default() },
            asset,
            params_list,
            meas,
            flags,
            writer,
            rest,
            discovery,
            status,
            id_gen,
            shutdown,
            last_slug_ts: None,
            pre_discovered: None,
        }
    }

    pub async fn run(mut self) -> RotationTotals {
        info!(asset = %self.asset, "rotation started");

        while !*self.shutdown.borrow() {
            self.status.update_asset(&self.asset, |s| {
                s.phase = MonitorPhase::Discovering;
            });

            let market = match self.next_market().await {
                Some(m) => m,
                None => break,
            };
            self.last_slug_ts = slug_timestamp(&market.market_id);

            let summary = self.monitor_to_settlement(market).await;
            self.totals.markets_monitored += 1;
            self.totals.total_attempts += summary.total_attempts;
            self.totals.total_pairs += summary.total_pairs;
            self.totals.total_failed += summary.total_failed;

            info!(
                asset = %self.asset,
                market_id = %summary.market_id,
                cycles = summary.total_cycles_run,
                attempts = summary.total_attempts,
                pairs = summary.total_pairs,
                pair_rate = format_args!("{:.0}%", summary.pair_rate * 100.0),
                "market complete"
            );

            if !*self.shutdown.borrow() {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        info!(
            asset = %self.asset,
            markets = self.totals.markets_monitored,
            attempts = self.totals.total_attempts,
            pairs = self.totals.total_pairs,
            "rotation stopped"
        );
        self.totals
    }

    /// Run one monitor to completion, pre-discovering the successor and
    /// draining the monitor if the catalog stops listing its market.
    async fn monitor_to_settlement(&mut self, market: MarketInfo) -> crate::types::MarketSummary {
        let (drain_tx, drain_rx) = watch::channel(false);
        let monitor = MarketMonitor::new(
            market.clone(),
            self.params_list.clone(),
            self.meas.clone(),
            self.flags.clone(),
            self.writer.clone(),
            self.rest.clone(),
            Arc::clone(&self.status),
            Arc::clone(&self.id_gen),
            self.shutdown.clone(),
            drain_rx,
        );
        let mut monitor_task = tokio::spawn(monitor.run());

        let mut ticker = tokio::time::interval(Duration::from_secs(ROTATION_TICK_SECS));
        ticker.tick().await; // consume immediate first tick
        let activity_check_every =
            (self.meas.markets.discovery_poll_interval_seconds / ROTATION_TICK_SECS).max(1);
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                res = &mut monitor_task => {
                    return match res {
                        Ok(summary) => summary,
                        Err(e) => {
                            // A panicked monitor still yields an empty
                            // summary so rotation continues.
                            warn!(asset = %self.asset, "monitor task failed: {e}");
                            crate::types::MarketSummary {
                                market_id: market.market_id.clone(),
                                total_attempts: 0,
                                total_pairs: 0,
                                total_failed: 0,
                                settlement_failures: 0,
                                pair_rate: 0.0,
                                avg_time_to_pair: None,
                                median_time_to_pair: None,
                                max_concurrent_attempts: 0,
                                total_cycles_run: 0,
                                anomaly_count: 0,
                                actual_settlement_time: Utc::now(),
                            }
                        }
                    };
                }

                _ = ticker.tick() => {
                    ticks += 1;
                    self.pre_discover(&market).await;
                    if ticks % activity_check_every == 0 {
                        self.check_still_active(&market, &drain_tx).await;
                    }
                }
            }
        }
    }

    /// Pre-record the next window's market once runway drops under the
    /// configured lead, so the successor spawns the instant this one
    /// settles. At most one successor is held at a time.
    async fn pre_discover(&mut self, current: &MarketInfo) {
        if self.pre_discovered.is_some() {
            return;
        }
        let remaining = current.time_remaining_secs(Utc::now());
        if remaining > self.meas.markets.pre_discovery_lead_seconds {
            return;
        }
        let Some(ts) = self.last_slug_ts else { return };

        let slug = window_slug(&self.asset, &self.meas.markets.market_type, ts + WINDOW_SECONDS);
        match self.discovery.find_market_by_slug(&slug, &self.asset).await {
            Ok(Some(next)) => {
                info!(asset = %self.asset, market_id = %next.market_id, "pre-discovered successor");
                self.pre_discovered = Some(next);
            }
            Ok(None) => {}
            Err(e) => warn!(asset = %self.asset, "pre-discovery failed: {e}"),
        }
    }

    /// If the catalog now reports a different live window for this asset,
    /// the monitored market was delisted early: drain the monitor so it
    /// settles normally.
    async fn check_still_active(&mut self, current: &MarketInfo, drain_tx: &watch::Sender<bool>) {
        let live = match self
            .discovery
            .find_active_market(&self.asset, &self.meas.markets.market_type)
            .await
        {
            Ok(live) => live,
            Err(e) => {
                warn!(asset = %self.asset, "activity check failed: {e}");
                return;
            }
        };

        if let Some(live) = live {
            let now = Utc::now();
            let live_is_now = live.active
                && live.settlement_time > now
                && live.settlement_time <= current.settlement_time;
            if live.market_id != current.market_id && live_is_now {
                warn!(
                    asset = %self.asset,
                    monitored = %current.market_id,
                    live = %live.market_id,
                    "monitored market no longer active, draining"
                );
                let _ = drain_tx.send(true);
            }
        }
    }

    /// The pre-discovered successor if it is still ahead of us, otherwise
    /// discovery with retry/backoff (interruptible by shutdown).
    async fn next_market(&mut self) -> Option<MarketInfo> {
        if let Some(next) = self.pre_discovered.take() {
            if next.time_remaining_secs(Utc::now()) > 0 {
                return Some(next);
            }
        }

        for attempt in 0..MAX_DISCOVERY_RETRIES {
            if *self.shutdown.borrow() {
                return None;
            }

            match self.discover_once().await {
                Some(market) => return Some(market),
                None => {
                    let delay = DISCOVERY_RETRY_BASE_DELAY_SECS + u64::from(attempt).min(3);
                    info!(
                        asset = %self.asset,
                        attempt = attempt + 1,
                        max = MAX_DISCOVERY_RETRIES,
                        "no market found, retrying in {delay}s"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
                        _ = self.shutdown.changed() => return None,
                    }
                }
            }
        }

        warn!(asset = %self.asset, "gave up discovering after {MAX_DISCOVERY_RETRIES} retries");
        None
    }

    /// Targeted next-slug lookup first, then the general search.
    async fn discover_once(&mut self) -> Option<MarketInfo> {
        let market_type = &self.meas.markets.market_type;

        if let Some(ts) = self.last_slug_ts {
            let slug = window_slug(&self.asset, market_type, ts + WINDOW_SECONDS);
            match self.discovery.find_market_by_slug(&slug, &self.asset).await {
                Ok(Some(market)) => return Some(market),
                Ok(None) => {}
                Err(e) => warn!(asset = %self.asset, "targeted discovery failed: {e}"),
            }
        }

        match self.discovery.find_active_market(&self.asset, market_type).await {
            Ok(found) => found,
            Err(e) => {
                warn!(asset = %self.asset, "discovery failed: {e}");
                None
            }
        }
    }
}
