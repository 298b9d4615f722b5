//! Market monitor: one instance per active 15-minute window.
//!
//! Owns the stream subscription, the book mirror, the cycle schedule, and
//! one evaluator per configured parameter set. Lifecycle:
//! STARTING (subscribe, wait for books) → ACTIVE (scheduled cycles) →
//! DRAINING (settlement / drain / shutdown) → SETTLED (finalize, release).

use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::config::{Config, MeasurementConfig, BOOT_TIMEOUT_SECS};
use crate::db::{WriteCommand, WriterHandle};
use crate::evaluator::TriggerEvaluator;
use crate::mirror::BookMirror;
use crate::rest::ClobRestClient;
use crate::scheduler::{CycleSchedule, CycleTicker};
use crate::status::{MonitorPhase, StatusBoard};
use crate::types::{CycleSnapshot, FailReason, MarketInfo, MarketSummary, ParameterSet};
use crate::ws::{StreamClient, StreamCommand, StreamStats};

pub struct MarketMonitor {
    market: MarketInfo,
    params_list: Vec<ParameterSet>,
    meas: MeasurementConfig,
    flags: Config,
    writer: WriterHandle,
    rest: ClobRestClient,
    status: Arc<StatusBoard>,
    shutdown: watch::Receiver<bool>,
    /// Set by the rotation loop when discovery says this market is no
    /// longer the active window for its asset.
    drain: watch::Receiver<bool>,

    evaluators: Vec<TriggerEvaluator>,
    planned_total: i64,
    cycles_run: i64,
    anomaly_count: i64,
    anomaly_flagged: bool,
    was_shutdown: bool,
}

impl MarketMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        market: MarketInfo,
        params_list: Vec<ParameterSet>,
        meas: MeasurementConfig,
        flags: Config,
        writer: WriterHandle,
        rest: ClobRestClient,
        status: Arc<StatusBoard>,
        id_gen: Arc<AtomicI64>,
        shutdown: watch::Receiver<bool>,
        drain: watch::Receiver<bool>,
    ) -> Self {
        let evaluators = params_list
            .iter()
            .map(|ps| {
                TriggerEvaluator::new(
                    ps.clone(),
                    &market,
                    meas.quality.max_reference_sum_deviation,
                    flags.enable_lifecycle,
                    Arc::clone(&id_gen),
                )
            })
            .collect();

        Self {
            market,
            params_list,
            meas,
            flags,
            writer,
            rest,
            status,
            shutdown,
            drain,
            evaluators,
            planned_total: 0,
            cycles_run: 0,
            anomaly_count: 0,
            anomaly_flagged: false,
            was_shutdown: false,
        }
    }

    /// Run the full monitoring lifecycle and return the primary summary.
    pub async fn run(mut self) -> MarketSummary {
        let start_time = Utc::now();
        let time_remaining = self.market.time_remaining_secs(start_time);

        if time_remaining <= 0 {
            warn!(market_id = %self.market.market_id, "market already settled");
            return self.evaluators[0].summary(0, 0, start_time);
        }

        info!(
            market_id = %self.market.market_id,
            time_remaining,
            settlement = %self.market.settlement_time.format("%H:%M:%S UTC"),
            "starting monitor"
        );
        if !self.market.accepting_orders {
            warn!(market_id = %self.market.market_id, "market is not accepting orders yet");
        }
        self.set_phase(MonitorPhase::Starting, time_remaining);

        // --- STARTING: spawn the stream, subscribe, wait for first books ---
        let token_ids = vec![
            self.market.yes_token_id.clone(),
            self.market.no_token_id.clone(),
        ];
        let mirror = Arc::new(BookMirror::new());
        let stats = StreamStats::new();
        let (stream_stop_tx, stream_stop_rx) = watch::channel(false);
        let (stream_cmd_tx, cmd_rx) = mpsc::channel(8);
        let stream = StreamClient::new(
            self.meas.websocket.url.clone(),
            Vec::new(),
            Arc::clone(&mirror),
            Arc::clone(&stats),
            cmd_rx,
            stream_stop_rx,
            Duration::from_secs(self.meas.websocket.heartbeat_interval_seconds),
            Duration::from_secs(self.meas.websocket.reconnect_max_delay_seconds),
        );
        let stream_task = tokio::spawn(stream.run());
        let _ = stream_cmd_tx
            .send(StreamCommand::Subscribe(token_ids.clone()))
            .await;

        self.wait_for_initial_books(&mirror).await;

        // --- Record the market row before the first cycle ---
        let schedule = CycleSchedule::from_mode(
            self.meas.sampling.mode,
            Instant::now(),
            Duration::from_secs(time_remaining as u64),
            Duration::from_secs(self.meas.sampling.cycle_interval_seconds),
            self.meas.sampling.cycles_per_market,
        );
        let mut ticker = CycleTicker::new(schedule);
        self.planned_total = schedule.planned_total;
        info!(
            market_id = %self.market.market_id,
            interval_secs = schedule.interval.as_secs(),
            planned = schedule.planned_total,
            "cycle schedule ready"
        );

        self.send(WriteCommand::UpsertMarket {
            market: self.market.clone(),
            parameter_set_id: self.params_list[0].parameter_set_id,
            start_time,
            time_remaining_at_start: time_remaining,
            cycle_interval_seconds: schedule.interval.as_secs() as i64,
        });

        // --- ACTIVE: scheduled cycles until settlement / drain / shutdown ---
        self.set_phase(MonitorPhase::Active, time_remaining);
        tokio::spawn(audit_books(
            self.rest.clone(),
            Arc::clone(&mirror),
            self.market.market_id.clone(),
            token_ids.clone(),
        ));
        self.run_cycles(&mut ticker, &mirror, &stats).await;

        // --- DRAINING → SETTLED ---
        let now = Utc::now();
        self.set_phase(MonitorPhase::Draining, self.market.time_remaining_secs(now).max(0));
        if ticker.missed() > 0 {
            self.note_anomaly(format!("{} cycle(s) missed by scheduler", ticker.missed()));
        }

        let reason = if self.was_shutdown {
            FailReason::BotShutdown
        } else {
            FailReason::SettlementReached
        };
        let summary = self.finalize(reason, &mirror).await;

        let _ = stream_cmd_tx
            .send(StreamCommand::Unsubscribe(token_ids))
            .await;
        let _ = stream_stop_tx.send(true);
        let _ = stream_task.await;

        self.set_phase(MonitorPhase::Settled, 0);
        info!(
            market_id = %self.market.market_id,
            attempts = summary.total_attempts,
            pairs = summary.total_pairs,
            cycles = summary.total_cycles_run,
            "monitor settled: {} attempts, {} pairs over {} cycles",
            summary.total_attempts,
            summary.total_pairs,
            summary.total_cycles_run,
        );
        summary
    }

    // ------------------------------------------------------------------
    // STARTING helpers
    // ------------------------------------------------------------------

    /// Block until both sides have bid+ask, the boot timeout expires (then
    /// seed from REST), or shutdown.
    async fn wait_for_initial_books(&mut self, mirror: &Arc<BookMirror>) {
        let deadline = Instant::now() + Duration::from_secs(BOOT_TIMEOUT_SECS);
        while Instant::now() < deadline {
            if mirror.both_sides_ready(&self.market.yes_token_id, &self.market.no_token_id) {
                let (yes, no) =
                    mirror.pair_top(&self.market.yes_token_id, &self.market.no_token_id);
                info!(
                    market_id = %self.market.market_id,
                    yes_bid = ?yes.bid, yes_ask = ?yes.ask,
                    no_bid = ?no.bid, no_ask = ?no.ask,
                    "initial books ready"
                );
                return;
            }
            if *self.shutdown.borrow() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        warn!(
            market_id = %self.market.market_id,
            "no books from stream after {BOOT_TIMEOUT_SECS}s, polling REST"
        );
        self.refresh_from_rest(mirror).await;
    }

    /// Pull fresh top-of-book for both tokens over REST into the mirror.
    async fn refresh_from_rest(&self, mirror: &Arc<BookMirror>) {
        let token_ids = vec![
            self.market.yes_token_id.clone(),
            self.market.no_token_id.clone(),
        ];
        match self.rest.books(&token_ids).await {
            Ok(books) => {
                for book in books {
                    if let Err(e) = mirror.apply_book(&book.asset_id, &book.bids, &book.asks) {
                        warn!(market_id = %self.market.market_id, "REST book rejected: {e}");
                    }
                }
            }
            Err(e) => {
                warn!(market_id = %self.market.market_id, "REST book fetch failed: {e}");
            }
        }
    }

    // ------------------------------------------------------------------
    // ACTIVE: cycle loop
    // ------------------------------------------------------------------

    async fn run_cycles(
        &mut self,
        ticker: &mut CycleTicker,
        mirror: &Arc<BookMirror>,
        stats: &Arc<StreamStats>,
    ) {
        let gap_threshold = Duration::from_secs(self.meas.quality.feed_gap_threshold_seconds);

        while let Some(cycle) = ticker.next(Instant::now()) {
            tokio::select! {
                _ = tokio::time::sleep_until(cycle.instant.into()) => {}
                _ = self.shutdown.changed() => {
                    self.was_shutdown = true;
                    info!(market_id = %self.market.market_id, "shutdown during cycles");
                    return;
                }
                _ = self.drain.changed() => {
                    info!(market_id = %self.market.market_id, "drain requested by discovery");
                    return;
                }
            }

            let now = Utc::now();
            let time_remaining = self.market.time_remaining_secs(now);
            if time_remaining <= 0 {
                info!(market_id = %self.market.market_id, "settlement time reached");
                return;
            }

            // Reconnect storm: refresh the mirror over REST while the
            // stream resubscribes in the background.
            if stats.is_degraded() {
                self.refresh_from_rest(mirror).await;
            }

            // Feed gap: no events covering this cycle's planned instant on
            // one of the mirrors (REST refreshes also reset the ages). Skip
            // evaluation, taint every active attempt, count.
            let (yes, no) = mirror.pair_top(&self.market.yes_token_id, &self.market.no_token_id);
            if !yes.is_fresh(gap_threshold) || !no.is_fresh(gap_threshold) {
                self.note_anomaly("feed gap at cycle instant");
                for i in 0..self.evaluators.len() {
                    let updates = self.evaluators[i].mark_feed_gap();
                    for update in updates {
                        self.send(WriteCommand::UpdateAttemptRunning(update));
                    }
                }
                warn!(
                    market_id = %self.market.market_id,
                    cycle = cycle.number,
                    yes_age_ms = ?yes.age_ms,
                    no_age_ms = ?no.age_ms,
                    stream_age = ?stats.last_message_age(),
                    "feed gap, skipping cycle"
                );
                continue;
            }

            self.cycles_run += 1;
            let snapshot = CycleSnapshot {
                market_id: self.market.market_id.clone(),
                cycle_number: cycle.number,
                timestamp: now,
                yes_bid_points: yes.bid,
                yes_ask_points: yes.ask,
                no_bid_points: no.bid,
                no_ask_points: no.ask,
                yes_last_trade_points: yes.last_trade,
                no_last_trade_points: no.last_trade,
                time_remaining_secs: time_remaining,
                active_attempts_count: 0,
                anomaly_flag: false,
            };

            self.run_evaluators(&snapshot, stats);
        }
    }

    fn run_evaluators(&mut self, snapshot: &CycleSnapshot, stats: &Arc<StreamStats>) {
        let mut primary_active = 0i64;
        let mut primary_anomaly = false;

        for i in 0..self.evaluators.len() {
            let outcome = self.evaluators[i].evaluate_cycle(snapshot);

            if let Some(reason) = outcome.skipped {
                self.note_anomaly(reason);
            }
            if let Some(detail) = &outcome.ref_sum_anomaly {
                self.note_anomaly(detail.clone());
            }

            for attempt in &outcome.new_attempts {
                self.send(WriteCommand::InsertAttempt(attempt.clone()));
            }
            for attempt in &outcome.completed {
                self.send(WriteCommand::UpdateAttemptTerminal(attempt.clone()));
            }
            for update in outcome.running_updates {
                self.send(WriteCommand::UpdateAttemptRunning(update));
            }
            for record in outcome.lifecycle {
                self.send(WriteCommand::InsertLifecycle(record));
            }

            if i == 0 {
                primary_active = outcome.active_count as i64;
                primary_anomaly = outcome.ref_sum_anomaly.is_some();
            }
        }

        if self.flags.enable_snapshots {
            let mut row = snapshot.clone();
            row.active_attempts_count = primary_active;
            row.anomaly_flag = primary_anomaly;
            self.send(WriteCommand::InsertSnapshot(row));
        }

        let primary = &self.evaluators[0];
        let (total_attempts, total_pairs) = (primary.total_attempts, primary.total_pairs);
        let planned = self.planned_total;
        let connected = stats.is_connected();
        self.status.update_asset(&self.market.crypto_asset, |s| {
            s.phase = MonitorPhase::Active;
            s.market_id = Some(snapshot.market_id.clone());
            s.cycle = snapshot.cycle_number;
            s.planned_cycles = planned;
            s.time_remaining_secs = snapshot.time_remaining_secs;
            s.active_attempts = primary_active;
            s.total_attempts = total_attempts;
            s.total_pairs = total_pairs;
            s.stream_connected = connected;
        });
    }

    // ------------------------------------------------------------------
    // SETTLED: finalize
    // ------------------------------------------------------------------

    async fn finalize(&mut self, reason: FailReason, mirror: &Arc<BookMirror>) -> MarketSummary {
        let now = Utc::now();

        // Final look at the books for exit spreads, if the mirror still has
        // both sides.
        let (yes, no) = mirror.pair_top(&self.market.yes_token_id, &self.market.no_token_id);
        let last_snapshot = CycleSnapshot {
            market_id: self.market.market_id.clone(),
            cycle_number: self.cycles_run,
            timestamp: now,
            yes_bid_points: yes.bid,
            yes_ask_points: yes.ask,
            no_bid_points: no.bid,
            no_ask_points: no.ask,
            yes_last_trade_points: yes.last_trade,
            no_last_trade_points: no.last_trade,
            time_remaining_secs: 0,
            active_attempts_count: 0,
            anomaly_flag: false,
        };

        let mut all_failed = Vec::new();
        for evaluator in &mut self.evaluators {
            let failed = evaluator.settle(now, reason, Some(&last_snapshot));
            if !failed.is_empty() {
                info!(
                    market_id = %self.market.market_id,
                    param_set = %evaluator.params().name,
                    count = failed.len(),
                    reason = %reason,
                    "settlement finalized {} attempt(s)",
                    failed.len(),
                );
            }
            all_failed.extend(failed);
        }

        let summary = self.evaluators[0].summary(self.cycles_run, self.anomaly_count, now);

        // Log non-primary parameter sets; only the primary owns the row.
        for evaluator in self.evaluators.iter().skip(1) {
            if evaluator.total_attempts > 0 {
                info!(
                    market_id = %self.market.market_id,
                    param_set = %evaluator.params().name,
                    attempts = evaluator.total_attempts,
                    pairs = evaluator.total_pairs,
                    "secondary parameter set results"
                );
            }
        }

        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        self.send(WriteCommand::FinalizeMarket {
            summary: summary.clone(),
            failed: all_failed,
            ack: ack_tx,
        });
        // Settlement is the one place the monitor waits on durability: the
        // bulk failure and the summary must be on disk before rotation.
        if ack_rx.await.is_err() {
            warn!(market_id = %self.market.market_id, "writer dropped settlement ack");
        }

        self.status.update_asset(&self.market.crypto_asset, |s| {
            s.markets_monitored += 1;
        });
        summary
    }

    // ------------------------------------------------------------------
    // Small helpers
    // ------------------------------------------------------------------

    fn send(&self, cmd: WriteCommand) {
        if self.writer.send(cmd).is_err() {
            warn!(market_id = %self.market.market_id, "writer channel closed, dropping command");
        }
    }

    fn note_anomaly(&mut self, detail: impl Into<String>) {
        let detail = detail.into();
        self.anomaly_count += 1;
        self.status.record_anomaly(&self.market.crypto_asset, detail);
        if !self.anomaly_flagged
            && self.anomaly_count > self.meas.quality.max_anomalies_per_market
        {
            self.anomaly_flagged = true;
            warn!(
                market_id = %self.market.market_id,
                count = self.anomaly_count,
                "anomaly limit exceeded, market flagged (still settling normally)"
            );
        }
    }

    fn set_phase(&self, phase: MonitorPhase, time_remaining: i64) {
        let market_id = self.market.market_id.clone();
        self.status.update_asset(&self.market.crypto_asset, |s| {
            s.phase = phase;
            s.market_id = Some(market_id);
            s.time_remaining_secs = time_remaining;
            if phase == MonitorPhase::Starting {
                s.cycle = 0;
                s.active_attempts = 0;
            }
        });
    }
}

/// One-shot integrity check 20 s into the window: compare the stream
/// mirror against the REST book, midpoint, and best-price endpoints and
/// flag divergence above one point.
async fn audit_books(
    rest: ClobRestClient,
    mirror: Arc<BookMirror>,
    market_id: String,
    token_ids: Vec<String>,
) {
    tokio::time::sleep(Duration::from_secs(20)).await;

    for token_id in &token_ids {
        let ws = mirror.top(token_id);
        let (Some(ws_bid), Some(ws_ask)) = (ws.bid, ws.ask) else {
            continue;
        };

        let rest_book = match rest.book(token_id).await {
            Ok(book) => book,
            Err(e) => {
                warn!(market_id = %market_id, "book audit fetch failed: {e}");
                continue;
            }
        };
        let rest_ask = rest_book
            .asks
            .iter()
            .filter_map(|l| crate::points::price_to_points(&l.price).ok())
            .min();
        let rest_mid = rest.midpoint(token_id).await.ok().flatten();
        let rest_bid = rest.price(token_id, "BUY").await.ok().flatten();

        info!(
            market_id = %market_id,
            token = &token_id[..token_id.len().min(12)],
            ws_bid,
            ws_ask,
            ws_ask_size = ?ws.ask_size,
            ws_bid_size = ?ws.bid_size,
            rest_bid = ?rest_bid,
            rest_ask = ?rest_ask,
            rest_mid = ?rest_mid,
            "[BOOK AUDIT] stream vs REST"
        );

        if let Some(rest_ask) = rest_ask {
            if (ws_ask - rest_ask).abs() > 1 {
                warn!(
                    market_id = %market_id,
                    ws_ask,
                    rest_ask,
                    "[BOOK AUDIT] ask divergence between stream and REST"
                );
            }
        }
        if let Some(rest_bid) = rest_bid {
            if (ws_bid - rest_bid).abs() > 1 {
                warn!(
                    market_id = %market_id,
                    ws_bid,
                    rest_bid,
                    "[BOOK AUDIT] bid divergence between stream and REST"
                );
            }
        }
    }
}
