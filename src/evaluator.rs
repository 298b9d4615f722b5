//! Trigger evaluation: arms ASK_TOUCH levels from each cycle's reference
//! prices, fills them against the next cycle's asks, advances active
//! attempts through stop-loss / pairing / tracker updates, and finalizes
//! everything left at settlement.
//!
//! The evaluator is pure compute over one `CycleSnapshot` at a time: no
//! I/O, no async. The monitor feeds it snapshots and turns the returned
//! outcome into write commands.
//!
//! With a midpoint reference, `ask <= midpoint - S0` can only hold against
//! a level armed in an earlier cycle (the same-cycle inequality would
//! require a crossed book). Armed levels therefore persist until they fill
//! or are replaced by the next cycle's references.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::points::{clamp_trigger, floor_to_tick, midpoint_points, MAX_TRIGGER_POINTS};
use crate::types::{
    time_remaining_bucket, Attempt, AttemptStatus, CycleSnapshot, FailReason, MarketInfo,
    MarketSummary, ParameterSet, ReferenceSource, Side,
};

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// Tracker values that changed for a still-active attempt this cycle.
#[derive(Debug, Clone)]
pub struct RunningUpdate {
    pub attempt_id: i64,
    pub closest_approach_points: Option<i64>,
    pub closest_approach_timestamp: Option<DateTime<Utc>>,
    pub closest_approach_cycle_number: Option<i64>,
    pub max_adverse_excursion_points: Option<i64>,
    pub mae_timestamp: Option<DateTime<Utc>>,
    pub mae_cycle_number: Option<i64>,
    pub had_feed_gap: bool,
}

/// Per-cycle tracking row for an active attempt (high-volume, optional).
#[derive(Debug, Clone)]
pub struct LifecycleRecord {
    pub attempt_id: i64,
    pub cycle_number: i64,
    pub timestamp: DateTime<Utc>,
    pub opposite_ask_points: Option<i64>,
    pub distance_to_trigger: Option<i64>,
    pub closest_approach_so_far: Option<i64>,
}

/// Everything that happened during one measurement cycle.
#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub new_attempts: Vec<Attempt>,
    /// Attempts that went terminal this cycle (paired or stop-loss).
    pub completed: Vec<Attempt>,
    pub running_updates: Vec<RunningUpdate>,
    pub lifecycle: Vec<LifecycleRecord>,
    pub skipped: Option<&'static str>,
    pub ref_sum_anomaly: Option<String>,
    pub active_count: usize,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// A trigger level armed from an earlier cycle's reference, waiting for the
/// ask to touch it.
#[derive(Debug, Clone, Copy)]
struct ArmedTrigger {
    level: i64,
    armed_cycle: i64,
}

/// An active attempt plus the trigger state that never reaches the store.
#[derive(Debug)]
struct ActiveAttempt {
    row: Attempt,
    opposite_trigger_points: i64,
    #[allow(dead_code)]
    opposite_max_points: i64,
}

impl ActiveAttempt {
    fn opposite_side(&self) -> Side {
        self.row.first_leg_side.opposite()
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

pub struct TriggerEvaluator {
    params: ParameterSet,
    market_id: String,
    tick: i64,
    max_ref_sum_deviation: i64,
    enable_lifecycle: bool,
    id_gen: Arc<AtomicI64>,
    armed_yes: Option<ArmedTrigger>,
    armed_no: Option<ArmedTrigger>,
    active: Vec<ActiveAttempt>,

    pub total_attempts: i64,
    pub total_pairs: i64,
    pub total_failed: i64,
    pub settlement_failures: i64,
    pub max_concurrent: i64,
    pair_times: Vec<i64>,
}

impl TriggerEvaluator {
    pub fn new(
        params: ParameterSet,
        market: &MarketInfo,
        max_ref_sum_deviation: i64,
        enable_lifecycle: bool,
        id_gen: Arc<AtomicI64>,
    ) -> Self {
        Self {
            params,
            market_id: market.market_id.clone(),
            tick: market.tick_size_points,
            max_ref_sum_deviation,
            enable_lifecycle,
            id_gen,
            armed_yes: None,
            armed_no: None,
            active: Vec::new(),
            total_attempts: 0,
            total_pairs: 0,
            total_failed: 0,
            settlement_failures: 0,
            max_concurrent: 0,
            pair_times: Vec::new(),
        }
    }

    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    // ------------------------------------------------------------------
    // Main entry point
    // ------------------------------------------------------------------

    pub fn evaluate_cycle(&mut self, snapshot: &CycleSnapshot) -> CycleOutcome {
        let mut outcome = CycleOutcome::default();
        let cycle = snapshot.cycle_number;

        // --- Preconditions: both sides must have an uncrossed bid and ask.
        // Armed triggers and active attempts survive a skipped cycle.
        if !has_valid_orderbook(snapshot) {
            outcome.skipped = Some("orderbook_empty");
            outcome.active_count = self.active.len();
            warn!(market_id = %self.market_id, cycle, "cycle skipped: incomplete orderbook");
            return outcome;
        }

        // Validated above, so the unwraps below cannot fire.
        let yes_ask = snapshot.yes_ask_points.unwrap();
        let no_ask = snapshot.no_ask_points.unwrap();

        // --- Reference prices for this cycle ---
        let ref_yes = self.reference(snapshot, Side::Yes);
        let ref_no = self.reference(snapshot, Side::No);

        let ref_sum = ref_yes + ref_no;
        if (ref_sum - 100).abs() > self.max_ref_sum_deviation {
            let detail = format!("reference_sum_anomaly: {ref_sum} (expected ~100)");
            warn!(market_id = %self.market_id, cycle, "{detail}");
            outcome.ref_sum_anomaly = Some(detail);
        }

        // --- Check previously armed triggers against current asks ---
        let mut fired: Vec<(Side, i64, i64)> = Vec::new(); // (side, ask, distance)
        for (side, ask, armed) in [
            (Side::Yes, yes_ask, self.armed_yes),
            (Side::No, no_ask, self.armed_no),
        ] {
            let Some(trigger) = armed else { continue };
            if trigger.armed_cycle < cycle && ask <= trigger.level {
                fired.push((side, ask, (trigger.level - ask).abs()));
                debug!(
                    market_id = %self.market_id,
                    cycle,
                    %side,
                    ask,
                    level = trigger.level,
                    armed_cycle = trigger.armed_cycle,
                    "trigger touched"
                );
            }
        }

        // Tie-break decides ordering only: the side that touched harder
        // (smaller trigger − ask distance) gets the lower attempt id; on
        // equal distance YES goes first. YES is pushed first above and the
        // sort is stable, so the fallback holds for free.
        if fired.len() == 2 {
            fired.sort_by_key(|(_, _, dist)| *dist);
            info!(
                market_id = %self.market_id,
                cycle,
                first = %fired[0].0,
                "simultaneous triggers, {} takes the lower id",
                fired[0].0,
            );
        }

        let fired_sides: Vec<Side> = fired.iter().map(|(s, _, _)| *s).collect();
        for (side, ask, _) in fired {
            let attempt = self.create_attempt(snapshot, side, ask, ref_yes, ref_no);
            outcome.new_attempts.push(attempt.row.clone());
            self.active.push(attempt);
        }

        // --- Re-arm both sides from this cycle's references. A side that
        // just filled sits out one cycle before re-arming.
        for side in [Side::Yes, Side::No] {
            if fired_sides.contains(&side) {
                match side {
                    Side::Yes => self.armed_yes = None,
                    Side::No => self.armed_no = None,
                }
                continue;
            }
            let reference = match side {
                Side::Yes => ref_yes,
                Side::No => ref_no,
            };
            let level = self.trigger_level(reference, cycle, side);
            let armed = Some(ArmedTrigger { level, armed_cycle: cycle });
            match side {
                Side::Yes => self.armed_yes = armed,
                Side::No => self.armed_no = armed,
            }
        }

        // --- Advance every active attempt (stop-loss checked first) ---
        let mut still_active: Vec<ActiveAttempt> = Vec::with_capacity(self.active.len());
        for mut attempt in self.active.drain(..) {
            let first_leg_bid = snapshot.bid(attempt.row.first_leg_side);
            let opp_ask = snapshot.ask(attempt.opposite_side());

            let stop_hit = match (attempt.row.stop_loss_price_points, first_leg_bid) {
                (Some(stop), Some(bid)) => bid <= stop,
                _ => false,
            };

            if stop_hit {
                let bid = first_leg_bid.unwrap();
                complete_stop_loss(&mut attempt.row, snapshot, bid);
                self.total_failed += 1;
                info!(
                    market_id = %self.market_id,
                    cycle,
                    attempt_id = attempt.row.attempt_id,
                    first_leg_bid = bid,
                    pair_profit = attempt.row.pair_profit_points.unwrap_or(0),
                    "attempt #{} stopped out at {}pt",
                    attempt.row.attempt_id,
                    bid,
                );
                outcome.completed.push(attempt.row);
            } else if opp_ask.is_some_and(|a| a <= attempt.opposite_trigger_points) {
                let fill = opp_ask.unwrap();
                complete_paired(&mut attempt.row, snapshot, fill);
                self.total_pairs += 1;
                if let Some(ttp) = attempt.row.time_to_pair_seconds {
                    self.pair_times.push(ttp);
                }
                info!(
                    market_id = %self.market_id,
                    cycle,
                    attempt_id = attempt.row.attempt_id,
                    cost = attempt.row.pair_cost_points.unwrap_or(0),
                    profit = attempt.row.pair_profit_points.unwrap_or(0),
                    "attempt #{} PAIRED: cost={}pt profit={}pt in {}s",
                    attempt.row.attempt_id,
                    attempt.row.pair_cost_points.unwrap_or(0),
                    attempt.row.pair_profit_points.unwrap_or(0),
                    attempt.row.time_to_pair_seconds.unwrap_or(0),
                );
                outcome.completed.push(attempt.row);
            } else {
                if let Some(update) = update_trackers(&mut attempt, snapshot, opp_ask, first_leg_bid)
                {
                    outcome.running_updates.push(update);
                }
                if self.enable_lifecycle {
                    outcome.lifecycle.push(LifecycleRecord {
                        attempt_id: attempt.row.attempt_id,
                        cycle_number: cycle,
                        timestamp: snapshot.timestamp,
                        opposite_ask_points: opp_ask,
                        distance_to_trigger: opp_ask.map(|a| a - attempt.opposite_trigger_points),
                        closest_approach_so_far: attempt.row.closest_approach_points,
                    });
                }
                still_active.push(attempt);
            }
        }
        self.active = still_active;

        self.max_concurrent = self.max_concurrent.max(self.active.len() as i64);
        outcome.active_count = self.active.len();
        outcome
    }

    // ------------------------------------------------------------------
    // Feed gap
    // ------------------------------------------------------------------

    /// Flag every active attempt as having lived through a feed gap.
    /// Returns updates only for attempts not already flagged.
    pub fn mark_feed_gap(&mut self) -> Vec<RunningUpdate> {
        let mut updates = Vec::new();
        for attempt in &mut self.active {
            if !attempt.row.had_feed_gap {
                attempt.row.had_feed_gap = true;
                updates.push(RunningUpdate {
                    attempt_id: attempt.row.attempt_id,
                    closest_approach_points: attempt.row.closest_approach_points,
                    closest_approach_timestamp: attempt.row.closest_approach_timestamp,
                    closest_approach_cycle_number: attempt.row.closest_approach_cycle_number,
                    max_adverse_excursion_points: attempt.row.max_adverse_excursion_points,
                    mae_timestamp: attempt.row.mae_timestamp,
                    mae_cycle_number: attempt.row.mae_cycle_number,
                    had_feed_gap: true,
                });
            }
        }
        updates
    }

    // ------------------------------------------------------------------
    // Settlement
    // ------------------------------------------------------------------

    /// Fail every remaining active attempt and discard armed triggers.
    /// Tracker values keep whatever the last non-stale cycle left in the
    /// rows; exit spreads are filled from the final snapshot when present.
    pub fn settle(
        &mut self,
        now: DateTime<Utc>,
        reason: FailReason,
        last_snapshot: Option<&CycleSnapshot>,
    ) -> Vec<Attempt> {
        self.armed_yes = None;
        self.armed_no = None;

        let mut failed = Vec::with_capacity(self.active.len());
        for mut attempt in self.active.drain(..) {
            attempt.row.status = AttemptStatus::CompletedFailed;
            attempt.row.fail_reason = Some(reason);
            attempt.row.time_remaining_at_completion = Some(0);
            if let Some(snap) = last_snapshot {
                attempt.row.yes_spread_exit_points = snap.spread(Side::Yes);
                attempt.row.no_spread_exit_points = snap.spread(Side::No);
            }

            self.total_failed += 1;
            if reason == FailReason::SettlementReached {
                self.settlement_failures += 1;
            }
            info!(
                market_id = %self.market_id,
                attempt_id = attempt.row.attempt_id,
                reason = %reason,
                lived_secs = (now - attempt.row.t1_timestamp).num_seconds(),
                closest = ?attempt.row.closest_approach_points,
                mae = ?attempt.row.max_adverse_excursion_points,
                "attempt #{} failed at settlement",
                attempt.row.attempt_id,
            );
            failed.push(attempt.row);
        }
        failed
    }

    /// Final statistics for the market summary row.
    pub fn summary(
        &self,
        total_cycles_run: i64,
        anomaly_count: i64,
        now: DateTime<Utc>,
    ) -> MarketSummary {
        let avg = if self.pair_times.is_empty() {
            None
        } else {
            Some(self.pair_times.iter().sum::<i64>() as f64 / self.pair_times.len() as f64)
        };

        MarketSummary {
            market_id: self.market_id.clone(),
            total_attempts: self.total_attempts,
            total_pairs: self.total_pairs,
            total_failed: self.total_failed,
            settlement_failures: self.settlement_failures,
            pair_rate: self.total_pairs as f64 / self.total_attempts.max(1) as f64,
            avg_time_to_pair: avg,
            median_time_to_pair: median_of(&self.pair_times),
            max_concurrent_attempts: self.max_concurrent,
            total_cycles_run,
            anomaly_count,
            actual_settlement_time: now,
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn reference(&self, snapshot: &CycleSnapshot, side: Side) -> i64 {
        // Validated before this is called.
        let bid = snapshot.bid(side).unwrap();
        let ask = snapshot.ask(side).unwrap();
        match self.params.reference_price_source {
            ReferenceSource::Midpoint => midpoint_points(bid, ask),
            ReferenceSource::LastTrade => match snapshot.last_trade(side) {
                Some(trade) => trade,
                None => {
                    // No trade yet this window, midpoint is the safe default.
                    debug!(market_id = %self.market_id, %side, "no last trade, falling back to midpoint");
                    midpoint_points(bid, ask)
                }
            },
        }
    }

    fn trigger_level(&self, reference: i64, cycle: i64, side: Side) -> i64 {
        let raw = floor_to_tick(reference - self.params.s0_points, self.tick);
        let clamped = clamp_trigger(raw, self.tick);
        if raw > MAX_TRIGGER_POINTS {
            warn!(market_id = %self.market_id, cycle, %side, raw, "trigger_clamped_to_max");
        } else if raw < self.tick {
            warn!(market_id = %self.market_id, cycle, %side, raw, "trigger_clamped_to_min");
        }
        clamped
    }

    fn create_attempt(
        &mut self,
        snapshot: &CycleSnapshot,
        side: Side,
        best_ask: i64,
        ref_yes: i64,
        ref_no: i64,
    ) -> ActiveAttempt {
        let attempt_id = self.id_gen.fetch_add(1, Ordering::Relaxed) + 1;
        self.total_attempts += 1;

        let p1 = best_ask;
        let opposite = side.opposite();
        let opp_ref = match opposite {
            Side::Yes => ref_yes,
            Side::No => ref_no,
        };

        let opp_trigger_from_ref = clamp_trigger(
            floor_to_tick(opp_ref - self.params.s0_points, self.tick),
            self.tick,
        );
        let opp_max = floor_to_tick(self.params.pair_cap_points() - p1, self.tick);

        if opp_max > 100 {
            // Cannot happen for correct inputs; if it does, the pair-cap
            // arithmetic upstream is broken.
            error!(
                market_id = %self.market_id,
                opp_max,
                p1,
                pair_cap = self.params.pair_cap_points(),
                "ERROR_IMPOSSIBLE_OPPOSITEMAX"
            );
        }

        let opp_trigger = if opp_max < self.tick {
            warn!(
                market_id = %self.market_id,
                opp_max,
                tick = self.tick,
                "pair_constraint_impossible"
            );
            self.tick
        } else {
            opp_trigger_from_ref.min(opp_max)
        };

        let stop_loss_price = self
            .params
            .stop_loss_threshold_points
            .map(|threshold| (p1 - threshold).clamp(0, MAX_TRIGGER_POINTS));

        let time_remaining = snapshot.time_remaining_secs;
        let row = Attempt {
            attempt_id,
            market_id: self.market_id.clone(),
            parameter_set_id: self.params.parameter_set_id,
            cycle_number: snapshot.cycle_number,
            t1_timestamp: snapshot.timestamp,
            first_leg_side: side,
            p1_points: p1,
            reference_yes_points: ref_yes,
            reference_no_points: ref_no,
            status: AttemptStatus::Active,
            t2_timestamp: None,
            t2_cycle_number: None,
            time_to_pair_seconds: None,
            time_remaining_at_start: time_remaining,
            time_remaining_at_completion: None,
            time_remaining_bucket: time_remaining_bucket(time_remaining).to_string(),
            actual_opposite_price: None,
            pair_cost_points: None,
            pair_profit_points: None,
            fail_reason: None,
            had_feed_gap: false,
            closest_approach_points: None,
            closest_approach_timestamp: None,
            closest_approach_cycle_number: None,
            max_adverse_excursion_points: None,
            mae_timestamp: None,
            mae_cycle_number: None,
            yes_spread_entry_points: snapshot.spread(Side::Yes),
            no_spread_entry_points: snapshot.spread(Side::No),
            yes_spread_exit_points: None,
            no_spread_exit_points: None,
            delta_points: self.params.delta_points,
            s0_points: self.params.s0_points,
            stop_loss_threshold_points: self.params.stop_loss_threshold_points,
            stop_loss_price_points: stop_loss_price,
        };

        info!(
            market_id = %self.market_id,
            cycle = snapshot.cycle_number,
            attempt_id,
            "new attempt #{attempt_id}: {side}-first @ {p1}pt, hunting {opposite} <= {opp_trigger}pt (max={opp_max})",
        );

        ActiveAttempt {
            row,
            opposite_trigger_points: opp_trigger,
            opposite_max_points: opp_max,
        }
    }
}

// ---------------------------------------------------------------------------
// Terminal transitions and trackers
// ---------------------------------------------------------------------------

fn complete_paired(row: &mut Attempt, snapshot: &CycleSnapshot, opposite_ask: i64) {
    row.status = AttemptStatus::CompletedPaired;
    row.t2_timestamp = Some(snapshot.timestamp);
    row.t2_cycle_number = Some(snapshot.cycle_number);
    row.time_to_pair_seconds = Some((snapshot.timestamp - row.t1_timestamp).num_seconds().max(0));
    row.time_remaining_at_completion = Some(snapshot.time_remaining_secs);
    row.actual_opposite_price = Some(opposite_ask);
    row.pair_cost_points = Some(row.p1_points + opposite_ask);
    row.pair_profit_points = Some(100 - (row.p1_points + opposite_ask));
    // Touched or crossed the trigger.
    row.closest_approach_points = Some(0);
    row.closest_approach_timestamp = Some(snapshot.timestamp);
    row.closest_approach_cycle_number = Some(snapshot.cycle_number);
    if row.max_adverse_excursion_points.is_none() {
        row.max_adverse_excursion_points = Some(0);
    }
    row.yes_spread_exit_points = snapshot.spread(Side::Yes);
    row.no_spread_exit_points = snapshot.spread(Side::No);
}

fn complete_stop_loss(row: &mut Attempt, snapshot: &CycleSnapshot, first_leg_bid: i64) {
    row.status = AttemptStatus::CompletedFailed;
    row.fail_reason = Some(FailReason::StopLoss);
    row.time_remaining_at_completion = Some(snapshot.time_remaining_secs);
    // The simulated exit marks the first leg at its bid; the loss shows up
    // as a negative pair profit.
    row.actual_opposite_price = Some(first_leg_bid);
    row.pair_cost_points = Some(row.p1_points + first_leg_bid);
    row.pair_profit_points = Some(100 - (row.p1_points + first_leg_bid));
    row.yes_spread_exit_points = snapshot.spread(Side::Yes);
    row.no_spread_exit_points = snapshot.spread(Side::No);
}

fn update_trackers(
    attempt: &mut ActiveAttempt,
    snapshot: &CycleSnapshot,
    opp_ask: Option<i64>,
    first_leg_bid: Option<i64>,
) -> Option<RunningUpdate> {
    let row = &mut attempt.row;
    let mut changed = false;

    if let Some(opp_ask) = opp_ask {
        let dist = opp_ask - attempt.opposite_trigger_points;
        if row.closest_approach_points.map_or(true, |prev| dist < prev) {
            row.closest_approach_points = Some(dist);
            row.closest_approach_timestamp = Some(snapshot.timestamp);
            row.closest_approach_cycle_number = Some(snapshot.cycle_number);
            changed = true;
        }
    }

    if let Some(bid) = first_leg_bid {
        let adverse = (row.p1_points - bid).max(0);
        let prev = row.max_adverse_excursion_points.unwrap_or(-1);
        if adverse > prev {
            row.max_adverse_excursion_points = Some(adverse);
            if adverse > 0 {
                row.mae_timestamp = Some(snapshot.timestamp);
                row.mae_cycle_number = Some(snapshot.cycle_number);
            }
            changed = true;
        }
    }

    changed.then(|| RunningUpdate {
        attempt_id: row.attempt_id,
        closest_approach_points: row.closest_approach_points,
        closest_approach_timestamp: row.closest_approach_timestamp,
        closest_approach_cycle_number: row.closest_approach_cycle_number,
        max_adverse_excursion_points: row.max_adverse_excursion_points,
        mae_timestamp: row.mae_timestamp,
        mae_cycle_number: row.mae_cycle_number,
        had_feed_gap: row.had_feed_gap,
    })
}

fn has_valid_orderbook(snapshot: &CycleSnapshot) -> bool {
    let fields = [
        snapshot.yes_bid_points,
        snapshot.yes_ask_points,
        snapshot.no_bid_points,
        snapshot.no_ask_points,
    ];
    if fields.iter().any(|f| f.map_or(true, |v| v <= 0)) {
        return false;
    }
    snapshot.yes_bid_points < snapshot.yes_ask_points
        && snapshot.no_bid_points < snapshot.no_ask_points
}

fn median_of(values: &[i64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) as f64 / 2.0
    } else {
        sorted[mid] as f64
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn params(stop_loss: Option<i64>) -> ParameterSet {
        ParameterSet {
            parameter_set_id: 1,
            name: "baseline".to_string(),
            s0_points: 5,
            delta_points: 3,
            trigger_rule: crate::types::TriggerRule::AskTouch,
            reference_price_source: ReferenceSource::Midpoint,
            stop_loss_threshold_points: stop_loss,
        }
    }

    fn market() -> MarketInfo {
        MarketInfo {
            market_id: "btc-updown-15m-1770356700".to_string(),
            condition_id: "0xcond".to_string(),
            crypto_asset: "btc".to_string(),
            yes_token_id: "11111".to_string(),
            no_token_id: "22222".to_string(),
            tick_size_points: 1,
            settlement_time: Utc.timestamp_opt(1_770_357_600, 0).unwrap(),
            active: true,
            accepting_orders: true,
        }
    }

    fn evaluator(stop_loss: Option<i64>) -> TriggerEvaluator {
        TriggerEvaluator::new(
            params(stop_loss),
            &market(),
            2,
            false,
            Arc::new(AtomicI64::new(0)),
        )
    }

    /// Snapshot at 10-second cycle spacing. `yes`/`no` are (bid, ask).
    fn snap(cycle: i64, yes: (i64, i64), no: (i64, i64), time_remaining: i64) -> CycleSnapshot {
        CycleSnapshot {
            market_id: "btc-updown-15m-1770356700".to_string(),
            cycle_number: cycle,
            timestamp: Utc.timestamp_opt(1_770_356_700 + cycle * 10, 0).unwrap(),
            yes_bid_points: Some(yes.0),
            yes_ask_points: Some(yes.1),
            no_bid_points: Some(no.0),
            no_ask_points: Some(no.1),
            yes_last_trade_points: None,
            no_last_trade_points: None,
            time_remaining_secs: time_remaining,
            active_attempts_count: 0,
            anomaly_flag: false,
        }
    }

    #[test]
    fn quiet_books_create_nothing() {
        // Cycle 3 arms trigger_yes = 40, trigger_no = 48 (refs 45 / 53);
        // cycle 4 asks stay above both levels.
        let mut ev = evaluator(None);
        ev.evaluate_cycle(&snap(3, (44, 46), (52, 55), 610));
        let outcome = ev.evaluate_cycle(&snap(4, (44, 46), (52, 55), 600));
        assert!(outcome.new_attempts.is_empty());
        assert!(outcome.completed.is_empty());
        assert_eq!(outcome.active_count, 0);
    }

    #[test]
    fn nothing_fires_on_the_first_cycle() {
        // No level armed yet, however deep the ask.
        let mut ev = evaluator(None);
        let outcome = ev.evaluate_cycle(&snap(1, (37, 39), (52, 55), 890));
        assert!(outcome.new_attempts.is_empty());
    }

    #[test]
    fn simple_successful_pair() {
        let mut ev = evaluator(None);

        // Cycle 3: refs 45 / 53 arm trigger_yes = 40, trigger_no = 48.
        ev.evaluate_cycle(&snap(3, (44, 46), (52, 55), 620));

        // Cycle 4: YES ask drops to 39 ≤ 40 → attempt with P1 = 39.
        let outcome = ev.evaluate_cycle(&snap(4, (37, 39), (52, 55), 610));
        assert_eq!(outcome.new_attempts.len(), 1);
        let a = &outcome.new_attempts[0];
        assert_eq!(a.first_leg_side, Side::Yes);
        assert_eq!(a.p1_points, 39);
        assert_eq!(a.attempt_id, 1);
        assert_eq!(a.reference_no_points, 53);
        // opposite_trigger = min(floor(53−5) = 48, floor(97−39) = 58) = 48.

        // Cycle 5: NO ask stays above 48, attempt remains active.
        let outcome = ev.evaluate_cycle(&snap(5, (38, 40), (48, 50), 600));
        assert!(outcome.completed.is_empty());
        assert_eq!(outcome.active_count, 1);

        // Cycle 6: NO ask = 47 ≤ 48 → paired at the actual ask.
        let outcome = ev.evaluate_cycle(&snap(6, (38, 40), (46, 47), 590));
        assert_eq!(outcome.completed.len(), 1);
        let done = &outcome.completed[0];
        assert_eq!(done.status, AttemptStatus::CompletedPaired);
        assert_eq!(done.actual_opposite_price, Some(47));
        assert_eq!(done.pair_cost_points, Some(86));
        assert_eq!(done.pair_profit_points, Some(14));
        assert_eq!(done.time_to_pair_seconds, Some(20));
        assert!(done.t2_timestamp.unwrap() >= done.t1_timestamp);
        assert_eq!(done.closest_approach_points, Some(0));
        // Pair invariants: cost within cap, profit at least delta.
        assert!(done.pair_cost_points.unwrap() <= 97);
        assert!(done.pair_profit_points.unwrap() >= 3);
        assert_eq!(ev.total_pairs, 1);
        assert_eq!(outcome.active_count, 0);
    }

    #[test]
    fn stop_loss_exits_before_pairing() {
        let mut ev = evaluator(Some(2));

        // Arm, then fill YES at 39 → stop_loss_price = 37.
        ev.evaluate_cycle(&snap(3, (44, 46), (52, 55), 620));
        let outcome = ev.evaluate_cycle(&snap(4, (38, 39), (52, 55), 610));
        assert_eq!(outcome.new_attempts.len(), 1);
        assert_eq!(outcome.new_attempts[0].stop_loss_price_points, Some(37));

        // Quiet cycle; the NO reference drifts down so its own trigger
        // re-arms at 44, below the attempt's opposite trigger of 48.
        let outcome = ev.evaluate_cycle(&snap(5, (38, 40), (48, 50), 600));
        assert!(outcome.completed.is_empty());

        // YES bid collapses to 36 ≤ 37 while the NO ask simultaneously
        // reaches the opposite trigger (48 ≤ 48): stop-loss wins.
        let outcome = ev.evaluate_cycle(&snap(6, (36, 40), (46, 48), 590));
        assert!(outcome.new_attempts.is_empty());
        assert_eq!(outcome.completed.len(), 1);
        let done = &outcome.completed[0];
        assert_eq!(done.status, AttemptStatus::CompletedFailed);
        assert_eq!(done.fail_reason, Some(FailReason::StopLoss));
        assert_eq!(done.actual_opposite_price, Some(36));
        assert_eq!(done.pair_cost_points, Some(75));
        assert_eq!(done.pair_profit_points, Some(25));
        assert_eq!(done.t2_timestamp, None);
        assert_eq!(ev.total_failed, 1);
        assert_eq!(ev.total_pairs, 0);
    }

    #[test]
    fn stop_loss_profit_goes_negative_when_underwater() {
        let mut ev = evaluator(Some(2));
        // Arm YES at 70 (ref 75), fill at 70, then collapse the bid to 35:
        // cost = 70 + 35 = 105 → profit −5.
        ev.evaluate_cycle(&snap(1, (73, 77), (24, 27), 890));
        let outcome = ev.evaluate_cycle(&snap(2, (69, 70), (24, 27), 880));
        assert_eq!(outcome.new_attempts.len(), 1);
        assert_eq!(outcome.new_attempts[0].p1_points, 70);

        let outcome = ev.evaluate_cycle(&snap(3, (35, 70), (24, 27), 870));
        let done = &outcome.completed[0];
        assert_eq!(done.fail_reason, Some(FailReason::StopLoss));
        assert_eq!(done.pair_profit_points, Some(-5));
    }

    #[test]
    fn settlement_fails_remaining_attempts_with_null_costs() {
        let mut ev = evaluator(None);
        ev.evaluate_cycle(&snap(87, (44, 46), (52, 55), 40));
        ev.evaluate_cycle(&snap(88, (37, 39), (52, 55), 30));
        assert_eq!(ev.active_count(), 1);

        let now = Utc.timestamp_opt(1_770_357_600, 0).unwrap();
        let failed = ev.settle(now, FailReason::SettlementReached, None);
        assert_eq!(failed.len(), 1);
        let f = &failed[0];
        assert_eq!(f.status, AttemptStatus::CompletedFailed);
        assert_eq!(f.fail_reason, Some(FailReason::SettlementReached));
        assert_eq!(f.actual_opposite_price, None);
        assert_eq!(f.pair_cost_points, None);
        assert_eq!(f.pair_profit_points, None);
        assert_eq!(f.t2_timestamp, None);
        assert_eq!(ev.settlement_failures, 1);
        assert_eq!(ev.active_count(), 0);
    }

    #[test]
    fn simultaneous_triggers_create_both_with_adjacent_ids() {
        let mut ev = evaluator(None);
        // Cycle 9 arms trigger_yes = 40 and trigger_no = 48 (refs 45 / 53).
        ev.evaluate_cycle(&snap(9, (44, 46), (52, 55), 510));
        // Cycle 10: YES ask 38 (distance 2) and NO ask 46 (distance 2) both
        // touch. Tie → YES takes the lower id.
        let outcome = ev.evaluate_cycle(&snap(10, (36, 38), (44, 46), 500));
        assert_eq!(outcome.new_attempts.len(), 2);
        assert_eq!(outcome.new_attempts[0].first_leg_side, Side::Yes);
        assert_eq!(outcome.new_attempts[0].attempt_id, 1);
        assert_eq!(outcome.new_attempts[1].first_leg_side, Side::No);
        assert_eq!(outcome.new_attempts[1].attempt_id, 2);
        assert_eq!(ev.total_attempts, 2);
    }

    #[test]
    fn harder_touch_takes_the_lower_id() {
        let mut ev = evaluator(None);
        ev.evaluate_cycle(&snap(9, (44, 46), (52, 55), 510));
        // YES ask 36: distance 4 below its 40 level. NO ask 46: distance 2
        // below its 48 level → NO touched harder and goes first.
        let outcome = ev.evaluate_cycle(&snap(10, (34, 36), (44, 46), 500));
        assert_eq!(outcome.new_attempts.len(), 2);
        assert_eq!(outcome.new_attempts[0].first_leg_side, Side::No);
        assert_eq!(outcome.new_attempts[0].attempt_id, 1);
        assert_eq!(outcome.new_attempts[1].first_leg_side, Side::Yes);
    }

    #[test]
    fn impossible_pair_constraint_pins_trigger_to_tick() {
        // delta = 49 → pair_cap = 51. A YES fill at P1 = 51 leaves
        // opp_max = floor(51 − 51) = 0 < tick: the attempt is still created
        // but hunts the tick price, which no realistic book reaches.
        let mut ps = params(None);
        ps.delta_points = 49;
        let mut ev = TriggerEvaluator::new(ps, &market(), 2, false, Arc::new(AtomicI64::new(0)));

        // Cycle 1 arms trigger_yes = 51 (ref 56); cycle 2 fills at 51. The
        // NO book sits near zero so its own trigger stays pinned at tick.
        ev.evaluate_cycle(&snap(1, (54, 58), (4, 8), 890));
        let outcome = ev.evaluate_cycle(&snap(2, (49, 51), (4, 8), 880));
        assert_eq!(outcome.new_attempts.len(), 1);
        assert_eq!(outcome.new_attempts[0].p1_points, 51);
        assert_eq!(ev.active_count(), 1);

        // Opposite ask down to 2, still above the tick trigger, so no pairing.
        let outcome = ev.evaluate_cycle(&snap(3, (49, 51), (1, 2), 870));
        assert!(outcome.new_attempts.is_empty());
        assert!(outcome.completed.is_empty());
        assert_eq!(ev.active_count(), 1);
    }

    #[test]
    fn no_trigger_and_no_exit_means_no_transitions() {
        // Asks above armed triggers, active attempt short of its exit: the
        // cycle must neither create nor transition anything.
        let mut ev = evaluator(None);
        ev.evaluate_cycle(&snap(3, (44, 46), (52, 55), 620));
        ev.evaluate_cycle(&snap(4, (37, 39), (52, 55), 610));
        assert_eq!(ev.active_count(), 1);

        let outcome = ev.evaluate_cycle(&snap(5, (44, 46), (52, 55), 600));
        assert!(outcome.new_attempts.is_empty());
        assert!(outcome.completed.is_empty());
        assert_eq!(outcome.active_count, 1);
    }

    #[test]
    fn trackers_follow_worst_marks() {
        let mut ev = evaluator(None);
        ev.evaluate_cycle(&snap(3, (44, 46), (52, 55), 620));
        ev.evaluate_cycle(&snap(4, (37, 39), (52, 55), 610)); // P1=39, opp trigger 48

        // NO ask 50: closest = 2. YES bid 37: MAE = 2.
        let outcome = ev.evaluate_cycle(&snap(5, (37, 40), (49, 50), 600));
        assert_eq!(outcome.running_updates.len(), 1);
        let u = &outcome.running_updates[0];
        assert_eq!(u.closest_approach_points, Some(2));
        assert_eq!(u.max_adverse_excursion_points, Some(2));

        // NO ask backs off, YES bid recovers: nothing improves, no update
        // is emitted; both trackers keep their extremes.
        let outcome = ev.evaluate_cycle(&snap(6, (44, 46), (52, 53), 590));
        assert!(outcome.running_updates.is_empty());

        // Settlement preserves the tracked extremes.
        let failed = ev.settle(
            Utc.timestamp_opt(1_770_357_600, 0).unwrap(),
            FailReason::SettlementReached,
            None,
        );
        assert_eq!(failed[0].max_adverse_excursion_points, Some(2));
        assert_eq!(failed[0].closest_approach_points, Some(2));
    }

    #[test]
    fn feed_gap_marks_active_attempts_once() {
        let mut ev = evaluator(None);
        ev.evaluate_cycle(&snap(3, (44, 46), (52, 55), 620));
        ev.evaluate_cycle(&snap(4, (37, 39), (52, 55), 610));
        ev.evaluate_cycle(&snap(5, (37, 39), (52, 55), 600));
        ev.evaluate_cycle(&snap(6, (31, 33), (52, 55), 590));
        assert_eq!(ev.active_count(), 2);

        let updates = ev.mark_feed_gap();
        assert_eq!(updates.len(), 2);
        assert!(updates.iter().all(|u| u.had_feed_gap));

        // A second gap adds no duplicate updates.
        assert!(ev.mark_feed_gap().is_empty());
    }

    #[test]
    fn empty_orderbook_skips_and_advances_nothing() {
        let mut ev = evaluator(None);
        ev.evaluate_cycle(&snap(3, (44, 46), (52, 55), 620));
        ev.evaluate_cycle(&snap(4, (37, 39), (52, 55), 610));

        let mut s = snap(5, (44, 46), (52, 55), 600);
        s.no_ask_points = None;
        let outcome = ev.evaluate_cycle(&s);
        assert_eq!(outcome.skipped, Some("orderbook_empty"));
        assert!(outcome.new_attempts.is_empty());
        assert!(outcome.completed.is_empty());
        assert_eq!(ev.active_count(), 1);
    }

    #[test]
    fn armed_trigger_survives_a_skipped_cycle() {
        let mut ev = evaluator(None);
        ev.evaluate_cycle(&snap(3, (44, 46), (52, 55), 620));

        let mut gap = snap(4, (44, 46), (52, 55), 610);
        gap.yes_bid_points = None;
        assert_eq!(ev.evaluate_cycle(&gap).skipped, Some("orderbook_empty"));

        // The level armed at cycle 3 still fills at cycle 5.
        let outcome = ev.evaluate_cycle(&snap(5, (37, 39), (52, 55), 600));
        assert_eq!(outcome.new_attempts.len(), 1);
        assert_eq!(outcome.new_attempts[0].p1_points, 39);
    }

    #[test]
    fn crossed_side_counts_as_invalid() {
        let mut ev = evaluator(None);
        let outcome = ev.evaluate_cycle(&snap(1, (46, 44), (52, 55), 890));
        assert_eq!(outcome.skipped, Some("orderbook_empty"));
    }

    #[test]
    fn reference_sum_anomaly_is_reported_but_processing_continues() {
        let mut ev = evaluator(None);
        // refs: yes (40+44)/2 = 42, no (40+44)/2 = 42 → sum 84, far from 100.
        let outcome = ev.evaluate_cycle(&snap(1, (40, 44), (40, 44), 890));
        assert!(outcome.ref_sum_anomaly.is_some());
        assert!(outcome.skipped.is_none());
    }

    #[test]
    fn consecutive_triggers_yield_independent_attempts() {
        // Overlap policy: the same side touching on consecutive cycles
        // stacks attempts with no deduplication. The side sits out the
        // re-arm for one cycle after each fill, so fills land on cycles
        // 4 and 6.
        let mut ev = evaluator(None);
        ev.evaluate_cycle(&snap(3, (44, 46), (52, 55), 620));
        let o = ev.evaluate_cycle(&snap(4, (37, 39), (52, 55), 610));
        assert_eq!(o.new_attempts.len(), 1);
        // Cycle 5 re-arms YES from ref (37+39)/2 = 38 → level 33.
        let o = ev.evaluate_cycle(&snap(5, (37, 39), (52, 55), 600));
        assert!(o.new_attempts.is_empty());
        let o = ev.evaluate_cycle(&snap(6, (31, 33), (52, 55), 590));
        assert_eq!(o.new_attempts.len(), 1);
        assert_eq!(ev.active_count(), 2);
        assert_eq!(ev.total_attempts, 2);
        assert_eq!(ev.max_concurrent, 2);
    }

    #[test]
    fn last_trade_source_falls_back_to_midpoint() {
        let mut ps = params(None);
        ps.reference_price_source = ReferenceSource::LastTrade;
        let mut ev = TriggerEvaluator::new(ps, &market(), 2, false, Arc::new(AtomicI64::new(0)));

        // No trades yet: midpoint arms the same levels as the baseline.
        ev.evaluate_cycle(&snap(3, (44, 46), (52, 55), 620));
        let outcome = ev.evaluate_cycle(&snap(4, (37, 39), (52, 55), 610));
        assert_eq!(outcome.new_attempts.len(), 1);
        // Fill-time references also fall back to midpoints.
        assert_eq!(outcome.new_attempts[0].reference_yes_points, 38);
        assert_eq!(outcome.new_attempts[0].reference_no_points, 53);

        // With fresh trade prints the trade price is the reference.
        let mut s = snap(5, (44, 46), (52, 55), 600);
        s.yes_last_trade_points = Some(45);
        s.no_last_trade_points = Some(55);
        ev.evaluate_cycle(&s);
        let mut s = snap(6, (38, 40), (52, 55), 590);
        s.yes_last_trade_points = Some(45);
        s.no_last_trade_points = Some(55);
        let outcome = ev.evaluate_cycle(&s);
        // Armed at cycle 5 from trade ref 45 → level 40; ask 40 touches.
        assert_eq!(outcome.new_attempts.len(), 1);
        assert_eq!(outcome.new_attempts[0].reference_yes_points, 45);
        assert_eq!(outcome.new_attempts[0].reference_no_points, 55);
    }

    #[test]
    fn summary_aggregates_pair_times() {
        let mut ev = evaluator(None);
        ev.evaluate_cycle(&snap(3, (44, 46), (52, 55), 620));
        ev.evaluate_cycle(&snap(4, (37, 39), (52, 55), 610));
        ev.evaluate_cycle(&snap(5, (38, 40), (48, 50), 600));
        ev.evaluate_cycle(&snap(6, (38, 40), (46, 47), 590)); // pairs in 20s

        let now = Utc.timestamp_opt(1_770_357_600, 0).unwrap();
        let summary = ev.summary(90, 1, now);
        assert_eq!(summary.total_attempts, 1);
        assert_eq!(summary.total_pairs, 1);
        assert_eq!(summary.total_failed, 0);
        assert!((summary.pair_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(summary.avg_time_to_pair, Some(20.0));
        assert_eq!(summary.median_time_to_pair, Some(20.0));
        assert_eq!(summary.total_cycles_run, 90);
        // total_pairs + total_failed = total_attempts at finalization.
        assert_eq!(
            summary.total_pairs + summary.total_failed,
            summary.total_attempts
        );
    }
}
