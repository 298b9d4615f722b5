use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Sides and statuses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Yes => Side::No,
            Side::No => Side::Yes,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Yes => "YES",
            Side::No => "NO",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Active,
    CompletedPaired,
    CompletedFailed,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::Active => "active",
            AttemptStatus::CompletedPaired => "completed_paired",
            AttemptStatus::CompletedFailed => "completed_failed",
        }
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    SettlementReached,
    StopLoss,
    BotShutdown,
}

impl FailReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailReason::SettlementReached => "settlement_reached",
            FailReason::StopLoss => "stop_loss",
            FailReason::BotShutdown => "bot_shutdown",
        }
    }
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Measurement parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerRule {
    #[serde(rename = "ASK_TOUCH")]
    AskTouch,
}

impl std::fmt::Display for TriggerRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerRule::AskTouch => write!(f, "ASK_TOUCH"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceSource {
    #[serde(rename = "MIDPOINT")]
    Midpoint,
    #[serde(rename = "LAST_TRADE")]
    LastTrade,
}

impl std::fmt::Display for ReferenceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReferenceSource::Midpoint => write!(f, "MIDPOINT"),
            ReferenceSource::LastTrade => write!(f, "LAST_TRADE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplingMode {
    #[serde(rename = "FIXED_INTERVAL")]
    FixedInterval,
    #[serde(rename = "FIXED_COUNT")]
    FixedCount,
}

impl std::fmt::Display for SamplingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SamplingMode::FixedInterval => write!(f, "FIXED_INTERVAL"),
            SamplingMode::FixedCount => write!(f, "FIXED_COUNT"),
        }
    }
}

/// Immutable measurement parameter snapshot. Inserted once at startup;
/// markets and attempts reference it by id.
#[derive(Debug, Clone)]
pub struct ParameterSet {
    /// Assigned by the store on insert; 0 until then.
    pub parameter_set_id: i64,
    pub name: String,
    pub s0_points: i64,
    pub delta_points: i64,
    pub trigger_rule: TriggerRule,
    pub reference_price_source: ReferenceSource,
    pub stop_loss_threshold_points: Option<i64>,
}

impl ParameterSet {
    /// PairCap = 100 − δ: the maximum combined cost for a qualifying pair.
    pub fn pair_cap_points(&self) -> i64 {
        100 - self.delta_points
    }
}

// ---------------------------------------------------------------------------
// Markets
// ---------------------------------------------------------------------------

/// Metadata for one discovered 15-minute window.
#[derive(Debug, Clone)]
pub struct MarketInfo {
    /// Stable key, e.g. `btc-updown-15m-1770356700` (the event slug).
    pub market_id: String,
    pub condition_id: String,
    pub crypto_asset: String,
    /// 60+ digit opaque string, never parsed as an integer.
    pub yes_token_id: String,
    pub no_token_id: String,
    pub tick_size_points: i64,
    pub settlement_time: DateTime<Utc>,
    pub active: bool,
    pub accepting_orders: bool,
}

impl MarketInfo {
    pub fn time_remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.settlement_time - now).num_seconds()
    }
}

/// Final per-market statistics written at settlement.
#[derive(Debug, Clone)]
pub struct MarketSummary {
    pub market_id: String,
    pub total_attempts: i64,
    pub total_pairs: i64,
    pub total_failed: i64,
    pub settlement_failures: i64,
    pub pair_rate: f64,
    pub avg_time_to_pair: Option<f64>,
    pub median_time_to_pair: Option<f64>,
    pub max_concurrent_attempts: i64,
    pub total_cycles_run: i64,
    pub anomaly_count: i64,
    pub actual_settlement_time: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Attempts
// ---------------------------------------------------------------------------

/// One measurement life: a first-leg trigger tracked until pair, stop-loss,
/// or settlement. This struct is the persisted shape; the evaluator wraps it
/// with in-memory-only trigger state while the attempt is active.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub attempt_id: i64,
    pub market_id: String,
    pub parameter_set_id: i64,
    pub cycle_number: i64,
    pub t1_timestamp: DateTime<Utc>,
    pub first_leg_side: Side,
    pub p1_points: i64,
    pub reference_yes_points: i64,
    pub reference_no_points: i64,
    pub status: AttemptStatus,
    pub t2_timestamp: Option<DateTime<Utc>>,
    pub t2_cycle_number: Option<i64>,
    pub time_to_pair_seconds: Option<i64>,
    pub time_remaining_at_start: i64,
    pub time_remaining_at_completion: Option<i64>,
    pub time_remaining_bucket: String,
    pub actual_opposite_price: Option<i64>,
    pub pair_cost_points: Option<i64>,
    pub pair_profit_points: Option<i64>,
    pub fail_reason: Option<FailReason>,
    pub had_feed_gap: bool,
    pub closest_approach_points: Option<i64>,
    pub closest_approach_timestamp: Option<DateTime<Utc>>,
    pub closest_approach_cycle_number: Option<i64>,
    pub max_adverse_excursion_points: Option<i64>,
    pub mae_timestamp: Option<DateTime<Utc>>,
    pub mae_cycle_number: Option<i64>,
    pub yes_spread_entry_points: Option<i64>,
    pub no_spread_entry_points: Option<i64>,
    pub yes_spread_exit_points: Option<i64>,
    pub no_spread_exit_points: Option<i64>,
    pub delta_points: i64,
    pub s0_points: i64,
    pub stop_loss_threshold_points: Option<i64>,
    pub stop_loss_price_points: Option<i64>,
}

/// Bucket label for time remaining at attempt entry.
pub fn time_remaining_bucket(secs: i64) -> &'static str {
    if secs > 600 {
        "600s+"
    } else if secs > 300 {
        "300-600s"
    } else if secs > 120 {
        "120-300s"
    } else {
        "0-120s"
    }
}

// ---------------------------------------------------------------------------
// Cycle snapshot
// ---------------------------------------------------------------------------

/// Both sides of the book read atomically at a cycle instant.
/// `None` means the side is empty, crossed, or stale; the evaluator
/// treats all three as "empty-side" and skips the cycle.
#[derive(Debug, Clone)]
pub struct CycleSnapshot {
    pub market_id: String,
    pub cycle_number: i64,
    pub timestamp: DateTime<Utc>,
    pub yes_bid_points: Option<i64>,
    pub yes_ask_points: Option<i64>,
    pub no_bid_points: Option<i64>,
    pub no_ask_points: Option<i64>,
    pub yes_last_trade_points: Option<i64>,
    pub no_last_trade_points: Option<i64>,
    pub time_remaining_secs: i64,
    pub active_attempts_count: i64,
    pub anomaly_flag: bool,
}

impl CycleSnapshot {
    pub fn bid(&self, side: Side) -> Option<i64> {
        match side {
            Side::Yes => self.yes_bid_points,
            Side::No => self.no_bid_points,
        }
    }

    pub fn ask(&self, side: Side) -> Option<i64> {
        match side {
            Side::Yes => self.yes_ask_points,
            Side::No => self.no_ask_points,
        }
    }

    pub fn last_trade(&self, side: Side) -> Option<i64> {
        match side {
            Side::Yes => self.yes_last_trade_points,
            Side::No => self.no_last_trade_points,
        }
    }

    pub fn spread(&self, side: Side) -> Option<i64> {
        Some(self.ask(side)? - self.bid(side)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_opposite() {
        assert_eq!(Side::Yes.opposite(), Side::No);
        assert_eq!(Side::No.opposite(), Side::Yes);
    }

    #[test]
    fn pair_cap_complements_delta() {
        let ps = ParameterSet {
            parameter_set_id: 1,
            name: "baseline".to_string(),
            s0_points: 5,
            delta_points: 3,
            trigger_rule: TriggerRule::AskTouch,
            reference_price_source: ReferenceSource::Midpoint,
            stop_loss_threshold_points: None,
        };
        assert_eq!(ps.pair_cap_points(), 97);
        assert_eq!(ps.pair_cap_points() + ps.delta_points, 100);
    }

    #[test]
    fn bucket_boundaries() {
        assert_eq!(time_remaining_bucket(700), "600s+");
        assert_eq!(time_remaining_bucket(600), "300-600s");
        assert_eq!(time_remaining_bucket(301), "300-600s");
        assert_eq!(time_remaining_bucket(300), "120-300s");
        assert_eq!(time_remaining_bucket(121), "120-300s");
        assert_eq!(time_remaining_bucket(120), "0-120s");
        assert_eq!(time_remaining_bucket(0), "0-120s");
    }
}
