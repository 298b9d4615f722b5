//! Row types for read paths (API surface). Timestamps come back as the
//! ISO-8601 text they were stored as.

use serde::Serialize;

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct MarketRow {
    pub market_id: String,
    pub crypto_asset: String,
    pub settlement_time: String,
    pub actual_settlement_time: Option<String>,
    pub total_attempts: i64,
    pub total_pairs: i64,
    pub total_failed: i64,
    pub settlement_failures: i64,
    pub pair_rate: Option<f64>,
    pub avg_time_to_pair: Option<f64>,
    pub median_time_to_pair: Option<f64>,
    pub max_concurrent_attempts: i64,
    pub total_cycles_run: i64,
    pub anomaly_count: i64,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct AttemptRow {
    pub attempt_id: i64,
    pub market_id: String,
    pub parameter_set_id: i64,
    pub cycle_number: i64,
    pub t1_timestamp: String,
    pub first_leg_side: String,
    pub p1_points: i64,
    pub status: String,
    pub t2_timestamp: Option<String>,
    pub time_to_pair_seconds: Option<i64>,
    pub actual_opposite_price: Option<i64>,
    pub pair_cost_points: Option<i64>,
    pub pair_profit_points: Option<i64>,
    pub fail_reason: Option<String>,
    pub had_feed_gap: i64,
    pub closest_approach_points: Option<i64>,
    pub max_adverse_excursion_points: Option<i64>,
    pub delta_points: i64,
    pub s0_points: i64,
    pub stop_loss_threshold_points: Option<i64>,
}
