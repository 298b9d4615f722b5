//! Read-only HTTP surface: health, live status, and recent measurements.
//! Everything here reads the store or the status board; nothing mutates.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use crate::db::models::{AttemptRow, MarketRow};
use crate::error::AppError;
use crate::status::StatusBoard;

#[derive(Clone)]
pub struct ApiState {
    pub pool: sqlx::SqlitePool,
    pub status: Arc<StatusBoard>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/status", get(get_status))
        .route("/attempts/recent", get(get_recent_attempts))
        .route("/markets/recent", get(get_recent_markets))
        .route("/markets/:id/attempts", get(get_market_attempts))
        .with_state(state)
}

#[derive(Deserialize)]
pub struct RecentQuery {
    pub limit: Option<i64>,
    pub status: Option<String>,
}

async fn get_health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let assets: Vec<serde_json::Value> = state
        .status
        .asset_statuses()
        .into_iter()
        .map(|(asset, s)| {
            serde_json::json!({
                "asset": asset,
                "phase": s.phase,
                "market_id": s.market_id,
                "stream_connected": s.stream_connected,
            })
        })
        .collect();

    Json(serde_json::json!({
        "status": "ok",
        "write_queue_depth": state.status.write_queue_depth.load(Ordering::Relaxed),
        "assets": assets,
    }))
}

async fn get_status(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let assets: Vec<serde_json::Value> = state
        .status
        .asset_statuses()
        .into_iter()
        .map(|(asset, s)| serde_json::json!({ "asset": asset, "state": s }))
        .collect();

    Json(serde_json::json!({
        "assets": assets,
        "recent_anomalies": state.status.recent_anomalies(),
    }))
}

async fn get_recent_attempts(
    State(state): State<ApiState>,
    Query(params): Query<RecentQuery>,
) -> Result<Json<Vec<AttemptRow>>, AppError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);

    let rows: Vec<AttemptRow> = match &params.status {
        Some(status) => {
            sqlx::query_as(
                r#"
                SELECT attempt_id, market_id, parameter_set_id, cycle_number,
                       t1_timestamp, first_leg_side, p1_points, status,
                       t2_timestamp, time_to_pair_seconds, actual_opposite_price,
                       pair_cost_points, pair_profit_points, fail_reason,
                       had_feed_gap, closest_approach_points,
                       max_adverse_excursion_points, delta_points, s0_points,
                       stop_loss_threshold_points
                FROM attempts
                WHERE status = ?
                ORDER BY t1_timestamp DESC
                LIMIT ?
                "#,
            )
            .bind(status)
            .bind(limit)
            .fetch_all(&state.pool)
            .await?
        }
        None => {
            sqlx::query_as(
                r#"
                SELECT attempt_id, market_id, parameter_set_id, cycle_number,
                       t1_timestamp, first_leg_side, p1_points, status,
                       t2_timestamp, time_to_pair_seconds, actual_opposite_price,
                       pair_cost_points, pair_profit_points, fail_reason,
                       had_feed_gap, closest_approach_points,
                       max_adverse_excursion_points, delta_points, s0_points,
                       stop_loss_threshold_points
                FROM attempts
                ORDER BY t1_timestamp DESC
                LIMIT ?
                "#,
            )
            .bind(limit)
            .fetch_all(&state.pool)
            .await?
        }
    };

    Ok(Json(rows))
}

async fn get_market_attempts(
    State(state): State<ApiState>,
    Path(market_id): Path<String>,
) -> Result<Json<Vec<AttemptRow>>, AppError> {
    let rows: Vec<AttemptRow> = sqlx::query_as(
        r#"
        SELECT attempt_id, market_id, parameter_set_id, cycle_number,
               t1_timestamp, first_leg_side, p1_points, status,
               t2_timestamp, time_to_pair_seconds, actual_opposite_price,
               pair_cost_points, pair_profit_points, fail_reason,
               had_feed_gap, closest_approach_points,
               max_adverse_excursion_points, delta_points, s0_points,
               stop_loss_threshold_points
        FROM attempts
        WHERE market_id = ?
        ORDER BY attempt_id ASC
        "#,
    )
    .bind(&market_id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(rows))
}

async fn get_recent_markets(
    State(state): State<ApiState>,
    Query(params): Query<RecentQuery>,
) -> Result<Json<Vec<MarketRow>>, AppError> {
    let limit = params.limit.unwrap_or(20).clamp(1, 200);

    let rows: Vec<MarketRow> = sqlx::query_as(
        r#"
        SELECT market_id, crypto_asset, settlement_time, actual_settlement_time,
               total_attempts, total_pairs, total_failed, settlement_failures,
               pair_rate, avg_time_to_pair, median_time_to_pair,
               max_concurrent_attempts, total_cycles_run, anomaly_count
        FROM markets
        ORDER BY settlement_time DESC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(rows))
}
