//! Single-writer task serializing all store mutations.
//!
//! Every monitor produces `WriteCommand`s over one unbounded channel; this
//! task is the only code that touches the pool with writes. Commands are
//! applied in arrival order (FIFO per attempt and per market for free) in
//! batched transactions, flushed on a short timer or when the batch fills.
//! Terminal attempt updates are gated on `status = 'active'` so a replay or
//! retry can never double-terminate an attempt.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::config::{
    WRITER_BATCH_MAX, WRITER_BUFFER_CAP, WRITER_FLUSH_INTERVAL_MS, WRITER_MAX_FLUSH_RETRIES,
};
use crate::error::Result;
use crate::evaluator::{LifecycleRecord, RunningUpdate};
use crate::types::{Attempt, CycleSnapshot, MarketInfo, MarketSummary, ParameterSet, SamplingMode};

pub type WriterHandle = mpsc::UnboundedSender<WriteCommand>;

/// Parameter-set insert with the sampling/quality columns denormalized in.
#[derive(Debug)]
pub struct ParameterSetInsert {
    pub set: ParameterSet,
    pub sampling_mode: SamplingMode,
    pub cycle_interval_seconds: i64,
    pub cycles_per_market: i64,
    pub feed_gap_threshold_seconds: i64,
}

#[derive(Debug)]
pub enum WriteCommand {
    InsertParameterSet {
        insert: ParameterSetInsert,
        ack: oneshot::Sender<i64>,
    },
    UpsertMarket {
        market: MarketInfo,
        parameter_set_id: i64,
        start_time: DateTime<Utc>,
        time_remaining_at_start: i64,
        cycle_interval_seconds: i64,
    },
    InsertAttempt(Attempt),
    UpdateAttemptRunning(RunningUpdate),
    UpdateAttemptTerminal(Attempt),
    InsertSnapshot(CycleSnapshot),
    InsertLifecycle(LifecycleRecord),
    /// Settlement: bulk-fail the still-active attempts and write the market
    /// summary inside one transaction, then resolve the ack.
    FinalizeMarket {
        summary: MarketSummary,
        failed: Vec<Attempt>,
        ack: oneshot::Sender<()>,
    },
}

pub struct DbWriter {
    pool: SqlitePool,
    rx: mpsc::UnboundedReceiver<WriteCommand>,
    /// Approximate queue + buffer depth, exported for the health surface.
    depth_gauge: Arc<AtomicU64>,
}

impl DbWriter {
    pub fn new(
        pool: SqlitePool,
        rx: mpsc::UnboundedReceiver<WriteCommand>,
        depth_gauge: Arc<AtomicU64>,
    ) -> Self {
        Self { pool, rx, depth_gauge }
    }

    pub async fn run(mut self) {
        let mut pending: Vec<WriteCommand> = Vec::new();
        let mut flush_tick =
            tokio::time::interval(Duration::from_millis(WRITER_FLUSH_INTERVAL_MS));
        flush_tick.tick().await; // consume immediate first tick

        loop {
            self.depth_gauge.store(pending.len() as u64, Ordering::Relaxed);

            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            // Settlement needs its transaction on disk before
                            // the monitor releases the market.
                            let urgent = matches!(cmd, WriteCommand::FinalizeMarket { .. });
                            pending.push(cmd);
                            if urgent || pending.len() >= WRITER_BATCH_MAX {
                                self.flush(&mut pending).await;
                            }
                        }
                        None => {
                            // All producers gone: drain and exit.
                            if !pending.is_empty() {
                                self.flush(&mut pending).await;
                            }
                            info!("writer drained, exiting");
                            return;
                        }
                    }
                }

                _ = flush_tick.tick() => {
                    if !pending.is_empty() {
                        self.flush(&mut pending).await;
                    }
                }
            }
        }
    }

    /// Apply the batch in one transaction, retrying with bounded backoff.
    /// On persistent failure the batch is retained; overflowing the retention
    /// cap halts the process; dropping measurements silently is worse.
    async fn flush(&mut self, pending: &mut Vec<WriteCommand>) {
        let mut delay = Duration::from_millis(200);
        for retry in 0..=WRITER_MAX_FLUSH_RETRIES {
            match self.apply_batch(pending).await {
                Ok(()) => {
                    for cmd in pending.drain(..) {
                        fire_ack(cmd);
                    }
                    self.depth_gauge.store(0, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    warn!(retry, "writer flush failed: {e}");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(5));
                }
            }
        }

        error!(
            buffered = pending.len(),
            "writer could not flush after {WRITER_MAX_FLUSH_RETRIES} retries, buffering"
        );
        if pending.len() > WRITER_BUFFER_CAP {
            error!("writer buffer cap exceeded, halting to avoid silent data loss");
            std::process::exit(2);
        }
    }

    async fn apply_batch(&self, pending: &[WriteCommand]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for cmd in pending {
            apply_command(&mut tx, cmd).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Resolve any ack carried by a successfully applied command.
fn fire_ack(cmd: WriteCommand) {
    match cmd {
        WriteCommand::InsertParameterSet { insert, ack } => {
            let _ = ack.send(insert.set.parameter_set_id);
        }
        WriteCommand::FinalizeMarket { ack, .. } => {
            let _ = ack.send(());
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Statement application
// ---------------------------------------------------------------------------

async fn apply_command(tx: &mut Transaction<'_, Sqlite>, cmd: &WriteCommand) -> Result<()> {
    match cmd {
        WriteCommand::InsertParameterSet { insert, .. } => {
            insert_parameter_set(tx, insert).await
        }
        WriteCommand::UpsertMarket {
            market,
            parameter_set_id,
            start_time,
            time_remaining_at_start,
            cycle_interval_seconds,
        } => {
            upsert_market(
                tx,
                market,
                *parameter_set_id,
                *start_time,
                *time_remaining_at_start,
                *cycle_interval_seconds,
            )
            .await
        }
        WriteCommand::InsertAttempt(attempt) => insert_attempt(tx, attempt).await,
        WriteCommand::UpdateAttemptRunning(update) => update_attempt_running(tx, update).await,
        WriteCommand::UpdateAttemptTerminal(attempt) => update_attempt_terminal(tx, attempt).await,
        WriteCommand::InsertSnapshot(snapshot) => insert_snapshot(tx, snapshot).await,
        WriteCommand::InsertLifecycle(record) => insert_lifecycle(tx, record).await,
        WriteCommand::FinalizeMarket { summary, failed, .. } => {
            for attempt in failed {
                update_attempt_terminal(tx, attempt).await?;
            }
            finalize_market(tx, summary).await
        }
    }
}

fn iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// The insert carries a pre-assigned id so a batch retry cannot mint a
/// second row for the same parameter set.
async fn insert_parameter_set(
    tx: &mut Transaction<'_, Sqlite>,
    insert: &ParameterSetInsert,
) -> Result<()> {
    let set = &insert.set;
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO parameter_sets (
            parameter_set_id, name, s0_points, delta_points, pair_cap_points,
            trigger_rule, reference_price_source, sampling_mode,
            cycle_interval_seconds, cycles_per_market,
            feed_gap_threshold_seconds, stop_loss_threshold_points, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(set.parameter_set_id)
    .bind(&set.name)
    .bind(set.s0_points)
    .bind(set.delta_points)
    .bind(set.pair_cap_points())
    .bind(set.trigger_rule.to_string())
    .bind(set.reference_price_source.to_string())
    .bind(insert.sampling_mode.to_string())
    .bind(insert.cycle_interval_seconds)
    .bind(insert.cycles_per_market)
    .bind(insert.feed_gap_threshold_seconds)
    .bind(set.stop_loss_threshold_points)
    .bind(iso(Utc::now()))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_market(
    tx: &mut Transaction<'_, Sqlite>,
    market: &MarketInfo,
    parameter_set_id: i64,
    start_time: DateTime<Utc>,
    time_remaining_at_start: i64,
    cycle_interval_seconds: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO markets (
            market_id, crypto_asset, condition_id, yes_token_id, no_token_id,
            tick_size_points, start_time, settlement_time, parameter_set_id,
            time_remaining_at_start, cycle_interval_seconds
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(market_id) DO UPDATE SET
            crypto_asset = excluded.crypto_asset,
            condition_id = excluded.condition_id,
            yes_token_id = excluded.yes_token_id,
            no_token_id = excluded.no_token_id,
            tick_size_points = excluded.tick_size_points,
            start_time = excluded.start_time,
            settlement_time = excluded.settlement_time,
            parameter_set_id = excluded.parameter_set_id,
            time_remaining_at_start = excluded.time_remaining_at_start,
            cycle_interval_seconds = excluded.cycle_interval_seconds
        "#,
    )
    .bind(&market.market_id)
    .bind(&market.crypto_asset)
    .bind(&market.condition_id)
    .bind(&market.yes_token_id)
    .bind(&market.no_token_id)
    .bind(market.tick_size_points)
    .bind(iso(start_time))
    .bind(iso(market.settlement_time))
    .bind(parameter_set_id)
    .bind(time_remaining_at_start)
    .bind(cycle_interval_seconds)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_attempt(tx: &mut Transaction<'_, Sqlite>, a: &Attempt) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO attempts (
            attempt_id, market_id, parameter_set_id, cycle_number,
            t1_timestamp, first_leg_side, p1_points,
            reference_yes_points, reference_no_points, status,
            time_remaining_at_start, time_remaining_bucket,
            yes_spread_entry_points, no_spread_entry_points,
            delta_points, s0_points,
            stop_loss_threshold_points, stop_loss_price_points
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(a.attempt_id)
    .bind(&a.market_id)
    .bind(a.parameter_set_id)
    .bind(a.cycle_number)
    .bind(iso(a.t1_timestamp))
    .bind(a.first_leg_side.as_str())
    .bind(a.p1_points)
    .bind(a.reference_yes_points)
    .bind(a.reference_no_points)
    .bind(a.status.as_str())
    .bind(a.time_remaining_at_start)
    .bind(&a.time_remaining_bucket)
    .bind(a.yes_spread_entry_points)
    .bind(a.no_spread_entry_points)
    .bind(a.delta_points)
    .bind(a.s0_points)
    .bind(a.stop_loss_threshold_points)
    .bind(a.stop_loss_price_points)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn update_attempt_running(
    tx: &mut Transaction<'_, Sqlite>,
    u: &RunningUpdate,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE attempts SET
            closest_approach_points = ?,
            closest_approach_timestamp = ?,
            closest_approach_cycle_number = ?,
            max_adverse_excursion_points = ?,
            mae_timestamp = ?,
            mae_cycle_number = ?,
            had_feed_gap = ?
        WHERE attempt_id = ? AND status = 'active'
        "#,
    )
    .bind(u.closest_approach_points)
    .bind(u.closest_approach_timestamp.map(iso))
    .bind(u.closest_approach_cycle_number)
    .bind(u.max_adverse_excursion_points)
    .bind(u.mae_timestamp.map(iso))
    .bind(u.mae_cycle_number)
    .bind(u.had_feed_gap as i64)
    .bind(u.attempt_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Terminal transition, at most once: rows already terminal are untouched.
async fn update_attempt_terminal(tx: &mut Transaction<'_, Sqlite>, a: &Attempt) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE attempts SET
            status = ?,
            t2_timestamp = ?,
            t2_cycle_number = ?,
            time_to_pair_seconds = ?,
            time_remaining_at_completion = ?,
            actual_opposite_price = ?,
            pair_cost_points = ?,
            pair_profit_points = ?,
            fail_reason = ?,
            had_feed_gap = ?,
            closest_approach_points = ?,
            closest_approach_timestamp = ?,
            closest_approach_cycle_number = ?,
            max_adverse_excursion_points = ?,
            mae_timestamp = ?,
            mae_cycle_number = ?,
            yes_spread_exit_points = ?,
            no_spread_exit_points = ?
        WHERE attempt_id = ? AND status = 'active'
        "#,
    )
    .bind(a.status.as_str())
    .bind(a.t2_timestamp.map(iso))
    .bind(a.t2_cycle_number)
    .bind(a.time_to_pair_seconds)
    .bind(a.time_remaining_at_completion)
    .bind(a.actual_opposite_price)
    .bind(a.pair_cost_points)
    .bind(a.pair_profit_points)
    .bind(a.fail_reason.map(|r| r.as_str()))
    .bind(a.had_feed_gap as i64)
    .bind(a.closest_approach_points)
    .bind(a.closest_approach_timestamp.map(iso))
    .bind(a.closest_approach_cycle_number)
    .bind(a.max_adverse_excursion_points)
    .bind(a.mae_timestamp.map(iso))
    .bind(a.mae_cycle_number)
    .bind(a.yes_spread_exit_points)
    .bind(a.no_spread_exit_points)
    .bind(a.attempt_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_snapshot(tx: &mut Transaction<'_, Sqlite>, s: &CycleSnapshot) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO snapshots (
            market_id, cycle_number, timestamp,
            yes_bid_points, yes_ask_points, no_bid_points, no_ask_points,
            yes_last_trade_points, no_last_trade_points,
            time_remaining, active_attempts_count, anomaly_flag
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&s.market_id)
    .bind(s.cycle_number)
    .bind(iso(s.timestamp))
    .bind(s.yes_bid_points)
    .bind(s.yes_ask_points)
    .bind(s.no_bid_points)
    .bind(s.no_ask_points)
    .bind(s.yes_last_trade_points)
    .bind(s.no_last_trade_points)
    .bind(s.time_remaining_secs)
    .bind(s.active_attempts_count)
    .bind(s.anomaly_flag as i64)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_lifecycle(tx: &mut Transaction<'_, Sqlite>, r: &LifecycleRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO attempt_lifecycle (
            attempt_id, cycle_number, timestamp,
            opposite_ask_points, distance_to_trigger, closest_approach_so_far
        ) VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(r.attempt_id)
    .bind(r.cycle_number)
    .bind(iso(r.timestamp))
    .bind(r.opposite_ask_points)
    .bind(r.distance_to_trigger)
    .bind(r.closest_approach_so_far)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn finalize_market(tx: &mut Transaction<'_, Sqlite>, s: &MarketSummary) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE markets SET
            total_attempts = ?,
            total_pairs = ?,
            total_failed = ?,
            settlement_failures = ?,
            pair_rate = ?,
            avg_time_to_pair = ?,
            median_time_to_pair = ?,
            max_concurrent_attempts = ?,
            total_cycles_run = ?,
            anomaly_count = ?,
            actual_settlement_time = ?
        WHERE market_id = ?
        "#,
    )
    .bind(s.total_attempts)
    .bind(s.total_pairs)
    .bind(s.total_failed)
    .bind(s.settlement_failures)
    .bind(s.pair_rate)
    .bind(s.avg_time_to_pair)
    .bind(s.median_time_to_pair)
    .bind(s.max_concurrent_attempts)
    .bind(s.total_cycles_run)
    .bind(s.anomaly_count)
    .bind(iso(s.actual_settlement_time))
    .bind(&s.market_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttemptStatus, FailReason, Side, TriggerRule, ReferenceSource};
    use chrono::TimeZone;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn sample_attempt(id: i64) -> Attempt {
        let t1 = Utc.timestamp_opt(1_770_356_740, 0).unwrap();
        Attempt {
            attempt_id: id,
            market_id: "btc-updown-15m-1770356700".to_string(),
            parameter_set_id: 1,
            cycle_number: 4,
            t1_timestamp: t1,
            first_leg_side: Side::Yes,
            p1_points: 39,
            reference_yes_points: 38,
            reference_no_points: 53,
            status: AttemptStatus::Active,
            t2_timestamp: None,
            t2_cycle_number: None,
            time_to_pair_seconds: None,
            time_remaining_at_start: 610,
            time_remaining_at_completion: None,
            time_remaining_bucket: "600s+".to_string(),
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
            yes_spread_entry_points: Some(2),
            no_spread_entry_points: Some(3),
            yes_spread_exit_points: None,
            no_spread_exit_points: None,
            delta_points: 3,
            s0_points: 5,
            stop_loss_threshold_points: None,
            stop_loss_price_points: None,
        }
    }

    fn sample_market() -> MarketInfo {
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

    fn sample_ps_insert() -> ParameterSetInsert {
        ParameterSetInsert {
            set: ParameterSet {
                parameter_set_id: 1,
                name: "baseline".to_string(),
                s0_points: 5,
                delta_points: 3,
                trigger_rule: TriggerRule::AskTouch,
                reference_price_source: ReferenceSource::Midpoint,
                stop_loss_threshold_points: None,
            },
            sampling_mode: SamplingMode::FixedInterval,
            cycle_interval_seconds: 10,
            cycles_per_market: 90,
            feed_gap_threshold_seconds: 10,
        }
    }

    async fn seed(pool: &SqlitePool) {
        let mut tx = pool.begin().await.unwrap();
        insert_parameter_set(&mut tx, &sample_ps_insert()).await.unwrap();
        upsert_market(
            &mut tx,
            &sample_market(),
            1,
            Utc.timestamp_opt(1_770_356_700, 0).unwrap(),
            900,
            10,
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn terminal_update_is_idempotent() {
        let pool = test_pool().await;
        seed(&pool).await;

        let mut tx = pool.begin().await.unwrap();
        insert_attempt(&mut tx, &sample_attempt(1)).await.unwrap();
        tx.commit().await.unwrap();

        // First terminal transition: paired at 47.
        let mut paired = sample_attempt(1);
        paired.status = AttemptStatus::CompletedPaired;
        paired.actual_opposite_price = Some(47);
        paired.pair_cost_points = Some(86);
        paired.pair_profit_points = Some(14);
        paired.t2_timestamp = Some(Utc.timestamp_opt(1_770_356_760, 0).unwrap());
        paired.time_to_pair_seconds = Some(20);

        let mut tx = pool.begin().await.unwrap();
        update_attempt_terminal(&mut tx, &paired).await.unwrap();
        tx.commit().await.unwrap();

        // A replayed settlement failure must not overwrite the pair.
        let mut settled = sample_attempt(1);
        settled.status = AttemptStatus::CompletedFailed;
        settled.fail_reason = Some(FailReason::SettlementReached);

        let mut tx = pool.begin().await.unwrap();
        update_attempt_terminal(&mut tx, &settled).await.unwrap();
        tx.commit().await.unwrap();

        let (status, cost): (String, Option<i64>) = sqlx::query_as(
            "SELECT status, pair_cost_points FROM attempts WHERE attempt_id = 1",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(status, "completed_paired");
        assert_eq!(cost, Some(86));
    }

    #[tokio::test]
    async fn insert_attempt_replay_is_harmless() {
        let pool = test_pool().await;
        seed(&pool).await;

        let mut tx = pool.begin().await.unwrap();
        insert_attempt(&mut tx, &sample_attempt(7)).await.unwrap();
        insert_attempt(&mut tx, &sample_attempt(7)).await.unwrap();
        tx.commit().await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM attempts")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn finalize_groups_failures_with_summary() {
        let pool = test_pool().await;
        seed(&pool).await;

        let mut tx = pool.begin().await.unwrap();
        insert_attempt(&mut tx, &sample_attempt(1)).await.unwrap();
        insert_attempt(&mut tx, &sample_attempt(2)).await.unwrap();
        tx.commit().await.unwrap();

        let now = Utc.timestamp_opt(1_770_357_600, 0).unwrap();
        let mut failed1 = sample_attempt(1);
        failed1.status = AttemptStatus::CompletedFailed;
        failed1.fail_reason = Some(FailReason::SettlementReached);
        let mut failed2 = sample_attempt(2);
        failed2.status = AttemptStatus::CompletedFailed;
        failed2.fail_reason = Some(FailReason::SettlementReached);

        let summary = MarketSummary {
            market_id: "btc-updown-15m-1770356700".to_string(),
            total_attempts: 2,
            total_pairs: 0,
            total_failed: 2,
            settlement_failures: 2,
            pair_rate: 0.0,
            avg_time_to_pair: None,
            median_time_to_pair: None,
            max_concurrent_attempts: 2,
            total_cycles_run: 90,
            anomaly_count: 0,
            actual_settlement_time: now,
        };

        let cmd = WriteCommand::FinalizeMarket {
            summary,
            failed: vec![failed1, failed2],
            ack: oneshot::channel().0,
        };
        let mut tx = pool.begin().await.unwrap();
        apply_command(&mut tx, &cmd).await.unwrap();
        tx.commit().await.unwrap();

        let open: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM attempts WHERE status = 'active'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(open, 0);

        let (total, failures, actual): (i64, i64, Option<String>) = sqlx::query_as(
            "SELECT total_attempts, settlement_failures, actual_settlement_time
             FROM markets WHERE market_id = 'btc-updown-15m-1770356700'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(total, 2);
        assert_eq!(failures, 2);
        assert!(actual.is_some());

        // Settlement-failed rows keep cost columns null.
        let cost: Option<i64> =
            sqlx::query_scalar("SELECT pair_cost_points FROM attempts WHERE attempt_id = 1")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(cost, None);
    }

    #[tokio::test]
    async fn running_update_ignores_terminal_rows() {
        let pool = test_pool().await;
        seed(&pool).await;

        let mut tx = pool.begin().await.unwrap();
        insert_attempt(&mut tx, &sample_attempt(1)).await.unwrap();
        tx.commit().await.unwrap();

        let mut paired = sample_attempt(1);
        paired.status = AttemptStatus::CompletedPaired;
        paired.max_adverse_excursion_points = Some(4);
        let mut tx = pool.begin().await.unwrap();
        update_attempt_terminal(&mut tx, &paired).await.unwrap();
        tx.commit().await.unwrap();

        let update = RunningUpdate {
            attempt_id: 1,
            closest_approach_points: Some(1),
            closest_approach_timestamp: None,
            closest_approach_cycle_number: None,
            max_adverse_excursion_points: Some(99),
            mae_timestamp: None,
            mae_cycle_number: None,
            had_feed_gap: true,
        };
        let mut tx = pool.begin().await.unwrap();
        update_attempt_running(&mut tx, &update).await.unwrap();
        tx.commit().await.unwrap();

        let mae: Option<i64> = sqlx::query_scalar(
            "SELECT max_adverse_excursion_points FROM attempts WHERE attempt_id = 1",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(mae, Some(4));
    }
}
