use std::path::Path;

use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::types::{ParameterSet, ReferenceSource, SamplingMode, TriggerRule};

pub const WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";
pub const GAMMA_API_URL: &str = "https://gamma-api.polymarket.com";
pub const CLOB_API_URL: &str = "https://clob.polymarket.com";

/// 15-minute windows sit on 900-second boundaries; the slug timestamp is the
/// window start and settlement is start + 900.
pub const WINDOW_SECONDS: i64 = 900;

/// Cycles are never scheduled closer to settlement than this.
pub const SETTLEMENT_GRACE_SECS: u64 = 2;

/// How long a monitor waits in STARTING for the first `book` event on each
/// side before falling back to REST for initial books.
pub const BOOT_TIMEOUT_SECS: u64 = 5;

/// Writer flush cadence and batch threshold.
pub const WRITER_FLUSH_INTERVAL_MS: u64 = 250;
pub const WRITER_BATCH_MAX: usize = 64;

/// Commands retained in memory across failed flushes before the process
/// halts rather than drop measurements.
pub const WRITER_BUFFER_CAP: usize = 10_000;
pub const WRITER_MAX_FLUSH_RETRIES: u32 = 5;

/// Reconnects within `RECONNECT_STORM_WINDOW_SECS` that flip the stream to
/// degraded and tell the monitor to poll REST until the session stabilises.
pub const RECONNECT_STORM_THRESHOLD: u32 = 5;
pub const RECONNECT_STORM_WINDOW_SECS: u64 = 120;

/// Per-request timeout for the REST polling fallback.
pub const REST_REQUEST_TIMEOUT_SECS: u64 = 5;

/// Status log cadence (seconds) and rotation pre-discovery tick.
pub const STATUS_INTERVAL_SECS: u64 = 30;
pub const ROTATION_TICK_SECS: u64 = 10;

/// Discovery retry settings when no market is found for an asset.
pub const MAX_DISCOVERY_RETRIES: u32 = 40;
pub const DISCOVERY_RETRY_BASE_DELAY_SECS: u64 = 2;

// ---------------------------------------------------------------------------
// Process environment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub log_level: String,
    pub api_port: u16,
    pub config_path: String,
    pub enable_snapshots: bool,
    pub enable_lifecycle: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "data/pairscope.db".to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            config_path: std::env::var("CONFIG_PATH").unwrap_or_else(|_| "pairscope.toml".to_string()),
            enable_snapshots: env_flag("ENABLE_SNAPSHOTS"),
            enable_lifecycle: env_flag("ENABLE_LIFECYCLE"),
        })
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

// ---------------------------------------------------------------------------
// Measurement configuration (TOML file)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MeasurementConfig {
    pub parameter_sets: Vec<ParameterSetConfig>,
    pub sampling: SamplingConfig,
    pub markets: MarketsConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParameterSetConfig {
    pub name: String,
    pub s0_points: i64,
    pub delta_points: i64,
    #[serde(default = "default_trigger_rule")]
    pub trigger_rule: TriggerRule,
    #[serde(default = "default_reference_source")]
    pub reference_price_source: ReferenceSource,
    #[serde(default)]
    pub stop_loss_threshold_points: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamplingConfig {
    pub mode: SamplingMode,
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_seconds: u64,
    #[serde(default = "default_cycles_per_market")]
    pub cycles_per_market: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketsConfig {
    pub crypto_assets: Vec<String>,
    #[serde(default = "default_market_type")]
    pub market_type: String,
    #[serde(default = "default_discovery_poll")]
    pub discovery_poll_interval_seconds: u64,
    #[serde(default = "default_pre_discovery_lead")]
    pub pre_discovery_lead_seconds: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QualityConfig {
    #[serde(default = "default_feed_gap_threshold")]
    pub feed_gap_threshold_seconds: u64,
    #[serde(default = "default_ref_sum_deviation")]
    pub max_reference_sum_deviation: i64,
    #[serde(default = "default_max_anomalies")]
    pub max_anomalies_per_market: i64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            feed_gap_threshold_seconds: default_feed_gap_threshold(),
            max_reference_sum_deviation: default_ref_sum_deviation(),
            max_anomalies_per_market: default_max_anomalies(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_ws_url")]
    pub url: String,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_seconds: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: default_ws_url(),
            heartbeat_interval_seconds: default_heartbeat(),
            reconnect_max_delay_seconds: default_reconnect_max_delay(),
        }
    }
}

fn default_trigger_rule() -> TriggerRule {
    TriggerRule::AskTouch
}
fn default_reference_source() -> ReferenceSource {
    ReferenceSource::Midpoint
}
fn default_cycle_interval() -> u64 {
    10
}
fn default_cycles_per_market() -> u32 {
    90
}
fn default_market_type() -> String {
    "15m".to_string()
}
fn default_discovery_poll() -> u64 {
    60
}
fn default_pre_discovery_lead() -> i64 {
    120
}
fn default_feed_gap_threshold() -> u64 {
    10
}
fn default_ref_sum_deviation() -> i64 {
    2
}
fn default_max_anomalies() -> i64 {
    50
}
fn default_ws_url() -> String {
    WS_URL.to_string()
}
fn default_heartbeat() -> u64 {
    30
}
fn default_reconnect_max_delay() -> u64 {
    60
}

impl MeasurementConfig {
    pub fn load(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            return Err(AppError::Config(format!("config file not found: {path}")));
        }
        let raw = std::fs::read_to_string(path)?;
        let cfg: MeasurementConfig = toml::from_str(&raw)
            .map_err(|e| AppError::Config(format!("failed to parse {path}: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.parameter_sets.is_empty() {
            errors.push("at least one parameter set is required".to_string());
        }
        for ps in &self.parameter_sets {
            if !(1..=49).contains(&ps.s0_points) {
                errors.push(format!("{}: s0_points must be in [1, 49], got {}", ps.name, ps.s0_points));
            }
            if !(1..=49).contains(&ps.delta_points) {
                errors.push(format!("{}: delta_points must be in [1, 49], got {}", ps.name, ps.delta_points));
            }
            if let Some(sl) = ps.stop_loss_threshold_points {
                if sl <= 0 {
                    errors.push(format!("{}: stop_loss_threshold_points must be positive, got {sl}", ps.name));
                }
            }
        }

        if self.sampling.cycle_interval_seconds == 0 {
            errors.push("cycle_interval_seconds must be > 0".to_string());
        }
        if self.sampling.cycles_per_market == 0 {
            errors.push("cycles_per_market must be > 0".to_string());
        }
        if self.markets.crypto_assets.is_empty() {
            errors.push("at least one crypto asset is required".to_string());
        }
        if self.quality.feed_gap_threshold_seconds == 0 {
            errors.push("feed_gap_threshold_seconds must be > 0".to_string());
        }
        if self.websocket.heartbeat_interval_seconds == 0 {
            errors.push("heartbeat_interval_seconds must be > 0".to_string());
        }
        if self.websocket.reconnect_max_delay_seconds == 0 {
            errors.push("reconnect_max_delay_seconds must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::Config(errors.join("; ")))
        }
    }

    /// Build runtime parameter sets (ids are assigned by the store later).
    pub fn parameter_sets(&self) -> Vec<ParameterSet> {
        self.parameter_sets
            .iter()
            .map(|ps| ParameterSet {
                parameter_set_id: 0,
                name: ps.name.clone(),
                s0_points: ps.s0_points,
                delta_points: ps.delta_points,
                trigger_rule: ps.trigger_rule,
                reference_price_source: ps.reference_price_source,
                stop_loss_threshold_points: ps.stop_loss_threshold_points,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[parameter_sets]]
        name = "baseline"
        s0_points = 5
        delta_points = 3

        [[parameter_sets]]
        name = "tight-stop"
        s0_points = 5
        delta_points = 3
        stop_loss_threshold_points = 2

        [sampling]
        mode = "FIXED_INTERVAL"
        cycle_interval_seconds = 10

        [markets]
        crypto_assets = ["btc", "eth"]
    "#;

    #[test]
    fn parses_sample_config() {
        let cfg: MeasurementConfig = toml::from_str(SAMPLE).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.parameter_sets.len(), 2);
        assert_eq!(cfg.parameter_sets[0].trigger_rule, TriggerRule::AskTouch);
        assert_eq!(cfg.parameter_sets[1].stop_loss_threshold_points, Some(2));
        assert_eq!(cfg.sampling.mode, SamplingMode::FixedInterval);
        assert_eq!(cfg.markets.market_type, "15m");
        assert_eq!(cfg.quality.feed_gap_threshold_seconds, 10);
        assert_eq!(cfg.websocket.heartbeat_interval_seconds, 30);
    }

    #[test]
    fn rejects_out_of_range_params() {
        let raw = r#"
            [[parameter_sets]]
            name = "bad"
            s0_points = 0
            delta_points = 50

            [sampling]
            mode = "FIXED_COUNT"

            [markets]
            crypto_assets = ["btc"]
        "#;
        let cfg: MeasurementConfig = toml::from_str(raw).unwrap();
        assert!(cfg.validate().is_err());
    }
}
