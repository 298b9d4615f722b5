//! Gamma catalog client: finds the live 15-minute up/down event for an
//! asset. Event slugs follow `{asset}-updown-{type}-{unix}` where the
//! timestamp is the window start; settlement = start + 900 s. The fast path
//! queries the exact slug for the current window (then the adjacent ones);
//! a broad search over open events is the fallback.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::WINDOW_SECONDS;
use crate::error::Result;
use crate::points::{price_to_points, MAX_TRIGGER_POINTS};
use crate::types::MarketInfo;

pub struct MarketDiscovery {
    http: reqwest::Client,
    base_url: String,
}

impl MarketDiscovery {
    pub fn new(base_url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http, base_url })
    }

    /// Find the currently active market for an asset: exact slug for the
    /// current window first, then the next and previous windows, then a
    /// broad search.
    pub async fn find_active_market(
        &self,
        asset: &str,
        market_type: &str,
    ) -> Result<Option<MarketInfo>> {
        let now = Utc::now().timestamp();
        let window_start = now - now.rem_euclid(WINDOW_SECONDS);

        for ts in [window_start, window_start + WINDOW_SECONDS, window_start - WINDOW_SECONDS] {
            let slug = window_slug(asset, market_type, ts);
            if let Some(market) = self.find_market_by_slug(&slug, asset).await? {
                return Ok(Some(market));
            }
        }

        info!(asset, "direct slug lookup missed, trying broad search");
        self.search_events_broadly(asset, market_type).await
    }

    /// Look up one event by its exact slug. Used for targeted successor
    /// discovery where the expected window timestamp is already known.
    pub async fn find_market_by_slug(&self, slug: &str, asset: &str) -> Result<Option<MarketInfo>> {
        let url = format!("{}/events", self.base_url);
        let resp = self.http.get(&url).query(&[("slug", slug)]).send().await?;
        if !resp.status().is_success() {
            warn!(slug, status = %resp.status(), "gamma slug query failed");
            return Ok(None);
        }

        let events: Vec<serde_json::Value> = resp.json().await?;
        let Some(event) = events.first() else {
            return Ok(None);
        };
        if event.get("closed").and_then(|c| c.as_bool()).unwrap_or(false) {
            debug!(slug, "event is closed, skipping");
            return Ok(None);
        }

        Ok(parse_event(event, asset))
    }

    /// Search open events ordered by start date and pick the one whose
    /// window contains now, falling back to the soonest upcoming.
    async fn search_events_broadly(
        &self,
        asset: &str,
        market_type: &str,
    ) -> Result<Option<MarketInfo>> {
        let url = format!(
            "{}/events?closed=false&limit=100&order=startDate&ascending=true",
            self.base_url
        );
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            warn!(status = %resp.status(), "gamma broad search failed");
            return Ok(None);
        }
        let events: Vec<serde_json::Value> = resp.json().await?;

        let pattern = format!("{asset}-updown-{market_type}");
        let now = Utc::now();
        let mut best: Option<MarketInfo> = None;

        for event in &events {
            let slug = event.get("slug").and_then(|s| s.as_str()).unwrap_or("");
            if !slug.contains(&pattern) {
                continue;
            }
            if event.get("closed").and_then(|c| c.as_bool()).unwrap_or(false) {
                continue;
            }
            let Some(market) = parse_event(event, asset) else {
                continue;
            };

            let start = event
                .get("startTime")
                .and_then(|s| s.as_str())
                .and_then(parse_iso);
            if let Some(start) = start {
                if start <= now && now < market.settlement_time {
                    return Ok(Some(market)); // currently live
                }
            }
            if best
                .as_ref()
                .map_or(true, |b| market.settlement_time < b.settlement_time)
            {
                best = Some(market);
            }
        }

        match &best {
            Some(m) => info!(market_id = %m.market_id, "broad search found upcoming market"),
            None => info!(asset, "no active market found in broad search"),
        }
        Ok(best)
    }
}

/// Expected event slug for the window starting at `window_start`.
pub fn window_slug(asset: &str, market_type: &str, window_start: i64) -> String {
    format!("{asset}-updown-{market_type}-{window_start}")
}

/// Window-start timestamp encoded in a slug, if any.
pub fn slug_timestamp(slug: &str) -> Option<i64> {
    slug.rsplit('-').next().and_then(|s| s.parse().ok())
}

/// Parse a Gamma event (with its nested binary market) into `MarketInfo`.
pub fn parse_event(event: &serde_json::Value, asset: &str) -> Option<MarketInfo> {
    let slug = event.get("slug").and_then(|s| s.as_str())?.to_string();

    let market = event.get("markets").and_then(|m| m.as_array())?.first()?;
    let condition_id = market
        .get("conditionId")
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string();

    let (yes_token_id, no_token_id) = extract_token_ids(market, &slug)?;

    let settlement_time = settlement_time(event, market, &slug)?;
    if settlement_time <= Utc::now() {
        debug!(slug, "event already settled");
        return None;
    }

    // Resolved markets sometimes report a 0.001 tick; live ones use 0.01.
    // Floor to one point and keep it inside the trigger domain.
    let tick_raw = market
        .get("orderPriceMinTickSize")
        .map(json_to_string)
        .unwrap_or_else(|| "0.01".to_string());
    let tick_size_points = price_to_points(&tick_raw)
        .unwrap_or(1)
        .clamp(1, MAX_TRIGGER_POINTS);

    let closed = market.get("closed").and_then(|c| c.as_bool()).unwrap_or(false);
    let accepting = market
        .get("acceptingOrders")
        .and_then(|a| a.as_bool())
        .unwrap_or(false);

    let info = MarketInfo {
        market_id: slug.clone(),
        condition_id,
        crypto_asset: asset.to_string(),
        yes_token_id,
        no_token_id,
        tick_size_points,
        settlement_time,
        active: !closed,
        accepting_orders: accepting,
    };

    info!(
        market_id = %info.market_id,
        settlement = %settlement_time.format("%H:%M:%S UTC"),
        tick = tick_size_points,
        accepting,
        "discovered market"
    );
    Some(info)
}

/// Settlement time: event endDate, then market endDateIso, then the slug
/// timestamp plus the window length.
fn settlement_time(
    event: &serde_json::Value,
    market: &serde_json::Value,
    slug: &str,
) -> Option<DateTime<Utc>> {
    for field in [event.get("endDate"), market.get("endDateIso")] {
        if let Some(s) = field.and_then(|v| v.as_str()) {
            if s.contains('T') {
                if let Some(dt) = parse_iso(s) {
                    return Some(dt);
                }
            }
        }
    }

    if let Some(ts) = slug_timestamp(slug) {
        return DateTime::from_timestamp(ts + WINDOW_SECONDS, 0);
    }

    warn!(slug, "could not determine settlement time");
    None
}

/// YES ("Up") and NO ("Down") token ids from `clobTokenIds` + `outcomes`.
/// Both arrive as JSON-encoded string arrays; ids must round-trip as
/// strings, never as integers.
fn extract_token_ids(market: &serde_json::Value, slug: &str) -> Option<(String, String)> {
    let ids: Vec<String> = parse_json_array(market.get("clobTokenIds")?)?;
    let outcomes: Vec<String> = parse_json_array(market.get("outcomes")?)?;

    let mut yes = None;
    let mut no = None;
    for (token_id, outcome) in ids.iter().zip(outcomes.iter()) {
        if outcome.eq_ignore_ascii_case("up") || outcome.eq_ignore_ascii_case("yes") {
            yes = Some(token_id.clone());
        } else if outcome.eq_ignore_ascii_case("down") || outcome.eq_ignore_ascii_case("no") {
            no = Some(token_id.clone());
        }
    }

    match (yes, no) {
        (Some(y), Some(n)) => Some((y, n)),
        _ => {
            warn!(slug, "could not extract Up/Down token ids");
            None
        }
    }
}

fn parse_json_array(value: &serde_json::Value) -> Option<Vec<String>> {
    match value {
        serde_json::Value::String(s) => serde_json::from_str(s).ok(),
        serde_json::Value::Array(items) => {
            Some(items.iter().map(json_to_string).collect())
        }
        _ => None,
    }
}

fn json_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(end_date: &str) -> serde_json::Value {
        serde_json::json!({
            "slug": "btc-updown-15m-1970356700",
            "startTime": "2032-06-05T14:30:00Z",
            "endDate": end_date,
            "closed": false,
            "markets": [{
                "conditionId": "0xabc123",
                "clobTokenIds": "[\"714390458191477260711725133713\", \"714390458191477260711725133714\"]",
                "outcomes": "[\"Up\", \"Down\"]",
                "orderPriceMinTickSize": 0.01,
                "acceptingOrders": true,
                "closed": false
            }]
        })
    }

    #[test]
    fn parses_event_into_market_info() {
        let event = sample_event("2032-06-05T14:45:00Z");
        let market = parse_event(&event, "btc").unwrap();
        assert_eq!(market.market_id, "btc-updown-15m-1970356700");
        assert_eq!(market.condition_id, "0xabc123");
        assert_eq!(market.yes_token_id, "714390458191477260711725133713");
        assert_eq!(market.no_token_id, "714390458191477260711725133714");
        assert_eq!(market.tick_size_points, 1);
        assert!(market.active);
        assert!(market.accepting_orders);
    }

    #[test]
    fn token_ids_follow_outcome_order_not_position() {
        let mut event = sample_event("2032-06-05T14:45:00Z");
        event["markets"][0]["outcomes"] =
            serde_json::Value::String("[\"Down\", \"Up\"]".to_string());
        let market = parse_event(&event, "btc").unwrap();
        assert_eq!(market.yes_token_id, "714390458191477260711725133714");
        assert_eq!(market.no_token_id, "714390458191477260711725133713");
    }

    #[test]
    fn sub_point_tick_is_floored_to_one() {
        let mut event = sample_event("2032-06-05T14:45:00Z");
        event["markets"][0]["orderPriceMinTickSize"] =
            serde_json::Value::String("0.001".to_string());
        let market = parse_event(&event, "btc").unwrap();
        assert_eq!(market.tick_size_points, 1);
    }

    #[test]
    fn settlement_falls_back_to_slug_timestamp() {
        let mut event = sample_event("2032-06-05");
        event["markets"][0]["endDateIso"] = serde_json::Value::String("2032-06-05".to_string());
        let market = parse_event(&event, "btc").unwrap();
        assert_eq!(
            market.settlement_time.timestamp(),
            1_970_356_700 + WINDOW_SECONDS
        );
    }

    #[test]
    fn settled_event_is_skipped() {
        let event = sample_event("2020-01-01T00:15:00Z");
        assert!(parse_event(&event, "btc").is_none());
    }

    #[test]
    fn slug_math_round_trips() {
        let slug = window_slug("btc", "15m", 1_770_356_700);
        assert_eq!(slug, "btc-updown-15m-1770356700");
        assert_eq!(slug_timestamp(&slug), Some(1_770_356_700));
        assert_eq!(slug_timestamp("garbage"), None);
    }
}
