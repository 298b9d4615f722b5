use serde::Deserialize;

/// A single price level in a book snapshot. Prices stay strings here;
/// exact point conversion happens when the mirror applies the event.
#[derive(Debug, Deserialize, Clone)]
pub struct WireLevel {
    pub price: String,
    pub size: String,
}

/// One entry inside the `price_changes` array. The server includes the
/// resulting best bid/ask alongside the changed level.
#[derive(Debug, Deserialize, Clone)]
pub struct PriceChangeEntry {
    pub asset_id: String,
    pub best_bid: Option<String>,
    pub best_ask: Option<String>,
}

/// Raw deserializable shape covering all market-channel messages.
/// Fields are optional because different event types carry different subsets.
#[derive(Debug, Deserialize)]
struct RawMsg {
    event_type: Option<String>,
    asset_id: Option<String>,
    asks: Option<Vec<WireLevel>>,
    bids: Option<Vec<WireLevel>>,
    price_changes: Option<Vec<PriceChangeEntry>>,
    /// `last_trade_price` only.
    price: Option<String>,
    /// `tick_size_change` only.
    new_tick_size: Option<String>,
}

/// Parsed event from a single frame object.
#[derive(Debug)]
pub enum StreamEvent {
    /// Full top-of-book snapshot for one token.
    Book {
        asset_id: String,
        bids: Vec<WireLevel>,
        asks: Vec<WireLevel>,
    },
    /// Best-bid/ask delta for one token.
    PriceChange {
        asset_id: String,
        best_bid: Option<String>,
        best_ask: Option<String>,
    },
    LastTrade {
        asset_id: String,
        price: String,
    },
    TickSizeChange {
        asset_id: String,
        new_tick_size: Option<String>,
    },
    /// Anything with an unrecognised `event_type`: counted and ignored.
    Unknown {
        kind: String,
    },
}

/// Outcome of parsing one raw text frame. Frames arrive as a single JSON
/// object or an array of objects; a frame that is neither counts as one
/// parse failure.
#[derive(Debug, Default)]
pub struct ParsedFrame {
    pub events: Vec<StreamEvent>,
    pub parse_failures: u64,
}

pub fn parse_frame(raw: &str) -> ParsedFrame {
    let msgs: Vec<RawMsg> = if raw.trim_start().starts_with('[') {
        match serde_json::from_str(raw) {
            Ok(m) => m,
            Err(_) => {
                return ParsedFrame { events: vec![], parse_failures: 1 };
            }
        }
    } else {
        match serde_json::from_str::<RawMsg>(raw) {
            Ok(m) => vec![m],
            Err(_) => {
                return ParsedFrame { events: vec![], parse_failures: 1 };
            }
        }
    };

    let mut out = ParsedFrame::default();
    for msg in msgs {
        expand_raw_msg(msg, &mut out.events);
    }
    out
}

/// A `price_change` message can carry multiple entries (one per asset), so a
/// single raw message may produce multiple events.
fn expand_raw_msg(msg: RawMsg, out: &mut Vec<StreamEvent>) {
    match msg.event_type.as_deref() {
        Some("book") => {
            if let Some(asset_id) = msg.asset_id {
                out.push(StreamEvent::Book {
                    asset_id,
                    bids: msg.bids.unwrap_or_default(),
                    asks: msg.asks.unwrap_or_default(),
                });
            }
        }
        Some("price_change") => {
            for entry in msg.price_changes.unwrap_or_default() {
                out.push(StreamEvent::PriceChange {
                    asset_id: entry.asset_id,
                    best_bid: entry.best_bid,
                    best_ask: entry.best_ask,
                });
            }
        }
        Some("last_trade_price") => {
            if let (Some(asset_id), Some(price)) = (msg.asset_id, msg.price) {
                out.push(StreamEvent::LastTrade { asset_id, price });
            }
        }
        Some("tick_size_change") => {
            if let Some(asset_id) = msg.asset_id {
                out.push(StreamEvent::TickSizeChange {
                    asset_id,
                    new_tick_size: msg.new_tick_size,
                });
            }
        }
        Some(other) => {
            out.push(StreamEvent::Unknown { kind: other.to_string() });
        }
        None => {}
    }
}

/// Build a market-channel subscription message for the initial connect.
pub fn build_initial_subscribe(asset_ids: &[String]) -> String {
    serde_json::json!({
        "assets_ids": asset_ids,
        "type": "market"
    })
    .to_string()
}

/// Mid-session subscribe/unsubscribe on an established connection.
pub fn build_operation(asset_ids: &[String], operation: &str) -> String {
    serde_json::json!({
        "assets_ids": asset_ids,
        "operation": operation
    })
    .to_string()
}
