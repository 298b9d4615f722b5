use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::points::{price_to_points, PointsError};
use crate::ws::messages::WireLevel;

// ---------------------------------------------------------------------------
// TokenBook
// ---------------------------------------------------------------------------

/// Top-of-book state for one token, updated from streaming events.
#[derive(Debug, Default)]
struct TokenBook {
    best_bid: Option<i64>,
    best_ask: Option<i64>,
    best_bid_size: Option<String>,
    best_ask_size: Option<String>,
    last_trade: Option<i64>,
    last_event: Option<Instant>,
}

/// Immutable read of one side at a cycle instant.
///
/// A crossed book (bid > ask) is reported as empty on both price fields so
/// the evaluator sees "empty-side" and skips the cycle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopOfBook {
    pub bid: Option<i64>,
    pub ask: Option<i64>,
    pub bid_size: Option<String>,
    pub ask_size: Option<String>,
    pub last_trade: Option<i64>,
    pub age_ms: Option<u128>,
}

impl TopOfBook {
    pub fn is_fresh(&self, threshold: Duration) -> bool {
        match self.age_ms {
            Some(age) => age <= threshold.as_millis(),
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// BookMirror
// ---------------------------------------------------------------------------

/// Order-book mirror for the tokens one monitor subscribes to.
/// Written by the stream reader task, read by the cycle loop.
#[derive(Debug, Default)]
pub struct BookMirror {
    books: DashMap<String, TokenBook>,
}

impl BookMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, asset_id: &str) {
        self.books.entry(asset_id.to_string()).or_default();
    }

    /// Apply a full book snapshot: best bid = highest bid level, best ask =
    /// lowest ask level. A malformed price leaves the book untouched and
    /// marks it stale.
    pub fn apply_book(
        &self,
        asset_id: &str,
        bids: &[WireLevel],
        asks: &[WireLevel],
    ) -> Result<(), PointsError> {
        let (best_bid, best_bid_size) = match best_level(bids, true) {
            Ok(v) => v,
            Err(e) => {
                self.mark_stale(asset_id);
                return Err(e);
            }
        };
        let (best_ask, best_ask_size) = match best_level(asks, false) {
            Ok(v) => v,
            Err(e) => {
                self.mark_stale(asset_id);
                return Err(e);
            }
        };

        let mut book = self.books.entry(asset_id.to_string()).or_default();
        book.best_bid = best_bid;
        book.best_bid_size = best_bid_size;
        book.best_ask = best_ask;
        book.best_ask_size = best_ask_size;
        book.last_event = Some(Instant::now());
        Ok(())
    }

    /// Apply a best-bid/ask delta from a `price_change` event.
    pub fn apply_price_change(
        &self,
        asset_id: &str,
        best_bid: Option<&str>,
        best_ask: Option<&str>,
    ) -> Result<(), PointsError> {
        let bid = match best_bid {
            Some(raw) => match price_to_points(raw) {
                Ok(p) => Some(p),
                Err(e) => {
                    self.mark_stale(asset_id);
                    return Err(e);
                }
            },
            None => None,
        };
        let ask = match best_ask {
            Some(raw) => match price_to_points(raw) {
                Ok(p) => Some(p),
                Err(e) => {
                    self.mark_stale(asset_id);
                    return Err(e);
                }
            },
            None => None,
        };

        let mut book = self.books.entry(asset_id.to_string()).or_default();
        if bid.is_some() {
            book.best_bid = bid;
        }
        if ask.is_some() {
            book.best_ask = ask;
        }
        book.last_event = Some(Instant::now());
        Ok(())
    }

    pub fn apply_last_trade(&self, asset_id: &str, price: &str) -> Result<(), PointsError> {
        let points = match price_to_points(price) {
            Ok(p) => p,
            Err(e) => {
                self.mark_stale(asset_id);
                return Err(e);
            }
        };
        let mut book = self.books.entry(asset_id.to_string()).or_default();
        book.last_trade = Some(points);
        book.last_event = Some(Instant::now());
        Ok(())
    }

    /// Drop the freshness timestamp so the next snapshot reads as stale.
    pub fn mark_stale(&self, asset_id: &str) {
        if let Some(mut book) = self.books.get_mut(asset_id) {
            book.last_event = None;
        }
    }

    /// Read one side. Crossed books come back with both price fields empty.
    pub fn top(&self, asset_id: &str) -> TopOfBook {
        let Some(book) = self.books.get(asset_id) else {
            return TopOfBook::default();
        };
        book_top(&book)
    }

    /// Read both sides while holding both entries, so the stream task cannot
    /// interleave an update between the two reads.
    pub fn pair_top(&self, yes_asset_id: &str, no_asset_id: &str) -> (TopOfBook, TopOfBook) {
        let yes_guard = self.books.get(yes_asset_id);
        let no_guard = self.books.get(no_asset_id);
        let yes = yes_guard.as_deref().map(book_top).unwrap_or_default();
        let no = no_guard.as_deref().map(book_top).unwrap_or_default();
        (yes, no)
    }

    /// True once both sides have a bid and an ask (STARTING → ACTIVE gate).
    pub fn both_sides_ready(&self, yes_asset_id: &str, no_asset_id: &str) -> bool {
        let yes = self.top(yes_asset_id);
        let no = self.top(no_asset_id);
        yes.bid.is_some() && yes.ask.is_some() && no.bid.is_some() && no.ask.is_some()
    }
}

fn book_top(book: &TokenBook) -> TopOfBook {
    let crossed = matches!((book.best_bid, book.best_ask), (Some(b), Some(a)) if b > a);
    let age_ms = book.last_event.map(|t| t.elapsed().as_millis());
    // No freshness timestamp means the book was never hydrated or was
    // poisoned by malformed input: both cases read as empty sides.
    if crossed || age_ms.is_none() {
        TopOfBook {
            last_trade: book.last_trade,
            age_ms,
            ..TopOfBook::default()
        }
    } else {
        TopOfBook {
            bid: book.best_bid,
            ask: book.best_ask,
            bid_size: book.best_bid_size.clone(),
            ask_size: book.best_ask_size.clone(),
            last_trade: book.last_trade,
            age_ms,
        }
    }
}

/// Pick the best level of a side: highest price for bids, lowest for asks.
/// Empty side yields `(None, None)`.
fn best_level(
    levels: &[WireLevel],
    is_bid: bool,
) -> Result<(Option<i64>, Option<String>), PointsError> {
    let mut best: Option<(i64, &WireLevel)> = None;
    for level in levels {
        let points = price_to_points(&level.price)?;
        let better = match best {
            None => true,
            Some((bp, _)) => {
                if is_bid {
                    points > bp
                } else {
                    points < bp
                }
            }
        };
        if better {
            best = Some((points, level));
        }
    }
    Ok(match best {
        Some((points, level)) => (Some(points), Some(level.size.clone())),
        None => (None, None),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lvl(price: &str, size: &str) -> WireLevel {
        WireLevel { price: price.to_string(), size: size.to_string() }
    }

    #[test]
    fn book_snapshot_picks_best_levels() {
        let mirror = BookMirror::new();
        mirror
            .apply_book(
                "tok1",
                &[lvl("0.54", "200"), lvl("0.50", "75")],
                &[lvl("0.55", "100"), lvl("0.60", "50")],
            )
            .unwrap();

        let top = mirror.top("tok1");
        assert_eq!(top.bid, Some(54));
        assert_eq!(top.ask, Some(55));
        assert!(top.age_ms.is_some());
    }

    #[test]
    fn price_change_updates_only_given_sides() {
        let mirror = BookMirror::new();
        mirror
            .apply_book("tok1", &[lvl("0.44", "10")], &[lvl("0.46", "10")])
            .unwrap();
        mirror.apply_price_change("tok1", None, Some("0.45")).unwrap();

        let top = mirror.top("tok1");
        assert_eq!(top.bid, Some(44));
        assert_eq!(top.ask, Some(45));
    }

    #[test]
    fn crossed_book_reads_as_empty_sides() {
        let mirror = BookMirror::new();
        mirror
            .apply_book("tok1", &[lvl("0.50", "10")], &[lvl("0.52", "10")])
            .unwrap();
        // Bid jumps above the resting ask.
        mirror.apply_price_change("tok1", Some("0.53"), None).unwrap();

        let top = mirror.top("tok1");
        assert_eq!(top.bid, None);
        assert_eq!(top.ask, None);
    }

    #[test]
    fn malformed_price_marks_book_stale() {
        let mirror = BookMirror::new();
        mirror
            .apply_book("tok1", &[lvl("0.50", "10")], &[lvl("0.52", "10")])
            .unwrap();
        assert!(mirror.top("tok1").age_ms.is_some());

        let err = mirror.apply_price_change("tok1", Some("0.505"), None);
        assert!(err.is_err());
        let top = mirror.top("tok1");
        assert_eq!(top.age_ms, None);
        assert_eq!(top.bid, None);
        assert_eq!(top.ask, None);
        assert!(!top.is_fresh(Duration::from_secs(10)));
    }

    #[test]
    fn last_trade_recorded() {
        let mirror = BookMirror::new();
        mirror.apply_last_trade("tok1", "0.57").unwrap();
        assert_eq!(mirror.top("tok1").last_trade, Some(57));
    }

    #[test]
    fn both_sides_ready_requires_full_books() {
        let mirror = BookMirror::new();
        mirror.track("yes1");
        mirror.track("no1");
        assert!(!mirror.both_sides_ready("yes1", "no1"));

        mirror
            .apply_book("yes1", &[lvl("0.44", "10")], &[lvl("0.46", "10")])
            .unwrap();
        assert!(!mirror.both_sides_ready("yes1", "no1"));

        mirror
            .apply_book("no1", &[lvl("0.52", "10")], &[lvl("0.55", "10")])
            .unwrap();
        assert!(mirror.both_sides_ready("yes1", "no1"));
    }
}
