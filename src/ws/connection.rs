use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::{RECONNECT_STORM_THRESHOLD, RECONNECT_STORM_WINDOW_SECS};
use crate::error::Result;
use crate::mirror::BookMirror;
use crate::ws::messages::{build_initial_subscribe, build_operation, parse_frame, StreamEvent};

/// A session that has survived this long clears the degraded flag.
const STABLE_SESSION_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Shared stream counters. Written by the stream task, read by the monitor
/// (feed-gap and fallback decisions) and the status surface.
#[derive(Debug)]
pub struct StreamStats {
    epoch: Instant,
    /// Milliseconds since `epoch` of the last inbound message; MAX = none yet.
    last_msg_ms: AtomicU64,
    connected: AtomicBool,
    /// Reconnect storm in progress; the monitor should poll REST until the
    /// session stabilises.
    degraded: AtomicBool,
    pub reconnects: AtomicU64,
    pub frames: AtomicU64,
    pub parse_failures: AtomicU64,
    pub unknown_events: AtomicU64,
    pub price_errors: AtomicU64,
}

impl StreamStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            epoch: Instant::now(),
            last_msg_ms: AtomicU64::new(u64::MAX),
            connected: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            unknown_events: AtomicU64::new(0),
            price_errors: AtomicU64::new(0),
        })
    }

    fn note_message(&self) {
        self.last_msg_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Monotonic age of the last inbound message, if any ever arrived.
    pub fn last_message_age(&self) -> Option<Duration> {
        let at = self.last_msg_ms.load(Ordering::Relaxed);
        if at == u64::MAX {
            return None;
        }
        let now = self.epoch.elapsed().as_millis() as u64;
        Some(Duration::from_millis(now.saturating_sub(at)))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StreamCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

enum SessionEnd {
    Closed,
    Shutdown,
}

/// Long-lived subscription session for one monitor's token set.
///
/// Reconnects with bounded exponential backoff and resubscribes the full
/// current token set before delivering events. Transport and parse errors
/// never escape this task; they land in counters and stale mirror entries.
pub struct StreamClient {
    url: String,
    mirror: Arc<BookMirror>,
    stats: Arc<StreamStats>,
    command_rx: mpsc::Receiver<StreamCommand>,
    shutdown: watch::Receiver<bool>,
    heartbeat: Duration,
    read_deadline: Duration,
    reconnect_max_delay: Duration,
    subscribed: Vec<String>,
    recent_reconnects: VecDeque<Instant>,
}

impl StreamClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        url: String,
        initial_assets: Vec<String>,
        mirror: Arc<BookMirror>,
        stats: Arc<StreamStats>,
        command_rx: mpsc::Receiver<StreamCommand>,
        shutdown: watch::Receiver<bool>,
        heartbeat: Duration,
        reconnect_max_delay: Duration,
    ) -> Self {
        for asset_id in &initial_assets {
            mirror.track(asset_id);
        }
        Self {
            url,
            mirror,
            stats,
            command_rx,
            shutdown,
            heartbeat,
            read_deadline: heartbeat * 2,
            reconnect_max_delay,
            subscribed: initial_assets,
            recent_reconnects: VecDeque::new(),
        }
    }

    pub async fn run(mut self) {
        let mut backoff = Duration::from_secs(1);

        loop {
            if *self.shutdown.borrow() {
                return;
            }

            let result = self.connect_once().await;
            let was_established = self.stats.is_connected();
            self.stats.connected.store(false, Ordering::Relaxed);

            match result {
                Ok(SessionEnd::Shutdown) => {
                    info!("stream shutting down");
                    return;
                }
                Ok(SessionEnd::Closed) => {
                    info!("stream session ended");
                }
                Err(e) => {
                    warn!("stream error: {e}");
                }
            }
            if was_established {
                backoff = Duration::from_secs(1);
            }
            self.note_reconnect();

            warn!("stream reconnecting in {:?}", backoff);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.shutdown.changed() => return,
            }
            backoff = (backoff * 2).min(self.reconnect_max_delay);
        }
    }

    async fn connect_once(&mut self) -> Result<SessionEnd> {
        let (ws_stream, _) = connect_async(&self.url).await?;
        let (mut write, mut read) = ws_stream.split();
        let session_start = Instant::now();

        // Resubscribe the full current token set before any event is applied.
        if !self.subscribed.is_empty() {
            let sub = build_initial_subscribe(&self.subscribed);
            write.send(Message::Text(sub.into())).await?;
            debug!("subscribed {} token(s)", self.subscribed.len());
        }

        self.stats.connected.store(true, Ordering::Relaxed);

        let mut ping = tokio::time::interval(self.heartbeat);
        ping.tick().await; // consume immediate first tick
        let mut last_inbound = Instant::now();

        loop {
            if self.stats.is_degraded()
                && session_start.elapsed() >= Duration::from_secs(STABLE_SESSION_SECS)
            {
                info!("stream stabilised, leaving degraded mode");
                self.stats.degraded.store(false, Ordering::Relaxed);
                self.recent_reconnects.clear();
            }

            let deadline = tokio::time::sleep_until((last_inbound + self.read_deadline).into());

            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_inbound = Instant::now();
                            self.stats.note_message();
                            self.stats.frames.fetch_add(1, Ordering::Relaxed);
                            handle_frame(&self.mirror, &self.stats, &text);
                        }
                        // Control frames keep the read deadline alive but do
                        // not count as feed activity.
                        Some(Ok(Message::Ping(data))) => {
                            last_inbound = Instant::now();
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_inbound = Instant::now();
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Ok(SessionEnd::Closed);
                        }
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(_)) => {}
                    }
                }

                _ = ping.tick() => {
                    write.send(Message::Ping(vec![].into())).await?;
                }

                _ = deadline => {
                    warn!("no stream messages for {:?}, forcing reconnect", self.read_deadline);
                    return Ok(SessionEnd::Closed);
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(StreamCommand::Subscribe(ids)) => {
                            for asset_id in &ids {
                                self.mirror.track(asset_id);
                                if !self.subscribed.contains(asset_id) {
                                    self.subscribed.push(asset_id.clone());
                                }
                            }
                            write.send(Message::Text(build_operation(&ids, "subscribe").into())).await?;
                            debug!("subscribed {} additional token(s)", ids.len());
                        }
                        Some(StreamCommand::Unsubscribe(ids)) => {
                            self.subscribed.retain(|t| !ids.contains(t));
                            write.send(Message::Text(build_operation(&ids, "unsubscribe").into())).await?;
                            debug!("unsubscribed {} token(s)", ids.len());
                        }
                        None => return Ok(SessionEnd::Shutdown),
                    }
                }

                _ = self.shutdown.changed() => {
                    return Ok(SessionEnd::Shutdown);
                }
            }
        }
    }

    fn note_reconnect(&mut self) {
        let now = Instant::now();
        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
        self.recent_reconnects.push_back(now);

        let window = Duration::from_secs(RECONNECT_STORM_WINDOW_SECS);
        while let Some(front) = self.recent_reconnects.front() {
            if now.duration_since(*front) > window {
                self.recent_reconnects.pop_front();
            } else {
                break;
            }
        }

        if self.recent_reconnects.len() as u32 >= RECONNECT_STORM_THRESHOLD
            && !self.stats.is_degraded()
        {
            warn!(
                reconnects = self.recent_reconnects.len(),
                "reconnect storm, flagging stream degraded"
            );
            self.stats.degraded.store(true, Ordering::Relaxed);
        }
    }
}

/// Parse one text frame and fold its events into the mirror. A free
/// function so the read loop can call it while the select arms hold
/// borrows of the client's channels.
fn handle_frame(mirror: &BookMirror, stats: &StreamStats, text: &str) {
    let parsed = parse_frame(text);
    if parsed.parse_failures > 0 {
        let total = stats
            .parse_failures
            .fetch_add(parsed.parse_failures, Ordering::Relaxed)
            + parsed.parse_failures;
        if total <= 10 || total % 1000 == 0 {
            let sample = &text[..200.min(text.len())];
            warn!(total, "unrecognized stream frame: {sample}");
        }
    }

    for event in parsed.events {
        match event {
            StreamEvent::Book { asset_id, bids, asks } => {
                if let Err(e) = mirror.apply_book(&asset_id, &bids, &asks) {
                    stats.price_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(asset_id = %short(&asset_id), "book event rejected: {e}");
                }
            }
            StreamEvent::PriceChange { asset_id, best_bid, best_ask } => {
                if let Err(e) =
                    mirror.apply_price_change(&asset_id, best_bid.as_deref(), best_ask.as_deref())
                {
                    stats.price_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(asset_id = %short(&asset_id), "price_change rejected: {e}");
                }
            }
            StreamEvent::LastTrade { asset_id, price } => {
                if let Err(e) = mirror.apply_last_trade(&asset_id, &price) {
                    stats.price_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(asset_id = %short(&asset_id), "last_trade rejected: {e}");
                }
            }
            StreamEvent::TickSizeChange { asset_id, new_tick_size } => {
                // Mid-window tick changes are rare; the monitor keeps the
                // tick it discovered the market with.
                info!(
                    asset_id = %short(&asset_id),
                    new_tick_size = ?new_tick_size,
                    "tick size change"
                );
            }
            StreamEvent::Unknown { kind } => {
                stats.unknown_events.fetch_add(1, Ordering::Relaxed);
                debug!("unknown stream event type: {kind}");
            }
        }
    }
}

fn short(asset_id: &str) -> &str {
    &asset_id[..asset_id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_age_starts_unknown() {
        let stats = StreamStats::new();
        assert!(stats.last_message_age().is_none());
        stats.note_message();
        assert!(stats.last_message_age().unwrap() < Duration::from_secs(1));
    }

    #[test]
    fn degraded_flag_defaults_off() {
        let stats = StreamStats::new();
        assert!(!stats.is_degraded());
        assert!(!stats.is_connected());
    }
}
