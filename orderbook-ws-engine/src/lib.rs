//! Low-latency push path for order events.
//!
//! One stream client per process holds a websocket to the aggregator and
//! upserts ask/bid events straight into the order store, bypassing the
//! polling engines. Missed events while disconnected are recovered by
//! upkeep; this client's job is freshness and staying connected: reconnect
//! with doubling backoff, and force-close connections that go silent.

mod backoff;
mod metrics;

pub use backoff::ReconnectBackoff;
pub use metrics::{StreamMetrics, StreamMetricsSnapshot};

use std::sync::{Arc, Once};
use std::time::Duration;

use core_types::FeedKind;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use order_store::OrderStore;
use reservoir_source::{
    RawOrder,
    map::{map_ask, map_bid},
};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;

const SUBSCRIBE_TOPICS: [&str; 4] = ["ask.created", "ask.updated", "bid.created", "bid.updated"];
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1_000;
const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;
const DEFAULT_WATCHDOG_SECS: u64 = 5;
const DEFAULT_STALE_SECS: u64 = 10;

static TLS_PROVIDER_ONCE: Once = Once::new();

fn ensure_tls_provider() {
    TLS_PROVIDER_ONCE.call_once(|| {
        if let Err(err) = rustls::crypto::ring::default_provider().install_default() {
            warn!("rustls crypto provider already installed: {err:?}");
        }
    });
}

#[derive(Clone)]
pub struct StreamConfig {
    pub label: String,
    pub ws_url: String,
    pub api_key: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub watchdog_interval: Duration,
    pub stale_after: Duration,
}

impl StreamConfig {
    pub fn new(ws_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            label: "stream".to_string(),
            ws_url: ws_url.into(),
            api_key: api_key.into(),
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            watchdog_interval: Duration::from_secs(DEFAULT_WATCHDOG_SECS),
            stale_after: Duration::from_secs(DEFAULT_STALE_SECS),
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_watchdog(mut self, interval: Duration, stale_after: Duration) -> Self {
        self.watchdog_interval = interval;
        self.stale_after = stale_after;
        self
    }
}

/// Tagged envelope of every inbound frame.
#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    published_at: Option<i64>,
}

#[derive(Debug, PartialEq, Eq)]
enum MessageAction {
    Continue,
    Resubscribe,
}

enum CloseReason {
    Shutdown,
    Closed,
    Errored,
    Stale,
}

/// Process-wide stream client delivering both feed kinds to storage.
pub struct OrderStreamClient {
    config: StreamConfig,
    store: Arc<dyn OrderStore>,
    metrics: StreamMetrics,
}

impl OrderStreamClient {
    pub fn new(config: StreamConfig, store: Arc<dyn OrderStore>) -> Self {
        Self {
            config,
            store,
            metrics: StreamMetrics::new(),
        }
    }

    pub fn metrics(&self) -> StreamMetrics {
        self.metrics.clone()
    }

    /// Spawn the connect loop onto the runtime.
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    /// Connect, consume, reconnect - forever, until cancelled. Never leaves
    /// the client silently disconnected: every exit from a connection
    /// schedules another attempt.
    pub async fn run(&self, cancel: CancellationToken) {
        ensure_tls_provider();
        let label = &self.config.label;
        let url = format!("{}?api_key={}", self.config.ws_url, self.config.api_key);
        let mut backoff =
            ReconnectBackoff::new(self.config.initial_backoff, self.config.max_backoff);
        while !cancel.is_cancelled() {
            debug!("[{label}] connecting to {}", self.config.ws_url);
            match connect_async(&url).await {
                Ok((stream, _response)) => {
                    info!("[{label}] stream connected");
                    backoff.reset();
                    self.metrics.set_connected(true);
                    self.metrics.set_backoff_ms(backoff.current().as_millis() as u64);
                    let reason = self.consume(stream, &cancel).await;
                    self.metrics.set_connected(false);
                    match reason {
                        CloseReason::Shutdown => break,
                        CloseReason::Closed => info!("[{label}] stream closed"),
                        CloseReason::Errored => warn!("[{label}] stream errored"),
                        CloseReason::Stale => warn!("[{label}] stream stale, forced close"),
                    }
                    self.metrics.inc_reconnects();
                }
                Err(err) => {
                    warn!("[{label}] stream connect failed: {err}");
                }
            }
            let delay = backoff.next_delay();
            self.metrics.set_backoff_ms(delay.as_millis() as u64);
            debug!("[{label}] reconnecting in {delay:?}");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }
        self.metrics.set_connected(false);
        info!("[{label}] stream client stopped");
    }

    /// Drive one established connection until it dies, goes stale, or the
    /// process shuts down.
    async fn consume(&self, stream: WsStream, cancel: &CancellationToken) -> CloseReason {
        let label = &self.config.label;
        let (mut write, mut read) = stream.split();
        if let Err(err) = subscribe_all(&mut write).await {
            warn!("[{label}] failed to subscribe after connect: {err}");
            return CloseReason::Errored;
        }
        // The liveness clock starts at the open, so a connection that never
        // delivers a single message is detected too. One watchdog per
        // connection; it dies with this scope.
        let mut last_activity = Instant::now();
        let mut watchdog = interval(self.config.watchdog_interval);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return CloseReason::Shutdown;
                }
                _ = watchdog.tick() => {
                    if last_activity.elapsed() > self.config.stale_after {
                        let _ = write.send(Message::Close(None)).await;
                        return CloseReason::Stale;
                    }
                }
                frame = read.next() => match frame {
                    None => return CloseReason::Closed,
                    Some(Err(err)) => {
                        warn!("[{label}] stream read failed: {err}");
                        return CloseReason::Errored;
                    }
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        self.metrics.mark_message();
                        if self.handle_message(&text).await == MessageAction::Resubscribe {
                            self.metrics.set_connected(true);
                            if let Err(err) = subscribe_all(&mut write).await {
                                warn!("[{label}] failed to resubscribe: {err}");
                                return CloseReason::Errored;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        last_activity = Instant::now();
                        if write.send(Message::Pong(payload)).await.is_err() {
                            return CloseReason::Errored;
                        }
                    }
                    Some(Ok(Message::Close(_))) => return CloseReason::Closed,
                    Some(Ok(_)) => {
                        last_activity = Instant::now();
                    }
                }
            }
        }
    }

    /// Parse one envelope and dispatch it. Never fails: parse and handler
    /// errors are logged and counted only.
    async fn handle_message(&self, text: &str) -> MessageAction {
        let envelope: StreamEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.metrics.inc_parse_errors();
                debug!("[{}] unparseable stream frame: {err}", self.config.label);
                return MessageAction::Continue;
            }
        };
        self.metrics.inc_messages();
        if let Some(published_at) = envelope.published_at {
            self.metrics.observe_published(published_at);
        }
        // Subscription acks echo the subscribe event name back.
        if envelope.event.as_deref() == Some("subscribe") {
            return MessageAction::Continue;
        }
        // The server may report readiness before (or without) a socket open
        // event; treat it as connected and (re)subscribe.
        if envelope.kind.as_deref() == Some("connection")
            && envelope.status.as_deref() == Some("ready")
        {
            return MessageAction::Resubscribe;
        }
        let Some(event) = envelope.event.as_deref() else {
            return MessageAction::Continue;
        };
        let Some(data) = envelope.data else {
            return MessageAction::Continue;
        };
        if event.contains("ask") {
            self.upsert(FeedKind::Asks, data).await;
        } else if event.contains("bid") {
            self.upsert(FeedKind::Bids, data).await;
        }
        MessageAction::Continue
    }

    async fn upsert(&self, kind: FeedKind, data: serde_json::Value) {
        let raw: RawOrder = match serde_json::from_value(data) {
            Ok(raw) => raw,
            Err(err) => {
                self.metrics.inc_parse_errors();
                debug!("[{}] unmappable {kind} event: {err}", self.config.label);
                return;
            }
        };
        let record = match kind {
            FeedKind::Asks => map_ask(&raw),
            FeedKind::Bids => map_bid(&raw),
        };
        let Some(record) = record else {
            self.metrics.inc_dropped();
            return;
        };
        match self.store.save(kind, record).await {
            Ok(()) => match kind {
                FeedKind::Asks => self.metrics.inc_asks_upserted(),
                FeedKind::Bids => self.metrics.inc_bids_upserted(),
            },
            Err(err) => {
                self.metrics.inc_store_errors();
                warn!("[{}] stream upsert failed: {err}", self.config.label);
            }
        }
    }
}

async fn subscribe_all(write: &mut WsWriter) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    for topic in SUBSCRIBE_TOPICS {
        let frame = serde_json::json!({"type": "subscribe", "event": topic}).to_string();
        write.send(Message::Text(frame)).await?;
    }
    Ok(())
}
