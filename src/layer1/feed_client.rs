// Feed Client - WebSocket subscriber for tick and OHLC price feeds
// Reconnects with exponential backoff, pings, and drops stale connections

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use crate::core::config::FeedConfig;
use crate::core::types::ConnectionStatus;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Consumer of raw feed payloads. The ingestion pipeline implements this.
pub trait FeedHandler: Send + Sync {
    fn on_message(&self, raw: &str);
}

/// Feed statistics
#[derive(Debug, Clone)]
pub struct FeedStats {
    pub state: ConnectionStatus,
    pub message_count: u64,
    pub error_count: u64,
    pub reconnects: u32,
    pub symbols: usize,
}

impl fmt::Display for FeedStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FeedStats(state={:?}, messages={}, errors={}, reconnects={}, symbols={})",
            self.state, self.message_count, self.error_count, self.reconnects, self.symbols
        )
    }
}

/// How a single connection ended
enum SessionEnd {
    /// Server closed, stream ended or went stale. Eligible for reconnect.
    Dropped,
    /// Shutdown requested
    Shutdown,
}

pub struct FeedClient {
    url: String,
    symbols: RwLock<Vec<String>>,
    state: RwLock<ConnectionStatus>,
    message_count: RwLock<u64>,
    error_count: RwLock<u64>,
    reconnects: RwLock<u32>,
    ping_interval_secs: u64,
    health_check_interval_secs: u64,
    stale_timeout_secs: u64,
    max_reconnect_attempts: u32,
}

impl FeedClient {
    pub fn new(config: &FeedConfig) -> Self {
        info!(url = %config.url, symbols = config.symbols.len(), "Feed client created");
        Self {
            url: config.url.clone(),
            symbols: RwLock::new(config.symbols.iter().map(|s| s.to_uppercase()).collect()),
            state: RwLock::new(ConnectionStatus::Disconnected),
            message_count: RwLock::new(0),
            error_count: RwLock::new(0),
            reconnects: RwLock::new(0),
            ping_interval_secs: config.ping_interval_secs.max(1),
            health_check_interval_secs: config.health_check_interval_secs.max(1),
            stale_timeout_secs: config.stale_timeout_secs.max(1),
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }

    /// Symbols sent in the subscribe message on the next (re)connect
    pub fn set_symbols(&self, symbols: &[String]) {
        *self.symbols.write() = symbols.iter().map(|s| s.to_uppercase()).collect();
    }

    pub fn is_connected(&self) -> bool {
        *self.state.read() == ConnectionStatus::Connected
    }

    pub fn get_stats(&self) -> FeedStats {
        FeedStats {
            state: *self.state.read(),
            message_count: *self.message_count.read(),
            error_count: *self.error_count.read(),
            reconnects: *self.reconnects.read(),
            symbols: self.symbols.read().len(),
        }
    }

    /// Run until shutdown. Returns an error once reconnect attempts are exhausted
    /// so the supervisor can restart the whole pipeline.
    pub async fn run(
        &self,
        handler: Arc<dyn FeedHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), FeedError> {
        let mut reconnect_attempt = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            *self.state.write() = ConnectionStatus::Connecting;
            match self.try_connect(handler.as_ref(), &mut shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Dropped) => {
                    info!("Feed connection ended");
                    // A session that actually connected earns a fresh backoff schedule
                    reconnect_attempt = 0;
                }
                Err(e) => {
                    error!(error = %e, "Feed connection error");
                    *self.error_count.write() += 1;
                    *self.state.write() = ConnectionStatus::Failed;
                }
            }

            if reconnect_attempt >= self.max_reconnect_attempts {
                error!(max_attempts = self.max_reconnect_attempts, "Max reconnection attempts reached");
                *self.state.write() = ConnectionStatus::Failed;
                return Err(FeedError::Protocol(format!(
                    "gave up after {} reconnect attempts",
                    self.max_reconnect_attempts
                )));
            }

            let delay_secs = backoff_secs(reconnect_attempt);
            reconnect_attempt += 1;
            *self.reconnects.write() += 1;

            warn!(delay_secs = delay_secs, attempt = reconnect_attempt, max = self.max_reconnect_attempts, "Reconnecting");
            *self.state.write() = ConnectionStatus::Reconnecting;

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(delay_secs)) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        *self.state.write() = ConnectionStatus::Disconnected;
        info!("Feed client stopped");
        Ok(())
    }

    /// One connection: subscribe, then forward text frames until it drops
    async fn try_connect(
        &self,
        handler: &dyn FeedHandler,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, FeedError> {
        debug!(url = %self.url, "Connecting to feed");
        let (ws_stream, _) = connect_async(self.url.as_str()).await?;

        info!(url = %self.url, "Feed connected");
        *self.state.write() = ConnectionStatus::Connected;

        let (write, mut read) = ws_stream.split();
        let write = Arc::new(AsyncMutex::new(write));

        let symbols = self.symbols.read().clone();
        if !symbols.is_empty() {
            let msg = create_subscribe_message(&symbols);
            write.lock().await.send(Message::Text(msg)).await?;
            info!(count = symbols.len(), symbols = ?symbols, "Subscribed to feed");
        }

        let last_message_time = Arc::new(RwLock::new(Instant::now()));

        let write_ping = Arc::clone(&write);
        let ping_interval = self.ping_interval_secs;
        let ping_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(ping_interval));
            loop {
                interval.tick().await;
                if let Err(e) = write_ping.lock().await.send(Message::Ping(vec![])).await {
                    warn!(error = %e, "Ping failed");
                    break;
                }
            }
        });

        let mut health = tokio::time::interval(Duration::from_secs(self.health_check_interval_secs));
        let stale_after = Duration::from_secs(self.stale_timeout_secs);

        let end = loop {
            tokio::select! {
                msg_result = read.next() => match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        *last_message_time.write() = Instant::now();
                        let count = {
                            let mut c = self.message_count.write();
                            *c += 1;
                            *c
                        };
                        handler.on_message(&text);
                        if count % 10_000 == 0 {
                            debug!(count = count, "Feed messages received");
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        *last_message_time.write() = Instant::now();
                        warn!(bytes = data.len(), "Received unexpected binary message");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        *last_message_time.write() = Instant::now();
                        let _ = write.lock().await.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        *last_message_time.write() = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Feed closed by server");
                        break Ok(SessionEnd::Dropped);
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => break Err(FeedError::from(e)),
                    None => {
                        info!("Feed stream ended");
                        break Ok(SessionEnd::Dropped);
                    }
                },
                _ = health.tick() => {
                    let elapsed = last_message_time.read().elapsed();
                    if elapsed > stale_after {
                        warn!(elapsed_secs = elapsed.as_secs(), "Stale feed connection detected");
                        break Ok(SessionEnd::Dropped);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = write.lock().await.send(Message::Close(None)).await;
                        break Ok(SessionEnd::Shutdown);
                    }
                }
            }
        };

        ping_handle.abort();
        *self.state.write() = ConnectionStatus::Disconnected;
        debug!("Feed connection closed");
        end
    }
}

/// Reconnect delay: 1, 2, 4, ... seconds, capped at one minute
pub fn backoff_secs(attempt: u32) -> u64 {
    2_u64.checked_pow(attempt).unwrap_or(u64::MAX).min(60)
}

/// Subscribe request for the tick and OHLC channels of every symbol
pub fn create_subscribe_message(symbols: &[String]) -> String {
    serde_json::json!({
        "action": "subscribe",
        "symbols": symbols,
        "channels": ["tick", "ohlc"],
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_config() -> FeedConfig {
        FeedConfig {
            url: "ws://127.0.0.1:1".to_string(),
            symbols: vec!["eurusd".to_string(), "xauusd".to_string()],
            max_reconnect_attempts: 0,
            ..FeedConfig::default()
        }
    }

    struct NullHandler;

    impl FeedHandler for NullHandler {
        fn on_message(&self, _raw: &str) {}
    }

    #[test]
    fn test_client_creation() {
        let client = FeedClient::new(&make_config());
        assert!(!client.is_connected());
        let stats = client.get_stats();
        assert_eq!(stats.state, ConnectionStatus::Disconnected);
        assert_eq!(stats.symbols, 2);
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_secs(0), 1);
        assert_eq!(backoff_secs(3), 8);
        assert_eq!(backoff_secs(6), 60);
        assert_eq!(backoff_secs(40), 60);
        assert_eq!(backoff_secs(200), 60);
    }

    #[test]
    fn test_subscribe_message() {
        let msg = create_subscribe_message(&["EURUSD".to_string(), "GBPUSD".to_string()]);
        let value: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(value["action"], "subscribe");
        assert_eq!(value["symbols"][1], "GBPUSD");
        assert_eq!(value["channels"][0], "tick");
    }

    #[test]
    fn test_stats_display() {
        let client = FeedClient::new(&make_config());
        let s = format!("{}", client.get_stats());
        assert!(s.contains("messages=0"));
        assert!(s.contains("reconnects=0"));
    }

    #[tokio::test]
    async fn test_unreachable_feed_gives_up() {
        let client = FeedClient::new(&make_config());
        let (_tx, rx) = watch::channel(false);
        let result = client.run(Arc::new(NullHandler), rx).await;
        assert!(matches!(result, Err(FeedError::Protocol(_))));
        let stats = client.get_stats();
        assert_eq!(stats.state, ConnectionStatus::Failed);
        assert_eq!(stats.error_count, 1);
    }

    #[tokio::test]
    async fn test_shutdown_before_connect() {
        let client = FeedClient::new(&make_config());
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        assert!(client.run(Arc::new(NullHandler), rx).await.is_ok());
        assert_eq!(client.get_stats().state, ConnectionStatus::Disconnected);
    }
}
