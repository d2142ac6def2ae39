use crate::error::FeedError;
use crate::models::Symbol;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One raw frame off the wire
#[derive(Debug, Clone, PartialEq)]
pub enum FeedFrame {
    Text(String),
    /// Protocol-level ping/pong; counts toward liveness only
    Heartbeat,
    Close,
}

pub type FeedConnection = BoxStream<'static, Result<FeedFrame, FeedError>>;

/// Opens one market-data connection for a group of symbols
#[async_trait]
pub trait FeedTransport: Send + Sync + 'static {
    async fn connect(&self, symbols: &[Symbol]) -> Result<FeedConnection, FeedError>;
}

/// Binance combined-stream ticker feed
///
/// `wss://stream.binance.com:9443/stream?streams=btcusdt@ticker/ethusdt@ticker`
#[derive(Debug, Clone)]
pub struct BinanceTickerTransport {
    base_url: String,
}

impl BinanceTickerTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn stream_url(&self, symbols: &[Symbol]) -> String {
        let streams = symbols
            .iter()
            .map(|s| format!("{}@ticker", s.to_lowercase()))
            .collect::<Vec<_>>()
            .join("/");
        format!(
            "{}/stream?streams={}",
            self.base_url.trim_end_matches('/'),
            streams
        )
    }
}

#[async_trait]
impl FeedTransport for BinanceTickerTransport {
    async fn connect(&self, symbols: &[Symbol]) -> Result<FeedConnection, FeedError> {
        let url = self.stream_url(symbols);

        let (ws, _) = timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| FeedError::Connect(format!("timeout after {:?}", CONNECT_TIMEOUT)))?
            .map_err(|e| FeedError::Connect(e.to_string()))?;

        tracing::info!("Feed connected: {}", url);

        // Reading the stream directly (no split) lets tungstenite answer pings itself
        let frames = ws.map(|msg| match msg {
            Ok(Message::Text(text)) => Ok(FeedFrame::Text(text)),
            Ok(Message::Binary(bytes)) => Ok(FeedFrame::Text(
                String::from_utf8_lossy(&bytes).into_owned(),
            )),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {
                Ok(FeedFrame::Heartbeat)
            }
            Ok(Message::Close(_)) => Ok(FeedFrame::Close),
            Err(e) => Err(FeedError::Protocol(e.to_string())),
        });

        Ok(frames.boxed())
    }
}

enum ScriptedSession {
    Live(mpsc::UnboundedReceiver<FeedFrame>),
    Fail(String),
}

/// Transport whose sessions are queued ahead of time
///
/// Each `connect` consumes the next queued session. A live session ends
/// (remote close) when its sender is dropped. An empty queue fails to connect.
#[derive(Default)]
pub struct ScriptedTransport {
    sessions: Mutex<VecDeque<ScriptedSession>>,
    connects: AtomicU32,
    requested: Mutex<Vec<Vec<Symbol>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a session that succeeds; frames are fed through the returned sender
    pub fn push_session(&self) -> mpsc::UnboundedSender<FeedFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_sessions().push_back(ScriptedSession::Live(rx));
        tx
    }

    pub fn push_failure(&self, reason: &str) {
        self.lock_sessions()
            .push_back(ScriptedSession::Fail(reason.to_string()));
    }

    /// Number of connect attempts made so far
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Symbol groups requested, in connect order
    pub fn requested_groups(&self) -> Vec<Vec<Symbol>> {
        match self.requested.lock() {
            Ok(groups) => groups.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, VecDeque<ScriptedSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl FeedTransport for ScriptedTransport {
    async fn connect(&self, symbols: &[Symbol]) -> Result<FeedConnection, FeedError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.requested
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(symbols.to_vec());

        let next = self.lock_sessions().pop_front();
        match next {
            Some(ScriptedSession::Live(rx)) => {
                let frames = stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|frame| (Ok(frame), rx))
                });
                Ok(frames.boxed())
            }
            Some(ScriptedSession::Fail(reason)) => Err(FeedError::Connect(reason)),
            None => Err(FeedError::Connect("no scripted session".to_string())),
        }
    }
}
