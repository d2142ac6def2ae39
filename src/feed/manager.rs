//! Stream manager: one connection task per symbol group.
//!
//! Each task connects, pumps frames until the connection drops or goes idle,
//! then backs off and reconnects. Ticks go out on a shared bounded channel;
//! connection transitions go out on a separate status channel so consumers
//! can gate trading on feed health.

use super::backoff::ReconnectPolicy;
use super::parser::{parse_frame, ParsedFrame};
use super::transport::{FeedConnection, FeedFrame, FeedTransport};
use crate::config::StreamSettings;
use crate::error::FeedError;
use crate::models::{normalize_symbol, PriceTick, Symbol};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    pub idle_check: Duration,
    pub idle_grace: Duration,
    pub reconnect: ReconnectPolicy,
}

impl FeedConfig {
    /// No frame (heartbeats included) for this long forces a reconnect
    pub fn idle_limit(&self) -> Duration {
        self.idle_check + self.idle_grace
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self::from(&StreamSettings::default())
    }
}

impl From<&StreamSettings> for FeedConfig {
    fn from(settings: &StreamSettings) -> Self {
        Self {
            idle_check: Duration::from_secs(settings.idle_check_secs.max(1)),
            idle_grace: Duration::from_secs(settings.idle_grace_secs),
            reconnect: ReconnectPolicy::from(settings),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedStatus {
    Connected,
    Disconnected,
    /// Reconnect budget exhausted; the group task has exited
    Failed,
}

impl FeedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedStatus::Connected => "connected",
            FeedStatus::Disconnected => "disconnected",
            FeedStatus::Failed => "failed",
        }
    }
}

/// Connection transition for one symbol group
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub group: u64,
    pub symbols: Vec<Symbol>,
    pub status: FeedStatus,
    pub at: DateTime<Utc>,
}

/// Returned by `subscribe`; pass back to `unsubscribe`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
    groups: Vec<u64>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

struct GroupEntry {
    symbols: BTreeSet<Symbol>,
    refs: usize,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl GroupEntry {
    fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }
}

#[derive(Default)]
struct ManagerState {
    next_id: u64,
    groups: HashMap<u64, GroupEntry>,
}

/// Shared by every group task
struct GroupContext {
    transport: Arc<dyn FeedTransport>,
    config: FeedConfig,
    tick_tx: mpsc::Sender<PriceTick>,
    status_tx: mpsc::UnboundedSender<StatusEvent>,
}

enum SessionEnd {
    Closed,
    Shutdown,
}

pub struct StreamManager {
    ctx: Arc<GroupContext>,
    state: Mutex<ManagerState>,
}

impl StreamManager {
    pub fn new(
        transport: Arc<dyn FeedTransport>,
        config: FeedConfig,
        tick_tx: mpsc::Sender<PriceTick>,
        status_tx: mpsc::UnboundedSender<StatusEvent>,
    ) -> Self {
        Self {
            ctx: Arc::new(GroupContext {
                transport,
                config,
                tick_tx,
                status_tx,
            }),
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Subscribe to a set of symbols.
    ///
    /// Symbols already covered by a live group reuse that group's connection;
    /// the rest get one new group. Must be called inside a tokio runtime.
    pub fn subscribe<I, S>(&self, symbols: I) -> SubscriptionHandle
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let wanted: BTreeSet<Symbol> = symbols
            .into_iter()
            .map(|s| normalize_symbol(s.as_ref()))
            .filter(|s| !s.is_empty())
            .collect();

        let mut state = self.lock_state();
        state.groups.retain(|id, group| {
            let alive = group.is_alive();
            if !alive {
                tracing::debug!(group = id, "Dropping finished feed group");
            }
            alive
        });

        let mut used: BTreeSet<u64> = BTreeSet::new();
        let mut uncovered: BTreeSet<Symbol> = BTreeSet::new();

        for symbol in &wanted {
            match state
                .groups
                .iter()
                .find(|(_, group)| group.symbols.contains(symbol))
            {
                Some((id, _)) => {
                    used.insert(*id);
                }
                None => {
                    uncovered.insert(symbol.clone());
                }
            }
        }

        if !uncovered.is_empty() {
            let id = Self::next_id(&mut state);
            let entry = self.spawn_group(id, uncovered);
            state.groups.insert(id, entry);
            used.insert(id);
        }

        for id in &used {
            if let Some(group) = state.groups.get_mut(id) {
                group.refs += 1;
            }
        }

        let handle = SubscriptionHandle {
            id: Self::next_id(&mut state),
            groups: used.into_iter().collect(),
        };
        tracing::info!(
            handle = handle.id,
            groups = ?handle.groups,
            "📡 Subscribed to {} symbol(s)",
            wanted.len()
        );
        handle
    }

    /// Release a subscription; groups nobody references any more are closed
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut state = self.lock_state();

        for id in handle.groups {
            let Some(group) = state.groups.get_mut(&id) else {
                continue;
            };
            group.refs = group.refs.saturating_sub(1);
            if group.refs == 0 {
                if let Some(group) = state.groups.remove(&id) {
                    tracing::info!(group = id, symbols = ?group.symbols, "Closing feed group");
                    let _ = group.shutdown.send(true);
                }
            }
        }
    }

    /// Close every group regardless of references
    pub fn shutdown(&self) {
        let mut state = self.lock_state();
        for (id, group) in state.groups.drain() {
            tracing::debug!(group = id, "Shutting down feed group");
            let _ = group.shutdown.send(true);
        }
    }

    /// Symbols with a live connection task, sorted
    pub fn active_symbols(&self) -> Vec<Symbol> {
        let state = self.lock_state();
        let mut symbols: Vec<Symbol> = state
            .groups
            .values()
            .filter(|g| g.is_alive())
            .flat_map(|g| g.symbols.iter().cloned())
            .collect();
        symbols.sort();
        symbols
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(state: &mut ManagerState) -> u64 {
        state.next_id += 1;
        state.next_id
    }

    fn spawn_group(&self, id: u64, symbols: BTreeSet<Symbol>) -> GroupEntry {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = Arc::clone(&self.ctx);
        let list: Vec<Symbol> = symbols.iter().cloned().collect();

        let task = tokio::spawn(async move {
            run_group(id, list, ctx, shutdown_rx).await;
        });

        GroupEntry {
            symbols,
            refs: 0,
            shutdown: shutdown_tx,
            task,
        }
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_group(
    group: u64,
    symbols: Vec<Symbol>,
    ctx: Arc<GroupContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let policy = &ctx.config.reconnect;
    let mut attempt: u32 = 0;
    let mut last_delivered: HashMap<Symbol, (f64, DateTime<Utc>)> = HashMap::new();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let connected = tokio::select! {
            result = ctx.transport.connect(&symbols) => result,
            _ = shutdown.changed() => break,
        };

        match connected {
            Ok(conn) => {
                attempt = 0;
                emit_status(&ctx, group, &symbols, FeedStatus::Connected);
                tracing::info!(group, symbols = ?symbols, "✅ Feed connected");

                let end = pump(group, conn, &symbols, &ctx, &mut last_delivered, &mut shutdown).await;
                emit_status(&ctx, group, &symbols, FeedStatus::Disconnected);

                match end {
                    Ok(SessionEnd::Shutdown) => break,
                    Ok(SessionEnd::Closed) => {
                        tracing::warn!(group, "⚠️  Feed closed by remote");
                    }
                    Err(e) => {
                        tracing::warn!(group, "⚠️  Feed dropped: {}", e);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(group, attempt, "⚠️  Feed connect failed: {}", e);
            }
        }

        if policy.is_exhausted(attempt) {
            let err = FeedError::Exhausted { attempts: attempt };
            tracing::error!(group, symbols = ?symbols, "❌ {}", err);
            emit_status(&ctx, group, &symbols, FeedStatus::Failed);
            return;
        }

        let delay = policy.delay_for(attempt);
        attempt += 1;
        tracing::warn!(group, attempt, "🔄 Reconnecting in {:?}", delay);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    tracing::debug!(group, "Feed group stopped");
}

async fn pump(
    group: u64,
    mut conn: FeedConnection,
    symbols: &[Symbol],
    ctx: &GroupContext,
    last_delivered: &mut HashMap<Symbol, (f64, DateTime<Utc>)>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<SessionEnd, FeedError> {
    let idle_limit = ctx.config.idle_limit();
    let mut check = tokio::time::interval(ctx.config.idle_check);
    check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    check.tick().await;

    let mut last_frame = Instant::now();

    loop {
        tokio::select! {
            frame = conn.next() => {
                match frame {
                    Some(Ok(FeedFrame::Text(text))) => {
                        last_frame = Instant::now();
                        if !forward_text(group, &text, symbols, ctx, last_delivered) {
                            return Ok(SessionEnd::Shutdown);
                        }
                    }
                    Some(Ok(FeedFrame::Heartbeat)) => {
                        last_frame = Instant::now();
                    }
                    Some(Ok(FeedFrame::Close)) | None => return Ok(SessionEnd::Closed),
                    Some(Err(e)) => return Err(e),
                }
            }
            _ = check.tick() => {
                if last_frame.elapsed() >= idle_limit {
                    return Err(FeedError::IdleTimeout(idle_limit));
                }
            }
            _ = shutdown.changed() => return Ok(SessionEnd::Shutdown),
        }
    }
}

/// Returns false once the tick receiver is gone
fn forward_text(
    group: u64,
    text: &str,
    symbols: &[Symbol],
    ctx: &GroupContext,
    last_delivered: &mut HashMap<Symbol, (f64, DateTime<Utc>)>,
) -> bool {
    let tick = match parse_frame(text) {
        ParsedFrame::Tick(tick) => tick,
        ParsedFrame::Control => return true,
        ParsedFrame::Malformed(reason) => {
            tracing::debug!(group, "Dropping malformed frame: {}", reason);
            return true;
        }
    };

    if !symbols.contains(&tick.symbol) {
        tracing::debug!(group, symbol = %tick.symbol, "Dropping tick for unsubscribed symbol");
        return true;
    }

    if last_delivered.get(&tick.symbol) == Some(&(tick.price, tick.timestamp)) {
        return true;
    }

    match ctx.tick_tx.try_send(tick.clone()) {
        Ok(()) => {
            last_delivered.insert(tick.symbol, (tick.price, tick.timestamp));
            true
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!(group, symbol = %tick.symbol, "Tick channel full, dropping tick");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

fn emit_status(ctx: &GroupContext, group: u64, symbols: &[Symbol], status: FeedStatus) {
    let event = StatusEvent {
        group,
        symbols: symbols.to_vec(),
        status,
        at: Utc::now(),
    };
    if ctx.status_tx.send(event).is_err() {
        tracing::debug!(group, "Status receiver dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::transport::ScriptedTransport;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn fast_config(max_attempts: u32) -> FeedConfig {
        FeedConfig {
            idle_check: Duration::from_millis(20),
            idle_grace: Duration::from_millis(10),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                max_attempts,
            },
        }
    }

    struct Harness {
        manager: StreamManager,
        transport: Arc<ScriptedTransport>,
        ticks: mpsc::Receiver<PriceTick>,
        status: mpsc::UnboundedReceiver<StatusEvent>,
    }

    fn harness(max_attempts: u32) -> Harness {
        let transport = Arc::new(ScriptedTransport::new());
        let (tick_tx, ticks) = mpsc::channel(64);
        let (status_tx, status) = mpsc::unbounded_channel();
        let manager = StreamManager::new(
            transport.clone(),
            fast_config(max_attempts),
            tick_tx,
            status_tx,
        );
        Harness {
            manager,
            transport,
            ticks,
            status,
        }
    }

    fn ticker(symbol: &str, price: &str, event_ms: i64) -> FeedFrame {
        FeedFrame::Text(format!(
            r#"{{"stream":"{}@ticker","data":{{"e":"24hrTicker","E":{},"s":"{}","c":"{}"}}}}"#,
            symbol.to_lowercase(),
            event_ms,
            symbol,
            price
        ))
    }

    async fn next_status(rx: &mut mpsc::UnboundedReceiver<StatusEvent>) -> FeedStatus {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap().status
    }

    async fn next_tick(rx: &mut mpsc::Receiver<PriceTick>) -> PriceTick {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_ticks_flow_after_connected() {
        let mut h = harness(3);
        let session = h.transport.push_session();

        let _handle = h.manager.subscribe(["btcusdt"]);
        assert_eq!(next_status(&mut h.status).await, FeedStatus::Connected);

        session.send(ticker("BTCUSDT", "100.5", 1_000)).unwrap();
        let tick = next_tick(&mut h.ticks).await;
        assert_eq!(tick.symbol, "BTCUSDT");
        assert_eq!(tick.price, 100.5);
        assert_eq!(h.transport.requested_groups(), vec![vec!["BTCUSDT".to_string()]]);
    }

    #[tokio::test]
    async fn test_malformed_frames_and_duplicates_dropped() {
        let mut h = harness(3);
        let session = h.transport.push_session();

        let _handle = h.manager.subscribe(["BTCUSDT"]);
        assert_eq!(next_status(&mut h.status).await, FeedStatus::Connected);

        session.send(FeedFrame::Text("garbage".to_string())).unwrap();
        session.send(FeedFrame::Text(r#"{"result":null,"id":1}"#.to_string())).unwrap();
        session.send(ticker("BTCUSDT", "100", 1_000)).unwrap();
        session.send(ticker("BTCUSDT", "100", 1_000)).unwrap();
        session.send(ticker("ETHUSDT", "2000", 1_000)).unwrap();
        session.send(ticker("BTCUSDT", "101", 2_000)).unwrap();

        assert_eq!(next_tick(&mut h.ticks).await.price, 100.0);
        assert_eq!(next_tick(&mut h.ticks).await.price, 101.0);
        assert!(h.ticks.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconnects_after_remote_close() {
        let mut h = harness(3);
        let first = h.transport.push_session();
        let second = h.transport.push_session();

        let _handle = h.manager.subscribe(["BTCUSDT"]);
        assert_eq!(next_status(&mut h.status).await, FeedStatus::Connected);

        drop(first);
        assert_eq!(next_status(&mut h.status).await, FeedStatus::Disconnected);
        assert_eq!(next_status(&mut h.status).await, FeedStatus::Connected);

        second.send(ticker("BTCUSDT", "99", 5_000)).unwrap();
        assert_eq!(next_tick(&mut h.ticks).await.price, 99.0);
        assert_eq!(h.transport.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_idle_connection_is_forced_closed() {
        let mut h = harness(3);
        // Keep the sender alive so only the liveness check can end the session
        let _silent = h.transport.push_session();
        let _next = h.transport.push_session();

        let _handle = h.manager.subscribe(["BTCUSDT"]);
        assert_eq!(next_status(&mut h.status).await, FeedStatus::Connected);
        assert_eq!(next_status(&mut h.status).await, FeedStatus::Disconnected);
        assert_eq!(next_status(&mut h.status).await, FeedStatus::Connected);
    }

    #[tokio::test]
    async fn test_exhausted_budget_reports_failed() {
        let mut h = harness(2);
        // No sessions queued: every connect fails

        let _handle = h.manager.subscribe(["BTCUSDT"]);
        assert_eq!(next_status(&mut h.status).await, FeedStatus::Failed);

        // Initial attempt plus two reconnects
        assert_eq!(h.transport.connect_count(), 3);

        // Task exits right after the status send
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.manager.active_symbols().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent_for_covered_symbols() {
        let mut h = harness(3);
        let _session = h.transport.push_session();

        let first = h.manager.subscribe(["BTCUSDT", "ETHUSDT"]);
        assert_eq!(next_status(&mut h.status).await, FeedStatus::Connected);

        let second = h.manager.subscribe(["ethusdt"]);
        assert_ne!(first.id(), second.id());
        assert_eq!(h.transport.connect_count(), 1);

        // Still referenced by the first handle
        h.manager.unsubscribe(second);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.status.try_recv().is_err());
        assert_eq!(h.manager.active_symbols(), vec!["BTCUSDT", "ETHUSDT"]);

        h.manager.unsubscribe(first);
        assert_eq!(next_status(&mut h.status).await, FeedStatus::Disconnected);
        assert!(h.manager.active_symbols().is_empty());
    }

    #[tokio::test]
    async fn test_new_symbols_get_their_own_group() {
        let mut h = harness(3);
        let _a = h.transport.push_session();
        let _b = h.transport.push_session();

        let _first = h.manager.subscribe(["BTCUSDT"]);
        assert_eq!(next_status(&mut h.status).await, FeedStatus::Connected);
        let _second = h.manager.subscribe(["BTCUSDT", "SOLUSDT"]);
        assert_eq!(next_status(&mut h.status).await, FeedStatus::Connected);

        assert_eq!(
            h.transport.requested_groups(),
            vec![vec!["BTCUSDT".to_string()], vec!["SOLUSDT".to_string()]]
        );
    }
}
