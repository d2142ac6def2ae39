//! Typed output events and notifier fan-out.
//!
//! Two broadcast channels: one for engine events (trades, thresholds,
//! feed health, failures) and one for raw ticks, which only the dashboard
//! cache wants. Notifiers run on their own task and never block the core.

use crate::feed::FeedStatus;
use crate::models::{PriceTick, ReferencePrice, Symbol, Trade, TradeAction, TradeOrigin};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a reference row changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdReason {
    Trade,
    Seed,
    Recompute,
    Correction,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    TradeExecuted {
        trade: Trade,
        is_first_buy: bool,
    },
    ThresholdUpdated {
        symbol: Symbol,
        previous: ReferencePrice,
        current: ReferencePrice,
        reason: ThresholdReason,
    },
    StreamStatus {
        symbols: Vec<Symbol>,
        status: FeedStatus,
        at: DateTime<Utc>,
    },
    TradingPaused {
        symbol: Symbol,
        reason: String,
    },
    TradingResumed {
        symbol: Symbol,
    },
    OrderFailed {
        symbol: Symbol,
        action: TradeAction,
        origin: TradeOrigin,
        error: String,
        retryable: bool,
    },
    /// Order filled but the reference row could not be brought in line.
    /// Operators must reconcile by hand.
    ReconciliationRequired {
        symbol: Symbol,
        order_id: String,
        intended: ReferencePrice,
        error: String,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::TradeExecuted { .. } => "trade_executed",
            EngineEvent::ThresholdUpdated { .. } => "threshold_updated",
            EngineEvent::StreamStatus { .. } => "stream_status",
            EngineEvent::TradingPaused { .. } => "trading_paused",
            EngineEvent::TradingResumed { .. } => "trading_resumed",
            EngineEvent::OrderFailed { .. } => "order_failed",
            EngineEvent::ReconciliationRequired { .. } => "reconciliation_required",
        }
    }
}

/// Process-wide event channels, created once at startup
#[derive(Clone)]
pub struct EventBus {
    events: broadcast::Sender<EngineEvent>,
    ticks: broadcast::Sender<PriceTick>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(16);
        let (events, _) = broadcast::channel(capacity);
        let (ticks, _) = broadcast::channel(capacity);
        Self { events, ticks }
    }

    /// Fire and forget; having no subscribers is not an error
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    pub fn publish_tick(&self, tick: PriceTick) {
        let _ = self.ticks.send(tick);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_ticks(&self) -> broadcast::Receiver<PriceTick> {
        self.ticks.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// One-way sink for engine events
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &EngineEvent) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Writes every event to the tracing log
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &EngineEvent) -> Result<()> {
        match event {
            EngineEvent::TradeExecuted {
                trade,
                is_first_buy,
            } => {
                let marker = match trade.action {
                    TradeAction::Buy => "🟢",
                    TradeAction::Sell => "🔴",
                };
                tracing::info!(
                    "{} {} {} {:.8} @ ${:.4} (${:.2}){} [{}]",
                    marker,
                    trade.action.as_str().to_uppercase(),
                    trade.symbol,
                    trade.quantity,
                    trade.price,
                    trade.quote_amount,
                    if *is_first_buy { " first buy" } else { "" },
                    trade.origin.as_str()
                );
            }
            EngineEvent::ThresholdUpdated {
                symbol,
                current,
                reason,
                ..
            } => {
                tracing::info!(
                    "🎯 {} thresholds ({:?}): buy ≤ ${:.4}, sell ≥ ${:.4}",
                    symbol,
                    reason,
                    current.next_buy_price,
                    current.next_sell_price
                );
            }
            EngineEvent::StreamStatus {
                symbols, status, ..
            } => match status {
                FeedStatus::Connected => tracing::info!("📶 Feed up: {:?}", symbols),
                FeedStatus::Disconnected => tracing::warn!("📴 Feed down: {:?}", symbols),
                FeedStatus::Failed => tracing::error!("❌ Feed failed permanently: {:?}", symbols),
            },
            EngineEvent::TradingPaused { symbol, reason } => {
                tracing::warn!("⏸️  Trading paused for {}: {}", symbol, reason);
            }
            EngineEvent::TradingResumed { symbol } => {
                tracing::info!("▶️  Trading resumed for {}", symbol);
            }
            EngineEvent::OrderFailed {
                symbol,
                action,
                error,
                retryable,
                ..
            } => {
                tracing::warn!(
                    "⚠️  {} {} order failed (retryable: {}): {}",
                    symbol,
                    action,
                    retryable,
                    error
                );
            }
            EngineEvent::ReconciliationRequired {
                symbol,
                order_id,
                intended,
                error,
            } => {
                tracing::error!(
                    symbol = %symbol,
                    order_id = %order_id,
                    intended_next_buy = intended.next_buy_price,
                    intended_next_sell = intended.next_sell_price,
                    "🚨 RECONCILIATION REQUIRED: {}",
                    error
                );
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Deliver bus events to every notifier until the bus closes
pub fn spawn_notifiers(bus: &EventBus, notifiers: Vec<Arc<dyn Notifier>>) -> JoinHandle<()> {
    let mut rx = bus.subscribe();

    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Notifier lagged, skipped {} events", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            for notifier in &notifiers {
                match tokio::time::timeout(NOTIFY_TIMEOUT, notifier.notify(&event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(notifier = notifier.name(), "Notify failed: {}", e)
                    }
                    Err(_) => {
                        tracing::warn!(notifier = notifier.name(), "Notify timed out")
                    }
                }
            }
        }
        tracing::debug!("Notifier task stopped");
    })
}
