//! Turns ticks into at most one order per symbol and commits the result.
//!
//! Ticks are routed to one worker task per symbol, so a symbol's ticks are
//! evaluated strictly in arrival order. A process-local in-flight set stops
//! a burst of ticks from submitting a second order before the first one is
//! committed; the row lock taken by the store is the real correctness
//! boundary across processes.

use crate::config::Settings;
use crate::db::{with_store_retry, ReferenceStore, StoreRetryPolicy};
use crate::error::{StoreError, TradeError};
use crate::events::{EngineEvent, EventBus, ThresholdReason};
use crate::exchange::OrderGateway;
use crate::feed::{FeedStatus, StatusEvent};
use crate::models::{
    normalize_symbol, OrderAmount, OrderRequest, PriceTick, ReferencePrice, Symbol, Trade,
    TradeAction, TradeOrigin,
};
use crate::strategy::ThresholdEngine;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Per-symbol trading parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolPlan {
    pub engine: ThresholdEngine,
    /// Quote amount spent per buy
    pub investment_amount: f64,
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub seed_on_first_tick: bool,
    pub retry: StoreRetryPolicy,
    /// Ticks buffered per symbol worker before new ones are dropped
    pub worker_queue: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            seed_on_first_tick: true,
            retry: StoreRetryPolicy::default(),
            worker_queue: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickAction {
    Buy { quote_amount: f64 },
    Sell { quantity: f64 },
    Hold,
}

/// What a tick should trigger given the current row and holdings
pub fn decide_action(
    plan: &SymbolPlan,
    reference: &ReferencePrice,
    holdings: f64,
    tick: &PriceTick,
) -> TickAction {
    if plan.engine.should_sell(reference, tick) && holdings > 0.0 {
        TickAction::Sell { quantity: holdings }
    } else if plan.engine.should_buy(reference, tick) {
        TickAction::Buy {
            quote_amount: plan.investment_amount,
        }
    } else {
        TickAction::Hold
    }
}

/// Result of one committed trade
#[derive(Debug, Clone)]
pub struct TradeReport {
    pub trade: Trade,
    /// Row after commit (and correction, if one was needed)
    pub reference: ReferencePrice,
    pub is_first_buy: bool,
    pub corrected: bool,
}

/// Read-only view for the dashboard / `status` command
#[derive(Debug, Clone)]
pub struct SymbolSnapshot {
    pub symbol: Symbol,
    pub reference: ReferencePrice,
    pub holdings: f64,
    pub trading_enabled: bool,
    pub order_in_flight: bool,
    pub recent_trades: Vec<Trade>,
}

/// Holds a symbol in a claim set; removes it when dropped
struct SymbolGuard {
    set: Arc<Mutex<HashSet<Symbol>>>,
    symbol: Symbol,
}

impl SymbolGuard {
    fn claim(set: &Arc<Mutex<HashSet<Symbol>>>, symbol: &str) -> Option<Self> {
        if !lock(set).insert(symbol.to_string()) {
            return None;
        }
        Some(Self {
            set: Arc::clone(set),
            symbol: symbol.to_string(),
        })
    }
}

impl Drop for SymbolGuard {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.symbol);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct TradeCoordinator {
    plans: HashMap<Symbol, SymbolPlan>,
    store: Arc<dyn ReferenceStore>,
    gateway: Arc<dyn OrderGateway>,
    bus: EventBus,
    options: CoordinatorOptions,
    in_flight: Arc<Mutex<HashSet<Symbol>>>,
    /// Symbols being recomputed; independent of `in_flight`
    recomputing: Arc<Mutex<HashSet<Symbol>>>,
    trading: RwLock<HashSet<Symbol>>,
}

impl TradeCoordinator {
    pub fn new(
        plans: HashMap<Symbol, SymbolPlan>,
        store: Arc<dyn ReferenceStore>,
        gateway: Arc<dyn OrderGateway>,
        bus: EventBus,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            plans,
            store,
            gateway,
            bus,
            options,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            recomputing: Arc::new(Mutex::new(HashSet::new())),
            trading: RwLock::new(HashSet::new()),
        }
    }

    pub fn from_settings(
        settings: &Settings,
        store: Arc<dyn ReferenceStore>,
        gateway: Arc<dyn OrderGateway>,
        bus: EventBus,
    ) -> Self {
        let engines = settings.engines();
        let plans = settings
            .symbols
            .iter()
            .filter_map(|s| {
                engines.get(&s.symbol).map(|engine| {
                    (
                        s.symbol.clone(),
                        SymbolPlan {
                            engine: engine.clone(),
                            investment_amount: s.investment_amount,
                        },
                    )
                })
            })
            .collect();

        let options = CoordinatorOptions {
            seed_on_first_tick: settings.trading.seed_on_first_tick,
            retry: StoreRetryPolicy::from(&settings.database),
            ..Default::default()
        };

        Self::new(plans, store, gateway, bus, options)
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.plans.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn is_trading_enabled(&self, symbol: &str) -> bool {
        self.trading
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(symbol)
    }

    pub fn is_order_in_flight(&self, symbol: &str) -> bool {
        lock(&self.in_flight).contains(symbol)
    }

    fn plan(&self, symbol: &str) -> Result<&SymbolPlan, TradeError> {
        self.plans
            .get(symbol)
            .ok_or_else(|| TradeError::UnknownSymbol(symbol.to_string()))
    }

    fn try_acquire(&self, symbol: &str) -> Option<SymbolGuard> {
        SymbolGuard::claim(&self.in_flight, symbol)
    }

    fn try_begin_recompute(&self, symbol: &str) -> Option<SymbolGuard> {
        SymbolGuard::claim(&self.recomputing, symbol)
    }

    // ========================================================================
    // Feed health
    // ========================================================================

    /// Gate trading on feed status; only symbols with a connected feed trade
    pub fn on_status(&self, event: &StatusEvent) {
        let mut changes = Vec::new();
        {
            let mut trading = self
                .trading
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            for symbol in event.symbols.iter().filter(|s| self.plans.contains_key(*s)) {
                match event.status {
                    FeedStatus::Connected => {
                        if trading.insert(symbol.clone()) {
                            changes.push(EngineEvent::TradingResumed {
                                symbol: symbol.clone(),
                            });
                        }
                    }
                    FeedStatus::Disconnected | FeedStatus::Failed => {
                        if trading.remove(symbol) {
                            changes.push(EngineEvent::TradingPaused {
                                symbol: symbol.clone(),
                                reason: format!("feed {}", event.status.as_str()),
                            });
                        }
                    }
                }
            }
        }

        self.bus.publish(EngineEvent::StreamStatus {
            symbols: event.symbols.clone(),
            status: event.status,
            at: event.at,
        });
        for change in changes {
            self.bus.publish(change);
        }
    }

    // ========================================================================
    // Automated path
    // ========================================================================

    /// Evaluate one tick. Side effects only: may spawn one order task.
    pub async fn on_tick(self: &Arc<Self>, tick: PriceTick) {
        if !tick.is_valid() {
            tracing::debug!(symbol = %tick.symbol, price = tick.price, "Ignoring invalid tick");
            return;
        }
        let Some(plan) = self.plans.get(&tick.symbol) else {
            tracing::debug!(symbol = %tick.symbol, "Ignoring tick for unconfigured symbol");
            return;
        };
        if !self.is_trading_enabled(&tick.symbol) {
            tracing::debug!(symbol = %tick.symbol, "Ignoring tick while feed is down");
            return;
        }

        self.gateway.observe_tick(&tick);
        self.bus.publish_tick(tick.clone());

        let Some(guard) = self.try_acquire(&tick.symbol) else {
            return;
        };

        let reference = match self.load_or_seed(&tick, plan).await {
            Ok(reference) => reference,
            Err(e) => {
                tracing::warn!(symbol = %tick.symbol, "Failed to load reference price: {}", e);
                return;
            }
        };

        let holdings = if plan.engine.should_sell(&reference, &tick) {
            match self.holdings(&tick.symbol).await {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(symbol = %tick.symbol, "Failed to load holdings: {}", e);
                    return;
                }
            }
        } else {
            0.0
        };

        let request = match decide_action(plan, &reference, holdings, &tick) {
            TickAction::Hold => return,
            TickAction::Buy { quote_amount } => OrderRequest {
                symbol: tick.symbol.clone(),
                action: TradeAction::Buy,
                amount: OrderAmount::Quote(quote_amount),
            },
            TickAction::Sell { quantity } => OrderRequest {
                symbol: tick.symbol.clone(),
                action: TradeAction::Sell,
                amount: OrderAmount::Base(quantity),
            },
        };

        tracing::info!(
            symbol = %tick.symbol,
            price = tick.price,
            next_buy = reference.next_buy_price,
            next_sell = reference.next_sell_price,
            "🔔 {} threshold crossed",
            request.action
        );

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            let symbol = request.symbol.clone();
            if let Err(e) = this.execute(request, TradeOrigin::Automated).await {
                tracing::warn!(symbol = %symbol, "Automated trade cycle failed: {}", e);
            }
        });
    }

    async fn load_or_seed(
        &self,
        tick: &PriceTick,
        plan: &SymbolPlan,
    ) -> Result<ReferencePrice, StoreError> {
        let reference = with_store_retry(&self.options.retry, "get_reference_price", || {
            self.store.get_reference_price(&tick.symbol)
        })
        .await?;

        if !(self.options.seed_on_first_tick && reference.is_unset()) {
            return Ok(reference);
        }

        let seed = |current: &ReferencePrice| plan.engine.seed(current, tick.price);
        let updated = with_store_retry(&self.options.retry, "seed_reference", || {
            self.store.update_reference(&tick.symbol, &seed)
        })
        .await?;

        match updated {
            Some(update) => {
                tracing::info!(
                    symbol = %tick.symbol,
                    "🌱 Seeded next buy at ${:.4} from ${:.4}",
                    update.current.next_buy_price,
                    tick.price
                );
                self.bus.publish(EngineEvent::ThresholdUpdated {
                    symbol: tick.symbol.clone(),
                    previous: update.previous,
                    current: update.current.clone(),
                    reason: ThresholdReason::Seed,
                });
                Ok(update.current)
            }
            // Someone else wrote the row first
            None => {
                with_store_retry(&self.options.retry, "get_reference_price", || {
                    self.store.get_reference_price(&tick.symbol)
                })
                .await
            }
        }
    }

    async fn holdings(&self, symbol: &str) -> Result<f64, StoreError> {
        with_store_retry(&self.options.retry, "get_holdings", || {
            self.store.get_holdings(symbol)
        })
        .await
    }

    // ========================================================================
    // Commit path (shared by automated and manual trades)
    // ========================================================================

    async fn execute(
        &self,
        request: OrderRequest,
        origin: TradeOrigin,
    ) -> Result<TradeReport, TradeError> {
        let plan = self.plan(&request.symbol)?;

        let fill = match self.gateway.place_market_order(&request).await {
            Ok(fill) => fill,
            Err(e) => {
                self.bus.publish(EngineEvent::OrderFailed {
                    symbol: request.symbol.clone(),
                    action: request.action,
                    origin,
                    error: e.to_string(),
                    retryable: e.is_retryable(),
                });
                return Err(e.into());
            }
        };

        let trade = Trade::from_fill(&request, &fill, origin);

        if !(trade.price.is_finite() && trade.price > 0.0) {
            // Filled but unusable: thresholds cannot be derived
            let appended = self.best_effort_append(&trade).await;
            let intended = self.intended_after(&trade, plan).await;
            self.require_reconciliation(
                &trade,
                intended,
                format!("fill has no usable price; trade appended: {}", appended),
            );
            return Err(TradeError::InvalidPrice(trade.price));
        }

        let outcome = match with_store_retry(&self.options.retry, "commit_trade", || {
            self.store.commit_trade(&trade, &plan.engine)
        })
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                let appended = self.best_effort_append(&trade).await;
                let intended = self.intended_after(&trade, plan).await;
                self.require_reconciliation(
                    &trade,
                    intended,
                    format!("commit failed ({}); trade appended: {}", e, appended),
                );
                return Err(TradeError::Persistence {
                    order_id: trade.exchange_order_id.clone(),
                    source: e,
                });
            }
        };

        // The trade is in the ledger from here on, whatever verification finds
        self.bus.publish(EngineEvent::TradeExecuted {
            trade: trade.clone(),
            is_first_buy: outcome.is_first_buy,
        });

        let (reference, corrected) = self.verify_commit(&trade, &outcome.intended).await?;

        self.bus.publish(EngineEvent::ThresholdUpdated {
            symbol: trade.symbol.clone(),
            previous: outcome.previous,
            current: reference.clone(),
            reason: ThresholdReason::Trade,
        });

        Ok(TradeReport {
            trade,
            reference,
            is_first_buy: outcome.is_first_buy,
            corrected,
        })
    }

    /// Read the row back; on mismatch write the intended values once and
    /// check again
    async fn verify_commit(
        &self,
        trade: &Trade,
        intended: &ReferencePrice,
    ) -> Result<(ReferencePrice, bool), TradeError> {
        let symbol = &trade.symbol;
        let retry = &self.options.retry;

        let stored = match with_store_retry(retry, "verify_reference", || {
            self.store.get_reference_price(symbol)
        })
        .await
        {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(symbol = %symbol, "Could not read back reference after commit: {}", e);
                return Ok((intended.clone(), false));
            }
        };

        if stored.same_thresholds(intended) {
            return Ok((stored, false));
        }

        tracing::warn!(
            symbol = %symbol,
            order_id = %trade.exchange_order_id,
            stored_next_buy = stored.next_buy_price,
            intended_next_buy = intended.next_buy_price,
            "🩹 Reference row differs from commit, correcting"
        );

        match self.rewrite_reference(intended).await {
            Ok(row) if row.same_thresholds(intended) => {
                self.bus.publish(EngineEvent::ThresholdUpdated {
                    symbol: symbol.clone(),
                    previous: stored,
                    current: row.clone(),
                    reason: ThresholdReason::Correction,
                });
                Ok((row, true))
            }
            Ok(_) => {
                self.require_reconciliation(
                    trade,
                    intended.clone(),
                    "reference row still differs after correction".into(),
                );
                Err(TradeError::Reconciliation {
                    symbol: symbol.clone(),
                    order_id: trade.exchange_order_id.clone(),
                    intended: Box::new(intended.clone()),
                })
            }
            Err(e) => {
                self.require_reconciliation(
                    trade,
                    intended.clone(),
                    format!("correction failed: {}", e),
                );
                Err(TradeError::Persistence {
                    order_id: trade.exchange_order_id.clone(),
                    source: e,
                })
            }
        }
    }

    async fn rewrite_reference(&self, intended: &ReferencePrice) -> Result<ReferencePrice, StoreError> {
        let retry = &self.options.retry;
        with_store_retry(retry, "correct_reference", || {
            self.store.upsert_reference_price(intended)
        })
        .await?;
        with_store_retry(retry, "verify_reference", || {
            self.store.get_reference_price(&intended.symbol)
        })
        .await
    }

    /// Last attempt to get the fill into the ledger; idempotent by order id
    async fn best_effort_append(&self, trade: &Trade) -> bool {
        match with_store_retry(&self.options.retry, "append_trade", || {
            self.store.append_trade(trade)
        })
        .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(
                    symbol = %trade.symbol,
                    order_id = %trade.exchange_order_id,
                    "Trade could not be appended to the ledger: {}",
                    e
                );
                false
            }
        }
    }

    async fn intended_after(&self, trade: &Trade, plan: &SymbolPlan) -> ReferencePrice {
        let previous = match self.store.get_reference_price(&trade.symbol).await {
            Ok(reference) => reference,
            Err(_) => ReferencePrice::empty(&trade.symbol),
        };
        plan.engine
            .decide_thresholds(&previous, trade.action, trade.price)
            .reference
    }

    fn require_reconciliation(&self, trade: &Trade, intended: ReferencePrice, error: String) {
        tracing::error!(
            symbol = %trade.symbol,
            order_id = %trade.exchange_order_id,
            "🚨 Order filled but state is inconsistent: {}",
            error
        );
        self.bus.publish(EngineEvent::ReconciliationRequired {
            symbol: trade.symbol.clone(),
            order_id: trade.exchange_order_id.clone(),
            intended,
            error,
        });
    }

    // ========================================================================
    // Manual actions
    // ========================================================================

    /// Buy `amount` (default: configured investment) of quote currency
    pub async fn first_purchase(
        &self,
        symbol: &str,
        amount: Option<f64>,
    ) -> Result<TradeReport, TradeError> {
        let symbol = normalize_symbol(symbol);
        let plan = self.plan(&symbol)?;
        let amount = amount.unwrap_or(plan.investment_amount);
        if !(amount.is_finite() && amount > 0.0) {
            return Err(TradeError::InvalidAmount(amount));
        }

        let _guard = self
            .try_acquire(&symbol)
            .ok_or_else(|| TradeError::OrderInFlight(symbol.clone()))?;

        tracing::info!(symbol = %symbol, "🖐️  Manual purchase of ${:.2}", amount);
        self.execute(
            OrderRequest {
                symbol: symbol.clone(),
                action: TradeAction::Buy,
                amount: OrderAmount::Quote(amount),
            },
            TradeOrigin::Manual,
        )
        .await
    }

    /// Sell the full ledger holdings
    pub async fn sell_all(&self, symbol: &str) -> Result<TradeReport, TradeError> {
        let symbol = normalize_symbol(symbol);
        self.plan(&symbol)?;

        let _guard = self
            .try_acquire(&symbol)
            .ok_or_else(|| TradeError::OrderInFlight(symbol.clone()))?;

        let holdings = self.holdings(&symbol).await?;
        if holdings <= 0.0 {
            return Err(TradeError::NoHoldings(symbol));
        }

        tracing::info!(symbol = %symbol, "🖐️  Manual sell of {:.8}", holdings);
        self.execute(
            OrderRequest {
                symbol: symbol.clone(),
                action: TradeAction::Sell,
                amount: OrderAmount::Base(holdings),
            },
            TradeOrigin::Manual,
        )
        .await
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Re-derive thresholds from stored trade prices with current settings.
    /// Symbols with an order in flight are skipped; the store's row lock
    /// orders a recompute against a commit that starts after the check.
    /// Returns rows changed.
    pub async fn recompute_all(&self) -> usize {
        let mut changed = 0;

        for symbol in self.symbols() {
            let Some(plan) = self.plans.get(&symbol) else {
                continue;
            };
            if self.is_order_in_flight(&symbol) {
                tracing::debug!(symbol = %symbol, "Skipping recompute, order in flight");
                continue;
            }
            let Some(_guard) = self.try_begin_recompute(&symbol) else {
                tracing::debug!(symbol = %symbol, "Skipping recompute, already running");
                continue;
            };

            let recompute = |current: &ReferencePrice| {
                let next = plan.engine.recompute(current);
                (!next.same_thresholds(current)).then_some(next)
            };

            match with_store_retry(&self.options.retry, "recompute_reference", || {
                self.store.update_reference(&symbol, &recompute)
            })
            .await
            {
                Ok(Some(update)) => {
                    changed += 1;
                    self.bus.publish(EngineEvent::ThresholdUpdated {
                        symbol: symbol.clone(),
                        previous: update.previous,
                        current: update.current,
                        reason: ThresholdReason::Recompute,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(symbol = %symbol, "Recompute failed: {}", e);
                }
            }
        }

        changed
    }

    pub async fn snapshot(&self, symbol: &str) -> Result<SymbolSnapshot, TradeError> {
        let symbol = normalize_symbol(symbol);
        self.plan(&symbol)?;
        let retry = &self.options.retry;

        let reference = with_store_retry(retry, "get_reference_price", || {
            self.store.get_reference_price(&symbol)
        })
        .await?;
        let holdings = self.holdings(&symbol).await?;
        let recent_trades = with_store_retry(retry, "recent_trades", || {
            self.store.recent_trades(&symbol, 5)
        })
        .await?;

        Ok(SymbolSnapshot {
            trading_enabled: self.is_trading_enabled(&symbol),
            order_in_flight: self.is_order_in_flight(&symbol),
            symbol,
            reference,
            holdings,
            recent_trades,
        })
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Fan ticks out to one sequential worker per symbol and apply status
    /// transitions. Runs until the tick channel closes.
    pub fn spawn_router(
        self: Arc<Self>,
        mut ticks: mpsc::Receiver<PriceTick>,
        mut status: mpsc::UnboundedReceiver<StatusEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut workers: HashMap<Symbol, mpsc::Sender<PriceTick>> = HashMap::new();
            for symbol in self.symbols() {
                let (tx, mut rx) = mpsc::channel::<PriceTick>(self.options.worker_queue.max(1));
                let this = Arc::clone(&self);
                tokio::spawn(async move {
                    while let Some(tick) = rx.recv().await {
                        this.on_tick(tick).await;
                    }
                });
                workers.insert(symbol, tx);
            }

            let mut status_open = true;
            loop {
                tokio::select! {
                    biased;

                    event = status.recv(), if status_open => match event {
                        Some(event) => self.on_status(&event),
                        None => status_open = false,
                    },
                    tick = ticks.recv() => match tick {
                        Some(tick) => match workers.get(&tick.symbol) {
                            Some(worker) => {
                                if let Err(mpsc::error::TrySendError::Full(tick)) = worker.try_send(tick) {
                                    tracing::debug!(symbol = %tick.symbol, "Worker busy, dropping tick");
                                }
                            }
                            None => {
                                tracing::debug!(symbol = %tick.symbol, "No worker for symbol");
                            }
                        },
                        None => break,
                    },
                }
            }

            tracing::debug!("Tick router stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryStore;
    use crate::error::ExchangeError;
    use crate::exchange::PaperGateway;
    use crate::models::OrderFill;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::broadcast;

    /// Fills at a scripted price after an optional delay and tracks overlap
    struct MockGateway {
        results: Mutex<VecDeque<std::result::Result<f64, ExchangeError>>>,
        delay: Duration,
        calls: AtomicU32,
        active: AtomicU32,
        max_active: AtomicU32,
    }

    impl MockGateway {
        fn new(results: Vec<std::result::Result<f64, ExchangeError>>, delay: Duration) -> Self {
            Self {
                results: Mutex::new(results.into()),
                delay,
                calls: AtomicU32::new(0),
                active: AtomicU32::new(0),
                max_active: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl OrderGateway for MockGateway {
        async fn place_market_order(
            &self,
            request: &OrderRequest,
        ) -> std::result::Result<OrderFill, ExchangeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;
            let result = lock(&self.results)
                .pop_front()
                .unwrap_or(Err(ExchangeError::Rejected("no scripted result".into())));
            self.active.fetch_sub(1, Ordering::SeqCst);

            let price = result?;
            let quantity = match request.amount {
                OrderAmount::Quote(q) => q / price,
                OrderAmount::Base(b) => b,
            };
            Ok(OrderFill {
                filled_quantity: quantity,
                avg_price: price,
                quote_amount: quantity * price,
                order_id: format!("mock-{}", n),
            })
        }

        fn name(&self) -> &'static str {
            "mock"
        }
    }

    fn plans() -> HashMap<Symbol, SymbolPlan> {
        let mut plans = HashMap::new();
        plans.insert(
            "BTCUSDT".to_string(),
            SymbolPlan {
                engine: ThresholdEngine::new(0.05, 0.05),
                investment_amount: 50.0,
            },
        );
        plans
    }

    fn options() -> CoordinatorOptions {
        CoordinatorOptions {
            seed_on_first_tick: false,
            retry: StoreRetryPolicy {
                max_retries: 2,
                delay: Duration::from_millis(1),
            },
            worker_queue: 16,
        }
    }

    fn coordinator(
        store: Arc<InMemoryStore>,
        gateway: Arc<dyn OrderGateway>,
        options: CoordinatorOptions,
    ) -> Arc<TradeCoordinator> {
        Arc::new(TradeCoordinator::new(
            plans(),
            store,
            gateway,
            EventBus::new(64),
            options,
        ))
    }

    fn connect(coordinator: &TradeCoordinator) {
        coordinator.on_status(&StatusEvent {
            group: 1,
            symbols: vec!["BTCUSDT".to_string()],
            status: FeedStatus::Connected,
            at: Utc::now(),
        });
    }

    fn tick(price: f64) -> PriceTick {
        PriceTick {
            symbol: "BTCUSDT".to_string(),
            price,
            timestamp: Utc::now(),
        }
    }

    async fn wait_idle(coordinator: &TradeCoordinator) {
        for _ in 0..200 {
            if !coordinator.is_order_in_flight("BTCUSDT") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("order still in flight");
    }

    fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_decide_action() {
        let plan = plans().remove("BTCUSDT").unwrap();
        let reference = ReferencePrice {
            first_transaction_price: 100.0,
            last_transaction_price: 100.0,
            next_buy_price: 95.0,
            next_sell_price: 105.0,
            ..ReferencePrice::empty("BTCUSDT")
        };

        assert_eq!(decide_action(&plan, &reference, 0.5, &tick(104.9)), TickAction::Hold);
        assert_eq!(
            decide_action(&plan, &reference, 0.5, &tick(105.0)),
            TickAction::Sell { quantity: 0.5 }
        );
        assert_eq!(
            decide_action(&plan, &reference, 0.5, &tick(94.0)),
            TickAction::Buy { quote_amount: 50.0 }
        );
        // Sell target hit with nothing to sell
        assert_eq!(decide_action(&plan, &reference, 0.0, &tick(106.0)), TickAction::Hold);
    }

    #[tokio::test]
    async fn test_ticks_ignored_until_feed_connected() {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(MockGateway::new(vec![Ok(94.0)], Duration::ZERO));
        let coordinator = coordinator(store.clone(), gateway.clone(), options());

        store
            .upsert_reference_price(&ReferencePrice {
                next_buy_price: 95.0,
                ..ReferencePrice::empty("BTCUSDT")
            })
            .await
            .unwrap();

        coordinator.on_tick(tick(94.0)).await;
        wait_idle(&coordinator).await;
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 0);

        connect(&coordinator);
        coordinator.on_tick(tick(-1.0)).await;
        coordinator.on_tick(tick(f64::NAN)).await;
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 0);

        coordinator.on_tick(tick(94.0)).await;
        wait_idle(&coordinator).await;
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_burst_of_ticks_submits_one_order() {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(MockGateway::new(
            vec![Ok(94.0), Ok(94.0), Ok(94.0)],
            Duration::from_millis(50),
        ));
        let coordinator = coordinator(store.clone(), gateway.clone(), options());
        connect(&coordinator);

        store
            .upsert_reference_price(&ReferencePrice {
                next_buy_price: 95.0,
                ..ReferencePrice::empty("BTCUSDT")
            })
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let c = coordinator.clone();
            handles.push(tokio::spawn(async move { c.on_tick(tick(94.0)).await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        wait_idle(&coordinator).await;

        assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(store.trades().await.len(), 1);
    }

    #[tokio::test]
    async fn test_manual_buy_then_automated_sell() {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(MockGateway::new(vec![Ok(100.0), Ok(105.0)], Duration::ZERO));
        let coordinator = coordinator(store.clone(), gateway.clone(), options());
        connect(&coordinator);

        let report = coordinator.first_purchase("btcusdt", None).await.unwrap();
        assert!(report.is_first_buy);
        assert_eq!(report.trade.origin, TradeOrigin::Manual);
        assert_eq!(report.reference.next_buy_price, 95.0);
        assert_eq!(report.reference.next_sell_price, 105.0);
        assert_eq!(store.get_holdings("BTCUSDT").await.unwrap(), 0.5);

        coordinator.on_tick(tick(104.9)).await;
        wait_idle(&coordinator).await;
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);

        coordinator.on_tick(tick(105.0)).await;
        wait_idle(&coordinator).await;
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 2);

        let reference = store.get_reference_price("BTCUSDT").await.unwrap();
        assert_eq!(reference.first_transaction_price, 0.0);
        assert_eq!(reference.next_sell_price, 0.0);
        assert_eq!(reference.next_buy_price, 99.75);
        assert_eq!(store.get_holdings("BTCUSDT").await.unwrap(), 0.0);

        let trades = store.trades().await;
        assert_eq!(trades[1].action, TradeAction::Sell);
        assert_eq!(trades[1].quantity, 0.5);
        assert_eq!(trades[1].origin, TradeOrigin::Automated);
    }

    #[tokio::test]
    async fn test_order_failure_leaves_state_untouched() {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(MockGateway::new(
            vec![Err(ExchangeError::Timeout)],
            Duration::ZERO,
        ));
        let coordinator = coordinator(store.clone(), gateway, options());
        let mut events = coordinator.bus().subscribe();

        let err = coordinator.first_purchase("BTCUSDT", None).await.unwrap_err();
        assert!(matches!(err, TradeError::Exchange(ExchangeError::Timeout)));

        assert!(store.trades().await.is_empty());
        assert!(store.get_reference_price("BTCUSDT").await.unwrap().is_unset());
        assert!(!coordinator.is_order_in_flight("BTCUSDT"));

        let events = drain(&mut events);
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::OrderFailed { retryable: true, .. }
        )));
    }

    #[tokio::test]
    async fn test_manual_action_rejected_while_order_in_flight() {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(MockGateway::new(
            vec![Ok(94.0)],
            Duration::from_millis(100),
        ));
        let coordinator = coordinator(store.clone(), gateway.clone(), options());
        connect(&coordinator);

        store
            .upsert_reference_price(&ReferencePrice {
                next_buy_price: 95.0,
                ..ReferencePrice::empty("BTCUSDT")
            })
            .await
            .unwrap();

        coordinator.on_tick(tick(94.0)).await;
        assert!(coordinator.is_order_in_flight("BTCUSDT"));

        let err = coordinator.first_purchase("BTCUSDT", None).await.unwrap_err();
        assert!(matches!(err, TradeError::OrderInFlight(_)));

        wait_idle(&coordinator).await;
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sell_all_without_holdings() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = coordinator(store, Arc::new(PaperGateway::new()), options());

        let err = coordinator.sell_all("BTCUSDT").await.unwrap_err();
        assert!(matches!(err, TradeError::NoHoldings(_)));

        let err = coordinator.sell_all("DOGEUSDT").await.unwrap_err();
        assert!(matches!(err, TradeError::UnknownSymbol(_)));

        let err = coordinator
            .first_purchase("BTCUSDT", Some(-5.0))
            .await
            .unwrap_err();
        assert!(matches!(err, TradeError::InvalidAmount(_)));
    }

    #[tokio::test]
    async fn test_transient_commit_errors_are_retried() {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(MockGateway::new(vec![Ok(100.0)], Duration::ZERO));
        let coordinator = coordinator(store.clone(), gateway, options());
        store.fail_next_commits(2, true).await;

        let report = coordinator.first_purchase("BTCUSDT", None).await.unwrap();
        assert_eq!(report.reference.next_sell_price, 105.0);
        assert_eq!(store.commit_calls().await, 3);
        assert_eq!(store.trades().await.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_commit_requires_reconciliation() {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(MockGateway::new(vec![Ok(100.0)], Duration::ZERO));
        let coordinator = coordinator(store.clone(), gateway, options());
        let mut events = coordinator.bus().subscribe();
        store.fail_next_commits(10, true).await;

        let err = coordinator.first_purchase("BTCUSDT", None).await.unwrap_err();
        match err {
            TradeError::Persistence { order_id, source } => {
                assert_eq!(order_id, "mock-1");
                assert!(matches!(source, StoreError::RetriesExhausted { attempts: 3, .. }));
            }
            other => panic!("expected persistence error, got {:?}", other),
        }

        // Ledger kept, reference left stale
        assert_eq!(store.trades().await.len(), 1);
        assert!(store.get_reference_price("BTCUSDT").await.unwrap().is_unset());

        let events = drain(&mut events);
        let intended = events.iter().find_map(|e| match e {
            EngineEvent::ReconciliationRequired { intended, .. } => Some(intended.clone()),
            _ => None,
        });
        assert_eq!(intended.unwrap().next_sell_price, 105.0);
        assert!(!events
            .iter()
            .any(|e| matches!(e, EngineEvent::TradeExecuted { .. })));
    }

    #[tokio::test]
    async fn test_lost_update_is_corrected_once() {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(MockGateway::new(vec![Ok(100.0)], Duration::ZERO));
        let coordinator = coordinator(store.clone(), gateway, options());
        let mut events = coordinator.bus().subscribe();
        store
            .interfere_after_writes(1, ReferencePrice::empty("BTCUSDT"))
            .await;

        let report = coordinator.first_purchase("BTCUSDT", None).await.unwrap();
        assert!(report.corrected);

        let stored = store.get_reference_price("BTCUSDT").await.unwrap();
        assert_eq!(stored.next_sell_price, 105.0);
        assert_eq!(stored.next_buy_price, 95.0);

        assert!(drain(&mut events).iter().any(|e| matches!(
            e,
            EngineEvent::ThresholdUpdated {
                reason: ThresholdReason::Correction,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_persistent_mismatch_surfaces_reconciliation() {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(MockGateway::new(vec![Ok(100.0)], Duration::ZERO));
        let coordinator = coordinator(store.clone(), gateway, options());
        let mut events = coordinator.bus().subscribe();
        store
            .interfere_after_writes(2, ReferencePrice::empty("BTCUSDT"))
            .await;

        let err = coordinator.first_purchase("BTCUSDT", None).await.unwrap_err();
        match err {
            TradeError::Reconciliation { intended, .. } => {
                assert_eq!(intended.next_sell_price, 105.0);
            }
            other => panic!("expected reconciliation error, got {:?}", other),
        }
        assert!(!coordinator.is_order_in_flight("BTCUSDT"));

        // The committed trade is still announced
        let kinds: Vec<&str> = drain(&mut events).iter().map(|e| e.kind()).collect();
        assert!(kinds.contains(&"trade_executed"));
        assert!(kinds.contains(&"reconciliation_required"));
        let executed = kinds.iter().position(|k| *k == "trade_executed");
        let reconcile = kinds.iter().position(|k| *k == "reconciliation_required");
        assert!(executed < reconcile);
        assert_eq!(store.trades().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unusable_fill_price_reports_ledger_append() {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(MockGateway::new(vec![Ok(0.0)], Duration::ZERO));
        let coordinator = coordinator(store.clone(), gateway, options());
        let mut events = coordinator.bus().subscribe();

        let err = coordinator.first_purchase("BTCUSDT", None).await.unwrap_err();
        assert!(matches!(err, TradeError::InvalidPrice(_)));
        assert_eq!(store.trades().await.len(), 1);
        assert!(store.get_reference_price("BTCUSDT").await.unwrap().is_unset());

        let error = drain(&mut events).into_iter().find_map(|e| match e {
            EngineEvent::ReconciliationRequired { error, .. } => Some(error),
            _ => None,
        });
        let error = error.unwrap();
        assert!(error.contains("no usable price"));
        assert!(error.contains("trade appended: true"));
    }

    #[tokio::test]
    async fn test_first_tick_seeds_buy_threshold() {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(MockGateway::new(vec![], Duration::ZERO));
        let coordinator = coordinator(
            store.clone(),
            gateway.clone(),
            CoordinatorOptions {
                seed_on_first_tick: true,
                ..options()
            },
        );
        connect(&coordinator);

        coordinator.on_tick(tick(200.0)).await;
        let reference = store.get_reference_price("BTCUSDT").await.unwrap();
        assert_eq!(reference.next_buy_price, 190.0);
        assert_eq!(reference.last_transaction_price, 0.0);
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 0);

        // Already seeded: a lower tick does not reseed
        coordinator.on_tick(tick(195.0)).await;
        assert_eq!(
            store.get_reference_price("BTCUSDT").await.unwrap().next_buy_price,
            190.0
        );
    }

    #[tokio::test]
    async fn test_recompute_applies_new_percentages() {
        let store = Arc::new(InMemoryStore::new());
        store
            .upsert_reference_price(&ReferencePrice {
                first_transaction_price: 100.0,
                last_transaction_price: 80.0,
                next_buy_price: 76.0,
                next_sell_price: 105.0,
                ..ReferencePrice::empty("BTCUSDT")
            })
            .await
            .unwrap();

        let mut plans = plans();
        plans.insert(
            "BTCUSDT".to_string(),
            SymbolPlan {
                engine: ThresholdEngine::new(0.10, 0.20),
                investment_amount: 50.0,
            },
        );
        let coordinator = TradeCoordinator::new(
            plans,
            store.clone(),
            Arc::new(PaperGateway::new()),
            EventBus::new(16),
            options(),
        );

        assert_eq!(coordinator.recompute_all().await, 1);
        let reference = store.get_reference_price("BTCUSDT").await.unwrap();
        assert_eq!(reference.next_buy_price, 72.0);
        assert_eq!(reference.next_sell_price, 120.0);

        // Nothing left to change
        assert_eq!(coordinator.recompute_all().await, 0);
    }

    #[tokio::test]
    async fn test_manual_purchase_allowed_during_recompute() {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(MockGateway::new(vec![Ok(100.0)], Duration::ZERO));
        let coordinator = coordinator(store.clone(), gateway, options());

        let recompute = coordinator.try_begin_recompute("BTCUSDT").unwrap();
        assert!(!coordinator.is_order_in_flight("BTCUSDT"));

        let report = coordinator.first_purchase("BTCUSDT", None).await.unwrap();
        assert_eq!(report.reference.next_sell_price, 105.0);

        // A second recompute of the same symbol is skipped, not queued
        assert!(coordinator.try_begin_recompute("BTCUSDT").is_none());
        assert_eq!(coordinator.recompute_all().await, 0);

        drop(recompute);
        assert!(coordinator.try_begin_recompute("BTCUSDT").is_some());
    }

    #[tokio::test]
    async fn test_recompute_skips_symbol_with_order_in_flight() {
        let store = Arc::new(InMemoryStore::new());
        store
            .upsert_reference_price(&ReferencePrice {
                first_transaction_price: 100.0,
                last_transaction_price: 80.0,
                next_buy_price: 70.0,
                next_sell_price: 105.0,
                ..ReferencePrice::empty("BTCUSDT")
            })
            .await
            .unwrap();
        let coordinator = coordinator(store.clone(), Arc::new(PaperGateway::new()), options());

        let order = coordinator.try_acquire("BTCUSDT").unwrap();
        assert_eq!(coordinator.recompute_all().await, 0);
        assert_eq!(
            store.get_reference_price("BTCUSDT").await.unwrap().next_buy_price,
            70.0
        );

        drop(order);
        assert_eq!(coordinator.recompute_all().await, 1);
        assert_eq!(
            store.get_reference_price("BTCUSDT").await.unwrap().next_buy_price,
            76.0
        );
    }

    #[tokio::test]
    async fn test_status_transitions_publish_pause_and_resume() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = coordinator(store, Arc::new(PaperGateway::new()), options());
        let mut events = coordinator.bus().subscribe();

        connect(&coordinator);
        assert!(coordinator.is_trading_enabled("BTCUSDT"));
        coordinator.on_status(&StatusEvent {
            group: 1,
            symbols: vec!["BTCUSDT".to_string()],
            status: FeedStatus::Disconnected,
            at: Utc::now(),
        });
        assert!(!coordinator.is_trading_enabled("BTCUSDT"));

        let kinds: Vec<&str> = drain(&mut events).iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                "stream_status",
                "trading_resumed",
                "stream_status",
                "trading_paused"
            ]
        );
    }

    #[tokio::test]
    async fn test_snapshot() {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(MockGateway::new(vec![Ok(100.0)], Duration::ZERO));
        let coordinator = coordinator(store, gateway, options());
        coordinator.first_purchase("BTCUSDT", Some(25.0)).await.unwrap();

        let snapshot = coordinator.snapshot("btcusdt").await.unwrap();
        assert_eq!(snapshot.holdings, 0.25);
        assert_eq!(snapshot.reference.first_transaction_price, 100.0);
        assert_eq!(snapshot.recent_trades.len(), 1);
        assert!(!snapshot.trading_enabled);
        assert!(!snapshot.order_in_flight);
    }
}
