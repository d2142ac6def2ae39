use super::{CommitOutcome, ReferenceStore, ReferenceUpdate, UpdatedReference};
use crate::error::StoreError;
use crate::models::{net_holdings, ReferencePrice, Symbol, Trade};
use crate::strategy::ThresholdEngine;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Default)]
struct MemoryState {
    references: HashMap<Symbol, ReferencePrice>,
    trades: Vec<Trade>,
    failing_commits: u32,
    failures_are_transient: bool,
    /// Row written over the reference after each of the next N writes
    interference: Option<(u32, ReferencePrice)>,
    commit_calls: u32,
}

/// Process-local store with the same locking semantics as Postgres.
///
/// One mutex guards everything, so each call is atomic. Used by the paper
/// mode without a database, the `status` command in tests, and fault
/// injection in coordinator tests.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail before touching any state
    pub async fn fail_next_commits(&self, n: u32, transient: bool) {
        let mut state = self.state.lock().await;
        state.failing_commits = n;
        state.failures_are_transient = transient;
    }

    /// Simulate a lost update: after each of the next `n` reference writes the
    /// row is silently replaced by `row`
    pub async fn interfere_after_writes(&self, n: u32, row: ReferencePrice) {
        self.state.lock().await.interference = Some((n, row));
    }

    pub async fn commit_calls(&self) -> u32 {
        self.state.lock().await.commit_calls
    }

    pub async fn trades(&self) -> Vec<Trade> {
        self.state.lock().await.trades.clone()
    }

    fn interfere(state: &mut MemoryState, symbol: &str) {
        let Some((remaining, row)) = state.interference.take() else {
            return;
        };
        let mut clobbered = row.clone();
        clobbered.symbol = symbol.to_string();
        state.references.insert(symbol.to_string(), clobbered);
        if remaining > 1 {
            state.interference = Some((remaining - 1, row));
        }
    }
}

#[async_trait]
impl ReferenceStore for InMemoryStore {
    async fn get_reference_price(&self, symbol: &str) -> Result<ReferencePrice, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state
            .references
            .entry(symbol.to_string())
            .or_insert_with(|| ReferencePrice::empty(symbol))
            .clone())
    }

    async fn upsert_reference_price(
        &self,
        reference: &ReferencePrice,
    ) -> Result<ReferencePrice, StoreError> {
        let mut state = self.state.lock().await;
        state
            .references
            .insert(reference.symbol.clone(), reference.clone());
        Self::interfere(&mut state, &reference.symbol);
        Ok(reference.clone())
    }

    async fn append_trade(&self, trade: &Trade) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state
            .trades
            .iter()
            .any(|t| t.exchange_order_id == trade.exchange_order_id)
        {
            return Ok(false);
        }
        state.trades.push(trade.clone());
        Ok(true)
    }

    async fn get_holdings(&self, symbol: &str) -> Result<f64, StoreError> {
        let state = self.state.lock().await;
        Ok(net_holdings(&state.trades, symbol))
    }

    async fn recent_trades(&self, symbol: &str, limit: i64) -> Result<Vec<Trade>, StoreError> {
        let state = self.state.lock().await;
        let mut trades: Vec<Trade> = state
            .trades
            .iter()
            .filter(|t| t.symbol == symbol)
            .cloned()
            .collect();
        trades.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        trades.truncate(limit.max(0) as usize);
        Ok(trades)
    }

    async fn commit_trade(
        &self,
        trade: &Trade,
        engine: &ThresholdEngine,
    ) -> Result<CommitOutcome, StoreError> {
        let mut state = self.state.lock().await;
        state.commit_calls += 1;

        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(if state.failures_are_transient {
                StoreError::Transient("could not serialize access due to concurrent update".into())
            } else {
                StoreError::Permanent("relation \"reference_prices\" does not exist".into())
            });
        }

        let previous = state
            .references
            .get(&trade.symbol)
            .cloned()
            .unwrap_or_else(|| ReferencePrice::empty(&trade.symbol));

        let trade_inserted = !state
            .trades
            .iter()
            .any(|t| t.exchange_order_id == trade.exchange_order_id);
        if trade_inserted {
            state.trades.push(trade.clone());
        }

        let decision = engine.decide_thresholds(&previous, trade.action, trade.price);
        state
            .references
            .insert(trade.symbol.clone(), decision.reference.clone());
        Self::interfere(&mut state, &trade.symbol);

        Ok(CommitOutcome {
            previous,
            intended: decision.reference.clone(),
            committed: decision.reference,
            is_first_buy: decision.is_first_buy,
            trade_inserted,
        })
    }

    async fn update_reference(
        &self,
        symbol: &str,
        update: ReferenceUpdate<'_>,
    ) -> Result<Option<UpdatedReference>, StoreError> {
        let mut state = self.state.lock().await;
        let previous = state
            .references
            .entry(symbol.to_string())
            .or_insert_with(|| ReferencePrice::empty(symbol))
            .clone();

        match update(&previous) {
            Some(next) => {
                state.references.insert(symbol.to_string(), next.clone());
                Ok(Some(UpdatedReference {
                    previous,
                    current: next,
                }))
            }
            None => Ok(None),
        }
    }
}
