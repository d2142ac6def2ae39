use crate::models::{PriceTick, ReferencePrice, TradeAction};
use chrono::Utc;

/// Default tolerance above `next_buy_price` that still counts as a crossing
pub const DEFAULT_BUY_BUFFER_PCT: f64 = 0.005;

/// Per-symbol threshold logic
///
/// Pure: no I/O, no clock reads other than stamping `updated_at`.
///
/// - Every trade moves `next_buy_price` to `price × (1 − buy_pct)`.
/// - Only a first buy (no open position) sets `next_sell_price`; later buys
///   leave the profit target where it is, so averaging down never moves it.
/// - Any sell closes the cycle: first price and sell target go back to 0.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdEngine {
    buy_pct: f64,
    sell_pct: f64,
    buy_buffer_pct: f64,
}

/// Outcome of a trade decision, kept for logging and events
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdDecision {
    pub reference: ReferencePrice,
    pub is_first_buy: bool,
}

impl ThresholdEngine {
    pub fn new(buy_pct: f64, sell_pct: f64) -> Self {
        Self {
            buy_pct,
            sell_pct,
            buy_buffer_pct: DEFAULT_BUY_BUFFER_PCT,
        }
    }

    pub fn with_buy_buffer(mut self, buy_buffer_pct: f64) -> Self {
        self.buy_buffer_pct = buy_buffer_pct;
        self
    }

    pub fn buy_pct(&self) -> f64 {
        self.buy_pct
    }

    pub fn sell_pct(&self) -> f64 {
        self.sell_pct
    }

    pub fn buy_threshold_for(&self, price: f64) -> f64 {
        price * (1.0 - self.buy_pct)
    }

    pub fn sell_threshold_for(&self, price: f64) -> f64 {
        price * (1.0 + self.sell_pct)
    }

    /// Next reference state after a confirmed trade at `price`
    pub fn decide_thresholds(
        &self,
        prev: &ReferencePrice,
        action: TradeAction,
        price: f64,
    ) -> ThresholdDecision {
        let mut next = prev.clone();
        let mut is_first_buy = false;

        next.next_buy_price = self.buy_threshold_for(price);

        match action {
            TradeAction::Buy => {
                is_first_buy = prev.first_transaction_price == 0.0;
                if is_first_buy {
                    next.first_transaction_price = price;
                    next.next_sell_price = self.sell_threshold_for(price);
                }
            }
            TradeAction::Sell => {
                // Any sell is treated as full liquidation
                next.first_transaction_price = 0.0;
                next.next_sell_price = 0.0;
            }
        }

        next.last_transaction_price = price;
        next.updated_at = Utc::now();

        tracing::debug!(
            symbol = %prev.symbol,
            %action,
            price,
            is_first_buy,
            next_buy = next.next_buy_price,
            next_sell = next.next_sell_price,
            "Computed thresholds"
        );

        ThresholdDecision {
            reference: next,
            is_first_buy,
        }
    }

    /// Tick is at or below the buy threshold, allowing `buy_buffer_pct` slack
    pub fn should_buy(&self, reference: &ReferencePrice, tick: &PriceTick) -> bool {
        reference.next_buy_price > 0.0
            && tick.price <= reference.next_buy_price * (1.0 + self.buy_buffer_pct)
    }

    /// Tick is at or above the sell threshold
    pub fn should_sell(&self, reference: &ReferencePrice, tick: &PriceTick) -> bool {
        reference.next_sell_price > 0.0 && tick.price >= reference.next_sell_price
    }

    /// Give an untouched row a buy threshold from the current price.
    /// Returns None when the row already carries state.
    pub fn seed(&self, prev: &ReferencePrice, price: f64) -> Option<ReferencePrice> {
        if !prev.is_unset() || !(price.is_finite() && price > 0.0) {
            return None;
        }

        let mut next = prev.clone();
        next.next_buy_price = self.buy_threshold_for(price);
        next.updated_at = Utc::now();
        Some(next)
    }

    /// Rebuild thresholds from persisted trade prices with the current percentages
    pub fn recompute(&self, prev: &ReferencePrice) -> ReferencePrice {
        let mut next = prev.clone();

        if prev.last_transaction_price > 0.0 {
            next.next_buy_price = self.buy_threshold_for(prev.last_transaction_price);
        }
        next.next_sell_price = if prev.first_transaction_price > 0.0 {
            self.sell_threshold_for(prev.first_transaction_price)
        } else {
            0.0
        };

        if !next.same_thresholds(prev) {
            next.updated_at = Utc::now();
        }
        next
    }
}
