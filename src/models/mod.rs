use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trading pair identifier, e.g. "BTCUSDT"
pub type Symbol = String;

/// Normalize a symbol the way the exchange reports it (uppercase, no whitespace)
pub fn normalize_symbol(raw: &str) -> Symbol {
    raw.trim().to_uppercase()
}

/// A single price observation for a symbol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceTick {
    pub symbol: Symbol,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

impl PriceTick {
    /// Non-positive, NaN and infinite prices are never actionable
    pub fn is_valid(&self) -> bool {
        self.price.is_finite() && self.price > 0.0
    }
}

/// Persisted per-symbol thresholds
///
/// `first_transaction_price == 0` means no open position (next buy is a first buy).
/// `next_sell_price == 0` means no active sell target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReferencePrice {
    pub symbol: Symbol,
    pub first_transaction_price: f64,
    pub last_transaction_price: f64,
    pub next_buy_price: f64,
    pub next_sell_price: f64,
    pub updated_at: DateTime<Utc>,
}

impl ReferencePrice {
    /// All-zero row created lazily on first reference
    pub fn empty(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            first_transaction_price: 0.0,
            last_transaction_price: 0.0,
            next_buy_price: 0.0,
            next_sell_price: 0.0,
            updated_at: Utc::now(),
        }
    }

    pub fn has_open_position(&self) -> bool {
        self.first_transaction_price > 0.0
    }

    pub fn is_unset(&self) -> bool {
        self.first_transaction_price == 0.0
            && self.last_transaction_price == 0.0
            && self.next_buy_price == 0.0
            && self.next_sell_price == 0.0
    }

    /// Compare decision fields only; `updated_at` is observability-only
    pub fn same_thresholds(&self, other: &ReferencePrice) -> bool {
        prices_match(self.first_transaction_price, other.first_transaction_price)
            && prices_match(self.last_transaction_price, other.last_transaction_price)
            && prices_match(self.next_buy_price, other.next_buy_price)
            && prices_match(self.next_sell_price, other.next_sell_price)
    }
}

/// NUMERIC columns round-trip through Decimal, so compare with a relative tolerance
pub fn prices_match(a: f64, b: f64) -> bool {
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= scale * 1e-9
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Buy,
    Sell,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "buy",
            TradeAction::Sell => "sell",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "buy" => Some(TradeAction::Buy),
            "sell" => Some(TradeAction::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who asked for the trade. Both go through the same commit path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TradeOrigin {
    Automated,
    Manual,
}

impl TradeOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeOrigin::Automated => "automated",
            TradeOrigin::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "automated" => Some(TradeOrigin::Automated),
            "manual" => Some(TradeOrigin::Manual),
            _ => None,
        }
    }
}

/// How much to trade
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderAmount {
    /// Spend this much quote currency (buys)
    Quote(f64),
    /// Sell/buy this many base units
    Base(f64),
}

/// Market order request handed to the exchange gateway
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub action: TradeAction,
    pub amount: OrderAmount,
}

/// Confirmed fill returned by the exchange gateway
#[derive(Debug, Clone, PartialEq)]
pub struct OrderFill {
    /// Net base quantity credited (buys) or debited (sells)
    pub filled_quantity: f64,
    pub avg_price: f64,
    /// Quote asset actually spent or received
    pub quote_amount: f64,
    pub order_id: String,
}

/// Immutable ledger entry, created exactly once per confirmed order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub id: Uuid,
    pub symbol: Symbol,
    pub action: TradeAction,
    pub quantity: f64,
    pub price: f64,
    pub quote_amount: f64,
    pub timestamp: DateTime<Utc>,
    pub exchange_order_id: String,
    pub origin: TradeOrigin,
}

impl Trade {
    pub fn from_fill(request: &OrderRequest, fill: &OrderFill, origin: TradeOrigin) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: request.symbol.clone(),
            action: request.action,
            quantity: fill.filled_quantity,
            price: fill.avg_price,
            quote_amount: fill.quote_amount,
            timestamp: Utc::now(),
            exchange_order_id: fill.order_id.clone(),
            origin,
        }
    }
}

/// Net quantity held: sum of buys minus sum of sells
pub fn net_holdings(trades: &[Trade], symbol: &str) -> f64 {
    trades
        .iter()
        .filter(|t| t.symbol == symbol)
        .map(|t| match t.action {
            TradeAction::Buy => t.quantity,
            TradeAction::Sell => -t.quantity,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(symbol: &str, action: TradeAction, quantity: f64) -> Trade {
        Trade {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            action,
            quantity,
            price: 100.0,
            quote_amount: quantity * 100.0,
            timestamp: Utc::now(),
            exchange_order_id: Uuid::new_v4().to_string(),
            origin: TradeOrigin::Automated,
        }
    }

    #[test]
    fn test_tick_validity() {
        let mut tick = PriceTick {
            symbol: "BTCUSDT".to_string(),
            price: 100.0,
            timestamp: Utc::now(),
        };
        assert!(tick.is_valid());

        tick.price = 0.0;
        assert!(!tick.is_valid());
        tick.price = -1.0;
        assert!(!tick.is_valid());
        tick.price = f64::NAN;
        assert!(!tick.is_valid());
    }

    #[test]
    fn test_empty_reference_is_unset() {
        let reference = ReferencePrice::empty("BTCUSDT");
        assert!(reference.is_unset());
        assert!(!reference.has_open_position());
    }

    #[test]
    fn test_net_holdings_per_symbol() {
        let trades = vec![
            trade("BTCUSDT", TradeAction::Buy, 0.5),
            trade("BTCUSDT", TradeAction::Buy, 0.25),
            trade("ETHUSDT", TradeAction::Buy, 3.0),
            trade("BTCUSDT", TradeAction::Sell, 0.75),
        ];

        assert_eq!(net_holdings(&trades, "BTCUSDT"), 0.0);
        assert_eq!(net_holdings(&trades, "ETHUSDT"), 3.0);
        assert_eq!(net_holdings(&trades, "SOLUSDT"), 0.0);
    }

    #[test]
    fn test_same_thresholds_ignores_updated_at() {
        let a = ReferencePrice {
            symbol: "BTCUSDT".to_string(),
            first_transaction_price: 100.0,
            last_transaction_price: 100.0,
            next_buy_price: 95.0,
            next_sell_price: 105.0,
            updated_at: Utc::now(),
        };
        let mut b = a.clone();
        b.updated_at = Utc::now() + chrono::Duration::seconds(30);
        b.next_buy_price = 95.000000000001;
        assert!(a.same_thresholds(&b));

        b.next_sell_price = 0.0;
        assert!(!a.same_thresholds(&b));
    }

    #[test]
    fn test_action_round_trip_strings() {
        assert_eq!(TradeAction::parse("buy"), Some(TradeAction::Buy));
        assert_eq!(TradeAction::parse("sell"), Some(TradeAction::Sell));
        assert_eq!(TradeAction::parse("hold"), None);
        assert_eq!(normalize_symbol(" btcusdt "), "BTCUSDT");
    }
}
