use super::OrderGateway;
use crate::error::ExchangeError;
use crate::models::{OrderAmount, OrderFill, OrderRequest, PriceTick, Symbol};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Fills market orders at the last observed tick price
#[derive(Default)]
pub struct PaperGateway {
    prices: RwLock<HashMap<Symbol, f64>>,
    next_order: AtomicU64,
}

impl PaperGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        let mut prices = self
            .prices
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        prices.insert(symbol.to_string(), price);
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        let prices = self
            .prices
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        prices.get(symbol).copied()
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    async fn place_market_order(&self, request: &OrderRequest) -> Result<OrderFill, ExchangeError> {
        let price = self
            .last_price(&request.symbol)
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or_else(|| {
                ExchangeError::Rejected(format!("no price observed for {}", request.symbol))
            })?;

        let quantity = match request.amount {
            OrderAmount::Quote(quote) => quote / price,
            OrderAmount::Base(base) => base,
        };
        if !(quantity.is_finite() && quantity > 0.0) {
            return Err(ExchangeError::Rejected(format!(
                "invalid order size {:?}",
                request.amount
            )));
        }

        let seq = self.next_order.fetch_add(1, Ordering::SeqCst) + 1;
        let fill = OrderFill {
            filled_quantity: quantity,
            avg_price: price,
            quote_amount: quantity * price,
            order_id: format!("paper-{}-{}", request.symbol, seq),
        };

        tracing::info!(
            symbol = %request.symbol,
            action = %request.action,
            "📝 Paper fill: {:.8} @ ${:.4} ({})",
            fill.filled_quantity,
            fill.avg_price,
            fill.order_id
        );
        Ok(fill)
    }

    fn observe_tick(&self, tick: &PriceTick) {
        self.set_price(&tick.symbol, tick.price);
    }

    fn name(&self) -> &'static str {
        "paper"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradeAction;
    use chrono::Utc;

    fn request(action: TradeAction, amount: OrderAmount) -> OrderRequest {
        OrderRequest {
            symbol: "BTCUSDT".to_string(),
            action,
            amount,
        }
    }

    #[tokio::test]
    async fn test_fills_at_last_tick() {
        let gateway = PaperGateway::new();
        gateway.observe_tick(&PriceTick {
            symbol: "BTCUSDT".to_string(),
            price: 100.0,
            timestamp: Utc::now(),
        });

        let fill = gateway
            .place_market_order(&request(TradeAction::Buy, OrderAmount::Quote(50.0)))
            .await
            .unwrap();
        assert_eq!(fill.avg_price, 100.0);
        assert_eq!(fill.filled_quantity, 0.5);

        let fill2 = gateway
            .place_market_order(&request(TradeAction::Sell, OrderAmount::Base(0.5)))
            .await
            .unwrap();
        assert_eq!(fill2.filled_quantity, 0.5);
        assert_ne!(fill.order_id, fill2.order_id);
    }

    #[tokio::test]
    async fn test_rejects_without_price() {
        let gateway = PaperGateway::new();
        let err = gateway
            .place_market_order(&request(TradeAction::Buy, OrderAmount::Quote(50.0)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected(_)));
        assert!(!err.is_retryable());
    }
}
