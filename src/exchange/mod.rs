pub mod binance;
pub mod paper;

pub use binance::BinanceGateway;
pub use paper::PaperGateway;

use crate::error::ExchangeError;
use crate::models::{OrderFill, OrderRequest, PriceTick};
use async_trait::async_trait;

/// Market-order placement against a single spot exchange
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Place a market order and wait for its fill
    async fn place_market_order(&self, request: &OrderRequest) -> Result<OrderFill, ExchangeError>;

    /// Latest observed price; gateways that fill locally use it
    fn observe_tick(&self, _tick: &PriceTick) {}

    fn name(&self) -> &'static str;
}
