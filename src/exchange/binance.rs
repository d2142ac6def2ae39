use super::OrderGateway;
use crate::config::ExchangeSettings;
use crate::error::ExchangeError;
use crate::models::{OrderAmount, OrderFill, OrderRequest, TradeAction};
use async_trait::async_trait;
use chrono::Utc;
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

type OrderRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

// Binance error codes
const CODE_TOO_MANY_REQUESTS: i64 = -1003;
const CODE_INVALID_SIGNATURE: i64 = -1022;
const CODE_NEW_ORDER_REJECTED: i64 = -2010;
const CODE_BAD_API_KEY_FMT: i64 = -2014;
const CODE_REJECTED_MBX_KEY: i64 = -2015;

/// Spot market orders over the signed REST API
#[derive(Clone)]
pub struct BinanceGateway {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    recv_window_ms: u64,
    rate_limiter: Arc<OrderRateLimiter>,
}

// ============== Response Types ==============

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    status: String,
    executed_qty: String,
    cummulative_quote_qty: String,
    #[serde(default)]
    fills: Vec<FillEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FillEntry {
    commission: String,
    commission_asset: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

// ============== Implementation ==============

impl BinanceGateway {
    pub fn new(settings: &ExchangeSettings) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| ExchangeError::Network(format!("failed to build HTTP client: {}", e)))?;

        let per_second = NonZeroU32::new(settings.orders_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));

        Ok(Self {
            client,
            base_url: settings.rest_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            api_secret: settings.api_secret.clone(),
            recv_window_ms: settings.recv_window_ms,
            rate_limiter,
        })
    }

    /// Current price from the public ticker endpoint
    /// Endpoint: GET /api/v3/ticker/price?symbol={symbol}
    pub async fn ticker_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let url = format!("{}/api/v3/ticker/price", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("symbol", symbol)])
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(classify_transport_error)?;
        if !status.is_success() {
            return Err(classify_api_error(status, &body));
        }

        let ticker: TickerPrice = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))?;
        ticker
            .price
            .parse::<f64>()
            .map_err(|e| ExchangeError::InvalidResponse(format!("price: {}", e)))
    }

    fn sign(&self, payload: &str) -> Result<String, ExchangeError> {
        sign_payload(&self.api_secret, payload)
    }

    fn order_payload(&self, request: &OrderRequest, timestamp_ms: i64) -> String {
        let side = match request.action {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
        };
        let amount = match request.amount {
            OrderAmount::Quote(quote) => format!("quoteOrderQty={}", format_amount(quote)),
            OrderAmount::Base(base) => format!("quantity={}", format_amount(base)),
        };

        format!(
            "symbol={}&side={}&type=MARKET&{}&newOrderRespType=FULL&recvWindow={}&timestamp={}",
            request.symbol, side, amount, self.recv_window_ms, timestamp_ms
        )
    }
}

#[async_trait]
impl OrderGateway for BinanceGateway {
    async fn place_market_order(&self, request: &OrderRequest) -> Result<OrderFill, ExchangeError> {
        self.rate_limiter.until_ready().await;

        let payload = self.order_payload(request, Utc::now().timestamp_millis());
        let signature = self.sign(&payload)?;
        let body = format!("{}&signature={}", payload, signature);

        tracing::info!(
            symbol = %request.symbol,
            action = %request.action,
            amount = ?request.amount,
            "📤 Submitting market order"
        );

        let response = self
            .client
            .post(format!("{}/api/v3/order", self.base_url))
            .header("X-MBX-APIKEY", &self.api_key)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(classify_transport_error)?;

        if !status.is_success() {
            let err = classify_api_error(status, &text);
            tracing::warn!(symbol = %request.symbol, "Order failed: {} ({})", err, text);
            return Err(err);
        }

        let order: OrderResponse = serde_json::from_str(&text)
            .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))?;
        fill_from_response(request, order)
    }

    fn name(&self) -> &'static str {
        "binance"
    }
}

/// Buys are credited net of commission paid in the base asset; the average
/// price stays quote spent over executed quantity.
fn fill_from_response(
    request: &OrderRequest,
    order: OrderResponse,
) -> Result<OrderFill, ExchangeError> {
    let executed: f64 = order
        .executed_qty
        .parse()
        .map_err(|e| ExchangeError::InvalidResponse(format!("executedQty: {}", e)))?;
    let quote: f64 = order
        .cummulative_quote_qty
        .parse()
        .map_err(|e| ExchangeError::InvalidResponse(format!("cummulativeQuoteQty: {}", e)))?;

    if executed <= 0.0 {
        return Err(ExchangeError::Rejected(format!(
            "order {} not filled (status {})",
            order.order_id, order.status
        )));
    }

    let mut base_commission = 0.0;
    for entry in &order.fills {
        if !is_base_asset(&request.symbol, &entry.commission_asset) {
            continue;
        }
        let fee: f64 = entry
            .commission
            .parse()
            .map_err(|e| ExchangeError::InvalidResponse(format!("commission: {}", e)))?;
        base_commission += fee;
    }

    let filled_quantity = match request.action {
        TradeAction::Buy => executed - base_commission,
        TradeAction::Sell => executed,
    };
    if filled_quantity <= 0.0 {
        return Err(ExchangeError::InvalidResponse(format!(
            "order {} commission {} exceeds executed quantity {}",
            order.order_id, base_commission, executed
        )));
    }
    if base_commission > 0.0 {
        tracing::debug!(
            symbol = %request.symbol,
            "Base-asset commission {:.8} netted from fill {}",
            base_commission,
            order.order_id
        );
    }

    Ok(OrderFill {
        filled_quantity,
        avg_price: quote / executed,
        quote_amount: quote,
        order_id: order.order_id.to_string(),
    })
}

/// `BTC` is the base of `BTCUSDT`, `USDT` is not
fn is_base_asset(symbol: &str, asset: &str) -> bool {
    !asset.is_empty() && symbol.starts_with(asset) && symbol.len() > asset.len()
}

pub fn sign_payload(secret: &str, payload: &str) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Auth(e.to_string()))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Up to 8 decimals, trailing zeros trimmed
fn format_amount(value: f64) -> String {
    let s = format!("{:.8}", value);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s.is_empty() {
        "0".to_string()
    } else {
        s.to_string()
    }
}

fn classify_transport_error(err: reqwest::Error) -> ExchangeError {
    if err.is_timeout() {
        ExchangeError::Timeout
    } else {
        ExchangeError::Network(err.to_string())
    }
}

fn classify_api_error(status: StatusCode, body: &str) -> ExchangeError {
    let parsed: Option<ApiErrorBody> = serde_json::from_str(body).ok();

    if let Some(api) = &parsed {
        match api.code {
            CODE_TOO_MANY_REQUESTS => return ExchangeError::RateLimited,
            CODE_INVALID_SIGNATURE | CODE_BAD_API_KEY_FMT | CODE_REJECTED_MBX_KEY => {
                return ExchangeError::Auth(api.msg.clone())
            }
            CODE_NEW_ORDER_REJECTED => {
                return if api.msg.to_lowercase().contains("insufficient") {
                    ExchangeError::InsufficientFunds(api.msg.clone())
                } else {
                    ExchangeError::Rejected(api.msg.clone())
                };
            }
            _ => {}
        }
    }

    match status.as_u16() {
        408 => ExchangeError::Timeout,
        418 | 429 => ExchangeError::RateLimited,
        401 | 403 => ExchangeError::Auth(message_or(parsed, body)),
        s if s >= 500 => ExchangeError::Server { status: s },
        _ => ExchangeError::Rejected(message_or(parsed, body)),
    }
}

fn message_or(parsed: Option<ApiErrorBody>, body: &str) -> String {
    parsed
        .map(|p| format!("{} ({})", p.msg, p.code))
        .unwrap_or_else(|| body.to_string())
}
