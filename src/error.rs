use crate::models::ReferencePrice;
use std::time::Duration;
use thiserror::Error;

/// Market-data feed failures
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("failed to connect to feed: {0}")]
    Connect(String),
    #[error("feed protocol error: {0}")]
    Protocol(String),
    #[error("no frame received for {0:?}")]
    IdleTimeout(Duration),
    #[error("feed closed by remote")]
    Closed,
    #[error("reconnect budget exhausted after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

/// Order API failures, split into retryable and terminal classes
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    #[error("order request timed out")]
    Timeout,
    #[error("rate limited by exchange")]
    RateLimited,
    #[error("exchange server error (status {status})")]
    Server { status: u16 },
    #[error("network error: {0}")]
    Network(String),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("invalid exchange response: {0}")]
    InvalidResponse(String),
}

impl ExchangeError {
    /// Retryable errors are safe to resubmit at the caller's discretion.
    /// The coordinator itself never resubmits.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Timeout
                | ExchangeError::RateLimited
                | ExchangeError::Server { .. }
                | ExchangeError::Network(_)
        )
    }
}

/// Persistence failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient database error: {0}")]
    Transient(String),
    #[error("database error: {0}")]
    Permanent(String),
    #[error("corrupt row for {symbol}: {reason}")]
    Corrupt { symbol: String, reason: String },
    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: String,
    },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

// SQLSTATE codes treated as transient: serialization failure, deadlock,
// lock not available, query canceled (statement/lock timeout).
const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "55P03", "57014"];

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                let transient = db_err
                    .code()
                    .map(|code| TRANSIENT_SQLSTATES.contains(&code.as_ref()))
                    .unwrap_or(false);
                if transient {
                    StoreError::Transient(err.to_string())
                } else {
                    StoreError::Permanent(err.to_string())
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Transient(err.to_string()),
            _ => StoreError::Permanent(err.to_string()),
        }
    }
}

/// Result of a manual action or an automated trade cycle
#[derive(Debug, Error)]
pub enum TradeError {
    #[error("unknown symbol {0}")]
    UnknownSymbol(String),
    #[error("an order for {0} is already in flight")]
    OrderInFlight(String),
    #[error("invalid price {0}")]
    InvalidPrice(f64),
    #[error("invalid order amount {0}")]
    InvalidAmount(f64),
    #[error("no holdings to sell for {0}")]
    NoHoldings(String),
    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),
    #[error("order {order_id} filled but persistence failed: {source}")]
    Persistence {
        order_id: String,
        #[source]
        source: StoreError,
    },
    #[error("reference price for {symbol} did not converge after correction (order {order_id})")]
    Reconciliation {
        symbol: String,
        order_id: String,
        intended: Box<ReferencePrice>,
    },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
