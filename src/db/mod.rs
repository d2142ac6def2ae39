pub mod memory;
pub mod postgres;
pub mod retry;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use retry::{with_store_retry, StoreRetryPolicy};

use crate::error::StoreError;
use crate::models::{ReferencePrice, Trade};
use crate::strategy::ThresholdEngine;
use async_trait::async_trait;

/// Read-modify-write closure for a reference row; `None` means leave it alone
pub type ReferenceUpdate<'a> = &'a (dyn Fn(&ReferencePrice) -> Option<ReferencePrice> + Send + Sync);

/// Result of committing one confirmed fill
#[derive(Debug, Clone, PartialEq)]
pub struct CommitOutcome {
    /// Row as read under the lock, before the write
    pub previous: ReferencePrice,
    /// Values the engine decided on
    pub intended: ReferencePrice,
    /// Row as returned by the write
    pub committed: ReferencePrice,
    pub is_first_buy: bool,
    /// False when the ledger already held this order id
    pub trade_inserted: bool,
}

/// Row before and after a locked read-modify-write
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatedReference {
    pub previous: ReferencePrice,
    pub current: ReferencePrice,
}

/// Durable per-symbol reference prices plus the trade ledger
///
/// Every multi-statement operation runs in one transaction that locks the
/// symbol's reference row, so writers of the same symbol are serialized.
/// Implementations do not retry; callers wrap calls in `with_store_retry`.
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    /// Current row, created with all-zero defaults if missing
    async fn get_reference_price(&self, symbol: &str) -> Result<ReferencePrice, StoreError>;

    /// Write all decision fields and return the post-write row
    async fn upsert_reference_price(
        &self,
        reference: &ReferencePrice,
    ) -> Result<ReferencePrice, StoreError>;

    /// Append to the ledger; returns false if the order id is already recorded
    async fn append_trade(&self, trade: &Trade) -> Result<bool, StoreError>;

    /// Σ buys − Σ sells from the ledger
    async fn get_holdings(&self, symbol: &str) -> Result<f64, StoreError>;

    /// Newest first
    async fn recent_trades(&self, symbol: &str, limit: i64) -> Result<Vec<Trade>, StoreError>;

    /// Append `trade` and apply `engine.decide_thresholds` to the locked row,
    /// atomically
    async fn commit_trade(
        &self,
        trade: &Trade,
        engine: &ThresholdEngine,
    ) -> Result<CommitOutcome, StoreError>;

    /// Locked read-modify-write used by seeding and recomputation.
    /// Returns None when `update` declined to write.
    async fn update_reference(
        &self,
        symbol: &str,
        update: ReferenceUpdate<'_>,
    ) -> Result<Option<UpdatedReference>, StoreError>;
}
