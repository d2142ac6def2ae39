use super::{CommitOutcome, ReferenceStore, ReferenceUpdate, UpdatedReference};
use crate::config::DatabaseSettings;
use crate::error::StoreError;
use crate::models::{ReferencePrice, Trade, TradeAction, TradeOrigin};
use crate::strategy::ThresholdEngine;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

const REFERENCE_COLUMNS: &str = "symbol, first_transaction_price, last_transaction_price, \
     next_buy_price, next_sell_price, updated_at";

/// Postgres-backed reference prices and trade ledger
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect, apply session timeouts, and run migrations
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, StoreError> {
        let options = PgConnectOptions::from_str(&settings.url)
            .map_err(|e| StoreError::Permanent(format!("invalid database url: {}", e)))?
            .options([
                ("statement_timeout", settings.statement_timeout_ms.to_string()),
                ("lock_timeout", settings.lock_timeout_ms.to_string()),
            ]);

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs.max(1)))
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Permanent(format!("migration failed: {}", e)))?;

        tracing::info!(
            "Connected to Postgres (pool size {})",
            settings.max_connections
        );

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn begin_serializable(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    /// Ensure the row exists, then lock it for the rest of the transaction
    async fn lock_reference(
        tx: &mut Transaction<'static, Postgres>,
        symbol: &str,
    ) -> Result<ReferencePrice, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO reference_prices (symbol)
            VALUES ($1)
            ON CONFLICT (symbol) DO NOTHING
            "#,
        )
        .bind(symbol)
        .execute(&mut **tx)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM reference_prices WHERE symbol = $1 FOR UPDATE",
            REFERENCE_COLUMNS
        ))
        .bind(symbol)
        .fetch_one(&mut **tx)
        .await?;

        reference_from_row(&row)
    }

    async fn write_reference(
        tx: &mut Transaction<'static, Postgres>,
        reference: &ReferencePrice,
    ) -> Result<ReferencePrice, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO reference_prices (
                symbol, first_transaction_price, last_transaction_price,
                next_buy_price, next_sell_price, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (symbol) DO UPDATE SET
                first_transaction_price = EXCLUDED.first_transaction_price,
                last_transaction_price = EXCLUDED.last_transaction_price,
                next_buy_price = EXCLUDED.next_buy_price,
                next_sell_price = EXCLUDED.next_sell_price,
                updated_at = EXCLUDED.updated_at
            RETURNING {}
            "#,
            REFERENCE_COLUMNS
        ))
        .bind(&reference.symbol)
        .bind(to_decimal(reference.first_transaction_price)?)
        .bind(to_decimal(reference.last_transaction_price)?)
        .bind(to_decimal(reference.next_buy_price)?)
        .bind(to_decimal(reference.next_sell_price)?)
        .bind(reference.updated_at)
        .fetch_one(&mut **tx)
        .await?;

        reference_from_row(&row)
    }

    async fn insert_trade(
        tx: &mut Transaction<'static, Postgres>,
        trade: &Trade,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO trades (
                id, symbol, action, quantity, price, quote_amount,
                exchange_order_id, origin, executed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (exchange_order_id) DO NOTHING
            "#,
        )
        .bind(trade.id)
        .bind(&trade.symbol)
        .bind(trade.action.as_str())
        .bind(to_decimal(trade.quantity)?)
        .bind(to_decimal(trade.price)?)
        .bind(to_decimal(trade.quote_amount)?)
        .bind(&trade.exchange_order_id)
        .bind(trade.origin.as_str())
        .bind(trade.timestamp)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Remove all rows for a symbol. Test helper.
    pub async fn clear_symbol(&self, symbol: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM trades WHERE symbol = $1")
            .bind(symbol)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM reference_prices WHERE symbol = $1")
            .bind(symbol)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ReferenceStore for PostgresStore {
    /// Plain read on the tick path; the empty row is inserted only when
    /// missing, so reads never dirty an existing row
    async fn get_reference_price(&self, symbol: &str) -> Result<ReferencePrice, StoreError> {
        let select = format!(
            "SELECT {} FROM reference_prices WHERE symbol = $1",
            REFERENCE_COLUMNS
        );

        if let Some(row) = sqlx::query(&select)
            .bind(symbol)
            .fetch_optional(&self.pool)
            .await?
        {
            return reference_from_row(&row);
        }

        sqlx::query(
            r#"
            INSERT INTO reference_prices (symbol)
            VALUES ($1)
            ON CONFLICT (symbol) DO NOTHING
            "#,
        )
        .bind(symbol)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(&select)
            .bind(symbol)
            .fetch_one(&self.pool)
            .await?;
        reference_from_row(&row)
    }

    async fn upsert_reference_price(
        &self,
        reference: &ReferencePrice,
    ) -> Result<ReferencePrice, StoreError> {
        let mut tx = self.begin_serializable().await?;
        Self::lock_reference(&mut tx, &reference.symbol).await?;
        let written = Self::write_reference(&mut tx, reference).await?;
        tx.commit().await?;
        Ok(written)
    }

    async fn append_trade(&self, trade: &Trade) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted = Self::insert_trade(&mut tx, trade).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_holdings(&self, symbol: &str) -> Result<f64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(CASE WHEN action = 'buy' THEN quantity ELSE -quantity END), 0)
                AS holdings
            FROM trades
            WHERE symbol = $1
            "#,
        )
        .bind(symbol)
        .fetch_one(&self.pool)
        .await?;

        let holdings: Decimal = row.try_get("holdings")?;
        from_decimal(symbol, "holdings", holdings)
    }

    async fn recent_trades(&self, symbol: &str, limit: i64) -> Result<Vec<Trade>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, symbol, action, quantity, price, quote_amount,
                   exchange_order_id, origin, executed_at
            FROM trades
            WHERE symbol = $1
            ORDER BY executed_at DESC
            LIMIT $2
            "#,
        )
        .bind(symbol)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(trade_from_row).collect()
    }

    async fn commit_trade(
        &self,
        trade: &Trade,
        engine: &ThresholdEngine,
    ) -> Result<CommitOutcome, StoreError> {
        let mut tx = self.begin_serializable().await?;

        let previous = Self::lock_reference(&mut tx, &trade.symbol).await?;
        let trade_inserted = Self::insert_trade(&mut tx, trade).await?;
        let decision = engine.decide_thresholds(&previous, trade.action, trade.price);
        let committed = Self::write_reference(&mut tx, &decision.reference).await?;

        tx.commit().await?;

        if !trade_inserted {
            tracing::warn!(
                symbol = %trade.symbol,
                order_id = %trade.exchange_order_id,
                "Trade already in ledger, thresholds re-applied"
            );
        }

        Ok(CommitOutcome {
            previous,
            intended: decision.reference,
            committed,
            is_first_buy: decision.is_first_buy,
            trade_inserted,
        })
    }

    async fn update_reference(
        &self,
        symbol: &str,
        update: ReferenceUpdate<'_>,
    ) -> Result<Option<UpdatedReference>, StoreError> {
        let mut tx = self.begin_serializable().await?;
        let previous = Self::lock_reference(&mut tx, symbol).await?;

        let Some(next) = update(&previous) else {
            tx.rollback().await?;
            return Ok(None);
        };

        let current = Self::write_reference(&mut tx, &next).await?;
        tx.commit().await?;
        Ok(Some(UpdatedReference { previous, current }))
    }
}

fn to_decimal(value: f64) -> Result<Decimal, StoreError> {
    Decimal::try_from(value)
        .map_err(|e| StoreError::Permanent(format!("cannot store {} as NUMERIC: {}", value, e)))
}

fn from_decimal(symbol: &str, column: &str, value: Decimal) -> Result<f64, StoreError> {
    value.to_string().parse().map_err(|e| StoreError::Corrupt {
        symbol: symbol.to_string(),
        reason: format!("{}: {}", column, e),
    })
}

fn reference_from_row(row: &PgRow) -> Result<ReferencePrice, StoreError> {
    let symbol: String = row.try_get("symbol")?;
    let price = |column: &str| -> Result<f64, StoreError> {
        let value: Decimal = row.try_get(column)?;
        from_decimal(&symbol, column, value)
    };

    Ok(ReferencePrice {
        first_transaction_price: price("first_transaction_price")?,
        last_transaction_price: price("last_transaction_price")?,
        next_buy_price: price("next_buy_price")?,
        next_sell_price: price("next_sell_price")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        symbol: symbol.clone(),
    })
}

fn trade_from_row(row: &PgRow) -> Result<Trade, StoreError> {
    let symbol: String = row.try_get("symbol")?;
    let action_str: String = row.try_get("action")?;
    let origin_str: String = row.try_get("origin")?;

    let action = TradeAction::parse(&action_str).ok_or_else(|| StoreError::Corrupt {
        symbol: symbol.clone(),
        reason: format!("invalid action {}", action_str),
    })?;
    let origin = TradeOrigin::parse(&origin_str).ok_or_else(|| StoreError::Corrupt {
        symbol: symbol.clone(),
        reason: format!("invalid origin {}", origin_str),
    })?;

    let quantity: Decimal = row.try_get("quantity")?;
    let price: Decimal = row.try_get("price")?;
    let quote_amount: Decimal = row.try_get("quote_amount")?;

    Ok(Trade {
        id: row.try_get::<Uuid, _>("id")?,
        action,
        quantity: from_decimal(&symbol, "quantity", quantity)?,
        price: from_decimal(&symbol, "price", price)?,
        quote_amount: from_decimal(&symbol, "quote_amount", quote_amount)?,
        timestamp: row.try_get("executed_at")?,
        exchange_order_id: row.try_get("exchange_order_id")?,
        origin,
        symbol,
    })
}
