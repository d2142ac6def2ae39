use crate::events::{EngineEvent, EventBus, Notifier};
use crate::feed::FeedStatus;
use crate::models::PriceTick;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

pub const EVENTS_CHANNEL: &str = "thresholdbot:events";

/// Latest price as cached for the dashboard
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct StoredTick {
    price: f64,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct StoredStatus {
    status: FeedStatus,
    at: DateTime<Utc>,
}

pub fn price_key(symbol: &str) -> String {
    format!("price:{}", symbol)
}

pub fn stream_key(symbol: &str) -> String {
    format!("stream:{}", symbol)
}

/// Redis sink for the dashboard
///
/// - `price:{symbol}`: latest tick (JSON)
/// - `stream:{symbol}`: latest feed status (JSON)
/// - `thresholdbot:events`: every engine event, published as JSON
#[derive(Clone)]
pub struct RedisSink {
    conn: ConnectionManager,
}

impl RedisSink {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| "Redis connection timeout after 5 seconds")??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    pub async fn record_tick(&self, tick: &PriceTick) -> Result<()> {
        let value = serde_json::to_string(&StoredTick {
            price: tick.price,
            timestamp: tick.timestamp,
        })?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(price_key(&tick.symbol), value).await?;
        Ok(())
    }

    pub async fn latest_price(&self, symbol: &str) -> Result<Option<f64>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(price_key(symbol)).await?;
        match raw {
            Some(json) => {
                let stored: StoredTick = serde_json::from_str(&json)?;
                Ok(Some(stored.price))
            }
            None => Ok(None),
        }
    }

    async fn record_status(
        &self,
        symbols: &[String],
        status: FeedStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let value = serde_json::to_string(&StoredStatus { status, at })?;
        let mut conn = self.conn.clone();
        for symbol in symbols {
            conn.set::<_, _, ()>(stream_key(symbol), &value).await?;
        }
        Ok(())
    }

    async fn publish_event(&self, event: &EngineEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(EVENTS_CHANNEL, payload).await?;
        Ok(())
    }

    /// Cache every tick on the bus until it closes
    pub fn spawn_tick_cache(&self, bus: &EventBus) -> JoinHandle<()> {
        let sink = self.clone();
        let mut rx = bus.subscribe_ticks();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(tick) => {
                        if let Err(e) = sink.record_tick(&tick).await {
                            tracing::warn!(symbol = %tick.symbol, "Failed to cache tick: {}", e);
                        }
                    }
                    // Only the latest price matters
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[async_trait]
impl Notifier for RedisSink {
    async fn notify(&self, event: &EngineEvent) -> Result<()> {
        if let EngineEvent::StreamStatus {
            symbols,
            status,
            at,
        } = event
        {
            self.record_status(symbols, *status, *at).await?;
        }
        self.publish_event(event).await
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(price_key("BTCUSDT"), "price:BTCUSDT");
        assert_eq!(stream_key("ETHUSDT"), "stream:ETHUSDT");
    }

    #[test]
    fn test_stored_status_shape() {
        let json = serde_json::to_value(StoredStatus {
            status: FeedStatus::Disconnected,
            at: Utc::now(),
        })
        .unwrap();
        assert_eq!(json["status"], "disconnected");
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_connection_timeout() {
        let result = RedisSink::new("redis://192.0.2.1:6379").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_record_and_read_tick() {
        let sink = RedisSink::new("redis://127.0.0.1:6379")
            .await
            .expect("Failed to connect to Redis");

        let tick = PriceTick {
            symbol: "TESTREDIS".to_string(),
            price: 123.45,
            timestamp: Utc::now(),
        };
        sink.record_tick(&tick).await.unwrap();
        assert_eq!(sink.latest_price("TESTREDIS").await.unwrap(), Some(123.45));
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_status_event_cached() {
        let sink = RedisSink::new("redis://127.0.0.1:6379")
            .await
            .expect("Failed to connect to Redis");

        let event = EngineEvent::StreamStatus {
            symbols: vec!["TESTSTATUS".to_string()],
            status: FeedStatus::Connected,
            at: Utc::now(),
        };
        sink.notify(&event).await.unwrap();

        let mut conn = sink.conn.clone();
        let raw: Option<String> = conn.get(stream_key("TESTSTATUS")).await.unwrap();
        assert!(raw.unwrap().contains("connected"));
    }
}
