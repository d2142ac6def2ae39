// Core modules
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod exchange;
pub mod execution;
pub mod feed;
pub mod models;
pub mod persistence;
pub mod strategy;

// Re-export commonly used types
pub use error::{ExchangeError, FeedError, StoreError, TradeError};
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
