//! Static settings object supplied at startup.
//!
//! Sources, lowest precedence first: built-in defaults, an optional TOML
//! file, `THRESHOLDBOT_*` environment variables, then `DATABASE_URL` /
//! `REDIS_URL` for the connection strings.

use crate::models::{normalize_symbol, Symbol};
use crate::strategy::{ThresholdEngine, DEFAULT_BUY_BUFFER_PCT};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
const ENV_PREFIX: &str = "THRESHOLDBOT";

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Paper,
    Live,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub trading: TradingSettings,
    #[serde(default)]
    pub symbols: Vec<SymbolSettings>,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub exchange: ExchangeSettings,
    #[serde(default)]
    pub redis: RedisSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TradingSettings {
    pub mode: TradingMode,
    pub buy_buffer_pct: f64,
    pub recompute_interval_secs: u64,
    pub seed_on_first_tick: bool,
}

impl Default for TradingSettings {
    fn default() -> Self {
        Self {
            mode: TradingMode::Paper,
            buy_buffer_pct: DEFAULT_BUY_BUFFER_PCT,
            recompute_interval_secs: 300,
            seed_on_first_tick: true,
        }
    }
}

/// Per-symbol percentages are fractions: 0.05 means 5%
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SymbolSettings {
    pub symbol: Symbol,
    pub buy_pct: f64,
    pub sell_pct: f64,
    pub investment_amount: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub ws_url: String,
    pub idle_check_secs: u64,
    pub idle_grace_secs: u64,
    pub reconnect_base_secs: f64,
    pub reconnect_max_secs: f64,
    pub max_reconnect_attempts: u32,
    pub tick_channel_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            ws_url: "wss://stream.binance.com:9443".to_string(),
            idle_check_secs: 30,
            idle_grace_secs: 15,
            reconnect_base_secs: 5.0,
            reconnect_max_secs: 60.0,
            max_reconnect_attempts: 20,
            tick_channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub statement_timeout_ms: u64,
    pub lock_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/thresholdbot".to_string(),
            max_connections: 5,
            acquire_timeout_secs: 5,
            statement_timeout_ms: 5000,
            lock_timeout_ms: 3000,
            max_retries: 3,
            retry_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub rest_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub recv_window_ms: u64,
    pub request_timeout_secs: u64,
    pub orders_per_second: u32,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            rest_url: "https://api.binance.com".to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            recv_window_ms: 5000,
            request_timeout_secs: 10,
            orders_per_second: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RedisSettings {
    pub url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid settings: {0}")]
    Invalid(String),
}

impl Settings {
    /// Load from `path` (optional file) plus environment overrides
    pub fn load(path: Option<&str>) -> Result<Self, SettingsError> {
        let file = path.unwrap_or(DEFAULT_CONFIG_PATH);

        let raw = config::Config::builder()
            .add_source(config::File::with_name(file).required(path.is_some()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let mut settings: Settings = raw.try_deserialize()?;

        if let Ok(url) = std::env::var("DATABASE_URL") {
            settings.database.url = url;
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            settings.redis.url = Some(url);
        }

        settings.normalize();
        settings.validate()?;
        Ok(settings)
    }

    fn normalize(&mut self) {
        for entry in &mut self.symbols {
            entry.symbol = normalize_symbol(&entry.symbol);
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.symbols.is_empty() {
            return Err(SettingsError::Invalid("no symbols configured".into()));
        }

        let mut seen = HashSet::new();
        for entry in &self.symbols {
            if entry.symbol.is_empty() {
                return Err(SettingsError::Invalid("empty symbol".into()));
            }
            if !seen.insert(entry.symbol.clone()) {
                return Err(SettingsError::Invalid(format!(
                    "duplicate symbol {}",
                    entry.symbol
                )));
            }
            if !is_fraction(entry.buy_pct) || !is_fraction(entry.sell_pct) {
                return Err(SettingsError::Invalid(format!(
                    "{}: buy_pct and sell_pct must be in (0, 1)",
                    entry.symbol
                )));
            }
            if !(entry.investment_amount.is_finite() && entry.investment_amount > 0.0) {
                return Err(SettingsError::Invalid(format!(
                    "{}: investment_amount must be positive",
                    entry.symbol
                )));
            }
        }

        if !(0.0..1.0).contains(&self.trading.buy_buffer_pct) {
            return Err(SettingsError::Invalid(
                "buy_buffer_pct must be in [0, 1)".into(),
            ));
        }
        if self.stream.reconnect_base_secs <= 0.0
            || self.stream.reconnect_max_secs < self.stream.reconnect_base_secs
        {
            return Err(SettingsError::Invalid(
                "reconnect_max_secs must be >= reconnect_base_secs > 0".into(),
            ));
        }
        if self.trading.mode == TradingMode::Live
            && (self.exchange.api_key.is_empty() || self.exchange.api_secret.is_empty())
        {
            return Err(SettingsError::Invalid(
                "live mode requires exchange.api_key and exchange.api_secret".into(),
            ));
        }

        Ok(())
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.symbols.iter().map(|s| s.symbol.clone()).collect()
    }

    pub fn symbol(&self, symbol: &str) -> Option<&SymbolSettings> {
        self.symbols.iter().find(|s| s.symbol == symbol)
    }

    /// One engine per configured symbol
    pub fn engines(&self) -> HashMap<Symbol, ThresholdEngine> {
        self.symbols
            .iter()
            .map(|s| {
                (
                    s.symbol.clone(),
                    ThresholdEngine::new(s.buy_pct, s.sell_pct)
                        .with_buy_buffer(self.trading.buy_buffer_pct),
                )
            })
            .collect()
    }

    pub fn recompute_interval(&self) -> Duration {
        Duration::from_secs(self.trading.recompute_interval_secs.max(1))
    }
}

fn is_fraction(value: f64) -> bool {
    value.is_finite() && value > 0.0 && value < 1.0
}
