//! Ticker frame normalization.
//!
//! Three payload shapes are accepted:
//! - flat: `{"s": "BTCUSDT", "c": "43000.1", ...}` or `{"symbol": ..., "price": ...}`
//! - nested: `{"data": {...flat...}}`
//! - combined stream: `{"stream": "btcusdt@ticker", "data": {...flat...}}`
//!
//! Prices may arrive as JSON strings or numbers.

use crate::models::{normalize_symbol, PriceTick};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

const SYMBOL_KEYS: &[&str] = &["s", "symbol"];
const PRICE_KEYS: &[&str] = &["c", "price", "lastPrice", "p"];
const EVENT_TIME_KEYS: &[&str] = &["E", "eventTime", "T"];

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedFrame {
    Tick(PriceTick),
    /// Control traffic such as subscription acks
    Control,
    Malformed(String),
}

pub fn parse_frame(text: &str) -> ParsedFrame {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return ParsedFrame::Malformed(format!("invalid json: {}", e)),
    };

    let Some(obj) = value.as_object() else {
        return ParsedFrame::Malformed("frame is not an object".to_string());
    };

    // {"result": null, "id": 1}
    if obj.contains_key("result") && obj.contains_key("id") {
        return ParsedFrame::Control;
    }

    match obj.get("data") {
        Some(data) => {
            let stream_symbol = obj
                .get("stream")
                .and_then(|v| v.as_str())
                .and_then(symbol_from_stream_name);
            parse_payload(data, stream_symbol)
        }
        None => parse_payload(&value, None),
    }
}

fn parse_payload(payload: &Value, fallback_symbol: Option<String>) -> ParsedFrame {
    if !payload.is_object() {
        return ParsedFrame::Malformed("payload is not an object".to_string());
    }

    let symbol = first_str(payload, SYMBOL_KEYS)
        .map(normalize_symbol)
        .or(fallback_symbol);
    let Some(symbol) = symbol.filter(|s| !s.is_empty()) else {
        return ParsedFrame::Malformed("missing symbol".to_string());
    };

    let Some(price) = PRICE_KEYS.iter().find_map(|k| payload.get(*k).and_then(json_to_f64))
    else {
        return ParsedFrame::Malformed(format!("missing price for {}", symbol));
    };

    let timestamp = EVENT_TIME_KEYS
        .iter()
        .find_map(|k| payload.get(*k).and_then(|v| v.as_i64()))
        .and_then(millis_to_datetime)
        .unwrap_or_else(Utc::now);

    ParsedFrame::Tick(PriceTick {
        symbol,
        price,
        timestamp,
    })
}

fn first_str<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| payload.get(*k).and_then(|v| v.as_str()))
}

/// Handles both "43000.10" and 43000.1
fn json_to_f64(v: &Value) -> Option<f64> {
    v.as_str()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .or_else(|| v.as_f64())
}

/// "btcusdt@ticker" -> "BTCUSDT"
fn symbol_from_stream_name(stream: &str) -> Option<String> {
    let name = stream.split('@').next()?;
    if name.is_empty() {
        None
    } else {
        Some(normalize_symbol(name))
    }
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}
