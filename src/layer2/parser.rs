// Message Parser - Pure Rust Implementation
// Normalizes Bybit v5 public stream pushes into MarketEvents

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::core::types::{MarketEvent, MarketKind};

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
    #[error("Missing field '{0}'")]
    MissingField(&'static str),
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),
    #[error("Empty data for topic {0}")]
    EmptyData(String),
}

// ============================================================================
// Topics
// ============================================================================

/// Split a topic into (kind, symbol). The symbol is always the last segment.
pub fn parse_topic(topic: &str) -> Result<(MarketKind, String), ParseError> {
    let mut segments = topic.split('.');
    let prefix = segments.next().unwrap_or_default();
    let symbol = topic.rsplit('.').next().unwrap_or_default();

    if symbol.is_empty() || symbol == prefix {
        return Err(ParseError::UnknownTopic(topic.to_string()));
    }

    let kind = match prefix {
        "orderbook" => MarketKind::Orderbook,
        "kline" => MarketKind::Kline,
        "publicTrade" | "trade" => MarketKind::Trade,
        "liquidation" | "allLiquidation" => MarketKind::Liquidation,
        _ => return Err(ParseError::UnknownTopic(topic.to_string())),
    };

    Ok((kind, symbol.to_uppercase()))
}

// ============================================================================
// Push normalization
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawPush {
    topic: Option<String>,
    ts: Option<i64>,
    data: Option<serde_json::Value>,
}

fn observed_at(ts: Option<i64>) -> DateTime<Utc> {
    ts.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

/// Normalize the `data` field: objects pass through, a single-element array
/// unwraps to its element, longer arrays are wrapped as `{"data": [...]}`.
fn normalize_payload(topic: &str, data: serde_json::Value) -> Result<serde_json::Value, ParseError> {
    match data {
        serde_json::Value::Array(mut items) => match items.len() {
            0 => Err(ParseError::EmptyData(topic.to_string())),
            1 => Ok(items.remove(0)),
            _ => Ok(serde_json::json!({ "data": items })),
        },
        serde_json::Value::Object(map) if map.is_empty() => {
            Err(ParseError::EmptyData(topic.to_string()))
        }
        serde_json::Value::Null => Err(ParseError::MissingField("data")),
        other => Ok(other),
    }
}

/// Normalize one decoded push message
pub fn parse_push(message: &serde_json::Value) -> Result<MarketEvent, ParseError> {
    let raw = RawPush::deserialize(message).map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    let topic = raw.topic.ok_or(ParseError::MissingField("topic"))?;
    let data = raw.data.ok_or(ParseError::MissingField("data"))?;
    let (kind, symbol) = parse_topic(&topic)?;
    let payload = normalize_payload(&topic, data)?;

    Ok(MarketEvent::new(&symbol, kind, observed_at(raw.ts), payload))
}

/// Normalize one raw text frame
pub fn parse_push_str(raw_json: &str) -> Result<MarketEvent, ParseError> {
    let value: serde_json::Value = serde_json::from_str(raw_json)
        .map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    parse_push(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ChannelKind;
    use serde_json::json;

    #[test]
    fn test_topic_names() {
        assert_eq!(ChannelKind::Orderbook { depth: 50 }.topic("btcusdt"), "orderbook.50.BTCUSDT");
        assert_eq!(ChannelKind::Kline { interval: "1".into() }.topic("NEARUSDT"), "kline.1.NEARUSDT");
        assert_eq!(ChannelKind::Trade.topic("ETHUSDT"), "publicTrade.ETHUSDT");
        assert_eq!(ChannelKind::Liquidation.topic("ETHUSDT"), "liquidation.ETHUSDT");
        assert_eq!(ChannelKind::standard_set(50, "1").len(), 4);

        for channel in ChannelKind::standard_set(50, "1") {
            let (kind, symbol) = parse_topic(&channel.topic("nearusdt")).unwrap();
            assert_eq!(kind, channel.kind());
            assert_eq!(symbol, "NEARUSDT");
        }
    }

    #[test]
    fn test_parse_topic() {
        assert_eq!(parse_topic("orderbook.50.BTCUSDT").unwrap(), (MarketKind::Orderbook, "BTCUSDT".into()));
        assert_eq!(parse_topic("publicTrade.ETHUSDT").unwrap(), (MarketKind::Trade, "ETHUSDT".into()));
        assert_eq!(parse_topic("allLiquidation.SOLUSDT").unwrap(), (MarketKind::Liquidation, "SOLUSDT".into()));
        assert!(matches!(parse_topic("tickers.BTCUSDT"), Err(ParseError::UnknownTopic(_))));
        assert!(matches!(parse_topic("orderbook"), Err(ParseError::UnknownTopic(_))));
    }

    #[test]
    fn test_orderbook_push() {
        let msg = json!({
            "topic": "orderbook.50.BTCUSDT",
            "type": "snapshot",
            "ts": 1672304484978i64,
            "data": {"s": "BTCUSDT", "b": [["16493.50", "0.006"]], "a": [["16611.00", "0.029"]], "u": 18521288, "seq": 7961638724u64}
        });

        let event = parse_push(&msg).unwrap();
        assert_eq!(event.symbol, "BTCUSDT");
        assert_eq!(event.kind, MarketKind::Orderbook);
        assert_eq!(event.observed_at.timestamp_millis(), 1672304484978);
        assert_eq!(event.payload["b"][0][0], "16493.50");
    }

    #[test]
    fn test_array_payloads() {
        let single = json!({"topic": "kline.1.NEARUSDT", "ts": 1, "data": [{"start": 1, "close": "3.1"}]});
        assert_eq!(parse_push(&single).unwrap().payload, json!({"start": 1, "close": "3.1"}));

        let many = json!({"topic": "publicTrade.NEARUSDT", "ts": 1, "data": [{"p": "1"}, {"p": "2"}]});
        let event = parse_push(&many).unwrap();
        assert_eq!(event.kind, MarketKind::Trade);
        assert_eq!(event.payload["data"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_malformed_pushes() {
        assert_eq!(parse_push(&json!({"ts": 1, "data": {}})), Err(ParseError::MissingField("topic")));
        assert_eq!(parse_push(&json!({"topic": "publicTrade.X"})), Err(ParseError::MissingField("data")));
        assert!(matches!(
            parse_push(&json!({"topic": "publicTrade.X", "data": []})),
            Err(ParseError::EmptyData(_))
        ));
        assert!(matches!(parse_push_str("{not json"), Err(ParseError::InvalidJson(_))));
        assert!(matches!(parse_push(&json!({"topic": 5, "data": {}})), Err(ParseError::InvalidJson(_))));
    }

    #[test]
    fn test_missing_ts_uses_now() {
        let before = Utc::now();
        let event = parse_push(&json!({"topic": "liquidation.XRPUSDT", "data": {"price": "0.5"}})).unwrap();
        assert!(event.observed_at >= before);
    }
}
