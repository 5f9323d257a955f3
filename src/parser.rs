//! Parser module for market-channel WebSocket frames
//!
//! Frames arrive as a bare control token (`PONG`), a single event object or a
//! JSON array of event objects. Everything is validated here and turned into
//! [`NormalizedEvent`] values; downstream code never sees raw JSON.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::error::{FeedError, Result};
use crate::orderbook::{Level, LevelChange, Side};

/// Control token the server sends in reply to a text `PING`
pub const PONG_TOKEN: &str = "PONG";

/// Maximum number of payload bytes quoted in logs
const PAYLOAD_PREFIX_LEN: usize = 256;

/// Raw event object as sent on the market channel
#[derive(Debug, Clone, Deserialize)]
struct RawEvent {
    #[serde(default)]
    event_type: Option<String>,

    #[serde(default)]
    asset_id: Option<String>,

    #[serde(default)]
    market: Option<String>,

    #[serde(default, deserialize_with = "deserialize_opt_millis")]
    timestamp: Option<u64>,

    #[serde(default, alias = "buys")]
    bids: Vec<RawLevel>,

    #[serde(default, alias = "sells")]
    asks: Vec<RawLevel>,

    #[serde(default)]
    changes: Vec<RawChange>,

    #[serde(default)]
    old_tick_size: Option<Decimal>,

    #[serde(default)]
    new_tick_size: Option<Decimal>,
}

/// Price level (price, size pair)
#[derive(Debug, Clone, Deserialize)]
struct RawLevel {
    price: Decimal,
    size: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
struct RawChange {
    side: Side,
    price: Decimal,
    size: Decimal,
}

/// Validated feed event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizedEvent {
    Snapshot {
        instrument_id: String,
        market: Option<String>,
        timestamp: Option<u64>,
        bids: Vec<Level>,
        asks: Vec<Level>,
    },
    Delta {
        instrument_id: String,
        market: Option<String>,
        timestamp: Option<u64>,
        changes: Vec<LevelChange>,
    },
    TickSizeChange {
        instrument_id: String,
        market: Option<String>,
        timestamp: Option<u64>,
        old: Option<Decimal>,
        new: Decimal,
    },
}

impl NormalizedEvent {
    pub fn instrument_id(&self) -> &str {
        match self {
            NormalizedEvent::Snapshot { instrument_id, .. }
            | NormalizedEvent::Delta { instrument_id, .. }
            | NormalizedEvent::TickSizeChange { instrument_id, .. } => instrument_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NormalizedEvent::Snapshot { .. } => "book",
            NormalizedEvent::Delta { .. } => "price_change",
            NormalizedEvent::TickSizeChange { .. } => "tick_size_change",
        }
    }
}

/// Parsed WebSocket frame
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedMessage {
    /// Keep-alive reply
    Pong,
    /// Zero or more events, in wire order
    Events(Vec<NormalizedEvent>),
}

impl ParsedMessage {
    /// Parse a raw WebSocket frame.
    ///
    /// A frame that is not JSON, or a single object that fails validation, is
    /// an error. Inside an array, bad items are logged and skipped so the
    /// remaining events still get through. Unknown event types are ignored.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case(PONG_TOKEN) {
            return Ok(ParsedMessage::Pong);
        }

        let value: serde_json::Value = serde_json::from_str(trimmed)?;

        match value {
            serde_json::Value::Array(items) => {
                let mut events = Vec::with_capacity(items.len());
                for item in items {
                    if !item.is_object() {
                        let item_text = item.to_string();
                        warn!(
                            item = %payload_prefix(&item_text),
                            "Skipping non-object item in event batch"
                        );
                        continue;
                    }
                    match decode_event(item) {
                        Ok(Some(event)) => events.push(event),
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, payload = %payload_prefix(trimmed), "Skipping invalid event in batch");
                        }
                    }
                }
                Ok(ParsedMessage::Events(events))
            }
            value @ serde_json::Value::Object(_) => {
                Ok(ParsedMessage::Events(decode_event(value)?.into_iter().collect()))
            }
            other => Err(FeedError::ParseError(format!(
                "expected event object or array, got {}",
                json_kind(&other)
            ))),
        }
    }
}

/// Decode one event object; `Ok(None)` for event types this client ignores
fn decode_event(value: serde_json::Value) -> Result<Option<NormalizedEvent>> {
    let raw: RawEvent = serde_json::from_value(value)?;

    let event_type = match raw.event_type.as_deref() {
        Some(t @ ("book" | "price_change" | "tick_size_change")) => t.to_string(),
        Some(other) => {
            debug!(event_type = %other, asset_id = ?raw.asset_id, "Ignoring unknown event type");
            return Ok(None);
        }
        None => {
            debug!(asset_id = ?raw.asset_id, "Ignoring object without event_type");
            return Ok(None);
        }
    };

    let instrument_id = match raw.asset_id {
        Some(id) if !id.is_empty() => id,
        _ => {
            return Err(FeedError::ParseError(format!(
                "{} event without asset_id",
                event_type
            )))
        }
    };

    let event = match event_type.as_str() {
        "book" => NormalizedEvent::Snapshot {
            bids: validate_levels(&instrument_id, raw.bids)?,
            asks: validate_levels(&instrument_id, raw.asks)?,
            instrument_id,
            market: raw.market,
            timestamp: raw.timestamp,
        },
        "price_change" => {
            let changes = raw
                .changes
                .into_iter()
                .map(|c| {
                    validate_quote(&instrument_id, c.price, c.size)?;
                    Ok(LevelChange {
                        side: c.side,
                        price: c.price,
                        size: c.size,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            NormalizedEvent::Delta {
                instrument_id,
                market: raw.market,
                timestamp: raw.timestamp,
                changes,
            }
        }
        _ => {
            let new = raw.new_tick_size.ok_or_else(|| {
                FeedError::ParseError(format!(
                    "tick_size_change for {} without new_tick_size",
                    instrument_id
                ))
            })?;
            if new <= Decimal::ZERO {
                return Err(FeedError::ParseError(format!(
                    "non-positive tick size {} for {}",
                    new, instrument_id
                )));
            }
            NormalizedEvent::TickSizeChange {
                instrument_id,
                market: raw.market,
                timestamp: raw.timestamp,
                old: raw.old_tick_size,
                new,
            }
        }
    };

    Ok(Some(event))
}

fn validate_levels(instrument_id: &str, levels: Vec<RawLevel>) -> Result<Vec<Level>> {
    levels
        .into_iter()
        .map(|l| {
            validate_quote(instrument_id, l.price, l.size)?;
            Ok(Level {
                price: l.price,
                size: l.size,
            })
        })
        .collect()
}

fn validate_quote(instrument_id: &str, price: Decimal, size: Decimal) -> Result<()> {
    if price.is_sign_negative() || size.is_sign_negative() {
        return Err(FeedError::ParseError(format!(
            "negative level {} x {} for {}",
            price, size, instrument_id
        )));
    }
    Ok(())
}

/// First bytes of a payload for log context, cut on a char boundary
pub fn payload_prefix(raw: &str) -> &str {
    if raw.len() <= PAYLOAD_PREFIX_LEN {
        return raw;
    }
    let mut end = PAYLOAD_PREFIX_LEN;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    &raw[..end]
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Millisecond timestamps arrive either as strings or as numbers
fn deserialize_opt_millis<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Millis {
        Num(u64),
        Str(String),
    }

    match Option::<Millis>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Millis::Num(n)) => Ok(Some(n)),
        Some(Millis::Str(s)) if s.trim().is_empty() => Ok(None),
        Some(Millis::Str(s)) => s.trim().parse().map(Some).map_err(serde::de::Error::custom),
    }
}
