//! Liquidation event types from the upstream indexer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Liquidated position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn is_long(self) -> bool {
        matches!(self, Side::Long)
    }
}

/// Keyset pagination order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }

    /// Parse a client-supplied order string, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ASC" => Some(SortOrder::Asc),
            "DESC" => Some(SortOrder::Desc),
            _ => None,
        }
    }
}

/// A single observed liquidation. Immutable once observed.
///
/// `tid` is assigned by the upstream indexer: unique and increasing, but not
/// gap-free. `time` is authoritative; `time_ms` has been observed corrupted
/// upstream and is always recomputed from `time` during normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Liquidation {
    pub tid: u64,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub time_ms: i64,
    pub coin: String,
    pub dir: Side,
    pub notional: f64,
    #[serde(default)]
    pub mark_price: f64,
    #[serde(default)]
    pub liquidated_user: String,
    #[serde(default)]
    pub liquidators: Vec<String>,
}

/// Server-side filter parameters for the historical endpoint.
#[derive(Debug, Clone, Default)]
pub struct LiquidationFilter {
    pub coin: Option<String>,
    pub user: Option<String>,
    /// Epoch milliseconds, forwarded literally.
    pub start_time: Option<i64>,
    /// Epoch milliseconds, forwarded literally.
    pub end_time: Option<i64>,
    /// Minimum USD notional.
    pub amount_dollars: Option<f64>,
}

/// Upstream page body before per-entry normalization.
#[derive(Debug, Deserialize)]
pub(crate) struct RawPageResponse {
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub execution_time_ms: f64,
}

/// One page of normalized liquidations. The cursor is opaque; forward it
/// verbatim to fetch the next page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResponse {
    pub data: Vec<Liquidation>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
    pub execution_time_ms: f64,
}

/// Parse raw page entries one by one so a single malformed row never poisons
/// the page. Returns the surviving events and the dropped-entry count.
///
/// `time_ms` is recomputed from `time` unconditionally. Entries with a zero
/// `tid`, empty `coin`, or a non-finite/non-positive `notional` are dropped.
pub fn normalize_events(raw: Vec<serde_json::Value>) -> (Vec<Liquidation>, usize) {
    let mut events = Vec::with_capacity(raw.len());
    let mut dropped = 0;

    for value in raw {
        match serde_json::from_value::<Liquidation>(value) {
            Ok(mut event) => {
                event.time_ms = event.time.timestamp_millis();
                if event.tid == 0
                    || event.coin.is_empty()
                    || !event.notional.is_finite()
                    || event.notional <= 0.0
                {
                    dropped += 1;
                    continue;
                }
                events.push(event);
            }
            Err(_) => dropped += 1,
        }
    }

    (events, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_recomputes_time_ms() {
        let raw = vec![json!({
            "tid": 42,
            "time": "2026-01-01T00:00:00Z",
            "time_ms": 1, // corrupt upstream value
            "coin": "BTC",
            "dir": "Long",
            "notional": 1000.0,
            "mark_price": 96000.5,
            "liquidated_user": "0xabc",
            "liquidators": ["0xdef"]
        })];

        let (events, dropped) = normalize_events(raw);
        assert_eq!(dropped, 0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].time_ms, 1_767_225_600_000);
        assert_eq!(events[0].dir, Side::Long);
    }

    #[test]
    fn test_normalize_drops_malformed_entries() {
        let raw = vec![
            json!({"tid": 1, "time": "2026-01-01T00:00:00Z", "coin": "BTC", "dir": "Short", "notional": 5.0}),
            json!({"tid": "not-a-number"}),
            json!({"tid": 2, "time": "2026-01-01T00:00:00Z", "coin": "", "dir": "Long", "notional": 5.0}),
            json!({"tid": 3, "time": "2026-01-01T00:00:00Z", "coin": "ETH", "dir": "Long", "notional": -1.0}),
            json!({"tid": 0, "time": "2026-01-01T00:00:00Z", "coin": "ETH", "dir": "Long", "notional": 1.0}),
        ];

        let (events, dropped) = normalize_events(raw);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tid, 1);
        assert_eq!(dropped, 4);
    }

    #[test]
    fn test_sort_order_parse() {
        assert_eq!(SortOrder::parse("asc"), Some(SortOrder::Asc));
        assert_eq!(SortOrder::parse("DESC"), Some(SortOrder::Desc));
        assert_eq!(SortOrder::parse(" Desc "), Some(SortOrder::Desc));
        assert_eq!(SortOrder::parse("sideways"), None);
    }
}
