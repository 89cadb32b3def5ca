//! Raw record model shared by every stage.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Where a record came from.
///
/// The string form is used as the top level directory of every storage tree.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Streaming market events.
    MarketFeed,

    /// Polled social posts.
    SocialFeed,
}

/// The closed set of record types known to the pipeline.
///
/// Everything the feeds send that is not one of the typed variants ends up as
/// `Unclassified`, and keeps its payload verbatim.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    PriceChange,
    Trade,
    NewMarket,
    MarketResolved,
    TickChange,
    Book,
    BestBidAsk,
    SocialPost,
    Unclassified,
}

impl RecordType {
    /// Resolve a raw `type` string. Unknown strings map to `Unclassified`.
    pub fn classify(type_name: &str) -> Self {
        type_name.parse().unwrap_or(RecordType::Unclassified)
    }

    /// Map the market feed's `event_type` discriminator to a record type.
    ///
    /// Returns `None` for discriminators the pipeline has no typed schema for.
    pub fn from_market_event(event_type: &str) -> Option<Self> {
        match event_type {
            "price_change" => Some(RecordType::PriceChange),
            "last_trade_price" => Some(RecordType::Trade),
            "new_market" => Some(RecordType::NewMarket),
            "market_resolved" => Some(RecordType::MarketResolved),
            "tick_size_change" => Some(RecordType::TickChange),
            "book" => Some(RecordType::Book),
            "best_bid_ask" => Some(RecordType::BestBidAsk),
            _ => None,
        }
    }

    /// Query store collection name for this type.
    pub fn collection(&self) -> &str {
        self.as_ref()
    }
}

/// One record as received, before normalization.
///
/// Serialized as one JSON line in a raw segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source: Source,

    /// Raw type string, normally the string form of a `RecordType`.
    #[serde(rename = "type")]
    pub record_type: String,

    pub received_at: DateTime<Utc>,

    /// Per writer session sequence, assigned in arrival order.
    pub seq: u64,

    pub payload: Value,
}

impl RawRecord {
    pub fn new(
        source: Source,
        record_type: &str,
        received_at: DateTime<Utc>,
        seq: u64,
        payload: Value,
    ) -> Self {
        Self {
            source,
            record_type: record_type.to_string(),
            received_at,
            seq,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify() {
        assert_eq!(RecordType::classify("trade"), RecordType::Trade);
        assert_eq!(RecordType::classify("tick_change"), RecordType::TickChange);
        assert_eq!(RecordType::classify("orderbook_v2"), RecordType::Unclassified);
        assert_eq!(RecordType::Trade.collection(), "trade");
        assert_eq!(RecordType::BestBidAsk.to_string(), "best_bid_ask");
    }

    #[test]
    fn test_market_event_mapping() {
        assert_eq!(
            RecordType::from_market_event("last_trade_price"),
            Some(RecordType::Trade)
        );
        assert_eq!(
            RecordType::from_market_event("tick_size_change"),
            Some(RecordType::TickChange)
        );
        assert_eq!(RecordType::from_market_event("trade"), None);
    }

    #[test]
    fn test_raw_record_line_format() {
        let received_at = "2024-01-01T10:15:00Z".parse::<DateTime<Utc>>().unwrap();
        let record = RawRecord::new(
            Source::MarketFeed,
            "trade",
            received_at,
            7,
            json!({"market_id": "m1"}),
        );

        let line = serde_json::to_string(&record).unwrap();
        assert!(line.contains("\"source\":\"market_feed\""));
        assert!(line.contains("\"type\":\"trade\""));

        let back: RawRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back, record);
    }
}
