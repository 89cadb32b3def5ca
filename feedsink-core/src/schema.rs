//! Canonical schema of every record type.
//!
//! The tables here are the only input of the normalizer besides the record itself. Each
//! field names the payload paths it may be read from, in order of preference. Dotted paths
//! walk nested objects.
use chrono::{DateTime, SecondsFormat, Utc};

use crate::record::RecordType;

/// Envelope column present in every canonical batch.
pub const NATURAL_KEY_COLUMN: &str = "natural_key";

/// Envelope column present in every canonical batch.
pub const RECEIVED_AT_COLUMN: &str = "received_at";

/// Key component resolved from the record envelope instead of a field.
pub const KEY_RECEIVED_AT: &str = "received_at";

/// Key component resolved from the record envelope instead of a field.
pub const KEY_SEQ: &str = "seq";

/// Name of the event time field. A null event time in a key falls back to `received_at`.
pub const EVENT_TS: &str = "event_ts";

/// How a field is read from the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,

    /// HTML fragment reduced to plain text.
    HtmlText,

    /// JSON number or numeric string.
    Float,

    Int,

    Bool,

    /// Epoch milliseconds (number or digit string), or RFC 3339 text.
    Timestamp,

    /// JSON array of scalars, or a string holding such an array.
    TextList,

    /// Any value, kept as serialized JSON text.
    Json,

    /// `true` when the path holds a non-empty array.
    NonEmpty,

    /// Text values of the given key of every object in an array.
    Pluck(&'static str),
}

/// Physical column type a field is stored as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Float,
    Int,
    Bool,
    Timestamp,
    TextList,
}

impl FieldKind {
    pub fn column_type(&self) -> ColumnType {
        match self {
            FieldKind::Text | FieldKind::HtmlText | FieldKind::Json => ColumnType::Text,
            FieldKind::Float => ColumnType::Float,
            FieldKind::Int => ColumnType::Int,
            FieldKind::Bool | FieldKind::NonEmpty => ColumnType::Bool,
            FieldKind::Timestamp => ColumnType::Timestamp,
            FieldKind::TextList | FieldKind::Pluck(_) => ColumnType::TextList,
        }
    }
}

/// Value used when an optional field is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldDefault {
    Null,
    Int(i64),
    Bool(bool),
    EmptyList,
}

impl FieldDefault {
    pub fn value(&self) -> FieldValue {
        match self {
            FieldDefault::Null => FieldValue::Null,
            FieldDefault::Int(v) => FieldValue::Int(*v),
            FieldDefault::Bool(v) => FieldValue::Bool(*v),
            FieldDefault::EmptyList => FieldValue::TextList(Vec::new()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub paths: &'static [&'static str],
    pub kind: FieldKind,
    pub required: bool,
    pub default: FieldDefault,
}

impl FieldSpec {
    /// Columns with a non-null default are never null.
    pub fn nullable(&self) -> bool {
        !self.required && self.default == FieldDefault::Null
    }
}

const fn required(name: &'static str, paths: &'static [&'static str], kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        paths,
        kind,
        required: true,
        default: FieldDefault::Null,
    }
}

const fn optional(name: &'static str, paths: &'static [&'static str], kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        paths,
        kind,
        required: false,
        default: FieldDefault::Null,
    }
}

const fn defaulted(
    name: &'static str,
    paths: &'static [&'static str],
    kind: FieldKind,
    default: FieldDefault,
) -> FieldSpec {
    FieldSpec {
        name,
        paths,
        kind,
        required: false,
        default,
    }
}

/// Declared schema of one record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schema {
    pub record_type: RecordType,
    pub fields: &'static [FieldSpec],

    /// Components of the natural key, field names or `KEY_RECEIVED_AT` / `KEY_SEQ`.
    pub key: &'static [&'static str],
}

impl Schema {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

const EVENT_TS_FIELD: FieldSpec = optional(EVENT_TS, &["timestamp"], FieldKind::Timestamp);

static PRICE_CHANGE: Schema = Schema {
    record_type: RecordType::PriceChange,
    fields: &[
        required("market_id", &["market_id", "market"], FieldKind::Text),
        required("asset_id", &["asset_id"], FieldKind::Text),
        required("price", &["price"], FieldKind::Float),
        optional("size", &["size"], FieldKind::Float),
        optional("side", &["side"], FieldKind::Text),
        optional("best_bid", &["best_bid"], FieldKind::Float),
        optional("best_ask", &["best_ask"], FieldKind::Float),
        EVENT_TS_FIELD,
    ],
    key: &["market_id", "asset_id", "side", "price", EVENT_TS],
};

static TRADE: Schema = Schema {
    record_type: RecordType::Trade,
    fields: &[
        required("market_id", &["market_id", "market"], FieldKind::Text),
        optional("asset_id", &["asset_id"], FieldKind::Text),
        required("price", &["price"], FieldKind::Float),
        required("size", &["size"], FieldKind::Float),
        optional("side", &["side"], FieldKind::Text),
        optional("fee_rate_bps", &["fee_rate_bps"], FieldKind::Float),
        EVENT_TS_FIELD,
    ],
    // Fills matched together share a timestamp.
    key: &["market_id", "asset_id", "side", "price", "size", EVENT_TS],
};

static NEW_MARKET: Schema = Schema {
    record_type: RecordType::NewMarket,
    fields: &[
        required("market_id", &["market", "market_id", "id"], FieldKind::Text),
        optional("question", &["question"], FieldKind::Text),
        optional("slug", &["slug"], FieldKind::Text),
        optional("description", &["description"], FieldKind::Text),
        defaulted(
            "asset_ids",
            &["assets_ids", "asset_ids"],
            FieldKind::TextList,
            FieldDefault::EmptyList,
        ),
        defaulted(
            "outcomes",
            &["outcomes"],
            FieldKind::TextList,
            FieldDefault::EmptyList,
        ),
        EVENT_TS_FIELD,
    ],
    key: &["market_id"],
};

static MARKET_RESOLVED: Schema = Schema {
    record_type: RecordType::MarketResolved,
    fields: &[
        required("market_id", &["market", "market_id", "id"], FieldKind::Text),
        optional("question", &["question"], FieldKind::Text),
        optional("winning_asset_id", &["winning_asset_id"], FieldKind::Text),
        optional("winning_outcome", &["winning_outcome"], FieldKind::Text),
        EVENT_TS_FIELD,
    ],
    key: &["market_id"],
};

static TICK_CHANGE: Schema = Schema {
    record_type: RecordType::TickChange,
    fields: &[
        required("market_id", &["market_id", "market"], FieldKind::Text),
        required("asset_id", &["asset_id"], FieldKind::Text),
        optional("old_tick_size", &["old_tick_size"], FieldKind::Float),
        required("new_tick_size", &["new_tick_size"], FieldKind::Float),
        EVENT_TS_FIELD,
    ],
    key: &["market_id", "asset_id", EVENT_TS],
};

static BOOK: Schema = Schema {
    record_type: RecordType::Book,
    fields: &[
        optional("market_id", &["market_id", "market"], FieldKind::Text),
        required("asset_id", &["asset_id"], FieldKind::Text),
        optional("bids", &["bids", "buys"], FieldKind::Json),
        optional("asks", &["asks", "sells"], FieldKind::Json),
        EVENT_TS_FIELD,
    ],
    key: &["asset_id", EVENT_TS],
};

static BEST_BID_ASK: Schema = Schema {
    record_type: RecordType::BestBidAsk,
    fields: &[
        optional("market_id", &["market_id", "market"], FieldKind::Text),
        required("asset_id", &["asset_id"], FieldKind::Text),
        optional("best_bid", &["best_bid"], FieldKind::Float),
        optional("best_ask", &["best_ask"], FieldKind::Float),
        optional("spread", &["spread"], FieldKind::Float),
        EVENT_TS_FIELD,
    ],
    key: &["asset_id", EVENT_TS],
};

static SOCIAL_POST: Schema = Schema {
    record_type: RecordType::SocialPost,
    fields: &[
        required("post_id", &["id", "post_id"], FieldKind::Text),
        required("created_at", &["created_at"], FieldKind::Timestamp),
        optional("author_id", &["account.id", "author_id"], FieldKind::Text),
        optional(
            "author_username",
            &["account.username", "account.acct", "author_username"],
            FieldKind::Text,
        ),
        optional("content", &["content"], FieldKind::Text),
        optional("content_text", &["content"], FieldKind::HtmlText),
        optional("uri", &["uri", "url"], FieldKind::Text),
        defaulted("replies_count", &["replies_count"], FieldKind::Int, FieldDefault::Int(0)),
        defaulted("reblogs_count", &["reblogs_count"], FieldKind::Int, FieldDefault::Int(0)),
        defaulted(
            "favourites_count",
            &["favourites_count"],
            FieldKind::Int,
            FieldDefault::Int(0),
        ),
        defaulted("upvotes_count", &["upvotes_count"], FieldKind::Int, FieldDefault::Int(0)),
        defaulted(
            "downvotes_count",
            &["downvotes_count"],
            FieldKind::Int,
            FieldDefault::Int(0),
        ),
        defaulted(
            "has_media",
            &["media_attachments"],
            FieldKind::NonEmpty,
            FieldDefault::Bool(false),
        ),
        defaulted(
            "media_types",
            &["media_attachments"],
            FieldKind::Pluck("type"),
            FieldDefault::EmptyList,
        ),
    ],
    key: &["post_id"],
};

/// Passthrough schema. Its fields are filled from the raw type string and the whole payload.
static UNCLASSIFIED: Schema = Schema {
    record_type: RecordType::Unclassified,
    fields: &[
        required("original_type", &[], FieldKind::Text),
        required("payload", &[], FieldKind::Json),
    ],
    key: &[KEY_RECEIVED_AT, KEY_SEQ],
};

/// Schema of `record_type`.
pub fn schema_for(record_type: RecordType) -> &'static Schema {
    match record_type {
        RecordType::PriceChange => &PRICE_CHANGE,
        RecordType::Trade => &TRADE,
        RecordType::NewMarket => &NEW_MARKET,
        RecordType::MarketResolved => &MARKET_RESOLVED,
        RecordType::TickChange => &TICK_CHANGE,
        RecordType::Book => &BOOK,
        RecordType::BestBidAsk => &BEST_BID_ASK,
        RecordType::SocialPost => &SOCIAL_POST,
        RecordType::Unclassified => &UNCLASSIFIED,
    }
}

/// A typed cell of a canonical record.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Text(String),
    Float(f64),
    Int(i64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    TextList(Vec<String>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Text form used inside natural keys.
    pub fn key_component(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::Text(s) => s.clone(),
            FieldValue::Float(v) => v.to_string(),
            FieldValue::Int(v) => v.to_string(),
            FieldValue::Bool(v) => v.to_string(),
            FieldValue::Timestamp(ts) => format_timestamp(ts),
            FieldValue::TextList(v) => v.join(","),
        }
    }
}

/// RFC 3339 with millisecond precision, always in UTC.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
