//! Raw payload to canonical record projection.
//!
//! `normalize` is a pure function of the raw type string and the payload: it only consults
//! the static tables in `schema`. `normalize_record` adds the envelope columns taken from the
//! raw record itself.
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::record::{RawRecord, RecordType};
use crate::schema::{
    format_timestamp, schema_for, FieldKind, FieldSpec, FieldValue, Schema, EVENT_TS,
    KEY_RECEIVED_AT, KEY_SEQ,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizeError {
    #[error("payload of {record_type} is not an object")]
    NotAnObject { record_type: RecordType },

    #[error("required field {field} missing in {record_type}")]
    MissingField {
        record_type: RecordType,
        field: &'static str,
    },

    #[error("field {field} of {record_type} is invalid: {reason}")]
    InvalidField {
        record_type: RecordType,
        field: &'static str,
        reason: String,
    },
}

/// Field values of one record, aligned with `schema.fields`.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedFields {
    pub schema: &'static Schema,
    pub values: Vec<FieldValue>,
}

impl NormalizedFields {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.schema.field_index(name).map(|i| &self.values[i])
    }
}

/// Typed projection of a raw record.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    pub record_type: RecordType,
    pub natural_key: String,
    pub received_at: DateTime<Utc>,
    pub values: Vec<FieldValue>,
}

impl CanonicalRecord {
    pub fn schema(&self) -> &'static Schema {
        schema_for(self.record_type)
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.schema().field_index(name).map(|i| &self.values[i])
    }
}

/// Project `payload` onto the schema of `type_name`.
///
/// Unknown type names use the passthrough schema, which never fails.
pub fn normalize(type_name: &str, payload: &Value) -> Result<NormalizedFields, NormalizeError> {
    let record_type = RecordType::classify(type_name);
    let schema = schema_for(record_type);

    if record_type == RecordType::Unclassified {
        return Ok(NormalizedFields {
            schema,
            values: vec![
                FieldValue::Text(original_type(type_name, payload).to_string()),
                FieldValue::Text(payload.to_string()),
            ],
        });
    }

    if !payload.is_object() {
        return Err(NormalizeError::NotAnObject { record_type });
    }

    let mut values = Vec::with_capacity(schema.fields.len());
    for field in schema.fields {
        values.push(normalize_field(record_type, field, payload)?);
    }

    Ok(NormalizedFields { schema, values })
}

/// Normalize a raw record and derive its natural key.
pub fn normalize_record(record: &RawRecord) -> Result<CanonicalRecord, NormalizeError> {
    let fields = normalize(&record.record_type, &record.payload)?;
    let natural_key = natural_key(&fields, record);

    Ok(CanonicalRecord {
        record_type: fields.schema.record_type,
        natural_key,
        received_at: record.received_at,
        values: fields.values,
    })
}

/// Type a passthrough record was received as. Records written under the catch-all type keep
/// their discriminator in the payload.
fn original_type<'a>(type_name: &'a str, payload: &'a Value) -> &'a str {
    if type_name != RecordType::Unclassified.as_ref() {
        return type_name;
    }

    ["event_type", "type"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(|v| v.as_str()))
        .unwrap_or(type_name)
}

/// Join the key components of the schema with `|`. Components are escaped, so distinct
/// component lists never produce the same key.
fn natural_key(fields: &NormalizedFields, record: &RawRecord) -> String {
    fields
        .schema
        .key
        .iter()
        .map(|component| match *component {
            KEY_RECEIVED_AT => format_timestamp(&record.received_at),
            KEY_SEQ => record.seq.to_string(),
            name => match fields.get(name) {
                Some(FieldValue::Null) if name == EVENT_TS => format_timestamp(&record.received_at),
                Some(value) => escape_key_component(&value.key_component()),
                None => String::new(),
            },
        })
        .collect::<Vec<_>>()
        .join("|")
}

fn escape_key_component(component: &str) -> String {
    if !component.contains(['|', '\\']) {
        return component.to_string();
    }

    let mut escaped = String::with_capacity(component.len() + 2);
    for c in component.chars() {
        if c == '|' || c == '\\' {
            escaped.push('\\');
        }
        escaped.push(c);
    }

    escaped
}

fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = payload;
    for part in path.split('.') {
        cur = cur.as_object()?.get(part)?;
    }

    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

fn normalize_field(
    record_type: RecordType,
    field: &FieldSpec,
    payload: &Value,
) -> Result<FieldValue, NormalizeError> {
    let raw = field.paths.iter().find_map(|path| lookup(payload, path));

    let raw = match raw {
        Some(raw) => raw,
        None if field.required => {
            return Err(NormalizeError::MissingField {
                record_type,
                field: field.name,
            })
        }
        None => return Ok(field.default.value()),
    };

    convert(field.kind, raw).map_err(|reason| NormalizeError::InvalidField {
        record_type,
        field: field.name,
        reason,
    })
}

fn convert(kind: FieldKind, raw: &Value) -> Result<FieldValue, String> {
    match kind {
        FieldKind::Text => to_text(raw).map(FieldValue::Text),
        FieldKind::HtmlText => to_text(raw).map(|s| FieldValue::Text(html_to_text(&s))),
        FieldKind::Float => to_float(raw).map(FieldValue::Float),
        FieldKind::Int => to_int(raw).map(FieldValue::Int),
        FieldKind::Bool => match raw {
            Value::Bool(b) => Ok(FieldValue::Bool(*b)),
            Value::String(s) if s == "true" => Ok(FieldValue::Bool(true)),
            Value::String(s) if s == "false" => Ok(FieldValue::Bool(false)),
            other => Err(format!("expected bool, got {}", other)),
        },
        FieldKind::Timestamp => to_timestamp(raw).map(FieldValue::Timestamp),
        FieldKind::TextList => to_text_list(raw).map(FieldValue::TextList),
        FieldKind::Json => Ok(FieldValue::Text(raw.to_string())),
        FieldKind::NonEmpty => match raw {
            Value::Array(items) => Ok(FieldValue::Bool(!items.is_empty())),
            other => Err(format!("expected array, got {}", other)),
        },
        FieldKind::Pluck(key) => match raw {
            Value::Array(items) => Ok(FieldValue::TextList(
                items
                    .iter()
                    .filter_map(|item| item.get(key).and_then(|v| v.as_str()))
                    .map(|s| s.to_string())
                    .collect(),
            )),
            other => Err(format!("expected array, got {}", other)),
        },
    }
}

fn to_text(raw: &Value) -> Result<String, String> {
    match raw {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(format!("expected scalar, got {}", other)),
    }
}

fn to_float(raw: &Value) -> Result<f64, String> {
    let v = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match v {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(format!("expected number, got {}", raw)),
    }
}

fn to_int(raw: &Value) -> Result<i64, String> {
    let v = match raw {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };

    v.ok_or_else(|| format!("expected integer, got {}", raw))
}

fn to_timestamp(raw: &Value) -> Result<DateTime<Utc>, String> {
    let millis = match raw {
        Value::Number(n) => n.as_i64(),
        Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
            s.parse::<i64>().ok()
        }
        Value::String(s) => {
            return DateTime::parse_from_rfc3339(s)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| format!("invalid timestamp {}: {}", s, e));
        }
        _ => None,
    };

    millis
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .ok_or_else(|| format!("invalid timestamp {}", raw))
}

fn to_text_list(raw: &Value) -> Result<Vec<String>, String> {
    match raw {
        Value::Array(items) => items.iter().map(to_text).collect(),
        // Some feeds ship lists as JSON encoded strings.
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(inner @ Value::Array(_)) => to_text_list(&inner),
            _ => Err(format!("expected list, got {}", raw)),
        },
        other => Err(format!("expected list, got {}", other)),
    }
}

/// Strip tags from an HTML fragment, keep line breaks, decode the common entities.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut chars = html.chars();

    while let Some(c) = chars.next() {
        if c != '<' {
            out.push(c);
            continue;
        }

        let mut tag = String::new();
        for t in chars.by_ref() {
            if t == '>' {
                break;
            }
            tag.push(t);
        }

        let name = tag
            .trim_start_matches('/')
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();

        if name == "br" || (name == "p" && tag.starts_with('/')) {
            out.push('\n');
        }
    }

    out.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&#39;", "'")
        .replace("&quot;", "\"")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Source;
    use serde_json::json;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse::<DateTime<Utc>>().unwrap()
    }

    fn raw(type_name: &str, payload: Value) -> RawRecord {
        RawRecord::new(
            Source::MarketFeed,
            type_name,
            ts("2024-01-01T10:15:00Z"),
            3,
            payload,
        )
    }

    #[test]
    fn test_trade_numeric_fields() {
        let record = normalize_record(&raw(
            "trade",
            json!({"market_id": "m1", "price": "0.55", "size": 10}),
        ))
        .unwrap();

        assert_eq!(record.record_type, RecordType::Trade);
        assert_eq!(record.get("price"), Some(&FieldValue::Float(0.55)));
        assert_eq!(record.get("size"), Some(&FieldValue::Float(10.0)));
        assert_eq!(record.get("side"), Some(&FieldValue::Null));
        // No event time, the key falls back to the receive time.
        assert_eq!(record.natural_key, "m1|||0.55|10|2024-01-01T10:15:00.000Z");
    }

    #[test]
    fn test_event_timestamp_in_millis() {
        let record = normalize_record(&raw(
            "trade",
            json!({
                "market": "m1",
                "asset_id": "a1",
                "price": 0.5,
                "size": "3",
                "timestamp": "1704104100000"
            }),
        ))
        .unwrap();

        assert_eq!(
            record.get(EVENT_TS),
            Some(&FieldValue::Timestamp(ts("2024-01-01T10:15:00Z")))
        );
        assert_eq!(record.natural_key, "m1|a1||0.5|3|2024-01-01T10:15:00.000Z");
    }

    #[test]
    fn test_separator_inside_key_component() {
        let a = normalize_record(&raw(
            "price_change",
            json!({"market_id": "m|1", "asset_id": "a", "price": 0.5}),
        ))
        .unwrap();
        let b = normalize_record(&raw(
            "price_change",
            json!({"market_id": "m", "asset_id": "1|a", "price": 0.5}),
        ))
        .unwrap();

        assert_eq!(a.natural_key, "m\\|1|a||0.5|2024-01-01T10:15:00.000Z");
        assert_eq!(b.natural_key, "m|1\\|a||0.5|2024-01-01T10:15:00.000Z");
        assert_ne!(a.natural_key, b.natural_key);

        let c = normalize_record(&raw(
            "price_change",
            json!({"market_id": "m\\", "asset_id": "|a", "price": 0.5}),
        ))
        .unwrap();
        assert_ne!(c.natural_key, a.natural_key);
        assert_ne!(c.natural_key, b.natural_key);
    }

    #[test]
    fn test_missing_required_field() {
        let err = normalize("trade", &json!({"market_id": "m1", "size": 1})).unwrap_err();
        assert_eq!(
            err,
            NormalizeError::MissingField {
                record_type: RecordType::Trade,
                field: "price"
            }
        );
    }

    #[test]
    fn test_invalid_field() {
        let err = normalize("trade", &json!({"market_id": "m1", "price": "abc", "size": 1}))
            .unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidField { field: "price", .. }));

        let err = normalize("trade", &json!([1, 2])).unwrap_err();
        assert_eq!(
            err,
            NormalizeError::NotAnObject {
                record_type: RecordType::Trade
            }
        );
    }

    #[test]
    fn test_unknown_type_is_passthrough() {
        let payload = json!({"event_type": "orderbook_v9", "b": [1, 2], "a": null});
        let record = normalize_record(&raw("orderbook_v9", payload.clone())).unwrap();

        assert_eq!(record.record_type, RecordType::Unclassified);
        assert_eq!(
            record.get("original_type"),
            Some(&FieldValue::Text("orderbook_v9".to_string()))
        );

        let FieldValue::Text(blob) = record.get("payload").unwrap() else {
            panic!("payload is not text");
        };
        assert_eq!(serde_json::from_str::<Value>(blob).unwrap(), payload);
        assert_eq!(record.natural_key, "2024-01-01T10:15:00.000Z|3");

        let record = normalize_record(&raw("unclassified", payload)).unwrap();
        assert_eq!(
            record.get("original_type"),
            Some(&FieldValue::Text("orderbook_v9".to_string()))
        );
    }

    #[test]
    fn test_new_market_lists_and_defaults() {
        let fields = normalize(
            "new_market",
            &json!({
                "id": "123",
                "market": "0xabc",
                "assets_ids": "[\"t1\", \"t2\"]",
                "question": "Will it rain?"
            }),
        )
        .unwrap();

        assert_eq!(
            fields.get("market_id"),
            Some(&FieldValue::Text("0xabc".to_string()))
        );
        assert_eq!(
            fields.get("asset_ids"),
            Some(&FieldValue::TextList(vec!["t1".to_string(), "t2".to_string()]))
        );
        assert_eq!(fields.get("outcomes"), Some(&FieldValue::TextList(vec![])));
    }

    #[test]
    fn test_social_post() {
        let mut record = raw(
            "social_post",
            json!({
                "id": "111",
                "created_at": "2024-01-01T09:00:00.000Z",
                "account": {"id": "42", "username": "someone"},
                "content": "<p>Hello &amp; welcome<br/>all</p>",
                "replies_count": 4,
                "media_attachments": [{"type": "image"}, {"type": "video"}]
            }),
        );
        record.source = Source::SocialFeed;

        let record = normalize_record(&record).unwrap();

        assert_eq!(record.natural_key, "111");
        assert_eq!(
            record.get("author_username"),
            Some(&FieldValue::Text("someone".to_string()))
        );
        assert_eq!(
            record.get("content_text"),
            Some(&FieldValue::Text("Hello & welcome\nall".to_string()))
        );
        assert_eq!(record.get("replies_count"), Some(&FieldValue::Int(4)));
        assert_eq!(record.get("reblogs_count"), Some(&FieldValue::Int(0)));
        assert_eq!(record.get("has_media"), Some(&FieldValue::Bool(true)));
        assert_eq!(
            record.get("media_types"),
            Some(&FieldValue::TextList(vec!["image".to_string(), "video".to_string()]))
        );
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let payload = json!({"market": "m", "asset_id": "a", "price": "0.1", "side": "BUY"});
        let a = normalize("price_change", &payload).unwrap();
        let b = normalize("price_change", &payload).unwrap();
        assert_eq!(a, b);
    }
}
