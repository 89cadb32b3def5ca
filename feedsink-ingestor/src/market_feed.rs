//! Market event feed: websocket transport, topic discovery and frame decoding.
use anyhow::Result;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{info, warn};
use serde_json::{json, Map, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use feedsink_core::backoff::Backoff;
use feedsink_core::config::MarketFeedConfig;
use feedsink_core::error::FeedError;
use feedsink_core::error_bail;
use feedsink_core::record::RecordType;

/// Keepalive frames of the market channel.
pub const PING: &str = "PING";
pub const PONG: &str = "PONG";

const DISCOVERY_ATTEMPTS: u32 = 3;

/// One open connection to the feed, text frames in both directions.
#[async_trait]
pub trait FeedConnection: Send {
    /// Next text frame. `Ok(None)` once the server closed the connection.
    async fn recv(&mut self) -> Result<Option<String>, FeedError>;

    async fn send(&mut self, text: String) -> Result<(), FeedError>;
}

/// Opens connections to the feed.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn FeedConnection>, FeedError>;
}

/// `FeedConnector` over a websocket url.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl FeedConnector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn FeedConnection>, FeedError> {
        let (stream, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| FeedError::Transient(format!("connect {} failed: {}", self.url, e)))?;

        info!(
            "websocket connected, url: {}, status: {}",
            self.url,
            response.status()
        );

        Ok(Box::new(WsConnection { stream }))
    }
}

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FeedConnection for WsConnection {
    async fn recv(&mut self) -> Result<Option<String>, FeedError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(bytes))) => {
                    return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
                }
                // Protocol level pings are answered by tungstenite itself.
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    info!("websocket closed by server, frame: {:?}", frame);
                    return Ok(None);
                }
                Some(Err(e)) => return Err(FeedError::Transient(e.to_string())),
                None => return Ok(None),
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<(), FeedError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| FeedError::Transient(e.to_string()))
    }
}

/// Subscription message for the given asset ids.
pub fn subscribe_message(asset_ids: &[String]) -> String {
    json!({
        "assets_ids": asset_ids,
        "custom_feature_enabled": true,
    })
    .to_string()
}

/// Asset ids to subscribe to.
///
/// Configured ids win. Otherwise the active markets are listed and the token ids of every
/// market with an order book are used.
pub async fn discover_topics(
    client: &reqwest::Client,
    config: &MarketFeedConfig,
) -> Result<Vec<String>> {
    if !config.asset_ids.is_empty() {
        return Ok(config.asset_ids.clone());
    }

    let url = format!(
        "{}?closed=false&active=true&limit={}",
        config.markets_url, config.max_markets
    );

    let mut backoff = Backoff::from_millis(config.backoff_initial_ms, config.backoff_max_ms);

    for attempt in 1..=DISCOVERY_ATTEMPTS {
        match fetch_market_listing(client, &url).await {
            Ok(listing) => {
                let topics = parse_market_listing(&listing);
                info!("discovered {} asset ids from {}", topics.len(), url);
                return Ok(topics);
            }
            Err(e) if attempt < DISCOVERY_ATTEMPTS => {
                let delay = backoff.next_delay();
                warn!(
                    "list markets failed, attempt: {}, retry in {:?}, error: {}",
                    attempt, delay, e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error_bail!("list markets failed, url: {}, error: {}", url, e);
            }
        }
    }

    Ok(Vec::new())
}

async fn fetch_market_listing(client: &reqwest::Client, url: &str) -> Result<Value, FeedError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| FeedError::Transient(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(FeedError::Transient(format!("status {}", status)));
    }

    response
        .json::<Value>()
        .await
        .map_err(|e| FeedError::Malformed(e.to_string()))
}

/// Token ids of the markets with an order book. `clobTokenIds` is usually a JSON encoded
/// string, a plain array is accepted too.
pub fn parse_market_listing(listing: &Value) -> Vec<String> {
    let Some(markets) = listing.as_array() else {
        return Vec::new();
    };

    let mut topics = Vec::new();

    for market in markets {
        if !market
            .get("enableOrderBook")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            continue;
        }

        let ids = match market.get("clobTokenIds") {
            Some(Value::String(s)) => serde_json::from_str::<Value>(s).unwrap_or(Value::Null),
            Some(v) => v.clone(),
            None => Value::Null,
        };

        if let Value::Array(ids) = ids {
            topics.extend(
                ids.iter()
                    .filter_map(|id| id.as_str())
                    .map(|id| id.to_string()),
            );
        }
    }

    topics
}

/// One event decoded from a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEvent {
    /// Raw type string the record is written with.
    pub record_type: String,
    pub payload: Value,
}

impl FeedEvent {
    pub fn is_unclassified(&self) -> bool {
        RecordType::classify(&self.record_type) == RecordType::Unclassified
    }
}

/// Split a text frame into events.
///
/// A frame holds one JSON object or an array of them. Frames that are not JSON are
/// `FeedError::Malformed`.
pub fn decode_frame(text: &str) -> Result<Vec<FeedEvent>, FeedError> {
    let value = serde_json::from_str::<Value>(text)
        .map_err(|e| FeedError::Malformed(format!("{}: {}", e, truncate(text, 64))))?;

    let mut events = Vec::new();

    match value {
        Value::Array(items) => {
            for item in items {
                decode_event(item, &mut events);
            }
        }
        other => decode_event(other, &mut events),
    }

    Ok(events)
}

fn decode_event(value: Value, out: &mut Vec<FeedEvent>) {
    let record_type = value
        .get("event_type")
        .and_then(|v| v.as_str())
        .and_then(RecordType::from_market_event);

    match record_type {
        Some(RecordType::PriceChange) => match value.get("price_changes") {
            Some(Value::Array(changes)) => flatten_price_changes(&value, changes, out),
            _ => out.push(FeedEvent {
                record_type: RecordType::PriceChange.to_string(),
                payload: value,
            }),
        },
        Some(record_type) => out.push(FeedEvent {
            record_type: record_type.to_string(),
            payload: value,
        }),
        None => out.push(FeedEvent {
            record_type: RecordType::Unclassified.to_string(),
            payload: value,
        }),
    }
}

/// A batched `price_change` frame becomes one event per change, each inheriting the frame's
/// market, timestamp and discriminator.
fn flatten_price_changes(frame: &Value, changes: &[Value], out: &mut Vec<FeedEvent>) {
    let inherited = ["market", "timestamp", "event_type"]
        .iter()
        .filter_map(|key| frame.get(*key).map(|v| (key.to_string(), v.clone())))
        .collect::<Vec<_>>();

    for change in changes {
        match change {
            Value::Object(fields) => {
                let mut fields = fields.clone();
                for (key, value) in &inherited {
                    fields.entry(key.clone()).or_insert_with(|| value.clone());
                }

                out.push(FeedEvent {
                    record_type: RecordType::PriceChange.to_string(),
                    payload: Value::Object(fields),
                });
            }
            other => {
                let mut wrapped = Map::new();
                wrapped.insert("price_change".to_string(), other.clone());
                for (key, value) in &inherited {
                    wrapped.insert(key.clone(), value.clone());
                }

                out.push(FeedEvent {
                    record_type: RecordType::Unclassified.to_string(),
                    payload: Value::Object(wrapped),
                });
            }
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
