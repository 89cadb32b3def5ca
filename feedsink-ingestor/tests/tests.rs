use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use feedsink_core::backoff::Backoff;
use feedsink_core::checkpoint::CheckpointStore;
use feedsink_core::config::{PipelineConfig, SocialFeedConfig, WriterConfig};
use feedsink_core::error::FeedError;
use feedsink_core::partition::list_partitions;
use feedsink_core::record::{RawRecord, Source};
use feedsink_core::segment_reader::{SegmentEntry, SegmentReader};
use feedsink_core::tool::setup_log;

use feedsink_ingestor::ingest::{run_ingest, MarketInput};
use feedsink_ingestor::market_feed::{FeedConnection, FeedConnector};
use feedsink_ingestor::partition_writer::PartitionWriter;
use feedsink_ingestor::poll_ingestor::PollIngestor;
use feedsink_ingestor::social_client::SocialClient;
use feedsink_ingestor::stream_ingestor::{ConnectionState, StreamIngestor};

/// Every raw record of `source` under `root`, in partition and write order.
fn read_raw(root: &Path, source: Source) -> Result<Vec<RawRecord>> {
    let mut records = Vec::new();

    for partition in list_partitions(root, source)? {
        for entry in SegmentReader::for_partition(root, &partition)? {
            match entry? {
                SegmentEntry::Record(record) => records.push(record),
                SegmentEntry::Corrupt { path, line } => {
                    panic!("corrupt entry, path: {}, line: {}", path.display(), line)
                }
            }
        }
    }

    Ok(records)
}

struct FakeConnection {
    frames: VecDeque<String>,
    sent: Arc<Mutex<Vec<String>>>,

    /// Stay open and silent once the frames are served, instead of closing.
    stall: bool,
}

#[async_trait]
impl FeedConnection for FakeConnection {
    async fn recv(&mut self) -> Result<Option<String>, FeedError> {
        match self.frames.pop_front() {
            None if self.stall => std::future::pending().await,
            frame => Ok(frame),
        }
    }

    async fn send(&mut self, text: String) -> Result<(), FeedError> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }
}

/// Serves scripted sessions, one per connect. Once they are used up every connect fails, and
/// the optional token is cancelled.
struct FakeConnector {
    sessions: Mutex<VecDeque<Vec<String>>>,
    sent: Arc<Mutex<Vec<String>>>,
    stop_when_done: Option<CancellationToken>,
    stall: bool,
}

impl FakeConnector {
    fn new(sessions: Vec<Vec<&str>>, stop_when_done: Option<CancellationToken>) -> Self {
        Self {
            sessions: Mutex::new(
                sessions
                    .into_iter()
                    .map(|frames| frames.into_iter().map(|f| f.to_string()).collect())
                    .collect(),
            ),
            sent: Arc::new(Mutex::new(Vec::new())),
            stop_when_done,
            stall: false,
        }
    }

    fn stalling(mut self) -> Self {
        self.stall = true;
        self
    }
}

#[async_trait]
impl FeedConnector for FakeConnector {
    async fn connect(&self) -> Result<Box<dyn FeedConnection>, FeedError> {
        let session = self.sessions.lock().unwrap().pop_front();

        match session {
            Some(frames) => Ok(Box::new(FakeConnection {
                frames: frames.into(),
                sent: self.sent.clone(),
                stall: self.stall,
            })),
            None => {
                if let Some(ct) = &self.stop_when_done {
                    ct.cancel();
                }
                Err(FeedError::Transient("connection refused".to_string()))
            }
        }
    }
}

const TRADE_1: &str = r#"{"event_type":"last_trade_price","market":"m1","asset_id":"a1","price":"0.55","size":"10","timestamp":"1704104100000"}"#;
const TRADE_2: &str = r#"{"event_type":"last_trade_price","market":"m1","asset_id":"a1","price":"0.56","size":"1","timestamp":"1704104160000"}"#;
const PRICE_CHANGES: &str = r#"{"event_type":"price_change","market":"m1","timestamp":"1704104120000","price_changes":[{"asset_id":"a1","price":"0.5","size":"3","side":"BUY"},{"asset_id":"a2","price":"0.5","size":"4","side":"SELL"}]}"#;
const UNKNOWN: &str = r#"{"event_type":"orderbook_v9","levels":[]}"#;

#[tokio::test]
async fn test_stream_reconnect_loses_nothing() -> Result<()> {
    setup_log();

    let root = tempfile::tempdir()?;
    let ct = CancellationToken::new();

    let connector = FakeConnector::new(
        vec![
            vec![TRADE_1, "PING", PRICE_CHANGES],
            vec![TRADE_2, "not json", UNKNOWN],
        ],
        Some(ct.clone()),
    );
    let sent = connector.sent.clone();

    let writer = PartitionWriter::start(root.path(), Source::MarketFeed, &WriterConfig::default())?;
    let ingestor = StreamIngestor::new(
        connector,
        vec!["a1".to_string(), "a2".to_string()],
        writer.handle(),
        &PipelineConfig::default().market_feed,
    )
    .with_backoff(Backoff::from_millis(0, 0));

    let state = ingestor.subscribe_state();
    let stats = ingestor.run(None, ct).await?;
    writer.close().await?;

    assert_eq!(*state.borrow(), ConnectionState::Closed);

    assert_eq!(stats.received, 5);
    assert_eq!(stats.recorded, 5);
    assert_eq!(stats.malformed, 1);
    assert_eq!(stats.unclassified, 1);
    assert_eq!(stats.reconnects, 3);

    // Subscribed on both connections, answered the keepalive once.
    let sent = sent.lock().unwrap().clone();
    let subscriptions = sent.iter().filter(|m| m.contains("assets_ids")).count();
    assert_eq!(subscriptions, 2);
    assert_eq!(sent.iter().filter(|m| *m == "PONG").count(), 1);

    let records = read_raw(root.path(), Source::MarketFeed)?;
    let types = records
        .iter()
        .map(|r| r.record_type.as_str())
        .collect::<Vec<_>>();
    assert_eq!(
        types,
        vec!["trade", "price_change", "price_change", "trade", "unclassified"]
    );

    let seqs = records.iter().map(|r| r.seq).collect::<Vec<_>>();
    assert_eq!(seqs, vec![0, 1, 2, 3, 4]);

    assert_eq!(records[2].payload["asset_id"], json!("a2"));
    assert_eq!(records[2].payload["market"], json!("m1"));
    assert_eq!(records[4].payload, serde_json::from_str::<Value>(UNKNOWN)?);

    Ok(())
}

#[tokio::test]
async fn test_stream_keepalive_then_reconnect_when_silent() -> Result<()> {
    setup_log();

    let root = tempfile::tempdir()?;
    let ct = CancellationToken::new();

    let connector =
        FakeConnector::new(vec![vec![TRADE_1], vec![TRADE_2]], Some(ct.clone())).stalling();
    let sent = connector.sent.clone();

    let writer = PartitionWriter::start(root.path(), Source::MarketFeed, &WriterConfig::default())?;
    let ingestor = StreamIngestor::new(
        connector,
        vec!["a1".to_string()],
        writer.handle(),
        &PipelineConfig::default().market_feed,
    )
    .with_backoff(Backoff::from_millis(0, 0))
    .with_idle_timeout(Duration::from_millis(20));

    let stats = ingestor.run(None, ct).await?;
    writer.close().await?;

    assert_eq!(stats.received, 2);
    assert_eq!(stats.recorded, 2);

    // Both silent connections got one keepalive, then were dropped. The third connect fails.
    assert_eq!(stats.reconnects, 3);

    let sent = sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 4);
    assert!(sent[0].contains("assets_ids"));
    assert_eq!(sent[1], "PING");
    assert!(sent[2].contains("assets_ids"));
    assert_eq!(sent[3], "PING");

    assert_eq!(read_raw(root.path(), Source::MarketFeed)?.len(), 2);

    Ok(())
}

#[tokio::test]
async fn test_stream_without_topics_is_fatal() -> Result<()> {
    setup_log();

    let root = tempfile::tempdir()?;
    let writer = PartitionWriter::start(root.path(), Source::MarketFeed, &WriterConfig::default())?;

    let ingestor = StreamIngestor::new(
        FakeConnector::new(vec![], None),
        vec![],
        writer.handle(),
        &PipelineConfig::default().market_feed,
    );

    assert!(ingestor.run(None, CancellationToken::new()).await.is_err());
    writer.close().await?;

    Ok(())
}

/// Social api over a fixed set of posts, with scripted failures served first.
struct FakeSocial {
    posts: Vec<Value>,
    failures: Mutex<VecDeque<FeedError>>,
    calls: AtomicU64,
}

impl FakeSocial {
    fn new(num_posts: u64, failures: Vec<FeedError>) -> Self {
        Self {
            posts: (1..=num_posts)
                .map(|i| {
                    json!({
                        "id": (100 + i).to_string(),
                        "created_at": "2024-01-01T09:00:00.000Z",
                        "account": {"id": "42", "username": "someone"},
                        "content": format!("<p>post {}</p>", i),
                    })
                })
                .collect(),
            failures: Mutex::new(failures.into()),
            calls: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl SocialClient for FakeSocial {
    async fn lookup_account(&self, _account: &str) -> Result<String, FeedError> {
        Ok("42".to_string())
    }

    async fn fetch_page(
        &self,
        _account_id: &str,
        min_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Value>, FeedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(e) = self.failures.lock().unwrap().pop_front() {
            return Err(e);
        }

        let min_id = min_id.and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);

        let mut page = self
            .posts
            .iter()
            .filter(|p| p["id"].as_str().unwrap().parse::<u64>().unwrap() > min_id)
            .take(limit)
            .cloned()
            .collect::<Vec<_>>();

        // Newest first, like the real api.
        page.reverse();

        Ok(page)
    }
}

fn social_config(page_limit: usize) -> SocialFeedConfig {
    SocialFeedConfig {
        enabled: true,
        account: "someone".to_string(),
        page_limit,
        max_rate_limit_retries: 2,
        ..SocialFeedConfig::default()
    }
}

fn post_ids(records: &[RawRecord]) -> Vec<String> {
    records
        .iter()
        .map(|r| r.payload["id"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_poll_pages_and_cursor() -> Result<()> {
    setup_log();

    let raw = tempfile::tempdir()?;
    let checkpoint = tempfile::tempdir()?;
    let store = CheckpointStore::new(checkpoint.path());

    let writer = PartitionWriter::start(raw.path(), Source::SocialFeed, &WriterConfig::default())?;
    let mut ingestor = PollIngestor::new(
        FakeSocial::new(5, vec![]),
        writer.handle(),
        store.clone(),
        &social_config(2),
    );

    let ct = CancellationToken::new();
    assert_eq!(ingestor.poll_once(&ct).await?, 5);
    assert_eq!(ingestor.stats().pages, 3);

    // Nothing new on the next poll.
    assert_eq!(ingestor.poll_once(&ct).await?, 0);

    writer.close().await?;

    let cursor = store.read_cursor(Source::SocialFeed, "someone")?.unwrap();
    assert_eq!(cursor.last_id, "105");

    let records = read_raw(raw.path(), Source::SocialFeed)?;
    assert_eq!(post_ids(&records), vec!["101", "102", "103", "104", "105"]);
    assert!(records.iter().all(|r| r.record_type == "social_post"));

    Ok(())
}

#[tokio::test]
async fn test_poll_refetches_page_when_cursor_was_not_written() -> Result<()> {
    setup_log();

    let raw = tempfile::tempdir()?;
    let checkpoint = tempfile::tempdir()?;
    let store = CheckpointStore::new(checkpoint.path());

    let writer = PartitionWriter::start(raw.path(), Source::SocialFeed, &WriterConfig::default())?;
    let mut ingestor = PollIngestor::new(
        FakeSocial::new(3, vec![]),
        writer.handle(),
        store.clone(),
        &social_config(40),
    );

    let ct = CancellationToken::new();
    assert_eq!(ingestor.poll_once(&ct).await?, 3);

    // Crash between the page write and the cursor write.
    std::fs::remove_file(store.cursor_path(Source::SocialFeed, "someone"))?;

    assert_eq!(ingestor.poll_once(&ct).await?, 3);
    writer.close().await?;

    // The page is in the raw layer twice, with the same post ids, nothing is missing.
    let ids = post_ids(&read_raw(raw.path(), Source::SocialFeed)?);
    assert_eq!(ids, vec!["101", "102", "103", "101", "102", "103"]);

    Ok(())
}

#[tokio::test]
async fn test_poll_rate_limit() -> Result<()> {
    setup_log();

    let raw = tempfile::tempdir()?;
    let checkpoint = tempfile::tempdir()?;
    let store = CheckpointStore::new(checkpoint.path());
    let writer = PartitionWriter::start(raw.path(), Source::SocialFeed, &WriterConfig::default())?;
    let ct = CancellationToken::new();

    let rate_limited = || FeedError::RateLimited {
        retry_after: Some(Duration::from_millis(0)),
    };

    // Within the retry budget.
    let mut ingestor = PollIngestor::new(
        FakeSocial::new(2, vec![rate_limited(), rate_limited()]),
        writer.handle(),
        store.clone(),
        &social_config(40),
    )
    .with_backoff(Backoff::from_millis(0, 0));

    assert_eq!(ingestor.poll_once(&ct).await?, 2);
    assert_eq!(ingestor.stats().rate_limited, 2);

    // Past the ceiling the run fails and the cursor stays where it was.
    std::fs::remove_file(store.cursor_path(Source::SocialFeed, "someone"))?;

    let mut ingestor = PollIngestor::new(
        FakeSocial::new(2, vec![rate_limited(), rate_limited(), rate_limited()]),
        writer.handle(),
        store.clone(),
        &social_config(40),
    )
    .with_backoff(Backoff::from_millis(0, 0));

    assert!(ingestor.poll_once(&ct).await.is_err());
    assert_eq!(ingestor.stats().rate_limited, 3);
    assert!(store.read_cursor(Source::SocialFeed, "someone")?.is_none());

    writer.close().await?;

    Ok(())
}

#[tokio::test]
async fn test_poll_auth_failure_is_fatal() -> Result<()> {
    setup_log();

    let raw = tempfile::tempdir()?;
    let checkpoint = tempfile::tempdir()?;
    let writer = PartitionWriter::start(raw.path(), Source::SocialFeed, &WriterConfig::default())?;

    let client = FakeSocial::new(2, vec![FeedError::Auth("status 401".to_string())]);
    let ingestor = PollIngestor::new(
        client,
        writer.handle(),
        CheckpointStore::new(checkpoint.path()),
        &social_config(40),
    );

    let result = ingestor.run(None, CancellationToken::new()).await;
    assert!(result.is_err());

    let stats = writer.close().await?;
    assert_eq!(stats.records, 0);

    Ok(())
}

#[tokio::test]
async fn test_run_ingest_both_feeds() -> Result<()> {
    setup_log();

    let raw = tempfile::tempdir()?;
    let checkpoint = tempfile::tempdir()?;

    let mut config = PipelineConfig::default();
    config.storage.raw_root = raw.path().to_path_buf();
    config.storage.checkpoint_root = checkpoint.path().to_path_buf();
    config.market_feed.backoff_initial_ms = 10;
    config.market_feed.backoff_max_ms = 10;
    config.social_feed = social_config(40);
    config.social_feed.poll_interval_secs = 60;

    let market = MarketInput {
        connector: FakeConnector::new(vec![vec![TRADE_1, TRADE_2]], None),
        topics: vec!["a1".to_string()],
    };

    let report = run_ingest(
        &config,
        Some(market),
        Some(FakeSocial::new(4, vec![])),
        Some(Duration::from_millis(300)),
        CancellationToken::new(),
    )
    .await?;

    assert_eq!(report.market.as_ref().map(|s| s.recorded), Some(2));
    assert_eq!(report.social.as_ref().map(|s| s.recorded), Some(4));
    assert_eq!(report.market_writer.as_ref().map(|s| s.records), Some(2));
    assert_eq!(report.social_writer.as_ref().map(|s| s.records), Some(4));

    assert_eq!(read_raw(raw.path(), Source::MarketFeed)?.len(), 2);
    assert_eq!(read_raw(raw.path(), Source::SocialFeed)?.len(), 4);

    Ok(())
}
