use anyhow::Result;
use chrono::Utc;
use log::{error, info, warn};
use std::time::Duration;
use strum::Display;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use feedsink_core::backoff::Backoff;
use feedsink_core::config::MarketFeedConfig;
use feedsink_core::error::FeedError;
use feedsink_core::error_bail;
use feedsink_core::record::Source;

use crate::market_feed::{decode_frame, subscribe_message, FeedConnection, FeedConnector, PING, PONG};
use crate::partition_writer::WriterHandle;
use crate::tool::sleep_until_deadline;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Receiving,
    Reconnecting,
    Closed,
}

/// Counters of one stream ingestion run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestStats {
    /// Data frames received.
    pub received: u64,

    /// Events handed to the partition writer.
    pub recorded: u64,

    /// Recorded events with no typed schema.
    pub unclassified: u64,

    /// Frames that were not JSON.
    pub malformed: u64,

    pub reconnects: u64,
}

/// How a connection ended.
enum SessionEnd {
    /// Deadline or cancellation, the run is over.
    Stopped,

    /// Lost the connection, reconnect.
    Disconnected,
}

/// Keeps a connection to the market feed and records every event it receives.
///
/// Reconnects with backoff until the deadline or cancellation, re-subscribing to the same
/// topics on every new connection. Events go to the partition writer in arrival order, the
/// ingestor waits when the writer queue is full.
pub struct StreamIngestor<C: FeedConnector> {
    connector: C,
    topics: Vec<String>,
    writer: WriterHandle,
    idle_timeout: Duration,
    backoff: Backoff,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    stats: IngestStats,
}

impl<C: FeedConnector> StreamIngestor<C> {
    pub fn new(
        connector: C,
        topics: Vec<String>,
        writer: WriterHandle,
        config: &MarketFeedConfig,
    ) -> Self {
        Self {
            connector,
            topics,
            writer,
            idle_timeout: config.idle_timeout(),
            backoff: Backoff::from_millis(config.backoff_initial_ms, config.backoff_max_ms),
            state: ConnectionState::Connecting,
            state_tx: watch::channel(ConnectionState::Connecting).0,
            stats: IngestStats::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Observe connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            info!("market feed state: {} -> {}", self.state, state);
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }

    /// Run until `deadline` (if any) or cancellation. The writer is flushed before returning.
    pub async fn run(
        mut self,
        deadline: Option<Instant>,
        ct: CancellationToken,
    ) -> Result<IngestStats> {
        if self.topics.is_empty() {
            error_bail!("no market topics to subscribe to");
        }

        let result = self.run_loop(deadline, &ct).await;

        self.set_state(ConnectionState::Closed);
        let flushed = self.writer.flush().await;

        info!("market feed ingestion done, stats: {:?}", self.stats);

        result?;
        flushed?;

        Ok(self.stats)
    }

    async fn run_loop(&mut self, deadline: Option<Instant>, ct: &CancellationToken) -> Result<()> {
        loop {
            if ct.is_cancelled() || deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(());
            }

            self.set_state(ConnectionState::Connecting);

            let connected = tokio::select! {
                res = self.connector.connect() => res,
                _ = ct.cancelled() => return Ok(()),
                _ = sleep_until_deadline(deadline) => return Ok(()),
            };

            match connected {
                Ok(mut conn) => {
                    self.set_state(ConnectionState::Connected);

                    match conn.send(subscribe_message(&self.topics)).await {
                        Ok(()) => {
                            info!("subscribed to {} market topics", self.topics.len());
                            self.backoff.reset();
                            self.set_state(ConnectionState::Receiving);

                            if let SessionEnd::Stopped =
                                self.receive(conn.as_mut(), deadline, ct).await?
                            {
                                return Ok(());
                            }
                        }
                        Err(e) => warn!("send subscription failed, error: {}", e),
                    }
                }
                Err(FeedError::Auth(msg)) => {
                    error_bail!("market feed rejected the connection: {}", msg);
                }
                Err(e) => warn!("connect to market feed failed, error: {}", e),
            }

            self.set_state(ConnectionState::Reconnecting);
            self.stats.reconnects += 1;

            let delay = self.backoff.next_delay();
            info!(
                "reconnect to market feed in {:?}, attempt: {}",
                delay,
                self.backoff.attempt()
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {},
                _ = ct.cancelled() => return Ok(()),
                _ = sleep_until_deadline(deadline) => return Ok(()),
            }
        }
    }

    async fn receive(
        &mut self,
        conn: &mut dyn FeedConnection,
        deadline: Option<Instant>,
        ct: &CancellationToken,
    ) -> Result<SessionEnd> {
        let mut awaiting_pong = false;

        loop {
            let frame = tokio::select! {
                res = tokio::time::timeout(self.idle_timeout, conn.recv()) => res,
                _ = ct.cancelled() => return Ok(SessionEnd::Stopped),
                _ = sleep_until_deadline(deadline) => return Ok(SessionEnd::Stopped),
            };

            let text = match frame {
                Err(_) if awaiting_pong => {
                    warn!("market feed silent after keepalive, reconnect");
                    return Ok(SessionEnd::Disconnected);
                }
                Err(_) => {
                    if let Err(e) = conn.send(PING.to_string()).await {
                        warn!("send keepalive failed, error: {}", e);
                        return Ok(SessionEnd::Disconnected);
                    }
                    awaiting_pong = true;
                    continue;
                }
                Ok(Ok(Some(text))) => text,
                Ok(Ok(None)) => {
                    info!("market feed connection closed");
                    return Ok(SessionEnd::Disconnected);
                }
                Ok(Err(e)) => {
                    warn!("market feed receive failed, error: {}", e);
                    return Ok(SessionEnd::Disconnected);
                }
            };

            awaiting_pong = false;

            match text.trim() {
                PING => {
                    if let Err(e) = conn.send(PONG.to_string()).await {
                        warn!("answer keepalive failed, error: {}", e);
                        return Ok(SessionEnd::Disconnected);
                    }
                    continue;
                }
                PONG | "" => continue,
                _ => {}
            }

            self.stats.received += 1;
            self.record_frame(&text).await?;
        }
    }

    async fn record_frame(&mut self, text: &str) -> Result<()> {
        let events = match decode_frame(text) {
            Ok(events) => events,
            Err(e) => {
                self.stats.malformed += 1;
                warn!("skip malformed market frame, error: {}", e);
                return Ok(());
            }
        };

        let received_at = Utc::now();

        for event in events {
            let unclassified = event.is_unclassified();

            if let Err(e) = self
                .writer
                .append(Source::MarketFeed, &event.record_type, received_at, event.payload)
                .await
            {
                error!("record market event failed, error: {}", e);
                return Err(e);
            }

            self.stats.recorded += 1;
            if unclassified {
                self.stats.unclassified += 1;
            }
        }

        Ok(())
    }
}
