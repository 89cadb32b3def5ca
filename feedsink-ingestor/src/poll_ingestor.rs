use anyhow::Result;
use chrono::Utc;
use log::{info, warn};
use serde_json::Value;
use std::cmp::Ordering;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use feedsink_core::backoff::Backoff;
use feedsink_core::checkpoint::{CheckpointStore, CursorCheckpoint};
use feedsink_core::config::SocialFeedConfig;
use feedsink_core::error::FeedError;
use feedsink_core::error_bail;
use feedsink_core::record::{RecordType, Source};

use crate::partition_writer::WriterHandle;
use crate::social_client::SocialClient;
use crate::tool::sleep_until_deadline;

/// Counters of one poll ingestion run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollStats {
    pub pages: u64,

    /// Items returned by the api, before filtering on the cursor.
    pub fetched: u64,

    pub recorded: u64,

    /// Rate limited responses seen.
    pub rate_limited: u64,
}

/// Order of two item ids. Ids are decimal strings of varying length.
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Polls one account and records every item newer than its durable cursor.
///
/// Pages are requested oldest first above the cursor. After a page is recorded the writer is
/// flushed, and only then the cursor is moved, so a crash in between refetches the page and
/// never skips an item.
pub struct PollIngestor<S: SocialClient> {
    client: S,
    account: String,
    account_id: Option<String>,
    writer: WriterHandle,
    checkpoints: CheckpointStore,
    page_limit: usize,
    poll_interval: Duration,
    max_retries: u32,
    backoff: Backoff,
    stats: PollStats,
}

impl<S: SocialClient> PollIngestor<S> {
    pub fn new(
        client: S,
        writer: WriterHandle,
        checkpoints: CheckpointStore,
        config: &SocialFeedConfig,
    ) -> Self {
        Self {
            client,
            account: config.account.clone(),
            account_id: None,
            writer,
            checkpoints,
            page_limit: config.page_limit.max(1),
            poll_interval: config.poll_interval(),
            max_retries: config.max_rate_limit_retries,
            backoff: Backoff::from_millis(config.backoff_initial_ms, config.backoff_max_ms),
            stats: PollStats::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn stats(&self) -> &PollStats {
        &self.stats
    }

    /// Poll now, then every poll interval until `deadline` or cancellation.
    pub async fn run(
        mut self,
        deadline: Option<Instant>,
        ct: CancellationToken,
    ) -> Result<PollStats> {
        if self.account.is_empty() {
            error_bail!("no social account configured");
        }

        let result = self.run_loop(deadline, &ct).await;
        let flushed = self.writer.flush().await;

        info!("social feed ingestion done, stats: {:?}", self.stats);

        result?;
        flushed?;

        Ok(self.stats)
    }

    async fn run_loop(&mut self, deadline: Option<Instant>, ct: &CancellationToken) -> Result<()> {
        loop {
            self.poll_once(ct).await?;

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {},
                _ = ct.cancelled() => return Ok(()),
                _ = sleep_until_deadline(deadline) => return Ok(()),
            }
        }
    }

    /// Fetch every page above the cursor. Returns the number of items recorded.
    pub async fn poll_once(&mut self, ct: &CancellationToken) -> Result<u64> {
        let account_id = match self.account_id.clone() {
            Some(id) => id,
            None => {
                let client = &self.client;
                let account = self.account.as_str();
                let Some(id) = with_retry(
                    &mut self.stats,
                    &mut self.backoff,
                    self.max_retries,
                    ct,
                    move || client.lookup_account(account),
                )
                .await?
                else {
                    return Ok(0);
                };

                info!("resolved social account {} to id {}", self.account, id);
                self.account_id = Some(id.clone());
                id
            }
        };

        let mut cursor = self
            .checkpoints
            .read_cursor(Source::SocialFeed, &self.account)?
            .map(|cp| cp.last_id);

        let mut recorded = 0;

        while !ct.is_cancelled() {
            let client = &self.client;
            let id = account_id.as_str();
            let min_id = cursor.as_deref();
            let limit = self.page_limit;

            let Some(page) = with_retry(
                &mut self.stats,
                &mut self.backoff,
                self.max_retries,
                ct,
                move || client.fetch_page(id, min_id, limit),
            )
            .await?
            else {
                break;
            };

            let page_len = page.len();
            self.stats.pages += 1;
            self.stats.fetched += page_len as u64;

            let mut items = page
                .into_iter()
                .filter_map(|item| item_id(&item).map(|id| (id, item)))
                .filter(|(id, _)| match cursor.as_deref() {
                    Some(c) => compare_ids(id, c) == Ordering::Greater,
                    None => true,
                })
                .collect::<Vec<_>>();

            if items.is_empty() {
                break;
            }

            items.sort_by(|a, b| compare_ids(&a.0, &b.0));

            let received_at = Utc::now();
            let mut last_id = String::new();

            for (id, item) in items {
                self.writer
                    .append(
                        Source::SocialFeed,
                        RecordType::SocialPost.as_ref(),
                        received_at,
                        item,
                    )
                    .await?;

                recorded += 1;
                self.stats.recorded += 1;
                last_id = id;
            }

            // Records must be durable before the cursor moves past them.
            self.writer.flush().await?;

            self.checkpoints.write_cursor(
                Source::SocialFeed,
                &CursorCheckpoint {
                    account: self.account.clone(),
                    last_id: last_id.clone(),
                    updated_at: Utc::now(),
                },
            )?;

            info!(
                "recorded social page, account: {}, cursor: {}",
                self.account, last_id
            );

            cursor = Some(last_id);

            if page_len < self.page_limit {
                break;
            }
        }

        Ok(recorded)
    }
}

fn item_id(item: &Value) -> Option<String> {
    match item.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Run `op` until it succeeds. Rate limits and transient errors are retried up to
/// `max_retries` times each, other errors are fatal. `Ok(None)` means cancelled while waiting.
async fn with_retry<T, F, Fut>(
    stats: &mut PollStats,
    backoff: &mut Backoff,
    max_retries: u32,
    ct: &CancellationToken,
    mut op: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FeedError>>,
{
    let mut rate_limited = 0;
    let mut transient = 0;

    loop {
        let delay = match op().await {
            Ok(value) => {
                backoff.reset();
                return Ok(Some(value));
            }
            Err(FeedError::RateLimited { retry_after }) => {
                stats.rate_limited += 1;
                rate_limited += 1;

                if rate_limited > max_retries {
                    error_bail!(
                        "still rate limited after {} retries, give up this run",
                        max_retries
                    );
                }

                retry_after.unwrap_or_else(|| backoff.next_delay())
            }
            Err(FeedError::Transient(msg)) => {
                transient += 1;

                if transient > max_retries {
                    error_bail!("social api unavailable after {} retries: {}", max_retries, msg);
                }

                warn!("social api request failed, retry, error: {}", msg);
                backoff.next_delay()
            }
            Err(e) => {
                error_bail!("social api request failed: {}", e);
            }
        };

        info!("wait {:?} before the next social api request", delay);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {},
            _ = ct.cancelled() => return Ok(None),
        }
    }
}
