//! Ingestion stage: both feeds side by side, each with its own partition writer.
use anyhow::Result;
use log::{error, info};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use feedsink_core::checkpoint::CheckpointStore;
use feedsink_core::config::PipelineConfig;
use feedsink_core::record::Source;

use crate::market_feed::{discover_topics, FeedConnector, WsConnector};
use crate::partition_writer::{PartitionWriter, WriterStats};
use crate::poll_ingestor::{PollIngestor, PollStats};
use crate::social_client::{MastodonClient, SocialClient};
use crate::stream_ingestor::{IngestStats, StreamIngestor};

/// Outcome of one ingestion run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub market: Option<IngestStats>,
    pub market_writer: Option<WriterStats>,
    pub social: Option<PollStats>,
    pub social_writer: Option<WriterStats>,
}

/// Market feed input of `run_ingest`.
pub struct MarketInput<C: FeedConnector> {
    pub connector: C,
    pub topics: Vec<String>,
}

/// Ingest both feeds configured in `config` for `duration`, or until cancelled.
pub async fn ingest(
    config: &PipelineConfig,
    duration: Option<Duration>,
    ct: CancellationToken,
) -> Result<IngestReport> {
    let market = if config.market_feed.enabled {
        let http = reqwest::Client::new();
        let topics = discover_topics(&http, &config.market_feed).await?;

        Some(MarketInput {
            connector: WsConnector::new(&config.market_feed.ws_url),
            topics,
        })
    } else {
        None
    };

    let social = if config.social_feed.enabled {
        Some(MastodonClient::connect(&config.social_feed).await?)
    } else {
        None
    };

    run_ingest(config, market, social, duration, ct).await
}

/// Run the given feeds concurrently. A fatal error of one feed stops the other one too.
/// Writers are always closed, so every segment written so far is sealed.
pub async fn run_ingest<C, S>(
    config: &PipelineConfig,
    market: Option<MarketInput<C>>,
    social: Option<S>,
    duration: Option<Duration>,
    ct: CancellationToken,
) -> Result<IngestReport>
where
    C: FeedConnector,
    S: SocialClient,
{
    let deadline = duration.map(|d| Instant::now() + d);
    let ct = ct.child_token();
    let raw_root = &config.storage.raw_root;

    info!(
        "start ingestion, market: {}, social: {}, duration: {:?}",
        market.is_some(),
        social.is_some(),
        duration
    );

    let market_writer = match market {
        Some(_) => Some(PartitionWriter::start(raw_root, Source::MarketFeed, &config.writer)?),
        None => None,
    };
    let social_writer = match social {
        Some(_) => Some(PartitionWriter::start(raw_root, Source::SocialFeed, &config.writer)?),
        None => None,
    };

    let market_run = async {
        match (market, market_writer.as_ref()) {
            (Some(input), Some(writer)) => {
                let ingestor = StreamIngestor::new(
                    input.connector,
                    input.topics,
                    writer.handle(),
                    &config.market_feed,
                );
                let result = ingestor.run(deadline, ct.clone()).await;
                if let Err(e) = &result {
                    error!("market feed ingestion failed, error: {}", e);
                    ct.cancel();
                }
                Some(result)
            }
            _ => None,
        }
    };

    let social_run = async {
        match (social, social_writer.as_ref()) {
            (Some(client), Some(writer)) => {
                let ingestor = PollIngestor::new(
                    client,
                    writer.handle(),
                    CheckpointStore::new(&config.storage.checkpoint_root),
                    &config.social_feed,
                );
                let result = ingestor.run(deadline, ct.clone()).await;
                if let Err(e) = &result {
                    error!("social feed ingestion failed, error: {}", e);
                    ct.cancel();
                }
                Some(result)
            }
            _ => None,
        }
    };

    let (market_result, social_result) = tokio::join!(market_run, social_run);

    let mut report = IngestReport::default();

    if let Some(writer) = market_writer {
        report.market_writer = Some(writer.close().await?);
    }
    if let Some(writer) = social_writer {
        report.social_writer = Some(writer.close().await?);
    }

    report.market = market_result.transpose()?;
    report.social = social_result.transpose()?;

    info!("ingestion done, report: {:?}", report);

    Ok(report)
}
