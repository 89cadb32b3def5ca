//! Ingestion side of feedsink.
//!
//! Two feeds are recorded into the raw layer: a streaming market feed over a websocket, and a
//! polled social feed over HTTP. Every event becomes one `RawRecord` line in an hourly
//! partition of its source. Each source has exactly one `PartitionWriter` task, the ingestors
//! only talk to it through `WriterHandle`s.
//!
//! The raw layer is append-only. Conversion and loading happen later, on closed partitions.

pub mod ingest;
pub mod market_feed;
pub mod partition_writer;
pub mod poll_ingestor;
pub mod social_client;
pub mod stream_ingestor;
pub mod tool;
