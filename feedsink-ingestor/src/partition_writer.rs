use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use likely_stable::unlikely;
use log::{error, info};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use feedsink_core::config::WriterConfig;
use feedsink_core::error_bail;
use feedsink_core::partition::{Partition, OPEN_SEGMENT_SUFFIX, SEGMENT_SUFFIX};
use feedsink_core::record::{RawRecord, Source};
use feedsink_core::tool::sync_dir;

/// Request sent from a `WriterHandle` to the writer task.
pub enum WriteRequest {
    Append {
        record_type: String,
        received_at: DateTime<Utc>,
        payload: Value,
    },

    /// Durability barrier. The reply is sent once everything appended before it is synced.
    Flush(oneshot::Sender<Result<()>>),
}

/// Counters of one writer session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriterStats {
    pub records: u64,
    pub segments: u64,
    pub bytes: u64,
    pub syncs: u64,
}

/// `PartitionWriter` appends raw records of one source to hourly partitions.
///
/// All writes of a source go through one writer task, producers only hold `WriterHandle`s and
/// submit requests over a bounded channel. A full channel blocks the producer, nothing is
/// dropped.
///
/// Every session writes fresh segment files, a segment is never reopened. A crash can
/// therefore only tear the last line of a segment, and nothing is ever written after it.
pub struct PartitionWriter {
    handle: WriterHandle,
    worker: JoinHandle<Result<WriterStats>>,
}

impl PartitionWriter {
    /// Start the writer task of `source`, writing under `root`.
    pub fn start(root: &Path, source: Source, config: &WriterConfig) -> Result<Self> {
        let capacity = config.queue_capacity.max(1);
        let (sender, receiver) = async_channel::bounded::<WriteRequest>(capacity);

        std::fs::create_dir_all(root.join(source.as_ref()))?;

        let worker = PartitionWriterWorker::new(root, source, config, receiver)?;

        info!(
            "start partition writer, source: {}, root: {}, session: {}",
            source,
            root.display(),
            worker.session
        );

        let worker = tokio::spawn(worker.run());

        Ok(Self {
            handle: WriterHandle { source, sender },
            worker,
        })
    }

    pub fn handle(&self) -> WriterHandle {
        self.handle.clone()
    }

    /// Drain every queued request, seal the open segments and wait for the writer task.
    pub async fn close(self) -> Result<WriterStats> {
        self.handle.sender.close();

        self.worker
            .await
            .map_err(|e| anyhow!("partition writer task failed, error: {}", e))?
    }
}

/// Cloneable producer side of a `PartitionWriter`.
#[derive(Clone)]
pub struct WriterHandle {
    source: Source,
    sender: async_channel::Sender<WriteRequest>,
}

impl WriterHandle {
    pub fn source(&self) -> Source {
        self.source
    }

    /// Queue one record. Waits while the queue is full.
    pub async fn append(
        &self,
        source: Source,
        record_type: &str,
        received_at: DateTime<Utc>,
        payload: Value,
    ) -> Result<()> {
        if unlikely(source != self.source) {
            error_bail!(
                "record of source {} sent to the writer of {}",
                source,
                self.source
            );
        }

        self.sender
            .send(WriteRequest::Append {
                record_type: record_type.to_string(),
                received_at,
                payload,
            })
            .await
            .map_err(|_| anyhow!("partition writer of {} is closed", self.source))
    }

    /// Returns once everything appended so far is synced to disk.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(WriteRequest::Flush(tx))
            .await
            .map_err(|_| anyhow!("partition writer of {} is closed", self.source))?;

        rx.await
            .map_err(|_| anyhow!("partition writer of {} stopped before flush", self.source))?
    }
}

/// Segment currently open for one partition.
struct OpenSegment {
    partition: Partition,
    open_path: PathBuf,
    final_path: PathBuf,
    writer: BufWriter<File>,
    bytes: u64,
}

impl OpenSegment {
    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Sync, then drop the `.open` suffix.
    fn seal(mut self) -> Result<()> {
        self.sync()?;
        drop(self.writer);

        std::fs::rename(&self.open_path, &self.final_path)?;
        sync_dir(self.final_path.parent());

        info!(
            "seal segment, partition: {}, path: {}, bytes: {}",
            self.partition,
            self.final_path.display(),
            self.bytes
        );

        Ok(())
    }
}

pub struct PartitionWriterWorker {
    root: PathBuf,
    source: Source,

    /// `{session start}-{hostname}-{pid}`, prefix of every segment name of this session.
    session: String,

    /// Counter of segments created in this session.
    segment_index: u32,

    /// Sequence number of the next record.
    next_seq: u64,

    current: Option<OpenSegment>,

    /// Records appended since the last sync.
    unsynced: usize,
    last_sync: coarsetime::Instant,

    flush_every_records: usize,
    flush_interval: std::time::Duration,
    max_segment_bytes: u64,

    receiver: async_channel::Receiver<WriteRequest>,
    stats: WriterStats,
}

impl PartitionWriterWorker {
    fn new(
        root: &Path,
        source: Source,
        config: &WriterConfig,
        receiver: async_channel::Receiver<WriteRequest>,
    ) -> Result<Self> {
        let hostname = gethostname::gethostname()
            .into_string()
            .map_err(|_| anyhow!("Failed to get hostname"))?;

        let hostname = hostname
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect::<String>();

        let session = format!(
            "{}-{}-{}",
            Utc::now().format("%Y%m%dT%H%M%S%3f"),
            hostname,
            std::process::id()
        );

        Ok(Self {
            root: root.to_path_buf(),
            source,
            session,
            segment_index: 0,
            next_seq: 0,
            current: None,
            unsynced: 0,
            last_sync: coarsetime::Instant::now(),
            flush_every_records: config.flush_every_records.max(1),
            flush_interval: config.flush_interval(),
            max_segment_bytes: config.max_segment_bytes.max(1),
            receiver,
            stats: WriterStats::default(),
        })
    }

    pub async fn run(mut self) -> Result<WriterStats> {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                req = self.receiver.recv() => {
                    match req {
                        Ok(WriteRequest::Append { record_type, received_at, payload }) => {
                            if let Err(e) = self.append(&record_type, received_at, payload) {
                                error!("append to partition failed, source: {}, error: {}", self.source, e);
                                self.receiver.close();
                                return Err(e);
                            }
                        }
                        Ok(WriteRequest::Flush(reply)) => {
                            if let Err(e) = self.sync() {
                                error!("sync partition writer failed, source: {}, error: {}", self.source, e);
                                let _ = reply.send(Err(anyhow!("sync failed: {}", e)));
                                self.receiver.close();
                                return Err(e);
                            }
                            let _ = reply.send(Ok(()));
                        }
                        Err(_) => {
                            info!("partition writer channel closed, source: {}", self.source);
                            break;
                        }
                    }
                },
                _ = ticker.tick() => {
                    if self.unsynced > 0 {
                        self.sync()?;
                    }
                }
            }
        }

        if let Some(segment) = self.current.take() {
            segment.seal()?;
            self.stats.syncs += 1;
        }

        info!(
            "partition writer done, source: {}, records: {}, segments: {}, bytes: {}",
            self.source, self.stats.records, self.stats.segments, self.stats.bytes
        );

        Ok(self.stats)
    }

    fn append(
        &mut self,
        record_type: &str,
        received_at: DateTime<Utc>,
        payload: Value,
    ) -> Result<()> {
        let record = RawRecord::new(self.source, record_type, received_at, self.next_seq, payload);

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let partition = Partition::for_timestamp(self.source, &received_at);
        self.rotate_if_needed(&partition, line.len() as u64)?;

        let segment = match self.current.as_mut() {
            Some(segment) => segment,
            None => {
                error_bail!("no open segment for partition {}", partition);
            }
        };

        segment.writer.write_all(&line)?;
        segment.bytes += line.len() as u64;

        self.next_seq += 1;
        self.unsynced += 1;
        self.stats.records += 1;
        self.stats.bytes += line.len() as u64;

        if self.unsynced >= self.flush_every_records
            || self.last_sync.elapsed().as_millis() >= self.flush_interval.as_millis() as u64
        {
            self.sync()?;
        }

        Ok(())
    }

    fn rotate_if_needed(&mut self, partition: &Partition, next_len: u64) -> Result<()> {
        let rotate = match &self.current {
            Some(segment) => {
                segment.partition != *partition
                    || (segment.bytes > 0 && segment.bytes + next_len > self.max_segment_bytes)
            }
            None => true,
        };

        if !rotate {
            return Ok(());
        }

        if let Some(segment) = self.current.take() {
            segment.seal()?;
            self.stats.syncs += 1;
            self.unsynced = 0;
            self.last_sync = coarsetime::Instant::now();
        }

        self.current = Some(self.open_segment(partition)?);

        Ok(())
    }

    fn open_segment(&mut self, partition: &Partition) -> Result<OpenSegment> {
        let dir = partition.dir(&self.root);
        std::fs::create_dir_all(&dir)?;

        let name = format!("{}-{:05}{}", self.session, self.segment_index, SEGMENT_SUFFIX);
        self.segment_index += 1;

        let final_path = dir.join(&name);
        let open_path = dir.join(format!("{}{}", name, OPEN_SEGMENT_SUFFIX));

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&open_path)?;
        sync_dir(Some(&dir));

        self.stats.segments += 1;

        info!(
            "open segment, partition: {}, path: {}",
            partition,
            open_path.display()
        );

        Ok(OpenSegment {
            partition: *partition,
            open_path,
            final_path,
            writer: BufWriter::new(file),
            bytes: 0,
        })
    }

    fn sync(&mut self) -> Result<()> {
        if let Some(segment) = self.current.as_mut() {
            segment.sync()?;
            self.stats.syncs += 1;
        }

        self.unsynced = 0;
        self.last_sync = coarsetime::Instant::now();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedsink_core::segment_reader::{SegmentEntry, SegmentReader};
    use futures::FutureExt;
    use serde_json::json;
    use std::time::Duration;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse::<DateTime<Utc>>().unwrap()
    }

    #[tokio::test]
    async fn test_append_rotates_on_hour_boundary() -> Result<()> {
        let root = tempfile::tempdir()?;
        let writer = PartitionWriter::start(root.path(), Source::MarketFeed, &WriterConfig::default())?;
        let handle = writer.handle();

        handle
            .append(Source::MarketFeed, "trade", ts("2024-01-01T10:59:59Z"), json!({"n": 0}))
            .await?;
        handle
            .append(Source::MarketFeed, "trade", ts("2024-01-01T11:00:00Z"), json!({"n": 1}))
            .await?;

        let stats = writer.close().await?;
        assert_eq!(stats.records, 2);
        assert_eq!(stats.segments, 2);

        let p10 = Partition::for_timestamp(Source::MarketFeed, &ts("2024-01-01T10:00:00Z"));
        let p11 = Partition::for_timestamp(Source::MarketFeed, &ts("2024-01-01T11:00:00Z"));

        for (p, seq) in [(p10, 0), (p11, 1)] {
            let paths = p.segment_paths(root.path())?;
            assert_eq!(paths.len(), 1);
            assert!(!paths[0].to_string_lossy().ends_with(OPEN_SEGMENT_SUFFIX));

            let entries = SegmentReader::new(&paths)?.collect::<Result<Vec<_>>>()?;
            assert!(matches!(&entries[..], [SegmentEntry::Record(r)] if r.seq == seq));
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_rotate_on_size() -> Result<()> {
        let root = tempfile::tempdir()?;
        let config = WriterConfig {
            max_segment_bytes: 200,
            ..WriterConfig::default()
        };

        let writer = PartitionWriter::start(root.path(), Source::MarketFeed, &config)?;
        let handle = writer.handle();

        let at = ts("2024-01-01T10:15:00Z");
        for i in 0..6 {
            handle
                .append(Source::MarketFeed, "trade", at, json!({"n": i, "pad": "xxxxxxxxxxxxxxxxxxxx"}))
                .await?;
        }

        let stats = writer.close().await?;
        assert!(stats.segments > 1);

        let p = Partition::for_timestamp(Source::MarketFeed, &at);
        let seqs = SegmentReader::for_partition(root.path(), &p)?
            .map(|entry| match entry {
                Ok(SegmentEntry::Record(r)) => r.seq,
                _ => panic!("unexpected entry"),
            })
            .collect::<Vec<_>>();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4, 5]);

        Ok(())
    }

    #[tokio::test]
    async fn test_flush_makes_records_readable() -> Result<()> {
        let root = tempfile::tempdir()?;
        let writer = PartitionWriter::start(root.path(), Source::SocialFeed, &WriterConfig::default())?;
        let handle = writer.handle();

        let at = ts("2024-01-01T10:15:00Z");
        handle
            .append(Source::SocialFeed, "social_post", at, json!({"id": "1"}))
            .await?;
        handle.flush().await?;

        // Still open, but the synced entry is complete.
        let p = Partition::for_timestamp(Source::SocialFeed, &at);
        let paths = p.segment_paths(root.path())?;
        assert!(paths[0].to_string_lossy().ends_with(OPEN_SEGMENT_SUFFIX));
        assert_eq!(SegmentReader::new(&paths)?.count(), 1);

        writer.close().await?;

        Ok(())
    }

    #[tokio::test]
    async fn test_full_queue_blocks_producers() -> Result<()> {
        let root = tempfile::tempdir()?;
        let config = WriterConfig {
            queue_capacity: 1,
            ..WriterConfig::default()
        };

        let writer = PartitionWriter::start(root.path(), Source::MarketFeed, &config)?;
        let handle = writer.handle();
        let at = ts("2024-01-01T10:15:00Z");

        // The writer task has not run yet, so the first record fills the queue.
        handle
            .append(Source::MarketFeed, "trade", at, json!({"n": 0}))
            .await?;
        assert!(handle
            .append(Source::MarketFeed, "trade", at, json!({"n": -1}))
            .now_or_never()
            .is_none());

        let mut producers = Vec::new();
        for p in 0..4 {
            let handle = writer.handle();
            producers.push(tokio::spawn(async move {
                for i in 0..125 {
                    handle
                        .append(Source::MarketFeed, "trade", at, json!({"n": 1 + p * 125 + i}))
                        .await?;
                }
                Ok::<(), anyhow::Error>(())
            }));
        }

        for producer in producers {
            producer.await??;
        }

        let stats = writer.close().await?;
        assert_eq!(stats.records, 501);

        let p = Partition::for_timestamp(Source::MarketFeed, &at);
        let mut seqs = Vec::new();
        let mut payloads = Vec::new();
        for entry in SegmentReader::for_partition(root.path(), &p)? {
            match entry? {
                SegmentEntry::Record(r) => {
                    seqs.push(r.seq);
                    payloads.push(r.payload["n"].as_i64().unwrap());
                }
                SegmentEntry::Corrupt { .. } => panic!("unexpected corrupt entry"),
            }
        }

        assert_eq!(seqs, (0..501).collect::<Vec<u64>>());

        // The abandoned append was never written.
        payloads.sort();
        assert_eq!(payloads, (0..501).collect::<Vec<i64>>());

        Ok(())
    }

    #[tokio::test]
    async fn test_sync_after_record_count() -> Result<()> {
        let root = tempfile::tempdir()?;
        let config = WriterConfig {
            flush_every_records: 2,
            flush_interval_ms: 3_600_000,
            ..WriterConfig::default()
        };

        let writer = PartitionWriter::start(root.path(), Source::MarketFeed, &config)?;
        let handle = writer.handle();

        // Let the writer task take its first, immediate interval tick.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let at = ts("2024-01-01T10:15:00Z");
        for i in 0..3 {
            handle
                .append(Source::MarketFeed, "trade", at, json!({"n": i}))
                .await?;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The first two records were synced, the third is still buffered.
        let p = Partition::for_timestamp(Source::MarketFeed, &at);
        let paths = p.segment_paths(root.path())?;
        assert_eq!(paths.len(), 1);
        assert!(paths[0].to_string_lossy().ends_with(OPEN_SEGMENT_SUFFIX));
        assert_eq!(SegmentReader::new(&paths)?.count(), 2);

        writer.close().await?;
        assert_eq!(SegmentReader::for_partition(root.path(), &p)?.count(), 3);

        Ok(())
    }

    #[tokio::test]
    async fn test_wrong_source_is_rejected() -> Result<()> {
        let root = tempfile::tempdir()?;
        let writer = PartitionWriter::start(root.path(), Source::MarketFeed, &WriterConfig::default())?;

        let result = writer
            .handle()
            .append(Source::SocialFeed, "social_post", Utc::now(), json!({}))
            .await;
        assert!(result.is_err());

        assert_eq!(writer.close().await?.records, 0);

        Ok(())
    }
}
