use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use feedsink_core::checkpoint::{BatchDescriptor, CheckpointStore, ConversionCheckpoint};
use feedsink_core::config::PipelineConfig;
use feedsink_core::normalizer::{normalize_record, CanonicalRecord};
use feedsink_core::partition::{list_partitions, Partition};
use feedsink_core::record::{RecordType, Source};
use feedsink_core::segment_reader::{SegmentEntry, SegmentReader};
use feedsink_core::tool::write_atomic;

use crate::columnar::{encode_parquet, to_record_batch};

/// File name of a batch inside its partition directory.
pub const BATCH_FILE: &str = "part.parquet";

/// Result of converting one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvertOutcome {
    Converted(ConversionCheckpoint),

    /// A complete conversion was already recorded, nothing was written.
    AlreadyConverted(ConversionCheckpoint),
}

impl ConvertOutcome {
    pub fn checkpoint(&self) -> &ConversionCheckpoint {
        match self {
            ConvertOutcome::Converted(cp) | ConvertOutcome::AlreadyConverted(cp) => cp,
        }
    }

    pub fn batches(&self) -> &[BatchDescriptor] {
        &self.checkpoint().batches
    }
}

/// Counters of a multi partition conversion.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConvertReport {
    pub converted: u64,
    pub skipped_partitions: u64,

    /// Batches written.
    pub batches: u64,

    pub records: u64,
    pub normalization_errors: u64,
    pub corrupt_entries: u64,

    /// Partitions that failed and stay unconverted.
    pub failed: u64,
}

/// Turns closed raw partitions into one parquet batch per record type.
#[derive(Debug, Clone)]
pub struct Converter {
    raw_root: PathBuf,
    columnar_root: PathBuf,
    checkpoints: CheckpointStore,
    grace: chrono::Duration,
    workers: usize,
}

impl Converter {
    pub fn new(config: &PipelineConfig) -> Self {
        let workers = match config.converter.workers {
            0 => num_cpus::get(),
            n => n,
        };

        Self {
            raw_root: config.storage.raw_root.clone(),
            columnar_root: config.storage.columnar_root.clone(),
            checkpoints: CheckpointStore::new(&config.storage.checkpoint_root),
            grace: chrono::Duration::seconds(config.converter.close_grace_secs as i64),
            workers: workers.max(1),
        }
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// `{columnar_root}/{source}/{type}/date=…/hour=…/part.parquet`
    pub fn batch_path(&self, partition: &Partition, record_type: RecordType) -> PathBuf {
        self.columnar_root
            .join(partition.source.as_ref())
            .join(record_type.as_ref())
            .join(partition.relative_dir())
            .join(BATCH_FILE)
    }

    /// Partitions of `source` that are closed at `now`, oldest first.
    pub fn closed_partitions(&self, source: Source, now: DateTime<Utc>) -> Result<Vec<Partition>> {
        let mut closed = Vec::new();

        for partition in list_partitions(&self.raw_root, source)? {
            if partition.is_closed(&self.raw_root, now, self.grace)? {
                closed.push(partition);
            }
        }

        Ok(closed)
    }

    /// Convert one partition.
    ///
    /// Every batch is durably written before the conversion checkpoint, so a failure leaves
    /// the partition unconverted and a later run starts over. Output only depends on the raw
    /// segments, converting again overwrites with identical files.
    pub fn convert(&self, partition: &Partition) -> Result<ConvertOutcome> {
        if let Some(cp) = self.checkpoints.read_conversion(partition)? {
            info!("partition {} already converted, skip", partition);
            return Ok(ConvertOutcome::AlreadyConverted(cp));
        }

        let mut groups: BTreeMap<RecordType, Vec<CanonicalRecord>> = BTreeMap::new();
        let mut records = 0;
        let mut normalization_errors = 0;
        let mut corrupt_entries = 0;

        for entry in SegmentReader::for_partition(&self.raw_root, partition)? {
            match entry? {
                SegmentEntry::Record(raw) => match normalize_record(&raw) {
                    Ok(record) => {
                        records += 1;
                        groups.entry(record.record_type).or_default().push(record);
                    }
                    Err(e) => {
                        normalization_errors += 1;
                        warn!(
                            "skip record, partition: {}, seq: {}, error: {}",
                            partition, raw.seq, e
                        );
                    }
                },
                SegmentEntry::Corrupt { path, line } => {
                    corrupt_entries += 1;
                    warn!(
                        "skip corrupt raw entry, path: {}, line: {}",
                        path.display(),
                        line
                    );
                }
            }
        }

        let mut batches = Vec::with_capacity(groups.len());

        for (record_type, rows) in groups {
            let path = self.batch_path(partition, record_type);
            batches.push(self.write_batch(partition, record_type, &rows, path)?);
        }

        let checkpoint = ConversionCheckpoint {
            partition: *partition,
            batches,
            records,
            normalization_errors,
            corrupt_entries,
            completed_at: Utc::now(),
        };

        self.checkpoints.write_conversion(&checkpoint)?;

        info!(
            "converted partition {}, batches: {}, records: {}, normalization errors: {}, corrupt: {}",
            partition,
            checkpoint.batches.len(),
            records,
            normalization_errors,
            corrupt_entries
        );

        Ok(ConvertOutcome::Converted(checkpoint))
    }

    fn write_batch(
        &self,
        partition: &Partition,
        record_type: RecordType,
        rows: &[CanonicalRecord],
        path: PathBuf,
    ) -> Result<BatchDescriptor> {
        let batch = to_record_batch(record_type, rows)?;
        let bytes = encode_parquet(&batch)?;

        write_atomic(&path, &bytes)
            .map_err(|e| anyhow!("write batch failed, path: {}, error: {}", path.display(), e))?;

        Ok(BatchDescriptor {
            partition: *partition,
            record_type,
            path,
            rows: rows.len() as u64,
            fingerprint: crc32fast::hash(&bytes),
        })
    }

    /// Convert `partitions` with at most `workers` at a time.
    ///
    /// A failed partition is logged and counted, the others still run. Cancellation stops
    /// starting new partitions and waits for the running ones.
    pub async fn convert_all(
        &self,
        partitions: Vec<Partition>,
        ct: CancellationToken,
    ) -> Result<ConvertReport> {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        info!(
            "start converting {} partitions, workers: {}",
            partitions.len(),
            self.workers
        );

        for partition in partitions {
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => permit?,
                _ = ct.cancelled() => {
                    warn!("conversion cancelled, stop scheduling partitions");
                    break;
                }
            };

            let converter = self.clone();
            tasks.spawn_blocking(move || {
                let _permit = permit;
                (partition, converter.convert(&partition))
            });
        }

        let mut report = ConvertReport::default();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(ConvertOutcome::Converted(cp)))) => {
                    report.converted += 1;
                    report.batches += cp.batches.len() as u64;
                    report.records += cp.records;
                    report.normalization_errors += cp.normalization_errors;
                    report.corrupt_entries += cp.corrupt_entries;
                }
                Ok((_, Ok(ConvertOutcome::AlreadyConverted(_)))) => {
                    report.skipped_partitions += 1;
                }
                Ok((partition, Err(e))) => {
                    report.failed += 1;
                    error!("convert partition {} failed, error: {}", partition, e);
                }
                Err(e) => {
                    report.failed += 1;
                    error!("conversion task failed, error: {}", e);
                }
            }
        }

        info!("conversion done, report: {:?}", report);

        Ok(report)
    }

    /// Convert every closed partition of both sources.
    pub async fn convert_closed(
        &self,
        now: DateTime<Utc>,
        ct: CancellationToken,
    ) -> Result<ConvertReport> {
        let mut partitions = Vec::new();

        for source in [Source::MarketFeed, Source::SocialFeed] {
            partitions.extend(self.closed_partitions(source, now)?);
        }

        self.convert_all(partitions, ct).await
    }

    pub fn columnar_root(&self) -> &Path {
        &self.columnar_root
    }
}
