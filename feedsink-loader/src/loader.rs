use anyhow::{anyhow, Result};
use chrono::Utc;
use log::{error, info, warn};
use serde_json::{Map, Number, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use feedsink_core::backoff::Backoff;
use feedsink_core::checkpoint::{BatchDescriptor, CheckpointStore, LoadCheckpoint};
use feedsink_core::config::PipelineConfig;
use feedsink_core::error_bail;
use feedsink_core::normalizer::CanonicalRecord;
use feedsink_core::schema::{format_timestamp, FieldValue, NATURAL_KEY_COLUMN, RECEIVED_AT_COLUMN};

use feedsink_converter::columnar::read_records;

use crate::store::{QueryStore, StoreError, UpsertOutcome};

/// Counts of one batch load.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub inserted: u64,
    pub updated: u64,

    /// Identical document already stored.
    pub skipped: u64,

    /// Records that could not be upserted.
    pub failed: u64,
}

impl LoadReport {
    pub fn add(&mut self, other: &LoadReport) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Every record was upserted, the batch is checkpointed.
    Loaded(LoadReport),

    /// Some records failed. No checkpoint, the whole batch is loaded again next run.
    Incomplete(LoadReport),

    /// The batch was already loaded with this fingerprint.
    AlreadyLoaded(LoadCheckpoint),
}

/// Counts of a multi batch load.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadAllReport {
    pub loaded: u64,
    pub incomplete: u64,
    pub skipped_batches: u64,
    pub records: LoadReport,
}

/// Upserts columnar batches into the query store.
#[derive(Clone)]
pub struct Loader {
    store: Arc<dyn QueryStore>,
    checkpoints: CheckpointStore,
    max_retries: u32,
    backoff: Backoff,
}

impl Loader {
    pub fn new(store: Arc<dyn QueryStore>, config: &PipelineConfig) -> Self {
        Self {
            store,
            checkpoints: CheckpointStore::new(&config.storage.checkpoint_root),
            max_retries: config.store.max_retries,
            backoff: Backoff::from_millis(100, 5000),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Every batch recorded by a completed conversion, oldest partition first.
    pub fn completed_batches(&self) -> Result<Vec<BatchDescriptor>> {
        Ok(self
            .checkpoints
            .conversion_checkpoints()?
            .into_iter()
            .flat_map(|cp| cp.batches)
            .collect())
    }

    /// Upsert every record of `batch` keyed by its natural key.
    ///
    /// Record failures are counted and do not stop the batch. Only a batch without failures
    /// gets a load checkpoint, and it only counts for the store it names. Upserts are idempotent, so loading an incomplete batch again
    /// is safe.
    pub fn load(&self, batch: &BatchDescriptor) -> Result<LoadOutcome> {
        let batch_id = batch.batch_id();

        let store_id = self.store.store_id();

        if let Some(cp) = self.checkpoints.read_load(batch)? {
            if cp.fingerprint == batch.fingerprint && cp.store == store_id {
                info!("batch {} already loaded, skip", batch_id);
                return Ok(LoadOutcome::AlreadyLoaded(cp));
            }

            if cp.store != store_id {
                info!(
                    "batch {} was loaded into another store, store: {} -> {}, load again",
                    batch_id, cp.store, store_id
                );
            } else {
                info!(
                    "batch {} changed since it was loaded, fingerprint: {} -> {}, load again",
                    batch_id, cp.fingerprint, batch.fingerprint
                );
            }
        }

        let bytes = std::fs::read(&batch.path)
            .map_err(|e| anyhow!("read batch failed, path: {}, error: {}", batch.path.display(), e))?;

        let fingerprint = crc32fast::hash(&bytes);
        if fingerprint != batch.fingerprint {
            error_bail!(
                "batch {} does not match its descriptor, fingerprint: {}, expected: {}",
                batch_id,
                fingerprint,
                batch.fingerprint
            );
        }

        let records = read_records(&batch.path, batch.record_type)?;
        let collection = batch.record_type.collection();

        self.with_retry(|| self.store.ensure_collection(collection))?;

        let mut report = LoadReport::default();

        for record in &records {
            let doc = document(record);

            match self.with_retry(|| self.store.upsert(collection, &record.natural_key, &doc)) {
                Ok(UpsertOutcome::Inserted) => report.inserted += 1,
                Ok(UpsertOutcome::Updated) => report.updated += 1,
                Ok(UpsertOutcome::Unchanged) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        "upsert failed, batch: {}, key: {}, error: {}",
                        batch_id, record.natural_key, e
                    );
                }
            }
        }

        if report.failed > 0 {
            warn!(
                "batch {} incomplete, not checkpointed, report: {:?}",
                batch_id, report
            );
            return Ok(LoadOutcome::Incomplete(report));
        }

        self.checkpoints.write_load(
            batch,
            &LoadCheckpoint {
                batch_id: batch_id.clone(),
                fingerprint: batch.fingerprint,
                store: store_id.to_string(),
                inserted: report.inserted,
                updated: report.updated,
                skipped: report.skipped,
                completed_at: Utc::now(),
            },
        )?;

        info!("loaded batch {}, report: {:?}", batch_id, report);

        Ok(LoadOutcome::Loaded(report))
    }

    fn with_retry<T>(&self, mut op: impl FnMut() -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut backoff = self.backoff.clone();
        let mut attempts = 0;

        loop {
            match op() {
                Err(e) if e.is_transient() && attempts < self.max_retries => {
                    attempts += 1;
                    let delay = backoff.next_delay();
                    warn!("store busy, retry in {:?}, error: {}", delay, e);
                    std::thread::sleep(delay);
                }
                res => return res,
            }
        }
    }

    /// Load `batches` one after another until done or cancelled.
    pub async fn load_all(
        &self,
        batches: Vec<BatchDescriptor>,
        ct: CancellationToken,
    ) -> Result<LoadAllReport> {
        let mut report = LoadAllReport::default();

        info!("start loading {} batches", batches.len());

        for batch in batches {
            if ct.is_cancelled() {
                warn!("loading cancelled, report so far: {:?}", report);
                break;
            }

            let loader = self.clone();
            let outcome = tokio::task::spawn_blocking(move || loader.load(&batch)).await?;

            match outcome {
                Ok(LoadOutcome::Loaded(r)) => {
                    report.loaded += 1;
                    report.records.add(&r);
                }
                Ok(LoadOutcome::Incomplete(r)) => {
                    report.incomplete += 1;
                    report.records.add(&r);
                }
                Ok(LoadOutcome::AlreadyLoaded(_)) => report.skipped_batches += 1,
                Err(e) => {
                    error!("load failed, report so far: {:?}", report);
                    return Err(e);
                }
            }
        }

        info!("loading done, report: {:?}", report);

        Ok(report)
    }
}

/// Store document of a canonical record: envelope columns plus every schema field.
pub fn document(record: &CanonicalRecord) -> Value {
    let mut doc = Map::new();

    doc.insert(
        NATURAL_KEY_COLUMN.to_string(),
        Value::String(record.natural_key.clone()),
    );
    doc.insert(
        RECEIVED_AT_COLUMN.to_string(),
        Value::String(format_timestamp(&record.received_at)),
    );

    for (field, value) in record.schema().fields.iter().zip(&record.values) {
        doc.insert(field.name.to_string(), to_json(value));
    }

    Value::Object(doc)
}

fn to_json(value: &FieldValue) -> Value {
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Text(s) => Value::String(s.clone()),
        FieldValue::Float(v) => Number::from_f64(*v).map(Value::Number).unwrap_or(Value::Null),
        FieldValue::Int(v) => Value::from(*v),
        FieldValue::Bool(v) => Value::Bool(*v),
        FieldValue::Timestamp(ts) => Value::String(format_timestamp(ts)),
        FieldValue::TextList(items) => {
            Value::Array(items.iter().map(|s| Value::String(s.clone())).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedsink_core::normalizer::normalize_record;
    use feedsink_core::record::{RawRecord, Source};
    use serde_json::json;

    #[test]
    fn test_document() {
        let raw = RawRecord::new(
            Source::MarketFeed,
            "trade",
            "2024-01-01T10:15:00Z".parse().unwrap(),
            0,
            json!({"market_id": "m1", "price": "0.55", "size": 10}),
        );
        let record = normalize_record(&raw).unwrap();

        assert_eq!(
            document(&record),
            json!({
                "natural_key": "m1|||0.55|10|2024-01-01T10:15:00.000Z",
                "received_at": "2024-01-01T10:15:00.000Z",
                "market_id": "m1",
                "asset_id": null,
                "price": 0.55,
                "size": 10.0,
                "side": null,
                "fee_rate_bps": null,
                "event_ts": null,
            })
        );
    }
}
