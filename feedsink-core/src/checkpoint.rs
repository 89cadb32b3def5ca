//! Durable stage markers.
//!
//! A checkpoint file only ever appears complete: it is written with `write_atomic`. A file
//! that exists but can not be decoded is treated as corruption and is fatal for the stage
//! that reads it, no stage guesses what a damaged marker meant.
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::partition::Partition;
use crate::record::{RecordType, Source};
use crate::tool::write_atomic;

const SUCCESS_FILE: &str = "_SUCCESS.json";

/// One columnar batch: all canonical records of one `(source, type)` pair of a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDescriptor {
    pub partition: Partition,
    pub record_type: RecordType,

    /// Location of the batch file.
    pub path: PathBuf,

    /// Number of rows written.
    pub rows: u64,

    /// CRC32 of the batch file content.
    pub fingerprint: u32,
}

impl BatchDescriptor {
    pub fn source(&self) -> Source {
        self.partition.source
    }

    /// Stable identifier, `{source}/{type}/date=…/hour=…`.
    pub fn batch_id(&self) -> String {
        format!(
            "{}/{}/{}",
            self.partition.source,
            self.record_type,
            self.partition.relative_dir().display()
        )
    }
}

/// Marks a partition as converted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionCheckpoint {
    pub partition: Partition,
    pub batches: Vec<BatchDescriptor>,
    pub records: u64,
    pub normalization_errors: u64,
    pub corrupt_entries: u64,
    pub completed_at: DateTime<Utc>,
}

/// Marks a batch as fully upserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadCheckpoint {
    pub batch_id: String,
    pub fingerprint: u32,

    /// Store the batch was upserted into.
    #[serde(default)]
    pub store: String,

    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub completed_at: DateTime<Utc>,
}

/// Newest item of a polled account that is durably in the raw layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorCheckpoint {
    pub account: String,
    pub last_id: String,
    pub updated_at: DateTime<Utc>,
}

/// Layout of all checkpoints under one root directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn conversion_path(&self, partition: &Partition) -> PathBuf {
        partition.dir(&self.root.join("conversion")).join(SUCCESS_FILE)
    }

    pub fn load_path(&self, batch: &BatchDescriptor) -> PathBuf {
        self.root
            .join("load")
            .join(batch.partition.source.as_ref())
            .join(batch.record_type.as_ref())
            .join(batch.partition.relative_dir())
            .join(SUCCESS_FILE)
    }

    pub fn cursor_path(&self, source: Source, account: &str) -> PathBuf {
        let name = account
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect::<String>();

        self.root
            .join("cursor")
            .join(source.as_ref())
            .join(format!("{}.json", name))
    }

    pub fn read_conversion(&self, partition: &Partition) -> Result<Option<ConversionCheckpoint>> {
        read_json(&self.conversion_path(partition))
    }

    pub fn write_conversion(&self, checkpoint: &ConversionCheckpoint) -> Result<()> {
        write_json(&self.conversion_path(&checkpoint.partition), checkpoint)
    }

    pub fn read_load(&self, batch: &BatchDescriptor) -> Result<Option<LoadCheckpoint>> {
        read_json(&self.load_path(batch))
    }

    pub fn write_load(&self, batch: &BatchDescriptor, checkpoint: &LoadCheckpoint) -> Result<()> {
        write_json(&self.load_path(batch), checkpoint)
    }

    pub fn read_cursor(&self, source: Source, account: &str) -> Result<Option<CursorCheckpoint>> {
        read_json(&self.cursor_path(source, account))
    }

    pub fn write_cursor(&self, source: Source, checkpoint: &CursorCheckpoint) -> Result<()> {
        write_json(&self.cursor_path(source, &checkpoint.account), checkpoint)
    }

    /// Every conversion checkpoint found, oldest partition first.
    pub fn conversion_checkpoints(&self) -> Result<Vec<ConversionCheckpoint>> {
        let mut found = Vec::new();
        collect_success_files(&self.root.join("conversion"), &mut found)?;

        let mut checkpoints = Vec::with_capacity(found.len());
        for path in found {
            if let Some(cp) = read_json::<ConversionCheckpoint>(&path)? {
                checkpoints.push(cp);
            }
        }

        checkpoints.sort_by_key(|cp| cp.partition);

        Ok(checkpoints)
    }
}

fn collect_success_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_success_files(&path, out)?;
        } else if entry.file_name() == SUCCESS_FILE {
            out.push(path);
        }
    }

    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    serde_json::from_slice::<T>(&bytes)
        .map(Some)
        .map_err(|e| anyhow!("corrupt checkpoint, path: {}, error: {}", path.display(), e))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}
