use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Timelike, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::record::Source;

/// Suffix of a raw segment that a writer still holds open.
pub const OPEN_SEGMENT_SUFFIX: &str = ".open";

/// Suffix of a raw segment.
pub const SEGMENT_SUFFIX: &str = ".jsonl";

/// Time bucket of raw records: `(source, date, hour)`.
///
/// On disk a partition is the directory `{source}/date=YYYY-MM-DD/hour=HH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    pub source: Source,
    pub date: NaiveDate,
    pub hour: u32,
}

impl Partition {
    pub fn new(source: Source, date: NaiveDate, hour: u32) -> Self {
        Self { source, date, hour }
    }

    /// Partition a record received at `timestamp` belongs to.
    pub fn for_timestamp(source: Source, timestamp: &DateTime<Utc>) -> Self {
        Self {
            source,
            date: timestamp.date_naive(),
            hour: timestamp.hour(),
        }
    }

    /// `date=YYYY-MM-DD/hour=HH`, relative to the source directory.
    pub fn relative_dir(&self) -> PathBuf {
        PathBuf::from(format!("date={}", self.date.format("%Y-%m-%d")))
            .join(format!("hour={:02}", self.hour))
    }

    /// Directory of this partition under `root`.
    pub fn dir(&self, root: &Path) -> PathBuf {
        root.join(self.source.as_ref()).join(self.relative_dir())
    }

    pub fn hour_start(&self) -> DateTime<Utc> {
        let naive = self
            .date
            .and_hms_opt(self.hour, 0, 0)
            .unwrap_or_else(|| self.date.and_time(chrono::NaiveTime::MIN));
        Utc.from_utc_datetime(&naive)
    }

    pub fn hour_end(&self) -> DateTime<Utc> {
        self.hour_start() + Duration::hours(1)
    }

    /// Parse the `date=` and `hour=` directory names.
    pub fn from_dir_names(source: Source, date_dir: &str, hour_dir: &str) -> Option<Self> {
        let date = date_dir.strip_prefix("date=")?;
        let hour = hour_dir.strip_prefix("hour=")?;

        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
        let hour = hour.parse::<u32>().ok()?;

        if hour > 23 {
            return None;
        }

        Some(Self::new(source, date, hour))
    }

    /// List the segment files of this partition under `root`, in write order.
    ///
    /// Segment names start with the writer session start time followed by a counter, so
    /// sorting by the name without the `.open` suffix gives the order they were created in.
    pub fn segment_paths(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let dir = self.dir(root);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if is_segment_path(&path) {
                paths.push(path);
            }
        }

        paths.sort_by_key(|p| segment_sort_key(p));

        Ok(paths)
    }

    /// Whether the partition is safe to convert at `now`.
    ///
    /// The hour must have ended at least `grace` ago, and no live `.open` segment may have
    /// been touched within `grace`. Older `.open` segments are leftovers of a crashed writer.
    pub fn is_closed(&self, root: &Path, now: DateTime<Utc>, grace: Duration) -> Result<bool> {
        if self.hour_end() + grace > now {
            return Ok(false);
        }

        for path in self.segment_paths(root)? {
            if !is_open_segment(&path) {
                continue;
            }

            let modified: DateTime<Utc> = std::fs::metadata(&path)?
                .modified()
                .unwrap_or(SystemTime::UNIX_EPOCH)
                .into();

            if modified + grace > now {
                return Ok(false);
            }

            warn!(
                "partition {} has a stale open segment, treat it as closed, path: {}",
                self,
                path.display()
            );
        }

        Ok(true)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/date={}/hour={:02}",
            self.source,
            self.date.format("%Y-%m-%d"),
            self.hour
        )
    }
}

pub fn is_open_segment(path: &Path) -> bool {
    path.to_string_lossy().ends_with(OPEN_SEGMENT_SUFFIX)
}

pub fn is_segment_path(path: &Path) -> bool {
    let name = path.to_string_lossy();
    name.ends_with(SEGMENT_SUFFIX)
        || name.ends_with(&format!("{}{}", SEGMENT_SUFFIX, OPEN_SEGMENT_SUFFIX))
}

fn segment_sort_key(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    name.strip_suffix(OPEN_SEGMENT_SUFFIX)
        .map(|s| s.to_string())
        .unwrap_or(name)
}

/// All partitions of `source` found under `root`, oldest first.
pub fn list_partitions(root: &Path, source: Source) -> Result<Vec<Partition>> {
    let source_dir = root.join(source.as_ref());
    if !source_dir.exists() {
        return Ok(Vec::new());
    }

    let mut partitions = Vec::new();

    for date_entry in std::fs::read_dir(&source_dir)? {
        let date_entry = date_entry?;
        if !date_entry.file_type()?.is_dir() {
            continue;
        }
        let date_name = date_entry.file_name().to_string_lossy().to_string();

        for hour_entry in std::fs::read_dir(date_entry.path())? {
            let hour_entry = hour_entry?;
            if !hour_entry.file_type()?.is_dir() {
                continue;
            }
            let hour_name = hour_entry.file_name().to_string_lossy().to_string();

            match Partition::from_dir_names(source, &date_name, &hour_name) {
                Some(partition) => partitions.push(partition),
                None => warn!(
                    "skip unexpected directory in raw tree: {}",
                    hour_entry.path().display()
                ),
            }
        }
    }

    partitions.sort();

    Ok(partitions)
}
