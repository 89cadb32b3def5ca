use anyhow::Result;
use likely_stable::unlikely;
use log::warn;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::error_bail;
use crate::partition::Partition;
use crate::record::RawRecord;

/// One entry read back from a raw segment.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentEntry {
    Record(RawRecord),

    /// An entry that could not be decoded, or a torn tail without its line terminator.
    Corrupt { path: PathBuf, line: u64 },
}

/// Reads the records of a list of segment files, in order.
///
/// Each entry is one `\n` terminated JSON line. A line without the terminator can only be the
/// last, partially written entry of a crashed writer, it is reported as `Corrupt` and never
/// joined with anything that follows.
pub struct SegmentReader {
    paths: Vec<PathBuf>,
    reader: Option<BufReader<File>>,
    pos: usize,
    line: u64,
    buf: Vec<u8>,
}

impl SegmentReader {
    pub fn new(paths: &[PathBuf]) -> Result<Self> {
        // Check if all files exist
        for path in paths {
            if !path.exists() {
                error_bail!("Segment not found: {}", path.display());
            }
        }

        Ok(Self {
            paths: paths.to_vec(),
            reader: None,
            pos: 0,
            line: 0,
            buf: Vec::with_capacity(4096),
        })
    }

    /// Reader over every segment of `partition` under `root`.
    pub fn for_partition(root: &Path, partition: &Partition) -> Result<Self> {
        Self::new(&partition.segment_paths(root)?)
    }

    fn current_path(&self) -> PathBuf {
        self.paths
            .get(self.pos.saturating_sub(1))
            .cloned()
            .unwrap_or_default()
    }

    /// Open the next file. Returns `false` when there is none left.
    fn open_next_file(&mut self) -> Result<bool> {
        if self.pos >= self.paths.len() {
            self.reader = None;
            return Ok(false);
        }

        let file = File::open(&self.paths[self.pos])?;

        self.pos += 1;
        self.line = 0;
        self.reader = Some(BufReader::new(file));

        Ok(true)
    }

    fn read_entry(&mut self) -> Result<Option<SegmentEntry>> {
        loop {
            let reader = match self.reader.as_mut() {
                Some(reader) => reader,
                None => {
                    if !self.open_next_file()? {
                        return Ok(None);
                    }
                    continue;
                }
            };

            self.buf.clear();
            let n = reader.read_until(b'\n', &mut self.buf)?;
            if n == 0 {
                self.reader = None;
                continue;
            }

            self.line += 1;

            if unlikely(self.buf.last() != Some(&b'\n')) {
                warn!(
                    "torn entry at the end of segment, path: {}, line: {}",
                    self.current_path().display(),
                    self.line
                );
                return Ok(Some(SegmentEntry::Corrupt {
                    path: self.current_path(),
                    line: self.line,
                }));
            }

            let body = &self.buf[..self.buf.len() - 1];
            if body.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }

            return match serde_json::from_slice::<RawRecord>(body) {
                Ok(record) => Ok(Some(SegmentEntry::Record(record))),
                Err(e) => {
                    warn!(
                        "undecodable entry in segment, path: {}, line: {}, error: {}",
                        self.current_path().display(),
                        self.line,
                        e
                    );
                    Ok(Some(SegmentEntry::Corrupt {
                        path: self.current_path(),
                        line: self.line,
                    }))
                }
            };
        }
    }
}

impl Iterator for SegmentReader {
    /// `Err` means the segment files themselves could not be read.
    type Item = Result<SegmentEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_entry().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Source;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::io::Write;

    fn line(seq: u64) -> String {
        let received_at = "2024-01-01T10:15:00Z".parse::<DateTime<Utc>>().unwrap();
        let record = RawRecord::new(
            Source::MarketFeed,
            "trade",
            received_at,
            seq,
            json!({ "n": seq }),
        );
        format!("{}\n", serde_json::to_string(&record).unwrap())
    }

    #[test]
    fn test_read_across_segments_in_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let a = dir.path().join("a.jsonl");
        let b = dir.path().join("b.jsonl");
        std::fs::write(&a, format!("{}{}", line(0), line(1)))?;
        std::fs::write(&b, line(2))?;

        let seqs = SegmentReader::new(&[a, b])?
            .map(|entry| match entry.unwrap() {
                SegmentEntry::Record(r) => r.seq,
                SegmentEntry::Corrupt { .. } => panic!("unexpected corrupt entry"),
            })
            .collect::<Vec<_>>();

        assert_eq!(seqs, vec![0, 1, 2]);

        Ok(())
    }

    #[test]
    fn test_torn_tail_is_skipped() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let a = dir.path().join("a.jsonl.open");
        let b = dir.path().join("b.jsonl");

        let mut f = File::create(&a)?;
        f.write_all(line(0).as_bytes())?;
        // Half of the next entry, as left by a crash.
        let torn = line(1);
        f.write_all(&torn.as_bytes()[..torn.len() / 2])?;
        drop(f);

        std::fs::write(&b, line(2))?;

        let entries = SegmentReader::new(&[a.clone(), b])?
            .collect::<Result<Vec<_>>>()?;

        assert_eq!(entries.len(), 3);
        assert!(matches!(&entries[0], SegmentEntry::Record(r) if r.seq == 0));
        assert_eq!(entries[1], SegmentEntry::Corrupt { path: a, line: 2 });
        assert!(matches!(&entries[2], SegmentEntry::Record(r) if r.seq == 2));

        Ok(())
    }

    #[test]
    fn test_missing_segment() {
        let result = SegmentReader::new(&[PathBuf::from("/nonexistent/feedsink/a.jsonl")]);
        assert!(result.is_err());
    }
}
