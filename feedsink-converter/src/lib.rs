//! Raw partitions to columnar batches.
//!
//! A closed partition is read segment by segment, every record is normalized, and the
//! canonical records of each type are written as one parquet batch. The conversion
//! checkpoint is the only proof that a partition is done.

pub mod columnar;
pub mod converter;
