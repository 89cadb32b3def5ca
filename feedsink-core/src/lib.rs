pub mod backoff;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod normalizer;
pub mod partition;
pub mod record;
pub mod schema;
pub mod segment_reader;
pub mod tool;
