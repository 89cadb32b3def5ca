//! Columnar batches to the query store.
//!
//! Each canonical record is upserted under its natural key into the collection of its type.
//! A load checkpoint is written only once every record of a batch went through.

pub mod loader;
pub mod mysql_store;
pub mod store;
