//! rangerdb - read-optimized immutable learned index for u64 keys.
//!
//! Maps 64-bit integer keys to one or more 64-bit (or 32-bit) values with
//! a three-stage batched lookup pipeline: a trained recursive model
//! predicts the key's position in the sorted range array, a bounded
//! search corrects the prediction, and a SIMD probe over a cache-line
//! packed bucket returns the value list. Built for high-throughput point
//! lookups over sparse sorted subsets of the key space, e.g. k-mer to
//! position lists.
//!
//! Databases are write-once, read-many: a [`db_builder::DbBuilder`]
//! streams sorted records and serializes the result; a
//! [`db_reader::DbReader`] loads it and answers query batches of
//! [`BATCH_SIZE`] keys. [`index::RangerDb`] wraps both behind one handle.

/// Query batch size: four SIMD micro-batch lanes, not threads.
pub const BATCH_SIZE: usize = 4;

pub mod appendix;
pub mod binstream;
pub mod bucket;
pub mod bucket_builder;
pub mod db_builder;
pub mod db_reader;
pub mod hash;
pub mod index;
pub mod range_array;
pub mod record;
pub mod rmi;
pub(crate) mod simd;

pub use db_builder::{BuildEvent, BuildObserver, DbBuilder, NullObserver, TracingObserver};
pub use db_reader::{DbReader, Lookup};
pub use index::{IndexStats, RangerDb};
pub use record::{Record, RecordFileReader, RecordMap, RecordSource};
