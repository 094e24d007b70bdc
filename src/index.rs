//! Owned index facade: build, persist, load and query a database.
//!
//! Mirrors the shared-library surface of the system: a single handle
//! that owns the serialized database bytes and a reader over them,
//! plus a statistics snapshot filled on demand.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::binstream::{BinReader, BinWriter};
use crate::db_builder::{BuildObserver, DbBuilder, TracingObserver};
use crate::db_reader::{DbReader, Lookup};
use crate::record::{open_maybe_gz, RecordSource};
use crate::BATCH_SIZE;

/// Statistics snapshot of a loaded database.
#[derive(Debug, Default, Clone, Copy)]
pub struct IndexStats {
    pub total_bytes: u64,
    pub appendix_bytes: u64,
    pub redundant_bytes: u64,
    pub distinct_key_num: u64,
    pub used_bytes: u64,
    pub singleton_num: u64,
    pub total_key_num: u64,
    pub prefix_bits_mean: f64,
    pub prefix_bits_stddev: f64,
}

/// A built or loaded database, ready for batched lookups.
pub struct RangerDb {
    /// The serialized database stream; what [`RangerDb::save`] writes.
    raw: Vec<u8>,
    reader: DbReader,
    stats: IndexStats,
}

impl RangerDb {
    /// Builds a database from `key_num` records pulled off `source` and
    /// keeps it queryable in memory. `ratio` is the range compression
    /// factor (16 is the recommended production value). Build progress
    /// is logged through `tracing`.
    pub fn build(
        key_num: usize,
        use64: bool,
        ratio: u32,
        source: &mut dyn RecordSource,
    ) -> Result<Self> {
        Self::build_with_observer(key_num, use64, ratio, source, &mut TracingObserver)
    }

    pub fn build_with_observer(
        key_num: usize,
        use64: bool,
        ratio: u32,
        source: &mut dyn RecordSource,
        observer: &mut dyn BuildObserver,
    ) -> Result<Self> {
        let mut builder = DbBuilder::new(use64);
        builder.set_compression(ratio);
        builder.build(key_num, source, observer);
        builder.build_model(observer)?;

        let mut writer = BinWriter::new(Vec::new());
        builder.write(&mut writer)?;
        Self::from_raw(writer.into_inner())
    }

    /// Loads a database file, transparently handling gzip content.
    pub fn load(path: &Path) -> Result<Self> {
        let mut stream = open_maybe_gz(path)?;
        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_raw(raw)
            .with_context(|| format!("failed to load {}", path.display()))
    }

    fn from_raw(raw: Vec<u8>) -> Result<Self> {
        let mut reader = BinReader::new(raw.as_slice());
        let reader = DbReader::load(&mut reader)?;
        Ok(Self {
            raw,
            reader,
            stats: IndexStats::default(),
        })
    }

    /// Writes the database to `path`, gzip-compressed when `level` > 0.
    pub fn save(&self, path: &Path, level: u32) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        let mut sink: Box<dyn Write> = if level == 0 {
            Box::new(BufWriter::new(file))
        } else {
            Box::new(GzEncoder::new(file, Compression::new(level.min(9))))
        };
        sink.write_all(&self.raw)?;
        sink.flush()?;
        Ok(())
    }

    /// The sorted primary-tier range boundaries the model trains on.
    pub fn extract_ranges(&self) -> &[u64] {
        self.reader.ranges()
    }

    /// Refreshes and returns the statistics snapshot.
    pub fn refresh_stats(&mut self) -> IndexStats {
        self.stats = IndexStats {
            total_bytes: self.reader.total_bytes(),
            appendix_bytes: self.reader.appendix_bytes(),
            redundant_bytes: self.reader.redundant_bytes(),
            distinct_key_num: self.reader.distinct_key_num(),
            used_bytes: self.reader.used_bytes(),
            singleton_num: self.reader.singleton_num(),
            total_key_num: self.reader.total_key_num(),
            prefix_bits_mean: self.reader.prefix_bits_mean(),
            prefix_bits_stddev: self.reader.prefix_bits_stddev(),
        };
        self.stats
    }

    pub fn stats(&self) -> &IndexStats {
        &self.stats
    }

    pub fn query(&self, keys: &[u64; BATCH_SIZE]) -> [Lookup<'_>; BATCH_SIZE] {
        self.reader.query(keys)
    }

    pub fn query_perf(&mut self, keys: &[u64; BATCH_SIZE]) -> [Lookup<'_>; BATCH_SIZE] {
        self.reader.query_perf(keys)
    }

    pub fn occurrence_list(&self) -> Vec<u32> {
        self.reader.occurrence_list()
    }

    pub fn perf_string(&self) -> String {
        self.reader.perf_string()
    }

    pub fn reader(&self) -> &DbReader {
        &self.reader
    }
}
