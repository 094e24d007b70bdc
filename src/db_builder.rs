//! Streams sorted records into packed buckets and writes the database.
//!
//! The builder pulls records from a [`RecordSource`], fills a scratch
//! bucket until it rejects a record (capacity or tag collision), then
//! flushes the bucket: multi-value lists go to the appendix, the bucket's
//! smallest key becomes the next range boundary, and the packed page is
//! appended to the bucket blob. After the stream ends, the learned model
//! is trained over the compressed range array.
//!
//! Records must arrive in non-decreasing key order; that is what keeps
//! each bucket's key set inside one contiguous range window.

use anyhow::{Context, Result};

use crate::appendix::Appendix;
use crate::binstream::BinWriter;
use crate::bucket::bucket_size_bytes;
use crate::bucket_builder::{BucketBuilder, PushOutcome};
use crate::record::RecordSource;
use crate::rmi::{RangeModel, RqrmiModel, TrainerConfig};

/// Database stream header tag and version.
pub const DB_HEADER_NAME: &str = "db";
pub const DB_VERSION: u16 = 1;

/// Marker preceding the packed bucket blob.
pub const BLOB_TAG: &[u8; 4] = b"blb\0";

/// Build progress events published to the observer.
#[derive(Debug, Clone)]
pub enum BuildEvent<'a> {
    Progress {
        percent: u32,
        utilization: f64,
        ranges: usize,
        singleton_percent: f64,
        distinct_keys: usize,
        bucket_bytes: usize,
        appendix_bytes: u64,
    },
    TrainingStarted,
    TrainingDone {
        errors: &'a [u32],
    },
}

/// Single explicit build listener.
pub trait BuildObserver {
    fn on_event(&mut self, event: &BuildEvent<'_>);
}

/// Observer that drops every event.
pub struct NullObserver;

impl BuildObserver for NullObserver {
    fn on_event(&mut self, _event: &BuildEvent<'_>) {}
}

/// Observer that logs build progress through `tracing`.
pub struct TracingObserver;

impl BuildObserver for TracingObserver {
    fn on_event(&mut self, event: &BuildEvent<'_>) {
        match event {
            BuildEvent::Progress {
                percent,
                utilization,
                ranges,
                singleton_percent,
                distinct_keys,
                bucket_bytes,
                appendix_bytes,
            } => {
                if *percent == 0 || percent % 5 != 0 {
                    return;
                }
                tracing::info!(
                    "{percent}% (utilization: {:.3}% ranges: {ranges} \
                     singletons: {:.1}% unique-keys: {distinct_keys} \
                     buckets-size: {:.3} MB appendix-size: {:.3} MB)",
                    utilization * 100.0,
                    singleton_percent * 100.0,
                    *bucket_bytes as f64 / 1024.0 / 1024.0,
                    *appendix_bytes as f64 / 1024.0 / 1024.0,
                );
            }
            BuildEvent::TrainingStarted => {
                tracing::info!("training range model...");
            }
            BuildEvent::TrainingDone { errors } => {
                tracing::info!("done training model, error list: {errors:?}");
            }
        }
    }
}

pub struct DbBuilder {
    use64: bool,
    compression: u32,
    stage_sizes: Option<Vec<usize>>,
    ranges: Vec<u64>,
    bucket_blobs: Vec<u8>,
    apdx: Appendix,
    model: Option<RqrmiModel>,
    prefix_bits: Vec<u8>,
    distinct_key_num: u64,
    singleton_num: u64,
    total_key_num: u64,
    used_bytes: u64,
}

impl DbBuilder {
    pub fn new(use64: bool) -> Self {
        Self {
            use64,
            compression: 1,
            stage_sizes: None,
            ranges: Vec::new(),
            bucket_blobs: Vec::new(),
            apdx: Appendix::new(),
            model: None,
            prefix_bits: Vec::new(),
            distinct_key_num: 0,
            singleton_num: 0,
            total_key_num: 0,
            used_bytes: 0,
        }
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
        self.bucket_blobs.clear();
        self.apdx = Appendix::new();
        self.model = None;
        self.prefix_bits.clear();
        self.distinct_key_num = 0;
        self.singleton_num = 0;
        self.total_key_num = 0;
        self.used_bytes = 0;
    }

    /// Range-array compression factor; primary boundaries per cell.
    pub fn set_compression(&mut self, value: u32) {
        self.compression = value.max(1);
    }

    pub fn compression(&self) -> u32 {
        self.compression
    }

    /// Overrides the model stage widths chosen from the range count.
    pub fn set_stage_sizes(&mut self, sizes: Vec<usize>) {
        self.stage_sizes = Some(sizes);
    }

    pub fn ranges(&self) -> &[u64] {
        &self.ranges
    }

    /// Number of primary-tier boundaries the model trains on.
    pub fn range_num(&self) -> usize {
        let c = self.compression as usize;
        (self.ranges.len() + c - 1) / c
    }

    pub fn bucket_num(&self) -> usize {
        self.ranges.len()
    }

    /// Bytes of the bucket region.
    pub fn db_size(&self) -> usize {
        self.bucket_blobs.len()
    }

    pub fn appendix(&self) -> &Appendix {
        &self.apdx
    }

    pub fn distinct_key_num(&self) -> u64 {
        self.distinct_key_num
    }

    /// Fraction of page bytes carrying payload, in [0, 1].
    pub fn utilization(&self) -> f64 {
        if self.bucket_blobs.is_empty() {
            return 0.0;
        }
        self.used_bytes as f64 / self.bucket_blobs.len() as f64
    }

    pub fn singleton_percent(&self) -> f64 {
        if self.distinct_key_num == 0 {
            return 0.0;
        }
        self.singleton_num as f64 / self.distinct_key_num as f64
    }

    /// Streams up to `record_num` records from `source` into buckets.
    pub fn build(
        &mut self,
        record_num: usize,
        source: &mut dyn RecordSource,
        observer: &mut dyn BuildObserver,
    ) {
        self.clear();

        let mut scratch = BucketBuilder::new(self.use64);
        let mut page = vec![0u8; bucket_size_bytes(self.use64)];
        let mut last_percent = None;

        for i in 0..record_num {
            let percent = (100 * i / record_num.max(1)) as u32;
            if last_percent != Some(percent) {
                last_percent = Some(percent);
                self.publish_progress(percent, observer);
            }

            let Some(m) = source.next_record() else { break };

            if scratch.push(m) == PushOutcome::Inserted {
                continue;
            }

            self.flush_bucket(&mut scratch, &mut page);
            let retried = scratch.push(m);
            debug_assert_eq!(retried, PushOutcome::Inserted);
        }

        if !scratch.is_empty() {
            self.flush_bucket(&mut scratch, &mut page);
        }
        self.publish_progress(100, observer);
    }

    /// Trains the learned model over the compressed range array.
    pub fn build_model(&mut self, observer: &mut dyn BuildObserver) -> Result<()> {
        let primary: Vec<u64> = self
            .ranges
            .iter()
            .step_by(self.compression as usize)
            .copied()
            .collect();

        let sizes = self
            .stage_sizes
            .clone()
            .unwrap_or_else(|| RqrmiModel::default_stage_sizes(primary.len()));

        observer.on_event(&BuildEvent::TrainingStarted);
        let mut model = RqrmiModel::new(TrainerConfig::default(), sizes);
        model
            .train(&primary)
            .context("model training failed")?;
        observer.on_event(&BuildEvent::TrainingDone {
            errors: model.errors(),
        });
        self.model = Some(model);
        Ok(())
    }

    /// Serializes the database. `build_model` must have succeeded first.
    pub fn write<W: std::io::Write>(&self, writer: &mut BinWriter<W>) -> Result<()> {
        let model = self
            .model
            .as_ref()
            .context("database model has not been trained")?;
        let model_blob = model.store()?;

        let apdx_size = self.apdx.size();
        let ranges_bytes = 8 + 8 * self.ranges.len() as u64;
        let model_bytes = 8 + model_blob.len() as u64;
        let total = self.bucket_blobs.len() as u64 + apdx_size + ranges_bytes + model_bytes;

        writer.write_header(DB_HEADER_NAME, DB_VERSION)?;
        writer.write_u64(total)?;
        writer.write_bool(self.use64)?;
        writer.write_u64(apdx_size)?;
        writer.write_u64(self.ranges.len() as u64)?;
        writer.write_u32(self.compression)?;

        writer.write_u64(self.total_key_num)?;
        writer.write_u64(self.distinct_key_num)?;
        writer.write_u64(self.singleton_num)?;
        writer.write_u64(self.used_bytes)?;
        let (mean, stddev) = prefix_bits_stats(&self.prefix_bits);
        writer.write_f64(mean)?;
        writer.write_f64(stddev)?;

        writer.write_bytes(BLOB_TAG)?;
        writer.write_bytes(&self.bucket_blobs)?;
        writer.write_bytes(self.apdx.data())?;
        writer.write_u64_vec(&self.ranges)?;

        writer.write_u64(model_blob.len() as u64)?;
        writer.write_bytes(&model_blob)?;
        writer.flush()
    }

    fn flush_bucket(&mut self, scratch: &mut BucketBuilder, page: &mut [u8]) {
        scratch.populate_appendix(&mut self.apdx);
        self.ranges.push(scratch.smallest_key());
        scratch.pack(page);
        self.bucket_blobs.extend_from_slice(page);

        self.used_bytes += scratch.used_bytes() as u64;
        self.singleton_num += scratch.singleton_num() as u64;
        self.distinct_key_num += scratch.distinct_key_num() as u64;
        self.total_key_num += scratch.total_key_num() as u64;
        self.prefix_bits.push(scratch.common_prefix_bits());
        scratch.clear();
    }

    fn publish_progress(&self, percent: u32, observer: &mut dyn BuildObserver) {
        observer.on_event(&BuildEvent::Progress {
            percent,
            utilization: self.utilization(),
            ranges: self.ranges.len(),
            singleton_percent: self.singleton_percent(),
            distinct_keys: self.distinct_key_num as usize,
            bucket_bytes: self.bucket_blobs.len(),
            appendix_bytes: self.apdx.size(),
        });
    }
}

fn prefix_bits_stats(prefix_bits: &[u8]) -> (f64, f64) {
    if prefix_bits.is_empty() {
        return (0.0, 0.0);
    }
    let n = prefix_bits.len() as f64;
    let mean = prefix_bits.iter().map(|&b| f64::from(b)).sum::<f64>() / n;
    let variance = prefix_bits
        .iter()
        .map(|&b| {
            let d = f64::from(b) - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;

    fn build_from(records: Vec<Record>, use64: bool, compression: u32) -> DbBuilder {
        let count = records.len();
        let mut source = records.into_iter();
        let mut builder = DbBuilder::new(use64);
        builder.set_compression(compression);
        builder.build(count, &mut source, &mut NullObserver);
        builder.build_model(&mut NullObserver).unwrap();
        builder
    }

    #[test]
    fn ranges_match_bucket_count_and_stay_sorted() {
        let records: Vec<Record> =
            (0..200u64).map(|k| Record::new(k * 3, k)).collect();
        let builder = build_from(records, true, 1);

        assert_eq!(builder.ranges().len(), builder.bucket_num());
        assert!(builder.ranges().windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(builder.ranges()[0], 0);
        assert_eq!(builder.distinct_key_num(), 200);
        assert_eq!(
            builder.db_size(),
            builder.bucket_num() * bucket_size_bytes(true)
        );
    }

    #[test]
    fn forty_singletons_need_at_least_two_buckets() {
        let records: Vec<Record> =
            (100..140u64).map(|k| Record::new(k, k)).collect();
        let builder = build_from(records, true, 1);

        assert!(builder.bucket_num() >= 2);
        assert_eq!(builder.ranges()[0], 100);
        assert!(builder.ranges()[1] <= 132);
    }

    #[test]
    fn range_num_matches_the_primary_tier() {
        let records: Vec<Record> =
            (0..40u64).map(|k| Record::new(k << 32, k)).collect();
        let mut builder = DbBuilder::new(true);
        builder.set_compression(4);
        let count = 40;
        let mut source = records.into_iter();
        builder.build(count, &mut source, &mut NullObserver);

        let ranges = crate::range_array::RangeArray::new(builder.ranges().to_vec(), 4);
        assert_eq!(builder.range_num(), ranges.primary_len());
    }
}
