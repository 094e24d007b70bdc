//! Immutable database reader: load, then batched point lookups.
//!
//! A reader owns one cache-line-aligned buffer holding the bucket region
//! followed immediately by the appendix region, plus the range-array and
//! model oracles. A lookup batch runs the four-stage pipeline:
//!
//! 1. model inference → (predicted position, error bound) per key
//! 2. range search     → (primary base, cell hint)
//! 3. range validation → exact bucket index and its smallest key
//! 4. bucket probe     → SIMD tag compare, then slot or appendix fetch
//!
//! Value slices returned by [`DbReader::query`] borrow the reader's
//! buffer; they are valid for the reader's lifetime and never allocated.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io::Read;
use std::ptr::NonNull;
use std::time::Instant;

use anyhow::{bail, Context, Result};

use crate::binstream::BinReader;
use crate::bucket::{self, bucket_size_bytes, CACHE_LINE_SIZE};
use crate::db_builder::{BLOB_TAG, DB_HEADER_NAME, DB_VERSION};
use crate::hash::{tag15, APPENDIX_FLAG};
use crate::range_array::RangeArray;
use crate::rmi::{RangeModel, RqrmiModel};
use crate::simd;
use crate::BATCH_SIZE;

/// One lane's lookup result. Slices alias the reader's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<'a> {
    Miss,
    /// Values of a key in a 64-bit database, sorted ascending when the
    /// key has more than one value.
    Values64(&'a [u64]),
    /// Same for a 32-bit database.
    Values32(&'a [u32]),
}

impl Lookup<'_> {
    pub fn len(&self) -> usize {
        match self {
            Lookup::Miss => 0,
            Lookup::Values64(v) => v.len(),
            Lookup::Values32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Heap buffer aligned to (and padded to) whole cache lines.
struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

impl AlignedBuf {
    fn zeroed(len: usize) -> Result<Self> {
        let padded = len.max(1).next_multiple_of(CACHE_LINE_SIZE);
        let layout = Layout::from_size_align(padded, CACHE_LINE_SIZE)
            .context("bad buffer layout")?;
        // Allocation failure aborts; these paths are unrecoverable.
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            std::alloc::handle_alloc_error(layout);
        };
        Ok(Self { ptr, len, layout })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// The buffer is plain bytes behind a unique owner.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

/// Per-stage perf accumulators, filled by [`DbReader::query_perf`].
#[derive(Debug, Default, Clone, Copy)]
struct PerfStats {
    inference_ns: f64,
    search_ns: f64,
    validate_ns: f64,
    lookup_ns: f64,
    batches: f64,
}

pub struct DbReader {
    use64: bool,
    bucket_num: usize,
    bucket_size: usize,
    data: AlignedBuf,
    apdx_offset: usize,
    ranges: RangeArray,
    model: RqrmiModel,
    perf: PerfStats,

    // Header statistics.
    total_bytes: u64,
    appendix_bytes: u64,
    distinct_key_num: u64,
    singleton_num: u64,
    total_key_num: u64,
    used_bytes: u64,
    prefix_bits_mean: f64,
    prefix_bits_stddev: f64,
}

impl DbReader {
    /// Parses a database stream. Any format violation fails the load and
    /// no reader is produced.
    pub fn load<R: Read>(reader: &mut BinReader<R>) -> Result<Self> {
        let version = reader.read_header(DB_HEADER_NAME)?;
        if version != DB_VERSION {
            bail!("unsupported database version {version}");
        }

        let total = reader.read_u64()?;
        let use64 = reader.read_bool()?;
        let appendix_bytes = reader.read_u64()?;
        let bucket_num = reader.read_u64()? as usize;
        let compression = reader.read_u32()?;

        let total_key_num = reader.read_u64()?;
        let distinct_key_num = reader.read_u64()?;
        let singleton_num = reader.read_u64()?;
        let mut used_bytes = reader.read_u64()?;
        let prefix_bits_mean = reader.read_f64()?;
        let prefix_bits_stddev = reader.read_f64()?;

        let mut blob_tag = [0u8; 4];
        reader.read_bytes(&mut blob_tag)?;
        if &blob_tag != BLOB_TAG {
            bail!("invalid database: missing bucket blob tag");
        }

        let bucket_size = bucket_size_bytes(use64);
        let region = bucket_num
            .checked_mul(bucket_size)
            .and_then(|b| b.checked_add(appendix_bytes as usize))
            .context("database region size overflow")?;
        if total < region as u64 {
            bail!(
                "invalid database: stored size {total} smaller than \
                 bucket and appendix regions ({region})"
            );
        }

        let mut data = AlignedBuf::zeroed(region)?;
        reader.read_bytes(data.as_mut_slice())?;

        let range_values = reader.read_u64_vec()?;
        if range_values.len() != bucket_num {
            bail!(
                "invalid database: {} ranges for {} buckets",
                range_values.len(),
                bucket_num
            );
        }
        let ranges = RangeArray::new(range_values, compression);

        let model_len = reader.read_u64()? as usize;
        let mut model_blob = vec![0u8; model_len];
        reader.read_bytes(&mut model_blob)?;
        let model = RqrmiModel::load(&model_blob)?;

        used_bytes += 8 * bucket_num as u64 + appendix_bytes + model_len as u64;

        Ok(Self {
            use64,
            bucket_num,
            bucket_size,
            data,
            apdx_offset: bucket_num * bucket_size,
            ranges,
            model,
            perf: PerfStats::default(),
            total_bytes: total,
            appendix_bytes,
            distinct_key_num,
            singleton_num,
            total_key_num,
            used_bytes,
            prefix_bits_mean,
            prefix_bits_stddev,
        })
    }

    /// Batched point lookup over four keys.
    pub fn query(&self, keys: &[u64; BATCH_SIZE]) -> [Lookup<'_>; BATCH_SIZE] {
        let (bucket_idx, base) = self.locate(keys);
        probe_batch(self.layout(), keys, &bucket_idx, &base)
    }

    /// Same as [`DbReader::query`], additionally accumulating per-stage
    /// timing counters.
    pub fn query_perf(&mut self, keys: &[u64; BATCH_SIZE]) -> [Lookup<'_>; BATCH_SIZE] {
        let mut pred = [0.0f64; BATCH_SIZE];
        let mut err = [0u64; BATCH_SIZE];
        let mut base = [0u64; BATCH_SIZE];
        let mut cell = [0usize; BATCH_SIZE];
        let mut bucket_idx = [0usize; BATCH_SIZE];

        let t0 = Instant::now();
        self.model.inference_batch(keys, &mut pred, &mut err);
        let t1 = Instant::now();
        self.ranges
            .search_batch(keys, &pred, &err, &mut base, &mut cell);
        let t2 = Instant::now();
        self.ranges
            .validate_batch(keys, &cell, &mut base, &mut bucket_idx);
        let t3 = Instant::now();
        // Field-disjoint from the perf counters below, so the returned
        // borrows and the counter updates can coexist.
        let layout = RegionLayout {
            data: self.data.as_slice(),
            apdx_offset: self.apdx_offset,
            bucket_size: self.bucket_size,
            use64: self.use64,
        };
        let out = probe_batch(layout, keys, &bucket_idx, &base);
        let t4 = Instant::now();

        self.perf.inference_ns += (t1 - t0).as_nanos() as f64;
        self.perf.search_ns += (t2 - t1).as_nanos() as f64;
        self.perf.validate_ns += (t3 - t2).as_nanos() as f64;
        self.perf.lookup_ns += (t4 - t3).as_nanos() as f64;
        self.perf.batches += 1.0;
        out
    }

    /// Stages 1–3 of the pipeline: key → (bucket index, bucket base).
    fn locate(
        &self,
        keys: &[u64; BATCH_SIZE],
    ) -> ([usize; BATCH_SIZE], [u64; BATCH_SIZE]) {
        let mut pred = [0.0f64; BATCH_SIZE];
        let mut err = [0u64; BATCH_SIZE];
        let mut base = [0u64; BATCH_SIZE];
        let mut cell = [0usize; BATCH_SIZE];
        let mut bucket_idx = [0usize; BATCH_SIZE];

        self.model.inference_batch(keys, &mut pred, &mut err);
        self.ranges
            .search_batch(keys, &pred, &err, &mut base, &mut cell);
        self.ranges
            .validate_batch(keys, &cell, &mut base, &mut bucket_idx);
        (bucket_idx, base)
    }

    fn layout(&self) -> RegionLayout<'_> {
        RegionLayout {
            data: self.data.as_slice(),
            apdx_offset: self.apdx_offset,
            bucket_size: self.bucket_size,
            use64: self.use64,
        }
    }

    /// Diagnostic dump of the full pipeline for one key.
    pub fn debug(&self, key: u64) -> String {
        use std::fmt::Write;

        let keys = [key; BATCH_SIZE];
        let mut pred = [0.0f64; BATCH_SIZE];
        let mut err = [0u64; BATCH_SIZE];
        let mut base = [0u64; BATCH_SIZE];
        let mut cell = [0usize; BATCH_SIZE];
        let mut bucket_idx = [0usize; BATCH_SIZE];
        self.model.inference_batch(&keys, &mut pred, &mut err);
        self.ranges
            .search_batch(&keys, &pred, &err, &mut base, &mut cell);
        self.ranges
            .validate_batch(&keys, &cell, &mut base, &mut bucket_idx);

        let tag = tag15(key, base[0]);
        let mut out = String::new();
        writeln!(
            out,
            "key: {key} model-out: {} error: {} base-range: {} \
             bucket-index: {} tag: {tag}",
            pred[0], err[0], base[0], bucket_idx[0]
        )
        .unwrap();

        let data = self.data.as_slice();
        let bucket = &data
            [bucket_idx[0] * self.bucket_size..(bucket_idx[0] + 1) * self.bucket_size];
        write!(out, "bucket tags:").unwrap();
        for slot in 0..bucket::population(bucket) {
            write!(out, " {:#06x}", bucket::raw_tag(bucket, slot)).unwrap();
        }
        writeln!(out).unwrap();

        match probe_one(self.layout(), key, bucket_idx[0], base[0]) {
            Lookup::Miss => writeln!(out, "not found").unwrap(),
            Lookup::Values64(v) => writeln!(out, "found ({}): {v:?}", v.len()).unwrap(),
            Lookup::Values32(v) => writeln!(out, "found ({}): {v:?}", v.len()).unwrap(),
        }
        out
    }

    /// Sorted list of the value count of every key in the database.
    pub fn occurrence_list(&self) -> Vec<u32> {
        let data = self.data.as_slice();
        let apdx = &data[self.apdx_offset..];
        let mut out = Vec::with_capacity(self.distinct_key_num as usize);
        for idx in 0..self.bucket_num {
            let bucket = &data[idx * self.bucket_size..(idx + 1) * self.bucket_size];
            for slot in 0..bucket::population(bucket) {
                let flagged = bucket::raw_tag(bucket, slot) & APPENDIX_FLAG != 0;
                let count = if !flagged {
                    1
                } else if self.use64 {
                    (bucket::slot_u64(bucket, slot) & 0xFFFF_FFFF) as u32
                } else {
                    let offset = bucket::slot_u32(bucket, slot) as usize;
                    u32::from_le_bytes(apdx[offset..offset + 4].try_into().unwrap())
                };
                out.push(count);
            }
        }
        out.sort_unstable();
        out
    }

    /// Value-slot bytes that carry no entropy (high bytes of small
    /// values); an upper bound on what a tighter encoding could save.
    pub fn redundant_bytes(&self) -> u64 {
        let data = self.data.as_slice();
        let mut out = 0u64;
        for idx in 0..self.bucket_num {
            let bucket = &data[idx * self.bucket_size..(idx + 1) * self.bucket_size];
            if self.use64 {
                for slot in 0..bucket::BUCKET_CAPACITY {
                    let value = bucket::slot_u64(bucket, slot);
                    if value < 1 << 16 {
                        out += 6;
                    } else if value < 1 << 32 {
                        out += 4;
                    } else if value < 1 << 48 {
                        out += 2;
                    }
                }
            } else {
                for slot in 0..bucket::BUCKET_CAPACITY {
                    if bucket::slot_u32(bucket, slot) < 1 << 16 {
                        out += 2;
                    }
                }
            }
        }
        out
    }

    /// True iff the values behind `hit` live in the appendix region
    /// rather than inline in a bucket slot.
    pub fn is_in_appendix(&self, hit: &Lookup<'_>) -> bool {
        let start = match hit {
            Lookup::Miss => return false,
            Lookup::Values64(v) => v.as_ptr() as usize,
            Lookup::Values32(v) => v.as_ptr() as usize,
        };
        let apdx = self.data.as_slice()[self.apdx_offset..].as_ptr() as usize;
        start >= apdx
    }

    pub fn use64(&self) -> bool {
        self.use64
    }

    pub fn bucket_num(&self) -> usize {
        self.bucket_num
    }

    /// The primary-tier boundaries the model was trained with.
    pub fn ranges(&self) -> &[u64] {
        self.ranges.primary()
    }

    /// Number of primary-tier boundaries.
    pub fn range_num(&self) -> usize {
        self.ranges.primary_len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn appendix_bytes(&self) -> u64 {
        self.appendix_bytes
    }

    pub fn distinct_key_num(&self) -> u64 {
        self.distinct_key_num
    }

    pub fn total_key_num(&self) -> u64 {
        self.total_key_num
    }

    pub fn singleton_num(&self) -> u64 {
        self.singleton_num
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn prefix_bits_mean(&self) -> f64 {
        self.prefix_bits_mean
    }

    pub fn prefix_bits_stddev(&self) -> f64 {
        self.prefix_bits_stddev
    }

    fn per_key_ns(&self, total: f64) -> f64 {
        if self.perf.batches == 0.0 {
            return 0.0;
        }
        total / self.perf.batches / BATCH_SIZE as f64
    }

    pub fn stats_inference_ns(&self) -> f64 {
        self.per_key_ns(self.perf.inference_ns)
    }

    pub fn stats_search_ns(&self) -> f64 {
        self.per_key_ns(self.perf.search_ns)
    }

    pub fn stats_validate_ns(&self) -> f64 {
        self.per_key_ns(self.perf.validate_ns)
    }

    pub fn stats_lookup_ns(&self) -> f64 {
        self.per_key_ns(self.perf.lookup_ns)
    }

    /// Formatted per-stage perf summary.
    pub fn perf_string(&self) -> String {
        format!(
            "inference {:.3} ns search {:.3} ns validate {:.3} ns lookup {:.3} ns",
            self.stats_inference_ns(),
            self.stats_search_ns(),
            self.stats_validate_ns(),
            self.stats_lookup_ns(),
        )
    }
}

/// Borrowed view of the bucket+appendix region plus its geometry; keeps
/// the probe stage independent of the reader's other fields.
#[derive(Clone, Copy)]
struct RegionLayout<'a> {
    data: &'a [u8],
    apdx_offset: usize,
    bucket_size: usize,
    use64: bool,
}

/// Stage 4: probe each lane's bucket. All prefetches are issued before
/// the first probe to overlap the memory latency.
fn probe_batch<'a>(
    region: RegionLayout<'a>,
    keys: &[u64; BATCH_SIZE],
    bucket_idx: &[usize; BATCH_SIZE],
    base: &[u64; BATCH_SIZE],
) -> [Lookup<'a>; BATCH_SIZE] {
    for &idx in bucket_idx.iter() {
        let bucket = &region.data[idx * region.bucket_size..];
        simd::prefetch_l2(bucket.as_ptr());
        // Tag line into L2, up to three value lines non-temporally.
        for line in 1..(region.bucket_size / CACHE_LINE_SIZE).min(4) {
            simd::prefetch_nta(bucket[line * CACHE_LINE_SIZE..].as_ptr());
        }
    }

    let mut out = [Lookup::Miss; BATCH_SIZE];
    for i in 0..BATCH_SIZE {
        out[i] = probe_one(region, keys[i], bucket_idx[i], base[i]);
    }
    out
}

fn probe_one(region: RegionLayout<'_>, key: u64, bucket_idx: usize, base: u64) -> Lookup<'_> {
    let bucket = &region.data
        [bucket_idx * region.bucket_size..(bucket_idx + 1) * region.bucket_size];

    let tag = tag15(key, base);
    let Some(hit) = bucket::probe(bucket, tag) else {
        return Lookup::Miss;
    };

    let apdx = &region.data[region.apdx_offset..];
    if region.use64 {
        if hit.raw_tag & APPENDIX_FLAG == 0 {
            return Lookup::Values64(slice_u64(bucket, CACHE_LINE_SIZE + hit.slot * 8, 1));
        }
        let handle = bucket::slot_u64(bucket, hit.slot);
        let count = (handle & 0xFFFF_FFFF) as usize;
        let offset = (handle >> 32) as usize;
        let Some(end) = offset.checked_add(count * 8) else {
            return Lookup::Miss;
        };
        // A tag false positive on an absent key can surface an arbitrary
        // slot word; never read past or misalign into the appendix.
        if end > apdx.len() || offset % 8 != 0 {
            return Lookup::Miss;
        }
        simd::prefetch_l2(apdx[offset..].as_ptr());
        Lookup::Values64(slice_u64(apdx, offset, count))
    } else {
        if hit.raw_tag & APPENDIX_FLAG == 0 {
            return Lookup::Values32(slice_u32(bucket, CACHE_LINE_SIZE + hit.slot * 4, 1));
        }
        let offset = bucket::slot_u32(bucket, hit.slot) as usize;
        if offset + 4 > apdx.len() || offset % 4 != 0 {
            return Lookup::Miss;
        }
        let count =
            u32::from_le_bytes(apdx[offset..offset + 4].try_into().unwrap()) as usize;
        let Some(end) = (offset + 4).checked_add(count * 4) else {
            return Lookup::Miss;
        };
        if end > apdx.len() {
            return Lookup::Miss;
        }
        simd::prefetch_l2(apdx[offset..].as_ptr());
        Lookup::Values32(slice_u32(apdx, offset + 4, count))
    }
}

#[inline]
fn slice_u64(region: &[u8], offset: usize, count: usize) -> &[u64] {
    let bytes = &region[offset..offset + count * 8];
    debug_assert_eq!(bytes.as_ptr() as usize % 8, 0);
    // The region is cache-line aligned and every u64 payload starts on
    // an 8-byte boundary, so the cast is sound.
    unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const u64, count) }
}

#[inline]
fn slice_u32(region: &[u8], offset: usize, count: usize) -> &[u32] {
    let bytes = &region[offset..offset + count * 4];
    debug_assert_eq!(bytes.as_ptr() as usize % 4, 0);
    unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const u32, count) }
}
