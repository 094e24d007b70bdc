//! Two-tier compressed boundary array.
//!
//! Holds the sorted sequence of every bucket's smallest key. With
//! compression factor c, only every c-th boundary forms the primary tier
//! the learned model is trained on; the skipped boundaries are consulted
//! by the validation stage to pin down the exact bucket.

use crate::BATCH_SIZE;

pub struct RangeArray {
    /// Every bucket boundary, one per bucket, non-decreasing.
    values: Vec<u64>,
    /// Every `compression`-th boundary; the model's training targets.
    primary: Vec<u64>,
    compression: u32,
}

impl RangeArray {
    pub fn new(values: Vec<u64>, compression: u32) -> Self {
        let compression = compression.max(1);
        let primary = values
            .iter()
            .step_by(compression as usize)
            .copied()
            .collect();
        Self {
            values,
            primary,
            compression,
        }
    }

    /// The full boundary array (one entry per bucket).
    pub fn values(&self) -> &[u64] {
        &self.values
    }

    /// Total logical size: the number of buckets.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The compressed primary tier.
    pub fn primary(&self) -> &[u64] {
        &self.primary
    }

    pub fn primary_len(&self) -> usize {
        self.primary.len()
    }

    pub fn compression(&self) -> u32 {
        self.compression
    }

    /// Stage 2 of the lookup pipeline: for each key, bound a window over
    /// the primary tier with the model's `(pred, err)` and locate the
    /// greatest primary boundary that is ≤ key. Outputs the primary value
    /// as `base` and the primary cell index as `cell`.
    ///
    /// The window gets one extra slot of slack for keys that fall between
    /// trained boundaries; if the windowed search still lands on an edge
    /// that violates the bound, it falls back to a full binary search, so
    /// results never depend on model quality.
    pub fn search_batch(
        &self,
        keys: &[u64; BATCH_SIZE],
        pred: &[f64; BATCH_SIZE],
        err: &[u64; BATCH_SIZE],
        base: &mut [u64; BATCH_SIZE],
        cell: &mut [usize; BATCH_SIZE],
    ) {
        let n = self.primary.len();
        debug_assert!(n > 0, "search on an empty range array");

        for i in 0..BATCH_SIZE {
            let guess = (pred[i].max(0.0) as usize).min(n - 1);
            let slack = (err[i] as usize).saturating_add(1).min(n);
            let lo = guess.saturating_sub(slack);
            let hi = (guess + slack + 1).min(n);

            let mut idx = lo + floor_index(&self.primary[lo..hi], keys[i]);
            let low_edge = idx == lo && lo > 0 && self.primary[lo] > keys[i];
            let high_edge = idx + 1 == hi && hi < n && self.primary[hi] <= keys[i];
            if low_edge || high_edge {
                idx = floor_index(&self.primary, keys[i]);
            }

            cell[i] = idx;
            base[i] = self.primary[idx];
        }
    }

    /// Stage 3: refine the primary cell to the exact bucket by scanning
    /// its at-most-(c−1) secondary boundaries. Rewrites `base` to the
    /// final bucket's smallest key so the probe hashes against the same
    /// base the builder used.
    pub fn validate_batch(
        &self,
        keys: &[u64; BATCH_SIZE],
        cell: &[usize; BATCH_SIZE],
        base: &mut [u64; BATCH_SIZE],
        bucket: &mut [usize; BATCH_SIZE],
    ) {
        let c = self.compression as usize;
        for i in 0..BATCH_SIZE {
            let start = cell[i] * c;
            let end = (start + c).min(self.values.len());
            let mut idx = start;
            for j in start + 1..end {
                if self.values[j] <= keys[i] {
                    idx = j;
                } else {
                    break;
                }
            }
            bucket[i] = idx;
            base[i] = self.values[idx];
        }
    }
}

/// Index of the greatest element ≤ key, or 0 when every element is
/// greater (absent keys below the minimum probe bucket 0 and miss on the
/// tag compare).
#[inline]
fn floor_index(sorted: &[u64], key: u64) -> usize {
    sorted.partition_point(|&v| v <= key).saturating_sub(1)
}
