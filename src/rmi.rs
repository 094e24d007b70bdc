//! Learned position model: a recursive model index over the compressed
//! range array.
//!
//! Stage widths form a small pyramid (e.g. `[1, 8, 55]`); every stage is
//! piecewise linear. A stage model predicts an absolute position in the
//! trained array, which routes the key to a model of the next stage; the
//! leaf stage carries per-model maximum-absolute-error bounds that the
//! range search uses to bound its window. Leaves whose error exceeds the
//! configured threshold get a least-squares refinement pass.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::BATCH_SIZE;

/// Opaque trainer hyperparameters. Defaults match the production
/// configuration: error threshold 64, hybrid refinement and batched
/// inference on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub error_threshold: u32,
    pub use_hybrid: bool,
    pub use_batching: bool,
    pub samples: usize,
    pub max_sessions: u32,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            error_threshold: 64,
            use_hybrid: true,
            use_batching: true,
            samples: 16_000,
            max_sessions: 20,
        }
    }
}

/// Contract every position model must satisfy: train over a sorted u64
/// array, then predict `(position, error_bound)` for key batches, and
/// serialize to/from an opaque blob.
pub trait RangeModel: Sized {
    fn train(&mut self, values: &[u64]) -> Result<()>;
    fn inference_batch(
        &self,
        keys: &[u64; BATCH_SIZE],
        pred: &mut [f64; BATCH_SIZE],
        err: &mut [u64; BATCH_SIZE],
    );
    fn store(&self) -> Result<Vec<u8>>;
    fn load(bytes: &[u8]) -> Result<Self>;
}

/// One linear stage model: position ≈ slope · key + intercept.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct LinearModel {
    slope: f64,
    intercept: f64,
}

impl LinearModel {
    /// Endpoint interpolation over `keys`, mapping keys[j] ≈ first + j.
    fn interpolate(keys: &[u64], first: usize) -> Self {
        let n = keys.len();
        if n < 2 || keys[n - 1] == keys[0] {
            return Self {
                slope: 0.0,
                intercept: first as f64,
            };
        }
        let slope = (n - 1) as f64 / (keys[n - 1] - keys[0]) as f64;
        Self {
            slope,
            intercept: first as f64 - keys[0] as f64 * slope,
        }
    }

    /// Ordinary least squares over the same points; used as the hybrid
    /// refinement when interpolation misses the error threshold.
    fn least_squares(keys: &[u64], first: usize) -> Self {
        let n = keys.len() as f64;
        if keys.len() < 2 {
            return Self::interpolate(keys, first);
        }
        let key0 = keys[0] as f64;
        let mut sx = 0.0;
        let mut sy = 0.0;
        let mut sxx = 0.0;
        let mut sxy = 0.0;
        for (j, &key) in keys.iter().enumerate() {
            let x = key as f64 - key0;
            let y = (first + j) as f64;
            sx += x;
            sy += y;
            sxx += x * x;
            sxy += x * y;
        }
        let denom = n * sxx - sx * sx;
        if denom.abs() < f64::EPSILON {
            return Self::interpolate(keys, first);
        }
        let slope = (n * sxy - sx * sy) / denom;
        let intercept = (sy - slope * sx) / n - slope * key0;
        Self { slope, intercept }
    }

    #[inline]
    fn predict(&self, key: u64) -> f64 {
        self.slope * key as f64 + self.intercept
    }
}

/// Recursive model index trained over the compressed range array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RqrmiModel {
    config: TrainerConfig,
    stage_sizes: Vec<usize>,
    stages: Vec<Vec<LinearModel>>,
    /// Per-leaf maximum absolute prediction error, in positions.
    errors: Vec<u32>,
    key_count: usize,
}

impl RqrmiModel {
    pub fn new(config: TrainerConfig, stage_sizes: Vec<usize>) -> Self {
        Self {
            config,
            stage_sizes,
            stages: Vec::new(),
            errors: Vec::new(),
            key_count: 0,
        }
    }

    /// Default stage widths by trained-array size.
    pub fn default_stage_sizes(range_num: usize) -> Vec<usize> {
        if range_num < 1_000 {
            vec![1]
        } else if range_num < 10_000 {
            vec![1, 8]
        } else if range_num < 100_000 {
            vec![1, 8, 55]
        } else {
            vec![1, 8, 119]
        }
    }

    /// Per-leaf error bounds of the trained model.
    pub fn errors(&self) -> &[u32] {
        &self.errors
    }

    /// Routes `key` down to its leaf model index.
    #[inline]
    fn route(&self, key: u64) -> usize {
        let n = self.key_count as f64;
        let last = self.stages.len() - 1;
        let mut idx = 0usize;
        for stage in 0..last {
            let pos = self.stages[stage][idx].predict(key).clamp(0.0, n - 1.0);
            let width = self.stages[stage + 1].len();
            idx = ((pos * width as f64 / n) as usize).min(width - 1);
        }
        idx
    }
}

impl RangeModel for RqrmiModel {
    fn train(&mut self, values: &[u64]) -> Result<()> {
        if values.is_empty() {
            bail!("model training failed: empty value array");
        }
        if self.stage_sizes.is_empty() || self.stage_sizes[0] != 1 {
            bail!("model training failed: bad stage sizes {:?}", self.stage_sizes);
        }

        let n = values.len();
        self.key_count = n;
        self.stages = vec![vec![LinearModel::interpolate(values, 0)]];

        // Train each following stage over the points its models receive
        // from the already-trained prefix.
        for stage in 1..self.stage_sizes.len() {
            let width = self.stage_sizes[stage];
            // Index span of the points each model receives. Routing is not
            // guaranteed contiguous, so fitting over the whole [min, max]
            // span keeps every routed point covered.
            let mut spans: Vec<Option<(usize, usize)>> = vec![None; width];
            self.stages.push(vec![LinearModel::default(); width]);
            for (i, &key) in values.iter().enumerate() {
                let idx = self.partial_route(key, stage);
                spans[idx] = match spans[idx] {
                    None => Some((i, i)),
                    Some((lo, hi)) => Some((lo.min(i), hi.max(i))),
                };
            }
            let mut cursor = 0usize;
            for m in 0..width {
                let model = match spans[m] {
                    // Nothing routes here for trained keys; anchor stray
                    // queries to the last position seen.
                    None => LinearModel {
                        slope: 0.0,
                        intercept: cursor as f64,
                    },
                    Some((lo, hi)) => {
                        cursor = hi;
                        LinearModel::interpolate(&values[lo..=hi], lo)
                    }
                };
                self.stages[stage][m] = model;
            }
        }

        // Leaf error bounds, with least-squares refinement for leaves
        // that miss the threshold.
        let leaves = *self.stage_sizes.last().unwrap();
        let mut errors = vec![0u32; leaves];
        let mut spans: Vec<Option<(usize, usize)>> = vec![None; leaves];
        for (i, &key) in values.iter().enumerate() {
            let leaf = self.route(key);
            spans[leaf] = match spans[leaf] {
                None => Some((i, i)),
                Some((lo, hi)) => Some((lo.min(i), hi.max(i))),
            };
            let e = leaf_error(&self.stages[self.stages.len() - 1][leaf], key, i, n);
            errors[leaf] = errors[leaf].max(e);
        }

        if self.config.use_hybrid {
            let last = self.stages.len() - 1;
            for leaf in 0..leaves {
                let Some((lo, hi)) = spans[leaf] else { continue };
                if errors[leaf] <= self.config.error_threshold {
                    continue;
                }
                let refined = LinearModel::least_squares(&values[lo..=hi], lo);
                // The span is a superset of the routed points, so the
                // recomputed bound stays conservative.
                let mut refined_err = 0u32;
                for (j, &key) in values[lo..=hi].iter().enumerate() {
                    refined_err = refined_err.max(leaf_error(&refined, key, lo + j, n));
                }
                if refined_err < errors[leaf] {
                    self.stages[last][leaf] = refined;
                    errors[leaf] = refined_err;
                }
            }
        }

        self.errors = errors;
        Ok(())
    }

    fn inference_batch(
        &self,
        keys: &[u64; BATCH_SIZE],
        pred: &mut [f64; BATCH_SIZE],
        err: &mut [u64; BATCH_SIZE],
    ) {
        debug_assert!(!self.stages.is_empty(), "inference on an untrained model");
        let n = self.key_count as f64;
        let last = self.stages.len() - 1;
        for i in 0..BATCH_SIZE {
            let leaf = self.route(keys[i]);
            pred[i] = self.stages[last][leaf]
                .predict(keys[i])
                .clamp(0.0, n - 1.0);
            err[i] = u64::from(self.errors[leaf]);
        }
    }

    fn store(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("failed to serialize model")
    }

    fn load(bytes: &[u8]) -> Result<Self> {
        let model: Self =
            bincode::deserialize(bytes).context("failed to deserialize model")?;
        let leaves = model.stages.last().map_or(0, Vec::len);
        if model.key_count == 0
            || leaves == 0
            || model.errors.len() != leaves
            || model.stages.iter().any(Vec::is_empty)
        {
            bail!("model blob is inconsistent");
        }
        Ok(model)
    }
}

impl RqrmiModel {
    /// Routes `key` through the first `stages` trained stages, returning
    /// the model index within stage `stages`.
    fn partial_route(&self, key: u64, stage: usize) -> usize {
        let n = self.key_count as f64;
        let mut idx = 0usize;
        for s in 0..stage {
            let pos = self.stages[s][idx].predict(key).clamp(0.0, n - 1.0);
            let width = self.stage_sizes[s + 1];
            idx = ((pos * width as f64 / n) as usize).min(width - 1);
        }
        idx
    }
}

#[inline]
fn leaf_error(model: &LinearModel, key: u64, index: usize, n: usize) -> u32 {
    let predicted = model.predict(key).clamp(0.0, (n - 1) as f64);
    (predicted - index as f64).abs().ceil() as u32
}
