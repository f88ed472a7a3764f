//! Per-trial throughput samples and the statistics derived from them.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::units::sample_rate_mbps;
use crate::{Result, SpeedError};

/// Default share of total virtual time kept by the normalized average.
pub const DEFAULT_NORMALIZATION_THRESHOLD: f64 = 0.95;

/// Number of trailing samples averaged for the smoothed progress rate.
const RECENT_WINDOW: usize = 5;

/// Summary statistics over all samples of a trial. All rates in MB/s.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SampleStats {
    pub min: f64,
    pub max: f64,
    /// Minimum after excluding the bottom 1% of samples
    pub min_trimmed: f64,
    /// Maximum after excluding the top 1% of samples
    pub max_trimmed: f64,
    /// Arithmetic mean of the sample rates
    pub mean: f64,
    /// Harmonic mean, equal to total bytes over total time
    pub avg_real: f64,
    /// Harmonic mean of the slowest samples that together account for the
    /// normalization threshold share of virtual time
    pub avg_normalized: f64,
}

#[derive(Debug, Clone, Copy)]
struct CachedStats {
    count: usize,
    stats: SampleStats,
}

/// Ordered sequence of throughput samples collected by one trial.
///
/// Positions are all-or-nothing: once a sample carries a byte offset every
/// later sample must carry one too, and vice versa.
#[derive(Debug)]
pub struct ThroughputSampler {
    block_size: u64,
    normalization_threshold: f64,
    rates: Vec<f64>,
    positions: Vec<u64>,
    total_time: Duration,
    cache: Mutex<Option<CachedStats>>,
}

impl ThroughputSampler {
    pub fn new(block_size: u64) -> Self {
        Self::with_threshold(block_size, DEFAULT_NORMALIZATION_THRESHOLD)
    }

    /// Create a sampler with a custom normalization threshold in `(0, 1]`.
    pub fn with_threshold(block_size: u64, normalization_threshold: f64) -> Self {
        Self {
            block_size,
            normalization_threshold: normalization_threshold.clamp(f64::MIN_POSITIVE, 1.0),
            rates: Vec::new(),
            positions: Vec::new(),
            total_time: Duration::ZERO,
            cache: Mutex::new(None),
        }
    }

    /// Append a sample in MB/s. Non-finite or non-positive rates are dropped.
    pub fn push(&mut self, rate_mbps: f64, position: Option<u64>) -> Result<()> {
        match position {
            Some(_) if self.positions.len() != self.rates.len() => {
                return Err(SpeedError::PositionMismatch(
                    "positioned sample added after unpositioned samples".to_string(),
                ));
            }
            None if !self.positions.is_empty() => {
                return Err(SpeedError::PositionMismatch(
                    "unpositioned sample added after positioned samples".to_string(),
                ));
            }
            _ => {}
        }

        if !rate_mbps.is_finite() || rate_mbps <= 0.0 {
            return Ok(());
        }

        self.rates.push(rate_mbps);
        if let Some(position) = position {
            self.positions.push(position);
        }
        Ok(())
    }

    /// Record one block moved in `elapsed`.
    pub fn record_block(&mut self, elapsed: Duration, position: Option<u64>) -> Result<()> {
        self.push(sample_rate_mbps(self.block_size, elapsed), position)
    }

    pub fn set_total_time(&mut self, total_time: Duration) {
        self.total_time = total_time;
    }

    pub fn total_time(&self) -> Duration {
        self.total_time
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    /// Bytes represented by the recorded samples.
    pub fn total_traffic(&self) -> u64 {
        self.block_size * self.rates.len() as u64
    }

    pub fn has_positions(&self) -> bool {
        !self.positions.is_empty() && self.positions.len() == self.rates.len()
    }

    /// Sample rates in recording order.
    pub fn rates(&self) -> &[f64] {
        &self.rates
    }

    /// `(rate, position)` pairs in recording order; empty without positions.
    pub fn positioned(&self) -> impl Iterator<Item = (f64, u64)> + '_ {
        let positions: &[u64] = if self.has_positions() { &self.positions } else { &[] };
        self.rates.iter().copied().zip(positions.iter().copied())
    }

    pub fn latest(&self) -> Option<f64> {
        self.rates.last().copied()
    }

    /// Harmonic mean of the last few samples, used as the smoothed
    /// progress rate. Zero when nothing was recorded.
    pub fn recent_average(&self) -> f64 {
        let start = self.rates.len().saturating_sub(RECENT_WINDOW);
        harmonic_mean(&self.rates[start..])
    }

    pub fn min(&self) -> f64 {
        self.stats().min
    }

    pub fn max(&self) -> f64 {
        self.stats().max
    }

    pub fn mean(&self) -> f64 {
        self.stats().mean
    }

    pub fn avg_throughput_real(&self) -> f64 {
        self.stats().avg_real
    }

    pub fn avg_throughput_normalized(&self) -> f64 {
        self.stats().avg_normalized
    }

    /// Derived statistics, recomputed only when samples were added since
    /// the previous call.
    pub fn stats(&self) -> SampleStats {
        let mut cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match *cache {
            Some(cached) if cached.count == self.rates.len() => cached.stats,
            _ => {
                let stats = compute_stats(&self.rates, self.normalization_threshold);
                *cache = Some(CachedStats {
                    count: self.rates.len(),
                    stats,
                });
                stats
            }
        }
    }
}

impl Clone for ThroughputSampler {
    fn clone(&self) -> Self {
        let cached = *self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Self {
            block_size: self.block_size,
            normalization_threshold: self.normalization_threshold,
            rates: self.rates.clone(),
            positions: self.positions.clone(),
            total_time: self.total_time,
            cache: Mutex::new(cached),
        }
    }
}

fn harmonic_mean(rates: &[f64]) -> f64 {
    if rates.is_empty() {
        return 0.0;
    }
    let inverse: f64 = rates.iter().map(|r| 1.0 / r).sum();
    rates.len() as f64 / inverse
}

fn compute_stats(rates: &[f64], threshold: f64) -> SampleStats {
    if rates.is_empty() {
        return SampleStats::default();
    }

    let mut sorted = rates.to_vec();
    sorted.sort_by(f64::total_cmp);

    let n = sorted.len();
    let mean = sorted.iter().sum::<f64>() / n as f64;

    // virtual time per sample is block_size / rate; block size cancels out
    let total_time: f64 = sorted.iter().map(|r| 1.0 / r).sum();
    let cutoff = total_time * threshold;
    let mut consumed_time = 0.0;
    let mut consumed = 0;
    for rate in &sorted {
        consumed_time += 1.0 / rate;
        consumed += 1;
        if consumed_time >= cutoff {
            break;
        }
    }

    SampleStats {
        min: sorted[0],
        max: sorted[n - 1],
        min_trimmed: sorted[(n as f64 * 0.01) as usize],
        max_trimmed: sorted[((n as f64 * 0.99) as usize).min(n - 1)],
        mean,
        avg_real: n as f64 / total_time,
        avg_normalized: consumed as f64 / consumed_time,
    }
}
