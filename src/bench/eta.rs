//! Remaining-time estimation for a running suite.
//!
//! Each trial starts from a nominal estimate: planned bytes over an assumed
//! throughput for sequential and memory copy trials, the time cap for
//! random trials. Progress events then replace the seed with the observed
//! pace, and the measured sequential write speed recalibrates the sequential
//! reads that have not started yet.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use super::status::{TrialKind, TrialStatus, TrialUpdate};
use crate::config::EtaSettings;
use crate::util::units::{calculate_throughput_mbps, MIB};

/// Remaining time split by trial category
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EtaBreakdown {
    pub sequential_write: Duration,
    pub sequential_read: Duration,
    pub random: Duration,
    pub memory_copy: Duration,
}

impl EtaBreakdown {
    pub fn total(&self) -> Duration {
        self.sequential_write + self.sequential_read + self.random + self.memory_copy
    }
}

#[derive(Debug, Clone)]
struct EtaEntry {
    kind: TrialKind,
    planned_bytes: Option<u64>,
    time_cap: Option<Duration>,
    purge: bool,
    estimate: Duration,
    remaining: Duration,
    started: bool,
    done: bool,
}

/// Running remaining-time prediction for the trials of one suite
#[derive(Debug, Clone)]
pub struct EtaEstimator {
    settings: EtaSettings,
    entries: Vec<EtaEntry>,
    write_calibrated: bool,
}

impl EtaEstimator {
    pub fn new(settings: EtaSettings) -> Self {
        Self {
            settings,
            entries: Vec::new(),
            write_calibrated: false,
        }
    }

    /// Register the next trial of the suite
    pub fn add_trial(
        &mut self,
        kind: TrialKind,
        planned_bytes: Option<u64>,
        time_cap: Option<Duration>,
        purge: bool,
    ) {
        let mut entry = EtaEntry {
            kind,
            planned_bytes,
            time_cap,
            purge,
            estimate: Duration::ZERO,
            remaining: Duration::ZERO,
            started: false,
            done: false,
        };
        entry.estimate = self.nominal(&entry);
        entry.remaining = entry.estimate;
        self.entries.push(entry);
    }

    /// Forget all observations and return to the nominal estimates
    pub fn reset(&mut self) {
        self.write_calibrated = false;
        let mut entries = std::mem::take(&mut self.entries);
        for entry in &mut entries {
            entry.estimate = self.nominal(entry);
            entry.remaining = entry.estimate;
            entry.started = false;
            entry.done = false;
        }
        self.entries = entries;
    }

    /// Fold one trial event into the estimate
    pub fn observe(&mut self, update: &TrialUpdate) {
        let threshold = self.settings.progress_threshold;
        let Some(entry) = self.entries.get_mut(update.trial_index) else {
            return;
        };

        if update.status.is_terminal() {
            entry.remaining = Duration::ZERO;
            entry.done = true;
            if entry.kind == TrialKind::SequentialWrite && update.status == TrialStatus::Completed {
                if let Some(results) = &update.results {
                    let rate = calculate_throughput_mbps(results.total_traffic(), results.total_time());
                    self.recalibrate_reads(rate);
                }
            }
            return;
        }

        let (Some(percent), Some(elapsed_ms)) = (update.progress_percent, update.elapsed_ms) else {
            return;
        };
        entry.started = true;
        let elapsed = Duration::from_millis(elapsed_ms);

        if percent > threshold {
            entry.remaining = elapsed.mul_f64((100.0 - percent).max(0.0) / percent);

            if entry.kind == TrialKind::SequentialWrite && !self.write_calibrated {
                if let Some(bytes) = entry.planned_bytes {
                    let written = (bytes as f64 * percent / 100.0) as u64;
                    let rate = calculate_throughput_mbps(written, elapsed);
                    if rate > 0.0 {
                        self.write_calibrated = true;
                        self.recalibrate_reads(rate);
                    }
                }
            }
        } else {
            entry.remaining = entry.estimate.mul_f64(1.0 - percent.clamp(0.0, 100.0) / 100.0);
        }
    }

    /// Total remaining time over all unfinished trials
    pub fn remaining(&self) -> Duration {
        self.entries
            .iter()
            .filter(|e| !e.done)
            .fold(Duration::ZERO, |acc, e| acc.saturating_add(e.remaining))
    }

    pub fn breakdown(&self) -> EtaBreakdown {
        let mut breakdown = EtaBreakdown::default();
        for entry in self.entries.iter().filter(|e| !e.done) {
            let slot = match entry.kind {
                TrialKind::SequentialWrite => &mut breakdown.sequential_write,
                TrialKind::SequentialRead => &mut breakdown.sequential_read,
                TrialKind::RandomRead | TrialKind::RandomWrite => &mut breakdown.random,
                TrialKind::MemoryCopy => &mut breakdown.memory_copy,
            };
            *slot = slot.saturating_add(entry.remaining);
        }
        breakdown
    }

    fn recalibrate_reads(&mut self, write_mbps: f64) {
        if !(write_mbps.is_finite() && write_mbps > 0.0) {
            return;
        }
        let read_mbps = write_mbps * self.settings.read_write_ratio;
        tracing::debug!("Recalibrating sequential read estimate to {:.2} MB/s", read_mbps);

        let purge_estimate = self.settings.purge_estimate;
        for entry in self
            .entries
            .iter_mut()
            .filter(|e| e.kind == TrialKind::SequentialRead && !e.started && !e.done)
        {
            entry.estimate = transfer_time(entry.planned_bytes, read_mbps) + purge_overhead(entry.purge, purge_estimate);
            entry.remaining = entry.estimate;
        }
    }

    fn nominal(&self, entry: &EtaEntry) -> Duration {
        let body = match entry.kind {
            TrialKind::SequentialWrite => transfer_time(entry.planned_bytes, self.settings.write_mbps),
            TrialKind::SequentialRead => transfer_time(entry.planned_bytes, self.settings.read_mbps()),
            TrialKind::MemoryCopy => transfer_time(entry.planned_bytes, self.settings.memory_copy_mbps),
            TrialKind::RandomRead | TrialKind::RandomWrite => entry.time_cap.unwrap_or_default(),
        };
        body + purge_overhead(entry.purge, self.settings.purge_estimate)
    }
}

fn transfer_time(bytes: Option<u64>, mbps: f64) -> Duration {
    match bytes {
        Some(bytes) if mbps > 0.0 => Duration::from_secs_f64(bytes as f64 / MIB as f64 / mbps),
        _ => Duration::ZERO,
    }
}

fn purge_overhead(purge: bool, estimate: Duration) -> Duration {
    if purge {
        estimate
    } else {
        Duration::ZERO
    }
}

/// Cloneable, thread-safe view of a suite's estimator
#[derive(Debug, Clone)]
pub struct EtaHandle {
    inner: Arc<Mutex<EtaEstimator>>,
}

impl EtaHandle {
    pub(crate) fn new(estimator: EtaEstimator) -> Self {
        Self {
            inner: Arc::new(Mutex::new(estimator)),
        }
    }

    pub fn remaining(&self) -> Duration {
        self.with(|eta| eta.remaining())
    }

    pub fn breakdown(&self) -> EtaBreakdown {
        self.with(|eta| eta.breakdown())
    }

    pub(crate) fn with<T>(&self, f: impl FnOnce(&mut EtaEstimator) -> T) -> T {
        let mut guard = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}
