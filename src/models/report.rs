//! Suite report
//!
//! A serializable snapshot of a finished (or interrupted) suite: per-trial
//! statistics, aggregate scores and the machine the run happened on.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};

use super::sampler::{SampleStats, ThroughputSampler};
use crate::bench::{Suite, Trial, TrialKind, TrialStatus};
use crate::util::units::{format_bytes, format_throughput};
use crate::{Result, SpeedError};

/// Report format version written to JSON
const REPORT_VERSION: u32 = 1;

/// Complete result of one suite run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteReport {
    pub version: u32,
    /// When the report was taken
    pub timestamp: DateTime<Utc>,
    pub system: SystemInfo,
    /// Benchmark file the suite ran against, if it owned one
    pub target: Option<PathBuf>,
    pub trials: Vec<TrialSummary>,
    /// Present only when every trial completed
    pub write_score: Option<f64>,
    pub read_score: Option<f64>,
    /// Wall-clock duration of the run in seconds
    pub elapsed_secs: Option<f64>,
}

/// Outcome of one trial
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialSummary {
    pub index: usize,
    pub name: String,
    pub kind: TrialKind,
    pub block_size: u64,
    pub status: TrialStatus,
    pub samples: usize,
    /// Bytes moved while measuring
    pub total_traffic: u64,
    pub total_time_secs: f64,
    /// Absent when the trial recorded no samples
    pub stats: Option<SampleStats>,
    /// Individual samples, only when requested
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub raw: Vec<RawSample>,
}

/// One sample as exported
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    /// MB/s
    pub rate: f64,
    /// Byte offset of the block, when the trial records positions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
}

/// Machine information captured with a report
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub hostname: Option<String>,
    pub cpu: String,
    pub memory_total: u64,
    pub memory_available: u64,
    pub storage: StorageInfo,
}

/// Volume holding the benchmark file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageInfo {
    pub device: String,
    pub filesystem: String,
    pub mount_point: Option<PathBuf>,
    pub total_space: u64,
    pub available_space: u64,
}

impl SuiteReport {
    /// Snapshot `suite`; `include_samples` adds every raw sample
    pub fn from_suite(suite: &Suite, include_samples: bool) -> Self {
        let target = suite.test_file().map(|f| f.path().to_path_buf());
        let system = SystemInfo::detect(target.as_deref().and_then(Path::parent));

        Self {
            version: REPORT_VERSION,
            timestamp: Utc::now(),
            system,
            target,
            trials: suite
                .trials()
                .iter()
                .map(|t| TrialSummary::from_trial(t, include_samples))
                .collect(),
            write_score: suite.write_score().ok(),
            read_score: suite.read_score().ok(),
            elapsed_secs: suite.elapsed().map(|e| e.as_secs_f64()),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the report as pretty JSON, creating parent directories
    pub fn save_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                SpeedError::ConfigError(format!(
                    "Failed to create report directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        fs::write(path, self.to_json()?).map_err(|e| {
            SpeedError::ConfigError(format!("Failed to write report {}: {}", path.display(), e))
        })?;
        tracing::info!("Report saved to {}", path.display());
        Ok(())
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            SpeedError::ConfigError(format!("Failed to read report {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl fmt::Display for SuiteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<36} {:>14} {:>14} {:>12} {:>12}",
            "Trial", "Average", "Real", "Min", "Max"
        )?;
        for trial in &self.trials {
            match (&trial.stats, trial.status) {
                (Some(stats), TrialStatus::Completed) => writeln!(
                    f,
                    "{:<36} {:>14} {:>14} {:>12.2} {:>12.2}",
                    trial.name,
                    format_throughput(stats.avg_normalized),
                    format_throughput(stats.avg_real),
                    stats.min,
                    stats.max
                )?,
                _ => writeln!(f, "{:<36} {:>14}", trial.name, trial.status.to_string())?,
            }
        }

        match (self.write_score, self.read_score) {
            (Some(write), Some(read)) => write!(
                f,
                "\nWrite score: {}   Read score: {}",
                format_throughput(write),
                format_throughput(read)
            ),
            _ => write!(f, "\nScores unavailable: not every trial completed"),
        }
    }
}

impl TrialSummary {
    pub fn from_trial(trial: &Trial, include_samples: bool) -> Self {
        let result = trial.result();
        let sampler = result.as_deref();

        Self {
            index: trial.index(),
            name: trial.name(),
            kind: trial.kind(),
            block_size: trial.block_size(),
            status: trial.status(),
            samples: sampler.map_or(0, ThroughputSampler::len),
            total_traffic: sampler.map_or(0, ThroughputSampler::total_traffic),
            total_time_secs: sampler.map_or(0.0, |s| s.total_time().as_secs_f64()),
            stats: sampler.filter(|s| !s.is_empty()).map(ThroughputSampler::stats),
            raw: match sampler {
                Some(s) if include_samples => raw_samples(s),
                _ => Vec::new(),
            },
        }
    }
}

fn raw_samples(sampler: &ThroughputSampler) -> Vec<RawSample> {
    if sampler.has_positions() {
        sampler
            .positioned()
            .map(|(rate, position)| RawSample {
                rate,
                position: Some(position),
            })
            .collect()
    } else {
        sampler
            .rates()
            .iter()
            .map(|&rate| RawSample { rate, position: None })
            .collect()
    }
}

impl SystemInfo {
    /// Detect the current machine; `target_dir` selects the volume reported
    /// in `storage`
    pub fn detect(target_dir: Option<&Path>) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu_all();

        let cpu = system
            .cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .filter(|brand| !brand.is_empty())
            .unwrap_or_else(|| "Unknown CPU".to_string());

        Self {
            os: System::long_os_version()
                .unwrap_or_else(|| format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)),
            hostname: System::host_name(),
            cpu,
            memory_total: system.total_memory(),
            memory_available: system.available_memory(),
            storage: target_dir.map(StorageInfo::detect_for_path).unwrap_or_default(),
        }
    }
}

impl StorageInfo {
    /// Volume with the longest mount point containing `path`
    pub fn detect_for_path(path: &Path) -> Self {
        let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();

        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| Self {
                device: disk.name().to_string_lossy().into_owned(),
                filesystem: disk.file_system().to_string_lossy().into_owned(),
                mount_point: Some(disk.mount_point().to_path_buf()),
                total_space: disk.total_space(),
                available_space: disk.available_space(),
            })
            .unwrap_or_else(|| {
                tracing::debug!("No volume found for {}", target.display());
                Self::default()
            })
    }
}

impl fmt::Display for StorageInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.device.is_empty() {
            return f.write_str("unknown volume");
        }
        write!(
            f,
            "{} ({}, {} free of {})",
            self.device,
            self.filesystem,
            format_bytes(self.available_space),
            format_bytes(self.total_space)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::{RandomRead, SequentialWrite};
    use crate::io::simulated::SimulatedChannel;
    use crate::util::units::{KIB, MIB};
    use std::time::Duration;
    use tempfile::TempDir;

    fn finished_suite() -> Suite {
        let mut suite = Suite::new();
        suite.add_trial(Trial::new(
            SequentialWrite::new(
                SimulatedChannel::new(0).with_latency(Duration::from_micros(100)),
                MIB,
                4,
            )
            .unwrap(),
        ));
        suite.add_trial(Trial::new(
            RandomRead::new(
                SimulatedChannel::new(64 * KIB).with_latency(Duration::from_micros(100)),
                4 * KIB,
                Duration::from_secs(5),
            )
            .unwrap(),
        ));
        suite.execute().unwrap();
        suite
    }

    #[test]
    fn test_report_from_finished_suite() {
        let suite = finished_suite();
        let report = SuiteReport::from_suite(&suite, false);

        assert_eq!(report.trials.len(), 2);
        assert_eq!(report.trials[0].samples, 4);
        assert_eq!(report.trials[0].total_traffic, 4 * MIB);
        assert_eq!(report.trials[1].samples, 16);
        assert!(report.trials.iter().all(|t| t.raw.is_empty() && t.stats.is_some()));
        assert!(report.write_score.is_some());
        assert!(report.read_score.is_some());
        assert!(report.target.is_none());
        assert!(!report.system.os.is_empty());
    }

    #[test]
    fn test_raw_samples_keep_positions() {
        let suite = finished_suite();
        let report = SuiteReport::from_suite(&suite, true);

        let mut offsets: Vec<u64> = report.trials[1]
            .raw
            .iter()
            .map(|s| s.position.unwrap())
            .collect();
        offsets.sort_unstable();
        assert_eq!(offsets, (0..16).map(|b| b * 4 * KIB).collect::<Vec<_>>());
    }

    #[test]
    fn test_unfinished_suite_has_no_scores() {
        let mut suite = Suite::new();
        suite.add_trial(Trial::new(
            SequentialWrite::new(SimulatedChannel::new(0), MIB, 4).unwrap(),
        ));
        let report = SuiteReport::from_suite(&suite, false);

        assert_eq!(report.trials[0].status, TrialStatus::NotStarted);
        assert!(report.trials[0].stats.is_none());
        assert!(report.write_score.is_none());
        assert!(report.to_string().contains("Scores unavailable"));
    }

    #[test]
    fn test_save_and_load_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reports").join("run.json");
        let report = SuiteReport::from_suite(&finished_suite(), true);

        report.save_json(&path).unwrap();
        let loaded = SuiteReport::load_json(&path).unwrap();

        assert_eq!(loaded.version, REPORT_VERSION);
        assert_eq!(loaded.trials.len(), 2);
        assert_eq!(loaded.trials[1].raw.len(), 16);
        assert_eq!(loaded.trials[0].status, TrialStatus::Completed);
        assert!(loaded.write_score.is_some());
    }

    #[test]
    fn test_storage_detection_for_missing_path() {
        let info = StorageInfo::detect_for_path(Path::new("/definitely/not/here"));
        // falls back to whichever volume holds the root, or nothing
        assert!(info.total_space >= info.available_space);
    }
}
