//! Configuration management module
//!
//! Handles loading, saving, and validation of suite configuration. The
//! configuration file is TOML; durations are written as human-readable
//! strings such as `"20s"` or `"1m 30s"`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::io::buffer::BUFFER_ALIGNMENT;
use crate::util::units::{KIB, MIB};
use crate::{Result, SpeedError, APP_NAME, CONFIG_FILE};

/// When read trials are preceded by an active cache purge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PurgeMode {
    /// Purge only when the read handle could not bypass the OS cache
    #[default]
    Auto,
    /// Purge before every read trial
    Always,
    /// Never purge
    Never,
}

/// Suite configuration containing all trial parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuiteConfig {
    /// Directory on the volume under test
    pub target_dir: PathBuf,
    /// Size of the benchmark file (in bytes)
    pub file_size: u64,
    /// Block size for sequential trials (in bytes)
    pub sequential_block_size: u64,
    /// Block size for random trials (in bytes)
    pub random_block_size: u64,
    /// Block size for the memory copy trial (in bytes)
    pub memory_copy_block_size: u64,
    /// Run unrecorded warm-up blocks before sequential write
    pub warm_up: bool,
    /// Share of total blocks used for warm-up, rounded up
    pub warm_up_fraction: f64,
    /// Soft time limit for each random trial
    #[serde(with = "duration_serde")]
    pub random_time_cap: Duration,
    /// Maximum number of offsets in a random access plan
    pub random_plan_cap: u64,
    /// Size of the pseudo-random source arena used by random writes
    pub random_write_arena: u64,
    /// Share of virtual time kept by the normalized average
    pub normalization_threshold: f64,
    /// Request uncached file handles where the platform allows it
    pub bypass_cache: bool,
    /// Force every sequential and random write to the device
    pub write_through: bool,
    pub purge_mode: PurgeMode,
    /// Append a memory copy trial as a RAM baseline
    pub memory_copy: bool,
    /// Leave the benchmark file in place after the run
    pub keep_test_file: bool,
    /// Report progress at most once per whole percent instead of per block
    pub progress_per_percent: bool,
    pub purge: PurgeSettings,
    pub eta: EtaSettings,
    pub scores: ScoreWeights,
}

/// Cache purge tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PurgeSettings {
    /// Number of pseudo-random blocks cycled through scratch writes
    pub reserve_blocks: u32,
    pub reserve_block_size: u64,
    /// Upper bound on time spent overwriting the scratch file
    #[serde(with = "duration_serde")]
    pub scratch_write_duration: Duration,
    /// Upper bound on bytes written to the scratch file
    pub scratch_file_limit: u64,
    /// Size of each block allocated to create memory pressure
    pub memory_block_size: u64,
    /// Share of reported free memory that may be claimed
    pub memory_ratio: f64,
    /// Stop allocating once free memory drops below this many bytes
    pub memory_floor: u64,
    /// Longest pause between allocations, reached near the ceiling
    #[serde(with = "duration_serde")]
    pub allocation_pause: Duration,
}

/// Remaining-time estimator seeds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtaSettings {
    /// Assumed sequential write throughput in MB/s before measurements
    pub write_mbps: f64,
    /// Expected read throughput as a multiple of write throughput
    pub read_write_ratio: f64,
    pub memory_copy_mbps: f64,
    /// Progress percentage after which observed pace replaces the seed
    pub progress_threshold: f64,
    /// Added to the estimate of every trial preceded by a purge
    #[serde(with = "duration_serde")]
    pub purge_estimate: Duration,
}

/// Traffic split used by the aggregate scores, in MB
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    /// Sequential-equivalent traffic per sequential trial
    pub sequential_mb: f64,
    /// Random-equivalent traffic, split evenly among random trials
    pub random_mb: f64,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            target_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            file_size: 1024 * MIB,
            sequential_block_size: 16 * MIB,
            random_block_size: 4 * KIB,
            memory_copy_block_size: 16 * MIB,
            warm_up: true,
            warm_up_fraction: 0.05,
            random_time_cap: Duration::from_secs(20),
            random_plan_cap: 1 << 20,
            random_write_arena: 128 * MIB,
            normalization_threshold: crate::models::sampler::DEFAULT_NORMALIZATION_THRESHOLD,
            bypass_cache: true,
            write_through: true,
            purge_mode: PurgeMode::Auto,
            memory_copy: false,
            keep_test_file: false,
            progress_per_percent: false,
            purge: PurgeSettings::default(),
            eta: EtaSettings::default(),
            scores: ScoreWeights::default(),
        }
    }
}

impl Default for PurgeSettings {
    fn default() -> Self {
        Self {
            reserve_blocks: 3,
            reserve_block_size: 32 * MIB,
            scratch_write_duration: Duration::from_secs(7),
            scratch_file_limit: 1024 * MIB,
            memory_block_size: 128 * MIB,
            memory_ratio: 0.85,
            memory_floor: 50 * MIB,
            allocation_pause: Duration::from_millis(40),
        }
    }
}

impl Default for EtaSettings {
    fn default() -> Self {
        Self {
            write_mbps: 100.0,
            read_write_ratio: 1.1,
            memory_copy_mbps: 2000.0,
            progress_threshold: 5.0,
            purge_estimate: Duration::from_secs(10),
        }
    }
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            sequential_mb: 800.0,
            random_mb: 200.0,
        }
    }
}

impl SuiteConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Small, fast configuration for smoke runs and tests
    pub fn quick() -> Self {
        Self {
            file_size: 64 * MIB,
            sequential_block_size: 4 * MIB,
            random_time_cap: Duration::from_secs(2),
            random_write_arena: 4 * MIB,
            purge: PurgeSettings {
                reserve_blocks: 1,
                reserve_block_size: 4 * MIB,
                scratch_write_duration: Duration::from_millis(250),
                scratch_file_limit: 16 * MIB,
                memory_block_size: 16 * MIB,
                memory_ratio: 0.1,
                ..PurgeSettings::default()
            },
            ..Self::default()
        }
    }

    /// Validate the configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.file_size == 0 {
            return Err(SpeedError::ConfigError(
                "File size must be greater than 0".to_string(),
            ));
        }

        for (name, size) in [
            ("Sequential block size", self.sequential_block_size),
            ("Random block size", self.random_block_size),
            ("Memory copy block size", self.memory_copy_block_size),
        ] {
            if size == 0 {
                return Err(SpeedError::ConfigError(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        for (name, size) in [
            ("Sequential block size", self.sequential_block_size),
            ("Random block size", self.random_block_size),
        ] {
            if size > self.file_size {
                return Err(SpeedError::ConfigError(format!(
                    "{} ({} bytes) exceeds file size ({} bytes)",
                    name, size, self.file_size
                )));
            }
            if self.bypass_cache && size % BUFFER_ALIGNMENT as u64 != 0 {
                return Err(SpeedError::ConfigError(format!(
                    "{} must be a multiple of {} bytes when bypassing the cache",
                    name, BUFFER_ALIGNMENT
                )));
            }
        }

        if !(0.0..1.0).contains(&self.warm_up_fraction) {
            return Err(SpeedError::ConfigError(
                "Warm-up fraction must be in [0, 1)".to_string(),
            ));
        }

        if self.random_time_cap.is_zero() {
            return Err(SpeedError::ConfigError(
                "Random time cap must be greater than 0".to_string(),
            ));
        }

        if self.random_plan_cap == 0 {
            return Err(SpeedError::ConfigError(
                "Random plan cap must be greater than 0".to_string(),
            ));
        }

        if self.random_write_arena < self.random_block_size {
            return Err(SpeedError::ConfigError(
                "Random write arena must hold at least one block".to_string(),
            ));
        }

        if !(self.normalization_threshold > 0.0 && self.normalization_threshold <= 1.0) {
            return Err(SpeedError::ConfigError(
                "Normalization threshold must be in (0, 1]".to_string(),
            ));
        }

        self.purge.validate()?;
        self.eta.validate()?;
        self.scores.validate()?;

        Ok(())
    }

    /// Set the directory on the volume under test
    pub fn with_target_dir(mut self, dir: PathBuf) -> Self {
        self.target_dir = dir;
        self
    }

    /// Set the benchmark file size
    pub fn with_file_size(mut self, size: u64) -> Self {
        self.file_size = size;
        self
    }

    pub fn with_sequential_block_size(mut self, size: u64) -> Self {
        self.sequential_block_size = size;
        self
    }

    pub fn with_random_block_size(mut self, size: u64) -> Self {
        self.random_block_size = size;
        self
    }

    pub fn with_random_time_cap(mut self, cap: Duration) -> Self {
        self.random_time_cap = cap;
        self
    }

    pub fn with_warm_up(mut self, warm_up: bool) -> Self {
        self.warm_up = warm_up;
        self
    }

    pub fn with_bypass_cache(mut self, bypass: bool) -> Self {
        self.bypass_cache = bypass;
        self
    }

    pub fn with_purge_mode(mut self, mode: PurgeMode) -> Self {
        self.purge_mode = mode;
        self
    }

    pub fn with_memory_copy(mut self, enabled: bool) -> Self {
        self.memory_copy = enabled;
        self
    }

    /// Set whether to keep the benchmark file
    pub fn with_keep_test_file(mut self, keep: bool) -> Self {
        self.keep_test_file = keep;
        self
    }

    pub fn with_progress_per_percent(mut self, enabled: bool) -> Self {
        self.progress_per_percent = enabled;
        self
    }

    /// Load configuration from the standard config file location
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;
        if !config_path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&config_path)
    }

    /// Load and validate configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            SpeedError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            SpeedError::ConfigError(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        config.validate()?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Save configuration to the standard config file location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file_path()?)
    }

    /// Validate and save configuration to an explicit path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                SpeedError::ConfigError(format!(
                    "Failed to create config directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| {
            SpeedError::ConfigError(format!(
                "Failed to write config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Ok(())
    }

    /// Get the standard configuration file path
    pub fn config_file_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| {
            SpeedError::ConfigError("Unable to determine config directory".to_string())
        })?;

        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }
}

impl PurgeSettings {
    fn validate(&self) -> Result<()> {
        if self.reserve_blocks == 0 || self.reserve_block_size == 0 {
            return Err(SpeedError::ConfigError(
                "Purge reserve blocks must be non-empty".to_string(),
            ));
        }
        if self.memory_block_size == 0 {
            return Err(SpeedError::ConfigError(
                "Purge memory block size must be greater than 0".to_string(),
            ));
        }
        if !(self.memory_ratio > 0.0 && self.memory_ratio <= 1.0) {
            return Err(SpeedError::ConfigError(
                "Purge memory ratio must be in (0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

impl EtaSettings {
    /// Seed throughput for sequential reads
    pub fn read_mbps(&self) -> f64 {
        self.write_mbps * self.read_write_ratio
    }

    fn validate(&self) -> Result<()> {
        if self.write_mbps <= 0.0 || self.read_write_ratio <= 0.0 || self.memory_copy_mbps <= 0.0 {
            return Err(SpeedError::ConfigError(
                "Estimated throughputs must be positive".to_string(),
            ));
        }
        if !(0.0..100.0).contains(&self.progress_threshold) {
            return Err(SpeedError::ConfigError(
                "Progress threshold must be a percentage below 100".to_string(),
            ));
        }
        Ok(())
    }
}

impl ScoreWeights {
    fn validate(&self) -> Result<()> {
        if self.sequential_mb < 0.0 || self.random_mb < 0.0 || self.sequential_mb + self.random_mb <= 0.0 {
            return Err(SpeedError::ConfigError(
                "Score weights must be non-negative and not both zero".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_is_valid() {
        SuiteConfig::default().validate().unwrap();
        SuiteConfig::quick().validate().unwrap();
    }

    #[test]
    fn test_toml_round_trip_uses_readable_durations() {
        let config = SuiteConfig::quick().with_purge_mode(PurgeMode::Always);
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("random_time_cap = \"2s\""));
        assert!(toml_str.contains("purge_mode = \"always\""));

        let parsed: SuiteConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: SuiteConfig = toml::from_str(
            "file_size = 1048576\n[purge]\nscratch_write_duration = \"1s 500ms\"\n",
        )
        .unwrap();
        assert_eq!(parsed.file_size, MIB);
        assert_eq!(parsed.random_block_size, 4 * KIB);
        assert_eq!(parsed.purge.scratch_write_duration, Duration::from_millis(1500));
        assert_eq!(parsed.purge.reserve_blocks, 3);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let cases = [
            SuiteConfig::default().with_file_size(0),
            SuiteConfig::default().with_random_block_size(0),
            SuiteConfig::default().with_sequential_block_size(2048 * MIB),
            SuiteConfig::default().with_random_block_size(1000),
            SuiteConfig::default().with_random_time_cap(Duration::ZERO),
            SuiteConfig {
                normalization_threshold: 0.0,
                ..SuiteConfig::default()
            },
            SuiteConfig {
                warm_up_fraction: 1.0,
                ..SuiteConfig::default()
            },
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(SpeedError::ConfigError(_))),
                "{:?} should be rejected",
                config
            );
        }

        // unaligned blocks are fine for buffered I/O
        SuiteConfig::default()
            .with_random_block_size(1000)
            .with_bypass_cache(false)
            .validate()
            .unwrap();
    }

    #[test]
    fn test_save_and_load_from_path() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("nested").join(CONFIG_FILE);

        let config = SuiteConfig::quick().with_memory_copy(true);
        config.save_to(&path).unwrap();
        let loaded = SuiteConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE);
        fs::write(&path, "file_size = 0\n").unwrap();
        assert!(SuiteConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_config_file_path() {
        if let Ok(path) = SuiteConfig::config_file_path() {
            assert!(path.ends_with(Path::new(APP_NAME).join(CONFIG_FILE)));
        }
    }
}
