//! speedmeter - storage throughput benchmark
//!
//! Measures sequential and random read/write throughput of a storage device
//! while working against the operating system's file cache: shuffled access
//! plans never revisit a block, read trials can be preceded by an active cache
//! purge, and the reported averages are robust to cache-hit outliers.

pub mod bench;
pub mod cancel;
pub mod config;
pub mod io;
pub mod models;
pub mod util;

pub use bench::{Suite, Trial, TrialKind, TrialStatus, TrialUpdate};
pub use cancel::CancellationToken;
pub use config::SuiteConfig;
pub use models::ThroughputSampler;

/// Errors produced by the benchmark engine.
#[derive(Debug, thiserror::Error)]
pub enum SpeedError {
    /// I/O operation failed outside of a timed trial
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    /// I/O failure on the path under test while a trial was running
    #[error("{trial} [{block_size} B blocks] failed: {source}")]
    TrialIo {
        trial: String,
        block_size: u64,
        #[source]
        source: std::io::Error,
    },
    /// Invalid trial or plan construction parameters
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    /// Configuration validation or parsing error
    #[error("Configuration error: {0}")]
    ConfigError(String),
    /// Benchmark execution error
    #[error("Benchmark error: {0}")]
    BenchmarkError(String),
    /// Samples with and without positions were mixed in one trial
    #[error("Sample position mismatch: {0}")]
    PositionMismatch(String),
    /// Aggregate scores were requested before every trial completed
    #[error("Scores unavailable: {0}")]
    ScoresUnavailable(String),
    /// Test file creation or cleanup failed
    #[error("Temporary file error: {0}")]
    TempFileError(String),
    /// Background worker failed or panicked
    #[error("Worker error: {0}")]
    WorkerError(String),
}

impl From<serde_json::Error> for SpeedError {
    fn from(err: serde_json::Error) -> Self {
        SpeedError::ConfigError(format!("JSON serialization error: {}", err))
    }
}

impl From<toml::de::Error> for SpeedError {
    fn from(err: toml::de::Error) -> Self {
        SpeedError::ConfigError(format!("TOML parsing error: {}", err))
    }
}

impl From<toml::ser::Error> for SpeedError {
    fn from(err: toml::ser::Error) -> Self {
        SpeedError::ConfigError(format!("TOML serialization error: {}", err))
    }
}

/// Result type alias for speedmeter operations
pub type Result<T> = std::result::Result<T, SpeedError>;

pub const APP_NAME: &str = "speedmeter";
pub const CONFIG_FILE: &str = "speedmeter.toml";
pub const TEST_FILE_NAME: &str = "SPEEDMETER_TEST.dat";
pub const SCRATCH_FILE_NAME: &str = "SPEEDMETER_SCRATCH.dat";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trial_io_error_carries_context() {
        let err = SpeedError::TrialIo {
            trial: "Sequential write".to_string(),
            block_size: 4096,
            source: std::io::Error::new(std::io::ErrorKind::Other, "device gone"),
        };
        let msg = err.to_string();
        assert!(msg.contains("Sequential write"));
        assert!(msg.contains("4096"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_toml_error_maps_to_config_error() {
        let err: SpeedError = toml::from_str::<SuiteConfig>("file_size = \"nope\"")
            .unwrap_err()
            .into();
        assert!(matches!(err, SpeedError::ConfigError(_)));
    }
}
