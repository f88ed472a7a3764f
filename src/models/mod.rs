//! Data models
//!
//! Throughput samples collected by trials and the report built from a suite.

pub mod report;
pub mod sampler;

pub use report::{RawSample, StorageInfo, SuiteReport, SystemInfo, TrialSummary};
pub use sampler::{SampleStats, ThroughputSampler};
