//! Utility functions module
//!
//! Helpers for unit conversion and human-readable formatting of sizes,
//! rates and remaining time.

pub mod units;

pub use units::{
    calculate_throughput_mbps, format_bytes, format_remaining, format_throughput, MIB,
};
