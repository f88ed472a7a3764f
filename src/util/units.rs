//! Units formatting and conversion utilities
//!
//! Throughput is expressed in MB/s where one MB is 2^20 bytes.

use std::time::Duration;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Format bytes into a human-readable size
///
/// # Examples
/// ```
/// use speedmeter::util::units::format_bytes;
///
/// assert_eq!(format_bytes(4096), "4.0 KiB");
/// assert_eq!(format_bytes(16 * 1024 * 1024), "16.0 MiB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["KiB", "MiB", "GiB", "TiB"];

    if bytes < KIB {
        return format!("{} B", bytes);
    }

    let mut size = bytes as f64 / KIB as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", size, UNITS[unit])
}

/// Throughput in MB/s for `bytes` moved in `duration`, or 0 for a zero duration
///
/// # Examples
/// ```
/// use std::time::Duration;
/// use speedmeter::util::units::calculate_throughput_mbps;
///
/// let throughput = calculate_throughput_mbps(4 * 1024 * 1024, Duration::from_millis(100));
/// assert!((throughput - 40.0).abs() < 1e-9);
/// ```
pub fn calculate_throughput_mbps(bytes: u64, duration: Duration) -> f64 {
    if duration.is_zero() {
        return 0.0;
    }
    bytes as f64 / MIB as f64 / duration.as_secs_f64()
}

/// Raw sample rate in MB/s. A zero duration yields `f64::INFINITY`, which the
/// sampler discards.
pub(crate) fn sample_rate_mbps(bytes: u64, duration: Duration) -> f64 {
    bytes as f64 / MIB as f64 / duration.as_secs_f64()
}

/// Format a throughput value
///
/// # Examples
/// ```
/// use speedmeter::util::units::format_throughput;
///
/// assert_eq!(format_throughput(41.25), "41.25 MB/s");
/// assert_eq!(format_throughput(2048.0), "2.00 GB/s");
/// ```
pub fn format_throughput(mbps: f64) -> String {
    if mbps >= 1024.0 {
        format!("{:.2} GB/s", mbps / 1024.0)
    } else {
        format!("{:.2} MB/s", mbps)
    }
}

/// Format a remaining-time estimate, rounded to whole seconds
pub fn format_remaining(remaining: Duration) -> String {
    let rounded = Duration::from_secs(remaining.as_secs_f64().round() as u64);
    if rounded.is_zero() {
        return "0s".to_string();
    }
    humantime::format_duration(rounded).to_string()
}
