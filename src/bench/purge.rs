//! Active eviction of cached file data.
//!
//! Where the platform offers no reliable way to open a file uncached, the
//! data a write trial just produced is still in RAM when the read trial
//! starts. The purger pushes it out by writing a disposable scratch file
//! and then claiming most of the free physical memory for a moment.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

use crate::config::PurgeSettings;
use crate::io::buffer::try_alloc_vec;
use crate::io::disk::{ByteChannel, FileChannel};
use crate::io::memory::{free_memory_or_default, release_freed_memory, system_memory_query, FreeMemoryFn};

/// What a purge managed to do before it finished or was cancelled
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PurgeReport {
    pub reserve_blocks: usize,
    pub scratch_bytes_written: u64,
    pub memory_blocks: usize,
    /// Largest number of bytes held at once
    pub peak_bytes_held: u64,
    pub elapsed: Duration,
    pub cancelled: bool,
}

/// Evicts cached file pages by scratch writes and memory pressure
#[derive(Clone)]
pub struct CachePurger {
    scratch_path: PathBuf,
    settings: PurgeSettings,
    free_memory: FreeMemoryFn,
}

impl CachePurger {
    /// Purger writing its scratch file at `scratch_path`, which should be on
    /// the volume under test
    pub fn new(scratch_path: PathBuf, settings: PurgeSettings) -> Self {
        Self {
            scratch_path,
            settings,
            free_memory: system_memory_query(),
        }
    }

    pub fn with_free_memory(mut self, query: FreeMemoryFn) -> Self {
        self.free_memory = query;
        self
    }

    /// Run one purge session. Allocation or scratch failures shorten the
    /// purge but never fail it.
    pub fn purge(&self, is_cancelled: &dyn Fn() -> bool) -> PurgeReport {
        let started = Instant::now();
        let mut report = PurgeReport::default();

        if is_cancelled() {
            report.cancelled = true;
            return report;
        }

        let mut session = PurgeSession::default();
        self.allocate_reserve(&mut session, &mut report);
        self.write_scratch(&mut session, &mut report, is_cancelled);
        self.apply_memory_pressure(&mut session, &mut report, is_cancelled);

        report.cancelled = is_cancelled();
        drop(session);
        release_freed_memory();

        report.elapsed = started.elapsed();
        tracing::debug!(
            "Cache purge finished in {:?}: {} scratch bytes, {} memory blocks, peak {} bytes",
            report.elapsed,
            report.scratch_bytes_written,
            report.memory_blocks,
            report.peak_bytes_held
        );
        report
    }

    fn allocate_reserve(&self, session: &mut PurgeSession, report: &mut PurgeReport) {
        let mut rng = SmallRng::from_entropy();
        for _ in 0..self.settings.reserve_blocks {
            match try_alloc_vec(self.settings.reserve_block_size) {
                Ok(mut block) => {
                    rng.fill_bytes(&mut block);
                    session.hold_reserve(block);
                }
                Err(e) => {
                    tracing::debug!("Purge reserve allocation stopped: {}", e);
                    break;
                }
            }
        }
        report.reserve_blocks = session.reserve.len();
        report.peak_bytes_held = session.held_bytes;
    }

    fn write_scratch(&self, session: &mut PurgeSession, report: &mut PurgeReport, is_cancelled: &dyn Fn() -> bool) {
        if session.reserve.is_empty() {
            return;
        }

        let channel = match FileChannel::create_buffered(&self.scratch_path) {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(
                    "Cannot create purge scratch file {}: {}",
                    self.scratch_path.display(),
                    e
                );
                return;
            }
        };
        let scratch = session.scratch.insert(ScratchFile {
            path: self.scratch_path.clone(),
            channel: Some(channel),
        });

        let deadline = Instant::now() + self.settings.scratch_write_duration;
        let mut index = 0;
        while Instant::now() < deadline && report.scratch_bytes_written < self.settings.scratch_file_limit {
            if is_cancelled() {
                break;
            }
            let block = &session.reserve[index % session.reserve.len()];
            if let Err(e) = scratch.write(block) {
                tracing::warn!("Purge scratch write failed: {}", e);
                break;
            }
            report.scratch_bytes_written += block.len() as u64;
            index += 1;
        }
    }

    fn apply_memory_pressure(&self, session: &mut PurgeSession, report: &mut PurgeReport, is_cancelled: &dyn Fn() -> bool) {
        let block_size = self.settings.memory_block_size;
        let ceiling = (free_memory_or_default(&self.free_memory) as f64 * self.settings.memory_ratio) as u64;

        while session.held_bytes.saturating_add(block_size) <= ceiling {
            if is_cancelled() {
                break;
            }

            match try_alloc_vec(block_size) {
                Ok(block) => session.hold(block),
                Err(e) => {
                    tracing::debug!("Purge memory allocation stopped: {}", e);
                    break;
                }
            }
            report.memory_blocks += 1;
            report.peak_bytes_held = report.peak_bytes_held.max(session.held_bytes);

            if let Some(free) = (self.free_memory)() {
                if free < self.settings.memory_floor {
                    tracing::debug!("Free memory {} below floor, stopping purge", free);
                    break;
                }
            }

            let pause = allocation_pause(self.settings.allocation_pause, session.held_bytes, ceiling);
            if !pause.is_zero() {
                thread::sleep(pause);
            }
        }
    }
}

/// Pause after an allocation, growing quadratically with the share of the
/// ceiling already held
fn allocation_pause(longest: Duration, held: u64, ceiling: u64) -> Duration {
    if ceiling == 0 {
        return longest;
    }
    let fill = held as f64 / ceiling as f64;
    longest.mul_f64((fill * fill).min(1.0))
}

impl std::fmt::Debug for CachePurger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePurger")
            .field("scratch_path", &self.scratch_path)
            .field("settings", &self.settings)
            .finish()
    }
}

/// Memory and scratch file held by one purge call
#[derive(Default)]
struct PurgeSession {
    reserve: Vec<Vec<u8>>,
    pressure: Vec<Vec<u8>>,
    held_bytes: u64,
    scratch: Option<ScratchFile>,
}

impl PurgeSession {
    fn hold_reserve(&mut self, block: Vec<u8>) {
        self.held_bytes += block.len() as u64;
        self.reserve.push(block);
    }

    fn hold(&mut self, block: Vec<u8>) {
        self.held_bytes += block.len() as u64;
        self.pressure.push(block);
    }
}

/// Scratch file removed when dropped
struct ScratchFile {
    path: PathBuf,
    channel: Option<FileChannel>,
}

impl ScratchFile {
    fn write(&mut self, block: &[u8]) -> std::io::Result<()> {
        match self.channel.as_mut() {
            Some(channel) => channel.write(block),
            None => Ok(()),
        }
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        // close before deleting
        self.channel.take();
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove scratch file {}: {}", self.path.display(), e);
        }
    }
}
