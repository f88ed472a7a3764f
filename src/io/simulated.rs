//! In-memory [`ByteChannel`] with configurable latency.
//!
//! No data is stored: reads return zeros and writes are discarded, so the
//! channel can report arbitrarily large lengths. Every read or write logs the
//! offset it started at, which lets tests verify access plans.

use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::disk::ByteChannel;

/// Simulated storage device
#[derive(Debug, Clone)]
pub struct SimulatedChannel {
    len: u64,
    position: u64,
    latency: Duration,
    bypass: bool,
    fail_after: Option<usize>,
    operations: usize,
    log: Arc<Mutex<Vec<u64>>>,
}

impl SimulatedChannel {
    pub fn new(len: u64) -> Self {
        Self {
            len,
            position: 0,
            latency: Duration::ZERO,
            bypass: false,
            fail_after: None,
            operations: 0,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Sleep for `latency` inside every read and write
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Report the channel as bypassing the OS cache
    pub fn with_cache_bypass(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    /// Fail every read or write after the first `operations` succeeded
    pub fn fail_after(mut self, operations: usize) -> Self {
        self.fail_after = Some(operations);
        self
    }

    /// Shared handle to the offsets of all reads and writes so far
    pub fn offset_log(&self) -> Arc<Mutex<Vec<u64>>> {
        Arc::clone(&self.log)
    }

    fn transfer(&mut self, len: usize) -> io::Result<usize> {
        if let Some(limit) = self.fail_after {
            if self.operations >= limit {
                return Err(io::Error::new(io::ErrorKind::Other, "simulated device failure"));
            }
        }
        self.operations += 1;

        if let Ok(mut log) = self.log.lock() {
            log.push(self.position);
        }
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }

        let available = self.len.saturating_sub(self.position);
        let moved = (len as u64).min(available);
        self.position += moved;
        Ok(moved as usize)
    }
}

impl ByteChannel for SimulatedChannel {
    fn seek(&mut self, offset: u64) -> io::Result<u64> {
        self.position = offset;
        Ok(offset)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let moved = self.transfer(buf.len())?;
        buf[..moved].fill(0);
        Ok(moved)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let end = self.position.saturating_add(buf.len() as u64);
        self.transfer(buf.len())?;
        // writes past the end extend the device like a file would
        self.len = self.len.max(end);
        self.position = end;
        Ok(())
    }

    fn flush(&mut self, _force: bool) -> io::Result<()> {
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.len)
    }

    fn position(&mut self) -> io::Result<u64> {
        Ok(self.position)
    }

    fn bypasses_cache(&self) -> bool {
        self.bypass
    }
}
