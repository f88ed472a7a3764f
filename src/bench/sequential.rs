//! Sequential benchmark operations
//!
//! Sequential write and read trials walk the test file block by block from
//! offset 0. The channel position advances with every operation, so no seek
//! happens inside the timed region.

use std::io;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::SeedableRng;

use super::plan::AccessPlan;
use super::status::TrialKind;
use super::trial::{display_name, Workload};
use crate::io::buffer::{AlignedBuffer, AllocError};
use crate::io::disk::ByteChannel;
use crate::{Result, SpeedError};

/// Writes `total_blocks` pseudo-random blocks from the start of the channel.
/// Zero blocks is a valid, empty trial.
pub struct SequentialWrite<C> {
    channel: C,
    block_size: u64,
    total_blocks: u64,
    warm_up_blocks: u64,
    flush: bool,
    buffer: Option<AlignedBuffer>,
}

impl<C: ByteChannel> SequentialWrite<C> {
    pub fn new(channel: C, block_size: u64, total_blocks: u64) -> Result<Self> {
        if block_size == 0 {
            return Err(SpeedError::InvalidParameter(
                "block size must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            channel,
            block_size,
            total_blocks,
            warm_up_blocks: 0,
            flush: false,
            buffer: None,
        })
    }

    /// Precede measuring with `fraction` of the total blocks, rounded up
    pub fn with_warm_up(mut self, fraction: f64) -> Self {
        self.warm_up_blocks = (self.total_blocks as f64 * fraction.max(0.0)).ceil() as u64;
        self
    }

    /// Force every block to the device before stopping the timer
    pub fn with_flush(mut self, flush: bool) -> Self {
        self.flush = flush;
        self
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }
}

impl<C: ByteChannel> Workload for SequentialWrite<C> {
    fn name(&self) -> String {
        display_name(self.kind(), self.block_size)
    }

    fn kind(&self) -> TrialKind {
        TrialKind::SequentialWrite
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn prepare(&mut self) -> std::result::Result<(), AllocError> {
        let mut rng = SmallRng::from_entropy();
        self.buffer = Some(AlignedBuffer::random(self.block_size, &mut rng)?);
        Ok(())
    }

    fn plan(&mut self) -> Result<AccessPlan> {
        Ok(AccessPlan::sequential(self.block_size, self.total_blocks))
    }

    fn warm_up_blocks(&self) -> u64 {
        self.warm_up_blocks
    }

    fn planned_bytes(&self) -> Option<u64> {
        Some(self.block_size * self.total_blocks)
    }

    fn bypasses_cache(&self) -> bool {
        self.channel.bypasses_cache()
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.channel.seek(0).map(|_| ())
    }

    fn perform(&mut self, _offset: u64) -> io::Result<Duration> {
        let buffer = self.buffer.as_deref().ok_or_else(unprepared)?;
        let start = Instant::now();
        self.channel.write(buffer)?;
        if self.flush {
            self.channel.flush(true)?;
        }
        Ok(start.elapsed())
    }

    fn release(&mut self) {
        if self.flush {
            // leftovers only matter for buffered handles
            if let Err(e) = self.channel.flush(true) {
                tracing::warn!("Final flush failed: {}", e);
            }
        }
        self.buffer = None;
    }
}

/// Reads the channel block by block from the start
pub struct SequentialRead<C> {
    channel: C,
    block_size: u64,
    total_blocks: u64,
    buffer: Option<AlignedBuffer>,
}

impl<C: ByteChannel> SequentialRead<C> {
    /// Read every whole block the channel currently holds; a channel shorter
    /// than one block gives an empty trial
    pub fn new(channel: C, block_size: u64) -> Result<Self> {
        if block_size == 0 {
            return Err(SpeedError::InvalidParameter(
                "block size must be greater than 0".to_string(),
            ));
        }
        let len = channel.len()?;

        Ok(Self {
            channel,
            block_size,
            total_blocks: len / block_size,
            buffer: None,
        })
    }

    /// Read only the first `blocks` blocks
    pub fn with_total_blocks(mut self, blocks: u64) -> Result<Self> {
        if blocks > self.total_blocks {
            return Err(SpeedError::InvalidParameter(format!(
                "block count {} exceeds the {} blocks available",
                blocks, self.total_blocks
            )));
        }
        self.total_blocks = blocks;
        Ok(self)
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }
}

impl<C: ByteChannel> Workload for SequentialRead<C> {
    fn name(&self) -> String {
        display_name(self.kind(), self.block_size)
    }

    fn kind(&self) -> TrialKind {
        TrialKind::SequentialRead
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn prepare(&mut self) -> std::result::Result<(), AllocError> {
        let mut rng = SmallRng::from_entropy();
        self.buffer = Some(AlignedBuffer::random(self.block_size, &mut rng)?);
        Ok(())
    }

    fn plan(&mut self) -> Result<AccessPlan> {
        Ok(AccessPlan::sequential(self.block_size, self.total_blocks))
    }

    fn planned_bytes(&self) -> Option<u64> {
        Some(self.block_size * self.total_blocks)
    }

    fn bypasses_cache(&self) -> bool {
        self.channel.bypasses_cache()
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.channel.seek(0).map(|_| ())
    }

    fn perform(&mut self, _offset: u64) -> io::Result<Duration> {
        let buffer = self.buffer.as_deref_mut().ok_or_else(unprepared)?;
        let start = Instant::now();
        read_block(&mut self.channel, buffer)?;
        Ok(start.elapsed())
    }

    fn release(&mut self) {
        self.buffer = None;
    }
}

/// Fill `buffer` from the channel, tolerating short reads
pub(crate) fn read_block<C: ByteChannel + ?Sized>(channel: &mut C, buffer: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buffer.len() {
        match channel.read(&mut buffer[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("end of data after {} of {} bytes", filled, buffer.len()),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

pub(crate) fn unprepared() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "buffer used before prepare")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::{Trial, TrialStatus};
    use crate::io::simulated::SimulatedChannel;
    use crate::util::units::MIB;

    #[test]
    fn test_construction_errors() {
        assert!(matches!(
            SequentialWrite::new(SimulatedChannel::new(0), 0, 4),
            Err(SpeedError::InvalidParameter(_))
        ));
        assert!(SequentialRead::new(SimulatedChannel::new(4096), 0).is_err());
    }

    #[test]
    fn test_read_block_count_from_length() {
        let read = SequentialRead::new(SimulatedChannel::new(10 * 4096 + 100), 4096).unwrap();
        assert_eq!(read.total_blocks(), 10);
        assert!(read.with_total_blocks(11).is_err());

        let short = SequentialRead::new(SimulatedChannel::new(1024), 4096).unwrap();
        assert_eq!(short.total_blocks(), 0);
    }

    #[test]
    fn test_zero_blocks_complete_empty() {
        let channel = SimulatedChannel::new(0);
        let log = channel.offset_log();
        let write = SequentialWrite::new(channel, 4096, 0).unwrap().with_warm_up(0.05);
        let mut trial = Trial::new(write);

        let result = trial.execute().unwrap();
        assert_eq!(trial.status(), TrialStatus::Completed);
        assert!(result.is_empty());
        assert!(log.lock().unwrap().is_empty());

        let mut read = Trial::new(SequentialRead::new(SimulatedChannel::new(0), 4096).unwrap());
        assert!(read.execute().unwrap().is_empty());
        assert_eq!(read.status(), TrialStatus::Completed);
    }

    #[test]
    fn test_read_buffer_is_pseudo_random() {
        let mut read = SequentialRead::new(SimulatedChannel::new(4 * 4096), 4096).unwrap();
        read.prepare().unwrap();
        let buffer = read.buffer.as_deref().unwrap();
        assert!(buffer.iter().any(|&b| b != 0));
    }

    #[test]
    fn test_warm_up_rounds_up() {
        let write = SequentialWrite::new(SimulatedChannel::new(0), 4096, 30)
            .unwrap()
            .with_warm_up(0.05);
        assert_eq!(write.warm_up_blocks(), 2);
    }

    #[test]
    fn test_sequential_write_visits_blocks_in_order() {
        let channel = SimulatedChannel::new(0);
        let log = channel.offset_log();
        let write = SequentialWrite::new(channel, MIB, 8).unwrap().with_warm_up(0.25);
        let mut trial = Trial::new(write);

        let result = trial.execute().unwrap();
        assert_eq!(trial.status(), TrialStatus::Completed);
        assert_eq!(result.len(), 8);

        let offsets = log.lock().unwrap().clone();
        // two warm-up blocks, then the measured pass from offset 0
        let mut expected = vec![0, MIB];
        expected.extend((0..8).map(|b| b * MIB));
        assert_eq!(offsets, expected);
        let positions: Vec<u64> = result.positioned().map(|(_, p)| p).collect();
        assert_eq!(positions, (0..8).map(|b| b * MIB).collect::<Vec<_>>());
    }

    #[test]
    fn test_sequential_read_whole_channel() {
        let channel = SimulatedChannel::new(16 * 4096);
        let log = channel.offset_log();
        let mut trial = Trial::new(SequentialRead::new(channel, 4096).unwrap());

        let result = trial.execute().unwrap();
        assert_eq!(result.len(), 16);
        assert_eq!(log.lock().unwrap().len(), 16);
    }

    #[test]
    fn test_read_past_end_is_an_error() {
        let mut channel = SimulatedChannel::new(4096);
        let mut buf = vec![0u8; 4096];
        channel.seek(2048).unwrap();
        let err = read_block(&mut channel, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
