//! Random benchmark operations
//!
//! Random read and write trials visit a shuffled plan of block-aligned
//! offsets, each at most once, and are time-boxed: progress reaches 100%
//! when either the plan is exhausted or the time cap has elapsed.

use std::io;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::plan::{AccessPlan, DEFAULT_RANDOM_PLAN_CAP};
use super::sequential::{read_block, unprepared};
use super::status::TrialKind;
use super::trial::{display_name, Workload};
use crate::io::buffer::{AlignedBuffer, AllocError};
use crate::io::disk::ByteChannel;
use crate::util::units::MIB;
use crate::{Result, SpeedError};

/// Default size of the random write source arena
pub const DEFAULT_WRITE_ARENA: u64 = 128 * MIB;

/// Block range, plan cap and randomness shared by both random trials
struct RandomAccess {
    block_size: u64,
    min_block: u64,
    max_block: u64,
    plan_cap: u64,
    time_cap: Duration,
    rng: SmallRng,
}

impl RandomAccess {
    fn new<C: ByteChannel>(channel: &C, block_size: u64, time_cap: Duration) -> Result<Self> {
        if block_size == 0 {
            return Err(SpeedError::InvalidParameter(
                "block size must be greater than 0".to_string(),
            ));
        }
        if time_cap.is_zero() {
            return Err(SpeedError::InvalidParameter(
                "time cap must be greater than 0".to_string(),
            ));
        }
        let len = channel.len()?;

        Ok(Self {
            block_size,
            min_block: 0,
            max_block: len / block_size,
            plan_cap: DEFAULT_RANDOM_PLAN_CAP,
            time_cap,
            rng: SmallRng::from_entropy(),
        })
    }

    fn set_block_range(&mut self, min_block: u64, max_block: u64) -> Result<()> {
        let available = self.max_block;
        if min_block >= max_block || max_block > available {
            return Err(SpeedError::InvalidParameter(format!(
                "block range [{}, {}) outside [0, {})",
                min_block, max_block, available
            )));
        }
        self.min_block = min_block;
        self.max_block = max_block;
        Ok(())
    }

    fn plan(&mut self) -> Result<AccessPlan> {
        if self.max_block == 0 {
            // channel shorter than one block
            return Ok(AccessPlan::Random { offsets: Vec::new() });
        }
        AccessPlan::random(
            self.min_block,
            self.max_block,
            self.block_size,
            self.plan_cap,
            &mut self.rng,
        )
    }
}

/// Reads single blocks at shuffled offsets
pub struct RandomRead<C> {
    channel: C,
    access: RandomAccess,
    buffer: Option<AlignedBuffer>,
}

impl<C: ByteChannel> RandomRead<C> {
    /// Random reads over the whole channel, time-boxed to `time_cap`
    pub fn new(channel: C, block_size: u64, time_cap: Duration) -> Result<Self> {
        let access = RandomAccess::new(&channel, block_size, time_cap)?;
        Ok(Self {
            channel,
            access,
            buffer: None,
        })
    }

    /// Restrict offsets to blocks `[min_block, max_block)`
    pub fn with_block_range(mut self, min_block: u64, max_block: u64) -> Result<Self> {
        self.access.set_block_range(min_block, max_block)?;
        Ok(self)
    }

    pub fn with_plan_cap(mut self, cap: u64) -> Self {
        self.access.plan_cap = cap.max(1);
        self
    }

    /// Make the access plan reproducible
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.access.rng = SmallRng::seed_from_u64(seed);
        self
    }
}

impl<C: ByteChannel> Workload for RandomRead<C> {
    fn name(&self) -> String {
        display_name(self.kind(), self.access.block_size)
    }

    fn kind(&self) -> TrialKind {
        TrialKind::RandomRead
    }

    fn block_size(&self) -> u64 {
        self.access.block_size
    }

    fn prepare(&mut self) -> std::result::Result<(), AllocError> {
        self.buffer = Some(AlignedBuffer::random(self.access.block_size, &mut self.access.rng)?);
        Ok(())
    }

    fn plan(&mut self) -> Result<AccessPlan> {
        self.access.plan()
    }

    fn time_cap(&self) -> Option<Duration> {
        Some(self.access.time_cap)
    }

    fn planned_bytes(&self) -> Option<u64> {
        None
    }

    fn bypasses_cache(&self) -> bool {
        self.channel.bypasses_cache()
    }

    fn rewind(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn perform(&mut self, offset: u64) -> io::Result<Duration> {
        let buffer = self.buffer.as_deref_mut().ok_or_else(unprepared)?;
        let start = Instant::now();
        self.channel.seek(offset)?;
        read_block(&mut self.channel, buffer)?;
        Ok(start.elapsed())
    }

    fn release(&mut self) {
        self.buffer = None;
    }
}

/// Writes blocks at shuffled offsets.
///
/// Each write takes the next block of a pseudo-random arena and changes one
/// random byte of it first, so no two consecutive writes carry the same
/// payload.
pub struct RandomWrite<C> {
    channel: C,
    access: RandomAccess,
    arena_size: u64,
    flush: bool,
    arena: Option<AlignedBuffer>,
    arena_blocks: u64,
    writes: u64,
}

impl<C: ByteChannel> RandomWrite<C> {
    /// Random writes over the whole channel, time-boxed to `time_cap`
    pub fn new(channel: C, block_size: u64, time_cap: Duration) -> Result<Self> {
        let access = RandomAccess::new(&channel, block_size, time_cap)?;
        Ok(Self {
            channel,
            access,
            arena_size: DEFAULT_WRITE_ARENA,
            flush: false,
            arena: None,
            arena_blocks: 0,
            writes: 0,
        })
    }

    /// Restrict offsets to blocks `[min_block, max_block)`
    pub fn with_block_range(mut self, min_block: u64, max_block: u64) -> Result<Self> {
        self.access.set_block_range(min_block, max_block)?;
        Ok(self)
    }

    pub fn with_plan_cap(mut self, cap: u64) -> Self {
        self.access.plan_cap = cap.max(1);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.access.rng = SmallRng::seed_from_u64(seed);
        self
    }

    /// Size of the source arena; at least one block is always allocated
    pub fn with_arena_size(mut self, bytes: u64) -> Self {
        self.arena_size = bytes;
        self
    }

    /// Force every block to the device before stopping the timer
    pub fn with_flush(mut self, flush: bool) -> Self {
        self.flush = flush;
        self
    }
}

impl<C: ByteChannel> Workload for RandomWrite<C> {
    fn name(&self) -> String {
        display_name(self.kind(), self.access.block_size)
    }

    fn kind(&self) -> TrialKind {
        TrialKind::RandomWrite
    }

    fn block_size(&self) -> u64 {
        self.access.block_size
    }

    fn prepare(&mut self) -> std::result::Result<(), AllocError> {
        let block_size = self.access.block_size;
        let blocks = (self.arena_size / block_size).max(1);
        let bytes = blocks.checked_mul(block_size).ok_or(AllocError {
            requested: u64::MAX,
        })?;
        self.arena = Some(AlignedBuffer::random(bytes, &mut self.access.rng)?);
        self.arena_blocks = blocks;
        self.writes = 0;
        Ok(())
    }

    fn plan(&mut self) -> Result<AccessPlan> {
        self.access.plan()
    }

    fn time_cap(&self) -> Option<Duration> {
        Some(self.access.time_cap)
    }

    fn planned_bytes(&self) -> Option<u64> {
        None
    }

    fn bypasses_cache(&self) -> bool {
        self.channel.bypasses_cache()
    }

    fn rewind(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn perform(&mut self, offset: u64) -> io::Result<Duration> {
        let block_size = self.access.block_size as usize;
        let arena = self.arena.as_deref_mut().ok_or_else(unprepared)?;

        let slot = (self.writes % self.arena_blocks) as usize;
        let block = &mut arena[slot * block_size..(slot + 1) * block_size];
        let index = self.access.rng.gen_range(0..block_size);
        block[index] = self.access.rng.gen();
        self.writes += 1;

        let start = Instant::now();
        self.channel.seek(offset)?;
        self.channel.write(block)?;
        if self.flush {
            self.channel.flush(true)?;
        }
        Ok(start.elapsed())
    }

    fn release(&mut self) {
        self.arena = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::{Trial, TrialStatus};
    use crate::io::simulated::SimulatedChannel;
    use std::collections::HashSet;

    const CAP: Duration = Duration::from_secs(30);

    #[test]
    fn test_construction_errors() {
        assert!(RandomRead::new(SimulatedChannel::new(4096), 0, CAP).is_err());
        assert!(RandomWrite::new(SimulatedChannel::new(4096), 4096, Duration::ZERO).is_err());
        assert!(RandomRead::new(SimulatedChannel::new(8192), 4096, CAP)
            .unwrap()
            .with_block_range(1, 3)
            .is_err());
    }

    #[test]
    fn test_channel_shorter_than_a_block_is_empty() {
        let mut read = Trial::new(RandomRead::new(SimulatedChannel::new(1024), 4096, CAP).unwrap());
        assert!(read.execute().unwrap().is_empty());
        assert_eq!(read.status(), TrialStatus::Completed);

        let mut write = Trial::new(
            RandomWrite::new(SimulatedChannel::new(0), 4096, CAP)
                .unwrap()
                .with_arena_size(4096),
        );
        assert!(write.execute().unwrap().is_empty());
        assert_eq!(write.status(), TrialStatus::Completed);
    }

    #[test]
    fn test_read_buffer_is_pseudo_random() {
        let mut read = RandomRead::new(SimulatedChannel::new(8 * 4096), 4096, CAP)
            .unwrap()
            .with_seed(3);
        read.prepare().unwrap();
        assert!(read.buffer.as_deref().unwrap().iter().any(|&b| b != 0));
    }

    #[test]
    fn test_random_read_visits_each_block_once() {
        let channel = SimulatedChannel::new(1024 * 1024);
        let log = channel.offset_log();
        let read = RandomRead::new(channel, 4096, CAP).unwrap().with_seed(11);
        let mut trial = Trial::new(read);

        let result = trial.execute().unwrap();
        assert_eq!(trial.status(), TrialStatus::Completed);
        assert_eq!(result.len(), 256);

        let offsets = log.lock().unwrap().clone();
        let unique: HashSet<u64> = offsets.iter().copied().collect();
        assert_eq!(offsets.len(), 256);
        assert_eq!(unique.len(), 256);
        let recorded: HashSet<u64> = result.positioned().map(|(_, p)| p).collect();
        assert_eq!(recorded, unique);
    }

    #[test]
    fn test_block_range_limits_offsets() {
        let channel = SimulatedChannel::new(64 * 4096);
        let log = channel.offset_log();
        let read = RandomRead::new(channel, 4096, CAP)
            .unwrap()
            .with_block_range(8, 16)
            .unwrap();
        Trial::new(read).execute().unwrap();

        let offsets = log.lock().unwrap().clone();
        assert_eq!(offsets.len(), 8);
        assert!(offsets.iter().all(|o| (8 * 4096..16 * 4096).contains(o)));
    }

    #[test]
    fn test_time_cap_ends_trial_early() {
        let channel = SimulatedChannel::new(1024 * 4096).with_latency(Duration::from_millis(5));
        let read = RandomRead::new(channel, 4096, Duration::from_millis(100)).unwrap();
        let mut trial = Trial::new(read);

        let result = trial.execute().unwrap();
        assert_eq!(trial.status(), TrialStatus::Completed);
        assert!(result.len() < 1024);
        assert!(!result.is_empty());
    }

    #[test]
    fn test_random_write_mutates_payload() {
        let channel = SimulatedChannel::new(32 * 4096);
        let mut write = RandomWrite::new(channel, 4096, CAP)
            .unwrap()
            .with_arena_size(2 * 4096)
            .with_seed(5);

        write.prepare().unwrap();
        let before = write.arena.as_deref().unwrap().to_vec();
        write.perform(0).unwrap();
        write.perform(4096).unwrap();
        write.perform(8192).unwrap();
        let after = write.arena.as_deref().unwrap().to_vec();

        assert_eq!(write.arena_blocks, 2);
        assert_eq!(write.writes, 3);
        // a mutated byte may coincide with its old value, but not three times in a row
        assert_ne!(before, after);
    }

    #[test]
    fn test_random_write_plan_cap() {
        let channel = SimulatedChannel::new(1024 * 4096);
        let log = channel.offset_log();
        let write = RandomWrite::new(channel, 4096, CAP)
            .unwrap()
            .with_plan_cap(100)
            .with_arena_size(4096);
        let result = Trial::new(write).execute().unwrap();

        assert_eq!(result.len(), 100);
        assert_eq!(log.lock().unwrap().len(), 100);
    }
}
