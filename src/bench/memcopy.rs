//! Memory copy baseline: block copies into a RAM arena, no storage involved.

use std::io;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::SeedableRng;

use super::plan::AccessPlan;
use super::sequential::unprepared;
use super::status::TrialKind;
use super::trial::{display_name, Workload};
use crate::io::buffer::{try_alloc_vec, AlignedBuffer, AllocError};
use crate::io::memory::{free_memory_or_default, system_memory_query, FreeMemoryFn};
use crate::{Result, SpeedError};

/// Share of free memory the destination arena may occupy
const ARENA_MEMORY_RATIO: f64 = 0.5;

const MIN_TIMED: Duration = Duration::from_nanos(1);

/// Copies one pseudo-random source block into consecutive slots of a
/// destination arena, wrapping around when the arena is smaller than the
/// total traffic.
pub struct MemoryCopy {
    block_size: u64,
    total_blocks: u64,
    free_memory: FreeMemoryFn,
    source: Option<AlignedBuffer>,
    destination: Option<Vec<u8>>,
    slots: u64,
    cursor: u64,
}

impl MemoryCopy {
    pub fn new(block_size: u64, total_blocks: u64) -> Result<Self> {
        if block_size == 0 {
            return Err(SpeedError::InvalidParameter(
                "block size must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            block_size,
            total_blocks,
            free_memory: system_memory_query(),
            source: None,
            destination: None,
            slots: 0,
            cursor: 0,
        })
    }

    pub fn with_free_memory(mut self, query: FreeMemoryFn) -> Self {
        self.free_memory = query;
        self
    }

    /// Number of blocks the destination arena holds for the current free
    /// memory
    pub fn arena_blocks(&self) -> u64 {
        let budget = (free_memory_or_default(&self.free_memory) as f64 * ARENA_MEMORY_RATIO) as u64;
        (budget / self.block_size).clamp(1, self.total_blocks.max(1))
    }
}

impl Workload for MemoryCopy {
    fn name(&self) -> String {
        display_name(self.kind(), self.block_size)
    }

    fn kind(&self) -> TrialKind {
        TrialKind::MemoryCopy
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn prepare(&mut self) -> std::result::Result<(), AllocError> {
        let mut rng = SmallRng::from_entropy();
        let source = AlignedBuffer::random(self.block_size, &mut rng)?;

        let slots = self.arena_blocks();
        let bytes = slots.checked_mul(self.block_size).ok_or(AllocError {
            requested: u64::MAX,
        })?;
        let destination = try_alloc_vec(bytes)?;
        tracing::debug!("Memory copy arena: {} blocks ({} bytes)", slots, bytes);

        self.source = Some(source);
        self.destination = Some(destination);
        self.slots = slots;
        self.cursor = 0;
        Ok(())
    }

    fn plan(&mut self) -> Result<AccessPlan> {
        Ok(AccessPlan::sequential(self.block_size, self.total_blocks))
    }

    fn planned_bytes(&self) -> Option<u64> {
        Some(self.block_size * self.total_blocks)
    }

    fn records_positions(&self) -> bool {
        false
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn perform(&mut self, _offset: u64) -> io::Result<Duration> {
        let source = self.source.as_deref().ok_or_else(unprepared)?;
        let destination = self.destination.as_deref_mut().ok_or_else(unprepared)?;

        let len = source.len();
        let start_at = (self.cursor % self.slots) as usize * len;
        let start = Instant::now();
        destination[start_at..start_at + len].copy_from_slice(source);
        // a coarse clock can read zero for one small copy
        let elapsed = start.elapsed().max(MIN_TIMED);
        self.cursor += 1;
        Ok(elapsed)
    }

    fn release(&mut self) {
        self.source = None;
        self.destination = None;
    }
}
