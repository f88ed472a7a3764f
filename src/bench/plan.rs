//! Access plans: the ordered byte offsets a trial visits.
//!
//! Random plans are shuffled permutations without repetition. A block that
//! was read once may still sit in the OS cache, so visiting it again would
//! measure RAM instead of the device.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::{Result, SpeedError};

/// Default maximum number of offsets in a random plan
pub const DEFAULT_RANDOM_PLAN_CAP: u64 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessPlan {
    /// `blocks` consecutive blocks starting at offset 0
    Sequential { block_size: u64, blocks: u64 },
    /// Explicit shuffled offsets
    Random { offsets: Vec<u64> },
}

impl AccessPlan {
    pub fn sequential(block_size: u64, blocks: u64) -> Self {
        AccessPlan::Sequential { block_size, blocks }
    }

    /// Shuffle every block-aligned offset of blocks `[min_block, max_block)`,
    /// keeping at most `cap` of them from the start of the range.
    pub fn random<R: Rng + ?Sized>(
        min_block: u64,
        max_block: u64,
        block_size: u64,
        cap: u64,
        rng: &mut R,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(SpeedError::InvalidParameter(
                "block size must be greater than 0".to_string(),
            ));
        }
        if min_block >= max_block {
            return Err(SpeedError::InvalidParameter(format!(
                "empty block range [{}, {})",
                min_block, max_block
            )));
        }
        if max_block.checked_mul(block_size).is_none() {
            return Err(SpeedError::InvalidParameter(
                "block range exceeds addressable offsets".to_string(),
            ));
        }

        let count = (max_block - min_block).min(cap);
        let mut offsets: Vec<u64> = (min_block..min_block + count)
            .map(|block| block * block_size)
            .collect();
        offsets.shuffle(rng);

        tracing::debug!(
            "Random plan: {} offsets from blocks [{}, {})",
            offsets.len(),
            min_block,
            max_block
        );
        Ok(AccessPlan::Random { offsets })
    }

    pub fn len(&self) -> u64 {
        match self {
            AccessPlan::Sequential { blocks, .. } => *blocks,
            AccessPlan::Random { offsets } => offsets.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offset of the `index`-th visit
    pub fn offset(&self, index: u64) -> Option<u64> {
        match self {
            AccessPlan::Sequential { block_size, blocks } => {
                (index < *blocks).then(|| index * block_size)
            }
            AccessPlan::Random { offsets } => usize::try_from(index)
                .ok()
                .and_then(|i| offsets.get(i).copied()),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len()).filter_map(move |i| self.offset(i))
    }
}
