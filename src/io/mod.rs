//! I/O module
//!
//! The raw byte channel the trials drive, its file-backed and simulated
//! implementations, fallible buffer allocation and the free-memory query.

pub mod buffer;
pub mod disk;
pub mod memory;
pub mod simulated;

pub use buffer::{AlignedBuffer, AllocError};
pub use disk::{ByteChannel, FileChannel, TestFile};
pub use memory::{system_memory_query, FreeMemoryFn, DEFAULT_MEMORY_CAPACITY};
pub use simulated::SimulatedChannel;
