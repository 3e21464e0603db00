pub mod device;
pub mod error;
pub mod options;

pub use device::{BlockDevice, FileBlockDevice, IoStats, MemoryBlockDevice, DEFAULT_BLOCK_SIZE};
pub use error::{FatError, FatResult};
pub use options::{MountFlags, MountOptions};
