pub mod fat;
pub mod mount;

pub use fat::{format_volume, FatFile, FatType, FatVolume, FormatOptions, OpenOptions, VolumeStats};
pub use mount::{BoxedDevice, FatDriver};
