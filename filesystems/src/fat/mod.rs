// FAT16/FAT32 driver
// On-disk structures, the FAT sector cache, the name codec and the
// volume-level file and directory operations built on top of them.

pub mod boot_sector;
pub mod chain;
pub mod constants;
pub mod dir_entry;
pub mod directory;
pub mod file;
pub mod format;
pub mod fsinfo;
pub mod layout;
pub mod names;
pub mod table;
pub mod volume;

pub use boot_sector::{BootSector, ExtendedBootSector};
pub use dir_entry::{DirEntry, LongNameEntry};
pub use directory::{DirLocation, DirRecord, Directory};
pub use file::{FatFile, OpenOptions};
pub use format::{format_volume, FormatOptions};
pub use layout::{FatLayout, FatType, Geometry, RootDir};
pub use names::{checksum, generate_short_name, ShortName};
pub use volume::{FatVolume, VolumeStats};
