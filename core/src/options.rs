use serde::{Deserialize, Serialize};

pub const FS_FAT_MOUNT_READONLY: u32 = 0x0000_0000;
pub const FS_FAT_MOUNT_READWRITE: u32 = 0x0000_0001;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MountFlags {
    ReadOnly,
    ReadWrite,
}

impl MountFlags {
    /// Decode the raw flag word used by the hosting glue. Unknown bits are ignored.
    pub fn from_bits(bits: u32) -> Self {
        if bits & FS_FAT_MOUNT_READWRITE != 0 {
            MountFlags::ReadWrite
        } else {
            MountFlags::ReadOnly
        }
    }

    pub fn bits(&self) -> u32 {
        match self {
            MountFlags::ReadOnly => FS_FAT_MOUNT_READONLY,
            MountFlags::ReadWrite => FS_FAT_MOUNT_READWRITE,
        }
    }

    pub fn is_writable(&self) -> bool {
        *self == MountFlags::ReadWrite
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountOptions {
    pub flags: MountFlags,
    /// Also write every FAT sector update to the backup FAT copies.
    pub mirror_fat_copies: bool,
    /// Refuse volumes whose cluster count contradicts the FAT16/FAT32 discriminator.
    pub strict_fat_type: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            flags: MountFlags::ReadWrite,
            mirror_fat_copies: false,
            strict_fat_type: false,
        }
    }
}

impl MountOptions {
    pub fn read_only() -> Self {
        Self {
            flags: MountFlags::ReadOnly,
            ..Self::default()
        }
    }
}

impl From<MountFlags> for MountOptions {
    fn from(flags: MountFlags) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }
}
