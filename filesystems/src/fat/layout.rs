// Volume layout derived from the boot sector
// FAT16 and FAT32 differ in entry width, end-of-chain marker and where the
// root directory lives; everything else is shared arithmetic.

use super::boot_sector::{BootSector, ExtendedBootSector};
use super::constants::*;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FatType {
    Fat16,
    Fat32,
}

impl fmt::Display for FatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatType::Fat16 => write!(f, "FAT16"),
            FatType::Fat32 => write!(f, "FAT32"),
        }
    }
}

/// Classify by cluster count using the standard 4085 / 65525 boundaries.
/// `None` means the count falls in the FAT12 range.
pub fn fat_type_for_cluster_count(clusters: u32) -> Option<FatType> {
    if clusters <= FAT12_MAX_CLUSTERS {
        None
    } else if clusters <= FAT16_MAX_CLUSTERS {
        Some(FatType::Fat16)
    } else {
        Some(FatType::Fat32)
    }
}

/// Where a directory's entries live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootDir {
    /// FAT16 root: a fixed run of sectors between the FATs and the data region
    Fixed { start_sector: u32, sectors: u32 },
    /// FAT32 root: an ordinary cluster chain
    Chain { cluster: u32 },
}

/// Per-variant behaviour of the allocation table
pub trait FatVariant {
    fn fat_type(&self) -> FatType;

    /// Bytes per FAT entry
    fn entry_width(&self) -> u32;

    /// Value written to terminate a chain
    fn end_of_chain(&self) -> u32;

    fn bad_cluster(&self) -> u32;

    /// Bits of an entry that carry the cluster value
    fn entry_mask(&self) -> u32;

    fn root_dir(&self) -> RootDir;

    /// First FAT byte index worth loading into the cache at mount
    fn warmup_index(&self) -> u32;

    fn is_end_of_chain(&self, value: u32) -> bool {
        (value & self.entry_mask()) >= (self.end_of_chain() & !0x7)
    }

    fn is_bad(&self, value: u32) -> bool {
        (value & self.entry_mask()) == self.bad_cluster()
    }

    /// Byte offset of a cluster's entry within the FAT region
    fn entry_offset(&self, cluster: u32) -> u32 {
        cluster * self.entry_width()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fat16Layout {
    pub root_dir_start: u32,
    pub root_dir_sectors: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fat32Layout {
    pub root_cluster: u32,
    pub fsinfo_sector: u16,
    pub backup_boot_sector: u16,
}

impl FatVariant for Fat16Layout {
    fn fat_type(&self) -> FatType {
        FatType::Fat16
    }

    fn entry_width(&self) -> u32 {
        2
    }

    fn end_of_chain(&self) -> u32 {
        FAT16_EOC_WRITE
    }

    fn bad_cluster(&self) -> u32 {
        FAT16_BAD
    }

    fn entry_mask(&self) -> u32 {
        0xFFFF
    }

    fn root_dir(&self) -> RootDir {
        RootDir::Fixed {
            start_sector: self.root_dir_start,
            sectors: self.root_dir_sectors,
        }
    }

    fn warmup_index(&self) -> u32 {
        self.entry_offset(FIRST_DATA_CLUSTER)
    }
}

impl FatVariant for Fat32Layout {
    fn fat_type(&self) -> FatType {
        FatType::Fat32
    }

    fn entry_width(&self) -> u32 {
        4
    }

    fn end_of_chain(&self) -> u32 {
        FAT32_EOC_WRITE
    }

    fn bad_cluster(&self) -> u32 {
        FAT32_BAD
    }

    fn entry_mask(&self) -> u32 {
        FAT32_MASK
    }

    fn root_dir(&self) -> RootDir {
        RootDir::Chain {
            cluster: self.root_cluster,
        }
    }

    fn warmup_index(&self) -> u32 {
        self.entry_offset(self.root_cluster)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatLayout {
    Fat16(Fat16Layout),
    Fat32(Fat32Layout),
}

impl FatLayout {
    fn variant(&self) -> &dyn FatVariant {
        match self {
            FatLayout::Fat16(l) => l,
            FatLayout::Fat32(l) => l,
        }
    }
}

impl FatVariant for FatLayout {
    fn fat_type(&self) -> FatType {
        self.variant().fat_type()
    }

    fn entry_width(&self) -> u32 {
        self.variant().entry_width()
    }

    fn end_of_chain(&self) -> u32 {
        self.variant().end_of_chain()
    }

    fn bad_cluster(&self) -> u32 {
        self.variant().bad_cluster()
    }

    fn entry_mask(&self) -> u32 {
        self.variant().entry_mask()
    }

    fn root_dir(&self) -> RootDir {
        self.variant().root_dir()
    }

    fn warmup_index(&self) -> u32 {
        self.variant().warmup_index()
    }
}

/// Sector arithmetic for a mounted volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub layout: FatLayout,
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub fat_start: u32,
    pub table_size: u32,
    pub table_count: u32,
    pub data_start: u32,
    pub total_data_sectors: u32,
    pub total_clusters: u32,
}

impl Geometry {
    pub fn derive(boot: &BootSector) -> Self {
        let layout = match &boot.extended {
            ExtendedBootSector::Fat16(_) => FatLayout::Fat16(Fat16Layout {
                root_dir_start: boot.root_dir_start(),
                root_dir_sectors: boot.root_dir_sectors(),
            }),
            ExtendedBootSector::Fat32(ext) => FatLayout::Fat32(Fat32Layout {
                root_cluster: ext.root_cluster,
                fsinfo_sector: ext.fs_info_sector,
                backup_boot_sector: ext.backup_boot_sector,
            }),
        };

        // data_region_start = root_dir_start + root_dir_sectors, with 0 root
        // sectors on FAT32
        let data_start = boot.data_region_start();
        let total_data_sectors = boot.total_sectors().saturating_sub(data_start);
        let sectors_per_cluster = boot.sectors_per_cluster as u32;

        Self {
            layout,
            bytes_per_sector: boot.bytes_per_sector as u32,
            sectors_per_cluster,
            fat_start: boot.reserved_sector_count as u32,
            table_size: boot.table_size(),
            table_count: boot.table_count as u32,
            data_start,
            total_data_sectors,
            total_clusters: total_data_sectors / sectors_per_cluster,
        }
    }

    pub fn fat_type(&self) -> FatType {
        self.layout.fat_type()
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    /// Highest valid cluster number (inclusive)
    pub fn max_cluster(&self) -> u32 {
        self.total_clusters + FIRST_DATA_CLUSTER - 1
    }

    pub fn is_valid_cluster(&self, cluster: u32) -> bool {
        cluster >= FIRST_DATA_CLUSTER && cluster <= self.max_cluster()
    }

    /// First sector of a data cluster
    pub fn cluster_to_sector(&self, cluster: u32) -> u32 {
        self.data_start + (cluster - FIRST_DATA_CLUSTER) * self.sectors_per_cluster
    }

    pub fn entries_per_sector(&self) -> u32 {
        self.bytes_per_sector / DIR_ENTRY_SIZE as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fat::boot_sector::tests::fat16_boot_sector;

    #[test]
    fn test_fat16_layout() {
        let geo = Geometry::derive(&fat16_boot_sector());

        assert_eq!(geo.fat_type(), FatType::Fat16);
        assert_eq!(geo.layout.entry_width(), 2);
        assert_eq!(geo.fat_start, 1);
        assert_eq!(
            geo.layout.root_dir(),
            RootDir::Fixed { start_sector: 65, sectors: 32 }
        );
        assert_eq!(geo.data_start, 97);
        assert_eq!(geo.total_data_sectors, 32768 - 97);
        assert_eq!(geo.total_clusters, (32768 - 97) / 4);
        assert_eq!(geo.layout.warmup_index(), 4);
        assert_eq!(geo.cluster_to_sector(2), 97);
        assert_eq!(geo.cluster_to_sector(3), 101);
    }

    #[test]
    fn test_end_of_chain_detection() {
        let fat16 = Fat16Layout { root_dir_start: 0, root_dir_sectors: 0 };
        assert!(fat16.is_end_of_chain(0xFFF8));
        assert!(fat16.is_end_of_chain(0xFFFF));
        assert!(!fat16.is_end_of_chain(0xFFF7));
        assert!(fat16.is_bad(0xFFF7));
        assert!(!fat16.is_end_of_chain(0x1234));

        let fat32 = Fat32Layout { root_cluster: 2, fsinfo_sector: 1, backup_boot_sector: 6 };
        assert!(fat32.is_end_of_chain(0x0FFF_FFF8));
        assert!(fat32.is_end_of_chain(0xFFFF_FFFF)); // reserved top bits ignored
        assert!(!fat32.is_end_of_chain(0x0000_FFF8));
        assert_eq!(fat32.warmup_index(), 8);
    }

    #[test]
    fn test_cluster_count_classification() {
        assert_eq!(fat_type_for_cluster_count(4084), None);
        assert_eq!(fat_type_for_cluster_count(4085), Some(FatType::Fat16));
        assert_eq!(fat_type_for_cluster_count(65524), Some(FatType::Fat16));
        assert_eq!(fat_type_for_cluster_count(65525), Some(FatType::Fat32));
    }
}
