// Boot sector (BPB) decoding and encoding for FAT16 and FAT32
// Field offsets follow the on-disk layout; see constants.rs

use super::constants::*;
use byteorder::{ByteOrder, LittleEndian};
use fat2fs_core::{FatError, FatResult};
use log::{debug, warn};

/// FAT16 extended boot sector fields (offset 0x24)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fat16Extended {
    pub drive_number: u8,
    pub boot_signature: u8,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
    pub fs_type: [u8; 8],
}

/// FAT32 extended boot sector fields (offset 0x24)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fat32Extended {
    pub table_size_32: u32,
    pub ext_flags: u16,
    pub fs_version: u16,
    pub root_cluster: u32,
    pub fs_info_sector: u16,
    pub backup_boot_sector: u16,
    pub drive_number: u8,
    pub boot_signature: u8,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
    pub fs_type: [u8; 8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendedBootSector {
    Fat16(Fat16Extended),
    Fat32(Fat32Extended),
}

/// Decoded geometry of a FAT volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootSector {
    pub jump_boot: [u8; 3],
    pub oem_name: [u8; 8],
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sector_count: u16,
    pub table_count: u8,
    pub root_entry_count: u16,
    pub total_sectors_16: u16,
    pub media_type: u8,
    pub table_size_16: u16,
    pub sectors_per_track: u16,
    pub head_count: u16,
    pub hidden_sectors: u32,
    pub total_sectors_32: u32,
    pub extended: ExtendedBootSector,
}

fn array<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}

impl BootSector {
    /// Decode a boot sector. `bytes` must be exactly one 512-byte sector.
    pub fn parse(bytes: &[u8]) -> FatResult<Self> {
        if bytes.len() != BOOT_SECTOR_SIZE {
            return Err(FatError::InvalidBootSector(format!(
                "expected {} bytes, got {}",
                BOOT_SECTOR_SIZE,
                bytes.len()
            )));
        }

        if bytes[BOOT_SIGNATURE_OFFSET..BOOT_SIGNATURE_OFFSET + 2] != BOOT_SIGNATURE {
            warn!(
                "Boot sector signature missing ({:02X} {:02X})",
                bytes[BOOT_SIGNATURE_OFFSET],
                bytes[BOOT_SIGNATURE_OFFSET + 1]
            );
        }

        let table_size_16 = LittleEndian::read_u16(&bytes[BPB_FAT_SZ16..]);

        // table_size_16 is the only FAT16/FAT32 discriminator.
        let extended = if table_size_16 > 0 {
            ExtendedBootSector::Fat16(Fat16Extended {
                drive_number: bytes[BS16_DRV_NUM],
                boot_signature: bytes[BS16_BOOT_SIG],
                volume_id: LittleEndian::read_u32(&bytes[BS16_VOL_ID..]),
                volume_label: array(bytes, BS16_VOL_LAB),
                fs_type: array(bytes, BS16_FIL_SYS_TYPE),
            })
        } else {
            ExtendedBootSector::Fat32(Fat32Extended {
                table_size_32: LittleEndian::read_u32(&bytes[BPB_FAT_SZ32..]),
                ext_flags: LittleEndian::read_u16(&bytes[BPB_EXT_FLAGS..]),
                fs_version: LittleEndian::read_u16(&bytes[BPB_FS_VER..]),
                root_cluster: LittleEndian::read_u32(&bytes[BPB_ROOT_CLUS..]),
                fs_info_sector: LittleEndian::read_u16(&bytes[BPB_FS_INFO..]),
                backup_boot_sector: LittleEndian::read_u16(&bytes[BPB_BK_BOOT_SEC..]),
                drive_number: bytes[BS32_DRV_NUM],
                boot_signature: bytes[BS32_BOOT_SIG],
                volume_id: LittleEndian::read_u32(&bytes[BS32_VOL_ID..]),
                volume_label: array(bytes, BS32_VOL_LAB),
                fs_type: array(bytes, BS32_FIL_SYS_TYPE),
            })
        };

        let boot = BootSector {
            jump_boot: array(bytes, BS_JMP_BOOT),
            oem_name: array(bytes, BS_OEM_NAME),
            bytes_per_sector: LittleEndian::read_u16(&bytes[BPB_BYTES_PER_SEC..]),
            sectors_per_cluster: bytes[BPB_SEC_PER_CLUS],
            reserved_sector_count: LittleEndian::read_u16(&bytes[BPB_RSVD_SEC_CNT..]),
            table_count: bytes[BPB_NUM_FATS],
            root_entry_count: LittleEndian::read_u16(&bytes[BPB_ROOT_ENT_CNT..]),
            total_sectors_16: LittleEndian::read_u16(&bytes[BPB_TOT_SEC16..]),
            media_type: bytes[BPB_MEDIA],
            table_size_16,
            sectors_per_track: LittleEndian::read_u16(&bytes[BPB_SEC_PER_TRK..]),
            head_count: LittleEndian::read_u16(&bytes[BPB_NUM_HEADS..]),
            hidden_sectors: LittleEndian::read_u32(&bytes[BPB_HIDD_SEC..]),
            total_sectors_32: LittleEndian::read_u32(&bytes[BPB_TOT_SEC32..]),
            extended,
        };

        boot.validate()?;
        Ok(boot)
    }

    /// Field sanity checks
    pub fn validate(&self) -> FatResult<()> {
        let bps = self.bytes_per_sector;
        if bps < 128 || !bps.is_power_of_two() {
            return Err(FatError::InvalidBootSector(format!(
                "bytes per sector {} is not a power of two >= 128",
                bps
            )));
        }

        let spc = self.sectors_per_cluster;
        if spc == 0 || !spc.is_power_of_two() {
            return Err(FatError::InvalidBootSector(format!(
                "sectors per cluster {} is not a power of two >= 1",
                spc
            )));
        }

        if self.table_count == 0 {
            return Err(FatError::InvalidBootSector("number of FATs cannot be 0".to_string()));
        }

        if self.reserved_sector_count == 0 {
            return Err(FatError::InvalidBootSector("reserved sector count cannot be 0".to_string()));
        }

        match (self.total_sectors_16, self.total_sectors_32) {
            (0, 0) => {
                return Err(FatError::InvalidBootSector("total sector count is 0".to_string()));
            }
            (a, b) if a != 0 && b != 0 => {
                warn!("Both total sector fields set ({} / {}), using the 16-bit one", a, b);
            }
            _ => {}
        }

        if let ExtendedBootSector::Fat32(ext) = &self.extended {
            if ext.table_size_32 == 0 {
                return Err(FatError::InvalidBootSector("FAT size is 0".to_string()));
            }
            if ext.root_cluster < FIRST_DATA_CLUSTER {
                return Err(FatError::InvalidBootSector(format!(
                    "root cluster {} is reserved",
                    ext.root_cluster
                )));
            }
        }

        let data_start = self.checked_data_region_start().ok_or_else(|| {
            FatError::InvalidBootSector(format!(
                "{} FATs of {} sectors overflow the sector address space",
                self.table_count,
                self.table_size()
            ))
        })?;
        if data_start >= self.total_sectors() {
            return Err(FatError::InvalidBootSector(format!(
                "metadata ({} sectors) fills the whole volume ({} sectors)",
                data_start,
                self.total_sectors()
            )));
        }

        Ok(())
    }

    pub fn is_fat32(&self) -> bool {
        matches!(self.extended, ExtendedBootSector::Fat32(_))
    }

    /// Whichever total-sectors field is populated (16-bit wins)
    pub fn total_sectors(&self) -> u32 {
        if self.total_sectors_16 != 0 {
            self.total_sectors_16 as u32
        } else {
            self.total_sectors_32
        }
    }

    /// Sectors per FAT copy, from the authoritative field for the FAT type
    pub fn table_size(&self) -> u32 {
        match &self.extended {
            ExtendedBootSector::Fat16(_) => self.table_size_16 as u32,
            ExtendedBootSector::Fat32(ext) => ext.table_size_32,
        }
    }

    /// Sectors occupied by the fixed root directory (0 on FAT32)
    pub fn root_dir_sectors(&self) -> u32 {
        let bps = self.bytes_per_sector as u32;
        (self.root_entry_count as u32 * DIR_ENTRY_SIZE as u32 + (bps - 1)) / bps
    }

    /// First sector after the reserved area and all FAT copies
    pub fn root_dir_start(&self) -> u32 {
        self.reserved_sector_count as u32 + self.table_count as u32 * self.table_size()
    }

    pub fn data_region_start(&self) -> u32 {
        self.root_dir_start() + self.root_dir_sectors()
    }

    fn checked_data_region_start(&self) -> Option<u32> {
        (self.table_count as u32)
            .checked_mul(self.table_size())?
            .checked_add(self.reserved_sector_count as u32)?
            .checked_add(self.root_dir_sectors())
    }

    pub fn volume_label(&self) -> String {
        let label = match &self.extended {
            ExtendedBootSector::Fat16(ext) => &ext.volume_label,
            ExtendedBootSector::Fat32(ext) => &ext.volume_label,
        };
        String::from_utf8_lossy(label).trim_end().to_string()
    }

    /// Encode back into a 512-byte sector (boot code area left zeroed)
    pub fn to_bytes(&self) -> [u8; BOOT_SECTOR_SIZE] {
        let mut b = [0u8; BOOT_SECTOR_SIZE];
        b[BS_JMP_BOOT..BS_JMP_BOOT + 3].copy_from_slice(&self.jump_boot);
        b[BS_OEM_NAME..BS_OEM_NAME + 8].copy_from_slice(&self.oem_name);
        LittleEndian::write_u16(&mut b[BPB_BYTES_PER_SEC..], self.bytes_per_sector);
        b[BPB_SEC_PER_CLUS] = self.sectors_per_cluster;
        LittleEndian::write_u16(&mut b[BPB_RSVD_SEC_CNT..], self.reserved_sector_count);
        b[BPB_NUM_FATS] = self.table_count;
        LittleEndian::write_u16(&mut b[BPB_ROOT_ENT_CNT..], self.root_entry_count);
        LittleEndian::write_u16(&mut b[BPB_TOT_SEC16..], self.total_sectors_16);
        b[BPB_MEDIA] = self.media_type;
        LittleEndian::write_u16(&mut b[BPB_FAT_SZ16..], self.table_size_16);
        LittleEndian::write_u16(&mut b[BPB_SEC_PER_TRK..], self.sectors_per_track);
        LittleEndian::write_u16(&mut b[BPB_NUM_HEADS..], self.head_count);
        LittleEndian::write_u32(&mut b[BPB_HIDD_SEC..], self.hidden_sectors);
        LittleEndian::write_u32(&mut b[BPB_TOT_SEC32..], self.total_sectors_32);

        match &self.extended {
            ExtendedBootSector::Fat16(ext) => {
                b[BS16_DRV_NUM] = ext.drive_number;
                b[BS16_BOOT_SIG] = ext.boot_signature;
                LittleEndian::write_u32(&mut b[BS16_VOL_ID..], ext.volume_id);
                b[BS16_VOL_LAB..BS16_VOL_LAB + 11].copy_from_slice(&ext.volume_label);
                b[BS16_FIL_SYS_TYPE..BS16_FIL_SYS_TYPE + 8].copy_from_slice(&ext.fs_type);
            }
            ExtendedBootSector::Fat32(ext) => {
                LittleEndian::write_u32(&mut b[BPB_FAT_SZ32..], ext.table_size_32);
                LittleEndian::write_u16(&mut b[BPB_EXT_FLAGS..], ext.ext_flags);
                LittleEndian::write_u16(&mut b[BPB_FS_VER..], ext.fs_version);
                LittleEndian::write_u32(&mut b[BPB_ROOT_CLUS..], ext.root_cluster);
                LittleEndian::write_u16(&mut b[BPB_FS_INFO..], ext.fs_info_sector);
                LittleEndian::write_u16(&mut b[BPB_BK_BOOT_SEC..], ext.backup_boot_sector);
                b[BS32_DRV_NUM] = ext.drive_number;
                b[BS32_BOOT_SIG] = ext.boot_signature;
                LittleEndian::write_u32(&mut b[BS32_VOL_ID..], ext.volume_id);
                b[BS32_VOL_LAB..BS32_VOL_LAB + 11].copy_from_slice(&ext.volume_label);
                b[BS32_FIL_SYS_TYPE..BS32_FIL_SYS_TYPE + 8].copy_from_slice(&ext.fs_type);
            }
        }

        b[BOOT_SIGNATURE_OFFSET..BOOT_SIGNATURE_OFFSET + 2].copy_from_slice(&BOOT_SIGNATURE);
        b
    }

    pub fn log_geometry(&self) {
        debug!("OEM name: {}", String::from_utf8_lossy(&self.oem_name));
        debug!("Bytes per sector: {}", self.bytes_per_sector);
        debug!("Sectors per cluster: {}", self.sectors_per_cluster);
        debug!("Reserved sectors: {}", self.reserved_sector_count);
        debug!("Number of FATs: {}", self.table_count);
        debug!("Root entries: {}", self.root_entry_count);
        debug!("Total sectors: {}", self.total_sectors());
        debug!("Media descriptor: 0x{:02X}", self.media_type);
        debug!("Sectors per FAT: {}", self.table_size());
        if let ExtendedBootSector::Fat32(ext) = &self.extended {
            debug!("Root cluster: {}", ext.root_cluster);
            debug!("FSInfo sector: {}", ext.fs_info_sector);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn fat16_boot_sector() -> BootSector {
        BootSector {
            jump_boot: [0xEB, 0x3C, 0x90],
            oem_name: *b"MSWIN4.1",
            bytes_per_sector: 512,
            sectors_per_cluster: 4,
            reserved_sector_count: 1,
            table_count: 2,
            root_entry_count: 512,
            total_sectors_16: 32768,
            media_type: MEDIA_FIXED,
            table_size_16: 32,
            sectors_per_track: 63,
            head_count: 255,
            hidden_sectors: 0,
            total_sectors_32: 0,
            extended: ExtendedBootSector::Fat16(Fat16Extended {
                drive_number: 0x80,
                boot_signature: 0x29,
                volume_id: 0x1234_5678,
                volume_label: *b"TESTVOL    ",
                fs_type: *b"FAT16   ",
            }),
        }
    }

    #[test]
    fn test_fat16_geometry() {
        let bytes = fat16_boot_sector().to_bytes();
        let boot = BootSector::parse(&bytes).unwrap();

        assert!(!boot.is_fat32());
        assert_eq!(boot.root_dir_start(), 65);
        assert_eq!(boot.root_dir_sectors(), 32);
        assert_eq!(boot.data_region_start(), 97);
        assert_eq!(boot.total_sectors(), 32768);
        assert_eq!(boot.volume_label(), "TESTVOL");
    }

    #[test]
    fn test_fat32_extended_fields() {
        let mut boot = fat16_boot_sector();
        boot.table_size_16 = 0;
        boot.root_entry_count = 0;
        boot.total_sectors_16 = 0;
        boot.total_sectors_32 = 600_000;
        boot.reserved_sector_count = 32;
        boot.extended = ExtendedBootSector::Fat32(Fat32Extended {
            table_size_32: 4600,
            ext_flags: 0,
            fs_version: 0,
            root_cluster: 2,
            fs_info_sector: 1,
            backup_boot_sector: 6,
            drive_number: 0x80,
            boot_signature: 0x29,
            volume_id: 7,
            volume_label: *b"NO NAME    ",
            fs_type: *b"FAT32   ",
        });

        let parsed = BootSector::parse(&boot.to_bytes()).unwrap();
        assert!(parsed.is_fat32());
        assert_eq!(parsed.table_size(), 4600);
        assert_eq!(parsed.root_dir_sectors(), 0);
        assert_eq!(parsed.root_dir_start(), 32 + 2 * 4600);
        match parsed.extended {
            ExtendedBootSector::Fat32(ext) => {
                assert_eq!(ext.root_cluster, 2);
                assert_eq!(ext.fs_info_sector, 1);
            }
            _ => panic!("expected FAT32 extension"),
        }
    }

    #[test]
    fn test_rejects_bad_bytes_per_sector() {
        let mut bytes = fat16_boot_sector().to_bytes();
        LittleEndian::write_u16(&mut bytes[BPB_BYTES_PER_SEC..], 500);
        assert!(matches!(BootSector::parse(&bytes), Err(FatError::InvalidBootSector(_))));

        LittleEndian::write_u16(&mut bytes[BPB_BYTES_PER_SEC..], 64);
        assert!(matches!(BootSector::parse(&bytes), Err(FatError::InvalidBootSector(_))));
    }

    #[test]
    fn test_rejects_bad_sectors_per_cluster() {
        let mut bytes = fat16_boot_sector().to_bytes();
        bytes[BPB_SEC_PER_CLUS] = 3;
        assert!(matches!(BootSector::parse(&bytes), Err(FatError::InvalidBootSector(_))));

        bytes[BPB_SEC_PER_CLUS] = 0;
        assert!(matches!(BootSector::parse(&bytes), Err(FatError::InvalidBootSector(_))));
    }

    #[test]
    fn test_rejects_oversized_fat() {
        let mut boot = fat16_boot_sector();
        boot.table_size_16 = 0;
        boot.root_entry_count = 0;
        boot.total_sectors_16 = 0;
        boot.total_sectors_32 = 100_000;
        boot.extended = ExtendedBootSector::Fat32(Fat32Extended {
            table_size_32: 0xFFFF_FFF0,
            ext_flags: 0,
            fs_version: 0,
            root_cluster: 2,
            fs_info_sector: 1,
            backup_boot_sector: 6,
            drive_number: 0x80,
            boot_signature: 0x29,
            volume_id: 7,
            volume_label: *b"NO NAME    ",
            fs_type: *b"FAT32   ",
        });

        let result = BootSector::parse(&boot.to_bytes());
        assert!(matches!(result, Err(FatError::InvalidBootSector(_))));
    }

    #[test]
    fn test_rejects_short_buffer() {
        let bytes = fat16_boot_sector().to_bytes();
        assert!(BootSector::parse(&bytes[..511]).is_err());
    }

    #[test]
    fn test_rejects_blank_sector() {
        let bytes = [0u8; 512];
        assert!(matches!(BootSector::parse(&bytes), Err(FatError::InvalidBootSector(_))));
    }
}
