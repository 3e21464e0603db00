// FAT on-disk constants shared between FAT16 and FAT32

// Boot sector offsets
pub const BS_JMP_BOOT: usize = 0x00;
pub const BS_OEM_NAME: usize = 0x03;
pub const BPB_BYTES_PER_SEC: usize = 0x0B;
pub const BPB_SEC_PER_CLUS: usize = 0x0D;
pub const BPB_RSVD_SEC_CNT: usize = 0x0E;
pub const BPB_NUM_FATS: usize = 0x10;
pub const BPB_ROOT_ENT_CNT: usize = 0x11;
pub const BPB_TOT_SEC16: usize = 0x13;
pub const BPB_MEDIA: usize = 0x15;
pub const BPB_FAT_SZ16: usize = 0x16;
pub const BPB_SEC_PER_TRK: usize = 0x18;
pub const BPB_NUM_HEADS: usize = 0x1A;
pub const BPB_HIDD_SEC: usize = 0x1C;
pub const BPB_TOT_SEC32: usize = 0x20;

// FAT16 extended boot sector (starts at 36)
pub const BS16_DRV_NUM: usize = 0x24;
pub const BS16_BOOT_SIG: usize = 0x26;
pub const BS16_VOL_ID: usize = 0x27;
pub const BS16_VOL_LAB: usize = 0x2B;
pub const BS16_FIL_SYS_TYPE: usize = 0x36;

// FAT32 extended boot sector (starts at 36)
pub const BPB_FAT_SZ32: usize = 0x24;
pub const BPB_EXT_FLAGS: usize = 0x28;
pub const BPB_FS_VER: usize = 0x2A;
pub const BPB_ROOT_CLUS: usize = 0x2C;
pub const BPB_FS_INFO: usize = 0x30;
pub const BPB_BK_BOOT_SEC: usize = 0x32;
pub const BS32_DRV_NUM: usize = 0x40;
pub const BS32_BOOT_SIG: usize = 0x42;
pub const BS32_VOL_ID: usize = 0x43;
pub const BS32_VOL_LAB: usize = 0x47;
pub const BS32_FIL_SYS_TYPE: usize = 0x52;

// Boot sector signature
pub const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
pub const BOOT_SIGNATURE_OFFSET: usize = 0x1FE;
pub const BOOT_SECTOR_SIZE: usize = 512;

// FSInfo sector (FAT32 only)
pub const FSI_LEAD_SIG: u32 = 0x4161_5252;
pub const FSI_STRUC_SIG: u32 = 0x6141_7272;
pub const FSI_TRAIL_SIG: u32 = 0xAA55_0000;
pub const FSI_LEAD_SIG_OFFSET: usize = 0;
pub const FSI_STRUC_SIG_OFFSET: usize = 484;
pub const FSI_FREE_COUNT_OFFSET: usize = 488;
pub const FSI_NXT_FREE_OFFSET: usize = 492;
pub const FSI_TRAIL_SIG_OFFSET: usize = 508;
pub const FSI_UNKNOWN: u32 = 0xFFFF_FFFF;

// FAT entry values
pub const FAT_FREE: u32 = 0x0000_0000;
pub const FAT16_EOC: u32 = 0xFFF8; // End of chain marker
pub const FAT16_EOC_WRITE: u32 = 0xFFFF;
pub const FAT16_BAD: u32 = 0xFFF7; // Bad cluster marker
pub const FAT32_EOC: u32 = 0x0FFF_FFF8; // End of chain marker (28 bits)
pub const FAT32_EOC_WRITE: u32 = 0x0FFF_FFFF;
pub const FAT32_BAD: u32 = 0x0FFF_FFF7; // Bad cluster marker (28 bits)
pub const FAT32_MASK: u32 = 0x0FFF_FFFF;

// First usable cluster index; 0 and 1 are reserved
pub const FIRST_DATA_CLUSTER: u32 = 2;

// Cluster count thresholds
pub const FAT12_MAX_CLUSTERS: u32 = 4084;
pub const FAT16_MIN_CLUSTERS: u32 = 4085;
pub const FAT16_MAX_CLUSTERS: u32 = 65524;
pub const FAT32_MIN_CLUSTERS: u32 = 65525;

// Directory entries
pub const DIR_ENTRY_SIZE: usize = 32;
pub const DIR_ENTRY_FREE: u8 = 0xE5; // Deleted entry
pub const DIR_ENTRY_END: u8 = 0x00; // This and all following entries are free
pub const DIR_ENTRY_KANJI_E5: u8 = 0x05; // Stored in place of a leading 0xE5

// Long filename entries
pub const LFN_CHARS_PER_ENTRY: usize = 13;
pub const LFN_LAST_ENTRY: u8 = 0x40;
pub const LFN_ORDER_MASK: u8 = 0x1F;
pub const LFN_MAX_CHARS: usize = 255;
pub const LFN_MAX_ENTRIES: usize = 20; // ceil(255 / 13)

// Standard values
pub const STANDARD_BYTES_PER_SECTOR: u16 = 512;
pub const FAT32_ROOT_CLUSTER: u32 = 2;
pub const FAT32_FS_INFO_SECTOR: u16 = 1;
pub const FAT32_BACKUP_BOOT_SECTOR: u16 = 6;
pub const FAT16_DEFAULT_ROOT_ENTRIES: u16 = 512;

// Media descriptors
pub const MEDIA_FIXED: u8 = 0xF8;
pub const MEDIA_REMOVABLE: u8 = 0xF0;
