// FAT16 / FAT32 formatter
// Lays out reserved area, FAT copies, root directory and (FAT32) the
// FSInfo and backup boot sectors on a block device. The boot sector goes
// out last.

use super::boot_sector::{BootSector, ExtendedBootSector, Fat16Extended, Fat32Extended};
use super::constants::*;
use super::dir_entry::{attributes::ATTR_VOLUME_ID, DirEntry};
use super::fsinfo::FsInfo;
use super::layout::{fat_type_for_cluster_count, FatType};
use super::names::generate_short_name;
use byteorder::{ByteOrder, LittleEndian};
use chrono::{Local, Timelike};
use fat2fs_core::{BlockDevice, FatError, FatResult};
use log::{debug, info};
use serde::{Deserialize, Serialize};

/// Sectors written per device call while clearing regions
const ZERO_CHUNK_SECTORS: u32 = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatOptions {
    pub fat_type: FatType,
    pub volume_label: Option<String>,
    /// Chosen from the volume size when unset
    pub sectors_per_cluster: Option<u8>,
    /// FAT16 only
    pub root_entries: u16,
    pub table_count: u8,
    pub oem_name: String,
    pub removable: bool,
    /// Refuse layouts whose cluster count falls outside the FAT type's range
    pub enforce_cluster_limits: bool,
}

impl FormatOptions {
    pub fn fat16() -> Self {
        Self {
            fat_type: FatType::Fat16,
            volume_label: None,
            sectors_per_cluster: None,
            root_entries: FAT16_DEFAULT_ROOT_ENTRIES,
            table_count: 2,
            oem_name: "MSWIN4.1".to_string(),
            removable: false,
            enforce_cluster_limits: true,
        }
    }

    pub fn fat32() -> Self {
        Self {
            fat_type: FatType::Fat32,
            root_entries: 0,
            ..Self::fat16()
        }
    }
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self::fat16()
    }
}

/// Layout parameters computed for a volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatParams {
    pub fat_type: FatType,
    pub bytes_per_sector: u32,
    pub total_sectors: u32,
    pub reserved_sectors: u32,
    pub sectors_per_cluster: u32,
    pub table_size: u32,
    pub table_count: u32,
    pub root_entries: u32,
    pub root_dir_sectors: u32,
    pub total_clusters: u32,
}

impl FatParams {
    pub fn data_start(&self) -> u32 {
        self.reserved_sectors + self.table_count * self.table_size + self.root_dir_sectors
    }
}

/// Microsoft's recommended cluster sizes, in 512-byte sectors
fn default_sectors_per_cluster(fat_type: FatType, total_sectors: u32) -> u32 {
    match fat_type {
        FatType::Fat16 => match total_sectors {
            0..=32_680 => 2,          // <= 16MB
            32_681..=262_144 => 4,    // <= 128MB
            262_145..=524_288 => 8,   // <= 256MB
            524_289..=1_048_576 => 16, // <= 512MB
            1_048_577..=2_097_152 => 32, // <= 1GB
            2_097_153..=4_194_304 => 64, // <= 2GB
            _ => 128,
        },
        FatType::Fat32 => match total_sectors {
            0..=532_480 => 1,                // <= 260MB
            532_481..=16_777_216 => 8,       // <= 8GB
            16_777_217..=33_554_432 => 16,   // <= 16GB
            33_554_433..=67_108_864 => 32,   // <= 32GB
            _ => 64,
        },
    }
}

/// Smallest FAT that covers every cluster left once the FAT itself is
/// subtracted from the data region
fn table_size_for(
    total_sectors: u32,
    fixed_sectors: u32,
    table_count: u32,
    sectors_per_cluster: u32,
    entry_width: u32,
    bytes_per_sector: u32,
) -> u32 {
    let mut table_size = 1u32;
    loop {
        let data_start = fixed_sectors + table_count * table_size;
        let clusters = total_sectors.saturating_sub(data_start) / sectors_per_cluster;
        let bytes = (clusters as u64 + FIRST_DATA_CLUSTER as u64) * entry_width as u64;
        let needed = ((bytes + bytes_per_sector as u64 - 1) / bytes_per_sector as u64) as u32;
        if needed <= table_size {
            return table_size;
        }
        table_size = needed;
    }
}

pub fn calculate_params(total_sectors: u32, bytes_per_sector: u32, options: &FormatOptions) -> FatResult<FatParams> {
    if !bytes_per_sector.is_power_of_two() || !(512..=4096).contains(&bytes_per_sector) {
        return Err(FatError::InvalidInput(format!("unsupported sector size {}", bytes_per_sector)));
    }
    if options.table_count == 0 {
        return Err(FatError::InvalidInput("at least one FAT copy is required".to_string()));
    }

    let fat_type = options.fat_type;
    let (reserved_sectors, entry_width, root_entries) = match fat_type {
        FatType::Fat16 => {
            let per_sector = bytes_per_sector / DIR_ENTRY_SIZE as u32;
            let entries = (options.root_entries.max(1) as u32 + per_sector - 1) / per_sector * per_sector;
            (1, 2, entries)
        }
        FatType::Fat32 => (32, 4, 0),
    };
    let root_dir_sectors = (root_entries * DIR_ENTRY_SIZE as u32 + bytes_per_sector - 1) / bytes_per_sector;
    let table_count = options.table_count as u32;

    let candidates: Vec<u32> = match options.sectors_per_cluster {
        Some(spc) => {
            if spc == 0 || !spc.is_power_of_two() {
                return Err(FatError::InvalidInput(format!("invalid sectors per cluster {}", spc)));
            }
            vec![spc as u32]
        }
        None => {
            // Scale the 512-byte table to the real sector size, then shrink
            // until there are enough clusters.
            let scale = (bytes_per_sector / 512).max(1);
            let mut spc = (default_sectors_per_cluster(fat_type, total_sectors) / scale).max(1);
            let mut list = vec![spc];
            while spc > 1 {
                spc /= 2;
                list.push(spc);
            }
            list
        }
    };

    let mut last_count = 0;
    for sectors_per_cluster in candidates {
        let fixed = reserved_sectors + root_dir_sectors;
        let table_size = table_size_for(
            total_sectors,
            fixed,
            table_count,
            sectors_per_cluster,
            entry_width,
            bytes_per_sector,
        );
        let params = FatParams {
            fat_type,
            bytes_per_sector,
            total_sectors,
            reserved_sectors,
            sectors_per_cluster,
            table_size,
            table_count,
            root_entries,
            root_dir_sectors,
            total_clusters: 0,
        };
        let data_start = params.data_start();
        if data_start >= total_sectors {
            continue;
        }
        let total_clusters = (total_sectors - data_start) / sectors_per_cluster;
        last_count = total_clusters;

        let within_entry_range = match fat_type {
            FatType::Fat16 => total_clusters <= FAT16_MAX_CLUSTERS && table_size <= u16::MAX as u32,
            FatType::Fat32 => total_clusters <= FAT32_MASK - 16,
        };
        let within_limits = !options.enforce_cluster_limits
            || fat_type_for_cluster_count(total_clusters) == Some(fat_type);

        if total_clusters > 0 && within_entry_range && within_limits {
            return Ok(FatParams { total_clusters, ..params });
        }
    }

    Err(FatError::InvalidInput(format!(
        "{} sectors of {} bytes cannot hold a {} volume (best layout had {} clusters)",
        total_sectors, bytes_per_sector, fat_type, last_count
    )))
}

/// Volume serial derived from the current date and time
fn generate_volume_serial() -> u32 {
    let now = Local::now();
    let (date, time) = super::dir_entry::encode_datetime(&now);
    ((date as u32) << 16 | time as u32) ^ now.nanosecond()
}

fn label_bytes(label: Option<&str>) -> FatResult<[u8; 11]> {
    match label {
        Some(label) => Ok(*generate_short_name(&[], label, ATTR_VOLUME_ID)?.short_name.as_bytes()),
        None => Ok(*b"NO NAME    "),
    }
}

fn build_boot_sector(params: &FatParams, options: &FormatOptions, label: [u8; 11]) -> BootSector {
    let mut oem_name = [b' '; 8];
    for (dst, src) in oem_name.iter_mut().zip(options.oem_name.bytes()) {
        *dst = src;
    }
    let volume_id = generate_volume_serial();

    let (total_sectors_16, total_sectors_32) = match params.fat_type {
        FatType::Fat16 if params.total_sectors <= u16::MAX as u32 => (params.total_sectors as u16, 0),
        _ => (0, params.total_sectors),
    };

    let (jump_boot, table_size_16, extended) = match params.fat_type {
        FatType::Fat16 => (
            [0xEB, 0x3C, 0x90],
            params.table_size as u16,
            ExtendedBootSector::Fat16(Fat16Extended {
                drive_number: 0x80,
                boot_signature: 0x29,
                volume_id,
                volume_label: label,
                fs_type: *b"FAT16   ",
            }),
        ),
        FatType::Fat32 => (
            [0xEB, 0x58, 0x90],
            0,
            ExtendedBootSector::Fat32(Fat32Extended {
                table_size_32: params.table_size,
                ext_flags: 0,
                fs_version: 0,
                root_cluster: FAT32_ROOT_CLUSTER,
                fs_info_sector: FAT32_FS_INFO_SECTOR,
                backup_boot_sector: FAT32_BACKUP_BOOT_SECTOR,
                drive_number: 0x80,
                boot_signature: 0x29,
                volume_id,
                volume_label: label,
                fs_type: *b"FAT32   ",
            }),
        ),
    };

    BootSector {
        jump_boot,
        oem_name,
        bytes_per_sector: params.bytes_per_sector as u16,
        sectors_per_cluster: params.sectors_per_cluster as u8,
        reserved_sector_count: params.reserved_sectors as u16,
        table_count: params.table_count as u8,
        root_entry_count: params.root_entries as u16,
        total_sectors_16,
        media_type: if options.removable { MEDIA_REMOVABLE } else { MEDIA_FIXED },
        table_size_16,
        sectors_per_track: 63,
        head_count: 255,
        hidden_sectors: 0,
        total_sectors_32,
        extended,
    }
}

/// Write zeros over `count` sectors starting at `start`
fn zero_sectors<D: BlockDevice + ?Sized>(device: &mut D, start: u32, count: u32, bps: u32) -> FatResult<()> {
    let zeros = vec![0u8; (ZERO_CHUNK_SECTORS * bps) as usize];
    let mut sector = start;
    let end = start + count;
    while sector < end {
        let n = (end - sector).min(ZERO_CHUNK_SECTORS);
        device.write_blocks(sector as u64, n as usize, &zeros[..(n * bps) as usize])?;
        sector += n;
    }
    Ok(())
}

/// First FAT sector with the reserved entries filled in
fn first_fat_sector(params: &FatParams, media: u8) -> Vec<u8> {
    let mut sector = vec![0u8; params.bytes_per_sector as usize];
    match params.fat_type {
        FatType::Fat16 => {
            LittleEndian::write_u16(&mut sector[0..], 0xFF00 | media as u16);
            LittleEndian::write_u16(&mut sector[2..], FAT16_EOC_WRITE as u16);
        }
        FatType::Fat32 => {
            LittleEndian::write_u32(&mut sector[0..], 0x0FFF_FF00 | media as u32);
            LittleEndian::write_u32(&mut sector[4..], FAT32_EOC_WRITE);
            // Root directory occupies a single cluster.
            let root = (FAT32_ROOT_CLUSTER * 4) as usize;
            LittleEndian::write_u32(&mut sector[root..], FAT32_EOC_WRITE);
        }
    }
    sector
}

/// Sector-sized buffer holding `bytes` at its start
fn padded_sector(bytes: &[u8], bps: u32) -> Vec<u8> {
    let mut sector = vec![0u8; bps as usize];
    sector[..bytes.len()].copy_from_slice(bytes);
    sector
}

/// Format `device` as an empty FAT16 or FAT32 volume. The device is
/// initialized for the duration of the format and shut down afterwards.
pub fn format_volume<D: BlockDevice + ?Sized>(device: &mut D, options: &FormatOptions) -> FatResult<BootSector> {
    let label = label_bytes(options.volume_label.as_deref())?;

    device.init()?;
    let result = write_layout(device, options, label);
    let shutdown = device.shutdown();
    let boot = result?;
    shutdown?;
    Ok(boot)
}

fn write_layout<D: BlockDevice + ?Sized>(device: &mut D, options: &FormatOptions, label: [u8; 11]) -> FatResult<BootSector> {
    let bps = device.block_size() as u32;
    let total_sectors = device.block_count().min(u32::MAX as u64) as u32;
    let params = calculate_params(total_sectors, bps, options)?;

    info!(
        "Formatting {} sectors as {}: {} clusters of {} sectors, FAT {} sectors x {}",
        total_sectors,
        params.fat_type,
        params.total_clusters,
        params.sectors_per_cluster,
        params.table_size,
        params.table_count
    );

    let boot = build_boot_sector(&params, options, label);
    boot.validate()?;

    // Everything up to the data region, plus the FAT32 root cluster.
    zero_sectors(device, 0, params.data_start(), bps)?;
    if params.fat_type == FatType::Fat32 {
        zero_sectors(device, params.data_start(), params.sectors_per_cluster, bps)?;
    }

    let fat_sector = first_fat_sector(&params, boot.media_type);
    for copy in 0..params.table_count {
        let start = params.reserved_sectors + copy * params.table_size;
        device.write_blocks(start as u64, 1, &fat_sector)?;
    }
    debug!("Initialized {} FAT copies", params.table_count);

    let boot_bytes = padded_sector(&boot.to_bytes(), bps);

    if params.fat_type == FatType::Fat32 {
        let info = FsInfo {
            free_count: params.total_clusters - 1,
            next_free: FAT32_ROOT_CLUSTER + 1,
        };
        let info_bytes = padded_sector(&info.to_bytes(), bps);
        let backup = FAT32_BACKUP_BOOT_SECTOR as u64;
        device.write_blocks(FAT32_FS_INFO_SECTOR as u64, 1, &info_bytes)?;
        device.write_blocks(backup, 1, &boot_bytes)?;
        device.write_blocks(backup + 1, 1, &info_bytes)?;
    }

    if options.volume_label.is_some() {
        let entry = DirEntry::new(label, ATTR_VOLUME_ID, 0, 0);
        let root_sector = match params.fat_type {
            FatType::Fat16 => params.reserved_sectors + params.table_count * params.table_size,
            FatType::Fat32 => params.data_start(),
        };
        let sector = padded_sector(&entry.to_bytes(), bps);
        device.write_blocks(root_sector as u64, 1, &sector)?;
        debug!("Volume label entry written to sector {}", root_sector);
    }

    device.write_blocks(0, 1, &boot_bytes)?;
    info!("Format complete ({} bytes per cluster)", params.sectors_per_cluster * bps);
    Ok(boot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fat::layout::Geometry;
    use fat2fs_core::MemoryBlockDevice;

    #[test]
    fn test_fat16_params_for_small_volume() {
        // 4 MiB: the 1 KiB default is too coarse for FAT16 and is halved.
        let params = calculate_params(8192, 512, &FormatOptions::fat16()).unwrap();
        assert_eq!(params.sectors_per_cluster, 1);
        assert_eq!(params.root_dir_sectors, 32);
        assert!(params.total_clusters >= FAT16_MIN_CLUSTERS);

        let covered = params.table_size * 512 / 2;
        assert!(covered >= params.total_clusters + 2);
    }

    #[test]
    fn test_fat16_too_small() {
        let result = calculate_params(4096, 512, &FormatOptions::fat16());
        assert!(matches!(result, Err(FatError::InvalidInput(_))));
    }

    #[test]
    fn test_fat32_needs_enough_clusters() {
        assert!(calculate_params(16384, 512, &FormatOptions::fat32()).is_err());

        let relaxed = FormatOptions { enforce_cluster_limits: false, ..FormatOptions::fat32() };
        let params = calculate_params(16384, 512, &relaxed).unwrap();
        assert_eq!(params.reserved_sectors, 32);
        assert_eq!(params.root_entries, 0);

        let params = calculate_params(70_000, 512, &FormatOptions::fat32()).unwrap();
        assert!(params.total_clusters >= FAT32_MIN_CLUSTERS);
    }

    #[test]
    fn test_formatted_fat16_layout() {
        let mut dev = MemoryBlockDevice::new(8192);
        let options = FormatOptions {
            volume_label: Some("Test Disk".to_string()),
            ..FormatOptions::fat16()
        };
        let boot = format_volume(&mut dev, &options).unwrap();
        assert!(!dev.is_initialized());

        let bytes = dev.as_bytes();
        let parsed = BootSector::parse(&bytes[..512]).unwrap();
        assert_eq!(parsed, boot);
        assert_eq!(parsed.volume_label(), "TEST DISK");

        // Reserved FAT entries
        let fat = 512;
        assert_eq!(&bytes[fat..fat + 4], &[0xF8, 0xFF, 0xFF, 0xFF]);

        // Label entry at the start of the root directory
        let root = Geometry::derive(&parsed).data_start as usize - 32;
        let root = root * 512;
        assert_eq!(&bytes[root..root + 11], b"TEST DISK  ");
        assert_eq!(bytes[root + 11], ATTR_VOLUME_ID);
    }

    #[test]
    fn test_formatted_fat32_layout() {
        let mut dev = MemoryBlockDevice::new(70_000);
        let boot = format_volume(&mut dev, &FormatOptions::fat32()).unwrap();
        let bytes = dev.as_bytes();

        assert!(boot.is_fat32());
        assert_eq!(boot.table_size_16, 0);
        // Backup boot sector matches the primary.
        assert_eq!(&bytes[6 * 512..7 * 512], &bytes[..512]);

        let info = FsInfo::parse(&bytes[512..1024]).unwrap();
        assert_eq!(info.next_free, 3);

        let geo = Geometry::derive(&boot);
        assert_eq!(info.free_count, geo.total_clusters - 1);
        let fat = geo.fat_start as usize * 512;
        assert_eq!(&bytes[fat + 8..fat + 12], &[0xFF, 0xFF, 0xFF, 0x0F]);
    }

    #[test]
    fn test_invalid_cluster_size_rejected() {
        let options = FormatOptions { sectors_per_cluster: Some(3), ..FormatOptions::fat16() };
        assert!(calculate_params(8192, 512, &options).is_err());
    }
}
