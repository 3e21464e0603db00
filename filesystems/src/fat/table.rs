// Single-sector write-through cache over the File Allocation Table
//
// Every access names a byte index into the FAT region. The sector holding
// that index is loaded on a miss, replacing whatever was cached; nothing is
// ever dirty because writes go straight to the device.

use super::layout::{FatVariant, Geometry};
use byteorder::{ByteOrder, LittleEndian};
use fat2fs_core::{BlockDevice, FatError, FatResult};
use log::trace;

pub struct FatTableCache {
    buffer: Vec<u8>,
    /// Sector offset (relative to the FAT start) currently in `buffer`
    sector: Option<u32>,
    bytes_per_sector: u32,
    entry_width: usize,
    fat_start: u32,
    table_size: u32,
    /// Start sectors of the backup FAT copies to mirror writes into
    mirrors: Vec<u32>,
}

impl FatTableCache {
    pub fn new(geometry: &Geometry, mirror_copies: bool) -> Self {
        let mirrors = if mirror_copies {
            (1..geometry.table_count)
                .map(|i| geometry.fat_start + i * geometry.table_size)
                .collect()
        } else {
            Vec::new()
        };

        Self {
            buffer: vec![0u8; geometry.bytes_per_sector as usize],
            sector: None,
            bytes_per_sector: geometry.bytes_per_sector,
            entry_width: geometry.layout.entry_width() as usize,
            fat_start: geometry.fat_start,
            table_size: geometry.table_size,
            mirrors,
        }
    }

    /// Sector offset currently cached, if any
    pub fn cached_sector(&self) -> Option<u32> {
        self.sector
    }

    /// Drop the cached sector; the next access reloads from the device.
    pub fn invalidate(&mut self) {
        self.sector = None;
    }

    /// Make sure the sector holding `byte_index` is loaded and return the
    /// offset of the index within it.
    fn load<D: BlockDevice + ?Sized>(&mut self, device: &mut D, byte_index: u32) -> FatResult<usize> {
        let sector = byte_index / self.bytes_per_sector;
        let offset = (byte_index % self.bytes_per_sector) as usize;

        if sector >= self.table_size {
            return Err(FatError::InvalidInput(format!(
                "FAT byte index {} is past the end of the table ({} sectors)",
                byte_index, self.table_size
            )));
        }

        if self.sector != Some(sector) {
            trace!("FAT cache miss: loading FAT sector {}", sector);
            // Buffer contents are undefined if the read fails part way.
            self.sector = None;
            device.read_blocks((self.fat_start + sector) as u64, 1, &mut self.buffer)?;
            self.sector = Some(sector);
        }

        Ok(offset)
    }

    /// Read the little-endian entry at `byte_index`, zero-extended to 32 bits.
    pub fn read_entry<D: BlockDevice + ?Sized>(&mut self, device: &mut D, byte_index: u32) -> FatResult<u32> {
        let offset = self.load(device, byte_index)?;
        let value = LittleEndian::read_uint(&self.buffer[offset..], self.entry_width);
        Ok(value as u32)
    }

    /// Store the low `entry_width` bytes of `value` at `byte_index` and write
    /// the sector through before returning.
    pub fn write_entry<D: BlockDevice + ?Sized>(
        &mut self,
        device: &mut D,
        byte_index: u32,
        value: u32,
    ) -> FatResult<()> {
        let offset = self.load(device, byte_index)?;
        let width = self.entry_width;
        let truncated = if width == 4 { value as u64 } else { (value & 0xFFFF) as u64 };
        LittleEndian::write_uint(&mut self.buffer[offset..], truncated, width);

        let sector = byte_index / self.bytes_per_sector;
        if let Err(e) = device.write_blocks((self.fat_start + sector) as u64, 1, &self.buffer) {
            // The buffer no longer matches the disk.
            self.sector = None;
            return Err(e);
        }

        for &mirror in &self.mirrors {
            if let Err(e) = device.write_blocks((mirror + sector) as u64, 1, &self.buffer) {
                self.sector = None;
                return Err(e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fat::boot_sector::tests::fat16_boot_sector;
    use crate::fat::boot_sector::{BootSector, ExtendedBootSector, Fat32Extended};
    use fat2fs_core::MemoryBlockDevice;

    fn fat16_setup() -> (Geometry, MemoryBlockDevice) {
        let geo = Geometry::derive(&fat16_boot_sector());
        let mut dev = MemoryBlockDevice::new(32768);
        dev.init().unwrap();
        (geo, dev)
    }

    fn fat32_geometry() -> Geometry {
        let mut boot: BootSector = fat16_boot_sector();
        boot.table_size_16 = 0;
        boot.root_entry_count = 0;
        boot.extended = ExtendedBootSector::Fat32(Fat32Extended {
            table_size_32: 64,
            ext_flags: 0,
            fs_version: 0,
            root_cluster: 2,
            fs_info_sector: 1,
            backup_boot_sector: 6,
            drive_number: 0x80,
            boot_signature: 0x29,
            volume_id: 1,
            volume_label: *b"NO NAME    ",
            fs_type: *b"FAT32   ",
        });
        Geometry::derive(&boot)
    }

    #[test]
    fn test_same_sector_hits_cache() {
        let (geo, mut dev) = fat16_setup();
        let stats = dev.stats();
        let mut cache = FatTableCache::new(&geo, false);

        cache.read_entry(&mut dev, 4).unwrap();
        assert_eq!(stats.reads(), 1);

        // Indices 4..510 live in the same sector: no further device reads.
        for idx in (6..510).step_by(2) {
            cache.read_entry(&mut dev, idx).unwrap();
        }
        assert_eq!(stats.reads(), 1);

        cache.read_entry(&mut dev, 512).unwrap();
        assert_eq!(stats.reads(), 2);
        assert_eq!(cache.cached_sector(), Some(1));
    }

    #[test]
    fn test_write_then_read_across_sector_switch() {
        let (geo, mut dev) = fat16_setup();
        let mut cache = FatTableCache::new(&geo, false);

        cache.write_entry(&mut dev, 10, 0xBEEF).unwrap();
        cache.write_entry(&mut dev, 600, 0x1234).unwrap();
        assert_eq!(cache.cached_sector(), Some(1));

        assert_eq!(cache.read_entry(&mut dev, 10).unwrap(), 0xBEEF);
        assert_eq!(cache.read_entry(&mut dev, 600).unwrap(), 0x1234);
    }

    #[test]
    fn test_write_is_persisted_immediately() {
        let (geo, mut dev) = fat16_setup();
        let stats = dev.stats();
        let mut cache = FatTableCache::new(&geo, false);

        cache.write_entry(&mut dev, 6, 0xFFFF).unwrap();
        assert_eq!(stats.writes(), 1);

        // FAT starts at sector 1: byte 6 of the FAT is byte 518 of the disk.
        let bytes = dev.as_bytes();
        assert_eq!(&bytes[518..520], &[0xFF, 0xFF]);
        assert_eq!(bytes[520], 0);
    }

    #[test]
    fn test_fat16_entries_zero_extended() {
        let (geo, mut dev) = fat16_setup();
        let mut cache = FatTableCache::new(&geo, false);

        cache.write_entry(&mut dev, 8, 0xABCD).unwrap();
        cache.write_entry(&mut dev, 10, 0x9999).unwrap();
        // Only two bytes are read back, the neighbour does not leak in.
        assert_eq!(cache.read_entry(&mut dev, 8).unwrap(), 0x0000_ABCD);
    }

    #[test]
    fn test_fat32_entries() {
        let geo = fat32_geometry();
        let mut dev = MemoryBlockDevice::new(32768);
        let mut cache = FatTableCache::new(&geo, false);

        cache.write_entry(&mut dev, 4 * 130, 0x0FFF_FFFF).unwrap();
        assert_eq!(cache.read_entry(&mut dev, 4 * 130).unwrap(), 0x0FFF_FFFF);
        assert_eq!(cache.cached_sector(), Some(1));
    }

    #[test]
    fn test_mirrored_writes() {
        let (geo, mut dev) = fat16_setup();
        let stats = dev.stats();
        let mut cache = FatTableCache::new(&geo, true);

        cache.write_entry(&mut dev, 4, 0xFFFF).unwrap();
        assert_eq!(stats.writes(), 2);

        // Second FAT copy starts at sector 1 + 32.
        let bytes = dev.as_bytes();
        let backup = (1 + 32) * 512 + 4;
        assert_eq!(&bytes[backup..backup + 2], &[0xFF, 0xFF]);
    }

    #[test]
    fn test_failed_write_invalidates_cache() {
        let (geo, mut dev) = fat16_setup();
        let mut cache = FatTableCache::new(&geo, false);
        cache.read_entry(&mut dev, 4).unwrap();

        dev.fail_writes_after(0);
        assert!(cache.write_entry(&mut dev, 4, 0x1111).is_err());
        assert_eq!(cache.cached_sector(), None);
        // Reload shows the on-disk value, not the lost write.
        assert_eq!(cache.read_entry(&mut dev, 4).unwrap(), 0);
    }

    #[test]
    fn test_index_past_table_rejected() {
        let (geo, mut dev) = fat16_setup();
        let mut cache = FatTableCache::new(&geo, false);
        let past_end = geo.table_size * 512;
        assert!(matches!(cache.read_entry(&mut dev, past_end), Err(FatError::InvalidInput(_))));
    }
}
