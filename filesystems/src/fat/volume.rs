// Mounted FAT volume
// Mount reads the boot sector, derives the layout, picks up the FSInfo
// next-free hint and warms the FAT cache. The device is shut down again on
// any failure after it was initialized.

use super::boot_sector::BootSector;
use super::constants::*;
use super::dir_entry::attributes::*;
use super::directory::{DirRecord, Directory};
use super::fsinfo::FsInfo;
use super::layout::{fat_type_for_cluster_count, FatLayout, FatType, FatVariant, Geometry};
use super::table::FatTableCache;
use fat2fs_core::{BlockDevice, FatError, FatResult, MountOptions};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// Strip every `/` from a mount point, so `/sd` and `sd/` name the same
/// volume.
pub fn normalize_mount_point(mount_point: &str) -> FatResult<String> {
    let name: String = mount_point.chars().filter(|&c| c != '/').collect();
    if name.is_empty() {
        return Err(FatError::InvalidInput(format!("empty mount point {:?}", mount_point)));
    }
    Ok(name)
}

/// Split a path into its non-empty components
pub(crate) fn path_components(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".").collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeStats {
    pub fat_type: FatType,
    pub label: String,
    pub bytes_per_sector: u32,
    pub bytes_per_cluster: u32,
    pub total_clusters: u32,
    pub free_clusters: u32,
    pub next_free_cluster: u32,
}

impl VolumeStats {
    pub fn total_bytes(&self) -> u64 {
        self.total_clusters as u64 * self.bytes_per_cluster as u64
    }

    pub fn free_bytes(&self) -> u64 {
        self.free_clusters as u64 * self.bytes_per_cluster as u64
    }
}

pub struct FatVolume<D: BlockDevice> {
    pub(crate) device: D,
    pub(crate) boot: BootSector,
    pub(crate) geometry: Geometry,
    pub(crate) fat: FatTableCache,
    /// Cluster where the next free-cluster scan starts
    pub(crate) next_free: u32,
    mount_point: String,
    options: MountOptions,
}

struct Loaded {
    boot: BootSector,
    geometry: Geometry,
    fat: FatTableCache,
    next_free: u32,
}

impl<D: BlockDevice> FatVolume<D> {
    /// Initialize `device` and mount the FAT volume on it
    pub fn mount(mount_point: &str, mut device: D, options: MountOptions) -> FatResult<Self> {
        let mount_point = normalize_mount_point(mount_point)?;

        device.init().map_err(|e| match e {
            FatError::DeviceInitFailed(msg) => FatError::DeviceInitFailed(msg),
            other => FatError::DeviceInitFailed(other.to_string()),
        })?;

        match Self::load(&mut device, &options) {
            Ok(loaded) => {
                info!(
                    "Mounted {} volume '{}' at {} ({} clusters of {} bytes, {})",
                    loaded.geometry.fat_type(),
                    loaded.boot.volume_label(),
                    mount_point,
                    loaded.geometry.total_clusters,
                    loaded.geometry.bytes_per_cluster(),
                    if options.flags.is_writable() { "read-write" } else { "read-only" }
                );
                Ok(Self {
                    device,
                    boot: loaded.boot,
                    geometry: loaded.geometry,
                    fat: loaded.fat,
                    next_free: loaded.next_free,
                    mount_point,
                    options,
                })
            }
            Err(e) => {
                warn!("Mount of {} failed: {}", mount_point, e);
                if let Err(shutdown_err) = device.shutdown() {
                    warn!("Device shutdown after failed mount also failed: {}", shutdown_err);
                }
                Err(e)
            }
        }
    }

    fn load(device: &mut D, options: &MountOptions) -> FatResult<Loaded> {
        let block_size = device.block_size();
        if block_size < BOOT_SECTOR_SIZE {
            return Err(FatError::InvalidBootSector(format!(
                "device block size {} is smaller than a boot sector",
                block_size
            )));
        }

        let mut sector = vec![0u8; block_size];
        device
            .read_blocks(0, 1, &mut sector)
            .map_err(|e| FatError::BootSectorReadFailed(e.to_string()))?;

        let boot = BootSector::parse(&sector[..BOOT_SECTOR_SIZE])?;
        boot.log_geometry();

        if boot.bytes_per_sector as usize != block_size {
            return Err(FatError::InvalidBootSector(format!(
                "{} bytes per sector on a device with {}-byte blocks",
                boot.bytes_per_sector, block_size
            )));
        }
        if boot.total_sectors() as u64 > device.block_count() {
            return Err(FatError::InvalidBootSector(format!(
                "volume claims {} sectors but the device has {}",
                boot.total_sectors(),
                device.block_count()
            )));
        }

        let geometry = Geometry::derive(&boot);
        debug!(
            "FAT at sector {}, {} copies of {} sectors, data at sector {}, {} clusters",
            geometry.fat_start,
            geometry.table_count,
            geometry.table_size,
            geometry.data_start,
            geometry.total_clusters
        );
        Self::check_fat_type(&geometry, options.strict_fat_type)?;

        let next_free = match geometry.layout {
            FatLayout::Fat16(_) => FIRST_DATA_CLUSTER,
            FatLayout::Fat32(l) => Self::read_next_free_hint(device, l.fsinfo_sector, &geometry)?,
        };
        debug!("Next free cluster hint: {}", next_free);

        let mut fat = FatTableCache::new(&geometry, options.mirror_fat_copies);
        fat.read_entry(device, geometry.layout.warmup_index())?;

        Ok(Loaded { boot, geometry, fat, next_free })
    }

    /// The FAT type comes from the table-size field alone; a cluster count
    /// pointing the other way is logged, and refused in strict mode.
    fn check_fat_type(geometry: &Geometry, strict: bool) -> FatResult<()> {
        let declared = geometry.fat_type();
        let problem = match fat_type_for_cluster_count(geometry.total_clusters) {
            None => Some(format!(
                "{} clusters is in the FAT12 range, mounting as {}",
                geometry.total_clusters, declared
            )),
            Some(counted) if counted != declared => Some(format!(
                "{} clusters suggests {} but the boot sector describes {}",
                geometry.total_clusters, counted, declared
            )),
            Some(_) => None,
        };

        match problem {
            Some(msg) if strict => Err(FatError::InvalidBootSector(msg)),
            Some(msg) => {
                warn!("{}", msg);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn read_next_free_hint(device: &mut D, fsinfo_sector: u16, geometry: &Geometry) -> FatResult<u32> {
        if fsinfo_sector == 0 || fsinfo_sector == 0xFFFF {
            return Ok(FIRST_DATA_CLUSTER);
        }

        let mut sector = vec![0u8; geometry.bytes_per_sector as usize];
        device.read_blocks(fsinfo_sector as u64, 1, &mut sector)?;
        Ok(FsInfo::parse(&sector)
            .map(|info| info.next_free_hint(geometry.total_clusters))
            .unwrap_or(FIRST_DATA_CLUSTER))
    }

    /// Persist the next-free hint, shut the device down and hand it back.
    /// The device is shut down even when the FSInfo update fails; the first
    /// error is returned.
    pub fn unmount(mut self) -> FatResult<D> {
        let fsinfo = if self.is_writable() { self.write_fsinfo() } else { Ok(()) };
        if let Err(e) = &fsinfo {
            warn!("Could not update FSInfo on {}: {}", self.mount_point, e);
        }
        let shutdown = self.device.shutdown();
        fsinfo.and(shutdown)?;
        info!("Unmounted {}", self.mount_point);
        Ok(self.device)
    }

    /// Record the next-free hint in the FSInfo sector. The free count is
    /// marked unknown since it is not tracked while mounted.
    fn write_fsinfo(&mut self) -> FatResult<()> {
        let sector = match self.geometry.layout {
            FatLayout::Fat32(l) if l.fsinfo_sector != 0 && l.fsinfo_sector != 0xFFFF => l.fsinfo_sector,
            _ => return Ok(()),
        };

        let mut buf = vec![0u8; self.geometry.bytes_per_sector as usize];
        self.device.read_blocks(sector as u64, 1, &mut buf)?;
        if FsInfo::parse(&buf).is_none() {
            return Ok(());
        }

        let info = FsInfo { free_count: FSI_UNKNOWN, next_free: self.next_free };
        buf[..BOOT_SECTOR_SIZE].copy_from_slice(&info.to_bytes());
        self.device.write_blocks(sector as u64, 1, &buf)?;
        debug!("FSInfo next-free set to {}", self.next_free);
        Ok(())
    }

    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    pub fn boot_sector(&self) -> &BootSector {
        &self.boot
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn fat_type(&self) -> FatType {
        self.geometry.fat_type()
    }

    pub fn next_free_hint(&self) -> u32 {
        self.next_free
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn is_writable(&self) -> bool {
        self.options.flags.is_writable()
    }

    pub(crate) fn ensure_writable(&self) -> FatResult<()> {
        if self.is_writable() {
            Ok(())
        } else {
            Err(FatError::ReadOnly)
        }
    }

    pub fn volume_label(&self) -> String {
        self.boot.volume_label()
    }

    pub fn stats(&mut self) -> FatResult<VolumeStats> {
        let free_clusters = self.count_free_clusters()?;
        Ok(VolumeStats {
            fat_type: self.fat_type(),
            label: self.volume_label(),
            bytes_per_sector: self.geometry.bytes_per_sector,
            bytes_per_cluster: self.geometry.bytes_per_cluster(),
            total_clusters: self.geometry.total_clusters,
            free_clusters,
            next_free_cluster: self.next_free,
        })
    }

    /// Entry named by `path`, or `None` when the last component is missing.
    /// The root itself has no entry and is reported as `None` too.
    pub fn lookup(&mut self, path: &str) -> FatResult<Option<DirRecord>> {
        let components = path_components(path);
        let (last, parents) = match components.split_last() {
            Some(split) => split,
            None => return Ok(None),
        };

        let mut dir = Directory::Root;
        for component in parents {
            dir = self.child_directory(dir, component)?;
        }
        self.find_entry(dir, last)
    }

    fn child_directory(&mut self, dir: Directory, name: &str) -> FatResult<Directory> {
        match self.find_entry(dir, name)? {
            Some(record) if record.is_directory() => Ok(record.as_directory()),
            Some(_) => Err(FatError::NotADirectory(name.to_string())),
            None => Err(FatError::NotFound(name.to_string())),
        }
    }

    /// Resolve a path that must name a directory
    pub fn resolve_dir(&mut self, path: &str) -> FatResult<Directory> {
        let mut dir = Directory::Root;
        for component in path_components(path) {
            dir = self.child_directory(dir, component)?;
        }
        Ok(dir)
    }

    /// Parent directory of `path` and the final component
    pub(crate) fn resolve_parent<'p>(&mut self, path: &'p str) -> FatResult<(Directory, &'p str)> {
        let components = path_components(path);
        let (last, parents) = components
            .split_last()
            .ok_or_else(|| FatError::InvalidInput(format!("path {:?} has no file name", path)))?;

        let mut dir = Directory::Root;
        for component in parents {
            dir = self.child_directory(dir, component)?;
        }
        Ok((dir, *last))
    }

    /// Entries of the directory at `path`, without `.` and `..`
    pub fn list_dir(&mut self, path: &str) -> FatResult<Vec<DirRecord>> {
        let dir = self.resolve_dir(path)?;
        Ok(self.read_entries(dir)?.into_iter().filter(|r| !r.is_dot()).collect())
    }

    pub fn create_dir(&mut self, path: &str) -> FatResult<DirRecord> {
        self.ensure_writable()?;
        let (parent, name) = self.resolve_parent(path)?;
        if self.find_entry(parent, name)?.is_some() {
            return Err(FatError::AlreadyExists(path.to_string()));
        }

        let cluster = self.allocate_zeroed_cluster(None)?;
        let created = self
            .init_directory(cluster, parent)
            .and_then(|_| self.create_entry(parent, name, ATTR_DIRECTORY, cluster, 0));

        match created {
            Ok(record) => {
                debug!("Created directory {} at cluster {}", path, cluster);
                Ok(record)
            }
            Err(e) => {
                if let Err(free_err) = self.free_chain(cluster) {
                    warn!("Could not release cluster {} after failed mkdir: {}", cluster, free_err);
                }
                Err(e)
            }
        }
    }

    /// Delete a file, or a directory holding nothing but `.` and `..`
    pub fn remove(&mut self, path: &str) -> FatResult<()> {
        self.ensure_writable()?;
        let record = self.lookup(path)?.ok_or_else(|| FatError::NotFound(path.to_string()))?;

        if record.is_directory() {
            let children = self.read_entries(record.as_directory())?;
            if children.iter().any(|r| !r.is_dot()) {
                return Err(FatError::InvalidInput(format!("directory {} is not empty", path)));
            }
        }

        self.delete_entry(&record)?;
        if record.first_cluster() != 0 {
            self.free_chain(record.first_cluster())?;
        }
        debug!("Removed {}", path);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fat::format::{format_volume, FormatOptions};
    use fat2fs_core::{MemoryBlockDevice, MountFlags};

    /// 4 MiB FAT16 volume with 512-byte clusters
    pub(crate) fn fat16_volume() -> FatVolume<MemoryBlockDevice> {
        let mut dev = MemoryBlockDevice::new(8192);
        let options = FormatOptions { sectors_per_cluster: Some(1), ..FormatOptions::fat16() };
        format_volume(&mut dev, &options).unwrap();
        FatVolume::mount("/test", dev, MountOptions::default()).unwrap()
    }

    /// Small FAT32 volume below the standard cluster minimum
    pub(crate) fn fat32_volume() -> FatVolume<MemoryBlockDevice> {
        let mut dev = MemoryBlockDevice::new(16384);
        let options = FormatOptions {
            sectors_per_cluster: Some(1),
            enforce_cluster_limits: false,
            ..FormatOptions::fat32()
        };
        format_volume(&mut dev, &options).unwrap();
        FatVolume::mount("/test", dev, MountOptions::default()).unwrap()
    }

    #[test]
    fn test_mount_point_normalized() {
        assert_eq!(normalize_mount_point("/sd").unwrap(), "sd");
        assert_eq!(normalize_mount_point("/sd/card/").unwrap(), "sdcard");
        assert!(normalize_mount_point("/").is_err());

        let vol = fat16_volume();
        assert_eq!(vol.mount_point(), "test");
    }

    #[test]
    fn test_fat16_mount_state() {
        let vol = fat16_volume();
        assert_eq!(vol.fat_type(), FatType::Fat16);
        assert_eq!(vol.next_free_hint(), FIRST_DATA_CLUSTER);
        // Warm-up leaves the first FAT sector cached.
        assert_eq!(vol.fat.cached_sector(), Some(0));
        assert!(vol.device().is_initialized());
    }

    #[test]
    fn test_fat32_mount_reads_fsinfo_hint() {
        let vol = fat32_volume();
        assert_eq!(vol.fat_type(), FatType::Fat32);
        // Formatter leaves the root directory in cluster 2.
        assert_eq!(vol.next_free_hint(), 3);
    }

    #[test]
    fn test_strict_mode_rejects_small_fat32() {
        let vol = fat32_volume();
        let dev = vol.unmount().unwrap();
        let options = MountOptions { strict_fat_type: true, ..MountOptions::default() };
        let stats = dev.stats();
        let shutdowns = stats.shutdowns();

        let result = FatVolume::mount("/test", dev, options);
        assert!(matches!(result, Err(FatError::InvalidBootSector(_))));
        assert_eq!(stats.shutdowns(), shutdowns + 1);
    }

    #[test]
    fn test_unmount_persists_next_free() {
        let mut vol = fat32_volume();
        vol.allocate_cluster(None).unwrap();
        vol.allocate_cluster(None).unwrap();
        assert_eq!(vol.next_free_hint(), 5);

        let dev = vol.unmount().unwrap();
        assert!(!dev.is_initialized());
        let vol = FatVolume::mount("/again", dev, MountOptions::default()).unwrap();
        assert_eq!(vol.next_free_hint(), 5);
    }

    #[test]
    fn test_unmount_reports_fsinfo_write_failure() {
        let mut vol = fat32_volume();
        vol.allocate_cluster(None).unwrap();
        let stats = vol.device.stats();
        let shutdowns = stats.shutdowns();
        vol.device.fail_writes_after(0);

        let result = vol.unmount();
        assert!(matches!(result, Err(FatError::DeviceIoError(_))));
        assert_eq!(stats.shutdowns(), shutdowns + 1);
    }

    #[test]
    fn test_mount_init_failure() {
        let dev = MemoryBlockDevice::new(8192).failing_init();
        let stats = dev.stats();

        let result = FatVolume::mount("/test", dev, MountOptions::default());
        assert!(matches!(result, Err(FatError::DeviceInitFailed(_))));
        assert_eq!(stats.inits(), 1);
        assert_eq!(stats.reads(), 0);
    }

    #[test]
    fn test_mount_boot_sector_read_failure() {
        let dev = MemoryBlockDevice::new(0);
        let stats = dev.stats();

        let result = FatVolume::mount("/test", dev, MountOptions::default());
        assert!(matches!(result, Err(FatError::BootSectorReadFailed(_))));
        assert_eq!(stats.shutdowns(), 1);
    }

    #[test]
    fn test_read_only_volume_refuses_writes() {
        let dev = fat16_volume().unmount().unwrap();
        let mut vol = FatVolume::mount("/ro", dev, MountFlags::ReadOnly.into()).unwrap();
        assert!(!vol.is_writable());
        assert!(matches!(vol.allocate_cluster(None), Err(FatError::ReadOnly)));
        assert!(matches!(vol.create_dir("/docs"), Err(FatError::ReadOnly)));
        assert!(vol.list_dir("/").unwrap().is_empty());
    }

    #[test]
    fn test_create_dir_and_lookup() {
        let mut vol = fat16_volume();
        let docs = vol.create_dir("/Documents").unwrap();
        vol.create_dir("/Documents/Letters").unwrap();

        assert!(matches!(vol.create_dir("/documents"), Err(FatError::AlreadyExists(_))));

        let letters = vol.lookup("/documents/LETTERS").unwrap().unwrap();
        assert!(letters.is_directory());

        let inner = vol.read_entries(letters.as_directory()).unwrap();
        let dot_dot = inner.iter().find(|r| r.short_name.to_string() == "..").unwrap();
        assert_eq!(dot_dot.first_cluster(), docs.first_cluster());

        let listing = vol.list_dir("/Documents").unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "Letters");
    }

    #[test]
    fn test_lookup_errors() {
        let mut vol = fat16_volume();
        assert!(vol.lookup("/missing").unwrap().is_none());
        assert!(matches!(vol.lookup("/missing/file"), Err(FatError::NotFound(_))));
        assert!(vol.lookup("/").unwrap().is_none());
        assert!(matches!(vol.create_dir("/"), Err(FatError::InvalidInput(_))));
    }

    #[test]
    fn test_remove_empty_directory() {
        let mut vol = fat16_volume();
        let before = vol.stats().unwrap().free_clusters;
        vol.create_dir("/tmp").unwrap();
        vol.create_dir("/tmp/inner").unwrap();

        assert!(matches!(vol.remove("/tmp"), Err(FatError::InvalidInput(_))));
        vol.remove("/tmp/inner").unwrap();
        vol.remove("/tmp").unwrap();

        assert!(vol.lookup("/tmp").unwrap().is_none());
        assert_eq!(vol.stats().unwrap().free_clusters, before);
    }

    #[test]
    fn test_stats() {
        let mut vol = fat16_volume();
        let stats = vol.stats().unwrap();
        assert_eq!(stats.fat_type, FatType::Fat16);
        assert_eq!(stats.free_clusters, stats.total_clusters);
        assert_eq!(stats.bytes_per_cluster, 512);
        assert_eq!(stats.free_bytes(), stats.total_bytes());
    }
}
