// Mount table for FAT volumes
// The hosting layer calls `init` once, then mounts volumes under
// identifiers derived from their mount points. Each mounted volume owns its
// block device until it is unmounted.

use crate::fat::volume::normalize_mount_point;
use crate::fat::FatVolume;
use fat2fs_core::{BlockDevice, FatError, FatResult, MountFlags, MountOptions};
use log::{debug, info, warn};
use std::collections::HashMap;

pub type BoxedDevice = Box<dyn BlockDevice>;
pub type MountedVolume = FatVolume<BoxedDevice>;

#[derive(Default)]
pub struct FatDriver {
    initialized: bool,
    volumes: HashMap<String, MountedVolume>,
}

impl FatDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the driver. Calling it again is harmless.
    pub fn init(&mut self) -> FatResult<()> {
        if !self.initialized {
            info!("FAT driver initialized");
            self.initialized = true;
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Unmount everything and deregister. Every volume is attempted; the
    /// first error is returned.
    pub fn shutdown(&mut self) -> FatResult<()> {
        let mut first_error = None;
        let mount_points: Vec<String> = self.volumes.keys().cloned().collect();
        for mount_point in mount_points {
            if let Err(e) = self.unmount(&mount_point) {
                warn!("Unmount of {} during shutdown failed: {}", mount_point, e);
                first_error.get_or_insert(e);
            }
        }
        self.initialized = false;
        info!("FAT driver shut down");
        first_error.map_or(Ok(()), Err)
    }

    fn ensure_initialized(&self) -> FatResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(FatError::InvalidInput("FAT driver is not initialized".to_string()))
        }
    }

    pub fn mount(&mut self, mount_point: &str, device: BoxedDevice, flags: MountFlags) -> FatResult<()> {
        self.mount_with_options(mount_point, device, flags.into())
    }

    /// Mount `device` under `mount_point`. An identifier already in use is
    /// refused before the device is touched.
    pub fn mount_with_options(
        &mut self,
        mount_point: &str,
        device: BoxedDevice,
        options: MountOptions,
    ) -> FatResult<()> {
        self.ensure_initialized()?;
        let id = normalize_mount_point(mount_point)?;
        if self.volumes.contains_key(&id) {
            return Err(FatError::MountPointInUse(id));
        }

        let volume = FatVolume::mount(&id, device, options)?;
        debug!("Registered volume {}", id);
        self.volumes.insert(id, volume);
        Ok(())
    }

    /// Unmount and hand the block device back
    pub fn unmount(&mut self, mount_point: &str) -> FatResult<BoxedDevice> {
        let id = normalize_mount_point(mount_point)?;
        let volume = self.volumes.remove(&id).ok_or_else(|| FatError::NotMounted(id.clone()))?;
        volume.unmount()
    }

    pub fn is_mounted(&self, mount_point: &str) -> bool {
        normalize_mount_point(mount_point)
            .map(|id| self.volumes.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn mount_points(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.volumes.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn volume_mut(&mut self, mount_point: &str) -> FatResult<&mut MountedVolume> {
        let id = normalize_mount_point(mount_point)?;
        self.volumes.get_mut(&id).ok_or(FatError::NotMounted(id))
    }

    /// Run `f` against the volume mounted at `mount_point`
    pub fn with_volume<R>(
        &mut self,
        mount_point: &str,
        f: impl FnOnce(&mut MountedVolume) -> FatResult<R>,
    ) -> FatResult<R> {
        f(self.volume_mut(mount_point)?)
    }
}
