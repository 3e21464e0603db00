// FAT Cluster Chain Management
// Following, allocating, extending and freeing chains through the
// single-sector FAT cache

use super::constants::*;
use super::layout::FatVariant;
use super::volume::FatVolume;
use fat2fs_core::{BlockDevice, FatError, FatResult};
use log::{debug, trace};
use std::collections::HashSet;

impl<D: BlockDevice> FatVolume<D> {
    /// Raw FAT entry for `cluster`, masked to its meaningful bits
    pub(crate) fn fat_entry(&mut self, cluster: u32) -> FatResult<u32> {
        let layout = self.geometry.layout;
        let value = self.fat.read_entry(&mut self.device, layout.entry_offset(cluster))?;
        Ok(value & layout.entry_mask())
    }

    /// Store `value` in the FAT entry for `cluster`. The reserved top bits of
    /// a FAT32 entry are preserved.
    pub(crate) fn set_fat_entry(&mut self, cluster: u32, value: u32) -> FatResult<()> {
        let layout = self.geometry.layout;
        let index = layout.entry_offset(cluster);
        let mask = layout.entry_mask();
        let stored = if layout.entry_width() == 4 {
            let current = self.fat.read_entry(&mut self.device, index)?;
            (current & !mask) | (value & mask)
        } else {
            value & mask
        };
        self.fat.write_entry(&mut self.device, index, stored)
    }

    /// Successor of `cluster`, or `None` at end of chain
    pub(crate) fn next_cluster(&mut self, cluster: u32) -> FatResult<Option<u32>> {
        let next = self.fat_entry(cluster)?;
        let layout = self.geometry.layout;

        if layout.is_end_of_chain(next) {
            return Ok(None);
        }
        if next == FAT_FREE {
            return Err(FatError::ChainCorrupted(format!(
                "cluster {} points at a free entry",
                cluster
            )));
        }
        if layout.is_bad(next) {
            return Err(FatError::ChainCorrupted(format!(
                "cluster {} points at a bad cluster",
                cluster
            )));
        }
        if !self.geometry.is_valid_cluster(next) {
            return Err(FatError::ChainCorrupted(format!(
                "cluster {} points outside the volume ({})",
                cluster, next
            )));
        }
        Ok(Some(next))
    }

    /// Every cluster of the chain starting at `start`, in order
    pub fn cluster_chain(&mut self, start: u32) -> FatResult<Vec<u32>> {
        if !self.geometry.is_valid_cluster(start) {
            return Err(FatError::ChainCorrupted(format!("invalid start cluster {}", start)));
        }

        let mut chain = vec![start];
        // Prevent infinite loops
        let mut visited = HashSet::new();
        visited.insert(start);

        let mut current = start;
        while let Some(next) = self.next_cluster(current)? {
            if !visited.insert(next) {
                return Err(FatError::ChainCorrupted(format!(
                    "circular cluster chain at cluster {}",
                    next
                )));
            }
            chain.push(next);
            current = next;
        }

        Ok(chain)
    }

    /// Find a free cluster, starting at the next-free hint and wrapping
    /// around to cluster 2 once.
    fn find_free_cluster(&mut self) -> FatResult<u32> {
        let first = FIRST_DATA_CLUSTER;
        let last = self.geometry.max_cluster();
        let start = if self.next_free >= first && self.next_free <= last {
            self.next_free
        } else {
            first
        };

        trace!("Scanning for a free cluster from {}", start);
        for cluster in (start..=last).chain(first..start) {
            if self.fat_entry(cluster)? == FAT_FREE {
                return Ok(cluster);
            }
        }

        Err(FatError::DiskFull)
    }

    /// Allocate one cluster as a new end of chain. When `previous` is given
    /// the new cluster is linked after it.
    pub(crate) fn allocate_cluster(&mut self, previous: Option<u32>) -> FatResult<u32> {
        self.ensure_writable()?;

        let cluster = self.find_free_cluster()?;
        let eoc = self.geometry.layout.end_of_chain();

        // Terminate first so the chain never points at a free entry.
        self.set_fat_entry(cluster, eoc)?;
        if let Some(prev) = previous {
            self.set_fat_entry(prev, cluster)?;
        }

        self.next_free = if cluster >= self.geometry.max_cluster() {
            FIRST_DATA_CLUSTER
        } else {
            cluster + 1
        };

        debug!("Allocated cluster {} (after {:?})", cluster, previous);
        Ok(cluster)
    }

    /// Allocate a cluster and fill it with zeros
    pub(crate) fn allocate_zeroed_cluster(&mut self, previous: Option<u32>) -> FatResult<u32> {
        let cluster = self.allocate_cluster(previous)?;
        self.zero_cluster(cluster)?;
        Ok(cluster)
    }

    pub(crate) fn zero_cluster(&mut self, cluster: u32) -> FatResult<()> {
        let sector = self.geometry.cluster_to_sector(cluster);
        let count = self.geometry.sectors_per_cluster as usize;
        let zeros = vec![0u8; self.geometry.bytes_per_cluster() as usize];
        self.device.write_blocks(sector as u64, count, &zeros)
    }

    /// Append `count` clusters after `last`, returning the new clusters
    pub fn extend_chain(&mut self, last: u32, count: usize) -> FatResult<Vec<u32>> {
        let mut added = Vec::with_capacity(count);
        let mut tail = last;
        for _ in 0..count {
            tail = self.allocate_cluster(Some(tail))?;
            added.push(tail);
        }
        Ok(added)
    }

    /// Release every cluster of the chain starting at `start`. Returns the
    /// number of clusters freed.
    pub fn free_chain(&mut self, start: u32) -> FatResult<u32> {
        self.ensure_writable()?;

        let chain = self.cluster_chain(start)?;
        for &cluster in &chain {
            self.set_fat_entry(cluster, FAT_FREE)?;
        }

        if start < self.next_free {
            self.next_free = start;
        }
        debug!("Freed {} clusters starting at {}", chain.len(), start);
        Ok(chain.len() as u32)
    }

    /// Cut the chain after `keep` and free the remainder
    pub fn truncate_chain(&mut self, keep: u32) -> FatResult<u32> {
        self.ensure_writable()?;

        match self.next_cluster(keep)? {
            Some(rest) => {
                let eoc = self.geometry.layout.end_of_chain();
                self.set_fat_entry(keep, eoc)?;
                self.free_chain(rest)
            }
            None => Ok(0),
        }
    }

    /// Full scan of the FAT for free entries
    pub fn count_free_clusters(&mut self) -> FatResult<u32> {
        let mut free = 0;
        for cluster in FIRST_DATA_CLUSTER..=self.geometry.max_cluster() {
            if self.fat_entry(cluster)? == FAT_FREE {
                free += 1;
            }
        }
        Ok(free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fat::volume::tests::{fat16_volume, fat32_volume};

    #[test]
    fn test_allocate_and_follow_chain() {
        let mut vol = fat16_volume();
        let first = vol.allocate_cluster(None).unwrap();
        let added = vol.extend_chain(first, 3).unwrap();

        let chain = vol.cluster_chain(first).unwrap();
        assert_eq!(chain.len(), 4);
        assert_eq!(&chain[1..], &added[..]);
        assert!(vol.next_cluster(*chain.last().unwrap()).unwrap().is_none());
    }

    #[test]
    fn test_allocation_advances_hint() {
        let mut vol = fat16_volume();
        let a = vol.allocate_cluster(None).unwrap();
        let b = vol.allocate_cluster(None).unwrap();
        assert_eq!(b, a + 1);
        assert_eq!(vol.next_free, b + 1);
    }

    #[test]
    fn test_allocation_wraps_around() {
        let mut vol = fat16_volume();
        let max = vol.geometry.max_cluster();
        vol.next_free = max;

        let last = vol.allocate_cluster(None).unwrap();
        assert_eq!(last, max);
        assert_eq!(vol.next_free, FIRST_DATA_CLUSTER);

        // Wraps to the first free cluster at the start of the data region.
        let wrapped = vol.allocate_cluster(None).unwrap();
        assert!(wrapped < max);
    }

    #[test]
    fn test_disk_full() {
        let mut vol = fat16_volume();
        let eoc = vol.geometry.layout.end_of_chain();
        for cluster in FIRST_DATA_CLUSTER..=vol.geometry.max_cluster() {
            if vol.fat_entry(cluster).unwrap() == FAT_FREE {
                vol.set_fat_entry(cluster, eoc).unwrap();
            }
        }
        assert!(matches!(vol.allocate_cluster(None), Err(FatError::DiskFull)));
        assert_eq!(vol.count_free_clusters().unwrap(), 0);
    }

    #[test]
    fn test_zero_entry_mid_chain_is_corruption() {
        let mut vol = fat16_volume();
        let first = vol.allocate_cluster(None).unwrap();
        let second = vol.allocate_cluster(Some(first)).unwrap();
        vol.set_fat_entry(second, FAT_FREE).unwrap();
        // `first` still points at `second`, which now reads as free
        vol.set_fat_entry(first, second).unwrap();

        let next = vol.next_cluster(first).unwrap();
        assert_eq!(next, Some(second));
        assert!(matches!(vol.cluster_chain(first), Err(FatError::ChainCorrupted(_))));
    }

    #[test]
    fn test_cycle_detected() {
        let mut vol = fat16_volume();
        let a = vol.allocate_cluster(None).unwrap();
        let b = vol.allocate_cluster(Some(a)).unwrap();
        vol.set_fat_entry(b, a).unwrap();
        assert!(matches!(vol.cluster_chain(a), Err(FatError::ChainCorrupted(_))));
    }

    #[test]
    fn test_free_and_truncate() {
        let mut vol = fat16_volume();
        let before = vol.count_free_clusters().unwrap();

        let first = vol.allocate_cluster(None).unwrap();
        vol.extend_chain(first, 4).unwrap();
        assert_eq!(vol.count_free_clusters().unwrap(), before - 5);

        assert_eq!(vol.truncate_chain(first).unwrap(), 4);
        assert_eq!(vol.cluster_chain(first).unwrap(), vec![first]);

        assert_eq!(vol.free_chain(first).unwrap(), 1);
        assert_eq!(vol.count_free_clusters().unwrap(), before);
        assert_eq!(vol.next_free, first);
    }

    #[test]
    fn test_fat32_preserves_reserved_bits() {
        let mut vol = fat32_volume();
        let cluster = vol.allocate_cluster(None).unwrap();
        let index = vol.geometry.layout.entry_offset(cluster);

        vol.fat.write_entry(&mut vol.device, index, 0xF000_0000 | FAT32_EOC_WRITE).unwrap();
        vol.set_fat_entry(cluster, 0x1234).unwrap();

        let raw = vol.fat.read_entry(&mut vol.device, index).unwrap();
        assert_eq!(raw, 0xF000_1234);
        assert_eq!(vol.fat_entry(cluster).unwrap(), 0x1234);
    }
}
