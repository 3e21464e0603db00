// FAT32 FSInfo sector: free-cluster count and next-free hint

use super::constants::*;
use byteorder::{ByteOrder, LittleEndian};
use log::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsInfo {
    pub free_count: u32,
    pub next_free: u32,
}

impl FsInfo {
    /// Decode an FSInfo sector. Returns `None` when any signature is wrong.
    pub fn parse(sector: &[u8]) -> Option<Self> {
        if sector.len() < BOOT_SECTOR_SIZE {
            return None;
        }
        let lead = LittleEndian::read_u32(&sector[FSI_LEAD_SIG_OFFSET..]);
        let struc = LittleEndian::read_u32(&sector[FSI_STRUC_SIG_OFFSET..]);
        let trail = LittleEndian::read_u32(&sector[FSI_TRAIL_SIG_OFFSET..]);
        if lead != FSI_LEAD_SIG || struc != FSI_STRUC_SIG || trail != FSI_TRAIL_SIG {
            warn!(
                "FSInfo signatures invalid (lead {:08X}, struct {:08X}, trail {:08X})",
                lead, struc, trail
            );
            return None;
        }
        Some(Self {
            free_count: LittleEndian::read_u32(&sector[FSI_FREE_COUNT_OFFSET..]),
            next_free: LittleEndian::read_u32(&sector[FSI_NXT_FREE_OFFSET..]),
        })
    }

    /// Next-free hint clamped to the valid cluster range `2..total_clusters + 2`.
    pub fn next_free_hint(&self, total_clusters: u32) -> u32 {
        let max = total_clusters.saturating_add(FIRST_DATA_CLUSTER);
        if self.next_free == FSI_UNKNOWN || self.next_free < FIRST_DATA_CLUSTER || self.next_free >= max {
            if self.next_free != FSI_UNKNOWN {
                warn!("FSInfo next-free {} out of range, starting at cluster 2", self.next_free);
            }
            FIRST_DATA_CLUSTER
        } else {
            self.next_free
        }
    }

    pub fn to_bytes(&self) -> [u8; BOOT_SECTOR_SIZE] {
        let mut b = [0u8; BOOT_SECTOR_SIZE];
        LittleEndian::write_u32(&mut b[FSI_LEAD_SIG_OFFSET..], FSI_LEAD_SIG);
        LittleEndian::write_u32(&mut b[FSI_STRUC_SIG_OFFSET..], FSI_STRUC_SIG);
        LittleEndian::write_u32(&mut b[FSI_FREE_COUNT_OFFSET..], self.free_count);
        LittleEndian::write_u32(&mut b[FSI_NXT_FREE_OFFSET..], self.next_free);
        LittleEndian::write_u32(&mut b[FSI_TRAIL_SIG_OFFSET..], FSI_TRAIL_SIG);
        b
    }
}
