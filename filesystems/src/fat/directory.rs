// Directory scanning and entry allocation
// A directory is either the fixed FAT16 root region or a cluster chain.
// Entries are addressed by (cluster, sector, offset) so they can be
// rewritten in place later.

use super::constants::*;
use super::dir_entry::{attributes::*, is_free_slot, slot_kind, DirEntry, LongNameEntry, SlotKind};
use super::layout::{FatVariant, RootDir};
use super::names::{generate_long_name_entries, generate_short_name, LongNameAccumulator, ShortName};
use super::volume::FatVolume;
use chrono::NaiveDateTime;
use fat2fs_core::{BlockDevice, FatError, FatResult};
use log::{debug, trace};

/// Position of one 32-byte slot on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirLocation {
    /// Owning cluster, 0 for the fixed FAT16 root region
    pub cluster: u32,
    /// Absolute sector number
    pub sector: u32,
    /// Byte offset inside the sector
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directory {
    Root,
    Cluster(u32),
}

impl Directory {
    /// Directory whose first cluster is `cluster`. Cluster 0 is how `..`
    /// entries refer to the root.
    pub fn from_cluster(cluster: u32) -> Self {
        if cluster == 0 {
            Directory::Root
        } else {
            Directory::Cluster(cluster)
        }
    }

    /// Value stored in the first-cluster field of entries pointing here
    pub fn cluster_number(&self) -> u32 {
        match self {
            Directory::Root => 0,
            Directory::Cluster(c) => *c,
        }
    }
}

/// A live directory entry together with the long name that precedes it
#[derive(Debug, Clone)]
pub struct DirRecord {
    /// Long name if present, the short name otherwise
    pub name: String,
    pub short_name: ShortName,
    pub entry: DirEntry,
    pub location: DirLocation,
    pub lfn_locations: Vec<DirLocation>,
}

impl DirRecord {
    pub fn is_directory(&self) -> bool {
        self.entry.is_directory()
    }

    pub fn is_dot(&self) -> bool {
        self.entry.is_dot()
    }

    pub fn first_cluster(&self) -> u32 {
        self.entry.first_cluster()
    }

    pub fn size(&self) -> u32 {
        self.entry.file_size
    }

    pub fn attributes(&self) -> u8 {
        self.entry.attributes
    }

    pub fn modified(&self) -> Option<NaiveDateTime> {
        self.entry.modified()
    }

    /// Case-insensitive match against either name
    pub fn matches(&self, name: &str) -> bool {
        let wanted = name.to_lowercase();
        self.name.to_lowercase() == wanted || self.short_name.to_string().to_lowercase() == wanted
    }

    pub fn as_directory(&self) -> Directory {
        Directory::from_cluster(self.first_cluster())
    }
}

impl<D: BlockDevice> FatVolume<D> {
    fn dir_region(&self, dir: Directory) -> RootDir {
        match dir {
            Directory::Root => self.geometry.layout.root_dir(),
            Directory::Cluster(cluster) => RootDir::Chain { cluster },
        }
    }

    /// (cluster, sector) pairs covering the directory, in order
    fn directory_sectors(&mut self, dir: Directory) -> FatResult<Vec<(u32, u32)>> {
        match self.dir_region(dir) {
            RootDir::Fixed { start_sector, sectors } => {
                Ok((start_sector..start_sector + sectors).map(|s| (0, s)).collect())
            }
            RootDir::Chain { cluster } => {
                let spc = self.geometry.sectors_per_cluster;
                let mut out = Vec::new();
                for c in self.cluster_chain(cluster)? {
                    let first = self.geometry.cluster_to_sector(c);
                    out.extend((first..first + spc).map(|s| (c, s)));
                }
                Ok(out)
            }
        }
    }

    fn read_sector(&mut self, sector: u32, buf: &mut [u8]) -> FatResult<()> {
        self.device.read_blocks(sector as u64, 1, buf)
    }

    /// All live entries of `dir`, long names reassembled. Volume labels and
    /// orphaned long-name fragments are skipped; `.` and `..` are kept.
    pub fn read_entries(&mut self, dir: Directory) -> FatResult<Vec<DirRecord>> {
        let bps = self.geometry.bytes_per_sector as usize;
        let mut buf = vec![0u8; bps];
        let mut records = Vec::new();
        let mut lfn = LongNameAccumulator::new();
        let mut lfn_locations = Vec::new();

        'scan: for (cluster, sector) in self.directory_sectors(dir)? {
            self.read_sector(sector, &mut buf)?;

            for offset in (0..bps).step_by(DIR_ENTRY_SIZE) {
                let slot = &buf[offset..offset + DIR_ENTRY_SIZE];
                let location = DirLocation { cluster, sector, offset: offset as u32 };

                match slot_kind(slot) {
                    SlotKind::End => break 'scan,
                    SlotKind::Free => {
                        lfn.reset();
                        lfn_locations.clear();
                    }
                    SlotKind::LongName => {
                        let fragment = LongNameEntry::parse(slot);
                        if fragment.is_last() {
                            lfn_locations.clear();
                        }
                        lfn.push(&fragment);
                        lfn_locations.push(location);
                    }
                    SlotKind::Short => {
                        let entry = DirEntry::parse(slot);
                        let short_name = ShortName::from_raw(entry.name);
                        let long_name = lfn.finish(&short_name);
                        let lfn_locs = std::mem::take(&mut lfn_locations);

                        if entry.is_volume_label() {
                            continue;
                        }

                        let (name, lfn_locations) = match long_name {
                            Some(name) => (name, lfn_locs),
                            None => (short_name.to_string(), Vec::new()),
                        };
                        records.push(DirRecord { name, short_name, entry, location, lfn_locations });
                    }
                }
            }
        }

        trace!("Read {} entries from {:?}", records.len(), dir);
        Ok(records)
    }

    /// Short names of every live entry, including the volume label
    fn short_names(&mut self, dir: Directory) -> FatResult<Vec<ShortName>> {
        let bps = self.geometry.bytes_per_sector as usize;
        let mut buf = vec![0u8; bps];
        let mut names = Vec::new();

        'scan: for (_, sector) in self.directory_sectors(dir)? {
            self.read_sector(sector, &mut buf)?;
            for slot in buf.chunks_exact(DIR_ENTRY_SIZE) {
                match slot_kind(slot) {
                    SlotKind::End => break 'scan,
                    SlotKind::Short => names.push(ShortName::from_raw(DirEntry::parse(slot).name)),
                    _ => {}
                }
            }
        }
        Ok(names)
    }

    pub fn find_entry(&mut self, dir: Directory, name: &str) -> FatResult<Option<DirRecord>> {
        Ok(self.read_entries(dir)?.into_iter().find(|r| r.matches(name)))
    }

    /// Reserve `count` contiguous free slots in `dir`. Chained directories
    /// grow by one zeroed cluster at a time when no run is long enough; the
    /// fixed FAT16 root fails with `DirectoryFull`.
    pub fn find_free_slots(&mut self, dir: Directory, count: usize) -> FatResult<Vec<DirLocation>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let bps = self.geometry.bytes_per_sector as usize;
        let mut buf = vec![0u8; bps];
        let mut run: Vec<DirLocation> = Vec::with_capacity(count);
        let sectors = self.directory_sectors(dir)?;

        for &(cluster, sector) in &sectors {
            self.read_sector(sector, &mut buf)?;
            for offset in (0..bps).step_by(DIR_ENTRY_SIZE) {
                if is_free_slot(&buf[offset..offset + DIR_ENTRY_SIZE]) {
                    run.push(DirLocation { cluster, sector, offset: offset as u32 });
                    if run.len() == count {
                        return Ok(run);
                    }
                } else {
                    run.clear();
                }
            }
        }

        let mut tail = match self.dir_region(dir) {
            RootDir::Fixed { .. } => {
                return Err(FatError::DirectoryFull(format!(
                    "root directory has no run of {} free entries",
                    count
                )))
            }
            RootDir::Chain { cluster } => sectors.last().map(|&(c, _)| c).unwrap_or(cluster),
        };

        // The run may continue into the new clusters.
        while run.len() < count {
            self.ensure_writable()?;
            let cluster = self.allocate_zeroed_cluster(Some(tail))?;
            debug!("Directory {:?} extended with cluster {}", dir, cluster);

            let first = self.geometry.cluster_to_sector(cluster);
            'fill: for sector in first..first + self.geometry.sectors_per_cluster {
                for offset in (0..bps).step_by(DIR_ENTRY_SIZE) {
                    run.push(DirLocation { cluster, sector, offset: offset as u32 });
                    if run.len() == count {
                        break 'fill;
                    }
                }
            }
            tail = cluster;
        }

        Ok(run)
    }

    /// Write raw 32-byte records to their slots in the given order, one
    /// device write per touched sector.
    pub fn write_entries(&mut self, slots: &[DirLocation], records: &[[u8; DIR_ENTRY_SIZE]]) -> FatResult<()> {
        self.ensure_writable()?;
        if slots.len() != records.len() {
            return Err(FatError::InvalidInput(format!(
                "{} slots for {} directory records",
                slots.len(),
                records.len()
            )));
        }

        let mut buf = vec![0u8; self.geometry.bytes_per_sector as usize];
        let mut i = 0;
        while i < slots.len() {
            let sector = slots[i].sector;
            self.read_sector(sector, &mut buf)?;
            while i < slots.len() && slots[i].sector == sector {
                let offset = slots[i].offset as usize;
                buf[offset..offset + DIR_ENTRY_SIZE].copy_from_slice(&records[i]);
                i += 1;
            }
            self.device.write_blocks(sector as u64, 1, &buf)?;
        }
        Ok(())
    }

    pub(crate) fn update_entry(&mut self, location: DirLocation, entry: &DirEntry) -> FatResult<()> {
        self.write_entries(&[location], &[entry.to_bytes()])
    }

    /// Create a directory entry named `name` in `dir`: long-name fragments
    /// first, the short entry last.
    pub(crate) fn create_entry(
        &mut self,
        dir: Directory,
        name: &str,
        attributes: u8,
        first_cluster: u32,
        size: u32,
    ) -> FatResult<DirRecord> {
        self.ensure_writable()?;

        let existing = self.short_names(dir)?;
        let generated = generate_short_name(&existing, name, attributes)?;
        let entry = DirEntry::new(*generated.short_name.as_bytes(), attributes, first_cluster, size);

        let long_entries = if generated.needs_long_entries {
            generate_long_name_entries(&generated.long_name, generated.short_name.checksum())?
        } else {
            Vec::new()
        };

        let slots = self.find_free_slots(dir, long_entries.len() + 1)?;
        let mut records: Vec<[u8; DIR_ENTRY_SIZE]> = long_entries.iter().map(|e| e.to_bytes()).collect();
        records.push(entry.to_bytes());
        self.write_entries(&slots, &records)?;

        debug!(
            "Created entry {:?} ({}) with {} long-name fragments",
            generated.long_name,
            generated.short_name,
            long_entries.len()
        );

        let (lfn_locations, location) = slots.split_at(slots.len() - 1);
        Ok(DirRecord {
            name: generated.long_name,
            short_name: generated.short_name,
            entry,
            location: location[0],
            lfn_locations: lfn_locations.to_vec(),
        })
    }

    /// Mark an entry and its long-name fragments deleted
    pub(crate) fn delete_entry(&mut self, record: &DirRecord) -> FatResult<()> {
        let mut slots = record.lfn_locations.clone();
        slots.push(record.location);

        for slot in slots {
            let mut bytes = [0u8; DIR_ENTRY_SIZE];
            let mut buf = vec![0u8; self.geometry.bytes_per_sector as usize];
            self.read_sector(slot.sector, &mut buf)?;
            bytes.copy_from_slice(&buf[slot.offset as usize..slot.offset as usize + DIR_ENTRY_SIZE]);
            bytes[0] = DIR_ENTRY_FREE;
            self.write_entries(&[slot], &[bytes])?;
        }
        Ok(())
    }

    /// Write `.` and `..` into the first slots of a fresh directory cluster
    pub(crate) fn init_directory(&mut self, cluster: u32, parent: Directory) -> FatResult<()> {
        let sector = self.geometry.cluster_to_sector(cluster);
        let dot = DirEntry::new(*ShortName::DOT.as_bytes(), ATTR_DIRECTORY, cluster, 0);
        let dot_dot = DirEntry::new(*ShortName::DOT_DOT.as_bytes(), ATTR_DIRECTORY, parent.cluster_number(), 0);

        let slots = [
            DirLocation { cluster, sector, offset: 0 },
            DirLocation { cluster, sector, offset: DIR_ENTRY_SIZE as u32 },
        ];
        self.write_entries(&slots, &[dot.to_bytes(), dot_dot.to_bytes()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fat::volume::tests::{fat16_volume, fat32_volume};

    #[test]
    fn test_empty_root_has_free_slots() {
        let mut vol = fat16_volume();
        let slots = vol.find_free_slots(Directory::Root, 3).unwrap();
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].cluster, 0);
        assert_eq!(slots[0].offset, 0);
        assert_eq!(slots[1].offset, 32);
        assert_eq!(slots[2].offset, 64);
    }

    #[test]
    fn test_create_entry_with_long_name() {
        let mut vol = fat16_volume();
        let record = vol
            .create_entry(Directory::Root, "hello world.txt", ATTR_ARCHIVE, 0, 0)
            .unwrap();
        assert_eq!(record.lfn_locations.len(), 2);
        assert_eq!(record.short_name.as_bytes(), b"HELLOWORTXT");

        let entries = vol.read_entries(Directory::Root).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "hello world.txt");
        assert_eq!(entries[0].location, record.location);
        assert_eq!(entries[0].lfn_locations, record.lfn_locations);
    }

    #[test]
    fn test_short_entry_follows_fragments_on_disk() {
        let mut vol = fat16_volume();
        let record = vol.create_entry(Directory::Root, "lower.txt", ATTR_ARCHIVE, 0, 0).unwrap();

        let mut buf = vec![0u8; 512];
        vol.device.read_blocks(record.location.sector as u64, 1, &mut buf).unwrap();
        let lfn_slot = record.lfn_locations[0].offset as usize;
        assert_eq!(buf[lfn_slot], 0x41);
        assert_eq!(buf[lfn_slot + 11], ATTR_LONG_NAME);
        assert_eq!(record.location.offset as usize, lfn_slot + 32);
    }

    #[test]
    fn test_numeric_tail_on_collision() {
        let mut vol = fat16_volume();
        vol.create_entry(Directory::Root, "FILE.TXT", ATTR_ARCHIVE, 0, 0).unwrap();
        let second = vol.create_entry(Directory::Root, "file.txt", ATTR_ARCHIVE, 0, 0).unwrap();
        assert_eq!(second.short_name.as_bytes(), b"FILE~1  TXT");
    }

    #[test]
    fn test_deleted_slots_are_reused() {
        let mut vol = fat16_volume();
        let a = vol.create_entry(Directory::Root, "A.TXT", ATTR_ARCHIVE, 0, 0).unwrap();
        vol.create_entry(Directory::Root, "B.TXT", ATTR_ARCHIVE, 0, 0).unwrap();
        vol.delete_entry(&a).unwrap();

        let slots = vol.find_free_slots(Directory::Root, 1).unwrap();
        assert_eq!(slots[0], a.location);

        // A run of two cannot use the single hole.
        let slots = vol.find_free_slots(Directory::Root, 2).unwrap();
        assert_eq!(slots[0].offset, 64);
    }

    #[test]
    fn test_fixed_root_fills_up() {
        let mut vol = fat16_volume();
        let capacity = match vol.geometry.layout.root_dir() {
            RootDir::Fixed { sectors, .. } => sectors as usize * 16,
            RootDir::Chain { .. } => unreachable!(),
        };
        for i in 0..capacity {
            vol.create_entry(Directory::Root, &format!("F{}", i), ATTR_ARCHIVE, 0, 0).unwrap();
        }
        assert!(matches!(
            vol.create_entry(Directory::Root, "ONEMORE", ATTR_ARCHIVE, 0, 0),
            Err(FatError::DirectoryFull(_))
        ));
    }

    #[test]
    fn test_chained_directory_grows() {
        let mut vol = fat32_volume();
        let root_cluster = match vol.geometry.layout.root_dir() {
            RootDir::Chain { cluster } => cluster,
            RootDir::Fixed { .. } => unreachable!(),
        };
        let per_cluster = (vol.geometry.bytes_per_cluster() / 32) as usize;

        for i in 0..per_cluster {
            vol.create_entry(Directory::Root, &format!("F{}", i), ATTR_ARCHIVE, 0, 0).unwrap();
        }
        assert_eq!(vol.cluster_chain(root_cluster).unwrap().len(), 1);

        let record = vol.create_entry(Directory::Root, "OVERFLOW", ATTR_ARCHIVE, 0, 0).unwrap();
        let chain = vol.cluster_chain(root_cluster).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(record.location.cluster, chain[1]);
        assert_eq!(vol.read_entries(Directory::Root).unwrap().len(), per_cluster + 1);
    }

    #[test]
    fn test_long_name_run_spans_new_cluster() {
        let mut vol = fat32_volume();
        let per_cluster = (vol.geometry.bytes_per_cluster() / 32) as usize;
        for i in 0..per_cluster - 1 {
            vol.create_entry(Directory::Root, &format!("F{}", i), ATTR_ARCHIVE, 0, 0).unwrap();
        }

        // Four slots: one left in the first cluster, three in the new one.
        let record = vol
            .create_entry(Directory::Root, "a name needing two fragments", ATTR_ARCHIVE, 0, 0)
            .unwrap();
        assert_ne!(record.lfn_locations[0].cluster, record.location.cluster);

        let found = vol.find_entry(Directory::Root, "A NAME NEEDING TWO FRAGMENTS").unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn test_subdirectory_dot_entries() {
        let mut vol = fat16_volume();
        let cluster = vol.allocate_zeroed_cluster(None).unwrap();
        vol.init_directory(cluster, Directory::Root).unwrap();

        let entries = vol.read_entries(Directory::Cluster(cluster)).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.is_dot() && e.is_directory()));
        assert_eq!(entries[0].first_cluster(), cluster);
        assert_eq!(entries[1].first_cluster(), 0);
        assert_eq!(entries[1].as_directory(), Directory::Root);
    }

    #[test]
    fn test_orphaned_fragment_ignored() {
        let mut vol = fat16_volume();
        let record = vol.create_entry(Directory::Root, "mixed Case.txt", ATTR_ARCHIVE, 0, 0).unwrap();

        // Corrupt the short name so the checksum no longer matches.
        let mut entry = record.entry.clone();
        entry.name[0] = b'Z';
        vol.update_entry(record.location, &entry).unwrap();

        let entries = vol.read_entries(Directory::Root).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].lfn_locations.is_empty());
        assert!(entries[0].name.starts_with('Z'));
    }
}
