// 32-byte directory entry records: the 8.3 short entry and the VFAT
// long-filename fragment that may precede it

use super::constants::*;
use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, TimeZone, Timelike};
use static_assertions::{const_assert, const_assert_eq};

const_assert_eq!(STANDARD_BYTES_PER_SECTOR as usize % DIR_ENTRY_SIZE, 0);
const_assert!(LFN_MAX_ENTRIES * LFN_CHARS_PER_ENTRY >= LFN_MAX_CHARS);

/// Directory entry attributes
pub mod attributes {
    pub const ATTR_READ_ONLY: u8 = 0x01;
    pub const ATTR_HIDDEN: u8 = 0x02;
    pub const ATTR_SYSTEM: u8 = 0x04;
    pub const ATTR_VOLUME_ID: u8 = 0x08;
    pub const ATTR_DIRECTORY: u8 = 0x10;
    pub const ATTR_ARCHIVE: u8 = 0x20;
    pub const ATTR_LONG_NAME: u8 = ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_VOLUME_ID;
    pub const ATTR_LONG_NAME_MASK: u8 = 0x3F;
}

use attributes::*;

// Short entry field offsets
const DIR_NAME: usize = 0x00;
const DIR_ATTR: usize = 0x0B;
const DIR_NT_RES: usize = 0x0C;
const DIR_CRT_TIME_TENTH: usize = 0x0D;
const DIR_CRT_TIME: usize = 0x0E;
const DIR_CRT_DATE: usize = 0x10;
const DIR_LST_ACC_DATE: usize = 0x12;
const DIR_FST_CLUS_HI: usize = 0x14;
const DIR_WRT_TIME: usize = 0x16;
const DIR_WRT_DATE: usize = 0x18;
const DIR_FST_CLUS_LO: usize = 0x1A;
const DIR_FILE_SIZE: usize = 0x1C;

// Long entry field offsets
const LDIR_ORD: usize = 0x00;
const LDIR_NAME1: usize = 0x01; // 5 UTF-16 units
const LDIR_ATTR: usize = 0x0B;
const LDIR_TYPE: usize = 0x0C;
const LDIR_CHKSUM: usize = 0x0D;
const LDIR_NAME2: usize = 0x0E; // 6 UTF-16 units
const LDIR_FST_CLUS_LO: usize = 0x1A;
const LDIR_NAME3: usize = 0x1C; // 2 UTF-16 units

/// Byte offsets of the 13 name units inside a long entry
const LFN_UNIT_OFFSETS: [usize; LFN_CHARS_PER_ENTRY] = [
    LDIR_NAME1,
    LDIR_NAME1 + 2,
    LDIR_NAME1 + 4,
    LDIR_NAME1 + 6,
    LDIR_NAME1 + 8,
    LDIR_NAME2,
    LDIR_NAME2 + 2,
    LDIR_NAME2 + 4,
    LDIR_NAME2 + 6,
    LDIR_NAME2 + 8,
    LDIR_NAME2 + 10,
    LDIR_NAME3,
    LDIR_NAME3 + 2,
];

/// Classify a raw 32-byte slot by its first byte and attribute byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Never used; no live entries follow
    End,
    /// Deleted
    Free,
    LongName,
    Short,
}

pub fn slot_kind(slot: &[u8]) -> SlotKind {
    match slot[0] {
        DIR_ENTRY_END => SlotKind::End,
        DIR_ENTRY_FREE => SlotKind::Free,
        _ if slot[DIR_ATTR] & ATTR_LONG_NAME_MASK == ATTR_LONG_NAME => SlotKind::LongName,
        _ => SlotKind::Short,
    }
}

pub fn is_free_slot(slot: &[u8]) -> bool {
    matches!(slot_kind(slot), SlotKind::End | SlotKind::Free)
}

/// 8.3 short directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: [u8; 11],
    pub attributes: u8,
    pub nt_reserved: u8,
    pub creation_time_tenth: u8,
    pub creation_time: u16,
    pub creation_date: u16,
    pub last_access_date: u16,
    pub first_cluster_high: u16,
    pub write_time: u16,
    pub write_date: u16,
    pub first_cluster_low: u16,
    pub file_size: u32,
}

impl DirEntry {
    /// New entry stamped with the current local time
    pub fn new(name: [u8; 11], attributes: u8, first_cluster: u32, file_size: u32) -> Self {
        let (date, time) = encode_datetime(&Local::now());
        let mut entry = Self {
            name,
            attributes,
            nt_reserved: 0,
            creation_time_tenth: 0,
            creation_time: time,
            creation_date: date,
            last_access_date: date,
            first_cluster_high: 0,
            write_time: time,
            write_date: date,
            first_cluster_low: 0,
            file_size: if attributes & ATTR_DIRECTORY != 0 { 0 } else { file_size },
        };
        entry.set_first_cluster(first_cluster);
        entry
    }

    pub fn parse(bytes: &[u8]) -> Self {
        let mut name = [0u8; 11];
        name.copy_from_slice(&bytes[DIR_NAME..DIR_NAME + 11]);
        Self {
            name,
            attributes: bytes[DIR_ATTR],
            nt_reserved: bytes[DIR_NT_RES],
            creation_time_tenth: bytes[DIR_CRT_TIME_TENTH],
            creation_time: LittleEndian::read_u16(&bytes[DIR_CRT_TIME..]),
            creation_date: LittleEndian::read_u16(&bytes[DIR_CRT_DATE..]),
            last_access_date: LittleEndian::read_u16(&bytes[DIR_LST_ACC_DATE..]),
            first_cluster_high: LittleEndian::read_u16(&bytes[DIR_FST_CLUS_HI..]),
            write_time: LittleEndian::read_u16(&bytes[DIR_WRT_TIME..]),
            write_date: LittleEndian::read_u16(&bytes[DIR_WRT_DATE..]),
            first_cluster_low: LittleEndian::read_u16(&bytes[DIR_FST_CLUS_LO..]),
            file_size: LittleEndian::read_u32(&bytes[DIR_FILE_SIZE..]),
        }
    }

    pub fn to_bytes(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut b = [0u8; DIR_ENTRY_SIZE];
        b[DIR_NAME..DIR_NAME + 11].copy_from_slice(&self.name);
        b[DIR_ATTR] = self.attributes;
        b[DIR_NT_RES] = self.nt_reserved;
        b[DIR_CRT_TIME_TENTH] = self.creation_time_tenth;
        LittleEndian::write_u16(&mut b[DIR_CRT_TIME..], self.creation_time);
        LittleEndian::write_u16(&mut b[DIR_CRT_DATE..], self.creation_date);
        LittleEndian::write_u16(&mut b[DIR_LST_ACC_DATE..], self.last_access_date);
        LittleEndian::write_u16(&mut b[DIR_FST_CLUS_HI..], self.first_cluster_high);
        LittleEndian::write_u16(&mut b[DIR_WRT_TIME..], self.write_time);
        LittleEndian::write_u16(&mut b[DIR_WRT_DATE..], self.write_date);
        LittleEndian::write_u16(&mut b[DIR_FST_CLUS_LO..], self.first_cluster_low);
        LittleEndian::write_u32(&mut b[DIR_FILE_SIZE..], self.file_size);
        b
    }

    /// First cluster number (high word is 0 on FAT16)
    pub fn first_cluster(&self) -> u32 {
        ((self.first_cluster_high as u32) << 16) | (self.first_cluster_low as u32)
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.first_cluster_low = (cluster & 0xFFFF) as u16;
        self.first_cluster_high = ((cluster >> 16) & 0xFFFF) as u16;
    }

    pub fn is_directory(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }

    pub fn is_volume_label(&self) -> bool {
        self.attributes & ATTR_VOLUME_ID != 0 && self.attributes & ATTR_LONG_NAME_MASK != ATTR_LONG_NAME
    }

    /// `.` or `..`
    pub fn is_dot(&self) -> bool {
        self.name[0] == b'.'
    }

    /// Refresh the write/access stamps
    pub fn touch(&mut self) {
        let (date, time) = encode_datetime(&Local::now());
        self.write_date = date;
        self.write_time = time;
        self.last_access_date = date;
    }

    pub fn modified(&self) -> Option<NaiveDateTime> {
        decode_datetime(self.write_date, self.write_time)
    }
}

/// One VFAT long-filename fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongNameEntry {
    /// Sequence number; `LFN_LAST_ENTRY` marks the final fragment
    pub order: u8,
    pub name: [u16; LFN_CHARS_PER_ENTRY],
    pub checksum: u8,
}

impl LongNameEntry {
    pub fn parse(bytes: &[u8]) -> Self {
        let mut name = [0u16; LFN_CHARS_PER_ENTRY];
        for (unit, &offset) in name.iter_mut().zip(LFN_UNIT_OFFSETS.iter()) {
            *unit = LittleEndian::read_u16(&bytes[offset..]);
        }
        Self {
            order: bytes[LDIR_ORD],
            name,
            checksum: bytes[LDIR_CHKSUM],
        }
    }

    pub fn to_bytes(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut b = [0u8; DIR_ENTRY_SIZE];
        b[LDIR_ORD] = self.order;
        for (&unit, &offset) in self.name.iter().zip(LFN_UNIT_OFFSETS.iter()) {
            LittleEndian::write_u16(&mut b[offset..], unit);
        }
        b[LDIR_ATTR] = ATTR_LONG_NAME;
        b[LDIR_TYPE] = 0;
        b[LDIR_CHKSUM] = self.checksum;
        LittleEndian::write_u16(&mut b[LDIR_FST_CLUS_LO..], 0);
        b
    }

    /// 1-based position of this fragment in the name
    pub fn sequence(&self) -> u8 {
        self.order & LFN_ORDER_MASK
    }

    pub fn is_last(&self) -> bool {
        self.order & LFN_LAST_ENTRY != 0
    }

    /// Name units up to the terminator
    pub fn units(&self) -> impl Iterator<Item = u16> + '_ {
        self.name.iter().copied().take_while(|&u| u != 0x0000 && u != 0xFFFF)
    }
}

/// Encode a timestamp into FAT (date, time) words
pub fn encode_datetime<Tz: TimeZone>(dt: &DateTime<Tz>) -> (u16, u16) {
    let year = dt.year().clamp(1980, 2107);
    let date = ((year - 1980) as u16) << 9 | (dt.month() as u16) << 5 | dt.day() as u16;
    let time = (dt.hour() as u16) << 11 | (dt.minute() as u16) << 5 | (dt.second() as u16 / 2);
    (date, time)
}

pub fn decode_datetime(date: u16, time: u16) -> Option<NaiveDateTime> {
    let year = 1980 + (date >> 9) as i32;
    let month = ((date >> 5) & 0x0F) as u32;
    let day = (date & 0x1F) as u32;
    let hour = (time >> 11) as u32;
    let minute = ((time >> 5) & 0x3F) as u32;
    let second = ((time & 0x1F) * 2) as u32;
    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_short_entry_layout() {
        let mut entry = DirEntry::new(*b"HELLO   TXT", ATTR_ARCHIVE, 0x0001_0023, 14);
        entry.write_time = 0x1234;
        let bytes = entry.to_bytes();

        assert_eq!(&bytes[0..11], b"HELLO   TXT");
        assert_eq!(bytes[11], ATTR_ARCHIVE);
        assert_eq!(&bytes[20..22], &[0x01, 0x00]); // cluster high
        assert_eq!(&bytes[26..28], &[0x23, 0x00]); // cluster low
        assert_eq!(&bytes[28..32], &[14, 0, 0, 0]);
        assert_eq!(&bytes[22..24], &[0x34, 0x12]);

        let parsed = DirEntry::parse(&bytes);
        assert_eq!(parsed, entry);
        assert_eq!(parsed.first_cluster(), 0x0001_0023);
    }

    #[test]
    fn test_directory_entries_have_no_size() {
        let entry = DirEntry::new(*b"SUBDIR     ", ATTR_DIRECTORY, 5, 4096);
        assert_eq!(entry.file_size, 0);
        assert!(entry.is_directory());
    }

    #[test]
    fn test_long_entry_layout() {
        let mut name = [0xFFFFu16; 13];
        for (i, unit) in "hello.txt".encode_utf16().enumerate() {
            name[i] = unit;
        }
        name[9] = 0;
        let entry = LongNameEntry { order: 0x41, name, checksum: 0xAB };
        let bytes = entry.to_bytes();

        assert_eq!(bytes[0], 0x41);
        assert_eq!(&bytes[1..3], &[b'h', 0]);
        assert_eq!(bytes[11], ATTR_LONG_NAME);
        assert_eq!(bytes[13], 0xAB);
        assert_eq!(&bytes[14..16], &[b'.', 0]); // sixth unit starts name2
        assert_eq!(&bytes[26..28], &[0, 0]);
        assert_eq!(slot_kind(&bytes), SlotKind::LongName);

        let parsed = LongNameEntry::parse(&bytes);
        assert_eq!(parsed, entry);
        assert!(parsed.is_last());
        assert_eq!(parsed.sequence(), 1);
        assert_eq!(String::from_utf16_lossy(&parsed.units().collect::<Vec<_>>()), "hello.txt");
    }

    #[test]
    fn test_slot_kinds() {
        let mut slot = [0u8; 32];
        assert_eq!(slot_kind(&slot), SlotKind::End);
        slot[0] = DIR_ENTRY_FREE;
        assert_eq!(slot_kind(&slot), SlotKind::Free);
        assert!(is_free_slot(&slot));
        slot[0] = b'A';
        assert_eq!(slot_kind(&slot), SlotKind::Short);
        assert!(!is_free_slot(&slot));
    }

    #[test]
    fn test_datetime_encoding() {
        let dt = Utc.with_ymd_and_hms(2013, 8, 30, 1, 55, 42).unwrap();
        let (date, time) = encode_datetime(&dt);
        let decoded = decode_datetime(date, time).unwrap();
        assert_eq!(decoded.to_string(), "2013-08-30 01:55:42");
    }
}
