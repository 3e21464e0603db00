// Filename codec: 8.3 short names with numeric tails, VFAT long-name
// fragments and the short-name checksum that ties them together

use super::constants::*;
use super::dir_entry::{attributes::ATTR_VOLUME_ID, LongNameEntry};
use fat2fs_core::{FatError, FatResult};
use log::trace;
use std::fmt;

/// Space-padded 8.3 name as stored on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShortName([u8; 11]);

impl ShortName {
    pub const DOT: ShortName = ShortName(*b".          ");
    pub const DOT_DOT: ShortName = ShortName(*b"..         ");

    pub fn from_raw(raw: [u8; 11]) -> Self {
        Self(raw)
    }

    /// Pad `base` to 8 and `ext` to 3 bytes
    pub fn from_parts(base: &str, ext: &str) -> Self {
        let mut raw = [b' '; 11];
        for (dst, src) in raw[..8].iter_mut().zip(base.bytes()) {
            *dst = src;
        }
        for (dst, src) in raw[8..].iter_mut().zip(ext.bytes()) {
            *dst = src;
        }
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; 11] {
        &self.0
    }

    pub fn checksum(&self) -> u8 {
        checksum(&self.0)
    }

    fn base(&self) -> String {
        let base: String = self.0[..8]
            .iter()
            .enumerate()
            .map(|(i, &b)| if i == 0 && b == DIR_ENTRY_KANJI_E5 { DIR_ENTRY_FREE as char } else { b as char })
            .collect();
        base.trim_end().to_string()
    }

    fn ext(&self) -> String {
        let ext: String = self.0[8..].iter().map(|&b| b as char).collect();
        ext.trim_end().to_string()
    }
}

impl fmt::Display for ShortName {
    /// `BASE.EXT`, or just `BASE` when the extension is blank
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ext = self.ext();
        if ext.is_empty() {
            write!(f, "{}", self.base())
        } else {
            write!(f, "{}.{}", self.base(), ext)
        }
    }
}

/// Short-name checksum stored in every long-name fragment
pub fn checksum(short_name: &[u8; 11]) -> u8 {
    let mut sum: u8 = 0;
    for &byte in short_name {
        sum = ((sum >> 1) | (sum << 7)).wrapping_add(byte);
    }
    sum
}

/// Characters allowed in an 8.3 name besides A-Z and 0-9
fn is_short_name_char(c: char) -> bool {
    matches!(c,
        'A'..='Z' | '0'..='9' | '!' | '#' | '$' | '%' | '&' | '\'' |
        '(' | ')' | '-' | '@' | '^' | '_' | '`' | '{' | '}' | '~')
}

/// Characters never allowed, even in a long name
fn is_forbidden_char(c: char) -> bool {
    c < ' ' || matches!(c, '"' | '*' | '/' | ':' | '<' | '>' | '?' | '\\' | '|')
}

/// Uppercase and drop everything that cannot appear in an 8.3 component
fn sanitize_component(s: &str) -> String {
    s.chars()
        .map(|c| c.to_ascii_uppercase())
        .filter(|&c| is_short_name_char(c))
        .collect()
}

/// Result of short-name generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedName {
    pub short_name: ShortName,
    /// Name to store in long-name fragments (trimmed request)
    pub long_name: String,
    /// The short name alone does not reproduce `long_name`
    pub needs_long_entries: bool,
}

/// Check a requested name and return it trimmed of surrounding whitespace
/// and trailing dots.
pub fn validate_long_name(requested: &str) -> FatResult<&str> {
    let name = requested.trim().trim_end_matches('.');
    if name.is_empty() {
        return Err(FatError::InvalidFilename(format!("{:?}", requested)));
    }
    if let Some(c) = name.chars().find(|&c| is_forbidden_char(c)) {
        return Err(FatError::InvalidFilename(format!(
            "{:?} contains forbidden character {:?}",
            requested, c
        )));
    }
    if name.encode_utf16().count() > LFN_MAX_CHARS {
        return Err(FatError::FilenameTooLong(format!(
            "{} UTF-16 units, limit is {}",
            name.encode_utf16().count(),
            LFN_MAX_CHARS
        )));
    }
    Ok(name)
}

/// Derive a unique 8.3 name for `requested` among `existing`.
///
/// The name is trimmed, uppercased and split at its last dot; characters
/// that are illegal in 8.3 names are dropped, the base is cut to 8 and the
/// extension to 3 characters. On a collision a `~n` tail (n from 1) replaces
/// the end of the base. Volume labels are packed into all 11 bytes instead.
///
/// Fails with `DirectoryFull` once every tail up to `~999999` is taken.
pub fn generate_short_name(
    existing: &[ShortName],
    requested: &str,
    attributes: u8,
) -> FatResult<GeneratedName> {
    let name = validate_long_name(requested)?;

    if attributes & ATTR_VOLUME_ID != 0 {
        return volume_label_name(name);
    }

    let stem = name.trim_start_matches('.');
    let (raw_base, raw_ext) = match stem.rfind('.') {
        Some(pos) => (&stem[..pos], &stem[pos + 1..]),
        None => (stem, ""),
    };

    let base = sanitize_component(raw_base);
    let ext: String = sanitize_component(raw_ext).chars().take(3).collect();
    if base.is_empty() {
        return Err(FatError::InvalidFilename(format!(
            "{:?} has no characters usable in a short name",
            requested
        )));
    }

    let truncated: String = base.chars().take(8).collect();
    let mut short_name = ShortName::from_parts(&truncated, &ext);

    if existing.contains(&short_name) {
        short_name = numeric_tail(existing, &base, &ext).ok_or_else(|| {
            FatError::DirectoryFull(format!("no unique short name left for {:?}", name))
        })?;
    }

    trace!("Short name for {:?}: {}", name, short_name);
    Ok(GeneratedName {
        short_name,
        long_name: name.to_string(),
        needs_long_entries: short_name.to_string() != name,
    })
}

/// First `BASE~n.EXT` not present in `existing`
fn numeric_tail(existing: &[ShortName], base: &str, ext: &str) -> Option<ShortName> {
    (1..=999_999u32).find_map(|n| {
        let tail = format!("~{}", n);
        let keep = 8 - tail.len();
        let prefix: String = base.chars().take(keep).collect();
        let candidate = ShortName::from_parts(&format!("{}{}", prefix, tail), ext);
        (!existing.contains(&candidate)).then_some(candidate)
    })
}

fn volume_label_name(name: &str) -> FatResult<GeneratedName> {
    let label: String = name
        .chars()
        .map(|c| c.to_ascii_uppercase())
        .filter(|&c| c == ' ' || is_short_name_char(c))
        .take(11)
        .collect();
    if label.trim().is_empty() {
        return Err(FatError::InvalidFilename(format!("volume label {:?}", name)));
    }

    let mut raw = [b' '; 11];
    for (dst, src) in raw.iter_mut().zip(label.bytes()) {
        *dst = src;
    }
    Ok(GeneratedName {
        short_name: ShortName::from_raw(raw),
        long_name: label.trim_end().to_string(),
        needs_long_entries: false,
    })
}

/// Number of long-name fragments needed for `name`
pub fn long_entry_count(name: &str) -> usize {
    let units = name.encode_utf16().count();
    (units + LFN_CHARS_PER_ENTRY - 1) / LFN_CHARS_PER_ENTRY
}

/// Build the long-name fragments for `name`, in on-disk order: the
/// fragment flagged last comes first and sequence 1 sits right before
/// the short entry.
pub fn generate_long_name_entries(name: &str, checksum: u8) -> FatResult<Vec<LongNameEntry>> {
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.is_empty() {
        return Err(FatError::InvalidFilename("empty long name".to_string()));
    }
    if units.len() > LFN_MAX_CHARS {
        return Err(FatError::FilenameTooLong(format!(
            "{} UTF-16 units, limit is {}",
            units.len(),
            LFN_MAX_CHARS
        )));
    }

    let count = long_entry_count(name);
    let mut entries = Vec::with_capacity(count);

    for index in 0..count {
        // Terminated with 0x0000 when there is room, padded with 0xFFFF.
        let mut fragment = [0xFFFFu16; LFN_CHARS_PER_ENTRY];
        let start = index * LFN_CHARS_PER_ENTRY;
        for (i, slot) in fragment.iter_mut().enumerate() {
            match units.get(start + i) {
                Some(&unit) => *slot = unit,
                None => {
                    *slot = 0x0000;
                    break;
                }
            }
        }

        let mut order = (index + 1) as u8;
        if index == count - 1 {
            order |= LFN_LAST_ENTRY;
        }
        entries.push(LongNameEntry { order, name: fragment, checksum });
    }

    entries.reverse();
    Ok(entries)
}

/// Reassembles a long name from fragments met while scanning a directory
#[derive(Debug, Default)]
pub struct LongNameAccumulator {
    parts: Vec<[u16; LFN_CHARS_PER_ENTRY]>,
    checksum: u8,
    /// Sequence number expected next; 0 once sequence 1 was seen
    expected: u8,
    active: bool,
}

impl LongNameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.parts.clear();
        self.active = false;
        self.expected = 0;
    }

    /// Feed one long-name fragment. Fragments out of sequence discard what
    /// was collected so far.
    pub fn push(&mut self, entry: &LongNameEntry) {
        let seq = entry.sequence();
        if entry.is_last() {
            self.reset();
            if seq == 0 || seq as usize > LFN_MAX_ENTRIES {
                return;
            }
            self.parts = vec![[0xFFFF; LFN_CHARS_PER_ENTRY]; seq as usize];
            self.checksum = entry.checksum;
            self.active = true;
        } else if !self.active || seq == 0 || seq != self.expected || entry.checksum != self.checksum {
            self.reset();
            return;
        }

        self.parts[seq as usize - 1] = entry.name;
        self.expected = seq - 1;
    }

    /// Finish against the short entry that follows the fragments. Returns
    /// the long name only when every fragment was seen and the checksum
    /// matches. The accumulator is reset either way.
    pub fn finish(&mut self, short_name: &ShortName) -> Option<String> {
        let complete = self.active && self.expected == 0 && self.checksum == short_name.checksum();
        let name = if complete {
            let units: Vec<u16> = self
                .parts
                .iter()
                .flat_map(|p| p.iter().copied())
                .take_while(|&u| u != 0x0000 && u != 0xFFFF)
                .collect();
            String::from_utf16(&units).ok().filter(|s| !s.is_empty())
        } else {
            None
        };
        self.reset();
        name
    }

    /// Number of fragments collected for the pending name
    pub fn len(&self) -> usize {
        if self.active {
            self.parts.len()
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
