//! The 32-byte directory entry record.
//!
//! Byte layout of a short record (multi-byte integers little endian):
//!
//! - `[0..11]`  8.3 name, space padded; `0x00` in byte 0 ends the
//!   directory, `0xE5` marks a deleted record, a real `0xE5` is stored
//!   as `0x05`
//! - `[11]`     attributes; the value 0x0F marks a long-name record
//! - `[12]`     NT case flags (bit 3 base lowercase, bit 4 extension
//!   lowercase)
//! - `[13]`     creation time, tenths of a second (0..=199)
//! - `[14..16]` creation time, `[16..18]` creation date
//! - `[18..20]` last access date
//! - `[20..22]` first cluster, high word (FAT32 only)
//! - `[22..24]` last write time, `[24..26]` last write date
//! - `[26..28]` first cluster, low word
//! - `[28..32]` file size in bytes
//!
//! A directory is sized by its cluster chain, so `size` stays 0 for
//! directory entries.

use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::codepage::CodePage;
use crate::fat::FatType;
use crate::name::{FatFileName, NameSlot};
use crate::time::{self, Timestamp};
use crate::{read_le_u16, read_le_u32, write_le_u16, write_le_u32};
use crate::{Result, DIRENT_SIZE};

bitflags! {
    /// Attribute bits of a directory entry.
    ///
    /// The reserved combination Read-Only | Hidden | System | Volume-ID
    /// denotes a long-name record. That value is a record variant of its
    /// own, never a mix of the individual flags, so long-name detection
    /// compares the whole byte for equality instead of masking bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN    = 0x02;
        const SYSTEM    = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE   = 0x20;
    }
}

/// A decoded record run, as seen by the directory scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySlot {
    /// End-of-directory marker.
    End,
    /// A deleted record or a coerced orphan; occupies one slot.
    Free,
    Entry(DirEntry),
}

/// One live directory entry: a name plus the metadata of its short record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    name: FatFileName,
    attributes: Attributes,
    first_cluster: u32,
    size: u32,
    created: Timestamp,
    accessed: Timestamp,
    modified: Timestamp,
}

impl DirEntry {
    pub fn new(name: FatFileName, attributes: Attributes, now: Timestamp) -> Self {
        Self {
            name,
            attributes,
            first_cluster: 0,
            size: 0,
            created: now,
            accessed: now.date_only(),
            modified: now,
        }
    }

    pub fn name(&self) -> &FatFileName {
        &self.name
    }

    pub fn attributes(&self) -> Attributes {
        self.attributes
    }

    pub fn is_directory(&self) -> bool {
        self.attributes.contains(Attributes::DIRECTORY)
    }

    pub fn is_volume_label(&self) -> bool {
        self.attributes.contains(Attributes::VOLUME_ID)
    }

    pub fn first_cluster(&self) -> u32 {
        self.first_cluster
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.first_cluster = cluster;
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn set_size(&mut self, size: u32) {
        self.size = size;
    }

    pub fn created(&self) -> Timestamp {
        self.created
    }

    pub fn accessed(&self) -> Timestamp {
        self.accessed
    }

    pub fn modified(&self) -> Timestamp {
        self.modified
    }

    /// Last access is a date; the time of day is not stored.
    pub fn set_accessed(&mut self, at: Timestamp) {
        self.accessed = at.date_only();
    }

    pub fn set_modified(&mut self, at: Timestamp) {
        self.modified = at;
    }

    /// Records this entry occupies, long-name chain included.
    pub fn slot_count(&self) -> usize {
        1 + self.name.lfn_slot_count()
    }

    pub fn encoded_len(&self) -> usize {
        self.slot_count() * DIRENT_SIZE
    }

    /// Encode the full run of records for this entry.
    pub fn encode(&self, cp: &CodePage) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.encoded_len()];
        self.name.encode_into(cp, &mut out)?;
        let record = &mut out[(self.slot_count() - 1) * DIRENT_SIZE..];
        record[11] = self.attributes.bits();
        record[13] = time::encode_tenths(self.created);
        write_le_u16(&mut record[14..], time::encode_time(self.created));
        write_le_u16(&mut record[16..], time::encode_date(self.created));
        write_le_u16(&mut record[18..], time::encode_date(self.accessed));
        write_le_u16(&mut record[20..], (self.first_cluster >> 16) as u16);
        write_le_u16(&mut record[22..], time::encode_time(self.modified));
        write_le_u16(&mut record[24..], time::encode_date(self.modified));
        write_le_u16(&mut record[26..], (self.first_cluster & 0xFFFF) as u16);
        write_le_u32(&mut record[28..], self.size);
        Ok(out)
    }

    /// Decode one entry run from the head of `bytes`, returning the slot and
    /// the bytes consumed. Damaged long-name chains surface as `Free` with a
    /// single record consumed, mirroring [`FatFileName::decode`].
    pub fn decode(bytes: &[u8], cp: &CodePage, fat_type: FatType) -> (EntrySlot, usize) {
        let (slot, consumed) = FatFileName::decode(bytes, cp);
        let name = match slot {
            NameSlot::End => return (EntrySlot::End, consumed),
            NameSlot::Free => return (EntrySlot::Free, consumed),
            NameSlot::Name(name) => name,
        };
        let record = &bytes[consumed - DIRENT_SIZE..consumed];
        let attributes = Attributes::from_bits_truncate(record[11]);
        // The high word is only meaningful on FAT32; FAT12/16 leave it to
        // other uses and it must be ignored there.
        let high = if fat_type == FatType::Fat32 {
            read_le_u16(&record[20..]) as u32
        } else {
            0
        };
        let entry = DirEntry {
            name,
            attributes,
            first_cluster: high << 16 | read_le_u16(&record[26..]) as u32,
            size: read_le_u32(&record[28..]),
            created: time::decode_date_time(
                read_le_u16(&record[16..]),
                read_le_u16(&record[14..]),
                record[13],
            ),
            accessed: time::decode_date(read_le_u16(&record[18..])),
            modified: time::decode_date_time(
                read_le_u16(&record[24..]),
                read_le_u16(&record[22..]),
                0,
            ),
        };
        (EntrySlot::Entry(entry), consumed)
    }

    /// The same entry under a different name; used by rename, which moves
    /// records rather than rewriting them in place.
    pub(crate) fn with_name(&self, name: FatFileName) -> DirEntry {
        let mut entry = self.clone();
        entry.name = name;
        entry
    }

    /// Build the `.` entry of a freshly created directory.
    pub(crate) fn self_entry_for(dir_cluster: u32, template: &DirEntry) -> DirEntry {
        let mut entry = template.clone();
        entry.name = FatFileName::self_entry();
        entry.first_cluster = dir_cluster;
        entry
    }

    /// Build the `..` entry of a freshly created directory. `parent_cluster`
    /// is 0 when the parent is the root directory.
    pub(crate) fn parent_entry_for(parent_cluster: u32, template: &DirEntry) -> DirEntry {
        let mut entry = template.clone();
        entry.name = FatFileName::parent_entry();
        entry.first_cluster = parent_cluster;
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codepage;
    use crate::time::Timestamp;

    fn sample_entry(cp: &codepage::CodePage) -> DirEntry {
        let name = FatFileName::generate("Example Document.txt", cp, |_| false).unwrap();
        // Write time has 2-second granularity, so keep the sample even.
        let now = Timestamp::new(2023, 7, 14, 10, 30, 44);
        let mut entry = DirEntry::new(name, Attributes::ARCHIVE, now);
        entry.set_first_cluster(0x0012_3456);
        entry.set_size(1_234_567);
        entry
    }

    #[test]
    fn round_trip_preserves_every_field() {
        let cp = codepage::ibm437();
        let entry = sample_entry(&cp);
        let bytes = entry.encode(&cp).unwrap();
        assert_eq!(bytes.len(), entry.encoded_len());

        let (slot, consumed) = DirEntry::decode(&bytes, &cp, FatType::Fat32);
        assert_eq!(consumed, bytes.len());
        assert_eq!(slot, EntrySlot::Entry(entry));
    }

    #[test]
    fn high_cluster_word_is_ignored_on_fat16() {
        let cp = codepage::ibm437();
        let entry = sample_entry(&cp);
        let bytes = entry.encode(&cp).unwrap();
        let (slot, _) = DirEntry::decode(&bytes, &cp, FatType::Fat16);
        match slot {
            EntrySlot::Entry(decoded) => assert_eq!(decoded.first_cluster(), 0x3456),
            other => panic!("expected an entry, got {other:?}"),
        }
    }

    #[test]
    fn encode_writes_packed_layout() {
        let cp = codepage::ibm437();
        let name = FatFileName::generate("NOTES.TXT", &cp, |_| false).unwrap();
        let now = Timestamp::new(1987, 3, 2, 15, 40, 21);
        let mut entry = DirEntry::new(name, Attributes::ARCHIVE, now);
        entry.set_first_cluster(9);
        entry.set_size(512);
        let bytes = entry.encode(&cp).unwrap();
        assert_eq!(bytes.len(), DIRENT_SIZE);
        assert_eq!(&bytes[..11], b"NOTES   TXT");
        assert_eq!(bytes[11], 0x20);
        // 21 seconds: 10 two-second units stored, odd second in tenths.
        assert_eq!(bytes[13], 100);
        assert_eq!(read_le_u16(&bytes[14..]), 15 << 11 | 40 << 5 | 10);
        assert_eq!(read_le_u16(&bytes[16..]), (1987 - 1980) << 9 | 3 << 5 | 2);
        assert_eq!(read_le_u16(&bytes[26..]), 9);
        assert_eq!(read_le_u32(&bytes[28..]), 512);
    }

    #[test]
    fn odd_write_second_rounds_down_once() {
        let cp = codepage::ibm437();
        let mut entry = sample_entry(&cp);
        entry.set_modified(Timestamp::new(2023, 7, 14, 10, 30, 45));
        let bytes = entry.encode(&cp).unwrap();
        let (slot, _) = DirEntry::decode(&bytes, &cp, FatType::Fat32);
        match slot {
            EntrySlot::Entry(decoded) => {
                // The odd write second is dropped on store; creation keeps
                // its odd second through the tenths byte.
                assert_eq!(decoded.modified().second, 44);
                assert_eq!(decoded.created(), entry.created());
            }
            other => panic!("expected an entry, got {other:?}"),
        }
    }

    #[test]
    fn deleted_and_end_markers_decode_as_slots() {
        let cp = codepage::ibm437();
        let mut record = [0u8; DIRENT_SIZE];
        assert_eq!(
            DirEntry::decode(&record, &cp, FatType::Fat32),
            (EntrySlot::End, DIRENT_SIZE)
        );
        record[0] = crate::DIR_ENTRY_UNUSED;
        assert_eq!(
            DirEntry::decode(&record, &cp, FatType::Fat32),
            (EntrySlot::Free, DIRENT_SIZE)
        );
    }
}
