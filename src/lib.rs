//! FAT volume layer with VFAT long-file-name support.
//!
//! This crate implements the directory and name machinery of the FAT family
//! of file systems (FAT12, FAT16 and FAT32) on top of a caller-supplied
//! block device:
//!
//! - the bit-exact 32-byte directory-entry codec, including long-file-name
//!   chains, checksums and the legacy 8.3 rules ([`name`], [`entry`]),
//! - a size-bucketed allocator for contiguous runs of free directory
//!   entries ([`free`]),
//! - the live [`dir::Directory`] object that reconciles in-memory name
//!   indexes with the on-disk entry stream,
//! - the FAT cluster allocator and chain streams ([`fat`], [`file`]),
//! - a volume facade that formats, mounts and resolves paths ([`fs`]).
//!
//! FAT file system on disk data structure is all "little endian".
//! All codecs in this crate encode and decode explicitly through
//! `u16::from_le_bytes`/`to_le_bytes` so the in-memory representation never
//! depends on host endianness.

#![no_std]

extern crate alloc;

pub mod bpb;
pub mod cache;
pub mod codepage;
pub mod device;
pub mod dir;
pub mod entry;
pub mod fat;
pub mod file;
pub mod free;
pub mod fs;
pub mod name;
pub mod time;

use device::DeviceError;

pub use dir::{Directory, OpenMode};
pub use entry::{Attributes, DirEntry};
pub use file::FatFile;
pub use fs::{FileSystem, FormatOptions, Metadata, MountOptions};
pub use name::FatFileName;

/// Size of a single directory entry record in bytes.
pub const DIRENT_SIZE: usize = 32;

/// Sector size assumed by the block cache. The BPB may declare larger
/// sectors, in which case a logical sector spans several cache blocks.
pub const BLOCK_SIZE: usize = 512;

/// For Short Directory Entry Name[0] and Long Directory Entry Ord
///
/// Deleted
pub const DIR_ENTRY_UNUSED: u8 = 0xE5;
/// For Short Directory Entry Name[0]
///
/// The special 0 value, rather than the 0xE5 value, indicates to FAT file
/// system driver code that the rest of the entries in this directory do not
/// need to be examined because they are all free.
pub const DIR_ENTRY_LAST_AND_UNUSED: u8 = 0x00;
/// If DIR_Name[0] == 0x05, then the actual file name character for this byte
/// is 0xE5. 0xE5 is actually a valid KANJI lead byte value for the character
/// set used in Japan.
pub const DIR_ENTRY_REALLY_E5: u8 = 0x05;
/// For Long Directory Entry Ord as the last entry mask.
///
/// This mask is for ord within one file's set of long entries. A single
/// long directory entry only carries 13 UTF-16 code units, so names longer
/// than that span multiple entries and the highest-ordered one is flagged.
pub const LAST_LONG_ENTRY: u8 = 0x40;

/// UTF-16 code units carried by one long directory entry.
pub const LONG_NAME_PART_LEN: usize = 13;
/// Long names are limited to 255 characters, not including the trailing NUL.
pub const LONG_NAME_LEN_CAP: usize = 255;

pub const SPACE: u8 = 0x20;

pub const FREE_CLUSTER: u32 = 0x0000_0000;

pub const MAX_CLUSTER_FAT12: u32 = 4085;
pub const MAX_CLUSTER_FAT16: u32 = 65525;

pub const LEAD_SIGNATURE: u32 = 0x41615252;
pub const STRUCT_SIGNATURE: u32 = 0x61417272;
pub const TRAIL_SIGNATURE: u32 = 0xAA550000;

/// Crate-wide result type.
pub type Result<T> = core::result::Result<T, Error>;

/// Semantic error kinds surfaced by every layer of the volume.
///
/// Recoverable anomalies inside a single directory scan (orphan long-name
/// runs, checksum mismatches) are absorbed during load and never reach the
/// caller; everything else propagates unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("path component not found")]
    NotFound,
    #[error("name already exists")]
    AlreadyExists,
    #[error("invalid file name")]
    InvalidName,
    #[error("no space left on volume")]
    NoSpace,
    #[error("file system is corrupt: {0}")]
    Corrupt(&'static str),
    #[error("volume was opened read-only")]
    ReadOnly,
    #[error("operation is not supported at this layer")]
    Unsupported,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("device i/o error")]
    Io(#[from] DeviceError),
}

pub(crate) fn read_le_u16(input: &[u8]) -> u16 {
    u16::from_le_bytes([input[0], input[1]])
}

pub(crate) fn read_le_u32(input: &[u8]) -> u32 {
    u32::from_le_bytes([input[0], input[1], input[2], input[3]])
}

pub(crate) fn write_le_u16(out: &mut [u8], value: u16) {
    out[..2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_le_u32(out: &mut [u8], value: u32) {
    out[..4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Shared test fixtures: an in-memory block device.

    use alloc::sync::Arc;
    use alloc::vec;
    use alloc::vec::Vec;
    use spin::Mutex;

    use crate::device::{BlockDevice, DeviceError};
    use crate::BLOCK_SIZE;

    pub struct RamDisk {
        data: Mutex<Vec<u8>>,
    }

    impl RamDisk {
        pub fn new(total_bytes: usize) -> Arc<Self> {
            assert_eq!(total_bytes % BLOCK_SIZE, 0);
            Arc::new(Self {
                data: Mutex::new(vec![0u8; total_bytes]),
            })
        }
    }

    impl BlockDevice for RamDisk {
        fn read_blocks(
            &self,
            buf: &mut [u8],
            offset: usize,
            _block_cnt: usize,
        ) -> core::result::Result<(), DeviceError> {
            let data = self.data.lock();
            let end = offset + buf.len();
            if end > data.len() {
                return Err(DeviceError::Read);
            }
            buf.copy_from_slice(&data[offset..end]);
            Ok(())
        }

        fn write_blocks(
            &self,
            buf: &[u8],
            offset: usize,
            _block_cnt: usize,
        ) -> core::result::Result<(), DeviceError> {
            let mut data = self.data.lock();
            let end = offset + buf.len();
            if end > data.len() {
                return Err(DeviceError::Write);
            }
            data[offset..end].copy_from_slice(buf);
            Ok(())
        }

        fn total_bytes(&self) -> usize {
            self.data.lock().len()
        }
    }
}
