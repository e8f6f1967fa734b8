//! BIOS Parameter Block (BPB) and boot sector.
//!
//! The first important data structure on a FAT volume is the BPB, located in
//! the first sector of the volume in the reserved region. The layout is
//! common up to offset 36; from there FAT12/16 carry a small tail while
//! FAT32 inserts an extended block (FAT size, root cluster, FSInfo and
//! backup boot sector numbers) before the same tail.
//!
//! FAT type is determined by the count of data clusters and by nothing
//! else:
//!
//! - fewer than 4085 clusters is FAT12,
//! - fewer than 65525 clusters is FAT16,
//! - anything else is FAT32.
//!
//! The count of clusters is exactly that: data clusters starting at
//! cluster 2. The sector of a cluster is
//! `FirstDataSector + (N - 2) * SecPerClus`.
//!
//! On FAT32 the root directory is an ordinary cluster chain starting at
//! `root_cluster`; on FAT12/16 it is a fixed region between the FATs and
//! the data area, `root_entry_count * 32` bytes long.

use log::error;

use crate::fat::FatType;
use crate::{
    read_le_u16, read_le_u32, write_le_u16, write_le_u32, Error, Result, DIRENT_SIZE,
    LEAD_SIGNATURE, MAX_CLUSTER_FAT12, MAX_CLUSTER_FAT16, STRUCT_SIGNATURE, TRAIL_SIGNATURE,
};

/// Parsed boot-sector fields shared by every FAT variant, with the FAT32
/// extension folded in (zeroed on FAT12/16 volumes).
#[derive(Debug, Clone)]
pub struct BiosParameterBlock {
    /// Count of bytes per sector: 512, 1024, 2048 or 4096.
    pub bytes_per_sector: u16,
    /// Sectors per allocation unit, a power of two no greater than 128.
    pub sectors_per_cluster: u8,
    /// Sectors in the reserved region, starting at the boot sector. Never 0.
    pub reserved_sectors: u16,
    /// Count of FAT copies, 1 or 2.
    pub fat_count: u8,
    /// FAT12/16 root directory entry capacity; 0 on FAT32.
    pub root_entry_count: u16,
    /// 16-bit total sector count; 0 when `total_sectors_32` is used.
    pub total_sectors_16: u16,
    /// Media descriptor, mirrored into the low byte of FAT[0].
    pub media: u8,
    /// FAT12/16 sectors per FAT; 0 on FAT32.
    pub fat_size_16: u16,
    pub sectors_per_track: u16,
    pub head_count: u16,
    pub hidden_sectors: u32,
    /// 32-bit total sector count; 0 when `total_sectors_16` is used.
    pub total_sectors_32: u32,

    /// FAT32 sectors per FAT.
    pub fat_size_32: u32,
    pub ext_flags: u16,
    pub fs_version: u16,
    /// First cluster of the FAT32 root directory, usually 2.
    pub root_cluster: u32,
    /// Sector of the FSInfo structure, usually 1.
    pub fsinfo_sector: u16,
    /// Sector of the backup boot record, 0 or 6.
    pub backup_boot_sector: u16,

    pub drive_number: u8,
    pub boot_signature: u8,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
    pub fs_type_label: [u8; 8],
}

impl BiosParameterBlock {
    /// Parse and validate a boot sector.
    pub fn parse(sector: &[u8]) -> Result<Self> {
        if sector.len() < 512 || sector[510] != 0x55 || sector[511] != 0xAA {
            error!("boot sector signature missing");
            return Err(Error::Corrupt("boot sector signature missing"));
        }
        let bytes_per_sector = read_le_u16(&sector[11..]);
        if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            error!("bytes per sector {bytes_per_sector} is not a legal value");
            return Err(Error::Corrupt("illegal bytes-per-sector"));
        }
        let sectors_per_cluster = sector[13];
        if !sectors_per_cluster.is_power_of_two() || sectors_per_cluster > 128 {
            error!("sectors per cluster {sectors_per_cluster} is not a legal value");
            return Err(Error::Corrupt("illegal sectors-per-cluster"));
        }
        let reserved_sectors = read_le_u16(&sector[14..]);
        if reserved_sectors == 0 {
            return Err(Error::Corrupt("reserved sector count is zero"));
        }
        let fat_count = sector[16];
        if fat_count == 0 || fat_count > 2 {
            error!("FAT count {fat_count} shall be 1 or 2");
            return Err(Error::Corrupt("illegal FAT count"));
        }

        let fat_size_16 = read_le_u16(&sector[22..]);
        let is_fat32_layout = fat_size_16 == 0;
        let tail = if is_fat32_layout { 64 } else { 36 };

        let bpb = Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            fat_count,
            root_entry_count: read_le_u16(&sector[17..]),
            total_sectors_16: read_le_u16(&sector[19..]),
            media: sector[21],
            fat_size_16,
            sectors_per_track: read_le_u16(&sector[24..]),
            head_count: read_le_u16(&sector[26..]),
            hidden_sectors: read_le_u32(&sector[28..]),
            total_sectors_32: read_le_u32(&sector[32..]),
            fat_size_32: if is_fat32_layout {
                read_le_u32(&sector[36..])
            } else {
                0
            },
            ext_flags: if is_fat32_layout {
                read_le_u16(&sector[40..])
            } else {
                0
            },
            fs_version: if is_fat32_layout {
                read_le_u16(&sector[42..])
            } else {
                0
            },
            root_cluster: if is_fat32_layout {
                read_le_u32(&sector[44..])
            } else {
                0
            },
            fsinfo_sector: if is_fat32_layout {
                read_le_u16(&sector[48..])
            } else {
                0
            },
            backup_boot_sector: if is_fat32_layout {
                read_le_u16(&sector[50..])
            } else {
                0
            },
            drive_number: sector[tail],
            boot_signature: sector[tail + 2],
            volume_id: read_le_u32(&sector[tail + 3..]),
            volume_label: sector[tail + 7..tail + 18].try_into().unwrap(),
            fs_type_label: sector[tail + 18..tail + 26].try_into().unwrap(),
        };

        if bpb.total_sectors() == 0 {
            return Err(Error::Corrupt("total sector count is zero"));
        }
        if bpb.fat_size_sectors() == 0 {
            return Err(Error::Corrupt("FAT size is zero"));
        }
        if is_fat32_layout && bpb.fs_version != 0 {
            error!("unknown FAT32 version {:#06x}", bpb.fs_version);
            return Err(Error::Corrupt("unsupported FAT32 version"));
        }
        if is_fat32_layout && bpb.root_cluster < 2 {
            return Err(Error::Corrupt("FAT32 root cluster below 2"));
        }
        Ok(bpb)
    }

    /// Encode into a 512-byte boot sector.
    pub fn encode(&self, sector: &mut [u8]) {
        sector[..512].fill(0);
        sector[0] = 0xEB;
        sector[1] = 0x58;
        sector[2] = 0x90;
        sector[3..11].copy_from_slice(b"FATVOL  ");
        write_le_u16(&mut sector[11..], self.bytes_per_sector);
        sector[13] = self.sectors_per_cluster;
        write_le_u16(&mut sector[14..], self.reserved_sectors);
        sector[16] = self.fat_count;
        write_le_u16(&mut sector[17..], self.root_entry_count);
        write_le_u16(&mut sector[19..], self.total_sectors_16);
        sector[21] = self.media;
        write_le_u16(&mut sector[22..], self.fat_size_16);
        write_le_u16(&mut sector[24..], self.sectors_per_track);
        write_le_u16(&mut sector[26..], self.head_count);
        write_le_u32(&mut sector[28..], self.hidden_sectors);
        write_le_u32(&mut sector[32..], self.total_sectors_32);
        let tail = if self.fat_size_16 == 0 {
            write_le_u32(&mut sector[36..], self.fat_size_32);
            write_le_u16(&mut sector[40..], self.ext_flags);
            write_le_u16(&mut sector[42..], self.fs_version);
            write_le_u32(&mut sector[44..], self.root_cluster);
            write_le_u16(&mut sector[48..], self.fsinfo_sector);
            write_le_u16(&mut sector[50..], self.backup_boot_sector);
            64
        } else {
            36
        };
        sector[tail] = self.drive_number;
        sector[tail + 2] = self.boot_signature;
        write_le_u32(&mut sector[tail + 3..], self.volume_id);
        sector[tail + 7..tail + 18].copy_from_slice(&self.volume_label);
        sector[tail + 18..tail + 26].copy_from_slice(&self.fs_type_label);
        sector[510] = 0x55;
        sector[511] = 0xAA;
    }

    pub fn fat_size_sectors(&self) -> usize {
        if self.fat_size_16 != 0 {
            self.fat_size_16 as usize
        } else {
            self.fat_size_32 as usize
        }
    }

    pub fn total_sectors(&self) -> usize {
        if self.total_sectors_16 != 0 {
            self.total_sectors_16 as usize
        } else {
            self.total_sectors_32 as usize
        }
    }

    /// Sectors occupied by the FAT12/16 root directory region. Always 0 on
    /// FAT32, where the root entry count is 0.
    pub fn root_dir_sectors(&self) -> usize {
        (self.root_entry_count as usize * DIRENT_SIZE + self.bytes_per_sector as usize - 1)
            / self.bytes_per_sector as usize
    }

    /// The first data sector, beyond the reserved region, the FATs and the
    /// FAT12/16 root directory.
    pub fn first_data_sector(&self) -> usize {
        self.reserved_sectors as usize
            + self.fat_count as usize * self.fat_size_sectors()
            + self.root_dir_sectors()
    }

    /// The count of data clusters, rounded down.
    pub fn cluster_count(&self) -> u32 {
        let data_sectors = self.total_sectors() - self.first_data_sector();
        (data_sectors / self.sectors_per_cluster as usize) as u32
    }

    /// The one and only way FAT type is determined.
    pub fn fat_type(&self) -> FatType {
        let clusters = self.cluster_count();
        if clusters < MAX_CLUSTER_FAT12 {
            FatType::Fat12
        } else if clusters < MAX_CLUSTER_FAT16 {
            FatType::Fat16
        } else {
            FatType::Fat32
        }
    }

    pub fn bytes_per_cluster(&self) -> usize {
        self.bytes_per_sector as usize * self.sectors_per_cluster as usize
    }

    /// Byte offset of the first FAT copy.
    pub fn fat_offset(&self) -> usize {
        self.reserved_sectors as usize * self.bytes_per_sector as usize
    }

    pub fn fat_bytes(&self) -> usize {
        self.fat_size_sectors() * self.bytes_per_sector as usize
    }

    /// Byte offset of the FAT12/16 root directory region.
    pub fn root_dir_offset(&self) -> usize {
        (self.reserved_sectors as usize + self.fat_count as usize * self.fat_size_sectors())
            * self.bytes_per_sector as usize
    }

    pub fn root_dir_bytes(&self) -> usize {
        self.root_entry_count as usize * DIRENT_SIZE
    }

    /// Byte offset of a data cluster. The first data cluster is cluster 2.
    pub fn cluster_offset(&self, cluster: u32) -> usize {
        debug_assert!(cluster >= 2);
        (self.first_data_sector() + (cluster as usize - 2) * self.sectors_per_cluster as usize)
            * self.bytes_per_sector as usize
    }
}

/// FAT32 FSInfo sector: the free-cluster count and next-free hint.
///
/// Both values are advisory. 0xFFFFFFFF means unknown; any other free count
/// should be range checked against the volume cluster count before use.
#[derive(Debug, Clone, Copy)]
pub struct FsInfo {
    pub free_count: u32,
    pub next_free: u32,
}

impl FsInfo {
    pub fn parse(sector: &[u8]) -> Result<Self> {
        if read_le_u32(&sector[0..]) != LEAD_SIGNATURE
            || read_le_u32(&sector[484..]) != STRUCT_SIGNATURE
            || read_le_u32(&sector[508..]) != TRAIL_SIGNATURE
        {
            error!("FSInfo signatures are wrong");
            return Err(Error::Corrupt("bad FSInfo signature"));
        }
        Ok(Self {
            free_count: read_le_u32(&sector[488..]),
            next_free: read_le_u32(&sector[492..]),
        })
    }

    pub fn encode(&self, sector: &mut [u8]) {
        sector[..512].fill(0);
        write_le_u32(&mut sector[0..], LEAD_SIGNATURE);
        write_le_u32(&mut sector[484..], STRUCT_SIGNATURE);
        write_le_u32(&mut sector[488..], self.free_count);
        write_le_u32(&mut sector[492..], self.next_free);
        write_le_u32(&mut sector[508..], TRAIL_SIGNATURE);
    }
}

/// Geometry chosen when formatting a FAT32 volume.
pub struct Fat32Geometry {
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fat_count: u8,
    pub fat_size_sectors: u32,
    pub total_sectors: u32,
}

impl Fat32Geometry {
    /// Derive the layout for a device of `total_bytes`, following the fixed
    /// cluster-size table and FAT-size arithmetic used by FORMAT. Volumes
    /// too small to hold 65525 clusters cannot be FAT32.
    pub fn compute(total_bytes: usize) -> Result<Self> {
        let total_sectors = (total_bytes / 512) as u32;
        let sectors_per_cluster: u8 = match total_sectors {
            0..=66_599 => {
                error!("device of {total_sectors} sectors is too small for FAT32");
                return Err(Error::InvalidArgument("device too small for FAT32"));
            }
            66_600..=532_480 => 1,
            532_481..=16_777_216 => 8,
            16_777_217..=33_554_432 => 16,
            33_554_433..=67_108_864 => 32,
            _ => 64,
        };
        let reserved_sectors: u16 = 32;
        let fat_count: u8 = 2;
        // FAT size via the round-up estimate from the FAT specification.
        let tmp1 = total_sectors as u64 - reserved_sectors as u64;
        let tmp2 = (256 * sectors_per_cluster as u64 + fat_count as u64) / 2;
        let fat_size_sectors = ((tmp1 + tmp2 - 1) / tmp2) as u32;
        Ok(Self {
            sectors_per_cluster,
            reserved_sectors,
            fat_count,
            fat_size_sectors,
            total_sectors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn fat32_bpb() -> BiosParameterBlock {
        let geometry = Fat32Geometry::compute(64 * 1024 * 1024).unwrap();
        BiosParameterBlock {
            bytes_per_sector: 512,
            sectors_per_cluster: geometry.sectors_per_cluster,
            reserved_sectors: geometry.reserved_sectors,
            fat_count: geometry.fat_count,
            root_entry_count: 0,
            total_sectors_16: 0,
            media: 0xF8,
            fat_size_16: 0,
            sectors_per_track: 0,
            head_count: 0,
            hidden_sectors: 0,
            total_sectors_32: geometry.total_sectors,
            fat_size_32: geometry.fat_size_sectors,
            ext_flags: 0,
            fs_version: 0,
            root_cluster: 2,
            fsinfo_sector: 1,
            backup_boot_sector: 6,
            drive_number: 0x80,
            boot_signature: 0x29,
            volume_id: 0x1234_5678,
            volume_label: *b"NO NAME    ",
            fs_type_label: *b"FAT32   ",
        }
    }

    #[test]
    fn fat32_round_trip_and_type() {
        let bpb = fat32_bpb();
        let mut sector = vec![0u8; 512];
        bpb.encode(&mut sector);
        let parsed = BiosParameterBlock::parse(&sector).unwrap();
        assert_eq!(parsed.fat_type(), FatType::Fat32);
        assert_eq!(parsed.root_cluster, 2);
        assert_eq!(parsed.fat_size_sectors(), bpb.fat_size_32 as usize);
        assert!(parsed.cluster_count() >= MAX_CLUSTER_FAT16);
    }

    #[test]
    fn fat12_layout_and_type() {
        let bpb = BiosParameterBlock {
            bytes_per_sector: 512,
            sectors_per_cluster: 1,
            reserved_sectors: 1,
            fat_count: 2,
            root_entry_count: 512,
            total_sectors_16: 2048,
            media: 0xF8,
            fat_size_16: 6,
            sectors_per_track: 0,
            head_count: 0,
            hidden_sectors: 0,
            total_sectors_32: 0,
            fat_size_32: 0,
            ext_flags: 0,
            fs_version: 0,
            root_cluster: 0,
            fsinfo_sector: 0,
            backup_boot_sector: 0,
            drive_number: 0x80,
            boot_signature: 0x29,
            volume_id: 1,
            volume_label: *b"NO NAME    ",
            fs_type_label: *b"FAT12   ",
        };
        let mut sector = vec![0u8; 512];
        bpb.encode(&mut sector);
        let parsed = BiosParameterBlock::parse(&sector).unwrap();
        assert_eq!(parsed.fat_type(), FatType::Fat12);
        assert_eq!(parsed.root_dir_sectors(), 32);
        assert_eq!(parsed.root_dir_offset(), (1 + 12) * 512);
        assert_eq!(parsed.first_data_sector(), 1 + 12 + 32);
        // Cluster 2 sits right after the root region.
        assert_eq!(parsed.cluster_offset(2), (1 + 12 + 32) * 512);
    }

    #[test]
    fn rejects_malformed_sectors() {
        let mut sector = vec![0u8; 512];
        assert!(matches!(
            BiosParameterBlock::parse(&sector),
            Err(Error::Corrupt(_))
        ));
        fat32_bpb().encode(&mut sector);
        sector[13] = 3; // not a power of two
        assert!(matches!(
            BiosParameterBlock::parse(&sector),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn fsinfo_round_trip() {
        let info = FsInfo {
            free_count: 12345,
            next_free: 678,
        };
        let mut sector = vec![0u8; 512];
        info.encode(&mut sector);
        let parsed = FsInfo::parse(&sector).unwrap();
        assert_eq!(parsed.free_count, 12345);
        assert_eq!(parsed.next_free, 678);
        sector[0] ^= 1;
        assert!(FsInfo::parse(&sector).is_err());
    }
}
