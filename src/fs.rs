//! The volume facade.
//!
//! [`FileSystem`] mounts a block device, owns the shared volume state (the
//! block cache, the FAT manager, the code page and clock, writability) and
//! resolves paths through a cache of live [`Directory`] objects keyed by
//! their first cluster. Formatting writes a fresh FAT32 layout: boot
//! sector, FSInfo, backup copies, zeroed FATs with the reserved entries,
//! and an empty root directory.
//!
//! Layout on disk:
//!     boot sector - reserved sectors - FAT copies - (FAT12/16 root
//!     directory region) - data region
//!
//! The FAT32 root directory is cluster chain `root_cluster`; the FAT12/16
//! root is the fixed region between the FATs and the data area.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;
use log::warn;
use spin::{Mutex, RwLock};

use crate::bpb::{BiosParameterBlock, Fat32Geometry, FsInfo};
use crate::cache::CacheManager;
use crate::codepage::{self, CodePage};
use crate::device::BlockDevice;
use crate::dir::{DirStore, Directory, OpenMode};
use crate::fat::{ClusterAllocator, FatManager, FatType};
use crate::file::{ClusterStream, FatFile};
use crate::time::{self, Clock, Timestamp};
use crate::{Error, Result, BLOCK_SIZE};

/// Shared state every layer of one mounted volume hangs off.
pub(crate) struct VolumeCtx {
    pub cache: Arc<Mutex<CacheManager>>,
    pub fat: RwLock<FatManager>,
    pub layout: Layout,
    pub codepage: Arc<CodePage>,
    pub clock: Arc<dyn Clock>,
    pub writable: bool,
}

/// Geometry derived from the BPB once at mount.
pub(crate) struct Layout {
    pub fat_type: FatType,
    pub bytes_per_cluster: usize,
    /// Byte offset of cluster 2.
    pub first_data_byte: usize,
}

impl Layout {
    pub fn cluster_offset(&self, cluster: u32) -> usize {
        debug_assert!(cluster >= 2);
        self.first_data_byte + (cluster as usize - 2) * self.bytes_per_cluster
    }
}

impl VolumeCtx {
    pub fn require_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(Error::ReadOnly)
        }
    }

    pub fn clear_cluster(&self, cluster: u32) -> Result<()> {
        self.cache.lock().fill_bytes(
            self.layout.cluster_offset(cluster),
            self.layout.bytes_per_cluster,
            0,
        )
    }
}

/// Mount-time options.
pub struct MountOptions {
    /// OEM code page for short names. The table must be installed via
    /// [`codepage::install`] unless it is the built-in 437.
    pub code_page: u16,
    /// Source of local time for new timestamps.
    pub clock: Arc<dyn Clock>,
    pub read_only: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            code_page: codepage::DEFAULT_CODE_PAGE,
            clock: time::epoch_clock(),
            read_only: false,
        }
    }
}

/// Format-time options.
pub struct FormatOptions {
    pub volume_label: [u8; 11],
    pub volume_id: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            volume_label: *b"NO NAME    ",
            volume_id: 0,
        }
    }
}

/// Metadata of one path, as read from its directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub is_dir: bool,
    pub size: u32,
    pub created: Timestamp,
    pub accessed: Timestamp,
    pub modified: Timestamp,
}

pub struct FileSystem {
    ctx: Arc<VolumeCtx>,
    bpb: BiosParameterBlock,
    root: Arc<RwLock<Directory>>,
    /// Live directories by first cluster; the FAT12/16 root uses key 0.
    dirs: RwLock<HashMap<u32, Arc<RwLock<Directory>>>>,
}

impl FileSystem {
    /// Write a fresh FAT32 volume across the whole device.
    pub fn format(device: Arc<dyn BlockDevice>, options: &FormatOptions) -> Result<()> {
        let geometry = Fat32Geometry::compute(device.total_bytes())?;
        let bpb = BiosParameterBlock {
            bytes_per_sector: BLOCK_SIZE as u16,
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
            volume_id: options.volume_id,
            volume_label: options.volume_label,
            fs_type_label: *b"FAT32   ",
        };
        debug_assert_eq!(bpb.fat_type(), FatType::Fat32);

        // Zero the FAT region and the root cluster straight through the
        // device; nothing is cached yet.
        let zeros = [0u8; BLOCK_SIZE];
        let fat_region_blocks =
            bpb.fat_count as usize * bpb.fat_size_sectors();
        for sector in 0..fat_region_blocks {
            device.write_blocks(&zeros, bpb.fat_offset() + sector * BLOCK_SIZE, 1)?;
        }
        for sector in 0..bpb.sectors_per_cluster as usize {
            device.write_blocks(&zeros, bpb.cluster_offset(2) + sector * BLOCK_SIZE, 1)?;
        }

        let mut cache = CacheManager::new(device);
        let mut sector = [0u8; BLOCK_SIZE];
        bpb.encode(&mut sector);
        cache.write_bytes(0, &sector)?;
        cache.write_bytes(bpb.backup_boot_sector as usize * BLOCK_SIZE, &sector)?;

        let info = FsInfo {
            free_count: bpb.cluster_count() - 1,
            next_free: 3,
        };
        info.encode(&mut sector);
        cache.write_bytes(BLOCK_SIZE, &sector)?;
        cache.write_bytes((bpb.backup_boot_sector as usize + 1) * BLOCK_SIZE, &sector)?;

        // Reserved FAT entries, mirrored into both copies: FAT[0] carries
        // the media byte, FAT[1] the end-of-chain mark, FAT[2] terminates
        // the root directory chain.
        for copy in 0..bpb.fat_count as usize {
            let base = bpb.fat_offset() + copy * bpb.fat_bytes();
            cache.write_bytes(base, &0x0FFF_FFF8u32.to_le_bytes())?;
            cache.write_bytes(base + 4, &0x0FFF_FFFFu32.to_le_bytes())?;
            cache.write_bytes(base + 8, &0x0FFF_FFFFu32.to_le_bytes())?;
        }
        cache.sync_all()
    }

    /// Mount a volume.
    pub fn open(device: Arc<dyn BlockDevice>, options: MountOptions) -> Result<Self> {
        let codepage = codepage::get(options.code_page).ok_or(Error::InvalidArgument(
            "code page is not installed",
        ))?;
        let cache = Arc::new(Mutex::new(CacheManager::new(device)));

        let mut sector = [0u8; BLOCK_SIZE];
        cache.lock().read_bytes(0, &mut sector)?;
        let bpb = BiosParameterBlock::parse(&sector)?;
        let fat_type = bpb.fat_type();

        let fsinfo = if fat_type == FatType::Fat32 && bpb.fsinfo_sector != 0 {
            cache
                .lock()
                .read_bytes(bpb.fsinfo_sector as usize * BLOCK_SIZE, &mut sector)?;
            match FsInfo::parse(&sector) {
                Ok(info) => Some(info),
                Err(_) => {
                    warn!("ignoring FSInfo with bad signatures");
                    None
                }
            }
        } else {
            None
        };

        let fat = FatManager::new(Arc::clone(&cache), &bpb, fsinfo)?;
        let ctx = Arc::new(VolumeCtx {
            cache,
            fat: RwLock::new(fat),
            layout: Layout {
                fat_type,
                bytes_per_cluster: bpb.bytes_per_cluster(),
                first_data_byte: bpb.cluster_offset(2),
            },
            codepage,
            clock: options.clock,
            writable: !options.read_only,
        });

        let root_store = if fat_type == FatType::Fat32 {
            DirStore::Chain(ClusterStream::new(Arc::clone(&ctx), bpb.root_cluster))
        } else {
            DirStore::Region {
                offset: bpb.root_dir_offset(),
                len: bpb.root_dir_bytes(),
            }
        };
        let root = Arc::new(RwLock::new(Directory::load(
            Arc::clone(&ctx),
            root_store,
            None,
        )?));
        let root_key = root.read().first_cluster();
        let mut dirs = HashMap::new();
        dirs.insert(root_key, Arc::clone(&root));

        Ok(Self {
            ctx,
            bpb,
            root,
            dirs: RwLock::new(dirs),
        })
    }

    pub fn fat_type(&self) -> FatType {
        self.ctx.layout.fat_type
    }

    pub fn free_cluster_count(&self) -> u32 {
        self.ctx.fat.read().free_cluster_count()
    }

    /// The label from the root directory's volume-ID entry, else the BPB.
    pub fn volume_label(&self) -> String {
        let root = self.root.read();
        let raw = match root.volume_label_entry() {
            Some(entry) => entry.name().short_name().to_string(),
            None => {
                let label = &self.bpb.volume_label;
                label.iter().map(|&b| self.ctx.codepage.decode(b)).collect()
            }
        };
        raw.trim_end().to_string()
    }

    pub fn root_dir(&self) -> Arc<RwLock<Directory>> {
        Arc::clone(&self.root)
    }

    /// Persist every dirty structure.
    pub fn flush(&self) -> Result<()> {
        self.ctx.fat.write().flush()
    }

    fn components(path: &str) -> Vec<&str> {
        path.split('/')
            .filter(|c| !c.is_empty() && *c != ".")
            .collect()
    }

    /// The live directory for an entry of `parent`, loading and caching it
    /// on first access.
    fn child_dir(
        &self,
        parent: &Arc<RwLock<Directory>>,
        position: usize,
    ) -> Result<Arc<RwLock<Directory>>> {
        let entry = parent
            .read()
            .get_entry(position)
            .cloned()
            .ok_or(Error::NotFound)?;
        if !entry.is_directory() {
            return Err(Error::NotFound);
        }
        let cluster = entry.first_cluster();
        if let Some(dir) = self.dirs.read().get(&cluster) {
            return Ok(Arc::clone(dir));
        }
        let store = DirStore::Chain(ClusterStream::new(Arc::clone(&self.ctx), cluster));
        let dir = Arc::new(RwLock::new(Directory::load(
            Arc::clone(&self.ctx),
            store,
            Some((Arc::clone(parent), position)),
        )?));
        self.dirs.write().insert(cluster, Arc::clone(&dir));
        Ok(dir)
    }

    /// Walk a component list from the root.
    fn walk(&self, components: &[&str]) -> Result<Arc<RwLock<Directory>>> {
        let mut current = Arc::clone(&self.root);
        for component in components {
            if *component == ".." {
                let parent = current.read().parent_handle();
                current = parent.unwrap_or_else(|| Arc::clone(&self.root));
                continue;
            }
            let position = current.read().find(component).ok_or(Error::NotFound)?;
            current = self.child_dir(&current, position)?;
        }
        Ok(current)
    }

    /// Split a path into its parent directory and final component.
    fn resolve_parent(&self, path: &str) -> Result<(Arc<RwLock<Directory>>, String)> {
        let mut components = Self::components(path);
        let last = components
            .pop()
            .ok_or(Error::InvalidArgument("path has no final component"))?;
        if last == ".." {
            return Err(Error::InvalidArgument("path ends in dot-dot"));
        }
        Ok((self.walk(&components)?, last.to_string()))
    }

    /// Open a file by path, per the mode table of [`OpenMode`].
    pub fn open_file(&self, path: &str, mode: OpenMode) -> Result<FatFile> {
        let (dir, name) = self.resolve_parent(path)?;
        Directory::open_file(&dir, &name, mode)
    }

    pub fn create_dir(&self, path: &str) -> Result<()> {
        let (dir, name) = self.resolve_parent(path)?;
        dir.write().create_child_directory(&name)?;
        Ok(())
    }

    /// Names in a directory, full form, stream order.
    pub fn read_dir(&self, path: &str) -> Result<Vec<String>> {
        let dir = self.walk(&Self::components(path))?;
        let dir = dir.read();
        Ok(dir
            .list()
            .into_iter()
            .map(|entry| entry.name().full_name().to_string())
            .collect())
    }

    pub fn metadata(&self, path: &str) -> Result<Metadata> {
        let components = Self::components(path);
        if components.is_empty() {
            return Ok(Metadata {
                is_dir: true,
                size: 0,
                created: Timestamp::EPOCH,
                accessed: Timestamp::EPOCH,
                modified: Timestamp::EPOCH,
            });
        }
        let (dir, name) = self.resolve_parent(path)?;
        let dir = dir.read();
        let position = dir.find(&name).ok_or(Error::NotFound)?;
        let entry = dir.get_entry(position).ok_or(Error::NotFound)?;
        Ok(Metadata {
            is_dir: entry.is_directory(),
            size: entry.size(),
            created: entry.created(),
            accessed: entry.accessed(),
            modified: entry.modified(),
        })
    }

    /// Delete a file or an empty directory, releasing its clusters.
    pub fn remove(&self, path: &str) -> Result<()> {
        let (dir, name) = self.resolve_parent(path)?;
        let position = dir.read().find(&name).ok_or(Error::NotFound)?;
        let entry = dir
            .read()
            .get_entry(position)
            .cloned()
            .ok_or(Error::NotFound)?;
        if entry.is_directory() {
            let child = self.child_dir(&dir, position)?;
            if child.read().entry_count() != 0 {
                return Err(Error::InvalidArgument("directory is not empty"));
            }
            self.dirs.write().remove(&entry.first_cluster());
        }
        let result = dir.write().delete_entry(position, true);
        result
    }

    /// Rename or move. The entry keeps its metadata and cluster chain; the
    /// records move via delete plus add, which also re-derives the short
    /// name in the target directory's name space.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let (from_dir, from_name) = self.resolve_parent(from)?;
        let from_position = from_dir.read().find(&from_name).ok_or(Error::NotFound)?;
        let entry = from_dir
            .read()
            .get_entry(from_position)
            .cloned()
            .ok_or(Error::NotFound)?;

        let (to_dir, to_name) = self.resolve_parent(to)?;
        let same_dir = Arc::ptr_eq(&from_dir, &to_dir);
        if let Some(existing) = to_dir.read().find(&to_name) {
            // Renaming only by case lands on the entry itself; that is fine.
            if !(same_dir && existing == from_position) {
                return Err(Error::AlreadyExists);
            }
        }

        let new_name = to_dir.read().generate_name(&to_name)?;
        let new_entry = entry.with_name(new_name);
        from_dir.write().delete_entry(from_position, false)?;
        let new_position = to_dir.write().add_entry(new_entry)?;

        if entry.is_directory() {
            // A live object for the moved directory must stay the canonical
            // one for its cluster: directories below it hold its handle as
            // their parent. Re-point it at the new entry instead of evicting
            // it.
            let cached = self.dirs.read().get(&entry.first_cluster()).map(Arc::clone);
            if let Some(child) = &cached {
                child.write().set_parent(Arc::clone(&to_dir), new_position);
            }
            if !same_dir {
                let child = match cached {
                    Some(child) => child,
                    None => self.child_dir(&to_dir, new_position)?,
                };
                let parent_cluster = {
                    let to_dir = to_dir.read();
                    if to_dir.is_root() {
                        0
                    } else {
                        to_dir.first_cluster()
                    }
                };
                child.write().set_parent_record_cluster(parent_cluster)?;
            }
        }
        Ok(())
    }
}
