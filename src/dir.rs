//! The live directory object.
//!
//! On disk a directory is a run of 32-byte records, low address to high:
//! each entry's long-name records in descending order, then its short
//! record, repeated entry after entry, terminated by the first record whose
//! lead byte is 0x00. Deleted records keep their slot with a 0xE5 lead
//! byte.
//!
//! A [`Directory`] reconciles that stream with three in-memory structures:
//! a position-keyed entry map and two case-insensitive name indexes, one
//! over short names and one over full names. Free record runs are handed to
//! a [`FreeDirectoryEntryTable`] so new entries reuse holes best-fit before
//! the end-of-entries watermark grows.
//!
//! Recoverable anomalies found while scanning (orphan long-name records,
//! checksum mismatches) are coerced into free slots and never surface as
//! errors.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use hashbrown::HashMap;
use log::{debug, warn};
use spin::RwLock;

use crate::entry::{Attributes, DirEntry, EntrySlot};
use crate::fat::ClusterAllocator;
use crate::file::{ClusterStream, FatFile};
use crate::free::FreeDirectoryEntryTable;
use crate::fs::VolumeCtx;
use crate::name::FatFileName;
use crate::{Error, Result, DIRENT_SIZE, DIR_ENTRY_UNUSED};

/// How [`Directory::open_file`] treats existing and missing names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open an existing file; fail when missing.
    Open,
    /// Open an existing file or create it.
    OpenOrCreate,
    /// Create a file; fail when the name exists.
    CreateNew,
    /// Open and truncate to zero length, or create.
    Create,
    /// Not implemented at this layer; emulated above via open + set_len.
    Truncate,
    /// Not implemented at this layer; emulated above via open + seek.
    Append,
}

/// Backing store of a directory stream: the fixed FAT12/16 root region, or
/// an ordinary cluster chain.
pub(crate) enum DirStore {
    Region { offset: usize, len: usize },
    Chain(ClusterStream),
}

impl DirStore {
    fn capacity(&self) -> Result<usize> {
        match self {
            DirStore::Region { len, .. } => Ok(*len),
            DirStore::Chain(stream) => stream.capacity(),
        }
    }

    fn read_at(&self, ctx: &VolumeCtx, at: usize, buf: &mut [u8]) -> Result<usize> {
        match self {
            DirStore::Region { offset, len } => {
                if at >= *len {
                    return Ok(0);
                }
                let take = buf.len().min(len - at);
                ctx.cache.lock().read_bytes(offset + at, &mut buf[..take])?;
                Ok(take)
            }
            DirStore::Chain(stream) => stream.read_at(at, buf),
        }
    }

    fn write_at(&mut self, ctx: &VolumeCtx, at: usize, buf: &[u8]) -> Result<()> {
        match self {
            DirStore::Region { offset, len } => {
                // The root region cannot grow.
                if at + buf.len() > *len {
                    return Err(Error::NoSpace);
                }
                ctx.cache.lock().write_bytes(*offset + at, buf)
            }
            DirStore::Chain(stream) => stream.write_at(at, buf),
        }
    }

    fn first_cluster(&self) -> u32 {
        match self {
            DirStore::Region { .. } => 0,
            DirStore::Chain(stream) => stream.first_cluster(),
        }
    }
}

pub struct Directory {
    ctx: Arc<VolumeCtx>,
    store: DirStore,
    /// Live entries keyed by byte position. `.`/`..` and the volume label
    /// are held separately and never appear here.
    entries: BTreeMap<usize, DirEntry>,
    /// OEM-uppercased short name to position.
    short_index: HashMap<String, usize>,
    /// OEM-uppercased full name to position.
    full_index: HashMap<String, usize>,
    free: FreeDirectoryEntryTable,
    /// First offset holding the null terminator; no entries live beyond it.
    end_of_entries: usize,
    self_entry: Option<(usize, DirEntry)>,
    parent_entry: Option<(usize, DirEntry)>,
    volume_label: Option<(usize, DirEntry)>,
    /// The parent directory and this directory's entry position within it.
    /// The root has none.
    parent: Option<(Arc<RwLock<Directory>>, usize)>,
}

impl Directory {
    /// Scan a directory stream and build the live object.
    pub(crate) fn load(
        ctx: Arc<VolumeCtx>,
        store: DirStore,
        parent: Option<(Arc<RwLock<Directory>>, usize)>,
    ) -> Result<Self> {
        let capacity = store.capacity()?;
        let mut data = vec![0u8; capacity];
        store.read_at(&ctx, 0, &mut data)?;

        let mut dir = Self {
            store,
            entries: BTreeMap::new(),
            short_index: HashMap::new(),
            full_index: HashMap::new(),
            free: FreeDirectoryEntryTable::new(),
            end_of_entries: capacity,
            self_entry: None,
            parent_entry: None,
            volume_label: None,
            parent,
            ctx,
        };

        let mut pos = 0;
        let mut run_start = 0;
        let mut run_slots = 0;
        while pos + DIRENT_SIZE <= capacity {
            let (slot, consumed) =
                DirEntry::decode(&data[pos..], &dir.ctx.codepage, dir.ctx.layout.fat_type);
            match slot {
                EntrySlot::End => {
                    dir.end_of_entries = pos;
                    break;
                }
                EntrySlot::Free => {
                    if run_slots == 0 {
                        run_start = pos;
                    }
                    run_slots += 1;
                    pos += DIRENT_SIZE;
                }
                EntrySlot::Entry(entry) => {
                    if run_slots > 0 {
                        dir.free.add_free_range(run_start, run_slots);
                        run_slots = 0;
                    }
                    dir.record_loaded_entry(pos, entry);
                    pos += consumed;
                }
            }
        }
        if run_slots > 0 {
            dir.free.add_free_range(run_start, run_slots);
        }
        debug!(
            "loaded directory: {} entries, {} free records, watermark {}",
            dir.entries.len(),
            dir.free.free_slots(),
            dir.end_of_entries
        );
        Ok(dir)
    }

    fn record_loaded_entry(&mut self, pos: usize, entry: DirEntry) {
        if entry.name().is_self() {
            self.self_entry = Some((pos, entry));
            return;
        }
        if entry.name().is_parent() {
            self.parent_entry = Some((pos, entry));
            return;
        }
        if entry.is_volume_label() {
            self.volume_label = Some((pos, entry));
            return;
        }
        let short_key = self.ctx.codepage.upper_str(entry.name().short_name());
        let full_key = self.ctx.codepage.upper_str(entry.name().full_name());
        if self.short_index.contains_key(&short_key) || self.full_index.contains_key(&full_key) {
            warn!("duplicate name {short_key:?} in directory, later entry unreachable");
            self.entries.insert(pos, entry);
            return;
        }
        self.short_index.insert(short_key, pos);
        self.full_index.insert(full_key, pos);
        self.entries.insert(pos, entry);
    }

    pub(crate) fn first_cluster(&self) -> u32 {
        self.store.first_cluster()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub(crate) fn parent_handle(&self) -> Option<Arc<RwLock<Directory>>> {
        self.parent.as_ref().map(|(p, _)| Arc::clone(p))
    }

    pub(crate) fn volume_label_entry(&self) -> Option<&DirEntry> {
        self.volume_label.as_ref().map(|(_, e)| e)
    }

    /// Position of the first never-written record.
    pub fn end_of_entries(&self) -> usize {
        self.end_of_entries
    }

    /// Entry at a position. Unknown positions are absent, not errors.
    pub fn get_entry(&self, position: usize) -> Option<&DirEntry> {
        self.entries.get(&position)
    }

    /// Case-insensitive lookup by full name. Generated short names are not
    /// part of the lookup space; an entry without a long name has its short
    /// name as its full name, so plain 8.3 entries still resolve here.
    pub fn find(&self, name: &str) -> Option<usize> {
        let key = self.ctx.codepage.upper_str(name);
        self.full_index.get(&key).copied()
    }

    /// Live entries in stream order.
    pub fn list(&self) -> Vec<&DirEntry> {
        self.entries.values().collect()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    fn index_keys(&self, entry: &DirEntry) -> (String, String) {
        (
            self.ctx.codepage.upper_str(entry.name().short_name()),
            self.ctx.codepage.upper_str(entry.name().full_name()),
        )
    }

    /// Insert a new entry, reusing a free run when one fits, else appending
    /// at the watermark. Returns the entry's position.
    pub fn add_entry(&mut self, entry: DirEntry) -> Result<usize> {
        self.ctx.require_writable()?;
        let (short_key, full_key) = self.index_keys(&entry);
        if self.short_index.contains_key(&short_key) || self.full_index.contains_key(&full_key) {
            return Err(Error::AlreadyExists);
        }
        let result = self.place_entry(&entry);
        let flush = self.ctx.fat.write().flush();
        let position = result?;
        flush?;
        self.short_index.insert(short_key, position);
        self.full_index.insert(full_key, position);
        self.entries.insert(position, entry);
        self.mark_written()?;
        Ok(position)
    }

    /// Pick a slot run and write the encoded records; indexes are untouched.
    fn place_entry(&mut self, entry: &DirEntry) -> Result<usize> {
        let slots = entry.slot_count();
        let bytes = entry.encode(&self.ctx.codepage)?;
        let ctx = Arc::clone(&self.ctx);
        if let Some(position) = self.free.allocate(slots)? {
            if let Err(error) = self.store.write_at(&ctx, position, &bytes) {
                self.free.add_free_range(position, slots);
                return Err(error);
            }
            return Ok(position);
        }
        // No hole fits: append at the watermark. The bytes beyond it have
        // never been written, so the terminator is intact afterwards.
        let position = self.end_of_entries;
        self.store.write_at(&ctx, position, &bytes)?;
        self.end_of_entries = position + slots * DIRENT_SIZE;
        Ok(position)
    }

    /// Tombstone an entry's records and release them to the free table.
    /// With `release_contents` the cluster chain is freed as well.
    pub fn delete_entry(&mut self, position: usize, release_contents: bool) -> Result<()> {
        self.ctx.require_writable()?;
        let entry = self
            .entries
            .get(&position)
            .cloned()
            .ok_or(Error::NotFound)?;
        let slots = entry.slot_count();
        let result = (|| -> Result<()> {
            let mut tomb = vec![0u8; slots * DIRENT_SIZE];
            for slot in 0..slots {
                tomb[slot * DIRENT_SIZE] = DIR_ENTRY_UNUSED;
            }
            let ctx = Arc::clone(&self.ctx);
            self.store.write_at(&ctx, position, &tomb)?;
            if release_contents {
                self.ctx.fat.write().free_chain(entry.first_cluster())?;
            }
            Ok(())
        })();
        let flush = self.ctx.fat.write().flush();
        result?;
        flush?;
        let (short_key, full_key) = self.index_keys(&entry);
        self.entries.remove(&position);
        self.short_index.remove(&short_key);
        self.full_index.remove(&full_key);
        self.free.add_free_range(position, slots);
        self.mark_written()
    }

    /// Re-encode an entry in place. The record count must not change, so
    /// only non-name fields may differ; renaming is delete plus add.
    pub fn update_entry(&mut self, position: usize, entry: DirEntry) -> Result<()> {
        self.ctx.require_writable()?;
        let old = self.entries.get(&position).ok_or(Error::NotFound)?;
        if old.slot_count() != entry.slot_count() {
            return Err(Error::InvalidArgument("entry update must keep its record count"));
        }
        debug_assert_eq!(old.name().short_name(), entry.name().short_name());
        let bytes = entry.encode(&self.ctx.codepage)?;
        let ctx = Arc::clone(&self.ctx);
        self.store.write_at(&ctx, position, &bytes)?;
        self.entries.insert(position, entry);
        self.mark_written()
    }

    /// Refresh an entry's access date, and write time for writes, without
    /// the parent-mirroring of a structural mutation. Returns whether the
    /// stored record changed.
    pub(crate) fn touch_entry(&mut self, position: usize, write: bool) -> Result<bool> {
        let now = self.ctx.clock.now();
        let mut entry = self
            .entries
            .get(&position)
            .cloned()
            .ok_or(Error::NotFound)?;
        let before = entry.clone();
        entry.set_accessed(now);
        if write {
            entry.set_modified(now);
        }
        if entry == before {
            return Ok(false);
        }
        let bytes = entry.encode(&self.ctx.codepage)?;
        let ctx = Arc::clone(&self.ctx);
        self.store.write_at(&ctx, position, &bytes)?;
        self.entries.insert(position, entry);
        Ok(true)
    }

    /// Push a file's first cluster, size and write time into its entry.
    pub(crate) fn update_file_metadata(
        &mut self,
        position: usize,
        first_cluster: u32,
        size: u32,
    ) -> Result<()> {
        self.ctx.require_writable()?;
        let now = self.ctx.clock.now();
        let mut entry = self
            .entries
            .get(&position)
            .cloned()
            .ok_or(Error::NotFound)?;
        entry.set_first_cluster(first_cluster);
        entry.set_size(size);
        entry.set_accessed(now);
        entry.set_modified(now);
        let bytes = entry.encode(&self.ctx.codepage)?;
        let ctx = Arc::clone(&self.ctx);
        self.store.write_at(&ctx, position, &bytes)?;
        self.entries.insert(position, entry);
        self.mark_written()
    }

    /// Timestamp this directory's own entry in its parent, and mirror the
    /// change into the in-stream `.` record when the stored values moved.
    /// The root directory has no such mirror.
    fn mark_written(&mut self) -> Result<()> {
        let Some((parent, my_position)) = self.parent.clone() else {
            return Ok(());
        };
        let changed = parent.write().touch_entry(my_position, true)?;
        if !changed {
            return Ok(());
        }
        let now = self.ctx.clock.now();
        if let Some((dot_position, mut dot)) = self.self_entry.clone() {
            dot.set_accessed(now);
            dot.set_modified(now);
            let bytes = dot.encode(&self.ctx.codepage)?;
            let ctx = Arc::clone(&self.ctx);
            self.store.write_at(&ctx, dot_position, &bytes)?;
            self.self_entry = Some((dot_position, dot));
        }
        Ok(())
    }

    /// Re-point this directory at its entry's new location after a rename.
    /// The live object stays canonical for its cluster, so directories
    /// below it keep valid parent references.
    pub(crate) fn set_parent(&mut self, parent: Arc<RwLock<Directory>>, position: usize) {
        self.parent = Some((parent, position));
    }

    /// Rewrite the `..` record's cluster reference after this directory
    /// moved to a new parent.
    pub(crate) fn set_parent_record_cluster(&mut self, cluster: u32) -> Result<()> {
        let Some((position, mut entry)) = self.parent_entry.clone() else {
            return Ok(());
        };
        entry.set_first_cluster(cluster);
        let bytes = entry.encode(&self.ctx.codepage)?;
        let ctx = Arc::clone(&self.ctx);
        self.store.write_at(&ctx, position, &bytes)?;
        self.parent_entry = Some((position, entry));
        Ok(())
    }

    /// Derive a unique name for `input` against this directory's short-name
    /// space.
    pub fn generate_name(&self, input: &str) -> Result<FatFileName> {
        FatFileName::generate(input, &self.ctx.codepage, |candidate| {
            self.short_index
                .contains_key(&self.ctx.codepage.upper_str(candidate))
        })
    }

    /// Create an empty Archive-attribute file entry. The caller opens its
    /// stream separately; a fresh file owns no clusters yet.
    pub fn create_file_entry(&mut self, name: &str) -> Result<usize> {
        self.ctx.require_writable()?;
        if self.find(name).is_some() {
            return Err(Error::AlreadyExists);
        }
        let file_name = self.generate_name(name)?;
        let entry = DirEntry::new(file_name, Attributes::ARCHIVE, self.ctx.clock.now());
        self.add_entry(entry)
    }

    /// Create a child directory: one cluster, end-of-chain marked, with `.`
    /// and `..` as its first two records. Returns the new entry's position.
    pub fn create_child_directory(&mut self, name: &str) -> Result<usize> {
        self.ctx.require_writable()?;
        if self.find(name).is_some() {
            return Err(Error::AlreadyExists);
        }
        let file_name = self.generate_name(name)?;
        let mut entry = DirEntry::new(file_name, Attributes::DIRECTORY, self.ctx.clock.now());

        let result = (|| -> Result<usize> {
            let cluster = {
                let mut fat = self.ctx.fat.write();
                let cluster = fat.try_get_free_cluster()?.ok_or(Error::NoSpace)?;
                fat.set_end_of_chain(cluster)?;
                cluster
            };
            self.ctx.clear_cluster(cluster)?;
            entry.set_first_cluster(cluster);
            let position = self.place_entry(&entry)?;

            // The dot entries carry the same stamps as the new directory's
            // own entry. `..` holds 0 when the parent is the root.
            let parent_cluster = if self.is_root() {
                0
            } else {
                self.first_cluster()
            };
            let dot = DirEntry::self_entry_for(cluster, &entry);
            let dotdot = DirEntry::parent_entry_for(parent_cluster, &entry);
            let mut child = ClusterStream::new(Arc::clone(&self.ctx), cluster);
            child.write_at(0, &dot.encode(&self.ctx.codepage)?)?;
            child.write_at(DIRENT_SIZE, &dotdot.encode(&self.ctx.codepage)?)?;
            Ok(position)
        })();
        let flush = self.ctx.fat.write().flush();
        let position = result?;
        flush?;

        let (short_key, full_key) = self.index_keys(&entry);
        self.short_index.insert(short_key, position);
        self.full_index.insert(full_key, position);
        self.entries.insert(position, entry);
        self.mark_written()?;
        Ok(position)
    }

    /// Resolve or create a file per the open mode. `Truncate` and `Append`
    /// are rejected here; the layer above emulates them.
    pub fn open_file(this: &Arc<RwLock<Directory>>, name: &str, mode: OpenMode) -> Result<FatFile> {
        let ctx = Arc::clone(&this.read().ctx);
        let found = this.read().find(name);
        match (mode, found) {
            (OpenMode::Truncate | OpenMode::Append, _) => Err(Error::Unsupported),
            (OpenMode::Open | OpenMode::OpenOrCreate | OpenMode::Create, Some(position)) => {
                let entry = this
                    .read()
                    .get_entry(position)
                    .cloned()
                    .ok_or(Error::NotFound)?;
                if entry.is_directory() {
                    return Err(Error::AlreadyExists);
                }
                let mut file = FatFile::new(
                    ctx,
                    Arc::clone(this),
                    position,
                    entry.first_cluster(),
                    entry.size(),
                );
                if mode == OpenMode::Create {
                    file.set_len(0)?;
                }
                Ok(file)
            }
            (OpenMode::CreateNew, Some(_)) => Err(Error::AlreadyExists),
            (OpenMode::Open, None) => Err(Error::NotFound),
            (OpenMode::OpenOrCreate | OpenMode::CreateNew | OpenMode::Create, None) => {
                let position = this.write().create_file_entry(name)?;
                Ok(FatFile::new(ctx, Arc::clone(this), position, 0, 0))
            }
        }
    }
}
