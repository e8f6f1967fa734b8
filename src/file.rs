//! Byte streams over cluster chains, and the open-file handle.
//!
//! A [`ClusterStream`] presents one chain as a flat byte range. Writes past
//! the current capacity extend the chain lazily, zeroing each new cluster;
//! a stream created over cluster 0 is empty and gets its first cluster on
//! the first write. The owner of the stream is responsible for writing any
//! first-cluster change back into its directory entry, which is what
//! [`FatFile`] does for regular files.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::RwLock;

use crate::dir::Directory;
use crate::fat::ClusterAllocator;
use crate::fs::VolumeCtx;
use crate::{Error, Result};

/// A positioned view of one cluster chain.
pub(crate) struct ClusterStream {
    ctx: Arc<VolumeCtx>,
    first_cluster: u32,
}

impl ClusterStream {
    pub fn new(ctx: Arc<VolumeCtx>, first_cluster: u32) -> Self {
        Self { ctx, first_cluster }
    }

    pub fn first_cluster(&self) -> u32 {
        self.first_cluster
    }

    /// Bytes currently backed by allocated clusters.
    pub fn capacity(&self) -> Result<usize> {
        let clusters = self.ctx.fat.read().chain_len(self.first_cluster)?;
        Ok(clusters as usize * self.ctx.layout.bytes_per_cluster)
    }

    /// Read into `buf`, stopping at the end of the chain. Returns the bytes
    /// read.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let bpc = self.ctx.layout.bytes_per_cluster;
        let chain = self.ctx.fat.read().chain(self.first_cluster)?;
        let capacity = chain.len() * bpc;
        if offset >= capacity || buf.is_empty() {
            return Ok(0);
        }
        let end = capacity.min(offset + buf.len());
        let mut cache = self.ctx.cache.lock();
        let mut done = 0;
        let mut pos = offset;
        while pos < end {
            let cluster = chain[pos / bpc];
            let within = pos % bpc;
            let len = (bpc - within).min(end - pos);
            let disk = self.ctx.layout.cluster_offset(cluster) + within;
            cache.read_bytes(disk, &mut buf[done..done + len])?;
            pos += len;
            done += len;
        }
        Ok(done)
    }

    /// Write `buf`, extending the chain as needed.
    pub fn write_at(&mut self, offset: usize, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.ensure_capacity(offset + buf.len())?;
        let bpc = self.ctx.layout.bytes_per_cluster;
        let chain = self.ctx.fat.read().chain(self.first_cluster)?;
        let mut cache = self.ctx.cache.lock();
        let mut done = 0;
        let mut pos = offset;
        while done < buf.len() {
            let cluster = chain[pos / bpc];
            let within = pos % bpc;
            let len = (bpc - within).min(buf.len() - done);
            let disk = self.ctx.layout.cluster_offset(cluster) + within;
            cache.write_bytes(disk, &buf[done..done + len])?;
            pos += len;
            done += len;
        }
        Ok(())
    }

    /// Grow the chain to cover `bytes`. New clusters are zeroed so directory
    /// streams keep their terminator and files read back as zeros.
    pub fn ensure_capacity(&mut self, bytes: usize) -> Result<()> {
        let bpc = self.ctx.layout.bytes_per_cluster;
        let needed = bytes.div_ceil(bpc);
        let mut fat = self.ctx.fat.write();
        let chain = fat.chain(self.first_cluster)?;
        if needed <= chain.len() {
            return Ok(());
        }
        let mut tail = chain.last().copied();
        let mut fresh: Vec<u32> = Vec::new();
        for _ in chain.len()..needed {
            let cluster = fat.try_get_free_cluster()?.ok_or(Error::NoSpace)?;
            fat.set_end_of_chain(cluster)?;
            match tail {
                Some(t) => fat.extend_chain(t, cluster)?,
                None => self.first_cluster = cluster,
            }
            tail = Some(cluster);
            fresh.push(cluster);
        }
        drop(fat);
        let mut cache = self.ctx.cache.lock();
        for cluster in fresh {
            cache.fill_bytes(self.ctx.layout.cluster_offset(cluster), bpc, 0)?;
        }
        Ok(())
    }

    /// Shrink the chain to the clusters covering `keep_bytes`. Shrinking to
    /// zero releases the whole chain and resets the first cluster.
    pub fn truncate(&mut self, keep_bytes: usize) -> Result<()> {
        let bpc = self.ctx.layout.bytes_per_cluster;
        let keep = keep_bytes.div_ceil(bpc);
        let mut fat = self.ctx.fat.write();
        let chain = fat.chain(self.first_cluster)?;
        if keep >= chain.len() {
            return Ok(());
        }
        if keep == 0 {
            fat.free_chain(self.first_cluster)?;
            self.first_cluster = 0;
            return Ok(());
        }
        fat.free_chain(chain[keep])?;
        let end = fat.fat_type().end_of_chain();
        fat.set_entry(chain[keep - 1], end)
    }
}

/// An open regular file: a cluster stream plus the directory entry that
/// owns it. Size and timestamps are mirrored back into the entry on every
/// write, and the access date on reads when the volume is writable.
pub struct FatFile {
    dir: Arc<RwLock<Directory>>,
    entry_position: usize,
    stream: ClusterStream,
    size: u32,
}

impl FatFile {
    pub(crate) fn new(
        ctx: Arc<VolumeCtx>,
        dir: Arc<RwLock<Directory>>,
        entry_position: usize,
        first_cluster: u32,
        size: u32,
    ) -> Self {
        Self {
            dir,
            entry_position,
            stream: ClusterStream::new(ctx, first_cluster),
            size,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Read up to `buf.len()` bytes at `offset`; short reads happen only at
    /// end of file.
    pub fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size as usize {
            return Ok(0);
        }
        let len = buf.len().min(self.size as usize - offset);
        let read = self.stream.read_at(offset, &mut buf[..len])?;
        if self.stream.ctx.writable {
            self.dir.write().touch_entry(self.entry_position, false)?;
        }
        Ok(read)
    }

    /// Write all of `buf` at `offset`, growing the file as needed. The
    /// directory entry is synchronized even when the write fails partway,
    /// so clusters claimed by a failed extension stay reachable.
    pub fn write_at(&mut self, offset: usize, buf: &[u8]) -> Result<usize> {
        self.stream.ctx.require_writable()?;
        let result = self.stream.write_at(offset, buf);
        if result.is_ok() {
            let end = (offset + buf.len()) as u32;
            if end > self.size {
                self.size = end;
            }
        }
        let sync = self.sync_entry();
        result.and(sync)?;
        Ok(buf.len())
    }

    /// Change the file length. Extending zero-fills; shrinking releases the
    /// clusters past the new end. As with writes, the entry is synchronized
    /// on the error path too.
    pub fn set_len(&mut self, len: u32) -> Result<()> {
        self.stream.ctx.require_writable()?;
        let result = if len as usize > self.stream.capacity()? {
            self.stream.ensure_capacity(len as usize)
        } else {
            self.stream.truncate(len as usize)
        };
        if result.is_ok() {
            self.size = len;
        }
        let sync = self.sync_entry();
        result.and(sync)
    }

    /// Push size, first cluster and write time into the directory entry and
    /// persist the FAT.
    fn sync_entry(&mut self) -> Result<()> {
        let mut dir = self.dir.write();
        let result = dir.update_file_metadata(
            self.entry_position,
            self.stream.first_cluster(),
            self.size,
        );
        let flush = self.stream.ctx.fat.write().flush();
        result.and(flush)
    }
}

impl fmt::Debug for FatFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FatFile")
            .field("entry_position", &self.entry_position)
            .field("first_cluster", &self.stream.first_cluster())
            .field("size", &self.size)
            .finish()
    }
}
