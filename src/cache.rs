//! Write-back block cache.
//!
//! Every sector the volume touches goes through one [`CacheManager`], owned
//! by that volume. The manager keeps a bounded LRU of [`BlockCache`] entries;
//! an entry is written back when it is evicted, when it is dropped, or when
//! `sync_all` runs. Keying the cache per volume (instead of one process-wide
//! map) keeps block ids of two mounted devices from aliasing each other.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::num::NonZeroUsize;

use lru::LruCache;
use spin::RwLock;

use crate::device::{BlockDevice, DeviceError};
use crate::{Error, Result, BLOCK_SIZE};

/// Number of sectors kept in memory per volume.
pub const BLOCK_CACHE_LIMIT: usize = 64;

/// One cached sector.
pub struct BlockCache {
    data: Vec<u8>,
    block_id: usize,
    device: Arc<dyn BlockDevice>,
    dirty: bool,
}

impl BlockCache {
    fn load(block_id: usize, device: Arc<dyn BlockDevice>) -> Result<Self> {
        let mut data = vec![0u8; BLOCK_SIZE];
        device.read_blocks(&mut data, block_id * BLOCK_SIZE, 1)?;
        Ok(Self {
            data,
            block_id,
            device,
            dirty: false,
        })
    }

    /// Read access to a byte range of the sector.
    pub fn read<V>(&self, offset: usize, len: usize, f: impl FnOnce(&[u8]) -> V) -> V {
        f(&self.data[offset..offset + len])
    }

    /// Mutable access to a byte range of the sector. Marks the block dirty.
    pub fn modify<V>(&mut self, offset: usize, len: usize, f: impl FnOnce(&mut [u8]) -> V) -> V {
        self.dirty = true;
        f(&mut self.data[offset..offset + len])
    }

    /// Write the sector back to the device if it changed.
    pub fn sync(&mut self) -> core::result::Result<(), DeviceError> {
        if self.dirty {
            self.dirty = false;
            self.device
                .write_blocks(&self.data, self.block_id * BLOCK_SIZE, 1)?;
        }
        Ok(())
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        // Last-resort write-back; explicit sync paths report errors.
        let _ = self.sync();
    }
}

pub struct CacheManager {
    device: Arc<dyn BlockDevice>,
    lru: LruCache<usize, Arc<RwLock<BlockCache>>>,
}

impl CacheManager {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self {
            device,
            lru: LruCache::new(NonZeroUsize::new(BLOCK_CACHE_LIMIT).unwrap()),
        }
    }

    /// Fetch a sector, loading it from the device on a miss.
    pub fn get(&mut self, block_id: usize) -> Result<Arc<RwLock<BlockCache>>> {
        if let Some(block) = self.lru.get(&block_id) {
            return Ok(Arc::clone(block));
        }
        let block = Arc::new(RwLock::new(BlockCache::load(
            block_id,
            Arc::clone(&self.device),
        )?));
        if let Some((_, evicted)) = self.lru.push(block_id, Arc::clone(&block)) {
            evicted.write().sync().map_err(Error::Io)?;
        }
        Ok(block)
    }

    /// Read an arbitrary byte range through the cache.
    pub fn read_bytes(&mut self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done;
            let block_id = pos / BLOCK_SIZE;
            let in_block = pos % BLOCK_SIZE;
            let len = (BLOCK_SIZE - in_block).min(buf.len() - done);
            let block = self.get(block_id)?;
            block
                .read()
                .read(in_block, len, |bytes| buf[done..done + len].copy_from_slice(bytes));
            done += len;
        }
        Ok(())
    }

    /// Write an arbitrary byte range through the cache.
    pub fn write_bytes(&mut self, offset: usize, buf: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done;
            let block_id = pos / BLOCK_SIZE;
            let in_block = pos % BLOCK_SIZE;
            let len = (BLOCK_SIZE - in_block).min(buf.len() - done);
            let block = self.get(block_id)?;
            block
                .write()
                .modify(in_block, len, |bytes| bytes.copy_from_slice(&buf[done..done + len]));
            done += len;
        }
        Ok(())
    }

    /// Fill a byte range with one value through the cache.
    pub fn fill_bytes(&mut self, offset: usize, len: usize, value: u8) -> Result<()> {
        let mut done = 0;
        while done < len {
            let pos = offset + done;
            let block_id = pos / BLOCK_SIZE;
            let in_block = pos % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - in_block).min(len - done);
            let block = self.get(block_id)?;
            block
                .write()
                .modify(in_block, chunk, |bytes| bytes.fill(value));
            done += chunk;
        }
        Ok(())
    }

    /// Write every dirty sector back to the device.
    pub fn sync_all(&mut self) -> Result<()> {
        for (_, block) in self.lru.iter() {
            block.write().sync().map_err(Error::Io)?;
        }
        Ok(())
    }
}
