//! Block device interface

/// Errors surfaced by a [`BlockDevice`] implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("block read failed")]
    Read,
    #[error("block write failed")]
    Write,
}

/// A seekable byte store presented in `BLOCK_SIZE` units.
///
/// The volume layer performs all device access through this trait; cluster
/// addressing, caching and the FAT live above it.
pub trait BlockDevice: Send + Sync {
    /// Read whole blocks from the device.
    ///
    /// - `offset` must be a multiple of `BLOCK_SIZE`
    /// - `block_cnt` = `buf.len() / BLOCK_SIZE`
    fn read_blocks(
        &self,
        buf: &mut [u8],
        offset: usize,
        block_cnt: usize,
    ) -> core::result::Result<(), DeviceError>;

    /// Write whole blocks to the device.
    ///
    /// - `buf.len()` must be a multiple of `BLOCK_SIZE`
    /// - `offset` must be a multiple of `BLOCK_SIZE`
    /// - `block_cnt` = `buf.len() / BLOCK_SIZE`
    fn write_blocks(
        &self,
        buf: &[u8],
        offset: usize,
        block_cnt: usize,
    ) -> core::result::Result<(), DeviceError>;

    /// Total capacity of the device in bytes.
    fn total_bytes(&self) -> usize;
}
