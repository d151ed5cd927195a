#![forbid(unsafe_code)]
//! Block device abstraction.
//!
//! A PocketFS device is a fixed-size byte store partitioned into equal-sized
//! blocks. `FileBlockDevice` backs the store with a regular file
//! (pread/pwrite, no shared seek position); `MemBlockDevice` keeps it in
//! memory for tests. There is no caching layer: every `write_block` reaches
//! the backing store before returning, so mutations are observed in issue
//! order.

use parking_lot::Mutex;
use pfs_error::{PfsError, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::trace;

/// Block-addressed I/O interface.
///
/// Writes are assumed atomic at block granularity; callers read before
/// partially modifying a block.
pub trait BlockDevice: Send + Sync {
    /// Read block `block` into `buf`. `buf.len()` must equal `block_size()`.
    fn read_block(&self, block: u32, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` to block `block`. `buf.len()` must equal `block_size()`.
    fn write_block(&self, block: u32, buf: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u32;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// Sharing a device between an owner and an observer (e.g. a checker) goes
/// through `Arc`.
impl<T: BlockDevice + ?Sized> BlockDevice for std::sync::Arc<T> {
    fn read_block(&self, block: u32, buf: &mut [u8]) -> Result<()> {
        (**self).read_block(block, buf)
    }

    fn write_block(&self, block: u32, buf: &[u8]) -> Result<()> {
        (**self).write_block(block, buf)
    }

    fn block_size(&self) -> u32 {
        (**self).block_size()
    }

    fn block_count(&self) -> u32 {
        (**self).block_count()
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for Box<T> {
    fn read_block(&self, block: u32, buf: &mut [u8]) -> Result<()> {
        (**self).read_block(block, buf)
    }

    fn write_block(&self, block: u32, buf: &[u8]) -> Result<()> {
        (**self).write_block(block, buf)
    }

    fn block_size(&self) -> u32 {
        (**self).block_size()
    }

    fn block_count(&self) -> u32 {
        (**self).block_count()
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

/// Read a block into a freshly allocated buffer.
pub fn read_block_to_vec(dev: &dyn BlockDevice, block: u32) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; dev.block_size() as usize];
    dev.read_block(block, &mut buf)?;
    Ok(buf)
}

fn check_access(dev: &dyn BlockDevice, block: u32, buf_len: usize) -> Result<()> {
    if block >= dev.block_count() {
        return Err(PfsError::Invalid(format!(
            "block {block} out of range: device has {} blocks",
            dev.block_count()
        )));
    }
    if buf_len != dev.block_size() as usize {
        return Err(PfsError::Invalid(format!(
            "buffer length {buf_len} does not match block size {}",
            dev.block_size()
        )));
    }
    Ok(())
}

// ── File-backed device ──────────────────────────────────────────────────────

/// Device backed by a regular file, addressed with `pread`/`pwrite` via
/// `std::os::unix::fs::FileExt`.
#[derive(Debug)]
pub struct FileBlockDevice {
    file: File,
    block_size: u32,
    block_count: u32,
}

impl FileBlockDevice {
    /// Create the backing file if absent and extend it (zero-filled) to
    /// `size` bytes. `size` must be a positive multiple of `block_size`.
    pub fn create(path: impl AsRef<Path>, size: u64, block_size: u32) -> Result<Self> {
        check_geometry(size, block_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        if file.metadata()?.len() < size {
            // set_len zero-fills the extension
            file.set_len(size)?;
        }
        trace!(
            target: "pfs::block",
            event = "device_create",
            size = size,
            block_size = block_size
        );
        Self::from_file(file, size, block_size)
    }

    /// Open an existing backing file, deriving the block count from its
    /// length.
    pub fn open(path: impl AsRef<Path>, block_size: u32) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let size = file.metadata()?.len();
        check_geometry(size, block_size)?;
        Self::from_file(file, size, block_size)
    }

    fn from_file(file: File, size: u64, block_size: u32) -> Result<Self> {
        let count = size / u64::from(block_size);
        let block_count = u32::try_from(count)
            .map_err(|_| PfsError::Invalid(format!("device too large: {count} blocks")))?;
        Ok(Self {
            file,
            block_size,
            block_count,
        })
    }
}

fn check_geometry(size: u64, block_size: u32) -> Result<()> {
    if block_size == 0 || !block_size.is_power_of_two() {
        return Err(PfsError::Invalid(format!(
            "block size {block_size} is not a power of two"
        )));
    }
    if size == 0 || size % u64::from(block_size) != 0 {
        return Err(PfsError::Invalid(format!(
            "device size {size} is not a positive multiple of the block size"
        )));
    }
    Ok(())
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&self, block: u32, buf: &mut [u8]) -> Result<()> {
        check_access(self, block, buf.len())?;
        let offset = u64::from(block) * u64::from(self.block_size);
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_block(&self, block: u32, buf: &[u8]) -> Result<()> {
        check_access(self, block, buf.len())?;
        let offset = u64::from(block) * u64::from(self.block_size);
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

// ── In-memory device ────────────────────────────────────────────────────────

/// Volatile device used by unit tests and the format/check test harnesses.
#[derive(Debug)]
pub struct MemBlockDevice {
    block_size: u32,
    block_count: u32,
    data: Mutex<Vec<u8>>,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(block_count: u32, block_size: u32) -> Self {
        let len = block_count as usize * block_size as usize;
        Self {
            block_size,
            block_count,
            data: Mutex::new(vec![0u8; len]),
        }
    }

    /// Snapshot the raw contents (tests only need this for byte-level
    /// assertions).
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block: u32, buf: &mut [u8]) -> Result<()> {
        check_access(self, block, buf.len())?;
        let start = block as usize * self.block_size as usize;
        let data = self.data.lock();
        buf.copy_from_slice(&data[start..start + self.block_size as usize]);
        Ok(())
    }

    fn write_block(&self, block: u32, buf: &[u8]) -> Result<()> {
        check_access(self, block, buf.len())?;
        let start = block as usize * self.block_size as usize;
        let mut data = self.data.lock();
        data[start..start + self.block_size as usize].copy_from_slice(buf);
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
