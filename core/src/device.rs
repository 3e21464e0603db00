// Block device capability consumed by the FAT driver.
// Everything above this layer speaks in whole sectors.

use crate::error::{FatError, FatResult};
use log::{debug, trace};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Fixed-size sector access to a storage medium.
pub trait BlockDevice: Send {
    /// Bring the device up. Called once by mount before any I/O.
    fn init(&mut self) -> FatResult<()>;

    /// Release the device. Called by unmount and by failed mounts.
    fn shutdown(&mut self) -> FatResult<()>;

    /// Read `count` blocks starting at `start` into `buf`.
    /// `buf` must be exactly `count * block_size()` bytes.
    fn read_blocks(&mut self, start: u64, count: usize, buf: &mut [u8]) -> FatResult<()>;

    /// Write `count` blocks starting at `start` from `buf`.
    fn write_blocks(&mut self, start: u64, count: usize, buf: &[u8]) -> FatResult<()>;

    fn block_size(&self) -> usize;

    fn block_count(&self) -> u64;
}

impl<D: BlockDevice + ?Sized> BlockDevice for Box<D> {
    fn init(&mut self) -> FatResult<()> {
        (**self).init()
    }

    fn shutdown(&mut self) -> FatResult<()> {
        (**self).shutdown()
    }

    fn read_blocks(&mut self, start: u64, count: usize, buf: &mut [u8]) -> FatResult<()> {
        (**self).read_blocks(start, count, buf)
    }

    fn write_blocks(&mut self, start: u64, count: usize, buf: &[u8]) -> FatResult<()> {
        (**self).write_blocks(start, count, buf)
    }

    fn block_size(&self) -> usize {
        (**self).block_size()
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for &mut D {
    fn init(&mut self) -> FatResult<()> {
        (**self).init()
    }

    fn shutdown(&mut self) -> FatResult<()> {
        (**self).shutdown()
    }

    fn read_blocks(&mut self, start: u64, count: usize, buf: &mut [u8]) -> FatResult<()> {
        (**self).read_blocks(start, count, buf)
    }

    fn write_blocks(&mut self, start: u64, count: usize, buf: &[u8]) -> FatResult<()> {
        (**self).write_blocks(start, count, buf)
    }

    fn block_size(&self) -> usize {
        (**self).block_size()
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }
}

/// Shared I/O counters. Cloning shares the underlying counts, so a test can
/// keep a handle after the device has been moved into a volume.
#[derive(Debug, Clone, Default)]
pub struct IoStats {
    reads: Arc<AtomicU64>,
    writes: Arc<AtomicU64>,
    inits: Arc<AtomicU64>,
    shutdowns: Arc<AtomicU64>,
}

impl IoStats {
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn inits(&self) -> u64 {
        self.inits.load(Ordering::Relaxed)
    }

    pub fn shutdowns(&self) -> u64 {
        self.shutdowns.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.reads.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
    }
}

fn check_range(
    start: u64,
    count: usize,
    buf_len: usize,
    block_size: usize,
    block_count: u64,
) -> FatResult<()> {
    if buf_len != count * block_size {
        return Err(FatError::io(format!(
            "Buffer of {} bytes does not hold {} blocks of {} bytes",
            buf_len, count, block_size
        )));
    }
    if start + count as u64 > block_count {
        return Err(FatError::io(format!(
            "Blocks {}..{} out of range (device has {} blocks)",
            start,
            start + count as u64,
            block_count
        )));
    }
    Ok(())
}

/// RAM-backed block device. Used by tests and for building images in memory.
#[derive(Debug, Clone)]
pub struct MemoryBlockDevice {
    data: Vec<u8>,
    block_size: usize,
    initialized: bool,
    fail_init: bool,
    fail_writes_after: Option<u64>,
    stats: IoStats,
}

impl MemoryBlockDevice {
    pub fn new(block_count: u64) -> Self {
        Self::with_block_size(block_count, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(block_count: u64, block_size: usize) -> Self {
        Self {
            data: vec![0u8; block_count as usize * block_size],
            block_size,
            initialized: false,
            fail_init: false,
            fail_writes_after: None,
            stats: IoStats::default(),
        }
    }

    /// Wrap an existing image. Trailing bytes short of a full block are dropped.
    pub fn from_bytes(mut data: Vec<u8>) -> Self {
        let whole = data.len() - data.len() % DEFAULT_BLOCK_SIZE;
        data.truncate(whole);
        Self {
            data,
            block_size: DEFAULT_BLOCK_SIZE,
            initialized: false,
            fail_init: false,
            fail_writes_after: None,
            stats: IoStats::default(),
        }
    }

    /// Make `init` fail, to exercise mount error paths.
    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    /// Let `n` more writes succeed, then fail every write after that.
    pub fn fail_writes_after(&mut self, n: u64) {
        self.fail_writes_after = Some(self.stats.writes() + n);
    }

    pub fn stats(&self) -> IoStats {
        self.stats.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn init(&mut self) -> FatResult<()> {
        self.stats.inits.fetch_add(1, Ordering::Relaxed);
        if self.fail_init {
            return Err(FatError::DeviceInitFailed("memory device refused init".to_string()));
        }
        self.initialized = true;
        Ok(())
    }

    fn shutdown(&mut self) -> FatResult<()> {
        self.stats.shutdowns.fetch_add(1, Ordering::Relaxed);
        self.initialized = false;
        Ok(())
    }

    fn read_blocks(&mut self, start: u64, count: usize, buf: &mut [u8]) -> FatResult<()> {
        check_range(start, count, buf.len(), self.block_size, self.block_count())?;
        let offset = start as usize * self.block_size;
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_blocks(&mut self, start: u64, count: usize, buf: &[u8]) -> FatResult<()> {
        check_range(start, count, buf.len(), self.block_size, self.block_count())?;
        if let Some(limit) = self.fail_writes_after {
            if self.stats.writes() >= limit {
                return Err(FatError::io(format!("injected write failure at block {}", start)));
            }
        }
        let offset = start as usize * self.block_size;
        self.data[offset..offset + buf.len()].copy_from_slice(buf);
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        (self.data.len() / self.block_size) as u64
    }
}

/// Block device over a disk image file (or a raw device node).
/// The file is opened by `init` and closed by `shutdown`.
#[derive(Debug)]
pub struct FileBlockDevice {
    path: PathBuf,
    file: Option<File>,
    block_size: usize,
    block_count: u64,
    writable: bool,
    stats: IoStats,
}

impl FileBlockDevice {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: None,
            block_size: DEFAULT_BLOCK_SIZE,
            block_count: 0,
            writable: true,
            stats: IoStats::default(),
        }
    }

    /// Open without write access; writes fail with a device error.
    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    /// Create (or resize) an image file of `size_bytes` and return a device for it.
    pub fn create(path: impl AsRef<Path>, size_bytes: u64) -> FatResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;
        file.set_len(size_bytes)?;
        debug!("Created image {} ({} bytes)", path.as_ref().display(), size_bytes);
        Ok(Self::new(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> IoStats {
        self.stats.clone()
    }

    fn file(&mut self) -> FatResult<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| FatError::io(format!("{} is not initialized", self.path.display())))
    }
}

impl BlockDevice for FileBlockDevice {
    fn init(&mut self) -> FatResult<()> {
        self.stats.inits.fetch_add(1, Ordering::Relaxed);
        let file = OpenOptions::new()
            .read(true)
            .write(self.writable)
            .open(&self.path)
            .map_err(|e| FatError::DeviceInitFailed(format!("{}: {}", self.path.display(), e)))?;
        let len = file
            .metadata()
            .map_err(|e| FatError::DeviceInitFailed(format!("{}: {}", self.path.display(), e)))?
            .len();
        self.block_count = len / self.block_size as u64;
        self.file = Some(file);
        debug!("Opened {} ({} blocks)", self.path.display(), self.block_count);
        Ok(())
    }

    fn shutdown(&mut self) -> FatResult<()> {
        self.stats.shutdowns.fetch_add(1, Ordering::Relaxed);
        if let Some(file) = self.file.take() {
            if self.writable {
                file.sync_all()?;
            }
        }
        Ok(())
    }

    fn read_blocks(&mut self, start: u64, count: usize, buf: &mut [u8]) -> FatResult<()> {
        check_range(start, count, buf.len(), self.block_size, self.block_count)?;
        let offset = start * self.block_size as u64;
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        trace!("read {} block(s) at {}", count, start);
        Ok(())
    }

    fn write_blocks(&mut self, start: u64, count: usize, buf: &[u8]) -> FatResult<()> {
        check_range(start, count, buf.len(), self.block_size, self.block_count)?;
        if !self.writable {
            return Err(FatError::io(format!("{} opened read-only", self.path.display())));
        }
        let offset = start * self.block_size as u64;
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        trace!("wrote {} block(s) at {}", count, start);
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_device_roundtrip() {
        let mut dev = MemoryBlockDevice::new(8);
        dev.init().unwrap();

        let block = [0xABu8; 512];
        dev.write_blocks(3, 1, &block).unwrap();

        let mut out = [0u8; 512];
        dev.read_blocks(3, 1, &mut out).unwrap();
        assert_eq!(out, block);
        assert_eq!(dev.stats().reads(), 1);
        assert_eq!(dev.stats().writes(), 1);
    }

    #[test]
    fn test_memory_device_rejects_out_of_range() {
        let mut dev = MemoryBlockDevice::new(4);
        let mut buf = [0u8; 1024];
        assert!(dev.read_blocks(3, 2, &mut buf).is_err());
        assert!(dev.read_blocks(0, 1, &mut buf).is_err()); // wrong buffer size
    }

    #[test]
    fn test_injected_write_failure() {
        let mut dev = MemoryBlockDevice::new(4);
        dev.fail_writes_after(1);
        let block = [1u8; 512];
        assert!(dev.write_blocks(0, 1, &block).is_ok());
        assert!(matches!(dev.write_blocks(1, 1, &block), Err(FatError::DeviceIoError(_))));
    }

    #[test]
    fn test_failing_init() {
        let mut dev = MemoryBlockDevice::new(4).failing_init();
        assert!(matches!(dev.init(), Err(FatError::DeviceInitFailed(_))));
        assert_eq!(dev.stats().inits(), 1);
    }

    #[test]
    fn test_file_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut dev = FileBlockDevice::create(&path, 16 * 512).unwrap();
        dev.init().unwrap();
        assert_eq!(dev.block_count(), 16);

        let block = [0x5Au8; 512];
        dev.write_blocks(15, 1, &block).unwrap();
        let mut out = [0u8; 512];
        dev.read_blocks(15, 1, &mut out).unwrap();
        assert_eq!(out, block);
        dev.shutdown().unwrap();

        // Closed after shutdown.
        assert!(dev.read_blocks(0, 1, &mut out).is_err());
    }
}
