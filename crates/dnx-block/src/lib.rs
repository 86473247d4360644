#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Three levels, leaf first:
//!
//! - [`BlockIo`]: the OS-supplied provider, addressed in physical blocks
//!   (`bread`/`bwrite` of `count` blocks starting at `block_id`).
//! - [`BlockDev`]: binds a provider to the mount-time geometry and exposes
//!   logical (filesystem-sized) blocks once the superblock block size is known.
//! - [`BlockCache`]: ARC-cached logical blocks with dirty tracking and a
//!   nested write-back counter.

mod cache;

pub use cache::{BlockCache, CacheStats, WriteBackGuard};

use dnx_error::{DnxError, Result};
use dnx_types::BlockNumber;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Physical block provider supplied by the host OS.
///
/// `buf.len()` is always `count * physical block size`.
pub trait BlockIo: Send + Sync {
    /// Read `count` physical blocks starting at `block_id` into `buf`.
    fn bread(&self, buf: &mut [u8], block_id: u64, count: u32) -> Result<()>;

    /// Write `count` physical blocks starting at `block_id` from `buf`.
    fn bwrite(&self, buf: &[u8], block_id: u64, count: u32) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

impl<T: BlockIo + ?Sized> BlockIo for Arc<T> {
    fn bread(&self, buf: &mut [u8], block_id: u64, count: u32) -> Result<()> {
        (**self).bread(buf, block_id, count)
    }

    fn bwrite(&self, buf: &[u8], block_id: u64, count: u32) -> Result<()> {
        (**self).bwrite(buf, block_id, count)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

fn byte_range(block_size: u32, block_id: u64, len: usize, limit: u64) -> Result<(u64, u64)> {
    let offset = block_id
        .checked_mul(u64::from(block_size))
        .ok_or_else(|| DnxError::InvalidArgument("block offset overflow".to_owned()))?;
    let len = u64::try_from(len)
        .map_err(|_| DnxError::InvalidArgument("transfer length overflows u64".to_owned()))?;
    let end = offset
        .checked_add(len)
        .ok_or_else(|| DnxError::InvalidArgument("transfer range overflows u64".to_owned()))?;
    if end > limit {
        return Err(DnxError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("transfer out of bounds: offset={offset} len={len} device_len={limit}"),
        )));
    }
    Ok((offset, end))
}

/// Memory-backed provider.
#[derive(Debug)]
pub struct MemBlockIo {
    block_size: u32,
    bytes: Mutex<Vec<u8>>,
}

impl MemBlockIo {
    #[must_use]
    pub fn new(block_size: u32, block_count: u64) -> Self {
        let len = usize::try_from(u64::from(block_size) * block_count).unwrap_or(0);
        Self {
            block_size,
            bytes: Mutex::new(vec![0_u8; len]),
        }
    }

    /// Wrap an existing image. Trailing bytes past the last whole block are
    /// never addressed.
    #[must_use]
    pub fn from_bytes(block_size: u32, bytes: Vec<u8>) -> Self {
        Self {
            block_size,
            bytes: Mutex::new(bytes),
        }
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0) / u64::from(self.block_size)
    }

    /// Copy of the whole image.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl BlockIo for MemBlockIo {
    fn bread(&self, buf: &mut [u8], block_id: u64, _count: u32) -> Result<()> {
        let bytes = self.bytes.lock();
        let limit = u64::try_from(bytes.len()).unwrap_or(0);
        let (start, end) = byte_range(self.block_size, block_id, buf.len(), limit)?;
        #[allow(clippy::cast_possible_truncation)] // bounded by bytes.len()
        buf.copy_from_slice(&bytes[start as usize..end as usize]);
        drop(bytes);
        Ok(())
    }

    fn bwrite(&self, buf: &[u8], block_id: u64, _count: u32) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let limit = u64::try_from(bytes.len()).unwrap_or(0);
        let (start, end) = byte_range(self.block_size, block_id, buf.len(), limit)?;
        #[allow(clippy::cast_possible_truncation)] // bounded by bytes.len()
        bytes[start as usize..end as usize].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }
}

/// File-backed provider using `pread`/`pwrite` style I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which does not share a seek position.
#[derive(Debug, Clone)]
pub struct FileBlockIo {
    file: Arc<File>,
    block_size: u32,
    len: u64,
    writable: bool,
}

impl FileBlockIo {
    pub fn open(path: impl AsRef<Path>, block_size: u32) -> Result<Self> {
        if block_size == 0 {
            return Err(DnxError::InvalidArgument(
                "physical block size must be > 0".to_owned(),
            ));
        }
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            block_size,
            len,
            writable,
        })
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.len / u64::from(self.block_size)
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl BlockIo for FileBlockIo {
    fn bread(&self, buf: &mut [u8], block_id: u64, _count: u32) -> Result<()> {
        let (offset, _) = byte_range(self.block_size, block_id, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn bwrite(&self, buf: &[u8], block_id: u64, _count: u32) -> Result<()> {
        if !self.writable {
            return Err(DnxError::NotPermitted);
        }
        let (offset, _) = byte_range(self.block_size, block_id, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Logical-block interface shared by [`BlockDev`] and [`BlockCache`].
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Read `buf.len() / block_size()` consecutive blocks.
    fn read_blocks(&self, start: BlockNumber, buf: &mut [u8]) -> Result<()> {
        let bs = usize::try_from(self.block_size())
            .map_err(|_| DnxError::InvalidArgument("block_size does not fit usize".to_owned()))?;
        for (i, chunk) in buf.chunks_exact_mut(bs).enumerate() {
            let block = offset_block(start, i)?;
            chunk.copy_from_slice(self.read_block(block)?.as_slice());
        }
        Ok(())
    }

    /// Write `buf.len() / block_size()` consecutive blocks.
    fn write_blocks(&self, start: BlockNumber, buf: &[u8]) -> Result<()> {
        let bs = usize::try_from(self.block_size())
            .map_err(|_| DnxError::InvalidArgument("block_size does not fit usize".to_owned()))?;
        for (i, chunk) in buf.chunks_exact(bs).enumerate() {
            self.write_block(offset_block(start, i)?, chunk)?;
        }
        Ok(())
    }

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn offset_block(start: BlockNumber, index: usize) -> Result<BlockNumber> {
    u64::try_from(index)
        .ok()
        .and_then(|i| start.checked_add(i))
        .ok_or_else(|| DnxError::InvalidArgument("block index overflow".to_owned()))
}

/// Transfer counters kept by [`BlockDev`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockDevStats {
    /// `bread` calls issued to the provider.
    pub reads: u64,
    /// `bwrite` calls issued to the provider.
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// A [`BlockIo`] provider bound to mount-time geometry.
///
/// Starts with logical block size == physical block size; the mount path
/// switches to the superblock block size with [`BlockDev::set_lb_size`].
pub struct BlockDev {
    io: Arc<dyn BlockIo>,
    ph_bsize: u32,
    ph_bcnt: u64,
    lg_bsize: u32,
    lg_bcnt: u64,
    stats: Mutex<BlockDevStats>,
}

impl std::fmt::Debug for BlockDev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockDev")
            .field("ph_bsize", &self.ph_bsize)
            .field("ph_bcnt", &self.ph_bcnt)
            .field("lg_bsize", &self.lg_bsize)
            .field("lg_bcnt", &self.lg_bcnt)
            .finish_non_exhaustive()
    }
}

impl BlockDev {
    pub fn new(io: Arc<dyn BlockIo>, ph_bsize: u32, ph_bcnt: u64) -> Result<Self> {
        if ph_bsize == 0 || ph_bcnt == 0 {
            return Err(DnxError::InvalidArgument(format!(
                "physical geometry must be non-zero: block_size={ph_bsize} block_count={ph_bcnt}"
            )));
        }
        Ok(Self {
            io,
            ph_bsize,
            ph_bcnt,
            lg_bsize: ph_bsize,
            lg_bcnt: ph_bcnt,
            stats: Mutex::new(BlockDevStats::default()),
        })
    }

    /// Switch the logical block size. Must be a multiple of the physical size.
    pub fn set_lb_size(&mut self, lb_size: u32) -> Result<()> {
        if lb_size == 0 || lb_size % self.ph_bsize != 0 {
            return Err(DnxError::InvalidArgument(format!(
                "logical block size {lb_size} is not a multiple of physical block size {}",
                self.ph_bsize
            )));
        }
        let total = self.ph_bcnt.saturating_mul(u64::from(self.ph_bsize));
        self.lg_bsize = lb_size;
        self.lg_bcnt = total / u64::from(lb_size);
        debug!(
            lg_bsize = lb_size,
            lg_bcnt = self.lg_bcnt,
            "block_dev_logical_size"
        );
        Ok(())
    }

    #[must_use]
    pub fn physical_block_size(&self) -> u32 {
        self.ph_bsize
    }

    #[must_use]
    pub fn physical_block_count(&self) -> u64 {
        self.ph_bcnt
    }

    #[must_use]
    pub fn stats(&self) -> BlockDevStats {
        *self.stats.lock()
    }

    fn ph_per_lg(&self) -> u64 {
        u64::from(self.lg_bsize / self.ph_bsize)
    }

    fn ph_count(&self, len: usize) -> Result<u32> {
        let len = u64::try_from(len)
            .map_err(|_| DnxError::InvalidArgument("transfer length overflows u64".to_owned()))?;
        if len % u64::from(self.ph_bsize) != 0 {
            return Err(DnxError::InvalidArgument(format!(
                "transfer length {len} is not a multiple of physical block size {}",
                self.ph_bsize
            )));
        }
        u32::try_from(len / u64::from(self.ph_bsize))
            .map_err(|_| DnxError::InvalidArgument("transfer too large".to_owned()))
    }

    fn check_range(&self, start: BlockNumber, count: u64) -> Result<()> {
        let end = start.0.checked_add(count);
        if end.is_none_or(|end| end > self.lg_bcnt) {
            return Err(DnxError::Corruption {
                block: start.0,
                detail: format!(
                    "block range out of device: start={} count={count} block_count={}",
                    start.0, self.lg_bcnt
                ),
            });
        }
        Ok(())
    }

    fn ph_read(&self, buf: &mut [u8], ph_block: u64) -> Result<()> {
        let count = self.ph_count(buf.len())?;
        trace!(ph_block, count, "bread");
        self.io.bread(buf, ph_block, count)?;
        let mut stats = self.stats.lock();
        stats.reads += 1;
        stats.bytes_read += u64::try_from(buf.len()).unwrap_or(0);
        drop(stats);
        Ok(())
    }

    fn ph_write(&self, buf: &[u8], ph_block: u64) -> Result<()> {
        let count = self.ph_count(buf.len())?;
        trace!(ph_block, count, "bwrite");
        self.io.bwrite(buf, ph_block, count)?;
        let mut stats = self.stats.lock();
        stats.writes += 1;
        stats.bytes_written += u64::try_from(buf.len()).unwrap_or(0);
        drop(stats);
        Ok(())
    }

    /// Read an arbitrary byte region (used for the superblock before the
    /// logical block size is known).
    pub fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let (first, scratch_len, skip) = self.ph_span(offset, buf.len())?;
        let mut scratch = vec![0_u8; scratch_len];
        self.ph_read(&mut scratch, first)?;
        buf.copy_from_slice(&scratch[skip..skip + buf.len()]);
        Ok(())
    }

    /// Write an arbitrary byte region with read-modify-write of the
    /// covering physical blocks.
    pub fn write_bytes(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let (first, scratch_len, skip) = self.ph_span(offset, buf.len())?;
        let mut scratch = vec![0_u8; scratch_len];
        self.ph_read(&mut scratch, first)?;
        scratch[skip..skip + buf.len()].copy_from_slice(buf);
        self.ph_write(&scratch, first)
    }

    /// First physical block, covering length and in-span offset of a byte region.
    fn ph_span(&self, offset: u64, len: usize) -> Result<(u64, usize, usize)> {
        let bs = u64::from(self.ph_bsize);
        let len_u64 = u64::try_from(len)
            .map_err(|_| DnxError::InvalidArgument("region length overflows u64".to_owned()))?;
        let end = offset
            .checked_add(len_u64)
            .ok_or_else(|| DnxError::InvalidArgument("region overflows u64".to_owned()))?;
        let first = offset / bs;
        let last = end.div_ceil(bs);
        if last > self.ph_bcnt {
            return Err(DnxError::InvalidArgument(format!(
                "byte region {offset}..{end} beyond device"
            )));
        }
        let span = usize::try_from((last - first) * bs)
            .map_err(|_| DnxError::InvalidArgument("region too large".to_owned()))?;
        let skip = usize::try_from(offset - first * bs)
            .map_err(|_| DnxError::InvalidArgument("region offset too large".to_owned()))?;
        Ok((first, span, skip))
    }
}

impl BlockDevice for BlockDev {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        self.check_range(block, 1)?;
        let len = usize::try_from(self.lg_bsize)
            .map_err(|_| DnxError::InvalidArgument("block_size does not fit usize".to_owned()))?;
        let mut buf = vec![0_u8; len];
        self.ph_read(&mut buf, block.0 * self.ph_per_lg())?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if u64::try_from(data.len()).ok() != Some(u64::from(self.lg_bsize)) {
            return Err(DnxError::InvalidArgument(format!(
                "write_block data size mismatch: got={} expected={}",
                data.len(),
                self.lg_bsize
            )));
        }
        self.check_range(block, 1)?;
        self.ph_write(data, block.0 * self.ph_per_lg())
    }

    fn read_blocks(&self, start: BlockNumber, buf: &mut [u8]) -> Result<()> {
        let count = u64::try_from(buf.len()).unwrap_or(u64::MAX) / u64::from(self.lg_bsize);
        self.check_range(start, count)?;
        self.ph_read(buf, start.0 * self.ph_per_lg())
    }

    fn write_blocks(&self, start: BlockNumber, buf: &[u8]) -> Result<()> {
        let count = u64::try_from(buf.len()).unwrap_or(u64::MAX) / u64::from(self.lg_bsize);
        self.check_range(start, count)?;
        self.ph_write(buf, start.0 * self.ph_per_lg())
    }

    fn block_size(&self) -> u32 {
        self.lg_bsize
    }

    fn block_count(&self) -> u64 {
        self.lg_bcnt
    }

    fn sync(&self) -> Result<()> {
        self.io.sync()
    }
}
