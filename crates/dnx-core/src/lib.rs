#![forbid(unsafe_code)]
//! The dnx extN filesystem engine.
//!
//! A [`Volume`] is one mounted ext2 volume: the block device and cache, the
//! inode primitive layer and the volume lock. Every public method takes the
//! lock once, resolves paths from the root, and works on inode references
//! that are released on every exit path.
//!
//! Files and directories are addressed through plain handle values
//! ([`FileHandle`], [`DirHandle`]) that carry an inode number, open flags,
//! a cached size and a position. The [`vfs`] module adapts the engine to
//! the RTOS driver interface.

mod handle;
mod io;
mod link;
mod lock;
mod path;
mod remove;
pub mod vfs;

pub use dnx_error::{DnxError, Result};
pub use dnx_inode::{FormatOptions, RefStats, format};
pub use dnx_ondisk::Ext2FileType;
pub use dnx_types::InodeNumber;
pub use handle::{DirEntry, DirHandle, FileHandle, OpenFlags, SeekFrom};
pub use lock::{CondvarLock, OsLock};

use dnx_block::{BlockCache, BlockDev, BlockIo};
use dnx_inode::Ext2Fs;
use lock::{Locked, VolumeLock};
use path::Expect;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default block cache capacity, in filesystem blocks.
pub const DEFAULT_CACHE_BLOCKS: usize = 64;

/// Mount-time configuration.
#[derive(Clone)]
pub struct MountOptions {
    /// Block cache capacity in filesystem blocks.
    pub cache_blocks: usize,
    /// Initialize an index for each new directory when the volume
    /// advertises `DIR_INDEX`.
    pub dir_index: bool,
    /// Lock hooks serializing access to the volume.
    pub lock: Arc<dyn OsLock>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            cache_blocks: DEFAULT_CACHE_BLOCKS,
            dir_index: false,
            lock: Arc::new(CondvarLock::default()),
        }
    }
}

impl std::fmt::Debug for MountOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountOptions")
            .field("cache_blocks", &self.cache_blocks)
            .field("dir_index", &self.dir_index)
            .finish_non_exhaustive()
    }
}

/// Volume statistics reported by [`Volume::statfs`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub inodes_count: u32,
    pub free_inodes_count: u32,
    pub blocks_count: u32,
    pub free_blocks_count: u32,
    pub block_size: u32,
    pub block_group_count: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub volume_name: String,
}

/// Inode status reported by [`Volume::stat`] and [`Volume::fstat`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub ino: InodeNumber,
    /// Type derived from the inode mode.
    pub kind: Ext2FileType,
    /// Permission bits including setuid, setgid and sticky.
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub links: u16,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
}

/// A mounted volume.
pub struct Volume {
    fs: Ext2Fs,
    lock: VolumeLock,
    dir_index: bool,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("fs", &self.fs)
            .field("lock", &self.lock)
            .field("dir_index", &self.dir_index)
            .finish()
    }
}

impl Volume {
    /// Mount the volume on `io`, a device of `ph_bcnt` physical blocks of
    /// `ph_bsize` bytes.
    ///
    /// The superblock block size becomes the logical block size of the
    /// device and the cache. Anything set up before a failing step is
    /// released before the error is returned.
    pub fn mount(
        io: Arc<dyn BlockIo>,
        ph_bsize: u32,
        ph_bcnt: u64,
        options: MountOptions,
    ) -> Result<Self> {
        if ph_bsize == 0 || ph_bcnt == 0 {
            return Err(DnxError::InvalidArgument(format!(
                "device geometry {ph_bcnt} x {ph_bsize}"
            )));
        }
        if options.cache_blocks == 0 {
            return Err(DnxError::InvalidArgument(
                "cache capacity must be > 0".to_owned(),
            ));
        }

        let mut dev = BlockDev::new(io, ph_bsize, ph_bcnt)?;
        let sb = Ext2Fs::probe(&dev)?;
        dev.set_lb_size(sb.block_size)?;
        let cache = BlockCache::new(dev, options.cache_blocks)?;
        let fs = Ext2Fs::open(cache, sb)?;
        debug!(
            ph_bsize,
            ph_bcnt,
            block_size = fs.block_size(),
            cache_blocks = options.cache_blocks,
            dir_index = options.dir_index,
            "mount"
        );
        Ok(Self {
            fs,
            lock: VolumeLock::new(options.lock),
            dir_index: options.dir_index,
        })
    }

    /// Write back all state and release the volume.
    ///
    /// Handles still held by callers become meaningless.
    pub fn umount(self) -> Result<()> {
        let stats = self.fs.ref_stats();
        if stats.outstanding() != 0 {
            warn!(outstanding = stats.outstanding(), "umount_with_live_refs");
        }
        self.fs.fini()?;
        debug!("umount");
        Ok(())
    }

    pub(crate) fn enter(&self) -> Result<Locked<'_>> {
        let token = self.lock.acquire()?;
        Ok(Locked::new(self, token))
    }

    /// Inode reference acquisitions and releases so far.
    #[must_use]
    pub fn ref_stats(&self) -> RefStats {
        self.fs.ref_stats()
    }

    pub fn statfs(&self) -> Result<Stats> {
        let cx = self.enter()?;
        let sb = cx.fs().superblock();
        Ok(Stats {
            inodes_count: sb.inodes_count,
            free_inodes_count: sb.free_inodes_count,
            blocks_count: sb.blocks_count,
            free_blocks_count: sb.free_blocks_count,
            block_size: sb.block_size,
            block_group_count: sb.groups_count(),
            blocks_per_group: sb.blocks_per_group,
            inodes_per_group: sb.inodes_per_group,
            volume_name: sb.volume_name,
        })
    }

    /// Enable or disable write-back caching. Calls nest: each enable needs a
    /// matching disable, and the last disable flushes.
    pub fn cache_write_back(&self, on: bool) -> Result<()> {
        self.enter()?.fs().set_write_back(on)
    }

    /// Flush dirty blocks and superblock counters without unmounting.
    pub fn sync(&self) -> Result<()> {
        self.enter()?.fs().sync()
    }

    // ── Files ────────────────────────────────────────────────────────────

    /// Open the file at `path`. Directories are reported as not found.
    pub fn fopen(&self, path: &str, flags: OpenFlags) -> Result<FileHandle> {
        let cx = self.enter()?;
        let guard = cx.fs().write_back_guard();
        let opened = cx.generic_open(path, flags, Expect::File);
        let flushed = guard.finish();
        let opened = opened?;
        flushed?;
        Ok(opened.file)
    }

    /// Invalidate `file`.
    pub fn fclose(&self, file: &mut FileHandle) -> Result<()> {
        *file = FileHandle::default();
        Ok(())
    }

    /// Move the handle position. Positions past the cached size and before
    /// the start are rejected.
    pub fn fseek(&self, file: &mut FileHandle, pos: SeekFrom) -> Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => file.fpos.checked_add_signed(delta),
            SeekFrom::End(delta) => file.fsize.checked_add_signed(delta),
        };
        match target {
            Some(at) if at <= file.fsize => {
                file.fpos = at;
                Ok(at)
            }
            _ => Err(DnxError::InvalidArgument(format!(
                "seek {pos:?} outside 0..={}",
                file.fsize
            ))),
        }
    }

    #[must_use]
    pub fn ftell(&self, file: &FileHandle) -> u64 {
        file.fpos
    }

    pub fn fstat(&self, file: &FileHandle) -> Result<FileStat> {
        let cx = self.enter()?;
        stat_inode(&cx, file.inode)
    }

    /// Status of the file or directory at `path`.
    pub fn stat(&self, path: &str) -> Result<FileStat> {
        let cx = self.enter()?;
        let opened = cx.generic_open(path, OpenFlags::RDONLY, Expect::Any)?;
        stat_inode(&cx, opened.file.inode)
    }

    /// Status of inode `ino`.
    pub fn stat_inode(&self, ino: InodeNumber) -> Result<FileStat> {
        let cx = self.enter()?;
        stat_inode(&cx, ino)
    }

    /// Replace the permission bits of `path`; the type bits are kept.
    pub fn chmod(&self, path: &str, mode: u16) -> Result<()> {
        let cx = self.enter()?;
        let opened = cx.generic_open(path, OpenFlags::RDONLY, Expect::Any)?;
        let mut iref = cx.fs().get_inode_ref(opened.file.inode)?;
        let inode = iref.inode_mut();
        inode.mode = inode.file_type_mode() | (mode & 0o7777);
        inode.ctime = dnx_inode::now();
        iref.mark_dirty();
        iref.put()
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        let cx = self.enter()?;
        let opened = cx.generic_open(path, OpenFlags::RDONLY, Expect::Any)?;
        let mut iref = cx.fs().get_inode_ref(opened.file.inode)?;
        let inode = iref.inode_mut();
        inode.uid = uid;
        inode.gid = gid;
        inode.ctime = dnx_inode::now();
        iref.mark_dirty();
        iref.put()
    }

    // ── Directories ──────────────────────────────────────────────────────

    /// Create the directory at `path`. An existing directory is left as is.
    pub fn dir_mk(&self, path: &str) -> Result<()> {
        let cx = self.enter()?;
        match cx.generic_open(path, OpenFlags::RDONLY, Expect::Directory) {
            Ok(_) => return Ok(()),
            Err(DnxError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        let guard = cx.fs().write_back_guard();
        let created = cx.generic_open(
            path,
            OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC,
            Expect::Directory,
        );
        let flushed = guard.finish();
        created?;
        flushed?;
        debug!(path, "dir_mk");
        Ok(())
    }

    pub fn dir_open(&self, path: &str) -> Result<DirHandle> {
        let cx = self.enter()?;
        let opened = cx.generic_open(path, OpenFlags::RDONLY, Expect::Directory)?;
        Ok(DirHandle {
            file: opened.file,
            entry: None,
        })
    }

    pub fn dir_close(&self, dir: &mut DirHandle) -> Result<()> {
        *dir = DirHandle::default();
        Ok(())
    }

    /// Entry number `index` of `dir`, counting live entries from the start
    /// of the directory on every call. `None` past the last entry.
    pub fn dir_entry_get<'d>(
        &self,
        dir: &'d mut DirHandle,
        index: usize,
    ) -> Result<Option<&'d DirEntry>> {
        let cx = self.enter()?;
        let iref = cx.fs().get_inode_ref(dir.file.inode)?;
        let found = iref.dir_iter()?.nth(index).transpose()?;
        iref.put()?;
        dir.entry = found.map(|e| DirEntry {
            ino: InodeNumber(e.inode),
            kind: e.file_type,
            name: e.name,
        });
        Ok(dir.entry.as_ref())
    }
}

fn stat_inode(cx: &Locked<'_>, ino: InodeNumber) -> Result<FileStat> {
    let iref = cx.fs().get_inode_ref(ino)?;
    let inode = iref.inode();
    let stat = FileStat {
        ino,
        kind: inode.file_type(),
        mode: inode.permission_bits(),
        uid: inode.uid,
        gid: inode.gid,
        size: inode.size,
        links: inode.links_count,
        atime: inode.atime,
        mtime: inode.mtime,
        ctime: inode.ctime,
    };
    iref.put()?;
    Ok(stat)
}
