#![forbid(unsafe_code)]
//! RTOS VFS driver adapter (`ext2fs`).
//!
//! Mounts a volume from an image file with 512-byte physical blocks and
//! exposes the driver entry points the RTOS file layer calls: positioned
//! reads and writes, stat, directory listing with VFS file types, removal
//! that falls back to recursive directory removal, and `statfs`. Failures
//! become errno values through [`errno`].

use crate::{
    DirHandle, FileHandle, FileStat, MountOptions, OpenFlags, SeekFrom, Volume,
};
use dnx_block::{BlockIo, FileBlockIo};
use dnx_error::{DnxError, Result};
use dnx_ondisk::Ext2FileType;
use dnx_types::InodeNumber;
use libc::c_int;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Physical block size of image files.
pub const PHYSICAL_BLOCK_SIZE: u32 = 512;

/// Filesystem type reported by [`Ext2Vfs::statfs`].
pub const EXT2FS_TYPE: u32 = 2;

/// Filesystem name reported by [`Ext2Vfs::statfs`].
pub const EXT2FS_NAME: &str = "ext2fs";

/// File types known to the VFS layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VfsFileType {
    Regular,
    Dir,
    /// Device driver node (character or block device).
    Drv,
    Link,
    /// FIFO or socket.
    Pipe,
    Unknown,
}

impl From<Ext2FileType> for VfsFileType {
    fn from(kind: Ext2FileType) -> Self {
        match kind {
            Ext2FileType::RegFile => Self::Regular,
            Ext2FileType::Dir => Self::Dir,
            Ext2FileType::Chrdev | Ext2FileType::Blkdev => Self::Drv,
            Ext2FileType::Fifo | Ext2FileType::Sock => Self::Pipe,
            Ext2FileType::Symlink => Self::Link,
            Ext2FileType::Unknown => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfsStat {
    pub ino: InodeNumber,
    pub kind: VfsFileType,
    /// Permission bits.
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: u32,
}

impl From<FileStat> for VfsStat {
    fn from(st: FileStat) -> Self {
        Self {
            ino: st.ino,
            kind: st.kind.into(),
            mode: st.mode,
            uid: st.uid,
            gid: st.gid,
            size: st.size,
            mtime: st.mtime,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfsStatfs {
    pub bfree: u64,
    pub blocks: u64,
    pub bsize: u32,
    pub ffree: u64,
    pub files: u64,
    pub fs_type: u32,
    pub fsname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfsDirEntry {
    pub name: String,
    pub size: u64,
    pub filetype: VfsFileType,
}

/// Open directory with its read position.
#[derive(Debug, Default)]
pub struct VfsDir {
    handle: DirHandle,
    seek: usize,
}

impl VfsDir {
    #[must_use]
    pub fn position(&self) -> usize {
        self.seek
    }
}

/// Errno for `err`, logged at the driver boundary.
#[must_use]
pub fn errno(err: &DnxError) -> c_int {
    let code = err.to_errno();
    if code == libc::ENOENT {
        trace!(errno = code, error = %err, "vfs_enoent");
    } else {
        warn!(errno = code, error = %err, "vfs_error");
    }
    code
}

/// One mounted `ext2fs` driver instance.
#[derive(Debug)]
pub struct Ext2Vfs {
    vol: Volume,
}

impl Ext2Vfs {
    /// Mount the image file at `image` with default options.
    pub fn init(image: impl AsRef<Path>) -> Result<Self> {
        Self::init_with_options(image, MountOptions::default())
    }

    pub fn init_with_options(image: impl AsRef<Path>, options: MountOptions) -> Result<Self> {
        let file = FileBlockIo::open(image.as_ref(), PHYSICAL_BLOCK_SIZE)?;
        let count = file.block_count();
        let io: Arc<dyn BlockIo> = Arc::new(file);
        let vol = Volume::mount(io, PHYSICAL_BLOCK_SIZE, count, options)?;
        debug!(image = %image.as_ref().display(), blocks = count, "vfs_init");
        Ok(Self { vol })
    }

    /// Unmount, writing back all state.
    pub fn release(self) -> Result<()> {
        self.vol.umount()
    }

    #[must_use]
    pub fn volume(&self) -> &Volume {
        &self.vol
    }

    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<FileHandle> {
        self.vol.fopen(path, flags)
    }

    pub fn close(&self, file: &mut FileHandle) -> Result<()> {
        self.vol.fclose(file)
    }

    /// Write `buf` at byte offset `pos`.
    pub fn write_at(&self, file: &mut FileHandle, buf: &[u8], pos: u64) -> Result<usize> {
        self.vol.fseek(file, SeekFrom::Start(pos))?;
        self.vol.fwrite(file, buf)
    }

    /// Read into `buf` from byte offset `pos`.
    pub fn read_at(&self, file: &mut FileHandle, buf: &mut [u8], pos: u64) -> Result<usize> {
        self.vol.fseek(file, SeekFrom::Start(pos))?;
        self.vol.fread(file, buf)
    }

    /// No device controls exist on regular files.
    pub fn ioctl(&self, _file: &FileHandle, _request: u32) -> Result<()> {
        Err(DnxError::NotPermitted)
    }

    pub fn flush(&self, _file: &FileHandle) -> Result<()> {
        Ok(())
    }

    pub fn fstat(&self, file: &FileHandle) -> Result<VfsStat> {
        self.vol.fstat(file).map(VfsStat::from)
    }

    pub fn stat(&self, path: &str) -> Result<VfsStat> {
        self.vol.stat(path).map(VfsStat::from)
    }

    /// Create the directory and apply `mode`. A failing chmod does not fail
    /// the call.
    pub fn mkdir(&self, path: &str, mode: u16) -> Result<()> {
        self.vol.dir_mk(path)?;
        if let Err(err) = self.vol.chmod(path, mode) {
            warn!(path, mode, error = %err, "mkdir_chmod_failed");
        }
        Ok(())
    }

    pub fn mkfifo(&self, _path: &str, _mode: u16) -> Result<()> {
        Err(DnxError::NotPermitted)
    }

    pub fn mknod(&self, _path: &str, _dev: u64) -> Result<()> {
        Err(DnxError::NotPermitted)
    }

    pub fn opendir(&self, path: &str) -> Result<VfsDir> {
        let handle = self.vol.dir_open(path)?;
        Ok(VfsDir { handle, seek: 0 })
    }

    /// Next entry of `dir`, or `None` when the listing is exhausted.
    pub fn readdir(&self, dir: &mut VfsDir) -> Result<Option<VfsDirEntry>> {
        let Some(entry) = self.vol.dir_entry_get(&mut dir.handle, dir.seek)?.cloned() else {
            return Ok(None);
        };
        dir.seek += 1;
        let size = self.vol.stat_inode(entry.ino)?.size;
        Ok(Some(VfsDirEntry {
            name: entry.name_str(),
            size,
            filetype: entry.kind.into(),
        }))
    }

    pub fn closedir(&self, mut dir: VfsDir) -> Result<()> {
        self.vol.dir_close(&mut dir.handle)
    }

    /// Remove a file, or a directory with everything beneath it.
    pub fn remove(&self, path: &str) -> Result<()> {
        match self.vol.fremove(path) {
            Ok(()) => Ok(()),
            Err(err) => {
                trace!(path, error = %err, "remove_falls_back_to_dir_rm");
                self.vol.dir_rm(path)
            }
        }
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.vol.rename(from, to)
    }

    pub fn chmod(&self, path: &str, mode: u16) -> Result<()> {
        self.vol.chmod(path, mode)
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.vol.chown(path, uid, gid)
    }

    pub fn statfs(&self) -> Result<VfsStatfs> {
        let st = self.vol.statfs()?;
        Ok(VfsStatfs {
            bfree: u64::from(st.free_blocks_count),
            blocks: u64::from(st.blocks_count),
            bsize: st.block_size,
            ffree: u64::from(st.free_inodes_count),
            files: u64::from(st.inodes_count),
            fs_type: EXT2FS_TYPE,
            fsname: EXT2FS_NAME.to_owned(),
        })
    }

    pub fn sync(&self) -> Result<()> {
        self.vol.sync()
    }
}
