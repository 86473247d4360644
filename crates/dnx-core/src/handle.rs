#![forbid(unsafe_code)]
//! Open file and directory handles and the open-flag vocabulary.

use bitflags::bitflags;
use dnx_ondisk::Ext2FileType;
use dnx_types::InodeNumber;
use serde::{Deserialize, Serialize};

bitflags! {
    /// POSIX open flags, octal values as on Linux.
    #[derive(Default)]
    pub struct OpenFlags: u32 {
        /// Read only. The empty set.
        const RDONLY = 0o0;
        const WRONLY = 0o1;
        const RDWR = 0o2;
        /// Create the goal component when it is missing.
        const CREAT = 0o100;
        /// With `CREAT`, fail when the goal already exists.
        const EXCL = 0o200;
        /// Truncate a regular file to zero length on open.
        const TRUNC = 0o1000;
        /// Start positioned at end of file.
        const APPEND = 0o2000;
    }
}

/// Seek origin and offset for [`Volume::fseek`](crate::Volume::fseek).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    /// Absolute position.
    Start(u64),
    /// Relative to the current position.
    Current(i64),
    /// Relative to the file size.
    End(i64),
}

/// An open file: inode, flags, cached size and byte position.
///
/// The handle is a plain value. Several handles may name the same inode;
/// the cached size is refreshed from the inode at the start of every read
/// and write. [`Volume::fclose`](crate::Volume::fclose) zeroes it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileHandle {
    pub(crate) inode: InodeNumber,
    pub(crate) flags: OpenFlags,
    pub(crate) fsize: u64,
    pub(crate) fpos: u64,
}

impl FileHandle {
    #[must_use]
    pub fn inode(&self) -> InodeNumber {
        self.inode
    }

    #[must_use]
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// File size as of the last operation on this handle.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.fsize
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        self.fpos
    }

    /// Whether [`Volume::fclose`](crate::Volume::fclose) has zeroed this handle.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inode.0 == 0
    }
}

/// One directory entry as returned by
/// [`Volume::dir_entry_get`](crate::Volume::dir_entry_get).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub ino: InodeNumber,
    pub name: Vec<u8>,
    /// Type byte from the entry; `Unknown` on volumes without `FILETYPE`.
    pub kind: Ext2FileType,
}

impl DirEntry {
    /// Return the name as a UTF-8 string (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// An open directory: its file handle plus the entry cached by the last
/// [`Volume::dir_entry_get`](crate::Volume::dir_entry_get).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirHandle {
    pub(crate) file: FileHandle,
    pub(crate) entry: Option<DirEntry>,
}

impl DirHandle {
    #[must_use]
    pub fn file(&self) -> &FileHandle {
        &self.file
    }

    #[must_use]
    pub fn inode(&self) -> InodeNumber {
        self.file.inode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_flag_values_match_linux() {
        assert_eq!(OpenFlags::RDONLY.bits(), 0);
        assert_eq!(OpenFlags::WRONLY.bits(), u32::try_from(libc::O_WRONLY).unwrap());
        assert_eq!(OpenFlags::RDWR.bits(), u32::try_from(libc::O_RDWR).unwrap());
        assert_eq!(OpenFlags::CREAT.bits(), u32::try_from(libc::O_CREAT).unwrap());
        assert_eq!(OpenFlags::EXCL.bits(), u32::try_from(libc::O_EXCL).unwrap());
        assert_eq!(OpenFlags::TRUNC.bits(), u32::try_from(libc::O_TRUNC).unwrap());
        assert_eq!(OpenFlags::APPEND.bits(), u32::try_from(libc::O_APPEND).unwrap());
    }

    #[test]
    fn default_handle_is_closed() {
        let file = FileHandle::default();
        assert!(file.is_closed());
        assert_eq!(file.flags(), OpenFlags::RDONLY);
        assert_eq!(file.size(), 0);
        assert_eq!(file.position(), 0);
    }
}
