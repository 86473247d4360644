#![forbid(unsafe_code)]
//! Shared newtypes, ext2 constants and byte helpers.
//!
//! Every other dnx crate depends on this one. It performs no I/O.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const EXT2_SUPERBLOCK_OFFSET: usize = 1024;
pub const EXT2_SUPERBLOCK_SIZE: usize = 1024;
pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;

/// Maximum length of one path component / directory entry name.
pub const EXT2_NAME_LEN: usize = 255;

/// First usable inode on revision 0 volumes.
pub const EXT2_GOOD_OLD_FIRST_INO: u32 = 11;
/// Inode size on revision 0 volumes.
pub const EXT2_GOOD_OLD_INODE_SIZE: u16 = 128;

/// Number of direct block pointers in `i_block`.
pub const EXT2_NDIR_BLOCKS: usize = 12;
pub const EXT2_IND_BLOCK: usize = 12;
pub const EXT2_DIND_BLOCK: usize = 13;
pub const EXT2_TIND_BLOCK: usize = 14;
/// Total number of `i_block` slots.
pub const EXT2_N_BLOCKS: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// ext2 inode number (1-indexed, 32 bits on disk). The default, 0, names
/// no inode.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct InodeNumber(pub u32);

/// Block group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupNumber(pub u32);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

/// Byte range `offset..offset + len` of a buffer of `avail` bytes.
fn span(avail: usize, offset: usize, len: usize) -> Result<std::ops::Range<usize>, ParseError> {
    let end = offset.checked_add(len).ok_or(ParseError::InvalidField {
        field: "offset",
        reason: "overflow",
    })?;
    if end > avail {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: avail.saturating_sub(offset),
        });
    }
    Ok(offset..end)
}

/// Borrow `len` bytes at `offset`, or report how short the buffer is.
#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    Ok(&data[span(data.len(), offset, len)?])
}

#[inline]
fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let range = span(data.len(), offset, len)?;
    Ok(&mut data[range])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_u8(data: &mut [u8], offset: usize, value: u8) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 1)?[0] = value;
    Ok(())
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_fixed(data: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, bytes.len())?.copy_from_slice(bytes);
    Ok(())
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

/// NUL-pad `text` into a fixed array, truncating at `N` bytes.
#[must_use]
pub fn nul_padded<const N: usize>(text: &str) -> [u8; N] {
    let mut out = [0_u8; N];
    let bytes = text.as_bytes();
    let len = bytes.len().min(N);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

#[must_use]
pub fn ext2_block_size_from_log(log_block_size: u32) -> Option<u32> {
    let shift = 10_u32.checked_add(log_block_size)?;
    1_u32.checked_shl(shift)
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl InodeNumber {
    pub const ROOT: Self = Self(2);
}

impl BlockNumber {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Narrow to `u32` (ext2 block pointers are 32 bits).
    pub fn to_u32(self) -> Result<u32, ParseError> {
        u32::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "block_number",
        })
    }
}

// ── POSIX file mode constants ────────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u16 = 0o170_000;
/// Named pipe (FIFO).
pub const S_IFIFO: u16 = 0o010_000;
/// Character device.
pub const S_IFCHR: u16 = 0o020_000;
/// Directory.
pub const S_IFDIR: u16 = 0o040_000;
/// Block device.
pub const S_IFBLK: u16 = 0o060_000;
/// Regular file.
pub const S_IFREG: u16 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u16 = 0o120_000;
/// Socket.
pub const S_IFSOCK: u16 = 0o140_000;

// ── inode flags (i_flags) ───────────────────────────────────────────────────

/// Hash-indexed directory.
pub const EXT2_INDEX_FL: u32 = 0x0000_1000;

/// Inode numbers are 1-indexed; group assignment uses `(ino - 1) / inodes_per_group`.
#[must_use]
pub fn inode_to_group(ino: InodeNumber, inodes_per_group: u32) -> GroupNumber {
    GroupNumber(ino.0.saturating_sub(1) / inodes_per_group)
}

/// Index of an inode within its block group.
#[must_use]
pub fn inode_index_in_group(ino: InodeNumber, inodes_per_group: u32) -> u32 {
    ino.0.saturating_sub(1) % inodes_per_group
}

/// Whether a group carries a superblock backup under the sparse_super rule
/// (groups 0, 1 and powers of 3, 5 and 7).
#[must_use]
pub fn is_sparse_super_group(group: GroupNumber) -> bool {
    fn is_power_of(mut n: u32, base: u32) -> bool {
        while n > 1 && n % base == 0 {
            n /= base;
        }
        n == 1
    }
    let g = group.0;
    g <= 1 || is_power_of(g, 3) || is_power_of(g, 5) || is_power_of(g, 7)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert!(read_le_u32(&bytes, 6).is_err());
    }

    #[test]
    fn test_write_helpers() {
        let mut bytes = [0_u8; 8];
        write_le_u16(&mut bytes, 0, 0xBEEF).expect("u16");
        write_le_u32(&mut bytes, 2, 0x1122_3344).expect("u32");
        write_u8(&mut bytes, 7, 0x7F).expect("u8");
        assert_eq!(bytes, [0xEF, 0xBE, 0x44, 0x33, 0x22, 0x11, 0x00, 0x7F]);
        assert!(write_le_u32(&mut bytes, 6, 1).is_err());
    }

    #[test]
    fn test_trim_nul_padded() {
        let raw = b"dnx\0\0\0\0";
        assert_eq!(trim_nul_padded(raw), "dnx");
    }

    #[test]
    fn test_nul_padded_truncates() {
        let out: [u8; 4] = nul_padded("volume");
        assert_eq!(&out, b"volu");
        let out: [u8; 8] = nul_padded("ab");
        assert_eq!(&out, b"ab\0\0\0\0\0\0");
    }

    #[test]
    fn test_ext2_block_size_from_log() {
        assert_eq!(ext2_block_size_from_log(0), Some(1024));
        assert_eq!(ext2_block_size_from_log(1), Some(2048));
        assert_eq!(ext2_block_size_from_log(2), Some(4096));
        assert_eq!(ext2_block_size_from_log(40), None);
    }

    #[test]
    fn test_inode_group_math() {
        assert_eq!(inode_to_group(InodeNumber(1), 128), GroupNumber(0));
        assert_eq!(inode_to_group(InodeNumber(128), 128), GroupNumber(0));
        assert_eq!(inode_to_group(InodeNumber(129), 128), GroupNumber(1));

        assert_eq!(inode_index_in_group(InodeNumber(1), 128), 0);
        assert_eq!(inode_index_in_group(InodeNumber(2), 128), 1);
        assert_eq!(inode_index_in_group(InodeNumber(129), 128), 0);
    }

    #[test]
    fn test_sparse_super_groups() {
        let with_backup: Vec<u32> = (0..50)
            .filter(|g| is_sparse_super_group(GroupNumber(*g)))
            .collect();
        assert_eq!(with_backup, vec![0, 1, 3, 5, 7, 9, 25, 27, 49]);
    }

    #[test]
    fn test_block_number_to_u32() {
        assert_eq!(BlockNumber(7).to_u32(), Ok(7));
        assert!(BlockNumber(u64::from(u32::MAX) + 1).to_u32().is_err());
        assert_eq!(BlockNumber(u64::MAX).checked_add(1), None);
    }
}
