#![forbid(unsafe_code)]
//! Directory block operations.
//!
//! In-place insertion, removal and retargeting of entries inside a single
//! directory data block, plus initialization of fresh blocks (`.`/`..`,
//! empty leaf, indexed-directory root). Every function takes the volume's
//! `FILETYPE` flag because it changes the header layout.
//!
//! Corruption errors report block 0; callers that know the physical block
//! rewrite it.

use dnx_error::{DnxError, Result};
use dnx_ondisk::{DirEntryHeader, EXT2_DIR_ENTRY_HEADER_LEN, Ext2FileType};
use dnx_types::{EXT2_NAME_LEN, write_le_u16, write_le_u32, write_u8};

/// Size of `struct dx_root_info` following the `..` entry of an index root.
const DX_ROOT_INFO_LEN: usize = 8;
/// Size of one `dx_entry` (`hash`, `block`); the count/limit pair takes one slot.
const DX_ENTRY_LEN: usize = 8;

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// On-disk size of an entry with a `name_len`-byte name.
#[must_use]
pub fn required_rec_len(name_len: usize) -> usize {
    align4(EXT2_DIR_ENTRY_HEADER_LEN + name_len)
}

fn corrupt(detail: &str) -> DnxError {
    DnxError::Corruption {
        block: 0,
        detail: detail.to_owned(),
    }
}

fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(DnxError::InvalidArgument(
            "directory entry name cannot be empty".to_owned(),
        ));
    }
    if name.len() > EXT2_NAME_LEN {
        return Err(DnxError::NameTooLong);
    }
    Ok(())
}

/// One validated slot of a directory block.
#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: usize,
    header: DirEntryHeader,
}

impl Slot {
    fn rec_len(self) -> usize {
        usize::from(self.header.rec_len)
    }

    fn name_range(self) -> std::ops::Range<usize> {
        let start = self.offset + EXT2_DIR_ENTRY_HEADER_LEN;
        start..start + usize::from(self.header.name_len)
    }

    fn is_live(self) -> bool {
        self.header.inode != 0
    }
}

/// Walk every slot (live or deleted), validating `rec_len` chaining.
fn slots(block: &[u8], filetype: bool) -> Result<Vec<Slot>> {
    let mut out = Vec::new();
    let mut off = 0_usize;
    while off + EXT2_DIR_ENTRY_HEADER_LEN <= block.len() {
        let header = DirEntryHeader::parse(block, off, filetype)
            .map_err(|e| corrupt(&format!("directory entry header: {e}")))?;
        let rec_len = usize::from(header.rec_len);
        if rec_len < EXT2_DIR_ENTRY_HEADER_LEN || rec_len % 4 != 0 {
            return Err(corrupt("invalid directory entry rec_len"));
        }
        let end = off + rec_len;
        if end > block.len() {
            return Err(corrupt("directory entry exceeds block boundary"));
        }
        let slot = Slot {
            offset: off,
            header,
        };
        if slot.is_live() && slot.name_range().end > end {
            return Err(corrupt("directory entry name exceeds rec_len"));
        }
        out.push(slot);
        off = end;
    }
    Ok(out)
}

fn write_entry(
    block: &mut [u8],
    offset: usize,
    ino: u32,
    rec_len: usize,
    file_type: Ext2FileType,
    name: &[u8],
    filetype: bool,
) -> Result<()> {
    let end = offset
        .checked_add(rec_len)
        .ok_or_else(|| DnxError::Format("directory entry offset overflow".to_owned()))?;
    if end > block.len() {
        return Err(corrupt("directory entry exceeds block boundary"));
    }
    if rec_len < required_rec_len(name.len()) {
        return Err(DnxError::Format(
            "directory entry rec_len smaller than minimum".to_owned(),
        ));
    }
    let header = DirEntryHeader {
        inode: ino,
        rec_len: u16::try_from(rec_len)
            .map_err(|_| DnxError::Format("directory entry rec_len exceeds u16".to_owned()))?,
        name_len: u16::try_from(name.len())
            .map_err(|_| DnxError::Format("directory entry name too long".to_owned()))?,
        file_type: if filetype { file_type.to_raw() } else { 0 },
    };
    header
        .write(block, offset, filetype)
        .map_err(|e| DnxError::Format(format!("directory entry write: {e}")))?;
    let name_start = offset + EXT2_DIR_ENTRY_HEADER_LEN;
    block[name_start..name_start + name.len()].copy_from_slice(name);
    block[name_start + name.len()..end].fill(0);
    Ok(())
}

/// Add an entry into a single directory block.
///
/// - Reuses a deleted slot (`inode == 0`) when large enough.
/// - Otherwise splits a live slot with enough slack.
///
/// Returns the byte offset of the new entry, or [`DnxError::NoSpace`] when
/// the block cannot hold it.
pub fn add_entry(
    block: &mut [u8],
    ino: u32,
    name: &[u8],
    file_type: Ext2FileType,
    filetype: bool,
) -> Result<usize> {
    if ino == 0 {
        return Err(DnxError::InvalidArgument(
            "directory entry inode cannot be zero".to_owned(),
        ));
    }
    validate_name(name)?;

    let need = required_rec_len(name.len());
    if need > block.len() {
        return Err(DnxError::NoSpace);
    }

    for slot in slots(block, filetype)? {
        if !slot.is_live() {
            if slot.rec_len() >= need {
                write_entry(block, slot.offset, ino, slot.rec_len(), file_type, name, filetype)?;
                return Ok(slot.offset);
            }
            continue;
        }

        let actual = required_rec_len(usize::from(slot.header.name_len));
        let slack = slot.rec_len().saturating_sub(actual);
        if slack >= need {
            let actual_u16 = u16::try_from(actual)
                .map_err(|_| DnxError::Format("actual rec_len exceeds u16".to_owned()))?;
            write_le_u16(block, slot.offset + 4, actual_u16)
                .map_err(|e| DnxError::Format(format!("rec_len write: {e}")))?;
            let new_off = slot.offset + actual;
            write_entry(block, new_off, ino, slack, file_type, name, filetype)?;
            return Ok(new_off);
        }
    }

    Err(DnxError::NoSpace)
}

/// Remove an entry by name from a single directory block.
///
/// The previous live entry's `rec_len` absorbs the removed slot; when the
/// entry is first in the block its inode is zeroed instead. Returns
/// `false` when the name is not present.
pub fn remove_entry(block: &mut [u8], name: &[u8], filetype: bool) -> Result<bool> {
    validate_name(name)?;

    let mut prev_live: Option<Slot> = None;
    for slot in slots(block, filetype)? {
        if slot.is_live() && &block[slot.name_range()] == name {
            if let Some(prev) = prev_live {
                let merged = u16::try_from(prev.rec_len() + slot.rec_len())
                    .map_err(|_| DnxError::Format("merged rec_len exceeds u16".to_owned()))?;
                write_le_u16(block, prev.offset + 4, merged)
                    .map_err(|e| DnxError::Format(format!("rec_len write: {e}")))?;
            }
            write_le_u32(block, slot.offset, 0)
                .map_err(|e| DnxError::Format(format!("inode write: {e}")))?;
            return Ok(true);
        }
        if slot.is_live() {
            prev_live = Some(slot);
        }
    }
    Ok(false)
}

/// Point the entry called `name` at `new_ino`. Returns `false` when absent.
pub fn retarget_entry(block: &mut [u8], name: &[u8], new_ino: u32, filetype: bool) -> Result<bool> {
    validate_name(name)?;
    for slot in slots(block, filetype)? {
        if slot.is_live() && &block[slot.name_range()] == name {
            write_le_u32(block, slot.offset, new_ino)
                .map_err(|e| DnxError::Format(format!("inode write: {e}")))?;
            return Ok(true);
        }
    }
    Ok(false)
}

/// Initialize a directory block with `.` and `..`, `..` spanning the rest.
pub fn init_dir_block(block: &mut [u8], self_ino: u32, parent_ino: u32, filetype: bool) -> Result<()> {
    let dot_len = required_rec_len(1);
    if block.len() < dot_len + required_rec_len(2) {
        return Err(DnxError::Format(
            "directory block too small for . and .. entries".to_owned(),
        ));
    }
    block.fill(0);
    write_entry(block, 0, self_ino, dot_len, Ext2FileType::Dir, b".", filetype)?;
    write_entry(
        block,
        dot_len,
        parent_ino,
        block.len() - dot_len,
        Ext2FileType::Dir,
        b"..",
        filetype,
    )
}

/// Initialize a block holding one deleted entry that spans it.
pub fn init_empty_block(block: &mut [u8], filetype: bool) -> Result<()> {
    block.fill(0);
    let header = DirEntryHeader {
        inode: 0,
        rec_len: u16::try_from(block.len())
            .map_err(|_| DnxError::Format("directory block exceeds u16 rec_len".to_owned()))?,
        name_len: 0,
        file_type: 0,
    };
    header
        .write(block, 0, filetype)
        .map_err(|e| DnxError::Format(format!("directory entry write: {e}")))
}

/// Initialize an indexed-directory root block.
///
/// Layout: `.`, then `..` spanning the block, then `dx_root_info`
/// (hash version, info length 8, no indirect levels) and a count/limit
/// header with a single entry pointing at logical block 1. The leaf itself
/// is written by the caller with [`init_empty_block`].
pub fn init_dx_root(
    block: &mut [u8],
    self_ino: u32,
    parent_ino: u32,
    hash_version: u8,
    filetype: bool,
) -> Result<()> {
    init_dir_block(block, self_ino, parent_ino, filetype)?;

    let info = required_rec_len(1) + required_rec_len(2);
    let entries = info + DX_ROOT_INFO_LEN;
    if block.len() < entries + 2 * DX_ENTRY_LEN {
        return Err(DnxError::Format(
            "directory block too small for index root".to_owned(),
        ));
    }
    let limit = u16::try_from((block.len() - entries) / DX_ENTRY_LEN)
        .map_err(|_| DnxError::Format("dx limit exceeds u16".to_owned()))?;

    let write = |block: &mut [u8]| -> std::result::Result<(), dnx_types::ParseError> {
        write_le_u32(block, info, 0)?;
        write_u8(block, info + 4, hash_version)?;
        write_u8(block, info + 5, DX_ROOT_INFO_LEN as u8)?;
        write_u8(block, info + 6, 0)?;
        write_u8(block, info + 7, 0)?;
        write_le_u16(block, entries, limit)?;
        write_le_u16(block, entries + 2, 1)?;
        write_le_u32(block, entries + 4, 1)
    };
    write(block).map_err(|e| DnxError::Format(format!("dx root write: {e}")))
}
