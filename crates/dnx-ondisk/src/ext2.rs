#![forbid(unsafe_code)]

use dnx_types::{
    EXT2_GOOD_OLD_FIRST_INO, EXT2_GOOD_OLD_INODE_SIZE, EXT2_INDEX_FL, EXT2_N_BLOCKS,
    EXT2_SUPER_MAGIC, EXT2_SUPERBLOCK_SIZE, GroupNumber, InodeNumber,
    ParseError, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK,
    ext2_block_size_from_log, is_sparse_super_group, nul_padded, read_fixed,
    read_le_u16, read_le_u32, read_u8, trim_nul_padded, write_fixed, write_le_u16, write_le_u32,
    write_u8,
};
use serde::{Deserialize, Serialize};

/// On-disk size of one ext2 group descriptor.
pub const EXT2_GROUP_DESC_SIZE: usize = 32;

/// Fixed part of a directory entry (`inode`, `rec_len`, `name_len`, `file_type`).
pub const EXT2_DIR_ENTRY_HEADER_LEN: usize = 8;

// ── ext2 feature flags ─────────────────────────────────────────────────────

/// Compatible feature flags (`s_feature_compat`).
///
/// Advisory; unknown bits are safe to ignore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2CompatFeatures(pub u32);

impl Ext2CompatFeatures {
    pub const DIR_PREALLOC: Self = Self(0x0001);
    pub const IMAGIC_INODES: Self = Self(0x0002);
    pub const HAS_JOURNAL: Self = Self(0x0004);
    pub const EXT_ATTR: Self = Self(0x0008);
    pub const RESIZE_INODE: Self = Self(0x0010);
    pub const DIR_INDEX: Self = Self(0x0020);

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "DIR_PREALLOC"),
        (0x0002, "IMAGIC_INODES"),
        (0x0004, "HAS_JOURNAL"),
        (0x0008, "EXT_ATTR"),
        (0x0010, "RESIZE_INODE"),
        (0x0020, "DIR_INDEX"),
    ];

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }
}

impl std::fmt::Display for Ext2CompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

/// Incompatible feature flags (`s_feature_incompat`).
///
/// Any bit other than `FILETYPE` fails mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2IncompatFeatures(pub u32);

impl Ext2IncompatFeatures {
    pub const COMPRESSION: Self = Self(0x0001);
    pub const FILETYPE: Self = Self(0x0002);
    pub const RECOVER: Self = Self(0x0004);
    pub const JOURNAL_DEV: Self = Self(0x0008);
    pub const META_BG: Self = Self(0x0010);
    pub const EXTENTS: Self = Self(0x0040);
    pub const BIT64: Self = Self(0x0080);
    pub const MMP: Self = Self(0x0100);
    pub const FLEX_BG: Self = Self(0x0200);
    pub const INLINE_DATA: Self = Self(0x8000);

    /// Bits this engine can mount.
    pub const SUPPORTED: Self = Self(Self::FILETYPE.0);

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "COMPRESSION"),
        (0x0002, "FILETYPE"),
        (0x0004, "RECOVER"),
        (0x0008, "JOURNAL_DEV"),
        (0x0010, "META_BG"),
        (0x0040, "EXTENTS"),
        (0x0080, "64BIT"),
        (0x0100, "MMP"),
        (0x0200, "FLEX_BG"),
        (0x8000, "INLINE_DATA"),
    ];

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }

    /// Bits that prevent mounting.
    #[must_use]
    pub fn unsupported(self) -> Self {
        Self(self.0 & !Self::SUPPORTED.0)
    }
}

impl std::fmt::Display for Ext2IncompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

/// Read-only compatible feature flags (`s_feature_ro_compat`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2RoCompatFeatures(pub u32);

impl Ext2RoCompatFeatures {
    pub const SPARSE_SUPER: Self = Self(0x0001);
    pub const LARGE_FILE: Self = Self(0x0002);
    pub const BTREE_DIR: Self = Self(0x0004);
    pub const HUGE_FILE: Self = Self(0x0008);
    pub const GDT_CSUM: Self = Self(0x0010);
    pub const DIR_NLINK: Self = Self(0x0020);
    pub const EXTRA_ISIZE: Self = Self(0x0040);
    pub const METADATA_CSUM: Self = Self(0x0400);

    /// Bits this engine can mount read-write.
    pub const SUPPORTED: Self = Self(Self::SPARSE_SUPER.0 | Self::LARGE_FILE.0);

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "SPARSE_SUPER"),
        (0x0002, "LARGE_FILE"),
        (0x0004, "BTREE_DIR"),
        (0x0008, "HUGE_FILE"),
        (0x0010, "GDT_CSUM"),
        (0x0020, "DIR_NLINK"),
        (0x0040, "EXTRA_ISIZE"),
        (0x0400, "METADATA_CSUM"),
    ];

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }

    #[must_use]
    pub fn unsupported(self) -> Self {
        Self(self.0 & !Self::SUPPORTED.0)
    }
}

impl std::fmt::Display for Ext2RoCompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

fn describe_flags(bits: u32, known: &[(u32, &'static str)]) -> Vec<&'static str> {
    known
        .iter()
        .filter(|(bit, _)| bits & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

/// Format a bitmask as `FILETYPE|SPARSE_SUPER`, `(none)` when zero, unknown
/// bits appended as hex.
fn format_flags(
    f: &mut std::fmt::Formatter<'_>,
    bits: u32,
    known: &[(u32, &'static str)],
) -> std::fmt::Result {
    if bits == 0 {
        return f.write_str("(none)");
    }
    let mut first = true;
    let mut remaining = bits;
    for &(bit, name) in known {
        if remaining & bit != 0 {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            remaining &= !bit;
            first = false;
        }
    }
    if remaining != 0 {
        if !first {
            f.write_str("|")?;
        }
        write!(f, "0x{remaining:X}")?;
    }
    Ok(())
}

// ── Superblock ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Superblock {
    // ── Core geometry ────────────────────────────────────────────────────
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub reserved_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub block_size: u32,
    pub log_frag_size: u32,
    pub blocks_per_group: u32,
    pub frags_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub first_ino: u32,
    pub block_group_nr: u16,

    // ── Identity ─────────────────────────────────────────────────────────
    pub magic: u16,
    pub uuid: [u8; 16],
    pub volume_name: String,
    pub last_mounted: String,

    // ── Revision & OS ────────────────────────────────────────────────────
    pub rev_level: u32,
    pub minor_rev_level: u16,
    pub creator_os: u32,
    pub def_resuid: u16,
    pub def_resgid: u16,

    // ── Features ─────────────────────────────────────────────────────────
    pub feature_compat: Ext2CompatFeatures,
    pub feature_incompat: Ext2IncompatFeatures,
    pub feature_ro_compat: Ext2RoCompatFeatures,

    // ── State & mount tracking ───────────────────────────────────────────
    pub state: u16,
    pub errors: u16,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub checkinterval: u32,

    // ── Timestamps ───────────────────────────────────────────────────────
    pub mtime: u32,
    pub wtime: u32,
    pub lastcheck: u32,
    pub mkfs_time: u32,

    // ── Htree directory hashing ──────────────────────────────────────────
    pub hash_seed: [u32; 4],
    pub def_hash_version: u8,
}

impl Ext2Superblock {
    /// Parse an ext2 superblock from a 1024-byte superblock region.
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < EXT2_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT2_SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 0x38)?;
        if magic != EXT2_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT2_SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let log_block_size = read_le_u32(region, 0x18)?;
        let Some(block_size) = ext2_block_size_from_log(log_block_size) else {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "invalid shift",
            });
        };
        if !matches!(block_size, 1024 | 2048 | 4096) {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "unsupported block size",
            });
        }

        // Revision 0 volumes leave these fields zero.
        let rev_level = read_le_u32(region, 0x4C)?;
        let (first_ino, inode_size) = if rev_level == 0 {
            (EXT2_GOOD_OLD_FIRST_INO, EXT2_GOOD_OLD_INODE_SIZE)
        } else {
            (read_le_u32(region, 0x54)?, read_le_u16(region, 0x58)?)
        };

        Ok(Self {
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: read_le_u32(region, 0x04)?,
            reserved_blocks_count: read_le_u32(region, 0x08)?,
            free_blocks_count: read_le_u32(region, 0x0C)?,
            free_inodes_count: read_le_u32(region, 0x10)?,
            first_data_block: read_le_u32(region, 0x14)?,
            log_block_size,
            block_size,
            log_frag_size: read_le_u32(region, 0x1C)?,
            blocks_per_group: read_le_u32(region, 0x20)?,
            frags_per_group: read_le_u32(region, 0x24)?,
            inodes_per_group: read_le_u32(region, 0x28)?,
            inode_size,
            first_ino,
            block_group_nr: read_le_u16(region, 0x5A)?,

            magic,
            uuid: read_fixed::<16>(region, 0x68)?,
            volume_name: trim_nul_padded(&read_fixed::<16>(region, 0x78)?),
            last_mounted: trim_nul_padded(&read_fixed::<64>(region, 0x88)?),

            rev_level,
            minor_rev_level: read_le_u16(region, 0x3E)?,
            creator_os: read_le_u32(region, 0x48)?,
            def_resuid: read_le_u16(region, 0x50)?,
            def_resgid: read_le_u16(region, 0x52)?,

            feature_compat: Ext2CompatFeatures(read_le_u32(region, 0x5C)?),
            feature_incompat: Ext2IncompatFeatures(read_le_u32(region, 0x60)?),
            feature_ro_compat: Ext2RoCompatFeatures(read_le_u32(region, 0x64)?),

            state: read_le_u16(region, 0x3A)?,
            errors: read_le_u16(region, 0x3C)?,
            mnt_count: read_le_u16(region, 0x34)?,
            max_mnt_count: read_le_u16(region, 0x36)?,
            checkinterval: read_le_u32(region, 0x44)?,

            mtime: read_le_u32(region, 0x2C)?,
            wtime: read_le_u32(region, 0x30)?,
            lastcheck: read_le_u32(region, 0x40)?,
            mkfs_time: read_le_u32(region, 0x108)?,

            hash_seed: [
                read_le_u32(region, 0xEC)?,
                read_le_u32(region, 0xF0)?,
                read_le_u32(region, 0xF4)?,
                read_le_u32(region, 0xF8)?,
            ],
            def_hash_version: read_u8(region, 0xFC)?,
        })
    }

    /// Write every parsed field back into a 1024-byte superblock region.
    ///
    /// Bytes this structure does not model are left untouched.
    pub fn write_into(&self, region: &mut [u8]) -> Result<(), ParseError> {
        if region.len() < EXT2_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT2_SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        write_le_u32(region, 0x00, self.inodes_count)?;
        write_le_u32(region, 0x04, self.blocks_count)?;
        write_le_u32(region, 0x08, self.reserved_blocks_count)?;
        write_le_u32(region, 0x0C, self.free_blocks_count)?;
        write_le_u32(region, 0x10, self.free_inodes_count)?;
        write_le_u32(region, 0x14, self.first_data_block)?;
        write_le_u32(region, 0x18, self.log_block_size)?;
        write_le_u32(region, 0x1C, self.log_frag_size)?;
        write_le_u32(region, 0x20, self.blocks_per_group)?;
        write_le_u32(region, 0x24, self.frags_per_group)?;
        write_le_u32(region, 0x28, self.inodes_per_group)?;
        write_le_u32(region, 0x2C, self.mtime)?;
        write_le_u32(region, 0x30, self.wtime)?;
        write_le_u16(region, 0x34, self.mnt_count)?;
        write_le_u16(region, 0x36, self.max_mnt_count)?;
        write_le_u16(region, 0x38, self.magic)?;
        write_le_u16(region, 0x3A, self.state)?;
        write_le_u16(region, 0x3C, self.errors)?;
        write_le_u16(region, 0x3E, self.minor_rev_level)?;
        write_le_u32(region, 0x40, self.lastcheck)?;
        write_le_u32(region, 0x44, self.checkinterval)?;
        write_le_u32(region, 0x48, self.creator_os)?;
        write_le_u32(region, 0x4C, self.rev_level)?;
        write_le_u16(region, 0x50, self.def_resuid)?;
        write_le_u16(region, 0x52, self.def_resgid)?;
        if self.rev_level > 0 {
            write_le_u32(region, 0x54, self.first_ino)?;
            write_le_u16(region, 0x58, self.inode_size)?;
            write_le_u16(region, 0x5A, self.block_group_nr)?;
            write_le_u32(region, 0x5C, self.feature_compat.0)?;
            write_le_u32(region, 0x60, self.feature_incompat.0)?;
            write_le_u32(region, 0x64, self.feature_ro_compat.0)?;
            write_fixed(region, 0x68, &self.uuid)?;
            write_fixed(region, 0x78, &nul_padded::<16>(&self.volume_name))?;
            write_fixed(region, 0x88, &nul_padded::<64>(&self.last_mounted))?;
        }
        for (i, word) in self.hash_seed.iter().enumerate() {
            write_le_u32(region, 0xEC + i * 4, *word)?;
        }
        write_u8(region, 0xFC, self.def_hash_version)?;
        write_le_u32(region, 0x108, self.mkfs_time)?;
        Ok(())
    }

    #[must_use]
    pub fn has_compat(&self, mask: Ext2CompatFeatures) -> bool {
        self.feature_compat.contains(mask)
    }

    #[must_use]
    pub fn has_incompat(&self, mask: Ext2IncompatFeatures) -> bool {
        self.feature_incompat.contains(mask)
    }

    #[must_use]
    pub fn has_ro_compat(&self, mask: Ext2RoCompatFeatures) -> bool {
        self.feature_ro_compat.contains(mask)
    }

    /// Directory entries carry a file-type byte.
    #[must_use]
    pub fn has_filetype(&self) -> bool {
        self.has_incompat(Ext2IncompatFeatures::FILETYPE)
    }

    /// Number of block groups in this filesystem.
    #[must_use]
    pub fn groups_count(&self) -> u32 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        self.blocks_count
            .saturating_sub(self.first_data_block)
            .div_ceil(self.blocks_per_group)
    }

    /// Number of filesystem blocks occupied by the group descriptor table.
    #[must_use]
    pub fn gdt_blocks(&self) -> u32 {
        let bytes = u64::from(self.groups_count()) * EXT2_GROUP_DESC_SIZE as u64;
        u32::try_from(bytes.div_ceil(u64::from(self.block_size))).unwrap_or(u32::MAX)
    }

    /// First block of the primary group descriptor table.
    #[must_use]
    pub fn gdt_block(&self) -> u64 {
        u64::from(self.first_data_block) + 1
    }

    /// Whether `group` holds a superblock and descriptor table copy.
    #[must_use]
    pub fn group_has_super(&self, group: GroupNumber) -> bool {
        if self.has_ro_compat(Ext2RoCompatFeatures::SPARSE_SUPER) {
            is_sparse_super_group(group)
        } else {
            true
        }
    }

    /// Validate geometry: group sizes, inode size, first data block and GDT bounds.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        if self.blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "cannot be zero",
            });
        }
        let bitmap_bits = self.block_size.saturating_mul(8);
        if self.blocks_per_group > bitmap_bits {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "exceeds block_size * 8 (block bitmap capacity)",
            });
        }
        if self.inodes_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "cannot be zero",
            });
        }
        if self.inodes_per_group > bitmap_bits {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "exceeds block_size * 8 (inode bitmap capacity)",
            });
        }

        if self.inode_size < EXT2_GOOD_OLD_INODE_SIZE {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be >= 128",
            });
        }
        if !self.inode_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be a power of two",
            });
        }
        if u32::from(self.inode_size) > self.block_size {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "inode_size exceeds block_size",
            });
        }

        if self.first_data_block >= self.blocks_count {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "first_data_block >= blocks_count",
            });
        }
        if self.block_size == 1024 && self.first_data_block != 1 {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "must be 1 for 1K block size",
            });
        }
        if self.block_size > 1024 && self.first_data_block != 0 {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "must be 0 for block sizes > 1K",
            });
        }

        let groups = self.groups_count();
        if groups == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_count",
                reason: "zero block groups (blocks_count too small)",
            });
        }
        if self.gdt_block() + u64::from(self.gdt_blocks()) > u64::from(self.blocks_count) {
            return Err(ParseError::InvalidField {
                field: "s_blocks_count",
                reason: "group descriptor table extends beyond device",
            });
        }
        if u64::from(self.inodes_count) > u64::from(groups) * u64::from(self.inodes_per_group) {
            return Err(ParseError::InvalidField {
                field: "s_inodes_count",
                reason: "inodes_count exceeds groups * inodes_per_group",
            });
        }
        if self.first_ino < 3 || self.first_ino > self.inodes_count {
            return Err(ParseError::InvalidField {
                field: "s_first_ino",
                reason: "first non-reserved inode out of range",
            });
        }
        Ok(())
    }

    /// Reject incompatible and read-only compatible bits this engine cannot
    /// write safely.
    pub fn validate_features(&self) -> Result<(), ParseError> {
        if self.feature_incompat.unsupported().0 != 0 {
            return Err(ParseError::InvalidField {
                field: "feature_incompat",
                reason: "unsupported incompatible features present",
            });
        }
        if self.feature_ro_compat.unsupported().0 != 0 {
            return Err(ParseError::InvalidField {
                field: "feature_ro_compat",
                reason: "unsupported read-only compatible features present",
            });
        }
        Ok(())
    }

    /// Mount-time validation: geometry then features.
    pub fn validate(&self) -> Result<(), ParseError> {
        self.validate_geometry()?;
        self.validate_features()
    }

    /// Names of the feature bits that made [`Self::validate_features`] fail.
    #[must_use]
    pub fn unsupported_features_display(&self) -> String {
        format!(
            "incompat={}, ro_compat={}",
            self.feature_incompat.unsupported(),
            self.feature_ro_compat.unsupported()
        )
    }

    /// Byte offset of an inode within its group's inode table.
    ///
    /// Returns `(group, byte_offset_in_inode_table)`.
    #[must_use]
    pub fn inode_table_offset(&self, ino: InodeNumber) -> (GroupNumber, u64) {
        let group = dnx_types::inode_to_group(ino, self.inodes_per_group);
        let index = dnx_types::inode_index_in_group(ino, self.inodes_per_group);
        (group, u64::from(index) * u64::from(self.inode_size))
    }
}

// ── Group descriptor ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
    pub flags: u16,
}

impl Ext2GroupDesc {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < EXT2_GROUP_DESC_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT2_GROUP_DESC_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            block_bitmap: read_le_u32(bytes, 0x00)?,
            inode_bitmap: read_le_u32(bytes, 0x04)?,
            inode_table: read_le_u32(bytes, 0x08)?,
            free_blocks_count: read_le_u16(bytes, 0x0C)?,
            free_inodes_count: read_le_u16(bytes, 0x0E)?,
            used_dirs_count: read_le_u16(bytes, 0x10)?,
            flags: read_le_u16(bytes, 0x12)?,
        })
    }

    /// Write the descriptor into a 32-byte slot. Reserved tail bytes are kept.
    pub fn write_into(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        write_le_u32(bytes, 0x00, self.block_bitmap)?;
        write_le_u32(bytes, 0x04, self.inode_bitmap)?;
        write_le_u32(bytes, 0x08, self.inode_table)?;
        write_le_u16(bytes, 0x0C, self.free_blocks_count)?;
        write_le_u16(bytes, 0x0E, self.free_inodes_count)?;
        write_le_u16(bytes, 0x10, self.used_dirs_count)?;
        write_le_u16(bytes, 0x12, self.flags)?;
        Ok(())
    }
}

// ── Inode ───────────────────────────────────────────────────────────────────

/// The 128-byte base ext2 inode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Inode {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub links_count: u16,
    /// Allocated space in 512-byte sectors.
    pub blocks: u32,
    pub flags: u32,
    pub generation: u32,
    pub file_acl: u32,

    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,

    /// Direct, single, double and triple indirect block pointers.
    pub block: [u32; EXT2_N_BLOCKS],
}

impl Ext2Inode {
    /// Parse an ext2 inode from at least 128 bytes.
    ///
    /// The upper 32 bits of the size are only meaningful for regular files
    /// (`i_dir_acl` for directories).
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < 128 {
            return Err(ParseError::InsufficientData {
                needed: 128,
                offset: 0,
                actual: bytes.len(),
            });
        }

        let mode = read_le_u16(bytes, 0x00)?;
        let uid_lo = u32::from(read_le_u16(bytes, 0x02)?);
        let gid_lo = u32::from(read_le_u16(bytes, 0x18)?);
        let uid_hi = u32::from(read_le_u16(bytes, 0x78)?);
        let gid_hi = u32::from(read_le_u16(bytes, 0x7A)?);

        let size_lo = u64::from(read_le_u32(bytes, 0x04)?);
        let size_hi = if mode & S_IFMT == S_IFREG {
            u64::from(read_le_u32(bytes, 0x6C)?)
        } else {
            0
        };

        let mut block = [0_u32; EXT2_N_BLOCKS];
        for (i, slot) in block.iter_mut().enumerate() {
            *slot = read_le_u32(bytes, 0x28 + i * 4)?;
        }

        Ok(Self {
            mode,
            uid: uid_lo | (uid_hi << 16),
            gid: gid_lo | (gid_hi << 16),
            size: size_lo | (size_hi << 32),
            links_count: read_le_u16(bytes, 0x1A)?,
            blocks: read_le_u32(bytes, 0x1C)?,
            flags: read_le_u32(bytes, 0x20)?,
            generation: read_le_u32(bytes, 0x64)?,
            file_acl: read_le_u32(bytes, 0x68)?,
            atime: read_le_u32(bytes, 0x08)?,
            ctime: read_le_u32(bytes, 0x0C)?,
            mtime: read_le_u32(bytes, 0x10)?,
            dtime: read_le_u32(bytes, 0x14)?,
            block,
        })
    }

    /// Serialize into the first 128 bytes of an inode slot.
    ///
    /// Bytes past 128 (large inodes) and OS-dependent fields this
    /// structure does not model are preserved.
    #[allow(clippy::cast_possible_truncation)] // split into on-disk lo/hi halves
    pub fn write_into(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        if bytes.len() < 128 {
            return Err(ParseError::InsufficientData {
                needed: 128,
                offset: 0,
                actual: bytes.len(),
            });
        }
        write_le_u16(bytes, 0x00, self.mode)?;
        write_le_u16(bytes, 0x02, self.uid as u16)?;
        write_le_u32(bytes, 0x04, self.size as u32)?;
        write_le_u32(bytes, 0x08, self.atime)?;
        write_le_u32(bytes, 0x0C, self.ctime)?;
        write_le_u32(bytes, 0x10, self.mtime)?;
        write_le_u32(bytes, 0x14, self.dtime)?;
        write_le_u16(bytes, 0x18, self.gid as u16)?;
        write_le_u16(bytes, 0x1A, self.links_count)?;
        write_le_u32(bytes, 0x1C, self.blocks)?;
        write_le_u32(bytes, 0x20, self.flags)?;
        for (i, ptr) in self.block.iter().enumerate() {
            write_le_u32(bytes, 0x28 + i * 4, *ptr)?;
        }
        write_le_u32(bytes, 0x64, self.generation)?;
        write_le_u32(bytes, 0x68, self.file_acl)?;
        if self.is_regular() {
            write_le_u32(bytes, 0x6C, (self.size >> 32) as u32)?;
        }
        write_le_u16(bytes, 0x78, (self.uid >> 16) as u16)?;
        write_le_u16(bytes, 0x7A, (self.gid >> 16) as u16)?;
        Ok(())
    }

    /// Whether this directory has the htree index flag.
    #[must_use]
    pub fn has_htree_index(&self) -> bool {
        (self.flags & EXT2_INDEX_FL) != 0
    }

    #[must_use]
    pub fn file_type_mode(&self) -> u16 {
        self.mode & S_IFMT
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.file_type_mode() == S_IFREG
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.file_type_mode() == S_IFDIR
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.file_type_mode() == S_IFLNK
    }

    /// Permission bits including setuid/setgid/sticky (`mode & 0o7777`).
    #[must_use]
    pub fn permission_bits(&self) -> u16 {
        self.mode & 0o7777
    }

    #[must_use]
    pub fn file_type(&self) -> Ext2FileType {
        Ext2FileType::from_mode(self.mode)
    }
}

// ── Directory entries ───────────────────────────────────────────────────────

/// File type codes stored in directory entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Ext2FileType {
    Unknown = 0,
    RegFile = 1,
    Dir = 2,
    Chrdev = 3,
    Blkdev = 4,
    Fifo = 5,
    Sock = 6,
    Symlink = 7,
}

impl Ext2FileType {
    #[must_use]
    pub fn from_raw(val: u8) -> Self {
        match val {
            1 => Self::RegFile,
            2 => Self::Dir,
            3 => Self::Chrdev,
            4 => Self::Blkdev,
            5 => Self::Fifo,
            6 => Self::Sock,
            7 => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::RegFile,
            S_IFDIR => Self::Dir,
            S_IFCHR => Self::Chrdev,
            S_IFBLK => Self::Blkdev,
            S_IFIFO => Self::Fifo,
            S_IFSOCK => Self::Sock,
            S_IFLNK => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u8 {
        self as u8
    }

    /// `S_IFMT` bits for this type (0 for `Unknown`).
    #[must_use]
    pub fn mode_bits(self) -> u16 {
        match self {
            Self::Unknown => 0,
            Self::RegFile => S_IFREG,
            Self::Dir => S_IFDIR,
            Self::Chrdev => S_IFCHR,
            Self::Blkdev => S_IFBLK,
            Self::Fifo => S_IFIFO,
            Self::Sock => S_IFSOCK,
            Self::Symlink => S_IFLNK,
        }
    }
}

/// Fixed 8-byte header of a directory entry.
///
/// With `FILETYPE` the name length is one byte followed by the type byte;
/// without it the name length is a 16-bit field and there is no type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntryHeader {
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u16,
    pub file_type: u8,
}

impl DirEntryHeader {
    pub fn parse(block: &[u8], offset: usize, filetype: bool) -> Result<Self, ParseError> {
        let inode = read_le_u32(block, offset)?;
        let rec_len = read_le_u16(block, offset + 4)?;
        let (name_len, file_type) = if filetype {
            (
                u16::from(read_u8(block, offset + 6)?),
                read_u8(block, offset + 7)?,
            )
        } else {
            (read_le_u16(block, offset + 6)?, 0)
        };
        Ok(Self {
            inode,
            rec_len,
            name_len,
            file_type,
        })
    }

    #[allow(clippy::cast_possible_truncation)] // name_len <= 255 with FILETYPE
    pub fn write(&self, block: &mut [u8], offset: usize, filetype: bool) -> Result<(), ParseError> {
        write_le_u32(block, offset, self.inode)?;
        write_le_u16(block, offset + 4, self.rec_len)?;
        if filetype {
            write_u8(block, offset + 6, self.name_len as u8)?;
            write_u8(block, offset + 7, self.file_type)?;
        } else {
            write_le_u16(block, offset + 6, self.name_len)?;
        }
        Ok(())
    }
}

/// A parsed live directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2DirEntry {
    pub inode: u32,
    pub rec_len: u16,
    pub file_type: Ext2FileType,
    pub name: Vec<u8>,
}

impl Ext2DirEntry {
    /// On-disk size needed by this entry (padded to 4 bytes).
    #[must_use]
    pub fn actual_size(&self) -> usize {
        (EXT2_DIR_ENTRY_HEADER_LEN + self.name.len() + 3) & !3
    }

    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    #[must_use]
    pub fn is_dotdot(&self) -> bool {
        self.name == b".."
    }

    /// `.` or `..`.
    #[must_use]
    pub fn is_dots(&self) -> bool {
        self.is_dot() || self.is_dotdot()
    }
}

/// Parse all live entries from a single directory data block.
///
/// Deleted slots (`inode == 0`) are skipped.
pub fn parse_dir_block(block: &[u8], filetype: bool) -> Result<Vec<Ext2DirEntry>, ParseError> {
    let mut entries = Vec::new();
    let mut offset = 0_usize;

    while offset + EXT2_DIR_ENTRY_HEADER_LEN <= block.len() {
        let header = DirEntryHeader::parse(block, offset, filetype)?;
        let rec_len = usize::from(header.rec_len);

        if rec_len < EXT2_DIR_ENTRY_HEADER_LEN || rec_len % 4 != 0 {
            return Err(ParseError::InvalidField {
                field: "de_rec_len",
                reason: "rec_len < 8 or not 4-byte aligned",
            });
        }
        let entry_end = offset + rec_len;
        if entry_end > block.len() {
            return Err(ParseError::InvalidField {
                field: "de_rec_len",
                reason: "directory entry extends past block boundary",
            });
        }

        if header.inode != 0 {
            let name_end = offset + EXT2_DIR_ENTRY_HEADER_LEN + usize::from(header.name_len);
            if name_end > entry_end {
                return Err(ParseError::InvalidField {
                    field: "de_name_len",
                    reason: "name extends past rec_len",
                });
            }
            entries.push(Ext2DirEntry {
                inode: header.inode,
                rec_len: header.rec_len,
                file_type: Ext2FileType::from_raw(header.file_type),
                name: block[offset + EXT2_DIR_ENTRY_HEADER_LEN..name_end].to_vec(),
            });
        }

        offset = entry_end;
    }

    Ok(entries)
}
