#![forbid(unsafe_code)]
//! Volume creation (mkfs).
//!
//! Writes a revision 1 ext2 layout with `FILETYPE` and `SPARSE_SUPER`:
//! each group holds `[superblock + descriptor table]` (sparse groups only),
//! the block bitmap, the inode bitmap and the inode table, in that order.
//! The root directory takes the first data block of group 0.

use dnx_alloc::bitmap_set;
use dnx_block::{BlockDev, BlockDevice, BlockIo};
use dnx_error::{DnxError, Result};
use dnx_ondisk::{
    EXT2_GROUP_DESC_SIZE, Ext2CompatFeatures, Ext2GroupDesc, Ext2IncompatFeatures, Ext2Inode,
    Ext2RoCompatFeatures, Ext2Superblock,
};
use dnx_types::{
    BlockNumber, EXT2_GOOD_OLD_FIRST_INO, EXT2_GOOD_OLD_INODE_SIZE, EXT2_SUPER_MAGIC,
    EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE, GroupNumber, InodeNumber, S_IFDIR,
    is_sparse_super_group,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

/// Bytes of volume per inode when `inodes_per_group` is derived.
const BYTES_PER_INODE: u64 = 4096;
/// Blocks zeroed per write while clearing inode tables.
const ZERO_CHUNK_BLOCKS: u64 = 64;
/// `s_def_hash_version` for half MD4.
const HASH_HALF_MD4: u8 = 1;

/// Parameters for [`format`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOptions {
    /// Filesystem block size: 1024, 2048 or 4096.
    pub block_size: u32,
    /// On-disk inode size, a power of two of at least 128.
    pub inode_size: u16,
    /// Inodes per group; derived from the volume size when zero.
    pub inodes_per_group: u32,
    /// Volume label, at most 16 bytes.
    pub volume_name: String,
    /// Advertise `DIR_INDEX` so new directories may be indexed.
    pub dir_index: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 1024,
            inode_size: EXT2_GOOD_OLD_INODE_SIZE,
            inodes_per_group: 0,
            volume_name: String::new(),
            dir_index: false,
        }
    }
}

/// Placement of one group's metadata.
#[derive(Debug, Clone, Copy)]
struct GroupLayout {
    start: u64,
    len: u64,
    has_super: bool,
    block_bitmap: u64,
    inode_bitmap: u64,
    inode_table: u64,
    /// First block after the inode table.
    data_start: u64,
}

#[derive(Debug, Clone, Copy)]
struct Geometry {
    block_size: u32,
    blocks: u64,
    first_data_block: u64,
    blocks_per_group: u64,
    groups: u32,
    inodes_per_group: u32,
    inode_size: u16,
    gdt_blocks: u64,
    table_blocks: u64,
}

impl Geometry {
    fn layout(&self, group: u32) -> GroupLayout {
        let start = self.first_data_block + u64::from(group) * self.blocks_per_group;
        let len = self.blocks_per_group.min(self.blocks - start);
        let has_super = is_sparse_super_group(GroupNumber(group));
        let block_bitmap = start + if has_super { 1 + self.gdt_blocks } else { 0 };
        GroupLayout {
            start,
            len,
            has_super,
            block_bitmap,
            inode_bitmap: block_bitmap + 1,
            inode_table: block_bitmap + 2,
            data_start: block_bitmap + 2 + self.table_blocks,
        }
    }

    fn group_overhead(&self, group: u32) -> u64 {
        let l = self.layout(group);
        l.data_start - l.start
    }
}

fn check_options(opts: &FormatOptions) -> Result<()> {
    if !matches!(opts.block_size, 1024 | 2048 | 4096) {
        return Err(DnxError::InvalidArgument(format!(
            "block size {} must be 1024, 2048 or 4096",
            opts.block_size
        )));
    }
    if opts.inode_size < EXT2_GOOD_OLD_INODE_SIZE
        || !opts.inode_size.is_power_of_two()
        || u32::from(opts.inode_size) > opts.block_size
    {
        return Err(DnxError::InvalidArgument(format!(
            "inode size {} must be a power of two between 128 and the block size",
            opts.inode_size
        )));
    }
    if opts.volume_name.len() > 16 {
        return Err(DnxError::InvalidArgument(
            "volume name longer than 16 bytes".to_owned(),
        ));
    }
    if opts.inodes_per_group > opts.block_size * 8 {
        return Err(DnxError::InvalidArgument(format!(
            "inodes per group {} exceeds bitmap capacity {}",
            opts.inodes_per_group,
            opts.block_size * 8
        )));
    }
    Ok(())
}

fn derive_geometry(opts: &FormatOptions, device_bytes: u64) -> Result<Geometry> {
    let bs = u64::from(opts.block_size);
    let blocks = (device_bytes / bs).min(u64::from(u32::MAX));
    let first_data_block = u64::from(opts.block_size == 1024);
    let blocks_per_group = bs * 8;
    if blocks <= first_data_block {
        return Err(DnxError::InvalidGeometry(format!(
            "device of {device_bytes} bytes holds no data blocks"
        )));
    }

    let groups = (blocks - first_data_block).div_ceil(blocks_per_group);
    let per_block = u32::try_from(bs / u64::from(opts.inode_size))
        .map_err(|_| DnxError::InvalidArgument("inode size".to_owned()))?;
    let inodes_per_group = if opts.inodes_per_group == 0 {
        let wanted = (device_bytes / BYTES_PER_INODE).div_ceil(groups).max(16);
        let align = u64::from(per_block.max(8));
        let rounded = wanted.div_ceil(align) * align;
        u32::try_from(rounded.min(bs * 8))
            .map_err(|_| DnxError::InvalidGeometry("inodes per group".to_owned()))?
    } else {
        opts.inodes_per_group
    };
    let table_blocks = (u64::from(inodes_per_group) * u64::from(opts.inode_size)).div_ceil(bs);

    let mut geo = Geometry {
        block_size: opts.block_size,
        blocks,
        first_data_block,
        blocks_per_group,
        groups: u32::try_from(groups)
            .map_err(|_| DnxError::InvalidGeometry("group count".to_owned()))?,
        inodes_per_group,
        inode_size: opts.inode_size,
        gdt_blocks: (groups * EXT2_GROUP_DESC_SIZE as u64).div_ceil(bs),
        table_blocks,
    };

    // A trailing group too short for its own metadata is cut off.
    let last = geo.groups - 1;
    let tail = geo.layout(last).len;
    if tail <= geo.group_overhead(last) + u64::from(last == 0) {
        if last == 0 {
            return Err(DnxError::InvalidGeometry(format!(
                "device of {device_bytes} bytes is too small for one block group"
            )));
        }
        geo.blocks -= tail;
        geo.groups -= 1;
        geo.gdt_blocks = (u64::from(geo.groups) * EXT2_GROUP_DESC_SIZE as u64).div_ceil(bs);
    }
    Ok(geo)
}

/// Volume identity derived from the clock and the device size.
fn identity(seed: u64) -> ([u8; 16], [u32; 4]) {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX));
    let mut state = nanos ^ seed.rotate_left(32);
    let mut next = || {
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    };
    let mut uuid = [0_u8; 16];
    uuid[..8].copy_from_slice(&next().to_le_bytes());
    uuid[8..].copy_from_slice(&next().to_le_bytes());
    // RFC 4122 version 4, variant 1.
    uuid[6] = (uuid[6] & 0x0F) | 0x40;
    uuid[8] = (uuid[8] & 0x3F) | 0x80;
    let (a, b) = (next(), next());
    #[expect(clippy::cast_possible_truncation)]
    let hash_seed = [a as u32, (a >> 32) as u32, b as u32, (b >> 32) as u32];
    (uuid, hash_seed)
}

fn group_bit(rel: u64) -> Result<u32> {
    u32::try_from(rel).map_err(|_| DnxError::InvalidGeometry(format!("group offset {rel}")))
}

fn block_u32(block: u64) -> Result<u32> {
    u32::try_from(block).map_err(|_| DnxError::InvalidGeometry(format!("block {block} exceeds 32 bits")))
}

fn write_superblock_at(dev: &BlockDev, offset: u64, sb: &Ext2Superblock) -> Result<()> {
    let mut region = vec![0_u8; EXT2_SUPERBLOCK_SIZE];
    sb.write_into(&mut region)
        .map_err(|e| DnxError::Format(format!("superblock serialize: {e}")))?;
    dev.write_bytes(offset, &region)
}

/// Write a fresh ext2 volume onto `io`.
///
/// `ph_bsize` and `ph_bcnt` describe the physical device exactly as for
/// mount. Returns the superblock that was written.
pub fn format(
    io: Arc<dyn BlockIo>,
    ph_bsize: u32,
    ph_bcnt: u64,
    opts: &FormatOptions,
) -> Result<Ext2Superblock> {
    check_options(opts)?;
    let mut dev = BlockDev::new(io, ph_bsize, ph_bcnt)?;
    dev.set_lb_size(opts.block_size)?;
    let device_bytes = u64::from(ph_bsize).saturating_mul(ph_bcnt);
    let geo = derive_geometry(opts, device_bytes)?;
    let bs = opts.block_size as usize;
    let stamp = crate::now();
    let first_ino = EXT2_GOOD_OLD_FIRST_INO;

    debug!(
        block_size = geo.block_size,
        blocks = geo.blocks,
        groups = geo.groups,
        inodes_per_group = geo.inodes_per_group,
        "format_start"
    );

    let root_block = geo.layout(0).data_start;
    let mut descs = Vec::with_capacity(geo.groups as usize);
    let zeros = vec![0_u8; bs * ZERO_CHUNK_BLOCKS as usize];
    let mut free_blocks_total = 0_u64;
    let mut free_inodes_total = 0_u64;

    for g in 0..geo.groups {
        let l = geo.layout(g);
        let bitmap_bits = opts.block_size * 8;

        let mut block_bitmap = vec![0_u8; bs];
        let meta = group_bit(l.data_start - l.start)?;
        for bit in 0..meta {
            bitmap_set(&mut block_bitmap, bit);
        }
        let mut used = u64::from(meta);
        if g == 0 {
            bitmap_set(&mut block_bitmap, group_bit(root_block - l.start)?);
            used += 1;
        }
        for bit in group_bit(l.len)?..bitmap_bits {
            bitmap_set(&mut block_bitmap, bit);
        }

        let mut inode_bitmap = vec![0_u8; bs];
        let reserved_inodes = if g == 0 { first_ino - 1 } else { 0 };
        for bit in 0..reserved_inodes {
            bitmap_set(&mut inode_bitmap, bit);
        }
        for bit in geo.inodes_per_group..bitmap_bits {
            bitmap_set(&mut inode_bitmap, bit);
        }

        dev.write_block(BlockNumber(l.block_bitmap), &block_bitmap)?;
        dev.write_block(BlockNumber(l.inode_bitmap), &inode_bitmap)?;
        let mut cleared = 0;
        while cleared < geo.table_blocks {
            let n = (geo.table_blocks - cleared).min(ZERO_CHUNK_BLOCKS);
            #[expect(clippy::cast_possible_truncation)]
            let len = n as usize * bs;
            dev.write_blocks(BlockNumber(l.inode_table + cleared), &zeros[..len])?;
            cleared += n;
        }

        let free_blocks = l.len - used;
        let free_inodes = geo.inodes_per_group - reserved_inodes;
        free_blocks_total += free_blocks;
        free_inodes_total += u64::from(free_inodes);
        descs.push(Ext2GroupDesc {
            block_bitmap: block_u32(l.block_bitmap)?,
            inode_bitmap: block_u32(l.inode_bitmap)?,
            inode_table: block_u32(l.inode_table)?,
            free_blocks_count: u16::try_from(free_blocks)
                .map_err(|_| DnxError::InvalidGeometry("group free blocks".to_owned()))?,
            free_inodes_count: u16::try_from(free_inodes)
                .map_err(|_| DnxError::InvalidGeometry("group free inodes".to_owned()))?,
            used_dirs_count: u16::from(g == 0),
            flags: 0,
        });
        trace!(group = g, start = l.start, free_blocks, free_inodes, "format_group");
    }

    #[expect(clippy::cast_possible_truncation)]
    let mut gdt = vec![0_u8; geo.gdt_blocks as usize * bs];
    for (i, desc) in descs.iter().enumerate() {
        desc.write_into(&mut gdt[i * EXT2_GROUP_DESC_SIZE..])
            .map_err(|e| DnxError::Format(format!("group descriptor serialize: {e}")))?;
    }
    for g in 0..geo.groups {
        let l = geo.layout(g);
        if l.has_super {
            dev.write_blocks(BlockNumber(l.start + 1), &gdt)?;
        }
    }

    // Root directory.
    let root = Ext2Inode {
        mode: S_IFDIR | 0o755,
        links_count: 2,
        size: u64::from(opts.block_size),
        blocks: opts.block_size / 512,
        atime: stamp,
        ctime: stamp,
        mtime: stamp,
        block: {
            let mut b = [0_u32; 15];
            b[0] = block_u32(root_block)?;
            b
        },
        ..Ext2Inode::default()
    };
    let root_slot = u64::from(InodeNumber::ROOT.0 - 1) * u64::from(geo.inode_size);
    let table_block = BlockNumber(geo.layout(0).inode_table + root_slot / u64::from(geo.block_size));
    let mut buf = dev.read_block(table_block)?.into_inner();
    #[expect(clippy::cast_possible_truncation)]
    let at = (root_slot % u64::from(geo.block_size)) as usize;
    root.write_into(&mut buf[at..at + usize::from(geo.inode_size)])
        .map_err(|e| DnxError::Format(format!("root inode serialize: {e}")))?;
    dev.write_block(table_block, &buf)?;

    let mut dir_block = vec![0_u8; bs];
    dnx_dir::init_dir_block(&mut dir_block, InodeNumber::ROOT.0, InodeNumber::ROOT.0, true)?;
    dev.write_block(BlockNumber(root_block), &dir_block)?;

    let (uuid, hash_seed) = identity(ph_bcnt);
    let mut compat = 0;
    if opts.dir_index {
        compat |= Ext2CompatFeatures::DIR_INDEX.0;
    }
    let log_block_size = opts.block_size.trailing_zeros() - 10;
    let mut sb = Ext2Superblock {
        inodes_count: geo.inodes_per_group * geo.groups,
        blocks_count: block_u32(geo.blocks)?,
        reserved_blocks_count: block_u32(geo.blocks / 20)?,
        free_blocks_count: block_u32(free_blocks_total)?,
        free_inodes_count: u32::try_from(free_inodes_total)
            .map_err(|_| DnxError::InvalidGeometry("free inodes".to_owned()))?,
        first_data_block: block_u32(geo.first_data_block)?,
        log_block_size,
        block_size: opts.block_size,
        log_frag_size: log_block_size,
        blocks_per_group: block_u32(geo.blocks_per_group)?,
        frags_per_group: block_u32(geo.blocks_per_group)?,
        inodes_per_group: geo.inodes_per_group,
        inode_size: geo.inode_size,
        first_ino,
        block_group_nr: 0,
        magic: EXT2_SUPER_MAGIC,
        uuid,
        volume_name: opts.volume_name.clone(),
        last_mounted: String::new(),
        rev_level: 1,
        minor_rev_level: 0,
        creator_os: 0,
        def_resuid: 0,
        def_resgid: 0,
        feature_compat: Ext2CompatFeatures(compat),
        feature_incompat: Ext2IncompatFeatures::FILETYPE,
        feature_ro_compat: Ext2RoCompatFeatures::SPARSE_SUPER,
        state: 1,
        errors: 1,
        mnt_count: 0,
        max_mnt_count: 0xFFFF,
        checkinterval: 0,
        mtime: 0,
        wtime: stamp,
        lastcheck: stamp,
        mkfs_time: stamp,
        hash_seed,
        def_hash_version: if opts.dir_index { HASH_HALF_MD4 } else { 0 },
    };

    write_superblock_at(&dev, EXT2_SUPERBLOCK_OFFSET as u64, &sb)?;
    for g in 1..geo.groups {
        let l = geo.layout(g);
        if l.has_super {
            let mut backup = sb.clone();
            backup.block_group_nr = u16::try_from(g)
                .map_err(|_| DnxError::InvalidGeometry("group number".to_owned()))?;
            write_superblock_at(&dev, l.start * u64::from(geo.block_size), &backup)?;
        }
    }
    dev.sync()?;

    sb.block_group_nr = 0;
    debug!(
        blocks = sb.blocks_count,
        inodes = sb.inodes_count,
        free_blocks = sb.free_blocks_count,
        free_inodes = sb.free_inodes_count,
        "format_done"
    );
    Ok(sb)
}
