#![forbid(unsafe_code)]
//! Block and inode allocation for ext2 block groups.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap**: raw bit manipulation on block/inode bitmaps.
//! 2. **GroupStats**: cached per-group free counts mirrored from descriptors.
//! 3. **Block allocation**: goal-directed search across groups.
//! 4. **Inode allocation**: Orlov-style placement for directories.
//!
//! Every bitmap change writes the group descriptor back through the
//! [`BlockDevice`], so the on-disk table never lags behind the bitmaps.
//! Superblock totals are derived from [`GroupStats`] by the caller.

use dnx_block::BlockDevice;
use dnx_error::{DnxError, Result};
use dnx_ondisk::{EXT2_GROUP_DESC_SIZE, Ext2GroupDesc, Ext2RoCompatFeatures, Ext2Superblock};
use dnx_types::{BlockNumber, GroupNumber, InodeNumber, is_sparse_super_group};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut free = 0_u32;

    for &byte in bitmap.iter().take(full_bytes) {
        free += byte.count_zeros();
    }

    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        free += (0..remainder).filter(|bit| (byte >> bit) & 1 == 0).count() as u32;
    }

    free
}

/// Find the first free (zero) bit in the first `count` bits of `bitmap`,
/// starting from `start` and wrapping around to 0.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    let start = start.min(count);
    (start..count)
        .chain(0..start)
        .find(|&idx| !bitmap_get(bitmap, idx))
}

/// Find `n` contiguous free bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_find_contiguous(bitmap: &[u8], count: u32, n: u32) -> Option<u32> {
    if n == 0 {
        return Some(0);
    }
    let mut run_start = 0_u32;
    let mut run_len = 0_u32;

    for idx in 0..count {
        if bitmap_get(bitmap, idx) {
            run_start = idx + 1;
            run_len = 0;
        } else {
            run_len += 1;
            if run_len >= n {
                return Some(run_start);
            }
        }
    }
    None
}

// ── Group stats ─────────────────────────────────────────────────────────────

/// Cached per-group statistics loaded from group descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStats {
    pub group: GroupNumber,
    pub free_blocks: u32,
    pub free_inodes: u32,
    pub used_dirs: u32,
    pub block_bitmap_block: BlockNumber,
    pub inode_bitmap_block: BlockNumber,
    pub inode_table_block: BlockNumber,
}

impl GroupStats {
    /// Create from a parsed group descriptor.
    #[must_use]
    pub fn from_group_desc(group: GroupNumber, gd: &Ext2GroupDesc) -> Self {
        Self {
            group,
            free_blocks: u32::from(gd.free_blocks_count),
            free_inodes: u32::from(gd.free_inodes_count),
            used_dirs: u32::from(gd.used_dirs_count),
            block_bitmap_block: BlockNumber(u64::from(gd.block_bitmap)),
            inode_bitmap_block: BlockNumber(u64::from(gd.inode_bitmap)),
            inode_table_block: BlockNumber(u64::from(gd.inode_table)),
        }
    }
}

// ── Allocation hint / results ───────────────────────────────────────────────

/// Hint for the block allocator to guide placement decisions.
#[derive(Debug, Clone, Default)]
pub struct AllocHint {
    /// Preferred block group (e.g., the owning inode's group).
    pub goal_group: Option<GroupNumber>,
    /// Preferred block number (e.g., right after the previous data block).
    pub goal_block: Option<BlockNumber>,
}

/// Result of a block allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAlloc {
    /// First allocated block.
    pub start: BlockNumber,
    /// Number of contiguous blocks allocated.
    pub count: u32,
}

/// Result of an inode allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeAlloc {
    pub ino: InodeNumber,
    pub group: GroupNumber,
}

// ── Filesystem geometry ─────────────────────────────────────────────────────

/// Cached filesystem geometry needed by the allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsGeometry {
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub block_size: u32,
    pub total_blocks: u64,
    pub total_inodes: u32,
    pub first_data_block: u32,
    pub first_ino: u32,
    pub group_count: u32,
    pub inode_size: u16,
    /// Blocks occupied by one copy of the group descriptor table.
    pub gdt_blocks: u32,
    pub sparse_super: bool,
}

impl FsGeometry {
    /// Derive geometry from a parsed superblock.
    #[must_use]
    pub fn from_superblock(sb: &Ext2Superblock) -> Self {
        Self {
            blocks_per_group: sb.blocks_per_group,
            inodes_per_group: sb.inodes_per_group,
            block_size: sb.block_size,
            total_blocks: u64::from(sb.blocks_count),
            total_inodes: sb.inodes_count,
            first_data_block: sb.first_data_block,
            first_ino: sb.first_ino,
            group_count: sb.groups_count(),
            inode_size: sb.inode_size,
            gdt_blocks: sb.gdt_blocks(),
            sparse_super: sb.has_ro_compat(Ext2RoCompatFeatures::SPARSE_SUPER),
        }
    }

    /// Number of blocks in a specific group (last group may be shorter).
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn blocks_in_group(&self, group: GroupNumber) -> u32 {
        let group_start = u64::from(self.first_data_block)
            + u64::from(group.0) * u64::from(self.blocks_per_group);
        let remaining = self.total_blocks.saturating_sub(group_start);
        if remaining >= u64::from(self.blocks_per_group) {
            self.blocks_per_group
        } else {
            remaining as u32
        }
    }

    /// Number of inodes in a specific group (last group may be shorter).
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn inodes_in_group(&self, group: GroupNumber) -> u32 {
        let inode_start = u64::from(group.0) * u64::from(self.inodes_per_group);
        let remaining = u64::from(self.total_inodes).saturating_sub(inode_start);
        if remaining >= u64::from(self.inodes_per_group) {
            self.inodes_per_group
        } else {
            remaining as u32
        }
    }

    /// Absolute block number for a relative block within a group.
    #[must_use]
    pub fn group_block_to_absolute(&self, group: GroupNumber, rel_block: u32) -> BlockNumber {
        let abs = u64::from(self.first_data_block)
            + u64::from(group.0) * u64::from(self.blocks_per_group)
            + u64::from(rel_block);
        BlockNumber(abs)
    }

    /// Convert absolute block to (group, relative_block).
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn absolute_to_group_block(&self, block: BlockNumber) -> (GroupNumber, u32) {
        let rel = block.0.saturating_sub(u64::from(self.first_data_block));
        let group = (rel / u64::from(self.blocks_per_group)) as u32;
        let offset = (rel % u64::from(self.blocks_per_group)) as u32;
        (GroupNumber(group), offset)
    }

    /// Whether `group` carries a superblock and descriptor table copy.
    #[must_use]
    pub fn group_has_super(&self, group: GroupNumber) -> bool {
        !self.sparse_super || is_sparse_super_group(group)
    }

    /// Blocks occupied by one group's inode table.
    #[must_use]
    pub fn inode_table_blocks(&self) -> u64 {
        if self.block_size == 0 {
            return 0;
        }
        (u64::from(self.inodes_per_group) * u64::from(self.inode_size))
            .div_ceil(u64::from(self.block_size))
    }
}

// ── On-disk persistence context ─────────────────────────────────────────────

/// Where group descriptor updates are written back.
#[derive(Debug, Clone)]
pub struct PersistCtx {
    /// First block of the primary group descriptor table.
    pub gdt_block: BlockNumber,
}

impl PersistCtx {
    #[must_use]
    pub fn from_superblock(sb: &Ext2Superblock) -> Self {
        Self {
            gdt_block: BlockNumber(sb.gdt_block()),
        }
    }
}

/// Relative block offsets within a group that hold metadata and must never
/// be handed out as data blocks: the superblock and descriptor table copies,
/// both bitmaps and the inode table.
///
/// Returns a sorted, deduplicated `Vec`.
#[must_use]
pub fn reserved_blocks_in_group(
    geo: &FsGeometry,
    groups: &[GroupStats],
    group: GroupNumber,
) -> Vec<u32> {
    let gidx = group.0 as usize;
    if gidx >= groups.len() {
        return Vec::new();
    }

    let gs = &groups[gidx];
    let group_start =
        u64::from(geo.first_data_block) + u64::from(group.0) * u64::from(geo.blocks_per_group);
    let blocks_in_group = geo.blocks_in_group(group);
    let mut reserved = Vec::new();

    let mut add_abs = |abs: u64| {
        if abs >= group_start {
            let rel = abs - group_start;
            if rel < u64::from(blocks_in_group) {
                #[expect(clippy::cast_possible_truncation)]
                reserved.push(rel as u32);
            }
        }
    };

    if geo.group_has_super(group) {
        for i in 0..=u64::from(geo.gdt_blocks) {
            add_abs(group_start + i);
        }
    }

    add_abs(gs.block_bitmap_block.0);
    add_abs(gs.inode_bitmap_block.0);
    for i in 0..geo.inode_table_blocks() {
        add_abs(gs.inode_table_block.0 + i);
    }

    reserved.sort_unstable();
    reserved.dedup();
    reserved
}

fn is_reserved(reserved: &[u32], rel_block: u32) -> bool {
    reserved.binary_search(&rel_block).is_ok()
}

fn desc_count(value: u32, field: &str) -> Result<u16> {
    u16::try_from(value)
        .map_err(|_| DnxError::Format(format!("{field} {value} exceeds descriptor range")))
}

/// Write a group's counter fields back into the on-disk descriptor table.
///
/// Reads the table block holding `group`, patches the free and directory
/// counters and writes the block back. Other descriptor fields are kept.
pub fn persist_group_desc(
    dev: &dyn BlockDevice,
    pctx: &PersistCtx,
    group: GroupNumber,
    stats: &GroupStats,
) -> Result<()> {
    let descs_per_block = dev.block_size() as usize / EXT2_GROUP_DESC_SIZE;
    let gdt_block_idx = group.0 as usize / descs_per_block;
    let offset_in_block = (group.0 as usize % descs_per_block) * EXT2_GROUP_DESC_SIZE;

    let block_num = BlockNumber(pctx.gdt_block.0 + gdt_block_idx as u64);
    let mut buf = dev.read_block(block_num)?.into_inner();

    let existing = Ext2GroupDesc::parse_from_bytes(&buf[offset_in_block..]).map_err(|e| {
        DnxError::Corruption {
            block: block_num.0,
            detail: format!("group descriptor {group}: {e}"),
        }
    })?;

    let updated = Ext2GroupDesc {
        free_blocks_count: desc_count(stats.free_blocks, "free_blocks_count")?,
        free_inodes_count: desc_count(stats.free_inodes, "free_inodes_count")?,
        used_dirs_count: desc_count(stats.used_dirs, "used_dirs_count")?,
        ..existing
    };

    updated
        .write_into(&mut buf[offset_in_block..])
        .map_err(|e| DnxError::Format(format!("group descriptor write: {e}")))?;

    dev.write_block(block_num, &buf)?;
    trace!(group = group.0, block = block_num.0, "gdt_persist");
    Ok(())
}

// ── Block allocator ─────────────────────────────────────────────────────────

/// Allocate `count` contiguous data blocks, using `hint` for placement.
///
/// Strategy:
/// 1. Try the goal group/block if specified.
/// 2. Try groups within 8 of the goal, alternating forward and backward.
/// 3. Scan all remaining groups.
///
/// Reserved metadata blocks are never returned. The group descriptor is
/// written back after the bitmap update.
pub fn alloc_blocks(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    groups: &mut [GroupStats],
    count: u32,
    hint: &AllocHint,
    pctx: &PersistCtx,
) -> Result<BlockAlloc> {
    if count == 0 {
        return Err(DnxError::InvalidArgument(
            "cannot allocate 0 blocks".to_owned(),
        ));
    }

    let goal_group = hint
        .goal_group
        .or_else(|| hint.goal_block.map(|b| geo.absolute_to_group_block(b).0))
        .unwrap_or(GroupNumber(0));

    if let Some(alloc) = try_alloc_in_group(dev, geo, groups, goal_group, count, hint, pctx)? {
        return Ok(alloc);
    }

    for delta in 1..=8_u32 {
        for dir in [1_i64, -1_i64] {
            let g = i64::from(goal_group.0) + dir * i64::from(delta);
            #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            if g >= 0 && (g as u32) < geo.group_count {
                let group = GroupNumber(g as u32);
                if let Some(alloc) =
                    try_alloc_in_group(dev, geo, groups, group, count, hint, pctx)?
                {
                    return Ok(alloc);
                }
            }
        }
    }

    for g in 0..geo.group_count {
        let group = GroupNumber(g);
        if group.0.abs_diff(goal_group.0) <= 8 {
            continue;
        }
        if let Some(alloc) = try_alloc_in_group(dev, geo, groups, group, count, hint, pctx)? {
            return Ok(alloc);
        }
    }

    Err(DnxError::NoSpace)
}

fn try_alloc_in_group(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    groups: &mut [GroupStats],
    group: GroupNumber,
    count: u32,
    hint: &AllocHint,
    pctx: &PersistCtx,
) -> Result<Option<BlockAlloc>> {
    let gidx = group.0 as usize;
    if gidx >= groups.len() || groups[gidx].free_blocks < count {
        return Ok(None);
    }

    let blocks_in_group = geo.blocks_in_group(group);
    let reserved = reserved_blocks_in_group(geo, groups, group);

    let bitmap_block = groups[gidx].block_bitmap_block;
    let mut bitmap = dev.read_block(bitmap_block)?.into_inner();

    // Search a scratch copy with reserved bits forced on so a stale bitmap
    // can never yield a metadata block.
    let mut search = bitmap.clone();
    for &r in &reserved {
        bitmap_set(&mut search, r);
    }

    let start = hint.goal_block.map_or(0, |goal| {
        let (g, off) = geo.absolute_to_group_block(goal);
        if g == group { off } else { 0 }
    });

    let found = if count == 1 {
        bitmap_find_free(&search, blocks_in_group, start)
    } else {
        bitmap_find_contiguous(&search, blocks_in_group, count)
    };

    let Some(rel_start) = found else {
        return Ok(None);
    };

    for i in rel_start..rel_start + count {
        if is_reserved(&reserved, i) {
            return Err(DnxError::Corruption {
                block: geo.group_block_to_absolute(group, i).0,
                detail: "alloc would overlap reserved metadata block".to_owned(),
            });
        }
        bitmap_set(&mut bitmap, i);
    }

    dev.write_block(bitmap_block, &bitmap)?;
    groups[gidx].free_blocks -= count;
    persist_group_desc(dev, pctx, group, &groups[gidx])?;

    let start = geo.group_block_to_absolute(group, rel_start);
    debug!(group = group.0, block = start.0, count, "alloc_blocks");
    Ok(Some(BlockAlloc { start, count }))
}

/// Free `count` contiguous blocks starting at `start`.
///
/// Fails with [`DnxError::Corruption`] when a block is reserved metadata or
/// already free (double free); nothing is changed in that case.
pub fn free_blocks(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    groups: &mut [GroupStats],
    start: BlockNumber,
    count: u32,
    pctx: &PersistCtx,
) -> Result<()> {
    let (group, rel_start) = geo.absolute_to_group_block(start);
    let gidx = group.0 as usize;
    if gidx >= groups.len() || start.0 < u64::from(geo.first_data_block) {
        return Err(DnxError::Corruption {
            block: start.0,
            detail: "free_blocks: group out of range".to_owned(),
        });
    }
    if u64::from(rel_start) + u64::from(count) > u64::from(geo.blocks_in_group(group)) {
        return Err(DnxError::Corruption {
            block: start.0,
            detail: "free_blocks: range crosses group end".to_owned(),
        });
    }

    let reserved = reserved_blocks_in_group(geo, groups, group);
    if let Some(i) = (rel_start..rel_start + count).find(|&i| is_reserved(&reserved, i)) {
        return Err(DnxError::Corruption {
            block: geo.group_block_to_absolute(group, i).0,
            detail: "attempt to free reserved metadata block".to_owned(),
        });
    }

    let bitmap_block = groups[gidx].block_bitmap_block;
    let mut bitmap = dev.read_block(bitmap_block)?.into_inner();

    if let Some(i) = (rel_start..rel_start + count).find(|&i| !bitmap_get(&bitmap, i)) {
        return Err(DnxError::Corruption {
            block: geo.group_block_to_absolute(group, i).0,
            detail: "double-free: block already free in bitmap".to_owned(),
        });
    }

    for i in rel_start..rel_start + count {
        bitmap_clear(&mut bitmap, i);
    }

    dev.write_block(bitmap_block, &bitmap)?;
    groups[gidx].free_blocks += count;
    persist_group_desc(dev, pctx, group, &groups[gidx])?;
    debug!(group = group.0, block = start.0, count, "free_blocks");
    Ok(())
}

// ── Inode allocator (Orlov) ─────────────────────────────────────────────────

/// Allocate an inode.
///
/// - Directories: spread across groups (above-average free inodes and free
///   blocks, fewest directories).
/// - Files: co-locate with the parent directory's group.
///
/// Falls back to scanning every group. `used_dirs` is bumped for directories.
pub fn alloc_inode(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    groups: &mut [GroupStats],
    parent_group: GroupNumber,
    is_directory: bool,
    pctx: &PersistCtx,
) -> Result<InodeAlloc> {
    let target_group = if is_directory {
        orlov_choose_group_for_dir(groups)?
    } else {
        parent_group
    };

    if let Some(alloc) =
        try_alloc_inode_in_group(dev, geo, groups, target_group, is_directory, pctx)?
    {
        return Ok(alloc);
    }

    for g in 0..geo.group_count {
        let group = GroupNumber(g);
        if group == target_group {
            continue;
        }
        if let Some(alloc) = try_alloc_inode_in_group(dev, geo, groups, group, is_directory, pctx)?
        {
            return Ok(alloc);
        }
    }

    Err(DnxError::NoSpace)
}

/// Orlov: choose a group for a new directory.
fn orlov_choose_group_for_dir(groups: &[GroupStats]) -> Result<GroupNumber> {
    if groups.is_empty() {
        return Err(DnxError::NoSpace);
    }

    let n = groups.len() as u64;
    let avg_free_inodes = groups.iter().map(|g| u64::from(g.free_inodes)).sum::<u64>() / n;
    let avg_free_blocks = groups.iter().map(|g| u64::from(g.free_blocks)).sum::<u64>() / n;

    let best = groups
        .iter()
        .filter(|gs| gs.free_inodes > 0)
        .filter(|gs| u64::from(gs.free_inodes) >= avg_free_inodes)
        .filter(|gs| u64::from(gs.free_blocks) >= avg_free_blocks)
        .min_by_key(|gs| (gs.used_dirs, gs.group.0));

    if let Some(gs) = best {
        return Ok(gs.group);
    }

    groups
        .iter()
        .find(|gs| gs.free_inodes > 0)
        .map(|gs| gs.group)
        .ok_or(DnxError::NoSpace)
}

fn try_alloc_inode_in_group(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    groups: &mut [GroupStats],
    group: GroupNumber,
    is_directory: bool,
    pctx: &PersistCtx,
) -> Result<Option<InodeAlloc>> {
    let gidx = group.0 as usize;
    if gidx >= groups.len() || groups[gidx].free_inodes == 0 {
        return Ok(None);
    }

    let bitmap_block = groups[gidx].inode_bitmap_block;
    let mut bitmap = dev.read_block(bitmap_block)?.into_inner();
    let inodes_in_group = geo.inodes_in_group(group);

    // Reserved inodes 1..first_ino live at the start of group 0.
    let first_free = if group.0 == 0 {
        geo.first_ino.saturating_sub(1).min(inodes_in_group)
    } else {
        0
    };

    let Some(idx) = (first_free..inodes_in_group).find(|&i| !bitmap_get(&bitmap, i)) else {
        return Ok(None);
    };

    bitmap_set(&mut bitmap, idx);
    dev.write_block(bitmap_block, &bitmap)?;

    groups[gidx].free_inodes -= 1;
    if is_directory {
        groups[gidx].used_dirs += 1;
    }
    persist_group_desc(dev, pctx, group, &groups[gidx])?;

    #[expect(clippy::cast_possible_truncation)]
    let ino = (u64::from(group.0) * u64::from(geo.inodes_per_group) + u64::from(idx) + 1) as u32;
    debug!(group = group.0, ino, is_directory, "alloc_inode");
    Ok(Some(InodeAlloc {
        ino: InodeNumber(ino),
        group,
    }))
}

/// Free an inode's bitmap bit and update its group's counters.
pub fn free_inode(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    groups: &mut [GroupStats],
    ino: InodeNumber,
    is_directory: bool,
    pctx: &PersistCtx,
) -> Result<()> {
    let ino_zero = ino.0.checked_sub(1).ok_or_else(|| DnxError::Corruption {
        block: 0,
        detail: "inode number 0 is invalid".to_owned(),
    })?;
    let group_idx = ino_zero / geo.inodes_per_group;
    let bit_idx = ino_zero % geo.inodes_per_group;
    let gidx = group_idx as usize;

    if gidx >= groups.len() || ino.0 > geo.total_inodes {
        return Err(DnxError::Corruption {
            block: 0,
            detail: format!("free_inode: inode {ino} out of range"),
        });
    }

    let bitmap_block = groups[gidx].inode_bitmap_block;
    let mut bitmap = dev.read_block(bitmap_block)?.into_inner();
    if !bitmap_get(&bitmap, bit_idx) {
        return Err(DnxError::Corruption {
            block: bitmap_block.0,
            detail: format!("double-free: inode {ino} already free in bitmap"),
        });
    }

    bitmap_clear(&mut bitmap, bit_idx);
    dev.write_block(bitmap_block, &bitmap)?;

    let gs = &mut groups[gidx];
    gs.free_inodes += 1;
    if is_directory {
        gs.used_dirs = gs.used_dirs.saturating_sub(1);
    }
    persist_group_desc(dev, pctx, GroupNumber(group_idx), &groups[gidx])?;
    debug!(group = group_idx, ino = ino.0, is_directory, "free_inode");
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use dnx_block::{BlockDev, MemBlockIo};
    use proptest::prelude::*;
    use std::sync::Arc;

    const BS: u32 = 1024;

    fn make_device() -> BlockDev {
        let io = MemBlockIo::new(BS, 4 * 8192 + 1);
        BlockDev::new(Arc::new(io), BS, 4 * 8192 + 1).expect("device")
    }

    fn make_geometry() -> FsGeometry {
        FsGeometry {
            blocks_per_group: 8192,
            inodes_per_group: 2048,
            block_size: BS,
            total_blocks: 4 * 8192 + 1,
            total_inodes: 8192,
            first_data_block: 1,
            first_ino: 11,
            group_count: 4,
            inode_size: 128,
            gdt_blocks: 1,
            sparse_super: true,
        }
    }

    /// Groups laid out like mkfs: bitmaps right after the optional
    /// superblock/GDT copy, inode table after the bitmaps.
    fn make_groups(geo: &FsGeometry) -> Vec<GroupStats> {
        (0..geo.group_count)
            .map(|g| {
                let group = GroupNumber(g);
                let start = geo.group_block_to_absolute(group, 0).0;
                let meta = if geo.group_has_super(group) {
                    1 + u64::from(geo.gdt_blocks)
                } else {
                    0
                };
                let used = meta + 2 + geo.inode_table_blocks();
                GroupStats {
                    group,
                    free_blocks: geo.blocks_in_group(group) - used as u32,
                    free_inodes: geo.inodes_per_group,
                    used_dirs: 0,
                    block_bitmap_block: BlockNumber(start + meta),
                    inode_bitmap_block: BlockNumber(start + meta + 1),
                    inode_table_block: BlockNumber(start + meta + 2),
                }
            })
            .collect()
    }

    fn make_persist_ctx() -> PersistCtx {
        PersistCtx {
            gdt_block: BlockNumber(2),
        }
    }

    /// Seed the descriptor table and reserve the first inodes of group 0.
    fn seed(dev: &BlockDev, pctx: &PersistCtx, geo: &FsGeometry, groups: &mut [GroupStats]) {
        groups[0].free_inodes -= geo.first_ino - 1;
        let mut buf = vec![0_u8; BS as usize];
        for gs in groups.iter() {
            let off = gs.group.0 as usize * EXT2_GROUP_DESC_SIZE;
            let gd = Ext2GroupDesc {
                block_bitmap: gs.block_bitmap_block.0 as u32,
                inode_bitmap: gs.inode_bitmap_block.0 as u32,
                inode_table: gs.inode_table_block.0 as u32,
                free_blocks_count: gs.free_blocks as u16,
                free_inodes_count: gs.free_inodes as u16,
                used_dirs_count: 0,
                flags: 0,
            };
            gd.write_into(&mut buf[off..]).expect("write gd");
        }
        dev.write_block(pctx.gdt_block, &buf).expect("write gdt");

        let mut ibm = vec![0_u8; BS as usize];
        for i in 0..geo.first_ino - 1 {
            bitmap_set(&mut ibm, i);
        }
        dev.write_block(groups[0].inode_bitmap_block, &ibm)
            .expect("inode bitmap");
    }

    fn read_gd(dev: &BlockDev, pctx: &PersistCtx, group: u32) -> Ext2GroupDesc {
        let buf = dev.read_block(pctx.gdt_block).expect("read gdt");
        let off = group as usize * EXT2_GROUP_DESC_SIZE;
        Ext2GroupDesc::parse_from_bytes(&buf.as_slice()[off..]).expect("parse gd")
    }

    fn setup() -> (BlockDev, FsGeometry, Vec<GroupStats>, PersistCtx) {
        let dev = make_device();
        let geo = make_geometry();
        let mut groups = make_groups(&geo);
        let pctx = make_persist_ctx();
        seed(&dev, &pctx, &geo, &mut groups);
        (dev, geo, groups, pctx)
    }

    // ── Bitmap tests ────────────────────────────────────────────────────

    #[test]
    fn bitmap_get_set_clear() {
        let mut bm = vec![0_u8; 4];
        assert!(!bitmap_get(&bm, 0));
        bitmap_set(&mut bm, 0);
        assert!(bitmap_get(&bm, 0));
        bitmap_clear(&mut bm, 0);
        assert!(!bitmap_get(&bm, 0));

        bitmap_set(&mut bm, 7);
        assert_eq!(bm[0], 0x80);
        bitmap_set(&mut bm, 8);
        assert_eq!(bm[1], 0x01);
        assert!(!bitmap_get(&bm, 1000));
    }

    #[test]
    fn bitmap_count_free_partial_byte() {
        let mut bm = vec![0_u8; 2];
        bitmap_set(&mut bm, 0);
        bitmap_set(&mut bm, 5);
        bitmap_set(&mut bm, 15);
        assert_eq!(bitmap_count_free(&bm, 16), 13);
        assert_eq!(bitmap_count_free(&bm, 12), 10);
    }

    #[test]
    fn bitmap_find_free_wraps() {
        let mut bm = vec![0xFF_u8; 2];
        bitmap_clear(&mut bm, 3);
        assert_eq!(bitmap_find_free(&bm, 16, 5), Some(3));
        assert_eq!(bitmap_find_free(&[0xFF, 0xFF], 16, 0), None);
    }

    #[test]
    fn bitmap_find_contiguous_none() {
        let mut bm = vec![0_u8; 2];
        for i in (0..16).step_by(2) {
            bitmap_set(&mut bm, i);
        }
        assert_eq!(bitmap_find_contiguous(&bm, 16, 2), None);
        assert_eq!(bitmap_find_contiguous(&bm, 16, 1), Some(1));
    }

    // ── Geometry tests ──────────────────────────────────────────────────

    #[test]
    fn geometry_group_block_conversion() {
        let geo = make_geometry();
        let abs = geo.group_block_to_absolute(GroupNumber(1), 42);
        assert_eq!(abs, BlockNumber(1 + 8192 + 42));
        assert_eq!(geo.absolute_to_group_block(abs), (GroupNumber(1), 42));
    }

    #[test]
    fn geometry_short_last_group() {
        let mut geo = make_geometry();
        geo.total_blocks = 3 * 8192 + 1 + 100;
        assert_eq!(geo.blocks_in_group(GroupNumber(3)), 100);
        geo.total_inodes = 7000;
        assert_eq!(geo.inodes_in_group(GroupNumber(3)), 7000 - 3 * 2048);
    }

    #[test]
    fn geometry_sparse_super_groups() {
        let mut geo = make_geometry();
        assert!(geo.group_has_super(GroupNumber(0)));
        assert!(geo.group_has_super(GroupNumber(1)));
        assert!(!geo.group_has_super(GroupNumber(2)));
        assert!(geo.group_has_super(GroupNumber(3)));
        geo.sparse_super = false;
        assert!(geo.group_has_super(GroupNumber(2)));
    }

    // ── Reserved metadata ───────────────────────────────────────────────

    #[test]
    fn reserved_blocks_cover_super_gdt_bitmaps_and_table() {
        let geo = make_geometry();
        let groups = make_groups(&geo);
        let table = geo.inode_table_blocks() as u32;

        let r0 = reserved_blocks_in_group(&geo, &groups, GroupNumber(0));
        assert_eq!(r0.len() as u32, 2 + 2 + table);
        assert_eq!(r0[0], 0);
        assert_eq!(*r0.last().unwrap(), 3 + table);

        let r2 = reserved_blocks_in_group(&geo, &groups, GroupNumber(2));
        assert_eq!(r2.len() as u32, 2 + table);
        assert_eq!(r2[0], 0);
    }

    // ── Block allocation ────────────────────────────────────────────────

    #[test]
    fn alloc_skips_reserved_and_updates_gdt() {
        let (dev, geo, mut groups, pctx) = setup();
        let before = groups[0].free_blocks;

        let alloc = alloc_blocks(&dev, &geo, &mut groups, 1, &AllocHint::default(), &pctx)
            .expect("alloc");
        let (g, rel) = geo.absolute_to_group_block(alloc.start);
        assert_eq!(g, GroupNumber(0));
        let reserved = reserved_blocks_in_group(&geo, &groups, g);
        assert!(!reserved.contains(&rel));
        assert_eq!(rel, *reserved.last().unwrap() + 1);

        assert_eq!(groups[0].free_blocks, before - 1);
        assert_eq!(u32::from(read_gd(&dev, &pctx, 0).free_blocks_count), before - 1);
    }

    #[test]
    fn alloc_contiguous_run_is_marked_in_bitmap() {
        let (dev, geo, mut groups, pctx) = setup();
        let hint = AllocHint {
            goal_group: Some(GroupNumber(2)),
            goal_block: None,
        };
        let alloc = alloc_blocks(&dev, &geo, &mut groups, 8, &hint, &pctx).expect("alloc");
        assert_eq!(alloc.count, 8);
        let (g, rel) = geo.absolute_to_group_block(alloc.start);
        assert_eq!(g, GroupNumber(2));

        let bm = dev.read_block(groups[2].block_bitmap_block).expect("bitmap");
        for i in rel..rel + 8 {
            assert!(bitmap_get(bm.as_slice(), i));
        }
    }

    #[test]
    fn alloc_goal_block_is_honored() {
        let (dev, geo, mut groups, pctx) = setup();
        let goal = geo.group_block_to_absolute(GroupNumber(1), 500);
        let hint = AllocHint {
            goal_group: None,
            goal_block: Some(goal),
        };
        let alloc = alloc_blocks(&dev, &geo, &mut groups, 1, &hint, &pctx).expect("alloc");
        assert_eq!(alloc.start, goal);
    }

    #[test]
    fn alloc_falls_back_to_other_groups() {
        let (dev, geo, mut groups, pctx) = setup();
        groups[0].free_blocks = 0;
        let alloc = alloc_blocks(&dev, &geo, &mut groups, 1, &AllocHint::default(), &pctx)
            .expect("alloc");
        assert_eq!(geo.absolute_to_group_block(alloc.start).0, GroupNumber(1));
    }

    #[test]
    fn alloc_no_space_returns_error() {
        let (dev, geo, mut groups, pctx) = setup();
        for gs in &mut groups {
            gs.free_blocks = 0;
        }
        let err = alloc_blocks(&dev, &geo, &mut groups, 1, &AllocHint::default(), &pctx)
            .unwrap_err();
        assert!(matches!(err, DnxError::NoSpace));
    }

    #[test]
    fn alloc_zero_blocks_rejected() {
        let (dev, geo, mut groups, pctx) = setup();
        assert!(alloc_blocks(&dev, &geo, &mut groups, 0, &AllocHint::default(), &pctx).is_err());
    }

    #[test]
    fn free_detects_double_free() {
        let (dev, geo, mut groups, pctx) = setup();
        let alloc = alloc_blocks(&dev, &geo, &mut groups, 1, &AllocHint::default(), &pctx)
            .expect("alloc");
        free_blocks(&dev, &geo, &mut groups, alloc.start, 1, &pctx).expect("free");
        let err = free_blocks(&dev, &geo, &mut groups, alloc.start, 1, &pctx).unwrap_err();
        assert!(matches!(err, DnxError::Corruption { .. }));
    }

    #[test]
    fn free_rejects_reserved_block() {
        let (dev, geo, mut groups, pctx) = setup();
        let before = groups[0].free_blocks;
        let table = groups[0].inode_table_block;
        let err = free_blocks(&dev, &geo, &mut groups, table, 1, &pctx).unwrap_err();
        assert!(matches!(err, DnxError::Corruption { .. }));
        assert_eq!(groups[0].free_blocks, before);
    }

    #[test]
    fn seeded_gdt_matches_group_stats() {
        let (dev, geo, groups, pctx) = setup();
        let gd = read_gd(&dev, &pctx, 0);
        assert_eq!(u32::from(gd.free_inodes_count), groups[0].free_inodes);
        assert_eq!(groups[0].free_inodes, geo.inodes_per_group - (geo.first_ino - 1));
        assert_eq!(u32::from(gd.free_blocks_count), groups[0].free_blocks);
    }

    #[test]
    fn alloc_and_free_roundtrip_restores_gdt() {
        let (dev, geo, mut groups, pctx) = setup();
        let before = read_gd(&dev, &pctx, 0);
        let alloc = alloc_blocks(&dev, &geo, &mut groups, 4, &AllocHint::default(), &pctx)
            .expect("alloc");
        free_blocks(&dev, &geo, &mut groups, alloc.start, 4, &pctx).expect("free");
        assert_eq!(read_gd(&dev, &pctx, 0), before);
    }

    // ── Inode allocation ────────────────────────────────────────────────

    #[test]
    fn alloc_inode_file_in_parent_group_skips_reserved() {
        let (dev, geo, mut groups, pctx) = setup();
        let alloc = alloc_inode(&dev, &geo, &mut groups, GroupNumber(0), false, &pctx)
            .expect("alloc inode");
        assert_eq!(alloc.group, GroupNumber(0));
        assert_eq!(alloc.ino, InodeNumber(11));
        assert_eq!(groups[0].used_dirs, 0);
    }

    #[test]
    fn alloc_inode_directory_orlov_prefers_fewest_dirs() {
        let (dev, geo, mut groups, pctx) = setup();
        groups[0].used_dirs = 5;
        groups[1].used_dirs = 3;
        groups[2].used_dirs = 1;
        groups[3].used_dirs = 1;
        let alloc = alloc_inode(&dev, &geo, &mut groups, GroupNumber(0), true, &pctx)
            .expect("alloc dir");
        assert_eq!(alloc.group, GroupNumber(2));
        assert_eq!(alloc.ino, InodeNumber(2 * 2048 + 1));
        assert_eq!(groups[2].used_dirs, 2);
        assert_eq!(read_gd(&dev, &pctx, 2).used_dirs_count, 2);
    }

    #[test]
    fn alloc_and_free_inode_roundtrip() {
        let (dev, geo, mut groups, pctx) = setup();
        let before = groups[1].clone();
        let alloc = alloc_inode(&dev, &geo, &mut groups, GroupNumber(1), true, &pctx)
            .expect("alloc");
        assert_eq!(alloc.group, GroupNumber(1));
        free_inode(&dev, &geo, &mut groups, alloc.ino, true, &pctx).expect("free");
        assert_eq!(groups[1], before);
        let err = free_inode(&dev, &geo, &mut groups, alloc.ino, true, &pctx).unwrap_err();
        assert!(matches!(err, DnxError::Corruption { .. }));
    }

    #[test]
    fn alloc_inode_no_space() {
        let (dev, geo, mut groups, pctx) = setup();
        for gs in &mut groups {
            gs.free_inodes = 0;
        }
        let err = alloc_inode(&dev, &geo, &mut groups, GroupNumber(0), false, &pctx).unwrap_err();
        assert!(matches!(err, DnxError::NoSpace));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn find_free_returns_clear_bit(bytes in proptest::collection::vec(any::<u8>(), 1..16), start in 0_u32..200) {
            let count = bytes.len() as u32 * 8;
            match bitmap_find_free(&bytes, count, start) {
                Some(idx) => {
                    prop_assert!(idx < count);
                    prop_assert!(!bitmap_get(&bytes, idx));
                }
                None => prop_assert_eq!(bitmap_count_free(&bytes, count), 0),
            }
        }

        #[test]
        fn alloc_free_sequence_keeps_counts_consistent(ops in proptest::collection::vec(any::<bool>(), 1..40)) {
            let (dev, geo, mut groups, pctx) = setup();
            let start_free: u32 = groups.iter().map(|g| g.free_blocks).sum();
            let mut live = Vec::new();
            for alloc in ops {
                if alloc || live.is_empty() {
                    let a = alloc_blocks(&dev, &geo, &mut groups, 1, &AllocHint::default(), &pctx).expect("alloc");
                    prop_assert!(!live.contains(&a.start));
                    live.push(a.start);
                } else if let Some(b) = live.pop() {
                    free_blocks(&dev, &geo, &mut groups, b, 1, &pctx).expect("free");
                }
            }
            let free: u32 = groups.iter().map(|g| g.free_blocks).sum();
            prop_assert_eq!(free + live.len() as u32, start_free);
        }
    }
}
