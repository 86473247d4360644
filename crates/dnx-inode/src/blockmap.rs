#![forbid(unsafe_code)]
//! Logical to physical block mapping through the classic ext2 block array:
//! twelve direct pointers followed by single, double and triple indirect
//! blocks.

use crate::{Ext2Fs, InodeRef, corrupt_at, now};
use dnx_alloc::AllocHint;
use dnx_block::BlockDevice;
use dnx_error::{DnxError, Result};
use dnx_ondisk::{Ext2Inode, Ext2RoCompatFeatures};
use dnx_types::{
    BlockNumber, EXT2_DIND_BLOCK, EXT2_IND_BLOCK, EXT2_N_BLOCKS, EXT2_NDIR_BLOCKS,
    EXT2_TIND_BLOCK, read_le_u32, write_le_u32,
};
use tracing::{debug, trace, warn};

/// Largest size a file may have without the `LARGE_FILE` feature.
const SMALL_FILE_MAX: u64 = i32::MAX as u64;

/// Slot in the inode block array plus the pointer index at each indirect
/// level on the way to logical block `lb`.
pub(crate) fn block_path(ptrs_per_block: u64, lb: u64) -> Result<(usize, Vec<u64>)> {
    let ndir = EXT2_NDIR_BLOCKS as u64;
    if lb < ndir {
        #[expect(clippy::cast_possible_truncation)]
        return Ok((lb as usize, Vec::new()));
    }
    let mut rest = lb - ndir;
    if rest < ptrs_per_block {
        return Ok((EXT2_IND_BLOCK, vec![rest]));
    }
    rest -= ptrs_per_block;
    let double = ptrs_per_block * ptrs_per_block;
    if rest < double {
        return Ok((
            EXT2_DIND_BLOCK,
            vec![rest / ptrs_per_block, rest % ptrs_per_block],
        ));
    }
    rest -= double;
    if rest < double * ptrs_per_block {
        return Ok((
            EXT2_TIND_BLOCK,
            vec![
                rest / double,
                (rest / ptrs_per_block) % ptrs_per_block,
                rest % ptrs_per_block,
            ],
        ));
    }
    Err(DnxError::FileTooLarge)
}

impl Ext2Fs {
    fn ptrs_per_block(&self) -> u64 {
        u64::from(self.block_size() / 4)
    }

    /// Reject a pointer that lies outside the volume.
    fn check_ptr(&self, holder: BlockNumber, ptr: u32) -> Result<BlockNumber> {
        let total = u64::from(self.state.lock().sb.blocks_count);
        if u64::from(ptr) >= total {
            return Err(DnxError::Corruption {
                block: holder.0,
                detail: format!("block pointer {ptr} beyond volume of {total} blocks"),
            });
        }
        Ok(BlockNumber(u64::from(ptr)))
    }

    fn read_ptr(&self, block: BlockNumber, index: u64) -> Result<u32> {
        let buf = self.cache.read_block(block)?;
        #[expect(clippy::cast_possible_truncation)]
        let at = (index * 4) as usize;
        read_le_u32(buf.as_slice(), at).map_err(|e| corrupt_at(block, &e))
    }

    /// Walk the block array of `inode` down to logical block `lb`.
    pub(crate) fn map_block(&self, inode: &Ext2Inode, lb: u64) -> Result<Option<BlockNumber>> {
        let (slot, path) = block_path(self.ptrs_per_block(), lb)?;
        let mut ptr = inode.block[slot];
        let mut holder = BlockNumber(0);
        for index in path {
            if ptr == 0 {
                return Ok(None);
            }
            holder = self.check_ptr(holder, ptr)?;
            ptr = self.read_ptr(holder, index)?;
        }
        if ptr == 0 {
            return Ok(None);
        }
        self.check_ptr(holder, ptr).map(Some)
    }

    fn note_large_file(&self) {
        let mut st = self.state.lock();
        if !st.sb.has_ro_compat(Ext2RoCompatFeatures::LARGE_FILE) {
            st.sb.feature_ro_compat =
                Ext2RoCompatFeatures(st.sb.feature_ro_compat.0 | Ext2RoCompatFeatures::LARGE_FILE.0);
            st.dirty = true;
            debug!("large_file_feature_set");
        }
    }
}

impl InodeRef<'_> {
    fn sectors_per_block(&self) -> u32 {
        self.fs.block_size() / 512
    }

    /// Physical block backing logical block `lb`, or `None` for a hole.
    pub fn data_block(&self, lb: u64) -> Result<Option<BlockNumber>> {
        self.fs.map_block(&self.inode, lb)
    }

    /// Set the byte size, raising the `LARGE_FILE` feature when needed.
    pub fn set_size(&mut self, size: u64) {
        if size > SMALL_FILE_MAX && self.inode.is_regular() {
            self.fs.note_large_file();
        }
        self.inode.size = size;
        self.dirty = true;
    }

    fn alloc_block(&mut self, goal: Option<BlockNumber>) -> Result<BlockNumber> {
        let start = {
            let mut guard = self.fs.state.lock();
            let st = &mut *guard;
            let hint = AllocHint {
                goal_group: goal.is_none().then(|| {
                    dnx_types::inode_to_group(self.index, st.geo.inodes_per_group)
                }),
                goal_block: goal,
            };
            let alloc =
                dnx_alloc::alloc_blocks(&self.fs.cache, &st.geo, &mut st.groups, 1, &hint, &st.pctx)?;
            st.dirty = true;
            alloc.start
        };
        self.inode.blocks = self.inode.blocks.saturating_add(self.sectors_per_block());
        self.dirty = true;
        trace!(ino = self.index.0, block = start.0, "data_block_alloc");
        Ok(start)
    }

    fn alloc_zeroed_block(&mut self, goal: Option<BlockNumber>) -> Result<BlockNumber> {
        let block = self.alloc_block(goal)?;
        let zeros = vec![0_u8; self.fs.block_size() as usize];
        self.fs.cache.write_block(block, &zeros)?;
        Ok(block)
    }

    fn free_block(&mut self, block: BlockNumber) -> Result<()> {
        {
            let mut guard = self.fs.state.lock();
            let st = &mut *guard;
            dnx_alloc::free_blocks(&self.fs.cache, &st.geo, &mut st.groups, block, 1, &st.pctx)?;
            st.dirty = true;
        }
        self.inode.blocks = self.inode.blocks.saturating_sub(self.sectors_per_block());
        self.dirty = true;
        trace!(ino = self.index.0, block = block.0, "data_block_free");
        Ok(())
    }

    /// Record `phys` as the mapping for `lb`, allocating indirect blocks
    /// on the way.
    fn set_block(&mut self, lb: u64, phys: BlockNumber) -> Result<()> {
        let (slot, path) = block_path(self.fs.ptrs_per_block(), lb)?;
        let phys32 = phys.to_u32().map_err(|e| corrupt_at(phys, &e))?;
        if path.is_empty() {
            self.inode.block[slot] = phys32;
            self.dirty = true;
            return Ok(());
        }

        if self.inode.block[slot] == 0 {
            let fresh = self.alloc_zeroed_block(Some(phys))?;
            self.inode.block[slot] = fresh.to_u32().map_err(|e| corrupt_at(fresh, &e))?;
        }
        let mut holder = self.fs.check_ptr(BlockNumber(0), self.inode.block[slot])?;
        let last = path.len() - 1;
        for (depth, index) in path.into_iter().enumerate() {
            #[expect(clippy::cast_possible_truncation)]
            let at = (index * 4) as usize;
            let mut buf = self.fs.cache.read_block(holder)?.into_inner();
            if depth == last {
                write_le_u32(&mut buf, at, phys32).map_err(|e| corrupt_at(holder, &e))?;
                self.fs.cache.write_block(holder, &buf)?;
                return Ok(());
            }
            let next = read_le_u32(&buf, at).map_err(|e| corrupt_at(holder, &e))?;
            holder = if next == 0 {
                let fresh = self.alloc_zeroed_block(Some(phys))?;
                let fresh32 = fresh.to_u32().map_err(|e| corrupt_at(fresh, &e))?;
                write_le_u32(&mut buf, at, fresh32).map_err(|e| corrupt_at(holder, &e))?;
                self.fs.cache.write_block(holder, &buf)?;
                fresh
            } else {
                self.fs.check_ptr(holder, next)?
            };
        }
        Ok(())
    }

    /// Goal for a new block at `lb`: right after the block before it.
    fn goal_for(&self, lb: u64) -> Result<Option<BlockNumber>> {
        if lb == 0 {
            return Ok(None);
        }
        Ok(self.data_block(lb - 1)?.and_then(|b| b.checked_add(1)))
    }

    /// Allocate a block at the logical end of the file and grow the size to
    /// cover it. Returns the logical and physical block numbers.
    ///
    /// The new block's content is not initialized.
    pub fn append_block(&mut self) -> Result<(u64, BlockNumber)> {
        let bs = u64::from(self.fs.block_size());
        let lb = self.inode.size.div_ceil(bs);
        let goal = self.goal_for(lb)?;
        let phys = self.alloc_block(goal)?;
        if let Err(err) = self.set_block(lb, phys) {
            if let Err(free_err) = self.free_block(phys) {
                warn!(block = phys.0, error = %free_err, "append_rollback_failed");
            }
            return Err(err);
        }
        self.set_size((lb + 1) * bs);
        trace!(ino = self.index.0, lb, block = phys.0, "inode_append_block");
        Ok((lb, phys))
    }

    /// Physical block for `lb`, filling a hole with a zeroed block.
    pub fn ensure_block(&mut self, lb: u64) -> Result<BlockNumber> {
        if let Some(block) = self.data_block(lb)? {
            return Ok(block);
        }
        let goal = self.goal_for(lb)?;
        let phys = self.alloc_zeroed_block(goal)?;
        if let Err(err) = self.set_block(lb, phys) {
            if let Err(free_err) = self.free_block(phys) {
                warn!(block = phys.0, error = %free_err, "hole_fill_rollback_failed");
            }
            return Err(err);
        }
        Ok(phys)
    }

    /// Shrink the inode to `new_size` bytes, freeing every block past the
    /// new end including emptied indirect blocks.
    pub fn truncate(&mut self, new_size: u64) -> Result<()> {
        if new_size > self.inode.size {
            return Err(DnxError::InvalidArgument(format!(
                "truncate of inode {} cannot grow {} to {new_size}",
                self.index, self.inode.size
            )));
        }
        let bs = u64::from(self.fs.block_size());
        let keep = new_size.div_ceil(bs);

        if self.inode.blocks == 0 {
            // Fast symlinks and device nodes keep data in the block array.
            if new_size == 0 && !self.inode.is_regular() && !self.inode.is_dir() {
                self.inode.block = [0; EXT2_N_BLOCKS];
            }
        } else {
            let ndir = EXT2_NDIR_BLOCKS as u64;
            for lb in keep.min(ndir)..ndir {
                #[expect(clippy::cast_possible_truncation)]
                let slot = lb as usize;
                let ptr = self.inode.block[slot];
                if ptr != 0 {
                    let block = self.fs.check_ptr(BlockNumber(0), ptr)?;
                    self.free_block(block)?;
                    self.inode.block[slot] = 0;
                }
            }

            let ppb = self.fs.ptrs_per_block();
            let levels = [
                (EXT2_IND_BLOCK, 1, ndir),
                (EXT2_DIND_BLOCK, 2, ndir + ppb),
                (EXT2_TIND_BLOCK, 3, ndir + ppb + ppb * ppb),
            ];
            for (slot, level, base) in levels {
                let ptr = self.inode.block[slot];
                if ptr != 0 && self.free_branch(ptr, level, base, keep)? {
                    self.inode.block[slot] = 0;
                }
            }
        }

        let stamp = now();
        self.inode.size = new_size;
        self.inode.mtime = stamp;
        self.inode.ctime = stamp;
        self.dirty = true;
        debug!(ino = self.index.0, size = new_size, blocks = self.inode.blocks, "inode_truncate");
        Ok(())
    }

    /// Free the part of an indirect tree at `level` covering logical blocks
    /// from `base` that lies at or past `keep`. Returns whether the
    /// indirect block itself was freed.
    fn free_branch(&mut self, ptr: u32, level: u32, base: u64, keep: u64) -> Result<bool> {
        let ppb = self.fs.ptrs_per_block();
        let span = ppb.pow(level - 1);
        let holder = self.fs.check_ptr(BlockNumber(0), ptr)?;
        if base + span * ppb <= keep {
            return Ok(false);
        }

        let mut buf = self.fs.cache.read_block(holder)?.into_inner();
        let mut changed = false;
        for index in 0..ppb {
            #[expect(clippy::cast_possible_truncation)]
            let at = (index * 4) as usize;
            let child = read_le_u32(&buf, at).map_err(|e| corrupt_at(holder, &e))?;
            if child == 0 {
                continue;
            }
            let child_base = base + index * span;
            if child_base + span <= keep {
                continue;
            }
            let gone = if level == 1 {
                let block = self.fs.check_ptr(holder, child)?;
                self.free_block(block)?;
                true
            } else {
                self.free_branch(child, level - 1, child_base, keep)?
            };
            if gone {
                write_le_u32(&mut buf, at, 0).map_err(|e| corrupt_at(holder, &e))?;
                changed = true;
            }
        }

        if keep <= base {
            self.free_block(holder)?;
            return Ok(true);
        }
        if changed {
            self.fs.cache.write_block(holder, &buf)?;
        }
        Ok(false)
    }
}
