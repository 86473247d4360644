#![forbid(unsafe_code)]
//! Inode and directory primitive layer.
//!
//! [`Ext2Fs`] owns the block cache and the in-memory superblock and group
//! state of one mounted volume. Inodes are accessed through [`InodeRef`]
//! guards: at most one guard per inode exists at a time, a dirty guard is
//! written back when released, and every acquisition and release is
//! counted so callers can assert that nothing leaked.
//!
//! Block mapping (direct plus single, double and triple indirect) lives in
//! `blockmap`, directory entry handling in `dir`, volume creation in
//! [`format`].

mod blockmap;
mod dir;
pub mod format;

pub use dir::DirIter;
pub use format::{FormatOptions, format};

use dnx_alloc::{FsGeometry, GroupStats, PersistCtx};
use dnx_block::{BlockBuf, BlockCache, BlockDev, BlockDevice, WriteBackGuard};
use dnx_error::{DnxError, Result};
use dnx_ondisk::{
    EXT2_GROUP_DESC_SIZE, Ext2CompatFeatures, Ext2GroupDesc, Ext2Inode, Ext2Superblock,
};
use dnx_types::{
    BlockNumber, EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE, GroupNumber, InodeNumber,
    ParseError, S_IFDIR, S_IFREG,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

/// `s_state` bit set while the volume is cleanly unmounted.
const EXT2_VALID_FS: u16 = 0x0001;

/// Seconds since the Unix epoch, saturated to the 32-bit on-disk field.
#[must_use]
pub fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
}

/// Convert a mount-time parse failure into the runtime error taxonomy.
///
/// Feature failures become [`DnxError::UnsupportedFeature`], geometry
/// failures [`DnxError::InvalidGeometry`], anything else
/// [`DnxError::Format`].
#[must_use]
pub fn parse_error_to_dnx(sb: Option<&Ext2Superblock>, e: &ParseError) -> DnxError {
    match e {
        ParseError::InvalidField { field, reason } => {
            if field.contains("feature") {
                let detail =
                    sb.map_or_else(|| format!("{field}: {reason}"), Ext2Superblock::unsupported_features_display);
                DnxError::UnsupportedFeature(detail)
            } else if field.contains("block_size")
                || field.contains("blocks_per_group")
                || field.contains("inodes_per_group")
                || field.contains("inode_size")
                || field.contains("first_data_block")
                || field.contains("first_ino")
                || field.contains("blocks_count")
                || field.contains("inodes_count")
            {
                DnxError::InvalidGeometry(format!("{field}: {reason}"))
            } else {
                DnxError::Format(e.to_string())
            }
        }
        ParseError::InvalidMagic { .. } => DnxError::Format(e.to_string()),
        ParseError::InsufficientData { .. } | ParseError::IntegerConversion { .. } => {
            DnxError::Parse(e.to_string())
        }
    }
}

/// Live-metadata parse failure at `block`.
pub(crate) fn corrupt_at(block: BlockNumber, e: &ParseError) -> DnxError {
    DnxError::Corruption {
        block: block.0,
        detail: e.to_string(),
    }
}

/// Attach a block number to a corruption error raised without one.
pub(crate) fn with_block(err: DnxError, block: BlockNumber) -> DnxError {
    match err {
        DnxError::Corruption { block: 0, detail } => DnxError::Corruption {
            block: block.0,
            detail,
        },
        other => other,
    }
}

/// Inode reference accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefStats {
    /// References handed out by [`Ext2Fs::get_inode_ref`] and
    /// [`Ext2Fs::alloc_inode`].
    pub acquired: u64,
    /// References released through put, discard, free or drop.
    pub released: u64,
}

impl RefStats {
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.acquired.saturating_sub(self.released)
    }
}

#[derive(Debug, Default)]
struct RefTracker {
    held: BTreeSet<u32>,
    stats: RefStats,
}

#[derive(Debug)]
struct FsState {
    sb: Ext2Superblock,
    geo: FsGeometry,
    groups: Vec<GroupStats>,
    pctx: PersistCtx,
    /// Superblock counters changed since the last write.
    dirty: bool,
}

impl FsState {
    fn refresh_counters(&mut self) {
        let free_blocks: u64 = self.groups.iter().map(|g| u64::from(g.free_blocks)).sum();
        let free_inodes: u64 = self.groups.iter().map(|g| u64::from(g.free_inodes)).sum();
        self.sb.free_blocks_count = u32::try_from(free_blocks).unwrap_or(u32::MAX);
        self.sb.free_inodes_count = u32::try_from(free_inodes).unwrap_or(u32::MAX);
    }
}

/// A mounted ext2 volume: block cache plus superblock, group and
/// reference state.
pub struct Ext2Fs {
    cache: BlockCache<BlockDev>,
    state: Mutex<FsState>,
    refs: Mutex<RefTracker>,
}

impl std::fmt::Debug for Ext2Fs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ext2Fs")
            .field("block_size", &self.block_size())
            .field("ref_stats", &self.ref_stats())
            .finish_non_exhaustive()
    }
}

impl Ext2Fs {
    /// Read and validate the superblock through the physical geometry.
    pub fn probe(dev: &BlockDev) -> Result<Ext2Superblock> {
        let mut region = vec![0_u8; EXT2_SUPERBLOCK_SIZE];
        dev.read_bytes(EXT2_SUPERBLOCK_OFFSET as u64, &mut region)?;
        let sb = Ext2Superblock::parse_superblock_region(&region)
            .map_err(|e| parse_error_to_dnx(None, &e))?;
        sb.validate().map_err(|e| parse_error_to_dnx(Some(&sb), &e))?;

        let device_bytes =
            u64::from(dev.physical_block_size()).saturating_mul(dev.physical_block_count());
        let volume_bytes = u64::from(sb.blocks_count) * u64::from(sb.block_size);
        if volume_bytes > device_bytes {
            return Err(DnxError::InvalidGeometry(format!(
                "volume of {volume_bytes} bytes exceeds device of {device_bytes} bytes"
            )));
        }
        debug!(
            block_size = sb.block_size,
            blocks = sb.blocks_count,
            inodes = sb.inodes_count,
            groups = sb.groups_count(),
            "superblock_probe"
        );
        Ok(sb)
    }

    /// Load the group descriptor table through `cache` and mark the volume
    /// as mounted.
    ///
    /// The cache block size must equal the superblock block size.
    pub fn open(cache: BlockCache<BlockDev>, sb: Ext2Superblock) -> Result<Self> {
        if cache.block_size() != sb.block_size {
            return Err(DnxError::NotSupported(format!(
                "cache block size {} differs from superblock block size {}",
                cache.block_size(),
                sb.block_size
            )));
        }

        let geo = FsGeometry::from_superblock(&sb);
        let pctx = PersistCtx::from_superblock(&sb);
        let bs = sb.block_size as usize;
        let mut groups = Vec::with_capacity(geo.group_count as usize);
        let mut table_block = None;
        for g in 0..geo.group_count {
            let byte = g as usize * EXT2_GROUP_DESC_SIZE;
            let block = BlockNumber(pctx.gdt_block.0 + (byte / bs) as u64);
            if table_block.as_ref().is_none_or(|(b, _)| *b != block) {
                table_block = Some((block, cache.read_block(block)?));
            }
            let Some((_, buf)) = table_block.as_ref() else {
                continue;
            };
            let off = byte % bs;
            let gd = Ext2GroupDesc::parse_from_bytes(&buf.as_slice()[off..])
                .map_err(|e| corrupt_at(block, &e))?;
            let last_meta = u64::from(gd.inode_table) + geo.inode_table_blocks();
            if u64::from(gd.block_bitmap) >= geo.total_blocks
                || u64::from(gd.inode_bitmap) >= geo.total_blocks
                || last_meta > geo.total_blocks
            {
                return Err(DnxError::Corruption {
                    block: block.0,
                    detail: format!("group {g} metadata outside the volume"),
                });
            }
            groups.push(GroupStats::from_group_desc(GroupNumber(g), &gd));
        }

        let mut state = FsState {
            sb,
            geo,
            groups,
            pctx,
            dirty: true,
        };
        state.refresh_counters();

        let fs = Self {
            cache,
            state: Mutex::new(state),
            refs: Mutex::new(RefTracker::default()),
        };

        {
            let mut st = fs.state.lock();
            st.sb.mnt_count = st.sb.mnt_count.wrapping_add(1);
            st.sb.mtime = now();
            st.sb.state &= !EXT2_VALID_FS;
            fs.write_superblock(&st.sb)?;
            st.dirty = false;
            debug!(
                free_blocks = st.sb.free_blocks_count,
                free_inodes = st.sb.free_inodes_count,
                mounts = st.sb.mnt_count,
                "ext2fs_open"
            );
        }
        Ok(fs)
    }

    /// Write back superblock counters and flush every dirty block.
    pub fn sync(&self) -> Result<()> {
        {
            let mut st = self.state.lock();
            if st.dirty {
                st.refresh_counters();
                st.sb.wtime = now();
                self.write_superblock(&st.sb)?;
                st.dirty = false;
            }
        }
        self.cache.sync()
    }

    /// Mark the volume clean, write back all state and release the cache.
    ///
    /// Outstanding inode references are impossible here because they borrow
    /// the filesystem.
    pub fn fini(self) -> Result<()> {
        {
            let mut st = self.state.lock();
            st.refresh_counters();
            st.sb.wtime = now();
            st.sb.state |= EXT2_VALID_FS;
            self.write_superblock(&st.sb)?;
            st.dirty = false;
        }
        self.cache.sync()?;
        let stats = self.ref_stats();
        debug!(
            acquired = stats.acquired,
            released = stats.released,
            "ext2fs_fini"
        );
        Ok(())
    }

    fn write_superblock(&self, sb: &Ext2Superblock) -> Result<()> {
        let bs = u64::from(self.block_size());
        let offset = EXT2_SUPERBLOCK_OFFSET as u64;
        let block = BlockNumber(offset / bs);
        let at = usize::try_from(offset % bs)
            .map_err(|_| DnxError::InvalidArgument("superblock offset".to_owned()))?;
        let mut buf = self.cache.read_block(block)?.into_inner();
        sb.write_into(&mut buf[at..at + EXT2_SUPERBLOCK_SIZE])
            .map_err(|e| corrupt_at(block, &e))?;
        self.cache.write_block(block, &buf)?;
        trace!(block = block.0, "superblock_write");
        Ok(())
    }

    // ── Accessors ────────────────────────────────────────────────────────

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.cache.block_size()
    }

    /// Snapshot of the superblock with up-to-date free counters.
    #[must_use]
    pub fn superblock(&self) -> Ext2Superblock {
        let mut st = self.state.lock();
        st.refresh_counters();
        st.sb.clone()
    }

    #[must_use]
    pub fn geometry(&self) -> FsGeometry {
        self.state.lock().geo.clone()
    }

    #[must_use]
    pub fn group_stats(&self) -> Vec<GroupStats> {
        self.state.lock().groups.clone()
    }

    /// Whether directory entries carry a file type byte.
    #[must_use]
    pub fn has_filetype(&self) -> bool {
        self.state.lock().sb.has_filetype()
    }

    #[must_use]
    pub fn has_dir_index(&self) -> bool {
        self.state
            .lock()
            .sb
            .has_compat(Ext2CompatFeatures::DIR_INDEX)
    }

    #[must_use]
    pub fn ref_stats(&self) -> RefStats {
        self.refs.lock().stats
    }

    #[must_use]
    pub fn cache(&self) -> &BlockCache<BlockDev> {
        &self.cache
    }

    /// Enable or disable write-back on the cache (nested counter).
    pub fn set_write_back(&self, on: bool) -> Result<()> {
        self.cache.set_write_back(on)
    }

    pub fn write_back_guard(&self) -> WriteBackGuard<'_, BlockDev> {
        self.cache.write_back_guard()
    }

    /// Read one filesystem block through the cache.
    pub fn block_get(&self, block: BlockNumber) -> Result<BlockBuf> {
        self.cache.read_block(block)
    }

    /// Write one filesystem block through the cache.
    pub fn block_set(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        self.cache.write_block(block, data)
    }

    /// Multi-block read bypassing cache admission.
    pub fn blocks_get_direct(&self, start: BlockNumber, buf: &mut [u8]) -> Result<()> {
        self.cache.blocks_get_direct(start, buf)
    }

    /// Multi-block write bypassing cache admission.
    pub fn blocks_set_direct(&self, start: BlockNumber, buf: &[u8]) -> Result<()> {
        self.cache.blocks_set_direct(start, buf)
    }

    // ── Inode table I/O ──────────────────────────────────────────────────

    fn check_ino(&self, ino: InodeNumber) -> Result<()> {
        let count = self.state.lock().sb.inodes_count;
        if ino.0 == 0 || ino.0 > count {
            return Err(DnxError::InvalidArgument(format!(
                "inode {ino} out of range 1..={count}"
            )));
        }
        Ok(())
    }

    /// Block holding `ino` and the byte offset of its slot in that block.
    fn inode_location(&self, ino: InodeNumber) -> Result<(BlockNumber, usize, usize)> {
        let st = self.state.lock();
        let (group, offset) = st.sb.inode_table_offset(ino);
        let table = st
            .groups
            .get(group.0 as usize)
            .ok_or_else(|| DnxError::Corruption {
                block: 0,
                detail: format!("inode {ino} in missing group {group}"),
            })?
            .inode_table_block;
        let bs = u64::from(st.sb.block_size);
        let block = BlockNumber(table.0 + offset / bs);
        #[expect(clippy::cast_possible_truncation)]
        let at = (offset % bs) as usize;
        Ok((block, at, usize::from(st.sb.inode_size)))
    }

    fn read_inode(&self, ino: InodeNumber) -> Result<Ext2Inode> {
        let (block, at, size) = self.inode_location(ino)?;
        let buf = self.cache.read_block(block)?;
        Ext2Inode::parse_from_bytes(&buf.as_slice()[at..at + size]).map_err(|e| corrupt_at(block, &e))
    }

    /// Write `inode` into its table slot. With `fresh`, bytes the structure
    /// does not model are cleared first.
    fn write_inode(&self, ino: InodeNumber, inode: &Ext2Inode, fresh: bool) -> Result<()> {
        let (block, at, size) = self.inode_location(ino)?;
        let mut buf = self.cache.read_block(block)?.into_inner();
        let slot = &mut buf[at..at + size];
        if fresh {
            slot.fill(0);
        }
        inode.write_into(slot).map_err(|e| corrupt_at(block, &e))?;
        self.cache.write_block(block, &buf)?;
        trace!(ino = ino.0, block = block.0, "inode_write");
        Ok(())
    }

    fn track(&self, ino: InodeNumber) -> Result<()> {
        let mut refs = self.refs.lock();
        if !refs.held.insert(ino.0) {
            return Err(DnxError::Busy(ino.0));
        }
        Ok(())
    }

    fn untrack(&self, ino: InodeNumber) {
        let mut refs = self.refs.lock();
        refs.held.remove(&ino.0);
        refs.stats.released += 1;
    }

    // ── Inode references ─────────────────────────────────────────────────

    /// Load inode `ino` into a reference guard.
    ///
    /// Fails with [`DnxError::Busy`] when a guard for `ino` is already live.
    pub fn get_inode_ref(&self, ino: InodeNumber) -> Result<InodeRef<'_>> {
        self.check_ino(ino)?;
        self.track(ino)?;
        match self.read_inode(ino) {
            Ok(inode) => {
                self.refs.lock().stats.acquired += 1;
                trace!(ino = ino.0, "inode_get");
                Ok(InodeRef {
                    fs: self,
                    index: ino,
                    inode,
                    dirty: false,
                    fresh: false,
                    released: false,
                })
            }
            Err(err) => {
                self.refs.lock().held.remove(&ino.0);
                Err(err)
            }
        }
    }

    /// Allocate and initialize a new inode near `parent`.
    ///
    /// Directories get mode `0o40777`, files `0o100666`; the link count
    /// starts at 0 and the caller links the inode into a directory. The
    /// returned reference is dirty.
    pub fn alloc_inode(&self, parent: InodeNumber, is_dir: bool) -> Result<InodeRef<'_>> {
        let alloc = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let parent_group = dnx_types::inode_to_group(parent, st.geo.inodes_per_group);
            let alloc = dnx_alloc::alloc_inode(
                &self.cache,
                &st.geo,
                &mut st.groups,
                parent_group,
                is_dir,
                &st.pctx,
            )?;
            st.dirty = true;
            alloc
        };
        if let Err(err) = self.track(alloc.ino) {
            return Err(DnxError::Corruption {
                block: 0,
                detail: format!("freshly allocated inode {} is still referenced: {err}", alloc.ino),
            });
        }

        let stamp = now();
        let inode = Ext2Inode {
            mode: if is_dir { S_IFDIR | 0o777 } else { S_IFREG | 0o666 },
            atime: stamp,
            ctime: stamp,
            mtime: stamp,
            ..Ext2Inode::default()
        };
        self.refs.lock().stats.acquired += 1;
        debug!(ino = alloc.ino.0, group = alloc.group.0, is_dir, "inode_alloc");
        Ok(InodeRef {
            fs: self,
            index: alloc.ino,
            inode,
            dirty: true,
            fresh: true,
            released: false,
        })
    }

    /// Release `iref` and return its inode to the free pool.
    ///
    /// The inode is written first (so `dtime` and the zero link count reach
    /// the table), then its bitmap bit is cleared.
    pub fn free_inode(&self, mut iref: InodeRef<'_>) -> Result<()> {
        let ino = iref.index;
        let is_dir = iref.inode.is_dir();
        if iref.inode.dtime == 0 {
            iref.inode.dtime = now();
            iref.dirty = true;
        }
        iref.release(true)?;

        let mut guard = self.state.lock();
        let st = &mut *guard;
        dnx_alloc::free_inode(&self.cache, &st.geo, &mut st.groups, ino, is_dir, &st.pctx)?;
        st.dirty = true;
        debug!(ino = ino.0, is_dir, "inode_free");
        Ok(())
    }
}

/// Scoped, exclusive handle on one loaded inode.
///
/// Release with [`InodeRef::put`] (writes back when dirty and reports the
/// result) or [`InodeRef::discard`] (drops changes). Dropping an unreleased
/// guard behaves like `put` and logs a failure.
pub struct InodeRef<'a> {
    fs: &'a Ext2Fs,
    index: InodeNumber,
    inode: Ext2Inode,
    dirty: bool,
    /// Newly allocated: the whole on-disk slot is rewritten.
    fresh: bool,
    released: bool,
}

impl std::fmt::Debug for InodeRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeRef")
            .field("index", &self.index)
            .field("inode", &self.inode)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

impl InodeRef<'_> {
    #[must_use]
    pub fn index(&self) -> InodeNumber {
        self.index
    }

    #[must_use]
    pub fn inode(&self) -> &Ext2Inode {
        &self.inode
    }

    /// Mutable access. Call [`InodeRef::mark_dirty`] for the change to be
    /// written back.
    pub fn inode_mut(&mut self) -> &mut Ext2Inode {
        &mut self.inode
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Forget pending changes; `put` will not write the inode.
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write back (when dirty) and release.
    pub fn put(mut self) -> Result<()> {
        self.release(true)
    }

    /// Release without writing.
    pub fn discard(mut self) {
        // Releasing without a write cannot fail.
        let _ = self.release(false);
    }

    fn release(&mut self, write: bool) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let result = if write && self.dirty {
            self.fs.write_inode(self.index, &self.inode, self.fresh)
        } else {
            Ok(())
        };
        self.fs.untrack(self.index);
        trace!(ino = self.index.0, written = write && self.dirty, "inode_put");
        result
    }
}

impl Drop for InodeRef<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.release(true) {
            warn!(ino = self.index.0, error = %err, "inode_put_on_drop_failed");
        }
    }
}
