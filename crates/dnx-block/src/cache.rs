#![forbid(unsafe_code)]
//! ARC block cache with dirty tracking and nested write-back.

use crate::{BlockBuf, BlockDevice};
use dnx_error::{DnxError, Result};
use dnx_types::BlockNumber;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArcList {
    T1,
    T2,
    B1,
    B2,
}

#[derive(Debug)]
struct ArcState {
    capacity: usize,
    /// Target size for the T1 list.
    p: usize,
    t1: VecDeque<BlockNumber>,
    t2: VecDeque<BlockNumber>,
    b1: VecDeque<BlockNumber>,
    b2: VecDeque<BlockNumber>,
    loc: HashMap<BlockNumber, ArcList>,
    resident: HashMap<BlockNumber, Vec<u8>>,
    /// Resident blocks dropped by the last replacement, pending write-out
    /// if dirty.
    evicted: Vec<(BlockNumber, Vec<u8>)>,
}

impl ArcState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            p: 0,
            t1: VecDeque::new(),
            t2: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
            loc: HashMap::new(),
            resident: HashMap::new(),
            evicted: Vec::new(),
        }
    }

    fn remove_from_list(list: &mut VecDeque<BlockNumber>, key: BlockNumber) -> bool {
        if let Some(pos) = list.iter().position(|k| *k == key) {
            let _ = list.remove(pos);
            return true;
        }
        false
    }

    fn evict_resident(&mut self, victim: BlockNumber) {
        if let Some(bytes) = self.resident.remove(&victim) {
            self.evicted.push((victim, bytes));
        }
    }

    fn touch_mru(&mut self, key: BlockNumber) {
        let Some(list) = self.loc.get(&key).copied() else {
            return;
        };

        match list {
            ArcList::T1 => {
                let _ = Self::remove_from_list(&mut self.t1, key);
                self.t2.push_back(key);
                self.loc.insert(key, ArcList::T2);
            }
            ArcList::T2 => {
                let _ = Self::remove_from_list(&mut self.t2, key);
                self.t2.push_back(key);
            }
            ArcList::B1 | ArcList::B2 => {}
        }
    }

    fn replace(&mut self, incoming: BlockNumber) {
        let t1_len = self.t1.len();
        if t1_len >= 1
            && (t1_len > self.p
                || (matches!(self.loc.get(&incoming), Some(ArcList::B2)) && t1_len == self.p))
        {
            if let Some(victim) = self.t1.pop_front() {
                self.loc.insert(victim, ArcList::B1);
                self.evict_resident(victim);
                self.b1.push_back(victim);
            }
        } else if let Some(victim) = self.t2.pop_front() {
            self.loc.insert(victim, ArcList::B2);
            self.evict_resident(victim);
            self.b2.push_back(victim);
        }

        while self.b1.len() > self.capacity {
            if let Some(victim) = self.b1.pop_front() {
                let _ = self.loc.remove(&victim);
            }
        }
        while self.b2.len() > self.capacity {
            if let Some(victim) = self.b2.pop_front() {
                let _ = self.loc.remove(&victim);
            }
        }
    }

    fn on_hit(&mut self, key: BlockNumber) {
        self.touch_mru(key);
    }

    fn on_miss_or_ghost_hit(&mut self, key: BlockNumber) {
        if matches!(self.loc.get(&key), Some(ArcList::B1)) {
            let b1_len = self.b1.len().max(1);
            let b2_len = self.b2.len().max(1);
            let delta = (b2_len / b1_len).max(1);
            self.p = (self.p + delta).min(self.capacity);
            let _ = Self::remove_from_list(&mut self.b1, key);
            self.replace(key);
            self.t2.push_back(key);
            self.loc.insert(key, ArcList::T2);
            return;
        }

        if matches!(self.loc.get(&key), Some(ArcList::B2)) {
            let b1_len = self.b1.len().max(1);
            let b2_len = self.b2.len().max(1);
            let delta = (b1_len / b2_len).max(1);
            self.p = self.p.saturating_sub(delta);
            let _ = Self::remove_from_list(&mut self.b2, key);
            self.replace(key);
            self.t2.push_back(key);
            self.loc.insert(key, ArcList::T2);
            return;
        }

        // Not present in any list.
        if self.t1.len() + self.b1.len() == self.capacity {
            if self.t1.len() < self.capacity {
                let _ = self.b1.pop_front().and_then(|v| self.loc.remove(&v));
                self.replace(key);
            } else if let Some(victim) = self.t1.pop_front() {
                let _ = self.loc.remove(&victim);
                self.evict_resident(victim);
            }
        } else if (self.t1.len() + self.b1.len()) < self.capacity
            && (self.t1.len() + self.t2.len() + self.b1.len() + self.b2.len())
                >= self.capacity.saturating_mul(2)
        {
            let _ = self.b2.pop_front().and_then(|v| self.loc.remove(&v));
        }

        if self.t1.len() + self.t2.len() >= self.capacity {
            self.replace(key);
        }
        self.t1.push_back(key);
        self.loc.insert(key, ArcList::T1);
    }

    /// Insert or refresh a resident block and update ARC lists.
    fn admit(&mut self, key: BlockNumber, bytes: Vec<u8>) {
        if self.resident.contains_key(&key) {
            self.on_hit(key);
        } else {
            self.on_miss_or_ghost_hit(key);
        }
        self.resident.insert(key, bytes);
    }
}

/// Counters kept by [`BlockCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Resident blocks dropped by replacement.
    pub evictions: u64,
    /// Dirty blocks written to the device (flush or eviction).
    pub writebacks: u64,
}

#[derive(Debug)]
struct CacheState {
    arc: ArcState,
    dirty: BTreeSet<BlockNumber>,
    write_back: u32,
    stats: CacheStats,
}

/// ARC-cached wrapper around a [`BlockDevice`].
///
/// With the write-back counter at zero every write reaches the device
/// immediately. While it is positive, writes only update the resident copy
/// and mark it dirty; dirty blocks are written when evicted, on
/// [`BlockCache::flush`], and when the counter returns to zero.
#[derive(Debug)]
pub struct BlockCache<D: BlockDevice> {
    inner: D,
    state: Mutex<CacheState>,
}

impl<D: BlockDevice> BlockCache<D> {
    pub fn new(inner: D, capacity_blocks: usize) -> Result<Self> {
        if capacity_blocks == 0 {
            return Err(DnxError::InvalidArgument(
                "BlockCache capacity_blocks must be > 0".to_owned(),
            ));
        }
        Ok(Self {
            inner,
            state: Mutex::new(CacheState {
                arc: ArcState::new(capacity_blocks),
                dirty: BTreeSet::new(),
                write_back: 0,
                stats: CacheStats::default(),
            }),
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.lock().arc.capacity
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.state.lock().dirty.len()
    }

    /// Current nesting depth of write-back mode.
    #[must_use]
    pub fn write_back_depth(&self) -> u32 {
        self.state.lock().write_back
    }

    #[must_use]
    pub fn is_write_back(&self) -> bool {
        self.write_back_depth() > 0
    }

    /// Write out dirty blocks the last replacement dropped. Runs under the
    /// state lock so no reader can observe the stale device copy.
    fn drain_evicted(&self, state: &mut CacheState) -> Result<()> {
        let evicted = std::mem::take(&mut state.arc.evicted);
        for (block, bytes) in evicted {
            state.stats.evictions += 1;
            if state.dirty.remove(&block) {
                trace!(block = block.0, "cache_evict_dirty");
                self.inner.write_block(block, &bytes)?;
                state.stats.writebacks += 1;
            }
        }
        Ok(())
    }

    /// Enable (`true`) or disable (`false`) write-back mode.
    ///
    /// Nested: enabling twice requires disabling twice. The dirty set is
    /// flushed when the counter returns to zero. Disabling at zero is a
    /// no-op.
    pub fn set_write_back(&self, on: bool) -> Result<()> {
        let mut state = self.state.lock();
        if on {
            state.write_back = state.write_back.saturating_add(1);
            trace!(depth = state.write_back, "write_back_enable");
            return Ok(());
        }
        if state.write_back == 0 {
            warn!("write_back_disable_unbalanced");
            return Ok(());
        }
        state.write_back -= 1;
        trace!(depth = state.write_back, "write_back_disable");
        if state.write_back == 0 {
            self.flush_locked(&mut state)?;
        }
        Ok(())
    }

    /// Enter write-back mode for the lifetime of the returned guard.
    pub fn write_back_guard(&self) -> WriteBackGuard<'_, D> {
        let _ = self.set_write_back(true);
        WriteBackGuard {
            cache: self,
            active: true,
        }
    }

    fn flush_locked(&self, state: &mut CacheState) -> Result<()> {
        let pending: Vec<BlockNumber> = state.dirty.iter().copied().collect();
        if pending.is_empty() {
            return Ok(());
        }
        debug!(blocks = pending.len(), "cache_flush");
        for block in pending {
            if let Some(bytes) = state.arc.resident.get(&block) {
                self.inner.write_block(block, bytes)?;
                state.stats.writebacks += 1;
            }
            state.dirty.remove(&block);
        }
        Ok(())
    }

    /// Write every dirty block to the device. Write-back mode is unchanged.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)
    }

    /// Read consecutive blocks straight from the device, overlaying any
    /// resident copy so unflushed writes are visible.
    pub fn blocks_get_direct(&self, start: BlockNumber, buf: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        self.inner.read_blocks(start, buf)?;
        let bs = self.block_len()?;
        for (i, chunk) in buf.chunks_exact_mut(bs).enumerate() {
            let block = BlockNumber(start.0 + i as u64);
            if let Some(bytes) = state.arc.resident.get(&block) {
                chunk.copy_from_slice(bytes);
            }
        }
        drop(state);
        Ok(())
    }

    /// Write consecutive blocks straight to the device. Resident copies are
    /// refreshed and their dirty state cleared.
    pub fn blocks_set_direct(&self, start: BlockNumber, buf: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        self.inner.write_blocks(start, buf)?;
        let bs = self.block_len()?;
        for (i, chunk) in buf.chunks_exact(bs).enumerate() {
            let block = BlockNumber(start.0 + i as u64);
            if let Some(bytes) = state.arc.resident.get_mut(&block) {
                bytes.copy_from_slice(chunk);
                state.dirty.remove(&block);
            }
        }
        drop(state);
        Ok(())
    }

    fn block_len(&self) -> Result<usize> {
        usize::try_from(self.inner.block_size())
            .map_err(|_| DnxError::InvalidArgument("block_size does not fit usize".to_owned()))
    }
}

impl<D: BlockDevice> BlockDevice for BlockCache<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let mut state = self.state.lock();
        if let Some(bytes) = state.arc.resident.get(&block).cloned() {
            state.arc.on_hit(block);
            state.stats.hits += 1;
            drop(state);
            return Ok(BlockBuf::new(bytes));
        }

        let buf = self.inner.read_block(block)?;
        state.stats.misses += 1;
        state.arc.admit(block, buf.as_slice().to_vec());
        self.drain_evicted(&mut state)?;
        drop(state);
        Ok(buf)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if u64::try_from(data.len()).ok() != Some(u64::from(self.inner.block_size())) {
            return Err(DnxError::InvalidArgument(format!(
                "write_block data size mismatch: got={} expected={}",
                data.len(),
                self.inner.block_size()
            )));
        }
        let mut state = self.state.lock();
        if state.write_back == 0 {
            self.inner.write_block(block, data)?;
            state.dirty.remove(&block);
        } else {
            state.dirty.insert(block);
        }
        state.arc.admit(block, data.to_vec());
        self.drain_evicted(&mut state)?;
        drop(state);
        Ok(())
    }

    fn read_blocks(&self, start: BlockNumber, buf: &mut [u8]) -> Result<()> {
        self.blocks_get_direct(start, buf)
    }

    fn write_blocks(&self, start: BlockNumber, buf: &[u8]) -> Result<()> {
        self.blocks_set_direct(start, buf)
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn sync(&self) -> Result<()> {
        self.flush()?;
        self.inner.sync()
    }
}

/// Scoped write-back section.
///
/// Created by [`BlockCache::write_back_guard`]. Call [`WriteBackGuard::finish`]
/// to observe the flush result; dropping an unfinished guard still leaves
/// write-back mode and logs a failed flush.
#[must_use = "dropping the guard immediately leaves write-back mode"]
pub struct WriteBackGuard<'a, D: BlockDevice> {
    cache: &'a BlockCache<D>,
    active: bool,
}

impl<D: BlockDevice> WriteBackGuard<'_, D> {
    pub fn finish(mut self) -> Result<()> {
        self.active = false;
        self.cache.set_write_back(false)
    }
}

impl<D: BlockDevice> Drop for WriteBackGuard<'_, D> {
    fn drop(&mut self) {
        if self.active {
            self.active = false;
            if let Err(err) = self.cache.set_write_back(false) {
                warn!(error = %err, "write_back_guard_flush_failed");
            }
        }
    }
}
