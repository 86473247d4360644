#![forbid(unsafe_code)]
//! Block-aligned, batched file reads and writes.
//!
//! A transfer is split into an unaligned head, a run of whole blocks and an
//! unaligned tail. Whole blocks are coalesced into runs of physically
//! contiguous blocks and moved with one direct multi-block transfer per run.

use crate::handle::{FileHandle, OpenFlags};
use crate::lock::Locked;
use crate::Volume;
use dnx_error::{DnxError, Result};
use dnx_inode::{InodeRef, now};
use dnx_types::BlockNumber;
use tracing::trace;

/// Physically contiguous blocks awaiting one direct transfer.
#[derive(Debug, Clone, Copy)]
struct Run {
    start: BlockNumber,
    count: u64,
}

impl Run {
    /// Extend with `block` when it directly follows the run.
    fn extend(&mut self, block: BlockNumber) -> bool {
        if self.start.0 + self.count == block.0 {
            self.count += 1;
            true
        } else {
            false
        }
    }
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| DnxError::InvalidArgument(format!("length {value} overflows usize")))
}

impl Locked<'_> {
    fn block_size(&self) -> u64 {
        u64::from(self.fs().block_size())
    }

    /// Copy part of logical block `lb` into `out`. Holes read as zeros.
    fn read_partial(&self, iref: &InodeRef<'_>, lb: u64, at: usize, out: &mut [u8]) -> Result<()> {
        match iref.data_block(lb)? {
            Some(block) => {
                let buf = self.fs().block_get(block)?;
                out.copy_from_slice(&buf.as_slice()[at..at + out.len()]);
            }
            None => out.fill(0),
        }
        Ok(())
    }

    pub(crate) fn read(&self, file: &mut FileHandle, buf: &mut [u8]) -> Result<usize> {
        if file.flags.contains(OpenFlags::WRONLY) {
            return Err(DnxError::NotPermitted);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let fs = self.fs();
        let iref = fs.get_inode_ref(file.inode)?;
        file.fsize = iref.inode().size;

        let bs = self.block_size();
        let bs_len = to_usize(bs)?;
        let remaining = file.fsize.saturating_sub(file.fpos);
        let want = to_usize(remaining.min(buf.len() as u64))?;
        let buf = &mut buf[..want];
        let mut done = 0_usize;
        let mut lb = file.fpos / bs;

        let head = to_usize(file.fpos % bs)?;
        if head != 0 && want > 0 {
            let n = (bs_len - head).min(want);
            self.read_partial(&iref, lb, head, &mut buf[..n])?;
            done += n;
            file.fpos += n as u64;
            lb += 1;
        }

        let whole = ((want - done) / bs_len) as u64;
        let mut run: Option<Run> = None;
        for lb in lb..lb + whole {
            let mapped = iref.data_block(lb)?;
            if let (Some(r), Some(block)) = (run.as_mut(), mapped) {
                if r.extend(block) {
                    continue;
                }
            }
            if let Some(r) = run.take() {
                done += self.read_run(r, &mut buf[done..])?;
                file.fpos += r.count * bs;
            }
            match mapped {
                Some(block) => run = Some(Run { start: block, count: 1 }),
                None => {
                    buf[done..done + bs_len].fill(0);
                    done += bs_len;
                    file.fpos += bs;
                }
            }
        }
        if let Some(r) = run.take() {
            done += self.read_run(r, &mut buf[done..])?;
            file.fpos += r.count * bs;
        }
        lb += whole;

        if done < want {
            let n = want - done;
            self.read_partial(&iref, lb, 0, &mut buf[done..])?;
            done += n;
            file.fpos += n as u64;
        }

        iref.put()?;
        trace!(ino = file.inode.0, len = done, pos = file.fpos, "fread");
        Ok(done)
    }

    fn read_run(&self, run: Run, out: &mut [u8]) -> Result<usize> {
        let len = to_usize(run.count * self.block_size())?;
        self.fs().blocks_get_direct(run.start, &mut out[..len])?;
        trace!(start = run.start.0, count = run.count, "read_run");
        Ok(len)
    }

    fn write_run(&self, run: Run, data: &[u8]) -> Result<usize> {
        let len = to_usize(run.count * self.block_size())?;
        self.fs().blocks_set_direct(run.start, &data[..len])?;
        trace!(start = run.start.0, count = run.count, "write_run");
        Ok(len)
    }

    /// Physical block for logical `lb` of a file that had `file_blocks`
    /// blocks before this write.
    fn block_for_write(
        iref: &mut InodeRef<'_>,
        lb: u64,
        file_blocks: u64,
    ) -> Result<BlockNumber> {
        if lb < file_blocks {
            iref.ensure_block(lb)
        } else {
            Ok(iref.append_block()?.1)
        }
    }

    pub(crate) fn write(&self, file: &mut FileHandle, buf: &[u8]) -> Result<usize> {
        if file.flags == OpenFlags::RDONLY {
            return Err(DnxError::NotPermitted);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let fs = self.fs();
        let mut iref = fs.get_inode_ref(file.inode)?;
        file.fsize = iref.inode().size;
        if file.fpos > file.fsize {
            return Err(DnxError::InvalidArgument(format!(
                "position {} past end of file {}",
                file.fpos, file.fsize
            )));
        }

        let old_size = file.fsize;
        let start = file.fpos;
        let written = self.write_blocks(&mut iref, file, buf);
        let fixed = self.settle_size(&mut iref, old_size, file.fpos.max(old_size));
        if file.fpos > start {
            iref.inode_mut().mtime = now();
            iref.mark_dirty();
        }
        file.fsize = iref.inode().size;
        let put = iref.put();

        let written = written?;
        fixed?;
        put?;
        trace!(ino = file.inode.0, len = written, pos = file.fpos, "fwrite");
        Ok(written)
    }

    /// Make the inode size exactly `end`, releasing blocks appended past it.
    fn settle_size(&self, iref: &mut InodeRef<'_>, old_size: u64, end: u64) -> Result<()> {
        let bs = self.block_size();
        let size = iref.inode().size;
        if size.div_ceil(bs) > end.div_ceil(bs) {
            iref.truncate(end)?;
        } else if size != end {
            iref.set_size(end);
        }
        if end != old_size {
            trace!(ino = iref.index().0, from = old_size, to = end, "size_settle");
        }
        Ok(())
    }

    fn write_blocks(&self, iref: &mut InodeRef<'_>, file: &mut FileHandle, buf: &[u8]) -> Result<usize> {
        let fs = self.fs();
        let bs = self.block_size();
        let bs_len = to_usize(bs)?;
        let file_blocks = file.fsize.div_ceil(bs);
        let mut done = 0_usize;
        let mut lb = file.fpos / bs;

        let head = to_usize(file.fpos % bs)?;
        if head != 0 {
            let n = (bs_len - head).min(buf.len());
            let block = Self::block_for_write(iref, lb, file_blocks)?;
            let mut data = fs.block_get(block)?.into_inner();
            data[head..head + n].copy_from_slice(&buf[..n]);
            fs.block_set(block, &data)?;
            done += n;
            file.fpos += n as u64;
            lb += 1;
        }

        let whole = ((buf.len() - done) / bs_len) as u64;
        if whole > 0 {
            let guard = fs.write_back_guard();
            let bulk = self.write_bulk(iref, file, &buf[done..], lb, whole, file_blocks);
            let flushed = guard.finish();
            done += bulk?;
            flushed?;
            lb += whole;
        }

        if done < buf.len() {
            let n = buf.len() - done;
            let fresh = lb >= file_blocks;
            let block = Self::block_for_write(iref, lb, file_blocks)?;
            let mut data = if fresh {
                vec![0_u8; bs_len]
            } else {
                fs.block_get(block)?.into_inner()
            };
            data[..n].copy_from_slice(&buf[done..]);
            fs.block_set(block, &data)?;
            done += n;
            file.fpos += n as u64;
        }
        Ok(done)
    }

    fn write_bulk(
        &self,
        iref: &mut InodeRef<'_>,
        file: &mut FileHandle,
        data: &[u8],
        first: u64,
        count: u64,
        file_blocks: u64,
    ) -> Result<usize> {
        let bs = self.block_size();
        let mut done = 0_usize;
        let mut run: Option<Run> = None;
        for lb in first..first + count {
            let block = Self::block_for_write(iref, lb, file_blocks)?;
            if let Some(r) = run.as_mut() {
                if r.extend(block) {
                    continue;
                }
            }
            if let Some(r) = run.take() {
                done += self.write_run(r, &data[done..])?;
                file.fpos += r.count * bs;
            }
            run = Some(Run { start: block, count: 1 });
        }
        if let Some(r) = run.take() {
            done += self.write_run(r, &data[done..])?;
            file.fpos += r.count * bs;
        }
        Ok(done)
    }
}

impl Volume {
    /// Read up to `buf.len()` bytes at the handle position.
    ///
    /// Fails with [`DnxError::NotPermitted`] on a write-only handle. Returns
    /// the byte count, short only at end of file.
    pub fn fread(&self, file: &mut FileHandle, buf: &mut [u8]) -> Result<usize> {
        self.enter()?.read(file, buf)
    }

    /// Write `buf` at the handle position, growing the file as needed.
    ///
    /// Fails with [`DnxError::NotPermitted`] when the handle was opened with
    /// exactly `RDONLY`.
    pub fn fwrite(&self, file: &mut FileHandle, buf: &[u8]) -> Result<usize> {
        self.enter()?.write(file, buf)
    }
}
