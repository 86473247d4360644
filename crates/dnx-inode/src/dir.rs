#![forbid(unsafe_code)]
//! Directory operations on inode references: iteration, lookup and
//! linear insertion, removal and retargeting of entries.

use crate::{Ext2Fs, InodeRef, corrupt_at, now, with_block};
use dnx_block::BlockDevice;
use dnx_error::{DnxError, Result};
use dnx_ondisk::{Ext2DirEntry, Ext2FileType, Ext2Inode, parse_dir_block};
use dnx_types::{EXT2_INDEX_FL, InodeNumber};
use tracing::{debug, trace, warn};

/// Iterator over the live entries of a directory, one block at a time.
///
/// Works on a snapshot of the directory inode taken at creation. Holes
/// yield nothing; a corrupt block yields one error and ends iteration.
pub struct DirIter<'a> {
    fs: &'a Ext2Fs,
    ino: InodeNumber,
    inode: Ext2Inode,
    next_lb: u64,
    block_count: u64,
    pending: std::vec::IntoIter<Ext2DirEntry>,
    filetype: bool,
    failed: bool,
}

impl std::fmt::Debug for DirIter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirIter")
            .field("ino", &self.ino)
            .field("next_lb", &self.next_lb)
            .field("block_count", &self.block_count)
            .finish_non_exhaustive()
    }
}

impl DirIter<'_> {
    fn load(&self, lb: u64) -> Result<Vec<Ext2DirEntry>> {
        let Some(block) = self.fs.map_block(&self.inode, lb)? else {
            return Ok(Vec::new());
        };
        let buf = self.fs.cache.read_block(block)?;
        trace!(ino = self.ino.0, lb, block = block.0, "dir_block_read");
        parse_dir_block(buf.as_slice(), self.filetype).map_err(|e| corrupt_at(block, &e))
    }
}

impl Iterator for DirIter<'_> {
    type Item = Result<Ext2DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.pending.next() {
                return Some(Ok(entry));
            }
            if self.failed || self.next_lb >= self.block_count {
                return None;
            }
            let lb = self.next_lb;
            self.next_lb += 1;
            match self.load(lb) {
                Ok(entries) => self.pending = entries.into_iter(),
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

impl<'a> InodeRef<'a> {
    fn require_dir(&self) -> Result<()> {
        if self.inode.is_dir() {
            Ok(())
        } else {
            Err(DnxError::NotDirectory)
        }
    }

    fn dir_block_count(&self) -> u64 {
        self.inode.size.div_ceil(u64::from(self.fs.block_size()))
    }

    fn touch_dir(&mut self) {
        let stamp = now();
        self.inode.mtime = stamp;
        self.inode.ctime = stamp;
        self.dirty = true;
    }

    /// Iterate the live entries of this directory.
    pub fn dir_iter(&self) -> Result<DirIter<'a>> {
        self.require_dir()?;
        Ok(DirIter {
            fs: self.fs,
            ino: self.index,
            inode: self.inode.clone(),
            next_lb: 0,
            block_count: self.dir_block_count(),
            pending: Vec::new().into_iter(),
            filetype: self.fs.has_filetype(),
            failed: false,
        })
    }

    /// Look up `name` among the live entries.
    pub fn dir_find_entry(&self, name: &[u8]) -> Result<Option<Ext2DirEntry>> {
        for entry in self.dir_iter()? {
            let entry = entry?;
            if entry.name == name {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Apply `op` to each mapped block in turn until it reports a hit.
    /// Modified blocks are written back.
    fn edit_blocks<F>(&mut self, mut op: F) -> Result<bool>
    where
        F: FnMut(&mut [u8]) -> Result<bool>,
    {
        for lb in 0..self.dir_block_count() {
            let Some(block) = self.data_block(lb)? else {
                continue;
            };
            let mut buf = self.fs.cache.read_block(block)?.into_inner();
            if op(&mut buf).map_err(|e| with_block(e, block))? {
                self.fs.cache.write_block(block, &buf)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Insert `name -> child` into this directory.
    ///
    /// Fills the first block with room, otherwise appends a block. Indexed
    /// insertion is not implemented, so a directory index is dropped first.
    pub fn dir_add_entry(
        &mut self,
        name: &[u8],
        child: InodeNumber,
        file_type: Ext2FileType,
    ) -> Result<()> {
        self.require_dir()?;
        let filetype = self.fs.has_filetype();
        if self.inode.flags & EXT2_INDEX_FL != 0 {
            self.inode.flags &= !EXT2_INDEX_FL;
            self.dirty = true;
            warn!(ino = self.index.0, "dir_index_dropped");
        }

        let placed = self.edit_blocks(|buf| {
            match dnx_dir::add_entry(buf, child.0, name, file_type, filetype) {
                Ok(_) => Ok(true),
                Err(DnxError::NoSpace) => Ok(false),
                Err(err) => Err(err),
            }
        })?;

        if !placed {
            let (lb, block) = self.append_block()?;
            let mut buf = vec![0_u8; self.fs.block_size() as usize];
            dnx_dir::init_empty_block(&mut buf, filetype)?;
            dnx_dir::add_entry(&mut buf, child.0, name, file_type, filetype)
                .map_err(|e| with_block(e, block))?;
            self.fs.cache.write_block(block, &buf)?;
            debug!(ino = self.index.0, lb, block = block.0, "dir_grow");
        }

        self.touch_dir();
        trace!(ino = self.index.0, child = child.0, "dir_add_entry");
        Ok(())
    }

    /// Remove the live entry called `name`.
    pub fn dir_remove_entry(&mut self, name: &[u8]) -> Result<()> {
        self.require_dir()?;
        let filetype = self.fs.has_filetype();
        if !self.edit_blocks(|buf| dnx_dir::remove_entry(buf, name, filetype))? {
            return Err(DnxError::NotFound(String::from_utf8_lossy(name).into_owned()));
        }
        self.touch_dir();
        trace!(ino = self.index.0, "dir_remove_entry");
        Ok(())
    }

    /// Point the entry called `name` at `target`.
    pub fn dir_retarget_entry(&mut self, name: &[u8], target: InodeNumber) -> Result<()> {
        self.require_dir()?;
        let filetype = self.fs.has_filetype();
        if !self.edit_blocks(|buf| dnx_dir::retarget_entry(buf, name, target.0, filetype))? {
            return Err(DnxError::NotFound(String::from_utf8_lossy(name).into_owned()));
        }
        self.touch_dir();
        Ok(())
    }

    /// Turn a freshly created directory into an indexed one: block 0 becomes
    /// the index root and an empty leaf is appended as block 1.
    ///
    /// The caller sets `INDEX_FL`.
    pub fn dir_dx_init(&mut self, parent: InodeNumber) -> Result<()> {
        self.require_dir()?;
        let filetype = self.fs.has_filetype();
        let hash_version = self.fs.state.lock().sb.def_hash_version;
        let bs = self.fs.block_size() as usize;

        let root = self.data_block(0)?.ok_or_else(|| DnxError::Corruption {
            block: 0,
            detail: format!("directory {} has no first block", self.index),
        })?;
        let mut buf = vec![0_u8; bs];
        dnx_dir::init_dx_root(&mut buf, self.index.0, parent.0, hash_version, filetype)
            .map_err(|e| with_block(e, root))?;
        self.fs.cache.write_block(root, &buf)?;

        let (_, leaf) = self.append_block()?;
        dnx_dir::init_empty_block(&mut buf, filetype).map_err(|e| with_block(e, leaf))?;
        self.fs.cache.write_block(leaf, &buf)?;
        debug!(ino = self.index.0, root = root.0, leaf = leaf.0, "dir_dx_init");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fresh_fs;

    fn names(dir: &InodeRef<'_>) -> Vec<String> {
        dir.dir_iter()
            .unwrap()
            .map(|e| e.unwrap().name_str())
            .collect()
    }

    #[test]
    fn root_lists_dot_entries() {
        let fs = fresh_fs(1024, 2048);
        let root = fs.get_inode_ref(InodeNumber::ROOT).unwrap();
        assert_eq!(names(&root), vec![".", ".."]);
        let dotdot = root.dir_find_entry(b"..").unwrap().unwrap();
        assert_eq!(dotdot.inode, 2);
        assert_eq!(dotdot.file_type, Ext2FileType::Dir);
    }

    #[test]
    fn add_find_remove_entry() {
        let fs = fresh_fs(1024, 2048);
        let mut root = fs.get_inode_ref(InodeNumber::ROOT).unwrap();
        root.dir_add_entry(b"hello", InodeNumber(12), Ext2FileType::RegFile)
            .unwrap();
        let found = root.dir_find_entry(b"hello").unwrap().unwrap();
        assert_eq!(found.inode, 12);
        assert_eq!(found.file_type, Ext2FileType::RegFile);
        assert!(root.is_dirty());

        root.dir_retarget_entry(b"hello", InodeNumber(13)).unwrap();
        assert_eq!(root.dir_find_entry(b"hello").unwrap().unwrap().inode, 13);

        root.dir_remove_entry(b"hello").unwrap();
        assert!(root.dir_find_entry(b"hello").unwrap().is_none());
        assert!(matches!(
            root.dir_remove_entry(b"hello"),
            Err(DnxError::NotFound(_))
        ));
    }

    #[test]
    fn full_directory_grows_by_one_block() {
        let fs = fresh_fs(1024, 2048);
        let mut root = fs.get_inode_ref(InodeNumber::ROOT).unwrap();
        let name = [b'n'; 200];
        for i in 0..8_u8 {
            let mut n = name;
            n[0] = b'a' + i;
            root.dir_add_entry(&n, InodeNumber(12), Ext2FileType::RegFile)
                .unwrap();
        }
        assert_eq!(root.inode().size, 2 * 1024);
        assert_eq!(root.inode().blocks, 4);
        assert_eq!(names(&root).len(), 10);
    }

    #[test]
    fn file_is_not_a_directory() {
        let fs = fresh_fs(1024, 2048);
        let mut file = fs.alloc_inode(InodeNumber::ROOT, false).unwrap();
        assert!(matches!(file.dir_iter(), Err(DnxError::NotDirectory)));
        assert!(matches!(
            file.dir_add_entry(b"x", InodeNumber(2), Ext2FileType::Dir),
            Err(DnxError::NotDirectory)
        ));
        file.discard();
    }

    #[test]
    fn overlong_name_is_rejected() {
        let fs = fresh_fs(1024, 2048);
        let mut root = fs.get_inode_ref(InodeNumber::ROOT).unwrap();
        let long = vec![b'x'; 256];
        assert!(matches!(
            root.dir_add_entry(&long, InodeNumber(12), Ext2FileType::RegFile),
            Err(DnxError::NameTooLong)
        ));
        assert_eq!(root.inode().size, 1024);
    }

    #[test]
    fn dx_init_builds_root_and_leaf() {
        let fs = fresh_fs(1024, 2048);
        let mut dir = fs.alloc_inode(InodeNumber::ROOT, true).unwrap();
        let ino = dir.index();
        dir.dir_add_entry(b".", ino, Ext2FileType::Dir).unwrap();
        dir.dir_add_entry(b"..", InodeNumber::ROOT, Ext2FileType::Dir)
            .unwrap();
        dir.dir_dx_init(InodeNumber::ROOT).unwrap();
        assert_eq!(dir.inode().size, 2048);
        assert_eq!(names(&dir), vec![".", ".."]);

        let root = dir.data_block(0).unwrap().unwrap();
        let raw = fs.block_get(root).unwrap();
        // dx count/limit header follows the 8-byte root info.
        assert_eq!(u16::from_le_bytes([raw.as_slice()[34], raw.as_slice()[35]]), 1);

        dir.inode_mut().flags |= EXT2_INDEX_FL;
        dir.dir_add_entry(b"f", InodeNumber(12), Ext2FileType::RegFile)
            .unwrap();
        assert_eq!(dir.inode().flags & EXT2_INDEX_FL, 0);
        assert!(dir.dir_find_entry(b"f").unwrap().is_some());
        dir.put().unwrap();
    }
}
