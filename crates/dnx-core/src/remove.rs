#![forbid(unsafe_code)]
//! File removal, recursive directory removal and rename.

use crate::Volume;
use crate::handle::OpenFlags;
use crate::link::has_children;
use crate::lock::Locked;
use crate::path::{Expect, final_component, parent_path};
use dnx_error::{DnxError, Result};
use dnx_inode::now;
use dnx_ondisk::Ext2FileType;
use dnx_types::InodeNumber;
use tracing::{debug, trace};

impl Locked<'_> {
    /// Truncate, unlink and free the non-directory at `path`.
    fn remove_file(&self, path: &str) -> Result<()> {
        let name = final_component(path)?;
        let opened = self.generic_open(path, OpenFlags::RDONLY, Expect::File)?;
        let fs = self.fs();
        let mut parent = fs.get_inode_ref(opened.parent)?;
        let mut child = fs.get_inode_ref(opened.file.inode)?;
        child.truncate(0)?;
        self.unlink(&mut parent, &mut child, name)?;
        fs.free_inode(child)?;
        parent.put()?;
        debug!(path, "fremove");
        Ok(())
    }

    /// Post-order removal of the tree rooted at `root`, entered in `up` as
    /// `name`.
    ///
    /// No explicit stack: descending records the directory being left as
    /// the parent, and each directory's `..` entry restores the parent when
    /// its scan restarts. `depth` counts levels below `up` still open.
    fn remove_tree(&self, root: InodeNumber, up: InodeNumber, name: &[u8]) -> Result<()> {
        let fs = self.fs();
        let mut current = root;
        let mut inode_up = up;
        let mut depth = 1_u32;

        while depth > 0 {
            let mut dir = fs.get_inode_ref(current)?;
            let mut descended = false;
            for entry in dir.dir_iter()? {
                let entry = entry?;
                if entry.is_dotdot() {
                    inode_up = InodeNumber(entry.inode);
                    continue;
                }
                if entry.is_dot() {
                    continue;
                }
                let mut child = fs.get_inode_ref(InodeNumber(entry.inode))?;
                if has_children(&child)? {
                    inode_up = current;
                    current = child.index();
                    depth += 1;
                    child.put()?;
                    descended = true;
                    break;
                }
                child.truncate(0)?;
                self.unlink(&mut dir, &mut child, &entry.name)?;
                fs.free_inode(child)?;
                trace!(dir = dir.index().0, name = %entry.name_str(), "tree_unlink");
            }

            if descended {
                dir.put()?;
                continue;
            }
            if has_children(&dir)? {
                dir.put()?;
                continue;
            }

            depth -= 1;
            if depth == 0 {
                let mut parent = fs.get_inode_ref(inode_up)?;
                dir.truncate(0)?;
                self.unlink(&mut parent, &mut dir, name)?;
                fs.free_inode(dir)?;
                parent.put()?;
            } else {
                dir.put()?;
                current = inode_up;
            }
        }
        Ok(())
    }

    /// Whether `ancestor` lies on the `..` chain from `start` to the root.
    fn is_ancestor(&self, ancestor: InodeNumber, start: InodeNumber) -> Result<bool> {
        let fs = self.fs();
        let limit = fs.superblock().inodes_count;
        let mut cursor = start;
        for _ in 0..limit {
            if cursor == ancestor {
                return Ok(true);
            }
            if cursor == InodeNumber::ROOT {
                return Ok(false);
            }
            let dir = fs.get_inode_ref(cursor)?;
            let up = dir
                .dir_find_entry(b"..")?
                .ok_or_else(|| DnxError::Corruption {
                    block: 0,
                    detail: format!("directory {cursor} has no .. entry"),
                })?;
            dir.put()?;
            cursor = InodeNumber(up.inode);
        }
        Err(DnxError::Corruption {
            block: 0,
            detail: format!(".. chain from {start} does not reach the root"),
        })
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let old_name = final_component(from)?;
        let new_name = final_component(to)?;
        let moved = self.generic_open(from, OpenFlags::RDONLY, Expect::Any)?;
        let target = self.generic_open(parent_path(to), OpenFlags::RDONLY, Expect::Directory)?;
        let (ino, old_parent, new_parent) = (moved.file.inode, moved.parent, target.file.inode);

        let fs = self.fs();
        let child = fs.get_inode_ref(ino)?;
        let is_dir = child.inode().is_dir();
        let kind = Ext2FileType::from_mode(child.inode().mode);
        child.put()?;
        if is_dir && self.is_ancestor(ino, new_parent)? {
            return Err(DnxError::InvalidArgument(format!(
                "cannot move {from:?} into its own subtree"
            )));
        }

        if old_parent == new_parent {
            let mut dir = fs.get_inode_ref(old_parent)?;
            if dir.dir_find_entry(new_name)?.is_some() {
                return Err(DnxError::Exists);
            }
            dir.dir_add_entry(new_name, ino, kind)?;
            dir.dir_remove_entry(old_name)?;
            dir.put()?;
        } else {
            let mut dst = fs.get_inode_ref(new_parent)?;
            if dst.dir_find_entry(new_name)?.is_some() {
                return Err(DnxError::Exists);
            }
            let mut src = fs.get_inode_ref(old_parent)?;
            dst.dir_add_entry(new_name, ino, kind)?;
            if let Err(err) = src.dir_remove_entry(old_name) {
                dst.dir_remove_entry(new_name)?;
                return Err(err);
            }
            if is_dir {
                let mut child = fs.get_inode_ref(ino)?;
                child.dir_retarget_entry(b"..", new_parent)?;
                child.put()?;
                let links = src.inode().links_count;
                src.inode_mut().links_count = links.saturating_sub(1);
                let links = dst.inode().links_count;
                dst.inode_mut().links_count = links.saturating_add(1);
                src.mark_dirty();
                dst.mark_dirty();
            }
            src.put()?;
            dst.put()?;
        }

        let mut child = fs.get_inode_ref(ino)?;
        child.inode_mut().ctime = now();
        child.mark_dirty();
        child.put()?;
        debug!(from, to, ino = ino.0, "rename");
        Ok(())
    }
}

impl Volume {
    /// Remove the file at `path`.
    ///
    /// Directories are not found by this path; use [`Volume::dir_rm`].
    pub fn fremove(&self, path: &str) -> Result<()> {
        let cx = self.enter()?;
        let guard = cx.fs().write_back_guard();
        let result = cx.remove_file(path);
        let flushed = guard.finish();
        result?;
        flushed
    }

    /// Remove the directory at `path` and everything beneath it.
    pub fn dir_rm(&self, path: &str) -> Result<()> {
        let cx = self.enter()?;
        let name = final_component(path)?;
        let opened = cx.generic_open(path, OpenFlags::RDONLY, Expect::Directory)?;
        let guard = cx.fs().write_back_guard();
        let result = cx.remove_tree(opened.file.inode, opened.parent, name);
        let flushed = guard.finish();
        result?;
        flushed?;
        debug!(path, "dir_rm");
        Ok(())
    }

    /// Move the entry at `from` to `to`. An existing `to` is not replaced.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let cx = self.enter()?;
        let guard = cx.fs().write_back_guard();
        let result = cx.rename(from, to);
        let flushed = guard.finish();
        result?;
        flushed
    }
}
