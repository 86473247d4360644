#![forbid(unsafe_code)]
//! Directory entry insertion and removal with dot entries and link counts.

use crate::lock::Locked;
use dnx_error::{DnxError, Result};
use dnx_inode::{InodeRef, now};
use dnx_ondisk::Ext2FileType;
use dnx_types::{EXT2_INDEX_FL, EXT2_NAME_LEN};
use tracing::{debug, warn};

/// Whether `dir` is a directory holding anything besides `.` and `..`.
pub(crate) fn has_children(dir: &InodeRef<'_>) -> Result<bool> {
    if !dir.inode().is_dir() {
        return Ok(false);
    }
    for entry in dir.dir_iter()? {
        if !entry?.is_dots() {
            return Ok(true);
        }
    }
    Ok(false)
}

fn undo(dir: &mut InodeRef<'_>, name: &[u8]) {
    if let Err(err) = dir.dir_remove_entry(name) {
        warn!(
            ino = dir.index().0,
            name = %String::from_utf8_lossy(name),
            error = %err,
            "link_rollback_failed"
        );
    }
}

impl Locked<'_> {
    /// Enter `child` into `parent` as `name`.
    ///
    /// A directory child also gets `.` and `..` and, when enabled at mount
    /// and supported by the volume, a directory index. Each step is undone
    /// if a later one fails.
    pub(crate) fn link(
        &self,
        parent: &mut InodeRef<'_>,
        child: &mut InodeRef<'_>,
        name: &[u8],
    ) -> Result<()> {
        if name.len() > EXT2_NAME_LEN {
            return Err(DnxError::InvalidArgument(format!(
                "name of {} bytes exceeds {EXT2_NAME_LEN}",
                name.len()
            )));
        }
        let kind = Ext2FileType::from_mode(child.inode().mode);
        parent.dir_add_entry(name, child.index(), kind)?;

        if child.inode().is_dir() {
            let me = child.index();
            if let Err(err) = child.dir_add_entry(b".", me, Ext2FileType::Dir) {
                undo(parent, name);
                return Err(err);
            }
            if let Err(err) = child.dir_add_entry(b"..", parent.index(), Ext2FileType::Dir) {
                undo(child, b".");
                undo(parent, name);
                return Err(err);
            }
            if self.vol.dir_index && self.fs().has_dir_index() {
                if let Err(err) = child.dir_dx_init(parent.index()) {
                    undo(child, b"..");
                    undo(child, b".");
                    undo(parent, name);
                    return Err(err);
                }
                child.inode_mut().flags |= EXT2_INDEX_FL;
            }
            child.inode_mut().links_count = 2;
            let links = parent.inode().links_count;
            parent.inode_mut().links_count = links.saturating_add(1);
        } else {
            let links = child.inode().links_count;
            child.inode_mut().links_count = links.max(1);
        }

        parent.mark_dirty();
        child.mark_dirty();
        debug!(
            parent = parent.index().0,
            child = child.index().0,
            name = %String::from_utf8_lossy(name),
            "link"
        );
        Ok(())
    }

    /// Remove `name -> child` from `parent` and mark `child` reclaimable.
    ///
    /// The inode itself is not freed; callers follow up with
    /// [`Ext2Fs::free_inode`](dnx_inode::Ext2Fs::free_inode).
    pub(crate) fn unlink(
        &self,
        parent: &mut InodeRef<'_>,
        child: &mut InodeRef<'_>,
        name: &[u8],
    ) -> Result<()> {
        if has_children(child)? {
            return Err(DnxError::NotSupported(format!(
                "directory {} is not empty",
                child.index()
            )));
        }
        parent.dir_remove_entry(name)?;
        if child.inode().is_dir() {
            let links = parent.inode().links_count;
            parent.inode_mut().links_count = links.saturating_sub(1);
        }

        let stamp = now();
        let p = parent.inode_mut();
        p.ctime = stamp;
        p.mtime = stamp;
        parent.mark_dirty();

        let c = child.inode_mut();
        c.dtime = stamp;
        c.links_count = 0;
        child.mark_dirty();
        debug!(
            parent = parent.index().0,
            child = child.index().0,
            name = %String::from_utf8_lossy(name),
            "unlink"
        );
        Ok(())
    }
}
