#![forbid(unsafe_code)]
//! Path resolution and the generic open used by every by-path operation.

use crate::handle::{FileHandle, OpenFlags};
use crate::lock::Locked;
use dnx_error::{DnxError, Result};
use dnx_inode::{InodeRef, now};
use dnx_types::{EXT2_NAME_LEN, InodeNumber};
use tracing::{debug, trace, warn};

/// What the goal component must be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expect {
    /// Anything but a directory; created as a regular file.
    File,
    /// Anything but a regular file; created as a directory.
    Directory,
    /// No type check; created as a regular file.
    Any,
}

/// Result of [`Locked::generic_open`].
#[derive(Debug)]
pub(crate) struct Opened {
    pub(crate) file: FileHandle,
    /// Directory holding the goal (root for the root itself).
    pub(crate) parent: InodeNumber,
}

/// Split `path` into components. A leading `/` is dropped and the root
/// itself is a single empty component.
pub(crate) fn components(path: &str) -> Result<Vec<&[u8]>> {
    let rest = path.strip_prefix('/').unwrap_or(path);
    let parts: Vec<&[u8]> = rest.split('/').map(str::as_bytes).collect();
    if parts.iter().any(|p| p.len() > EXT2_NAME_LEN) {
        return Err(DnxError::NameTooLong);
    }
    Ok(parts)
}

/// Last non-empty component of `path`, refusing the root and dot names.
pub(crate) fn final_component(path: &str) -> Result<&[u8]> {
    let name = path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .as_bytes();
    if name.is_empty() || name == b"." || name == b".." {
        return Err(DnxError::InvalidArgument(format!(
            "path {path:?} does not name a removable entry"
        )));
    }
    if name.len() > EXT2_NAME_LEN {
        return Err(DnxError::NameTooLong);
    }
    Ok(name)
}

/// Everything before the last component (`/` for top-level names).
pub(crate) fn parent_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/",
        Some(at) => &trimmed[..at],
    }
}

fn not_found(path: &str) -> DnxError {
    DnxError::NotFound(path.to_owned())
}

impl<'v> Locked<'v> {
    /// Walk `path` from the root.
    ///
    /// With `CREAT`, every missing component is created: intermediate ones
    /// as directories, the goal as `expect` asks. At the goal, `expect`
    /// rejects a directory where a file is wanted and a regular file where
    /// a directory is wanted, both as not-found.
    pub(crate) fn generic_open(
        &self,
        path: &str,
        flags: OpenFlags,
        expect: Expect,
    ) -> Result<Opened> {
        let fs = self.fs();
        let parts = components(path)?;
        let goal = parts.len() - 1;
        let mut current = fs.get_inode_ref(InodeNumber::ROOT)?;
        let mut parent = InodeNumber::ROOT;

        for (at, name) in parts.iter().enumerate() {
            let is_goal = at == goal;
            if name.is_empty() {
                if is_goal && expect != Expect::File {
                    if !current.inode().is_dir() {
                        return Err(DnxError::NotDirectory);
                    }
                    break;
                }
                return Err(not_found(path));
            }

            match current.dir_find_entry(name)? {
                Some(entry) => {
                    if is_goal && flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
                        return Err(DnxError::Exists);
                    }
                    parent = current.index();
                    let next = InodeNumber(entry.inode);
                    if next != current.index() {
                        current.put()?;
                        current = fs.get_inode_ref(next)?;
                    }
                }
                None => {
                    if !flags.contains(OpenFlags::CREAT) {
                        return Err(not_found(path));
                    }
                    let as_dir = !is_goal || expect == Expect::Directory;
                    let mut child = fs.alloc_inode(current.index(), as_dir)?;
                    if let Err(err) = self.link(&mut current, &mut child, name) {
                        self.abandon(child);
                        return Err(err);
                    }
                    debug!(
                        ino = child.index().0,
                        parent = current.index().0,
                        dir = as_dir,
                        "create"
                    );
                    parent = current.index();
                    current.put()?;
                    current = child;
                }
            }

            if is_goal {
                let inode = current.inode();
                let mismatch = match expect {
                    Expect::File => inode.is_dir(),
                    Expect::Directory => inode.is_regular(),
                    Expect::Any => false,
                };
                if mismatch {
                    return Err(not_found(path));
                }
            }
        }

        let stamp = now();
        if current.inode().atime != stamp {
            current.inode_mut().atime = stamp;
            current.mark_dirty();
        }
        if flags.contains(OpenFlags::TRUNC) && current.inode().is_regular() {
            current.truncate(0)?;
        }

        let fsize = current.inode().size;
        let file = FileHandle {
            inode: current.index(),
            flags,
            fsize,
            fpos: if flags.contains(OpenFlags::APPEND) { fsize } else { 0 },
        };
        current.put()?;
        trace!(path, ino = file.inode.0, size = fsize, "open");
        Ok(Opened { file, parent })
    }

    /// Undo a fresh allocation whose link failed.
    fn abandon(&self, mut child: InodeRef<'v>) {
        let ino = child.index();
        if child.inode().blocks != 0 {
            if let Err(err) = child.truncate(0) {
                warn!(ino = ino.0, error = %err, "abandon_truncate_failed");
            }
        }
        if let Err(err) = self.fs().free_inode(child) {
            warn!(ino = ino.0, error = %err, "abandon_free_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_strip_leading_slash() {
        assert_eq!(components("/").unwrap(), vec![b"" as &[u8]]);
        assert_eq!(components("").unwrap(), vec![b"" as &[u8]]);
        assert_eq!(components("/a/b").unwrap(), vec![b"a" as &[u8], b"b"]);
        assert_eq!(components("a/b/").unwrap(), vec![b"a" as &[u8], b"b", b""]);
    }

    #[test]
    fn components_reject_long_names() {
        let long = format!("/{}", "x".repeat(256));
        assert!(matches!(components(&long), Err(DnxError::NameTooLong)));
        let ok = format!("/{}", "x".repeat(255));
        assert_eq!(components(&ok).unwrap().len(), 1);
    }

    #[test]
    fn final_component_refuses_root_and_dots() {
        assert_eq!(final_component("/d/a").unwrap(), b"a");
        assert_eq!(final_component("/d/").unwrap(), b"d");
        assert_eq!(final_component("top").unwrap(), b"top");
        for bad in ["/", "", "/d/.", "/d/..", "//"] {
            assert!(
                matches!(final_component(bad), Err(DnxError::InvalidArgument(_))),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn parent_path_of_nested_and_top_level() {
        assert_eq!(parent_path("/a/b/c"), "/a/b");
        assert_eq!(parent_path("/a"), "/");
        assert_eq!(parent_path("a"), "/");
        assert_eq!(parent_path("/a/b/"), "/a");
    }
}
