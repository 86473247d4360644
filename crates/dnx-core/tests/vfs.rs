#![forbid(unsafe_code)]

use dnx_block::{BlockIo, FileBlockIo};
use dnx_core::vfs::{EXT2FS_NAME, EXT2FS_TYPE, Ext2Vfs, PHYSICAL_BLOCK_SIZE, VfsFileType, errno};
use dnx_core::{DnxError, FormatOptions, OpenFlags, format};
use std::sync::Arc;
use tempfile::NamedTempFile;

const IMAGE_BLOCKS: u64 = 4096;

fn image() -> NamedTempFile {
    let file = NamedTempFile::new().expect("tempfile");
    file.as_file()
        .set_len(u64::from(PHYSICAL_BLOCK_SIZE) * IMAGE_BLOCKS)
        .expect("size image");
    let io: Arc<dyn BlockIo> =
        Arc::new(FileBlockIo::open(file.path(), PHYSICAL_BLOCK_SIZE).expect("open image"));
    let opts = FormatOptions {
        volume_name: "dnx-test".to_owned(),
        ..FormatOptions::default()
    };
    format(io, PHYSICAL_BLOCK_SIZE, IMAGE_BLOCKS, &opts).expect("format");
    file
}

fn listing(fs: &Ext2Vfs, path: &str) -> Vec<(String, VfsFileType, u64)> {
    let mut dir = fs.opendir(path).expect("opendir");
    let mut out = Vec::new();
    while let Some(entry) = fs.readdir(&mut dir).expect("readdir") {
        out.push((entry.name, entry.filetype, entry.size));
    }
    fs.closedir(dir).expect("closedir");
    out
}

#[test]
fn positioned_io_on_image_file() {
    let img = image();
    let fs = Ext2Vfs::init(img.path()).unwrap();
    let mut f = fs
        .open("/log", OpenFlags::RDWR | OpenFlags::CREAT)
        .unwrap();
    assert_eq!(fs.write_at(&mut f, b"hello world", 0).unwrap(), 11);
    assert_eq!(fs.write_at(&mut f, b"WORLD", 6).unwrap(), 5);

    let mut buf = [0_u8; 5];
    assert_eq!(fs.read_at(&mut f, &mut buf, 6).unwrap(), 5);
    assert_eq!(&buf, b"WORLD");
    assert!(fs.read_at(&mut f, &mut buf, 12).is_err());
    assert!(fs.flush(&f).is_ok());
    assert!(matches!(fs.ioctl(&f, 1), Err(DnxError::NotPermitted)));

    let st = fs.fstat(&f).unwrap();
    assert_eq!(st.size, 11);
    assert_eq!(st.kind, VfsFileType::Regular);
    fs.close(&mut f).unwrap();
    fs.release().unwrap();
}

#[test]
fn contents_persist_across_release_and_init() {
    let img = image();
    let fs = Ext2Vfs::init(img.path()).unwrap();
    fs.mkdir("/etc", 0o755).unwrap();
    let mut f = fs
        .open("/etc/motd", OpenFlags::WRONLY | OpenFlags::CREAT)
        .unwrap();
    fs.write_at(&mut f, b"welcome", 0).unwrap();
    fs.release().unwrap();

    let fs = Ext2Vfs::init(img.path()).unwrap();
    let mut f = fs.open("/etc/motd", OpenFlags::RDONLY).unwrap();
    let mut buf = [0_u8; 7];
    assert_eq!(fs.read_at(&mut f, &mut buf, 0).unwrap(), 7);
    assert_eq!(&buf, b"welcome");
    assert_eq!(fs.stat("/etc").unwrap().mode, 0o755);
    fs.release().unwrap();
}

#[test]
fn readdir_reports_types_and_sizes() {
    let img = image();
    let fs = Ext2Vfs::init(img.path()).unwrap();
    fs.mkdir("/d", 0o700).unwrap();
    let mut f = fs
        .open("/d/file", OpenFlags::WRONLY | OpenFlags::CREAT)
        .unwrap();
    fs.write_at(&mut f, &[1; 1500], 0).unwrap();
    fs.mkdir("/d/sub", 0o755).unwrap();

    let entries = listing(&fs, "/d");
    let names: Vec<&str> = entries.iter().map(|e| e.0.as_str()).collect();
    assert_eq!(names, [".", "..", "file", "sub"]);
    assert_eq!(entries[2].1, VfsFileType::Regular);
    assert_eq!(entries[2].2, 1500);
    assert_eq!(entries[3].1, VfsFileType::Dir);

    let mut dir = fs.opendir("/d").unwrap();
    fs.readdir(&mut dir).unwrap();
    assert_eq!(dir.position(), 1);
    fs.closedir(dir).unwrap();
}

#[test]
fn remove_handles_files_and_trees() {
    let img = image();
    let fs = Ext2Vfs::init(img.path()).unwrap();
    fs.mkdir("/t", 0o755).unwrap();
    fs.mkdir("/t/u", 0o755).unwrap();
    fs.open("/t/u/f", OpenFlags::CREAT).unwrap();
    fs.open("/plain", OpenFlags::CREAT).unwrap();

    fs.remove("/plain").unwrap();
    fs.remove("/t").unwrap();
    let names: Vec<String> = listing(&fs, "/").into_iter().map(|e| e.0).collect();
    assert_eq!(names, [".", ".."]);

    let err = fs.remove("/nothing").unwrap_err();
    assert_eq!(errno(&err), libc::ENOENT);
}

#[test]
fn special_nodes_are_not_permitted() {
    let img = image();
    let fs = Ext2Vfs::init(img.path()).unwrap();
    assert_eq!(errno(&fs.mkfifo("/p", 0o644).unwrap_err()), libc::EPERM);
    assert_eq!(errno(&fs.mknod("/n", 0).unwrap_err()), libc::EPERM);
}

#[test]
fn rename_chmod_chown_through_the_driver() {
    let img = image();
    let fs = Ext2Vfs::init(img.path()).unwrap();
    fs.open("/a", OpenFlags::CREAT).unwrap();
    fs.rename("/a", "/b").unwrap();
    fs.chmod("/b", 0o600).unwrap();
    fs.chown("/b", 7, 8).unwrap();
    let st = fs.stat("/b").unwrap();
    assert_eq!((st.mode, st.uid, st.gid), (0o600, 7, 8));
    assert_eq!(errno(&fs.stat("/a").unwrap_err()), libc::ENOENT);
}

#[test]
fn statfs_reports_driver_identity() {
    let img = image();
    let fs = Ext2Vfs::init(img.path()).unwrap();
    let st = fs.statfs().unwrap();
    assert_eq!(st.fs_type, EXT2FS_TYPE);
    assert_eq!(st.fsname, EXT2FS_NAME);
    assert_eq!(st.bsize, 1024);
    assert_eq!(st.blocks, IMAGE_BLOCKS / 2);
    assert!(st.bfree < st.blocks);
    assert!(st.ffree < st.files);
    assert_eq!(fs.volume().statfs().unwrap().volume_name, "dnx-test");
    fs.sync().unwrap();
}

#[test]
fn remove_retries_as_directory_after_any_file_failure() {
    let img = image();
    let fs = Ext2Vfs::init(img.path()).unwrap();
    fs.mkdir("/t", 0o755).unwrap();
    fs.open("/t/f", OpenFlags::CREAT).unwrap();
    fs.open("/plain", OpenFlags::CREAT).unwrap();

    fs.remove("/t/").unwrap();
    assert_eq!(errno(&fs.stat("/t").unwrap_err()), libc::ENOENT);
    let err = fs.remove("/plain/x").unwrap_err();
    assert_eq!(errno(&err), libc::ENOTDIR);
    assert_eq!(fs.stat("/plain").unwrap().kind, VfsFileType::Regular);
    fs.release().unwrap();
}
