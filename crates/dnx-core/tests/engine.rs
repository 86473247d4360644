#![forbid(unsafe_code)]

use dnx_block::{BlockIo, MemBlockIo};
use dnx_core::{
    DnxError, Ext2FileType, FormatOptions, InodeNumber, MountOptions, OpenFlags, OsLock,
    SeekFrom, Volume, format,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

fn fresh(ph_bsize: u32, ph_bcnt: u64, block_size: u32) -> (Arc<dyn BlockIo>, Volume) {
    let io: Arc<dyn BlockIo> = Arc::new(MemBlockIo::new(ph_bsize, ph_bcnt));
    let opts = FormatOptions {
        block_size,
        ..FormatOptions::default()
    };
    format(Arc::clone(&io), ph_bsize, ph_bcnt, &opts).expect("format");
    let vol = Volume::mount(Arc::clone(&io), ph_bsize, ph_bcnt, MountOptions::default())
        .expect("mount");
    (io, vol)
}

fn volume() -> Volume {
    fresh(512, 4096, 1024).1
}

fn write_file(vol: &Volume, path: &str, data: &[u8]) {
    let mut f = vol
        .fopen(path, OpenFlags::WRONLY | OpenFlags::CREAT)
        .expect("create");
    assert_eq!(vol.fwrite(&mut f, data).expect("write"), data.len());
    vol.fclose(&mut f).expect("close");
}

fn read_file(vol: &Volume, path: &str) -> Vec<u8> {
    let mut f = vol.fopen(path, OpenFlags::RDONLY).expect("open");
    let mut buf = vec![0_u8; usize::try_from(f.size()).expect("size")];
    assert_eq!(vol.fread(&mut f, &mut buf).expect("read"), buf.len());
    buf
}

fn entry_names(vol: &Volume, path: &str) -> Vec<String> {
    let mut dir = vol.dir_open(path).expect("dir_open");
    let mut names = Vec::new();
    let mut index = 0;
    while let Some(entry) = vol.dir_entry_get(&mut dir, index).expect("entry") {
        names.push(entry.name_str());
        index += 1;
    }
    vol.dir_close(&mut dir).expect("dir_close");
    names
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn create_write_read_on_512_byte_device() {
    let (_, vol) = fresh(512, 1024, 1024);
    let mut f = vol
        .fopen("/f", OpenFlags::CREAT | OpenFlags::WRONLY)
        .unwrap();
    assert_eq!(vol.fwrite(&mut f, &[0xAB; 1000]).unwrap(), 1000);
    vol.fclose(&mut f).unwrap();

    let mut f = vol.fopen("/f", OpenFlags::RDONLY).unwrap();
    let mut buf = [0_u8; 1000];
    assert_eq!(vol.fread(&mut f, &mut buf).unwrap(), 1000);
    assert!(buf.iter().all(|b| *b == 0xAB));
    assert_eq!(vol.fstat(&f).unwrap().size, 1000);
    vol.fclose(&mut f).unwrap();
    assert_eq!(vol.ref_stats().outstanding(), 0);
}

#[test]
fn round_trip_across_block_boundaries() {
    for block_size in [1024_u32, 2048] {
        let vol = fresh(512, 8192, block_size).1;
        for (i, len) in [0_usize, 100, 512, 513, 1024, 1025, 2000, 3000, 70_000]
            .into_iter()
            .enumerate()
        {
            let path = format!("/rt{i}");
            let data = pattern(len);
            let mut f = vol
                .fopen(&path, OpenFlags::RDWR | OpenFlags::CREAT)
                .unwrap();
            assert_eq!(vol.fwrite(&mut f, &data).unwrap(), len);
            assert_eq!(vol.ftell(&f), len as u64);
            vol.fseek(&mut f, SeekFrom::Start(0)).unwrap();
            let mut buf = vec![0_u8; len];
            assert_eq!(vol.fread(&mut f, &mut buf).unwrap(), len);
            assert_eq!(buf, data, "block size {block_size}, length {len}");
        }
        assert_eq!(vol.ref_stats().outstanding(), 0);
    }
}

#[test]
fn overwrite_in_the_middle_keeps_size() {
    let vol = volume();
    write_file(&vol, "/f", &pattern(5000));
    let mut f = vol.fopen("/f", OpenFlags::RDWR).unwrap();
    vol.fseek(&mut f, SeekFrom::Start(1000)).unwrap();
    vol.fwrite(&mut f, &[0xEE; 2500]).unwrap();
    assert_eq!(vol.fstat(&f).unwrap().size, 5000);

    let mut want = pattern(5000);
    want[1000..3500].fill(0xEE);
    assert_eq!(read_file(&vol, "/f"), want);
}

#[test]
fn unaligned_append_extends_file() {
    let vol = volume();
    write_file(&vol, "/f", &pattern(700));
    let mut f = vol
        .fopen("/f", OpenFlags::WRONLY | OpenFlags::APPEND)
        .unwrap();
    vol.fwrite(&mut f, &[9; 3000]).unwrap();
    assert_eq!(f.size(), 3700);

    let mut want = pattern(700);
    want.extend_from_slice(&[9; 3000]);
    assert_eq!(read_file(&vol, "/f"), want);
}

#[test]
fn read_at_end_of_file_returns_zero() {
    let vol = volume();
    write_file(&vol, "/f", b"0123456789");
    let mut f = vol.fopen("/f", OpenFlags::RDONLY).unwrap();
    vol.fseek(&mut f, SeekFrom::Start(6)).unwrap();
    let mut buf = [0_u8; 16];
    assert_eq!(vol.fread(&mut f, &mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"6789");
    assert_eq!(vol.fread(&mut f, &mut buf).unwrap(), 0);
}

#[test]
fn seek_past_end_of_file_is_rejected() {
    let vol = volume();
    write_file(&vol, "/f", &[1; 10]);
    let mut f = vol.fopen("/f", OpenFlags::RDONLY).unwrap();
    let err = vol.fseek(&mut f, SeekFrom::Start(20)).unwrap_err();
    assert!(matches!(err, DnxError::InvalidArgument(_)));
    assert_eq!(vol.ftell(&f), 0);
}

#[test]
fn new_directories_have_exactly_one_of_each_dot_entry() {
    let vol = volume();
    vol.dir_mk("/a").unwrap();
    vol.dir_mk("/a/b").unwrap();
    write_file(&vol, "/a/b/f", b"x");
    vol.dir_mk("/a/b/c").unwrap();
    for dir in ["/a", "/a/b", "/a/b/c"] {
        let names = entry_names(&vol, dir);
        assert_eq!(names.iter().filter(|n| *n == ".").count(), 1, "{dir}");
        assert_eq!(names.iter().filter(|n| *n == "..").count(), 1, "{dir}");
    }
    assert_eq!(vol.ref_stats().outstanding(), 0);
}

#[test]
fn dir_mk_sets_link_counts() {
    let vol = volume();
    let before = vol.stat("/").unwrap().links;
    vol.dir_mk("/a").unwrap();
    assert_eq!(vol.stat("/a").unwrap().links, 2);
    assert_eq!(vol.stat("/").unwrap().links, before + 1);

    vol.dir_mk("/a/b").unwrap();
    assert_eq!(vol.stat("/a").unwrap().links, 3);
    assert_eq!(vol.stat("/").unwrap().links, before + 1);
}

#[test]
fn dir_mk_creates_every_missing_level() {
    let vol = volume();
    let root_links = vol.stat("/").unwrap().links;
    let free_inodes = vol.statfs().unwrap().free_inodes_count;
    vol.dir_mk("/a/b/c").unwrap();

    for dir in ["/a", "/a/b", "/a/b/c"] {
        assert_eq!(vol.stat(dir).unwrap().kind, Ext2FileType::Dir, "{dir}");
    }
    assert_eq!(vol.stat("/a").unwrap().links, 3);
    assert_eq!(vol.stat("/a/b").unwrap().links, 3);
    assert_eq!(vol.stat("/a/b/c").unwrap().links, 2);
    assert_eq!(vol.stat("/").unwrap().links, root_links + 1);
    assert_eq!(vol.statfs().unwrap().free_inodes_count, free_inodes - 3);
    assert_eq!(entry_names(&vol, "/a/b"), [".", "..", "c"]);

    vol.dir_rm("/a").unwrap();
    assert_eq!(vol.statfs().unwrap().free_inodes_count, free_inodes);
    assert_eq!(vol.ref_stats().outstanding(), 0);
}

#[test]
fn created_file_has_one_link_and_regular_type() {
    let vol = volume();
    write_file(&vol, "/f", b"x");
    let st = vol.stat("/f").unwrap();
    assert_eq!(st.links, 1);
    assert_eq!(st.kind, Ext2FileType::RegFile);
    assert_eq!(st.mode, 0o666);
}

#[test]
fn plain_remove_of_a_directory_fails() {
    let vol = volume();
    vol.dir_mk("/d").unwrap();
    let f = vol.fopen("/d/x", OpenFlags::CREAT).unwrap();
    assert_eq!(vol.ref_stats().outstanding(), 0);
    drop(f);
    assert!(vol.fremove("/d").is_err());
    assert!(entry_names(&vol, "/d").contains(&"x".to_owned()));
}

#[test]
fn fremove_releases_inode_and_blocks() {
    let vol = volume();
    let before = vol.statfs().unwrap();
    vol.dir_mk("/d").unwrap();
    let mid = vol.statfs().unwrap();
    write_file(&vol, "/d/big", &pattern(300 * 1024));
    vol.fremove("/d/big").unwrap();

    assert!(matches!(vol.stat("/d/big"), Err(DnxError::NotFound(_))));
    let after = vol.statfs().unwrap();
    assert_eq!(after.free_inodes_count, mid.free_inodes_count);
    assert_eq!(after.free_blocks_count, mid.free_blocks_count);
    assert!(mid.free_blocks_count < before.free_blocks_count);
    assert_eq!(vol.ref_stats().outstanding(), 0);
}

#[test]
fn recursive_removal_of_nested_tree() {
    let vol = volume();
    let root_before = entry_names(&vol, "/").len();
    let stats_before = vol.statfs().unwrap();
    let root_links = vol.stat("/").unwrap().links;

    vol.dir_mk("/d").unwrap();
    write_file(&vol, "/d/a", &pattern(1500));
    vol.dir_mk("/d/b").unwrap();
    write_file(&vol, "/d/b/c", &pattern(5000));
    vol.dir_mk("/keep").unwrap();
    assert_eq!(entry_names(&vol, "/").len(), root_before + 2);

    vol.dir_rm("/d").unwrap();

    for gone in ["/d", "/d/a", "/d/b", "/d/b/c"] {
        assert!(matches!(vol.stat(gone), Err(DnxError::NotFound(_))), "{gone}");
    }
    let names = entry_names(&vol, "/");
    assert_eq!(names.len(), root_before + 1);
    assert!(names.contains(&"keep".to_owned()));
    assert_eq!(vol.stat("/").unwrap().links, root_links + 1);

    vol.dir_rm("/keep").unwrap();
    let stats_after = vol.statfs().unwrap();
    assert_eq!(stats_after.free_inodes_count, stats_before.free_inodes_count);
    assert_eq!(stats_after.free_blocks_count, stats_before.free_blocks_count);
    assert_eq!(vol.ref_stats().outstanding(), 0);
}

#[test]
fn recursive_removal_of_deep_chain() {
    let vol = volume();
    let mut path = String::new();
    for level in 0..8 {
        path.push_str(&format!("/l{level}"));
        vol.dir_mk(&path).unwrap();
        write_file(&vol, &format!("{path}/f"), &[level; 10]);
    }
    vol.dir_rm("/l0").unwrap();
    assert!(matches!(vol.stat("/l0"), Err(DnxError::NotFound(_))));
    assert_eq!(entry_names(&vol, "/"), [".", ".."]);
}

#[test]
fn dir_rm_refuses_root_and_files() {
    let vol = volume();
    write_file(&vol, "/f", b"x");
    assert!(matches!(vol.dir_rm("/"), Err(DnxError::InvalidArgument(_))));
    assert!(matches!(vol.dir_rm("/f"), Err(DnxError::NotFound(_))));
    assert!(matches!(vol.fremove("/"), Err(DnxError::InvalidArgument(_))));
}

#[test]
fn rename_within_and_across_directories() {
    let vol = volume();
    write_file(&vol, "/f", b"payload");
    vol.rename("/f", "/g").unwrap();
    assert!(matches!(vol.stat("/f"), Err(DnxError::NotFound(_))));
    assert_eq!(read_file(&vol, "/g"), b"payload");

    vol.dir_mk("/a").unwrap();
    vol.dir_mk("/b").unwrap();
    vol.dir_mk("/a/sub").unwrap();
    write_file(&vol, "/a/sub/x", b"deep");
    let a_links = vol.stat("/a").unwrap().links;
    let b_links = vol.stat("/b").unwrap().links;

    vol.rename("/a/sub", "/b/moved").unwrap();
    assert_eq!(read_file(&vol, "/b/moved/x"), b"deep");
    assert_eq!(vol.stat("/a").unwrap().links, a_links - 1);
    assert_eq!(vol.stat("/b").unwrap().links, b_links + 1);

    // ".." follows the move
    vol.dir_rm("/b").unwrap();
    assert!(vol.stat("/a").is_ok());
    assert_eq!(vol.ref_stats().outstanding(), 0);
}

#[test]
fn rename_never_overwrites_or_cycles() {
    let vol = volume();
    write_file(&vol, "/f", b"1");
    write_file(&vol, "/g", b"2");
    assert!(matches!(vol.rename("/f", "/g"), Err(DnxError::Exists)));
    assert_eq!(read_file(&vol, "/g"), b"2");

    vol.dir_mk("/a").unwrap();
    vol.dir_mk("/a/b").unwrap();
    assert!(matches!(
        vol.rename("/a", "/a/b/c"),
        Err(DnxError::InvalidArgument(_))
    ));
    assert!(matches!(
        vol.rename("/a", "/a/x"),
        Err(DnxError::InvalidArgument(_))
    ));
    assert!(matches!(
        vol.rename("/missing", "/x"),
        Err(DnxError::NotFound(_))
    ));
}

#[test]
fn umount_right_after_mount_leaves_image_consistent() {
    let (io, vol) = fresh(512, 4096, 1024);
    let stats = vol.statfs().unwrap();
    vol.umount().unwrap();

    let vol = Volume::mount(io, 512, 4096, MountOptions::default()).unwrap();
    assert_eq!(vol.statfs().unwrap(), stats);
    assert_eq!(vol.ref_stats().outstanding(), 0);
    vol.umount().unwrap();
}

#[test]
fn data_survives_remount() {
    let (io, vol) = fresh(512, 4096, 1024);
    vol.dir_mk("/d").unwrap();
    write_file(&vol, "/d/f", &pattern(4321));
    vol.umount().unwrap();

    let vol = Volume::mount(io, 512, 4096, MountOptions::default()).unwrap();
    assert_eq!(read_file(&vol, "/d/f"), pattern(4321));
    vol.umount().unwrap();
}

#[test]
fn indexed_directories_when_enabled() {
    let io: Arc<dyn BlockIo> = Arc::new(MemBlockIo::new(512, 4096));
    let opts = FormatOptions {
        dir_index: true,
        ..FormatOptions::default()
    };
    format(Arc::clone(&io), 512, 4096, &opts).unwrap();
    let mount_opts = MountOptions {
        dir_index: true,
        ..MountOptions::default()
    };
    let vol = Volume::mount(io, 512, 4096, mount_opts).unwrap();
    vol.dir_mk("/idx").unwrap();
    write_file(&vol, "/idx/f", b"x");
    assert_eq!(entry_names(&vol, "/idx"), [".", "..", "f"]);
    vol.dir_rm("/idx").unwrap();
    assert_eq!(vol.ref_stats().outstanding(), 0);
}

#[test]
fn space_exhaustion_surfaces_and_keeps_size_exact() {
    let vol = fresh(512, 1024, 1024).1;
    let free = vol.statfs().unwrap().free_blocks_count;
    let mut f = vol
        .fopen("/fill", OpenFlags::WRONLY | OpenFlags::CREAT)
        .unwrap();
    let too_big = vec![0x5A_u8; (free as usize + 16) * 1024];
    let err = vol.fwrite(&mut f, &too_big).unwrap_err();
    assert!(matches!(err, DnxError::NoSpace), "{err:?}");

    let st = vol.fstat(&f).unwrap();
    assert_eq!(st.size, f.position());
    assert_eq!(vol.ref_stats().outstanding(), 0);
    vol.fremove("/fill").unwrap();
    assert_eq!(vol.statfs().unwrap().free_blocks_count, free);
}

#[derive(Default)]
struct CountingLock {
    inner: dnx_core::CondvarLock,
    locks: AtomicU32,
    unlocks: AtomicU32,
}

impl OsLock for CountingLock {
    fn lock(&self) {
        self.inner.lock();
        self.locks.fetch_add(1, Ordering::SeqCst);
    }

    fn unlock(&self) {
        self.unlocks.fetch_add(1, Ordering::SeqCst);
        self.inner.unlock();
    }
}

#[test]
fn lock_hooks_pair_on_success_and_failure() {
    let io: Arc<dyn BlockIo> = Arc::new(MemBlockIo::new(512, 4096));
    format(Arc::clone(&io), 512, 4096, &FormatOptions::default()).unwrap();
    let lock = Arc::new(CountingLock::default());
    let opts = MountOptions {
        lock: Arc::clone(&lock) as Arc<dyn OsLock>,
        ..MountOptions::default()
    };
    let vol = Volume::mount(io, 512, 4096, opts).unwrap();

    write_file(&vol, "/f", b"abc");
    assert!(vol.stat("/missing").is_err());
    assert!(vol.dir_rm("/").is_err());
    let mut f = vol.fopen("/f", OpenFlags::RDONLY).unwrap();
    assert!(vol.fwrite(&mut f, b"x").is_err());

    let locks = lock.locks.load(Ordering::SeqCst);
    assert!(locks >= 6);
    assert_eq!(locks, lock.unlocks.load(Ordering::SeqCst));
}

#[test]
fn concurrent_writers_are_serialized() {
    let vol = Arc::new(volume());
    let workers: Vec<_> = (0..4_u8)
        .map(|t| {
            let vol = Arc::clone(&vol);
            std::thread::spawn(move || {
                let path = format!("/t{t}");
                for round in 0..10_u8 {
                    let mut f = vol
                        .fopen(&path, OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::APPEND)
                        .unwrap();
                    vol.fwrite(&mut f, &[t.wrapping_mul(16) + round; 300]).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    for t in 0..4_u8 {
        let data = read_file(&vol, &format!("/t{t}"));
        assert_eq!(data.len(), 3000);
        for (round, chunk) in data.chunks(300).enumerate() {
            let want = t.wrapping_mul(16) + round as u8;
            assert!(chunk.iter().all(|b| *b == want));
        }
    }
    assert_eq!(vol.ref_stats().outstanding(), 0);
}

#[test]
fn root_inode_is_reported_by_stat() {
    let vol = volume();
    let st = vol.stat("/").unwrap();
    assert_eq!(st.ino, InodeNumber::ROOT);
    assert_eq!(st.kind, Ext2FileType::Dir);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn write_at_offset_then_read_back(
        prefix in 0_usize..4096,
        len in 0_usize..9000,
        seed in any::<u8>(),
    ) {
        let vol = volume();
        let head = pattern(prefix);
        let body: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_add(seed)).collect();
        let mut f = vol.fopen("/p", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
        vol.fwrite(&mut f, &head).unwrap();
        vol.fwrite(&mut f, &body).unwrap();
        prop_assert_eq!(f.size(), (prefix + len) as u64);

        vol.fseek(&mut f, SeekFrom::Start(prefix as u64)).unwrap();
        let mut buf = vec![0_u8; len];
        prop_assert_eq!(vol.fread(&mut f, &mut buf).unwrap(), len);
        prop_assert_eq!(&buf, &body);
        prop_assert_eq!(vol.ref_stats().outstanding(), 0);
    }
}
