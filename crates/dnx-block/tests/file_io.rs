#![forbid(unsafe_code)]

use dnx_block::{BlockCache, BlockDev, BlockDevice, BlockIo, FileBlockIo};
use dnx_types::BlockNumber;
use proptest::prelude::*;
use std::io::Write;
use std::sync::Arc;

fn image(len: usize) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    file.write_all(&vec![0_u8; len]).expect("fill");
    file.flush().expect("flush");
    file
}

#[test]
fn file_provider_round_trips_through_cache() {
    let file = image(512 * 256);
    let io = FileBlockIo::open(file.path(), 512).expect("open");
    assert_eq!(io.block_count(), 256);
    assert!(io.is_writable());

    let mut dev = BlockDev::new(Arc::new(io), 512, 256).expect("device");
    dev.set_lb_size(1024).expect("lb size");
    let cache = BlockCache::new(dev, 16).expect("cache");

    let guard = cache.write_back_guard();
    cache
        .write_block(BlockNumber(9), &[0x5A; 1024])
        .expect("write");
    guard.finish().expect("flush");
    cache.sync().expect("sync");

    let bytes = std::fs::read(file.path()).expect("read image");
    assert!(bytes[9 * 1024..10 * 1024].iter().all(|b| *b == 0x5A));
    assert!(bytes[10 * 1024..11 * 1024].iter().all(|b| *b == 0));
}

#[test]
fn file_provider_rejects_out_of_range() {
    let file = image(512 * 4);
    let io = FileBlockIo::open(file.path(), 512).expect("open");
    let mut buf = vec![0_u8; 1024];
    assert!(io.bread(&mut buf, 3, 2).is_err());
    io.bread(&mut buf, 2, 2).expect("last two blocks");
}

#[test]
fn file_provider_rejects_zero_block_size() {
    let file = image(512);
    assert!(FileBlockIo::open(file.path(), 0).is_err());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn direct_and_cached_views_agree(
        writes in proptest::collection::vec((0_u64..32, any::<u8>(), any::<bool>()), 1..40),
        capacity in 1_usize..6,
    ) {
        let file = image(1024 * 32);
        let io = FileBlockIo::open(file.path(), 1024).expect("open");
        let dev = BlockDev::new(Arc::new(io), 1024, 32).expect("device");
        let cache = BlockCache::new(dev, capacity).expect("cache");
        let mut model = vec![0_u8; 32];

        let guard = cache.write_back_guard();
        for (block, fill, direct) in writes {
            if direct {
                cache.blocks_set_direct(BlockNumber(block), &[fill; 1024]).expect("direct");
            } else {
                cache.write_block(BlockNumber(block), &[fill; 1024]).expect("cached");
            }
            model[usize::try_from(block).unwrap()] = fill;
        }

        let mut all = vec![0_u8; 32 * 1024];
        cache.blocks_get_direct(BlockNumber(0), &mut all).expect("direct read");
        for (i, fill) in model.iter().enumerate() {
            prop_assert!(all[i * 1024..(i + 1) * 1024].iter().all(|b| b == fill));
        }
        guard.finish().expect("flush");

        let bytes = std::fs::read(file.path()).expect("read image");
        prop_assert_eq!(bytes, all);
    }
}
