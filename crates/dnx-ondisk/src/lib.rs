#![forbid(unsafe_code)]
//! On-disk format parsing for ext2 structures.
//!
//! Pure parsing crate. Parses byte slices into typed superblocks, group
//! descriptors, inodes and directory entries, and serializes the engine-owned
//! fields back into existing byte regions.

pub mod ext2;

pub use ext2::{
    DirEntryHeader, EXT2_DIR_ENTRY_HEADER_LEN, EXT2_GROUP_DESC_SIZE, Ext2CompatFeatures,
    Ext2DirEntry, Ext2FileType, Ext2GroupDesc, Ext2IncompatFeatures, Ext2Inode,
    Ext2RoCompatFeatures, Ext2Superblock, parse_dir_block,
};
