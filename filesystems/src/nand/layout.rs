// On-media layout of the emulated console's internal flash.
// Every value here is contractual: an image written by this engine must be
// byte-exact interchangeable with one produced by the original firmware.

use byteorder::{BigEndian, ByteOrder};

pub const DATA_BYTES_PER_PAGE: usize = 0x800;
pub const SPARE_BYTES_PER_PAGE: usize = 0x40;
pub const PAGE_SIZE: usize = DATA_BYTES_PER_PAGE + SPARE_BYTES_PER_PAGE;

pub const PAGES_PER_CLUSTER: usize = 8;
pub const CLUSTER_DATA_SIZE: usize = DATA_BYTES_PER_PAGE * PAGES_PER_CLUSTER;
pub const CLUSTER_RAW_SIZE: usize = PAGE_SIZE * PAGES_PER_CLUSTER;

pub const CLUSTER_COUNT: usize = 0x8000;

/// Exact size of the backing image file.
pub const NAND_SIZE: u64 = (CLUSTER_COUNT * CLUSTER_RAW_SIZE) as u64;

pub const NUMBER_OF_SUPERBLOCKS: u32 = 16;
pub const CLUSTERS_PER_SUPERBLOCK: u32 = 16;
pub const SUPERBLOCK_START_CLUSTER: u16 = 0x7f00;
pub const SUPERBLOCK_SIZE: usize = CLUSTER_DATA_SIZE * CLUSTERS_PER_SUPERBLOCK as usize;

// FAT sentinels. Anything below 0x8000 is the next cluster in the chain.
pub const CLUSTER_LAST_IN_CHAIN: u16 = 0xfffb;
pub const CLUSTER_RESERVED: u16 = 0xfffc;
pub const CLUSTER_BAD_BLOCK: u16 = 0xfffd;
pub const CLUSTER_UNUSED: u16 = 0xfffe;
/// Free marker found in legacy images; normalised to `CLUSTER_UNUSED` when a
/// superblock is loaded and never written back out.
pub const CLUSTER_UNUSED_LEGACY: u16 = 0xffff;

// The cluster HMAC is stored twice across the spare areas of the last two
// pages of the cluster: one full copy plus a split second copy.
pub const HMAC_PAGE1: usize = 6;
pub const HMAC_PAGE2: usize = 7;
pub const HMAC1_OFFSET_IN_PAGE1: usize = 0x01;
pub const HMAC2_OFFSET_IN_PAGE1: usize = 0x15;
pub const HMAC2_SIZE_IN_PAGE1: usize = 12;
pub const HMAC2_OFFSET_IN_PAGE2: usize = 0x01;
pub const HMAC2_SIZE_IN_PAGE2: usize = 8;

pub const ECC_OFFSET_IN_SPARE: usize = 0x30;

/// Size of the salt prepended to HMAC'd data.
pub const SALT_SIZE: usize = 0x40;

/// First cluster of superblock copy `index`.
pub fn superblock_cluster(index: u32) -> u16 {
    SUPERBLOCK_START_CLUSTER + (index * CLUSTERS_PER_SUPERBLOCK) as u16
}

/// Byte offset of a page's data area in the backing file.
pub fn offset(cluster: u16, page: usize) -> u64 {
    cluster as u64 * CLUSTER_RAW_SIZE as u64 + (page * PAGE_SIZE) as u64
}

/// Salt for a superblock HMAC: only the copy's first cluster is populated.
pub fn superblock_salt(starting_cluster: u16) -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    BigEndian::write_u16(&mut salt[0x12..0x14], starting_cluster);
    salt
}

/// Salt for a data cluster HMAC, binding the cluster to its owning entry.
pub fn data_salt(
    uid: u32,
    name: &[u8; 12],
    chain_index: u16,
    fst_index: u16,
    x3: u32,
) -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    BigEndian::write_u32(&mut salt[0x00..0x04], uid);
    salt[0x04..0x10].copy_from_slice(name);
    BigEndian::write_u32(&mut salt[0x10..0x14], chain_index as u32);
    BigEndian::write_u32(&mut salt[0x14..0x18], fst_index as u32);
    BigEndian::write_u32(&mut salt[0x18..0x1c], x3);
    salt
}
