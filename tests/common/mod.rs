#![allow(dead_code)]

use recover_kit::csum::csum_data;
use recover_kit::structures::*;
use std::fs::File;
use std::os::unix::fs::FileExt;

pub const TEST_FSID: BtrfsFsid = [0x5a; BTRFS_FSID_SIZE];
pub const TEST_CHUNK_TREE_UUID: BtrfsUuid = [0x7e; BTRFS_UUID_SIZE];
pub const NODESIZE: u32 = 4096;
pub const SECTORSIZE: u32 = 4096;

pub fn test_dev_item(devid: u64, total_bytes: u64) -> btrfs_dev_item {
    btrfs_dev_item {
        devid,
        total_bytes,
        bytes_used: 0,
        io_align: SECTORSIZE,
        io_width: SECTORSIZE,
        sector_size: SECTORSIZE,
        r#type: 0,
        generation: 0,
        start_offset: 0,
        dev_group: 0,
        seek_speed: 0,
        bandwidth: 0,
        uuid: [devid as u8; BTRFS_UUID_SIZE],
        fsid: TEST_FSID,
    }
}

pub struct SuperParams {
    pub generation: u64,
    pub chunk_root_generation: u64,
    pub root: u64,
    pub chunk_root: u64,
    pub devid: u64,
    pub num_devices: u64,
    pub total_bytes: u64,
}

impl Default for SuperParams {
    fn default() -> Self {
        SuperParams {
            generation: 100,
            chunk_root_generation: 100,
            root: 0,
            chunk_root: 0,
            devid: 1,
            num_devices: 1,
            total_bytes: 12 << 20,
        }
    }
}

pub fn make_super(bytenr: u64, params: &SuperParams) -> Box<[u8; BTRFS_SUPER_INFO_SIZE]> {
    let mut buf = Box::new([0_u8; BTRFS_SUPER_INFO_SIZE]);
    {
        let sb = layout_at_mut::<btrfs_super_block>(&mut buf[..], 0);
        sb.magic = BTRFS_MAGIC;
        sb.fsid = TEST_FSID;
        sb.bytenr = bytenr;
        sb.generation = params.generation;
        sb.chunk_root_generation = params.chunk_root_generation;
        sb.root = params.root;
        sb.chunk_root = params.chunk_root;
        sb.root_level = 0;
        sb.chunk_root_level = 0;
        sb.sectorsize = SECTORSIZE;
        sb.nodesize = NODESIZE;
        sb.num_devices = params.num_devices;
        sb.total_bytes = params.total_bytes;
        sb.csum_type = BTRFS_CSUM_TYPE_CRC32;
        sb.dev_item = test_dev_item(params.devid, params.total_bytes);
    }
    let csum = csum_data(&buf[BTRFS_CSUM_SIZE..], BTRFS_CSUM_TYPE_CRC32).unwrap();
    buf[..BTRFS_CSUM_SIZE].copy_from_slice(&csum);
    buf
}

pub fn write_at(file: &File, offset: u64, data: &[u8]) {
    file.write_all_at(data, offset).unwrap();
}

pub fn read_exact(file: &File, offset: u64, len: usize) -> Vec<u8> {
    let mut buf = vec![0_u8; len];
    file.read_exact_at(&mut buf, offset).unwrap();
    buf
}
