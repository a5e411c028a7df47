//! Read and write access to tree node buffers.
//!
//! Readers accept a slice holding one node-sized block and iterate its
//! items or key pointers. The builder packs items into a fresh leaf the way
//! the kernel lays them out: item headers grow forward from the node
//! header, item data grows backward from the end of the block.

use crate::csum::put_tree_block_csum;
use crate::error::Result;
use crate::structures::*;
use log::warn;
use more_asserts::*;

pub const HEADER_SIZE: usize = std::mem::size_of::<btrfs_header>();
pub const ITEM_SIZE: usize = std::mem::size_of::<btrfs_item>();
pub const KEY_PTR_SIZE: usize = std::mem::size_of::<btrfs_key_ptr>();

pub struct LeafIter<'a> {
    block: &'a [u8],
    cur_item: u32,
}

pub fn leaf_items(block: &[u8]) -> LeafIter {
    LeafIter { block, cur_item: 0 }
}

pub fn node_header(block: &[u8]) -> &btrfs_header {
    layout_at::<btrfs_header>(block, 0)
}

impl<'a> LeafIter<'a> {
    pub fn header(&self) -> &'a btrfs_header {
        layout_at::<btrfs_header>(self.block, 0)
    }

    pub fn peek(&self) -> Option<<Self as Iterator>::Item> {
        if self.cur_item >= self.header().nritems {
            return None;
        }

        let offset = HEADER_SIZE + self.cur_item as usize * ITEM_SIZE;
        if offset + ITEM_SIZE > self.block.len() {
            warn!("leaf item header {} overruns block", self.cur_item);
            return None;
        }
        let item = layout_at::<btrfs_item>(self.block, offset);
        let data_offset = HEADER_SIZE + item.offset as usize;
        let data_end = data_offset.checked_add(item.size as usize)?;
        if data_end > self.block.len() {
            warn!("leaf item {} data overruns block", self.cur_item);
            return None;
        }
        Some((item, &self.block[data_offset..data_end]))
    }
}

impl<'a> Iterator for LeafIter<'a> {
    type Item = (&'a btrfs_item, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        match self.peek() {
            None => None,
            Some(s) => {
                self.cur_item += 1;
                Some(s)
            }
        }
    }
}

pub struct KeyPtrIter<'a> {
    block: &'a [u8],
    cur_item: u32,
}

pub fn node_key_ptrs(block: &[u8]) -> KeyPtrIter {
    KeyPtrIter { block, cur_item: 0 }
}

impl<'a> KeyPtrIter<'a> {
    pub fn header(&self) -> &'a btrfs_header {
        layout_at::<btrfs_header>(self.block, 0)
    }

    pub fn peek(&self) -> Option<<Self as Iterator>::Item> {
        if self.cur_item >= self.header().nritems {
            return None;
        }
        let offset = HEADER_SIZE + self.cur_item as usize * KEY_PTR_SIZE;
        if offset + KEY_PTR_SIZE > self.block.len() {
            warn!("key pointer {} overruns block", self.cur_item);
            return None;
        }
        Some(layout_at::<btrfs_key_ptr>(self.block, offset))
    }
}

impl<'a> Iterator for KeyPtrIter<'a> {
    type Item = &'a btrfs_key_ptr;

    fn next(&mut self) -> Option<Self::Item> {
        match self.peek() {
            None => None,
            Some(s) => {
                self.cur_item += 1;
                Some(s)
            }
        }
    }
}

/// Common header fields stamped onto freshly built nodes.
#[derive(Clone, Copy)]
pub struct NodeStamp {
    pub bytenr: u64,
    pub generation: u64,
    pub owner: u64,
    pub fsid: BtrfsFsid,
    pub chunk_tree_uuid: BtrfsUuid,
    pub csum_type: u16,
}

/// Builds one leaf block, items added in ascending key order.
pub struct LeafBuilder {
    buf: Vec<u8>,
    nritems: u32,
    /// start of the data region, relative to the end of the header
    data_end: usize,
    last_key: Option<btrfs_disk_key>,
}

impl LeafBuilder {
    pub fn new(nodesize: usize) -> LeafBuilder {
        assert_gt!(nodesize, HEADER_SIZE);
        LeafBuilder {
            buf: vec![0_u8; nodesize],
            nritems: 0,
            data_end: nodesize - HEADER_SIZE,
            last_key: None,
        }
    }

    pub fn free_space(&self) -> usize {
        self.data_end - self.nritems as usize * ITEM_SIZE
    }

    pub fn fits(&self, data_len: usize) -> bool {
        ITEM_SIZE + data_len <= self.free_space()
    }

    pub fn nritems(&self) -> u32 {
        self.nritems
    }

    pub fn add_item(&mut self, key: btrfs_disk_key, data: &[u8]) {
        assert!(self.fits(data.len()));
        if let Some(last) = self.last_key {
            assert_eq!(last.cmp_key(&key), std::cmp::Ordering::Less);
        }
        self.last_key = Some(key);

        self.data_end -= data.len();
        self.buf[HEADER_SIZE + self.data_end..HEADER_SIZE + self.data_end + data.len()]
            .copy_from_slice(data);

        let item_offset = HEADER_SIZE + self.nritems as usize * ITEM_SIZE;
        let item = layout_at_mut::<btrfs_item>(&mut self.buf, item_offset);
        item.key = key;
        item.offset = self.data_end as u32;
        item.size = data.len() as u32;
        self.nritems += 1;
    }

    pub fn first_key(&self) -> Option<btrfs_disk_key> {
        if self.nritems == 0 {
            return None;
        }
        Some(layout_at::<btrfs_item>(&self.buf, HEADER_SIZE).key)
    }

    pub fn finish(mut self, stamp: &NodeStamp) -> Result<Vec<u8>> {
        {
            let header = layout_at_mut::<btrfs_header>(&mut self.buf, 0);
            header.bytenr = stamp.bytenr;
            header.generation = stamp.generation;
            header.owner = stamp.owner;
            header.nritems = self.nritems;
            header.level = 0;
            header.fsid = stamp.fsid;
            header.chunk_tree_uuid = stamp.chunk_tree_uuid;
        }
        put_tree_block_csum(&mut self.buf, stamp.csum_type)?;
        Ok(self.buf)
    }
}

/// Builds a level-`level` internal node pointing at the given children.
pub fn build_internal_node(
    nodesize: usize,
    level: u8,
    children: &[(btrfs_disk_key, u64)],
    stamp: &NodeStamp,
) -> Result<Vec<u8>> {
    assert_gt!(level, 0);
    assert_le!(
        HEADER_SIZE + children.len() * KEY_PTR_SIZE,
        nodesize,
        "too many key pointers for one node"
    );
    let mut buf = vec![0_u8; nodesize];
    for (i, (key, blockptr)) in children.iter().enumerate() {
        let ptr = layout_at_mut::<btrfs_key_ptr>(&mut buf, HEADER_SIZE + i * KEY_PTR_SIZE);
        ptr.key = *key;
        ptr.blockptr = *blockptr;
        ptr.generation = stamp.generation;
    }
    {
        let header = layout_at_mut::<btrfs_header>(&mut buf, 0);
        header.bytenr = stamp.bytenr;
        header.generation = stamp.generation;
        header.owner = stamp.owner;
        header.nritems = children.len() as u32;
        header.level = level;
        header.fsid = stamp.fsid;
        header.chunk_tree_uuid = stamp.chunk_tree_uuid;
    }
    put_tree_block_csum(&mut buf, stamp.csum_type)?;
    Ok(buf)
}
