//! Minimal filesystem access for the rebuild step.
//!
//! Once the cross-check has produced a set of good chunks, the filesystem
//! is opened read-write *through the in-memory map* instead of the on-disk
//! chunk tree. This module provides just enough of the tree machinery for
//! that: checksummed block reads resolved via the map, key search down the
//! B-trees, and a transaction that stages every modified block in memory
//! and writes nothing until commit.

use crate::csum::verify_tree_block;
use crate::device::{device_size, FsDevices};
use crate::error::{RecoverError, Result};
use crate::mapping::MappingTree;
use crate::node::*;
use crate::records::ChunkRecord;
use crate::structures::*;
use log::{debug, warn};
use more_asserts::*;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::rc::Rc;

pub struct OpenFs {
    pub fs_devices: Rc<FsDevices>,
    files: HashMap<u64, File>,
    pub mapping: MappingTree,
    /// canonical superblock, mutated in memory until commit
    pub sb: Box<btrfs_super_block>,
    pub nodesize: u32,
    pub csum_type: u16,
    pub fsid: BtrfsFsid,
    pub chunk_tree_uuid: BtrfsUuid,
    pub tree_root: u64,
    pub tree_root_level: u8,
    pub extent_root: u64,
    pub extent_root_level: u8,
    pub dev_root: u64,
    pub dev_root_level: u8,
}

impl OpenFs {
    /// Open the filesystem read-write through a pre-built logical map.
    /// Fails unless the map covers the tree root and the chunk root, and
    /// the root tree can name the extent and device trees.
    pub fn open(
        fs_devices: Rc<FsDevices>,
        mapping: MappingTree,
        sb: Box<btrfs_super_block>,
    ) -> Result<OpenFs> {
        let mut files = HashMap::new();
        for dev in &fs_devices.devices {
            files.insert(dev.devid, dev.open_rw()?);
        }

        let mut fs = OpenFs {
            fsid: sb.fsid,
            nodesize: sb.nodesize,
            csum_type: sb.csum_type,
            tree_root: sb.root,
            tree_root_level: sb.root_level,
            extent_root: 0,
            extent_root_level: 0,
            dev_root: 0,
            dev_root_level: 0,
            chunk_tree_uuid: [0; BTRFS_UUID_SIZE],
            fs_devices,
            files,
            mapping,
            sb,
        };

        // both roots must resolve through the map before anything else
        fs.mapping
            .map_block(fs.sb.chunk_root, fs.nodesize as u64)?;
        let root_block = fs.read_block(fs.tree_root)?;
        fs.chunk_tree_uuid = node_header(&root_block).chunk_tree_uuid;

        let (extent_root, extent_root_level) = fs.find_tree_root(BTRFS_EXTENT_TREE_OBJECTID)?;
        let (dev_root, dev_root_level) = fs.find_tree_root(BTRFS_DEV_TREE_OBJECTID)?;
        fs.extent_root = extent_root;
        fs.extent_root_level = extent_root_level;
        fs.dev_root = dev_root;
        fs.dev_root_level = dev_root_level;
        debug!(
            "opened fs: tree root {} extent root {} dev root {}",
            fs.tree_root, fs.extent_root, fs.dev_root
        );
        Ok(fs)
    }

    /// Read one tree block at a logical address, trying every mapped copy
    /// until one passes validation.
    pub fn read_block(&self, logical: u64) -> Result<Vec<u8>> {
        let len = self.nodesize as u64;
        let copies = self.mapping.map_block(logical, len)?;
        for copy in &copies {
            let Some(file) = self.files.get(&copy.devid) else {
                continue;
            };
            let mut buf = vec![0_u8; len as usize];
            if let Err(err) = file.read_exact_at(&mut buf, copy.physical) {
                warn!(
                    "read of block {} copy on devid {} failed: {}",
                    logical, copy.devid, err
                );
                continue;
            }
            let header = node_header(&buf);
            if header.bytenr != logical || header.fsid != self.fsid {
                continue;
            }
            if !verify_tree_block(&buf, self.csum_type) {
                continue;
            }
            return Ok(buf);
        }
        Err(RecoverError::BadChecksum { bytenr: logical })
    }

    /// Walk down to the leaf that would hold `key`.
    fn find_leaf(&self, root: u64, level: u8, key: &btrfs_disk_key) -> Result<Vec<u8>> {
        let mut block = self.read_block(root)?;
        for expect_level in (1..=level).rev() {
            let header = node_header(&block);
            if header.level != expect_level {
                return Err(RecoverError::FormatMismatch(format!(
                    "tree block {} has level {}, expected {}",
                    { header.bytenr },
                    header.level,
                    expect_level
                )));
            }
            let mut chosen = None;
            for ptr in node_key_ptrs(&block) {
                if ptr.key.cmp_key(key) == std::cmp::Ordering::Greater {
                    break;
                }
                chosen = Some(ptr.blockptr);
            }
            // if every key is greater, descend leftmost; the caller will
            // simply not find the item there
            let next = match chosen {
                Some(ptr) => ptr,
                None => node_key_ptrs(&block)
                    .next()
                    .map(|p| p.blockptr)
                    .ok_or_else(|| {
                        RecoverError::FormatMismatch("empty internal node".to_string())
                    })?,
            };
            block = self.read_block(next)?;
        }
        Ok(block)
    }

    /// Exact-key item lookup, returning a copy of the item data.
    pub fn search_item(
        &self,
        root: u64,
        level: u8,
        key: &btrfs_disk_key,
    ) -> Result<Option<Vec<u8>>> {
        let leaf = self.find_leaf(root, level, key)?;
        for (item, data) in leaf_items(&leaf) {
            match item.key.cmp_key(key) {
                std::cmp::Ordering::Equal => return Ok(Some(data.to_vec())),
                std::cmp::Ordering::Greater => break,
                std::cmp::Ordering::Less => {}
            }
        }
        Ok(None)
    }

    /// Resolve a tree's root block from its ROOT_ITEM in the root tree.
    fn find_tree_root(&self, objectid: u64) -> Result<(u64, u8)> {
        let key = btrfs_disk_key::new(objectid, BTRFS_ROOT_ITEM_KEY, 0);
        let leaf = self.find_leaf(self.tree_root, self.tree_root_level, &key)?;
        for (item, data) in leaf_items(&leaf) {
            let k = item.key;
            if k.objectid == objectid && k.item_type == BTRFS_ROOT_ITEM_KEY {
                let root_item = layout_at::<btrfs_root_item>(data, 0);
                return Ok((root_item.bytenr, root_item.level));
            }
        }
        Err(RecoverError::MissingRecord(format!(
            "root item for tree {}",
            objectid
        )))
    }

    /// Every leaf of `root` whose key span may contain objectids in
    /// `[start, end)`.
    fn leaves_in_range(&self, root: u64, level: u8, start: u64, end: u64) -> Result<Vec<u64>> {
        let mut leaves = Vec::new();
        self.collect_leaves(root, level, start, end, &mut leaves)?;
        Ok(leaves)
    }

    fn collect_leaves(
        &self,
        bytenr: u64,
        level: u8,
        start: u64,
        end: u64,
        out: &mut Vec<u64>,
    ) -> Result<()> {
        if level == 0 {
            out.push(bytenr);
            return Ok(());
        }
        let block = self.read_block(bytenr)?;
        let ptrs: Vec<(u64, u64)> = node_key_ptrs(&block)
            .map(|p| (p.key.objectid, p.blockptr))
            .collect();
        for (i, (first_objectid, blockptr)) in ptrs.iter().enumerate() {
            // child i spans keys up to (but excluding) child i+1's first key
            let next_objectid = ptrs.get(i + 1).map(|p| p.0).unwrap_or(u64::MAX);
            if *first_objectid < end && next_objectid >= start {
                self.collect_leaves(*blockptr, level - 1, start, end, out)?;
            }
        }
        Ok(())
    }

    pub fn start_transaction(&mut self) -> Transaction {
        let transid = self.sb.generation + 1;
        Transaction {
            fs: self,
            transid,
            dirty: BTreeMap::new(),
        }
    }
}

/// All mutations are staged here; the disk is untouched until `commit`.
pub struct Transaction<'a> {
    fs: &'a mut OpenFs,
    pub transid: u64,
    dirty: BTreeMap<u64, Vec<u8>>,
}

impl Transaction<'_> {
    fn read_block_staged(&self, logical: u64) -> Result<Vec<u8>> {
        if let Some(block) = self.dirty.get(&logical) {
            return Ok(block.clone());
        }
        self.fs.read_block(logical)
    }

    /// Delete every extent item covered by the block group at
    /// `[bg_start, bg_start + bg_len)` and zero the group's used counter,
    /// so the range reads as free space afterwards.
    pub fn remove_block_group_extent_items(&mut self, bg_start: u64, bg_len: u64) -> Result<()> {
        let end = bg_start + bg_len;
        let leaves = self.fs.leaves_in_range(
            self.fs.extent_root,
            self.fs.extent_root_level,
            bg_start,
            end,
        )?;
        for leaf_bytenr in leaves {
            let block = self.read_block_staged(leaf_bytenr)?;
            let mut builder = LeafBuilder::new(self.fs.nodesize as usize);
            let mut changed = false;
            for (item, data) in leaf_items(&block) {
                let key = item.key;
                let in_range = key.objectid >= bg_start && key.objectid < end;
                if in_range && key.item_type != BTRFS_BLOCK_GROUP_ITEM_KEY {
                    changed = true;
                    continue;
                }
                if in_range && key.item_type == BTRFS_BLOCK_GROUP_ITEM_KEY {
                    let mut bg_data = data.to_vec();
                    let bg_item = layout_at_mut::<btrfs_block_group_item>(&mut bg_data, 0);
                    if bg_item.used != 0 {
                        bg_item.used = 0;
                        changed = true;
                    }
                    builder.add_item(key, &bg_data);
                    continue;
                }
                builder.add_item(key, data);
            }
            if !changed {
                continue;
            }
            let header = node_header(&block);
            let stamp = NodeStamp {
                bytenr: leaf_bytenr,
                generation: header.generation,
                owner: header.owner,
                fsid: self.fs.fsid,
                chunk_tree_uuid: self.fs.chunk_tree_uuid,
                csum_type: self.fs.csum_type,
            };
            debug!(
                "staging extent tree leaf {} ({} items left)",
                leaf_bytenr,
                builder.nritems()
            );
            self.dirty.insert(leaf_bytenr, builder.finish(&stamp)?);
        }
        Ok(())
    }

    fn stamp(&self, bytenr: u64) -> NodeStamp {
        NodeStamp {
            bytenr,
            generation: self.transid,
            owner: BTRFS_CHUNK_TREE_OBJECTID,
            fsid: self.fs.fsid,
            chunk_tree_uuid: self.fs.chunk_tree_uuid,
            csum_type: self.fs.csum_type,
        }
    }

    /// Build the replacement chunk tree: a device item per member device
    /// and a chunk item per good chunk, packed into fresh leaves allocated
    /// inside the first SYSTEM chunk (whose extent items were just
    /// cleared). The superblock's chunk root is repointed at the result.
    pub fn rebuild_chunk_tree(&mut self, good_chunks: &[ChunkRecord]) -> Result<()> {
        let sys_chunk = good_chunks
            .iter()
            .find(|c| c.is_system())
            .ok_or_else(|| {
                RecoverError::MissingRecord("no system chunk survived recovery".to_string())
            })?;
        let nodesize = self.fs.nodesize as usize;

        let mut items: Vec<(btrfs_disk_key, Vec<u8>)> = Vec::new();
        let mut devices: Vec<_> = self.fs.fs_devices.devices.iter().collect();
        devices.sort_by_key(|d| d.devid);
        for dev in devices {
            let key = btrfs_disk_key::new(BTRFS_DEV_ITEMS_OBJECTID, BTRFS_DEV_ITEM_KEY, dev.devid);
            let mut dev_item = dev.dev_item;
            dev_item.generation = 0;
            dev_item.fsid = self.fs.fsid;
            items.push((key, layout_bytes(&dev_item).to_vec()));
        }
        let mut chunks: Vec<_> = good_chunks.iter().collect();
        chunks.sort_by_key(|c| c.offset);
        for chunk in chunks {
            let key = btrfs_disk_key::new(
                BTRFS_FIRST_CHUNK_TREE_OBJECTID,
                BTRFS_CHUNK_ITEM_KEY,
                chunk.offset,
            );
            items.push((key, chunk.to_chunk_item()));
        }

        // fresh blocks go at the front of the system chunk, one nodesize
        // apart
        let alloc_base = sys_chunk.offset;
        let alloc_end = sys_chunk.offset + sys_chunk.length;
        let mut next_bytenr = alloc_base;
        let mut leaves: Vec<(btrfs_disk_key, u64, Vec<u8>)> = Vec::new();
        let mut builder = LeafBuilder::new(nodesize);
        for (key, data) in items {
            if !builder.fits(data.len()) {
                let first_key = builder.first_key().expect("leaf cannot be empty");
                let block = builder.finish(&self.stamp(next_bytenr))?;
                leaves.push((first_key, next_bytenr, block));
                next_bytenr += nodesize as u64;
                builder = LeafBuilder::new(nodesize);
            }
            builder.add_item(key, &data);
        }
        let first_key = builder.first_key().expect("leaf cannot be empty");
        let block = builder.finish(&self.stamp(next_bytenr))?;
        leaves.push((first_key, next_bytenr, block));
        next_bytenr += nodesize as u64;

        let (chunk_root, chunk_root_level) = if leaves.len() == 1 {
            (leaves[0].1, 0)
        } else {
            let children: Vec<(btrfs_disk_key, u64)> =
                leaves.iter().map(|(key, bytenr, _)| (*key, *bytenr)).collect();
            let node_bytenr = next_bytenr;
            next_bytenr += nodesize as u64;
            let node = build_internal_node(nodesize, 1, &children, &self.stamp(node_bytenr))?;
            self.dirty.insert(node_bytenr, node);
            (node_bytenr, 1)
        };
        assert_le!(next_bytenr, alloc_end, "chunk tree outgrew the system chunk");

        for (_, bytenr, block) in leaves {
            self.dirty.insert(bytenr, block);
        }

        let sb = &mut self.fs.sb;
        sb.chunk_root = chunk_root;
        sb.chunk_root_level = chunk_root_level;
        sb.chunk_root_generation = self.transid;
        Ok(())
    }

    /// Re-derive the superblock's bootstrap chunk array from the good
    /// SYSTEM chunks.
    pub fn rebuild_sys_array(&mut self, good_chunks: &[ChunkRecord]) -> Result<()> {
        let sb = &mut self.fs.sb;
        sb.sys_chunk_array = [0; BTRFS_SYSTEM_CHUNK_ARRAY_SIZE];
        sb.sys_chunk_array_size = 0;

        let mut sys_chunks: Vec<_> = good_chunks.iter().filter(|c| c.is_system()).collect();
        sys_chunks.sort_by_key(|c| c.offset);

        let mut pos = 0;
        for chunk in sys_chunks {
            let key = btrfs_disk_key::new(
                BTRFS_FIRST_CHUNK_TREE_OBJECTID,
                BTRFS_CHUNK_ITEM_KEY,
                chunk.offset,
            );
            let item = chunk.to_chunk_item();
            let needed = std::mem::size_of::<btrfs_disk_key>() + item.len();
            if pos + needed > BTRFS_SYSTEM_CHUNK_ARRAY_SIZE {
                return Err(RecoverError::FormatMismatch(
                    "system chunk array overflow".to_string(),
                ));
            }
            sb.sys_chunk_array[pos..pos + std::mem::size_of::<btrfs_disk_key>()]
                .copy_from_slice(layout_bytes(&key));
            pos += std::mem::size_of::<btrfs_disk_key>();
            sb.sys_chunk_array[pos..pos + item.len()].copy_from_slice(&item);
            pos += item.len();
        }
        sb.sys_chunk_array_size = pos as u32;
        Ok(())
    }

    /// Write every staged block to every stripe copy it maps to, then the
    /// superblocks (all mirrors, all devices), then fence each device.
    /// Failing before the superblocks land leaves the old chunk tree
    /// authoritative.
    pub fn commit(self) -> Result<()> {
        for (logical, block) in &self.dirty {
            let copies = self.fs.mapping.map_block(*logical, block.len() as u64)?;
            for copy in &copies {
                let file = self.fs.files.get(&copy.devid).ok_or_else(|| {
                    RecoverError::MissingRecord(format!("device {} disappeared", copy.devid))
                })?;
                file.write_all_at(block, copy.physical)?;
            }
        }

        self.fs.sb.generation = self.transid;
        for dev in &self.fs.fs_devices.devices {
            let file = self.fs.files.get(&dev.devid).expect("device opened at open()");
            let size = device_size(file)?;
            let mut buf = Box::new([0_u8; BTRFS_SUPER_INFO_SIZE]);
            buf.copy_from_slice(layout_bytes(&*self.fs.sb));
            {
                let sb = layout_at_mut::<btrfs_super_block>(&mut buf[..], 0);
                sb.dev_item = dev.dev_item;
            }
            for mirror in 0..BTRFS_SUPER_MIRROR_MAX {
                let bytenr = btrfs_sb_offset(mirror);
                if bytenr + BTRFS_SUPER_INFO_SIZE as u64 > size {
                    continue;
                }
                {
                    let sb = layout_at_mut::<btrfs_super_block>(&mut buf[..], 0);
                    sb.bytenr = bytenr;
                }
                let csum = crate::csum::csum_data(&buf[BTRFS_CSUM_SIZE..], self.fs.csum_type)?;
                buf[..BTRFS_CSUM_SIZE].copy_from_slice(&csum);
                file.write_all_at(&buf[..], bytenr)?;
            }
            file.sync_all()?;
        }
        Ok(())
    }
}
