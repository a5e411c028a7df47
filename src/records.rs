//! Records extracted from scanned tree leaves, and the generation-keyed
//! caches that deduplicate them.
//!
//! Many transactions' worth of records coexist on a scanned disk. Each cache
//! keeps exactly one record per key range: a newer generation replaces an
//! older one, identical same-generation copies merge, and same-generation
//! copies that disagree raise a conflict.

use crate::error::{RecoverError, Result};
use crate::raid::RaidProfile;
use crate::structures::*;
use log::warn;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mirror {
    pub devid: u64,
    pub offset: u64,
}

/// One distinct tree block found during the scan, with every physical
/// location it was seen at.
#[derive(Clone, Debug)]
pub struct ExtentRecord {
    pub start: u64,
    pub size: u64,
    pub generation: u64,
    pub csum: BtrfsCsum,
    pub mirrors: Vec<Mirror>,
}

impl ExtentRecord {
    pub fn from_block(block: &[u8], devid: u64, physical: u64) -> ExtentRecord {
        let header = layout_at::<btrfs_header>(block, 0);
        ExtentRecord {
            start: header.bytenr,
            size: block.len() as u64,
            generation: header.generation,
            csum: header.csum,
            mirrors: vec![Mirror {
                devid,
                offset: physical,
            }],
        }
    }

    /// True if any tracked mirror lies inside the given device extent.
    pub fn mirror_in_device_extent(&self, devext: &DeviceExtentRecord) -> Option<Mirror> {
        self.mirrors
            .iter()
            .find(|m| {
                m.devid == devext.objectid
                    && m.offset >= devext.offset
                    && m.offset < devext.offset + devext.length
            })
            .copied()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct StripeRecord {
    pub devid: u64,
    pub offset: u64,
    pub dev_uuid: BtrfsUuid,
}

/// A chunk item, either parsed from disk or synthesized from an orphan
/// block group.
#[derive(Clone, Debug)]
pub struct ChunkRecord {
    /// logical start (the chunk item's key offset)
    pub offset: u64,
    pub length: u64,
    pub generation: u64,
    pub owner: u64,
    pub stripe_len: u64,
    pub type_flags: u64,
    pub io_align: u32,
    pub io_width: u32,
    pub sector_size: u32,
    pub num_stripes: u16,
    pub sub_stripes: u16,
    pub stripes: Vec<StripeRecord>,
}

impl ChunkRecord {
    pub fn from_item(generation: u64, logical: u64, data: &[u8]) -> Result<ChunkRecord> {
        if data.len() < std::mem::size_of::<btrfs_chunk>() {
            return Err(RecoverError::FormatMismatch(format!(
                "chunk item at {} too short ({} bytes)",
                logical,
                data.len()
            )));
        }
        let chunk = layout_at::<btrfs_chunk>(data, 0);
        let num_stripes = chunk.num_stripes;
        if data.len() != chunk_item_size(num_stripes as usize) {
            return Err(RecoverError::FormatMismatch(format!(
                "chunk item at {} has {} stripes but {} bytes",
                logical,
                num_stripes,
                data.len()
            )));
        }
        let mut stripes = Vec::with_capacity(num_stripes as usize);
        for i in 0..num_stripes as usize {
            let stripe = layout_at::<btrfs_stripe>(
                data,
                std::mem::size_of::<btrfs_chunk>() + i * std::mem::size_of::<btrfs_stripe>(),
            );
            stripes.push(StripeRecord {
                devid: stripe.devid,
                offset: stripe.offset,
                dev_uuid: stripe.dev_uuid,
            });
        }
        Ok(ChunkRecord {
            offset: logical,
            length: chunk.length,
            generation,
            owner: chunk.owner,
            stripe_len: chunk.stripe_len,
            type_flags: chunk.r#type,
            io_align: chunk.io_align,
            io_width: chunk.io_width,
            sector_size: chunk.sector_size,
            num_stripes,
            sub_stripes: chunk.sub_stripes,
            stripes,
        })
    }

    pub fn profile(&self) -> RaidProfile {
        RaidProfile::from_flags(self.type_flags)
    }

    /// Length every device extent backing this chunk must have.
    pub fn expected_stripe_length(&self) -> u64 {
        self.profile()
            .stripe_length(self.length, self.num_stripes)
    }

    /// Stripe slot a logical address inside this chunk belongs to.
    pub fn stripe_index(&self, logical: u64) -> usize {
        let stripe_nr = (logical - self.offset) / self.stripe_len;
        self.profile()
            .stripe_index(stripe_nr, self.num_stripes, self.sub_stripes)
    }

    /// Logical start of the stripe unit after the one containing `logical`.
    pub fn next_stripe_logical(&self, logical: u64) -> u64 {
        let offset = logical - self.offset;
        (offset / self.stripe_len) * self.stripe_len + self.stripe_len + self.offset
    }

    pub fn is_system(&self) -> bool {
        self.type_flags & BTRFS_BLOCK_GROUP_SYSTEM != 0
    }

    /// Serialize as an on-disk chunk item (btrfs_chunk + stripe array).
    pub fn to_chunk_item(&self) -> Vec<u8> {
        assert_eq!(self.stripes.len(), self.num_stripes as usize);
        let mut buf = vec![0_u8; chunk_item_size(self.num_stripes as usize)];
        {
            let chunk = layout_at_mut::<btrfs_chunk>(&mut buf, 0);
            chunk.length = self.length;
            chunk.owner = self.owner;
            chunk.stripe_len = self.stripe_len;
            chunk.r#type = self.type_flags;
            chunk.io_align = self.io_align;
            chunk.io_width = self.io_width;
            chunk.sector_size = self.sector_size;
            chunk.num_stripes = self.num_stripes;
            chunk.sub_stripes = self.sub_stripes;
        }
        for (i, rec) in self.stripes.iter().enumerate() {
            let stripe = layout_at_mut::<btrfs_stripe>(
                &mut buf,
                std::mem::size_of::<btrfs_chunk>() + i * std::mem::size_of::<btrfs_stripe>(),
            );
            stripe.devid = rec.devid;
            stripe.offset = rec.offset;
            stripe.dev_uuid = rec.dev_uuid;
        }
        buf
    }
}

/// A block group item: the allocation-side twin of a chunk.
#[derive(Clone, Debug)]
pub struct BlockGroupRecord {
    /// logical start (key objectid)
    pub objectid: u64,
    /// length (key offset)
    pub offset: u64,
    pub generation: u64,
    pub flags: u64,
    pub used: u64,
}

impl BlockGroupRecord {
    pub fn from_item(generation: u64, objectid: u64, length: u64, data: &[u8]) -> BlockGroupRecord {
        let item = layout_at::<btrfs_block_group_item>(data, 0);
        BlockGroupRecord {
            objectid,
            offset: length,
            generation,
            flags: item.flags,
            used: item.used,
        }
    }
}

/// A device extent item: a physical range on one device backing a chunk.
#[derive(Clone, Debug)]
pub struct DeviceExtentRecord {
    /// devid (key objectid)
    pub objectid: u64,
    /// physical start on the device (key offset)
    pub offset: u64,
    pub length: u64,
    pub chunk_offset: u64,
    pub generation: u64,
}

impl DeviceExtentRecord {
    pub fn from_item(generation: u64, devid: u64, physical: u64, data: &[u8]) -> DeviceExtentRecord {
        let item = layout_at::<btrfs_dev_extent>(data, 0);
        DeviceExtentRecord {
            objectid: devid,
            offset: physical,
            length: item.length,
            chunk_offset: item.chunk_offset,
            generation,
        }
    }
}

/// Behavior a record needs for generation-keyed caching.
pub trait CacheRecord {
    /// Key namespace; devid for device extents, 0 for logical ranges.
    fn group(&self) -> u64 {
        0
    }
    fn start(&self) -> u64;
    fn size(&self) -> u64;
    fn generation(&self) -> u64;
    /// Equality over everything except the generation (and mirror list).
    fn same_content(&self, other: &Self) -> bool;
    /// Fold an identical same-generation sighting into this record.
    fn merge(&mut self, _other: &Self) {}
    fn describe(&self) -> String;
}

impl CacheRecord for ExtentRecord {
    fn start(&self) -> u64 {
        self.start
    }
    fn size(&self) -> u64 {
        self.size
    }
    fn generation(&self) -> u64 {
        self.generation
    }
    fn same_content(&self, other: &Self) -> bool {
        self.start == other.start && self.size == other.size && self.csum == other.csum
    }
    fn merge(&mut self, other: &Self) {
        for mirror in &other.mirrors {
            if self.mirrors.len() >= BTRFS_NUM_MIRRORS {
                warn!(
                    "tree block {} seen on more than {} mirrors, dropping (devid {} offset {})",
                    self.start, BTRFS_NUM_MIRRORS, mirror.devid, mirror.offset
                );
                return;
            }
            self.mirrors.push(*mirror);
        }
    }
    fn describe(&self) -> String {
        format!("tree block [{}, {})", self.start, self.start + self.size)
    }
}

impl CacheRecord for ChunkRecord {
    fn start(&self) -> u64 {
        self.offset
    }
    fn size(&self) -> u64 {
        self.length
    }
    fn generation(&self) -> u64 {
        self.generation
    }
    fn same_content(&self, other: &Self) -> bool {
        self.offset == other.offset
            && self.length == other.length
            && self.owner == other.owner
            && self.stripe_len == other.stripe_len
            && self.type_flags == other.type_flags
            && self.io_align == other.io_align
            && self.io_width == other.io_width
            && self.sector_size == other.sector_size
            && self.num_stripes == other.num_stripes
            && self.sub_stripes == other.sub_stripes
            && self.stripes == other.stripes
    }
    fn describe(&self) -> String {
        format!("chunk [{}, {})", self.offset, self.offset + self.length)
    }
}

impl CacheRecord for BlockGroupRecord {
    fn start(&self) -> u64 {
        self.objectid
    }
    fn size(&self) -> u64 {
        self.offset
    }
    fn generation(&self) -> u64 {
        self.generation
    }
    fn same_content(&self, other: &Self) -> bool {
        self.objectid == other.objectid
            && self.offset == other.offset
            && self.flags == other.flags
            && self.used == other.used
    }
    fn describe(&self) -> String {
        format!(
            "block group [{}, {})",
            self.objectid,
            self.objectid + self.offset
        )
    }
}

impl CacheRecord for DeviceExtentRecord {
    fn group(&self) -> u64 {
        self.objectid
    }
    fn start(&self) -> u64 {
        self.offset
    }
    fn size(&self) -> u64 {
        self.length
    }
    fn generation(&self) -> u64 {
        self.generation
    }
    fn same_content(&self, other: &Self) -> bool {
        self.objectid == other.objectid
            && self.offset == other.offset
            && self.length == other.length
            && self.chunk_offset == other.chunk_offset
    }
    fn describe(&self) -> String {
        format!(
            "device extent devid {} [{}, {})",
            self.objectid,
            self.offset,
            self.offset + self.length
        )
    }
}

/// Range cache keyed by `(group, start)` holding at most one record per
/// range, resolved by generation.
pub struct GenerationCache<R: CacheRecord> {
    map: BTreeMap<(u64, u64), R>,
}

impl<R: CacheRecord> Default for GenerationCache<R> {
    fn default() -> Self {
        GenerationCache {
            map: BTreeMap::new(),
        }
    }
}

impl<R: CacheRecord> GenerationCache<R> {
    pub fn new() -> GenerationCache<R> {
        Default::default()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn values(&self) -> impl Iterator<Item = &R> {
        self.map.values()
    }

    pub fn into_records(self) -> impl Iterator<Item = R> {
        self.map.into_values()
    }

    fn lookup_key(&self, group: u64, start: u64, size: u64) -> Option<(u64, u64)> {
        // cached ranges never overlap each other, so only the entry at or
        // before `start` plus the first entry inside the range can match
        if let Some(((g, s), r)) = self.map.range(..=(group, start)).next_back() {
            if *g == group && *s + r.size() > start {
                return Some((*g, *s));
            }
        }
        let end = start.checked_add(size)?;
        if let Some((key, _)) = self.map.range((group, start)..(group, end)).next() {
            return Some(*key);
        }
        None
    }

    /// Any record overlapping `[start, start + size)` within `group`.
    pub fn lookup(&self, group: u64, start: u64, size: u64) -> Option<&R> {
        self.lookup_key(group, start, size)
            .and_then(|key| self.map.get(&key))
    }

    /// The first record starting inside `[start, end)` within `group`.
    pub fn first_in_range(&self, group: u64, start: u64, end: u64) -> Option<&R> {
        self.map
            .range((group, start)..(group, end))
            .next()
            .map(|(_, r)| r)
    }

    /// The record at exactly `(group, start)` with exactly `size`.
    pub fn lookup_exact(&self, group: u64, start: u64, size: u64) -> Option<&R> {
        self.map
            .get(&(group, start))
            .filter(|rec| rec.size() == size)
    }

    pub fn remove_exact(&mut self, group: u64, start: u64) -> Option<R> {
        self.map.remove(&(group, start))
    }

    /// Generation-resolved insertion:
    /// older newcomers are dropped, newer ones evict every record they
    /// overlap, and identical same-generation sightings merge. A
    /// same-generation record with different content is a conflict.
    pub fn insert(&mut self, rec: R) -> Result<()> {
        loop {
            let Some(key) = self.lookup_key(rec.group(), rec.start(), rec.size()) else {
                self.map.insert((rec.group(), rec.start()), rec);
                return Ok(());
            };
            let exist = self.map.get_mut(&key).expect("key just looked up");
            if exist.generation() > rec.generation() {
                return Ok(());
            }
            if exist.generation() == rec.generation() {
                if exist.same_content(&rec) {
                    exist.merge(&rec);
                    return Ok(());
                }
                return Err(RecoverError::Conflict(format!(
                    "{} disagrees with {} at generation {}",
                    rec.describe(),
                    exist.describe(),
                    rec.generation()
                )));
            }
            // the newcomer supersedes this record; the freed range may
            // still overlap further old records, so look up again
            self.map.remove(&key);
        }
    }
}

pub type ExtentBufferCache = GenerationCache<ExtentRecord>;
pub type ChunkCache = GenerationCache<ChunkRecord>;
pub type BlockGroupCache = GenerationCache<BlockGroupRecord>;
pub type DeviceExtentCache = GenerationCache<DeviceExtentRecord>;

#[cfg(test)]
mod tests {
    use super::*;

    fn bg(objectid: u64, length: u64, generation: u64, flags: u64) -> BlockGroupRecord {
        BlockGroupRecord {
            objectid,
            offset: length,
            generation,
            flags,
            used: 0,
        }
    }

    #[test]
    fn newer_generation_wins() {
        let mut cache = BlockGroupCache::new();
        cache.insert(bg(0, 100, 5, 1)).unwrap();
        cache.insert(bg(0, 100, 7, 2)).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.values().next().unwrap().generation, 7);
        // an older record arriving later is ignored
        cache.insert(bg(0, 100, 6, 4)).unwrap();
        assert_eq!(cache.values().next().unwrap().generation, 7);
    }

    #[test]
    fn newer_record_evicts_all_overlaps() {
        // /--old bg 1--//--old bg 2--/
        //        /--new bg--/
        let mut cache = BlockGroupCache::new();
        cache.insert(bg(0, 100, 3, 1)).unwrap();
        cache.insert(bg(100, 100, 3, 1)).unwrap();
        cache.insert(bg(50, 100, 9, 1)).unwrap();
        assert_eq!(cache.len(), 1);
        let rec = cache.values().next().unwrap();
        assert_eq!(rec.objectid, 50);
        assert_eq!(rec.generation, 9);
    }

    #[test]
    fn same_generation_conflict() {
        let mut cache = BlockGroupCache::new();
        cache.insert(bg(0, 100, 5, 1)).unwrap();
        assert!(cache.insert(bg(0, 100, 5, 1)).is_ok());
        assert!(matches!(
            cache.insert(bg(0, 100, 5, 2)),
            Err(RecoverError::Conflict(_))
        ));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn device_extents_keyed_per_device() {
        let mut cache = DeviceExtentCache::new();
        let devext = |devid, offset| DeviceExtentRecord {
            objectid: devid,
            offset,
            length: 100,
            chunk_offset: 0,
            generation: 1,
        };
        cache.insert(devext(1, 0)).unwrap();
        cache.insert(devext(2, 0)).unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.lookup(1, 50, 10).is_some());
        assert!(cache.lookup(3, 50, 10).is_none());
    }

    #[test]
    fn mirror_merge_is_capped() {
        let mut cache = ExtentBufferCache::new();
        let rec = |devid, physical| ExtentRecord {
            start: 4096,
            size: 4096,
            generation: 8,
            csum: [0xaa; BTRFS_CSUM_SIZE],
            mirrors: vec![Mirror {
                devid,
                offset: physical,
            }],
        };
        cache.insert(rec(1, 0)).unwrap();
        cache.insert(rec(2, 0)).unwrap();
        cache.insert(rec(3, 0)).unwrap();
        let stored = cache.values().next().unwrap();
        assert_eq!(stored.mirrors.len(), BTRFS_NUM_MIRRORS);
        assert_eq!(stored.mirrors[0].devid, 1);
        assert_eq!(stored.mirrors[1].devid, 2);
    }

    #[test]
    fn same_generation_different_csum_conflicts() {
        let mut cache = ExtentBufferCache::new();
        let rec = |csum: u8| ExtentRecord {
            start: 4096,
            size: 4096,
            generation: 8,
            csum: [csum; BTRFS_CSUM_SIZE],
            mirrors: vec![Mirror {
                devid: 1,
                offset: 0,
            }],
        };
        cache.insert(rec(0xaa)).unwrap();
        assert!(cache.insert(rec(0xbb)).is_err());
    }

    #[test]
    fn chunk_item_round_trip() {
        let chunk = ChunkRecord {
            offset: 1 << 30,
            length: 1 << 30,
            generation: 11,
            owner: BTRFS_CHUNK_TREE_OBJECTID,
            stripe_len: BTRFS_STRIPE_LEN,
            type_flags: BTRFS_BLOCK_GROUP_METADATA | BTRFS_BLOCK_GROUP_RAID1,
            io_align: BTRFS_STRIPE_LEN as u32,
            io_width: BTRFS_STRIPE_LEN as u32,
            sector_size: 4096,
            num_stripes: 2,
            sub_stripes: 1,
            stripes: vec![
                StripeRecord {
                    devid: 1,
                    offset: 0x100000,
                    dev_uuid: [1; BTRFS_UUID_SIZE],
                },
                StripeRecord {
                    devid: 2,
                    offset: 0x200000,
                    dev_uuid: [2; BTRFS_UUID_SIZE],
                },
            ],
        };
        let item = chunk.to_chunk_item();
        assert_eq!(item.len(), chunk_item_size(2));
        let parsed = ChunkRecord::from_item(11, 1 << 30, &item).unwrap();
        assert!(parsed.same_content(&chunk));
    }

    #[test]
    fn stripe_unit_walk() {
        let chunk = ChunkRecord {
            offset: 0,
            length: 2 << 20,
            generation: 1,
            owner: BTRFS_CHUNK_TREE_OBJECTID,
            stripe_len: 64 * 1024,
            type_flags: BTRFS_BLOCK_GROUP_METADATA | BTRFS_BLOCK_GROUP_RAID0,
            io_align: 0,
            io_width: 0,
            sector_size: 4096,
            num_stripes: 2,
            sub_stripes: 1,
            stripes: Vec::new(),
        };
        assert_eq!(chunk.stripe_index(0), 0);
        assert_eq!(chunk.stripe_index(64 * 1024), 1);
        assert_eq!(chunk.next_stripe_logical(0), 64 * 1024);
        assert_eq!(chunk.next_stripe_logical(64 * 1024 + 17), 128 * 1024);
    }
}
