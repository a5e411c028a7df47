//! Logical to physical address mapping built from recovered chunks.
//!
//! The filesystem is opened through this map before any chunk tree exists
//! on disk again, so it has to answer the same questions the chunk tree
//! would: which device extents hold a logical range, for every RAID
//! profile.

use crate::device::FsDevices;
use crate::error::{RecoverError, Result};
use crate::raid::RaidProfile;
use crate::records::ChunkRecord;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapStripe {
    pub devid: u64,
    pub physical: u64,
}

pub struct MapEntry {
    pub start: u64,
    pub size: u64,
    pub type_flags: u64,
    pub stripe_len: u64,
    pub num_stripes: u16,
    pub sub_stripes: u16,
    pub stripes: Vec<MapStripe>,
}

impl MapEntry {
    fn profile(&self) -> RaidProfile {
        RaidProfile::from_flags(self.type_flags)
    }
}

#[derive(Default)]
pub struct MappingTree {
    entries: BTreeMap<u64, MapEntry>,
}

impl MappingTree {
    /// Build the map from the good chunk list. Every stripe must belong to
    /// a present device.
    pub fn build(chunks: &[ChunkRecord], devices: &FsDevices) -> Result<MappingTree> {
        let mut tree = MappingTree::default();
        for chunk in chunks {
            let mut stripes = Vec::with_capacity(chunk.stripes.len());
            for stripe in &chunk.stripes {
                if devices.find_by_devid(stripe.devid).is_none() {
                    return Err(RecoverError::MissingRecord(format!(
                        "device {} backing chunk {} is not present",
                        stripe.devid, chunk.offset
                    )));
                }
                stripes.push(MapStripe {
                    devid: stripe.devid,
                    physical: stripe.offset,
                });
            }
            let entry = MapEntry {
                start: chunk.offset,
                size: chunk.length,
                type_flags: chunk.type_flags,
                stripe_len: chunk.stripe_len,
                num_stripes: chunk.num_stripes,
                sub_stripes: chunk.sub_stripes,
                stripes,
            };
            // good chunks passed the cross check; overlap means the
            // in-memory model is corrupt
            assert!(
                tree.lookup(entry.start, entry.size).is_none(),
                "overlapping chunks in mapping tree"
            );
            tree.entries.insert(entry.start, entry);
        }
        Ok(tree)
    }

    pub fn lookup(&self, logical: u64, len: u64) -> Option<&MapEntry> {
        if let Some((_, entry)) = self.entries.range(..=logical).next_back() {
            if entry.start + entry.size > logical {
                return Some(entry);
            }
        }
        self.entries
            .range(logical..logical.checked_add(len)?)
            .next()
            .map(|(_, e)| e)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve `[logical, logical + len)` to every physical copy holding
    /// it. The range must not cross a stripe unit boundary; tree blocks
    /// never do.
    pub fn map_block(&self, logical: u64, len: u64) -> Result<Vec<MapStripe>> {
        let entry = self
            .lookup(logical, len)
            .filter(|e| logical >= e.start && logical + len <= e.start + e.size)
            .ok_or(RecoverError::MapIncomplete { logical })?;
        let offset = logical - entry.start;
        let profile = entry.profile();

        match profile {
            RaidProfile::Single | RaidProfile::Dup | RaidProfile::Raid1 => Ok(entry
                .stripes
                .iter()
                .map(|s| MapStripe {
                    devid: s.devid,
                    physical: s.physical + offset,
                })
                .collect()),
            _ => {
                let stripe_nr = offset / entry.stripe_len;
                let rem = offset % entry.stripe_len;
                if rem + len > entry.stripe_len {
                    return Err(RecoverError::FormatMismatch(format!(
                        "block at {} crosses a stripe boundary",
                        logical
                    )));
                }
                let row = stripe_nr / profile.data_stripes(entry.num_stripes);
                let index =
                    profile.stripe_index(stripe_nr, entry.num_stripes, entry.sub_stripes);
                let copies = if profile == RaidProfile::Raid10 {
                    entry.sub_stripes as usize
                } else {
                    1
                };
                Ok(entry.stripes[index..index + copies]
                    .iter()
                    .map(|s| MapStripe {
                        devid: s.devid,
                        physical: s.physical + row * entry.stripe_len + rem,
                    })
                    .collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::StripeRecord;
    use crate::structures::*;

    fn chunk(offset: u64, length: u64, flags: u64, stripes: Vec<StripeRecord>) -> ChunkRecord {
        let n = stripes.len() as u16;
        ChunkRecord {
            offset,
            length,
            generation: 1,
            owner: BTRFS_CHUNK_TREE_OBJECTID,
            stripe_len: BTRFS_STRIPE_LEN,
            type_flags: flags,
            io_align: BTRFS_STRIPE_LEN as u32,
            io_width: BTRFS_STRIPE_LEN as u32,
            sector_size: 4096,
            num_stripes: n,
            sub_stripes: RaidProfile::from_flags(flags).sub_stripes(),
            stripes,
        }
    }

    fn stripe(devid: u64, offset: u64) -> StripeRecord {
        StripeRecord {
            devid,
            offset,
            dev_uuid: [devid as u8; BTRFS_UUID_SIZE],
        }
    }

    // map entries can be exercised without real devices
    fn tree_of(chunks: &[ChunkRecord]) -> MappingTree {
        let mut tree = MappingTree::default();
        for c in chunks {
            tree.entries.insert(
                c.offset,
                MapEntry {
                    start: c.offset,
                    size: c.length,
                    type_flags: c.type_flags,
                    stripe_len: c.stripe_len,
                    num_stripes: c.num_stripes,
                    sub_stripes: c.sub_stripes,
                    stripes: c
                        .stripes
                        .iter()
                        .map(|s| MapStripe {
                            devid: s.devid,
                            physical: s.offset,
                        })
                        .collect(),
                },
            );
        }
        tree
    }

    #[test]
    fn raid1_maps_to_both_copies() {
        let gib = 1 << 30;
        let tree = tree_of(&[chunk(
            gib,
            gib,
            BTRFS_BLOCK_GROUP_METADATA | BTRFS_BLOCK_GROUP_RAID1,
            vec![stripe(1, 0), stripe(2, 0)],
        )]);
        let copies = tree.map_block(gib + 16384, 16384).unwrap();
        assert_eq!(
            copies,
            vec![
                MapStripe {
                    devid: 1,
                    physical: 16384
                },
                MapStripe {
                    devid: 2,
                    physical: 16384
                }
            ]
        );
    }

    #[test]
    fn raid0_alternates_stripes() {
        let tree = tree_of(&[chunk(
            0,
            2 << 20,
            BTRFS_BLOCK_GROUP_METADATA | BTRFS_BLOCK_GROUP_RAID0,
            vec![stripe(1, 0x10000), stripe(2, 0x20000)],
        )]);
        // first stripe unit lands on devid 1
        assert_eq!(
            tree.map_block(0, 16384).unwrap(),
            vec![MapStripe {
                devid: 1,
                physical: 0x10000
            }]
        );
        // second stripe unit lands on devid 2, same row
        assert_eq!(
            tree.map_block(65536, 16384).unwrap(),
            vec![MapStripe {
                devid: 2,
                physical: 0x20000
            }]
        );
        // third unit wraps to devid 1, next row
        assert_eq!(
            tree.map_block(131072, 16384).unwrap(),
            vec![MapStripe {
                devid: 1,
                physical: 0x20000
            }]
        );
    }

    #[test]
    fn unmapped_address_reports_incomplete() {
        let tree = tree_of(&[]);
        assert!(matches!(
            tree.map_block(12345, 4096),
            Err(RecoverError::MapIncomplete { logical: 12345 })
        ));
    }

    #[test]
    fn straddling_read_rejected() {
        let tree = tree_of(&[chunk(
            0,
            2 << 20,
            BTRFS_BLOCK_GROUP_METADATA | BTRFS_BLOCK_GROUP_RAID0,
            vec![stripe(1, 0), stripe(2, 0)],
        )]);
        assert!(tree.map_block(65536 - 4096, 16384).is_err());
    }
}
