//! Chunk synthesis for orphan block groups.
//!
//! A block group whose chunk item is gone still leaves enough evidence on
//! disk to rebuild the chunk: the device extents that reference it, and
//! (for the striped layouts) the tree blocks physically present inside
//! those extents, whose logical addresses pin stripes to slots.

use crate::chunk_recover::RecoverControl;
use crate::device::FsDevices;
use crate::raid::RaidProfile;
use crate::records::*;
use crate::structures::*;
use log::debug;

enum Synthesis {
    Good,
    Unrepaired,
    Bad,
}

/// Pull every orphan device extent referencing `chunk_offset` out of the
/// cache, in (devid, offset) order.
fn take_device_extents(
    cache: &mut DeviceExtentCache,
    chunk_offset: u64,
) -> Vec<DeviceExtentRecord> {
    let keys: Vec<(u64, u64)> = cache
        .values()
        .filter(|d| d.chunk_offset == chunk_offset)
        .map(|d| (d.objectid, d.offset))
        .collect();
    keys.into_iter()
        .filter_map(|(group, start)| cache.remove_exact(group, start))
        .collect()
}

/// The stripe-count and stripe-length rules a block group's device
/// extents must satisfy before a chunk can be synthesized from them.
fn verify_device_extents(bg: &BlockGroupRecord, devexts: &[DeviceExtentRecord]) -> bool {
    let profile = RaidProfile::from_flags(bg.flags);
    if let Some(expected) = profile.num_stripes_expected() {
        if expected as usize != devexts.len() {
            debug!(
                "block group {} has {} device extents, wants {}",
                bg.objectid,
                devexts.len(),
                expected
            );
            return false;
        }
    }
    let stripe_length = profile.stripe_length(bg.offset, devexts.len() as u16);
    if stripe_length == 0 {
        debug!(
            "block group {} cannot spread over {} stripes",
            bg.objectid,
            devexts.len()
        );
        return false;
    }
    devexts.iter().all(|d| d.length == stripe_length)
}

fn fill_stripe(
    chunk: &mut ChunkRecord,
    slot: usize,
    devext: &DeviceExtentRecord,
    fs_devices: &FsDevices,
) -> bool {
    let Some(device) = fs_devices.find_by_devid(devext.objectid) else {
        debug!("no device with devid {}", devext.objectid);
        return false;
    };
    chunk.stripes[slot] = StripeRecord {
        devid: devext.objectid,
        offset: devext.offset,
        dev_uuid: device.uuid,
    };
    true
}

/// Layouts with interchangeable stripes: any assignment order works.
fn rebuild_unordered_chunk_stripes(
    fs_devices: &FsDevices,
    chunk: &mut ChunkRecord,
    devexts: &[DeviceExtentRecord],
) -> Synthesis {
    for (slot, devext) in devexts.iter().enumerate() {
        if !fill_stripe(chunk, slot, devext, fs_devices) {
            return Synthesis::Bad;
        }
    }
    Synthesis::Good
}

/// Striped metadata: tree blocks found inside the device extents dictate
/// which extent sits in which stripe slot. Slots no surviving data pins
/// down may be filled freely afterwards.
fn rebuild_ordered_meta_chunk_stripes(
    eb_cache: &ExtentBufferCache,
    fs_devices: &FsDevices,
    chunk: &mut ChunkRecord,
    mut devexts: Vec<DeviceExtentRecord>,
) -> Synthesis {
    let start = chunk.offset;
    let end = chunk.offset + chunk.length;
    let num_stripes = chunk.num_stripes as usize;

    let mut er_opt = eb_cache.first_in_range(0, start, end);
    if er_opt.is_none() {
        /* No used space, we can reorder the stripes freely. */
        return rebuild_unordered_chunk_stripes(fs_devices, chunk, &devexts);
    }

    while let Some(er) = er_opt {
        let index = chunk.stripe_index(er.start);
        // devid 0 is not a valid device id, so it marks an empty slot
        if chunk.stripes[index].devid == 0 {
            let mut slot = index;
            let mut matched = false;
            let mut i = 0;
            while i < devexts.len() {
                if slot < num_stripes && er.mirror_in_device_extent(&devexts[i]).is_some() {
                    let devext = devexts.remove(i);
                    if !fill_stripe(chunk, slot, &devext, fs_devices) {
                        return Synthesis::Bad;
                    }
                    slot += 1;
                    matched = true;
                } else {
                    i += 1;
                }
            }
            if !matched {
                // data sits in this slot but no orphan device extent
                // contains it; the chunk cannot be trusted
                debug!(
                    "chunk {}: no device extent holds the data of stripe {}",
                    chunk.offset, index
                );
                return Synthesis::Bad;
            }
        }
        let cursor = chunk.next_stripe_logical(er.start);
        if cursor >= end {
            break;
        }
        er_opt = eb_cache.first_in_range(0, cursor, end);
    }

    if devexts.is_empty() {
        return Synthesis::Good;
    }

    if matches!(chunk.profile(), RaidProfile::Raid5 | RaidProfile::Raid6) {
        // the leftover assignments could only be derived from parity,
        // which this pass does not reconstruct
        return Synthesis::Unrepaired;
    }

    /* There is no data on the lost stripes, we can reorder them freely. */
    for slot in 0..num_stripes {
        if chunk.stripes[slot].devid != 0 {
            continue;
        }
        let devext = devexts.remove(0);
        if !fill_stripe(chunk, slot, &devext, fs_devices) {
            return Synthesis::Bad;
        }
    }
    assert!(devexts.is_empty());
    Synthesis::Good
}

fn rebuild_chunk_stripes(
    rc: &RecoverControl,
    chunk: &mut ChunkRecord,
    devexts: Vec<DeviceExtentRecord>,
) -> Synthesis {
    /*
     * All the data in the system metadata chunk will be dropped, so we
     * need not guarantee the order of its stripes.
     */
    let ordered = chunk.profile().is_ordered();
    if chunk.type_flags & BTRFS_BLOCK_GROUP_METADATA != 0 && ordered {
        rebuild_ordered_meta_chunk_stripes(&rc.eb_cache, &rc.fs_devices, chunk, devexts)
    } else if chunk.type_flags & BTRFS_BLOCK_GROUP_DATA != 0 && ordered {
        /* handled after the fs is opened */
        Synthesis::Unrepaired
    } else {
        rebuild_unordered_chunk_stripes(&rc.fs_devices, chunk, &devexts)
    }
}

/// Synthesize a chunk for every orphan block group and classify it.
pub fn recover_chunks(rc: &mut RecoverControl) {
    let bg_cache = std::mem::take(&mut rc.bg_cache);
    for bg in bg_cache.into_records() {
        let devexts = take_device_extents(&mut rc.devext_cache, bg.objectid);
        let nstripes = devexts.len();
        let profile = RaidProfile::from_flags(bg.flags);
        let mut chunk = ChunkRecord {
            offset: bg.objectid,
            length: bg.offset,
            generation: bg.generation,
            owner: BTRFS_CHUNK_TREE_OBJECTID,
            stripe_len: BTRFS_STRIPE_LEN,
            type_flags: bg.flags,
            io_align: BTRFS_STRIPE_LEN as u32,
            io_width: BTRFS_STRIPE_LEN as u32,
            sector_size: rc.sectorsize,
            num_stripes: nstripes as u16,
            sub_stripes: profile.sub_stripes(),
            stripes: vec![StripeRecord::default(); nstripes],
        };

        if nstripes == 0 {
            rc.bad_chunks.push(chunk);
            continue;
        }
        if !verify_device_extents(&bg, &devexts) {
            rc.bad_chunks.push(chunk);
            continue;
        }
        match rebuild_chunk_stripes(rc, &mut chunk, devexts) {
            Synthesis::Good => rc.good_chunks.push(chunk),
            Synthesis::Unrepaired => rc.unrepaired_chunks.push(chunk),
            Synthesis::Bad => rc.bad_chunks.push(chunk),
        }
    }
    /*
     * Orphan device extents left over at this point have neither chunk nor
     * block group; they are droppings of transactions the filesystem
     * already dropped, so losing them is fine.
     */
    for devext in rc.devext_cache.values() {
        debug!(
            "dropping stale device extent devid {} offset {}",
            devext.objectid, devext.offset
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use std::path::PathBuf;

    fn test_dev_item(devid: u64) -> btrfs_dev_item {
        btrfs_dev_item {
            devid,
            total_bytes: 1 << 30,
            bytes_used: 0,
            io_align: 4096,
            io_width: 4096,
            sector_size: 4096,
            r#type: 0,
            generation: 0,
            start_offset: 0,
            dev_group: 0,
            seek_speed: 0,
            bandwidth: 0,
            uuid: [devid as u8; BTRFS_UUID_SIZE],
            fsid: [0x42; BTRFS_FSID_SIZE],
        }
    }

    fn test_fs_devices(devids: &[u64]) -> FsDevices {
        let devices = devids
            .iter()
            .map(|devid| Device {
                path: PathBuf::from(format!("/dev/fake{}", devid)),
                devid: *devid,
                uuid: [*devid as u8; BTRFS_UUID_SIZE],
                dev_item: test_dev_item(*devid),
                total_bytes: 1 << 30,
            })
            .collect();
        FsDevices::from_devices([0x42; BTRFS_FSID_SIZE], devices)
    }

    fn test_rc(devids: &[u64]) -> RecoverControl {
        RecoverControl::with_devices(test_fs_devices(devids))
    }

    fn bg(objectid: u64, length: u64, flags: u64) -> BlockGroupRecord {
        BlockGroupRecord {
            objectid,
            offset: length,
            generation: 10,
            flags,
            used: 0,
        }
    }

    fn devext(devid: u64, offset: u64, length: u64, chunk_offset: u64) -> DeviceExtentRecord {
        DeviceExtentRecord {
            objectid: devid,
            offset,
            length,
            chunk_offset,
            generation: 10,
        }
    }

    #[test]
    fn raid1_metadata_chunk_is_resynthesized() {
        let gib = 1_u64 << 30;
        let flags = BTRFS_BLOCK_GROUP_METADATA | BTRFS_BLOCK_GROUP_RAID1;
        let mut rc = test_rc(&[1, 2]);
        rc.bg_cache.insert(bg(gib, gib, flags)).unwrap();
        rc.devext_cache.insert(devext(1, 0, gib, gib)).unwrap();
        rc.devext_cache.insert(devext(2, 0, gib, gib)).unwrap();

        recover_chunks(&mut rc);

        assert_eq!(rc.good_chunks.len(), 1);
        assert!(rc.bad_chunks.is_empty());
        let chunk = &rc.good_chunks[0];
        assert_eq!(chunk.num_stripes, 2);
        assert_eq!(chunk.offset, gib);
        assert_eq!(chunk.length, gib);
        let mut devids: Vec<u64> = chunk.stripes.iter().map(|s| s.devid).collect();
        devids.sort_unstable();
        assert_eq!(devids, vec![1, 2]);
        assert!(rc.devext_cache.is_empty());
    }

    #[test]
    fn raid0_metadata_respects_data_placement() {
        let mib = 1_u64 << 20;
        let flags = BTRFS_BLOCK_GROUP_METADATA | BTRFS_BLOCK_GROUP_RAID0;
        let mut rc = test_rc(&[1, 2]);
        rc.bg_cache.insert(bg(0, 2 * mib, flags)).unwrap();
        rc.devext_cache.insert(devext(1, 0, mib, 0)).unwrap();
        rc.devext_cache.insert(devext(2, 0, mib, 0)).unwrap();
        // a leaf at logical 0 was physically found on device 1, offset 0:
        // stripe slot 0 must be device 1
        rc.eb_cache
            .insert(ExtentRecord {
                start: 0,
                size: 16384,
                generation: 9,
                csum: [0; BTRFS_CSUM_SIZE],
                mirrors: vec![Mirror {
                    devid: 1,
                    offset: 0,
                }],
            })
            .unwrap();

        recover_chunks(&mut rc);

        assert_eq!(rc.good_chunks.len(), 1);
        let chunk = &rc.good_chunks[0];
        assert_eq!(chunk.stripes[0].devid, 1);
        assert_eq!(chunk.stripes[0].offset, 0);
        assert_eq!(chunk.stripes[1].devid, 2);
    }

    #[test]
    fn raid1_with_single_extent_is_bad() {
        let gib = 1_u64 << 30;
        let flags = BTRFS_BLOCK_GROUP_METADATA | BTRFS_BLOCK_GROUP_RAID1;
        let mut rc = test_rc(&[1, 2]);
        rc.bg_cache.insert(bg(gib, gib, flags)).unwrap();
        rc.devext_cache.insert(devext(1, 0, gib, gib)).unwrap();

        recover_chunks(&mut rc);

        assert!(rc.good_chunks.is_empty());
        assert_eq!(rc.bad_chunks.len(), 1);
    }

    #[test]
    fn wrong_extent_length_is_bad() {
        let gib = 1_u64 << 30;
        let flags = BTRFS_BLOCK_GROUP_METADATA | BTRFS_BLOCK_GROUP_RAID1;
        let mut rc = test_rc(&[1, 2]);
        rc.bg_cache.insert(bg(gib, gib, flags)).unwrap();
        rc.devext_cache.insert(devext(1, 0, gib, gib)).unwrap();
        rc.devext_cache.insert(devext(2, 0, gib / 2, gib)).unwrap();

        recover_chunks(&mut rc);

        assert_eq!(rc.bad_chunks.len(), 1);
    }

    #[test]
    fn striped_data_chunk_is_deferred() {
        let mib = 1_u64 << 20;
        let flags = BTRFS_BLOCK_GROUP_DATA | BTRFS_BLOCK_GROUP_RAID0;
        let mut rc = test_rc(&[1, 2]);
        rc.bg_cache.insert(bg(0, 2 * mib, flags)).unwrap();
        rc.devext_cache.insert(devext(1, 0, mib, 0)).unwrap();
        rc.devext_cache.insert(devext(2, 0, mib, 0)).unwrap();

        recover_chunks(&mut rc);

        assert_eq!(rc.unrepaired_chunks.len(), 1);
        assert!(rc.good_chunks.is_empty());
    }

    #[test]
    fn pinned_slot_without_extent_is_bad() {
        let mib = 1_u64 << 20;
        let flags = BTRFS_BLOCK_GROUP_METADATA | BTRFS_BLOCK_GROUP_RAID0;
        let mut rc = test_rc(&[1, 2]);
        rc.bg_cache.insert(bg(0, 2 * mib, flags)).unwrap();
        rc.devext_cache.insert(devext(1, 0, mib, 0)).unwrap();
        rc.devext_cache.insert(devext(2, 0, mib, 0)).unwrap();
        // data seen at a physical location no orphan extent covers
        rc.eb_cache
            .insert(ExtentRecord {
                start: 0,
                size: 16384,
                generation: 9,
                csum: [0; BTRFS_CSUM_SIZE],
                mirrors: vec![Mirror {
                    devid: 1,
                    offset: 8 * mib,
                }],
            })
            .unwrap();

        recover_chunks(&mut rc);

        assert_eq!(rc.bad_chunks.len(), 1);
        assert!(rc.good_chunks.is_empty());
    }
}
