//! Sequential device scan: identify metadata tree blocks by fsid and
//! checksum alone, and feed their records into the caches.
//!
//! The scan walks every device in sectorsize steps, skipping the
//! superblock windows. Whatever passes the fsid + checksum test is tracked
//! as an extent-buffer mirror; leaves owned by the extent, device and
//! chunk trees additionally have their items extracted, bounded by the
//! generations the canonical superblock committed.

use crate::chunk_recover::RecoverControl;
use crate::csum::verify_tree_block;
use crate::device::{device_size, Device};
use crate::error::{RecoverError, Result};
use crate::node::leaf_items;
use crate::records::*;
use crate::structures::*;
use log::{debug, warn};
use std::os::unix::fs::FileExt;

/// Swallow record conflicts: two same-generation copies disagreeing is
/// noted and the earlier record kept, the scan goes on.
fn note_conflict(result: Result<()>) -> Result<()> {
    match result {
        Err(RecoverError::Conflict(msg)) => {
            warn!("conflicting metadata on disk: {}", msg);
            Ok(())
        }
        other => other,
    }
}

fn in_super_window(bytenr: u64) -> bool {
    (0..BTRFS_SUPER_MIRROR_MAX).any(|mirror| {
        let start = btrfs_sb_offset(mirror);
        bytenr >= start && bytenr < start + BTRFS_SUPER_INFO_SIZE as u64
    })
}

fn extract_metadata_record(rc: &mut RecoverControl, block: &[u8]) -> Result<()> {
    let generation = layout_at::<btrfs_header>(block, 0).generation;
    for (item, data) in leaf_items(block) {
        let key = item.key;
        match key.item_type {
            BTRFS_BLOCK_GROUP_ITEM_KEY => {
                let rec = BlockGroupRecord::from_item(generation, key.objectid, key.offset, data);
                note_conflict(rc.bg_cache.insert(rec))?;
            }
            BTRFS_CHUNK_ITEM_KEY => {
                match ChunkRecord::from_item(generation, key.offset, data) {
                    Ok(rec) => note_conflict(rc.chunk_cache.insert(rec))?,
                    // the leaf passed its checksum, so a malformed item is
                    // recorded and skipped rather than failing the scan
                    Err(err) => warn!("skipping malformed chunk item: {}", err),
                }
            }
            BTRFS_DEV_EXTENT_KEY => {
                let rec = DeviceExtentRecord::from_item(generation, key.objectid, key.offset, data);
                note_conflict(rc.devext_cache.insert(rec))?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn scan_one_device(rc: &mut RecoverControl, device: &Device) -> Result<()> {
    let file = device.open_ro()?;
    let size = device_size(&file)?;
    let leafsize = rc.leafsize as u64;
    let sectorsize = rc.sectorsize as u64;
    let mut buf = vec![0_u8; rc.leafsize as usize];

    debug!(
        "scanning devid {} ({}), {} bytes",
        device.devid,
        device.path.display(),
        size
    );

    let mut bytenr = 0;
    loop {
        while in_super_window(bytenr) {
            bytenr += sectorsize;
        }
        if bytenr + leafsize > size {
            break;
        }
        file.read_exact_at(&mut buf, bytenr)?;

        let header = layout_at::<btrfs_header>(&buf, 0);
        if header.fsid != rc.fs_devices.fsid {
            bytenr += sectorsize;
            continue;
        }
        if !verify_tree_block(&buf, rc.csum_type) {
            bytenr += sectorsize;
            continue;
        }

        let rec = ExtentRecord::from_block(&buf, device.devid, bytenr);
        note_conflict(rc.eb_cache.insert(rec))?;

        let header = layout_at::<btrfs_header>(&buf, 0);
        if header.level == 0 {
            let owner = header.owner;
            let generation = header.generation;
            match owner {
                BTRFS_EXTENT_TREE_OBJECTID | BTRFS_DEV_TREE_OBJECTID => {
                    /* different tree use different generation */
                    if generation <= rc.generation {
                        extract_metadata_record(rc, &buf)?;
                    }
                }
                BTRFS_CHUNK_TREE_OBJECTID => {
                    if generation <= rc.chunk_root_generation {
                        extract_metadata_record(rc, &buf)?;
                    }
                }
                _ => {}
            }
        }
        bytenr += leafsize;
    }
    Ok(())
}

pub fn scan_devices(rc: &mut RecoverControl) -> Result<()> {
    let fs_devices = rc.fs_devices.clone();
    for device in &fs_devices.devices {
        scan_one_device(rc, device)?;
    }
    Ok(())
}
