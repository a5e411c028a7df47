//! Cross-checking chunks against block groups and device extents.
//!
//! The first pass runs over the scanned caches and partitions chunks into
//! good and bad; records referenced by a good chunk are consumed, the rest
//! stay behind as orphans for the reconstructor. The second pass runs
//! after the filesystem has been opened through the rebuilt map and
//! revalidates every chunk against the on-disk device and extent trees.

use crate::chunk_recover::RecoverControl;
use crate::ctree::OpenFs;
use crate::error::{RecoverError, Result};
use crate::records::*;
use crate::structures::*;
use log::debug;

fn chunk_refs_ok(
    chunk: &ChunkRecord,
    bg_cache: &BlockGroupCache,
    devext_cache: &DeviceExtentCache,
) -> bool {
    let Some(bg) = bg_cache.lookup_exact(0, chunk.offset, chunk.length) else {
        debug!("chunk {} has no block group", chunk.offset);
        return false;
    };
    if bg.flags != chunk.type_flags {
        debug!(
            "chunk {} type {:#x} does not match block group type {:#x}",
            chunk.offset, chunk.type_flags, bg.flags
        );
        return false;
    }

    let referencing: Vec<&DeviceExtentRecord> = devext_cache
        .values()
        .filter(|d| d.chunk_offset == chunk.offset)
        .collect();
    if referencing.len() != chunk.num_stripes as usize {
        debug!(
            "chunk {} has {} device extents, wants {}",
            chunk.offset,
            referencing.len(),
            chunk.num_stripes
        );
        return false;
    }

    let stripe_length = chunk.expected_stripe_length();
    if stripe_length == 0 || (chunk.profile().is_ordered() && chunk.stripe_len == 0) {
        debug!("chunk {} has a degenerate stripe layout", chunk.offset);
        return false;
    }
    chunk.stripes.iter().all(|stripe| {
        referencing.iter().any(|d| {
            d.objectid == stripe.devid && d.offset == stripe.offset && d.length == stripe_length
        })
    })
}

/// First pass: validate every cached chunk against the caches, consuming
/// the records good chunks reference.
pub fn check_chunks(rc: &mut RecoverControl) {
    let chunk_cache = std::mem::take(&mut rc.chunk_cache);
    for chunk in chunk_cache.into_records() {
        if chunk_refs_ok(&chunk, &rc.bg_cache, &rc.devext_cache) {
            rc.bg_cache.remove_exact(0, chunk.offset);
            for stripe in &chunk.stripes {
                rc.devext_cache.remove_exact(stripe.devid, stripe.offset);
            }
            rc.good_chunks.push(chunk);
        } else {
            rc.bad_chunks.push(chunk);
        }
    }
}

/// True when nothing is left to repair: no chunk failed and no record is
/// orphaned. Chunk recovery must not write anything in that case.
pub fn all_chunks_healthy(rc: &RecoverControl) -> bool {
    rc.bad_chunks.is_empty() && rc.bg_cache.is_empty() && rc.devext_cache.is_empty()
}

fn check_chunk_by_metadata(fs: &OpenFs, chunk: &ChunkRecord, bg_only: bool) -> Result<()> {
    if !bg_only {
        for stripe in &chunk.stripes {
            let key = btrfs_disk_key::new(stripe.devid, BTRFS_DEV_EXTENT_KEY, stripe.offset);
            let Some(data) = fs.search_item(fs.dev_root, fs.dev_root_level, &key)? else {
                debug!("No device extent[{}, {}]", stripe.devid, stripe.offset);
                return Err(RecoverError::MissingRecord(format!(
                    "device extent ({}, {})",
                    stripe.devid, stripe.offset
                )));
            };
            let devext = layout_at::<btrfs_dev_extent>(&data, 0);
            if devext.chunk_offset != chunk.offset {
                debug!(
                    "Device tree unmatch with chunks dev_extent[{}, {}], chunk[{}, {}]",
                    { devext.chunk_offset },
                    { devext.length },
                    chunk.offset,
                    chunk.length
                );
                return Err(RecoverError::MissingRecord(format!(
                    "device extent ({}, {}) backs chunk {}, not {}",
                    stripe.devid,
                    stripe.offset,
                    { devext.chunk_offset },
                    chunk.offset
                )));
            }
        }
    }

    let key = btrfs_disk_key::new(chunk.offset, BTRFS_BLOCK_GROUP_ITEM_KEY, chunk.length);
    let Some(data) = fs.search_item(fs.extent_root, fs.extent_root_level, &key)? else {
        debug!("No block group[{}, {}]", chunk.offset, chunk.length);
        return Err(RecoverError::MissingRecord(format!(
            "block group ({}, {})",
            chunk.offset, chunk.length
        )));
    };
    let bg = layout_at::<btrfs_block_group_item>(&data, 0);
    if bg.flags != chunk.type_flags {
        debug!(
            "Chunk[{}, {}]'s type({:#x}) is different with Block Group's type({:#x})",
            chunk.offset,
            chunk.length,
            chunk.type_flags,
            { bg.flags }
        );
        return Err(RecoverError::MissingRecord(format!(
            "block group ({}, {}) type mismatch",
            chunk.offset, chunk.length
        )));
    }
    Ok(())
}

/// Second pass, run through the opened filesystem. Chunks whose metadata
/// went missing are demoted to bad; genuinely mismatching metadata is
/// fatal because the in-memory model disagrees with the on-disk trees.
pub fn check_all_chunks_by_metadata(rc: &mut RecoverControl, fs: &OpenFs) -> Result<()> {
    let mut orphan_chunks = Vec::new();
    let mut fatal: Option<RecoverError> = None;

    let good = std::mem::take(&mut rc.good_chunks);
    for chunk in good {
        match check_chunk_by_metadata(fs, &chunk, false) {
            Ok(()) => rc.good_chunks.push(chunk),
            Err(RecoverError::MissingRecord(_)) => orphan_chunks.push(chunk),
            Err(err) => {
                if fatal.is_none() {
                    fatal = Some(err);
                }
                rc.good_chunks.push(chunk);
            }
        }
    }

    let unrepaired = std::mem::take(&mut rc.unrepaired_chunks);
    for chunk in unrepaired {
        match check_chunk_by_metadata(fs, &chunk, true) {
            Ok(()) => rc.unrepaired_chunks.push(chunk),
            Err(RecoverError::MissingRecord(_)) => orphan_chunks.push(chunk),
            Err(err) => {
                if fatal.is_none() {
                    fatal = Some(err);
                }
                rc.unrepaired_chunks.push(chunk);
            }
        }
    }

    for chunk in &rc.bad_chunks {
        match check_chunk_by_metadata(fs, chunk, true) {
            // no live block group: an old chunk the fs already dropped
            Err(RecoverError::MissingRecord(_)) => {}
            Ok(()) => {
                if fatal.is_none() {
                    fatal = Some(RecoverError::Conflict(format!(
                        "bad chunk [{}, {}) still has live metadata",
                        chunk.offset,
                        chunk.offset + chunk.length
                    )));
                }
            }
            Err(err) => {
                if fatal.is_none() {
                    fatal = Some(err);
                }
            }
        }
    }

    rc.bad_chunks.extend(orphan_chunks);
    match fatal {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
