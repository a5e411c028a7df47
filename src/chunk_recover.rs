//! Chunk tree recovery pipeline.
//!
//! Order matters: the canonical superblock supplies the generation bounds
//! the scanner needs, the scan must finish before the cross-check, the
//! cross-check and synthesis before the filesystem is opened through the
//! rebuilt map, and the user must confirm before the transaction starts.

use crate::check;
use crate::ctree::OpenFs;
use crate::device::{load_primary_super, uuid_str, FsDevices};
use crate::error::{RecoverError, Result};
use crate::mapping::MappingTree;
use crate::rebuild;
use crate::records::*;
use crate::scan;
use crate::structures::*;
use log::debug;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;

pub struct RecoverControl {
    pub verbose: bool,
    pub yes: bool,

    pub csum_type: u16,
    pub sectorsize: u32,
    pub leafsize: u32,
    /// tree root generation from the canonical superblock
    pub generation: u64,
    pub chunk_root_generation: u64,

    pub fs_devices: Rc<FsDevices>,
    pub super_copy: Box<btrfs_super_block>,

    pub chunk_cache: ChunkCache,
    pub bg_cache: BlockGroupCache,
    pub devext_cache: DeviceExtentCache,
    pub eb_cache: ExtentBufferCache,

    pub good_chunks: Vec<ChunkRecord>,
    pub bad_chunks: Vec<ChunkRecord>,
    pub unrepaired_chunks: Vec<ChunkRecord>,
}

impl RecoverControl {
    /// Read the recovery parameters from the first device's primary
    /// superblock and assemble the member set.
    pub fn new(paths: &[PathBuf], verbose: bool, yes: bool) -> Result<RecoverControl> {
        let sb = load_primary_super(&paths[0])?;
        if sb.flags & BTRFS_SUPER_FLAG_SEEDING != 0 {
            // scanning a seed member would only ever see part of the fs
            return Err(RecoverError::FormatMismatch(
                "this device is a seed device".to_string(),
            ));
        }
        if sb.csum_type != BTRFS_CSUM_TYPE_CRC32 {
            let csum_type = sb.csum_type;
            return Err(RecoverError::FormatMismatch(format!(
                "unsupported checksum type {}",
                csum_type
            )));
        }
        let fs_devices = Rc::new(FsDevices::scan(paths)?);
        Ok(RecoverControl {
            verbose,
            yes,
            csum_type: sb.csum_type,
            sectorsize: sb.sectorsize,
            leafsize: sb.nodesize,
            generation: sb.generation,
            chunk_root_generation: sb.chunk_root_generation,
            fs_devices,
            super_copy: sb,
            chunk_cache: ChunkCache::new(),
            bg_cache: BlockGroupCache::new(),
            devext_cache: DeviceExtentCache::new(),
            eb_cache: ExtentBufferCache::new(),
            good_chunks: Vec::new(),
            bad_chunks: Vec::new(),
            unrepaired_chunks: Vec::new(),
        })
    }

    /// A control block over an already-assembled member set, with nothing
    /// scanned yet. Generation bounds are wide open; callers that care set
    /// them afterwards.
    pub fn with_devices(fs_devices: FsDevices) -> RecoverControl {
        let zeroed = [0_u8; BTRFS_SUPER_INFO_SIZE];
        RecoverControl {
            verbose: false,
            yes: true,
            csum_type: BTRFS_CSUM_TYPE_CRC32,
            sectorsize: 4096,
            leafsize: 16384,
            generation: u64::MAX,
            chunk_root_generation: u64::MAX,
            fs_devices: Rc::new(fs_devices),
            super_copy: Box::new(*layout_at::<btrfs_super_block>(&zeroed, 0)),
            chunk_cache: ChunkCache::new(),
            bg_cache: BlockGroupCache::new(),
            devext_cache: DeviceExtentCache::new(),
            eb_cache: ExtentBufferCache::new(),
            good_chunks: Vec::new(),
            bad_chunks: Vec::new(),
            unrepaired_chunks: Vec::new(),
        }
    }
}

fn print_chunk_info(chunk: &ChunkRecord, prefix: &str) {
    println!(
        "{}Chunk: start = {}, len = {}, type = {:#x}, num_stripes = {}",
        prefix, chunk.offset, chunk.length, chunk.type_flags, chunk.num_stripes
    );
    println!("{}    Stripes list:", prefix);
    for (i, stripe) in chunk.stripes.iter().enumerate() {
        println!(
            "{}    [{:2}] Stripe: devid = {}, offset = {}",
            prefix, i, stripe.devid, stripe.offset
        );
    }
}

fn print_block_group_info(bg: &BlockGroupRecord, prefix: &str) {
    println!(
        "{}Block Group: start = {}, len = {}, flag = {:#x}",
        prefix, bg.objectid, bg.offset, bg.flags
    );
}

fn print_device_extent_info(devext: &DeviceExtentRecord, prefix: &str) {
    println!(
        "{}Device extent: devid = {}, start = {}, len = {}, chunk offset = {}",
        prefix, devext.objectid, devext.offset, devext.length, devext.chunk_offset
    );
}

fn print_scan_result(rc: &RecoverControl) {
    if !rc.verbose {
        return;
    }
    println!("DEVICE SCAN RESULT:");
    println!("Filesystem Information:");
    println!("\tsectorsize: {}", rc.sectorsize);
    println!("\tleafsize: {}", rc.leafsize);
    println!("\ttree root generation: {}", rc.generation);
    println!("\tchunk root generation: {}", rc.chunk_root_generation);
    println!();
    println!("All Devices:");
    for dev in &rc.fs_devices.devices {
        println!(
            "\tDevice: id = {}, uuid = {}, name = {}",
            dev.devid,
            uuid_str(&dev.uuid),
            dev.path.display()
        );
    }
    println!();
    println!("All Block Groups:");
    for bg in rc.bg_cache.values() {
        print_block_group_info(bg, "\t");
    }
    println!();
    println!("All Chunks:");
    for chunk in rc.chunk_cache.values() {
        print_chunk_info(chunk, "\t");
    }
    println!();
    println!("All Device Extents:");
    for devext in rc.devext_cache.values() {
        print_device_extent_info(devext, "\t");
    }
    println!();
}

fn print_check_result(rc: &RecoverControl) {
    if !rc.verbose {
        return;
    }
    println!("CHECK RESULT:");
    println!("Healthy Chunks:");
    for chunk in &rc.good_chunks {
        print_chunk_info(chunk, "  ");
    }
    println!("Bad Chunks:");
    for chunk in &rc.bad_chunks {
        print_chunk_info(chunk, "  ");
    }
    println!();
    println!("Total Chunks:\t{}", rc.good_chunks.len() + rc.bad_chunks.len());
    println!("  Healthy:\t{}", rc.good_chunks.len());
    println!("  Bad:\t{}", rc.bad_chunks.len());
    println!();
    println!("Orphan Block Groups:");
    for bg in rc.bg_cache.values() {
        print_block_group_info(bg, "  ");
    }
    println!();
    println!("Orphan Device Extents:");
    for devext in rc.devext_cache.values() {
        print_device_extent_info(devext, "  ");
    }
    println!();
}

/// This reads a line from stdin and only returns true if the first
/// whitespace delimited token is a case insensitive match with yes or y.
fn ask_user(question: &str) -> bool {
    print!("{} [y/N]: ", question);
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return false;
    }
    matches!(
        line.split_whitespace()
            .next()
            .map(|token| token.to_ascii_lowercase())
            .as_deref(),
        Some("y") | Some("yes")
    )
}

#[derive(Debug, PartialEq, Eq)]
pub enum ChunkRecoverOutcome {
    /// a new chunk tree was committed
    Rebuilt,
    /// everything checked out; nothing was written
    Healthy,
    /// the scan found no chunk metadata at all; nothing was written
    NothingToDo,
}

pub fn recover_chunk_tree(paths: &[PathBuf], verbose: bool, yes: bool) -> Result<ChunkRecoverOutcome> {
    let mut rc = RecoverControl::new(paths, verbose, yes)?;

    scan::scan_devices(&mut rc)?;

    if rc.chunk_cache.is_empty() && rc.bg_cache.is_empty() && rc.devext_cache.is_empty() {
        eprintln!("no recoverable chunk");
        return Ok(ChunkRecoverOutcome::NothingToDo);
    }

    print_scan_result(&rc);

    check::check_chunks(&mut rc);
    print_check_result(&rc);

    if check::all_chunks_healthy(&rc) {
        debug!("every chunk passed the cross check, not touching the disk");
        return Ok(ChunkRecoverOutcome::Healthy);
    }

    if !rc.bg_cache.is_empty() || !rc.devext_cache.is_empty() {
        rebuild::recover_chunks(&mut rc);
    }
    /*
     * Remaining bad chunks are very likely old ones the filesystem already
     * dropped: if a chunk were live, its block group and device extents
     * would be on the disks. They are re-judged against the metadata once
     * the fs is open.
     */

    let mapping = MappingTree::build(&rc.good_chunks, &rc.fs_devices)?;
    let mut fs = OpenFs::open(rc.fs_devices.clone(), mapping, rc.super_copy.clone())?;

    if let Err(err) = check::check_all_chunks_by_metadata(&mut rc, &fs) {
        eprintln!("The chunks in memory can not match the metadata of the fs. Repair failed.");
        return Err(err);
    }

    if !rc.yes
        && !ask_user(
            "We are going to rebuild the chunk tree on disk, it might destroy the old metadata on the disk, Are you sure?",
        )
    {
        return Err(RecoverError::UserAbort);
    }

    let mut trans = fs.start_transaction();
    let system_groups: Vec<(u64, u64)> = rc
        .good_chunks
        .iter()
        .filter(|c| c.is_system())
        .map(|c| (c.offset, c.length))
        .collect();
    for (start, length) in system_groups {
        trans.remove_block_group_extent_items(start, length)?;
    }
    trans.rebuild_chunk_tree(&rc.good_chunks)?;
    trans.rebuild_sys_array(&rc.good_chunks)?;
    trans.commit()?;

    Ok(ChunkRecoverOutcome::Rebuilt)
}
