//! Superblock recovery: find the newest valid superblock across every
//! mirror of every member device, then rewrite the mirrors that are stale
//! or corrupt.
//!
//! A mirror is valid iff its magic matches, its recorded bytenr equals the
//! offset it was read from, and its checksum verifies. The canonical copy
//! is the first valid mirror carrying the highest generation seen anywhere
//! in the filesystem.

use crate::csum::csum_data;
use crate::device::{device_size, read_raw_super};
use crate::error::{RecoverError, Result};
use crate::structures::*;
use log::{debug, error};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

type SuperBuf = Box<[u8; BTRFS_SUPER_INFO_SIZE]>;

pub struct SuperRecord {
    pub buf: SuperBuf,
    pub bytenr: u64,
}

impl SuperRecord {
    pub fn super_block(&self) -> &btrfs_super_block {
        layout_at::<btrfs_super_block>(&self.buf[..], 0)
    }

    pub fn generation(&self) -> u64 {
        self.super_block().generation
    }
}

pub struct DeviceRecord {
    pub path: PathBuf,
    pub good_supers: Vec<SuperRecord>,
    pub bad_supers: Vec<SuperRecord>,
    /// max good generation on this device
    pub max_generation: u64,
}

/// Outcome summary, ordered exactly like the original tool's flag values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoverStatus {
    /// nothing needed doing
    AllValid,
    /// a primary mirror (offset 0x10000) could not be rewritten
    FatalFailed,
    /// a backup mirror could not be rewritten
    BackupFailed,
    /// every bad mirror was rewritten
    AllFixed,
}

fn note_write_failure(status: &mut RecoverStatus, primary: bool) {
    *status = if primary {
        RecoverStatus::FatalFailed
    } else {
        RecoverStatus::BackupFailed
    };
}

fn note_fixed(status: &mut RecoverStatus) {
    if *status == RecoverStatus::AllValid {
        *status = RecoverStatus::AllFixed;
    }
}

pub struct SuperRecovery {
    pub devices: Vec<DeviceRecord>,
    /// max good generation across the filesystem
    pub max_generation: u64,
    pub status: RecoverStatus,
    canonical: Option<SuperBuf>,
}

/// Valid iff magic, self-referential bytenr and checksum all hold.
pub fn check_super(bytenr: u64, buf: &[u8; BTRFS_SUPER_INFO_SIZE]) -> bool {
    let sb = layout_at::<btrfs_super_block>(&buf[..], 0);
    if sb.bytenr != bytenr {
        return false;
    }
    if sb.magic != BTRFS_MAGIC {
        return false;
    }
    match csum_data(&buf[BTRFS_CSUM_SIZE..], sb.csum_type) {
        Ok(csum) => csum == sb.csum,
        Err(_) => false,
    }
}

impl SuperRecovery {
    pub fn new() -> SuperRecovery {
        SuperRecovery {
            devices: Vec::new(),
            max_generation: 0,
            status: RecoverStatus::AllValid,
            canonical: None,
        }
    }

    /// Read and classify every superblock mirror of one device.
    pub fn read_dev_supers(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path)?;
        let size = device_size(&file)?;
        let mut record = DeviceRecord {
            path: path.to_path_buf(),
            good_supers: Vec::new(),
            bad_supers: Vec::new(),
            max_generation: 0,
        };
        for mirror in 0..BTRFS_SUPER_MIRROR_MAX {
            let bytenr = btrfs_sb_offset(mirror);
            if bytenr + BTRFS_SUPER_INFO_SIZE as u64 > size {
                debug!(
                    "{}: no room for mirror {} at {}",
                    path.display(),
                    mirror,
                    bytenr
                );
                continue;
            }
            let buf = read_raw_super(&file, bytenr)?;
            if check_super(bytenr, &buf) {
                let gen = layout_at::<btrfs_super_block>(&buf[..], 0).generation;
                if gen > record.max_generation {
                    record.max_generation = gen;
                }
                if gen > self.max_generation {
                    self.max_generation = gen;
                }
                record.good_supers.push(SuperRecord { buf, bytenr });
            } else {
                record.bad_supers.push(SuperRecord { buf, bytenr });
            }
        }
        self.devices.push(record);
        Ok(())
    }

    /// Demote per-device stale mirrors to the bad list and elect the
    /// canonical superblock: the first good mirror at the global maximum
    /// generation.
    pub fn update_read_result(&mut self) {
        for device in &mut self.devices {
            let good = std::mem::take(&mut device.good_supers);
            for record in good {
                if record.generation() < device.max_generation {
                    device.bad_supers.push(record);
                } else {
                    device.good_supers.push(record);
                }
            }
        }
        let max_generation = self.max_generation;
        if self.canonical.is_none() {
            self.canonical = self
                .devices
                .iter()
                .flat_map(|d| d.good_supers.iter())
                .find(|r| r.generation() == max_generation)
                .map(|r| r.buf.clone());
        }
    }

    pub fn canonical_super(&self) -> Option<&btrfs_super_block> {
        self.canonical
            .as_ref()
            .map(|buf| layout_at::<btrfs_super_block>(&buf[..], 0))
    }

    /// Rewrite every mirror of one device that is not at the canonical
    /// generation. The device's own dev_item, captured from its first good
    /// mirror, is preserved in everything written.
    fn correct_disk_bad_supers(&mut self, index: usize) -> Result<()> {
        let canonical = self
            .canonical
            .as_ref()
            .ok_or_else(|| {
                RecoverError::FormatMismatch("no valid superblock found on any device".into())
            })?
            .clone();
        let max_generation = self.max_generation;
        let device = &mut self.devices[index];

        let file = std::fs::OpenOptions::new().write(true).open(&device.path)?;

        let mut dev_item: Option<btrfs_dev_item> = None;
        let mut wrote = false;
        for record in &mut device.good_supers {
            if dev_item.is_none() {
                dev_item = Some(record.super_block().dev_item);
            }
            if record.generation() >= max_generation {
                break;
            }
            match correct_bad_super(dev_item.as_ref().unwrap(), record, &file, &canonical) {
                Ok(()) => {
                    wrote = true;
                    note_fixed(&mut self.status);
                }
                Err(err) => {
                    error!(
                        "Failed to correct device: {} super offset: {}: {}",
                        device.path.display(),
                        record.bytenr,
                        err
                    );
                    note_write_failure(&mut self.status, record.bytenr == btrfs_sb_offset(0));
                }
            }
        }

        if !device.bad_supers.is_empty() && dev_item.is_none() {
            // every mirror on this device is bad, so there is no local
            // dev_item to preserve; rewriting would forge device identity
            error!(
                "{}: no good superblock to take the dev_item from, skipping device",
                device.path.display()
            );
            note_write_failure(&mut self.status, true);
            return Ok(());
        }

        let bad = std::mem::take(&mut device.bad_supers);
        for mut record in bad {
            match correct_bad_super(dev_item.as_ref().unwrap(), &mut record, &file, &canonical) {
                Ok(()) => {
                    wrote = true;
                    note_fixed(&mut self.status);
                    device.good_supers.push(record);
                }
                Err(err) => {
                    error!(
                        "Failed to correct device: {} super offset: {}: {}",
                        device.path.display(),
                        record.bytenr,
                        err
                    );
                    note_write_failure(&mut self.status, record.bytenr == btrfs_sb_offset(0));
                    device.bad_supers.push(record);
                }
            }
        }

        if wrote {
            file.sync_all()?;
        }
        Ok(())
    }

    /// iterate every disk and recover bad supers from good copies
    pub fn recover_bad_supers(&mut self) -> Result<()> {
        for index in 0..self.devices.len() {
            // per-device failures are already folded into the status; keep
            // going so the remaining devices still get their mirrors fixed
            if let Err(err) = self.correct_disk_bad_supers(index) {
                error!(
                    "failed to recover {}: {}",
                    self.devices[index].path.display(),
                    err
                );
                note_write_failure(&mut self.status, true);
            }
        }
        Ok(())
    }

    pub fn print_all_supers(&self) {
        for device in &self.devices {
            println!("[device name] = {}", device.path.display());
            println!("\tgood supers:");
            for record in &device.good_supers {
                println!("\t\tsuperblock bytenr = {}", record.bytenr);
            }
            println!();
            println!("\tbad supers:");
            for record in &device.bad_supers {
                println!("\t\tsuperblock bytenr = {}", record.bytenr);
            }
            println!();
        }
    }
}

impl Default for SuperRecovery {
    fn default() -> Self {
        SuperRecovery::new()
    }
}

fn correct_bad_super(
    dev_item: &btrfs_dev_item,
    record: &mut SuperRecord,
    file: &File,
    canonical: &[u8; BTRFS_SUPER_INFO_SIZE],
) -> Result<()> {
    record.buf.copy_from_slice(&canonical[..]);
    {
        let sb = layout_at_mut::<btrfs_super_block>(&mut record.buf[..], 0);
        sb.bytenr = record.bytenr;
        sb.dev_item = *dev_item;
    }
    let csum_type = record.super_block().csum_type;
    let csum = csum_data(&record.buf[BTRFS_CSUM_SIZE..], csum_type)?;
    record.buf[..BTRFS_CSUM_SIZE].copy_from_slice(&csum);
    file.write_all_at(&record.buf[..], record.bytenr)?;
    Ok(())
}

/// Run the whole pipeline over the given member devices. Mirror write
/// failures are reported through the returned status, not as errors, so
/// that every device still gets attempted.
pub fn recover_bad_superblocks(paths: &[PathBuf], verbose: bool) -> Result<RecoverStatus> {
    let mut recovery = SuperRecovery::new();
    for path in paths {
        recovery.read_dev_supers(path)?;
    }
    recovery.update_read_result();

    if recovery.canonical_super().is_none() {
        return Err(RecoverError::FormatMismatch(
            "no valid superblock found on any device".into(),
        ));
    }

    if verbose {
        println!("Before Recovering:");
        recovery.print_all_supers();
    }

    recovery.recover_bad_supers()?;

    if verbose {
        println!("After Recovering:");
        recovery.print_all_supers();
    }

    Ok(recovery.status)
}

pub fn print_recover_result(status: RecoverStatus) {
    match status {
        RecoverStatus::AllValid => {
            println!("All superblocks are valid, no need to recover")
        }
        RecoverStatus::FatalFailed => {
            println!("Some fatal superblocks failed to recover")
        }
        RecoverStatus::BackupFailed => {
            println!("some backup superblocks failed to recover")
        }
        RecoverStatus::AllFixed => {
            println!("recover all bad superblocks successfully")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_super(bytenr: u64, generation: u64) -> SuperBuf {
        let mut buf = Box::new([0_u8; BTRFS_SUPER_INFO_SIZE]);
        {
            let sb = layout_at_mut::<btrfs_super_block>(&mut buf[..], 0);
            sb.magic = BTRFS_MAGIC;
            sb.bytenr = bytenr;
            sb.generation = generation;
            sb.csum_type = BTRFS_CSUM_TYPE_CRC32;
        }
        let csum = csum_data(&buf[BTRFS_CSUM_SIZE..], BTRFS_CSUM_TYPE_CRC32).unwrap();
        buf[..BTRFS_CSUM_SIZE].copy_from_slice(&csum);
        buf
    }

    #[test]
    fn super_validation() {
        let buf = make_super(0x10000, 42);
        assert!(check_super(0x10000, &buf));
        // wrong offset
        assert!(!check_super(0x4000000, &buf));
        // corrupted byte
        let mut bad = buf.clone();
        bad[100] ^= 0xff;
        assert!(!check_super(0x10000, &bad));
    }

    #[test]
    fn stale_mirrors_are_demoted() {
        let mut recovery = SuperRecovery::new();
        recovery.devices.push(DeviceRecord {
            path: PathBuf::from("/dev/null"),
            good_supers: vec![
                SuperRecord {
                    buf: make_super(btrfs_sb_offset(0), 42),
                    bytenr: btrfs_sb_offset(0),
                },
                SuperRecord {
                    buf: make_super(btrfs_sb_offset(1), 42),
                    bytenr: btrfs_sb_offset(1),
                },
                SuperRecord {
                    buf: make_super(btrfs_sb_offset(2), 40),
                    bytenr: btrfs_sb_offset(2),
                },
            ],
            bad_supers: Vec::new(),
            max_generation: 42,
        });
        recovery.max_generation = 42;
        recovery.update_read_result();

        let device = &recovery.devices[0];
        assert_eq!(device.good_supers.len(), 2);
        assert_eq!(device.bad_supers.len(), 1);
        assert_eq!(device.bad_supers[0].bytenr, btrfs_sb_offset(2));
        let gen = recovery.canonical_super().unwrap().generation;
        assert_eq!(gen, 42);
    }

    #[test]
    fn election_prefers_global_maximum() {
        let mut recovery = SuperRecovery::new();
        for (devid, gen) in [(1_u64, 49_u64), (2, 50)] {
            recovery.devices.push(DeviceRecord {
                path: PathBuf::from(format!("/dev/fake{}", devid)),
                good_supers: vec![SuperRecord {
                    buf: make_super(btrfs_sb_offset(0), gen),
                    bytenr: btrfs_sb_offset(0),
                }],
                bad_supers: Vec::new(),
                max_generation: gen,
            });
            if gen > recovery.max_generation {
                recovery.max_generation = gen;
            }
        }
        recovery.update_read_result();
        let gen = recovery.canonical_super().unwrap().generation;
        assert_eq!(gen, 50);
        // device 1's mirror stays "good" per-device; only the global pass
        // during correction rewrites it
        assert_eq!(recovery.devices[0].good_supers.len(), 1);
    }

    #[test]
    fn status_transitions_keep_failures_sticky() {
        let mut status = RecoverStatus::AllValid;
        note_fixed(&mut status);
        assert_eq!(status, RecoverStatus::AllFixed);
        note_write_failure(&mut status, false);
        assert_eq!(status, RecoverStatus::BackupFailed);
        // later successes must not mask the failure
        note_fixed(&mut status);
        assert_eq!(status, RecoverStatus::BackupFailed);
        note_write_failure(&mut status, true);
        assert_eq!(status, RecoverStatus::FatalFailed);
    }
}
