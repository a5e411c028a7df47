//! Member devices of the damaged filesystem.
//!
//! Device discovery is the caller's problem: every member device is passed
//! on the command line, and the primary superblock of each is read to learn
//! its devid, uuid and dev_item. Nothing here walks /dev.

use crate::csum::csum_data;
use crate::error::{RecoverError, Result};
use crate::structures::*;
use log::debug;
use std::collections::HashMap;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

pub fn uuid_str(uuid: &BtrfsUuid) -> String {
    std::format!(
        "{}-{}-{}-{}-{}",
        hex::encode(&uuid[0..4]),
        hex::encode(&uuid[4..6]),
        hex::encode(&uuid[6..8]),
        hex::encode(&uuid[8..10]),
        hex::encode(&uuid[10..])
    )
}

/// Byte length of a regular file or block device.
pub fn device_size(file: &File) -> Result<u64> {
    let md = file.metadata()?;
    if md.is_file() {
        return Ok(md.len());
    }
    //assume block device
    let mut len64 = 0_u64;
    let ret = unsafe { ioctls::blkgetsize64(file.as_raw_fd(), &mut len64 as *mut u64) };
    if ret != 0 {
        return Err(RecoverError::Io(std::io::Error::last_os_error()));
    }
    Ok(len64)
}

/// True if `path` appears as a mount source in /proc/self/mounts.
pub fn check_mounted(path: &Path) -> Result<bool> {
    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let mounts = std::fs::read_to_string("/proc/self/mounts")?;
    for line in mounts.lines() {
        let Some(source) = line.split(' ').next() else {
            continue;
        };
        let source = PathBuf::from(source);
        let source = std::fs::canonicalize(&source).unwrap_or(source);
        if source == canonical {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Read the `BTRFS_SUPER_INFO_SIZE` bytes at `bytenr`, without validation.
pub fn read_raw_super(file: &File, bytenr: u64) -> Result<Box<[u8; BTRFS_SUPER_INFO_SIZE]>> {
    let mut buf = Box::new([0_u8; BTRFS_SUPER_INFO_SIZE]);
    file.read_exact_at(&mut buf[..], bytenr)?;
    Ok(buf)
}

/// Read and validate the primary superblock (magic and checksum only;
/// mirror classification applies stricter rules on top of this).
pub fn load_primary_super(path: &Path) -> Result<Box<btrfs_super_block>> {
    let file = File::open(path)?;
    let buf = read_raw_super(&file, BTRFS_SUPER_INFO_OFFSET as u64)?;
    let sb = layout_at::<btrfs_super_block>(&buf[..], 0);
    if sb.magic != BTRFS_MAGIC {
        return Err(RecoverError::BadMagic {
            bytenr: BTRFS_SUPER_INFO_OFFSET as u64,
        });
    }
    let csum = csum_data(&buf[BTRFS_CSUM_SIZE..], sb.csum_type)?;
    if csum != sb.csum {
        return Err(RecoverError::BadChecksum {
            bytenr: BTRFS_SUPER_INFO_OFFSET as u64,
        });
    }
    Ok(Box::new(*sb))
}

pub struct Device {
    pub path: PathBuf,
    pub devid: u64,
    pub uuid: BtrfsUuid,
    /// dev_item from this device's own primary superblock.
    pub dev_item: btrfs_dev_item,
    pub total_bytes: u64,
}

impl Device {
    pub fn open_ro(&self) -> Result<File> {
        Ok(File::open(&self.path)?)
    }

    pub fn open_rw(&self) -> Result<File> {
        Ok(std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)?)
    }
}

/// The member set of one filesystem, keyed by fsid.
pub struct FsDevices {
    pub fsid: BtrfsFsid,
    /// num_devices according to the superblock; may exceed the devices
    /// actually present when running degraded.
    pub num_devices: u64,
    pub devices: Vec<Device>,
    by_devid: HashMap<u64, usize>,
}

impl FsDevices {
    /// Assemble the member set from explicit device paths. All paths must
    /// carry a valid primary superblock with the same fsid.
    pub fn scan(paths: &[PathBuf]) -> Result<FsDevices> {
        assert!(!paths.is_empty());
        let mut fsid: Option<BtrfsFsid> = None;
        let mut num_devices = 0;
        let mut devices = Vec::new();
        let mut by_devid = HashMap::new();
        for path in paths {
            let sb = load_primary_super(path)?;
            match fsid {
                None => fsid = Some(sb.fsid),
                Some(f) => {
                    if sb.fsid != f {
                        return Err(RecoverError::FormatMismatch(format!(
                            "{} belongs to a different filesystem",
                            path.display()
                        )));
                    }
                }
            }
            let devid = sb.dev_item.devid;
            if by_devid.contains_key(&devid) {
                return Err(RecoverError::FormatMismatch(format!(
                    "duplicate devid {} at {}",
                    devid,
                    path.display()
                )));
            }
            debug!("device {} is devid {}", path.display(), devid);
            num_devices = sb.num_devices;
            by_devid.insert(devid, devices.len());
            devices.push(Device {
                path: path.clone(),
                devid,
                uuid: sb.dev_item.uuid,
                dev_item: sb.dev_item,
                total_bytes: sb.dev_item.total_bytes,
            });
        }
        Ok(FsDevices {
            fsid: fsid.unwrap(),
            num_devices,
            devices,
            by_devid,
        })
    }

    /// Build a member set from already-assembled devices.
    pub fn from_devices(fsid: BtrfsFsid, devices: Vec<Device>) -> FsDevices {
        let mut by_devid = HashMap::new();
        for (i, dev) in devices.iter().enumerate() {
            let prev = by_devid.insert(dev.devid, i);
            assert!(prev.is_none(), "duplicate devid {}", dev.devid);
        }
        FsDevices {
            fsid,
            num_devices: devices.len() as u64,
            devices,
            by_devid,
        }
    }

    pub fn find_by_devid(&self, devid: u64) -> Option<&Device> {
        self.by_devid.get(&devid).map(|i| &self.devices[*i])
    }
}
