//! CRC32C checksums over superblocks and tree blocks.

use crate::error::{RecoverError, Result};
use crate::structures::*;
use crc::{Crc, CRC_32_ISCSI};

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/* the checksums range from 4-32 bytes depending on the algorithm in use. For
simplicity we always return a 32 byte buffer with the checksum at the front */
pub fn csum_data(buf: &[u8], csum_type: u16) -> Result<BtrfsCsum> {
    match csum_type {
        BTRFS_CSUM_TYPE_CRC32 => Ok(csum_data_crc32(buf)),
        other => Err(RecoverError::FormatMismatch(format!(
            "unsupported checksum type {}",
            other
        ))),
    }
}

fn csum_data_crc32(buf: &[u8]) -> BtrfsCsum {
    let mut ret = [0_u8; BTRFS_CSUM_SIZE];
    let cs = CASTAGNOLI.checksum(buf).to_le_bytes();
    ret[..cs.len()].copy_from_slice(&cs[..]);
    ret
}

/// Checksum a tree block buffer: everything after the csum field.
pub fn csum_tree_block(block: &[u8], csum_type: u16) -> Result<BtrfsCsum> {
    csum_data(&block[BTRFS_CSUM_SIZE..], csum_type)
}

/// Verify a tree block buffer against the csum stored in its header.
pub fn verify_tree_block(block: &[u8], csum_type: u16) -> bool {
    match csum_tree_block(block, csum_type) {
        Ok(csum) => block[..BTRFS_CSUM_SIZE] == csum,
        Err(_) => false,
    }
}

/// Recompute and store the csum of a tree block buffer in place.
pub fn put_tree_block_csum(block: &mut [u8], csum_type: u16) -> Result<()> {
    let csum = csum_tree_block(block, csum_type)?;
    block[..BTRFS_CSUM_SIZE].copy_from_slice(&csum);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32c_known_vector() {
        // "123456789" has a well-known Castagnoli residue
        let csum = csum_data(b"123456789", BTRFS_CSUM_TYPE_CRC32).unwrap();
        assert_eq!(&csum[..4], &0xe3069283_u32.to_le_bytes());
        assert!(csum[4..].iter().all(|b| *b == 0));
    }

    #[test]
    fn tree_block_round_trip() {
        let mut block = vec![0xab_u8; 4096];
        block[..BTRFS_CSUM_SIZE].fill(0);
        assert!(!verify_tree_block(&block, BTRFS_CSUM_TYPE_CRC32));
        put_tree_block_csum(&mut block, BTRFS_CSUM_TYPE_CRC32).unwrap();
        assert!(verify_tree_block(&block, BTRFS_CSUM_TYPE_CRC32));
        block[200] ^= 1;
        assert!(!verify_tree_block(&block, BTRFS_CSUM_TYPE_CRC32));
    }

    #[test]
    fn unknown_csum_type_rejected() {
        assert!(csum_data(b"x", 2).is_err());
    }
}
