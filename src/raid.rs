//! RAID layout behavior, keyed off the block-group type flags.
//!
//! A chunk's profile decides how many device extents back it, how long each
//! stripe is, and (for the striped layouts) which stripe slot a logical
//! address lands in.

use crate::structures::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaidProfile {
    Single,
    Dup,
    Raid0,
    Raid1,
    Raid10,
    Raid5,
    Raid6,
}

impl RaidProfile {
    pub fn from_flags(type_flags: u64) -> RaidProfile {
        if type_flags & BTRFS_BLOCK_GROUP_RAID0 != 0 {
            RaidProfile::Raid0
        } else if type_flags & BTRFS_BLOCK_GROUP_RAID10 != 0 {
            RaidProfile::Raid10
        } else if type_flags & BTRFS_BLOCK_GROUP_RAID5 != 0 {
            RaidProfile::Raid5
        } else if type_flags & BTRFS_BLOCK_GROUP_RAID6 != 0 {
            RaidProfile::Raid6
        } else if type_flags & BTRFS_BLOCK_GROUP_RAID1 != 0 {
            RaidProfile::Raid1
        } else if type_flags & BTRFS_BLOCK_GROUP_DUP != 0 {
            RaidProfile::Dup
        } else {
            RaidProfile::Single
        }
    }

    /// Stripe slots whose on-disk order is dictated by the layout.
    pub fn is_ordered(self) -> bool {
        matches!(
            self,
            RaidProfile::Raid0 | RaidProfile::Raid10 | RaidProfile::Raid5 | RaidProfile::Raid6
        )
    }

    /// Device extents a chunk of this profile must own; `None` accepts any
    /// count (the striped layouts scale with the member devices).
    pub fn num_stripes_expected(self) -> Option<u16> {
        match self {
            RaidProfile::Raid0 | RaidProfile::Raid10 | RaidProfile::Raid5 | RaidProfile::Raid6 => {
                None
            }
            RaidProfile::Raid1 | RaidProfile::Dup => Some(2),
            RaidProfile::Single => Some(1),
        }
    }

    pub fn sub_stripes(self) -> u16 {
        match self {
            RaidProfile::Raid10 => 2,
            _ => 1,
        }
    }

    /// Stripes that carry distinct data (as opposed to copies or parity).
    /// Zero means `num_stripes` is too small for the layout; scanned
    /// records can claim such nonsense and must not panic the arithmetic.
    pub fn data_stripes(self, num_stripes: u16) -> u64 {
        let n = num_stripes as u64;
        match self {
            RaidProfile::Raid0 => n,
            RaidProfile::Raid10 => n / self.sub_stripes() as u64,
            RaidProfile::Raid5 => n.saturating_sub(1),
            RaidProfile::Raid6 => n.saturating_sub(2),
            RaidProfile::Single | RaidProfile::Dup | RaidProfile::Raid1 => 1,
        }
    }

    /// Length of each device extent backing a chunk of `chunk_length`
    /// bytes spread over `num_stripes` stripes. Zero for stripe counts
    /// the layout cannot support; no real device extent has length zero,
    /// so such chunks fail every cross check.
    pub fn stripe_length(self, chunk_length: u64, num_stripes: u16) -> u64 {
        match self {
            RaidProfile::Single | RaidProfile::Dup | RaidProfile::Raid1 => chunk_length,
            _ => {
                let data_stripes = self.data_stripes(num_stripes);
                if data_stripes == 0 {
                    0
                } else {
                    chunk_length / data_stripes
                }
            }
        }
    }

    /// Stripe slot holding the data of stripe unit `stripe_nr`.
    /// Only meaningful for the ordered layouts; the in-memory model is
    /// corrupt if this is reached for a mirrored or single profile.
    pub fn stripe_index(self, stripe_nr: u64, num_stripes: u16, sub_stripes: u16) -> usize {
        let n = num_stripes as u64;
        let index = match self {
            RaidProfile::Raid0 => stripe_nr % n,
            RaidProfile::Raid10 => (stripe_nr % (n / sub_stripes as u64)) * sub_stripes as u64,
            RaidProfile::Raid5 => {
                let data = n - 1;
                (stripe_nr % data + stripe_nr / data) % n
            }
            RaidProfile::Raid6 => {
                let data = n - 2;
                (stripe_nr % data + stripe_nr / data) % n
            }
            _ => unreachable!("stripe index requested for unordered profile"),
        };
        index as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_from_flags() {
        assert_eq!(
            RaidProfile::from_flags(BTRFS_BLOCK_GROUP_METADATA | BTRFS_BLOCK_GROUP_RAID1),
            RaidProfile::Raid1
        );
        assert_eq!(
            RaidProfile::from_flags(BTRFS_BLOCK_GROUP_DATA),
            RaidProfile::Single
        );
        assert_eq!(
            RaidProfile::from_flags(BTRFS_BLOCK_GROUP_SYSTEM | BTRFS_BLOCK_GROUP_RAID10),
            RaidProfile::Raid10
        );
    }

    #[test]
    fn expected_stripes() {
        assert_eq!(RaidProfile::Raid1.num_stripes_expected(), Some(2));
        assert_eq!(RaidProfile::Dup.num_stripes_expected(), Some(2));
        assert_eq!(RaidProfile::Single.num_stripes_expected(), Some(1));
        assert_eq!(RaidProfile::Raid0.num_stripes_expected(), None);
        assert_eq!(RaidProfile::Raid6.num_stripes_expected(), None);
    }

    #[test]
    fn stripe_lengths() {
        let mib = 1024 * 1024;
        assert_eq!(RaidProfile::Raid1.stripe_length(1024 * mib, 2), 1024 * mib);
        assert_eq!(RaidProfile::Raid0.stripe_length(2 * mib, 2), mib);
        assert_eq!(RaidProfile::Raid10.stripe_length(2 * mib, 4), mib);
        assert_eq!(RaidProfile::Raid5.stripe_length(2 * mib, 3), mib);
        assert_eq!(RaidProfile::Raid6.stripe_length(2 * mib, 4), mib);
    }

    #[test]
    fn raid0_round_robin() {
        // two stripes alternate every stripe unit
        assert_eq!(RaidProfile::Raid0.stripe_index(0, 2, 1), 0);
        assert_eq!(RaidProfile::Raid0.stripe_index(1, 2, 1), 1);
        assert_eq!(RaidProfile::Raid0.stripe_index(2, 2, 1), 0);
    }

    #[test]
    fn raid10_pairs() {
        // four stripes, copies in consecutive slots: 0,2,0,2...
        assert_eq!(RaidProfile::Raid10.stripe_index(0, 4, 2), 0);
        assert_eq!(RaidProfile::Raid10.stripe_index(1, 4, 2), 2);
        assert_eq!(RaidProfile::Raid10.stripe_index(2, 4, 2), 0);
    }

    #[test]
    fn raid5_rotation() {
        // 3 stripes, 2 data: parity rotates each full row
        assert_eq!(RaidProfile::Raid5.stripe_index(0, 3, 1), 0);
        assert_eq!(RaidProfile::Raid5.stripe_index(1, 3, 1), 1);
        assert_eq!(RaidProfile::Raid5.stripe_index(2, 3, 1), 1);
        assert_eq!(RaidProfile::Raid5.stripe_index(3, 3, 1), 2);
    }
}
