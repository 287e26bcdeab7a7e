//! Stable hashing used to partition keys across ranks.
//!
//! Goals:
//! - Use a stable, explicit hash (not std::DefaultHasher) so the key -> rank
//!   mapping is identical on every rank, toolchain and platform.
//! - Keep the seed named: aggregate() on different ranks must agree bit-for-bit.

use std::hash::Hasher;
use twox_hash::XxHash64;

/// Seed of the builtin partition hash. Never change it mid-job: every rank
/// of a run must map a key to the same owner.
pub const PARTITION_SEED: u64 = 0x4D52_5047_7269_7374; // "MRPGrist"

/// 64-bit stable hash of a key.
pub fn hash64(key: &[u8]) -> u64 {
    let mut h = XxHash64::with_seed(PARTITION_SEED);
    h.write(key);
    h.finish()
}

/// Builtin key -> rank mapping used by aggregate()/collate() when the caller
/// does not supply a hash function.
#[inline]
pub fn key_to_rank(key: &[u8], nprocs: usize) -> usize {
    debug_assert!(nprocs > 0);
    (hash64(key) % nprocs as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_across_calls() {
        assert_eq!(hash64(b"the"), hash64(b"the"));
        assert_ne!(hash64(b"the"), hash64(b"cat"));
    }

    #[test]
    fn rank_in_range() {
        for np in 1..9usize {
            for key in [&b"a"[..], b"", b"some longer key bytes"] {
                assert!(key_to_rank(key, np) < np);
            }
        }
    }
}
