//! Deterministic Hash Slicer
//!
//! Derives an SSSD-compatible low range for a mapping domain from its SID
//! string. SSSD picks an id slice by hashing the domain SID with
//! MurmurHash3 (x86, 32-bit) and taking the modulus against the number of
//! available slices; reproducing that byte-for-byte keeps mappings stable
//! when data moves between SSSD and winbindd deployments.

use crate::error::{Error, Result};

/// Seed SSSD uses for domain SID hashing
pub const SSSD_HASH_SEED: u32 = 0xdead_beef;

// =============================================================================
// MurmurHash3 x86 32-bit
// =============================================================================

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;
const R1: u32 = 15;
const R2: u32 = 13;
const N: u32 = 0xe654_6b64;

/// MurmurHash3, x86 32-bit variant. All arithmetic is unsigned 32-bit
/// with wrap on overflow.
pub fn murmur3_x86_32(data: &[u8], seed: u32) -> u32 {
    let mut hash = seed;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1);
        k = k.rotate_left(R1);
        k = k.wrapping_mul(C2);
        hash ^= k;
        hash = hash.rotate_left(R2);
        hash = hash.wrapping_mul(5).wrapping_add(N);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k: u32 = 0;
        if tail.len() >= 3 {
            k |= u32::from(tail[2]) << 16;
        }
        if tail.len() >= 2 {
            k |= u32::from(tail[1]) << 8;
        }
        k |= u32::from(tail[0]);
        k = k.wrapping_mul(C1);
        k = k.rotate_left(R1);
        k = k.wrapping_mul(C2);
        hash ^= k;
    }

    hash ^= data.len() as u32;
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85eb_ca6b);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xc2b2_ae35);
    hash ^= hash >> 16;

    hash
}

// =============================================================================
// Slice Derivation
// =============================================================================

/// Slice parameters matching SSSD's defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SssdRangeParams {
    pub range_size: u32,
    pub range_low: u32,
    pub range_max: u32,
}

impl Default for SssdRangeParams {
    fn default() -> Self {
        Self {
            range_size: 200_000,
            range_low: 10_001,
            range_max: 2_000_200_000,
        }
    }
}

/// Compute the SSSD-compatible low range for a domain SID.
///
/// `(hash mod max_slices) * range_size + range_size`, where `max_slices`
/// is the number of whole slices between `range_low` and `range_max`.
/// With SSSD's default settings this is deterministic as long as the
/// domain has fewer than `range_size` RIDs.
pub fn sssd_low_range(sid: &str, params: &SssdRangeParams, seed: u32) -> Result<u32> {
    let span = params.range_max.saturating_sub(params.range_low);
    let max_slices = span / params.range_size.max(1);
    if params.range_size == 0 || max_slices == 0 {
        return Err(Error::Configuration(format!(
            "no id slices available for range_size={} range_low={} range_max={}",
            params.range_size, params.range_low, params.range_max
        )));
    }

    let hash = murmur3_x86_32(sid.as_bytes(), seed);
    let slice = u64::from(hash % max_slices);
    let low = slice * u64::from(params.range_size) + u64::from(params.range_size);

    u32::try_from(low).map_err(|_| {
        Error::Configuration(format!(
            "derived low range {low} exceeds the platform maximum"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_murmur3_reference_vectors() {
        // Canonical verification vectors for the x86 32-bit variant
        assert_eq!(murmur3_x86_32(b"", 0), 0);
        assert_eq!(murmur3_x86_32(b"", 1), 0x514e_28b7);
        assert_eq!(murmur3_x86_32(b"", 0xffff_ffff), 0x81f1_6f39);
        assert_eq!(murmur3_x86_32(b"aaaa", 0x9747_b28c), 0x5a97_808a);
        assert_eq!(murmur3_x86_32(b"aaa", 0x9747_b28c), 0x283e_0130);
        assert_eq!(murmur3_x86_32(b"aa", 0x9747_b28c), 0x5d21_1726);
        assert_eq!(murmur3_x86_32(b"a", 0x9747_b28c), 0x7fa0_9ea6);
    }

    #[test]
    fn test_slice_deterministic() {
        let params = SssdRangeParams::default();
        let sid = "S-1-5-21-3623811015-3361044348-30300820";

        let first = sssd_low_range(sid, &params, SSSD_HASH_SEED).unwrap();
        let second = sssd_low_range(sid, &params, SSSD_HASH_SEED).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_slice_bounds() {
        let params = SssdRangeParams::default();
        let max_slices = (params.range_max - params.range_low) / params.range_size;

        for sid in [
            "S-1-5-21-3623811015-3361044348-30300820",
            "S-1-5-21-1-2-3",
            "S-1-5-32-544",
        ] {
            let low = sssd_low_range(sid, &params, SSSD_HASH_SEED).unwrap();
            // Slice-aligned and within the slice space
            assert_eq!(low % params.range_size, 0);
            assert!(low >= params.range_size);
            assert!(low <= max_slices * params.range_size);
        }
    }

    #[test]
    fn test_sids_spread_across_slices() {
        let params = SssdRangeParams::default();
        let lows: std::collections::BTreeSet<u32> = [
            "S-1-5-21-1-2-3",
            "S-1-5-21-3-2-1",
            "S-1-5-21-3623811015-3361044348-30300820",
            "S-1-5-21-2024415790-682910810-2744055461",
            "S-1-5-21-484763869-746138391-3299886468",
        ]
        .iter()
        .map(|sid| sssd_low_range(sid, &params, SSSD_HASH_SEED).unwrap())
        .collect();

        assert!(lows.len() > 1);
    }

    #[test]
    fn test_zero_slices_is_config_error() {
        let params = SssdRangeParams {
            range_size: 200_000,
            range_low: 10_001,
            range_max: 10_001,
        };
        let err = sssd_low_range("S-1-5-21-1-2-3", &params, SSSD_HASH_SEED).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
