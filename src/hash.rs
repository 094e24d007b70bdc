//! 15-bit tag hash for bucket slots.
//!
//! Tags hash the key offset from the bucket's smallest key, which
//! concentrates entropy in the low bits since keys sharing a bucket share
//! a long common prefix. Bit 0 of a stored tag is the appendix flag and is
//! never part of the hash identity; tag 0 marks an empty slot.

/// Mask that strips the appendix flag off a stored tag.
pub const TAG_IDENTITY_MASK: u16 = 0xFFFE;

/// Bit 0 of a stored tag: the paired slot holds an appendix handle.
pub const APPENDIX_FLAG: u16 = 1;

#[inline]
fn mhash_add(hash: u32, data: u32) -> u32 {
    // MurmurHash3 mixing step; zero-valued data leaves the hash unchanged.
    let mixed = if data == 0 {
        hash
    } else {
        hash ^ data
            .wrapping_mul(0xcc9e_2d51)
            .rotate_left(15)
            .wrapping_mul(0x1b87_3593)
    };
    mixed.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64)
}

/// 64-bit to 32-bit hash: Murmur-style mixing of both halves with a CRC
/// folding finisher to push entropy into the low 16 bits.
#[inline]
pub fn hash_u64(x: u64) -> u32 {
    let mut h = mhash_add(0, x as u32);
    h = mhash_add(h, (x >> 32) as u32);
    let h = crc32fast::hash(&h.to_le_bytes()).wrapping_mul(0x8052_04f3);
    h ^ (h >> 16)
}

/// Computes the 15-bit slot tag for `key` relative to `base`. The result
/// always has bit 0 clear and is never zero (zero remaps to 2 so it can
/// not collide with the empty-slot sentinel).
#[inline]
pub fn tag15(key: u64, base: u64) -> u16 {
    let tag = hash_u64(key.wrapping_sub(base)) as u16 & TAG_IDENTITY_MASK;
    if tag == 0 {
        2
    } else {
        tag
    }
}

/// Strips the appendix flag from a stored tag word.
#[inline]
pub fn tag_identity(raw: u16) -> u16 {
    raw & TAG_IDENTITY_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_never_zero_and_flag_bit_clear() {
        for key in 0..10_000u64 {
            let tag = tag15(key, 0);
            assert_ne!(tag, 0);
            assert_eq!(tag & APPENDIX_FLAG, 0);
        }
    }

    #[test]
    fn tag_depends_on_offset_not_absolute_key() {
        // tag15 hashes key - base, so shifting both leaves the tag fixed.
        for delta in 1..1_000u64 {
            assert_eq!(tag15(delta, 0), tag15(1 << 40 | delta, 1 << 40));
        }
    }

    #[test]
    fn tags_spread_over_the_15_bit_space() {
        let mut seen = std::collections::HashSet::new();
        for key in 0..4_096u64 {
            seen.insert(tag15(key, 0));
        }
        // A degenerate hash would land far below this.
        assert!(seen.len() > 3_500, "only {} distinct tags", seen.len());
    }
}
