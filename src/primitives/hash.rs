//! Small string/byte hashes used for event-type identifiers.

/// DJB2 hash, used to derive a stable 32-bit event-type id from its name.
pub fn strid(data: &[u8]) -> u32 {
    if data.is_empty() {
        return 0;
    }
    let mut hash: u32 = 5381;
    for &b in data {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}

/// SDBM hash, kept as a cheap second hash for callers that want to
/// decorrelate bucket placement from [`strid`] (e.g. sharding listeners
/// across multiple registries).
pub fn hash_sdbm(data: &[u8]) -> u32 {
    if data.is_empty() {
        return 0;
    }
    let mut hash: u32 = 0;
    for &b in data {
        hash = (b as u32)
            .wrapping_add(hash << 6)
            .wrapping_add(hash << 16)
            .wrapping_sub(hash);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strid_is_deterministic() {
        assert_eq!(strid(b"process.exit"), strid(b"process.exit"));
        assert_ne!(strid(b"process.exit"), strid(b"process.exec"));
    }

    #[test]
    fn empty_input_hashes_to_zero() {
        assert_eq!(strid(b""), 0);
        assert_eq!(hash_sdbm(b""), 0);
    }

    #[test]
    fn sdbm_differs_from_djb2_for_the_same_input() {
        let s = b"trace.hop.timeout";
        assert_ne!(strid(s), hash_sdbm(s));
    }
}
