//! Seeded CRC32 used for every on-disk checksum.

/// CRC32 of `data` starting from `seed`.
#[must_use]
pub fn crc32(seed: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(seed);
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_changes_checksum() {
        assert_ne!(crc32(0, b"segment"), crc32(1, b"segment"));
        assert_eq!(crc32(0, b"segment"), crc32fast::hash(b"segment"));
    }
}
