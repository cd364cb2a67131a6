use sha3::{Digest, Keccak256};

/// Hash arbitrary bytes with Keccak-256 (the Ethereum variant, not NIST SHA3).
#[must_use]
pub fn keccak256(data: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data.as_ref());
    <[u8; 32]>::from(hasher.finalize())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn keccak256_of_abc_matches_known_vector() {
        // https://keccak.team/files/Keccak-implementation-3.2.pdf test vector
        let digest = keccak256(b"abc");
        assert_eq!(
            hex::encode(digest),
            "4e03657aea45a94fc7d47ba826c8d667c0d1e6e33a64a036ec44f58fa12d6c45"
        );
    }
}
