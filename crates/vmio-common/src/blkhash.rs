//! Block-based image checksum
//!
//! The image is split into fixed-size blocks; every block is hashed on
//! its own and the outer digest is computed over the sequence of block
//! digests. Zero blocks reuse a cached digest so sparse images hash in
//! time proportional to their data, not their virtual size.

use std::collections::HashMap;

use sha1::Sha1;
use sha2::{Digest as _, Sha256, Sha512};

use crate::units::MIB;

/// Default checksum block size.
pub const BLOCK_SIZE: u64 = 4 * MIB;

/// Chunk used to feed zeroes into a digest without allocating the whole
/// block.
const ZERO_CHUNK: [u8; 64 * 1024] = [0; 64 * 1024];

/// Supported digest algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    Sha1,
    Sha256,
    Sha512,
}

/// Default algorithm used when the client does not request one.
pub const ALGORITHM: Algorithm = Algorithm::Sha256;

impl Algorithm {
    /// All supported algorithm names, sorted.
    #[must_use]
    pub const fn names() -> &'static [&'static str] {
        &["sha1", "sha256", "sha512"]
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

impl std::str::FromStr for Algorithm {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(crate::Error::invalid_argument(format!(
                "unsupported algorithm {other:?}, expecting one of {:?}",
                Self::names()
            ))),
        }
    }
}

enum Digest {
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Digest {
    fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Sha1 => Self::Sha1(Sha1::new()),
            Algorithm::Sha256 => Self::Sha256(Sha256::new()),
            Algorithm::Sha512 => Self::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Self::Sha1(h) => h.finalize().to_vec(),
            Self::Sha256(h) => h.finalize().to_vec(),
            Self::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

/// Rolling block hash.
pub struct Hash {
    algorithm: Algorithm,
    outer: Digest,
    // Digest of an all-zero block, cached by block length.
    zero_digests: HashMap<u64, Vec<u8>>,
}

impl Hash {
    #[must_use]
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            outer: Digest::new(algorithm),
            zero_digests: HashMap::new(),
        }
    }

    /// Add one data block.
    pub fn update(&mut self, block: &[u8]) {
        let mut h = Digest::new(self.algorithm);
        h.update(block);
        self.outer.update(&h.finalize());
    }

    /// Add one zero block of `length` bytes.
    pub fn zero(&mut self, length: u64) {
        let algorithm = self.algorithm;
        let digest = self.zero_digests.entry(length).or_insert_with(|| {
            let mut h = Digest::new(algorithm);
            let mut todo = length;
            while todo > 0 {
                let step = todo.min(ZERO_CHUNK.len() as u64) as usize;
                h.update(&ZERO_CHUNK[..step]);
                todo -= step as u64;
            }
            h.finalize()
        });
        self.outer.update(digest);
    }

    /// Finish and return the lowercase hex digest.
    #[must_use]
    pub fn hexdigest(self) -> String {
        hex::encode(self.outer.finalize())
    }
}

/// True if `buf` contains only zero bytes.
#[must_use]
pub fn is_zero(buf: &[u8]) -> bool {
    // Word-wise scan; the tail shorter than 8 bytes is checked per byte.
    let (chunks, tail) = buf.as_chunks::<8>();
    chunks.iter().all(|c| u64::from_ne_bytes(*c) == 0) && tail.iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_parse() {
        assert_eq!("sha256".parse::<Algorithm>().unwrap(), Algorithm::Sha256);
        assert!("md5".parse::<Algorithm>().is_err());
    }

    #[test]
    fn test_zero_block_matches_data_block() {
        // Hashing an explicit zero block and using the zero shortcut
        // must produce the same digest.
        let mut a = Hash::new(Algorithm::Sha256);
        a.update(&vec![0; 8192]);

        let mut b = Hash::new(Algorithm::Sha256);
        b.zero(8192);

        assert_eq!(a.hexdigest(), b.hexdigest());
    }

    #[test]
    fn test_block_order_matters() {
        let mut a = Hash::new(Algorithm::Sha256);
        a.update(b"first");
        a.update(b"second");

        let mut b = Hash::new(Algorithm::Sha256);
        b.update(b"second");
        b.update(b"first");

        assert_ne!(a.hexdigest(), b.hexdigest());
    }

    #[test]
    fn test_digest_is_lowercase_hex() {
        let mut h = Hash::new(Algorithm::Sha1);
        h.update(b"data");
        let digest = h.hexdigest();
        assert_eq!(digest.len(), 40);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, digest.to_lowercase());
    }

    #[test]
    fn test_is_zero() {
        assert!(is_zero(&[]));
        assert!(is_zero(&[0; 4096]));
        let mut buf = vec![0; 4096];
        buf[4095] = 1;
        assert!(!is_zero(&buf));
        buf[4095] = 0;
        buf[0] = 1;
        assert!(!is_zero(&buf));
    }
}
