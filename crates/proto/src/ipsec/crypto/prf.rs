//! Pseudo-Random Function (PRF) implementations
//!
//! IKEv1 (RFC 2409) uses the HMAC version of the negotiated hash as its
//! prf, and the bare hash for IV derivation.

use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// PRF / hash algorithm negotiated for an ISAKMP SA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrfAlgorithm {
    /// MD5 / HMAC-MD5
    Md5,
    /// SHA-1 / HMAC-SHA1
    Sha1,
    /// SHA2-256 / HMAC-SHA2-256
    Sha256,
}

impl PrfAlgorithm {
    /// Get PRF output length in bytes
    pub fn output_len(self) -> usize {
        match self {
            PrfAlgorithm::Md5 => 16,
            PrfAlgorithm::Sha1 => 20,
            PrfAlgorithm::Sha256 => 32,
        }
    }

    /// Compute PRF
    ///
    /// # Arguments
    ///
    /// * `key` - PRF key
    /// * `data` - Input data
    ///
    /// # Returns
    ///
    /// Returns PRF output
    pub fn compute(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        self.compute_parts(key, &[data])
    }

    /// Compute PRF over the concatenation of `parts`
    pub fn compute_parts(self, key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
        match self {
            PrfAlgorithm::Md5 => {
                let mut mac =
                    Hmac::<Md5>::new_from_slice(key).expect("HMAC can take key of any size");
                for part in parts {
                    mac.update(part);
                }
                mac.finalize().into_bytes().to_vec()
            }
            PrfAlgorithm::Sha1 => {
                let mut mac =
                    Hmac::<Sha1>::new_from_slice(key).expect("HMAC can take key of any size");
                for part in parts {
                    mac.update(part);
                }
                mac.finalize().into_bytes().to_vec()
            }
            PrfAlgorithm::Sha256 => {
                let mut mac =
                    Hmac::<Sha256>::new_from_slice(key).expect("HMAC can take key of any size");
                for part in parts {
                    mac.update(part);
                }
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    /// Plain hash over the concatenation of `parts`
    pub fn hash(self, parts: &[&[u8]]) -> Vec<u8> {
        fn run<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
            let mut hasher = D::new();
            for part in parts {
                hasher.update(part);
            }
            hasher.finalize().to_vec()
        }

        match self {
            PrfAlgorithm::Md5 => run::<Md5>(parts),
            PrfAlgorithm::Sha1 => run::<Sha1>(parts),
            PrfAlgorithm::Sha256 => run::<Sha256>(parts),
        }
    }

    /// Stretch `key` to `output_len` bytes (RFC 2409 Appendix B)
    ///
    /// ```text
    /// Ka = K1 | K2 | K3 ...
    /// K1 = prf(SKEYID_e, 0)
    /// K2 = prf(SKEYID_e, K1)
    /// K3 = prf(SKEYID_e, K2)
    /// ```
    ///
    /// If `key` already has the requested length or more it is truncated
    /// and used as is.
    pub fn expand(self, key: &[u8], output_len: usize) -> Vec<u8> {
        if key.len() >= output_len {
            return key[..output_len].to_vec();
        }

        let mut output = Vec::with_capacity(output_len + self.output_len());
        let mut block = self.compute(key, &[0u8]);
        output.extend_from_slice(&block);
        while output.len() < output_len {
            block = self.compute(key, &block);
            output.extend_from_slice(&block);
        }

        output.truncate(output_len);
        output
    }

    /// Stretch keying material by feeding back the previous block
    /// together with `seed` (RFC 2409 Section 5.5)
    ///
    /// ```text
    /// KEYMAT = K1 | K2 | K3 | ...
    /// K1 = prf(SKEYID_d, seed)
    /// K2 = prf(SKEYID_d, K1 | seed)
    /// ```
    pub fn prf_plus(self, key: &[u8], seed: &[u8], output_len: usize) -> Vec<u8> {
        let mut output = Vec::with_capacity(output_len + self.output_len());
        let mut t = self.compute(key, seed);
        output.extend_from_slice(&t);

        while output.len() < output_len {
            t = self.compute_parts(key, &[&t, seed]);
            output.extend_from_slice(&t);
        }

        output.truncate(output_len);
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_lengths() {
        assert_eq!(PrfAlgorithm::Md5.compute(b"k", b"d").len(), 16);
        assert_eq!(PrfAlgorithm::Sha1.compute(b"k", b"d").len(), 20);
        assert_eq!(PrfAlgorithm::Sha256.compute(b"k", b"d").len(), 32);
    }

    #[test]
    fn test_hmac_sha256_rfc4231() {
        let out = PrfAlgorithm::Sha256.compute(&[0x0b; 20], b"Hi There");
        assert_eq!(
            hex::encode(out),
            "b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff7"
        );
    }

    #[test]
    fn test_parts_equal_concatenation() {
        let whole = PrfAlgorithm::Sha1.compute(b"key", b"abcdef");
        let parts = PrfAlgorithm::Sha1.compute_parts(b"key", &[b"ab", b"", b"cdef"]);
        assert_eq!(whole, parts);
    }

    #[test]
    fn test_hash_sha1() {
        assert_eq!(
            hex::encode(PrfAlgorithm::Sha1.hash(&[b"ab", b"c"])),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_expand() {
        let key = vec![7u8; 20];
        // long enough already
        assert_eq!(PrfAlgorithm::Sha1.expand(&key, 16), key[..16].to_vec());

        let stretched = PrfAlgorithm::Sha1.expand(&key, 24);
        assert_eq!(stretched.len(), 24);
        let k1 = PrfAlgorithm::Sha1.compute(&key, &[0]);
        assert_eq!(&stretched[..20], &k1[..]);
    }

    #[test]
    fn test_prf_plus_prefix_stable() {
        let short = PrfAlgorithm::Md5.prf_plus(b"d", b"seed", 16);
        let long = PrfAlgorithm::Md5.prf_plus(b"d", b"seed", 40);
        assert_eq!(long.len(), 40);
        assert_eq!(&long[..16], &short[..]);
    }
}
