//! Encryptor table
//!
//! All ciphers run in CBC mode with an explicit per-packet IV. The NULL
//! cipher (RFC 2410) has no IV and only requires 4-byte alignment of the
//! ESP trailer.

use super::{get_algo_index, AlgorithmId};
use crate::ipsec::Result;

/// Primitive behind an encryptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherPrimitive {
    /// DES
    Des,
    /// Triple DES (EDE3)
    TripleDes,
    /// AES, key size given by the key
    Aes,
    /// Blowfish
    Blowfish,
    /// CAST-128
    Cast128,
    /// No encryption
    Null,
}

/// Encryptor table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptAlgoEntry {
    /// Algorithm id
    pub id: u8,
    /// Display name
    pub name: &'static str,
    /// Key length in bytes
    pub key_len: usize,
    /// Block length, or payload alignment for NULL
    pub block_len: usize,
    /// IV length carried in each ESP packet
    pub iv_len: usize,
    /// Primitive
    pub primitive: CipherPrimitive,
}

impl AlgorithmId for EncryptAlgoEntry {
    fn id(&self) -> u8 {
        self.id
    }
}

const fn cbc(
    id: u8,
    name: &'static str,
    key_len: usize,
    block_len: usize,
    primitive: CipherPrimitive,
) -> EncryptAlgoEntry {
    EncryptAlgoEntry {
        id,
        name,
        key_len,
        block_len,
        iv_len: block_len,
        primitive,
    }
}

/// Compiled-in encryptors
pub static ENCRYPT_ALGORITHMS: [EncryptAlgoEntry; 8] = [
    cbc(0, "des-cbc", 8, 8, CipherPrimitive::Des),
    cbc(1, "3des-cbc", 24, 8, CipherPrimitive::TripleDes),
    cbc(2, "aes128-cbc", 16, 16, CipherPrimitive::Aes),
    cbc(3, "aes192-cbc", 24, 16, CipherPrimitive::Aes),
    cbc(4, "aes256-cbc", 32, 16, CipherPrimitive::Aes),
    cbc(5, "blowfish-cbc", 16, 8, CipherPrimitive::Blowfish),
    cbc(6, "cast128-cbc", 16, 8, CipherPrimitive::Cast128),
    EncryptAlgoEntry {
        id: 7,
        name: "null",
        key_len: 0,
        block_len: 4,
        iv_len: 0,
        primitive: CipherPrimitive::Null,
    },
];

/// Encryption algorithm of an SA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EncryptAlgorithm {
    /// DES-CBC
    DesCbc = 0,
    /// 3DES-CBC
    TripleDesCbc = 1,
    /// AES-128-CBC
    Aes128Cbc = 2,
    /// AES-192-CBC
    Aes192Cbc = 3,
    /// AES-256-CBC
    Aes256Cbc = 4,
    /// Blowfish-CBC (128-bit key)
    BlowfishCbc = 5,
    /// CAST128-CBC
    Cast128Cbc = 6,
    /// NULL encryption
    Null = 7,
}

impl EncryptAlgorithm {
    const ALL: [EncryptAlgorithm; 8] = [
        EncryptAlgorithm::DesCbc,
        EncryptAlgorithm::TripleDesCbc,
        EncryptAlgorithm::Aes128Cbc,
        EncryptAlgorithm::Aes192Cbc,
        EncryptAlgorithm::Aes256Cbc,
        EncryptAlgorithm::BlowfishCbc,
        EncryptAlgorithm::Cast128Cbc,
        EncryptAlgorithm::Null,
    ];

    /// Resolve an algorithm id
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidAlgoId` if the id is not compiled in.
    pub fn from_id(id: u8) -> Result<Self> {
        let index = get_algo_index(&ENCRYPT_ALGORITHMS, id)?;
        Ok(Self::ALL[index])
    }

    /// Algorithm id
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Table entry
    pub fn entry(self) -> &'static EncryptAlgoEntry {
        &ENCRYPT_ALGORITHMS[self as usize]
    }

    /// Key length in bytes
    pub fn key_len(self) -> usize {
        self.entry().key_len
    }

    /// Block length in bytes
    pub fn block_len(self) -> usize {
        self.entry().block_len
    }

    /// IV length in bytes
    pub fn iv_len(self) -> usize {
        self.entry().iv_len
    }

    /// Whether this is the NULL cipher
    pub fn is_null(self) -> bool {
        self == EncryptAlgorithm::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::Error;

    #[test]
    fn test_table_order_matches_enum() {
        for algo in EncryptAlgorithm::ALL {
            assert_eq!(algo.entry().id, algo.id());
            assert_eq!(EncryptAlgorithm::from_id(algo.id()).unwrap(), algo);
        }
        assert_eq!(
            EncryptAlgorithm::from_id(8),
            Err(Error::InvalidAlgoId(8))
        );
    }

    #[test]
    fn test_null_cipher_layout() {
        let null = EncryptAlgorithm::Null;
        assert!(null.is_null());
        assert_eq!(null.iv_len(), 0);
        assert_eq!(null.block_len(), 4);
        assert_eq!(null.key_len(), 0);
    }

    #[test]
    fn test_iv_lengths() {
        assert_eq!(EncryptAlgorithm::TripleDesCbc.iv_len(), 8);
        assert_eq!(EncryptAlgorithm::Aes256Cbc.iv_len(), 16);
        assert_eq!(EncryptAlgorithm::Aes256Cbc.key_len(), 32);
    }
}
