//! Authenticator table
//!
//! | id | algorithm         | key | ICV |
//! |----|-------------------|-----|-----|
//! | 0  | HMAC-MD5-96       | 16  | 12  |
//! | 1  | HMAC-SHA1-96      | 20  | 12  |
//! | 2  | HMAC-SHA-256-128  | 32  | 16  |
//! | 3  | AES-XCBC-MAC-96   | 16  | 12  |

use super::{get_algo_index, AlgorithmId};
use crate::ipsec::Result;

/// Primitive behind an authenticator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestPrimitive {
    /// HMAC with MD5
    HmacMd5,
    /// HMAC with SHA-1
    HmacSha1,
    /// HMAC with SHA-256
    HmacSha256,
    /// AES-XCBC-MAC (RFC 3566)
    AesXcbc,
}

/// Authenticator table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthAlgoEntry {
    /// Algorithm id
    pub id: u8,
    /// Display name
    pub name: &'static str,
    /// Key length in bytes
    pub key_len: usize,
    /// Truncated digest (ICV) length in bytes
    pub digest_len: usize,
    /// Primitive
    pub primitive: DigestPrimitive,
}

impl AlgorithmId for AuthAlgoEntry {
    fn id(&self) -> u8 {
        self.id
    }
}

/// Compiled-in authenticators
pub static AUTH_ALGORITHMS: [AuthAlgoEntry; 4] = [
    AuthAlgoEntry {
        id: 0,
        name: "hmac-md5-96",
        key_len: 16,
        digest_len: 12,
        primitive: DigestPrimitive::HmacMd5,
    },
    AuthAlgoEntry {
        id: 1,
        name: "hmac-sha1-96",
        key_len: 20,
        digest_len: 12,
        primitive: DigestPrimitive::HmacSha1,
    },
    AuthAlgoEntry {
        id: 2,
        name: "hmac-sha256-128",
        key_len: 32,
        digest_len: 16,
        primitive: DigestPrimitive::HmacSha256,
    },
    AuthAlgoEntry {
        id: 3,
        name: "aes-xcbc-mac-96",
        key_len: 16,
        digest_len: 12,
        primitive: DigestPrimitive::AesXcbc,
    },
];

/// Authentication algorithm of an SA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AuthAlgorithm {
    /// HMAC-MD5-96
    HmacMd5 = 0,
    /// HMAC-SHA1-96
    HmacSha1 = 1,
    /// HMAC-SHA-256-128
    HmacSha256 = 2,
    /// AES-XCBC-MAC-96
    AesXcbc = 3,
}

impl AuthAlgorithm {
    /// Resolve an algorithm id
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidAlgoId` if the id is not compiled in.
    pub fn from_id(id: u8) -> Result<Self> {
        let index = get_algo_index(&AUTH_ALGORITHMS, id)?;
        Ok(match AUTH_ALGORITHMS[index].primitive {
            DigestPrimitive::HmacMd5 => AuthAlgorithm::HmacMd5,
            DigestPrimitive::HmacSha1 => AuthAlgorithm::HmacSha1,
            DigestPrimitive::HmacSha256 => AuthAlgorithm::HmacSha256,
            DigestPrimitive::AesXcbc => AuthAlgorithm::AesXcbc,
        })
    }

    /// Algorithm id
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Table entry
    pub fn entry(self) -> &'static AuthAlgoEntry {
        &AUTH_ALGORITHMS[self as usize]
    }

    /// Key length in bytes
    pub fn key_len(self) -> usize {
        self.entry().key_len
    }

    /// ICV length in bytes
    pub fn digest_len(self) -> usize {
        self.entry().digest_len
    }
}
