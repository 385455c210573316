//! Authenticator and encryptor algorithm tables
//!
//! IPsec SAs refer to their algorithms by small integer ids. The tables in
//! [`auth`] and [`cipher`] map each id to its key/digest/block lengths and to
//! the primitive that implements it. The primitives themselves are reached
//! through the [`CryptoProvider`] trait; [`SoftwareCrypto`] is the default
//! provider built on the RustCrypto crates.
//!
//! The helpers in this module run digests and CBC ciphers over
//! [`BufferChain`] ranges. Cipher blocks that straddle a segment boundary are
//! gathered into a scratch block, processed and scattered back.

pub mod auth;
pub mod cipher;
pub mod prf;
pub mod software;
pub mod xcbc;

pub use auth::{AuthAlgorithm, DigestPrimitive, AUTH_ALGORITHMS};
pub use cipher::{CipherPrimitive, EncryptAlgorithm, ENCRYPT_ALGORITHMS};
pub use prf::PrfAlgorithm;
pub use software::SoftwareCrypto;

use super::{buffer::BufferChain, Error, Result};

/// Largest cipher block handled by the engine
pub const MAX_BLOCK_LEN: usize = 16;

/// Table entry with a stable algorithm id
pub trait AlgorithmId {
    /// Algorithm id as stored in SAs and policies
    fn id(&self) -> u8;
}

/// Find the table index for an algorithm id
///
/// Ids are assigned so that they equal their table index, which makes the
/// common case a single comparison. Tables that do not follow that layout
/// fall back to a linear search.
///
/// # Errors
///
/// Returns `Error::InvalidAlgoId` if no entry carries `id`.
pub fn get_algo_index<T: AlgorithmId>(table: &[T], id: u8) -> Result<usize> {
    let direct = id as usize;
    if direct < table.len() && table[direct].id() == id {
        return Ok(direct);
    }
    table
        .iter()
        .position(|entry| entry.id() == id)
        .ok_or(Error::InvalidAlgoId(id))
}

/// Direction of a cipher operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherDirection {
    /// Encrypt
    Encrypt,
    /// Decrypt
    Decrypt,
}

/// Streaming keyed digest
pub trait DigestContext: Send {
    /// Feed data
    fn update(&mut self, data: &[u8]);

    /// Produce the untruncated digest
    fn finalize(self: Box<Self>) -> Vec<u8>;
}

/// Streaming CBC cipher; chaining state is carried across calls
pub trait BlockCipherContext: Send {
    /// Cipher block length
    fn block_len(&self) -> usize;

    /// Process `data` in place; its length is a multiple of the block length
    fn process(&mut self, data: &mut [u8]) -> Result<()>;
}

/// Provider of the cryptographic primitives
///
/// The transform engine only knows the invocation contract; the primitives
/// may come from software or from a hardware engine.
pub trait CryptoProvider: Send + Sync {
    /// Start a keyed digest
    fn digest(&self, primitive: DigestPrimitive, key: &[u8]) -> Result<Box<dyn DigestContext>>;

    /// Start a CBC cipher operation
    fn cipher(
        &self,
        primitive: CipherPrimitive,
        key: &[u8],
        iv: &[u8],
        direction: CipherDirection,
    ) -> Result<Box<dyn BlockCipherContext>>;

    /// Fill `buf` with random bytes
    fn random(&self, buf: &mut [u8]);
}

/// Input of a digest computed over a buffer chain
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestInput<'a> {
    /// Offset of the first authenticated byte
    pub offset: usize,
    /// Number of authenticated bytes in the chain
    pub len: usize,
    /// Bytes appended to the digest input only (ESN high-order bits)
    pub trailer: &'a [u8],
}

/// Compute an authenticator over a chain range, truncated to the table's
/// digest length
pub fn calculate_digest(
    provider: &dyn CryptoProvider,
    algo: AuthAlgorithm,
    key: &[u8],
    chain: &BufferChain,
    input: DigestInput<'_>,
) -> Result<Vec<u8>> {
    let entry = algo.entry();
    if key.len() != entry.key_len {
        return Err(Error::InvalidParameter(format!(
            "{} key must be {} bytes, got {}",
            entry.name,
            entry.key_len,
            key.len()
        )));
    }
    let mut ctx = provider.digest(entry.primitive, key)?;
    chain.for_each_chunk(input.offset, input.len, |chunk| ctx.update(chunk))?;
    ctx.update(input.trailer);
    let mut digest = ctx.finalize();
    digest.truncate(entry.digest_len);
    Ok(digest)
}

/// Run a CBC cipher in place over `[offset, offset + len)` of a chain
///
/// `len` must be a multiple of the algorithm's block length.
#[allow(clippy::too_many_arguments)]
pub fn cipher_operation(
    provider: &dyn CryptoProvider,
    algo: EncryptAlgorithm,
    key: &[u8],
    iv: &[u8],
    direction: CipherDirection,
    chain: &mut BufferChain,
    offset: usize,
    len: usize,
) -> Result<()> {
    let entry = algo.entry();
    if entry.primitive == CipherPrimitive::Null {
        return Ok(());
    }
    let block = entry.block_len;
    if len % block != 0 {
        return Err(Error::InvalidPadding);
    }
    let mut ctx = provider.cipher(entry.primitive, key, iv, direction)?;

    let end = offset + len;
    let mut pos = offset;
    while pos < end {
        let run = (chain.contiguous_len(pos).min(end - pos) / block) * block;
        if run > 0 {
            let slice = chain
                .slice_mut(pos, run)
                .ok_or_else(|| Error::Internal("contiguous run vanished".into()))?;
            ctx.process(slice)?;
            pos += run;
        } else {
            // block spans two segments: borrow the missing bytes
            let mut scratch = [0u8; MAX_BLOCK_LEN];
            chain.read_at(pos, &mut scratch[..block])?;
            ctx.process(&mut scratch[..block])?;
            chain.write_at(pos, &scratch[..block])?;
            pos += block;
        }
    }
    Ok(())
}

/// Run a CBC cipher over a contiguous buffer
pub fn cipher_slice(
    provider: &dyn CryptoProvider,
    algo: EncryptAlgorithm,
    key: &[u8],
    iv: &[u8],
    direction: CipherDirection,
    data: &mut [u8],
) -> Result<()> {
    let entry = algo.entry();
    if entry.primitive == CipherPrimitive::Null {
        return Ok(());
    }
    if data.len() % entry.block_len != 0 {
        return Err(Error::InvalidPadding);
    }
    let mut ctx = provider.cipher(entry.primitive, key, iv, direction)?;
    ctx.process(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sparse(u8);

    impl AlgorithmId for Sparse {
        fn id(&self) -> u8 {
            self.0
        }
    }

    #[test]
    fn test_get_algo_index_direct() {
        for (i, entry) in AUTH_ALGORITHMS.iter().enumerate() {
            assert_eq!(get_algo_index(&AUTH_ALGORITHMS, entry.id).unwrap(), i);
        }
        for (i, entry) in ENCRYPT_ALGORITHMS.iter().enumerate() {
            assert_eq!(get_algo_index(&ENCRYPT_ALGORITHMS, entry.id).unwrap(), i);
        }
    }

    #[test]
    fn test_get_algo_index_stable_and_invalid() {
        let first = get_algo_index(&ENCRYPT_ALGORITHMS, 2).unwrap();
        let second = get_algo_index(&ENCRYPT_ALGORITHMS, 2).unwrap();
        assert_eq!(first, second);

        assert_eq!(
            get_algo_index(&AUTH_ALGORITHMS, 200),
            Err(Error::InvalidAlgoId(200))
        );
        assert_eq!(
            get_algo_index(&ENCRYPT_ALGORITHMS, 99),
            Err(Error::InvalidAlgoId(99))
        );
    }

    #[test]
    fn test_get_algo_index_linear_fallback() {
        let table = [Sparse(12), Sparse(3), Sparse(1)];
        assert_eq!(get_algo_index(&table, 1).unwrap(), 2);
        assert_eq!(get_algo_index(&table, 12).unwrap(), 0);
        assert!(get_algo_index(&table, 2).is_err());
    }

    #[test]
    fn test_cipher_over_segments_matches_contiguous() {
        let provider = SoftwareCrypto::new();
        let key = [0x11u8; 16];
        let iv = [0x22u8; 16];
        let plain: Vec<u8> = (0..96u8).collect();

        let mut flat = plain.clone();
        cipher_slice(
            &provider,
            EncryptAlgorithm::Aes128Cbc,
            &key,
            &iv,
            CipherDirection::Encrypt,
            &mut flat,
        )
        .unwrap();

        // 7-byte segments force most blocks to straddle a boundary
        let mut chain = BufferChain::segmented(&plain, 7);
        cipher_operation(
            &provider,
            EncryptAlgorithm::Aes128Cbc,
            &key,
            &iv,
            CipherDirection::Encrypt,
            &mut chain,
            0,
            96,
        )
        .unwrap();
        assert_eq!(chain.to_vec(), flat);

        cipher_operation(
            &provider,
            EncryptAlgorithm::Aes128Cbc,
            &key,
            &iv,
            CipherDirection::Decrypt,
            &mut chain,
            0,
            96,
        )
        .unwrap();
        assert_eq!(chain.to_vec(), plain);
    }

    #[test]
    fn test_cipher_rejects_partial_block() {
        let provider = SoftwareCrypto::new();
        let mut chain = BufferChain::from_slice(&[0u8; 12]);
        let result = cipher_operation(
            &provider,
            EncryptAlgorithm::DesCbc,
            &[1u8; 8],
            &[0u8; 8],
            CipherDirection::Encrypt,
            &mut chain,
            0,
            12,
        );
        assert_eq!(result, Err(Error::InvalidPadding));
    }

    #[test]
    fn test_digest_over_segments_with_trailer() {
        let provider = SoftwareCrypto::new();
        let key = [0x0bu8; 20];
        let data = b"Hi There, segmented";

        let whole = calculate_digest(
            &provider,
            AuthAlgorithm::HmacSha1,
            &key,
            &BufferChain::from_slice(data),
            DigestInput {
                offset: 0,
                len: data.len(),
                trailer: &[0, 0, 0, 1],
            },
        )
        .unwrap();

        let split = calculate_digest(
            &provider,
            AuthAlgorithm::HmacSha1,
            &key,
            &BufferChain::segmented(data, 3),
            DigestInput {
                offset: 0,
                len: data.len(),
                trailer: &[0, 0, 0, 1],
            },
        )
        .unwrap();

        assert_eq!(whole.len(), 12);
        assert_eq!(whole, split);
    }

    #[test]
    fn test_digest_key_length_checked() {
        let provider = SoftwareCrypto::new();
        let result = calculate_digest(
            &provider,
            AuthAlgorithm::HmacMd5,
            &[0u8; 3],
            &BufferChain::from_slice(b"x"),
            DigestInput {
                offset: 0,
                len: 1,
                trailer: &[],
            },
        );
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }
}
