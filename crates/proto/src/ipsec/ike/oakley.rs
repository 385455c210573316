//! Oakley key derivation (RFC 2409 Section 5)
//!
//! ```text
//! SKEYID   = prf(pre-shared-key, Ni_b | Nr_b)
//! SKEYID_d = prf(SKEYID, g^xy | CKY-I | CKY-R | 0)
//! SKEYID_a = prf(SKEYID, SKEYID_d | g^xy | CKY-I | CKY-R | 1)
//! SKEYID_e = prf(SKEYID, SKEYID_a | g^xy | CKY-I | CKY-R | 2)
//! ```
//!
//! Messages after the key exchange are CBC encrypted with a key derived from
//! SKEYID_e. The IV of each message is the last ciphertext block of the
//! previous one in the same exchange; new exchanges start from a hash over
//! the last phase 1 block and their message ID.

use zeroize::{Zeroize, ZeroizeOnDrop};

use super::constants::COOKIE_LEN;
use crate::ipsec::crypto::{
    cipher_slice, AuthAlgorithm, CipherDirection, CryptoProvider, EncryptAlgorithm, PrfAlgorithm,
};
use crate::ipsec::sadb::SaKeys;
use crate::ipsec::{Error, Result};

/// Keying material of an ISAKMP SA
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct IsakmpKeys {
    /// SKEYID
    pub skeyid: Vec<u8>,
    /// Key for deriving IPsec keying material
    pub skeyid_d: Vec<u8>,
    /// Key for authenticating phase 2 and informational messages
    pub skeyid_a: Vec<u8>,
    /// Key for deriving the encryption key
    pub skeyid_e: Vec<u8>,
    /// Encryption key of the ISAKMP SA
    pub encryption_key: Vec<u8>,
}

impl std::fmt::Debug for IsakmpKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsakmpKeys")
            .field("encryption_key_len", &self.encryption_key.len())
            .finish()
    }
}

/// Inputs of the phase 1 key derivation
#[derive(Debug, Clone, Copy)]
pub struct KeyExchange<'a> {
    /// Pre-shared key
    pub psk: &'a [u8],
    /// Initiator nonce body
    pub nonce_i: &'a [u8],
    /// Responder nonce body
    pub nonce_r: &'a [u8],
    /// Diffie-Hellman shared secret
    pub shared_secret: &'a [u8],
    /// Initiator cookie
    pub cookie_i: &'a [u8; COOKIE_LEN],
    /// Responder cookie
    pub cookie_r: &'a [u8; COOKIE_LEN],
}

impl IsakmpKeys {
    /// Derive the SKEYID family and the encryption key
    pub fn derive(prf: PrfAlgorithm, encryption: EncryptAlgorithm, kx: &KeyExchange<'_>) -> Self {
        let skeyid = prf.compute_parts(kx.psk, &[kx.nonce_i, kx.nonce_r]);
        let tail = |seed: &[u8], n: u8| {
            prf.compute_parts(
                &skeyid,
                &[seed, kx.shared_secret, kx.cookie_i, kx.cookie_r, &[n]],
            )
        };
        let skeyid_d = tail(&[], 0);
        let skeyid_a = tail(&skeyid_d, 1);
        let skeyid_e = tail(&skeyid_a, 2);
        let encryption_key = prf.expand(&skeyid_e, encryption.key_len());

        IsakmpKeys {
            skeyid,
            skeyid_d,
            skeyid_a,
            skeyid_e,
            encryption_key,
        }
    }
}

/// IV of the first encrypted phase 1 message: hash(g^xi | g^xr)
pub fn phase1_iv(prf: PrfAlgorithm, encryption: EncryptAlgorithm, gxi: &[u8], gxr: &[u8]) -> Vec<u8> {
    truncate_iv(prf.hash(&[gxi, gxr]), encryption)
}

/// IV of a phase 2 or informational exchange: hash(last phase 1 block | M-ID)
pub fn exchange_iv(
    prf: PrfAlgorithm,
    encryption: EncryptAlgorithm,
    phase1_last_block: &[u8],
    message_id: u32,
) -> Vec<u8> {
    truncate_iv(
        prf.hash(&[phase1_last_block, &message_id.to_be_bytes()]),
        encryption,
    )
}

fn truncate_iv(mut hash: Vec<u8>, encryption: EncryptAlgorithm) -> Vec<u8> {
    hash.truncate(encryption.block_len());
    hash
}

/// Encrypt a message body; returns the ciphertext and the IV for the next
/// message
///
/// The body is zero padded to the cipher block length.
pub fn encrypt_body(
    provider: &dyn CryptoProvider,
    encryption: EncryptAlgorithm,
    key: &[u8],
    iv: &[u8],
    plain: &[u8],
) -> Result<(Vec<u8>, Vec<u8>)> {
    let block = encryption.block_len();
    let mut data = plain.to_vec();
    let padded = (data.len() + block - 1) / block * block;
    data.resize(padded.max(block), 0);
    cipher_slice(provider, encryption, key, iv, CipherDirection::Encrypt, &mut data)?;
    let next_iv = data[data.len() - block..].to_vec();
    Ok((data, next_iv))
}

/// Decrypt a message body; returns the plaintext (padding included) and
/// the IV for the next message
///
/// # Errors
///
/// Returns `Error::InvalidPadding` if the body is empty or not a multiple
/// of the block length.
pub fn decrypt_body(
    provider: &dyn CryptoProvider,
    encryption: EncryptAlgorithm,
    key: &[u8],
    iv: &[u8],
    cipher: &[u8],
) -> Result<(Vec<u8>, Vec<u8>)> {
    let block = encryption.block_len();
    if cipher.is_empty() || cipher.len() % block != 0 {
        return Err(Error::InvalidPadding);
    }
    let next_iv = cipher[cipher.len() - block..].to_vec();
    let mut data = cipher.to_vec();
    cipher_slice(provider, encryption, key, iv, CipherDirection::Decrypt, &mut data)?;
    Ok((data, next_iv))
}

/// Phase 1 authentication hash
///
/// HASH_I = prf(SKEYID, g^xi | g^xr | CKY-I | CKY-R | SAi_b | IDii_b);
/// HASH_R swaps the public values and cookies and uses IDir_b.
#[allow(clippy::too_many_arguments)]
pub fn phase1_hash(
    prf: PrfAlgorithm,
    skeyid: &[u8],
    own_public: &[u8],
    peer_public: &[u8],
    own_cookie: &[u8; COOKIE_LEN],
    peer_cookie: &[u8; COOKIE_LEN],
    sa_initiator: &[u8],
    own_id: &[u8],
) -> Vec<u8> {
    prf.compute_parts(
        skeyid,
        &[own_public, peer_public, own_cookie, peer_cookie, sa_initiator, own_id],
    )
}

/// HASH(1) of quick mode and the hash of informational exchanges:
/// prf(SKEYID_a, M-ID | payloads)
pub fn message_hash(prf: PrfAlgorithm, skeyid_a: &[u8], message_id: u32, payloads: &[u8]) -> Vec<u8> {
    prf.compute_parts(skeyid_a, &[&message_id.to_be_bytes(), payloads])
}

/// HASH(2) of quick mode: prf(SKEYID_a, M-ID | Ni_b | payloads)
pub fn quick_hash2(
    prf: PrfAlgorithm,
    skeyid_a: &[u8],
    message_id: u32,
    nonce_i: &[u8],
    payloads: &[u8],
) -> Vec<u8> {
    prf.compute_parts(skeyid_a, &[&message_id.to_be_bytes(), nonce_i, payloads])
}

/// HASH(3) of quick mode: prf(SKEYID_a, 0 | M-ID | Ni_b | Nr_b)
pub fn quick_hash3(
    prf: PrfAlgorithm,
    skeyid_a: &[u8],
    message_id: u32,
    nonce_i: &[u8],
    nonce_r: &[u8],
) -> Vec<u8> {
    prf.compute_parts(skeyid_a, &[&[0], &message_id.to_be_bytes(), nonce_i, nonce_r])
}

/// Inputs of the keying material of one IPsec SA
#[derive(Debug, Clone, Copy)]
pub struct KeymatInput<'a> {
    /// IPsec protocol id
    pub protocol: u8,
    /// SPI of the SA
    pub spi: u32,
    /// Quick mode Diffie-Hellman secret when PFS is used
    pub pfs_secret: Option<&'a [u8]>,
    /// Initiator nonce body
    pub nonce_i: &'a [u8],
    /// Responder nonce body
    pub nonce_r: &'a [u8],
}

/// Keying material of an IPsec SA
///
/// KEYMAT = prf(SKEYID_d, [g(qm)^xy |] protocol | SPI | Ni_b | Nr_b),
/// stretched as needed. The encryption key is taken first, then the
/// authentication key.
pub fn keymat(
    prf: PrfAlgorithm,
    skeyid_d: &[u8],
    input: &KeymatInput<'_>,
    encryption: Option<EncryptAlgorithm>,
    auth: Option<AuthAlgorithm>,
) -> SaKeys {
    let enc_len = encryption.map_or(0, |e| e.key_len());
    let auth_len = auth.map_or(0, |a| a.key_len());

    let mut seed = Vec::new();
    if let Some(secret) = input.pfs_secret {
        seed.extend_from_slice(secret);
    }
    seed.push(input.protocol);
    seed.extend_from_slice(&input.spi.to_be_bytes());
    seed.extend_from_slice(input.nonce_i);
    seed.extend_from_slice(input.nonce_r);

    let mut material = prf.prf_plus(skeyid_d, &seed, enc_len + auth_len);
    let keys = SaKeys::new(&material[enc_len..], &material[..enc_len]);
    material.zeroize();
    seed.zeroize();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::crypto::SoftwareCrypto;

    fn exchange<'a>(secret: &'a [u8]) -> KeyExchange<'a> {
        KeyExchange {
            psk: b"shared secret",
            nonce_i: &[1; 20],
            nonce_r: &[2; 20],
            shared_secret: secret,
            cookie_i: &[3; 8],
            cookie_r: &[4; 8],
        }
    }

    #[test]
    fn test_key_derivation() {
        let secret = [5u8; 128];
        let a = IsakmpKeys::derive(PrfAlgorithm::Sha1, EncryptAlgorithm::Aes256Cbc, &exchange(&secret));
        let b = IsakmpKeys::derive(PrfAlgorithm::Sha1, EncryptAlgorithm::Aes256Cbc, &exchange(&secret));
        assert_eq!(a.skeyid_e, b.skeyid_e);
        assert_eq!(a.encryption_key.len(), 32);
        assert_ne!(a.skeyid_d, a.skeyid_a);
        assert_ne!(a.skeyid_a, a.skeyid_e);

        // the expanded key starts with prf(SKEYID_e, 0)
        let k1 = PrfAlgorithm::Sha1.compute(&a.skeyid_e, &[0]);
        assert_eq!(&a.encryption_key[..20], &k1[..]);

        let other = [6u8; 128];
        let c = IsakmpKeys::derive(PrfAlgorithm::Sha1, EncryptAlgorithm::Aes256Cbc, &exchange(&other));
        assert_ne!(a.skeyid_d, c.skeyid_d);
        assert_eq!(a.skeyid, c.skeyid);
    }

    #[test]
    fn test_body_encryption_chains_iv() {
        let provider = SoftwareCrypto::new();
        let key: Vec<u8> = (1..=24).collect();
        let enc = EncryptAlgorithm::TripleDesCbc;
        let iv = phase1_iv(PrfAlgorithm::Md5, enc, &[1; 128], &[2; 128]);
        assert_eq!(iv.len(), 8);

        let plain = b"identification and hash payloads".to_vec();
        let (cipher, next_iv) = encrypt_body(&provider, enc, &key, &iv, &plain[..29]).unwrap();
        assert_eq!(cipher.len(), 32);
        assert_eq!(next_iv, cipher[24..].to_vec());

        let (decrypted, peer_iv) = decrypt_body(&provider, enc, &key, &iv, &cipher).unwrap();
        assert_eq!(&decrypted[..29], &plain[..29]);
        assert_eq!(&decrypted[29..], &[0, 0, 0]);
        assert_eq!(peer_iv, next_iv);

        assert_eq!(
            decrypt_body(&provider, enc, &key, &iv, &cipher[..30]),
            Err(Error::InvalidPadding)
        );
    }

    #[test]
    fn test_exchange_iv_depends_on_message_id() {
        let enc = EncryptAlgorithm::Aes128Cbc;
        let a = exchange_iv(PrfAlgorithm::Sha1, enc, &[9; 16], 1);
        let b = exchange_iv(PrfAlgorithm::Sha1, enc, &[9; 16], 2);
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn test_keymat_split_and_direction() {
        let input = KeymatInput {
            protocol: 3,
            spi: 300,
            pfs_secret: None,
            nonce_i: &[1; 16],
            nonce_r: &[2; 16],
        };
        let keys = keymat(
            PrfAlgorithm::Sha1,
            &[8; 20],
            &input,
            Some(EncryptAlgorithm::Aes256Cbc),
            Some(AuthAlgorithm::HmacSha256),
        );
        assert_eq!(keys.encryption.len(), 32);
        assert_eq!(keys.auth.len(), 32);

        let full = PrfAlgorithm::Sha1.prf_plus(
            &[8; 20],
            &[&[3u8][..], &300u32.to_be_bytes(), &[1; 16], &[2; 16]].concat(),
            64,
        );
        assert_eq!(keys.encryption, full[..32].to_vec());
        assert_eq!(keys.auth, full[32..].to_vec());

        let other_spi = keymat(
            PrfAlgorithm::Sha1,
            &[8; 20],
            &KeymatInput { spi: 301, ..input },
            Some(EncryptAlgorithm::Aes256Cbc),
            Some(AuthAlgorithm::HmacSha256),
        );
        assert_ne!(other_spi.encryption, keys.encryption);

        let pfs = keymat(
            PrfAlgorithm::Sha1,
            &[8; 20],
            &KeymatInput {
                pfs_secret: Some(&[4; 128]),
                ..input
            },
            None,
            Some(AuthAlgorithm::HmacMd5),
        );
        assert!(pfs.encryption.is_empty());
        assert_eq!(pfs.auth.len(), 16);
    }

    #[test]
    fn test_quick_hashes_differ() {
        let h1 = message_hash(PrfAlgorithm::Sha1, &[1; 20], 5, b"payloads");
        let h2 = quick_hash2(PrfAlgorithm::Sha1, &[1; 20], 5, &[2; 16], b"payloads");
        let h3 = quick_hash3(PrfAlgorithm::Sha1, &[1; 20], 5, &[2; 16], &[3; 16]);
        assert_ne!(h1, h2);
        assert_ne!(h2, h3);
        assert_eq!(h3.len(), 20);
    }
}
