//! Software crypto provider built on the RustCrypto crates

use aes::{Aes128, Aes192, Aes256};
use blowfish::Blowfish;
use cast5::Cast5;
use cbc::{Decryptor, Encryptor};
use cipher::{
    generic_array::GenericArray, BlockCipher, BlockDecryptMut, BlockEncryptMut, InnerIvInit,
    KeyInit,
};
use des::{Des, TdesEde3};
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::RngCore;
use sha1::Sha1;
use sha2::Sha256;

use super::xcbc::XcbcMac;
use super::{
    BlockCipherContext, CipherDirection, CipherPrimitive, CryptoProvider, DigestContext,
    DigestPrimitive,
};
use crate::ipsec::{Error, Result};

/// Default provider: pure-Rust primitives, OS randomness
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareCrypto;

impl SoftwareCrypto {
    /// Create the provider
    pub fn new() -> Self {
        SoftwareCrypto
    }
}

struct HmacContext<M: Mac + Send>(M);

impl<M: Mac + Send> DigestContext for HmacContext<M> {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        self.0.finalize().into_bytes().to_vec()
    }
}

fn hmac_context<M>(key: &[u8]) -> Result<Box<dyn DigestContext>>
where
    M: Mac + KeyInit + Send + 'static,
{
    let mac = <M as KeyInit>::new_from_slice(key)
        .map_err(|_| Error::CryptoError("invalid HMAC key".into()))?;
    Ok(Box::new(HmacContext(mac)))
}

struct CbcEncrypt<C: BlockEncryptMut + BlockCipher>(Encryptor<C>);

struct CbcDecrypt<C: BlockDecryptMut + BlockCipher>(Decryptor<C>);

impl<C> BlockCipherContext for CbcEncrypt<C>
where
    C: BlockEncryptMut + BlockCipher + Send,
{
    fn block_len(&self) -> usize {
        C::block_size()
    }

    fn process(&mut self, data: &mut [u8]) -> Result<()> {
        let bs = C::block_size();
        if data.len() % bs != 0 {
            return Err(Error::InvalidPadding);
        }
        for chunk in data.chunks_exact_mut(bs) {
            self.0.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }
        Ok(())
    }
}

impl<C> BlockCipherContext for CbcDecrypt<C>
where
    C: BlockDecryptMut + BlockCipher + Send,
{
    fn block_len(&self) -> usize {
        C::block_size()
    }

    fn process(&mut self, data: &mut [u8]) -> Result<()> {
        let bs = C::block_size();
        if data.len() % bs != 0 {
            return Err(Error::InvalidPadding);
        }
        for chunk in data.chunks_exact_mut(bs) {
            self.0.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }
        Ok(())
    }
}

fn cbc_context<C>(key: &[u8], iv: &[u8], direction: CipherDirection) -> Result<Box<dyn BlockCipherContext>>
where
    C: BlockEncryptMut + BlockDecryptMut + BlockCipher + KeyInit + Send + 'static,
{
    let key_err = |_| Error::CryptoError(format!("invalid key length {}", key.len()));
    let iv_err = |_| Error::CryptoError(format!("invalid IV length {}", iv.len()));

    match direction {
        CipherDirection::Encrypt => {
            let cipher = C::new_from_slice(key).map_err(key_err)?;
            let enc = Encryptor::<C>::inner_iv_slice_init(cipher, iv).map_err(iv_err)?;
            Ok(Box::new(CbcEncrypt(enc)))
        }
        CipherDirection::Decrypt => {
            let cipher = C::new_from_slice(key).map_err(key_err)?;
            let dec = Decryptor::<C>::inner_iv_slice_init(cipher, iv).map_err(iv_err)?;
            Ok(Box::new(CbcDecrypt(dec)))
        }
    }
}

impl CryptoProvider for SoftwareCrypto {
    fn digest(&self, primitive: DigestPrimitive, key: &[u8]) -> Result<Box<dyn DigestContext>> {
        match primitive {
            DigestPrimitive::HmacMd5 => hmac_context::<Hmac<Md5>>(key),
            DigestPrimitive::HmacSha1 => hmac_context::<Hmac<Sha1>>(key),
            DigestPrimitive::HmacSha256 => hmac_context::<Hmac<Sha256>>(key),
            DigestPrimitive::AesXcbc => Ok(Box::new(XcbcMac::new(key)?)),
        }
    }

    fn cipher(
        &self,
        primitive: CipherPrimitive,
        key: &[u8],
        iv: &[u8],
        direction: CipherDirection,
    ) -> Result<Box<dyn BlockCipherContext>> {
        match primitive {
            CipherPrimitive::Des => cbc_context::<Des>(key, iv, direction),
            CipherPrimitive::TripleDes => cbc_context::<TdesEde3>(key, iv, direction),
            CipherPrimitive::Aes => match key.len() {
                16 => cbc_context::<Aes128>(key, iv, direction),
                24 => cbc_context::<Aes192>(key, iv, direction),
                32 => cbc_context::<Aes256>(key, iv, direction),
                n => Err(Error::CryptoError(format!("invalid AES key length {}", n))),
            },
            CipherPrimitive::Blowfish => cbc_context::<Blowfish>(key, iv, direction),
            CipherPrimitive::Cast128 => cbc_context::<Cast5>(key, iv, direction),
            CipherPrimitive::Null => Err(Error::InvalidParameter(
                "NULL cipher has no cipher context".into(),
            )),
        }
    }

    fn random(&self, buf: &mut [u8]) {
        rand::thread_rng().fill_bytes(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hmac_hex(primitive: DigestPrimitive, key: &[u8], data: &[u8]) -> String {
        let mut ctx = SoftwareCrypto.digest(primitive, key).unwrap();
        ctx.update(data);
        hex::encode(ctx.finalize())
    }

    #[test]
    fn test_hmac_md5_rfc2104() {
        assert_eq!(
            hmac_hex(DigestPrimitive::HmacMd5, &[0x0b; 16], b"Hi There"),
            "9294727a3638bb1c13f48ef8158bfc9d"
        );
    }

    #[test]
    fn test_hmac_sha1_rfc2202() {
        assert_eq!(
            hmac_hex(DigestPrimitive::HmacSha1, &[0x0b; 20], b"Hi There"),
            "b617318655057264e28bc0b6fb378c8ef146be00"
        );
    }

    #[test]
    fn test_all_ciphers_roundtrip() {
        let cases: [(CipherPrimitive, usize, usize); 7] = [
            (CipherPrimitive::Des, 8, 8),
            (CipherPrimitive::TripleDes, 24, 8),
            (CipherPrimitive::Aes, 16, 16),
            (CipherPrimitive::Aes, 24, 16),
            (CipherPrimitive::Aes, 32, 16),
            (CipherPrimitive::Blowfish, 16, 8),
            (CipherPrimitive::Cast128, 16, 8),
        ];

        for (primitive, key_len, block) in cases {
            let key: Vec<u8> = (0..key_len as u8).map(|b| b.wrapping_mul(7) ^ 0x5a).collect();
            let iv = vec![0x42u8; block];
            let plain: Vec<u8> = (0..(block * 4) as u8).collect();

            let mut data = plain.clone();
            let mut enc = SoftwareCrypto
                .cipher(primitive, &key, &iv, CipherDirection::Encrypt)
                .unwrap();
            assert_eq!(enc.block_len(), block);
            enc.process(&mut data).unwrap();
            assert_ne!(data, plain, "{:?}", primitive);

            let mut dec = SoftwareCrypto
                .cipher(primitive, &key, &iv, CipherDirection::Decrypt)
                .unwrap();
            dec.process(&mut data).unwrap();
            assert_eq!(data, plain, "{:?}", primitive);
        }
    }

    #[test]
    fn test_streaming_cbc_equals_one_shot() {
        let key = [9u8; 16];
        let iv = [1u8; 16];
        let mut one = vec![0xabu8; 64];
        let mut two = one.clone();

        SoftwareCrypto
            .cipher(CipherPrimitive::Aes, &key, &iv, CipherDirection::Encrypt)
            .unwrap()
            .process(&mut one)
            .unwrap();

        let mut ctx = SoftwareCrypto
            .cipher(CipherPrimitive::Aes, &key, &iv, CipherDirection::Encrypt)
            .unwrap();
        let (a, b) = two.split_at_mut(16);
        ctx.process(a).unwrap();
        ctx.process(b).unwrap();

        assert_eq!(one, two);
    }

    #[test]
    fn test_invalid_key_lengths() {
        assert!(SoftwareCrypto
            .cipher(CipherPrimitive::Aes, &[0u8; 10], &[0u8; 16], CipherDirection::Encrypt)
            .is_err());
        assert!(SoftwareCrypto
            .cipher(CipherPrimitive::Des, &[0u8; 8], &[0u8; 4], CipherDirection::Encrypt)
            .is_err());
        assert!(SoftwareCrypto
            .cipher(CipherPrimitive::Null, &[], &[], CipherDirection::Encrypt)
            .is_err());
    }

    #[test]
    fn test_random_fills() {
        let mut buf = [0u8; 32];
        SoftwareCrypto.random(&mut buf);
        assert!(buf.iter().any(|b| *b != 0));
    }
}
