//! AES-XCBC-MAC (RFC 3566)
//!
//! ```text
//! K1 = E(K, 0x01..01)   CBC-MAC key
//! K2 = E(K, 0x02..02)   xor'd into a complete final block
//! K3 = E(K, 0x03..03)   xor'd into a padded (10*) final block
//! ```

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes128, Block};
use zeroize::Zeroize;

use super::DigestContext;
use crate::ipsec::{Error, Result};

const BLOCK: usize = 16;

/// Streaming AES-XCBC-MAC state
pub struct XcbcMac {
    k1: Aes128,
    k2: [u8; BLOCK],
    k3: [u8; BLOCK],
    state: [u8; BLOCK],
    pending: [u8; BLOCK],
    pending_len: usize,
}

impl XcbcMac {
    /// Derive the three subkeys from a 128-bit key
    pub fn new(key: &[u8]) -> Result<Self> {
        let base = Aes128::new_from_slice(key)
            .map_err(|_| Error::CryptoError("AES-XCBC requires a 16-byte key".into()))?;

        let derive = |fill: u8| {
            let mut block = Block::clone_from_slice(&[fill; BLOCK]);
            base.encrypt_block(&mut block);
            let mut out = [0u8; BLOCK];
            out.copy_from_slice(&block);
            out
        };

        let mut k1 = derive(0x01);
        let k1_cipher = Aes128::new_from_slice(&k1)
            .map_err(|_| Error::CryptoError("AES-XCBC subkey".into()))?;
        k1.zeroize();

        Ok(Self {
            k1: k1_cipher,
            k2: derive(0x02),
            k3: derive(0x03),
            state: [0; BLOCK],
            pending: [0; BLOCK],
            pending_len: 0,
        })
    }

    fn absorb(&mut self, block: &[u8; BLOCK]) {
        for (s, b) in self.state.iter_mut().zip(block.iter()) {
            *s ^= b;
        }
        let mut b = Block::clone_from_slice(&self.state);
        self.k1.encrypt_block(&mut b);
        self.state.copy_from_slice(&b);
    }
}

impl DigestContext for XcbcMac {
    fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            // a full pending block is only absorbed once more data proves
            // it is not the final one
            if self.pending_len == BLOCK {
                let block = self.pending;
                self.absorb(&block);
                self.pending_len = 0;
            }
            let n = (BLOCK - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + n].copy_from_slice(&data[..n]);
            self.pending_len += n;
            data = &data[n..];
        }
    }

    fn finalize(mut self: Box<Self>) -> Vec<u8> {
        let mut last = [0u8; BLOCK];
        if self.pending_len == BLOCK {
            for i in 0..BLOCK {
                last[i] = self.pending[i] ^ self.k2[i];
            }
        } else {
            last[..self.pending_len].copy_from_slice(&self.pending[..self.pending_len]);
            last[self.pending_len] = 0x80;
            for i in 0..BLOCK {
                last[i] ^= self.k3[i];
            }
        }
        self.absorb(&last);
        let mac = self.state.to_vec();
        self.k2.zeroize();
        self.k3.zeroize();
        mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(key: &[u8], parts: &[&[u8]]) -> String {
        let mut ctx = Box::new(XcbcMac::new(key).unwrap());
        for part in parts {
            ctx.update(part);
        }
        hex::encode(ctx.finalize())
    }

    fn key() -> Vec<u8> {
        (0u8..16).collect()
    }

    #[test]
    fn test_rfc3566_empty_message() {
        assert_eq!(mac(&key(), &[]), "75f0251d528ac01c4573dfd584d79f29");
    }

    #[test]
    fn test_rfc3566_single_block() {
        let msg: Vec<u8> = (0u8..16).collect();
        assert_eq!(mac(&key(), &[&msg]), "d2a246fa349b68a79998a4394ff7a263");
    }

    #[test]
    fn test_streaming_split_is_irrelevant() {
        let msg: Vec<u8> = (0u8..40).collect();
        let whole = mac(&key(), &[&msg]);
        let split = mac(&key(), &[&msg[..5], &msg[5..16], &msg[16..33], &msg[33..]]);
        assert_eq!(whole, split);
    }

    #[test]
    fn test_bad_key_length() {
        assert!(XcbcMac::new(&[0u8; 15]).is_err());
    }
}
