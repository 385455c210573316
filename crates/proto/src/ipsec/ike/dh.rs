//! Oakley Diffie-Hellman groups (RFC 2409 Section 6, RFC 3526)
//!
//! Used for the phase 1 key exchange and for perfect forward secrecy in
//! quick mode. Private exponents are drawn from the crypto provider and
//! wiped on drop.

use num_bigint::BigUint;
use once_cell::sync::Lazy;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::ipsec::crypto::CryptoProvider;
use crate::ipsec::{Error, Result};

/// Second Oakley group, 1024-bit MODP
static MODP_1024: Lazy<BigUint> = Lazy::new(|| {
    parse_prime(
        "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
         29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
         EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
         E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
         EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381\
         FFFFFFFFFFFFFFFF",
    )
});

/// Group 14, 2048-bit MODP
static MODP_2048: Lazy<BigUint> = Lazy::new(|| {
    parse_prime(
        "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
         29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
         EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
         E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
         EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
         C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
         83655D23DCA3AD961C62F356208552BB9ED529077096966D\
         670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
         E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
         DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
         15728E5A8AACAA68FFFFFFFFFFFFFFFF",
    )
});

fn parse_prime(hex_digits: &str) -> BigUint {
    // the literals above are well-formed hex
    BigUint::parse_bytes(hex_digits.as_bytes(), 16).unwrap_or_default()
}

/// Diffie-Hellman group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DhGroup {
    /// Oakley group 2
    Modp1024,
    /// Group 14
    Modp2048,
}

impl DhGroup {
    /// Group description value carried in SA attributes
    pub fn id(self) -> u16 {
        match self {
            DhGroup::Modp1024 => 2,
            DhGroup::Modp2048 => 14,
        }
    }

    /// Group from its description value
    pub fn from_id(id: u16) -> Result<Self> {
        match id {
            2 => Ok(DhGroup::Modp1024),
            14 => Ok(DhGroup::Modp2048),
            _ => Err(Error::InvalidParameter(format!(
                "Diffie-Hellman group {} not supported",
                id
            ))),
        }
    }

    /// Length of public values and shared secrets in bytes
    pub fn len(self) -> usize {
        match self {
            DhGroup::Modp1024 => 128,
            DhGroup::Modp2048 => 256,
        }
    }

    fn prime(self) -> &'static BigUint {
        match self {
            DhGroup::Modp1024 => &MODP_1024,
            DhGroup::Modp2048 => &MODP_2048,
        }
    }
}

/// Ephemeral key pair of one exchange
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DhKeyPair {
    #[zeroize(skip)]
    group: DhGroup,
    private_key: Vec<u8>,
    public_key: Vec<u8>,
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("group", &self.group)
            .field("public_key", &hex::encode(&self.public_key))
            .finish()
    }
}

impl DhKeyPair {
    /// Generate a key pair
    pub fn generate(group: DhGroup, provider: &dyn CryptoProvider) -> Self {
        let p = group.prime();
        let two = BigUint::from(2u32);

        // x in [2, p - 2]
        let mut random = vec![0u8; group.len()];
        provider.random(&mut random);
        let x = BigUint::from_bytes_be(&random) % (p - 3u32) + &two;
        random.zeroize();

        let y = two.modpow(&x, p);
        DhKeyPair {
            group,
            private_key: x.to_bytes_be(),
            public_key: pad(&y, group.len()),
        }
    }

    /// Group of the key pair
    pub fn group(&self) -> DhGroup {
        self.group
    }

    /// Public value g^x mod p, padded to the group length
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Compute the shared secret g^xy mod p
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidPayload` if the peer's value has the wrong
    /// length or lies outside (1, p - 1).
    pub fn compute_shared(&self, peer_public: &[u8]) -> Result<Vec<u8>> {
        if peer_public.len() != self.group.len() {
            return Err(Error::InvalidPayload(format!(
                "key exchange data of {} bytes, expected {}",
                peer_public.len(),
                self.group.len()
            )));
        }
        let p = self.group.prime();
        let y = BigUint::from_bytes_be(peer_public);
        if y <= BigUint::from(1u32) || y >= p - 1u32 {
            return Err(Error::InvalidPayload("invalid Diffie-Hellman public value".into()));
        }
        let x = BigUint::from_bytes_be(&self.private_key);
        Ok(pad(&y.modpow(&x, p), self.group.len()))
    }
}

fn pad(value: &BigUint, len: usize) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    let mut out = vec![0u8; len.saturating_sub(bytes.len())];
    out.extend_from_slice(&bytes);
    out
}
