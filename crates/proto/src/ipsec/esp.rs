//! ESP (Encapsulating Security Payload) Protocol
//!
//! Implements RFC 4303 - IP Encapsulating Security Payload (ESP) with CBC
//! ciphers and a separate integrity algorithm.
//!
//! # ESP Packet Format (RFC 4303)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ ----
//! |               Security Parameters Index (SPI)                 | ^Auth
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ |Cov-
//! |                      Sequence Number                          | |erage
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ | ----
//! |                    IV (cipher block size)                     | |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ |
//! |                    Payload Data (variable)                    | |  ^
//! ~                                                               ~ |  |
//! |                                                               | |Conf.
//! +               +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ |Cov-
//! |               |     Padding (0-255 bytes)                     | |erage
//! +-+-+-+-+-+-+-+-+               +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ |  |
//! |                               |  Pad Length   | Next Header   | v  v
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ ----
//! |         Integrity Check Value-ICV   (variable)                |
//! ~                                                               ~
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The transform works in place on a [`BufferChain`]: the header is
//! spliced in after the IP headers, the trailer appended, and the cipher
//! runs across segment boundaries.

use subtle::ConstantTimeEq;

use super::{
    buffer::BufferChain,
    crypto::{
        calculate_digest, cipher_operation, AuthAlgorithm, CipherDirection, CryptoProvider,
        DigestInput, EncryptAlgorithm,
    },
    ip::{self, IPPROTO_ESP},
    replay::{ReplayCheck, ReplayWindow, SequenceNumber},
    Error, Result,
};

/// SPI and sequence number
pub const ESP_HEADER_LEN: usize = 8;

/// Pad length and next header
pub const ESP_TRAILER_LEN: usize = 2;

/// Keying for one ESP SA
#[derive(Debug, Clone, Copy)]
pub struct EspTransform<'a> {
    /// Cipher
    pub encryption: EncryptAlgorithm,
    /// Cipher key
    pub encryption_key: &'a [u8],
    /// Integrity algorithm, if any
    pub auth: Option<AuthAlgorithm>,
    /// Integrity key
    pub auth_key: &'a [u8],
}

impl EspTransform<'_> {
    fn icv_len(&self) -> usize {
        self.auth.map_or(0, |a| a.digest_len())
    }
}

/// Result of a successful ESP decode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EspDecoded {
    /// SPI of the removed header
    pub spi: u32,
    /// Full 64-bit sequence number
    pub seq: u64,
    /// Protocol of the decrypted payload
    pub next_header: u8,
}

/// Calculate ESP padding length
///
/// # Arguments
///
/// * `payload_len` - Length of the protected payload
/// * `block_size` - Cipher block size (4-byte alignment for NULL)
///
/// # Formula
///
/// ```text
/// (payload_len + pad_len + 2) % block_size == 0
/// ```
pub fn calculate_padding(payload_len: usize, block_size: usize) -> usize {
    let remainder = (payload_len + ESP_TRAILER_LEN) % block_size;
    if remainder == 0 {
        0
    } else {
        block_size - remainder
    }
}

/// Read the SPI of the ESP header following the IP headers
pub fn peek_spi(chain: &BufferChain, header: &ip::IpHeader) -> Result<u32> {
    chain.read_u32(header.header_len)
}

/// Encrypt the payload of an IP packet and wrap it in ESP
///
/// # Arguments
///
/// * `provider` - Crypto provider, also the IV source
/// * `chain` - IP packet, modified in place
/// * `spi` - SPI of the outbound SA
/// * `seq` - Sequence number assigned to this packet
/// * `transform` - Algorithms and keys
///
/// # Errors
///
/// Returns an error if the packet cannot be parsed, a key does not fit its
/// algorithm, or the result exceeds the IP length field.
pub fn encode_esp(
    provider: &dyn CryptoProvider,
    chain: &mut BufferChain,
    spi: u32,
    seq: SequenceNumber,
    transform: &EspTransform<'_>,
) -> Result<()> {
    let header = ip::parse(chain)?;
    chain.truncate(header.total_len);

    let entry = transform.encryption.entry();
    let payload_len = header.payload_len();
    let pad_len = calculate_padding(payload_len, entry.block_len);

    let mut trailer: Vec<u8> = (1..=pad_len as u8).collect();
    trailer.push(pad_len as u8);
    trailer.push(header.next_header);
    chain.append(&trailer);

    let mut esp = vec![0u8; ESP_HEADER_LEN + entry.iv_len];
    esp[0..4].copy_from_slice(&spi.to_be_bytes());
    esp[4..8].copy_from_slice(&seq.low.to_be_bytes());
    provider.random(&mut esp[ESP_HEADER_LEN..]);
    let iv = esp[ESP_HEADER_LEN..].to_vec();

    let at = header.header_len;
    chain.insert(at, &esp)?;

    let cipher_start = at + esp.len();
    let cipher_len = payload_len + pad_len + ESP_TRAILER_LEN;
    cipher_operation(
        provider,
        transform.encryption,
        transform.encryption_key,
        &iv,
        CipherDirection::Encrypt,
        chain,
        cipher_start,
        cipher_len,
    )?;

    if let Some(auth) = transform.auth {
        let high = seq.high.to_be_bytes();
        let esn_trailer: &[u8] = if seq.esn { &high } else { &[] };
        let icv = calculate_digest(
            provider,
            auth,
            transform.auth_key,
            chain,
            DigestInput {
                offset: at,
                len: chain.len() - at,
                trailer: esn_trailer,
            },
        )?;
        chain.append(&icv);
    }

    ip::set_next_header(chain, &header, IPPROTO_ESP)?;
    ip::set_total_len(chain, header.family, chain.len())?;
    ip::update_checksum(chain)
}

/// Verify, decrypt and remove ESP
///
/// The sequence number is checked against `window` first, then the ICV is
/// verified before any decryption happens. The window is advanced only
/// for packets that pass every check.
///
/// # Errors
///
/// - `Error::ReplayDetected` for a replayed or too old sequence number
/// - `Error::InvalidDigest` if the ICV does not match
/// - `Error::InvalidLength` if the ciphertext is not block aligned
/// - `Error::InvalidPadding` if the decrypted padding is malformed
pub fn decode_esp(
    provider: &dyn CryptoProvider,
    chain: &mut BufferChain,
    transform: &EspTransform<'_>,
    window: &mut ReplayWindow,
) -> Result<EspDecoded> {
    let header = ip::parse(chain)?;
    if header.next_header != IPPROTO_ESP {
        return Err(Error::Malformed("not an ESP packet".into()));
    }
    chain.truncate(header.total_len);

    let entry = transform.encryption.entry();
    let at = header.header_len;
    let icv_len = transform.icv_len();
    let overhead = ESP_HEADER_LEN + entry.iv_len + icv_len;
    let min_len = overhead + entry.block_len;
    if header.payload_len() < min_len {
        return Err(Error::BufferTooShort {
            required: at + min_len,
            available: header.total_len,
        });
    }
    let cipher_len = header.payload_len() - overhead;
    if cipher_len % entry.block_len != 0 {
        return Err(Error::InvalidLength {
            expected: cipher_len - cipher_len % entry.block_len,
            actual: cipher_len,
        });
    }

    let spi = chain.read_u32(at)?;
    let seq_low = chain.read_u32(at + 4)?;
    let high = match window.check(seq_low) {
        ReplayCheck::Accept(high) => high,
        ReplayCheck::Reject => return Err(Error::ReplayDetected(seq_low as u64)),
    };

    let icv_start = header.total_len - icv_len;
    if let Some(auth) = transform.auth {
        let high_bytes = high.to_be_bytes();
        let esn_trailer: &[u8] = if window.is_esn() { &high_bytes } else { &[] };
        let computed = calculate_digest(
            provider,
            auth,
            transform.auth_key,
            chain,
            DigestInput {
                offset: at,
                len: icv_start - at,
                trailer: esn_trailer,
            },
        )?;
        let received = chain.copy_range(icv_start, icv_len)?;
        if !bool::from(computed.ct_eq(&received)) {
            return Err(Error::InvalidDigest);
        }
    }

    let iv = chain.copy_range(at + ESP_HEADER_LEN, entry.iv_len)?;
    let cipher_start = at + ESP_HEADER_LEN + entry.iv_len;
    cipher_operation(
        provider,
        transform.encryption,
        transform.encryption_key,
        &iv,
        CipherDirection::Decrypt,
        chain,
        cipher_start,
        cipher_len,
    )?;

    let pad_len = chain.read_u8(icv_start - 2)? as usize;
    let next_header = chain.read_u8(icv_start - 1)?;
    if pad_len + ESP_TRAILER_LEN > cipher_len {
        return Err(Error::InvalidPadding);
    }
    let pad_start = icv_start - ESP_TRAILER_LEN - pad_len;
    let padding = chain.copy_range(pad_start, pad_len)?;
    if padding
        .iter()
        .enumerate()
        .any(|(i, &b)| b as usize != i + 1)
    {
        return Err(Error::InvalidPadding);
    }

    let seq = ((high as u64) << 32) | seq_low as u64;
    window.update(seq);

    chain.truncate(pad_start);
    chain.remove(at, ESP_HEADER_LEN + entry.iv_len)?;
    ip::set_next_header(chain, &header, next_header)?;
    ip::set_total_len(chain, header.family, chain.len())?;
    ip::update_checksum(chain)?;

    Ok(EspDecoded {
        spi,
        seq,
        next_header,
    })
}
