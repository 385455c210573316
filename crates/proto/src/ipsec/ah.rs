//! AH (Authentication Header) Protocol
//!
//! Implements RFC 4302 - IP Authentication Header, in transport form. Tunnel
//! mode is the same transform applied to an outer header built by
//! [`packet`](super::packet).
//!
//! # AH Header Format (RFC 4302)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | Next Header   |  Payload Len  |          RESERVED             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 Security Parameters Index (SPI)               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Sequence Number Field                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! +                Integrity Check Value-ICV (variable)           |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The ICV covers the whole IP packet with mutable header fields and the
//! ICV itself set to zero. With ESN the high-order 32 bits of the sequence
//! number are appended to the digest input but never sent.

use subtle::ConstantTimeEq;

use super::{
    buffer::BufferChain,
    crypto::{calculate_digest, AuthAlgorithm, CryptoProvider, DigestInput},
    ip::{self, IPPROTO_AH},
    replay::{ReplayCheck, ReplayWindow, SequenceNumber},
    selector::IpFamily,
    Error, Result,
};

/// Fixed part of the AH header (before the ICV)
pub const AH_FIXED_LEN: usize = 12;

/// Keying for one AH SA
#[derive(Debug, Clone, Copy)]
pub struct AhTransform<'a> {
    /// Integrity algorithm
    pub auth: AuthAlgorithm,
    /// Integrity key
    pub key: &'a [u8],
}

/// Total AH header length including ICV padding
///
/// IPv4 requires a multiple of 4 bytes, IPv6 a multiple of 8.
pub fn header_len(auth: AuthAlgorithm, family: IpFamily) -> usize {
    let align = match family {
        IpFamily::V4 => 4,
        IpFamily::V6 => 8,
    };
    let raw = AH_FIXED_LEN + auth.digest_len();
    (raw + align - 1) / align * align
}

/// Result of a successful AH decode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AhDecoded {
    /// SPI of the removed header
    pub spi: u32,
    /// Full 64-bit sequence number
    pub seq: u64,
    /// Protocol that followed the AH header
    pub next_header: u8,
}

/// Read the SPI of the AH header following the IP headers
pub fn peek_spi(chain: &BufferChain, header: &ip::IpHeader) -> Result<u32> {
    chain.read_u32(header.header_len + 4)
}

/// Insert and fill an AH header
///
/// # Arguments
///
/// * `provider` - Crypto provider
/// * `chain` - IP packet, modified in place
/// * `spi` - SPI of the outbound SA
/// * `seq` - Sequence number assigned to this packet
/// * `transform` - Integrity algorithm and key
///
/// # Errors
///
/// Returns an error if the packet cannot be parsed or the key does not
/// fit the algorithm.
pub fn encode_ah(
    provider: &dyn CryptoProvider,
    chain: &mut BufferChain,
    spi: u32,
    seq: SequenceNumber,
    transform: &AhTransform<'_>,
) -> Result<()> {
    let header = ip::parse(chain)?;
    chain.truncate(header.total_len);

    let ah_len = header_len(transform.auth, header.family);
    let mut ah = vec![0u8; ah_len];
    ah[0] = header.next_header;
    ah[1] = (ah_len / 4 - 2) as u8;
    ah[4..8].copy_from_slice(&spi.to_be_bytes());
    ah[8..12].copy_from_slice(&seq.low.to_be_bytes());

    let at = header.header_len;
    chain.insert(at, &ah)?;
    ip::set_next_header(chain, &header, IPPROTO_AH)?;
    ip::set_total_len(chain, header.family, header.total_len + ah_len)?;

    let high = seq.high.to_be_bytes();
    let trailer: &[u8] = if seq.esn { &high } else { &[] };

    let saved = ip::zero_mutable(chain, header.family)?;
    let icv = calculate_digest(
        provider,
        transform.auth,
        transform.key,
        chain,
        DigestInput {
            offset: 0,
            len: chain.len(),
            trailer,
        },
    );
    ip::restore_mutable(chain, &saved)?;
    chain.write_at(at + AH_FIXED_LEN, &icv?)?;
    ip::update_checksum(chain)
}

/// Verify and remove an AH header
///
/// The sequence number is checked against `window` before the digest is
/// computed; the window is only advanced once the digest matched.
///
/// # Errors
///
/// - `Error::ReplayDetected` for a replayed or too old sequence number
/// - `Error::InvalidDigest` if the ICV does not match
/// - `Error::InvalidLength` / `Error::Malformed` for structural problems
pub fn decode_ah(
    provider: &dyn CryptoProvider,
    chain: &mut BufferChain,
    transform: &AhTransform<'_>,
    window: &mut ReplayWindow,
) -> Result<AhDecoded> {
    let header = ip::parse(chain)?;
    if header.next_header != IPPROTO_AH {
        return Err(Error::Malformed("not an AH packet".into()));
    }
    chain.truncate(header.total_len);

    let at = header.header_len;
    if header.payload_len() < AH_FIXED_LEN {
        return Err(Error::BufferTooShort {
            required: at + AH_FIXED_LEN,
            available: header.total_len,
        });
    }
    let next_header = chain.read_u8(at)?;
    let ah_len = (chain.read_u8(at + 1)? as usize + 2) * 4;
    let expected = header_len(transform.auth, header.family);
    if ah_len != expected {
        return Err(Error::InvalidLength {
            expected,
            actual: ah_len,
        });
    }
    if ah_len > header.payload_len() {
        return Err(Error::Malformed("AH header overruns packet".into()));
    }
    let spi = chain.read_u32(at + 4)?;
    let seq_low = chain.read_u32(at + 8)?;

    let high = match window.check(seq_low) {
        ReplayCheck::Accept(high) => high,
        ReplayCheck::Reject => return Err(Error::ReplayDetected(seq_low as u64)),
    };

    let digest_len = transform.auth.digest_len();
    let received = chain.copy_range(at + AH_FIXED_LEN, digest_len)?;
    chain.write_at(at + AH_FIXED_LEN, &vec![0u8; ah_len - AH_FIXED_LEN])?;

    let high_bytes = high.to_be_bytes();
    let trailer: &[u8] = if window.is_esn() { &high_bytes } else { &[] };

    let saved = ip::zero_mutable(chain, header.family)?;
    let computed = calculate_digest(
        provider,
        transform.auth,
        transform.key,
        chain,
        DigestInput {
            offset: 0,
            len: chain.len(),
            trailer,
        },
    );
    ip::restore_mutable(chain, &saved)?;
    let computed = computed?;

    if !bool::from(computed.ct_eq(&received)) {
        return Err(Error::InvalidDigest);
    }

    let seq = ((high as u64) << 32) | seq_low as u64;
    window.update(seq);

    chain.remove(at, ah_len)?;
    ip::set_next_header(chain, &header, next_header)?;
    ip::set_total_len(chain, header.family, header.total_len - ah_len)?;
    ip::update_checksum(chain)?;

    Ok(AhDecoded {
        spi,
        seq,
        next_header,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::{
        crypto::SoftwareCrypto,
        ip::tests::{udp_v4, udp_v6_hbh},
        ip::{IPPROTO_UDP, IPV4_HEADER_LEN},
    };

    const KEY: [u8; 20] = [0x42; 20];

    fn transform() -> AhTransform<'static> {
        AhTransform {
            auth: AuthAlgorithm::HmacSha1,
            key: &KEY,
        }
    }

    #[test]
    fn test_header_len_alignment() {
        assert_eq!(header_len(AuthAlgorithm::HmacSha1, IpFamily::V4), 24);
        assert_eq!(header_len(AuthAlgorithm::HmacSha256, IpFamily::V4), 28);
        assert_eq!(header_len(AuthAlgorithm::HmacSha256, IpFamily::V6), 32);
    }

    #[test]
    fn test_round_trip_v4() {
        let provider = SoftwareCrypto;
        let original = udp_v4([10, 0, 0, 1], [10, 0, 0, 2], b"authenticated payload");
        let mut chain = BufferChain::segmented(&original, 9);

        encode_ah(&provider, &mut chain, 0x1234, SequenceNumber::from_u64(1, false), &transform())
            .unwrap();
        let wire = chain.to_vec();
        assert_eq!(wire.len(), original.len() + 24);
        assert_eq!(wire[9], IPPROTO_AH);
        assert_eq!(wire[IPV4_HEADER_LEN], IPPROTO_UDP);
        assert_eq!(ip::checksum(&wire[..IPV4_HEADER_LEN]), 0);

        // TTL changes in transit are not covered
        let mut received = BufferChain::segmented(&wire, 13);
        received.write_u8(8, 3).unwrap();
        ip::update_checksum(&mut received).unwrap();

        let mut window = ReplayWindow::new(1, false);
        let decoded = decode_ah(&provider, &mut received, &transform(), &mut window).unwrap();
        assert_eq!(decoded.spi, 0x1234);
        assert_eq!(decoded.seq, 1);
        assert_eq!(decoded.next_header, IPPROTO_UDP);

        let out = received.to_vec();
        assert_eq!(out.len(), original.len());
        assert_eq!(&out[IPV4_HEADER_LEN..], &original[IPV4_HEADER_LEN..]);
        assert_eq!(out[9], IPPROTO_UDP);
        assert_eq!(out[8], 3);
    }

    #[test]
    fn test_round_trip_v6_with_esn() {
        let provider = SoftwareCrypto;
        let original = udp_v6_hbh(b"v6 payload");
        let mut chain = BufferChain::from_slice(&original);
        let seq = SequenceNumber::from_u64((1u64 << 32) + 5, true);
        let t = AhTransform {
            auth: AuthAlgorithm::HmacSha256,
            key: &[7u8; 32],
        };
        encode_ah(&provider, &mut chain, 0x500, seq, &t).unwrap();
        assert_eq!(chain.len(), original.len() + 32);

        let mut window = ReplayWindow::new(1, true);
        window.update((1u64 << 32) + 1);
        let decoded = decode_ah(&provider, &mut chain, &t, &mut window).unwrap();
        assert_eq!(decoded.seq, (1u64 << 32) + 5);
        assert_eq!(chain.to_vec(), original);
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let provider = SoftwareCrypto;
        let original = udp_v4([10, 0, 0, 1], [10, 0, 0, 2], b"payload");
        let mut chain = BufferChain::from_slice(&original);
        encode_ah(&provider, &mut chain, 1, SequenceNumber::from_u64(1, false), &transform())
            .unwrap();

        let last = chain.len() - 1;
        let byte = chain.read_u8(last).unwrap();
        chain.write_u8(last, byte ^ 0xFF).unwrap();

        let mut window = ReplayWindow::new(1, false);
        assert_eq!(
            decode_ah(&provider, &mut chain, &transform(), &mut window),
            Err(Error::InvalidDigest)
        );
        // a failed digest must not advance the window
        assert_eq!(window.last_seq().as_u64(), 0);
    }

    #[test]
    fn test_replay_rejected() {
        let provider = SoftwareCrypto;
        let original = udp_v4([10, 0, 0, 1], [10, 0, 0, 2], b"payload");
        let mut chain = BufferChain::from_slice(&original);
        encode_ah(&provider, &mut chain, 1, SequenceNumber::from_u64(9, false), &transform())
            .unwrap();
        let wire = chain.to_vec();

        let mut window = ReplayWindow::new(1, false);
        let mut first = BufferChain::from_slice(&wire);
        assert!(decode_ah(&provider, &mut first, &transform(), &mut window).is_ok());

        let mut again = BufferChain::from_slice(&wire);
        assert_eq!(
            decode_ah(&provider, &mut again, &transform(), &mut window),
            Err(Error::ReplayDetected(9))
        );
    }

    #[test]
    fn test_bad_length_field() {
        let provider = SoftwareCrypto;
        let original = udp_v4([10, 0, 0, 1], [10, 0, 0, 2], b"payload");
        let mut chain = BufferChain::from_slice(&original);
        encode_ah(&provider, &mut chain, 1, SequenceNumber::from_u64(1, false), &transform())
            .unwrap();
        chain.write_u8(IPV4_HEADER_LEN + 1, 9).unwrap();

        let mut window = ReplayWindow::new(1, false);
        assert!(matches!(
            decode_ah(&provider, &mut chain, &transform(), &mut window),
            Err(Error::InvalidLength { .. })
        ));
    }
}
