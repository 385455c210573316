//! ISAKMP message header
//!
//! Implements the fixed header defined in RFC 2408 Section 3.1. Parsing is
//! the first line of defence for the daemon: every field is validated
//! before the message is looked at any further.

use super::constants::*;
use crate::ipsec::{Error, Result};

/// ISAKMP header (28 bytes)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          Initiator                            |
/// |                            Cookie                             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          Responder                            |
/// |                            Cookie                             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Next Payload | MjVer | MnVer | Exchange Type |     Flags     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          Message ID                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                            Length                             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsakmpHeader {
    /// Cookie chosen by the initiator of the ISAKMP SA
    pub initiator_cookie: [u8; COOKIE_LEN],

    /// Cookie chosen by the responder, zero in the first message
    pub responder_cookie: [u8; COOKIE_LEN],

    /// Type of the first payload
    pub next_payload: PayloadType,

    /// Exchange type
    pub exchange_type: ExchangeType,

    /// Header flags
    pub flags: u8,

    /// Message ID, zero during phase 1
    pub message_id: u32,

    /// Total message length including the header
    pub length: u32,
}

impl IsakmpHeader {
    /// Create a header; the length is filled in when the message is built
    pub fn new(
        initiator_cookie: [u8; COOKIE_LEN],
        responder_cookie: [u8; COOKIE_LEN],
        exchange_type: ExchangeType,
        message_id: u32,
    ) -> Self {
        IsakmpHeader {
            initiator_cookie,
            responder_cookie,
            next_payload: PayloadType::None,
            exchange_type,
            flags: 0,
            message_id,
            length: ISAKMP_HEADER_LEN as u32,
        }
    }

    /// Parse and validate a header
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The buffer is shorter than the header or the length field
    /// - The initiator cookie is zero
    /// - The version, exchange type, payload type or flags are not supported
    /// - The message ID does not fit the exchange type
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < ISAKMP_HEADER_LEN {
            return Err(Error::BufferTooShort {
                required: ISAKMP_HEADER_LEN,
                available: data.len(),
            });
        }

        let mut initiator_cookie = [0u8; COOKIE_LEN];
        let mut responder_cookie = [0u8; COOKIE_LEN];
        initiator_cookie.copy_from_slice(&data[0..8]);
        responder_cookie.copy_from_slice(&data[8..16]);
        if initiator_cookie == [0u8; COOKIE_LEN] {
            return Err(Error::InvalidCookie);
        }

        let next_payload = PayloadType::from_u8(data[16])
            .ok_or_else(|| Error::InvalidPayload(format!("unknown payload type {}", data[16])))?;

        let major = data[17] >> 4;
        let minor = data[17] & 0x0F;
        if major != MAJOR_VERSION {
            return Err(Error::InvalidMajorVersion(major));
        }
        if minor > MINOR_VERSION {
            return Err(Error::InvalidMinorVersion(minor));
        }

        let exchange_type =
            ExchangeType::from_u8(data[18]).ok_or(Error::InvalidExchangeType(data[18]))?;

        let flags = data[19];
        let message_id = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);
        if flags & !flags::ALL != 0 || flags & flags::AUTH_ONLY != 0 {
            return Err(Error::InvalidFlags(flags));
        }
        if flags & flags::COMMIT != 0 && message_id == 0 {
            return Err(Error::InvalidFlags(flags));
        }

        match exchange_type {
            ExchangeType::Main | ExchangeType::Aggressive if message_id != 0 => {
                return Err(Error::InvalidMessageId(message_id));
            }
            ExchangeType::Quick if message_id == 0 => {
                return Err(Error::InvalidMessageId(message_id));
            }
            _ => {}
        }

        let length = u32::from_be_bytes([data[24], data[25], data[26], data[27]]);
        if (length as usize) < ISAKMP_HEADER_LEN
            || length as usize > MAX_MESSAGE_LEN
            || length as usize > data.len()
        {
            return Err(Error::InvalidLength {
                expected: data.len(),
                actual: length as usize,
            });
        }

        Ok(IsakmpHeader {
            initiator_cookie,
            responder_cookie,
            next_payload,
            exchange_type,
            flags,
            message_id,
            length,
        })
    }

    /// Serialize the header
    pub fn to_bytes(&self) -> [u8; ISAKMP_HEADER_LEN] {
        let mut bytes = [0u8; ISAKMP_HEADER_LEN];
        bytes[0..8].copy_from_slice(&self.initiator_cookie);
        bytes[8..16].copy_from_slice(&self.responder_cookie);
        bytes[16] = self.next_payload.to_u8();
        bytes[17] = (MAJOR_VERSION << 4) | MINOR_VERSION;
        bytes[18] = self.exchange_type.to_u8();
        bytes[19] = self.flags;
        bytes[20..24].copy_from_slice(&self.message_id.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }

    /// Whether the payloads are encrypted
    pub fn is_encrypted(&self) -> bool {
        self.flags & flags::ENCRYPTION != 0
    }

    /// Whether the responder cookie is still unset
    pub fn responder_cookie_unset(&self) -> bool {
        self.responder_cookie == [0u8; COOKIE_LEN]
    }
}
