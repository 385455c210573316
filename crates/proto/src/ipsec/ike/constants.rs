//! ISAKMP / IKEv1 protocol constants (RFC 2407, RFC 2408, RFC 2409)

/// UDP port of the key exchange daemon
pub const IKE_PORT: u16 = 500;

/// ISAKMP major version
pub const MAJOR_VERSION: u8 = 1;

/// ISAKMP minor version
pub const MINOR_VERSION: u8 = 0;

/// ISAKMP header size (28 bytes)
pub const ISAKMP_HEADER_LEN: usize = 28;

/// Generic payload header size
pub const GENERIC_HEADER_LEN: usize = 4;

/// Largest ISAKMP message accepted
pub const MAX_MESSAGE_LEN: usize = 65_535;

/// Cookie length
pub const COOKIE_LEN: usize = 8;

/// IPsec DOI (RFC 2407)
pub const DOI_IPSEC: u32 = 1;

/// SIT_IDENTITY_ONLY situation
pub const SIT_IDENTITY_ONLY: u32 = 1;

/// Transform id of phase 1 proposals
pub const KEY_IKE: u8 = 1;

/// SPI size of IPsec proposals
pub const IPSEC_SPI_LEN: usize = 4;

/// Exchange types (RFC 2408 Section 3.1, RFC 2409 Section 5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExchangeType {
    /// Identity protection, used as Main mode
    Main = 2,
    /// Aggressive mode
    Aggressive = 4,
    /// Informational exchange
    Informational = 5,
    /// Quick mode
    Quick = 32,
}

impl ExchangeType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            2 => Some(ExchangeType::Main),
            4 => Some(ExchangeType::Aggressive),
            5 => Some(ExchangeType::Informational),
            32 => Some(ExchangeType::Quick),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Whether the exchange establishes an ISAKMP SA
    pub fn is_phase1(self) -> bool {
        matches!(self, ExchangeType::Main | ExchangeType::Aggressive)
    }

    /// Short name for logs
    pub fn name(self) -> &'static str {
        match self {
            ExchangeType::Main => "main",
            ExchangeType::Aggressive => "aggressive",
            ExchangeType::Informational => "informational",
            ExchangeType::Quick => "quick",
        }
    }
}

/// Payload types (RFC 2408 Section 3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    /// Last payload marker
    None = 0,
    /// Security Association
    Sa = 1,
    /// Proposal
    Proposal = 2,
    /// Transform
    Transform = 3,
    /// Key Exchange
    KeyExchange = 4,
    /// Identification
    Id = 5,
    /// Certificate
    Cert = 6,
    /// Certificate Request
    CertReq = 7,
    /// Hash
    Hash = 8,
    /// Signature
    Signature = 9,
    /// Nonce
    Nonce = 10,
    /// Notification
    Notify = 11,
    /// Delete
    Delete = 12,
    /// Vendor ID
    VendorId = 13,
}

impl PayloadType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        use PayloadType::*;
        Some(match value {
            0 => None,
            1 => Sa,
            2 => Proposal,
            3 => Transform,
            4 => KeyExchange,
            5 => Id,
            6 => Cert,
            7 => CertReq,
            8 => Hash,
            9 => Signature,
            10 => Nonce,
            11 => Notify,
            12 => Delete,
            13 => VendorId,
            _ => return Option::None,
        })
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// ISAKMP header flags
pub mod flags {
    /// Payloads after the header are encrypted
    pub const ENCRYPTION: u8 = 0x01;
    /// Commit bit
    pub const COMMIT: u8 = 0x02;
    /// Authentication only
    pub const AUTH_ONLY: u8 = 0x04;
    /// All defined flag bits
    pub const ALL: u8 = ENCRYPTION | COMMIT | AUTH_ONLY;
}

/// Protocol ids of proposals and notifications (RFC 2407 Section 4.4.1)
pub mod protocol {
    /// ISAKMP
    pub const ISAKMP: u8 = 1;
    /// IPsec AH
    pub const AH: u8 = 2;
    /// IPsec ESP
    pub const ESP: u8 = 3;
}

/// Phase 1 attribute classes and values (RFC 2409 Appendix A)
pub mod oakley {
    /// Encryption algorithm class
    pub const ENCRYPTION_ALGORITHM: u16 = 1;
    /// Hash algorithm class
    pub const HASH_ALGORITHM: u16 = 2;
    /// Authentication method class
    pub const AUTH_METHOD: u16 = 3;
    /// Group description class
    pub const GROUP_DESCRIPTION: u16 = 4;
    /// Life type class
    pub const LIFE_TYPE: u16 = 11;
    /// Life duration class
    pub const LIFE_DURATION: u16 = 12;
    /// Key length class
    pub const KEY_LENGTH: u16 = 14;

    /// DES-CBC
    pub const ENC_DES: u16 = 1;
    /// Blowfish-CBC
    pub const ENC_BLOWFISH: u16 = 3;
    /// 3DES-CBC
    pub const ENC_3DES: u16 = 5;
    /// CAST-CBC
    pub const ENC_CAST: u16 = 6;
    /// AES-CBC (RFC 3602)
    pub const ENC_AES: u16 = 7;

    /// MD5
    pub const HASH_MD5: u16 = 1;
    /// SHA-1
    pub const HASH_SHA: u16 = 2;
    /// SHA2-256
    pub const HASH_SHA2_256: u16 = 4;

    /// Pre-shared key authentication
    pub const AUTH_PSK: u16 = 1;

    /// Lifetime in seconds
    pub const LIFE_SECONDS: u16 = 1;
}

/// Phase 2 attribute classes and values (RFC 2407 Section 4.5)
pub mod ipsec_attr {
    /// SA life type class
    pub const SA_LIFE_TYPE: u16 = 1;
    /// SA life duration class
    pub const SA_LIFE_DURATION: u16 = 2;
    /// Group description class (PFS)
    pub const GROUP_DESCRIPTION: u16 = 3;
    /// Encapsulation mode class
    pub const ENCAPSULATION_MODE: u16 = 4;
    /// Authentication algorithm class
    pub const AUTH_ALGORITHM: u16 = 5;
    /// Key length class
    pub const KEY_LENGTH: u16 = 6;

    /// Lifetime in seconds
    pub const LIFE_SECONDS: u16 = 1;

    /// Tunnel mode
    pub const ENCAP_TUNNEL: u16 = 1;
    /// Transport mode
    pub const ENCAP_TRANSPORT: u16 = 2;

    /// HMAC-MD5
    pub const AUTH_HMAC_MD5: u16 = 1;
    /// HMAC-SHA1
    pub const AUTH_HMAC_SHA: u16 = 2;
    /// HMAC-SHA2-256 (RFC 4868)
    pub const AUTH_HMAC_SHA2_256: u16 = 5;
    /// AES-XCBC-MAC (RFC 3566)
    pub const AUTH_AES_XCBC: u16 = 9;
}

/// AH transform ids (RFC 2407 Section 4.4.3)
pub mod ah_transform {
    /// AH with HMAC-MD5
    pub const MD5: u8 = 2;
    /// AH with HMAC-SHA1
    pub const SHA: u8 = 3;
    /// AH with HMAC-SHA2-256
    pub const SHA2_256: u8 = 5;
    /// AH with AES-XCBC-MAC
    pub const AES_XCBC: u8 = 9;
}

/// ESP transform ids (RFC 2407 Section 4.4.4)
pub mod esp_transform {
    /// DES-CBC
    pub const DES: u8 = 2;
    /// 3DES-CBC
    pub const TRIPLE_DES: u8 = 3;
    /// CAST-128
    pub const CAST: u8 = 6;
    /// Blowfish
    pub const BLOWFISH: u8 = 7;
    /// NULL
    pub const NULL: u8 = 11;
    /// AES-CBC
    pub const AES: u8 = 12;
}

/// Identification types (RFC 2407 Section 4.6.2.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IdType {
    /// Single IPv4 address
    Ipv4Addr = 1,
    /// Fully qualified domain name
    Fqdn = 2,
    /// user@domain
    UserFqdn = 3,
    /// IPv4 address and mask
    Ipv4Subnet = 4,
    /// Single IPv6 address
    Ipv6Addr = 5,
    /// IPv6 address and mask
    Ipv6Subnet = 6,
    /// IPv4 address range
    Ipv4Range = 7,
    /// IPv6 address range
    Ipv6Range = 8,
}

impl IdType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(IdType::Ipv4Addr),
            2 => Some(IdType::Fqdn),
            3 => Some(IdType::UserFqdn),
            4 => Some(IdType::Ipv4Subnet),
            5 => Some(IdType::Ipv6Addr),
            6 => Some(IdType::Ipv6Subnet),
            7 => Some(IdType::Ipv4Range),
            8 => Some(IdType::Ipv6Range),
            _ => None,
        }
    }
}

/// Notify message types (RFC 2408 Section 3.14.1, RFC 2407 Section 4.6.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum NotifyType {
    /// INVALID-PAYLOAD-TYPE
    InvalidPayloadType = 1,
    /// DOI-NOT-SUPPORTED
    DoiNotSupported = 2,
    /// SITUATION-NOT-SUPPORTED
    SituationNotSupported = 3,
    /// INVALID-COOKIE
    InvalidCookie = 4,
    /// INVALID-MAJOR-VERSION
    InvalidMajorVersion = 5,
    /// INVALID-MINOR-VERSION
    InvalidMinorVersion = 6,
    /// INVALID-EXCHANGE-TYPE
    InvalidExchangeType = 7,
    /// INVALID-FLAGS
    InvalidFlags = 8,
    /// INVALID-MESSAGE-ID
    InvalidMessageId = 9,
    /// INVALID-PROTOCOL-ID
    InvalidProtocolId = 10,
    /// INVALID-SPI
    InvalidSpi = 11,
    /// INVALID-TRANSFORM-ID
    InvalidTransformId = 12,
    /// ATTRIBUTES-NOT-SUPPORTED
    AttributesNotSupported = 13,
    /// NO-PROPOSAL-CHOSEN
    NoProposalChosen = 14,
    /// BAD-PROPOSAL-SYNTAX
    BadProposalSyntax = 15,
    /// PAYLOAD-MALFORMED
    PayloadMalformed = 16,
    /// INVALID-KEY-INFORMATION
    InvalidKeyInformation = 17,
    /// INVALID-ID-INFORMATION
    InvalidIdInformation = 18,
    /// AUTHENTICATION-FAILED
    AuthenticationFailed = 24,
    /// INVALID-HASH-INFORMATION
    InvalidHashInformation = 23,
    /// UNEQUAL-PAYLOAD-LENGTHS
    UnequalPayloadLengths = 30,
    /// RESPONDER-LIFETIME (status)
    ResponderLifetime = 24576,
    /// INITIAL-CONTACT (status)
    InitialContact = 24578,
}

impl NotifyType {
    /// Convert from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        use NotifyType::*;
        Some(match value {
            1 => InvalidPayloadType,
            2 => DoiNotSupported,
            3 => SituationNotSupported,
            4 => InvalidCookie,
            5 => InvalidMajorVersion,
            6 => InvalidMinorVersion,
            7 => InvalidExchangeType,
            8 => InvalidFlags,
            9 => InvalidMessageId,
            10 => InvalidProtocolId,
            11 => InvalidSpi,
            12 => InvalidTransformId,
            13 => AttributesNotSupported,
            14 => NoProposalChosen,
            15 => BadProposalSyntax,
            16 => PayloadMalformed,
            17 => InvalidKeyInformation,
            18 => InvalidIdInformation,
            23 => InvalidHashInformation,
            24 => AuthenticationFailed,
            30 => UnequalPayloadLengths,
            24576 => ResponderLifetime,
            24578 => InitialContact,
            _ => return None,
        })
    }

    /// Convert to u16
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Whether this is an error notification (types below 8192)
    pub fn is_error(self) -> bool {
        self.to_u16() < 8192
    }
}
