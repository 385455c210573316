//! Error types for IPsec and IKE operations
//!
//! A single error type covers the packet transform engine, the SPD/SADB and
//! the IKE negotiation engine. Every variant belongs to exactly one
//! [`ErrorKind`], which is what callers on the packet path care about: any
//! `ProtocolViolation` means "discard the packet and carry on".

use std::fmt;

use strata_platform::StrataError;

use super::ike::constants::NotifyType;

/// Result type for IPsec operations
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller supplied an invalid argument
    Parameter,
    /// Wire data failed validation; the packet is dropped
    ProtocolViolation,
    /// Memory, SPI space or blocking slots exhausted
    ResourceExhaustion,
    /// A module lock could not be acquired within its timeout
    LockTimeout,
    /// A cryptographic primitive failed
    Crypto,
    /// A requested entry does not exist
    NotFound,
    /// The operation is not valid in the current state
    State,
}

/// IPsec and IKE errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid parameter passed to an administrative call
    InvalidParameter(String),

    /// Algorithm identifier not compiled in
    InvalidAlgoId(u8),

    /// SPI outside the permitted range
    InvalidSpi(u32),

    /// SPI already in use
    DuplicateSpi(u32),

    /// Entry with this name already exists
    DuplicateName(String),

    /// More security protocols than the bundle limit allows
    BundleTooLarge {
        /// Configured maximum
        max: usize,
        /// Requested size
        requested: usize,
    },

    /// Structurally invalid packet
    Malformed(String),

    /// Buffer too short for operation
    BufferTooShort {
        /// Required length
        required: usize,
        /// Available length
        available: usize,
    },

    /// Invalid length field
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Integrity check value mismatch
    InvalidDigest,

    /// ESP padding bytes or pad length are invalid
    InvalidPadding,

    /// Sequence number rejected by the anti-replay window
    ReplayDetected(u64),

    /// Outbound sequence number space exhausted without ESN
    SequenceOverflow,

    /// Packet matched a discard policy
    PacketDiscard,

    /// Inbound packet does not satisfy the matched policy
    PolicyMismatch,

    /// ISAKMP cookie is invalid
    InvalidCookie,

    /// ISAKMP major version not supported
    InvalidMajorVersion(u8),

    /// ISAKMP minor version not supported
    InvalidMinorVersion(u8),

    /// Exchange type not supported
    InvalidExchangeType(u8),

    /// ISAKMP header flags are invalid
    InvalidFlags(u8),

    /// Message ID is invalid for this exchange
    InvalidMessageId(u32),

    /// Payload failed validation
    InvalidPayload(String),

    /// Payload type not expected in this message
    UnexpectedPayload(u8),

    /// A required payload is missing
    MissingPayload(&'static str),

    /// A payload occurs more than once
    DuplicatePayload(u8),

    /// No acceptable proposal found
    NoProposalChosen,

    /// Hash or authentication data verification failed
    VerifyFailed,

    /// Message source address does not match the bound peer
    AddressMismatch,

    /// Exchange mode not allowed by the policy
    UnallowedMode,

    /// Exchange not allowed by the policy
    UnallowedExchange,

    /// Message not expected in the current exchange state
    UnexpectedMessage,

    /// No free SPI could be allocated
    NoSpiAvailable,

    /// All blocking wait slots are in use
    TooManyBlockingExchanges,

    /// Lock acquisition timed out
    LockTimeout(&'static str),

    /// Operation timed out
    Timeout,

    /// Cryptographic operation failed
    CryptoError(String),

    /// Policy group not found
    GroupNotFound(String),

    /// No policy matched
    PolicyNotFound,

    /// Security Association not found
    SaNotFound(String),

    /// Generic lookup failure
    NotFound(String),

    /// State machine error
    InvalidState(String),

    /// I/O error
    Io(String),

    /// Internal error (should not happen)
    Internal(String),
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidParameter(_)
            | Error::InvalidAlgoId(_)
            | Error::InvalidSpi(_)
            | Error::DuplicateSpi(_)
            | Error::DuplicateName(_)
            | Error::BundleTooLarge { .. } => ErrorKind::Parameter,

            Error::Malformed(_)
            | Error::BufferTooShort { .. }
            | Error::InvalidLength { .. }
            | Error::InvalidDigest
            | Error::InvalidPadding
            | Error::ReplayDetected(_)
            | Error::PacketDiscard
            | Error::PolicyMismatch
            | Error::InvalidCookie
            | Error::InvalidMajorVersion(_)
            | Error::InvalidMinorVersion(_)
            | Error::InvalidExchangeType(_)
            | Error::InvalidFlags(_)
            | Error::InvalidMessageId(_)
            | Error::InvalidPayload(_)
            | Error::UnexpectedPayload(_)
            | Error::MissingPayload(_)
            | Error::DuplicatePayload(_)
            | Error::NoProposalChosen
            | Error::VerifyFailed
            | Error::AddressMismatch
            | Error::UnallowedMode
            | Error::UnallowedExchange
            | Error::UnexpectedMessage => ErrorKind::ProtocolViolation,

            Error::SequenceOverflow
            | Error::NoSpiAvailable
            | Error::TooManyBlockingExchanges => ErrorKind::ResourceExhaustion,

            Error::LockTimeout(_) | Error::Timeout => ErrorKind::LockTimeout,

            Error::CryptoError(_) => ErrorKind::Crypto,

            Error::GroupNotFound(_)
            | Error::PolicyNotFound
            | Error::SaNotFound(_)
            | Error::NotFound(_) => ErrorKind::NotFound,

            Error::InvalidState(_) | Error::Io(_) | Error::Internal(_) => ErrorKind::State,
        }
    }

    /// Whether this error came from validating wire data
    pub fn is_protocol_violation(&self) -> bool {
        self.kind() == ErrorKind::ProtocolViolation
    }

    /// ISAKMP notify message type reporting this error to the peer
    ///
    /// `None` for errors that are not the peer's business.
    pub fn notify_type(&self) -> Option<NotifyType> {
        let notify = match self {
            Error::InvalidCookie => NotifyType::InvalidCookie,
            Error::InvalidMajorVersion(_) => NotifyType::InvalidMajorVersion,
            Error::InvalidMinorVersion(_) => NotifyType::InvalidMinorVersion,
            Error::InvalidExchangeType(_) => NotifyType::InvalidExchangeType,
            Error::InvalidFlags(_) => NotifyType::InvalidFlags,
            Error::InvalidMessageId(_) => NotifyType::InvalidMessageId,
            Error::InvalidSpi(_) => NotifyType::InvalidSpi,
            Error::UnexpectedPayload(_) | Error::DuplicatePayload(_) => {
                NotifyType::InvalidPayloadType
            }
            Error::InvalidPayload(_) | Error::MissingPayload(_) | Error::InvalidLength { .. } => {
                NotifyType::PayloadMalformed
            }
            Error::NoProposalChosen | Error::UnallowedExchange | Error::UnallowedMode => {
                NotifyType::NoProposalChosen
            }
            Error::VerifyFailed => NotifyType::InvalidHashInformation,
            Error::AddressMismatch => NotifyType::InvalidIdInformation,
            _ => return None,
        };
        Some(notify)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            Error::InvalidAlgoId(id) => write!(f, "Invalid algorithm id: {}", id),
            Error::InvalidSpi(spi) => write!(f, "Invalid SPI: 0x{:08x}", spi),
            Error::DuplicateSpi(spi) => write!(f, "SPI already in use: 0x{:08x}", spi),
            Error::DuplicateName(name) => write!(f, "Duplicate name: {}", name),
            Error::BundleTooLarge { max, requested } => {
                write!(f, "SA bundle too large: {} (max {})", requested, max)
            }
            Error::Malformed(msg) => write!(f, "Malformed packet: {}", msg),
            Error::BufferTooShort {
                required,
                available,
            } => {
                write!(
                    f,
                    "Buffer too short: need {} bytes, have {}",
                    required, available
                )
            }
            Error::InvalidLength { expected, actual } => {
                write!(f, "Invalid length: expected {}, got {}", expected, actual)
            }
            Error::InvalidDigest => write!(f, "Integrity check value mismatch"),
            Error::InvalidPadding => write!(f, "Invalid ESP padding"),
            Error::ReplayDetected(seq) => {
                write!(f, "Replay attack detected (sequence: {})", seq)
            }
            Error::SequenceOverflow => write!(f, "Sequence number overflow"),
            Error::PacketDiscard => write!(f, "Packet discarded by policy"),
            Error::PolicyMismatch => write!(f, "Packet does not satisfy policy"),
            Error::InvalidCookie => write!(f, "Invalid ISAKMP cookie"),
            Error::InvalidMajorVersion(v) => write!(f, "Invalid major version: {}", v),
            Error::InvalidMinorVersion(v) => write!(f, "Invalid minor version: {}", v),
            Error::InvalidExchangeType(t) => write!(f, "Invalid exchange type: {}", t),
            Error::InvalidFlags(flags) => write!(f, "Invalid ISAKMP flags: 0x{:02x}", flags),
            Error::InvalidMessageId(id) => write!(f, "Invalid message ID: 0x{:08x}", id),
            Error::InvalidPayload(msg) => write!(f, "Invalid payload: {}", msg),
            Error::UnexpectedPayload(t) => write!(f, "Unexpected payload type: {}", t),
            Error::MissingPayload(name) => write!(f, "Missing {} payload", name),
            Error::DuplicatePayload(t) => write!(f, "Duplicate payload type: {}", t),
            Error::NoProposalChosen => {
                write!(f, "No acceptable proposal found in negotiation")
            }
            Error::VerifyFailed => write!(f, "Verification failed"),
            Error::AddressMismatch => write!(f, "Peer address mismatch"),
            Error::UnallowedMode => write!(f, "Exchange mode not allowed by policy"),
            Error::UnallowedExchange => write!(f, "Exchange not allowed by policy"),
            Error::UnexpectedMessage => write!(f, "Unexpected message"),
            Error::NoSpiAvailable => write!(f, "No SPI available"),
            Error::TooManyBlockingExchanges => write!(f, "Too many blocking exchanges"),
            Error::LockTimeout(what) => write!(f, "Timed out acquiring {} lock", what),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),
            Error::GroupNotFound(name) => write!(f, "Group not found: {}", name),
            Error::PolicyNotFound => write!(f, "No matching policy"),
            Error::SaNotFound(id) => write!(f, "Security Association not found: {}", id),
            Error::NotFound(what) => write!(f, "Not found: {}", what),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::Io(msg) => write!(f, "I/O error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// Convert from std::io::Error
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<StrataError> for Error {
    fn from(err: StrataError) -> Self {
        match err {
            StrataError::Duplicate(name) => Error::DuplicateName(name),
            StrataError::Config(msg) => Error::InvalidParameter(msg),
            StrataError::LockTimeout(_) => Error::LockTimeout("platform"),
            StrataError::Io(e) => Error::Io(e.to_string()),
            other => Error::Internal(other.to_string()),
        }
    }
}

impl From<Error> for StrataError {
    fn from(err: Error) -> Self {
        match err.kind() {
            ErrorKind::Parameter => StrataError::Config(err.to_string()),
            ErrorKind::LockTimeout => StrataError::LockTimeout(err.to_string()),
            ErrorKind::ProtocolViolation => StrataError::Protocol(err.to_string()),
            ErrorKind::Crypto => StrataError::Security(err.to_string()),
            _ => StrataError::Other(Box::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidAlgoId(42);
        assert_eq!(err.to_string(), "Invalid algorithm id: 42");

        let err = Error::InvalidSpi(0xff);
        assert_eq!(err.to_string(), "Invalid SPI: 0x000000ff");

        let err = Error::InvalidLength {
            expected: 10,
            actual: 5,
        };
        assert_eq!(err.to_string(), "Invalid length: expected 10, got 5");
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(Error::InvalidDigest.kind(), ErrorKind::ProtocolViolation);
        assert_eq!(Error::LockTimeout("sadb").kind(), ErrorKind::LockTimeout);
        assert_eq!(
            Error::TooManyBlockingExchanges.kind(),
            ErrorKind::ResourceExhaustion
        );
        assert_eq!(Error::PolicyNotFound.kind(), ErrorKind::NotFound);
        assert!(Error::ReplayDetected(5).is_protocol_violation());
        assert!(!Error::InvalidParameter("x".into()).is_protocol_violation());
    }

    #[test]
    fn test_notify_mapping() {
        assert_eq!(
            Error::NoProposalChosen.notify_type(),
            Some(NotifyType::NoProposalChosen)
        );
        assert_eq!(
            Error::VerifyFailed.notify_type(),
            Some(NotifyType::InvalidHashInformation)
        );
        assert_eq!(
            Error::MissingPayload("nonce").notify_type(),
            Some(NotifyType::PayloadMalformed)
        );
        assert_eq!(Error::LockTimeout("ike").notify_type(), None);
        assert_eq!(Error::PolicyNotFound.notify_type(), None);
    }

    #[test]
    fn test_error_clone() {
        let err1 = Error::NoProposalChosen;
        let err2 = err1.clone();
        assert_eq!(err1, err2);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        match err {
            Error::Io(msg) => assert!(msg.contains("file not found")),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_platform_conversion() {
        let err: Error = StrataError::Duplicate("wan".into()).into();
        assert_eq!(err, Error::DuplicateName("wan".into()));

        let back: StrataError = Error::LockTimeout("ike").into();
        assert!(matches!(back, StrataError::LockTimeout(_)));
    }
}
