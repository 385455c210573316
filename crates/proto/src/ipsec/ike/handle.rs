//! Negotiation handles
//!
//! A handle is the in-memory record of one exchange while it runs. Phase 1
//! handles own everything needed to establish an ISAKMP SA; phase 2 handles
//! carry one quick mode exchange and the SA2 items it negotiates. Each
//! handle keeps its own scratch state, so concurrent exchanges never share
//! buffers.

use std::net::{IpAddr, SocketAddr};

use zeroize::Zeroizing;

use super::constants::*;
use super::dh::{DhGroup, DhKeyPair};
use super::header::IsakmpHeader;
use super::oakley::{decrypt_body, encrypt_body, IsakmpKeys};
use super::payload::Message;
use super::policy::{Phase1Mode, Phase1Proposal};
use crate::ipsec::config::IkeConfig;
use crate::ipsec::crypto::{CryptoProvider, EncryptAlgorithm};
use crate::ipsec::policy::SecurityProtocol;
use crate::ipsec::selector::Selector;
use crate::ipsec::timer::TimerId;
use crate::ipsec::{Error, Result};

/// Role of this host in an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sent the first message
    Initiator,
    /// Answered the first message
    Responder,
}

/// State shared by every step of an exchange
pub struct Env<'a> {
    /// IKE configuration
    pub config: &'a IkeConfig,
    /// Crypto provider
    pub provider: &'a dyn CryptoProvider,
}

impl Env<'_> {
    /// Fresh nonce of the configured length
    pub fn nonce(&self) -> Vec<u8> {
        let mut nonce = vec![0u8; self.config.nonce_len];
        self.provider.random(&mut nonce);
        nonce
    }

    /// Fresh nonzero cookie
    pub fn cookie(&self) -> [u8; COOKIE_LEN] {
        let mut cookie = [0u8; COOKIE_LEN];
        while cookie == [0u8; COOKIE_LEN] {
            self.provider.random(&mut cookie);
        }
        cookie
    }

    /// Fresh nonzero message id
    pub fn message_id(&self) -> u32 {
        let mut bytes = [0u8; 4];
        loop {
            self.provider.random(&mut bytes);
            let id = u32::from_be_bytes(bytes);
            if id != 0 {
                return id;
            }
        }
    }
}

/// Retransmission state of a handle
#[derive(Debug, Default)]
pub struct Retransmit {
    /// Last message received, to recognise duplicates
    pub last_received: Vec<u8>,
    /// Last message sent, resent on timeout or duplicate
    pub last_sent: Vec<u8>,
    /// Resends left
    pub remaining: u8,
    /// Pending resend timer
    pub timer: Option<TimerId>,
}

impl Retransmit {
    /// Record a message that is about to be sent
    pub fn sent(&mut self, message: &[u8], resend_count: u8) {
        self.last_sent = message.to_vec();
        self.remaining = resend_count;
    }

    /// Whether `data` repeats the last message received
    pub fn is_duplicate(&self, data: &[u8]) -> bool {
        !self.last_received.is_empty() && self.last_received == data
    }
}

/// CBC state of an encrypted exchange
pub struct Cipher<'a> {
    /// Algorithm
    pub encryption: EncryptAlgorithm,
    /// Key
    pub key: &'a [u8],
    /// IV for the next message
    pub iv: &'a [u8],
}

/// Serialize a message, encrypting it when `cipher` is given
///
/// Returns the datagram and, when encrypted, the IV for the next message.
pub fn seal(
    provider: &dyn CryptoProvider,
    message: &mut Message,
    cipher: Option<Cipher<'_>>,
) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
    let body = message.payload_bytes()?;
    match cipher {
        Some(c) => {
            message.header.flags |= flags::ENCRYPTION;
            let (encrypted, next_iv) = encrypt_body(provider, c.encryption, c.key, c.iv, &body)?;
            Ok((message.assemble(&encrypted)?, Some(next_iv)))
        }
        None => {
            message.header.flags &= !flags::ENCRYPTION;
            Ok((message.assemble(&body)?, None))
        }
    }
}

/// Parse a received message, decrypting it when the header says so
///
/// An encrypted message is only accepted when `cipher` is given; a clear
/// message is rejected when `cipher` is given and `require_encryption` is
/// set. Returns the message and, when decrypted, the IV for the next
/// message, which the caller commits once the message was accepted.
pub fn open(
    provider: &dyn CryptoProvider,
    header: &IsakmpHeader,
    data: &[u8],
    cipher: Option<Cipher<'_>>,
    require_encryption: bool,
) -> Result<(Message, Option<Vec<u8>>)> {
    let body = &data[ISAKMP_HEADER_LEN..header.length as usize];
    match (header.is_encrypted(), cipher) {
        (true, Some(c)) => {
            let (plain, next_iv) = decrypt_body(provider, c.encryption, c.key, c.iv, body)?;
            Ok((Message::parse(header.clone(), &plain)?, Some(next_iv)))
        }
        (true, None) => Err(Error::UnexpectedMessage),
        (false, Some(_)) if require_encryption => Err(Error::UnexpectedMessage),
        (false, _) => Ok((Message::parse(header.clone(), body)?, None)),
    }
}

/// Phase 1 exchange in progress
#[derive(Debug)]
pub struct Phase1Handle {
    /// Initiator cookie
    pub cookie_i: [u8; COOKIE_LEN],
    /// Responder cookie, zero until known
    pub cookie_r: [u8; COOKIE_LEN],
    /// Our role
    pub role: Role,
    /// Exchange mode
    pub mode: Phase1Mode,
    /// Position in the exchange; the exchange is complete at
    /// [`Phase1Handle::complete_state`]
    pub state: u8,
    /// IPsec group
    pub group: String,
    /// Interface the exchange runs on
    pub if_index: u32,
    /// IKE policy
    pub policy_index: u32,
    /// Local address
    pub local: IpAddr,
    /// Peer address and port
    pub peer: SocketAddr,
    /// Proposals offered by the initiator
    pub offered: Vec<Phase1Proposal>,
    /// Accepted proposal
    pub chosen: Option<Phase1Proposal>,
    /// Body of the initiator's SA payload
    pub sa_body: Vec<u8>,
    /// Our Diffie-Hellman key pair
    pub dh: Option<DhKeyPair>,
    /// Initiator public value
    pub public_i: Vec<u8>,
    /// Responder public value
    pub public_r: Vec<u8>,
    /// Initiator nonce body
    pub nonce_i: Vec<u8>,
    /// Responder nonce body
    pub nonce_r: Vec<u8>,
    /// Identification payload body received from the peer
    pub peer_id: Vec<u8>,
    /// Keying material, once derived
    pub keys: Option<IsakmpKeys>,
    /// IV for the next encrypted message
    pub iv: Vec<u8>,
    /// Retransmission state
    pub retransmit: Retransmit,
    /// Exchange timeout
    pub timeout_timer: Option<TimerId>,
    /// Message ids of phase 2 handles waiting for this exchange
    pub queued: Vec<u32>,
}

impl Phase1Handle {
    /// Create a handle
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cookie_i: [u8; COOKIE_LEN],
        role: Role,
        mode: Phase1Mode,
        group: &str,
        if_index: u32,
        policy_index: u32,
        local: IpAddr,
        peer: SocketAddr,
    ) -> Self {
        Phase1Handle {
            cookie_i,
            cookie_r: [0; COOKIE_LEN],
            role,
            mode,
            state: 1,
            group: group.to_string(),
            if_index,
            policy_index,
            local,
            peer,
            offered: Vec::new(),
            chosen: None,
            sa_body: Vec::new(),
            dh: None,
            public_i: Vec::new(),
            public_r: Vec::new(),
            nonce_i: Vec::new(),
            nonce_r: Vec::new(),
            peer_id: Vec::new(),
            keys: None,
            iv: Vec::new(),
            retransmit: Retransmit::default(),
            timeout_timer: None,
            queued: Vec::new(),
        }
    }

    /// State in which the exchange is complete
    pub fn complete_state(&self) -> u8 {
        match self.mode {
            Phase1Mode::Main => 7,
            Phase1Mode::Aggressive => 4,
        }
    }

    /// Whether the exchange completed
    pub fn is_complete(&self) -> bool {
        self.state >= self.complete_state()
    }

    /// Whether the handle belongs to the cookie pair
    pub fn matches(&self, cookie_i: &[u8; COOKIE_LEN], cookie_r: &[u8; COOKIE_LEN]) -> bool {
        self.cookie_i == *cookie_i
            && (self.cookie_r == [0u8; COOKIE_LEN]
                || *cookie_r == [0u8; COOKIE_LEN]
                || self.cookie_r == *cookie_r)
    }

    /// Name of the exchange, for logs
    pub fn exchange_name(&self) -> &'static str {
        self.mode.name()
    }

    /// Exchange type on the wire
    pub fn exchange_type(&self) -> ExchangeType {
        match self.mode {
            Phase1Mode::Main => ExchangeType::Main,
            Phase1Mode::Aggressive => ExchangeType::Aggressive,
        }
    }
}

/// One security protocol negotiated in quick mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sa2 {
    /// Protocol, mode and algorithms, as configured locally
    pub security: SecurityProtocol,
    /// SPI chosen by this host, used by the inbound SA
    pub local_spi: u32,
    /// SPI chosen by the peer, used by the outbound SA
    pub remote_spi: u32,
}

/// Quick mode exchange in progress
#[derive(Debug)]
pub struct Phase2Handle {
    /// Message id of the exchange
    pub msg_id: u32,
    /// Initiator cookie of the ISAKMP SA
    pub cookie_i: [u8; COOKIE_LEN],
    /// Responder cookie of the ISAKMP SA, zero while phase 1 runs
    pub cookie_r: [u8; COOKIE_LEN],
    /// Our role
    pub role: Role,
    /// Position in the exchange; complete at 4
    pub state: u8,
    /// IPsec group
    pub group: String,
    /// Interface the SAs are installed on
    pub if_index: u32,
    /// Peer address and port
    pub peer: SocketAddr,
    /// Protected traffic as seen by the initiator
    pub selector: Selector,
    /// IPsec policy the SAs are negotiated for
    pub policy_index: u32,
    /// Security protocol requested by the initiator
    pub request: Option<SecurityProtocol>,
    /// Negotiated items, outermost first
    pub sa2: Vec<Sa2>,
    /// SA lifetime in seconds
    pub lifetime: u32,
    /// Group for perfect forward secrecy
    pub pfs: Option<DhGroup>,
    /// Our quick mode key pair when PFS is used
    pub dh: Option<DhKeyPair>,
    /// Quick mode shared secret when PFS is used
    pub pfs_secret: Option<Zeroizing<Vec<u8>>>,
    /// Initiator nonce body
    pub nonce_i: Vec<u8>,
    /// Responder nonce body
    pub nonce_r: Vec<u8>,
    /// IV for the next message
    pub iv: Vec<u8>,
    /// Retransmission state
    pub retransmit: Retransmit,
    /// Exchange timeout
    pub timeout_timer: Option<TimerId>,
    /// Blocking caller waiting on the exchange
    pub slot: Option<usize>,
    /// Set when the ISAKMP SA went away; messages are rejected
    pub delete_pending: bool,
}

impl Phase2Handle {
    /// Create a handle
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        msg_id: u32,
        role: Role,
        group: &str,
        if_index: u32,
        peer: SocketAddr,
        selector: Selector,
        policy_index: u32,
    ) -> Self {
        Phase2Handle {
            msg_id,
            cookie_i: [0; COOKIE_LEN],
            cookie_r: [0; COOKIE_LEN],
            role,
            state: 1,
            group: group.to_string(),
            if_index,
            peer,
            selector,
            policy_index,
            request: None,
            sa2: Vec::new(),
            lifetime: 0,
            pfs: None,
            dh: None,
            pfs_secret: None,
            nonce_i: Vec::new(),
            nonce_r: Vec::new(),
            iv: Vec::new(),
            retransmit: Retransmit::default(),
            timeout_timer: None,
            slot: None,
            delete_pending: false,
        }
    }

    /// Whether the exchange completed
    pub fn is_complete(&self) -> bool {
        self.state >= 4
    }

    /// Whether the handle is waiting for phase 1
    pub fn is_queued(&self) -> bool {
        self.cookie_r == [0u8; COOKIE_LEN]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::crypto::SoftwareCrypto;

    #[test]
    fn test_seal_and_open() {
        let provider = SoftwareCrypto::new();
        let key = [5u8; 16];
        let iv = [6u8; 16];
        let mut header = IsakmpHeader::new([1; 8], [2; 8], ExchangeType::Quick, 77);
        header.flags = 0;
        let mut message = Message::new(header);
        message.push(PayloadType::Hash, vec![1; 20]);
        message.push(PayloadType::Nonce, vec![2; 16]);

        let cipher = Cipher {
            encryption: EncryptAlgorithm::Aes128Cbc,
            key: &key,
            iv: &iv,
        };
        let (bytes, next_iv) = seal(&provider, &mut message, Some(cipher)).unwrap();
        let next_iv = next_iv.unwrap();
        assert_eq!((bytes.len() - ISAKMP_HEADER_LEN) % 16, 0);
        assert_eq!(next_iv, bytes[bytes.len() - 16..].to_vec());

        let parsed = IsakmpHeader::from_bytes(&bytes).unwrap();
        assert!(parsed.is_encrypted());
        let cipher = Cipher {
            encryption: EncryptAlgorithm::Aes128Cbc,
            key: &key,
            iv: &iv,
        };
        let (opened, peer_iv) = open(&provider, &parsed, &bytes, Some(cipher), true).unwrap();
        assert_eq!(opened.payloads, message.payloads);
        assert_eq!(peer_iv.unwrap(), next_iv);

        assert_eq!(
            open(&provider, &parsed, &bytes, None, false).unwrap_err(),
            Error::UnexpectedMessage
        );
    }

    #[test]
    fn test_clear_message_rejected_when_encryption_required() {
        let provider = SoftwareCrypto::new();
        let mut message = Message::new(IsakmpHeader::new([1; 8], [2; 8], ExchangeType::Main, 0));
        message.push(PayloadType::Nonce, vec![2; 16]);
        let (bytes, iv) = seal(&provider, &mut message, None).unwrap();
        assert!(iv.is_none());

        let header = IsakmpHeader::from_bytes(&bytes).unwrap();
        let key = [0u8; 16];
        let cipher = Cipher {
            encryption: EncryptAlgorithm::Aes128Cbc,
            key: &key,
            iv: &key,
        };
        assert_eq!(
            open(&provider, &header, &bytes, Some(cipher), true).unwrap_err(),
            Error::UnexpectedMessage
        );
        assert!(open(&provider, &header, &bytes, None, false).is_ok());
    }

    #[test]
    fn test_env_identifiers_nonzero() {
        let provider = SoftwareCrypto::new();
        let config = IkeConfig::default();
        let env = Env {
            config: &config,
            provider: &provider,
        };
        assert_ne!(env.cookie(), [0; 8]);
        assert_ne!(env.message_id(), 0);
        assert_eq!(env.nonce().len(), config.nonce_len);
    }

    #[test]
    fn test_duplicate_detection() {
        let mut retransmit = Retransmit::default();
        assert!(!retransmit.is_duplicate(b""));
        retransmit.last_received = b"msg".to_vec();
        assert!(retransmit.is_duplicate(b"msg"));
        retransmit.sent(b"reply", 3);
        assert_eq!(retransmit.remaining, 3);
    }
}
