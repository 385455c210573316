//! IKE groups and policies
//!
//! An IKE group carries the same name as the IPsec group it negotiates SAs
//! for. Its policies are selected by peer address and describe how phase 1
//! is run with that peer: allowed exchange modes, proposals, pre-shared key
//! and which phase 2 traffic may be negotiated.

use std::net::IpAddr;

use strata_platform::Named;
use zeroize::Zeroizing;

use super::constants::{oakley, KEY_IKE};
use super::dh::DhGroup;
use super::payload::{Attribute, Transform};
use crate::ipsec::crypto::{EncryptAlgorithm, PrfAlgorithm};
use crate::ipsec::selector::{AddrSpec, Selector, WILDCARD};
use crate::ipsec::{Error, Result};

/// Phase 1 exchange mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase1Mode {
    /// Identity protection, six messages
    Main,
    /// Three messages, identities in clear
    Aggressive,
}

impl Phase1Mode {
    /// Name used in logs
    pub fn name(self) -> &'static str {
        match self {
            Phase1Mode::Main => "main",
            Phase1Mode::Aggressive => "aggressive",
        }
    }
}

/// Attributes offered or accepted for an ISAKMP SA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phase1Proposal {
    /// Cipher protecting phase 1 and 2 messages
    pub encryption: EncryptAlgorithm,
    /// Hash and prf
    pub hash: PrfAlgorithm,
    /// Diffie-Hellman group
    pub group: DhGroup,
    /// ISAKMP SA lifetime in seconds
    pub lifetime: u32,
}

impl Phase1Proposal {
    /// Create a proposal
    pub fn new(encryption: EncryptAlgorithm, hash: PrfAlgorithm, group: DhGroup, lifetime: u32) -> Self {
        Phase1Proposal {
            encryption,
            hash,
            group,
            lifetime,
        }
    }

    /// Check that the algorithms can protect an ISAKMP SA
    pub fn validate(&self) -> Result<()> {
        if self.encryption.is_null() {
            return Err(Error::InvalidParameter(
                "phase 1 requires an encryption algorithm".into(),
            ));
        }
        if self.lifetime == 0 {
            return Err(Error::InvalidParameter("phase 1 lifetime must be nonzero".into()));
        }
        Ok(())
    }

    /// Whether `other` selects the same algorithms
    pub fn same_algorithms(&self, other: &Phase1Proposal) -> bool {
        self.encryption == other.encryption && self.hash == other.hash && self.group == other.group
    }

    /// Encode as a KEY_IKE transform with pre-shared key authentication
    pub fn to_transform(&self, number: u8) -> Transform {
        let (cipher, key_bits) = match self.encryption {
            EncryptAlgorithm::DesCbc => (oakley::ENC_DES, None),
            EncryptAlgorithm::TripleDesCbc => (oakley::ENC_3DES, None),
            EncryptAlgorithm::Aes128Cbc => (oakley::ENC_AES, Some(128)),
            EncryptAlgorithm::Aes192Cbc => (oakley::ENC_AES, Some(192)),
            EncryptAlgorithm::Aes256Cbc => (oakley::ENC_AES, Some(256)),
            EncryptAlgorithm::BlowfishCbc => (oakley::ENC_BLOWFISH, Some(128)),
            EncryptAlgorithm::Cast128Cbc => (oakley::ENC_CAST, Some(128)),
            EncryptAlgorithm::Null => (0, None),
        };
        let hash = match self.hash {
            PrfAlgorithm::Md5 => oakley::HASH_MD5,
            PrfAlgorithm::Sha1 => oakley::HASH_SHA,
            PrfAlgorithm::Sha256 => oakley::HASH_SHA2_256,
        };

        let mut attributes = vec![Attribute::basic(oakley::ENCRYPTION_ALGORITHM, cipher)];
        if let Some(bits) = key_bits {
            attributes.push(Attribute::basic(oakley::KEY_LENGTH, bits));
        }
        attributes.extend([
            Attribute::basic(oakley::HASH_ALGORITHM, hash),
            Attribute::basic(oakley::AUTH_METHOD, oakley::AUTH_PSK),
            Attribute::basic(oakley::GROUP_DESCRIPTION, self.group.id()),
            Attribute::basic(oakley::LIFE_TYPE, oakley::LIFE_SECONDS),
            Attribute::number(oakley::LIFE_DURATION, self.lifetime),
        ]);

        Transform {
            number,
            transform_id: KEY_IKE,
            attributes,
        }
    }

    /// Decode a KEY_IKE transform
    ///
    /// # Errors
    ///
    /// Returns `Error::NoProposalChosen` for transforms using algorithms or
    /// authentication methods that are not supported.
    pub fn from_transform(transform: &Transform) -> Result<Self> {
        if transform.transform_id != KEY_IKE {
            return Err(Error::NoProposalChosen);
        }
        let value = |kind| transform.attribute(kind).and_then(|a| a.as_u32());

        let key_bits = value(oakley::KEY_LENGTH);
        let encryption = match (value(oakley::ENCRYPTION_ALGORITHM), key_bits) {
            (Some(c), None) if c == u32::from(oakley::ENC_DES) => EncryptAlgorithm::DesCbc,
            (Some(c), None) if c == u32::from(oakley::ENC_3DES) => EncryptAlgorithm::TripleDesCbc,
            (Some(c), Some(128)) if c == u32::from(oakley::ENC_AES) => EncryptAlgorithm::Aes128Cbc,
            (Some(c), Some(192)) if c == u32::from(oakley::ENC_AES) => EncryptAlgorithm::Aes192Cbc,
            (Some(c), Some(256)) if c == u32::from(oakley::ENC_AES) => EncryptAlgorithm::Aes256Cbc,
            (Some(c), None | Some(128)) if c == u32::from(oakley::ENC_BLOWFISH) => {
                EncryptAlgorithm::BlowfishCbc
            }
            (Some(c), None | Some(128)) if c == u32::from(oakley::ENC_CAST) => {
                EncryptAlgorithm::Cast128Cbc
            }
            _ => return Err(Error::NoProposalChosen),
        };
        let hash = match value(oakley::HASH_ALGORITHM) {
            Some(h) if h == u32::from(oakley::HASH_MD5) => PrfAlgorithm::Md5,
            Some(h) if h == u32::from(oakley::HASH_SHA) => PrfAlgorithm::Sha1,
            Some(h) if h == u32::from(oakley::HASH_SHA2_256) => PrfAlgorithm::Sha256,
            _ => return Err(Error::NoProposalChosen),
        };
        if value(oakley::AUTH_METHOD) != Some(u32::from(oakley::AUTH_PSK)) {
            return Err(Error::NoProposalChosen);
        }
        let group = value(oakley::GROUP_DESCRIPTION)
            .and_then(|g| u16::try_from(g).ok())
            .and_then(|g| DhGroup::from_id(g).ok())
            .ok_or(Error::NoProposalChosen)?;
        let lifetime = match value(oakley::LIFE_TYPE) {
            None => 0,
            Some(t) if t == u32::from(oakley::LIFE_SECONDS) => {
                value(oakley::LIFE_DURATION).ok_or(Error::NoProposalChosen)?
            }
            Some(_) => return Err(Error::NoProposalChosen),
        };

        Ok(Phase1Proposal {
            encryption,
            hash,
            group,
            lifetime,
        })
    }
}

/// Transport protocol and port a policy allows phase 2 negotiation for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phase2Id {
    /// Transport protocol, 0 for any
    pub protocol: u8,
    /// Port, 0 for any
    pub port: u16,
}

impl Phase2Id {
    /// Whether the requested traffic falls under this entry
    pub fn permits(&self, selector: &Selector) -> bool {
        (self.protocol == WILDCARD || self.protocol == selector.protocol)
            && (self.port == 0 || self.port == selector.destination_port)
    }
}

/// Informational exchanges a policy allows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InfoFlags {
    /// Error notifications while phase 1 is running
    pub phase1: bool,
    /// Error notifications during quick mode, and delete notifications
    pub phase2: bool,
}

/// IKE policy for a set of peers
#[derive(Clone)]
pub struct IkePolicy {
    /// Index within the group, assigned on insertion
    pub index: u32,
    /// Peers the policy applies to
    pub peer: AddrSpec,
    /// Phase 1 modes allowed; the first one is used when initiating
    pub modes: Vec<Phase1Mode>,
    /// Phase 1 proposals in preference order
    pub proposals: Vec<Phase1Proposal>,
    /// Pre-shared key
    pub psk: Zeroizing<Vec<u8>>,
    /// Traffic phase 2 may be negotiated for; empty allows everything
    pub phase2_ids: Vec<Phase2Id>,
    /// Informational exchanges allowed
    pub info: InfoFlags,
}

impl std::fmt::Debug for IkePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IkePolicy")
            .field("index", &self.index)
            .field("peer", &self.peer)
            .field("modes", &self.modes)
            .field("proposals", &self.proposals)
            .field("phase2_ids", &self.phase2_ids)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl IkePolicy {
    /// Policy for `peer` authenticated with `psk`, allowing main mode
    pub fn new(peer: AddrSpec, psk: &[u8]) -> Self {
        IkePolicy {
            index: 0,
            peer,
            modes: vec![Phase1Mode::Main],
            proposals: Vec::new(),
            psk: Zeroizing::new(psk.to_vec()),
            phase2_ids: Vec::new(),
            info: InfoFlags {
                phase1: true,
                phase2: true,
            },
        }
    }

    /// Replace the allowed modes
    pub fn with_modes(mut self, modes: &[Phase1Mode]) -> Self {
        self.modes = modes.to_vec();
        self
    }

    /// Add a phase 1 proposal
    pub fn with_proposal(mut self, proposal: Phase1Proposal) -> Self {
        self.proposals.push(proposal);
        self
    }

    /// Restrict phase 2 to a protocol and port
    pub fn with_phase2_id(mut self, protocol: u8, port: u16) -> Self {
        self.phase2_ids.push(Phase2Id { protocol, port });
        self
    }

    /// Set which informational exchanges are allowed
    pub fn with_info(mut self, info: InfoFlags) -> Self {
        self.info = info;
        self
    }

    /// Check the policy before it is installed
    pub fn validate(&self, max_transforms: usize) -> Result<()> {
        self.peer.validate()?;
        if self.modes.is_empty() {
            return Err(Error::InvalidParameter("no phase 1 mode allowed".into()));
        }
        if self.proposals.is_empty() || self.proposals.len() > max_transforms {
            return Err(Error::InvalidParameter(format!(
                "1..={} phase 1 proposals required",
                max_transforms
            )));
        }
        if self.psk.is_empty() {
            return Err(Error::InvalidParameter("empty pre-shared key".into()));
        }
        self.proposals.iter().try_for_each(Phase1Proposal::validate)
    }

    /// Whether `mode` may be used with this policy
    pub fn allows_mode(&self, mode: Phase1Mode) -> bool {
        self.modes.contains(&mode)
    }

    /// Mode used when this host initiates
    ///
    /// Main mode wins whenever it is allowed.
    pub fn initiator_mode(&self) -> Phase1Mode {
        if self.allows_mode(Phase1Mode::Main) || self.modes.is_empty() {
            Phase1Mode::Main
        } else {
            Phase1Mode::Aggressive
        }
    }

    /// Whether phase 2 may be negotiated for `selector`
    pub fn permits(&self, selector: &Selector) -> bool {
        self.phase2_ids.is_empty() || self.phase2_ids.iter().any(|id| id.permits(selector))
    }

    /// Pick the first offered proposal that matches one of ours
    ///
    /// The accepted lifetime is the shorter of both.
    pub fn choose(&self, offered: &[Phase1Proposal]) -> Result<Phase1Proposal> {
        for theirs in offered {
            if let Some(ours) = self.proposals.iter().find(|p| p.same_algorithms(theirs)) {
                let lifetime = match theirs.lifetime {
                    0 => ours.lifetime,
                    t => t.min(ours.lifetime),
                };
                return Ok(Phase1Proposal { lifetime, ..*theirs });
            }
        }
        Err(Error::NoProposalChosen)
    }
}

/// Named set of IKE policies
#[derive(Debug)]
pub struct IkeGroup {
    name: String,
    policies: Vec<IkePolicy>,
    next_index: u32,
}

impl Named for IkeGroup {
    fn name(&self) -> &str {
        &self.name
    }
}

impl IkeGroup {
    /// Create an empty group
    pub fn new(name: &str) -> Self {
        IkeGroup {
            name: name.to_string(),
            policies: Vec::new(),
            next_index: 1,
        }
    }

    /// Append a policy and return its index
    pub fn add_policy(&mut self, mut policy: IkePolicy) -> u32 {
        let index = self.next_index;
        self.next_index = self.next_index.wrapping_add(1).max(1);
        policy.index = index;
        self.policies.push(policy);
        index
    }

    /// Remove a policy by index
    pub fn remove_policy(&mut self, index: u32) -> Result<IkePolicy> {
        let pos = self
            .policies
            .iter()
            .position(|p| p.index == index)
            .ok_or(Error::PolicyNotFound)?;
        Ok(self.policies.remove(pos))
    }

    /// Policy by index
    pub fn policy(&self, index: u32) -> Option<&IkePolicy> {
        self.policies.iter().find(|p| p.index == index)
    }

    /// First policy covering `peer`
    pub fn policy_for_peer(&self, peer: &IpAddr) -> Option<&IkePolicy> {
        self.policies.iter().find(|p| p.peer.contains_addr(peer))
    }

    /// Number of policies
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether the group has no policies
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
