//! Security policies
//!
//! A policy binds a [`Selector`] to an action. `Apply` policies also carry
//! the ordered list of security protocols that make up the SA bundle: the
//! first entry is applied first on output (innermost), so on input the
//! outermost header corresponds to the last entry.

use std::net::IpAddr;
use std::time::Instant;

use super::{
    crypto::{AuthAlgorithm, EncryptAlgorithm},
    ike::dh::DhGroup,
    ip::{IPPROTO_AH, IPPROTO_ESP},
    selector::Selector,
    Error, Result,
};

/// What happens to traffic matching a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    /// Drop the packet
    Discard,
    /// Pass the packet without protection
    Bypass,
    /// Protect the packet with the policy's SA bundle
    Apply,
}

/// Traffic direction of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Received traffic
    Inbound,
    /// Transmitted traffic
    Outbound,
}

/// Directions a policy applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyFlow {
    /// Received traffic only
    Inbound,
    /// Transmitted traffic only
    Outbound,
    /// Both directions; inbound packets are matched with their sides swapped
    DualAsynchronous,
}

impl PolicyFlow {
    /// Whether the policy is consulted for `direction`
    pub fn covers(self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (PolicyFlow::DualAsynchronous, _)
                | (PolicyFlow::Inbound, Direction::Inbound)
                | (PolicyFlow::Outbound, Direction::Outbound)
        )
    }

    /// Whether inbound packets are matched with swapped sides
    pub fn swaps_inbound(self) -> bool {
        self == PolicyFlow::DualAsynchronous
    }
}

/// IPsec protocol of one bundle entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpsecProtocol {
    /// Authentication Header (RFC 4302)
    Ah,
    /// Encapsulating Security Payload (RFC 4303)
    Esp,
}

impl IpsecProtocol {
    /// IP protocol number
    pub fn ip_protocol(self) -> u8 {
        match self {
            IpsecProtocol::Ah => IPPROTO_AH,
            IpsecProtocol::Esp => IPPROTO_ESP,
        }
    }

    /// Protocol for an IP protocol number
    pub fn from_ip_protocol(value: u8) -> Option<Self> {
        match value {
            IPPROTO_AH => Some(IpsecProtocol::Ah),
            IPPROTO_ESP => Some(IpsecProtocol::Esp),
            _ => None,
        }
    }
}

/// Encapsulation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityMode {
    /// Protect the payload of the original packet
    Transport,
    /// Protect the whole packet inside a new outer header
    Tunnel,
}

/// Which selector fields of a new SA are taken from the triggering packet
/// instead of the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SaDerivation(u8);

impl SaDerivation {
    /// Every field from the policy
    pub const FROM_POLICY: SaDerivation = SaDerivation(0);
    /// Local address from the packet
    pub const LOCAL_ADDR: SaDerivation = SaDerivation(0x01);
    /// Remote address from the packet
    pub const REMOTE_ADDR: SaDerivation = SaDerivation(0x02);
    /// Next-layer protocol from the packet
    pub const NEXT_PROTOCOL: SaDerivation = SaDerivation(0x04);
    /// Local port from the packet
    pub const LOCAL_PORT: SaDerivation = SaDerivation(0x08);
    /// Remote port from the packet
    pub const REMOTE_PORT: SaDerivation = SaDerivation(0x10);
    /// Every field from the packet
    pub const FROM_PACKET: SaDerivation = SaDerivation(0x1F);

    /// Whether all flags of `other` are set
    pub fn contains(self, other: SaDerivation) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw flag bits
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Derive the selector used to look up or request SAs for `packet`
    pub fn derive(self, policy: &Selector, packet: &Selector) -> Selector {
        if self == SaDerivation::FROM_PACKET {
            return *packet;
        }

        let mut selector = *policy;
        if self.contains(SaDerivation::LOCAL_ADDR) {
            selector.source = packet.source;
        }
        if self.contains(SaDerivation::REMOTE_ADDR) {
            selector.destination = packet.destination;
        }
        if self.contains(SaDerivation::NEXT_PROTOCOL) {
            selector.protocol = packet.protocol;
        }
        if self.contains(SaDerivation::LOCAL_PORT) {
            selector.source_port = packet.source_port;
        }
        if self.contains(SaDerivation::REMOTE_PORT) {
            selector.destination_port = packet.destination_port;
        }
        selector
    }
}

impl std::ops::BitOr for SaDerivation {
    type Output = SaDerivation;

    fn bitor(self, rhs: SaDerivation) -> SaDerivation {
        SaDerivation(self.0 | rhs.0)
    }
}

/// One entry of a policy's SA bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SecurityProtocol {
    /// AH or ESP
    pub protocol: IpsecProtocol,

    /// Transport or tunnel mode
    pub mode: SecurityMode,

    /// Authentication algorithm; optional for ESP only
    pub auth: Option<AuthAlgorithm>,

    /// Encryption algorithm; ESP only
    pub encryption: Option<EncryptAlgorithm>,

    /// Local tunnel endpoint
    pub tunnel_source: Option<IpAddr>,

    /// Remote tunnel endpoint
    pub tunnel_destination: Option<IpAddr>,

    /// Selector derivation for SAs created from this entry
    pub sa_derivation: SaDerivation,
}

impl SecurityProtocol {
    /// AH in transport mode
    pub fn ah(auth: AuthAlgorithm) -> Self {
        SecurityProtocol {
            protocol: IpsecProtocol::Ah,
            mode: SecurityMode::Transport,
            auth: Some(auth),
            encryption: None,
            tunnel_source: None,
            tunnel_destination: None,
            sa_derivation: SaDerivation::FROM_PACKET,
        }
    }

    /// ESP in transport mode
    pub fn esp(encryption: EncryptAlgorithm, auth: Option<AuthAlgorithm>) -> Self {
        SecurityProtocol {
            protocol: IpsecProtocol::Esp,
            mode: SecurityMode::Transport,
            auth,
            encryption: Some(encryption),
            tunnel_source: None,
            tunnel_destination: None,
            sa_derivation: SaDerivation::FROM_PACKET,
        }
    }

    /// Switch to tunnel mode between two gateways
    pub fn tunnel(mut self, source: IpAddr, destination: IpAddr) -> Self {
        self.mode = SecurityMode::Tunnel;
        self.tunnel_source = Some(source);
        self.tunnel_destination = Some(destination);
        self
    }

    /// Set the SA selector derivation flags
    pub fn with_derivation(mut self, derivation: SaDerivation) -> Self {
        self.sa_derivation = derivation;
        self
    }

    /// Whether the entry uses tunnel mode
    pub fn is_tunnel(&self) -> bool {
        self.mode == SecurityMode::Tunnel
    }

    /// The same entry seen from the peer: tunnel endpoints exchanged
    pub fn mirrored(&self) -> Self {
        SecurityProtocol {
            tunnel_source: self.tunnel_destination,
            tunnel_destination: self.tunnel_source,
            ..*self
        }
    }

    /// Check protocol, algorithm and mode consistency
    pub fn validate(&self) -> Result<()> {
        match self.protocol {
            IpsecProtocol::Ah => {
                if self.auth.is_none() {
                    return Err(Error::InvalidParameter(
                        "AH requires an authentication algorithm".into(),
                    ));
                }
                if self.encryption.is_some() {
                    return Err(Error::InvalidParameter("AH cannot encrypt".into()));
                }
            }
            IpsecProtocol::Esp => {
                let encryption = self.encryption.ok_or_else(|| {
                    Error::InvalidParameter("ESP requires an encryption algorithm".into())
                })?;
                if encryption.is_null() && self.auth.is_none() {
                    return Err(Error::InvalidParameter(
                        "ESP with NULL encryption requires authentication".into(),
                    ));
                }
            }
        }

        if self.is_tunnel() {
            match (self.tunnel_source, self.tunnel_destination) {
                (Some(src), Some(dst)) if src.is_ipv4() == dst.is_ipv4() => {}
                _ => {
                    return Err(Error::InvalidParameter(
                        "tunnel mode requires endpoints of one family".into(),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Whether two entries describe the same protection
    ///
    /// Tunnel endpoints are compared only in tunnel mode.
    pub fn same_protection(&self, other: &SecurityProtocol) -> bool {
        if self.protocol != other.protocol
            || self.mode != other.mode
            || self.auth != other.auth
            || self.encryption != other.encryption
        {
            return false;
        }
        !self.is_tunnel() || self.tunnel_destination == other.tunnel_destination
    }
}

/// What to do when an SA lifetime expires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpiryAction {
    /// Nothing is scheduled
    #[default]
    None,
    /// Log a warning at soft expiry
    LogWarning,
    /// Ask IKE for fresh SAs at soft expiry
    Refresh,
}

/// Lifetime of the SAs created for a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Lifetime {
    /// Lifetime in seconds, 0 for unlimited
    pub seconds: u32,

    /// Action at expiry
    pub expiry: ExpiryAction,
}

impl Lifetime {
    /// Lifetime of `seconds` with an expiry action
    pub fn new(seconds: u32, expiry: ExpiryAction) -> Self {
        Lifetime { seconds, expiry }
    }
}

/// Outbound SA bundle: one SA index per security entry
///
/// An index of zero means "not resolved yet"; indices that no longer
/// resolve (after a rehash) are reset and looked up again by selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundBundle {
    /// Selector the bundle was created for
    pub selector: Selector,

    /// SA index per security entry
    pub sa_indexes: Vec<u32>,

    /// Earliest time the next SA request may be sent
    pub next_request: Option<Instant>,
}

impl OutboundBundle {
    /// Create an empty bundle for `size` security entries
    pub fn new(selector: Selector, size: usize) -> Self {
        OutboundBundle {
            selector,
            sa_indexes: vec![0; size],
            next_request: None,
        }
    }
}

/// Security policy
#[derive(Debug, Clone)]
pub struct Policy {
    /// Index unique within the group, assigned on insertion
    pub index: u32,

    /// Traffic covered by the policy
    pub selector: Selector,

    /// Action
    pub action: PolicyAction,

    /// Directions covered
    pub flow: PolicyFlow,

    /// SA bundle (Apply only), innermost first
    pub security: Vec<SecurityProtocol>,

    /// Lifetime of SAs created for this policy
    pub lifetime: Lifetime,

    /// Diffie-Hellman group for Quick mode PFS
    pub pfs_group: Option<DhGroup>,

    /// Priority; higher values are consulted first when enabled
    pub priority: u8,

    /// Outbound bundles created for this policy
    pub bundles: Vec<OutboundBundle>,
}

impl Policy {
    /// Create a policy without security protocols
    pub fn new(selector: Selector, action: PolicyAction, flow: PolicyFlow) -> Self {
        Policy {
            index: 0,
            selector,
            action,
            flow,
            security: Vec::new(),
            lifetime: Lifetime::default(),
            pfs_group: None,
            priority: 0,
            bundles: Vec::new(),
        }
    }

    /// Add a security protocol to the bundle
    pub fn with_security(mut self, security: SecurityProtocol) -> Self {
        self.security.push(security);
        self
    }

    /// Set the SA lifetime
    pub fn with_lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Set the PFS group
    pub fn with_pfs(mut self, group: DhGroup) -> Self {
        self.pfs_group = Some(group);
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Validate the policy before insertion
    ///
    /// # Errors
    ///
    /// - `Error::BundleTooLarge` if more than `max_bundle` security entries
    /// - `Error::InvalidParameter` for a bypass/discard policy with security
    ///   entries, an apply policy without them, a zero lifetime or an invalid
    ///   selector or security entry
    pub fn validate(&self, max_bundle: usize, soft_offset_secs: u32) -> Result<()> {
        if self.security.len() > max_bundle {
            return Err(Error::BundleTooLarge {
                max: max_bundle,
                requested: self.security.len(),
            });
        }

        match self.action {
            PolicyAction::Bypass | PolicyAction::Discard if !self.security.is_empty() => {
                return Err(Error::InvalidParameter(
                    "only apply policies carry security protocols".into(),
                ));
            }
            PolicyAction::Apply if self.security.is_empty() => {
                return Err(Error::InvalidParameter(
                    "apply policy without security protocols".into(),
                ));
            }
            _ => {}
        }

        if !self.security.is_empty() {
            if self.lifetime.seconds == 0 {
                return Err(Error::InvalidParameter(
                    "SA lifetime must be set when security is present".into(),
                ));
            }
            if self.lifetime.expiry == ExpiryAction::None
                && self.lifetime.seconds < 2 * soft_offset_secs
            {
                return Err(Error::InvalidParameter(
                    "SA lifetime shorter than twice the soft offset".into(),
                ));
            }
            for security in &self.security {
                security.validate()?;
            }
        }

        self.selector.validate()
    }

    /// Whether an inbound SA list (outermost first) satisfies the bundle
    ///
    /// Dual policies list tunnel endpoints from the sending side, so the
    /// endpoints are mirrored before comparing with received SAs.
    pub fn matches_inbound_bundle(&self, applied: &[SecurityProtocol]) -> bool {
        let swap = self.flow.swaps_inbound();
        applied.len() == self.security.len()
            && self
                .security
                .iter()
                .rev()
                .zip(applied)
                .all(|(expected, got)| {
                    if swap {
                        expected.mirrored().same_protection(got)
                    } else {
                        expected.same_protection(got)
                    }
                })
    }
}
