//! Traffic selectors
//!
//! A selector describes a set of packets by source and destination address,
//! transport protocol and ports (or ICMP type and code). Policies and SAs
//! both carry one; packets are reduced to a selector whose addresses are
//! single hosts before being matched.
//!
//! Address specifications:
//!
//! ```text
//! Any                       every address of either family
//! Single(a)                 exactly a
//! Range(lo, hi)             lo <= x <= hi
//! Subnet(a, prefix_len)     x & mask(prefix_len) == a & mask(prefix_len)
//! ```
//!
//! A value of zero for the protocol or a port is a wildcard.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::{
    ip::{IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_IGMP, IPPROTO_TCP, IPPROTO_UDP},
    Error, Result,
};

/// Wildcard value for protocol and ports
pub const WILDCARD: u8 = 0;

/// Address family of an address specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl IpFamily {
    /// Family of an address
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    /// Address width in bits
    pub fn bits(self) -> u8 {
        match self {
            IpFamily::V4 => 32,
            IpFamily::V6 => 128,
        }
    }

    /// Unspecified address of this family
    pub fn unspecified(self) -> IpAddr {
        match self {
            IpFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

/// Address part of a selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddrSpec {
    /// Any address
    #[default]
    Any,
    /// A single host
    Single(IpAddr),
    /// Inclusive address range
    Range(IpAddr, IpAddr),
    /// Network prefix
    Subnet(IpAddr, u8),
}

fn addr_bits(addr: &IpAddr) -> u128 {
    match addr {
        IpAddr::V4(a) => u32::from(*a) as u128,
        IpAddr::V6(a) => u128::from(*a),
    }
}

fn prefix_mask(family: IpFamily, prefix_len: u8) -> u128 {
    let width = family.bits() as u32;
    let prefix = (prefix_len as u32).min(width);
    if prefix == 0 {
        return 0;
    }
    let all = if width == 128 { u128::MAX } else { (1u128 << width) - 1 };
    all & !((1u128 << (width - prefix)) - 1)
}

impl AddrSpec {
    /// Family of the specification, `None` for [`AddrSpec::Any`]
    pub fn family(&self) -> Option<IpFamily> {
        match self {
            AddrSpec::Any => None,
            AddrSpec::Single(a) | AddrSpec::Range(a, _) | AddrSpec::Subnet(a, _) => {
                Some(IpFamily::of(a))
            }
        }
    }

    /// The host address if this is a single address
    pub fn single(&self) -> Option<IpAddr> {
        match self {
            AddrSpec::Single(a) => Some(*a),
            _ => None,
        }
    }

    /// First address of the specification
    pub fn first(&self) -> Option<IpAddr> {
        match self {
            AddrSpec::Any => None,
            AddrSpec::Single(a) | AddrSpec::Range(a, _) | AddrSpec::Subnet(a, _) => Some(*a),
        }
    }

    // Inclusive numeric bounds within the family
    fn bounds(&self) -> Option<(IpFamily, u128, u128)> {
        match self {
            AddrSpec::Any => None,
            AddrSpec::Single(a) => {
                let v = addr_bits(a);
                Some((IpFamily::of(a), v, v))
            }
            AddrSpec::Range(lo, hi) => Some((IpFamily::of(lo), addr_bits(lo), addr_bits(hi))),
            AddrSpec::Subnet(a, prefix_len) => {
                let family = IpFamily::of(a);
                let mask = prefix_mask(family, *prefix_len);
                let width_mask = if family == IpFamily::V6 {
                    u128::MAX
                } else {
                    u32::MAX as u128
                };
                let net = addr_bits(a) & mask;
                Some((family, net, net | (!mask & width_mask)))
            }
        }
    }

    /// Check that the specification is well formed
    pub fn validate(&self) -> Result<()> {
        match self {
            AddrSpec::Any | AddrSpec::Single(_) => Ok(()),
            AddrSpec::Range(lo, hi) => {
                if IpFamily::of(lo) != IpFamily::of(hi) {
                    return Err(Error::InvalidParameter(
                        "address range mixes families".into(),
                    ));
                }
                if addr_bits(lo) > addr_bits(hi) {
                    return Err(Error::InvalidParameter("address range is inverted".into()));
                }
                Ok(())
            }
            AddrSpec::Subnet(a, prefix_len) => {
                if *prefix_len > IpFamily::of(a).bits() {
                    return Err(Error::InvalidParameter(format!(
                        "prefix length {} too long",
                        prefix_len
                    )));
                }
                Ok(())
            }
        }
    }

    /// Whether `addr` lies within the specification
    pub fn contains_addr(&self, addr: &IpAddr) -> bool {
        self.contains(&AddrSpec::Single(*addr))
    }

    /// Whether every address of `other` lies within the specification
    ///
    /// Only [`AddrSpec::Any`] contains [`AddrSpec::Any`]; addresses of
    /// different families never match.
    pub fn contains(&self, other: &AddrSpec) -> bool {
        match (self.bounds(), other.bounds()) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some((fam, lo, hi)), Some((other_fam, other_lo, other_hi))) => {
                fam == other_fam && lo <= other_lo && other_hi <= hi
            }
        }
    }
}

/// Packet or policy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Selector {
    /// Source addresses
    pub source: AddrSpec,

    /// Destination addresses
    pub destination: AddrSpec,

    /// Transport protocol, [`WILDCARD`] for any
    pub protocol: u8,

    /// Source port, 0 for any
    pub source_port: u16,

    /// Destination port, 0 for any
    pub destination_port: u16,

    /// ICMP message type, `None` for any
    pub icmp_type: Option<u8>,

    /// ICMP message code, `None` for any
    pub icmp_code: Option<u8>,
}

impl Selector {
    /// Create a selector matching every protocol and port between two
    /// address specifications
    pub fn new(source: AddrSpec, destination: AddrSpec) -> Self {
        Selector {
            source,
            destination,
            ..Default::default()
        }
    }

    /// Selector between two single hosts
    pub fn hosts(source: IpAddr, destination: IpAddr) -> Self {
        Self::new(AddrSpec::Single(source), AddrSpec::Single(destination))
    }

    /// Restrict to a transport protocol
    pub fn with_protocol(mut self, protocol: u8) -> Self {
        self.protocol = protocol;
        self
    }

    /// Restrict to source and destination ports
    pub fn with_ports(mut self, source_port: u16, destination_port: u16) -> Self {
        self.source_port = source_port;
        self.destination_port = destination_port;
        self
    }

    /// Restrict to an ICMP type and code
    pub fn with_icmp(mut self, icmp_type: Option<u8>, icmp_code: Option<u8>) -> Self {
        self.icmp_type = icmp_type;
        self.icmp_code = icmp_code;
        self
    }

    /// Swap the source and destination sides
    pub fn swapped(&self) -> Selector {
        Selector {
            source: self.destination,
            destination: self.source,
            source_port: self.destination_port,
            destination_port: self.source_port,
            ..*self
        }
    }

    fn is_icmp(&self) -> bool {
        self.protocol == IPPROTO_ICMP || self.protocol == IPPROTO_ICMPV6
    }

    /// Match a packet selector against this (policy or SA) selector
    ///
    /// With `swap` set the packet's sides are exchanged before comparing,
    /// which is how inbound traffic is matched against a dual-asynchronous
    /// policy written from the outbound point of view.
    pub fn matches(&self, packet: &Selector, swap: bool) -> bool {
        if self.protocol != WILDCARD && self.protocol != packet.protocol {
            return false;
        }

        let (pkt_src, pkt_dst, pkt_sport, pkt_dport) = if swap {
            (
                &packet.destination,
                &packet.source,
                packet.destination_port,
                packet.source_port,
            )
        } else {
            (
                &packet.source,
                &packet.destination,
                packet.source_port,
                packet.destination_port,
            )
        };

        if self.is_icmp() {
            let type_ok = self.icmp_type.map_or(true, |t| Some(t) == packet.icmp_type);
            let code_ok = self.icmp_code.map_or(true, |c| Some(c) == packet.icmp_code);
            if !(type_ok && code_ok) {
                return false;
            }
        } else {
            if self.source_port != 0 && self.source_port != pkt_sport {
                return false;
            }
            if self.destination_port != 0 && self.destination_port != pkt_dport {
                return false;
            }
        }

        self.source.contains(pkt_src) && self.destination.contains(pkt_dst)
    }

    /// Validate address specifications and the transport protocol
    pub fn validate(&self) -> Result<()> {
        self.source.validate()?;
        self.destination.validate()?;

        if let (Some(src), Some(dst)) = (self.source.family(), self.destination.family()) {
            if src != dst {
                return Err(Error::InvalidParameter(
                    "selector mixes address families".into(),
                ));
            }
        }

        match self.protocol {
            WILDCARD | IPPROTO_ICMP | IPPROTO_IGMP | IPPROTO_TCP | IPPROTO_UDP
            | IPPROTO_ICMPV6 => Ok(()),
            other => Err(Error::InvalidParameter(format!(
                "unsupported transport protocol {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_single_and_any() {
        let spec = AddrSpec::Single(v4("10.0.0.1"));
        assert!(spec.contains_addr(&v4("10.0.0.1")));
        assert!(!spec.contains_addr(&v4("10.0.0.2")));
        assert!(AddrSpec::Any.contains_addr(&v4("1.2.3.4")));
        assert!(!spec.contains(&AddrSpec::Any));
    }

    #[test]
    fn test_range() {
        let spec = AddrSpec::Range(v4("10.0.0.10"), v4("10.0.0.20"));
        assert!(spec.contains_addr(&v4("10.0.0.10")));
        assert!(spec.contains_addr(&v4("10.0.0.20")));
        assert!(!spec.contains_addr(&v4("10.0.0.21")));
        assert!(spec.contains(&AddrSpec::Range(v4("10.0.0.12"), v4("10.0.0.15"))));
        assert!(!spec.contains(&AddrSpec::Range(v4("10.0.0.12"), v4("10.0.0.25"))));
    }

    #[test]
    fn test_subnet() {
        let spec = AddrSpec::Subnet(v4("192.168.1.77"), 24);
        assert!(spec.contains_addr(&v4("192.168.1.0")));
        assert!(spec.contains_addr(&v4("192.168.1.255")));
        assert!(!spec.contains_addr(&v4("192.168.2.1")));
        assert!(spec.contains(&AddrSpec::Subnet(v4("192.168.1.128"), 25)));
        assert!(AddrSpec::Subnet(v4("1.2.3.4"), 0).contains_addr(&v4("200.1.1.1")));
        assert!(AddrSpec::Subnet(v4("1.2.3.4"), 32).contains_addr(&v4("1.2.3.4")));
        assert!(!AddrSpec::Subnet(v4("1.2.3.4"), 32).contains_addr(&v4("1.2.3.5")));
    }

    #[test]
    fn test_ipv6_subnet() {
        let spec = AddrSpec::Subnet("2001:db8::".parse().unwrap(), 32);
        assert!(spec.contains_addr(&"2001:db8:1::1".parse().unwrap()));
        assert!(!spec.contains_addr(&"2001:db9::1".parse().unwrap()));
        assert!(!spec.contains_addr(&v4("10.0.0.1")));
        assert!(AddrSpec::Subnet("::".parse().unwrap(), 128)
            .contains_addr(&"::".parse().unwrap()));
    }

    #[test]
    fn test_validate() {
        assert!(AddrSpec::Range(v4("10.0.0.2"), v4("10.0.0.1")).validate().is_err());
        assert!(AddrSpec::Range(v4("10.0.0.1"), "::1".parse().unwrap())
            .validate()
            .is_err());
        assert!(AddrSpec::Subnet(v4("10.0.0.0"), 33).validate().is_err());

        let sel = Selector::hosts(v4("10.0.0.1"), "::1".parse().unwrap());
        assert!(sel.validate().is_err());

        let sel = Selector::hosts(v4("10.0.0.1"), v4("10.0.0.2")).with_protocol(99);
        assert!(sel.validate().is_err());
        assert!(sel.with_protocol(IPPROTO_UDP).validate().is_ok());
    }

    #[test]
    fn test_ports_and_protocol() {
        let policy = Selector::new(AddrSpec::Any, AddrSpec::Subnet(v4("10.1.0.0"), 16))
            .with_protocol(IPPROTO_TCP)
            .with_ports(0, 80);

        let pkt = Selector::hosts(v4("10.0.0.1"), v4("10.1.2.3"))
            .with_protocol(IPPROTO_TCP)
            .with_ports(40000, 80);
        assert!(policy.matches(&pkt, false));
        assert!(!policy.matches(&pkt.with_ports(40000, 443), false));
        assert!(!policy.matches(&pkt.with_protocol(IPPROTO_UDP), false));
    }

    #[test]
    fn test_swapped_match() {
        let policy = Selector::hosts(v4("10.0.0.1"), v4("10.0.0.2"))
            .with_protocol(IPPROTO_UDP)
            .with_ports(500, 0);

        // reply traffic travelling the other way
        let pkt = Selector::hosts(v4("10.0.0.2"), v4("10.0.0.1"))
            .with_protocol(IPPROTO_UDP)
            .with_ports(1234, 500);
        assert!(!policy.matches(&pkt, false));
        assert!(policy.matches(&pkt, true));
        assert_eq!(pkt.swapped().swapped(), pkt);
    }

    #[test]
    fn test_icmp() {
        let policy = Selector::new(AddrSpec::Any, AddrSpec::Any)
            .with_protocol(IPPROTO_ICMP)
            .with_icmp(Some(8), None);
        let echo = Selector::hosts(v4("1.1.1.1"), v4("2.2.2.2"))
            .with_protocol(IPPROTO_ICMP)
            .with_icmp(Some(8), Some(0));
        assert!(policy.matches(&echo, false));
        assert!(!policy.matches(&echo.with_icmp(Some(0), Some(0)), false));
    }
}
