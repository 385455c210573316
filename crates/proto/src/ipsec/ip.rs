//! IPv4 / IPv6 header handling for the transform engine
//!
//! The transforms never build a full IP stack view of a packet. They need
//! four things: where the IPsec header goes, which byte holds the
//! next-header value to patch, which header fields are mutable in transit
//! (and therefore excluded from the AH digest) and how to fix up the
//! length and checksum fields afterwards.
//!
//! ```text
//! IPv4:  | ver/ihl | tos* | total len | id | flags/frag* | ttl* | proto | csum* | src | dst | options |
//! IPv6:  | ver | class* | flow* | payload len | next | hop* | src | dst | ext headers ... |
//!                                                     (* = mutable, zeroed for AH)
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::{
    buffer::BufferChain,
    selector::{IpFamily, Selector},
    Error, Result,
};

/// IPv6 hop-by-hop options
pub const IPPROTO_HOPOPTS: u8 = 0;
/// ICMP
pub const IPPROTO_ICMP: u8 = 1;
/// IGMP
pub const IPPROTO_IGMP: u8 = 2;
/// IPv4 in IP
pub const IPPROTO_IPIP: u8 = 4;
/// TCP
pub const IPPROTO_TCP: u8 = 6;
/// UDP
pub const IPPROTO_UDP: u8 = 17;
/// IPv6 in IP
pub const IPPROTO_IPV6: u8 = 41;
/// IPv6 routing header
pub const IPPROTO_ROUTING: u8 = 43;
/// IPv6 fragment header
pub const IPPROTO_FRAGMENT: u8 = 44;
/// ESP
pub const IPPROTO_ESP: u8 = 50;
/// AH
pub const IPPROTO_AH: u8 = 51;
/// ICMPv6
pub const IPPROTO_ICMPV6: u8 = 58;
/// IPv6 destination options
pub const IPPROTO_DSTOPTS: u8 = 60;

/// IPv4 base header length
pub const IPV4_HEADER_LEN: usize = 20;
/// IPv6 base header length
pub const IPV6_HEADER_LEN: usize = 40;

/// TTL / hop limit of outer tunnel headers
pub const DEFAULT_TTL: u8 = 64;

/// Parsed view of the IP headers of a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpHeader {
    /// Address family
    pub family: IpFamily,

    /// Bytes preceding the insertion point of an IPsec header
    pub header_len: usize,

    /// Protocol found at the insertion point
    pub next_header: u8,

    /// Offset of the byte holding `next_header`
    pub next_header_offset: usize,

    /// Source address
    pub source: IpAddr,

    /// Destination address
    pub destination: IpAddr,

    /// Packet length according to the header
    pub total_len: usize,
}

impl IpHeader {
    /// Number of bytes following the insertion point
    pub fn payload_len(&self) -> usize {
        self.total_len - self.header_len
    }
}

fn read_v4(chain: &BufferChain, offset: usize) -> Result<Ipv4Addr> {
    let mut buf = [0u8; 4];
    chain.read_at(offset, &mut buf)?;
    Ok(Ipv4Addr::from(buf))
}

fn read_v6(chain: &BufferChain, offset: usize) -> Result<Ipv6Addr> {
    let mut buf = [0u8; 16];
    chain.read_at(offset, &mut buf)?;
    Ok(Ipv6Addr::from(buf))
}

/// Address family of the packet in `chain`
pub fn family(chain: &BufferChain) -> Result<IpFamily> {
    match chain.read_u8(0)? >> 4 {
        4 => Ok(IpFamily::V4),
        6 => Ok(IpFamily::V6),
        v => Err(Error::Malformed(format!("IP version {}", v))),
    }
}

/// Parse the IP headers of a packet
///
/// For IPv6 the extension headers that precede an IPsec header
/// (hop-by-hop, routing, fragment and destination options followed by a
/// routing header) are walked.
///
/// # Errors
///
/// Returns `Error::Malformed` or `Error::BufferTooShort` for any
/// inconsistency between the header fields and the buffer.
pub fn parse(chain: &BufferChain) -> Result<IpHeader> {
    match family(chain)? {
        IpFamily::V4 => parse_v4(chain),
        IpFamily::V6 => parse_v6(chain),
    }
}

fn parse_v4(chain: &BufferChain) -> Result<IpHeader> {
    if chain.len() < IPV4_HEADER_LEN {
        return Err(Error::BufferTooShort {
            required: IPV4_HEADER_LEN,
            available: chain.len(),
        });
    }
    let ihl = ((chain.read_u8(0)? & 0x0F) as usize) * 4;
    let total_len = chain.read_u16(2)? as usize;
    if ihl < IPV4_HEADER_LEN || total_len < ihl {
        return Err(Error::Malformed("IPv4 header length".into()));
    }
    if total_len > chain.len() {
        return Err(Error::BufferTooShort {
            required: total_len,
            available: chain.len(),
        });
    }

    Ok(IpHeader {
        family: IpFamily::V4,
        header_len: ihl,
        next_header: chain.read_u8(9)?,
        next_header_offset: 9,
        source: IpAddr::V4(read_v4(chain, 12)?),
        destination: IpAddr::V4(read_v4(chain, 16)?),
        total_len,
    })
}

fn parse_v6(chain: &BufferChain) -> Result<IpHeader> {
    if chain.len() < IPV6_HEADER_LEN {
        return Err(Error::BufferTooShort {
            required: IPV6_HEADER_LEN,
            available: chain.len(),
        });
    }
    let total_len = chain.read_u16(4)? as usize + IPV6_HEADER_LEN;
    if total_len > chain.len() {
        return Err(Error::BufferTooShort {
            required: total_len,
            available: chain.len(),
        });
    }

    let mut next = chain.read_u8(6)?;
    let mut next_offset = 6;
    let mut offset = IPV6_HEADER_LEN;
    loop {
        let ext_len = match next {
            IPPROTO_HOPOPTS | IPPROTO_ROUTING => (chain.read_u8(offset + 1)? as usize + 1) * 8,
            IPPROTO_FRAGMENT => 8,
            IPPROTO_DSTOPTS => {
                // only destination options ahead of a routing header precede IPsec
                if chain.read_u8(offset)? != IPPROTO_ROUTING {
                    break;
                }
                (chain.read_u8(offset + 1)? as usize + 1) * 8
            }
            _ => break,
        };
        if offset + ext_len > total_len {
            return Err(Error::Malformed("IPv6 extension header overruns packet".into()));
        }
        next_offset = offset;
        next = chain.read_u8(offset)?;
        offset += ext_len;
    }

    Ok(IpHeader {
        family: IpFamily::V6,
        header_len: offset,
        next_header: next,
        next_header_offset: next_offset,
        source: IpAddr::V6(read_v6(chain, 8)?),
        destination: IpAddr::V6(read_v6(chain, 24)?),
        total_len,
    })
}

/// Rewrite the next-header byte found by [`parse`]
pub fn set_next_header(chain: &mut BufferChain, header: &IpHeader, protocol: u8) -> Result<()> {
    chain.write_u8(header.next_header_offset, protocol)
}

/// Rewrite the length field for a packet of `total_len` bytes
pub fn set_total_len(chain: &mut BufferChain, family: IpFamily, total_len: usize) -> Result<()> {
    match family {
        IpFamily::V4 => {
            let len = u16::try_from(total_len)
                .map_err(|_| Error::InvalidParameter("IPv4 packet exceeds 65535 bytes".into()))?;
            chain.write_u16(2, len)
        }
        IpFamily::V6 => {
            let len = u16::try_from(total_len - IPV6_HEADER_LEN)
                .map_err(|_| Error::InvalidParameter("IPv6 payload exceeds 65535 bytes".into()))?;
            chain.write_u16(4, len)
        }
    }
}

/// Internet checksum (RFC 1071)
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Recompute the IPv4 header checksum; IPv6 has none
pub fn update_checksum(chain: &mut BufferChain) -> Result<()> {
    if family(chain)? != IpFamily::V4 {
        return Ok(());
    }
    let ihl = ((chain.read_u8(0)? & 0x0F) as usize) * 4;
    chain.write_u16(10, 0)?;
    let header = chain.copy_range(0, ihl)?;
    chain.write_u16(10, checksum(&header))
}

/// Mutable header bytes saved while an AH digest is computed
#[derive(Debug, Clone)]
pub struct MutableFields {
    saved: Vec<u8>,
}

/// Zero the fields that may change in transit
///
/// IPv4: type of service, flags and fragment offset, TTL and checksum.
/// IPv6: traffic class, flow label and hop limit. The previous values
/// are returned for [`restore_mutable`].
pub fn zero_mutable(chain: &mut BufferChain, family: IpFamily) -> Result<MutableFields> {
    match family {
        IpFamily::V4 => {
            let saved = chain.copy_range(0, 12)?;
            chain.write_u8(1, 0)?;
            chain.write_u16(6, 0)?;
            chain.write_u8(8, 0)?;
            chain.write_u16(10, 0)?;
            Ok(MutableFields { saved })
        }
        IpFamily::V6 => {
            let saved = chain.copy_range(0, 8)?;
            chain.write_u32(0, 0x6000_0000)?;
            chain.write_u8(7, 0)?;
            Ok(MutableFields { saved })
        }
    }
}

/// Restore fields saved by [`zero_mutable`]
///
/// Only the mutable bytes are written back, so length and next-header
/// changes made in between survive.
pub fn restore_mutable(chain: &mut BufferChain, fields: &MutableFields) -> Result<()> {
    let s = &fields.saved;
    if s.len() == 12 {
        chain.write_u8(1, s[1])?;
        chain.write_at(6, &s[6..9])?;
        chain.write_at(10, &s[10..12])
    } else {
        chain.write_at(0, &s[0..4])?;
        chain.write_u8(7, s[7])
    }
}

/// Build the selector of a packet for policy lookup
///
/// Addresses are single hosts; ports come from TCP/UDP headers and
/// type/code from ICMP headers when present.
pub fn packet_selector(chain: &BufferChain, header: &IpHeader) -> Selector {
    let mut selector = Selector::hosts(header.source, header.destination)
        .with_protocol(header.next_header);
    let at = header.header_len;

    match header.next_header {
        IPPROTO_TCP | IPPROTO_UDP => {
            if let (Ok(sport), Ok(dport)) = (chain.read_u16(at), chain.read_u16(at + 2)) {
                selector = selector.with_ports(sport, dport);
            }
        }
        IPPROTO_ICMP | IPPROTO_ICMPV6 => {
            if let (Ok(icmp_type), Ok(code)) = (chain.read_u8(at), chain.read_u8(at + 1)) {
                selector = selector.with_icmp(Some(icmp_type), Some(code));
            }
        }
        _ => {}
    }
    selector
}

/// Build an outer header for tunnel mode
///
/// # Errors
///
/// Returns `Error::InvalidParameter` if the endpoints are of different
/// families or the packet would exceed the length field.
pub fn build_outer_header(source: IpAddr, destination: IpAddr, inner_len: usize) -> Result<Vec<u8>> {
    match (source, destination) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let total = u16::try_from(inner_len + IPV4_HEADER_LEN)
                .map_err(|_| Error::InvalidParameter("tunnel packet too large".into()))?;
            let mut header = vec![0u8; IPV4_HEADER_LEN];
            header[0] = 0x45;
            header[2..4].copy_from_slice(&total.to_be_bytes());
            header[8] = DEFAULT_TTL;
            header[9] = IPPROTO_IPIP;
            header[12..16].copy_from_slice(&src.octets());
            header[16..20].copy_from_slice(&dst.octets());
            let csum = checksum(&header);
            header[10..12].copy_from_slice(&csum.to_be_bytes());
            Ok(header)
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let payload = u16::try_from(inner_len)
                .map_err(|_| Error::InvalidParameter("tunnel packet too large".into()))?;
            let mut header = vec![0u8; IPV6_HEADER_LEN];
            header[0] = 0x60;
            header[4..6].copy_from_slice(&payload.to_be_bytes());
            header[6] = IPPROTO_IPV6;
            header[7] = DEFAULT_TTL;
            header[8..24].copy_from_slice(&src.octets());
            header[24..40].copy_from_slice(&dst.octets());
            Ok(header)
        }
        _ => Err(Error::InvalidParameter(
            "tunnel endpoints of different families".into(),
        )),
    }
}

/// Protocol number announcing an encapsulated packet of `family`
pub fn encapsulation_protocol(family: IpFamily) -> u8 {
    match family {
        IpFamily::V4 => IPPROTO_IPIP,
        IpFamily::V6 => IPPROTO_IPV6,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// IPv4/UDP packet with `payload`
    pub(crate) fn udp_v4(src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let total = IPV4_HEADER_LEN + 8 + payload.len();
        let mut pkt = vec![0u8; total];
        pkt[0] = 0x45;
        pkt[1] = 0x10;
        pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        pkt[4..6].copy_from_slice(&0x1234u16.to_be_bytes());
        pkt[6] = 0x40;
        pkt[8] = 64;
        pkt[9] = IPPROTO_UDP;
        pkt[12..16].copy_from_slice(&src);
        pkt[16..20].copy_from_slice(&dst);
        let csum = checksum(&pkt[..IPV4_HEADER_LEN]);
        pkt[10..12].copy_from_slice(&csum.to_be_bytes());
        pkt[20..22].copy_from_slice(&5000u16.to_be_bytes());
        pkt[22..24].copy_from_slice(&53u16.to_be_bytes());
        pkt[24..26].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        pkt[28..].copy_from_slice(payload);
        pkt
    }

    /// IPv6/UDP packet with a hop-by-hop header and `payload`
    pub(crate) fn udp_v6_hbh(payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0u8; IPV6_HEADER_LEN + 8 + 8 + payload.len()];
        let plen = (8 + 8 + payload.len()) as u16;
        pkt[0] = 0x60;
        pkt[1] = 0x0A;
        pkt[4..6].copy_from_slice(&plen.to_be_bytes());
        pkt[6] = IPPROTO_HOPOPTS;
        pkt[7] = 255;
        pkt[8..24].copy_from_slice(&"2001:db8::1".parse::<Ipv6Addr>().unwrap().octets());
        pkt[24..40].copy_from_slice(&"2001:db8::2".parse::<Ipv6Addr>().unwrap().octets());
        // hop-by-hop: next = UDP, len 0, PadN
        pkt[40] = IPPROTO_UDP;
        pkt[42] = 1;
        pkt[43] = 4;
        pkt[48..50].copy_from_slice(&7000u16.to_be_bytes());
        pkt[50..52].copy_from_slice(&7001u16.to_be_bytes());
        pkt[52..54].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        pkt[56..].copy_from_slice(payload);
        pkt
    }

    #[test]
    fn test_parse_v4() {
        let pkt = udp_v4([10, 0, 0, 1], [10, 0, 0, 2], b"hello");
        let chain = BufferChain::segmented(&pkt, 7);
        let header = parse(&chain).unwrap();
        assert_eq!(header.family, IpFamily::V4);
        assert_eq!(header.header_len, 20);
        assert_eq!(header.next_header, IPPROTO_UDP);
        assert_eq!(header.total_len, pkt.len());
        assert_eq!(header.source, "10.0.0.1".parse::<IpAddr>().unwrap());

        let selector = packet_selector(&chain, &header);
        assert_eq!(selector.source_port, 5000);
        assert_eq!(selector.destination_port, 53);
    }

    #[test]
    fn test_parse_v6_walks_extension_headers() {
        let pkt = udp_v6_hbh(b"data");
        let chain = BufferChain::from_slice(&pkt);
        let header = parse(&chain).unwrap();
        assert_eq!(header.family, IpFamily::V6);
        assert_eq!(header.header_len, 48);
        assert_eq!(header.next_header, IPPROTO_UDP);
        assert_eq!(header.next_header_offset, 40);
        assert_eq!(packet_selector(&chain, &header).destination_port, 7001);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse(&BufferChain::from_slice(&[0x45; 10])).is_err());
        assert!(parse(&BufferChain::from_slice(&[0x25; 40])).is_err());

        let mut pkt = udp_v4([1, 1, 1, 1], [2, 2, 2, 2], b"x");
        pkt[2..4].copy_from_slice(&500u16.to_be_bytes());
        assert!(matches!(
            parse(&BufferChain::from_slice(&pkt)),
            Err(Error::BufferTooShort { .. })
        ));
    }

    #[test]
    fn test_checksum_valid() {
        let pkt = udp_v4([192, 168, 0, 1], [192, 168, 0, 199], b"");
        assert_eq!(checksum(&pkt[..20]), 0);

        let mut chain = BufferChain::from_slice(&pkt);
        chain.write_u8(8, 10).unwrap();
        update_checksum(&mut chain).unwrap();
        assert_eq!(checksum(&chain.to_vec()[..20]), 0);
    }

    #[test]
    fn test_zero_and_restore_mutable() {
        let pkt = udp_v4([1, 1, 1, 1], [2, 2, 2, 2], b"abc");
        let mut chain = BufferChain::segmented(&pkt, 5);
        let saved = zero_mutable(&mut chain, IpFamily::V4).unwrap();
        let zeroed = chain.to_vec();
        assert_eq!(zeroed[1], 0);
        assert_eq!(zeroed[6], 0);
        assert_eq!(zeroed[8], 0);
        assert_eq!(&zeroed[10..12], &[0, 0]);
        assert_eq!(zeroed[9], IPPROTO_UDP);

        chain.write_u8(9, IPPROTO_AH).unwrap();
        restore_mutable(&mut chain, &saved).unwrap();
        let restored = chain.to_vec();
        assert_eq!(restored[9], IPPROTO_AH);
        assert_eq!(&restored[..9], &pkt[..9]);
    }

    #[test]
    fn test_outer_header() {
        let header = build_outer_header(
            "1.1.1.1".parse().unwrap(),
            "2.2.2.2".parse().unwrap(),
            100,
        )
        .unwrap();
        assert_eq!(header.len(), 20);
        assert_eq!(u16::from_be_bytes([header[2], header[3]]), 120);
        assert_eq!(checksum(&header), 0);

        assert!(build_outer_header(
            "1.1.1.1".parse().unwrap(),
            "::1".parse().unwrap(),
            100
        )
        .is_err());
    }
}
