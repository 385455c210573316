//! ISAKMP payloads
//!
//! Implements the payloads defined in RFC 2408 Section 3 together with the
//! IPsec DOI specifics of RFC 2407 Section 4.6. A message body is first
//! split into [`RawPayload`]s by walking the generic payload headers; the
//! typed payloads are decoded from the raw bodies on demand, so hashes can
//! always be computed over the exact bytes that were received.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::constants::*;
use super::header::IsakmpHeader;
use crate::ipsec::selector::{AddrSpec, IpFamily};
use crate::ipsec::{Error, Result};

/// Most payloads accepted in one message
pub const MAX_PAYLOADS: usize = 32;

/// Largest SPI carried in proposals, notifications and deletes
pub const MAX_SPI_LEN: usize = 16;

/// Undecoded payload: type and body without the generic header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    /// Payload type
    pub kind: PayloadType,
    /// Payload body
    pub body: Vec<u8>,
}

impl RawPayload {
    /// Create a raw payload
    pub fn new(kind: PayloadType, body: Vec<u8>) -> Self {
        RawPayload { kind, body }
    }
}

/// Walk a chain of generic payload headers
///
/// Bytes left after the last payload are accepted only when
/// `allow_trailing` is set (padding of encrypted messages).
///
/// # Errors
///
/// Returns error if a header is truncated, a length is inconsistent, a
/// reserved field is set or a payload type is unknown or misplaced.
pub fn split_payloads(first: PayloadType, data: &[u8], allow_trailing: bool) -> Result<Vec<RawPayload>> {
    let mut payloads = Vec::new();
    let mut kind = first;
    let mut rest = data;

    while kind != PayloadType::None {
        if matches!(kind, PayloadType::Proposal | PayloadType::Transform) {
            return Err(Error::UnexpectedPayload(kind.to_u8()));
        }
        if payloads.len() == MAX_PAYLOADS {
            return Err(Error::InvalidPayload("too many payloads".into()));
        }
        let (next, body, tail) = split_generic(rest)?;
        let next = PayloadType::from_u8(next)
            .ok_or_else(|| Error::InvalidPayload(format!("unknown payload type {}", next)))?;
        payloads.push(RawPayload::new(kind, body.to_vec()));
        kind = next;
        rest = tail;
    }

    if !rest.is_empty() && !allow_trailing {
        return Err(Error::InvalidLength {
            expected: data.len() - rest.len(),
            actual: data.len(),
        });
    }
    Ok(payloads)
}

// One generic header: (next payload, body, remaining bytes)
fn split_generic(data: &[u8]) -> Result<(u8, &[u8], &[u8])> {
    if data.len() < GENERIC_HEADER_LEN {
        return Err(Error::BufferTooShort {
            required: GENERIC_HEADER_LEN,
            available: data.len(),
        });
    }
    if data[1] != 0 {
        return Err(Error::InvalidPayload("reserved field set".into()));
    }
    let length = u16::from_be_bytes([data[2], data[3]]) as usize;
    if length < GENERIC_HEADER_LEN || length > data.len() {
        return Err(Error::InvalidLength {
            expected: data.len(),
            actual: length,
        });
    }
    Ok((data[0], &data[GENERIC_HEADER_LEN..length], &data[length..]))
}

fn push_generic(out: &mut Vec<u8>, next: u8, body: &[u8]) -> Result<()> {
    let length = u16::try_from(body.len() + GENERIC_HEADER_LEN)
        .map_err(|_| Error::InvalidParameter("payload too large".into()))?;
    out.push(next);
    out.push(0);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(body);
    Ok(())
}

/// Serialize a payload chain; returns the type of the first payload
pub fn join_payloads(payloads: &[RawPayload]) -> Result<(PayloadType, Vec<u8>)> {
    let mut out = Vec::new();
    for (i, payload) in payloads.iter().enumerate() {
        let next = payloads
            .get(i + 1)
            .map_or(PayloadType::None, |p| p.kind)
            .to_u8();
        push_generic(&mut out, next, &payload.body)?;
    }
    let first = payloads.first().map_or(PayloadType::None, |p| p.kind);
    Ok((first, out))
}

/// Data attribute value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    /// Two-byte value carried in the attribute header (AF = 1)
    Basic(u16),
    /// Variable-length value (AF = 0)
    Variable(Vec<u8>),
}

/// Data attribute (RFC 2408 Section 3.3)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Attribute class
    pub kind: u16,
    /// Value
    pub value: AttributeValue,
}

impl Attribute {
    /// Basic attribute
    pub fn basic(kind: u16, value: u16) -> Self {
        Attribute {
            kind,
            value: AttributeValue::Basic(value),
        }
    }

    /// Attribute holding a 32-bit number, basic when it fits
    pub fn number(kind: u16, value: u32) -> Self {
        match u16::try_from(value) {
            Ok(short) => Self::basic(kind, short),
            Err(_) => Attribute {
                kind,
                value: AttributeValue::Variable(value.to_be_bytes().to_vec()),
            },
        }
    }

    /// Numeric value of the attribute, if it fits in 32 bits
    pub fn as_u32(&self) -> Option<u32> {
        match &self.value {
            AttributeValue::Basic(v) => Some(u32::from(*v)),
            AttributeValue::Variable(bytes) if !bytes.is_empty() && bytes.len() <= 4 => {
                Some(bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
            }
            AttributeValue::Variable(_) => None,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        match &self.value {
            AttributeValue::Basic(v) => {
                out.extend_from_slice(&(0x8000 | self.kind).to_be_bytes());
                out.extend_from_slice(&v.to_be_bytes());
            }
            AttributeValue::Variable(bytes) => {
                let len = u16::try_from(bytes.len())
                    .map_err(|_| Error::InvalidParameter("attribute too large".into()))?;
                out.extend_from_slice(&(self.kind & 0x7FFF).to_be_bytes());
                out.extend_from_slice(&len.to_be_bytes());
                out.extend_from_slice(bytes);
            }
        }
        Ok(())
    }

    fn decode_all(mut data: &[u8]) -> Result<Vec<Attribute>> {
        let mut attributes = Vec::new();
        while !data.is_empty() {
            if data.len() < 4 {
                return Err(Error::InvalidPayload("truncated attribute".into()));
            }
            let word = u16::from_be_bytes([data[0], data[1]]);
            let field = u16::from_be_bytes([data[2], data[3]]);
            let kind = word & 0x7FFF;
            if word & 0x8000 != 0 {
                attributes.push(Attribute::basic(kind, field));
                data = &data[4..];
            } else {
                let len = field as usize;
                if data.len() < 4 + len {
                    return Err(Error::InvalidPayload("truncated attribute value".into()));
                }
                attributes.push(Attribute {
                    kind,
                    value: AttributeValue::Variable(data[4..4 + len].to_vec()),
                });
                data = &data[4 + len..];
            }
        }
        Ok(attributes)
    }
}

/// Transform payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform {
    /// Transform number within the proposal
    pub number: u8,
    /// Transform id
    pub transform_id: u8,
    /// SA attributes
    pub attributes: Vec<Attribute>,
}

impl Transform {
    /// Find an attribute by class
    pub fn attribute(&self, kind: u16) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.kind == kind)
    }

    fn to_body(&self) -> Result<Vec<u8>> {
        let mut body = vec![self.number, self.transform_id, 0, 0];
        for attribute in &self.attributes {
            attribute.encode(&mut body)?;
        }
        Ok(body)
    }

    fn from_body(body: &[u8]) -> Result<Self> {
        if body.len() < 4 {
            return Err(Error::InvalidPayload("truncated transform".into()));
        }
        Ok(Transform {
            number: body[0],
            transform_id: body[1],
            attributes: Attribute::decode_all(&body[4..])?,
        })
    }
}

/// Proposal payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// Proposal number; equal numbers form one protection suite
    pub number: u8,
    /// Protocol id
    pub protocol_id: u8,
    /// SPI of the sender
    pub spi: Vec<u8>,
    /// Transforms offered
    pub transforms: Vec<Transform>,
}

impl Proposal {
    /// SPI as a 32-bit IPsec SPI
    pub fn ipsec_spi(&self) -> Result<u32> {
        let bytes: [u8; IPSEC_SPI_LEN] = self
            .spi
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidPayload("IPsec SPI must be 4 bytes".into()))?;
        Ok(u32::from_be_bytes(bytes))
    }

    fn to_body(&self) -> Result<Vec<u8>> {
        let count = u8::try_from(self.transforms.len())
            .map_err(|_| Error::InvalidParameter("too many transforms".into()))?;
        let mut body = vec![self.number, self.protocol_id, self.spi.len() as u8, count];
        body.extend_from_slice(&self.spi);
        for (i, transform) in self.transforms.iter().enumerate() {
            let next = if i + 1 < self.transforms.len() {
                PayloadType::Transform
            } else {
                PayloadType::None
            };
            push_generic(&mut body, next.to_u8(), &transform.to_body()?)?;
        }
        Ok(body)
    }

    fn from_body(body: &[u8], max_transforms: usize) -> Result<Self> {
        if body.len() < 4 {
            return Err(Error::InvalidPayload("truncated proposal".into()));
        }
        let spi_len = body[2] as usize;
        let count = body[3] as usize;
        if spi_len > MAX_SPI_LEN || body.len() < 4 + spi_len {
            return Err(Error::InvalidPayload("invalid proposal SPI".into()));
        }
        if count == 0 || count > max_transforms {
            return Err(Error::InvalidPayload(format!(
                "{} transforms in proposal",
                count
            )));
        }

        let mut transforms = Vec::with_capacity(count);
        let mut rest = &body[4 + spi_len..];
        let mut next = PayloadType::Transform.to_u8();
        while next != PayloadType::None.to_u8() {
            if next != PayloadType::Transform.to_u8() {
                return Err(Error::UnexpectedPayload(next));
            }
            let (following, tbody, tail) = split_generic(rest)?;
            transforms.push(Transform::from_body(tbody)?);
            next = following;
            rest = tail;
        }
        if transforms.len() != count || !rest.is_empty() {
            return Err(Error::InvalidPayload("transform count mismatch".into()));
        }

        Ok(Proposal {
            number: body[0],
            protocol_id: body[1],
            spi: body[4..4 + spi_len].to_vec(),
            transforms,
        })
    }
}

/// Security Association payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaPayload {
    /// Domain of interpretation
    pub doi: u32,
    /// Situation
    pub situation: u32,
    /// Proposals in preference order
    pub proposals: Vec<Proposal>,
}

impl SaPayload {
    /// SA payload in the IPsec DOI
    pub fn new(proposals: Vec<Proposal>) -> Self {
        SaPayload {
            doi: DOI_IPSEC,
            situation: SIT_IDENTITY_ONLY,
            proposals,
        }
    }

    /// Serialize the payload body
    pub fn to_body(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        body.extend_from_slice(&self.doi.to_be_bytes());
        body.extend_from_slice(&self.situation.to_be_bytes());
        for (i, proposal) in self.proposals.iter().enumerate() {
            let next = if i + 1 < self.proposals.len() {
                PayloadType::Proposal
            } else {
                PayloadType::None
            };
            push_generic(&mut body, next.to_u8(), &proposal.to_body()?)?;
        }
        Ok(body)
    }

    /// Parse a payload body
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidPayload` for an unsupported DOI or situation,
    /// too many proposals or transforms, or malformed nested payloads.
    pub fn from_body(body: &[u8], max_proposals: usize, max_transforms: usize) -> Result<Self> {
        if body.len() < 8 {
            return Err(Error::InvalidPayload("truncated SA".into()));
        }
        let doi = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let situation = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
        if doi != DOI_IPSEC {
            return Err(Error::InvalidPayload(format!("DOI {} not supported", doi)));
        }
        if situation != SIT_IDENTITY_ONLY {
            return Err(Error::InvalidPayload(format!(
                "situation {} not supported",
                situation
            )));
        }

        let mut proposals = Vec::new();
        let mut rest = &body[8..];
        let mut next = PayloadType::Proposal.to_u8();
        while next != PayloadType::None.to_u8() {
            if next != PayloadType::Proposal.to_u8() {
                return Err(Error::UnexpectedPayload(next));
            }
            if proposals.len() == max_proposals {
                return Err(Error::InvalidPayload("too many proposals".into()));
            }
            let (following, pbody, tail) = split_generic(rest)?;
            proposals.push(Proposal::from_body(pbody, max_transforms)?);
            next = following;
            rest = tail;
        }
        if proposals.is_empty() || !rest.is_empty() {
            return Err(Error::InvalidPayload("malformed proposal list".into()));
        }

        Ok(SaPayload {
            doi,
            situation,
            proposals,
        })
    }
}

/// Identification payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdPayload {
    /// Identification type
    pub id_type: IdType,
    /// Transport protocol, 0 for any
    pub protocol: u8,
    /// Port, 0 for any
    pub port: u16,
    /// Identification data
    pub data: Vec<u8>,
}

impl IdPayload {
    /// Identity of a single address
    pub fn from_addr(addr: IpAddr) -> Self {
        Self::from_addr_spec(&AddrSpec::Single(addr), IpFamily::of(&addr), 0, 0)
    }

    /// Identity of an address specification
    ///
    /// [`AddrSpec::Any`] is sent as the all-covering subnet of `family`.
    pub fn from_addr_spec(spec: &AddrSpec, family: IpFamily, protocol: u8, port: u16) -> Self {
        let (id_type, data) = match *spec {
            AddrSpec::Any => {
                let zero = family.unspecified();
                subnet_id(zero, 0)
            }
            AddrSpec::Single(IpAddr::V4(a)) => (IdType::Ipv4Addr, a.octets().to_vec()),
            AddrSpec::Single(IpAddr::V6(a)) => (IdType::Ipv6Addr, a.octets().to_vec()),
            AddrSpec::Subnet(a, prefix_len) => subnet_id(a, prefix_len),
            AddrSpec::Range(lo, hi) => {
                let mut data = addr_octets(lo);
                data.extend(addr_octets(hi));
                let id_type = if lo.is_ipv4() {
                    IdType::Ipv4Range
                } else {
                    IdType::Ipv6Range
                };
                (id_type, data)
            }
        };
        IdPayload {
            id_type,
            protocol,
            port,
            data,
        }
    }

    /// Address specification carried by the identity
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidPayload` for name identities and for data of
    /// the wrong length.
    pub fn to_addr_spec(&self) -> Result<AddrSpec> {
        let bad = || Error::InvalidPayload(format!("{:?} identity of {} bytes", self.id_type, self.data.len()));
        let d = &self.data;
        match self.id_type {
            IdType::Ipv4Addr if d.len() == 4 => Ok(AddrSpec::Single(v4(&d[0..4]))),
            IdType::Ipv6Addr if d.len() == 16 => Ok(AddrSpec::Single(v6(&d[0..16]))),
            IdType::Ipv4Subnet if d.len() == 8 => {
                let prefix = mask_prefix(&d[4..8]).ok_or_else(bad)?;
                if prefix == 0 {
                    Ok(AddrSpec::Any)
                } else {
                    Ok(AddrSpec::Subnet(v4(&d[0..4]), prefix))
                }
            }
            IdType::Ipv6Subnet if d.len() == 32 => {
                let prefix = mask_prefix(&d[16..32]).ok_or_else(bad)?;
                if prefix == 0 {
                    Ok(AddrSpec::Any)
                } else {
                    Ok(AddrSpec::Subnet(v6(&d[0..16]), prefix))
                }
            }
            IdType::Ipv4Range if d.len() == 8 => Ok(AddrSpec::Range(v4(&d[0..4]), v4(&d[4..8]))),
            IdType::Ipv6Range if d.len() == 32 => {
                Ok(AddrSpec::Range(v6(&d[0..16]), v6(&d[16..32])))
            }
            _ => Err(bad()),
        }
    }

    /// Serialize the payload body
    pub fn to_body(&self) -> Vec<u8> {
        let mut body = vec![self.id_type as u8, self.protocol];
        body.extend_from_slice(&self.port.to_be_bytes());
        body.extend_from_slice(&self.data);
        body
    }

    /// Parse a payload body
    pub fn from_body(body: &[u8]) -> Result<Self> {
        if body.len() < 5 {
            return Err(Error::InvalidPayload("truncated identification".into()));
        }
        let id_type = IdType::from_u8(body[0])
            .ok_or_else(|| Error::InvalidPayload(format!("identification type {}", body[0])))?;
        Ok(IdPayload {
            id_type,
            protocol: body[1],
            port: u16::from_be_bytes([body[2], body[3]]),
            data: body[4..].to_vec(),
        })
    }
}

fn v4(bytes: &[u8]) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
}

fn v6(bytes: &[u8]) -> IpAddr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(bytes);
    IpAddr::V6(Ipv6Addr::from(octets))
}

fn addr_octets(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(a) => a.octets().to_vec(),
        IpAddr::V6(a) => a.octets().to_vec(),
    }
}

fn subnet_id(addr: IpAddr, prefix_len: u8) -> (IdType, Vec<u8>) {
    let width = IpFamily::of(&addr).bits() as usize;
    let mut mask = vec![0u8; width / 8];
    for bit in 0..(prefix_len as usize).min(width) {
        mask[bit / 8] |= 0x80 >> (bit % 8);
    }
    let mut data = addr_octets(addr);
    data.extend(mask);
    let id_type = if addr.is_ipv4() {
        IdType::Ipv4Subnet
    } else {
        IdType::Ipv6Subnet
    };
    (id_type, data)
}

// Prefix length of a contiguous netmask
fn mask_prefix(mask: &[u8]) -> Option<u8> {
    let ones: u32 = mask.iter().map(|b| b.count_ones()).sum();
    let mut expected = vec![0u8; mask.len()];
    for bit in 0..ones as usize {
        expected[bit / 8] |= 0x80 >> (bit % 8);
    }
    (expected == mask).then_some(ones as u8)
}

/// Notification payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPayload {
    /// Domain of interpretation
    pub doi: u32,
    /// Protocol id
    pub protocol_id: u8,
    /// Notify message type
    pub notify_type: u16,
    /// SPI the notification refers to
    pub spi: Vec<u8>,
    /// Notification data
    pub data: Vec<u8>,
}

impl NotifyPayload {
    /// Notification in the IPsec DOI
    pub fn new(protocol_id: u8, notify_type: NotifyType, spi: Vec<u8>) -> Self {
        NotifyPayload {
            doi: DOI_IPSEC,
            protocol_id,
            notify_type: notify_type.to_u16(),
            spi,
            data: Vec::new(),
        }
    }

    /// Serialize the payload body
    pub fn to_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(8 + self.spi.len() + self.data.len());
        body.extend_from_slice(&self.doi.to_be_bytes());
        body.push(self.protocol_id);
        body.push(self.spi.len() as u8);
        body.extend_from_slice(&self.notify_type.to_be_bytes());
        body.extend_from_slice(&self.spi);
        body.extend_from_slice(&self.data);
        body
    }

    /// Parse a payload body
    pub fn from_body(body: &[u8]) -> Result<Self> {
        if body.len() < 8 {
            return Err(Error::InvalidPayload("truncated notification".into()));
        }
        let spi_len = body[5] as usize;
        if spi_len > MAX_SPI_LEN || body.len() < 8 + spi_len {
            return Err(Error::InvalidPayload("invalid notification SPI".into()));
        }
        Ok(NotifyPayload {
            doi: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            protocol_id: body[4],
            notify_type: u16::from_be_bytes([body[6], body[7]]),
            spi: body[8..8 + spi_len].to_vec(),
            data: body[8 + spi_len..].to_vec(),
        })
    }
}

/// Delete payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePayload {
    /// Domain of interpretation
    pub doi: u32,
    /// Protocol id
    pub protocol_id: u8,
    /// SPIs of the deleted SAs, all of one length
    pub spis: Vec<Vec<u8>>,
}

impl DeletePayload {
    /// Delete of IPsec SAs
    pub fn ipsec(protocol_id: u8, spis: &[u32]) -> Self {
        DeletePayload {
            doi: DOI_IPSEC,
            protocol_id,
            spis: spis.iter().map(|s| s.to_be_bytes().to_vec()).collect(),
        }
    }

    /// Delete of an ISAKMP SA identified by its cookie pair
    pub fn isakmp(initiator: [u8; COOKIE_LEN], responder: [u8; COOKIE_LEN]) -> Self {
        let mut spi = initiator.to_vec();
        spi.extend_from_slice(&responder);
        DeletePayload {
            doi: DOI_IPSEC,
            protocol_id: protocol::ISAKMP,
            spis: vec![spi],
        }
    }

    /// Serialize the payload body
    pub fn to_body(&self) -> Result<Vec<u8>> {
        let spi_len = self.spis.first().map_or(0, |s| s.len());
        if self.spis.iter().any(|s| s.len() != spi_len) {
            return Err(Error::InvalidParameter("SPIs of different lengths".into()));
        }
        let count = u16::try_from(self.spis.len())
            .map_err(|_| Error::InvalidParameter("too many SPIs".into()))?;
        let mut body = Vec::new();
        body.extend_from_slice(&self.doi.to_be_bytes());
        body.push(self.protocol_id);
        body.push(spi_len as u8);
        body.extend_from_slice(&count.to_be_bytes());
        for spi in &self.spis {
            body.extend_from_slice(spi);
        }
        Ok(body)
    }

    /// Parse a payload body
    pub fn from_body(body: &[u8]) -> Result<Self> {
        if body.len() < 8 {
            return Err(Error::InvalidPayload("truncated delete".into()));
        }
        let spi_len = body[5] as usize;
        let count = u16::from_be_bytes([body[6], body[7]]) as usize;
        if spi_len == 0 || spi_len > MAX_SPI_LEN || body.len() != 8 + spi_len * count {
            return Err(Error::InvalidPayload("invalid delete SPI list".into()));
        }
        Ok(DeletePayload {
            doi: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            protocol_id: body[4],
            spis: body[8..].chunks(spi_len).map(|c| c.to_vec()).collect(),
        })
    }
}

/// ISAKMP message: header and raw payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Header; `next_payload`, `length` and the encryption flag are set
    /// when the message is assembled
    pub header: IsakmpHeader,
    /// Payloads in wire order
    pub payloads: Vec<RawPayload>,
}

impl Message {
    /// Create a message without payloads
    pub fn new(header: IsakmpHeader) -> Self {
        Message {
            header,
            payloads: Vec::new(),
        }
    }

    /// Append a payload
    pub fn push(&mut self, kind: PayloadType, body: Vec<u8>) {
        self.payloads.push(RawPayload::new(kind, body));
    }

    /// Body of the first payload of `kind`
    pub fn find(&self, kind: PayloadType) -> Option<&[u8]> {
        self.payloads
            .iter()
            .find(|p| p.kind == kind)
            .map(|p| p.body.as_slice())
    }

    /// Bodies of all payloads of `kind`, in order
    pub fn find_all(&self, kind: PayloadType) -> Vec<&[u8]> {
        self.payloads
            .iter()
            .filter(|p| p.kind == kind)
            .map(|p| p.body.as_slice())
            .collect()
    }

    /// Body of a payload that must be present
    pub fn require(&self, kind: PayloadType, name: &'static str) -> Result<&[u8]> {
        self.find(kind).ok_or(Error::MissingPayload(name))
    }

    /// Check the payload set of a received message
    ///
    /// Every payload must be listed in `allowed` (vendor IDs are always
    /// accepted and ignored) and may only repeat if listed in `repeatable`.
    pub fn check_payloads(&self, allowed: &[PayloadType], repeatable: &[PayloadType]) -> Result<()> {
        let mut seen: Vec<PayloadType> = Vec::new();
        for payload in &self.payloads {
            if payload.kind == PayloadType::VendorId {
                continue;
            }
            if !allowed.contains(&payload.kind) {
                return Err(Error::UnexpectedPayload(payload.kind.to_u8()));
            }
            if seen.contains(&payload.kind) && !repeatable.contains(&payload.kind) {
                return Err(Error::DuplicatePayload(payload.kind.to_u8()));
            }
            seen.push(payload.kind);
        }
        Ok(())
    }

    /// Serialized payloads after the first one
    ///
    /// Used for the HASH payload, which always comes first and covers the
    /// rest of the message.
    pub fn bytes_after_first(&self) -> Result<Vec<u8>> {
        let rest = self.payloads.get(1..).unwrap_or(&[]);
        Ok(join_payloads(rest)?.1)
    }

    /// Serialize the payloads and set `next_payload` in the header
    pub fn payload_bytes(&mut self) -> Result<Vec<u8>> {
        let (first, body) = join_payloads(&self.payloads)?;
        self.header.next_payload = first;
        Ok(body)
    }

    /// Build the datagram from a (possibly encrypted) body
    pub fn assemble(&mut self, body: &[u8]) -> Result<Vec<u8>> {
        let total = ISAKMP_HEADER_LEN + body.len();
        if total > MAX_MESSAGE_LEN {
            return Err(Error::InvalidParameter("message too large".into()));
        }
        self.header.length = total as u32;
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(body);
        Ok(out)
    }

    /// Build an unencrypted datagram
    pub fn to_plain_bytes(&mut self) -> Result<Vec<u8>> {
        let body = self.payload_bytes()?;
        self.header.flags &= !flags::ENCRYPTION;
        self.assemble(&body)
    }

    /// Parse a message body that has already been decrypted if necessary
    pub fn parse(header: IsakmpHeader, body: &[u8]) -> Result<Self> {
        let payloads = split_payloads(header.next_payload, body, header.is_encrypted())?;
        Ok(Message { header, payloads })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sa() -> SaPayload {
        SaPayload::new(vec![Proposal {
            number: 1,
            protocol_id: protocol::ESP,
            spi: 0x1234_5678u32.to_be_bytes().to_vec(),
            transforms: vec![
                Transform {
                    number: 1,
                    transform_id: esp_transform::AES,
                    attributes: vec![
                        Attribute::basic(ipsec_attr::KEY_LENGTH, 256),
                        Attribute::number(ipsec_attr::SA_LIFE_DURATION, 100_000),
                    ],
                },
                Transform {
                    number: 2,
                    transform_id: esp_transform::TRIPLE_DES,
                    attributes: vec![],
                },
            ],
        }])
    }

    #[test]
    fn test_sa_payload_round_trip() {
        let sa = sample_sa();
        let body = sa.to_body().unwrap();
        let parsed = SaPayload::from_body(&body, 4, 5).unwrap();
        assert_eq!(parsed, sa);
        assert_eq!(parsed.proposals[0].ipsec_spi().unwrap(), 0x1234_5678);

        let life = parsed.proposals[0].transforms[0]
            .attribute(ipsec_attr::SA_LIFE_DURATION)
            .unwrap();
        assert!(matches!(life.value, AttributeValue::Variable(_)));
        assert_eq!(life.as_u32(), Some(100_000));
    }

    #[test]
    fn test_sa_payload_limits() {
        let body = sample_sa().to_body().unwrap();
        assert!(matches!(
            SaPayload::from_body(&body, 4, 1),
            Err(Error::InvalidPayload(_))
        ));

        let mut bad_doi = body.clone();
        bad_doi[3] = 2;
        assert!(SaPayload::from_body(&bad_doi, 4, 5).is_err());

        // transform count byte disagrees with the chain
        let mut bad_count = body;
        bad_count[8 + 4 + 3] = 3;
        assert!(SaPayload::from_body(&bad_count, 4, 5).is_err());
    }

    #[test]
    fn test_split_and_join() {
        let payloads = vec![
            RawPayload::new(PayloadType::Hash, vec![1; 20]),
            RawPayload::new(PayloadType::Nonce, vec![2; 16]),
            RawPayload::new(PayloadType::VendorId, vec![3; 4]),
        ];
        let (first, bytes) = join_payloads(&payloads).unwrap();
        assert_eq!(first, PayloadType::Hash);
        assert_eq!(bytes.len(), 20 + 16 + 4 + 12);
        assert_eq!(split_payloads(first, &bytes, false).unwrap(), payloads);

        // trailing padding only when encrypted
        let mut padded = bytes.clone();
        padded.extend_from_slice(&[0, 0, 0]);
        assert!(split_payloads(first, &padded, false).is_err());
        assert_eq!(split_payloads(first, &padded, true).unwrap().len(), 3);
    }

    #[test]
    fn test_split_rejects_bad_chains() {
        // length runs past the buffer
        assert!(split_payloads(PayloadType::Nonce, &[0, 0, 0, 40, 1, 2], false).is_err());
        // reserved byte set
        assert!(split_payloads(PayloadType::Nonce, &[0, 1, 0, 4], false).is_err());
        // unknown next payload
        assert!(split_payloads(PayloadType::Nonce, &[77, 0, 0, 4], false).is_err());
        // proposals are only valid inside an SA payload
        assert_eq!(
            split_payloads(PayloadType::Proposal, &[0, 0, 0, 4], false),
            Err(Error::UnexpectedPayload(2))
        );
    }

    #[test]
    fn test_id_payload_addresses() {
        let host: IpAddr = "10.1.2.3".parse().unwrap();
        let id = IdPayload::from_addr(host);
        assert_eq!(id.id_type, IdType::Ipv4Addr);
        let parsed = IdPayload::from_body(&id.to_body()).unwrap();
        assert_eq!(parsed.to_addr_spec().unwrap(), AddrSpec::Single(host));

        let net = AddrSpec::Subnet("192.168.0.0".parse().unwrap(), 16);
        let id = IdPayload::from_addr_spec(&net, IpFamily::V4, 17, 500);
        assert_eq!(id.data[4..], [255, 255, 0, 0]);
        assert_eq!(id.to_addr_spec().unwrap(), net);
        assert_eq!(id.port, 500);

        let any = IdPayload::from_addr_spec(&AddrSpec::Any, IpFamily::V6, 0, 0);
        assert_eq!(any.id_type, IdType::Ipv6Subnet);
        assert_eq!(any.to_addr_spec().unwrap(), AddrSpec::Any);

        let range = AddrSpec::Range("10.0.0.1".parse().unwrap(), "10.0.0.9".parse().unwrap());
        let id = IdPayload::from_addr_spec(&range, IpFamily::V4, 0, 0);
        assert_eq!(id.to_addr_spec().unwrap(), range);

        let fqdn = IdPayload {
            id_type: IdType::Fqdn,
            protocol: 0,
            port: 0,
            data: b"gw.example.com".to_vec(),
        };
        assert!(fqdn.to_addr_spec().is_err());

        let mut holes = IdPayload::from_addr_spec(&net, IpFamily::V4, 0, 0);
        holes.data[6] = 0x0F;
        assert!(holes.to_addr_spec().is_err());
    }

    #[test]
    fn test_notify_and_delete() {
        let notify = NotifyPayload::new(protocol::ESP, NotifyType::InvalidSpi, vec![0, 0, 1, 0]);
        assert_eq!(NotifyPayload::from_body(&notify.to_body()).unwrap(), notify);

        let delete = DeletePayload::ipsec(protocol::AH, &[300, 301]);
        let parsed = DeletePayload::from_body(&delete.to_body().unwrap()).unwrap();
        assert_eq!(parsed.spis.len(), 2);
        assert_eq!(parsed.spis[1], 301u32.to_be_bytes().to_vec());

        let isakmp = DeletePayload::isakmp([1; 8], [2; 8]);
        assert_eq!(isakmp.to_body().unwrap()[5], 16);

        let mut truncated = delete.to_body().unwrap();
        truncated.pop();
        assert!(DeletePayload::from_body(&truncated).is_err());
    }

    #[test]
    fn test_message_payload_checks() {
        let header = IsakmpHeader::new([1; 8], [2; 8], ExchangeType::Quick, 9);
        let mut message = Message::new(header);
        message.push(PayloadType::Hash, vec![0; 20]);
        message.push(PayloadType::Id, vec![1, 0, 0, 0, 10, 0, 0, 1]);
        message.push(PayloadType::Id, vec![1, 0, 0, 0, 10, 0, 0, 2]);

        assert!(message
            .check_payloads(&[PayloadType::Hash, PayloadType::Id], &[PayloadType::Id])
            .is_ok());
        assert_eq!(
            message.check_payloads(&[PayloadType::Hash, PayloadType::Id], &[]),
            Err(Error::DuplicatePayload(5))
        );
        assert_eq!(
            message.check_payloads(&[PayloadType::Hash], &[]),
            Err(Error::UnexpectedPayload(5))
        );
        assert_eq!(
            message.require(PayloadType::Nonce, "nonce"),
            Err(Error::MissingPayload("nonce"))
        );

        let bytes = message.to_plain_bytes().unwrap();
        let header = IsakmpHeader::from_bytes(&bytes).unwrap();
        let parsed = Message::parse(header, &bytes[ISAKMP_HEADER_LEN..]).unwrap();
        assert_eq!(parsed.payloads, message.payloads);
        assert_eq!(
            parsed.bytes_after_first().unwrap().len(),
            2 * (GENERIC_HEADER_LEN + 8)
        );
    }
}
