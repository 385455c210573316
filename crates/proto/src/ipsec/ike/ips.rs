//! Bridge between quick mode and the IPsec database
//!
//! Selects the security protocols to negotiate for an SA request, encodes
//! and matches the phase 2 proposals, and materializes the negotiated
//! items as inbound/outbound SA pairs.

use std::time::Duration;

use super::constants::*;
use super::dh::DhGroup;
use super::handle::{Phase2Handle, Role, Sa2};
use super::oakley::{keymat, KeymatInput};
use super::payload::{Attribute, Proposal, SaPayload, Transform};
use super::sadb::IsakmpSa;
use crate::ipsec::config::{IKE_SPI_END, IKE_SPI_START};
use crate::ipsec::crypto::{AuthAlgorithm, EncryptAlgorithm};
use crate::ipsec::logging;
use crate::ipsec::policy::{
    Direction, IpsecProtocol, Lifetime, Policy, SaDerivation, SecurityMode, SecurityProtocol,
};
use crate::ipsec::sadb::SaSpec;
use crate::ipsec::spd::IpsecDb;
use crate::ipsec::{Error, Result};

/// Counter handing out the SPIs of negotiated inbound SAs
///
/// Values stay within the IKE range and wrap back to its start.
#[derive(Debug, Clone)]
pub struct SpiCounter {
    next: u32,
}

impl Default for SpiCounter {
    fn default() -> Self {
        SpiCounter { next: IKE_SPI_START }
    }
}

impl SpiCounter {
    /// Counter starting at the first IKE SPI
    pub fn new() -> Self {
        Self::default()
    }

    /// Next value the counter will try
    pub fn peek(&self) -> u32 {
        self.next
    }

    /// Take the next SPI not listed in `in_use`
    pub fn take(&mut self, in_use: &[u32]) -> Result<u32> {
        for _ in IKE_SPI_START..=IKE_SPI_END {
            let spi = self.next;
            self.next = if spi >= IKE_SPI_END {
                IKE_SPI_START
            } else {
                spi + 1
            };
            if !in_use.contains(&spi) {
                return Ok(spi);
            }
        }
        Err(Error::NoSpiAvailable)
    }
}

fn protocol_id(protocol: IpsecProtocol) -> u8 {
    match protocol {
        IpsecProtocol::Ah => protocol::AH,
        IpsecProtocol::Esp => protocol::ESP,
    }
}

/// Choose the security protocols to negotiate for a request
///
/// `security` is the policy's list, innermost first. The list is walked
/// from the outermost entry; entries of another tunnel leg are dropped.
/// Returns the items outermost first, each with a fresh local SPI.
///
/// # Errors
///
/// Returns `Error::UnallowedExchange` if no entry matches the request.
pub fn select_phase2_security(
    security: &[SecurityProtocol],
    request: &SecurityProtocol,
    spis: &mut SpiCounter,
    in_use: &[u32],
) -> Result<Vec<Sa2>> {
    let mut wanted = *request;
    if wanted.protocol == IpsecProtocol::Ah {
        wanted.encryption = None;
    }
    wanted.sa_derivation = SaDerivation::FROM_POLICY;

    let mut selected: Vec<SecurityProtocol> = Vec::new();
    let mut matched = false;
    for item in security.iter().rev() {
        if item.same_protection(&wanted) {
            matched = true;
        } else if !matched && item.is_tunnel() {
            // outer leg towards another gateway
            selected.clear();
            continue;
        }
        selected.push(*item);
        if matched && item.is_tunnel() {
            break;
        }
    }
    if !matched {
        return Err(Error::UnallowedExchange);
    }

    selected
        .into_iter()
        .map(|security| {
            Ok(Sa2 {
                security,
                local_spi: spis.take(in_use)?,
                remote_spi: 0,
            })
        })
        .collect()
}

fn encryption_transform(encryption: EncryptAlgorithm) -> (u8, Option<u16>) {
    match encryption {
        EncryptAlgorithm::DesCbc => (esp_transform::DES, None),
        EncryptAlgorithm::TripleDesCbc => (esp_transform::TRIPLE_DES, None),
        EncryptAlgorithm::Aes128Cbc => (esp_transform::AES, Some(128)),
        EncryptAlgorithm::Aes192Cbc => (esp_transform::AES, Some(192)),
        EncryptAlgorithm::Aes256Cbc => (esp_transform::AES, Some(256)),
        EncryptAlgorithm::BlowfishCbc => (esp_transform::BLOWFISH, Some(128)),
        EncryptAlgorithm::Cast128Cbc => (esp_transform::CAST, Some(128)),
        EncryptAlgorithm::Null => (esp_transform::NULL, None),
    }
}

fn auth_attribute(auth: AuthAlgorithm) -> u16 {
    match auth {
        AuthAlgorithm::HmacMd5 => ipsec_attr::AUTH_HMAC_MD5,
        AuthAlgorithm::HmacSha1 => ipsec_attr::AUTH_HMAC_SHA,
        AuthAlgorithm::HmacSha256 => ipsec_attr::AUTH_HMAC_SHA2_256,
        AuthAlgorithm::AesXcbc => ipsec_attr::AUTH_AES_XCBC,
    }
}

fn auth_from_attribute(value: u32) -> Option<AuthAlgorithm> {
    match u16::try_from(value).ok()? {
        ipsec_attr::AUTH_HMAC_MD5 => Some(AuthAlgorithm::HmacMd5),
        ipsec_attr::AUTH_HMAC_SHA => Some(AuthAlgorithm::HmacSha1),
        ipsec_attr::AUTH_HMAC_SHA2_256 => Some(AuthAlgorithm::HmacSha256),
        ipsec_attr::AUTH_AES_XCBC => Some(AuthAlgorithm::AesXcbc),
        _ => None,
    }
}

fn ah_transform_id(auth: AuthAlgorithm) -> u8 {
    match auth {
        AuthAlgorithm::HmacMd5 => ah_transform::MD5,
        AuthAlgorithm::HmacSha1 => ah_transform::SHA,
        AuthAlgorithm::HmacSha256 => ah_transform::SHA2_256,
        AuthAlgorithm::AesXcbc => ah_transform::AES_XCBC,
    }
}

/// Encode one SA2 item as a transform
fn to_transform(security: &SecurityProtocol, lifetime: u32, pfs: Option<DhGroup>) -> Result<Transform> {
    let mut attributes = vec![
        Attribute::basic(ipsec_attr::SA_LIFE_TYPE, ipsec_attr::LIFE_SECONDS),
        Attribute::number(ipsec_attr::SA_LIFE_DURATION, lifetime),
    ];
    if let Some(group) = pfs {
        attributes.push(Attribute::basic(ipsec_attr::GROUP_DESCRIPTION, group.id()));
    }
    let mode = match security.mode {
        SecurityMode::Tunnel => ipsec_attr::ENCAP_TUNNEL,
        SecurityMode::Transport => ipsec_attr::ENCAP_TRANSPORT,
    };
    attributes.push(Attribute::basic(ipsec_attr::ENCAPSULATION_MODE, mode));

    let transform_id = match security.protocol {
        IpsecProtocol::Esp => {
            let encryption = security
                .encryption
                .ok_or_else(|| Error::InvalidParameter("ESP without encryption".into()))?;
            let (id, key_bits) = encryption_transform(encryption);
            if let Some(auth) = security.auth {
                attributes.push(Attribute::basic(ipsec_attr::AUTH_ALGORITHM, auth_attribute(auth)));
            }
            if let Some(bits) = key_bits {
                attributes.push(Attribute::basic(ipsec_attr::KEY_LENGTH, bits));
            }
            id
        }
        IpsecProtocol::Ah => {
            let auth = security
                .auth
                .ok_or_else(|| Error::InvalidParameter("AH without authentication".into()))?;
            attributes.push(Attribute::basic(ipsec_attr::AUTH_ALGORITHM, auth_attribute(auth)));
            ah_transform_id(auth)
        }
    };

    Ok(Transform {
        number: 1,
        transform_id,
        attributes,
    })
}

/// SA payload body offering (or accepting) `items` as one protection suite
pub fn sa_body(items: &[Sa2], number: u8, lifetime: u32, pfs: Option<DhGroup>) -> Result<Vec<u8>> {
    let proposals = items
        .iter()
        .map(|item| {
            Ok(Proposal {
                number,
                protocol_id: protocol_id(item.security.protocol),
                spi: item.local_spi.to_be_bytes().to_vec(),
                transforms: vec![to_transform(&item.security, lifetime, pfs)?],
            })
        })
        .collect::<Result<Vec<_>>>()?;
    SaPayload::new(proposals).to_body()
}

/// One protocol offered by the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferedItem {
    /// Protocol, mode and algorithms; no tunnel endpoints
    pub security: SecurityProtocol,
    /// SPI chosen by the peer
    pub spi: u32,
    /// Proposed lifetime in seconds, 0 if absent
    pub lifetime: u32,
    /// Proposed PFS group
    pub pfs: Option<DhGroup>,
}

/// Protection suite: proposals sharing a proposal number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suite {
    /// Proposal number
    pub number: u8,
    /// Alternatives for each protocol of the suite, in wire order
    pub items: Vec<Vec<OfferedItem>>,
}

fn decode_transform(protocol_id: u8, spi: u32, transform: &Transform) -> Result<OfferedItem> {
    let value = |kind| transform.attribute(kind).and_then(|a| a.as_u32());
    let unsupported = || Error::NoProposalChosen;

    let mode = match value(ipsec_attr::ENCAPSULATION_MODE) {
        Some(m) if m == u32::from(ipsec_attr::ENCAP_TUNNEL) => SecurityMode::Tunnel,
        Some(m) if m == u32::from(ipsec_attr::ENCAP_TRANSPORT) => SecurityMode::Transport,
        None => SecurityMode::Transport,
        Some(_) => return Err(unsupported()),
    };
    let auth = match value(ipsec_attr::AUTH_ALGORITHM) {
        Some(a) => Some(auth_from_attribute(a).ok_or_else(unsupported)?),
        None => None,
    };
    let lifetime = match value(ipsec_attr::SA_LIFE_TYPE) {
        None => 0,
        Some(t) if t == u32::from(ipsec_attr::LIFE_SECONDS) => {
            value(ipsec_attr::SA_LIFE_DURATION).ok_or_else(unsupported)?
        }
        Some(_) => return Err(unsupported()),
    };
    let pfs = match value(ipsec_attr::GROUP_DESCRIPTION) {
        Some(g) => Some(
            u16::try_from(g)
                .ok()
                .and_then(|g| DhGroup::from_id(g).ok())
                .ok_or_else(unsupported)?,
        ),
        None => None,
    };

    let mut security = match protocol_id {
        protocol::ESP => {
            let key_bits = value(ipsec_attr::KEY_LENGTH);
            let encryption = match (transform.transform_id, key_bits) {
                (esp_transform::DES, None) => EncryptAlgorithm::DesCbc,
                (esp_transform::TRIPLE_DES, None) => EncryptAlgorithm::TripleDesCbc,
                (esp_transform::AES, None | Some(128)) => EncryptAlgorithm::Aes128Cbc,
                (esp_transform::AES, Some(192)) => EncryptAlgorithm::Aes192Cbc,
                (esp_transform::AES, Some(256)) => EncryptAlgorithm::Aes256Cbc,
                (esp_transform::BLOWFISH, None | Some(128)) => EncryptAlgorithm::BlowfishCbc,
                (esp_transform::CAST, None | Some(128)) => EncryptAlgorithm::Cast128Cbc,
                (esp_transform::NULL, None) => EncryptAlgorithm::Null,
                _ => return Err(unsupported()),
            };
            SecurityProtocol::esp(encryption, auth)
        }
        protocol::AH => {
            let auth = auth.ok_or_else(unsupported)?;
            if transform.transform_id != ah_transform_id(auth) {
                return Err(unsupported());
            }
            SecurityProtocol::ah(auth)
        }
        other => return Err(Error::InvalidPayload(format!("protocol {} in phase 2", other))),
    };
    security.validate().map_err(|_| unsupported())?;
    security.mode = mode;
    security.sa_derivation = SaDerivation::FROM_POLICY;

    Ok(OfferedItem {
        security,
        spi,
        lifetime,
        pfs,
    })
}

/// Decode the SA payload of a quick mode offer into protection suites
///
/// Transforms that cannot be decoded are left out; a protocol without any
/// usable transform makes its whole suite unusable.
pub fn parse_offer(body: &[u8], max_proposals: usize, max_transforms: usize) -> Result<Vec<Suite>> {
    let sa = SaPayload::from_body(body, max_proposals, max_transforms)?;
    if sa.doi != DOI_IPSEC {
        return Err(Error::InvalidPayload(format!("DOI {} not supported", sa.doi)));
    }

    let mut suites: Vec<Suite> = Vec::new();
    let mut broken: Vec<u8> = Vec::new();
    for proposal in &sa.proposals {
        let spi = proposal.ipsec_spi()?;
        if spi <= crate::ipsec::config::SPI_RESERVED_END {
            return Err(Error::InvalidSpi(spi));
        }
        let alternatives: Vec<OfferedItem> = proposal
            .transforms
            .iter()
            .filter_map(|t| decode_transform(proposal.protocol_id, spi, t).ok())
            .collect();
        if alternatives.is_empty() {
            broken.push(proposal.number);
        }
        match suites.iter_mut().find(|s| s.number == proposal.number) {
            Some(suite) => suite.items.push(alternatives),
            None => suites.push(Suite {
                number: proposal.number,
                items: vec![alternatives],
            }),
        }
    }
    suites.retain(|s| !broken.contains(&s.number));
    Ok(suites)
}

/// Outcome of matching an offer against a local policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    /// Proposal number of the accepted suite
    pub number: u8,
    /// Negotiated items in wire order
    pub sa2: Vec<Sa2>,
    /// SA lifetime in seconds
    pub lifetime: u32,
    /// PFS group
    pub pfs: Option<DhGroup>,
}

fn same_algorithms(ours: &SecurityProtocol, theirs: &SecurityProtocol) -> bool {
    ours.protocol == theirs.protocol
        && ours.mode == theirs.mode
        && ours.auth == theirs.auth
        && ours.encryption == theirs.encryption
}

/// Pick the first suite whose protocols all match entries of `policy`
///
/// Each accepted item gets a fresh local SPI. The lifetime is the shorter
/// of the offer and the policy.
///
/// # Errors
///
/// Returns `Error::NoProposalChosen` if no suite matches.
pub fn match_offer(
    policy: &Policy,
    suites: &[Suite],
    spis: &mut SpiCounter,
    in_use: &[u32],
) -> Result<Accepted> {
    for suite in suites {
        let mut used = vec![false; policy.security.len()];
        let mut chosen: Vec<(SecurityProtocol, OfferedItem)> = Vec::new();
        for alternatives in &suite.items {
            let hit = alternatives.iter().find_map(|offered| {
                policy
                    .security
                    .iter()
                    .enumerate()
                    .find(|(i, ours)| !used[*i] && same_algorithms(ours, &offered.security))
                    .map(|(i, ours)| (i, *ours, *offered))
            });
            match hit {
                Some((i, ours, offered)) => {
                    used[i] = true;
                    chosen.push((ours, offered));
                }
                None => break,
            }
        }
        if chosen.len() != suite.items.len() {
            continue;
        }

        let pfs = chosen.first().and_then(|(_, o)| o.pfs);
        if chosen.iter().any(|(_, o)| o.pfs != pfs) {
            continue;
        }
        if policy.pfs_group.is_some() && pfs != policy.pfs_group {
            continue;
        }
        let ours = policy.lifetime.seconds;
        let lifetime = chosen
            .iter()
            .map(|(_, o)| o.lifetime)
            .filter(|l| *l != 0)
            .min()
            .map_or(ours, |l| l.min(ours));

        let sa2 = chosen
            .into_iter()
            .map(|(security, offered)| {
                Ok(Sa2 {
                    security,
                    local_spi: spis.take(in_use)?,
                    remote_spi: offered.spi,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        return Ok(Accepted {
            number: suite.number,
            sa2,
            lifetime,
            pfs,
        });
    }
    Err(Error::NoProposalChosen)
}

/// Check the responder's answer against the items offered
///
/// Records the peer's SPIs in `sa2` and returns the accepted lifetime.
pub fn accept_reply(
    sa2: &mut [Sa2],
    body: &[u8],
    offered_lifetime: u32,
    pfs: Option<DhGroup>,
    max_transforms: usize,
) -> Result<u32> {
    let suites = parse_offer(body, sa2.len().max(1), max_transforms)?;
    let suite = match suites.as_slice() {
        [suite] if suite.items.len() == sa2.len() => suite,
        _ => return Err(Error::NoProposalChosen),
    };

    let mut lifetime = offered_lifetime;
    for (item, alternatives) in sa2.iter().zip(&suite.items) {
        let answer = match alternatives.as_slice() {
            [answer] => answer,
            _ => return Err(Error::NoProposalChosen),
        };
        if !same_algorithms(&item.security, &answer.security) || answer.pfs != pfs {
            return Err(Error::NoProposalChosen);
        }
        if answer.lifetime != 0 {
            lifetime = lifetime.min(answer.lifetime);
        }
    }
    for (item, alternatives) in sa2.iter_mut().zip(&suite.items) {
        item.remote_spi = alternatives[0].spi;
    }
    Ok(lifetime)
}

/// Install the SA pairs negotiated by a completed quick mode exchange
///
/// Keying material is derived per direction from the SPI of that
/// direction. Existing outbound SAs for the same traffic are rehashed so
/// bundles pick up the new ones. Only the first pair of the bundle gets a
/// soft lifetime.
///
/// Returns the number of pairs installed.
pub fn generate_sa_pairs(
    db: &IpsecDb,
    handle: &Phase2Handle,
    isakmp: &IsakmpSa,
    policy: &Policy,
    soft_offset: Duration,
) -> Result<usize> {
    let prf = isakmp.proposal.hash;
    let (inbound_selector, outbound_selector) = match handle.role {
        Role::Initiator => (handle.selector.swapped(), handle.selector),
        Role::Responder => (handle.selector, handle.selector.swapped()),
    };
    let lifetime = Lifetime::new(handle.lifetime, policy.lifetime.expiry);

    for (i, item) in handle.sa2.iter().enumerate() {
        let security = item.security;
        let (inbound_security, outbound_security) = if policy.flow.covers(Direction::Outbound) {
            (security.mirrored(), security)
        } else {
            (security, security.mirrored())
        };

        let input = |spi| KeymatInput {
            protocol: protocol_id(security.protocol),
            spi,
            pfs_secret: handle.pfs_secret.as_ref().map(|s| s.as_slice()),
            nonce_i: &handle.nonce_i,
            nonce_r: &handle.nonce_r,
        };
        let inbound_keys = keymat(
            prf,
            &isakmp.keys.skeyid_d,
            &input(item.local_spi),
            security.encryption,
            security.auth,
        );
        let outbound_keys = keymat(
            prf,
            &isakmp.keys.skeyid_d,
            &input(item.remote_spi),
            security.encryption,
            security.auth,
        );

        db.rehash_outbound_sas(handle.if_index, &outbound_selector, &outbound_security)?;
        db.add_sa_pair(
            handle.if_index,
            SaSpec::new(item.remote_spi, outbound_selector, outbound_security, outbound_keys),
            SaSpec::new(item.local_spi, inbound_selector, inbound_security, inbound_keys),
            lifetime,
            if i == 0 { Some(soft_offset) } else { None },
        )?;
    }

    if let Some(first) = handle.sa2.first() {
        logging::log_phase2_selected(handle.msg_id, handle.sa2.len(), first.local_spi);
    }
    Ok(handle.sa2.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::policy::{ExpiryAction, PolicyAction, PolicyFlow};
    use crate::ipsec::selector::Selector;

    fn addr(s: &str) -> std::net::IpAddr {
        s.parse().unwrap()
    }

    fn esp_aes() -> SecurityProtocol {
        SecurityProtocol::esp(EncryptAlgorithm::Aes128Cbc, Some(AuthAlgorithm::HmacSha1))
    }

    fn ah_sha() -> SecurityProtocol {
        SecurityProtocol::ah(AuthAlgorithm::HmacSha1)
    }

    #[test]
    fn test_select_ah_over_esp_tunnel() {
        let tunnel = esp_aes().tunnel(addr("10.0.0.1"), addr("10.0.0.2"));
        let configured = [tunnel, ah_sha()];
        let mut spis = SpiCounter::new();
        let start = spis.peek();

        let sa2 = select_phase2_security(&configured, &tunnel, &mut spis, &[]).unwrap();
        assert_eq!(sa2.len(), 2);
        assert_eq!(sa2[0].security, ah_sha());
        assert_eq!(sa2[1].security, tunnel);
        assert_eq!(sa2[0].local_spi, start);
        assert_eq!(sa2[1].local_spi, start + 1);
        assert_eq!(spis.peek(), start + 2);
    }

    #[test]
    fn test_select_drops_other_tunnel_leg() {
        let inner = esp_aes().tunnel(addr("10.0.0.1"), addr("10.0.0.2"));
        let outer = ah_sha().tunnel(addr("10.0.0.1"), addr("10.9.9.9"));
        let configured = [inner, outer];
        let mut spis = SpiCounter::new();

        let sa2 = select_phase2_security(&configured, &inner, &mut spis, &[]).unwrap();
        assert_eq!(sa2.len(), 1);
        assert_eq!(sa2[0].security, inner);

        let sa2 = select_phase2_security(&configured, &outer, &mut spis, &[]).unwrap();
        assert_eq!(sa2.len(), 1);
        assert_eq!(sa2[0].security, outer);
    }

    #[test]
    fn test_select_nothing_matches() {
        let configured = [esp_aes()];
        let mut spis = SpiCounter::new();
        let start = spis.peek();
        let request = SecurityProtocol::esp(EncryptAlgorithm::TripleDesCbc, None);
        assert_eq!(
            select_phase2_security(&configured, &request, &mut spis, &[]).unwrap_err(),
            Error::UnallowedExchange
        );
        assert_eq!(spis.peek(), start);
    }

    #[test]
    fn test_select_ignores_encryption_of_ah_request() {
        let configured = [ah_sha()];
        let mut request = ah_sha();
        request.encryption = Some(EncryptAlgorithm::DesCbc);
        request.sa_derivation = SaDerivation::LOCAL_ADDR;
        let mut spis = SpiCounter::new();
        assert_eq!(
            select_phase2_security(&configured, &request, &mut spis, &[])
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_spi_counter_wraps_and_skips() {
        let mut spis = SpiCounter { next: IKE_SPI_END };
        assert_eq!(spis.take(&[]).unwrap(), IKE_SPI_END);
        assert_eq!(spis.take(&[IKE_SPI_START]).unwrap(), IKE_SPI_START + 1);

        let all: Vec<u32> = (IKE_SPI_START..=IKE_SPI_END).collect();
        assert_eq!(spis.take(&all).unwrap_err(), Error::NoSpiAvailable);
    }

    fn policy(security: Vec<SecurityProtocol>) -> Policy {
        let mut policy = Policy::new(
            Selector::hosts(addr("10.0.0.1"), addr("10.0.0.2")),
            PolicyAction::Apply,
            PolicyFlow::DualAsynchronous,
        )
        .with_lifetime(Lifetime::new(3_600, ExpiryAction::Refresh));
        policy.security = security;
        policy
    }

    #[test]
    fn test_offer_round_trip_and_match() {
        let mut spis = SpiCounter::new();
        let offered = vec![
            Sa2 {
                security: ah_sha(),
                local_spi: 300,
                remote_spi: 0,
            },
            Sa2 {
                security: esp_aes().tunnel(addr("10.0.0.1"), addr("10.0.0.2")),
                local_spi: 301,
                remote_spi: 0,
            },
        ];
        let body = sa_body(&offered, 1, 28_800, Some(DhGroup::Modp1024)).unwrap();
        let suites = parse_offer(&body, 4, 5).unwrap();
        assert_eq!(suites.len(), 1);
        assert_eq!(suites[0].items.len(), 2);

        // the responder's view of the same bundle
        let responder = policy(vec![
            esp_aes().tunnel(addr("10.0.0.2"), addr("10.0.0.1")),
            ah_sha(),
        ]);
        let accepted = match_offer(&responder, &suites, &mut spis, &[]).unwrap();
        assert_eq!(accepted.lifetime, 3_600);
        assert_eq!(accepted.pfs, Some(DhGroup::Modp1024));
        assert_eq!(accepted.sa2[0].remote_spi, 300);
        assert_eq!(accepted.sa2[1].remote_spi, 301);
        assert_eq!(accepted.sa2[1].security.tunnel_source, Some(addr("10.0.0.2")));

        let reply = sa_body(&accepted.sa2, accepted.number, accepted.lifetime, accepted.pfs).unwrap();
        let mut mine = offered.clone();
        let lifetime = accept_reply(&mut mine, &reply, 28_800, Some(DhGroup::Modp1024), 5).unwrap();
        assert_eq!(lifetime, 3_600);
        assert_eq!(mine[0].remote_spi, accepted.sa2[0].local_spi);
        assert_eq!(mine[1].remote_spi, accepted.sa2[1].local_spi);
    }

    #[test]
    fn test_offer_without_match() {
        let mut spis = SpiCounter::new();
        let offered = vec![Sa2 {
            security: SecurityProtocol::esp(EncryptAlgorithm::DesCbc, None),
            local_spi: 300,
            remote_spi: 0,
        }];
        let body = sa_body(&offered, 1, 600, None).unwrap();
        let suites = parse_offer(&body, 4, 5).unwrap();
        assert_eq!(
            match_offer(&policy(vec![esp_aes()]), &suites, &mut spis, &[]).unwrap_err(),
            Error::NoProposalChosen
        );

        // PFS required by the policy but not offered
        let body = sa_body(&[Sa2 { security: esp_aes(), ..offered[0] }], 1, 600, None).unwrap();
        let suites = parse_offer(&body, 4, 5).unwrap();
        let strict = policy(vec![esp_aes()]).with_pfs(DhGroup::Modp2048);
        assert!(match_offer(&strict, &suites, &mut spis, &[]).is_err());
    }

    #[test]
    fn test_reserved_spi_in_offer_rejected() {
        let offered = vec![Sa2 {
            security: esp_aes(),
            local_spi: 7,
            remote_spi: 0,
        }];
        let body = sa_body(&offered, 1, 600, None).unwrap();
        assert_eq!(parse_offer(&body, 4, 5).unwrap_err(), Error::InvalidSpi(7));
    }
}
