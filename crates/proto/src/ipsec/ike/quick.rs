//! Quick mode
//!
//! ```text
//! I -> R  [HASH(1), SA, Ni, [KE], [IDci, IDcr]]
//! R -> I  [HASH(2), SA, Nr, [KE], [IDci, IDcr]]
//! I -> R  [HASH(3)]
//! ```
//!
//! Every message is encrypted under the ISAKMP SA. The IV chain starts
//! from the last phase 1 block and the message id.

use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::constants::*;
use super::dh::DhKeyPair;
use super::handle::{open, seal, Cipher, Env, Phase2Handle, Role};
use super::header::IsakmpHeader;
use super::ips::{self, SpiCounter, Suite};
use super::oakley::{exchange_iv, message_hash, quick_hash2, quick_hash3};
use super::payload::{join_payloads, IdPayload, Message, RawPayload};
use super::sadb::IsakmpSa;
use crate::ipsec::policy::Policy;
use crate::ipsec::selector::{IpFamily, Selector};
use crate::ipsec::{Error, Result};

/// First quick mode message, decrypted and authenticated
#[derive(Debug)]
pub struct QuickOffer {
    /// Message id
    pub msg_id: u32,
    /// Traffic to protect as seen by the initiator
    pub selector: Selector,
    /// Offered protection suites
    pub suites: Vec<Suite>,
    /// Initiator nonce body
    pub nonce_i: Vec<u8>,
    /// Initiator public value when PFS is offered
    pub public_i: Option<Vec<u8>>,
    /// Identity payload bodies, echoed in the reply
    pub ids: Vec<Vec<u8>>,
    /// IV for the reply
    pub iv: Vec<u8>,
}

fn header(sa: &IsakmpSa, msg_id: u32) -> IsakmpHeader {
    IsakmpHeader::new(sa.cookie_i, sa.cookie_r, ExchangeType::Quick, msg_id)
}

fn cipher<'a>(sa: &'a IsakmpSa, iv: &'a [u8]) -> Cipher<'a> {
    Cipher {
        encryption: sa.proposal.encryption,
        key: &sa.keys.encryption_key,
        iv,
    }
}

// HASH first, then the payloads it covers
fn hashed(header: IsakmpHeader, hash: Vec<u8>, rest: Vec<RawPayload>) -> Message {
    let mut message = Message::new(header);
    message.push(PayloadType::Hash, hash);
    message.payloads.extend(rest);
    message
}

fn verify(expected: &[u8], message: &Message) -> Result<()> {
    match message.payloads.first() {
        Some(first) if first.kind == PayloadType::Hash => {
            if bool::from(expected.ct_eq(&first.body)) {
                Ok(())
            } else {
                Err(Error::VerifyFailed)
            }
        }
        _ => Err(Error::MissingPayload("HASH")),
    }
}

fn identities(selector: &Selector, fallback: IpFamily) -> [Vec<u8>; 2] {
    let family = selector
        .source
        .family()
        .or_else(|| selector.destination.family())
        .unwrap_or(fallback);
    [
        IdPayload::from_addr_spec(&selector.source, family, selector.protocol, selector.source_port)
            .to_body(),
        IdPayload::from_addr_spec(
            &selector.destination,
            family,
            selector.protocol,
            selector.destination_port,
        )
        .to_body(),
    ]
}

fn selector_from_ids(ids: &[&[u8]], sa: &IsakmpSa) -> Result<Selector> {
    match ids {
        [] => Ok(Selector::hosts(sa.peer.ip(), sa.local)),
        [client_i, client_r] => {
            let id_i = IdPayload::from_body(client_i)?;
            let id_r = IdPayload::from_body(client_r)?;
            if id_i.protocol != id_r.protocol {
                return Err(Error::InvalidPayload("identities name different protocols".into()));
            }
            let selector = Selector::new(id_i.to_addr_spec()?, id_r.to_addr_spec()?)
                .with_protocol(id_i.protocol)
                .with_ports(id_i.port, id_r.port);
            selector.validate()?;
            Ok(selector)
        }
        _ => Err(Error::InvalidPayload(format!("{} identities in quick mode", ids.len()))),
    }
}

fn pfs_secret(dh: &DhKeyPair, public: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    Ok(Zeroizing::new(dh.compute_shared(public)?))
}

/// Build the first message of an exchange
///
/// The handle must carry the selected SA2 items, the lifetime and the PFS
/// group.
pub fn initiate(env: &Env<'_>, handle: &mut Phase2Handle, sa: &IsakmpSa) -> Result<Vec<u8>> {
    if handle.role != Role::Initiator || handle.state != 1 {
        return Err(Error::InvalidState("quick mode already started".into()));
    }
    if handle.sa2.is_empty() {
        return Err(Error::InvalidState("no security protocols selected".into()));
    }
    handle.cookie_i = sa.cookie_i;
    handle.cookie_r = sa.cookie_r;
    handle.iv = exchange_iv(sa.proposal.hash, sa.proposal.encryption, &sa.last_block, handle.msg_id);
    handle.nonce_i = env.nonce();

    let mut rest = vec![
        RawPayload::new(
            PayloadType::Sa,
            ips::sa_body(&handle.sa2, 1, handle.lifetime, handle.pfs)?,
        ),
        RawPayload::new(PayloadType::Nonce, handle.nonce_i.clone()),
    ];
    if let Some(group) = handle.pfs {
        let dh = DhKeyPair::generate(group, env.provider);
        rest.push(RawPayload::new(PayloadType::KeyExchange, dh.public_key().to_vec()));
        handle.dh = Some(dh);
    }
    for id in identities(&handle.selector, IpFamily::of(&sa.local)) {
        rest.push(RawPayload::new(PayloadType::Id, id));
    }

    let hash = message_hash(sa.proposal.hash, &sa.keys.skeyid_a, handle.msg_id, &join_payloads(&rest)?.1);
    let mut message = hashed(header(sa, handle.msg_id), hash, rest);
    let (bytes, next_iv) = seal(env.provider, &mut message, Some(cipher(sa, &handle.iv)))?;
    if let Some(iv) = next_iv {
        handle.iv = iv;
    }
    handle.state = 2;
    Ok(bytes)
}

/// Decrypt and authenticate the first message of an exchange started by
/// the peer
pub fn parse_offer(env: &Env<'_>, sa: &IsakmpSa, header: &IsakmpHeader, data: &[u8]) -> Result<QuickOffer> {
    let msg_id = header.message_id;
    let iv = exchange_iv(sa.proposal.hash, sa.proposal.encryption, &sa.last_block, msg_id);
    let (message, next_iv) = open(env.provider, header, data, Some(cipher(sa, &iv)), true)?;
    let next_iv = next_iv.ok_or(Error::UnexpectedMessage)?;

    message.check_payloads(
        &[
            PayloadType::Hash,
            PayloadType::Sa,
            PayloadType::Nonce,
            PayloadType::KeyExchange,
            PayloadType::Id,
        ],
        &[PayloadType::Id],
    )?;
    let expected = message_hash(sa.proposal.hash, &sa.keys.skeyid_a, msg_id, &message.bytes_after_first()?);
    verify(&expected, &message)?;

    let ids = message.find_all(PayloadType::Id);
    let selector = selector_from_ids(&ids, sa)?;
    let suites = ips::parse_offer(
        message.require(PayloadType::Sa, "SA")?,
        env.config.max_proposals,
        env.config.max_transforms,
    )?;
    Ok(QuickOffer {
        msg_id,
        selector,
        suites,
        nonce_i: message.require(PayloadType::Nonce, "Ni")?.to_vec(),
        public_i: message.find(PayloadType::KeyExchange).map(<[u8]>::to_vec),
        ids: ids.into_iter().map(<[u8]>::to_vec).collect(),
        iv: next_iv,
    })
}

/// Accept an offer against `policy` and build the second message
///
/// The handle must have been created for the offer's message id and
/// selector.
pub fn respond(
    env: &Env<'_>,
    handle: &mut Phase2Handle,
    sa: &IsakmpSa,
    offer: QuickOffer,
    policy: &Policy,
    spis: &mut SpiCounter,
    in_use: &[u32],
) -> Result<Vec<u8>> {
    if handle.role != Role::Responder || handle.state != 1 || handle.msg_id != offer.msg_id {
        return Err(Error::InvalidState("quick mode offer for another exchange".into()));
    }
    let accepted = ips::match_offer(policy, &offer.suites, spis, in_use)?;
    handle.cookie_i = sa.cookie_i;
    handle.cookie_r = sa.cookie_r;
    handle.policy_index = policy.index;
    handle.sa2 = accepted.sa2;
    handle.lifetime = accepted.lifetime;
    handle.pfs = accepted.pfs;
    handle.nonce_i = offer.nonce_i;
    handle.nonce_r = env.nonce();
    handle.iv = offer.iv;

    let mut rest = vec![
        RawPayload::new(
            PayloadType::Sa,
            ips::sa_body(&handle.sa2, accepted.number, handle.lifetime, handle.pfs)?,
        ),
        RawPayload::new(PayloadType::Nonce, handle.nonce_r.clone()),
    ];
    match (handle.pfs, offer.public_i) {
        (Some(group), Some(public_i)) => {
            let dh = DhKeyPair::generate(group, env.provider);
            handle.pfs_secret = Some(pfs_secret(&dh, &public_i)?);
            rest.push(RawPayload::new(PayloadType::KeyExchange, dh.public_key().to_vec()));
        }
        (Some(_), None) => return Err(Error::MissingPayload("KE")),
        (None, Some(_)) => return Err(Error::UnexpectedPayload(PayloadType::KeyExchange.to_u8())),
        (None, None) => {}
    }
    for id in offer.ids {
        rest.push(RawPayload::new(PayloadType::Id, id));
    }

    let hash = quick_hash2(
        sa.proposal.hash,
        &sa.keys.skeyid_a,
        handle.msg_id,
        &handle.nonce_i,
        &join_payloads(&rest)?.1,
    );
    let mut message = hashed(header(sa, handle.msg_id), hash, rest);
    let (bytes, next_iv) = seal(env.provider, &mut message, Some(cipher(sa, &handle.iv)))?;
    if let Some(iv) = next_iv {
        handle.iv = iv;
    }
    handle.state = 3;
    Ok(bytes)
}

/// Process the responder's answer and build the final message
///
/// On success the handle is complete and the SAs can be installed.
pub fn process_reply(
    env: &Env<'_>,
    handle: &mut Phase2Handle,
    sa: &IsakmpSa,
    header: &IsakmpHeader,
    data: &[u8],
) -> Result<Vec<u8>> {
    if handle.role != Role::Initiator || handle.state != 2 {
        return Err(Error::UnexpectedMessage);
    }
    let (message, next_iv) = open(env.provider, header, data, Some(cipher(sa, &handle.iv)), true)?;
    let next_iv = next_iv.ok_or(Error::UnexpectedMessage)?;
    message.check_payloads(
        &[
            PayloadType::Hash,
            PayloadType::Sa,
            PayloadType::Nonce,
            PayloadType::KeyExchange,
            PayloadType::Id,
        ],
        &[PayloadType::Id],
    )?;
    let expected = quick_hash2(
        sa.proposal.hash,
        &sa.keys.skeyid_a,
        handle.msg_id,
        &handle.nonce_i,
        &message.bytes_after_first()?,
    );
    verify(&expected, &message)?;

    let ids = message.find_all(PayloadType::Id);
    if !ids.is_empty() {
        let sent = identities(&handle.selector, IpFamily::of(&sa.local));
        if ids.len() != 2 || ids[0] != sent[0].as_slice() || ids[1] != sent[1].as_slice() {
            return Err(Error::InvalidPayload("identities changed by the responder".into()));
        }
    }

    let lifetime = ips::accept_reply(
        &mut handle.sa2,
        message.require(PayloadType::Sa, "SA")?,
        handle.lifetime,
        handle.pfs,
        env.config.max_transforms,
    )?;
    let nonce_r = message.require(PayloadType::Nonce, "Nr")?.to_vec();
    match (&handle.dh, message.find(PayloadType::KeyExchange)) {
        (Some(dh), Some(public_r)) => handle.pfs_secret = Some(pfs_secret(dh, public_r)?),
        (Some(_), None) => return Err(Error::MissingPayload("KE")),
        (None, Some(_)) => return Err(Error::UnexpectedPayload(PayloadType::KeyExchange.to_u8())),
        (None, None) => {}
    }
    handle.dh = None;
    handle.lifetime = lifetime;
    handle.nonce_r = nonce_r;
    handle.iv = next_iv;

    let hash = quick_hash3(
        sa.proposal.hash,
        &sa.keys.skeyid_a,
        handle.msg_id,
        &handle.nonce_i,
        &handle.nonce_r,
    );
    let mut message = hashed(self::header(sa, handle.msg_id), hash, Vec::new());
    let (bytes, next_iv) = seal(env.provider, &mut message, Some(cipher(sa, &handle.iv)))?;
    if let Some(iv) = next_iv {
        handle.iv = iv;
    }
    handle.state = 4;
    Ok(bytes)
}

/// Process the initiator's final message
pub fn process_final(
    env: &Env<'_>,
    handle: &mut Phase2Handle,
    sa: &IsakmpSa,
    header: &IsakmpHeader,
    data: &[u8],
) -> Result<()> {
    if handle.role != Role::Responder || handle.state != 3 {
        return Err(Error::UnexpectedMessage);
    }
    let (message, next_iv) = open(env.provider, header, data, Some(cipher(sa, &handle.iv)), true)?;
    message.check_payloads(&[PayloadType::Hash], &[])?;
    let expected = quick_hash3(
        sa.proposal.hash,
        &sa.keys.skeyid_a,
        handle.msg_id,
        &handle.nonce_i,
        &handle.nonce_r,
    );
    verify(&expected, &message)?;
    if let Some(iv) = next_iv {
        handle.iv = iv;
    }
    handle.state = 4;
    Ok(())
}
