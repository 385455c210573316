//! Phase 1 exchanges with pre-shared key authentication
//!
//! ```text
//! Main mode                       Aggressive mode
//! I -> R  SA                      I -> R  SA, KE, Ni, IDii
//! R -> I  SA                      R -> I  SA, KE, Nr, IDir, HASH_R
//! I -> R  KE, Ni                  I -> R  HASH_I
//! R -> I  KE, Nr
//! I -> R  [IDii, HASH_I]
//! R -> I  [IDir, HASH_R]
//! ```
//!
//! The state of a handle is the number of the next message of the exchange.
//! An initiator handles even numbered messages, a responder odd ones.

use std::net::IpAddr;

use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::constants::*;
use super::dh::DhKeyPair;
use super::handle::{open, seal, Cipher, Env, Phase1Handle, Role};
use super::header::IsakmpHeader;
use super::oakley::{phase1_hash, phase1_iv, IsakmpKeys, KeyExchange};
use super::payload::{IdPayload, Message, Proposal, SaPayload};
use super::policy::{IkePolicy, Phase1Mode, Phase1Proposal};
use super::sadb::IsakmpSa;
use crate::ipsec::{Error, Result};

const UDP: u8 = 17;

/// Identification payload body of this host
fn own_id(local: IpAddr) -> Vec<u8> {
    IdPayload {
        protocol: UDP,
        port: IKE_PORT,
        ..IdPayload::from_addr(local)
    }
    .to_body()
}

fn header(handle: &Phase1Handle) -> IsakmpHeader {
    IsakmpHeader::new(handle.cookie_i, handle.cookie_r, handle.exchange_type(), 0)
}

fn chosen(handle: &Phase1Handle) -> Result<Phase1Proposal> {
    handle
        .chosen
        .ok_or_else(|| Error::InvalidState("no phase 1 proposal accepted".into()))
}

fn keys(handle: &Phase1Handle) -> Result<&IsakmpKeys> {
    handle
        .keys
        .as_ref()
        .ok_or_else(|| Error::InvalidState("phase 1 keys not derived".into()))
}

/// Build the first message of an exchange started by this host
///
/// # Errors
///
/// Returns `Error::UnallowedMode` if the policy does not allow the mode of
/// the handle, and `Error::NoProposalChosen` if it has no proposals.
pub fn initiate(env: &Env<'_>, handle: &mut Phase1Handle, policy: &IkePolicy) -> Result<Vec<u8>> {
    if handle.role != Role::Initiator || handle.state != 1 {
        return Err(Error::InvalidState("phase 1 already started".into()));
    }
    if !policy.allows_mode(handle.mode) {
        return Err(Error::UnallowedMode);
    }

    // aggressive mode sends KE with the offer, so every proposal must share
    // the group of the first one
    let first_group = policy
        .proposals
        .first()
        .map(|p| p.group)
        .ok_or(Error::NoProposalChosen)?;
    let offered: Vec<Phase1Proposal> = policy
        .proposals
        .iter()
        .filter(|p| handle.mode == Phase1Mode::Main || p.group == first_group)
        .copied()
        .collect();

    let transforms = offered
        .iter()
        .enumerate()
        .map(|(i, p)| p.to_transform(i as u8 + 1))
        .collect();
    let sa = SaPayload::new(vec![Proposal {
        number: 1,
        protocol_id: protocol::ISAKMP,
        spi: Vec::new(),
        transforms,
    }]);
    handle.sa_body = sa.to_body()?;
    handle.offered = offered;

    let mut message = Message::new(header(handle));
    message.push(PayloadType::Sa, handle.sa_body.clone());
    if handle.mode == Phase1Mode::Aggressive {
        let dh = DhKeyPair::generate(first_group, env.provider);
        handle.public_i = dh.public_key().to_vec();
        handle.dh = Some(dh);
        handle.nonce_i = env.nonce();
        message.push(PayloadType::KeyExchange, handle.public_i.clone());
        message.push(PayloadType::Nonce, handle.nonce_i.clone());
        message.push(PayloadType::Id, own_id(handle.local));
    }

    handle.state = 2;
    message.to_plain_bytes()
}

/// Process a message of a running exchange
///
/// Returns the reply, if the exchange has one at this point. The handle is
/// complete once [`Phase1Handle::is_complete`] holds.
pub fn process(
    env: &Env<'_>,
    handle: &mut Phase1Handle,
    policy: &IkePolicy,
    header: &IsakmpHeader,
    data: &[u8],
) -> Result<Option<Vec<u8>>> {
    if header.exchange_type != handle.exchange_type() {
        return Err(Error::UnexpectedMessage);
    }
    match (handle.mode, handle.role, handle.state) {
        (Phase1Mode::Main, Role::Responder, 1) => main_responder_sa(env, handle, policy, header, data),
        (Phase1Mode::Main, Role::Initiator, 2) => main_initiator_sa(env, handle, header, data),
        (Phase1Mode::Main, Role::Responder, 3) => main_responder_ke(env, handle, policy, header, data),
        (Phase1Mode::Main, Role::Initiator, 4) => main_initiator_ke(env, handle, policy, header, data),
        (Phase1Mode::Main, Role::Responder, 5) => main_responder_id(env, handle, header, data),
        (Phase1Mode::Main, Role::Initiator, 6) => main_initiator_id(env, handle, header, data),
        (Phase1Mode::Aggressive, Role::Responder, 1) => {
            aggressive_responder_offer(env, handle, policy, header, data)
        }
        (Phase1Mode::Aggressive, Role::Initiator, 2) => {
            aggressive_initiator_reply(env, handle, policy, header, data)
        }
        (Phase1Mode::Aggressive, Role::Responder, 3) => aggressive_responder_hash(env, handle, header, data),
        _ => Err(Error::UnexpectedMessage),
    }
}

/// Turn a completed handle into an ISAKMP SA
pub fn establish(mut handle: Phase1Handle) -> Result<IsakmpSa> {
    if !handle.is_complete() {
        return Err(Error::InvalidState("phase 1 not complete".into()));
    }
    let proposal = chosen(&handle)?;
    let keys = handle
        .keys
        .take()
        .ok_or_else(|| Error::InvalidState("phase 1 keys not derived".into()))?;

    // only the side that sent the last message answers its retransmission
    let sent_last = matches!(
        (handle.mode, handle.role),
        (Phase1Mode::Main, Role::Responder) | (Phase1Mode::Aggressive, Role::Initiator)
    );
    let final_sent = if sent_last {
        std::mem::take(&mut handle.retransmit.last_sent)
    } else {
        Vec::new()
    };

    Ok(IsakmpSa {
        cookie_i: handle.cookie_i,
        cookie_r: handle.cookie_r,
        role: handle.role,
        mode: handle.mode,
        group: handle.group,
        if_index: handle.if_index,
        policy_index: handle.policy_index,
        local: handle.local,
        peer: handle.peer,
        proposal,
        keys,
        last_block: handle.iv,
        final_received: handle.retransmit.last_received,
        final_sent,
        expiry_timer: None,
    })
}

fn open_plain(env: &Env<'_>, header: &IsakmpHeader, data: &[u8]) -> Result<Message> {
    Ok(open(env.provider, header, data, None, false)?.0)
}

// Decrypt with the handle's IV; the IV is committed by the caller
fn open_encrypted(
    env: &Env<'_>,
    handle: &Phase1Handle,
    header: &IsakmpHeader,
    data: &[u8],
) -> Result<(Message, Vec<u8>)> {
    let proposal = chosen(handle)?;
    let keys = keys(handle)?;
    let cipher = Cipher {
        encryption: proposal.encryption,
        key: &keys.encryption_key,
        iv: &handle.iv,
    };
    let (message, next_iv) = open(env.provider, header, data, Some(cipher), true)?;
    let next_iv = next_iv.ok_or(Error::UnexpectedMessage)?;
    Ok((message, next_iv))
}

fn seal_encrypted(env: &Env<'_>, handle: &mut Phase1Handle, mut message: Message) -> Result<Vec<u8>> {
    let proposal = chosen(handle)?;
    let keys = keys(handle)?;
    let cipher = Cipher {
        encryption: proposal.encryption,
        key: &keys.encryption_key,
        iv: &handle.iv,
    };
    let (bytes, next_iv) = seal(env.provider, &mut message, Some(cipher))?;
    if let Some(iv) = next_iv {
        handle.iv = iv;
    }
    Ok(bytes)
}

// Responder: pick one of the offered transforms; returns the SA body of
// the reply
fn select_proposal(
    env: &Env<'_>,
    handle: &mut Phase1Handle,
    policy: &IkePolicy,
    sa_body: &[u8],
) -> Result<Vec<u8>> {
    let sa = SaPayload::from_body(sa_body, env.config.max_proposals, env.config.max_transforms)?;
    if sa.doi != DOI_IPSEC {
        return Err(Error::InvalidPayload(format!("DOI {} not supported", sa.doi)));
    }
    let proposal = match sa.proposals.as_slice() {
        [p] if p.protocol_id == protocol::ISAKMP => p,
        _ => return Err(Error::NoProposalChosen),
    };

    // transforms with unsupported attributes are skipped
    let offered: Vec<(u8, Phase1Proposal)> = proposal
        .transforms
        .iter()
        .filter_map(|t| Phase1Proposal::from_transform(t).ok().map(|p| (t.number, p)))
        .collect();
    let list: Vec<Phase1Proposal> = offered.iter().map(|(_, p)| *p).collect();
    let accepted = policy.choose(&list)?;
    let number = offered
        .iter()
        .find(|(_, p)| p.same_algorithms(&accepted))
        .map_or(1, |(n, _)| *n);

    handle.sa_body = sa_body.to_vec();
    handle.offered = list;
    handle.chosen = Some(accepted);

    SaPayload {
        doi: sa.doi,
        situation: sa.situation,
        proposals: vec![Proposal {
            number: proposal.number,
            protocol_id: protocol::ISAKMP,
            spi: Vec::new(),
            transforms: vec![accepted.to_transform(number)],
        }],
    }
    .to_body()
}

// Initiator: check the transform the responder picked
fn accept_proposal(handle: &mut Phase1Handle, sa_body: &[u8]) -> Result<()> {
    let sa = SaPayload::from_body(sa_body, 1, 1)
        .map_err(|_| Error::NoProposalChosen)?;
    let transform = match sa.proposals.as_slice() {
        [p] if p.protocol_id == protocol::ISAKMP && p.transforms.len() == 1 => &p.transforms[0],
        _ => return Err(Error::NoProposalChosen),
    };
    let accepted = Phase1Proposal::from_transform(transform)?;
    let ours = handle
        .offered
        .iter()
        .find(|p| p.same_algorithms(&accepted))
        .ok_or(Error::NoProposalChosen)?;
    let lifetime = match accepted.lifetime {
        0 => ours.lifetime,
        t => t.min(ours.lifetime),
    };
    handle.chosen = Some(Phase1Proposal { lifetime, ..accepted });
    Ok(())
}

fn check_peer_id(handle: &mut Phase1Handle, id_body: &[u8]) -> Result<()> {
    let id = IdPayload::from_body(id_body)?;
    // name identities carry no address to compare
    if let Ok(spec) = id.to_addr_spec() {
        if !spec.contains_addr(&handle.peer.ip()) {
            return Err(Error::AddressMismatch);
        }
    }
    handle.peer_id = id_body.to_vec();
    Ok(())
}

fn generate_key_pair(env: &Env<'_>, handle: &mut Phase1Handle) -> Result<()> {
    let group = chosen(handle)?.group;
    let dh = DhKeyPair::generate(group, env.provider);
    match handle.role {
        Role::Initiator => {
            handle.public_i = dh.public_key().to_vec();
            handle.nonce_i = env.nonce();
        }
        Role::Responder => {
            handle.public_r = dh.public_key().to_vec();
            handle.nonce_r = env.nonce();
        }
    }
    handle.dh = Some(dh);
    Ok(())
}

fn derive_keys(handle: &mut Phase1Handle, policy: &IkePolicy) -> Result<()> {
    let proposal = chosen(handle)?;
    let dh = handle
        .dh
        .as_ref()
        .ok_or_else(|| Error::InvalidState("no Diffie-Hellman key pair".into()))?;
    let peer_public = match handle.role {
        Role::Initiator => &handle.public_r,
        Role::Responder => &handle.public_i,
    };
    let shared = Zeroizing::new(dh.compute_shared(peer_public)?);
    let keys = IsakmpKeys::derive(
        proposal.hash,
        proposal.encryption,
        &KeyExchange {
            psk: &policy.psk,
            nonce_i: &handle.nonce_i,
            nonce_r: &handle.nonce_r,
            shared_secret: &shared,
            cookie_i: &handle.cookie_i,
            cookie_r: &handle.cookie_r,
        },
    );
    handle.iv = phase1_iv(proposal.hash, proposal.encryption, &handle.public_i, &handle.public_r);
    handle.keys = Some(keys);
    handle.dh = None;
    Ok(())
}

fn hash_i(handle: &Phase1Handle, id_i: &[u8]) -> Result<Vec<u8>> {
    let proposal = chosen(handle)?;
    Ok(phase1_hash(
        proposal.hash,
        &keys(handle)?.skeyid,
        &handle.public_i,
        &handle.public_r,
        &handle.cookie_i,
        &handle.cookie_r,
        &handle.sa_body,
        id_i,
    ))
}

fn hash_r(handle: &Phase1Handle, id_r: &[u8]) -> Result<Vec<u8>> {
    let proposal = chosen(handle)?;
    Ok(phase1_hash(
        proposal.hash,
        &keys(handle)?.skeyid,
        &handle.public_r,
        &handle.public_i,
        &handle.cookie_r,
        &handle.cookie_i,
        &handle.sa_body,
        id_r,
    ))
}

fn verify(expected: &[u8], received: &[u8]) -> Result<()> {
    if bool::from(expected.ct_eq(received)) {
        Ok(())
    } else {
        Err(Error::VerifyFailed)
    }
}

fn learn_responder_cookie(handle: &mut Phase1Handle, header: &IsakmpHeader) -> Result<()> {
    if header.responder_cookie_unset() {
        return Err(Error::InvalidCookie);
    }
    handle.cookie_r = header.responder_cookie;
    Ok(())
}

fn start_responder(env: &Env<'_>, handle: &mut Phase1Handle, policy: &IkePolicy, header: &IsakmpHeader) -> Result<()> {
    if !header.responder_cookie_unset() {
        return Err(Error::InvalidCookie);
    }
    if !policy.allows_mode(handle.mode) {
        return Err(Error::UnallowedMode);
    }
    handle.cookie_r = env.cookie();
    Ok(())
}

fn main_responder_sa(
    env: &Env<'_>,
    handle: &mut Phase1Handle,
    policy: &IkePolicy,
    header: &IsakmpHeader,
    data: &[u8],
) -> Result<Option<Vec<u8>>> {
    let message = open_plain(env, header, data)?;
    message.check_payloads(&[PayloadType::Sa], &[])?;
    start_responder(env, handle, policy, header)?;
    let reply_sa = select_proposal(env, handle, policy, message.require(PayloadType::Sa, "SA")?)?;

    let mut reply = Message::new(self::header(handle));
    reply.push(PayloadType::Sa, reply_sa);
    handle.state = 3;
    Ok(Some(reply.to_plain_bytes()?))
}

fn main_initiator_sa(
    env: &Env<'_>,
    handle: &mut Phase1Handle,
    header: &IsakmpHeader,
    data: &[u8],
) -> Result<Option<Vec<u8>>> {
    let message = open_plain(env, header, data)?;
    message.check_payloads(&[PayloadType::Sa], &[])?;
    accept_proposal(handle, message.require(PayloadType::Sa, "SA")?)?;
    learn_responder_cookie(handle, header)?;
    generate_key_pair(env, handle)?;

    let mut reply = Message::new(self::header(handle));
    reply.push(PayloadType::KeyExchange, handle.public_i.clone());
    reply.push(PayloadType::Nonce, handle.nonce_i.clone());
    handle.state = 4;
    Ok(Some(reply.to_plain_bytes()?))
}

fn main_responder_ke(
    env: &Env<'_>,
    handle: &mut Phase1Handle,
    policy: &IkePolicy,
    header: &IsakmpHeader,
    data: &[u8],
) -> Result<Option<Vec<u8>>> {
    let message = open_plain(env, header, data)?;
    message.check_payloads(&[PayloadType::KeyExchange, PayloadType::Nonce], &[])?;
    handle.public_i = message.require(PayloadType::KeyExchange, "KE")?.to_vec();
    handle.nonce_i = message.require(PayloadType::Nonce, "Ni")?.to_vec();
    generate_key_pair(env, handle)?;
    derive_keys(handle, policy)?;

    let mut reply = Message::new(self::header(handle));
    reply.push(PayloadType::KeyExchange, handle.public_r.clone());
    reply.push(PayloadType::Nonce, handle.nonce_r.clone());
    handle.state = 5;
    Ok(Some(reply.to_plain_bytes()?))
}

fn main_initiator_ke(
    env: &Env<'_>,
    handle: &mut Phase1Handle,
    policy: &IkePolicy,
    header: &IsakmpHeader,
    data: &[u8],
) -> Result<Option<Vec<u8>>> {
    let message = open_plain(env, header, data)?;
    message.check_payloads(&[PayloadType::KeyExchange, PayloadType::Nonce], &[])?;
    handle.public_r = message.require(PayloadType::KeyExchange, "KE")?.to_vec();
    handle.nonce_r = message.require(PayloadType::Nonce, "Nr")?.to_vec();
    derive_keys(handle, policy)?;

    let id = own_id(handle.local);
    let hash = hash_i(handle, &id)?;
    let mut reply = Message::new(self::header(handle));
    reply.push(PayloadType::Id, id);
    reply.push(PayloadType::Hash, hash);
    let bytes = seal_encrypted(env, handle, reply)?;
    handle.state = 6;
    Ok(Some(bytes))
}

fn main_responder_id(
    env: &Env<'_>,
    handle: &mut Phase1Handle,
    header: &IsakmpHeader,
    data: &[u8],
) -> Result<Option<Vec<u8>>> {
    let (message, next_iv) = open_encrypted(env, handle, header, data)?;
    message.check_payloads(&[PayloadType::Id, PayloadType::Hash], &[])?;
    let id = message.require(PayloadType::Id, "IDii")?;
    check_peer_id(handle, id)?;
    verify(&hash_i(handle, id)?, message.require(PayloadType::Hash, "HASH_I")?)?;
    handle.iv = next_iv;

    let id = own_id(handle.local);
    let hash = hash_r(handle, &id)?;
    let mut reply = Message::new(self::header(handle));
    reply.push(PayloadType::Id, id);
    reply.push(PayloadType::Hash, hash);
    let bytes = seal_encrypted(env, handle, reply)?;
    handle.state = 7;
    Ok(Some(bytes))
}

fn main_initiator_id(
    env: &Env<'_>,
    handle: &mut Phase1Handle,
    header: &IsakmpHeader,
    data: &[u8],
) -> Result<Option<Vec<u8>>> {
    let (message, next_iv) = open_encrypted(env, handle, header, data)?;
    message.check_payloads(&[PayloadType::Id, PayloadType::Hash], &[])?;
    let id = message.require(PayloadType::Id, "IDir")?;
    check_peer_id(handle, id)?;
    verify(&hash_r(handle, id)?, message.require(PayloadType::Hash, "HASH_R")?)?;
    handle.iv = next_iv;
    handle.state = 7;
    Ok(None)
}

fn aggressive_responder_offer(
    env: &Env<'_>,
    handle: &mut Phase1Handle,
    policy: &IkePolicy,
    header: &IsakmpHeader,
    data: &[u8],
) -> Result<Option<Vec<u8>>> {
    let message = open_plain(env, header, data)?;
    message.check_payloads(
        &[PayloadType::Sa, PayloadType::KeyExchange, PayloadType::Nonce, PayloadType::Id],
        &[],
    )?;
    start_responder(env, handle, policy, header)?;
    let reply_sa = select_proposal(env, handle, policy, message.require(PayloadType::Sa, "SA")?)?;
    handle.public_i = message.require(PayloadType::KeyExchange, "KE")?.to_vec();
    handle.nonce_i = message.require(PayloadType::Nonce, "Ni")?.to_vec();
    check_peer_id(handle, message.require(PayloadType::Id, "IDii")?)?;
    generate_key_pair(env, handle)?;
    derive_keys(handle, policy)?;

    let id = own_id(handle.local);
    let hash = hash_r(handle, &id)?;
    let mut reply = Message::new(self::header(handle));
    reply.push(PayloadType::Sa, reply_sa);
    reply.push(PayloadType::KeyExchange, handle.public_r.clone());
    reply.push(PayloadType::Nonce, handle.nonce_r.clone());
    reply.push(PayloadType::Id, id);
    reply.push(PayloadType::Hash, hash);
    handle.state = 3;
    Ok(Some(reply.to_plain_bytes()?))
}

fn aggressive_initiator_reply(
    env: &Env<'_>,
    handle: &mut Phase1Handle,
    policy: &IkePolicy,
    header: &IsakmpHeader,
    data: &[u8],
) -> Result<Option<Vec<u8>>> {
    let message = open_plain(env, header, data)?;
    message.check_payloads(
        &[
            PayloadType::Sa,
            PayloadType::KeyExchange,
            PayloadType::Nonce,
            PayloadType::Id,
            PayloadType::Hash,
        ],
        &[],
    )?;
    accept_proposal(handle, message.require(PayloadType::Sa, "SA")?)?;
    learn_responder_cookie(handle, header)?;
    handle.public_r = message.require(PayloadType::KeyExchange, "KE")?.to_vec();
    handle.nonce_r = message.require(PayloadType::Nonce, "Nr")?.to_vec();
    let id = message.require(PayloadType::Id, "IDir")?;
    check_peer_id(handle, id)?;
    derive_keys(handle, policy)?;
    verify(&hash_r(handle, id)?, message.require(PayloadType::Hash, "HASH_R")?)?;

    let hash = hash_i(handle, &own_id(handle.local))?;
    let mut reply = Message::new(self::header(handle));
    reply.push(PayloadType::Hash, hash);
    handle.state = 4;
    Ok(Some(reply.to_plain_bytes()?))
}

fn aggressive_responder_hash(
    env: &Env<'_>,
    handle: &mut Phase1Handle,
    header: &IsakmpHeader,
    data: &[u8],
) -> Result<Option<Vec<u8>>> {
    let message = open_plain(env, header, data)?;
    message.check_payloads(&[PayloadType::Hash], &[])?;
    let peer_id = handle.peer_id.clone();
    verify(&hash_i(handle, &peer_id)?, message.require(PayloadType::Hash, "HASH_I")?)?;
    handle.state = 4;
    Ok(None)
}
