//! IKE engine
//!
//! [`IkeContext`] owns the IKE policy groups, the ISAKMP SA database and the
//! running exchanges. Every entry point takes the module lock with a
//! bounded wait; messages produced while it is held are queued and handed
//! to the [`Transmitter`] after it is released.
//!
//! # Lock order
//!
//! The engine lock is taken before the IPsec database lock. SA lifetime
//! events are passed to the database without the engine lock, since a soft
//! expiry may come back as a new negotiation request.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};
use strata_platform::{ModuleState, SecurityModule, SortedList, StrataResult};
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::constants::*;
use super::handle::{Env, Phase1Handle, Phase2Handle, Retransmit, Role};
use super::header::IsakmpHeader;
use super::info::{self, InfoItem};
use super::ips::{self, SpiCounter};
use super::payload::{DeletePayload, NotifyPayload};
use super::phase1;
use super::policy::{IkeGroup, IkePolicy, InfoFlags, Phase1Mode};
use super::quick;
use super::sadb::{IkeSadb, IsakmpSa};
use super::slots::SlotTable;
use super::transport::Transmitter;
use crate::ipsec::config::IkeConfig;
use crate::ipsec::logging;
use crate::ipsec::policy::{Direction, IpsecProtocol, PolicyAction, SecurityProtocol};
use crate::ipsec::selector::Selector;
use crate::ipsec::spd::{IpsecDb, SaRequest, SaRequester};
use crate::ipsec::timer::{TimerEvent, TimerId, TimerService};
use crate::ipsec::{Error, Result};

/// Completed quick mode exchanges remembered for retransmissions
const FINISHED_CACHE: usize = 16;

type Outbox = Vec<(SocketAddr, Vec<u8>)>;

/// Request to negotiate SAs with a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitiateRequest {
    /// Interface the SAs are for
    pub if_index: u32,
    /// Peer to negotiate with
    pub remote: IpAddr,
    /// Traffic to protect, from the local point of view
    pub selector: Selector,
    /// Security protocol the traffic is missing
    pub security: SecurityProtocol,
}

impl InitiateRequest {
    /// Create a request
    pub fn new(if_index: u32, remote: IpAddr, selector: Selector, security: SecurityProtocol) -> Self {
        InitiateRequest {
            if_index,
            remote,
            selector,
            security,
        }
    }
}

/// Counts of the engine's state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IkeStatus {
    /// Phase 1 exchanges running
    pub phase1_exchanges: usize,
    /// Quick mode exchanges running or queued
    pub phase2_exchanges: usize,
    /// Quick mode exchanges waiting for phase 1
    pub queued: usize,
    /// Established ISAKMP SAs
    pub isakmp_sas: usize,
    /// Callers blocked in [`IkeContext::initiate_blocking`]
    pub waiting: usize,
}

#[derive(Debug)]
struct Finished {
    cookie_i: [u8; COOKIE_LEN],
    msg_id: u32,
    received: Vec<u8>,
    sent: Vec<u8>,
}

struct IkeState {
    groups: SortedList<IkeGroup>,
    sadb: IkeSadb,
    phase1: Vec<Phase1Handle>,
    phase2: Vec<Phase2Handle>,
    spis: SpiCounter,
    slots: SlotTable,
    finished: VecDeque<Finished>,
}

impl IkeState {
    fn policy(&self, group: &str, index: u32) -> Result<IkePolicy> {
        self.groups
            .get(group)
            .ok_or_else(|| Error::GroupNotFound(group.to_string()))?
            .policy(index)
            .cloned()
            .ok_or(Error::PolicyNotFound)
    }

    fn info_flags(&self, group: &str, index: u32) -> InfoFlags {
        self.policy(group, index).map(|p| p.info).unwrap_or_default()
    }

    fn phase2_index(&self, msg_id: u32) -> Option<usize> {
        self.phase2.iter().position(|h| h.msg_id == msg_id)
    }

    // quick mode handles of a vanished ISAKMP SA
    fn orphan_phase2(&mut self, cookie_i: &[u8; COOKIE_LEN]) {
        for handle in self.phase2.iter_mut().filter(|h| h.cookie_i == *cookie_i) {
            handle.delete_pending = true;
        }
    }
}

/// IKEv1 key exchange daemon
pub struct IkeContext {
    config: IkeConfig,
    ipsec: Arc<IpsecDb>,
    timer: Arc<dyn TimerService>,
    transmitter: Arc<dyn Transmitter>,
    local: IpAddr,
    state: Mutex<IkeState>,
    module_state: RwLock<ModuleState>,
}

impl std::fmt::Debug for IkeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IkeContext")
            .field("local", &self.local)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl IkeContext {
    /// Create a stopped engine and register it as the SA requester of
    /// `ipsec`
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidParameter` if the configuration is invalid.
    pub fn new(
        config: IkeConfig,
        ipsec: Arc<IpsecDb>,
        timer: Arc<dyn TimerService>,
        transmitter: Arc<dyn Transmitter>,
        local: IpAddr,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let state = IkeState {
            groups: SortedList::new(),
            sadb: IkeSadb::new(),
            phase1: Vec::new(),
            phase2: Vec::new(),
            spis: SpiCounter::new(),
            slots: SlotTable::new(config.max_wait_events),
            finished: VecDeque::with_capacity(FINISHED_CACHE),
        };
        let context = Arc::new(IkeContext {
            config,
            ipsec,
            timer,
            transmitter,
            local,
            state: Mutex::new(state),
            module_state: RwLock::new(ModuleState::Stopped),
        });
        let requester: Arc<dyn SaRequester> = context.clone();
        context.ipsec.set_sa_requester(Arc::downgrade(&requester));
        Ok(context)
    }

    /// Configuration in use
    pub fn config(&self) -> &IkeConfig {
        &self.config
    }

    /// IPsec database the engine installs SAs into
    pub fn ipsec(&self) -> &Arc<IpsecDb> {
        &self.ipsec
    }

    /// Accept requests and messages
    pub fn start(&self) {
        *self.module_state.write() = ModuleState::Running;
        info!(local = %self.local, "IKE daemon started");
    }

    /// Stop the daemon, dropping every exchange and ISAKMP SA
    ///
    /// Blocked callers are woken with `Error::InvalidState`.
    pub fn stop(&self) -> Result<()> {
        *self.module_state.write() = ModuleState::Stopped;
        let mut state = self.lock()?;
        for handle in std::mem::take(&mut state.phase1) {
            self.cancel(handle.retransmit.timer);
            self.cancel(handle.timeout_timer);
        }
        for handle in std::mem::take(&mut state.phase2) {
            self.cancel(handle.retransmit.timer);
            self.cancel(handle.timeout_timer);
        }
        for sa in state.sadb.clear() {
            self.cancel(sa.expiry_timer);
        }
        state.finished.clear();
        state
            .slots
            .fail_all(&Error::InvalidState("IKE daemon stopped".into()));
        info!(local = %self.local, "IKE daemon stopped");
        Ok(())
    }

    /// Counts of exchanges and SAs
    pub fn status(&self) -> Result<IkeStatus> {
        let state = self.lock()?;
        Ok(IkeStatus {
            phase1_exchanges: state.phase1.len(),
            phase2_exchanges: state.phase2.len(),
            queued: state.phase2.iter().filter(|h| h.is_queued()).count(),
            isakmp_sas: state.sadb.len(),
            waiting: state.slots.in_use(),
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.module_state.read().is_running() {
            Ok(())
        } else {
            Err(Error::InvalidState("IKE daemon not running".into()))
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, IkeState>> {
        self.state
            .try_lock_for(self.config.lock_timeout)
            .ok_or(Error::LockTimeout("ike"))
    }

    fn env(&self) -> Env<'_> {
        Env {
            config: &self.config,
            provider: self.ipsec.provider(),
        }
    }

    fn flush(&self, outbox: Outbox) {
        for (to, data) in outbox {
            let exchange = data
                .get(18)
                .and_then(|t| ExchangeType::from_u8(*t))
                .map_or("unknown", ExchangeType::name);
            logging::log_message_send(exchange, &to.ip(), data.len());
            self.transmitter.send(to, data);
        }
    }

    fn cancel(&self, id: Option<TimerId>) {
        if let Some(id) = id {
            self.timer.cancel(id);
        }
    }

    // Record and queue a message, restarting the resend timer
    fn transmit(
        &self,
        retransmit: &mut Retransmit,
        cookie: [u8; COOKIE_LEN],
        msg_id: u32,
        peer: SocketAddr,
        message: Vec<u8>,
        outbox: &mut Outbox,
    ) {
        retransmit.sent(&message, self.config.resend_count);
        self.cancel(retransmit.timer.take());
        if self.config.resend_count > 0 {
            retransmit.timer = Some(
                self.timer
                    .schedule(self.config.resend_interval, TimerEvent::IkeResend { cookie, msg_id }),
            );
        }
        outbox.push((peer, message));
    }

    fn exchange_timeout(&self, cookie: [u8; COOKIE_LEN], msg_id: u32) -> TimerId {
        let limit = if msg_id == 0 {
            self.config.phase1_timeout
        } else {
            self.config.phase2_timeout
        };
        self.timer
            .schedule(limit, TimerEvent::IkeExchangeTimeout { cookie, msg_id })
    }

    // ---- administration ----

    /// Create an IKE policy group
    ///
    /// # Errors
    ///
    /// - `Error::InvalidParameter` for an empty or too long name
    /// - `Error::DuplicateName` if the group exists
    pub fn add_group(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.len() > self.config.max_group_name_len {
            return Err(Error::InvalidParameter(format!("invalid group name {:?}", name)));
        }
        self.lock()?.groups.insert(IkeGroup::new(name))?;
        Ok(())
    }

    /// Remove an IKE policy group
    pub fn remove_group(&self, name: &str) -> Result<()> {
        self.lock()?
            .groups
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::GroupNotFound(name.to_string()))
    }

    /// Validate and add an IKE policy, returning its index
    pub fn add_policy(&self, group: &str, policy: IkePolicy) -> Result<u32> {
        policy.validate(self.config.max_transforms)?;
        let mut state = self.lock()?;
        let group = state
            .groups
            .get_mut(group)
            .ok_or_else(|| Error::GroupNotFound(group.to_string()))?;
        Ok(group.add_policy(policy))
    }

    /// Remove an IKE policy
    pub fn remove_policy(&self, group: &str, index: u32) -> Result<()> {
        let mut state = self.lock()?;
        state
            .groups
            .get_mut(group)
            .ok_or_else(|| Error::GroupNotFound(group.to_string()))?
            .remove_policy(index)
            .map(|_| ())
    }

    /// Delete local inbound SAs and tell the peer
    ///
    /// The SAs are removed together with their outbound pairs. The peer is
    /// informed when an ISAKMP SA with it exists and its policy allows
    /// informational exchanges.
    pub fn send_delete_notification(
        &self,
        group: &str,
        peer: &IpAddr,
        kind: IpsecProtocol,
        spis: &[u32],
    ) -> Result<()> {
        self.ensure_running()?;
        for spi in spis {
            self.ipsec.remove_inbound_sa(group, *spi, kind)?;
        }

        let mut outbox = Vec::new();
        {
            let state = self.lock()?;
            if let Some(sa) = state.sadb.find_by_peer(group, peer) {
                if state.info_flags(&sa.group, sa.policy_index).phase2 {
                    let protocol_id = match kind {
                        IpsecProtocol::Ah => protocol::AH,
                        IpsecProtocol::Esp => protocol::ESP,
                    };
                    let delete = DeletePayload::ipsec(protocol_id, spis);
                    outbox.push((sa.peer, info::build(&self.env(), sa, &[InfoItem::Delete(delete)])?));
                    self.ipsec.metrics().record_notification_sent();
                }
            }
        }
        self.flush(outbox);
        Ok(())
    }

    /// Drop every IPsec and ISAKMP SA with `peer`
    ///
    /// Returns the number of SAs removed.
    pub fn remove_sa_by_addr(&self, group: &str, peer: &IpAddr) -> Result<usize> {
        let mut state = self.lock()?;
        let mut removed = self.ipsec.remove_sas_by_addr(group, peer)?;
        for sa in state.sadb.remove_peer(peer, None) {
            self.cancel(sa.expiry_timer);
            state.orphan_phase2(&sa.cookie_i);
            removed += 1;
        }
        Ok(removed)
    }

    // ---- negotiation requests ----

    /// Start negotiating SAs for `request` without waiting
    ///
    /// Returns the message id of the quick mode exchange. The exchange
    /// runs right away over an existing ISAKMP SA with the peer, waits for
    /// a phase 1 exchange already under way, or starts a new one.
    ///
    /// # Errors
    ///
    /// - `Error::PolicyNotFound` if no IPsec or IKE policy covers the request
    /// - `Error::UnallowedExchange` if the policies do not permit it
    pub fn initiate(&self, request: &InitiateRequest) -> Result<u32> {
        let mut outbox = Vec::new();
        let result = self.start_negotiation(request, false, &mut outbox);
        self.flush(outbox);
        result.map(|(msg_id, _)| msg_id)
    }

    /// Negotiate SAs for `request` and wait until they are installed
    ///
    /// At most `max_wait_events` callers may wait at the same time.
    ///
    /// # Errors
    ///
    /// - `Error::TooManyBlockingExchanges` if every wait slot is taken
    /// - `Error::Timeout` if the exchange did not finish within the
    ///   blocking timeout
    /// - the error the exchange failed with
    pub async fn initiate_blocking(&self, request: &InitiateRequest) -> Result<()> {
        let mut outbox = Vec::new();
        let started = self.start_negotiation(request, true, &mut outbox);
        self.flush(outbox);
        let (msg_id, waiter) = started?;
        let (slot, receiver) = waiter.ok_or_else(|| Error::Internal("no wait slot reserved".into()))?;

        match tokio::time::timeout(self.config.blocking_timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::InvalidState("exchange dropped".into())),
            Err(_) => {
                if let Ok(mut state) = self.lock() {
                    state.slots.release(slot, msg_id);
                    if let Some(index) = state.phase2_index(msg_id) {
                        state.phase2[index].slot = None;
                    }
                }
                Err(Error::Timeout)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn start_negotiation(
        &self,
        request: &InitiateRequest,
        blocking: bool,
        outbox: &mut Outbox,
    ) -> Result<(u32, Option<(usize, oneshot::Receiver<Result<()>>)>)> {
        self.ensure_running()?;
        let group = self.ipsec.group_by_interface(request.if_index)?;
        let policy_index = self
            .ipsec
            .get_policy_index(&group, &request.selector, Direction::Outbound)?;
        let policy = self.ipsec.get_policy(&group, policy_index)?;
        if policy.action != PolicyAction::Apply {
            return Err(Error::PolicyMismatch);
        }
        let in_use = self.ipsec.inbound_spis(&group)?;

        let env = self.env();
        let mut guard = self.lock()?;
        let state = &mut *guard;
        if blocking && !state.slots.has_free() {
            return Err(Error::TooManyBlockingExchanges);
        }
        let ike_policy = state
            .groups
            .get(&group)
            .ok_or_else(|| Error::GroupNotFound(group.clone()))?
            .policy_for_peer(&request.remote)
            .cloned()
            .ok_or(Error::PolicyNotFound)?;
        if !ike_policy.permits(&request.selector) {
            return Err(Error::UnallowedExchange);
        }
        let sa2 = ips::select_phase2_security(&policy.security, &request.security, &mut state.spis, &in_use)?;

        let msg_id = loop {
            let id = env.message_id();
            if state.phase2_index(id).is_none() {
                break id;
            }
        };
        let peer = SocketAddr::new(request.remote, IKE_PORT);
        let mut handle = Phase2Handle::new(
            msg_id,
            Role::Initiator,
            &group,
            request.if_index,
            peer,
            request.selector,
            policy_index,
        );
        handle.request = Some(request.security);
        handle.sa2 = sa2;
        handle.lifetime = policy.lifetime.seconds;
        handle.pfs = policy.pfs_group;
        let waiter = if blocking {
            let (slot, receiver) = state.slots.reserve(msg_id)?;
            handle.slot = Some(slot);
            Some((slot, receiver))
        } else {
            None
        };
        state.phase2.push(handle);

        let established = state.sadb.find_by_peer(&group, &request.remote).is_some();
        let running = state
            .phase1
            .iter()
            .position(|h| h.group == group && h.peer.ip() == request.remote);
        let started = if established {
            self.start_quick(state, msg_id, outbox)
        } else if let Some(index) = running {
            debug!(msg_id = format_args!("{:#010x}", msg_id), "Quick mode queued behind phase 1");
            state.phase1[index].queued.push(msg_id);
            Ok(())
        } else {
            self.start_phase1(state, &group, request.if_index, peer, &ike_policy, msg_id, outbox)
        };
        if let Err(e) = started {
            self.abort_phase2(state, msg_id, &e, false, outbox);
            return Err(e);
        }
        Ok((msg_id, waiter))
    }

    #[allow(clippy::too_many_arguments)]
    fn start_phase1(
        &self,
        state: &mut IkeState,
        group: &str,
        if_index: u32,
        peer: SocketAddr,
        policy: &IkePolicy,
        msg_id: u32,
        outbox: &mut Outbox,
    ) -> Result<()> {
        let env = self.env();
        let mode = if policy.allows_mode(self.config.default_phase1_mode) {
            self.config.default_phase1_mode
        } else {
            policy.initiator_mode()
        };
        let mut handle = Phase1Handle::new(
            env.cookie(),
            Role::Initiator,
            mode,
            group,
            if_index,
            policy.index,
            self.local,
            peer,
        );
        let message = phase1::initiate(&env, &mut handle, policy)?;
        handle.queued.push(msg_id);
        handle.timeout_timer = Some(self.exchange_timeout(handle.cookie_i, 0));
        logging::log_ike_state_transition(&handle.cookie_i, &handle.cookie_r, mode.name(), 1, handle.state);
        let cookie = handle.cookie_i;
        self.transmit(&mut handle.retransmit, cookie, 0, peer, message, outbox);
        state.phase1.push(handle);
        Ok(())
    }

    fn start_quick(&self, state: &mut IkeState, msg_id: u32, outbox: &mut Outbox) -> Result<()> {
        let env = self.env();
        let IkeState { sadb, phase2, .. } = state;
        let handle = phase2
            .iter_mut()
            .find(|h| h.msg_id == msg_id)
            .ok_or_else(|| Error::NotFound(format!("exchange {:#010x}", msg_id)))?;
        let sa = sadb
            .find_by_peer(&handle.group, &handle.peer.ip())
            .ok_or_else(|| Error::SaNotFound("ISAKMP SA".into()))?;
        let message = quick::initiate(&env, handle, sa)?;
        handle.peer = sa.peer;
        handle.timeout_timer = Some(self.exchange_timeout(handle.cookie_i, msg_id));
        logging::log_ike_state_transition(&handle.cookie_i, &handle.cookie_r, "quick", 1, handle.state);
        let (cookie, peer) = (handle.cookie_i, handle.peer);
        self.transmit(&mut handle.retransmit, cookie, msg_id, peer, message, outbox);
        Ok(())
    }

    // ---- received messages ----

    /// Process a datagram received from `from` on `if_index`
    ///
    /// Replies and notifications are sent before returning. Messages that
    /// fail to parse, come from the wrong address, or break an exchange
    /// are counted as dropped and reported as errors; a broken exchange is
    /// aborted.
    pub fn dispatch(&self, data: &[u8], from: SocketAddr, if_index: u32) -> Result<()> {
        self.ensure_running()?;
        let header = match IsakmpHeader::from_bytes(data) {
            Ok(header) => header,
            Err(e) => {
                self.ipsec.metrics().record_message_dropped();
                logging::log_packet_discard("ike", &e.to_string());
                return Err(e);
            }
        };
        logging::log_message_recv(header.exchange_type.to_u8(), &from.ip(), data.len());
        let group = self.ipsec.group_by_interface(if_index)?;

        let mut outbox = Vec::new();
        let result = match self.lock() {
            Ok(mut state) => match header.exchange_type {
                ExchangeType::Main | ExchangeType::Aggressive => {
                    self.handle_phase1(&mut state, &group, if_index, &header, data, from, &mut outbox)
                }
                ExchangeType::Quick => self.handle_quick(&mut state, &header, data, from, &mut outbox),
                ExchangeType::Informational => self.handle_info(&mut state, &header, data, from),
            },
            Err(e) => Err(e),
        };
        self.flush(outbox);

        if let Err(e) = &result {
            self.ipsec.metrics().record_message_dropped();
            logging::log_error(header.exchange_type.name(), &e.to_string());
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_phase1(
        &self,
        state: &mut IkeState,
        group: &str,
        if_index: u32,
        header: &IsakmpHeader,
        data: &[u8],
        from: SocketAddr,
        outbox: &mut Outbox,
    ) -> Result<()> {
        let (cookie_i, cookie_r) = (header.initiator_cookie, header.responder_cookie);
        let index = match state.phase1.iter().position(|h| h.matches(&cookie_i, &cookie_r)) {
            Some(index) => index,
            None => {
                if let Some(sa) = state.sadb.find(&cookie_i, &cookie_r) {
                    if sa.peer.ip() != from.ip() {
                        return Err(Error::AddressMismatch);
                    }
                    if !sa.final_received.is_empty() && sa.final_received == data {
                        if !sa.final_sent.is_empty() {
                            outbox.push((sa.peer, sa.final_sent.clone()));
                        }
                        return Ok(());
                    }
                    return Err(Error::UnexpectedMessage);
                }
                if !header.responder_cookie_unset() {
                    return Err(Error::InvalidCookie);
                }
                let policy = state
                    .groups
                    .get(group)
                    .ok_or_else(|| Error::GroupNotFound(group.to_string()))?
                    .policy_for_peer(&from.ip())
                    .ok_or(Error::PolicyNotFound)?;
                let mode = match header.exchange_type {
                    ExchangeType::Aggressive => Phase1Mode::Aggressive,
                    _ => Phase1Mode::Main,
                };
                let mut handle = Phase1Handle::new(
                    cookie_i,
                    Role::Responder,
                    mode,
                    group,
                    if_index,
                    policy.index,
                    self.local,
                    from,
                );
                handle.timeout_timer = Some(self.exchange_timeout(cookie_i, 0));
                state.phase1.push(handle);
                state.phase1.len() - 1
            }
        };

        {
            let handle = &state.phase1[index];
            if handle.peer.ip() != from.ip() {
                return Err(Error::AddressMismatch);
            }
            if handle.retransmit.is_duplicate(data) {
                if !handle.retransmit.last_sent.is_empty() {
                    outbox.push((handle.peer, handle.retransmit.last_sent.clone()));
                }
                return Ok(());
            }
        }

        let policy = {
            let handle = &state.phase1[index];
            state.policy(&handle.group, handle.policy_index)
        };
        let policy = match policy {
            Ok(policy) => policy,
            Err(e) => {
                self.abort_phase1(state, index, &e, false, outbox);
                return Err(e);
            }
        };

        let env = self.env();
        let handle = &mut state.phase1[index];
        let before = handle.state;
        match phase1::process(&env, handle, &policy, header, data) {
            Ok(reply) => {
                logging::log_ike_state_transition(
                    &handle.cookie_i,
                    &handle.cookie_r,
                    handle.exchange_name(),
                    before,
                    handle.state,
                );
                handle.retransmit.last_received = data.to_vec();
                if let Some(reply) = reply {
                    let (cookie, peer) = (handle.cookie_i, handle.peer);
                    self.transmit(&mut handle.retransmit, cookie, 0, peer, reply, outbox);
                }
                if handle.is_complete() {
                    self.finish_phase1(state, index, outbox);
                }
                Ok(())
            }
            Err(e) => {
                self.abort_phase1(state, index, &e, policy.info.phase1, outbox);
                Err(e)
            }
        }
    }

    fn finish_phase1(&self, state: &mut IkeState, index: usize, outbox: &mut Outbox) {
        let mut handle = state.phase1.remove(index);
        self.cancel(handle.retransmit.timer.take());
        self.cancel(handle.timeout_timer.take());
        let queued = std::mem::take(&mut handle.queued);

        let mut sa = match phase1::establish(handle) {
            Ok(sa) => sa,
            Err(e) => {
                logging::log_error("phase 1", &e.to_string());
                for msg_id in queued {
                    self.abort_phase2(state, msg_id, &e, false, outbox);
                }
                return;
            }
        };
        if sa.proposal.lifetime > 0 {
            sa.expiry_timer = Some(self.timer.schedule(
                Duration::from_secs(u64::from(sa.proposal.lifetime)),
                TimerEvent::IkeSaExpiry { cookie: sa.cookie_i },
            ));
        }
        let peer = sa.peer.ip();
        logging::log_phase1_complete(&peer, &sa.cookie_i, &sa.cookie_r, sa.mode.name());
        self.ipsec.metrics().record_phase1_completed();

        if self.config.initial_contact && sa.role == Role::Initiator {
            let first_contact = state.sadb.find_by_peer(&sa.group, &peer).is_none()
                && !self.ipsec.check_initial_contact(&sa.group, &peer).unwrap_or(true);
            if first_contact {
                let notify = NotifyPayload::new(
                    protocol::ISAKMP,
                    NotifyType::InitialContact,
                    [sa.cookie_i, sa.cookie_r].concat(),
                );
                match info::build(&self.env(), &sa, &[InfoItem::Notify(notify)]) {
                    Ok(message) => {
                        logging::log_notify("sent", &peer, NotifyType::InitialContact.to_u16());
                        self.ipsec.metrics().record_notification_sent();
                        outbox.push((sa.peer, message));
                    }
                    Err(e) => logging::log_error("initial contact", &e.to_string()),
                }
            }
        }
        state.sadb.insert(sa);

        for msg_id in queued {
            if let Err(e) = self.start_quick(state, msg_id, outbox) {
                self.abort_phase2(state, msg_id, &e, false, outbox);
            }
        }
    }

    fn handle_quick(
        &self,
        state: &mut IkeState,
        header: &IsakmpHeader,
        data: &[u8],
        from: SocketAddr,
        outbox: &mut Outbox,
    ) -> Result<()> {
        let (cookie_i, cookie_r) = (header.initiator_cookie, header.responder_cookie);
        let msg_id = header.message_id;
        let peer = match state.sadb.find(&cookie_i, &cookie_r) {
            Some(sa) => sa.peer,
            None => return Err(Error::InvalidCookie),
        };
        if peer.ip() != from.ip() {
            return Err(Error::AddressMismatch);
        }

        if let Some(index) = state
            .phase2
            .iter()
            .position(|h| h.msg_id == msg_id && h.cookie_i == cookie_i && !h.is_queued())
        {
            return self.continue_quick(state, index, header, data, outbox);
        }
        if let Some(done) = state
            .finished
            .iter()
            .find(|f| f.cookie_i == cookie_i && f.msg_id == msg_id)
        {
            if done.received == data && !done.sent.is_empty() {
                outbox.push((peer, done.sent.clone()));
            }
            return Ok(());
        }
        self.answer_quick(state, header, data, outbox)
    }

    fn continue_quick(
        &self,
        state: &mut IkeState,
        index: usize,
        header: &IsakmpHeader,
        data: &[u8],
        outbox: &mut Outbox,
    ) -> Result<()> {
        let env = self.env();
        let IkeState { sadb, phase2, .. } = &mut *state;
        let handle = &mut phase2[index];
        if handle.delete_pending {
            return Err(Error::InvalidState("ISAKMP SA deleted".into()));
        }
        if handle.retransmit.is_duplicate(data) {
            if !handle.retransmit.last_sent.is_empty() {
                outbox.push((handle.peer, handle.retransmit.last_sent.clone()));
            }
            return Ok(());
        }
        let sa = sadb
            .find(&handle.cookie_i, &handle.cookie_r)
            .ok_or(Error::InvalidCookie)?;

        let before = handle.state;
        let step = match handle.role {
            Role::Initiator => quick::process_reply(&env, handle, sa, header, data).map(Some),
            Role::Responder => quick::process_final(&env, handle, sa, header, data).map(|()| None),
        };
        match step {
            Ok(reply) => {
                logging::log_ike_state_transition(&handle.cookie_i, &handle.cookie_r, "quick", before, handle.state);
                handle.retransmit.last_received = data.to_vec();
                if let Some(reply) = reply {
                    handle.retransmit.last_sent = reply.clone();
                    outbox.push((handle.peer, reply));
                }
                self.finish_phase2(state, index)
            }
            Err(e) => {
                let msg_id = handle.msg_id;
                self.abort_phase2(state, msg_id, &e, true, outbox);
                Err(e)
            }
        }
    }

    fn answer_quick(
        &self,
        state: &mut IkeState,
        header: &IsakmpHeader,
        data: &[u8],
        outbox: &mut Outbox,
    ) -> Result<()> {
        match self.respond_quick(state, header, data) {
            Ok((mut handle, reply)) => {
                let (cookie, msg_id, peer) = (handle.cookie_i, handle.msg_id, handle.peer);
                handle.timeout_timer = Some(self.exchange_timeout(cookie, msg_id));
                logging::log_ike_state_transition(&handle.cookie_i, &handle.cookie_r, "quick", 1, handle.state);
                self.transmit(&mut handle.retransmit, cookie, msg_id, peer, reply, outbox);
                state.phase2.push(handle);
                Ok(())
            }
            Err(e) => {
                self.ipsec.metrics().record_phase2_failed();
                if let Some(sa) = state.sadb.find(&header.initiator_cookie, &header.responder_cookie) {
                    logging::log_exchange_failed(&sa.peer.ip(), "quick", &e.to_string());
                    if state.info_flags(&sa.group, sa.policy_index).phase2 {
                        self.notify_error(sa, &e, outbox);
                    }
                }
                Err(e)
            }
        }
    }

    fn respond_quick(
        &self,
        state: &mut IkeState,
        header: &IsakmpHeader,
        data: &[u8],
    ) -> Result<(Phase2Handle, Vec<u8>)> {
        let env = self.env();
        let sa = state
            .sadb
            .find(&header.initiator_cookie, &header.responder_cookie)
            .ok_or(Error::InvalidCookie)?;
        let offer = quick::parse_offer(&env, sa, header, data)?;
        if !state.policy(&sa.group, sa.policy_index)?.permits(&offer.selector) {
            return Err(Error::UnallowedExchange);
        }
        let policy_index = self
            .ipsec
            .get_policy_index(&sa.group, &offer.selector, Direction::Inbound)?;
        let policy = self.ipsec.get_policy(&sa.group, policy_index)?;
        if policy.action != PolicyAction::Apply {
            return Err(Error::PolicyMismatch);
        }
        let in_use = self.ipsec.inbound_spis(&sa.group)?;

        let mut handle = Phase2Handle::new(
            header.message_id,
            Role::Responder,
            &sa.group,
            sa.if_index,
            sa.peer,
            offer.selector,
            policy_index,
        );
        let IkeState { sadb, spis, .. } = state;
        let sa = sadb
            .find(&header.initiator_cookie, &header.responder_cookie)
            .ok_or(Error::InvalidCookie)?;
        let reply = quick::respond(&env, &mut handle, sa, offer, &policy, spis, &in_use)?;
        handle.retransmit.last_received = data.to_vec();
        Ok((handle, reply))
    }

    fn finish_phase2(&self, state: &mut IkeState, index: usize) -> Result<()> {
        let mut handle = state.phase2.remove(index);
        self.cancel(handle.retransmit.timer.take());
        self.cancel(handle.timeout_timer.take());

        let installed = self.install(state, &handle);
        let slot_result = installed.as_ref().map(|_| ()).map_err(Clone::clone);
        if let Some(slot) = handle.slot {
            state.slots.signal(slot, slot_result);
        }
        match installed {
            Ok(pairs) => {
                self.ipsec.metrics().record_phase2_completed();
                logging::log_phase2_complete(&handle.peer.ip(), handle.msg_id, pairs);
                // a repeated second message is answered with the final one
                let sent = match handle.role {
                    Role::Initiator => std::mem::take(&mut handle.retransmit.last_sent),
                    Role::Responder => Vec::new(),
                };
                if state.finished.len() == FINISHED_CACHE {
                    state.finished.pop_front();
                }
                state.finished.push_back(Finished {
                    cookie_i: handle.cookie_i,
                    msg_id: handle.msg_id,
                    received: std::mem::take(&mut handle.retransmit.last_received),
                    sent,
                });
                Ok(())
            }
            Err(e) => {
                self.ipsec.metrics().record_phase2_failed();
                logging::log_exchange_failed(&handle.peer.ip(), "quick", &e.to_string());
                Err(e)
            }
        }
    }

    fn install(&self, state: &IkeState, handle: &Phase2Handle) -> Result<usize> {
        let sa = state
            .sadb
            .find(&handle.cookie_i, &handle.cookie_r)
            .ok_or_else(|| Error::SaNotFound("ISAKMP SA".into()))?;
        let policy = self.ipsec.get_policy(&handle.group, handle.policy_index)?;
        ips::generate_sa_pairs(&self.ipsec, handle, sa, &policy, self.config.soft_lifetime_offset)
    }

    fn handle_info(
        &self,
        state: &mut IkeState,
        header: &IsakmpHeader,
        data: &[u8],
        from: SocketAddr,
    ) -> Result<()> {
        let env = self.env();
        let sa = state
            .sadb
            .find(&header.initiator_cookie, &header.responder_cookie);
        if let Some(sa) = sa {
            if sa.peer.ip() != from.ip() {
                return Err(Error::AddressMismatch);
            }
        }
        let items = info::parse(&env, sa, header, data)?;
        let owner = match sa {
            Some(sa) if header.is_encrypted() => Some((sa.group.clone(), sa.peer.ip(), sa.cookie_i)),
            _ => None,
        };

        for item in items {
            match (item, &owner) {
                (InfoItem::Notify(notify), owner) => {
                    logging::log_notify("received", &from.ip(), notify.notify_type);
                    if let Some((group, peer, cookie)) = owner {
                        if notify.notify_type == NotifyType::InitialContact.to_u16() {
                            self.initial_contact_received(state, group, peer, cookie)?;
                        }
                    }
                }
                (InfoItem::Delete(delete), Some((group, peer, _))) => {
                    self.delete_received(state, group, peer, &delete)?;
                }
                (InfoItem::Delete(_), None) => return Err(Error::UnexpectedPayload(PayloadType::Delete.to_u8())),
            }
        }
        Ok(())
    }

    fn initial_contact_received(
        &self,
        state: &mut IkeState,
        group: &str,
        peer: &IpAddr,
        keep: &[u8; COOKIE_LEN],
    ) -> Result<()> {
        let removed = self.ipsec.remove_sas_by_addr(group, peer)?;
        for sa in state.sadb.remove_peer(peer, Some(keep)) {
            self.cancel(sa.expiry_timer);
            state.orphan_phase2(&sa.cookie_i);
        }
        info!(peer = %peer, removed = removed, "Initial contact: stale SAs removed");
        Ok(())
    }

    fn delete_received(
        &self,
        state: &mut IkeState,
        group: &str,
        peer: &IpAddr,
        delete: &DeletePayload,
    ) -> Result<()> {
        match delete.protocol_id {
            protocol::ISAKMP => {
                for spi in delete.spis.iter().filter(|s| s.len() == 2 * COOKIE_LEN) {
                    let mut cookie_i = [0u8; COOKIE_LEN];
                    let mut cookie_r = [0u8; COOKIE_LEN];
                    cookie_i.copy_from_slice(&spi[..COOKIE_LEN]);
                    cookie_r.copy_from_slice(&spi[COOKIE_LEN..]);
                    let owned = state
                        .sadb
                        .find(&cookie_i, &cookie_r)
                        .map_or(false, |sa| sa.peer.ip() == *peer);
                    if owned {
                        if let Some(sa) = state.sadb.remove(&cookie_i) {
                            self.cancel(sa.expiry_timer);
                            state.orphan_phase2(&cookie_i);
                            info!(peer = %peer, "ISAKMP SA deleted by peer");
                        }
                    }
                }
                Ok(())
            }
            protocol::AH | protocol::ESP => {
                let protocol = if delete.protocol_id == protocol::AH {
                    IpsecProtocol::Ah
                } else {
                    IpsecProtocol::Esp
                };
                for spi in delete.spis.iter().filter(|s| s.len() == IPSEC_SPI_LEN) {
                    let spi = u32::from_be_bytes([spi[0], spi[1], spi[2], spi[3]]);
                    self.ipsec.remove_sa_pairs_by_peer_spi(group, spi, protocol)?;
                }
                Ok(())
            }
            other => Err(Error::InvalidPayload(format!("delete for protocol {}", other))),
        }
    }

    // ---- failures ----

    fn notify_error(&self, sa: &IsakmpSa, error: &Error, outbox: &mut Outbox) {
        let Some(kind) = error.notify_type() else {
            return;
        };
        let notify = NotifyPayload::new(protocol::ISAKMP, kind, Vec::new());
        match info::build(&self.env(), sa, &[InfoItem::Notify(notify)]) {
            Ok(message) => {
                logging::log_notify("sent", &sa.peer.ip(), kind.to_u16());
                self.ipsec.metrics().record_notification_sent();
                outbox.push((sa.peer, message));
            }
            Err(e) => logging::log_error("notification", &e.to_string()),
        }
    }

    fn abort_phase1(&self, state: &mut IkeState, index: usize, error: &Error, notify: bool, outbox: &mut Outbox) {
        let handle = state.phase1.remove(index);
        self.cancel(handle.retransmit.timer);
        self.cancel(handle.timeout_timer);
        logging::log_exchange_failed(&handle.peer.ip(), handle.exchange_name(), &error.to_string());
        self.ipsec.metrics().record_phase1_failed();

        if let Some(kind) = error.notify_type().filter(|_| notify) {
            let notify = NotifyPayload::new(
                protocol::ISAKMP,
                kind,
                [handle.cookie_i, handle.cookie_r].concat(),
            );
            match info::build_plain(handle.cookie_i, handle.cookie_r, &notify) {
                Ok(message) => {
                    logging::log_notify("sent", &handle.peer.ip(), kind.to_u16());
                    self.ipsec.metrics().record_notification_sent();
                    outbox.push((handle.peer, message));
                }
                Err(e) => logging::log_error("notification", &e.to_string()),
            }
        }
        for msg_id in handle.queued {
            self.abort_phase2(state, msg_id, error, false, outbox);
        }
    }

    fn abort_phase2(&self, state: &mut IkeState, msg_id: u32, error: &Error, notify: bool, outbox: &mut Outbox) {
        let Some(index) = state.phase2_index(msg_id) else {
            return;
        };
        let handle = state.phase2.remove(index);
        self.cancel(handle.retransmit.timer);
        self.cancel(handle.timeout_timer);
        logging::log_exchange_failed(&handle.peer.ip(), "quick", &error.to_string());
        self.ipsec.metrics().record_phase2_failed();
        if let Some(slot) = handle.slot {
            state.slots.signal(slot, Err(error.clone()));
        }
        if notify && !handle.is_queued() {
            if let Some(sa) = state.sadb.find(&handle.cookie_i, &handle.cookie_r) {
                if state.info_flags(&sa.group, sa.policy_index).phase2 {
                    self.notify_error(sa, error, outbox);
                }
            }
        }
    }

    // ---- timers ----

    /// React to a fired timer
    ///
    /// SA lifetime events go to the IPsec database; the rest drive
    /// retransmissions, exchange timeouts and ISAKMP SA expiry.
    pub fn handle_timer(&self, event: &TimerEvent) -> Result<()> {
        match event {
            TimerEvent::SaSoftExpiry { .. } | TimerEvent::SaHardExpiry { .. } => {
                return self.ipsec.handle_timer(event);
            }
            _ => {}
        }
        if !self.module_state.read().is_running() {
            return Ok(());
        }

        let mut outbox = Vec::new();
        {
            let mut state = self.lock()?;
            match *event {
                TimerEvent::IkeResend { cookie, msg_id } => self.resend(&mut state, cookie, msg_id, &mut outbox),
                TimerEvent::IkeExchangeTimeout { cookie, msg_id } => {
                    if msg_id == 0 {
                        if let Some(index) = state.phase1.iter().position(|h| h.cookie_i == cookie) {
                            self.abort_phase1(&mut state, index, &Error::Timeout, false, &mut outbox);
                        }
                    } else {
                        self.abort_phase2(&mut state, msg_id, &Error::Timeout, false, &mut outbox);
                    }
                }
                TimerEvent::IkeSaExpiry { cookie } => {
                    if let Some(sa) = state.sadb.remove(&cookie) {
                        info!(peer = %sa.peer, "ISAKMP SA expired");
                        state.orphan_phase2(&cookie);
                    }
                }
                _ => {}
            }
        }
        self.flush(outbox);
        Ok(())
    }

    fn resend(&self, state: &mut IkeState, cookie: [u8; COOKIE_LEN], msg_id: u32, outbox: &mut Outbox) {
        let target = if msg_id == 0 {
            state
                .phase1
                .iter_mut()
                .find(|h| h.cookie_i == cookie)
                .map(|h| (&mut h.retransmit, h.peer))
        } else {
            state
                .phase2
                .iter_mut()
                .find(|h| h.msg_id == msg_id && h.cookie_i == cookie)
                .map(|h| (&mut h.retransmit, h.peer))
        };
        let Some((retransmit, peer)) = target else {
            return;
        };
        retransmit.timer = None;
        if retransmit.remaining == 0 || retransmit.last_sent.is_empty() {
            return;
        }
        retransmit.remaining -= 1;
        logging::log_retransmit(&peer.ip(), retransmit.remaining);
        outbox.push((peer, retransmit.last_sent.clone()));
        if retransmit.remaining > 0 {
            retransmit.timer = Some(
                self.timer
                    .schedule(self.config.resend_interval, TimerEvent::IkeResend { cookie, msg_id }),
            );
        }
    }
}

impl SaRequester for IkeContext {
    fn request_sa(&self, request: SaRequest) {
        let if_index = match self.ipsec.group_interfaces(&request.group) {
            Ok(interfaces) => interfaces.first().copied(),
            Err(_) => None,
        };
        let Some(if_index) = if_index else {
            logging::log_error("sa request", "group has no interface");
            return;
        };
        let request = InitiateRequest::new(if_index, request.remote, request.selector, request.security);
        if let Err(e) = self.initiate(&request) {
            logging::log_error("sa request", &e.to_string());
        }
    }
}

impl SecurityModule for IkeContext {
    fn id(&self) -> &'static str {
        "ike"
    }

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &'static str {
        "IKEv1 key exchange with pre-shared keys"
    }

    fn state(&self) -> ModuleState {
        *self.module_state.read()
    }

    fn init(&mut self) -> StrataResult<()> {
        self.start();
        Ok(())
    }

    fn shutdown(&mut self) -> StrataResult<()> {
        self.stop().map_err(Into::into)
    }
}
