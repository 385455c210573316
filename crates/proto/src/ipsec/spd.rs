//! Security policy and association database
//!
//! [`IpsecDb`] holds every policy group behind a single lock acquired with
//! a bounded timeout. Validation happens before the lock is taken, so a
//! rejected request never leaves partial state behind.
//!
//! # Lock order
//!
//! The IKE engine may call into the database while holding its own lock.
//! The database never calls out (SA requests, timer callbacks) while its
//! lock is held.

use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard, RwLock};
use strata_platform::{Named, SortedList};

use super::{
    config::IpsecConfig,
    crypto::CryptoProvider,
    group::{BundleResolution, Group, OutboundDecision},
    logging,
    metrics::IpsecMetrics,
    policy::{Direction, ExpiryAction, IpsecProtocol, Lifetime, Policy, SecurityProtocol},
    replay::ReplayWindow,
    sadb::{InboundSa, SaSpec},
    selector::Selector,
    timer::{TimerEvent, TimerService},
    Error, Result,
};

/// Request for new SAs, handed to the key exchange daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaRequest {
    /// Group the SAs are for
    pub group: String,
    /// Peer to negotiate with
    pub remote: IpAddr,
    /// Traffic to protect, from the local point of view
    pub selector: Selector,
    /// Security protocol that is missing
    pub security: SecurityProtocol,
}

/// Receiver of SA requests
///
/// Implemented by the IKE engine. Called without the database lock held.
pub trait SaRequester: Send + Sync {
    /// Start negotiating SAs for `request`; failures are only logged
    fn request_sa(&self, request: SaRequest);
}

/// State protected by the database lock
#[derive(Debug, Default)]
pub(super) struct SpdState {
    pub(super) groups: SortedList<Group>,
}

impl SpdState {
    pub(super) fn group_mut(&mut self, name: &str) -> Result<&mut Group> {
        self.groups
            .get_mut(name)
            .ok_or_else(|| Error::GroupNotFound(name.to_string()))
    }

    fn group(&self, name: &str) -> Result<&Group> {
        self.groups
            .get(name)
            .ok_or_else(|| Error::GroupNotFound(name.to_string()))
    }

    pub(super) fn group_by_interface_mut(&mut self, if_index: u32) -> Result<&mut Group> {
        self.groups
            .find_mut(|g| g.interfaces().contains(&if_index))
            .ok_or_else(|| Error::GroupNotFound(format!("interface {}", if_index)))
    }
}

/// IPsec policy and SA database
pub struct IpsecDb {
    config: IpsecConfig,
    state: Mutex<SpdState>,
    provider: Arc<dyn CryptoProvider>,
    timer: Arc<dyn TimerService>,
    requester: RwLock<Option<Weak<dyn SaRequester>>>,
    metrics: IpsecMetrics,
}

impl std::fmt::Debug for IpsecDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpsecDb")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl IpsecDb {
    /// Create an empty database
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidParameter` if the configuration is invalid.
    pub fn new(
        config: IpsecConfig,
        provider: Arc<dyn CryptoProvider>,
        timer: Arc<dyn TimerService>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(IpsecDb {
            config,
            state: Mutex::new(SpdState::default()),
            provider,
            timer,
            requester: RwLock::new(None),
            metrics: IpsecMetrics::new(),
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &IpsecConfig {
        &self.config
    }

    /// Crypto provider used by the transforms
    pub fn provider(&self) -> &dyn CryptoProvider {
        self.provider.as_ref()
    }

    /// Counters
    pub fn metrics(&self) -> &IpsecMetrics {
        &self.metrics
    }

    /// Register the receiver of SA requests
    pub fn set_sa_requester(&self, requester: Weak<dyn SaRequester>) {
        *self.requester.write() = Some(requester);
    }

    pub(super) fn lock(&self) -> Result<MutexGuard<'_, SpdState>> {
        self.state
            .try_lock_for(self.config.lock_timeout)
            .ok_or(Error::LockTimeout("ipsec database"))
    }

    /// Hand SA requests to the registered requester
    ///
    /// Must be called without the database lock held.
    pub(super) fn send_requests(&self, requests: Vec<SaRequest>) {
        if requests.is_empty() {
            return;
        }
        let requester = self.requester.read().as_ref().and_then(Weak::upgrade);
        match requester {
            Some(requester) => {
                for request in requests {
                    self.metrics.record_sa_request();
                    requester.request_sa(request);
                }
            }
            None => logging::log_packet_discard("outbound", "no SA and no key exchange daemon"),
        }
    }

    /// Create a group
    ///
    /// # Errors
    ///
    /// - `Error::InvalidParameter` for an empty or too long name
    /// - `Error::DuplicateName` if the group exists
    pub fn add_group(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.len() > self.config.max_group_name_len {
            return Err(Error::InvalidParameter(format!(
                "group name must be 1..={} bytes",
                self.config.max_group_name_len
            )));
        }
        let mut state = self.lock()?;
        state
            .groups
            .insert(Group::new(name))
            .map_err(|_| Error::DuplicateName(name.to_string()))
    }

    /// Remove a group with its policies and SAs
    pub fn remove_group(&self, name: &str) -> Result<()> {
        let mut group = {
            let mut state = self.lock()?;
            state
                .groups
                .remove(name)
                .ok_or_else(|| Error::GroupNotFound(name.to_string()))?
        };
        let removed = group.take_inbound();
        self.metrics.record_sa_removed(removed.len() as u64);
        self.cancel_timers(&removed);
        Ok(())
    }

    /// Bind an interface to a group
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidParameter` if the interface already belongs
    /// to another group.
    pub fn add_interface(&self, group: &str, if_index: u32) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(owner) = state
            .groups
            .find(|g| g.interfaces().contains(&if_index))
        {
            if owner.name() != group {
                return Err(Error::InvalidParameter(format!(
                    "interface {} already bound",
                    if_index
                )));
            }
        }
        state.group_mut(group)?.add_interface(if_index);
        Ok(())
    }

    /// Unbind an interface
    pub fn remove_interface(&self, group: &str, if_index: u32) -> Result<()> {
        let mut state = self.lock()?;
        if state.group_mut(group)?.remove_interface(if_index) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("interface {}", if_index)))
        }
    }

    /// Name of the group an interface is bound to
    pub fn group_by_interface(&self, if_index: u32) -> Result<String> {
        let mut state = self.lock()?;
        Ok(state.group_by_interface_mut(if_index)?.name().to_string())
    }

    /// Interfaces bound to a group
    pub fn group_interfaces(&self, group: &str) -> Result<Vec<u32>> {
        let state = self.lock()?;
        Ok(state.group(group)?.interfaces().to_vec())
    }

    /// Validate and insert a policy, returning its index
    pub fn add_policy(&self, group: &str, policy: Policy) -> Result<u32> {
        policy.validate(self.config.max_bundle_size, 0)?;
        let mut state = self.lock()?;
        let priority = self.config.priority_enabled;
        Ok(state.group_mut(group)?.add_policy(policy, priority))
    }

    /// Remove a policy
    pub fn remove_policy(&self, group: &str, index: u32) -> Result<()> {
        let mut state = self.lock()?;
        state.group_mut(group)?.remove_policy(index).map(|_| ())
    }

    /// Copy of a policy
    pub fn get_policy(&self, group: &str, index: u32) -> Result<Policy> {
        let state = self.lock()?;
        state
            .group(group)?
            .policy(index)
            .cloned()
            .ok_or(Error::PolicyNotFound)
    }

    /// Index of the first policy covering `direction` that matches
    /// `selector`
    pub fn get_policy_index(
        &self,
        group: &str,
        selector: &Selector,
        direction: Direction,
    ) -> Result<u32> {
        let state = self.lock()?;
        state.group(group)?.policy_index(selector, direction)
    }

    /// Check a decoded inbound packet against the group's policies
    ///
    /// `applied` lists the removed security protocols, outermost first.
    pub fn match_policy_in(
        &self,
        group: &str,
        packet: &Selector,
        applied: &[SecurityProtocol],
    ) -> Result<u32> {
        let state = self.lock()?;
        state.group(group)?.match_inbound(packet, applied)
    }

    /// Select the outbound policy (and bundle) for a packet
    pub fn match_policy_out(&self, group: &str, packet: &Selector) -> Result<OutboundDecision> {
        let mut state = self.lock()?;
        state.group_mut(group)?.match_outbound(packet)
    }

    /// Resolve the outbound SAs of a bundle
    ///
    /// # Errors
    ///
    /// Returns `Error::SaNotFound` when an SA is missing; SAs have then
    /// been requested from the key exchange daemon unless a request was
    /// sent recently.
    pub fn get_bundle_sa_entries(
        &self,
        group: &str,
        policy_index: u32,
        bundle: usize,
    ) -> Result<Vec<u32>> {
        let resolution = {
            let mut state = self.lock()?;
            state.group_mut(group)?.resolve_bundle(
                policy_index,
                bundle,
                Instant::now(),
                self.config.sa_request_interval,
            )?
        };
        match resolution {
            BundleResolution::Complete(indexes) => Ok(indexes),
            BundleResolution::Missing(requests) => {
                self.send_requests(requests);
                Err(Error::SaNotFound("outbound bundle".into()))
            }
        }
    }

    fn new_window(&self) -> ReplayWindow {
        ReplayWindow::new(self.config.replay_window_words, self.config.esn)
    }

    /// Install a manually keyed inbound SA; returns its SPI
    pub fn add_inbound_sa(&self, group: &str, spec: SaSpec) -> Result<u32> {
        spec.validate()?;
        let window = self.new_window();
        let spi = {
            let mut state = self.lock()?;
            state.group_mut(group)?.insert_inbound(spec, window)?
        };
        self.metrics.record_sa_installed(1);
        Ok(spi)
    }

    /// Install a manually keyed outbound SA; returns its index
    pub fn add_outbound_sa(&self, group: &str, spec: SaSpec) -> Result<u32> {
        spec.validate()?;
        let index = {
            let mut state = self.lock()?;
            state.group_mut(group)?.insert_outbound(spec, self.config.esn)?
        };
        self.metrics.record_sa_installed(1);
        Ok(index)
    }

    /// Install a negotiated SA pair on the group bound to `if_index`
    ///
    /// The inbound SA carries the lifetime of the pair. The hard timer is
    /// armed when the lifetime has an expiry action; the soft timer only
    /// when `soft_offset` is given as well.
    ///
    /// Returns the inbound SPI and the outbound index.
    pub fn add_sa_pair(
        &self,
        if_index: u32,
        outbound: SaSpec,
        inbound: SaSpec,
        lifetime: Lifetime,
        soft_offset: Option<Duration>,
    ) -> Result<(u32, u32)> {
        outbound.validate()?;
        inbound.validate()?;
        let window = self.new_window();
        let protocol = inbound.security.protocol;
        let out_spi = outbound.spi;

        let (group, spi, index) = {
            let mut state = self.lock()?;
            let group = state.group_by_interface_mut(if_index)?;
            let spi = group.insert_inbound(inbound, window)?;
            let index = match group.insert_outbound(outbound, self.config.esn) {
                Ok(index) => index,
                Err(e) => {
                    group.remove_inbound(spi, protocol);
                    return Err(e);
                }
            };
            if let Some(sa) = group.inbound_by_spi_mut(spi, protocol) {
                sa.lifetime = lifetime;
                sa.paired_outbound = Some(index);
            }
            (group.name().to_string(), spi, index)
        };

        if lifetime.seconds > 0 && lifetime.expiry != ExpiryAction::None {
            let hard = Duration::from_secs(u64::from(lifetime.seconds));
            let hard_id = self.timer.schedule(
                hard,
                TimerEvent::SaHardExpiry {
                    group: group.clone(),
                    spi,
                    protocol,
                },
            );
            let soft_id = soft_offset.filter(|offset| *offset < hard).map(|offset| {
                self.timer.schedule(
                    hard - offset,
                    TimerEvent::SaSoftExpiry {
                        group: group.clone(),
                        spi,
                        protocol,
                    },
                )
            });

            let armed = {
                let mut state = self.lock()?;
                match state
                    .group_mut(&group)
                    .ok()
                    .and_then(|g| g.inbound_by_spi_mut(spi, protocol))
                {
                    Some(sa) => {
                        sa.hard_timer = Some(hard_id);
                        sa.soft_timer = soft_id;
                        true
                    }
                    // removed while the timers were being armed
                    None => false,
                }
            };
            if !armed {
                self.timer.cancel(hard_id);
                if let Some(id) = soft_id {
                    self.timer.cancel(id);
                }
            }
        }

        self.metrics.record_sa_installed(2);
        logging::log_sa_pair_added(&group, protocol_name(protocol), spi, out_spi);
        Ok((spi, index))
    }

    /// Remove an inbound SA and its paired outbound SA
    pub fn remove_inbound_sa(&self, group: &str, spi: u32, protocol: IpsecProtocol) -> Result<()> {
        let removed = {
            let mut state = self.lock()?;
            let group = state.group_mut(group)?;
            let sa = group
                .remove_inbound(spi, protocol)
                .ok_or_else(|| Error::SaNotFound(format!("inbound SPI {:#x}", spi)))?;
            let mut count = 1;
            if let Some(index) = sa.paired_outbound {
                if group.remove_outbound(index).is_some() {
                    count += 1;
                }
            }
            self.metrics.record_sa_removed(count);
            sa
        };
        self.cancel_timers(std::slice::from_ref(&removed));
        logging::log_sa_removed(spi, "deleted");
        Ok(())
    }

    /// Remove the outbound SAs carrying a peer-chosen SPI
    ///
    /// Returns the number of SAs removed.
    pub fn remove_outbound_sa(&self, group: &str, spi: u32, protocol: IpsecProtocol) -> Result<usize> {
        let mut state = self.lock()?;
        let removed = state.group_mut(group)?.remove_outbound_by_spi(spi, protocol);
        self.metrics.record_sa_removed(removed.len() as u64);
        Ok(removed.len())
    }

    /// Remove the SAs negotiated under a peer-chosen SPI
    ///
    /// The outbound SAs carrying `spi` go together with the inbound SAs
    /// they were installed with. Returns the number of SAs removed.
    pub fn remove_sa_pairs_by_peer_spi(
        &self,
        group: &str,
        spi: u32,
        protocol: IpsecProtocol,
    ) -> Result<usize> {
        let (outbound, inbound) = {
            let mut state = self.lock()?;
            let group = state.group_mut(group)?;
            let outbound = group.remove_outbound_by_spi(spi, protocol);
            let inbound = group.remove_paired_inbound(&outbound);
            (outbound.len(), inbound)
        };
        self.cancel_timers(&inbound);
        for sa in &inbound {
            logging::log_sa_removed(sa.spi, "deleted by peer");
        }
        let total = outbound + inbound.len();
        self.metrics.record_sa_removed(total as u64);
        Ok(total)
    }

    /// Remove every SA exchanged with `peer`
    ///
    /// Returns the number of SAs removed.
    pub fn remove_sas_by_addr(&self, group: &str, peer: &IpAddr) -> Result<usize> {
        let (inbound, outbound) = {
            let mut state = self.lock()?;
            state.group_mut(group)?.remove_by_addr(peer)
        };
        self.cancel_timers(&inbound);
        let total = inbound.len() + outbound;
        self.metrics.record_sa_removed(total as u64);
        Ok(total)
    }

    /// Whether SAs with `peer` already exist
    ///
    /// Used to decide whether an INITIAL-CONTACT notification applies.
    pub fn check_initial_contact(&self, group: &str, peer: &IpAddr) -> Result<bool> {
        let state = self.lock()?;
        Ok(state.group(group)?.has_sas_with(peer))
    }

    /// Reassign indexes of outbound SAs for `selector` and `security`
    pub fn rehash_outbound_sas(
        &self,
        if_index: u32,
        selector: &Selector,
        security: &SecurityProtocol,
    ) -> Result<usize> {
        let mut state = self.lock()?;
        Ok(state
            .group_by_interface_mut(if_index)?
            .rehash_outbound(selector, security))
    }

    /// SPIs of the inbound SAs of a group, in SPI order
    pub fn inbound_spis(&self, group: &str) -> Result<Vec<u32>> {
        let state = self.lock()?;
        Ok(state.group(group)?.inbound_sas().iter().map(|sa| sa.spi).collect())
    }

    /// SPIs of the outbound SAs of a group, newest first
    pub fn outbound_spis(&self, group: &str) -> Result<Vec<u32>> {
        let state = self.lock()?;
        Ok(state.group(group)?.outbound_sas().iter().map(|sa| sa.spi).collect())
    }

    fn cancel_timers(&self, sas: &[InboundSa]) {
        for sa in sas {
            if let Some(id) = sa.soft_timer {
                self.timer.cancel(id);
            }
            if let Some(id) = sa.hard_timer {
                self.timer.cancel(id);
            }
        }
    }

    /// React to a fired SA lifetime timer
    ///
    /// Soft expiry marks the pair and, for refresh policies, requests new
    /// SAs; hard expiry removes the pair. Events for other subsystems are
    /// ignored.
    pub fn handle_timer(&self, event: &TimerEvent) -> Result<()> {
        match event {
            TimerEvent::SaSoftExpiry {
                group,
                spi,
                protocol,
            } => {
                let request = {
                    let mut state = self.lock()?;
                    let group_ref = state.group_mut(group)?;
                    let sa = group_ref
                        .inbound_by_spi_mut(*spi, *protocol)
                        .ok_or_else(|| Error::SaNotFound(format!("inbound SPI {:#x}", spi)))?;
                    sa.soft_expired = true;
                    sa.soft_timer = None;
                    logging::log_lifetime_expired(*spi, false);
                    match (sa.lifetime.expiry, sa.peer()) {
                        (ExpiryAction::Refresh, Some(remote)) => Some(SaRequest {
                            group: group.clone(),
                            remote,
                            selector: sa.selector.swapped(),
                            security: outbound_view(&sa.security),
                        }),
                        _ => None,
                    }
                };
                if let Some(request) = request {
                    self.send_requests(vec![request]);
                }
                Ok(())
            }
            TimerEvent::SaHardExpiry {
                group,
                spi,
                protocol,
            } => {
                let soft_timer = {
                    let mut state = self.lock()?;
                    let group_ref = state.group_mut(group)?;
                    let sa = group_ref
                        .remove_inbound(*spi, *protocol)
                        .ok_or_else(|| Error::SaNotFound(format!("inbound SPI {:#x}", spi)))?;
                    let mut count = 1;
                    if let Some(index) = sa.paired_outbound {
                        if group_ref.remove_outbound(index).is_some() {
                            count += 1;
                        }
                    }
                    self.metrics.record_sa_removed(count);
                    sa.soft_timer
                };
                if let Some(id) = soft_timer {
                    self.timer.cancel(id);
                }
                logging::log_lifetime_expired(*spi, true);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Tunnel endpoints of an inbound entry seen from the sending side
fn outbound_view(security: &SecurityProtocol) -> SecurityProtocol {
    let mut out = *security;
    if security.is_tunnel() {
        out.tunnel_source = security.tunnel_destination;
        out.tunnel_destination = security.tunnel_source;
    }
    out
}

pub(super) fn protocol_name(protocol: IpsecProtocol) -> &'static str {
    match protocol {
        IpsecProtocol::Ah => "ah",
        IpsecProtocol::Esp => "esp",
    }
}
