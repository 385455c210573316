//! Policy groups
//!
//! A group is the unit of configuration bound to one or more interfaces.
//! It owns an ordered policy list and the SAs created for those policies:
//!
//! - inbound SAs sorted by SPI
//! - outbound SAs newest first, each with a group-local index that
//!   outbound bundles refer to
//!
//! Nothing here locks; [`IpsecDb`](super::spd::IpsecDb) serializes access.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use strata_platform::Named;

use super::{
    config::{IKE_SPI_END, SPI_RESERVED_END},
    policy::{Direction, IpsecProtocol, Policy, PolicyAction, SecurityProtocol},
    replay::ReplayWindow,
    sadb::{InboundSa, OutboundSa, SaSpec},
    selector::Selector,
    spd::SaRequest,
    Error, Result,
};

/// Decision for an outbound packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundDecision {
    /// Send in clear
    Bypass,
    /// Protect with the bundle at `bundle` of policy `policy_index`
    Apply {
        /// Matching policy
        policy_index: u32,
        /// Position of the bundle in the policy
        bundle: usize,
    },
}

/// Result of resolving an outbound bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleResolution {
    /// Every entry resolved; outbound SA indexes in application order
    Complete(Vec<u32>),
    /// Some SAs are missing; requests to send (possibly none while
    /// throttled)
    Missing(Vec<SaRequest>),
}

/// Named policy group
#[derive(Debug)]
pub struct Group {
    name: String,
    interfaces: Vec<u32>,
    policies: Vec<Policy>,
    next_policy_index: u32,
    inbound: Vec<InboundSa>,
    outbound: Vec<OutboundSa>,
    next_sa_index: u32,
    next_spi: u32,
}

impl Named for Group {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Group {
    /// Create an empty group
    pub fn new(name: &str) -> Self {
        Group {
            name: name.to_string(),
            interfaces: Vec::new(),
            policies: Vec::new(),
            next_policy_index: 1,
            inbound: Vec::new(),
            outbound: Vec::new(),
            next_sa_index: 1,
            next_spi: IKE_SPI_END + 1,
        }
    }

    /// Interfaces bound to this group
    pub fn interfaces(&self) -> &[u32] {
        &self.interfaces
    }

    /// Bind an interface
    pub fn add_interface(&mut self, if_index: u32) {
        if !self.interfaces.contains(&if_index) {
            self.interfaces.push(if_index);
        }
    }

    /// Unbind an interface, returning whether it was bound
    pub fn remove_interface(&mut self, if_index: u32) -> bool {
        let before = self.interfaces.len();
        self.interfaces.retain(|&i| i != if_index);
        before != self.interfaces.len()
    }

    /// Policies in matching order
    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    /// Inbound SAs in SPI order
    pub fn inbound_sas(&self) -> &[InboundSa] {
        &self.inbound
    }

    /// Outbound SAs, newest first
    pub fn outbound_sas(&self) -> &[OutboundSa] {
        &self.outbound
    }

    /// Insert a validated policy and return its index
    ///
    /// With priorities enabled the policy goes after every policy of equal
    /// or higher priority; otherwise it is appended.
    pub fn add_policy(&mut self, mut policy: Policy, priority_enabled: bool) -> u32 {
        policy.index = self.next_policy_index;
        self.next_policy_index = self.next_policy_index.wrapping_add(1).max(1);
        let index = policy.index;

        let position = if priority_enabled {
            self.policies
                .iter()
                .position(|p| p.priority < policy.priority)
                .unwrap_or(self.policies.len())
        } else {
            self.policies.len()
        };
        self.policies.insert(position, policy);
        index
    }

    /// Remove a policy by index
    pub fn remove_policy(&mut self, index: u32) -> Result<Policy> {
        let pos = self
            .policies
            .iter()
            .position(|p| p.index == index)
            .ok_or(Error::PolicyNotFound)?;
        Ok(self.policies.remove(pos))
    }

    /// Look up a policy by index
    pub fn policy(&self, index: u32) -> Option<&Policy> {
        self.policies.iter().find(|p| p.index == index)
    }

    /// Index of the first policy covering `direction` whose selector
    /// matches `selector`
    pub fn policy_index(&self, selector: &Selector, direction: Direction) -> Result<u32> {
        self.policies
            .iter()
            .find(|p| {
                p.flow.covers(direction)
                    && p.selector.matches(
                        selector,
                        direction == Direction::Inbound && p.flow.swaps_inbound(),
                    )
            })
            .map(|p| p.index)
            .ok_or(Error::PolicyNotFound)
    }

    /// Check an inbound packet against the policies
    ///
    /// `applied` lists the security protocols that were removed from the
    /// packet, outermost first.
    ///
    /// # Errors
    ///
    /// - `Error::PacketDiscard` if a discard policy matches, or an apply
    ///   policy matches the selector but not the number of SAs applied
    /// - `Error::PolicyNotFound` if no policy accepts the packet
    pub fn match_inbound(&self, packet: &Selector, applied: &[SecurityProtocol]) -> Result<u32> {
        for policy in &self.policies {
            if !policy.flow.covers(Direction::Inbound)
                || !policy.selector.matches(packet, policy.flow.swaps_inbound())
            {
                continue;
            }
            if policy.action == PolicyAction::Discard {
                return Err(Error::PacketDiscard);
            }
            if policy.matches_inbound_bundle(applied) {
                return Ok(policy.index);
            }
            if policy.action == PolicyAction::Apply && policy.security.len() != applied.len() {
                return Err(Error::PacketDiscard);
            }
        }
        Err(Error::PolicyNotFound)
    }

    /// Select the outbound policy for a packet
    ///
    /// For apply policies the bundle for the derived selector is looked up
    /// and created if needed.
    pub fn match_outbound(&mut self, packet: &Selector) -> Result<OutboundDecision> {
        let policy = self
            .policies
            .iter_mut()
            .find(|p| p.flow.covers(Direction::Outbound) && p.selector.matches(packet, false))
            .ok_or(Error::PolicyNotFound)?;

        match policy.action {
            PolicyAction::Bypass => Ok(OutboundDecision::Bypass),
            PolicyAction::Discard => Err(Error::PacketDiscard),
            PolicyAction::Apply => {
                let derivation = policy
                    .security
                    .first()
                    .map(|s| s.sa_derivation)
                    .unwrap_or_default();
                let selector = derivation.derive(&policy.selector, packet);
                let bundle = match policy.bundles.iter().position(|b| b.selector == selector) {
                    Some(pos) => pos,
                    None => {
                        let size = policy.security.len();
                        policy
                            .bundles
                            .push(super::policy::OutboundBundle::new(selector, size));
                        policy.bundles.len() - 1
                    }
                };
                Ok(OutboundDecision::Apply {
                    policy_index: policy.index,
                    bundle,
                })
            }
        }
    }

    /// Resolve the outbound SAs of a bundle
    ///
    /// Cached indexes that no longer resolve are cleared and the SA is
    /// searched again by selector, newest first. When entries remain
    /// unresolved, SA requests are produced at most once per
    /// `request_interval`.
    pub fn resolve_bundle(
        &mut self,
        policy_index: u32,
        bundle: usize,
        now: Instant,
        request_interval: Duration,
    ) -> Result<BundleResolution> {
        let Group {
            name,
            policies,
            outbound,
            ..
        } = self;
        let policy = policies
            .iter_mut()
            .find(|p| p.index == policy_index)
            .ok_or(Error::PolicyNotFound)?;
        let entry = policy
            .bundles
            .get_mut(bundle)
            .ok_or_else(|| Error::NotFound("outbound bundle".into()))?;

        let mut missing = vec![false; policy.security.len()];
        for (i, security) in policy.security.iter().enumerate() {
            let cached = entry.sa_indexes[i];
            if cached != 0 && outbound.iter().any(|sa| sa.index == cached) {
                continue;
            }
            entry.sa_indexes[i] = 0;
            match outbound.iter().find(|sa| {
                sa.security.same_protection(security) && sa.selector.matches(&entry.selector, false)
            }) {
                Some(sa) => entry.sa_indexes[i] = sa.index,
                None => missing[i] = true,
            }
        }

        if !missing.contains(&true) {
            return Ok(BundleResolution::Complete(entry.sa_indexes.clone()));
        }

        if entry.next_request.map_or(false, |at| now < at) {
            return Ok(BundleResolution::Missing(Vec::new()));
        }
        entry.next_request = Some(now + request_interval);

        let mut selector = entry.selector;
        if !policy.flow.covers(Direction::Outbound) {
            selector = selector.swapped();
        }
        selector.protocol = policy.selector.protocol;
        selector.source_port = policy.selector.source_port;
        selector.destination_port = policy.selector.destination_port;

        let mut requests = Vec::new();
        let mut skip = false;
        for (i, security) in policy.security.iter().enumerate() {
            if security.is_tunnel() {
                skip = false;
            }
            if !missing[i] || skip {
                continue;
            }
            let remote = if security.is_tunnel() {
                security.tunnel_destination
            } else {
                selector.destination.single()
            };
            if let Some(remote) = remote {
                requests.push(SaRequest {
                    group: name.clone(),
                    remote,
                    selector,
                    security: *security,
                });
            }
            // the rest of this leg is negotiated with the same peer
            skip = true;
        }
        Ok(BundleResolution::Missing(requests))
    }

    /// Allocate an SPI above the IKE range that is unused for `protocol`
    pub fn allocate_spi(&mut self, protocol: IpsecProtocol) -> Result<u32> {
        for _ in 0..=u16::MAX {
            let spi = self.next_spi;
            self.next_spi = match self.next_spi.checked_add(1) {
                Some(next) => next,
                None => IKE_SPI_END + 1,
            };
            if !self
                .inbound
                .iter()
                .any(|sa| sa.spi == spi && sa.security.protocol == protocol)
            {
                return Ok(spi);
            }
        }
        Err(Error::NoSpiAvailable)
    }

    /// Install an inbound SA, keeping SPI order
    ///
    /// # Errors
    ///
    /// - `Error::InvalidSpi` for an SPI in the reserved range
    /// - `Error::DuplicateSpi` if `(spi, protocol, destination)` is taken
    pub fn insert_inbound(&mut self, mut spec: SaSpec, window: ReplayWindow) -> Result<u32> {
        spec.validate()?;
        if spec.spi == 0 {
            spec.spi = self.allocate_spi(spec.security.protocol)?;
        } else if spec.spi <= SPI_RESERVED_END {
            return Err(Error::InvalidSpi(spec.spi));
        }

        let sa = InboundSa::new(spec, window);
        if let Some(destination) = sa.destination() {
            if self.find_inbound(sa.spi, sa.security.protocol, &destination).is_some() {
                return Err(Error::DuplicateSpi(sa.spi));
            }
        } else if self
            .inbound
            .iter()
            .any(|other| other.spi == sa.spi && other.security.protocol == sa.security.protocol)
        {
            return Err(Error::DuplicateSpi(sa.spi));
        }

        let spi = sa.spi;
        let pos = self.inbound.partition_point(|other| other.spi <= spi);
        self.inbound.insert(pos, sa);
        Ok(spi)
    }

    /// Install an outbound SA at the front and return its index
    pub fn insert_outbound(&mut self, spec: SaSpec, esn: bool) -> Result<u32> {
        spec.validate()?;
        if spec.spi <= SPI_RESERVED_END {
            return Err(Error::InvalidSpi(spec.spi));
        }
        let index = self.take_sa_index();
        self.outbound.insert(0, OutboundSa::new(index, spec, esn));
        Ok(index)
    }

    fn take_sa_index(&mut self) -> u32 {
        let index = self.next_sa_index;
        self.next_sa_index = self.next_sa_index.wrapping_add(1).max(1);
        index
    }

    /// Find an inbound SA by `(spi, protocol, destination)`
    pub fn find_inbound(
        &self,
        spi: u32,
        protocol: IpsecProtocol,
        destination: &IpAddr,
    ) -> Option<&InboundSa> {
        self.inbound
            .iter()
            .find(|sa| sa.is_identified_by(spi, protocol, destination))
    }

    /// Find an inbound SA for modification
    pub fn find_inbound_mut(
        &mut self,
        spi: u32,
        protocol: IpsecProtocol,
        destination: &IpAddr,
    ) -> Option<&mut InboundSa> {
        self.inbound
            .iter_mut()
            .find(|sa| sa.is_identified_by(spi, protocol, destination))
    }

    /// Find an inbound SA by SPI and protocol only
    pub fn inbound_by_spi_mut(&mut self, spi: u32, protocol: IpsecProtocol) -> Option<&mut InboundSa> {
        self.inbound
            .iter_mut()
            .find(|sa| sa.spi == spi && sa.security.protocol == protocol)
    }

    /// Find an outbound SA by index
    pub fn outbound_mut(&mut self, index: u32) -> Option<&mut OutboundSa> {
        self.outbound.iter_mut().find(|sa| sa.index == index)
    }

    /// Remove an inbound SA by SPI and protocol
    pub fn remove_inbound(&mut self, spi: u32, protocol: IpsecProtocol) -> Option<InboundSa> {
        let pos = self
            .inbound
            .iter()
            .position(|sa| sa.spi == spi && sa.security.protocol == protocol)?;
        Some(self.inbound.remove(pos))
    }

    /// Remove an outbound SA by index
    pub fn remove_outbound(&mut self, index: u32) -> Option<OutboundSa> {
        let pos = self.outbound.iter().position(|sa| sa.index == index)?;
        Some(self.outbound.remove(pos))
    }

    /// Remove outbound SAs carrying `spi` for `protocol`, returning their
    /// indexes
    pub fn remove_outbound_by_spi(&mut self, spi: u32, protocol: IpsecProtocol) -> Vec<u32> {
        let mut removed = Vec::new();
        self.outbound.retain(|sa| {
            let hit = sa.spi == spi && sa.security.protocol == protocol;
            if hit {
                removed.push(sa.index);
            }
            !hit
        });
        removed
    }

    /// Remove the inbound SAs paired with the outbound `indexes`
    pub fn remove_paired_inbound(&mut self, indexes: &[u32]) -> Vec<InboundSa> {
        let (removed, kept) = std::mem::take(&mut self.inbound)
            .into_iter()
            .partition(|sa| sa.paired_outbound.map_or(false, |i| indexes.contains(&i)));
        self.inbound = kept;
        removed
    }

    /// Remove every SA exchanged with `peer`
    ///
    /// Returns the removed inbound SAs (their timers still need to be
    /// cancelled) and the number of outbound SAs removed.
    pub fn remove_by_addr(&mut self, peer: &IpAddr) -> (Vec<InboundSa>, usize) {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.inbound.len());
        for sa in self.inbound.drain(..) {
            if sa.peer().as_ref() == Some(peer) {
                removed.push(sa);
            } else {
                kept.push(sa);
            }
        }
        self.inbound = kept;

        let before = self.outbound.len();
        self.outbound
            .retain(|sa| sa.destination().as_ref() != Some(peer));
        (removed, before - self.outbound.len())
    }

    /// Whether any SA is shared with `peer`
    pub fn has_sas_with(&self, peer: &IpAddr) -> bool {
        self.inbound.iter().any(|sa| sa.peer().as_ref() == Some(peer))
            || self
                .outbound
                .iter()
                .any(|sa| sa.destination().as_ref() == Some(peer))
    }

    /// Give every outbound SA for `selector` and `security` a new index
    ///
    /// Bundles holding the old indexes fall back to a selector search and
    /// pick up the newest SA. Returns the number of SAs rehashed.
    pub fn rehash_outbound(&mut self, selector: &Selector, security: &SecurityProtocol) -> usize {
        let mut count = 0;
        for i in 0..self.outbound.len() {
            let sa = &self.outbound[i];
            if sa.selector == *selector && sa.security.same_protection(security) {
                let index = self.take_sa_index();
                self.outbound[i].index = index;
                count += 1;
            }
        }
        count
    }

    /// Drain every inbound SA, for group removal
    pub fn take_inbound(&mut self) -> Vec<InboundSa> {
        std::mem::take(&mut self.inbound)
    }
}
