//! ISAKMP SA database
//!
//! Holds the established phase 1 SAs. SAs still under negotiation live in
//! their phase 1 handle until the exchange completes.

use std::net::{IpAddr, SocketAddr};

use super::constants::COOKIE_LEN;
use super::handle::Role;
use super::oakley::IsakmpKeys;
use super::policy::{Phase1Mode, Phase1Proposal};
use crate::ipsec::timer::TimerId;

/// Established ISAKMP SA
#[derive(Debug)]
pub struct IsakmpSa {
    /// Initiator cookie
    pub cookie_i: [u8; COOKIE_LEN],
    /// Responder cookie
    pub cookie_r: [u8; COOKIE_LEN],
    /// Our role in phase 1
    pub role: Role,
    /// Exchange mode that created the SA
    pub mode: Phase1Mode,
    /// IPsec group the SA serves
    pub group: String,
    /// Interface the SA was negotiated on
    pub if_index: u32,
    /// IKE policy used
    pub policy_index: u32,
    /// Local address
    pub local: IpAddr,
    /// Peer address and port
    pub peer: SocketAddr,
    /// Negotiated attributes
    pub proposal: Phase1Proposal,
    /// Keying material
    pub keys: IsakmpKeys,
    /// Last CBC block of phase 1, seed of every later IV
    pub last_block: Vec<u8>,
    /// Last phase 1 message received, to recognise retransmissions
    pub final_received: Vec<u8>,
    /// Answer to a retransmitted final phase 1 message, if any
    pub final_sent: Vec<u8>,
    /// Lifetime timer
    pub expiry_timer: Option<TimerId>,
}

impl IsakmpSa {
    /// Whether the SA is identified by the cookie pair
    ///
    /// A zero responder cookie matches any responder cookie.
    pub fn matches(&self, cookie_i: &[u8; COOKIE_LEN], cookie_r: &[u8; COOKIE_LEN]) -> bool {
        self.cookie_i == *cookie_i
            && (*cookie_r == [0u8; COOKIE_LEN] || self.cookie_r == *cookie_r)
    }
}

/// Established ISAKMP SAs
#[derive(Debug, Default)]
pub struct IkeSadb {
    sas: Vec<IsakmpSa>,
}

impl IkeSadb {
    /// Create an empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an SA; newer SAs are preferred for the same peer
    pub fn insert(&mut self, sa: IsakmpSa) {
        self.sas.insert(0, sa);
    }

    /// SA by cookie pair
    pub fn find(&self, cookie_i: &[u8; COOKIE_LEN], cookie_r: &[u8; COOKIE_LEN]) -> Option<&IsakmpSa> {
        self.sas.iter().find(|sa| sa.matches(cookie_i, cookie_r))
    }

    /// SA by cookie pair, for modification
    pub fn find_mut(
        &mut self,
        cookie_i: &[u8; COOKIE_LEN],
        cookie_r: &[u8; COOKIE_LEN],
    ) -> Option<&mut IsakmpSa> {
        self.sas.iter_mut().find(|sa| sa.matches(cookie_i, cookie_r))
    }

    /// Newest SA with `peer` in `group`
    pub fn find_by_peer(&self, group: &str, peer: &IpAddr) -> Option<&IsakmpSa> {
        self.sas
            .iter()
            .find(|sa| sa.group == group && sa.peer.ip() == *peer)
    }

    /// Remove the SA with the initiator cookie `cookie_i`
    pub fn remove(&mut self, cookie_i: &[u8; COOKIE_LEN]) -> Option<IsakmpSa> {
        let pos = self.sas.iter().position(|sa| sa.cookie_i == *cookie_i)?;
        Some(self.sas.remove(pos))
    }

    /// Remove every SA with `peer`, except the one with `keep`
    pub fn remove_peer(&mut self, peer: &IpAddr, keep: Option<&[u8; COOKIE_LEN]>) -> Vec<IsakmpSa> {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.sas.len());
        for sa in self.sas.drain(..) {
            if sa.peer.ip() == *peer && keep != Some(&sa.cookie_i) {
                removed.push(sa);
            } else {
                kept.push(sa);
            }
        }
        self.sas = kept;
        removed
    }

    /// Remove every SA
    pub fn clear(&mut self) -> Vec<IsakmpSa> {
        std::mem::take(&mut self.sas)
    }

    /// Number of SAs
    pub fn len(&self) -> usize {
        self.sas.len()
    }

    /// Whether there are no SAs
    pub fn is_empty(&self) -> bool {
        self.sas.is_empty()
    }

    /// Iterate over the SAs, newest first
    pub fn iter(&self) -> std::slice::Iter<'_, IsakmpSa> {
        self.sas.iter()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ipsec::crypto::{EncryptAlgorithm, PrfAlgorithm};
    use crate::ipsec::ike::dh::DhGroup;
    use crate::ipsec::ike::oakley::KeyExchange;

    pub(crate) fn sample_sa(cookie: u8, peer: &str) -> IsakmpSa {
        let proposal = Phase1Proposal::new(
            EncryptAlgorithm::Aes128Cbc,
            PrfAlgorithm::Sha1,
            DhGroup::Modp1024,
            3600,
        );
        let keys = IsakmpKeys::derive(
            proposal.hash,
            proposal.encryption,
            &KeyExchange {
                psk: b"psk",
                nonce_i: &[1; 16],
                nonce_r: &[2; 16],
                shared_secret: &[3; 128],
                cookie_i: &[cookie; 8],
                cookie_r: &[9; 8],
            },
        );
        IsakmpSa {
            cookie_i: [cookie; 8],
            cookie_r: [9; 8],
            role: Role::Initiator,
            mode: Phase1Mode::Main,
            group: "g".into(),
            if_index: 1,
            policy_index: 1,
            local: "10.0.0.1".parse().unwrap(),
            peer: SocketAddr::new(peer.parse().unwrap(), 500),
            proposal,
            keys,
            last_block: vec![0; 16],
            final_received: Vec::new(),
            final_sent: Vec::new(),
            expiry_timer: None,
        }
    }

    #[test]
    fn test_partial_cookie_lookup() {
        let mut db = IkeSadb::new();
        db.insert(sample_sa(1, "10.0.0.2"));
        assert!(db.find(&[1; 8], &[9; 8]).is_some());
        assert!(db.find(&[1; 8], &[0; 8]).is_some());
        assert!(db.find(&[1; 8], &[8; 8]).is_none());
        assert!(db.find(&[2; 8], &[9; 8]).is_none());
    }

    #[test]
    fn test_peer_lookup_prefers_newest() {
        let mut db = IkeSadb::new();
        let peer: IpAddr = "10.0.0.2".parse().unwrap();
        db.insert(sample_sa(1, "10.0.0.2"));
        db.insert(sample_sa(2, "10.0.0.2"));
        db.insert(sample_sa(3, "10.0.0.3"));
        assert_eq!(db.find_by_peer("g", &peer).unwrap().cookie_i, [2; 8]);
        assert!(db.find_by_peer("other", &peer).is_none());

        let removed = db.remove_peer(&peer, Some(&[2; 8]));
        assert_eq!(removed.len(), 1);
        assert_eq!(db.len(), 2);
        assert!(db.remove(&[3; 8]).is_some());
        assert_eq!(db.len(), 1);
    }
}
