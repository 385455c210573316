//! IP layer hooks
//!
//! Entry points for the IP stack: every outbound packet passes through
//! [`IpsecDb::apply_outbound`] before transmission, every inbound packet
//! through [`IpsecDb::apply_inbound`] before delivery.
//!
//! ```text
//! outbound:  selector -> policy -> bundle -> SA[0] .. SA[n-1] -> wire
//!                                             (innermost first)
//! inbound:   wire -> outermost AH/ESP .. innermost -> selector -> policy
//! ```

use super::{
    ah, esp,
    buffer::BufferChain,
    group::{BundleResolution, OutboundDecision},
    ip::{self, IPPROTO_IPIP, IPPROTO_IPV6},
    logging,
    policy::{IpsecProtocol, SecurityProtocol},
    spd::IpsecDb,
    Error, Result,
};

/// What happened to a packet that was not discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Passed without IPsec processing
    Clear,
    /// Protected (outbound) or verified (inbound) by this many transforms
    Protected(usize),
}

impl IpsecDb {
    /// Apply the outbound policy of interface `if_index` to a packet
    ///
    /// # Errors
    ///
    /// - `Error::PacketDiscard` if a discard policy matched
    /// - `Error::PolicyNotFound` if no policy covers the packet
    /// - `Error::SaNotFound` if SAs are still missing; they have been
    ///   requested from the key exchange daemon
    ///
    /// Any error means the packet must be dropped.
    pub fn apply_outbound(&self, if_index: u32, chain: &mut BufferChain) -> Result<Verdict> {
        let result = self.protect(if_index, chain);
        match &result {
            Ok(Verdict::Clear) => self.metrics().record_bypass(),
            Ok(Verdict::Protected(_)) => {}
            Err(e) => {
                self.metrics().record_discard();
                logging::log_packet_discard("outbound", &e.to_string());
            }
        }
        result
    }

    fn protect(&self, if_index: u32, chain: &mut BufferChain) -> Result<Verdict> {
        let header = ip::parse(chain)?;
        let selector = ip::packet_selector(chain, &header);

        let mut state = self.lock()?;
        let group = state.group_by_interface_mut(if_index)?;
        let (policy_index, bundle) = match group.match_outbound(&selector)? {
            OutboundDecision::Bypass => return Ok(Verdict::Clear),
            OutboundDecision::Apply {
                policy_index,
                bundle,
            } => (policy_index, bundle),
        };

        let interval = self.config().sa_request_interval;
        let indexes = match group.resolve_bundle(
            policy_index,
            bundle,
            std::time::Instant::now(),
            interval,
        )? {
            BundleResolution::Complete(indexes) => indexes,
            BundleResolution::Missing(requests) => {
                drop(state);
                self.send_requests(requests);
                return Err(Error::SaNotFound("outbound bundle".into()));
            }
        };

        for index in &indexes {
            let sa = group
                .outbound_mut(*index)
                .ok_or_else(|| Error::SaNotFound(format!("outbound index {}", index)))?;
            let seq = sa.next_sequence()?;

            if sa.security.is_tunnel() {
                encapsulate(chain, &sa.security)?;
            }

            let len = chain.len();
            match sa.security.protocol {
                IpsecProtocol::Ah => {
                    ah::encode_ah(self.provider(), chain, sa.spi, seq, &sa.ah_transform()?)?;
                    self.metrics().record_ah_encoded();
                    logging::log_ah_packet("encode", sa.spi, seq.low, len);
                }
                IpsecProtocol::Esp => {
                    esp::encode_esp(self.provider(), chain, sa.spi, seq, &sa.esp_transform()?)?;
                    self.metrics().record_esp_encoded(len);
                    logging::log_esp_packet("encode", sa.spi, seq.low, len);
                }
            }
        }
        Ok(Verdict::Protected(indexes.len()))
    }

    /// Verify and strip IPsec from a packet received on `if_index`
    ///
    /// AH and ESP headers are removed outermost first (tunnel mode SAs also
    /// remove the outer IP header), then the inner packet is checked
    /// against the inbound policies together with the list of SAs that
    /// were applied.
    ///
    /// # Errors
    ///
    /// Any error means the packet must be dropped.
    pub fn apply_inbound(&self, if_index: u32, chain: &mut BufferChain) -> Result<Verdict> {
        let result = self.verify(if_index, chain);
        match &result {
            Ok(Verdict::Clear) => self.metrics().record_bypass(),
            Ok(Verdict::Protected(_)) => {}
            Err(e) => {
                match e {
                    Error::ReplayDetected(_) => self.metrics().record_replay_rejected(),
                    Error::InvalidDigest => self.metrics().record_digest_failure(),
                    _ => {}
                }
                self.metrics().record_discard();
                logging::log_packet_discard("inbound", &e.to_string());
            }
        }
        result
    }

    fn verify(&self, if_index: u32, chain: &mut BufferChain) -> Result<Verdict> {
        let mut state = self.lock()?;
        let group = state.group_by_interface_mut(if_index)?;
        let mut applied: Vec<SecurityProtocol> = Vec::new();

        loop {
            let header = ip::parse(chain)?;
            let protocol = match IpsecProtocol::from_ip_protocol(header.next_header) {
                Some(protocol) => protocol,
                None => break,
            };
            if applied.len() >= self.config().max_bundle_size {
                return Err(Error::PacketDiscard);
            }

            let spi = match protocol {
                IpsecProtocol::Ah => ah::peek_spi(chain, &header)?,
                IpsecProtocol::Esp => esp::peek_spi(chain, &header)?,
            };
            let sa = group
                .find_inbound_mut(spi, protocol, &header.destination)
                .ok_or_else(|| Error::SaNotFound(format!("inbound SPI {:#x}", spi)))?;

            let next_header = match protocol {
                IpsecProtocol::Ah => {
                    let (transform, window) = sa.ah_parts()?;
                    let decoded = ah::decode_ah(self.provider(), chain, &transform, window)
                        .map_err(|e| replay_logged(e, spi))?;
                    self.metrics().record_ah_decoded();
                    logging::log_ah_packet("decode", spi, decoded.seq as u32, chain.len());
                    decoded.next_header
                }
                IpsecProtocol::Esp => {
                    let (transform, window) = sa.esp_parts()?;
                    let decoded = esp::decode_esp(self.provider(), chain, &transform, window)
                        .map_err(|e| replay_logged(e, spi))?;
                    self.metrics().record_esp_decoded();
                    logging::log_esp_packet("decode", spi, decoded.seq as u32, chain.len());
                    decoded.next_header
                }
            };
            applied.push(sa.security);

            if sa.security.is_tunnel() {
                if next_header != IPPROTO_IPIP && next_header != IPPROTO_IPV6 {
                    return Err(Error::Malformed("tunnel SA without inner packet".into()));
                }
                let outer = ip::parse(chain)?;
                chain.remove(0, outer.header_len)?;
            }
        }

        let header = ip::parse(chain)?;
        let selector = ip::packet_selector(chain, &header);
        group.match_inbound(&selector, &applied)?;

        if applied.is_empty() {
            Ok(Verdict::Clear)
        } else {
            Ok(Verdict::Protected(applied.len()))
        }
    }
}

fn replay_logged(error: Error, spi: u32) -> Error {
    if let Error::ReplayDetected(seq) = error {
        logging::log_replay_rejected(spi, seq as u32);
    }
    error
}

/// Wrap the packet in a new outer header between the tunnel endpoints
fn encapsulate(chain: &mut BufferChain, security: &SecurityProtocol) -> Result<()> {
    let (source, destination) = match (security.tunnel_source, security.tunnel_destination) {
        (Some(s), Some(d)) => (s, d),
        _ => return Err(Error::InvalidState("tunnel SA without endpoints".into())),
    };
    let inner_family = ip::family(chain)?;
    let outer = ip::build_outer_header(source, destination, chain.len())?;
    chain.prepend(&outer);

    let header = ip::parse(chain)?;
    ip::set_next_header(chain, &header, ip::encapsulation_protocol(inner_family))?;
    ip::update_checksum(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::sync::Arc;

    use crate::ipsec::{
        config::IpsecConfig,
        crypto::{AuthAlgorithm, EncryptAlgorithm, SoftwareCrypto},
        ip::tests::udp_v4,
        ip::IPPROTO_ESP,
        policy::{ExpiryAction, Lifetime, Policy, PolicyAction, PolicyFlow},
        sadb::{SaKeys, SaSpec},
        selector::Selector,
        timer::ManualTimer,
    };

    const A: [u8; 4] = [10, 0, 0, 1];
    const B: [u8; 4] = [10, 0, 0, 2];

    fn addr(o: [u8; 4]) -> IpAddr {
        IpAddr::from(o)
    }

    fn host(local: [u8; 4], remote: [u8; 4], bundle: &[SecurityProtocol]) -> IpsecDb {
        let db = IpsecDb::new(
            IpsecConfig::default(),
            Arc::new(SoftwareCrypto::new()),
            Arc::new(ManualTimer::new()),
        )
        .unwrap();
        db.add_group("g").unwrap();
        db.add_interface("g", 1).unwrap();

        let mut policy = Policy::new(
            Selector::hosts(addr(local), addr(remote)),
            PolicyAction::Apply,
            PolicyFlow::DualAsynchronous,
        )
        .with_lifetime(Lifetime::new(3600, ExpiryAction::None));
        for security in bundle {
            policy = policy.with_security(*security);
        }
        db.add_policy("g", policy).unwrap();
        db
    }

    fn keys(security: &SecurityProtocol, seed: u8) -> SaKeys {
        SaKeys::new(
            &vec![seed; security.auth.map_or(0, |a| a.key_len())],
            &vec![seed ^ 0x5A; security.encryption.map_or(0, |e| e.key_len())],
        )
    }

    /// Install matching outbound SAs on `a` and inbound SAs on `b`
    fn key_pair(a: &IpsecDb, b: &IpsecDb, bundle: &[SecurityProtocol], inbound: &[SecurityProtocol]) {
        for (i, (out_sec, in_sec)) in bundle.iter().zip(inbound).enumerate() {
            let spi = 1000 + i as u32;
            a.add_outbound_sa(
                "g",
                SaSpec::new(spi, Selector::hosts(addr(A), addr(B)), *out_sec, keys(out_sec, i as u8)),
            )
            .unwrap();
            b.add_inbound_sa(
                "g",
                SaSpec::new(spi, Selector::hosts(addr(A), addr(B)), *in_sec, keys(in_sec, i as u8)),
            )
            .unwrap();
        }
    }

    #[test]
    fn test_transport_bundle_round_trip() {
        let bundle = [
            SecurityProtocol::esp(EncryptAlgorithm::Aes128Cbc, Some(AuthAlgorithm::HmacSha256)),
            SecurityProtocol::ah(AuthAlgorithm::HmacSha1),
        ];
        let sender = host(A, B, &bundle);
        let receiver = host(B, A, &bundle);
        key_pair(&sender, &receiver, &bundle, &bundle);

        let original = udp_v4(A, B, b"bundle test");
        let mut chain = BufferChain::from_slice(&original);
        assert_eq!(sender.apply_outbound(1, &mut chain), Ok(Verdict::Protected(2)));
        // AH is outermost
        assert_eq!(chain.read_u8(9).unwrap(), crate::ipsec::ip::IPPROTO_AH);

        let wire = chain.to_vec();
        let mut received = BufferChain::segmented(&wire, 13);
        assert_eq!(receiver.apply_inbound(1, &mut received), Ok(Verdict::Protected(2)));
        let out = received.to_vec();
        assert_eq!(out.len(), original.len());
        assert_eq!(out[9], original[9]);
        assert_eq!(&out[20..], &original[20..]);

        // replay of the same packet
        let mut again = BufferChain::from_slice(&wire);
        assert!(matches!(
            receiver.apply_inbound(1, &mut again),
            Err(Error::ReplayDetected(1))
        ));
        assert_eq!(receiver.metrics().snapshot().replay_rejected, 1);
    }

    #[test]
    fn test_tunnel_round_trip() {
        let gw_a: IpAddr = "192.0.2.1".parse().unwrap();
        let gw_b: IpAddr = "192.0.2.2".parse().unwrap();
        let esp = SecurityProtocol::esp(EncryptAlgorithm::Aes256Cbc, Some(AuthAlgorithm::HmacSha1));

        let sender = host(A, B, &[esp.tunnel(gw_a, gw_b)]);
        let receiver = host(B, A, &[esp.tunnel(gw_b, gw_a)]);
        // both ends of the SA are described from the sender's side
        key_pair(&sender, &receiver, &[esp.tunnel(gw_a, gw_b)], &[esp.tunnel(gw_a, gw_b)]);

        let original = udp_v4(A, B, b"tunnelled");
        let mut chain = BufferChain::from_slice(&original);
        assert_eq!(sender.apply_outbound(1, &mut chain), Ok(Verdict::Protected(1)));
        let outer = ip::parse(&chain).unwrap();
        assert_eq!(outer.source, gw_a);
        assert_eq!(outer.destination, gw_b);
        assert_eq!(outer.next_header, IPPROTO_ESP);

        let mut received = BufferChain::from_slice(&chain.to_vec());
        assert_eq!(receiver.apply_inbound(1, &mut received), Ok(Verdict::Protected(1)));
        assert_eq!(received.to_vec(), original);
        assert_eq!(receiver.metrics().snapshot().esp_packets_decoded, 1);
    }

    #[test]
    fn test_missing_sa_and_bypass() {
        let bundle = [SecurityProtocol::esp(EncryptAlgorithm::DesCbc, Some(AuthAlgorithm::HmacMd5))];
        let db = host(A, B, &bundle);
        let mut chain = BufferChain::from_slice(&udp_v4(A, B, b"x"));
        assert!(matches!(
            db.apply_outbound(1, &mut chain),
            Err(Error::SaNotFound(_))
        ));

        // unrelated traffic has no policy
        let mut other = BufferChain::from_slice(&udp_v4(A, [10, 9, 9, 9], b"x"));
        assert_eq!(db.apply_outbound(1, &mut other), Err(Error::PolicyNotFound));

        db.add_policy(
            "g",
            Policy::new(Selector::default(), PolicyAction::Bypass, PolicyFlow::DualAsynchronous),
        )
        .unwrap();
        let mut other = BufferChain::from_slice(&udp_v4(A, [10, 9, 9, 9], b"x"));
        assert_eq!(db.apply_outbound(1, &mut other), Ok(Verdict::Clear));
        let mut inbound = BufferChain::from_slice(&udp_v4([10, 9, 9, 9], A, b"x"));
        assert_eq!(db.apply_inbound(1, &mut inbound), Ok(Verdict::Clear));
        assert_eq!(db.metrics().snapshot().packets_discarded, 2);
    }

    #[test]
    fn test_unprotected_packet_rejected_by_apply_policy() {
        let bundle = [SecurityProtocol::ah(AuthAlgorithm::AesXcbc)];
        let db = host(B, A, &bundle);
        let mut chain = BufferChain::from_slice(&udp_v4(A, B, b"clear"));
        assert_eq!(db.apply_inbound(1, &mut chain), Err(Error::PacketDiscard));
    }
}
