//! IPsec security associations
//!
//! Inbound SAs own the anti-replay window and the lifetime timers of their
//! pair; outbound SAs own the transmit sequence counter. Keys are wiped
//! when an SA is dropped.

use std::net::IpAddr;

use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{
    ah::AhTransform,
    esp::EspTransform,
    policy::{IpsecProtocol, Lifetime, SecurityProtocol},
    replay::{ReplayWindow, SequenceNumber},
    selector::Selector,
    timer::TimerId,
    Error, Result,
};

/// Authentication and encryption keys of one SA
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SaKeys {
    /// Authentication key, empty when unused
    pub auth: Vec<u8>,
    /// Encryption key, empty when unused
    pub encryption: Vec<u8>,
}

impl std::fmt::Debug for SaKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaKeys")
            .field("auth_len", &self.auth.len())
            .field("encryption_len", &self.encryption.len())
            .finish()
    }
}

impl SaKeys {
    /// Keys from raw material
    pub fn new(auth: &[u8], encryption: &[u8]) -> Self {
        SaKeys {
            auth: auth.to_vec(),
            encryption: encryption.to_vec(),
        }
    }

    /// Check key lengths against the algorithms of `security`
    pub fn validate(&self, security: &SecurityProtocol) -> Result<()> {
        let auth_len = security.auth.map_or(0, |a| a.key_len());
        if self.auth.len() != auth_len {
            return Err(Error::InvalidParameter(format!(
                "authentication key must be {} bytes, got {}",
                auth_len,
                self.auth.len()
            )));
        }
        let enc_len = security.encryption.map_or(0, |e| e.key_len());
        if self.encryption.len() != enc_len {
            return Err(Error::InvalidParameter(format!(
                "encryption key must be {} bytes, got {}",
                enc_len,
                self.encryption.len()
            )));
        }
        Ok(())
    }
}

/// Everything needed to install one SA
#[derive(Debug, Clone)]
pub struct SaSpec {
    /// SPI; zero on an inbound SA asks for automatic assignment
    pub spi: u32,
    /// Traffic protected by the SA
    pub selector: Selector,
    /// Protocol, mode and algorithms
    pub security: SecurityProtocol,
    /// Key material
    pub keys: SaKeys,
}

impl SaSpec {
    /// Create a spec
    pub fn new(spi: u32, selector: Selector, security: SecurityProtocol, keys: SaKeys) -> Self {
        SaSpec {
            spi,
            selector,
            security,
            keys,
        }
    }

    /// Validate algorithms, keys and selector
    pub fn validate(&self) -> Result<()> {
        self.security.validate()?;
        self.keys.validate(&self.security)?;
        self.selector.validate()
    }
}

/// Inbound security association
#[derive(Debug)]
pub struct InboundSa {
    /// SPI chosen by this host
    pub spi: u32,
    /// Traffic the SA may carry, from the remote host's point of view
    pub selector: Selector,
    /// Protocol, mode and algorithms
    pub security: SecurityProtocol,
    /// Key material
    pub keys: SaKeys,
    /// Anti-replay window
    pub window: ReplayWindow,
    /// Lifetime of the SA pair
    pub lifetime: Lifetime,
    /// Pending soft lifetime timer
    pub soft_timer: Option<TimerId>,
    /// Pending hard lifetime timer
    pub hard_timer: Option<TimerId>,
    /// Index of the paired outbound SA
    pub paired_outbound: Option<u32>,
    /// Set once the soft lifetime expired
    pub soft_expired: bool,
}

impl InboundSa {
    /// Create an SA from a spec with a fresh replay window
    pub fn new(spec: SaSpec, window: ReplayWindow) -> Self {
        InboundSa {
            spi: spec.spi,
            selector: spec.selector,
            security: spec.security,
            keys: spec.keys,
            window,
            lifetime: Lifetime::default(),
            soft_timer: None,
            hard_timer: None,
            paired_outbound: None,
            soft_expired: false,
        }
    }

    /// Address the protected packets are sent to
    pub fn destination(&self) -> Option<IpAddr> {
        if self.security.is_tunnel() {
            self.security.tunnel_destination
        } else {
            self.selector.destination.single()
        }
    }

    /// Address of the peer that sends on this SA
    pub fn peer(&self) -> Option<IpAddr> {
        if self.security.is_tunnel() {
            self.security.tunnel_source
        } else {
            self.selector.source.single()
        }
    }

    /// Whether this SA is identified by `(spi, protocol, destination)`
    pub fn is_identified_by(&self, spi: u32, protocol: IpsecProtocol, destination: &IpAddr) -> bool {
        self.spi == spi
            && self.security.protocol == protocol
            && self.destination().map_or(true, |d| d == *destination)
    }

    /// AH keying for the transform engine
    pub fn ah_transform(&self) -> Result<AhTransform<'_>> {
        ah_transform(&self.security, &self.keys)
    }

    /// ESP keying for the transform engine
    pub fn esp_transform(&self) -> Result<EspTransform<'_>> {
        esp_transform(&self.security, &self.keys)
    }

    /// AH keying together with the replay window, for verification
    pub fn ah_parts(&mut self) -> Result<(AhTransform<'_>, &mut ReplayWindow)> {
        let transform = ah_transform(&self.security, &self.keys)?;
        Ok((transform, &mut self.window))
    }

    /// ESP keying together with the replay window, for verification
    pub fn esp_parts(&mut self) -> Result<(EspTransform<'_>, &mut ReplayWindow)> {
        let transform = esp_transform(&self.security, &self.keys)?;
        Ok((transform, &mut self.window))
    }
}

/// Outbound security association
#[derive(Debug)]
pub struct OutboundSa {
    /// Group-local index referenced by outbound bundles, never zero
    pub index: u32,
    /// SPI chosen by the peer
    pub spi: u32,
    /// Traffic the SA may carry
    pub selector: Selector,
    /// Protocol, mode and algorithms
    pub security: SecurityProtocol,
    /// Key material
    pub keys: SaKeys,
    /// Last sequence number sent
    pub sequence: SequenceNumber,
}

impl OutboundSa {
    /// Create an SA from a spec
    pub fn new(index: u32, spec: SaSpec, esn: bool) -> Self {
        OutboundSa {
            index,
            spi: spec.spi,
            selector: spec.selector,
            security: spec.security,
            keys: spec.keys,
            sequence: SequenceNumber::new(esn),
        }
    }

    /// Advance and return the sequence number for the next packet
    ///
    /// # Errors
    ///
    /// Returns `Error::SequenceOverflow` once the counter is exhausted; the
    /// SA must then be replaced.
    pub fn next_sequence(&mut self) -> Result<SequenceNumber> {
        self.sequence.increment()?;
        Ok(self.sequence)
    }

    /// Address the protected packets are sent to
    pub fn destination(&self) -> Option<IpAddr> {
        if self.security.is_tunnel() {
            self.security.tunnel_destination
        } else {
            self.selector.destination.single()
        }
    }

    /// AH keying for the transform engine
    pub fn ah_transform(&self) -> Result<AhTransform<'_>> {
        ah_transform(&self.security, &self.keys)
    }

    /// ESP keying for the transform engine
    pub fn esp_transform(&self) -> Result<EspTransform<'_>> {
        esp_transform(&self.security, &self.keys)
    }
}

fn ah_transform<'a>(security: &SecurityProtocol, keys: &'a SaKeys) -> Result<AhTransform<'a>> {
    let auth = security
        .auth
        .ok_or_else(|| Error::InvalidState("AH SA without authentication".into()))?;
    Ok(AhTransform {
        auth,
        key: &keys.auth,
    })
}

fn esp_transform<'a>(security: &SecurityProtocol, keys: &'a SaKeys) -> Result<EspTransform<'a>> {
    let encryption = security
        .encryption
        .ok_or_else(|| Error::InvalidState("ESP SA without encryption".into()))?;
    Ok(EspTransform {
        encryption,
        encryption_key: &keys.encryption,
        auth: security.auth,
        auth_key: &keys.auth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::crypto::{AuthAlgorithm, EncryptAlgorithm};

    fn esp() -> SecurityProtocol {
        SecurityProtocol::esp(EncryptAlgorithm::Aes128Cbc, Some(AuthAlgorithm::HmacSha1))
    }

    #[test]
    fn test_key_validation() {
        let good = SaKeys::new(&[0; 20], &[0; 16]);
        assert!(good.validate(&esp()).is_ok());

        let short = SaKeys::new(&[0; 16], &[0; 16]);
        assert!(matches!(
            short.validate(&esp()),
            Err(Error::InvalidParameter(_))
        ));

        let ah = SecurityProtocol::ah(AuthAlgorithm::HmacMd5);
        assert!(SaKeys::new(&[0; 16], &[]).validate(&ah).is_ok());
        assert!(SaKeys::new(&[0; 16], &[1]).validate(&ah).is_err());
    }

    #[test]
    fn test_keys_debug_hides_material() {
        let keys = SaKeys::new(&[0xAB; 20], &[0xCD; 16]);
        let text = format!("{:?}", keys);
        assert!(!text.contains("171"));
        assert!(text.contains("auth_len: 20"));
    }

    #[test]
    fn test_addresses() {
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        let spec = SaSpec::new(300, Selector::hosts(b, a), esp(), SaKeys::new(&[0; 20], &[0; 16]));
        let sa = InboundSa::new(spec, ReplayWindow::default());
        assert_eq!(sa.destination(), Some(a));
        assert_eq!(sa.peer(), Some(b));
        assert!(sa.is_identified_by(300, IpsecProtocol::Esp, &a));
        assert!(!sa.is_identified_by(300, IpsecProtocol::Ah, &a));
        assert!(!sa.is_identified_by(300, IpsecProtocol::Esp, &b));

        let gw1: IpAddr = "192.0.2.1".parse().unwrap();
        let gw2: IpAddr = "192.0.2.2".parse().unwrap();
        let spec = SaSpec::new(
            7,
            Selector::hosts(a, b),
            esp().tunnel(gw1, gw2),
            SaKeys::new(&[0; 20], &[0; 16]),
        );
        let out = OutboundSa::new(1, spec, false);
        assert_eq!(out.destination(), Some(gw2));
    }

    #[test]
    fn test_sequence_overflow() {
        let spec = SaSpec::new(
            7,
            Selector::default(),
            esp(),
            SaKeys::new(&[0; 20], &[0; 16]),
        );
        let mut out = OutboundSa::new(1, spec, false);
        assert_eq!(out.next_sequence().unwrap().low, 1);
        out.sequence = SequenceNumber::from_u64(u32::MAX as u64, false);
        assert_eq!(out.next_sequence(), Err(Error::SequenceOverflow));
    }
}
