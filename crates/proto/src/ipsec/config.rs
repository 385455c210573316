//! IPsec and IKE configuration
//!
//! Provides configuration structures and builder patterns for the policy
//! database ([`IpsecDb`](super::spd::IpsecDb)) and the IKE engine
//! ([`IkeContext`](super::ike::IkeContext)).
//!
//! Policies and groups are not part of the configuration; they are created
//! at run time through the CRUD calls of the two modules.

use std::time::Duration;

use super::{ike::Phase1Mode, replay::MAX_WINDOW_WORDS, Error, Result};

/// Highest SPI reserved by RFC 4301 / IANA
pub const SPI_RESERVED_END: u32 = 255;

/// First SPI handed out by IKE
pub const IKE_SPI_START: u32 = 256;

/// Last SPI handed out by IKE
pub const IKE_SPI_END: u32 = 10_000;

/// Configuration of the policy / SA database
#[derive(Clone, Debug)]
pub struct IpsecConfig {
    /// Anti-replay window size in 64-bit words
    pub replay_window_words: usize,

    /// Maximum number of security protocols per policy (SA bundle size)
    pub max_bundle_size: usize,

    /// Bounded wait for the database lock
    pub lock_timeout: Duration,

    /// Sort policies by priority instead of insertion order
    pub priority_enabled: bool,

    /// Use extended sequence numbers on manually keyed SAs
    pub esn: bool,

    /// Minimum gap between two SA requests sent to IKE for one bundle
    pub sa_request_interval: Duration,

    /// Longest accepted group name
    pub max_group_name_len: usize,
}

impl Default for IpsecConfig {
    fn default() -> Self {
        IpsecConfig {
            replay_window_words: 1,
            max_bundle_size: 4,
            lock_timeout: Duration::from_secs(1),
            priority_enabled: false,
            esn: false,
            sa_request_interval: Duration::from_secs(2),
            max_group_name_len: 20,
        }
    }
}

impl IpsecConfig {
    /// Create builder for the database configuration
    pub fn builder() -> IpsecConfigBuilder {
        IpsecConfigBuilder::new()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.replay_window_words == 0 || self.replay_window_words > MAX_WINDOW_WORDS {
            return Err(Error::InvalidParameter(format!(
                "replay window must be 1..={} words",
                MAX_WINDOW_WORDS
            )));
        }
        if self.max_bundle_size == 0 {
            return Err(Error::InvalidParameter(
                "max_bundle_size cannot be zero".into(),
            ));
        }
        if self.lock_timeout.is_zero() {
            return Err(Error::InvalidParameter("lock_timeout cannot be zero".into()));
        }
        if self.max_group_name_len == 0 {
            return Err(Error::InvalidParameter(
                "max_group_name_len cannot be zero".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`IpsecConfig`]
#[derive(Default)]
pub struct IpsecConfigBuilder {
    config: IpsecConfig,
}

impl IpsecConfigBuilder {
    /// Create new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the anti-replay window size in 64-bit words
    pub fn with_replay_window_words(mut self, words: usize) -> Self {
        self.config.replay_window_words = words;
        self
    }

    /// Set the maximum SA bundle size
    pub fn with_max_bundle_size(mut self, size: usize) -> Self {
        self.config.max_bundle_size = size;
        self
    }

    /// Set the lock acquisition timeout
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    /// Enable priority ordering of policies
    pub fn with_priority(mut self, enabled: bool) -> Self {
        self.config.priority_enabled = enabled;
        self
    }

    /// Enable extended sequence numbers
    pub fn with_esn(mut self, esn: bool) -> Self {
        self.config.esn = esn;
        self
    }

    /// Set the SA request throttle interval
    pub fn with_sa_request_interval(mut self, interval: Duration) -> Self {
        self.config.sa_request_interval = interval;
        self
    }

    /// Set the longest accepted group name
    pub fn with_max_group_name_len(mut self, len: usize) -> Self {
        self.config.max_group_name_len = len;
        self
    }

    /// Build IpsecConfig with validation
    pub fn build(self) -> Result<IpsecConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration of the IKE daemon
#[derive(Clone, Debug)]
pub struct IkeConfig {
    /// Bounded wait for the IKE module lock
    pub lock_timeout: Duration,

    /// Number of callers that may block in `initiate` at the same time
    pub max_wait_events: usize,

    /// How long a blocked caller waits for its exchange
    pub blocking_timeout: Duration,

    /// Phase 1 exchange timeout
    pub phase1_timeout: Duration,

    /// Phase 2 exchange timeout
    pub phase2_timeout: Duration,

    /// Interval between retransmissions
    pub resend_interval: Duration,

    /// Retransmissions before the exchange is given up
    pub resend_count: u8,

    /// Soft lifetime is this much shorter than the hard lifetime
    pub soft_lifetime_offset: Duration,

    /// Nonce length in bytes (RFC 2409 requires 8..=256)
    pub nonce_len: usize,

    /// Proposals accepted in one SA payload
    pub max_proposals: usize,

    /// Transforms accepted in one proposal
    pub max_transforms: usize,

    /// Longest accepted group name
    pub max_group_name_len: usize,

    /// Send INITIAL-CONTACT after the first phase 1 with a peer
    pub initial_contact: bool,

    /// Phase 1 mode used when a policy allows both
    pub default_phase1_mode: Phase1Mode,
}

impl Default for IkeConfig {
    fn default() -> Self {
        IkeConfig {
            lock_timeout: Duration::from_secs(1),
            max_wait_events: 5,
            blocking_timeout: Duration::from_secs(60),
            phase1_timeout: Duration::from_secs(60),
            phase2_timeout: Duration::from_secs(45),
            resend_interval: Duration::from_secs(2),
            resend_count: 5,
            soft_lifetime_offset: Duration::from_secs(10),
            nonce_len: 20,
            max_proposals: 4,
            max_transforms: 5,
            max_group_name_len: 20,
            initial_contact: true,
            default_phase1_mode: Phase1Mode::Main,
        }
    }
}

impl IkeConfig {
    /// Create builder for the IKE configuration
    pub fn builder() -> IkeConfigBuilder {
        IkeConfigBuilder::new()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_wait_events == 0 {
            return Err(Error::InvalidParameter(
                "max_wait_events cannot be zero".into(),
            ));
        }
        if !(8..=256).contains(&self.nonce_len) {
            return Err(Error::InvalidParameter(
                "nonce length must be 8..=256 bytes".into(),
            ));
        }
        if self.max_proposals == 0 || self.max_transforms == 0 {
            return Err(Error::InvalidParameter(
                "proposal and transform limits cannot be zero".into(),
            ));
        }
        if self.phase1_timeout.is_zero() || self.phase2_timeout.is_zero() {
            return Err(Error::InvalidParameter(
                "exchange timeouts cannot be zero".into(),
            ));
        }
        if self.lock_timeout.is_zero() {
            return Err(Error::InvalidParameter("lock_timeout cannot be zero".into()));
        }
        Ok(())
    }
}

/// Builder for [`IkeConfig`]
#[derive(Default)]
pub struct IkeConfigBuilder {
    config: IkeConfig,
}

impl IkeConfigBuilder {
    /// Create new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lock acquisition timeout
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    /// Set the number of blocking slots
    pub fn with_max_wait_events(mut self, count: usize) -> Self {
        self.config.max_wait_events = count;
        self
    }

    /// Set how long blocked callers wait
    pub fn with_blocking_timeout(mut self, timeout: Duration) -> Self {
        self.config.blocking_timeout = timeout;
        self
    }

    /// Set phase 1 and phase 2 timeouts
    pub fn with_exchange_timeouts(mut self, phase1: Duration, phase2: Duration) -> Self {
        self.config.phase1_timeout = phase1;
        self.config.phase2_timeout = phase2;
        self
    }

    /// Set retransmission interval and count
    pub fn with_resend(mut self, interval: Duration, count: u8) -> Self {
        self.config.resend_interval = interval;
        self.config.resend_count = count;
        self
    }

    /// Set nonce length
    pub fn with_nonce_len(mut self, len: usize) -> Self {
        self.config.nonce_len = len;
        self
    }

    /// Enable or disable INITIAL-CONTACT
    pub fn with_initial_contact(mut self, enabled: bool) -> Self {
        self.config.initial_contact = enabled;
        self
    }

    /// Set the preferred phase 1 mode
    pub fn with_default_phase1_mode(mut self, mode: Phase1Mode) -> Self {
        self.config.default_phase1_mode = mode;
        self
    }

    /// Build IkeConfig with validation
    pub fn build(self) -> Result<IkeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipsec_defaults() {
        let config = IpsecConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_bundle_size, 4);
        assert!(!config.priority_enabled);
    }

    #[test]
    fn test_ipsec_builder_rejects_window() {
        let result = IpsecConfig::builder().with_replay_window_words(0).build();
        assert!(matches!(result, Err(Error::InvalidParameter(_))));

        let result = IpsecConfig::builder()
            .with_replay_window_words(MAX_WINDOW_WORDS + 1)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_ike_defaults() {
        let config = IkeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_wait_events, 5);
        assert_eq!(config.phase1_timeout, Duration::from_secs(60));
        assert_eq!(config.phase2_timeout, Duration::from_secs(45));
        assert_eq!(config.resend_count, 5);
        assert_eq!(config.default_phase1_mode, Phase1Mode::Main);
    }

    #[test]
    fn test_ike_builder() {
        let config = IkeConfig::builder()
            .with_nonce_len(32)
            .with_initial_contact(false)
            .with_resend(Duration::from_millis(100), 2)
            .build()
            .unwrap();
        assert_eq!(config.nonce_len, 32);
        assert!(!config.initial_contact);
        assert_eq!(config.resend_count, 2);

        assert!(IkeConfig::builder().with_nonce_len(4).build().is_err());
        assert!(IkeConfig::builder().with_max_wait_events(0).build().is_err());
    }

    #[test]
    fn test_spi_ranges() {
        assert!(SPI_RESERVED_END < IKE_SPI_START);
        assert!(IKE_SPI_START < IKE_SPI_END);
    }
}
