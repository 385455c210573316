//! IPsec core: policies, SAs, AH/ESP transforms and IKEv1
//!
//! This module implements the security services of an IP stack:
//!
//! - **SPD/SADB**: per interface group policies, SA bundles and SAs
//! - **AH** (Authentication Header) - RFC 4302
//! - **ESP** (Encapsulating Security Payload) - RFC 4303
//! - **Anti-replay** with extended sequence numbers
//! - **IKEv1** (Internet Key Exchange) - RFC 2409
//!
//! # Architecture
//!
//! ```text
//! IKE Control Plane (UDP 500)
//!   ├── Main / Aggressive mode (pre-shared keys)
//!   ├── Quick mode (AH/ESP SA negotiation)
//!   └── Informational (notify, delete)
//!        ↓ add_sa_pair
//! Security Policy and SA Databases
//!   ├── Groups of interfaces
//!   ├── Ordered policies and SA bundles
//!   └── Inbound / outbound SAs with lifetimes
//!        ↓
//! Packet Hooks (IP protocols 50 and 51)
//!   ├── Encryption (DES, 3DES, AES, Blowfish, CAST)
//!   ├── Authentication (HMAC-MD5/SHA1/SHA2, AES-XCBC)
//!   └── Anti-Replay Protection
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use strata_proto::ipsec::config::{IkeConfig, IpsecConfig};
//! use strata_proto::ipsec::crypto::{AuthAlgorithm, EncryptAlgorithm, SoftwareCrypto};
//! use strata_proto::ipsec::ike::{IkeContext, IkePolicy, Phase1Proposal, DhGroup, UdpTransmitter};
//! use strata_proto::ipsec::crypto::PrfAlgorithm;
//! use strata_proto::ipsec::policy::{Policy, PolicyAction, PolicyFlow, SecurityProtocol};
//! use strata_proto::ipsec::selector::{AddrSpec, Selector};
//! use strata_proto::ipsec::spd::IpsecDb;
//! use strata_proto::ipsec::timer::TokioTimer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let local = "192.0.2.1".parse()?;
//!     let peer = "192.0.2.2".parse()?;
//!     let (timer, timer_events) = TokioTimer::new();
//!     let timer = Arc::new(timer);
//!
//!     let db = Arc::new(IpsecDb::new(
//!         IpsecConfig::default(),
//!         Arc::new(SoftwareCrypto::new()),
//!         timer.clone(),
//!     )?);
//!     db.add_group("wan")?;
//!     db.add_interface("wan", 1)?;
//!     db.add_policy(
//!         "wan",
//!         Policy::new(Selector::hosts(local, peer), PolicyAction::Apply, PolicyFlow::DualAsynchronous)
//!             .with_security(SecurityProtocol::esp(
//!                 EncryptAlgorithm::Aes128Cbc,
//!                 Some(AuthAlgorithm::HmacSha1),
//!             )),
//!     )?;
//!
//!     let socket = Arc::new(tokio::net::UdpSocket::bind("0.0.0.0:500").await?);
//!     let ike = IkeContext::new(
//!         IkeConfig::default(),
//!         db,
//!         timer,
//!         Arc::new(UdpTransmitter::new(socket.clone())),
//!         local,
//!     )?;
//!     ike.add_group("wan")?;
//!     ike.add_policy(
//!         "wan",
//!         IkePolicy::new(AddrSpec::Single(peer), b"secret").with_proposal(Phase1Proposal::new(
//!             EncryptAlgorithm::Aes128Cbc,
//!             PrfAlgorithm::Sha1,
//!             DhGroup::Modp1024,
//!             28_800,
//!         )),
//!     )?;
//!     ike.start();
//!
//!     let (_stop, shutdown) = tokio::sync::oneshot::channel();
//!     strata_proto::ipsec::ike::transport::run(ike, socket, 1, timer_events, shutdown).await?;
//!     Ok(())
//! }
//! ```
//!
//! # References
//!
//! - [RFC 4301](https://datatracker.ietf.org/doc/html/rfc4301) - Security Architecture for IP
//! - [RFC 4302](https://datatracker.ietf.org/doc/html/rfc4302) - AH Protocol
//! - [RFC 4303](https://datatracker.ietf.org/doc/html/rfc4303) - ESP Protocol
//! - [RFC 2409](https://datatracker.ietf.org/doc/html/rfc2409) - IKE

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod ah;
pub mod buffer;
pub mod config;
pub mod crypto;
pub mod error;
pub mod esp;
pub mod group;
pub mod ike;
pub mod ip;
pub mod logging;
pub mod metrics;
pub mod packet;
pub mod policy;
pub mod replay;
pub mod sadb;
pub mod selector;
pub mod spd;
pub mod timer;

// Re-export commonly used types
pub use buffer::BufferChain;
pub use config::{IkeConfig, IpsecConfig};
pub use error::{Error, Result};
pub use ike::{IkeContext, InitiateRequest};
pub use packet::Verdict;
pub use spd::IpsecDb;
