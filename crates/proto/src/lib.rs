//! Protocol implementations for the Strata network security stack.
//!
//! This crate provides the IPsec core of an embedded IP stack:
//!
//! - **SPD/SADB** - policies, SA bundles and SAs per interface group
//! - **AH/ESP** - RFC 4302 and RFC 4303 transforms over buffer chains
//! - **IKEv1** - RFC 2409 key exchange with pre-shared keys
//!
//! # Features
//!
//! - `ipsec` (default) - IPsec and IKE support
//!
//! # Example
//!
//! ```rust
//! use strata_proto::ipsec::replay::{ReplayCheck, ReplayWindow};
//!
//! let mut window = ReplayWindow::new(1, false);
//! assert_eq!(window.check(5), ReplayCheck::Accept(0));
//! window.update(5);
//! assert_eq!(window.check(5), ReplayCheck::Reject);
//! ```
//!
//! # Security
//!
//! - All cryptographic primitives come from the RustCrypto crates
//! - Constant-time comparison of integrity check values
//! - Secure memory handling with `zeroize`
//! - Fuzz testing of the ISAKMP parser
//!
//! # References
//!
//! - [RFC 4301](https://datatracker.ietf.org/doc/html/rfc4301) - Security Architecture for IP
//! - [RFC 2409](https://datatracker.ietf.org/doc/html/rfc2409) - The Internet Key Exchange

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ipsec")]
pub mod ipsec;
