//! IKEv1 key exchange (RFC 2407, RFC 2408, RFC 2409)
//!
//! Pre-shared key authentication in Main and Aggressive mode establishes
//! an ISAKMP SA; Quick mode then negotiates the AH and ESP SAs the IPsec
//! policies ask for and installs them into the [`IpsecDb`](super::spd::IpsecDb).
//!
//! # Message Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Initiator                            |
//! |                            Cookie                             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Responder                            |
//! |                            Cookie                             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Next Payload | MjVer | MnVer | Exchange Type |     Flags     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Message ID                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                            Length                             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! # References
//!
//! - [RFC 2408](https://datatracker.ietf.org/doc/html/rfc2408) - ISAKMP
//! - [RFC 2409](https://datatracker.ietf.org/doc/html/rfc2409) - IKE
//! - [RFC 2407](https://datatracker.ietf.org/doc/html/rfc2407) - IPsec DOI

pub mod constants;
pub mod dh;
pub mod engine;
pub mod handle;
pub mod header;
pub mod info;
pub mod ips;
pub mod oakley;
pub mod payload;
pub mod phase1;
pub mod policy;
pub mod quick;
pub mod sadb;
pub mod slots;
pub mod transport;

pub use dh::DhGroup;
pub use engine::{IkeContext, IkeStatus, InitiateRequest};
pub use policy::{IkeGroup, IkePolicy, InfoFlags, Phase1Mode, Phase1Proposal};
pub use transport::{QueueTransmitter, Transmitter, UdpTransmitter};
