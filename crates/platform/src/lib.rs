//! # Strata Platform
//!
//! Core platform types, traits, and utilities for the Strata network security stack.
//!
//! This crate provides:
//! - Unified error types (`StrataError`, `StrataResult`)
//! - The module lifecycle trait (`SecurityModule`)
//! - A sorted-by-name container (`SortedList`) shared by the policy databases
//!
//! # Examples
//!
//! ```
//! use strata_platform::{Named, SortedList, StrataResult};
//!
//! struct Group(String);
//!
//! impl Named for Group {
//!     fn name(&self) -> &str {
//!         &self.0
//!     }
//! }
//!
//! # fn main() -> StrataResult<()> {
//! let mut groups = SortedList::new();
//! groups.insert(Group("wan".into()))?;
//! groups.insert(Group("lan".into()))?;
//!
//! assert_eq!(groups.iter().next().map(|g| g.name()), Some("lan"));
//! assert!(groups.get("wan").is_some());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod sorted;
pub mod traits;

pub use error::{StrataError, StrataResult};
pub use sorted::{Named, SortedList};
pub use traits::{ModuleState, SecurityModule};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
