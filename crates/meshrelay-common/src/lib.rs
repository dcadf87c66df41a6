// ============================================
// File: crates/meshrelay-common/src/lib.rs
// ============================================
//! # MeshRelay Common - Shared Identifiers & Utilities
//!
//! ## Creation Reason
//! Holds the small value types every other MeshRelay crate agrees on:
//! agent identities, end-to-end request identifiers, CIDR prefixes and
//! lock-free activity timestamps.
//!
//! ## Main Functionality
//! - [`types`]: `AgentId`, `RequestId`, `Cidr`
//! - [`time`]: `AtomicInstant` activity tracking, `Timestamp`
//! - [`error`]: `CommonError` and the crate `Result` alias
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                meshrelay-agent                      │
//! │                    │                                │
//! │         ┌──────────┴──────────┐                     │
//! │         ▼                     ▼                     │
//! │   meshrelay-core ◄──── meshrelay-transport          │
//! │         │                     │                     │
//! │         └──────────┬──────────┘                     │
//! │                    ▼                                │
//! │            meshrelay-common  ◄── You are here       │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Leaf crate: no internal dependencies, keep external ones minimal
//! - `AgentId` and `Cidr` appear on the wire; their byte layouts are frozen
//!
//! ## Last Modified
//! v0.1.0 - Initial implementation

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod time;
pub mod types;

// Re-export commonly used items at crate root
pub use error::{CommonError, Result};
pub use types::{AgentId, Cidr, RequestId};
