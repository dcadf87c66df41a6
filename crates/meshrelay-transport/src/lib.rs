// ============================================
// File: crates/meshrelay-transport/src/lib.rs
// ============================================
//! # MeshRelay Transport - Collaborator Interfaces
//!
//! ## Creation Reason
//! Isolates everything that touches the network from the relay core.
//! The agent only sees the traits defined here, so links, dialers and
//! sockets can be swapped for in-memory or fault-injecting versions.
//!
//! ## Main Functionality
//! - [`traits`]: `PeerLink`, `Dialer`, `DatagramSocket`, `BoxedStream`
//! - [`tcp`]: `TcpPeerLink` between agents
//! - [`dial`]: `TcpDialer` for exit-side TCP connects and UDP binds
//! - [`udp`]: `UdpDatagramSocket` (socket2, dual-stack)
//! - [`memory`] / [`mock`]: in-process link pairs, sockets and a
//!   scripted dialer for tests
//! - [`fault`]: latency / error / disconnect injection decorators
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                meshrelay-agent                      │
//! │                    │                                │
//! │         ┌──────────┴──────────┐                     │
//! │         ▼                     ▼                     │
//! │   meshrelay-core ◄──── meshrelay-transport          │
//! │                        You are here                 │
//! │         │                     │                     │
//! │         └──────────┬──────────┘                     │
//! │                    ▼                                │
//! │             meshrelay-common                        │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Every `PeerLink` implementation MUST preserve frame order
//! - Always code against the traits; concrete types are for wiring only
//!
//! ## Last Modified
//! v0.1.0 - Initial transport layer implementation

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod dial;
pub mod error;
pub mod fault;
pub mod memory;
pub mod mock;
pub mod tcp;
pub mod traits;
pub mod udp;

// Re-export primary types
pub use dial::TcpDialer;
pub use error::{Result, TransportError};
pub use fault::{FaultConfig, FaultyDialer, FaultyLink};
pub use memory::{MemoryLink, MemorySocket};
pub use mock::{DialOutcome, MockDialer};
pub use tcp::TcpPeerLink;
pub use traits::{BoxedStream, DatagramSocket, DialedStream, Dialer, PeerLink};
pub use udp::UdpDatagramSocket;
