// ============================================
// File: crates/meshrelay-agent/src/lib.rs
// ============================================
//! # MeshRelay Agent Library
//!
//! ## Creation Reason
//! Provides the mesh agent: a node that floods its exit prefixes to
//! neighbors, learns theirs, and relays encrypted streams and UDP
//! associations hop by hop toward the agent that owns the destination.
//!
//! ## Main Functionality
//!
//! ### Modules
//! - [`agent`]: Lifecycle, listeners, dialers, timers
//! - [`api`]: `Ingress` and `ControlPlane` traits
//! - [`config`]: Agent configuration management
//! - [`identity`]: Persistent agent id
//! - [`services`]: Route table, flooding, stream/association tables, peers
//!   - [`services::routing`]: Longest-prefix route table
//!   - [`services::flood`]: Advertisement acceptance and forwarding
//!   - [`services::stream`]: Stream state machine and table
//!   - [`services::udp`]: UDP association table
//! - [`handlers`]: Frame handlers and the relay dispatcher
//! - [`error`]: Agent-specific error types
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        MeshRelay Agent                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌─────────────┐     ┌─────────────┐     ┌─────────────────┐  │
//! │  │   Config    │────►│    Agent    │────►│    Handlers     │  │
//! │  │  + Identity │     │ Orchestrator│     │  (Dispatcher)   │  │
//! │  └─────────────┘     └──────┬──────┘     └────────┬────────┘  │
//! │                             │                     │           │
//! │         ┌───────────────────┼───────────────────┬─┘           │
//! │         ▼                   ▼                   ▼             │
//! │  ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     │
//! │  │   Route     │     │   Stream    │     │    Peer     │     │
//! │  │   Table     │     │   Tables    │     │  Registry   │     │
//! │  └─────────────┘     └─────────────┘     └─────────────┘     │
//! │                                                               │
//! ├───────────────────────────────────────────────────────────────┤
//! │                     Transport Layer                           │
//! │  ┌─────────────────────┐     ┌─────────────────────────────┐ │
//! │  │   Peer links (TCP)  │     │  Exit dialer (TCP / UDP)    │ │
//! │  └─────────────────────┘     └─────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Data Flow
//! ```text
//! Ingress → seal → peer link → … → transit hops … → exit → open → Destination
//! Ingress ← open ← peer link ← … ← transit hops … ← exit ← seal ← Destination
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Transit hops forward sealed payloads without opening them
//! - Configuration changes require restart (no hot-reload)
//! - Graceful shutdown resets streams before closing links
//!
//! ## Last Modified
//! v0.1.0 - Initial agent library

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod agent;
pub mod api;
pub mod config;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod services;

// Re-export primary types
pub use agent::Agent;
pub use api::{ControlPlane, Ingress};
pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use handlers::{AgentStats, RelayDispatcher, StreamHandle, UdpAssociationHandle};
