// ============================================
// File: crates/meshrelay-agent/src/services/mod.rs
// ============================================
//! # Agent Services
//!
//! ## Creation Reason
//! The shared state of an agent, separated from the frame handling that
//! drives it.
//!
//! ## Main Functionality
//!
//! ### Submodules
//! - [`routing`]: Longest-prefix-match route table
//! - [`flood`]: Route advertisement ingestion and re-flooding
//! - [`slots`]: Generational id arena behind hop-local ids
//! - [`stream`]: Stream lifecycle and per-hop stream table
//! - [`udp`]: UDP association table
//! - [`peers`]: Attached neighbors and their outbound queues
//!
//! ## Service Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Service Layer                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐   ┌─────────────────────────────────┐  │
//! │  │  RouteFlooder   │──►│          RouteTable             │  │
//! │  │  - loop check   │   │  - LPM lookup                   │  │
//! │  │  - hop limit    │   │  - expiry / withdrawal          │  │
//! │  └─────────────────┘   └─────────────────────────────────┘  │
//! │                                                             │
//! │  ┌─────────────────┐   ┌─────────────────┐  ┌────────────┐  │
//! │  │  StreamTable    │   │AssociationTable │  │PeerRegistry│  │
//! │  │  (SlotTable)    │   │  (SlotTable)    │  │            │  │
//! │  └─────────────────┘   └─────────────────┘  └────────────┘  │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Services never send frames; handlers do
//! - All services are Send + Sync and shared through `Arc`
//!
//! ## Last Modified
//! v0.1.0 - Initial services structure

pub mod flood;
pub mod peers;
pub mod routing;
pub mod slots;
pub mod stream;
pub mod udp;

// Re-export primary types
pub use flood::{DropReason, FloodDecision, RouteFlooder};
pub use peers::{PeerHandle, PeerRegistry, PeerStats};
pub use routing::{Route, RouteTable, RouteUpdate};
pub use slots::{SlotTable, REPLY_BIT};
pub use stream::{StreamEntry, StreamEvent, StreamRole, StreamState, StreamTable};
pub use udp::{AssociationEntry, AssociationRole, AssociationTable, ReceivedDatagram};
