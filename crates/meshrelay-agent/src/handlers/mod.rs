// ============================================
// File: crates/meshrelay-agent/src/handlers/mod.rs
// ============================================
//! # Relay Handlers
//!
//! ## Creation Reason
//! Everything that reacts to a frame or an ingress call. All handlers
//! are methods of one [`RelayDispatcher`], split by concern.
//!
//! ## Main Functionality
//!
//! ### Submodules
//! - [`dispatcher`]: Frame classification, routing frames, peer loss, sweep
//! - [`stream`]: Stream open / data / close / reset, endpoint pumps
//! - [`udp`]: UDP association open / datagram / close
//! - [`link`]: Peer hello, link pumps, keepalive
//!
//! ## Handler Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     RelayDispatcher                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  link reader ──► handle_frame ─┬─► stream handlers          │
//! │                                ├─► udp handlers             │
//! │                                └─► route advertise          │
//! │                                                             │
//! │  Ingress API ──► open_stream / open_udp                     │
//! │  Agent timers ──► advertise_now / sweep                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Frames from one peer are handled in order on that peer's reader
//!   task; never block it on a socket
//! - Replies travel with the `REPLY_BIT` set on the sender's stream id
//!
//! ## Last Modified
//! v0.1.0 - Initial handlers structure

pub mod dispatcher;
pub mod link;
pub mod stream;
pub mod udp;

pub use dispatcher::{AgentStats, RelayDispatcher};
pub use stream::StreamHandle;
pub use udp::UdpAssociationHandle;
