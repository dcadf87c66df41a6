// ============================================
// File: crates/meshrelay-agent/src/api.rs
// ============================================
//! # Agent API Surfaces
//!
//! ## Creation Reason
//! Local consumers (port forwards, SOCKS-like front ends, operators)
//! talk to an agent through two narrow traits instead of the dispatcher.
//!
//! ## Main Functionality
//! - `Ingress`: open streams and UDP associations into the mesh
//! - `ControlPlane`: inspect routes and counters, trigger advertisement
//!
//! ## ⚠️ Important Note for Next Developer
//! - Both traits are implemented for `Arc<RelayDispatcher>` and for
//!   `Agent`; add new front ends against the traits
//!
//! ## Last Modified
//! v0.1.0 - Initial API traits

use std::sync::Arc;

use async_trait::async_trait;

use meshrelay_core::protocol::TargetAddr;

use crate::error::Result;
use crate::handlers::{AgentStats, RelayDispatcher, StreamHandle, UdpAssociationHandle};
use crate::services::Route;

/// Entry point for traffic entering the mesh at this agent.
#[async_trait]
pub trait Ingress: Send + Sync {
    /// Opens a TCP stream to `target` through the mesh.
    ///
    /// # Errors
    /// `NoRoute`, `ResourceLimit`, `OpenRejected` or `OpenTimeout`.
    async fn open_stream(&self, target: TargetAddr) -> Result<StreamHandle>;

    /// Opens a UDP association; `hint` steers the open at every hop.
    ///
    /// # Errors
    /// As for [`open_stream`](Self::open_stream).
    async fn open_udp(&self, hint: Option<TargetAddr>) -> Result<UdpAssociationHandle>;
}

/// Operator view of an agent.
pub trait ControlPlane: Send + Sync {
    /// Advertises own exit routes now instead of at the next interval.
    fn trigger_advertise(&self);

    /// Current counts.
    fn stats(&self) -> AgentStats;

    /// Copy of every stored route.
    fn route_snapshot(&self) -> Vec<Route>;
}

#[async_trait]
impl Ingress for Arc<RelayDispatcher> {
    async fn open_stream(&self, target: TargetAddr) -> Result<StreamHandle> {
        RelayDispatcher::open_stream(self, target).await
    }

    async fn open_udp(&self, hint: Option<TargetAddr>) -> Result<UdpAssociationHandle> {
        RelayDispatcher::open_udp(self, hint).await
    }
}

impl ControlPlane for Arc<RelayDispatcher> {
    fn trigger_advertise(&self) {
        RelayDispatcher::trigger_advertise(self);
    }

    fn stats(&self) -> AgentStats {
        RelayDispatcher::stats(self)
    }

    fn route_snapshot(&self) -> Vec<Route> {
        RelayDispatcher::route_snapshot(self)
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use meshrelay_common::AgentId;
    use meshrelay_transport::MockDialer;
    use tokio_util::sync::CancellationToken;

    use crate::config::RelaySettings;
    use crate::services::{PeerRegistry, RouteTable};

    #[test]
    fn test_control_plane_beside_route_table() {
        let id = AgentId::generate();
        let routes = Arc::new(RouteTable::new(id));
        routes
            .add_route(Route::local("10.0.0.0/8".parse().unwrap(), id))
            .unwrap();
        let d = RelayDispatcher::new(
            id,
            RelaySettings::default(),
            routes,
            Arc::new(PeerRegistry::new()),
            Arc::new(MockDialer::new()),
            CancellationToken::new(),
        );

        // With the trait in scope `routes()` is still the live table.
        let hit = d.routes().lookup("10.1.2.3".parse().unwrap()).unwrap();
        assert!(hit.is_local());

        let plane: &dyn ControlPlane = &d;
        let snapshot = plane.route_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].prefix, hit.prefix);
        assert_eq!(plane.stats().routes, 1);
    }
}
