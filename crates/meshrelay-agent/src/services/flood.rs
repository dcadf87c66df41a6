// ============================================
// File: crates/meshrelay-agent/src/services/flood.rs
// ============================================
//! # Route Flooding
//!
//! ## Creation Reason
//! Builds the route table from `ROUTE_ADVERTISE` frames and decides what
//! gets re-flooded.
//!
//! ## Main Functionality
//! - `RouteFlooder::originate`: advertisements for this agent's exit prefixes
//! - `RouteFlooder::table_dump`: catch-up set for a newly attached peer
//! - `RouteFlooder::receive`: loop check, hop limit, table update, and the
//!   advertisement to forward (if any)
//!
//! ## Flood Walk
//! ```text
//!  A (exit 10/8)          B                      C
//!  adv{m=0, seen=[A]} ──► install m=1 via A
//!                         adv{m=1, seen=[A,B]} ─► install m=2 via B
//!                                                 adv{m=2, seen=[A,B,C]} ─► ...
//!  seen_by contains self  → dropped (loop)
//!  metric >= max_hops     → dropped (hop limit)
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - The flooder never sends; the dispatcher fans `forward` out to every
//!   peer except the one it came from
//! - Only advertisements that changed the table are forwarded, so periodic
//!   refreshes travel the mesh but duplicates die at the first hop
//!
//! ## Last Modified
//! v0.1.0 - Initial flooding implementation

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use meshrelay_common::AgentId;
use meshrelay_core::protocol::messages::MAX_SEEN_BY;
use meshrelay_core::protocol::RouteAdvertise;

use crate::error::Result;
use crate::services::routing::{Route, RouteTable, RouteUpdate};

// ============================================
// FloodDecision
// ============================================

/// Why an advertisement was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// This agent already appears in `seen_by`.
    Looped,
    /// Advertisement for a prefix this agent originates.
    OwnOrigin,
    /// `metric` reached `max_hops`.
    HopLimit,
}

/// Outcome of [`RouteFlooder::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FloodDecision {
    /// Discarded without touching the table.
    Dropped(DropReason),
    /// Offered to the table.
    Accepted {
        /// What the table did with it.
        update: RouteUpdate,
        /// Advertisement to send to every other peer.
        forward: Option<RouteAdvertise>,
    },
}

impl FloodDecision {
    /// Advertisement to re-flood, if any.
    #[must_use]
    pub fn forward(&self) -> Option<&RouteAdvertise> {
        match self {
            Self::Accepted { forward, .. } => forward.as_ref(),
            Self::Dropped(_) => None,
        }
    }
}

// ============================================
// RouteFlooder
// ============================================

/// Advertisement origination and ingestion.
#[derive(Debug)]
pub struct RouteFlooder {
    local_id: AgentId,
    routes: Arc<RouteTable>,
    max_hops: u32,
    route_ttl: Duration,
}

impl RouteFlooder {
    /// Creates a flooder feeding `routes`.
    #[must_use]
    pub fn new(local_id: AgentId, routes: Arc<RouteTable>, max_hops: u32, route_ttl: Duration) -> Self {
        Self {
            local_id,
            routes,
            max_hops,
            route_ttl,
        }
    }

    /// Learned route lifetime.
    #[must_use]
    pub const fn route_ttl(&self) -> Duration {
        self.route_ttl
    }

    /// Advertisements for every exit route this agent owns.
    #[must_use]
    pub fn originate(&self) -> Vec<RouteAdvertise> {
        self.routes
            .local_routes()
            .into_iter()
            .map(|route| RouteAdvertise {
                origin: self.local_id,
                metric: 0,
                prefix: route.prefix,
                seen_by: vec![self.local_id],
            })
            .collect()
    }

    /// Advertisements that bring a new neighbor up to date: own exits
    /// plus the best learned route for every other prefix.
    ///
    /// Learned entries are re-sent exactly as they were forwarded, so the
    /// neighbor's loop check still applies.
    #[must_use]
    pub fn table_dump(&self) -> Vec<RouteAdvertise> {
        let mut ads = self.originate();
        let mut prefixes: Vec<_> = self
            .routes
            .snapshot()
            .into_iter()
            .filter(|route| !route.is_local())
            .map(|route| route.prefix)
            .collect();
        prefixes.dedup();
        for prefix in prefixes {
            let Some(best) = self.routes.lookup_prefix(prefix) else {
                continue;
            };
            if !best.is_local() && best.seen_by.len() < MAX_SEEN_BY {
                ads.push(RouteAdvertise {
                    origin: best.origin,
                    metric: best.metric,
                    prefix,
                    seen_by: best.seen_by,
                });
            }
        }
        ads
    }

    /// Ingests an advertisement received from neighbor `from`.
    ///
    /// # Errors
    /// Propagates table rejections.
    pub fn receive(&self, from: AgentId, adv: &RouteAdvertise) -> Result<FloodDecision> {
        self.receive_at(from, adv, Instant::now())
    }

    /// [`receive`](Self::receive) with an explicit clock.
    ///
    /// # Errors
    /// Propagates table rejections.
    pub fn receive_at(
        &self,
        from: AgentId,
        adv: &RouteAdvertise,
        now: Instant,
    ) -> Result<FloodDecision> {
        if adv.seen_by.contains(&self.local_id) {
            trace!(prefix = %adv.prefix, origin = %adv.origin, "Advertisement looped back");
            return Ok(FloodDecision::Dropped(DropReason::Looped));
        }
        if adv.origin == self.local_id {
            return Ok(FloodDecision::Dropped(DropReason::OwnOrigin));
        }
        if adv.metric >= self.max_hops {
            debug!(
                prefix = %adv.prefix,
                origin = %adv.origin,
                metric = adv.metric,
                "Advertisement over hop limit"
            );
            return Ok(FloodDecision::Dropped(DropReason::HopLimit));
        }

        let metric = adv.metric + 1;
        let mut seen_by = adv.seen_by.clone();
        seen_by.push(self.local_id);

        let route = Route::learned(
            adv.prefix,
            from,
            metric,
            adv.origin,
            seen_by.clone(),
            self.route_ttl,
            now,
        );
        let update = self.routes.add_route_at(route, now)?;

        let forward = (update.changed() && seen_by.len() < MAX_SEEN_BY).then(|| RouteAdvertise {
            origin: adv.origin,
            metric,
            prefix: adv.prefix,
            seen_by,
        });

        Ok(FloodDecision::Accepted { update, forward })
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    fn flooder(id: AgentId, max_hops: u32) -> RouteFlooder {
        RouteFlooder::new(
            id,
            Arc::new(RouteTable::new(id)),
            max_hops,
            Duration::from_secs(30),
        )
    }

    #[test]
    fn test_originate_local_routes() {
        let a = AgentId::generate();
        let flooder = flooder(a, 16);
        flooder
            .routes
            .add_route(Route::local("10.0.0.0/8".parse().unwrap(), a))
            .unwrap();

        let ads = flooder.originate();
        assert_eq!(ads.len(), 1);
        assert_eq!(ads[0].metric, 0);
        assert_eq!(ads[0].origin, a);
        assert_eq!(ads[0].seen_by, vec![a]);
    }

    #[test]
    fn test_table_dump_includes_learned_routes() {
        let (a, b) = (AgentId::generate(), AgentId::generate());
        let fb = flooder(b, 16);
        fb.routes
            .add_route(Route::local("192.168.0.0/16".parse().unwrap(), b))
            .unwrap();
        let origin = RouteAdvertise {
            origin: a,
            metric: 0,
            prefix: "10.0.0.0/8".parse().unwrap(),
            seen_by: vec![a],
        };
        fb.receive(a, &origin).unwrap();

        let dump = fb.table_dump();
        assert_eq!(dump.len(), 2);
        let learned = dump.iter().find(|adv| adv.origin == a).unwrap();
        assert_eq!(learned.metric, 1);
        assert_eq!(learned.seen_by, vec![a, b]);
    }

    #[test]
    fn test_three_agent_chain() {
        let (a, b, c) = (AgentId::generate(), AgentId::generate(), AgentId::generate());
        let fb = flooder(b, 16);
        let fc = flooder(c, 16);

        let origin = RouteAdvertise {
            origin: a,
            metric: 0,
            prefix: "10.0.0.0/8".parse().unwrap(),
            seen_by: vec![a],
        };

        let at_b = fb.receive(a, &origin).unwrap();
        let to_c = at_b.forward().cloned().unwrap();
        assert_eq!(to_c.metric, 1);
        assert_eq!(to_c.seen_by, vec![a, b]);

        let at_c = fc.receive(b, &to_c).unwrap();
        assert!(matches!(
            at_c,
            FloodDecision::Accepted {
                update: RouteUpdate::Added,
                ..
            }
        ));

        let route = fc.routes.lookup("10.2.3.4".parse().unwrap()).unwrap();
        assert_eq!(route.next_hop, b);
        assert_eq!(route.metric, 2);
        assert_eq!(route.origin, a);
        assert_eq!(route.seen_by, vec![a, b, c]);
    }

    #[test]
    fn test_loop_is_dropped_and_not_forwarded() {
        let (a, b) = (AgentId::generate(), AgentId::generate());
        let fb = flooder(b, 16);
        let looped = RouteAdvertise {
            origin: a,
            metric: 2,
            prefix: "10.0.0.0/8".parse().unwrap(),
            seen_by: vec![a, b],
        };

        let decision = fb.receive(a, &looped).unwrap();
        assert_eq!(decision, FloodDecision::Dropped(DropReason::Looped));
        assert!(decision.forward().is_none());
        assert_eq!(fb.routes.route_count(), 0);
    }

    #[test]
    fn test_own_origin_dropped() {
        let (a, b) = (AgentId::generate(), AgentId::generate());
        let fa = flooder(a, 16);
        let echoed = RouteAdvertise {
            origin: a,
            metric: 1,
            prefix: "10.0.0.0/8".parse().unwrap(),
            seen_by: vec![b],
        };
        assert_eq!(
            fa.receive(b, &echoed).unwrap(),
            FloodDecision::Dropped(DropReason::OwnOrigin)
        );
    }

    #[test]
    fn test_hop_limit() {
        let (a, b) = (AgentId::generate(), AgentId::generate());
        let fb = flooder(b, 3);
        let mut adv = RouteAdvertise {
            origin: a,
            metric: 3,
            prefix: "10.0.0.0/8".parse().unwrap(),
            seen_by: vec![a],
        };
        assert_eq!(
            fb.receive(a, &adv).unwrap(),
            FloodDecision::Dropped(DropReason::HopLimit)
        );

        adv.metric = 2;
        assert!(matches!(fb.receive(a, &adv).unwrap(), FloodDecision::Accepted { .. }));
    }

    #[test]
    fn test_duplicate_not_reforwarded() {
        let (a, b, c, d) = (
            AgentId::generate(),
            AgentId::generate(),
            AgentId::generate(),
            AgentId::generate(),
        );
        let fd = flooder(d, 16);
        let prefix = "10.0.0.0/8".parse().unwrap();

        let via_b = RouteAdvertise {
            origin: a,
            metric: 1,
            prefix,
            seen_by: vec![a, b],
        };
        let via_c = RouteAdvertise {
            origin: a,
            metric: 3,
            prefix,
            seen_by: vec![a, c],
        };

        assert!(fd.receive(b, &via_b).unwrap().forward().is_some());
        let worse = fd.receive(c, &via_c).unwrap();
        assert!(matches!(
            worse,
            FloodDecision::Accepted {
                update: RouteUpdate::Ignored,
                forward: None
            }
        ));
    }

    #[test]
    fn test_refresh_extends_expiry() {
        let (a, b) = (AgentId::generate(), AgentId::generate());
        let fb = RouteFlooder::new(
            b,
            Arc::new(RouteTable::new(b)),
            16,
            Duration::from_secs(2),
        );
        let adv = RouteAdvertise {
            origin: a,
            metric: 0,
            prefix: "10.0.0.0/8".parse().unwrap(),
            seen_by: vec![a],
        };
        let start = Instant::now();
        let ip = "10.0.0.1".parse().unwrap();

        fb.receive_at(a, &adv, start).unwrap();
        fb.receive_at(a, &adv, start + Duration::from_secs(1)).unwrap();

        assert!(fb.routes.lookup_at(ip, start + Duration::from_millis(2500)).is_some());
        assert!(fb.routes.lookup_at(ip, start + Duration::from_secs(4)).is_none());
    }
}
