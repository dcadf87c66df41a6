// ============================================
// File: crates/meshrelay-agent/src/services/routing.rs
// ============================================
//! # Route Table
//!
//! ## Creation Reason
//! Maps destination prefixes to the neighbor that leads toward the exit
//! owning them. Filled by route flooding and by the agent's own exit
//! prefixes, read on every stream and association open.
//!
//! ## Main Functionality
//! - `Route`: one learned or local binding `prefix → next_hop`
//! - `RouteTable::lookup`: longest-prefix match over non-expired routes
//! - `RouteTable::add_route`: insert or refresh, one entry per
//!   `(prefix, origin)`
//! - Reaping helpers: `remove_expired`, `remove_routes_via`
//!
//! ## Lookup Algorithm
//! ```text
//! lengths[family] = { 16: 1 entry, 8: 2 entries, 0: 1 entry }
//!
//! lookup(10.1.2.3):
//!   for len in lengths.keys().rev()      16, 8, 0
//!       cidr = mask(10.1.2.3, len)       10.1.0.0/16
//!       candidates = by_prefix[cidr]     skip expired
//!       best = min by (metric, learned_seq)
//!       return best if any
//! ```
//! At most 33 (IPv4) or 129 (IPv6) map reads per lookup, independent
//! of the number of routes.
//!
//! ## Replacement Rule
//! A route for an existing `(prefix, origin)` replaces the stored one
//! when the new metric is not worse, when it arrives from the same next
//! hop (a refresh or a metric change on the current path), or when the
//! stored one has expired. The original `learned_seq` is kept so a
//! refreshed route does not lose its tie-break position.
//!
//! ## ⚠️ Important Note for Next Developer
//! - Only the local agent may own `metric = 0` routes
//! - Local routes never expire and are never removed by peer loss
//! - Mutation takes the write lock; lookups share the read lock
//!
//! ## Last Modified
//! v0.1.0 - Initial route table

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, trace};

use meshrelay_common::{AgentId, Cidr};
use meshrelay_core::protocol::{Host, TargetAddr};

use crate::error::{AgentError, Result};

// ============================================
// Route
// ============================================

/// One prefix binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination prefix.
    pub prefix: Cidr,
    /// Neighbor to forward to; the local agent for exit routes.
    pub next_hop: AgentId,
    /// Hop count to the exit.
    pub metric: u32,
    /// Exit agent that owns the prefix.
    pub origin: AgentId,
    /// Agents the advertisement has passed through.
    pub seen_by: Vec<AgentId>,
    /// `None` for local routes.
    pub expires_at: Option<Instant>,
    /// Insertion order, used as the final tie-break.
    pub learned_seq: u64,
}

impl Route {
    /// Route for a prefix this agent exits itself.
    #[must_use]
    pub fn local(prefix: Cidr, local_id: AgentId) -> Self {
        Self {
            prefix,
            next_hop: local_id,
            metric: 0,
            origin: local_id,
            seen_by: vec![local_id],
            expires_at: None,
            learned_seq: 0,
        }
    }

    /// Route learned from a neighbor, valid for `ttl` from `now`.
    #[must_use]
    pub fn learned(
        prefix: Cidr,
        next_hop: AgentId,
        metric: u32,
        origin: AgentId,
        seen_by: Vec<AgentId>,
        ttl: Duration,
        now: Instant,
    ) -> Self {
        Self {
            prefix,
            next_hop,
            metric,
            origin,
            seen_by,
            expires_at: Some(now + ttl),
            learned_seq: 0,
        }
    }

    /// Returns `true` for exit routes owned by this agent.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        self.metric == 0
    }

    /// Returns `true` once `expires_at` has passed.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Outcome of [`RouteTable::add_route`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteUpdate {
    /// New `(prefix, origin)` entry.
    Added,
    /// Existing entry refreshed or improved.
    Replaced,
    /// Existing entry kept; the offered route was worse.
    Ignored,
}

impl RouteUpdate {
    /// Returns `true` if the table changed.
    #[must_use]
    pub const fn changed(self) -> bool {
        !matches!(self, Self::Ignored)
    }
}

// ============================================
// RouteTable
// ============================================

#[derive(Default)]
struct Inner {
    by_prefix: HashMap<Cidr, Vec<Route>>,
    v4_lengths: BTreeMap<u8, usize>,
    v6_lengths: BTreeMap<u8, usize>,
    next_seq: u64,
}

impl Inner {
    fn lengths_mut(&mut self, prefix: &Cidr) -> &mut BTreeMap<u8, usize> {
        if prefix.is_ipv4() {
            &mut self.v4_lengths
        } else {
            &mut self.v6_lengths
        }
    }

    fn lengths(&self, ip: &IpAddr) -> &BTreeMap<u8, usize> {
        if ip.is_ipv4() {
            &self.v4_lengths
        } else {
            &self.v6_lengths
        }
    }

    fn prefix_added(&mut self, prefix: &Cidr) {
        *self.lengths_mut(prefix).entry(prefix.prefix_len()).or_insert(0) += 1;
    }

    fn prefix_removed(&mut self, prefix: &Cidr) {
        let lengths = self.lengths_mut(prefix);
        if let Some(count) = lengths.get_mut(&prefix.prefix_len()) {
            *count -= 1;
            if *count == 0 {
                lengths.remove(&prefix.prefix_len());
            }
        }
    }

    /// Removes every route matching `drop`, keeping the counters right.
    fn retain(&mut self, mut keep: impl FnMut(&Route) -> bool) -> Vec<Route> {
        let mut removed = Vec::new();
        let mut emptied = Vec::new();
        for (prefix, routes) in &mut self.by_prefix {
            let mut i = 0;
            while i < routes.len() {
                if keep(&routes[i]) {
                    i += 1;
                } else {
                    removed.push(routes.swap_remove(i));
                }
            }
            if routes.is_empty() {
                emptied.push(*prefix);
            }
        }
        for prefix in emptied {
            self.by_prefix.remove(&prefix);
            self.prefix_removed(&prefix);
        }
        removed
    }
}

fn best(routes: &[Route], now: Instant) -> Option<&Route> {
    routes
        .iter()
        .filter(|r| !r.is_expired(now))
        .min_by_key(|r| (r.metric, r.learned_seq))
}

/// Concurrent longest-prefix-match route table.
pub struct RouteTable {
    local_id: AgentId,
    inner: RwLock<Inner>,
}

impl RouteTable {
    /// Creates an empty table for `local_id`.
    #[must_use]
    pub fn new(local_id: AgentId) -> Self {
        Self {
            local_id,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Id of the owning agent.
    #[must_use]
    pub const fn local_id(&self) -> AgentId {
        self.local_id
    }

    // ========================================
    // Mutation
    // ========================================

    /// Inserts or refreshes a route.
    ///
    /// # Errors
    /// `InvalidRoute` for a `metric = 0` route owned by another agent.
    pub fn add_route(&self, route: Route) -> Result<RouteUpdate> {
        self.add_route_at(route, Instant::now())
    }

    /// [`add_route`](Self::add_route) with an explicit clock.
    ///
    /// # Errors
    /// `InvalidRoute` for a `metric = 0` route owned by another agent.
    pub fn add_route_at(&self, mut route: Route, now: Instant) -> Result<RouteUpdate> {
        if route.metric == 0 && route.origin != self.local_id {
            return Err(AgentError::InvalidRoute {
                reason: format!("metric 0 route for {} owned by {}", route.prefix, route.origin),
            });
        }
        if route.metric == 0 {
            route.expires_at = None;
        }

        let mut inner = self.inner.write();
        let prefix = route.prefix;

        if let Some(routes) = inner.by_prefix.get_mut(&prefix) {
            if let Some(existing) = routes.iter_mut().find(|r| r.origin == route.origin) {
                // Another neighbor must be strictly better; an equal path
                // would flip the next hop on every refresh.
                let replace = route.next_hop == existing.next_hop
                    || route.metric < existing.metric
                    || existing.is_expired(now);
                if !replace {
                    trace!(prefix = %prefix, origin = %route.origin, metric = route.metric, "Worse route ignored");
                    return Ok(RouteUpdate::Ignored);
                }
                route.learned_seq = existing.learned_seq;
                trace!(prefix = %prefix, next_hop = %route.next_hop, metric = route.metric, "Route refreshed");
                *existing = route;
                return Ok(RouteUpdate::Replaced);
            }
        }

        inner.next_seq += 1;
        route.learned_seq = inner.next_seq;
        debug!(
            prefix = %prefix,
            next_hop = %route.next_hop,
            origin = %route.origin,
            metric = route.metric,
            "Route added"
        );

        match inner.by_prefix.get_mut(&prefix) {
            Some(routes) => routes.push(route),
            None => {
                inner.by_prefix.insert(prefix, vec![route]);
                inner.prefix_added(&prefix);
            }
        }
        Ok(RouteUpdate::Added)
    }

    /// Removes every route for `prefix`.
    ///
    /// # Errors
    /// `RouteNotFound` if nothing is stored for it.
    pub fn remove_route(&self, prefix: Cidr) -> Result<Vec<Route>> {
        let mut inner = self.inner.write();
        let removed = inner
            .by_prefix
            .remove(&prefix)
            .ok_or(AgentError::RouteNotFound { prefix })?;
        inner.prefix_removed(&prefix);
        debug!(prefix = %prefix, count = removed.len(), "Routes removed");
        Ok(removed)
    }

    /// Removes learned routes whose next hop is `peer`.
    pub fn remove_routes_via(&self, peer: AgentId) -> Vec<Route> {
        let removed = self
            .inner
            .write()
            .retain(|r| r.is_local() || r.next_hop != peer);
        if !removed.is_empty() {
            info!(peer = %peer, count = removed.len(), "Withdrew routes via lost peer");
        }
        removed
    }

    /// Removes routes expired at `now`.
    pub fn remove_expired(&self, now: Instant) -> Vec<Route> {
        let removed = self.inner.write().retain(|r| !r.is_expired(now));
        for route in &removed {
            debug!(prefix = %route.prefix, origin = %route.origin, "Route expired");
        }
        removed
    }

    // ========================================
    // Lookup
    // ========================================

    /// Longest-prefix match for `ip`.
    #[must_use]
    pub fn lookup(&self, ip: IpAddr) -> Option<Route> {
        self.lookup_at(ip, Instant::now())
    }

    /// [`lookup`](Self::lookup) with an explicit clock.
    #[must_use]
    pub fn lookup_at(&self, ip: IpAddr, now: Instant) -> Option<Route> {
        let inner = self.inner.read();
        for &len in inner.lengths(&ip).keys().rev() {
            let Ok(cidr) = Cidr::new(ip, len) else {
                continue;
            };
            if let Some(route) = inner.by_prefix.get(&cidr).and_then(|r| best(r, now)) {
                return Some(route.clone());
            }
        }
        None
    }

    /// Best non-expired route stored for exactly `prefix`.
    #[must_use]
    pub fn lookup_prefix(&self, prefix: Cidr) -> Option<Route> {
        let inner = self.inner.read();
        inner
            .by_prefix
            .get(&prefix)
            .and_then(|r| best(r, Instant::now()))
            .cloned()
    }

    /// Route for an open request.
    ///
    /// Literal IPs use longest-prefix match. Domains and unspecified
    /// addresses use the default route, IPv4 first.
    #[must_use]
    pub fn lookup_target(&self, target: &TargetAddr) -> Option<Route> {
        match &target.host {
            Host::Ip(ip) if !ip.is_unspecified() => self.lookup(*ip),
            _ => self.lookup_default(),
        }
    }

    /// `0.0.0.0/0`, then `::/0`.
    #[must_use]
    pub fn lookup_default(&self) -> Option<Route> {
        self.lookup_prefix(Cidr::default_v4())
            .or_else(|| self.lookup_prefix(Cidr::default_v6()))
    }

    // ========================================
    // Inspection
    // ========================================

    /// Exit routes owned by this agent.
    #[must_use]
    pub fn local_routes(&self) -> Vec<Route> {
        let inner = self.inner.read();
        let mut routes: Vec<Route> = inner
            .by_prefix
            .values()
            .flatten()
            .filter(|r| r.is_local())
            .cloned()
            .collect();
        routes.sort_by_key(|r| r.prefix);
        routes
    }

    /// Total stored routes.
    #[must_use]
    pub fn route_count(&self) -> usize {
        self.inner.read().by_prefix.values().map(Vec::len).sum()
    }

    /// Distinct stored prefixes.
    #[must_use]
    pub fn prefix_count(&self) -> usize {
        self.inner.read().by_prefix.len()
    }

    /// Copy of every stored route, ordered by prefix then metric.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Route> {
        let inner = self.inner.read();
        let mut routes: Vec<Route> = inner.by_prefix.values().flatten().cloned().collect();
        routes.sort_by_key(|r| (r.prefix, r.metric, r.learned_seq));
        routes
    }
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable")
            .field("local_id", &self.local_id)
            .field("routes", &self.route_count())
            .field("prefixes", &self.prefix_count())
            .finish()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    fn cidr(s: &str) -> Cidr {
        s.parse().unwrap()
    }

    fn learned(prefix: &str, next_hop: AgentId, metric: u32, origin: AgentId) -> Route {
        Route::learned(
            cidr(prefix),
            next_hop,
            metric,
            origin,
            vec![origin],
            TTL,
            Instant::now(),
        )
    }

    #[test]
    fn test_longest_prefix_wins_over_metric() {
        let table = RouteTable::new(AgentId::generate());
        let (b, c) = (AgentId::generate(), AgentId::generate());

        table.add_route(learned("10.0.0.0/8", b, 2, b)).unwrap();
        table.add_route(learned("10.1.0.0/16", c, 1, c)).unwrap();

        let hit = table.lookup("10.1.2.3".parse().unwrap()).unwrap();
        assert_eq!(hit.prefix, cidr("10.1.0.0/16"));

        table.remove_route(cidr("10.1.0.0/16")).unwrap();
        let hit = table.lookup("10.1.2.3".parse().unwrap()).unwrap();
        assert_eq!(hit.prefix, cidr("10.0.0.0/8"));
    }

    #[test]
    fn test_tie_break_metric_then_first_learned() {
        let table = RouteTable::new(AgentId::generate());
        let (x, y, z) = (AgentId::generate(), AgentId::generate(), AgentId::generate());

        table.add_route(learned("10.0.0.0/8", x, 3, x)).unwrap();
        table.add_route(learned("10.0.0.0/8", y, 2, y)).unwrap();
        table.add_route(learned("10.0.0.0/8", z, 2, z)).unwrap();

        let hit = table.lookup("10.9.9.9".parse().unwrap()).unwrap();
        assert_eq!(hit.origin, y);

        // Refreshing y keeps its position ahead of z.
        assert_eq!(
            table.add_route(learned("10.0.0.0/8", y, 2, y)).unwrap(),
            RouteUpdate::Replaced
        );
        assert_eq!(table.lookup("10.9.9.9".parse().unwrap()).unwrap().origin, y);
        assert_eq!(table.route_count(), 3);
        assert_eq!(table.prefix_count(), 1);
    }

    #[test]
    fn test_same_origin_replaces_not_duplicates() {
        let table = RouteTable::new(AgentId::generate());
        let (b, c, origin) = (AgentId::generate(), AgentId::generate(), AgentId::generate());

        assert_eq!(
            table.add_route(learned("192.168.0.0/16", b, 3, origin)).unwrap(),
            RouteUpdate::Added
        );
        assert_eq!(
            table.add_route(learned("192.168.0.0/16", c, 2, origin)).unwrap(),
            RouteUpdate::Replaced
        );
        // Worse path through another neighbor does not displace it.
        assert_eq!(
            table.add_route(learned("192.168.0.0/16", b, 5, origin)).unwrap(),
            RouteUpdate::Ignored
        );
        // Current next hop reporting a worse metric is believed.
        assert_eq!(
            table.add_route(learned("192.168.0.0/16", c, 4, origin)).unwrap(),
            RouteUpdate::Replaced
        );

        let hit = table.lookup("192.168.1.1".parse().unwrap()).unwrap();
        assert_eq!((hit.next_hop, hit.metric), (c, 4));
        assert_eq!(table.route_count(), 1);
    }

    #[test]
    fn test_equal_metric_keeps_next_hop() {
        let table = RouteTable::new(AgentId::generate());
        let (b, c, origin) = (AgentId::generate(), AgentId::generate(), AgentId::generate());
        let ip = "192.168.1.1".parse().unwrap();

        assert_eq!(
            table.add_route(learned("192.168.0.0/16", b, 2, origin)).unwrap(),
            RouteUpdate::Added
        );
        for _ in 0..2 {
            assert_eq!(
                table.add_route(learned("192.168.0.0/16", c, 2, origin)).unwrap(),
                RouteUpdate::Ignored
            );
            assert_eq!(table.lookup(ip).unwrap().next_hop, b);
            assert_eq!(
                table.add_route(learned("192.168.0.0/16", b, 2, origin)).unwrap(),
                RouteUpdate::Replaced
            );
            assert_eq!(table.lookup(ip).unwrap().next_hop, b);
        }

        // An expired entry yields to an equal path elsewhere.
        let later = Instant::now() + TTL + Duration::from_secs(1);
        let mut via_c = learned("192.168.0.0/16", c, 2, origin);
        via_c.expires_at = Some(later + TTL);
        assert_eq!(table.add_route_at(via_c, later).unwrap(), RouteUpdate::Replaced);
        assert_eq!(table.lookup_at(ip, later).unwrap().next_hop, c);
        assert_eq!(table.route_count(), 1);
    }

    #[test]
    fn test_route_expiry() {
        let table = RouteTable::new(AgentId::generate());
        let peer = AgentId::generate();
        let now = Instant::now();
        let route = Route::learned(
            cidr("10.0.0.0/8"),
            peer,
            1,
            peer,
            vec![peer],
            Duration::from_secs(2),
            now,
        );
        table.add_route_at(route, now).unwrap();

        let ip = "10.0.0.1".parse().unwrap();
        assert!(table.lookup_at(ip, now + Duration::from_secs(1)).is_some());
        assert!(table.lookup_at(ip, now + Duration::from_secs(3)).is_none());

        let removed = table.remove_expired(now + Duration::from_secs(3));
        assert_eq!(removed.len(), 1);
        assert_eq!(table.route_count(), 0);
        assert_eq!(table.prefix_count(), 0);
    }

    #[test]
    fn test_expired_specific_falls_back_to_shorter() {
        let table = RouteTable::new(AgentId::generate());
        let (b, c) = (AgentId::generate(), AgentId::generate());
        let now = Instant::now();

        table
            .add_route_at(
                Route::learned(cidr("10.0.0.0/8"), b, 2, b, vec![b], Duration::from_secs(60), now),
                now,
            )
            .unwrap();
        table
            .add_route_at(
                Route::learned(cidr("10.1.0.0/16"), c, 1, c, vec![c], Duration::from_secs(2), now),
                now,
            )
            .unwrap();

        let hit = table
            .lookup_at("10.1.0.1".parse().unwrap(), now + Duration::from_secs(5))
            .unwrap();
        assert_eq!(hit.prefix, cidr("10.0.0.0/8"));
    }

    #[test]
    fn test_local_routes() {
        let me = AgentId::generate();
        let table = RouteTable::new(me);
        table.add_route(Route::local(cidr("0.0.0.0/0"), me)).unwrap();

        let hit = table.lookup("8.8.8.8".parse().unwrap()).unwrap();
        assert!(hit.is_local());
        assert_eq!(hit.expires_at, None);
        assert_eq!(table.local_routes().len(), 1);

        // Local routes survive peer withdrawal.
        assert!(table.remove_routes_via(me).is_empty());
    }

    #[test]
    fn test_foreign_metric_zero_rejected() {
        let table = RouteTable::new(AgentId::generate());
        let other = AgentId::generate();
        let result = table.add_route(Route::local(cidr("10.0.0.0/8"), other));
        assert!(matches!(result, Err(AgentError::InvalidRoute { .. })));
    }

    #[test]
    fn test_remove_missing_prefix() {
        let table = RouteTable::new(AgentId::generate());
        assert!(matches!(
            table.remove_route(cidr("10.0.0.0/8")),
            Err(AgentError::RouteNotFound { .. })
        ));
    }

    #[test]
    fn test_remove_routes_via_peer() {
        let table = RouteTable::new(AgentId::generate());
        let (b, c) = (AgentId::generate(), AgentId::generate());
        table.add_route(learned("10.0.0.0/8", b, 1, b)).unwrap();
        table.add_route(learned("172.16.0.0/12", b, 2, c)).unwrap();
        table.add_route(learned("192.168.0.0/16", c, 1, c)).unwrap();

        assert_eq!(table.remove_routes_via(b).len(), 2);
        assert!(table.lookup("10.1.1.1".parse().unwrap()).is_none());
        assert!(table.lookup("192.168.1.1".parse().unwrap()).is_some());
        assert_eq!(table.prefix_count(), 1);
    }

    #[test]
    fn test_ipv6_and_family_separation() {
        let table = RouteTable::new(AgentId::generate());
        let b = AgentId::generate();
        table.add_route(learned("2001:db8::/32", b, 1, b)).unwrap();

        assert!(table.lookup("2001:db8::1".parse().unwrap()).is_some());
        assert!(table.lookup("10.0.0.1".parse().unwrap()).is_none());
    }

    #[test]
    fn test_lookup_target_domain_uses_default() {
        let table = RouteTable::new(AgentId::generate());
        let (b, c) = (AgentId::generate(), AgentId::generate());
        table.add_route(learned("0.0.0.0/8", c, 1, c)).unwrap();
        table.add_route(learned("0.0.0.0/0", b, 2, b)).unwrap();

        let domain = TargetAddr::domain("example.com", 443).unwrap();
        assert_eq!(table.lookup_target(&domain).unwrap().next_hop, b);

        let unspecified: TargetAddr = "0.0.0.0:53".parse().unwrap();
        assert_eq!(table.lookup_target(&unspecified).unwrap().next_hop, b);

        let literal: TargetAddr = "0.1.2.3:80".parse().unwrap();
        assert_eq!(table.lookup_target(&literal).unwrap().next_hop, c);
    }
}
