//! Longest-prefix-match routing table over ILP addresses.
//!
//! Resolution picks the route whose pattern is the longest dot-segment
//! prefix of the destination address; ties break first by highest
//! `priority`, then by the lexicographically smallest `next_hop`, so that
//! `next_hop_for` is a pure function of the table's contents (no
//! insertion-order dependence).

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use ilp_packet::Address;

/// A single routing table entry: `pattern` is an address prefix (e.g.
/// `g.acme`), `next_hop` is the peer id packets matching it are forwarded
/// to, and `priority` breaks ties between equally-specific patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub pattern: String,
    pub next_hop: String,
    pub priority: i32,
}

/// Identifies a route independent of its priority: two routes with the
/// same `(pattern, next_hop)` are the same route per spec, so re-adding one
/// just replaces its priority rather than creating a second entry.
type RouteKey = (String, String);

#[derive(Debug, Default, Clone)]
struct Snapshot {
    routes: HashMap<RouteKey, Route>,
}

/// Thread-safe routing table. Reads (`next_hop_for`) never block behind a
/// concurrent write: each mutation builds a new immutable snapshot and
/// atomically swaps it in.
pub struct RoutingTable {
    snapshot: ArcSwap<Snapshot>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        RoutingTable {
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
        }
    }

    /// Inserts the route for `(pattern, next_hop)`, or replaces its
    /// priority if that exact pair is already present.
    pub fn add_route(&self, route: Route) {
        self.snapshot.rcu(|current| {
            let mut next = (**current).clone();
            let key = (route.pattern.clone(), route.next_hop.clone());
            next.routes.insert(key, route.clone());
            Arc::new(next)
        });
    }

    /// Removes the route registered for `(pattern, next_hop)`, if any.
    /// Returns whether a route was actually removed.
    pub fn remove_route(&self, pattern: &str, next_hop: &str) -> bool {
        let mut removed = false;
        let key = (pattern.to_owned(), next_hop.to_owned());
        self.snapshot.rcu(|current| {
            let mut next = (**current).clone();
            removed = next.routes.remove(&key).is_some();
            Arc::new(next)
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves the best matching route for `destination`, if any pattern
    /// in the table is a dot-segment prefix of it: longest pattern wins,
    /// ties break by highest `priority`, further ties by lexicographically
    /// smallest `next_hop`.
    pub fn next_hop_for(&self, destination: &Address) -> Option<String> {
        let snapshot = self.snapshot.load();
        let dest = destination.as_str();
        snapshot
            .routes
            .values()
            .filter(|route| is_prefix_match(&route.pattern, dest))
            .min_by(|a, b| {
                b.pattern
                    .len()
                    .cmp(&a.pattern.len())
                    .then(b.priority.cmp(&a.priority))
                    .then(a.next_hop.cmp(&b.next_hop))
            })
            .map(|route| route.next_hop.clone())
    }

    /// A consistent snapshot of every route currently in the table, for
    /// telemetry/inspection.
    pub fn routes(&self) -> Vec<Route> {
        self.snapshot.load().routes.values().cloned().collect()
    }
}

fn is_prefix_match(pattern: &str, destination: &str) -> bool {
    destination == pattern
        || (destination.starts_with(pattern)
            && destination.as_bytes().get(pattern.len()) == Some(&b'.'))
}
