//! Topology Ledger
//!
//! Administrative routes between members, keyed by `(source, target)`. A
//! bidirectional route occupies both directions: its reverse key resolves to
//! the stored forward edge and cannot be inserted separately.
//!
//! Routes are independent of live connections. Node existence is checked by
//! the caller against the roster; the ledger only enforces its own keys.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    error::{MeshError, MeshResult},
    types::NodeId,
};

pub type RouteKey = (NodeId, NodeId);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    pub bidirectional: bool,
    pub latency_ms: u32,
    pub bandwidth_mbps: u64,
    pub cost: u32,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl Route {
    pub fn key(&self) -> RouteKey {
        (self.source_node_id, self.target_node_id)
    }
}

/// Fields of a new route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    #[serde(default)]
    pub bidirectional: bool,
    #[serde(default)]
    pub latency_ms: u32,
    #[serde(default)]
    pub bandwidth_mbps: u64,
    #[serde(default)]
    pub cost: u32,
}

/// Partial update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteUpdate {
    pub bidirectional: Option<bool>,
    pub latency_ms: Option<u32>,
    pub bandwidth_mbps: Option<u64>,
    pub cost: Option<u32>,
}

impl RouteUpdate {
    pub fn is_empty(&self) -> bool {
        self.bidirectional.is_none()
            && self.latency_ms.is_none()
            && self.bandwidth_mbps.is_none()
            && self.cost.is_none()
    }
}

#[derive(Debug, Default)]
pub struct TopologyLedger {
    routes: RwLock<BTreeMap<RouteKey, Route>>,
}

impl TopologyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_routes(routes: Vec<Route>) -> Self {
        Self {
            routes: RwLock::new(routes.into_iter().map(|r| (r.key(), r)).collect()),
        }
    }

    pub fn add(&self, spec: RouteSpec, version: u64) -> MeshResult<Route> {
        if spec.source_node_id == spec.target_node_id {
            return Err(MeshError::InvalidArgument(
                "route source and target must differ".to_string(),
            ));
        }
        let key = (spec.source_node_id, spec.target_node_id);
        let reverse = (spec.target_node_id, spec.source_node_id);

        let mut routes = self.routes.write();
        if routes.contains_key(&key) {
            return Err(MeshError::AlreadyExists(format!(
                "route {} -> {} already exists",
                key.0, key.1
            )));
        }
        if let Some(existing) = routes.get(&reverse) {
            if existing.bidirectional || spec.bidirectional {
                return Err(MeshError::AlreadyExists(format!(
                    "route {} <-> {} already covered by a bidirectional edge",
                    key.0, key.1
                )));
            }
        }

        let route = Route {
            source_node_id: spec.source_node_id,
            target_node_id: spec.target_node_id,
            bidirectional: spec.bidirectional,
            latency_ms: spec.latency_ms,
            bandwidth_mbps: spec.bandwidth_mbps,
            cost: spec.cost,
            version,
            updated_at: Utc::now(),
        };
        routes.insert(key, route.clone());
        Ok(route)
    }

    pub fn modify(
        &self,
        source: NodeId,
        target: NodeId,
        update: RouteUpdate,
        version: u64,
    ) -> MeshResult<Route> {
        let mut routes = self.routes.write();
        let key = resolve_key(&routes, source, target).ok_or_else(|| not_found(source, target))?;
        let reverse = (key.1, key.0);

        if update.bidirectional == Some(true) && routes.contains_key(&reverse) {
            return Err(MeshError::AlreadyExists(format!(
                "reverse route {} -> {} exists; delete it before making the route bidirectional",
                reverse.0, reverse.1
            )));
        }

        let route = routes
            .get_mut(&key)
            .ok_or_else(|| not_found(source, target))?;
        if let Some(bidirectional) = update.bidirectional {
            route.bidirectional = bidirectional;
        }
        if let Some(latency_ms) = update.latency_ms {
            route.latency_ms = latency_ms;
        }
        if let Some(bandwidth_mbps) = update.bandwidth_mbps {
            route.bandwidth_mbps = bandwidth_mbps;
        }
        if let Some(cost) = update.cost {
            route.cost = cost;
        }
        route.version = version;
        route.updated_at = Utc::now();
        Ok(route.clone())
    }

    pub fn delete(&self, source: NodeId, target: NodeId) -> MeshResult<Route> {
        let mut routes = self.routes.write();
        let key = resolve_key(&routes, source, target).ok_or_else(|| not_found(source, target))?;
        routes.remove(&key).ok_or_else(|| not_found(source, target))
    }

    pub fn get(&self, source: NodeId, target: NodeId) -> Option<Route> {
        let routes = self.routes.read();
        resolve_key(&routes, source, target).and_then(|key| routes.get(&key).cloned())
    }

    pub fn routes(&self) -> Vec<Route> {
        self.routes.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    pub fn clear(&self) {
        self.routes.write().clear();
    }

    /// Last-writer-wins upsert of a replicated route. Returns whether the
    /// ledger changed.
    pub fn apply_upsert(&self, route: Route) -> bool {
        let mut routes = self.routes.write();
        let key = route.key();
        if matches!(routes.get(&key), Some(existing) if existing.version >= route.version) {
            return false;
        }
        // A newer bidirectional edge supersedes an older one-way reverse edge.
        if route.bidirectional {
            let reverse = (key.1, key.0);
            if matches!(routes.get(&reverse), Some(r) if r.version < route.version) {
                routes.remove(&reverse);
            }
        }
        routes.insert(key, route);
        true
    }

    /// Replicated deletion; ignored when the local edge is newer.
    pub fn apply_removal(&self, source: NodeId, target: NodeId, version: u64) -> bool {
        let mut routes = self.routes.write();
        match routes.get(&(source, target)) {
            Some(existing) if existing.version <= version => {
                routes.remove(&(source, target));
                true
            }
            _ => false,
        }
    }

    /// Fold in a full route list from a peer snapshot.
    pub fn merge(&self, incoming: Vec<Route>) -> usize {
        incoming
            .into_iter()
            .filter(|route| self.apply_upsert(route.clone()))
            .count()
    }
}

/// Map `(source, target)` to the stored key, following a bidirectional
/// reverse edge when the forward key is absent.
fn resolve_key(
    routes: &BTreeMap<RouteKey, Route>,
    source: NodeId,
    target: NodeId,
) -> Option<RouteKey> {
    if routes.contains_key(&(source, target)) {
        return Some((source, target));
    }
    match routes.get(&(target, source)) {
        Some(route) if route.bidirectional => Some((target, source)),
        _ => None,
    }
}

fn not_found(source: NodeId, target: NodeId) -> MeshError {
    MeshError::NotFound(format!("route {source} -> {target} not found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: NodeId = NodeId(1);
    const B: NodeId = NodeId(2);
    const C: NodeId = NodeId(3);

    fn spec(source: NodeId, target: NodeId, bidirectional: bool) -> RouteSpec {
        RouteSpec {
            source_node_id: source,
            target_node_id: target,
            bidirectional,
            latency_ms: 5,
            bandwidth_mbps: 1000,
            cost: 10,
        }
    }

    #[test]
    fn test_reverse_of_bidirectional_is_conflict() {
        let ledger = TopologyLedger::new();
        ledger.add(spec(A, B, true), 1).unwrap();
        assert!(matches!(
            ledger.add(spec(B, A, false), 2),
            Err(MeshError::AlreadyExists(_))
        ));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_bidirectional_over_existing_reverse_is_conflict() {
        let ledger = TopologyLedger::new();
        ledger.add(spec(B, A, false), 1).unwrap();
        assert!(matches!(
            ledger.add(spec(A, B, true), 2),
            Err(MeshError::AlreadyExists(_))
        ));
        // One-way edges in both directions are fine.
        assert!(ledger.add(spec(A, B, false), 3).is_ok());
    }

    #[test]
    fn test_duplicate_and_self_route() {
        let ledger = TopologyLedger::new();
        ledger.add(spec(A, B, false), 1).unwrap();
        assert!(matches!(
            ledger.add(spec(A, B, false), 2),
            Err(MeshError::AlreadyExists(_))
        ));
        assert!(matches!(
            ledger.add(spec(C, C, false), 3),
            Err(MeshError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_modify_and_delete_resolve_reverse_key() {
        let ledger = TopologyLedger::new();
        ledger.add(spec(A, B, true), 1).unwrap();

        let updated = ledger
            .modify(
                B,
                A,
                RouteUpdate {
                    cost: Some(99),
                    ..Default::default()
                },
                2,
            )
            .unwrap();
        assert_eq!(updated.key(), (A, B));
        assert_eq!(updated.cost, 99);
        assert_eq!(updated.latency_ms, 5);

        let removed = ledger.delete(B, A).unwrap();
        assert_eq!(removed.key(), (A, B));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_one_way_reverse_key_is_not_found() {
        let ledger = TopologyLedger::new();
        ledger.add(spec(A, B, false), 1).unwrap();
        assert!(matches!(ledger.delete(B, A), Err(MeshError::NotFound(_))));
        assert!(matches!(
            ledger.modify(B, A, RouteUpdate::default(), 2),
            Err(MeshError::NotFound(_))
        ));
    }

    #[test]
    fn test_enable_bidirectional_with_reverse_present() {
        let ledger = TopologyLedger::new();
        ledger.add(spec(A, B, false), 1).unwrap();
        ledger.add(spec(B, A, false), 2).unwrap();
        let result = ledger.modify(
            A,
            B,
            RouteUpdate {
                bidirectional: Some(true),
                ..Default::default()
            },
            3,
        );
        assert!(matches!(result, Err(MeshError::AlreadyExists(_))));
    }

    #[test]
    fn test_replicated_updates_are_last_writer_wins() {
        let ledger = TopologyLedger::new();
        let route = ledger.add(spec(A, B, false), 5).unwrap();

        let mut stale = route.clone();
        stale.cost = 1;
        stale.version = 4;
        assert!(!ledger.apply_upsert(stale));

        let mut fresh = route.clone();
        fresh.cost = 2;
        fresh.version = 6;
        assert!(ledger.apply_upsert(fresh));
        assert_eq!(ledger.get(A, B).unwrap().cost, 2);

        assert!(!ledger.apply_removal(A, B, 5));
        assert!(ledger.apply_removal(A, B, 7));
        assert!(ledger.is_empty());
    }
}
