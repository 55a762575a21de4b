//! End-to-end mesh scenarios.
//!
//! Every test runs real nodes against a shared [`MemoryNetwork`]:
//! - Lifecycle: seed, join, extend, leave, evict
//! - Admission policy and join keys
//! - Connection management and draining
//! - Topology replication
//! - Liveness, restart recovery and reconnection
//! - Peer authentication and rollback of half-finished admissions

use std::time::Duration;

use super::test_utils::{
    form_mesh, init_test_logging, node_addr, start_node, start_with, test_config, wait_until,
};
use crate::{
    api::{
        AddConnectionRequest, AddMeshRouteRequest, DeleteMeshRouteRequest, DropConnectionRequest,
        EvictNodeRequest, ExtendMeshRequest, JoinMeshRequest, LeaveMeshRequest,
        ModifyMeshRouteRequest, SeedMeshRequest, UpdateMeshPolicyRequest,
    },
    error::MeshError,
    identity::{
        hello_proof, invite_proof, join_proof, new_challenge, reset_proof, verify_signature,
        IdentityStore,
    },
    strategy::JoinStrategy,
    sync::SyncState,
    topology::RouteUpdate,
    transport::{Listener, MemoryNetwork, Transport},
    types::{MeshSettings, MeshStatus, NodeStatus},
    wire::{Link, PeerRequest, PeerResponse, ResetOrder},
};

const CONVERGE: Duration = Duration::from_secs(3);

fn settings(pairs: &[(&str, &str)]) -> MeshSettings {
    pairs.iter().copied().collect()
}

/// Identity for a peer whose side of the protocol the test drives by hand.
fn stranger(index: u8) -> IdentityStore {
    IdentityStore::generate(&test_config(&format!("stranger-{index}"), &node_addr(index))).unwrap()
}

async fn dial_raw(network: &MemoryNetwork, from: &str, to: &str) -> Link {
    let raw = network.transport(from).dial(to).await.unwrap();
    Link::new(raw, 1 << 20)
}

//
// Lifecycle
//

#[tokio::test]
async fn test_seed_creates_single_node_mesh() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let node = start_node(&network, 1).await;
    assert_eq!(node.status(), NodeStatus::Clean);
    assert!(matches!(node.show_mesh(), Err(MeshError::NotFound(_))));

    let seeded = node
        .seed_mesh(SeedMeshRequest::new("edge"))
        .await
        .unwrap();
    assert_eq!(seeded.node_id, node.node_id());
    assert_eq!(seeded.mesh.mesh_name, "edge");
    assert_eq!(seeded.mesh.node_count, 1);
    assert_eq!(seeded.mesh.status, MeshStatus::Seeded);
    assert_eq!(node.status(), NodeStatus::Active);
    assert_eq!(node.mesh_id(), Some(seeded.mesh.mesh_id));

    let nodes = node.list_nodes().unwrap();
    assert_eq!(nodes.len(), 1);
    assert!(nodes[0].is_local);

    let again = node.seed_mesh(SeedMeshRequest::new("other")).await;
    assert!(matches!(again, Err(MeshError::FailedPrecondition(_))));
    assert_eq!(node.show_mesh().unwrap().mesh_name, "edge");
}

#[tokio::test]
async fn test_seed_rejects_blank_name() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let node = start_node(&network, 1).await;
    let result = node.seed_mesh(SeedMeshRequest::new("   ")).await;
    assert!(matches!(result, Err(MeshError::InvalidArgument(_))));
    assert_eq!(node.status(), NodeStatus::Clean);
}

#[tokio::test]
async fn test_join_then_leave_round_trip() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let nodes = form_mesh(&network, 2).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    assert_eq!(b.status(), NodeStatus::Active);
    assert_eq!(b.mesh_id(), a.mesh_id());
    let mesh = a.show_mesh().unwrap();
    assert_eq!(mesh.node_count, 2);
    assert_eq!(mesh.status, MeshStatus::Active);
    assert!(a.get_node(b.node_id()).unwrap().connected);
    {
        let a = a.clone();
        wait_until(CONVERGE, "link recorded on both sides", move || {
            a.show_mesh().map(|m| m.connection_count).unwrap_or(0) == 1
        })
        .await;
    }

    let left = b.leave_mesh(LeaveMeshRequest::default()).await.unwrap();
    assert_eq!(left.mesh_id, mesh.mesh_id);
    assert_eq!(left.connections_dropped, 1);
    assert!(!left.mesh_dissolved);
    assert_eq!(b.status(), NodeStatus::Clean);
    assert!(b.mesh_id().is_none());
    assert!(b.list_connections().is_empty());

    let a2 = a.clone();
    wait_until(CONVERGE, "sponsor forgets the leaver", move || {
        a2.list_nodes().map(|n| n.len()).unwrap_or(0) == 1
    })
    .await;
    assert!(matches!(
        a.get_node(b.node_id()),
        Err(MeshError::NotFound(_))
    ));
    let a3 = a.clone();
    wait_until(CONVERGE, "connection released", move || {
        a3.list_connections().is_empty()
    })
    .await;
    assert_eq!(a.status(), NodeStatus::Active);
}

#[tokio::test]
async fn test_last_member_leaving_dissolves_mesh() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let node = start_node(&network, 1).await;
    node.seed_mesh(SeedMeshRequest::new("solo")).await.unwrap();
    let left = node.leave_mesh(LeaveMeshRequest::default()).await.unwrap();
    assert!(left.mesh_dissolved);
    assert_eq!(left.connections_dropped, 0);
    assert_eq!(node.status(), NodeStatus::Clean);

    let again = node.leave_mesh(LeaveMeshRequest::default()).await;
    assert!(matches!(again, Err(MeshError::FailedPrecondition(_))));
}

#[tokio::test]
async fn test_join_validation_happens_before_dialing() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let node = start_node(&network, 1).await;

    for bad in ["", "no-port", "10.0.0.2:notaport", ":7400"] {
        let result = node.join_mesh(JoinMeshRequest::new(bad)).await;
        assert!(
            matches!(result, Err(MeshError::InvalidArgument(_))),
            "{bad:?} gave {result:?}"
        );
    }
    let mut req = JoinMeshRequest::new(node_addr(2));
    req.join_key = Some(String::new());
    assert!(matches!(
        node.join_mesh(req).await,
        Err(MeshError::InvalidArgument(_))
    ));
    assert_eq!(node.status(), NodeStatus::Clean);
}

#[tokio::test]
async fn test_join_while_member_is_rejected() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let nodes = form_mesh(&network, 2).await;
    let result = nodes[1]
        .join_mesh(JoinMeshRequest::new(nodes[0].local_addr()))
        .await;
    assert!(matches!(result, Err(MeshError::FailedPrecondition(_))));
    assert_eq!(nodes[1].status(), NodeStatus::Active);
}

#[tokio::test]
async fn test_join_unreachable_target_is_unavailable() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let node = start_node(&network, 1).await;
    let result = node.join_mesh(JoinMeshRequest::new(node_addr(8))).await;
    assert!(matches!(result, Err(MeshError::Unavailable(_))));
    assert_eq!(node.status(), NodeStatus::Clean);
    assert!(node.list_connections().is_empty());
}

#[tokio::test]
async fn test_join_silent_target_hits_deadline() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let node = start_node(&network, 1).await;
    network.set_blackhole(&node_addr(9));

    let mut req = JoinMeshRequest::new(node_addr(9));
    req.timeout_ms = Some(200);
    let started = std::time::Instant::now();
    let result = node.join_mesh(req).await;
    assert!(matches!(result, Err(MeshError::DeadlineExceeded(_))));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(node.status(), NodeStatus::Clean);
    assert!(node.mesh_id().is_none());
}

//
// Admission policy
//

#[tokio::test]
async fn test_closed_mesh_rejects_join_without_side_effects() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let a = start_node(&network, 1).await;
    let b = start_node(&network, 2).await;
    let mut seed = SeedMeshRequest::new("closed");
    seed.allow_join = false;
    a.seed_mesh(seed).await.unwrap();

    let result = b.join_mesh(JoinMeshRequest::new(a.local_addr())).await;
    assert!(matches!(result, Err(MeshError::PermissionDenied(_))));
    assert_eq!(b.status(), NodeStatus::Clean);
    assert!(b.list_connections().is_empty());
    assert!(a.list_connections().is_empty());
    assert_eq!(a.show_mesh().unwrap().node_count, 1);
}

#[tokio::test]
async fn test_join_key_is_enforced() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let a = start_node(&network, 1).await;
    let b = start_node(&network, 2).await;
    let mut seed = SeedMeshRequest::new("keyed");
    seed.join_key = Some("s3cret".to_string());
    let seeded = a.seed_mesh(seed).await.unwrap();
    assert!(seeded.mesh.has_join_key);

    let missing = b.join_mesh(JoinMeshRequest::new(a.local_addr())).await;
    assert!(matches!(missing, Err(MeshError::PermissionDenied(_))));

    let mut wrong = JoinMeshRequest::new(a.local_addr());
    wrong.join_key = Some("guess".to_string());
    assert!(matches!(
        b.join_mesh(wrong).await,
        Err(MeshError::PermissionDenied(_))
    ));
    assert_eq!(b.status(), NodeStatus::Clean);

    let mut right = JoinMeshRequest::new(a.local_addr());
    right.join_key = Some("s3cret".to_string());
    let joined = b.join_mesh(right).await.unwrap();
    assert_eq!(joined.sponsor_node_id, a.node_id());
    assert_eq!(b.status(), NodeStatus::Active);
}

#[tokio::test]
async fn test_policy_change_replicates_to_other_sponsors() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let nodes = form_mesh(&network, 2).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let c = start_node(&network, 3).await;

    let view = a
        .update_mesh_policy(UpdateMeshPolicyRequest {
            allow_join: Some(false),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(!view.allow_join);

    let b2 = b.clone();
    wait_until(CONVERGE, "policy reaches the other member", move || {
        b2.show_mesh().map(|m| !m.allow_join).unwrap_or(false)
    })
    .await;
    let result = c.join_mesh(JoinMeshRequest::new(b.local_addr())).await;
    assert!(matches!(result, Err(MeshError::PermissionDenied(_))));
    assert_eq!(c.status(), NodeStatus::Clean);
}

//
// Join strategies and synchronization
//

#[tokio::test]
async fn test_merge_strategy_unions_settings() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let mut config_a = test_config("node-1", &node_addr(1));
    config_a.settings = settings(&[("region", "us"), ("retention", "7d")]);
    let a = start_with(&network, config_a).await;
    let mut config_b = test_config("node-2", &node_addr(2));
    config_b.settings = settings(&[("retention", "30d"), ("tier", "gold")]);
    let b = start_with(&network, config_b).await;

    a.seed_mesh(SeedMeshRequest::new("merge")).await.unwrap();
    let mut req = JoinMeshRequest::new(a.local_addr());
    req.strategy = JoinStrategy::Merge;
    b.join_mesh(req).await.unwrap();

    let expected = settings(&[("region", "us"), ("retention", "7d"), ("tier", "gold")]);
    assert_eq!(b.local_settings(), expected);
    assert_eq!(a.show_mesh().unwrap().settings, expected);
    assert_eq!(a.local_settings(), settings(&[("region", "us"), ("retention", "7d")]));
}

#[tokio::test]
async fn test_overwrite_strategy_replaces_mesh_settings_everywhere() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let nodes = form_mesh(&network, 2).await;
    let mut config_c = test_config("node-3", &node_addr(3));
    config_c.settings = settings(&[("codec", "zstd")]);
    let c = start_with(&network, config_c).await;

    let mut req = JoinMeshRequest::new(nodes[0].local_addr());
    req.strategy = JoinStrategy::Overwrite;
    c.join_mesh(req).await.unwrap();
    assert_eq!(c.local_settings(), settings(&[("codec", "zstd")]));

    let b = nodes[1].clone();
    wait_until(CONVERGE, "settings reach the bystander", move || {
        b.show_mesh()
            .map(|m| m.settings == settings(&[("codec", "zstd")]))
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_sync_through_non_seed_sponsor_brings_routes() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let nodes = form_mesh(&network, 2).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    a.add_route(AddMeshRouteRequest {
        source_node_id: a.node_id(),
        target_node_id: b.node_id(),
        bidirectional: true,
        latency_ms: 12,
        bandwidth_mbps: 1_000,
        cost: 3,
    })
    .unwrap();
    let b2 = b.clone();
    wait_until(CONVERGE, "route replicated", move || {
        b2.show_topology().map(|t| t.routes.len()).unwrap_or(0) == 1
    })
    .await;

    let c = start_node(&network, 3).await;
    let joined = c.join_mesh(JoinMeshRequest::new(b.local_addr())).await.unwrap();
    assert_eq!(joined.sponsor_node_id, b.node_id());
    let synced = joined.sync_handle.wait_timeout(Duration::from_secs(2)).await;
    assert!(matches!(synced, SyncState::Complete { .. }), "{synced:?}");

    let members = c.list_nodes().unwrap();
    assert_eq!(members.len(), 3);
    assert!(members.iter().any(|m| m.node_id == a.node_id()));
    let topology = c.show_topology().unwrap();
    assert_eq!(topology.routes.len(), 1);
    assert_eq!(topology.routes[0].route.latency_ms, 12);
    assert_eq!(topology.routes[0].source_name.as_deref(), Some("node-1"));

    let a2 = a.clone();
    let c_id = c.node_id();
    wait_until(CONVERGE, "seed learns the new member", move || {
        a2.get_node(c_id).is_ok()
    })
    .await;
}

//
// Extend
//

#[tokio::test]
async fn test_extend_invites_clean_node() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let nodes = form_mesh(&network, 2).await;
    let c = start_node(&network, 3).await;

    let extended = nodes[0]
        .extend_mesh(ExtendMeshRequest {
            target_address: c.local_addr().to_string(),
            strategy: JoinStrategy::Inherit,
            timeout_ms: None,
        })
        .await
        .unwrap();
    assert_eq!(extended.node.node_id, c.node_id());
    assert_eq!(extended.mesh.node_count, 3);
    assert_eq!(c.status(), NodeStatus::Active);
    assert_eq!(c.mesh_id(), nodes[0].mesh_id());
    assert_eq!(c.list_nodes().unwrap().len(), 3);

    let b = nodes[1].clone();
    let c_id = c.node_id();
    wait_until(CONVERGE, "bystander learns the invitee", move || {
        b.get_node(c_id).is_ok()
    })
    .await;
}

#[tokio::test]
async fn test_extend_respects_invitee_state() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let nodes = form_mesh(&network, 2).await;

    let busy = nodes[0]
        .extend_mesh(ExtendMeshRequest {
            target_address: nodes[1].local_addr().to_string(),
            strategy: JoinStrategy::Inherit,
            timeout_ms: None,
        })
        .await;
    assert!(matches!(busy, Err(MeshError::FailedPrecondition(_))));

    let mut config = test_config("node-3", &node_addr(3));
    config.accept_invites = false;
    let c = start_with(&network, config).await;
    let refused = nodes[0]
        .extend_mesh(ExtendMeshRequest {
            target_address: c.local_addr().to_string(),
            strategy: JoinStrategy::Inherit,
            timeout_ms: None,
        })
        .await;
    assert!(matches!(refused, Err(MeshError::PermissionDenied(_))));
    assert_eq!(c.status(), NodeStatus::Clean);
    assert_eq!(nodes[0].show_mesh().unwrap().node_count, 2);
}

//
// Connections
//

#[tokio::test]
async fn test_add_connection_is_exclusive_per_peer() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let nodes = form_mesh(&network, 3).await;
    let (b, c) = (&nodes[1], &nodes[2]);

    let conn = b
        .add_connection(AddConnectionRequest {
            target_node_id: c.node_id(),
            timeout_ms: None,
        })
        .await
        .unwrap();
    assert_eq!(conn.peer_node_id, c.node_id());

    let again = b
        .add_connection(AddConnectionRequest {
            target_node_id: c.node_id(),
            timeout_ms: None,
        })
        .await;
    assert!(matches!(again, Err(MeshError::AlreadyExists(_))));
    let reverse = c
        .add_connection(AddConnectionRequest {
            target_node_id: b.node_id(),
            timeout_ms: None,
        })
        .await;
    assert!(matches!(reverse, Err(MeshError::AlreadyExists(_))));

    let to_self = b
        .add_connection(AddConnectionRequest {
            target_node_id: b.node_id(),
            timeout_ms: None,
        })
        .await;
    assert!(matches!(to_self, Err(MeshError::InvalidArgument(_))));
    let stranger = b
        .add_connection(AddConnectionRequest {
            target_node_id: crate::types::NodeId(42),
            timeout_ms: None,
        })
        .await;
    assert!(matches!(stranger, Err(MeshError::NotFound(_))));
}

#[tokio::test]
async fn test_drop_connection_is_idempotent() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let nodes = form_mesh(&network, 2).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    let unknown = a.drop_connection(DropConnectionRequest {
        peer_node_id: crate::types::NodeId(42),
    });
    assert!(!unknown.dropped);

    let dropped = a.drop_connection(DropConnectionRequest {
        peer_node_id: b.node_id(),
    });
    assert!(dropped.dropped);
    assert!(!a.get_node(b.node_id()).unwrap().connected);
    let again = a.drop_connection(DropConnectionRequest {
        peer_node_id: b.node_id(),
    });
    assert!(!again.dropped);
}

#[tokio::test]
async fn test_leave_waits_for_drain_unless_forced() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let nodes = form_mesh(&network, 2).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    let lease = b.lease_connection(a.node_id()).unwrap();
    let blocked = b.leave_mesh(LeaveMeshRequest { force: false }).await;
    assert!(matches!(blocked, Err(MeshError::FailedPrecondition(_))));
    assert_eq!(b.status(), NodeStatus::Active);
    assert!(b.get_node(a.node_id()).unwrap().connected);

    let forced = b.leave_mesh(LeaveMeshRequest { force: true }).await.unwrap();
    assert_eq!(forced.connections_dropped, 1);
    assert_eq!(b.status(), NodeStatus::Clean);
    drop(lease);

    let a2 = a.clone();
    wait_until(CONVERGE, "sponsor forgets the leaver", move || {
        a2.list_nodes().map(|n| n.len()).unwrap_or(0) == 1
    })
    .await;
}

//
// Eviction
//

#[tokio::test]
async fn test_evict_reachable_node_resets_it() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let nodes = form_mesh(&network, 3).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);

    let evicted = a
        .evict_node(EvictNodeRequest {
            target_node_id: c.node_id(),
            clean_target: true,
        })
        .await
        .unwrap();
    assert!(evicted.target_cleaned);
    assert_eq!(evicted.node_count, 2);
    assert_eq!(c.status(), NodeStatus::Clean);
    assert!(c.mesh_id().is_none());

    let b2 = b.clone();
    let c_id = c.node_id();
    wait_until(CONVERGE, "bystander drops the evicted node", move || {
        b2.get_node(c_id).is_err()
    })
    .await;
    let c2 = c.clone();
    wait_until(CONVERGE, "evicted node holds no connections", move || {
        c2.list_connections().is_empty()
    })
    .await;
}

#[tokio::test]
async fn test_evict_unreachable_node_still_removes_it() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let nodes = form_mesh(&network, 2).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let b_id = b.node_id();
    b.shutdown().await;

    let a2 = a.clone();
    wait_until(CONVERGE, "member marked offline", move || {
        a2.get_node(b_id)
            .map(|n| n.status == NodeStatus::Offline)
            .unwrap_or(false)
    })
    .await;

    let evicted = a
        .evict_node(EvictNodeRequest {
            target_node_id: b_id,
            clean_target: true,
        })
        .await
        .unwrap();
    assert!(!evicted.target_cleaned);
    assert_eq!(evicted.node_count, 1);
    assert!(a.get_node(b_id).is_err());
}

#[tokio::test]
async fn test_evict_argument_checks() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let nodes = form_mesh(&network, 2).await;
    let a = &nodes[0];

    let own = a
        .evict_node(EvictNodeRequest {
            target_node_id: a.node_id(),
            clean_target: false,
        })
        .await;
    assert!(matches!(own, Err(MeshError::InvalidArgument(_))));
    let unknown = a
        .evict_node(EvictNodeRequest {
            target_node_id: crate::types::NodeId(42),
            clean_target: false,
        })
        .await;
    assert!(matches!(unknown, Err(MeshError::NotFound(_))));
    assert_eq!(a.show_mesh().unwrap().node_count, 2);
}

//
// Topology
//

#[tokio::test]
async fn test_route_lifecycle_replicates() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let nodes = form_mesh(&network, 2).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let (a_id, b_id) = (a.node_id(), b.node_id());

    let route = AddMeshRouteRequest {
        source_node_id: a_id,
        target_node_id: b_id,
        bidirectional: true,
        latency_ms: 5,
        bandwidth_mbps: 100,
        cost: 1,
    };
    a.add_route(route.clone()).unwrap();
    assert!(matches!(
        a.add_route(route.clone()),
        Err(MeshError::AlreadyExists(_))
    ));
    let reverse = AddMeshRouteRequest {
        source_node_id: b_id,
        target_node_id: a_id,
        ..route.clone()
    };
    assert!(matches!(
        a.add_route(reverse),
        Err(MeshError::AlreadyExists(_))
    ));
    let looped = AddMeshRouteRequest {
        target_node_id: a_id,
        ..route.clone()
    };
    assert!(matches!(
        a.add_route(looped),
        Err(MeshError::InvalidArgument(_))
    ));
    let stranger = AddMeshRouteRequest {
        target_node_id: crate::types::NodeId(42),
        ..route
    };
    assert!(matches!(a.add_route(stranger), Err(MeshError::NotFound(_))));

    let empty = a.modify_route(ModifyMeshRouteRequest {
        source_node_id: a_id,
        target_node_id: b_id,
        update: RouteUpdate::default(),
    });
    assert!(matches!(empty, Err(MeshError::InvalidArgument(_))));
    let modified = a
        .modify_route(ModifyMeshRouteRequest {
            source_node_id: a_id,
            target_node_id: b_id,
            update: RouteUpdate {
                cost: Some(9),
                ..Default::default()
            },
        })
        .unwrap();
    assert_eq!(modified.route.cost, 9);
    assert_eq!(modified.route.latency_ms, 5);

    let b2 = b.clone();
    wait_until(CONVERGE, "modified route replicated", move || {
        b2.show_topology()
            .map(|t| t.routes.first().map(|r| r.route.cost) == Some(9))
            .unwrap_or(false)
    })
    .await;

    let deleted = a
        .delete_route(DeleteMeshRouteRequest {
            source_node_id: a_id,
            target_node_id: b_id,
        })
        .unwrap();
    assert_eq!(deleted.source_node_id, a_id);
    assert!(matches!(
        a.delete_route(DeleteMeshRouteRequest {
            source_node_id: a_id,
            target_node_id: b_id,
        }),
        Err(MeshError::NotFound(_))
    ));
    let b3 = b.clone();
    wait_until(CONVERGE, "route removal replicated", move || {
        b3.show_topology().map(|t| t.routes.is_empty()).unwrap_or(false)
    })
    .await;
}

//
// Liveness and recovery
//

#[tokio::test]
async fn test_peer_shutdown_marks_member_offline() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let nodes = form_mesh(&network, 2).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let b_id = b.node_id();
    b.shutdown().await;

    let a2 = a.clone();
    wait_until(CONVERGE, "member marked offline", move || {
        a2.get_node(b_id)
            .map(|n| n.status == NodeStatus::Offline && !n.connected)
            .unwrap_or(false)
    })
    .await;
    // Losing a peer never removes it from the roster.
    assert_eq!(a.show_mesh().unwrap().node_count, 2);

    let a3 = a.clone();
    wait_until(CONVERGE, "isolated node reports offline", move || {
        a3.status() == NodeStatus::Offline
    })
    .await;
    assert_eq!(a.get_node_status().status, NodeStatus::Offline);
}

#[tokio::test]
async fn test_restart_restores_membership_and_reconnects() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let config = |index: u8, dir: &tempfile::TempDir| {
        let mut config = test_config(&format!("node-{index}"), &node_addr(index));
        config.data_dir = Some(dir.path().to_path_buf());
        config.reconnect.enabled = true;
        config
    };
    let a = start_with(&network, config(1, &dir_a)).await;
    let b = start_with(&network, config(2, &dir_b)).await;
    a.seed_mesh(SeedMeshRequest::new("durable")).await.unwrap();
    b.join_mesh(JoinMeshRequest::new(a.local_addr())).await.unwrap();
    a.add_route(AddMeshRouteRequest {
        source_node_id: a.node_id(),
        target_node_id: b.node_id(),
        bidirectional: false,
        latency_ms: 1,
        bandwidth_mbps: 10,
        cost: 1,
    })
    .unwrap();
    let b_id = b.node_id();
    let mesh_id = a.mesh_id();
    let b_check = b.clone();
    wait_until(CONVERGE, "route replicated", move || {
        b_check.show_topology().map(|t| t.routes.len()).unwrap_or(0) == 1
    })
    .await;

    b.shutdown().await;
    drop(b);
    let b = start_with(&network, config(2, &dir_b)).await;
    assert_eq!(b.node_id(), b_id);
    assert_eq!(b.mesh_id(), mesh_id);
    assert!(b.status().is_member());
    assert_eq!(b.show_topology().unwrap().routes.len(), 1);

    let (a2, b2) = (a.clone(), b.clone());
    let a_id = a.node_id();
    wait_until(Duration::from_secs(5), "members reconnect", move || {
        let a_sees_b = a2
            .get_node(b_id)
            .map(|n| n.status == NodeStatus::Active && n.connected)
            .unwrap_or(false);
        let b_sees_a = b2
            .get_node(a_id)
            .map(|n| n.status == NodeStatus::Active && n.connected)
            .unwrap_or(false);
        a_sees_b && b_sees_a && a2.status() == NodeStatus::Active && b2.status() == NodeStatus::Active
    })
    .await;
}

#[tokio::test]
async fn test_node_status_reports_sync_progress() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let nodes = form_mesh(&network, 2).await;
    let status = nodes[1].get_node_status();
    assert_eq!(status.status, NodeStatus::Active);
    assert_eq!(status.mesh_id, nodes[0].mesh_id());
    assert_eq!(status.connections, 1);
    assert!(matches!(status.sync, Some(SyncState::Complete { .. })));

    let seed_status = nodes[0].get_node_status();
    assert!(seed_status.sync.is_none());
    assert_eq!(seed_status.mesh_status, MeshStatus::Active);
}

#[tokio::test]
async fn test_evicted_node_stays_out_after_restart() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let config = |index: u8, dir: &tempfile::TempDir| {
        let mut config = test_config(&format!("node-{index}"), &node_addr(index));
        config.data_dir = Some(dir.path().to_path_buf());
        config.reconnect.enabled = true;
        config
    };
    let a = start_with(&network, config(1, &dir_a)).await;
    let b = start_with(&network, config(2, &dir_b)).await;
    a.seed_mesh(SeedMeshRequest::new("durable")).await.unwrap();
    b.join_mesh(JoinMeshRequest::new(a.local_addr())).await.unwrap();
    let b_id = b.node_id();
    b.shutdown().await;
    drop(b);

    let a2 = a.clone();
    wait_until(CONVERGE, "member marked offline", move || {
        a2.get_node(b_id)
            .map(|n| n.status == NodeStatus::Offline)
            .unwrap_or(false)
    })
    .await;
    let evicted = a
        .evict_node(EvictNodeRequest {
            target_node_id: b_id,
            clean_target: true,
        })
        .await
        .unwrap();
    assert!(!evicted.target_cleaned);

    // The restarted node still believes it is a member and keeps dialing.
    let b = start_with(&network, config(2, &dir_b)).await;
    assert_eq!(b.node_id(), b_id);
    assert!(b.status().is_member());
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(a.show_mesh().unwrap().node_count, 1);
    assert!(matches!(a.get_node(b_id), Err(MeshError::NotFound(_))));
    assert!(a.list_connections().is_empty());
}

//
// Authentication
//

#[tokio::test]
async fn test_hello_from_non_member_is_refused() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let nodes = form_mesh(&network, 2).await;
    let a = &nodes[0];
    let outsider = stranger(9);

    let mut link = dial_raw(&network, &node_addr(9), a.local_addr()).await;
    let hello = PeerRequest::Hello {
        node: outsider.descriptor(),
        mesh_id: a.mesh_id(),
        challenge: new_challenge(),
    };
    let refused = link.call(hello, Duration::from_secs(1)).await;
    assert!(matches!(refused, Err(MeshError::PermissionDenied(_))));
    assert_eq!(a.show_mesh().unwrap().node_count, 2);
    assert!(matches!(
        a.get_node(outsider.node_id()),
        Err(MeshError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_hello_impersonating_member_is_refused() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let nodes = form_mesh(&network, 2).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let outsider = stranger(9);

    // Present b's roster entry but sign with a key b never had.
    let mut link = dial_raw(&network, &node_addr(9), a.local_addr()).await;
    let hello = PeerRequest::Hello {
        node: b.descriptor(),
        mesh_id: a.mesh_id(),
        challenge: new_challenge(),
    };
    let challenge = match link.call(hello, Duration::from_secs(1)).await.unwrap() {
        PeerResponse::Welcome { challenge, .. } => challenge,
        other => panic!("expected welcome, got {other:?}"),
    };
    let signature = outsider.sign(&hello_proof(a.mesh_id(), challenge.as_bytes(), b.node_id()));
    let refused = link
        .call(PeerRequest::HelloConfirm { signature }, Duration::from_secs(1))
        .await;
    assert!(matches!(refused, Err(MeshError::PermissionDenied(_))));
    assert!(a.get_node(b.node_id()).unwrap().connected);
}

#[tokio::test]
async fn test_forged_reset_is_rejected() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let nodes = form_mesh(&network, 2).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let mesh_id = a.mesh_id().unwrap();
    let outsider = stranger(9);

    // Claims to come from a, but a never signed it.
    let nonce = new_challenge();
    let order = ResetOrder {
        mesh_id,
        requested_by: a.node_id(),
        target: b.node_id(),
        signature: outsider.sign(&reset_proof(mesh_id, nonce.as_bytes(), b.node_id())),
        nonce,
    };
    let mut link = dial_raw(&network, &node_addr(9), b.local_addr()).await;
    let rejected = link
        .call(PeerRequest::Reset(order), Duration::from_secs(1))
        .await;
    assert!(matches!(rejected, Err(MeshError::PermissionDenied(_))));

    assert_eq!(b.status(), NodeStatus::Active);
    assert_eq!(b.mesh_id(), Some(mesh_id));
    assert!(a.get_node(b.node_id()).unwrap().connected);
}

//
// Rollback of unfinished admissions
//

#[tokio::test]
async fn test_sponsor_rolls_back_when_joiner_vanishes() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let a = start_node(&network, 1).await;
    a.seed_mesh(SeedMeshRequest::new("test-mesh")).await.unwrap();
    let before = a.show_mesh().unwrap();
    let joiner = stranger(9);

    let mut link = dial_raw(&network, &node_addr(9), a.local_addr()).await;
    let request = PeerRequest::JoinRequest {
        candidate: joiner.descriptor(),
        join_key: None,
        strategy: JoinStrategy::default(),
    };
    let (mesh, challenge) = match link.call(request, Duration::from_secs(1)).await.unwrap() {
        PeerResponse::JoinOffer {
            mesh, challenge, ..
        } => (mesh, challenge),
        other => panic!("expected join offer, got {other:?}"),
    };
    let confirm = PeerRequest::JoinConfirm {
        signature: joiner.sign(&join_proof(
            mesh.mesh_id,
            challenge.as_bytes(),
            joiner.node_id(),
        )),
        node_settings: settings(&[("zone", "far")]),
    };
    link.send_request(confirm).await.unwrap();
    // Gone before JoinCommitted can be delivered.
    drop(link);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let after = a.show_mesh().unwrap();
    assert_eq!(after.node_count, 1);
    assert_eq!(after.settings, before.settings);
    assert!(matches!(
        a.get_node(joiner.node_id()),
        Err(MeshError::NotFound(_))
    ));
    assert!(a.list_connections().is_empty());
    assert_eq!(a.status(), NodeStatus::Active);

    // The sponsor is free to admit the next candidate.
    let b = start_node(&network, 2).await;
    b.join_mesh(JoinMeshRequest::new(a.local_addr())).await.unwrap();
    assert_eq!(a.show_mesh().unwrap().node_count, 2);
}

#[tokio::test]
async fn test_inviter_rolls_back_and_resets_silent_invitee() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let a = start_node(&network, 1).await;
    a.seed_mesh(SeedMeshRequest::new("test-mesh")).await.unwrap();
    let invitee = stranger(9);
    let invitee_id = invitee.node_id();
    let addr = node_addr(9);
    let mut listener = network.transport(addr.as_str()).listen(&addr).await.unwrap();

    // Accepts the invitation, takes the snapshot and never acks it.
    let fake = tokio::spawn(async move {
        let mut link = Link::new(listener.accept().await.unwrap(), 1 << 20);
        let (mesh, nonce) = match link.recv_request(Duration::from_secs(1)).await.unwrap() {
            PeerRequest::Invite { mesh, nonce, .. } => (mesh, nonce),
            other => panic!("expected invite, got {}", other.name()),
        };
        let accepted = PeerResponse::InviteAccepted {
            member: invitee.descriptor(),
            node_settings: MeshSettings::default(),
            signature: invitee.sign(&invite_proof(mesh.mesh_id, nonce.as_bytes(), invitee_id)),
        };
        link.send_response(accepted).await.unwrap();
        let commit = link.recv_request(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(commit, PeerRequest::InviteCommit { .. }));

        let mut second = Link::new(listener.accept().await.unwrap(), 1 << 20);
        let order = match second.recv_request(Duration::from_secs(2)).await.unwrap() {
            PeerRequest::Reset(order) => order,
            other => panic!("expected reset, got {}", other.name()),
        };
        second.send_response(PeerResponse::Ack).await.unwrap();
        drop(link);
        order
    });

    let extended = a
        .extend_mesh(ExtendMeshRequest {
            target_address: addr.clone(),
            strategy: JoinStrategy::default(),
            timeout_ms: Some(800),
        })
        .await;
    assert!(matches!(extended, Err(MeshError::DeadlineExceeded(_))));

    let order = fake.await.unwrap();
    assert_eq!(order.target, invitee_id);
    assert_eq!(order.requested_by, a.node_id());
    assert_eq!(Some(order.mesh_id), a.mesh_id());
    verify_signature(
        &a.descriptor().public_key,
        &reset_proof(order.mesh_id, order.nonce.as_bytes(), order.target),
        &order.signature,
    )
    .unwrap();

    assert_eq!(a.show_mesh().unwrap().node_count, 1);
    assert!(matches!(
        a.get_node(invitee_id),
        Err(MeshError::NotFound(_))
    ));
    assert!(a.list_connections().is_empty());
}
