//! Membership State Machine: locally initiated transitions.
//!
//! ```text
//! clean -> joining -> active -> leaving -> clean
//!                       ^  |
//!                       |  v
//!                     offline      (liveness only)
//! ```
//!
//! Every transition holds the node's operation lock for its whole duration
//! and commits local state only after the remote side has confirmed. A
//! failure at any step returns the node to the state it started from.

use std::{
    collections::BTreeSet,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use tracing as log;
use tracing::instrument;

use crate::{
    api::{
        EvictNodeRequest, EvictNodeResult, ExtendMeshRequest, ExtendMeshResult, JoinMeshRequest,
        JoinMeshResult, LeaveMeshRequest, LeaveMeshResult, SeedMeshRequest, SeedMeshResult,
        UpdateMeshPolicyRequest,
    },
    connection::Direction,
    directory::{DirectoryDelta, DirectoryRecord},
    error::{MeshError, MeshResult},
    identity::{
        invite_proof, join_proof, new_challenge, reset_proof, split_host_port, verify_signature,
        NodeState,
    },
    metrics,
    node::{MeshNode, NodeInner},
    types::{MeshId, MeshRecord, MeshStatus, MeshView, NodeId, NodeStatus},
    wire::{unexpected, PeerRequest, PeerResponse, ResetOrder},
};

/// Time left before `deadline`, or `DeadlineExceeded` once it has passed.
fn remaining(deadline: Instant, what: &str) -> MeshResult<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        Err(MeshError::DeadlineExceeded(format!("{what} timed out")))
    } else {
        Ok(left)
    }
}

fn validate_address(addr: &str) -> MeshResult<()> {
    if addr.trim().is_empty() {
        return Err(MeshError::InvalidArgument(
            "target_address must not be empty".to_string(),
        ));
    }
    split_host_port(addr).map(|_| ())
}

fn validate_join_key(key: &Option<String>) -> MeshResult<()> {
    match key {
        Some(k) if k.is_empty() => Err(MeshError::InvalidArgument(
            "join_key must not be empty".to_string(),
        )),
        _ => Ok(()),
    }
}

struct Admission {
    mesh: MeshRecord,
    sponsor: NodeId,
}

impl MeshNode {
    /// SeedMesh: create a new mesh with the local node as its only member.
    #[instrument(skip(self, req), fields(node = %self.node_id(), mesh = %req.mesh_name))]
    pub async fn seed_mesh(&self, req: SeedMeshRequest) -> MeshResult<SeedMeshResult> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;
        let result = seed(inner, req);
        metrics::transition("seed", result.is_ok());
        result
    }

    /// JoinMesh: ask the node at `target_address` to admit the local node.
    #[instrument(skip(self, req), fields(node = %self.node_id(), target = %req.target_address))]
    pub async fn join_mesh(&self, req: JoinMeshRequest) -> MeshResult<JoinMeshResult> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;
        let result = join(inner, req).await;
        metrics::transition("join", result.is_ok());
        result
    }

    /// ExtendMesh: invite the clean node at `target_address` into this mesh.
    #[instrument(skip(self, req), fields(node = %self.node_id(), target = %req.target_address))]
    pub async fn extend_mesh(&self, req: ExtendMeshRequest) -> MeshResult<ExtendMeshResult> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;
        let result = extend(inner, req).await;
        metrics::transition("extend", result.is_ok());
        result
    }

    /// LeaveMesh: drain, notify peers, drop every connection and go clean.
    #[instrument(skip(self), fields(node = %self.node_id()))]
    pub async fn leave_mesh(&self, req: LeaveMeshRequest) -> MeshResult<LeaveMeshResult> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;
        let result = leave(inner, req.force).await;
        metrics::transition("leave", result.is_ok());
        result
    }

    /// EvictNode: remove another member from the roster without its
    /// cooperation.
    #[instrument(skip(self), fields(node = %self.node_id()))]
    pub async fn evict_node(&self, req: EvictNodeRequest) -> MeshResult<EvictNodeResult> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;
        let result = evict(inner, req).await;
        metrics::transition("evict", result.is_ok());
        result
    }

    /// Change the admission policy and replicate it.
    #[instrument(skip(self, req), fields(node = %self.node_id()))]
    pub async fn update_mesh_policy(&self, req: UpdateMeshPolicyRequest) -> MeshResult<MeshView> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;
        inner.require_status(&[NodeStatus::Active], "UpdateMeshPolicy")?;
        validate_join_key(&req.join_key)?;
        let version = inner.directory.tick();
        let mesh = inner.directory.commit(|s| {
            if let Some(allow_join) = req.allow_join {
                s.mesh.allow_join = allow_join;
            }
            if req.clear_join_key {
                s.mesh.join_key = None;
            } else if req.join_key.is_some() {
                s.mesh.join_key = req.join_key.clone();
            }
            s.mesh.policy_version = version;
            Ok(s.mesh.clone())
        })?;
        log::info!(
            "Mesh policy updated: allow_join={} join_key={}",
            mesh.allow_join,
            mesh.join_key.is_some()
        );
        inner.broadcast(
            DirectoryDelta::PolicyChanged {
                allow_join: mesh.allow_join,
                join_key: mesh.join_key.clone(),
                version,
            },
            &[],
        );
        inner.persist();
        Ok(mesh.view())
    }
}

fn seed(inner: &NodeInner, req: SeedMeshRequest) -> MeshResult<SeedMeshResult> {
    let mesh_name = req.mesh_name.trim();
    if mesh_name.is_empty() {
        return Err(MeshError::InvalidArgument(
            "mesh_name must not be empty".to_string(),
        ));
    }
    validate_join_key(&req.join_key)?;
    inner.require_status(&[NodeStatus::Clean], "SeedMesh")?;

    let now = Utc::now();
    let mesh_id = MeshId::new();
    let version = inner.directory.tick();
    let mesh = MeshRecord {
        mesh_id,
        mesh_name: mesh_name.to_string(),
        mesh_description: req.mesh_description,
        allow_join: req.allow_join,
        join_key: req.join_key,
        policy_version: version,
        settings: inner.identity.settings(),
        settings_version: version,
        node_count: 0,
        connection_count: 0,
        status: MeshStatus::Seeded,
        created_at: now,
        updated_at: now,
    };
    let own = inner.new_member(inner.identity.descriptor(), BTreeSet::new(), version);
    inner.directory.install(mesh, vec![own]);
    inner.topology.clear();
    inner
        .identity
        .set_state(NodeState::member(NodeStatus::Active, mesh_id));
    inner.persist();

    let mesh = inner
        .directory
        .mesh()
        .ok_or_else(|| MeshError::Internal("mesh vanished after seeding".to_string()))?;
    log::info!("Seeded mesh '{}' ({})", mesh.mesh_name, mesh.mesh_id);
    Ok(SeedMeshResult {
        node_id: inner.local_id(),
        mesh: mesh.view(),
    })
}

async fn join(inner: &Arc<NodeInner>, req: JoinMeshRequest) -> MeshResult<JoinMeshResult> {
    validate_address(&req.target_address)?;
    validate_join_key(&req.join_key)?;
    inner.require_status(&[NodeStatus::Clean], "JoinMesh")?;

    let timeout = req
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| inner.config.join_timeout());
    let deadline = Instant::now() + timeout;

    match join_handshake(inner, &req, deadline).await {
        Ok(admission) => {
            let sponsor = admission.sponsor;
            let sync_inner = inner.clone();
            let handle = inner
                .sync
                .start(async move { sync_from(&sync_inner, sponsor).await });
            log::info!(
                "Joined mesh '{}' ({}) through node {} using {}",
                admission.mesh.mesh_name,
                admission.mesh.mesh_id,
                sponsor,
                req.strategy.as_str()
            );
            Ok(JoinMeshResult {
                node_id: inner.local_id(),
                sponsor_node_id: sponsor,
                strategy: req.strategy,
                mesh: Some(admission.mesh.view()),
                sync: handle.state(),
                sync_handle: handle,
            })
        }
        Err(err) => {
            log::warn!("Join through {} failed: {}", req.target_address, err);
            inner.directory.clear();
            inner.topology.clear();
            inner.identity.set_state(NodeState::clean());
            Err(err)
        }
    }
}

async fn join_handshake(
    inner: &NodeInner,
    req: &JoinMeshRequest,
    deadline: Instant,
) -> MeshResult<Admission> {
    let what = format!("joining through {}", req.target_address);
    let local = inner.local_id();
    let mut link = inner
        .connections
        .dial(&req.target_address, remaining(deadline, &what)?)
        .await?;

    let request = PeerRequest::JoinRequest {
        candidate: inner.identity.descriptor(),
        join_key: req.join_key.clone(),
        strategy: req.strategy,
    };
    let (offered, challenge) = match link.call(request, remaining(deadline, &what)?).await? {
        PeerResponse::JoinOffer {
            mesh, challenge, ..
        } => (mesh, challenge),
        other => return Err(unexpected("join offer", &other)),
    };

    inner
        .identity
        .set_state(NodeState::member(NodeStatus::Joining, offered.mesh_id));
    log::debug!("Offered admission to mesh {}", offered.mesh_id);

    let node_settings = inner.identity.settings();
    let resolution = req.strategy.resolve(&node_settings, &offered.settings);
    let confirm = PeerRequest::JoinConfirm {
        signature: inner
            .identity
            .sign(&join_proof(offered.mesh_id, challenge.as_bytes(), local)),
        node_settings,
    };
    let (mesh, sponsor, admitted) = match link.call(confirm, remaining(deadline, &what)?).await? {
        PeerResponse::JoinCommitted {
            mesh,
            sponsor,
            admitted,
        } => (mesh, sponsor, admitted),
        other => return Err(unexpected("join commit", &other)),
    };
    if mesh.mesh_id != offered.mesh_id || admitted.node_id() != local {
        return Err(MeshError::Unavailable(
            "sponsor committed a different admission than offered".to_string(),
        ));
    }

    let sponsor_id = sponsor.node_id();
    let reservation = inner
        .connections
        .reserve(sponsor_id, link.remote_addr(), Direction::Outbound)?;
    inner.directory.install(mesh.clone(), vec![sponsor, admitted]);
    inner.identity.set_settings(resolution.node_settings);
    inner
        .identity
        .set_state(NodeState::member(NodeStatus::Active, mesh.mesh_id));
    reservation.establish(link)?;
    inner.persist();

    Ok(Admission {
        mesh: inner.directory.mesh().unwrap_or(mesh),
        sponsor: sponsor_id,
    })
}

/// Pull the full directory from `sponsor` after a join.
pub(crate) async fn sync_from(inner: &NodeInner, sponsor: NodeId) -> MeshResult<(usize, usize)> {
    let mesh_id = inner.require_mesh()?;
    let session = inner.connections.session(sponsor).ok_or_else(|| {
        MeshError::Unavailable(format!("connection to sponsor {sponsor} is gone"))
    })?;
    let snapshot = match session
        .call(PeerRequest::SyncRequest { mesh_id }, inner.config.sync_timeout())
        .await?
    {
        PeerResponse::Snapshot { snapshot } => snapshot,
        other => return Err(unexpected("snapshot", &other)),
    };
    if snapshot.mesh.mesh_id != mesh_id {
        return Err(MeshError::FailedPrecondition(
            "sponsor answered for a different mesh".to_string(),
        ));
    }
    let members = inner.directory.merge_snapshot(&snapshot, sponsor, inner.local_id());
    for route in &snapshot.routes {
        inner.directory.observe(route.version);
    }
    let routes = inner.topology.merge(snapshot.routes);
    if let Some(own) = inner.refresh_local_links() {
        inner.announce(own);
    }
    inner.persist();
    Ok((members, routes))
}

async fn extend(inner: &NodeInner, req: ExtendMeshRequest) -> MeshResult<ExtendMeshResult> {
    validate_address(&req.target_address)?;
    inner.require_status(&[NodeStatus::Active], "ExtendMesh")?;
    let timeout = req
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| inner.config.join_timeout());
    let deadline = Instant::now() + timeout;
    let what = format!("inviting {}", req.target_address);
    let local = inner.local_id();

    let mesh = inner
        .directory
        .mesh()
        .ok_or_else(|| MeshError::FailedPrecondition("node is not part of a mesh".to_string()))?;
    let inviter = inner
        .own_record()
        .ok_or_else(|| MeshError::Internal("local node missing from roster".to_string()))?;

    let mut link = inner
        .connections
        .dial(&req.target_address, remaining(deadline, &what)?)
        .await?;
    let nonce = new_challenge();
    let invite = PeerRequest::Invite {
        mesh: mesh.clone(),
        inviter,
        strategy: req.strategy,
        nonce: nonce.clone(),
    };
    let (member, node_settings, signature) =
        match link.call(invite, remaining(deadline, &what)?).await? {
            PeerResponse::InviteAccepted {
                member,
                node_settings,
                signature,
            } => (member, node_settings, signature),
            other => return Err(unexpected("invite acceptance", &other)),
        };
    let target = member.node_id;
    if target == local {
        return Err(MeshError::InvalidArgument(
            "a node cannot invite itself".to_string(),
        ));
    }
    if inner
        .directory
        .member(target)
        .is_some_and(|m| m.status == NodeStatus::Active)
    {
        return Err(MeshError::AlreadyExists(format!(
            "node {target} is already an active member"
        )));
    }
    verify_signature(
        &member.public_key,
        &invite_proof(mesh.mesh_id, nonce.as_bytes(), target),
        &signature,
    )?;

    let reservation = inner
        .connections
        .reserve(target, link.remote_addr(), Direction::Outbound)?;
    let resolution = req.strategy.resolve(&node_settings, &mesh.settings);
    let settings_changed = resolution.mesh_changed(&mesh.settings);
    let before = inner.directory.record();
    let version = inner.directory.tick();
    let admitted = inner.new_member(member, [local].into(), version);
    inner.directory.commit(|s| {
        s.upsert_member(admitted.clone());
        let mut links = s.member(local).map(|m| m.links.clone()).unwrap_or_default();
        links.insert(target);
        s.set_links(local, links, version);
        if settings_changed {
            s.mesh.settings = resolution.mesh_settings.clone();
            s.mesh.settings_version = version;
        }
        Ok(())
    })?;

    let snapshot = inner
        .snapshot()
        .ok_or_else(|| MeshError::Internal("mesh vanished during invite".to_string()))?;
    let committed = match remaining(deadline, &what) {
        Ok(left) => link
            .call(PeerRequest::InviteCommit { snapshot }, left)
            .await
            .and_then(|resp| match resp {
                PeerResponse::Ack => Ok(()),
                other => Err(unexpected("ack", &other)),
            }),
        Err(e) => Err(e),
    };
    if let Err(err) = committed {
        drop(reservation);
        link.close().await;
        roll_back_member(inner, before, target);
        // The invitee may have installed the snapshot and only the ack was
        // lost: tell it to go back to clean.
        if let Err(e) = request_reset(inner, mesh.mesh_id, target, &req.target_address).await {
            log::debug!("Reset of uncommitted invitee {} not delivered: {}", target, e);
        }
        return Err(err);
    }

    reservation.establish(link)?;
    inner.broadcast(
        DirectoryDelta::MemberUpserted {
            member: admitted.clone(),
        },
        &[target],
    );
    if let Some(own) = inner.own_record() {
        inner.announce(own);
    }
    if settings_changed {
        inner.broadcast(
            DirectoryDelta::SettingsChanged {
                settings: resolution.mesh_settings,
                version,
            },
            &[target],
        );
    }
    inner.persist();

    let mesh = inner
        .directory
        .mesh()
        .ok_or_else(|| MeshError::Internal("mesh vanished during invite".to_string()))?;
    log::info!(
        "Node {} joined mesh {} by invitation",
        target,
        mesh.mesh_id
    );
    Ok(ExtendMeshResult {
        node: inner.node_view(&admitted),
        strategy: req.strategy,
        mesh: mesh.view(),
    })
}

/// Restore the roster, settings and local links held before a membership
/// change whose final message never got through.
pub(crate) fn roll_back_member(
    inner: &NodeInner,
    before: Option<DirectoryRecord>,
    target: NodeId,
) {
    let Some(before) = before else {
        return;
    };
    let local = inner.local_id();
    let version = inner.directory.tick();
    let _ = inner.directory.commit(|s| {
        s.remove_member(target, version);
        s.mesh.settings = before.mesh.settings.clone();
        s.mesh.settings_version = before.mesh.settings_version;
        if let Some(own) = before.members.iter().find(|m| m.node_id() == local) {
            s.set_links(local, own.links.clone(), version);
        }
        Ok(())
    });
    inner.persist();
    log::warn!("Rolled back uncommitted membership of node {}", target);
}

async fn leave(inner: &NodeInner, force: bool) -> MeshResult<LeaveMeshResult> {
    let prior = inner.require_status(&[NodeStatus::Active, NodeStatus::Offline], "LeaveMesh")?;
    let mesh_id = inner.require_mesh()?;
    inner
        .identity
        .set_state(prior.with_status(NodeStatus::Leaving));

    if !force && !inner.connections.wait_drained(inner.config.leave_grace()).await {
        inner.identity.set_state(prior);
        return Err(MeshError::FailedPrecondition(format!(
            "connections did not drain within {:?}; retry or leave with force",
            inner.config.leave_grace()
        )));
    }

    let local = inner.local_id();
    let mesh_dissolved = inner.directory.members().len() <= 1;
    let sessions: Vec<_> = inner
        .connections
        .connected_peers()
        .into_iter()
        .filter_map(|peer| inner.connections.session(peer))
        .collect();
    let connections_dropped = sessions.len();
    for session in &sessions {
        inner.connections.mark_disconnecting(session.peer());
    }

    let timeout = inner.config.handshake_timeout();
    let notices = sessions.iter().map(|session| async move {
        let notice = PeerRequest::Leave {
            mesh_id,
            node_id: local,
        };
        if let Err(e) = session.call(notice, timeout).await {
            log::warn!("Leave notice to node {} failed: {}", session.peer(), e);
        }
    });
    futures::future::join_all(notices).await;

    inner.reset_local(None);
    log::info!(
        "Left mesh {} ({} connection(s) dropped{})",
        mesh_id,
        connections_dropped,
        if mesh_dissolved { ", mesh dissolved" } else { "" }
    );
    Ok(LeaveMeshResult {
        mesh_id,
        connections_dropped,
        mesh_dissolved,
    })
}

async fn evict(inner: &NodeInner, req: EvictNodeRequest) -> MeshResult<EvictNodeResult> {
    inner.require_status(&[NodeStatus::Active], "EvictNode")?;
    let target = req.target_node_id;
    let local = inner.local_id();
    if target == local {
        return Err(MeshError::InvalidArgument(
            "a node cannot evict itself; use LeaveMesh".to_string(),
        ));
    }
    let record = inner
        .directory
        .member(target)
        .ok_or_else(|| MeshError::NotFound(format!("node {target} is not a mesh member")))?;
    let mesh_id = inner.require_mesh()?;

    let version = inner.directory.tick();
    let node_count = inner.directory.commit(|s| {
        s.remove_member(target, version);
        Ok(s.members.len())
    })?;
    inner.persist();
    log::info!("Evicted node {} from mesh {}", target, mesh_id);

    let target_cleaned = if req.clean_target {
        match request_reset(inner, mesh_id, target, &record.descriptor.address()).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Could not reset evicted node {}: {}", target, e);
                false
            }
        }
    } else {
        false
    };

    inner.connections.drop_connection(target);
    inner.broadcast(
        DirectoryDelta::MemberRemoved {
            node_id: target,
            version,
        },
        &[target],
    );
    if let Some(own) = inner.refresh_local_links() {
        inner.announce(own);
    }
    inner.persist();

    Ok(EvictNodeResult {
        target_node_id: target,
        target_cleaned,
        node_count,
    })
}

/// Ask a node that is no longer on the roster to return to clean, over the
/// live connection when there is one and a fresh link otherwise.
pub(crate) async fn request_reset(
    inner: &NodeInner,
    mesh_id: MeshId,
    target: NodeId,
    address: &str,
) -> MeshResult<()> {
    let nonce = new_challenge();
    let signature = inner
        .identity
        .sign(&reset_proof(mesh_id, nonce.as_bytes(), target));
    let request = PeerRequest::Reset(ResetOrder {
        mesh_id,
        requested_by: inner.local_id(),
        target,
        nonce,
        signature,
    });
    let response = match inner.connections.session(target) {
        Some(session) => {
            session
                .call(request, inner.config.handshake_timeout())
                .await?
        }
        None => {
            let timeout = inner.config.connect_timeout();
            let mut link = inner.connections.dial(address, timeout).await?;
            let response = link.call(request, timeout).await?;
            link.close().await;
            response
        }
    };
    match response {
        PeerResponse::Ack => Ok(()),
        other => Err(unexpected("ack", &other)),
    }
}
