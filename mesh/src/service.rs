//! Inbound side of the peer protocol.
//!
//! The accept loop reads the first frame of every new link and dispatches on
//! it: `Hello` registers a plain connection, `JoinRequest` runs the sponsor
//! side of a join, `Invite` the invitee side of an extend, and `Reset` lets
//! an evicting member return this node to clean. Requests on established
//! sessions are served by [`MeshService`].

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tracing as log;
use tracing::Instrument;

use crate::{
    connection::Direction,
    directory::{DeltaOutcome, DirectoryDelta},
    error::{MeshError, MeshResult},
    identity::{invite_proof, join_proof, new_challenge, reset_proof, verify_signature, NodeState},
    membership::{request_reset, roll_back_member},
    metrics,
    node::NodeInner,
    session::{Reply, RequestHandler},
    strategy::JoinStrategy,
    transport::{Listener, RawConnection},
    types::{MemberRecord, MeshId, MeshRecord, MeshSettings, NodeDescriptor, NodeId, NodeStatus},
    wire::{Link, PeerRequest, PeerResponse, ResetOrder},
};

/// Accept links until shutdown or until the node is gone.
pub(crate) async fn serve(
    node: Weak<NodeInner>,
    mut listener: Box<dyn Listener>,
    shutdown: CancellationToken,
) {
    loop {
        let raw = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Some(raw) => raw,
                None => break,
            },
        };
        let Some(inner) = node.upgrade() else {
            break;
        };
        let span = log::debug_span!("inbound", remote = %raw.remote_addr);
        tokio::spawn(handle_link(inner, raw).instrument(span));
    }
    log::debug!("Listener on {} closed", listener.local_addr());
}

async fn handle_link(inner: Arc<NodeInner>, raw: RawConnection) {
    let mut link = Link::new(raw, inner.connections.max_frame_bytes());
    let first = match link.recv_request(inner.config.handshake_timeout()).await {
        Ok(request) => request,
        Err(e) => {
            log::debug!("Dropping link from {}: {}", link.remote_addr(), e);
            return;
        }
    };
    let kind = first.name();
    let outcome = match first {
        PeerRequest::Hello {
            node,
            mesh_id,
            challenge,
        } => accept_hello(&inner, link, node, mesh_id, challenge).await,
        PeerRequest::JoinRequest {
            candidate,
            join_key,
            strategy,
        } => sponsor_join(&inner, link, candidate, join_key, strategy).await,
        PeerRequest::Invite {
            mesh,
            inviter,
            strategy,
            nonce,
        } => accept_invite(&inner, link, mesh, inviter, strategy, nonce).await,
        PeerRequest::Reset(order) => reset_on_link(&inner, link, order).await,
        other => {
            let err = MeshError::InvalidArgument(format!("{} cannot open a link", other.name()));
            link.reject(err).await
        }
    };
    if let Err(e) = outcome {
        log::debug!("Inbound {} rejected: {}", kind, e);
    }
}

fn check_mesh(inner: &NodeInner, mesh_id: MeshId) -> MeshResult<()> {
    if inner.identity.mesh_id() == Some(mesh_id) {
        Ok(())
    } else {
        Err(MeshError::FailedPrecondition(format!(
            "node is not a member of mesh {mesh_id}"
        )))
    }
}

/// Plain connections are only opened by nodes on the local roster, and only
/// once they prove they hold the roster's key for their id. Removed members
/// are gone from the roster and stay out.
async fn accept_hello(
    inner: &NodeInner,
    mut link: Link,
    node: NodeDescriptor,
    mesh_id: Option<MeshId>,
    challenge: String,
) -> MeshResult<()> {
    let local_mesh = inner.identity.mesh_id();
    if local_mesh.is_none() || local_mesh != mesh_id {
        let err = MeshError::PermissionDenied("peer is not a member of this mesh".to_string());
        return link.reject(err).await;
    }
    let known = match inner.directory.member(node.node_id) {
        Some(known) if known.descriptor.public_key == node.public_key => known,
        Some(_) => {
            let err = MeshError::PermissionDenied(format!(
                "node {} presented a key that does not match the roster",
                node.node_id
            ));
            return link.reject(err).await;
        }
        None => {
            let err = MeshError::PermissionDenied(format!(
                "node {} is not on the roster of this mesh",
                node.node_id
            ));
            return link.reject(err).await;
        }
    };
    inner
        .connections
        .accept(link, &known.descriptor, &challenge, inner.config.handshake_timeout())
        .await?;
    Ok(())
}

fn check_admission(
    inner: &NodeInner,
    candidate: &NodeDescriptor,
    join_key: Option<&str>,
) -> MeshResult<(MeshRecord, MemberRecord)> {
    inner.require_status(&[NodeStatus::Active], "sponsoring a join")?;
    let mesh = inner
        .directory
        .mesh()
        .ok_or_else(|| MeshError::FailedPrecondition("node is not part of a mesh".to_string()))?;
    if !mesh.allow_join {
        return Err(MeshError::PermissionDenied(format!(
            "mesh '{}' does not allow joins",
            mesh.mesh_name
        )));
    }
    if let Some(expected) = &mesh.join_key {
        let presented = join_key.unwrap_or_default();
        if !bool::from(expected.as_bytes().ct_eq(presented.as_bytes())) {
            return Err(MeshError::PermissionDenied("invalid join key".to_string()));
        }
    }
    if candidate.node_id == inner.local_id() {
        return Err(MeshError::InvalidArgument(
            "a node cannot join through itself".to_string(),
        ));
    }
    if inner
        .directory
        .member(candidate.node_id)
        .is_some_and(|m| m.status == NodeStatus::Active)
    {
        return Err(MeshError::AlreadyExists(format!(
            "node {} is already an active member",
            candidate.node_id
        )));
    }
    let sponsor = inner
        .own_record()
        .ok_or_else(|| MeshError::Internal("local node missing from roster".to_string()))?;
    Ok((mesh, sponsor))
}

/// Sponsor side of a join.
async fn sponsor_join(
    inner: &NodeInner,
    mut link: Link,
    candidate: NodeDescriptor,
    join_key: Option<String>,
    strategy: JoinStrategy,
) -> MeshResult<()> {
    let _op = match inner.lock_for_peer().await {
        Ok(guard) => guard,
        Err(e) => return link.reject(e).await,
    };
    let (mesh, sponsor) = match check_admission(inner, &candidate, join_key.as_deref()) {
        Ok(checked) => checked,
        Err(e) => return link.reject(e).await,
    };

    inner.directory.commit(|s| {
        s.begin_admission();
        Ok(())
    })?;
    let result = admit(inner, link, &candidate, strategy, &mesh, sponsor).await;
    let _ = inner.directory.commit(|s| {
        s.end_admission();
        Ok(())
    });
    metrics::transition("sponsor", result.is_ok());
    let admitted = result?;
    let target = admitted.member.node_id();

    inner.broadcast(
        DirectoryDelta::MemberUpserted {
            member: admitted.member.clone(),
        },
        &[target],
    );
    if let Some(own) = inner.own_record() {
        inner.announce(own);
    }
    if let Some((settings, version)) = admitted.settings {
        inner.broadcast(DirectoryDelta::SettingsChanged { settings, version }, &[target]);
    }
    inner.persist();
    log::info!(
        "Admitted node {} ({}) into mesh {} using {}",
        target,
        admitted.member.descriptor.node_name,
        mesh.mesh_id,
        strategy.as_str()
    );
    Ok(())
}

struct Admitted {
    member: MemberRecord,
    /// New mesh settings and their version, when the strategy changed them.
    settings: Option<(MeshSettings, u64)>,
}

/// Offer, verify the signed challenge, commit the candidate, and keep the
/// link as the connection to the new member.
async fn admit(
    inner: &NodeInner,
    mut link: Link,
    candidate: &NodeDescriptor,
    strategy: JoinStrategy,
    mesh: &MeshRecord,
    sponsor: MemberRecord,
) -> MeshResult<Admitted> {
    let local = inner.local_id();
    let challenge = new_challenge();
    link.send_response(PeerResponse::JoinOffer {
        mesh: mesh.clone(),
        sponsor,
        challenge: challenge.clone(),
    })
    .await?;

    let (signature, node_settings) = match link
        .recv_request(inner.config.handshake_timeout())
        .await?
    {
        PeerRequest::JoinConfirm {
            signature,
            node_settings,
        } => (signature, node_settings),
        other => {
            let err = MeshError::InvalidArgument(format!(
                "expected join_confirm, got {}",
                other.name()
            ));
            return link.reject(err).await;
        }
    };
    if let Err(e) = verify_signature(
        &candidate.public_key,
        &join_proof(mesh.mesh_id, challenge.as_bytes(), candidate.node_id),
        &signature,
    ) {
        return link.reject(e).await;
    }
    let reservation =
        match inner
            .connections
            .reserve(candidate.node_id, link.remote_addr(), Direction::Inbound)
        {
            Ok(reservation) => reservation,
            Err(e) => return link.reject(e).await,
        };

    let resolution = strategy.resolve(&node_settings, &mesh.settings);
    let settings_changed = resolution.mesh_changed(&mesh.settings);
    let before = inner.directory.record();
    let version = inner.directory.tick();
    let member = inner.new_member(candidate.clone(), [local].into(), version);
    let (committed, own) = inner.directory.commit(|s| {
        s.upsert_member(member.clone());
        let mut links = s.member(local).map(|m| m.links.clone()).unwrap_or_default();
        links.insert(candidate.node_id);
        s.set_links(local, links, version);
        if settings_changed {
            s.mesh.settings = resolution.mesh_settings.clone();
            s.mesh.settings_version = version;
        }
        let own = s
            .member(local)
            .cloned()
            .ok_or_else(|| MeshError::Internal("local node missing from roster".to_string()))?;
        Ok((s.mesh.clone(), own))
    })?;

    let reply = PeerResponse::JoinCommitted {
        mesh: committed,
        sponsor: own,
        admitted: member.clone(),
    };
    if let Err(e) = link.send_response(reply).await {
        roll_back_member(inner, before, candidate.node_id);
        return Err(e);
    }
    if let Err(e) = reservation.establish(link) {
        roll_back_member(inner, before, candidate.node_id);
        // JoinCommitted is already out: the candidate may think it joined.
        let address = candidate.address();
        if let Err(err) = request_reset(inner, mesh.mesh_id, candidate.node_id, &address).await {
            log::debug!("Reset of uncommitted node {} not delivered: {}", candidate.node_id, err);
        }
        return Err(e);
    }

    Ok(Admitted {
        member,
        settings: settings_changed.then_some((resolution.mesh_settings, version)),
    })
}

/// Invitee side of an extend.
async fn accept_invite(
    inner: &NodeInner,
    mut link: Link,
    mesh: MeshRecord,
    inviter: MemberRecord,
    strategy: JoinStrategy,
    nonce: String,
) -> MeshResult<()> {
    let _op = match inner.lock_for_peer().await {
        Ok(guard) => guard,
        Err(e) => return link.reject(e).await,
    };
    if !inner.config.accept_invites {
        let err = MeshError::PermissionDenied("node does not accept invitations".to_string());
        return link.reject(err).await;
    }
    if let Err(e) = inner.require_status(&[NodeStatus::Clean], "accepting an invitation") {
        return link.reject(e).await;
    }
    if inviter.node_id() == inner.local_id() {
        let err = MeshError::InvalidArgument("a node cannot invite itself".to_string());
        return link.reject(err).await;
    }

    inner
        .identity
        .set_state(NodeState::member(NodeStatus::Joining, mesh.mesh_id));
    match join_by_invite(inner, link, &mesh, &inviter, strategy, &nonce).await {
        Ok(()) => {
            inner.persist();
            log::info!(
                "Joined mesh '{}' ({}) on invitation from node {}",
                mesh.mesh_name,
                mesh.mesh_id,
                inviter.node_id()
            );
            metrics::transition("invited", true);
            Ok(())
        }
        Err(e) => {
            inner.directory.clear();
            inner.topology.clear();
            inner.identity.set_state(NodeState::clean());
            metrics::transition("invited", false);
            Err(e)
        }
    }
}

async fn join_by_invite(
    inner: &NodeInner,
    mut link: Link,
    mesh: &MeshRecord,
    inviter: &MemberRecord,
    strategy: JoinStrategy,
    nonce: &str,
) -> MeshResult<()> {
    let local = inner.local_id();
    let node_settings = inner.identity.settings();
    let resolution = strategy.resolve(&node_settings, &mesh.settings);
    let signature = inner
        .identity
        .sign(&invite_proof(mesh.mesh_id, nonce.as_bytes(), local));
    link.send_response(PeerResponse::InviteAccepted {
        member: inner.identity.descriptor(),
        node_settings,
        signature,
    })
    .await?;

    let snapshot = match link
        .recv_request(inner.config.handshake_timeout())
        .await?
    {
        PeerRequest::InviteCommit { snapshot } => snapshot,
        other => {
            let err = MeshError::InvalidArgument(format!(
                "expected invite_commit, got {}",
                other.name()
            ));
            return link.reject(err).await;
        }
    };
    if snapshot.mesh.mesh_id != mesh.mesh_id || !snapshot.members.iter().any(|m| m.node_id() == local)
    {
        let err = MeshError::FailedPrecondition(
            "invitation commit does not include this node".to_string(),
        );
        return link.reject(err).await;
    }
    let reservation =
        match inner
            .connections
            .reserve(inviter.node_id(), link.remote_addr(), Direction::Inbound)
        {
            Ok(reservation) => reservation,
            Err(e) => return link.reject(e).await,
        };

    inner
        .directory
        .install(snapshot.mesh.clone(), snapshot.members.clone());
    inner.topology.clear();
    for route in &snapshot.routes {
        inner.directory.observe(route.version);
    }
    inner.topology.merge(snapshot.routes);
    inner.identity.set_settings(resolution.node_settings);
    inner
        .identity
        .set_state(NodeState::member(NodeStatus::Active, mesh.mesh_id));
    link.send_response(PeerResponse::Ack).await?;
    reservation.establish(link)?;
    Ok(())
}

/// A `Reset` on a fresh link: the evicting member could not reuse a live
/// connection.
async fn reset_on_link(inner: &NodeInner, mut link: Link, order: ResetOrder) -> MeshResult<()> {
    let _op = match inner.lock_for_peer().await {
        Ok(guard) => guard,
        Err(e) => return link.reject(e).await,
    };
    if let Err(e) = check_reset(inner, &order) {
        return link.reject(e).await;
    }
    let dropped = inner.reset_local(None);
    log::info!(
        "Reset to clean at the request of node {} ({} connection(s) dropped)",
        order.requested_by,
        dropped
    );
    let _ = link.send_response(PeerResponse::Ack).await;
    link.close().await;
    Ok(())
}

/// A reset must name this node and carry a signature from a current member.
fn check_reset(inner: &NodeInner, order: &ResetOrder) -> MeshResult<()> {
    check_mesh(inner, order.mesh_id)?;
    if order.target != inner.local_id() {
        return Err(MeshError::PermissionDenied(format!(
            "reset is addressed to node {}",
            order.target
        )));
    }
    let requester = inner.directory.member(order.requested_by).ok_or_else(|| {
        MeshError::PermissionDenied(format!(
            "node {} is not a member of this mesh",
            order.requested_by
        ))
    })?;
    verify_signature(
        &requester.descriptor.public_key,
        &reset_proof(order.mesh_id, order.nonce.as_bytes(), order.target),
        &order.signature,
    )
}

/// Serves requests arriving on established sessions.
pub(crate) struct MeshService {
    node: Weak<NodeInner>,
}

impl MeshService {
    pub(crate) fn new(node: Weak<NodeInner>) -> Self {
        Self { node }
    }
}

#[async_trait]
impl RequestHandler for MeshService {
    async fn handle(&self, peer: NodeId, request: PeerRequest) -> Reply {
        let Some(inner) = self.node.upgrade() else {
            return Reply::error(&MeshError::Unavailable(
                "node is shutting down".to_string(),
            ));
        };
        let result = match request {
            PeerRequest::Ping { nonce } => Ok(Reply::ok(PeerResponse::Pong { nonce })),
            PeerRequest::Delta {
                mesh_id,
                origin,
                delta,
            } => on_delta(&inner, peer, mesh_id, origin, delta).map(Reply::ok),
            PeerRequest::SyncRequest { mesh_id } => on_sync_request(&inner, mesh_id).map(Reply::ok),
            PeerRequest::Leave { mesh_id, node_id } => on_leave(&inner, peer, mesh_id, node_id).await,
            PeerRequest::Reset(order) => on_reset(&inner, peer, order).await,
            other => Err(MeshError::InvalidArgument(format!(
                "{} is not valid on an established connection",
                other.name()
            ))),
        };
        result.unwrap_or_else(|e| {
            log::debug!("Request from node {} rejected: {}", peer, e);
            Reply::error(&e)
        })
    }
}

fn on_delta(
    inner: &NodeInner,
    peer: NodeId,
    mesh_id: MeshId,
    origin: NodeId,
    delta: DirectoryDelta,
) -> MeshResult<PeerResponse> {
    check_mesh(inner, mesh_id)?;
    let local = inner.local_id();
    let changed = match &delta {
        DirectoryDelta::RouteUpserted { route } => {
            inner.directory.observe(route.version);
            inner.topology.apply_upsert(route.clone())
        }
        DirectoryDelta::RouteRemoved {
            source_node_id,
            target_node_id,
            version,
        } => {
            inner.directory.observe(*version);
            inner
                .topology
                .apply_removal(*source_node_id, *target_node_id, *version)
        }
        _ => match inner.directory.apply_delta(&delta, origin, local) {
            DeltaOutcome::Applied => true,
            DeltaOutcome::Ignored => false,
            DeltaOutcome::SelfConflict => {
                refute(inner);
                false
            }
        },
    };
    if !changed {
        return Ok(PeerResponse::Ack);
    }

    metrics::delta_applied(delta.kind());
    log::debug!("Applied {} from node {} via {}", delta.kind(), origin, peer);
    let membership_changed = matches!(
        delta,
        DirectoryDelta::MemberUpserted { .. } | DirectoryDelta::MemberRemoved { .. }
    );
    if let DirectoryDelta::MemberRemoved { node_id, .. } = &delta {
        inner.connections.drop_connection(*node_id);
    }
    inner.relay(origin, delta, &[peer]);
    if membership_changed {
        if let Some(own) = inner.refresh_local_links() {
            inner.announce(own);
        }
    }
    inner.persist();
    Ok(PeerResponse::Ack)
}

/// A peer holds a view of this node that differs from the local one:
/// re-announce the local record under a newer version.
fn refute(inner: &NodeInner) {
    let local = inner.local_id();
    let version = inner.directory.tick();
    let bumped = inner.directory.commit(|s| {
        Ok(s.member_mut(local).map(|own| {
            own.version = version;
            own.clone()
        }))
    });
    if let Ok(Some(own)) = bumped {
        log::debug!("Refuting a stale view of the local node (version {})", version);
        inner.announce(own);
    }
}

fn on_sync_request(inner: &NodeInner, mesh_id: MeshId) -> MeshResult<PeerResponse> {
    check_mesh(inner, mesh_id)?;
    let snapshot = inner
        .snapshot()
        .ok_or_else(|| MeshError::FailedPrecondition("node is not part of a mesh".to_string()))?;
    Ok(PeerResponse::Snapshot { snapshot })
}

async fn on_leave(
    inner: &NodeInner,
    peer: NodeId,
    mesh_id: MeshId,
    node_id: NodeId,
) -> MeshResult<Reply> {
    check_mesh(inner, mesh_id)?;
    if node_id != peer {
        return Err(MeshError::InvalidArgument(
            "a leave notice must come from the leaving node".to_string(),
        ));
    }
    let _op = inner.lock_for_peer().await?;
    inner.connections.mark_disconnecting(peer);
    if inner.directory.contains(node_id) {
        let version = inner.directory.tick();
        inner.directory.commit(|s| {
            s.remove_member(node_id, version);
            Ok(())
        })?;
        log::info!("Node {} left the mesh", node_id);
        inner.broadcast(
            DirectoryDelta::MemberRemoved { node_id, version },
            &[peer],
        );
        if let Some(own) = inner.refresh_local_links() {
            inner.announce(own);
        }
        inner.persist();
    }
    Ok(Reply::closing(PeerResponse::Ack))
}

async fn on_reset(inner: &NodeInner, peer: NodeId, order: ResetOrder) -> MeshResult<Reply> {
    if order.requested_by != peer {
        return Err(MeshError::InvalidArgument(
            "a reset must come from the requesting node".to_string(),
        ));
    }
    let _op = inner.lock_for_peer().await?;
    check_reset(inner, &order)?;
    let dropped = inner.reset_local(Some(peer));
    log::info!(
        "Reset to clean at the request of node {} ({} other connection(s) dropped)",
        order.requested_by,
        dropped
    );
    Ok(Reply::closing(PeerResponse::Ack))
}
