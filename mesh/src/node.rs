//! Mesh node handle.
//!
//! [`MeshNode`] ties the identity store, connection manager, directory and
//! topology ledger together and owns the background tasks. Membership
//! transitions live in [`crate::membership`], inbound protocol handling in
//! [`crate::service`]; this module holds the shared state, the read
//! operations, connection and route management, and the helpers the other
//! two build on.

use std::{
    collections::BTreeSet,
    sync::{Arc, Weak},
};

use chrono::Utc;
use tokio::{
    sync::{Mutex, MutexGuard},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing as log;
use tracing::Instrument;

use crate::{
    api::{
        AddConnectionRequest, AddMeshRouteRequest, DeleteMeshRouteRequest, DeleteMeshRouteResult,
        DropConnectionRequest, DropConnectionResult, ModifyMeshRouteRequest, NodeStatusView,
        NodeView, RouteView, TopologyView,
    },
    config::MeshNodeConfig,
    connection::{Connection, ConnectionManager, ConnectionSettings},
    controller::{self, MeshController},
    directory::{DirectoryDelta, DirectorySnapshot, MeshDirectory},
    error::{MeshError, MeshResult},
    identity::{IdentityStore, NodeState},
    metrics,
    service::{self, MeshService},
    session::InFlightGuard,
    stores::{MembershipRecord, StateStore},
    sync::MeshSyncManager,
    topology::{Route, RouteSpec, TopologyLedger},
    transport::Transport,
    types::{MemberRecord, MeshId, MeshSettings, MeshView, NodeDescriptor, NodeId, NodeStatus},
    wire::PeerRequest,
};

/// State shared by the node handle, the inbound service and the background
/// loops.
pub(crate) struct NodeInner {
    pub(crate) config: MeshNodeConfig,
    pub(crate) identity: Arc<IdentityStore>,
    pub(crate) directory: MeshDirectory,
    pub(crate) topology: TopologyLedger,
    pub(crate) connections: Arc<ConnectionManager>,
    pub(crate) store: StateStore,
    pub(crate) sync: MeshSyncManager,
    /// Serializes membership transitions, local and inbound.
    pub(crate) op_lock: Mutex<()>,
    pub(crate) shutdown: CancellationToken,
    local_addr: String,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.connections.drop_all();
    }
}

impl NodeInner {
    pub(crate) fn local_id(&self) -> NodeId {
        self.identity.node_id()
    }

    pub(crate) fn own_record(&self) -> Option<MemberRecord> {
        self.directory.member(self.local_id())
    }

    /// Fail with `FailedPrecondition` unless the local status is one of
    /// `allowed`.
    pub(crate) fn require_status(&self, allowed: &[NodeStatus], op: &str) -> MeshResult<NodeState> {
        let state = self.identity.state();
        if allowed.contains(&state.status()) {
            Ok(state)
        } else {
            Err(MeshError::FailedPrecondition(format!(
                "{op} is not allowed while the node is {}",
                state.status()
            )))
        }
    }

    pub(crate) fn require_mesh(&self) -> MeshResult<MeshId> {
        self.identity.mesh_id().ok_or_else(|| {
            MeshError::FailedPrecondition("node is not part of a mesh".to_string())
        })
    }

    /// Take the operation lock on behalf of a peer, giving up after the
    /// configured wait so that crossing handshakes cannot deadlock.
    pub(crate) async fn lock_for_peer(&self) -> MeshResult<MutexGuard<'_, ()>> {
        tokio::time::timeout(self.config.handler_lock_timeout(), self.op_lock.lock())
            .await
            .map_err(|_| {
                MeshError::Unavailable(
                    "node is busy with another membership operation".to_string(),
                )
            })
    }

    pub(crate) fn new_member(
        &self,
        descriptor: NodeDescriptor,
        links: BTreeSet<NodeId>,
        version: u64,
    ) -> MemberRecord {
        MemberRecord {
            descriptor,
            status: NodeStatus::Active,
            links,
            version,
            joined_at: Utc::now(),
        }
    }

    /// Write membership and routes to the data directory. Storage errors are
    /// logged; the in-memory state stays authoritative.
    pub(crate) fn persist(&self) {
        metrics::set_mesh_nodes(self.directory.members().len());
        if !self.store.is_persistent() {
            return;
        }
        let state = self.identity.state();
        let record = MembershipRecord {
            state,
            settings: self.identity.settings(),
            directory: state.mesh_id().and_then(|_| self.directory.record()),
        };
        if let Err(e) = self
            .store
            .save_membership(&record)
            .and_then(|_| self.store.save_routes(&self.topology.routes()))
        {
            log::warn!("Failed to persist node state: {}", e);
        }
    }

    /// Directory snapshot with the topology attached.
    pub(crate) fn snapshot(&self) -> Option<DirectorySnapshot> {
        self.directory.snapshot().map(|mut snapshot| {
            snapshot.routes = self.topology.routes();
            snapshot
        })
    }

    /// Bring the local link set in line with the live connections to members.
    /// Returns the updated own record when it changed.
    pub(crate) fn refresh_local_links(&self) -> Option<MemberRecord> {
        let local = self.local_id();
        let own = self.own_record()?;
        let links: BTreeSet<NodeId> = self
            .connections
            .connected_peers()
            .into_iter()
            .filter(|peer| self.directory.contains(*peer))
            .collect();
        if own.links == links {
            return None;
        }
        let version = self.directory.tick();
        let changed = self
            .directory
            .commit(|s| Ok(s.set_links(local, links, version)))
            .ok()?;
        if changed {
            self.own_record()
        } else {
            None
        }
    }

    /// Change the local status in both the identity and the own roster entry.
    pub(crate) fn set_local_status(&self, status: NodeStatus) -> Option<MemberRecord> {
        let mesh_id = self.identity.mesh_id()?;
        self.identity.set_state(NodeState::member(status, mesh_id));
        let local = self.local_id();
        let version = self.directory.tick();
        match self
            .directory
            .commit(|s| Ok(s.set_member_status(local, status, version)))
        {
            Ok(true) => self.own_record(),
            _ => None,
        }
    }

    /// Change the status of a peer in the local view.
    pub(crate) fn set_peer_status(&self, peer: NodeId, status: NodeStatus) -> Option<MemberRecord> {
        if peer == self.local_id() {
            return None;
        }
        let current = self.directory.member(peer)?;
        if current.status == status {
            return None;
        }
        let version = self.directory.tick();
        match self
            .directory
            .commit(|s| Ok(s.set_member_status(peer, status, version)))
        {
            Ok(true) => self.directory.member(peer),
            _ => None,
        }
    }

    /// Send a locally originated change to every connected member.
    pub(crate) fn broadcast(&self, delta: DirectoryDelta, exclude: &[NodeId]) {
        self.relay(self.local_id(), delta, exclude);
    }

    /// Send `delta` on behalf of `origin` to connected members other than
    /// `origin` and `exclude`.
    pub(crate) fn relay(&self, origin: NodeId, delta: DirectoryDelta, exclude: &[NodeId]) {
        let Some(mesh_id) = self.identity.mesh_id() else {
            return;
        };
        let timeout = self.config.handshake_timeout();
        for peer in self.connections.connected_peers() {
            if peer == origin || exclude.contains(&peer) || !self.directory.contains(peer) {
                continue;
            }
            let Some(session) = self.connections.session(peer) else {
                continue;
            };
            let request = PeerRequest::Delta {
                mesh_id,
                origin,
                delta: delta.clone(),
            };
            let kind = delta.kind();
            tokio::spawn(async move {
                if let Err(e) = session.call(request, timeout).await {
                    log::debug!("Delivering {} to node {} failed: {}", kind, peer, e);
                }
            });
        }
    }

    pub(crate) fn announce(&self, member: MemberRecord) {
        self.broadcast(DirectoryDelta::MemberUpserted { member }, &[]);
    }

    /// Return to clean: stop syncing, clear the directory and topology, and
    /// drop every connection except `keep`. Returns the number of live
    /// connections dropped.
    pub(crate) fn reset_local(&self, keep: Option<NodeId>) -> usize {
        self.sync.cancel();
        let mut dropped = 0;
        for peer in self.connections.list().into_iter().map(|c| c.peer_node_id) {
            if Some(peer) == keep {
                self.connections.mark_disconnecting(peer);
            } else if self.connections.drop_connection(peer) {
                dropped += 1;
            }
        }
        self.directory.clear();
        self.topology.clear();
        self.identity.set_state(NodeState::clean());
        self.persist();
        dropped
    }

    fn recover_members(&self) {
        let local = self.local_id();
        let remote: Vec<NodeId> = self
            .directory
            .members()
            .into_iter()
            .filter(|m| m.node_id() != local && m.status != NodeStatus::Offline)
            .map(|m| m.node_id())
            .collect();
        if remote.is_empty() {
            return;
        }
        let version = self.directory.tick();
        let _ = self.directory.commit(|s| {
            for peer in &remote {
                s.set_member_status(*peer, NodeStatus::Offline, version);
            }
            Ok(())
        });
        log::info!(
            "Restored membership; {} remote member(s) offline until reconnected",
            remote.len()
        );
    }

    pub(crate) fn node_view(&self, member: &MemberRecord) -> NodeView {
        let d = &member.descriptor;
        let is_local = d.node_id == self.local_id();
        NodeView {
            node_id: d.node_id,
            node_name: d.node_name.clone(),
            description: d.description.clone(),
            platform: d.platform.clone(),
            version: d.version.clone(),
            ip_address: d.ip_address.clone(),
            port: d.port,
            region: d.region.clone(),
            status: member.status,
            links: member.links.clone(),
            is_local,
            connected: !is_local && self.connections.is_connected(d.node_id),
            joined_at: member.joined_at,
        }
    }

    fn route_view(&self, route: Route) -> RouteView {
        let source = self.directory.member(route.source_node_id);
        let target = self.directory.member(route.target_node_id);
        RouteView {
            source_name: source.as_ref().map(|m| m.descriptor.node_name.clone()),
            source_region: source.and_then(|m| m.descriptor.region),
            target_name: target.as_ref().map(|m| m.descriptor.node_name.clone()),
            target_region: target.and_then(|m| m.descriptor.region),
            route,
        }
    }
}

/// Handle to a running mesh node. Cloning is cheap; all clones share state.
#[derive(Clone)]
pub struct MeshNode {
    pub(crate) inner: Arc<NodeInner>,
}

impl std::fmt::Debug for MeshNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshNode")
            .field("node_id", &self.node_id())
            .field("status", &self.status())
            .field("local_addr", &self.inner.local_addr)
            .finish()
    }
}

impl MeshNode {
    /// Load or create the identity, restore persisted membership, bind the
    /// listener and start the background tasks.
    pub async fn start(
        mut config: MeshNodeConfig,
        transport: Arc<dyn Transport>,
    ) -> MeshResult<MeshNode> {
        if config.node_name.trim().is_empty() {
            return Err(MeshError::InvalidArgument(
                "node_name must not be empty".to_string(),
            ));
        }
        let store = StateStore::open(config.data_dir.clone())?;
        match store.dir() {
            Some(dir) => log::debug!("Node state persisted under {}", dir.display()),
            None => log::warn!("No data_dir configured, node state will not survive a restart"),
        }
        let listener = transport.listen(&config.listen_addr).await?;
        let local_addr = listener.local_addr();
        if config.advertise_addr.is_none() {
            config.advertise_addr = Some(local_addr.clone());
        }

        let (identity, directory) = match store.load_identity()? {
            Some(record) => {
                let (state, settings, saved) = match store.load_membership()? {
                    Some(m) => (m.state, m.settings, m.directory),
                    None => (NodeState::clean(), config.settings.clone(), None),
                };
                let identity = IdentityStore::restore(record, state, settings, &config)?;
                let directory = match saved {
                    Some(saved) if identity.mesh_id() == Some(saved.mesh.mesh_id) => {
                        MeshDirectory::from_record(saved)
                    }
                    _ => {
                        if identity.mesh_id().is_some() {
                            log::warn!("Persisted membership has no directory; starting clean");
                            identity.set_state(NodeState::clean());
                        }
                        MeshDirectory::new()
                    }
                };
                (identity, directory)
            }
            None => (IdentityStore::generate(&config)?, MeshDirectory::new()),
        };
        store.save_identity(&identity.record())?;
        let topology = if identity.mesh_id().is_some() {
            TopologyLedger::from_routes(store.load_routes()?)
        } else {
            TopologyLedger::new()
        };

        let identity = Arc::new(identity);
        let connections = ConnectionManager::new(
            identity.clone(),
            transport,
            ConnectionSettings {
                keepalive_interval: config.keepalive_interval(),
                liveness_timeout: config.liveness_timeout(),
                max_frame_bytes: config.max_frame_bytes,
            },
        );
        let events = connections.subscribe();

        let inner = Arc::new(NodeInner {
            config,
            identity,
            directory,
            topology,
            connections,
            store,
            sync: MeshSyncManager::new(),
            op_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
            local_addr,
            tasks: parking_lot::Mutex::new(Vec::new()),
        });
        inner
            .connections
            .set_handler(Arc::new(MeshService::new(Arc::downgrade(&inner))));
        inner.recover_members();
        inner.refresh_local_links();
        inner.persist();

        let node_id = inner.local_id();
        let weak: Weak<NodeInner> = Arc::downgrade(&inner);
        let accept = tokio::spawn(
            service::serve(weak.clone(), listener, inner.shutdown.clone())
                .instrument(log::info_span!("accept", node = %node_id)),
        );
        let ticker = tokio::spawn(MeshController::new(weak.clone()).event_loop(inner.shutdown.clone()));
        let watcher = tokio::spawn(
            controller::watch_connections(weak, events, inner.shutdown.clone())
                .instrument(log::info_span!("connection_events", node = %node_id)),
        );
        inner.tasks.lock().extend([accept, ticker, watcher]);

        log::info!(
            "Mesh node {} ({}) listening on {} [{}]",
            inner.identity.descriptor().node_name,
            node_id,
            inner.local_addr,
            inner.identity.status()
        );
        Ok(MeshNode { inner })
    }

    /// Stop background tasks, close every connection and release the
    /// listener. Membership is kept; a restart resumes it.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.sync.cancel();
        self.inner.connections.drop_all();
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.inner.persist();
        log::info!("Mesh node {} stopped", self.node_id());
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.local_id()
    }

    pub fn descriptor(&self) -> NodeDescriptor {
        self.inner.identity.descriptor()
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> &str {
        &self.inner.local_addr
    }

    pub fn status(&self) -> NodeStatus {
        self.inner.identity.status()
    }

    pub fn mesh_id(&self) -> Option<MeshId> {
        self.inner.identity.mesh_id()
    }

    /// The node's own configuration map, as reconciled by the last join.
    pub fn local_settings(&self) -> MeshSettings {
        self.inner.identity.settings()
    }

    pub fn config(&self) -> &MeshNodeConfig {
        &self.inner.config
    }

    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.inner.connections
    }

    /// Hold the connection to `peer` busy, which keeps a non-forced leave
    /// from draining it.
    pub fn lease_connection(&self, peer: NodeId) -> MeshResult<InFlightGuard> {
        self.inner.connections.lease(peer)
    }

    pub fn show_mesh(&self) -> MeshResult<MeshView> {
        self.inner
            .directory
            .mesh()
            .map(|m| m.view())
            .ok_or_else(|| MeshError::NotFound("node is not part of a mesh".to_string()))
    }

    pub fn list_nodes(&self) -> MeshResult<Vec<NodeView>> {
        if !self.inner.directory.is_seeded() {
            return Err(MeshError::NotFound(
                "node is not part of a mesh".to_string(),
            ));
        }
        Ok(self
            .inner
            .directory
            .members()
            .iter()
            .map(|m| self.inner.node_view(m))
            .collect())
    }

    pub fn get_node(&self, node_id: NodeId) -> MeshResult<NodeView> {
        self.inner
            .directory
            .member(node_id)
            .map(|m| self.inner.node_view(&m))
            .ok_or_else(|| MeshError::NotFound(format!("node {node_id} is not a mesh member")))
    }

    pub fn get_node_status(&self) -> NodeStatusView {
        let state = self.inner.identity.state();
        NodeStatusView {
            node_id: self.node_id(),
            node_name: self.inner.identity.descriptor().node_name,
            status: state.status(),
            mesh_id: state.mesh_id(),
            mesh_status: self.inner.directory.status(),
            connections: self.inner.connections.connected_peers().len(),
            sync: self.inner.sync.current().map(|h| h.state()),
        }
    }

    pub fn show_topology(&self) -> MeshResult<TopologyView> {
        let mesh_id = self
            .inner
            .directory
            .mesh_id()
            .ok_or_else(|| MeshError::NotFound("node is not part of a mesh".to_string()))?;
        let routes = self
            .inner
            .topology
            .routes()
            .into_iter()
            .map(|r| self.inner.route_view(r))
            .collect();
        Ok(TopologyView { mesh_id, routes })
    }

    pub fn list_connections(&self) -> Vec<Connection> {
        self.inner.connections.list()
    }

    /// Open a connection to another member, resolved through the roster.
    #[tracing::instrument(skip(self), fields(node = %self.node_id(), peer = %req.target_node_id))]
    pub async fn add_connection(&self, req: AddConnectionRequest) -> MeshResult<Connection> {
        let inner = &self.inner;
        inner.require_status(&[NodeStatus::Active, NodeStatus::Offline], "AddConnection")?;
        if req.target_node_id == inner.local_id() {
            return Err(MeshError::InvalidArgument(
                "a node cannot connect to itself".to_string(),
            ));
        }
        let member = inner.directory.member(req.target_node_id).ok_or_else(|| {
            MeshError::NotFound(format!("node {} is not a mesh member", req.target_node_id))
        })?;
        let timeout = req
            .timeout_ms
            .map(std::time::Duration::from_millis)
            .unwrap_or_else(|| inner.config.connect_timeout());
        inner
            .connections
            .add_connection(&member.descriptor, timeout)
            .await
    }

    /// Idempotent: an unknown peer reports `dropped = false`.
    pub fn drop_connection(&self, req: DropConnectionRequest) -> DropConnectionResult {
        let dropped = self.inner.connections.drop_connection(req.peer_node_id);
        DropConnectionResult {
            peer_node_id: req.peer_node_id,
            dropped,
        }
    }

    fn require_route_members(&self, source: NodeId, target: NodeId) -> MeshResult<()> {
        self.inner.require_mesh()?;
        if source == target {
            return Err(MeshError::InvalidArgument(
                "route source and target must differ".to_string(),
            ));
        }
        for id in [source, target] {
            if !self.inner.directory.contains(id) {
                return Err(MeshError::NotFound(format!("node {id} is not a mesh member")));
            }
        }
        Ok(())
    }

    pub fn add_route(&self, req: AddMeshRouteRequest) -> MeshResult<RouteView> {
        self.require_route_members(req.source_node_id, req.target_node_id)?;
        let version = self.inner.directory.tick();
        let route = self.inner.topology.add(
            RouteSpec {
                source_node_id: req.source_node_id,
                target_node_id: req.target_node_id,
                bidirectional: req.bidirectional,
                latency_ms: req.latency_ms,
                bandwidth_mbps: req.bandwidth_mbps,
                cost: req.cost,
            },
            version,
        )?;
        log::info!(
            "Added route {} -> {} (bidirectional: {})",
            route.source_node_id,
            route.target_node_id,
            route.bidirectional
        );
        self.inner.broadcast(
            DirectoryDelta::RouteUpserted {
                route: route.clone(),
            },
            &[],
        );
        self.inner.persist();
        Ok(self.inner.route_view(route))
    }

    pub fn modify_route(&self, req: ModifyMeshRouteRequest) -> MeshResult<RouteView> {
        self.inner.require_mesh()?;
        if req.update.is_empty() {
            return Err(MeshError::InvalidArgument(
                "route update changes nothing".to_string(),
            ));
        }
        let version = self.inner.directory.tick();
        let route = self.inner.topology.modify(
            req.source_node_id,
            req.target_node_id,
            req.update,
            version,
        )?;
        self.inner.broadcast(
            DirectoryDelta::RouteUpserted {
                route: route.clone(),
            },
            &[],
        );
        self.inner.persist();
        Ok(self.inner.route_view(route))
    }

    pub fn delete_route(&self, req: DeleteMeshRouteRequest) -> MeshResult<DeleteMeshRouteResult> {
        self.inner.require_mesh()?;
        let removed = self
            .inner
            .topology
            .delete(req.source_node_id, req.target_node_id)?;
        let version = self.inner.directory.tick();
        self.inner.broadcast(
            DirectoryDelta::RouteRemoved {
                source_node_id: removed.source_node_id,
                target_node_id: removed.target_node_id,
                version,
            },
            &[],
        );
        self.inner.persist();
        Ok(DeleteMeshRouteResult {
            source_node_id: removed.source_node_id,
            target_node_id: removed.target_node_id,
        })
    }
}
