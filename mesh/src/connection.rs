//! Connection Manager
//!
//! Tracks one connection record per peer in a `DashMap`. A slot is reserved
//! before any network activity, so two concurrent attempts for the same peer
//! resolve to exactly one winner and an `AlreadyExists` for the other.
//!
//! Slot lifecycle:
//!
//! ```text
//! connecting -> connected -> disconnecting -> (removed)
//!      \             \
//!       +-> failed    +-> failed (lost)   -> (reaped after retention)
//! ```

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock, Weak,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing as log;
use tracing::Instrument;

use crate::{
    error::{MeshError, MeshResult},
    identity::{hello_proof, new_challenge, verify_signature, IdentityStore},
    metrics,
    session::{InFlightGuard, Reply, RequestHandler, Session},
    transport::Transport,
    types::{NodeDescriptor, NodeId},
    wire::{unexpected, Link, PeerRequest, PeerResponse},
};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Snapshot of one connection record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub peer_node_id: NodeId,
    pub remote_addr: String,
    pub status: ConnectionStatus,
    pub direction: Direction,
    pub is_tls: bool,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rtt_microseconds: u64,
    pub connected_at: Option<DateTime<Utc>>,
    pub in_flight: usize,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Established { peer: NodeId, direction: Direction },
    /// The connection ended without a local request.
    Lost { peer: NodeId },
    /// The connection was closed on purpose.
    Dropped { peer: NodeId },
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub keepalive_interval: Duration,
    pub liveness_timeout: Duration,
    pub max_frame_bytes: usize,
}

struct Slot {
    generation: u64,
    remote_addr: String,
    status: ConnectionStatus,
    direction: Direction,
    is_tls: bool,
    connected_at: Option<DateTime<Utc>>,
    session: Option<Arc<Session>>,
    failed_at: Option<Instant>,
    last_error: Option<String>,
}

impl Slot {
    fn snapshot(&self, peer: NodeId) -> Connection {
        let (bytes_sent, bytes_received, rtt, in_flight) = match &self.session {
            Some(s) => (
                s.counters().bytes_sent(),
                s.counters().bytes_received(),
                s.counters().rtt_micros(),
                s.in_flight(),
            ),
            None => (0, 0, 0, 0),
        };
        Connection {
            peer_node_id: peer,
            remote_addr: self.remote_addr.clone(),
            status: self.status,
            direction: self.direction,
            is_tls: self.is_tls,
            bytes_sent,
            bytes_received,
            rtt_microseconds: rtt,
            connected_at: self.connected_at,
            in_flight,
            last_error: self.last_error.clone(),
        }
    }
}

/// Handler used until the node installs its own.
struct Unready;

#[async_trait]
impl RequestHandler for Unready {
    async fn handle(&self, _peer: NodeId, _request: PeerRequest) -> Reply {
        Reply::error(&MeshError::Unavailable("node is starting".to_string()))
    }
}

pub struct ConnectionManager {
    local: Arc<IdentityStore>,
    transport: Arc<dyn Transport>,
    table: DashMap<NodeId, Slot>,
    generation: AtomicU64,
    events: broadcast::Sender<ConnectionEvent>,
    handler: OnceLock<Arc<dyn RequestHandler>>,
    settings: ConnectionSettings,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.table.len())
            .field("transport", &self.transport)
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        local: Arc<IdentityStore>,
        transport: Arc<dyn Transport>,
        settings: ConnectionSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            local,
            transport,
            table: DashMap::new(),
            generation: AtomicU64::new(0),
            events,
            handler: OnceLock::new(),
            settings,
        })
    }

    /// Install the handler serving requests on every session opened afterwards.
    pub fn set_handler(&self, handler: Arc<dyn RequestHandler>) {
        if self.handler.set(handler).is_err() {
            log::warn!("Request handler already installed; ignoring replacement");
        }
    }

    fn handler(&self) -> Arc<dyn RequestHandler> {
        self.handler
            .get()
            .cloned()
            .unwrap_or_else(|| Arc::new(Unready))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.settings.max_frame_bytes
    }

    /// Open a bare link to `addr` without registering anything.
    pub async fn dial(&self, addr: &str, timeout: Duration) -> MeshResult<Link> {
        let raw = tokio::time::timeout(timeout, self.transport.dial(addr))
            .await
            .map_err(|_| MeshError::DeadlineExceeded(format!("dialing {addr} timed out")))??;
        Ok(Link::new(raw, self.settings.max_frame_bytes))
    }

    /// Claim the slot for `peer`. Fails with `AlreadyExists` while another
    /// record for the peer is anything but failed.
    pub fn reserve(
        self: &Arc<Self>,
        peer: NodeId,
        remote_addr: &str,
        direction: Direction,
    ) -> MeshResult<Reservation> {
        if peer == self.local.node_id() {
            return Err(MeshError::InvalidArgument(
                "a node cannot connect to itself".to_string(),
            ));
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let slot = Slot {
            generation,
            remote_addr: remote_addr.to_string(),
            status: ConnectionStatus::Connecting,
            direction,
            is_tls: false,
            connected_at: None,
            session: None,
            failed_at: None,
            last_error: None,
        };
        match self.table.entry(peer) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().status != ConnectionStatus::Failed {
                    return Err(MeshError::AlreadyExists(format!(
                        "connection to node {peer} already exists ({:?})",
                        occupied.get().status
                    )));
                }
                occupied.insert(slot);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
            }
        }
        Ok(Reservation {
            manager: self.clone(),
            peer,
            generation,
            direction,
            settled: false,
        })
    }

    /// AddConnection: dial `peer`, run the `Hello` exchange and register the
    /// connection, all within `timeout`. `peer` is the roster record; the
    /// remote end must prove it holds that record's key.
    pub async fn add_connection(
        self: &Arc<Self>,
        peer: &NodeDescriptor,
        timeout: Duration,
    ) -> MeshResult<Connection> {
        let id = peer.node_id;
        let addr = peer.address();
        let reservation = self.reserve(id, &addr, Direction::Outbound)?;
        let opened = tokio::time::timeout(timeout, self.open(peer, &addr, timeout)).await;
        match opened {
            Ok(Ok(link)) => reservation.establish(link),
            Ok(Err(err)) => {
                metrics::connection_failed("connect");
                reservation.fail(&err);
                Err(err)
            }
            Err(_) => {
                let err = MeshError::DeadlineExceeded(format!(
                    "connecting to node {id} at {addr} timed out after {timeout:?}"
                ));
                metrics::connection_failed("timeout");
                reservation.fail(&err);
                Err(err)
            }
        }
    }

    async fn open(&self, peer: &NodeDescriptor, addr: &str, timeout: Duration) -> MeshResult<Link> {
        let mut link = self.dial(addr, timeout).await?;
        let mesh_id = self.local.mesh_id();
        let challenge = new_challenge();
        let hello = PeerRequest::Hello {
            node: self.local.descriptor(),
            mesh_id,
            challenge: challenge.clone(),
        };
        let (node, signature, theirs) = match link.call(hello, timeout).await? {
            PeerResponse::Welcome {
                node,
                signature,
                challenge,
            } => (node, signature, challenge),
            other => return Err(unexpected("welcome", &other)),
        };
        if node.node_id != peer.node_id {
            return Err(MeshError::Unavailable(format!(
                "{addr} answered as node {} instead of {}",
                node.node_id, peer.node_id
            )));
        }
        verify_signature(
            &peer.public_key,
            &hello_proof(mesh_id, challenge.as_bytes(), peer.node_id),
            &signature,
        )?;
        let confirm = PeerRequest::HelloConfirm {
            signature: self
                .local
                .sign(&hello_proof(mesh_id, theirs.as_bytes(), self.local.node_id())),
        };
        match link.call(confirm, timeout).await? {
            PeerResponse::Ack => Ok(link),
            other => Err(unexpected("ack", &other)),
        }
    }

    /// Acceptor side of `Hello`. Signs the dialer's `challenge`, checks the
    /// dialer's answer against `peer` (the caller's trusted record of it) and
    /// registers the link.
    pub async fn accept(
        self: &Arc<Self>,
        mut link: Link,
        peer: &NodeDescriptor,
        challenge: &str,
        timeout: Duration,
    ) -> MeshResult<Connection> {
        let mesh_id = self.local.mesh_id();
        let ours = new_challenge();
        let welcome = PeerResponse::Welcome {
            node: self.local.descriptor(),
            signature: self
                .local
                .sign(&hello_proof(mesh_id, challenge.as_bytes(), self.local.node_id())),
            challenge: ours.clone(),
        };
        link.send_response(welcome).await?;
        let signature = match link.recv_request(timeout).await? {
            PeerRequest::HelloConfirm { signature } => signature,
            other => {
                let err = MeshError::InvalidArgument(format!(
                    "expected hello_confirm, got {}",
                    other.name()
                ));
                return link.reject(err).await;
            }
        };
        let proof = hello_proof(mesh_id, ours.as_bytes(), peer.node_id);
        if let Err(e) = verify_signature(&peer.public_key, &proof, &signature) {
            return link.reject(e).await;
        }
        let reservation = match self.reserve(peer.node_id, link.remote_addr(), Direction::Inbound) {
            Ok(reservation) => reservation,
            Err(e) => return link.reject(e).await,
        };
        link.send_response(PeerResponse::Ack).await?;
        reservation.establish(link)
    }

    /// DropConnection: close and forget the record for `peer`. Returns whether
    /// a live connection was closed; an unknown peer is not an error.
    pub fn drop_connection(&self, peer: NodeId) -> bool {
        let Some((_, slot)) = self.table.remove(&peer) else {
            return false;
        };
        let live = matches!(
            slot.status,
            ConnectionStatus::Connected | ConnectionStatus::Disconnecting
        );
        if let Some(session) = &slot.session {
            session.close();
        }
        if live {
            log::info!("Dropped connection to node {}", peer);
            let _ = self.events.send(ConnectionEvent::Dropped { peer });
            self.update_gauge();
        }
        live
    }

    /// Close every connection. Returns how many live connections were closed.
    pub fn drop_all(&self) -> usize {
        let peers: Vec<NodeId> = self.table.iter().map(|e| *e.key()).collect();
        peers
            .into_iter()
            .filter(|peer| self.drop_connection(*peer))
            .count()
    }

    /// Flag a connection that the peer is about to close, so its end is
    /// reported as dropped rather than lost.
    pub fn mark_disconnecting(&self, peer: NodeId) {
        if let Some(mut slot) = self.table.get_mut(&peer) {
            if slot.status == ConnectionStatus::Connected {
                slot.status = ConnectionStatus::Disconnecting;
            }
        }
    }

    pub fn list(&self) -> Vec<Connection> {
        let mut out: Vec<Connection> = self
            .table
            .iter()
            .map(|e| e.value().snapshot(*e.key()))
            .collect();
        out.sort_by_key(|c| c.peer_node_id);
        out
    }

    pub fn get(&self, peer: NodeId) -> Option<Connection> {
        self.table.get(&peer).map(|slot| slot.snapshot(peer))
    }

    /// The session for `peer`, when connected.
    pub fn session(&self, peer: NodeId) -> Option<Arc<Session>> {
        self.table.get(&peer).and_then(|slot| match slot.status {
            ConnectionStatus::Connected => slot.session.clone(),
            _ => None,
        })
    }

    pub fn connected_peers(&self) -> BTreeSet<NodeId> {
        self.table
            .iter()
            .filter(|e| e.value().status == ConnectionStatus::Connected)
            .map(|e| *e.key())
            .collect()
    }

    pub fn is_connected(&self, peer: NodeId) -> bool {
        self.table
            .get(&peer)
            .is_some_and(|slot| slot.status == ConnectionStatus::Connected)
    }

    /// Hold the connection to `peer` busy until the guard is dropped.
    pub fn lease(&self, peer: NodeId) -> MeshResult<InFlightGuard> {
        self.session(peer)
            .map(|s| s.lease())
            .ok_or_else(|| MeshError::NotFound(format!("no live connection to node {peer}")))
    }

    /// Wait until no connection has work in flight. Returns `false` if any
    /// connection is still busy after `grace`.
    pub async fn wait_drained(&self, grace: Duration) -> bool {
        let sessions: Vec<Arc<Session>> = self
            .table
            .iter()
            .filter_map(|e| e.value().session.clone())
            .filter(|s| !s.is_closed())
            .collect();
        let waits = sessions.iter().map(|s| s.wait_idle(grace));
        futures::future::join_all(waits).await.into_iter().all(|idle| idle)
    }

    /// Forget failed records older than `retention`.
    pub fn reap_failed(&self, retention: Duration) -> usize {
        let before = self.table.len();
        self.table.retain(|peer, slot| {
            let expired = slot.status == ConnectionStatus::Failed
                && slot.failed_at.is_some_and(|at| at.elapsed() >= retention);
            if expired {
                log::debug!("Reaping failed connection record for node {}", peer);
            }
            !expired
        });
        before - self.table.len()
    }

    fn on_session_closed(&self, peer: NodeId, generation: u64) {
        let dropped = self
            .table
            .remove_if(&peer, |_, slot| {
                slot.generation == generation && slot.status == ConnectionStatus::Disconnecting
            })
            .is_some();
        if dropped {
            log::info!("Connection to node {} closed by peer after notice", peer);
            let _ = self.events.send(ConnectionEvent::Dropped { peer });
            self.update_gauge();
            return;
        }

        let mut lost = false;
        if let Some(mut slot) = self.table.get_mut(&peer) {
            if slot.generation == generation && slot.status == ConnectionStatus::Connected {
                slot.status = ConnectionStatus::Failed;
                slot.failed_at = Some(Instant::now());
                slot.last_error = Some("connection lost".to_string());
                lost = true;
            }
        }
        if lost {
            log::warn!("Lost connection to node {}", peer);
            metrics::connection_failed("lost");
            let _ = self.events.send(ConnectionEvent::Lost { peer });
            self.update_gauge();
        }
    }

    fn update_gauge(&self) {
        metrics::set_active_connections(self.connected_peers().len());
    }
}

/// A claimed slot that has not yet become a connection. Dropping it without
/// settling releases the slot.
pub struct Reservation {
    manager: Arc<ConnectionManager>,
    peer: NodeId,
    generation: u64,
    direction: Direction,
    settled: bool,
}

impl Reservation {
    pub fn peer(&self) -> NodeId {
        self.peer
    }

    /// Turn the link into a live connection with its session and keepalive.
    pub fn establish(mut self, link: Link) -> MeshResult<Connection> {
        self.settled = true;
        let manager = self.manager.clone();
        let peer = self.peer;
        let remote_addr = link.remote_addr().to_string();
        let is_tls = link.is_tls();
        let session = Session::spawn(peer, link, manager.handler());

        let snapshot = {
            let Some(mut slot) = manager.table.get_mut(&peer) else {
                session.close();
                return Err(MeshError::Unavailable(format!(
                    "connection to node {peer} was dropped during setup"
                )));
            };
            if slot.generation != self.generation {
                session.close();
                return Err(MeshError::Unavailable(format!(
                    "connection to node {peer} was replaced during setup"
                )));
            }
            slot.status = ConnectionStatus::Connected;
            slot.remote_addr = remote_addr;
            slot.is_tls = is_tls;
            slot.connected_at = Some(Utc::now());
            slot.session = Some(session.clone());
            slot.snapshot(peer)
        };

        let span = log::info_span!("keepalive", peer = %peer);
        tokio::spawn(
            keepalive(
                Arc::downgrade(&manager),
                session,
                self.generation,
                manager.settings.clone(),
            )
            .instrument(span),
        );

        log::info!(
            "Connection to node {} established ({})",
            peer,
            self.direction.as_str()
        );
        metrics::connection_established(self.direction.as_str());
        let _ = manager.events.send(ConnectionEvent::Established {
            peer,
            direction: self.direction,
        });
        manager.update_gauge();
        Ok(snapshot)
    }

    /// Record the attempt as failed; the record is kept for diagnostics.
    pub fn fail(mut self, err: &MeshError) {
        self.settled = true;
        if let Some(mut slot) = self.manager.table.get_mut(&self.peer) {
            if slot.generation == self.generation {
                slot.status = ConnectionStatus::Failed;
                slot.failed_at = Some(Instant::now());
                slot.last_error = Some(err.to_string());
            }
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            let generation = self.generation;
            self.manager
                .table
                .remove_if(&self.peer, |_, slot| slot.generation == generation);
        }
    }
}

async fn keepalive(
    manager: Weak<ConnectionManager>,
    session: Arc<Session>,
    generation: u64,
    settings: ConnectionSettings,
) {
    let peer = session.peer();
    loop {
        tokio::select! {
            _ = session.closed() => break,
            _ = tokio::time::sleep(settings.keepalive_interval) => {}
        }
        match session.ping(settings.liveness_timeout).await {
            Ok(rtt) => metrics::record_rtt(rtt),
            Err(e) => {
                if session.is_closed() {
                    break;
                }
                log::warn!("Keepalive to node {} failed: {}", peer, e);
                session.close();
                break;
            }
        }
    }
    session.closed().await;
    if let Some(manager) = manager.upgrade() {
        manager.on_session_closed(peer, generation);
    }
}
