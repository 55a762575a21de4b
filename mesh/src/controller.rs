//! Background maintenance of a running node.
//!
//! [`MeshController::event_loop`] runs every `controller_interval` and
//! reaps failed connection records, detects local isolation and reconnects
//! to offline members. [`watch_connections`] turns connection events into
//! roster updates.

use std::{collections::HashMap, sync::Weak, time::Instant};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing as log;
use tracing::instrument;

use crate::{
    connection::{ConnectionEvent, ConnectionStatus},
    directory::DirectoryDelta,
    flow_control::RetryManager,
    metrics,
    node::NodeInner,
    types::{MemberRecord, NodeId, NodeStatus},
};

pub(crate) struct MeshController {
    node: Weak<NodeInner>,
    retry_managers: HashMap<NodeId, RetryManager>,
    /// When the local node was first seen without any member connection.
    isolated_since: Option<Instant>,
}

impl MeshController {
    pub(crate) fn new(node: Weak<NodeInner>) -> Self {
        Self {
            node,
            retry_managers: HashMap::new(),
            isolated_since: None,
        }
    }

    #[instrument(skip_all, name = "controller")]
    pub(crate) async fn event_loop(mut self, shutdown: CancellationToken) {
        let interval = match self.node.upgrade() {
            Some(inner) => inner.config.controller_interval(),
            None => return,
        };
        let mut round: u64 = 0;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    log::debug!("Controller stopping after {} rounds", round);
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    round += 1;
                    let Some(inner) = self.node.upgrade() else {
                        break;
                    };
                    self.tick(&inner, round).await;
                }
            }
        }
    }

    async fn tick(&mut self, inner: &NodeInner, round: u64) {
        let reaped = inner.connections.reap_failed(inner.config.failed_retention());
        if reaped > 0 {
            log::debug!("Round {}: reaped {} failed connection record(s)", round, reaped);
        }
        if !inner.identity.status().is_member() {
            self.retry_managers.clear();
            self.isolated_since = None;
            return;
        }
        self.check_isolation(inner);
        if inner.config.reconnect.enabled {
            self.reconnect(inner).await;
        }
    }

    /// An active node that has lost every member connection for longer than
    /// `isolation_timeout` reports itself offline.
    fn check_isolation(&mut self, inner: &NodeInner) {
        let local = inner.local_id();
        let has_peers = inner.directory.members().iter().any(|m| m.node_id() != local);
        let connected = inner
            .connections
            .connected_peers()
            .into_iter()
            .any(|peer| inner.directory.contains(peer));
        if !has_peers || connected {
            self.isolated_since = None;
            return;
        }
        let since = *self.isolated_since.get_or_insert_with(Instant::now);
        if inner.identity.status() == NodeStatus::Active
            && since.elapsed() >= inner.config.isolation_timeout()
        {
            log::warn!(
                "No connection to any member for {:?}; marking local node offline",
                since.elapsed()
            );
            if inner.set_local_status(NodeStatus::Offline).is_some() {
                inner.persist();
            }
        }
    }

    /// Dial offline members with a higher node id, backing off per peer.
    async fn reconnect(&mut self, inner: &NodeInner) {
        let local = inner.local_id();
        let candidates: Vec<MemberRecord> = inner
            .directory
            .members()
            .into_iter()
            .filter(|m| m.node_id() > local && m.status == NodeStatus::Offline)
            .filter(|m| {
                inner
                    .connections
                    .get(m.node_id())
                    .map_or(true, |c| c.status == ConnectionStatus::Failed)
            })
            .collect();
        self.retry_managers
            .retain(|peer, _| candidates.iter().any(|m| m.node_id() == *peer));

        let base = inner.config.reconnect.base_delay();
        let max = inner.config.reconnect.max_delay();
        for member in candidates {
            let peer = member.node_id();
            let retry_manager = self
                .retry_managers
                .entry(peer)
                .or_insert_with(|| RetryManager::new(base, max));
            if !retry_manager.should_retry() {
                log::trace!(
                    "Skipping reconnect to node {} (backoff: {:?})",
                    peer,
                    retry_manager.next_delay()
                );
                continue;
            }
            let addr = member.descriptor.address();
            match inner
                .connections
                .add_connection(&member.descriptor, inner.config.connect_timeout())
                .await
            {
                Ok(_) => {
                    retry_manager.reset();
                    log::info!("Reconnected to node {} at {}", peer, addr);
                }
                Err(e) => {
                    retry_manager.record_attempt();
                    log::warn!(
                        "Reconnect to node {} at {} failed (attempt {}): {}. Next retry in {:?}",
                        peer,
                        addr,
                        retry_manager.attempt_count(),
                        e,
                        retry_manager.next_delay()
                    );
                }
            }
        }
    }
}

/// Follow connection events and keep the roster in line with them.
pub(crate) async fn watch_connections(
    node: Weak<NodeInner>,
    mut events: broadcast::Receiver<ConnectionEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(inner) = node.upgrade() else {
            break;
        };
        metrics::set_active_connections(inner.connections.connected_peers().len());
        if !inner.identity.status().is_member() {
            continue;
        }
        match event {
            Ok(ConnectionEvent::Established { peer, direction }) => {
                log::debug!("Connection to node {} established ({:?})", peer, direction);
                on_established(&inner, peer);
            }
            Ok(ConnectionEvent::Lost { peer }) => {
                log::info!("Connection to node {} lost", peer);
                on_lost(&inner, peer);
            }
            Ok(ConnectionEvent::Dropped { peer }) => {
                log::debug!("Connection to node {} dropped", peer);
                refresh(&inner);
            }
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("Missed {} connection event(s); resynchronizing links", skipped);
                refresh(&inner);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn on_established(inner: &NodeInner, peer: NodeId) {
    if !inner.directory.contains(peer) {
        return;
    }
    if let Some(member) = inner.set_peer_status(peer, NodeStatus::Active) {
        inner.broadcast(DirectoryDelta::MemberUpserted { member }, &[]);
    }
    let mut own = inner.refresh_local_links();
    if inner.identity.status() == NodeStatus::Offline {
        log::info!("Connection to node {} restored; local node active again", peer);
        own = inner.set_local_status(NodeStatus::Active).or(own);
    }
    if let Some(own) = own {
        inner.announce(own);
    }
    inner.persist();
}

fn on_lost(inner: &NodeInner, peer: NodeId) {
    if let Some(member) = inner.set_peer_status(peer, NodeStatus::Offline) {
        inner.broadcast(DirectoryDelta::MemberUpserted { member }, &[peer]);
    }
    refresh(inner);
}

fn refresh(inner: &NodeInner) {
    if let Some(own) = inner.refresh_local_links() {
        inner.announce(own);
    }
    inner.persist();
}
