//! Mesh Directory
//!
//! The local replica of the mesh record and its roster. Every change goes
//! through [`MeshDirectory::commit`], which applies the change to a copy,
//! recomputes the derived counts and swaps the copy in under one write lock,
//! so readers never observe a roster without its matching counts.
//!
//! Replication between members is last-writer-wins on Lamport versions.
//! Removed members leave a tombstone so a delayed upsert cannot bring them
//! back, and a removed node's own announcements are never taken as a
//! readmission: only another member can bring it back.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    clock::LamportClock,
    error::{MeshError, MeshResult},
    topology::Route,
    types::{MemberRecord, MeshId, MeshRecord, MeshSettings, MeshStatus, NodeId, NodeStatus},
};

/// Full replica handed to a new member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    pub mesh: MeshRecord,
    pub members: Vec<MemberRecord>,
    #[serde(default)]
    pub routes: Vec<Route>,
}

/// A single replicated change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DirectoryDelta {
    MemberUpserted {
        member: MemberRecord,
    },
    MemberRemoved {
        node_id: NodeId,
        version: u64,
    },
    SettingsChanged {
        settings: MeshSettings,
        version: u64,
    },
    PolicyChanged {
        allow_join: bool,
        join_key: Option<String>,
        version: u64,
    },
    RouteUpserted {
        route: Route,
    },
    RouteRemoved {
        source_node_id: NodeId,
        target_node_id: NodeId,
        version: u64,
    },
}

impl DirectoryDelta {
    pub fn version(&self) -> u64 {
        match self {
            DirectoryDelta::MemberUpserted { member } => member.version,
            DirectoryDelta::RouteUpserted { route } => route.version,
            DirectoryDelta::MemberRemoved { version, .. }
            | DirectoryDelta::SettingsChanged { version, .. }
            | DirectoryDelta::PolicyChanged { version, .. }
            | DirectoryDelta::RouteRemoved { version, .. } => *version,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DirectoryDelta::MemberUpserted { .. } => "member_upserted",
            DirectoryDelta::MemberRemoved { .. } => "member_removed",
            DirectoryDelta::SettingsChanged { .. } => "settings_changed",
            DirectoryDelta::PolicyChanged { .. } => "policy_changed",
            DirectoryDelta::RouteUpserted { .. } => "route_upserted",
            DirectoryDelta::RouteRemoved { .. } => "route_removed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    Applied,
    Ignored,
    /// A peer holds a view of the local node that differs from the local one.
    SelfConflict,
}

/// On-disk form of the directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub mesh: MeshRecord,
    pub members: Vec<MemberRecord>,
    #[serde(default)]
    pub tombstones: BTreeMap<NodeId, u64>,
    pub clock: u64,
}

#[derive(Debug, Clone)]
pub struct DirectoryState {
    pub mesh: MeshRecord,
    pub members: BTreeMap<NodeId, MemberRecord>,
    tombstones: BTreeMap<NodeId, u64>,
    pending_admissions: u32,
}

impl DirectoryState {
    fn new(mesh: MeshRecord, members: Vec<MemberRecord>) -> Self {
        let mut state = Self {
            mesh,
            members: members.into_iter().map(|m| (m.node_id(), m)).collect(),
            tombstones: BTreeMap::new(),
            pending_admissions: 0,
        };
        state.recompute();
        state
    }

    pub fn member(&self, node_id: NodeId) -> Option<&MemberRecord> {
        self.members.get(&node_id)
    }

    pub fn member_mut(&mut self, node_id: NodeId) -> Option<&mut MemberRecord> {
        self.members.get_mut(&node_id)
    }

    pub fn upsert_member(&mut self, member: MemberRecord) {
        self.tombstones.remove(&member.node_id());
        self.members.insert(member.node_id(), member);
    }

    /// Remove a member, strip it from every link set and leave a tombstone.
    pub fn remove_member(&mut self, node_id: NodeId, version: u64) -> Option<MemberRecord> {
        let removed = self.members.remove(&node_id)?;
        for member in self.members.values_mut() {
            member.links.remove(&node_id);
        }
        self.tombstones.insert(node_id, version);
        Some(removed)
    }

    /// Replace a member's link set. Returns whether anything changed.
    pub fn set_links(&mut self, node_id: NodeId, links: BTreeSet<NodeId>, version: u64) -> bool {
        match self.members.get_mut(&node_id) {
            Some(member) if member.links != links => {
                member.links = links;
                member.version = version;
                true
            }
            _ => false,
        }
    }

    pub fn set_member_status(&mut self, node_id: NodeId, status: NodeStatus, version: u64) -> bool {
        match self.members.get_mut(&node_id) {
            Some(member) if member.status != status => {
                member.status = status;
                member.version = version;
                true
            }
            _ => false,
        }
    }

    pub fn begin_admission(&mut self) {
        self.pending_admissions += 1;
    }

    pub fn end_admission(&mut self) {
        self.pending_admissions = self.pending_admissions.saturating_sub(1);
    }

    fn recompute(&mut self) {
        let mut pairs = BTreeSet::new();
        for (id, member) in &self.members {
            for peer in &member.links {
                if peer != id && self.members.contains_key(peer) {
                    pairs.insert(((*id).min(*peer), (*id).max(*peer)));
                }
            }
        }
        self.mesh.node_count = self.members.len();
        self.mesh.connection_count = pairs.len();
        self.mesh.status = if self.pending_admissions > 0 {
            MeshStatus::Growing
        } else if self.members.len() <= 1 {
            MeshStatus::Seeded
        } else {
            MeshStatus::Active
        };
        self.mesh.updated_at = Utc::now();
    }
}

#[derive(Debug, Default)]
pub struct MeshDirectory {
    state: RwLock<Option<DirectoryState>>,
    clock: LamportClock,
}

impl MeshDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_record(record: DirectoryRecord) -> Self {
        let mut state = DirectoryState::new(record.mesh, record.members);
        state.tombstones = record.tombstones;
        Self {
            state: RwLock::new(Some(state)),
            clock: LamportClock::starting_at(record.clock),
        }
    }

    pub fn record(&self) -> Option<DirectoryRecord> {
        self.state.read().as_ref().map(|s| DirectoryRecord {
            mesh: s.mesh.clone(),
            members: s.members.values().cloned().collect(),
            tombstones: s.tombstones.clone(),
            clock: self.clock.current(),
        })
    }

    /// Next Lamport version for a local change.
    pub fn tick(&self) -> u64 {
        self.clock.tick()
    }

    pub fn observe(&self, version: u64) {
        self.clock.observe(version);
    }

    pub fn is_seeded(&self) -> bool {
        self.state.read().is_some()
    }

    pub fn status(&self) -> MeshStatus {
        self.state
            .read()
            .as_ref()
            .map(|s| s.mesh.status)
            .unwrap_or(MeshStatus::Unseeded)
    }

    pub fn mesh(&self) -> Option<MeshRecord> {
        self.state.read().as_ref().map(|s| s.mesh.clone())
    }

    pub fn mesh_id(&self) -> Option<MeshId> {
        self.state.read().as_ref().map(|s| s.mesh.mesh_id)
    }

    pub fn members(&self) -> Vec<MemberRecord> {
        self.state
            .read()
            .as_ref()
            .map(|s| s.members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn member(&self, node_id: NodeId) -> Option<MemberRecord> {
        self.state
            .read()
            .as_ref()
            .and_then(|s| s.members.get(&node_id).cloned())
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.state
            .read()
            .as_ref()
            .is_some_and(|s| s.members.contains_key(&node_id))
    }

    /// Snapshot without routes; the caller attaches the topology.
    pub fn snapshot(&self) -> Option<DirectorySnapshot> {
        self.state.read().as_ref().map(|s| DirectorySnapshot {
            mesh: s.mesh.clone(),
            members: s.members.values().cloned().collect(),
            routes: Vec::new(),
        })
    }

    /// Replace the whole replica.
    pub fn install(&self, mesh: MeshRecord, members: Vec<MemberRecord>) {
        for member in &members {
            self.clock.observe(member.version);
        }
        self.clock.observe(mesh.settings_version.max(mesh.policy_version));
        *self.state.write() = Some(DirectoryState::new(mesh, members));
    }

    /// Drop the replica. Returns the mesh record that was held.
    pub fn clear(&self) -> Option<MeshRecord> {
        self.state.write().take().map(|s| s.mesh)
    }

    /// Apply `f` atomically. Counts and status are recomputed before the new
    /// state becomes visible; an error leaves the replica untouched.
    pub fn commit<T>(
        &self,
        f: impl FnOnce(&mut DirectoryState) -> MeshResult<T>,
    ) -> MeshResult<T> {
        let mut guard = self.state.write();
        let current = guard.as_ref().ok_or_else(|| {
            MeshError::FailedPrecondition("node is not part of a mesh".to_string())
        })?;
        let mut next = current.clone();
        let out = f(&mut next)?;
        next.recompute();
        *guard = Some(next);
        Ok(out)
    }

    /// Apply a replicated membership change first issued by `origin`. Route
    /// deltas are not handled here and report [`DeltaOutcome::Ignored`].
    pub fn apply_delta(&self, delta: &DirectoryDelta, origin: NodeId, local: NodeId) -> DeltaOutcome {
        self.clock.observe(delta.version());
        let mut guard = self.state.write();
        let Some(state) = guard.as_mut() else {
            return DeltaOutcome::Ignored;
        };

        let outcome = match delta {
            DirectoryDelta::MemberUpserted { member } => {
                let node_id = member.node_id();
                if node_id == local {
                    match state.members.get(&node_id) {
                        Some(own) if own.status != member.status || own.links != member.links => {
                            DeltaOutcome::SelfConflict
                        }
                        _ => DeltaOutcome::Ignored,
                    }
                } else if state.tombstones.get(&node_id).is_some_and(|removed_at| {
                    *removed_at >= member.version || origin == node_id
                }) || state
                        .members
                        .get(&node_id)
                        .is_some_and(|m| m.version >= member.version)
                {
                    DeltaOutcome::Ignored
                } else {
                    state.upsert_member(member.clone());
                    DeltaOutcome::Applied
                }
            }
            DirectoryDelta::MemberRemoved { node_id, version } => {
                // The local node keeps its own membership until told to reset.
                if *node_id == local {
                    DeltaOutcome::Ignored
                } else {
                    match state.members.get(node_id) {
                        Some(m) if m.version <= *version => {
                            state.remove_member(*node_id, *version);
                            DeltaOutcome::Applied
                        }
                        None if state.tombstones.get(node_id).map_or(true, |v| *v < *version) => {
                            state.tombstones.insert(*node_id, *version);
                            DeltaOutcome::Ignored
                        }
                        _ => DeltaOutcome::Ignored,
                    }
                }
            }
            DirectoryDelta::SettingsChanged { settings, version } => {
                if *version > state.mesh.settings_version {
                    state.mesh.settings = settings.clone();
                    state.mesh.settings_version = *version;
                    DeltaOutcome::Applied
                } else {
                    DeltaOutcome::Ignored
                }
            }
            DirectoryDelta::PolicyChanged {
                allow_join,
                join_key,
                version,
            } => {
                if *version > state.mesh.policy_version {
                    state.mesh.allow_join = *allow_join;
                    state.mesh.join_key = join_key.clone();
                    state.mesh.policy_version = *version;
                    DeltaOutcome::Applied
                } else {
                    DeltaOutcome::Ignored
                }
            }
            DirectoryDelta::RouteUpserted { .. } | DirectoryDelta::RouteRemoved { .. } => {
                DeltaOutcome::Ignored
            }
        };

        if outcome == DeltaOutcome::Applied {
            state.recompute();
        }
        outcome
    }

    /// Fold `source`'s full replica into the local one, member by member.
    /// Returns how many entries changed.
    pub fn merge_snapshot(&self, snapshot: &DirectorySnapshot, source: NodeId, local: NodeId) -> usize {
        let mut changed = 0;
        let mesh = &snapshot.mesh;
        let settings = DirectoryDelta::SettingsChanged {
            settings: mesh.settings.clone(),
            version: mesh.settings_version,
        };
        let policy = DirectoryDelta::PolicyChanged {
            allow_join: mesh.allow_join,
            join_key: mesh.join_key.clone(),
            version: mesh.policy_version,
        };
        for delta in [settings, policy] {
            if self.apply_delta(&delta, source, local) == DeltaOutcome::Applied {
                changed += 1;
            }
        }
        for member in &snapshot.members {
            let delta = DirectoryDelta::MemberUpserted {
                member: member.clone(),
            };
            if self.apply_delta(&delta, source, local) == DeltaOutcome::Applied {
                changed += 1;
            }
        }
        changed
    }
}
