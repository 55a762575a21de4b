//! Durable node state.
//!
//! Three JSON documents live under the data directory:
//! - `identity.json`: node id, naming and signing key
//! - `membership.json`: lifecycle state, local settings and the directory
//! - `routes.json`: the topology ledger
//!
//! Writes go to a temporary file first and are renamed into place. Without a
//! data directory every call is a no-op and nothing survives a restart.

use std::{
    fs,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing as log;

use crate::{
    directory::DirectoryRecord,
    error::{MeshError, MeshResult},
    identity::{IdentityRecord, NodeState},
    topology::Route,
    types::MeshSettings,
};

pub const IDENTITY_FILE: &str = "identity.json";
pub const MEMBERSHIP_FILE: &str = "membership.json";
pub const ROUTES_FILE: &str = "routes.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub state: NodeState,
    #[serde(default)]
    pub settings: MeshSettings,
    #[serde(default)]
    pub directory: Option<DirectoryRecord>,
}

#[derive(Debug, Default)]
pub struct StateStore {
    dir: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn open(dir: Option<PathBuf>) -> MeshResult<Self> {
        if let Some(dir) = &dir {
            fs::create_dir_all(dir).map_err(|e| {
                MeshError::Internal(format!("cannot create data dir {}: {e}", dir.display()))
            })?;
        }
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.dir.is_some()
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn load_identity(&self) -> MeshResult<Option<IdentityRecord>> {
        self.load(IDENTITY_FILE)
    }

    pub fn save_identity(&self, record: &IdentityRecord) -> MeshResult<()> {
        self.save(IDENTITY_FILE, record)
    }

    pub fn load_membership(&self) -> MeshResult<Option<MembershipRecord>> {
        self.load(MEMBERSHIP_FILE)
    }

    pub fn save_membership(&self, record: &MembershipRecord) -> MeshResult<()> {
        self.save(MEMBERSHIP_FILE, record)
    }

    pub fn load_routes(&self) -> MeshResult<Vec<Route>> {
        Ok(self.load(ROUTES_FILE)?.unwrap_or_default())
    }

    pub fn save_routes(&self, routes: &[Route]) -> MeshResult<()> {
        self.save(ROUTES_FILE, routes)
    }

    fn load<T: DeserializeOwned>(&self, name: &str) -> MeshResult<Option<T>> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        let path = dir.join(name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(MeshError::Internal(format!(
                    "cannot read {}: {e}",
                    path.display()
                )))
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| MeshError::Internal(format!("corrupt {}: {e}", path.display())))
    }

    fn save<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> MeshResult<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(value)?;
        let _guard = self.write_lock.lock();
        let path = dir.join(name);
        let tmp = dir.join(format!(".{name}.tmp"));
        fs::write(&tmp, &bytes)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|e| MeshError::Internal(format!("cannot write {}: {e}", path.display())))?;
        log::trace!("Persisted {}", path.display());
        Ok(())
    }
}
