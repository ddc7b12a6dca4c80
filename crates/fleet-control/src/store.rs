//! On-disk registry snapshot (`registry.json`)
//!
//! Node records, their desired specs and generations survive a panel
//! restart. Generations of removed nodes are kept too, so a node that comes
//! back is never offered a generation below the one it already holds.

use crate::registry::RegistryError;
use fleet_proto::{NodeRecord, TunnelSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const REGISTRY_FILE: &str = "registry.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredNode {
    pub record: NodeRecord,
    pub specs: Vec<TunnelSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub nodes: Vec<StoredNode>,
    /// node_id -> last generation before the node was removed
    #[serde(default)]
    pub retired: BTreeMap<String, u64>,
}

#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(REGISTRY_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot; a missing file is an empty registry
    pub fn load(&self) -> Result<RegistrySnapshot, RegistryError> {
        let snapshot: RegistrySnapshot = match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|source| RegistryError::Corrupt {
                    path: self.path.clone(),
                    source,
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RegistrySnapshot::default(),
            Err(source) => {
                return Err(RegistryError::Persist {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        debug!(
            nodes = snapshot.nodes.len(),
            retired = snapshot.retired.len(),
            path = %self.path.display(),
            "Loaded registry snapshot"
        );
        Ok(snapshot)
    }

    /// Replace the snapshot atomically (temp file, fsync, rename)
    pub fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), RegistryError> {
        let persist = |source: std::io::Error| RegistryError::Persist {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(persist)?;
        }
        let json = serde_json::to_vec_pretty(snapshot).map_err(|e| persist(e.into()))?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp).map_err(persist)?;
            file.write_all(&json).map_err(persist)?;
            file.sync_all().map_err(persist)?;
        }
        std::fs::rename(&tmp, &self.path).map_err(persist)
    }
}
