//! Desired tunnel set received from the panel, persisted as `desired.json`

use fleet_proto::TunnelSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DESIRED_FILE: &str = "desired.json";

#[derive(Debug, Error)]
pub enum DesiredError {
    #[error("config conflict: push generation {offered} is older than held generation {held}")]
    ConfigConflict { held: u64, offered: u64 },

    #[error("failed to persist desired state to {path:?}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt desired state in {path:?}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Desired specs at a panel generation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesiredSet {
    pub generation: u64,
    pub tunnels: BTreeMap<String, TunnelSpec>,
}

/// Result of offering a push to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    /// Whether the held set differs from before
    pub changed: bool,
    /// Specs dropped because a newer version was already held
    pub stale_specs: Vec<String>,
}

/// Latest desired set accepted by the node.
///
/// Never moves backwards: older generations are refused whole, and an older
/// version of a single tunnel never replaces a newer one.
pub struct DesiredStore {
    path: Option<PathBuf>,
    state: Mutex<DesiredSet>,
}

impl DesiredStore {
    /// In-memory store (tests, or nodes without a data dir)
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(DesiredSet::default()),
        }
    }

    /// Load `desired.json` from `data_dir`, starting empty if it doesn't exist
    pub fn open(data_dir: &Path) -> Result<Self, DesiredError> {
        let path = data_dir.join(DESIRED_FILE);
        let state: DesiredSet = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).map_err(|source| DesiredError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => DesiredSet::default(),
            Err(source) => return Err(DesiredError::Persist { path, source }),
        };

        debug!(
            generation = state.generation,
            tunnels = state.tunnels.len(),
            "Loaded desired state"
        );
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn snapshot(&self) -> DesiredSet {
        self.lock().clone()
    }

    /// Offer a full desired set from the panel
    pub fn accept_push(
        &self,
        generation: u64,
        tunnels: Vec<TunnelSpec>,
    ) -> Result<PushOutcome, DesiredError> {
        let mut state = self.lock();

        if generation < state.generation {
            warn!(
                held = state.generation,
                offered = generation,
                "Discarding stale config push"
            );
            return Err(DesiredError::ConfigConflict {
                held: state.generation,
                offered: generation,
            });
        }

        let mut stale_specs = Vec::new();
        let mut next = BTreeMap::new();
        for spec in tunnels {
            let keep_held = state
                .tunnels
                .get(&spec.tunnel_id)
                .filter(|held| held.version > spec.version)
                .cloned();

            match keep_held {
                Some(held) => {
                    warn!(
                        tunnel_id = %spec.tunnel_id,
                        held_version = held.version,
                        offered_version = spec.version,
                        "Discarding stale tunnel spec"
                    );
                    stale_specs.push(spec.tunnel_id.clone());
                    next.insert(held.tunnel_id.clone(), held);
                }
                None => {
                    next.insert(spec.tunnel_id.clone(), spec);
                }
            }
        }

        let candidate = DesiredSet {
            generation,
            tunnels: next,
        };
        let changed = candidate != *state;
        if changed {
            if let Some(path) = &self.path {
                write_atomic(path, &candidate)?;
            }
            info!(
                generation,
                tunnels = candidate.tunnels.len(),
                "Accepted desired config"
            );
            *state = candidate;
        }

        Ok(PushOutcome {
            changed,
            stale_specs,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DesiredSet> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn write_atomic(path: &Path, set: &DesiredSet) -> Result<(), DesiredError> {
    let persist = |source: std::io::Error| DesiredError::Persist {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(persist)?;
    }
    let json = serde_json::to_vec_pretty(set).map_err(|e| persist(e.into()))?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp).map_err(persist)?;
        file.write_all(&json).map_err(persist)?;
        file.sync_all().map_err(persist)?;
    }
    std::fs::rename(&tmp, path).map_err(persist)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_proto::ProtocolMode;

    fn spec(tunnel_id: &str, version: u64) -> TunnelSpec {
        TunnelSpec {
            tunnel_id: tunnel_id.to_string(),
            node_id: "node-a".to_string(),
            local_port: 9000 + version as u16,
            remote_target: "10.0.0.1:80".to_string(),
            mode: ProtocolMode::Tcp,
            enabled: true,
            version,
        }
    }

    #[test]
    fn test_older_generation_is_refused() {
        let store = DesiredStore::in_memory();
        store.accept_push(3, vec![spec("a", 3)]).unwrap();

        let result = store.accept_push(2, vec![spec("a", 2), spec("b", 1)]);
        assert!(matches!(
            result,
            Err(DesiredError::ConfigConflict { held: 3, offered: 2 })
        ));

        let held = store.snapshot();
        assert_eq!(held.generation, 3);
        assert_eq!(held.tunnels.len(), 1);
        assert_eq!(held.tunnels["a"].version, 3);
    }

    #[test]
    fn test_same_generation_is_idempotent() {
        let store = DesiredStore::in_memory();
        let first = store.accept_push(1, vec![spec("a", 1)]).unwrap();
        assert!(first.changed);

        let again = store.accept_push(1, vec![spec("a", 1)]).unwrap();
        assert!(!again.changed);
    }

    #[test]
    fn test_stale_spec_inside_newer_push_keeps_held_version() {
        let store = DesiredStore::in_memory();
        store.accept_push(5, vec![spec("a", 5)]).unwrap();

        let outcome = store.accept_push(6, vec![spec("a", 4), spec("b", 6)]).unwrap();
        assert_eq!(outcome.stale_specs, vec!["a".to_string()]);

        let held = store.snapshot();
        assert_eq!(held.generation, 6);
        assert_eq!(held.tunnels["a"].version, 5);
        assert_eq!(held.tunnels["b"].version, 6);
    }

    #[test]
    fn test_tunnels_missing_from_push_are_removed() {
        let store = DesiredStore::in_memory();
        store.accept_push(1, vec![spec("a", 1), spec("b", 1)]).unwrap();
        store.accept_push(2, vec![spec("b", 1)]).unwrap();

        let held = store.snapshot();
        assert!(!held.tunnels.contains_key("a"));
        assert!(held.tunnels.contains_key("b"));
    }

    #[test]
    fn test_persisted_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DesiredStore::open(dir.path()).unwrap();
            assert_eq!(store.generation(), 0);
            store.accept_push(7, vec![spec("a", 7)]).unwrap();
        }

        let reopened = DesiredStore::open(dir.path()).unwrap();
        assert_eq!(reopened.generation(), 7);
        assert_eq!(reopened.snapshot().tunnels["a"].version, 7);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DESIRED_FILE), "[]").unwrap();
        assert!(matches!(
            DesiredStore::open(dir.path()),
            Err(DesiredError::Corrupt { .. })
        ));
    }
}
