//! Fleet registry: the panel's record of nodes, their health and desired tunnels
//!
//! The registry is the only writer of tunnel specs. Every edit bumps the
//! node's generation and stamps the spec with it, so versions on a node are
//! strictly increasing no matter how many editors race. Node health is never
//! stored; it is derived from the last heartbeat every time a record is read.
//!
//! Generations never move backwards for a node id: they are persisted with
//! the records, carried over when an operator removes a node, and lifted
//! above whatever a node reports holding.

use crate::store::{RegistrySnapshot, RegistryStore, StoredNode};
use chrono::{DateTime, Utc};
use fleet_proto::{
    HealthSnapshot, NodeAnnounce, NodeHealth, NodeRecord, SpecError, TunnelSpec, TunnelState,
};
use fleet_trust::Identity;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Tunnel {tunnel_id} not found on node {node_id}")]
    TunnelNotFound { node_id: String, tunnel_id: String },

    #[error("Node id '{node_id}' does not match certificate common name '{common_name}'")]
    IdentityMismatch {
        node_id: String,
        common_name: String,
    },

    #[error("Invalid tunnel spec: {0}")]
    InvalidSpec(#[from] SpecError),

    #[error("Local port {port} is already used by tunnel {tunnel_id}")]
    PortConflict { port: u16, tunnel_id: String },

    #[error("Failed to persist registry to {path:?}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt registry snapshot {path:?}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Heartbeat policy used to derive node health
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub heartbeat_interval: Duration,
    /// Intervals without a heartbeat before a node reads as unreachable
    pub missed_heartbeats: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            missed_heartbeats: 3,
        }
    }
}

impl RegistryConfig {
    pub fn unreachable_after(&self) -> chrono::Duration {
        let threshold = self.heartbeat_interval * self.missed_heartbeats.max(1);
        chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::days(36500))
    }
}

struct NodeEntry {
    record: NodeRecord,
    last_snapshot: Option<HealthSnapshot>,
    specs: BTreeMap<String, TunnelSpec>,
    generation: watch::Sender<u64>,
    session: u64,
}

impl NodeEntry {
    fn new(record: NodeRecord, specs: BTreeMap<String, TunnelSpec>) -> Self {
        let (generation, _) = watch::channel(record.generation);
        Self {
            record,
            last_snapshot: None,
            specs,
            generation,
            session: 0,
        }
    }

    fn bump_generation(&mut self) -> u64 {
        self.record.generation += 1;
        let generation = self.record.generation;
        self.generation.send_replace(generation);
        generation
    }

    fn view_at(&self, config: &RegistryConfig, now: DateTime<Utc>) -> NodeRecord {
        let mut record = self.record.clone();
        record.health_state = health_at(
            record.last_heartbeat_at,
            self.last_snapshot.as_ref(),
            config,
            now,
        );
        record
    }

    fn stored(&self) -> StoredNode {
        let mut record = self.record.clone();
        record.connected = false;
        StoredNode {
            record,
            specs: self.specs.values().cloned().collect(),
        }
    }
}

/// Health as of `now`, from the last heartbeat and the snapshot it carried
pub fn health_at(
    last_heartbeat_at: Option<DateTime<Utc>>,
    snapshot: Option<&HealthSnapshot>,
    config: &RegistryConfig,
    now: DateTime<Utc>,
) -> NodeHealth {
    let Some(last) = last_heartbeat_at else {
        return NodeHealth::Unknown;
    };

    if now - last > config.unreachable_after() {
        return NodeHealth::Unreachable;
    }

    match snapshot {
        Some(snapshot) if snapshot.failed > 0 => NodeHealth::Degraded,
        _ => NodeHealth::Healthy,
    }
}

/// Registry shared by every node session and the dashboard API
pub struct FleetRegistry {
    nodes: RwLock<HashMap<String, Arc<Mutex<NodeEntry>>>>,
    /// Last generation of each removed node
    retired: Mutex<BTreeMap<String, u64>>,
    store: Option<RegistryStore>,
    /// Serializes snapshot writes so the newest state always lands last
    persist_lock: Mutex<()>,
    config: RegistryConfig,
}

impl FleetRegistry {
    /// In-memory registry; nothing survives the process
    pub fn new(config: RegistryConfig) -> Self {
        info!(
            heartbeat_interval_secs = config.heartbeat_interval.as_secs(),
            missed_heartbeats = config.missed_heartbeats,
            "Creating fleet registry"
        );
        Self {
            nodes: RwLock::new(HashMap::new()),
            retired: Mutex::new(BTreeMap::new()),
            store: None,
            persist_lock: Mutex::new(()),
            config,
        }
    }

    /// Registry backed by `registry.json` in `data_dir`
    pub fn open(config: RegistryConfig, data_dir: &Path) -> Result<Self, RegistryError> {
        let store = RegistryStore::new(data_dir);
        let snapshot = store.load()?;

        let mut nodes = HashMap::with_capacity(snapshot.nodes.len());
        for stored in snapshot.nodes {
            let mut record = stored.record;
            record.connected = false;
            let specs = stored
                .specs
                .into_iter()
                .map(|spec| (spec.tunnel_id.clone(), spec))
                .collect();
            nodes.insert(
                record.node_id.clone(),
                Arc::new(Mutex::new(NodeEntry::new(record, specs))),
            );
        }

        info!(
            nodes = nodes.len(),
            path = %store.path().display(),
            "Opened fleet registry"
        );
        let registry = Self::new(config);
        Ok(Self {
            nodes: RwLock::new(nodes),
            retired: Mutex::new(snapshot.retired),
            store: Some(store),
            ..registry
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    async fn entry(&self, node_id: &str) -> Result<Arc<Mutex<NodeEntry>>, RegistryError> {
        self.nodes
            .read()
            .await
            .get(node_id)
            .cloned()
            .ok_or_else(|| RegistryError::NodeNotFound(node_id.to_string()))
    }

    /// Write the current state to disk, if this registry has a store.
    /// Must not be called while holding a node entry lock.
    async fn persist(&self) -> Result<(), RegistryError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let _writing = self.persist_lock.lock().await;

        let entries: Vec<_> = self.nodes.read().await.values().cloned().collect();
        let mut nodes = Vec::with_capacity(entries.len());
        for entry in entries {
            nodes.push(entry.lock().await.stored());
        }
        nodes.sort_by(|a, b| a.record.node_id.cmp(&b.record.node_id));
        let retired = self.retired.lock().await.clone();

        store.save(&RegistrySnapshot { nodes, retired })
    }

    /// Persist after a node-driven change; the in-memory state stays authoritative
    async fn persist_or_warn(&self, what: &str) {
        if let Err(e) = self.persist().await {
            warn!(error = %e, "Failed to persist registry after {}", what);
        }
    }

    /// Record a node that completed the handshake
    pub async fn register(
        &self,
        node_id: &str,
        identity: &Identity,
        announce: &NodeAnnounce,
    ) -> Result<NodeRecord, RegistryError> {
        self.register_session(node_id, identity, announce)
            .await
            .map(|(record, _)| record)
    }

    /// Like [`register`](Self::register), also returning the session number
    /// that [`mark_disconnected`](Self::mark_disconnected) must present
    pub async fn register_session(
        &self,
        node_id: &str,
        identity: &Identity,
        announce: &NodeAnnounce,
    ) -> Result<(NodeRecord, u64), RegistryError> {
        if node_id != identity.common_name {
            return Err(RegistryError::IdentityMismatch {
                node_id: node_id.to_string(),
                common_name: identity.common_name.clone(),
            });
        }

        let entry = {
            let mut nodes = self.nodes.write().await;
            match nodes.get(node_id) {
                Some(entry) => entry.clone(),
                None => {
                    // A returning node starts above everything it was ever sent
                    let generation = self
                        .retired
                        .lock()
                        .await
                        .remove(node_id)
                        .map_or(0, |last| last + 1);
                    info!(
                        node_id = %node_id,
                        fingerprint = %identity.fingerprint,
                        generation,
                        "Registered new node"
                    );
                    let entry = Arc::new(Mutex::new(NodeEntry::new(
                        NodeRecord {
                            node_id: node_id.to_string(),
                            display_name: String::new(),
                            api_address: String::new(),
                            last_heartbeat_at: None,
                            health_state: NodeHealth::Unknown,
                            connected: false,
                            last_error: None,
                            generation,
                            reported_generation: 0,
                            tunnels: Vec::new(),
                            registered_at: Utc::now(),
                        },
                        BTreeMap::new(),
                    )));
                    nodes.insert(node_id.to_string(), entry.clone());
                    entry
                }
            }
        };

        let registered = {
            let mut entry = entry.lock().await;
            entry.session += 1;
            entry.record.display_name = if announce.display_name.is_empty() {
                node_id.to_string()
            } else {
                announce.display_name.clone()
            };
            entry.record.api_address = announce.api_address.clone();
            entry.record.connected = true;
            entry.record.last_error = None;

            debug!(node_id = %node_id, session = entry.session, "Node session opened");
            (entry.view_at(&self.config, Utc::now()), entry.session)
        };

        self.persist_or_warn("registration").await;
        Ok(registered)
    }

    /// Create or replace a tunnel spec; returns it stamped with its new version
    pub async fn set_spec(
        &self,
        node_id: &str,
        mut spec: TunnelSpec,
    ) -> Result<TunnelSpec, RegistryError> {
        spec.node_id = node_id.to_string();
        spec.validate()?;

        {
            let entry = self.entry(node_id).await?;
            let mut entry = entry.lock().await;

            if spec.enabled {
                let transport = spec.mode.transport();
                if let Some(other) = entry.specs.values().find(|other| {
                    other.tunnel_id != spec.tunnel_id
                        && other.enabled
                        && other.local_port == spec.local_port
                        && other.mode.transport() == transport
                }) {
                    return Err(RegistryError::PortConflict {
                        port: spec.local_port,
                        tunnel_id: other.tunnel_id.clone(),
                    });
                }
            }

            spec.version = entry.bump_generation();
            entry.specs.insert(spec.tunnel_id.clone(), spec.clone());
        }

        info!(
            node_id = %node_id,
            tunnel_id = %spec.tunnel_id,
            version = spec.version,
            enabled = spec.enabled,
            "Tunnel spec updated"
        );
        self.persist().await?;
        Ok(spec)
    }

    /// Delete a tunnel spec; the node tears the tunnel down on its next push
    pub async fn remove_spec(&self, node_id: &str, tunnel_id: &str) -> Result<u64, RegistryError> {
        let generation = {
            let entry = self.entry(node_id).await?;
            let mut entry = entry.lock().await;

            if entry.specs.remove(tunnel_id).is_none() {
                return Err(RegistryError::TunnelNotFound {
                    node_id: node_id.to_string(),
                    tunnel_id: tunnel_id.to_string(),
                });
            }
            entry.bump_generation()
        };

        info!(node_id = %node_id, tunnel_id = %tunnel_id, generation, "Tunnel spec removed");
        self.persist().await?;
        Ok(generation)
    }

    /// Explicit operator removal; closes the node's generation feed.
    /// The node's generation is retired, not forgotten.
    pub async fn remove_node(&self, node_id: &str) -> Result<NodeRecord, RegistryError> {
        let entry = {
            let mut nodes = self.nodes.write().await;
            let entry = nodes
                .remove(node_id)
                .ok_or_else(|| RegistryError::NodeNotFound(node_id.to_string()))?;
            let generation = entry.lock().await.record.generation;
            self.retired
                .lock()
                .await
                .insert(node_id.to_string(), generation);
            entry
        };

        let record = entry.lock().await.view_at(&self.config, Utc::now());
        info!(node_id = %node_id, generation = record.generation, "Node removed by operator");
        self.persist().await?;
        Ok(record)
    }

    pub async fn get_node(&self, node_id: &str) -> Result<NodeRecord, RegistryError> {
        let entry = self.entry(node_id).await?;
        let entry = entry.lock().await;
        Ok(entry.view_at(&self.config, Utc::now()))
    }

    pub async fn list_nodes(&self) -> Vec<NodeRecord> {
        self.list_nodes_at(Utc::now()).await
    }

    /// Node records with health evaluated as of `now`
    pub async fn list_nodes_at(&self, now: DateTime<Utc>) -> Vec<NodeRecord> {
        let entries: Vec<_> = self.nodes.read().await.values().cloned().collect();

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            records.push(entry.lock().await.view_at(&self.config, now));
        }
        records.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        records
    }

    /// Current generation and the full desired tunnel set of a node
    pub async fn desired(&self, node_id: &str) -> Result<(u64, Vec<TunnelSpec>), RegistryError> {
        let entry = self.entry(node_id).await?;
        let entry = entry.lock().await;
        Ok((entry.record.generation, entry.specs.values().cloned().collect()))
    }

    /// Watch the node's generation; the feed closes when the node is removed
    pub async fn subscribe(&self, node_id: &str) -> Result<watch::Receiver<u64>, RegistryError> {
        let entry = self.entry(node_id).await?;
        let entry = entry.lock().await;
        Ok(entry.generation.subscribe())
    }

    pub async fn record_heartbeat(
        &self,
        node_id: &str,
        snapshot: HealthSnapshot,
    ) -> Result<(), RegistryError> {
        self.record_heartbeat_at(node_id, snapshot, Utc::now()).await
    }

    pub async fn record_heartbeat_at(
        &self,
        node_id: &str,
        snapshot: HealthSnapshot,
        at: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let entry = self.entry(node_id).await?;
        let mut entry = entry.lock().await;

        debug!(
            node_id = %node_id,
            active = snapshot.active,
            failed = snapshot.failed,
            generation = snapshot.generation,
            "Heartbeat"
        );
        entry.record.last_heartbeat_at = Some(at);
        entry.last_snapshot = Some(snapshot);
        Ok(())
    }

    /// Store the tunnel states a node reported after reconciling.
    ///
    /// A node holding a generation the panel never reached (the panel lost
    /// its state) makes the panel continue above it, restamping every spec,
    /// so the next push is one the node accepts.
    pub async fn record_status(
        &self,
        node_id: &str,
        generation: u64,
        tunnels: Vec<TunnelState>,
    ) -> Result<(), RegistryError> {
        let lifted = {
            let entry = self.entry(node_id).await?;
            let mut entry = entry.lock().await;

            for tunnel in tunnels.iter().filter(|t| t.retry_exhausted) {
                warn!(
                    node_id = %node_id,
                    tunnel_id = %tunnel.tunnel_id,
                    error = tunnel.last_error.as_deref().unwrap_or(""),
                    "Tunnel exhausted its retry budget"
                );
            }

            entry.record.reported_generation = generation;
            entry.record.tunnels = tunnels;

            if generation > entry.record.generation {
                warn!(
                    node_id = %node_id,
                    reported = generation,
                    current = entry.record.generation,
                    "Node holds a generation the panel never issued; continuing above it"
                );
                entry.record.generation = generation;
                let next = entry.bump_generation();
                for spec in entry.specs.values_mut() {
                    spec.version = next;
                }
                true
            } else {
                false
            }
        };

        if lifted {
            self.persist_or_warn("generation lift").await;
        }
        Ok(())
    }

    /// Attach a failed trust check to the node it claimed to be, if known
    pub async fn record_trust_failure(&self, common_name: Option<&str>, error: &str) -> bool {
        let Some(common_name) = common_name else {
            warn!(error = %error, "Rejected peer without a usable certificate");
            return false;
        };

        match self.entry(common_name).await {
            Ok(entry) => {
                warn!(node_id = %common_name, error = %error, "Trust failure for known node");
                entry.lock().await.record.last_error = Some(format!("trust: {}", error));
                self.persist_or_warn("trust failure").await;
                true
            }
            Err(_) => {
                warn!(common_name = %common_name, error = %error, "Trust failure for unknown peer");
                false
            }
        }
    }

    /// Session `session` ended; ignored when a newer session already took over
    pub async fn mark_disconnected(&self, node_id: &str, session: u64, reason: Option<String>) {
        let Ok(entry) = self.entry(node_id).await else {
            return;
        };
        let mut entry = entry.lock().await;
        if entry.session != session {
            debug!(node_id = %node_id, session, current = entry.session, "Stale session ended");
            return;
        }

        entry.record.connected = false;
        if reason.is_some() {
            entry.record.last_error = reason;
        }
        info!(node_id = %node_id, "Node disconnected");
    }
}

impl Default for FleetRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}
