use chrono::{DateTime, Utc};
use fleet_proto::{NodeRecord, ProtocolMode, TunnelSpec, TunnelState};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Operator login request
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Operator login response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LoginResponse {
    /// Bearer token for the protected endpoints
    pub token: String,
    /// Always "Bearer"
    pub token_type: String,
    /// Token expiration timestamp
    pub expires_at: DateTime<Utc>,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Known nodes
    pub nodes_total: usize,
    /// Nodes with an open control session
    pub nodes_connected: usize,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: &str) -> Self {
        Self {
            error: error.into(),
            code: Some(code.to_string()),
        }
    }
}

/// List of nodes
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NodeList {
    pub nodes: Vec<NodeRecord>,
    pub total: usize,
}

/// A node with its desired configuration
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NodeDetail {
    #[serde(flatten)]
    pub node: NodeRecord,
    /// Tunnel specs the panel wants on this node
    pub desired: Vec<TunnelSpec>,
}

/// Desired and observed side of one tunnel
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TunnelView {
    pub tunnel_id: String,
    /// Absent once the spec was deleted but the node still reports it
    pub spec: Option<TunnelSpec>,
    /// Absent until the node reports the tunnel
    pub state: Option<TunnelState>,
    /// True when the node has applied the current spec version
    pub in_sync: bool,
}

/// Tunnels of a node
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TunnelList {
    pub node_id: String,
    /// Desired-config generation on the panel
    pub generation: u64,
    /// Generation the node last reported
    pub reported_generation: u64,
    pub tunnels: Vec<TunnelView>,
    pub total: usize,
}

/// Create or replace a tunnel spec
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SetTunnelRequest {
    /// Port the forwarder listens on, on the node
    pub local_port: u16,
    /// Forward destination, host:port
    pub remote_target: String,
    #[serde(default)]
    pub mode: ProtocolMode,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Query for the CA endpoint
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct CaQuery {
    /// Serve as an attachment
    #[serde(default)]
    pub download: bool,
}
