//! Control channel message types

use crate::model::{HealthSnapshot, TunnelSpec, TunnelState};
use serde::{Deserialize, Serialize};

/// Main control channel message enum
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    // Handshake (after TLS)
    /// Panel asks the node to prove possession of its identity key
    Challenge {
        #[serde(with = "serde_bytes")]
        nonce: Vec<u8>,
    },
    /// Node answers the challenge and announces itself
    Hello {
        node_id: String,
        announce: NodeAnnounce,
        signature: HandshakeSignature,
    },
    /// Panel accepts the session
    Welcome {
        node_id: String,
        heartbeat_interval_secs: u64,
    },
    /// Panel refuses the session
    Rejected {
        reason: String,
    },

    // Session traffic
    /// Node liveness plus a summary of its tunnels
    Heartbeat {
        node_id: String,
        health: HealthSnapshot,
    },
    /// Full desired tunnel set for a node at a given generation
    PushConfig {
        node_id: String,
        generation: u64,
        tunnels: Vec<TunnelSpec>,
    },
    /// Observed tunnel states after a reconciliation pass
    ReportStatus {
        node_id: String,
        generation: u64,
        tunnels: Vec<TunnelState>,
    },
    Disconnect {
        reason: String,
    },
}

impl ControlMessage {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Challenge { .. } => "challenge",
            ControlMessage::Hello { .. } => "hello",
            ControlMessage::Welcome { .. } => "welcome",
            ControlMessage::Rejected { .. } => "rejected",
            ControlMessage::Heartbeat { .. } => "heartbeat",
            ControlMessage::PushConfig { .. } => "push_config",
            ControlMessage::ReportStatus { .. } => "report_status",
            ControlMessage::Disconnect { .. } => "disconnect",
        }
    }
}

mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}

/// Signature algorithms accepted for handshake proofs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    EcdsaP256Sha256,
    Ed25519,
}

/// Proof that the sender holds the private key of its certificate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeSignature {
    pub algorithm: SignatureAlgorithm,
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
}

/// What a node tells the panel about itself when connecting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeAnnounce {
    pub display_name: String,
    /// Address of the node's local status API
    pub api_address: String,
    pub platform: String,
    pub agent_version: String,
}

impl Default for NodeAnnounce {
    fn default() -> Self {
        Self {
            display_name: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            api_address: String::new(),
            platform: std::env::consts::OS.to_string(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
