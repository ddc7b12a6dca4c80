//! Mutually-authenticated control channel between the Panel and its Nodes
//!
//! TLS 1.3 over TCP with client certificates, framed with `ControlCodec`.
//! After TLS both sides run trust store verification, then the node proves
//! possession of its key by signing a panel-chosen nonce.

pub mod connection;
pub mod error;
pub mod handshake;
pub mod reconnect;

pub use connection::{ControlConnection, ControlReceiver, ControlSender};
pub use error::ChannelError;
pub use handshake::{
    AcceptedNode, ConnectedPanel, ControlAcceptor, ControlConnector, HandshakeConfig,
};
pub use reconnect::{ReconnectConfig, ReconnectManager};
