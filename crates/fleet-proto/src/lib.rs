//! Fleet Protocol Definitions
//!
//! This crate defines the shared data model (tunnel specs, observed tunnel
//! state, node records) and the control channel messages exchanged between
//! the Panel and its Nodes, together with the length-prefixed frame codec.

pub mod codec;
pub mod messages;
pub mod model;

pub use codec::{CodecError, ControlCodec};
pub use messages::*;
pub use model::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Domain separation prefix for handshake signatures
pub const HANDSHAKE_CONTEXT: &[u8] = b"fleet-control-handshake-v1";
