use fleet_proto::CodecError;
use fleet_trust::{classify_tls_error, TrustError};
use std::io;
use thiserror::Error;

/// Control channel errors
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Peer or local trust failure. Never retried with the same material.
    #[error("Trust error: {0}")]
    Trust(#[from] TrustError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Codec error: {0}")]
    Codec(CodecError),

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Connection closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ChannelError {
    /// Trust failures are fatal; everything else is transient
    pub fn is_trust(&self) -> bool {
        matches!(self, ChannelError::Trust(_))
    }

    pub fn trust_error(&self) -> Option<&TrustError> {
        match self {
            ChannelError::Trust(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CodecError> for ChannelError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(io) => from_tls_io(io),
            other => ChannelError::Codec(other),
        }
    }
}

/// tokio-rustls reports TLS failures as io errors wrapping a `rustls::Error`
pub(crate) fn from_tls_io(err: io::Error) -> ChannelError {
    let tls_error = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .cloned();

    match tls_error {
        Some(tls) => match classify_tls_error(&tls) {
            Some(trust) => ChannelError::Trust(trust),
            None => ChannelError::Tls(tls.to_string()),
        },
        None => ChannelError::Io(err),
    }
}
