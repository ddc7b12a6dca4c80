//! Framed control connection over TLS

use crate::error::ChannelError;
use fleet_proto::{ControlCodec, ControlMessage};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsStream;
use tokio_util::codec::Framed;
use tracing::trace;

type Transport = Framed<TlsStream<TcpStream>, ControlCodec>;

/// An established, authenticated control connection
pub struct ControlConnection {
    framed: Transport,
    peer_addr: SocketAddr,
}

impl ControlConnection {
    pub(crate) fn new(stream: TlsStream<TcpStream>, peer_addr: SocketAddr) -> Self {
        Self {
            framed: Framed::new(stream, ControlCodec),
            peer_addr,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn send(&mut self, msg: ControlMessage) -> Result<(), ChannelError> {
        trace!(kind = msg.kind(), peer = %self.peer_addr, "Sending control message");
        self.framed.send(msg).await?;
        Ok(())
    }

    /// Next message, or `None` when the peer closed the connection
    pub async fn recv(&mut self) -> Result<Option<ControlMessage>, ChannelError> {
        match self.framed.next().await {
            Some(Ok(msg)) => {
                trace!(kind = msg.kind(), peer = %self.peer_addr, "Received control message");
                Ok(Some(msg))
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Split into independent send and receive halves
    pub fn split(self) -> (ControlSender, ControlReceiver) {
        let (sink, stream) = self.framed.split();
        (
            ControlSender {
                sink: Arc::new(Mutex::new(sink)),
                peer_addr: self.peer_addr,
            },
            ControlReceiver {
                stream,
                peer_addr: self.peer_addr,
            },
        )
    }
}

/// Sending half; cheap to clone
#[derive(Clone)]
pub struct ControlSender {
    sink: Arc<Mutex<SplitSink<Transport, ControlMessage>>>,
    peer_addr: SocketAddr,
}

impl ControlSender {
    pub async fn send(&self, msg: ControlMessage) -> Result<(), ChannelError> {
        trace!(kind = msg.kind(), peer = %self.peer_addr, "Sending control message");
        let mut sink = self.sink.lock().await;
        sink.send(msg).await?;
        Ok(())
    }

    /// Flush and close the write side
    pub async fn close(&self) -> Result<(), ChannelError> {
        let mut sink = self.sink.lock().await;
        sink.close().await?;
        Ok(())
    }
}

/// Receiving half
pub struct ControlReceiver {
    stream: SplitStream<Transport>,
    peer_addr: SocketAddr,
}

impl ControlReceiver {
    pub async fn recv(&mut self) -> Result<Option<ControlMessage>, ChannelError> {
        match self.stream.next().await {
            Some(Ok(msg)) => {
                trace!(kind = msg.kind(), peer = %self.peer_addr, "Received control message");
                Ok(Some(msg))
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}
