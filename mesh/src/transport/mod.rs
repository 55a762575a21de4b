//! Transport seam between the connection manager and the network.
//!
//! Production nodes use [`TcpTransport`]; multi-node tests and simulations use
//! [`MemoryNetwork`], which routes connections through in-process pipes.

mod memory;
mod tcp;

use std::fmt;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

use crate::error::MeshError;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Listen failed: {0}")]
    Listen(String),
}

impl From<TransportError> for MeshError {
    fn from(err: TransportError) -> Self {
        MeshError::Unavailable(err.to_string())
    }
}

/// Any bidirectional byte stream usable as a peer link.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> PeerStream for T {}

pub type BoxedStream = Box<dyn PeerStream>;

/// A stream produced by a dial or an accept.
pub struct RawConnection {
    pub stream: BoxedStream,
    pub remote_addr: String,
    pub is_tls: bool,
}

impl fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawConnection")
            .field("remote_addr", &self.remote_addr)
            .field("is_tls", &self.is_tls)
            .finish()
    }
}

#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug + 'static {
    /// Open a stream to `addr` (`host:port`).
    async fn dial(&self, addr: &str) -> Result<RawConnection, TransportError>;

    /// Start accepting streams on `addr`.
    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, TransportError>;
}

#[async_trait]
pub trait Listener: Send + 'static {
    /// Next inbound stream, or `None` once the listener is closed.
    async fn accept(&mut self) -> Option<RawConnection>;

    /// The address the listener is actually bound to.
    fn local_addr(&self) -> String;
}
