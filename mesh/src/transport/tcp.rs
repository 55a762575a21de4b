use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing as log;

use super::{Listener, RawConnection, Transport, TransportError};

/// Plain TCP transport.
#[derive(Debug, Default, Clone)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, addr: &str) -> Result<RawConnection, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Connect(format!("{addr}: {e}")))?;
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("Failed to set TCP_NODELAY on {}: {}", addr, e);
        }
        let remote_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string());
        Ok(RawConnection {
            stream: Box::new(stream),
            remote_addr,
            is_tls: false,
        })
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::Listen(format!("{addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .map_err(|e| TransportError::Listen(e.to_string()))?;
        Ok(Box::new(TcpPeerListener {
            listener,
            local_addr,
        }))
    }
}

struct TcpPeerListener {
    listener: TcpListener,
    local_addr: String,
}

#[async_trait]
impl Listener for TcpPeerListener {
    async fn accept(&mut self) -> Option<RawConnection> {
        loop {
            match self.listener.accept().await {
                Ok((stream, remote)) => {
                    let _ = stream.set_nodelay(true);
                    return Some(RawConnection {
                        stream: Box::new(stream),
                        remote_addr: remote.to_string(),
                        is_tls: false,
                    });
                }
                // Per-connection accept errors (e.g. reset before accept) are not fatal.
                Err(e) => log::warn!("Accept failed on {}: {}", self.local_addr, e),
            }
        }
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }
}
