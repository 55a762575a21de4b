//! In-process transport over `tokio::io::duplex` pipes.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    io::DuplexStream,
    sync::mpsc,
};

use super::{Listener, RawConnection, Transport, TransportError};

const DUPLEX_BUF_SIZE: usize = 64 * 1024;
const ACCEPT_BACKLOG: usize = 64;

/// Shared broker routing dials to listeners by address.
#[derive(Clone, Debug, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

#[derive(Debug, Default)]
struct NetworkState {
    listeners: HashMap<String, (u64, mpsc::Sender<RawConnection>)>,
    unreachable: HashSet<String>,
    /// Addresses that accept the stream but never answer.
    blackholes: HashMap<String, Vec<DuplexStream>>,
    next_listener_id: u64,
    next_port: u16,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose dials carry `local_addr` as their origin.
    pub fn transport(&self, local_addr: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local_addr: local_addr.into(),
        }
    }

    /// Make dials to `addr` fail as if the host were down.
    pub fn set_unreachable(&self, addr: &str, unreachable: bool) {
        let mut state = self.state.lock();
        if unreachable {
            state.unreachable.insert(addr.to_string());
        } else {
            state.unreachable.remove(addr);
        }
    }

    /// Make dials to `addr` succeed but never receive a reply.
    pub fn set_blackhole(&self, addr: &str) {
        self.state
            .lock()
            .blackholes
            .entry(addr.to_string())
            .or_default();
    }

    pub fn is_listening(&self, addr: &str) -> bool {
        self.state.lock().listeners.contains_key(addr)
    }

    fn unregister(&self, addr: &str, listener_id: u64) {
        let mut state = self.state.lock();
        if matches!(state.listeners.get(addr), Some((id, _)) if *id == listener_id) {
            state.listeners.remove(addr);
        }
    }
}

#[derive(Clone, Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local_addr: String,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn dial(&self, addr: &str) -> Result<RawConnection, TransportError> {
        let (near, far) = tokio::io::duplex(DUPLEX_BUF_SIZE);
        let accept_tx = {
            let mut state = self.network.state.lock();
            if state.unreachable.contains(addr) {
                return Err(TransportError::Connect(format!("{addr}: host unreachable")));
            }
            if let Some(held) = state.blackholes.get_mut(addr) {
                held.push(far);
                return Ok(RawConnection {
                    stream: Box::new(near),
                    remote_addr: addr.to_string(),
                    is_tls: false,
                });
            }
            match state.listeners.get(addr) {
                Some((_, tx)) => tx.clone(),
                None => {
                    return Err(TransportError::Connect(format!(
                        "{addr}: connection refused"
                    )))
                }
            }
        };

        accept_tx
            .send(RawConnection {
                stream: Box::new(far),
                remote_addr: self.local_addr.clone(),
                is_tls: false,
            })
            .await
            .map_err(|_| TransportError::Connect(format!("{addr}: listener closed")))?;

        Ok(RawConnection {
            stream: Box::new(near),
            remote_addr: addr.to_string(),
            is_tls: false,
        })
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, TransportError> {
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let mut state = self.network.state.lock();

        let addr = match addr.rsplit_once(':') {
            Some((host, "0")) => {
                state.next_port = state.next_port.max(40_000) + 1;
                format!("{host}:{}", state.next_port)
            }
            _ => addr.to_string(),
        };
        if state.listeners.contains_key(&addr) {
            return Err(TransportError::Listen(format!("{addr}: address in use")));
        }
        state.next_listener_id += 1;
        let id = state.next_listener_id;
        state.listeners.insert(addr.clone(), (id, tx));

        Ok(Box::new(MemoryListener {
            network: self.network.clone(),
            addr,
            id,
            rx,
        }))
    }
}

struct MemoryListener {
    network: MemoryNetwork,
    addr: String,
    id: u64,
    rx: mpsc::Receiver<RawConnection>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self) -> Option<RawConnection> {
        self.rx.recv().await
    }

    fn local_addr(&self) -> String {
        self.addr.clone()
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.network.unregister(&self.addr, self.id);
    }
}
