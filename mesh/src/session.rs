//! Multiplexed request/response session over a registered link.
//!
//! A session owns two tasks: a writer draining an mpsc queue into the frame
//! sink, and a reader that completes pending calls by envelope id and hands
//! inbound requests to a [`RequestHandler`]. Either task ending cancels the
//! other and fails every pending call.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing as log;
use tracing::Instrument;

use crate::{
    error::{MeshError, MeshResult},
    types::NodeId,
    wire::{Body, Envelope, FrameSink, FrameStream, Link, PeerRequest, PeerResponse},
};

const OUTBOUND_QUEUE: usize = 256;

/// Answer produced by a [`RequestHandler`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub response: PeerResponse,
    /// Close the session once the response has been written.
    pub close_after: bool,
}

impl Reply {
    pub fn ok(response: PeerResponse) -> Self {
        Self {
            response,
            close_after: false,
        }
    }

    pub fn closing(response: PeerResponse) -> Self {
        Self {
            response,
            close_after: true,
        }
    }

    pub fn error(err: &MeshError) -> Self {
        Self::ok(PeerResponse::rejected(err))
    }
}

#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, peer: NodeId, request: PeerRequest) -> Reply;
}

#[derive(Debug, Default)]
pub struct LinkCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    rtt_micros: AtomicU64,
}

impl LinkCounters {
    fn with_traffic(sent: u64, received: u64) -> Self {
        Self {
            bytes_sent: AtomicU64::new(sent),
            bytes_received: AtomicU64::new(received),
            rtt_micros: AtomicU64::new(0),
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn rtt_micros(&self) -> u64 {
        self.rtt_micros.load(Ordering::Relaxed)
    }
}

/// Count of outstanding requests and leases on a session.
#[derive(Debug)]
pub struct InFlight {
    tx: watch::Sender<usize>,
}

impl Default for InFlight {
    fn default() -> Self {
        Self {
            tx: watch::Sender::new(0),
        }
    }
}

impl InFlight {
    pub fn acquire(self: &Arc<Self>) -> InFlightGuard {
        self.tx.send_modify(|n| *n += 1);
        InFlightGuard {
            tracker: self.clone(),
        }
    }

    pub fn count(&self) -> usize {
        *self.tx.borrow()
    }

    /// Wait until nothing is in flight. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let idle = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );
        idle
    }
}

/// Keeps a session non-drainable while held.
#[derive(Debug)]
pub struct InFlightGuard {
    tracker: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker.tx.send_modify(|n| *n = n.saturating_sub(1));
    }
}

enum Outbound {
    Frame(Envelope),
    Close,
}

type Pending = Arc<DashMap<u64, oneshot::Sender<PeerResponse>>>;

pub struct Session {
    peer: NodeId,
    outbound: mpsc::Sender<Outbound>,
    pending: Pending,
    next_id: AtomicU64,
    counters: Arc<LinkCounters>,
    in_flight: Arc<InFlight>,
    cancel: CancellationToken,
    closed: watch::Receiver<bool>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("in_flight", &self.in_flight.count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// Take over `link` and start the reader and writer tasks.
    pub fn spawn(peer: NodeId, link: Link, handler: Arc<dyn RequestHandler>) -> Arc<Session> {
        let (sent, received) = link.traffic();
        let (sink, stream) = link.into_parts();
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (closed_tx, closed) = watch::channel(false);
        let counters = Arc::new(LinkCounters::with_traffic(sent, received));
        let in_flight = Arc::new(InFlight::default());
        let pending: Pending = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();

        let span = log::debug_span!("session", peer = %peer);
        tokio::spawn(
            write_loop(sink, rx, counters.clone(), cancel.clone()).instrument(span.clone()),
        );
        tokio::spawn(
            read_loop(ReadContext {
                peer,
                stream,
                outbound: outbound.clone(),
                pending: pending.clone(),
                counters: counters.clone(),
                in_flight: in_flight.clone(),
                handler,
                cancel: cancel.clone(),
                closed_tx,
            })
            .instrument(span),
        );

        Arc::new(Session {
            peer,
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            counters,
            in_flight,
            cancel,
            closed,
        })
    }

    pub fn peer(&self) -> NodeId {
        self.peer
    }

    pub fn counters(&self) -> &LinkCounters {
        &self.counters
    }

    /// Send a request and wait for its response. The call counts as in flight.
    pub async fn call(&self, request: PeerRequest, timeout: Duration) -> MeshResult<PeerResponse> {
        let _guard = self.in_flight.acquire();
        self.call_untracked(request, timeout).await
    }

    async fn call_untracked(
        &self,
        request: PeerRequest,
        timeout: Duration,
    ) -> MeshResult<PeerResponse> {
        if self.is_closed() {
            return Err(MeshError::Unavailable(format!(
                "connection to {} is closed",
                self.peer
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let envelope = Envelope {
            id,
            body: Body::Request(request),
        };
        if self.outbound.send(Outbound::Frame(envelope)).await.is_err() {
            self.pending.remove(&id);
            return Err(MeshError::Unavailable(format!(
                "connection to {} is closed",
                self.peer
            )));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => Err(MeshError::Unavailable(format!(
                "connection to {} closed before a response arrived",
                self.peer
            ))),
            Err(_) => {
                self.pending.remove(&id);
                Err(MeshError::DeadlineExceeded(format!(
                    "no response from {} within {:?}",
                    self.peer, timeout
                )))
            }
        }
    }

    /// Round-trip a keepalive probe and record the RTT. Probes do not count
    /// as in flight, so they never block a drain.
    pub async fn ping(&self, timeout: Duration) -> MeshResult<Duration> {
        let nonce: u64 = rand::random();
        let start = Instant::now();
        match self
            .call_untracked(PeerRequest::Ping { nonce }, timeout)
            .await?
        {
            PeerResponse::Pong { nonce: echoed } if echoed == nonce => {
                let rtt = start.elapsed();
                self.counters
                    .rtt_micros
                    .store(rtt.as_micros() as u64, Ordering::Relaxed);
                Ok(rtt)
            }
            other => Err(crate::wire::unexpected("pong", &other)),
        }
    }

    pub fn lease(&self) -> InFlightGuard {
        self.in_flight.acquire()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.count()
    }

    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.in_flight.wait_idle(timeout).await
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.cancel.is_cancelled()
    }

    /// Resolves once the reader task has finished.
    pub async fn closed(&self) {
        let mut rx = self.closed.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn write_loop(
    mut sink: FrameSink,
    mut rx: mpsc::Receiver<Outbound>,
    counters: Arc<LinkCounters>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(Outbound::Frame(envelope)) => match sink.send(&envelope).await {
                    Ok(len) => {
                        counters.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        log::debug!("Writer stopping: {}", e);
                        break;
                    }
                },
                Some(Outbound::Close) | None => break,
            }
        }
    }
    sink.close().await;
    cancel.cancel();
}

struct ReadContext {
    peer: NodeId,
    stream: FrameStream,
    outbound: mpsc::Sender<Outbound>,
    pending: Pending,
    counters: Arc<LinkCounters>,
    in_flight: Arc<InFlight>,
    handler: Arc<dyn RequestHandler>,
    cancel: CancellationToken,
    closed_tx: watch::Sender<bool>,
}

async fn read_loop(mut ctx: ReadContext) {
    loop {
        let frame = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            frame = ctx.stream.recv() => frame,
        };
        let (envelope, len) = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::debug!("Peer {} closed the connection", ctx.peer);
                break;
            }
            Err(e) => {
                log::debug!("Reader stopping for {}: {}", ctx.peer, e);
                break;
            }
        };
        ctx.counters
            .bytes_received
            .fetch_add(len as u64, Ordering::Relaxed);

        match envelope.body {
            Body::Response(response) => {
                if let Some((_, tx)) = ctx.pending.remove(&envelope.id) {
                    let _ = tx.send(response);
                }
            }
            Body::Request(PeerRequest::Ping { nonce }) => {
                let pong = Envelope {
                    id: envelope.id,
                    body: Body::Response(PeerResponse::Pong { nonce }),
                };
                let _ = ctx.outbound.send(Outbound::Frame(pong)).await;
            }
            Body::Request(request) => {
                let guard = ctx.in_flight.acquire();
                let handler = ctx.handler.clone();
                let outbound = ctx.outbound.clone();
                let peer = ctx.peer;
                let id = envelope.id;
                tokio::spawn(async move {
                    let reply = handler.handle(peer, request).await;
                    let frame = Envelope {
                        id,
                        body: Body::Response(reply.response),
                    };
                    let _ = outbound.send(Outbound::Frame(frame)).await;
                    if reply.close_after {
                        let _ = outbound.send(Outbound::Close).await;
                    }
                    drop(guard);
                });
            }
        }
    }
    ctx.cancel.cancel();
    // Dropping the senders fails every outstanding call.
    ctx.pending.clear();
    let _ = ctx.closed_tx.send(true);
}
