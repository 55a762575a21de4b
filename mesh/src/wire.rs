//! Peer protocol messages and length-delimited framing.
//!
//! Every frame is one JSON [`Envelope`]. Handshakes run on a bare [`Link`]
//! with envelope id 0; once a link is registered as a connection it is split
//! and driven by a [`crate::session::Session`].

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::{
    directory::{DirectoryDelta, DirectorySnapshot},
    error::{ErrorCode, MeshError, MeshResult},
    strategy::JoinStrategy,
    transport::{BoxedStream, RawConnection},
    types::{MemberRecord, MeshId, MeshRecord, MeshSettings, NodeDescriptor, NodeId},
};

/// Envelope id used by handshake exchanges on a bare link.
pub const HANDSHAKE_ID: u64 = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Body {
    Request(PeerRequest),
    Response(PeerResponse),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerRequest {
    /// Opens a plain connection between members of the same mesh. The
    /// acceptor answers with [`PeerResponse::Welcome`], signing `challenge`.
    Hello {
        node: NodeDescriptor,
        mesh_id: Option<MeshId>,
        challenge: String,
    },
    /// The dialer's signature over the challenge carried by `Welcome`.
    HelloConfirm {
        signature: String,
    },
    Ping {
        nonce: u64,
    },
    JoinRequest {
        candidate: NodeDescriptor,
        join_key: Option<String>,
        strategy: JoinStrategy,
    },
    JoinConfirm {
        signature: String,
        node_settings: MeshSettings,
    },
    Invite {
        mesh: MeshRecord,
        inviter: MemberRecord,
        strategy: JoinStrategy,
        nonce: String,
    },
    InviteCommit {
        snapshot: DirectorySnapshot,
    },
    Leave {
        mesh_id: MeshId,
        node_id: NodeId,
    },
    Reset(ResetOrder),
    Delta {
        mesh_id: MeshId,
        origin: NodeId,
        delta: DirectoryDelta,
    },
    SyncRequest {
        mesh_id: MeshId,
    },
}

impl PeerRequest {
    pub fn name(&self) -> &'static str {
        match self {
            PeerRequest::Hello { .. } => "hello",
            PeerRequest::HelloConfirm { .. } => "hello_confirm",
            PeerRequest::Ping { .. } => "ping",
            PeerRequest::JoinRequest { .. } => "join_request",
            PeerRequest::JoinConfirm { .. } => "join_confirm",
            PeerRequest::Invite { .. } => "invite",
            PeerRequest::InviteCommit { .. } => "invite_commit",
            PeerRequest::Leave { .. } => "leave",
            PeerRequest::Reset(_) => "reset",
            PeerRequest::Delta { .. } => "delta",
            PeerRequest::SyncRequest { .. } => "sync_request",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerResponse {
    Welcome {
        node: NodeDescriptor,
        /// Signature over the dialer's challenge.
        signature: String,
        /// For the dialer to sign in `HelloConfirm`.
        challenge: String,
    },
    Pong {
        nonce: u64,
    },
    JoinOffer {
        mesh: MeshRecord,
        sponsor: MemberRecord,
        challenge: String,
    },
    JoinCommitted {
        mesh: MeshRecord,
        sponsor: MemberRecord,
        admitted: MemberRecord,
    },
    InviteAccepted {
        member: NodeDescriptor,
        node_settings: MeshSettings,
        signature: String,
    },
    Snapshot {
        snapshot: DirectorySnapshot,
    },
    Ack,
    Rejected {
        code: ErrorCode,
        message: String,
    },
}

/// An evicting member's signed instruction for `target` to return to clean.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetOrder {
    pub mesh_id: MeshId,
    pub requested_by: NodeId,
    pub target: NodeId,
    pub nonce: String,
    /// `requested_by`'s signature over [`crate::identity::reset_proof`].
    pub signature: String,
}

impl PeerResponse {
    pub fn rejected(err: &MeshError) -> Self {
        PeerResponse::Rejected {
            code: err.code(),
            message: err.message().to_string(),
        }
    }

    /// Turn a `Rejected` response back into the peer's error.
    pub fn into_result(self) -> MeshResult<PeerResponse> {
        match self {
            PeerResponse::Rejected { code, message } => Err(MeshError::from_code(code, message)),
            other => Ok(other),
        }
    }
}

/// Error for a response of the wrong shape.
pub fn unexpected(expected: &str, got: &PeerResponse) -> MeshError {
    MeshError::Unavailable(format!("protocol violation: expected {expected}, got {got:?}"))
}

pub fn encode(envelope: &Envelope) -> MeshResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(envelope)?))
}

pub fn decode(frame: &[u8]) -> MeshResult<Envelope> {
    Ok(serde_json::from_slice(frame)?)
}

fn codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

/// Write half of a link.
pub struct FrameSink {
    inner: FramedWrite<WriteHalf<BoxedStream>, LengthDelimitedCodec>,
}

impl FrameSink {
    /// Send one envelope, returning the number of payload bytes written.
    pub async fn send(&mut self, envelope: &Envelope) -> MeshResult<usize> {
        let bytes = encode(envelope)?;
        let len = bytes.len();
        self.inner
            .send(bytes)
            .await
            .map_err(|e| MeshError::Unavailable(format!("send failed: {e}")))?;
        Ok(len)
    }

    pub async fn close(&mut self) {
        let _ = SinkExt::<Bytes>::close(&mut self.inner).await;
    }
}

/// Read half of a link.
pub struct FrameStream {
    inner: FramedRead<ReadHalf<BoxedStream>, LengthDelimitedCodec>,
}

impl FrameStream {
    /// Next envelope with its payload size, or `None` once the peer closed.
    pub async fn recv(&mut self) -> MeshResult<Option<(Envelope, usize)>> {
        match self.inner.next().await {
            Some(Ok(frame)) => Ok(Some((decode(&frame)?, frame.len()))),
            Some(Err(e)) => Err(MeshError::Unavailable(format!("read failed: {e}"))),
            None => Ok(None),
        }
    }
}

/// A framed bidirectional stream that is not yet a registered connection.
pub struct Link {
    sink: FrameSink,
    stream: FrameStream,
    remote_addr: String,
    is_tls: bool,
    bytes_sent: u64,
    bytes_received: u64,
}

impl Link {
    pub fn new(raw: RawConnection, max_frame_bytes: usize) -> Self {
        let (read, write) = tokio::io::split(raw.stream);
        Self {
            sink: FrameSink {
                inner: FramedWrite::new(write, codec(max_frame_bytes)),
            },
            stream: FrameStream {
                inner: FramedRead::new(read, codec(max_frame_bytes)),
            },
            remote_addr: raw.remote_addr,
            is_tls: raw.is_tls,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn is_tls(&self) -> bool {
        self.is_tls
    }

    /// Bytes moved during the handshake, carried into the connection counters.
    pub fn traffic(&self) -> (u64, u64) {
        (self.bytes_sent, self.bytes_received)
    }

    pub async fn send_request(&mut self, request: PeerRequest) -> MeshResult<()> {
        self.send(Body::Request(request)).await
    }

    pub async fn send_response(&mut self, response: PeerResponse) -> MeshResult<()> {
        self.send(Body::Response(response)).await
    }

    async fn send(&mut self, body: Body) -> MeshResult<()> {
        let envelope = Envelope {
            id: HANDSHAKE_ID,
            body,
        };
        let len = self.sink.send(&envelope).await?;
        self.bytes_sent += len as u64;
        Ok(())
    }

    async fn recv_body(&mut self) -> MeshResult<Body> {
        match self.stream.recv().await? {
            Some((envelope, len)) => {
                self.bytes_received += len as u64;
                Ok(envelope.body)
            }
            None => Err(MeshError::Unavailable("peer closed the link".to_string())),
        }
    }

    /// Report `err` to the peer as a rejection and return it.
    pub async fn reject<T>(&mut self, err: MeshError) -> MeshResult<T> {
        let _ = self.send_response(PeerResponse::rejected(&err)).await;
        Err(err)
    }

    /// Wait for the next request from the peer.
    pub async fn recv_request(&mut self, timeout: Duration) -> MeshResult<PeerRequest> {
        match tokio::time::timeout(timeout, self.recv_body()).await?? {
            Body::Request(request) => Ok(request),
            Body::Response(response) => Err(unexpected("a request", &response)),
        }
    }

    /// One request/response round trip. A `Rejected` reply becomes the
    /// peer's error.
    pub async fn call(&mut self, request: PeerRequest, timeout: Duration) -> MeshResult<PeerResponse> {
        let exchange = async {
            self.send_request(request).await?;
            match self.recv_body().await? {
                Body::Response(response) => response.into_result(),
                Body::Request(request) => Err(MeshError::Unavailable(format!(
                    "protocol violation: expected a response, got {}",
                    request.name()
                ))),
            }
        };
        tokio::time::timeout(timeout, exchange).await?
    }

    pub async fn close(mut self) {
        self.sink.close().await;
    }

    pub fn into_parts(self) -> (FrameSink, FrameStream) {
        (self.sink, self.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryNetwork, Transport};

    async fn link_pair() -> (Link, Link) {
        let network = MemoryNetwork::new();
        let mut listener = network
            .transport("10.0.0.2:1")
            .listen("10.0.0.2:1")
            .await
            .unwrap();
        let out = network.transport("10.0.0.1:1").dial("10.0.0.2:1").await.unwrap();
        let inbound = listener.accept().await.unwrap();
        (Link::new(out, 1024 * 1024), Link::new(inbound, 1024 * 1024))
    }

    #[tokio::test]
    async fn test_call_maps_rejection_to_error() {
        let (mut client, mut server) = link_pair().await;
        let server_task = tokio::spawn(async move {
            let request = server.recv_request(Duration::from_secs(1)).await.unwrap();
            assert_eq!(request.name(), "ping");
            server
                .send_response(PeerResponse::rejected(&MeshError::PermissionDenied(
                    "closed mesh".into(),
                )))
                .await
                .unwrap();
        });

        let result = client
            .call(PeerRequest::Ping { nonce: 7 }, Duration::from_secs(1))
            .await;
        assert_eq!(result, Err(MeshError::PermissionDenied("closed mesh".into())));
        server_task.await.unwrap();
        assert!(client.traffic().0 > 0);
    }

    #[tokio::test]
    async fn test_call_times_out_without_reply() {
        let (mut client, _server) = link_pair().await;
        let result = client
            .call(PeerRequest::Ping { nonce: 1 }, Duration::from_millis(30))
            .await;
        assert!(matches!(result, Err(MeshError::DeadlineExceeded(_))));
    }

    #[tokio::test]
    async fn test_closed_peer_is_unavailable() {
        let (mut client, server) = link_pair().await;
        server.close().await;
        let result = client
            .call(PeerRequest::Ping { nonce: 1 }, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(MeshError::Unavailable(_))));
    }

    #[test]
    fn test_envelope_is_tagged_json() {
        let envelope = Envelope {
            id: 3,
            body: Body::Request(PeerRequest::SyncRequest {
                mesh_id: MeshId::new(),
            }),
        };
        let json: serde_json::Value = serde_json::from_slice(&encode(&envelope).unwrap()).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["body"]["request"]["type"], "sync_request");
        assert_eq!(decode(&encode(&envelope).unwrap()).unwrap(), envelope);
    }
}
