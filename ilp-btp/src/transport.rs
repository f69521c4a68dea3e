//! `PeerTransport`: one BTP-over-WebSocket connection to a peer, usable
//! symmetrically whether this side dialed out (`dial`) or accepted an
//! inbound connection (`accept`). After the auth handshake both roles run
//! the exact same read/write loop, and both publish into the same
//! `PeerTransport` handle so callers never need to know which role
//! established the connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::random;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tungstenite::Message as WsMessage;
use url::Url;

use crate::envelope::{BtpError, BtpFrame, BtpMessage, BtpResponse, ContentType, ProtocolData};
use crate::errors::TransportError;

/// Cap on requests awaiting a response before `send_packet` fails locally
/// rather than growing the pending map without bound.
pub const DEFAULT_MAX_PENDING_REQUESTS: usize = 10_000;
const OUTBOUND_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Reconnecting,
}

/// Handles ILP packets carried inside incoming BTP `Message` frames,
/// returning the OER-encoded Fulfill or Reject to answer with. The full
/// incoming protocol data list is passed alongside the extracted `"ilp"`
/// payload so a handler can read sibling entries (e.g. a hop-trace) that
/// never touch the ILP packet bytes themselves.
#[async_trait]
pub trait PacketHandler: Send + Sync {
    async fn handle(&self, peer_id: &str, ilp_packet: Bytes, protocol_data: &[ProtocolData]) -> Bytes;
}

struct PendingRequests {
    inner: Mutex<HashMap<u32, oneshot::Sender<BtpFrame>>>,
    max: usize,
    late_responses: AtomicU32,
}

impl PendingRequests {
    fn new(max: usize) -> Self {
        PendingRequests {
            inner: Mutex::new(HashMap::new()),
            max,
            late_responses: AtomicU32::new(0),
        }
    }

    fn insert(&self, request_id: u32, responder: oneshot::Sender<BtpFrame>) -> Result<(), ()> {
        let mut inner = self.inner.lock();
        if inner.len() >= self.max {
            return Err(());
        }
        inner.insert(request_id, responder);
        Ok(())
    }

    /// Removes a pending entry without completing it, for the case where
    /// the caller's deadline already fired; a response that shows up after
    /// this point is discarded and counted instead of delivered.
    fn discard(&self, request_id: u32) {
        self.inner.lock().remove(&request_id);
    }

    fn complete(&self, request_id: u32, frame: BtpFrame) {
        match self.inner.lock().remove(&request_id) {
            Some(tx) => {
                let _ = tx.send(frame);
            }
            None => {
                self.late_responses.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().len()
    }

    fn late_response_count(&self) -> u32 {
        self.late_responses.load(Ordering::Relaxed)
    }
}

/// A live (or momentarily reconnecting) connection to one peer.
pub struct PeerTransport {
    peer_id: Arc<str>,
    outbound: Mutex<Option<mpsc::Sender<WsMessage>>>,
    pending: PendingRequests,
    next_request_id: AtomicU32,
    state: RwLock<PeerState>,
}

impl PeerTransport {
    fn new(peer_id: Arc<str>, max_pending_requests: usize, initial_state: PeerState) -> Arc<Self> {
        Arc::new(PeerTransport {
            peer_id,
            outbound: Mutex::new(None),
            pending: PendingRequests::new(max_pending_requests),
            next_request_id: AtomicU32::new(random()),
            state: RwLock::new(initial_state),
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn state(&self) -> PeerState {
        *self.state.read()
    }

    pub fn pending_request_count(&self) -> usize {
        self.pending.len()
    }

    /// Responses that arrived after their request's deadline had already
    /// fired and been reaped. Surfaced for telemetry, not acted on.
    pub fn late_response_count(&self) -> u32 {
        self.pending.late_response_count()
    }

    /// Sends an ILP packet to the peer and awaits the correlated response
    /// or `deadline`, whichever comes first. Fails locally (without
    /// touching the network) if the pending-request map is already at
    /// capacity or the outbound queue has no room. Also accepts an
    /// optional extra protocol-data entry (used to carry the hop-count
    /// trace alongside the `"ilp"` payload without touching it).
    pub async fn send_packet(&self, ilp_packet: Bytes, deadline: Duration) -> Result<Bytes, TransportError> {
        self.send_packet_with_extra(ilp_packet, &[], deadline).await
    }

    pub async fn send_packet_with_extra(
        &self,
        ilp_packet: Bytes,
        extra_protocol_data: &[ProtocolData],
        deadline: Duration,
    ) -> Result<Bytes, TransportError> {
        let sender = self
            .outbound
            .lock()
            .clone()
            .ok_or_else(|| TransportError::NotConnected {
                peer_id: self.peer_id.to_string(),
            })?;

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .insert(request_id, tx)
            .map_err(|_| TransportError::QueueFull {
                peer_id: self.peer_id.to_string(),
            })?;

        let mut protocol_data = vec![ProtocolData::ilp(ilp_packet.to_vec())];
        protocol_data.extend_from_slice(extra_protocol_data);
        let message = BtpMessage {
            request_id,
            protocol_data,
        };
        if sender.try_send(WsMessage::Binary(message.to_bytes())).is_err() {
            self.pending.discard(request_id);
            return Err(TransportError::QueueFull {
                peer_id: self.peer_id.to_string(),
            });
        }

        let frame = match timeout(deadline, rx).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) => return Err(TransportError::ShuttingDown),
            Err(_) => {
                self.pending.discard(request_id);
                return Err(TransportError::Timeout { request_id });
            }
        };

        match frame {
            BtpFrame::Response(BtpResponse { protocol_data, .. }) => protocol_data
                .into_iter()
                .find(|p| p.protocol_name == "ilp")
                .map(|p| Bytes::from(p.data))
                .ok_or_else(|| TransportError::Decode("response carried no ilp data".into())),
            BtpFrame::Error(err) => Err(TransportError::AuthRejected {
                peer_id: self.peer_id.to_string(),
                reason: format!("{}: {}", err.code, err.name),
            }),
            BtpFrame::Message(_) | BtpFrame::Transfer(_) => Err(TransportError::Decode(
                "peer answered a request with a non-response frame".into(),
            )),
        }
    }
}

fn extract_ilp_payload(protocol_data: &[ProtocolData]) -> Option<Bytes> {
    protocol_data
        .iter()
        .find(|p| p.protocol_name == "ilp")
        .map(|p| Bytes::from(p.data.clone()))
}

/// Runs the shared read/write loop for an already-authenticated connection,
/// publishing the outbound sender and `Ready` state directly into
/// `transport`. Returns once the socket closes or `cancel` fires.
async fn run_connection<T>(ws: T, transport: Arc<PeerTransport>, handler: Arc<dyn PacketHandler>, cancel: CancellationToken)
where
    T: Stream<Item = Result<WsMessage, tungstenite::Error>>
        + Sink<WsMessage, Error = tungstenite::Error>
        + Unpin
        + Send,
{
    let (mut sink, mut stream) = ws.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<WsMessage>(OUTBOUND_QUEUE_CAPACITY);
    *transport.outbound.lock() = Some(outbound_tx.clone());
    *transport.state.write() = PeerState::Ready;

    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                msg = outbound_rx.recv() => match msg {
                    Some(msg) => {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
        let _ = sink.close().await;
    });

    let peer_id = transport.peer_id.clone();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = stream.next() => {
                let Some(frame) = frame else { break };
                let frame = match frame {
                    Ok(WsMessage::Binary(bytes)) => BtpFrame::from_bytes(&bytes),
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(peer = %peer_id, error = %e, "websocket error, closing connection");
                        break;
                    }
                };
                let frame = match frame {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(peer = %peer_id, error = %e, "discarding malformed BTP frame");
                        continue;
                    }
                };
                match frame {
                    BtpFrame::Message(msg) => {
                        let Some(ilp_packet) = extract_ilp_payload(&msg.protocol_data) else {
                            continue;
                        };
                        let handler = handler.clone();
                        let peer_id = peer_id.clone();
                        let outbound_tx = outbound_tx.clone();
                        let protocol_data = msg.protocol_data.clone();
                        tokio::spawn(async move {
                            let response_bytes = handler.handle(&peer_id, ilp_packet, &protocol_data).await;
                            let response = BtpResponse {
                                request_id: msg.request_id,
                                protocol_data: vec![ProtocolData::ilp(response_bytes.to_vec())],
                            };
                            let _ = outbound_tx.send(WsMessage::Binary(response.to_bytes())).await;
                        });
                    }
                    other @ (BtpFrame::Response(_) | BtpFrame::Error(_)) => {
                        transport.pending.complete(other.request_id(), other);
                    }
                    BtpFrame::Transfer(_) => {
                        debug!(peer = %peer_id, "ignoring TRANSFER frame, not used by this connector");
                    }
                }
            }
        }
    }

    *transport.state.write() = PeerState::Disconnected;
    *transport.outbound.lock() = None;
    writer.abort();
    debug!(peer = %peer_id, "connection loop exited");
}

fn auth_message(username: &str, token: &str) -> BtpMessage {
    BtpMessage {
        request_id: random(),
        protocol_data: vec![
            ProtocolData {
                protocol_name: "auth".into(),
                content_type: ContentType::ApplicationOctetStream,
                data: vec![],
            },
            ProtocolData {
                protocol_name: "auth_username".into(),
                content_type: ContentType::TextPlainUtf8,
                data: username.as_bytes().to_vec(),
            },
            ProtocolData {
                protocol_name: "auth_token".into(),
                content_type: ContentType::TextPlainUtf8,
                data: token.as_bytes().to_vec(),
            },
        ],
    }
}

/// Dials `url`, performs the BTP auth handshake, and keeps the connection
/// alive in the background, reconnecting with exponential backoff and full
/// jitter whenever the socket drops. Returns immediately with a transport
/// handle that starts in `Connecting` state.
pub fn dial(
    url: Url,
    peer_id: Arc<str>,
    username: String,
    token: String,
    handler: Arc<dyn PacketHandler>,
    max_pending_requests: usize,
    cancel: CancellationToken,
) -> Arc<PeerTransport> {
    let transport = PeerTransport::new(peer_id.clone(), max_pending_requests, PeerState::Connecting);

    tokio::spawn({
        let cancel = cancel.clone();
        let transport = transport.clone();
        async move {
            let mut backoff = ExponentialBackoff {
                initial_interval: INITIAL_BACKOFF,
                max_interval: MAX_BACKOFF,
                max_elapsed_time: None,
                ..ExponentialBackoff::default()
            };
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                *transport.state.write() = PeerState::Connecting;
                match connect_async(url.clone()).await {
                    Ok((ws, _)) => {
                        *transport.state.write() = PeerState::Authenticating;
                        let (mut sink, mut stream) = ws.split();
                        let auth = auth_message(&username, &token);
                        if sink.send(WsMessage::Binary(auth.to_bytes())).await.is_err() {
                            warn!(peer = %peer_id, "failed to send auth message");
                        } else {
                            match timeout(DEFAULT_REQUEST_TIMEOUT, stream.next()).await {
                                Ok(Some(Ok(WsMessage::Binary(bytes)))) => {
                                    match BtpFrame::from_bytes(&bytes) {
                                        Ok(BtpFrame::Response(_)) => {
                                            info!(peer = %peer_id, "BTP auth accepted");
                                            backoff.reset();
                                            if let Ok(ws) = stream.reunite(sink) {
                                                run_connection(ws, transport.clone(), handler.clone(), cancel.clone())
                                                    .await;
                                            }
                                        }
                                        _ => warn!(peer = %peer_id, "BTP auth rejected by peer"),
                                    }
                                }
                                _ => warn!(peer = %peer_id, "no auth response before timeout"),
                            }
                        }
                    }
                    Err(e) => {
                        warn!(peer = %peer_id, error = %e, "failed to connect");
                    }
                }
                if cancel.is_cancelled() {
                    break;
                }
                *transport.state.write() = PeerState::Reconnecting;
                let delay = backoff.next_backoff().unwrap_or(MAX_BACKOFF);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {},
                    _ = cancel.cancelled() => break,
                }
            }
            *transport.state.write() = PeerState::Disconnected;
        }
    });

    transport
}

/// Accepts an already-upgraded WebSocket from a listening server,
/// validates the BTP auth handshake via `authenticate`, and if accepted,
/// spawns the read/write loop and returns a ready transport handle.
/// `authenticate` maps `(username, token)` to the peer id it authenticates
/// as, or `None` if the credentials are not recognized.
pub async fn accept<T, F>(
    ws: T,
    authenticate: F,
    handler: Arc<dyn PacketHandler>,
    max_pending_requests: usize,
    cancel: CancellationToken,
) -> Result<Arc<PeerTransport>, TransportError>
where
    T: Stream<Item = Result<WsMessage, tungstenite::Error>>
        + Sink<WsMessage, Error = tungstenite::Error>
        + Unpin
        + Send
        + 'static,
    F: FnOnce(&str, &str) -> Option<Arc<str>>,
{
    let (mut sink, mut stream) = ws.split();
    let first = timeout(DEFAULT_REQUEST_TIMEOUT, stream.next())
        .await
        .map_err(|_| TransportError::Decode("no auth frame before timeout".into()))?
        .ok_or_else(|| TransportError::Decode("connection closed before auth".into()))??;

    let WsMessage::Binary(bytes) = first else {
        return Err(TransportError::Decode("expected binary auth frame".into()));
    };
    let BtpFrame::Message(msg) = BtpFrame::from_bytes(&bytes)? else {
        return Err(TransportError::Decode("expected Message auth frame".into()));
    };

    let username = msg
        .protocol_data
        .iter()
        .find(|p| p.protocol_name == "auth_username")
        .map(|p| String::from_utf8_lossy(&p.data).into_owned())
        .unwrap_or_default();
    let token = msg
        .protocol_data
        .iter()
        .find(|p| p.protocol_name == "auth_token")
        .map(|p| String::from_utf8_lossy(&p.data).into_owned())
        .unwrap_or_default();

    let peer_id = match authenticate(&username, &token) {
        Some(id) => id,
        None => {
            let error = BtpError {
                request_id: msg.request_id,
                code: "F00".to_owned(),
                name: "NotAcceptedError".to_owned(),
                triggered_at: chrono::Utc::now(),
                data: "invalid credentials".to_owned(),
                protocol_data: vec![],
            };
            let _ = sink.send(WsMessage::Binary(error.to_bytes())).await;
            let _ = sink.close().await;
            return Err(TransportError::AuthRejected {
                peer_id: username,
                reason: "invalid credentials".to_owned(),
            });
        }
    };

    let ack = BtpResponse {
        request_id: msg.request_id,
        protocol_data: vec![],
    };
    sink.send(WsMessage::Binary(ack.to_bytes())).await?;

    let transport = PeerTransport::new(peer_id, max_pending_requests, PeerState::Authenticating);
    let ws = stream
        .reunite(sink)
        .map_err(|_| TransportError::Decode("stream/sink split mismatch".into()))?;

    tokio::spawn({
        let transport = transport.clone();
        async move {
            run_connection(ws, transport, handler, cancel).await;
        }
    });

    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_requests_enforces_capacity() {
        let pending = PendingRequests::new(1);
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        assert!(pending.insert(1, tx1).is_ok());
        assert!(pending.insert(2, tx2).is_err());
    }

    #[test]
    fn pending_requests_complete_removes_entry() {
        let pending = PendingRequests::new(10);
        let (tx, rx) = oneshot::channel();
        pending.insert(1, tx).unwrap();
        let frame = BtpFrame::Response(BtpResponse {
            request_id: 1,
            protocol_data: vec![],
        });
        pending.complete(1, frame.clone());
        assert_eq!(pending.len(), 0);
        assert_eq!(rx.blocking_recv().unwrap(), frame);
    }
}
