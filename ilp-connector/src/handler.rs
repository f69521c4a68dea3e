//! `ForwardingHandler`: the per-packet state machine that resolves a route,
//! checks the local credit limit, forwards to the next hop, and verifies
//! the fulfillment before settling and answering upstream. One instance is
//! shared by every `PeerTransport` the node owns.

use std::sync::{Arc, Weak};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use ilp_btp::{PacketHandler, ProtocolData, TransportError};
use ilp_packet::{Address, ErrorCode, Fulfill, Packet, Prepare, Reject};
use ilp_router::RoutingTable;
use ilp_settlement::{SettlementBookkeeper, SettlementError};
use parking_lot::RwLock;
use ring::digest::{digest, SHA256};
use tracing::{debug, warn};

use crate::registry::PeerRegistry;
use crate::telemetry::{ForwardResult, TelemetryBus, TelemetryEvent};
use crate::trace::HopTrace;

/// The token every peer account is kept under until the connector is
/// configured for genuine multi-asset support — out of scope per spec.
pub const DEFAULT_TOKEN_ID: &str = "default";

pub struct ForwardingHandler {
    node_id: String,
    router: Arc<RoutingTable>,
    registry: RwLock<Weak<PeerRegistry>>,
    bookkeeper: Arc<SettlementBookkeeper>,
    telemetry: TelemetryBus,
    min_expiry_margin: ChronoDuration,
    max_hops: u32,
}

impl ForwardingHandler {
    /// `registry` is supplied later via `bind_registry` once it exists,
    /// since `PeerRegistry::new` itself needs a handler instance to hand to
    /// `ilp_btp::dial`/`accept` — a real `Arc` cycle here would keep both
    /// alive forever, so this side only ever holds a `Weak` reference.
    pub fn new(
        node_id: String,
        router: Arc<RoutingTable>,
        bookkeeper: Arc<SettlementBookkeeper>,
        telemetry: TelemetryBus,
        min_expiry_margin: StdDuration,
        max_hops: u32,
    ) -> Arc<Self> {
        Arc::new(ForwardingHandler {
            node_id,
            router,
            registry: RwLock::new(Weak::new()),
            bookkeeper,
            telemetry,
            min_expiry_margin: ChronoDuration::from_std(min_expiry_margin)
                .unwrap_or_else(|_| ChronoDuration::milliseconds(1_000)),
            max_hops,
        })
    }

    pub fn bind_registry(&self, registry: &Arc<PeerRegistry>) {
        *self.registry.write() = Arc::downgrade(registry);
    }

    fn registry(&self) -> Option<Arc<PeerRegistry>> {
        self.registry.read().upgrade()
    }

    fn reject(&self, code: ErrorCode, message: impl Into<String>) -> Bytes {
        Reject {
            code,
            message: message.into(),
            triggered_by: Address::new(&self.node_id).ok(),
            data: Bytes::new(),
        }
        .to_bytes()
    }
}

#[async_trait]
impl PacketHandler for ForwardingHandler {
    async fn handle(&self, source_peer_id: &str, ilp_packet: Bytes, protocol_data: &[ProtocolData]) -> Bytes {
        let start = std::time::Instant::now();
        let (destination, amount, result_bytes) =
            self.forward(source_peer_id, ilp_packet, protocol_data).await;

        let result = match Packet::from_bytes(&result_bytes) {
            Ok(Packet::Fulfill(_)) => ForwardResult::Fulfilled,
            Ok(Packet::Reject(r)) => ForwardResult::Rejected(r.code.as_str().to_owned()),
            _ => ForwardResult::Rejected("T00".to_owned()),
        };
        self.telemetry.publish(TelemetryEvent::PacketForwarded {
            node_id: self.node_id.clone(),
            source_peer_id: source_peer_id.to_owned(),
            // resolved inside forward() but not threaded back out; a route
            // miss/peer-down rejection never reached a next hop anyway.
            next_hop_peer_id: None,
            destination: destination.unwrap_or_default(),
            amount: amount.unwrap_or(0),
            result,
            duration_micros: start.elapsed().as_micros() as u64,
        });
        result_bytes
    }
}

impl ForwardingHandler {
    async fn forward(
        &self,
        source_peer_id: &str,
        ilp_packet: Bytes,
        protocol_data: &[ProtocolData],
    ) -> (Option<String>, Option<u64>, Bytes) {
        let prepare = match Packet::from_bytes(&ilp_packet) {
            Ok(Packet::Prepare(p)) => p,
            Ok(_) => return (None, None, self.reject(ErrorCode::F01_INVALID_PACKET, "expected a Prepare packet")),
            Err(e) => return (None, None, self.reject(ErrorCode::F01_INVALID_PACKET, e.to_string())),
        };
        let destination = prepare.destination.as_str().to_owned();

        let now = Utc::now();
        if prepare.is_expired(now) {
            return (
                Some(destination),
                Some(prepare.amount),
                self.reject(ErrorCode::R00_TRANSFER_TIMED_OUT, "prepare already expired on arrival"),
            );
        }
        let time_left = prepare.expires_at - now;
        if time_left < self.min_expiry_margin {
            return (
                Some(destination),
                Some(prepare.amount),
                self.reject(ErrorCode::R02_INSUFFICIENT_TIMEOUT, "not enough time left to forward safely"),
            );
        }

        let incoming_trace = match HopTrace::from_protocol_data(protocol_data) {
            Ok(trace) => trace,
            Err(e) => {
                return (
                    Some(destination),
                    Some(prepare.amount),
                    self.reject(ErrorCode::F01_INVALID_PACKET, e.to_string()),
                )
            }
        };
        if incoming_trace.contains(&self.node_id) || incoming_trace.hop_count() as u32 >= self.max_hops {
            warn!(destination = %destination, hops = incoming_trace.hop_count(), "forwarding loop detected");
            return (
                Some(destination),
                Some(prepare.amount),
                self.reject(ErrorCode::T00_INTERNAL_ERROR, "loop"),
            );
        }

        let Some(next_hop) = self.router.next_hop_for(&prepare.destination) else {
            return (
                Some(destination),
                Some(prepare.amount),
                self.reject(ErrorCode::F02_UNREACHABLE, "no route to destination"),
            );
        };

        if next_hop == self.node_id {
            return (
                Some(destination),
                Some(prepare.amount),
                self.reject(ErrorCode::F02_UNREACHABLE, "next hop resolves to this node, local delivery is not supported"),
            );
        }

        let Some(registry) = self.registry() else {
            return (
                Some(destination),
                Some(prepare.amount),
                self.reject(ErrorCode::T00_INTERNAL_ERROR, "node is shutting down"),
            );
        };
        let Some(transport) = registry.get_transport(&next_hop) else {
            return (
                Some(destination),
                Some(prepare.amount),
                self.reject(ErrorCode::T01_PEER_UNREACHABLE, format!("peer {next_hop} has never connected")),
            );
        };
        if transport.state() != ilp_btp::PeerState::Ready {
            return (
                Some(destination),
                Some(prepare.amount),
                self.reject(ErrorCode::T01_PEER_UNREACHABLE, format!("peer {next_hop} is not connected")),
            );
        }

        if let Err(e) = self
            .bookkeeper
            .can_accept(source_peer_id, DEFAULT_TOKEN_ID, prepare.amount)
            .await
        {
            return (
                Some(destination),
                Some(prepare.amount),
                match e {
                    SettlementError::LimitExceeded { would_exceed_by, .. } => self.reject(
                        ErrorCode::T04_INSUFFICIENT_LIQUIDITY,
                        format!("credit limit exceeded by {would_exceed_by}"),
                    ),
                    other => {
                        warn!(error = %other, "internal error while checking credit limit");
                        self.reject(ErrorCode::T00_INTERNAL_ERROR, "internal error")
                    }
                },
            );
        }

        let fee = self
            .bookkeeper
            .fee_for(source_peer_id, DEFAULT_TOKEN_ID, prepare.amount)
            .await;
        let outgoing_amount = prepare.amount.saturating_sub(fee);
        let outgoing_expires_at = prepare.expires_at - self.min_expiry_margin;

        let outgoing_prepare = Prepare {
            amount: outgoing_amount,
            expires_at: outgoing_expires_at,
            execution_condition: prepare.execution_condition,
            destination: prepare.destination.clone(),
            data: prepare.data.clone(),
        };
        let outgoing_trace = incoming_trace.extended_with(&self.node_id).to_protocol_data();
        let deadline = (time_left - self.min_expiry_margin)
            .to_std()
            .unwrap_or(StdDuration::from_millis(0));

        let response = transport
            .send_packet_with_extra(outgoing_prepare.to_bytes(), &[outgoing_trace], deadline)
            .await;

        let response_bytes = match response {
            Ok(bytes) => bytes,
            Err(TransportError::Timeout { .. }) => {
                return (
                    Some(destination),
                    Some(prepare.amount),
                    self.reject(ErrorCode::R00_TRANSFER_TIMED_OUT, "no response from next hop before deadline"),
                )
            }
            Err(TransportError::QueueFull { .. }) => {
                // see DESIGN.md: local back-pressure (pending map or outbound
                // queue exhaustion) is read as connector-side congestion, not
                // the remote peer being busy.
                return (
                    Some(destination),
                    Some(prepare.amount),
                    self.reject(ErrorCode::T03_CONNECTOR_BUSY, "connector is overloaded"),
                );
            }
            Err(TransportError::NotConnected { .. }) => {
                return (
                    Some(destination),
                    Some(prepare.amount),
                    self.reject(ErrorCode::T01_PEER_UNREACHABLE, format!("peer {next_hop} disconnected mid-flight")),
                )
            }
            Err(e) => {
                warn!(peer = %next_hop, error = %e, "internal error while forwarding to next hop");
                return (
                    Some(destination),
                    Some(prepare.amount),
                    self.reject(ErrorCode::T00_INTERNAL_ERROR, "internal error"),
                )
            }
        };

        match Packet::from_bytes(&response_bytes) {
            Ok(Packet::Fulfill(fulfill)) => {
                if !fulfillment_matches(&fulfill, &prepare.execution_condition) {
                    warn!(
                        peer = %next_hop,
                        fulfillment = %hex::encode(fulfill.fulfillment),
                        condition = %hex::encode(prepare.execution_condition),
                        "peer returned a fulfillment that does not match the condition, treating as a protocol violation"
                    );
                    return (
                        Some(destination),
                        Some(prepare.amount),
                        self.reject(ErrorCode::R99_APPLICATION_ERROR, "fulfillment did not match condition"),
                    );
                }

                if let Err(e) = self
                    .bookkeeper
                    .commit(
                        source_peer_id,
                        DEFAULT_TOKEN_ID,
                        prepare.amount,
                        &next_hop,
                        DEFAULT_TOKEN_ID,
                        outgoing_amount,
                    )
                    .await
                {
                    warn!(error = %e, "failed to commit settlement ledger after a successful forward");
                }

                debug!(peer = %next_hop, destination = %destination, "forward fulfilled");
                (Some(destination), Some(prepare.amount), fulfill.to_bytes())
            }
            Ok(Packet::Reject(reject)) => (Some(destination), Some(prepare.amount), reject.to_bytes()),
            Ok(Packet::Prepare(_)) => (
                Some(destination),
                Some(prepare.amount),
                self.reject(ErrorCode::T00_INTERNAL_ERROR, "next hop answered with a Prepare"),
            ),
            Err(e) => {
                warn!(peer = %next_hop, error = %e, "next hop answered with an unparseable packet");
                (
                    Some(destination),
                    Some(prepare.amount),
                    self.reject(ErrorCode::T00_INTERNAL_ERROR, "internal error"),
                )
            }
        }
    }
}

fn fulfillment_matches(fulfill: &Fulfill, execution_condition: &[u8; 32]) -> bool {
    let generated = digest(&SHA256, &fulfill.fulfillment);
    generated.as_ref() == execution_condition
}
