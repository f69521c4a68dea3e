//! End-to-end forwarding scenarios driven over real BTP-over-WebSocket
//! connections: a `ConnectorNode` in the middle, with `ilp_btp::dial` used
//! directly to play the upstream sender and downstream peer, mirroring
//! `interledger-btp`'s own `tests/client_server.rs` shape.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use ilp_btp::{PacketHandler, PeerState, ProtocolData, TransportError};
use ilp_connector::{Config, ConnectorNode};
use ilp_packet::{Address, ErrorCode, Fulfill, Packet, Prepare};
use ilp_settlement::{SettlementError, SettlementExecutor};
use ring::digest::{digest, SHA256};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

struct NullExecutor;
#[async_trait]
impl SettlementExecutor for NullExecutor {
    async fn execute(&self, _peer_id: &str, _token_id: &str, _amount: u64, _scale: u8) -> Result<(), SettlementError> {
        Ok(())
    }
}

/// Stands in for a downstream peer that always fulfills, used to play "C".
struct AlwaysFulfills {
    fulfillment: [u8; 32],
}

#[async_trait]
impl PacketHandler for AlwaysFulfills {
    async fn handle(&self, _peer_id: &str, ilp_packet: Bytes, _protocol_data: &[ProtocolData]) -> Bytes {
        match Packet::from_bytes(&ilp_packet) {
            Ok(Packet::Prepare(_)) => Fulfill {
                fulfillment: self.fulfillment,
                data: Bytes::new(),
            }
            .to_bytes(),
            _ => ilp_packet::Reject {
                code: ErrorCode::F00_BAD_REQUEST,
                message: "expected Prepare".to_owned(),
                triggered_by: None,
                data: Bytes::new(),
            }
            .to_bytes(),
        }
    }
}

/// Never responds to a Prepare before the sender's deadline, used for S4.
struct NeverResponds;

#[async_trait]
impl PacketHandler for NeverResponds {
    async fn handle(&self, _peer_id: &str, _ilp_packet: Bytes, _protocol_data: &[ProtocolData]) -> Bytes {
        tokio::time::sleep(Duration::from_secs(60)).await;
        unreachable!("test deadline should fire first")
    }
}

struct Noop;
#[async_trait]
impl PacketHandler for Noop {
    async fn handle(&self, _peer_id: &str, _ilp_packet: Bytes, _protocol_data: &[ProtocolData]) -> Bytes {
        Bytes::new()
    }
}

fn condition_for(fulfillment: &[u8; 32]) -> [u8; 32] {
    let mut condition = [0u8; 32];
    condition.copy_from_slice(digest(&SHA256, fulfillment).as_ref());
    condition
}

/// Spins up a minimal BTP server on `port` backed by `handler`, accepting
/// connections until `cancel` fires.
fn spawn_peer_server(port: u16, authenticate_as: &'static str, handler: Arc<dyn PacketHandler>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        let listener = TcpListener::bind(addr).await.expect("bind mock peer listener");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let Ok((stream, _)) = accepted else { continue };
                    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else { continue };
                    let handler = handler.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        let _ = ilp_btp::accept(
                            ws,
                            move |_username, _token| Some(Arc::from(authenticate_as)),
                            handler,
                            ilp_btp::DEFAULT_MAX_PENDING_REQUESTS,
                            cancel,
                        )
                        .await;
                    });
                }
            }
        }
    });
}

fn node_config(port: u16, peer_c_port: u16, credit_limit: Option<u64>) -> Config {
    let limit_yaml = credit_limit
        .map(|l| format!("\n  defaultCreditLimit: {l}"))
        .unwrap_or_default();
    let yaml = format!(
        r#"
nodeId: node-b
btpServerPort: {port}
peers:
  - id: c
    url: "ws://127.0.0.1:{peer_c_port}"
    authToken: c-secret
routes:
  - prefix: g.c
    nextHop: c
settlement:
  connectorFeePercentage: 0.1{limit_yaml}
minExpiryMarginMs: 200
"#
    );
    Config::from_str(&yaml).expect("valid test config")
}

async fn dial_node_a(btp_port: u16, peer_id: &str, token: &str) -> Arc<ilp_btp::PeerTransport> {
    std::env::set_var(
        format!("BTP_PEER_{}_SECRET", peer_id.to_uppercase()),
        token,
    );
    let url = url::Url::parse(&format!("ws://127.0.0.1:{btp_port}")).unwrap();
    let transport = ilp_btp::dial(
        url,
        Arc::from(peer_id),
        peer_id.to_owned(),
        token.to_owned(),
        Arc::new(Noop),
        ilp_btp::DEFAULT_MAX_PENDING_REQUESTS,
        CancellationToken::new(),
    );
    for _ in 0..200 {
        if transport.state() == PeerState::Ready {
            return transport;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("peer A never reached Ready state");
}

fn prepare(destination: &str, amount: u64, condition: [u8; 32]) -> Prepare {
    Prepare {
        amount,
        expires_at: Utc::now() + ChronoDuration::seconds(10),
        execution_condition: condition,
        destination: Address::new(destination).unwrap(),
        data: Bytes::new(),
    }
}

#[tokio::test]
async fn s1_happy_forward_applies_fee_and_updates_both_ledgers() {
    let cancel = CancellationToken::new();
    let fulfillment = [7u8; 32];
    let condition = condition_for(&fulfillment);
    spawn_peer_server(18901, "node-b", Arc::new(AlwaysFulfills { fulfillment }), cancel.clone());

    let node = ConnectorNode::new(node_config(18902, 18901, None), Arc::new(NullExecutor))
        .await
        .unwrap();
    node.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let a = dial_node_a(18902, "a", "a-secret").await;
    let response = a
        .send_packet(prepare("g.c.receiver", 1000, condition).to_bytes(), Duration::from_secs(5))
        .await
        .unwrap();

    match Packet::from_bytes(&response).unwrap() {
        Packet::Fulfill(f) => assert_eq!(f.fulfillment, fulfillment),
        other => panic!("expected Fulfill, got {other:?}"),
    }

    let a_account = node.bookkeeper().account("a", "default").await;
    assert_eq!(a_account.credit_balance, 1000);
    let c_account = node.bookkeeper().account("c", "default").await;
    assert_eq!(c_account.debit_balance, 999); // 0.1% fee on 1000 -> 1

    std::env::remove_var("BTP_PEER_A_SECRET");
    cancel.cancel();
}

#[tokio::test]
async fn s2_unreachable_destination_rejects_without_touching_balances() {
    let cancel = CancellationToken::new();
    let fulfillment = [1u8; 32];
    let condition = condition_for(&fulfillment);
    spawn_peer_server(18911, "node-b", Arc::new(AlwaysFulfills { fulfillment }), cancel.clone());

    let node = ConnectorNode::new(node_config(18912, 18911, None), Arc::new(NullExecutor))
        .await
        .unwrap();
    node.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let a = dial_node_a(18912, "a2", "a2-secret").await;
    let response = a
        .send_packet(prepare("g.unknown.x", 500, condition).to_bytes(), Duration::from_secs(5))
        .await
        .unwrap();

    match Packet::from_bytes(&response).unwrap() {
        Packet::Reject(r) => assert_eq!(r.code, ErrorCode::F02_UNREACHABLE),
        other => panic!("expected Reject, got {other:?}"),
    }
    assert_eq!(node.bookkeeper().account("a2", "default").await.credit_balance, 0);

    std::env::remove_var("BTP_PEER_A2_SECRET");
    cancel.cancel();
}

#[tokio::test]
async fn s3_peer_down_rejects_with_peer_unreachable() {
    let node = ConnectorNode::new(node_config(18922, 18921, None), Arc::new(NullExecutor))
        .await
        .unwrap();
    node.start().await.unwrap();
    // peer "c" is configured but nothing is listening on 18921, so the
    // dial loop sits in Connecting/Reconnecting and never becomes Ready.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let a = dial_node_a(18922, "a3", "a3-secret").await;
    let fulfillment = [2u8; 32];
    let condition = condition_for(&fulfillment);
    let response = a
        .send_packet(prepare("g.c.receiver", 100, condition).to_bytes(), Duration::from_secs(5))
        .await
        .unwrap();

    match Packet::from_bytes(&response).unwrap() {
        Packet::Reject(r) => assert_eq!(r.code, ErrorCode::T01_PEER_UNREACHABLE),
        other => panic!("expected Reject, got {other:?}"),
    }
    assert_eq!(node.bookkeeper().account("a3", "default").await.credit_balance, 0);

    std::env::remove_var("BTP_PEER_A3_SECRET");
}

#[tokio::test]
async fn s4_downstream_timeout_surfaces_as_transfer_timed_out() {
    let cancel = CancellationToken::new();
    spawn_peer_server(18931, "node-b", Arc::new(NeverResponds), cancel.clone());

    let node = ConnectorNode::new(node_config(18932, 18931, None), Arc::new(NullExecutor))
        .await
        .unwrap();
    node.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let a = dial_node_a(18932, "a4", "a4-secret").await;
    let fulfillment = [3u8; 32];
    let condition = condition_for(&fulfillment);
    // a short-lived prepare so the handler's own deadline (derived from
    // expires_at minus the configured margin) fires quickly.
    let mut p = prepare("g.c.receiver", 100, condition);
    p.expires_at = Utc::now() + ChronoDuration::milliseconds(600);
    let response = a.send_packet(p.to_bytes(), Duration::from_secs(5)).await.unwrap();

    match Packet::from_bytes(&response).unwrap() {
        Packet::Reject(r) => assert_eq!(r.code, ErrorCode::R00_TRANSFER_TIMED_OUT),
        other => panic!("expected Reject, got {other:?}"),
    }
    assert_eq!(node.bookkeeper().account("a4", "default").await.credit_balance, 0);

    std::env::remove_var("BTP_PEER_A4_SECRET");
    cancel.cancel();
}

#[tokio::test]
async fn s5_invalid_fulfillment_is_rejected_and_never_forwarded_upstream() {
    let cancel = CancellationToken::new();
    // the mock peer fulfills with a value that does NOT hash to the
    // condition the Prepare actually carries.
    spawn_peer_server(18941, "node-b", Arc::new(AlwaysFulfills { fulfillment: [9u8; 32] }), cancel.clone());

    let node = ConnectorNode::new(node_config(18942, 18941, None), Arc::new(NullExecutor))
        .await
        .unwrap();
    node.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let a = dial_node_a(18942, "a5", "a5-secret").await;
    let condition = condition_for(&[4u8; 32]); // mismatched on purpose
    let response = a
        .send_packet(prepare("g.c.receiver", 100, condition).to_bytes(), Duration::from_secs(5))
        .await
        .unwrap();

    match Packet::from_bytes(&response).unwrap() {
        Packet::Reject(r) => assert_eq!(r.code, ErrorCode::R99_APPLICATION_ERROR),
        other => panic!("expected Reject, got {other:?}"),
    }
    assert_eq!(node.bookkeeper().account("a5", "default").await.credit_balance, 0);

    std::env::remove_var("BTP_PEER_A5_SECRET");
    cancel.cancel();
}

#[tokio::test]
async fn s6_credit_limit_blocks_the_excess_but_allows_up_to_the_limit() {
    let cancel = CancellationToken::new();
    let fulfillment = [5u8; 32];
    let condition = condition_for(&fulfillment);
    spawn_peer_server(18951, "node-b", Arc::new(AlwaysFulfills { fulfillment }), cancel.clone());

    let node = ConnectorNode::new(node_config(18952, 18951, Some(5000)), Arc::new(NullExecutor))
        .await
        .unwrap();
    node.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let a = dial_node_a(18952, "a6", "a6-secret").await;

    // prime the account to 4500 already outstanding, as S6 assumes.
    let mut account = node.bookkeeper().account("a6", "default").await;
    account.credit_balance = 4500;
    // the bookkeeper only exposes reads; reach the account store through a
    // second forward sized exactly to land on 4500 first.
    drop(account);
    let priming = a
        .send_packet(prepare("g.c.receiver", 4500, condition).to_bytes(), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(matches!(Packet::from_bytes(&priming).unwrap(), Packet::Fulfill(_)));
    assert_eq!(node.bookkeeper().account("a6", "default").await.credit_balance, 4500);

    let over_limit = a
        .send_packet(prepare("g.c.receiver", 600, condition).to_bytes(), Duration::from_secs(5))
        .await
        .unwrap();
    match Packet::from_bytes(&over_limit).unwrap() {
        Packet::Reject(r) => assert_eq!(r.code, ErrorCode::T04_INSUFFICIENT_LIQUIDITY),
        other => panic!("expected Reject, got {other:?}"),
    }
    assert_eq!(node.bookkeeper().account("a6", "default").await.credit_balance, 4500);

    let exactly_at_limit = a
        .send_packet(prepare("g.c.receiver", 500, condition).to_bytes(), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(matches!(Packet::from_bytes(&exactly_at_limit).unwrap(), Packet::Fulfill(_)));
    assert_eq!(node.bookkeeper().account("a6", "default").await.credit_balance, 5000);

    std::env::remove_var("BTP_PEER_A6_SECRET");
    cancel.cancel();
}
