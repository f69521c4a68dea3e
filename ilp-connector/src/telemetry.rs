//! In-process telemetry bus. `ConnectorNode` owns the sender half; any
//! number of sinks (a persistence adapter, a dashboard forwarder) can
//! subscribe. This crate ships neither adapter — spec §1 keeps both out of
//! scope — only the bus and the event schema (spec §6) they would consume.

use async_trait::async_trait;
use ilp_settlement::Account;
use tokio::sync::broadcast;
use tracing::warn;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardResult {
    Fulfilled,
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    PacketForwarded {
        node_id: String,
        source_peer_id: String,
        next_hop_peer_id: Option<String>,
        destination: String,
        amount: u64,
        result: ForwardResult,
        duration_micros: u64,
    },
    PeerStateChanged {
        peer_id: String,
        old_state: PeerState,
        new_state: PeerState,
    },
    AccountBalance {
        peer_id: String,
        token_id: String,
        debit: u128,
        credit: u128,
        net: i128,
        settlement_state: String,
    },
    SettlementTriggered {
        peer_id: String,
        token_id: String,
        current_balance: u128,
        threshold: u64,
        exceeds_by: u64,
    },
    SettlementCompleted {
        peer_id: String,
        token_id: String,
    },
    SettlementCancelled {
        peer_id: String,
        token_id: String,
    },
    HealthStatusChanged {
        status: HealthStatus,
        peers_connected: usize,
        total_peers: usize,
    },
}

impl TelemetryEvent {
    pub fn account_balance(account: &Account, settlement_state: &str) -> Self {
        TelemetryEvent::AccountBalance {
            peer_id: account.peer_id.clone(),
            token_id: account.token_id.clone(),
            debit: account.debit_balance,
            credit: account.credit_balance,
            net: account.net_balance(),
            settlement_state: settlement_state.to_owned(),
        }
    }
}

/// Non-blocking in-process event stream. Overflowing the bounded channel
/// drops the oldest undelivered event for that subscriber (per spec §5
/// "bounded buffer, drop-oldest on overflow") rather than ever blocking a
/// forwarding task; `tokio::sync::broadcast` implements exactly this
/// policy and reports the drop count on the next receive.
#[derive(Clone)]
pub struct TelemetryBus {
    sender: broadcast::Sender<TelemetryEvent>,
}

impl Default for TelemetryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        TelemetryBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event. A send with no subscribers is not an error —
    /// telemetry is best-effort and the bus may simply have no consumer
    /// wired up yet.
    pub fn publish(&self, event: TelemetryEvent) {
        let _ = self.sender.send(event);
    }
}

/// A consumer of the telemetry stream. `ilp-connector` ships one in-memory
/// sink (below) for tests; a persistence adapter and a dashboard-forwarding
/// adapter are named in spec §1's out-of-scope list as the two real
/// consumers this contract is shaped for.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn handle(&self, event: TelemetryEvent);
}

/// Drives a `Sink` off a bus subscription until the bus is dropped.
pub async fn run_sink(mut receiver: broadcast::Receiver<TelemetryEvent>, sink: impl Sink) {
    loop {
        match receiver.recv().await {
            Ok(event) => sink.handle(event).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "telemetry sink lagged, events were dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[derive(Default)]
pub struct InMemorySink {
    events: parking_lot::Mutex<Vec<TelemetryEvent>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl Sink for InMemorySink {
    async fn handle(&self, event: TelemetryEvent) {
        self.events.lock().push(event);
    }
}
