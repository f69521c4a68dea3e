//! `ConnectorNode`: owns every long-lived subsystem (routing table, peer
//! registry, settlement bookkeeper, telemetry bus) and drives the BTP
//! listener that accepts inbound peer connections.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ilp_router::{Route, RoutingTable};
use ilp_settlement::{Account, AccountStore, CreditLimits, InMemoryAccountStore, SettlementBookkeeper, SettlementExecutor};
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::errors::NodeError;
use crate::handler::ForwardingHandler;
use crate::registry::PeerRegistry;
use crate::telemetry::{HealthStatus, TelemetryBus, TelemetryEvent};

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ConnectorNode {
    config: Config,
    router: Arc<RoutingTable>,
    registry: Arc<PeerRegistry>,
    handler: Arc<ForwardingHandler>,
    bookkeeper: Arc<SettlementBookkeeper>,
    telemetry: TelemetryBus,
    cancel: CancellationToken,
    health: RwLock<HealthStatus>,
    listening: AtomicBool,
}

impl ConnectorNode {
    pub async fn new(config: Config, settlement_executor: Arc<dyn SettlementExecutor>) -> Result<Arc<Self>, NodeError> {
        let router = Arc::new(RoutingTable::new());
        for route in &config.routes {
            router.add_route(Route {
                pattern: route.prefix.clone(),
                next_hop: route.next_hop.clone(),
                priority: route.priority.unwrap_or(0),
            });
        }

        let telemetry = TelemetryBus::new();
        let cancel = CancellationToken::new();

        let settlement_config = config.settlement.clone().unwrap_or_default();
        let mut limits = CreditLimits::new();
        if let Some(default_limit) = settlement_config.default_credit_limit {
            limits = limits.with_default(default_limit);
        }
        if let Some(ceiling) = settlement_config.global_credit_ceiling {
            limits = limits.with_global_ceiling(ceiling);
        }
        for entry in &settlement_config.credit_limits {
            limits = match &entry.token_id {
                Some(token_id) => limits.with_token_limit(&entry.peer_id, token_id, entry.limit),
                None => limits.with_peer_limit(&entry.peer_id, entry.limit),
            };
        }

        let fee_bps = settlement_config.fee_basis_points();
        let store = InMemoryAccountStore::new();
        for peer in &config.peers {
            let mut account = Account::new(peer.id.clone(), "default".to_owned());
            account.fee_bps = fee_bps;
            store.configure_account(account).await;
        }
        for threshold in &settlement_config.thresholds {
            let token_id = threshold.token_id.clone().unwrap_or_else(|| "default".to_owned());
            let mut account = store.get_account(&threshold.peer_id, &token_id).await;
            account.fee_bps = fee_bps;
            account.settle_threshold = Some(threshold.threshold);
            account.settle_to = threshold.settle_to;
            store.configure_account(account).await;
        }

        let bookkeeper = SettlementBookkeeper::new(store, settlement_executor, limits);

        let handler = ForwardingHandler::new(
            config.node_id.clone(),
            router.clone(),
            bookkeeper.clone(),
            telemetry.clone(),
            Duration::from_millis(config.min_expiry_margin_ms),
            config.max_hops,
        );

        let registry = PeerRegistry::new(
            config.node_id.clone(),
            &config.peers,
            handler.clone(),
            ilp_btp::DEFAULT_MAX_PENDING_REQUESTS,
            cancel.clone(),
        );
        handler.bind_registry(&registry);

        Ok(Arc::new(ConnectorNode {
            config,
            router,
            registry,
            handler,
            bookkeeper,
            telemetry,
            cancel,
            health: RwLock::new(HealthStatus::Starting),
            listening: AtomicBool::new(false),
        }))
    }

    pub fn telemetry_bus(&self) -> TelemetryBus {
        self.telemetry.clone()
    }

    pub fn router(&self) -> Arc<RoutingTable> {
        self.router.clone()
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        self.registry.clone()
    }

    pub fn bookkeeper(&self) -> Arc<SettlementBookkeeper> {
        self.bookkeeper.clone()
    }

    /// Current health, recomputed from live peer state rather than cached:
    /// `Starting` until the BTP listener socket is bound, `Healthy` once at
    /// least half of the statically configured peers are `Ready`,
    /// `Unhealthy` otherwise.
    pub fn health(&self) -> HealthStatus {
        if !self.listening.load(Ordering::SeqCst) {
            return HealthStatus::Starting;
        }
        let total = self.registry.total_peer_count();
        let ready = self.registry.ready_peer_count();
        if total == 0 || ready * 2 >= total {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    fn publish_health(&self) {
        let status = self.health();
        *self.health.write() = status.clone();
        self.telemetry.publish(TelemetryEvent::HealthStatusChanged {
            status,
            peers_connected: self.registry.ready_peer_count(),
            total_peers: self.registry.total_peer_count(),
        });
    }

    /// Dials every static peer, starts the settlement threshold monitor,
    /// and binds the BTP listener socket. Returns once the listener is
    /// bound and accepting; the accept loop itself runs in the background.
    pub async fn start(self: &Arc<Self>) -> Result<(), NodeError> {
        self.registry.dial_static_peers();

        let peer_tokens: Vec<(String, String)> = self
            .config
            .peers
            .iter()
            .map(|p| (p.id.clone(), "default".to_owned()))
            .collect();
        self.bookkeeper.clone().spawn_monitor(
            peer_tokens,
            Duration::from_secs(self.config.settlement_poll_interval_seconds),
            self.cancel.clone(),
        );

        let addr = format!("0.0.0.0:{}", self.config.btp_server_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| NodeError::ListenerBind {
                port: self.config.btp_server_port,
                source,
            })?;
        info!(address = %addr, "BTP listener bound");
        self.listening.store(true, Ordering::SeqCst);

        let node = self.clone();
        tokio::spawn(async move {
            node.accept_loop(listener).await;
        });

        self.publish_health();
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let Ok((stream, peer_addr)) = accepted else {
                        warn!("failed to accept TCP connection");
                        continue;
                    };
                    let ws = match tokio_tungstenite::accept_async(stream).await {
                        Ok(ws) => ws,
                        Err(e) => {
                            warn!(peer = %peer_addr, error = %e, "websocket upgrade failed");
                            continue;
                        }
                    };
                    let registry = self.registry.clone();
                    let handler = self.handler.clone() as Arc<dyn ilp_btp::PacketHandler>;
                    let cancel = self.cancel.clone();
                    tokio::spawn(async move {
                        let registry_for_auth = registry.clone();
                        let result = ilp_btp::accept(
                            ws,
                            |username, token| registry_for_auth.authenticate(username, token),
                            handler,
                            ilp_btp::DEFAULT_MAX_PENDING_REQUESTS,
                            cancel,
                        )
                        .await;
                        match result {
                            Ok(transport) => {
                                let peer_id = transport.peer_id().to_owned();
                                registry.record_inbound(peer_id, transport);
                            }
                            Err(e) => warn!(peer = %peer_addr, error = %e, "BTP handshake failed"),
                        }
                    });
                }
            }
        }
        info!("BTP accept loop exiting");
    }

    /// Cancels every background task (peer dial loops, the threshold
    /// monitor, the accept loop) and waits up to `drain_timeout` for
    /// outstanding peer requests to settle before returning. Returns
    /// `ShutdownTimedOut` if anything is still in flight once the timeout
    /// elapses; callers may still exit, just without the guarantee that
    /// every in-flight forward resolved cleanly.
    pub async fn stop(self: &Arc<Self>) -> Result<(), NodeError> {
        self.cancel.cancel();
        let deadline = tokio::time::Instant::now() + DEFAULT_SHUTDOWN_DRAIN_TIMEOUT;
        loop {
            if self.registry.total_pending_requests() == 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                error!("shutdown drain timed out with requests still in flight");
                return Err(NodeError::ShutdownTimedOut);
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ilp_settlement::SettlementError;

    struct NullExecutor;
    #[async_trait]
    impl SettlementExecutor for NullExecutor {
        async fn execute(&self, _peer_id: &str, _token_id: &str, _amount: u64, _scale: u8) -> Result<(), SettlementError> {
            Ok(())
        }
    }

    fn minimal_config(port: u16) -> Config {
        Config::from_str(&format!(
            "nodeId: test-node\nbtpServerPort: {port}\n"
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn health_is_starting_before_listener_is_bound() {
        let node = ConnectorNode::new(minimal_config(17768), Arc::new(NullExecutor)).await.unwrap();
        assert_eq!(node.health(), HealthStatus::Starting);
    }

    #[tokio::test]
    async fn health_is_healthy_with_no_configured_peers_once_listening() {
        let node = ConnectorNode::new(minimal_config(17770), Arc::new(NullExecutor)).await.unwrap();
        node.start().await.unwrap();
        assert_eq!(node.health(), HealthStatus::Healthy);
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_binds_listener_and_stop_is_idempotent_on_no_traffic() {
        let node = ConnectorNode::new(minimal_config(17769), Arc::new(NullExecutor)).await.unwrap();
        node.start().await.unwrap();
        node.stop().await.unwrap();
    }
}
