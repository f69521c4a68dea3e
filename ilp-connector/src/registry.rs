//! `PeerRegistry`: owns one `PeerTransport` per known peer, dials out to
//! statically configured peers, and authenticates inbound connections —
//! from either a configured peer or, per the dynamic-peer-admission
//! resolution in DESIGN.md, a peer whose credentials are only known via
//! environment variable at connection time.

use std::collections::HashMap;
use std::sync::Arc;

use ilp_btp::{PacketHandler, PeerState, PeerTransport};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use crate::config::PeerConfig;

const DYNAMIC_PEER_MAX_PENDING_REQUESTS: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub peer_id: String,
    pub state: PeerState,
}

struct StaticPeerCredentials {
    url: Url,
    auth_token: String,
}

/// Live set of peer connections. Static peers are dialed at construction
/// time and kept alive by `PeerTransport`'s own reconnect loop; dynamic
/// peers appear only once they successfully dial in.
pub struct PeerRegistry {
    node_id: String,
    max_pending_requests: usize,
    static_peers: RwLock<HashMap<String, StaticPeerCredentials>>,
    transports: RwLock<HashMap<String, Arc<PeerTransport>>>,
    handler: Arc<dyn PacketHandler>,
    cancel: CancellationToken,
}

impl PeerRegistry {
    pub fn new(
        node_id: String,
        peers: &[PeerConfig],
        handler: Arc<dyn PacketHandler>,
        max_pending_requests: usize,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let mut static_peers = HashMap::new();
        for peer in peers {
            if let Ok(url) = Url::parse(&peer.url) {
                static_peers.insert(
                    peer.id.clone(),
                    StaticPeerCredentials {
                        url,
                        auth_token: peer.auth_token.clone(),
                    },
                );
            }
        }

        Arc::new(PeerRegistry {
            node_id,
            max_pending_requests,
            static_peers: RwLock::new(static_peers),
            transports: RwLock::new(HashMap::new()),
            handler,
            cancel,
        })
    }

    /// Dials every statically configured peer. Idempotent: re-dialing a
    /// peer that already has a live transport is skipped.
    pub fn dial_static_peers(self: &Arc<Self>) {
        let peers: Vec<(String, Url, String)> = self
            .static_peers
            .read()
            .iter()
            .map(|(id, creds)| (id.clone(), creds.url.clone(), creds.auth_token.clone()))
            .collect();

        for (peer_id, url, auth_token) in peers {
            if self.transports.read().contains_key(&peer_id) {
                continue;
            }
            let transport = ilp_btp::dial(
                url,
                Arc::from(peer_id.as_str()),
                self.node_id.clone(),
                auth_token,
                self.handler.clone(),
                self.max_pending_requests,
                self.cancel.clone(),
            );
            self.transports.write().insert(peer_id, transport);
        }
    }

    /// Adds (or replaces the credentials for, without disturbing a live
    /// connection) a static peer and dials it immediately.
    pub fn add_static_peer(self: &Arc<Self>, peer: &PeerConfig) -> Result<(), url::ParseError> {
        let url = Url::parse(&peer.url)?;
        self.static_peers.write().insert(
            peer.id.clone(),
            StaticPeerCredentials {
                url: url.clone(),
                auth_token: peer.auth_token.clone(),
            },
        );
        if !self.transports.read().contains_key(&peer.id) {
            let transport = ilp_btp::dial(
                url,
                Arc::from(peer.id.as_str()),
                self.node_id.clone(),
                peer.auth_token.clone(),
                self.handler.clone(),
                self.max_pending_requests,
                self.cancel.clone(),
            );
            self.transports.write().insert(peer.id.clone(), transport);
        }
        Ok(())
    }

    pub fn remove_peer(&self, peer_id: &str) -> bool {
        self.static_peers.write().remove(peer_id);
        self.transports.write().remove(peer_id).is_some()
    }

    pub fn get_transport(&self, peer_id: &str) -> Option<Arc<PeerTransport>> {
        self.transports.read().get(peer_id).cloned()
    }

    pub fn statuses(&self) -> Vec<PeerStatus> {
        self.transports
            .read()
            .values()
            .map(|t| PeerStatus {
                peer_id: t.peer_id().to_owned(),
                state: t.state(),
            })
            .collect()
    }

    /// Sum of in-flight (awaiting-response) requests across every peer
    /// transport, used by `ConnectorNode::stop` to decide whether the
    /// bounded shutdown drain can complete early.
    pub fn total_pending_requests(&self) -> usize {
        self.transports
            .read()
            .values()
            .map(|t| t.pending_request_count())
            .sum()
    }

    pub fn ready_peer_count(&self) -> usize {
        self.transports
            .read()
            .values()
            .filter(|t| t.state() == PeerState::Ready)
            .count()
    }

    pub fn total_peer_count(&self) -> usize {
        self.static_peers.read().len().max(self.transports.read().len())
    }

    /// Credential check run against an inbound BTP auth frame. A static
    /// peer must present its configured `authToken`. Otherwise the peer id
    /// is admitted dynamically if-and-only-if `BTP_PEER_<ID>_SECRET` is set
    /// and equals the presented token; the registry does not persist this
    /// peer as a `PeerConfig`, only as a live transport once connected.
    pub fn authenticate(&self, username: &str, token: &str) -> Option<Arc<str>> {
        if let Some(creds) = self.static_peers.read().get(username) {
            if creds.auth_token == token {
                return Some(Arc::from(username));
            }
            return None;
        }

        let env_var = format!("BTP_PEER_{}_SECRET", username.to_uppercase());
        match std::env::var(&env_var) {
            Ok(secret) if secret == token => {
                info!(peer = username, "admitting dynamic peer via environment credential");
                Some(Arc::from(username))
            }
            _ => None,
        }
    }

    /// Records a transport produced by accepting an inbound connection.
    /// A fresh inbound connection always wins over whatever this registry
    /// already holds for that peer id, even a `Ready` one — the old
    /// transport's own read loop will observe the dropped outbound sender
    /// (if this registry dialed it) and tear itself down, or simply become
    /// orphaned and get dropped once its `Arc` refcount reaches zero.
    pub fn record_inbound(&self, peer_id: String, transport: Arc<PeerTransport>) {
        self.transports.write().insert(peer_id, transport);
    }
}
