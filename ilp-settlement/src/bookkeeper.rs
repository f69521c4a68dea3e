//! `SettlementBookkeeper`: credit-limit pre-check, fee math, the
//! commit-on-fulfill balance update, and the threshold monitor that signals
//! an external `SettlementExecutor` once a peer's credit balance crosses
//! its configured threshold.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::account::Account;
use crate::errors::SettlementError;
use crate::limits::CreditLimits;
use crate::store::AccountStore;

/// Collaborator that actually moves value between this connector and a
/// peer once the bookkeeper decides a settlement is due. Left abstract —
/// the implementation (an HTTP call to a settlement engine, an on-chain
/// transaction, etc.) is outside this crate's scope.
#[async_trait]
pub trait SettlementExecutor: Send + Sync {
    async fn execute(
        &self,
        peer_id: &str,
        token_id: &str,
        amount: u64,
        asset_scale: u8,
    ) -> Result<(), SettlementError>;
}

/// Notified of every threshold-monitor state transition and of each
/// forwarded packet's outcome, so a caller (typically `ilp-connector`'s
/// telemetry bus) can turn them into the events spec §6 describes without
/// this crate depending on anything above it.
pub trait SettlementObserver: Send + Sync {
    fn on_settlement_required(&self, peer_id: &str, token_id: &str, account: &Account, exceeds_by: u64) {
        let _ = (peer_id, token_id, account, exceeds_by);
    }
    fn on_settlement_completed(&self, peer_id: &str, token_id: &str) {
        let _ = (peer_id, token_id);
    }
    fn on_settlement_cancelled(&self, peer_id: &str, token_id: &str) {
        let _ = (peer_id, token_id);
    }
}

struct NullObserver;
impl SettlementObserver for NullObserver {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThresholdState {
    Idle,
    Pending,
    InProgress,
}

pub struct SettlementBookkeeper {
    store: Arc<dyn AccountStore>,
    executor: Arc<dyn SettlementExecutor>,
    limits: CreditLimits,
    observer: Arc<dyn SettlementObserver>,
    states: Mutex<HashMap<(String, String), ThresholdState>>,
}

impl SettlementBookkeeper {
    pub fn new(
        store: Arc<dyn AccountStore>,
        executor: Arc<dyn SettlementExecutor>,
        limits: CreditLimits,
    ) -> Arc<Self> {
        Self::with_observer(store, executor, limits, Arc::new(NullObserver))
    }

    pub fn with_observer(
        store: Arc<dyn AccountStore>,
        executor: Arc<dyn SettlementExecutor>,
        limits: CreditLimits,
        observer: Arc<dyn SettlementObserver>,
    ) -> Arc<Self> {
        Arc::new(SettlementBookkeeper {
            store,
            executor,
            limits,
            observer,
            states: Mutex::new(HashMap::new()),
        })
    }

    /// Pure credit-limit check: does not mutate any balance. Precedence for
    /// the effective limit is token-specific > per-peer > default, capped
    /// by an optional global ceiling.
    pub async fn can_accept(
        &self,
        peer_id: &str,
        token_id: &str,
        amount: u64,
    ) -> Result<(), SettlementError> {
        let account = self.store.get_account(peer_id, token_id).await;
        let Some(limit) = self.limits.effective_limit(peer_id, token_id) else {
            return Ok(());
        };
        let prospective = account.credit_balance + u128::from(amount);
        if prospective > u128::from(limit) {
            return Err(SettlementError::LimitExceeded {
                peer_id: peer_id.to_owned(),
                token_id: token_id.to_owned(),
                current_balance: account.credit_balance,
                requested_amount: amount,
                credit_limit: limit,
                would_exceed_by: (prospective - u128::from(limit)) as u64,
            });
        }
        Ok(())
    }

    /// Fee this connector keeps for forwarding `amount` from `(peer_id,
    /// token_id)`, floor-rounded basis points.
    pub async fn fee_for(&self, peer_id: &str, token_id: &str, amount: u64) -> u64 {
        self.store.get_account(peer_id, token_id).await.fee_for(amount)
    }

    /// Current ledger state for `(peer_id, token_id)`, for telemetry and
    /// tests that need to observe the effect of a `commit` without reaching
    /// into the store directly.
    pub async fn account(&self, peer_id: &str, token_id: &str) -> Account {
        self.store.get_account(peer_id, token_id).await
    }

    /// Commits a confirmed fulfilled forward: both balance updates apply
    /// atomically. Always synchronous with respect to the caller — any
    /// resulting settlement signal is spawned as a detached task so it
    /// never delays the Fulfill response upstream.
    pub async fn commit(
        self: &Arc<Self>,
        incoming_peer_id: &str,
        incoming_token_id: &str,
        incoming_amount: u64,
        outgoing_peer_id: &str,
        outgoing_token_id: &str,
        outgoing_amount: u64,
    ) -> Result<(), SettlementError> {
        let (incoming_account, _outgoing_account) = self
            .store
            .commit_fulfill(
                (incoming_peer_id, incoming_token_id, incoming_amount),
                (outgoing_peer_id, outgoing_token_id, outgoing_amount),
            )
            .await?;

        if incoming_account.owes_settlement() {
            self.clone().maybe_trigger_settlement(incoming_account);
        }
        Ok(())
    }

    /// Records an incoming settlement payment from `peer_id`, reducing its
    /// credit balance. If this naturally drops it back under the
    /// threshold while a settlement was `Pending`, the pending settlement
    /// is cancelled rather than executed redundantly.
    pub async fn record_incoming_settlement(
        &self,
        peer_id: &str,
        token_id: &str,
        amount: u64,
    ) -> Result<(), SettlementError> {
        let account = self
            .store
            .record_incoming_settlement(peer_id, token_id, amount)
            .await?;
        if !account.owes_settlement() {
            self.cancel_if_pending(peer_id, token_id);
        }
        Ok(())
    }

    fn key(peer_id: &str, token_id: &str) -> (String, String) {
        (peer_id.to_owned(), token_id.to_owned())
    }

    fn cancel_if_pending(&self, peer_id: &str, token_id: &str) {
        let mut states = self.states.lock();
        let key = Self::key(peer_id, token_id);
        if states.get(&key) == Some(&ThresholdState::Pending) {
            states.insert(key, ThresholdState::Idle);
            self.observer.on_settlement_cancelled(peer_id, token_id);
        }
    }

    /// `Idle -> Pending` transition plus the detached task that drives
    /// `Pending -> InProgress -> Idle`. A no-op if a settlement is already
    /// pending or in progress for this `(peer, token)` — any transition
    /// not in spec §4.6's table is logged and ignored rather than applied.
    fn maybe_trigger_settlement(self: Arc<Self>, account: Account) {
        let key = Self::key(&account.peer_id, &account.token_id);
        {
            let mut states = self.states.lock();
            let state = states.entry(key.clone()).or_insert(ThresholdState::Idle);
            if *state != ThresholdState::Idle {
                debug!(peer = %account.peer_id, token = %account.token_id, ?state, "settlement already pending or in progress, ignoring duplicate signal");
                return;
            }
            *state = ThresholdState::Pending;
        }
        let exceeds_by = account.amount_to_settle();
        self.observer
            .on_settlement_required(&account.peer_id, &account.token_id, &account, exceeds_by);

        tokio::spawn(async move {
            {
                let mut states = self.states.lock();
                match states.get(&key) {
                    Some(ThresholdState::Pending) => {
                        states.insert(key.clone(), ThresholdState::InProgress);
                    }
                    other => {
                        warn!(?other, "illegal threshold transition observed, ignoring");
                        return;
                    }
                }
            }

            let amount = account.amount_to_settle();
            let result = self
                .executor
                .execute(&account.peer_id, &account.token_id, amount, account.asset_scale)
                .await;

            match result {
                Ok(()) => {
                    info!(peer = %account.peer_id, token = %account.token_id, amount, "settlement executed");
                }
                Err(e) => {
                    warn!(peer = %account.peer_id, token = %account.token_id, amount, error = %e, "settlement failed, refunding");
                    if let Err(refund_err) = self
                        .store
                        .refund_settlement(&account.peer_id, &account.token_id, amount)
                        .await
                    {
                        error!(peer = %account.peer_id, error = %refund_err, "failed to refund after settlement failure");
                    }
                }
            }

            let current = self.store.get_account(&account.peer_id, &account.token_id).await;
            if !current.owes_settlement() {
                self.states.lock().insert(key, ThresholdState::Idle);
                self.observer
                    .on_settlement_completed(&account.peer_id, &account.token_id);
            } else {
                // still over threshold (e.g. the forward kept flowing while we
                // settled); drop back to Idle so the next tick can re-trigger.
                self.states.lock().insert(key, ThresholdState::Idle);
            }
        });
    }

    /// Spawns a periodic scan over `peer_tokens`, re-checking each
    /// account's threshold and nudging any that are due but stuck `Idle`
    /// (e.g. because the balance was pushed over threshold by a commit
    /// that happened between ticks). A tick that runs long skips the next
    /// one rather than overlapping with it.
    pub fn spawn_monitor(
        self: Arc<Self>,
        peer_tokens: Vec<(String, String)>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                for (peer_id, token_id) in &peer_tokens {
                    let account = self.store.get_account(peer_id, token_id).await;
                    if account.owes_settlement() {
                        self.clone().maybe_trigger_settlement(account);
                    }
                }
            }
        });
    }
}
