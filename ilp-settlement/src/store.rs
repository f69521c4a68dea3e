//! The balance-store abstraction the bookkeeper forwards through, and an
//! in-memory implementation suitable for a single-process connector.
//!
//! Grounded in `interledger-service-util::balance_service::BalanceStore`'s
//! three-phase shape (prepare / fulfill / reject), adapted to this spec's
//! `(peerId, tokenId)` keying and to committing both sides of a forward —
//! the incoming peer's credit and the outgoing peer's debit — as one
//! atomic unit instead of two accounts mutated independently.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::account::Account;
use crate::errors::SettlementError;

pub type AccountKey = (String, String);

fn key(peer_id: &str, token_id: &str) -> AccountKey {
    (peer_id.to_owned(), token_id.to_owned())
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Fetches the account for `(peer_id, token_id)`, lazily creating a
    /// zero-balance one on first observation per spec's Account lifecycle.
    async fn get_account(&self, peer_id: &str, token_id: &str) -> Account;

    /// Seeds or overwrites the static configuration (limits, threshold,
    /// fee, asset metadata) of an account without touching its balances.
    async fn configure_account(&self, account: Account);

    /// Atomically commits a confirmed fulfilled forward: `incoming`'s
    /// credit balance increases by its amount, `outgoing`'s debit balance
    /// increases by its amount. Either both apply or neither does.
    async fn commit_fulfill(
        &self,
        incoming: (&str, &str, u64),
        outgoing: (&str, &str, u64),
    ) -> Result<(Account, Account), SettlementError>;

    /// Applies an incoming settlement payment, reducing the peer's owed
    /// credit balance by `amount`.
    async fn record_incoming_settlement(
        &self,
        peer_id: &str,
        token_id: &str,
        amount: u64,
    ) -> Result<Account, SettlementError>;

    /// Restores `amount` to the peer's credit balance after an outgoing
    /// settlement attempt failed, so the debt is not silently forgiven.
    async fn refund_settlement(
        &self,
        peer_id: &str,
        token_id: &str,
        amount: u64,
    ) -> Result<Account, SettlementError>;

    /// A consistent view of every account currently tracked, for telemetry.
    async fn snapshot(&self) -> Vec<Account>;
}

#[derive(Default)]
pub struct InMemoryAccountStore {
    accounts: RwLock<HashMap<AccountKey, Account>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

fn get_or_create<'a>(
    accounts: &'a mut HashMap<AccountKey, Account>,
    peer_id: &str,
    token_id: &str,
) -> &'a mut Account {
    accounts
        .entry(key(peer_id, token_id))
        .or_insert_with(|| Account::new(peer_id, token_id))
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn get_account(&self, peer_id: &str, token_id: &str) -> Account {
        let mut accounts = self.accounts.write();
        get_or_create(&mut accounts, peer_id, token_id).clone()
    }

    async fn configure_account(&self, account: Account) {
        self.accounts
            .write()
            .insert(key(&account.peer_id, &account.token_id), account);
    }

    async fn commit_fulfill(
        &self,
        incoming: (&str, &str, u64),
        outgoing: (&str, &str, u64),
    ) -> Result<(Account, Account), SettlementError> {
        let (in_peer, in_token, in_amount) = incoming;
        let (out_peer, out_token, out_amount) = outgoing;
        let mut accounts = self.accounts.write();

        get_or_create(&mut accounts, in_peer, in_token).credit_balance += u128::from(in_amount);
        get_or_create(&mut accounts, out_peer, out_token).debit_balance += u128::from(out_amount);

        let incoming_account = accounts.get(&key(in_peer, in_token)).unwrap().clone();
        let outgoing_account = accounts.get(&key(out_peer, out_token)).unwrap().clone();
        Ok((incoming_account, outgoing_account))
    }

    async fn record_incoming_settlement(
        &self,
        peer_id: &str,
        token_id: &str,
        amount: u64,
    ) -> Result<Account, SettlementError> {
        let mut accounts = self.accounts.write();
        let account = get_or_create(&mut accounts, peer_id, token_id);
        account.credit_balance = account.credit_balance.saturating_sub(u128::from(amount));
        Ok(account.clone())
    }

    async fn refund_settlement(
        &self,
        peer_id: &str,
        token_id: &str,
        amount: u64,
    ) -> Result<Account, SettlementError> {
        let mut accounts = self.accounts.write();
        let account = get_or_create(&mut accounts, peer_id, token_id);
        account.credit_balance += u128::from(amount);
        Ok(account.clone())
    }

    async fn snapshot(&self) -> Vec<Account> {
        self.accounts.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_account_lazily_creates_zero_balance_account() {
        let store = InMemoryAccountStore::new();
        let account = store.get_account("peer", "usd").await;
        assert_eq!(account.credit_balance, 0);
        assert_eq!(account.debit_balance, 0);
    }

    #[tokio::test]
    async fn commit_fulfill_credits_incoming_and_debits_outgoing() {
        let store = InMemoryAccountStore::new();
        let (incoming, outgoing) = store
            .commit_fulfill(("a", "usd", 1000), ("c", "usd", 999))
            .await
            .unwrap();
        assert_eq!(incoming.credit_balance, 1000);
        assert_eq!(outgoing.debit_balance, 999);
        assert_eq!(store.get_account("a", "usd").await.credit_balance, 1000);
        assert_eq!(store.get_account("c", "usd").await.debit_balance, 999);
    }

    #[tokio::test]
    async fn commit_fulfill_to_the_same_peer_applies_both_sides() {
        // a degenerate but legal case: the connector forwards between two
        // accounts that happen to be the same peer/token.
        let store = InMemoryAccountStore::new();
        store
            .commit_fulfill(("a", "usd", 100), ("a", "usd", 99))
            .await
            .unwrap();
        let account = store.get_account("a", "usd").await;
        assert_eq!(account.credit_balance, 100);
        assert_eq!(account.debit_balance, 99);
    }

    #[tokio::test]
    async fn incoming_settlement_reduces_credit_balance() {
        let store = InMemoryAccountStore::new();
        store.commit_fulfill(("a", "usd", 1000), ("c", "usd", 999)).await.unwrap();
        let account = store
            .record_incoming_settlement("a", "usd", 400)
            .await
            .unwrap();
        assert_eq!(account.credit_balance, 600);
    }

    #[tokio::test]
    async fn refund_restores_credit_balance() {
        let store = InMemoryAccountStore::new();
        store.commit_fulfill(("a", "usd", 1000), ("c", "usd", 999)).await.unwrap();
        store.record_incoming_settlement("a", "usd", 1000).await.unwrap();
        let account = store.refund_settlement("a", "usd", 400).await.unwrap();
        assert_eq!(account.credit_balance, 400);
    }
}
