use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("no account found for peer `{peer_id}` token `{token_id}`")]
    AccountNotFound { peer_id: String, token_id: String },

    #[error(
        "forwarding {requested_amount} from peer `{peer_id}` token `{token_id}` would exceed its \
         credit limit (balance {current_balance}, limit {credit_limit}, over by {would_exceed_by})"
    )]
    LimitExceeded {
        peer_id: String,
        token_id: String,
        current_balance: u128,
        requested_amount: u64,
        credit_limit: u64,
        would_exceed_by: u64,
    },

    #[error("settlement executor failed for peer `{peer_id}` token `{token_id}`: {reason}")]
    ExecutorFailed {
        peer_id: String,
        token_id: String,
        reason: String,
    },
}
