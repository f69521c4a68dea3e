//! Effective credit-limit resolution: token-specific overrides beat
//! per-peer overrides beat the connector-wide default, and the whole
//! result is capped by an optional global ceiling.

use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct CreditLimits {
    pub default_limit: Option<u64>,
    pub per_peer: HashMap<String, u64>,
    pub per_peer_token: HashMap<(String, String), u64>,
    pub global_ceiling: Option<u64>,
}

impl CreditLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(mut self, limit: u64) -> Self {
        self.default_limit = Some(limit);
        self
    }

    pub fn with_peer_limit(mut self, peer_id: impl Into<String>, limit: u64) -> Self {
        self.per_peer.insert(peer_id.into(), limit);
        self
    }

    pub fn with_token_limit(
        mut self,
        peer_id: impl Into<String>,
        token_id: impl Into<String>,
        limit: u64,
    ) -> Self {
        self.per_peer_token
            .insert((peer_id.into(), token_id.into()), limit);
        self
    }

    pub fn with_global_ceiling(mut self, ceiling: u64) -> Self {
        self.global_ceiling = Some(ceiling);
        self
    }

    /// `None` means unlimited: no configured limit and no global ceiling.
    pub fn effective_limit(&self, peer_id: &str, token_id: &str) -> Option<u64> {
        let key = (peer_id.to_owned(), token_id.to_owned());
        let base = self
            .per_peer_token
            .get(&key)
            .copied()
            .or_else(|| self.per_peer.get(peer_id).copied())
            .or(self.default_limit);
        match (base, self.global_ceiling) {
            (Some(b), Some(g)) => Some(b.min(g)),
            (Some(b), None) => Some(b),
            (None, Some(g)) => Some(g),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_specific_beats_per_peer_beats_default() {
        let limits = CreditLimits::new()
            .with_default(100)
            .with_peer_limit("peer-a", 500)
            .with_token_limit("peer-a", "usd", 900);
        assert_eq!(limits.effective_limit("peer-a", "usd"), Some(900));
        assert_eq!(limits.effective_limit("peer-a", "eur"), Some(500));
        assert_eq!(limits.effective_limit("peer-b", "usd"), Some(100));
    }

    #[test]
    fn global_ceiling_caps_any_resolved_limit() {
        let limits = CreditLimits::new()
            .with_peer_limit("peer-a", 5000)
            .with_global_ceiling(1000);
        assert_eq!(limits.effective_limit("peer-a", "usd"), Some(1000));
    }

    #[test]
    fn no_configuration_is_unlimited() {
        let limits = CreditLimits::new();
        assert_eq!(limits.effective_limit("peer-a", "usd"), None);
    }
}
