//! Client tier assignments.
//!
//! A thin, separate store from the rate limiter's own bucket map: this is the
//! source of truth an operator edits via the admin surface
//! (`POST /clients/{client_id}/tier?tier=...`), while the limiter's internal
//! tier field just mirrors whatever tier was last passed into `check()`.

use dashmap::DashMap;

use crate::config::Tier;

pub struct ClientTierStore {
    tiers: DashMap<String, Tier>,
}

impl ClientTierStore {
    pub fn new() -> Self {
        Self { tiers: DashMap::new() }
    }

    pub fn get_tier(&self, client_id: &str) -> Tier {
        self.tiers.get(client_id).map(|t| *t).unwrap_or_default()
    }

    pub fn set_tier(&self, client_id: &str, tier: Tier) {
        self.tiers.insert(client_id.to_string(), tier);
    }

    pub fn remove_client(&self, client_id: &str) -> bool {
        self.tiers.remove(client_id).is_some()
    }

    pub fn list_clients(&self) -> Vec<(String, Tier)> {
        self.tiers.iter().map(|entry| (entry.key().clone(), *entry.value())).collect()
    }
}

impl Default for ClientTierStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_client_defaults_to_free() {
        let store = ClientTierStore::new();
        assert_eq!(store.get_tier("nobody"), Tier::Free);
    }

    #[test]
    fn set_and_get_round_trips() {
        let store = ClientTierStore::new();
        store.set_tier("alice", Tier::Premium);
        assert_eq!(store.get_tier("alice"), Tier::Premium);
    }

    #[test]
    fn remove_client_clears_assignment() {
        let store = ClientTierStore::new();
        store.set_tier("bob", Tier::Enterprise);
        assert!(store.remove_client("bob"));
        assert_eq!(store.get_tier("bob"), Tier::Free);
        assert!(!store.remove_client("bob"));
    }

    #[test]
    fn list_clients_reflects_all_assignments() {
        let store = ClientTierStore::new();
        store.set_tier("a", Tier::Basic);
        store.set_tier("b", Tier::Premium);
        let mut clients = store.list_clients();
        clients.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(clients, vec![("a".to_string(), Tier::Basic), ("b".to_string(), Tier::Premium)]);
    }
}
