//! Interest table: which connection watches which (source, tier), plus pins

use crate::quality_tier::Tier;
use crate::stream_supervisor::StreamKey;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Client interest bookkeeping. Pure data; callers serialize access.
///
/// A client holds at most one tier per source.
#[derive(Debug, Default)]
pub struct InterestTable {
    by_stream: HashMap<StreamKey, HashSet<Uuid>>,
    by_client: HashMap<Uuid, HashMap<String, Tier>>,
    pins: HashSet<StreamKey>,
}

/// Per-stream interest summary for stats
#[derive(Debug, Clone, Serialize)]
pub struct StreamInterest {
    pub source_id: String,
    pub tier: Tier,
    pub subscribers: usize,
    pub pinned: bool,
}

impl InterestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `client` on `key`, replacing any other tier it held for the source.
    /// Returns the replaced tier.
    pub fn add(&mut self, client: Uuid, key: &StreamKey) -> Option<Tier> {
        let previous = self
            .by_client
            .entry(client)
            .or_default()
            .insert(key.source_id.clone(), key.tier);

        if let Some(old) = previous.filter(|t| *t != key.tier) {
            self.detach(client, &StreamKey::new(key.source_id.clone(), old));
        }
        self.by_stream.entry(key.clone()).or_default().insert(client);
        previous.filter(|t| *t != key.tier)
    }

    /// Drop `client`'s interest in `source_id`; returns the tier it held
    pub fn remove(&mut self, client: Uuid, source_id: &str) -> Option<Tier> {
        let sources = self.by_client.get_mut(&client)?;
        let tier = sources.remove(source_id)?;
        if sources.is_empty() {
            self.by_client.remove(&client);
        }
        self.detach(client, &StreamKey::new(source_id, tier));
        Some(tier)
    }

    /// Drop every interest of `client` in one step; returns what it held
    pub fn remove_client(&mut self, client: Uuid) -> Vec<StreamKey> {
        let Some(sources) = self.by_client.remove(&client) else {
            return Vec::new();
        };
        let keys: Vec<StreamKey> = sources
            .into_iter()
            .map(|(source_id, tier)| StreamKey::new(source_id, tier))
            .collect();
        for key in &keys {
            self.detach(client, key);
        }
        keys
    }

    fn detach(&mut self, client: Uuid, key: &StreamKey) {
        if let Some(clients) = self.by_stream.get_mut(key) {
            clients.remove(&client);
            if clients.is_empty() {
                self.by_stream.remove(key);
            }
        }
    }

    pub fn tier_of(&self, client: Uuid, source_id: &str) -> Option<Tier> {
        self.by_client.get(&client)?.get(source_id).copied()
    }

    pub fn subscriber_count(&self, key: &StreamKey) -> usize {
        self.by_stream.get(key).map_or(0, HashSet::len)
    }

    pub fn subscribers(&self, key: &StreamKey) -> Vec<Uuid> {
        self.by_stream
            .get(key)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Clients watching the source at any tier
    pub fn clients_of_source(&self, source_id: &str) -> HashSet<Uuid> {
        self.by_stream
            .iter()
            .filter(|(key, _)| key.source_id == source_id)
            .flat_map(|(_, clients)| clients.iter().copied())
            .collect()
    }

    /// Any client on any tier; pins do not count
    pub fn source_watched(&self, source_id: &str) -> bool {
        self.by_stream.keys().any(|key| key.source_id == source_id)
    }

    /// A process for `key` should exist
    pub fn stream_wanted(&self, key: &StreamKey) -> bool {
        self.subscriber_count(key) > 0 || self.pins.contains(key)
    }

    pub fn pin(&mut self, key: &StreamKey) -> bool {
        self.pins.insert(key.clone())
    }

    pub fn unpin(&mut self, key: &StreamKey) -> bool {
        self.pins.remove(key)
    }

    pub fn is_pinned(&self, key: &StreamKey) -> bool {
        self.pins.contains(key)
    }

    pub fn summary(&self) -> Vec<StreamInterest> {
        let mut keys: HashSet<&StreamKey> = self.by_stream.keys().collect();
        keys.extend(self.pins.iter());

        let mut list: Vec<StreamInterest> = keys
            .into_iter()
            .map(|key| StreamInterest {
                source_id: key.source_id.clone(),
                tier: key.tier,
                subscribers: self.subscriber_count(key),
                pinned: self.pins.contains(key),
            })
            .collect();
        list.sort_by(|a, b| (&a.source_id, a.tier).cmp(&(&b.source_id, b.tier)));
        list
    }
}
