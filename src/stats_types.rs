//! Statistics Types Module
//!
//! Typed documents persisted by the statistics repository: global counters with
//! per-client breakdown, and the capped history logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Current on-disk schema version of the global statistics document
pub const SCHEMA_VERSION: u32 = 1;

/// Default maximum number of entries kept in each history log
pub const DEFAULT_HISTORY_CAP: usize = 1000;

/// Free-form metadata attached to a history entry
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Case-insensitive client identifier, stored uppercase
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ClientId(String);

impl ClientId {
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for ClientId {
    fn from(raw: String) -> Self {
        Self::new(&raw)
    }
}

impl From<&str> for ClientId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<ClientId> for String {
    fn from(id: ClientId) -> Self {
        id.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-client counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStats {
    #[serde(default)]
    pub orders_analyzed: u64,
    #[serde(default)]
    pub orders_packed: u64,
    #[serde(default)]
    pub sessions: u64,
}

impl ClientStats {
    fn merge(&mut self, other: &ClientStats) {
        self.orders_analyzed = self.orders_analyzed.saturating_add(other.orders_analyzed);
        self.orders_packed = self.orders_packed.saturating_add(other.orders_packed);
        self.sessions = self.sessions.saturating_add(other.sessions);
    }
}

/// Merges keys that differ only in case, as written by older writers
fn deserialize_client_map<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<ClientId, ClientStats>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, ClientStats>::deserialize(deserializer)?;
    let mut merged: BTreeMap<ClientId, ClientStats> = BTreeMap::new();
    for (key, stats) in raw {
        merged.entry(ClientId::new(&key)).or_default().merge(&stats);
    }
    Ok(merged)
}

/// Same merge for the per-client session sets
fn deserialize_session_map<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<ClientId, BTreeSet<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, BTreeSet<String>>::deserialize(deserializer)?;
    let mut merged: BTreeMap<ClientId, BTreeSet<String>> = BTreeMap::new();
    for (key, sessions) in raw {
        merged.entry(ClientId::new(&key)).or_default().extend(sessions);
    }
    Ok(merged)
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Global counters document (`global_stats.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalStats {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub total_orders_analyzed: u64,
    pub total_orders_packed: u64,
    pub total_sessions: u64,
    #[serde(default, deserialize_with = "deserialize_client_map")]
    pub by_client: BTreeMap<ClientId, ClientStats>,
    /// Session ids already counted in `sessions`, per client
    #[serde(default, deserialize_with = "deserialize_session_map")]
    pub counted_sessions: BTreeMap<ClientId, BTreeSet<String>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            total_orders_analyzed: 0,
            total_orders_packed: 0,
            total_sessions: 0,
            by_client: BTreeMap::new(),
            counted_sessions: BTreeMap::new(),
            created_at: now,
            last_updated: now,
        }
    }
}

impl GlobalStats {
    /// Count one analysis run; returns whether `session_id` was new for the client
    pub fn apply_analysis(
        &mut self,
        client_id: &ClientId,
        session_id: &str,
        orders: u64,
        now: DateTime<Utc>,
    ) -> bool {
        self.total_orders_analyzed = self.total_orders_analyzed.saturating_add(orders);
        let client = self.by_client.entry(client_id.clone()).or_default();
        client.orders_analyzed = client.orders_analyzed.saturating_add(orders);

        let new_session = self.count_session(client_id, session_id);
        self.touch(now);
        new_session
    }

    /// Count one packing run; returns whether `session_id` was new for the client
    pub fn apply_packing(
        &mut self,
        client_id: &ClientId,
        session_id: &str,
        orders_packed: u64,
        now: DateTime<Utc>,
    ) -> bool {
        self.total_orders_packed = self.total_orders_packed.saturating_add(orders_packed);
        let client = self.by_client.entry(client_id.clone()).or_default();
        client.orders_packed = client.orders_packed.saturating_add(orders_packed);

        let new_session = self.count_session(client_id, session_id);
        self.touch(now);
        new_session
    }

    /// Whether `session_id` has been counted for this client
    pub fn is_session_counted(&self, client_id: &ClientId, session_id: &str) -> bool {
        self.counted_sessions
            .get(client_id)
            .map_or(false, |sessions| sessions.contains(session_id))
    }

    /// Bump the session counters the first time a (client, session) pair is seen
    fn count_session(&mut self, client_id: &ClientId, session_id: &str) -> bool {
        let inserted = self
            .counted_sessions
            .entry(client_id.clone())
            .or_default()
            .insert(session_id.to_string());
        if inserted {
            self.total_sessions = self.total_sessions.saturating_add(1);
            let client = self.by_client.entry(client_id.clone()).or_default();
            client.sessions = client.sessions.saturating_add(1);
        }
        inserted
    }

    pub fn client(&self, client_id: &ClientId) -> Option<&ClientStats> {
        self.by_client.get(client_id)
    }

    /// Totals equal the sum of the per-client counters
    pub fn is_consistent(&self) -> bool {
        let analyzed = self
            .by_client
            .values()
            .fold(0u64, |acc, c| acc.saturating_add(c.orders_analyzed));
        let packed = self
            .by_client
            .values()
            .fold(0u64, |acc, c| acc.saturating_add(c.orders_packed));
        analyzed == self.total_orders_analyzed && packed == self.total_orders_packed
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.schema_version = SCHEMA_VERSION;
        self.last_updated = now;
    }
}

/// Which tool produced a history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    Analysis,
    Packing,
}

impl Tool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tool::Analysis => "analysis",
            Tool::Packing => "packing",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters recorded by each tool, tagged by the `tool` field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "lowercase")]
pub enum HistoryCounts {
    Analysis {
        orders_count: u64,
        fulfillable_count: u64,
    },
    Packing {
        orders_packed: u64,
    },
}

/// One recorded analysis or packing run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub client_id: ClientId,
    pub session_id: String,
    #[serde(flatten)]
    pub counts: HistoryCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// `hostname:pid` of the process that recorded the entry
    #[serde(default)]
    pub recorded_by: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl HistoryEntry {
    pub fn tool(&self) -> Tool {
        match self.counts {
            HistoryCounts::Analysis { .. } => Tool::Analysis,
            HistoryCounts::Packing { .. } => Tool::Packing,
        }
    }
}

/// Capped history log, oldest entry first on disk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryLog {
    entries: Vec<HistoryEntry>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `entry` and drop the oldest entries beyond `cap`; returns how many were dropped
    pub fn append(&mut self, entry: HistoryEntry, cap: usize) -> usize {
        self.entries.push(entry);
        self.trim(cap)
    }

    /// Drop the oldest entries beyond `cap`
    pub fn trim(&mut self, cap: usize) -> usize {
        let excess = self.entries.len().saturating_sub(cap);
        if excess > 0 {
            self.entries.drain(..excess);
        }
        excess
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries oldest first
    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// Entries newest first, optionally restricted to one client and truncated
    pub fn newest_first(&self, client_id: Option<&ClientId>, limit: Option<usize>) -> Vec<HistoryEntry> {
        self.entries
            .iter()
            .rev()
            .filter(|entry| client_id.map_or(true, |id| &entry.client_id == id))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Entries of one session, newest first
    pub fn session_entries(&self, session_id: &str) -> Vec<HistoryEntry> {
        self.entries
            .iter()
            .rev()
            .filter(|entry| entry.session_id == session_id)
            .cloned()
            .collect()
    }
}
