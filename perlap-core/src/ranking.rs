//! Time-trial ranking
//!
//! The ranking is a list of finished runs kept sorted by total time. Runs
//! with equal totals share a position; a new run lands after the existing
//! ones it ties with.

use crate::error::CoreError;
use anyhow::Result;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// One finished run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingEntry {
    pub player: String,
    pub total_ms: u64,
    pub laps: u32,
    pub lap_times_ms: Vec<u64>,
    pub best_lap_ms: u64,
    pub date: NaiveDateTime,
}

/// A ranking entry together with its 1-based position
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Placement {
    #[serde(flatten)]
    pub entry: RankingEntry,
    pub position: usize,
}

/// Entries sorted ascending by total time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<RankingEntry>", into = "Vec<RankingEntry>")]
pub struct Ranking {
    entries: Vec<RankingEntry>,
}

impl Ranking {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[RankingEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Position a run with this total would take: 1 + number of strictly
    /// faster runs
    pub fn position_for(&self, total_ms: u64) -> usize {
        self.entries.partition_point(|e| e.total_ms < total_ms) + 1
    }

    /// Insert keeping the order, returning the entry's position
    pub fn insert(&mut self, entry: RankingEntry) -> usize {
        let position = self.position_for(entry.total_ms);
        let at = self.entries.partition_point(|e| e.total_ms <= entry.total_ms);
        self.entries.insert(at, entry);
        position
    }

    pub fn remove(&mut self, index: usize) -> Option<RankingEntry> {
        (index < self.entries.len()).then(|| self.entries.remove(index))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_pretty(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl From<Vec<RankingEntry>> for Ranking {
    fn from(mut entries: Vec<RankingEntry>) -> Self {
        entries.sort_by_key(|e| e.total_ms);
        Self { entries }
    }
}

impl From<Ranking> for Vec<RankingEntry> {
    fn from(r: Ranking) -> Self {
        r.entries
    }
}

/// Where the ranking lives between runs
pub trait RankingStore: Send {
    /// Unreadable or corrupt storage reads as an empty ranking
    fn load(&self) -> Ranking;

    fn save(&mut self, ranking: &Ranking) -> Result<()>;
}
