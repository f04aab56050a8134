//! Deduplication store for answered mentions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::types::{Outcome, ProcessingRecord};

#[derive(Debug, Clone)]
pub struct DedupStore {
    records: HashMap<String, ProcessingRecord>,
    capacity: usize,
}

impl DedupStore {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            records: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Rebuild a store from persisted records.
    #[must_use]
    pub fn from_records(records: Vec<ProcessingRecord>, capacity: usize) -> Self {
        let mut store = Self::new(capacity);
        store.records = records
            .into_iter()
            .map(|record| (record.mention_id.clone(), record))
            .collect();
        store.evict();
        store
    }

    /// Returns true once the mention has reached a terminal outcome.
    #[must_use]
    pub fn has_processed(&self, id: &str) -> bool {
        self.outcome(id).is_some()
    }

    #[must_use]
    pub fn outcome(&self, id: &str) -> Option<Outcome> {
        self.records.get(id).and_then(|record| record.outcome)
    }

    #[must_use]
    pub fn record(&self, id: &str) -> Option<&ProcessingRecord> {
        self.records.get(id)
    }

    #[must_use]
    pub fn attempts(&self, id: &str) -> u32 {
        self.records.get(id).map_or(0, |record| record.attempts)
    }

    /// Count one more attempt for `id` and return the new total.
    pub fn record_attempt(&mut self, id: &str, now: DateTime<Utc>) -> u32 {
        let record = self.entry(id, now);
        record.attempts += 1;
        record.updated_at = now;
        record.attempts
    }

    /// Record the terminal outcome for `id`.
    ///
    /// Returns false, leaving the store unchanged, if the mention already had one.
    pub fn mark_processed(&mut self, id: &str, outcome: Outcome, now: DateTime<Utc>) -> bool {
        let record = self.entry(id, now);
        if let Some(existing) = record.outcome {
            warn!("Mention {id} already recorded as {existing}, ignoring {outcome}");
            return false;
        }
        record.outcome = Some(outcome);
        record.updated_at = now;
        debug!("Recorded mention {id} as {outcome}");
        self.evict();
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProcessingRecord> {
        let mut records: Vec<ProcessingRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.mention_id.cmp(&b.mention_id))
        });
        records
    }

    fn entry(&mut self, id: &str, now: DateTime<Utc>) -> &mut ProcessingRecord {
        self.records
            .entry(id.to_string())
            .or_insert_with(|| ProcessingRecord {
                mention_id: id.to_string(),
                outcome: None,
                updated_at: now,
                attempts: 0,
            })
    }

    /// Drop the oldest terminal records until the store fits its capacity.
    fn evict(&mut self) {
        if self.records.len() <= self.capacity {
            return;
        }

        let mut terminal: Vec<(DateTime<Utc>, String)> = self
            .records
            .values()
            .filter(|record| record.outcome.is_some())
            .map(|record| (record.updated_at, record.mention_id.clone()))
            .collect();
        terminal.sort();

        let excess = self.records.len() - self.capacity;
        for (_, id) in terminal.into_iter().take(excess) {
            self.records.remove(&id);
        }
        debug!("Evicted old records, {} remain", self.records.len());
    }
}
