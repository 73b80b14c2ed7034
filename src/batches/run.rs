//! A single batch run.

use crate::types::{BatchRunId, Key, PriceInput, Timestamp};
use std::collections::HashMap;

/// Prices staged by one producer, at most one per instrument.
#[derive(Clone, Debug)]
pub struct BatchRun {
    id: BatchRunId,
    records: HashMap<Key, PriceInput>,
    created_at: Timestamp,
    updated_at: Timestamp,
}

impl BatchRun {
    pub fn new(id: BatchRunId, now: Timestamp) -> Self {
        Self {
            id,
            records: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> BatchRunId {
        self.id
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    pub(crate) fn touch(&mut self, now: Timestamp) {
        self.updated_at = now;
    }

    /// Stage records. Per instrument, the record with the latest claimed
    /// time is kept; on a tie the later upload wins.
    pub fn update_records<I>(&mut self, records: I)
    where
        I: IntoIterator<Item = PriceInput>,
    {
        for record in records {
            let superseded = self
                .records
                .get(&record.key)
                .is_some_and(|existing| existing.claimed_at > record.claimed_at);
            if !superseded {
                self.records.insert(record.key.clone(), record);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&PriceInput> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Staged records ordered by key.
    pub fn into_records(self) -> Vec<PriceInput> {
        let mut records: Vec<_> = self.records.into_values().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }
}
