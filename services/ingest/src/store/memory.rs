use async_trait::async_trait;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::{Store, StoreSession};
use crate::coordinator::FileOutcome;
use crate::error::Result;
use crate::model::{CanonicalRecord, MergeKey};

#[derive(Default)]
struct Tables {
    rows: BTreeMap<MergeKey, CanonicalRecord>,
    outcomes: Vec<(Uuid, FileOutcome)>,
}

/// In-process store with the same merge semantics as the Postgres one.
///
/// Writes become visible on commit; an uncommitted session leaves no trace.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        lock(&self.tables)
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().rows.is_empty()
    }

    /// Committed rows ordered by merge key.
    pub fn records(&self) -> Vec<CanonicalRecord> {
        self.lock().rows.values().cloned().collect()
    }

    pub fn outcomes(&self) -> Vec<(Uuid, FileOutcome)> {
        self.lock().outcomes.clone()
    }
}

fn lock(tables: &Mutex<Tables>) -> MutexGuard<'_, Tables> {
    tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreSession>> {
        Ok(Box::new(MemorySession {
            tables: self.tables.clone(),
            staging: Vec::new(),
            pending: Vec::new(),
        }))
    }

    async fn record_outcome(&self, run_id: Uuid, outcome: &FileOutcome) -> Result<()> {
        self.lock().outcomes.push((run_id, outcome.clone()));
        Ok(())
    }
}

struct MemorySession {
    tables: Arc<Mutex<Tables>>,
    staging: Vec<CanonicalRecord>,
    pending: Vec<CanonicalRecord>,
}

impl MemorySession {
    /// Queues every record whose key is neither committed nor already queued.
    fn queue_absent(&mut self, records: Vec<CanonicalRecord>) -> u64 {
        let tables = lock(&self.tables);
        let mut seen: HashSet<MergeKey> = self.pending.iter().map(|r| r.merge_key()).collect();
        let mut inserted = 0;
        for record in records {
            let key = record.merge_key();
            if tables.rows.contains_key(&key) || !seen.insert(key) {
                continue;
            }
            self.pending.push(record);
            inserted += 1;
        }
        inserted
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn stage(&mut self, records: &[CanonicalRecord]) -> Result<u64> {
        self.staging.extend_from_slice(records);
        Ok(records.len() as u64)
    }

    async fn merge_staged_into_main(&mut self) -> Result<u64> {
        let staged = self.staging.clone();
        Ok(self.queue_absent(staged))
    }

    async fn clear_staging(&mut self) -> Result<()> {
        self.staging.clear();
        Ok(())
    }

    async fn insert_if_absent(&mut self, records: &[CanonicalRecord]) -> Result<u64> {
        Ok(self.queue_absent(records.to_vec()))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemorySession {
            tables: shared,
            pending,
            ..
        } = *self;
        let mut tables = lock(&shared);
        let mut applied = 0;
        for record in pending {
            // A concurrent session may have committed the same key meanwhile.
            if let Entry::Vacant(slot) = tables.rows.entry(record.merge_key()) {
                slot.insert(record);
                applied += 1;
            }
        }
        debug!(applied, "memory session committed");
        Ok(())
    }
}
