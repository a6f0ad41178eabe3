//! Persistence seam.
//!
//! A `Store` hands out isolated sessions. Each session owns its own staging
//! area and transaction, so one file's staged rows can only be merged by that
//! file's commit. Uniqueness on the merge key is the store's job; the
//! pipeline holds no lock of its own.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::coordinator::FileOutcome;
use crate::error::Result;
use crate::model::CanonicalRecord;

#[async_trait]
pub trait Store: Send + Sync {
    /// Opens a session with its own connection, transaction and staging area.
    async fn begin(&self) -> Result<Box<dyn StoreSession>>;

    /// Appends one file's outcome to the audit log. No-op by default.
    async fn record_outcome(&self, _run_id: Uuid, _outcome: &FileOutcome) -> Result<()> {
        Ok(())
    }
}

/// One unit of work against the store. Dropping without `commit` rolls back.
#[async_trait]
pub trait StoreSession: Send {
    /// Copies `records` into this session's staging area.
    async fn stage(&mut self, records: &[CanonicalRecord]) -> Result<u64>;

    /// Inserts staged rows whose merge key is absent from the durable table.
    /// Returns the number of rows inserted.
    async fn merge_staged_into_main(&mut self) -> Result<u64>;

    async fn clear_staging(&mut self) -> Result<()>;

    /// Insert-if-absent straight into the durable table, skipping staging.
    async fn insert_if_absent(&mut self, records: &[CanonicalRecord]) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;
}
