//! Daily case-report ingestion.
//!
//! Reads dated CSV snapshots whose layout drifted over time, normalizes
//! every row onto one canonical record shape and loads the result into a
//! durable table keyed on `(country, state, admin2, timestamp)`. Loading is
//! insert-if-absent, so replaying any subset of files is harmless.

pub mod aliases;
pub mod columns;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod normalize;
pub mod regions;
pub mod source;
pub mod store;
pub mod values;

pub use aliases::AliasTables;
pub use columns::{ColumnMap, ColumnMapper};
pub use coordinator::{
    CoordinatorConfig, FailurePolicy, FileOutcome, FileState, IngestReport, IngestionCoordinator,
    LoadMode,
};
pub use error::{IngestError, Result};
pub use model::{CanonicalAttribute, CanonicalRecord, MergeKey, RawRow, RawValue};
pub use normalize::RecordNormalizer;
pub use regions::RegionCanonicalizer;
pub use source::{discover_snapshots, CsvDirectorySource, RawSnapshot, RecordSource, SnapshotFile};
pub use store::{MemoryStore, PgStore, Store, StoreSession};
pub use values::ValueNormalizer;
