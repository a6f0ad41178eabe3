use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::{Store, StoreSession};
use crate::coordinator::FileOutcome;
use crate::error::Result;
use crate::model::CanonicalRecord;

/// Columns written by the pipeline, in bind order.
const RECORD_COLUMNS: &str = r#""timestamp", timestamp_id, country, state, admin2, latitude, longitude, confirmed, deaths, recovered, active, incidence, case_fatality_ratio"#;

const STAGING_TABLE: &str = "case_reports_staging";

/// Postgres caps a statement at 65535 binds; 13 per row.
const INSERT_CHUNK_ROWS: usize = 2_000;

/// Session-scoped staging table. TEMP tables are private to the connection,
/// so concurrent sessions never see each other's rows.
const CREATE_STAGING_SQL: &str = r#"
CREATE TEMP TABLE IF NOT EXISTS case_reports_staging (
    "timestamp"         TIMESTAMPTZ,
    timestamp_id        BIGINT NOT NULL,
    country             TEXT,
    state               TEXT,
    admin2              TEXT,
    latitude            DOUBLE PRECISION,
    longitude           DOUBLE PRECISION,
    confirmed           BIGINT,
    deaths              BIGINT,
    recovered           BIGINT,
    active              BIGINT,
    incidence           DOUBLE PRECISION,
    case_fatality_ratio DOUBLE PRECISION
) ON COMMIT DELETE ROWS
"#;

const ON_CONFLICT_SQL: &str = " ON CONFLICT ON CONSTRAINT case_reports_merge_key DO NOTHING";

/// Merge-key order shared by every writer, so concurrent sessions take row
/// locks in the same sequence and cannot deadlock on overlapping keys.
/// Byte collation with nulls first matches the ordering of `MergeKey`.
const MERGE_KEY_ORDER_SQL: &str = r#" ORDER BY country COLLATE "C" NULLS FIRST, state COLLATE "C" NULLS FIRST, admin2 COLLATE "C" NULLS FIRST, "timestamp" NULLS FIRST"#;

fn merge_sql() -> String {
    format!(
        "INSERT INTO case_reports ({cols}) SELECT {cols} FROM {staging}{order}{conflict}",
        cols = RECORD_COLUMNS,
        staging = STAGING_TABLE,
        order = MERGE_KEY_ORDER_SQL,
        conflict = ON_CONFLICT_SQL,
    )
}

/// `records` in merge-key order.
fn in_merge_key_order(records: &[CanonicalRecord]) -> Vec<&CanonicalRecord> {
    let mut sorted: Vec<&CanonicalRecord> = records.iter().collect();
    sorted.sort_by_cached_key(|r| r.merge_key());
    sorted
}

/// Postgres-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// `max_connections` bounds how many files can load at once.
    pub async fn connect(db_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(db_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreSession>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(CREATE_STAGING_SQL).execute(&mut *tx).await?;
        Ok(Box::new(PgSession { tx }))
    }

    async fn record_outcome(&self, run_id: Uuid, outcome: &FileOutcome) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingest_runs
            (run_id, file_name, content_hash, timestamp_id, state, records, inserted, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (run_id, file_name) DO UPDATE
            SET state = EXCLUDED.state, inserted = EXCLUDED.inserted, error = EXCLUDED.error,
                finished_at = now()
            "#,
        )
        .bind(run_id)
        .bind(&outcome.file)
        .bind(&outcome.content_hash)
        .bind(outcome.timestamp_id)
        .bind(outcome.state.as_str())
        .bind(outcome.records as i64)
        .bind(outcome.inserted as i64)
        .bind(&outcome.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

struct PgSession {
    tx: Transaction<'static, Postgres>,
}

impl PgSession {
    /// Multi-row insert of `records` into `table`, chunked under the bind limit.
    async fn insert_rows(
        &mut self,
        table: &str,
        records: &[&CanonicalRecord],
        on_conflict: Option<&str>,
    ) -> Result<u64> {
        let mut affected = 0;
        for chunk in records.chunks(INSERT_CHUNK_ROWS) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} ({}) ", table, RECORD_COLUMNS));
            qb.push_values(chunk, |mut row, r| {
                row.push_bind(r.timestamp)
                    .push_bind(r.timestamp_id)
                    .push_bind(r.country.clone())
                    .push_bind(r.state.clone())
                    .push_bind(r.admin2.clone())
                    .push_bind(r.latitude)
                    .push_bind(r.longitude)
                    .push_bind(r.confirmed)
                    .push_bind(r.deaths)
                    .push_bind(r.recovered)
                    .push_bind(r.active)
                    .push_bind(r.incidence)
                    .push_bind(r.case_fatality_ratio);
            });
            if let Some(clause) = on_conflict {
                qb.push(clause);
            }
            affected += qb.build().execute(&mut *self.tx).await?.rows_affected();
        }
        Ok(affected)
    }
}

#[async_trait]
impl StoreSession for PgSession {
    async fn stage(&mut self, records: &[CanonicalRecord]) -> Result<u64> {
        let rows: Vec<&CanonicalRecord> = records.iter().collect();
        self.insert_rows(STAGING_TABLE, &rows, None).await
    }

    async fn merge_staged_into_main(&mut self) -> Result<u64> {
        let result = sqlx::query(&merge_sql()).execute(&mut *self.tx).await?;
        debug!(inserted = result.rows_affected(), "merged staging into case_reports");
        Ok(result.rows_affected())
    }

    async fn clear_staging(&mut self) -> Result<()> {
        sqlx::query("TRUNCATE case_reports_staging")
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_if_absent(&mut self, records: &[CanonicalRecord]) -> Result<u64> {
        let rows = in_merge_key_order(records);
        self.insert_rows("case_reports", &rows, Some(ON_CONFLICT_SQL))
            .await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
