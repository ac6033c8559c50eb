use std::str::FromStr;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use common::{Error, Result, TickRecord};

/// Rows fetched per batch when streaming a range query.
const RANGE_BATCH: i64 = 5_000;

/// Durable per-pair trade tick storage.
///
/// One table per trading pair inside a single SQLite file, named after the
/// pair's canonical alternate name. Tables grow monotonically through
/// `append`; nothing else ever writes to them. A uniqueness constraint on
/// `(timestamp, price, volume)` absorbs overlapping pages re-fetched after
/// an interrupted run, which is what makes `last_timestamp` safe to use as
/// the resume checkpoint.
#[derive(Clone)]
pub struct TickStore {
    pool: SqlitePool,
}

impl TickStore {
    /// Open (or create) the database at `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool (used by tests with an in-memory database).
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create an empty ledger for a pair if it does not exist yet.
    pub async fn create_ledger(&self, pair_altname: &str) -> Result<()> {
        let table = ledger_table(pair_altname)?;
        self.ensure_table(&table).await
    }

    /// Append records in the given (chronological) order, creating the pair
    /// table on first use. Returns the number of rows actually inserted;
    /// exact duplicates of already-stored rows are ignored.
    pub async fn append(&self, pair_altname: &str, records: &[TickRecord]) -> Result<u64> {
        let table = ledger_table(pair_altname)?;
        self.ensure_table(&table).await?;
        if records.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            r#"INSERT OR IGNORE INTO "{table}" (timestamp, price, volume) VALUES (?1, ?2, ?3)"#
        );
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for record in records {
            inserted += sqlx::query(&sql)
                .bind(record.timestamp)
                .bind(record.price)
                .bind(record.volume)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        debug!(
            table = %table,
            offered = records.len(),
            inserted,
            "Appended tick records"
        );
        Ok(inserted)
    }

    /// Maximum stored timestamp for a pair, or `None` when the pair's table
    /// is empty or does not exist.
    pub async fn last_timestamp(&self, pair_altname: &str) -> Result<Option<f64>> {
        let table = ledger_table(pair_altname)?;
        if !self.table_exists(&table).await? {
            return Ok(None);
        }
        let max: Option<f64> =
            sqlx::query_scalar(&format!(r#"SELECT MAX(timestamp) FROM "{table}""#))
                .fetch_one(&self.pool)
                .await?;
        Ok(max)
    }

    /// Stream a pair's records ordered by timestamp ascending, optionally
    /// bounded by `start`/`end`. Lazy: rows are pulled from the database in
    /// batches as the stream is consumed, and calling again restarts.
    pub async fn range(
        &self,
        pair_altname: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<BoxStream<'static, Result<TickRecord>>> {
        let table = ledger_table(pair_altname)?;
        if !self.table_exists(&table).await? {
            return Ok(stream::empty().boxed());
        }

        let lo = start.map(datetime_secs).unwrap_or(f64::NEG_INFINITY);
        let hi = end.map(datetime_secs).unwrap_or(f64::INFINITY);
        let pool = self.pool.clone();

        // Keyset pagination on (timestamp, rowid) so ties on timestamp
        // never skip or repeat rows across batch boundaries.
        let state = (pool, table, f64::NEG_INFINITY, i64::MIN, lo, hi);
        let batches = stream::try_unfold(
            state,
            |(pool, table, after_ts, after_rowid, lo, hi)| async move {
                let sql = format!(
                    r#"SELECT timestamp, price, volume, rowid FROM "{table}"
                       WHERE timestamp >= ?1 AND timestamp <= ?2
                         AND (timestamp > ?3 OR (timestamp = ?3 AND rowid > ?4))
                       ORDER BY timestamp ASC, rowid ASC
                       LIMIT {RANGE_BATCH}"#
                );
                let rows = sqlx::query(&sql)
                    .bind(lo)
                    .bind(hi)
                    .bind(after_ts)
                    .bind(after_rowid)
                    .fetch_all(&pool)
                    .await
                    .map_err(Error::from)?;

                let Some(last) = rows.last() else {
                    return Ok::<_, Error>(None);
                };
                let next_ts: f64 = last.get(0);
                let next_rowid: i64 = last.get(3);

                let batch: Vec<TickRecord> = rows
                    .iter()
                    .map(|row| TickRecord {
                        timestamp: row.get(0),
                        price: row.get(1),
                        volume: row.get(2),
                    })
                    .collect();

                Ok(Some((batch, (pool, table, next_ts, next_rowid, lo, hi))))
            },
        );

        Ok(batches
            .map_ok(|batch| stream::iter(batch.into_iter().map(Ok)))
            .try_flatten()
            .boxed())
    }

    async fn ensure_table(&self, table: &str) -> Result<()> {
        let sql = format!(
            r#"CREATE TABLE IF NOT EXISTS "{table}" (
                   timestamp REAL NOT NULL,
                   price     REAL NOT NULL,
                   volume    REAL NOT NULL,
                   UNIQUE (timestamp, price, volume)
               )"#
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let found: Option<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
        )
        .bind(table)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }
}

fn datetime_secs(dt: DateTime<Utc>) -> f64 {
    dt.timestamp_millis() as f64 / 1000.0
}

/// Derive the ledger table name from a pair's alternate name.
///
/// Alternate names are alphanumeric with an optional `.d` dark pool suffix;
/// mapping `.` to `_` keeps the derivation injective, so two different
/// canonical names never share a table.
pub fn ledger_table(pair_altname: &str) -> Result<String> {
    if pair_altname.is_empty() {
        return Err(Error::Naming(pair_altname.to_string()));
    }
    pair_altname
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' => Ok(c),
            '.' => Ok('_'),
            _ => Err(Error::Naming(pair_altname.to_string())),
        })
        .collect()
}
