//! The SQL warehouse contract.
//!
//! The core assumes a durable store with `CREATE TABLE AS`, `DROP TABLE`,
//! an existence probe, relation sizes and a row-streaming SELECT. Everything
//! the server persists (the cache metadata tables and the materialised
//! relations themselves) goes through this trait, which keeps the scheduler
//! and cache testable against [`MemoryWarehouse`] without a running
//! Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use log::{debug, warn};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Column, Row};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::cache::QueryRecord;
use crate::error::{Error, Result};
use crate::fingerprint::QueryId;

/// A bounded stream of result rows, each rendered as a JSON object. The
/// producer reads from a server-side cursor; at no point is the full result
/// held in memory.
pub type RowStream = BoxStream<'static, Result<Value>>;

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Create the `cache` schema and its three tables if absent.
    async fn ensure_cache_schema(&self) -> Result<()>;

    /// All persisted query records, dependency edges attached.
    async fn load_records(&self) -> Result<Vec<QueryRecord>>;

    /// Insert or update one record. Atomic per id.
    async fn upsert_record(&self, record: &QueryRecord) -> Result<()>;

    /// Record the edges `id -> dep` for every dep. Idempotent.
    async fn insert_dependencies(&self, id: &QueryId, deps: &[QueryId]) -> Result<()>;

    /// Persist an access-count bump.
    async fn record_access(&self, id: &QueryId, count: i64, at: DateTime<Utc>) -> Result<()>;

    /// Delete the record and the dependency edges where it is the source.
    /// Edges pointing *to* it are the referencing records' business.
    async fn delete_record(&self, id: &QueryId) -> Result<()>;

    async fn load_cache_config(&self) -> Result<BTreeMap<String, String>>;

    async fn store_cache_config(&self, key: &str, value: &str) -> Result<()>;

    /// Materialise `select` into `schema.table`. Cancellation is handled by
    /// the caller dropping this future and issuing [`Warehouse::drop_table`]
    /// on the partial target.
    async fn create_table_as(&self, schema: &str, table: &str, select: &str) -> Result<()>;

    async fn drop_table(&self, schema: &str, table: &str) -> Result<()>;

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool>;

    async fn relation_size_bytes(&self, schema: &str, table: &str) -> Result<i64>;

    /// Execute `sql` and stream its rows.
    async fn stream_rows(&self, sql: &str) -> Result<RowStream>;
}

// ---------------------------------------------------------------------------
// Postgres

/// The production implementation over a bounded sqlx connection pool. A
/// worker holds a connection only for the duration of one statement.
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub fn new(pool: PgPool) -> Self {
        PgWarehouse { pool }
    }
}

const CACHE_DDL: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS cache",
    "CREATE TABLE IF NOT EXISTS cache.cached ( \
         query_id CHAR(32) PRIMARY KEY, \
         version TEXT, \
         query TEXT, \
         created TIMESTAMPTZ, \
         access_count INT, \
         last_accessed TIMESTAMPTZ, \
         compute_time NUMERIC, \
         cache_score_multiplier NUMERIC, \
         class TEXT, \
         schema TEXT, \
         tablename TEXT, \
         obj BYTEA)",
    "CREATE TABLE IF NOT EXISTS cache.dependencies ( \
         query_id CHAR(32), \
         depends_on CHAR(32), \
         PRIMARY KEY (query_id, depends_on))",
    "CREATE TABLE IF NOT EXISTS cache.cache_config ( \
         key TEXT PRIMARY KEY, \
         value TEXT)",
];

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn ensure_cache_schema(&self) -> Result<()> {
        for statement in CACHE_DDL {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn load_records(&self) -> Result<Vec<QueryRecord>> {
        let rows = sqlx::query(
            "SELECT query_id, version, query, created, access_count, last_accessed, \
                    compute_time::float8 AS compute_time, \
                    cache_score_multiplier::float8 AS cache_score_multiplier, \
                    class, schema, tablename \
             FROM cache.cached",
        )
        .fetch_all(&self.pool)
        .await?;

        let edges = sqlx::query("SELECT query_id, depends_on FROM cache.dependencies")
            .fetch_all(&self.pool)
            .await?;
        let mut deps_by_id: BTreeMap<String, Vec<QueryId>> = BTreeMap::new();
        for edge in &edges {
            let id: String = edge.try_get("query_id")?;
            let dep: String = edge.try_get("depends_on")?;
            deps_by_id
                .entry(id.trim().to_owned())
                .or_default()
                .push(QueryId::new(dep.trim()));
        }

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.try_get("query_id")?;
            let id = id.trim().to_owned();
            // Every column except the key is nullable in the persisted
            // layout; rows written by older engine versions get defaults.
            let now = Utc::now();
            records.push(QueryRecord {
                query_id: QueryId::new(id.clone()),
                version: row
                    .try_get::<Option<String>, _>("version")?
                    .unwrap_or_default(),
                query_kind: row
                    .try_get::<Option<String>, _>("class")?
                    .unwrap_or_default(),
                spec_json: row
                    .try_get::<Option<String>, _>("query")?
                    .unwrap_or_default(),
                created: row
                    .try_get::<Option<_>, _>("created")?
                    .unwrap_or(now),
                access_count: row
                    .try_get::<Option<i32>, _>("access_count")?
                    .unwrap_or(0) as i64,
                last_accessed: row
                    .try_get::<Option<_>, _>("last_accessed")?
                    .unwrap_or(now),
                compute_time_ms: row
                    .try_get::<Option<f64>, _>("compute_time")?
                    .unwrap_or(0.0),
                cache_score_multiplier: row.try_get("cache_score_multiplier")?,
                schema: row.try_get("schema")?,
                tablename: row.try_get("tablename")?,
                size_bytes: 0,
                deps: deps_by_id.remove(&id).unwrap_or_default(),
            });
        }
        Ok(records)
    }

    async fn upsert_record(&self, record: &QueryRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO cache.cached \
                 (query_id, version, query, created, access_count, last_accessed, \
                  compute_time, cache_score_multiplier, class, schema, tablename) \
             VALUES ($1, $2, $3, $4, $5, $6, $7::numeric, $8::numeric, $9, $10, $11) \
             ON CONFLICT (query_id) DO UPDATE SET \
                 version = EXCLUDED.version, \
                 query = EXCLUDED.query, \
                 created = EXCLUDED.created, \
                 access_count = EXCLUDED.access_count, \
                 last_accessed = EXCLUDED.last_accessed, \
                 compute_time = EXCLUDED.compute_time, \
                 cache_score_multiplier = EXCLUDED.cache_score_multiplier, \
                 class = EXCLUDED.class, \
                 schema = EXCLUDED.schema, \
                 tablename = EXCLUDED.tablename",
        )
        .bind(record.query_id.as_str())
        .bind(&record.version)
        .bind(&record.query_kind)
        .bind(&record.spec_json)
        .bind(record.created)
        .bind(record.access_count as i32)
        .bind(record.last_accessed)
        .bind(record.compute_time_ms)
        .bind(record.cache_score_multiplier)
        .bind(&record.schema)
        .bind(&record.tablename)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_dependencies(&self, id: &QueryId, deps: &[QueryId]) -> Result<()> {
        for dep in deps {
            sqlx::query(
                "INSERT INTO cache.dependencies (query_id, depends_on) \
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(id.as_str())
            .bind(dep.as_str())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn record_access(&self, id: &QueryId, count: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE cache.cached SET access_count = $2, last_accessed = $3 WHERE query_id = $1",
        )
        .bind(id.as_str())
        .bind(count as i32)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_record(&self, id: &QueryId) -> Result<()> {
        sqlx::query("DELETE FROM cache.dependencies WHERE query_id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM cache.cached WHERE query_id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_cache_config(&self) -> Result<BTreeMap<String, String>> {
        let rows = sqlx::query("SELECT key, value FROM cache.cache_config")
            .fetch_all(&self.pool)
            .await?;
        let mut config = BTreeMap::new();
        for row in &rows {
            config.insert(row.try_get("key")?, row.try_get("value")?);
        }
        Ok(config)
    }

    async fn store_cache_config(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO cache.cache_config (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_table_as(&self, schema: &str, table: &str, select: &str) -> Result<()> {
        let statement = format!("CREATE TABLE {schema}.{table} AS {select}");
        debug!("warehouse: {statement}");
        sqlx::query(&statement).execute(&self.pool).await?;
        Ok(())
    }

    async fn drop_table(&self, schema: &str, table: &str) -> Result<()> {
        let statement = format!("DROP TABLE IF EXISTS {schema}.{table}");
        sqlx::query(&statement).execute(&self.pool).await?;
        Ok(())
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = $1 AND table_name = $2)",
        )
        .bind(schema)
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn relation_size_bytes(&self, schema: &str, table: &str) -> Result<i64> {
        let size: i64 = sqlx::query_scalar("SELECT pg_total_relation_size(($1 || '.' || $2)::regclass)")
            .bind(schema)
            .bind(table)
            .fetch_one(&self.pool)
            .await?;
        Ok(size)
    }

    async fn stream_rows(&self, sql: &str) -> Result<RowStream> {
        // The sqlx stream borrows the SQL text, so the cursor is driven from
        // a task that owns it and rows are handed over a bounded channel.
        // The channel capacity is the only buffering between the warehouse
        // cursor and the consumer.
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Value>>(64);
        let pool = self.pool.clone();
        let sql = sql.to_owned();
        tokio::spawn(async move {
            let mut rows = sqlx::query(&sql).fetch(&pool);
            while let Some(next) = rows.next().await {
                let item = next.map(|row| row_to_json(&row)).map_err(Error::from);
                if tx.send(item).await.is_err() {
                    // Consumer went away; closing the stream cancels the
                    // server-side cursor with the connection.
                    break;
                }
            }
        });
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}

/// Render one row as a JSON object, trying the decodings we actually emit
/// (text, integers, floats, booleans, timestamps) and degrading to null for
/// anything exotic rather than failing the whole stream.
fn row_to_json(row: &PgRow) -> Value {
    let mut object = serde_json::Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        let value = if let Ok(v) = row.try_get::<Option<String>, _>(index) {
            v.map(Value::String).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<i32>, _>(index) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<i16>, _>(index) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<f32>, _>(index) {
            v.map(|f| Value::from(f as f64)).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
            v.map(Value::Bool).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<DateTime<Utc>>, _>(index) {
            v.map(|t| Value::String(t.to_rfc3339())).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(index) {
            v.map(|d| Value::String(d.to_string())).unwrap_or(Value::Null)
        } else {
            warn!(
                "stream: column '{}' has an unsupported type, emitting null",
                column.name()
            );
            Value::Null
        };
        object.insert(column.name().to_owned(), value);
    }
    Value::Object(object)
}

// ---------------------------------------------------------------------------
// In-memory twin

#[derive(Clone, Debug, Default)]
struct MemTable {
    rows: Vec<Value>,
    bytes: i64,
}

#[derive(Default)]
struct MemInner {
    records: BTreeMap<String, QueryRecord>,
    dependencies: std::collections::BTreeSet<(String, String)>,
    config: BTreeMap<String, String>,
    tables: BTreeMap<(String, String), MemTable>,
    ddl_log: Vec<String>,
    create_errors: Vec<Error>,
}

/// An in-memory stand-in for the warehouse, used by tests and by nothing
/// else. Behavioural knobs: an artificial delay on `create_table_as` (a
/// suspension point for exercising cancellation), injected creation errors
/// (drained in order), and canned rows/sizes for created tables.
#[derive(Default)]
pub struct MemoryWarehouse {
    inner: parking_lot::Mutex<MemInner>,
    create_delay: parking_lot::Mutex<Option<Duration>>,
    table_rows: parking_lot::Mutex<Vec<Value>>,
    table_bytes: parking_lot::Mutex<i64>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        let wh = MemoryWarehouse::default();
        *wh.table_bytes.lock() = 1000;
        wh
    }

    /// Every subsequent `create_table_as` sleeps this long first.
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = Some(delay);
    }

    /// Rows that created tables will hold (and stream back).
    pub fn set_table_rows(&self, rows: Vec<Value>) {
        *self.table_rows.lock() = rows;
    }

    /// Reported size of subsequently created tables.
    pub fn set_table_bytes(&self, bytes: i64) {
        *self.table_bytes.lock() = bytes;
    }

    /// Queue an error to be returned by the next `create_table_as`.
    pub fn push_create_error(&self, error: Error) {
        self.inner.lock().create_errors.push(error);
    }

    /// All DDL statements observed, in order.
    pub fn ddl_log(&self) -> Vec<String> {
        self.inner.lock().ddl_log.clone()
    }

    pub fn create_count(&self) -> usize {
        self.inner
            .lock()
            .ddl_log
            .iter()
            .filter(|s| s.starts_with("CREATE TABLE"))
            .count()
    }

    /// Pre-materialise a relation, as if a previous run had stored it.
    pub fn seed_table(&self, schema: &str, table: &str, rows: Vec<Value>, bytes: i64) {
        self.inner
            .lock()
            .tables
            .insert((schema.to_owned(), table.to_owned()), MemTable { rows, bytes });
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn ensure_cache_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn load_records(&self) -> Result<Vec<QueryRecord>> {
        Ok(self.inner.lock().records.values().cloned().collect())
    }

    async fn upsert_record(&self, record: &QueryRecord) -> Result<()> {
        self.inner
            .lock()
            .records
            .insert(record.query_id.as_str().to_owned(), record.clone());
        Ok(())
    }

    async fn insert_dependencies(&self, id: &QueryId, deps: &[QueryId]) -> Result<()> {
        let mut inner = self.inner.lock();
        for dep in deps {
            inner
                .dependencies
                .insert((id.as_str().to_owned(), dep.as_str().to_owned()));
        }
        Ok(())
    }

    async fn record_access(&self, id: &QueryId, count: i64, at: DateTime<Utc>) -> Result<()> {
        if let Some(record) = self.inner.lock().records.get_mut(id.as_str()) {
            record.access_count = count;
            record.last_accessed = at;
        }
        Ok(())
    }

    async fn delete_record(&self, id: &QueryId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.records.remove(id.as_str());
        inner
            .dependencies
            .retain(|(source, _)| source != id.as_str());
        Ok(())
    }

    async fn load_cache_config(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.inner.lock().config.clone())
    }

    async fn store_cache_config(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .lock()
            .config
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn create_table_as(&self, schema: &str, table: &str, select: &str) -> Result<()> {
        let delay = *self.create_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let rows = self.table_rows.lock().clone();
        let bytes = *self.table_bytes.lock();
        let mut inner = self.inner.lock();
        inner
            .ddl_log
            .push(format!("CREATE TABLE {schema}.{table} AS {select}"));
        if !inner.create_errors.is_empty() {
            return Err(inner.create_errors.remove(0));
        }
        inner
            .tables
            .insert((schema.to_owned(), table.to_owned()), MemTable { rows, bytes });
        Ok(())
    }

    async fn drop_table(&self, schema: &str, table: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .ddl_log
            .push(format!("DROP TABLE IF EXISTS {schema}.{table}"));
        inner.tables.remove(&(schema.to_owned(), table.to_owned()));
        Ok(())
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .tables
            .contains_key(&(schema.to_owned(), table.to_owned())))
    }

    async fn relation_size_bytes(&self, schema: &str, table: &str) -> Result<i64> {
        Ok(self
            .inner
            .lock()
            .tables
            .get(&(schema.to_owned(), table.to_owned()))
            .map(|t| t.bytes)
            .unwrap_or(0))
    }

    async fn stream_rows(&self, sql: &str) -> Result<RowStream> {
        let inner = self.inner.lock();
        let table = inner
            .tables
            .iter()
            .find(|((schema, name), _)| sql.contains(&format!("{schema}.{name}")))
            .map(|(_, table)| table.clone())
            .ok_or_else(|| Error::Transport(format!("no relation matches '{sql}'")))?;
        Ok(stream::iter(table.rows.into_iter().map(Ok)).boxed())
    }
}
