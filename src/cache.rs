//! Content-addressed store of materialised results and their metadata.
//!
//! Results are huge, so the authoritative store is the warehouse itself: one
//! relation per completed query plus the `cache.cached` metadata table. This
//! module keeps an in-memory mirror of the metadata (loaded and reconciled
//! at startup) and writes every mutation through to the warehouse, so a
//! restarted server sees the same cache.
//!
//! Eviction is recomputation-cost-weighted recency:
//!
//! ```text
//! score = multiplier * compute_time_ms * (1 + access_count) * exp(-lambda * age)
//! ```
//!
//! Expensive queries that are reused stay hot; cheap or stale ones go first.

use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

use crate::error::Result;
use crate::fingerprint::{canonical_json, QueryId};
use crate::spec::QuerySpec;
use crate::warehouse::Warehouse;

/// The schema materialised results live in.
pub const CACHE_SCHEMA: &str = "cache";

/// The persistent row associated with one fingerprint.
#[derive(Clone, Debug)]
pub struct QueryRecord {
    pub query_id: QueryId,
    /// Engine version that produced the record.
    pub version: String,
    pub query_kind: String,
    /// Canonical JSON of the spec; what `get_query_params` returns.
    pub spec_json: String,
    pub created: DateTime<Utc>,
    pub access_count: i64,
    pub last_accessed: DateTime<Utc>,
    /// Wall time of this query's own execution, dependencies excluded.
    pub compute_time_ms: f64,
    /// Priority knob: `None` means evictable at weight 1.0, zero pins the
    /// record against eviction entirely.
    pub cache_score_multiplier: Option<f64>,
    pub schema: Option<String>,
    pub tablename: Option<String>,
    /// Warehouse-reported size; zero until materialised.
    pub size_bytes: i64,
    /// Direct prerequisites this record consumed.
    pub deps: Vec<QueryId>,
}

impl QueryRecord {
    /// Whether `(schema, tablename)` points at a materialised relation.
    /// A record without a target *is* the `known` state.
    pub fn is_materialised(&self) -> bool {
        self.schema.is_some() && self.tablename.is_some()
    }
}

/// The shared cache handle.
pub struct Cache {
    warehouse: Arc<dyn Warehouse>,
    records: RwLock<FxHashMap<QueryId, QueryRecord>>,
    half_life_seconds: f64,
    size_limit_bytes: Option<i64>,
}

impl Cache {
    /// Open the cache: create the metadata tables if needed, load every
    /// record, and reconcile against the warehouse — any record claiming a
    /// target that no longer exists is demoted to `known`, and sizes are
    /// refreshed for the ones that do exist.
    pub async fn open(
        warehouse: Arc<dyn Warehouse>,
        half_life_seconds: f64,
        size_limit_bytes: Option<i64>,
    ) -> Result<Cache> {
        warehouse.ensure_cache_schema().await?;

        let mut records = FxHashMap::default();
        for mut record in warehouse.load_records().await? {
            if record.is_materialised() {
                let schema = record.schema.clone().unwrap_or_default();
                let table = record.tablename.clone().unwrap_or_default();
                if warehouse.table_exists(&schema, &table).await? {
                    record.size_bytes = warehouse.relation_size_bytes(&schema, &table).await?;
                } else {
                    warn!(
                        "cache: record {} claims missing relation {schema}.{table}, demoting",
                        record.query_id
                    );
                    record.schema = None;
                    record.tablename = None;
                    record.size_bytes = 0;
                    warehouse.upsert_record(&record).await?;
                }
            }
            records.insert(record.query_id.clone(), record);
        }
        info!("cache: loaded {} records", records.len());

        Ok(Cache {
            warehouse,
            records: RwLock::new(records),
            half_life_seconds,
            size_limit_bytes,
        })
    }

    pub fn size_limit_bytes(&self) -> Option<i64> {
        self.size_limit_bytes
    }

    pub fn lookup(&self, id: &QueryId) -> Option<QueryRecord> {
        self.records.read().get(id).cloned()
    }

    /// Create the record for `spec` in state `known` if absent; no-op if
    /// present. The in-memory insert decides the race, so concurrent
    /// reserves of one id persist exactly once.
    pub async fn reserve(&self, spec: &QuerySpec, deps: &[QueryId]) -> Result<QueryId> {
        let id = spec.fingerprint();
        let now = Utc::now();
        let record = {
            let mut records = self.records.write();
            if records.contains_key(&id) {
                return Ok(id);
            }
            let record = QueryRecord {
                query_id: id.clone(),
                version: env!("CARGO_PKG_VERSION").to_owned(),
                query_kind: spec.kind().name().to_owned(),
                spec_json: canonical_json(spec),
                created: now,
                access_count: 0,
                last_accessed: now,
                compute_time_ms: 0.0,
                cache_score_multiplier: None,
                schema: None,
                tablename: None,
                size_bytes: 0,
                deps: deps.to_vec(),
            };
            records.insert(id.clone(), record.clone());
            record
        };
        self.warehouse.upsert_record(&record).await?;
        self.warehouse.insert_dependencies(&id, deps).await?;
        Ok(id)
    }

    /// Transition the record to materialised. Invoked by the worker
    /// immediately before the state machine's `finish`, so `completed` is
    /// only ever observable with the cache row already pointing at the
    /// relation.
    pub async fn commit(
        &self,
        id: &QueryId,
        tablename: &str,
        compute_time_ms: f64,
        size_bytes: i64,
    ) -> Result<()> {
        let record = {
            let mut records = self.records.write();
            let record = match records.get_mut(id) {
                Some(record) => record,
                None => return Ok(()),
            };
            record.schema = Some(CACHE_SCHEMA.to_owned());
            record.tablename = Some(tablename.to_owned());
            record.compute_time_ms = compute_time_ms;
            record.size_bytes = size_bytes;
            record.last_accessed = Utc::now();
            record.clone()
        };
        self.warehouse.upsert_record(&record).await
    }

    /// Advance the access accounting. Called on every successful result
    /// retrieval.
    pub async fn touch(&self, id: &QueryId) -> Result<()> {
        let (count, at) = {
            let mut records = self.records.write();
            let record = match records.get_mut(id) {
                Some(record) => record,
                None => return Ok(()),
            };
            record.access_count += 1;
            record.last_accessed = Utc::now();
            (record.access_count, record.last_accessed)
        };
        self.warehouse.record_access(id, count, at).await
    }

    /// Set the policy/user priority knob and persist it.
    pub async fn set_score_multiplier(&self, id: &QueryId, multiplier: Option<f64>) -> Result<()> {
        let record = {
            let mut records = self.records.write();
            let record = match records.get_mut(id) {
                Some(record) => record,
                None => return Ok(()),
            };
            record.cache_score_multiplier = multiplier;
            record.clone()
        };
        self.warehouse.upsert_record(&record).await
    }

    /// Drop the materialised relation and delete the record along with the
    /// dependency edges it is the source of. Edges pointing *to* this id
    /// stay for as long as some other record still references it.
    pub async fn evict(&self, id: &QueryId) -> Result<()> {
        let target = self.lookup(id).and_then(|r| {
            Some((r.schema?, r.tablename?))
        });
        if let Some((schema, table)) = target {
            self.warehouse.drop_table(&schema, &table).await?;
        }
        self.records.write().remove(id);
        self.warehouse.delete_record(id).await?;
        info!("cache: evicted {id}");
        Ok(())
    }

    /// The cache score of `id`, or `None` for unknown ids.
    pub fn score(&self, id: &QueryId) -> Option<f64> {
        let records = self.records.read();
        Some(self.score_record(records.get(id)?, Utc::now()))
    }

    fn score_record(&self, record: &QueryRecord, now: DateTime<Utc>) -> f64 {
        let multiplier = record.cache_score_multiplier.unwrap_or(1.0);
        let age_seconds = (now - record.last_accessed).num_milliseconds() as f64 / 1000.0;
        let lambda = std::f64::consts::LN_2 / self.half_life_seconds;
        multiplier
            * record.compute_time_ms
            * (1.0 + record.access_count as f64)
            * (-lambda * age_seconds.max(0.0)).exp()
    }

    /// Materialised records eligible for eviction, lowest score first.
    /// Zero-multiplier records are pinned and never appear.
    pub fn candidates_for_eviction(&self) -> Vec<QueryId> {
        let now = Utc::now();
        let records = self.records.read();
        let mut candidates: Vec<(f64, QueryId)> = records
            .values()
            .filter(|r| r.is_materialised() && r.cache_score_multiplier != Some(0.0))
            .map(|r| (self.score_record(r, now), r.query_id.clone()))
            .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        candidates.into_iter().map(|(_, id)| id).collect()
    }

    pub fn total_materialised_bytes(&self) -> i64 {
        self.records
            .read()
            .values()
            .filter(|r| r.is_materialised())
            .map(|r| r.size_bytes)
            .sum()
    }

    /// Evict lowest-scoring candidates until the total materialised size
    /// fits the configured budget. Records whose fingerprint appears in
    /// `live` (the union of every in-flight execution's dependency closure)
    /// are never touched. Returns the evicted ids so the caller can retire
    /// their in-memory state.
    pub async fn enforce_budget(&self, live: &FxHashSet<QueryId>) -> Result<Vec<QueryId>> {
        let mut evicted = Vec::new();
        let budget = match self.size_limit_bytes {
            Some(budget) => budget,
            None => return Ok(evicted),
        };
        while self.total_materialised_bytes() > budget {
            let candidate = self
                .candidates_for_eviction()
                .into_iter()
                .find(|id| !live.contains(id));
            match candidate {
                Some(id) => {
                    self.evict(&id).await?;
                    evicted.push(id);
                }
                None => {
                    warn!(
                        "cache: over budget ({} > {budget} bytes) but nothing evictable",
                        self.total_materialised_bytes()
                    );
                    break;
                }
            }
        }
        Ok(evicted)
    }
}
