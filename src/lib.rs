#![warn(rust_2018_idioms)]

//! Spate is a query-execution server for long-running analytical queries
//! over a telecom call-detail-record warehouse. Queries are identified by a
//! content-addressed fingerprint; submitting the same spec twice observes
//! one shared execution and one shared result. A dependency-graph scheduler
//! materialises prerequisites before dependents, a warehouse-backed cache
//! deduplicates and retains results under a cost-weighted eviction policy,
//! and a stateless HTTP gateway exposes the whole thing behind bearer-token
//! claims.

pub mod cache;
pub mod claims;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod gateway;
pub mod graph;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod spec;
pub mod state;
pub mod warehouse;

pub use crate::cache::{Cache, QueryRecord};
pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::fingerprint::{fingerprint, QueryId};
pub use crate::graph::DepGraph;
pub use crate::scheduler::Scheduler;
pub use crate::server::QueryServer;
pub use crate::spec::{QueryKind, QuerySpec};
pub use crate::state::{QueryState, StateMachine, StateRegistry};
pub use crate::warehouse::{MemoryWarehouse, PgWarehouse, Warehouse};

use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;

/// Insertion-ordered set with the fast hasher, used wherever iteration
/// order must be deterministic.
pub type FxIndexSet<K> = indexmap::IndexSet<K, BuildHasherDefault<FxHasher>>;
/// Insertion-ordered map with the fast hasher.
pub type FxIndexMap<K, V> = indexmap::IndexMap<K, V, BuildHasherDefault<FxHasher>>;
