//! DAG-ordered execution over a bounded worker pool.
//!
//! Submission expands a spec's dependency closure, reserves a cache entry
//! for every node and enqueues the leaves. Workers drain a ready queue,
//! materialise one node at a time, and fan completion out to dependents: a
//! parent is handed to the queue only when its last unstored prerequisite
//! commits, so a parent's `executing` transition always happens-after every
//! dependency's `completed`.
//!
//! Bookkeeping is global rather than per-submission: two overlapping graphs
//! submitted concurrently share node entries, so a node materialises at most
//! once no matter how many roots are waiting on it.

use log::{debug, info, warn};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::cache::{Cache, CACHE_SCHEMA};
use crate::error::{Error, Result};
use crate::fingerprint::QueryId;
use crate::graph::DepGraph;
use crate::spec::{QueryKind, QuerySpec};
use crate::state::{QueryState, StateRegistry};
use crate::warehouse::Warehouse;
use crate::FxIndexSet;

/// Transient warehouse failures are retried this many times with
/// exponential backoff before the node is failed.
const MAX_SQL_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

struct NodeEntry {
    spec: QuerySpec,
    /// Unstored prerequisites still outstanding. A predecessor that was
    /// already materialised at schedule time contributes nothing.
    indegree: usize,
    /// Parents to notify when this node reaches a terminal state.
    dependents: FxIndexSet<QueryId>,
}

#[derive(Default)]
struct Book {
    /// Every node currently scheduled and not yet terminal.
    nodes: FxHashMap<QueryId, NodeEntry>,
    /// Per live root, its full dependency closure (stored nodes included).
    /// Eviction never removes anything in the union of these.
    live: FxHashMap<QueryId, Vec<QueryId>>,
    /// Deadlines attached at submission, keyed by root.
    deadlines: FxHashMap<QueryId, Instant>,
}

struct Shared {
    warehouse: Arc<dyn Warehouse>,
    cache: Arc<Cache>,
    registry: Arc<StateRegistry>,
    book: Mutex<Book>,
    ready_tx: mpsc::UnboundedSender<QueryId>,
    /// Depth accounting for backpressure: submissions of genuinely new work
    /// wait while the ready queue is over the configured depth. Fan-out
    /// sends from workers are never throttled (throttling them could wedge
    /// the pool against itself).
    queue_len: AtomicUsize,
    queue_depth: usize,
    drained: Notify,
}

/// The scheduler handle. Cheap to clone; workers run for the lifetime of
/// the process.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Spawn `worker_count` workers draining the ready queue.
    pub fn start(
        warehouse: Arc<dyn Warehouse>,
        cache: Arc<Cache>,
        registry: Arc<StateRegistry>,
        worker_count: usize,
        queue_depth: usize,
    ) -> Scheduler {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            warehouse,
            cache,
            registry,
            book: Mutex::new(Book::default()),
            ready_tx,
            queue_len: AtomicUsize::new(0),
            queue_depth,
            drained: Notify::new(),
        });
        let ready_rx = Arc::new(tokio::sync::Mutex::new(ready_rx));
        for n in 0..worker_count.max(1) {
            let shared = shared.clone();
            let ready_rx = ready_rx.clone();
            tokio::spawn(async move {
                debug!("worker {n} up");
                loop {
                    let id = ready_rx.lock().await.recv().await;
                    let Some(id) = id else { break };
                    shared.queue_len.fetch_sub(1, Ordering::SeqCst);
                    shared.drained.notify_waiters();
                    shared.execute(id).await;
                }
            });
        }
        Scheduler { shared }
    }

    /// Submit a spec for materialisation. Returns the root fingerprint;
    /// idempotent on it. A second submission of an id already queued or
    /// executing joins the in-flight build; a submission of an errored or
    /// cancelled id is the manual requeue and starts over.
    pub async fn submit(&self, spec: QuerySpec) -> Result<QueryId> {
        self.submit_with_deadline(spec, None).await
    }

    pub async fn submit_with_deadline(
        &self,
        spec: QuerySpec,
        deadline: Option<Duration>,
    ) -> Result<QueryId> {
        let shared = &self.shared;
        let graph = DepGraph::build(&spec)?;
        let root = graph.root().clone();

        // Dedup before doing any work: join an in-flight build, or return
        // immediately when the result is already materialised.
        if let Some(machine) = shared.registry.get(&root) {
            match machine.current() {
                QueryState::Queued | QueryState::Executing => {
                    debug!("submit: {root} already in flight");
                    return Ok(root);
                }
                QueryState::Completed if shared.is_stored(&root) => return Ok(root),
                state => {
                    // Stale terminal (evicted result, previous failure or
                    // cancel): explicit resubmission reopens it. Best
                    // effort; a concurrent submitter may have won the reset.
                    if state.is_terminal() {
                        let _ = machine.reset();
                    }
                }
            }
        } else if shared
            .cache
            .lookup(&root)
            .map_or(false, |r| r.is_materialised())
        {
            shared
                .registry
                .get_or_insert(&root, QueryState::Completed);
            return Ok(root);
        }

        // Reserve a cache entry for every node in the closure, leaves and
        // parents alike: a record's dependency set must be closed.
        let mut graph = graph;
        for id in graph.ids().cloned().collect::<Vec<_>>() {
            let node = graph.node(&id).expect("own node");
            let deps: Vec<QueryId> = node.deps.iter().cloned().collect();
            shared.cache.reserve(&node.spec, &deps).await?;
        }
        for id in graph.ids().cloned().collect::<Vec<_>>() {
            if shared.is_stored(&id) {
                graph.mark_stored(&id);
            }
        }

        let unstored = graph.unstored();
        if unstored.is_empty() {
            shared
                .registry
                .get_or_insert(&root, QueryState::Completed);
            shared.cache.touch(&root).await?;
            return Ok(root);
        }

        // Backpressure: queued work already in the book was deduplicated
        // above; genuinely new work waits for the queue to drain.
        while shared.queue_len.load(Ordering::SeqCst) > shared.queue_depth {
            let drained = shared.drained.notified();
            if shared.queue_len.load(Ordering::SeqCst) <= shared.queue_depth {
                break;
            }
            drained.await;
        }

        let order = unstored.topological_order()?;
        info!(
            "submit: {root} requires {} materialisations: {:?}",
            order.len(),
            order
        );

        let mut leaves = Vec::new();
        {
            let mut book = shared.book.lock();
            for id in &order {
                if book.nodes.contains_key(id) {
                    // Already scheduled by an overlapping submission.
                    continue;
                }
                let machine = shared.registry.get_or_insert(id, QueryState::Known);
                match machine.current() {
                    QueryState::Completed => continue,
                    QueryState::Errored | QueryState::Cancelled => {
                        let _ = machine.reset();
                    }
                    _ => {}
                }
                let node = unstored.node(id).expect("node in own order");
                let mut indegree = 0;
                for dep in &node.deps {
                    let dep_done = shared
                        .registry
                        .state_of(dep)
                        .map_or(false, |s| s == QueryState::Completed)
                        || shared
                            .cache
                            .lookup(dep)
                            .map_or(false, |r| r.is_materialised());
                    if !dep_done {
                        if let Some(entry) = book.nodes.get_mut(dep) {
                            entry.dependents.insert(id.clone());
                            indegree += 1;
                        }
                    }
                }
                let (_, newly) = machine.enqueue();
                book.nodes.insert(
                    id.clone(),
                    NodeEntry {
                        spec: node.spec.clone(),
                        indegree,
                        dependents: FxIndexSet::default(),
                    },
                );
                if indegree == 0 && newly {
                    leaves.push(id.clone());
                }
            }
            if book.nodes.contains_key(&root) {
                book.live
                    .insert(root.clone(), graph.ids().cloned().collect());
            }
            if let Some(deadline) = deadline {
                book.deadlines
                    .insert(root.clone(), Instant::now() + deadline);
                let shared = shared.clone();
                let root = root.clone();
                let closure: Vec<QueryId> = order.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(deadline).await;
                    shared.expire(&root, &closure);
                });
            }
        }

        for leaf in leaves {
            shared.send_ready(leaf);
        }
        Ok(root)
    }

    /// Cancel an id. Queued work is abandoned before execution; executing
    /// work observes the transition at its next suspension point and rolls
    /// back. Returns the resulting state.
    pub fn cancel(&self, id: &QueryId) -> Result<QueryState> {
        let machine = self
            .shared
            .registry
            .get(id)
            .ok_or_else(|| Error::UnknownQueryId(id.clone()))?;
        machine.cancel()
    }

    /// The union of every live execution's dependency closure.
    pub fn live_ids(&self) -> FxHashSet<QueryId> {
        let book = self.shared.book.lock();
        book.live.values().flatten().cloned().collect()
    }
}

impl Shared {
    fn is_stored(&self, id: &QueryId) -> bool {
        // Materialised in the warehouse, or completed in memory: the dummy
        // kind finishes without writing, so the state machine is consulted
        // alongside the cache record.
        self.cache
            .lookup(id)
            .map_or(false, |r| r.is_materialised())
            || self
                .registry
                .state_of(id)
                .map_or(false, |s| s == QueryState::Completed)
    }

    fn send_ready(&self, id: QueryId) {
        self.queue_len.fetch_add(1, Ordering::SeqCst);
        if self.ready_tx.send(id).is_err() {
            warn!("ready queue closed; dropping work item");
            self.queue_len.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Deadline expiry synthesises a cancel over whatever is still live.
    fn expire(&self, root: &QueryId, closure: &[QueryId]) {
        let still_live = {
            let mut book = self.book.lock();
            book.deadlines.remove(root);
            book.live.contains_key(root)
        };
        if !still_live {
            return;
        }
        info!("deadline expired for {root}, cancelling");
        for id in closure {
            if let Some(machine) = self.registry.get(id) {
                let _ = machine.cancel();
            }
        }
    }

    async fn execute(&self, id: QueryId) {
        let Some(machine) = self.registry.get(&id) else {
            warn!("ready queue produced unknown id {id}");
            return;
        };
        if machine.begin_execute().is_err() {
            // The id changed state while sitting in the queue.
            match machine.current() {
                QueryState::Cancelled => self.on_cancelled(&id).await,
                QueryState::Completed => self.on_completed(&id).await,
                state => debug!("dropping queued {id} in state {state}"),
            }
            return;
        }

        let spec = match self.book.lock().nodes.get(&id) {
            Some(entry) => entry.spec.clone(),
            None => {
                warn!("executing {id} without bookkeeping entry");
                let _ = machine.fail("internal: lost scheduling entry");
                return;
            }
        };

        // The dummy kind exercises the full lifecycle without touching the
        // warehouse; its completion lives only in the state machine.
        if spec.kind() == QueryKind::DummyQuery {
            debug!("dummy query {id}: finishing without materialisation");
            match machine.finish() {
                Ok(()) => self.on_completed(&id).await,
                Err(_) => self.on_cancelled(&id).await,
            }
            return;
        }

        let table = id.table_name();
        let started = Instant::now();
        match self.materialise(&machine, &spec, &table).await {
            Ok(size_bytes) => {
                let compute_ms = started.elapsed().as_secs_f64() * 1000.0;
                if let Err(e) = self
                    .cache
                    .commit(&id, &table, compute_ms, size_bytes)
                    .await
                {
                    warn!("commit of {id} failed: {e}");
                    let _ = machine.fail(e.to_string());
                    self.on_failed(&id).await;
                    return;
                }
                match machine.finish() {
                    Ok(()) => self.on_completed(&id).await,
                    Err(_) => {
                        // Cancelled between commit and finish: roll the
                        // materialisation back so no relation is left behind.
                        let _ = self.warehouse.drop_table(CACHE_SCHEMA, &table).await;
                        self.on_cancelled(&id).await;
                    }
                }
            }
            Err(Error::Cancelled) => {
                let _ = self.warehouse.drop_table(CACHE_SCHEMA, &table).await;
                self.on_cancelled(&id).await;
            }
            Err(e) => {
                warn!("error executing {id}: {e}");
                let _ = machine.fail(e.to_string());
                self.on_failed(&id).await;
            }
        }
    }

    /// Run one node's materialisation, retrying transient warehouse
    /// failures and aborting promptly on cancellation.
    async fn materialise(
        &self,
        machine: &crate::state::StateMachine,
        spec: &QuerySpec,
        table: &str,
    ) -> Result<i64> {
        if machine.cancel_requested() {
            return Err(Error::Cancelled);
        }

        // Warehouse-level race: if the relation already exists (for
        // example a previous run died between CREATE and commit) it is
        // not recreated.
        if self.warehouse.table_exists(CACHE_SCHEMA, table).await? {
            debug!("{table} already materialised, skipping CREATE");
            return self.warehouse.relation_size_bytes(CACHE_SCHEMA, table).await;
        }

        let sql = spec.build_sql()?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let create = self.warehouse.create_table_as(CACHE_SCHEMA, table, &sql);
            tokio::select! {
                result = create => match result {
                    Ok(()) => break,
                    Err(e) if e.is_transient() && attempt < MAX_SQL_ATTEMPTS => {
                        let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                        warn!("transient warehouse error on {table} (attempt {attempt}): {e}; retrying in {delay:?}");
                        tokio::time::sleep(delay).await;
                        if machine.cancel_requested() {
                            return Err(Error::Cancelled);
                        }
                    }
                    Err(e) => return Err(e),
                },
                _ = machine.cancelled() => {
                    info!("{table}: cancelled mid-statement, aborting");
                    return Err(Error::Cancelled);
                }
            }
        }
        self.warehouse.relation_size_bytes(CACHE_SCHEMA, table).await
    }

    async fn on_completed(&self, id: &QueryId) {
        let ready = {
            let mut book = self.book.lock();
            let mut ready = Vec::new();
            if let Some(entry) = book.nodes.remove(id) {
                for parent in entry.dependents {
                    if let Some(p) = book.nodes.get_mut(&parent) {
                        p.indegree -= 1;
                        if p.indegree == 0 {
                            ready.push(parent);
                        }
                    }
                }
            }
            self.finish_root(&mut book, id);
            ready
        };
        for parent in ready {
            self.send_ready(parent);
        }
    }

    /// Propagate a failure: every transitive dependent is failed with a
    /// `dependency_failed` cause naming its own direct child, and none of
    /// their SQL ever runs.
    async fn on_failed(&self, id: &QueryId) {
        let mut book = self.book.lock();
        let mut stack = vec![id.clone()];
        while let Some(child) = stack.pop() {
            let Some(entry) = book.nodes.remove(&child) else {
                continue;
            };
            for parent in entry.dependents {
                if book.nodes.contains_key(&parent) {
                    if let Some(machine) = self.registry.get(&parent) {
                        let _ = machine.fail(Error::DependencyFailed(child.clone()).to_string());
                    }
                    stack.push(parent);
                }
            }
            self.finish_root(&mut book, &child);
        }
    }

    /// Like [`Shared::on_failed`] but the dependents become `cancelled`:
    /// the submitter observes cancellation at the root rather than an
    /// error.
    async fn on_cancelled(&self, id: &QueryId) {
        let mut book = self.book.lock();
        let mut stack = vec![id.clone()];
        while let Some(child) = stack.pop() {
            let Some(entry) = book.nodes.remove(&child) else {
                continue;
            };
            for parent in entry.dependents {
                if book.nodes.contains_key(&parent) {
                    if let Some(machine) = self.registry.get(&parent) {
                        let _ = machine.cancel();
                    }
                    stack.push(parent);
                }
            }
            self.finish_root(&mut book, &child);
        }
    }

    /// If `id` was the root of a live execution, release its closure and
    /// apply the eviction policy now that the live set shrank.
    fn finish_root(&self, book: &mut Book, id: &QueryId) {
        if book.live.remove(id).is_none() {
            return;
        }
        book.deadlines.remove(id);
        let live: FxHashSet<QueryId> = book.live.values().flatten().cloned().collect();
        let cache = self.cache.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            match cache.enforce_budget(&live).await {
                // An evicted id has no record left anywhere; polls for it
                // are answered awol until it is resubmitted.
                Ok(evicted) => {
                    for id in &evicted {
                        registry.remove(id);
                    }
                }
                Err(e) => warn!("budget enforcement failed: {e}"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::MemoryWarehouse;
    use serde_json::json;

    struct Rig {
        warehouse: Arc<MemoryWarehouse>,
        cache: Arc<Cache>,
        registry: Arc<StateRegistry>,
        scheduler: Scheduler,
    }

    async fn rig() -> Rig {
        rig_with_limit(None).await
    }

    async fn rig_with_limit(limit: Option<i64>) -> Rig {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let cache = Arc::new(
            Cache::open(warehouse.clone(), 3600.0, limit)
                .await
                .unwrap(),
        );
        let registry = Arc::new(StateRegistry::new());
        let scheduler = Scheduler::start(
            warehouse.clone(),
            cache.clone(),
            registry.clone(),
            4,
            128,
        );
        Rig {
            warehouse,
            cache,
            registry,
            scheduler,
        }
    }

    fn degree_spec(start: &str) -> QuerySpec {
        QuerySpec::from_value(&json!({
            "query_kind": "subscriber_degree",
            "start": start,
            "stop": "2016-02-01",
            "direction": "both",
        }))
        .unwrap()
    }

    fn daily_location(date: &str) -> QuerySpec {
        QuerySpec::from_value(&json!({
            "query_kind": "daily_location",
            "date": date,
            "method": "last",
            "aggregation_unit": "admin3",
            "subscriber_subset": null,
        }))
        .unwrap()
    }

    fn mla_spec() -> QuerySpec {
        QuerySpec::from_value(&json!({
            "query_kind": "meaningful_locations_aggregate",
            "start": "2016-01-01",
            "stop": "2016-01-08",
            "label": "weekend",
            "labels": {"weekend": {}, "weekday": {}},
            "radius": 1.0,
            "aggregation_unit": "admin3",
        }))
        .unwrap()
    }

    async fn wait_terminal(rig: &Rig, id: &QueryId) -> QueryState {
        rig.registry.get(id).unwrap().wait_terminal().await
    }

    #[tokio::test]
    async fn leaf_query_materialises_and_completes() {
        let rig = rig().await;
        let id = rig.scheduler.submit(degree_spec("2016-01-01")).await.unwrap();
        assert_eq!(wait_terminal(&rig, &id).await, QueryState::Completed);
        assert!(rig
            .warehouse
            .table_exists(CACHE_SCHEMA, &id.table_name())
            .await
            .unwrap());
        let record = rig.cache.lookup(&id).unwrap();
        assert!(record.is_materialised());
    }

    #[tokio::test]
    async fn dependencies_materialise_before_dependents() {
        let rig = rig().await;
        let spec = daily_location("2016-01-01");
        let dep_id = spec.dependencies().unwrap()[0].fingerprint();
        let id = rig.scheduler.submit(spec).await.unwrap();
        assert_eq!(wait_terminal(&rig, &id).await, QueryState::Completed);

        let ddl = rig.warehouse.ddl_log();
        let creates: Vec<&String> = ddl.iter().filter(|s| s.starts_with("CREATE")).collect();
        assert_eq!(creates.len(), 2);
        assert!(creates[0].contains(&dep_id.table_name()));
        assert!(creates[1].contains(&id.table_name()));
    }

    #[tokio::test]
    async fn cached_subgraphs_are_not_recomputed() {
        let rig = rig().await;
        let spec = mla_spec();

        // Pre-materialise call_days and label_scores; with call_days cut,
        // subscriber_sightings below it is never needed either.
        let ml = &spec.dependencies().unwrap()[0];
        let (clusters, scores) = {
            let deps = ml.dependencies().unwrap();
            (deps[0].clone(), deps[1].clone())
        };
        let call_days = clusters.dependencies().unwrap()[0].clone();
        for pre in [&call_days, &scores] {
            let id = rig.cache.reserve(pre, &[]).await.unwrap();
            rig.warehouse
                .seed_table(CACHE_SCHEMA, &id.table_name(), vec![], 10);
            rig.cache.commit(&id, &id.table_name(), 5.0, 10).await.unwrap();
        }

        let id = rig.scheduler.submit(spec).await.unwrap();
        assert_eq!(wait_terminal(&rig, &id).await, QueryState::Completed);
        // Exactly three materialisations: clusters, meaningful_locations,
        // and the aggregate root.
        assert_eq!(rig.warehouse.create_count(), 3);
    }

    #[tokio::test]
    async fn concurrent_submissions_deduplicate() {
        let rig = rig().await;
        rig.warehouse
            .set_create_delay(Duration::from_millis(20));
        let ids = futures_util::future::join_all(
            (0..8).map(|_| rig.scheduler.submit(degree_spec("2016-01-01"))),
        )
        .await;
        let first = ids[0].as_ref().unwrap().clone();
        for id in &ids {
            assert_eq!(id.as_ref().unwrap(), &first);
        }
        assert_eq!(wait_terminal(&rig, &first).await, QueryState::Completed);
        assert_eq!(rig.warehouse.create_count(), 1);
    }

    #[tokio::test]
    async fn resubmission_of_a_completed_query_is_a_noop() {
        let rig = rig().await;
        let id = rig.scheduler.submit(degree_spec("2016-01-01")).await.unwrap();
        wait_terminal(&rig, &id).await;
        let again = rig.scheduler.submit(degree_spec("2016-01-01")).await.unwrap();
        assert_eq!(again, id);
        assert_eq!(rig.warehouse.create_count(), 1);
    }

    #[tokio::test]
    async fn failure_propagates_to_dependents_without_running_them() {
        let rig = rig().await;
        rig.warehouse
            .push_create_error(Error::Warehouse(sqlx::Error::Protocol(
                "relation \"events.calls\" does not exist".into(),
            )));
        let spec = daily_location("2016-01-01");
        let dep_id = spec.dependencies().unwrap()[0].fingerprint();
        let id = rig.scheduler.submit(spec).await.unwrap();
        assert_eq!(wait_terminal(&rig, &id).await, QueryState::Errored);
        assert_eq!(rig.registry.state_of(&dep_id), Some(QueryState::Errored));

        let cause = rig.registry.get(&id).unwrap().error_cause().unwrap();
        assert_eq!(cause, format!("dependency_failed({dep_id})"));
        // Only the leaf's CREATE was ever attempted.
        assert_eq!(rig.warehouse.create_count(), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let rig = rig().await;
        rig.warehouse.push_create_error(Error::Warehouse(sqlx::Error::PoolTimedOut));
        let id = rig.scheduler.submit(degree_spec("2016-01-01")).await.unwrap();
        assert_eq!(wait_terminal(&rig, &id).await, QueryState::Completed);
        assert_eq!(rig.warehouse.create_count(), 2, "one failed, one retried");
    }

    #[tokio::test]
    async fn cancellation_mid_execution_rolls_back() {
        let rig = rig().await;
        rig.warehouse.set_create_delay(Duration::from_millis(200));
        let id = rig.scheduler.submit(degree_spec("2016-01-01")).await.unwrap();

        // Wait until the worker is actually executing, then cancel.
        let machine = rig.registry.get(&id).unwrap();
        for _ in 0..100 {
            if machine.current() == QueryState::Executing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        rig.scheduler.cancel(&id).unwrap();
        assert_eq!(wait_terminal(&rig, &id).await, QueryState::Cancelled);

        // Give the worker a moment to roll back, then check nothing is left.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!rig
            .warehouse
            .table_exists(CACHE_SCHEMA, &id.table_name())
            .await
            .unwrap());
        assert_eq!(rig.registry.state_of(&id), Some(QueryState::Cancelled));
    }

    #[tokio::test]
    async fn cancelling_a_leaf_cancels_the_root() {
        let rig = rig().await;
        rig.warehouse.set_create_delay(Duration::from_millis(100));
        let spec = daily_location("2016-01-01");
        let dep_id = spec.dependencies().unwrap()[0].fingerprint();
        let root = rig.scheduler.submit(spec).await.unwrap();
        rig.scheduler.cancel(&dep_id).unwrap();
        assert_eq!(wait_terminal(&rig, &root).await, QueryState::Cancelled);
    }

    #[tokio::test]
    async fn deadline_synthesises_a_cancel() {
        let rig = rig().await;
        rig.warehouse.set_create_delay(Duration::from_millis(500));
        let id = rig
            .scheduler
            .submit_with_deadline(degree_spec("2016-01-01"), Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert_eq!(wait_terminal(&rig, &id).await, QueryState::Cancelled);
    }

    #[tokio::test]
    async fn existing_relation_is_not_recreated() {
        let rig = rig().await;
        let spec = degree_spec("2016-01-01");
        let id = spec.fingerprint();
        rig.warehouse
            .seed_table(CACHE_SCHEMA, &id.table_name(), vec![json!({"value": 1})], 64);
        let submitted = rig.scheduler.submit(spec).await.unwrap();
        assert_eq!(submitted, id);
        assert_eq!(wait_terminal(&rig, &id).await, QueryState::Completed);
        assert_eq!(rig.warehouse.create_count(), 0);
    }

    #[tokio::test]
    async fn completed_roots_release_their_closure() {
        let rig = rig().await;
        let id = rig.scheduler.submit(degree_spec("2016-01-01")).await.unwrap();
        wait_terminal(&rig, &id).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rig.scheduler.live_ids().is_empty());
    }

    #[tokio::test]
    async fn budget_is_enforced_after_completion() {
        let rig = rig_with_limit(Some(1500)).await;
        rig.warehouse.set_table_bytes(1000);
        let a = rig.scheduler.submit(degree_spec("2016-01-01")).await.unwrap();
        wait_terminal(&rig, &a).await;
        let b = rig.scheduler.submit(degree_spec("2016-01-02")).await.unwrap();
        wait_terminal(&rig, &b).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rig.cache.total_materialised_bytes() <= 1500);
    }
}
