//! Per-fingerprint lifecycle tracking.
//!
//! One [`StateMachine`] exists per observed fingerprint, hosted in a
//! process-wide [`StateRegistry`]. All transitions for an id are serialised
//! behind the machine's mutex, so concurrent submitters of the same spec
//! observe a single consistent lifecycle; the second submitter simply sees
//! whatever state the first one produced.
//!
//! Terminal transitions are published on a watch channel. Anything blocking
//! on "the result of id" awaits the channel instead of polling; the
//! client-facing protocol still exposes polling, but nothing inside the
//! server spins.

use crossbeam_utils::atomic::AtomicCell;
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::fingerprint::QueryId;

/// The lifecycle states of a query id.
///
/// `known` means the server has seen the id but it is neither materialised
/// nor running. `awol` is a reply-surface sentinel for ids the server has no
/// record of; it is never stored in the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryState {
    Known,
    Queued,
    Executing,
    Completed,
    Errored,
    Cancelled,
    Awol,
}

impl QueryState {
    /// Terminal states never re-enter a non-terminal state except via an
    /// explicit [`StateMachine::reset`].
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryState::Completed | QueryState::Errored | QueryState::Cancelled
        )
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryState::Known => "known",
            QueryState::Queued => "queued",
            QueryState::Executing => "executing",
            QueryState::Completed => "completed",
            QueryState::Errored => "errored",
            QueryState::Cancelled => "cancelled",
            QueryState::Awol => "awol",
        };
        f.write_str(name)
    }
}

struct Inner {
    state: QueryState,
    /// Why the id ended up `errored`, surfaced on subsequent polls.
    cause: Option<String>,
}

/// The per-id machine. Construct through [`StateRegistry::get_or_insert`].
pub struct StateMachine {
    id: QueryId,
    inner: Mutex<Inner>,
    tx: watch::Sender<QueryState>,
    /// Set on the cancel transition. Workers check this at every suspension
    /// point; it is cheaper to read than the watch channel and safe to poll
    /// from non-async code.
    cancel_flag: AtomicCell<bool>,
}

impl StateMachine {
    fn new(id: QueryId, initial: QueryState) -> Self {
        let (tx, _) = watch::channel(initial);
        StateMachine {
            id,
            inner: Mutex::new(Inner {
                state: initial,
                cause: None,
            }),
            tx,
            cancel_flag: AtomicCell::new(false),
        }
    }

    pub fn id(&self) -> &QueryId {
        &self.id
    }

    pub fn current(&self) -> QueryState {
        self.inner.lock().state
    }

    pub fn error_cause(&self) -> Option<String> {
        self.inner.lock().cause.clone()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_flag.load()
    }

    /// `known → queued`. Idempotent: an id already queued, executing or in
    /// a terminal state is left alone and its current state returned, so a
    /// second submitter shares the first submitter's slot.
    ///
    /// Returns `(state_after, newly_enqueued)`; only the caller that
    /// observed `newly_enqueued == true` feeds the id to the ready queue.
    pub fn enqueue(&self) -> (QueryState, bool) {
        let mut inner = self.inner.lock();
        if inner.state == QueryState::Known {
            self.set(&mut inner, QueryState::Queued);
            (QueryState::Queued, true)
        } else {
            debug!(
                "query {}: enqueue is a no-op in state {}",
                self.id, inner.state
            );
            (inner.state, false)
        }
    }

    /// `queued → executing`. Fails for anything not queued; a worker that
    /// loses this race (the id was cancelled while sitting in the ready
    /// queue) simply drops the work item.
    pub fn begin_execute(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != QueryState::Queued {
            return Err(self.illegal(&inner, QueryState::Executing));
        }
        self.set(&mut inner, QueryState::Executing);
        Ok(())
    }

    /// `executing → completed`. The caller commits the result to the cache
    /// immediately before invoking this; observers can only see `completed`
    /// after the cache row points at the materialised relation.
    pub fn finish(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != QueryState::Executing {
            return Err(self.illegal(&inner, QueryState::Completed));
        }
        self.set(&mut inner, QueryState::Completed);
        Ok(())
    }

    /// `queued | executing → errored`, recording the cause. Queued is legal
    /// because a dependency failure marks parents that never started.
    pub fn fail(&self, cause: impl Into<String>) -> Result<()> {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, QueryState::Queued | QueryState::Executing) {
            return Err(self.illegal(&inner, QueryState::Errored));
        }
        inner.cause = Some(cause.into());
        self.set(&mut inner, QueryState::Errored);
        Ok(())
    }

    /// `queued | executing → cancelled`. Also raises the cancel flag, which
    /// an executing worker observes at its next suspension point, aborting
    /// the warehouse statement and rolling back any partial materialisation.
    /// No-op (returning the current state) if already terminal.
    pub fn cancel(&self) -> Result<QueryState> {
        let mut inner = self.inner.lock();
        match inner.state {
            QueryState::Queued | QueryState::Executing => {
                self.cancel_flag.store(true);
                self.set(&mut inner, QueryState::Cancelled);
                Ok(QueryState::Cancelled)
            }
            state if state.is_terminal() => Ok(state),
            _ => Err(self.illegal(&inner, QueryState::Cancelled)),
        }
    }

    /// Terminal → `known`: the explicit reopening used for manual requeue
    /// and for reconciliation of records whose result went away. Clears the
    /// recorded cause and the cancel flag.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.state.is_terminal() {
            return Err(self.illegal(&inner, QueryState::Known));
        }
        inner.cause = None;
        self.cancel_flag.store(false);
        self.set(&mut inner, QueryState::Known);
        Ok(())
    }

    /// Resolve once the id reaches a terminal state; returns immediately if
    /// it already has. Any number of waiters may attach.
    pub async fn wait_terminal(&self) -> QueryState {
        let mut rx = self.tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                // Sender dropped: the machine is gone, report what we saw.
                return state;
            }
        }
    }

    /// Resolve only when the id is cancelled. Intended for `select!`ing
    /// against an in-flight warehouse statement; if the execution finishes
    /// first this future is simply dropped unresolved.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() == QueryState::Cancelled {
                return;
            }
            if rx.changed().await.is_err() {
                return std::future::pending::<()>().await;
            }
        }
    }

    fn set(&self, inner: &mut Inner, next: QueryState) {
        info!("query {} transitioned {} -> {}", self.id, inner.state, next);
        inner.state = next;
        self.tx.send_replace(next);
    }

    fn illegal(&self, inner: &Inner, to: QueryState) -> Error {
        Error::IllegalTransition {
            id: self.id.clone(),
            from: inner.state,
            to,
        }
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("id", &self.id)
            .field("state", &self.current())
            .finish()
    }
}

/// Process-wide registry of state machines, keyed by fingerprint.
#[derive(Default)]
pub struct StateRegistry {
    machines: RwLock<FxHashMap<QueryId, Arc<StateMachine>>>,
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &QueryId) -> Option<Arc<StateMachine>> {
        self.machines.read().get(id).cloned()
    }

    pub fn state_of(&self, id: &QueryId) -> Option<QueryState> {
        self.get(id).map(|m| m.current())
    }

    /// Forget a fingerprint entirely. Used when its cache record is
    /// evicted: the server then genuinely has no record of the id, and
    /// polls for it answer `awol`.
    pub fn remove(&self, id: &QueryId) {
        self.machines.write().remove(id);
    }

    /// Fetch the machine for `id`, creating it in `initial` if this is the
    /// first observation of the fingerprint.
    pub fn get_or_insert(&self, id: &QueryId, initial: QueryState) -> Arc<StateMachine> {
        if let Some(existing) = self.machines.read().get(id) {
            return existing.clone();
        }
        let mut machines = self.machines.write();
        // Re-check: someone may have created it while we waited.
        machines
            .entry(id.clone())
            .or_insert_with(|| Arc::new(StateMachine::new(id.clone(), initial)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(initial: QueryState) -> StateMachine {
        StateMachine::new(QueryId::from("deadbeefdeadbeefdeadbeefdeadbeef"), initial)
    }

    #[test]
    fn happy_path_transitions() {
        let m = machine(QueryState::Known);
        assert_eq!(m.enqueue(), (QueryState::Queued, true));
        m.begin_execute().unwrap();
        assert_eq!(m.current(), QueryState::Executing);
        m.finish().unwrap();
        assert_eq!(m.current(), QueryState::Completed);
    }

    #[test]
    fn enqueue_is_idempotent() {
        let m = machine(QueryState::Known);
        assert_eq!(m.enqueue(), (QueryState::Queued, true));
        assert_eq!(m.enqueue(), (QueryState::Queued, false));
        m.begin_execute().unwrap();
        assert_eq!(m.enqueue(), (QueryState::Executing, false));
    }

    #[test]
    fn begin_execute_requires_queued() {
        let m = machine(QueryState::Known);
        assert!(matches!(
            m.begin_execute(),
            Err(Error::IllegalTransition { .. })
        ));
    }

    #[test]
    fn fail_records_cause() {
        let m = machine(QueryState::Known);
        m.enqueue();
        m.begin_execute().unwrap();
        m.fail("dependency_failed(abc)").unwrap();
        assert_eq!(m.current(), QueryState::Errored);
        assert_eq!(m.error_cause().as_deref(), Some("dependency_failed(abc)"));
    }

    #[test]
    fn cancel_from_queued_and_executing() {
        let m = machine(QueryState::Known);
        m.enqueue();
        assert_eq!(m.cancel().unwrap(), QueryState::Cancelled);
        assert!(m.cancel_requested());

        let m = machine(QueryState::Known);
        m.enqueue();
        m.begin_execute().unwrap();
        assert_eq!(m.cancel().unwrap(), QueryState::Cancelled);
    }

    #[test]
    fn cancel_of_terminal_is_a_noop() {
        let m = machine(QueryState::Known);
        m.enqueue();
        m.begin_execute().unwrap();
        m.finish().unwrap();
        assert_eq!(m.cancel().unwrap(), QueryState::Completed);
    }

    #[test]
    fn cancel_of_known_is_illegal() {
        let m = machine(QueryState::Known);
        assert!(m.cancel().is_err());
    }

    #[test]
    fn terminal_states_are_sticky() {
        let m = machine(QueryState::Known);
        m.enqueue();
        m.begin_execute().unwrap();
        m.finish().unwrap();
        assert_eq!(m.enqueue(), (QueryState::Completed, false));
        assert!(m.begin_execute().is_err());
        assert!(m.fail("nope").is_err());
    }

    #[test]
    fn reset_reopens_errored_and_cancelled() {
        let m = machine(QueryState::Known);
        m.enqueue();
        m.begin_execute().unwrap();
        m.fail("boom").unwrap();
        m.reset().unwrap();
        assert_eq!(m.current(), QueryState::Known);
        assert_eq!(m.error_cause(), None);
        assert_eq!(m.enqueue(), (QueryState::Queued, true));
    }

    #[tokio::test]
    async fn waiters_observe_the_terminal_transition() {
        let m = Arc::new(machine(QueryState::Known));
        m.enqueue();
        m.begin_execute().unwrap();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let m = m.clone();
                tokio::spawn(async move { m.wait_terminal().await })
            })
            .collect();

        m.finish().unwrap();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), QueryState::Completed);
        }
    }

    #[tokio::test]
    async fn wait_terminal_returns_immediately_when_already_terminal() {
        let m = machine(QueryState::Known);
        m.enqueue();
        m.cancel().unwrap();
        assert_eq!(m.wait_terminal().await, QueryState::Cancelled);
    }

    #[test]
    fn registry_returns_the_same_machine_for_the_same_id() {
        let registry = StateRegistry::new();
        let id = QueryId::from("cafebabecafebabecafebabecafebabe");
        let a = registry.get_or_insert(&id, QueryState::Known);
        let b = registry.get_or_insert(&id, QueryState::Completed);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.current(), QueryState::Known);
    }
}
