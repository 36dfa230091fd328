//! The detection engine: unit-of-work lifecycle and hook dispatch
//!
//! A [`Finder`] is a cheap clonable handle. Pass it to whatever executes
//! queries (via [`QueryHook`]) and to whatever brackets requests (via
//! [`Finder::instrument`] or [`Finder::scope`]).
//!
//! # Lifecycle
//!
//! ```text
//! begin("GET /users") ─▶ on_query(sql) × N ─▶ end() ─▶ findings ─▶ sink
//!        │                     │                 │
//!   open fresh context   fingerprint + caller   close, report, reset
//! ```
//!
//! # Concurrency
//!
//! There is one context slot per engine. `on_query` does the expensive work
//! (fingerprinting, stack walking) without holding any engine lock, then
//! submits under a shared lock on the slot. `begin`/`end` take the slot
//! exclusively, so a reset never races an in-flight submission. Each
//! context carries a generation number; an observation computed for one
//! context is discarded if another context replaced it in the meantime.
//!
//! `instrument` additionally serializes whole units of work behind a gate,
//! making the instrumented section a critical section per engine.

use crate::aggregator::{AggregationContext, Aggregator, QueryObservation};
use crate::caller::{BacktraceSource, CallSite, CallerResolver, FrameSource};
use crate::config::{AggregationMode, FinderConfig, ReentrancyPolicy};
use crate::error::{FinderError, Result};
use crate::fingerprint::{Fingerprinter, SqlFingerprinter};
use crate::report::{Finding, FindingSink, Reporter, TracingSink};
use crate::sidecar::{ObservationQueue, QueueStats};
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

/// Receives every executed SQL statement
///
/// Implemented by [`Finder`]; drivers, proxies and the
/// [`QueryCaptureLayer`](crate::capture::QueryCaptureLayer) call it. It is
/// infallible: nothing observed may abort the query.
pub trait QueryHook: Send + Sync {
    fn on_query(&self, sql: &str);
}

impl<H: QueryHook + ?Sized> QueryHook for Arc<H> {
    fn on_query(&self, sql: &str) {
        (**self).on_query(sql)
    }
}

/// The open unit of work
struct Session {
    unit_id: String,
    generation: u64,
    aggregator: Arc<Aggregator>,
}

struct Inner {
    config: FinderConfig,
    fingerprinter: Box<dyn Fingerprinter>,
    resolver: CallerResolver,
    reporter: Reporter,
    slot: RwLock<Option<Session>>,
    generation: AtomicU64,
    /// Serializes `instrument` calls
    gate: Mutex<()>,
    queue: Option<ObservationQueue>,
}

/// N+1 query detection engine
#[derive(Clone)]
pub struct Finder {
    inner: Arc<Inner>,
}

impl fmt::Debug for Finder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finder")
            .field("config", &self.inner.config)
            .field("current_unit", &self.current_unit())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Finder`] with custom collaborators
pub struct FinderBuilder {
    config: FinderConfig,
    fingerprinter: Box<dyn Fingerprinter>,
    sink: Arc<dyn FindingSink>,
    frames: Arc<dyn FrameSource>,
}

impl Default for FinderBuilder {
    fn default() -> Self {
        Self {
            config: FinderConfig::default(),
            fingerprinter: Box::new(SqlFingerprinter),
            sink: Arc::new(TracingSink),
            frames: Arc::new(BacktraceSource::new()),
        }
    }
}

impl FinderBuilder {
    pub fn config(mut self, config: FinderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn threshold(mut self, threshold: usize) -> Self {
        self.config.threshold = threshold;
        self
    }

    pub fn fingerprinter(mut self, fingerprinter: impl Fingerprinter + 'static) -> Self {
        self.fingerprinter = Box::new(fingerprinter);
        self
    }

    pub fn sink(mut self, sink: impl FindingSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Stack source used for call-site resolution
    pub fn frame_source(mut self, frames: impl FrameSource + 'static) -> Self {
        self.frames = Arc::new(frames);
        self
    }

    pub fn build(self) -> Result<Finder> {
        self.config.validate()?;

        let queue = match self.config.aggregation {
            AggregationMode::Direct => None,
            AggregationMode::Queued { capacity } => Some(ObservationQueue::new(capacity)?),
        };

        let resolver = CallerResolver::with_source(
            self.frames,
            self.config.internal_prefixes.clone(),
            self.config.skip_frames,
        );
        let reporter = Reporter::new(self.config.threshold, self.sink);

        Ok(Finder {
            inner: Arc::new(Inner {
                config: self.config,
                fingerprinter: self.fingerprinter,
                resolver,
                reporter,
                slot: RwLock::new(None),
                generation: AtomicU64::new(0),
                gate: Mutex::new(()),
                queue,
            }),
        })
    }
}

impl Finder {
    /// Engine with the default fingerprinter, tracing sink and live stack walking
    pub fn new(config: FinderConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> FinderBuilder {
        FinderBuilder::default()
    }

    pub fn config(&self) -> &FinderConfig {
        &self.inner.config
    }

    /// Open a unit of work
    ///
    /// With a unit already open, [`ReentrancyPolicy::Reset`] discards it
    /// unreported and [`ReentrancyPolicy::Reject`] returns
    /// [`FinderError::ReentrantBegin`] and leaves it open.
    pub fn begin(&self, unit_id: impl Into<String>) -> Result<()> {
        let unit_id = unit_id.into();
        let mut slot = self.write_slot();

        if let Some(active) = slot.as_ref() {
            match self.inner.config.reentrancy {
                ReentrancyPolicy::Reject => {
                    return Err(FinderError::ReentrantBegin {
                        active: active.unit_id.clone(),
                        requested: unit_id,
                    });
                }
                ReentrancyPolicy::Reset => {
                    tracing::warn!(
                        stale = %active.unit_id,
                        unit = %unit_id,
                        discarded = active.aggregator.total(),
                        "Unit of work was never ended; discarding it"
                    );
                }
            }
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(unit = %unit_id, generation, "Unit of work started");
        *slot = Some(Session {
            unit_id,
            generation,
            aggregator: Arc::new(Aggregator::new()),
        });
        Ok(())
    }

    /// Close the open unit of work, report it and reset
    ///
    /// Returns the findings that were emitted. The slot is cleared before
    /// the sink runs, so a failing sink cannot leave state behind. Without
    /// an open unit this does nothing.
    pub fn end(&self) -> Vec<Finding> {
        let Some(session) = self.write_slot().take() else {
            tracing::debug!("end() called without an open unit of work");
            return Vec::new();
        };

        if let Some(queue) = &self.inner.queue {
            if let Err(err) = queue.flush() {
                tracing::warn!(error = %err, unit = %session.unit_id, "Failed to flush aggregation queue");
            }
        }

        let observed = session.aggregator.total();
        let context = AggregationContext::new(session.unit_id, session.aggregator.drain());
        let findings = self.inner.reporter.report(&context);

        tracing::debug!(
            unit = %context.unit_id,
            observed,
            distinct = context.entries.len(),
            findings = findings.len(),
            "Unit of work ended"
        );
        findings
    }

    /// Begin a unit of work that ends when the returned guard is finished or dropped
    pub fn scope(&self, unit_id: impl Into<String>) -> Result<UnitOfWork<'_>> {
        self.begin(unit_id)?;
        Ok(UnitOfWork {
            finder: self,
            finished: false,
        })
    }

    /// Run `handler` as one instrumented unit of work
    ///
    /// Units of work are serialized per engine. `end()` runs after the
    /// handler returns or panics. If the unit cannot be opened the handler
    /// still runs, uninstrumented.
    ///
    /// A nested call on the same thread and engine is a re-entrant
    /// [`begin`](Self::begin): with [`ReentrancyPolicy::Reset`] the inner
    /// unit replaces the outer one, with [`ReentrancyPolicy::Reject`] the
    /// inner handler runs inside the outer unit.
    pub fn instrument<T>(&self, unit_id: impl Into<String>, handler: impl FnOnce() -> T) -> T {
        self.instrument_with_findings(unit_id, handler).0
    }

    /// Like [`instrument`](Self::instrument), also returning the findings
    pub fn instrument_with_findings<T>(
        &self,
        unit_id: impl Into<String>,
        handler: impl FnOnce() -> T,
    ) -> (T, Vec<Finding>) {
        // A nested call on this thread already holds the gate; the
        // reentrancy policy decides what happens to the outer unit
        let _gate = if self.gate_held_here() {
            None
        } else {
            Some(GateGuard::acquire(self))
        };

        match self.scope(unit_id) {
            Ok(unit) => {
                let output = handler();
                (output, unit.finish())
            }
            Err(err) => {
                tracing::warn!(error = %err, "Could not open unit of work; running uninstrumented");
                (handler(), Vec::new())
            }
        }
    }

    /// Observe a statement with an explicitly known call site
    ///
    /// Skips stack walking. Used when the caller already knows where the
    /// statement came from, e.g. when replaying a recorded log.
    pub fn record(&self, sql: &str, call_site: Option<CallSite>) {
        if sql.trim().is_empty() {
            return;
        }
        let Some(generation) = self.current_generation() else {
            tracing::trace!("No open unit of work; statement ignored");
            return;
        };
        let fingerprint = self.inner.fingerprinter.fingerprint(sql);
        self.submit(generation, QueryObservation::new(fingerprint, call_site));
    }

    /// Unit id of the open unit of work, if any
    pub fn current_unit(&self) -> Option<String> {
        self.read_slot().as_ref().map(|s| s.unit_id.clone())
    }

    pub fn is_open(&self) -> bool {
        self.read_slot().is_some()
    }

    /// Copy of the open unit's state so far
    pub fn snapshot(&self) -> Option<AggregationContext> {
        if let Some(queue) = &self.inner.queue {
            if let Err(err) = queue.flush() {
                tracing::warn!(error = %err, "Failed to flush aggregation queue for snapshot");
            }
        }
        self.read_slot()
            .as_ref()
            .map(|s| AggregationContext::new(s.unit_id.clone(), s.aggregator.snapshot()))
    }

    /// Hand-off queue statistics in queued mode
    pub fn queue_stats(&self) -> Option<QueueStats> {
        self.inner.queue.as_ref().map(ObservationQueue::stats)
    }

    /// Identity of this engine, shared by all clones
    fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    fn gate_held_here(&self) -> bool {
        let key = self.key();
        HELD_GATES
            .try_with(|held| held.borrow().contains(&key))
            .unwrap_or(false)
    }

    fn current_generation(&self) -> Option<u64> {
        self.read_slot().as_ref().map(|s| s.generation)
    }

    fn submit(&self, generation: u64, observation: QueryObservation) {
        let slot = self.read_slot();
        let session = match slot.as_ref() {
            Some(session) if session.generation == generation => session,
            _ => {
                tracing::debug!(
                    query = %observation.fingerprint,
                    "Unit of work closed before the statement was recorded; ignored"
                );
                return;
            }
        };

        tracing::trace!(
            unit = %session.unit_id,
            query = %observation.fingerprint,
            caller = ?observation.call_site,
            "Statement observed"
        );

        match &self.inner.queue {
            None => session.aggregator.observe(observation),
            Some(queue) => {
                if let Err(observation) = queue.push(&session.aggregator, observation) {
                    tracing::warn!("Aggregation sidecar unavailable; recording inline");
                    session.aggregator.observe(observation);
                }
            }
        }
    }

    fn read_slot(&self) -> RwLockReadGuard<'_, Option<Session>> {
        self.inner.slot.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slot(&self) -> RwLockWriteGuard<'_, Option<Session>> {
        self.inner.slot.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl QueryHook for Finder {
    fn on_query(&self, sql: &str) {
        if sql.trim().is_empty() {
            return;
        }
        // Cheap check first: no stack walk when nothing is being measured
        let Some(generation) = self.current_generation() else {
            tracing::trace!("No open unit of work; statement ignored");
            return;
        };

        let fingerprint = self.inner.fingerprinter.fingerprint(sql);
        let call_site = self.inner.resolver.resolve();
        self.submit(generation, QueryObservation::new(fingerprint, call_site));
    }
}

thread_local! {
    /// Engines whose `instrument` gate the current thread holds
    static HELD_GATES: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Held `instrument` gate, registered with the owning thread
struct GateGuard<'a> {
    _lock: MutexGuard<'a, ()>,
    key: usize,
}

impl<'a> GateGuard<'a> {
    fn acquire(finder: &'a Finder) -> Self {
        let lock = finder
            .inner
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let key = finder.key();
        let _ = HELD_GATES.try_with(|held| held.borrow_mut().push(key));
        Self { _lock: lock, key }
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        // Deregister before the lock is released
        let key = self.key;
        let _ = HELD_GATES.try_with(|held| held.borrow_mut().retain(|k| *k != key));
    }
}

/// Open unit of work; ends on [`finish`](Self::finish) or drop
#[must_use = "the unit of work ends as soon as this guard is dropped"]
pub struct UnitOfWork<'a> {
    finder: &'a Finder,
    finished: bool,
}

impl UnitOfWork<'_> {
    /// End the unit of work and return its findings
    pub fn finish(mut self) -> Vec<Finding> {
        self.finished = true;
        self.finder.end()
    }
}

impl Drop for UnitOfWork<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.finder.end();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caller::{FixedFrames, Frame};
    use crate::report::CollectingSink;

    fn identity(sql: &str) -> String {
        sql.to_string()
    }

    fn finder_with(config: FinderConfig) -> (Finder, CollectingSink) {
        let sink = CollectingSink::new();
        let finder = Finder::builder()
            .config(config)
            .fingerprinter(identity)
            .sink(sink.clone())
            .frame_source(FixedFrames(vec![Frame::new("app::handler", "handler.rs", 12)]))
            .build()
            .unwrap();
        (finder, sink)
    }

    fn finder() -> (Finder, CollectingSink) {
        finder_with(FinderConfig::default().with_skip_frames(0))
    }

    #[test]
    fn test_three_repeats_one_finding() {
        let (finder, sink) = finder();
        finder.begin("GET /users").unwrap();
        for _ in 0..3 {
            finder.on_query("select ?");
        }
        let findings = finder.end();

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].count, 3);
        assert_eq!(findings[0].unit_id, "GET /users");
        assert_eq!(findings[0].call_site, Some(CallSite::new("handler.rs", 12)));
        assert_eq!(sink.findings(), findings);
    }

    #[test]
    fn test_single_query_no_finding() {
        let (finder, sink) = finder();
        finder.begin("GET /").unwrap();
        finder.on_query("select ?");
        assert!(finder.end().is_empty());
        assert!(sink.is_empty());
    }

    #[test]
    fn test_no_leak_between_units() {
        let (finder, _) = finder();
        finder.begin("first").unwrap();
        finder.on_query("select ?");
        finder.on_query("select ?");
        assert_eq!(finder.end().len(), 1);

        finder.begin("second").unwrap();
        assert!(finder.end().is_empty());
    }

    #[test]
    fn test_statements_outside_unit_ignored() {
        let (finder, _) = finder();
        finder.on_query("select ?");
        finder.on_query("select ?");
        finder.begin("u").unwrap();
        finder.on_query("select ?");
        assert!(finder.end().is_empty());
    }

    #[test]
    fn test_blank_sql_ignored() {
        let (finder, _) = finder();
        finder.begin("u").unwrap();
        finder.on_query("   ");
        finder.on_query("");
        finder.record("\n", None);
        assert!(finder.snapshot().unwrap().is_empty());
        finder.end();
    }

    #[test]
    fn test_end_without_begin_is_noop() {
        let (finder, _) = finder();
        assert!(finder.end().is_empty());
        assert!(!finder.is_open());
    }

    #[test]
    fn test_reentrant_begin_resets_by_default() {
        let (finder, sink) = finder();
        finder.begin("stale").unwrap();
        finder.on_query("select ?");
        finder.on_query("select ?");

        finder.begin("fresh").unwrap();
        assert_eq!(finder.current_unit().as_deref(), Some("fresh"));
        assert!(finder.end().is_empty());
        assert!(sink.is_empty());
    }

    #[test]
    fn test_reentrant_begin_rejected_when_strict() {
        let (finder, _) = finder_with(FinderConfig::strict().with_skip_frames(0));
        finder.begin("outer").unwrap();
        finder.on_query("select ?");

        let err = finder.begin("inner").unwrap_err();
        assert!(matches!(err, FinderError::ReentrantBegin { .. }));
        assert_eq!(finder.current_unit().as_deref(), Some("outer"));

        finder.on_query("select ?");
        assert_eq!(finder.end()[0].count, 2);
    }

    #[test]
    fn test_record_uses_given_call_site() {
        let (finder, _) = finder();
        finder.begin("u").unwrap();
        finder.record("select ?", Some(CallSite::new("log.sql", 3)));
        finder.record("select ?", Some(CallSite::new("log.sql", 9)));
        let findings = finder.end();
        assert_eq!(findings[0].call_site, Some(CallSite::new("log.sql", 3)));
    }

    #[test]
    fn test_stale_generation_discarded() {
        let (finder, _) = finder();
        finder.begin("old").unwrap();
        let stale = finder.current_generation().unwrap();
        finder.begin("new").unwrap();

        finder.submit(stale, QueryObservation::new("select ?", None));
        assert!(finder.snapshot().unwrap().is_empty());
        finder.end();
    }

    #[test]
    fn test_scope_guard_ends_on_drop() {
        let (finder, sink) = finder();
        {
            let _unit = finder.scope("scoped").unwrap();
            finder.on_query("a");
            finder.on_query("a");
        }
        assert!(!finder.is_open());
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_instrument_returns_handler_output() {
        let (finder, _) = finder();
        let (value, findings) = finder.instrument_with_findings("GET /x", || {
            finder.on_query("a");
            finder.on_query("a");
            42
        });
        assert_eq!(value, 42);
        assert_eq!(findings.len(), 1);
        assert!(!finder.is_open());
    }

    #[test]
    fn test_instrument_ends_on_panic() {
        let (finder, sink) = finder();
        let inner = finder.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            inner.instrument("GET /boom", || {
                inner.on_query("a");
                inner.on_query("a");
                panic!("handler failed");
            })
        }));
        assert!(result.is_err());
        assert!(!finder.is_open());
        assert_eq!(sink.len(), 1);

        // Gate is usable after the panic
        assert_eq!(finder.instrument("GET /ok", || 1), 1);
    }

    /// Run `f` on another thread, failing instead of hanging
    fn within_timeout<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(f());
        });
        rx.recv_timeout(std::time::Duration::from_secs(5))
            .expect("nested instrument did not return")
    }

    #[test]
    fn test_nested_instrument_resets_outer_unit() {
        let (finder, sink) = finder();
        let engine = finder.clone();

        let ((value, inner), outer) = within_timeout(move || {
            engine.instrument_with_findings("GET /outer", || {
                engine.on_query("a");
                engine.on_query("a");
                engine.instrument_with_findings("GET /inner", || {
                    engine.on_query("b");
                    engine.on_query("b");
                    7
                })
            })
        });

        assert_eq!(value, 7);
        assert_eq!(inner.len(), 1);
        assert_eq!(inner[0].unit_id, "GET /inner");
        assert_eq!(inner[0].fingerprint, "b");
        // The outer unit was discarded by the inner begin
        assert!(outer.is_empty());
        assert_eq!(sink.len(), 1);
        assert!(!finder.is_open());
    }

    #[test]
    fn test_nested_instrument_rejected_joins_outer_unit() {
        let (finder, _) = finder_with(FinderConfig::strict().with_skip_frames(0));
        let engine = finder.clone();

        let ((value, inner), outer) = within_timeout(move || {
            engine.instrument_with_findings("GET /outer", || {
                engine.on_query("a");
                engine.on_query("a");
                engine.instrument_with_findings("GET /inner", || {
                    engine.on_query("b");
                    engine.on_query("b");
                    7
                })
            })
        });

        assert_eq!(value, 7);
        assert!(inner.is_empty());
        assert_eq!(outer.len(), 2);
        assert!(outer.iter().all(|f| f.unit_id == "GET /outer"));
        assert!(!finder.is_open());
    }

    #[test]
    fn test_gate_released_after_nested_instrument() {
        let (finder, _) = finder();
        let engine = finder.clone();
        within_timeout(move || engine.instrument("outer", || engine.instrument("inner", || ())));

        // Another thread can take the gate afterwards
        let engine = finder.clone();
        assert_eq!(within_timeout(move || engine.instrument("next", || 3)), 3);
        assert!(!finder.gate_held_here());
    }

    #[test]
    fn test_separate_engines_nest_independently() {
        let (outer_engine, outer_sink) = finder();
        let (inner_engine, inner_sink) = finder();

        let ((), _) = outer_engine.instrument_with_findings("outer", || {
            outer_engine.on_query("a");
            outer_engine.on_query("a");
            inner_engine.instrument("inner", || {
                inner_engine.on_query("b");
                inner_engine.on_query("b");
            });
        });

        assert_eq!(outer_sink.findings()[0].unit_id, "outer");
        assert_eq!(inner_sink.findings()[0].unit_id, "inner");
    }

    #[test]
    fn test_queued_mode_counts_everything() {
        let (finder, _) = finder_with(
            FinderConfig::default()
                .with_skip_frames(0)
                .with_aggregation(AggregationMode::Queued { capacity: 2 }),
        );
        finder.begin("u").unwrap();
        for _ in 0..100 {
            finder.on_query("select ?");
        }
        let findings = finder.end();
        assert_eq!(findings[0].count, 100);
        assert_eq!(finder.queue_stats().unwrap().total_pushed, 100);
    }

    #[test]
    fn test_queued_snapshot_sees_pending_observations() {
        let (finder, _) = finder_with(
            FinderConfig::default()
                .with_skip_frames(0)
                .with_aggregation(AggregationMode::Queued { capacity: 4 }),
        );
        finder.begin("u").unwrap();
        for _ in 0..10 {
            finder.on_query("select ?");
        }
        assert_eq!(finder.snapshot().unwrap().count("select ?"), 10);
        assert_eq!(finder.end()[0].count, 10);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Finder::new(FinderConfig::default().with_threshold(0));
        assert!(matches!(result, Err(FinderError::InvalidConfig(_))));
    }

    #[test]
    fn test_direct_mode_has_no_queue() {
        let (finder, _) = finder();
        assert!(finder.queue_stats().is_none());
    }
}
