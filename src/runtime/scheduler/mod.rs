//! Async package loader
//!
//! [`AsyncLoader`] takes load requests, deduplicates them into one
//! [`LoadUnit`](crate::package::unit::LoadUnit) per package, reads package
//! data under a byte budget, and drives every unit's graph nodes on a pool
//! of worker threads plus the consuming thread that calls [`AsyncLoader::tick`].
//! Work that must run on the consuming thread (deferred post-load,
//! finalization, callbacks) only happens inside `tick`.

pub mod io;
pub mod queue;
mod phases;
mod units;
mod worker;

pub use io::{IoDispatcher, PendingRead};
pub use queue::{QueueKind, ReadyQueue};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use slab::Slab;
use tracing::{debug, error, info};

use crate::object::ObjectHandle;
use crate::package::registry::{Registry, SweepReport};
use crate::package::unit::{LoadPhase, LoadUnit, UnitKey, UnitSlot};
use crate::package::{
    CompletionCallback, LoadCompletion, LoadRequest, LoadRequestDescriptor, PackageId, RequestId,
};
use crate::runtime::dag::{ExecContext, GraphNode, NodeOutcome, ThreadKind};
use crate::runtime::zenaphore::{Zenaphore, ZenaphoreWaiter};
use crate::storage::BlockStorage;
use crate::util::config::LoaderConfig;

use worker::Suspension;

/// Loader statistics.
#[derive(Debug, Default)]
pub struct LoaderStats {
    /// Requests accepted by `load`.
    pub requests: AtomicUsize,
    /// Units created, imports included.
    pub units_created: AtomicUsize,
    pub headers_parsed: AtomicUsize,
    pub exports_created: AtomicUsize,
    pub exports_serialized: AtomicUsize,
    /// Post-loads run by the thread-safe pass.
    pub post_loads: AtomicUsize,
    /// Post-loads left for the consuming thread.
    pub deferred_post_loads: AtomicUsize,
    pub succeeded: AtomicUsize,
    pub failed: AtomicUsize,
    pub canceled: AtomicUsize,
    /// Reads that came back with an error.
    pub io_failures: AtomicUsize,
}

macro_rules! record {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            #[inline]
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl LoaderStats {
    record! {
        record_request => requests,
        record_unit => units_created,
        record_header => headers_parsed,
        record_export_created => exports_created,
        record_export_serialized => exports_serialized,
        record_post_load => post_loads,
        record_deferred_post_load => deferred_post_loads,
        record_success => succeeded,
        record_failure => failed,
        record_cancel => canceled,
        record_io_failure => io_failures,
    }

    /// Copy every counter.
    pub fn snapshot(&self) -> LoaderStatsSnapshot {
        let get = |counter: &AtomicUsize| counter.load(Ordering::Relaxed);
        LoaderStatsSnapshot {
            requests: get(&self.requests),
            units_created: get(&self.units_created),
            headers_parsed: get(&self.headers_parsed),
            exports_created: get(&self.exports_created),
            exports_serialized: get(&self.exports_serialized),
            post_loads: get(&self.post_loads),
            deferred_post_loads: get(&self.deferred_post_loads),
            succeeded: get(&self.succeeded),
            failed: get(&self.failed),
            canceled: get(&self.canceled),
            io_failures: get(&self.io_failures),
            peak_in_flight_bytes: 0,
        }
    }
}

/// Point-in-time copy of [`LoaderStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderStatsSnapshot {
    pub requests: usize,
    pub units_created: usize,
    pub headers_parsed: usize,
    pub exports_created: usize,
    pub exports_serialized: usize,
    pub post_loads: usize,
    pub deferred_post_loads: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub canceled: usize,
    pub io_failures: usize,
    /// Largest number of payload bytes in flight at once.
    pub peak_in_flight_bytes: u64,
}

impl fmt::Display for LoaderStatsSnapshot {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        writeln!(f, "requests:            {}", self.requests)?;
        writeln!(f, "units created:       {}", self.units_created)?;
        writeln!(f, "headers parsed:      {}", self.headers_parsed)?;
        writeln!(
            f,
            "exports:             {} created, {} serialized",
            self.exports_created, self.exports_serialized
        )?;
        writeln!(
            f,
            "post-loads:          {} thread-safe, {} deferred",
            self.post_loads, self.deferred_post_loads
        )?;
        writeln!(
            f,
            "results:             {} ok, {} failed, {} canceled",
            self.succeeded, self.failed, self.canceled
        )?;
        writeln!(f, "I/O failures:        {}", self.io_failures)?;
        write!(f, "peak bytes in flight: {}", self.peak_in_flight_bytes)
    }
}

/// A finished request waiting for its callback
pub(crate) struct PendingCompletion {
    pub completion: LoadCompletion,
    pub callback: Option<CompletionCallback>,
}

/// Cancels and priority changes for requests not yet taken in
#[derive(Debug, Default)]
pub(crate) struct IntakeOverrides {
    pub canceled: HashSet<RequestId>,
    pub priorities: HashMap<RequestId, i32>,
}

/// State touched only by the consuming thread
#[derive(Debug, Default)]
pub(crate) struct ConsumerState {
    /// Node that ran out of time in the previous tick
    yielded: Option<Arc<GraphNode>>,
    gc_suspended: bool,
    /// Finalized units waiting for their imports before clustering
    deferred_clusters: Vec<Arc<LoadUnit>>,
}

/// Everything worker threads and I/O callbacks share with the loader
pub(crate) struct LoaderShared {
    pub(crate) config: LoaderConfig,
    pub(crate) registry: Arc<Registry>,
    pub(crate) storage: Arc<dyn BlockStorage>,
    pub(crate) worker_queue: Arc<ReadyQueue>,
    pub(crate) consumer_queue: Arc<ReadyQueue>,
    pub(crate) requests: SegQueue<LoadRequestDescriptor>,
    /// Requests whose callback has not run yet
    pub(crate) pending: Mutex<HashSet<RequestId>>,
    pub(crate) request_units: Mutex<HashMap<RequestId, Arc<LoadUnit>>>,
    pub(crate) overrides: Mutex<IntakeOverrides>,
    pub(crate) units: RwLock<Slab<Arc<LoadUnit>>>,
    /// Dedup table
    pub(crate) active: Mutex<IndexMap<UnitKey, Arc<LoadUnit>>>,
    pub(crate) io: IoDispatcher,
    pub(crate) completed: SegQueue<UnitSlot>,
    pub(crate) deletions: SegQueue<UnitSlot>,
    pub(crate) suspension: Suspension,
    pub(crate) stopping: AtomicBool,
    pub(crate) stats: LoaderStats,
    next_request: AtomicU64,
}

impl LoaderShared {
    fn is_loading(&self) -> bool {
        !self.requests.is_empty() || !self.pending.lock().is_empty() || !self.units.read().is_empty()
    }
}

/// Event-driven package loader.
///
/// ```rust
/// use std::sync::Arc;
/// use pkgflow::package::registry::Registry;
/// use pkgflow::runtime::gc::NoCollector;
/// use pkgflow::runtime::scheduler::AsyncLoader;
/// use pkgflow::storage::MemoryStorage;
/// use pkgflow::util::config::LoaderConfig;
///
/// let registry = Registry::init(Arc::new(NoCollector), None);
/// let loader = AsyncLoader::start(
///     LoaderConfig::default(),
///     registry,
///     Arc::new(MemoryStorage::default()),
/// );
/// assert!(!loader.is_loading());
/// loader.shutdown();
/// ```
pub struct AsyncLoader {
    shared: Arc<LoaderShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    consumer: Mutex<ConsumerState>,
}

impl AsyncLoader {
    /// Create the loader and spawn its workers.
    pub fn start(
        config: LoaderConfig,
        registry: Arc<Registry>,
        storage: Arc<dyn BlockStorage>,
    ) -> Self {
        let consumer_zenaphore = Arc::new(Zenaphore::new());
        // Without workers the consuming thread drains both queues, so a push
        // to either must wake it
        let worker_zenaphore = if config.worker_threads == 0 {
            consumer_zenaphore.clone()
        } else {
            Arc::new(Zenaphore::new())
        };
        let capacity = config.ready_queue_capacity;
        let worker_count = config.worker_threads;

        let shared = Arc::new(LoaderShared {
            worker_queue: Arc::new(ReadyQueue::new(QueueKind::Worker, capacity, worker_zenaphore)),
            consumer_queue: Arc::new(ReadyQueue::new(QueueKind::Consumer, capacity, consumer_zenaphore)),
            io: IoDispatcher::new(config.io_budget_bytes),
            config,
            registry,
            storage,
            requests: SegQueue::new(),
            pending: Mutex::new(HashSet::new()),
            request_units: Mutex::new(HashMap::new()),
            overrides: Mutex::new(IntakeOverrides::default()),
            units: RwLock::new(Slab::new()),
            active: Mutex::new(IndexMap::new()),
            completed: SegQueue::new(),
            deletions: SegQueue::new(),
            suspension: Suspension::default(),
            stopping: AtomicBool::new(false),
            stats: LoaderStats::default(),
            next_request: AtomicU64::new(1),
        });

        let workers = worker::spawn_workers(&shared, worker_count);
        info!(
            "async loader started with {} worker(s), {} byte I/O budget",
            workers.len(),
            shared.config.io_budget_bytes
        );

        Self {
            shared,
            workers: Mutex::new(workers),
            consumer: Mutex::new(ConsumerState::default()),
        }
    }

    #[inline]
    pub fn config(&self) -> &LoaderConfig {
        &self.shared.config
    }

    #[inline]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    // ---- requests ----

    /// Queue a load; its callback runs inside a later `tick`.
    pub fn load(
        &self,
        request: LoadRequest,
    ) -> RequestId {
        let id = RequestId(self.shared.next_request.fetch_add(1, Ordering::Relaxed));
        let descriptor = request.into_descriptor(id);
        debug!("request {} for {}", id, descriptor.package_name);
        self.shared.pending.lock().insert(id);
        self.shared.requests.push(descriptor);
        self.shared.stats.record_request();
        self.shared.consumer_queue.zenaphore().notify_one();
        id
    }

    /// Cancel a request. Every request waiting on the same package is
    /// canceled with it. False if the request already finished or is past
    /// the point where it can be stopped.
    pub fn cancel(
        &self,
        id: RequestId,
    ) -> bool {
        let shared = &self.shared;
        if !shared.pending.lock().contains(&id) {
            return false;
        }
        let unit = shared.request_units.lock().get(&id).cloned();
        match unit {
            Some(unit) => {
                let canceled = shared.cancel_unit(&unit);
                if canceled {
                    debug!("canceled {} ({})", unit.package_name(), id);
                }
                canceled
            }
            None => {
                shared.overrides.lock().canceled.insert(id);
                true
            }
        }
    }

    /// Change a pending request's priority.
    ///
    /// A package shared by several requests keeps the highest priority any
    /// of them (or any importer) wants. Raising it also raises the queued
    /// reads of the package and its in-flight imports.
    pub fn set_priority(
        &self,
        id: RequestId,
        priority: i32,
    ) -> bool {
        let shared = &self.shared;
        if !shared.pending.lock().contains(&id) {
            return false;
        }
        let unit = shared.request_units.lock().get(&id).cloned();
        match unit {
            Some(unit) => {
                let effective = {
                    let mut state = unit.lock();
                    if let Some(callback) = state.callbacks.iter_mut().find(|c| c.request_id == id) {
                        callback.priority = priority;
                    }
                    unit.refresh_priority(&state)
                };
                shared.io.reprioritize(unit.slot(), effective);
                shared.pass_priority_to_imports(&unit, effective);
            }
            None => {
                shared.overrides.lock().priorities.insert(id, priority);
            }
        }
        true
    }

    // ---- consuming thread ----

    /// Do consuming-thread work: take in requests, issue reads, run ready
    /// nodes, finalize finished units and run their callbacks.
    ///
    /// With a time limit, node execution stops at the first boundary past
    /// it; at least one node runs per call. Returns whether anything is
    /// still loading.
    pub fn tick(
        &self,
        time_limit: Option<Duration>,
    ) -> bool {
        let deadline = time_limit.map(|limit| Instant::now() + limit);
        let completions = {
            let mut consumer = self.consumer.lock();
            self.tick_locked(&mut consumer, deadline)
        };
        self.shared.dispatch(completions);
        self.is_loading()
    }

    fn tick_locked(
        &self,
        consumer: &mut ConsumerState,
        deadline: Option<Instant>,
    ) -> Vec<PendingCompletion> {
        let shared = &self.shared;
        let mut completions = Vec::new();

        if shared.registry.collector().is_collection_requested() {
            if !consumer.gc_suspended {
                debug!("collection requested, parking workers");
                self.suspend();
                consumer.gc_suspended = true;
            }
            return completions;
        }
        if consumer.gc_suspended {
            consumer.gc_suspended = false;
            self.resume();
        }
        if shared.suspension.is_requested() {
            return completions;
        }

        shared.process_requests(&mut completions);
        shared.pump_io();
        self.run_nodes(consumer, deadline);
        shared.finalize_completed(consumer, &mut completions);
        shared.drain_deletions();
        completions
    }

    fn run_nodes(
        &self,
        consumer: &mut ConsumerState,
        deadline: Option<Instant>,
    ) {
        let shared = self.shared.as_ref();

        if let Some(node) = consumer.yielded.take() {
            let home = node.queue().clone();
            let mut ctx = ExecContext::new(ThreadKind::Consumer, &home, deadline);
            if ctx.run(node, shared) == NodeOutcome::Yielded {
                consumer.yielded = ctx.take_yielded();
                return;
            }
        }

        let mut ran = false;
        loop {
            if ran && deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break;
            }
            // The consuming thread also helps with worker work
            let (node, home) = match shared.consumer_queue.pop() {
                Some(node) => (node, &shared.consumer_queue),
                None => match shared.worker_queue.pop() {
                    Some(node) => (node, &shared.worker_queue),
                    None => break,
                },
            };
            ran = true;

            let mut ctx = ExecContext::new(ThreadKind::Consumer, home, deadline);
            if ctx.run(node, shared) == NodeOutcome::Yielded {
                consumer.yielded = ctx.take_yielded();
                break;
            }
        }
    }

    /// Tick until `request` has completed, or until nothing is loading when
    /// `request` is `None`.
    pub fn flush(
        &self,
        request: Option<RequestId>,
    ) {
        let zenaphore = self.shared.consumer_queue.zenaphore().clone();
        let mut waiter = ZenaphoreWaiter::new(&zenaphore);
        let interval = self.shared.config.flush_poll_interval();

        loop {
            self.tick(None);
            let done = match request {
                Some(id) => !self.is_request_pending(id),
                None => !self.is_loading(),
            };
            if done {
                break;
            }
            waiter.wait_timeout(interval);
        }
    }

    // ---- collector cooperation ----

    /// Park every worker after its current node; blocks until they are
    /// parked. Nested calls need matching `resume` calls.
    pub fn suspend(&self) {
        let shared = &self.shared;
        shared.suspension.request();
        shared.worker_queue.zenaphore().notify_all();
        shared
            .suspension
            .wait_parked(self.worker_count(), &shared.stopping);
    }

    pub fn resume(&self) {
        self.shared.suspension.release();
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.suspension.is_requested()
    }

    /// Number of workers currently parked
    pub fn parked_workers(&self) -> usize {
        self.shared.suspension.parked()
    }

    /// The collector is about to free `objects`; forget them.
    pub fn notify_unreachable(
        &self,
        objects: &[ObjectHandle],
    ) -> SweepReport {
        let report = self.shared.registry.remove_unreachable(objects);
        debug!("sweep: {:?}", report);
        report
    }

    // ---- introspection ----

    pub fn is_loading(&self) -> bool {
        self.shared.is_loading()
    }

    /// Requests whose callback has not run yet
    pub fn pending_request_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn is_request_pending(
        &self,
        id: RequestId,
    ) -> bool {
        self.shared.pending.lock().contains(&id)
    }

    /// Phase of the live unit loading `package` under its own name
    pub fn unit_phase(
        &self,
        package: PackageId,
    ) -> Option<LoadPhase> {
        let key = UnitKey {
            disk_id: package,
            custom_name: None,
        };
        self.shared.active.lock().get(&key).map(|unit| unit.phase())
    }

    /// Effective priority of the live unit loading `package`
    pub fn unit_priority(
        &self,
        package: PackageId,
    ) -> Option<i32> {
        let key = UnitKey {
            disk_id: package,
            custom_name: None,
        };
        self.shared.active.lock().get(&key).map(|unit| unit.priority())
    }

    /// Whether any live unit reads `package`'s data
    pub fn has_unit(
        &self,
        package: PackageId,
    ) -> bool {
        self.shared
            .active
            .lock()
            .keys()
            .any(|key| key.disk_id == package)
    }

    /// Number of live units
    pub fn unit_count(&self) -> usize {
        self.shared.units.read().len()
    }

    pub fn stats(&self) -> LoaderStatsSnapshot {
        LoaderStatsSnapshot {
            peak_in_flight_bytes: self.shared.io.peak_bytes(),
            ..self.shared.stats.snapshot()
        }
    }

    /// Payload bytes issued and not yet delivered
    pub fn in_flight_bytes(&self) -> u64 {
        self.shared.io.in_flight_bytes()
    }

    // ---- lifecycle ----

    /// Stop and join the workers. Loads still in flight are abandoned.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        shared.suspension.release_all();
        shared.worker_queue.zenaphore().notify_all();

        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                error!("loader worker panicked");
            }
        }

        // Import lists can form cycles between unfinished units
        for (_, unit) in shared.units.read().iter() {
            unit.lock().imports.clear();
        }
        shared.units.write().clear();
        shared.active.lock().clear();
        shared.request_units.lock().clear();
        self.consumer.lock().deferred_clusters.clear();
        info!("async loader stopped");
    }
}

impl Drop for AsyncLoader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for AsyncLoader {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("AsyncLoader")
            .field("workers", &self.worker_count())
            .field("units", &self.unit_count())
            .field("pending_requests", &self.pending_request_count())
            .field("in_flight_bytes", &self.in_flight_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests;
