//! Worker pool and cooperative suspension

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::LoaderShared;
use crate::runtime::dag::{ExecContext, ThreadKind};
use crate::runtime::zenaphore::ZenaphoreWaiter;

#[derive(Debug, Default)]
struct SuspendState {
    /// Outstanding suspend requests; nested
    requested: usize,
    parked: usize,
}

/// Park/unpark protocol between the loader and its workers
#[derive(Debug, Default)]
pub(crate) struct Suspension {
    state: Mutex<SuspendState>,
    changed: Condvar,
}

impl Suspension {
    pub fn request(&self) {
        self.state.lock().requested += 1;
    }

    pub fn release(&self) {
        let mut state = self.state.lock();
        state.requested = state.requested.saturating_sub(1);
        self.changed.notify_all();
    }

    pub fn release_all(&self) {
        self.state.lock().requested = 0;
        self.changed.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        self.state.lock().requested > 0
    }

    pub fn parked(&self) -> usize {
        self.state.lock().parked
    }

    /// Block the calling worker while a suspension is requested
    pub fn park_if_requested(
        &self,
        stopping: &AtomicBool,
    ) {
        let mut state = self.state.lock();
        if state.requested == 0 {
            return;
        }
        state.parked += 1;
        self.changed.notify_all();
        while state.requested > 0 && !stopping.load(Ordering::Acquire) {
            self.changed.wait(&mut state);
        }
        state.parked -= 1;
        self.changed.notify_all();
    }

    /// Wait until `workers` threads are parked, the request is withdrawn or
    /// the loader stops
    pub fn wait_parked(
        &self,
        workers: usize,
        stopping: &AtomicBool,
    ) {
        let mut state = self.state.lock();
        while state.parked < workers && state.requested > 0 && !stopping.load(Ordering::Acquire) {
            self.changed
                .wait_for(&mut state, Duration::from_millis(10));
        }
    }
}

/// Spawn up to `count` workers. A worker that cannot be spawned is logged
/// and skipped; the consuming thread still drains the worker queue.
pub(crate) fn spawn_workers(
    shared: &Arc<LoaderShared>,
    count: usize,
) -> Vec<thread::JoinHandle<()>> {
    let mut workers = Vec::with_capacity(count);

    for worker_id in 0..count {
        let shared = shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("pkgflow-worker-{}", worker_id))
            .spawn(move || worker_loop(worker_id, &shared));

        match spawned {
            Ok(handle) => workers.push(handle),
            Err(err) => {
                warn!("failed to spawn loader worker {}: {}", worker_id, err);
                break;
            }
        }
    }

    workers
}

/// Pop and run ready nodes until the loader stops
fn worker_loop(
    worker_id: usize,
    shared: &Arc<LoaderShared>,
) {
    debug!("worker {} started", worker_id);
    let queue = &shared.worker_queue;
    let mut waiter = ZenaphoreWaiter::new(queue.zenaphore());

    loop {
        if shared.stopping.load(Ordering::Acquire) {
            break;
        }
        shared.suspension.park_if_requested(&shared.stopping);

        if let Some(node) = queue.pop() {
            let mut ctx = ExecContext::new(ThreadKind::Worker, queue, None);
            ctx.run(node, shared.as_ref());
            continue;
        }

        // Registers on the first call so the queue is checked again before
        // the second call blocks
        waiter.wait();
    }
    debug!("worker {} stopped", worker_id);
}
