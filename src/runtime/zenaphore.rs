//! Zenaphore: multi-waiter wait/notify
//!
//! Waiters register a node on a lock-free list, then block on a shared
//! event until a notifier pops their node and marks it triggered. Any
//! waiter registered before a notify eventually observes it.
//!
//! A waiter is used in a two-step loop:
//!
//! ```rust
//! use pkgflow::runtime::zenaphore::{Zenaphore, ZenaphoreWaiter};
//! # use std::sync::atomic::{AtomicBool, Ordering};
//!
//! let zenaphore = Zenaphore::new();
//! let has_work = AtomicBool::new(true);
//! let mut waiter = ZenaphoreWaiter::new(&zenaphore);
//! loop {
//!     if has_work.swap(false, Ordering::AcqRel) {
//!         continue; // do the work
//!     }
//!     // First call registers and returns so the caller re-checks for work
//!     // (a notify after registration is never lost); the second blocks.
//!     if !waiter.wait_timeout(std::time::Duration::from_millis(1)) {
//!         break;
//!     }
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct WaiterNode {
    triggered: AtomicBool,
    abandoned: AtomicBool,
}

/// Multi-waiter event object
#[derive(Debug, Default)]
pub struct Zenaphore {
    waiters: SegQueue<Arc<WaiterNode>>,
    event: Mutex<()>,
    signal: Condvar,
}

impl Zenaphore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake one registered waiter, if any
    pub fn notify_one(&self) {
        while let Some(node) = self.waiters.pop() {
            if node.abandoned.load(Ordering::Acquire) {
                continue;
            }
            self.trigger(&node);
            return;
        }
    }

    /// Wake every registered waiter
    pub fn notify_all(&self) {
        let mut woke = false;
        let _event = self.event.lock();
        while let Some(node) = self.waiters.pop() {
            node.triggered.store(true, Ordering::Release);
            woke = true;
        }
        if woke {
            self.signal.notify_all();
        }
    }

    fn trigger(
        &self,
        node: &WaiterNode,
    ) {
        let _event = self.event.lock();
        node.triggered.store(true, Ordering::Release);
        // The event is shared; every sleeper re-checks its own node
        self.signal.notify_all();
    }

    /// Number of registered, not yet triggered waiters (approximate)
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}

/// Per-thread handle for waiting on a [`Zenaphore`]
#[derive(Debug)]
pub struct ZenaphoreWaiter<'a> {
    owner: &'a Zenaphore,
    node: Option<Arc<WaiterNode>>,
}

impl<'a> ZenaphoreWaiter<'a> {
    pub fn new(owner: &'a Zenaphore) -> Self {
        Self { owner, node: None }
    }

    /// Register on the first call, block on the second.
    pub fn wait(&mut self) {
        self.wait_until(None);
    }

    /// Like [`wait`](Self::wait), but gives up after `timeout`. Returns
    /// `false` on timeout; the waiter stays registered.
    pub fn wait_timeout(
        &mut self,
        timeout: Duration,
    ) -> bool {
        self.wait_until(Some(Instant::now() + timeout))
    }

    fn wait_until(
        &mut self,
        deadline: Option<Instant>,
    ) -> bool {
        let node = match &self.node {
            None => {
                let node = Arc::new(WaiterNode::default());
                self.owner.waiters.push(Arc::clone(&node));
                self.node = Some(node);
                return true;
            }
            Some(node) => Arc::clone(node),
        };

        if !node.triggered.load(Ordering::Acquire) {
            let mut event = self.owner.event.lock();
            while !node.triggered.load(Ordering::Acquire) {
                match deadline {
                    Some(deadline) => {
                        if self.owner.signal.wait_until(&mut event, deadline).timed_out()
                            && !node.triggered.load(Ordering::Acquire)
                        {
                            return false;
                        }
                    }
                    None => self.owner.signal.wait(&mut event),
                }
            }
        }
        self.node = None;
        true
    }
}

impl Drop for ZenaphoreWaiter<'_> {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            node.abandoned.store(true, Ordering::Release);
        }
    }
}
