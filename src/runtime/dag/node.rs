//! Graph node: the unit of scheduled loader work
//!
//! A node fires when its barrier reaches zero. The barrier starts at 1
//! ("not yet scheduled") and grows by one per `depends_on`. Completing a
//! node releases every dependent's barrier; newly ready dependents are
//! collected in the caller's [`ExecContext`] rather than run recursively.

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::context::ExecContext;
use crate::package::unit::UnitSlot;
use crate::runtime::scheduler::queue::ReadyQueue;

/// Which step of a package load a node performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodePhase {
    /// Parse the header and wire cross-package edges
    ProcessSummary,
    /// Run the create/serialize commands of one export bundle
    ProcessBundle(u32),
    /// Wait for external reads, then seal the export table
    ExportsDone,
    /// Thread-safe post-load for one bundle
    PostLoad(u32),
    /// Consuming-thread post-load for one bundle
    DeferredPostLoad(u32),
}

/// What a node does: which unit, which phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeTask {
    pub unit: UnitSlot,
    pub phase: NodePhase,
}

impl NodeTask {
    #[inline]
    pub fn new(
        unit: UnitSlot,
        phase: NodePhase,
    ) -> Self {
        Self { unit, phase }
    }
}

/// Node execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    Waiting = 0,
    Executing = 1,
    /// Yielded at an iteration boundary; resumed by the cooperative tick
    TimedOut = 2,
    Completed = 3,
}

impl NodeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => NodeState::Waiting,
            1 => NodeState::Executing,
            2 => NodeState::TimedOut,
            _ => NodeState::Completed,
        }
    }
}

#[derive(Default)]
struct Dependents {
    nodes: SmallVec<[Arc<GraphNode>; 1]>,
    /// Set once the node completed; later `depends_on` calls are no-ops
    closed: bool,
}

/// A barrier-gated unit of work
pub struct GraphNode {
    task: NodeTask,
    barrier: AtomicI32,
    state: AtomicU8,
    eager: bool,
    queue: Arc<ReadyQueue>,
    dependents: Mutex<Dependents>,
}

impl GraphNode {
    /// Create a node bound to `queue`. Eager nodes may run inline on the
    /// thread that releases their last barrier.
    pub fn new(
        task: NodeTask,
        queue: Arc<ReadyQueue>,
        eager: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            task,
            barrier: AtomicI32::new(1),
            state: AtomicU8::new(NodeState::Waiting as u8),
            eager,
            queue,
            dependents: Mutex::new(Dependents::default()),
        })
    }

    #[inline]
    pub fn task(&self) -> NodeTask {
        self.task
    }

    #[inline]
    pub fn is_eager(&self) -> bool {
        self.eager
    }

    #[inline]
    pub fn queue(&self) -> &Arc<ReadyQueue> {
        &self.queue
    }

    #[inline]
    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn barrier(&self) -> i32 {
        self.barrier.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.state() == NodeState::Completed
    }

    /// Hold the node back by `count` more releases
    pub fn add_barrier(
        &self,
        count: i32,
    ) {
        let previous = self.barrier.fetch_add(count, Ordering::AcqRel);
        debug_assert!(previous > 0, "barrier added to a node that already fired");
    }

    /// Make this node wait for `other`. Returns false, adding nothing, when
    /// `other` has already completed.
    pub fn depends_on(
        self: &Arc<Self>,
        other: &Arc<GraphNode>,
    ) -> bool {
        let mut dependents = other.dependents.lock();
        if dependents.closed {
            return false;
        }
        self.add_barrier(1);
        dependents.nodes.push(Arc::clone(self));
        true
    }

    /// Release one barrier; a node that becomes ready is handed to `ctx`
    pub fn release_barrier(
        self: &Arc<Self>,
        ctx: &mut ExecContext<'_>,
    ) {
        if self.release() {
            ctx.schedule(Arc::clone(self));
        }
    }

    /// Release one barrier from outside any execution context (I/O
    /// callbacks, setup); a ready node goes to its queue.
    pub fn release_barrier_detached(self: &Arc<Self>) {
        if self.release() {
            self.queue.push(Arc::clone(self));
        }
    }

    fn release(&self) -> bool {
        let previous = self.barrier.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "barrier released below zero");
        previous == 1
    }

    /// Waiting/TimedOut -> Executing. False if the node is not runnable.
    pub(crate) fn begin(&self) -> bool {
        [NodeState::Waiting, NodeState::TimedOut].iter().any(|from| {
            self.state
                .compare_exchange(
                    *from as u8,
                    NodeState::Executing as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        })
    }

    pub(crate) fn suspend(&self) {
        self.state
            .store(NodeState::TimedOut as u8, Ordering::Release);
    }

    /// Mark completed and release every dependent into `ctx`
    pub(crate) fn complete(
        &self,
        ctx: &mut ExecContext<'_>,
    ) {
        self.state
            .store(NodeState::Completed as u8, Ordering::Release);
        let nodes = {
            let mut dependents = self.dependents.lock();
            dependents.closed = true;
            std::mem::take(&mut dependents.nodes)
        };
        for node in nodes {
            node.release_barrier(ctx);
        }
    }

    /// Number of registered dependents (diagnostics)
    pub fn dependent_count(&self) -> usize {
        self.dependents.lock().nodes.len()
    }
}

impl fmt::Debug for GraphNode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("GraphNode")
            .field("task", &self.task)
            .field("barrier", &self.barrier())
            .field("state", &self.state())
            .field("eager", &self.eager)
            .finish()
    }
}
