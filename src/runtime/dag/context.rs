//! Explicit per-thread execution context
//!
//! Nodes never run recursively. [`ExecContext::run`] keeps a work list:
//! completing a node collects its ready dependents, and eager ones bound
//! to this thread's queue run next in the same loop while the rest are
//! pushed to their own queues.

use std::sync::Arc;
use std::time::Instant;

use super::node::{GraphNode, NodeTask};
use crate::runtime::scheduler::queue::ReadyQueue;

/// Which kind of thread is executing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    Worker,
    /// The single thread that ticks the loader
    Consumer,
}

/// Result of running one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    Complete,
    /// Stopped at an iteration boundary; run it again later
    Yielded,
}

/// Executes node tasks
pub trait NodeRunner {
    fn run(
        &self,
        task: NodeTask,
        ctx: &mut ExecContext<'_>,
    ) -> NodeOutcome;
}

pub struct ExecContext<'q> {
    thread: ThreadKind,
    home: &'q ReadyQueue,
    deadline: Option<Instant>,
    ready: Vec<Arc<GraphNode>>,
    yielded: Option<Arc<GraphNode>>,
    executed: usize,
}

impl<'q> ExecContext<'q> {
    pub fn new(
        thread: ThreadKind,
        home: &'q ReadyQueue,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            thread,
            home,
            deadline,
            ready: Vec::new(),
            yielded: None,
            executed: 0,
        }
    }

    #[inline]
    pub fn thread(&self) -> ThreadKind {
        self.thread
    }

    #[inline]
    pub fn is_consumer(&self) -> bool {
        self.thread == ThreadKind::Consumer
    }

    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once a time-limited context ran out of time
    pub fn should_yield(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Nodes run to completion by this context
    #[inline]
    pub fn executed(&self) -> usize {
        self.executed
    }

    /// The node that yielded, if the last `run` stopped early
    pub fn take_yielded(&mut self) -> Option<Arc<GraphNode>> {
        self.yielded.take()
    }

    pub(crate) fn schedule(
        &mut self,
        node: Arc<GraphNode>,
    ) {
        self.ready.push(node);
    }

    /// Run `node`, then every eager dependent it makes ready on this
    /// thread's queue. Returns the outcome of the last node run.
    pub fn run(
        &mut self,
        node: Arc<GraphNode>,
        runner: &dyn NodeRunner,
    ) -> NodeOutcome {
        let mut work = vec![node];
        while let Some(node) = work.pop() {
            if !node.begin() {
                continue;
            }
            match runner.run(node.task(), self) {
                NodeOutcome::Complete => {
                    self.executed += 1;
                    node.complete(self);
                }
                NodeOutcome::Yielded => {
                    node.suspend();
                    self.yielded = Some(node);
                    self.dispatch(&mut work, false);
                    for pending in work.drain(..) {
                        let queue = Arc::clone(pending.queue());
                        queue.push(pending);
                    }
                    return NodeOutcome::Yielded;
                }
            }
            let inline = !self.should_yield();
            self.dispatch(&mut work, inline);
        }
        NodeOutcome::Complete
    }

    fn dispatch(
        &mut self,
        work: &mut Vec<Arc<GraphNode>>,
        inline: bool,
    ) {
        // Reverse keeps release order when popping off the work list
        for node in self.ready.drain(..).rev() {
            if inline && node.is_eager() && std::ptr::eq(node.queue().as_ref(), self.home) {
                work.push(node);
            } else {
                let queue = Arc::clone(node.queue());
                queue.push(node);
            }
        }
    }
}
