//! Ready-work queue
//!
//! Bounded multi-producer, multi-consumer FIFO of graph nodes whose
//! barriers reached zero. Every push wakes one sleeper on the queue's
//! zenaphore.

use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

use crate::runtime::dag::GraphNode;
use crate::runtime::zenaphore::Zenaphore;

/// Which thread class drains a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Worker,
    Consumer,
}

/// A thread-safe, fixed-capacity queue of ready nodes.
///
/// Capacity is a contract: the scheduler sizes it to the largest number of
/// nodes that can be ready at once. Overflow is a bug and panics.
#[derive(Debug)]
pub struct ReadyQueue {
    kind: QueueKind,
    nodes: ArrayQueue<Arc<GraphNode>>,
    zenaphore: Arc<Zenaphore>,
}

impl ReadyQueue {
    pub fn new(
        kind: QueueKind,
        capacity: usize,
        zenaphore: Arc<Zenaphore>,
    ) -> Self {
        Self {
            kind,
            nodes: ArrayQueue::new(capacity.max(1)),
            zenaphore,
        }
    }

    #[inline]
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Push a ready node and wake one waiter.
    pub fn push(
        &self,
        node: Arc<GraphNode>,
    ) {
        if self.nodes.push(node).is_err() {
            panic!(
                "{:?} ready queue overflow (capacity {})",
                self.kind,
                self.nodes.capacity()
            );
        }
        self.zenaphore.notify_one();
    }

    #[inline]
    pub fn pop(&self) -> Option<Arc<GraphNode>> {
        self.nodes.pop()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.nodes.capacity()
    }

    #[inline]
    pub fn zenaphore(&self) -> &Arc<Zenaphore> {
        &self.zenaphore
    }
}
