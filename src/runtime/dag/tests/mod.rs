//! DAG 模块单元测试
//!
//! 测试节点屏障、依赖注册和工作列表执行

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::package::unit::UnitSlot;
use crate::runtime::dag::{
    ExecContext, GraphNode, NodeOutcome, NodePhase, NodeRunner, NodeState, NodeTask, ThreadKind,
};
use crate::runtime::scheduler::queue::{QueueKind, ReadyQueue};
use crate::runtime::zenaphore::Zenaphore;

fn queue(kind: QueueKind) -> Arc<ReadyQueue> {
    Arc::new(ReadyQueue::new(kind, 1024, Arc::new(Zenaphore::new())))
}

fn task(
    unit: u32,
    bundle: u32,
) -> NodeTask {
    NodeTask::new(UnitSlot(unit), NodePhase::ProcessBundle(bundle))
}

/// Records the order tasks ran in
#[derive(Default)]
struct Recorder {
    ran: Mutex<Vec<NodeTask>>,
}

impl NodeRunner for Recorder {
    fn run(
        &self,
        task: NodeTask,
        _ctx: &mut ExecContext<'_>,
    ) -> NodeOutcome {
        self.ran.lock().push(task);
        NodeOutcome::Complete
    }
}

fn drain(
    queue: &ReadyQueue,
    runner: &dyn NodeRunner,
) {
    while let Some(node) = queue.pop() {
        let mut ctx = ExecContext::new(ThreadKind::Worker, queue, None);
        ctx.run(node, runner);
    }
}

#[cfg(test)]
mod barrier_tests {
    use super::*;

    #[test]
    fn test_new_node_waits_for_schedule() {
        let node = GraphNode::new(task(0, 0), queue(QueueKind::Worker), true);
        assert_eq!(node.barrier(), 1);
        assert_eq!(node.state(), NodeState::Waiting);
    }

    #[test]
    fn test_detached_release_pushes_to_queue() {
        let q = queue(QueueKind::Worker);
        let node = GraphNode::new(task(0, 0), q.clone(), true);
        node.add_barrier(1);
        node.release_barrier_detached();
        assert!(q.is_empty());
        node.release_barrier_detached();
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_depends_on_completed_node_is_noop() {
        let q = queue(QueueKind::Worker);
        let first = GraphNode::new(task(0, 0), q.clone(), true);
        first.release_barrier_detached();
        drain(&q, &Recorder::default());
        assert!(first.is_completed());

        let second = GraphNode::new(task(0, 1), q.clone(), true);
        assert!(!second.depends_on(&first));
        assert_eq!(second.barrier(), 1);
    }

    #[test]
    fn test_dependents_fire_after_completion() {
        let q = queue(QueueKind::Worker);
        let recorder = Recorder::default();
        let a = GraphNode::new(task(0, 0), q.clone(), false);
        let b = GraphNode::new(task(0, 1), q.clone(), false);
        let c = GraphNode::new(task(0, 2), q.clone(), false);
        assert!(c.depends_on(&a));
        assert!(c.depends_on(&b));
        assert_eq!(a.dependent_count(), 1);

        c.release_barrier_detached();
        b.release_barrier_detached();
        a.release_barrier_detached();
        drain(&q, &recorder);

        let ran = recorder.ran.lock();
        assert_eq!(ran.len(), 3);
        assert_eq!(ran[2], task(0, 2));
        assert!(c.is_completed());
    }
}

#[cfg(test)]
mod execution_tests {
    use super::*;

    #[test]
    fn test_eager_dependents_run_inline_on_home_queue() {
        let q = queue(QueueKind::Worker);
        let recorder = Recorder::default();
        let a = GraphNode::new(task(0, 0), q.clone(), true);
        let b = GraphNode::new(task(0, 1), q.clone(), true);
        b.depends_on(&a);
        b.release_barrier_detached();
        a.release_barrier_detached();

        let node = q.pop().unwrap();
        let mut ctx = ExecContext::new(ThreadKind::Worker, &q, None);
        assert_eq!(ctx.run(node, &recorder), NodeOutcome::Complete);
        assert_eq!(ctx.executed(), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn test_foreign_queue_dependents_are_pushed() {
        let workers = queue(QueueKind::Worker);
        let consumer = queue(QueueKind::Consumer);
        let recorder = Recorder::default();
        let a = GraphNode::new(task(0, 0), workers.clone(), true);
        let deferred = GraphNode::new(
            NodeTask::new(UnitSlot(0), NodePhase::DeferredPostLoad(0)),
            consumer.clone(),
            true,
        );
        deferred.depends_on(&a);
        deferred.release_barrier_detached();
        a.release_barrier_detached();

        drain(&workers, &recorder);
        assert_eq!(recorder.ran.lock().len(), 1);
        assert_eq!(consumer.len(), 1);
        assert!(!deferred.is_completed());
    }

    #[test]
    fn test_long_chain_does_not_recurse() {
        const CHAIN: usize = 100_000;
        let q = queue(QueueKind::Worker);
        let count = AtomicUsize::new(0);

        struct Counter<'a>(&'a AtomicUsize);
        impl NodeRunner for Counter<'_> {
            fn run(
                &self,
                _task: NodeTask,
                _ctx: &mut ExecContext<'_>,
            ) -> NodeOutcome {
                self.0.fetch_add(1, Ordering::Relaxed);
                NodeOutcome::Complete
            }
        }

        let nodes: Vec<_> = (0..CHAIN)
            .map(|i| GraphNode::new(task(0, i as u32), q.clone(), true))
            .collect();
        for pair in nodes.windows(2) {
            pair[1].depends_on(&pair[0]);
        }
        for node in nodes.iter().rev() {
            node.release_barrier_detached();
        }

        drain(&q, &Counter(&count));
        assert_eq!(count.load(Ordering::Relaxed), CHAIN);
        assert!(nodes.iter().all(|node| node.is_completed()));
    }

    #[test]
    fn test_yield_and_resume() {
        struct YieldOnce {
            yielded: AtomicUsize,
        }
        impl NodeRunner for YieldOnce {
            fn run(
                &self,
                _task: NodeTask,
                ctx: &mut ExecContext<'_>,
            ) -> NodeOutcome {
                if ctx.should_yield() && self.yielded.fetch_add(1, Ordering::SeqCst) == 0 {
                    return NodeOutcome::Yielded;
                }
                NodeOutcome::Complete
            }
        }

        let q = queue(QueueKind::Consumer);
        let runner = YieldOnce {
            yielded: AtomicUsize::new(0),
        };
        let node = GraphNode::new(task(0, 0), q.clone(), true);
        node.release_barrier_detached();

        let expired = Instant::now() - Duration::from_millis(1);
        let mut ctx = ExecContext::new(ThreadKind::Consumer, &q, Some(expired));
        let popped = q.pop().unwrap();
        assert_eq!(ctx.run(popped, &runner), NodeOutcome::Yielded);
        assert_eq!(node.state(), NodeState::TimedOut);

        let resumed = ctx.take_yielded().unwrap();
        assert_eq!(ctx.run(resumed, &runner), NodeOutcome::Complete);
        assert!(node.is_completed());
    }

    #[test]
    fn test_concurrent_depends_on_and_complete() {
        use std::thread;

        for _ in 0..50 {
            let q = queue(QueueKind::Worker);
            let target = GraphNode::new(task(1, 0), q.clone(), false);
            let others: Vec<_> = (0..8)
                .map(|i| GraphNode::new(task(2, i), q.clone(), false))
                .collect();

            let registrar = {
                let target = target.clone();
                let others = others.clone();
                thread::spawn(move || {
                    for node in &others {
                        node.depends_on(&target);
                    }
                })
            };
            target.release_barrier_detached();
            drain(&q, &Recorder::default());
            registrar.join().unwrap();

            // Registered before completion: raised then released by it.
            // Registered after: never raised.
            assert!(target.is_completed());
            assert!(others.iter().all(|node| node.barrier() == 1));
        }
    }
}
