//! Dependency graph for package loading
//!
//! - [`GraphNode`](node::GraphNode) - barrier-gated unit of work
//! - [`NodeTask`](node::NodeTask) / [`NodePhase`](node::NodePhase) - what a node does
//! - [`ExecContext`](context::ExecContext) - per-thread work-list executor
//! - [`NodeRunner`](context::NodeRunner) - performs a node's task

pub mod context;
pub mod node;

pub use context::{ExecContext, NodeOutcome, NodeRunner, ThreadKind};
pub use node::{GraphNode, NodePhase, NodeState, NodeTask};

#[cfg(test)]
mod tests;
