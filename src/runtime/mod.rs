//! Runtime system
//!
//! This module contains the wait/notify primitive, the dependency graph
//! nodes, collector cooperation and the loader's scheduler.

pub mod dag;
pub mod gc;
pub mod scheduler;
pub mod zenaphore;
