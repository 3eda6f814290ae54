//! Prioritized, byte-budgeted package reads
//!
//! Reads wait in a heap ordered by priority (highest first), then load
//! order, then arrival. One is issued only while the bytes already in
//! flight plus its own size stay within the budget; a read larger than the
//! whole budget is issued alone once nothing else is in flight.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::package::unit::UnitSlot;
use crate::storage::ChunkId;

/// A read waiting for budget
#[derive(Debug, Clone)]
pub struct PendingRead {
    pub slot: UnitSlot,
    pub chunk: ChunkId,
    pub size: u64,
    pub priority: i32,
    pub load_order: u32,
    seq: u64,
}

impl PartialEq for PendingRead {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for PendingRead {}

impl PartialOrd for PendingRead {
    fn partial_cmp(
        &self,
        other: &Self,
    ) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingRead {
    fn cmp(
        &self,
        other: &Self,
    ) -> CmpOrdering {
        // Max-heap: greater pops first
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.load_order.cmp(&self.load_order))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct IoState {
    queue: BinaryHeap<PendingRead>,
    in_flight_bytes: u64,
    in_flight_reads: usize,
    peak_bytes: u64,
    next_seq: u64,
}

#[derive(Debug)]
pub struct IoDispatcher {
    budget: u64,
    state: Mutex<IoState>,
    pumping: AtomicBool,
    repump: AtomicBool,
}

impl IoDispatcher {
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            state: Mutex::new(IoState::default()),
            pumping: AtomicBool::new(false),
            repump: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn enqueue(
        &self,
        slot: UnitSlot,
        chunk: ChunkId,
        size: u64,
        priority: i32,
        load_order: u32,
    ) {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(PendingRead {
            slot,
            chunk,
            size,
            priority,
            load_order,
            seq,
        });
    }

    /// Pop the best read if the budget allows it, counting it as in flight
    pub fn next_issuable(&self) -> Option<PendingRead> {
        let mut state = self.state.lock();
        let size = state.queue.peek()?.size;
        let fits = state.in_flight_bytes == 0
            || state.in_flight_bytes.saturating_add(size) <= self.budget;
        if !fits {
            return None;
        }
        let read = state.queue.pop()?;
        state.in_flight_bytes += read.size;
        state.in_flight_reads += 1;
        state.peak_bytes = state.peak_bytes.max(state.in_flight_bytes);
        Some(read)
    }

    /// A read of `size` bytes finished
    pub fn complete(
        &self,
        size: u64,
    ) {
        let mut state = self.state.lock();
        debug_assert!(state.in_flight_bytes >= size);
        state.in_flight_bytes = state.in_flight_bytes.saturating_sub(size);
        state.in_flight_reads = state.in_flight_reads.saturating_sub(1);
    }

    /// Issue every read the budget allows.
    ///
    /// `issue` may complete reads inline, which calls back into `pump`; the
    /// nested call only flags another pass of the outer loop.
    pub fn pump<F>(
        &self,
        mut issue: F,
    ) where
        F: FnMut(PendingRead),
    {
        if self.pumping.swap(true, Ordering::AcqRel) {
            self.repump.store(true, Ordering::Release);
            return;
        }
        loop {
            self.repump.store(false, Ordering::Release);
            while let Some(read) = self.next_issuable() {
                trace!("issuing {} ({} bytes) for {}", read.chunk, read.size, read.slot);
                issue(read);
            }
            self.pumping.store(false, Ordering::Release);
            if !self.repump.load(Ordering::Acquire) || self.pumping.swap(true, Ordering::AcqRel) {
                break;
            }
        }
    }

    /// Change the priority of a queued read. False if it was already issued.
    pub fn reprioritize(
        &self,
        slot: UnitSlot,
        priority: i32,
    ) -> bool {
        let mut state = self.state.lock();
        if !state.queue.iter().any(|read| read.slot == slot) {
            return false;
        }
        let mut reads = std::mem::take(&mut state.queue).into_vec();
        for read in reads.iter_mut().filter(|read| read.slot == slot) {
            read.priority = priority;
        }
        state.queue = BinaryHeap::from(reads);
        true
    }

    /// Drop a queued read; `None` if it was not queued
    pub fn cancel(
        &self,
        slot: UnitSlot,
    ) -> Option<PendingRead> {
        let mut state = self.state.lock();
        let mut reads = std::mem::take(&mut state.queue).into_vec();
        let position = reads.iter().position(|read| read.slot == slot);
        let removed = position.map(|index| reads.swap_remove(index));
        state.queue = BinaryHeap::from(reads);
        removed
    }

    pub fn in_flight_bytes(&self) -> u64 {
        self.state.lock().in_flight_bytes
    }

    pub fn in_flight_reads(&self) -> usize {
        self.state.lock().in_flight_reads
    }

    /// Largest in-flight byte count ever observed
    pub fn peak_bytes(&self) -> u64 {
        self.state.lock().peak_bytes
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.queue.is_empty() && state.in_flight_reads == 0
    }
}
