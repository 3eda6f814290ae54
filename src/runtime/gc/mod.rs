//! Garbage collector collaboration
//!
//! The loader does not collect anything itself. It pins objects while they
//! are being loaded, asks whether a collection wants to run, and receives
//! sweep notifications through `AsyncLoader::notify_unreachable`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::object::{ObjectFlags, ObjectHandle, ObjectId, ObjectTable};

/// What the loader needs from a tracing collector
pub trait GarbageCollector: Send + Sync {
    /// Keep `object` alive until the matching `unpin`
    fn pin(
        &self,
        object: &ObjectHandle,
    );

    fn unpin(
        &self,
        object: &ObjectHandle,
    );

    /// A collection is waiting for loader threads to reach a safe point
    fn is_collection_requested(&self) -> bool;

    /// Group a finished package graph; optional
    fn create_cluster(
        &self,
        root: &ObjectHandle,
    ) {
        let _ = root;
    }
}

/// Collector that never runs; pins are ignored
#[derive(Debug, Default)]
pub struct NoCollector;

impl GarbageCollector for NoCollector {
    fn pin(
        &self,
        _object: &ObjectHandle,
    ) {
    }

    fn unpin(
        &self,
        _object: &ObjectHandle,
    ) {
    }

    fn is_collection_requested(&self) -> bool {
        false
    }
}

/// GC state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GCState {
    Idle,
    Requested,
    Sweeping,
}

/// Collector that tracks pin counts and clusters.
///
/// It does no marking: anything unpinned whose package root is unpinned is
/// considered unreachable by [`TrackingCollector::unreachable_objects`].
#[derive(Debug)]
pub struct TrackingCollector {
    pins: Mutex<HashMap<ObjectId, u32>>,
    clusters: Mutex<Vec<ObjectId>>,
    requested: AtomicBool,
    state: Mutex<GCState>,
}

impl Default for TrackingCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackingCollector {
    pub fn new() -> Self {
        Self {
            pins: Mutex::new(HashMap::new()),
            clusters: Mutex::new(Vec::new()),
            requested: AtomicBool::new(false),
            state: Mutex::new(GCState::Idle),
        }
    }

    pub fn pin_count(
        &self,
        object: &ObjectHandle,
    ) -> u32 {
        self.pins.lock().get(&object.id()).copied().unwrap_or(0)
    }

    #[inline]
    pub fn is_pinned(
        &self,
        object: &ObjectHandle,
    ) -> bool {
        self.pin_count(object) > 0
    }

    /// Total outstanding pins across all objects
    pub fn total_pins(&self) -> u32 {
        self.pins.lock().values().sum()
    }

    pub fn clusters(&self) -> Vec<ObjectId> {
        self.clusters.lock().clone()
    }

    pub fn state(&self) -> GCState {
        *self.state.lock()
    }

    /// Ask loader threads to park at their next safe point
    pub fn request_collection(&self) {
        *self.state.lock() = GCState::Requested;
        self.requested.store(true, Ordering::Release);
    }

    /// Mark the sweep as running; loader ticks keep yielding until `finish`
    pub fn begin_sweep(&self) {
        *self.state.lock() = GCState::Sweeping;
    }

    pub fn finish_collection(&self) {
        self.requested.store(false, Ordering::Release);
        *self.state.lock() = GCState::Idle;
    }

    /// Objects in `table` that nothing keeps alive
    pub fn unreachable_objects(
        &self,
        table: &ObjectTable,
    ) -> Vec<ObjectHandle> {
        let pins = self.pins.lock();
        let pinned = |object: &ObjectHandle| pins.get(&object.id()).is_some_and(|count| *count > 0);
        table
            .objects()
            .into_iter()
            .filter(|object| !object.has_any_flags(ObjectFlags::NATIVE))
            .filter(|object| !pinned(object))
            .filter(|object| object.package_root().map_or(true, |root| !pinned(root)))
            .collect()
    }
}

impl GarbageCollector for TrackingCollector {
    fn pin(
        &self,
        object: &ObjectHandle,
    ) {
        *self.pins.lock().entry(object.id()).or_insert(0) += 1;
    }

    fn unpin(
        &self,
        object: &ObjectHandle,
    ) {
        let mut pins = self.pins.lock();
        match pins.get_mut(&object.id()) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                pins.remove(&object.id());
            }
            None => debug!("unpin of {} without a pin", object.path()),
        }
    }

    fn is_collection_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    fn create_cluster(
        &self,
        root: &ObjectHandle,
    ) {
        self.clusters.lock().push(root.id());
    }
}

#[cfg(test)]
mod tests;
