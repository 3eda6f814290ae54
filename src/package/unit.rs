//! Per-request package state (LoadUnit)
//!
//! One unit exists per in-flight package load. It owns the read buffer,
//! the export table and the unit's graph nodes. Phases only move forward.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use tracing::trace;

use crate::object::ObjectHandle;
use crate::runtime::dag::{GraphNode, NodePhase, NodeTask};
use crate::runtime::scheduler::queue::ReadyQueue;

use super::archive::{ExternalRead, ObjectResolver};
use super::error::LoadError;
use super::header::{ExportMapEntry, PackageHeader};
use super::registry::Registry;
use super::store::StoreEntry;
use super::{CompletionCallback, ObjectIndex, ObjectIndexKind, PackageId, RequestId};

/// Index of a unit in the scheduler's unit arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitSlot(pub u32);

impl fmt::Display for UnitSlot {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "unit#{}", self.0)
    }
}

/// Lifecycle of a unit, strictly forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LoadPhase {
    New = 0,
    ImportsQueued,
    ImportsReady,
    WaitingForIo,
    ParsingHeader,
    ExecutingBundles,
    WaitingForExternalReads,
    ExportsFinalized,
    PostLoad,
    DeferredPostLoad,
    Finalizing,
    CreatingClusters,
    Complete,
    PendingDestruction,
}

impl LoadPhase {
    const ALL: [LoadPhase; 14] = [
        LoadPhase::New,
        LoadPhase::ImportsQueued,
        LoadPhase::ImportsReady,
        LoadPhase::WaitingForIo,
        LoadPhase::ParsingHeader,
        LoadPhase::ExecutingBundles,
        LoadPhase::WaitingForExternalReads,
        LoadPhase::ExportsFinalized,
        LoadPhase::PostLoad,
        LoadPhase::DeferredPostLoad,
        LoadPhase::Finalizing,
        LoadPhase::CreatingClusters,
        LoadPhase::Complete,
        LoadPhase::PendingDestruction,
    ];

    fn from_u8(value: u8) -> Self {
        Self::ALL
            .get(value as usize)
            .copied()
            .unwrap_or(LoadPhase::PendingDestruction)
    }
}

/// Dedup key: disk identity plus optional logical name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnitKey {
    pub disk_id: PackageId,
    pub custom_name: Option<String>,
}

/// One export being produced
#[derive(Debug, Clone)]
pub struct ExportRecord {
    pub entry: ExportMapEntry,
    pub object: Option<ObjectHandle>,
    /// Excluded on this runtime target; never created
    pub filtered: bool,
    pub failed: bool,
    pub created: bool,
    pub serialized: bool,
    pub post_loaded: bool,
    /// Reused an object that already lived at the export's path
    pub from_existing: bool,
    pub error: Option<LoadError>,
    pinned: bool,
}

impl ExportRecord {
    pub fn new(
        entry: ExportMapEntry,
        filtered: bool,
    ) -> Self {
        Self {
            entry,
            object: None,
            filtered,
            failed: false,
            created: false,
            serialized: false,
            post_loaded: false,
            from_existing: false,
            error: None,
            pinned: false,
        }
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub(crate) fn set_pinned(
        &mut self,
        pinned: bool,
    ) {
        self.pinned = pinned;
    }
}

/// An entry in a unit's import list
#[derive(Debug, Clone)]
pub struct ImportedPackage {
    pub id: PackageId,
    /// In-flight unit for the import; `None` if it was already loaded or missing
    pub unit: Option<Arc<LoadUnit>>,
    /// Holds a loaded ref in the registry, released at finalization
    pub acquired: bool,
    /// Bundle edges are wired; false for imports that close a cycle
    pub ordered: bool,
}

/// A callback waiting on this unit
pub struct PendingCallback {
    pub request_id: RequestId,
    pub logical_name: String,
    pub priority: i32,
    pub callback: Option<CompletionCallback>,
}

impl fmt::Debug for PendingCallback {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("PendingCallback")
            .field("request_id", &self.request_id)
            .field("logical_name", &self.logical_name)
            .field("priority", &self.priority)
            .finish()
    }
}

/// The unit's graph nodes
#[derive(Debug)]
pub struct UnitNodes {
    pub summary: Arc<GraphNode>,
    pub process: SmallVec<[Arc<GraphNode>; 2]>,
    pub exports_done: Arc<GraphNode>,
    pub post_load: SmallVec<[Arc<GraphNode>; 2]>,
    pub deferred_post_load: SmallVec<[Arc<GraphNode>; 2]>,
}

impl UnitNodes {
    /// Build and wire one unit's nodes.
    ///
    /// Bundles run in order; post-load waits for the whole export table;
    /// deferred post-load of a bundle waits for its thread-safe post-load.
    /// Every initial barrier but the summary's is released here; the
    /// summary's is released when the package data arrives.
    pub fn new(
        slot: UnitSlot,
        bundle_count: u32,
        workers: &Arc<ReadyQueue>,
        consumer: &Arc<ReadyQueue>,
    ) -> Self {
        let count = bundle_count.max(1);
        let node = |phase, queue: &Arc<ReadyQueue>, eager| {
            GraphNode::new(NodeTask::new(slot, phase), Arc::clone(queue), eager)
        };

        let summary = node(NodePhase::ProcessSummary, workers, false);
        let process: SmallVec<[Arc<GraphNode>; 2]> = (0..count)
            .map(|i| node(NodePhase::ProcessBundle(i), workers, true))
            .collect();
        let exports_done = node(NodePhase::ExportsDone, workers, true);
        let post_load: SmallVec<[Arc<GraphNode>; 2]> = (0..count)
            .map(|i| node(NodePhase::PostLoad(i), workers, true))
            .collect();
        let deferred_post_load: SmallVec<[Arc<GraphNode>; 2]> = (0..count)
            .map(|i| node(NodePhase::DeferredPostLoad(i), consumer, true))
            .collect();

        for i in 0..count as usize {
            let previous = if i == 0 { &summary } else { &process[i - 1] };
            process[i].depends_on(previous);
        }
        exports_done.depends_on(&process[count as usize - 1]);
        for i in 0..count as usize {
            post_load[i].depends_on(&exports_done);
            deferred_post_load[i].depends_on(&post_load[i]);
            if i > 0 {
                post_load[i].depends_on(&post_load[i - 1]);
                deferred_post_load[i].depends_on(&deferred_post_load[i - 1]);
            }
        }

        let nodes = Self {
            summary,
            process,
            exports_done,
            post_load,
            deferred_post_load,
        };
        for node in nodes.all().filter(|node| !Arc::ptr_eq(node, &nodes.summary)) {
            node.release_barrier_detached();
        }
        nodes
    }

    #[inline]
    pub fn bundle_node_count(&self) -> u32 {
        self.process.len() as u32
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<GraphNode>> {
        std::iter::once(&self.summary)
            .chain(self.process.iter())
            .chain(std::iter::once(&self.exports_done))
            .chain(self.post_load.iter())
            .chain(self.deferred_post_load.iter())
    }

    /// Bundles node `index` is responsible for; the last node takes any
    /// bundles beyond the node count
    pub fn bundle_range(
        &self,
        index: u32,
        bundle_count: u32,
    ) -> std::ops::Range<u32> {
        let last = self.bundle_node_count() - 1;
        if index >= last {
            index.min(bundle_count)..bundle_count
        } else {
            index.min(bundle_count)..(index + 1).min(bundle_count)
        }
    }
}

/// Mutable unit state, owned by whichever node currently runs
#[derive(Default)]
pub struct UnitState {
    pub header: Option<Arc<PackageHeader>>,
    pub buffer: Option<Arc<[u8]>>,
    pub exports: Vec<ExportRecord>,
    pub root: Option<ObjectHandle>,
    pub root_pinned: bool,
    pub root_from_existing: bool,
    /// Next (bundle, entry) to execute
    pub bundle_cursor: (u32, u32),
    pub external_reads: Vec<ExternalRead>,
    pub error: Option<LoadError>,
    pub imports: Vec<ImportedPackage>,
    /// Imports kept after finalization, for the cluster check
    pub finalized_imports: Vec<Weak<LoadUnit>>,
    pub callbacks: Vec<PendingCallback>,
}

impl fmt::Debug for UnitState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("UnitState")
            .field("has_header", &self.header.is_some())
            .field("buffer_len", &self.buffer.as_ref().map(|b| b.len()))
            .field("exports", &self.exports.len())
            .field("bundle_cursor", &self.bundle_cursor)
            .field("external_reads", &self.external_reads.len())
            .field("error", &self.error)
            .field("imports", &self.imports.len())
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

/// The state of one package load
pub struct LoadUnit {
    slot: UnitSlot,
    key: UnitKey,
    package_name: String,
    entry: Arc<StoreEntry>,
    nodes: UnitNodes,
    ref_count: AtomicU32,
    phase: AtomicU8,
    priority: AtomicI32,
    /// Highest priority passed down from importers
    inherited: AtomicI32,
    failed: AtomicBool,
    canceled: AtomicBool,
    state: Mutex<UnitState>,
}

impl LoadUnit {
    /// Create a unit holding the scheduler's reference
    pub fn new(
        slot: UnitSlot,
        key: UnitKey,
        package_name: String,
        entry: Arc<StoreEntry>,
        priority: i32,
        workers: &Arc<ReadyQueue>,
        consumer: &Arc<ReadyQueue>,
    ) -> Self {
        let nodes = UnitNodes::new(slot, entry.export_bundle_count, workers, consumer);
        Self {
            slot,
            key,
            package_name,
            entry,
            nodes,
            ref_count: AtomicU32::new(1),
            phase: AtomicU8::new(LoadPhase::New as u8),
            priority: AtomicI32::new(priority),
            inherited: AtomicI32::new(i32::MIN),
            failed: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            state: Mutex::new(UnitState::default()),
        }
    }

    #[inline]
    pub fn slot(&self) -> UnitSlot {
        self.slot
    }

    #[inline]
    pub fn key(&self) -> &UnitKey {
        &self.key
    }

    #[inline]
    pub fn disk_id(&self) -> PackageId {
        self.key.disk_id
    }

    /// Id the finished graph is recorded under in the registry
    pub fn loaded_id(&self) -> PackageId {
        match &self.key.custom_name {
            Some(name) => PackageId::from_name(name),
            None => self.key.disk_id,
        }
    }

    /// Path of the package root object
    pub fn root_name(&self) -> &str {
        self.key.custom_name.as_deref().unwrap_or(&self.package_name)
    }

    #[inline]
    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    #[inline]
    pub fn entry(&self) -> &Arc<StoreEntry> {
        &self.entry
    }

    #[inline]
    pub fn nodes(&self) -> &UnitNodes {
        &self.nodes
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, UnitState> {
        self.state.lock()
    }

    // ---- phase ----

    #[inline]
    pub fn phase(&self) -> LoadPhase {
        LoadPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Advance to `phase`; moving backwards is ignored
    pub fn advance(
        &self,
        phase: LoadPhase,
    ) {
        let previous = self.phase.fetch_max(phase as u8, Ordering::AcqRel);
        if previous < phase as u8 {
            trace!(
                "{} {} {:?} -> {:?}",
                self.slot,
                self.package_name,
                LoadPhase::from_u8(previous),
                phase
            );
        }
    }

    // ---- references ----

    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn add_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference; returns the remaining count
    pub fn release_ref(&self) -> u32 {
        let previous = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "unit reference released below zero");
        previous - 1
    }

    // ---- priority ----

    #[inline]
    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Acquire)
    }

    /// Raise to at least `priority`; returns the new priority
    pub fn raise_priority(
        &self,
        priority: i32,
    ) -> i32 {
        self.priority.fetch_max(priority, Ordering::AcqRel).max(priority)
    }

    /// Raise on behalf of an importer. Returns whether the priority went up.
    pub fn inherit_priority(
        &self,
        priority: i32,
    ) -> bool {
        self.inherited.fetch_max(priority, Ordering::AcqRel);
        self.priority.fetch_max(priority, Ordering::AcqRel) < priority
    }

    /// Recompute the priority from the attached callbacks and importers
    pub fn refresh_priority(
        &self,
        state: &UnitState,
    ) -> i32 {
        let wanted = state
            .callbacks
            .iter()
            .map(|callback| callback.priority)
            .fold(self.inherited.load(Ordering::Acquire), i32::max);
        self.priority.store(wanted, Ordering::Release);
        wanted
    }

    // ---- failure ----

    #[inline]
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Fail the unit; the first recorded error wins
    pub fn fail(
        &self,
        state: &mut UnitState,
        error: LoadError,
    ) {
        self.failed.store(true, Ordering::Release);
        if state.error.is_none() {
            state.error = Some(error);
        }
    }

    /// Cancel unless finalization already started. Finalization advances
    /// the phase under the state lock, so the two never interleave.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        if self.phase() >= LoadPhase::Finalizing {
            return false;
        }
        self.canceled.store(true, Ordering::Release);
        self.fail(
            &mut state,
            LoadError::Canceled {
                package: self.key.disk_id,
            },
        );
        true
    }
}

impl fmt::Debug for LoadUnit {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("LoadUnit")
            .field("slot", &self.slot)
            .field("package", &self.package_name)
            .field("key", &self.key)
            .field("phase", &self.phase())
            .field("ref_count", &self.ref_count())
            .field("priority", &self.priority())
            .field("failed", &self.has_failed())
            .finish()
    }
}

/// Resolves references inside one unit's export payloads: local exports
/// through the export table, everything else through the registry
pub struct UnitResolver<'a> {
    pub exports: &'a [ExportRecord],
    pub registry: &'a Registry,
}

impl ObjectResolver for UnitResolver<'_> {
    fn resolve(
        &self,
        index: ObjectIndex,
    ) -> Option<ObjectHandle> {
        match index.kind() {
            ObjectIndexKind::Export => index
                .as_export()
                .and_then(|i| self.exports.get(i as usize))
                .and_then(|record| record.object.clone()),
            ObjectIndexKind::ScriptImport | ObjectIndexKind::PackageImport => {
                self.registry.resolve_import(index)
            }
            ObjectIndexKind::Null => None,
        }
    }
}
