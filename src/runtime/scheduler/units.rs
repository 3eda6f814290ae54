//! Unit lifecycle on the consuming thread: intake, tree creation,
//! finalization, completion and deletion

use std::mem;
use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

use super::{ConsumerState, LoaderShared, PendingCompletion};
use crate::object::{ObjectFlags, ObjectHandle};
use crate::package::error::LoadError;
use crate::package::registry::LoadedFlags;
use crate::package::store::StoreEntry;
use crate::package::unit::{ImportedPackage, LoadPhase, LoadUnit, PendingCallback, UnitKey, UnitSlot};
use crate::package::{LoadCompletion, LoadRequestDescriptor, LoadResult, PackageId};
use crate::storage::{ChunkId, StorageError, StorageResult};

/// Depth-first frame while creating a unit tree
struct Frame {
    unit: Arc<LoadUnit>,
    imports: Vec<PackageId>,
    next: usize,
}

impl Frame {
    fn new(unit: Arc<LoadUnit>) -> Self {
        let imports = unit.entry().imported_packages.clone();
        Self {
            unit,
            imports,
            next: 0,
        }
    }
}

impl LoaderShared {
    pub(crate) fn unit(
        &self,
        slot: UnitSlot,
    ) -> Option<Arc<LoadUnit>> {
        self.units.read().get(slot.0 as usize).cloned()
    }

    /// Unit for `key` that can still take callbacks
    pub(crate) fn find_in_flight(
        &self,
        key: &UnitKey,
    ) -> Option<Arc<LoadUnit>> {
        self.active
            .lock()
            .get(key)
            .filter(|unit| unit.phase() < LoadPhase::Complete && !unit.is_canceled())
            .cloned()
    }

    // ---- intake ----

    pub(crate) fn process_requests(
        &self,
        out: &mut Vec<PendingCompletion>,
    ) {
        while let Some(request) = self.requests.pop() {
            self.process_request(request, out);
        }
    }

    fn process_request(
        &self,
        mut request: LoadRequestDescriptor,
        out: &mut Vec<PendingCompletion>,
    ) {
        let id = request.request_id;
        {
            let mut overrides = self.overrides.lock();
            if overrides.canceled.remove(&id) {
                debug!("request {} canceled before intake", id);
                self.stats.record_cancel();
                out.push(PendingCompletion::immediate(
                    request,
                    LoadResult::Canceled,
                    None,
                ));
                return;
            }
            if let Some(priority) = overrides.priorities.remove(&id) {
                request.priority = priority;
            }
        }

        let disk_id = self.registry.resolve_redirect(request.package_id);
        if disk_id != request.package_id {
            debug!("{} redirected to {}", request.package_name, disk_id);
            request.redirect = Some(disk_id);
        }
        let key = UnitKey {
            disk_id,
            custom_name: request.custom_name.clone(),
        };

        if let Some(unit) = self.find_in_flight(&key) {
            trace!("request {} joins {} in flight", id, unit.package_name());
            self.raise_priority(&unit, request.priority);
            self.attach(&unit, request);
            return;
        }

        if request.custom_name.is_none() {
            if let Some(root) = self.registry.loaded_root(disk_id) {
                trace!("{} is already loaded", request.package_name);
                self.stats.record_success();
                out.push(PendingCompletion::immediate(request, LoadResult::Success, Some(root)));
                return;
            }
        }

        let entry = match self.registry.find_store_entry(disk_id) {
            Some(entry) => entry,
            None => {
                let error = LoadError::Missing {
                    name: request.package_name.clone(),
                };
                warn!("{}", error);
                self.stats.record_failure();
                let mut completion = PendingCompletion::immediate(request, LoadResult::Failed, None);
                completion.completion.error = Some(error);
                out.push(completion);
                return;
            }
        };

        let unit = self.create_unit_tree(key, entry, &request);
        self.attach(&unit, request);
    }

    fn attach(
        &self,
        unit: &Arc<LoadUnit>,
        request: LoadRequestDescriptor,
    ) {
        let request_id = request.request_id;
        self.request_units.lock().insert(request_id, unit.clone());
        unit.lock().callbacks.push(PendingCallback {
            request_id,
            logical_name: request.logical_name().to_string(),
            priority: request.priority,
            callback: request.callback,
        });

        // cancel() may have missed the request while it was being taken in
        if self.overrides.lock().canceled.remove(&request_id) && !self.cancel_unit(unit) {
            debug!("request {} canceled too late, {} is finalizing", request_id, unit.package_name());
        }
    }

    fn raise_priority(
        &self,
        unit: &LoadUnit,
        priority: i32,
    ) {
        let raised = unit.raise_priority(priority);
        self.io.reprioritize(unit.slot(), raised);
        self.pass_priority_to_imports(unit, raised);
    }

    /// Raise every in-flight import below `unit` to at least `priority`.
    ///
    /// Walks with an explicit stack and stops at units that are already high
    /// enough, which also ends the walk on import cycles.
    pub(crate) fn pass_priority_to_imports(
        &self,
        unit: &LoadUnit,
        priority: i32,
    ) {
        let imported = |unit: &LoadUnit| -> Vec<Arc<LoadUnit>> {
            unit.lock()
                .imports
                .iter()
                .filter_map(|import| import.unit.clone())
                .collect()
        };
        let mut stack = imported(unit);
        while let Some(import) = stack.pop() {
            if !import.inherit_priority(priority) {
                continue;
            }
            trace!("{} raised to {} by an importer", import.package_name(), priority);
            self.io.reprioritize(import.slot(), priority);
            stack.extend(imported(&import));
        }
    }

    /// Fail a unit as canceled and unblock it if its read never went out.
    /// False once the unit is finalizing.
    pub(crate) fn cancel_unit(
        &self,
        unit: &LoadUnit,
    ) -> bool {
        if !unit.cancel() {
            return false;
        }
        if self.io.cancel(unit.slot()).is_some() {
            debug!("dropped queued read of {}", unit.package_name());
            unit.nodes().summary.release_barrier_detached();
        }
        true
    }

    fn create_unit(
        &self,
        key: UnitKey,
        package_name: String,
        entry: Arc<StoreEntry>,
        priority: i32,
    ) -> Arc<LoadUnit> {
        let unit = {
            let mut units = self.units.write();
            let vacant = units.vacant_entry();
            let slot = UnitSlot(vacant.key() as u32);
            let unit = Arc::new(LoadUnit::new(
                slot,
                key.clone(),
                package_name,
                entry,
                priority,
                &self.worker_queue,
                &self.consumer_queue,
            ));
            vacant.insert(unit.clone());
            unit
        };
        self.active.lock().insert(key, unit.clone());
        self.stats.record_unit();
        unit.advance(LoadPhase::ImportsQueued);
        debug!("created {} for {}", unit.slot(), unit.package_name());
        unit
    }

    /// Create the requested unit and every import not loaded or in flight.
    ///
    /// Depth-first over an explicit stack; a unit's read is queued once all
    /// of its imports have units, so imports are read first at equal
    /// priority. An import already on the stack closes a cycle and gets no
    /// bundle ordering.
    fn create_unit_tree(
        &self,
        key: UnitKey,
        entry: Arc<StoreEntry>,
        request: &LoadRequestDescriptor,
    ) -> Arc<LoadUnit> {
        let name = self
            .registry
            .package_name(key.disk_id)
            .unwrap_or_else(|| request.package_name.clone());
        let root = self.create_unit(key, name, entry, request.priority);
        let mut stack = vec![Frame::new(root.clone())];

        loop {
            let (importer, next) = match stack.last_mut() {
                Some(frame) => {
                    let next = frame.imports.get(frame.next).copied();
                    frame.next += 1;
                    (frame.unit.clone(), next)
                }
                None => break,
            };
            let import = match next {
                Some(import) => import,
                None => {
                    stack.pop();
                    importer.advance(LoadPhase::ImportsReady);
                    self.queue_read(&importer);
                    continue;
                }
            };

            let id = self.registry.resolve_redirect(import);
            let import_key = UnitKey {
                disk_id: id,
                custom_name: None,
            };
            let cyclic = stack.iter().any(|frame| frame.unit.key() == &import_key);

            let imported = if let Some(unit) = self.find_in_flight(&import_key) {
                unit.add_ref();
                if unit.inherit_priority(importer.priority()) {
                    self.io.reprioritize(unit.slot(), importer.priority());
                    self.pass_priority_to_imports(&unit, importer.priority());
                }
                self.registry.acquire_loaded_ref(id);
                ImportedPackage {
                    id,
                    unit: Some(unit),
                    acquired: true,
                    ordered: !cyclic,
                }
            } else if self.registry.loaded_root(id).is_some() {
                self.registry.acquire_loaded_ref(id);
                ImportedPackage {
                    id,
                    unit: None,
                    acquired: true,
                    ordered: false,
                }
            } else if let Some(entry) = self.registry.find_store_entry(id) {
                let name = self
                    .registry
                    .package_name(id)
                    .unwrap_or_else(|| id.to_string());
                let unit = self.create_unit(import_key, name, entry, importer.priority());
                unit.inherit_priority(importer.priority());
                unit.add_ref();
                self.registry.acquire_loaded_ref(id);
                stack.push(Frame::new(unit.clone()));
                ImportedPackage {
                    id,
                    unit: Some(unit),
                    acquired: true,
                    ordered: true,
                }
            } else {
                warn!(
                    "{} imports {}, which is not mounted",
                    importer.package_name(),
                    id
                );
                ImportedPackage {
                    id,
                    unit: None,
                    acquired: false,
                    ordered: false,
                }
            };
            importer.lock().imports.push(imported);
        }

        root
    }

    fn queue_read(
        &self,
        unit: &LoadUnit,
    ) {
        let entry = unit.entry();
        let chunk = ChunkId::export_bundle_data(entry.container, unit.disk_id());
        self.io.enqueue(
            unit.slot(),
            chunk,
            entry.export_bundles_size,
            unit.priority(),
            entry.load_order,
        );
        unit.advance(LoadPhase::WaitingForIo);
    }

    // ---- I/O ----

    /// Issue every read the byte budget allows
    pub(crate) fn pump_io(self: &Arc<Self>) {
        let shared = Arc::downgrade(self);
        self.io.pump(|read| {
            let shared = shared.clone();
            let (slot, size) = (read.slot, read.size);
            self.storage.request_read(
                read.chunk,
                read.priority,
                Box::new(move |result| {
                    if let Some(shared) = shared.upgrade() {
                        shared.on_read_complete(slot, size, result);
                    }
                }),
            );
        });
    }

    fn on_read_complete(
        self: &Arc<Self>,
        slot: UnitSlot,
        size: u64,
        result: StorageResult<Arc<[u8]>>,
    ) {
        self.io.complete(size);
        match self.unit(slot) {
            Some(unit) => {
                {
                    let mut state = unit.lock();
                    match result {
                        Ok(buffer) => state.buffer = Some(buffer),
                        Err(StorageError::NotFound(chunk)) => {
                            warn!("{} has no data ({})", unit.package_name(), chunk);
                            self.stats.record_io_failure();
                            let error = LoadError::Missing {
                                name: unit.package_name().to_string(),
                            };
                            unit.fail(&mut state, error);
                        }
                        Err(err) => {
                            warn!("reading {} failed: {}", unit.package_name(), err);
                            self.stats.record_io_failure();
                            let error = LoadError::IoFailure {
                                package: unit.disk_id(),
                                reason: err.to_string(),
                            };
                            unit.fail(&mut state, error);
                        }
                    }
                }
                unit.nodes().summary.release_barrier_detached();
            }
            None => warn!("read completed for {}, which no longer exists", slot),
        }
        self.pump_io();
    }

    // ---- finalization ----

    /// Finalize units whose last node ran, then complete the ones whose
    /// clusters can be built
    pub(crate) fn finalize_completed(
        &self,
        consumer: &mut ConsumerState,
        out: &mut Vec<PendingCompletion>,
    ) {
        let mut retry = mem::take(&mut consumer.deferred_clusters);

        while let Some(slot) = self.completed.pop() {
            let unit = match self.unit(slot) {
                Some(unit) => unit,
                None => continue,
            };
            self.finalize_unit(&unit);
            if self.config.create_clusters && !unit.has_failed() {
                unit.advance(LoadPhase::CreatingClusters);
                retry.push(unit);
            } else {
                self.complete_unit(&unit, out);
            }
        }

        for unit in retry {
            if self.try_create_cluster(&unit) {
                self.complete_unit(&unit, out);
            } else {
                consumer.deferred_clusters.push(unit);
            }
        }
    }

    /// Publish or roll back the unit's objects and release its imports
    fn finalize_unit(
        &self,
        unit: &LoadUnit,
    ) {
        let collector = self.registry.collector();
        let objects = self.registry.objects();

        let imports = {
            let mut guard = unit.lock();
            let state = &mut *guard;
            // Under the state lock so a concurrent cancel either lands
            // before this point or is refused
            unit.advance(LoadPhase::Finalizing);
            let failed = unit.has_failed();

            for record in state.exports.iter_mut() {
                if let Some(object) = &record.object {
                    if failed {
                        if !record.from_existing {
                            objects.remove(object);
                        }
                    } else {
                        object.clear_flags(ObjectFlags::TRANSIENT_LOAD);
                        object.set_flags(ObjectFlags::LOAD_COMPLETED);
                    }
                    if record.is_pinned() {
                        collector.unpin(object);
                        record.set_pinned(false);
                    }
                }
                if failed {
                    record.object = None;
                }
            }

            if failed {
                if unit.key().custom_name.is_none() {
                    let forgotten = self.registry.forget_package_exports(unit.disk_id());
                    trace!("forgot {} public exports of {}", forgotten, unit.package_name());
                }
                let flags = match state.error {
                    Some(LoadError::Missing { .. }) => LoadedFlags::MISSING,
                    _ => LoadedFlags::FAILED,
                };
                self.registry.mark_package_failed(unit.loaded_id(), flags);
            }

            if let Some(root) = state.root.clone() {
                if failed {
                    if !state.root_from_existing {
                        objects.remove(&root);
                    }
                    state.root = None;
                } else {
                    root.clear_flags(ObjectFlags::TRANSIENT_LOAD);
                    root.set_flags(ObjectFlags::LOAD_COMPLETED);
                    self.registry.mark_package_loaded(unit.loaded_id(), root.clone());
                }
                if state.root_pinned {
                    collector.unpin(&root);
                    state.root_pinned = false;
                }
            }

            state.buffer = None;
            let imports = mem::take(&mut state.imports);
            state.finalized_imports = imports
                .iter()
                .filter_map(|import| import.unit.as_ref().map(Arc::downgrade))
                .collect();
            imports
        };

        for import in imports {
            if import.acquired {
                if let Err(err) = self.registry.release_loaded_ref(import.id) {
                    error!("{}: {}", unit.package_name(), err);
                }
            }
            if let Some(imported) = import.unit {
                self.release_unit(&imported);
            }
        }
    }

    /// Build the unit's cluster once none of its imports is still before
    /// finalization
    fn try_create_cluster(
        &self,
        unit: &LoadUnit,
    ) -> bool {
        let state = unit.lock();
        let ready = state.finalized_imports.iter().all(|import| {
            import
                .upgrade()
                .map_or(true, |imported| imported.phase() >= LoadPhase::Finalizing)
        });
        if !ready {
            return false;
        }
        if let Some(root) = &state.root {
            self.registry.collector().create_cluster(root);
            trace!("clustered {}", unit.package_name());
        }
        true
    }

    fn complete_unit(
        &self,
        unit: &LoadUnit,
        out: &mut Vec<PendingCompletion>,
    ) {
        unit.advance(LoadPhase::Complete);
        let (callbacks, error, root) = {
            let mut state = unit.lock();
            state.finalized_imports.clear();
            (
                mem::take(&mut state.callbacks),
                state.error.clone(),
                state.root.clone(),
            )
        };

        let result = if unit.is_canceled() {
            self.stats.record_cancel();
            LoadResult::Canceled
        } else if unit.has_failed() {
            self.stats.record_failure();
            LoadResult::Failed
        } else {
            self.stats.record_success();
            LoadResult::Success
        };
        match result {
            LoadResult::Success => info!("loaded {}", unit.package_name()),
            _ => info!("{} finished as {:?}", unit.package_name(), result),
        }

        let mut request_units = self.request_units.lock();
        for callback in callbacks {
            request_units.remove(&callback.request_id);
            out.push(PendingCompletion {
                completion: LoadCompletion {
                    request_id: callback.request_id,
                    package_name: callback.logical_name,
                    root: root.clone(),
                    result,
                    error: error.clone(),
                },
                callback: callback.callback,
            });
        }
        drop(request_units);

        self.release_unit(unit);
    }

    /// Drop one unit reference; the last one queues the unit for deletion
    fn release_unit(
        &self,
        unit: &LoadUnit,
    ) {
        if unit.release_ref() == 0 {
            self.deletions.push(unit.slot());
        }
    }

    pub(crate) fn drain_deletions(&self) {
        while let Some(slot) = self.deletions.pop() {
            let unit = {
                let mut units = self.units.write();
                if units.contains(slot.0 as usize) {
                    units.remove(slot.0 as usize)
                } else {
                    continue;
                }
            };
            unit.advance(LoadPhase::PendingDestruction);

            let mut active = self.active.lock();
            let current = active
                .get(unit.key())
                .is_some_and(|existing| Arc::ptr_eq(existing, &unit));
            if current {
                active.swap_remove(unit.key());
            }
            trace!("deleted {} ({})", slot, unit.package_name());
        }
    }

    /// Hand finished requests to their callbacks, outside every loader lock
    pub(crate) fn dispatch(
        &self,
        completions: Vec<PendingCompletion>,
    ) {
        for PendingCompletion {
            completion,
            callback,
        } in completions
        {
            self.pending.lock().remove(&completion.request_id);
            if let Some(callback) = callback {
                callback(&completion);
            }
        }
    }
}

impl PendingCompletion {
    /// Completion for a request that never got a unit
    fn immediate(
        request: LoadRequestDescriptor,
        result: LoadResult,
        root: Option<ObjectHandle>,
    ) -> Self {
        let error = match result {
            LoadResult::Canceled => Some(LoadError::Canceled {
                package: request.package_id,
            }),
            _ => None,
        };
        Self {
            completion: LoadCompletion {
                request_id: request.request_id,
                package_name: request.logical_name().to_string(),
                root,
                result,
                error,
            },
            callback: request.callback,
        }
    }
}
