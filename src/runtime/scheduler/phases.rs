//! What each graph node does to its unit
//!
//! Summary nodes parse the header and build the export table; bundle nodes
//! run create/serialize commands in order; the exports-done node drains
//! external reads; post-load nodes run the objects' fix-ups, thread-safe
//! ones first and the rest on the consuming thread.

use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use super::LoaderShared;
use crate::object::{path_for, NewObject, Object, ObjectFlags, ObjectHandle};
use crate::package::archive::{ExportArchive, ExternalReadMode, ObjectResolver};
use crate::package::error::{ArchiveError, LoadError};
use crate::package::header::{parse_header, BundleCommand, ExportMapEntry, PackageHeader};
use crate::package::unit::{ExportRecord, ImportedPackage, LoadPhase, LoadUnit, UnitResolver, UnitState};
use crate::package::ObjectIndex;
use crate::runtime::dag::{ExecContext, NodeOutcome, NodePhase, NodeRunner, NodeTask};

impl NodeRunner for LoaderShared {
    fn run(
        &self,
        task: NodeTask,
        ctx: &mut ExecContext<'_>,
    ) -> NodeOutcome {
        let unit = match self.unit(task.unit) {
            Some(unit) => unit,
            None => {
                warn!("node {:?} outlived {}", task.phase, task.unit);
                return NodeOutcome::Complete;
            }
        };

        match task.phase {
            NodePhase::ProcessSummary => {
                self.process_summary(&unit);
                NodeOutcome::Complete
            }
            NodePhase::ProcessBundle(index) => self.process_bundles(&unit, index, ctx),
            NodePhase::ExportsDone => self.exports_done(&unit, ctx),
            NodePhase::PostLoad(index) => self.post_load(&unit, index, ctx, false),
            NodePhase::DeferredPostLoad(index) => self.post_load(&unit, index, ctx, true),
        }
    }
}

/// Bundle edges used when a header lists none for an import: bundle `i` of
/// the import precedes bundle `i` here, and the last precedes the last
fn default_arcs(
    theirs: u32,
    ours: u32,
) -> Vec<(u32, u32)> {
    let mut arcs: Vec<(u32, u32)> = (0..theirs.min(ours)).map(|i| (i, i)).collect();
    let last = (theirs - 1, ours - 1);
    if !arcs.contains(&last) {
        arcs.push(last);
    }
    arcs
}

impl LoaderShared {
    /// Structural corruption: abort the process or fail the whole unit
    fn integrity_failure(
        &self,
        unit: &LoadUnit,
        state: &mut UnitState,
        error: LoadError,
    ) {
        error!("{}", error);
        if self.config.abort_on_corruption {
            std::process::abort();
        }
        unit.fail(state, error);
    }

    fn process_summary(
        &self,
        unit: &Arc<LoadUnit>,
    ) {
        unit.advance(LoadPhase::ParsingHeader);
        let _scope = self.registry.begin_load_scope();
        let mut state = unit.lock();
        if unit.has_failed() {
            debug!("{} failed before its header was parsed", unit.package_name());
            return;
        }

        let buffer = match state.buffer.clone() {
            Some(buffer) => buffer,
            None => {
                let error = LoadError::IoFailure {
                    package: unit.disk_id(),
                    reason: "no data was delivered".to_string(),
                };
                unit.fail(&mut state, error);
                return;
            }
        };

        let header = match parse_header(&buffer) {
            Ok(header) => Arc::new(header),
            Err(err) => {
                let error = LoadError::CorruptHeader {
                    package: unit.disk_id(),
                    reason: err.to_string(),
                };
                self.integrity_failure(unit, &mut state, error);
                return;
            }
        };
        self.stats.record_header();

        self.create_root(unit, &mut state);

        let target = self.config.target;
        state.exports = header
            .exports
            .iter()
            .map(|entry| ExportRecord::new(*entry, target.excludes(entry.filter_flags)))
            .collect();
        let filtered = state.exports.iter().filter(|record| record.filtered).count();
        debug!(
            "{}: {} exports ({} filtered), {} bundles",
            unit.package_name(),
            state.exports.len(),
            filtered,
            header.bundles.len()
        );

        state.header = Some(header.clone());
        state.bundle_cursor = (0, 0);
        let imports = state.imports.clone();
        drop(state);

        self.wire_import_arcs(unit, &header, &imports);
    }

    fn create_root(
        &self,
        unit: &LoadUnit,
        state: &mut UnitState,
    ) {
        let objects = self.registry.objects();
        let root = match objects.find(unit.root_name()) {
            Some(existing) => {
                state.root_from_existing = true;
                existing
            }
            None => {
                let fresh = Object::new(NewObject {
                    class: self.registry.package_class(),
                    flags: ObjectFlags::PACKAGE_ROOT | ObjectFlags::PUBLIC,
                    ..NewObject::named(unit.root_name())
                });
                let inserted = objects.insert_or_get(fresh.clone());
                state.root_from_existing = !Arc::ptr_eq(&inserted, &fresh);
                inserted
            }
        };
        root.set_flags(ObjectFlags::ASYNC_LOADING | ObjectFlags::WAS_LOADED);
        self.registry.collector().pin(&root);
        state.root_pinned = true;
        state.root = Some(root);
    }

    /// Order our bundles after the bundles of every ordered import, and our
    /// post-load after the import's last deferred post-load so that an
    /// import always completes before its importer
    fn wire_import_arcs(
        &self,
        unit: &LoadUnit,
        header: &PackageHeader,
        imports: &[ImportedPackage],
    ) {
        let nodes = unit.nodes();
        let ours = nodes.bundle_node_count();

        for import in imports.iter().filter(|import| import.ordered) {
            let imported = match &import.unit {
                Some(imported) => imported,
                None => continue,
            };
            let theirs = imported.nodes().bundle_node_count();
            let explicit = header
                .arcs
                .iter()
                .find(|arcs| self.registry.resolve_redirect(arcs.imported_package) == import.id);
            let arcs = match explicit {
                Some(explicit) => explicit.arcs.clone(),
                None => default_arcs(theirs, ours),
            };

            for (from, to) in arcs {
                let from = &imported.nodes().process[from.min(theirs - 1) as usize];
                let to = &nodes.process[to.min(ours - 1) as usize];
                if !to.depends_on(from) {
                    trace!("{} bundle already done, no edge", imported.package_name());
                }
            }

            let their_last = &imported.nodes().deferred_post_load[theirs as usize - 1];
            if !nodes.post_load[0].depends_on(their_last) {
                trace!("{} already post-loaded, no edge", imported.package_name());
            }
        }
    }

    fn process_bundles(
        &self,
        unit: &LoadUnit,
        index: u32,
        ctx: &mut ExecContext<'_>,
    ) -> NodeOutcome {
        unit.advance(LoadPhase::ExecutingBundles);
        if unit.has_failed() {
            return NodeOutcome::Complete;
        }

        let _scope = self.registry.begin_load_scope();
        let mut guard = unit.lock();
        let state = &mut *guard;
        let header = match state.header.clone() {
            Some(header) => header,
            None => return NodeOutcome::Complete,
        };
        let range = unit.nodes().bundle_range(index, header.bundles.len() as u32);
        if state.bundle_cursor.0 < range.start {
            state.bundle_cursor = (range.start, 0);
        }

        loop {
            let (bundle, entry) = state.bundle_cursor;
            if bundle >= range.end {
                break;
            }
            let entries = &header.bundles[bundle as usize].entries;
            let command = match entries.get(entry as usize) {
                Some(command) => *command,
                None => {
                    state.bundle_cursor = (bundle + 1, 0);
                    continue;
                }
            };
            state.bundle_cursor = (bundle, entry + 1);

            match command.command {
                BundleCommand::Create => self.create_export(unit, &header, state, command.export_index),
                BundleCommand::Serialize => self.serialize_export(unit, &header, state, command.export_index),
            }

            if unit.has_failed() {
                break;
            }
            if ctx.should_yield() {
                return NodeOutcome::Yielded;
            }
        }
        NodeOutcome::Complete
    }

    fn create_export(
        &self,
        unit: &LoadUnit,
        header: &PackageHeader,
        state: &mut UnitState,
        export: u32,
    ) {
        let record = &state.exports[export as usize];
        if record.filtered || record.created || record.failed {
            return;
        }
        let entry = record.entry;
        let root = match &state.root {
            Some(root) => root.clone(),
            None => return,
        };

        let constructed = self.construct(header, &state.exports, &root, &entry);
        let record = &mut state.exports[export as usize];
        match constructed {
            Ok((object, from_existing)) => {
                if from_existing {
                    debug!("{} already exists, reusing it", object.path());
                }
                self.registry.collector().pin(&object);
                record.set_pinned(true);
                record.created = true;
                record.from_existing = from_existing;
                record.object = Some(object.clone());
                if let (Some(index), None) = (entry.public_index(), &unit.key().custom_name) {
                    self.registry.store_public_export(unit.disk_id(), index, object);
                }
                self.stats.record_export_created();
            }
            Err(reason) => {
                let error = LoadError::ExportConstruction {
                    package: unit.disk_id(),
                    export,
                    reason,
                };
                warn!("{}", error);
                record.failed = true;
                record.error = Some(error);
            }
        }
    }

    /// Build the object for one export, or find the one already at its path
    fn construct(
        &self,
        header: &PackageHeader,
        exports: &[ExportRecord],
        root: &ObjectHandle,
        entry: &ExportMapEntry,
    ) -> Result<(ObjectHandle, bool), String> {
        let resolver = UnitResolver {
            exports,
            registry: &self.registry,
        };
        let resolve = |index: ObjectIndex, what: &str| -> Result<Option<ObjectHandle>, String> {
            if index.is_null() {
                return Ok(None);
            }
            resolver
                .resolve(index)
                .map(Some)
                .ok_or_else(|| format!("{} {:?} did not resolve", what, index))
        };

        let name = header
            .name_at(entry.object_name)
            .ok_or_else(|| format!("name index {} out of range", entry.object_name))?;
        let class = resolve(entry.class, "class")?.ok_or_else(|| "export has no class".to_string())?;
        let class_info = class
            .class_info()
            .cloned()
            .ok_or_else(|| format!("{} is not a class", class.path()))?;
        let outer = resolve(entry.outer, "outer")?.unwrap_or_else(|| root.clone());
        let super_struct = resolve(entry.super_struct, "super")?;
        let template = resolve(entry.template, "template")?;

        let objects = self.registry.objects();
        if let Some(existing) = objects.find(&path_for(Some(&outer), name)) {
            return Ok((existing, true));
        }

        let object = Object::new(NewObject {
            name: name.to_string(),
            outer: Some(outer),
            class: Some(class),
            super_struct,
            template,
            flags: entry.object_flags | ObjectFlags::TRANSIENT_LOAD | ObjectFlags::WAS_LOADED,
            class_info: None,
            body: class_info.instantiate(),
        });
        let inserted = objects.insert_or_get(object.clone());
        let from_existing = !Arc::ptr_eq(&inserted, &object);
        Ok((inserted, from_existing))
    }

    fn serialize_export(
        &self,
        unit: &LoadUnit,
        header: &PackageHeader,
        state: &mut UnitState,
        export: u32,
    ) {
        let record = &state.exports[export as usize];
        if record.filtered || record.failed || record.serialized || record.from_existing {
            return;
        }
        let object = match &record.object {
            Some(object) => object.clone(),
            None => return,
        };
        let entry = record.entry;
        let buffer = match &state.buffer {
            Some(buffer) => buffer.clone(),
            None => return,
        };

        let start = entry.serial_offset as usize;
        let data = match start
            .checked_add(entry.serial_size as usize)
            .and_then(|end| buffer.get(start..end))
        {
            Some(data) => data,
            None => {
                let error = LoadError::CorruptHeader {
                    package: unit.disk_id(),
                    reason: format!("export {} lies outside the package data", export),
                };
                self.integrity_failure(unit, state, error);
                return;
            }
        };

        let (result, consumed, reads) = {
            let resolver = UnitResolver {
                exports: &state.exports,
                registry: &self.registry,
            };
            let mut archive = ExportArchive::new(data, &header.names, &resolver);
            let result = object.with_body(|body| body.serialize(&mut archive));
            (result, archive.position(), archive.take_external_reads())
        };
        state.external_reads.extend(reads);

        let mismatch = |consumed: usize| LoadError::SerializationMismatch {
            package: unit.disk_id(),
            export,
            declared: entry.serial_size,
            consumed: consumed as u64,
        };
        match result {
            Err(ArchiveError::OutOfBounds {
                position,
                requested,
                ..
            }) => {
                self.integrity_failure(unit, state, mismatch(position + requested));
            }
            Err(err) => {
                let error = LoadError::ExportConstruction {
                    package: unit.disk_id(),
                    export,
                    reason: err.to_string(),
                };
                warn!("{}", error);
                let record = &mut state.exports[export as usize];
                record.failed = true;
                record.error = Some(error);
            }
            Ok(()) if consumed as u64 != entry.serial_size => {
                self.integrity_failure(unit, state, mismatch(consumed));
            }
            Ok(()) => {
                object.clear_flags(ObjectFlags::NEED_LOAD);
                state.exports[export as usize].serialized = true;
                self.stats.record_export_serialized();
            }
        }
    }

    fn exports_done(
        &self,
        unit: &LoadUnit,
        ctx: &mut ExecContext<'_>,
    ) -> NodeOutcome {
        let mut guard = unit.lock();
        let state = &mut *guard;

        if !state.external_reads.is_empty() {
            unit.advance(LoadPhase::WaitingForExternalReads);
            // Only a time-limited consuming thread may come back later
            let mode = if ctx.deadline().is_some() {
                ExternalReadMode::Poll
            } else {
                ExternalReadMode::Wait
            };
            state.external_reads.retain_mut(|read| !read(mode));
            if !state.external_reads.is_empty() {
                if mode == ExternalReadMode::Poll {
                    return NodeOutcome::Yielded;
                }
                warn!(
                    "{} external read(s) of {} did not finish when waited on",
                    state.external_reads.len(),
                    unit.package_name()
                );
                state.external_reads.clear();
            }
        }

        if !unit.has_failed() && state.exports.iter().any(|record| record.failed) {
            let failed_import = state
                .imports
                .iter()
                .find(|import| {
                    !import.acquired
                        || import.unit.as_ref().is_some_and(|imported| imported.has_failed())
                })
                .map(|import| import.id);
            if let Some(import) = failed_import {
                let error = LoadError::ImportFailed {
                    package: unit.disk_id(),
                    import,
                };
                warn!("{}", error);
                unit.fail(state, error);
            }
        }

        unit.advance(LoadPhase::ExportsFinalized);
        NodeOutcome::Complete
    }

    /// Run post-load for the exports serialized by node `index`'s bundles.
    ///
    /// The thread-safe pass skips objects whose class needs the consuming
    /// thread unless it is already running there; the deferred pass runs
    /// whatever is left, and its last node hands the unit to finalization.
    fn post_load(
        &self,
        unit: &LoadUnit,
        index: u32,
        ctx: &mut ExecContext<'_>,
        deferred: bool,
    ) -> NodeOutcome {
        unit.advance(if deferred {
            LoadPhase::DeferredPostLoad
        } else {
            LoadPhase::PostLoad
        });

        if !unit.has_failed() {
            let mut guard = unit.lock();
            let state = &mut *guard;
            if let Some(header) = state.header.clone() {
                let run_all = deferred || ctx.is_consumer();
                for bundle in unit.nodes().bundle_range(index, header.bundles.len() as u32) {
                    for command in &header.bundles[bundle as usize].entries {
                        if command.command != BundleCommand::Serialize {
                            continue;
                        }
                        let record = &mut state.exports[command.export_index as usize];
                        if record.post_loaded || !record.serialized {
                            continue;
                        }
                        let object = match &record.object {
                            Some(object) => object.clone(),
                            None => continue,
                        };
                        if !run_all && !object.post_load_is_thread_safe() {
                            continue;
                        }

                        object.with_body(|body| body.post_load());
                        object.clear_flags(ObjectFlags::NEED_POST_LOAD);
                        record.post_loaded = true;
                        if deferred {
                            self.stats.record_deferred_post_load();
                        } else {
                            self.stats.record_post_load();
                        }

                        if ctx.should_yield() {
                            return NodeOutcome::Yielded;
                        }
                    }
                }
            }
        }

        if deferred && index + 1 == unit.nodes().bundle_node_count() {
            self.completed.push(unit.slot());
            self.consumer_queue.zenaphore().notify_one();
        }
        NodeOutcome::Complete
    }
}
