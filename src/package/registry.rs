//! Process-wide package, import and object tables
//!
//! One `Registry` is created per loader lifetime and shared by `Arc`.
//! Store metadata (entries, names, redirects) sits behind one lock; loaded
//! package refs behind another; the public-export and built-in import
//! tables have their own. The unreachable sweep takes `sweep_guard`
//! exclusively, while header parsing and export creation hold it shared.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, error, info, warn};

use crate::object::builtin::{core_classes, CLASS_CLASS_PATH, PACKAGE_CLASS_PATH};
use crate::object::{ClassInfo, NewObject, Object, ObjectFlags, ObjectHandle, ObjectId, ObjectTable};
use crate::runtime::gc::GarbageCollector;

use super::error::RegistryError;
use super::store::{ContainerDescriptor, ContainerId, StoreEntry};
use super::{ObjectIndex, ObjectIndexKind, PackageId};

const MAX_REDIRECT_HOPS: usize = 8;

bitflags! {
    /// State of a package's object graph
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LoadedFlags: u8 {
        const ALL_EXPORTS_LOADED = 1 << 0;
        const MISSING = 1 << 1;
        const FAILED = 1 << 2;
    }
}

/// Ref-counted record of a package's object graph
#[derive(Debug, Clone, Default)]
pub struct LoadedPackageRef {
    root: Option<ObjectHandle>,
    ref_count: u32,
    flags: LoadedFlags,
}

impl LoadedPackageRef {
    #[inline]
    pub fn root(&self) -> Option<&ObjectHandle> {
        self.root.as_ref()
    }

    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    #[inline]
    pub fn flags(&self) -> LoadedFlags {
        self.flags
    }

    #[inline]
    pub fn all_exports_loaded(&self) -> bool {
        self.flags.contains(LoadedFlags::ALL_EXPORTS_LOADED)
    }

    #[inline]
    pub fn has_failed(&self) -> bool {
        self.flags
            .intersects(LoadedFlags::FAILED | LoadedFlags::MISSING)
    }
}

/// Resolved cross-package import
#[derive(Debug, Clone)]
pub struct GlobalImportRecord {
    pub object: ObjectHandle,
    pub package: PackageId,
}

/// What one `remove_unreachable` call did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub objects_removed: usize,
    pub exports_removed: usize,
    pub packages_removed: usize,
    /// Objects kept because an importer still references their package
    pub refused: usize,
}

#[derive(Default)]
struct StoreTables {
    entries: HashMap<PackageId, Arc<StoreEntry>>,
    names: HashMap<PackageId, String>,
    redirects: HashMap<PackageId, PackageId>,
    containers: Vec<ContainerId>,
}

impl StoreTables {
    fn resolve(
        &self,
        mut id: PackageId,
    ) -> PackageId {
        for _ in 0..MAX_REDIRECT_HOPS {
            match self.redirects.get(&id) {
                Some(target) if *target != id => id = *target,
                _ => break,
            }
        }
        id
    }
}

pub struct Registry {
    collector: Arc<dyn GarbageCollector>,
    culture: Option<String>,
    objects: ObjectTable,
    store: RwLock<StoreTables>,
    loaded: Mutex<HashMap<PackageId, LoadedPackageRef>>,
    script_imports: RwLock<HashMap<ObjectIndex, ObjectHandle>>,
    public_exports: RwLock<HashMap<ObjectIndex, GlobalImportRecord>>,
    sweep_guard: RwLock<()>,
    running: AtomicBool,
}

impl Registry {
    /// Create a registry with the core classes registered
    pub fn init(
        collector: Arc<dyn GarbageCollector>,
        culture: Option<String>,
    ) -> Arc<Self> {
        let registry = Arc::new(Self {
            collector,
            culture,
            objects: ObjectTable::new(),
            store: RwLock::new(StoreTables::default()),
            loaded: Mutex::new(HashMap::new()),
            script_imports: RwLock::new(HashMap::new()),
            public_exports: RwLock::new(HashMap::new()),
            sweep_guard: RwLock::new(()),
            running: AtomicBool::new(true),
        });
        for (path, class) in core_classes() {
            registry.register_native_class(path, class);
        }
        debug!("registry initialized");
        registry
    }

    /// Drop every table; pins held for referenced packages are released
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let loaded = std::mem::take(&mut *self.loaded.lock());
        for record in loaded.values() {
            if let (Some(root), true) = (&record.root, record.ref_count > 0) {
                self.collector.unpin(root);
            }
        }
        self.public_exports.write().clear();
        self.script_imports.write().clear();
        *self.store.write() = StoreTables::default();
        self.objects.clear();
        debug!("registry shut down");
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[inline]
    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    #[inline]
    pub fn collector(&self) -> &Arc<dyn GarbageCollector> {
        &self.collector
    }

    // ---- built-in objects ----

    /// Register a native class under `path`, e.g. `/Script/Core.Blob`
    pub fn register_native_class(
        &self,
        path: &str,
        class: ClassInfo,
    ) -> ObjectHandle {
        let meta_class = self.resolve_import(ObjectIndex::script_import(CLASS_CLASS_PATH));
        let object = Object::new(NewObject {
            class: meta_class,
            flags: ObjectFlags::NATIVE | ObjectFlags::PUBLIC | ObjectFlags::STANDALONE,
            class_info: Some(Arc::new(class)),
            ..NewObject::named(path)
        });
        let object = self.objects.insert_or_get(object);
        self.script_imports
            .write()
            .insert(ObjectIndex::script_import(path), object.clone());
        object
    }

    /// Expose an object created by native code as a script import.
    /// Returns false if nothing lives at `path`.
    pub fn register_native_object(
        &self,
        path: &str,
    ) -> bool {
        match self.objects.find(path) {
            Some(object) => {
                object.set_flags(ObjectFlags::NATIVE);
                self.script_imports
                    .write()
                    .insert(ObjectIndex::script_import(path), object);
                true
            }
            None => false,
        }
    }

    pub fn package_class(&self) -> Option<ObjectHandle> {
        self.resolve_import(ObjectIndex::script_import(PACKAGE_CLASS_PATH))
    }

    // ---- store entries ----

    /// Incorporate a newly mounted container.
    ///
    /// Redirects (and localized overrides matching our culture) also rewrite
    /// the import lists of entries that were already installed. Loads in
    /// flight keep the entries they already hold.
    pub fn mount_container(
        &self,
        container: ContainerDescriptor,
    ) {
        let mut store = self.store.write();
        let package_count = container.packages.len();
        for package in container.packages {
            let mut entry = package.entry;
            entry.container = container.id;
            store.entries.insert(package.id, Arc::new(entry));
            store.names.insert(package.id, package.name);
        }

        let mut remapped = container.redirects;
        remapped.extend(
            container
                .localized
                .into_iter()
                .filter(|loc| self.culture.as_deref() == Some(loc.culture.as_str()))
                .map(|loc| (loc.source, loc.target)),
        );
        let redirect_count = remapped.len();
        store.redirects.extend(remapped);

        if redirect_count > 0 {
            let lookup = StoreTables {
                redirects: store.redirects.clone(),
                ..StoreTables::default()
            };
            for entry in store.entries.values_mut() {
                if entry
                    .imported_packages
                    .iter()
                    .any(|id| lookup.resolve(*id) != *id)
                {
                    let entry = Arc::make_mut(entry);
                    for id in entry.imported_packages.iter_mut() {
                        *id = lookup.resolve(*id);
                    }
                }
            }
        }

        store.containers.push(container.id);
        info!(
            "mounted {} ({} packages, {} redirects)",
            container.id, package_count, redirect_count
        );
    }

    pub fn find_store_entry(
        &self,
        id: PackageId,
    ) -> Option<Arc<StoreEntry>> {
        self.store.read().entries.get(&id).cloned()
    }

    /// Follow redirects to the id whose data should be read
    pub fn resolve_redirect(
        &self,
        id: PackageId,
    ) -> PackageId {
        self.store.read().resolve(id)
    }

    pub fn package_name(
        &self,
        id: PackageId,
    ) -> Option<String> {
        self.store.read().names.get(&id).cloned()
    }

    pub fn mounted_containers(&self) -> Vec<ContainerId> {
        self.store.read().containers.clone()
    }

    // ---- loaded package refs ----

    /// Acquire one reference; the first reference on a loaded package pins
    /// its root again
    pub fn acquire_loaded_ref(
        &self,
        id: PackageId,
    ) -> u32 {
        let mut loaded = self.loaded.lock();
        let record = loaded.entry(id).or_default();
        record.ref_count += 1;
        if record.ref_count == 1 {
            if let Some(root) = &record.root {
                self.collector.pin(root);
            }
        }
        record.ref_count
    }

    /// Release one reference; the last one unpins the root
    pub fn release_loaded_ref(
        &self,
        id: PackageId,
    ) -> Result<u32, RegistryError> {
        let mut loaded = self.loaded.lock();
        let record = match loaded.get_mut(&id) {
            Some(record) if record.ref_count > 0 => record,
            _ => {
                error!("release of {} without a matching acquire", id);
                return Err(RegistryError::RefUnderflow { package: id });
            }
        };
        record.ref_count -= 1;
        let remaining = record.ref_count;
        if remaining == 0 {
            if let Some(root) = &record.root {
                self.collector.unpin(root);
            }
            if record.root.is_none() && record.flags.is_empty() {
                loaded.remove(&id);
            }
        }
        Ok(remaining)
    }

    /// Bind a finished package to its root
    pub fn mark_package_loaded(
        &self,
        id: PackageId,
        root: ObjectHandle,
    ) {
        let mut loaded = self.loaded.lock();
        let record = loaded.entry(id).or_default();
        if record.ref_count > 0 {
            if let Some(previous) = &record.root {
                self.collector.unpin(previous);
            }
            self.collector.pin(&root);
        }
        record.root = Some(root);
        record.flags = LoadedFlags::ALL_EXPORTS_LOADED;
    }

    pub fn mark_package_failed(
        &self,
        id: PackageId,
        flags: LoadedFlags,
    ) {
        let mut loaded = self.loaded.lock();
        let record = loaded.entry(id).or_default();
        if let (Some(root), true) = (&record.root, record.ref_count > 0) {
            self.collector.unpin(root);
        }
        record.root = None;
        record.flags = flags;
    }

    /// Snapshot of a package's loaded ref
    pub fn loaded_ref(
        &self,
        id: PackageId,
    ) -> Option<LoadedPackageRef> {
        self.loaded.lock().get(&id).cloned()
    }

    /// Root of a fully loaded package
    pub fn loaded_root(
        &self,
        id: PackageId,
    ) -> Option<ObjectHandle> {
        self.loaded
            .lock()
            .get(&id)
            .filter(|record| record.all_exports_loaded())
            .and_then(|record| record.root.clone())
    }

    // ---- imports ----

    /// Resolve a global import through the built-in table, then the public
    /// export table
    pub fn resolve_import(
        &self,
        index: ObjectIndex,
    ) -> Option<ObjectHandle> {
        match index.kind() {
            ObjectIndexKind::ScriptImport => self.script_imports.read().get(&index).cloned(),
            ObjectIndexKind::PackageImport => self
                .public_exports
                .read()
                .get(&index)
                .map(|record| record.object.clone()),
            ObjectIndexKind::Export | ObjectIndexKind::Null => None,
        }
    }

    pub fn store_public_export(
        &self,
        package: PackageId,
        index: ObjectIndex,
        object: ObjectHandle,
    ) {
        debug_assert_eq!(index.kind(), ObjectIndexKind::PackageImport);
        self.public_exports
            .write()
            .insert(index, GlobalImportRecord { object, package });
    }

    pub fn public_export(
        &self,
        index: ObjectIndex,
    ) -> Option<GlobalImportRecord> {
        self.public_exports.read().get(&index).cloned()
    }

    /// Drop every public export a package registered; returns how many
    pub fn forget_package_exports(
        &self,
        package: PackageId,
    ) -> usize {
        let mut exports = self.public_exports.write();
        let before = exports.len();
        exports.retain(|_, record| record.package != package);
        before - exports.len()
    }

    pub fn public_export_count(&self) -> usize {
        self.public_exports.read().len()
    }

    // ---- sweep ----

    /// Shared guard held while headers are parsed and exports created
    pub fn begin_load_scope(&self) -> RwLockReadGuard<'_, ()> {
        self.sweep_guard.read()
    }

    /// Evict objects the collector is about to free.
    ///
    /// Objects belonging to a package that an importer still references are
    /// kept, as are that package's public exports and loaded ref.
    pub fn remove_unreachable(
        &self,
        objects: &[ObjectHandle],
    ) -> SweepReport {
        let _exclusive = self.sweep_guard.write();
        let mut report = SweepReport::default();
        let doomed: HashSet<ObjectId> = objects.iter().map(|o| o.id()).collect();

        let mut loaded = self.loaded.lock();
        let roots: HashMap<ObjectId, (PackageId, u32)> = loaded
            .iter()
            .filter_map(|(id, record)| {
                record
                    .root
                    .as_ref()
                    .map(|root| (root.id(), (*id, record.ref_count)))
            })
            .collect();
        let referenced = |object: &ObjectHandle| -> bool {
            let root = if object.has_any_flags(ObjectFlags::PACKAGE_ROOT) {
                object
            } else {
                match object.package_root() {
                    Some(root) => root,
                    None => return false,
                }
            };
            roots
                .get(&root.id())
                .is_some_and(|(_, refs)| *refs > 0)
        };

        self.public_exports.write().retain(|_, record| {
            if !doomed.contains(&record.object.id()) {
                return true;
            }
            let refs = loaded.get(&record.package).map_or(0, |r| r.ref_count);
            if refs > 0 {
                return true;
            }
            report.exports_removed += 1;
            false
        });

        for object in objects {
            if referenced(object) {
                warn!(
                    "{} reported unreachable while its package is still imported",
                    object.path()
                );
                report.refused += 1;
                continue;
            }
            if object.has_any_flags(ObjectFlags::PACKAGE_ROOT) {
                if let Some((package, _)) = roots.get(&object.id()) {
                    loaded.remove(package);
                    report.packages_removed += 1;
                }
            }
            if self.objects.remove(object) {
                report.objects_removed += 1;
            }
        }

        debug!(
            "sweep removed {} objects, {} exports, {} packages ({} refused)",
            report.objects_removed, report.exports_removed, report.packages_removed, report.refused
        );
        report
    }
}

impl fmt::Debug for Registry {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Registry")
            .field("objects", &self.objects.len())
            .field("store_entries", &self.store.read().entries.len())
            .field("loaded", &self.loaded.lock().len())
            .field("public_exports", &self.public_exports.read().len())
            .field("running", &self.is_running())
            .finish()
    }
}
