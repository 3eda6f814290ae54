//! 集成测试共用夹具：注册表、内存存储和完成回调记录
#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use pkgflow::object::builtin::{record_payload, FieldSpec, BLOB_CLASS_PATH, RECORD_CLASS_PATH};
use pkgflow::object::ObjectHandle;
use pkgflow::package::builder::{ContainerBuilder, ExportSpec, PackageBuilder};
use pkgflow::package::{ContainerId, ObjectIndex, Registry};
use pkgflow::runtime::gc::TrackingCollector;
use pkgflow::storage::{CompletionMode, MemoryStorage};
use pkgflow::util::config::LoaderConfig;
use pkgflow::{AsyncLoader, LoadCompletion, LoadRequest, RequestId};

pub const CONTAINER: ContainerId = ContainerId(1);

/// Collector, registry and storage shared by one test
pub struct World {
    pub gc: Arc<TrackingCollector>,
    pub registry: Arc<Registry>,
    pub storage: Arc<MemoryStorage>,
}

impl World {
    pub fn new(mode: CompletionMode) -> Self {
        Self::with_culture(mode, None)
    }

    pub fn with_culture(
        mode: CompletionMode,
        culture: Option<&str>,
    ) -> Self {
        let gc = Arc::new(TrackingCollector::new());
        let registry = Registry::init(gc.clone(), culture.map(str::to_string));
        Self {
            gc,
            registry,
            storage: Arc::new(MemoryStorage::new(mode)),
        }
    }

    pub fn install(
        &self,
        container: ContainerBuilder,
    ) {
        container.install(&self.registry, &self.storage);
    }

    pub fn start(
        &self,
        config: LoaderConfig,
    ) -> AsyncLoader {
        AsyncLoader::start(config, self.registry.clone(), self.storage.clone())
    }

    pub fn find(
        &self,
        path: &str,
    ) -> Option<ObjectHandle> {
        self.registry.objects().find(path)
    }

    /// Live objects whose path starts with `prefix`
    pub fn objects_under(
        &self,
        prefix: &str,
    ) -> Vec<ObjectHandle> {
        self.registry
            .objects()
            .objects()
            .into_iter()
            .filter(|object| object.path().starts_with(prefix))
            .collect()
    }
}

/// Test config: corruption fails the package instead of aborting
pub fn config(workers: usize) -> LoaderConfig {
    LoaderConfig {
        worker_threads: workers,
        flush_poll_interval_ms: 1,
        abort_on_corruption: false,
        ..LoaderConfig::default()
    }
}

/// Package whose exports are public blobs named `exports`
pub fn blob_package(
    name: &str,
    exports: &[&str],
) -> PackageBuilder {
    let mut builder = PackageBuilder::new(name);
    let blob = builder.import(ObjectIndex::script_import(BLOB_CLASS_PATH));
    for (index, export) in exports.iter().enumerate() {
        builder.export(
            ExportSpec::new(*export, blob)
                .payload(vec![index as u8; 32])
                .public(),
        );
    }
    builder
}

/// Package with one record export `Ref` linking to `imported.export`
pub fn linking_package(
    name: &str,
    imported: &str,
    export: &str,
) -> PackageBuilder {
    let mut builder = PackageBuilder::new(name);
    let record = builder.import(ObjectIndex::script_import(RECORD_CLASS_PATH));
    let target = builder.import_export(imported, export);
    let payload = record_payload(&mut builder, &[("Link", FieldSpec::Object(target))]);
    builder.export(ExportSpec::new("Ref", record).payload(payload).public());
    builder
}

/// Records every completion callback it is attached to
#[derive(Clone, Default)]
pub struct Completions(Arc<Mutex<Vec<LoadCompletion>>>);

impl Completions {
    pub fn track(
        &self,
        request: LoadRequest,
    ) -> LoadRequest {
        let sink = self.0.clone();
        request.on_complete(move |completion| sink.lock().push(completion.clone()))
    }

    pub fn all(&self) -> Vec<LoadCompletion> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn for_request(
        &self,
        id: RequestId,
    ) -> Vec<LoadCompletion> {
        self.0
            .lock()
            .iter()
            .filter(|completion| completion.request_id == id)
            .cloned()
            .collect()
    }
}
