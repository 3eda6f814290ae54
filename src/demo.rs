//! Synthetic import chains for the `demo` command and the benchmarks
//!
//! Package `/Demo/P{i}` imports `/Demo/P{i-1}`. Every package exports a mix
//! of blobs (post-loaded anywhere) and records (post-loaded on the consuming
//! thread); records point at the previous package's first public export.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::info;

use crate::object::builtin::{record_payload, FieldSpec, BLOB_CLASS_PATH, RECORD_CLASS_PATH};
use crate::package::builder::{ContainerBuilder, ExportSpec, PackageBuilder};
use crate::package::registry::Registry;
use crate::package::store::ContainerId;
use crate::package::{LoadCompletion, LoadRequest, ObjectIndex};
use crate::runtime::gc::TrackingCollector;
use crate::runtime::scheduler::{AsyncLoader, LoaderStatsSnapshot};
use crate::storage::{CompletionMode, MemoryStorage};
use crate::util::config::LoaderConfig;

/// Name of package `index` in a demo chain
pub fn chain_name(index: usize) -> String {
    format!("/Demo/P{}", index)
}

/// One package of the chain
pub fn chain_package(
    index: usize,
    exports: usize,
) -> PackageBuilder {
    let mut builder = PackageBuilder::new(&chain_name(index));
    let blob = builder.import(ObjectIndex::script_import(BLOB_CLASS_PATH));
    let record = builder.import(ObjectIndex::script_import(RECORD_CLASS_PATH));
    let previous = (index > 0).then(|| builder.import_export(&chain_name(index - 1), "Item0"));

    for export in 0..exports.max(1) {
        let name = format!("Item{}", export);
        let spec = if export % 2 == 0 {
            ExportSpec::new(name, blob).payload(vec![export as u8; 64])
        } else {
            let target = previous.unwrap_or(ObjectIndex::export(0));
            let payload = record_payload(
                &mut builder,
                &[
                    ("Index", FieldSpec::Int(export as i64)),
                    ("Link", FieldSpec::Object(target)),
                ],
            );
            ExportSpec::new(name, record).payload(payload)
        };
        builder.export(spec.public());
    }
    builder
}

/// Container holding a chain of `packages` packages
pub fn chain_container(
    id: ContainerId,
    packages: usize,
    exports: usize,
) -> ContainerBuilder {
    (0..packages.max(1)).fold(ContainerBuilder::new(id), |container, index| {
        container.package(&chain_package(index, exports))
    })
}

/// What one demo run produced
#[derive(Debug)]
pub struct DemoReport {
    pub completions: Vec<LoadCompletion>,
    pub stats: LoaderStatsSnapshot,
    pub elapsed: Duration,
    /// Objects living under `/Demo/` afterwards
    pub objects: usize,
}

/// Load the head of a fresh chain and wait for it.
pub fn run_chain(
    config: LoaderConfig,
    packages: usize,
    exports: usize,
) -> DemoReport {
    let collector = Arc::new(TrackingCollector::new());
    let registry = Registry::init(collector, config.culture.clone());
    let storage = Arc::new(MemoryStorage::new(CompletionMode::Deferred));
    chain_container(ContainerId(1), packages, exports).install(&registry, &storage);

    let loader = AsyncLoader::start(config, registry.clone(), storage);
    let completions = Arc::new(Mutex::new(Vec::new()));
    let sink = completions.clone();

    let started = Instant::now();
    let head = chain_name(packages.max(1) - 1);
    info!("loading {}", head);
    let request = LoadRequest::new(head)
        .on_complete(move |completion| sink.lock().push(completion.clone()));
    let id = loader.load(request);
    loader.flush(Some(id));
    let elapsed = started.elapsed();

    let stats = loader.stats();
    loader.shutdown();
    let completions = std::mem::take(&mut *completions.lock());
    DemoReport {
        completions,
        stats,
        elapsed,
        objects: registry
            .objects()
            .objects()
            .iter()
            .filter(|object| object.path().starts_with("/Demo/"))
            .count(),
    }
}
