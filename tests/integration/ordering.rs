//! 跨包顺序：导入包的同号 bundle 先于导入者完成

use std::any::Any;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use pkgflow::object::{ClassInfo, ObjectBody};
use pkgflow::package::archive::ExportArchive;
use pkgflow::package::builder::{ContainerBuilder, ExportSpec, PackageBuilder};
use pkgflow::package::error::ArchiveError;
use pkgflow::package::header::BundleEntry;
use pkgflow::package::ObjectIndex;
use pkgflow::storage::CompletionMode;
use pkgflow::{LoadRequest, LoadResult};

use crate::common::{config, Completions, World, CONTAINER};

type Log = Arc<Mutex<Vec<String>>>;

/// Appends its class tag to a shared log when serialized
struct TaggedBody {
    tag: String,
    log: Log,
}

impl ObjectBody for TaggedBody {
    fn serialize(
        &mut self,
        archive: &mut ExportArchive<'_>,
    ) -> Result<(), ArchiveError> {
        archive.read_bytes(archive.remaining())?;
        self.log.lock().push(self.tag.clone());
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn tagged_class_path(tag: &str) -> String {
    format!("/Script/Tagged.{}", tag)
}

fn register_tagged(
    world: &World,
    tag: &str,
    log: &Log,
) {
    let (owned, log) = (tag.to_string(), log.clone());
    world.registry.register_native_class(
        &tagged_class_path(tag),
        ClassInfo::new(tag, move || {
            Box::new(TaggedBody {
                tag: owned.clone(),
                log: log.clone(),
            })
        })
        .thread_safe_post_load(true),
    );
}

/// `/Chain/{tag}` with one tagged export, importing `/Chain/{import}`
fn tagged_package(
    tag: &str,
    import: Option<&str>,
) -> PackageBuilder {
    let mut builder = PackageBuilder::new(&format!("/Chain/{}", tag));
    let class = builder.import(ObjectIndex::script_import(&tagged_class_path(tag)));
    if let Some(import) = import {
        builder.depends_on_package(&format!("/Chain/{}", import));
    }
    builder.export(ExportSpec::new("Tagged", class).payload(vec![0; 8]).public());
    builder
}

fn chain_world(log: &Log) -> World {
    let world = World::new(CompletionMode::Deferred);
    for tag in ["A", "B", "C"] {
        register_tagged(&world, tag, log);
    }
    world.install(
        ContainerBuilder::new(CONTAINER)
            .package(&tagged_package("A", None))
            .package(&tagged_package("B", Some("A")))
            .package(&tagged_package("C", Some("B"))),
    );
    world
}

#[test]
fn test_chain_serializes_imports_first() {
    for workers in [0, 1, 4] {
        let log = Log::default();
        let world = chain_world(&log);
        let loader = world.start(config(workers));
        let done = Completions::default();

        let id = loader.load(done.track(LoadRequest::new("/Chain/C")));
        loader.flush(Some(id));

        assert_eq!(done.all()[0].result, LoadResult::Success);
        assert_eq!(*log.lock(), vec!["A", "B", "C"], "workers = {}", workers);
        loader.shutdown();
    }
}

#[test]
fn test_direct_requests_keep_import_order() {
    let log = Log::default();
    let world = chain_world(&log);
    let loader = world.start(config(2));
    let done = Completions::default();

    // Importers first, so request order and graph order disagree
    let ids: Vec<_> = ["/Chain/C", "/Chain/B", "/Chain/A"]
        .into_iter()
        .map(|name| loader.load(done.track(LoadRequest::new(name).with_priority(1))))
        .collect();
    loader.flush(None);

    assert_eq!(*log.lock(), vec!["A", "B", "C"]);
    for id in ids {
        assert_eq!(done.for_request(id)[0].result, LoadResult::Success);
    }
    assert_eq!(loader.stats().units_created, 3);
}

fn two_bundle_package(
    name: &str,
    first: &str,
    second: &str,
) -> PackageBuilder {
    let mut builder = PackageBuilder::new(name);
    for (index, tag) in [first, second].into_iter().enumerate() {
        let class = builder.import(ObjectIndex::script_import(&tagged_class_path(tag)));
        builder.export(ExportSpec::new(tag, class).payload(vec![index as u8; 4]));
        let index = index as u32;
        builder.bundle(vec![BundleEntry::create(index), BundleEntry::serialize(index)]);
    }
    builder
}

#[test]
fn test_explicit_arcs_order_bundles() {
    let log = Log::default();
    let world = World::new(CompletionMode::Immediate);
    for tag in ["Early", "Late", "Head", "Tail"] {
        register_tagged(&world, tag, &log);
    }

    // User's first bundle waits for Dep's second one
    let dep = two_bundle_package("/Chain/Dep", "Early", "Late");
    let mut user = two_bundle_package("/Chain/User", "Head", "Tail");
    user.depends_on_package("/Chain/Dep");
    user.arc(dep.package_id(), 1, 0);

    world.install(ContainerBuilder::new(CONTAINER).package(&dep).package(&user));
    let loader = world.start(config(0));
    let id = loader.load(LoadRequest::new("/Chain/User"));
    loader.flush(Some(id));

    assert_eq!(*log.lock(), vec!["Early", "Late", "Head", "Tail"]);
}

#[test]
fn test_long_chain_does_not_recurse() {
    let mut report_config = config(0);
    report_config.io_budget_bytes = 1 << 30;
    let report = pkgflow::demo::run_chain(report_config, 400, 2);

    assert_eq!(report.completions.len(), 1);
    assert_eq!(report.completions[0].result, LoadResult::Success);
    assert_eq!(report.stats.units_created, 400);
}

/// Takes its time in post-load, then notes that it finished
struct SlowPostLoad {
    tag: String,
    delay: Duration,
    finished: Log,
}

impl ObjectBody for SlowPostLoad {
    fn serialize(
        &mut self,
        archive: &mut ExportArchive<'_>,
    ) -> Result<(), ArchiveError> {
        archive.read_bytes(archive.remaining())?;
        Ok(())
    }

    fn post_load(&mut self) {
        thread::sleep(self.delay);
        self.finished.lock().push(self.tag.clone());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// `/Slow/A` <- `/Slow/B` <- `/Slow/C`; A's post-load is the slow one
fn slow_chain_world(finished: &Log) -> World {
    let world = World::new(CompletionMode::Deferred);
    let mut container = ContainerBuilder::new(CONTAINER);
    for (tag, import) in [("A", None), ("B", Some("A")), ("C", Some("B"))] {
        let (owned, finished) = (tag.to_string(), finished.clone());
        let delay = Duration::from_millis(if tag == "A" { 150 } else { 0 });
        let path = format!("/Script/Slow.{}", tag);
        world.registry.register_native_class(
            &path,
            ClassInfo::new(tag, move || {
                Box::new(SlowPostLoad {
                    tag: owned.clone(),
                    delay,
                    finished: finished.clone(),
                })
            })
            .thread_safe_post_load(true),
        );

        let mut builder = PackageBuilder::new(&format!("/Slow/{}", tag));
        let class = builder.import(ObjectIndex::script_import(&path));
        if let Some(import) = import {
            builder.depends_on_package(&format!("/Slow/{}", import));
        }
        builder.export(ExportSpec::new("Body", class).payload(vec![0; 8]));
        container = container.package(&builder);
    }
    world.install(container);
    world
}

#[test]
fn test_imports_complete_before_importers() {
    for workers in [0, 2] {
        let finished = Log::default();
        let world = slow_chain_world(&finished);
        let loader = world.start(config(workers));

        // (package, post-loads finished when its callback ran)
        let seen: Arc<Mutex<Vec<(String, Vec<String>)>>> = Arc::default();
        for name in ["/Slow/C", "/Slow/B", "/Slow/A"] {
            let (seen, finished) = (seen.clone(), finished.clone());
            loader.load(LoadRequest::new(name).on_complete(move |completion| {
                assert_eq!(completion.result, LoadResult::Success);
                seen.lock()
                    .push((completion.package_name.clone(), finished.lock().clone()));
            }));
        }
        loader.flush(None);

        let seen = seen.lock();
        let order: Vec<_> = seen.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(order, vec!["/Slow/A", "/Slow/B", "/Slow/C"], "workers = {}", workers);
        assert!(seen[1].1.iter().any(|tag| tag == "A"), "workers = {}", workers);
        assert!(seen[1].1.iter().any(|tag| tag == "B"), "workers = {}", workers);
        assert_eq!(seen[2].1, vec!["A", "B", "C"], "workers = {}", workers);
        loader.shutdown();
    }
}
