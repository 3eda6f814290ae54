//! 基本加载场景：单包、传递导入、重复请求和优先级合并

use std::sync::Arc;
use std::thread;

use pkgflow::object::builtin::{RecordBody, Value};
use pkgflow::object::ObjectFlags;
use pkgflow::package::builder::ContainerBuilder;
use pkgflow::package::unit::LoadPhase;
use pkgflow::storage::CompletionMode;
use pkgflow::{LoadRequest, LoadResult, PackageId};

use crate::common::{blob_package, config, linking_package, Completions, World, CONTAINER};

fn foo_bar_world(mode: CompletionMode) -> World {
    let world = World::new(mode);
    world.install(
        ContainerBuilder::new(CONTAINER)
            .package(&blob_package("/Game/Foo", &["A", "B"]))
            .package(&linking_package("/Game/Bar", "/Game/Foo", "A")),
    );
    world
}

#[test]
fn test_foo_loads_every_export() {
    let world = foo_bar_world(CompletionMode::Deferred);
    let loader = world.start(config(2));
    let done = Completions::default();

    let id = loader.load(done.track(LoadRequest::new("/Game/Foo")));
    loader.flush(Some(id));

    let seen = done.all();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].package_name, "/Game/Foo");
    assert_eq!(seen[0].result, LoadResult::Success);
    assert!(seen[0].error.is_none());
    let root = seen[0].root.clone().expect("root object");
    assert_eq!(root.path(), "/Game/Foo");
    assert!(root.has_any_flags(ObjectFlags::LOAD_COMPLETED));

    for path in ["/Game/Foo.A", "/Game/Foo.B"] {
        let export = world.find(path).expect(path);
        assert!(Arc::ptr_eq(export.package_root().unwrap(), &root));
        assert!(!export.has_any_flags(ObjectFlags::TRANSIENT_LOAD));
    }

    let loaded = world
        .registry
        .loaded_ref(PackageId::from_name("/Game/Foo"))
        .unwrap();
    assert!(loaded.all_exports_loaded());
    assert_eq!(world.gc.total_pins(), 0);
    loader.shutdown();
}

#[test]
fn test_importer_drives_its_import() {
    let world = foo_bar_world(CompletionMode::Manual);
    let loader = world.start(config(0));
    let done = Completions::default();
    let foo = PackageId::from_name("/Game/Foo");
    let bar = PackageId::from_name("/Game/Bar");

    let id = loader.load(done.track(LoadRequest::new("/Game/Bar")));
    loader.tick(None);

    // Foo was never requested but has a unit of its own
    assert!(loader.has_unit(foo));
    assert_eq!(loader.unit_phase(foo), Some(LoadPhase::WaitingForIo));
    assert_eq!(loader.unit_phase(bar), Some(LoadPhase::WaitingForIo));
    assert_eq!(world.storage.pending_count(), 2);

    world.storage.complete_all();
    loader.flush(Some(id));

    let seen = done.all();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].result, LoadResult::Success);
    assert!(world.registry.loaded_root(foo).is_some());

    let link = world
        .find("/Game/Bar.Ref")
        .unwrap()
        .body_as::<RecordBody, _>(|body| match body.get("Link") {
            Some(Value::Object(Some(target))) => Some(target.path().to_string()),
            _ => None,
        })
        .flatten();
    assert_eq!(link.as_deref(), Some("/Game/Foo.A"));
    assert_eq!(loader.unit_count(), 0);
}

#[test]
fn test_overlapping_requests_take_max_priority() {
    let world = World::new(CompletionMode::Manual);
    world.install(ContainerBuilder::new(CONTAINER).package(&blob_package("/Game/Qux", &["Data"])));
    let loader = world.start(config(0));
    let done = Completions::default();
    let qux = PackageId::from_name("/Game/Qux");

    let high = loader.load(done.track(LoadRequest::new("/Game/Qux").with_priority(5)));
    loader.tick(None);
    assert_eq!(loader.unit_priority(qux), Some(5));

    let low = loader.load(done.track(LoadRequest::new("/Game/Qux").with_priority(1)));
    loader.tick(None);
    assert_eq!(loader.unit_priority(qux), Some(5));

    world.storage.complete_all();
    loader.flush(None);

    assert_eq!(done.for_request(high).len(), 1);
    assert_eq!(done.for_request(low).len(), 1);
    assert!(done.all().iter().all(|c| c.result == LoadResult::Success));
    assert_eq!(loader.stats().units_created, 1);
}

#[test]
fn test_late_request_raises_priority() {
    let world = World::new(CompletionMode::Manual);
    world.install(ContainerBuilder::new(CONTAINER).package(&blob_package("/Game/Qux", &["Data"])));
    let loader = world.start(config(0));
    let qux = PackageId::from_name("/Game/Qux");

    let first = loader.load(LoadRequest::new("/Game/Qux").with_priority(1));
    loader.tick(None);
    assert_eq!(loader.unit_priority(qux), Some(1));

    loader.load(LoadRequest::new("/Game/Qux").with_priority(5));
    loader.tick(None);
    assert_eq!(loader.unit_priority(qux), Some(5));

    world.storage.complete_all();
    loader.flush(Some(first));
}

#[test]
fn test_lowering_one_request_keeps_shared_max() {
    let world = World::new(CompletionMode::Manual);
    world.install(ContainerBuilder::new(CONTAINER).package(&blob_package("/Game/Qux", &["Data"])));
    let loader = world.start(config(0));
    let qux = PackageId::from_name("/Game/Qux");

    let high = loader.load(LoadRequest::new("/Game/Qux").with_priority(5));
    let low = loader.load(LoadRequest::new("/Game/Qux").with_priority(1));
    loader.tick(None);

    assert!(loader.set_priority(low, 0));
    assert_eq!(loader.unit_priority(qux), Some(5));

    // Only once the highest request drops does the package follow
    assert!(loader.set_priority(high, 2));
    assert_eq!(loader.unit_priority(qux), Some(2));

    world.storage.complete_all();
    loader.flush(None);
    assert!(!loader.is_loading());
}

#[test]
fn test_raised_importer_raises_its_imports() {
    let world = foo_bar_world(CompletionMode::Manual);
    let loader = world.start(config(0));
    let foo = PackageId::from_name("/Game/Foo");
    let bar = PackageId::from_name("/Game/Bar");

    let first = loader.load(LoadRequest::new("/Game/Bar"));
    loader.tick(None);
    assert_eq!(loader.unit_priority(foo), Some(0));

    loader.load(LoadRequest::new("/Game/Bar").with_priority(9));
    loader.tick(None);
    assert_eq!(loader.unit_priority(bar), Some(9));
    assert_eq!(loader.unit_priority(foo), Some(9));

    world.storage.complete_all();
    loader.flush(Some(first));
}

#[test]
fn test_set_priority_reaches_imports() {
    let world = foo_bar_world(CompletionMode::Manual);
    let loader = world.start(config(0));
    let foo = PackageId::from_name("/Game/Foo");

    let id = loader.load(LoadRequest::new("/Game/Bar").with_priority(1));
    loader.tick(None);
    assert!(loader.set_priority(id, 7));
    assert_eq!(loader.unit_priority(foo), Some(7));

    // An import keeps what its importer once asked for
    assert!(loader.set_priority(id, 0));
    assert_eq!(loader.unit_priority(foo), Some(7));

    world.storage.complete_all();
    loader.flush(Some(id));
}

#[test]
fn test_concurrent_requests_share_one_unit() {
    const CALLERS: usize = 8;

    let world = foo_bar_world(CompletionMode::Deferred);
    let loader = world.start(config(2));
    let done = Completions::default();

    let ids: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..CALLERS)
            .map(|_| scope.spawn(|| loader.load(done.track(LoadRequest::new("/Game/Foo")))))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    loader.flush(None);

    assert_eq!(done.len(), CALLERS);
    for id in ids {
        let seen = done.for_request(id);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].result, LoadResult::Success);
    }
    assert_eq!(loader.stats().units_created, 1);
    assert_eq!(world.storage.read_count(), 1);
}

#[test]
fn test_reload_returns_existing_root() {
    let world = foo_bar_world(CompletionMode::Immediate);
    let loader = world.start(config(0));
    let done = Completions::default();

    let first = loader.load(done.track(LoadRequest::new("/Game/Foo")));
    loader.flush(Some(first));
    let second = loader.load(done.track(LoadRequest::new("/Game/Foo")));
    loader.flush(Some(second));

    let a = done.for_request(first)[0].root.clone().unwrap();
    let b = done.for_request(second)[0].root.clone().unwrap();
    assert!(Arc::ptr_eq(&a, &b));

    let stats = loader.stats();
    assert_eq!(stats.units_created, 1);
    assert_eq!(stats.headers_parsed, 1);
    assert_eq!(stats.exports_created, 2);
    assert_eq!(stats.succeeded, 2);
    assert_eq!(world.storage.read_count(), 1);
}

#[test]
fn test_missing_package_fails_fast() {
    let world = World::new(CompletionMode::Immediate);
    let loader = world.start(config(0));
    let done = Completions::default();

    let id = loader.load(done.track(LoadRequest::new("/Game/Nowhere")));
    loader.flush(Some(id));

    let seen = done.all();
    assert_eq!(seen[0].result, LoadResult::Failed);
    assert!(seen[0].root.is_none());
    assert!(matches!(
        seen[0].error,
        Some(pkgflow::package::LoadError::Missing { .. })
    ));
    assert_eq!(loader.stats().units_created, 0);
}
