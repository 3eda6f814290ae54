//! 与垃圾回收器的协作：钉住、清扫、引用计数和聚簇

use proptest::prelude::*;

use pkgflow::package::builder::ContainerBuilder;
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
fn test_sweep_evicts_unreferenced_package() {
    let world = foo_bar_world(CompletionMode::Immediate);
    let loader = world.start(config(0));
    let foo = PackageId::from_name("/Game/Foo");

    loader.flush(Some(loader.load(LoadRequest::new("/Game/Foo"))));
    assert!(world.registry.loaded_root(foo).is_some());

    let doomed = world.gc.unreachable_objects(world.registry.objects());
    assert_eq!(doomed.len(), 3);
    let report = loader.notify_unreachable(&doomed);
    assert_eq!(report.objects_removed, 3);
    assert_eq!(report.exports_removed, 2);
    assert_eq!(report.packages_removed, 1);
    assert_eq!(report.refused, 0);
    assert!(world.registry.loaded_root(foo).is_none());
    assert!(world.find("/Game/Foo.A").is_none());

    // Swept packages load again from storage
    let done = Completions::default();
    let id = loader.load(done.track(LoadRequest::new("/Game/Foo")));
    loader.flush(Some(id));
    assert_eq!(done.all()[0].result, LoadResult::Success);
    assert_eq!(loader.stats().headers_parsed, 2);
    assert!(world.find("/Game/Foo.A").is_some());
}

#[test]
fn test_sweep_refuses_imported_package() {
    let world = foo_bar_world(CompletionMode::Manual);
    let loader = world.start(config(0));
    let foo = PackageId::from_name("/Game/Foo");

    let id = loader.load(LoadRequest::new("/Game/Bar"));
    loader.tick(None);
    assert_eq!(world.storage.pending_count(), 2);

    // Foo's read was issued first; finish Foo while Bar still waits
    assert!(world.storage.complete_next());
    for _ in 0..16 {
        if world.registry.loaded_root(foo).is_some() {
            break;
        }
        loader.tick(None);
    }
    let loaded = world.registry.loaded_ref(foo).unwrap();
    assert!(loaded.all_exports_loaded());
    assert_eq!(loaded.ref_count(), 1);

    // A collector that ignores pins still cannot take Foo from under Bar
    let gc_view = world.gc.unreachable_objects(world.registry.objects());
    assert!(gc_view.iter().all(|o| !o.path().starts_with("/Game/Foo")));
    let report = loader.notify_unreachable(&world.objects_under("/Game/Foo"));
    assert_eq!(report.refused, 3);
    assert_eq!(report.objects_removed, 0);
    assert!(world.find("/Game/Foo.A").is_some());

    world.storage.complete_all();
    loader.flush(Some(id));
    assert_eq!(world.registry.loaded_ref(foo).unwrap().ref_count(), 0);

    let report = loader.notify_unreachable(&world.objects_under("/Game/Foo"));
    assert_eq!(report.objects_removed, 3);
    assert_eq!(report.refused, 0);
}

#[test]
fn test_finished_roots_form_clusters() {
    let world = foo_bar_world(CompletionMode::Deferred);
    let mut cfg = config(2);
    cfg.create_clusters = true;
    let loader = world.start(cfg);
    let done = Completions::default();

    let id = loader.load(done.track(LoadRequest::new("/Game/Bar")));
    loader.flush(Some(id));

    let bar = done.all()[0].root.clone().unwrap();
    let foo = world.find("/Game/Foo").unwrap();
    let clusters = world.gc.clusters();
    assert!(clusters.contains(&bar.id()));
    assert!(clusters.contains(&foo.id()));
}

#[test]
fn test_no_clusters_by_default() {
    let world = foo_bar_world(CompletionMode::Immediate);
    let loader = world.start(config(0));
    loader.flush(Some(loader.load(LoadRequest::new("/Game/Bar"))));
    assert!(world.gc.clusters().is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_loaded_refs_track_acquires(ops in prop::collection::vec(any::<bool>(), 1..48)) {
        let world = foo_bar_world(CompletionMode::Immediate);
        let loader = world.start(config(0));
        let foo = PackageId::from_name("/Game/Foo");
        loader.flush(Some(loader.load(LoadRequest::new("/Game/Foo"))));
        let root = world.registry.loaded_root(foo).unwrap();

        let mut held = 0u32;
        for acquire in ops {
            if acquire {
                held += 1;
                prop_assert_eq!(world.registry.acquire_loaded_ref(foo), held);
            } else {
                let released = world.registry.release_loaded_ref(foo);
                if held == 0 {
                    prop_assert!(released.is_err());
                } else {
                    held -= 1;
                    prop_assert_eq!(released.ok(), Some(held));
                }
            }
            prop_assert_eq!(world.gc.is_pinned(&root), held > 0);
        }

        let report = loader.notify_unreachable(&[root]);
        if held > 0 {
            prop_assert_eq!(report.refused, 1);
            prop_assert!(world.registry.loaded_root(foo).is_some());
        } else {
            prop_assert_eq!(report.packages_removed, 1);
            prop_assert!(world.registry.loaded_root(foo).is_none());
        }
    }
}
