//! 容器挂载：重定向、本地化、自定义名称和导出过滤

use pkgflow::object::builtin::BLOB_CLASS_PATH;
use pkgflow::object::ExportFilterFlags;
use pkgflow::package::builder::{ContainerBuilder, ExportSpec, PackageBuilder};
use pkgflow::package::{ContainerId, ObjectIndex};
use pkgflow::storage::CompletionMode;
use pkgflow::util::config::RuntimeTarget;
use pkgflow::{LoadRequest, LoadResult, PackageId};

use crate::common::{blob_package, config, linking_package, Completions, World, CONTAINER};

/// Sorted paths of the live objects under `prefix`
fn paths_under(
    world: &World,
    prefix: &str,
) -> Vec<String> {
    let mut paths: Vec<_> = world
        .objects_under(prefix)
        .iter()
        .map(|object| object.path().to_string())
        .collect();
    paths.sort();
    paths
}

#[test]
fn test_redirected_request_keeps_logical_name() {
    let world = World::new(CompletionMode::Immediate);
    world.install(
        ContainerBuilder::new(CONTAINER)
            .package(&blob_package("/Game/Real", &["Data"]))
            .redirect("/Game/Alias", "/Game/Real"),
    );
    let loader = world.start(config(0));
    let done = Completions::default();

    let alias = loader.load(done.track(LoadRequest::new("/Game/Alias")));
    let real = loader.load(done.track(LoadRequest::new("/Game/Real")));
    loader.flush(None);

    let alias = &done.for_request(alias)[0];
    assert_eq!(alias.result, LoadResult::Success);
    assert_eq!(alias.package_name, "/Game/Alias");
    assert_eq!(done.for_request(real)[0].package_name, "/Game/Real");
    assert_eq!(alias.root.as_ref().map(|r| r.path()), Some("/Game/Real"));

    // Both names share one unit and one read
    assert_eq!(loader.stats().units_created, 1);
    assert_eq!(world.storage.read_count(), 1);
}

#[test]
fn test_redirect_rewrites_installed_imports() {
    let world = World::new(CompletionMode::Immediate);
    world.install(
        ContainerBuilder::new(CONTAINER).package(&linking_package("/Game/User", "/Game/Old", "Data")),
    );
    world.install(
        ContainerBuilder::new(ContainerId(2))
            .package(&blob_package("/Game/New", &["Data"]))
            .redirect("/Game/Old", "/Game/New"),
    );

    let entry = world
        .registry
        .find_store_entry(PackageId::from_name("/Game/User"))
        .unwrap();
    assert_eq!(entry.imported_packages, vec![PackageId::from_name("/Game/New")]);

    let loader = world.start(config(0));
    loader.flush(Some(loader.load(LoadRequest::new("/Game/User"))));
    assert_eq!(loader.stats().units_created, 2);
    assert!(world.registry.loaded_root(PackageId::from_name("/Game/New")).is_some());
}

fn localized_world(culture: Option<&str>) -> World {
    let world = World::with_culture(CompletionMode::Immediate, culture);
    world.install(
        ContainerBuilder::new(CONTAINER)
            .package(&blob_package("/Game/Text", &["English"]))
            .package(&blob_package("/Game/Text_fr", &["French"]))
            .localized("fr", "/Game/Text", "/Game/Text_fr"),
    );
    world
}

#[test]
fn test_localized_override_follows_culture() {
    let world = localized_world(Some("fr"));
    let loader = world.start(config(0));
    loader.flush(Some(loader.load(LoadRequest::new("/Game/Text"))));
    assert_eq!(
        paths_under(&world, "/Game/Text"),
        vec!["/Game/Text_fr", "/Game/Text_fr.French"]
    );

    let world = localized_world(None);
    let loader = world.start(config(0));
    loader.flush(Some(loader.load(LoadRequest::new("/Game/Text"))));
    assert_eq!(
        paths_under(&world, "/Game/Text"),
        vec!["/Game/Text", "/Game/Text.English"]
    );
}

#[test]
fn test_custom_name_loads_a_separate_copy() {
    let world = World::new(CompletionMode::Immediate);
    world.install(ContainerBuilder::new(CONTAINER).package(&blob_package("/Game/Foo", &["A"])));
    let loader = world.start(config(0));
    let done = Completions::default();

    let copy = loader.load(done.track(LoadRequest::new("/Game/Foo").with_custom_name("/Temp/Foo_1")));
    loader.flush(Some(copy));

    let seen = &done.for_request(copy)[0];
    assert_eq!(seen.result, LoadResult::Success);
    assert_eq!(seen.package_name, "/Temp/Foo_1");
    assert_eq!(seen.root.as_ref().map(|r| r.path()), Some("/Temp/Foo_1"));
    assert!(world.find("/Temp/Foo_1.A").is_some());

    // The copy does not publish Foo's exports
    let public = ObjectIndex::package_import(PackageId::from_name("/Game/Foo"), "A");
    assert!(world.registry.resolve_import(public).is_none());
    assert!(world.registry.loaded_root(PackageId::from_name("/Game/Foo")).is_none());

    let original = loader.load(done.track(LoadRequest::new("/Game/Foo")));
    loader.flush(Some(original));
    assert_eq!(loader.stats().units_created, 2);
    assert!(world.registry.resolve_import(public).is_some());
}

#[test]
fn test_filtered_exports_are_skipped() {
    let mut builder = PackageBuilder::new("/Game/Split");
    let blob = builder.import(ObjectIndex::script_import(BLOB_CLASS_PATH));
    builder.export(ExportSpec::new("Shared", blob).payload(vec![1; 8]));
    builder.export(
        ExportSpec::new("ServerOnly", blob)
            .filter(ExportFilterFlags::NOT_FOR_CLIENT)
            .payload(vec![2; 8]),
    );
    builder.export(
        ExportSpec::new("ClientOnly", blob)
            .filter(ExportFilterFlags::NOT_FOR_SERVER)
            .payload(vec![3; 8]),
    );

    for (target, expected) in [
        (RuntimeTarget::Client, vec!["ClientOnly", "Shared"]),
        (RuntimeTarget::Server, vec!["ServerOnly", "Shared"]),
        (RuntimeTarget::Standalone, vec!["ClientOnly", "ServerOnly", "Shared"]),
    ] {
        let world = World::new(CompletionMode::Immediate);
        world.install(ContainerBuilder::new(CONTAINER).package(&builder));
        let mut cfg = config(0);
        cfg.target = target;
        let loader = world.start(cfg);
        let done = Completions::default();
        let id = loader.load(done.track(LoadRequest::new("/Game/Split")));
        loader.flush(Some(id));

        assert_eq!(done.all()[0].result, LoadResult::Success, "{:?}", target);
        let expected: Vec<_> = std::iter::once("/Game/Split".to_string())
            .chain(expected.iter().map(|name| format!("/Game/Split.{}", name)))
            .collect();
        assert_eq!(paths_under(&world, "/Game/Split"), expected, "{:?}", target);
    }
}

#[test]
fn test_mount_while_loading() {
    let world = World::new(CompletionMode::Manual);
    world.install(ContainerBuilder::new(CONTAINER).package(&blob_package("/Game/Foo", &["A"])));
    let loader = world.start(config(0));
    let done = Completions::default();

    let foo = loader.load(done.track(LoadRequest::new("/Game/Foo")));
    loader.tick(None);

    world.install(ContainerBuilder::new(ContainerId(2)).package(&blob_package("/Game/Late", &["B"])));
    let late = loader.load(done.track(LoadRequest::new("/Game/Late")));
    loader.tick(None);
    world.storage.complete_all();
    loader.flush(None);

    assert_eq!(done.for_request(foo)[0].result, LoadResult::Success);
    assert_eq!(done.for_request(late)[0].result, LoadResult::Success);
    assert_eq!(world.registry.mounted_containers(), vec![CONTAINER, ContainerId(2)]);
}
