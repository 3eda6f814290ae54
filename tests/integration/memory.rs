//! I/O 预算：在途字节数不超过配置上限，读请求按优先级发出

use pkgflow::package::builder::{ContainerBuilder, PackageBuilder};
use pkgflow::storage::CompletionMode;
use pkgflow::{LoadRequest, LoadResult};

use crate::common::{blob_package, config, Completions, World, CONTAINER};

const PACKAGES: usize = 64;

/// Same-sized packages `/Mem/P00`, `/Mem/P01`, ...
fn same_sized(count: usize) -> Vec<PackageBuilder> {
    (0..count)
        .map(|i| blob_package(&format!("/Mem/P{:02}", i), &["Data"]))
        .collect()
}

fn install(
    world: &World,
    packages: &[PackageBuilder],
) {
    let container = packages
        .iter()
        .fold(ContainerBuilder::new(CONTAINER), |container, package| {
            container.package(package)
        });
    world.install(container);
}

#[test]
fn test_in_flight_bytes_stay_under_budget() {
    let packages = same_sized(PACKAGES);
    let size = packages[0].build().len() as u64;
    assert!(packages.iter().all(|p| p.build().len() as u64 == size));

    let world = World::new(CompletionMode::Manual);
    install(&world, &packages);
    let mut cfg = config(0);
    cfg.io_budget_bytes = size * 3;
    let loader = world.start(cfg);
    let done = Completions::default();

    // Over a thousand requests for 64 packages
    for round in 0..16 {
        for package in &packages {
            let request = LoadRequest::new(package.name()).with_priority(round % 3);
            loader.load(done.track(request));
        }
    }
    loader.tick(None);
    assert_eq!(world.storage.pending_count(), 3);

    loop {
        assert!(loader.in_flight_bytes() <= size * 3);
        assert!(world.storage.pending_count() <= 3);
        if !world.storage.complete_next() {
            break;
        }
        loader.tick(None);
    }
    loader.flush(None);

    assert_eq!(done.len(), PACKAGES * 16);
    assert!(done.all().iter().all(|c| c.result == LoadResult::Success));
    let stats = loader.stats();
    assert_eq!(stats.units_created, PACKAGES);
    assert_eq!(stats.peak_in_flight_bytes, size * 3);
    assert_eq!(loader.in_flight_bytes(), 0);
}

#[test]
fn test_read_larger_than_budget_issues_alone() {
    let packages = same_sized(4);
    let world = World::new(CompletionMode::Manual);
    install(&world, &packages);
    let mut cfg = config(0);
    cfg.io_budget_bytes = 1;
    let loader = world.start(cfg);

    for package in &packages {
        loader.load(LoadRequest::new(package.name()));
    }
    loader.tick(None);

    let mut completed = 0;
    while world.storage.pending_count() == 1 {
        assert!(world.storage.complete_next());
        completed += 1;
        loader.tick(None);
    }
    assert_eq!(completed, 4);
    loader.flush(None);
    assert_eq!(loader.stats().succeeded, 4);
}

#[test]
fn test_reads_issue_by_priority_then_load_order() {
    let packages = same_sized(6);
    let size = packages[0].build().len() as u64;
    let world = World::new(CompletionMode::Manual);
    install(&world, &packages);
    let mut cfg = config(0);
    cfg.io_budget_bytes = size;
    let loader = world.start(cfg);
    let done = Completions::default();

    for (index, package) in packages.iter().enumerate() {
        let priority = if index == 5 { 10 } else { 0 };
        loader.load(done.track(LoadRequest::new(package.name()).with_priority(priority)));
    }
    loader.tick(None);
    while world.storage.complete_next() {
        loader.tick(None);
    }
    loader.flush(None);

    let order: Vec<_> = done.all().into_iter().map(|c| c.package_name).collect();
    assert_eq!(
        order,
        vec!["/Mem/P05", "/Mem/P00", "/Mem/P01", "/Mem/P02", "/Mem/P03", "/Mem/P04"]
    );
}
