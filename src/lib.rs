//! pkgflow: asynchronous package loading
//!
//! Packages are read from block storage under a byte budget. Their exports
//! are created, serialized and post-loaded by a graph of small nodes that
//! run on worker threads, and results come back through completion
//! callbacks run from [`AsyncLoader::tick`].
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use pkgflow::package::builder::{ContainerBuilder, ExportSpec, PackageBuilder};
//! use pkgflow::package::registry::Registry;
//! use pkgflow::package::{LoadRequest, ObjectIndex};
//! use pkgflow::package::store::ContainerId;
//! use pkgflow::runtime::gc::NoCollector;
//! use pkgflow::storage::MemoryStorage;
//! use pkgflow::util::config::LoaderConfig;
//! use pkgflow::AsyncLoader;
//!
//! let mut foo = PackageBuilder::new("/Game/Foo");
//! let blob = foo.import(ObjectIndex::script_import("/Script/Core.Blob"));
//! foo.export(ExportSpec::new("Mesh", blob).payload(vec![1, 2, 3]));
//!
//! let registry = Registry::init(Arc::new(NoCollector), None);
//! let storage = Arc::new(MemoryStorage::default());
//! ContainerBuilder::new(ContainerId(1)).package(&foo).install(&registry, &storage);
//!
//! let loader = AsyncLoader::start(LoaderConfig::default(), registry.clone(), storage);
//! let id = loader.load(LoadRequest::new("/Game/Foo"));
//! loader.flush(Some(id));
//! assert!(registry.objects().find("/Game/Foo.Mesh").is_some());
//! ```

#![warn(rust_2018_idioms)]

// Public modules
pub mod demo;
pub mod object;
pub mod package;
pub mod runtime;
pub mod storage;

// Utility modules
pub mod util;

// Re-exports
pub use anyhow::{Context, Result};
pub use thiserror::Error;

pub use package::{LoadCompletion, LoadRequest, LoadResult, PackageId, RequestId};
pub use runtime::scheduler::AsyncLoader;

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::package::header::parse_header;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const NAME: &str = "pkgflow";

/// Print the header of a package file
pub fn dump_package(path: &Path) -> Result<()> {
    debug!("inspecting {}", path.display());
    let data = fs::read(path).with_context(|| format!("Failed to read package: {}", path.display()))?;
    let header = parse_header(&data)
        .with_context(|| format!("Failed to parse package: {}", path.display()))?;

    println!("=== Package {} ===\n", header.name());

    // Summary
    println!("--- Summary ---");
    println!("Magic: {:#010X}", header.summary.magic);
    println!("Header Size: {} bytes", header.summary.header_size);
    println!("Total Size: {} bytes", data.len());
    if let Some(source) = header.source_name() {
        println!("Source Name: {}", source);
    }
    println!("Flags: {:#010X}\n", header.summary.package_flags);

    println!("--- Names ({} entries) ---", header.names.len());
    for (i, name) in header.names.iter().enumerate() {
        println!("  [{}] {}", i, name);
    }
    println!();

    println!("--- Imports ({} entries) ---", header.imports.len());
    for (i, import) in header.imports.iter().enumerate() {
        println!("  [{}] {:?}", i, import);
    }
    if header.imports.is_empty() {
        println!("  (empty)");
    }
    println!();

    println!("--- Exports ({} entries) ---", header.exports.len());
    for (i, export) in header.exports.iter().enumerate() {
        println!(
            "  [{}] {} class={:?} outer={:?} bytes={}@{} flags={:?} filter={:?}{}",
            i,
            header.name_at(export.object_name).unwrap_or("?"),
            export.class,
            export.outer,
            export.serial_size,
            export.serial_offset,
            export.object_flags,
            export.filter_flags,
            if export.public_index().is_some() { " public" } else { "" }
        );
    }
    println!();

    println!("--- Bundles ({} entries) ---", header.bundles.len());
    for (i, bundle) in header.bundles.iter().enumerate() {
        let entries: Vec<String> = bundle
            .entries
            .iter()
            .map(|entry| format!("{:?}({})", entry.command, entry.export_index))
            .collect();
        println!("  [{}] {}", i, entries.join(", "));
    }
    println!();

    println!("--- Arcs ({} imported packages) ---", header.arcs.len());
    for package in &header.arcs {
        println!("  {} -> {:?}", package.imported_package, package.arcs);
    }

    Ok(())
}
