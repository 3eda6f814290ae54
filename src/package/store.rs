//! Container table-of-contents types

use std::fmt;

use super::PackageId;

/// Identifies a mounted container
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ContainerId(pub u64);

impl fmt::Debug for ContainerId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "ContainerId({})", self.0)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "container {}", self.0)
    }
}

/// Static per-package metadata from a container's table of contents
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoreEntry {
    pub export_count: u32,
    pub export_bundle_count: u32,
    /// Size of the whole package payload read in one request
    pub export_bundles_size: u64,
    pub load_order: u32,
    /// Static imports, in declaration order; redirects already applied
    pub imported_packages: Vec<PackageId>,
    /// Container the payload is read from; filled in at mount
    pub container: ContainerId,
}

/// One package in a container descriptor
#[derive(Debug, Clone)]
pub struct ContainerPackage {
    pub id: PackageId,
    pub name: String,
    pub entry: StoreEntry,
}

impl ContainerPackage {
    pub fn new(
        name: impl Into<String>,
        entry: StoreEntry,
    ) -> Self {
        let name = name.into();
        Self {
            id: PackageId::from_name(&name),
            name,
            entry,
        }
    }
}

/// Culture-specific replacement of one package by another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalizedPackage {
    pub culture: String,
    pub source: PackageId,
    pub target: PackageId,
}

/// What the storage layer pushes when a container becomes available
#[derive(Debug, Clone, Default)]
pub struct ContainerDescriptor {
    pub id: ContainerId,
    pub packages: Vec<ContainerPackage>,
    /// `(source, target)` remaps applied to requests and imports
    pub redirects: Vec<(PackageId, PackageId)>,
    pub localized: Vec<LocalizedPackage>,
}

impl ContainerDescriptor {
    pub fn new(id: ContainerId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn with_package(
        mut self,
        package: ContainerPackage,
    ) -> Self {
        self.packages.push(package);
        self
    }

    pub fn with_redirect(
        mut self,
        source: PackageId,
        target: PackageId,
    ) -> Self {
        self.redirects.push((source, target));
        self
    }

    pub fn with_localized(
        mut self,
        culture: impl Into<String>,
        source: PackageId,
        target: PackageId,
    ) -> Self {
        self.localized.push(LocalizedPackage {
            culture: culture.into(),
            source,
            target,
        });
        self
    }
}
