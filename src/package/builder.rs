//! Writer for synthetic packages in the loader's wire layout
//!
//! Used to assemble in-memory containers for tests, benchmarks and the
//! `demo` command.

use std::collections::HashMap;

use crate::object::{ExportFilterFlags, ObjectFlags};
use crate::util::hash::fnv1a_hash_lower;

use super::header::{
    BundleEntry, ImportedPackageArcs, PackageSummary, EXPORT_ENTRY_SIZE, NO_NAME, PACKAGE_MAGIC,
    SUMMARY_SIZE,
};
use super::registry::Registry;
use super::store::{ContainerDescriptor, ContainerId, ContainerPackage, StoreEntry};
use super::{ObjectIndex, PackageId};
use crate::storage::MemoryStorage;

/// One export to be written
#[derive(Debug, Clone)]
pub struct ExportSpec {
    pub name: String,
    pub class: ObjectIndex,
    pub outer: ObjectIndex,
    pub super_struct: ObjectIndex,
    pub template: ObjectIndex,
    pub public: bool,
    pub flags: ObjectFlags,
    pub filter: ExportFilterFlags,
    pub payload: Vec<u8>,
}

impl ExportSpec {
    pub fn new(
        name: impl Into<String>,
        class: ObjectIndex,
    ) -> Self {
        Self {
            name: name.into(),
            class,
            outer: ObjectIndex::NULL,
            super_struct: ObjectIndex::NULL,
            template: ObjectIndex::NULL,
            public: false,
            flags: ObjectFlags::empty(),
            filter: ExportFilterFlags::empty(),
            payload: Vec::new(),
        }
    }

    pub fn outer(
        mut self,
        outer: ObjectIndex,
    ) -> Self {
        self.outer = outer;
        self
    }

    pub fn super_struct(
        mut self,
        super_struct: ObjectIndex,
    ) -> Self {
        self.super_struct = super_struct;
        self
    }

    pub fn template(
        mut self,
        template: ObjectIndex,
    ) -> Self {
        self.template = template;
        self
    }

    /// Make the export resolvable from other packages
    pub fn public(mut self) -> Self {
        self.public = true;
        self.flags |= ObjectFlags::PUBLIC;
        self
    }

    pub fn flags(
        mut self,
        flags: ObjectFlags,
    ) -> Self {
        self.flags |= flags;
        self
    }

    pub fn filter(
        mut self,
        filter: ExportFilterFlags,
    ) -> Self {
        self.filter = filter;
        self
    }

    pub fn payload(
        mut self,
        payload: Vec<u8>,
    ) -> Self {
        self.payload = payload;
        self
    }
}

/// Builds one package buffer
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    package_id: PackageId,
    name: u32,
    source_name: u32,
    package_flags: u32,
    names: Vec<String>,
    name_lookup: HashMap<String, u32>,
    imports: Vec<ObjectIndex>,
    imported_packages: Vec<PackageId>,
    exports: Vec<ExportSpec>,
    export_names: Vec<u32>,
    bundles: Vec<Vec<BundleEntry>>,
    arcs: Vec<ImportedPackageArcs>,
}

impl PackageBuilder {
    pub fn new(name: &str) -> Self {
        let mut builder = Self {
            package_id: PackageId::from_name(name),
            name: 0,
            source_name: NO_NAME,
            package_flags: 0,
            names: Vec::new(),
            name_lookup: HashMap::new(),
            imports: Vec::new(),
            imported_packages: Vec::new(),
            exports: Vec::new(),
            export_names: Vec::new(),
            bundles: Vec::new(),
            arcs: Vec::new(),
        };
        builder.name = builder.name_index(name);
        builder
    }

    #[inline]
    pub fn package_id(&self) -> PackageId {
        self.package_id
    }

    pub fn name(&self) -> &str {
        &self.names[self.name as usize]
    }

    /// Index of `name` in the local name table, adding it if needed
    pub fn name_index(
        &mut self,
        name: &str,
    ) -> u32 {
        if let Some(index) = self.name_lookup.get(name) {
            return *index;
        }
        let index = self.names.len() as u32;
        self.names.push(name.to_string());
        self.name_lookup.insert(name.to_string(), index);
        index
    }

    pub fn source_name(
        &mut self,
        name: &str,
    ) -> &mut Self {
        self.source_name = self.name_index(name);
        self
    }

    pub fn package_flags(
        &mut self,
        flags: u32,
    ) -> &mut Self {
        self.package_flags = flags;
        self
    }

    /// Record an entry in the import map
    pub fn import(
        &mut self,
        index: ObjectIndex,
    ) -> ObjectIndex {
        if !self.imports.contains(&index) {
            self.imports.push(index);
        }
        index
    }

    /// Import the public export `export_name` of `package`, also recording
    /// `package` as a static dependency
    pub fn import_export(
        &mut self,
        package: &str,
        export_name: &str,
    ) -> ObjectIndex {
        let package_id = self.depends_on_package(package);
        self.import(ObjectIndex::package_import(package_id, export_name))
    }

    /// Declare a static package dependency
    pub fn depends_on_package(
        &mut self,
        package: &str,
    ) -> PackageId {
        let id = PackageId::from_name(package);
        if !self.imported_packages.contains(&id) {
            self.imported_packages.push(id);
        }
        id
    }

    /// Add an export; returns its local index
    pub fn export(
        &mut self,
        spec: ExportSpec,
    ) -> ObjectIndex {
        let index = self.exports.len() as u32;
        let name = self.name_index(&spec.name);
        self.export_names.push(name);
        self.exports.push(spec);
        ObjectIndex::export(index)
    }

    /// Add an explicit bundle. Without any, `build` writes a single bundle
    /// that creates every export and then serializes every export.
    pub fn bundle(
        &mut self,
        entries: Vec<BundleEntry>,
    ) -> &mut Self {
        self.bundles.push(entries);
        self
    }

    /// Order our bundle `to` after bundle `from` of `imported`
    pub fn arc(
        &mut self,
        imported: PackageId,
        from: u32,
        to: u32,
    ) -> &mut Self {
        match self
            .arcs
            .iter_mut()
            .find(|arcs| arcs.imported_package == imported)
        {
            Some(arcs) => arcs.arcs.push((from, to)),
            None => self.arcs.push(ImportedPackageArcs {
                imported_package: imported,
                arcs: vec![(from, to)],
            }),
        }
        self
    }

    fn effective_bundles(&self) -> Vec<Vec<BundleEntry>> {
        if !self.bundles.is_empty() || self.exports.is_empty() {
            return self.bundles.clone();
        }
        let count = self.exports.len() as u32;
        let creates = (0..count).map(BundleEntry::create);
        let serializes = (0..count).map(BundleEntry::serialize);
        vec![creates.chain(serializes).collect()]
    }

    /// Store entry matching what `build` produces
    pub fn store_entry(
        &self,
        load_order: u32,
    ) -> StoreEntry {
        StoreEntry {
            export_count: self.exports.len() as u32,
            export_bundle_count: self.effective_bundles().len() as u32,
            export_bundles_size: self.build().len() as u64,
            load_order,
            imported_packages: self.imported_packages.clone(),
            container: Default::default(),
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let bundles = self.effective_bundles();

        let name_map = self.encode_names();
        let import_map: Vec<u8> = self
            .imports
            .iter()
            .flat_map(|index| index.to_raw().to_le_bytes())
            .collect();
        let bundle_data = encode_bundles(&bundles);
        let graph_data = self.encode_graph();

        let name_map_offset = SUMMARY_SIZE;
        let import_map_offset = name_map_offset + name_map.len();
        let export_map_offset = import_map_offset + import_map.len();
        let export_bundles_offset = export_map_offset + self.exports.len() * EXPORT_ENTRY_SIZE;
        let graph_data_offset = export_bundles_offset + bundle_data.len();
        let header_size = graph_data_offset + graph_data.len();

        let summary = PackageSummary {
            magic: PACKAGE_MAGIC,
            header_size: header_size as u32,
            name: self.name,
            source_name: self.source_name,
            package_flags: self.package_flags,
            name_map_offset: name_map_offset as u32,
            name_map_size: name_map.len() as u32,
            import_map_offset: import_map_offset as u32,
            import_count: self.imports.len() as u32,
            export_map_offset: export_map_offset as u32,
            export_count: self.exports.len() as u32,
            export_bundles_offset: export_bundles_offset as u32,
            export_bundles_size: bundle_data.len() as u32,
            graph_data_offset: graph_data_offset as u32,
            graph_data_size: graph_data.len() as u32,
            reserved: 0,
        };

        let payload_len: usize = self.exports.iter().map(|e| e.payload.len()).sum();
        let mut out = Vec::with_capacity(header_size + payload_len);
        for field in summary.fields() {
            out.extend_from_slice(&field.to_le_bytes());
        }
        out.extend_from_slice(&name_map);
        out.extend_from_slice(&import_map);

        let mut serial_offset = header_size as u64;
        for (export, name) in self.exports.iter().zip(&self.export_names) {
            let public_hash = if export.public {
                ObjectIndex::package_import(self.package_id, &export.name).to_raw()
            } else {
                0
            };
            out.extend_from_slice(&serial_offset.to_le_bytes());
            out.extend_from_slice(&(export.payload.len() as u64).to_le_bytes());
            out.extend_from_slice(&name.to_le_bytes());
            out.extend_from_slice(&[0u8; 4]);
            for index in [
                export.outer,
                export.class,
                export.super_struct,
                export.template,
            ] {
                out.extend_from_slice(&index.to_raw().to_le_bytes());
            }
            out.extend_from_slice(&public_hash.to_le_bytes());
            out.extend_from_slice(&export.flags.bits().to_le_bytes());
            out.push(export.filter.bits());
            out.extend_from_slice(&[0u8; 3]);
            serial_offset += export.payload.len() as u64;
        }

        out.extend_from_slice(&bundle_data);
        out.extend_from_slice(&graph_data);
        debug_assert_eq!(out.len(), header_size);

        for export in &self.exports {
            out.extend_from_slice(&export.payload);
        }
        out
    }

    fn encode_names(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.names.len() as u32).to_le_bytes());
        for name in &self.names {
            out.extend_from_slice(&fnv1a_hash_lower(name).to_le_bytes());
        }
        for name in &self.names {
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
        }
        out
    }

    fn encode_graph(&self) -> Vec<u8> {
        if self.arcs.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();
        out.extend_from_slice(&(self.arcs.len() as u32).to_le_bytes());
        for package in &self.arcs {
            out.extend_from_slice(&package.imported_package.value().to_le_bytes());
            out.extend_from_slice(&(package.arcs.len() as u32).to_le_bytes());
            for (from, to) in &package.arcs {
                out.extend_from_slice(&from.to_le_bytes());
                out.extend_from_slice(&to.to_le_bytes());
            }
        }
        out
    }
}

/// Packages, redirects and localized overrides making up one container
#[derive(Debug, Clone)]
pub struct ContainerBuilder {
    id: ContainerId,
    packages: Vec<PackageBuilder>,
    redirects: Vec<(PackageId, PackageId)>,
    localized: Vec<(String, PackageId, PackageId)>,
}

impl ContainerBuilder {
    pub fn new(id: ContainerId) -> Self {
        Self {
            id,
            packages: Vec::new(),
            redirects: Vec::new(),
            localized: Vec::new(),
        }
    }

    /// Add a package; load order follows insertion order
    pub fn package(
        mut self,
        package: &PackageBuilder,
    ) -> Self {
        self.packages.push(package.clone());
        self
    }

    pub fn redirect(
        mut self,
        source: &str,
        target: &str,
    ) -> Self {
        self.redirects
            .push((PackageId::from_name(source), PackageId::from_name(target)));
        self
    }

    pub fn localized(
        mut self,
        culture: &str,
        source: &str,
        target: &str,
    ) -> Self {
        self.localized.push((
            culture.to_string(),
            PackageId::from_name(source),
            PackageId::from_name(target),
        ));
        self
    }

    /// The table of contents the storage layer would publish
    pub fn descriptor(&self) -> ContainerDescriptor {
        let mut descriptor = ContainerDescriptor::new(self.id);
        for (order, package) in self.packages.iter().enumerate() {
            descriptor = descriptor.with_package(ContainerPackage::new(
                package.name(),
                package.store_entry(order as u32),
            ));
        }
        for (source, target) in &self.redirects {
            descriptor = descriptor.with_redirect(*source, *target);
        }
        for (culture, source, target) in &self.localized {
            descriptor = descriptor.with_localized(culture.clone(), *source, *target);
        }
        descriptor
    }

    /// Put every package's bytes in `storage` and mount the container
    pub fn install(
        &self,
        registry: &Registry,
        storage: &MemoryStorage,
    ) -> ContainerId {
        for package in &self.packages {
            storage.insert_package(self.id, package.package_id(), package.build());
        }
        registry.mount_container(self.descriptor());
        self.id
    }
}

fn encode_bundles(bundles: &[Vec<BundleEntry>]) -> Vec<u8> {
    if bundles.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    out.extend_from_slice(&(bundles.len() as u32).to_le_bytes());
    let mut first = 0u32;
    for bundle in bundles {
        out.extend_from_slice(&first.to_le_bytes());
        out.extend_from_slice(&(bundle.len() as u32).to_le_bytes());
        first += bundle.len() as u32;
    }
    for entry in bundles.iter().flatten() {
        out.extend_from_slice(&entry.export_index.to_le_bytes());
        out.extend_from_slice(&entry.command.as_u32().to_le_bytes());
    }
    out
}
