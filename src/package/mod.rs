//! Package identities, load requests and the per-package loading pieces
//!
//! A package is a serialized object graph: a header (names, imports,
//! exports, bundles, inter-package arcs) followed by export payloads.

pub mod archive;
pub mod builder;
pub mod error;
pub mod header;
pub mod registry;
pub mod store;
pub mod unit;

use std::fmt;

use crate::object::ObjectHandle;
use crate::util::hash::{fnv1a_extend, fnv1a_hash_lower};

pub use error::{ArchiveError, HeaderError, LoadError, PackageResult, RegistryError};
pub use registry::Registry;
pub use store::{ContainerDescriptor, ContainerId, ContainerPackage, StoreEntry};

/// Stable 64-bit hash of a package's canonical path
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageId(u64);

impl PackageId {
    pub const INVALID: PackageId = PackageId(0);

    /// Hash a package path; case-insensitive
    pub fn from_name(name: &str) -> Self {
        let hash = fnv1a_hash_lower(name);
        // 0 is reserved for INVALID
        PackageId(if hash == 0 { 1 } else { hash })
    }

    #[inline]
    pub const fn from_raw(value: u64) -> Self {
        PackageId(value)
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for PackageId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "PackageId({:#018x})", self.0)
    }
}

impl fmt::Display for PackageId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

const INDEX_KIND_SHIFT: u32 = 62;
const INDEX_VALUE_MASK: u64 = (1 << INDEX_KIND_SHIFT) - 1;

/// What an [`ObjectIndex`] points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectIndexKind {
    /// An export of the same package, by local index
    Export,
    /// A built-in object registered at startup
    ScriptImport,
    /// A public export of another package
    PackageImport,
    Null,
}

/// Reference to an object from inside a package.
///
/// Local exports are addressed by index; everything else by a globally
/// stable hash so that every importer resolves to the same record.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectIndex(u64);

impl ObjectIndex {
    pub const NULL: ObjectIndex = ObjectIndex(u64::MAX);

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        ObjectIndex(raw)
    }

    #[inline]
    pub fn to_raw(&self) -> u64 {
        self.0
    }

    pub fn export(index: u32) -> Self {
        ObjectIndex(index as u64)
    }

    /// Index of a built-in object, e.g. `/Script/Core.Blob`
    pub fn script_import(path: &str) -> Self {
        Self::with_kind(1, fnv1a_hash_lower(path))
    }

    /// Index of the public export `export_name` of `package`
    pub fn package_import(
        package: PackageId,
        export_name: &str,
    ) -> Self {
        let hash = fnv1a_extend(
            fnv1a_hash_lower(export_name),
            &package.value().to_le_bytes(),
        );
        Self::with_kind(2, hash)
    }

    fn with_kind(
        kind: u64,
        value: u64,
    ) -> Self {
        ObjectIndex((kind << INDEX_KIND_SHIFT) | (value & INDEX_VALUE_MASK))
    }

    pub fn kind(&self) -> ObjectIndexKind {
        match self.0 >> INDEX_KIND_SHIFT {
            0 => ObjectIndexKind::Export,
            1 => ObjectIndexKind::ScriptImport,
            2 => ObjectIndexKind::PackageImport,
            _ => ObjectIndexKind::Null,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.kind() == ObjectIndexKind::Null
    }

    #[inline]
    pub fn is_import(&self) -> bool {
        matches!(
            self.kind(),
            ObjectIndexKind::ScriptImport | ObjectIndexKind::PackageImport
        )
    }

    /// Local export index, if this is one
    pub fn as_export(&self) -> Option<u32> {
        match self.kind() {
            ObjectIndexKind::Export => u32::try_from(self.0).ok(),
            _ => None,
        }
    }
}

impl fmt::Debug for ObjectIndex {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self.kind() {
            ObjectIndexKind::Export => write!(f, "Export({})", self.0),
            ObjectIndexKind::ScriptImport => {
                write!(f, "ScriptImport({:#x})", self.0 & INDEX_VALUE_MASK)
            }
            ObjectIndexKind::PackageImport => {
                write!(f, "PackageImport({:#x})", self.0 & INDEX_VALUE_MASK)
            }
            ObjectIndexKind::Null => write!(f, "Null"),
        }
    }
}

/// Load request id, unique per loader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

impl RequestId {
    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Final outcome reported to completion callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadResult {
    Success,
    Failed,
    Canceled,
}

/// Everything a completion callback receives
#[derive(Debug, Clone)]
pub struct LoadCompletion {
    pub request_id: RequestId,
    /// Logical name: the custom name if one was given, else the requested package name
    pub package_name: String,
    pub root: Option<ObjectHandle>,
    pub result: LoadResult,
    pub error: Option<LoadError>,
}

impl LoadCompletion {
    #[inline]
    pub fn is_success(&self) -> bool {
        self.result == LoadResult::Success
    }
}

pub type CompletionCallback = Box<dyn FnOnce(&LoadCompletion) + Send + 'static>;

/// A caller's load request, built fluently
///
/// ```rust
/// use pkgflow::package::LoadRequest;
///
/// let request = LoadRequest::new("/Game/Foo")
///     .with_priority(5)
///     .on_complete(|completion| println!("{} done", completion.package_name));
/// assert_eq!(request.priority(), 5);
/// ```
pub struct LoadRequest {
    package_name: String,
    custom_name: Option<String>,
    priority: i32,
    callback: Option<CompletionCallback>,
}

impl LoadRequest {
    pub fn new(package_name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            custom_name: None,
            priority: 0,
            callback: None,
        }
    }

    pub fn with_priority(
        mut self,
        priority: i32,
    ) -> Self {
        self.priority = priority;
        self
    }

    /// Load the package's data under a different logical name
    pub fn with_custom_name(
        mut self,
        name: impl Into<String>,
    ) -> Self {
        self.custom_name = Some(name.into());
        self
    }

    pub fn on_complete<F>(
        mut self,
        callback: F,
    ) -> Self
    where
        F: FnOnce(&LoadCompletion) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    #[inline]
    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    #[inline]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub(crate) fn into_descriptor(
        self,
        request_id: RequestId,
    ) -> LoadRequestDescriptor {
        LoadRequestDescriptor {
            request_id,
            priority: self.priority,
            package_id: PackageId::from_name(&self.package_name),
            package_name: self.package_name,
            custom_name: self.custom_name,
            redirect: None,
            callback: self.callback,
        }
    }
}

/// Snapshot of one request, owned by the loader until its callback runs
pub struct LoadRequestDescriptor {
    pub request_id: RequestId,
    pub priority: i32,
    pub package_name: String,
    /// Requested id, before redirects
    pub package_id: PackageId,
    pub custom_name: Option<String>,
    /// Disk id the request was redirected to, if any
    pub redirect: Option<PackageId>,
    pub callback: Option<CompletionCallback>,
}

impl LoadRequestDescriptor {
    /// Id whose data is actually read
    #[inline]
    pub fn disk_id(&self) -> PackageId {
        self.redirect.unwrap_or(self.package_id)
    }

    /// Name reported to callbacks
    pub fn logical_name(&self) -> &str {
        self.custom_name.as_deref().unwrap_or(&self.package_name)
    }
}

impl fmt::Debug for LoadRequestDescriptor {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("LoadRequestDescriptor")
            .field("request_id", &self.request_id)
            .field("priority", &self.priority)
            .field("package_name", &self.package_name)
            .field("package_id", &self.package_id)
            .field("custom_name", &self.custom_name)
            .field("redirect", &self.redirect)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}
