//! Package loading error types

use thiserror::Error;

use super::PackageId;

/// Why a load, or one export of it, did not produce an object.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
    /// No store entry: the package is not mounted
    #[error("package {name} is not mounted")]
    Missing { name: String },

    /// Storage returned an error for the package payload
    #[error("I/O failure reading {package}: {reason}")]
    IoFailure { package: PackageId, reason: String },

    /// An export consumed a different number of bytes than it declared
    #[error(
        "export {export} of {package} declared {declared} bytes but serialization consumed {consumed}"
    )]
    SerializationMismatch {
        package: PackageId,
        export: u32,
        declared: u64,
        consumed: u64,
    },

    /// Class, outer, super or template of an export could not be resolved
    #[error("export {export} of {package} could not be constructed: {reason}")]
    ExportConstruction {
        package: PackageId,
        export: u32,
        reason: String,
    },

    /// Header or export ranges are structurally invalid
    #[error("corrupt package {package}: {reason}")]
    CorruptHeader { package: PackageId, reason: String },

    /// An export depended on an import that failed or is missing
    #[error("{package} depends on {import}, which did not load")]
    ImportFailed { package: PackageId, import: PackageId },

    /// The request was canceled before completion
    #[error("load of {package} was canceled")]
    Canceled { package: PackageId },
}

/// Structural faults in the package wire layout
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("buffer too small: need {needed} bytes at offset {offset}, have {len}")]
    Truncated {
        offset: usize,
        needed: usize,
        len: usize,
    },

    #[error("bad magic {0:#010x}")]
    BadMagic(u32),

    #[error("{section} section [{offset}, +{size}) lies outside the {limit}-byte header")]
    SectionOutOfRange {
        section: &'static str,
        offset: u64,
        size: u64,
        limit: u64,
    },

    #[error("export {export} payload [{offset}, +{size}) lies outside [{header_size}, {len})")]
    ExportOutOfRange {
        export: u32,
        offset: u64,
        size: u64,
        header_size: u64,
        len: u64,
    },

    #[error("name index {index} out of range ({count} names)")]
    BadNameIndex { index: u32, count: usize },

    #[error("bundle {bundle} references export {export} of {count}")]
    BadBundleEntry { bundle: u32, export: u32, count: u32 },

    #[error("unknown bundle command {0}")]
    BadCommand(u32),

    #[error("name {0} is not valid UTF-8")]
    BadName(u32),
}

/// Faults raised by the bounded export reader
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArchiveError {
    /// A read past the export's declared byte range
    #[error("read of {requested} bytes at {position} overruns export of {size} bytes")]
    OutOfBounds {
        position: usize,
        requested: usize,
        size: usize,
    },

    #[error("name index {0} out of range")]
    BadNameIndex(u32),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid value: {0}")]
    InvalidData(String),
}

impl ArchiveError {
    /// Overruns are integrity violations; everything else is the object's own failure
    #[inline]
    pub fn is_overrun(&self) -> bool {
        matches!(self, ArchiveError::OutOfBounds { .. })
    }
}

/// Registry bookkeeping faults
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("release of {package} without a matching acquire")]
    RefUnderflow { package: PackageId },

    #[error("{package} is still referenced by {refs} importer(s)")]
    StillReferenced { package: PackageId, refs: u32 },
}

/// Result type for load operations
pub type PackageResult<T> = Result<T, LoadError>;

/// Result type for header parsing
pub type HeaderResult<T> = Result<T, HeaderError>;
