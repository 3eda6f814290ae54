//! Bounded reader over one export's serialized bytes

use std::fmt;

use crate::object::ObjectHandle;

use super::error::ArchiveError;
use super::ObjectIndex;

/// Resolves object references found inside export payloads
pub trait ObjectResolver {
    fn resolve(
        &self,
        index: ObjectIndex,
    ) -> Option<ObjectHandle>;
}

/// Resolver for payloads that carry no object references
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReferences;

impl ObjectResolver for NoReferences {
    fn resolve(
        &self,
        _index: ObjectIndex,
    ) -> Option<ObjectHandle> {
        None
    }
}

/// How an external read is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalReadMode {
    /// Return immediately; `true` once the read has finished
    Poll,
    /// Block until the read has finished, then return `true`
    Wait,
}

/// Async work an object started during serialization and which must finish
/// before its package's exports are considered loaded
pub type ExternalRead = Box<dyn FnMut(ExternalReadMode) -> bool + Send>;

/// Reader that can only see the bytes one export declared.
///
/// Every read is bounds-checked; overrunning the range is reported as
/// [`ArchiveError::OutOfBounds`], which the loader treats as corruption.
pub struct ExportArchive<'a> {
    data: &'a [u8],
    position: usize,
    names: &'a [String],
    resolver: &'a dyn ObjectResolver,
    external_reads: Vec<ExternalRead>,
}

impl<'a> ExportArchive<'a> {
    pub fn new(
        data: &'a [u8],
        names: &'a [String],
        resolver: &'a dyn ObjectResolver,
    ) -> Self {
        Self {
            data,
            position: 0,
            names,
            resolver,
            external_reads: Vec::new(),
        }
    }

    /// Bytes consumed so far
    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Declared size of the export
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    #[inline]
    pub fn is_at_end(&self) -> bool {
        self.position == self.data.len()
    }

    pub fn read_bytes(
        &mut self,
        count: usize,
    ) -> Result<&'a [u8], ArchiveError> {
        let end = self
            .position
            .checked_add(count)
            .filter(|end| *end <= self.data.len())
            .ok_or(ArchiveError::OutOfBounds {
                position: self.position,
                requested: count,
                size: self.data.len(),
            })?;
        let bytes = &self.data[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ArchiveError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, ArchiveError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, ArchiveError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ArchiveError::InvalidData(format!("bool byte {}", other))),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16, ArchiveError> {
        self.read_array().map(u16::from_le_bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32, ArchiveError> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_u64(&mut self) -> Result<u64, ArchiveError> {
        self.read_array().map(u64::from_le_bytes)
    }

    pub fn read_i64(&mut self) -> Result<i64, ArchiveError> {
        self.read_array().map(i64::from_le_bytes)
    }

    pub fn read_f64(&mut self) -> Result<f64, ArchiveError> {
        self.read_array().map(f64::from_le_bytes)
    }

    /// `u32` byte length followed by UTF-8
    pub fn read_string(&mut self) -> Result<String, ArchiveError> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| ArchiveError::InvalidUtf8)
    }

    /// `u32` index into the package's name table
    pub fn read_name(&mut self) -> Result<&'a str, ArchiveError> {
        let index = self.read_u32()?;
        self.names
            .get(index as usize)
            .map(String::as_str)
            .ok_or(ArchiveError::BadNameIndex(index))
    }

    /// Raw [`ObjectIndex`], resolved against exports and imports.
    ///
    /// Unresolvable references read as `None`; callers decide whether that
    /// is fatal for them.
    pub fn read_object(&mut self) -> Result<Option<ObjectHandle>, ArchiveError> {
        let index = ObjectIndex::from_raw(self.read_u64()?);
        if index.is_null() {
            return Ok(None);
        }
        Ok(self.resolver.resolve(index))
    }

    /// Register async work that must finish before the package completes
    pub fn add_external_read<F>(
        &mut self,
        read: F,
    ) where
        F: FnMut(ExternalReadMode) -> bool + Send + 'static,
    {
        self.external_reads.push(Box::new(read));
    }

    pub(crate) fn take_external_reads(&mut self) -> Vec<ExternalRead> {
        std::mem::take(&mut self.external_reads)
    }
}

impl fmt::Debug for ExportArchive<'_> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ExportArchive")
            .field("position", &self.position)
            .field("len", &self.data.len())
            .field("external_reads", &self.external_reads.len())
            .finish()
    }
}
