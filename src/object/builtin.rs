//! Built-in classes registered with every registry

use std::any::Any;

use super::{ClassInfo, EmptyBody, ObjectBody, ObjectHandle};
use crate::package::archive::ExportArchive;
use crate::package::builder::PackageBuilder;
use crate::package::error::ArchiveError;
use crate::package::ObjectIndex;

pub const CLASS_CLASS_PATH: &str = "/Script/Core.Class";
pub const PACKAGE_CLASS_PATH: &str = "/Script/Core.Package";
pub const BLOB_CLASS_PATH: &str = "/Script/Core.Blob";
pub const RECORD_CLASS_PATH: &str = "/Script/Core.Record";

/// `(path, class)` for every core class
pub fn core_classes() -> Vec<(&'static str, ClassInfo)> {
    vec![
        (
            CLASS_CLASS_PATH,
            ClassInfo::new("Class", || Box::new(EmptyBody)).thread_safe_post_load(true),
        ),
        (
            PACKAGE_CLASS_PATH,
            ClassInfo::new("Package", || Box::new(EmptyBody)).thread_safe_post_load(true),
        ),
        (
            BLOB_CLASS_PATH,
            ClassInfo::new("Blob", || Box::new(BlobBody::default())).thread_safe_post_load(true),
        ),
        (
            RECORD_CLASS_PATH,
            ClassInfo::new("Record", || Box::new(RecordBody::default())),
        ),
    ]
}

/// Opaque bytes; consumes whatever the export declared
#[derive(Debug, Default)]
pub struct BlobBody {
    pub bytes: Vec<u8>,
    pub post_loaded: bool,
}

impl ObjectBody for BlobBody {
    fn serialize(
        &mut self,
        archive: &mut ExportArchive<'_>,
    ) -> Result<(), ArchiveError> {
        self.bytes = archive.read_bytes(archive.remaining())?.to_vec();
        Ok(())
    }

    fn post_load(&mut self) {
        self.post_loaded = true;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

const TAG_INT: u8 = 0;
const TAG_FLOAT: u8 = 1;
const TAG_TEXT: u8 = 2;
const TAG_OBJECT: u8 = 3;

/// Decoded record field
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
    /// `None` when the reference did not resolve
    Object(Option<ObjectHandle>),
}

/// Named, typed fields
///
/// ```text
/// u32 count, then per field: u32 name index, u8 tag, value
/// ```
#[derive(Debug, Default)]
pub struct RecordBody {
    pub fields: Vec<(String, Value)>,
    pub post_loaded: bool,
}

impl RecordBody {
    pub fn get(
        &self,
        name: &str,
    ) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }
}

impl ObjectBody for RecordBody {
    fn serialize(
        &mut self,
        archive: &mut ExportArchive<'_>,
    ) -> Result<(), ArchiveError> {
        let count = archive.read_u32()?;
        self.fields.clear();
        for _ in 0..count {
            let name = archive.read_name()?.to_string();
            let value = match archive.read_u8()? {
                TAG_INT => Value::Int(archive.read_i64()?),
                TAG_FLOAT => Value::Float(archive.read_f64()?),
                TAG_TEXT => Value::Text(archive.read_string()?),
                TAG_OBJECT => Value::Object(archive.read_object()?),
                tag => return Err(ArchiveError::InvalidData(format!("record tag {}", tag))),
            };
            self.fields.push((name, value));
        }
        Ok(())
    }

    fn post_load(&mut self) {
        self.post_loaded = true;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Field value to encode into a record payload
#[derive(Debug, Clone)]
pub enum FieldSpec {
    Int(i64),
    Float(f64),
    Text(String),
    Object(ObjectIndex),
}

/// Encode a [`RecordBody`] payload, interning field names in `builder`
pub fn record_payload(
    builder: &mut PackageBuilder,
    fields: &[(&str, FieldSpec)],
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(fields.len() as u32).to_le_bytes());
    for (name, value) in fields {
        out.extend_from_slice(&builder.name_index(name).to_le_bytes());
        match value {
            FieldSpec::Int(v) => {
                out.push(TAG_INT);
                out.extend_from_slice(&v.to_le_bytes());
            }
            FieldSpec::Float(v) => {
                out.push(TAG_FLOAT);
                out.extend_from_slice(&v.to_le_bytes());
            }
            FieldSpec::Text(v) => {
                out.push(TAG_TEXT);
                out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                out.extend_from_slice(v.as_bytes());
            }
            FieldSpec::Object(index) => {
                out.push(TAG_OBJECT);
                out.extend_from_slice(&index.to_raw().to_le_bytes());
            }
        }
    }
    out
}
