//! Package header wire layout
//!
//! ```text
//! offset 0   PackageSummary (64 bytes, u32 fields)
//!            name table      count, hashes[count], (u16 len, utf8)*
//!            import map      u64 ObjectIndex * import_count
//!            export map      72-byte entries * export_count
//!            export bundles  count, (first, count)*, (export, command)*
//!            graph data      count, (package_id, edge_count, (from, to)*)*
//! header_size
//!            export payloads
//! ```
//!
//! All integers are little endian.

use crate::object::{ExportFilterFlags, ObjectFlags};

use super::error::{HeaderError, HeaderResult};
use super::{ObjectIndex, PackageId};

pub const PACKAGE_MAGIC: u32 = 0x4B50_4C46;
pub const SUMMARY_SIZE: usize = 64;
pub const EXPORT_ENTRY_SIZE: usize = 72;
pub const NO_NAME: u32 = u32::MAX;

/// Fixed-layout summary at the start of every package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PackageSummary {
    pub magic: u32,
    pub header_size: u32,
    pub name: u32,
    pub source_name: u32,
    pub package_flags: u32,
    pub name_map_offset: u32,
    pub name_map_size: u32,
    pub import_map_offset: u32,
    pub import_count: u32,
    pub export_map_offset: u32,
    pub export_count: u32,
    pub export_bundles_offset: u32,
    pub export_bundles_size: u32,
    pub graph_data_offset: u32,
    pub graph_data_size: u32,
    pub reserved: u32,
}

impl PackageSummary {
    /// Fields in wire order
    pub(crate) fn fields(&self) -> [u32; SUMMARY_SIZE / 4] {
        [
            self.magic,
            self.header_size,
            self.name,
            self.source_name,
            self.package_flags,
            self.name_map_offset,
            self.name_map_size,
            self.import_map_offset,
            self.import_count,
            self.export_map_offset,
            self.export_count,
            self.export_bundles_offset,
            self.export_bundles_size,
            self.graph_data_offset,
            self.graph_data_size,
            self.reserved,
        ]
    }

    fn from_fields(f: [u32; SUMMARY_SIZE / 4]) -> Self {
        Self {
            magic: f[0],
            header_size: f[1],
            name: f[2],
            source_name: f[3],
            package_flags: f[4],
            name_map_offset: f[5],
            name_map_size: f[6],
            import_map_offset: f[7],
            import_count: f[8],
            export_map_offset: f[9],
            export_count: f[10],
            export_bundles_offset: f[11],
            export_bundles_size: f[12],
            graph_data_offset: f[13],
            graph_data_size: f[14],
            reserved: f[15],
        }
    }
}

/// One export map record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportMapEntry {
    /// Absolute offset of the payload in the package buffer
    pub serial_offset: u64,
    pub serial_size: u64,
    pub object_name: u32,
    pub outer: ObjectIndex,
    pub class: ObjectIndex,
    pub super_struct: ObjectIndex,
    pub template: ObjectIndex,
    /// Raw package-import index for public exports, 0 otherwise
    pub public_export_hash: u64,
    pub object_flags: ObjectFlags,
    pub filter_flags: ExportFilterFlags,
}

impl ExportMapEntry {
    #[inline]
    pub fn public_index(&self) -> Option<ObjectIndex> {
        (self.public_export_hash != 0).then(|| ObjectIndex::from_raw(self.public_export_hash))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleCommand {
    Create,
    Serialize,
}

impl BundleCommand {
    pub(crate) fn from_u32(value: u32) -> HeaderResult<Self> {
        match value {
            0 => Ok(BundleCommand::Create),
            1 => Ok(BundleCommand::Serialize),
            other => Err(HeaderError::BadCommand(other)),
        }
    }

    pub(crate) fn as_u32(&self) -> u32 {
        match self {
            BundleCommand::Create => 0,
            BundleCommand::Serialize => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleEntry {
    pub export_index: u32,
    pub command: BundleCommand,
}

impl BundleEntry {
    pub fn create(export_index: u32) -> Self {
        Self {
            export_index,
            command: BundleCommand::Create,
        }
    }

    pub fn serialize(export_index: u32) -> Self {
        Self {
            export_index,
            command: BundleCommand::Serialize,
        }
    }
}

/// Commands that execute strictly in order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExportBundle {
    pub entries: Vec<BundleEntry>,
}

/// Ordering edges from one imported package's bundles to ours
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedPackageArcs {
    pub imported_package: PackageId,
    /// `(from_bundle in the import, to_bundle in this package)`
    pub arcs: Vec<(u32, u32)>,
}

/// Parsed package header
#[derive(Debug, Clone, PartialEq)]
pub struct PackageHeader {
    pub summary: PackageSummary,
    pub names: Vec<String>,
    pub name_hashes: Vec<u64>,
    pub imports: Vec<ObjectIndex>,
    pub exports: Vec<ExportMapEntry>,
    pub bundles: Vec<ExportBundle>,
    pub arcs: Vec<ImportedPackageArcs>,
}

impl PackageHeader {
    pub fn name(&self) -> &str {
        &self.names[self.summary.name as usize]
    }

    /// Original package name for redirected packages
    pub fn source_name(&self) -> Option<&str> {
        match self.summary.source_name {
            NO_NAME => None,
            index => self.names.get(index as usize).map(String::as_str),
        }
    }

    pub fn name_at(
        &self,
        index: u32,
    ) -> Option<&str> {
        self.names.get(index as usize).map(String::as_str)
    }

    #[inline]
    pub fn header_size(&self) -> usize {
        self.summary.header_size as usize
    }
}

/// Little-endian cursor over a section of the header
struct WireReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> WireReader<'a> {
    fn at(
        data: &'a [u8],
        position: usize,
    ) -> Self {
        Self { data, position }
    }

    fn take(
        &mut self,
        count: usize,
    ) -> HeaderResult<&'a [u8]> {
        let end = self
            .position
            .checked_add(count)
            .filter(|end| *end <= self.data.len())
            .ok_or(HeaderError::Truncated {
                offset: self.position,
                needed: count,
                len: self.data.len(),
            })?;
        let bytes = &self.data[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> HeaderResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> HeaderResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> HeaderResult<u16> {
        self.array().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> HeaderResult<u32> {
        self.array().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> HeaderResult<u64> {
        self.array().map(u64::from_le_bytes)
    }

    fn skip(
        &mut self,
        count: usize,
    ) -> HeaderResult<()> {
        self.take(count).map(|_| ())
    }
}

fn check_section(
    section: &'static str,
    offset: u32,
    size: u64,
    limit: u32,
) -> HeaderResult<()> {
    let end = offset as u64 + size;
    if end > limit as u64 {
        return Err(HeaderError::SectionOutOfRange {
            section,
            offset: offset as u64,
            size,
            limit: limit as u64,
        });
    }
    Ok(())
}

/// Parse and validate the header at the start of `data`
pub fn parse_header(data: &[u8]) -> HeaderResult<PackageHeader> {
    let mut reader = WireReader::at(data, 0);
    let mut fields = [0u32; SUMMARY_SIZE / 4];
    for field in fields.iter_mut() {
        *field = reader.u32()?;
    }
    let summary = PackageSummary::from_fields(fields);
    if summary.magic != PACKAGE_MAGIC {
        return Err(HeaderError::BadMagic(summary.magic));
    }
    let header_size = summary.header_size;
    if (header_size as usize) < SUMMARY_SIZE || header_size as usize > data.len() {
        return Err(HeaderError::SectionOutOfRange {
            section: "header",
            offset: 0,
            size: header_size as u64,
            limit: data.len() as u64,
        });
    }
    let header = &data[..header_size as usize];

    check_section(
        "name map",
        summary.name_map_offset,
        summary.name_map_size as u64,
        header_size,
    )?;
    let (names, name_hashes) = parse_names(header, &summary)?;

    check_section(
        "import map",
        summary.import_map_offset,
        summary.import_count as u64 * 8,
        header_size,
    )?;
    let mut reader = WireReader::at(header, summary.import_map_offset as usize);
    let imports = (0..summary.import_count)
        .map(|_| reader.u64().map(ObjectIndex::from_raw))
        .collect::<HeaderResult<Vec<_>>>()?;

    check_section(
        "export map",
        summary.export_map_offset,
        summary.export_count as u64 * EXPORT_ENTRY_SIZE as u64,
        header_size,
    )?;
    let exports = parse_exports(header, &summary, data.len(), names.len())?;

    check_section(
        "export bundles",
        summary.export_bundles_offset,
        summary.export_bundles_size as u64,
        header_size,
    )?;
    let bundles = parse_bundles(header, &summary)?;

    check_section(
        "graph data",
        summary.graph_data_offset,
        summary.graph_data_size as u64,
        header_size,
    )?;
    let arcs = parse_graph_data(header, &summary)?;

    if summary.name as usize >= names.len() {
        return Err(HeaderError::BadNameIndex {
            index: summary.name,
            count: names.len(),
        });
    }
    if summary.source_name != NO_NAME && summary.source_name as usize >= names.len() {
        return Err(HeaderError::BadNameIndex {
            index: summary.source_name,
            count: names.len(),
        });
    }

    Ok(PackageHeader {
        summary,
        names,
        name_hashes,
        imports,
        exports,
        bundles,
        arcs,
    })
}

fn section<'a>(
    header: &'a [u8],
    offset: u32,
    size: u32,
) -> &'a [u8] {
    // Bounds were checked against header_size before this is called
    &header[offset as usize..offset as usize + size as usize]
}

fn parse_names(
    header: &[u8],
    summary: &PackageSummary,
) -> HeaderResult<(Vec<String>, Vec<u64>)> {
    let bytes = section(header, summary.name_map_offset, summary.name_map_size);
    if bytes.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }
    let mut reader = WireReader::at(bytes, 0);
    let count = reader.u32()?;
    let hashes = (0..count)
        .map(|_| reader.u64())
        .collect::<HeaderResult<Vec<_>>>()?;
    let mut names = Vec::with_capacity(count as usize);
    for index in 0..count {
        let len = reader.u16()? as usize;
        let raw = reader.take(len)?;
        let name = std::str::from_utf8(raw).map_err(|_| HeaderError::BadName(index))?;
        names.push(name.to_string());
    }
    Ok((names, hashes))
}

fn parse_exports(
    header: &[u8],
    summary: &PackageSummary,
    buffer_len: usize,
    name_count: usize,
) -> HeaderResult<Vec<ExportMapEntry>> {
    let mut reader = WireReader::at(header, summary.export_map_offset as usize);
    let mut exports = Vec::with_capacity(summary.export_count as usize);
    for export in 0..summary.export_count {
        let serial_offset = reader.u64()?;
        let serial_size = reader.u64()?;
        let object_name = reader.u32()?;
        reader.skip(4)?;
        let outer = ObjectIndex::from_raw(reader.u64()?);
        let class = ObjectIndex::from_raw(reader.u64()?);
        let super_struct = ObjectIndex::from_raw(reader.u64()?);
        let template = ObjectIndex::from_raw(reader.u64()?);
        let public_export_hash = reader.u64()?;
        let object_flags = ObjectFlags::from_bits_retain(reader.u32()?);
        let filter_flags = ExportFilterFlags::from_bits_retain(reader.u8()?);
        reader.skip(3)?;

        let in_range = serial_offset >= summary.header_size as u64
            && serial_offset
                .checked_add(serial_size)
                .is_some_and(|end| end <= buffer_len as u64);
        if !in_range {
            return Err(HeaderError::ExportOutOfRange {
                export,
                offset: serial_offset,
                size: serial_size,
                header_size: summary.header_size as u64,
                len: buffer_len as u64,
            });
        }
        if object_name as usize >= name_count {
            return Err(HeaderError::BadNameIndex {
                index: object_name,
                count: name_count,
            });
        }

        exports.push(ExportMapEntry {
            serial_offset,
            serial_size,
            object_name,
            outer,
            class,
            super_struct,
            template,
            public_export_hash,
            object_flags,
            filter_flags,
        });
    }
    Ok(exports)
}

fn parse_bundles(
    header: &[u8],
    summary: &PackageSummary,
) -> HeaderResult<Vec<ExportBundle>> {
    let bytes = section(
        header,
        summary.export_bundles_offset,
        summary.export_bundles_size,
    );
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let mut reader = WireReader::at(bytes, 0);
    let count = reader.u32()?;
    let ranges = (0..count)
        .map(|_| -> HeaderResult<(u32, u32)> { Ok((reader.u32()?, reader.u32()?)) })
        .collect::<HeaderResult<Vec<_>>>()?;
    let entries_start = reader.position;

    let mut bundles = Vec::with_capacity(ranges.len());
    for (bundle, (first, entry_count)) in ranges.into_iter().enumerate() {
        let start = entries_start + first as usize * 8;
        let mut entry_reader = WireReader::at(bytes, start);
        // Counts are untrusted until the bytes behind them exist
        entry_reader.take(entry_count as usize * 8)?;
        entry_reader.position = start;
        let mut entries = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            let export_index = entry_reader.u32()?;
            let command = BundleCommand::from_u32(entry_reader.u32()?)?;
            if export_index >= summary.export_count {
                return Err(HeaderError::BadBundleEntry {
                    bundle: bundle as u32,
                    export: export_index,
                    count: summary.export_count,
                });
            }
            entries.push(BundleEntry {
                export_index,
                command,
            });
        }
        bundles.push(ExportBundle { entries });
    }
    Ok(bundles)
}

fn parse_graph_data(
    header: &[u8],
    summary: &PackageSummary,
) -> HeaderResult<Vec<ImportedPackageArcs>> {
    let bytes = section(header, summary.graph_data_offset, summary.graph_data_size);
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let mut reader = WireReader::at(bytes, 0);
    let count = reader.u32()?;
    let mut packages = Vec::new();
    for _ in 0..count {
        let imported_package = PackageId::from_raw(reader.u64()?);
        let edge_count = reader.u32()?;
        let arcs = (0..edge_count)
            .map(|_| -> HeaderResult<(u32, u32)> { Ok((reader.u32()?, reader.u32()?)) })
            .collect::<HeaderResult<Vec<_>>>()?;
        packages.push(ImportedPackageArcs {
            imported_package,
            arcs,
        });
    }
    Ok(packages)
}
