//! Table-of-contents structures for backup artifacts.
//!
//! Two indices are maintained: the master TOC on the coordinator, which
//! records every serialized DDL statement as a byte range within its section
//! metadata file plus the list of table data entries, and the per-segment TOC,
//! which maps each table oid to its byte range within the single segment data
//! file. Both are persisted as YAML and chmod'd read-only in one finalization
//! step; restore opens them read-only and treats them as immutable.

pub mod statements;

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// The four ordered metadata partitions of the master TOC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Global,
    Predata,
    Postdata,
    Statistics,
}

impl Section {
    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Global => "global",
            Section::Predata => "predata",
            Section::Postdata => "postdata",
            Section::Statistics => "statistics",
        }
    }
}

/// One DDL object in a section metadata file.
///
/// `reference_object` is empty unless this entry is a dependent of another
/// relation, e.g. an INDEX whose reference is the fully-qualified table name.
/// The byte range is half-open and ranges within a section are non-overlapping
/// and appended in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub schema: String,
    pub name: String,
    #[serde(rename = "objecttype")]
    pub object_type: String,
    #[serde(rename = "referenceobject")]
    pub reference_object: String,
    #[serde(rename = "startbyte")]
    pub start_byte: u64,
    #[serde(rename = "endbyte")]
    pub end_byte: u64,
}

/// One user table's data in the master TOC.
///
/// `attribute_string` is the optional parenthesized column list, captured so
/// a restore survives column-order drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterDataEntry {
    pub schema: String,
    pub name: String,
    pub oid: u32,
    #[serde(rename = "attributestring")]
    pub attribute_string: String,
    #[serde(rename = "rowscopied")]
    pub rows_copied: u64,
}

/// Byte range of one oid within the single per-segment data file. Offsets are
/// always uncompressed offsets, even when the data file itself is gzipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDataEntry {
    #[serde(rename = "startbyte")]
    pub start_byte: u64,
    #[serde(rename = "endbyte")]
    pub end_byte: u64,
}

/// Master table of contents, kept on the coordinator.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Toc {
    #[serde(rename = "globalentries", default)]
    pub global_entries: Vec<MetadataEntry>,
    #[serde(rename = "predataentries", default)]
    pub predata_entries: Vec<MetadataEntry>,
    #[serde(rename = "postdataentries", default)]
    pub postdata_entries: Vec<MetadataEntry>,
    #[serde(rename = "statisticsentries", default)]
    pub statistics_entries: Vec<MetadataEntry>,
    #[serde(rename = "dataentries", default)]
    pub data_entries: Vec<MasterDataEntry>,
}

/// Per-segment table of contents. Keyed by oid; the map enforces the
/// oid-uniqueness invariant and serializes in numeric key order.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SegmentToc {
    #[serde(rename = "dataentries", default)]
    pub data_entries: BTreeMap<u32, SegmentDataEntry>,
}

/// A write handle that tracks how many bytes have been written.
///
/// Metadata appends close the previous entry's range by reading the current
/// write position, so every byte written to a section file must pass through
/// this counter.
pub struct CountedFile {
    file: File,
    byte_count: u64,
}

impl CountedFile {
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(CountedFile {
            file,
            byte_count: 0,
        })
    }

    pub fn byte_count(&self) -> u64 {
        self.byte_count
    }
}

impl Write for CountedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.file.write(buf)?;
        self.byte_count += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Toc {
    pub fn new() -> Self {
        Toc::default()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn section_entries(&self, section: Section) -> &[MetadataEntry] {
        match section {
            Section::Global => &self.global_entries,
            Section::Predata => &self.predata_entries,
            Section::Postdata => &self.postdata_entries,
            Section::Statistics => &self.statistics_entries,
        }
    }

    /// Append a metadata entry whose statement bytes span from `start` to the
    /// current write position of the section file.
    pub fn add_metadata_entry(
        &mut self,
        section: Section,
        schema: &str,
        name: &str,
        object_type: &str,
        reference_object: &str,
        start: u64,
        file: &CountedFile,
    ) {
        let entry = MetadataEntry {
            schema: schema.to_string(),
            name: name.to_string(),
            object_type: object_type.to_string(),
            reference_object: reference_object.to_string(),
            start_byte: start,
            end_byte: file.byte_count(),
        };
        let entries = match section {
            Section::Global => &mut self.global_entries,
            Section::Predata => &mut self.predata_entries,
            Section::Postdata => &mut self.postdata_entries,
            Section::Statistics => &mut self.statistics_entries,
        };
        entries.push(entry);
    }

    pub fn add_global_entry(
        &mut self,
        schema: &str,
        name: &str,
        object_type: &str,
        start: u64,
        file: &CountedFile,
    ) {
        self.add_metadata_entry(Section::Global, schema, name, object_type, "", start, file);
    }

    pub fn add_predata_entry(
        &mut self,
        schema: &str,
        name: &str,
        object_type: &str,
        reference_object: &str,
        start: u64,
        file: &CountedFile,
    ) {
        self.add_metadata_entry(
            Section::Predata,
            schema,
            name,
            object_type,
            reference_object,
            start,
            file,
        );
    }

    pub fn add_postdata_entry(
        &mut self,
        schema: &str,
        name: &str,
        object_type: &str,
        reference_object: &str,
        start: u64,
        file: &CountedFile,
    ) {
        self.add_metadata_entry(
            Section::Postdata,
            schema,
            name,
            object_type,
            reference_object,
            start,
            file,
        );
    }

    pub fn add_statistics_entry(
        &mut self,
        schema: &str,
        name: &str,
        object_type: &str,
        start: u64,
        file: &CountedFile,
    ) {
        self.add_metadata_entry(
            Section::Statistics,
            schema,
            name,
            object_type,
            "",
            start,
            file,
        );
    }

    pub fn add_master_data_entry(
        &mut self,
        schema: &str,
        name: &str,
        oid: u32,
        attribute_string: &str,
        rows_copied: u64,
    ) {
        self.data_entries.push(MasterDataEntry {
            schema: schema.to_string(),
            name: name.to_string(),
            oid,
            attribute_string: attribute_string.to_string(),
            rows_copied,
        });
    }

    pub fn write_to_file_and_make_read_only(&self, path: &Path) -> Result<()> {
        write_read_only(path, &serde_yaml::to_string(self)?)
    }
}

impl SegmentToc {
    pub fn new() -> Self {
        SegmentToc::default()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn add_data_entry(&mut self, oid: u32, start_byte: u64, end_byte: u64) {
        self.data_entries.insert(
            oid,
            SegmentDataEntry {
                start_byte,
                end_byte,
            },
        );
    }

    pub fn write_to_file_and_make_read_only(&self, path: &Path) -> Result<()> {
        write_read_only(path, &serde_yaml::to_string(self)?)
    }
}

/// TOCs are written in one pass and only then made read-only, so a partially
/// written TOC is never observable behind the 0444 mode.
fn write_read_only(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o444))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;

    fn sample_counted_file(dir: &tempfile::TempDir) -> CountedFile {
        CountedFile::create(&dir.path().join("metadata.sql")).unwrap()
    }

    #[test]
    fn counted_file_tracks_bytes_written() {
        let dir = tempdir().unwrap();
        let mut file = sample_counted_file(&dir);
        assert_eq!(file.byte_count(), 0);
        file.write_all(b"CREATE SCHEMA s;\n").unwrap();
        assert_eq!(file.byte_count(), 17);
        file.write_all(b"x").unwrap();
        assert_eq!(file.byte_count(), 18);
    }

    #[test]
    fn metadata_entries_form_tight_ordered_ranges() {
        let dir = tempdir().unwrap();
        let mut file = sample_counted_file(&dir);
        let mut toc = Toc::new();

        let start = file.byte_count();
        file.write_all(b"CREATE TABLE s.t ();\n").unwrap();
        toc.add_predata_entry("s", "t", "TABLE", "", start, &file);

        let start = file.byte_count();
        file.write_all(b"CREATE INDEX i ON s.t (a);\n").unwrap();
        toc.add_postdata_entry("s", "i", "INDEX", "s.t", start, &file);

        let predata = &toc.predata_entries[0];
        assert_eq!((predata.start_byte, predata.end_byte), (0, 21));
        let postdata = &toc.postdata_entries[0];
        assert_eq!((postdata.start_byte, postdata.end_byte), (21, 48));
        assert_eq!(postdata.reference_object, "s.t");
    }

    #[test]
    fn consecutive_entries_within_a_section_leave_no_gaps() {
        let dir = tempdir().unwrap();
        let mut file = sample_counted_file(&dir);
        let mut toc = Toc::new();
        for name in ["a", "b", "c"] {
            let start = file.byte_count();
            file.write_all(format!("CREATE TABLE s.{name} ();\n").as_bytes())
                .unwrap();
            toc.add_predata_entry("s", name, "TABLE", "", start, &file);
        }
        for pair in toc.predata_entries.windows(2) {
            assert_eq!(pair[0].end_byte, pair[1].start_byte);
        }
        assert_eq!(toc.predata_entries.last().unwrap().end_byte, file.byte_count());
    }

    #[test]
    fn master_toc_round_trips_through_yaml() {
        let dir = tempdir().unwrap();
        let mut toc = Toc::new();
        toc.add_master_data_entry("public", "orders", 16384, "(id,total)", 42);
        let path = dir.path().join("toc.yaml");
        toc.write_to_file_and_make_read_only(&path).unwrap();

        let loaded = Toc::from_file(&path).unwrap();
        assert_eq!(loaded.data_entries.len(), 1);
        let entry = &loaded.data_entries[0];
        assert_eq!(entry.oid, 16384);
        assert_eq!(entry.attribute_string, "(id,total)");
        assert_eq!(entry.rows_copied, 42);
    }

    #[test]
    fn toc_files_are_read_only_after_finalization() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("toc.yaml");
        Toc::new().write_to_file_and_make_read_only(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o444);
    }

    #[test]
    fn segment_toc_serializes_with_the_documented_shape() {
        let mut toc = SegmentToc::new();
        toc.add_data_entry(2, 18, 36);
        toc.add_data_entry(1, 0, 18);
        toc.add_data_entry(3, 36, 54);
        let yaml = serde_yaml::to_string(&toc).unwrap();
        let expected = "dataentries:\n  1:\n    startbyte: 0\n    endbyte: 18\n  2:\n    startbyte: 18\n    endbyte: 36\n  3:\n    startbyte: 36\n    endbyte: 54\n";
        assert_eq!(yaml, expected);
    }

    #[test]
    fn segment_toc_keeps_one_entry_per_oid() {
        let mut toc = SegmentToc::new();
        toc.add_data_entry(1, 0, 18);
        toc.add_data_entry(1, 18, 36);
        assert_eq!(toc.data_entries.len(), 1);
        assert_eq!(toc.data_entries[&1].start_byte, 18);
    }

    #[test]
    fn master_toc_yaml_uses_documented_key_names() {
        let yaml = serde_yaml::to_string(&Toc::new()).unwrap();
        for key in [
            "globalentries",
            "predataentries",
            "postdataentries",
            "statisticsentries",
            "dataentries",
        ] {
            assert!(yaml.contains(key), "missing key {key} in {yaml}");
        }
    }
}
