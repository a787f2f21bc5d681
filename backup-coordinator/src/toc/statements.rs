//! Statement extraction and post-filter rewrites.
//!
//! Extraction turns a section of the master TOC plus its metadata file into
//! the ordered list of DDL statements a restore should apply, honoring the
//! include/exclude filters. Statements are opaque byte strings; only their
//! descriptive attributes are interpreted here.

use std::fs::File;
use std::os::unix::fs::FileExt;

use regex::Regex;

use crate::error::{CoordinatorError, Result};
use crate::filter::{make_fqn, FilterSet};
use crate::toc::{MasterDataEntry, MetadataEntry, Section, Toc};

/// A statement extracted from a metadata file together with the attributes
/// restore needs to order and filter it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementWithType {
    pub schema: String,
    pub name: String,
    pub object_type: String,
    pub reference_object: String,
    pub statement: String,
}

/// Object types that are themselves relations. Dependents of a relation carry
/// it in `reference_object` instead.
const RELATION_TYPES: [&str; 3] = ["TABLE", "VIEW", "SEQUENCE"];

fn construct_filter_sets(
    include_object_types: &[String],
    exclude_object_types: &[String],
    include_schemas: &[String],
    exclude_schemas: &[String],
    include_relations: &[String],
    exclude_relations: &[String],
) -> (FilterSet, FilterSet, FilterSet) {
    let pick = |include: &[String], exclude: &[String]| {
        if !include.is_empty() {
            FilterSet::new_include(include.iter().cloned())
        } else {
            FilterSet::new_exclude(exclude.iter().cloned())
        }
    };
    (
        pick(include_object_types, exclude_object_types),
        pick(include_schemas, exclude_schemas),
        pick(include_relations, exclude_relations),
    )
}

fn should_include_statement(
    entry: &MetadataEntry,
    object_set: &FilterSet,
    schema_set: &FilterSet,
    relation_set: &FilterSet,
) -> bool {
    let include_object = object_set.matches(&entry.object_type);
    let include_schema = schema_set.matches(&entry.schema);

    let is_relation = RELATION_TYPES.contains(&entry.object_type.as_str());
    let relation_fqn = make_fqn(&entry.schema, &entry.name);
    // Non-relation objects with no reference pass whenever no include filter is
    // active; relations must match the filter themselves; dependents follow
    // their parent relation's inclusion.
    let include_relation = (relation_set.is_exclude
        && !is_relation
        && entry.reference_object.is_empty())
        || (is_relation && entry.reference_object.is_empty() && relation_set.matches(&relation_fqn))
        || (!entry.reference_object.is_empty() && relation_set.matches(&entry.reference_object));

    include_object && include_schema && include_relation
}

fn read_statement(entry: &MetadataEntry, metadata_file: &File) -> Result<String> {
    let mut contents = vec![0u8; (entry.end_byte - entry.start_byte) as usize];
    metadata_file.read_exact_at(&mut contents, entry.start_byte)?;
    // Statements are carried as-is; a range that does not decode cleanly is
    // an error, never a silent substitution.
    String::from_utf8(contents).map_err(|_| CoordinatorError::StatementEncoding {
        object_type: entry.object_type.clone(),
        name: entry.name.clone(),
        start_byte: entry.start_byte,
        end_byte: entry.end_byte,
    })
}

impl Toc {
    /// Return the statements of `section` matching all three filters, in
    /// stored order, with their bytes attached.
    #[allow(clippy::too_many_arguments)]
    pub fn sql_statements_for_object_types(
        &self,
        section: Section,
        metadata_file: &File,
        include_object_types: &[String],
        exclude_object_types: &[String],
        include_schemas: &[String],
        exclude_schemas: &[String],
        include_relations: &[String],
        exclude_relations: &[String],
    ) -> Result<Vec<StatementWithType>> {
        let (object_set, schema_set, relation_set) = construct_filter_sets(
            include_object_types,
            exclude_object_types,
            include_schemas,
            exclude_schemas,
            include_relations,
            exclude_relations,
        );
        let mut statements = Vec::new();
        for entry in self.section_entries(section) {
            if should_include_statement(entry, &object_set, &schema_set, &relation_set) {
                statements.push(StatementWithType {
                    schema: entry.schema.clone(),
                    name: entry.name.clone(),
                    object_type: entry.object_type.clone(),
                    reference_object: entry.reference_object.clone(),
                    statement: read_statement(entry, metadata_file)?,
                });
            }
        }
        Ok(statements)
    }

    /// Every statement of `section`, unfiltered.
    pub fn all_sql_statements(
        &self,
        section: Section,
        metadata_file: &File,
    ) -> Result<Vec<StatementWithType>> {
        let mut statements = Vec::new();
        for entry in self.section_entries(section) {
            statements.push(StatementWithType {
                schema: entry.schema.clone(),
                name: entry.name.clone(),
                object_type: entry.object_type.clone(),
                reference_object: entry.reference_object.clone(),
                statement: read_statement(entry, metadata_file)?,
            });
        }
        Ok(statements)
    }

    /// Master data entries passing the schema and table filters. An absent
    /// filter pair (both lists empty) matches every entry on that axis.
    pub fn data_entries_matching(
        &self,
        include_schemas: &[String],
        exclude_schemas: &[String],
        include_tables: &[String],
        exclude_tables: &[String],
    ) -> Vec<MasterDataEntry> {
        let schema_set = if include_schemas.is_empty() && exclude_schemas.is_empty() {
            None
        } else if !include_schemas.is_empty() {
            Some(FilterSet::new_include(include_schemas.iter().cloned()))
        } else {
            Some(FilterSet::new_exclude(exclude_schemas.iter().cloned()))
        };
        let table_set = if include_tables.is_empty() && exclude_tables.is_empty() {
            None
        } else if !include_tables.is_empty() {
            Some(FilterSet::new_include(include_tables.iter().cloned()))
        } else {
            Some(FilterSet::new_exclude(exclude_tables.iter().cloned()))
        };

        self.data_entries
            .iter()
            .filter(|entry| {
                let valid_schema = schema_set
                    .as_ref()
                    .map_or(true, |set| set.matches(&entry.schema));
                let valid_table = table_set
                    .as_ref()
                    .map_or(true, |set| set.matches(&make_fqn(&entry.schema, &entry.name)));
                valid_schema && valid_table
            })
            .cloned()
            .collect()
    }
}

/// Rewrite database-level statements to target `new_name` instead of
/// `old_name`. Only DATABASE, DATABASE GUC, and DATABASE METADATA statements
/// are touched; the trailing token set pins the match to the statement
/// positions where a database name can appear.
pub fn substitute_redirect_database(
    mut statements: Vec<StatementWithType>,
    old_name: &str,
    new_name: &str,
) -> Vec<StatementWithType> {
    let pattern = Regex::new(&format!(
        "DATABASE {}(;| OWNER| SET| TO| FROM| IS| TEMPLATE)",
        regex::escape(old_name)
    ))
    .expect("redirect pattern is valid");
    let replacement = format!("DATABASE {new_name}$1");
    for statement in &mut statements {
        match statement.object_type.as_str() {
            "DATABASE" | "DATABASE GUC" | "DATABASE METADATA" => {
                statement.statement = pattern
                    .replace_all(&statement.statement, replacement.as_str())
                    .into_owned();
            }
            _ => {}
        }
    }
    statements
}

/// Drop the CREATE ROLE statement for the restoring session's own role; the
/// session already holds it and re-creating it would fail.
pub fn remove_active_role(
    active_user: &str,
    statements: Vec<StatementWithType>,
) -> Vec<StatementWithType> {
    statements
        .into_iter()
        .filter(|statement| {
            !(statement.object_type == "ROLE" && statement.name == active_user)
        })
        .collect()
}
