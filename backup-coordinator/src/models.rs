//! Catalog inputs consumed by the data mover.
//!
//! Object discovery happens outside this crate; a run is handed an
//! already-enumerated list of relations with their definitions, deserialized
//! from whatever the caller produced.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::filter::make_fqn;

/// A user relation, identified by schema, name, and oid. Oids are unique
/// within one backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    pub schema: String,
    pub name: String,
    pub oid: u32,
}

impl Relation {
    /// Quoted `schema.name`, as it appears in COPY commands.
    pub fn fqn(&self) -> String {
        make_fqn(&self.schema, &self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
}

/// Per-relation definition attributes the data mover needs. External tables
/// own no physical rows on segments and are skipped by the data phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableDefinition {
    #[serde(default)]
    pub is_external: bool,
    #[serde(default)]
    pub column_defs: Vec<ColumnDefinition>,
}

/// The enumerated table set for one run: relations in backup order plus their
/// definitions keyed by oid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableManifest {
    pub tables: Vec<Relation>,
    pub definitions: HashMap<u32, TableDefinition>,
}

impl TableManifest {
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }
}
