//! Include/exclude filter sets over object keys.
//!
//! Filters are built from user-supplied lists of object types, schema names,
//! or fully-qualified relation names and decide which TOC entries a backup or
//! restore run materializes.

use std::collections::HashSet;

/// A set of literal string keys with include or exclude polarity.
///
/// An include set matches a key iff the key is in the set; an exclude set
/// matches iff the key is absent. The empty exclude set therefore matches
/// everything. `is_exclude` is public because the statement extractor needs
/// it: when no relation filter is active, non-relation objects pass
/// unconditionally.
#[derive(Debug, Clone)]
pub struct FilterSet {
    keys: HashSet<String>,
    pub is_exclude: bool,
}

impl FilterSet {
    pub fn new_include<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FilterSet {
            keys: keys.into_iter().map(Into::into).collect(),
            is_exclude: false,
        }
    }

    pub fn new_exclude<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FilterSet {
            keys: keys.into_iter().map(Into::into).collect(),
            is_exclude: true,
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        if self.is_exclude {
            !self.keys.contains(key)
        } else {
            self.keys.contains(key)
        }
    }
}

/// Quote an identifier the way the database does: identifiers consisting of a
/// leading lowercase letter or underscore followed by lowercase letters,
/// digits, underscores, or dollar signs pass through unchanged; anything else
/// is wrapped in double quotes with embedded quotes doubled.
///
/// Restore compatibility depends on this being bit-exact, so keys produced
/// here must round-trip against names the user passes on the command line.
pub fn quote_ident(name: &str) -> String {
    let mut chars = name.chars();
    let plain = match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {
            chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '$')
        }
        _ => false,
    };
    if plain {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Fully-qualified `schema.name` with both components quoted as needed.
pub fn make_fqn(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}
