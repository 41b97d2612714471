//! Catalog introspection.
//!
//! Everything here is read-only. Engine-reserved objects (`sqlite_*`) and the lineage table
//! are never reported. An empty result means the database really is empty; engine failures
//! surface as [`Error::Introspection`].

use std::collections::BTreeMap;

use rusqlite::Connection;
use serde::Serialize;

use crate::core::DEFAULT_LINEAGE_TABLE_NAME;
use crate::error::Error;

/// A table, index, trigger or view, with its normalized definition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct CatalogObject {
    pub object_type: String,
    pub name: String,
    /// The table an index or trigger belongs to; the object's own name for tables and views.
    pub table_name: String,
    pub definition: String,
}

/// Information about a column, as reported by `table_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub type_name: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    /// 1-based position in the primary key, 0 if the column is not part of it.
    pub primary_key: i64,
}

impl ColumnInfo {
    /// Whether inserting NULL (or omitting the column) can only fail. `table` holds every
    /// column of the table this one belongs to.
    pub(crate) fn requires_value(&self, table: &[ColumnInfo]) -> bool {
        self.not_null && self.default_value.is_none() && !self.is_rowid_alias(table)
    }

    /// Whether this is the sole `INTEGER PRIMARY KEY` column, which SQLite fills itself.
    pub(crate) fn is_rowid_alias(&self, table: &[ColumnInfo]) -> bool {
        self.primary_key == 1
            && self.type_name.eq_ignore_ascii_case("INTEGER")
            && table.iter().filter(|c| c.primary_key > 0).count() == 1
    }
}

/// Structural summary of a database's catalog, used for equivalence checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaFingerprint {
    /// Catalog objects sorted by `(object_type, name)`.
    pub objects: Vec<CatalogObject>,
    /// Column listings for every table in `objects`.
    pub columns: BTreeMap<String, Vec<ColumnInfo>>,
}

impl SchemaFingerprint {
    /// Names of the tables in this fingerprint.
    pub fn tables(&self) -> Vec<&str> {
        self.objects
            .iter()
            .filter(|o| o.object_type == "table")
            .map(|o| o.name.as_str())
            .collect()
    }

    /// Human-readable differences between this fingerprint (the live one) and `expected`.
    /// Empty when the two are equal.
    pub fn differences(&self, expected: &SchemaFingerprint) -> Vec<String> {
        let mut differences = Vec::new();

        for object in &expected.objects {
            match self
                .objects
                .iter()
                .find(|o| o.object_type == object.object_type && o.name == object.name)
            {
                None => differences.push(format!(
                    "  - {} '{}' is missing",
                    object.object_type, object.name
                )),
                Some(actual) if actual.definition != object.definition => differences.push(format!(
                    "  - {} '{}' definition differs:\n    Expected: {}\n    Actual:   {}",
                    object.object_type, object.name, object.definition, actual.definition
                )),
                Some(_) => {}
            }
        }

        for object in &self.objects {
            if !expected
                .objects
                .iter()
                .any(|o| o.object_type == object.object_type && o.name == object.name)
            {
                differences.push(format!(
                    "  - Unexpected {} '{}' found",
                    object.object_type, object.name
                ));
            }
        }

        for (table, expected_columns) in &expected.columns {
            let Some(actual_columns) = self.columns.get(table) else {
                continue;
            };
            if actual_columns == expected_columns {
                continue;
            }
            let expected_names: Vec<_> = expected_columns.iter().map(|c| &c.name).collect();
            let actual_names: Vec<_> = actual_columns.iter().map(|c| &c.name).collect();
            if expected_names != actual_names {
                differences.push(format!(
                    "  - Table '{}' column mismatch:\n    Expected columns: {:?}\n    Actual columns:   {:?}",
                    table, expected_names, actual_names
                ));
            } else {
                for (expected_col, actual_col) in expected_columns.iter().zip(actual_columns) {
                    if expected_col != actual_col {
                        differences.push(format!(
                            "  - Table '{}' column '{}' properties differ:\n    Expected: {:?}\n    Actual:   {:?}",
                            table, expected_col.name, expected_col, actual_col
                        ));
                    }
                }
            }
        }

        differences
    }
}

/// Returns the names of all user tables in the database, leaving out a lineage table with
/// the default name. Use [`Migrator::get_tables`](crate::Migrator::get_tables) when the
/// lineage table was renamed.
pub fn get_tables(conn: &Connection) -> Result<Vec<String>, Error> {
    list_tables(conn, DEFAULT_LINEAGE_TABLE_NAME)
}

/// Returns the column names of `table`, in declaration order.
pub fn get_columns(conn: &Connection, table: &str) -> Result<Vec<String>, Error> {
    Ok(get_table_info(conn, table)?
        .into_iter()
        .map(|c| c.name)
        .collect())
}

/// Returns full column information for `table`, in declaration order.
/// A table that does not exist has no columns.
pub fn get_table_info(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>, Error> {
    let mut stmt = conn
        .prepare(
            "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
        )
        .map_err(Error::Introspection)?;
    let columns = stmt
        .query_map([table], |row| {
            Ok(ColumnInfo {
                name: row.get(0)?,
                type_name: row.get(1)?,
                not_null: row.get::<_, i64>(2)? != 0,
                default_value: row.get(3)?,
                primary_key: row.get(4)?,
            })
        })
        .map_err(Error::Introspection)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(Error::Introspection)?;
    Ok(columns)
}

pub(crate) fn list_tables(conn: &Connection, lineage_table: &str) -> Result<Vec<String>, Error> {
    Ok(list_objects(conn, lineage_table)?
        .into_iter()
        .filter(|o| o.object_type == "table")
        .map(|o| o.name)
        .collect())
}

/// All tables, indexes, triggers and views, excluding reserved objects, sorted by type and name.
pub(crate) fn list_objects(conn: &Connection, lineage_table: &str) -> Result<Vec<CatalogObject>, Error> {
    let mut stmt = conn
        .prepare(
            "SELECT type, name, tbl_name, sql FROM sqlite_master \
             WHERE type IN ('table', 'index', 'trigger', 'view') \
             AND sql IS NOT NULL \
             AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' \
             AND name != ?1 AND tbl_name != ?1",
        )
        .map_err(Error::Introspection)?;
    let mut objects = stmt
        .query_map([lineage_table], |row| {
            let sql: String = row.get(3)?;
            Ok(CatalogObject {
                object_type: row.get(0)?,
                name: row.get(1)?,
                table_name: row.get(2)?,
                definition: normalize_definition(&sql),
            })
        })
        .map_err(Error::Introspection)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(Error::Introspection)?;
    objects.sort();
    Ok(objects)
}

/// Compute the fingerprint of a live handle.
pub(crate) fn fingerprint(conn: &Connection, lineage_table: &str) -> Result<SchemaFingerprint, Error> {
    let objects = list_objects(conn, lineage_table)?;
    let mut columns = BTreeMap::new();
    for object in objects.iter().filter(|o| o.object_type == "table") {
        columns.insert(object.name.clone(), get_table_info(conn, &object.name)?);
    }
    Ok(SchemaFingerprint { objects, columns })
}

/// Collapse whitespace outside quoted text and drop it around punctuation, so that
/// definitions differing only in layout compare equal.
pub(crate) fn normalize_definition(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut open_quote: Option<char> = None;
    let mut pending_space = false;

    for c in sql.chars() {
        if let Some(q) = open_quote {
            out.push(c);
            if c == q {
                open_quote = None;
            }
            continue;
        }
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        let tight = matches!(c, '(' | ')' | ',' | ';');
        let after_tight = out.ends_with(['(', ')', ',', ';']);
        if pending_space && !out.is_empty() && !tight && !after_tight {
            out.push(' ');
        }
        pending_space = false;
        if matches!(c, '\'' | '"' | '`' | '[') {
            open_quote = Some(if c == '[' { ']' } else { c });
        }
        out.push(c);
    }

    out
}

/// Quote an identifier for interpolation into SQL text.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
