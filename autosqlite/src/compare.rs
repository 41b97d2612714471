//! Structural equivalence between a candidate schema and a live database.

use rusqlite::Connection;

use crate::error::Error;
use crate::introspect::{fingerprint, SchemaFingerprint};

/// Execute `schema` against a fresh in-memory database and fingerprint the result.
pub(crate) fn fingerprint_schema(schema: &str, lineage_table: &str) -> Result<SchemaFingerprint, Error> {
    let scratch = Connection::open_in_memory()?;
    scratch.execute_batch(schema).map_err(Error::SchemaSyntax)?;
    fingerprint(&scratch, lineage_table)
}

/// Whether applying `schema` to an empty database yields the same structure that `live`
/// already has. Any failure, including a schema that does not execute, counts as not equal.
pub(crate) fn equivalent(schema: &str, live: &Connection, lineage_table: &str) -> bool {
    let expected = match fingerprint_schema(schema, lineage_table) {
        Ok(fp) => fp,
        Err(_error) => {
            #[cfg(feature = "tracing")]
            tracing::debug!(error = %_error, "Candidate schema could not be fingerprinted");
            return false;
        }
    };
    match fingerprint(live, lineage_table) {
        Ok(actual) => actual == expected,
        Err(_error) => {
            #[cfg(feature = "tracing")]
            tracing::debug!(error = %_error, "Live database could not be fingerprinted");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DEFAULT_LINEAGE_TABLE_NAME;

    fn live(schema: &str) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(schema).unwrap();
        conn
    }

    #[test]
    fn same_structure_is_equivalent() {
        let conn = live("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
             CREATE INDEX idx_name ON users(name);");
        let candidate = "-- reformatted\nCREATE TABLE users (\n  id INTEGER PRIMARY KEY,\n  name TEXT\n);\nCREATE INDEX idx_name ON users (name);";
        assert!(equivalent(candidate, &conn, DEFAULT_LINEAGE_TABLE_NAME));
    }

    #[test]
    fn lineage_table_is_ignored() {
        let conn = live("CREATE TABLE users (id INTEGER PRIMARY KEY);
             CREATE TABLE _autosqlite_lineage_ (ordinal INTEGER PRIMARY KEY);");
        assert!(equivalent(
            "CREATE TABLE users (id INTEGER PRIMARY KEY);",
            &conn,
            DEFAULT_LINEAGE_TABLE_NAME
        ));
    }

    #[test]
    fn differences_are_detected() {
        let conn = live("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);");
        assert!(!equivalent(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, email TEXT);",
            &conn,
            DEFAULT_LINEAGE_TABLE_NAME
        ));
        assert!(!equivalent(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT); CREATE INDEX i ON users(name);",
            &conn,
            DEFAULT_LINEAGE_TABLE_NAME
        ));
        assert!(!equivalent(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL);",
            &conn,
            DEFAULT_LINEAGE_TABLE_NAME
        ));
    }

    #[test]
    fn invalid_candidate_is_not_equivalent() {
        let conn = live("CREATE TABLE users (id INTEGER PRIMARY KEY);");
        assert!(!equivalent("CREATE TABLE (", &conn, DEFAULT_LINEAGE_TABLE_NAME));
    }

    #[test]
    fn fingerprint_schema_reports_syntax_errors() {
        let err = fingerprint_schema("CREATE TABLE (", DEFAULT_LINEAGE_TABLE_NAME).unwrap_err();
        assert!(matches!(err, Error::SchemaSyntax(_)));
    }
}
