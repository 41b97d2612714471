//! The lineage table: an append-only record of every schema applied to a database file.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};

use crate::core::{content_hash, Classification, SchemaVersion, DEFAULT_LINEAGE_TABLE_NAME};
use crate::error::Error;
use crate::introspect::quote_ident;

/// Reads and appends lineage rows stored in a reserved table of the database itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineageTracker {
    table_name: String,
}

impl Default for LineageTracker {
    fn default() -> Self {
        Self::new(DEFAULT_LINEAGE_TABLE_NAME)
    }
}

impl LineageTracker {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    fn table(&self) -> String {
        quote_ident(&self.table_name)
    }

    /// Whether the lineage table exists on this handle.
    pub fn exists(&self, conn: &Connection) -> Result<bool, Error> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name=?1")
            .map_err(Error::Lineage)?;
        let exists = stmt
            .query([&self.table_name])
            .and_then(|mut rows| rows.next().map(|row| row.is_some()))
            .map_err(Error::Lineage)?;
        Ok(exists)
    }

    /// The most recent lineage row, or `None` if nothing was ever recorded.
    pub fn current_version(&self, conn: &Connection) -> Result<Option<SchemaVersion>, Error> {
        if !self.exists(conn)? {
            return Ok(None);
        }
        conn.query_row(
            &format!(
                "SELECT ordinal, content_hash, applied_at, schema_text FROM {} ORDER BY ordinal DESC LIMIT 1",
                self.table()
            ),
            [],
            row_to_version,
        )
        .optional()
        .map_err(Error::Lineage)
    }

    /// Every lineage row, oldest first.
    pub fn history(&self, conn: &Connection) -> Result<Vec<SchemaVersion>, Error> {
        if !self.exists(conn)? {
            return Ok(vec![]);
        }
        let mut stmt = conn
            .prepare(&format!(
                "SELECT ordinal, content_hash, applied_at, schema_text FROM {} ORDER BY ordinal",
                self.table()
            ))
            .map_err(Error::Lineage)?;
        let versions = stmt
            .query_map([], row_to_version)
            .map_err(Error::Lineage)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(Error::Lineage)?;
        Ok(versions)
    }

    /// Classify `schema` against this handle's lineage.
    ///
    /// A hash equal to the current row is [`Classification::Identical`]; a hash found only among
    /// older rows is [`Classification::Backward`]; anything else, including a database without
    /// lineage, is [`Classification::Forward`].
    pub fn classify(&self, conn: &Connection, schema: &str) -> Result<Classification, Error> {
        let hash = content_hash(schema);
        let history = self.history(conn)?;

        let Some(current) = history.last() else {
            return Ok(Classification::Forward);
        };
        if current.content_hash == hash {
            return Ok(Classification::Identical);
        }
        // the latest earlier occurrence is the one that was superseded most recently
        match history.iter().rev().find(|v| v.content_hash == hash) {
            Some(earlier) => Ok(Classification::Backward {
                superseded_at: earlier.ordinal,
                current: current.ordinal,
            }),
            None => Ok(Classification::Forward),
        }
    }

    /// Append `schema` as the next lineage version, creating the table if needed.
    /// Returns the recorded ordinal.
    pub fn record(&self, conn: &Connection, schema: &str) -> Result<i64, Error> {
        self.ensure_table(conn)?;
        let applied_at = Utc::now().to_rfc3339();
        let ordinal: i64 = conn
            .query_row(
                &format!(
                    "INSERT INTO {table} (ordinal, content_hash, applied_at, schema_text) \
                     SELECT COALESCE(MAX(ordinal), 0) + 1, ?1, ?2, ?3 FROM {table} \
                     RETURNING ordinal",
                    table = self.table()
                ),
                (content_hash(schema), applied_at, schema),
                |row| row.get(0),
            )
            .map_err(Error::Lineage)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(ordinal, table = %self.table_name, "Recorded lineage version");

        Ok(ordinal)
    }

    /// Copy every lineage row from `source` into `dest` unchanged.
    /// Returns the number of rows copied.
    pub fn copy_into(&self, source: &Connection, dest: &Connection) -> Result<usize, Error> {
        let history = self.history(source)?;
        if history.is_empty() {
            return Ok(0);
        }
        self.ensure_table(dest)?;
        let mut stmt = dest
            .prepare(&format!(
                "INSERT INTO {} (ordinal, content_hash, applied_at, schema_text) VALUES (?1, ?2, ?3, ?4)",
                self.table()
            ))
            .map_err(Error::Lineage)?;
        for version in &history {
            stmt.execute((
                version.ordinal,
                &version.content_hash,
                version.applied_at.to_rfc3339(),
                &version.schema_text,
            ))
            .map_err(Error::Lineage)?;
        }
        Ok(history.len())
    }

    fn ensure_table(&self, conn: &Connection) -> Result<(), Error> {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (ordinal integer primary key not null, content_hash text not null, applied_at text not null, schema_text text not null)",
                self.table()
            ),
            [],
        )
        .map_err(Error::Lineage)?;
        Ok(())
    }
}

fn row_to_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<SchemaVersion> {
    let applied_at_str: String = row.get(2)?;
    let applied_at = chrono::DateTime::parse_from_rfc3339(&applied_at_str)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?
        .with_timezone(&Utc);

    Ok(SchemaVersion {
        ordinal: row.get(0)?,
        content_hash: row.get(1)?,
        applied_at,
        schema_text: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const V1: &str = "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);";
    const V2: &str = "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, email TEXT);";
    const V3: &str = "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT);";

    #[test]
    fn no_lineage_is_forward() {
        let conn = Connection::open_in_memory().unwrap();
        let tracker = LineageTracker::default();
        assert!(!tracker.exists(&conn).unwrap());
        assert_eq!(tracker.current_version(&conn).unwrap(), None);
        assert!(tracker.history(&conn).unwrap().is_empty());
        assert_eq!(tracker.classify(&conn, V1).unwrap(), Classification::Forward);
    }

    #[test]
    fn record_appends_ordinals() {
        let conn = Connection::open_in_memory().unwrap();
        let tracker = LineageTracker::default();
        assert_eq!(tracker.record(&conn, V1).unwrap(), 1);
        assert_eq!(tracker.record(&conn, V2).unwrap(), 2);

        let history = tracker.history(&conn).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].ordinal, 1);
        assert_eq!(history[0].content_hash, content_hash(V1));
        assert_eq!(history[0].schema_text, V1);
        assert_eq!(history[1].ordinal, 2);
        assert!(history[0].applied_at <= history[1].applied_at);

        let current = tracker.current_version(&conn).unwrap().unwrap();
        assert_eq!(current.ordinal, 2);
    }

    #[test]
    fn classifies_identical_forward_and_backward() {
        let conn = Connection::open_in_memory().unwrap();
        let tracker = LineageTracker::default();
        tracker.record(&conn, V1).unwrap();
        tracker.record(&conn, V2).unwrap();

        assert_eq!(tracker.classify(&conn, V2).unwrap(), Classification::Identical);
        // comments do not change identity
        assert_eq!(
            tracker.classify(&conn, &format!("-- v2\n{}", V2)).unwrap(),
            Classification::Identical
        );
        assert_eq!(tracker.classify(&conn, V3).unwrap(), Classification::Forward);
        assert_eq!(
            tracker.classify(&conn, V1).unwrap(),
            Classification::Backward {
                superseded_at: 1,
                current: 2
            }
        );
    }

    #[test]
    fn copy_into_preserves_rows() {
        let source = Connection::open_in_memory().unwrap();
        let dest = Connection::open_in_memory().unwrap();
        let tracker = LineageTracker::new("_custom_lineage_");
        tracker.record(&source, V1).unwrap();
        tracker.record(&source, V2).unwrap();

        assert_eq!(tracker.copy_into(&source, &dest).unwrap(), 2);
        assert_eq!(tracker.history(&dest).unwrap(), tracker.history(&source).unwrap());
        assert_eq!(tracker.record(&dest, V3).unwrap(), 3);
        // the source is untouched
        assert_eq!(tracker.history(&source).unwrap().len(), 2);
    }

    #[test]
    fn copy_into_without_lineage_creates_nothing() {
        let source = Connection::open_in_memory().unwrap();
        let dest = Connection::open_in_memory().unwrap();
        let tracker = LineageTracker::default();
        assert_eq!(tracker.copy_into(&source, &dest).unwrap(), 0);
        assert!(!tracker.exists(&dest).unwrap());
    }
}
