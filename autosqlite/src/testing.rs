//! Testing utilities for schema development.
//!
//! [`DatabaseHarness`] owns a temporary directory with one database path in it, runs
//! [`Migrator`] calls against that path and offers assertions over the result.

use std::path::{Path, PathBuf};

use rusqlite::types::FromSql;
use rusqlite::{Connection, Row};
use tempfile::TempDir;

use crate::core::{OpenReport, SchemaVersion};
use crate::error::Error;
use crate::introspect::{fingerprint, get_columns, SchemaFingerprint};
use crate::target::DbTarget;
use crate::Migrator;

/// A test harness around a database file in a temporary directory.
///
/// # Example
///
/// ```ignore
/// use autosqlite::testing::DatabaseHarness;
/// use autosqlite::Error;
///
/// # fn test() -> Result<(), Error> {
/// let harness = DatabaseHarness::new()?;
/// harness.open("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);")?;
/// harness.execute("INSERT INTO users (name) VALUES ('alice')")?;
///
/// harness.open("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, email TEXT);")?;
/// harness.assert_column_exists("users", "email")?;
/// assert_eq!(harness.query_one::<String>("SELECT name FROM users")?, "alice");
/// assert!(harness.backup_exists());
/// # Ok(())
/// # }
/// # test().unwrap();
/// ```
#[derive(Debug)]
pub struct DatabaseHarness {
    dir: TempDir,
    target: DbTarget,
    migrator: Migrator,
}

impl DatabaseHarness {
    /// Create a harness with a default [`Migrator`].
    pub fn new() -> Result<Self, Error> {
        Self::with_migrator(Migrator::new())
    }

    /// Create a harness that runs every call through `migrator`.
    pub fn with_migrator(migrator: Migrator) -> Result<Self, Error> {
        let dir = tempfile::tempdir().map_err(|e| Error::path(std::env::temp_dir(), e))?;
        let target = DbTarget::from_path(dir.path().join("test.db"));
        Ok(Self {
            dir,
            target,
            migrator,
        })
    }

    pub fn path(&self) -> &Path {
        self.target.path()
    }

    /// The temporary directory holding the database and its sibling files.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn migrator(&self) -> &Migrator {
        &self.migrator
    }

    pub fn open(&self, schema: &str) -> Result<Connection, Error> {
        self.migrator.open(schema, &self.target)
    }

    pub fn open_with_report(&self, schema: &str) -> Result<(Connection, OpenReport), Error> {
        self.migrator.open_with_report(schema, &self.target)
    }

    pub fn migrate(&self, schema: &str) -> Result<Connection, Error> {
        self.migrator.migrate(schema, &self.target)
    }

    /// Execute a SQL statement (for setting up test data).
    pub fn execute(&self, sql: &str) -> Result<(), Error> {
        self.connection()?.execute_batch(sql)?;
        Ok(())
    }

    /// Query a single value from the database.
    pub fn query_one<T>(&self, sql: &str) -> Result<T, Error>
    where
        T: FromSql,
    {
        let result = self.connection()?.query_row(sql, [], |row| row.get(0))?;
        Ok(result)
    }

    /// Query all values from a single-column result.
    pub fn query_all<T>(&self, sql: &str) -> Result<Vec<T>, Error>
    where
        T: FromSql,
    {
        self.query_map(sql, |row| row.get(0))
    }

    /// Query with a custom row mapper.
    pub fn query_map<T, F>(&self, sql: &str, f: F) -> Result<Vec<T>, Error>
    where
        F: FnMut(&Row) -> rusqlite::Result<T>,
    {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(sql)?;
        let results = stmt.query_map([], f)?.collect::<Result<Vec<T>, _>>()?;
        Ok(results)
    }

    /// Assert that a user table exists in the database.
    pub fn assert_table_exists(&self, table_name: &str) -> Result<(), Error> {
        if !self.tables()?.iter().any(|t| t == table_name) {
            return Err(Error::Generic(format!("Table '{}' does not exist", table_name)));
        }
        Ok(())
    }

    /// Assert that a user table does not exist in the database.
    pub fn assert_table_not_exists(&self, table_name: &str) -> Result<(), Error> {
        if self.tables()?.iter().any(|t| t == table_name) {
            return Err(Error::Generic(format!(
                "Table '{}' exists but should not",
                table_name
            )));
        }
        Ok(())
    }

    /// Assert that a column exists in a table.
    pub fn assert_column_exists(&self, table_name: &str, column_name: &str) -> Result<(), Error> {
        let columns = get_columns(&self.connection()?, table_name)?;
        if !columns.iter().any(|c| c == column_name) {
            return Err(Error::Generic(format!(
                "Column '{}' does not exist in table '{}'",
                column_name, table_name
            )));
        }
        Ok(())
    }

    /// Assert that a column does not exist in a table.
    pub fn assert_column_not_exists(&self, table_name: &str, column_name: &str) -> Result<(), Error> {
        let columns = get_columns(&self.connection()?, table_name)?;
        if columns.iter().any(|c| c == column_name) {
            return Err(Error::Generic(format!(
                "Column '{}' exists in table '{}' but should not",
                column_name, table_name
            )));
        }
        Ok(())
    }

    /// Capture the structure of the database for later comparison.
    pub fn capture_fingerprint(&self) -> Result<SchemaFingerprint, Error> {
        fingerprint(&self.connection()?, self.lineage_table())
    }

    /// Assert that the database has the structure captured in `expected`.
    pub fn assert_fingerprint_matches(&self, expected: &SchemaFingerprint) -> Result<(), Error> {
        let differences = self.capture_fingerprint()?.differences(expected);
        if !differences.is_empty() {
            return Err(Error::Generic(format!(
                "Schema mismatch:\n{}",
                differences.join("\n")
            )));
        }
        Ok(())
    }

    /// The lineage recorded in the database, oldest first.
    pub fn lineage(&self) -> Result<Vec<SchemaVersion>, Error> {
        self.migrator.history(&self.target)
    }

    pub fn backup_exists(&self) -> bool {
        self.target.backup_path().exists()
    }

    pub fn scratch_exists(&self) -> bool {
        self.target.scratch_path().exists()
    }

    pub fn lock_exists(&self) -> bool {
        self.target.lock_path().exists()
    }

    pub fn backup_path(&self) -> PathBuf {
        self.target.backup_path()
    }

    /// Raw bytes of the database file.
    pub fn file_bytes(&self) -> Result<Vec<u8>, Error> {
        std::fs::read(self.path()).map_err(|e| Error::path(self.path(), e))
    }

    /// A plain handle on the database file, with no schema applied.
    pub fn connection(&self) -> Result<Connection, Error> {
        Ok(Connection::open(self.path())?)
    }

    fn tables(&self) -> Result<Vec<String>, Error> {
        self.migrator.get_tables(&self.connection()?)
    }

    fn lineage_table(&self) -> &str {
        self.migrator.lineage().table_name()
    }
}
