#![cfg_attr(docsrs, feature(doc_cfg))]
//! `autosqlite` keeps a SQLite database file in step with a schema declared as plain DDL.
//!
//! Core concepts:
//! - The schema is the desired end state. There are no migration scripts: when the schema
//!   changes, the database is rebuilt from it and the data of every column that survives is
//!   carried over.
//! - Every database records the schemas it has run in a lineage table. A schema that was
//!   superseded earlier is refused, so an old build of an application can never silently
//!   downgrade a newer database.
//! - Migrations are atomic. The new database is built next to the old one and renamed into
//!   place, a backup of the old file is kept, and concurrent callers (threads or processes)
//!   are serialized through an advisory lock file.
//!
//! # Example
//!
//! ```
//! use autosqlite::{get_columns, Migrator, OpenAction};
//!
//! # fn main() -> Result<(), autosqlite::Error> {
//! # let dir = tempfile::tempdir().unwrap();
//! # let path = dir.path().join("app.db");
//! let migrator = Migrator::new();
//!
//! // the first open creates the file
//! let conn = migrator.open("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);", &path)?;
//! conn.execute("INSERT INTO users (name) VALUES ('alice')", [])?;
//! drop(conn);
//!
//! // a changed schema migrates it, keeping the rows
//! let (conn, report) = migrator.open_with_report(
//!     "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, email TEXT);",
//!     &path,
//! )?;
//! assert_eq!(report.action, OpenAction::Migrated);
//! assert_eq!(report.rows_copied(), 1);
//! assert_eq!(get_columns(&conn, "users")?, vec!["id", "name", "email"]);
//!
//! // going back is refused
//! let err = migrator
//!     .open("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);", &path)
//!     .unwrap_err();
//! assert!(err.to_string().contains("backward migration detected"));
//! # Ok(())
//! # }
//! ```
//!
//! # What is carried over
//!
//! For every table present in both the old and the new schema, the columns present in both
//! are copied. Tables and columns that exist only in the new schema start empty (or with their
//! declared defaults); those that exist only in the old one are dropped. Indexes, triggers and
//! views always come from the new schema. A rename looks like a drop plus an add.
//!
//! A new `NOT NULL` column without a default cannot be filled for existing rows, so such a
//! schema fails with [`Error::Constraint`] before anything is written.
//!
//! # Files
//!
//! Next to `app.db` the library uses `app.db.backup` (the pre-migration snapshot, never
//! deleted), `app.db.tmp` (the build target, gone when a call returns) and
//! `app.db.migration.lock` (the advisory lock, transient).
//!
//! # Targets
//!
//! Anywhere a database is named, a [`DbTarget`] is accepted: a path, or a string with an
//! optional query, such as `app.db?_journal_mode=WAL&_busy_timeout=5000&_foreign_keys=on`.
//!
//! # Tracing
//!
//! With the `tracing` feature (on by default) the library emits spans and events through
//! [`tracing`](https://docs.rs/tracing). Install any subscriber to see them:
//!
//! ```
//! let subscriber = tracing_subscriber::fmt()
//!     .with_max_level(tracing::Level::DEBUG)
//!     .finish();
//! tracing::subscriber::with_default(subscriber, || {
//!     autosqlite::open("CREATE TABLE t (id INTEGER);", ":memory:").unwrap();
//! });
//! ```
//!
//! # Feature flags
//! - `tracing` - structured logging.
//! - `testing` - the [`testing`] module with a file-backed test harness.

mod core;
pub use crate::core::{
    content_hash, normalize_schema, Classification, OpenAction, OpenReport, Plan, SchemaVersion,
    TableCopyReport,
};

mod error;
pub use crate::error::{Error, Phase};

pub mod introspect;
pub use introspect::{get_columns, get_table_info, get_tables, CatalogObject, ColumnInfo, SchemaFingerprint};

mod compare;

pub mod copy;
pub use copy::find_common_columns;

pub mod lineage;
pub use lineage::LineageTracker;

pub mod lock;

mod migrator;
pub use migrator::Migrator;

pub mod target;
pub use target::DbTarget;

#[cfg(any(test, feature = "testing"))]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub mod testing;

use rusqlite::Connection;

/// Open the database at `target` with a default [`Migrator`]: create it, open it as is, or
/// migrate it to `schema`.
pub fn open(schema: &str, target: impl Into<DbTarget>) -> Result<Connection, Error> {
    Migrator::new().open(schema, target)
}

/// Migrate the existing database at `target` in place with a default [`Migrator`].
pub fn migrate(schema: &str, target: impl Into<DbTarget>) -> Result<Connection, Error> {
    Migrator::new().migrate(schema, target)
}

/// Write a migrated copy of `old` to `new` with a default [`Migrator`], leaving `old` untouched.
pub fn migrate_to_new_file(
    schema: &str,
    old: impl Into<DbTarget>,
    new: impl Into<DbTarget>,
) -> Result<Connection, Error> {
    Migrator::new().migrate_to_new_file(schema, old, new)
}

/// Whether the database at `target` already has the structure `schema` describes.
/// Returns `false` instead of failing.
pub fn schemas_equal(schema: &str, target: impl Into<DbTarget>) -> bool {
    Migrator::new().schemas_equal(schema, target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_functions_use_default_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        let old_schema = "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT);";
        let new_schema = "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT, pinned INTEGER NOT NULL DEFAULT 0);";

        let conn = open(old_schema, &path).unwrap();
        conn.execute("INSERT INTO notes (body) VALUES ('hello')", []).unwrap();
        drop(conn);
        assert!(schemas_equal(old_schema, &path));
        assert!(!schemas_equal(new_schema, &path));

        let export = dir.path().join("export.db");
        let copy = migrate_to_new_file(new_schema, &path, &export).unwrap();
        assert_eq!(get_columns(&copy, "notes").unwrap(), vec!["id", "body", "pinned"]);
        drop(copy);
        assert!(schemas_equal(old_schema, &path));

        let conn = migrate(new_schema, &path).unwrap();
        let pinned: i64 = conn.query_row("SELECT pinned FROM notes", [], |r| r.get(0)).unwrap();
        assert_eq!(pinned, 0);
        assert_eq!(get_tables(&conn).unwrap(), vec!["notes"]);
        assert_eq!(
            find_common_columns(&["id", "body"], &get_columns(&conn, "notes").unwrap()),
            vec!["id", "body"]
        );
    }
}
