//! Database target strings.
//!
//! A target is a file path optionally followed by a DSN-style query string, e.g.
//! `data/app.db?_busy_timeout=1000&_journal_mode=WAL`. Everything that touches the
//! filesystem (existence checks, backups, scratch files, the migration lock) works on the
//! part before `?`; the recognized parameters are applied to every handle opened on it.
//! `:memory:` and the empty string name an in-memory database.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};

use crate::error::Error;

pub(crate) const BACKUP_SUFFIX: &str = ".backup";
pub(crate) const SCRATCH_SUFFIX: &str = ".tmp";
pub(crate) const LOCK_SUFFIX: &str = ".migration.lock";

/// How a handle should be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    /// Create the file if it is missing.
    Create,
    /// Open an existing file for writing; fail if it is missing.
    Existing,
    /// Open an existing file without write access; fail if it is missing.
    ReadOnly,
}

/// A parsed database target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbTarget {
    path: PathBuf,
    params: Vec<(String, String)>,
    in_memory: bool,
}

impl DbTarget {
    /// Parse a target string. Never fails: unknown parameters are kept and ignored.
    pub fn parse(target: &str) -> Self {
        let (file, query) = match target.split_once('?') {
            Some((file, query)) => (file, Some(query)),
            None => (target, None),
        };

        let params = query
            .map(|q| {
                q.split('&')
                    .filter(|pair| !pair.is_empty())
                    .map(|pair| match pair.split_once('=') {
                        Some((k, v)) => (k.to_string(), v.to_string()),
                        None => (pair.to_string(), String::new()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            in_memory: file.is_empty() || file == ":memory:",
            path: PathBuf::from(file),
            params,
        }
    }

    /// Build a target from a plain filesystem path with no parameters.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        Self {
            in_memory: path.as_os_str().is_empty() || path == Path::new(":memory:"),
            path: path.to_path_buf(),
            params: Vec::new(),
        }
    }

    /// The database file path, without parameters.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }

    /// Value of a DSN parameter, if present.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn exists(&self) -> bool {
        !self.in_memory && self.path.exists()
    }

    pub fn backup_path(&self) -> PathBuf {
        self.sibling(BACKUP_SUFFIX)
    }

    pub fn scratch_path(&self) -> PathBuf {
        self.sibling(SCRATCH_SUFFIX)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.sibling(LOCK_SUFFIX)
    }

    /// A target with the same parameters pointing at another file.
    pub(crate) fn with_path(&self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            in_memory: false,
            path,
            params: self.params.clone(),
        }
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Open a handle on this target and apply the busy timeout and recognized parameters.
    pub(crate) fn open(&self, access: Access, busy_timeout: Duration) -> Result<Connection, Error> {
        let conn = if self.in_memory {
            Connection::open_in_memory()?
        } else {
            let mode = match access {
                Access::Create => {
                    OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
                }
                Access::Existing => OpenFlags::SQLITE_OPEN_READ_WRITE,
                Access::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY,
            };
            let flags = mode | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            Connection::open_with_flags(&self.path, flags)?
        };
        self.configure(&conn, access, busy_timeout)?;
        Ok(conn)
    }

    fn configure(&self, conn: &Connection, access: Access, busy_timeout: Duration) -> Result<(), Error> {
        let busy_timeout = match self.param("_busy_timeout") {
            Some(ms) => ms
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| Error::Generic(format!("invalid _busy_timeout value '{}'", ms)))?,
            None => busy_timeout,
        };
        conn.busy_timeout(busy_timeout)?;

        for (key, value) in &self.params {
            match key.as_str() {
                "_busy_timeout" => {}
                "_journal_mode" if access != Access::ReadOnly && !self.in_memory => {
                    // journal_mode returns the resulting mode as a row
                    let _mode: String =
                        conn.query_row(&format!("PRAGMA journal_mode = {}", pragma_word(value)?), [], |row| {
                            row.get(0)
                        })?;
                }
                "_journal_mode" => {}
                "_foreign_keys" | "_fk" => {
                    conn.execute_batch(&format!("PRAGMA foreign_keys = {}", pragma_word(value)?))?;
                }
                "_synchronous" | "_sync" if access != Access::ReadOnly => {
                    conn.execute_batch(&format!("PRAGMA synchronous = {}", pragma_word(value)?))?;
                }
                _ => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(parameter = %key, "Ignoring unrecognized database parameter");
                }
            }
        }
        Ok(())
    }
}

impl From<&str> for DbTarget {
    fn from(target: &str) -> Self {
        Self::parse(target)
    }
}

impl From<String> for DbTarget {
    fn from(target: String) -> Self {
        Self::parse(&target)
    }
}

impl From<&String> for DbTarget {
    fn from(target: &String) -> Self {
        Self::parse(target)
    }
}

impl From<&Path> for DbTarget {
    fn from(path: &Path) -> Self {
        Self::from_path(path)
    }
}

impl From<PathBuf> for DbTarget {
    fn from(path: PathBuf) -> Self {
        Self::from_path(path)
    }
}

impl From<&PathBuf> for DbTarget {
    fn from(path: &PathBuf) -> Self {
        Self::from_path(path)
    }
}

impl From<&DbTarget> for DbTarget {
    fn from(target: &DbTarget) -> Self {
        target.clone()
    }
}

/// Pragma values are interpolated, so only plain words are accepted.
fn pragma_word(value: &str) -> Result<&str, Error> {
    if !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric()) {
        Ok(value)
    } else {
        Err(Error::Generic(format!("invalid pragma value '{}'", value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_path() {
        let target = DbTarget::parse("data/app.db");
        assert_eq!(target.path(), Path::new("data/app.db"));
        assert!(!target.is_in_memory());
        assert_eq!(target.param("_busy_timeout"), None);
    }

    #[test]
    fn strips_query_parameters_from_file_operations() {
        let target = DbTarget::parse("data/app.db?_busy_timeout=1000&_journal_mode=WAL");
        assert_eq!(target.path(), Path::new("data/app.db"));
        assert_eq!(target.param("_busy_timeout"), Some("1000"));
        assert_eq!(target.param("_journal_mode"), Some("WAL"));
        assert_eq!(target.backup_path(), PathBuf::from("data/app.db.backup"));
        assert_eq!(target.scratch_path(), PathBuf::from("data/app.db.tmp"));
        assert_eq!(target.lock_path(), PathBuf::from("data/app.db.migration.lock"));
    }

    #[test]
    fn converts_from_strings_and_paths() {
        let from_str: DbTarget = "app.db?_fk=on".into();
        assert_eq!(from_str.param("_fk"), Some("on"));
        // a plain path is never split on '?'
        let from_path: DbTarget = Path::new("odd?name.db").into();
        assert_eq!(from_path.path(), Path::new("odd?name.db"));
        assert_eq!(from_path.param("name.db"), None);
    }

    #[test]
    fn recognizes_in_memory_targets() {
        assert!(DbTarget::parse(":memory:").is_in_memory());
        assert!(DbTarget::parse("").is_in_memory());
        assert!(!DbTarget::parse(":memory:").exists());
    }

    #[test]
    fn applies_parameters_to_opened_handles() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("wal.db");
        let target = DbTarget::parse(&format!("{}?_journal_mode=WAL&_foreign_keys=on", file.display()));
        let conn = target.open(Access::Create, Duration::from_secs(1)).unwrap();
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0)).unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        let fk: i64 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0)).unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn existing_access_does_not_create_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = DbTarget::from_path(dir.path().join("missing.db"));
        assert!(target.open(Access::Existing, Duration::from_secs(1)).is_err());
        assert!(target.open(Access::ReadOnly, Duration::from_secs(1)).is_err());
        assert!(!target.exists());
    }

    #[test]
    fn rejects_injected_pragma_values() {
        let target = DbTarget::parse(":memory:?_foreign_keys=on;DROP");
        assert!(target.open(Access::Create, Duration::from_secs(1)).is_err());
    }
}
