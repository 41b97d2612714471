use std::path::PathBuf;
use std::time::Duration;

/// The phase of an operation in which an [Error] was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Creating directories, copying or removing files.
    Path,
    /// Executing schema text against an empty or scratch database.
    SchemaApplication,
    /// Reading the catalog of a live handle.
    Introspection,
    /// Checking new constraints against existing data.
    Constraint,
    /// Reading, classifying or recording lineage rows.
    Lineage,
    /// Copying row data between handles.
    DataCopy,
    /// Acquiring the migration lock.
    Lock,
    /// Replacing the live file with the migrated one.
    Cutover,
    /// Opening or configuring a handle.
    Engine,
}

/// Error type for the autosqlite crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("path error at {}: {source}", .path.display())]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to execute schema: {0}")]
    SchemaSyntax(#[source] rusqlite::Error),
    #[error("failed to introspect database catalog: {0}")]
    Introspection(#[source] rusqlite::Error),
    #[error("constraint violation on {table}.{column}: {reason}")]
    Constraint {
        table: String,
        column: String,
        reason: String,
    },
    #[error(
        "backward migration detected: schema {content_hash} was superseded at lineage version {superseded_at} (current version is {current})"
    )]
    BackwardMigrationRejected {
        content_hash: String,
        superseded_at: i64,
        current: i64,
    },
    #[error("timed out after {waited:?} waiting for migration lock {}", .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },
    #[error("failed to acquire migration lock {}: {source}", .path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to copy table {table}: {source}")]
    DataCopy {
        table: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("lineage error: {0}")]
    Lineage(#[source] rusqlite::Error),
    #[error("failed to move migrated database into place at {}: {source}", .path.display())]
    Cutover {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Rusqlite(rusqlite::Error),
    #[error("{0}")]
    Generic(String),
}

impl Error {
    /// The phase in which this error was raised.
    pub fn phase(&self) -> Phase {
        match self {
            Error::Path { .. } => Phase::Path,
            Error::SchemaSyntax(_) => Phase::SchemaApplication,
            Error::Introspection(_) => Phase::Introspection,
            Error::Constraint { .. } => Phase::Constraint,
            Error::BackwardMigrationRejected { .. } | Error::Lineage(_) => Phase::Lineage,
            Error::LockTimeout { .. } | Error::Lock { .. } => Phase::Lock,
            Error::DataCopy { .. } => Phase::DataCopy,
            Error::Cutover { .. } => Phase::Cutover,
            Error::Rusqlite(_) | Error::Generic(_) => Phase::Engine,
        }
    }

    pub(crate) fn path(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Path {
            path: path.into(),
            source,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Self::Rusqlite(value)
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backward_rejection_message_names_the_condition() {
        let err = Error::BackwardMigrationRejected {
            content_hash: "abc".to_string(),
            superseded_at: 1,
            current: 2,
        };
        assert!(err.to_string().contains("backward migration detected"));
        assert_eq!(err.phase(), Phase::Lineage);
    }

    #[test]
    fn phases_follow_variants() {
        let io = || std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(Error::path("a.db", io()).phase(), Phase::Path);
        assert_eq!(
            Error::Cutover {
                path: "a.db".into(),
                source: io()
            }
            .phase(),
            Phase::Cutover
        );
        assert_eq!(
            Error::SchemaSyntax(rusqlite::Error::InvalidQuery).phase(),
            Phase::SchemaApplication
        );
        assert_eq!(
            Error::from("custom".to_string()).phase(),
            Phase::Engine
        );
    }
}
