use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub(crate) const DEFAULT_LINEAGE_TABLE_NAME: &str = "_autosqlite_lineage_";

/// A schema that has been applied to a database file, as recorded in its lineage table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaVersion {
    /// Position in the lineage, starting at 1 and strictly increasing.
    pub ordinal: i64,
    /// Hex SHA-256 digest of the normalized schema text.
    pub content_hash: String,
    /// When this version was recorded.
    pub applied_at: chrono::DateTime<Utc>,
    /// The full schema text as supplied by the caller.
    pub schema_text: String,
}

/// How a candidate schema relates to the lineage of a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// The candidate is the current version.
    Identical,
    /// The candidate has never been applied.
    Forward,
    /// The candidate was applied before and has since been superseded.
    Backward { superseded_at: i64, current: i64 },
}

/// What [`Migrator::open`](crate::Migrator::open) would do for a given schema and path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    /// No database exists yet; it will be created from the schema.
    CreateFresh,
    /// The database already runs this schema.
    OpenAsIs,
    /// The database already has this structure; only a lineage row will be recorded.
    Stamp,
    /// The database will be backed up and rebuilt with the new schema.
    Migrate,
    /// The schema was superseded earlier in this database's lineage.
    RejectBackward,
}

/// What an open call actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenAction {
    Created,
    Opened,
    Stamped,
    Migrated,
}

/// Rows carried over for one table during a migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableCopyReport {
    pub table: String,
    pub columns: Vec<String>,
    pub rows_copied: usize,
}

/// A report of actions performed by an open, migrate or export call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenReport {
    pub action: OpenAction,
    /// The lineage ordinal the database is at after the call.
    pub ordinal: i64,
    /// Where the pre-migration snapshot was written, if one was taken.
    pub backup_path: Option<PathBuf>,
    pub tables: Vec<TableCopyReport>,
}

impl OpenReport {
    pub(crate) fn new(action: OpenAction, ordinal: i64) -> Self {
        Self {
            action,
            ordinal,
            backup_path: None,
            tables: Vec::new(),
        }
    }

    /// Total number of rows carried over across all tables.
    pub fn rows_copied(&self) -> usize {
        self.tables.iter().map(|t| t.rows_copied).sum()
    }
}

/// Reduce schema text to the form that is hashed: line comments and blank lines are
/// dropped and the remaining lines are trimmed and joined with single spaces.
///
/// `--` inside a quoted literal or identifier is not treated as a comment.
pub fn normalize_schema(schema: &str) -> String {
    let mut lines = Vec::new();
    // quote character still open from a previous line, if any
    let mut open_quote: Option<char> = None;

    for raw in schema.lines() {
        let mut kept = String::with_capacity(raw.len());
        let mut chars = raw.chars().peekable();
        while let Some(c) = chars.next() {
            match open_quote {
                Some(q) => {
                    if c == q {
                        open_quote = None;
                    }
                    kept.push(c);
                }
                None => {
                    if c == '-' && chars.peek() == Some(&'-') {
                        break;
                    }
                    if c == '\'' || c == '"' || c == '`' {
                        open_quote = Some(c);
                    }
                    kept.push(c);
                }
            }
        }
        let trimmed = kept.trim();
        if !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }
    }

    lines.join(" ")
}

/// Hex SHA-256 digest of the normalized schema text.
pub fn content_hash(schema: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_schema(schema).as_bytes());
    format!("{:x}", hasher.finalize())
}
