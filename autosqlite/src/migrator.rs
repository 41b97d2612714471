use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use rusqlite::Connection;

use crate::compare;
use crate::copy::copy_common_tables;
use crate::core::{
    content_hash, Classification, OpenAction, OpenReport, Plan, SchemaVersion,
    DEFAULT_LINEAGE_TABLE_NAME,
};
use crate::error::Error;
use crate::introspect::list_tables;
use crate::lineage::LineageTracker;
use crate::lock::MigrationLock;
use crate::target::{Access, DbTarget};

/// The entrypoint for opening databases against a desired schema.
///
/// A `Migrator` holds configuration only; every call opens its own handles, so one
/// instance can be shared freely between threads.
pub struct Migrator {
    lineage: LineageTracker,
    busy_timeout: Duration,
    lock_timeout: Option<Duration>,
    on_migration_start: Option<Box<dyn Fn(&Path, i64) + Send + Sync>>,
    on_migration_complete: Option<Box<dyn Fn(&Path, &OpenReport, Duration) + Send + Sync>>,
    on_migration_error: Option<Box<dyn Fn(&Path, &Error) + Send + Sync>>,
}

// Manual Debug impl since closures don't implement Debug
impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("lineage_table_name", &self.lineage.table_name())
            .field("busy_timeout", &self.busy_timeout)
            .field("lock_timeout", &self.lock_timeout)
            .field("on_migration_start", &self.on_migration_start.is_some())
            .field(
                "on_migration_complete",
                &self.on_migration_complete.is_some(),
            )
            .field("on_migration_error", &self.on_migration_error.is_some())
            .finish()
    }
}

impl Default for Migrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Migrator {
    pub fn new() -> Self {
        Self {
            lineage: LineageTracker::new(DEFAULT_LINEAGE_TABLE_NAME),
            busy_timeout: Duration::from_secs(30),
            lock_timeout: None,
            on_migration_start: None,
            on_migration_complete: None,
            on_migration_error: None,
        }
    }

    /// Set a custom name for the lineage table.
    /// Defaults to "_autosqlite_lineage_".
    pub fn with_lineage_table_name(mut self, name: impl Into<String>) -> Self {
        self.lineage = LineageTracker::new(name);
        self
    }

    /// Set the busy timeout applied to every handle this migrator opens.
    /// Defaults to 30 seconds. A `_busy_timeout` parameter on the target takes precedence.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Bound the wait for the migration lock. `None`, the default, waits indefinitely.
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set a callback invoked when a data-carrying migration starts.
    /// The callback receives the database path and the lineage ordinal being migrated from
    /// (0 for a database without lineage).
    ///
    /// # Example
    /// ```
    /// use autosqlite::Migrator;
    ///
    /// let migrator = Migrator::new().on_migration_start(|path, from_ordinal| {
    ///     println!("Migrating {} from version {}", path.display(), from_ordinal);
    /// });
    /// ```
    pub fn on_migration_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Path, i64) + Send + Sync + 'static,
    {
        self.on_migration_start = Some(Box::new(callback));
        self
    }

    /// Set a callback invoked after a migration has been cut over.
    /// The callback receives the database path, the report and the elapsed time.
    pub fn on_migration_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Path, &OpenReport, Duration) + Send + Sync + 'static,
    {
        self.on_migration_complete = Some(Box::new(callback));
        self
    }

    /// Set a callback invoked when a started migration fails.
    /// The database file is unchanged when this fires.
    pub fn on_migration_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Path, &Error) + Send + Sync + 'static,
    {
        self.on_migration_error = Some(Box::new(callback));
        self
    }

    pub fn lineage(&self) -> &LineageTracker {
        &self.lineage
    }

    /// Returns the names of all user tables in `conn`, leaving out this migrator's
    /// lineage table.
    pub fn get_tables(&self, conn: &Connection) -> Result<Vec<String>, Error> {
        list_tables(conn, self.lineage.table_name())
    }

    /// Open the database at `target`, creating or migrating it so that it runs `schema`.
    pub fn open(&self, schema: &str, target: impl Into<DbTarget>) -> Result<Connection, Error> {
        self.open_with_report(schema, target).map(|(conn, _)| conn)
    }

    /// Like [`open`](Self::open), also returning what was done.
    pub fn open_with_report(
        &self,
        schema: &str,
        target: impl Into<DbTarget>,
    ) -> Result<(Connection, OpenReport), Error> {
        let target = target.into();
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("autosqlite_open", path = %target.path().display()).entered();

        if target.is_in_memory() {
            return self.create_in_memory(schema, &target);
        }
        if !target.exists() {
            return self.create_fresh(schema, &target);
        }
        self.open_existing(schema, &target)
    }

    /// Migrate the existing database at `target` to `schema` in place, keeping a backup.
    ///
    /// Unlike [`open`](Self::open) a structurally equivalent schema is still carried
    /// through a full rebuild. A database already at `schema` is opened unchanged.
    pub fn migrate(&self, schema: &str, target: impl Into<DbTarget>) -> Result<Connection, Error> {
        self.migrate_with_report(schema, target).map(|(conn, _)| conn)
    }

    pub fn migrate_with_report(
        &self,
        schema: &str,
        target: impl Into<DbTarget>,
    ) -> Result<(Connection, OpenReport), Error> {
        let target = target.into();
        #[cfg(feature = "tracing")]
        let _span =
            tracing::info_span!("autosqlite_migrate", path = %target.path().display()).entered();

        if target.is_in_memory() {
            return self.create_in_memory(schema, &target);
        }
        if !target.exists() {
            return Err(not_found(target.path()));
        }
        self.migrate_locked(schema, &target, false)
    }

    /// Build a copy of the database at `old` with `schema` applied, at `new`.
    ///
    /// `old` is only read and no lock is taken on it. The new file carries the old lineage
    /// plus a row for `schema`. `new` must not exist yet.
    pub fn migrate_to_new_file(
        &self,
        schema: &str,
        old: impl Into<DbTarget>,
        new: impl Into<DbTarget>,
    ) -> Result<Connection, Error> {
        self.migrate_to_new_file_with_report(schema, old, new)
            .map(|(conn, _)| conn)
    }

    pub fn migrate_to_new_file_with_report(
        &self,
        schema: &str,
        old: impl Into<DbTarget>,
        new: impl Into<DbTarget>,
    ) -> Result<(Connection, OpenReport), Error> {
        let old = old.into();
        let new = new.into();
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!(
            "autosqlite_export",
            path = %old.path().display(),
            dest = %new.path().display()
        )
        .entered();

        if new.is_in_memory() {
            return Err(Error::Generic(
                "destination of an export must be a file".to_string(),
            ));
        }
        if new.exists() {
            return Err(Error::path(
                new.path(),
                io::Error::new(io::ErrorKind::AlreadyExists, "destination database already exists"),
            ));
        }
        if !old.is_in_memory() && !old.exists() {
            return Err(not_found(old.path()));
        }

        let source = old.open(Access::ReadOnly, self.busy_timeout)?;
        let record = match self.classify(&source, schema)? {
            Classification::Identical => false,
            Classification::Forward => true,
            Classification::Backward {
                superseded_at,
                current,
            } => return Err(backward(schema, superseded_at, current)),
        };

        create_parent_dirs(new.path())?;
        match self.build_migrated(schema, &source, &new, record) {
            Ok(built) => Ok(built),
            Err(e) => {
                remove_database_files(new.path());
                Err(e)
            }
        }
    }

    /// Whether `schema` describes the structure the database at `target` already has.
    /// Never fails: a missing file, an invalid schema or an unreadable database is `false`.
    pub fn schemas_equal(&self, schema: &str, target: impl Into<DbTarget>) -> bool {
        let target = target.into();
        if !target.exists() {
            return false;
        }
        match target.open(Access::ReadOnly, self.busy_timeout) {
            Ok(conn) => compare::equivalent(schema, &conn, self.lineage.table_name()),
            Err(_) => false,
        }
    }

    /// What [`open`](Self::open) would do, without changing anything.
    pub fn plan(&self, schema: &str, target: impl Into<DbTarget>) -> Result<Plan, Error> {
        let target = target.into();
        if target.is_in_memory() || !target.exists() {
            return Ok(Plan::CreateFresh);
        }
        let conn = target.open(Access::ReadOnly, self.busy_timeout)?;
        let plan = match self.classify(&conn, schema)? {
            Classification::Identical => Plan::OpenAsIs,
            Classification::Backward { .. } => Plan::RejectBackward,
            Classification::Forward => {
                if compare::equivalent(schema, &conn, self.lineage.table_name()) {
                    Plan::Stamp
                } else {
                    Plan::Migrate
                }
            }
        };
        Ok(plan)
    }

    /// Check that `schema` executes against an empty database.
    pub fn validate(&self, schema: &str) -> Result<(), Error> {
        compare::fingerprint_schema(schema, self.lineage.table_name())?;
        Ok(())
    }

    /// Every schema version recorded for the database at `target`, oldest first.
    pub fn history(&self, target: impl Into<DbTarget>) -> Result<Vec<SchemaVersion>, Error> {
        let target = target.into();
        if target.is_in_memory() {
            return Ok(vec![]);
        }
        if !target.exists() {
            return Err(not_found(target.path()));
        }
        let conn = target.open(Access::ReadOnly, self.busy_timeout)?;
        self.lineage.history(&conn)
    }

    fn classify(&self, conn: &Connection, schema: &str) -> Result<Classification, Error> {
        let classification = self.lineage.classify(conn, schema)?;
        #[cfg(feature = "tracing")]
        tracing::debug!(classification = ?classification, "Classified candidate schema");
        Ok(classification)
    }

    fn create_in_memory(
        &self,
        schema: &str,
        target: &DbTarget,
    ) -> Result<(Connection, OpenReport), Error> {
        let conn = target.open(Access::Create, self.busy_timeout)?;
        conn.execute_batch(schema).map_err(Error::SchemaSyntax)?;
        let ordinal = self.lineage.record(&conn, schema)?;
        Ok((conn, OpenReport::new(OpenAction::Created, ordinal)))
    }

    /// Build a new database in the scratch file under the lock and move it into place.
    fn create_fresh(
        &self,
        schema: &str,
        target: &DbTarget,
    ) -> Result<(Connection, OpenReport), Error> {
        create_parent_dirs(target.path())?;
        let lock = MigrationLock::acquire(target.lock_path(), self.lock_timeout)?;

        if target.exists() {
            // another caller created it while we waited
            drop(lock);
            return self.open_existing(schema, target);
        }

        let scratch = target.scratch_path();
        remove_stale_scratch(&scratch)?;
        let ordinal = match self.build_fresh(schema, &target.with_path(&scratch)) {
            Ok(ordinal) => ordinal,
            Err(e) => {
                remove_database_files(&scratch);
                #[cfg(feature = "tracing")]
                tracing::error!(error = %e, "Failed to create database");
                return Err(e);
            }
        };
        cutover(&scratch, target.path())?;

        #[cfg(feature = "tracing")]
        tracing::info!(ordinal, "Created database");

        let conn = target.open(Access::Existing, self.busy_timeout)?;
        Ok((conn, OpenReport::new(OpenAction::Created, ordinal)))
    }

    fn build_fresh(&self, schema: &str, dest: &DbTarget) -> Result<i64, Error> {
        let conn = dest.open(Access::Create, self.busy_timeout)?;
        conn.execute_batch(schema).map_err(Error::SchemaSyntax)?;
        self.lineage.record(&conn, schema)
    }

    fn open_existing(
        &self,
        schema: &str,
        target: &DbTarget,
    ) -> Result<(Connection, OpenReport), Error> {
        let conn = target.open(Access::Existing, self.busy_timeout)?;
        match self.classify(&conn, schema)? {
            Classification::Identical => {
                let ordinal = self.current_ordinal(&conn)?;
                Ok((conn, OpenReport::new(OpenAction::Opened, ordinal)))
            }
            Classification::Backward {
                superseded_at,
                current,
            } => Err(backward(schema, superseded_at, current)),
            Classification::Forward => {
                drop(conn);
                self.migrate_locked(schema, target, true)
            }
        }
    }

    /// The destructive part of a migration, serialized by the path lock.
    fn migrate_locked(
        &self,
        schema: &str,
        target: &DbTarget,
        allow_stamp: bool,
    ) -> Result<(Connection, OpenReport), Error> {
        let started = Instant::now();
        let lock = MigrationLock::acquire(target.lock_path(), self.lock_timeout)?;

        if !target.exists() {
            drop(lock);
            return self.create_fresh(schema, target);
        }

        // the pre-lock classification is only a hint
        let old = target.open(Access::Existing, self.busy_timeout)?;
        let from_ordinal = self.current_ordinal(&old)?;
        match self.classify(&old, schema)? {
            Classification::Identical => {
                return Ok((old, OpenReport::new(OpenAction::Opened, from_ordinal)));
            }
            Classification::Backward {
                superseded_at,
                current,
            } => return Err(backward(schema, superseded_at, current)),
            Classification::Forward => {}
        }

        if allow_stamp && compare::equivalent(schema, &old, self.lineage.table_name()) {
            let ordinal = self.lineage.record(&old, schema)?;
            #[cfg(feature = "tracing")]
            tracing::info!(ordinal, "Structure already matches, stamped lineage");
            return Ok((old, OpenReport::new(OpenAction::Stamped, ordinal)));
        }

        if let Some(ref callback) = self.on_migration_start {
            callback(target.path(), from_ordinal);
        }
        #[cfg(feature = "tracing")]
        tracing::info!(from_ordinal, "Starting migration");

        match self.rebuild(schema, target, old) {
            Ok((conn, report)) => {
                let elapsed = started.elapsed();
                #[cfg(feature = "tracing")]
                tracing::info!(
                    ordinal = report.ordinal,
                    rows_copied = report.rows_copied(),
                    duration_ms = elapsed.as_millis() as u64,
                    "Migration completed successfully"
                );
                if let Some(ref callback) = self.on_migration_complete {
                    callback(target.path(), &report, elapsed);
                }
                Ok((conn, report))
            }
            Err(error) => {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %error, phase = ?error.phase(), "Migration failed");
                if let Some(ref callback) = self.on_migration_error {
                    callback(target.path(), &error);
                }
                Err(error)
            }
        }
    }

    /// Build the migrated file next to the original, back the original up and swap the
    /// new file in. A failed build leaves the previous backup in place.
    fn rebuild(
        &self,
        schema: &str,
        target: &DbTarget,
        old: Connection,
    ) -> Result<(Connection, OpenReport), Error> {
        // fold any WAL content into the main file before copying it
        old.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;

        let scratch = target.scratch_path();
        remove_stale_scratch(&scratch)?;
        let built = self.build_migrated(schema, &old, &target.with_path(&scratch), true);
        drop(old);
        let mut report = match built {
            Ok((conn, report)) => {
                drop(conn);
                report
            }
            Err(e) => {
                remove_database_files(&scratch);
                return Err(e);
            }
        };

        let backup = target.backup_path();
        if let Err(e) = fs::copy(target.path(), &backup) {
            remove_database_files(&scratch);
            return Err(Error::path(&backup, e));
        }
        #[cfg(feature = "tracing")]
        tracing::info!(backup = %backup.display(), "Backup created");

        let cutover_started = Instant::now();
        if let Err(e) = cutover(&scratch, target.path()) {
            restore_from_backup(&backup, target.path());
            return Err(e);
        }
        #[cfg(feature = "tracing")]
        tracing::info!(
            duration_ms = cutover_started.elapsed().as_millis() as u64,
            "Cutover complete"
        );
        #[cfg(not(feature = "tracing"))]
        let _ = cutover_started;

        let conn = target.open(Access::Existing, self.busy_timeout)?;
        report.backup_path = Some(backup);
        Ok((conn, report))
    }

    /// Create `dest` from `schema` and carry the lineage and common table data over from `old`.
    fn build_migrated(
        &self,
        schema: &str,
        old: &Connection,
        dest: &DbTarget,
        record: bool,
    ) -> Result<(Connection, OpenReport), Error> {
        let mut new = dest.open(Access::Create, self.busy_timeout)?;
        new.execute_batch(schema).map_err(Error::SchemaSyntax)?;
        self.lineage.copy_into(old, &new)?;
        let tables = copy_common_tables(old, &mut new, self.lineage.table_name())?;
        let ordinal = if record {
            self.lineage.record(&new, schema)?
        } else {
            self.current_ordinal(&new)?
        };

        let mut report = OpenReport::new(OpenAction::Migrated, ordinal);
        report.tables = tables;
        Ok((new, report))
    }

    fn current_ordinal(&self, conn: &Connection) -> Result<i64, Error> {
        Ok(self
            .lineage
            .current_version(conn)?
            .map(|v| v.ordinal)
            .unwrap_or(0))
    }
}

fn backward(schema: &str, superseded_at: i64, current: i64) -> Error {
    let error = Error::BackwardMigrationRejected {
        content_hash: content_hash(schema),
        superseded_at,
        current,
    };
    #[cfg(feature = "tracing")]
    tracing::error!(error = %error, "Rejected schema");
    error
}

fn not_found(path: &Path) -> Error {
    Error::path(
        path,
        io::Error::new(io::ErrorKind::NotFound, "database file does not exist"),
    )
}

fn create_parent_dirs(path: &Path) -> Result<(), Error> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|e| Error::path(parent, e))
        }
        _ => Ok(()),
    }
}

fn cutover(scratch: &Path, path: &Path) -> Result<(), Error> {
    fs::rename(scratch, path).map_err(|source| {
        remove_database_files(scratch);
        Error::Cutover {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Put the backup back if a failed cutover left no live file behind.
fn restore_from_backup(backup: &Path, path: &Path) {
    if path.exists() {
        return;
    }
    match fs::copy(backup, path) {
        Ok(_) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(backup = %backup.display(), "Restored database from backup after failed cutover");
        }
        Err(_e) => {
            #[cfg(feature = "tracing")]
            tracing::error!(backup = %backup.display(), error = %_e, "Could not restore database from backup");
        }
    }
}

const SIDECAR_SUFFIXES: [&str; 3] = ["-journal", "-wal", "-shm"];

/// Remove a scratch file left behind by a crashed run, with its journal files.
fn remove_stale_scratch(scratch: &Path) -> Result<(), Error> {
    for path in std::iter::once(scratch.to_path_buf()).chain(sidecars(scratch)) {
        match fs::remove_file(&path) {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(path = %path.display(), "Removed stale scratch file");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::path(path, e)),
        }
    }
    Ok(())
}

/// Best-effort removal of a database file and its journal files.
fn remove_database_files(path: &Path) {
    let _ = fs::remove_file(path);
    for sidecar in sidecars(path) {
        let _ = fs::remove_file(sidecar);
    }
}

fn sidecars(path: &Path) -> impl Iterator<Item = std::path::PathBuf> + '_ {
    SIDECAR_SUFFIXES.iter().map(move |suffix| {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        name.into()
    })
}
