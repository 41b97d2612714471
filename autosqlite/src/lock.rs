//! Cross-process serialization of migrations through an advisory lock file.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::Error;

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// An exclusive advisory lock on a `<db>.migration.lock` file, held until dropped.
///
/// On drop the lock file is removed while the lock is still held, and only if the path
/// still names the file this guard locked. Waiters that opened the old file notice it
/// was unlinked once they get the lock and start over on a fresh one.
#[derive(Debug)]
pub struct MigrationLock {
    path: PathBuf,
    file: File,
}

impl MigrationLock {
    /// Block until the lock at `path` is held. With `timeout`, give up with
    /// [`Error::LockTimeout`] once it has elapsed.
    pub fn acquire(path: impl Into<PathBuf>, timeout: Option<Duration>) -> Result<Self, Error> {
        let path = path.into();
        let started = Instant::now();
        let lock_err = |source| Error::Lock {
            path: path.clone(),
            source,
        };

        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(lock_err)?;

            match timeout {
                None => file.lock_exclusive().map_err(lock_err)?,
                Some(timeout) => loop {
                    match file.try_lock_exclusive() {
                        Ok(()) => break,
                        Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                            if started.elapsed() >= timeout {
                                #[cfg(feature = "tracing")]
                                tracing::warn!(path = %path.display(), "Timed out waiting for migration lock");
                                return Err(Error::LockTimeout {
                                    path,
                                    waited: started.elapsed(),
                                });
                            }
                            sleep(RETRY_INTERVAL);
                        }
                        Err(e) => return Err(lock_err(e)),
                    }
                },
            }

            if still_linked(&file, &path).map_err(lock_err)? {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    path = %path.display(),
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Acquired migration lock"
                );
                return Ok(Self { path, file });
            }

            // the previous holder removed this file after we opened it
            let _ = FileExt::unlock(&file);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MigrationLock {
    fn drop(&mut self) {
        if let Ok(true) = still_linked(&self.file, &self.path) {
            if let Err(_e) = fs::remove_file(&self.path) {
                #[cfg(feature = "tracing")]
                tracing::debug!(path = %self.path.display(), error = %_e, "Could not remove lock file");
            }
        }
        let _ = FileExt::unlock(&self.file);
    }
}

/// Whether `path` still refers to the same file as the open handle `file`.
#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

// Open files cannot be deleted here, so the path always names the file we hold.
#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> io::Result<bool> {
    Ok(path.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn lock_file_is_removed_on_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db.migration.lock");
        {
            let lock = MigrationLock::acquire(&path, None).unwrap();
            assert!(path.exists());
            assert_eq!(lock.path(), path);
        }
        assert!(!path.exists());
    }

    #[test]
    fn bounded_wait_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db.migration.lock");
        let _held = MigrationLock::acquire(&path, None).unwrap();

        let err = MigrationLock::acquire(&path, Some(Duration::from_millis(120))).unwrap_err();
        match err {
            Error::LockTimeout { waited, .. } => assert!(waited >= Duration::from_millis(120)),
            other => panic!("unexpected error: {other:?}"),
        }
        // the holder's file is untouched
        assert!(path.exists());
    }

    #[test]
    fn missing_directory_is_a_lock_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope").join("app.db.migration.lock");
        let err = MigrationLock::acquire(&path, None).unwrap_err();
        assert!(matches!(err, Error::Lock { .. }));
    }

    #[test]
    fn holders_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let path = Arc::new(dir.path().join("app.db.migration.lock"));
        let inside = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = Arc::clone(&path);
                let inside = Arc::clone(&inside);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let _lock = MigrationLock::acquire(path.as_path(), None).unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    thread::sleep(Duration::from_millis(10));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!path.exists());
    }
}
