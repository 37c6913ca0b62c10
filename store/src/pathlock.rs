//! Advisory, `flock(2)`-based locks on files.
//!
//! Locks are attached to the open file description, so two handles opened
//! separately on the same path (even inside one process) exclude each
//! other like two processes would.

use lazy_static::lazy_static;
use nix::{
    errno::Errno,
    fcntl::{flock, FlockArg},
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeSet, HashSet},
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::Write,
    os::{fd::AsRawFd, unix::fs::OpenOptionsExt},
    path::{Path, PathBuf},
    time::{Duration, Instant, SystemTime},
};
use tracing::{debug, info, trace, warn};

use crate::Error;

lazy_static! {
    /// Lock files currently held through a [PathLocks] of this process.
    static ref LOCKED_PATHS: Mutex<HashSet<PathBuf>> = Default::default();
}

/// Interval [FileLock::acquire_timeout] polls at.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockType {
    /// Shared.
    Read,
    /// Exclusive.
    Write,
    /// Unlocked.
    None,
}

/// Opens (and with `create`, creates) the lock file at `path`, creating
/// missing parent directories. Returns `None` if it doesn't exist and
/// `create` is false.
pub fn open_lock_file(path: &Path, create: bool) -> Result<Option<File>, Error> {
    if create {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(Error::io("creating directory", parent))?;
        }
    }

    match OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .mode(0o600)
        .open(path)
    {
        Ok(file) => Ok(Some(file)),
        Err(e) if !create && e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io("opening lock file", path)(e)),
    }
}

pub(crate) fn create_lock_file(path: &Path) -> Result<File, Error> {
    open_lock_file(path, true)?.ok_or_else(|| {
        Error::io("opening lock file", path)(std::io::ErrorKind::NotFound.into())
    })
}

/// Puts a lock of the given type on `file`. Returns false if `wait` is unset
/// and the lock is held elsewhere.
pub fn lock_file(file: &File, lock_type: LockType, wait: bool) -> std::io::Result<bool> {
    let arg = match (lock_type, wait) {
        (LockType::Read, true) => FlockArg::LockShared,
        (LockType::Read, false) => FlockArg::LockSharedNonblock,
        (LockType::Write, true) => FlockArg::LockExclusive,
        (LockType::Write, false) => FlockArg::LockExclusiveNonblock,
        (LockType::None, true) => FlockArg::Unlock,
        (LockType::None, false) => FlockArg::UnlockNonblock,
    };

    loop {
        match flock(file.as_raw_fd(), arg) {
            Ok(()) => return Ok(true),
            Err(Errno::EINTR) => continue,
            Err(Errno::EWOULDBLOCK) if !wait => return Ok(false),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Removes the lock file at `path` and marks the still open `file` as
/// deleted, so processes blocked on it know to retry with a fresh file.
pub fn delete_lock_file(path: &Path, mut file: &File) -> Result<(), Error> {
    // The unlink may fail if someone else already removed it.
    let _ = fs::remove_file(path);
    file.write_all(b"d")
        .map_err(Error::io("writing to lock file", path))
}

/// A lock held on a single file. The lock is released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
    mode: LockType,
}

impl FileLock {
    /// Opens (creating if needed) and locks the file at `path`.
    /// Returns `None` if `wait` is unset and the lock is held elsewhere.
    pub fn acquire(path: &Path, mode: LockType, wait: bool) -> Result<Option<Self>, Error> {
        Self::from_file(create_lock_file(path)?, path, mode, wait)
    }

    /// Locks an already opened file.
    pub fn from_file(
        file: File,
        path: &Path,
        mode: LockType,
        wait: bool,
    ) -> Result<Option<Self>, Error> {
        if !lock_file(&file, mode, wait).map_err(Error::lock(path))? {
            return Ok(None);
        }

        Ok(Some(Self::from_locked(file, path, mode)))
    }

    /// Wraps a file the caller already locked with `mode`.
    pub(crate) fn from_locked(file: File, path: &Path, mode: LockType) -> Self {
        Self {
            file,
            path: path.to_owned(),
            mode,
        }
    }

    /// Like [FileLock::acquire] with `wait`, but gives up and returns `None`
    /// once `timeout` elapsed.
    pub fn acquire_timeout(
        path: &Path,
        mode: LockType,
        timeout: Duration,
    ) -> Result<Option<Self>, Error> {
        let file = create_lock_file(path)?;
        let deadline = Instant::now() + timeout;

        loop {
            if lock_file(&file, mode, false).map_err(Error::lock(path))? {
                return Ok(Some(Self::from_locked(file, path, mode)));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Changes the lock to `mode`. Returns false if `wait` is unset and the
    /// new mode can't be granted right away; the old lock may be lost in
    /// that case.
    pub fn set_mode(&mut self, mode: LockType, wait: bool) -> Result<bool, Error> {
        if !lock_file(&self.file, mode, wait).map_err(Error::lock(&self.path))? {
            return Ok(false);
        }
        self.mode = mode;
        Ok(true)
    }

    /// Converts a shared lock into an exclusive one, blocking until all other
    /// holders are gone.
    pub fn upgrade(&mut self) -> Result<(), Error> {
        self.set_mode(LockType::Write, true).map(|_| ())
    }

    /// Converts an exclusive lock back into a shared one.
    pub fn downgrade(&mut self) -> Result<(), Error> {
        self.set_mode(LockType::Read, true).map(|_| ())
    }

    /// Sets the mtime of the lock file to now.
    pub fn touch(&self) -> Result<(), Error> {
        self.file
            .set_modified(SystemTime::now())
            .map_err(Error::io("touching lock file", &self.path))
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockType {
        self.mode
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if self.mode != LockType::None {
            if let Err(e) = lock_file(&self.file, LockType::None, false) {
                warn!(path = ?self.path, err = %e, "failed to release lock");
            }
        }
    }
}

/// Returns the path of the lock file guarding `path`.
fn lock_path_for(path: &Path) -> PathBuf {
    let mut lock_path: OsString = path.as_os_str().to_owned();
    lock_path.push(".lock");
    lock_path.into()
}

/// Whether this process holds the lock on `path` through a [PathLocks].
pub fn path_is_locked_by_me(path: &Path) -> bool {
    LOCKED_PATHS.lock().contains(&lock_path_for(path))
}

/// Exclusive locks on a set of paths, each through a `<path>.lock` file.
/// Paths are locked in sorted order, so two processes locking overlapping
/// sets can't deadlock. All locks are released on drop.
#[derive(Debug, Default)]
pub struct PathLocks {
    fds: Vec<(File, PathBuf)>,
    deletion: bool,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks all `paths`, blocking as long as needed. `wait_msg` is logged
    /// if a lock can't be acquired right away.
    pub fn lock<I, P>(paths: I, wait_msg: &str) -> Result<Self, Error>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut locks = Self::new();
        locks.lock_paths(paths, Some(wait_msg), true)?;
        Ok(locks)
    }

    /// Locks all `paths`. Without `wait`, returns false (holding none of
    /// them) as soon as one is held elsewhere.
    pub fn lock_paths<I, P>(
        &mut self,
        paths: I,
        wait_msg: Option<&str>,
        wait: bool,
    ) -> Result<bool, Error>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let paths: BTreeSet<PathBuf> = paths.into_iter().map(|p| p.as_ref().to_owned()).collect();

        for path in paths {
            trace!(path = ?path, "locking path");
            let lock_path = lock_path_for(&path);

            if !LOCKED_PATHS.lock().insert(lock_path.clone()) {
                self.unlock();
                return Err(Error::Deadlock(lock_path));
            }

            match Self::lock_one(&lock_path, wait_msg, wait) {
                Ok(Some(file)) => self.fds.push((file, lock_path)),
                Ok(None) => {
                    LOCKED_PATHS.lock().remove(&lock_path);
                    self.unlock();
                    return Ok(false);
                }
                Err(e) => {
                    LOCKED_PATHS.lock().remove(&lock_path);
                    self.unlock();
                    return Err(e);
                }
            }
        }

        Ok(true)
    }

    fn lock_one(lock_path: &Path, wait_msg: Option<&str>, wait: bool) -> Result<Option<File>, Error> {
        loop {
            let file = create_lock_file(lock_path)?;

            if !lock_file(&file, LockType::Write, false).map_err(Error::lock(lock_path))? {
                if !wait {
                    return Ok(None);
                }
                if let Some(msg) = wait_msg {
                    info!("{}", msg);
                }
                lock_file(&file, LockType::Write, true).map_err(Error::lock(lock_path))?;
            }

            debug!(path = ?lock_path, "lock acquired");

            // The previous owner deleted the file after we opened it.
            let len = file
                .metadata()
                .map_err(Error::io("statting lock file", lock_path))?
                .len();
            if len != 0 {
                debug!(path = ?lock_path, "open lock file has become stale");
                continue;
            }

            return Ok(Some(file));
        }
    }

    /// Releases all held locks, deleting the lock files if
    /// [PathLocks::set_deletion] was enabled.
    pub fn unlock(&mut self) {
        let deletion = self.deletion;
        for (file, lock_path) in self.fds.drain(..) {
            if deletion {
                if let Err(e) = delete_lock_file(&lock_path, &file) {
                    warn!(path = ?lock_path, err = %e, "failed to delete lock file");
                }
            }
            LOCKED_PATHS.lock().remove(&lock_path);
            trace!(path = ?lock_path, "lock released");
            // closing the file releases the lock.
            drop(file);
        }
    }

    pub fn set_deletion(&mut self, deletion: bool) {
        self.deletion = deletion;
    }
}

impl Drop for PathLocks {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::{FileLock, LockType, PathLocks};
    use crate::Error;
    use rstest::rstest;
    use std::time::Duration;
    use tempfile::TempDir;

    #[rstest]
    #[case::write_excludes_write(LockType::Write, LockType::Write, false)]
    #[case::write_excludes_read(LockType::Write, LockType::Read, false)]
    #[case::read_excludes_write(LockType::Read, LockType::Write, false)]
    #[case::read_shares_read(LockType::Read, LockType::Read, true)]
    fn modes(#[case] held: LockType, #[case] wanted: LockType, #[case] granted: bool) {
        let tmpdir = TempDir::new().unwrap();
        let path = tmpdir.path().join("lock");

        let _held = FileLock::acquire(&path, held, true)
            .expect("must succeed")
            .expect("must be granted");

        assert_eq!(
            granted,
            FileLock::acquire(&path, wanted, false)
                .expect("must succeed")
                .is_some()
        );
    }

    #[test]
    fn released_on_drop() {
        let tmpdir = TempDir::new().unwrap();
        let path = tmpdir.path().join("lock");

        let held = FileLock::acquire(&path, LockType::Write, true).unwrap();
        assert!(FileLock::acquire(&path, LockType::Write, false).unwrap().is_none());

        drop(held);
        assert!(FileLock::acquire(&path, LockType::Write, false).unwrap().is_some());
    }

    #[test]
    fn creates_parent_dirs() {
        let tmpdir = TempDir::new().unwrap();
        let path = tmpdir.path().join("a/b/lock");

        FileLock::acquire(&path, LockType::Read, true)
            .expect("must succeed")
            .expect("must be granted");
        assert!(path.exists());
    }

    #[test]
    fn upgrade_downgrade() {
        let tmpdir = TempDir::new().unwrap();
        let path = tmpdir.path().join("lock");

        let mut lock = FileLock::acquire(&path, LockType::Read, true)
            .unwrap()
            .unwrap();

        lock.upgrade().expect("must succeed");
        assert_eq!(LockType::Write, lock.mode());
        assert!(FileLock::acquire(&path, LockType::Read, false).unwrap().is_none());

        lock.downgrade().expect("must succeed");
        assert_eq!(LockType::Read, lock.mode());
        assert!(FileLock::acquire(&path, LockType::Read, false).unwrap().is_some());
        assert!(FileLock::acquire(&path, LockType::Write, false).unwrap().is_none());
    }

    #[test]
    fn acquire_timeout() {
        let tmpdir = TempDir::new().unwrap();
        let path = tmpdir.path().join("upload-lock");

        let held = FileLock::acquire(&path, LockType::Write, true).unwrap();
        assert!(
            FileLock::acquire_timeout(&path, LockType::Write, Duration::from_millis(250))
                .expect("must succeed")
                .is_none()
        );

        drop(held);
        assert!(
            FileLock::acquire_timeout(&path, LockType::Write, Duration::from_millis(250))
                .expect("must succeed")
                .is_some()
        );
    }

    #[test]
    fn path_locks_reentry_is_deadlock() {
        let tmpdir = TempDir::new().unwrap();
        let a = tmpdir.path().join("a");
        let b = tmpdir.path().join("b");

        let locks = PathLocks::lock([&b, &a], "waiting").expect("must lock");
        assert!(super::path_is_locked_by_me(&a));
        assert!(super::path_is_locked_by_me(&b));

        assert!(matches!(
            PathLocks::lock([&a], "waiting"),
            Err(Error::Deadlock(_))
        ));

        // other lock holders can't take it either.
        assert!(
            FileLock::acquire(&tmpdir.path().join("a.lock"), LockType::Write, false)
                .unwrap()
                .is_none()
        );

        drop(locks);
        assert!(!super::path_is_locked_by_me(&a));
        assert!(PathLocks::lock([&a], "waiting").is_ok());
    }

    #[test]
    fn path_locks_non_blocking() {
        let tmpdir = TempDir::new().unwrap();
        let a = tmpdir.path().join("a");

        let _other = FileLock::acquire(&tmpdir.path().join("a.lock"), LockType::Write, true)
            .unwrap()
            .unwrap();

        let mut locks = PathLocks::new();
        assert!(!locks.lock_paths([&a], None, false).expect("must succeed"));
        assert!(!super::path_is_locked_by_me(&a));
    }

    #[test]
    fn path_locks_deletion() {
        let tmpdir = TempDir::new().unwrap();
        let a = tmpdir.path().join("a");

        let mut locks = PathLocks::lock([&a], "waiting").unwrap();
        locks.set_deletion(true);
        assert!(tmpdir.path().join("a.lock").exists());

        drop(locks);
        assert!(!tmpdir.path().join("a.lock").exists());
    }
}
