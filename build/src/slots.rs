//! Lock files in `<state>/current-load` tracking which build slots of
//! remote machines are in use. A slot is taken for as long as its lock is
//! held, by any process.

use nix_compat::nixcpp::machines::Machine;
use std::path::{Path, PathBuf};
use strata_store::pathlock::{FileLock, LockType};
use tracing::debug;

use crate::Error;

/// Makes a store URI usable as a file name.
pub fn escape_uri(uri: &str) -> String {
    uri.replace('/', "_")
}

#[derive(Clone, Debug)]
pub struct CurrentLoad {
    dir: PathBuf,
}

impl CurrentLoad {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("current-load"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the directory. Failures show up once a lock is taken.
    pub fn create(&self) {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            debug!(dir = ?self.dir, err = %e, "creating current-load directory");
        }
    }

    /// Takes the lock serializing machine selection, blocking until
    /// available.
    pub fn main_lock(&self) -> Result<FileLock, Error> {
        let path = self.dir.join("main-lock");
        FileLock::acquire(&path, LockType::Write, true)?.ok_or_else(|| {
            Error::Store(strata_store::Error::Lock {
                path,
                source: std::io::ErrorKind::WouldBlock.into(),
            })
        })
    }

    pub fn slot_lock_path(&self, machine: &Machine, slot: u64) -> PathBuf {
        self.dir
            .join(format!("{}-{}", escape_uri(&machine.store_uri), slot))
    }

    /// Takes the lock of a slot of `machine` if it is free.
    pub fn try_slot(&self, machine: &Machine, slot: u64) -> Result<Option<FileLock>, Error> {
        Ok(FileLock::acquire(
            &self.slot_lock_path(machine, slot),
            LockType::Write,
            false,
        )?)
    }

    pub fn upload_lock_path(&self, store_uri: &str) -> PathBuf {
        self.dir
            .join(format!("{}.upload-lock", escape_uri(store_uri)))
    }
}

#[cfg(test)]
mod tests {
    use super::{escape_uri, CurrentLoad};
    use nix_compat::nixcpp::machines::Machine;
    use rstest::rstest;
    use tempfile::TempDir;

    #[rstest]
    #[case::ssh("ssh://alice@builder", "ssh:__alice@builder")]
    #[case::path("/var/remote", "_var_remote")]
    #[case::plain("builder", "builder")]
    fn escape(#[case] uri: &str, #[case] expected: &str) {
        assert_eq!(expected, escape_uri(uri));
    }

    #[test]
    fn layout() {
        let tmpdir = TempDir::new().unwrap();
        let current_load = CurrentLoad::new(tmpdir.path());
        let machine = Machine::new("ssh://builder", "x86_64-linux");

        assert_eq!(
            tmpdir.path().join("current-load/ssh:__builder-3"),
            current_load.slot_lock_path(&machine, 3)
        );
        assert_eq!(
            tmpdir.path().join("current-load/ssh:__builder.upload-lock"),
            current_load.upload_lock_path("ssh://builder")
        );
    }

    #[test]
    fn slot_is_exclusive() {
        let tmpdir = TempDir::new().unwrap();
        let current_load = CurrentLoad::new(tmpdir.path());
        current_load.create();
        let machine = Machine::new("ssh://builder", "x86_64-linux");

        let held = current_load.try_slot(&machine, 0).unwrap();
        assert!(held.is_some());
        assert!(current_load.try_slot(&machine, 0).unwrap().is_none());
        assert!(current_load.try_slot(&machine, 1).unwrap().is_some());

        drop(held);
        assert!(current_load.try_slot(&machine, 0).unwrap().is_some());
    }
}
