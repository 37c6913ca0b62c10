use nix_compat::store_path::StorePath;
use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Write},
    path::Path,
};
use tracing::{debug, info, instrument, warn};

use super::Roots;
use crate::{
    pathlock::{create_lock_file, delete_lock_file, lock_file, FileLock, LockType},
    Error, LocalStore,
};

impl LocalStore {
    /// Keeps `path` alive for as long as this process runs, by recording it
    /// in this process' temporary roots file.
    #[instrument(skip_all, fields(path = %path), err)]
    pub fn add_temp_root(&self, path: &StorePath) -> Result<(), Error> {
        let mut temp_roots = self.temp_roots.lock();

        let lock = match temp_roots.take() {
            Some(lock) => lock,
            None => self.create_temp_roots_file()?,
        };
        let lock = temp_roots.insert(lock);

        // Converting the read lock to a write lock releases it first. A
        // collector probing the file in between would take it for stale,
        // so keep collectors out until it is a read lock again.
        let _gc_lock = self.open_gc_lock(LockType::Read)?;

        // Only a collector ever holds a lock conflicting with ours, and it
        // is done with our file once it released the GC lock.
        debug!("acquiring write lock on temporary roots file");
        lock.upgrade()?;

        let mut line = self.print_store_path(path).into_os_string().into_encoded_bytes();
        line.push(0);
        lock.file()
            .write_all(&line)
            .map_err(Error::io("writing to", lock.path()))?;

        // Go back to a read lock, which tells collectors this process is alive.
        debug!("downgrading to read lock on temporary roots file");
        lock.downgrade()
    }

    /// Creates the temporary roots file of this process and read locks it.
    fn create_temp_roots_file(&self) -> Result<FileLock, Error> {
        let path = self.temp_roots_file();

        loop {
            // The GC lock keeps collectors from deleting the file between
            // creating and locking it.
            let gc_lock = self.open_gc_lock(LockType::Read)?;

            // A file by our pid is left over from a dead process.
            if path.symlink_metadata().is_ok() {
                fs::remove_file(&path).map_err(Error::io("removing", &path))?;
            }

            let file = create_lock_file(&path)?;
            drop(gc_lock);

            if let Some(lock) = lock_temp_roots_file(file, &path)? {
                return Ok(lock);
            }
        }
    }

    /// Reads the temporary roots files of all processes. Files of processes
    /// that are gone are deleted. The returned locks keep the owners of the
    /// others from adding more roots.
    pub(crate) fn find_temp_roots(&self, censor: bool) -> Result<(Vec<FileLock>, Roots), Error> {
        let dir = self.temp_roots_dir();
        let mut locks = Vec::new();
        let mut roots = Roots::new();

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((locks, roots)),
            Err(e) => return Err(Error::io("opening directory", &dir)(e)),
        };

        for entry in entries {
            let entry = entry.map_err(Error::io("reading directory", &dir))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }

            let path = entry.path();
            debug!(path = ?path, "reading temporary root file");

            let file = match OpenOptions::new().read(true).write(true).open(&path) {
                Ok(file) => file,
                // the owner removed it in the meantime.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::io("opening temporary roots file", &path)(e)),
            };

            // The owner holds a read lock as long as it lives.
            if lock_file(&file, LockType::Write, false).map_err(Error::lock(&path))? {
                info!(path = ?path, "removing stale temporary roots file");
                delete_lock_file(&path, &file)?;
                continue;
            }

            // Wait out an owner in the middle of an append.
            lock_file(&file, LockType::Read, true).map_err(Error::lock(&path))?;
            let lock = FileLock::from_locked(file, &path, LockType::Read);

            let location = if censor {
                "{censored}".to_string()
            } else {
                format!("{{temp:{}}}", name)
            };
            self.read_temp_roots(&lock, &location, &mut roots)?;

            locks.push(lock);
        }

        Ok((locks, roots))
    }

    fn read_temp_roots(
        &self,
        lock: &FileLock,
        location: &str,
        roots: &mut Roots,
    ) -> Result<(), Error> {
        let mut contents = Vec::new();
        let mut file = lock.file();
        file.read_to_end(&mut contents)
            .map_err(Error::io("reading", lock.path()))?;

        for entry in contents.split(|b| *b == 0).filter(|e| !e.is_empty()) {
            let Ok(entry) = std::str::from_utf8(entry) else {
                warn!(file = ?lock.path(), "skipping non-UTF-8 temporary root");
                continue;
            };

            match self.parse_store_path(Path::new(entry)) {
                Ok(sp) => {
                    debug!(root = %sp, "got temporary root");
                    roots.entry(sp).or_default().insert(location.to_string());
                }
                Err(e) => warn!(file = ?lock.path(), err = %e, "skipping invalid temporary root"),
            }
        }

        Ok(())
    }
}

/// Read locks a freshly created temporary roots file. Returns `None` if a
/// collector saw the file unlocked in the meantime and deleted it, which it
/// marks by writing a byte to it.
fn lock_temp_roots_file(file: File, path: &Path) -> Result<Option<FileLock>, Error> {
    debug!(path = ?path, "acquiring read lock on temporary roots file");
    lock_file(&file, LockType::Read, true).map_err(Error::lock(path))?;

    let len = file
        .metadata()
        .map_err(Error::io("statting", path))?
        .len();
    if len != 0 {
        debug!(path = ?path, "temporary roots file was deleted, retrying");
        return Ok(None);
    }

    Ok(Some(FileLock::from_locked(file, path, LockType::Read)))
}
