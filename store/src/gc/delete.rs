use std::{
    collections::HashSet,
    fs,
    io,
    ops::ControlFlow,
    os::unix::fs::{MetadataExt, PermissionsExt},
    path::Path,
};
use tracing::{debug, info};

use super::{Deleted, GcState, LimitReached};
use crate::{Error, LocalStore};

/// Suffixes of the files and directories a running build keeps next to
/// its output path.
const ACTIVE_TEMP_SUFFIXES: [&str; 3] = [".lock", ".chroot", ".check"];

/// Recursively deletes `path`, adding the size of every file that had no
/// other hard links to `bytes_freed`. A missing `path` is not an error.
pub fn delete_path(path: &Path, bytes_freed: &mut u64) -> io::Result<()> {
    let metadata = match path.symlink_metadata() {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if metadata.is_dir() {
        // Store directories are read-only, make it possible to empty them.
        let mode = metadata.permissions().mode();
        if mode & 0o700 != 0o700 {
            fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o700))?;
        }

        for entry in fs::read_dir(path)? {
            delete_path(&entry?.path(), bytes_freed)?;
        }

        match fs::remove_dir(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
    } else {
        if metadata.nlink() == 1 {
            *bytes_freed += metadata.len();
        }

        match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
    }

    Ok(())
}

impl LocalStore {
    pub(crate) fn delete_garbage(&self, state: &mut GcState, path: &Path) -> Result<(), Error> {
        delete_path(path, &mut state.results.bytes_freed).map_err(Error::io("deleting", path))
    }

    /// Whether `path` is `<p><suffix>` for a temporary root `p`, which means
    /// it belongs to a build in progress.
    fn is_active_temp_file(&self, state: &GcState, path: &Path, suffix: &str) -> bool {
        let Some(stem) = path.to_str().and_then(|p| p.strip_suffix(suffix)) else {
            return false;
        };

        match self.maybe_parse_store_path(Path::new(stem)) {
            Some(sp) => {
                let active = state.temp_roots.contains(&sp);
                if active {
                    debug!(path = ?path, "skipping active temporary file");
                }
                active
            }
            None => false,
        }
    }

    /// Deletes the store entry `path` if it is garbage, after deleting
    /// all its referrers. Paths it refers to are never touched.
    pub(crate) fn try_to_delete(&self, state: &mut GcState, path: &Path) -> Result<Deleted, Error> {
        self.check_interrupt()?;

        if path == self.links_dir() || path == self.trash_dir() {
            return Ok(ControlFlow::Continue(()));
        }

        let store_path = self.maybe_parse_store_path(path);

        let valid = match &store_path {
            Some(sp) => self.is_valid_path(sp)?,
            None => false,
        };

        if !valid
            && ACTIVE_TEMP_SUFFIXES
                .iter()
                .any(|suffix| self.is_active_temp_file(state, path, suffix))
        {
            return Ok(ControlFlow::Continue(()));
        }

        let mut visited = HashSet::new();
        if let Some(sp) = &store_path {
            if self.can_reach_root(state, &mut visited, sp)? {
                debug!(path = ?path, "cannot delete, it's still reachable");
                return Ok(ControlFlow::Continue(()));
            }
        }

        // Nothing visited reached a root, so all of it is garbage. Only
        // `path` and its referrers are deleted here, though.
        state.dead.extend(visited);

        if state.should_delete {
            return self.delete_path_recursive(state, path);
        }

        Ok(ControlFlow::Continue(()))
    }

    /// Deletes `path` and, before that, all paths referring to it.
    pub(crate) fn delete_path_recursive(
        &self,
        state: &mut GcState,
        path: &Path,
    ) -> Result<Deleted, Error> {
        self.check_interrupt()?;

        let mut size = 0;

        if let Some(sp) = self.maybe_parse_store_path(path) {
            let svc = self.path_info_service();
            if let Some(path_info) = svc.get(&sp)? {
                for referrer in svc.query_referrers(&sp)? {
                    let referrer = self.print_store_path(&referrer);
                    if referrer != path {
                        if let ControlFlow::Break(l) = self.delete_path_recursive(state, &referrer)? {
                            return Ok(ControlFlow::Break(l));
                        }
                    }
                }

                size = path_info.nar_size;
                svc.invalidate(&sp)?;
            }
        }

        let metadata = match path.symlink_metadata() {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ControlFlow::Continue(())),
            Err(e) => return Err(Error::io("getting status of", path)(e)),
        };

        info!(path = ?path, "deleting");
        state.results.paths.insert(path.to_owned());

        // Directories are moved into the trash, and deleted once the GC lock
        // is released. Renaming is atomic, so nothing half deleted is left
        // behind in the store.
        if state.move_to_trash && metadata.is_dir() {
            match self.move_to_trash(path, &metadata) {
                Ok(()) => state.bytes_invalidated += size,
                Err(e) if e.raw_os_error() == Some(libc::ENOSPC) => {
                    info!(path = ?path, err = %e, "note: can't move to trash");
                    self.delete_garbage(state, path)?;
                }
                Err(e) => return Err(e),
            }
        } else {
            self.delete_garbage(state, path)?;
        }

        if state.results.bytes_freed + state.bytes_invalidated > state.options.max_freed {
            info!(
                max_freed = state.options.max_freed,
                "deleted or invalidated more than the requested amount of bytes; stopping"
            );
            return Ok(ControlFlow::Break(LimitReached));
        }

        Ok(ControlFlow::Continue(()))
    }

    fn move_to_trash(&self, path: &Path, metadata: &fs::Metadata) -> Result<(), Error> {
        let mode = metadata.permissions().mode();
        fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o200))
            .map_err(Error::io("making writable", path))?;

        let target = match path.file_name() {
            Some(name) => self.trash_dir().join(name),
            None => return Err(Error::InvalidRequest(format!("{:?} has no name", path))),
        };
        fs::rename(path, &target).map_err(Error::io("moving to trash", path))
    }
}
