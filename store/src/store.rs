use nix_compat::store_path::StorePath;
use parking_lot::Mutex;
use std::{
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, instrument};

use crate::{
    gc::auto::AutoGcState,
    pathinfoservice::{PathInfo, PathInfoService},
    pathlock::FileLock,
    Error, Settings,
};

/// A store on the local filesystem, with its state directory holding
/// the garbage collector lock, roots, temporary roots and profiles.
pub struct LocalStore {
    pub(crate) settings: Settings,
    path_info_service: Arc<dyn PathInfoService>,

    /// The lock on this process' temporary roots file, once created.
    pub(crate) temp_roots: Mutex<Option<FileLock>>,
    pub(crate) auto_gc: Mutex<AutoGcState>,

    interrupted: Arc<AtomicBool>,
}

impl LocalStore {
    /// Opens the store described by `settings`, creating missing directories
    /// and the reserved space file.
    #[instrument(skip_all, fields(store_dir = ?settings.store_dir, state_dir = ?settings.state_dir))]
    pub fn new(
        settings: Settings,
        path_info_service: Arc<dyn PathInfoService>,
    ) -> Result<Self, Error> {
        let store = Self {
            settings,
            path_info_service,
            temp_roots: Mutex::new(None),
            auto_gc: Mutex::new(AutoGcState::default()),
            interrupted: Arc::new(AtomicBool::new(false)),
        };

        for dir in [
            store.store_dir().to_owned(),
            store.auto_roots_dir(),
            store.profiles_dir(),
            store.temp_roots_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(Error::io("creating directory", &dir))?;
        }

        store.create_reserved_file()?;

        Ok(store)
    }

    /// Writes `reserved` in the state dir, to be deleted when the disk is
    /// full so a collection can still run.
    fn create_reserved_file(&self) -> Result<(), Error> {
        let path = self.reserved_path();
        let size = self.settings.reserved_size;
        if size == 0 {
            return Ok(());
        }

        match fs::metadata(&path) {
            Ok(metadata) if metadata.len() == size => return Ok(()),
            _ => {}
        }

        debug!(path = ?path, size, "creating reserved space file");
        let mut file = File::create(&path).map_err(Error::io("creating", &path))?;
        io::copy(&mut io::repeat(b'X').take(size), &mut file)
            .map_err(Error::io("writing", &path))?;

        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn path_info_service(&self) -> &Arc<dyn PathInfoService> {
        &self.path_info_service
    }

    pub fn store_dir(&self) -> &Path {
        &self.settings.store_dir
    }

    pub fn state_dir(&self) -> &Path {
        &self.settings.state_dir
    }

    pub fn gc_lock_path(&self) -> PathBuf {
        self.state_dir().join("gc.lock")
    }

    pub fn gc_roots_dir(&self) -> PathBuf {
        self.state_dir().join("gcroots")
    }

    /// Holds the indirect roots, named after the hash of the root's location.
    pub fn auto_roots_dir(&self) -> PathBuf {
        self.gc_roots_dir().join("auto")
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.state_dir().join("profiles")
    }

    pub fn temp_roots_dir(&self) -> PathBuf {
        self.state_dir().join("temproots")
    }

    /// The temporary roots file of this process.
    pub fn temp_roots_file(&self) -> PathBuf {
        self.temp_roots_dir().join(std::process::id().to_string())
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.store_dir().join("trash")
    }

    /// Holds one hard link per file content, for deduplication.
    pub fn links_dir(&self) -> PathBuf {
        self.store_dir().join(".links")
    }

    pub fn reserved_path(&self) -> PathBuf {
        self.state_dir().join("reserved")
    }

    /// Whether `path` lies below the store dir.
    pub fn is_in_store(&self, path: &Path) -> bool {
        path != self.store_dir() && path.starts_with(self.store_dir())
    }

    /// Splits a path inside the store into the store path and the rest.
    pub fn to_store_path(&self, path: &Path) -> Result<(StorePath, PathBuf), Error> {
        StorePath::from_absolute_path_full(self.store_dir(), path)
            .map_err(|e| Error::BadStorePath(path.to_owned(), e))
    }

    /// Parses a path that must be a direct child of the store dir.
    pub fn parse_store_path(&self, path: &Path) -> Result<StorePath, Error> {
        StorePath::from_absolute_path(self.store_dir(), path)
            .map_err(|e| Error::BadStorePath(path.to_owned(), e))
    }

    pub fn maybe_parse_store_path(&self, path: &Path) -> Option<StorePath> {
        self.parse_store_path(path).ok()
    }

    /// The absolute location of a store path.
    pub fn print_store_path(&self, path: &StorePath) -> PathBuf {
        path.to_absolute_path(self.store_dir())
    }

    pub fn is_valid_path(&self, path: &StorePath) -> Result<bool, Error> {
        self.path_info_service.is_valid_path(path)
    }

    /// Registers a path as valid.
    #[instrument(skip_all, fields(path = %path_info.path))]
    pub fn register_valid_path(&self, path_info: PathInfo) -> Result<PathInfo, Error> {
        self.path_info_service.put(path_info)
    }

    /// Returns the flag that aborts a running collection once set.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    pub(crate) fn check_interrupt(&self) -> Result<(), Error> {
        if self.interrupted.load(Ordering::Relaxed) {
            return Err(Error::Interrupted);
        }
        Ok(())
    }
}
