use crate::pathinfoservice::{MemoryPathInfoService, PathInfo};
use crate::{LocalStore, Settings};
use nix_compat::store_path::StorePath;
use sha1::{Digest, Sha1};
use std::{collections::BTreeSet, fs, sync::Arc};
use tempfile::TempDir;

/// A store path named `name`, with a digest derived from the name.
pub fn store_path(name: &str) -> StorePath {
    StorePath::from_name_and_digest(name, &Sha1::digest(name.as_bytes())).unwrap()
}

/// A [LocalStore] with store and state dir inside a temporary directory,
/// backed by a [MemoryPathInfoService].
pub struct TestStore {
    pub tmpdir: TempDir,
    pub store: Arc<LocalStore>,
}

impl TestStore {
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(f: impl FnOnce(&mut Settings)) -> Self {
        let tmpdir = TempDir::new().unwrap();

        let mut settings =
            Settings::with_dirs(tmpdir.path().join("store"), tmpdir.path().join("state"));
        settings.reserved_size = 0;
        f(&mut settings);

        let store = LocalStore::new(settings, Arc::new(MemoryPathInfoService::new()))
            .expect("must open store");

        Self {
            tmpdir,
            store: Arc::new(store),
        }
    }

    /// Creates a regular file of `size` bytes in the store and registers it
    /// as valid with the given references.
    pub fn add_file(&self, name: &str, size: usize, references: &[&StorePath]) -> StorePath {
        let sp = store_path(name);
        fs::write(self.store.print_store_path(&sp), vec![b'x'; size]).unwrap();
        self.register(&sp, size, references);
        sp
    }

    /// Like [TestStore::add_file], but the store path is a directory holding
    /// one file of `size` bytes.
    pub fn add_dir(&self, name: &str, size: usize, references: &[&StorePath]) -> StorePath {
        let sp = store_path(name);
        let path = self.store.print_store_path(&sp);
        fs::create_dir(&path).unwrap();
        fs::write(path.join("data"), vec![b'x'; size]).unwrap();
        self.register(&sp, size, references);
        sp
    }

    fn register(&self, sp: &StorePath, size: usize, references: &[&StorePath]) {
        let mut path_info = PathInfo::new(sp.clone());
        path_info.nar_size = size as u64;
        path_info.references = references.iter().map(|r| (*r).clone()).collect::<BTreeSet<_>>();
        self.store.register_valid_path(path_info).unwrap();
    }

    /// Registers `drv` as a derivation producing `out`, and `out` as built
    /// by `drv`. Both need to exist in the store already.
    pub fn link_derivation(&self, drv: &StorePath, out: &StorePath) {
        let svc = self.store.path_info_service();

        let mut drv_info = svc.get(drv).unwrap().expect("drv must be valid");
        drv_info.outputs.insert("out".to_string(), out.clone());
        svc.put(drv_info).unwrap();

        let mut out_info = svc.get(out).unwrap().expect("out must be valid");
        out_info.deriver = Some(drv.clone());
        svc.put(out_info).unwrap();
    }

    pub fn exists(&self, sp: &StorePath) -> bool {
        self.store.print_store_path(sp).symlink_metadata().is_ok()
    }
}
