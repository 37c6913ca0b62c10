use data_encoding::HEXLOWER;
use nix_compat::store_path::StorePath;
use path_clean::PathClean;
use rand::Rng;
use sha1::{Digest, Sha1};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs, io,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use crate::{Error, LocalStore};

/// Maps store paths to the locations of the roots keeping them alive.
pub type Roots = BTreeMap<StorePath, BTreeSet<String>>;

/// Atomically creates (or replaces) a symlink at `link` pointing to
/// `target`, creating missing parent directories.
pub fn make_symlink(link: &Path, target: &Path) -> Result<(), Error> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent).map_err(Error::io("creating directory", parent))?;
    }

    let mut tmp = link.as_os_str().to_owned();
    tmp.push(format!(
        ".tmp-{}-{}",
        std::process::id(),
        rand::thread_rng().gen::<u32>()
    ));
    let tmp = PathBuf::from(tmp);

    std::os::unix::fs::symlink(target, &tmp).map_err(Error::io("creating symlink", &tmp))?;
    fs::rename(&tmp, link).map_err(Error::io("moving symlink to", link))
}

/// Makes `path` absolute and removes `.` and `..` components, without
/// resolving symlinks.
fn absolute(path: &Path) -> Result<PathBuf, Error> {
    if path.is_absolute() {
        return Ok(path.to_path_buf().clean());
    }
    let cwd = std::env::current_dir().map_err(Error::io("getting current directory", Path::new(".")))?;
    Ok(cwd.join(path).clean())
}

/// Whether an I/O error while looking at a potential root can be ignored.
fn is_ignorable(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EACCES) | Some(libc::ENOENT) | Some(libc::ENOTDIR)
    )
}

impl LocalStore {
    /// Registers `path` as an indirect root, by putting a symlink to it into
    /// `gcroots/auto`, named after the hash of `path`.
    pub fn add_indirect_root(&self, path: &Path) -> Result<(), Error> {
        let hash = HEXLOWER.encode(&Sha1::digest(path.as_os_str().as_bytes()));
        make_symlink(&self.auto_roots_dir().join(hash), path)
    }

    /// Creates a symlink at `gc_root` pointing to `store_path` and registers
    /// it as an indirect root. Returns once no collection is running, so
    /// the root can't be missed by one.
    #[instrument(skip(self, store_path), fields(store_path = %store_path), err)]
    pub fn add_perm_root(&self, store_path: &StorePath, gc_root: &Path) -> Result<PathBuf, Error> {
        let gc_root = absolute(gc_root)?;

        if self.is_in_store(&gc_root) {
            return Err(Error::RootInStore(gc_root));
        }

        // Don't clobber anything that isn't a symlink into the store.
        if let Ok(metadata) = gc_root.symlink_metadata() {
            let points_into_store = metadata.is_symlink()
                && fs::read_link(&gc_root)
                    .map(|target| self.is_in_store(&target))
                    .unwrap_or(false);
            if !points_into_store {
                return Err(Error::RootExists(gc_root));
            }
        }

        make_symlink(&gc_root, &self.print_store_path(store_path))?;
        self.add_indirect_root(&gc_root)?;

        // A collection that already enumerated the roots won't see this one.
        // Wait for it to finish.
        self.sync_with_gc()?;

        Ok(gc_root)
    }

    /// Finds all roots, including temporary and runtime roots. With `censor`,
    /// the locations of those are hidden.
    #[instrument(skip(self), err)]
    pub fn find_roots(&self, censor: bool) -> Result<Roots, Error> {
        let mut roots = Roots::new();
        self.find_roots_no_temp(&mut roots, censor)?;

        let (_locks, temp_roots) = self.find_temp_roots(censor)?;
        for (path, locations) in temp_roots {
            roots.entry(path).or_default().extend(locations);
        }

        Ok(roots)
    }

    /// Finds the permanent, indirect and runtime roots.
    pub(crate) fn find_roots_no_temp(&self, roots: &mut Roots, censor: bool) -> Result<(), Error> {
        self.find_roots_in(&self.gc_roots_dir(), roots)?;
        self.find_roots_in(&self.profiles_dir(), roots)?;
        self.find_runtime_roots(roots, censor)
    }

    fn find_roots_in(&self, dir: &Path, roots: &mut Roots) -> Result<(), Error> {
        for entry in WalkDir::new(dir).follow_links(false) {
            self.check_interrupt()?;

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().unwrap_or(dir).to_owned();
                    match e.into_io_error() {
                        Some(e) if is_ignorable(&e) => {
                            info!(path = ?path, err = %e, "cannot read potential root");
                            continue;
                        }
                        Some(e) => return Err(Error::io("reading", &path)(e)),
                        None => continue,
                    }
                }
            };

            let result = if entry.path_is_symlink() {
                self.find_symlink_root(entry.path(), roots)
            } else if entry.file_type().is_file() {
                self.find_file_root(entry.path(), roots)
            } else {
                Ok(())
            };

            match result {
                Err(Error::Io { source, path, .. }) if is_ignorable(&source) => {
                    info!(path = ?path, err = %source, "cannot read potential root");
                }
                r => r?,
            }
        }

        Ok(())
    }

    fn find_symlink_root(&self, path: &Path, roots: &mut Roots) -> Result<(), Error> {
        let target = fs::read_link(path).map_err(Error::io("reading symlink", path))?;

        if self.is_in_store(&target) {
            return self.found_root(path, &target, roots);
        }

        // An indirect root, follow it one more step.
        let target = match path.parent() {
            Some(parent) => parent.join(target).clean(),
            None => target,
        };

        if target.symlink_metadata().is_err() {
            if path.parent() == Some(self.auto_roots_dir().as_path()) {
                info!(link = ?path, "removing stale link to {:?}", target);
                fs::remove_file(path).map_err(Error::io("removing", path))?;
            }
            return Ok(());
        }

        if !target.is_symlink() {
            return Ok(());
        }

        let target2 = fs::read_link(&target).map_err(Error::io("reading symlink", &target))?;
        if self.is_in_store(&target2) {
            self.found_root(&target, &target2, roots)?;
        }

        Ok(())
    }

    /// A regular file in a roots directory that is named like a store path.
    fn find_file_root(&self, path: &Path, roots: &mut Roots) -> Result<(), Error> {
        let Some(name) = path.file_name() else {
            return Ok(());
        };

        if let Some(sp) = self.maybe_parse_store_path(&self.store_dir().join(name)) {
            if self.is_valid_path(&sp)? {
                roots
                    .entry(sp)
                    .or_default()
                    .insert(path.display().to_string());
            }
        }
        Ok(())
    }

    fn found_root(&self, path: &Path, target: &Path, roots: &mut Roots) -> Result<(), Error> {
        let sp = match self.to_store_path(target) {
            Ok((sp, _)) => sp,
            Err(e) => {
                info!(root = ?path, err = %e, "skipping invalid root");
                return Ok(());
            }
        };

        if self.is_valid_path(&sp)? {
            debug!(root = ?path, target = %sp, "found root");
            roots
                .entry(sp)
                .or_default()
                .insert(path.display().to_string());
        } else {
            info!(root = ?path, target = ?target, "skipping invalid root");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{make_symlink, Roots};
    use crate::tests::fixtures::{store_path, TestStore};
    use crate::Error;
    use pretty_assertions::assert_eq;
    use std::{collections::BTreeSet, fs};

    #[test]
    fn make_symlink_replaces() {
        let ts = TestStore::new();
        let link = ts.tmpdir.path().join("dir/link");

        make_symlink(&link, "/first".as_ref()).unwrap();
        make_symlink(&link, "/second".as_ref()).unwrap();

        assert_eq!(std::path::PathBuf::from("/second"), fs::read_link(&link).unwrap());
        // no temporary links are left behind.
        assert_eq!(1, fs::read_dir(link.parent().unwrap()).unwrap().count());
    }

    #[test]
    fn perm_root() {
        let ts = TestStore::new();
        let sp = ts.add_file("hello", 1, &[]);
        let location = ts.tmpdir.path().join("result");

        let root = ts.store.add_perm_root(&sp, &location).expect("must succeed");
        assert_eq!(location, root);
        assert_eq!(ts.store.print_store_path(&sp), fs::read_link(&root).unwrap());

        let roots = ts.store.find_roots(false).unwrap();
        assert_eq!(
            Some(&BTreeSet::from([location.display().to_string()])),
            roots.get(&sp)
        );
    }

    /// `.` and `..` are removed from absolute locations, without touching the
    /// filesystem.
    #[test]
    fn perm_root_location_is_cleaned() {
        let ts = TestStore::new();
        let sp = ts.add_file("hello", 1, &[]);
        let location = ts.tmpdir.path().join("missing/../.").join("result");

        let root = ts.store.add_perm_root(&sp, &location).expect("must succeed");
        assert_eq!(ts.tmpdir.path().join("result"), root);
        assert_eq!(ts.store.print_store_path(&sp), fs::read_link(&root).unwrap());
    }

    /// Adding the same root twice changes nothing.
    #[test]
    fn perm_root_idempotent() {
        let ts = TestStore::new();
        let sp = ts.add_file("hello", 1, &[]);
        let location = ts.tmpdir.path().join("result");

        let first = ts.store.add_perm_root(&sp, &location).unwrap();
        let auto_links: Vec<_> = fs::read_dir(ts.store.auto_roots_dir())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();

        let second = ts.store.add_perm_root(&sp, &location).unwrap();
        let auto_links_after: Vec<_> = fs::read_dir(ts.store.auto_roots_dir())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();

        assert_eq!(first, second);
        assert_eq!(1, auto_links.len());
        assert_eq!(auto_links, auto_links_after);
    }

    #[test]
    fn perm_root_refuses() {
        let ts = TestStore::new();
        let sp = ts.add_file("hello", 1, &[]);

        let in_store = ts.store.store_dir().join("result");
        assert!(matches!(
            ts.store.add_perm_root(&sp, &in_store),
            Err(Error::RootInStore(_))
        ));

        let occupied = ts.tmpdir.path().join("occupied");
        fs::write(&occupied, "precious").unwrap();
        assert!(matches!(
            ts.store.add_perm_root(&sp, &occupied),
            Err(Error::RootExists(_))
        ));
        assert_eq!("precious", fs::read_to_string(&occupied).unwrap());
    }

    #[test]
    fn stale_indirect_root_is_pruned() {
        let ts = TestStore::new();
        let sp = ts.add_file("hello", 1, &[]);
        let location = ts.tmpdir.path().join("result");
        ts.store.add_perm_root(&sp, &location).unwrap();

        fs::remove_file(&location).unwrap();

        let roots = ts.store.find_roots(false).unwrap();
        assert!(roots.get(&sp).is_none());
        assert_eq!(0, fs::read_dir(ts.store.auto_roots_dir()).unwrap().count());
    }

    #[test]
    fn direct_and_file_roots() {
        let ts = TestStore::new();
        let linked = ts.add_file("linked", 1, &[]);
        let named = ts.add_file("named", 1, &[]);
        let invalid = store_path("invalid");

        let gcroots = ts.store.gc_roots_dir();
        let link = gcroots.join("per-user/alice/link");
        make_symlink(&link, &ts.store.print_store_path(&linked)).unwrap();
        make_symlink(
            &gcroots.join("dangling"),
            &ts.store.print_store_path(&invalid),
        )
        .unwrap();
        fs::write(gcroots.join(named.to_string()), "").unwrap();

        let roots = ts.store.find_roots(false).unwrap();

        let mut expected = Roots::new();
        expected.insert(linked, BTreeSet::from([link.display().to_string()]));
        expected.insert(
            named.clone(),
            BTreeSet::from([gcroots.join(named.to_string()).display().to_string()]),
        );

        assert_eq!(expected, roots);
    }

    #[test]
    fn profile_roots() {
        let ts = TestStore::new();
        let sp = ts.add_file("profile-env", 1, &[]);

        let link = ts.store.profiles_dir().join("per-user/bob/profile-1-link");
        make_symlink(&link, &ts.store.print_store_path(&sp)).unwrap();

        let roots = ts.store.find_roots(true).unwrap();
        assert_eq!(
            Some(&BTreeSet::from([link.display().to_string()])),
            roots.get(&sp)
        );
    }
}
