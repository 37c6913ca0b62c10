use lazy_static::lazy_static;
use regex::Regex;
use std::{
    collections::{BTreeSet, HashMap},
    fs,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};
use tracing::debug;

use super::Roots;
use crate::{Error, LocalStore};

/// Absolute paths found while inspecting processes, with where they were
/// found.
type UncheckedRoots = HashMap<PathBuf, BTreeSet<String>>;

lazy_static! {
    /// The path of file-backed mappings in `/proc/<pid>/maps`.
    static ref MAP_REGEX: Regex =
        Regex::new(r"^\s*\S+\s+\S+\s+\S+\s+\S+\s+\S+\s+(/\S+)\s*$").expect("invalid regex");
}

/// Kernel settings that may point to programs in the store.
#[cfg(target_os = "linux")]
const KERNEL_FILES: [&str; 3] = [
    "/proc/sys/kernel/modprobe",
    "/proc/sys/kernel/fbsplash",
    "/proc/sys/kernel/poweroff_cmd",
];

#[cfg(target_os = "linux")]
fn add_link(path: &Path, unchecked: &mut UncheckedRoots) {
    // processes come and go, and we can't look into all of them.
    if let Ok(target) = fs::read_link(path) {
        if target.is_absolute() {
            unchecked
                .entry(target)
                .or_default()
                .insert(path.display().to_string());
        }
    }
}

#[cfg(target_os = "linux")]
fn add_file_contents(path: &Path, unchecked: &mut UncheckedRoots) {
    if let Ok(contents) = fs::read_to_string(path) {
        let target = contents.trim_end();
        if target.starts_with('/') {
            unchecked
                .entry(target.into())
                .or_default()
                .insert(path.display().to_string());
        }
    }
}

impl LocalStore {
    /// Finds store paths in use by running processes. This is best effort,
    /// anything that can't be inspected is skipped.
    pub(crate) fn find_runtime_roots(&self, roots: &mut Roots, censor: bool) -> Result<(), Error> {
        let mut unchecked = UncheckedRoots::new();

        #[cfg(target_os = "linux")]
        {
            self.scan_proc(&mut unchecked);
            for file in KERNEL_FILES {
                add_file_contents(Path::new(file), &mut unchecked);
            }
        }

        #[cfg(not(target_os = "linux"))]
        self.scan_lsof(&mut unchecked);

        for (target, links) in unchecked {
            if !self.is_in_store(&target) {
                continue;
            }

            let Ok((sp, _)) = self.to_store_path(&target) else {
                continue;
            };

            if !self.is_valid_path(&sp)? {
                continue;
            }

            debug!(root = %sp, "got additional root");
            let locations = roots.entry(sp).or_default();
            if censor {
                locations.insert("{censored}".to_string());
            } else {
                locations.extend(links);
            }
        }

        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn scan_proc(&self, unchecked: &mut UncheckedRoots) {
        let Ok(procs) = fs::read_dir("/proc") else {
            return;
        };

        let env_regex = match Regex::new(&format!(
            r"{}/[0-9a-z]+[0-9a-zA-Z\+\-\._\?=]*",
            regex::escape(&self.store_dir().to_string_lossy())
        )) {
            Ok(re) => re,
            Err(e) => {
                debug!(err = %e, "not scanning environments");
                return;
            }
        };

        for entry in procs.flatten() {
            let name = entry.file_name();
            if !name.as_bytes().iter().all(u8::is_ascii_digit) {
                continue;
            }
            let proc_dir = entry.path();

            add_link(&proc_dir.join("exe"), unchecked);
            add_link(&proc_dir.join("cwd"), unchecked);

            if let Ok(fds) = fs::read_dir(proc_dir.join("fd")) {
                for fd in fds.flatten() {
                    add_link(&fd.path(), unchecked);
                }
            }

            let maps = proc_dir.join("maps");
            if let Ok(contents) = fs::read_to_string(&maps) {
                for line in contents.lines() {
                    if let Some(m) = MAP_REGEX.captures(line).and_then(|c| c.get(1)) {
                        unchecked
                            .entry(m.as_str().into())
                            .or_default()
                            .insert(maps.display().to_string());
                    }
                }
            }

            // Environment variables may name store paths that are in use.
            let environ = proc_dir.join("environ");
            if let Ok(contents) = fs::read(&environ) {
                let contents = String::from_utf8_lossy(&contents);
                for m in env_regex.find_iter(&contents) {
                    unchecked
                        .entry(m.as_str().into())
                        .or_default()
                        .insert(environ.display().to_string());
                }
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn scan_lsof(&self, unchecked: &mut UncheckedRoots) {
        let output = match std::process::Command::new("lsof")
            .args(["-n", "-w", "-F", "n"])
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                debug!(err = %e, "not running lsof");
                return;
            }
        };

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if let Some(path) = line.strip_prefix('n') {
                if path.starts_with('/') {
                    unchecked
                        .entry(path.into())
                        .or_default()
                        .insert("{lsof}".to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MAP_REGEX;
    use rstest::rstest;

    #[rstest]
    #[case::file_backed(
        "7f2c1a600000-7f2c1a622000 r--p 00000000 00:1f 1234 /nix/store/00bgd045z0d4icpbc2yyz4gx48ak44la-glibc/lib/libc.so.6",
        Some("/nix/store/00bgd045z0d4icpbc2yyz4gx48ak44la-glibc/lib/libc.so.6")
    )]
    #[case::anonymous("7ffd4b5e1000-7ffd4b602000 rw-p 00000000 00:00 0 ", None)]
    #[case::pseudo("7ffd4b5e1000-7ffd4b602000 rw-p 00000000 00:00 0 [stack]", None)]
    fn maps_lines(#[case] line: &str, #[case] expected: Option<&str>) {
        assert_eq!(
            expected,
            MAP_REGEX
                .captures(line)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str())
        );
    }

    /// Files this process has open in the store keep the store path alive.
    #[cfg(target_os = "linux")]
    #[test]
    fn open_file_is_a_root() {
        use crate::gc::Roots;
        use crate::tests::fixtures::TestStore;
        use std::collections::BTreeSet;

        let ts = TestStore::new();
        let sp = ts.add_file("opened", 4, &[]);
        let _file = std::fs::File::open(ts.store.print_store_path(&sp)).unwrap();

        let mut roots = Roots::new();
        ts.store.find_runtime_roots(&mut roots, false).unwrap();

        let locations = roots.get(&sp).expect("must be a root");
        assert!(locations.iter().any(|l| l.contains("/fd/")));

        let mut censored = Roots::new();
        ts.store.find_runtime_roots(&mut censored, true).unwrap();
        assert_eq!(
            Some(&BTreeSet::from(["{censored}".to_string()])),
            censored.get(&sp)
        );
    }
}
