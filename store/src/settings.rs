use nix_compat::{nixcpp::conf::NixConfig, store_path::STORE_DIR};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::Error;

/// The default location of the state directory.
pub const STATE_DIR: &str = "/nix/var/nix";

/// The default location of the config file.
pub const NIX_CONF: &str = "/etc/nix/nix.conf";

/// Settings of the local store, the garbage collector and remote building.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub store_dir: PathBuf,
    pub state_dir: PathBuf,

    /// Keep the outputs of derivations that are alive.
    pub keep_outputs: bool,
    /// Keep the derivations of outputs that are alive.
    pub keep_derivations: bool,

    /// Start an automatic collection when less than this many bytes are free.
    pub min_free: u64,
    /// Stop an automatic collection once this many bytes are free.
    pub max_free: u64,
    pub min_free_check_interval: Duration,

    /// Size of the file in the state dir that's removed at the start of a
    /// collection, so it can run on a full disk.
    pub reserved_size: u64,

    /// If set, the free space auto-GC looks at is read from this file
    /// instead of asking the filesystem.
    pub free_space_file: Option<PathBuf>,

    pub system: String,
    pub extra_platforms: Vec<String>,
    pub system_features: Vec<String>,
    pub builders: String,
    pub builders_use_substitutes: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_dir: STORE_DIR.into(),
            state_dir: STATE_DIR.into(),
            keep_outputs: false,
            keep_derivations: true,
            min_free: 0,
            max_free: u64::MAX,
            min_free_check_interval: Duration::from_secs(5),
            reserved_size: 8 * 1024 * 1024,
            free_space_file: None,
            system: this_system(),
            extra_platforms: vec![],
            system_features: vec![],
            builders: String::new(),
            builders_use_substitutes: false,
        }
    }
}

impl Settings {
    /// Settings for a store rooted at `store_dir` with its state in `state_dir`.
    pub fn with_dirs(store_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
            state_dir: state_dir.into(),
            ..Default::default()
        }
    }

    /// Applies all values set in a parsed `nix.conf`.
    pub fn apply(&mut self, conf: &NixConfig) {
        if let Some(v) = conf.keep_outputs {
            self.keep_outputs = v;
        }
        if let Some(v) = conf.keep_derivations {
            self.keep_derivations = v;
        }
        if let Some(v) = conf.min_free {
            self.min_free = v;
        }
        if let Some(v) = conf.max_free {
            self.max_free = v;
        }
        if let Some(v) = conf.min_free_check_interval {
            self.min_free_check_interval = Duration::from_secs(v);
        }
        if let Some(v) = conf.gc_reserved_space {
            self.reserved_size = v;
        }
        if let Some(v) = conf.system {
            self.system = v.to_string();
        }
        if let Some(v) = &conf.extra_platforms {
            self.extra_platforms = v.iter().map(|s| s.to_string()).collect();
        }
        if let Some(v) = &conf.system_features {
            self.system_features = v.iter().map(|s| s.to_string()).collect();
        }
        if let Some(v) = conf.builders {
            self.builders = v.to_string();
        }
        if let Some(v) = conf.builders_use_substitutes {
            self.builders_use_substitutes = v;
        }
    }

    /// Applies the config file at `path`, if it exists.
    pub fn load(&mut self, path: &Path) -> Result<(), Error> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::io("reading config file", path)(e)),
        };

        let conf = NixConfig::parse(&contents)
            .map_err(|e| Error::InvalidRequest(format!("{}: {}", path.display(), e)))?;
        self.apply(&conf);

        Ok(())
    }
}

/// The system type of this machine, in Nix notation.
pub fn this_system() -> String {
    let arch = std::env::consts::ARCH;
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        os => os,
    };
    format!("{}-{}", arch, os)
}
