mod from_addr;
mod memory;
mod redb;

#[cfg(test)]
mod tests;

use nix_compat::store_path::StorePath;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::Error;

pub use self::from_addr::from_addr;
pub use self::memory::MemoryPathInfoService;
pub use self::redb::RedbPathInfoService;

/// Metadata of a valid store path: the other paths it refers to, the
/// derivation that built it and, for derivations, the outputs it produces.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathInfo {
    pub path: StorePath,
    #[serde(default)]
    pub references: BTreeSet<StorePath>,
    #[serde(default)]
    pub deriver: Option<StorePath>,
    #[serde(default)]
    pub nar_size: u64,
    /// Output name to output path. Only derivations have outputs.
    #[serde(default)]
    pub outputs: BTreeMap<String, StorePath>,
}

impl PathInfo {
    pub fn new(path: StorePath) -> Self {
        Self {
            path,
            references: BTreeSet::new(),
            deriver: None,
            nar_size: 0,
            outputs: BTreeMap::new(),
        }
    }

    /// Checks the invariants that don't need a look at other paths.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.outputs.is_empty() && !self.path.is_derivation() {
            return Err(Error::InvalidRequest(format!(
                "{} is not a derivation, but has outputs",
                self.path
            )));
        }
        Ok(())
    }
}

/// The reference graph of the store.
///
/// A path is valid iff a [PathInfo] is stored for it.
pub trait PathInfoService: Send + Sync {
    /// Retrieve the [PathInfo] of a store path.
    fn get(&self, path: &StorePath) -> Result<Option<PathInfo>, Error>;

    /// Register a path as valid. All its references (except itself) need
    /// to be valid already. An existing entry is overwritten.
    fn put(&self, path_info: PathInfo) -> Result<PathInfo, Error>;

    /// Make a path invalid. Fails if other valid paths still refer to it.
    fn invalidate(&self, path: &StorePath) -> Result<(), Error>;

    /// All valid paths that refer to `path`, possibly including itself.
    fn query_referrers(&self, path: &StorePath) -> Result<BTreeSet<StorePath>, Error>;

    /// All valid derivations that list `path` as one of their outputs.
    fn query_valid_derivers(&self, path: &StorePath) -> Result<BTreeSet<StorePath>, Error>;

    /// Iterate over all valid paths.
    fn list(&self) -> Result<Vec<PathInfo>, Error>;

    fn is_valid_path(&self, path: &StorePath) -> Result<bool, Error> {
        Ok(self.get(path)?.is_some())
    }

    fn query_references(&self, path: &StorePath) -> Result<BTreeSet<StorePath>, Error> {
        match self.get(path)? {
            Some(path_info) => Ok(path_info.references),
            None => Err(Error::InvalidPath(path.to_string())),
        }
    }

    /// The outputs of a derivation. An output is `None` if it is not known
    /// where it lives.
    fn query_partial_derivation_output_map(
        &self,
        drv_path: &StorePath,
    ) -> Result<BTreeMap<String, Option<StorePath>>, Error> {
        match self.get(drv_path)? {
            Some(path_info) => Ok(path_info
                .outputs
                .into_iter()
                .map(|(name, path)| (name, Some(path)))
                .collect()),
            None => Err(Error::InvalidPath(drv_path.to_string())),
        }
    }
}

/// Checks that `path_info` can be registered given the current `is_valid`.
pub(crate) fn check_references(
    path_info: &PathInfo,
    is_valid: impl Fn(&StorePath) -> Result<bool, Error>,
) -> Result<(), Error> {
    path_info.validate()?;

    for reference in &path_info.references {
        if reference != &path_info.path && !is_valid(reference)? {
            return Err(Error::InvalidRequest(format!(
                "cannot register {}: its reference {} is not valid",
                path_info.path, reference
            )));
        }
    }
    Ok(())
}
