use super::{check_references, PathInfo, PathInfoService};
use nix_compat::store_path::StorePath;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use tracing::instrument;

use crate::Error;

/// Keeps all [PathInfo]s in memory. Referrers are found by scanning.
#[derive(Default)]
pub struct MemoryPathInfoService {
    db: RwLock<BTreeMap<StorePath, PathInfo>>,
}

impl MemoryPathInfoService {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PathInfoService for MemoryPathInfoService {
    fn get(&self, path: &StorePath) -> Result<Option<PathInfo>, Error> {
        Ok(self.db.read().get(path).cloned())
    }

    #[instrument(level = "trace", skip_all, fields(path_info.path = %path_info.path))]
    fn put(&self, path_info: PathInfo) -> Result<PathInfo, Error> {
        let mut db = self.db.write();
        check_references(&path_info, |p| Ok(db.contains_key(p)))?;
        db.insert(path_info.path.clone(), path_info.clone());

        Ok(path_info)
    }

    #[instrument(level = "trace", skip_all, fields(path = %path))]
    fn invalidate(&self, path: &StorePath) -> Result<(), Error> {
        let mut db = self.db.write();

        if let Some(referrer) = db
            .values()
            .find(|info| &info.path != path && info.references.contains(path))
        {
            return Err(Error::PathInUse(path.to_string(), referrer.path.to_string()));
        }

        db.remove(path);
        Ok(())
    }

    fn query_referrers(&self, path: &StorePath) -> Result<BTreeSet<StorePath>, Error> {
        Ok(self
            .db
            .read()
            .values()
            .filter(|info| info.references.contains(path))
            .map(|info| info.path.clone())
            .collect())
    }

    fn query_valid_derivers(&self, path: &StorePath) -> Result<BTreeSet<StorePath>, Error> {
        Ok(self
            .db
            .read()
            .values()
            .filter(|info| info.outputs.values().any(|out| out == path))
            .map(|info| info.path.clone())
            .collect())
    }

    fn list(&self) -> Result<Vec<PathInfo>, Error> {
        Ok(self.db.read().values().cloned().collect())
    }
}
