use super::{check_references, PathInfo, PathInfoService};
use nix_compat::store_path::StorePath;
use redb::{
    Database, MultimapTableDefinition, ReadableMultimapTable, ReadableTable, TableDefinition,
};
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};
use tracing::{instrument, warn};

use crate::Error;

/// store path -> JSON-encoded [PathInfo]
const PATHINFO_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("pathinfo");
/// reference -> referrers
const REFERRERS_TABLE: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("referrers");
/// output -> derivations producing it
const DERIVERS_TABLE: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("derivers");

/// PathInfoService implementation using redb under the hood.
/// Besides the [PathInfo]s themselves it maintains two reverse indices,
/// so referrers and derivers can be looked up without a scan.
pub struct RedbPathInfoService {
    db: Database,
}

impl RedbPathInfoService {
    /// Constructs a new instance using the specified file system path for
    /// storage.
    pub fn new(path: PathBuf) -> Result<Self, Error> {
        if path == Path::new("/") {
            return Err(Error::StorageError(
                "cowardly refusing to open / with redb".to_string(),
            ));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::io("creating directory", parent))?;
        }

        let db = Database::create(path)?;
        create_schema(&db)?;

        Ok(Self { db })
    }

    /// Constructs a new instance using the in-memory backend.
    pub fn new_temporary() -> Result<Self, Error> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        create_schema(&db)?;

        Ok(Self { db })
    }
}

/// Ensures all tables are present.
fn create_schema(db: &Database) -> Result<(), redb::Error> {
    let txn = db.begin_write()?;
    txn.open_table(PATHINFO_TABLE)?;
    txn.open_multimap_table(REFERRERS_TABLE)?;
    txn.open_multimap_table(DERIVERS_TABLE)?;
    txn.commit()?;

    Ok(())
}

fn decode(bytes: &[u8]) -> Result<PathInfo, Error> {
    serde_json::from_slice(bytes).map_err(|e| {
        warn!(err=%e, "failed to decode stored PathInfo");
        Error::StorageError("failed to decode stored PathInfo".to_string())
    })
}

fn parse_key(key: &str) -> Result<StorePath, Error> {
    key.parse()
        .map_err(|e| Error::StorageError(format!("invalid key {}: {}", key, e)))
}

impl PathInfoService for RedbPathInfoService {
    #[instrument(level = "trace", skip_all, fields(path = %path))]
    fn get(&self, path: &StorePath) -> Result<Option<PathInfo>, Error> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(PATHINFO_TABLE)?;

        let key = path.to_string();
        let guard = table.get(key.as_str())?;
        guard.map(|bytes| decode(bytes.value())).transpose()
    }

    #[instrument(level = "trace", skip_all, fields(path_info.path = %path_info.path))]
    fn put(&self, path_info: PathInfo) -> Result<PathInfo, Error> {
        let key = path_info.path.to_string();
        let encoded = serde_json::to_vec(&path_info)?;

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(PATHINFO_TABLE)?;
            let mut referrers = txn.open_multimap_table(REFERRERS_TABLE)?;
            let mut derivers = txn.open_multimap_table(DERIVERS_TABLE)?;

            check_references(&path_info, |p| {
                Ok(table.get(p.to_string().as_str())?.is_some())
            })?;

            // drop the index entries of a previous registration.
            let previous = table
                .get(key.as_str())?
                .map(|bytes| decode(bytes.value()))
                .transpose()?;
            if let Some(previous) = previous {
                for reference in &previous.references {
                    referrers.remove(reference.to_string().as_str(), key.as_str())?;
                }
                for output in previous.outputs.values() {
                    derivers.remove(output.to_string().as_str(), key.as_str())?;
                }
            }

            table.insert(key.as_str(), encoded.as_slice())?;
            for reference in &path_info.references {
                referrers.insert(reference.to_string().as_str(), key.as_str())?;
            }
            for output in path_info.outputs.values() {
                derivers.insert(output.to_string().as_str(), key.as_str())?;
            }
        }
        txn.commit()?;

        Ok(path_info)
    }

    #[instrument(level = "trace", skip_all, fields(path = %path))]
    fn invalidate(&self, path: &StorePath) -> Result<(), Error> {
        let key = path.to_string();

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(PATHINFO_TABLE)?;
            let mut referrers = txn.open_multimap_table(REFERRERS_TABLE)?;
            let mut derivers = txn.open_multimap_table(DERIVERS_TABLE)?;

            for referrer in referrers.get(key.as_str())? {
                let referrer = referrer?;
                if referrer.value() != key {
                    return Err(Error::PathInUse(key.clone(), referrer.value().to_string()));
                }
            }

            let previous = table
                .remove(key.as_str())?
                .map(|bytes| decode(bytes.value()))
                .transpose()?;

            if let Some(previous) = previous {
                for reference in &previous.references {
                    referrers.remove(reference.to_string().as_str(), key.as_str())?;
                }
                for output in previous.outputs.values() {
                    derivers.remove(output.to_string().as_str(), key.as_str())?;
                }
            }
        }
        txn.commit()?;

        Ok(())
    }

    fn query_referrers(&self, path: &StorePath) -> Result<BTreeSet<StorePath>, Error> {
        let txn = self.db.begin_read()?;
        let referrers = txn.open_multimap_table(REFERRERS_TABLE)?;

        let mut out = BTreeSet::new();
        for referrer in referrers.get(path.to_string().as_str())? {
            out.insert(parse_key(referrer?.value())?);
        }
        Ok(out)
    }

    fn query_valid_derivers(&self, path: &StorePath) -> Result<BTreeSet<StorePath>, Error> {
        let txn = self.db.begin_read()?;
        let derivers = txn.open_multimap_table(DERIVERS_TABLE)?;

        let mut out = BTreeSet::new();
        for deriver in derivers.get(path.to_string().as_str())? {
            out.insert(parse_key(deriver?.value())?);
        }
        Ok(out)
    }

    fn list(&self) -> Result<Vec<PathInfo>, Error> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(PATHINFO_TABLE)?;

        let mut out = Vec::new();
        for elem in table.iter()? {
            let (_, bytes) = elem?;
            out.push(decode(bytes.value())?);
        }
        Ok(out)
    }
}
