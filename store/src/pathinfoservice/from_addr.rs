use super::{MemoryPathInfoService, PathInfoService, RedbPathInfoService};

use std::sync::Arc;
use url::Url;

use crate::Error;

/// Constructs a new instance of a [PathInfoService] from an URI.
///
/// The following URIs are supported:
/// - `memory:`
///   Uses a in-memory implementation.
/// - `redb:`
///   Uses a in-memory redb implementation.
/// - `redb:///absolute/path/to/somewhere`
///   Uses redb, using a path on the disk for persistency. Can be only opened
///   from one process at the same time.
pub fn from_addr(uri: &str) -> Result<Arc<dyn PathInfoService>, Error> {
    let url =
        Url::parse(uri).map_err(|e| Error::StorageError(format!("unable to parse url: {}", e)))?;

    Ok(match url.scheme() {
        "memory" => {
            // memory doesn't support host or path in the URL.
            if url.has_host() || !url.path().is_empty() {
                return Err(Error::StorageError("invalid url".to_string()));
            }
            Arc::new(MemoryPathInfoService::new())
        }
        "redb" => {
            // redb doesn't support host, and a path can be provided (otherwise
            // it'll live in memory only).
            if url.has_host() {
                return Err(Error::StorageError("no host allowed".to_string()));
            }

            if url.path().is_empty() {
                Arc::new(RedbPathInfoService::new_temporary()?)
            } else {
                Arc::new(RedbPathInfoService::new(url.path().into())?)
            }
        }
        _ => {
            return Err(Error::StorageError(format!(
                "unknown scheme: {}",
                url.scheme()
            )))
        }
    })
}
