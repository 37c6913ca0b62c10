use nix_compat::store_path;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors related to the store, its locks and the garbage collector.
#[derive(Debug, Error)]
pub enum Error {
    #[error("lock error on {path:?}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{context} {path:?}: {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("creating a garbage collector root ({0:?}) in the store is forbidden (are you running a build inside the store?)")]
    RootInStore(PathBuf),

    #[error("cannot create symlink {0:?}; already exists")]
    RootExists(PathBuf),

    #[error("cannot delete path {0:?} since it is still alive")]
    StillAlive(PathBuf),

    #[error("path {0:?} is not a valid store path: {1}")]
    BadStorePath(PathBuf, #[source] store_path::Error),

    #[error("path '{0}' is not valid")]
    InvalidPath(String),

    #[error("cannot invalidate '{0}' since it is still referenced by '{1}'")]
    PathInUse(String, String),

    #[error("deadlock: trying to re-acquire self-held lock {0:?}")]
    Deadlock(PathBuf),

    #[error("profile error: {0}")]
    Profile(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal storage error: {0}")]
    StorageError(String),

    #[error("interrupted by the user")]
    Interrupted,
}

impl Error {
    /// Returns a closure wrapping an [std::io::Error] with the given context
    /// and path, to be used with `map_err`.
    pub fn io<'a>(
        context: &'static str,
        path: &'a Path,
    ) -> impl FnOnce(std::io::Error) -> Error + 'a {
        move |source| Error::Io {
            context,
            path: path.to_owned(),
            source,
        }
    }

    pub fn lock(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
        move |source| Error::Lock {
            path: path.to_owned(),
            source,
        }
    }

    /// The raw OS error of an underlying I/O failure, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Lock { source, .. } | Error::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

impl From<redb::Error> for Error {
    fn from(value: redb::Error) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(value: redb::DatabaseError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(value: redb::TableError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(value: redb::TransactionError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(value: redb::StorageError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(value: redb::CommitError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::StorageError(value.to_string())
    }
}
