use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] strata_store::Error),

    #[error(transparent)]
    Machines(#[from] nix_compat::nixcpp::machines::Error),

    #[error("{context} {path:?}: {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("reading from the build process: {0}")]
    Read(#[source] std::io::Error),

    #[error("writing to the build process: {0}")]
    Write(#[source] std::io::Error),

    #[error("unexpected end of input from the build process")]
    UnexpectedEof,

    #[error("invalid value '{1}' for {0}")]
    Protocol(&'static str, String),

    #[error("cannot connect to '{0}': {1}")]
    Connect(String, String),

    #[error("copying paths {direction} '{uri}' failed: {msg}")]
    Copy {
        direction: &'static str,
        uri: String,
        msg: String,
    },

    #[error("build of '{drv_path}' on '{uri}' failed: {msg}")]
    BuildFailed {
        drv_path: String,
        uri: String,
        msg: String,
    },

    #[error("unsupported store URI '{0}'")]
    UnsupportedUri(String),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}
