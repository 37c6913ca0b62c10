use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::Error;

mod dummy;
mod from_addr;
mod ssh;

pub use dummy::DummyRemoteStore;
pub use from_addr::from_addr;
pub use ssh::SshRemoteStore;

/// A store on a remote machine that derivations can be built on.
/// Paths are passed as absolute store paths.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// The URI of the store, as listed in the machines file.
    fn uri(&self) -> &str;

    /// Checks the store can be reached.
    async fn connect(&self) -> Result<(), Error>;

    /// Copies `paths` and their closure to the remote store. With
    /// `use_substitutes`, the remote may fetch them from its substituters
    /// instead.
    async fn copy_to(&self, paths: &BTreeSet<String>, use_substitutes: bool)
        -> Result<(), Error>;

    /// Builds the derivation at `drv_path` remotely.
    async fn build_derivation(&self, drv_path: &str) -> Result<(), Error>;

    /// Copies `paths` and their closure back from the remote store.
    async fn copy_from(&self, paths: &BTreeSet<String>) -> Result<(), Error>;
}
