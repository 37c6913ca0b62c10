use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::instrument;

use super::RemoteStore;
use crate::Error;

/// A remote store that can never be connected to.
pub struct DummyRemoteStore {
    uri: String,
}

impl DummyRemoteStore {
    pub fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
        }
    }

    fn unsupported(&self) -> Error {
        Error::Connect(
            self.uri.clone(),
            "dummy stores can't be connected to".to_string(),
        )
    }
}

#[async_trait]
impl RemoteStore for DummyRemoteStore {
    fn uri(&self) -> &str {
        &self.uri
    }

    #[instrument(skip(self), err)]
    async fn connect(&self) -> Result<(), Error> {
        Err(self.unsupported())
    }

    async fn copy_to(&self, _paths: &BTreeSet<String>, _use_substitutes: bool) -> Result<(), Error> {
        Err(self.unsupported())
    }

    async fn build_derivation(&self, _drv_path: &str) -> Result<(), Error> {
        Err(self.unsupported())
    }

    async fn copy_from(&self, _paths: &BTreeSet<String>) -> Result<(), Error> {
        Err(self.unsupported())
    }
}
