use nix_compat::nixcpp::machines::Machine;
use url::Url;

use super::{DummyRemoteStore, RemoteStore, SshRemoteStore};
use crate::Error;

/// Constructs the [RemoteStore] of a machine from its store URI.
///
/// The following schemes are supported:
/// - `ssh://` and `ssh-ng://` ([SshRemoteStore]), which need a host
/// - `dummy://` ([DummyRemoteStore])
pub fn from_addr(machine: &Machine) -> Result<Box<dyn RemoteStore>, Error> {
    let uri = machine.store_uri.as_str();
    let url = Url::parse(uri).map_err(|_| Error::UnsupportedUri(uri.to_string()))?;

    Ok(match url.scheme() {
        "ssh" | "ssh-ng" => {
            let host = match url.host_str() {
                Some(host) if !host.is_empty() => host,
                _ => return Err(Error::UnsupportedUri(uri.to_string())),
            };
            let host = match url.username() {
                "" => host.to_string(),
                user => format!("{}@{}", user, host),
            };

            Box::new(SshRemoteStore::new(
                uri,
                host,
                url.port(),
                machine.ssh_key.clone(),
            ))
        }
        // dummy doesn't care about the rest of the URI.
        "dummy" => Box::new(DummyRemoteStore::new(uri)),
        _ => return Err(Error::UnsupportedUri(uri.to_string())),
    })
}
