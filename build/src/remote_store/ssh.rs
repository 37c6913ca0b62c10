use async_trait::async_trait;
use bstr::BStr;
use std::{collections::BTreeSet, process::Stdio};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::RemoteStore;
use crate::Error;

/// A store on a machine reachable over SSH, driven through the `ssh` and
/// `nix-copy-closure` commands of the local system.
pub struct SshRemoteStore {
    uri: String,
    /// `[user@]host`
    host: String,
    port: Option<u16>,
    ssh_key: Option<String>,
}

impl SshRemoteStore {
    pub fn new(uri: &str, host: String, port: Option<u16>, ssh_key: Option<String>) -> Self {
        Self {
            uri: uri.to_string(),
            host,
            port,
            ssh_key,
        }
    }

    /// Options for `ssh`, without the host.
    fn ssh_opts(&self) -> Vec<String> {
        // no X11 or agent forwarding, and never ask for a password.
        let mut opts = vec![
            "-x".to_string(),
            "-a".to_string(),
            "-oBatchMode=yes".to_string(),
        ];
        if let Some(key) = &self.ssh_key {
            opts.extend(["-i".to_string(), key.clone()]);
        }
        if let Some(port) = self.port {
            opts.extend(["-p".to_string(), port.to_string()]);
        }
        opts
    }

    fn ssh_command<'a>(&self, remote_cmd: impl IntoIterator<Item = &'a str>) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_opts())
            .arg(&self.host)
            .arg("--")
            .args(remote_cmd);
        cmd
    }

    fn copy_closure_command(&self, direction: &str, paths: &BTreeSet<String>) -> Command {
        let mut cmd = Command::new("nix-copy-closure");
        cmd.env("NIX_SSHOPTS", self.ssh_opts().join(" "))
            .arg(direction)
            .arg(&self.host)
            .args(paths);
        cmd
    }

    /// Runs `cmd`, returning its stderr as the error if it fails.
    async fn run(&self, mut cmd: Command) -> Result<Result<(), String>, Error> {
        debug!(cmd = ?cmd.as_std(), "running");

        let output = cmd
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Connect(self.uri.clone(), e.to_string()))?;

        if output.status.success() {
            return Ok(Ok(()));
        }

        let stderr = BStr::new(&output.stderr);
        warn!(stderr = %stderr, exit_code = %output.status, "command failed");
        Ok(Err(stderr.to_string().trim().to_string()))
    }
}

#[async_trait]
impl RemoteStore for SshRemoteStore {
    fn uri(&self) -> &str {
        &self.uri
    }

    #[instrument(skip(self), fields(uri = %self.uri), err)]
    async fn connect(&self) -> Result<(), Error> {
        self.run(self.ssh_command(["nix-store", "--version"]))
            .await?
            .map_err(|msg| Error::Connect(self.uri.clone(), msg))
    }

    #[instrument(skip(self, paths), fields(uri = %self.uri, paths = paths.len()), err)]
    async fn copy_to(&self, paths: &BTreeSet<String>, use_substitutes: bool) -> Result<(), Error> {
        if paths.is_empty() {
            return Ok(());
        }

        let mut cmd = self.copy_closure_command("--to", paths);
        if use_substitutes {
            cmd.arg("--use-substitutes");
        }

        self.run(cmd).await?.map_err(|msg| Error::Copy {
            direction: "to",
            uri: self.uri.clone(),
            msg,
        })
    }

    #[instrument(skip(self), fields(uri = %self.uri), err)]
    async fn build_derivation(&self, drv_path: &str) -> Result<(), Error> {
        self.run(self.ssh_command(["nix-store", "--realise", drv_path]))
            .await?
            .map_err(|msg| Error::BuildFailed {
                drv_path: drv_path.to_string(),
                uri: self.uri.clone(),
                msg,
            })
    }

    #[instrument(skip(self, paths), fields(uri = %self.uri, paths = paths.len()), err)]
    async fn copy_from(&self, paths: &BTreeSet<String>) -> Result<(), Error> {
        if paths.is_empty() {
            return Ok(());
        }

        self.run(self.copy_closure_command("--from", paths))
            .await?
            .map_err(|msg| Error::Copy {
                direction: "from",
                uri: self.uri.clone(),
                msg,
            })
    }
}
