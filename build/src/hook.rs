//! The build hook: a line protocol spoken with the local build process,
//! which offers derivations one at a time and gets told whether they are
//! built on a remote machine.
//!
//! ```text
//! > try
//! > <am willing to build locally: 0|1>
//! > <needed system>
//! > <derivation path>
//! > <required features, space-separated>
//! < # decline-permanently | # decline | # postpone | # accept
//! < <store uri>                  (accept only)
//! > <input paths>                (accept only)
//! > <wanted output paths>        (accept only)
//! ```

use nix_compat::nixcpp::machines::Machine;
use std::{collections::BTreeSet, path::Path, sync::Arc, time::Duration};
use strata_store::{
    pathlock::{FileLock, LockType},
    LocalStore,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    remote_store::{self, RemoteStore},
    scheduler::{select_machine, Selection},
    slots::CurrentLoad,
    Error,
};

/// How long to wait for another process uploading to the same machine
/// before uploading anyways.
pub const UPLOAD_LOCK_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Opens the store of a machine, without connecting yet.
pub type Connector = Box<dyn Fn(&Machine) -> Result<Box<dyn RemoteStore>, Error> + Send + Sync>;

/// A derivation offered by the build process.
#[derive(Debug, PartialEq)]
struct Request {
    am_willing: bool,
    needed_system: String,
    drv_path: String,
    required_features: BTreeSet<String>,
}

/// A machine that accepted a build, connected to. The slot stays taken
/// until this is dropped.
struct Connected {
    machine: usize,
    _slot: FileLock,
    remote: Box<dyn RemoteStore>,
}

enum Found {
    Connected(Connected),
    Postpone,
    Decline,
}

pub struct Hook {
    store: Arc<LocalStore>,
    machines: Vec<Machine>,
    current_load: CurrentLoad,
    connector: Connector,
    upload_lock_timeout: Duration,
    use_substitutes: bool,
}

impl Hook {
    pub fn new(store: Arc<LocalStore>, machines: Vec<Machine>) -> Self {
        let current_load = CurrentLoad::new(store.state_dir());
        let use_substitutes = store.settings().builders_use_substitutes;

        Self {
            store,
            machines,
            current_load,
            connector: Box::new(remote_store::from_addr),
            upload_lock_timeout: UPLOAD_LOCK_TIMEOUT,
            use_substitutes,
        }
    }

    pub fn with_connector(mut self, connector: Connector) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_upload_lock_timeout(mut self, timeout: Duration) -> Self {
        self.upload_lock_timeout = timeout;
        self
    }

    pub fn machines(&self) -> &[Machine] {
        &self.machines
    }

    /// Answers requests read from `r` on `w`, until `r` is exhausted or a
    /// derivation was built remotely.
    pub async fn run<R, W>(&mut self, mut r: R, mut w: W) -> Result<(), Error>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if self.machines.is_empty() {
            return reply(&mut w, "# decline-permanently\n").await;
        }

        self.current_load.create();

        loop {
            match read_line(&mut r).await? {
                None => return Ok(()),
                Some(line) if line == "try" => {}
                Some(line) => return Err(Error::Protocol("command", line)),
            }

            let request = read_request(&mut r).await?;
            let settings = self.store.settings();
            let can_build_locally = request.am_willing
                && (request.needed_system == settings.system
                    || settings.extra_platforms.contains(&request.needed_system))
                && request
                    .required_features
                    .iter()
                    .all(|feature| settings.system_features.contains(feature));

            let connected = match self.find_machine(&request).await? {
                Found::Connected(connected) => connected,
                Found::Postpone if !can_build_locally => {
                    reply(&mut w, "# postpone\n").await?;
                    continue;
                }
                Found::Postpone | Found::Decline => {
                    reply(&mut w, "# decline\n").await?;
                    continue;
                }
            };

            info!(
                drv_path = %request.drv_path,
                machine = %self.machines[connected.machine].store_uri,
                "building on remote machine"
            );
            reply(&mut w, &format!("# accept\n{}\n", connected.remote.uri())).await?;

            let inputs = read_paths(&mut r).await?;
            let outputs = read_paths(&mut r).await?;

            return self
                .build(connected.remote.as_ref(), &request.drv_path, &inputs, &outputs)
                .await;
        }
    }

    /// Selects a machine and connects to it. Machines that can't be
    /// connected to are disabled and the selection repeated.
    async fn find_machine(&mut self, request: &Request) -> Result<Found, Error> {
        loop {
            let current_load = self.current_load.clone();
            let machines = self.machines.clone();
            let needed_system = request.needed_system.clone();
            let required_features = request.required_features.clone();

            let selection = tokio::task::spawn_blocking(move || {
                let _main_lock = current_load.main_lock()?;
                let selection =
                    select_machine(&machines, &current_load, &needed_system, &required_features)?;

                if let Selection::Accept { slot, .. } = &selection {
                    // lets others see when this slot was taken.
                    slot.touch()?;
                }
                Ok::<_, Error>(selection)
            })
            .await??;

            let (machine, slot) = match selection {
                Selection::Accept { machine, slot } => (machine, slot),
                Selection::Postpone => return Ok(Found::Postpone),
                Selection::Decline => return Ok(Found::Decline),
            };

            let remote = match self.connect(&self.machines[machine]).await {
                Ok(remote) => remote,
                Err(e) => {
                    error!(
                        machine = %self.machines[machine].store_uri,
                        err = %e,
                        "cannot build on machine"
                    );
                    self.machines[machine].enabled = false;
                    continue;
                }
            };

            return Ok(Found::Connected(Connected {
                machine,
                _slot: slot,
                remote,
            }));
        }
    }

    async fn connect(&self, machine: &Machine) -> Result<Box<dyn RemoteStore>, Error> {
        let remote = (self.connector)(machine)?;
        remote.connect().await?;
        Ok(remote)
    }

    /// Uploads the inputs, builds the derivation and copies back the outputs
    /// that aren't valid locally yet.
    #[instrument(skip(self, remote, inputs, outputs), fields(uri = %remote.uri()), err)]
    async fn build(
        &self,
        remote: &dyn RemoteStore,
        drv_path: &str,
        inputs: &BTreeSet<String>,
        outputs: &BTreeSet<String>,
    ) -> Result<(), Error> {
        let upload_lock_path = self.current_load.upload_lock_path(remote.uri());
        let timeout = self.upload_lock_timeout;
        let upload_lock = tokio::task::spawn_blocking(move || {
            FileLock::acquire_timeout(&upload_lock_path, LockType::Write, timeout)
        })
        .await??;
        if upload_lock.is_none() {
            warn!(
                "somebody is hogging the upload lock for '{}', continuing...",
                remote.uri()
            );
        }

        let mut to_upload = inputs.clone();
        to_upload.insert(drv_path.to_string());
        debug!(paths = to_upload.len(), "copying dependencies to remote machine");
        remote.copy_to(&to_upload, self.use_substitutes).await?;
        drop(upload_lock);

        remote.build_derivation(drv_path).await?;

        let mut missing = BTreeSet::new();
        for output in outputs {
            let store_path = self.store.parse_store_path(Path::new(output))?;
            if !self.store.is_valid_path(&store_path)? {
                missing.insert(output.clone());
            }
        }

        if !missing.is_empty() {
            debug!(paths = missing.len(), "copying outputs from remote machine");
            remote.copy_from(&missing).await?;
        }

        Ok(())
    }
}

/// Reads a line without its trailing newline. Returns `None` at the end of
/// the input.
async fn read_line<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Option<String>, Error> {
    let mut line = String::new();
    if r.read_line(&mut line).await.map_err(Error::Read)? == 0 {
        return Ok(None);
    }
    if line.ends_with('\n') {
        line.pop();
    }
    Ok(Some(line))
}

async fn expect_line<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<String, Error> {
    read_line(r).await?.ok_or(Error::UnexpectedEof)
}

async fn read_paths<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<BTreeSet<String>, Error> {
    Ok(expect_line(r)
        .await?
        .split_whitespace()
        .map(str::to_string)
        .collect())
}

async fn read_request<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Request, Error> {
    let am_willing = match expect_line(r).await?.as_str() {
        "0" => false,
        "1" => true,
        other => return Err(Error::Protocol("willingness", other.to_string())),
    };

    Ok(Request {
        am_willing,
        needed_system: expect_line(r).await?,
        drv_path: expect_line(r).await?,
        required_features: read_paths(r).await?,
    })
}

async fn reply<W: AsyncWrite + Unpin>(w: &mut W, msg: &str) -> Result<(), Error> {
    w.write_all(msg.as_bytes()).await.map_err(Error::Write)?;
    w.flush().await.map_err(Error::Write)
}
