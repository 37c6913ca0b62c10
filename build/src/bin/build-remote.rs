use clap::Parser;
use std::sync::Arc;
use strata_build::{hook::Hook, machines::get_machines};
use strata_store::{pathinfoservice, LocalStore, Settings};
use strata_tracing::LogFormat;
use tokio::io::BufReader;
use tracing::{debug, Level};

/// Offers derivations to remote machines. Spoken to by the local build
/// process on stdin, answers on stderr.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The log level to use. `RUST_LOG` takes priority.
    #[arg(default_value_t = Level::INFO)]
    log_level: Level,

    /// The config file to read settings from.
    #[arg(long, env = "NIX_CONF", default_value = strata_store::NIX_CONF)]
    conf: std::path::PathBuf,

    /// Where path metadata is kept. Defaults to a redb database in the
    /// state dir.
    #[arg(long, env)]
    path_info_service_addr: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // ssh must not ask for passwords. Done before any threads exist.
    std::env::remove_var("DISPLAY");
    std::env::remove_var("SSH_ASKPASS");

    // the build process reads log lines from our stderr.
    let _tracing_handle = strata_tracing::TracingBuilder::default()
        .level(cli.log_level)
        .format(LogFormat::Json)
        .build()?;

    let mut settings = Settings::default();
    settings.load(&cli.conf)?;

    let machines = get_machines(&settings)?;
    debug!(machines = machines.len(), "read machines");

    let path_info_service_addr = cli.path_info_service_addr.unwrap_or_else(|| {
        format!(
            "redb://{}",
            settings.state_dir.join("db/pathinfo.redb").display()
        )
    });
    let path_info_service = pathinfoservice::from_addr(&path_info_service_addr)?;
    let store = Arc::new(LocalStore::new(settings, path_info_service)?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let mut hook = Hook::new(store, machines);
        hook.run(BufReader::new(tokio::io::stdin()), tokio::io::stderr())
            .await
    })?;

    Ok(())
}
