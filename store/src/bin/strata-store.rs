use clap::{Parser, Subcommand};
use nix_compat::nixcpp::conf::parse_size;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use strata_store::gc::{GcAction, GcOptions};
use strata_store::pathinfoservice::{self, PathInfo};
use strata_store::{profiles, LocalStore, Settings};
use tracing::{info, Level};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// A global log level to use when printing logs.
    /// It's also possible to set `RUST_LOG` according to
    /// `tracing_subscriber::filter::EnvFilter`, which will always have
    /// priority.
    #[arg(long, default_value_t=Level::INFO)]
    log_level: Level,

    /// The config file to read settings from.
    #[arg(long, env = "NIX_CONF", default_value = strata_store::NIX_CONF)]
    conf: PathBuf,

    #[arg(long, env = "NIX_STORE_DIR")]
    store_dir: Option<PathBuf>,

    #[arg(long, env = "NIX_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Where path metadata is kept. Defaults to a redb database in the
    /// state dir.
    #[arg(long, env)]
    path_info_service_addr: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deletes unreachable store paths.
    Gc {
        /// Print the roots and exit.
        #[arg(long, conflicts_with_all = ["print_live", "print_dead", "delete"])]
        print_roots: bool,

        /// Print the paths that are alive and exit.
        #[arg(long, conflicts_with_all = ["print_dead", "delete"])]
        print_live: bool,

        /// Print the paths that would be deleted and exit.
        #[arg(long, conflicts_with = "delete")]
        print_dead: bool,

        /// Only delete these paths, failing if any of them is alive.
        #[arg(long, num_args = 1..)]
        delete: Vec<PathBuf>,

        /// Don't look for roots. Temporary roots are still honoured.
        #[arg(long, requires = "delete")]
        ignore_liveness: bool,

        /// Stop after freeing this many bytes. Accepts K, M, G and T suffixes.
        #[arg(long, value_parser = parse_max_freed)]
        max_freed: Option<u64>,

        /// Delete all old generations of profiles first.
        #[arg(long, short = 'd')]
        delete_old: bool,

        /// Delete generations of profiles older than this many days, e.g. 14d.
        #[arg(long, conflicts_with = "delete_old")]
        delete_older_than: Option<String>,

        /// Only show which generations would be deleted.
        #[arg(long)]
        dry_run: bool,
    },

    /// Makes `location` a root pointing to `store_path`.
    AddRoot {
        store_path: PathBuf,
        location: PathBuf,
    },

    /// Prints all roots.
    Roots {
        /// Hide the locations of temporary and runtime roots.
        #[arg(long)]
        censor: bool,
    },

    /// Registers a path in the store as valid.
    Register {
        path: PathBuf,

        #[arg(long, num_args = 1..)]
        references: Vec<PathBuf>,

        #[arg(long)]
        deriver: Option<PathBuf>,

        #[arg(long, default_value_t = 0)]
        nar_size: u64,
    },
}

fn parse_max_freed(s: &str) -> Result<u64, String> {
    parse_size(s).ok_or_else(|| format!("invalid size '{}'", s))
}

fn show_bytes(bytes: u64) -> String {
    format!("{:.2} MiB", bytes as f64 / (1024.0 * 1024.0))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let tracing_handle = strata_tracing::TracingBuilder::default()
        .level(cli.log_level)
        .enable_progressbar()
        .build()?;

    let mut settings = Settings::default();
    settings.load(&cli.conf)?;
    if let Some(store_dir) = cli.store_dir {
        settings.store_dir = store_dir;
    }
    if let Some(state_dir) = cli.state_dir {
        settings.state_dir = state_dir;
    }

    let path_info_service_addr = cli.path_info_service_addr.unwrap_or_else(|| {
        format!(
            "redb://{}",
            settings.state_dir.join("db/pathinfo.redb").display()
        )
    });
    let path_info_service = pathinfoservice::from_addr(&path_info_service_addr)?;
    let store = Arc::new(LocalStore::new(settings, path_info_service)?);

    // A collection in progress stops at the next path it looks at.
    let interrupted = store.interrupt_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, stopping");
            interrupted.store(true, Ordering::Relaxed);
        }
    });

    let mut stdout = tracing_handle.get_stdout_writer();

    match cli.command {
        Commands::Gc {
            print_roots,
            print_live,
            print_dead,
            delete,
            ignore_liveness,
            max_freed,
            delete_old,
            delete_older_than,
            dry_run,
        } => {
            if print_roots {
                let roots = tokio::task::spawn_blocking({
                    let store = store.clone();
                    move || store.find_roots(false)
                })
                .await??;

                let mut lines = BTreeSet::new();
                for (path, locations) in roots {
                    for location in locations {
                        lines.insert(format!(
                            "{} -> {}",
                            location,
                            store.print_store_path(&path).display()
                        ));
                    }
                }
                for line in lines {
                    writeln!(stdout, "{}", line)?;
                }
                return Ok(());
            }

            if delete_old || delete_older_than.is_some() {
                let older_than = delete_older_than
                    .as_deref()
                    .map(profiles::parse_older_than_timespec)
                    .transpose()?;
                profiles::remove_old_generations(&store.profiles_dir(), older_than, dry_run)?;
                if dry_run {
                    return Ok(());
                }
            }

            let action = if print_live {
                GcAction::ReturnLive
            } else if print_dead {
                GcAction::ReturnDead
            } else if !delete.is_empty() {
                GcAction::DeleteSpecific(
                    delete
                        .iter()
                        .map(|p| store.parse_store_path(p))
                        .collect::<Result<_, _>>()?,
                )
            } else {
                GcAction::DeleteDead
            };

            let options = GcOptions {
                action,
                ignore_liveness,
                max_freed: max_freed.unwrap_or(u64::MAX),
            };

            let results = tokio::task::spawn_blocking({
                let store = store.clone();
                move || store.collect_garbage(&options)
            })
            .await??;

            if print_live || print_dead {
                for path in &results.paths {
                    writeln!(stdout, "{}", path.display())?;
                }
            } else {
                writeln!(
                    stdout,
                    "{} store paths deleted, {} freed",
                    results.paths.len(),
                    show_bytes(results.bytes_freed)
                )?;
            }
        }

        Commands::AddRoot {
            store_path,
            location,
        } => {
            let (sp, _) = store.to_store_path(&store_path)?;
            let root = tokio::task::spawn_blocking({
                let store = store.clone();
                move || store.add_perm_root(&sp, &location)
            })
            .await??;
            writeln!(stdout, "{}", root.display())?;
        }

        Commands::Roots { censor } => {
            let roots = tokio::task::spawn_blocking({
                let store = store.clone();
                move || store.find_roots(censor)
            })
            .await??;

            for (path, locations) in roots {
                writeln!(
                    stdout,
                    "{}: {}",
                    store.print_store_path(&path).display(),
                    locations.into_iter().collect::<Vec<_>>().join(", ")
                )?;
            }
        }

        Commands::Register {
            path,
            references,
            deriver,
            nar_size,
        } => {
            // Collect first if the store is about to run out of space.
            tokio::task::spawn_blocking({
                let store = store.clone();
                move || store.auto_gc(true)
            })
            .await??;

            let mut path_info = PathInfo::new(store.parse_store_path(&path)?);
            path_info.references = references
                .iter()
                .map(|p| store.parse_store_path(p))
                .collect::<Result<_, _>>()?;
            path_info.deriver = deriver
                .map(|p| store.parse_store_path(&p))
                .transpose()?;
            path_info.nar_size = nar_size;

            let path_info = store.register_valid_path(path_info)?;
            info!(path = %path_info.path, "registered");
        }
    }

    Ok(())
}
