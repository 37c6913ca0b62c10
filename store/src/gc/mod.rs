//! The garbage collector: root discovery, the liveness check and deletion.

pub(crate) mod auto;
mod delete;
mod links;
mod reachability;
mod roots;
mod runtime_roots;
mod temproots;

use nix_compat::store_path::StorePath;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::{
    collections::{BTreeSet, HashSet},
    fs,
    ops::ControlFlow,
    path::PathBuf,
};
use tracing::{debug, info, info_span, instrument};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::{
    pathlock::{create_lock_file, lock_file, FileLock, LockType},
    Error, LocalStore, Settings,
};

pub use self::delete::delete_path;
pub use self::roots::{make_symlink, Roots};

/// Signals that the byte budget of a collection was used up. This is a
/// normal way for a collection to end, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitReached;

/// Whether a collection should go on deleting.
pub(crate) type Deleted = ControlFlow<LimitReached>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum GcAction {
    /// Return the set of paths reachable from (i.e. in the closure of) the roots.
    ReturnLive,
    /// Return the set of paths not reachable from the roots.
    ReturnDead,
    /// Actually delete the paths not reachable from the roots.
    #[default]
    DeleteDead,
    /// Delete the given paths, failing if any of them is still alive.
    DeleteSpecific(BTreeSet<StorePath>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcOptions {
    pub action: GcAction,

    /// Treat all paths as dead: roots are not looked for, only the
    /// temporary roots of running processes keep paths alive.
    /// Only useful together with [GcAction::DeleteSpecific].
    pub ignore_liveness: bool,

    /// Stop after at least this many bytes were freed.
    pub max_freed: u64,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            action: GcAction::DeleteDead,
            ignore_liveness: false,
            max_freed: u64::MAX,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcResults {
    /// Depending on the action, the paths that are live, dead, or were
    /// deleted.
    pub paths: BTreeSet<PathBuf>,

    /// The bytes freed by deleting paths and unused links.
    pub bytes_freed: u64,
}

/// State of one collection run.
pub(crate) struct GcState<'a> {
    pub options: &'a GcOptions,
    pub results: GcResults,

    pub roots: HashSet<StorePath>,
    pub temp_roots: HashSet<StorePath>,
    pub dead: HashSet<StorePath>,
    pub alive: HashSet<StorePath>,

    pub keep_outputs: bool,
    pub keep_derivations: bool,

    /// The NAR size of directories moved to the trash, which are only
    /// freed once the trash is emptied.
    pub bytes_invalidated: u64,
    pub move_to_trash: bool,
    pub should_delete: bool,
}

impl<'a> GcState<'a> {
    pub fn new(options: &'a GcOptions, settings: &Settings) -> Self {
        let mut state = Self {
            options,
            results: GcResults::default(),
            roots: HashSet::new(),
            temp_roots: HashSet::new(),
            dead: HashSet::new(),
            alive: HashSet::new(),
            keep_outputs: settings.keep_outputs,
            keep_derivations: settings.keep_derivations,
            bytes_invalidated: 0,
            move_to_trash: true,
            should_delete: matches!(
                options.action,
                GcAction::DeleteDead | GcAction::DeleteSpecific(_)
            ),
        };

        // Using these flags with ignore_liveness would keep half of the
        // paths the user asked to delete.
        if options.ignore_liveness && matches!(options.action, GcAction::DeleteSpecific(_)) {
            state.keep_outputs = false;
            state.keep_derivations = false;
        }

        state
    }
}

impl LocalStore {
    /// Acquires the global GC lock. A collector holds it exclusively,
    /// processes adding roots take it shared.
    pub(crate) fn open_gc_lock(&self, mode: LockType) -> Result<FileLock, Error> {
        let path = self.gc_lock_path();
        debug!(path = ?path, ?mode, "acquiring global GC lock");

        let file = create_lock_file(&path)?;
        if !lock_file(&file, mode, false).map_err(Error::lock(&path))? {
            info!("waiting for the big garbage collector lock...");
            lock_file(&file, mode, true).map_err(Error::lock(&path))?;
        }

        Ok(FileLock::from_locked(file, &path, mode))
    }

    /// Waits until a running collection finished.
    pub fn sync_with_gc(&self) -> Result<(), Error> {
        self.open_gc_lock(LockType::Read).map(drop)
    }

    /// Runs a collection.
    #[instrument(skip_all, fields(action = ?options.action, max_freed = options.max_freed), err)]
    pub fn collect_garbage(&self, options: &GcOptions) -> Result<GcResults, Error> {
        let mut state = GcState::new(options, &self.settings);

        // Free up the reserved space, so we can run on a full disk.
        if state.should_delete {
            let reserved = self.reserved_path();
            if let Err(e) = fs::remove_file(&reserved) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(Error::io("deleting", &reserved)(e));
                }
            }
        }

        // Nobody can add roots while we hold this, so the set of roots
        // found below is final.
        let gc_lock = self.open_gc_lock(LockType::Write)?;

        info!("finding garbage collector roots...");
        let mut roots = Roots::new();
        if !options.ignore_liveness {
            self.find_roots_no_temp(&mut roots, true)?;
        }
        state.roots.extend(roots.into_keys());

        // Temporary roots are always honoured. The locks on their files
        // are kept until we're done.
        let (temp_root_locks, temp_roots) = self.find_temp_roots(true)?;
        for root in temp_roots.into_keys() {
            state.temp_roots.insert(root.clone());
            state.roots.insert(root);
        }

        if state.should_delete {
            let trash = self.trash_dir();
            if trash.symlink_metadata().is_ok() {
                self.delete_garbage(&mut state, &trash)?;
            }
            if let Err(e) = fs::create_dir_all(&trash) {
                if e.raw_os_error() == Some(libc::ENOSPC) {
                    info!(err = %e, "note: can't create trash directory");
                    state.move_to_trash = false;
                } else {
                    return Err(Error::io("creating directory", &trash)(e));
                }
            }
        }

        match &options.action {
            GcAction::DeleteSpecific(paths) => {
                for path in paths {
                    let abs = self.print_store_path(path);
                    if let ControlFlow::Break(LimitReached) = self.try_to_delete(&mut state, &abs)? {
                        break;
                    }
                    if !state.dead.contains(path) {
                        return Err(Error::StillAlive(abs));
                    }
                }
            }
            _ if options.max_freed > 0 => {
                match &options.action {
                    GcAction::DeleteDead => info!("deleting garbage..."),
                    _ => info!("determining live/dead paths..."),
                }

                if let ControlFlow::Break(LimitReached) = self.collect_store_entries(&mut state)? {
                    info!(
                        max_freed = options.max_freed,
                        "deleted or invalidated enough bytes; stopping"
                    );
                }
            }
            _ => {}
        }

        assert!(
            state.alive.is_disjoint(&state.dead),
            "paths can't be both dead and alive"
        );

        match options.action {
            GcAction::ReturnLive => {
                state.results.paths = state
                    .alive
                    .iter()
                    .map(|p| self.print_store_path(p))
                    .collect();
                return Ok(state.results);
            }
            GcAction::ReturnDead => {
                state.results.paths = state
                    .dead
                    .iter()
                    .map(|p| self.print_store_path(p))
                    .collect();
                return Ok(state.results);
            }
            _ => {}
        }

        // Allow other processes to add to the store from here on.
        drop(gc_lock);
        drop(temp_root_locks);

        // The trash doesn't need the lock, its contents are garbage.
        let trash = self.trash_dir();
        if trash.symlink_metadata().is_ok() {
            info!(path = ?trash, "deleting trash");
            self.delete_garbage(&mut state, &trash)?;
        }

        if state.should_delete {
            self.remove_unused_links(&mut state)?;
        }

        info!(
            paths = state.results.paths.len(),
            bytes_freed = state.results.bytes_freed,
            "collection finished"
        );

        Ok(state.results)
    }

    /// Considers every entry of the store dir for deletion. Entries that
    /// aren't valid paths go first, the rest in a random, but reproducible
    /// order.
    fn collect_store_entries(&self, state: &mut GcState) -> Result<Deleted, Error> {
        let store_dir = self.store_dir();
        let mut entries = Vec::new();

        for entry in fs::read_dir(store_dir).map_err(Error::io("opening directory", store_dir))? {
            self.check_interrupt()?;
            let entry = entry.map_err(Error::io("reading directory", store_dir))?;
            let path = entry.path();

            let valid = match self.maybe_parse_store_path(&path) {
                Some(sp) => self.is_valid_path(&sp)?,
                None => false,
            };

            if valid {
                entries.push(path);
            } else if let ControlFlow::Break(l) = self.try_to_delete(state, &path)? {
                return Ok(ControlFlow::Break(l));
            }
        }

        // Don't always delete in the order of the names, or a budget would
        // always pick the same victims.
        entries.shuffle(&mut StdRng::seed_from_u64(1));

        let span = info_span!("considering store paths", indicatif.pb_show = 1);
        span.pb_set_style(&strata_tracing::PB_PROGRESS_STYLE);
        span.pb_set_length(entries.len() as u64);
        let _enter = span.enter();

        for path in entries {
            if let ControlFlow::Break(l) = self.try_to_delete(state, &path)? {
                return Ok(ControlFlow::Break(l));
            }
            span.pb_inc(1);
        }

        Ok(ControlFlow::Continue(()))
    }
}
