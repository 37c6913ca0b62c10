use futures::{
    channel::oneshot,
    future::{FutureExt, Shared},
};
use std::{sync::Arc, thread, time::Instant};
use tracing::{debug, error, info};

use super::GcOptions;
use crate::{Error, LocalStore};

/// Bookkeeping of the automatic collector of one store.
#[derive(Debug)]
pub(crate) struct AutoGcState {
    last_gc_check: Option<Instant>,
    gc_running: bool,
    /// Resolves once the running collection finished.
    gc_future: Option<Shared<oneshot::Receiver<()>>>,
    /// The space available after the last automatic collection.
    avail_after_gc: u64,
}

impl Default for AutoGcState {
    fn default() -> Self {
        Self {
            last_gc_check: None,
            gc_running: false,
            gc_future: None,
            avail_after_gc: u64::MAX,
        }
    }
}

/// Marks the automatic collection as finished and wakes up waiters once
/// dropped, also when the collector unwinds.
struct AutoGcGuard<'a> {
    store: &'a LocalStore,
    done: Option<oneshot::Sender<()>>,
    avail_after_gc: Option<u64>,
}

impl Drop for AutoGcGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.store.auto_gc.lock();
        state.gc_running = false;
        state.gc_future = None;
        state.last_gc_check = Some(Instant::now());
        if let Some(avail) = self.avail_after_gc {
            state.avail_after_gc = avail;
        }
        drop(state);

        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

impl LocalStore {
    /// Starts a collection in the background if the store is low on space.
    /// With `sync`, waits for that (or an already running) collection to
    /// finish.
    pub fn auto_gc(self: &Arc<Self>, sync: bool) -> Result<(), Error> {
        let future = {
            let mut state = self.auto_gc.lock();

            if state.gc_running {
                debug!("waiting for auto-GC to finish");
                state.gc_future.clone()
            } else {
                let now = Instant::now();
                if let Some(last) = state.last_gc_check {
                    if now < last + self.settings.min_free_check_interval {
                        return Ok(());
                    }
                }

                let avail = self.available_space()?;
                state.last_gc_check = Some(now);

                if avail >= self.settings.min_free || avail >= self.settings.max_free {
                    return Ok(());
                }

                // The last run didn't free much. Don't keep trying.
                if avail as f64 > state.avail_after_gc as f64 * 0.97 {
                    return Ok(());
                }

                let (tx, rx) = oneshot::channel();
                let future = rx.shared();
                state.gc_running = true;
                state.gc_future = Some(future.clone());

                let store = self.clone();
                let max_freed = self.settings.max_free - avail;
                let spawned = thread::Builder::new()
                    .name("auto-gc".to_string())
                    .spawn(move || store.run_auto_gc(max_freed, tx));

                if let Err(e) = spawned {
                    state.gc_running = false;
                    state.gc_future = None;
                    return Err(Error::Io {
                        context: "spawning auto-GC thread for",
                        path: self.store_dir().to_owned(),
                        source: e,
                    });
                }

                Some(future)
            }
        };

        if sync {
            if let Some(future) = future {
                // A dropped sender means the collector thread went away,
                // which is as done as it gets.
                let _ = futures::executor::block_on(future);
            }
        }

        Ok(())
    }

    fn run_auto_gc(&self, max_freed: u64, done: oneshot::Sender<()>) {
        let mut guard = AutoGcGuard {
            store: self,
            done: Some(done),
            avail_after_gc: None,
        };

        info!(max_freed, "running auto-GC");

        let options = GcOptions {
            max_freed,
            ..Default::default()
        };
        guard.avail_after_gc = match self.collect_garbage(&options) {
            Ok(results) => {
                debug!(bytes_freed = results.bytes_freed, "auto-GC finished");
                self.available_space().ok()
            }
            Err(e) => {
                error!(err = %e, "auto-GC failed");
                None
            }
        };
    }

    /// The number of bytes available to unprivileged users on the store's
    /// filesystem.
    pub fn available_space(&self) -> Result<u64, Error> {
        if let Some(path) = &self.settings.free_space_file {
            let contents =
                std::fs::read_to_string(path).map_err(Error::io("reading", path))?;
            return contents.trim().parse().map_err(|_| {
                Error::InvalidRequest(format!("{:?} doesn't contain a number", path))
            });
        }

        let stat = nix::sys::statvfs::statvfs(self.store_dir()).map_err(|e| Error::Io {
            context: "getting filesystem info about",
            path: self.store_dir().to_owned(),
            source: e.into(),
        })?;

        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::AutoGcGuard;
    use crate::tests::fixtures::TestStore;
    use futures::{channel::oneshot, FutureExt};
    use std::{
        fs,
        panic::{catch_unwind, AssertUnwindSafe},
        sync::atomic::Ordering,
        time::Duration,
    };

    fn low_space_store(free: u64) -> TestStore {
        let ts = TestStore::with_settings(|settings| {
            settings.min_free = 1000;
            settings.max_free = 2000;
            settings.min_free_check_interval = Duration::ZERO;
        });
        let free_space_file = ts.tmpdir.path().join("free");
        fs::write(&free_space_file, free.to_string()).unwrap();

        // settings are fixed once the store is open, so reopen it.
        let mut settings = ts.store.settings().clone();
        settings.free_space_file = Some(free_space_file);
        let store = crate::LocalStore::new(settings, ts.store.path_info_service().clone())
            .unwrap();
        TestStore {
            tmpdir: ts.tmpdir,
            store: std::sync::Arc::new(store),
        }
    }

    #[test]
    fn collects_when_low_on_space() {
        let ts = low_space_store(10);
        let garbage = ts.add_file("garbage", 100, &[]);

        ts.store.auto_gc(true).expect("must succeed");

        assert!(!ts.exists(&garbage));
        assert!(!ts.store.auto_gc.lock().gc_running);
    }

    #[test]
    fn leaves_store_alone_with_enough_space() {
        let ts = low_space_store(5000);
        let kept = ts.add_file("kept", 100, &[]);

        ts.store.auto_gc(true).expect("must succeed");

        assert!(ts.exists(&kept));
    }

    #[test]
    fn rate_limited() {
        let ts = low_space_store(10);

        // far in the future, so the check is skipped entirely.
        let mut state = ts.store.auto_gc.lock();
        state.last_gc_check = Some(std::time::Instant::now() + Duration::from_secs(3600));
        drop(state);

        let kept = ts.add_file("kept", 100, &[]);
        ts.store.auto_gc(true).expect("must succeed");

        assert!(ts.exists(&kept));
    }

    #[test]
    fn available_space_of_filesystem() {
        let ts = TestStore::new();
        assert!(ts.store.available_space().expect("must succeed") > 0);
    }

    #[test]
    fn failed_collection_is_finished() {
        let ts = low_space_store(10);
        let garbage = ts.add_file("garbage", 100, &[]);
        ts.store.interrupt_flag().store(true, Ordering::Relaxed);

        ts.store.auto_gc(true).expect("must succeed");

        assert!(ts.exists(&garbage));
        let state = ts.store.auto_gc.lock();
        assert!(!state.gc_running);
        assert!(state.gc_future.is_none());
    }

    /// Waiters are woken up even if the collector panics.
    #[test]
    fn panicking_collector_is_finished() {
        let ts = low_space_store(10);

        let (tx, rx) = oneshot::channel();
        let future = rx.shared();
        {
            let mut state = ts.store.auto_gc.lock();
            state.gc_running = true;
            state.gc_future = Some(future.clone());
        }

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _guard = AutoGcGuard {
                store: &ts.store,
                done: Some(tx),
                avail_after_gc: None,
            };
            panic!("collector died");
        }));
        assert!(result.is_err());

        assert_eq!(Ok(()), futures::executor::block_on(future));
        let state = ts.store.auto_gc.lock();
        assert!(!state.gc_running);
        assert!(state.gc_future.is_none());
        assert!(state.last_gc_check.is_some());
    }
}
