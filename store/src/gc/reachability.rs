use nix_compat::store_path::StorePath;
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, trace};

use super::GcState;
use crate::{Error, LocalStore};

impl LocalStore {
    /// Whether `path` is alive, i.e. reachable backwards through referrers
    /// (and deriver/output edges, depending on the keep flags) from a root.
    /// Results are memoized in `state.alive`. Every path examined without
    /// finding a root is added to `visited`; if the answer is false, all
    /// of them are garbage.
    pub(crate) fn can_reach_root(
        &self,
        state: &mut GcState,
        visited: &mut HashSet<StorePath>,
        path: &StorePath,
    ) -> Result<bool, Error> {
        self.check_interrupt()?;

        // Cycles never make a path alive.
        if visited.contains(path) {
            return Ok(false);
        }

        if state.alive.contains(path) {
            return Ok(true);
        }

        if state.dead.contains(path) {
            return Ok(false);
        }

        if state.roots.contains(path) {
            debug!(path = %path, "cannot delete, it's a root");
            state.alive.insert(path.clone());
            return Ok(true);
        }

        visited.insert(path.clone());

        if !self.is_valid_path(path)? {
            return Ok(false);
        }

        let svc = self.path_info_service();
        let mut incoming: BTreeSet<StorePath> = svc.query_referrers(path)?;

        // If keep-derivations is set and this is a derivation, then don't
        // delete the derivation if any of the outputs are alive.
        if state.keep_derivations && path.is_derivation() {
            for out in svc
                .query_partial_derivation_output_map(path)?
                .into_values()
                .flatten()
            {
                if let Some(info) = svc.get(&out)? {
                    if info.deriver.as_ref() == Some(path) {
                        incoming.insert(out);
                    }
                }
            }
        }

        // If keep-outputs is set, then don't delete this path if there are
        // derivers of this path that are not garbage.
        if state.keep_outputs {
            incoming.extend(svc.query_valid_derivers(path)?);
        }

        for other in incoming {
            if &other == path {
                continue;
            }
            if self.can_reach_root(state, visited, &other)? {
                trace!(path = %path, via = %other, "alive");
                state.alive.insert(path.clone());
                return Ok(true);
            }
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{GcAction, GcOptions, GcState};
    use crate::tests::fixtures::{store_path, TestStore};
    use nix_compat::store_path::StorePath;
    use rstest::rstest;
    use std::collections::HashSet;

    fn can_reach(ts: &TestStore, state: &mut GcState, path: &StorePath) -> bool {
        let mut visited = HashSet::new();
        let alive = ts
            .store
            .can_reach_root(state, &mut visited, path)
            .expect("must succeed");
        if !alive {
            state.dead.extend(visited);
        }
        alive
    }

    /// Everything a root refers to, directly or not, is alive.
    #[test]
    fn closure_of_root_is_alive() {
        let ts = TestStore::new();
        let lib = ts.add_file("lib", 1, &[]);
        let app = ts.add_file("app", 1, &[&lib]);
        let env = ts.add_file("env", 1, &[&app, &lib]);
        let garbage = ts.add_file("garbage", 1, &[&lib]);

        let options = GcOptions::default();
        let mut state = GcState::new(&options, &ts.store.settings);
        state.roots.insert(env.clone());

        assert!(can_reach(&ts, &mut state, &lib));
        assert!(can_reach(&ts, &mut state, &app));
        assert!(can_reach(&ts, &mut state, &env));
        assert!(!can_reach(&ts, &mut state, &garbage));

        assert_eq!(HashSet::from([lib, app, env]), state.alive);
        assert_eq!(HashSet::from([garbage]), state.dead);
    }

    /// A reference cycle without a root is garbage as a whole.
    #[test]
    fn cycle_is_not_alive() {
        let ts = TestStore::new();
        let a = ts.add_file("a", 1, &[]);
        let b = ts.add_file("b", 1, &[&a]);

        // close the cycle a -> b -> a.
        let svc = ts.store.path_info_service();
        let mut a_info = svc.get(&a).unwrap().unwrap();
        a_info.references.insert(b.clone());
        svc.put(a_info).unwrap();

        let options = GcOptions::default();
        let mut state = GcState::new(&options, &ts.store.settings);

        assert!(!can_reach(&ts, &mut state, &a));
        assert_eq!(HashSet::from([a, b]), state.dead);
        assert!(state.alive.is_empty());
    }

    /// Temporary roots of paths being built are alive even while invalid.
    #[test]
    fn invalid_root_is_alive() {
        let ts = TestStore::new();
        let building = store_path("building");

        let options = GcOptions::default();
        let mut state = GcState::new(&options, &ts.store.settings);
        state.roots.insert(building.clone());

        assert!(can_reach(&ts, &mut state, &building));
        assert!(!can_reach(&ts, &mut state, &store_path("other")));
    }

    #[rstest]
    #[case::keep_derivations(false, true, false, true)]
    #[case::keep_outputs(true, false, true, false)]
    #[case::keep_both(true, true, true, true)]
    #[case::keep_none(false, false, false, false)]
    fn keep_flags(
        #[case] keep_outputs: bool,
        #[case] keep_derivations: bool,
        #[case] out_alive_via_drv: bool,
        #[case] drv_alive_via_out: bool,
    ) {
        let ts = TestStore::with_settings(|settings| {
            settings.keep_outputs = keep_outputs;
            settings.keep_derivations = keep_derivations;
        });
        let drv = ts.add_file("hello.drv", 1, &[]);
        let out = ts.add_file("hello", 1, &[]);
        ts.link_derivation(&drv, &out);

        let options = GcOptions::default();

        // the output is rooted: is its derivation kept?
        let mut state = GcState::new(&options, &ts.store.settings);
        state.roots.insert(out.clone());
        assert_eq!(drv_alive_via_out, can_reach(&ts, &mut state, &drv));

        // the derivation is rooted: is its output kept?
        let mut state = GcState::new(&options, &ts.store.settings);
        state.roots.insert(drv.clone());
        assert_eq!(out_alive_via_drv, can_reach(&ts, &mut state, &out));
    }

    /// ignore_liveness when deleting specific paths turns the keep flags off.
    #[test]
    fn ignore_liveness_disables_keep_flags() {
        let ts = TestStore::with_settings(|settings| {
            settings.keep_outputs = true;
            settings.keep_derivations = true;
        });

        let options = GcOptions {
            action: GcAction::DeleteSpecific(Default::default()),
            ignore_liveness: true,
            ..Default::default()
        };
        let state = GcState::new(&options, &ts.store.settings);
        assert!(!state.keep_outputs);
        assert!(!state.keep_derivations);
    }
}
