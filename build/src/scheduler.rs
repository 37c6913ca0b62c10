use nix_compat::nixcpp::machines::Machine;
use std::collections::BTreeSet;
use strata_store::pathlock::FileLock;
use tracing::{debug, instrument};

use crate::{slots::CurrentLoad, Error};

/// The outcome of looking for a machine to build on.
#[derive(Debug)]
pub enum Selection {
    /// Build on `machines[machine]`, in the slot held by `slot`.
    Accept { machine: usize, slot: FileLock },
    /// Some machines could build this, but all their slots are taken.
    Postpone,
    /// No (enabled) machine can build this.
    Decline,
}

/// A machine with a free slot, and how busy it is.
struct Candidate {
    machine: usize,
    slot: FileLock,
    load: u64,
}

impl Candidate {
    fn relative_load(&self, machines: &[Machine]) -> f32 {
        self.load as f32 / machines[self.machine].speed_factor
    }

    /// Whether this is a better choice than `other`: less load relative to
    /// speed, then the faster machine, then the one with less load.
    fn is_better_than(&self, other: &Candidate, machines: &[Machine]) -> bool {
        let (this_speed, other_speed) = (
            machines[self.machine].speed_factor,
            machines[other.machine].speed_factor,
        );
        let (this_load, other_load) = (self.relative_load(machines), other.relative_load(machines));

        if this_load != other_load {
            return this_load < other_load;
        }
        if this_speed != other_speed {
            return this_speed > other_speed;
        }
        self.load < other.load
    }
}

/// Picks the least loaded enabled machine that supports `needed_system` and
/// `required_features` and has a free slot, and takes that slot.
/// Expected to be called with the main lock of `current_load` held.
#[instrument(skip(machines, current_load), err)]
pub fn select_machine(
    machines: &[Machine],
    current_load: &CurrentLoad,
    needed_system: &str,
    required_features: &BTreeSet<String>,
) -> Result<Selection, Error> {
    let mut right_type = false;
    let mut best: Option<Candidate> = None;

    for (i, machine) in machines.iter().enumerate() {
        debug!(machine = %machine.store_uri, "considering building on remote machine");

        if !machine.enabled
            || !machine.system_types.iter().any(|s| s == needed_system)
            || !machine.all_supported(required_features)
            || !machine.mandatory_met(required_features)
        {
            continue;
        }
        right_type = true;

        // Probe all slots, keeping the first free one.
        let mut free = None;
        let mut load = 0;
        for slot in 0..machine.max_jobs {
            match current_load.try_slot(machine, slot)? {
                Some(lock) if free.is_none() => free = Some(lock),
                Some(_) => {}
                None => load += 1,
            }
        }

        let Some(slot) = free else {
            continue;
        };

        let candidate = Candidate {
            machine: i,
            slot,
            load,
        };
        if best
            .as_ref()
            .map_or(true, |best| candidate.is_better_than(best, machines))
        {
            best = Some(candidate);
        }
    }

    Ok(match best {
        Some(best) => {
            debug!(
                machine = %machines[best.machine].store_uri,
                load = best.load,
                "selected machine"
            );
            Selection::Accept {
                machine: best.machine,
                slot: best.slot,
            }
        }
        None if right_type => Selection::Postpone,
        None => Selection::Decline,
    })
}

#[cfg(test)]
mod tests {
    use super::{select_machine, Selection};
    use crate::slots::CurrentLoad;
    use nix_compat::nixcpp::machines::Machine;
    use std::collections::BTreeSet;
    use strata_store::pathlock::FileLock;
    use tempfile::TempDir;

    fn machine(uri: &str, system: &str, max_jobs: u64, speed_factor: f32) -> Machine {
        Machine {
            max_jobs,
            speed_factor,
            ..Machine::new(uri, system)
        }
    }

    fn setup() -> (TempDir, CurrentLoad) {
        let tmpdir = TempDir::new().unwrap();
        let current_load = CurrentLoad::new(tmpdir.path());
        current_load.create();
        (tmpdir, current_load)
    }

    /// Occupies the first `n` slots of `machine`, as other processes would.
    fn occupy(current_load: &CurrentLoad, machine: &Machine, n: u64) -> Vec<FileLock> {
        (0..n)
            .map(|slot| current_load.try_slot(machine, slot).unwrap().unwrap())
            .collect()
    }

    fn accepted(selection: Selection) -> usize {
        match selection {
            Selection::Accept { machine, .. } => machine,
            other => panic!("expected a machine, got {:?}", other),
        }
    }

    #[test]
    fn tie_break_prefers_faster_machine() {
        let (_tmpdir, current_load) = setup();
        let machines = vec![
            machine("ssh://m1", "x86_64-linux", 3, 1.0),
            machine("ssh://m2", "x86_64-linux", 5, 2.0),
        ];
        let _m1 = occupy(&current_load, &machines[0], 2);
        let _m2 = occupy(&current_load, &machines[1], 4);

        // 2/1 == 4/2, so the faster one wins.
        let selection =
            select_machine(&machines, &current_load, "x86_64-linux", &BTreeSet::new()).unwrap();
        assert_eq!(1, accepted(selection));
    }

    #[test]
    fn least_relative_load_wins() {
        let (_tmpdir, current_load) = setup();
        let machines = vec![
            machine("ssh://m1", "x86_64-linux", 4, 1.0),
            machine("ssh://m2", "x86_64-linux", 4, 1.0),
        ];
        let _m1 = occupy(&current_load, &machines[0], 2);
        let _m2 = occupy(&current_load, &machines[1], 1);

        let selection =
            select_machine(&machines, &current_load, "x86_64-linux", &BTreeSet::new()).unwrap();
        assert_eq!(1, accepted(selection));
    }

    #[test]
    fn decline_without_matching_system() {
        let (_tmpdir, current_load) = setup();
        let machines = vec![machine("ssh://m1", "x86_64-linux", 1, 1.0)];

        let selection = select_machine(&machines, &current_load, "arm", &BTreeSet::new()).unwrap();
        assert!(matches!(selection, Selection::Decline));
    }

    #[test]
    fn postpone_when_all_slots_taken() {
        let (_tmpdir, current_load) = setup();
        let machines = vec![machine("ssh://m1", "arm", 2, 1.0)];
        let _taken = occupy(&current_load, &machines[0], 2);

        let selection = select_machine(&machines, &current_load, "arm", &BTreeSet::new()).unwrap();
        assert!(matches!(selection, Selection::Postpone));
    }

    /// No more than max_jobs slots of a machine are handed out at once.
    #[test]
    fn slots_are_exclusive() {
        let (_tmpdir, current_load) = setup();
        let machines = vec![machine("ssh://m1", "x86_64-linux", 2, 1.0)];
        let features = BTreeSet::new();

        let first = select_machine(&machines, &current_load, "x86_64-linux", &features).unwrap();
        let second = select_machine(&machines, &current_load, "x86_64-linux", &features).unwrap();
        let third = select_machine(&machines, &current_load, "x86_64-linux", &features).unwrap();

        match (&first, &second) {
            (Selection::Accept { slot: a, .. }, Selection::Accept { slot: b, .. }) => {
                assert_ne!(a.path(), b.path())
            }
            other => panic!("expected two slots, got {:?}", other),
        }
        assert!(matches!(third, Selection::Postpone));

        // a finished build frees its slot.
        drop(first);
        let fourth = select_machine(&machines, &current_load, "x86_64-linux", &features).unwrap();
        assert_eq!(0, accepted(fourth));
    }

    #[test]
    fn features_and_enabled() {
        let (_tmpdir, current_load) = setup();
        let mut kvm = machine("ssh://kvm", "x86_64-linux", 1, 1.0);
        kvm.mandatory_features = BTreeSet::from(["kvm".to_string()]);
        let plain = machine("ssh://plain", "x86_64-linux", 1, 1.0);
        let mut machines = vec![kvm, plain];

        let wants_kvm = BTreeSet::from(["kvm".to_string()]);
        let selection =
            select_machine(&machines, &current_load, "x86_64-linux", &wants_kvm).unwrap();
        assert_eq!(0, accepted(selection));

        // mandatory features keep other builds away.
        let selection =
            select_machine(&machines, &current_load, "x86_64-linux", &BTreeSet::new()).unwrap();
        assert_eq!(1, accepted(selection));

        machines[0].enabled = false;
        let selection =
            select_machine(&machines, &current_load, "x86_64-linux", &wants_kvm).unwrap();
        assert!(matches!(selection, Selection::Decline));
    }
}
