//! Profiles: symlinks to a store path, with numbered generations kept next
//! to them as `<profile>-<number>-link`. Every generation is a root.

use nix_compat::store_path::StorePath;
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use tracing::{info, instrument};

use crate::{gc::make_symlink, pathlock::PathLocks, Error, LocalStore};

pub type GenerationNumber = u64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Generation {
    pub number: GenerationNumber,
    pub path: PathBuf,
    pub creation_time: SystemTime,
}

/// Parses a generation name of the form `<profile_name>-<number>-link`.
fn parse_name(profile_name: &str, name: &str) -> Option<GenerationNumber> {
    let rest = name.strip_prefix(profile_name)?.strip_prefix('-')?;
    let (number, _) = rest.split_once("-link")?;
    number.parse().ok()
}

fn make_name(profile: &Path, number: GenerationNumber) -> PathBuf {
    let mut name = profile.as_os_str().to_owned();
    name.push(format!("-{}-link", number));
    name.into()
}

fn profile_name(profile: &Path) -> Result<&str, Error> {
    profile
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Profile(format!("invalid profile name {:?}", profile)))
}

/// Returns the generations of `profile`, ordered by number, and the number
/// of the generation the profile currently points to.
pub fn find_generations(
    profile: &Path,
) -> Result<(Vec<Generation>, Option<GenerationNumber>), Error> {
    let name = profile_name(profile)?;
    let dir = profile.parent().unwrap_or(Path::new("/"));

    let mut generations = Vec::new();
    for entry in fs::read_dir(dir).map_err(Error::io("opening directory", dir))? {
        let entry = entry.map_err(Error::io("reading directory", dir))?;
        let Some(number) = entry.file_name().to_str().and_then(|n| parse_name(name, n)) else {
            continue;
        };

        let path = entry.path();
        let creation_time = path
            .symlink_metadata()
            .and_then(|m| m.modified())
            .map_err(Error::io("getting status of", &path))?;

        generations.push(Generation {
            number,
            path,
            creation_time,
        });
    }

    generations.sort_by_key(|g| g.number);

    let current = fs::read_link(profile)
        .ok()
        .and_then(|target| target.to_str().map(|t| t.to_owned()))
        .and_then(|target| {
            let target = Path::new(&target);
            target.file_name()?.to_str().and_then(|t| parse_name(name, t))
        });

    Ok((generations, current))
}

/// Makes `link` point to `target`, relative if both are in the same
/// directory.
pub fn switch_link(link: &Path, target: &Path) -> Result<(), Error> {
    let target = match (target.parent(), link.parent(), target.file_name()) {
        (Some(a), Some(b), Some(name)) if a == b => Path::new(name),
        _ => target,
    };
    make_symlink(link, target)
}

fn lock_profile(profile: &Path) -> Result<PathLocks, Error> {
    let mut lock = PathLocks::lock(
        [profile],
        &format!("waiting for lock on profile '{}'", profile.display()),
    )?;
    lock.set_deletion(true);
    Ok(lock)
}

pub fn delete_generation(profile: &Path, number: GenerationNumber) -> Result<(), Error> {
    let generation = make_name(profile, number);
    match fs::remove_file(&generation) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            Err(Error::io("deleting", &generation)(e))
        }
        _ => Ok(()),
    }
}

fn delete_generation_logged(
    profile: &Path,
    number: GenerationNumber,
    dry_run: bool,
) -> Result<(), Error> {
    if dry_run {
        info!(profile = ?profile, "would remove profile version {}", number);
        Ok(())
    } else {
        info!(profile = ?profile, "removing profile version {}", number);
        delete_generation(profile, number)
    }
}

/// Deletes the given generations. Deleting the current one is an error.
pub fn delete_generations(
    profile: &Path,
    to_delete: &BTreeSet<GenerationNumber>,
    dry_run: bool,
) -> Result<(), Error> {
    let _lock = lock_profile(profile)?;
    let (generations, current) = find_generations(profile)?;

    if let Some(current) = current {
        if to_delete.contains(&current) {
            return Err(Error::Profile(format!(
                "cannot delete current version of profile {:?}",
                profile
            )));
        }
    }

    for generation in generations {
        if to_delete.contains(&generation.number) {
            delete_generation_logged(profile, generation.number, dry_run)?;
        }
    }

    Ok(())
}

/// Deletes all generations but the current one.
pub fn delete_old_generations(profile: &Path, dry_run: bool) -> Result<(), Error> {
    let _lock = lock_profile(profile)?;
    let (generations, current) = find_generations(profile)?;

    for generation in generations {
        if Some(generation.number) != current {
            delete_generation_logged(profile, generation.number, dry_run)?;
        }
    }

    Ok(())
}

/// Keeps the current generation and the `max - 1` generations before it,
/// deleting all older ones. Generations newer than the current one are
/// kept as well.
pub fn delete_generations_greater_than(
    profile: &Path,
    max: GenerationNumber,
    dry_run: bool,
) -> Result<(), Error> {
    if max == 0 {
        return Err(Error::Profile(
            "must keep at least one generation, otherwise the current one would be deleted"
                .to_string(),
        ));
    }

    let _lock = lock_profile(profile)?;
    let (generations, current) = find_generations(profile)?;

    let older = generations
        .iter()
        .rev()
        .skip_while(|g| Some(g.number) != current)
        .skip(max as usize);

    for generation in older {
        delete_generation_logged(profile, generation.number, dry_run)?;
    }

    Ok(())
}

/// Deletes the generations created before `time`, except the newest of them
/// (which was current at `time`) and the current one.
pub fn delete_generations_older_than(
    profile: &Path,
    time: SystemTime,
    dry_run: bool,
) -> Result<(), Error> {
    let _lock = lock_profile(profile)?;
    let (generations, current) = find_generations(profile)?;

    let older = generations
        .iter()
        .rev()
        .skip_while(|g| g.creation_time >= time)
        .skip(1);

    for generation in older {
        if Some(generation.number) != current {
            delete_generation_logged(profile, generation.number, dry_run)?;
        }
    }

    Ok(())
}

/// Parses a number of days like `14d` into the point in time that many days
/// ago.
pub fn parse_older_than_timespec(spec: &str) -> Result<SystemTime, Error> {
    let invalid = || {
        Error::Profile(format!(
            "invalid number of days specifier '{}', expected something like '14d'",
            spec
        ))
    };

    let days: u64 = spec
        .strip_suffix('d')
        .ok_or_else(invalid)?
        .parse()
        .map_err(|_| invalid())?;
    if days < 1 {
        return Err(invalid());
    }

    SystemTime::now()
        .checked_sub(Duration::from_secs(days * 24 * 3600))
        .ok_or_else(invalid)
}

/// Points `profile` at generation `target`, or at the one before the current
/// one if `target` is not given.
pub fn switch_generation(
    profile: &Path,
    target: Option<GenerationNumber>,
    dry_run: bool,
) -> Result<GenerationNumber, Error> {
    let _lock = lock_profile(profile)?;
    let (generations, current) = find_generations(profile)?;

    let dst = generations.iter().rev().find(|g| match target {
        Some(target) => g.number == target,
        None => current.map_or(false, |current| g.number < current),
    });

    let Some(dst) = dst else {
        return Err(Error::Profile(match target {
            Some(target) => format!("profile version {} does not exist", target),
            None => format!(
                "no profile version older than the current ({}) exists",
                current.unwrap_or(0)
            ),
        }));
    };

    info!(
        "switching profile from version {} to {}",
        current.unwrap_or(0),
        dst.number
    );

    if !dry_run {
        switch_link(profile, &dst.path)?;
    }

    Ok(dst.number)
}

/// Prunes the generations of all profiles below `dir`: all but the current
/// one, or only those older than `older_than`.
pub fn remove_old_generations(
    dir: &Path,
    older_than: Option<SystemTime>,
    dry_run: bool,
) -> Result<(), Error> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io("opening directory", dir)(e)),
    };

    for entry in entries {
        let entry = entry.map_err(Error::io("reading directory", dir))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(Error::io("getting status of", &path))?;

        if file_type.is_symlink() {
            let Ok(target) = fs::read_link(&path) else {
                continue;
            };
            // Only profiles point to generations.
            if !target.to_string_lossy().contains("link") {
                continue;
            }

            info!(profile = ?path, "removing old generations of profile");
            match older_than {
                Some(time) => delete_generations_older_than(&path, time, dry_run)?,
                None => delete_old_generations(&path, dry_run)?,
            }
        } else if file_type.is_dir() {
            remove_old_generations(&path, older_than, dry_run)?;
        }
    }

    Ok(())
}

impl LocalStore {
    /// Adds a generation pointing to `out_path` to `profile`, unless the
    /// newest generation already points there. Returns the generation link.
    #[instrument(skip(self, out_path), fields(out_path = %out_path), err)]
    pub fn create_generation(&self, profile: &Path, out_path: &StorePath) -> Result<PathBuf, Error> {
        let (generations, _) = find_generations(profile)?;

        let number = match generations.last() {
            Some(last) => {
                if fs::read_link(&last.path).ok() == Some(self.print_store_path(out_path)) {
                    return Ok(last.path.clone());
                }
                last.number
            }
            None => 0,
        };

        // add_perm_root blocks while a collection runs, which would
        // otherwise miss the new generation.
        let generation = make_name(profile, number + 1);
        self.add_perm_root(out_path, &generation)
    }
}
