use nix_compat::nixcpp::machines::Machine;
use std::path::Path;
use strata_store::Settings;
use tracing::debug;

use crate::Error;

/// Returns the remote builders configured in the `builders` setting.
/// Entries of the form `@<file>` are replaced by the machines listed in
/// that file. Missing files are skipped.
pub fn get_machines(settings: &Settings) -> Result<Vec<Machine>, Error> {
    let mut machines = Vec::new();

    for entry in settings.builders.split(['\n', ';']) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        match entry.strip_prefix('@') {
            Some(file) => {
                let file = Path::new(file.trim());
                let contents = match std::fs::read_to_string(file) {
                    Ok(contents) => contents,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        debug!(file = ?file, "machines file doesn't exist");
                        continue;
                    }
                    Err(e) => {
                        return Err(Error::Io {
                            context: "reading machines file",
                            path: file.to_owned(),
                            source: e,
                        })
                    }
                };
                machines.extend(Machine::parse_many(&contents, &settings.system)?);
            }
            None => machines.extend(Machine::parse_many(entry, &settings.system)?),
        }
    }

    Ok(machines)
}
