use std::{fs, io, os::unix::fs::MetadataExt};
use tracing::{debug, info, instrument};

use super::GcState;
use crate::{Error, LocalStore};

impl LocalStore {
    /// Deletes the files in the links directory that no store path links to
    /// anymore, i.e. that have a link count of one.
    #[instrument(skip_all, err)]
    pub(crate) fn remove_unused_links(&self, state: &mut GcState) -> Result<(), Error> {
        let links_dir = self.links_dir();
        let entries = match fs::read_dir(&links_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::io("opening directory", &links_dir)(e)),
        };

        info!("deleting unused links...");

        let mut actual_size: u64 = 0;
        let mut unshared_size: u64 = 0;

        for entry in entries {
            self.check_interrupt()?;

            let entry = entry.map_err(Error::io("reading directory", &links_dir))?;
            let path = entry.path();
            let metadata = path
                .symlink_metadata()
                .map_err(Error::io("statting", &path))?;

            if metadata.nlink() != 1 {
                actual_size += metadata.len();
                unshared_size += (metadata.nlink() - 1) * metadata.len();
                continue;
            }

            debug!(path = ?path, "deleting unused link");
            match fs::remove_file(&path) {
                Ok(()) => state.results.bytes_freed += metadata.len(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io("deleting", &path)(e)),
            }
        }

        let overhead = fs::metadata(&links_dir)
            .map(|m| m.blocks() * 512)
            .unwrap_or(0);
        let saved = unshared_size as f64 - actual_size as f64 - overhead as f64;
        info!(
            "note: currently hard linking saves {:.2} MiB",
            saved / (1024.0 * 1024.0)
        );

        Ok(())
    }
}
