//! Durable state storage with backup-then-atomic-write semantics
//!
//! Every save follows the same sequence: copy the current state file to the
//! backup path, encode the new state into a temporary file in the same
//! directory, then rename it over the state file. A crash at any point
//! leaves either the previous state file intact or the new one fully
//! written, never a torn mix, and the pre-run state survives at the backup
//! path until the next save.

use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

use crate::state::{self, State};

/// Conventional state file name
pub const DEFAULT_STATE_FILE: &str = "converge.state";

/// Suffix appended to the state path for the default backup path
pub const DEFAULT_BACKUP_SUFFIX: &str = ".backup";

/// Backup path sentinel that disables backups entirely
pub const DISABLE_BACKUP: &str = "-";

#[derive(Debug, Error)]
pub enum Error {
    /// The previous state could not be preserved; the save is aborted
    /// before anything is overwritten
    #[error("failed to back up state to {path}: {source}")]
    Backup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write state to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read state from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Codec(#[from] state::Error),
}

/// Loads and saves a [`State`] at a fixed filesystem location
#[derive(Debug, Clone)]
pub struct Persistor {
    path: PathBuf,
    backup: PathBuf,
}

impl Persistor {
    /// A persistor writing to `path`, backing up to `path` plus
    /// [`DEFAULT_BACKUP_SUFFIX`]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut backup = path.clone().into_os_string();
        backup.push(DEFAULT_BACKUP_SUFFIX);
        Persistor {
            path,
            backup: backup.into(),
        }
    }

    /// Override the backup path; [`DISABLE_BACKUP`] disables backups
    pub fn backup(self, path: impl Into<PathBuf>) -> Self {
        Persistor {
            backup: path.into(),
            ..self
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted state, or `None` if no state file exists yet
    pub fn load(&self) -> Result<Option<State>, Error> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(Error::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let state = State::read(BufReader::new(file))?;
        Ok(Some(state))
    }

    /// Persist `state`, advancing its serial
    ///
    /// The previous state file, if any, is copied to the backup path first;
    /// a backup failure aborts the save with the state file untouched. The
    /// new state is written to a temporary file in the target directory and
    /// renamed into place. The serial is committed to `state` only once the
    /// rename succeeded, so the in-memory serial always matches the file.
    pub fn save(&self, state: &mut State) -> Result<(), Error> {
        if self.backup.as_os_str() != DISABLE_BACKUP && self.path.exists() {
            debug!(path = %self.backup.display(), "backing up state");
            fs::copy(&self.path, &self.backup).map_err(|source| Error::Backup {
                path: self.backup.clone(),
                source,
            })?;
        }

        let mut next = state.clone();
        next.serial += 1;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let write_err = |source| Error::Write {
            path: self.path.clone(),
            source,
        };

        let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
        next.write(&mut tmp)?;
        tmp.flush().map_err(write_err)?;
        tmp.persist(&self.path)
            .map_err(|err| write_err(err.error))?;

        state.serial = next.serial;

        debug!(path = %self.path.display(), serial = state.serial, "state saved");
        Ok(())
    }
}
