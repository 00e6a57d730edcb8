use std::{
    fs::{self, File},
    io,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use tracing::{trace, warn};

use crate::{error::SinceError, identity::Identity};

/// Transient flags of a tracked file. Only `dirty` outlives the run, by causing a persist.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    /// descriptor position differs from `pos`, seek before reading
    pub jump: bool,
    /// `pos` has to be written to the state file
    pub dirty: bool,
    pub deleted: bool,
    pub replaced: bool,
    pub moved: bool,
    /// worth a header at the active verbosity
    pub notable: bool,
}

/// A file whose appended content is displayed
#[derive(Debug)]
pub struct DataFile {
    pub(crate) name: PathBuf,
    pub(crate) file: File,
    pub(crate) identity: Identity,
    /// offset loaded from the state file
    pub(crate) had: u64,
    /// last known size
    pub(crate) now: u64,
    /// offset up to which content has been displayed, the value that gets persisted
    pub(crate) pos: u64,
    /// byte offset of the matching record inside the state file
    pub(crate) record: Option<usize>,
    pub(crate) status: Status,
}

impl DataFile {
    /// Open a regular file for tracking
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinceError> {
        let name = path.as_ref().to_path_buf();
        let target_error = |source| SinceError::Target {
            path: name.clone(),
            source,
        };

        let file = File::open(&name).map_err(target_error)?;
        let metadata = file.metadata().map_err(target_error)?;
        if !metadata.is_file() {
            return Err(SinceError::SpecialFile(name));
        }

        Ok(Self {
            identity: Identity::from(&metadata),
            now: metadata.len(),
            name,
            file,
            had: 0,
            pos: 0,
            record: None,
            status: Status {
                notable: true,
                ..Status::default()
            },
        })
    }

    pub fn name(&self) -> &Path {
        &self.name
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Last known size of the file
    pub fn size(&self) -> u64 {
        self.now
    }

    /// Offset up to which content has been displayed
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Byte offset of the state record bound to this file
    pub fn record(&self) -> Option<usize> {
        self.record
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Bytes not displayed yet
    pub fn unread(&self) -> u64 {
        self.now.saturating_sub(self.pos)
    }

    /// Account for `len` bytes that reached the output
    pub(crate) fn advance(&mut self, len: u64) {
        self.pos += len;
        self.status.dirty = true;
    }

    /// Reconcile the loaded offset with the known size and the display position
    pub(crate) fn settle(&mut self) {
        if self.had > self.now {
            warn!(
                file = %self.name.display(),
                "considering file to be truncated, displaying from start"
            );
            self.had = 0;
            self.status.dirty = true;
        }
        if self.pos < self.had {
            self.pos = self.had;
            self.status.jump = true;
        }
    }

    /// Skip everything that is currently in the file
    pub(crate) fn discard(&mut self) {
        if self.pos != self.now {
            self.pos = self.now;
            self.status.jump = true;
            self.status.dirty = true;
        }
    }

    /// Re-examine the file by name and by descriptor, updating size and status flags.
    ///
    /// A different identity behind the name marks the file replaced, a name that no longer
    /// resolves marks it moved, or deleted once the open descriptor has no links left. A size
    /// below the last known one is a truncation and restarts display at zero.
    pub fn refresh(&mut self) -> Result<(), SinceError> {
        let by_name = match fs::metadata(&self.name) {
            Ok(metadata) if Identity::from(&metadata) == self.identity => {
                self.status.replaced = false;
                self.status.moved = false;
                Some(metadata)
            }
            Ok(_) => {
                if !self.status.replaced {
                    self.status.replaced = true;
                    self.status.notable = true;
                }
                trace!(file = %self.name.display(), "name no longer matches tracked file");
                None
            }
            Err(err) => {
                if err.kind() == io::ErrorKind::NotFound && !self.status.moved {
                    self.status.moved = true;
                    self.status.notable = true;
                }
                None
            }
        };

        let metadata = match by_name {
            Some(metadata) => metadata,
            None => {
                let metadata = self.file.metadata().map_err(|source| SinceError::Refresh {
                    path: self.name.clone(),
                    source,
                })?;
                if metadata.nlink() == 0 {
                    if !self.status.deleted {
                        self.status.deleted = true;
                        self.status.notable = true;
                    }
                } else if !self.status.moved {
                    self.status.moved = true;
                    self.status.notable = true;
                }
                metadata
            }
        };

        let size = metadata.len();
        trace!(file = %self.name.display(), size, known = self.now, "refreshed");

        if size < self.now {
            warn!(
                file = %self.name.display(),
                "considering file to be truncated, displaying from start"
            );
            self.had = 0;
            self.pos = 0;
            self.status.jump = true;
            self.status.dirty = true;
            self.status.notable = true;
        }
        if self.now < size {
            self.status.notable = true;
        }
        self.now = size;

        Ok(())
    }
}
