use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

use tracing::{debug, info, trace, warn};

use crate::{
    data_file::DataFile,
    error::StateError,
    mapping::{Access, Mapping},
    record::{scan_widths, verify_records, widen_records, FieldWidths, RecordFormat},
};

/// Permissions of newly created state files: read and write for user and group
pub const STATE_FILE_MODE: u32 = 0o660;

/// One location the state file may be opened from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    /// refuse to open the path if it is a symbolic link
    pub nofollow: bool,
}

impl Candidate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            nofollow: false,
        }
    }

    pub fn nofollow(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            nofollow: true,
        }
    }
}

/// Knobs that change how the state file is accessed
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StoreSettings {
    /// never create, patch or replace the state file
    pub readonly: bool,
    /// always persist by a full rewrite and rename
    pub atomic: bool,
    /// prefer a memory mapping over reading the file into memory
    pub use_mmap: bool,
    /// field widths the current architecture needs
    pub arch: FieldWidths,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            readonly: false,
            atomic: false,
            use_mmap: true,
            arch: FieldWidths::native(),
        }
    }
}

/// In-memory content of the state file
enum View {
    Empty,
    Mapped(Mapping),
    Owned(Vec<u8>),
}

impl View {
    fn bytes(&self) -> &[u8] {
        match self {
            View::Empty => &[],
            View::Mapped(mapping) => &mapping[..],
            View::Owned(buffer) => buffer.as_slice(),
        }
    }

    /// True if patches land in the file without a rewrite
    fn writes_through(&self) -> bool {
        matches!(self, View::Mapped(mapping) if mapping.writes_through())
    }

    fn patch(&mut self, at: usize, record: &[u8]) -> io::Result<()> {
        let target = match self {
            View::Empty => None,
            View::Mapped(mapping) => mapping.as_mut_slice(),
            View::Owned(buffer) => Some(buffer.as_mut_slice()),
        };
        target
            .and_then(|bytes| bytes.get_mut(at..at + record.len()))
            .map(|slot| slot.copy_from_slice(record))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("record at {at} is outside of the state view"),
                )
            })
    }
}

/// How `persist` brought the state file up to date
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PersistReport {
    /// read-only mode, nothing written
    ReadOnly,
    /// no offset changed
    Unchanged,
    /// existing records were patched in place and new ones appended
    InPlace { patched: usize, appended: usize },
    /// the file was replaced by a complete new copy
    Rewritten { patched: usize, appended: usize },
}

/// Persistent registry of offsets, one record per file identity.
///
/// ## Working principles
///
/// The state file is loaded once, preferably as a shared memory mapping. Its field widths are
/// inferred from the first record and widened once, by a full rewrite, if the current
/// architecture needs more room. Changed offsets are written back by `persist`, either in place
/// (records keep their length, so a patch never moves other records) or by writing a temporary
/// sibling file and renaming it over the original. A reader never sees a partially written
/// replacement.
///
/// There is no locking between processes. Two concurrent runs may lose one of their updates, but
/// never corrupt the file.
pub struct StateStore {
    path: PathBuf,
    file: Option<File>,
    settings: StoreSettings,
    view: View,
    disk: FieldWidths,
    format: RecordFormat,
}

impl StateStore {
    /// Open the first usable candidate and bring its content into a usable shape: load,
    /// validate, upgrade if needed and build the record format.
    pub fn open(candidates: &[Candidate], settings: StoreSettings) -> Result<Self, StateError> {
        let (path, file) = open_first(candidates, &settings)?;
        let mut store = Self {
            path,
            file,
            settings,
            view: View::Empty,
            disk: settings.arch,
            format: RecordFormat::new(settings.arch)?,
        };
        store.load()?;
        store.validate()?;
        store.upgrade()?;
        store.build_format()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw record bytes as loaded
    pub fn records(&self) -> &[u8] {
        self.view.bytes()
    }

    pub fn format(&self) -> RecordFormat {
        self.format
    }

    /// Field widths of the records on disk
    pub fn disk_widths(&self) -> FieldWidths {
        self.disk
    }

    fn load(&mut self) -> Result<(), StateError> {
        self.view = View::Empty;
        let Some(file) = self.file.as_mut() else {
            trace!(path = %self.path.display(), "no state file, starting empty");
            return Ok(());
        };

        let size = file.metadata()?.len();
        if size == 0 {
            return Ok(());
        }
        let size = usize::try_from(size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "state file too large"))?;

        if self.settings.use_mmap {
            let access = if self.settings.readonly {
                Access::ReadOnly
            } else if self.settings.atomic {
                Access::Private
            } else {
                Access::Shared
            };
            match Mapping::map(file, 0, size, access) {
                Ok(mapping) => {
                    trace!(path = %self.path.display(), size, "mapped state file");
                    self.view = View::Mapped(mapping);
                    return Ok(());
                }
                Err(err) => debug!(path = %self.path.display(), %err, "unable to map state file"),
            }
        }

        let mut buffer = vec![0; size];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buffer)?;
        trace!(path = %self.path.display(), size, "read state file");
        self.view = View::Owned(buffer);
        Ok(())
    }

    fn validate(&mut self) -> Result<(), StateError> {
        if self.records().is_empty() {
            trace!("will not check an empty state file");
            return Ok(());
        }
        self.disk = scan_widths(self.records(), &self.path)?;
        debug!(widths = ?self.disk, "inferred field widths");
        Ok(())
    }

    fn upgrade(&mut self) -> Result<(), StateError> {
        if self.disk.covers(&self.settings.arch) {
            trace!("state file fields are wide enough, no rewrite needed");
            return Ok(());
        }
        if self.settings.readonly {
            return Err(StateError::ReadOnlyUpgrade(self.path.clone()));
        }

        let target = self.disk.widen(&self.settings.arch);
        let widened = widen_records(self.records(), self.disk, target, &self.path)?;
        info!(
            path = %self.path.display(),
            from = ?self.disk,
            to = ?target,
            "widening state file"
        );

        self.view = View::Empty;
        let file = replace_file(&self.path, |file| file.write_all(&widened))?;
        self.file = Some(file);
        self.disk = target;
        self.load()
    }

    fn build_format(&mut self) -> Result<(), StateError> {
        self.format = RecordFormat::new(self.disk)?;
        verify_records(self.records(), &self.format, &self.path)
    }

    /// Write the offsets of all dirty files back.
    ///
    /// Files bound to a record are patched in their slot; unbound ones get a new record appended,
    /// one per identity, with the last file of an identity providing the value. The file is
    /// replaced as a whole in atomic mode, or whenever an existing record changed but the view
    /// does not write through to the file. Otherwise new records are appended at the end.
    pub fn persist(mut self, files: &[DataFile]) -> Result<PersistReport, StateError> {
        if self.settings.readonly {
            info!(path = %self.path.display(), "read-only, not updating state file");
            return Ok(PersistReport::ReadOnly);
        }

        let mut rewrite = self.settings.atomic;
        let mut patched = 0;
        let mut appended = 0;
        let mut append = Vec::new();

        for (index, file) in files.iter().enumerate() {
            if !file.status.dirty {
                continue;
            }
            match file.record {
                Some(at) => {
                    let record = self.format.encode(file.identity, file.pos)?;
                    self.view.patch(at, &record)?;
                    if !self.view.writes_through() {
                        rewrite = true;
                    }
                    patched += 1;
                }
                None => {
                    let superseded = files[index + 1..].iter().any(|later| {
                        later.identity == file.identity
                            && later.record.is_none()
                            && later.status.dirty
                    });
                    if superseded {
                        continue;
                    }
                    self.format.encode_into(file.identity, file.pos, &mut append)?;
                    appended += 1;
                }
            }
        }

        if patched == 0 && appended == 0 {
            return Ok(PersistReport::Unchanged);
        }

        if rewrite {
            let view = &self.view;
            replace_file(&self.path, |file| {
                file.write_all(view.bytes())?;
                file.write_all(&append)
            })?;
            debug!(path = %self.path.display(), patched, appended, "rewrote state file");
            return Ok(PersistReport::Rewritten { patched, appended });
        }

        if !append.is_empty() {
            let end = self.records().len() as u64;
            let file = self
                .file
                .as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "state file not open"))?;
            file.seek(SeekFrom::Start(end))?;
            file.write_all(&append)?;
        }
        debug!(path = %self.path.display(), patched, appended, "updated state file in place");
        Ok(PersistReport::InPlace { patched, appended })
    }
}

fn open_first(
    candidates: &[Candidate],
    settings: &StoreSettings,
) -> Result<(PathBuf, Option<File>), StateError> {
    let mut last_error = None;

    for candidate in candidates {
        trace!(path = %candidate.path.display(), "attempting to open state file");
        let mut options = OpenOptions::new();
        options.read(true);
        if !settings.readonly {
            options.write(true).create(true).mode(STATE_FILE_MODE);
        }
        if candidate.nofollow {
            options.custom_flags(libc::O_NOFOLLOW);
        }

        match options.open(&candidate.path) {
            Ok(file) => {
                debug!(path = %candidate.path.display(), "opened state file");
                return Ok((candidate.path.clone(), Some(file)));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound && settings.readonly => {
                debug!(path = %candidate.path.display(), "no state file, read-only run");
                return Ok((candidate.path.clone(), None));
            }
            Err(source) => {
                warn!(path = %candidate.path.display(), %source, "unable to open state file");
                last_error = Some(StateError::Open {
                    path: candidate.path.clone(),
                    source,
                });
            }
        }
    }

    Err(match (candidates.len(), last_error) {
        (1, Some(err)) => err,
        _ => StateError::NoCandidate,
    })
}

/// Atomically replace `path` with the content produced by `fill`.
///
/// Content goes into a sibling temporary file which is renamed over the canonical location of
/// `path` only once `fill` succeeded. On any failure the temporary file is removed and `path`
/// keeps its previous content. Returns the handle of the new file.
pub fn replace_file(
    path: &Path,
    fill: impl FnOnce(&mut File) -> io::Result<()>,
) -> Result<File, StateError> {
    let canonical = fs::canonicalize(path).map_err(|source| StateError::Replace {
        path: path.to_path_buf(),
        source,
    })?;
    let mut temporary = canonical.clone().into_os_string();
    temporary.push(format!(".{}", std::process::id()));
    let temporary = PathBuf::from(temporary);
    trace!(path = %temporary.display(), "creating temporary state file");

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(STATE_FILE_MODE)
        .custom_flags(libc::O_NOFOLLOW)
        .open(&temporary)
        .map_err(|source| StateError::Replace {
            path: temporary.clone(),
            source,
        })?;

    let result = fill(&mut file)
        .and_then(|_| file.sync_all())
        .and_then(|_| file.seek(SeekFrom::Start(0)).map(drop))
        .and_then(|_| fs::rename(&temporary, &canonical));
    if let Err(source) = result {
        let _ = fs::remove_file(&temporary);
        return Err(StateError::Replace {
            path: canonical,
            source,
        });
    }

    Ok(file)
}
