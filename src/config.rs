use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    output::HeaderTarget,
    record::FieldWidths,
    state_store::{Candidate, StoreSettings},
    watch::WatchMode,
};

/// Environment variable naming the state file
pub const STATE_ENV: &str = "SINCE";

/// State file name inside the home directory
pub const STATE_HOME_NAME: &str = ".since";

/// Last resort location, never followed through a symlink
pub const STATE_FALLBACK: &str = "/tmp/since";

/// Extensions skipped when compressed files are excluded
pub const COMPRESSED_SUFFIXES: [&str; 4] = [".gz", ".bz2", ".Z", ".zip"];

/// Everything that controls a single run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Options {
    /// always replace the state file instead of patching it
    pub atomic: bool,
    /// time between polls in follow mode
    pub delay: Duration,
    pub headers: HeaderTarget,
    pub follow: bool,
    /// warn about inaccessible targets instead of failing
    pub lax: bool,
    pub use_mmap: bool,
    pub readonly: bool,
    pub verbosity: u8,
    /// explicit state file, disables the search through default locations
    pub state_file: Option<PathBuf>,
    pub skip_compressed: bool,
    /// mark everything as seen without displaying it
    pub discard: bool,
    pub watch_mode: WatchMode,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            atomic: false,
            delay: Duration::from_secs(1),
            headers: HeaderTarget::Stdout,
            follow: false,
            lax: false,
            use_mmap: true,
            readonly: false,
            verbosity: 1,
            state_file: None,
            skip_compressed: false,
            discard: false,
            watch_mode: WatchMode::Auto,
        }
    }
}

impl Options {
    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            readonly: self.readonly,
            atomic: self.atomic,
            use_mmap: self.use_mmap,
            arch: FieldWidths::native(),
        }
    }

    /// State file locations to try, in order, using the process environment
    pub fn state_candidates(&self) -> Vec<Candidate> {
        state_candidates(
            self.state_file.as_deref(),
            std::env::var_os(STATE_ENV),
            dirs::home_dir(),
        )
    }

    /// Whether `path` should be left out of the run
    pub fn excludes(&self, path: &Path) -> bool {
        self.skip_compressed && is_compressed(path)
    }
}

/// Resolve the state file locations from an explicit choice, the environment and the home
/// directory.
pub fn state_candidates(
    explicit: Option<&Path>,
    env: Option<OsString>,
    home: Option<PathBuf>,
) -> Vec<Candidate> {
    if let Some(path) = explicit {
        return vec![Candidate::new(path)];
    }

    let mut candidates = vec![];
    if let Some(path) = env.filter(|value| !value.is_empty()) {
        candidates.push(Candidate::new(path));
    }
    if let Some(home) = home {
        candidates.push(Candidate::new(home.join(STATE_HOME_NAME)));
    }
    candidates.push(Candidate::nofollow(STATE_FALLBACK));
    candidates
}

pub fn is_compressed(path: &Path) -> bool {
    let name = path.to_string_lossy();
    match name.rfind('.') {
        Some(dot) => COMPRESSED_SUFFIXES.contains(&&name[dot..]),
        None => false,
    }
}
