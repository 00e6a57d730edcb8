use std::{io, path::PathBuf};

use thiserror::Error;

/// Coarse classification of a failure, used by the binary to pick an exit status.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExitClass {
    Usage,
    Data,
    Os,
}

impl ExitClass {
    /// Numeric exit status following the sysexits convention
    pub fn code(self) -> u8 {
        match self {
            ExitClass::Usage => 64,
            ExitClass::Data => 65,
            ExitClass::Os => 71,
        }
    }
}

/// Possible errors that could happen while working with the state file
#[derive(Error, Debug)]
pub enum StateError {
    #[error("unable to open state file {path}")]
    Open { path: PathBuf, source: io::Error },

    #[error("unable to open any state file")]
    NoCandidate,

    #[error("corrupt state file {path} at byte {offset}")]
    Corrupt { path: PathBuf, offset: usize },

    #[error("data field in {path} has to contain an even number of digits, not {digits}")]
    OddField { path: PathBuf, digits: usize },

    #[error("no complete record within {len} bytes of state file {path}")]
    Truncated { path: PathBuf, len: usize },

    #[error("state record of {wanted} bytes exceeds format limit of {limit}")]
    Oversize { wanted: usize, limit: usize },

    #[error("unable to encode value {value:#x} into a field of {width} bytes")]
    FieldOverflow { value: u64, width: usize },

    #[error("state file {0} needs a rewrite, but was opened read-only")]
    ReadOnlyUpgrade(PathBuf),

    #[error("unable to replace state file {path}")]
    Replace { path: PathBuf, source: io::Error },

    #[error("while working with state file")]
    IO(#[from] io::Error),
}

impl StateError {
    pub fn exit_class(&self) -> ExitClass {
        match self {
            StateError::Corrupt { .. }
            | StateError::OddField { .. }
            | StateError::Truncated { .. }
            | StateError::Oversize { .. }
            | StateError::FieldOverflow { .. } => ExitClass::Data,
            _ => ExitClass::Os,
        }
    }
}

/// Possible errors that could happen during one run
#[derive(Error, Debug)]
pub enum SinceError {
    #[error("need at least one file to display")]
    NoTargets,

    #[error("unable to access {path}")]
    Target { path: PathBuf, source: io::Error },

    #[error("unable to handle special file {0}")]
    SpecialFile(PathBuf),

    #[error("unable to display {path}")]
    Display { path: PathBuf, source: io::Error },

    #[error("unable to refresh status of {path}")]
    Refresh { path: PathBuf, source: io::Error },

    #[error("while waiting for changes")]
    Watch(#[source] io::Error),

    #[error("while working with persistent state storage")]
    State(#[from] StateError),
}

impl SinceError {
    pub fn exit_class(&self) -> ExitClass {
        match self {
            SinceError::NoTargets => ExitClass::Usage,
            SinceError::State(inner) => inner.exit_class(),
            _ => ExitClass::Os,
        }
    }
}
