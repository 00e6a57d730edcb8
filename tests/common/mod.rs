#![allow(dead_code)]

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use sincetail::{
    Candidate, Identity, Options, Output, RunReport, Shutdown, SinceError, StateStore,
    StoreSettings,
};
use tempfile::TempDir;

/// Collects displayed data and headers, optionally refusing data after `limit` bytes the way
/// a closed pipe does
#[derive(Default)]
pub struct Capture {
    pub data: Vec<u8>,
    pub headers: Vec<String>,
    pub limit: Option<usize>,
}

impl Output for Capture {
    fn write_data(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut count = buf.len();
        if let Some(limit) = self.limit {
            let left = limit.saturating_sub(self.data.len());
            if left == 0 {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            count = count.min(left);
        }
        self.data.extend_from_slice(&buf[..count]);
        Ok(count)
    }

    fn write_header(&mut self, line: &str) -> io::Result<()> {
        self.headers.push(line.to_string());
        Ok(())
    }
}

/// Temporary directory holding targets and a state file
pub struct Workspace {
    pub dir: TempDir,
    pub state: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state");
        Self { dir, state }
    }

    pub fn options(&self) -> Options {
        Options {
            state_file: Some(self.state.clone()),
            ..Options::default()
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn write(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.path(name);
        fs::write(&path, content).unwrap();
        path
    }

    pub fn append(&self, name: &str, content: &[u8]) {
        fs::OpenOptions::new()
            .append(true)
            .open(self.path(name))
            .unwrap()
            .write_all(content)
            .unwrap();
    }

    pub fn run(
        &self,
        options: &Options,
        targets: &[PathBuf],
    ) -> (Result<RunReport, SinceError>, Capture) {
        self.run_into(options, targets, Capture::default())
    }

    pub fn run_into(
        &self,
        options: &Options,
        targets: &[PathBuf],
        mut capture: Capture,
    ) -> (Result<RunReport, SinceError>, Capture) {
        let result = sincetail::run(options, targets, &mut capture, &Shutdown::new());
        (result, capture)
    }

    /// Decoded content of the state file, in file order
    pub fn records(&self) -> Vec<(Identity, u64)> {
        let settings = StoreSettings {
            readonly: true,
            ..StoreSettings::default()
        };
        let store = StateStore::open(&[Candidate::new(&self.state)], settings).unwrap();
        let format = store.format();
        format
            .records(store.records())
            .map(|(_, record)| format.decode(record).unwrap())
            .collect()
    }

    pub fn state_bytes(&self) -> Vec<u8> {
        fs::read(&self.state).unwrap()
    }
}

pub fn identity(path: &Path) -> Identity {
    Identity::from(&fs::metadata(path).unwrap())
}
