//! Follow mode: waiting for tracked files to change.
//!
//! Two interchangeable strategies implement `Notifier`: a timer that reports every file after a
//! delay, and filesystem event notification through `notify` that reports only the files that
//! saw modify, delete or rename events. The strategy is picked once by `select_notifier`,
//! falling back to polling when notification cannot be set up.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::mpsc::{channel, Receiver, RecvTimeoutError},
    thread,
    time::{Duration, Instant},
};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, trace, warn};

use crate::{
    data_file::DataFile,
    display::Flow,
    error::SinceError,
    signals::{without_signals, Shutdown},
};

/// Longest uninterrupted sleep while waiting, bounds the reaction time to termination requests
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Which strategy follow mode should use
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum WatchMode {
    /// event notification where available, polling otherwise
    #[default]
    Auto,
    Poll,
}

/// Outcome of one wait
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Wakeup {
    /// every file may have changed
    All,
    /// only the files at these indices reported changes
    Files(Vec<usize>),
    Interrupted,
}

/// Source of change notifications for a set of files
pub trait Notifier {
    /// Register interest in the file at `index` of the tracked list
    fn subscribe(&mut self, index: usize, path: &Path) -> io::Result<()>;

    /// Block until something may have changed or termination is requested
    fn wait(&mut self, shutdown: &Shutdown) -> io::Result<Wakeup>;
}

/// Sleeps for a fixed delay, then reports every file
#[derive(Debug)]
pub struct PollNotifier {
    delay: Duration,
}

impl PollNotifier {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Notifier for PollNotifier {
    fn subscribe(&mut self, _index: usize, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn wait(&mut self, shutdown: &Shutdown) -> io::Result<Wakeup> {
        let deadline = Instant::now() + self.delay;
        loop {
            if shutdown.requested() {
                return Ok(Wakeup::Interrupted);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(Wakeup::All);
            }
            thread::sleep(left.min(WAIT_SLICE));
        }
    }
}

/// Reports files for which the operating system delivered change events
pub struct EventNotifier {
    watcher: RecommendedWatcher,
    events: Receiver<notify::Result<Event>>,
    subscribed: HashMap<PathBuf, Vec<usize>>,
}

impl EventNotifier {
    pub fn new() -> notify::Result<Self> {
        let (tx, events) = channel();
        // the watcher thread must not swallow termination signals meant to interrupt output
        let watcher = without_signals(|| notify::recommended_watcher(tx))??;
        Ok(Self {
            watcher,
            events,
            subscribed: HashMap::new(),
        })
    }

    fn indices(&self, event: &Event) -> Option<Vec<usize>> {
        let mut indices = vec![];
        for path in &event.paths {
            indices.extend(self.subscribed.get(path)?.iter().copied());
        }
        Some(indices)
    }
}

fn relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any | EventKind::Other
    )
}

/// Events name files by absolute path, relative targets are resolved the same way
fn watch_key(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

impl Notifier for EventNotifier {
    fn subscribe(&mut self, index: usize, path: &Path) -> io::Result<()> {
        let key = watch_key(path)?;
        if !self.subscribed.contains_key(&key) {
            self.watcher
                .watch(&key, RecursiveMode::NonRecursive)
                .map_err(io::Error::other)?;
        }
        self.subscribed.entry(key).or_default().push(index);
        Ok(())
    }

    fn wait(&mut self, shutdown: &Shutdown) -> io::Result<Wakeup> {
        loop {
            if shutdown.requested() {
                return Ok(Wakeup::Interrupted);
            }
            let event = match self.events.recv_timeout(WAIT_SLICE) {
                Ok(Ok(event)) => event,
                Ok(Err(err)) => {
                    debug!(%err, "change notification failed");
                    return Ok(Wakeup::Files(vec![]));
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "change notification channel closed",
                    ))
                }
            };
            if !relevant(&event.kind) {
                trace!(kind = ?event.kind, "ignoring event");
                continue;
            }

            let mut wakeup = self.indices(&event);
            // coalesce whatever else is already queued
            while let Ok(Ok(event)) = self.events.try_recv() {
                if !relevant(&event.kind) {
                    continue;
                }
                match (wakeup.as_mut(), self.indices(&event)) {
                    (Some(indices), Some(more)) => indices.extend(more),
                    _ => wakeup = None,
                }
            }

            return Ok(match wakeup {
                Some(mut indices) => {
                    indices.sort_unstable();
                    indices.dedup();
                    Wakeup::Files(indices)
                }
                None => Wakeup::All,
            });
        }
    }
}

/// Pick the notification strategy for `files`, probing event notification at runtime
pub fn select_notifier(
    mode: WatchMode,
    delay: Duration,
    files: &[DataFile],
) -> Box<dyn Notifier> {
    if mode == WatchMode::Poll {
        debug!(?delay, "polling for changes");
        return Box::new(PollNotifier::new(delay));
    }

    let mut notifier = match EventNotifier::new() {
        Ok(notifier) => notifier,
        Err(err) => {
            debug!(%err, "change notification unavailable, polling instead");
            return Box::new(PollNotifier::new(delay));
        }
    };
    for (index, file) in files.iter().enumerate() {
        if let Err(err) = notifier.subscribe(index, file.name()) {
            warn!(
                file = %file.name().display(),
                %err,
                "unable to register change notification, polling instead"
            );
            return Box::new(PollNotifier::new(delay));
        }
    }
    debug!("waiting for change notifications");
    Box::new(notifier)
}

/// Drives one follow-mode step: wait, then refresh the status of affected files
pub struct WatchEngine {
    notifier: Box<dyn Notifier>,
}

impl WatchEngine {
    pub fn new(notifier: Box<dyn Notifier>) -> Self {
        Self { notifier }
    }

    pub fn wait_and_refresh(
        &mut self,
        files: &mut [DataFile],
        shutdown: &Shutdown,
    ) -> Result<Flow, SinceError> {
        let wakeup = self.notifier.wait(shutdown).map_err(SinceError::Watch)?;

        match wakeup {
            Wakeup::Interrupted => return Ok(Flow::Interrupted),
            Wakeup::All => {
                for file in files.iter_mut() {
                    file.refresh()?;
                }
            }
            Wakeup::Files(indices) => {
                for index in indices {
                    if let Some(file) = files.get_mut(index) {
                        file.refresh()?;
                    }
                }
            }
        }
        Ok(Flow::Continue)
    }
}
