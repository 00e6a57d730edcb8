use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::{
    config::Options,
    data_file::DataFile,
    display::{Display, Flow},
    error::SinceError,
    identity,
    output::Output,
    signals::Shutdown,
    state_store::{PersistReport, StateStore},
    watch::{select_notifier, WatchEngine},
};

/// What a completed run did
#[derive(Debug)]
pub struct RunReport {
    /// tracked files with their final positions
    pub files: Vec<DataFile>,
    pub persisted: PersistReport,
    /// output was closed or termination was requested before the run finished on its own
    pub interrupted: bool,
}

/// Display everything appended to `targets` since the previous run and remember how far
/// display got.
///
/// The state file is loaded once, every target is bound to its record, the unread content is
/// displayed (or discarded), follow mode keeps displaying until interrupted, and the final
/// positions are persisted in one go. An interruption is a normal end of the run. A failure
/// leaves the state file as it was.
pub fn run<O: Output>(
    options: &Options,
    targets: &[PathBuf],
    output: &mut O,
    shutdown: &Shutdown,
) -> Result<RunReport, SinceError> {
    if targets.is_empty() {
        return Err(SinceError::NoTargets);
    }
    let mut files = open_targets(options, targets)?;

    let store = StateStore::open(&options.state_candidates(), options.store_settings())?;
    identity::lookup(&store, &mut files)?;

    let mut display = Display::new(output, shutdown, options.verbosity, options.use_mmap);
    let mut flow = if options.discard {
        display.discard_files(&mut files)?
    } else {
        display.display_files(&mut files)?
    };

    if options.follow && flow == Flow::Continue {
        let mut engine = WatchEngine::new(select_notifier(
            options.watch_mode,
            options.delay,
            &files,
        ));
        while flow == Flow::Continue {
            flow = engine.wait_and_refresh(&mut files, shutdown)?;
            if flow == Flow::Continue {
                flow = display.display_files(&mut files)?;
            }
        }
        debug!("leaving follow mode");
    }

    let persisted = store.persist(&files)?;
    info!(?persisted, "run finished");
    Ok(RunReport {
        files,
        persisted,
        interrupted: flow == Flow::Interrupted,
    })
}

fn open_targets(options: &Options, targets: &[PathBuf]) -> Result<Vec<DataFile>, SinceError> {
    let mut files = Vec::with_capacity(targets.len());
    for path in targets {
        if options.excludes(path) {
            debug!(file = %path.display(), "skipping compressed file");
            continue;
        }
        match DataFile::open(path) {
            Ok(file) => files.push(file),
            Err(err) if options.lax => {
                warn!(file = %path.display(), %err, "ignoring inaccessible file");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(files)
}
