use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use nix::sys::signal::{
    pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};

const TERMINATING: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

/// Raised by the signal handler, shared by every `Shutdown` that listens to signals
static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn raise_flag(_signal: libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

/// Cooperative termination request.
///
/// The signal handler only stores `true`. Long running operations check the flag after each
/// point where they may block and wind down on their own, so state is never written from a
/// half-finished operation.
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
    signals: bool,
}

impl Shutdown {
    /// Flag that is only raised by `request`
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag that is additionally raised by SIGINT and SIGTERM.
    ///
    /// The handlers are installed without `SA_RESTART`, so a signal arriving while a write
    /// blocks makes the write fail with `ErrorKind::Interrupted` instead of resuming it.
    pub fn install() -> io::Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(raise_flag),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for signal in TERMINATING {
            // the handler touches nothing but an atomic
            unsafe { sigaction(signal, &action) }?;
        }
        Ok(Self {
            requested: Arc::default(),
            signals: true,
        })
    }

    pub fn requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
            || (self.signals && SIGNALLED.load(Ordering::SeqCst))
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }
}

/// Run `spawn` with SIGINT and SIGTERM blocked, so threads it starts inherit the mask and the
/// signals keep interrupting the calling thread.
pub fn without_signals<T>(spawn: impl FnOnce() -> T) -> io::Result<T> {
    let mut blocked = SigSet::empty();
    for signal in TERMINATING {
        blocked.add(signal);
    }
    let mut previous = SigSet::empty();
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&blocked), Some(&mut previous))?;
    let result = spawn();
    pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous), None)?;
    Ok(result)
}
