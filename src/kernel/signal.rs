use crate::config::types::{EnterError, Result};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
/// Async-safe signal handling for guestroot
///
/// The handler only records the signal number. Cleanup never runs in signal
/// context: the session checks the flag between steps and after every wait,
/// turns it into `EnterError::Interrupted`, and the trap guard fires on the
/// way out.
use std::sync::atomic::{AtomicI32, Ordering};

/// Last terminating signal received (0 if none)
static SIGNAL_RECEIVED: AtomicI32 = AtomicI32::new(0);

/// Signals that end a foreground session
pub const TERMINATING_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

/// Async-safe signal handler: one atomic store, nothing else
extern "C" fn record_signal(signal: libc::c_int) {
    SIGNAL_RECEIVED.store(signal, Ordering::SeqCst);
}

/// Install the recording handler for SIGINT, SIGTERM and SIGHUP.
///
/// SA_RESTART is deliberately not set so a blocking waitpid returns EINTR
/// and the session notices the signal.
pub fn install_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(record_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );

    for sig in TERMINATING_SIGNALS {
        // SAFETY: record_signal only performs an atomic store.
        unsafe { signal::sigaction(sig, &action) }.map_err(|e| {
            EnterError::Process(format!("Failed to install {} handler: {}", sig, e))
        })?;
    }

    log::debug!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
    Ok(())
}

/// Ignore terminal interrupt and hangup; inherited across exec by the guest command
pub fn ignore_interactive() -> Result<()> {
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    for sig in [Signal::SIGINT, Signal::SIGHUP] {
        // SAFETY: SIG_IGN installs no code.
        unsafe { signal::sigaction(sig, &ignore) }
            .map_err(|e| EnterError::Process(format!("Failed to ignore {}: {}", sig, e)))?;
    }
    Ok(())
}

/// Signal received since the last [`clear`], if any
pub fn pending_signal() -> Option<i32> {
    match SIGNAL_RECEIVED.load(Ordering::SeqCst) {
        0 => None,
        sig => Some(sig),
    }
}

/// Fail with `Interrupted` if a terminating signal has arrived
pub fn check_interrupted() -> Result<()> {
    match pending_signal() {
        Some(sig) => Err(EnterError::Interrupted(sig)),
        None => Ok(()),
    }
}

/// Forget any recorded signal (a forked child starts clean)
pub fn clear() {
    SIGNAL_RECEIVED.store(0, Ordering::SeqCst);
}

/// Consume a pending `sig`, leaving any other recorded signal in place
pub fn take(sig: Signal) -> bool {
    SIGNAL_RECEIVED
        .compare_exchange(sig as i32, 0, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

/// Blocks terminating signals for a critical section; unblocks on drop
pub struct SignalBlockGuard {
    previous: SigSet,
}

impl SignalBlockGuard {
    pub fn block() -> Result<Self> {
        let mut mask = SigSet::empty();
        for sig in TERMINATING_SIGNALS {
            mask.add(sig);
        }

        let mut previous = SigSet::empty();
        signal::sigprocmask(signal::SigmaskHow::SIG_BLOCK, Some(&mask), Some(&mut previous))
            .map_err(|e| EnterError::Process(format!("Failed to block signals: {}", e)))?;

        Ok(Self { previous })
    }
}

impl Drop for SignalBlockGuard {
    fn drop(&mut self) {
        let _ = signal::sigprocmask(signal::SigmaskHow::SIG_SETMASK, Some(&self.previous), None);
    }
}
