//! A terminating signal unwinds the session through its cleanup trap.
//!
//! Kept in its own test binary: the recorded signal is process-wide.

mod common;

use common::{guest_root, quiet_config, FakeMounts};
use guestroot::config::types::{EnterError, Result, SessionOutcome, SessionRequest};
use guestroot::core::session::Session;
use guestroot::exec::launcher::{ForegroundExecutor, GuestCommand, Launcher};
use guestroot::kernel::signal;
use guestroot::safety::trap::{TrapGuard, TrapStack};
use nix::sys::signal::{raise, Signal};
use nix::unistd::Pid;
use std::fs;
use std::process::Command;
use std::time::{Duration, Instant};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Receives SIGTERM while the guest command "runs"
struct TerminatedLauncher;

impl Launcher for TerminatedLauncher {
    fn launch(&self, _: &GuestCommand, _: &mut TrapStack) -> Result<SessionOutcome> {
        raise(Signal::SIGTERM).map_err(EnterError::from)?;
        signal::check_interrupted()?;
        Ok(SessionOutcome::Exited(0))
    }
}

#[test]
fn test_sigterm_fires_traps_exactly_once() {
    signal::install_handlers().unwrap();

    // Plain trap stack: N actions, one signal
    let counters: Vec<Arc<AtomicUsize>> = (0..4).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    let interrupted = {
        let mut guard = TrapGuard::new(TrapStack::new());
        for counter in &counters {
            let counter = Arc::clone(counter);
            guard.stack_mut().register("count", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        raise(Signal::SIGTERM).unwrap();
        assert_eq!(signal::pending_signal(), Some(Signal::SIGTERM as i32));
        signal::check_interrupted()
    };
    assert!(matches!(interrupted, Err(EnterError::Interrupted(15))));
    for counter in &counters {
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
    signal::clear();

    // Signal between preparation steps: nothing further is mounted, marker removed
    let (dir, env) = guest_root();
    fs::create_dir_all(dir.path().join("etc/guestroot")).unwrap();
    fs::write(dir.path().join("etc/guestroot/name"), "stale\n").unwrap();
    let backend = Arc::new(FakeMounts::default());
    let armed = Session::with_backend(quiet_config(), env, backend.clone())
        .unwrap()
        .arm_traps()
        .unwrap();
    raise(Signal::SIGTERM).unwrap();
    let result = armed.prepare();
    assert!(matches!(result, Err(EnterError::Interrupted(15))));
    assert!(backend.calls.lock().unwrap().is_empty());
    assert!(!dir.path().join("etc/guestroot/name").exists());
    signal::clear();

    // Signal while the guest runs: every mount detached exactly once
    let (_dir, env) = guest_root();
    let backend = Arc::new(FakeMounts::default());
    let prepared = Session::with_backend(quiet_config(), env, backend.clone())
        .unwrap()
        .arm_traps()
        .unwrap()
        .prepare()
        .unwrap();
    let mounted = prepared.operator().ledger().lock().unwrap().count();

    let request = SessionRequest::exec(vec!["/bin/true".to_string()]);
    let result = prepared.launch(&request, Box::new(TerminatedLauncher));
    assert_eq!(result.unwrap_err().exit_code(), 128 + 15);

    let detached = backend.detached.lock().unwrap().clone();
    assert_eq!(detached.len(), mounted);
    for path in &detached {
        assert_eq!(backend.detach_count(path), 1);
    }
    signal::clear();

    // Signal recorded after spawn but before the first wait still reaches the guest
    let child = Command::new("sleep").arg("5").spawn().unwrap();
    raise(Signal::SIGTERM).unwrap();
    let started = Instant::now();
    let result = ForegroundExecutor.wait(Pid::from_raw(child.id() as i32));
    assert!(matches!(result, Err(EnterError::Interrupted(15))));
    assert!(started.elapsed() < Duration::from_secs(4));
    signal::clear();
}
