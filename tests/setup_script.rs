//! The setup script re-runs while it exists and succeeds, and stops hard on failure.

mod common;

use common::guest_root;
use guestroot::config::loader::EnterConfig;
use guestroot::config::types::{EnterError, Result, SessionOutcome, SessionRequest};
use guestroot::exec::launcher::{GuestCommand, Launcher};
use guestroot::exec::session::SessionExecutor;
use guestroot::safety::trap::TrapStack;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Stands in for the guest running the script: exits with `codes[pass]` and
/// deletes the script after `remove_after` passes
struct FakeScript {
    script: PathBuf,
    passes: Arc<AtomicUsize>,
    codes: Vec<i32>,
    remove_after: Option<usize>,
}

impl Launcher for FakeScript {
    fn launch(&self, command: &GuestCommand, _: &mut TrapStack) -> Result<SessionOutcome> {
        assert_eq!(command.argv.last().map(String::as_str), Some("/prepare.sh"));
        let pass = self.passes.fetch_add(1, Ordering::SeqCst);
        if Some(pass + 1) == self.remove_after {
            fs::remove_file(&self.script)?;
        }
        Ok(SessionOutcome::Exited(self.codes.get(pass).copied().unwrap_or(0)))
    }
}

fn run(codes: Vec<i32>, remove_after: Option<usize>) -> (Result<SessionOutcome>, usize) {
    let (dir, _env) = guest_root();
    let script = dir.path().join("prepare.sh");
    fs::write(&script, "#!/bin/sh\n").unwrap();

    let passes = Arc::new(AtomicUsize::new(0));
    let launcher = FakeScript {
        script,
        passes: Arc::clone(&passes),
        codes,
        remove_after,
    };
    let executor = SessionExecutor::new(
        dir.path().to_path_buf(),
        &EnterConfig::default(),
        Box::new(launcher),
    );

    let mut trap = TrapStack::new();
    let result = executor.run(&SessionRequest::setup(), &mut trap);
    (result, passes.load(Ordering::SeqCst))
}

#[test]
fn test_reruns_until_script_removes_itself() {
    let (result, passes) = run(vec![0, 0, 0], Some(3));
    assert_eq!(result.unwrap(), SessionOutcome::Exited(0));
    assert_eq!(passes, 3);
}

#[test]
fn test_single_pass_when_script_removes_itself_immediately() {
    let (result, passes) = run(vec![0], Some(1));
    assert_eq!(result.unwrap(), SessionOutcome::Exited(0));
    assert_eq!(passes, 1);
}

#[test]
fn test_failure_is_fatal_and_never_retried() {
    let (result, passes) = run(vec![0, 0, 1, 0, 0], None);
    assert!(matches!(result, Err(EnterError::SetupScript(_))));
    assert_eq!(passes, 3);
}

#[test]
fn test_failure_exit_code_category() {
    let (result, _) = run(vec![2], None);
    assert_eq!(result.unwrap_err().exit_code(), 5);
}
