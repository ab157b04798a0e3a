/// Launch strategies for the guest command
///
/// [`ForegroundExecutor`] runs the command and waits for it. [`BackgroundExecutor`]
/// forks a detached child that owns the caller's stdin and the relocated
/// cleanup trap, then returns to the caller without waiting.
use crate::config::types::{EnterError, Result, SessionOutcome};
use crate::kernel::signal::{self, SignalBlockGuard};
use crate::safety::trap::{TrapGuard, TrapStack};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{dup2, fork, ForkResult, Pid};
use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::{self, IsTerminal};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

fn to_process_error(prefix: &str, err: impl std::fmt::Display) -> EnterError {
    EnterError::Process(format!("{prefix}: {err}"))
}

/// A fully resolved command ready to run under the guest root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestCommand {
    /// Guest root to chroot into; `None` runs on the host filesystem
    pub root: Option<PathBuf>,
    pub argv: Vec<String>,
    /// Complete environment; nothing else is inherited
    pub env: BTreeMap<String, String>,
}

impl GuestCommand {
    pub fn new(root: Option<PathBuf>, argv: Vec<String>) -> Result<Self> {
        if argv.is_empty() {
            return Err(EnterError::Usage("empty command".to_string()));
        }
        Ok(Self {
            root,
            argv,
            env: BTreeMap::new(),
        })
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    /// Build the std command: argv vector, cleared environment, chroot before exec
    pub fn to_command(&self) -> Result<Command> {
        let mut cmd = Command::new(self.program());
        cmd.args(&self.argv[1..]).env_clear().envs(&self.env);

        if let Some(root) = &self.root {
            // Allocate before fork; the pre-exec hook must not allocate
            let root_c = CString::new(root.as_os_str().as_bytes())
                .map_err(|_| EnterError::Precondition(format!("Invalid root path: {}", root.display())))?;
            // SAFETY: the hook only calls chroot(2) and chdir(2), both async-signal-safe,
            // on memory allocated before fork.
            unsafe {
                cmd.pre_exec(move || {
                    if libc::chroot(root_c.as_ptr()) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::chdir(b"/\0".as_ptr() as *const libc::c_char) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        Ok(cmd)
    }
}

/// Runs a guest command under the mount-isolated root
pub trait Launcher {
    /// `trap` is the session's cleanup stack; a launcher that hands the session
    /// to another process must relocate it.
    fn launch(&self, command: &GuestCommand, trap: &mut TrapStack) -> Result<SessionOutcome>;
}

/// Run and wait; the caller's trap guard fires afterwards
#[derive(Debug, Default, Clone, Copy)]
pub struct ForegroundExecutor;

impl ForegroundExecutor {
    /// Reap an already spawned guest, forwarding terminating signals to it
    pub fn wait(&self, pid: Pid) -> Result<SessionOutcome> {
        let mut forwarded: Option<i32> = None;
        // A signal may have landed after the last check but before waitpid
        forward_pending(pid, &mut forwarded);

        loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    return match forwarded {
                        Some(sig) => Err(EnterError::Interrupted(sig)),
                        None => Ok(SessionOutcome::Exited(code)),
                    };
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    return match forwarded {
                        Some(sig) => Err(EnterError::Interrupted(sig)),
                        None => Ok(SessionOutcome::Exited(128 + sig as i32)),
                    };
                }
                Ok(_) => continue,
                Err(nix::errno::Errno::EINTR) => forward_pending(pid, &mut forwarded),
                Err(e) => return Err(to_process_error("waitpid", e)),
            }
        }
    }
}

/// Pass a recorded terminating signal on to the guest, once
fn forward_pending(pid: Pid, forwarded: &mut Option<i32>) {
    // The terminal already delivered SIGINT to the guest's process group
    if signal::take(Signal::SIGINT) || forwarded.is_some() {
        return;
    }
    let Some(sig) = signal::pending_signal() else {
        return;
    };

    log::info!("Forwarding signal {} to guest pid {}", sig, pid);
    match Signal::try_from(sig) {
        Ok(s) => {
            if let Err(e) = kill(pid, s) {
                log::warn!("Failed to forward {} to pid {}: {}", s, pid, e);
            }
        }
        Err(e) => log::warn!("Cannot forward unknown signal {}: {}", sig, e),
    }
    *forwarded = Some(sig);
}

impl Launcher for ForegroundExecutor {
    fn launch(&self, command: &GuestCommand, _trap: &mut TrapStack) -> Result<SessionOutcome> {
        signal::check_interrupted()?;
        log::debug!("Launching {:?}", command.argv);

        let child = command
            .to_command()?
            .spawn()
            .map_err(|e| to_process_error(&format!("Failed to launch {}", command.program()), e))?;

        self.wait(Pid::from_raw(child.id() as i32))
    }
}

/// Fork a detached child that runs the command and owns cleanup
pub struct BackgroundExecutor {
    stdin: OwnedFd,
}

impl BackgroundExecutor {
    /// Keep a handle on the caller's stdin for the detached child
    pub fn capture_stdin() -> Result<Self> {
        let stdin = io::stdin()
            .as_fd()
            .try_clone_to_owned()
            .map_err(|e| to_process_error("Failed to duplicate stdin", e))?;
        Ok(Self::from_fd(stdin))
    }

    pub fn from_fd(stdin: OwnedFd) -> Self {
        Self { stdin }
    }

    /// Runs in the forked child; never returns
    fn run_child(&self, command: &GuestCommand, trap: &mut TrapStack, blocked: SignalBlockGuard) -> ! {
        // Interactive signals belong to the caller's terminal, not to the detached job
        let _ = signal::ignore_interactive();
        signal::clear();
        drop(blocked);

        let mut guard = TrapGuard::new(trap.relocate());
        let code = match self.redirect_stdio() {
            Ok(()) => match ForegroundExecutor.launch(command, guard.stack_mut()) {
                Ok(outcome) => outcome.exit_code(),
                Err(e) => {
                    log::error!("Detached session failed: {}", e);
                    e.exit_code()
                }
            },
            Err(e) => {
                log::error!("Detached session could not set up stdio: {}", e);
                e.exit_code()
            }
        };

        guard.fire();
        // SAFETY: terminates the forked child without unwinding into the caller's frames.
        unsafe { libc::_exit(code) }
    }

    fn redirect_stdio(&self) -> Result<()> {
        dup2(self.stdin.as_raw_fd(), libc::STDIN_FILENO)
            .map_err(|e| to_process_error("Failed to restore stdin", e))?;

        if io::stdout().is_terminal() {
            let null = OpenOptions::new()
                .write(true)
                .open("/dev/null")
                .map_err(|e| to_process_error("Failed to open /dev/null", e))?;
            dup2(null.as_raw_fd(), libc::STDOUT_FILENO)
                .map_err(|e| to_process_error("Failed to redirect stdout", e))?;
        }
        if io::stderr().is_terminal() {
            dup2(libc::STDOUT_FILENO, libc::STDERR_FILENO)
                .map_err(|e| to_process_error("Failed to redirect stderr", e))?;
        }
        Ok(())
    }
}

impl Launcher for BackgroundExecutor {
    fn launch(&self, command: &GuestCommand, trap: &mut TrapStack) -> Result<SessionOutcome> {
        signal::check_interrupted()?;

        // No signal may land between fork and the child's handler reset
        let blocked = SignalBlockGuard::block()?;

        // SAFETY: the session is single-threaded at this point; the child only
        // resets signal state and file descriptors before spawning.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => self.run_child(command, trap, blocked),
            Ok(ForkResult::Parent { child }) => {
                drop(blocked);
                // Cleanup now happens exactly once, in the child
                drop(trap.relocate());
                log::info!("Detached guest session as pid {}", child);
                Ok(SessionOutcome::Detached {
                    pid: child.as_raw(),
                })
            }
            Err(e) => Err(to_process_error("fork", e)),
        }
    }
}
