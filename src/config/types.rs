/// Core types and structures for guestroot
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A single declarative mount point in the guest view.
///
/// `target` is always interpreted relative to the chroot root, even when it is
/// written as an absolute path. Applying the same spec twice is a no-op; the
/// check is made against the resolved target, never against the spec itself.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountSpec {
    /// Host path (bind) or filesystem source name (tmpfs)
    pub source: PathBuf,
    /// Guest path the mount lands on
    pub target: PathBuf,
    /// Mount kind
    #[serde(default)]
    pub kind: MountKind,
    /// Options applied with the initial mount (propagation, rbind, fs data)
    #[serde(default)]
    pub options: BTreeSet<String>,
    /// Options applied with a follow-up remount (e.g. `ro`, `exec`)
    #[serde(default)]
    pub remount_options: Option<BTreeSet<String>>,
    /// Skip silently if the host source does not exist
    #[serde(default)]
    pub optional: bool,
}

/// Kind of mount a spec describes
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    #[default]
    Bind,
    Tmpfs,
}

impl MountSpec {
    /// Bind `source` onto the same path inside the guest
    pub fn bind_same(path: &str) -> Self {
        Self::bind(path, path)
    }

    /// Bind a host path onto a guest path
    pub fn bind(source: &str, target: &str) -> Self {
        Self {
            source: PathBuf::from(source),
            target: PathBuf::from(target),
            kind: MountKind::Bind,
            options: BTreeSet::new(),
            remount_options: None,
            optional: false,
        }
    }

    /// Fresh tmpfs at a guest path
    pub fn tmpfs(target: &str, options: &[&str]) -> Self {
        Self {
            source: PathBuf::from("tmpfs"),
            target: PathBuf::from(target),
            kind: MountKind::Tmpfs,
            options: options.iter().map(|o| o.to_string()).collect(),
            remount_options: None,
            optional: false,
        }
    }

    pub fn with_options(mut self, options: &[&str]) -> Self {
        self.options.extend(options.iter().map(|o| o.to_string()));
        self
    }

    pub fn with_remount(mut self, options: &[&str]) -> Self {
        self.remount_options = Some(options.iter().map(|o| o.to_string()).collect());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// A named guest root prepared by the mount-resolution helper
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChrootEnvironment {
    pub name: String,
    /// Absolute host path to the guest root. Fixed for the whole session.
    pub root_path: PathBuf,
}

/// Execution mode of a session. Exactly one per session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMode {
    /// Scrubbed environment, privilege switch through `su`, login semantics
    InteractiveLogin,
    /// Scrubbed environment, command runs as root with no login shell
    DirectExec,
    /// Like `DirectExec` with the fixed setup script and re-run handling
    SetupScript,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::InteractiveLogin => write!(f, "login"),
            SessionMode::DirectExec => write!(f, "exec"),
            SessionMode::SetupScript => write!(f, "setup"),
        }
    }
}

/// Target user of a login session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserSpec {
    Name(String),
    Uid(u32),
}

impl UserSpec {
    /// Numeric strings are uids, everything else is a user name
    pub fn parse(raw: &str) -> Self {
        match raw.parse::<u32>() {
            Ok(uid) => UserSpec::Uid(uid),
            Err(_) => UserSpec::Name(raw.to_string()),
        }
    }
}

impl fmt::Display for UserSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserSpec::Name(name) => write!(f, "{}", name),
            UserSpec::Uid(uid) => write!(f, "uid {}", uid),
        }
    }
}

/// Caller intent for one session. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionRequest {
    pub mode: SessionMode,
    /// `None` selects the guest's default user
    pub user: Option<UserSpec>,
    pub command: Vec<String>,
    pub background: bool,
}

impl SessionRequest {
    pub fn login(user: Option<UserSpec>, command: Vec<String>) -> Self {
        Self {
            mode: SessionMode::InteractiveLogin,
            user,
            command,
            background: false,
        }
    }

    pub fn exec(command: Vec<String>) -> Self {
        Self {
            mode: SessionMode::DirectExec,
            user: None,
            command,
            background: false,
        }
    }

    pub fn setup() -> Self {
        Self {
            mode: SessionMode::SetupScript,
            user: None,
            command: Vec::new(),
            background: false,
        }
    }

    pub fn in_background(mut self) -> Self {
        self.background = true;
        self
    }
}

/// What a finished session reports back to the caller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Guest command ran in the foreground and exited with this code
    Exited(i32),
    /// Guest command was handed to a detached child
    Detached { pid: i32 },
}

impl SessionOutcome {
    /// Process exit code the caller should report
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionOutcome::Exited(code) => *code,
            SessionOutcome::Detached { .. } => 0,
        }
    }
}

/// Errors raised by guestroot
#[derive(Error, Debug)]
pub enum EnterError {
    /// Bad arguments or incompatible flags; nothing has been mutated yet
    #[error("usage error: {0}")]
    Usage(String),

    /// Missing privilege, chroot not found, or invalid chroot
    #[error("{0}")]
    Precondition(String),

    /// Path could not be resolved inside the chroot root
    #[error("path resolution error: {0}")]
    Resolution(String),

    /// A bind or tmpfs mount failed
    #[error("mount error: {0}")]
    Mount(String),

    /// The setup script failed
    #[error("setup script error: {0}")]
    SetupScript(String),

    /// Launching or waiting for the guest command failed
    #[error("process error: {0}")]
    Process(String),

    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(String),

    /// A terminating signal arrived while the session was being prepared or run
    #[error("interrupted by signal {0}")]
    Interrupted(i32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EnterError {
    /// Distinct process exit codes per error category
    pub fn exit_code(&self) -> i32 {
        match self {
            EnterError::Usage(_) => 2,
            EnterError::Precondition(_) => 3,
            EnterError::Mount(_) => 4,
            EnterError::SetupScript(_) => 5,
            EnterError::Interrupted(sig) => 128 + sig,
            _ => 1,
        }
    }
}

impl From<nix::errno::Errno> for EnterError {
    fn from(err: nix::errno::Errno) -> Self {
        EnterError::Io(std::io::Error::from(err))
    }
}

/// Result type alias for guestroot operations
pub type Result<T> = std::result::Result<T, EnterError>;
