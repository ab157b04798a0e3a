//! Best-effort guest services and the active-name marker.
//!
//! Service failures never abort a session; they are logged as warnings.

use crate::config::types::{EnterError, Result, SessionOutcome};
use crate::exec::launcher::{GuestCommand, Launcher};
use crate::exec::session::find_in_guest;
use crate::kernel::mount::resolve;
use crate::safety::trap::TrapStack;
use crate::utils::env_hygiene::EnvHygiene;
use log::{debug, info, warn};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Guest path of the system bus pid file
const DBUS_PID_FILE: &str = "/var/run/dbus/pid";
const RC_LOCAL: &str = "/etc/rc.local";

/// Write `<name>\n` to the marker file inside the guest
pub fn write_marker(root: &Path, marker_file: &Path, name: &str) -> Result<()> {
    let path = resolve::resolve_host(root, marker_file)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, format!("{}\n", name))?;
    debug!("Wrote marker {}", path.display());
    Ok(())
}

/// Starts guest-side daemons through a launcher
pub struct GuestServices<'a> {
    root: &'a Path,
    launcher: &'a dyn Launcher,
    hygiene: EnvHygiene,
}

impl<'a> GuestServices<'a> {
    pub fn new(root: &'a Path, launcher: &'a dyn Launcher) -> Self {
        Self {
            root,
            launcher,
            hygiene: EnvHygiene::default(),
        }
    }

    fn run(&self, argv: Vec<String>) -> Result<()> {
        let command = GuestCommand::new(Some(self.root.to_path_buf()), argv)?
            .with_env(self.hygiene.sanitize_environment());
        // Service runs own no cleanup; a scratch stack keeps them away from the session's
        let mut scratch = TrapStack::new();
        match self.launcher.launch(&command, &mut scratch)? {
            SessionOutcome::Exited(0) | SessionOutcome::Detached { .. } => Ok(()),
            SessionOutcome::Exited(code) => Err(EnterError::Process(format!(
                "{} exited with {}",
                command.program(),
                code
            ))),
        }
    }

    /// Whether the guest's system bus already runs (pid file names a live process)
    pub fn dbus_running(&self) -> bool {
        let Ok(pid_file) = resolve::resolve_host(self.root, Path::new(DBUS_PID_FILE)) else {
            return false;
        };
        fs::read_to_string(pid_file)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .map(|pid| PathBuf::from(format!("/proc/{}", pid)).exists())
            .unwrap_or(false)
    }

    /// Start the guest's system D-Bus daemon when it has one. Returns whether one was started.
    pub fn start_dbus(&self) -> bool {
        let daemon = match find_in_guest(self.root, "dbus-daemon") {
            Ok(Some(path)) => path,
            Ok(None) => {
                debug!("No dbus-daemon in chroot");
                return false;
            }
            Err(e) => {
                warn!("Could not look for dbus-daemon: {}", e);
                return false;
            }
        };
        if self.dbus_running() {
            debug!("Guest system bus already running");
            return false;
        }

        if let Ok(dir) = resolve::resolve_host(self.root, Path::new("/var/run/dbus")) {
            let _ = fs::create_dir_all(dir);
        }

        let argv = vec![
            daemon.to_string_lossy().into_owned(),
            "--system".to_string(),
            "--fork".to_string(),
        ];
        match self.run(argv) {
            Ok(()) => {
                info!("Started guest system D-Bus");
                true
            }
            Err(e) => {
                warn!("Failed to start guest D-Bus: {}", e);
                false
            }
        }
    }

    /// Run the guest's /etc/rc.local when it is executable. Returns whether it ran cleanly.
    pub fn run_rc_local(&self) -> bool {
        let executable = resolve::resolve_host(self.root, Path::new(RC_LOCAL))
            .ok()
            .and_then(|p| fs::metadata(p).ok())
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false);
        if !executable {
            return false;
        }

        match self.run(vec![RC_LOCAL.to_string()]) {
            Ok(()) => true,
            Err(e) => {
                warn!("{} failed: {}", RC_LOCAL, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct ScriptedLauncher {
        code: i32,
        seen: Mutex<Vec<Vec<String>>>,
    }

    impl Launcher for ScriptedLauncher {
        fn launch(&self, command: &GuestCommand, _: &mut TrapStack) -> Result<SessionOutcome> {
            self.seen.lock().unwrap().push(command.argv.clone());
            Ok(SessionOutcome::Exited(self.code))
        }
    }

    fn launcher(code: i32) -> ScriptedLauncher {
        ScriptedLauncher {
            code,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn executable(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_marker_written_through_guest_paths() {
        let root = TempDir::new().unwrap();
        write_marker(root.path(), Path::new("/etc/guestroot/name"), "sid").unwrap();
        let content = fs::read_to_string(root.path().join("etc/guestroot/name")).unwrap();
        assert_eq!(content, "sid\n");
    }

    #[test]
    fn test_dbus_started_when_present() {
        let root = TempDir::new().unwrap();
        executable(&root.path().join("usr/bin/dbus-daemon"));
        let l = launcher(0);

        assert!(GuestServices::new(root.path(), &l).start_dbus());
        assert_eq!(
            l.seen.lock().unwrap()[0],
            vec!["/usr/bin/dbus-daemon", "--system", "--fork"]
        );
        assert!(root.path().join("var/run/dbus").is_dir());
    }

    #[test]
    fn test_missing_services_are_skipped() {
        let root = TempDir::new().unwrap();
        let l = launcher(0);
        let services = GuestServices::new(root.path(), &l);

        assert!(!services.start_dbus());
        assert!(!services.run_rc_local());
        assert!(l.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failing_rc_local_is_not_fatal() {
        let root = TempDir::new().unwrap();
        executable(&root.path().join("etc/rc.local"));
        let l = launcher(1);

        assert!(!GuestServices::new(root.path(), &l).run_rc_local());
        assert_eq!(l.seen.lock().unwrap().len(), 1);
    }
}
