/// Unmount-everything cleanup action
///
/// Either hands the whole chroot to the external unmount helper, or detaches
/// the mounts this session recorded, newest first. The marker file is removed
/// afterwards in both cases. Safe to run when nothing was mounted.
use crate::config::types::{EnterError, MountKind, Result};
use crate::kernel::mount::{resolve, MountBackend, SharedLedger};
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

/// How the mounts of a session get torn down
pub enum TeardownStrategy {
    /// Run `<helper> -c <chroots_dir> <name>`
    Helper {
        helper: PathBuf,
        chroots_dir: PathBuf,
        name: String,
    },
    /// Lazily detach every ledger entry in reverse creation order
    Ledger {
        ledger: SharedLedger,
        backend: Arc<dyn MountBackend>,
    },
}

/// Everything the unmount action needs, captured at registration time
pub struct Teardown {
    strategy: TeardownStrategy,
    root: PathBuf,
    marker_file: PathBuf,
}

impl Teardown {
    pub fn new(strategy: TeardownStrategy, root: PathBuf, marker_file: PathBuf) -> Self {
        Self {
            strategy,
            root,
            marker_file,
        }
    }

    /// Tear down, continuing past individual failures; the first failure is returned
    pub fn run(self) -> Result<()> {
        let unmounted = match &self.strategy {
            TeardownStrategy::Helper {
                helper,
                chroots_dir,
                name,
            } => run_helper(helper, chroots_dir, name),
            TeardownStrategy::Ledger { ledger, backend } => detach_ledger(ledger, backend.as_ref()),
        };

        let marker = self.remove_marker();
        unmounted.and(marker)
    }

    fn remove_marker(&self) -> Result<()> {
        // resolved so a guest symlink cannot redirect the delete onto the host
        let path = resolve::resolve_host(&self.root, &self.marker_file)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed marker {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn run_helper(helper: &Path, chroots_dir: &Path, name: &str) -> Result<()> {
    info!("Unmounting chroot {} via {}", name, helper.display());
    let status = Command::new(helper)
        .arg("-c")
        .arg(chroots_dir)
        .arg(name)
        .status()
        .map_err(|e| EnterError::Mount(format!("Failed to run {}: {}", helper.display(), e)))?;

    if status.success() {
        Ok(())
    } else {
        Err(EnterError::Mount(format!(
            "Unmount helper {} exited with {}",
            helper.display(),
            status
        )))
    }
}

fn detach_ledger(ledger: &SharedLedger, backend: &dyn MountBackend) -> Result<()> {
    let mut ledger = ledger.lock().unwrap_or_else(|p| p.into_inner());
    let targets: Vec<(PathBuf, MountKind)> = ledger
        .reverse_order()
        .into_iter()
        .map(|r| (r.target.clone(), r.kind))
        .collect();

    if targets.is_empty() {
        debug!("No recorded mounts to detach");
        return Ok(());
    }
    info!("Detaching {} mounts", targets.len());

    let mut first_failure = None;
    for (target, kind) in targets {
        debug!("Detaching {:?} mount at {}", kind, target.display());
        match backend.detach(&target) {
            Ok(()) => ledger.remove(&target),
            Err(e) => {
                warn!("Failed to detach {}: {}", target.display(), e);
                first_failure.get_or_insert(e);
            }
        }
    }

    match first_failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mount::filesystem::tests::RecordingMounts;
    use crate::kernel::mount::MountLedger;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn guest() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("etc/guestroot")).unwrap();
        dir
    }

    #[test]
    fn test_ledger_detached_newest_first() {
        let root = guest();
        let ledger: SharedLedger = Arc::new(Mutex::new(MountLedger::new()));
        {
            let mut l = ledger.lock().unwrap();
            l.record(root.path().join("dev"), MountKind::Bind);
            l.record(root.path().join("var/run"), MountKind::Tmpfs);
        }
        let backend = Arc::new(RecordingMounts::default());

        let teardown = Teardown::new(
            TeardownStrategy::Ledger {
                ledger: Arc::clone(&ledger),
                backend: backend.clone(),
            },
            root.path().to_path_buf(),
            PathBuf::from("/etc/guestroot/name"),
        );
        teardown.run().unwrap();

        let detached = backend.detached.lock().unwrap().clone();
        assert_eq!(
            detached,
            vec![root.path().join("var/run"), root.path().join("dev")]
        );
        assert!(ledger.lock().unwrap().is_empty());
    }

    #[test]
    fn test_marker_removed_and_missing_marker_ok() {
        let root = guest();
        let marker = root.path().join("etc/guestroot/name");
        fs::write(&marker, "sid\n").unwrap();

        let make = || {
            Teardown::new(
                TeardownStrategy::Ledger {
                    ledger: Arc::new(Mutex::new(MountLedger::new())),
                    backend: Arc::new(RecordingMounts::default()),
                },
                root.path().to_path_buf(),
                PathBuf::from("/etc/guestroot/name"),
            )
        };

        make().run().unwrap();
        assert!(!marker.exists());
        // Second run finds nothing to do
        make().run().unwrap();
    }

    #[test]
    fn test_failing_helper_reports_mount_error() {
        let root = guest();
        let teardown = Teardown::new(
            TeardownStrategy::Helper {
                helper: PathBuf::from("/bin/false"),
                chroots_dir: PathBuf::from("/nonexistent"),
                name: "sid".to_string(),
            },
            root.path().to_path_buf(),
            PathBuf::from("/etc/guestroot/name"),
        );
        assert!(matches!(teardown.run(), Err(EnterError::Mount(_))));
    }
}
