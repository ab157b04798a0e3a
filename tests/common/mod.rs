//! Shared fixtures for integration tests
#![allow(dead_code)]

use guestroot::config::loader::EnterConfig;
use guestroot::config::types::{ChrootEnvironment, Result};
use guestroot::kernel::mount::{MountBackend, MountRequest};
use nix::mount::MsFlags;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;

/// Mount table kept in memory; answers mount-point queries from its own state
#[derive(Default)]
pub struct FakeMounts {
    pub mounted: Mutex<Vec<PathBuf>>,
    pub calls: Mutex<Vec<MountRequest>>,
    pub detached: Mutex<Vec<PathBuf>>,
}

impl MountBackend for FakeMounts {
    fn is_mount_point(&self, path: &Path) -> Result<bool> {
        Ok(self.mounted.lock().unwrap().iter().any(|p| p == path))
    }

    fn mount_flags(&self, _path: &Path) -> Result<MsFlags> {
        Ok(MsFlags::MS_NOSUID | MsFlags::MS_NODEV)
    }

    fn mount(&self, request: &MountRequest) -> Result<()> {
        if request.creates_mount() {
            self.mounted.lock().unwrap().push(request.target.clone());
        }
        self.calls.lock().unwrap().push(request.clone());
        Ok(())
    }

    fn detach(&self, path: &Path) -> Result<()> {
        self.mounted.lock().unwrap().retain(|p| p != path);
        self.detached.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}

impl FakeMounts {
    pub fn mount_count(&self) -> usize {
        self.mounted.lock().unwrap().len()
    }

    pub fn detach_count(&self, path: &Path) -> usize {
        self.detached
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.as_path() == path)
            .count()
    }
}

/// Config that keeps sessions away from host files and guest daemons
pub fn quiet_config() -> EnterConfig {
    EnterConfig {
        start_dbus: false,
        run_rc_local: false,
        reconcile_groups: false,
        ..EnterConfig::default()
    }
}

/// Minimal valid guest root
pub fn guest_root() -> (TempDir, ChrootEnvironment) {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("etc")).unwrap();
    let env = ChrootEnvironment {
        name: "sid".to_string(),
        root_path: dir.path().to_path_buf(),
    };
    (dir, env)
}
