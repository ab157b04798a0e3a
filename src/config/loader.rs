/// Configuration loading from config.json and the environment
use crate::config::types::{EnterError, MountSpec, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// System-wide config file consulted when `--config` is not given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/guestroot/config.json";

/// Non-empty value disables the unmount-on-exit action
pub const ENV_NO_UNMOUNT: &str = "GUESTROOT_NO_UNMOUNT";

/// Non-empty value binds /dev/urandom over the guest's /dev/random
pub const ENV_WEAK_RANDOM: &str = "GUESTROOT_WEAK_RANDOM";

/// Terminal type, the only variable that survives environment scrubbing
pub const ENV_TERM: &str = "TERM";

/// Full config.json structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnterConfig {
    /// Directory holding one guest root per chroot name
    pub chroots_dir: PathBuf,
    /// Helper that prepares a chroot and prints its host root path
    pub mount_helper: Option<PathBuf>,
    /// Helper that tears down everything mounted under a chroot
    pub unmount_helper: Option<PathBuf>,
    /// Guest path of the two-phase setup script
    pub setup_script: PathBuf,
    /// Guest path of the single-line active chroot name marker
    pub marker_file: PathBuf,
    /// tmpfs size for /var/run
    pub var_run_size: String,
    /// tmpfs size for /var/run/lock
    pub lock_size: String,
    /// Site-specific mounts applied after the standard plan
    pub extra_mounts: Vec<MountSpec>,
    pub start_dbus: bool,
    pub run_rc_local: bool,
    pub reconcile_groups: bool,
    /// Skip registering the unmount action
    pub no_unmount: bool,
    /// Substitute /dev/urandom for /dev/random inside the guest
    pub weak_random: bool,
}

impl Default for EnterConfig {
    fn default() -> Self {
        Self {
            chroots_dir: PathBuf::from("/usr/local/chroots"),
            mount_helper: None,
            unmount_helper: None,
            setup_script: PathBuf::from("/prepare.sh"),
            marker_file: PathBuf::from("/etc/guestroot/name"),
            var_run_size: "10%".to_string(),
            lock_size: "5120k".to_string(),
            extra_mounts: Vec::new(),
            start_dbus: true,
            run_rc_local: true,
            reconcile_groups: true,
            no_unmount: false,
            weak_random: false,
        }
    }
}

impl EnterConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EnterError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            EnterError::Config(format!(
                "Failed to parse config JSON {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Load an explicit config file, or the system one if it exists, or defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load_from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::load_from_file(DEFAULT_CONFIG_PATH)?
            }
            None => Self::default(),
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply GUESTROOT_* overrides from an environment lookup
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |key: &str| lookup(key).map(|v| !v.is_empty()).unwrap_or(false);

        if set(ENV_NO_UNMOUNT) {
            log::debug!("{} set, unmount on exit disabled", ENV_NO_UNMOUNT);
            self.no_unmount = true;
        }
        if set(ENV_WEAK_RANDOM) {
            log::debug!("{} set, using weak randomness", ENV_WEAK_RANDOM);
            self.weak_random = true;
        }
    }
}
