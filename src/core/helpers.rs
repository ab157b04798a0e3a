//! Locating a chroot's root on the host.
//!
//! Either a plain directory lookup under the chroots directory, or an
//! external mount-resolution helper that prepares the chroot (decrypting,
//! mounting its backing store) and prints the host-side root path.

use crate::config::loader::EnterConfig;
use crate::config::types::{ChrootEnvironment, EnterError, Result};
use crate::config::validator::validate_name;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Resolves a chroot name to its [`ChrootEnvironment`]
pub trait RootLocator {
    fn locator_name(&self) -> &str;
    fn locate(&self, name: &str) -> Result<ChrootEnvironment>;
}

/// First chroot (by sorted name) under `chroots_dir`
pub fn default_chroot_name(chroots_dir: &Path) -> Result<String> {
    let entries = fs::read_dir(chroots_dir).map_err(|e| {
        EnterError::Precondition(format!(
            "Cannot list chroots in {}: {}",
            chroots_dir.display(),
            e
        ))
    })?;

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();

    names.into_iter().next().ok_or_else(|| {
        EnterError::Precondition(format!("No chroots found in {}", chroots_dir.display()))
    })
}

/// `<chroots_dir>/<name>`, no preparation step
pub struct DirectoryRootLocator {
    chroots_dir: PathBuf,
}

impl DirectoryRootLocator {
    pub fn new(chroots_dir: PathBuf) -> Self {
        Self { chroots_dir }
    }
}

impl RootLocator for DirectoryRootLocator {
    fn locator_name(&self) -> &str {
        "directory"
    }

    fn locate(&self, name: &str) -> Result<ChrootEnvironment> {
        validate_name(name)?;
        Ok(ChrootEnvironment {
            name: name.to_string(),
            root_path: self.chroots_dir.join(name),
        })
    }
}

/// Runs `<helper> -c <chroots_dir> <name>` and reads the root from its last output line
pub struct HelperRootLocator {
    helper: PathBuf,
    chroots_dir: PathBuf,
}

impl HelperRootLocator {
    pub fn new(helper: PathBuf, chroots_dir: PathBuf) -> Self {
        Self {
            helper,
            chroots_dir,
        }
    }
}

impl RootLocator for HelperRootLocator {
    fn locator_name(&self) -> &str {
        "helper"
    }

    fn locate(&self, name: &str) -> Result<ChrootEnvironment> {
        validate_name(name)?;
        log::info!("Preparing chroot {} via {}", name, self.helper.display());

        let output = Command::new(&self.helper)
            .arg("-c")
            .arg(&self.chroots_dir)
            .arg(name)
            .stdin(Stdio::inherit())
            .stderr(Stdio::inherit())
            .output()
            .map_err(|e| {
                EnterError::Precondition(format!(
                    "Failed to run mount helper {}: {}",
                    self.helper.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(EnterError::Precondition(format!(
                "Mount helper failed for chroot {} ({})",
                name, output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let root = stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .ok_or_else(|| {
                EnterError::Precondition(format!(
                    "Mount helper printed no root path for chroot {}",
                    name
                ))
            })?;

        Ok(ChrootEnvironment {
            name: name.to_string(),
            root_path: PathBuf::from(root),
        })
    }
}

/// Pick the locator the configuration asks for
pub fn create_root_locator(config: &EnterConfig) -> Box<dyn RootLocator> {
    match &config.mount_helper {
        Some(helper) => Box::new(HelperRootLocator::new(
            helper.clone(),
            config.chroots_dir.clone(),
        )),
        None => Box::new(DirectoryRootLocator::new(config.chroots_dir.clone())),
    }
}
