//! Symlink-safe path resolution inside a guest root.
//!
//! Guest symlinks are resolved as the guest would see them: an absolute
//! target restarts resolution at the guest root, never at the host root,
//! and `..` cannot climb above the guest root. A chain ending at
//! `/etc/shadow` therefore lands on `<root>/etc/shadow`.
//!
//! Components that do not exist yet are kept verbatim, so the result can
//! be used as a mount target that is about to be created.

use crate::config::types::{EnterError, Result};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

/// Upper bound on symlinks followed for one resolution (same as the kernel's)
pub const MAX_SYMLINK_FOLLOWS: usize = 40;

/// A path proven to live under a guest root
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPath {
    host: PathBuf,
    guest: PathBuf,
}

impl ResolvedPath {
    /// Host-side absolute path, always prefixed by the root
    pub fn host(&self) -> &Path {
        &self.host
    }

    /// The same location as the guest sees it (absolute, rooted at `/`)
    pub fn guest(&self) -> &Path {
        &self.guest
    }

    pub fn into_host(self) -> PathBuf {
        self.host
    }
}

/// Resolve `path` (absolute or relative, read as guest-absolute) under `root`
pub fn resolve(root: &Path, path: &Path) -> Result<ResolvedPath> {
    if !root.is_absolute() {
        return Err(EnterError::Resolution(format!(
            "chroot root must be absolute: {}",
            root.display()
        )));
    }

    let mut pending: VecDeque<OsString> = components_of(path);
    let mut resolved: Vec<OsString> = Vec::new();
    let mut follows = 0usize;

    while let Some(part) = pending.pop_front() {
        if part == ".." {
            resolved.pop();
            continue;
        }

        let candidate = join_under(root, &resolved).join(&part);
        let target = match std::fs::symlink_metadata(&candidate) {
            Ok(meta) if meta.file_type().is_symlink() => std::fs::read_link(&candidate)?,
            Ok(_) => {
                resolved.push(part);
                continue;
            }
            Err(e) if e.kind() == ErrorKind::NotFound || e.kind() == ErrorKind::NotADirectory => {
                resolved.push(part);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        follows += 1;
        if follows > MAX_SYMLINK_FOLLOWS {
            return Err(EnterError::Resolution(format!(
                "too many levels of symbolic links resolving {} under {}",
                path.display(),
                root.display()
            )));
        }

        log::debug!(
            "Following guest symlink {} -> {}",
            candidate.display(),
            target.display()
        );

        // An absolute target restarts at the guest root, a relative one is
        // read from the directory holding the link.
        if target.is_absolute() {
            resolved.clear();
        }
        for part in components_of(&target).into_iter().rev() {
            pending.push_front(part);
        }
    }

    let mut guest = PathBuf::from("/");
    guest.extend(resolved.iter());
    Ok(ResolvedPath {
        host: join_under(root, &resolved),
        guest,
    })
}

/// Convenience wrapper returning the host-side path only
pub fn resolve_host(root: &Path, path: &Path) -> Result<PathBuf> {
    resolve(root, path).map(ResolvedPath::into_host)
}

fn components_of(path: &Path) -> VecDeque<OsString> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_os_string()),
            Component::ParentDir => Some(OsString::from("..")),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => None,
        })
        .collect()
}

fn join_under(root: &Path, parts: &[OsString]) -> PathBuf {
    let mut out = root.to_path_buf();
    out.extend(parts.iter());
    out
}
