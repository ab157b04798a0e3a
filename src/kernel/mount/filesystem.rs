/// Idempotent bind and tmpfs mounts under a guest root
use crate::config::types::{EnterError, MountKind, MountSpec, Result};
use crate::kernel::mount::resolve;
use nix::mount::{MntFlags, MsFlags};
use nix::sys::statvfs::{statvfs, FsFlags};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// One kernel mount call, as issued by [`MountOperator`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountRequest {
    pub source: Option<PathBuf>,
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub flags: MsFlags,
    pub data: Option<String>,
}

impl MountRequest {
    /// True for calls that create a new mount (not remount or propagation changes)
    pub fn creates_mount(&self) -> bool {
        let modifiers = MsFlags::MS_REMOUNT
            | MsFlags::MS_SHARED
            | MsFlags::MS_SLAVE
            | MsFlags::MS_PRIVATE
            | MsFlags::MS_UNBINDABLE;
        !self.flags.intersects(modifiers)
    }
}

/// Kernel seam for mount operations
pub trait MountBackend: Send + Sync {
    /// Whether `path` is currently a mount point
    fn is_mount_point(&self, path: &Path) -> Result<bool>;

    /// Per-mount flags in effect for the mount containing `path`
    fn mount_flags(&self, path: &Path) -> Result<MsFlags>;

    /// Issue a single mount(2) call
    fn mount(&self, request: &MountRequest) -> Result<()>;

    /// Lazily detach whatever is mounted at `path`
    fn detach(&self, path: &Path) -> Result<()>;
}

/// Real mounts through mount(2) and /proc/self/mountinfo
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelMounts;

impl MountBackend for KernelMounts {
    fn is_mount_point(&self, path: &Path) -> Result<bool> {
        // mountinfo lists canonical paths; a missing target is never mounted
        let canonical = match fs::canonicalize(path) {
            Ok(p) => p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let content = fs::read_to_string("/proc/self/mountinfo").map_err(|e| {
            EnterError::Mount(format!("Failed to read /proc/self/mountinfo: {}", e))
        })?;

        Ok(parse_mount_points(&content)
            .iter()
            .any(|mount_point| Path::new(mount_point) == canonical))
    }

    fn mount_flags(&self, path: &Path) -> Result<MsFlags> {
        let stat = statvfs(path).map_err(|e| {
            EnterError::Mount(format!("statvfs {} failed: {}", path.display(), e))
        })?;
        Ok(flags_from_statvfs(stat.flags()))
    }

    fn mount(&self, request: &MountRequest) -> Result<()> {
        nix::mount::mount(
            request.source.as_deref(),
            request.target.as_path(),
            request.fstype.as_deref(),
            request.flags,
            request.data.as_deref(),
        )
        .map_err(|e| {
            EnterError::Mount(format!(
                "mount {} on {} ({:?}) failed: {}",
                request
                    .source
                    .as_deref()
                    .map(|s| s.display().to_string())
                    .unwrap_or_else(|| "none".to_string()),
                request.target.display(),
                request.flags,
                e
            ))
        })
    }

    fn detach(&self, path: &Path) -> Result<()> {
        nix::mount::umount2(path, MntFlags::MNT_DETACH).map_err(|e| {
            EnterError::Mount(format!("Failed to unmount {}: {}", path.display(), e))
        })
    }
}

/// Map statvfs(3) flags onto the mount(2) flags a bind remount would otherwise reset
pub fn flags_from_statvfs(flags: FsFlags) -> MsFlags {
    let mut table = vec![
        (FsFlags::ST_RDONLY, MsFlags::MS_RDONLY),
        (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
        (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
        (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
        (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
        (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
    ];
    #[cfg(not(target_env = "musl"))]
    table.push((FsFlags::ST_RELATIME, MsFlags::MS_RELATIME));

    table
        .into_iter()
        .filter(|(st, _)| flags.contains(*st))
        .fold(MsFlags::empty(), |acc, (_, ms)| acc | ms)
}

/// Mount points (field 5) from /proc/self/mountinfo content
/// Format: mount_id parent_id major:minor root mount_point options ... - fs_type source super_options
pub fn parse_mount_points(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(unescape_mountinfo)
        .collect()
}

/// Undo the kernel's octal escaping of space, tab, newline and backslash
fn unescape_mountinfo(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let octal = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(value) = u8::from_str_radix(octal, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Mount options split into what mount(2) needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedOptions {
    pub flags: MsFlags,
    pub propagation: MsFlags,
    pub data: Vec<String>,
}

impl Default for ParsedOptions {
    fn default() -> Self {
        Self {
            flags: MsFlags::empty(),
            propagation: MsFlags::empty(),
            data: Vec::new(),
        }
    }
}

impl ParsedOptions {
    pub fn data_string(&self) -> Option<String> {
        if self.data.is_empty() {
            None
        } else {
            Some(self.data.join(","))
        }
    }
}

/// Translate option words into mount flags; unknown words become fs data
pub fn parse_options<'a, I>(options: I) -> ParsedOptions
where
    I: IntoIterator<Item = &'a String>,
{
    parse_options_from(MsFlags::empty(), options)
}

/// Like [`parse_options`], but applies the words on top of `base` flags
pub fn parse_options_from<'a, I>(base: MsFlags, options: I) -> ParsedOptions
where
    I: IntoIterator<Item = &'a String>,
{
    let mut parsed = ParsedOptions {
        flags: base,
        ..ParsedOptions::default()
    };

    for option in options {
        match option.trim() {
            "" | "bind" | "remount" | "defaults" => {}
            "ro" => parsed.flags |= MsFlags::MS_RDONLY,
            "rw" => parsed.flags.remove(MsFlags::MS_RDONLY),
            "noexec" => parsed.flags |= MsFlags::MS_NOEXEC,
            "exec" => parsed.flags.remove(MsFlags::MS_NOEXEC),
            "nosuid" => parsed.flags |= MsFlags::MS_NOSUID,
            "suid" => parsed.flags.remove(MsFlags::MS_NOSUID),
            "nodev" => parsed.flags |= MsFlags::MS_NODEV,
            "dev" => parsed.flags.remove(MsFlags::MS_NODEV),
            "noatime" => parsed.flags |= MsFlags::MS_NOATIME,
            "atime" => parsed.flags.remove(MsFlags::MS_NOATIME),
            "nodiratime" => parsed.flags |= MsFlags::MS_NODIRATIME,
            "relatime" => parsed.flags |= MsFlags::MS_RELATIME,
            "strictatime" => parsed.flags |= MsFlags::MS_STRICTATIME,
            "rbind" | "rec" => parsed.flags |= MsFlags::MS_REC,
            "shared" => parsed.propagation |= MsFlags::MS_SHARED,
            "rshared" => parsed.propagation |= MsFlags::MS_SHARED | MsFlags::MS_REC,
            "slave" => parsed.propagation |= MsFlags::MS_SLAVE,
            "rslave" => parsed.propagation |= MsFlags::MS_SLAVE | MsFlags::MS_REC,
            "private" => parsed.propagation |= MsFlags::MS_PRIVATE,
            "rprivate" => parsed.propagation |= MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            "unbindable" => parsed.propagation |= MsFlags::MS_UNBINDABLE,
            other => parsed.data.push(other.to_string()),
        }
    }

    parsed
}

/// Ledger entry for a mount this process created
#[derive(Debug, Clone)]
pub struct MountRecord {
    pub target: PathBuf,
    pub kind: MountKind,
}

/// Mounts created by a session, in creation order
#[derive(Debug, Default)]
pub struct MountLedger {
    entries: Vec<MountRecord>,
}

impl MountLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Must be called immediately after a successful mount
    pub fn record(&mut self, target: PathBuf, kind: MountKind) {
        log::debug!("Recording mount: {}", target.display());
        self.entries.push(MountRecord {
            target,
            kind,
        });
    }

    /// Entries in reverse creation order (teardown order)
    pub fn reverse_order(&self) -> Vec<&MountRecord> {
        self.entries.iter().rev().collect()
    }

    pub fn remove(&mut self, target: &Path) {
        self.entries.retain(|e| e.target != target);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }
}

/// Shared handle to a session's mount ledger
pub type SharedLedger = Arc<Mutex<MountLedger>>;

/// Applies mounts under one guest root. Order-agnostic: callers sequence specs.
#[derive(Clone)]
pub struct MountOperator {
    root: PathBuf,
    backend: Arc<dyn MountBackend>,
    ledger: SharedLedger,
}

impl MountOperator {
    /// Operator backed by real kernel mounts
    pub fn new(root: PathBuf) -> Self {
        Self::with_backend(root, Arc::new(KernelMounts))
    }

    pub fn with_backend(root: PathBuf, backend: Arc<dyn MountBackend>) -> Self {
        Self {
            root,
            backend,
            ledger: Arc::new(Mutex::new(MountLedger::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backend(&self) -> Arc<dyn MountBackend> {
        Arc::clone(&self.backend)
    }

    /// Ledger of mounts this operator performed
    pub fn ledger(&self) -> SharedLedger {
        Arc::clone(&self.ledger)
    }

    /// Apply one declarative spec. Returns whether anything was mounted.
    pub fn apply(&self, spec: &MountSpec) -> Result<bool> {
        match spec.kind {
            MountKind::Bind => {
                if spec.optional && !spec.source.exists() {
                    log::debug!(
                        "Skipping optional bind of missing source {}",
                        spec.source.display()
                    );
                    return Ok(false);
                }
                self.bind_mount(
                    &spec.source,
                    &spec.target,
                    &spec.options,
                    spec.remount_options.as_ref(),
                )
            }
            MountKind::Tmpfs => self.tmpfs_mount(&spec.target, &spec.options),
        }
    }

    /// Bind `source` onto the guest path `target`.
    ///
    /// A target that is already a mount point is left untouched, remount
    /// options included.
    pub fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        options: &BTreeSet<String>,
        remount: Option<&BTreeSet<String>>,
    ) -> Result<bool> {
        let host_target = resolve::resolve_host(&self.root, target)?;
        if self.backend.is_mount_point(&host_target)? {
            log::debug!("{} already mounted, skipping", host_target.display());
            return Ok(false);
        }

        let source_is_file = fs::metadata(source).map(|m| !m.is_dir()).unwrap_or(false);
        create_target(&host_target, source_is_file)?;

        let parsed = parse_options(options);
        self.backend.mount(&MountRequest {
            source: Some(source.to_path_buf()),
            target: host_target.clone(),
            fstype: None,
            flags: MsFlags::MS_BIND | (parsed.flags & MsFlags::MS_REC),
            data: None,
        })?;
        self.record(&host_target, MountKind::Bind);

        if !parsed.propagation.is_empty() {
            self.backend.mount(&MountRequest {
                source: None,
                target: host_target.clone(),
                fstype: None,
                flags: parsed.propagation,
                data: None,
            })?;
        }

        if let Some(remount) = remount {
            // A bind remount replaces every per-mount flag, so start from the current ones
            let current = self.backend.mount_flags(&host_target)?;
            let extra = parse_options_from(current, remount);
            self.backend.mount(&MountRequest {
                source: None,
                target: host_target.clone(),
                fstype: None,
                flags: MsFlags::MS_REMOUNT | MsFlags::MS_BIND | extra.flags,
                data: extra.data_string(),
            })?;
        }

        log::info!(
            "Bound {} to {}",
            source.display(),
            host_target.display()
        );
        Ok(true)
    }

    /// Fresh tmpfs at the guest path `target`
    pub fn tmpfs_mount(&self, target: &Path, options: &BTreeSet<String>) -> Result<bool> {
        let host_target = resolve::resolve_host(&self.root, target)?;
        if self.backend.is_mount_point(&host_target)? {
            log::debug!("{} already mounted, skipping", host_target.display());
            return Ok(false);
        }

        create_target(&host_target, false)?;

        let parsed = parse_options(options);
        self.backend.mount(&MountRequest {
            source: Some(PathBuf::from("tmpfs")),
            target: host_target.clone(),
            fstype: Some("tmpfs".to_string()),
            flags: parsed.flags,
            data: parsed.data_string(),
        })?;
        self.record(&host_target, MountKind::Tmpfs);

        log::info!("Mounted tmpfs at {}", host_target.display());
        Ok(true)
    }

    fn record(&self, target: &Path, kind: MountKind) {
        self.ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .record(target.to_path_buf(), kind);
    }
}

fn create_target(target: &Path, as_file: bool) -> Result<()> {
    let dir = if as_file { target.parent() } else { Some(target) };
    if let Some(dir) = dir {
        fs::create_dir_all(dir).map_err(|e| {
            EnterError::Mount(format!(
                "Failed to create mount target {}: {}",
                dir.display(),
                e
            ))
        })?;
    }
    if as_file && !target.exists() {
        fs::File::create(target).map_err(|e| {
            EnterError::Mount(format!(
                "Failed to create mount target {}: {}",
                target.display(),
                e
            ))
        })?;
    }
    Ok(())
}
