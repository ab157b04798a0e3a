/// Hardware-access group id reconciliation
///
/// Device nodes shared from the host carry host gids. For each mapped group
/// the guest group is given the host gid, moving any guest group that
/// already holds that gid to the next free one first.
use crate::config::types::Result;
use crate::identity::passwd::{GroupDb, GroupEntry};
use crate::kernel::mount::resolve;
use log::{debug, info, warn};
use std::fs;
use std::path::Path;

/// Host group name to guest group name
pub const DEFAULT_GROUP_TABLE: &[(&str, &str)] = &[
    ("audio", "audio"),
    ("video", "video"),
    ("input", "input"),
    ("cras", "cras"),
];

/// One resolved host/guest pair, valid for a single reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMapping {
    pub host_group_name: String,
    pub guest_group_name: String,
    pub host_gid: u32,
}

/// Edits applied to the guest group table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupChange {
    /// A guest group was moved off a gid the host needs
    Moved { name: String, from: u32, to: u32 },
    /// The mapped guest group took the host gid
    Set { name: String, from: u32, to: u32 },
    /// The mapped guest group did not exist and was created
    Created { name: String, gid: u32 },
}

#[derive(Debug, Clone)]
pub struct GroupIdReconciler {
    table: Vec<(String, String)>,
}

impl Default for GroupIdReconciler {
    fn default() -> Self {
        Self::new(DEFAULT_GROUP_TABLE)
    }
}

impl GroupIdReconciler {
    pub fn new(table: &[(&str, &str)]) -> Self {
        Self {
            table: table
                .iter()
                .map(|(h, g)| (h.to_string(), g.to_string()))
                .collect(),
        }
    }

    /// Look up host gids; groups the host does not have are skipped
    pub fn mappings(&self, host: &GroupDb) -> Vec<GroupMapping> {
        self.table
            .iter()
            .filter_map(|(host_name, guest_name)| match host.gid_of(host_name) {
                Some(gid) => Some(GroupMapping {
                    host_group_name: host_name.clone(),
                    guest_group_name: guest_name.clone(),
                    host_gid: gid,
                }),
                None => {
                    debug!("Host has no group {}, skipping", host_name);
                    None
                }
            })
            .collect()
    }

    /// Apply `mappings` to an in-memory guest group table
    pub fn reconcile(&self, guest: &mut Vec<GroupEntry>, mappings: &[GroupMapping]) -> Vec<GroupChange> {
        let mut changes = Vec::new();

        for mapping in mappings {
            let target = mapping.host_gid;
            let name = &mapping.guest_group_name;

            if guest.iter().any(|g| g.name == *name && g.gid == target) {
                continue;
            }

            if let Some(idx) = guest.iter().position(|g| g.gid == target && g.name != *name) {
                let free = next_free_gid(guest, target, mappings);
                let occupant = &mut guest[idx];
                changes.push(GroupChange::Moved {
                    name: occupant.name.clone(),
                    from: target,
                    to: free,
                });
                occupant.gid = free;
            }

            match guest.iter_mut().find(|g| g.name == *name) {
                Some(group) => {
                    changes.push(GroupChange::Set {
                        name: name.clone(),
                        from: group.gid,
                        to: target,
                    });
                    group.gid = target;
                }
                None => {
                    guest.push(GroupEntry {
                        name: name.clone(),
                        password: "x".to_string(),
                        gid: target,
                        members: Vec::new(),
                    });
                    changes.push(GroupChange::Created {
                        name: name.clone(),
                        gid: target,
                    });
                }
            }
        }

        changes
    }

    /// Reconcile `<root>/etc/group` against a host group file and write it back.
    ///
    /// Returns the number of changes made.
    pub fn reconcile_root(&self, root: &Path, host_group_file: &Path) -> Result<usize> {
        let host = GroupDb::load_file(host_group_file)?;
        let mappings = self.mappings(&host);

        let guest_path = resolve::resolve_host(root, Path::new("/etc/group"))?;
        let content = fs::read_to_string(&guest_path)?;
        let mut guest = GroupDb::parse(&content).into_entries();

        let changes = self.reconcile(&mut guest, &mappings);
        if changes.is_empty() {
            debug!("Guest group ids already match the host");
            return Ok(0);
        }

        for change in &changes {
            info!("Group reconciliation: {:?}", change);
        }

        let rendered = render_group_file(&content, &guest, &changes);
        let staging = guest_path.with_extension("guestroot-new");
        fs::write(&staging, rendered)?;
        if let Ok(meta) = fs::metadata(&guest_path) {
            let _ = fs::set_permissions(&staging, meta.permissions());
        }
        fs::rename(&staging, &guest_path)?;

        Ok(changes.len())
    }
}

/// Rewrite the original file text: changed groups get their new line, created
/// groups are appended, everything else is copied through untouched
fn render_group_file(original: &str, updated: &[GroupEntry], changes: &[GroupChange]) -> String {
    let touched = |name: &str| {
        changes.iter().any(|c| match c {
            GroupChange::Moved { name: n, .. } | GroupChange::Set { name: n, .. } => n == name,
            GroupChange::Created { .. } => false,
        })
    };

    let mut out = String::with_capacity(original.len() + 64);
    for line in original.split_inclusive('\n') {
        let (body, ending) = match line.strip_suffix('\n') {
            Some(body) => (body, "\n"),
            None => (line, ""),
        };
        let replacement = if body.starts_with('#') {
            None
        } else {
            body.parse::<GroupEntry>()
                .ok()
                .filter(|entry| touched(&entry.name))
                .and_then(|entry| updated.iter().find(|g| g.name == entry.name))
        };
        match replacement {
            Some(entry) => {
                out.push_str(&entry.to_line());
                out.push_str(ending);
            }
            None => out.push_str(line),
        }
    }

    for change in changes {
        if let GroupChange::Created { name, .. } = change {
            if let Some(entry) = updated.iter().find(|g| g.name == *name) {
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(&entry.to_line());
                out.push('\n');
            }
        }
    }
    out
}

/// Lowest gid above `start` that no guest group holds and no mapping claims
fn next_free_gid(guest: &[GroupEntry], start: u32, mappings: &[GroupMapping]) -> u32 {
    let mut candidate = start.saturating_add(1);
    while guest.iter().any(|g| g.gid == candidate)
        || mappings.iter().any(|m| m.host_gid == candidate)
    {
        candidate = candidate.saturating_add(1);
        if candidate == u32::MAX {
            warn!("Ran out of group ids while probing from {}", start);
            break;
        }
    }
    candidate
}
