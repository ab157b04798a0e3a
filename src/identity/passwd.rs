/// Flat-file account database of the guest
///
/// Read-only lookups over `etc/passwd` and `etc/group` inside a guest root.
/// Files are located through the path resolver so a guest symlink cannot
/// point the lookup at the host's account files.
use crate::config::types::{EnterError, Result, UserSpec};
use crate::kernel::mount::resolve;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// First uid considered a regular (non-system) user
pub const FIRST_REGULAR_UID: u32 = 1000;
/// First uid past the regular range (nobody and friends live above it)
pub const LAST_REGULAR_UID: u32 = 60000;

/// One passwd record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    pub shell: PathBuf,
}

impl FromStr for PasswdEntry {
    type Err = EnterError;

    /// `name:x:uid:gid:gecos:home:shell`
    fn from_str(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 7 {
            return Err(EnterError::Precondition(format!(
                "Malformed passwd line: {}",
                line
            )));
        }
        let parse_id = |raw: &str| {
            raw.parse::<u32>().map_err(|_| {
                EnterError::Precondition(format!("Malformed id {:?} in passwd line", raw))
            })
        };

        Ok(Self {
            name: fields[0].to_string(),
            uid: parse_id(fields[2])?,
            gid: parse_id(fields[3])?,
            home: PathBuf::from(fields[5]),
            shell: PathBuf::from(fields[6]),
        })
    }
}

/// One group record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub name: String,
    pub password: String,
    pub gid: u32,
    pub members: Vec<String>,
}

impl FromStr for GroupEntry {
    type Err = EnterError;

    /// `name:x:gid:member,member`
    fn from_str(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 4 {
            return Err(EnterError::Precondition(format!(
                "Malformed group line: {}",
                line
            )));
        }
        let gid = fields[2].parse::<u32>().map_err(|_| {
            EnterError::Precondition(format!("Malformed gid {:?} in group line", fields[2]))
        })?;

        Ok(Self {
            name: fields[0].to_string(),
            password: fields[1].to_string(),
            gid,
            members: fields[3]
                .split(',')
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect(),
        })
    }
}

impl GroupEntry {
    /// Render back to the on-disk line format
    pub fn to_line(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.name,
            self.password,
            self.gid,
            self.members.join(",")
        )
    }
}

/// Parse every well-formed record, skipping blanks, comments and junk lines
pub fn parse_records<T: FromStr<Err = EnterError>>(content: &str) -> Vec<T> {
    content
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .filter_map(|l| match l.parse::<T>() {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::debug!("Skipping record: {}", e);
                None
            }
        })
        .collect()
}

/// Parsed passwd database of one root
#[derive(Debug, Clone, Default)]
pub struct PasswdDb {
    entries: Vec<PasswdEntry>,
}

impl PasswdDb {
    pub fn parse(content: &str) -> Self {
        Self {
            entries: parse_records(content),
        }
    }

    /// Load `<root>/etc/passwd`
    pub fn load(root: &Path) -> Result<Self> {
        let path = resolve::resolve_host(root, Path::new("/etc/passwd"))?;
        let content = fs::read_to_string(&path).map_err(|e| {
            EnterError::Precondition(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Ok(Self::parse(&content))
    }

    pub fn by_name(&self, name: &str) -> Option<&PasswdEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn by_uid(&self, uid: u32) -> Option<&PasswdEntry> {
        self.entries.iter().find(|e| e.uid == uid)
    }

    /// First regular user, the account an unqualified login lands in
    pub fn default_user(&self) -> Option<&PasswdEntry> {
        self.entries
            .iter()
            .find(|e| (FIRST_REGULAR_UID..LAST_REGULAR_UID).contains(&e.uid))
    }

    /// Resolve the login target; `None` selects the default user
    pub fn lookup(&self, user: Option<&UserSpec>) -> Result<&PasswdEntry> {
        let found = match user {
            Some(UserSpec::Name(name)) => self.by_name(name),
            Some(UserSpec::Uid(uid)) => self.by_uid(*uid),
            None => self.default_user(),
        };
        found.ok_or_else(|| match user {
            Some(spec) => EnterError::Precondition(format!("User {} not found in chroot", spec)),
            None => EnterError::Precondition("No regular user found in chroot".to_string()),
        })
    }
}

/// Parsed group database
#[derive(Debug, Clone, Default)]
pub struct GroupDb {
    entries: Vec<GroupEntry>,
}

impl GroupDb {
    pub fn parse(content: &str) -> Self {
        Self {
            entries: parse_records(content),
        }
    }

    /// Load a group file, e.g. the host's `/etc/group`
    pub fn load_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    pub fn gid_of(&self, name: &str) -> Option<u32> {
        self.entries.iter().find(|e| e.name == name).map(|e| e.gid)
    }

    pub fn entries(&self) -> &[GroupEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<GroupEntry> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/bash
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
# comment
broken line
alice:x:1000:1000:Alice,,,:/home/alice:/bin/zsh
bob:x:1001:1001::/home/bob:/bin/bash
nobody:x:65534:65534:nobody:/nonexistent:/usr/sbin/nologin
";

    #[test]
    fn test_lookup_by_name_and_uid() {
        let db = PasswdDb::parse(PASSWD);
        let bob = db.lookup(Some(&UserSpec::Name("bob".to_string()))).unwrap();
        assert_eq!(bob.uid, 1001);
        assert_eq!(bob.home, PathBuf::from("/home/bob"));

        let alice = db.lookup(Some(&UserSpec::Uid(1000))).unwrap();
        assert_eq!(alice.shell, PathBuf::from("/bin/zsh"));
    }

    #[test]
    fn test_default_user_is_first_regular() {
        let db = PasswdDb::parse(PASSWD);
        assert_eq!(db.lookup(None).unwrap().name, "alice");
    }

    #[test]
    fn test_unknown_user_is_precondition_error() {
        let db = PasswdDb::parse(PASSWD);
        let err = db.lookup(Some(&UserSpec::Name("mallory".to_string())));
        assert!(matches!(err, Err(EnterError::Precondition(_))));

        let system_only = PasswdDb::parse("root:x:0:0:root:/root:/bin/sh\n");
        assert!(system_only.lookup(None).is_err());
    }

    #[test]
    fn test_group_line_format_preserved() {
        let line = "audio:x:29:alice,bob";
        let entry: GroupEntry = line.parse().unwrap();
        assert_eq!(entry.members, vec!["alice", "bob"]);
        assert_eq!(entry.to_line(), line);

        let empty: GroupEntry = "video:x:44:".parse().unwrap();
        assert!(empty.members.is_empty());
        assert_eq!(empty.to_line(), "video:x:44:");
    }
}
