//! Resolution of textual owner/group names to numeric ids.
//!
//! Secrets can name their owning user and group. Resolution scans the
//! system databases directly; a name that cannot be resolved falls back to
//! the effective uid/gid of the process, which keeps the file visible
//! instead of failing the mount.

use std::io::BufRead;
use std::path::Path;

const PASSWD_FILE: &str = "/etc/passwd";
const GROUP_FILE: &str = "/etc/group";

/// Default ownership for filesystem entries.
#[derive(Debug, Clone, Copy)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

impl Ownership {
    pub fn new(username: &str, groupname: &str) -> Self {
        Self {
            uid: lookup_uid(username),
            gid: lookup_gid(groupname),
        }
    }
}

/// Resolves a username to a uid. The effective uid is returned on failure.
pub fn lookup_uid(username: &str) -> u32 {
    match lookup_in_colon_file(Path::new(PASSWD_FILE), username) {
        Some(uid) => uid,
        None => {
            let fallback = unsafe { libc::geteuid() };
            tracing::warn!(username, fallback, "unable to resolve uid, using effective uid");
            fallback
        }
    }
}

/// Resolves a group name to a gid. The effective gid is returned on failure.
pub fn lookup_gid(groupname: &str) -> u32 {
    match lookup_in_colon_file(Path::new(GROUP_FILE), groupname) {
        Some(gid) => gid,
        None => {
            let fallback = unsafe { libc::getegid() };
            tracing::warn!(groupname, fallback, "unable to resolve gid, using effective gid");
            fallback
        }
    }
}

/// Both /etc/passwd and /etc/group keep the numeric id in the third
/// colon-separated field.
fn lookup_in_colon_file(path: &Path, name: &str) -> Option<u32> {
    let file = std::fs::File::open(path).ok()?;
    find_id(std::io::BufReader::new(file), name)
}

fn find_id<R: BufRead>(reader: R, name: &str) -> Option<u32> {
    for line in reader.lines() {
        let line = line.ok()?;
        let mut fields = line.split(':');
        if fields.next() == Some(name) {
            let id = fields.nth(1)?;
            return id.parse().ok();
        }
    }
    None
}
