//! FUSE filesystem exposing cached secrets as files.
//!
//! One regular file per secret at the top level, plus a handful of reserved
//! dot entries: version and pid markers, a cache-clearing control file, and
//! a `.json` subtree mirroring raw server responses. Everything is
//! read-only; the single mutation allowed is unlinking `.clear_cache`.

use std::ffi::OsStr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, Request,
};

use common::cache::Cache;
use common::secret::{valid_name, Secret};

use super::inode_table::InodeTable;
use crate::client::SecretClient;
use crate::ownership::{self, Ownership};

/// How long the kernel may cache attributes and entries.
const ATTR_TTL: Duration = Duration::from_secs(1);

const BLOCK_SIZE: u32 = 512;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// What a path resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Root,
    Version,
    Running,
    ClearCache,
    JsonDir,
    JsonSecretDir,
    JsonSecrets,
    JsonStatus,
    JsonSecret(String),
    Secret(String),
}

impl Node {
    fn is_dir(&self) -> bool {
        matches!(self, Node::Root | Node::JsonDir | Node::JsonSecretDir)
    }
}

/// Resolves a slash-separated path to a node. Secret names never start with
/// a dot, so the reserved namespace cannot collide with them.
fn resolve(path: &str) -> Option<Node> {
    match path {
        "/" => Some(Node::Root),
        "/.version" => Some(Node::Version),
        "/.running" => Some(Node::Running),
        "/.clear_cache" => Some(Node::ClearCache),
        "/.json" => Some(Node::JsonDir),
        "/.json/secret" => Some(Node::JsonSecretDir),
        "/.json/secrets" => Some(Node::JsonSecrets),
        "/.json/status" => Some(Node::JsonStatus),
        _ => {
            if let Some(name) = path.strip_prefix("/.json/secret/") {
                return valid_name(name).then(|| Node::JsonSecret(name.to_string()));
            }
            let name = path.strip_prefix('/')?;
            valid_name(name).then(|| Node::Secret(name.to_string()))
        }
    }
}

/// The filesystem. FUSE callbacks arrive on the mount thread and hop onto
/// the runtime for anything that talks to the cache or the server.
pub struct SecretFs {
    rt: tokio::runtime::Handle,
    cache: Arc<Cache>,
    client: Arc<SecretClient>,
    ownership: Ownership,
    inodes: RwLock<InodeTable>,
    start_time: SystemTime,
}

impl SecretFs {
    pub fn new(
        rt: tokio::runtime::Handle,
        cache: Arc<Cache>,
        client: Arc<SecretClient>,
        ownership: Ownership,
    ) -> Self {
        Self {
            rt,
            cache,
            client,
            ownership,
            inodes: RwLock::new(InodeTable::new()),
            start_time: SystemTime::now(),
        }
    }

    fn inodes_read(&self) -> std::sync::RwLockReadGuard<'_, InodeTable> {
        self.inodes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn inode_for(&self, path: &str) -> u64 {
        self.inodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_create(path)
    }

    fn path_for(&self, ino: u64) -> Option<String> {
        self.inodes_read().get_path(ino).map(str::to_string)
    }

    /// `pid=<pid>` marker, useful for liveness checks against the mount.
    fn running() -> String {
        format!("pid={}", std::process::id())
    }

    fn status_json(&self) -> Vec<u8> {
        let uptime = self
            .start_time
            .elapsed()
            .unwrap_or_default()
            .as_secs();
        let status = serde_json::json!({
            "version": VERSION,
            "pid": std::process::id(),
            "uptimeSeconds": uptime,
            "cachedSecrets": self.cache.len(),
        });
        status.to_string().into_bytes()
    }

    /// Attributes for a node, if it currently exists. Secrets consult the
    /// cache; raw mirror files consult the server directly.
    fn node_attr(&self, ino: u64, node: &Node) -> Option<FileAttr> {
        match node {
            // Root keeps owner write permission so .clear_cache can be
            // unlinked.
            Node::Root => Some(self.dir_attr(ino, 0o755, 1)),
            Node::JsonDir => Some(self.dir_attr(ino, 0o700, 1)),
            Node::JsonSecretDir => Some(self.dir_attr(ino, 0o700, 0)),
            Node::Version => Some(self.file_attr(ino, VERSION.len() as u64, 0o444)),
            Node::Running => Some(self.file_attr(ino, Self::running().len() as u64, 0o444)),
            Node::ClearCache => Some(self.file_attr(ino, 0, 0o440)),
            Node::JsonStatus => {
                Some(self.file_attr(ino, self.status_json().len() as u64, 0o400))
            }
            Node::JsonSecrets => {
                let data = self.rt.block_on(self.client.raw_secret_list()).ok()?;
                Some(self.file_attr(ino, data.len() as u64, 0o400))
            }
            Node::JsonSecret(name) => {
                let data = self.rt.block_on(self.client.raw_secret(name)).ok()?;
                Some(self.file_attr(ino, data.len() as u64, 0o400))
            }
            Node::Secret(name) => {
                let secret = self.rt.block_on(self.cache.secret(name)).ok()?;
                Some(self.secret_attr(ino, &secret))
            }
        }
    }

    /// Bytes behind a file node, fetched fresh on every read.
    fn node_content(&self, node: &Node) -> Option<Vec<u8>> {
        match node {
            Node::Root | Node::JsonDir | Node::JsonSecretDir => None,
            Node::Version => Some(VERSION.as_bytes().to_vec()),
            Node::Running => Some(Self::running().into_bytes()),
            Node::ClearCache => Some(Vec::new()),
            Node::JsonStatus => Some(self.status_json()),
            Node::JsonSecrets => self.rt.block_on(self.client.raw_secret_list()).ok(),
            Node::JsonSecret(name) => self.rt.block_on(self.client.raw_secret(name)).ok(),
            Node::Secret(name) => {
                let secret = self.rt.block_on(self.cache.secret(name)).ok()?;
                Some(secret.content.as_bytes().to_vec())
            }
        }
    }

    fn secret_attr(&self, ino: u64, secret: &Secret) -> FileAttr {
        let created: SystemTime = secret.created_at.into();
        let mut uid = self.ownership.uid;
        let mut gid = self.ownership.gid;
        if !secret.owner.is_empty() {
            uid = ownership::lookup_uid(&secret.owner);
        }
        if !secret.group.is_empty() {
            gid = ownership::lookup_gid(&secret.group);
        }

        FileAttr {
            ino,
            size: secret.length,
            blocks: secret.length.div_ceil(BLOCK_SIZE as u64),
            atime: created,
            mtime: created,
            ctime: created,
            crtime: created,
            kind: FileType::RegularFile,
            perm: secret.mode_value() as u16,
            nlink: 1,
            uid,
            gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn file_attr(&self, ino: u64, size: u64, perm: u16) -> FileAttr {
        FileAttr {
            ino,
            size,
            blocks: size.div_ceil(BLOCK_SIZE as u64),
            atime: self.start_time,
            mtime: self.start_time,
            ctime: self.start_time,
            crtime: self.start_time,
            kind: FileType::RegularFile,
            perm,
            nlink: 1,
            uid: self.ownership.uid,
            gid: self.ownership.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn dir_attr(&self, ino: u64, perm: u16, subdirs: u32) -> FileAttr {
        // 4K is typically the minimum inode allocation for a directory.
        const DIRECTORY_SIZE: u64 = 4096;
        FileAttr {
            ino,
            size: DIRECTORY_SIZE,
            blocks: DIRECTORY_SIZE.div_ceil(BLOCK_SIZE as u64),
            atime: self.start_time,
            mtime: self.start_time,
            ctime: self.start_time,
            crtime: self.start_time,
            kind: FileType::Directory,
            perm,
            nlink: 2 + subdirs,
            uid: self.ownership.uid,
            gid: self.ownership.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    /// Secret file names for directory listings, reserved names filtered.
    fn secret_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .rt
            .block_on(self.cache.secret_list())
            .into_iter()
            .map(|s| s.name)
            .filter(|name| valid_name(name))
            .collect();
        names.sort();
        names
    }

    /// Child entries of a directory node, dot entries excluded.
    fn dir_entries(&self, node: &Node) -> Option<Vec<(FileType, String)>> {
        match node {
            Node::Root => {
                let mut entries: Vec<(FileType, String)> = self
                    .secret_names()
                    .into_iter()
                    .map(|name| (FileType::RegularFile, name))
                    .collect();
                entries.push((FileType::RegularFile, ".clear_cache".to_string()));
                entries.push((FileType::Directory, ".json".to_string()));
                entries.push((FileType::RegularFile, ".running".to_string()));
                entries.push((FileType::RegularFile, ".version".to_string()));
                Some(entries)
            }
            Node::JsonDir => Some(vec![
                (FileType::Directory, "secret".to_string()),
                (FileType::RegularFile, "secrets".to_string()),
                (FileType::RegularFile, "status".to_string()),
            ]),
            Node::JsonSecretDir => Some(
                self.secret_names()
                    .into_iter()
                    .map(|name| (FileType::RegularFile, name))
                    .collect(),
            ),
            _ => None,
        }
    }
}

impl Filesystem for SecretFs {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        tracing::info!("filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(parent_path) = self.path_for(parent) else {
            reply.error(libc::ENOENT);
            return;
        };

        let path = InodeTable::child_path(&parent_path, name);
        let Some(node) = resolve(&path) else {
            reply.error(libc::ENOENT);
            return;
        };

        let preexisting = self.inodes_read().get_inode(&path);
        let ino = preexisting.unwrap_or_else(|| self.inode_for(&path));
        match self.node_attr(ino, &node) {
            Some(attr) => reply.entry(&ATTR_TTL, &attr, 0),
            None => {
                // Do not let speculative lookups of absent names grow the
                // table forever.
                if preexisting.is_none() {
                    self.inodes
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(ino);
                }
                reply.error(libc::ENOENT);
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let node = self.path_for(ino).as_deref().and_then(resolve);
        match node.and_then(|node| self.node_attr(ino, &node)) {
            Some(attr) => reply.attr(&ATTR_TTL, &attr),
            None => reply.error(libc::ENOENT),
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(node) = self.path_for(ino).as_deref().and_then(resolve) else {
            reply.error(libc::ENOENT);
            return;
        };

        if node.is_dir() {
            reply.error(libc::EISDIR);
            return;
        }
        let write_flags = libc::O_WRONLY | libc::O_RDWR | libc::O_APPEND | libc::O_TRUNC;
        if flags & write_flags != 0 {
            reply.error(libc::EACCES);
            return;
        }

        if let Node::Secret(name) | Node::JsonSecret(name) = &node {
            tracing::info!(name, uid = req.uid(), gid = req.gid(), "secret opened");
        }
        reply.opened(0, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(node) = self.path_for(ino).as_deref().and_then(resolve) else {
            reply.error(libc::ENOENT);
            return;
        };

        match self.node_content(&node) {
            Some(data) => {
                let start = (offset as usize).min(data.len());
                let end = (start + size as usize).min(data.len());
                reply.data(&data[start..end]);
            }
            None => reply.error(libc::ENOENT),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.path_for(ino).as_deref().and_then(resolve) {
            Some(node) if node.is_dir() => reply.opened(0, 0),
            Some(_) => reply.error(libc::ENOTDIR),
            None => reply.error(libc::ENOENT),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(node) = resolve(&path) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(children) = self.dir_entries(&node) else {
            reply.error(libc::ENOTDIR);
            return;
        };

        let parent_ino = if ino == InodeTable::ROOT_INODE {
            ino
        } else {
            self.inode_for(InodeTable::parent_path(&path))
        };

        let mut entries: Vec<(u64, FileType, String)> = Vec::with_capacity(children.len() + 2);
        entries.push((ino, FileType::Directory, ".".to_string()));
        entries.push((parent_ino, FileType::Directory, "..".to_string()));
        for (kind, name) in children {
            let child_ino = self.inode_for(&InodeTable::child_path(&path, &name));
            entries.push((child_ino, kind, name));
        }

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        if parent == InodeTable::ROOT_INODE && name.to_str() == Some(".clear_cache") {
            self.cache.clear();
            reply.ok();
            return;
        }
        reply.error(libc::EACCES);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_reserved_paths() {
        assert_eq!(resolve("/"), Some(Node::Root));
        assert_eq!(resolve("/.version"), Some(Node::Version));
        assert_eq!(resolve("/.running"), Some(Node::Running));
        assert_eq!(resolve("/.clear_cache"), Some(Node::ClearCache));
        assert_eq!(resolve("/.json"), Some(Node::JsonDir));
        assert_eq!(resolve("/.json/secret"), Some(Node::JsonSecretDir));
        assert_eq!(resolve("/.json/secrets"), Some(Node::JsonSecrets));
        assert_eq!(resolve("/.json/status"), Some(Node::JsonStatus));
    }

    #[test]
    fn resolves_secret_paths() {
        assert_eq!(
            resolve("/general_password"),
            Some(Node::Secret("general_password".to_string()))
        );
        assert_eq!(
            resolve("/.json/secret/general_password"),
            Some(Node::JsonSecret("general_password".to_string()))
        );
    }

    #[test]
    fn rejects_dot_and_nested_names() {
        assert_eq!(resolve("/.hidden"), None);
        assert_eq!(resolve("/a/b"), None);
        assert_eq!(resolve("/.json/secret/.sneaky"), None);
        assert_eq!(resolve("/.json/nope"), None);
    }

    #[test]
    fn only_the_expected_nodes_are_directories() {
        for (path, is_dir) in [
            ("/", true),
            ("/.json", true),
            ("/.json/secret", true),
            ("/.version", false),
            ("/x", false),
        ] {
            assert_eq!(resolve(path).unwrap().is_dir(), is_dir, "{path}");
        }
    }
}
