//! Inode to path mapping.
//!
//! FUSE identifies files by inode, but secrets are identified by name. This
//! keeps the bidirectional mapping, handing out inodes on first sight of a
//! path.

use std::collections::HashMap;

/// Bidirectional mapping between inodes and slash-separated paths.
pub struct InodeTable {
    path_to_inode: HashMap<String, u64>,
    inode_to_path: HashMap<u64, String>,
    next_inode: u64,
}

impl InodeTable {
    pub const ROOT_INODE: u64 = 1;

    pub fn new() -> Self {
        let mut table = Self {
            path_to_inode: HashMap::new(),
            inode_to_path: HashMap::new(),
            next_inode: 2,
        };
        table.path_to_inode.insert("/".to_string(), Self::ROOT_INODE);
        table.inode_to_path.insert(Self::ROOT_INODE, "/".to_string());
        table
    }

    /// Inode for a path, allocating one if the path is new.
    pub fn get_or_create(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.path_to_inode.get(path) {
            return ino;
        }
        let ino = self.next_inode;
        self.next_inode += 1;
        self.path_to_inode.insert(path.to_string(), ino);
        self.inode_to_path.insert(ino, path.to_string());
        ino
    }

    pub fn get_inode(&self, path: &str) -> Option<u64> {
        self.path_to_inode.get(path).copied()
    }

    pub fn get_path(&self, inode: u64) -> Option<&str> {
        self.inode_to_path.get(&inode).map(|p| p.as_str())
    }

    /// Drops a mapping, e.g. after a lookup of a name that does not exist.
    pub fn remove(&mut self, inode: u64) {
        if let Some(path) = self.inode_to_path.remove(&inode) {
            self.path_to_inode.remove(&path);
        }
    }

    /// Parent directory of a path, `/` included.
    pub fn parent_path(path: &str) -> &str {
        match path.rfind('/') {
            Some(0) | None => "/",
            Some(idx) => &path[..idx],
        }
    }

    /// Joins a directory path and a child name.
    pub fn child_path(parent: &str, name: &str) -> String {
        if parent == "/" {
            format!("/{name}")
        } else {
            format!("{parent}/{name}")
        }
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_inode_one() {
        let table = InodeTable::new();
        assert_eq!(table.get_path(InodeTable::ROOT_INODE), Some("/"));
    }

    #[test]
    fn allocation_is_stable() {
        let mut table = InodeTable::new();
        let a = table.get_or_create("/general_password");
        let b = table.get_or_create("/.json/secret/general_password");
        assert_ne!(a, b);
        assert_eq!(table.get_or_create("/general_password"), a);
        assert_eq!(table.get_path(a), Some("/general_password"));
    }

    #[test]
    fn path_helpers() {
        assert_eq!(InodeTable::parent_path("/foo"), "/");
        assert_eq!(InodeTable::parent_path("/.json/secret/foo"), "/.json/secret");
        assert_eq!(InodeTable::child_path("/", "foo"), "/foo");
        assert_eq!(InodeTable::child_path("/.json", "secret"), "/.json/secret");
    }
}
