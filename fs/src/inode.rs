use std::collections::HashMap;

/// FUSE reserves inode 1 for the mount root.
pub const ROOT_INODE: u64 = 1;

/// Bidirectional map between kernel inode numbers and sandbox-relative
/// paths. Entries are never evicted: a stale mapping for a since-deleted
/// path is harmless because every operation re-resolves through the
/// permission engine and delta store by path, not by cached attributes.
#[derive(Debug)]
pub struct InodeTable {
    by_ino: HashMap<u64, String>,
    by_path: HashMap<String, u64>,
    next_ino: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        by_ino.insert(ROOT_INODE, "/".to_string());
        by_path.insert("/".to_string(), ROOT_INODE);
        Self {
            by_ino,
            by_path,
            next_ino: ROOT_INODE + 1,
        }
    }

    pub fn path(&self, ino: u64) -> Option<&str> {
        self.by_ino.get(&ino).map(String::as_str)
    }

    /// Returns the inode for `relpath`, allocating a fresh one on first
    /// sight.
    pub fn ensure(&mut self, relpath: &str) -> u64 {
        if let Some(&ino) = self.by_path.get(relpath) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.by_path.insert(relpath.to_string(), ino);
        self.by_ino.insert(ino, relpath.to_string());
        ino
    }

    pub fn rename(&mut self, from: &str, to: &str) {
        if let Some(ino) = self.by_path.remove(from) {
            self.by_path.insert(to.to_string(), ino);
            self.by_ino.insert(ino, to.to_string());
        }
    }
}
