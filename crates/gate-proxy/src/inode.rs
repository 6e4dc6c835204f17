//! Maps FUSE's numeric inodes to paths in the backing tree.
//!
//! The broker and the pure mapping layer speak in paths; the kernel speaks
//! in inode numbers. This table is the proxy-local translation between the
//! two — it has no counterpart in the broker or in `gate-proxy-core`
//! because it's an artifact of the FUSE ABI, not of the locking model.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// The inode FUSE reserves for the mount root.
pub const ROOT_INO: u64 = 1;

#[derive(Default)]
struct Tables {
    by_ino: HashMap<u64, PathBuf>,
    by_path: HashMap<PathBuf, u64>,
    next_ino: u64,
}

/// Bidirectional inode ⇄ path table, seeded with the mount root at
/// [`ROOT_INO`].
pub struct InodeTable {
    tables: Mutex<Tables>,
}

impl InodeTable {
    #[must_use]
    pub fn new(root: &Path) -> Self {
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        by_ino.insert(ROOT_INO, root.to_path_buf());
        by_path.insert(root.to_path_buf(), ROOT_INO);
        Self {
            tables: Mutex::new(Tables { by_ino, by_path, next_ino: ROOT_INO + 1 }),
        }
    }

    /// Look up the path for an existing inode.
    #[must_use]
    pub fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.tables.lock().expect("inode table mutex poisoned").by_ino.get(&ino).cloned()
    }

    /// Find or assign an inode for `path`, minting a new one if this path
    /// hasn't been seen before.
    pub fn ino_for(&self, path: &Path) -> u64 {
        let mut tables = self.tables.lock().expect("inode table mutex poisoned");
        if let Some(ino) = tables.by_path.get(path) {
            return *ino;
        }
        let ino = tables.next_ino;
        tables.next_ino += 1;
        tables.by_ino.insert(ino, path.to_path_buf());
        tables.by_path.insert(path.to_path_buf(), ino);
        ino
    }

    /// Update the path an inode refers to (rename destination reuses the
    /// source's inode, matching POSIX rename semantics).
    pub fn reassign(&self, ino: u64, new_path: &Path) {
        let mut tables = self.tables.lock().expect("inode table mutex poisoned");
        if let Some(old_path) = tables.by_ino.get(&ino).cloned() {
            tables.by_path.remove(&old_path);
        }
        tables.by_ino.insert(ino, new_path.to_path_buf());
        tables.by_path.insert(new_path.to_path_buf(), ino);
    }

    /// Drop the mapping for `ino` (after unlink/rmdir of its sole link).
    pub fn forget(&self, ino: u64) {
        let mut tables = self.tables.lock().expect("inode table mutex poisoned");
        if let Some(path) = tables.by_ino.remove(&ino) {
            tables.by_path.remove(&path);
        }
    }

    pub fn child_path(&self, parent_ino: u64, name: &std::ffi::OsStr) -> Option<PathBuf> {
        self.path_of(parent_ino).map(|parent| parent.join(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_preseeded() {
        let table = InodeTable::new(Path::new("/backing"));
        assert_eq!(table.path_of(ROOT_INO), Some(PathBuf::from("/backing")));
    }

    #[test]
    fn repeated_lookups_of_the_same_path_return_the_same_inode() {
        let table = InodeTable::new(Path::new("/backing"));
        let path = PathBuf::from("/backing/file.txt");
        let first = table.ino_for(&path);
        let second = table.ino_for(&path);
        assert_eq!(first, second);
    }

    #[test]
    fn reassign_moves_the_inode_to_a_new_path() {
        let table = InodeTable::new(Path::new("/backing"));
        let old = PathBuf::from("/backing/old.txt");
        let new = PathBuf::from("/backing/new.txt");
        let ino = table.ino_for(&old);
        table.reassign(ino, &new);
        assert_eq!(table.path_of(ino), Some(new.clone()));
        assert_eq!(table.ino_for(&new), ino);
    }

    #[test]
    fn forget_drops_both_directions() {
        let table = InodeTable::new(Path::new("/backing"));
        let path = PathBuf::from("/backing/gone.txt");
        let ino = table.ino_for(&path);
        table.forget(ino);
        assert_eq!(table.path_of(ino), None);
    }
}
