//! Inode number to virtual path mapping
//!
//! fuser addresses everything by inode number while the relay works on
//! paths. Numbers are handed out on first lookup and dropped again when the
//! kernel forgets them.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Root inode number, fixed by FUSE
pub const ROOT_INO: u64 = 1;

struct InodeEntry {
    path: PathBuf,
    lookups: u64,
}

struct Tables {
    next_ino: u64,
    by_ino: HashMap<u64, InodeEntry>,
    by_path: HashMap<PathBuf, u64>,
}

/// Bidirectional ino <-> path table
pub struct InodeTable {
    tables: RwLock<Tables>,
}

impl InodeTable {
    pub fn new() -> Self {
        let root = PathBuf::from("/");
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        by_ino.insert(
            ROOT_INO,
            InodeEntry {
                path: root.clone(),
                lookups: 1,
            },
        );
        by_path.insert(root, ROOT_INO);

        Self {
            tables: RwLock::new(Tables {
                next_ino: ROOT_INO + 1,
                by_ino,
                by_path,
            }),
        }
    }

    /// Virtual path for an inode
    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.tables.read().by_ino.get(&ino).map(|e| e.path.clone())
    }

    /// Virtual path of `name` inside directory `parent`
    pub fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.path(parent).map(|p| p.join(name))
    }

    /// Inode for a path if one has been handed out
    pub fn get(&self, path: &Path) -> Option<u64> {
        self.tables.read().by_path.get(path).copied()
    }

    /// Inode for a path, counting one kernel lookup reference
    pub fn lookup(&self, path: &Path) -> u64 {
        let mut tables = self.tables.write();

        if let Some(&ino) = tables.by_path.get(path) {
            if let Some(entry) = tables.by_ino.get_mut(&ino) {
                entry.lookups += 1;
            }
            return ino;
        }

        let ino = tables.next_ino;
        tables.next_ino += 1;
        tables.by_ino.insert(
            ino,
            InodeEntry {
                path: path.to_path_buf(),
                lookups: 1,
            },
        );
        tables.by_path.insert(path.to_path_buf(), ino);
        ino
    }

    /// Drop `nlookup` references; the inode goes away at zero
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }

        let mut tables = self.tables.write();
        let drop_path = match tables.by_ino.get_mut(&ino) {
            Some(entry) => {
                entry.lookups = entry.lookups.saturating_sub(nlookup);
                if entry.lookups == 0 {
                    Some(entry.path.clone())
                } else {
                    None
                }
            }
            None => None,
        };

        if let Some(path) = drop_path {
            tables.by_ino.remove(&ino);
            if tables.by_path.get(&path) == Some(&ino) {
                tables.by_path.remove(&path);
            }
        }
    }

    /// Path no longer names this inode (unlink/rmdir)
    ///
    /// The inode itself stays until forgotten so open handles keep working.
    pub fn unlink(&self, path: &Path) {
        self.tables.write().by_path.remove(path);
    }

    /// Move `from` and everything below it to `to`
    pub fn rename(&self, from: &Path, to: &Path) {
        if from == to {
            return;
        }

        let mut tables = self.tables.write();
        let Tables { by_ino, by_path, .. } = &mut *tables;

        // Whatever the rename overwrote loses its name and its inode
        let overwritten: Vec<u64> = by_path
            .iter()
            .filter(|(path, _)| path.starts_with(to))
            .map(|(_, &ino)| ino)
            .collect();
        by_path.retain(|path, _| !path.starts_with(to));
        for ino in overwritten {
            if ino != ROOT_INO {
                by_ino.remove(&ino);
            }
        }

        let moved: Vec<(PathBuf, u64)> = by_path
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, &ino)| (path.clone(), ino))
            .collect();

        for (old_path, ino) in moved {
            let new_path = match old_path.strip_prefix(from) {
                Ok(rest) if rest.as_os_str().is_empty() => to.to_path_buf(),
                Ok(rest) => to.join(rest),
                Err(_) => continue,
            };

            by_path.remove(&old_path);
            by_path.insert(new_path.clone(), ino);
            if let Some(entry) = by_ino.get_mut(&ino) {
                entry.path = new_path;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tables.read().by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().by_ino.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
