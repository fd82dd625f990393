//! File handle management
//!
//! Each open handle owns its descriptor behind a mutex. Reads and writes
//! seek the shared descriptor offset and then transfer, so the pair has to
//! run under that lock or a concurrent seek lands between them.

use crate::error::{Error, Result};
use crate::scan::GateState;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Represents an open file
pub struct OpenHandle {
    /// Handle number handed to the bridge
    pub fh: u64,
    /// Open flags
    pub flags: i32,
    /// Virtual path, updated when the file is renamed while open
    path: RwLock<PathBuf>,
    /// Descriptor; `None` once closed. Held across every seek+transfer pair.
    io: Mutex<Option<File>>,
    state: Mutex<GateState>,
}

impl OpenHandle {
    pub fn new(fh: u64, path: PathBuf, flags: i32, file: File) -> Self {
        OpenHandle {
            fh,
            flags,
            path: RwLock::new(path),
            io: Mutex::new(Some(file)),
            state: Mutex::new(GateState::Open),
        }
    }

    /// Virtual path the handle currently refers to
    pub fn path(&self) -> PathBuf {
        self.path.read().clone()
    }

    pub fn set_path(&self, path: PathBuf) {
        *self.path.write() = path;
    }

    /// Check if opened for reading
    pub fn is_readable(&self) -> bool {
        let mode = self.flags & libc::O_ACCMODE;
        mode == libc::O_RDONLY || mode == libc::O_RDWR
    }

    /// Check if opened for writing
    pub fn is_writable(&self) -> bool {
        let mode = self.flags & libc::O_ACCMODE;
        mode == libc::O_WRONLY || mode == libc::O_RDWR
    }

    /// Seek to `offset` and read up to `size` bytes
    pub fn read_at(&self, offset: u64, size: u32) -> Result<Vec<u8>> {
        if !self.is_readable() {
            return Err(Error::BadHandle(self.fh));
        }

        let mut io = self.io.lock();
        let file = io.as_mut().ok_or(Error::BadHandle(self.fh))?;

        file.seek(SeekFrom::Start(offset))?;

        let mut buffer = Vec::with_capacity(size as usize);
        Read::by_ref(file).take(size as u64).read_to_end(&mut buffer)?;
        Ok(buffer)
    }

    /// Seek to `offset` and write all of `data`
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        if !self.is_writable() {
            return Err(Error::BadHandle(self.fh));
        }

        let mut io = self.io.lock();
        let file = io.as_mut().ok_or(Error::BadHandle(self.fh))?;

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(data.len())
    }

    /// Sync data and metadata
    pub fn sync_all(&self) -> Result<()> {
        self.with_file(|file| file.sync_all())
    }

    /// Sync data only
    pub fn sync_data(&self) -> Result<()> {
        self.with_file(|file| file.sync_data())
    }

    pub fn set_len(&self, len: u64) -> Result<()> {
        self.with_file(|file| file.set_len(len))
    }

    fn with_file<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&File) -> std::io::Result<()>,
    {
        let io = self.io.lock();
        let file = io.as_ref().ok_or(Error::BadHandle(self.fh))?;
        f(file).map_err(Error::Io)
    }

    /// Run `f` with the descriptor locked, then drop the descriptor
    ///
    /// No transfer through this handle can land between `f` and the close.
    pub fn close_after<T, F>(&self, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let mut io = self.io.lock();
        let result = f();
        io.take();
        result
    }

    pub fn is_closed(&self) -> bool {
        self.io.lock().is_none()
    }

    pub fn state(&self) -> GateState {
        *self.state.lock()
    }

    /// Move `from -> to`; any other current state means the handle was
    /// already released
    pub fn transition(&self, from: GateState, to: GateState) -> Result<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(Error::BadHandle(self.fh));
        }
        *state = to;
        Ok(())
    }
}

/// Manages open file handles
pub struct HandleManager {
    /// Next handle ID
    next_fh: AtomicU64,
    /// Open handles
    handles: RwLock<HashMap<u64, Arc<OpenHandle>>>,
}

impl HandleManager {
    /// Create a new handle manager
    pub fn new() -> Self {
        HandleManager {
            next_fh: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Register an opened file and return its handle number
    pub fn open(&self, path: PathBuf, flags: i32, file: File) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        let handle = OpenHandle::new(fh, path, flags, file);
        self.handles.write().insert(fh, Arc::new(handle));
        fh
    }

    /// Get a handle by number
    pub fn get(&self, fh: u64) -> Result<Arc<OpenHandle>> {
        self.handles
            .read()
            .get(&fh)
            .cloned()
            .ok_or(Error::BadHandle(fh))
    }

    /// Remove a handle from the table; it can only be taken once
    pub fn take(&self, fh: u64) -> Result<Arc<OpenHandle>> {
        self.handles.write().remove(&fh).ok_or(Error::BadHandle(fh))
    }

    /// Check if a handle is valid
    pub fn is_valid(&self, fh: u64) -> bool {
        self.handles.read().contains_key(&fh)
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }

    /// Repoint open handles at or below `from` to live under `to`
    pub fn rename_path(&self, from: &Path, to: &Path) {
        for handle in self.handles.read().values() {
            let current = handle.path();
            if let Ok(rest) = current.strip_prefix(from) {
                let moved = if rest.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(rest)
                };
                handle.set_path(moved);
            }
        }
    }
}

impl Default for HandleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    fn scratch_file(dir: &Path, name: &str, content: &[u8]) -> File {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap()
    }

    #[test]
    fn test_handle_flags() {
        let dir = tempdir().unwrap();
        let read_handle = OpenHandle::new(1, "/f".into(), libc::O_RDONLY, scratch_file(dir.path(), "f", b""));
        assert!(read_handle.is_readable());
        assert!(!read_handle.is_writable());

        let rw_handle = OpenHandle::new(2, "/f".into(), libc::O_RDWR, scratch_file(dir.path(), "f", b""));
        assert!(rw_handle.is_readable());
        assert!(rw_handle.is_writable());
    }

    #[test]
    fn test_offset_read_write() {
        let dir = tempdir().unwrap();
        let handle = OpenHandle::new(1, "/f".into(), libc::O_RDWR, scratch_file(dir.path(), "f", b"0123456789"));

        assert_eq!(handle.write_at(4, b"ab").unwrap(), 2);
        assert_eq!(handle.read_at(2, 5).unwrap(), b"23ab6");
        // Short read at end of file
        assert_eq!(handle.read_at(8, 100).unwrap(), b"89");
        assert!(handle.read_at(50, 10).unwrap().is_empty());
    }

    #[test]
    fn test_closed_handle_rejects_io() {
        let dir = tempdir().unwrap();
        let handle = OpenHandle::new(9, "/f".into(), libc::O_RDWR, scratch_file(dir.path(), "f", b"x"));

        handle.close_after(|| ());
        assert!(handle.is_closed());
        assert!(matches!(handle.read_at(0, 1), Err(Error::BadHandle(9))));
        assert!(matches!(handle.sync_all(), Err(Error::BadHandle(9))));
    }

    #[test]
    fn test_access_mode_enforced() {
        let dir = tempdir().unwrap();
        let write_only = OpenHandle::new(5, "/f".into(), libc::O_WRONLY, scratch_file(dir.path(), "f", b"abc"));
        let read_only = OpenHandle::new(6, "/f".into(), libc::O_RDONLY, scratch_file(dir.path(), "f", b"abc"));

        assert!(matches!(write_only.read_at(0, 3), Err(Error::BadHandle(5))));
        assert!(matches!(read_only.write_at(0, b"x"), Err(Error::BadHandle(6))));
        assert_eq!(read_only.read_at(0, 3).unwrap(), b"abc");
    }

    #[test]
    fn test_close_after_holds_out_writers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        let handle = Arc::new(OpenHandle::new(4, "/f".into(), libc::O_RDWR, scratch_file(dir.path(), "f", b"ok")));
        let (tx, rx) = mpsc::channel();

        let seen = handle.close_after(|| {
            let writer = Arc::clone(&handle);
            thread::spawn(move || {
                tx.send(writer.write_at(0, b"late").map(|_| ())).unwrap();
            });
            thread::sleep(Duration::from_millis(50));
            // Writer is parked on the descriptor lock
            assert!(rx.try_recv().is_err());
            std::fs::read(&path).unwrap()
        });

        assert_eq!(seen, b"ok");
        assert!(matches!(rx.recv().unwrap(), Err(Error::BadHandle(4))));
        assert_eq!(std::fs::read(&path).unwrap(), b"ok");
    }

    #[test]
    fn test_transition_guard() {
        let dir = tempdir().unwrap();
        let handle = OpenHandle::new(3, "/f".into(), libc::O_RDONLY, scratch_file(dir.path(), "f", b""));

        assert_eq!(handle.state(), GateState::Open);
        handle.transition(GateState::Open, GateState::Closing).unwrap();
        assert!(handle.transition(GateState::Open, GateState::Closing).is_err());
    }

    #[test]
    fn test_handle_manager() {
        let dir = tempdir().unwrap();
        let manager = HandleManager::new();

        let fh1 = manager.open("/a".into(), libc::O_RDONLY, scratch_file(dir.path(), "a", b""));
        let fh2 = manager.open("/b".into(), libc::O_RDWR, scratch_file(dir.path(), "b", b""));

        assert_ne!(fh1, fh2);
        assert!(manager.is_valid(fh1));
        assert!(!manager.is_valid(999));

        manager.take(fh1).unwrap();
        assert!(!manager.is_valid(fh1));
        assert!(matches!(manager.take(fh1), Err(Error::BadHandle(_))));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_rename_path() {
        let dir = tempdir().unwrap();
        let manager = HandleManager::new();
        let inner = manager.open("/d/x".into(), libc::O_RDONLY, scratch_file(dir.path(), "x", b""));
        let other = manager.open("/dx".into(), libc::O_RDONLY, scratch_file(dir.path(), "y", b""));

        manager.rename_path(Path::new("/d"), Path::new("/e"));

        assert_eq!(manager.get(inner).unwrap().path(), PathBuf::from("/e/x"));
        assert_eq!(manager.get(other).unwrap().path(), PathBuf::from("/dx"));
    }
}
