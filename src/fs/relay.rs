//! Path-based operation relay
//!
//! One method per filesystem operation. Each resolves the virtual path
//! against the mount root and hands the call to the matching lower
//! primitive; failures come back as the lower errno, never retried.

use crate::error::{Error, Result};
use crate::scan::{
    ContentScanner, IncidentKind, IncidentLog, ReleaseGate, ReleaseOutcome, ScanReport,
    SecurityIncident, SignatureSet,
};
use nix::sys::stat::{Mode, SFlag, UtimensatFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::AccessFlags;
use std::ffi::OsString;
use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use super::handle::HandleManager;
use super::resolver::PathResolver;

/// Attributes reported by `getattr`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub atime: SystemTime,
    pub ctime: SystemTime,
    pub mtime: SystemTime,
    pub gid: u32,
    pub mode: u32,
    pub nlink: u64,
    pub size: u64,
    pub uid: u32,
}

impl FileStat {
    fn from_metadata(meta: &fs::Metadata) -> Self {
        Self {
            atime: system_time(meta.atime(), meta.atime_nsec()),
            ctime: system_time(meta.ctime(), meta.ctime_nsec()),
            mtime: system_time(meta.mtime(), meta.mtime_nsec()),
            gid: meta.gid(),
            mode: meta.mode(),
            nlink: meta.nlink(),
            size: meta.size(),
            uid: meta.uid(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }
}

/// Filesystem statistics reported by `statfs`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsStat {
    pub bavail: u64,
    pub bfree: u64,
    pub blocks: u64,
    pub bsize: u64,
    pub favail: u64,
    pub ffree: u64,
    pub files: u64,
    pub flag: u64,
    pub frsize: u64,
    pub namemax: u64,
}

/// One `readdir` entry
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: OsString,
    /// `None` when the lower filesystem could not say
    pub file_type: Option<fs::FileType>,
    /// Lower inode number, 0 for `.` and `..`
    pub ino: u64,
}

impl DirEntry {
    fn dot(name: &str) -> Self {
        Self {
            name: OsString::from(name),
            file_type: None,
            ino: 0,
        }
    }
}

fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + Duration::from_nanos(nsecs as u64)
    }
}

fn timespec(time: Option<SystemTime>) -> TimeSpec {
    match time {
        Some(t) => TimeSpec::from_duration(t.duration_since(UNIX_EPOCH).unwrap_or_default()),
        None => TimeSpec::new(0, libc::UTIME_OMIT),
    }
}

/// Relays filesystem operations to the lower tree
pub struct OperationRelay {
    resolver: PathResolver,
    handles: HandleManager,
    gate: ReleaseGate,
}

impl OperationRelay {
    /// Create a relay over `root`
    ///
    /// The root is canonicalised once and never changes afterwards.
    pub fn new(
        root: impl AsRef<Path>,
        signatures: Arc<SignatureSet>,
        incidents: Arc<IncidentLog>,
    ) -> Result<Self> {
        let root = root.as_ref();
        let root = fs::canonicalize(root)
            .map_err(|_| Error::PathNotFound(root.to_string_lossy().to_string()))?;
        if !root.is_dir() {
            return Err(Error::PathNotFound(root.to_string_lossy().to_string()));
        }

        Ok(Self {
            resolver: PathResolver::new(root),
            handles: HandleManager::new(),
            gate: ReleaseGate::new(ContentScanner::new(signatures), incidents),
        })
    }

    pub fn root(&self) -> &Path {
        self.resolver.root()
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.resolver.resolve(path)
    }

    pub fn incidents(&self) -> &Arc<IncidentLog> {
        self.gate.incidents()
    }

    /// Number of handles not yet released
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Walk the whole lower tree once, reporting but not removing matches
    pub fn scan_mount_root(&self) -> Result<ScanReport> {
        let report = self.gate.scanner().scan_report(self.root(), true)?;

        for found in &report.matches {
            let virtual_path = self
                .resolver
                .to_virtual(&found.path)
                .unwrap_or_else(|| found.path.clone());
            self.incidents().record(
                SecurityIncident::new(IncidentKind::Detected, virtual_path)
                    .with_digest(found.digest.clone())
                    .with_detail("present at mount time"),
            );
        }

        info!(
            "Mount scan: {} files, {} blacklisted, {} unreadable",
            report.files_scanned,
            report.matches.len(),
            report.unreadable.len()
        );
        Ok(report)
    }

    pub fn access(&self, path: &Path, mask: i32) -> Result<()> {
        let resolved = self.resolve(path);
        nix::unistd::access(resolved.as_path(), AccessFlags::from_bits_truncate(mask))
            .map_err(|_| Error::PermissionDenied(path.display().to_string()))
    }

    pub fn getattr(&self, path: &Path) -> Result<FileStat> {
        let meta = fs::symlink_metadata(self.resolve(path))?;
        Ok(FileStat::from_metadata(&meta))
    }

    pub fn statfs(&self, path: &Path) -> Result<FsStat> {
        let resolved = self.resolve(path);
        let st = nix::sys::statvfs::statvfs(resolved.as_path())?;
        Ok(FsStat {
            bavail: st.blocks_available() as u64,
            bfree: st.blocks_free() as u64,
            blocks: st.blocks() as u64,
            bsize: st.block_size() as u64,
            favail: st.files_available() as u64,
            ffree: st.files_free() as u64,
            files: st.files() as u64,
            flag: st.flags().bits() as u64,
            frsize: st.fragment_size() as u64,
            namemax: st.name_max() as u64,
        })
    }

    /// Open an existing file with the caller's flags
    pub fn open(&self, path: &Path, flags: i32) -> Result<u64> {
        let accmode = flags & libc::O_ACCMODE;
        let file = OpenOptions::new()
            .read(accmode == libc::O_RDONLY || accmode == libc::O_RDWR)
            .write(accmode == libc::O_WRONLY || accmode == libc::O_RDWR)
            .custom_flags(flags & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_EXCL))
            .open(self.resolve(path))?;

        let fh = self.handles.open(path.to_path_buf(), flags, file);
        debug!("opened {} as fh {}", path.display(), fh);
        Ok(fh)
    }

    /// Create (or truncate) a file, write-only
    pub fn create(&self, path: &Path, mode: u32) -> Result<u64> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(self.resolve(path))?;

        let fh = self
            .handles
            .open(path.to_path_buf(), libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC, file);
        debug!("created {} as fh {}", path.display(), fh);
        Ok(fh)
    }

    pub fn read(&self, _path: &Path, size: u32, offset: u64, fh: u64) -> Result<Vec<u8>> {
        self.handles.get(fh)?.read_at(offset, size)
    }

    pub fn write(&self, _path: &Path, data: &[u8], offset: u64, fh: u64) -> Result<usize> {
        self.handles.get(fh)?.write_at(offset, data)
    }

    /// `.` and `..` followed by the lower entries in listing order
    pub fn readdir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let mut entries = vec![DirEntry::dot("."), DirEntry::dot("..")];

        for entry in fs::read_dir(self.resolve(path))? {
            let entry = entry?;
            entries.push(DirEntry {
                name: entry.file_name(),
                file_type: entry.file_type().ok(),
                ino: std::os::unix::fs::DirEntryExt::ino(&entry),
            });
        }

        Ok(entries)
    }

    pub fn flush(&self, _path: &Path, fh: u64) -> Result<()> {
        self.handles.get(fh)?.sync_all()
    }

    pub fn fsync(&self, _path: &Path, datasync: bool, fh: u64) -> Result<()> {
        let handle = self.handles.get(fh)?;
        if datasync {
            handle.sync_data()
        } else {
            handle.sync_all()
        }
    }

    /// Both paths resolve directly against the mount root
    pub fn rename(&self, old: &Path, new: &Path) -> Result<()> {
        fs::rename(self.resolve(old), self.resolve(new))?;
        self.handles.rename_path(old, new);
        Ok(())
    }

    pub fn truncate(&self, path: &Path, length: u64) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.resolve(path))?;
        file.set_len(length)?;
        Ok(())
    }

    /// Truncate through an already-open handle
    pub fn ftruncate(&self, fh: u64, length: u64) -> Result<()> {
        self.handles.get(fh)?.set_len(length)
    }

    /// Hard link: `target` is the new name, `source` the existing file
    pub fn link(&self, target: &Path, source: &Path) -> Result<()> {
        fs::hard_link(self.resolve(source), self.resolve(target))?;
        Ok(())
    }

    /// Symlink at `target` whose content is `source`, stored verbatim
    pub fn symlink(&self, target: &Path, source: &Path) -> Result<()> {
        std::os::unix::fs::symlink(source, self.resolve(target))?;
        Ok(())
    }

    pub fn readlink(&self, path: &Path) -> Result<PathBuf> {
        Ok(fs::read_link(self.resolve(path))?)
    }

    pub fn unlink(&self, path: &Path) -> Result<()> {
        Ok(fs::remove_file(self.resolve(path))?)
    }

    pub fn rmdir(&self, path: &Path) -> Result<()> {
        Ok(fs::remove_dir(self.resolve(path))?)
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        Ok(DirBuilder::new().mode(mode).create(self.resolve(path))?)
    }

    pub fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> Result<()> {
        let resolved = self.resolve(path);
        nix::sys::stat::mknod(
            resolved.as_path(),
            SFlag::from_bits_truncate(mode & libc::S_IFMT),
            Mode::from_bits_truncate(mode & !libc::S_IFMT),
            rdev as libc::dev_t,
        )?;
        Ok(())
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        Ok(fs::set_permissions(
            self.resolve(path),
            Permissions::from_mode(mode),
        )?)
    }

    pub fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        Ok(std::os::unix::fs::chown(self.resolve(path), uid, gid)?)
    }

    /// `None` leaves that timestamp unchanged
    pub fn utimens(
        &self,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        let resolved = self.resolve(path);
        nix::sys::stat::utimensat(
            None,
            resolved.as_path(),
            &timespec(atime),
            &timespec(mtime),
            UtimensatFlags::FollowSymlink,
        )?;
        Ok(())
    }

    pub fn getxattr(&self, _path: &Path, _name: &std::ffi::OsStr) -> Result<Vec<u8>> {
        Err(Error::NotSupported("getxattr"))
    }

    pub fn listxattr(&self, _path: &Path) -> Result<Vec<u8>> {
        Err(Error::NotSupported("listxattr"))
    }

    /// Run the release gate, then close the descriptor
    ///
    /// The handle leaves the table before the gate runs, so a handle can
    /// only ever be released once.
    pub fn release(&self, _path: &Path, fh: u64) -> Result<ReleaseOutcome> {
        let handle = self.handles.take(fh)?;
        let virtual_path = handle.path();
        let concrete = self.resolve(&virtual_path);

        self.gate
            .release(&handle, &concrete)?
            .into_result(&virtual_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::DigestAlgorithm;
    use tempfile::{tempdir, TempDir};

    fn relay_with(bad: &[&[u8]]) -> (TempDir, OperationRelay) {
        let dir = tempdir().unwrap();
        let digests: Vec<String> = bad
            .iter()
            .map(|b| DigestAlgorithm::Sha1.digest_bytes(b))
            .collect();
        let relay = OperationRelay::new(
            dir.path(),
            Arc::new(SignatureSet::new(DigestAlgorithm::Sha1, digests)),
            Arc::new(IncidentLog::new(32)),
        )
        .unwrap();
        (dir, relay)
    }

    fn names(entries: &[DirEntry]) -> Vec<String> {
        entries
            .iter()
            .map(|e| e.name.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_missing_root() {
        let dir = tempdir().unwrap();
        let result = OperationRelay::new(
            dir.path().join("nope"),
            Arc::new(SignatureSet::parse(DigestAlgorithm::Sha1, "")),
            Arc::new(IncidentLog::new(1)),
        );
        assert!(matches!(result, Err(Error::PathNotFound(_))));
    }

    #[test]
    fn test_write_read_round_trip() {
        let (_dir, relay) = relay_with(&[]);
        let path = Path::new("/a");

        let fh = relay.create(path, 0o644).unwrap();
        assert_eq!(relay.write(path, b"hello world", 0, fh).unwrap(), 11);
        relay.release(path, fh).unwrap();

        let fh = relay.open(path, libc::O_RDONLY).unwrap();
        assert_eq!(relay.read(path, 64, 0, fh).unwrap(), b"hello world");
        assert_eq!(relay.read(path, 5, 6, fh).unwrap(), b"world");
        relay.release(path, fh).unwrap();
    }

    #[test]
    fn test_create_truncates_existing() {
        let (dir, relay) = relay_with(&[]);
        fs::write(dir.path().join("t"), b"old content").unwrap();

        let fh = relay.create(Path::new("/t"), 0o600).unwrap();
        relay.write(Path::new("/t"), b"new", 0, fh).unwrap();
        relay.release(Path::new("/t"), fh).unwrap();

        assert_eq!(fs::read(dir.path().join("t")).unwrap(), b"new");
    }

    #[test]
    fn test_getattr_projection() {
        let (dir, relay) = relay_with(&[]);
        fs::write(dir.path().join("f"), b"12345").unwrap();

        let stat = relay.getattr(Path::new("/f")).unwrap();
        let meta = fs::metadata(dir.path().join("f")).unwrap();
        assert_eq!(stat.size, 5);
        assert_eq!(stat.nlink, 1);
        assert_eq!(stat.uid, meta.uid());
        assert_eq!(stat.mode & libc::S_IFMT, libc::S_IFREG);
        assert!(!stat.is_dir());
        assert_eq!(stat.mtime, meta.modified().unwrap());

        let err = relay.getattr(Path::new("/missing")).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[test]
    fn test_statfs() {
        let (_dir, relay) = relay_with(&[]);
        let st = relay.statfs(Path::new("/")).unwrap();
        assert!(st.bsize > 0);
        assert!(st.namemax > 0);
        assert!(st.bfree >= st.bavail);
    }

    #[test]
    fn test_readdir_new_directory() {
        let (_dir, relay) = relay_with(&[]);
        relay.mkdir(Path::new("/d"), 0o755).unwrap();

        let entries = relay.readdir(Path::new("/d")).unwrap();
        assert_eq!(names(&entries), vec![".", ".."]);
    }

    #[test]
    fn test_readdir_lists_everything_once() {
        let (dir, relay) = relay_with(&[]);
        fs::write(dir.path().join("one"), b"1").unwrap();
        fs::write(dir.path().join("two"), b"2").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let mut listed = names(&relay.readdir(Path::new("/")).unwrap());
        assert_eq!(&listed[..2], &[".", ".."]);
        listed.sort();
        assert_eq!(listed, vec![".", "..", "one", "sub", "two"]);
    }

    #[test]
    fn test_rename() {
        let (dir, relay) = relay_with(&[]);
        fs::write(dir.path().join("old"), b"payload").unwrap();

        relay.rename(Path::new("/old"), Path::new("/new")).unwrap();

        let fh = relay.open(Path::new("/new"), libc::O_RDONLY).unwrap();
        assert_eq!(relay.read(Path::new("/new"), 32, 0, fh).unwrap(), b"payload");
        relay.release(Path::new("/new"), fh).unwrap();

        let err = relay.open(Path::new("/old"), libc::O_RDONLY).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[test]
    fn test_rename_while_open_scans_new_path() {
        let (dir, relay) = relay_with(&[b"virus"]);
        let fh = relay.create(Path::new("/tmp.part"), 0o644).unwrap();
        relay.write(Path::new("/tmp.part"), b"virus", 0, fh).unwrap();

        relay.rename(Path::new("/tmp.part"), Path::new("/final")).unwrap();
        let outcome = relay.release(Path::new("/tmp.part"), fh).unwrap();

        assert!(matches!(outcome, ReleaseOutcome::Purged { .. }));
        assert!(!dir.path().join("final").exists());
        assert!(relay
            .incidents()
            .contains(IncidentKind::Purged, Path::new("/final")));
    }

    #[test]
    fn test_truncate() {
        let (dir, relay) = relay_with(&[]);
        fs::write(dir.path().join("f"), b"0123456789").unwrap();

        relay.truncate(Path::new("/f"), 4).unwrap();
        assert_eq!(fs::read(dir.path().join("f")).unwrap(), b"0123");

        let fh = relay.open(Path::new("/f"), libc::O_RDWR).unwrap();
        relay.ftruncate(fh, 1).unwrap();
        relay.release(Path::new("/f"), fh).unwrap();
        assert_eq!(fs::read(dir.path().join("f")).unwrap(), b"0");
    }

    #[test]
    fn test_links() {
        let (dir, relay) = relay_with(&[]);
        fs::write(dir.path().join("src"), b"data").unwrap();

        relay.link(Path::new("/hard"), Path::new("/src")).unwrap();
        assert_eq!(fs::read(dir.path().join("hard")).unwrap(), b"data");
        assert_eq!(relay.getattr(Path::new("/src")).unwrap().nlink, 2);

        relay.symlink(Path::new("/soft"), Path::new("src")).unwrap();
        assert_eq!(relay.readlink(Path::new("/soft")).unwrap(), PathBuf::from("src"));
        assert_eq!(fs::read(dir.path().join("soft")).unwrap(), b"data");
    }

    #[test]
    fn test_unlink_and_rmdir() {
        let (dir, relay) = relay_with(&[]);
        fs::write(dir.path().join("f"), b"").unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();

        relay.unlink(Path::new("/f")).unwrap();
        relay.rmdir(Path::new("/d")).unwrap();
        assert!(!dir.path().join("f").exists());
        assert!(!dir.path().join("d").exists());

        assert_eq!(relay.rmdir(Path::new("/d")).unwrap_err().errno(), libc::ENOENT);
    }

    #[test]
    fn test_mknod_fifo() {
        let (dir, relay) = relay_with(&[]);
        relay
            .mknod(Path::new("/pipe"), libc::S_IFIFO | 0o644, 0)
            .unwrap();
        let meta = fs::symlink_metadata(dir.path().join("pipe")).unwrap();
        assert_eq!(meta.mode() & libc::S_IFMT, libc::S_IFIFO);
    }

    #[test]
    fn test_chmod_and_utimens() {
        let (dir, relay) = relay_with(&[]);
        fs::write(dir.path().join("f"), b"").unwrap();

        relay.chmod(Path::new("/f"), 0o600).unwrap();
        assert_eq!(relay.getattr(Path::new("/f")).unwrap().mode & 0o777, 0o600);

        let stamp = UNIX_EPOCH + Duration::from_secs(1_000_000_000);
        relay.utimens(Path::new("/f"), None, Some(stamp)).unwrap();
        assert_eq!(relay.getattr(Path::new("/f")).unwrap().mtime, stamp);
    }

    #[test]
    fn test_chown_to_self() {
        let (dir, relay) = relay_with(&[]);
        fs::write(dir.path().join("f"), b"").unwrap();
        let meta = fs::metadata(dir.path().join("f")).unwrap();

        relay
            .chown(Path::new("/f"), Some(meta.uid()), Some(meta.gid()))
            .unwrap();
        relay.chown(Path::new("/f"), None, None).unwrap();
    }

    #[test]
    fn test_access() {
        let (dir, relay) = relay_with(&[]);
        fs::write(dir.path().join("f"), b"").unwrap();

        relay.access(Path::new("/f"), libc::F_OK).unwrap();
        let err = relay.access(Path::new("/missing"), libc::F_OK).unwrap_err();
        assert_eq!(err.errno(), libc::EACCES);
    }

    #[test]
    fn test_xattr_unsupported() {
        let (_dir, relay) = relay_with(&[]);
        let err = relay
            .getxattr(Path::new("/"), std::ffi::OsStr::new("user.x"))
            .unwrap_err();
        assert_eq!(err.errno(), libc::ENOSYS);
        assert_eq!(relay.listxattr(Path::new("/")).unwrap_err().errno(), libc::ENOSYS);
    }

    #[test]
    fn test_flush_and_fsync() {
        let (_dir, relay) = relay_with(&[]);
        let fh = relay.create(Path::new("/s"), 0o644).unwrap();
        relay.write(Path::new("/s"), b"sync me", 0, fh).unwrap();

        relay.flush(Path::new("/s"), fh).unwrap();
        relay.fsync(Path::new("/s"), true, fh).unwrap();
        relay.fsync(Path::new("/s"), false, fh).unwrap();
        relay.release(Path::new("/s"), fh).unwrap();

        assert_eq!(relay.flush(Path::new("/s"), fh).unwrap_err().errno(), libc::EBADF);
    }

    #[test]
    fn test_double_release() {
        let (_dir, relay) = relay_with(&[]);
        let fh = relay.create(Path::new("/x"), 0o644).unwrap();

        relay.release(Path::new("/x"), fh).unwrap();
        let err = relay.release(Path::new("/x"), fh).unwrap_err();
        assert_eq!(err.errno(), libc::EBADF);
        assert_eq!(relay.open_handles(), 0);
    }

    #[test]
    fn test_release_after_external_delete() {
        let (dir, relay) = relay_with(&[b"virus"]);
        let fh = relay.create(Path::new("/v"), 0o644).unwrap();
        fs::remove_file(dir.path().join("v")).unwrap();

        let err = relay.release(Path::new("/v"), fh).unwrap_err();
        assert!(matches!(err, Error::ScanFailed { .. }));
        assert_eq!(relay.open_handles(), 0);
        assert!(relay
            .incidents()
            .contains(IncidentKind::ScanFailed, Path::new("/v")));
    }

    #[test]
    fn test_scan_mount_root_reports_only() {
        let (dir, relay) = relay_with(&[b"virus"]);
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested/bad"), b"virus").unwrap();
        fs::write(dir.path().join("good"), b"fine").unwrap();

        let report = relay.scan_mount_root().unwrap();
        assert_eq!(report.matches.len(), 1);
        assert!(dir.path().join("nested/bad").exists());
        assert!(relay
            .incidents()
            .contains(IncidentKind::Detected, Path::new("/nested/bad")));
    }
}
