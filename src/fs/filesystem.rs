//! FUSE filesystem implementation
//!
//! Translates fuser's inode-addressed callbacks into path-based relay calls.

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use libc::{EINVAL, ENOENT};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use super::inode::{InodeTable, ROOT_INO};
use super::relay::{FileStat, OperationRelay};

/// Passthrough FUSE filesystem with a release-time content gate
pub struct GuardFs {
    relay: OperationRelay,
    inodes: InodeTable,
    ttl: Duration,
}

fn kind_from_mode(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn kind_from_file_type(ft: std::fs::FileType) -> FileType {
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

/// Convert a relay stat into fuser attributes
fn to_fuser_attr(ino: u64, stat: &FileStat) -> FileAttr {
    FileAttr {
        ino,
        size: stat.size,
        blocks: stat.size.div_ceil(512),
        atime: stat.atime,
        mtime: stat.mtime,
        ctime: stat.ctime,
        crtime: stat.ctime,
        kind: kind_from_mode(stat.mode),
        perm: (stat.mode & 0o7777) as u16,
        nlink: stat.nlink as u32,
        uid: stat.uid,
        gid: stat.gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

fn time_or_now(time: Option<TimeOrNow>) -> Option<SystemTime> {
    time.map(|t| match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    })
}

impl GuardFs {
    pub fn new(relay: OperationRelay, ttl: Duration) -> Self {
        Self {
            relay,
            inodes: InodeTable::new(),
            ttl,
        }
    }

    pub fn relay(&self) -> &OperationRelay {
        &self.relay
    }

    /// Path for an inode, falling back to the root for handle-only calls
    fn path_or_root(&self, ino: u64) -> PathBuf {
        self.inodes.path(ino).unwrap_or_else(|| PathBuf::from("/"))
    }

    /// Stat a freshly created or looked-up path and reply with an entry
    fn reply_entry(&self, path: &Path, reply: ReplyEntry) {
        match self.relay.getattr(path) {
            Ok(stat) => {
                let ino = self.inodes.lookup(path);
                reply.entry(&self.ttl, &to_fuser_attr(ino, &stat), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }
}

impl Filesystem for GuardFs {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        info!("Relaying {}", self.relay.root().display());
        Ok(())
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);

        match self.inodes.child_path(parent, name) {
            Some(path) => self.reply_entry(&path, reply),
            None => reply.error(ENOENT),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);

        let path = match self.inodes.path(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match self.relay.getattr(&path) {
            Ok(stat) => reply.attr(&self.ttl, &to_fuser_attr(ino, &stat)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr(ino={}, mode={:?}, size={:?}, fh={:?})", ino, mode, size, fh);

        let path = match self.inodes.path(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        let result = (|| -> crate::error::Result<FileStat> {
            if let Some(mode) = mode {
                self.relay.chmod(&path, mode)?;
            }
            if uid.is_some() || gid.is_some() {
                self.relay.chown(&path, uid, gid)?;
            }
            if let Some(size) = size {
                match fh {
                    Some(fh) => self.relay.ftruncate(fh, size)?,
                    None => self.relay.truncate(&path, size)?,
                }
            }
            if atime.is_some() || mtime.is_some() {
                self.relay
                    .utimens(&path, time_or_now(atime), time_or_now(mtime))?;
            }
            self.relay.getattr(&path)
        })();

        match result {
            Ok(stat) => reply.attr(&self.ttl, &to_fuser_attr(ino, &stat)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);

        let path = match self.inodes.path(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match self.relay.readlink(&path) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod(parent={}, name={:?}, mode={:o})", parent, name, mode);

        let path = match self.inodes.child_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match self.relay.mknod(&path, mode & !umask, rdev as u64) {
            Ok(()) => self.reply_entry(&path, reply),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?}, mode={:o})", parent, name, mode);

        let path = match self.inodes.child_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match self.relay.mkdir(&path, mode & !umask) {
            Ok(()) => self.reply_entry(&path, reply),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);

        let path = match self.inodes.child_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match self.relay.unlink(&path) {
            Ok(()) => {
                self.inodes.unlink(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);

        let path = match self.inodes.child_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match self.relay.rmdir(&path) {
            Ok(()) => {
                self.inodes.unlink(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink(parent={}, name={:?}, target={:?})", parent, link_name, target);

        let path = match self.inodes.child_path(parent, link_name) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match self.relay.symlink(&path, target) {
            Ok(()) => self.reply_entry(&path, reply),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );

        // RENAME_NOREPLACE / RENAME_EXCHANGE have no std equivalent
        if flags != 0 {
            reply.error(EINVAL);
            return;
        }

        let (old, new) = match (
            self.inodes.child_path(parent, name),
            self.inodes.child_path(newparent, newname),
        ) {
            (Some(old), Some(new)) => (old, new),
            _ => {
                reply.error(ENOENT);
                return;
            }
        };

        match self.relay.rename(&old, &new) {
            Ok(()) => {
                self.inodes.rename(&old, &new);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link(ino={}, newparent={}, newname={:?})", ino, newparent, newname);

        let (source, target) = match (
            self.inodes.path(ino),
            self.inodes.child_path(newparent, newname),
        ) {
            (Some(source), Some(target)) => (source, target),
            _ => {
                reply.error(ENOENT);
                return;
            }
        };

        match self.relay.link(&target, &source) {
            Ok(()) => self.reply_entry(&target, reply),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={})", ino, flags);

        let path = match self.inodes.path(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match self.relay.open(&path, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        if offset < 0 {
            reply.error(EINVAL);
            return;
        }

        let path = self.path_or_root(ino);
        match self.relay.read(&path, size, offset as u64, fh) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());

        if offset < 0 {
            reply.error(EINVAL);
            return;
        }

        let path = self.path_or_root(ino);
        match self.relay.write(&path, data, offset as u64, fh) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush(ino={}, fh={})", ino, fh);

        let path = self.path_or_root(ino);
        match self.relay.flush(&path, fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);

        let path = self.path_or_root(ino);
        match self.relay.release(&path, fh) {
            Ok(_) => reply.ok(),
            Err(e) => {
                warn!("release of fh {} failed: {}", fh, e);
                reply.error(e.errno());
            }
        }
    }

    fn fsync(&mut self, _req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, fh={}, datasync={})", ino, fh, datasync);

        let path = self.path_or_root(ino);
        match self.relay.fsync(&path, datasync, fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);

        let path = match self.inodes.path(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        let entries = match self.relay.readdir(&path) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        let parent_ino = path
            .parent()
            .and_then(|p| self.inodes.get(p))
            .unwrap_or(ROOT_INO);

        for (i, entry) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            let (entry_ino, kind) = match entry.name.as_bytes() {
                b"." => (ino, FileType::Directory),
                b".." => (parent_ino, FileType::Directory),
                _ => {
                    let child = path.join(&entry.name);
                    let entry_ino = self.inodes.get(&child).unwrap_or(entry.ino);
                    let kind = entry
                        .file_type
                        .map(kind_from_file_type)
                        .unwrap_or(FileType::RegularFile);
                    (entry_ino, kind)
                }
            };

            let buffer_full = reply.add(entry_ino, (i + 1) as i64, kind, &entry.name);
            if buffer_full {
                break;
            }
        }

        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        let path = self.path_or_root(ino);
        match self.relay.statfs(&path) {
            Ok(st) => reply.statfs(
                st.blocks,
                st.bfree,
                st.bavail,
                st.files,
                st.ffree,
                st.bsize as u32,
                st.namemax as u32,
                st.frsize as u32,
            ),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, _size: u32, reply: ReplyXattr) {
        let path = self.path_or_root(ino);
        match self.relay.getxattr(&path, name) {
            Ok(value) => reply.data(&value),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, _size: u32, reply: ReplyXattr) {
        let path = self.path_or_root(ino);
        match self.relay.listxattr(&path) {
            Ok(names) => reply.data(&names),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);

        let path = match self.inodes.path(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match self.relay.access(&path, mask) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, mode={:o})", parent, name, mode);

        let path = match self.inodes.child_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        let fh = match self.relay.create(&path, mode & !umask) {
            Ok(fh) => fh,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        match self.relay.getattr(&path) {
            Ok(stat) => {
                let ino = self.inodes.lookup(&path);
                reply.created(&self.ttl, &to_fuser_attr(ino, &stat), 0, fh, 0);
            }
            Err(e) => {
                // Nothing will ever release this handle, so do it here
                let _ = self.relay.release(&path, fh);
                reply.error(e.errno());
            }
        }
    }
}
