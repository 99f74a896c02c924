//! Kernel-facing dispatcher
//!
//! Implements `fuser::Filesystem` on top of [`RemoteFs`]. The kernel speaks in
//! inode numbers, so every request first resolves its inode through the
//! [`InodeTable`], then blocks on the path-addressed async operation.
//!
//! fuser delivers requests one at a time through `&mut self`, so a slow remote
//! call holds up every other request on the mount until it returns.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use libc::c_int;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use common::fs::BLOCK_SIZE;
use common::{path, EntryKind, FileAttributes, FsError, RemoteFs};

use super::inode_table::InodeTable;

/// FUSE front end for a [`RemoteFs`]
pub struct RemoteFuse {
    rt: Handle,
    fs: Arc<RemoteFs>,
    inodes: Mutex<InodeTable>,
    read_only: bool,
}

impl RemoteFuse {
    /// How long the kernel may trust attributes and entries
    const ATTR_TTL: Duration = Duration::from_secs(1);

    pub fn new(rt: Handle, fs: Arc<RemoteFs>, read_only: bool) -> Self {
        Self {
            rt,
            fs,
            inodes: Mutex::new(InodeTable::new()),
            read_only,
        }
    }

    fn make_attr(ino: u64, attrs: &FileAttributes) -> FileAttr {
        let kind = match attrs.kind {
            EntryKind::Folder => FileType::Directory,
            EntryKind::File => FileType::RegularFile,
        };

        FileAttr {
            ino,
            size: attrs.size,
            blocks: attrs.size.div_ceil(BLOCK_SIZE),
            atime: attrs.atime,
            mtime: attrs.mtime,
            ctime: attrs.mtime,
            crtime: attrs.mtime,
            kind,
            perm: attrs.perm,
            nlink: attrs.nlink,
            uid: attrs.uid,
            gid: attrs.gid,
            rdev: 0,
            blksize: BLOCK_SIZE as u32,
            flags: 0,
        }
    }

    fn path_of(&self, ino: u64) -> Result<String, c_int> {
        self.inodes
            .lock()
            .get_path(ino)
            .map(str::to_string)
            .ok_or(libc::ENOENT)
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> Result<String, c_int> {
        let name = name.to_str().ok_or(libc::EINVAL)?;
        self.inodes
            .lock()
            .child_path(parent, name)
            .ok_or(libc::ENOENT)
    }

    fn attr_of(&self, path: &str) -> Result<FileAttr, c_int> {
        let attrs = self.rt.block_on(self.fs.attributes(path)).map_err(errno)?;
        let ino = self.inodes.lock().get_or_create(path);
        Ok(Self::make_attr(ino, &attrs))
    }

    fn writable(&self) -> Result<(), c_int> {
        if self.read_only {
            Err(libc::EROFS)
        } else {
            Ok(())
        }
    }

    fn setattr_path(
        &self,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
    ) -> Result<FileAttr, c_int> {
        let path = self.path_of(ino)?;
        if let Some(size) = size {
            self.writable()?;
            self.rt
                .block_on(self.fs.truncate(&path, size))
                .map_err(errno)?;
        }
        if let Some(mode) = mode {
            self.rt.block_on(self.fs.chmod(&path, mode)).map_err(errno)?;
        }
        if uid.is_some() || gid.is_some() {
            self.rt
                .block_on(self.fs.chown(&path, uid, gid))
                .map_err(errno)?;
        }
        self.attr_of(&path)
    }

    fn listing(&self, ino: u64) -> Result<Vec<(u64, FileType, String)>, c_int> {
        let folder = self.path_of(ino)?;
        let names = self.rt.block_on(self.fs.list(&folder)).map_err(errno)?;

        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let entry = match name.as_str() {
                "." => (ino, FileType::Directory, name),
                ".." => {
                    let parent = self.inodes.lock().get_or_create(&path::parent(&folder));
                    (parent, FileType::Directory, name)
                }
                _ => {
                    let child = path::join(&folder, &name);
                    // Children were cached by the listing, so this stays local
                    let attrs = self.rt.block_on(self.fs.attributes(&child));
                    let kind = match attrs {
                        Ok(attrs) if attrs.is_folder() => FileType::Directory,
                        Ok(_) => FileType::RegularFile,
                        Err(FsError::NotFound(_)) => continue,
                        Err(e) => return Err(e.errno()),
                    };
                    (self.inodes.lock().get_or_create(&child), kind, name)
                }
            };
            entries.push(entry);
        }
        Ok(entries)
    }

    fn remove(&self, parent: u64, name: &OsStr, folder: bool) -> Result<(), c_int> {
        self.writable()?;
        let path = self.child_of(parent, name)?;
        let removed = if folder {
            self.rt.block_on(self.fs.delete_folder(&path))
        } else {
            self.rt.block_on(self.fs.delete_file(&path))
        };
        removed.map_err(errno)?;
        self.inodes.lock().remove_by_path(&path);
        Ok(())
    }
}

fn errno(e: FsError) -> c_int {
    e.errno()
}

fn file_offset(value: i64) -> Result<u64, c_int> {
    u64::try_from(value).map_err(|_| libc::EINVAL)
}

impl Filesystem for RemoteFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        tracing::info!(read_only = self.read_only, "FUSE filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!(
            open_handles = self.fs.handles().len(),
            "FUSE filesystem destroyed"
        );
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.child_of(parent, name).and_then(|path| self.attr_of(&path)) {
            Ok(attr) => reply.entry(&Self::ATTR_TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.path_of(ino).and_then(|path| self.attr_of(&path)) {
            Ok(attr) => reply.attr(&Self::ATTR_TTL, &attr),
            Err(e) => reply.error(e),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        match self.setattr_path(ino, mode, uid, gid, size) {
            Ok(attr) => reply.attr(&Self::ATTR_TTL, &attr),
            Err(e) => reply.error(e),
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
        let entries = match self.listing(ino) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(skip) {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self.writable().and_then(|_| {
            let path = self.child_of(parent, name)?;
            self.rt
                .block_on(self.fs.create_folder(&path))
                .map_err(errno)?;
            self.attr_of(&path)
        });
        match result {
            Ok(attr) => reply.entry(&Self::ATTR_TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.remove(parent, name, false) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.remove(parent, name, true) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let result = self.writable().and_then(|_| {
            let from = self.child_of(parent, name)?;
            let to = self.child_of(newparent, newname)?;
            self.rt
                .block_on(self.fs.rename(&from, &to))
                .map_err(errno)?;
            self.inodes.lock().rename(&from, &to);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let result = self.path_of(ino).and_then(|path| {
            if flags & libc::O_ACCMODE != libc::O_RDONLY {
                self.writable()?;
            }
            self.rt.block_on(self.fs.open(&path, flags)).map_err(errno)
        });
        match result {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let result = self.writable().and_then(|_| {
            let path = self.child_of(parent, name)?;
            let fh = self.rt.block_on(self.fs.create(&path)).map_err(errno)?;
            Ok((fh, self.attr_of(&path)?))
        });
        match result {
            Ok((fh, attr)) => reply.created(&Self::ATTR_TTL, &attr, 0, fh, flags as u32),
            Err(e) => reply.error(e),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let result = file_offset(offset).and_then(|offset| {
            self.rt
                .block_on(self.fs.read(fh, size as usize, offset))
                .map_err(errno)
        });
        match result {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let result = file_offset(offset).and_then(|offset| {
            self.rt
                .block_on(self.fs.write(fh, data, offset))
                .map_err(errno)
        });
        match result {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(e),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        match self.rt.block_on(self.fs.flush(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.rt.block_on(self.fs.fsync(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.rt.block_on(self.fs.release(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.rt.block_on(self.fs.statfs()) {
            Ok(stats) => reply.statfs(
                stats.blocks,
                stats.blocks_free,
                stats.blocks_available,
                stats.files,
                0,
                stats.block_size as u32,
                stats.name_max,
                stats.fragment_size as u32,
            ),
            Err(e) => reply.error(e.errno()),
        }
    }

    // Extended attributes are not stored remotely
    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _size: u32,
        reply: ReplyXattr,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn listxattr(&mut self, _req: &Request<'_>, _ino: u64, _size: u32, reply: ReplyXattr) {
        reply.error(libc::ENOTSUP);
    }

    fn removexattr(&mut self, _req: &Request<'_>, _ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::ENOTSUP);
    }
}
