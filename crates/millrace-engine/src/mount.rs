//! Kernel-mount frontend for the write-only filesystem.
//!
//! [`FuseMount`] exposes a [`WriteOnlyFs`] to one child process as a real
//! directory. The adapter is a thin translation layer: inode bookkeeping
//! lives here, every byte of file state lives in the core.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use millrace_types::FileEmission;
use tokio::sync::mpsc;

use crate::wovfs::WriteOnlyFs;

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

/// A mounted write-only output directory.
///
/// Dropping the mount unmounts it; the backing temp directory is removed
/// with it.
pub struct FuseMount {
    dir: tempfile::TempDir,
    fs: Arc<WriteOnlyFs>,
    session: Option<fuser::BackgroundSession>,
}

impl FuseMount {
    /// Mount a fresh write-only filesystem under `tmp_root`.
    ///
    /// # Errors
    ///
    /// Returns an error when the mount directory can't be created or the
    /// kernel refuses the mount (missing fusermount, no /dev/fuse).
    pub fn mount(tmp_root: &Path, tx: mpsc::Sender<FileEmission>) -> anyhow::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("output-")
            .tempdir_in(tmp_root)
            .context("creating mount directory")?;
        let fs = Arc::new(WriteOnlyFs::new(tx));
        let adapter = WovfsAdapter::new(fs.clone());
        let session = fuser::spawn_mount2(
            adapter,
            dir.path(),
            &[MountOption::FSName("millrace".to_string())],
        )
        .with_context(|| format!("mounting write-only fs at {}", dir.path().display()))?;

        tracing::debug!(mount = %dir.path().display(), "output filesystem mounted");
        Ok(Self {
            dir,
            fs,
            session: Some(session),
        })
    }

    /// The directory handed to the child as `OUTPUT_DIR`.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Block until every file opened through the mount has been released
    /// and its emission accepted downstream.
    pub fn wait_for_writes(&self) {
        self.fs.wait_for_writes();
    }

    /// Stop the filesystem (grace period + force drain), unmount, and
    /// remove the mount directory.
    pub fn stop(mut self) {
        self.fs.stop();
        if let Some(session) = self.session.take() {
            session.join();
        }
        // TempDir drop removes the directory.
    }
}

struct WovfsAdapter {
    fs: Arc<WriteOnlyFs>,
    name_to_ino: HashMap<String, u64>,
    ino_to_name: HashMap<u64, String>,
    next_ino: u64,
}

impl WovfsAdapter {
    fn new(fs: Arc<WriteOnlyFs>) -> Self {
        Self {
            fs,
            name_to_ino: HashMap::new(),
            ino_to_name: HashMap::new(),
            next_ino: ROOT_INO + 1,
        }
    }

    fn intern(&mut self, name: &str) -> u64 {
        if let Some(&ino) = self.name_to_ino.get(name) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.name_to_ino.insert(name.to_string(), ino);
        self.ino_to_name.insert(ino, name.to_string());
        ino
    }

    fn name_of(&self, ino: u64) -> Option<&str> {
        self.ino_to_name.get(&ino).map(String::as_str)
    }

    fn attr(ino: u64, size: u64, kind: FileType, req: &Request<'_>) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino,
            size,
            blocks: size.div_ceil(512),
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind,
            // Write-only for everything: 0200, no read, no search.
            perm: 0o200,
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            uid: req.uid(),
            gid: req.gid(),
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn file_attr(&self, name: &str, ino: u64, req: &Request<'_>) -> Option<FileAttr> {
        let size = self.fs.attr_size(name)?;
        Some(Self::attr(ino, size, FileType::RegularFile, req))
    }
}

fn utf8_name(name: &OsStr) -> Option<&str> {
    name.to_str()
}

impl Filesystem for WovfsAdapter {
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent != ROOT_INO {
            reply.error(libc::ENOENT);
            return;
        }
        let Some(name) = utf8_name(name) else {
            reply.error(libc::ENOENT);
            return;
        };
        if self.fs.attr_size(name).is_some() {
            let ino = self.intern(name);
            match self.file_attr(name, ino, req) {
                Some(attr) => reply.entry(&TTL, &attr, 0),
                None => reply.error(libc::ENOENT),
            }
        } else {
            reply.error(libc::ENOENT);
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        if ino == ROOT_INO {
            reply.attr(&TTL, &Self::attr(ROOT_INO, 0, FileType::Directory, req));
            return;
        }
        let Some(name) = self.name_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.file_attr(&name, ino, req) {
            Some(attr) => reply.attr(&TTL, &attr),
            None => reply.error(libc::ENOENT),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
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
        let Some(name) = self.name_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        if let Some(size) = size {
            if let Err(errno) = self.fs.truncate(&name, size) {
                reply.error(errno);
                return;
            }
        }
        match self.file_attr(&name, ino, req) {
            Some(attr) => reply.attr(&TTL, &attr),
            None => reply.error(libc::ENOENT),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        if parent != ROOT_INO {
            reply.error(libc::ENOENT);
            return;
        }
        let Some(name) = utf8_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        if let Err(errno) = self.fs.touch(name) {
            reply.error(errno);
            return;
        }
        let ino = self.intern(name);
        match self.file_attr(name, ino, req) {
            Some(attr) => reply.entry(&TTL, &attr, 0),
            None => reply.error(libc::ENOENT),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        if parent != ROOT_INO {
            reply.error(libc::ENOENT);
            return;
        }
        let Some(name) = utf8_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.create(name) {
            Ok(fh) => {
                let ino = self.intern(name);
                match self.file_attr(name, ino, req) {
                    Some(attr) => reply.created(&TTL, &attr, 0, fh, 0),
                    None => reply.error(libc::ENOENT),
                }
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let read_intent = flags & libc::O_ACCMODE != libc::O_WRONLY;
        let Some(name) = self.name_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.open(&name, read_intent) {
            Ok(fh) => reply.opened(fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
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
        let offset = u64::try_from(offset).unwrap_or(0);
        match self.fs.write(fh, offset, data) {
            Ok(written) => reply.written(written),
            Err(errno) => reply.error(errno),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    #[allow(clippy::too_many_arguments)]
    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        _mode: i32,
        reply: ReplyEmpty,
    ) {
        let offset = u64::try_from(offset).unwrap_or(0);
        let length = u64::try_from(length).unwrap_or(0);
        match self.fs.allocate(fh, offset, length) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
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
        // Blocks the child's close(2) until the ingester accepts the file.
        self.fs.release(fh);
        reply.ok();
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        if parent != ROOT_INO {
            reply.error(libc::ENOENT);
            return;
        }
        let Some(name) = utf8_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        self.fs.unlink(name);
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        // Write-only directory: listing is refused.
        reply.error(libc::EACCES);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        reply: ReplyDirectory,
    ) {
        reply.error(libc::EACCES);
    }
}
