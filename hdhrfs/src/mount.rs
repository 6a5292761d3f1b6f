//! Kernel dispatch adapter.
//!
//! Wires the per-call contract of [`ChannelFs`] into the `fuser` dispatch
//! loop. Inode 1 is the root directory; channel files get fixed inodes in
//! configuration order. The adapter contains no serving logic of its own:
//! every call delegates and maps `FsError` to an errno. Handlers block on
//! the daemon runtime, and the kernel session runs single-threaded on the
//! caller's thread.

use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, Request,
};
use hdhrfs_device::DeviceClient;
use log::warn;

use crate::fs::{Attr, ChannelFs};

/// Attribute cache lifetime. Short, because channel sizes grow.
const TTL: Duration = Duration::from_secs(1);

const ROOT_INO: u64 = 1;
const FILE_INO_BASE: u64 = 2;

/// Mount `fs` at `mountpoint` and serve until unmounted.
pub fn mount<D: DeviceClient>(
    fs: ChannelFs<D>,
    mountpoint: &Path,
    runtime: tokio::runtime::Handle,
) -> io::Result<()> {
    let options = [
        MountOption::RO,
        MountOption::FSName("hdhrfs".to_string()),
        MountOption::DefaultPermissions,
    ];
    fuser::mount2(ChannelMount::new(fs, runtime), mountpoint, &options)
}

/// `fuser::Filesystem` implementation delegating to [`ChannelFs`].
pub struct ChannelMount<D: DeviceClient> {
    fs: ChannelFs<D>,
    runtime: tokio::runtime::Handle,
    /// Channel paths (with leading slash) indexed like the channel map.
    paths: Vec<String>,
    uid: u32,
    gid: u32,
}

impl<D: DeviceClient> ChannelMount<D> {
    pub fn new(fs: ChannelFs<D>, runtime: tokio::runtime::Handle) -> Self {
        let paths = fs
            .context()
            .channels()
            .iter()
            .map(|c| format!("/{}", c.file_name()))
            .collect();
        Self {
            fs,
            runtime,
            paths,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    fn index_of_ino(&self, ino: u64) -> Option<usize> {
        let index = ino.checked_sub(FILE_INO_BASE)? as usize;
        (index < self.paths.len()).then_some(index)
    }

    fn attr(&self, ino: u64, attr: Attr) -> FileAttr {
        let now = SystemTime::now();
        let (kind, perm, nlink, size) = match attr {
            Attr::Directory => (FileType::Directory, 0o755, 2, 0),
            Attr::Channel { size } => (FileType::RegularFile, 0o444, 1, size),
        };
        FileAttr {
            ino,
            size,
            blocks: size / 512,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind,
            perm,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }
}

impl<D: DeviceClient> Filesystem for ChannelMount<D> {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        self.fs.init();
        Ok(())
    }

    fn destroy(&mut self) {
        self.runtime.block_on(self.fs.destroy());
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent != ROOT_INO {
            reply.error(libc::ENOENT);
            return;
        }
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = format!("/{}", name);
        match self.paths.iter().position(|p| p == &path) {
            Some(index) => match self.fs.getattr(&path) {
                Ok(attr) => reply.entry(&TTL, &self.attr(FILE_INO_BASE + index as u64, attr), 0),
                Err(e) => reply.error(e.errno()),
            },
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        if ino == ROOT_INO {
            reply.attr(&TTL, &self.attr(ROOT_INO, Attr::Directory));
            return;
        }
        match self.index_of_ino(ino) {
            Some(index) => match self.fs.getattr(&self.paths[index]) {
                Ok(attr) => reply.attr(&TTL, &self.attr(ino, attr)),
                Err(e) => reply.error(e.errno()),
            },
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
        if ino != ROOT_INO {
            reply.error(libc::ENOENT);
            return;
        }
        let names = match self.fs.readdir("/") {
            Ok(names) => names,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        for (i, name) in names.iter().enumerate().skip(offset as usize) {
            let (ino, kind) = match name.as_str() {
                "." | ".." => (ROOT_INO, FileType::Directory),
                // Offset by the two directory entries.
                _ => (FILE_INO_BASE + (i - 2) as u64, FileType::RegularFile),
            };
            if reply.add(ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.index_of_ino(ino) {
            Some(index) => match self.fs.open(&self.paths[index]) {
                Ok(()) => reply.opened(0, 0),
                Err(e) => reply.error(e.errno()),
            },
            None => reply.error(libc::ENOENT),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.index_of_ino(ino) {
            Some(index) => match self.fs.release(&self.paths[index]) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            },
            None => reply.error(libc::ENOENT),
        }
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
        let Some(index) = self.index_of_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let path = self.paths[index].clone();
        let result = self
            .runtime
            .block_on(self.fs.read(&path, offset as u64, size as usize));
        match result {
            Ok(data) => reply.data(&data),
            Err(e) => {
                warn!("read {} failed: {}", path, e);
                reply.error(e.errno());
            }
        }
    }
}
