//! FUSE adapter: maps [`fuser::Filesystem`] callbacks to the inode core.
//!
//! fuser's callbacks are synchronous; each one blocks on the async core
//! through a runtime handle. Reply plumbing is centralized so every
//! callback only spells out its success path.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::fs::blobfs::BlobFs;
use crate::fs::inode::FileHandle;
use crate::fs::{FileMode, FsError, OpenFlags};

/// Trait abstracting the `.error(errno)` method common to all fuser reply
/// types.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

impl_fuse_reply!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyDirectory,
    fuser::ReplyOpen,
    fuser::ReplyData,
    fuser::ReplyWrite,
    fuser::ReplyCreate,
    fuser::ReplyEmpty,
    fuser::ReplyXattr,
);

/// Extension trait on `Result<T, FsError>` for FUSE reply handling.
trait FuseResultExt<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R));
}

impl<T> FuseResultExt<T> for Result<T, FsError> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R)) {
        match self {
            Ok(val) => on_ok(val, reply),
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(e.errno());
            }
        }
    }
}

fn utf8_name(name: &OsStr) -> Result<&str, FsError> {
    name.to_str().ok_or(FsError::InvalidArgument)
}

/// Bridges the mounted [`BlobFs`] to the [`fuser::Filesystem`] trait.
pub struct FuserAdapter {
    fs: Arc<BlobFs>,
    open_files: HashMap<u64, Arc<FileHandle>>,
    runtime: tokio::runtime::Handle,
}

impl FuserAdapter {
    #[must_use]
    pub fn new(fs: Arc<BlobFs>, runtime: tokio::runtime::Handle) -> Self {
        Self {
            fs,
            open_files: HashMap::new(),
            runtime,
        }
    }

    fn attr_ttl(&self) -> std::time::Duration {
        self.fs.config.attr_ttl
    }
}

impl fuser::Filesystem for FuserAdapter {
    #[instrument(name = "FuserAdapter::lookup", skip(self, _req, reply))]
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let ttl = self.attr_ttl();
        self.runtime
            .block_on(async {
                let parent = self.fs.get_inode(parent).await.ok_or(FsError::NotFound)?;
                let child = self.fs.lookup(&parent, utf8_name(name)?).await?;
                let attr = child.getattr().await;
                Ok(attr)
            })
            .fuse_reply(reply, |attr, reply| {
                reply.entry(&ttl, &attr, 0);
            });
    }

    #[instrument(name = "FuserAdapter::forget", skip(self, _req))]
    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        self.runtime.block_on(self.fs.forget(ino, nlookup));
    }

    #[instrument(name = "FuserAdapter::getattr", skip(self, _req, _fh, reply))]
    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        let ttl = self.attr_ttl();
        self.runtime
            .block_on(async {
                let inode = self.fs.get_inode(ino).await.ok_or(FsError::NotFound)?;
                Ok(inode.getattr().await)
            })
            .fuse_reply(reply, |attr, reply| reply.attr(&ttl, &attr));
    }

    #[expect(clippy::too_many_arguments, reason = "mirrors the fuser API")]
    #[instrument(name = "FuserAdapter::setattr", skip_all, fields(ino))]
    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        let ttl = self.attr_ttl();
        let new_mtime = mtime.map(|t| match t {
            fuser::TimeOrNow::SpecificTime(t) => t,
            fuser::TimeOrNow::Now => std::time::SystemTime::now(),
        });
        self.runtime
            .block_on(async {
                let inode = self.fs.get_inode(ino).await.ok_or(FsError::NotFound)?;
                if let Some(new_size) = size {
                    inode.truncate(new_size).await?;
                }
                if let Some(bits) = mode {
                    inode.set_file_mode(FileMode::from_bits(bits)).await?;
                }
                if uid.is_some() || gid.is_some() {
                    inode.set_owner(uid, gid).await?;
                }
                if let Some(t) = new_mtime {
                    inode.set_mtime(t).await?;
                }
                Ok(inode.getattr().await)
            })
            .fuse_reply(reply, |attr, reply| reply.attr(&ttl, &attr));
    }

    #[instrument(name = "FuserAdapter::readlink", skip(self, _req, reply))]
    fn readlink(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyData) {
        self.runtime
            .block_on(async {
                let inode = self.fs.get_inode(ino).await.ok_or(FsError::NotFound)?;
                inode.readlink().await
            })
            .fuse_reply(reply, |target, reply| reply.data(&target));
    }

    #[instrument(name = "FuserAdapter::symlink", skip(self, _req, link_name, target, reply))]
    fn symlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &std::path::Path,
        reply: fuser::ReplyEntry,
    ) {
        let ttl = self.attr_ttl();
        self.runtime
            .block_on(async {
                let parent = self.fs.get_inode(parent).await.ok_or(FsError::NotFound)?;
                let target = target.to_str().ok_or(FsError::InvalidArgument)?;
                let child = self
                    .fs
                    .symlink(&parent, utf8_name(link_name)?, target)
                    .await?;
                Ok(child.getattr().await)
            })
            .fuse_reply(reply, |attr, reply| {
                reply.entry(&ttl, &attr, 0);
            });
    }

    #[instrument(name = "FuserAdapter::mkdir", skip(self, _req, name, _umask, reply))]
    fn mkdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        let ttl = self.attr_ttl();
        self.runtime
            .block_on(async {
                let parent = self.fs.get_inode(parent).await.ok_or(FsError::NotFound)?;
                let child = self
                    .fs
                    .mkdir(&parent, utf8_name(name)?, mode & 0o7777)
                    .await?;
                Ok(child.getattr().await)
            })
            .fuse_reply(reply, |attr, reply| {
                reply.entry(&ttl, &attr, 0);
            });
    }

    #[instrument(
        name = "FuserAdapter::create",
        skip(self, _req, name, _umask, _flags, reply)
    )]
    fn create(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let ttl = self.attr_ttl();
        self.runtime
            .block_on(async {
                let parent = self.fs.get_inode(parent).await.ok_or(FsError::NotFound)?;
                let child = self
                    .fs
                    .create_file(&parent, utf8_name(name)?, mode & 0o7777)
                    .await?;
                let handle = child.open().await?;
                let attr = child.getattr().await;
                Ok((attr, handle))
            })
            .fuse_reply(reply, |(attr, handle), reply| {
                let fh = handle.fh;
                self.open_files.insert(fh, Arc::new(handle));
                reply.created(&ttl, &attr, 0, fh, 0);
            });
    }

    #[instrument(name = "FuserAdapter::open", skip(self, _req, flags, reply))]
    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let flags = OpenFlags::from_bits_truncate(flags);
        self.runtime
            .block_on(async {
                let inode = self.fs.get_inode(ino).await.ok_or(FsError::NotFound)?;
                if inode.is_dir() {
                    return Err(FsError::IsDirectory);
                }
                if flags.contains(OpenFlags::TRUNC) {
                    inode.truncate(0).await?;
                }
                inode.open().await
            })
            .fuse_reply(reply, |handle, reply| {
                let fh = handle.fh;
                self.open_files.insert(fh, Arc::new(handle));
                reply.opened(fh, 0);
            });
    }

    #[expect(clippy::too_many_arguments, reason = "mirrors the fuser API")]
    #[instrument(name = "FuserAdapter::read", skip_all, fields(fh, offset, size))]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        let Some(handle) = self.open_files.get(&fh).map(Arc::clone) else {
            reply.error(libc::EBADF);
            return;
        };
        self.runtime
            .block_on(handle.read(offset.cast_unsigned(), u64::from(size)))
            .fuse_reply(reply, |data, reply| reply.data(&data));
    }

    #[expect(clippy::too_many_arguments, reason = "mirrors the fuser API")]
    #[instrument(name = "FuserAdapter::write", skip_all, fields(fh, offset))]
    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        let Some(handle) = self.open_files.get(&fh).map(Arc::clone) else {
            reply.error(libc::EBADF);
            return;
        };
        self.runtime
            .block_on(handle.write(offset.cast_unsigned(), data))
            .fuse_reply(reply, |written, reply| reply.written(written));
    }

    #[instrument(name = "FuserAdapter::flush", skip(self, _req, _lock_owner, reply))]
    fn flush(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        let Some(handle) = self.open_files.get(&fh).map(Arc::clone) else {
            reply.error(libc::EBADF);
            return;
        };
        self.runtime
            .block_on(handle.sync())
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::fsync", skip(self, _req, _datasync, reply))]
    fn fsync(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.runtime
            .block_on(async {
                let inode = self.fs.get_inode(ino).await.ok_or(FsError::NotFound)?;
                inode.sync().await
            })
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(
        name = "FuserAdapter::release",
        skip(self, _req, _flags, _lock_owner, _flush, reply)
    )]
    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        match self.open_files.remove(&fh) {
            Some(handle) => {
                self.runtime.block_on(handle.release());
                reply.ok();
            }
            None => reply.error(libc::EBADF),
        }
    }

    #[instrument(name = "FuserAdapter::unlink", skip(self, _req, name, reply))]
    fn unlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.runtime
            .block_on(async {
                let parent = self.fs.get_inode(parent).await.ok_or(FsError::NotFound)?;
                self.fs.unlink(&parent, utf8_name(name)?).await
            })
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::rmdir", skip(self, _req, name, reply))]
    fn rmdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.runtime
            .block_on(async {
                let parent = self.fs.get_inode(parent).await.ok_or(FsError::NotFound)?;
                self.fs.rmdir(&parent, utf8_name(name)?).await
            })
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::rename", skip_all, fields(parent, newparent))]
    fn rename(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        self.runtime
            .block_on(async {
                let old_parent = self.fs.get_inode(parent).await.ok_or(FsError::NotFound)?;
                let new_parent = self
                    .fs
                    .get_inode(newparent)
                    .await
                    .ok_or(FsError::NotFound)?;
                self.fs
                    .rename(
                        &old_parent,
                        utf8_name(name)?,
                        &new_parent,
                        utf8_name(newname)?,
                    )
                    .await
            })
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::readdir", skip(self, _req, _fh, reply))]
    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let listing: Result<Vec<(u64, bool, String)>, FsError> = self.runtime.block_on(async {
            let inode = self.fs.get_inode(ino).await.ok_or(FsError::NotFound)?;
            let parent_ino = inode.parent().map_or(ino, |p| p.id());
            let mut entries = vec![
                (ino, true, ".".to_string()),
                (parent_ino, true, "..".to_string()),
            ];
            for (name, child_ino, is_dir) in self.fs.readdir_local(&inode).await? {
                entries.push((child_ino, is_dir, name));
            }
            Ok(entries)
        });
        match listing {
            Ok(entries) => {
                #[expect(
                    clippy::cast_possible_truncation,
                    clippy::cast_sign_loss,
                    reason = "offset is a cookie we produced; it fits"
                )]
                for (i, (entry_ino, is_dir, name)) in
                    entries.iter().enumerate().skip(offset as usize)
                {
                    let kind = if *is_dir {
                        fuser::FileType::Directory
                    } else {
                        fuser::FileType::RegularFile
                    };
                    let Ok(next): Result<i64, _> = (i + 1).try_into() else {
                        reply.error(libc::EIO);
                        return;
                    };
                    if reply.add(*entry_ino, next, kind, name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    #[instrument(name = "FuserAdapter::setxattr", skip(self, _req, name, value, reply))]
    fn setxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: fuser::ReplyEmpty,
    ) {
        self.runtime
            .block_on(async {
                let inode = self.fs.get_inode(ino).await.ok_or(FsError::NotFound)?;
                inode
                    .set_xattr(utf8_name(name)?, value, flags.cast_unsigned())
                    .await
            })
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::getxattr", skip(self, _req, name, reply))]
    fn getxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: fuser::ReplyXattr,
    ) {
        self.runtime
            .block_on(async {
                let inode = self.fs.get_inode(ino).await.ok_or(FsError::NotFound)?;
                inode.get_xattr(utf8_name(name)?).await
            })
            .fuse_reply(reply, |value, reply| {
                let len = u32::try_from(value.len()).unwrap_or(u32::MAX);
                if size == 0 {
                    reply.size(len);
                } else if len <= size {
                    reply.data(&value);
                } else {
                    reply.error(libc::ERANGE);
                }
            });
    }

    #[instrument(name = "FuserAdapter::listxattr", skip(self, _req, reply))]
    fn listxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        size: u32,
        reply: fuser::ReplyXattr,
    ) {
        self.runtime
            .block_on(async {
                let inode = self.fs.get_inode(ino).await.ok_or(FsError::NotFound)?;
                inode.list_xattr().await
            })
            .fuse_reply(reply, |names, reply| {
                let mut buf = Vec::new();
                for name in names {
                    buf.extend_from_slice(name.as_bytes());
                    buf.push(0);
                }
                let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);
                if size == 0 {
                    reply.size(len);
                } else if len <= size {
                    reply.data(&buf);
                } else {
                    reply.error(libc::ERANGE);
                }
            });
    }

    #[instrument(name = "FuserAdapter::removexattr", skip(self, _req, name, reply))]
    fn removexattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.runtime
            .block_on(async {
                let inode = self.fs.get_inode(ino).await.ok_or(FsError::NotFound)?;
                inode.remove_xattr(utf8_name(name)?).await
            })
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::statfs", skip(self, _req, _ino, reply))]
    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        let (inodes, _buffered) = self.fs.statfs();
        reply.statfs(0, 0, 0, inodes, 0, 4096, 255, 0);
    }
}
