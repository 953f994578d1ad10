use std::collections::HashMap;
use std::ffi::CString;
use std::ffi::OsStr;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::FileExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;

use fuser::FileAttr;
use fuser::FileType;
use fuser::Filesystem;
use fuser::ReplyAttr;
use fuser::ReplyCreate;
use fuser::ReplyData;
use fuser::ReplyDirectory;
use fuser::ReplyEmpty;
use fuser::ReplyEntry;
use fuser::ReplyOpen;
use fuser::ReplyWrite;
use fuser::Request;
use fuser::TimeOrNow;
use sandfs_delta::DeltaStore;
use sandfs_delta::EntryKind;
use sandfs_delta::Resolution;
use sandfs_permissions::PermissionEngine;
use sandfs_permissions::normalize_checked;
use sandfs_protocol::PermissionLevel;
use sandfs_protocol::SandboxError;
use sandfs_protocol::SandboxResult;
use tracing::warn;

use crate::attrs::TTL;
use crate::attrs::to_file_attr;
use crate::flags::sanitize;
use crate::inode::InodeTable;
use crate::inode::ROOT_INODE;

/// Binds a [`PermissionEngine`] and a [`DeltaStore`] to the syscalls FUSE
/// forwards from the kernel. Every operation: resolves the kernel inode to a
/// sandbox-relative path, checks the required permission level, resolves the
/// path through the overlay, then touches the host filesystem.
pub struct SandboxFilesystem {
    permissions: Arc<PermissionEngine>,
    delta: Arc<DeltaStore>,
    inodes: Mutex<InodeTable>,
    handles: Mutex<HashMap<u64, fs::File>>,
    next_fh: AtomicU64,
}

impl SandboxFilesystem {
    pub fn new(permissions: Arc<PermissionEngine>, delta: Arc<DeltaStore>) -> Self {
        Self {
            permissions,
            delta,
            inodes: Mutex::new(InodeTable::new()),
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    fn path_for(&self, ino: u64) -> Result<String, i32> {
        let table = self.inodes.lock().unwrap_or_else(PoisonError::into_inner);
        table.path(ino).map(str::to_string).ok_or(libc::ENOENT)
    }

    fn ensure_ino(&self, relpath: &str) -> u64 {
        let mut table = self.inodes.lock().unwrap_or_else(PoisonError::into_inner);
        table.ensure(relpath)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, i32> {
        let parent_path = self.path_for(parent)?;
        join_relpath(&parent_path, name)
    }

    fn stat_resolution(&self, relpath: &str) -> Result<sandfs_utils_absolute_path::AbsolutePathBuf, i32> {
        match self.delta.resolve(relpath).map_err(errno_of)? {
            Resolution::Present(path, _) => Ok(path),
            Resolution::Deleted | Resolution::NotFound => Err(libc::ENOENT),
        }
    }

    fn lookup_impl(&self, parent: u64, name: &OsStr) -> Result<(u64, FileAttr), i32> {
        let relpath = self.child_path(parent, name)?;
        self.permissions.allow_view(&relpath).map_err(errno_of)?;
        let abs = self.stat_resolution(&relpath)?;
        let metadata = fs::symlink_metadata(abs.as_path()).map_err(|_| libc::ENOENT)?;
        let ino = self.ensure_ino(&relpath);
        Ok((ino, to_file_attr(ino, &metadata)))
    }

    fn getattr_impl(&self, ino: u64) -> Result<FileAttr, i32> {
        let relpath = self.path_for(ino)?;
        self.permissions.allow_view(&relpath).map_err(errno_of)?;
        let abs = self.stat_resolution(&relpath)?;
        let metadata = fs::symlink_metadata(abs.as_path()).map_err(|_| libc::ENOENT)?;
        Ok(to_file_attr(ino, &metadata))
    }

    fn readdir_impl(&self, ino: u64) -> Result<Vec<(u64, FileType, String)>, i32> {
        let relpath = self.path_for(ino)?;
        self.permissions.allow_view(&relpath).map_err(errno_of)?;
        self.stat_resolution(&relpath)?;

        let entries = self.delta.merged_readdir(&relpath).map_err(errno_of)?;
        let parent_rel = parent_of(&relpath);
        let parent_ino = self.ensure_ino(&parent_rel);

        let mut out = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for entry in entries {
            let child_rel = if relpath == "/" {
                format!("/{}", entry.name)
            } else {
                format!("{relpath}/{}", entry.name)
            };
            if self.permissions.evaluate(&child_rel) == PermissionLevel::None {
                continue;
            }
            let kind = match entry.kind {
                EntryKind::Directory => FileType::Directory,
                EntryKind::Symlink => FileType::Symlink,
                EntryKind::File => FileType::RegularFile,
            };
            let child_ino = self.ensure_ino(&child_rel);
            out.push((child_ino, kind, entry.name));
        }
        Ok(out)
    }

    fn open_impl(&self, ino: u64, flags: i32) -> Result<u64, i32> {
        let relpath = self.path_for(ino)?;
        let sanitized = sanitize(flags);
        if sanitized.write {
            self.permissions.allow_write(&relpath).map_err(errno_of)?;
            self.delta.copy_to_delta(&relpath).map_err(errno_of)?;
        } else {
            self.permissions.allow_read(&relpath).map_err(errno_of)?;
        }
        let abs = self.stat_resolution(&relpath)?;
        let file = sanitized
            .to_open_options()
            .open(abs.as_path())
            .map_err(io_errno)?;
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fh, file);
        Ok(fh)
    }

    fn read_impl(&self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>, i32> {
        let handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        let file = handles.get(&fh).ok_or(libc::EBADF)?;
        let mut buf = vec![0u8; size as usize];
        let offset = offset.max(0) as u64;
        let mut read = 0usize;
        loop {
            match file.read_at(&mut buf[read..], offset + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) => return Err(io_errno(e)),
            }
            if read == buf.len() {
                break;
            }
        }
        buf.truncate(read);
        Ok(buf)
    }

    fn write_impl(&self, fh: u64, offset: i64, data: &[u8]) -> Result<u32, i32> {
        let handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        let file = handles.get(&fh).ok_or(libc::EBADF)?;
        file.write_all_at(data, offset.max(0) as u64)
            .map_err(io_errno)?;
        Ok(data.len() as u32)
    }

    fn release_impl(&self, fh: u64) {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&fh);
    }

    fn create_impl(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: i32,
    ) -> Result<(u64, FileAttr, u64), i32> {
        let relpath = self.child_path(parent, name)?;
        self.permissions.allow_write(&relpath).map_err(errno_of)?;
        let path = self.delta.create_file(&relpath, mode).map_err(errno_of)?;
        let sanitized = sanitize(flags);
        let file = sanitized.to_open_options().open(&path).map_err(io_errno)?;
        let metadata = file.metadata().map_err(io_errno)?;
        let ino = self.ensure_ino(&relpath);
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fh, file);
        Ok((ino, to_file_attr(ino, &metadata), fh))
    }

    fn mkdir_impl(&self, parent: u64, name: &OsStr, mode: u32) -> Result<(u64, FileAttr), i32> {
        let relpath = self.child_path(parent, name)?;
        self.permissions.allow_write(&relpath).map_err(errno_of)?;
        let path = self.delta.create_dir(&relpath, mode).map_err(errno_of)?;
        let metadata = fs::symlink_metadata(&path).map_err(io_errno)?;
        let ino = self.ensure_ino(&relpath);
        Ok((ino, to_file_attr(ino, &metadata)))
    }

    fn unlink_impl(&self, parent: u64, name: &OsStr) -> Result<(), i32> {
        let relpath = self.child_path(parent, name)?;
        self.permissions.allow_write(&relpath).map_err(errno_of)?;
        self.stat_resolution(&relpath)?;
        self.delta.mark_deleted(&relpath).map_err(errno_of)
    }

    fn rmdir_impl(&self, parent: u64, name: &OsStr) -> Result<(), i32> {
        let relpath = self.child_path(parent, name)?;
        self.permissions.allow_write(&relpath).map_err(errno_of)?;
        self.stat_resolution(&relpath)?;
        let entries = self.delta.merged_readdir(&relpath).map_err(errno_of)?;
        if !entries.is_empty() {
            return Err(libc::ENOTEMPTY);
        }
        self.delta.mark_deleted(&relpath).map_err(errno_of)
    }

    fn rename_impl(
        &self,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> Result<(), i32> {
        let old_rel = self.child_path(parent, name)?;
        let new_rel = self.child_path(new_parent, new_name)?;
        self.permissions.allow_write(&old_rel).map_err(errno_of)?;
        self.permissions.allow_write(&new_rel).map_err(errno_of)?;
        self.delta.rename(&old_rel, &new_rel).map_err(errno_of)?;
        self.inodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rename(&old_rel, &new_rel);
        Ok(())
    }

    fn symlink_impl(
        &self,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
    ) -> Result<(u64, FileAttr), i32> {
        let relpath = self.child_path(parent, link_name)?;
        self.permissions.allow_write(&relpath).map_err(errno_of)?;
        let path = self
            .delta
            .create_symlink(&relpath, target)
            .map_err(errno_of)?;
        let metadata = fs::symlink_metadata(&path).map_err(io_errno)?;
        let ino = self.ensure_ino(&relpath);
        Ok((ino, to_file_attr(ino, &metadata)))
    }

    fn readlink_impl(&self, ino: u64) -> Result<Vec<u8>, i32> {
        let relpath = self.path_for(ino)?;
        self.permissions.allow_view(&relpath).map_err(errno_of)?;
        let abs = self.stat_resolution(&relpath)?;
        let target = fs::read_link(abs.as_path()).map_err(|_| libc::ENOENT)?;
        Ok(target.into_os_string().into_vec())
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr_impl(
        &self,
        ino: u64,
        mode: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> Result<FileAttr, i32> {
        let relpath = self.path_for(ino)?;
        self.permissions.allow_write(&relpath).map_err(errno_of)?;
        self.delta.copy_to_delta(&relpath).map_err(errno_of)?;
        let path = self.delta.delta_entry_path(&relpath);

        if let Some(mode) = mode {
            fs::set_permissions(&path, fs::Permissions::from_mode(mode & 0o7777))
                .map_err(io_errno)?;
        }
        if let Some(size) = size {
            let file = fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(io_errno)?;
            file.set_len(size).map_err(io_errno)?;
        }
        if atime.is_some() || mtime.is_some() {
            apply_times(&path, atime, mtime)?;
        }

        let metadata = fs::symlink_metadata(&path).map_err(io_errno)?;
        Ok(to_file_attr(ino, &metadata))
    }
}

impl Filesystem for SandboxFilesystem {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.lookup_impl(parent, name) {
            Ok((_, attr)) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.getattr_impl(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        match self.setattr_impl(ino, mode, size, atime, mtime) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.readlink_impl(ino) {
            Ok(target) => reply.data(&target),
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        match self.mkdir_impl(parent, name, mode) {
            Ok((_, attr)) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.unlink_impl(parent, name) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.rmdir_impl(parent, name) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        match self.symlink_impl(parent, link_name, target) {
            Ok((_, attr)) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
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
        match self.rename_impl(parent, name, newparent, newname) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.open_impl(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(errno) => reply.error(errno),
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
        match self.read_impl(fh, offset, size) {
            Ok(data) => reply.data(&data),
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
        match self.write_impl(fh, offset, data) {
            Ok(written) => reply.written(written),
            Err(errno) => reply.error(errno),
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
        self.release_impl(fh);
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        match self.readdir_impl(ino) {
            Ok(entries) => {
                for (index, (child_ino, kind, name)) in
                    entries.iter().enumerate().skip(offset as usize)
                {
                    let next_offset = (index + 1) as i64;
                    if reply.add(*child_ino, next_offset, *kind, name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        match self.create_impl(parent, name, mode, flags) {
            Ok((_, attr, fh)) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(errno) => reply.error(errno),
        }
    }
}

fn errno_of(err: SandboxError) -> i32 {
    err.to_errno().map(|e| e.0).unwrap_or_else(|| {
        warn!("sandbox error with no errno mapping: {err}");
        libc::EIO
    })
}

fn io_errno(err: std::io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}

/// Joins a parent's sandbox-relative path with a kernel-supplied name
/// component and re-normalizes, rejecting any `..` escape attempt rather
/// than resolving it silently.
fn join_relpath(parent: &str, name: &OsStr) -> Result<String, i32> {
    let name = name.to_str().ok_or(libc::EINVAL)?;
    let candidate = if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    };
    normalize_checked(&candidate).map_err(errno_of)
}

fn parent_of(relpath: &str) -> String {
    let segments = sandfs_permissions::segments(relpath);
    if segments.len() <= 1 {
        "/".to_string()
    } else {
        format!("/{}", segments[..segments.len() - 1].join("/"))
    }
}

fn apply_times(path: &Path, atime: Option<TimeOrNow>, mtime: Option<TimeOrNow>) -> Result<(), i32> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| libc::EINVAL)?;
    let spec = |value: Option<TimeOrNow>| -> libc::timespec {
        match value {
            None => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            },
            Some(TimeOrNow::Now) => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_NOW,
            },
            Some(TimeOrNow::SpecificTime(time)) => {
                let duration = time.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
                libc::timespec {
                    tv_sec: duration.as_secs() as i64,
                    tv_nsec: i64::from(duration.subsec_nanos()),
                }
            }
        }
    };
    let times = [spec(atime), spec(mtime)];
    let result = unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0) };
    if result != 0 {
        return Err(std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO));
    }
    Ok(())
}
