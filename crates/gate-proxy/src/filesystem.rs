//! `fuser::Filesystem` implementation: bridges synchronous kernel callbacks
//! to the async broker client, acquiring locks per the §4.2 mapping table
//! before performing each backing-tree operation.

use std::ffi::OsStr;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use gate_proto::{LockMode, OwnerToken};
use gate_proxy_core::{plan_for, BrokerClient, HandleState, HandleTable, OwnerRegistry, ProxyConfig, VfsOp};
use nix::unistd::{Gid, Uid};
use tokio::runtime::Handle as TokioHandle;
use tracing::{debug, warn};

use crate::inode::InodeTable;

/// How long the kernel may cache attributes/entries before re-validating.
/// Kept short: the broker, not the kernel cache, is the source of truth for
/// concurrent visibility.
const ATTR_TTL: Duration = Duration::from_secs(1);

/// Ties together the backing tree, the inode table, and the broker client.
/// One instance serves the whole mount.
pub struct GateFs {
    root: PathBuf,
    inodes: Arc<InodeTable>,
    broker: Arc<BrokerClient>,
    owners: Arc<OwnerRegistry>,
    handles: Arc<HandleTable>,
    rt: TokioHandle,
    config: ProxyConfig,
}

impl GateFs {
    #[must_use]
    pub fn new(
        config: ProxyConfig,
        broker: Arc<BrokerClient>,
        handles: Arc<HandleTable>,
        rt: TokioHandle,
    ) -> Self {
        let inodes = Arc::new(InodeTable::new(&config.root));
        Self { root: config.root.clone(), inodes, broker, owners: Arc::new(OwnerRegistry::new()), handles, rt, config }
    }

    fn acquire_plan(&self, op: &VfsOp, owner: OwnerToken) -> Result<(), i32> {
        let plan = plan_for(op);
        for step in &plan.steps {
            let result = self.rt.block_on(self.broker.acquire(
                step.path.clone(),
                step.mode,
                owner,
                self.config.acquire_timeout_ms,
            ));
            if let Err(err) = result {
                warn!(path = %step.path, %err, "lock acquisition failed");
                return Err(err.to_errno());
            }
        }
        Ok(())
    }

    fn release_plan(&self, op: &VfsOp, owner: OwnerToken) {
        let mut plan = plan_for(op);
        plan.steps.reverse();
        for step in &plan.steps {
            if let Err(err) = self.rt.block_on(self.broker.release(step.path.clone(), owner)) {
                warn!(path = %step.path, %err, "lock release failed");
            }
        }
    }

    fn attr_for(&self, ino: u64, path: &Path) -> Result<FileAttr, i32> {
        let metadata = fs::symlink_metadata(path).map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;
        Ok(to_file_attr(ino, &metadata))
    }

    fn child_path_or_enoent(&self, parent: u64, name: &OsStr) -> Result<PathBuf, i32> {
        self.inodes.child_path(parent, name).ok_or(libc::ENOENT)
    }
}

fn to_file_attr(ino: u64, metadata: &fs::Metadata) -> FileAttr {
    let kind = if metadata.is_dir() {
        FileType::Directory
    } else if metadata.file_type().is_symlink() {
        FileType::Symlink
    } else {
        FileType::RegularFile
    };
    FileAttr {
        ino,
        size: metadata.len(),
        blocks: metadata.blocks(),
        atime: metadata.accessed().unwrap_or(UNIX_EPOCH),
        mtime: metadata.modified().unwrap_or(UNIX_EPOCH),
        ctime: SystemTime::UNIX_EPOCH + Duration::from_secs(metadata.ctime().max(0) as u64),
        crtime: metadata.created().unwrap_or(UNIX_EPOCH),
        kind,
        perm: (metadata.permissions().mode() & 0o7777) as u16,
        nlink: metadata.nlink() as u32,
        uid: metadata.uid(),
        gid: metadata.gid(),
        rdev: metadata.rdev() as u32,
        blksize: 512,
        flags: 0,
    }
}

impl Filesystem for GateFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Ok(path) = self.child_path_or_enoent(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let owner = self.owners.active_owner(&path_key(&path)).unwrap_or_else(OwnerToken::new);
        if let Err(errno) = self.acquire_plan(&VfsOp::ReadMetadata { path: path_key(&path) }, owner) {
            reply.error(errno);
            return;
        }
        let result = self.attr_for(self.inodes.ino_for(&path), &path);
        self.release_plan(&VfsOp::ReadMetadata { path: path_key(&path) }, owner);
        match result {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let owner = self.owners.active_owner(&path_key(&path)).unwrap_or_else(OwnerToken::new);
        if let Err(errno) = self.acquire_plan(&VfsOp::ReadMetadata { path: path_key(&path) }, owner) {
            reply.error(errno);
            return;
        }
        let result = self.attr_for(ino, &path);
        self.release_plan(&VfsOp::ReadMetadata { path: path_key(&path) }, owner);
        match result {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
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
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let key = path_key(&path);
        // Reuse the open handle's owner when one backs this setattr (e.g. a
        // truncating write), per §4.2's re-entrancy rule; otherwise this is
        // a standalone metadata op and gets its own transient owner.
        let handle_owner = match fh {
            Some(id) => self.rt.block_on(self.handles.get(id)).map(|r| r.owner),
            None => None,
        };
        let owner = handle_owner
            .or_else(|| self.owners.active_owner(&key))
            .unwrap_or_else(OwnerToken::new);

        if let Err(errno) = self.acquire_plan(&VfsOp::WriteMetadata { path: key.clone() }, owner) {
            reply.error(errno);
            return;
        }

        let result = apply_setattr(&path, mode, uid, gid, size);
        self.release_plan(&VfsOp::WriteMetadata { path: key }, owner);

        match result.and_then(|()| self.attr_for(ino, &path).map_err(|e| io_err(e))) {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(err) => reply.error(err.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let owner = OwnerToken::new();
        if let Err(errno) = self.acquire_plan(&VfsOp::ReadMetadata { path: path_key(&path) }, owner) {
            reply.error(errno);
            return;
        }
        let result = fs::read_link(&path);
        self.release_plan(&VfsOp::ReadMetadata { path: path_key(&path) }, owner);
        match result {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(err) => reply.error(err.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn mkdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        let Ok(path) = self.child_path_or_enoent(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(parent_path) = self.inodes.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let op = VfsOp::CreateEntry { parent: path_key(&parent_path), new_path: path_key(&path) };
        let owner = OwnerToken::new();
        if let Err(errno) = self.acquire_plan(&op, owner) {
            reply.error(errno);
            return;
        }
        let result = fs::create_dir(&path).and_then(|()| {
            fs::set_permissions(&path, fs::Permissions::from_mode(mode & 0o7777))
        });
        self.release_plan(&op, owner);
        match result {
            Ok(()) => match self.attr_for(self.inodes.ino_for(&path), &path) {
                Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
                Err(errno) => reply.error(errno),
            },
            Err(err) => reply.error(err.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove_entry(parent, name, false, reply);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove_entry(parent, name, true, reply);
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Ok(path) = self.child_path_or_enoent(parent, link_name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(parent_path) = self.inodes.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let op = VfsOp::CreateEntry { parent: path_key(&parent_path), new_path: path_key(&path) };
        let owner = OwnerToken::new();
        if let Err(errno) = self.acquire_plan(&op, owner) {
            reply.error(errno);
            return;
        }
        let result = std::os::unix::fs::symlink(target, &path);
        self.release_plan(&op, owner);
        match result {
            Ok(()) => match self.attr_for(self.inodes.ino_for(&path), &path) {
                Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
                Err(errno) => reply.error(errno),
            },
            Err(err) => reply.error(err.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    #[allow(clippy::too_many_arguments)]
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
        let (Some(src_parent), Some(dst_parent)) = (self.inodes.path_of(parent), self.inodes.path_of(newparent))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        let src = src_parent.join(name);
        let dst = dst_parent.join(newname);
        let op = VfsOp::Rename {
            src_parent: path_key(&src_parent),
            dst_parent: path_key(&dst_parent),
            src: path_key(&src),
            dst: path_key(&dst),
        };
        let owner = OwnerToken::new();
        if let Err(errno) = self.acquire_plan(&op, owner) {
            reply.error(errno);
            return;
        }
        let result = fs::rename(&src, &dst);
        if result.is_ok() {
            let ino = self.inodes.ino_for(&src);
            self.inodes.reassign(ino, &dst);
        }
        self.release_plan(&op, owner);
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let key = path_key(&path);
        let write = flags & (libc::O_WRONLY | libc::O_RDWR) != 0;
        let mode = if write { LockMode::Write } else { LockMode::Read };
        let op = if write { VfsOp::OpenWrite { path: key.clone() } } else { VfsOp::OpenRead { path: key.clone() } };

        let owner = self.owners.open(&key);
        if let Err(errno) = self.acquire_plan(&op, owner) {
            self.owners.close(&key);
            reply.error(errno);
            return;
        }

        let handle_id = self.rt.block_on(self.handles.insert(key, owner, mode));
        self.rt.block_on(self.handles.mark_open(handle_id));
        debug!(ino, handle_id, "handle opened");
        reply.opened(handle_id, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let _ = fh; // the lock is already held for the handle's lifetime
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match read_at(&path, offset, size) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(err.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let _ = fh;
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match write_at(&path, offset, data) {
            Ok(n) => reply.written(n),
            Err(err) => reply.error(err.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        if self.config.release_on_flush {
            if let Some(record) = self.rt.block_on(self.handles.get(fh)) {
                self.release_one(&record.path, record.owner);
            }
        }
        let _ = ino;
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let _ = ino;
        self.rt.block_on(self.handles.mark_closing(fh));
        if let Some(record) = self.rt.block_on(self.handles.remove(fh)) {
            if record.state != HandleState::Lost && !self.config.release_on_flush {
                self.release_one(&record.path, record.owner);
            }
            self.owners.close(&record.path);
        }
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let owner = OwnerToken::new();
        if let Err(errno) = self.acquire_plan(&VfsOp::ReadMetadata { path: path_key(&path) }, owner) {
            reply.error(errno);
            return;
        }

        let entries = read_dir_entries(&path, &self.inodes);
        self.release_plan(&VfsOp::ReadMetadata { path: path_key(&path) }, owner);

        let entries = match entries {
            Ok(entries) => entries,
            Err(err) => {
                reply.error(err.raw_os_error().unwrap_or(libc::EIO));
                return;
            }
        };

        #[allow(clippy::cast_possible_wrap)]
        for (i, (name, kind, child_ino)) in entries.into_iter().enumerate().skip(offset as usize) {
            #[allow(clippy::cast_possible_wrap)]
            let next_offset = (i + 1) as i64;
            if reply.add(child_ino, next_offset, kind, name) {
                break;
            }
        }
        reply.ok();
    }

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
        let Ok(path) = self.child_path_or_enoent(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(parent_path) = self.inodes.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let key = path_key(&path);
        let op = VfsOp::CreateEntry { parent: path_key(&parent_path), new_path: key.clone() };
        let owner = self.owners.open(&key);
        if let Err(errno) = self.acquire_plan(&op, owner) {
            self.owners.close(&key);
            reply.error(errno);
            return;
        }

        let result = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(flags & libc::O_TRUNC != 0)
            .open(&path)
            .and_then(|f| {
                f.set_permissions(fs::Permissions::from_mode(mode & 0o7777))?;
                Ok(())
            });
        self.release_plan(&op, owner);

        match result {
            Ok(()) => {
                let ino = self.inodes.ino_for(&path);
                let handle_id = self.rt.block_on(self.handles.insert(key.clone(), owner, LockMode::Write));
                self.rt.block_on(self.handles.mark_open(handle_id));
                // The create's own write(parent)+write(new_path) locks were
                // released above; the handle keeps its own write(new_path)
                // lock alive for as long as it stays open.
                let reacquired = self.rt.block_on(self.broker.acquire(
                    key,
                    LockMode::Write,
                    owner,
                    self.config.acquire_timeout_ms,
                ));
                if let Err(err) = reacquired {
                    reply.error(err.to_errno());
                    return;
                }
                match self.attr_for(ino, &path) {
                    Ok(attr) => reply.created(&ATTR_TTL, &attr, 0, handle_id, 0),
                    Err(errno) => reply.error(errno),
                }
            }
            Err(err) => {
                self.owners.close(&path_key(&path));
                reply.error(err.raw_os_error().unwrap_or(libc::EIO));
            }
        }
    }
}

impl GateFs {
    fn remove_entry(&mut self, parent: u64, name: &OsStr, is_dir: bool, reply: ReplyEmpty) {
        let Ok(path) = self.child_path_or_enoent(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(parent_path) = self.inodes.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let op = VfsOp::RemoveEntry { parent: path_key(&parent_path), path: path_key(&path) };
        let owner = OwnerToken::new();
        if let Err(errno) = self.acquire_plan(&op, owner) {
            reply.error(errno);
            return;
        }
        let result = if is_dir { fs::remove_dir(&path) } else { fs::remove_file(&path) };
        if result.is_ok() {
            self.inodes.forget(self.inodes.ino_for(&path));
        }
        self.release_plan(&op, owner);
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn release_one(&self, path: &str, owner: OwnerToken) {
        if let Err(err) = self.rt.block_on(self.broker.release(path.to_string(), owner)) {
            warn!(%path, %err, "release on handle teardown failed");
        }
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn apply_setattr(
    path: &Path,
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    size: Option<u64>,
) -> Result<(), std::io::Error> {
    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
    }
    if uid.is_some() || gid.is_some() {
        chown_path(path, uid.map(Uid::from_raw), gid.map(Gid::from_raw))?;
    }
    if let Some(size) = size {
        let file = fs::OpenOptions::new().write(true).open(path)?;
        file.set_len(size)?;
    }
    Ok(())
}

fn chown_path(path: &Path, uid: Option<Uid>, gid: Option<Gid>) -> std::io::Result<()> {
    nix::unistd::chown(path, uid, gid).map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
}

fn io_err(errno: i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(errno)
}

fn read_at(path: &Path, offset: i64, size: u32) -> std::io::Result<Vec<u8>> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset.max(0) as u64))?;
    let mut buf = vec![0u8; size as usize];
    let n = file.read(&mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

fn write_at(path: &Path, offset: i64, data: &[u8]) -> std::io::Result<u32> {
    use std::io::{Seek, SeekFrom, Write};
    let mut file = fs::OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(offset.max(0) as u64))?;
    file.write_all(data)?;
    #[allow(clippy::cast_possible_truncation)]
    Ok(data.len() as u32)
}

fn read_dir_entries(
    path: &Path,
    inodes: &InodeTable,
) -> std::io::Result<Vec<(String, FileType, u64)>> {
    let mut entries = vec![
        (".".to_string(), FileType::Directory, inodes.ino_for(path)),
    ];
    if let Some(parent) = path.parent() {
        entries.push(("..".to_string(), FileType::Directory, inodes.ino_for(parent)));
    } else {
        entries.push(("..".to_string(), FileType::Directory, inodes.ino_for(path)));
    }
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let child_path = entry.path();
        let file_type = entry.file_type()?;
        let kind = if file_type.is_dir() {
            FileType::Directory
        } else if file_type.is_symlink() {
            FileType::Symlink
        } else {
            FileType::RegularFile
        };
        let ino = inodes.ino_for(&child_path);
        entries.push((entry.file_name().to_string_lossy().into_owned(), kind, ino));
    }
    Ok(entries)
}
