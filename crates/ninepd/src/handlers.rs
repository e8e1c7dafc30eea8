//! Per-message protocol handlers (spec.md §4.7) and the `dispatch` entry
//! point `pool.rs`'s worker loop calls.
//!
//! Grounded on `examples/rs9p-rs9p/crates/unpfs/src/main.rs`'s
//! `Filesystem` impl for the real-path operations (walk/getattr/setattr/
//! readdir/lopen/lcreate/read/write/mkdir/renameat/unlinkat/fsync/
//! statfs), reworked from async `tokio::fs` onto blocking `std::fs`/`nix`
//! per spec.md §5, and on `examples/original_source/diod/ops.c` for the
//! operations unpfs does not implement (symlink, mknod, link, rename,
//! lock, getlock, xattrwalk, xattrcreate) plus the control-filesystem
//! branch described in spec.md §4.9.

use std::os::unix::fs::{DirEntryExt, MetadataExt, PermissionsExt};
use std::sync::Arc;

use ninep_wire::{
    errno, Data, DirEntry, DirEntryData, Error, Fcall, Getlock, GetAttrMask, LockStatus, LockType,
    NOFID, P92000L, Qid, QidType, Result, SetAttrMask, Stat, StatFs, Time, VERSION_UNKNOWN,
};

use crate::conn::{error_reply, Req, ReqState};
use crate::export::{check_ro, ExportFlags};
use crate::fid::{Fid, FidAux, FidFlags};
use crate::identity::{self, IdentityPolicy};
use crate::ioctx::IoCtx;
use crate::server::Server;

const CTL_ANAME: &str = "ctl";

/// Entry point called by each worker thread once a request is popped off
/// its pool's queue (spec.md §4.6/§4.7).
pub fn dispatch(server: &Arc<Server>, req: &Arc<Req>) {
    let fid = req.fid.lock().unwrap().clone();
    if let Some(fid) = &fid {
        if let Err(e) = assume_identity(server, &req.conn, fid.user()) {
            *req.reply.lock().unwrap() = Some(error_reply(&e));
            return;
        }
    }
    match handle(server, req) {
        Ok(reply) => {
            *req.reply.lock().unwrap() = Some(reply);
        }
        Err(Error::No(e)) if e == errno::EINTR => {
            // Flushed mid-flight: effects already committed (spec.md §5),
            // but no reply is sent — the flush's own Rflush already
            // answered the tag, or will once this request finishes.
            *req.state.lock().unwrap() = ReqState::NoReply;
        }
        Err(e) => {
            *req.reply.lock().unwrap() = Some(error_reply(&e));
        }
    }
}

fn handle(server: &Arc<Server>, req: &Arc<Req>) -> Result<Fcall> {
    let fid = req.fid.lock().unwrap().clone();
    match &req.tcall {
        Fcall::TVersion { msize, version: ver } => version(&req.conn, *msize, ver),
        Fcall::TAuth { .. } => Err(Error::No(errno::EOPNOTSUPP)),
        Fcall::TAttach { fid: newfid, afid, uname, aname, n_uname } => {
            attach(server, &req.conn, *newfid, *afid, uname, aname, *n_uname)
        }
        Fcall::TWalk { newfid, wnames, .. } => walk(server, &req.conn, fid, *newfid, wnames),
        Fcall::TGetAttr { req_mask, .. } => getattr(fid, *req_mask),
        Fcall::TSetAttr { valid, stat, .. } => setattr(fid, *valid, stat),
        Fcall::TReadLink { .. } => readlink(fid),
        Fcall::TReadDir { offset, count, .. } => readdir(server, fid, *offset, *count),
        Fcall::TlOpen { flags, .. } => lopen(server, fid, *flags),
        Fcall::TlCreate { name, flags, mode, .. } => lcreate(server, fid, name, *flags, *mode),
        Fcall::TRead { offset, count, .. } => read(server, fid, *offset, *count),
        Fcall::TWrite { offset, data, .. } => write(fid, *offset, data),
        Fcall::TFSync { .. } => fsync(fid),
        Fcall::TClunk { .. } => clunk(&req.conn, fid),
        Fcall::TRemove { .. } => remove(&req.conn, fid),
        Fcall::TStatFs { .. } => statfs(fid),
        Fcall::TMkDir { name, mode, gid, .. } => mkdir(fid, name, *mode, *gid),
        Fcall::TSymlink { name, symtgt, gid, .. } => symlink(fid, name, symtgt, *gid),
        Fcall::TMkNod { name, mode, major, minor, gid, .. } => mknod(fid, name, *mode, *major, *minor, *gid),
        Fcall::TLink { fid: oldfid, name, .. } => {
            let old = req
                .conn
                .fid_pool
                .find(*oldfid)
                .ok_or(Error::No(errno::EBADF))?;
            link(fid, old, name)
        }
        Fcall::TRename { dfid, name, .. } => {
            let dst = req
                .conn
                .fid_pool
                .find(*dfid)
                .ok_or(Error::No(errno::EBADF))?;
            rename(fid, dst, name)
        }
        Fcall::TRenameAt { oldname, newdirfid, newname, .. } => {
            let newdir = req
                .conn
                .fid_pool
                .find(*newdirfid)
                .ok_or(Error::No(errno::EBADF))?;
            renameat(fid, oldname, newdir, newname)
        }
        Fcall::TUnlinkAt { name, flags, .. } => unlinkat(fid, name, *flags),
        Fcall::TLock { flock, .. } => lock(fid, flock),
        Fcall::TGetLock { flock, .. } => getlock(fid, flock),
        Fcall::TxAttrWalk { newfid, name, .. } => {
            xattrwalk(server, &req.conn, fid, *newfid, name)
        }
        Fcall::TxAttrCreate { name, attr_size, .. } => xattrcreate(fid, name, *attr_size),
        Fcall::TFlush { .. } => Ok(Fcall::RFlush), // never reached: conn.rs handles inline
        _ => Err(Error::No(errno::EOPNOTSUPP)),
    }
}

fn version(conn: &crate::conn::Connection, msize: u32, version: &str) -> Result<Fcall> {
    let agreed = msize.min(conn.msize());
    conn.msize.store(agreed, std::sync::atomic::Ordering::Relaxed);
    if version != P92000L {
        return Ok(Fcall::RVersion {
            msize: agreed,
            version: VERSION_UNKNOWN.to_owned(),
        });
    }
    Ok(Fcall::RVersion {
        msize: agreed,
        version: P92000L.to_owned(),
    })
}

fn attach(
    server: &Arc<Server>,
    conn: &Arc<crate::conn::Connection>,
    newfid: u32,
    afid: u32,
    uname: &str,
    aname: &str,
    n_uname: u32,
) -> Result<Fcall> {
    let mut user = if n_uname != NOFID {
        server.users.by_uid(n_uname)?
    } else {
        server.users.by_name(uname)?
    };

    if afid != NOFID && !server.options.dac_bypass {
        // No auth protocol is implemented (see DESIGN.md); a real afid
        // can only be produced by Tauth, which already fails, so seeing
        // one here means the client tried to authenticate into a NOAUTH
        // export without one being granted.
        return Err(Error::No(errno::EPERM));
    }

    let (real_path, qid, flags) = if aname == CTL_ANAME {
        (format!("/{CTL_ANAME}"), server.ctl.root_qid, FidFlags::RO)
    } else {
        let export = server.exports.resolve(aname, &conn.client_id, &user)?;
        if export.flags.contains(ExportFlags::ALLSQUASH) {
            if let Some(squash) = &export.squash_user {
                user = server.users.by_name(squash)?;
            }
        }
        let mut flags = FidFlags::empty();
        flags.set(FidFlags::RO, export.flags.contains(ExportFlags::RO));
        flags.set(FidFlags::SHAREFD, export.flags.contains(ExportFlags::SHAREFD));
        let meta = std::fs::symlink_metadata(aname).map_err(Error::Io)?;
        (aname.to_owned(), qid_from_metadata(&meta), flags)
    };

    {
        // "Originally authenticated as uid 0" (spec.md §4.8): only the
        // connection's first attach sets this, so a later attach to an
        // unprivileged user can't retroactively grant DAC_BYPASS trust.
        let mut authuser_uid = conn.authuser_uid.lock().unwrap();
        if authuser_uid.is_none() {
            *authuser_uid = Some(user.uid());
        }
    }

    let path = server.paths.create(&real_path);
    let aux = FidAux::new(path, flags);
    let fid = conn
        .fid_pool
        .create(newfid, qid, user, aname.to_owned(), aux)?;

    if aname != CTL_ANAME {
        let (pool, tracked) = server.select_pool_for_aname(aname);
        // A connection can Tattach more than once (distinct fids, possibly
        // distinct anames), each incref-ing its own pool; `attached_pools`
        // remembers every ref so teardown releases all of them exactly
        // once, rather than only the last-selected one (spec.md §4.6 "pool
        // reference-counting is driven by attached fids"). The permanent
        // "default" pool (single-pool mode, or a non-absolute aname) is
        // never tracked here since it isn't attach-refcounted.
        if tracked {
            conn.attached_pools.lock().unwrap().push(Arc::clone(&pool));
        }
        *conn.tpool.lock().unwrap() = Some(pool);
    }

    Ok(Fcall::RAttach { qid: fid.qid() })
}

fn walk(server: &Arc<Server>, conn: &Arc<crate::conn::Connection>, fid: Option<Fid>, newfid: u32, wnames: &[String]) -> Result<Fcall> {
    let fid = fid.ok_or(Error::No(errno::EBADF))?;
    let is_ctl = fid.aname() == CTL_ANAME;

    // A fid that already straddles a mount point can't be walked further
    // in one Twalk (spec.md §8 "Walk across mount point"); the client
    // re-attaches to cross it (diod_ops.c diod_walk's DIOD_FID_FLAGS_MOUNTPT
    // check).
    if !is_ctl && fid.aux().is_mountpt() && !wnames.is_empty() {
        return Err(Error::No(errno::ENOENT));
    }

    let mut cur_path = fid.aux().path();
    let mut cur_qid = fid.qid();
    let mut cur_dev = if is_ctl {
        None
    } else {
        std::fs::symlink_metadata(&cur_path).ok().map(|m| m.dev())
    };
    let mut crossed_mount = false;
    let mut wqids = Vec::with_capacity(wnames.len());

    for (i, name) in wnames.iter().enumerate() {
        let (next_path, next_qid, next_dev, crossed) = if is_ctl {
            match server.ctl.lookup(name) {
                Some(entry) => (format!("/{CTL_ANAME}/{name}"), entry.qid, None, false),
                None if i == 0 => return Err(Error::No(errno::ENOENT)),
                None => break,
            }
        } else {
            let candidate = format!("{}/{}", cur_path.trim_end_matches('/'), name);
            match std::fs::symlink_metadata(&candidate) {
                Ok(meta) => {
                    let dev = meta.dev();
                    let crossed = cur_dev.is_some_and(|d| d != dev);
                    let qid = if crossed {
                        Qid {
                            typ: QidType::from(meta.file_type()),
                            version: meta.mtime() as u32,
                            path: statmnt(&candidate)?,
                        }
                    } else {
                        qid_from_metadata(&meta)
                    };
                    (candidate, qid, Some(dev), crossed)
                }
                Err(e) if i == 0 => return Err(Error::Io(e)),
                Err(_) => break,
            }
        };
        cur_path = next_path;
        cur_qid = next_qid;
        cur_dev = next_dev;
        crossed_mount = crossed;
        wqids.push(cur_qid);
    }

    if wqids.len() == wnames.len() {
        let path = server.paths.create(&cur_path);
        let mut flags = *fid.aux().flags.lock().unwrap();
        flags.set(FidFlags::MOUNTPT, crossed_mount);
        let aux = FidAux::new(path, flags);
        if newfid == fid.id() {
            conn.fid_pool.destroy(newfid);
        }
        conn.fid_pool
            .create(newfid, cur_qid, fid.user().clone(), fid.aname().to_owned(), aux)?;
    }

    Ok(Fcall::RWalk { wqids })
}

/// When a walk step lands on a different device, the qid reported to the
/// client must reflect the directory as seen from the export's own
/// filesystem surface, not the inode of the mounted filesystem's root
/// (spec.md §8 "Walk across mount point"). `_statmnt` in diod_ops.c gets
/// this by reading the mount point's own dirent out of its parent
/// directory instead of stat-ing through the mount.
fn statmnt(path: &str) -> Result<u64> {
    let p = std::path::Path::new(path);
    let parent = p.parent().ok_or(Error::No(errno::ENOENT))?;
    let name = p.file_name().ok_or(Error::No(errno::ENOENT))?;
    for entry in std::fs::read_dir(parent).map_err(Error::Io)? {
        let entry = entry.map_err(Error::Io)?;
        if entry.file_name().as_os_str() == name {
            return Ok(entry.ino());
        }
    }
    Err(Error::No(errno::ENOENT))
}

fn getattr(fid: Option<Fid>, req_mask: GetAttrMask) -> Result<Fcall> {
    let fid = fid.ok_or(Error::No(errno::EBADF))?;
    let path = fid.aux().path();
    let meta = std::fs::symlink_metadata(&path).map_err(Error::Io)?;
    let qid = if fid.aux().is_mountpt() {
        Qid {
            typ: QidType::from(meta.file_type()),
            version: meta.mtime() as u32,
            path: statmnt(&path)?,
        }
    } else {
        qid_from_metadata(&meta)
    };
    Ok(Fcall::RGetAttr {
        valid: req_mask,
        qid,
        stat: stat_from_metadata(&meta),
    })
}

fn setattr(fid: Option<Fid>, valid: SetAttrMask, stat: &ninep_wire::SetAttr) -> Result<Fcall> {
    let fid = fid.ok_or(Error::No(errno::EBADF))?;
    check_ro(fid.aux().is_ro())?;
    let path = fid.aux().path();
    let path = path.as_str();

    if valid.contains(SetAttrMask::MODE) {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(stat.mode)).map_err(Error::Io)?;
    }
    if valid.intersects(SetAttrMask::UID | SetAttrMask::GID) {
        let uid = valid.contains(SetAttrMask::UID).then(|| nix::unistd::Uid::from_raw(stat.uid));
        let gid = valid.contains(SetAttrMask::GID).then(|| nix::unistd::Gid::from_raw(stat.gid));
        nix::unistd::chown(path, uid, gid).map_err(crate::error::from_nix)?;
    }
    if valid.contains(SetAttrMask::SIZE) {
        let file = std::fs::OpenOptions::new().write(true).open(path).map_err(Error::Io)?;
        file.set_len(stat.size).map_err(Error::Io)?;
    }
    if valid.intersects(SetAttrMask::ATIME_SET | SetAttrMask::MTIME_SET) {
        use nix::sys::stat::{utimensat, UtimensatFlags};
        use nix::sys::time::TimeSpec;
        let atime = if valid.contains(SetAttrMask::ATIME_SET) {
            TimeSpec::new(stat.atime.sec as i64, stat.atime.nsec as i64)
        } else {
            TimeSpec::UTIME_OMIT
        };
        let mtime = if valid.contains(SetAttrMask::MTIME_SET) {
            TimeSpec::new(stat.mtime.sec as i64, stat.mtime.nsec as i64)
        } else {
            TimeSpec::UTIME_OMIT
        };
        utimensat(None, path, &atime, &mtime, UtimensatFlags::NoFollowSymlink)
            .map_err(crate::error::from_nix)?;
    }
    Ok(Fcall::RSetAttr)
}

fn readlink(fid: Option<Fid>) -> Result<Fcall> {
    let fid = fid.ok_or(Error::No(errno::EBADF))?;
    let target = std::fs::read_link(fid.aux().path()).map_err(Error::Io)?;
    Ok(Fcall::RReadLink {
        target: target.to_string_lossy().into_owned(),
    })
}

fn readdir(server: &Arc<Server>, fid: Option<Fid>, offset: u64, count: u32) -> Result<Fcall> {
    let fid = fid.ok_or(Error::No(errno::EBADF))?;
    let mut dirents = DirEntryData::new();

    if fid.aname() == CTL_ANAME {
        let names: Vec<&str> = server.ctl.entries().iter().map(|e| e.name).collect();
        for (i, name) in names.iter().enumerate().skip(offset as usize) {
            let entry = server.ctl.lookup(name).unwrap();
            let dirent = DirEntry {
                qid: entry.qid,
                offset: (i + 1) as u64,
                typ: 0,
                name: (*name).to_owned(),
            };
            if dirents.byte_len() + dirent.wire_size() > count {
                break;
            }
            dirents.push(dirent);
        }
        return Ok(Fcall::RReadDir { data: dirents });
    }

    let path = fid.aux().path();

    // spec.md §4.7 only calls out skipping "." and ".." on mount-point
    // fids, implying ordinary directories carry both (diod's readdir
    // emits them too). Offsets 1/2 are reserved for them here so
    // subsequent reads can resume past whichever one was last sent.
    let mountpt = fid.aux().is_mountpt();
    if !mountpt {
        if offset == 0 {
            let dirent = DirEntry {
                qid: fid.qid(),
                offset: 1,
                typ: libc::DT_DIR,
                name: ".".to_owned(),
            };
            if dirents.byte_len() + dirent.wire_size() > count {
                return Ok(Fcall::RReadDir { data: dirents });
            }
            dirents.push(dirent);
        }
        if offset <= 1 {
            let parent = std::path::Path::new(&path).parent().unwrap_or(std::path::Path::new(&path));
            let meta = std::fs::symlink_metadata(parent).map_err(Error::Io)?;
            let dirent = DirEntry {
                qid: qid_from_metadata(&meta),
                offset: 2,
                typ: libc::DT_DIR,
                name: "..".to_owned(),
            };
            if dirents.byte_len() + dirent.wire_size() > count {
                return Ok(Fcall::RReadDir { data: dirents });
            }
            dirents.push(dirent);
        }
    }

    let mut entries: Vec<_> = std::fs::read_dir(&path)
        .map_err(Error::Io)?
        .filter_map(|e| e.ok())
        .collect();
    entries.sort_by_key(|e| e.file_name());

    let skip = if mountpt {
        offset as usize
    } else if offset >= 2 {
        (offset - 2) as usize
    } else {
        0
    };
    let base_offset = if mountpt { 1u64 } else { 3u64 };

    for (i, entry) in entries.into_iter().enumerate().skip(skip) {
        let meta = entry.metadata().map_err(Error::Io)?;
        let dirent = DirEntry {
            qid: qid_from_metadata(&meta),
            offset: base_offset + i as u64,
            typ: (meta.mode() >> 12) as u8,
            name: entry.file_name().to_string_lossy().into_owned(),
        };
        if dirents.byte_len() + dirent.wire_size() > count {
            break;
        }
        dirents.push(dirent);
    }
    Ok(Fcall::RReadDir { data: dirents })
}

fn lopen(server: &Arc<Server>, fid: Option<Fid>, flags: u32) -> Result<Fcall> {
    let fid = fid.ok_or(Error::No(errno::EBADF))?;

    // Tlopen with any write-implying flag on a read-only fid (SPEC_FULL
    // "Read-only export enforcement detail", diod_ops.c diod_fid_check_ro).
    if flags & (libc::O_WRONLY | libc::O_RDWR) as u32 != 0 {
        check_ro(fid.aux().is_ro())?;
    }

    // spec.md §4.7: Tlopen rejects O_DIRECT outright and never creates.
    if flags & libc::O_DIRECT as u32 != 0 {
        return Err(Error::No(errno::EINVAL));
    }
    let flags = flags & !(libc::O_CREAT as u32);

    if fid.aname() == CTL_ANAME {
        let path = fid.aux().path();
        let name = path.rsplit('/').next().unwrap_or_default();
        if let Some(entry) = server.ctl.lookup(name) {
            return Ok(Fcall::RlOpen { qid: entry.qid, iounit: 0 });
        }
        return Ok(Fcall::RlOpen { qid: fid.qid(), iounit: 0 }); // root dir
    }

    if fid.qid().typ.contains(QidType::DIR) {
        return Ok(Fcall::RlOpen { qid: fid.qid(), iounit: 0 });
    }

    let shared = fid
        .aux()
        .flags
        .lock()
        .unwrap()
        .contains(FidFlags::SHAREFD)
        .then(|| fid.aux().find_sharable_ioctx(flags, fid.user().uid()))
        .flatten();

    let ioctx = match shared {
        Some(ioctx) => ioctx,
        None => {
            let ioctx = IoCtx::open(
                &fid.aux().path(),
                flags as i32,
                0,
                fid.user().clone(),
                server.options.max_mmap,
            )?;
            fid.aux().push_ioctx(ioctx.clone());
            ioctx
        }
    };

    let qid = ioctx.qid();
    let iounit = ioctx.iounit();
    *fid.aux().ioctx.lock().unwrap() = Some(ioctx);
    Ok(Fcall::RlOpen { qid, iounit })
}

fn lcreate(server: &Arc<Server>, fid: Option<Fid>, name: &str, flags: u32, mode: u32) -> Result<Fcall> {
    let fid = fid.ok_or(Error::No(errno::EBADF))?;
    check_ro(fid.aux().is_ro())?;

    let full = format!("{}/{}", fid.aux().path().trim_end_matches('/'), name);
    let ioctx = IoCtx::open(
        &full,
        flags as i32 | libc::O_CREAT,
        mode,
        fid.user().clone(),
        server.options.max_mmap,
    )?;
    let qid = ioctx.qid();
    let iounit = ioctx.iounit();

    // Tlcreate repoints the directory fid at the file it just created
    // (spec.md §6): the fid no longer resolves to the containing directory.
    let path = server.paths.create(&full);
    path.push_ioctx(ioctx.clone());
    fid.aux().set_path(path);
    *fid.aux().ioctx.lock().unwrap() = Some(ioctx);
    Ok(Fcall::RlCreate { qid, iounit })
}

fn read(server: &Arc<Server>, fid: Option<Fid>, offset: u64, count: u32) -> Result<Fcall> {
    let fid = fid.ok_or(Error::No(errno::EBADF))?;

    if fid.aname() == CTL_ANAME {
        let path = fid.aux().path();
        let name = path.rsplit('/').next().unwrap_or_default();
        let entry = server.ctl.lookup(name).ok_or(Error::No(errno::EBADF))?;
        return Ok(Fcall::RRead {
            data: Data(entry.read_at(server, offset, count)),
        });
    }

    if fid.aux().is_xattr() {
        let guard = fid.aux().xattr.lock().unwrap();
        let buf = guard.as_ref().ok_or(Error::No(errno::EBADF))?;
        let start = (offset as usize).min(buf.data.len());
        let end = (start + count as usize).min(buf.data.len());
        return Ok(Fcall::RRead { data: Data(buf.data[start..end].to_vec()) });
    }

    let ioctx = fid.aux().ioctx.lock().unwrap().clone().ok_or(Error::No(errno::EBADF))?;
    let mut buf = vec![0u8; count as usize];
    let n = ioctx.pread(&mut buf, offset)?;
    buf.truncate(n);
    Ok(Fcall::RRead { data: Data(buf) })
}

fn write(fid: Option<Fid>, offset: u64, data: &Data) -> Result<Fcall> {
    let fid = fid.ok_or(Error::No(errno::EBADF))?;
    check_ro(fid.aux().is_ro())?;

    if fid.aux().is_xattr() {
        let mut guard = fid.aux().xattr.lock().unwrap();
        let buf = guard.as_mut().ok_or(Error::No(errno::EBADF))?;
        let start = offset as usize;
        let end = start + data.0.len();
        if buf.data.len() < end {
            buf.data.resize(end, 0);
        }
        buf.data[start..end].copy_from_slice(&data.0);
        buf.dirty = true;
        return Ok(Fcall::RWrite { count: data.0.len() as u32 });
    }

    let ioctx = fid.aux().ioctx.lock().unwrap().clone().ok_or(Error::No(errno::EBADF))?;
    let n = ioctx.pwrite(&data.0, offset)?;
    Ok(Fcall::RWrite { count: n as u32 })
}

fn fsync(fid: Option<Fid>) -> Result<Fcall> {
    let fid = fid.ok_or(Error::No(errno::EBADF))?;
    if let Some(ioctx) = fid.aux().ioctx.lock().unwrap().as_ref() {
        ioctx.fsync()?;
    }
    Ok(Fcall::RFSync)
}

fn clunk(conn: &crate::conn::Connection, fid: Option<Fid>) -> Result<Fcall> {
    let fid = fid.ok_or(Error::No(errno::EBADF))?;
    if fid.aux().is_xattr() {
        commit_xattr(&fid)?;
    }
    conn.fid_pool.destroy(fid.id());
    Ok(Fcall::RClunk)
}

/// `xattr_close` (diod_xattr.c): a dirty buffer with data is committed via
/// `lsetxattr`; a dirty, empty buffer removes the attribute instead. A
/// buffer that was only ever read (never written) is never dirty, so a
/// plain `Txattrwalk` read never triggers a write back.
fn commit_xattr(fid: &Fid) -> Result<()> {
    let guard = fid.aux().xattr.lock().unwrap();
    let Some(buf) = guard.as_ref() else {
        return Ok(());
    };
    if !buf.dirty {
        return Ok(());
    }
    let path = std::ffi::CString::new(fid.aux().path()).map_err(|_| Error::No(errno::EINVAL))?;
    let name = std::ffi::CString::new(buf.name.as_str()).map_err(|_| Error::No(errno::EINVAL))?;
    let rc = if buf.data.is_empty() {
        unsafe { libc::lremovexattr(path.as_ptr(), name.as_ptr()) }
    } else {
        unsafe {
            libc::lsetxattr(
                path.as_ptr(),
                name.as_ptr(),
                buf.data.as_ptr().cast(),
                buf.data.len(),
                0,
            )
        }
    };
    if rc < 0 {
        return Err(Error::No(std::io::Error::last_os_error().raw_os_error().unwrap_or(errno::EIO)));
    }
    Ok(())
}

fn remove(conn: &crate::conn::Connection, fid: Option<Fid>) -> Result<Fcall> {
    let fid = fid.ok_or(Error::No(errno::EBADF))?;
    check_ro(fid.aux().is_ro())?;
    let path = fid.aux().path();
    let path = path.as_str();
    let result = if fid.qid().typ.contains(QidType::DIR) {
        std::fs::remove_dir(path)
    } else {
        std::fs::remove_file(path)
    };
    conn.fid_pool.destroy(fid.id());
    result.map_err(Error::Io)?;
    Ok(Fcall::RRemove)
}

fn statfs(fid: Option<Fid>) -> Result<Fcall> {
    let fid = fid.ok_or(Error::No(errno::EBADF))?;
    let s = nix::sys::statvfs::statvfs(&fid.aux().path()).map_err(crate::error::from_nix)?;
    Ok(Fcall::RStatFs {
        statfs: StatFs {
            typ: 0,
            bsize: s.block_size() as u32,
            blocks: s.blocks(),
            bfree: s.blocks_free(),
            bavail: s.blocks_available(),
            files: s.files(),
            ffree: s.files_free(),
            fsid: 0,
            namelen: s.name_max() as u32,
        },
    })
}

fn mkdir(fid: Option<Fid>, name: &str, mode: u32, _gid: u32) -> Result<Fcall> {
    let fid = fid.ok_or(Error::No(errno::EBADF))?;
    check_ro(fid.aux().is_ro())?;
    let full = format!("{}/{}", fid.aux().path().trim_end_matches('/'), name);
    std::fs::create_dir(&full).map_err(Error::Io)?;
    std::fs::set_permissions(&full, std::fs::Permissions::from_mode(mode)).map_err(Error::Io)?;
    let meta = std::fs::symlink_metadata(&full).map_err(Error::Io)?;
    Ok(Fcall::RMkDir { qid: qid_from_metadata(&meta) })
}

fn symlink(fid: Option<Fid>, name: &str, target: &str, _gid: u32) -> Result<Fcall> {
    let fid = fid.ok_or(Error::No(errno::EBADF))?;
    check_ro(fid.aux().is_ro())?;
    let full = format!("{}/{}", fid.aux().path().trim_end_matches('/'), name);
    std::os::unix::fs::symlink(target, &full).map_err(Error::Io)?;
    let meta = std::fs::symlink_metadata(&full).map_err(Error::Io)?;
    Ok(Fcall::RSymlink { qid: qid_from_metadata(&meta) })
}

fn mknod(fid: Option<Fid>, name: &str, mode: u32, major: u32, minor: u32, _gid: u32) -> Result<Fcall> {
    let fid = fid.ok_or(Error::No(errno::EBADF))?;
    check_ro(fid.aux().is_ro())?;
    let full = format!("{}/{}", fid.aux().path().trim_end_matches('/'), name);
    let dev = nix::sys::stat::makedev(major as u64, minor as u64);
    nix::sys::stat::mknod(
        full.as_str(),
        nix::sys::stat::SFlag::from_bits_truncate(mode),
        nix::sys::stat::Mode::from_bits_truncate(mode),
        dev,
    )
    .map_err(crate::error::from_nix)?;
    let meta = std::fs::symlink_metadata(&full).map_err(Error::Io)?;
    Ok(Fcall::RMkNod { qid: qid_from_metadata(&meta) })
}

fn link(dir: Option<Fid>, target: Fid, name: &str) -> Result<Fcall> {
    let dir = dir.ok_or(Error::No(errno::EBADF))?;
    check_ro(dir.aux().is_ro())?;
    let full = format!("{}/{}", dir.aux().path().trim_end_matches('/'), name);
    std::fs::hard_link(target.aux().path(), &full).map_err(Error::Io)?;
    Ok(Fcall::RLink)
}

fn rename(fid: Option<Fid>, newdir: Fid, name: &str) -> Result<Fcall> {
    let fid = fid.ok_or(Error::No(errno::EBADF))?;
    check_ro(fid.aux().is_ro())?;
    let dest = format!("{}/{}", newdir.aux().path().trim_end_matches('/'), name);
    std::fs::rename(fid.aux().path(), &dest).map_err(Error::Io)?;
    Ok(Fcall::RRename)
}

fn renameat(olddir: Option<Fid>, oldname: &str, newdir: Fid, newname: &str) -> Result<Fcall> {
    let olddir = olddir.ok_or(Error::No(errno::EBADF))?;
    check_ro(olddir.aux().is_ro())?;
    let src = format!("{}/{}", olddir.aux().path().trim_end_matches('/'), oldname);
    let dest = format!("{}/{}", newdir.aux().path().trim_end_matches('/'), newname);
    std::fs::rename(&src, &dest).map_err(Error::Io)?;
    Ok(Fcall::RRenameAt)
}

fn unlinkat(dir: Option<Fid>, name: &str, flags: u32) -> Result<Fcall> {
    let dir = dir.ok_or(Error::No(errno::EBADF))?;
    check_ro(dir.aux().is_ro())?;
    let full = format!("{}/{}", dir.aux().path().trim_end_matches('/'), name);
    let is_dir = flags & libc::AT_REMOVEDIR as u32 != 0;
    let result = if is_dir {
        std::fs::remove_dir(&full)
    } else {
        std::fs::remove_file(&full)
    };
    result.map_err(Error::Io)?;
    Ok(Fcall::RUnlinkAt)
}

/// Whole-file `flock`-style locking (spec.md §6, §9: range locks are
/// deliberately not attempted here — see DESIGN.md Open Question).
fn lock(fid: Option<Fid>, flock: &ninep_wire::Flock) -> Result<Fcall> {
    let fid = fid.ok_or(Error::No(errno::EBADF))?;
    let ioctx = fid.aux().ioctx.lock().unwrap().clone().ok_or(Error::No(errno::EBADF))?;
    let op = match flock.typ {
        t if t == LockType::RDLCK => libc::LOCK_SH,
        t if t == LockType::WRLCK => libc::LOCK_EX,
        _ => libc::LOCK_UN,
    };
    match ioctx.flock(op | libc::LOCK_NB) {
        Ok(()) => Ok(Fcall::RLock { status: LockStatus::SUCCESS }),
        Err(Error::No(e)) if e == errno::EAGAIN => Ok(Fcall::RLock { status: LockStatus::BLOCKED }),
        Err(e) => Err(e),
    }
}

fn getlock(fid: Option<Fid>, flock: &Getlock) -> Result<Fcall> {
    let fid = fid.ok_or(Error::No(errno::EBADF))?;
    let ioctx = fid.aux().ioctx.lock().unwrap().clone().ok_or(Error::No(errno::EBADF))?;
    let typ = match ioctx.lock_state() {
        crate::ioctx::LockState::Unlocked => LockType::UNLCK,
        crate::ioctx::LockState::Shared => LockType::RDLCK,
        crate::ioctx::LockState::Exclusive => LockType::WRLCK,
    };
    Ok(Fcall::RGetLock {
        flock: Getlock {
            typ,
            start: flock.start,
            length: flock.length,
            proc_id: flock.proc_id,
            client_id: flock.client_id.clone(),
        },
    })
}

fn xattrwalk(server: &Arc<Server>, conn: &crate::conn::Connection, fid: Option<Fid>, newfid: u32, name: &str) -> Result<Fcall> {
    let fid = fid.ok_or(Error::No(errno::EBADF))?;
    let data = if name.is_empty() {
        Vec::new() // listxattr not implemented; empty list is a valid answer
    } else {
        xattr_get(&fid.aux().path(), name)?
    };
    let size = data.len() as u64;

    let path = server.paths.create(&fid.aux().path());
    let mut aux = FidAux::new(path, FidFlags::XATTR);
    *aux.xattr.lock().unwrap() = Some(crate::fid::XattrBuf {
        name: name.to_owned(),
        data,
        dirty: false,
    });
    conn.fid_pool
        .create(newfid, fid.qid(), fid.user().clone(), fid.aname().to_owned(), aux)?;
    Ok(Fcall::RxAttrWalk { size })
}

fn xattrcreate(fid: Option<Fid>, name: &str, attr_size: u64) -> Result<Fcall> {
    let fid = fid.ok_or(Error::No(errno::EBADF))?;
    check_ro(fid.aux().is_ro())?;
    *fid.aux().xattr.lock().unwrap() = Some(crate::fid::XattrBuf {
        name: name.to_owned(),
        data: Vec::with_capacity(attr_size as usize),
        dirty: true,
    });
    fid.aux().flags.lock().unwrap().insert(FidFlags::XATTR);
    Ok(Fcall::RxAttrCreate)
}

fn xattr_get(path: &str, name: &str) -> Result<Vec<u8>> {
    let cpath = std::ffi::CString::new(path).map_err(|_| Error::No(errno::EINVAL))?;
    let cname = std::ffi::CString::new(name).map_err(|_| Error::No(errno::EINVAL))?;
    let needed = unsafe { libc::getxattr(cpath.as_ptr(), cname.as_ptr(), std::ptr::null_mut(), 0) };
    if needed < 0 {
        return Err(Error::No(std::io::Error::last_os_error().raw_os_error().unwrap_or(errno::EIO)));
    }
    let mut buf = vec![0u8; needed as usize];
    let got = unsafe {
        libc::getxattr(cpath.as_ptr(), cname.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
    };
    if got < 0 {
        return Err(Error::No(std::io::Error::last_os_error().raw_os_error().unwrap_or(errno::EIO)));
    }
    buf.truncate(got as usize);
    Ok(buf)
}

/// Assume `user`'s fs-identity on this worker thread before running a
/// handler that touches the host filesystem (spec.md §4.8: "Before
/// dispatching a handler, the worker assumes the request's fs-identity").
/// Called once from `dispatch` for every request carrying a fid, rather
/// than piecemeal per handler, so the TLS-cached skip-if-unchanged
/// optimization in `identity::assume` actually pays off across a worker's
/// successive requests.
fn assume_identity(server: &Server, conn: &crate::conn::Connection, user: &crate::user::User) -> Result<()> {
    let policy = IdentityPolicy {
        setfsid: server.options.setfsid,
        dac_bypass: server.options.dac_bypass,
        setgroups: server.options.setgroups,
    };
    if !policy.setfsid && !policy.dac_bypass {
        return Ok(());
    }
    let authuid_is_root = conn.authuser_uid.lock().unwrap().is_some_and(|u| u == 0);
    identity::assume(user, None, authuid_is_root, &policy)
}

fn qid_from_metadata(meta: &std::fs::Metadata) -> Qid {
    Qid {
        typ: QidType::from(meta.file_type()),
        version: meta.mtime() as u32,
        path: meta.ino(),
    }
}

fn stat_from_metadata(meta: &std::fs::Metadata) -> Stat {
    Stat {
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        nlink: meta.nlink(),
        rdev: meta.rdev(),
        size: meta.size(),
        blksize: meta.blksize(),
        blocks: meta.blocks(),
        atime: Time { sec: meta.atime() as u64, nsec: meta.atime_nsec() as u64 },
        mtime: Time { sec: meta.mtime() as u64, nsec: meta.mtime_nsec() as u64 },
        ctime: Time { sec: meta.ctime() as u64, nsec: meta.ctime_nsec() as u64 },
    }
}
