//! The "open file" object (spec.md §3 "IOCtx", §4.5).
//!
//! Grounded on `examples/original_source/diod/ioctx.c`'s `ioctx_struct`
//! and `ioctx_open`/`ioctx_close`/`ioctx_pread`/`ioctx_pwrite`. The C
//! code's `IOCtx` is an intrusive, hand-refcounted pointer threaded onto
//! its owning `Path`'s linked list; here it is an `Arc<IoCtxInner>` cloned
//! onto the path's `Vec` (see `path.rs`), so `Drop` plus an explicit
//! `path.remove_ioctx` on last-ref close replaces `_unlink_ioctx`.

use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::FileExt;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use ninep_wire::{Qid, QidType};

use crate::error::{errno, Error, Result};
use crate::user::User;

/// Read-only memory map of the first `min(size, max_mmap)` bytes of a
/// regular file, used to accelerate `pread` (spec.md §4.5). Failure to
/// map is non-fatal; callers fall back to `pread`.
struct MmapRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is PROT_READ-only and only ever read through
// `&[u8]` slices bounded by `len`; it outlives the IoCtx that owns it.
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    fn map(fd: RawFd, len: usize) -> Option<MmapRegion> {
        if len == 0 {
            return None;
        }
        use nix::sys::mman::{mmap, MapFlags, ProtFlags};
        use std::num::NonZeroUsize;
        let nz_len = NonZeroUsize::new(len)?;
        // SAFETY: fd is a valid, open, readable file descriptor for the
        // lifetime of this mapping (owned by the IoCtx alongside it).
        let raw = unsafe {
            mmap(
                None,
                nz_len,
                ProtFlags::PROT_READ,
                MapFlags::MAP_PRIVATE,
                std::os::fd::BorrowedFd::borrow_raw(fd),
                0,
            )
        };
        match raw {
            Ok(ptr) => Some(MmapRegion {
                ptr: ptr.cast(),
                len,
            }),
            Err(_) => None, // non-fatal; caller uses pread instead
        }
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` was returned by a successful `mmap` of `len` bytes
        // with PROT_READ and is not unmapped until `Drop`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        use nix::sys::mman::munmap;
        // SAFETY: `ptr`/`len` describe exactly the region mapped in `map`.
        unsafe {
            let _ = munmap(self.ptr.cast(), self.len);
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Shared,
    Exclusive,
}

struct IoCtxInner {
    fd: File,
    mmap: Option<MmapRegion>,
    /// `Some` when this ioctx was opened against a directory.
    is_dir: bool,
    qid: Qid,
    open_flags: u32,
    user: User,
    iounit: u32,
    lock_state: Mutex<LockState>,
}

/// Shared, refcounted open-file handle. Cloning increfs (spec.md §3); the
/// last clone's `Drop` closes the host fd.
#[derive(Clone)]
pub struct IoCtx(Arc<IoCtxInner>);

impl IoCtx {
    /// `ioctx_open`: open a fresh host fd for `path` with `flags`/`mode`,
    /// optionally mmap'd. Does not consult or link onto the path's
    /// sharing list — callers do that via `Path::find_sharable`/
    /// `Path::push_ioctx` (spec.md §4.5).
    pub fn open(path: &str, flags: i32, mode: u32, user: User, max_mmap: usize) -> Result<IoCtx> {
        use std::fs::OpenOptions;
        use std::os::unix::fs::OpenOptionsExt;

        let is_dir = flags as u32 & libc::O_DIRECTORY as u32 != 0;
        let file = OpenOptions::new()
            .custom_flags(flags)
            .read(true)
            .write(flags as u32 & 0x3 != libc::O_RDONLY as u32)
            .mode(mode)
            .open(path)
            .map_err(Error::Io)?;

        let meta = file.metadata().map_err(Error::Io)?;
        let qid = qid_from_metadata(&meta);
        let is_dir = is_dir || meta.is_dir();

        let mmap = if !is_dir && meta.is_file() && max_mmap > 0 && meta.len() > 0 {
            let len = std::cmp::min(meta.len() as usize, max_mmap);
            MmapRegion::map(file.as_raw_fd(), len)
        } else {
            None
        };

        Ok(IoCtx(Arc::new(IoCtxInner {
            fd: file,
            mmap,
            is_dir,
            qid,
            open_flags: flags as u32,
            user,
            iounit: 0,
            lock_state: Mutex::new(LockState::Unlocked),
        })))
    }

    pub fn ptr_eq(&self, other: &IoCtx) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn qid(&self) -> Qid {
        self.0.qid
    }

    pub fn iounit(&self) -> u32 {
        self.0.iounit
    }

    pub fn is_dir(&self) -> bool {
        self.0.is_dir
    }

    pub fn raw_fd(&self) -> RawFd {
        self.0.fd.as_raw_fd()
    }

    /// Sharing predicate (spec.md §4.5): same regular-file qid type, same
    /// open flags, same owning uid.
    pub fn is_sharable_match(&self, open_flags: u32, uid: u32) -> bool {
        !self.0.qid.typ.contains(QidType::DIR)
            && self.0.open_flags == open_flags
            && self.0.user.uid() == uid
    }

    /// `ioctx_pread`: prefer the mmap when the range is covered, else
    /// fall back to host `pread` (spec.md §4.5).
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if let Some(region) = &self.0.mmap {
            let start = offset as usize;
            if let Some(end) = start.checked_add(buf.len()) {
                if end <= region.len {
                    let slice = region.as_slice();
                    buf.copy_from_slice(&slice[start..end]);
                    return Ok(buf.len());
                }
            }
        }
        self.0.fd.read_at(buf, offset).map_err(Error::Io)
    }

    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.0.fd.write_at(buf, offset).map_err(Error::Io)
    }

    pub fn fsync(&self) -> Result<()> {
        self.0.fd.sync_all().map_err(Error::Io)
    }

    pub fn flock(&self, op: i32) -> Result<()> {
        let rc = unsafe { libc::flock(self.raw_fd(), op) };
        if rc < 0 {
            return Err(Error::No(std::io::Error::last_os_error().raw_os_error().unwrap_or(errno::EIO)));
        }
        let mut state = self.0.lock_state.lock().unwrap();
        if op & libc::LOCK_UN != 0 {
            *state = LockState::Unlocked;
        } else if op & libc::LOCK_SH != 0 {
            *state = LockState::Shared;
        } else if op & libc::LOCK_EX != 0 {
            *state = LockState::Exclusive;
        }
        Ok(())
    }

    pub fn lock_state(&self) -> LockState {
        *self.0.lock_state.lock().unwrap()
    }
}

fn qid_from_metadata(meta: &std::fs::Metadata) -> Qid {
    use std::os::unix::fs::MetadataExt;
    Qid {
        typ: QidType::from(meta.file_type()),
        version: meta.mtime() as u32,
        path: meta.ino(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_regular_file_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello world").unwrap();

        let user = User::synthesize(0, "root");
        let ioctx = IoCtx::open(path.to_str().unwrap(), libc::O_RDONLY, 0, user, 4096).unwrap();
        let mut buf = [0u8; 5];
        let n = ioctx.pread(&mut buf, 0).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn sharable_match_requires_same_uid_and_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();

        let alice = User::synthesize(1000, "alice");
        let bob = User::synthesize(1001, "bob");
        let ioctx = IoCtx::open(
            path.to_str().unwrap(),
            libc::O_RDONLY,
            0,
            alice.clone(),
            4096,
        )
        .unwrap();
        assert!(ioctx.is_sharable_match(libc::O_RDONLY as u32, 1000));
        assert!(!ioctx.is_sharable_match(libc::O_RDONLY as u32, 1001));
        let _ = bob;
    }
}
