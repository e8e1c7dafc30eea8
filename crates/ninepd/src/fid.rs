//! Per-connection fid pool (spec.md §3 "Fid", §4.4).
//!
//! Grounded on `examples/original_source/diod/fid.h` for the flag bits and
//! on the teacher's `rs9p::srv::FId<T>` for the "typed aux slot" shape
//! (here `FidAux` plays the role of the teacher's generic `T`, fixed to
//! this server's own concrete file-backed state instead of a pluggable
//! trait associated type, since spec.md §1 scopes this crate to one
//! concrete filesystem backend rather than a library for arbitrary ones).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use bitflags::bitflags;
use ninep_wire::Qid;

use crate::error::{errno, Error, Result};
use crate::ioctx::IoCtx;
use crate::path::Path;
use crate::user::User;

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct FidFlags: u32 {
        const RO       = 0x01;
        const MOUNTPT  = 0x02;
        const SHAREFD  = 0x04;
        const XATTR    = 0x08;
        const ZOMBIE   = 0x10;
    }
}

/// In-memory buffer for `Txattrwalk`/`Txattrcreate`-mode fids (spec.md
/// §4.7): lazily read on first `Tread`, committed on `Tclunk`.
#[derive(Default)]
pub struct XattrBuf {
    pub name: String,
    pub data: Vec<u8>,
    pub dirty: bool,
}

/// Per-fid file auxiliary state (spec.md §3 "Per-fid file aux (FidAux)").
pub struct FidAux {
    /// Mutable because `Tlcreate` repoints a directory fid at the file it
    /// just created (spec.md §4.7, §6 "the fid no longer refers to the
    /// containing directory"), and `Twalk` with `newfid == fid` does the
    /// same in place rather than allocating a fresh `FidInner`.
    path: Mutex<Path>,
    pub ioctx: Mutex<Option<IoCtx>>,
    pub xattr: Mutex<Option<XattrBuf>>,
    pub flags: Mutex<FidFlags>,
}

impl FidAux {
    pub fn new(path: Path, flags: FidFlags) -> Self {
        FidAux {
            path: Mutex::new(path),
            ioctx: Mutex::new(None),
            xattr: Mutex::new(None),
            flags: Mutex::new(flags),
        }
    }

    pub fn path(&self) -> String {
        self.path.lock().unwrap().as_str().to_owned()
    }

    pub fn set_path(&self, path: Path) {
        *self.path.lock().unwrap() = path;
    }

    pub fn find_sharable_ioctx(&self, open_flags: u32, uid: u32) -> Option<IoCtx> {
        self.path.lock().unwrap().find_sharable(open_flags, uid)
    }

    pub fn push_ioctx(&self, ioctx: IoCtx) {
        self.path.lock().unwrap().push_ioctx(ioctx);
    }

    pub fn is_ro(&self) -> bool {
        self.flags.lock().unwrap().contains(FidFlags::RO)
    }

    pub fn is_mountpt(&self) -> bool {
        self.flags.lock().unwrap().contains(FidFlags::MOUNTPT)
    }

    pub fn is_xattr(&self) -> bool {
        self.flags.lock().unwrap().contains(FidFlags::XATTR)
    }
}

pub struct FidInner {
    pub id: u32,
    pub qid: Qid,
    pub user: User,
    pub aname: String,
    pub aux: FidAux,
}

/// Refcounted fid handle (spec.md §3 "Fid"). Cloning increfs; dropping the
/// last clone does not itself tear anything down — `FidPool::destroy`
/// does that explicitly once the pool's own entry is also removed, so the
/// fid is guaranteed to be unreachable from new requests before its
/// ioctx/path are released.
#[derive(Clone)]
pub struct Fid(Arc<FidInner>);

impl Fid {
    pub fn id(&self) -> u32 {
        self.0.id
    }
    pub fn qid(&self) -> Qid {
        self.0.qid
    }
    pub fn user(&self) -> &User {
        &self.0.user
    }
    pub fn aname(&self) -> &str {
        &self.0.aname
    }
    pub fn aux(&self) -> &FidAux {
        &self.0.aux
    }
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Release any open ioctx, unlinking it from the path's sharing list
    /// on last ref (spec.md §4.4 "fid destroy ... closes the ioctx").
    pub fn close_ioctx(&self) {
        let mut slot = self.0.aux.ioctx.lock().unwrap();
        if let Some(ioctx) = slot.take() {
            if ioctx.refcount() == 2 {
                // this slot's clone plus the path's own — about to drop both
                self.0.aux.path.lock().unwrap().remove_ioctx(&ioctx);
            }
        }
    }
}

/// A per-connection hash table keyed by fid id (spec.md §4.4).
pub struct FidPool {
    table: RwLock<HashMap<u32, Fid>>,
}

impl FidPool {
    pub fn new() -> Self {
        FidPool {
            table: RwLock::new(HashMap::new()),
        }
    }

    pub fn find(&self, id: u32) -> Option<Fid> {
        self.table.read().unwrap().get(&id).cloned()
    }

    /// `create(id, aux) -> Fid | EExist` (spec.md §4.4).
    pub fn create(&self, id: u32, qid: Qid, user: User, aname: String, aux: FidAux) -> Result<Fid> {
        let mut table = self.table.write().unwrap();
        if table.contains_key(&id) {
            return Err(Error::No(errno::EBADF));
        }
        let fid = Fid(Arc::new(FidInner {
            id,
            qid,
            user,
            aname,
            aux,
        }));
        table.insert(id, fid.clone());
        Ok(fid)
    }

    /// Install `fid` under `id`, overwriting an existing id (used by the
    /// destructive `Twalk` path where `fid == newfid`, spec.md §4.7).
    pub fn replace(&self, id: u32, fid: Fid) {
        self.table.write().unwrap().insert(id, fid);
    }

    /// `decref_by_id`: drop the pool's reference, running the
    /// subsystem-provided destroy hook if this was the last reference
    /// (spec.md §4.4).
    pub fn destroy(&self, id: u32) -> Option<Fid> {
        let removed = self.table.write().unwrap().remove(&id);
        if let Some(fid) = &removed {
            fid.close_ioctx();
        }
        removed
    }

    /// All fids, for connection teardown (spec.md §4.3 "destroys the fid
    /// pool (which in turn clunks every remaining fid)").
    pub fn drain(&self) -> Vec<Fid> {
        self.table.write().unwrap().drain().map(|(_, f)| f).collect()
    }

    pub fn len(&self) -> usize {
        self.table.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FidPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathPool;
    use ninep_wire::QidType;

    fn test_qid() -> Qid {
        Qid {
            typ: QidType::DIR,
            version: 0,
            path: 1,
        }
    }

    #[test]
    fn create_rejects_duplicate_id() {
        let pool = FidPool::new();
        let paths = PathPool::new();
        let user = User::synthesize(0, "root");
        let aux = FidAux::new(paths.create("/tmp"), FidFlags::empty());
        pool.create(1, test_qid(), user.clone(), "/tmp".into(), aux).unwrap();

        let aux2 = FidAux::new(paths.create("/tmp"), FidFlags::empty());
        let err = pool.create(1, test_qid(), user, "/tmp".into(), aux2).unwrap_err();
        assert_eq!(err.errno(), errno::EBADF);
    }

    #[test]
    fn destroy_removes_from_table() {
        let pool = FidPool::new();
        let paths = PathPool::new();
        let user = User::synthesize(0, "root");
        let aux = FidAux::new(paths.create("/tmp"), FidFlags::empty());
        pool.create(5, test_qid(), user, "/tmp".into(), aux).unwrap();
        assert!(pool.find(5).is_some());
        pool.destroy(5);
        assert!(pool.find(5).is_none());
    }
}
