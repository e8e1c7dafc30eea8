//! Server-wide path interning pool (spec.md §3, §4.5, §9).
//!
//! Grounded on `examples/original_source/diod/ioctx.c`'s `path_struct`/
//! `pathpool_struct`/`_path_alloc`/`path_decref`, reworked per spec.md §9's
//! design note: instead of hand-rolled refcounts and a hash table walked
//! under a single lock, the pool is a weak-map — `Arc<PathInner>` is the
//! strong reference fids and ioctxs hold, `Weak<PathInner>` is what the
//! pool's hash table stores, and `Drop` on the last `Arc` evicts the entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::ioctx::IoCtx;

struct PathInner {
    s: String,
    pool: Weak<Mutex<HashMap<String, Weak<PathInner>>>>,
    /// IOCtx objects currently open against this path (spec.md §3: "owns
    /// the list of IOCtx objects currently open against it").
    ioctxs: Mutex<Vec<IoCtx>>,
}

impl Drop for PathInner {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            let mut map = pool.lock().unwrap();
            if let Some(weak) = map.get(&self.s) {
                if weak.strong_count() == 0 {
                    map.remove(&self.s);
                }
            }
        }
    }
}

/// Cloning a `Path` increfs (`Arc::clone`); dropping the last clone evicts
/// it from the pool automatically.
#[derive(Clone)]
pub struct Path(Arc<PathInner>);

impl Path {
    pub fn as_str(&self) -> &str {
        &self.0.s
    }

    pub fn len(&self) -> usize {
        self.0.s.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.s.is_empty()
    }

    /// Current refcount: fids referencing this path plus ioctxs attached
    /// to it (spec.md §3).
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn push_ioctx(&self, ioctx: IoCtx) {
        self.0.ioctxs.lock().unwrap().push(ioctx);
    }

    pub fn remove_ioctx(&self, target: &IoCtx) {
        let mut list = self.0.ioctxs.lock().unwrap();
        if let Some(pos) = list.iter().position(|i| i.ptr_eq(target)) {
            list.remove(pos);
        }
    }

    /// Find a sharable ioctx per spec.md §4.5: same qid type FILE, same
    /// open flags, same owning uid.
    pub fn find_sharable(&self, open_flags: u32, uid: u32) -> Option<IoCtx> {
        let list = self.0.ioctxs.lock().unwrap();
        list.iter()
            .find(|i| i.is_sharable_match(open_flags, uid))
            .cloned()
    }

    /// `(unique, shared)` counts for `/ctl/files` (spec.md §8 scenario 5),
    /// grounded on `ioctx.c`'s `_count_ioctx`.
    pub fn ioctx_counts(&self) -> (usize, usize) {
        let list = self.0.ioctxs.lock().unwrap();
        let unique = list.len();
        // refcount() counts this list's own clone too, so subtract it to
        // get the number of fids sharing each ioctx.
        let shared: usize = list.iter().map(|i| i.refcount() - 1).sum();
        (unique, shared)
    }
}

impl PartialEq for Path {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Path {}

/// The server-wide interning pool (spec.md §4.5: "the server owns one
/// string-keyed hash table").
pub struct PathPool {
    map: Arc<Mutex<HashMap<String, Weak<PathInner>>>>,
}

impl PathPool {
    pub fn new() -> Self {
        PathPool {
            map: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn intern(&self, s: String) -> Path {
        let mut map = self.map.lock().unwrap();
        if let Some(weak) = map.get(&s) {
            if let Some(strong) = weak.upgrade() {
                return Path(strong);
            }
        }
        let inner = Arc::new(PathInner {
            s: s.clone(),
            pool: Arc::downgrade(&self.map),
            ioctxs: Mutex::new(Vec::new()),
        });
        map.insert(s, Arc::downgrade(&inner));
        Path(inner)
    }

    /// `path_create` (spec.md §4.5): intern an absolute, canonical string.
    pub fn create(&self, s: &str) -> Path {
        self.intern(s.to_owned())
    }

    /// `path_append` (spec.md §4.5): intern `parent/name`.
    pub fn append(&self, parent: &Path, name: &str) -> Path {
        let mut s = String::with_capacity(parent.len() + 1 + name.len());
        s.push_str(parent.as_str());
        if !s.ends_with('/') {
            s.push('/');
        }
        s.push_str(name);
        self.intern(s)
    }

    /// Number of distinct interned paths, for diagnostics.
    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render one line per interned path for `/ctl/files`: `refcount
    /// shared unique path` (spec.md §8 scenario 5, grounded on
    /// `ioctx.c _get_one_file`).
    pub fn dump_files(&self) -> String {
        let map = self.map.lock().unwrap();
        let mut out = String::new();
        for (s, weak) in map.iter() {
            if let Some(strong) = weak.upgrade() {
                let path = Path(strong);
                let (unique, shared) = path.ioctx_counts();
                out.push_str(&format!(
                    "{} {} {} {}\n",
                    path.refcount(),
                    shared,
                    unique,
                    s
                ));
            }
        }
        out
    }
}

impl Default for PathPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_same_object() {
        let pool = PathPool::new();
        let a = pool.create("/tmp");
        let b = pool.create("/tmp");
        assert_eq!(a, b);
        assert_eq!(a.refcount(), 2);
    }

    #[test]
    fn drop_evicts_from_pool() {
        let pool = PathPool::new();
        {
            let _p = pool.create("/tmp/x");
            assert_eq!(pool.len(), 1);
        }
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn append_joins_with_slash() {
        let pool = PathPool::new();
        let parent = pool.create("/tmp");
        let child = pool.append(&parent, "hello");
        assert_eq!(child.as_str(), "/tmp/hello");
    }
}
