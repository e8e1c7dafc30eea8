//! Named worker thread pools (spec.md §3 "ThreadPool", §4.6).
//!
//! Grounded on `examples/original_source/libnpfs/npfs.h`'s `Nptpool`/
//! `Npwthread`/`Npstats` and `libnpfs/srv.c`'s worker loop; reimplemented
//! with `std::sync::{Mutex, Condvar}` driving a `VecDeque` instead of the
//! C code's hand-rolled linked list plus condition variable pair, since
//! that is the idiomatic Rust shape for the same job.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::conn::Req;
use crate::server::Server;

/// Per-pool counters surfaced through `/ctl/tpools` (SPEC_FULL, grounded
/// on `ctl.c _ctl_get_tpool` / `Npstats`).
#[derive(Default)]
pub struct PoolStats {
    pub requests: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

impl PoolStats {
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.requests.load(Ordering::Relaxed),
            self.bytes_read.load(Ordering::Relaxed),
            self.bytes_written.load(Ordering::Relaxed),
        )
    }
}

struct Queue {
    pending: Mutex<VecDeque<Arc<Req>>>,
    cv: Condvar,
}

/// A named pool of blocking worker threads (spec.md §3 "ThreadPool",
/// §4.6). One pool per distinct `aname` so a wedged export does not
/// block others; "default" always exists.
pub struct ThreadPool {
    pub name: String,
    queue: Arc<Queue>,
    in_progress: Mutex<Vec<Arc<Req>>>,
    pub stats: PoolStats,
    shutdown: Arc<AtomicBool>,
    refcount: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    pub fn spawn(name: String, nwthread: usize, server: Arc<Server>) -> Arc<ThreadPool> {
        let pool = Arc::new(ThreadPool {
            name,
            queue: Arc::new(Queue {
                pending: Mutex::new(VecDeque::new()),
                cv: Condvar::new(),
            }),
            in_progress: Mutex::new(Vec::new()),
            stats: PoolStats::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
            refcount: AtomicU64::new(1),
            workers: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(nwthread);
        for _ in 0..nwthread {
            let pool_clone = Arc::clone(&pool);
            let server_clone = Arc::clone(&server);
            handles.push(std::thread::spawn(move || worker_loop(pool_clone, server_clone)));
        }
        *pool.workers.lock().unwrap() = handles;
        pool
    }

    /// Enqueue a request for this pool's workers (spec.md §4.3
    /// "srv.enqueue(req)").
    pub fn enqueue(&self, req: Arc<Req>) {
        let mut pending = self.queue.pending.lock().unwrap();
        pending.push_back(req);
        self.queue.cv.notify_one();
    }

    /// Find a pending (not yet in-progress) request with this tag,
    /// removing it if found — used by `Tflush`'s inline handling
    /// (spec.md §4.3).
    pub fn remove_pending(&self, conn_id: u64, oldtag: u16) -> Option<Arc<Req>> {
        let mut pending = self.queue.pending.lock().unwrap();
        let pos = pending
            .iter()
            .position(|r| r.conn_id == conn_id && r.tag == oldtag)?;
        pending.remove(pos)
    }

    /// Find an in-progress request with this tag (spec.md §4.3).
    pub fn find_in_progress(&self, conn_id: u64, oldtag: u16) -> Option<Arc<Req>> {
        self.in_progress
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.conn_id == conn_id && r.tag == oldtag)
            .cloned()
    }

    pub fn incref(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the refcount after decrementing.
    pub fn decref(&self) -> u64 {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.queue.cv.notify_all();
        let handles = std::mem::take(&mut *self.workers.lock().unwrap());
        for h in handles {
            let _ = h.join();
        }
    }

    pub fn pending_len(&self) -> usize {
        self.queue.pending.lock().unwrap().len()
    }

    pub fn in_progress_len(&self) -> usize {
        self.in_progress.lock().unwrap().len()
    }
}

/// One worker thread's main loop (spec.md §4.6).
fn worker_loop(pool: Arc<ThreadPool>, server: Arc<Server>) {
    loop {
        let req = {
            let mut pending = pool.queue.pending.lock().unwrap();
            loop {
                if pool.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Some(req) = pending.pop_front() {
                    break req;
                }
                pending = pool.queue.cv.wait(pending).unwrap();
            }
        };

        pool.in_progress.lock().unwrap().push(Arc::clone(&req));

        crate::handlers::dispatch(&server, &req);

        pool.in_progress.lock().unwrap().retain(|r| !Arc::ptr_eq(r, &req));
        pool.stats.requests.fetch_add(1, Ordering::Relaxed);

        crate::conn::finish_request(&server, &req);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::ExportTable;
    use crate::server::ServerOptions;
    use ninep_wire::Fcall;

    fn test_req(conn_id: u64, tag: u16) -> Arc<Req> {
        Arc::new(Req {
            conn_id,
            conn: test_conn(),
            tag,
            tcall: Fcall::TStatFs { fid: 0 },
            state: Mutex::new(crate::conn::ReqState::Normal),
            reply: Mutex::new(None),
            flush_chain: Mutex::new(Vec::new()),
            fid: Mutex::new(None),
        })
    }

    fn test_conn() -> Arc<crate::conn::Connection> {
        struct NullTransport;
        impl crate::transport::Transport for NullTransport {
            fn recv(&self, _msize: u32) -> crate::error::Result<Option<ninep_wire::Msg>> {
                Ok(None)
            }
            fn send(&self, _msg: &ninep_wire::Msg) -> crate::error::Result<()> {
                Ok(())
            }
            fn client_id(&self) -> String {
                "test".to_owned()
            }
            fn destroy(&self) {}
        }
        crate::conn::Connection::new(Arc::new(NullTransport), 8192)
    }

    /// A pool spawned with zero workers never dequeues on its own, so
    /// enqueue/remove_pending can be exercised deterministically.
    fn idle_pool() -> Arc<ThreadPool> {
        let server = Server::new(ServerOptions::default(), ExportTable::new(Vec::new(), false));
        ThreadPool::spawn("test".to_owned(), 0, server)
    }

    #[test]
    fn enqueue_then_remove_pending_roundtrips() {
        let pool = idle_pool();
        let req = test_req(1, 7);
        pool.enqueue(Arc::clone(&req));
        assert_eq!(pool.pending_len(), 1);

        let found = pool.remove_pending(1, 7).unwrap();
        assert!(Arc::ptr_eq(&found, &req));
        assert_eq!(pool.pending_len(), 0);
    }

    #[test]
    fn remove_pending_is_scoped_to_conn_and_tag() {
        let pool = idle_pool();
        pool.enqueue(test_req(1, 7));
        assert!(pool.remove_pending(2, 7).is_none());
        assert!(pool.remove_pending(1, 8).is_none());
        assert!(pool.remove_pending(1, 7).is_some());
    }

    #[test]
    fn find_in_progress_sees_only_dequeued_requests() {
        let pool = idle_pool();
        let req = test_req(1, 9);
        pool.enqueue(Arc::clone(&req));
        assert!(pool.find_in_progress(1, 9).is_none());

        pool.in_progress.lock().unwrap().push(req);
        assert!(pool.find_in_progress(1, 9).is_some());
    }

    #[test]
    fn refcount_tracks_incref_decref() {
        let pool = idle_pool();
        pool.incref();
        assert_eq!(pool.decref(), 1);
        assert_eq!(pool.decref(), 0);
    }
}
