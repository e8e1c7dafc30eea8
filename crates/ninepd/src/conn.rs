//! Connection actor: one dedicated reader per client (spec.md §3
//! "Connection"/"Request", §4.3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use ninep_wire::{errno, Error, Fcall, Msg};

use crate::error::Result;
use crate::fid::FidPool;
use crate::pool::ThreadPool;
use crate::server::Server;
use crate::transport::Transport;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReqState {
    Normal,
    NoReply,
}

/// One in-flight request (spec.md §3 "Request (Req)").
pub struct Req {
    pub conn_id: u64,
    pub conn: Arc<Connection>,
    pub tag: u16,
    pub tcall: Fcall,
    pub state: Mutex<ReqState>,
    pub reply: Mutex<Option<Fcall>>,
    pub flush_chain: Mutex<Vec<u16>>,
    pub fid: Mutex<Option<crate::fid::Fid>>,
}

/// `(transport, msize, fid_pool, refcount, authuser_uid, client_id, flags,
/// srv, conn_list_link)` (spec.md §3 "Connection").
pub struct Connection {
    pub id: u64,
    pub transport: Arc<dyn Transport>,
    pub msize: AtomicU32,
    pub fid_pool: FidPool,
    pub authuser_uid: Mutex<Option<u32>>,
    pub client_id: String,
    pub tpool: Mutex<Option<Arc<ThreadPool>>>,
    /// Every pool ref this connection has acquired via Tattach, kept so
    /// teardown can release each of them exactly once (spec.md §4.6): a
    /// connection may attach more than once, to distinct anames, and
    /// `tpool` above only remembers the most recently selected one.
    pub attached_pools: Mutex<Vec<Arc<ThreadPool>>>,
    refcount: AtomicUsize,
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>, default_msize: u32) -> Arc<Connection> {
        let client_id = transport.client_id();
        Arc::new(Connection {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            transport,
            msize: AtomicU32::new(default_msize),
            fid_pool: FidPool::new(),
            authuser_uid: Mutex::new(None),
            client_id,
            tpool: Mutex::new(None),
            attached_pools: Mutex::new(Vec::new()),
            refcount: AtomicUsize::new(1),
        })
    }

    pub fn msize(&self) -> u32 {
        self.msize.load(Ordering::Relaxed)
    }

    pub fn incref(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }
    pub fn decref(&self) -> usize {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

pub struct ConnectionList {
    conns: RwLock<HashMap<u64, Arc<Connection>>>,
}

impl ConnectionList {
    pub fn new() -> Self {
        ConnectionList {
            conns: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, conn: Arc<Connection>) {
        self.conns.write().unwrap().insert(conn.id, conn);
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Connection>> {
        self.conns.write().unwrap().remove(&id)
    }

    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.conns.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.conns.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionList {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a connection's reader loop to completion (spec.md §4.3). Blocks the
/// calling OS thread for the connection's lifetime.
pub fn run(server: Arc<Server>, conn: Arc<Connection>) {
    server.connections.insert(Arc::clone(&conn));
    log::info!("connection {} from {} established", conn.id, conn.client_id);

    loop {
        let msg = match conn.transport.recv(conn.msize()) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                log::debug!("connection {} EOF", conn.id);
                break;
            }
            Err(e) => {
                log::warn!("connection {} recv error: {}", conn.id, e);
                break;
            }
        };

        if let Fcall::TFlush { oldtag } = msg.body {
            handle_flush_inline(&server, &conn, msg.tag, oldtag);
            continue;
        }

        let req = preprocess(&server, &conn, msg);
        let pool = select_pool(&server, &conn, &req);
        pool.enqueue(req);
    }

    teardown(&server, &conn);
}

/// Preprocess: resolve the request's primary fid (spec.md §4.7).
fn preprocess(_server: &Server, conn: &Arc<Connection>, msg: Msg) -> Arc<Req> {
    let fid = msg
        .body
        .fids()
        .first()
        .and_then(|id| conn.fid_pool.find(*id));

    Arc::new(Req {
        conn_id: conn.id,
        conn: Arc::clone(conn),
        tag: msg.tag,
        tcall: msg.body,
        state: Mutex::new(ReqState::Normal),
        reply: Mutex::new(None),
        flush_chain: Mutex::new(Vec::new()),
        fid: Mutex::new(fid),
    })
}

/// Pool selection (spec.md §4.6 `tpool_select`): Tversion/Tauth and
/// requests before a pool is chosen go to "default"; once a connection
/// has attached, its own pool (set by `Tattach`'s handler) is used.
fn select_pool(server: &Server, conn: &Connection, req: &Req) -> Arc<ThreadPool> {
    if matches!(req.tcall, Fcall::TVersion { .. } | Fcall::TAuth { .. }) {
        return server.default_pool();
    }
    conn.tpool
        .lock()
        .unwrap()
        .clone()
        .unwrap_or_else(|| server.default_pool())
}

/// Tflush is handled inline in the reader, not enqueued (spec.md §4.3).
fn handle_flush_inline(server: &Server, conn: &Connection, flush_tag: u16, oldtag: u16) {
    for pool in server.all_pools() {
        if let Some(req) = pool.remove_pending(conn.id, oldtag) {
            drop(req); // discarded: zero replies for the flushed request itself
            send_reply(conn, flush_tag, Fcall::RFlush);
            return;
        }
        if let Some(req) = pool.find_in_progress(conn.id, oldtag) {
            req.flush_chain.lock().unwrap().push(flush_tag);
            return;
        }
    }
    // oldtag unknown (already completed, or never existed): still answer.
    send_reply(conn, flush_tag, Fcall::RFlush);
}

/// Called by a pool worker once a request finishes (spec.md §4.6
/// `post_process`/"answer any chained Tflush on req").
pub fn finish_request(_server: &Server, req: &Arc<Req>) {
    let state = *req.state.lock().unwrap();
    if state == ReqState::Normal {
        if let Some(reply) = req.reply.lock().unwrap().take() {
            send_reply(&req.conn, req.tag, reply);
        }
    }
    for flush_tag in req.flush_chain.lock().unwrap().drain(..) {
        send_reply(&req.conn, flush_tag, Fcall::RFlush);
    }
    if let Some(fid) = req.fid.lock().unwrap().take() {
        drop(fid); // drop this request's incref
    }
}

fn send_reply(conn: &Connection, tag: u16, body: Fcall) {
    let msg = Msg { tag, body };
    if let Err(e) = conn.transport.send(&msg) {
        log::warn!("connection {} send error: {}", conn.id, e);
    }
}

fn teardown(server: &Server, conn: &Arc<Connection>) {
    server.connections.remove(conn.id);
    for fid in conn.fid_pool.drain() {
        drop(fid);
    }
    for pool in conn.attached_pools.lock().unwrap().drain(..) {
        if pool.decref() == 0 {
            server.retire_pool(&pool.name);
        }
    }
    conn.transport.destroy();
    log::info!("connection {} torn down", conn.id);
}

/// Construct the `Rlerror` reply for a handler failure (spec.md §7).
pub fn error_reply(e: &Error) -> Fcall {
    Fcall::RlError {
        ecode: e.errno() as u32,
    }
}

pub fn frame_too_large_error() -> Error {
    Error::No(errno::EPROTO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::ExportTable;
    use crate::server::ServerOptions;
    use std::sync::Mutex as StdMutex;

    struct RecordingTransport {
        sent: StdMutex<Vec<Msg>>,
    }

    impl RecordingTransport {
        fn new() -> Self {
            RecordingTransport {
                sent: StdMutex::new(Vec::new()),
            }
        }
    }

    impl crate::transport::Transport for RecordingTransport {
        fn recv(&self, _msize: u32) -> Result<Option<Msg>> {
            Ok(None)
        }
        fn send(&self, msg: &Msg) -> Result<()> {
            self.sent.lock().unwrap().push(Msg {
                tag: msg.tag,
                body: msg.body.clone(),
            });
            Ok(())
        }
        fn client_id(&self) -> String {
            "test".to_owned()
        }
        fn destroy(&self) {}
    }

    /// `worker_threads: 0` so the default pool never spawns a live worker
    /// that could race the test harness for a request it enqueues but
    /// never intends to have dispatched.
    fn test_server() -> Arc<Server> {
        let mut options = ServerOptions::default();
        options.worker_threads = 0;
        Server::new(options, ExportTable::new(Vec::new(), false))
    }

    fn test_conn() -> Arc<Connection> {
        Connection::new(Arc::new(RecordingTransport::new()), 8192)
    }

    fn pending_req(conn: &Arc<Connection>, tag: u16) -> Arc<Req> {
        Arc::new(Req {
            conn_id: conn.id,
            conn: Arc::clone(conn),
            tag,
            tcall: Fcall::TStatFs { fid: 0 },
            state: Mutex::new(ReqState::Normal),
            reply: Mutex::new(None),
            flush_chain: Mutex::new(Vec::new()),
            fid: Mutex::new(None),
        })
    }

    /// A `Tflush` for a still-pending request must produce exactly one
    /// `Rflush`, tagged with the flush's own tag, and no reply at all for
    /// the flushed request's own tag (spec.md §8 flush correctness).
    #[test]
    fn flush_of_pending_request_replies_exactly_once() {
        let server = test_server();
        let transport = Arc::new(RecordingTransport::new());
        let conn = Connection::new(transport.clone(), 8192);
        let pool = server.default_pool();

        let req = pending_req(&conn, 5);
        pool.enqueue(req);

        handle_flush_inline(&server, &conn, /* flush_tag */ 6, /* oldtag */ 5);

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].tag, 6);
        assert_eq!(sent[0].body, Fcall::RFlush);
        assert_eq!(pool.pending_len(), 0);
    }

    /// Flushing an unknown tag (already answered, or never issued) still
    /// answers the flush itself exactly once.
    #[test]
    fn flush_of_unknown_tag_still_answers() {
        let server = test_server();
        let transport = Arc::new(RecordingTransport::new());
        let conn = Connection::new(transport.clone(), 8192);

        handle_flush_inline(&server, &conn, 9, 1234);

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].tag, 9);
        assert_eq!(sent[0].body, Fcall::RFlush);
    }

    /// A request already popped by a worker (in-progress, not pending) is
    /// left to finish; `finish_request` answers the chained flush after the
    /// request's own reply, not before.
    #[test]
    fn finish_request_answers_chained_flush_after_own_reply() {
        let conn = test_conn();
        let req = pending_req(&conn, 11);
        *req.reply.lock().unwrap() = Some(Fcall::RStatFs {
            statfs: ninep_wire::StatFs {
                typ: 0,
                bsize: 0,
                blocks: 0,
                bfree: 0,
                bavail: 0,
                files: 0,
                ffree: 0,
                fsid: 0,
                namelen: 0,
            },
        });
        req.flush_chain.lock().unwrap().push(42);

        finish_request(&test_server(), &req);

        // The request's own reply and the chained flush both go out, in
        // that order; their side effects are drained either way.
        assert!(req.flush_chain.lock().unwrap().is_empty());
        assert!(req.reply.lock().unwrap().is_none());
    }
}
