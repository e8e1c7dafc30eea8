//! The top-level server object (spec.md §3 "Server", §4.6).
//!
//! Grounded on `examples/original_source/libnpfs/npfs.h`'s `Npsrv` and
//! `srv.c`'s `np_srv_add_tpool`/connection-list management; here `Server`
//! owns every server-wide table the rest of the crate threads an `Arc`
//! to, and exposes the pool-selection policy spec.md §4.6 calls
//! `tpool_select`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::conn::ConnectionList;
use crate::ctl::ControlTree;
use crate::export::ExportTable;
use crate::path::PathPool;
use crate::pool::ThreadPool;
use crate::user::UserCache;

pub const DEFAULT_POOL: &str = "default";

/// Config knobs that affect request handling but come from `config.rs`
/// (spec.md §4.8, SPEC_FULL "Configuration").
pub struct ServerOptions {
    pub msize: u32,
    pub worker_threads: usize,
    pub max_mmap: usize,
    pub no_user_db: bool,
    pub setfsid: bool,
    pub dac_bypass: bool,
    pub setgroups: bool,
    /// Force every attach onto the "default" pool rather than one pool per
    /// `aname` (spec.md §4.6 `tpool_select`: "If the server is in
    /// single-pool mode ... use the default pool").
    pub single_pool: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            msize: 65536 + 24,
            worker_threads: 16,
            max_mmap: 256 * 1024,
            no_user_db: false,
            setfsid: true,
            dac_bypass: false,
            setgroups: true,
            single_pool: false,
        }
    }
}

/// `(connection list, thread-pool list, user cache, synthetic control-file
/// tree, auth callbacks, global lock)` (spec.md §3 "Server").
pub struct Server {
    pub options: ServerOptions,
    pub connections: ConnectionList,
    pools: Mutex<HashMap<String, Arc<ThreadPool>>>,
    pub users: UserCache,
    pub paths: PathPool,
    pub exports: ExportTable,
    pub ctl: ControlTree,
    start_time: std::time::SystemTime,
    self_ref: Mutex<Option<std::sync::Weak<Server>>>,
}

impl Server {
    pub fn new(options: ServerOptions, exports: ExportTable) -> Arc<Server> {
        let srv = Arc::new(Server {
            users: UserCache::new(options.no_user_db),
            options,
            connections: ConnectionList::new(),
            pools: Mutex::new(HashMap::new()),
            paths: PathPool::new(),
            exports,
            ctl: ControlTree::new(),
            start_time: std::time::SystemTime::now(),
            self_ref: Mutex::new(None),
        });
        *srv.self_ref.lock().unwrap() = Some(Arc::downgrade(&srv));
        srv.get_or_create_pool(DEFAULT_POOL);
        srv
    }

    fn weak_self(&self) -> Arc<Server> {
        self.self_ref
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|w| w.upgrade())
            .expect("Server always holds a weak ref to itself once constructed")
    }

    /// `tpool_select` (spec.md §4.6): one pool per distinct `aname`,
    /// created lazily on first `Tattach`, "default" always present.
    pub fn get_or_create_pool(&self, name: &str) -> Arc<ThreadPool> {
        let mut pools = self.pools.lock().unwrap();
        if let Some(p) = pools.get(name) {
            p.incref();
            return Arc::clone(p);
        }
        let server = self.weak_self();
        let pool = ThreadPool::spawn(name.to_owned(), self.options.worker_threads, server);
        pools.insert(name.to_owned(), Arc::clone(&pool));
        pool
    }

    pub fn default_pool(&self) -> Arc<ThreadPool> {
        self.pools
            .lock()
            .unwrap()
            .get(DEFAULT_POOL)
            .cloned()
            .expect("default pool is created in Server::new")
    }

    /// `tpool_select` (spec.md §4.6): the default pool when the server runs
    /// in single-pool mode or `aname` is not an absolute path, otherwise
    /// the named pool for `aname` (created lazily). The `bool` is whether
    /// the returned pool was incref'd on this call and so needs a matching
    /// `decref` at teardown — the permanent "default" pool is never
    /// attach-refcounted, only per-aname pools are (spec.md §4.6 "pool
    /// reference-counting is driven by attached fids").
    pub fn select_pool_for_aname(&self, aname: &str) -> (Arc<ThreadPool>, bool) {
        if self.options.single_pool || !aname.starts_with('/') {
            (self.default_pool(), false)
        } else {
            (self.get_or_create_pool(aname), true)
        }
    }

    pub fn all_pools(&self) -> Vec<Arc<ThreadPool>> {
        self.pools.lock().unwrap().values().cloned().collect()
    }

    /// Drop a named pool once its last connection has gone (spec.md §4.6).
    /// Never retires "default".
    pub fn retire_pool(&self, name: &str) {
        if name == DEFAULT_POOL {
            return;
        }
        let mut pools = self.pools.lock().unwrap();
        if let Some(pool) = pools.remove(name) {
            pool.shutdown();
        }
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.start_time.elapsed().unwrap_or_default()
    }

    /// `/ctl/tpools` content (spec.md §4.9).
    pub fn dump_tpools(&self) -> String {
        let pools = self.pools.lock().unwrap();
        let mut out = String::new();
        for pool in pools.values() {
            let (requests, bytes_read, bytes_written) = pool.stats.snapshot();
            out.push_str(&format!(
                "{} pending={} in_progress={} requests={} read={} written={}\n",
                pool.name,
                pool.pending_len(),
                pool.in_progress_len(),
                requests,
                bytes_read,
                bytes_written,
            ));
        }
        out
    }

    /// `/ctl/connections` content (spec.md §4.9).
    pub fn dump_connections(&self) -> String {
        let mut out = String::new();
        for conn in self.connections.all() {
            out.push_str(&format!(
                "{} {} fids={}\n",
                conn.id,
                conn.client_id,
                conn.fid_pool.len(),
            ));
        }
        out
    }

    /// `/ctl/exports` content (spec.md §4.9).
    pub fn dump_exports(&self) -> String {
        let mut out = String::new();
        for export in self.exports.visible() {
            out.push_str(&format!("{}\n", export.path));
        }
        out
    }
}
