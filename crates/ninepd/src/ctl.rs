//! Synthetic control filesystem, mounted under `aname = "ctl"` (spec.md
//! §4.9).
//!
//! Grounded on `examples/original_source/diod/ctl.c`: a small, fixed,
//! read-only tree of diagnostic files (`version`, `date`, `connections`,
//! `tpools`, `exports`, `files`, `usercache`) plus the two synthetic
//! byte-stream files every 9P2000.L server traditionally carries for
//! testing (`zero`, `null`) and their fixed-length counterparts
//! (`zero100`, `null100`). Every entry's `Qid` carries the `TMP` bit
//! (spec.md §3/§6): nothing here is backed by a real inode.

use ninep_wire::{Qid, QidType};

use crate::server::Server;

/// What reading an entry produces.
enum CtlKind {
    /// Rendered fresh on each open from live server state.
    Dynamic(fn(&Server) -> String),
    /// Infinite stream of `\0` bytes.
    Zero,
    /// Discards writes, reads as EOF.
    Null,
    /// Exactly `n` zero bytes, then EOF.
    ZeroSized(u64),
    /// Discards writes; reads as `n` bytes of EOF-terminated emptiness.
    NullSized(u64),
}

pub struct CtlEntry {
    pub name: &'static str,
    pub qid: Qid,
    kind: CtlKind,
}

impl CtlEntry {
    /// Materialize this entry's full content given live server state.
    /// Byte-stream entries (`zero`/`null`/sized variants) are capped at
    /// `count` bytes from `offset` by the caller; dynamic text entries
    /// render their entire body and are sliced the same way `Tread`
    /// slices any other file (spec.md §4.9).
    pub fn render(&self, server: &Server) -> Vec<u8> {
        match self.kind {
            CtlKind::Dynamic(f) => f(server).into_bytes(),
            CtlKind::Zero | CtlKind::Null => Vec::new(), // handled specially, see read_at
            CtlKind::ZeroSized(n) => vec![0u8; n as usize],
            CtlKind::NullSized(_) => Vec::new(),
        }
    }

    /// Read `count` bytes at `offset`, special-casing the unbounded
    /// `zero`/`null` streams which `render` cannot materialize in full.
    pub fn read_at(&self, server: &Server, offset: u64, count: u32) -> Vec<u8> {
        match self.kind {
            CtlKind::Zero => vec![0u8; count as usize],
            CtlKind::Null => Vec::new(),
            _ => {
                let data = self.render(server);
                let start = (offset as usize).min(data.len());
                let end = (start + count as usize).min(data.len());
                data[start..end].to_vec()
            }
        }
    }
}

/// The fixed tree itself: one flat directory, `/ctl/<name>` (spec.md
/// §4.9 names no subdirectories).
pub struct ControlTree {
    pub root_qid: Qid,
    entries: Vec<CtlEntry>,
}

impl ControlTree {
    pub fn new() -> Self {
        let mut path = 1u64; // 0 is reserved for the root
        let mut next = || {
            path += 1;
            path - 1
        };

        let entries = vec![
            CtlEntry {
                name: "version",
                qid: tmp_qid(next()),
                kind: CtlKind::Dynamic(|_| format!("{}\n", env!("CARGO_PKG_VERSION"))),
            },
            CtlEntry {
                name: "date",
                qid: tmp_qid(next()),
                kind: CtlKind::Dynamic(|srv| format!("{}\n", srv.uptime().as_secs())),
            },
            CtlEntry {
                name: "connections",
                qid: tmp_qid(next()),
                kind: CtlKind::Dynamic(|srv| srv.dump_connections()),
            },
            CtlEntry {
                name: "tpools",
                qid: tmp_qid(next()),
                kind: CtlKind::Dynamic(|srv| srv.dump_tpools()),
            },
            CtlEntry {
                name: "exports",
                qid: tmp_qid(next()),
                kind: CtlKind::Dynamic(|srv| srv.dump_exports()),
            },
            CtlEntry {
                name: "files",
                qid: tmp_qid(next()),
                kind: CtlKind::Dynamic(|srv| srv.paths.dump_files()),
            },
            CtlEntry {
                name: "usercache",
                qid: tmp_qid(next()),
                kind: CtlKind::Dynamic(|_| String::new()),
            },
            CtlEntry {
                name: "zero",
                qid: tmp_qid(next()),
                kind: CtlKind::Zero,
            },
            CtlEntry {
                name: "null",
                qid: tmp_qid(next()),
                kind: CtlKind::Null,
            },
            CtlEntry {
                name: "zero100",
                qid: tmp_qid(next()),
                kind: CtlKind::ZeroSized(100),
            },
            CtlEntry {
                name: "null100",
                qid: tmp_qid(next()),
                kind: CtlKind::NullSized(100),
            },
        ];

        ControlTree {
            root_qid: Qid {
                typ: QidType::DIR | QidType::TMP,
                version: 0,
                path: 0,
            },
            entries,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&CtlEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn by_qid_path(&self, path: u64) -> Option<&CtlEntry> {
        self.entries.iter().find(|e| e.qid.path == path)
    }

    pub fn entries(&self) -> &[CtlEntry] {
        &self.entries
    }
}

impl Default for ControlTree {
    fn default() -> Self {
        Self::new()
    }
}

fn tmp_qid(path: u64) -> Qid {
    Qid {
        typ: QidType::TMP,
        version: 0,
        path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_entry_has_tmp_bit() {
        let tree = ControlTree::new();
        for e in tree.entries() {
            assert!(e.qid.typ.contains(QidType::TMP) || e.qid.typ.contains(QidType::DIR));
        }
    }

    #[test]
    fn zero_stream_reads_requested_length() {
        let tree = ControlTree::new();
        let entry = tree.lookup("zero").unwrap();
        let server = test_server();
        let data = entry.read_at(&server, 0, 16);
        assert_eq!(data, vec![0u8; 16]);
    }

    #[test]
    fn null_stream_always_empty() {
        let tree = ControlTree::new();
        let entry = tree.lookup("null").unwrap();
        let server = test_server();
        assert!(entry.read_at(&server, 0, 16).is_empty());
    }

    fn test_server() -> std::sync::Arc<Server> {
        use crate::export::ExportTable;
        use crate::server::{Server, ServerOptions};
        Server::new(ServerOptions::default(), ExportTable::new(Vec::new(), false))
    }
}
