//! Command-line configuration (SPEC_FULL "Configuration").
//!
//! Grounded on the teacher's `unpfs::Cli` (`clap::Parser`, `#[arg(long,
//! default_value_t = ...)]`) and `examples/original_source/src/diod/diod.c`'s
//! option table for the flags themselves (exports file, thread count,
//! msize, no-user-db, allsquash).

use std::path::PathBuf;

use clap::Parser;

use crate::export::{Export, ExportFlags, ExportTable, UserPattern};
use crate::hostlist::HostPattern;
use crate::server::ServerOptions;

#[derive(Debug, Parser)]
#[command(name = "ninepd", about = "9P2000.L file server")]
pub struct Cli {
    /// proto!address!port, e.g. tcp!0.0.0.0!564 or unix!/run/ninepd.sock
    pub listen: String,

    /// Exports file, one `path hosts users flags` line per export
    /// (spec.md §4.8). If omitted, a single export of `exportdir` open to
    /// all hosts/users is synthesized.
    #[arg(long)]
    pub exports_file: Option<PathBuf>,

    /// Directory to export when `--exports-file` is not given.
    #[arg(long)]
    pub exportdir: Option<PathBuf>,

    #[arg(long, default_value_t = 65536 + 24)]
    pub msize: u32,

    #[arg(long, default_value_t = 16)]
    pub worker_threads: usize,

    #[arg(long, default_value_t = 256 * 1024)]
    pub max_mmap: usize,

    /// Synthesize users from bare uids instead of consulting the host
    /// passwd database (spec.md §3 "no user DB" mode).
    #[arg(long)]
    pub no_user_db: bool,

    /// Assume per-request fs-identity via `setfsuid`/`setfsgid` (spec.md
    /// §4.8). Disable only when running as a single unprivileged user.
    #[arg(long, default_value_t = true)]
    pub setfsid: bool,

    /// Allow DAC_BYPASS capability bracketing for root-authenticated
    /// connections (spec.md §4.8).
    #[arg(long)]
    pub dac_bypass: bool,

    /// Export all live mounts found under `/proc/self/mounts` in addition
    /// to configured exports (spec.md §4.8).
    #[arg(long)]
    pub export_all_mounts: bool,

    /// Route every attach onto the "default" worker pool instead of one
    /// pool per distinct `aname` (spec.md §4.6 `tpool_select`).
    #[arg(long)]
    pub single_pool: bool,
}

impl Cli {
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            msize: self.msize,
            worker_threads: self.worker_threads,
            max_mmap: self.max_mmap,
            no_user_db: self.no_user_db,
            setfsid: self.setfsid,
            dac_bypass: self.dac_bypass,
            setgroups: true,
            single_pool: self.single_pool,
        }
    }

    /// Build the export table either from `--exports-file` or from the
    /// single `--exportdir` fallback (spec.md §4.8).
    pub fn export_table(&self) -> crate::error::Result<ExportTable> {
        if let Some(path) = &self.exports_file {
            let text = std::fs::read_to_string(path).map_err(crate::error::Error::Io)?;
            Ok(ExportTable::new(parse_exports_file(&text), self.export_all_mounts))
        } else {
            let dir = self
                .exportdir
                .as_ref()
                .ok_or(crate::error::Error::No(crate::error::errno::EINVAL))?
                .to_string_lossy()
                .into_owned();
            Ok(ExportTable::new(
                vec![Export {
                    path: dir,
                    user_pattern: UserPattern::Any,
                    host_pattern: HostPattern::Any,
                    flags: ExportFlags::empty(),
                    squash_user: None,
                }],
                self.export_all_mounts,
            ))
        }
    }
}

/// One line per export: `path hosts users flags` (spec.md §4.8), `flags`
/// a comma-separated subset of `ro,sharefd,noauth,allsquash,suppress`.
/// Blank lines and lines starting with `#` are skipped.
fn parse_exports_file(text: &str) -> Vec<Export> {
    let mut exports = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(path) = fields.next() else { continue };
        let hosts = fields.next().unwrap_or("*");
        let users = fields.next().unwrap_or("*");
        let flag_field = fields.next().unwrap_or("");

        let mut flags = ExportFlags::empty();
        let mut squash_user = None;
        for tok in flag_field.split(',') {
            match tok {
                "ro" => flags |= ExportFlags::RO,
                "sharefd" => flags |= ExportFlags::SHAREFD,
                "noauth" => flags |= ExportFlags::NOAUTH,
                "suppress" => flags |= ExportFlags::SUPPRESS,
                s if s.starts_with("allsquash=") => {
                    flags |= ExportFlags::ALLSQUASH;
                    squash_user = Some(s["allsquash=".len()..].to_owned());
                }
                _ => {}
            }
        }

        let user_pattern = if users == "*" {
            UserPattern::Any
        } else {
            UserPattern::Named(users.split(',').map(str::to_owned).collect())
        };

        exports.push(Export {
            path: path.to_owned(),
            user_pattern,
            host_pattern: HostPattern::parse(hosts),
            flags,
            squash_user,
        });
    }
    exports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags_and_allsquash_target() {
        let text = "/scratch a[0-3] * ro,allsquash=nobody\n# comment\n\n/home * * \n";
        let exports = parse_exports_file(text);
        assert_eq!(exports.len(), 2);
        assert!(exports[0].flags.contains(ExportFlags::RO));
        assert!(exports[0].flags.contains(ExportFlags::ALLSQUASH));
        assert_eq!(exports[0].squash_user.as_deref(), Some("nobody"));
        assert_eq!(exports[1].path, "/home");
    }
}
