//! `ninepd` binary entry point (spec.md §4.8 "Server startup").
//!
//! Grounded on the teacher's `unpfs::main`: `env_logger::init()` plus a
//! `clap::Parser` struct parsed once at startup, a listen string of the
//! form `proto!address!port` parsed the way `rs9p::utils::parse_proto`
//! does. The accept loop itself is rewritten from the teacher's
//! `tokio::spawn`-per-connection onto `std::thread::spawn`-per-connection,
//! since spec.md §5 rules out a cooperative-task runtime.

use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::sync::Arc;

use clap::Parser;

use ninepd::config::Cli;
use ninepd::conn::{self, Connection};
use ninepd::error::{errno, Error, Result};
use ninepd::server::Server;
use ninepd::transport::{tcp_transport, unix_transport, Transport};

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let exit_code = run(cli).unwrap_or_else(|e| {
        log::error!("fatal: {}", e);
        1
    });
    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32> {
    let options = cli.server_options();
    let msize = options.msize;
    let exports = cli.export_table()?;
    let server = Server::new(options, exports);

    let (proto, rest) = split_listen(&cli.listen)?;
    log::info!("ninepd listening on {}", cli.listen);

    match proto {
        "tcp" => serve_tcp(server, rest, msize),
        "unix" => serve_unix(server, rest, msize),
        other => {
            log::error!(
                "unsupported listen protocol {:?} (spec.md §4.2 also names rdma; no crate in \
                 this corpus speaks ibverbs, see DESIGN.md)",
                other
            );
            Err(Error::No(errno::EINVAL))
        }
    }?;
    Ok(0)
}

/// `proto!rest`, `rest` being `host!port` for `tcp` (rejoined into
/// `host:port` for `TcpListener::bind`) or a bare socket path for `unix`.
fn split_listen(addr: &str) -> Result<(&str, &str)> {
    let mut parts = addr.splitn(2, '!');
    let proto = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or(Error::No(errno::EINVAL))?;
    let rest = parts.next().ok_or(Error::No(errno::EINVAL))?;
    Ok((proto, rest))
}

fn serve_tcp(server: Arc<Server>, rest: &str, msize: u32) -> Result<()> {
    let addr = rest.replacen('!', ":", 1);
    let listener = TcpListener::bind(&addr).map_err(Error::Io)?;
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                log::warn!("accept error: {}", e);
                continue;
            }
        };
        match tcp_transport(stream) {
            Ok(t) => spawn_connection(Arc::clone(&server), Arc::new(t), msize),
            Err(e) => log::warn!("transport setup failed: {}", e),
        }
    }
    Ok(())
}

fn serve_unix(server: Arc<Server>, path: &str, msize: u32) -> Result<()> {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path).map_err(Error::Io)?;
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                log::warn!("accept error: {}", e);
                continue;
            }
        };
        match unix_transport(stream) {
            Ok(t) => spawn_connection(Arc::clone(&server), Arc::new(t), msize),
            Err(e) => log::warn!("transport setup failed: {}", e),
        }
    }
    Ok(())
}

fn spawn_connection<T: Transport + 'static>(server: Arc<Server>, transport: Arc<T>, msize: u32) {
    let conn = Connection::new(transport, msize);
    std::thread::spawn(move || conn::run(server, conn));
}
