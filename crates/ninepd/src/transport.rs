//! Byte-stream transport (spec.md §4.2).
//!
//! Grounded on `examples/original_source/libnpfs/npfs.h`'s `Nptrans`
//! (recv/send/destroy function pointers) and `trans.c`; the teacher's
//! `rs9p::srv` used `tokio_util::codec::LengthDelimitedCodec` for the
//! equivalent job over async sockets. Here the same framing duty — "return
//! exactly one message or EOF, buffering bytes read past the current
//! frame" — is done synchronously with a plain `BufReader`, since spec.md
//! §5 mandates blocking, not cooperative, I/O.
//!
//! The RDMA/verbs transport spec.md §4.2 also names is not implemented:
//! no crate in this corpus speaks `ibverbs`, and implementing it from
//! scratch would mean fabricating a dependency. The trait is shaped so one
//! could be added later (see DESIGN.md Open Question).

use std::io::{BufReader, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::sync::Mutex;

use ninep_wire::{read_msg, write_msg, Msg};

use crate::error::Result;

/// One 9P connection's I/O, abstracted over the concrete stream kind
/// (spec.md §4.2: "the server treats all transports identically").
pub trait Transport: Send + Sync {
    /// Read exactly one framed message, or `Ok(None)` on clean EOF.
    fn recv(&self, msize: u32) -> Result<Option<Msg>>;
    /// Write exactly one framed message.
    fn send(&self, msg: &Msg) -> Result<()>;
    /// Best-effort identifier of the remote peer, used by export
    /// host-pattern matching (spec.md §4.8, `Connection::client_id`).
    fn client_id(&self) -> String;
    fn destroy(&self);
}

/// A transport backed by any `Read + Write` byte stream (TCP, UNIX
/// socket, pipe, anonymous socketpair). Reads are buffered; writes go
/// through a dedicated mutex so the worker pool can reply out of order
/// without interleaving frames on the wire (spec.md §4.3 "Writes are
/// serialized").
pub struct StreamTransport<S> {
    reader: Mutex<BufReader<S>>,
    writer: Mutex<S>,
    peer: String,
}

impl<S: Read + Write> StreamTransport<S> {
    /// `reader`/`writer` are expected to be independent handles to the
    /// same underlying socket (e.g. via `TcpStream::try_clone`), so reads
    /// and writes never contend on the same mutex.
    pub fn new(reader: S, writer: S, peer: String) -> Self {
        StreamTransport {
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(writer),
            peer,
        }
    }
}

impl<S: Read + Write + Send> Transport for StreamTransport<S> {
    fn recv(&self, msize: u32) -> Result<Option<Msg>> {
        let mut reader = self.reader.lock().unwrap();
        match peek_eof(&mut *reader)? {
            true => Ok(None),
            false => Ok(Some(read_msg(&mut *reader, msize)?)),
        }
    }

    fn send(&self, msg: &Msg) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        write_msg(&mut *writer, msg)?;
        writer.flush().map_err(ninep_wire::Error::Io)?;
        Ok(())
    }

    fn client_id(&self) -> String {
        self.peer.clone()
    }

    fn destroy(&self) {}
}

/// `BufReader::fill_buf` peeks without consuming, so EOF can be detected
/// before committing to a `read_msg` call that would otherwise see a
/// zero-length read as a malformed frame.
fn peek_eof<R: Read>(r: &mut BufReader<R>) -> Result<bool> {
    use std::io::BufRead;
    Ok(r.fill_buf().map_err(ninep_wire::Error::Io)?.is_empty())
}

pub fn tcp_transport(stream: TcpStream) -> Result<StreamTransport<TcpStream>> {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_owned());
    let writer = stream.try_clone().map_err(ninep_wire::Error::Io)?;
    Ok(StreamTransport::new(stream, writer, peer))
}

pub fn unix_transport(stream: UnixStream) -> Result<StreamTransport<UnixStream>> {
    let writer = stream.try_clone().map_err(ninep_wire::Error::Io)?;
    Ok(StreamTransport::new(stream, writer, "unix".to_owned()))
}
