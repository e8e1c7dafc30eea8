//! Error type and errno constants for the wire protocol.
//!
//! The only error reply 9P2000.L defines is `Rlerror(ecode)`, a raw Linux
//! errno. Everything that can go wrong on the server side is eventually
//! reduced to one of these numbers before being put on the wire (see
//! spec.md §7).

use std::io;

/// Linux errno values used throughout this crate and `ninepd`.
///
/// Numeric, not `libc::*`, so that `ninep-wire` stays free of a libc
/// dependency: these are wire constants, not syscall return values.
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const EBADF: i32 = 9;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EACCES: i32 = 13;
    pub const EEXIST: i32 = 17;
    pub const ENOTDIR: i32 = 20;
    pub const EISDIR: i32 = 21;
    pub const EINVAL: i32 = 22;
    pub const EMFILE: i32 = 24;
    pub const EROFS: i32 = 30;
    pub const ERANGE: i32 = 34;
    pub const ENOSYS: i32 = 38;
    pub const ELOOP: i32 = 40;
    pub const ENOTEMPTY: i32 = 39;
    pub const EOPNOTSUPP: i32 = 95;
    pub const ENODATA: i32 = 61;
    pub const EPROTO: i32 = 71;
    pub const EINTR: i32 = 4;
    pub const ENOTSUP: i32 = EOPNOTSUPP;
}

/// Error type shared by the wire codec and the server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A raw Linux errno to be reported to the client as `Rlerror`.
    #[error("errno {0}")]
    No(i32),
    /// An underlying I/O failure; converted to an errno at the
    /// `Rlerror` boundary via [`Error::errno`].
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Reduce self to the Linux errno that should be put on the wire.
    pub fn errno(&self) -> i32 {
        match self {
            Error::No(e) => *e,
            Error::Io(e) => e.raw_os_error().unwrap_or(errno::EIO),
        }
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}
