//! Server-side error conversions layered on [`ninep_wire::Error`].

pub use ninep_wire::error::errno;
pub use ninep_wire::{Error, Result};

/// Map a `nix` syscall failure to the errno it carries.
pub fn from_nix(e: nix::Error) -> Error {
    Error::No(e as i32)
}

/// Map a `capctl` capability-management failure to `EPERM`: the kernel
/// rejected a prctl/capset call we expected the server's own capability
/// set to allow.
pub fn from_capctl(_e: std::io::Error) -> Error {
    Error::No(errno::EPERM)
}
