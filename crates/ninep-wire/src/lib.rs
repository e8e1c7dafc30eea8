//! 9P2000.L wire protocol: message types, bit flags, and the binary codec
//! used to move them over a byte stream.
//!
//! This crate only describes the protocol (spec.md §4.1, §6): it owns no
//! file descriptors, spawns no threads, and knows nothing about exports,
//! fids, or authorization. The server that gives these messages meaning
//! lives in the `ninepd` crate.

pub mod error;
pub mod fcall;
pub mod serialize;

pub use error::{errno, Error, Result};
pub use fcall::*;
pub use serialize::{read_msg, write_msg, Decodable, Decoder, Encodable, Encoder};
