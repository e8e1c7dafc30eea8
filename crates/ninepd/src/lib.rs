//! `ninepd`: a 9P2000.L file server (spec.md §1-§4).
//!
//! Wire types and the codec live in `ninep_wire`; everything in this
//! crate is the server proper: connections, the fid/path/ioctx pools,
//! per-`aname` worker pools, user identity and export authorization, and
//! the synthetic control filesystem mounted at `aname = "ctl"`.

pub mod config;
pub mod conn;
pub mod ctl;
pub mod error;
pub mod export;
pub mod fid;
pub mod handlers;
pub mod hostlist;
pub mod identity;
pub mod ioctx;
pub mod path;
pub mod pool;
pub mod server;
pub mod transport;
pub mod user;

pub use error::{Error, Result};
pub use server::{Server, ServerOptions};
