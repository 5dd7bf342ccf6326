//! Local duplex transport with file descriptor passing.
//!
//! Every message is a single `sendmsg`/`recvmsg` on a `SOCK_SEQPACKET` Unix
//! socket: an opaque byte payload plus up to a small fixed number of
//! descriptors carried as `SCM_RIGHTS` ancillary data.
//!
//! This is the lowest layer of beam. The session layer builds on the
//! [`Conn`] and [`Endpoint`] types provided here.

#![cfg(unix)]

pub mod conn;
pub mod endpoint;
pub mod error;
pub mod uds;

mod sys;

pub use conn::{Conn, ConnConfig, RawMessage, INHERITED_FD, INHERITED_FD_ENV};
pub use endpoint::Endpoint;
pub use error::{Result, TransportError};
pub use uds::{connect, UnixSeqpacketListener};
