//! Multiplexed streams over a single beam connection.
//!
//! A [`Session`] wraps one transport connection and turns it into any number
//! of independent, bidirectional [`Stream`]s. Each stream is announced with a
//! small header message and carries its own descriptor, so reading and
//! writing a stream never touches the control connection.
//!
//! Inbound streams are either pulled with [`Session::receive`] or dispatched
//! by a [`Router`] according to their parent and headers. A [`Hub`] brokers
//! connections between clients and backends exposed by name.

#![cfg(unix)]

pub mod error;
pub mod hub;
pub mod id;
pub mod jobs;
pub mod router;
pub mod session;
pub mod stream;

pub use error::{IdError, Result, SessionError};
pub use hub::Hub;
pub use id::{IdAllocator, Parity, Role};
pub use jobs::{Job, JobServer, RemoteJob};
pub use router::{HandleFunc, RouteBuilder, Router, StreamReceiver, StreamSender};
pub use session::{Session, SessionConfig, DEFAULT_RECEIVE_BACKLOG};
pub use stream::Stream;
