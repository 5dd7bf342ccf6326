//! Multiplexed stream transport over local sockets.
//!
//! beam lets two processes open any number of independent, bidirectional
//! byte streams over one local connection. Every stream is announced with a
//! header map and carries its own descriptor, which may be a private socket
//! pair or any descriptor the sender chooses to hand over.
//!
//! # Crate Structure
//!
//! - [`transport`]: connection with descriptor passing, listener, endpoints
//! - [`data`]: binary-safe header map and its wire codec
//! - [`session`]: sessions, streams, routing and named jobs

/// Re-export transport types.
pub mod transport {
    pub use beam_transport::*;
}

/// Re-export header codec types.
pub mod data {
    pub use beam_data::*;
}

/// Re-export session types.
pub mod session {
    pub use beam_session::*;
}

pub use beam_data::Msg;
pub use beam_session::{Role, Router, Session, SessionError, Stream};
