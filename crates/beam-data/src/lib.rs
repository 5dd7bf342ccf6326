//! Header messages for beam streams.
//!
//! A [`Msg`] is a case-insensitive multimap from keys to ordered lists of
//! byte-string values. It travels as newline-delimited entries:
//! - `key=value\n` for values without a newline
//! - `key\n` + 8-byte little-endian length + raw bytes for everything else
//!
//! Stream announcements (`id`, `parent-id`, nested `header`) and application
//! headers (`name=stdout`, `content-type=beam-job`) are both encoded this way.

pub mod codec;
pub mod error;
pub mod msg;

pub use codec::{decode_entry, encode, DecodeConfig, Entry, MsgDecoder, DEFAULT_MAX_VALUE_LEN};
pub use error::{DataError, Result};
pub use msg::Msg;
