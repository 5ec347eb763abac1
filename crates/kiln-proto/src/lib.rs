//! Wire protocol for the kiln sampling fabric.
//!
//! Every message on the fabric is a small envelope: optional routing address
//! frames (added by ROUTER sockets), then a single body frame whose first
//! byte is the [`Subject`] tag and whose remainder is a packed little-endian
//! payload. Packing the tag into the body frame keeps the transport's address
//! semantics untouched.

mod message;
mod subject;
pub mod wire;

pub use message::Message;
pub use subject::Subject;

/// Errors produced while encoding or decoding protocol frames.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("empty body frame")]
    EmptyBody,
    #[error("missing body frame")]
    MissingBody,
    #[error("unknown subject: {0:#04x}")]
    UnknownSubject(u8),
    #[error("{what} payload too short: expected at least {expected} bytes, got {actual}")]
    Short {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{what} array is not a multiple of {elem} bytes")]
    RaggedArray { what: &'static str, elem: usize },
}
