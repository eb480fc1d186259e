//! mqpoll-core - MQTT 3.1/3.1.1 packet codec.
//!
//! Pure transformations between packet records and wire bytes. No I/O
//! happens here; the client crate assembles frames off the socket and hands
//! them to [`packet::decode_body`].

pub mod error;
pub mod packet;
pub mod varint;

pub use error::{ProtocolError, Result};
pub use packet::*;
