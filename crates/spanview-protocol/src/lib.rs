//! Wire protocol for spanview sessions: the 24-byte frame header, the
//! message catalog with its JSON payload encodings, and the UDP discovery
//! datagram format.

pub mod discovery;
pub mod error;
pub mod frame;
pub mod messages;
pub mod types;
