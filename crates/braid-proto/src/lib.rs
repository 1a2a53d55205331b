//! Wire codec for the SRTLA link-aggregation protocol and the framing of
//! the SRT stream it relays.
//!
//! The codec is stateless: classification and parsing borrow the caller's
//! receive buffer, encoding appends to a caller-provided `BytesMut`. The
//! relayed SRT payload is opaque apart from its type word and data
//! sequence numbers.

pub mod error;
pub mod packet;
pub mod reg;

pub use error::ProtocolError;
pub use packet::PacketKind;
