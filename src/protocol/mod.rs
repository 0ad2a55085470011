//! Client-master communication protocol.
//!
//! This module defines the frames exchanged between a remote cache client and the master
//! process holding the warm cache: the fixed header, the request key payload, the status
//! codes, and a transport that moves frames over a blocking stream.
//!
//! # Binary Format
//!
//! Every frame, in either direction, is a fixed-size [`Header`] followed by exactly
//! `payload_size` bytes:
//!
//! - The header carries a magic value (which also encodes the protocol version), the
//!   request id, the DAO version, the payload length and a [`Status`].
//! - A request payload is a [`RequestKey`]; a response payload is the cached value bytes,
//!   empty unless the status is [`Status::ValueFound`].
//! - All integers are big-endian, fixed width.
//!
//! A receiver always reads the complete header before trusting `payload_size`. A header
//! that fails validation is a host-level failure: the peer is not speaking this protocol.
//!
//! # See Also
//!
//! - [`ConnectionPool`](crate::pool::ConnectionPool): Queues requests for the connections
//!   that drive this protocol on persistent sockets.
mod header;
mod payload;
mod status;
mod transport;

pub use header::{HEADER_SIZE, Header, MAGIC, MAX_PAYLOAD_SIZE};
pub use payload::RequestKey;
pub use status::{Status, StatusClass};
pub use transport::{Phase, ProtocolError, ProtocolTransport, TimedStream, encode_request};
