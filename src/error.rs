//! # Error Types
//!
//! Typed errors for the wire codec, the piece store and peer sessions.
//! The application layer (`main`, metainfo loading, tracker) works with
//! `anyhow` and only sees these through `Display`.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// A buffer that does not decode to a well-formed protocol message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    /// Handshake buffer is not exactly 68 bytes.
    #[error("handshake must be 68 bytes, got {0}")]
    HandshakeLength(usize),

    /// Handshake carries a protocol name other than "BitTorrent protocol".
    #[error("unexpected protocol name in handshake")]
    ProtocolName,

    /// Frame shorter than its length prefix, or payload too short for its id.
    #[error("truncated message (id {id:?}, {len} bytes)")]
    Truncated { id: Option<u8>, len: usize },

    /// Payload longer than the fixed size of its message type.
    #[error("message id {id} has invalid payload length {len}")]
    PayloadLength { id: u8, len: usize },

    /// Message id outside the supported set. Callers skip these frames.
    #[error("unknown message id {0}")]
    UnknownId(u8),

    /// Length prefix exceeds what any legal message could need.
    #[error("frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// Bitfield payload does not cover exactly the torrent's chunk count.
    #[error("bitfield has {actual} bytes, expected {expected}")]
    BitfieldLength { expected: usize, actual: usize },
}

/// Failures raised by the piece store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Block digest disagrees with the metainfo hash. Status is left untouched.
    #[error("piece {index} failed hash verification")]
    HashMismatch { index: u32 },

    #[error("piece index {0} out of range")]
    InvalidPiece(u32),

    #[error("range [{begin}, {begin}+{length}) outside piece {index}")]
    OutOfRange { index: u32, begin: u32, length: u32 },

    /// Commit of a piece nobody claimed.
    #[error("piece {0} is not claimed")]
    NotClaimed(u32),

    /// Upload request for a piece we do not hold yet.
    #[error("piece {0} is not available for upload")]
    NotAvailable(u32),

    #[error("storage io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors that end a peer session.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("info hash mismatch")]
    InfoHashMismatch,

    #[error("malformed message: {0}")]
    Format(#[from] FormatError),

    #[error("piece {index} failed hash verification")]
    HashMismatch { index: u32 },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed by peer")]
    Closed,
}

impl From<StoreError> for PeerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::HashMismatch { index } => PeerError::HashMismatch { index },
            StoreError::Io(e) => PeerError::Io(e),
            other => PeerError::Protocol(other.to_string()),
        }
    }
}
