//! # Handshake
//!
//! The first exchange on every connection. It proves both sides refer to the
//! same torrent before any framed message is sent.
//!
//! ## Message Format
//!
//! The handshake is a fixed 68-byte message:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte - length of the protocol string (19)
//! - **pstr**: 19 bytes - "BitTorrent protocol"
//! - **reserved**: 8 bytes - all zeros
//! - **info_hash**: 20 bytes - SHA-1 of the torrent's info dictionary
//! - **peer_id**: 20 bytes - sender's identifier
//!
//! Decoding only checks the layout. Whether the info hash belongs to our
//! torrent is decided by the peer session.

use crate::error::FormatError;

const PROTOCOL_ID: &[u8; 19] = b"BitTorrent protocol";

/// Total size of an encoded handshake.
pub const HANDSHAKE_LEN: usize = 1 + PROTOCOL_ID.len() + 8 + 20 + 20;

const INFO_HASH_OFFSET: usize = 1 + PROTOCOL_ID.len() + 8;
const PEER_ID_OFFSET: usize = INFO_HASH_OFFSET + 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    pub info_hash: [u8; 20],
    /// 20-byte identifier of the sending peer
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake { info_hash, peer_id }
    }

    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_ID.len() as u8;
        buf[1..=PROTOCOL_ID.len()].copy_from_slice(PROTOCOL_ID);
        // reserved bytes stay zero
        buf[INFO_HASH_OFFSET..PEER_ID_OFFSET].copy_from_slice(&self.info_hash);
        buf[PEER_ID_OFFSET..].copy_from_slice(&self.peer_id);
        buf
    }
}

/// Deserializes a received handshake.
///
/// Fails unless `buf` is exactly 68 bytes and names the expected protocol.
/// Reserved bytes are ignored.
pub fn deserialize_handshake(buf: &[u8]) -> Result<Handshake, FormatError> {
    if buf.len() != HANDSHAKE_LEN {
        return Err(FormatError::HandshakeLength(buf.len()));
    }
    if buf[0] as usize != PROTOCOL_ID.len() || &buf[1..=PROTOCOL_ID.len()] != PROTOCOL_ID {
        return Err(FormatError::ProtocolName);
    }

    let mut info_hash = [0; 20];
    info_hash.copy_from_slice(&buf[INFO_HASH_OFFSET..PEER_ID_OFFSET]);
    let mut peer_id = [0; 20];
    peer_id.copy_from_slice(&buf[PEER_ID_OFFSET..]);

    Ok(Handshake { info_hash, peer_id })
}
