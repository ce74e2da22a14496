//! # Peer Information
//!
//! Addresses of remote peers as reported by the tracker, and the protocol
//! state kept for each live connection.
//!
//! ## Compact Peer Format
//!
//! The compact format consists of 6-byte entries:
//!
//! ```text
//! <IP: 4 bytes><Port: 2 bytes>
//! ```
//!
//! Both fields are in network byte order (big-endian).

use crate::bitfield::Bitfield;

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ByteOrder};

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

const PEER_SIZE: usize = 6;

/// A peer candidate: where to reach it and, if the tracker said so, who it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: Option<[u8; 20]>,
    pub addr: SocketAddr,
}

impl PeerInfo {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        PeerInfo {
            id: None,
            addr: SocketAddr::new(ip, port),
        }
    }
}

/// Parses a compact peer list from a tracker response.
///
/// # Errors
///
/// Returns an error if the list length is not a multiple of 6 bytes.
pub fn parse_compact_peers(buf: &[u8]) -> Result<Vec<PeerInfo>> {
    if buf.len() % PEER_SIZE != 0 {
        return Err(anyhow!("received invalid peers from tracker"));
    }

    Ok(buf
        .chunks_exact(PEER_SIZE)
        .map(|entry| {
            let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
            let port = BigEndian::read_u16(&entry[4..6]);
            PeerInfo::new(IpAddr::V4(ip), port)
        })
        .collect())
}

/// Protocol state of one connection, from our side.
#[derive(Debug, Clone)]
pub struct PeerState {
    /// Pieces the remote peer has announced
    pub bitfield: Bitfield,
    /// We sent INTERESTED
    pub am_interested: bool,
    /// A REQUEST is in flight on this connection
    pub request_outstanding: bool,
    /// The peer allows us to request
    pub unchoked_by_peer: bool,
    /// We allow the peer to request
    pub unchoking_peer: bool,
}

impl PeerState {
    pub fn new(num_pieces: usize) -> Self {
        PeerState {
            bitfield: Bitfield::new(num_pieces),
            am_interested: false,
            request_outstanding: false,
            unchoked_by_peer: false,
            unchoking_peer: false,
        }
    }
}
