//! # Torrent Metainfo
//!
//! Parsing of single-file `.torrent` descriptions.
//!
//! ## Torrent File Format
//!
//! Torrent files contain metadata in bencoded format:
//!
//! - **announce**: tracker URL for peer discovery
//! - **info**: dictionary with file information and piece hashes
//! - **pieces**: concatenated 20-byte SHA-1 hashes, one per piece
//! - **piece length**: size of each piece (the last one may be shorter)
//! - **length**: total file size
//! - **name**: suggested filename
//!
//! The info hash identifying the torrent on the wire is the SHA-1 of the
//! bencoded `info` dictionary. It is computed from a generic bencode value so
//! keys this client does not model are still covered by the hash.

use anyhow::{anyhow, Context, Result};
use boring::sha::sha1;
use serde::{Deserialize, Serialize};
use serde_bencode::{de, ser, value::Value};
use serde_bytes::ByteBuf;
use url::Url;

use std::fs;
use std::path::Path;

// Size of SHA-1 hash in bytes
const SHA1_HASH_SIZE: usize = 20;

/// Static description of the file being exchanged.
#[derive(Debug, Clone)]
pub struct Metainfo {
    announce: Url,
    info_hash: [u8; 20],
    piece_hashes: Vec<[u8; 20]>,
    piece_length: u32,
    length: u64,
    name: String,
}

#[derive(Deserialize, Serialize)]
struct BencodeInfo {
    // Concatenation of all pieces 20-byte SHA-1 hashes
    pieces: ByteBuf,
    #[serde(rename = "piece length")]
    piece_length: u32,
    length: u64,
    name: String,
}

#[derive(Deserialize)]
struct BencodeTorrent {
    announce: String,
    info: Value,
}

impl Metainfo {
    /// Open and parse a torrent file.
    pub fn open(path: &Path) -> Result<Self> {
        let buf = fs::read(path)
            .with_context(|| format!("could not read torrent '{}'", path.display()))?;
        Metainfo::from_bytes(&buf)
    }

    /// Parse a bencoded torrent.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let torrent: BencodeTorrent =
            de::from_bytes(buf).map_err(|e| anyhow!("could not decode torrent: {}", e))?;

        let info_bytes = ser::to_bytes(&torrent.info)
            .map_err(|e| anyhow!("could not encode info dictionary: {}", e))?;
        let info: BencodeInfo = de::from_bytes(&info_bytes)
            .map_err(|e| anyhow!("torrent info dictionary is invalid: {}", e))?;

        let announce = parse_announce(&torrent.announce)?;
        let piece_hashes = split_piece_hashes(&info.pieces)?;

        Metainfo::from_parts(
            announce,
            sha1(&info_bytes),
            piece_hashes,
            info.piece_length,
            info.length,
            info.name,
        )
    }

    /// Assemble metainfo from already-decoded fields, checking their consistency.
    pub fn from_parts(
        announce: Url,
        info_hash: [u8; 20],
        piece_hashes: Vec<[u8; 20]>,
        piece_length: u32,
        length: u64,
        name: String,
    ) -> Result<Self> {
        if piece_length == 0 {
            return Err(anyhow!("torrent has a zero piece length"));
        }
        let expected = length.div_ceil(piece_length as u64);
        if expected != piece_hashes.len() as u64 {
            return Err(anyhow!(
                "torrent declares {} bytes in {} byte pieces but carries {} hashes",
                length,
                piece_length,
                piece_hashes.len()
            ));
        }

        Ok(Metainfo {
            announce,
            info_hash,
            piece_hashes,
            piece_length,
            length,
            name,
        })
    }

    pub fn announce(&self) -> &Url {
        &self.announce
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.info_hash
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total size of the file in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Nominal piece size; only the last piece may be shorter.
    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn piece_hash(&self, index: u32) -> Option<&[u8; 20]> {
        self.piece_hashes.get(index as usize)
    }

    /// Byte length of a piece: the nominal length, except for the final piece
    /// which holds the remainder (or a full piece if the remainder is zero).
    pub fn piece_len(&self, index: u32) -> u32 {
        let begin = self.piece_offset(index);
        let end = (begin + self.piece_length as u64).min(self.length);
        end.saturating_sub(begin) as u32
    }

    /// Offset of a piece within the file.
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length as u64
    }
}

fn parse_announce(announce: &str) -> Result<Url> {
    let url = Url::parse(announce)
        .with_context(|| format!("could not parse tracker url '{}'", announce))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(anyhow!("unsupported tracker scheme '{}'", other)),
    }
}

fn split_piece_hashes(pieces: &[u8]) -> Result<Vec<[u8; 20]>> {
    if pieces.len() % SHA1_HASH_SIZE != 0 {
        return Err(anyhow!("torrent piece hashes are not a multiple of 20 bytes"));
    }
    Ok(pieces
        .chunks_exact(SHA1_HASH_SIZE)
        .map(|chunk| {
            let mut hash = [0; SHA1_HASH_SIZE];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}
