//! # Piece Store
//!
//! Authoritative status of every piece plus the backing output file.
//!
//! ## Piece Lifecycle
//!
//! ```text
//! Missing --claim_next--> Locked --commit--> Done
//!    ^                      |
//!    +-------release--------+
//! ```
//!
//! - **Missing**: nobody has the piece and nobody is fetching it
//! - **Locked**: exactly one connection has an in-flight request for it
//! - **Done**: verified and written to disk; never reverts
//!
//! ## Concurrency
//!
//! The status table and the file handle each sit behind their own mutex.
//! Critical sections are short and the two locks are never held together.
//! A piece is written to disk before it is marked `Done`, so any reader that
//! observes `Done` also observes the data.
//!
//! ## Resume
//!
//! When the output file already exists with the exact torrent length, each
//! piece region is hashed at startup and verified pieces start out `Done`.

use crate::bitfield::Bitfield;
use crate::error::StoreError;
use crate::torrent::Metainfo;

use boring::sha::sha1;
use parking_lot::Mutex;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    Missing,
    Locked,
    Done,
}

pub struct PieceStore {
    hashes: Vec<[u8; 20]>,
    piece_length: u32,
    length: u64,
    table: Mutex<Vec<PieceStatus>>,
    file: Mutex<File>,
    downloaded: AtomicU64,
    uploaded: AtomicU64,
}

impl PieceStore {
    /// Open the output file for a torrent, resuming from verified content.
    ///
    /// A file whose length differs from the torrent's is truncated and
    /// pre-allocated (sparse) to the full length.
    pub fn open(path: &Path, metainfo: &Metainfo) -> Result<Self, StoreError> {
        let num_pieces = metainfo.num_pieces();
        let hashes = (0..num_pieces as u32)
            .filter_map(|i| metainfo.piece_hash(i).copied())
            .collect::<Vec<_>>();

        let existing = path
            .metadata()
            .map(|m| m.is_file() && m.len() == metainfo.length())
            .unwrap_or(false);

        let mut store = PieceStore {
            hashes,
            piece_length: metainfo.piece_length(),
            length: metainfo.length(),
            table: Mutex::new(vec![PieceStatus::Missing; num_pieces]),
            file: Mutex::new(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(!existing)
                    .open(path)?,
            ),
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
        };

        if existing {
            store.verify_existing()?;
            info!(
                "Resuming '{}': {}/{} pieces already verified",
                path.display(),
                store.snapshot_bitfield().count(),
                store.num_pieces()
            );
        } else {
            store.file.get_mut().set_len(store.length)?;
            debug!(
                "Allocated '{}' ({} bytes, {} pieces)",
                path.display(),
                store.length,
                num_pieces
            );
        }

        Ok(store)
    }

    fn verify_existing(&mut self) -> Result<(), StoreError> {
        let file = self.file.get_mut();
        let table = self.table.get_mut();
        let mut buf = vec![0; self.piece_length as usize];

        file.seek(SeekFrom::Start(0))?;
        for (index, status) in table.iter_mut().enumerate() {
            let len = piece_len(self.piece_length, self.length, index as u32) as usize;
            file.read_exact(&mut buf[..len])?;
            if sha1(&buf[..len]) == self.hashes[index] {
                *status = PieceStatus::Done;
            }
        }

        Ok(())
    }

    pub fn num_pieces(&self) -> usize {
        self.hashes.len()
    }

    /// Byte length of a piece (the last one may be short).
    pub fn piece_len(&self, index: u32) -> u32 {
        piece_len(self.piece_length, self.length, index)
    }

    pub fn status(&self, index: u32) -> Option<PieceStatus> {
        self.table.lock().get(index as usize).copied()
    }

    /// Claim the lowest-index piece that is missing locally and held by the peer.
    ///
    /// The returned piece is `Locked` until it is committed or released.
    pub fn claim_next(&self, remote: &Bitfield) -> Option<u32> {
        let mut table = self.table.lock();
        let index = table
            .iter()
            .enumerate()
            .position(|(i, status)| *status == PieceStatus::Missing && remote.has(i))?;
        table[index] = PieceStatus::Locked;
        Some(index as u32)
    }

    /// Whether the peer holds any piece we have not verified yet.
    ///
    /// Pieces locked by other sessions count, so interest does not flap
    /// while they are in flight. Nothing is claimed.
    pub fn wants_any(&self, remote: &Bitfield) -> bool {
        self.table
            .lock()
            .iter()
            .enumerate()
            .any(|(i, status)| *status != PieceStatus::Done && remote.has(i))
    }

    /// Verify a claimed piece and persist it.
    ///
    /// On a hash mismatch nothing is written and the status is left as it was;
    /// releasing the claim is up to the caller.
    pub fn commit(&self, index: u32, block: &[u8]) -> Result<(), StoreError> {
        let expected = self
            .hashes
            .get(index as usize)
            .ok_or(StoreError::InvalidPiece(index))?;
        if sha1(block) != *expected {
            return Err(StoreError::HashMismatch { index });
        }

        match self.status(index) {
            Some(PieceStatus::Locked) => {}
            Some(_) => return Err(StoreError::NotClaimed(index)),
            None => return Err(StoreError::InvalidPiece(index)),
        }

        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(self.offset(index)))?;
            file.write_all(block)?;
        }

        self.table.lock()[index as usize] = PieceStatus::Done;
        self.downloaded
            .fetch_add(block.len() as u64, Ordering::Relaxed);

        Ok(())
    }

    /// Return a locked piece to `Missing`. Other states are left alone.
    pub fn release(&self, index: u32) {
        let mut table = self.table.lock();
        if let Some(status) = table.get_mut(index as usize) {
            if *status == PieceStatus::Locked {
                *status = PieceStatus::Missing;
            }
        }
    }

    /// Current `Done` pieces as a bitfield.
    pub fn snapshot_bitfield(&self) -> Bitfield {
        self.table
            .lock()
            .iter()
            .map(|status| *status == PieceStatus::Done)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.table
            .lock()
            .iter()
            .all(|status| *status == PieceStatus::Done)
    }

    /// Read a byte range of a verified piece for upload.
    pub fn read_block(&self, index: u32, begin: u32, length: u32) -> Result<Vec<u8>, StoreError> {
        match self.status(index) {
            Some(PieceStatus::Done) => {}
            Some(_) => return Err(StoreError::NotAvailable(index)),
            None => return Err(StoreError::InvalidPiece(index)),
        }
        if begin as u64 + length as u64 > self.piece_len(index) as u64 {
            return Err(StoreError::OutOfRange {
                index,
                begin,
                length,
            });
        }

        let mut block = vec![0; length as usize];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.offset(index) + begin as u64))?;
        file.read_exact(&mut block)?;

        Ok(block)
    }

    /// Bytes verified and written during this session.
    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn record_upload(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Bytes still missing from the file.
    pub fn left(&self) -> u64 {
        let table = self.table.lock();
        table
            .iter()
            .enumerate()
            .filter(|(_, status)| **status != PieceStatus::Done)
            .map(|(i, _)| self.piece_len(i as u32) as u64)
            .sum()
    }

    /// Flush written pieces to stable storage.
    pub fn flush(&self) -> Result<(), StoreError> {
        let mut file = self.file.lock();
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }

    fn offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length as u64
    }
}

fn piece_len(piece_length: u32, length: u64, index: u32) -> u32 {
    let begin = index as u64 * piece_length as u64;
    let end = (begin + piece_length as u64).min(length);
    end.saturating_sub(begin) as u32
}
