//! # Peer Session
//!
//! This module drives the protocol with a single remote peer. Every session
//! runs on its own thread and cooperates with the others only through the
//! shared [`Context`]: the piece store hands out work, the sibling registry
//! carries HAVE announcements.
//!
//! ## Session Stages
//!
//! ```text
//! Connecting -> HandshakeSent -> HandshakeVerified -> BitfieldExchanged -> Steady -> Closed
//! ```
//!
//! - **Initiator** connects, sends its handshake, then waits for the peer's.
//! - **Acceptor** waits for the peer's handshake, checks it, then replies.
//!
//! A foreign info hash closes the session before any bitfield is exchanged.
//!
//! ## Steady State
//!
//! Each iteration first tries to put work in flight, then blocks on the next
//! message. We send INTERESTED as soon as the peer has a piece we lack, but
//! only claim a piece (the lowest missing one the peer has) and REQUEST it
//! once the peer has unchoked us. A peer that keeps us choked never pins a
//! piece for longer than one idle interval.
//!
//! - **UNCHOKE / CHOKE**: track whether we may request
//! - **INTERESTED**: unchoke the peer, every interested peer is served
//! - **HAVE**: update the peer's bitfield
//! - **REQUEST**: answer with the block if we unchoked the peer
//! - **PIECE**: verify and persist, then announce HAVE to every session
//!
//! ## Failure Handling
//!
//! Whatever ends the session, a piece still claimed by it is released back to
//! `Missing`. A piece failing verification ends the session with that peer.

use crate::bitfield::Bitfield;
use crate::client::*;
use crate::context::Context;
use crate::error::{FormatError, PeerError, StoreError};
use crate::handshake::Handshake;
use crate::message::*;
use crate::peer::PeerState;

use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Instant;

/// Which side opened the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Connecting,
    HandshakeSent,
    HandshakeVerified,
    BitfieldExchanged,
    Steady,
    Closed,
}

pub struct Worker {
    ctx: Arc<Context>,
    conn: Connection,
    role: Role,
    stage: Stage,
    peer: PeerState,
    /// Piece this session holds `Locked` in the store
    claim: Option<u32>,
    requested_at: Option<Instant>,
    sibling: Option<u64>,
}

impl Worker {
    /// Connect to a peer and run the session until it ends.
    pub fn connect(ctx: Arc<Context>, addr: SocketAddr) -> Result<(), PeerError> {
        let max_frame = max_frame_len(ctx.metainfo.piece_length(), ctx.metainfo.num_pieces());
        let conn = Connection::connect(addr, ctx.config.connect_timeout, max_frame).map_err(|e| {
            warn!("Session with peer {} not started: {}", addr, e);
            e
        })?;
        Worker::new(ctx, conn, Role::Initiator).run()
    }

    /// Run the session for an inbound connection.
    pub fn accept(ctx: Arc<Context>, stream: TcpStream) -> Result<(), PeerError> {
        let max_frame = max_frame_len(ctx.metainfo.piece_length(), ctx.metainfo.num_pieces());
        let remote = stream.peer_addr().ok();
        let conn = Connection::new(stream, max_frame).map_err(|e| {
            warn!("Could not set up inbound connection from {:?}: {}", remote, e);
            PeerError::Io(e)
        })?;
        info!("Accepted connection from peer {}", conn.addr());
        Worker::new(ctx, conn, Role::Acceptor).run()
    }

    fn new(ctx: Arc<Context>, conn: Connection, role: Role) -> Self {
        let peer = PeerState::new(ctx.metainfo.num_pieces());
        Worker {
            ctx,
            conn,
            role,
            stage: Stage::Connecting,
            peer,
            claim: None,
            requested_at: None,
            sibling: None,
        }
    }

    fn run(mut self) -> Result<(), PeerError> {
        let result = self.session();
        let reached = self.stage;
        self.close();

        match &result {
            Ok(()) => info!("Session with peer {} finished", self.conn.addr()),
            Err(e) => warn!(
                "Session with peer {} ({:?}) ended in {:?}: {}",
                self.conn.addr(),
                self.role,
                reached,
                e
            ),
        }
        result
    }

    fn session(&mut self) -> Result<(), PeerError> {
        self.handshake()?;
        self.exchange_bitfields()?;
        self.steady()
    }

    fn advance(&mut self, next: Stage) {
        debug_assert!(next >= self.stage, "{:?} -> {:?}", self.stage, next);
        trace!("Peer {}: {:?} -> {:?}", self.conn.addr(), self.stage, next);
        self.stage = next;
    }

    fn close(&mut self) {
        if let Some(index) = self.claim.take() {
            self.ctx.store.release(index);
            debug!(
                "Released piece {} claimed for peer {}",
                index,
                self.conn.addr()
            );
        }
        if let Some(id) = self.sibling.take() {
            self.ctx.siblings.unregister(id);
        }
        self.conn.shutdown();
        self.advance(Stage::Closed);
    }

    fn handshake(&mut self) -> Result<(), PeerError> {
        self.conn.set_timeout(self.ctx.config.handshake_timeout)?;
        let ours = Handshake::new(self.ctx.metainfo.info_hash(), self.ctx.peer_id);

        match self.role {
            Role::Initiator => {
                self.conn.send_handshake(&ours)?;
                self.advance(Stage::HandshakeSent);
                let theirs = self.conn.read_handshake()?;
                self.verify(&theirs)?;
            }
            Role::Acceptor => {
                let theirs = self.conn.read_handshake()?;
                self.verify(&theirs)?;
                self.conn.send_handshake(&ours)?;
                self.advance(Stage::HandshakeSent);
            }
        }

        self.advance(Stage::HandshakeVerified);
        Ok(())
    }

    fn verify(&self, theirs: &Handshake) -> Result<(), PeerError> {
        if theirs.info_hash != self.ctx.metainfo.info_hash() {
            return Err(PeerError::InfoHashMismatch);
        }
        if theirs.peer_id == self.ctx.peer_id {
            return Err(PeerError::Handshake("connected to ourselves".to_string()));
        }
        Ok(())
    }

    fn exchange_bitfields(&mut self) -> Result<(), PeerError> {
        // Registering and queueing under the order lock keeps sibling HAVEs
        // from overtaking our BITFIELD, and the snapshot taken after
        // registration misses no commit.
        let handle = self.conn.handle();
        {
            let _order = handle.lock();
            self.sibling = Some(self.ctx.siblings.register(Arc::clone(&handle)));
            let ours = self.ctx.store.snapshot_bitfield();
            // the queue holds at most our handshake, so this does not wait
            self.conn.send(&Message::Bitfield(ours.as_bytes().to_vec()))?;
        }
        trace!(
            "Peer {} registered, {} live sessions",
            self.conn.addr(),
            self.ctx.siblings.len()
        );

        let theirs = match self.conn.read_message()? {
            Some(Message::Bitfield(bytes)) => {
                Bitfield::from_bytes(&bytes, self.ctx.metainfo.num_pieces())?
            }
            Some(other) => {
                return Err(PeerError::Protocol(format!(
                    "expected BITFIELD, got {}",
                    other.name()
                )))
            }
            None => return Err(PeerError::Timeout),
        };

        debug!(
            "Peer {} has {}/{} pieces",
            self.conn.addr(),
            theirs.count(),
            theirs.len()
        );
        self.peer.bitfield = theirs;
        self.advance(Stage::BitfieldExchanged);
        Ok(())
    }

    fn steady(&mut self) -> Result<(), PeerError> {
        self.conn.set_timeout(self.ctx.config.idle_timeout)?;
        self.advance(Stage::Steady);

        loop {
            if self.ctx.store.is_complete() && self.peer.bitfield.is_complete() {
                info!(
                    "Peer {} and we both hold every piece, closing",
                    self.conn.addr()
                );
                return Ok(());
            }
            self.check_request_timeout()?;
            self.request_work()?;

            match self.conn.read_message() {
                Ok(Some(message)) => self.handle_message(message)?,
                Ok(None) => self.on_idle()?,
                Err(PeerError::Format(FormatError::UnknownId(id))) => warn!(
                    "Ignoring message with unknown id {} from peer {}",
                    id,
                    self.conn.addr()
                ),
                Err(e) => return Err(e),
            }
        }
    }

    /// Declare interest in the peer's pieces, and once unchoked claim a piece
    /// and ask for it. Nothing is claimed while the peer chokes us.
    fn request_work(&mut self) -> Result<(), PeerError> {
        if self.peer.request_outstanding {
            return Ok(());
        }

        if !self.peer.am_interested && self.ctx.store.wants_any(&self.peer.bitfield) {
            self.conn.send(&Message::Interested)?;
            self.peer.am_interested = true;
        }
        if !self.peer.unchoked_by_peer {
            return Ok(());
        }

        let index = match self.claim {
            Some(index) => index,
            None => match self.ctx.store.claim_next(&self.peer.bitfield) {
                Some(index) => {
                    debug!("Claimed piece {} for peer {}", index, self.conn.addr());
                    self.claim = Some(index);
                    index
                }
                None => return Ok(()),
            },
        };

        let length = self.ctx.store.piece_len(index);
        self.conn.send(&Message::Request {
            index,
            begin: 0,
            length,
        })?;
        debug!(
            "Requested piece {} ({} bytes) from peer {}",
            index,
            length,
            self.conn.addr()
        );
        self.peer.request_outstanding = true;
        self.requested_at = Some(Instant::now());

        Ok(())
    }

    fn check_request_timeout(&self) -> Result<(), PeerError> {
        match self.requested_at {
            Some(at) if at.elapsed() >= self.ctx.config.request_timeout => {
                warn!(
                    "Peer {} did not answer request for piece {:?} within {:?}",
                    self.conn.addr(),
                    self.claim,
                    self.ctx.config.request_timeout
                );
                Err(PeerError::Timeout)
            }
            _ => Ok(()),
        }
    }

    fn on_idle(&mut self) -> Result<(), PeerError> {
        if !self.peer.request_outstanding {
            if let Some(index) = self.claim.take() {
                // still choked: let another session try this piece
                self.ctx.store.release(index);
            }
        }
        self.conn.send(&Message::KeepAlive)
    }

    fn handle_message(&mut self, message: Message) -> Result<(), PeerError> {
        let addr = self.conn.addr();
        match message {
            Message::KeepAlive => trace!("Receive KEEP_ALIVE from peer {}", addr),
            Message::Choke => {
                self.peer.unchoked_by_peer = false;
                if self.peer.request_outstanding {
                    debug!("Peer {} choked us with piece {:?} in flight", addr, self.claim);
                    self.peer.request_outstanding = false;
                    self.requested_at = None;
                }
            }
            Message::Unchoke => {
                debug!("Peer {} unchoked us", addr);
                self.peer.unchoked_by_peer = true;
            }
            Message::Interested => {
                self.peer.unchoking_peer = true;
                self.conn.send(&Message::Unchoke)?;
            }
            Message::NotInterested => debug!("Peer {} is not interested", addr),
            Message::Have(index) => {
                if !self.peer.bitfield.set(index as usize) {
                    warn!("Peer {} announced out-of-range piece {}", addr, index);
                }
            }
            Message::Bitfield(_) => warn!("Ignoring late BITFIELD from peer {}", addr),
            Message::Request {
                index,
                begin,
                length,
            } => self.serve(index, begin, length)?,
            Message::Piece {
                index,
                begin,
                block,
            } => self.receive(index, begin, block)?,
            // requests are answered as soon as they arrive
            Message::Cancel { index, .. } => {
                debug!("Peer {} cancelled piece {}", addr, index)
            }
            Message::Port(port) => trace!("Peer {} listens on port {}", addr, port),
        }
        Ok(())
    }

    fn serve(&mut self, index: u32, begin: u32, length: u32) -> Result<(), PeerError> {
        let addr = self.conn.addr();
        if !self.peer.unchoking_peer {
            debug!("Ignoring request for piece {} from choked peer {}", index, addr);
            return Ok(());
        }

        match self.ctx.store.read_block(index, begin, length) {
            Ok(block) => {
                self.conn.send(&Message::Piece {
                    index,
                    begin,
                    block,
                })?;
                self.ctx.store.record_upload(length as u64);
                debug!(
                    "Uploaded piece {} [{}:{}] to peer {}",
                    index,
                    begin,
                    begin as u64 + length as u64,
                    addr
                );
                Ok(())
            }
            Err(StoreError::Io(e)) => Err(PeerError::Io(e)),
            Err(e) => {
                warn!("Rejecting request from peer {}: {}", addr, e);
                Ok(())
            }
        }
    }

    fn receive(&mut self, index: u32, begin: u32, block: Vec<u8>) -> Result<(), PeerError> {
        let addr = self.conn.addr();
        if self.claim != Some(index) || begin != 0 {
            warn!(
                "Discarding unrequested piece {} [{}:+{}] from peer {}",
                index,
                begin,
                block.len(),
                addr
            );
            return Ok(());
        }

        self.peer.request_outstanding = false;
        self.requested_at = None;
        self.claim = None;

        match self.ctx.store.commit(index, &block) {
            Ok(()) => {
                info!("Downloaded piece {} from peer {}", index, addr);
                let notified = self.ctx.siblings.broadcast(&Message::Have(index));
                trace!("Announced piece {} to {} peers", index, notified);
                self.ctx.piece_committed(block.len() as u64);
                Ok(())
            }
            Err(e) => {
                warn!("Piece {} from peer {} rejected: {}", index, addr, e);
                self.ctx.store.release(index);
                Err(e.into())
            }
        }
    }
}
