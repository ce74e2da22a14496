//! # Peer Socket
//!
//! Byte-level side of a peer connection: reading framed messages off the
//! socket and writing messages back.
//!
//! ## Read and Write Halves
//!
//! The owning worker thread is the only reader. Writes never happen on the
//! caller's thread: every frame goes into a bounded outbound queue drained by
//! a writer thread dedicated to the connection. Sibling sessions announcing a
//! HAVE only push onto that queue, so a slow peer stalls nobody but itself.
//!
//! A peer whose queue is full, or whose socket fails mid-write, has its socket
//! shut down so the owning worker sees the failure on its next read.
//!
//! ## Framing
//!
//! Reads are buffered so that a read timeout in the middle of a frame does not
//! lose bytes. A timeout surfaces as `Ok(None)` and the partially received
//! frame stays buffered until the next call.

use crate::error::PeerError;
use crate::handshake::*;
use crate::message::*;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, MutexGuard, RwLock};

use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const READ_CHUNK: usize = 16 * 1024;

/// Frames a connection may have waiting for its writer thread.
pub const OUTBOUND_QUEUE: usize = 64;

/// Shared write side of a connection.
pub struct PeerHandle {
    addr: SocketAddr,
    outbound: Sender<Vec<u8>>,
    // held while ordering matters across threads, never across a blocking send
    order: Mutex<()>,
    socket: TcpStream,
}

impl PeerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue a message from the owning session, waiting for room if needed.
    pub fn send(&self, message: &Message) -> Result<(), PeerError> {
        self.outbound
            .send(message.serialize())
            .map_err(|_| PeerError::Closed)
    }

    /// Queue a message on behalf of another session without ever waiting.
    ///
    /// A full queue means the peer stopped reading: the connection is shut
    /// down and an error returned.
    pub fn notify(&self, message: &Message) -> Result<(), PeerError> {
        let _order = self.order.lock();
        match self.outbound.try_send(message.serialize()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.shutdown();
                Err(PeerError::Protocol(format!(
                    "outbound queue full ({} frames)",
                    OUTBOUND_QUEUE
                )))
            }
            Err(TrySendError::Disconnected(_)) => Err(PeerError::Closed),
        }
    }

    /// Hold off sibling notifications until the guard drops.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.order.lock()
    }

    pub fn shutdown(&self) {
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            trace!("Error shutting down connection to {}: {}", self.addr, e);
        }
    }
}

/// Write queued frames until the queue closes or the socket fails.
fn drain_outbound(addr: SocketAddr, mut stream: TcpStream, outbound: Receiver<Vec<u8>>) {
    for frame in outbound.iter() {
        if let Err(e) = stream.write_all(&frame) {
            warn!("Could not write to peer {}: {}", addr, e);
            // a partial frame may be on the wire, the stream is unusable
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
    }
}

/// One TCP connection to a remote peer.
pub struct Connection {
    addr: SocketAddr,
    reader: TcpStream,
    handle: Arc<PeerHandle>,
    pending: Vec<u8>,
    max_frame: usize,
}

impl Connection {
    /// Open a connection to a peer.
    pub fn connect(addr: SocketAddr, timeout: Duration, max_frame: usize) -> Result<Self, PeerError> {
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|source| PeerError::Connect { addr, source })?;
        info!("Connected to peer {}", addr);
        Ok(Connection::new(stream, max_frame)?)
    }

    /// Wrap an established stream and start its writer thread.
    pub fn new(stream: TcpStream, max_frame: usize) -> io::Result<Self> {
        let addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;

        let (outbound, queue) = bounded(OUTBOUND_QUEUE);
        let writer = stream.try_clone()?;
        thread::Builder::new()
            .name(format!("writer-{}", addr))
            .spawn(move || drain_outbound(addr, writer, queue))?;

        let handle = Arc::new(PeerHandle {
            addr,
            outbound,
            order: Mutex::new(()),
            socket: stream.try_clone()?,
        });

        Ok(Connection {
            addr,
            reader: stream,
            handle,
            pending: Vec::new(),
            max_frame,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn handle(&self) -> Arc<PeerHandle> {
        Arc::clone(&self.handle)
    }

    /// Sets read and write timeouts on the socket.
    pub fn set_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.reader.set_read_timeout(Some(timeout))?;
        self.reader.set_write_timeout(Some(timeout))
    }

    pub fn send(&self, message: &Message) -> Result<(), PeerError> {
        trace!("Send {} to peer {}", message.name(), self.addr);
        self.handle.send(message)
    }

    pub fn send_handshake(&self, handshake: &Handshake) -> Result<(), PeerError> {
        self.handle
            .outbound
            .send(handshake.serialize().to_vec())
            .map_err(|_| PeerError::Handshake("could not send handshake".to_string()))
    }

    /// Read the peer's 68-byte handshake. Any failure is a handshake failure.
    pub fn read_handshake(&mut self) -> Result<Handshake, PeerError> {
        let mut buf = [0; HANDSHAKE_LEN];
        self.reader
            .read_exact(&mut buf)
            .map_err(|e| PeerError::Handshake(format!("could not read handshake: {}", e)))?;
        deserialize_handshake(&buf).map_err(|e| PeerError::Handshake(e.to_string()))
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` if the read timeout elapsed before a full frame
    /// arrived. Frames with an unknown id are consumed and reported as
    /// `FormatError::UnknownId`, so the caller may skip them.
    pub fn read_message(&mut self) -> Result<Option<Message>, PeerError> {
        let mut chunk = [0; READ_CHUNK];
        loop {
            if let Some(len) = frame_len(&self.pending, self.max_frame)? {
                let frame: Vec<u8> = self.pending.drain(..len).collect();
                let message = deserialize_message(&frame)?;
                trace!("Receive {} from peer {}", message.name(), self.addr);
                return Ok(Some(message));
            }

            match self.reader.read(&mut chunk) {
                Ok(0) => return Err(PeerError::Closed),
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None)
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn shutdown(&self) {
        self.handle.shutdown();
    }
}

/// Registry of live connections, used to broadcast HAVE messages.
#[derive(Default)]
pub struct Siblings {
    next_id: AtomicU64,
    peers: RwLock<HashMap<u64, Arc<PeerHandle>>>,
}

impl Siblings {
    pub fn register(&self, handle: Arc<PeerHandle>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.peers.write().insert(id, handle);
        id
    }

    pub fn unregister(&self, id: u64) {
        self.peers.write().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Queue a message for every registered connection without blocking.
    ///
    /// Connections that cannot take it are shut down and dropped from the
    /// registry. Returns the number of connections the message was queued for.
    pub fn broadcast(&self, message: &Message) -> usize {
        let peers: Vec<(u64, Arc<PeerHandle>)> = self
            .peers
            .read()
            .iter()
            .map(|(id, peer)| (*id, Arc::clone(peer)))
            .collect();

        let mut queued = 0;
        for (id, peer) in peers {
            match peer.notify(message) {
                Ok(()) => queued += 1,
                Err(e) => {
                    warn!("Dropping peer {} from {} broadcast: {}", peer.addr(), message.name(), e);
                    self.unregister(id);
                }
            }
        }
        queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::TcpListener;
    use std::time::Instant;

    fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let conn = Connection::connect(addr, Duration::from_secs(5), 1 << 20).unwrap();
        let (remote, _) = listener.accept().unwrap();
        (conn, remote)
    }

    #[test]
    fn reads_frames_split_across_writes() {
        let (mut conn, mut remote) = pair();
        let bytes = Message::Request {
            index: 1,
            begin: 0,
            length: 10,
        }
        .serialize();

        conn.set_timeout(Duration::from_millis(200)).unwrap();
        remote.write_all(&bytes[..6]).unwrap();
        assert!(conn.read_message().unwrap().is_none());

        remote.write_all(&bytes[6..]).unwrap();
        remote.write_all(&Message::KeepAlive.serialize()).unwrap();
        conn.set_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            conn.read_message().unwrap(),
            Some(Message::Request {
                index: 1,
                begin: 0,
                length: 10
            })
        );
        assert_eq!(conn.read_message().unwrap(), Some(Message::KeepAlive));
    }

    #[test]
    fn unknown_id_is_skippable() {
        let (mut conn, mut remote) = pair();
        remote.write_all(&[0, 0, 0, 2, 42, 0]).unwrap();
        remote.write_all(&Message::Unchoke.serialize()).unwrap();

        assert!(matches!(
            conn.read_message(),
            Err(PeerError::Format(crate::error::FormatError::UnknownId(42)))
        ));
        assert_eq!(conn.read_message().unwrap(), Some(Message::Unchoke));
    }

    #[test]
    fn eof_is_closed() {
        let (mut conn, remote) = pair();
        drop(remote);
        assert!(matches!(conn.read_message(), Err(PeerError::Closed)));
    }

    #[test]
    fn broadcast_reaches_every_sibling() {
        let siblings = Siblings::default();
        let (a, mut remote_a) = pair();
        let (b, mut remote_b) = pair();
        let id_a = siblings.register(a.handle());
        siblings.register(b.handle());
        assert_eq!(siblings.broadcast(&Message::Have(3)), 2);

        for remote in [&mut remote_a, &mut remote_b] {
            let mut buf = [0; 9];
            remote.read_exact(&mut buf).unwrap();
            assert_eq!(buf.to_vec(), Message::Have(3).serialize());
        }

        siblings.unregister(id_a);
        assert_eq!(siblings.len(), 1);
    }

    #[test]
    fn stalled_sibling_does_not_block_broadcast() {
        let siblings = Siblings::default();
        let (stalled, _remote_never_reads) = pair();
        let (live, mut remote_live) = pair();
        siblings.register(stalled.handle());
        siblings.register(live.handle());

        // wedge the writer on a frame larger than the socket buffers, then
        // fill the queue behind it
        let block = Message::Piece {
            index: 0,
            begin: 0,
            block: vec![0; 32 << 20],
        };
        stalled.send(&block).unwrap();
        for _ in 0..OUTBOUND_QUEUE {
            stalled.send(&Message::KeepAlive).unwrap();
        }

        let started = Instant::now();
        assert_eq!(siblings.broadcast(&Message::Have(1)), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(siblings.len(), 1);

        let mut buf = [0; 9];
        remote_live.read_exact(&mut buf).unwrap();
        assert_eq!(buf.to_vec(), Message::Have(1).serialize());

        // the stalled connection was shut down, its writer gives up
        assert!(matches!(
            stalled.send(&Message::KeepAlive),
            Err(PeerError::Closed)
        ));
    }
}
