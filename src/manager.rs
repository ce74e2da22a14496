//! # Connection Manager
//!
//! Bounded pool of peer sessions. Each session occupies one slot for as long
//! as its thread runs; outbound and inbound sessions draw from the same pool.
//!
//! Slots are tokens in a bounded channel: taking a token claims a slot and the
//! token goes back when the session's [`Slot`] guard drops, whatever the
//! outcome of the session.

use crate::context::Context;
use crate::worker::Worker;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use std::collections::HashSet;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

struct Pool {
    tokens: (Sender<()>, Receiver<()>),
    active: Mutex<HashSet<SocketAddr>>,
}

/// A claimed worker slot, released on drop.
struct Slot {
    pool: Arc<Pool>,
    addr: SocketAddr,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let _ = self.pool.tokens.0.send(());
        self.pool.active.lock().remove(&self.addr);
    }
}

#[derive(Clone)]
pub struct Manager {
    ctx: Arc<Context>,
    pool: Arc<Pool>,
}

impl Manager {
    pub fn new(ctx: Arc<Context>) -> Self {
        let capacity = ctx.config.max_peers.max(1);
        let tokens = bounded(capacity);
        for _ in 0..capacity {
            let _ = tokens.0.send(());
        }

        Manager {
            ctx,
            pool: Arc::new(Pool {
                tokens,
                active: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Start an outbound session unless the address already has one or the
    /// pool is full. Returns whether a session was started.
    pub fn add_peer(&self, addr: SocketAddr) -> bool {
        let Some(slot) = self.acquire(addr) else {
            return false;
        };

        let ctx = Arc::clone(&self.ctx);
        self.spawn(slot, move || Worker::connect(ctx, addr))
    }

    /// Accept inbound connections on a background thread.
    pub fn listen(&self, listener: TcpListener) -> io::Result<JoinHandle<()>> {
        info!("Listening for peers on {}", listener.local_addr()?);
        let manager = self.clone();
        thread::Builder::new()
            .name("listener".to_string())
            .spawn(move || {
                for stream in listener.incoming() {
                    match stream {
                        Ok(stream) => manager.add_inbound(stream),
                        Err(e) => warn!("Could not accept connection: {}", e),
                    }
                }
            })
    }

    fn add_inbound(&self, stream: TcpStream) {
        let addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                debug!("Dropping inbound connection without address: {}", e);
                return;
            }
        };
        let Some(slot) = self.acquire(addr) else {
            return;
        };

        let ctx = Arc::clone(&self.ctx);
        self.spawn(slot, move || Worker::accept(ctx, stream));
    }

    /// Number of sessions currently holding a slot.
    pub fn active_count(&self) -> usize {
        self.pool.active.lock().len()
    }

    fn acquire(&self, addr: SocketAddr) -> Option<Slot> {
        let mut active = self.pool.active.lock();
        if active.contains(&addr) {
            trace!("Peer {} already has a session", addr);
            return None;
        }
        if self.pool.tokens.1.try_recv().is_err() {
            debug!("No free slot for peer {}", addr);
            return None;
        }
        active.insert(addr);

        Some(Slot {
            pool: Arc::clone(&self.pool),
            addr,
        })
    }

    fn spawn<F, E>(&self, slot: Slot, session: F) -> bool
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: Send + 'static,
    {
        let addr = slot.addr;
        let spawned = thread::Builder::new()
            .name(format!("peer-{}", addr))
            .spawn(move || {
                let _slot = slot;
                // the session logs its own outcome
                let _ = session();
            });

        match spawned {
            Ok(_) => true,
            Err(e) => {
                error!("Could not start session for peer {}: {}", addr, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Config;
    use crate::piece::PieceStore;
    use crate::torrent::tests::metainfo_for;

    use indicatif::ProgressBar;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn manager(dir: &TempDir, max_peers: usize) -> Manager {
        let metainfo = metainfo_for(&[0u8; 100], 10);
        let store = PieceStore::open(&dir.path().join("out"), &metainfo).unwrap();
        let config = Config {
            max_peers,
            connect_timeout: Duration::from_millis(200),
            handshake_timeout: Duration::from_millis(200),
            ..Config::default()
        };
        let (done_tx, _) = bounded(1);
        let ctx = Context::new(
            metainfo,
            [3; 20],
            store,
            config,
            ProgressBar::hidden(),
            done_tx,
        );
        Manager::new(Arc::new(ctx))
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn duplicate_address_is_refused() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, 4);

        let slot = manager.acquire(addr(1000));
        assert!(slot.is_some());
        assert!(manager.acquire(addr(1000)).is_none());
        assert_eq!(manager.active_count(), 1);

        drop(slot);
        assert_eq!(manager.active_count(), 0);
        assert!(manager.acquire(addr(1000)).is_some());
    }

    #[test]
    fn pool_capacity_is_enforced() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, 2);

        let a = manager.acquire(addr(1001));
        let b = manager.acquire(addr(1002));
        assert!(a.is_some() && b.is_some());
        assert!(manager.acquire(addr(1003)).is_none());

        drop(a);
        assert!(manager.acquire(addr(1003)).is_some());
    }

    #[test]
    fn slot_returns_when_session_fails() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, 1);

        // nothing listens here, so the session ends with a connect error
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = listener.local_addr().unwrap();
        drop(listener);

        assert!(manager.add_peer(target));
        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.active_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(manager.active_count(), 0);
        assert!(manager.acquire(addr(1004)).is_some());
    }
}
