//! Shared client state handed to every worker thread.
//!
//! Holds the piece store, the sibling registry used for HAVE broadcasts,
//! the torrent metainfo and runtime settings. One `Context` exists per
//! download and is shared through an `Arc`.

use crate::client::Siblings;
use crate::piece::PieceStore;
use crate::torrent::Metainfo;

use crossbeam_channel::Sender;
use indicatif::ProgressBar;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

// Default port for incoming peer connections
pub const DEFAULT_PORT: u16 = 6881;
// Maximum number of simultaneous peer connections
pub const DEFAULT_MAX_PEERS: u16 = 20;

/// Runtime settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub max_peers: usize,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Read timeout in steady state; a keep-alive is sent when it elapses
    pub idle_timeout: Duration,
    /// Longest wait for a PIECE after sending a REQUEST
    pub request_timeout: Duration,
    /// Keep serving after the download completes
    pub seed: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: DEFAULT_PORT,
            max_peers: usize::from(DEFAULT_MAX_PEERS),
            connect_timeout: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            seed: false,
        }
    }
}

pub struct Context {
    pub metainfo: Metainfo,
    pub peer_id: [u8; 20],
    pub store: PieceStore,
    pub siblings: Siblings,
    pub config: Config,
    pub progress: ProgressBar,
    completed: Sender<()>,
    completion_signalled: AtomicBool,
}

impl Context {
    pub fn new(
        metainfo: Metainfo,
        peer_id: [u8; 20],
        store: PieceStore,
        config: Config,
        progress: ProgressBar,
        completed: Sender<()>,
    ) -> Self {
        Context {
            metainfo,
            peer_id,
            store,
            siblings: Siblings::default(),
            config,
            progress,
            completed,
            completion_signalled: AtomicBool::new(false),
        }
    }

    /// Called after every successful commit. Signals the controller once,
    /// when the last piece lands.
    pub fn piece_committed(&self, bytes: u64) {
        self.progress.inc(bytes);
        if self.store.is_complete() && !self.completion_signalled.swap(true, Ordering::SeqCst) {
            self.progress.finish();
            info!("Download of '{}' complete", self.metainfo.name());
            let _ = self.completed.try_send(());
        }
    }
}
