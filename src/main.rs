//! # Piecemeal
//!
//! A command-line peer-to-peer file transfer client speaking the BitTorrent
//! wire protocol.
//!
//! ## Usage
//!
//! ```bash
//! piecemeal <torrent_file>
//! piecemeal <torrent_file> -o <output_file> -p <port> --seed
//! ```
//!
//! ## Architecture
//!
//! - **Main thread**: loads the torrent, announces to the tracker on a timer
//!   and hands discovered peers to the connection manager
//! - **Listener thread**: accepts inbound peers
//! - **Worker threads**: one per peer connection, both downloading and serving
//! - **Piece store**: shared chunk table and output file every worker claims
//!   pieces from and commits verified pieces to

#[macro_use]
extern crate log;

mod args;
mod bitfield;
mod client;
mod context;
mod error;
mod handshake;
mod manager;
mod message;
mod peer;
mod piece;
mod torrent;
mod tracker;
mod worker;

use args::Args;
use context::Context;
use manager::Manager;
use piece::PieceStore;
use torrent::Metainfo;
use tracker::*;

use anyhow::{Context as _, Result};
use clap::Parser;
use crossbeam_channel::{after, bounded, select, Receiver};
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;

use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const PEER_ID_PREFIX: &[u8; 8] = b"-PM0100-";

/// Sanitize a filename to prevent path traversal and basic issues.
fn sanitize_filename(filename: &str) -> String {
    // Replace path separators with underscores to prevent directory traversal
    let safe_name = filename.replace(['/', '\\'], "_");

    if safe_name.trim().is_empty() || safe_name == "." || safe_name == ".." {
        "download".to_string()
    } else {
        safe_name
    }
}

/// Client prefix followed by 12 random bytes.
fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    rand::thread_rng().fill(&mut peer_id[8..]);
    peer_id
}

/// Whether a tracker address points back at our own listener.
fn is_own_address(addr: &SocketAddr, port: u16) -> bool {
    addr.port() == port && (addr.ip().is_loopback() || addr.ip().is_unspecified())
}

fn stats(ctx: &Context) -> AnnounceStats {
    AnnounceStats {
        uploaded: ctx.store.uploaded(),
        downloaded: ctx.store.downloaded(),
        left: ctx.store.left(),
    }
}

/// Drives the tracker: announces on a timer and reacts to completion.
struct Controller<'a> {
    tracker: &'a Tracker,
    ctx: &'a Context,
    manager: &'a Manager,
    completed: bool,
    interval: Duration,
}

impl<'a> Controller<'a> {
    fn new(tracker: &'a Tracker, ctx: &'a Context, manager: &'a Manager) -> Self {
        Controller {
            tracker,
            ctx,
            manager,
            completed: ctx.store.is_complete(),
            interval: Duration::from_secs(DEFAULT_INTERVAL),
        }
    }

    /// Announce, start sessions for new peers and adopt the next interval.
    fn announce(&mut self, event: AnnounceEvent) {
        self.interval = match self.tracker.announce(event, stats(self.ctx)) {
            Ok(response) => {
                let known = response.peers.len();
                let started = response
                    .peers
                    .iter()
                    .filter(|peer| peer.id != Some(self.ctx.peer_id))
                    .filter(|peer| !is_own_address(&peer.addr, self.ctx.config.port))
                    .filter(|peer| self.manager.add_peer(peer.addr))
                    .count();
                info!(
                    "Tracker returned {} peers, started {} sessions ({} active)",
                    known,
                    started,
                    self.manager.active_count()
                );
                Duration::from_secs(response.interval.max(1))
            }
            Err(e) => {
                warn!("{:#}", e);
                Duration::from_secs(DEFAULT_INTERVAL)
            }
        };
    }

    /// Handle the completion signal. Returns whether to keep running.
    fn complete(&mut self) -> bool {
        if self.completed {
            return true;
        }
        self.completed = true;
        self.announce(AnnounceEvent::Completed);
        if let Err(e) = self.ctx.store.flush() {
            error!("Could not flush output file: {}", e);
        }
        if !self.ctx.config.seed {
            return false;
        }
        info!("Seeding '{}'", self.ctx.metainfo.name());
        true
    }

    /// Announce loop. Returns once the download completes, or never when seeding.
    fn run(&mut self, done: &Receiver<()>) {
        self.announce(AnnounceEvent::Started);

        loop {
            let timer = after(self.interval);
            select! {
                recv(done) -> _ => {
                    if !self.complete() {
                        return;
                    }
                }
                recv(timer) -> _ => self.announce(AnnounceEvent::None),
            }
        }
    }
}

fn run(args: Args) -> Result<()> {
    let config = args.config();

    let metainfo = Metainfo::open(&args.torrent)
        .with_context(|| format!("could not load torrent file '{}'", args.torrent.display()))?;
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(sanitize_filename(metainfo.name())));

    let store = PieceStore::open(&output, &metainfo)
        .with_context(|| format!("could not open output file '{}'", output.display()))?;
    let left = store.left();
    if left == 0 && !config.seed {
        println!("\"{}\" is already complete.", output.display());
        return Ok(());
    }

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .with_context(|| format!("could not listen on port {}", config.port))?;

    let progress = ProgressBar::new(metainfo.length());
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")?
            .progress_chars("#>-"),
    );
    progress.set_position(metainfo.length() - left);

    let peer_id = generate_peer_id();
    let tracker = Tracker::new(metainfo.announce().clone(), metainfo.info_hash(), peer_id, config.port)?;

    let (done_tx, done_rx) = bounded(1);
    let ctx = Arc::new(Context::new(metainfo, peer_id, store, config, progress, done_tx));
    let manager = Manager::new(Arc::clone(&ctx));
    manager.listen(listener).context("could not start listener")?;

    Controller::new(&tracker, &ctx, &manager).run(&done_rx);

    ctx.store.flush().context("could not flush output file")?;
    println!("Saved in \"{}\".", output.display());

    Ok(())
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    let args = Args::parse();

    if let Err(error) = run(args) {
        eprintln!("Error: {:#}", error);
        std::process::exit(1);
    }

    std::process::exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Config;
    use crate::torrent::tests::metainfo_for;

    use std::io::{Read, Write};
    use std::thread;
    use tempfile::TempDir;
    use url::Url;

    /// Answer one announce per body, returning the request lines.
    fn fake_tracker(bodies: Vec<&'static [u8]>) -> (SocketAddr, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            bodies
                .into_iter()
                .map(|body| {
                    let (mut stream, _) = listener.accept().unwrap();
                    let mut request = vec![];
                    let mut buf = [0; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        let n = stream.read(&mut buf).unwrap();
                        request.extend_from_slice(&buf[..n]);
                    }
                    write!(
                        stream,
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    )
                    .unwrap();
                    stream.write_all(body).unwrap();
                    String::from_utf8_lossy(&request)
                        .lines()
                        .next()
                        .unwrap_or_default()
                        .to_string()
                })
                .collect()
        });
        (addr, server)
    }

    #[test]
    fn seeding_adopts_interval_from_completed_announce() {
        let (addr, server) = fake_tracker(vec![
            b"d8:intervali1000e5:peers0:e".as_slice(),
            b"d8:intervali7e5:peers0:e".as_slice(),
        ]);

        let dir = TempDir::new().unwrap();
        let metainfo = metainfo_for(&[5u8; 200], 100);
        let store = PieceStore::open(&dir.path().join("out"), &metainfo).unwrap();
        let config = Config {
            seed: true,
            ..Config::default()
        };
        let (done_tx, _) = bounded(1);
        let peer_id = generate_peer_id();
        let ctx = Arc::new(Context::new(
            metainfo,
            peer_id,
            store,
            config,
            ProgressBar::hidden(),
            done_tx,
        ));
        let manager = Manager::new(Arc::clone(&ctx));
        let announce = Url::parse(&format!("http://{}/announce", addr)).unwrap();
        let tracker = Tracker::new(announce, ctx.metainfo.info_hash(), peer_id, 6881).unwrap();

        let mut controller = Controller::new(&tracker, &ctx, &manager);
        controller.announce(AnnounceEvent::Started);
        assert_eq!(controller.interval, Duration::from_secs(1000));

        assert!(controller.complete());
        assert_eq!(controller.interval, Duration::from_secs(7));
        // a second signal is a no-op
        assert!(controller.complete());

        let requests = server.join().unwrap();
        assert!(requests[0].contains("event=started"));
        assert!(requests[1].contains("event=completed"));
    }

    #[test]
    fn sanitize_strips_separators() {
        assert_eq!(sanitize_filename("a/b\\c.iso"), "a_b_c.iso");
        assert_eq!(sanitize_filename("   "), "download");
        assert_eq!(sanitize_filename(".."), "download");
        assert_eq!(sanitize_filename("debian.iso"), "debian.iso");
    }

    #[test]
    fn peer_id_has_client_prefix() {
        let a = generate_peer_id();
        let b = generate_peer_id();
        assert_eq!(&a[..8], PEER_ID_PREFIX);
        assert_ne!(a, b);
    }

    #[test]
    fn own_address_is_skipped() {
        assert!(is_own_address(&"127.0.0.1:6881".parse().unwrap(), 6881));
        assert!(!is_own_address(&"127.0.0.1:6882".parse().unwrap(), 6881));
        assert!(!is_own_address(&"10.0.0.5:6881".parse().unwrap(), 6881));
    }
}
