//! # Command-Line Arguments
//!
//! ```bash
//! piecemeal debian.iso.torrent
//! piecemeal debian.iso.torrent -o debian.iso -p 6882 --max-peers 40
//! piecemeal debian.iso.torrent --seed
//! ```

use crate::context::{Config, DEFAULT_MAX_PEERS, DEFAULT_PORT};

use clap::Parser;

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line peer-to-peer file transfer client, written in Rust."
)]
pub struct Args {
    /// Path to the .torrent file
    pub torrent: PathBuf,

    /// Port to accept peer connections on
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Output filename (defaults to name from torrent)
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Maximum number of simultaneous peer connections
    #[arg(long, default_value_t = DEFAULT_MAX_PEERS, value_parser = clap::value_parser!(u16).range(1..))]
    pub max_peers: u16,

    /// Keep serving pieces after the download completes
    #[arg(long)]
    pub seed: bool,
}

impl Args {
    /// Runtime settings derived from the arguments.
    pub fn config(&self) -> Config {
        Config {
            port: self.port,
            max_peers: usize::from(self.max_peers),
            seed: self.seed,
            ..Config::default()
        }
    }
}
