//! # Tracker Client
//!
//! HTTP announces to the torrent's tracker.
//!
//! ## Request
//!
//! A GET on the announce URL with query parameters:
//!
//! - **info_hash**, **peer_id**: 20 raw bytes, percent-encoded
//! - **port**: port we accept peers on
//! - **uploaded**, **downloaded**, **left**: byte counters
//! - **event**: `started` on the first announce, `completed` once, else absent
//!
//! ## Response
//!
//! A bencoded dictionary with the re-announce `interval` and a `peers` entry,
//! either compact (6 bytes per IPv4 peer) or a list of dictionaries with
//! `peer id`, `ip` and `port`. A `failure reason` turns into an error.

use crate::peer::*;

use anyhow::{anyhow, Context, Result};
use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use serde_bencode::{de, value::Value};
use url::Url;

use std::net::IpAddr;
use std::time::Duration;

/// Re-announce interval when the tracker does not supply one.
pub const DEFAULT_INTERVAL: u64 = 120;

const QUERY_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Completed,
    None,
}

impl AnnounceEvent {
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::None => None,
        }
    }
}

/// Transfer counters reported on every announce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnounceStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Seconds to wait before the next announce
    pub interval: u64,
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Deserialize)]
struct BencodeTracker {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: Option<u64>,
    #[serde(default)]
    peers: Option<Value>,
}

pub struct Tracker {
    announce: Url,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
    http: reqwest::blocking::Client,
}

impl Tracker {
    pub fn new(announce: Url, info_hash: [u8; 20], peer_id: [u8; 20], port: u16) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("could not build HTTP client")?;

        Ok(Tracker {
            announce,
            info_hash,
            peer_id,
            port,
            http,
        })
    }

    /// Build the announce URL. The query is written by hand because the
    /// binary fields must not go through form encoding.
    pub fn announce_url(&self, event: AnnounceEvent, stats: AnnounceStats) -> String {
        let mut url = self.announce.to_string();
        if url.contains('?') {
            url.push('&');
        } else {
            url.push('?');
        }

        url.push_str(&format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            percent_encode(&self.info_hash, QUERY_SET),
            percent_encode(&self.peer_id, QUERY_SET),
            self.port,
            stats.uploaded,
            stats.downloaded,
            stats.left,
        ));
        if let Some(event) = event.as_str() {
            url.push_str("&event=");
            url.push_str(event);
        }

        url
    }

    /// Announce to the tracker and return the peers it knows about.
    pub fn announce(&self, event: AnnounceEvent, stats: AnnounceStats) -> Result<AnnounceResponse> {
        let url = self.announce_url(event, stats);
        debug!("Announcing {:?} to {}", event, self.announce);

        let body = self
            .http
            .get(&url)
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.bytes())
            .with_context(|| format!("announce to {} failed", self.announce))?;

        parse_response(&body)
    }
}

/// Decode a bencoded announce response.
pub fn parse_response(body: &[u8]) -> Result<AnnounceResponse> {
    let tracker: BencodeTracker =
        de::from_bytes(body).map_err(|e| anyhow!("could not decode tracker response: {}", e))?;

    if let Some(reason) = tracker.failure_reason {
        return Err(anyhow!("tracker refused announce: {}", reason));
    }

    let peers = match tracker.peers {
        Some(Value::Bytes(compact)) => parse_compact_peers(&compact)?,
        Some(Value::List(entries)) => entries.iter().filter_map(parse_peer_dict).collect(),
        Some(_) => return Err(anyhow!("tracker sent peers in an unknown form")),
        None => vec![],
    };

    Ok(AnnounceResponse {
        interval: tracker.interval.unwrap_or(DEFAULT_INTERVAL),
        peers,
    })
}

fn parse_peer_dict(entry: &Value) -> Option<PeerInfo> {
    let Value::Dict(dict) = entry else {
        return None;
    };

    let ip = match dict.get(b"ip".as_slice()) {
        Some(Value::Bytes(ip)) => std::str::from_utf8(ip).ok()?.parse::<IpAddr>().ok()?,
        _ => return None,
    };
    let port = match dict.get(b"port".as_slice()) {
        Some(Value::Int(port)) => u16::try_from(*port).ok()?,
        _ => return None,
    };
    let id = match dict.get(b"peer id".as_slice()) {
        Some(Value::Bytes(id)) => <[u8; 20]>::try_from(id.as_slice()).ok(),
        _ => None,
    };

    let mut peer = PeerInfo::new(ip, port);
    peer.id = id;
    Some(peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn tracker(announce: &str) -> Tracker {
        Tracker::new(Url::parse(announce).unwrap(), [0xab; 20], *b"-PM0100-abc def~ghij", 6881).unwrap()
    }

    #[test]
    fn event_names() {
        assert_eq!(AnnounceEvent::Started.as_str(), Some("started"));
        assert_eq!(AnnounceEvent::Completed.as_str(), Some("completed"));
        assert_eq!(AnnounceEvent::None.as_str(), None);
    }

    #[test]
    fn announce_url_carries_counters_and_encoded_ids() {
        let tracker = tracker("http://tracker.example:6969/announce");
        let stats = AnnounceStats {
            uploaded: 10,
            downloaded: 20,
            left: 30,
        };
        let url = tracker.announce_url(AnnounceEvent::Started, stats);

        assert!(url.starts_with("http://tracker.example:6969/announce?info_hash=%AB%AB"));
        assert!(url.contains("&peer_id=-PM0100-abc%20def~ghij&"));
        assert!(url.contains("&port=6881&uploaded=10&downloaded=20&left=30"));
        assert!(url.ends_with("&event=started"));

        let url = tracker.announce_url(AnnounceEvent::None, stats);
        assert!(!url.contains("event="));
    }

    #[test]
    fn announce_url_extends_existing_query() {
        let tracker = tracker("http://tracker.example/announce?passkey=abc");
        let url = tracker.announce_url(AnnounceEvent::None, AnnounceStats::default());
        assert!(url.starts_with("http://tracker.example/announce?passkey=abc&info_hash="));
    }

    #[test]
    fn parses_compact_response() {
        let body = b"d8:intervali900e5:peers12:\x7f\x00\x00\x01\x1a\xe1\x0a\x00\x00\x02\x00\x50e";
        let response = parse_response(body).unwrap();
        assert_eq!(response.interval, 900);
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[0].addr, "127.0.0.1:6881".parse().unwrap());
        assert_eq!(response.peers[1].addr, "10.0.0.2:80".parse().unwrap());
    }

    #[test]
    fn parses_dictionary_peers() {
        let body = b"d8:intervali60e5:peersld2:ip9:127.0.0.17:peer id20:-XX0001-abcdefghijkl4:porti7000eed2:ip9:not-an-ip4:porti1eeee";
        let response = parse_response(body).unwrap();
        assert_eq!(response.interval, 60);
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].addr, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(response.peers[0].id, Some(*b"-XX0001-abcdefghijkl"));
    }

    #[test]
    fn missing_interval_uses_default() {
        let response = parse_response(b"d5:peers0:e").unwrap();
        assert_eq!(response.interval, DEFAULT_INTERVAL);
        assert!(response.peers.is_empty());
    }

    #[test]
    fn failure_reason_is_an_error() {
        let err = parse_response(b"d14:failure reason12:unregisterede").unwrap_err();
        assert!(err.to_string().contains("unregistered"));
    }

    #[test]
    fn announces_over_http() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = vec![];
            let mut buf = [0; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).unwrap();
                request.extend_from_slice(&buf[..n]);
            }
            let body = b"d8:intervali30e5:peers6:\x7f\x00\x00\x01\x1a\xe2e";
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            )
            .unwrap();
            stream.write_all(body).unwrap();
            String::from_utf8_lossy(&request).to_string()
        });

        let tracker = tracker(&format!("http://{}/announce", addr));
        let response = tracker
            .announce(
                AnnounceEvent::Started,
                AnnounceStats {
                    uploaded: 0,
                    downloaded: 0,
                    left: 1000,
                },
            )
            .unwrap();

        assert_eq!(response.interval, 30);
        assert_eq!(response.peers[0].addr, "127.0.0.1:6882".parse().unwrap());

        let request = server.join().unwrap();
        assert!(request.starts_with("GET /announce?info_hash="));
        assert!(request.contains("left=1000"));
        assert!(request.contains("event=started"));
    }
}
