//! The periodic HTTP announce loop: reports progress to the tracker and
//! receives back a peer list and a suggested interval.
//!
//! Only the compact bytestring peer encoding is supported; a dictionary-list
//! response fails with [`Error::UnsupportedTrackerEncoding`], which is fatal
//! to the tracker client but not to the engine, which simply continues with
//! whatever peers it already knows about.

use std::{cell::RefCell, net::{Ipv4Addr, SocketAddr}, time::Duration};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;

use crate::{error::*, PeerId, Sha1Hash};

/// Whether this announce carries an `event` parameter: the first announce
/// of a run carries `started`, the final one on orderly shutdown carries
/// `stopped`, and every announce in between carries none.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    Started,
    Stopped,
    None,
}

/// A successfully parsed tracker response.
#[derive(Clone, Debug)]
pub(crate) struct Announce {
    pub interval: Duration,
    pub peers: Vec<SocketAddr>,
}

/// Speaks the tracker HTTP announce protocol for one torrent.
pub(crate) struct Tracker {
    client: reqwest::Client,
    announce: String,
    /// Alternative announce URLs, already in the order they should be tried
    /// after `announce` fails (see [`crate::metainfo::Metainfo::announce_list`]).
    announce_list: Vec<String>,
    info_hash: Sha1Hash,
    peer_id: PeerId,
    port: u16,
    /// After this many consecutive failures against a given URL (indices
    /// parallel to `announce` at 0 and `announce_list` at 1..), that URL is
    /// skipped on subsequent announce cycles in favor of the next one.
    error_threshold: usize,
    /// Consecutive failure count per URL, indexed the same way.
    failure_counts: RefCell<Vec<usize>>,
}

impl Tracker {
    pub fn new(
        announce: String,
        announce_list: Vec<String>,
        info_hash: Sha1Hash,
        peer_id: PeerId,
        port: u16,
        error_threshold: usize,
    ) -> Self {
        let failure_counts = RefCell::new(vec![0; 1 + announce_list.len()]);
        Self {
            client: reqwest::Client::new(),
            announce,
            announce_list,
            info_hash,
            peer_id,
            port,
            error_threshold,
            failure_counts,
        }
    }

    /// Announces to the primary tracker URL, falling back to each URL in
    /// `announce_list` in order until one succeeds. Returns `None` (rather
    /// than propagating an error) once every URL has failed: tracker
    /// failures are non-fatal at the engine level.
    pub async fn announce(
        &self,
        uploaded: u64,
        downloaded: u64,
        left: u64,
        event: Event,
    ) -> Option<Announce> {
        let urls = std::iter::once(self.announce.as_str())
            .chain(self.announce_list.iter().map(String::as_str));

        for (i, url) in urls.enumerate() {
            if self.failure_counts.borrow()[i] >= self.error_threshold {
                log::debug!(
                    "Skipping tracker {}: {} consecutive failures reached the threshold",
                    url, self.error_threshold
                );
                continue;
            }

            match self
                .announce_one(url, uploaded, downloaded, left, event)
                .await
            {
                Ok(announce) => {
                    self.failure_counts.borrow_mut()[i] = 0;
                    return Some(announce);
                }
                Err(e) => {
                    log::warn!("Announce to {} failed: {}", url, e);
                    self.failure_counts.borrow_mut()[i] += 1;
                }
            }
        }

        log::warn!("All tracker URLs exhausted for this announce cycle");
        None
    }

    /// Sends a single best-effort `event=stopped` announce to the primary
    /// URL only, during orderly engine shutdown. Unlike [`Tracker::announce`],
    /// a failure here is not retried or fallen back to `announce_list`: the
    /// engine is already tearing down and nothing downstream is waiting on
    /// this round trip.
    pub async fn announce_stop(&self, uploaded: u64, downloaded: u64, left: u64) {
        if let Err(e) = self
            .announce_one(&self.announce, uploaded, downloaded, left, Event::Stopped)
            .await
        {
            log::debug!("Best-effort stopped announce to {} failed: {}", self.announce, e);
        }
    }

    async fn announce_one(
        &self,
        url: &str,
        uploaded: u64,
        downloaded: u64,
        left: u64,
        event: Event,
    ) -> Result<Announce> {
        let query = build_query(
            &self.info_hash,
            &self.peer_id,
            self.port,
            uploaded,
            downloaded,
            left,
            event,
        );
        let full_url = format!("{}?{}", url, query);

        let response = self.client.get(&full_url).send().await?;
        if !response.status().is_success() {
            return Err(Error::TrackerError(format!(
                "tracker responded with status {}",
                response.status()
            )));
        }
        let body = response.bytes().await?;

        let raw: RawResponse = serde_bencode::from_bytes(&body)?;
        if let Some(reason) = raw.failure_reason {
            return Err(Error::TrackerError(reason));
        }

        let peers = match raw.peers {
            RawPeers::Compact(bytes) => parse_compact_peers(&bytes)?,
            RawPeers::Dictionary(_) => {
                return Err(Error::UnsupportedTrackerEncoding);
            }
        };

        Ok(Announce {
            interval: Duration::from_secs(raw.interval),
            peers,
        })
    }
}

fn build_query(
    info_hash: &Sha1Hash,
    peer_id: &PeerId,
    port: u16,
    uploaded: u64,
    downloaded: u64,
    left: u64,
    event: Event,
) -> String {
    let mut query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        percent_encode(info_hash, NON_ALPHANUMERIC),
        percent_encode(peer_id, NON_ALPHANUMERIC),
        port,
        uploaded,
        downloaded,
        left,
    );
    match event {
        Event::Started => query.push_str("&event=started"),
        Event::Stopped => query.push_str("&event=stopped"),
        Event::None => {}
    }
    query
}

/// Parses a compact peer list: 6-byte records of 4-byte big-endian IPv4
/// address followed by 2-byte big-endian port.
fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<SocketAddr>> {
    if bytes.len() % 6 != 0 {
        return Err(Error::TrackerError(
            "compact peer list length is not a multiple of 6".into(),
        ));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::from((ip, port))
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    interval: u64,
    peers: RawPeers,
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
}

#[derive(Debug)]
enum RawPeers {
    Compact(Vec<u8>),
    Dictionary(Vec<RawPeerDict>),
}

impl<'de> Deserialize<'de> for RawPeers {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct Visitor;
        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = RawPeers;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a bencoded bytestring or list of peer dictionaries")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(RawPeers::Compact(v.to_vec()))
            }

            fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(RawPeers::Compact(v))
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut peers = Vec::new();
                while let Some(peer) = seq.next_element::<RawPeerDict>()? {
                    peers.push(peer);
                }
                Ok(RawPeers::Dictionary(peers))
            }
        }
        deserializer.deserialize_any(Visitor)
    }
}

#[derive(Debug, Deserialize)]
struct RawPeerDict {
    #[serde(default)]
    #[allow(dead_code)]
    ip: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_compact_peers() {
        let bytes = b"\xb0;\xc9\x12\x1b9";
        let peers = parse_compact_peers(bytes).unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(
            peers[0],
            SocketAddr::from((Ipv4Addr::new(176, 59, 201, 18), 6969))
        );
    }

    #[test]
    fn test_tracker_response_round_trip() {
        let raw: RawResponse =
            serde_bencode::from_bytes(b"d8:intervali1800e5:peers6:\xb0;\xc9\x12\x1b9e")
                .unwrap();
        assert_eq!(raw.interval, 1800);
        match raw.peers {
            RawPeers::Compact(bytes) => assert_eq!(bytes.len(), 6),
            RawPeers::Dictionary(_) => panic!("expected compact encoding"),
        }
    }

    #[tokio::test]
    async fn test_announce_falls_back_to_announce_list() {
        let mut failing_server = mockito::Server::new_async().await;
        let failing_mock = failing_server
            .mock("GET", mockito::Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let mut ok_server = mockito::Server::new_async().await;
        let body = b"d8:intervali1800e5:peers6:\xb0;\xc9\x12\x1b9e".to_vec();
        let ok_mock = ok_server
            .mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let tracker = Tracker::new(
            format!("{}/announce", failing_server.url()),
            vec![format!("{}/announce", ok_server.url())],
            [0u8; 20],
            [1u8; 20],
            6889,
            15,
        );

        let announce = tracker.announce(0, 0, 0, Event::Started).await;
        let announce = announce.expect("fallback announce should succeed");
        assert_eq!(announce.interval, Duration::from_secs(1800));
        assert_eq!(announce.peers.len(), 1);

        failing_mock.assert_async().await;
        ok_mock.assert_async().await;
    }
}
