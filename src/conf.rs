//! This module defines types used to configure the engine and its parts.

use std::{collections::BTreeSet, path::PathBuf, time::Duration};

use rand::Rng;

use crate::{FileIndex, PeerId};

/// The default client ID prefix used to build this crate's peer IDs.
///
/// Peer IDs are the prefix followed by twelve random bytes, for a total of
/// twenty bytes, following the Azureus-style convention described in
/// [BEP 20](http://bittorrent.org/beps/bep_0020.html).
pub const CLIENT_ID_PREFIX: &[u8; 8] = b"-RS0001-";

/// The default listener port for inbound peer connections and the port
/// reported to the tracker.
pub const DEFAULT_PORT: u16 = 6889;

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    /// Generates a fresh random peer ID using [`CLIENT_ID_PREFIX`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf::new(),
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself, shared by all torrents it
/// runs.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client, announced to trackers and other peers.
    pub client_id: PeerId,
    /// The port on which the engine listens for inbound peer connections.
    pub listener_port: u16,
    /// The capacity of the bounded peer-address queue the tracker client
    /// feeds and peer sessions drain. Addresses beyond this capacity are
    /// dropped rather than blocking the announce loop.
    pub peer_queue_capacity: usize,
}

impl EngineConf {
    pub fn new() -> Self {
        Self {
            client_id: generate_peer_id(),
            listener_port: DEFAULT_PORT,
            peer_queue_capacity: 256,
        }
    }
}

impl Default for EngineConf {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// If set, only these file indices (for multi-file torrents) are
    /// downloaded; pieces that exclusively belong to excluded files are
    /// filtered out of the piece manager's catalog. `None` means all files.
    pub chosen_files: Option<BTreeSet<FileIndex>>,

    /// The minimum number of peers we want to keep in torrent at all times.
    /// This will be configurable later.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have, inbound and
    /// outbound combined.
    pub max_connected_peer_count: usize,

    /// The size of the fixed peer session pool the engine spawns at startup.
    pub session_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to announcing every hour.
    pub announce_interval: Duration,

    /// After this many consecutive announce failures, the torrent stops
    /// announcing to that tracker URL and falls back to the next entry in the
    /// announce-list, if any.
    pub tracker_error_threshold: usize,

    /// How long a request may remain pending before the piece manager
    /// considers it expired and eligible for re-request.
    pub request_timeout: Duration,

    /// The back-pressure threshold: once this many pieces are Ongoing, the
    /// scheduler prefers completing them over starting new ones.
    pub max_ongoing_pieces: usize,

    /// Timeout for the initial TCP connect to a peer.
    pub dial_timeout: Duration,

    /// Timeout for reading the peer's handshake response.
    pub handshake_timeout: Duration,

    /// Timeout for reading the next framed message from a peer; a timeout
    /// yields the stream's `Idle` sentinel rather than failing the session.
    pub read_timeout: Duration,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            chosen_files: None,
            // We always request at least 10 peers as anything less is a waste
            // of network round trip and it allows us to buffer up a bit more
            // than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 50,
            session_count: 35,
            announce_interval: Duration::from_secs(60 * 60),
            tracker_error_threshold: 15,
            request_timeout: Duration::from_millis(30_000),
            max_ongoing_pieces: 20,
            dial_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(15),
        }
    }
}

/// Generates a fresh peer ID: [`CLIENT_ID_PREFIX`] followed by twelve random
/// ASCII digits, keeping the ID legible in logs and announce query strings.
pub fn generate_peer_id() -> PeerId {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(CLIENT_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for b in &mut id[8..] {
        *b = rng.gen_range(b'0'..=b'9');
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_peer_id_has_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], CLIENT_ID_PREFIX);
    }

    #[test]
    fn test_conf_new_defaults() {
        let conf = Conf::new("/tmp/downloads");
        assert_eq!(conf.torrent.session_count, 35);
        assert_eq!(conf.torrent.max_ongoing_pieces, 20);
        assert_eq!(conf.engine.listener_port, DEFAULT_PORT);
    }
}
