//! Progress notifications for torrent downloads.
//!
//! Rather than a callback stored as a field on the engine or piece manager,
//! callers implement [`Observer`] and hand a trait object to the engine at
//! startup. Every method has a no-op default, so an observer only needs to
//! implement the events it cares about.

use crate::PieceIndex;

/// Receives progress events for a single torrent.
///
/// All methods default to doing nothing, so [`NoopObserver`] (and any partial
/// implementor) needs no boilerplate.
pub trait Observer {
    /// Called once a piece has been verified and written to disk.
    fn on_piece_completed(&self, _index: PieceIndex) {}

    /// Called once every selected piece has reached the Have state.
    fn on_torrent_completed(&self) {}

    /// Called periodically with a rolling estimate of download throughput,
    /// in bytes per second.
    fn on_speed_update(&self, _download_bps: u64, _upload_bps: u64) {}

    /// Called when a peer connection is established.
    fn on_peer_connected(&self, _addr: std::net::SocketAddr) {}

    /// Called when a peer connection is lost, with the reason if known.
    fn on_peer_disconnected(&self, _addr: std::net::SocketAddr, _reason: &str) {}
}

/// An [`Observer`] that ignores every event; the engine's default when the
/// caller doesn't supply one.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {}
