//! The crate-wide error type and result alias.
//!
//! Every fallible operation in this crate returns [`Result`]. The variants
//! below map directly onto the error taxonomy this crate is built against:
//! `MalformedMessage`, `ProtocolError` and `Io` (standing in for the
//! taxonomy's `NetworkError`, since on this side of the wire a dial refusal,
//! a reset, and a plain disk I/O failure are all just an `std::io::Error`)
//! are session-scoped and cause the peer session that raised them to log and
//! restart. `TrackerError` and `UnsupportedTrackerEncoding` are scoped to one
//! tracker round trip. `IntegrityError` never leaves the piece manager: it is
//! constructed, logged, and the offending piece is reset to `Missing`.
//! `ConfigError` is the only variant that is meant to reach the engine's
//! caller.

use std::fmt;

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Peer bytes could not be framed, or the frame's shape didn't match its
    /// declared message ID.
    MalformedMessage,
    /// Handshake protocol string or info hash didn't match what we expect.
    ProtocolError,
    /// Dial refused, a socket was reset, a read/write failed, or a disk
    /// operation in file placement failed.
    Io(std::io::Error),
    /// The tracker responded with an HTTP status other than 200, or the
    /// response body contained a `failure reason` key.
    TrackerError(String),
    /// The tracker's peer list was dictionary-encoded; only the compact
    /// bytestring encoding is supported.
    UnsupportedTrackerEncoding,
    /// A piece's SHA-1 didn't match its expected hash after assembly.
    ///
    /// This variant exists for testability; the piece manager never returns
    /// it from a public method; it resets the piece and keeps going.
    IntegrityError,
    /// The metainfo dictionary was missing a required key or had a shape we
    /// don't recognize.
    ConfigError(String),
    /// A piece index was out of the torrent's bounds.
    InvalidPieceIndex,
    /// A file index was out of the torrent's bounds.
    InvalidFileIndex,
    /// The metainfo or tracker response bencoding itself failed to parse.
    Bencode(serde_bencode::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedMessage => write!(f, "malformed peer message"),
            Self::ProtocolError => write!(f, "peer protocol violation"),
            Self::Io(e) => write!(f, "i/o error: {}", e),
            Self::TrackerError(reason) => {
                write!(f, "tracker error: {}", reason)
            }
            Self::UnsupportedTrackerEncoding => {
                write!(f, "tracker returned an unsupported peer encoding")
            }
            Self::IntegrityError => write!(f, "piece failed integrity check"),
            Self::ConfigError(reason) => {
                write!(f, "invalid torrent configuration: {}", reason)
            }
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::InvalidFileIndex => write!(f, "invalid file index"),
            Self::Bencode(e) => write!(f, "bencode error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Bencode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::TrackerError(e.to_string())
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Self::Io(std::io::Error::from(e))
    }
}
