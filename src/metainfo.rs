//! Parsing of the bencoded `.torrent` metainfo file into the descriptor the
//! rest of the crate consumes.
//!
//! This is a thin, separately testable layer rather than an opaque input: the
//! wire codec already depends on `serde_bencode` for the tracker's response
//! body, so the same encoding is used here.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::{
    error::*,
    storage_info::{FileInfo, FsStructure},
    Sha1Hash,
};

/// The parsed, validated torrent descriptor.
///
/// Immutable after construction. Blocks and pieces are derived from this by
/// the piece manager; file handles are derived from `structure` by file
/// placement.
#[derive(Clone, Debug)]
pub struct Metainfo {
    /// SHA-1 of the bencoded `info` dictionary; the torrent's identity.
    pub info_hash: Sha1Hash,
    /// The torrent's display name; also the download directory name for
    /// multi-file torrents, and the relative file path for single-file ones.
    pub name: String,
    /// The nominal length of a piece, in bytes. The final piece may be
    /// shorter; see [`crate::storage_info::StorageInfo`].
    pub piece_len: u32,
    /// The concatenation of all expected piece SHA-1 hashes, twenty bytes
    /// each.
    piece_hashes: Vec<u8>,
    /// The file layout: single file or a list of files laid out as one
    /// contiguous virtual byte stream.
    pub structure: FsStructure,
    /// The primary tracker announce URL.
    pub announce: String,
    /// Alternative tracker URLs, flattened from the (possibly tiered)
    /// announce-list, in the order they should be tried after `announce`
    /// fails.
    pub announce_list: Vec<String>,
}

impl Metainfo {
    /// Parses and validates a bencoded metainfo byte buffer.
    ///
    /// Fails with [`Error::ConfigError`] if required keys are missing or
    /// have an invalid shape, and with [`Error::Bencode`] if the buffer isn't
    /// valid bencoding at all.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)?;

        if raw.info.piece_length == 0 {
            return Err(Error::ConfigError(
                "piece length must be non-zero".into(),
            ));
        }
        if raw.info.pieces.len() % 20 != 0 {
            return Err(Error::ConfigError(
                "pieces field length is not a multiple of 20".into(),
            ));
        }

        let structure = match (&raw.info.length, &raw.info.files) {
            (Some(_), Some(_)) => {
                return Err(Error::ConfigError(
                    "info dictionary has both `length` and `files`".into(),
                ));
            }
            (Some(len), None) => FsStructure::File(FileInfo {
                path: PathBuf::from(&raw.info.name),
                len: *len,
                torrent_offset: 0,
            }),
            (None, Some(files)) => {
                if files.is_empty() {
                    return Err(Error::ConfigError(
                        "`files` list is empty".into(),
                    ));
                }
                let mut infos = Vec::with_capacity(files.len());
                let mut offset = 0u64;
                for file in files {
                    if file.length < 0 {
                        return Err(Error::ConfigError(
                            "file length must not be negative".into(),
                        ));
                    }
                    if file.path.is_empty() {
                        return Err(Error::ConfigError(
                            "file path must not be empty".into(),
                        ));
                    }
                    let len = file.length as u64;
                    let path: PathBuf = file.path.iter().collect();
                    infos.push(FileInfo {
                        path,
                        len,
                        torrent_offset: offset,
                    });
                    offset += len;
                }
                FsStructure::Archive { files: infos }
            }
            (None, None) => {
                return Err(Error::ConfigError(
                    "info dictionary has neither `length` nor `files`".into(),
                ));
            }
        };

        let info_hash = compute_info_hash(&raw.info)?;

        // Flatten the (possibly tiered) announce-list, in reverse order per
        // tier so the fallback order matches the order trackers should be
        // retried in after the primary fails.
        let announce_list = raw
            .announce_list
            .unwrap_or_default()
            .into_iter()
            .flatten()
            .filter(|url| *url != raw.announce)
            .rev()
            .collect();

        Ok(Self {
            info_hash,
            name: raw.info.name,
            piece_len: raw.info.piece_length,
            piece_hashes: raw.info.pieces,
            structure,
            announce: raw.announce,
            announce_list,
        })
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len() / 20
    }

    /// Returns the expected SHA-1 hash of the piece at `index`, if valid.
    pub fn piece_hash(&self, index: usize) -> Result<Sha1Hash> {
        let start = index
            .checked_mul(20)
            .filter(|&start| start + 20 <= self.piece_hashes.len())
            .ok_or(Error::InvalidPieceIndex)?;
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&self.piece_hashes[start..start + 20]);
        Ok(hash)
    }
}

fn compute_info_hash(info: &RawInfo) -> Result<Sha1Hash> {
    let bytes = serde_bencode::to_bytes(info)?;
    let digest = Sha1::digest(&bytes);
    let mut hash = [0; 20];
    hash.copy_from_slice(&digest);
    Ok(hash)
}

#[derive(Debug, Deserialize)]
struct RawMetainfo {
    announce: String,
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
    info: RawInfo,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawInfo {
    name: String,
    #[serde(with = "serde_bytes")]
    pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    piece_length: u32,
    length: Option<u64>,
    files: Option<Vec<RawFile>>,
    private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFile {
    path: Vec<String>,
    length: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    // A minimal single-file torrent with one 4-byte piece.
    fn single_file_metainfo_bytes() -> Vec<u8> {
        let pieces = vec![0u8; 20];
        let raw = RawMetainfo {
            announce: "http://tracker.example:6969/announce".to_owned(),
            announce_list: None,
            info: RawInfo {
                name: "test.bin".to_owned(),
                pieces,
                piece_length: 4,
                length: Some(4),
                files: None,
                private: None,
            },
        };
        serde_bencode::to_bytes(&raw).unwrap()
    }

    #[test]
    fn test_parse_single_file() {
        let buf = single_file_metainfo_bytes();
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.name, "test.bin");
        assert_eq!(metainfo.piece_len, 4);
        assert_eq!(metainfo.piece_count(), 1);
        assert!(!metainfo.structure.is_archive());
    }

    #[test]
    fn test_rejects_pieces_not_multiple_of_twenty() {
        let raw = RawMetainfo {
            announce: "http://tracker.example:6969/announce".to_owned(),
            announce_list: None,
            info: RawInfo {
                name: "test.bin".to_owned(),
                pieces: vec![0u8; 13],
                piece_length: 4,
                length: Some(4),
                files: None,
                private: None,
            },
        };
        let buf = serde_bencode::to_bytes(&raw).unwrap();
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn test_parse_multi_file() {
        let pieces = vec![0u8; 40];
        let raw = RawMetainfo {
            announce: "http://tracker.example:6969/announce".to_owned(),
            announce_list: Some(vec![vec![
                "http://tracker.example:6969/announce".to_owned(),
                "http://backup.example:6969/announce".to_owned(),
            ]]),
            info: RawInfo {
                name: "archive".to_owned(),
                pieces,
                piece_length: 8,
                length: None,
                files: Some(vec![
                    RawFile {
                        path: vec!["a.bin".to_owned()],
                        length: 6,
                    },
                    RawFile {
                        path: vec!["dir".to_owned(), "b.bin".to_owned()],
                        length: 10,
                    },
                ]),
                private: None,
            },
        };
        let buf = serde_bencode::to_bytes(&raw).unwrap();
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert!(metainfo.structure.is_archive());
        assert_eq!(metainfo.structure.download_len(), 16);
        assert_eq!(metainfo.announce_list, vec!["http://backup.example:6969/announce".to_owned()]);
    }
}
