//! The piece/block scheduler.
//!
//! Owns the catalog of pieces and blocks, peer bitfields, the pending-request
//! table, and the hash-verify/commit pipeline. Peer sessions interact with it
//! purely through [`PieceManager::add_peer`], [`PieceManager::update_peer`],
//! [`PieceManager::next_request`], [`PieceManager::block_received`] and
//! [`PieceManager::commit_piece`] -- pieces and blocks live in arrays indexed
//! by piece/block id, never behind back-pointers, and this is the single
//! owning component for the catalog (peer sessions never see it directly).
//!
//! `block_received` and `commit_piece` are split in two, rather than one
//! method that writes the piece to disk itself, because the disk write is an
//! `.await` point and this type is normally reached through
//! `Rc<RefCell<PieceManager>>`: awaiting while still holding the `RefCell`'s
//! borrow would let another peer session's turn on the scheduler try to
//! borrow it too and panic. The caller does the write in between the two
//! calls, once `block_received`'s borrow has already been dropped.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use sha1::{Digest, Sha1};

use crate::{
    block_count, block_len, error::*, metainfo::Metainfo,
    observer::Observer, storage::Storage, storage_info::StorageInfo,
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

/// A block's status within its owning piece.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockStatus {
    Missing,
    Pending,
    Retrieved,
}

#[derive(Clone, Debug)]
struct Block {
    offset: u32,
    len: u32,
    status: BlockStatus,
    data: Option<Vec<u8>>,
}

#[derive(Debug)]
struct Piece {
    index: PieceIndex,
    expected_hash: Sha1Hash,
    blocks: Vec<Block>,
}

impl Piece {
    fn new(index: PieceIndex, len: u32, expected_hash: Sha1Hash) -> Self {
        let count = block_count(len);
        let blocks = (0..count)
            .map(|i| {
                let offset = i as u32 * crate::BLOCK_LEN;
                Block {
                    offset,
                    len: block_len(len, i),
                    status: BlockStatus::Missing,
                    data: None,
                }
            })
            .collect();
        Self {
            index,
            expected_hash,
            blocks,
        }
    }

    fn is_complete(&self) -> bool {
        self.blocks
            .iter()
            .all(|b| b.status == BlockStatus::Retrieved)
    }

    fn concatenated(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(
            self.blocks.iter().map(|b| b.len as usize).sum(),
        );
        for block in &self.blocks {
            data.extend_from_slice(
                block.data.as_ref().expect("complete piece missing data"),
            );
        }
        data
    }

    fn matches_hash(&self) -> bool {
        let mut hasher = Sha1::new();
        for block in &self.blocks {
            hasher.update(block.data.as_ref().expect("complete piece missing data"));
        }
        let digest = hasher.finalize();
        digest.as_slice() == self.expected_hash
    }

    fn reset(&mut self) {
        for block in &mut self.blocks {
            block.status = BlockStatus::Missing;
            block.data = None;
        }
    }
}

/// An outstanding request: the block it's for and when it was (re-)issued.
struct PendingRequest {
    piece_index: PieceIndex,
    offset: u32,
    requested_at: Instant,
}

/// Which disjoint set a piece currently belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Bucket {
    Missing,
    Ongoing,
    Have,
}

/// The scheduler. See the module documentation.
pub(crate) struct PieceManager {
    storage: std::rc::Rc<Storage>,
    /// All pieces selected for download, keyed by index, holding both their
    /// block layout and their current bucket.
    pieces: HashMap<PieceIndex, (Piece, Bucket)>,
    /// Missing and Ongoing piece indices, kept in ascending order, since the
    /// scheduling rules scan them "in order".
    missing: Vec<PieceIndex>,
    ongoing: Vec<PieceIndex>,
    /// Peer bitfields, keyed by peer id.
    peers: HashMap<PeerId, Bitfield>,
    pending: Vec<PendingRequest>,
    request_timeout: Duration,
    max_ongoing_pieces: usize,
    piece_len: u32,
    download_len: u64,
}

impl PieceManager {
    /// Walks the descriptor's piece-hash table and precomputes every piece
    /// with its block layout, filtering out pieces that belong exclusively to
    /// files outside the chosen-files selector.
    pub fn new(
        metainfo: &Metainfo,
        storage_info: &StorageInfo,
        storage: Storage,
        chosen_files: Option<&std::collections::BTreeSet<crate::FileIndex>>,
        request_timeout: Duration,
        max_ongoing_pieces: usize,
    ) -> Result<Self> {
        let piece_count = metainfo.piece_count();
        let mut pieces = HashMap::with_capacity(piece_count);
        let mut missing = Vec::with_capacity(piece_count);

        for index in 0..piece_count {
            if !storage_info.is_piece_needed(index, chosen_files)? {
                continue;
            }
            let len = storage_info.piece_len(index)?;
            let hash = metainfo.piece_hash(index)?;
            pieces.insert(index, (Piece::new(index, len, hash), Bucket::Missing));
            missing.push(index);
        }

        Ok(Self {
            storage: std::rc::Rc::new(storage),
            pieces,
            missing,
            ongoing: Vec::new(),
            peers: HashMap::new(),
            pending: Vec::new(),
            request_timeout,
            max_ongoing_pieces,
            piece_len: storage_info.piece_len,
            download_len: storage_info.download_len,
        })
    }

    /// The number of pieces selected for download (after the chosen-files
    /// filter), i.e. `|Missing| + |Ongoing| + |Have|`.
    pub fn selected_piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Returns a handle to the shared file placement layer, for upload
    /// sessions serving `Request`s against pieces already in Have.
    pub fn storage(&self) -> std::rc::Rc<Storage> {
        std::rc::Rc::clone(&self.storage)
    }

    /// Whether the piece at `index` has been verified and written to disk.
    pub fn has_piece(&self, index: PieceIndex) -> bool {
        self.pieces
            .get(&index)
            .map(|(_, bucket)| *bucket == Bucket::Have)
            .unwrap_or(false)
    }

    /// Registers a peer's bitfield. The precondition that the bitfield's
    /// length covers every piece index is the caller's (the peer session's)
    /// responsibility to uphold; out-of-range bits are simply never scanned.
    pub fn add_peer(&mut self, peer_id: PeerId, bitfield: Bitfield) {
        self.peers.insert(peer_id, bitfield);
    }

    /// Sets the bit for `index` in the peer's bitfield; a no-op if the peer
    /// is unknown (it hasn't sent a BitField yet).
    pub fn update_peer(&mut self, peer_id: PeerId, index: PieceIndex) {
        if let Some(bitfield) = self.peers.get_mut(&peer_id) {
            if index < bitfield.len() {
                bitfield.set(index, true);
            }
        }
    }

    /// Drops a peer's bitfield record; invoked by the session on disconnect
    /// so later scheduling scans no longer consider it a source for any
    /// piece.
    pub fn remove_peer(&mut self, peer_id: &PeerId) {
        self.peers.remove(peer_id);
    }

    fn peer_has(&self, peer_id: &PeerId, index: PieceIndex) -> bool {
        self.peers
            .get(peer_id)
            .map(|b| index < b.len() && b[index])
            .unwrap_or(false)
    }

    /// Decides the next block to request from `peer_id`, per the priority
    /// order: expired re-request, continue an ongoing piece, start a new
    /// piece -- with the back-pressure rule preferring pending blocks from
    /// ongoing pieces once more than `max_ongoing_pieces` are in flight.
    pub fn next_request(&mut self, peer_id: PeerId) -> Option<BlockInfo> {
        if let Some(block) = self.next_expired_request(&peer_id) {
            return Some(block);
        }

        let prefer_ongoing = self.ongoing.len() > self.max_ongoing_pieces;
        if prefer_ongoing {
            // Already over the back-pressure threshold: only pending blocks
            // from pieces already in flight are eligible, never a new piece.
            return self.next_ongoing_block(&peer_id);
        }

        if let Some(block) = self.next_ongoing_block(&peer_id) {
            return Some(block);
        }
        self.start_new_piece(&peer_id)
    }

    fn next_expired_request(&mut self, peer_id: &PeerId) -> Option<BlockInfo> {
        let now = Instant::now();
        for pending in self.pending.iter_mut() {
            if !self.peers.get(peer_id).map(|b| {
                pending.piece_index < b.len() && b[pending.piece_index]
            }).unwrap_or(false) {
                continue;
            }
            if now.duration_since(pending.requested_at) > self.request_timeout {
                pending.requested_at = now;
                let (piece, _) = self.pieces.get(&pending.piece_index)?;
                let block = piece
                    .blocks
                    .iter()
                    .find(|b| b.offset == pending.offset)?;
                return Some(BlockInfo {
                    piece_index: pending.piece_index,
                    offset: block.offset,
                    len: block.len,
                });
            }
        }
        None
    }

    fn next_ongoing_block(&mut self, peer_id: &PeerId) -> Option<BlockInfo> {
        for &index in self.ongoing.iter() {
            if !self.peer_has(peer_id, index) {
                continue;
            }
            let (piece, _) = self.pieces.get_mut(&index).expect("ongoing piece missing");
            if let Some(block) = piece
                .blocks
                .iter_mut()
                .find(|b| b.status == BlockStatus::Missing)
            {
                block.status = BlockStatus::Pending;
                let info = BlockInfo {
                    piece_index: index,
                    offset: block.offset,
                    len: block.len,
                };
                self.pending.push(PendingRequest {
                    piece_index: index,
                    offset: info.offset,
                    requested_at: Instant::now(),
                });
                return Some(info);
            }
        }
        None
    }

    fn start_new_piece(&mut self, peer_id: &PeerId) -> Option<BlockInfo> {
        let position = self
            .missing
            .iter()
            .position(|&index| self.peer_has(peer_id, index))?;
        let index = self.missing.remove(position);
        self.ongoing.push(index);
        let (piece, bucket) =
            self.pieces.get_mut(&index).expect("missing piece vanished");
        *bucket = Bucket::Ongoing;
        let block = piece
            .blocks
            .iter_mut()
            .find(|b| b.status == BlockStatus::Missing)
            .expect("freshly started piece has no missing blocks");
        block.status = BlockStatus::Pending;
        let info = BlockInfo {
            piece_index: index,
            offset: block.offset,
            len: block.len,
        };
        self.pending.push(PendingRequest {
            piece_index: index,
            offset: info.offset,
            requested_at: Instant::now(),
        });
        Some(info)
    }

    /// Accepts a delivered block. If it completes its piece, verifies the
    /// piece's SHA-1. A match leaves the piece in Ongoing and returns its
    /// concatenated payload for the caller to hand to file placement and
    /// then confirm via [`PieceManager::commit_piece`]; a mismatch resets
    /// every block in the piece back to Missing itself and leaves it in
    /// Ongoing for full re-fetch.
    ///
    /// This is deliberately synchronous: the actual disk write is an `.await`
    /// point, and awaiting while holding the `RefCell` borrow that wraps this
    /// type would let another peer session's turn on the scheduler try to
    /// borrow it too and panic. The caller does the write (and the matching
    /// `commit_piece` call) after this borrow is released.
    pub fn block_received(
        &mut self,
        peer_id: PeerId,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<Option<Vec<u8>>> {
        if let Some(pos) = self
            .pending
            .iter()
            .position(|p| p.piece_index == piece_index && p.offset == offset)
        {
            self.pending.remove(pos);
        }

        let (piece, _bucket) = match self.pieces.get_mut(&piece_index) {
            Some(entry) if entry.1 == Bucket::Ongoing => entry,
            _ => {
                log::debug!(
                    "Dropping late block for abandoned piece {} from peer {:?}",
                    piece_index,
                    peer_id
                );
                return Ok(None);
            }
        };

        if let Some(block) = piece.blocks.iter_mut().find(|b| b.offset == offset) {
            block.status = BlockStatus::Retrieved;
            block.data = Some(data);
        } else {
            log::warn!(
                "Peer {:?} delivered block at unknown offset {} in piece {}",
                peer_id,
                offset,
                piece_index
            );
            return Ok(None);
        }

        if !piece.is_complete() {
            return Ok(None);
        }

        if piece.matches_hash() {
            Ok(Some(piece.concatenated()))
        } else {
            log::warn!(
                "Piece {} failed integrity check (expected hash {}), resetting",
                piece_index,
                hex::encode(piece.expected_hash)
            );
            piece.reset();
            // stays in Ongoing for full re-fetch
            Ok(None)
        }
    }

    /// Moves a verified piece from Ongoing to Have and signals progress.
    /// Called once the payload [`PieceManager::block_received`] returned has
    /// actually been written to disk.
    pub fn commit_piece(&mut self, piece_index: PieceIndex, observer: &dyn Observer) {
        if let Some((_, bucket)) = self.pieces.get_mut(&piece_index) {
            *bucket = Bucket::Have;
        }
        self.ongoing.retain(|&i| i != piece_index);
        log::info!("Piece {} verified and written to disk", piece_index);
        observer.on_piece_completed(piece_index);
        if self.ongoing.is_empty() && self.missing.is_empty() {
            observer.on_torrent_completed();
        }
    }

    /// `bytes_downloaded = |Have| * piece_length`, except once every piece is
    /// in Have, where it's the exact `download_len` (the last piece may be
    /// shorter than `piece_length`, so the `|Have| * piece_length` formula
    /// overcounts by `piece_length - last_piece_len` in that case).
    pub fn bytes_downloaded(&self) -> u64 {
        let have_count = self
            .pieces
            .values()
            .filter(|(_, bucket)| *bucket == Bucket::Have)
            .count();
        if have_count == self.pieces.len() {
            return self.download_len;
        }
        have_count as u64 * self.piece_len as u64
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::{
        observer::NoopObserver,
        storage_info::{FileInfo, FsStructure},
    };

    fn peer_id(byte: u8) -> PeerId {
        [byte; 20]
    }

    fn setup(piece_count: usize, piece_len: u32, last_piece_len: u32) -> (PieceManager, StorageInfo) {
        let dir = tempdir().unwrap();
        let download_len =
            (piece_count as u64 - 1) * piece_len as u64 + last_piece_len as u64;
        let storage_info = StorageInfo {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir: dir.path().to_owned(),
            structure: FsStructure::File(FileInfo {
                path: "f.bin".into(),
                len: download_len,
                torrent_offset: 0,
            }),
        };
        let storage = Storage::new(storage_info.clone(), None).unwrap();

        let piece_hashes = vec![0u8; piece_count * 20];
        let metainfo_bytes = build_metainfo_bytes(piece_len, &piece_hashes, download_len);
        let metainfo = Metainfo::from_bytes(&metainfo_bytes).unwrap();

        let manager = PieceManager::new(
            &metainfo,
            &storage_info,
            storage,
            None,
            Duration::from_millis(30_000),
            20,
        )
        .unwrap();
        (manager, storage_info)
    }

    fn build_metainfo_bytes(piece_len: u32, pieces: &[u8], len: u64) -> Vec<u8> {
        #[derive(serde::Serialize)]
        struct RawFile {
            path: Vec<String>,
            length: i64,
        }
        #[derive(serde::Serialize)]
        struct RawInfo<'a> {
            name: String,
            #[serde(with = "serde_bytes")]
            pieces: &'a [u8],
            #[serde(rename = "piece length")]
            piece_length: u32,
            length: Option<u64>,
            files: Option<Vec<RawFile>>,
            private: Option<u8>,
        }
        #[derive(serde::Serialize)]
        struct RawMetainfo<'a> {
            announce: String,
            info: RawInfo<'a>,
        }
        let raw = RawMetainfo {
            announce: "http://tracker.example/announce".into(),
            info: RawInfo {
                name: "f.bin".into(),
                pieces,
                piece_length: piece_len,
                length: Some(len),
                files: None,
                private: None,
            },
        };
        serde_bencode::to_bytes(&raw).unwrap()
    }

    #[test]
    fn test_piece_scheduling_order() {
        let (mut manager, _) = setup(2, crate::BLOCK_LEN * 2, crate::BLOCK_LEN * 2);
        let peer = peer_id(1);
        let bitfield: Bitfield = Bitfield::repeat(true, 2);
        manager.add_peer(peer, bitfield);

        // piece 0 has two blocks; expect (0,0) then (0, BLOCK_LEN) then (1,0)
        let b0 = manager.next_request(peer).unwrap();
        assert_eq!((b0.piece_index, b0.offset), (0, 0));
        let b1 = manager.next_request(peer).unwrap();
        assert_eq!((b1.piece_index, b1.offset), (0, crate::BLOCK_LEN));
        let b2 = manager.next_request(peer).unwrap();
        assert_eq!((b2.piece_index, b2.offset), (1, 0));
    }

    #[test]
    fn test_integrity_failure_resets_piece_stays_ongoing() {
        let (mut manager, _) = setup(1, 8, 8);
        let peer = peer_id(2);
        let bitfield: Bitfield = Bitfield::repeat(true, 1);
        manager.add_peer(peer, bitfield);

        let block = manager.next_request(peer).unwrap();
        let payload = manager
            .block_received(peer, block.piece_index, block.offset, vec![0xAA; block.len as usize])
            .unwrap();

        // piece 0 (len 8) has only one block (8 <= 16KiB), so it's complete
        // and should have failed the hash check (expected hash is all zero,
        // payload is 0xAA) and been reset, never returning a payload to write
        assert!(payload.is_none());
        let (piece, bucket) = manager.pieces.get(&0).unwrap();
        assert_eq!(*bucket, Bucket::Ongoing);
        assert!(piece.blocks.iter().all(|b| b.status == BlockStatus::Missing));
    }

    #[tokio::test]
    async fn test_bytes_downloaded_accounts_for_last_piece() {
        let (mut manager, _) = setup(2, 8, 3);
        let peer = peer_id(3);
        let bitfield: Bitfield = Bitfield::repeat(true, 2);
        manager.add_peer(peer, bitfield);

        let observer = NoopObserver;
        while let Some(block) = manager.next_request(peer) {
            let payload = manager
                .block_received(
                    peer,
                    block.piece_index,
                    block.offset,
                    vec![0u8; block.len as usize],
                )
                .unwrap();
            if let Some(payload) = payload {
                let storage = manager.storage();
                storage.write_piece(block.piece_index, payload).await.unwrap();
                manager.commit_piece(block.piece_index, &observer);
            }
        }

        assert_eq!(manager.bytes_downloaded(), 8 + 3);
    }
}
