//! Maps `(piece_index, offset, length)` onto one or more files on disk and
//! performs the positioned reads and writes that stitch verified pieces back
//! into the torrent's files.
//!
//! Single-file mode opens one handle; multi-file mode opens one handle per
//! chosen file and splits each piece's byte range across every file it
//! intersects, in file order. Handles live behind an `Arc<Mutex<File>>` so a
//! `Storage` can be shared (via `Rc`, since every task lives on the same
//! single-threaded executor) between the piece manager's owning task and any
//! upload session serving a `Request` for a Have piece, without requiring
//! `&mut` access to the whole structure for a single file's I/O. The actual
//! positioned syscall runs on `tokio::task::spawn_blocking`'s worker pool --
//! `pread`/`pwrite` block, and running them inline would stall every other
//! session on the single-threaded scheduler for the duration of the disk
//! I/O. The mutex only serializes two blocking-pool workers against the same
//! file handle; it's never held across an `.await`.

use std::{
    collections::BTreeSet,
    fs::{self, File, OpenOptions},
    sync::{Arc, Mutex},
};

use nix::sys::uio::{pread, pwrite};

use crate::{
    error::*,
    storage_info::{FileSlice, FsStructure, StorageInfo},
    FileIndex, PieceIndex,
};

/// Owns the open file handles for one torrent's download and performs
/// positioned I/O against them.
pub(crate) struct Storage {
    info: StorageInfo,
    /// One slot per file in `info.structure`, indexed the same way
    /// `StorageInfo::files_intersecting_piece` indexes them. Files excluded
    /// by the chosen-files selector have no handle, so a piece that straddles
    /// an included and an excluded file is still materialized for the
    /// included portion only, per the file-range intersection semantics.
    files: Vec<Option<Arc<Mutex<File>>>>,
}

impl Storage {
    /// Opens (creating if necessary) the file handles for the chosen files of
    /// the torrent, creating intermediate directories as needed.
    pub fn new(
        info: StorageInfo,
        chosen_files: Option<&BTreeSet<FileIndex>>,
    ) -> Result<Self> {
        fs::create_dir_all(&info.download_dir)?;

        let file_infos: Vec<_> = match &info.structure {
            FsStructure::File(file) => vec![file.clone()],
            FsStructure::Archive { files } => files.clone(),
        };

        let mut files = Vec::with_capacity(file_infos.len());
        for (index, file_info) in file_infos.into_iter().enumerate() {
            let is_chosen = chosen_files
                .map(|chosen_files| chosen_files.contains(&index))
                .unwrap_or(true);
            if !is_chosen {
                files.push(None);
                continue;
            }

            let path = info.download_dir.join(&file_info.path);
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            log::info!("Opening torrent file {:?}", path);
            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            files.push(Some(Arc::new(Mutex::new(handle))));
        }

        Ok(Self { info, files })
    }

    /// Writes a fully verified piece's bytes to every chosen file it
    /// intersects. Bytes falling on an excluded file are skipped.
    ///
    /// Splitting the piece's byte range across intersected files only touches
    /// `self.info`, which is cheap and synchronous; only the actual
    /// `pwrite` per segment is handed to the blocking pool.
    pub async fn write_piece(&self, index: PieceIndex, data: Vec<u8>) -> Result<()> {
        let piece_offset = index as u64 * self.info.piece_len as u64;
        let file_range = self.info.files_intersecting_piece(index)?;
        let mut consumed = 0usize;

        for file_index in file_range {
            let file_info = self.file_info(file_index)?;
            let FileSlice { offset, len } = file_info.get_slice(
                piece_offset + consumed as u64,
                data.len() as u64 - consumed as u64,
            );
            let len = len as usize;
            if let Some(file) = self.file_handle(file_index)? {
                let file = Arc::clone(file);
                let chunk = data[consumed..consumed + len].to_vec();
                tokio::task::spawn_blocking(move || {
                    let file = file.lock().expect("storage file mutex poisoned");
                    write_at(&file, &chunk, offset)
                })
                .await
                .expect("storage write task panicked")?;
            }
            consumed += len;
        }

        debug_assert_eq!(consumed, data.len());
        Ok(())
    }

    /// Reads `len` bytes of a piece starting at `offset` within it, splitting
    /// the read across every file the range intersects.
    ///
    /// Fails with [`Error::InvalidFileIndex`] if any intersected file was
    /// excluded by the chosen-files selector, since there is nothing on disk
    /// to read back for it.
    pub async fn read_block(
        &self,
        index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> Result<Vec<u8>> {
        let torrent_offset =
            index as u64 * self.info.piece_len as u64 + offset as u64;
        let file_range = self
            .info
            .structure
            .files_intersecting_bytes(torrent_offset..torrent_offset + len as u64);

        let mut data = vec![0u8; len as usize];
        let mut read = 0usize;
        for file_index in file_range {
            let file_info = self.file_info(file_index)?;
            let FileSlice {
                offset: file_offset,
                len: slice_len,
            } = file_info.get_slice(
                torrent_offset + read as u64,
                len as u64 - read as u64,
            );
            let slice_len = slice_len as usize;
            let file = self
                .file_handle(file_index)?
                .ok_or(Error::InvalidFileIndex)?;
            let file = Arc::clone(file);
            let buf = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
                let file = file.lock().expect("storage file mutex poisoned");
                let mut buf = vec![0u8; slice_len];
                read_at(&file, &mut buf, file_offset)?;
                Ok(buf)
            })
            .await
            .expect("storage read task panicked")?;
            data[read..read + slice_len].copy_from_slice(&buf);
            read += slice_len;
        }

        debug_assert_eq!(read, data.len());
        Ok(data)
    }

    fn file_info(
        &self,
        index: FileIndex,
    ) -> Result<&crate::storage_info::FileInfo> {
        match &self.info.structure {
            FsStructure::File(file) => {
                debug_assert_eq!(index, 0);
                Ok(file)
            }
            FsStructure::Archive { files } => {
                files.get(index).ok_or(Error::InvalidFileIndex)
            }
        }
    }

    fn file_handle(&self, index: FileIndex) -> Result<Option<&Arc<Mutex<File>>>> {
        self.files
            .get(index)
            .map(|slot| slot.as_ref())
            .ok_or(Error::InvalidFileIndex)
    }
}

fn write_at(file: &File, buf: &[u8], offset: u64) -> Result<()> {
    let mut written = 0;
    while written < buf.len() {
        let n = pwrite(file, &buf[written..], (offset + written as u64) as i64)?;
        written += n;
    }
    Ok(())
}

fn read_at(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    let mut read = 0;
    while read < buf.len() {
        let n = pread(file, &mut buf[read..], (offset + read as u64) as i64)?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short read from torrent file",
            )));
        }
        read += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::storage_info::FileInfo;

    #[tokio::test]
    async fn test_single_file_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let info = StorageInfo {
            piece_count: 2,
            piece_len: 4,
            last_piece_len: 4,
            download_len: 8,
            download_dir: dir.path().to_owned(),
            structure: FsStructure::File(FileInfo {
                path: PathBuf::from("single.bin"),
                len: 8,
                torrent_offset: 0,
            }),
        };
        let storage = Storage::new(info, None).unwrap();

        storage.write_piece(0, vec![1, 2, 3, 4]).await.unwrap();
        storage.write_piece(1, vec![5, 6, 7, 8]).await.unwrap();

        assert_eq!(storage.read_block(0, 0, 4).await.unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(storage.read_block(1, 0, 4).await.unwrap(), vec![5, 6, 7, 8]);
        assert_eq!(storage.read_block(0, 2, 2).await.unwrap(), vec![3, 4]);

        let bytes = fs::read(dir.path().join("single.bin")).unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn test_multi_file_piece_spanning_two_files() {
        let dir = tempdir().unwrap();
        let info = StorageInfo {
            piece_count: 2,
            piece_len: 6,
            last_piece_len: 2,
            download_len: 8,
            download_dir: dir.path().to_owned(),
            structure: FsStructure::Archive {
                files: vec![
                    FileInfo {
                        path: PathBuf::from("a.bin"),
                        len: 4,
                        torrent_offset: 0,
                    },
                    FileInfo {
                        path: PathBuf::from("sub/b.bin"),
                        len: 4,
                        torrent_offset: 4,
                    },
                ],
            },
        };
        let storage = Storage::new(info, None).unwrap();

        // piece 0 spans bytes [0,6): all of a.bin and the first 2 bytes of b.bin
        storage.write_piece(0, vec![1, 2, 3, 4, 5, 6]).await.unwrap();
        storage.write_piece(1, vec![7, 8]).await.unwrap();

        assert_eq!(fs::read(dir.path().join("a.bin")).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(
            fs::read(dir.path().join("sub/b.bin")).unwrap(),
            vec![5, 6, 7, 8]
        );

        assert_eq!(storage.read_block(0, 0, 6).await.unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_chosen_files_skips_excluded_file() {
        let dir = tempdir().unwrap();
        let info = StorageInfo {
            piece_count: 1,
            piece_len: 8,
            last_piece_len: 8,
            download_len: 8,
            download_dir: dir.path().to_owned(),
            structure: FsStructure::Archive {
                files: vec![
                    FileInfo {
                        path: PathBuf::from("wanted.bin"),
                        len: 4,
                        torrent_offset: 0,
                    },
                    FileInfo {
                        path: PathBuf::from("unwanted.bin"),
                        len: 4,
                        torrent_offset: 4,
                    },
                ],
            },
        };
        let chosen: BTreeSet<FileIndex> = [0].into_iter().collect();
        Storage::new(info, Some(&chosen)).unwrap();

        assert!(dir.path().join("wanted.bin").exists());
        assert!(!dir.path().join("unwanted.bin").exists());
    }
}
