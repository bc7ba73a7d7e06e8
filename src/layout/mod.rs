//! Maps piece/byte offsets onto one or more files on disk.
//!
//! Files are created and sparse-allocated to their full length on
//! construction. All paths are re-rooted under the layout's base
//! directory; any path escape is rejected there rather than deferred to
//! first write.
use crate::bitfield::Bitfield;
use crate::torrent::Info;
use sha1::{Digest, Sha1};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("piece index {0} out of range")]
    PieceOutOfRange(usize),

    #[error("piece {index} failed verification")]
    InvalidPiece { index: usize },

    #[error("path escapes base directory: {0}")]
    PathEscape(String),
}

pub type LayoutResult<T> = std::result::Result<T, LayoutError>;

struct FileSpan {
    path: PathBuf,
    /// Byte offset of this file's first byte within the concatenated
    /// virtual file space.
    start: u64,
    length: u64,
}

pub struct FileLayout {
    piece_length: u64,
    total_length: u64,
    pieces: Vec<[u8; 20]>,
    files: Vec<FileSpan>,
    handles: Mutex<Vec<File>>,
    verified: Mutex<Bitfield>,
}

fn reroot(base: &Path, relative: &Path) -> LayoutResult<PathBuf> {
    use std::path::Component;
    let mut out = base.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            other => {
                return Err(LayoutError::PathEscape(format!("{other:?}")));
            }
        }
    }
    if !out.starts_with(base) {
        return Err(LayoutError::PathEscape(relative.display().to_string()));
    }
    Ok(out)
}

impl FileLayout {
    /// Creates (or opens) every file named by `info` under `base`, sparse
    /// pre-allocated to its final length.
    pub fn create(base: &Path, info: &Info) -> LayoutResult<Self> {
        let mut files = Vec::new();
        let mut handles = Vec::new();
        let mut offset = 0u64;

        if info.is_multi_file() {
            for entry in &info.files {
                let mut relative = PathBuf::from(&info.name);
                for part in &entry.path {
                    relative.push(part);
                }
                let path = reroot(base, &relative)?;
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let file = open_and_size(&path, entry.length)?;
                handles.push(file);
                files.push(FileSpan {
                    path,
                    start: offset,
                    length: entry.length,
                });
                offset += entry.length;
            }
        } else {
            let length = info.length.unwrap_or(0);
            let relative = PathBuf::from(&info.name);
            let path = reroot(base, &relative)?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = open_and_size(&path, length)?;
            handles.push(file);
            files.push(FileSpan {
                path,
                start: 0,
                length,
            });
            offset = length;
        }

        Ok(Self {
            piece_length: info.piece_length,
            total_length: offset,
            pieces: info.pieces.clone(),
            files,
            handles: Mutex::new(handles),
            verified: Mutex::new(Bitfield::new(info.pieces.len())),
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece_size(&self, index: usize) -> u64 {
        if index >= self.pieces.len() {
            return 0;
        }
        if index + 1 < self.pieces.len() {
            self.piece_length
        } else {
            let full = (self.pieces.len() as u64 - 1) * self.piece_length;
            self.total_length.saturating_sub(full)
        }
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.verified.lock().unwrap().is_set(index)
    }

    pub fn bitfield(&self) -> Bitfield {
        self.verified.lock().unwrap().clone()
    }

    fn piece_byte_range(&self, index: usize) -> LayoutResult<(u64, u64)> {
        if index >= self.pieces.len() {
            return Err(LayoutError::PieceOutOfRange(index));
        }
        let start = index as u64 * self.piece_length;
        let end = start + self.piece_size(index);
        Ok((start, end))
    }

    /// Splits `[global_start, global_end)` across file spans and invokes
    /// `f(file_index, file_offset, chunk_range_in_buffer)` for each
    /// overlapping file, in order.
    fn for_each_span(
        &self,
        global_start: u64,
        global_end: u64,
        mut f: impl FnMut(usize, u64, std::ops::Range<usize>) -> LayoutResult<()>,
    ) -> LayoutResult<()> {
        let mut buf_pos = 0usize;
        for (file_index, span) in self.files.iter().enumerate() {
            let span_end = span.start + span.length;
            if span_end <= global_start || span.start >= global_end {
                continue;
            }
            let overlap_start = global_start.max(span.start);
            let overlap_end = global_end.min(span_end);
            let len = (overlap_end - overlap_start) as usize;
            let file_offset = overlap_start - span.start;
            f(file_index, file_offset, buf_pos..buf_pos + len)?;
            buf_pos += len;
        }
        Ok(())
    }

    /// Writes `data` at `piece_offset` bytes into piece `index`.
    pub fn write_at_piece(&self, index: usize, piece_offset: u64, data: &[u8]) -> LayoutResult<()> {
        let (piece_start, piece_end) = self.piece_byte_range(index)?;
        let global_start = piece_start + piece_offset;
        let global_end = global_start + data.len() as u64;
        if global_end > piece_end {
            return Err(LayoutError::PieceOutOfRange(index));
        }

        let mut handles = self.handles.lock().unwrap();
        self.for_each_span(global_start, global_end, |file_index, file_offset, range| {
            let file = &mut handles[file_index];
            file.seek(SeekFrom::Start(file_offset))?;
            file.write_all(&data[range])?;
            Ok(())
        })
    }

    /// Reads `len` bytes starting `piece_offset` bytes into piece `index`.
    pub fn read_at_piece(&self, index: usize, piece_offset: u64, len: usize) -> LayoutResult<Vec<u8>> {
        let (piece_start, piece_end) = self.piece_byte_range(index)?;
        let global_start = piece_start + piece_offset;
        let global_end = global_start + len as u64;
        if global_end > piece_end {
            return Err(LayoutError::PieceOutOfRange(index));
        }

        let mut buf = vec![0u8; len];
        let mut handles = self.handles.lock().unwrap();
        self.for_each_span(global_start, global_end, |file_index, file_offset, range| {
            let file = &mut handles[file_index];
            file.seek(SeekFrom::Start(file_offset))?;
            file.read_exact(&mut buf[range])?;
            Ok(())
        })?;
        Ok(buf)
    }

    fn expected_hash(&self, index: usize) -> LayoutResult<&[u8; 20]> {
        self.pieces
            .get(index)
            .ok_or(LayoutError::PieceOutOfRange(index))
    }

    /// Reads piece `index` back from disk and checks its hash. Does not
    /// mutate the verified bitfield on mismatch.
    pub fn verify_piece(&self, index: usize) -> LayoutResult<()> {
        let size = self.piece_size(index);
        let data = self.read_at_piece(index, 0, size as usize)?;
        self.verify_piece_data(index, &data)
    }

    /// Hashes an in-memory buffer against piece `index`'s expected hash,
    /// skipping the disk read. The fast path used when a full piece has
    /// just been assembled from incoming blocks.
    pub fn verify_piece_data(&self, index: usize, data: &[u8]) -> LayoutResult<()> {
        let expected = *self.expected_hash(index)?;
        let mut hasher = Sha1::new();
        hasher.update(data);
        let actual: [u8; 20] = hasher.finalize().into();
        if actual != expected {
            return Err(LayoutError::InvalidPiece { index });
        }
        self.verified.lock().unwrap().set(index);
        Ok(())
    }

    pub fn file_paths(&self) -> Vec<&Path> {
        self.files.iter().map(|f| f.path.as_path()).collect()
    }
}

fn open_and_size(path: &Path, length: u64) -> LayoutResult<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    file.set_len(length)?;
    Ok(file)
}
