//! Bridges [`FileLayout`] to an external progress observer.
//!
//! Tracks byte counters and per-chunk state, and invokes an
//! `on_verified` callback exactly once per piece for the life of the
//! store.
use crate::bitfield::Bitfield;
use crate::layout::{FileLayout, LayoutResult};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    Downloading,
    Completed,
}

struct Inner {
    chunks: Vec<ChunkState>,
    verified: Bitfield,
    downloaded_bytes: u64,
    verified_bytes: u64,
    on_verified: Option<Box<dyn Fn(usize) + Send + Sync>>,
}

pub struct ProgressStore {
    layout: FileLayout,
    total_length: u64,
    inner: Mutex<Inner>,
}

impl ProgressStore {
    pub fn new(layout: FileLayout, total_length: u64) -> Self {
        let num_pieces = layout.num_pieces();
        Self {
            layout,
            total_length,
            inner: Mutex::new(Inner {
                chunks: vec![ChunkState::Pending; num_pieces],
                verified: Bitfield::new(num_pieces),
                downloaded_bytes: 0,
                verified_bytes: 0,
                on_verified: None,
            }),
        }
    }

    pub fn set_on_verified(&self, callback: impl Fn(usize) + Send + Sync + 'static) {
        self.inner.lock().unwrap().on_verified = Some(Box::new(callback));
    }

    pub fn layout(&self) -> &FileLayout {
        &self.layout
    }

    /// Reconstructs verified state from a previously persisted chunk
    /// bitmap. Contributes to `verified_bytes` (so completion detection
    /// works across a resume) but never to `downloaded_bytes`, which
    /// tracks only bytes actually transferred this session.
    pub fn resume_from_bitmap(&self, bitmap: &Bitfield) {
        let mut inner = self.inner.lock().unwrap();
        for i in 0..inner.chunks.len().min(bitmap.len()) {
            if bitmap.is_set(i) && !inner.verified.is_set(i) {
                inner.verified.set(i);
                inner.chunks[i] = ChunkState::Completed;
                inner.verified_bytes += self.layout.piece_size(i);
            }
        }
    }

    pub fn on_write(&self, index: usize, bytes_written: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.downloaded_bytes += bytes_written as u64;
        if let Some(chunk) = inner.chunks.get_mut(index) {
            if *chunk == ChunkState::Pending {
                *chunk = ChunkState::Downloading;
            }
        }
    }

    pub fn write_at_piece(&self, index: usize, piece_offset: u64, data: &[u8]) -> LayoutResult<()> {
        self.layout.write_at_piece(index, piece_offset, data)?;
        self.on_write(index, data.len());
        Ok(())
    }

    fn mark_verified(&self, index: usize) {
        let callback = {
            let mut inner = self.inner.lock().unwrap();
            if inner.verified.is_set(index) {
                return;
            }
            inner.verified.set(index);
            if let Some(chunk) = inner.chunks.get_mut(index) {
                *chunk = ChunkState::Completed;
            }
            inner.verified_bytes += self.layout.piece_size(index);
            inner.on_verified.is_some().then(|| ())
        };
        if callback.is_some() {
            let inner = self.inner.lock().unwrap();
            if let Some(cb) = &inner.on_verified {
                cb(index);
            }
        }
    }

    pub fn verify_piece(&self, index: usize) -> LayoutResult<()> {
        self.layout.verify_piece(index)?;
        self.mark_verified(index);
        Ok(())
    }

    pub fn verify_piece_data(&self, index: usize, data: &[u8]) -> LayoutResult<()> {
        self.layout.verify_piece_data(index, data)?;
        self.mark_verified(index);
        Ok(())
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.inner.lock().unwrap().downloaded_bytes
    }

    pub fn verified_bytes(&self) -> u64 {
        self.inner.lock().unwrap().verified_bytes
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn is_complete(&self) -> bool {
        self.verified_bytes() >= self.total_length
    }

    pub fn bitfield(&self) -> Bitfield {
        self.inner.lock().unwrap().verified.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::Info;
    use sha1::{Digest, Sha1};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn layout_with_piece(dir: &std::path::Path, data: &[u8]) -> (FileLayout, u64) {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let info = Info {
            name: "f.bin".into(),
            piece_length: data.len() as u64,
            pieces: vec![hasher.finalize().into()],
            private: false,
            length: Some(data.len() as u64),
            files: Vec::new(),
        };
        let layout = FileLayout::create(dir, &info).unwrap();
        (layout, data.len() as u64)
    }

    #[test]
    fn on_verified_fires_exactly_once_per_piece() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"hello world";
        let (layout, total) = layout_with_piece(dir.path(), data);
        let store = ProgressStore::new(layout, total);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        store.set_on_verified(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        store.write_at_piece(0, 0, data).unwrap();
        store.verify_piece_data(0, data).unwrap();
        store.verify_piece_data(0, data).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.is_complete());
    }

    #[test]
    fn resume_from_bitmap_does_not_increment_byte_counters() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"resumed!!!!";
        let (layout, total) = layout_with_piece(dir.path(), data);
        let store = ProgressStore::new(layout, total);

        let mut bitmap = Bitfield::new(1);
        bitmap.set(0);
        store.resume_from_bitmap(&bitmap);

        assert_eq!(store.downloaded_bytes(), 0);
        assert_eq!(store.verified_bytes(), total);
        assert!(store.is_complete());
        assert!(store.bitfield().is_set(0));
    }
}
