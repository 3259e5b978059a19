//! # Windowed Memory Map
//!
//! Optional fast path for the file I/O shim: a single map over the leading
//! `min(file_len, max_map_size)` bytes of the database file. Accesses that
//! fall entirely inside the window are memory copies; everything past it
//! falls back to descriptor I/O in [`DbFile`](super::DbFile).
//!
//! The window only ever grows at explicit remap points (file extension,
//! `max_map_size` changes), so a byte offset is served by exactly one of
//! the two paths for the life of the window — the map and the descriptor
//! never alias the same offset in one configuration.

use std::fs::File;

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::error::Result;

#[derive(Debug)]
enum MapInner {
    Ro(Mmap),
    Rw(MmapMut),
}

/// A read-only or read-write map over the head of the file.
#[derive(Debug)]
pub struct MmapWindow {
    map: MapInner,
}

impl MmapWindow {
    /// Map up to `max_size` bytes of the file. Returns `None` for an empty
    /// window (zero-length file or zero cap) or if the OS refuses the map —
    /// the caller silently stays on the descriptor path.
    pub fn map(file: &File, file_len: u64, max_size: usize, writable: bool) -> Option<Self> {
        let len = file_len.min(max_size as u64) as usize;
        if len == 0 {
            return None;
        }

        // SAFETY: mapping a file we hold open is unsafe because another
        // process could mutate it underneath us. The database file is
        // protected by the whole-file advisory lock (or the caller opted
        // out of locking and accepted external exclusion), and all window
        // access is bounds-checked against the mapped length.
        let map = unsafe {
            if writable {
                MmapOptions::new()
                    .len(len)
                    .map_mut(file)
                    .ok()
                    .map(MapInner::Rw)
            } else {
                MmapOptions::new().len(len).map(file).ok().map(MapInner::Ro)
            }
        }?;

        Some(Self { map })
    }

    pub fn len(&self) -> usize {
        match &self.map {
            MapInner::Ro(m) => m.len(),
            MapInner::Rw(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `[offset, offset + len)` lies entirely inside the window.
    pub fn covers(&self, offset: u64, len: usize) -> bool {
        offset
            .checked_add(len as u64)
            .is_some_and(|end| end <= self.len() as u64)
    }

    /// Copy out of the window; the caller has checked [`covers`].
    ///
    /// [`covers`]: MmapWindow::covers
    pub fn read(&self, offset: u64, buf: &mut [u8]) {
        debug_assert!(self.covers(offset, buf.len()));
        let start = offset as usize;
        let src = match &self.map {
            MapInner::Ro(m) => &m[start..start + buf.len()],
            MapInner::Rw(m) => &m[start..start + buf.len()],
        };
        buf.copy_from_slice(src);
    }

    /// Copy into the window; the caller has checked [`covers`] and holds a
    /// writable map.
    ///
    /// [`covers`]: MmapWindow::covers
    pub fn write(&mut self, offset: u64, buf: &[u8]) -> bool {
        debug_assert!(self.covers(offset, buf.len()));
        let start = offset as usize;
        match &mut self.map {
            MapInner::Ro(_) => false,
            MapInner::Rw(m) => {
                m[start..start + buf.len()].copy_from_slice(buf);
                true
            }
        }
    }

    /// msync the window so following fsync covers only metadata.
    pub fn flush(&self) -> Result<()> {
        if let MapInner::Rw(m) = &self.map {
            m.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_file(len: usize) -> (tempfile::TempDir, File) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("window.db");
        let mut f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        f.write_all(&vec![0u8; len]).unwrap();
        (dir, f)
    }

    #[test]
    fn window_is_capped_by_max_size() {
        let (_dir, file) = scratch_file(8192);
        let window = MmapWindow::map(&file, 8192, 4096, false).unwrap();
        assert_eq!(window.len(), 4096);
        assert!(window.covers(0, 4096));
        assert!(!window.covers(1, 4096));
    }

    #[test]
    fn empty_file_yields_no_window() {
        let (_dir, file) = scratch_file(0);
        assert!(MmapWindow::map(&file, 0, 4096, false).is_none());
    }

    #[test]
    fn write_then_read_roundtrips() {
        let (_dir, file) = scratch_file(4096);
        let mut window = MmapWindow::map(&file, 4096, usize::MAX, true).unwrap();

        assert!(window.write(100, b"payload"));
        let mut buf = [0u8; 7];
        window.read(100, &mut buf);
        assert_eq!(&buf, b"payload");
        window.flush().unwrap();
    }

    #[test]
    fn read_only_window_refuses_writes() {
        let (_dir, file) = scratch_file(4096);
        let mut window = MmapWindow::map(&file, 4096, usize::MAX, false).unwrap();
        assert!(!window.write(0, b"x"));
    }
}
