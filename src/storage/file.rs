//! # File I/O Shim
//!
//! One interface over two access paths: descriptor `read_at`/`write_at`
//! and the windowed mmap of [`MmapWindow`](super::mmap::MmapWindow).
//! Reads and writes retry short transfers and interrupted syscalls until
//! the full request is served; a read that runs off the end of the file is
//! reported as [`Error::FileEof`], which the database layer treats as
//! fatal. File extension zero-fills through `set_len`, never by leaving a
//! sparse hole the allocator might trip over.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use super::mmap::MmapWindow;
use crate::error::{Error, Result};

/// The database file with its optional mmap window.
#[derive(Debug)]
pub struct DbFile {
    file: File,
    len: u64,
    writable: bool,
    mmap_enabled: bool,
    max_map_size: usize,
    window: Option<MmapWindow>,
}

impl DbFile {
    pub fn new(file: File, writable: bool, mmap_enabled: bool, max_map_size: usize) -> Result<Self> {
        let len = file.metadata()?.len();
        let mut this = Self {
            file,
            len,
            writable,
            mmap_enabled,
            max_map_size,
            window: None,
        };
        this.remap();
        Ok(this)
    }

    fn remap(&mut self) {
        self.window = if self.mmap_enabled {
            MmapWindow::map(&self.file, self.len, self.max_map_size, self.writable)
        } else {
            None
        };
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current mmap window length (0 when the window is disabled or
    /// unavailable).
    pub fn map_len(&self) -> usize {
        self.window.as_ref().map_or(0, MmapWindow::len)
    }

    /// Change the window cap and remap.
    pub fn set_max_map_size(&mut self, max_map_size: usize) {
        self.max_map_size = max_map_size;
        self.remap();
    }

    pub fn max_map_size(&self) -> usize {
        self.max_map_size
    }

    /// Read exactly `buf.len()` bytes at `offset`.
    pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if let Some(window) = &self.window {
            if window.covers(offset, buf.len()) {
                window.read(offset, buf);
                return Ok(());
            }
        }
        let mut done = 0;
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => return Err(Error::FileEof),
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    /// Write all of `buf` at `offset`, extending the file if the write
    /// lands past the current end.
    pub fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        debug_assert!(self.writable);
        let mut via_window = false;
        if let Some(window) = &mut self.window {
            if window.covers(offset, buf.len()) {
                via_window = window.write(offset, buf);
            }
        }
        if !via_window {
            let mut done = 0;
            while done < buf.len() {
                match self.file.write_at(&buf[done..], offset + done as u64) {
                    Ok(0) => {
                        return Err(Error::Io(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write returned zero bytes",
                        )))
                    }
                    Ok(n) => done += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(Error::Io(e)),
                }
            }
        }
        self.len = self.len.max(offset + buf.len() as u64);
        Ok(())
    }

    /// Zero-extend the file to at least `len` bytes and grow the window
    /// over the new tail.
    pub fn extend_to(&mut self, len: u64) -> Result<()> {
        if len <= self.len {
            return Ok(());
        }
        self.file.set_len(len)?;
        self.len = len;
        self.remap();
        Ok(())
    }

    /// Flush the window and the file to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        if let Some(window) = &self.window {
            window.flush()?;
        }
        self.file.sync_all()?;
        Ok(())
    }
}
