//! Memory-mapped append-only sample logs ("signal files").
//!
//! Each profiled process owns two of these, one for allocation/free samples
//! and one for copy samples. A signal file is a plain text file in `/tmp`,
//! mapped shared and writable, that the in-process runtime appends records
//! to and an out-of-process supervisor reads after each sampling signal.
//!
//! Every record ends in two line feeds, but the append offset advances by
//! one byte less than the record length: the second line feed is a rolling
//! end-of-stream marker that the next append overwrites. A reader that
//! splits the file at single line feeds and drops the trailing empty
//! partial record therefore sees only complete records, no matter when it
//! looks.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::ptr;

use log::debug;
use memmap2::{MmapRaw, RemapOptions};

use crate::tunables::{INITIAL_SIGNAL_FILE_SIZE, SIGNAL_FILE_LOW_WATER};

/// One append-only, memory-mapped sample log.
///
/// Appends never rewrite published bytes: once a record lands at offset `k`,
/// the region `[0, k)` is immutable. When the headroom between the append
/// offset and the end of the mapping falls under
/// [`SIGNAL_FILE_LOW_WATER`], the backing file is doubled and remapped in
/// place (the mapping may move; no pointers into it are retained between
/// appends).
pub struct SignalFile {
    file: File,
    map: MmapRaw,
    offset: usize,
    path: PathBuf,
}

impl SignalFile {
    /// Create (or truncate) the log at `path`, sized
    /// [`INITIAL_SIGNAL_FILE_SIZE`] and readable only by the owner.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<SignalFile> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;
        file.set_len(INITIAL_SIGNAL_FILE_SIZE)?;
        let map = MmapRaw::map_raw(&file)?;
        Ok(SignalFile {
            file,
            map,
            offset: 0,
            path,
        })
    }

    /// Append one record, growing the file first if headroom is low.
    ///
    /// `record` must carry the two trailing line feeds; the offset advances
    /// past all but the last of them.
    pub fn append(&mut self, record: &[u8]) -> io::Result<()> {
        debug_assert!(record.ends_with(b"\n\n"));

        if self.remaining() < record.len() + SIGNAL_FILE_LOW_WATER {
            self.grow(record.len() + SIGNAL_FILE_LOW_WATER)?;
        }
        if self.remaining() < record.len() {
            // Growth is sized to preempt this; reaching it is a bug.
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "record exceeds the mapped signal file",
            ));
        }

        // SAFETY: `offset + record.len()` is within the mapping (checked
        // above) and `&mut self` excludes concurrent writers.
        unsafe {
            ptr::copy_nonoverlapping(
                record.as_ptr(),
                self.map.as_mut_ptr().add(self.offset),
                record.len(),
            );
        }
        self.offset += record.len() - 1;
        Ok(())
    }

    fn remaining(&self) -> usize {
        self.map.len() - self.offset
    }

    /// Double the backing file until at least `needed` bytes of headroom
    /// exist past the append offset, then remap.
    fn grow(&mut self, needed: usize) -> io::Result<()> {
        let mut new_len = self.map.len().max(1);
        while new_len - self.offset < needed {
            new_len *= 2;
        }
        self.file.set_len(new_len as u64)?;
        // SAFETY: the mapping may move; nothing retains pointers into it
        // across appends.
        unsafe {
            self.map.remap(new_len, RemapOptions::new().may_move(true))?;
        }
        debug!(
            "signal file {} grown to {} bytes",
            self.path.display(),
            new_len
        );
        Ok(())
    }

    /// Byte offset the next record will be written at.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Current size of the mapping and of the backing file.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether any record has been appended yet.
    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unmap and delete the backing file.
    ///
    /// The file already being gone is not an error; anything else is.
    pub fn unlink(self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
