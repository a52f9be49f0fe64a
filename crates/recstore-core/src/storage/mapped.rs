//! Memory-mapped store file with doubling growth

use crate::{Error, Result};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// A store file mapped read-write into memory.
///
/// Callers wrap it in a lock; reads take `&self`, writes and growth `&mut self`.
pub(crate) struct MappedFile {
    file: File,
    mmap: MmapMut,
    path: PathBuf,
    current_size: usize,
}

impl MappedFile {
    /// Create or open a memory-mapped file
    pub(crate) fn open<P: AsRef<Path>>(path: P, initial_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let existing = file.metadata()?.len() as usize;
        let current_size = if existing == 0 {
            file.set_len(initial_size as u64)?;
            initial_size
        } else {
            existing
        };

        let mmap = unsafe { MmapOptions::new().len(current_size).map_mut(&file)? };

        Ok(Self {
            file,
            mmap,
            path,
            current_size,
        })
    }

    /// Grow so that `required` bytes fit, doubling the current size at least
    pub(crate) fn ensure_capacity(&mut self, required: usize) -> Result<()> {
        if required <= self.current_size {
            return Ok(());
        }
        let new_size = (self.current_size * 2).max(required);
        self.mmap.flush()?;
        self.file.set_len(new_size as u64)?;
        // The old mapping is released when replaced.
        self.mmap = unsafe { MmapOptions::new().len(new_size).map_mut(&self.file)? };
        self.current_size = new_size;
        tracing::debug!("Grew store file {:?} to {} bytes", self.path, new_size);
        Ok(())
    }

    /// Get slice at offset
    pub(crate) fn get_slice(&self, offset: usize, size: usize) -> Result<&[u8]> {
        let end = offset
            .checked_add(size)
            .ok_or_else(|| Error::storage(format!("Offset overflow: offset={}", offset)))?;
        if end > self.current_size {
            return Err(Error::storage(format!(
                "Read beyond file size: offset={}, size={}, file_size={}",
                offset, size, self.current_size
            )));
        }
        Ok(&self.mmap[offset..end])
    }

    /// Get mutable slice at offset
    pub(crate) fn get_slice_mut(&mut self, offset: usize, size: usize) -> Result<&mut [u8]> {
        let end = offset
            .checked_add(size)
            .ok_or_else(|| Error::storage(format!("Offset overflow: offset={}", offset)))?;
        if end > self.current_size {
            return Err(Error::storage(format!(
                "Write beyond file size: offset={}, size={}, file_size={}",
                offset, size, self.current_size
            )));
        }
        Ok(&mut self.mmap[offset..end])
    }

    /// Flush to disk
    pub(crate) fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.current_size
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}
