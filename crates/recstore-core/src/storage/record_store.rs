//! Generic fixed-size record store over a mapped file

use crate::storage::id_generator::IdGenerator;
use crate::storage::mapped::MappedFile;
use crate::storage::record::Record;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Store of `R` records addressed by id (`offset = id * R::SIZE`)
pub struct RecordStore<R: Record> {
    file: RwLock<MappedFile>,
    ids: IdGenerator,
    path: PathBuf,
    _marker: PhantomData<R>,
}

impl<R: Record> RecordStore<R> {
    /// Open or create the store file and rebuild its id generator from a scan
    pub fn open<P: AsRef<Path>>(path: P, initial_size: usize, reuse_ids: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let initial_size = initial_size.max(R::SIZE);
        let file = MappedFile::open(&path, initial_size)?;
        let store = Self {
            file: RwLock::new(file),
            ids: IdGenerator::new(0, reuse_ids),
            path,
            _marker: PhantomData,
        };
        store.rebuild_ids()?;
        Ok(store)
    }

    /// Number of record slots backed by the file
    pub fn capacity(&self) -> u64 {
        (self.file.read().len() / R::SIZE) as u64
    }

    fn offset(id: u64) -> Result<usize> {
        usize::try_from(id)
            .ok()
            .and_then(|id| id.checked_mul(R::SIZE))
            .ok_or_else(|| Error::storage(format!("{} record id {} out of range", R::KIND, id)))
    }

    /// Read a record; slots beyond the end of the file read as unused
    pub fn read(&self, id: u64) -> Result<R> {
        let offset = Self::offset(id)?;
        let file = self.file.read();
        if offset.saturating_add(R::SIZE) > file.len() {
            return Ok(R::default());
        }
        let slice = file.get_slice(offset, R::SIZE)?;
        Ok(bytemuck::pod_read_unaligned::<R>(slice))
    }

    /// Read a record only if its slot is in use
    pub fn read_in_use(&self, id: u64) -> Result<Option<R>> {
        let record = self.read(id)?;
        Ok(record.in_use().then_some(record))
    }

    /// Write a record, growing the file if necessary.
    ///
    /// The id generator is left alone: ids come from [`Self::ids`] for local
    /// transactions, and the high-id applier covers ids written by external or
    /// recovered transactions.
    pub fn write(&self, id: u64, record: &R) -> Result<()> {
        let offset = Self::offset(id)?;
        let required = offset
            .checked_add(R::SIZE)
            .ok_or_else(|| Error::storage(format!("{} record id {} out of range", R::KIND, id)))?;

        let mut file = self.file.write();
        file.ensure_capacity(required)?;
        let slice = file.get_slice_mut(offset, R::SIZE)?;
        slice.copy_from_slice(bytemuck::bytes_of(record));
        Ok(())
    }

    /// Id generator of this store
    pub fn ids(&self) -> &IdGenerator {
        &self.ids
    }

    /// Lowest id never handed out
    pub fn high_id(&self) -> u64 {
        self.ids.high_id()
    }

    /// Scan the file and reset the id generator: high id is one past the last
    /// in-use record, unused slots below it are free.
    pub fn rebuild_ids(&self) -> Result<()> {
        let capacity = self.capacity();
        let mut high = 0;
        let mut free = Vec::new();
        for id in 0..capacity {
            if self.read(id)?.in_use() {
                for unused in high..id {
                    free.push(unused);
                }
                high = id + 1;
            }
        }
        self.ids.rebuild(high, free);
        tracing::debug!(
            "Rebuilt {} ids for {:?}: high_id={}",
            R::KIND,
            self.path,
            high
        );
        Ok(())
    }

    /// Visit every in-use record below the high id
    pub fn for_each_in_use(&self, mut f: impl FnMut(u64, R) -> Result<()>) -> Result<()> {
        let high = self.high_id().min(self.capacity());
        for id in 0..high {
            let record = self.read(id)?;
            if record.in_use() {
                f(id, record)?;
            }
        }
        Ok(())
    }

    /// Count in-use records
    pub fn count_in_use(&self) -> Result<u64> {
        let mut count = 0;
        self.for_each_in_use(|_, _| {
            count += 1;
            Ok(())
        })?;
        Ok(count)
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.file.read().flush()
    }

    /// Path of the store file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file size in bytes
    pub fn file_size(&self) -> usize {
        self.file.read().len()
    }
}

impl<R: Record> std::fmt::Debug for RecordStore<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("kind", &R::KIND)
            .field("path", &self.file.read().path())
            .field("high_id", &self.high_id())
            .finish()
    }
}
