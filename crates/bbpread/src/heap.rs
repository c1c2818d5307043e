//! Heap descriptors and the heap loader.
//!
//! A heap is a contiguous byte region backing a column's primary storage or
//! its variable-width auxiliary storage. Until first use a heap only knows
//! its on-disk name and bounds; materialization picks between an owned
//! buffer filled with `read(2)` and a memory map, based on the size
//! threshold for the column's persistence class. This loader never writes
//! and never extends a file: a data file shorter than its descriptor is a
//! hard failure.

use std::io::Read;
use std::rc::Rc;

use bbpread_core::MemStats;
use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::bat::BatId;
use crate::error::{Error, Result};
use crate::farm::FarmDir;

/// Largest single `read(2)` request.
const IO_CHUNK: usize = 1 << 30;

/// Granularity the mmap length check rounds to.
pub const MMAP_PAGESIZE: u64 = 4096;

/// Thresholds steering the loader's storage decisions.
///
/// Everything in a committed catalog is persistent, so the persistent
/// threshold is the one that matters; the transient value applies only to
/// descriptors an embedding caller marks transient itself.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Heaps at least this large are memory-mapped (persistent class).
    pub mmap_minsize_persistent: u64,
    /// Same, for transient descriptors.
    pub mmap_minsize_transient: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            mmap_minsize_persistent: 1 << 18,
            mmap_minsize_transient: 1 << 20,
        }
    }
}

impl LoaderConfig {
    pub fn with_mmap_minsize_persistent(mut self, bytes: u64) -> Self {
        self.mmap_minsize_persistent = bytes;
        self
    }

    pub fn with_mmap_minsize_transient(mut self, bytes: u64) -> Self {
        self.mmap_minsize_transient = bytes;
        self
    }
}

/// How a heap's bytes live in the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Owned memory, filled by `read(2)`.
    Mem,
    /// Shared read-only mapping.
    Mmap,
    /// Private copy-on-write mapping.
    Priv,
}

impl StorageMode {
    /// Decode the persisted storage enum.
    pub fn from_disk(v: u16) -> Option<StorageMode> {
        match v {
            0 => Some(StorageMode::Mem),
            1 => Some(StorageMode::Mmap),
            2 => Some(StorageMode::Priv),
            _ => None,
        }
    }
}

/// An owned heap buffer that keeps the allocation counter honest.
pub struct TrackedBuf {
    buf: Vec<u8>,
    stats: Rc<MemStats>,
}

impl TrackedBuf {
    fn zeroed(size: usize, stats: &Rc<MemStats>) -> TrackedBuf {
        stats.note_alloc(size as u64);
        TrackedBuf {
            buf: vec![0u8; size],
            stats: Rc::clone(stats),
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

impl Drop for TrackedBuf {
    fn drop(&mut self) {
        self.stats.note_free(self.buf.len() as u64);
    }
}

impl core::fmt::Debug for TrackedBuf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TrackedBuf")
            .field("len", &self.buf.len())
            .finish()
    }
}

/// A mapping that keeps the VM counter honest.
pub struct TrackedMap {
    map: Mmap,
    stats: Rc<MemStats>,
}

impl TrackedMap {
    fn new(map: Mmap, stats: &Rc<MemStats>) -> TrackedMap {
        stats.note_map(map.len() as u64);
        TrackedMap {
            map,
            stats: Rc::clone(stats),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }
}

impl Drop for TrackedMap {
    fn drop(&mut self) {
        self.stats.note_unmap(self.map.len() as u64);
    }
}

impl core::fmt::Debug for TrackedMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TrackedMap")
            .field("len", &self.map.len())
            .finish()
    }
}

/// A private copy-on-write mapping.
pub struct TrackedMapPriv {
    map: MmapMut,
    stats: Rc<MemStats>,
}

impl TrackedMapPriv {
    fn new(map: MmapMut, stats: &Rc<MemStats>) -> TrackedMapPriv {
        stats.note_map(map.len() as u64);
        TrackedMapPriv {
            map,
            stats: Rc::clone(stats),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }
}

impl Drop for TrackedMapPriv {
    fn drop(&mut self) {
        self.stats.note_unmap(self.map.len() as u64);
    }
}

impl core::fmt::Debug for TrackedMapPriv {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TrackedMapPriv")
            .field("len", &self.map.len())
            .finish()
    }
}

#[derive(Debug)]
pub(crate) enum HeapData {
    /// Not yet materialized.
    Unloaded,
    Owned(TrackedBuf),
    Mapped(TrackedMap),
    MappedPriv(TrackedMapPriv),
    /// A window into the owning parent's corresponding heap, starting at
    /// `offset`. Resolved through the buffer pool at access time.
    View { offset: u64 },
}

/// A contiguous byte region backing one column heap.
#[derive(Debug)]
pub struct Heap {
    /// End of the data actually stored.
    pub free: u64,
    /// Allocated capacity on disk.
    pub size: u64,
    /// On-disk name stem; the extension is supplied at load time.
    pub filename: String,
    /// Storage mode recorded in the catalog.
    pub storage: StorageMode,
    /// Storage mode the loader chose; meaningful once loaded.
    pub newstorage: StorageMode,
    pub copied: bool,
    /// String heaps only: each string is preceded by its hash.
    pub hashash: bool,
    /// String heaps only: the hash prefix must be verified on load.
    pub cleanhash: bool,
    /// Owning column. Differs from the embedding column's id when this
    /// heap is a window into (or shared with) another column's heap.
    pub parent: BatId,
    data: HeapData,
}

impl Heap {
    pub fn new(
        filename: String,
        free: u64,
        size: u64,
        storage: StorageMode,
        parent: BatId,
    ) -> Heap {
        Heap {
            free,
            size,
            filename,
            storage,
            newstorage: storage,
            copied: false,
            hashash: false,
            cleanhash: false,
            parent,
            data: HeapData::Unloaded,
        }
    }

    /// A heap whose bytes are a window into `parent`'s heap.
    pub fn new_view(filename: String, free: u64, parent: BatId, offset: u64) -> Heap {
        Heap {
            free,
            size: free,
            filename,
            storage: StorageMode::Mem,
            newstorage: StorageMode::Mem,
            copied: false,
            hashash: false,
            cleanhash: false,
            parent,
            data: HeapData::View { offset },
        }
    }

    pub(crate) fn data(&self) -> &HeapData {
        &self.data
    }

    /// The loaded bytes, `[0, free)`. `None` until loaded, and for views
    /// (whose bytes live in the parent).
    pub fn bytes(&self) -> Option<&[u8]> {
        let all = match &self.data {
            HeapData::Owned(b) => b.as_slice(),
            HeapData::Mapped(m) => m.as_slice(),
            HeapData::MappedPriv(m) => m.as_slice(),
            HeapData::Unloaded | HeapData::View { .. } => return None,
        };
        Some(&all[..self.free as usize])
    }

    /// Byte offset into the parent heap, for view heaps.
    pub fn view_offset(&self) -> Option<u64> {
        match self.data {
            HeapData::View { offset } => Some(offset),
            _ => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        !matches!(self.data, HeapData::Unloaded)
    }

    /// Materialize the heap from `<farm>/bat/<filename>.<ext>`.
    ///
    /// Below `mmap_minsize` the bytes are read into an owned buffer in
    /// chunks of at most 1 GiB; otherwise the file is mapped, read-only or
    /// copy-on-write depending on the persisted mode. Short files fail
    /// with the partial buffer released.
    pub fn load(
        &mut self,
        farm: &FarmDir,
        ext: &str,
        mmap_minsize: u64,
        stats: &Rc<MemStats>,
    ) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }
        debug_assert!(self.free <= self.size, "heap free beyond size");

        if self.free == 0 {
            // Nothing stored; some columns (void, fresh heaps) have no
            // file at all, so do not touch the filesystem.
            self.data = HeapData::Owned(TrackedBuf::zeroed(self.size as usize, stats));
            self.newstorage = StorageMode::Mem;
            return Ok(());
        }

        let path = farm.data_path(&self.filename, ext)?;
        let file = FarmDir::open_read(&path)?;

        if self.size < mmap_minsize {
            let mut buf = TrackedBuf::zeroed(self.size as usize, stats);
            let mut total = 0usize;
            let want = self.size as usize;
            let mut reader = file;
            while total < want {
                let chunk = (want - total).min(IO_CHUNK);
                let n = reader
                    .read(&mut buf.as_mut_slice()[total..total + chunk])
                    .map_err(|source| Error::Io {
                        path: path.clone(),
                        source,
                    })?;
                if n == 0 {
                    break;
                }
                total += n;
            }
            if (total as u64) < self.free {
                // `buf` drops here, releasing the partial allocation.
                return Err(Error::Truncated {
                    path,
                    needed: self.free,
                    found: total as u64,
                });
            }
            // The tail [free, size) stayed zeroed at allocation.
            log::debug!(
                target: "bbpread::heap",
                "{}: read {total}b into memory", path.display()
            );
            self.data = HeapData::Owned(buf);
            self.newstorage = StorageMode::Mem;
        } else {
            let len = file
                .metadata()
                .map_err(|source| Error::Io {
                    path: path.clone(),
                    source,
                })?
                .len();
            // Extending the file is a writer's job; a file more than one
            // page short of the heap means the database is damaged.
            let rounded = len.div_ceil(MMAP_PAGESIZE) * MMAP_PAGESIZE;
            if rounded < self.size || len < self.free {
                return Err(Error::Truncated {
                    path,
                    needed: self.size,
                    found: len,
                });
            }
            let map_err = |source: std::io::Error| Error::Io {
                path: path.clone(),
                source,
            };
            if self.storage == StorageMode::Priv {
                // Safety: the mapping is private; no write ever reaches
                // the file, and the loader is the only user of the farm.
                let map = unsafe { MmapOptions::new().map_copy(&file) }.map_err(map_err)?;
                self.data = HeapData::MappedPriv(TrackedMapPriv::new(map, stats));
                self.newstorage = StorageMode::Priv;
            } else {
                // Safety: the farm is quiescent while loaded; nothing
                // truncates the file under the mapping.
                let map = unsafe { MmapOptions::new().map(&file) }.map_err(map_err)?;
                self.data = HeapData::Mapped(TrackedMap::new(map, stats));
                self.newstorage = StorageMode::Mmap;
            }
            log::debug!(
                target: "bbpread::heap",
                "{}: mapped {len}b ({:?})", path.display(), self.newstorage
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::farm::TAIL_EXT;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn farm_with_tail(bytes: &[u8]) -> (tempfile::TempDir, FarmDir) {
        let dir = tempfile::tempdir().unwrap();
        let farm = FarmDir::new(dir.path());
        fs::create_dir_all(dir.path().join("bat")).unwrap();
        fs::write(dir.path().join("bat").join("01.tail"), bytes).unwrap();
        (dir, farm)
    }

    #[test]
    fn small_heap_is_read_into_memory() {
        let data: Vec<u8> = (0..100).collect();
        let (_dir, farm) = farm_with_tail(&data);
        let stats = MemStats::new();
        let mut heap = Heap::new("01".into(), 100, 128, StorageMode::Mem, BatId(1));
        heap.load(&farm, TAIL_EXT, 1 << 18, &stats).unwrap();
        assert_eq!(heap.newstorage, StorageMode::Mem);
        assert_eq!(heap.bytes().unwrap(), &data[..]);
        assert_eq!(stats.allocated(), 128);
        drop(heap);
        assert_eq!(stats.allocated(), 0);
    }

    #[test]
    fn large_heap_is_mapped() {
        let data: Vec<u8> = (0..200u32).flat_map(|v| v.to_le_bytes()).collect();
        let (_dir, farm) = farm_with_tail(&data);
        let stats = MemStats::new();
        let mut heap = Heap::new(
            "01".into(),
            data.len() as u64,
            data.len() as u64,
            StorageMode::Mmap,
            BatId(1),
        );
        // A threshold of 1 forces the mmap path.
        heap.load(&farm, TAIL_EXT, 1, &stats).unwrap();
        assert_eq!(heap.newstorage, StorageMode::Mmap);
        assert_eq!(heap.bytes().unwrap(), &data[..]);
        assert_eq!(stats.mapped(), data.len() as u64);
        drop(heap);
        assert_eq!(stats.mapped(), 0);
    }

    #[test]
    fn short_file_fails_and_frees() {
        let (_dir, farm) = farm_with_tail(&[1, 2, 3]);
        let stats = MemStats::new();
        let mut heap = Heap::new("01".into(), 100, 100, StorageMode::Mem, BatId(1));
        let err = heap.load(&farm, TAIL_EXT, 1 << 18, &stats).unwrap_err();
        assert!(matches!(err, Error::Truncated { needed: 100, found: 3, .. }));
        assert_eq!(stats.allocated(), 0);
        assert!(!heap.is_loaded());
    }

    #[test]
    fn mmap_never_extends_a_short_file() {
        let (_dir, farm) = farm_with_tail(&[0u8; 16]);
        let stats = MemStats::new();
        let mut heap = Heap::new("01".into(), 16, 8192, StorageMode::Mmap, BatId(1));
        let err = heap.load(&farm, TAIL_EXT, 1, &stats).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
        assert_eq!(stats.mapped(), 0);
    }

    #[test]
    fn empty_heap_needs_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let farm = FarmDir::new(dir.path());
        let stats = MemStats::new();
        let mut heap = Heap::new("09".into(), 0, 0, StorageMode::Mem, BatId(1));
        heap.load(&farm, TAIL_EXT, 1 << 18, &stats).unwrap();
        assert_eq!(heap.bytes().unwrap(), &[] as &[u8]);
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let farm = FarmDir::new(dir.path());
        let stats = MemStats::new();
        let mut heap = Heap::new("42".into(), 10, 10, StorageMode::Mem, BatId(1));
        assert!(matches!(
            heap.load(&farm, TAIL_EXT, 1 << 18, &stats),
            Err(Error::Io { .. })
        ));
    }
}
