//! `Fs`: the mounted file system. Ties the buffer cache, free map, and inode
//! table together behind path-based operations, and owns the background
//! [`Flusher`].
//!
//! Grounded on the teacher's `fs/mod.rs` `FileSystem`/`fsinit`/`fs()`
//! singleton, despecialized from a kernel-wide `OnceCell` into an explicit
//! owned object per the REDESIGN FLAGS' "global mutable state → explicit
//! collaborator" guidance — every operation takes the caller's current
//! directory as an argument instead of consulting a process-table global.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::BufferCache;
use crate::device::BlockDevice;
use crate::directory::{self, DirHandle};
use crate::error::{Error, Result};
use crate::freemap::FreeMap;
use crate::inode::{InodeHandle, InodeTable};
use crate::layout::InodeType;
use crate::path::Path;

/// A pluggable background write-behind task. Spec §9's "background
/// write-behind task" source pattern becomes this capability: correctness
/// never depends on it running, only on a flush happening at shutdown, so
/// [`NoopFlusher`] is a fully correct (if slow-to-persist) choice.
pub trait Flusher<D: BlockDevice>: Send {
    fn spawn(&mut self, cache: Arc<BufferCache<D>>);
    fn join(&mut self);
}

/// Does nothing. Every dirty sector still reaches the device eventually,
/// via ordinary eviction or the final flush `Fs::drop` performs.
#[derive(Default)]
pub struct NoopFlusher;

impl<D: BlockDevice> Flusher<D> for NoopFlusher {
    fn spawn(&mut self, _cache: Arc<BufferCache<D>>) {}
    fn join(&mut self) {}
}

/// Flushes the whole cache on a fixed interval from a dedicated thread,
/// until `join` is called.
pub struct IntervalFlusher {
    interval: Duration,
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl IntervalFlusher {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }
}

impl<D: BlockDevice + 'static> Flusher<D> for IntervalFlusher {
    fn spawn(&mut self, cache: Arc<BufferCache<D>>) {
        let stop = Arc::clone(&self.stop);
        let interval = self.interval;
        self.handle = Some(std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                std::thread::sleep(interval);
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = cache.flush_all() {
                    log::error!("flusher: periodic flush failed: {e}");
                }
            }
        }));
    }

    fn join(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub struct Fs<D: BlockDevice> {
    cache: Arc<BufferCache<D>>,
    freemap: Arc<FreeMap<D>>,
    inodes: Arc<InodeTable<D>>,
    flusher: Box<dyn Flusher<D>>,
}

impl<D: BlockDevice + 'static> Fs<D> {
    /// Formats `device` from scratch: a fresh free map and an empty root
    /// directory. Destroys whatever was there before.
    pub fn format(device: D) -> Result<Self> {
        Self::format_with_flusher(device, Box::new(NoopFlusher))
    }

    pub fn format_with_flusher(device: D, flusher: Box<dyn Flusher<D>>) -> Result<Self> {
        let cache = Arc::new(BufferCache::new(device));
        let freemap = Arc::new(FreeMap::format(Arc::clone(&cache))?);
        let inodes = Arc::new(InodeTable::new(Arc::clone(&cache), Arc::clone(&freemap)));
        DirHandle::create_root(&inodes)?.close();
        log::info!("fs: formatted a fresh file system");
        Ok(Self::assemble(cache, freemap, inodes, flusher))
    }

    /// Mounts a device previously written by `format`.
    pub fn mount(device: D) -> Result<Self> {
        Self::mount_with_flusher(device, Box::new(NoopFlusher))
    }

    pub fn mount_with_flusher(device: D, flusher: Box<dyn Flusher<D>>) -> Result<Self> {
        let cache = Arc::new(BufferCache::new(device));
        let freemap = Arc::new(FreeMap::open(Arc::clone(&cache))?);
        let inodes = Arc::new(InodeTable::new(Arc::clone(&cache), Arc::clone(&freemap)));
        log::info!("fs: mounted an existing file system");
        Ok(Self::assemble(cache, freemap, inodes, flusher))
    }

    fn assemble(
        cache: Arc<BufferCache<D>>,
        freemap: Arc<FreeMap<D>>,
        inodes: Arc<InodeTable<D>>,
        mut flusher: Box<dyn Flusher<D>>,
    ) -> Self {
        flusher.spawn(Arc::clone(&cache));
        Self {
            cache,
            freemap,
            inodes,
            flusher,
        }
    }

    pub fn root(&self) -> Result<DirHandle<D>> {
        DirHandle::open_root(&self.inodes)
    }

    /// Number of sectors not currently allocated to any inode.
    pub fn free_sectors(&self) -> u32 {
        self.freemap.left()
    }

    /// Flushes every dirty cache entry to the device immediately.
    pub fn flush(&self) -> Result<()> {
        self.cache.flush_all().map_err(Error::from)
    }

    fn start_dir(&self, cwd: &DirHandle<D>, path: Path<'_>) -> Result<DirHandle<D>> {
        if path.is_absolute() {
            self.root()
        } else {
            Ok(cwd.reopen())
        }
    }

    /// Creates a new, empty-or-preallocated file at `path`, linked into its
    /// parent directory. `initial_size` bytes of data sectors are claimed
    /// contiguously up front (spec §9's asymmetry with `extend`, which
    /// allocates one sector at a time).
    pub fn create(&self, cwd: &DirHandle<D>, path: &str, initial_size: u64) -> Result<()> {
        let path = Path::new(path);
        let start = self.start_dir(cwd, path)?;
        let (parent, name) = directory::resolve_parent(&self.inodes, start, path)?;
        if name.is_dot() || name.is_dot_dot() {
            parent.close();
            return Err(Error::Invalid);
        }
        let inode = self.inodes.create(InodeType::File)?;
        let result = (|| -> Result<()> {
            inode.allocate_initial(initial_size)?;
            parent.add(name.as_str(), inode.sector())
        })();
        parent.close();
        if let Err(e) = result {
            // The inode was never linked into any directory; mark it
            // removed so closing it here frees its sectors immediately
            // instead of leaking an unreachable inode.
            inode.remove();
            inode.close();
            return Err(e);
        }
        inode.close();
        Ok(())
    }

    /// Creates a new, empty subdirectory at `path`.
    pub fn mkdir(&self, cwd: &DirHandle<D>, path: &str) -> Result<()> {
        let path = Path::new(path);
        let start = self.start_dir(cwd, path)?;
        let (parent, name) = directory::resolve_parent(&self.inodes, start, path)?;
        if name.is_dot() || name.is_dot_dot() {
            parent.close();
            return Err(Error::Invalid);
        }
        let sub = DirHandle::create(&self.inodes, parent.sector())?;
        let result = parent.add(name.as_str(), sub.sector());
        parent.close();
        if let Err(e) = result {
            sub.inode_handle().remove();
            sub.close();
            return Err(e);
        }
        sub.close();
        Ok(())
    }

    /// Unlinks `path`. Directories must be empty. The target's sectors are
    /// not necessarily freed immediately — only once its last open handle
    /// closes.
    pub fn remove(&self, cwd: &DirHandle<D>, path: &str) -> Result<()> {
        let path = Path::new(path);
        let start = self.start_dir(cwd, path)?;
        let (parent, name) = directory::resolve_parent(&self.inodes, start, path)?;
        let result = parent.remove(&self.inodes, name.as_str());
        parent.close();
        result.map(|_| ())
    }

    /// Resolves `path` to a file inode. Fails with [`Error::NotDir`]-free
    /// [`Error::NotFound`] style errors the same way a directory open would,
    /// but does not itself check the target isn't a directory — callers
    /// that need a file specifically (the `Session` layer) check `kind()`.
    pub fn open_file(&self, cwd: &DirHandle<D>, path: &str) -> Result<InodeHandle<D>> {
        let path = Path::new(path);
        let start = self.start_dir(cwd, path)?;
        let sector = directory::resolve(&self.inodes, start, path)?;
        self.inodes.open(sector)
    }

    pub fn open_dir(&self, cwd: &DirHandle<D>, path: &str) -> Result<DirHandle<D>> {
        let path = Path::new(path);
        let start = self.start_dir(cwd, path)?;
        let sector = directory::resolve(&self.inodes, start, path)?;
        DirHandle::open(&self.inodes, sector)
    }
}

impl<D: BlockDevice> Drop for Fs<D> {
    fn drop(&mut self) {
        self.flusher.join();
        if let Err(e) = self.cache.flush_all() {
            log::error!("fs: final flush on shutdown failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    fn fresh(sectors: u32) -> Fs<MemoryDevice> {
        Fs::format(MemoryDevice::new(sectors)).unwrap()
    }

    #[test]
    fn create_open_write_read_round_trip() {
        let fs = fresh(512);
        let root = fs.root().unwrap();
        fs.create(&root, "/a", 0).unwrap();
        let file = fs.open_file(&root, "/a").unwrap();
        file.write_at(0, b"hello").unwrap();
        let mut buf = [0u8; 5];
        file.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        file.close();
        root.close();
    }

    #[test]
    fn mkdir_then_remove_requires_empty() {
        let fs = fresh(512);
        let root = fs.root().unwrap();
        fs.mkdir(&root, "/d").unwrap();
        fs.create(&root, "/d/x", 10).unwrap();
        assert!(matches!(fs.remove(&root, "/d"), Err(Error::NotEmpty)));
        fs.remove(&root, "/d/x").unwrap();
        fs.remove(&root, "/d").unwrap();
        root.close();
    }

    #[test]
    fn relative_and_absolute_paths_agree() {
        let fs = fresh(512);
        let root = fs.root().unwrap();
        fs.mkdir(&root, "/a").unwrap();
        fs.create(&root, "/a/b", 0).unwrap();
        let cwd = fs.open_dir(&root, "/a").unwrap();
        let via_relative = fs.open_file(&cwd, "b").unwrap();
        let via_absolute = fs.open_file(&root, "/a/b").unwrap();
        assert_eq!(via_relative.sector(), via_absolute.sector());
        via_relative.close();
        via_absolute.close();
        cwd.close();
        root.close();
    }

    #[test]
    fn remove_then_reopen_by_path_fails_but_open_handle_still_works() {
        let fs = fresh(512);
        let root = fs.root().unwrap();
        fs.create(&root, "/a", 0).unwrap();
        let file = fs.open_file(&root, "/a").unwrap();
        fs.remove(&root, "/a").unwrap();
        file.write_at(0, b"x").unwrap();
        assert!(matches!(fs.open_file(&root, "/a"), Err(Error::NotFound)));
        file.close();
        root.close();
    }

    #[test]
    fn create_large_file_spans_indirect_chain() {
        let fs = fresh(4096);
        let root = fs.root().unwrap();
        let size = 123u64 * 512 + 1;
        fs.create(&root, "/big", size).unwrap();
        let file = fs.open_file(&root, "/big").unwrap();
        assert_eq!(file.length().unwrap(), size);
        let mut last_byte = [0xaau8; 1];
        file.write_at(size - 1, &[7]).unwrap();
        file.read_at(size - 1, &mut last_byte).unwrap();
        assert_eq!(last_byte[0], 7);
        file.close();
        root.close();
    }
}
