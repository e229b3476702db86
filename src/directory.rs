//! Directories, stored as an ordinary file's content: a packed array of
//! fixed-size [`layout::DirEntryRaw`] records, each mapping a name to an
//! inode sector. `.` and `..` are real entries written at creation time,
//! not special-cased by the path walker — only `add` refuses to let a
//! caller create an entry literally named `.`/`..`.
//!
//! Grounded on the teacher's directory handling embedded in `fs/inode.rs`'s
//! `dirlookup`/`dirlink`, and on `examples/original_source/src/filesys/directory.c`
//! for the Pintos-specific "removed directories stay open but refuse further
//! lookups" and "cannot remove a non-empty directory" behavior the teacher's
//! xv6-derived code doesn't model (xv6 permits unlinking non-empty
//! directories).

use std::sync::Mutex;

use zerocopy::AsBytes;

use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::freemap::ROOT_DIR_SECTOR;
use crate::inode::{InodeHandle, InodeTable};
use crate::layout::{self, InodeType, DIR_ENTRY_SIZE, NAME_MAX};
use crate::path::{self, Path};

const ENTRY_SIZE: u64 = DIR_ENTRY_SIZE as u64;

/// An open directory: an inode known to hold directory content, plus a
/// `readdir` cursor private to this handle (two callers iterating the same
/// directory concurrently each see every entry, independently).
pub struct DirHandle<D: BlockDevice> {
    inode: InodeHandle<D>,
    pos: Mutex<u64>,
}

impl<D: BlockDevice> DirHandle<D> {
    /// Creates a new, empty directory inode with `.` pointing at itself and
    /// `..` pointing at `parent_sector`.
    pub fn create(table: &InodeTable<D>, parent_sector: u32) -> Result<DirHandle<D>> {
        let inode = table.create(InodeType::Dir)?;
        let dir = DirHandle {
            inode,
            pos: Mutex::new(0),
        };
        dir.link_entry(".", dir.sector())?;
        dir.link_entry("..", parent_sector)?;
        Ok(dir)
    }

    /// Formats the root directory at the fixed [`ROOT_DIR_SECTOR`], called
    /// once by `Fs::format`. `..` points back at the root itself, since it
    /// has no parent. Unlike [`Self::create`], this does not allocate a
    /// sector from the free map: `ROOT_DIR_SECTOR` is reserved structurally
    /// (spec §3/§6) and already marked used by `FreeMap::format`, so the
    /// root inode is formatted in place via `InodeTable::create_at` instead
    /// of landing on whatever sector the first ordinary allocation returns.
    pub fn create_root(table: &InodeTable<D>) -> Result<DirHandle<D>> {
        let inode = table.create_at(ROOT_DIR_SECTOR, InodeType::Dir)?;
        let dir = DirHandle {
            inode,
            pos: Mutex::new(0),
        };
        dir.link_entry(".", dir.sector())?;
        dir.link_entry("..", dir.sector())?;
        Ok(dir)
    }

    pub fn open_root(table: &InodeTable<D>) -> Result<DirHandle<D>> {
        Self::open(table, ROOT_DIR_SECTOR)
    }

    pub fn open(table: &InodeTable<D>, sector: u32) -> Result<DirHandle<D>> {
        let inode = table.open(sector)?;
        if inode.kind()? != InodeType::Dir {
            return Err(Error::NotDir);
        }
        Ok(DirHandle {
            inode,
            pos: Mutex::new(0),
        })
    }

    /// A second, independent handle to the same directory inode. The new
    /// handle's `readdir` cursor starts fresh at the beginning.
    pub fn reopen(&self) -> DirHandle<D> {
        DirHandle {
            inode: self.inode.reopen(),
            pos: Mutex::new(0),
        }
    }

    pub fn close(self) {
        drop(self);
    }

    pub fn sector(&self) -> u32 {
        self.inode.sector()
    }

    pub fn inode_handle(&self) -> &InodeHandle<D> {
        &self.inode
    }

    fn entry_count(&self) -> Result<u64> {
        Ok(self.inode.length()? / ENTRY_SIZE)
    }

    fn read_entry(&self, index: u64) -> Result<layout::DirEntryRaw> {
        let mut bytes = [0u8; DIR_ENTRY_SIZE];
        self.inode.read_at(index * ENTRY_SIZE, &mut bytes)?;
        Ok(*layout::DirEntryRaw::view(&bytes))
    }

    fn write_entry(&self, index: u64, entry: &layout::DirEntryRaw) -> Result<()> {
        self.inode.write_at(index * ENTRY_SIZE, entry.as_bytes())?;
        Ok(())
    }

    fn find(&self, name: &str) -> Result<Option<(u64, layout::DirEntryRaw)>> {
        let count = self.entry_count()?;
        for i in 0..count {
            let entry = self.read_entry(i)?;
            if entry.in_use() && entry.name() == name {
                return Ok(Some((i, entry)));
            }
        }
        Ok(None)
    }

    /// Looks up `name` among this directory's entries, including `.`/`..`.
    pub fn lookup(&self, name: &str) -> Result<u32> {
        self.find(name)
            .map(|found| found.map(|(_, e)| e.inode_sector))?
            .ok_or(Error::NotFound)
    }

    /// Looks up and opens `name` in one step.
    pub fn get_inode(&self, table: &InodeTable<D>, name: &str) -> Result<InodeHandle<D>> {
        table.open(self.lookup(name)?)
    }

    /// Used only by `create`/`create_root` to write the initial `.`/`..`
    /// entries, which are allowed names `add` itself refuses.
    fn link_entry(&self, name: &str, inode_sector: u32) -> Result<()> {
        self.write_entry(self.entry_count()?, &layout::DirEntryRaw::new(inode_sector, name))
    }

    /// Adds a new entry mapping `name` to `inode_sector`. First-fit over any
    /// cleared slot before appending past the current end.
    pub fn add(&self, name: &str, inode_sector: u32) -> Result<()> {
        if name.is_empty() || name.len() > NAME_MAX {
            return Err(Error::NameTooLong);
        }
        if name == "." || name == ".." {
            return Err(Error::Invalid);
        }
        if self.find(name)?.is_some() {
            return Err(Error::Exists);
        }
        let count = self.entry_count()?;
        for i in 0..count {
            if !self.read_entry(i)?.in_use() {
                return self.write_entry(i, &layout::DirEntryRaw::new(inode_sector, name));
            }
        }
        self.write_entry(count, &layout::DirEntryRaw::new(inode_sector, name))
    }

    /// True if this directory holds no entries besides `.`/`..`.
    pub fn is_empty(&self) -> Result<bool> {
        let count = self.entry_count()?;
        for i in 0..count {
            let entry = self.read_entry(i)?;
            if entry.in_use() && entry.name() != "." && entry.name() != ".." {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Unlinks `name`. If it names a subdirectory, that directory must be
    /// empty first. The target inode is marked `remove`d (freed on its last
    /// close) but this call does not itself wait for that to happen.
    /// Returns the sector the entry pointed to.
    pub fn remove(&self, table: &InodeTable<D>, name: &str) -> Result<u32> {
        if name == "." || name == ".." {
            return Err(Error::Invalid);
        }
        let (index, entry) = self.find(name)?.ok_or(Error::NotFound)?;
        let target = table.open(entry.inode_sector)?;
        if target.kind()? == InodeType::Dir {
            let sub = DirHandle {
                inode: target.reopen(),
                pos: Mutex::new(0),
            };
            let empty = sub.is_empty()?;
            sub.close();
            if !empty {
                return Err(Error::NotEmpty);
            }
        }
        let mut cleared = entry;
        cleared.clear();
        self.write_entry(index, &cleared)?;
        target.remove();
        target.close();
        log::debug!("directory: unlinked {name:?} (inode sector {})", entry.inode_sector);
        Ok(entry.inode_sector)
    }

    /// Returns the next entry name after this handle's cursor, skipping
    /// `.`/`..`, or `None` once every entry has been visited.
    pub fn readdir(&self) -> Result<Option<String>> {
        let mut pos = self.pos.lock().unwrap();
        let count = self.entry_count()?;
        let mut i = *pos;
        while i < count {
            let entry = self.read_entry(i)?;
            i += 1;
            if entry.in_use() && entry.name() != "." && entry.name() != ".." {
                *pos = i;
                return Ok(Some(entry.name().to_string()));
            }
        }
        *pos = i;
        Ok(None)
    }
}

/// Walks every component of `path` starting from `start`, returning the
/// sector the full path resolves to. An empty path resolves to `start`
/// itself. Each intermediate directory is checked for the `removed` sticky
/// flag before it is used for a lookup, per spec §4.4/§9: a directory
/// removed out from under an open handle stops answering lookups rather
/// than silently serving stale entries.
pub fn resolve<D: BlockDevice>(
    table: &InodeTable<D>,
    start: DirHandle<D>,
    path: Path<'_>,
) -> Result<u32> {
    let components: Vec<path::FileName<'_>> = path.components().collect::<Result<_>>()?;
    let mut current = start;
    let mut sector = current.sector();
    for (i, name) in components.iter().enumerate() {
        if current.inode_handle().is_removed() {
            return Err(Error::NotFound);
        }
        sector = current.lookup(name.as_str())?;
        let is_last = i + 1 == components.len();
        if !is_last {
            let handle = table.open(sector)?;
            if handle.kind()? != InodeType::Dir {
                return Err(Error::NotDir);
            }
            current = DirHandle {
                inode: handle,
                pos: Mutex::new(0),
            };
        }
    }
    Ok(sector)
}

/// Like [`resolve`], but stops one component short: resolves every
/// component except the last, and returns the directory that last
/// component should be looked up, added to, or removed from, paired with
/// its (still-unvalidated-against-existing-entries) name. Used by
/// `create`/`mkdir`/`remove`.
pub fn resolve_parent<'a, D: BlockDevice>(
    table: &InodeTable<D>,
    start: DirHandle<D>,
    path: Path<'a>,
) -> Result<(DirHandle<D>, path::FileName<'a>)> {
    let (dir_path, name) = path.split_last().ok_or(Error::Invalid)?;
    let name = name?;
    let parent_sector = resolve(table, start, dir_path)?;
    let parent = DirHandle::open(table, parent_sector)?;
    if parent.inode_handle().is_removed() {
        return Err(Error::NotFound);
    }
    Ok((parent, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BufferCache;
    use crate::device::MemoryDevice;
    use crate::freemap::FreeMap;
    use std::sync::Arc;

    fn fresh() -> (Arc<InodeTable<MemoryDevice>>, DirHandle<MemoryDevice>) {
        let cache = Arc::new(BufferCache::new(MemoryDevice::new(512)));
        let freemap = Arc::new(FreeMap::format(Arc::clone(&cache)).unwrap());
        let table = Arc::new(InodeTable::new(cache, freemap));
        let root = DirHandle::create_root(&table).unwrap();
        (table, root)
    }

    #[test]
    fn fresh_root_has_dot_and_dot_dot() {
        let (_table, root) = fresh();
        assert_eq!(root.lookup(".").unwrap(), root.sector());
        assert_eq!(root.lookup("..").unwrap(), root.sector());
        assert!(root.is_empty().unwrap());
    }

    #[test]
    fn add_then_lookup() {
        let (table, root) = fresh();
        let file = table.create(InodeType::File).unwrap();
        root.add("hello.txt", file.sector()).unwrap();
        assert_eq!(root.lookup("hello.txt").unwrap(), file.sector());
        assert!(!root.is_empty().unwrap());
    }

    #[test]
    fn add_rejects_duplicate_and_dot_names() {
        let (table, root) = fresh();
        let file = table.create(InodeType::File).unwrap();
        root.add("a", file.sector()).unwrap();
        assert!(matches!(root.add("a", file.sector()), Err(Error::Exists)));
        assert!(matches!(root.add(".", file.sector()), Err(Error::Invalid)));
    }

    #[test]
    fn readdir_skips_dot_entries_and_terminates() {
        let (table, root) = fresh();
        let a = table.create(InodeType::File).unwrap();
        let b = table.create(InodeType::File).unwrap();
        root.add("a", a.sector()).unwrap();
        root.add("b", b.sector()).unwrap();
        let mut seen = vec![root.readdir().unwrap().unwrap(), root.readdir().unwrap().unwrap()];
        seen.sort();
        assert_eq!(seen, vec!["a".to_string(), "b".to_string()]);
        assert!(root.readdir().unwrap().is_none());
    }

    #[test]
    fn remove_requires_empty_subdirectory() {
        let (table, root) = fresh();
        let sub = DirHandle::create(&table, root.sector()).unwrap();
        root.add("sub", sub.sector()).unwrap();
        let inner = table.create(InodeType::File).unwrap();
        sub.add("inner.txt", inner.sector()).unwrap();
        sub.close();
        assert!(matches!(root.remove(&table, "sub"), Err(Error::NotEmpty)));
        let reopened = DirHandle::open(&table, root.lookup("sub").unwrap()).unwrap();
        reopened.remove(&table, "inner.txt").unwrap();
        reopened.close();
        root.remove(&table, "sub").unwrap();
        assert!(matches!(root.lookup("sub"), Err(Error::NotFound)));
    }

    #[test]
    fn resolve_walks_nested_paths() {
        let (table, root) = fresh();
        let sub = DirHandle::create(&table, root.sector()).unwrap();
        root.add("sub", sub.sector()).unwrap();
        let file = table.create(InodeType::File).unwrap();
        sub.add("leaf.txt", file.sector()).unwrap();
        sub.close();

        let found = resolve(&table, root.reopen(), Path::new("/sub/leaf.txt")).unwrap();
        assert_eq!(found, file.sector());
    }

    #[test]
    fn resolve_through_a_file_component_is_not_dir() {
        let (table, root) = fresh();
        let file = table.create(InodeType::File).unwrap();
        root.add("leaf", file.sector()).unwrap();
        let result = resolve(&table, root.reopen(), Path::new("/leaf/oops"));
        assert!(matches!(result, Err(Error::NotDir)));
    }

    #[test]
    fn resolve_parent_splits_final_component() {
        let (table, root) = fresh();
        let sub = DirHandle::create(&table, root.sector()).unwrap();
        root.add("sub", sub.sector()).unwrap();
        sub.close();

        let (parent, name) = resolve_parent(&table, root.reopen(), Path::new("/sub/leaf.txt")).unwrap();
        assert_eq!(parent.sector(), root.lookup("sub").unwrap());
        assert_eq!(name.as_str(), "leaf.txt");
    }
}
