//! Per-caller session: a file-descriptor table plus a current-working-
//! directory handle, exposing the §4.5 syscall surface this crate is
//! responsible for. Descriptors 0/1 are reserved by the embedding process
//! layer for console I/O (spec §6) and are never handed out here; the table
//! starts numbering at 2.
//!
//! Grounded on the teacher's `file.rs` (`File`/`RcFile`, an arena-allocated,
//! reference-counted file-table entry wrapping an inode plus a read/write
//! cursor) and `proc.rs`'s per-process `ofile` array of descriptor slots.
//! Narrowed to just the bookkeeping spec §4.5 says the process layer owns —
//! this crate does not model an OS process, only the table and cwd handle
//! one would hold.

use std::collections::HashMap;

use crate::device::BlockDevice;
use crate::directory::DirHandle;
use crate::error::{Error, Result};
use crate::fs::Fs;
use crate::inode::InodeHandle;
use crate::layout::InodeType;

/// Lowest descriptor number this crate will ever assign. `0`/`1` are the
/// caller's to use for console I/O and are never seen here.
pub const FIRST_FD: i32 = 2;

enum Descriptor<D: BlockDevice> {
    File {
        inode: InodeHandle<D>,
        pos: u64,
        /// Set when this descriptor was opened against the session's own
        /// running binary (an embedding process layer tells us this at
        /// `open` time); write-denied for as long as the descriptor stays
        /// open, per spec §4.5.
        write_denied: bool,
    },
    Dir(DirHandle<D>),
}

/// One caller's open-file-descriptor table and current working directory.
/// An embedding process layer holds one `Session` per OS process; this
/// crate does not schedule or load processes, only tracks this bookkeeping.
pub struct Session<D: BlockDevice> {
    cwd: DirHandle<D>,
    /// Sticky flag set when `cwd` (or an ancestor reached only through it)
    /// has been `remove`d out from under this session: subsequent relative
    /// lookups fail rather than silently resolving through a vanished name
    /// (spec §4.4's "dir_removed" flag).
    cwd_removed: bool,
    descriptors: HashMap<i32, Descriptor<D>>,
    next_fd: i32,
}

impl<D: BlockDevice + 'static> Session<D> {
    /// A fresh session rooted at `fs`'s root directory.
    pub fn new(fs: &Fs<D>) -> Result<Self> {
        Ok(Self {
            cwd: fs.root()?,
            cwd_removed: false,
            descriptors: HashMap::new(),
            next_fd: FIRST_FD,
        })
    }

    fn alloc_fd(&mut self) -> i32 {
        let fd = self.next_fd;
        self.next_fd += 1;
        fd
    }

    /// Fails if this session's current directory has been removed and the
    /// caller is trying to resolve a relative (non-`/`-rooted) path through
    /// it (spec §4.4's `open_path`).
    fn check_relative(&self, path: &str) -> Result<()> {
        if self.cwd_removed && !path.starts_with('/') {
            return Err(Error::Invalid);
        }
        Ok(())
    }

    pub fn create(&self, fs: &Fs<D>, path: &str, size: u64) -> Result<()> {
        self.check_relative(path)?;
        fs.create(&self.cwd, path, size)
    }

    pub fn remove(&mut self, fs: &Fs<D>, path: &str) -> Result<()> {
        self.check_relative(path)?;
        let removing_cwd = fs.open_dir(&self.cwd, path).ok().map(|d| {
            let s = d.sector();
            d.close();
            s
        }) == Some(self.cwd.sector());
        fs.remove(&self.cwd, path)?;
        if removing_cwd {
            self.cwd_removed = true;
        }
        Ok(())
    }

    /// Opens `path` as a file or directory, returning the new descriptor
    /// number. `deny_write_if_own_binary` lets an embedding process layer
    /// ask this session to apply a write-deny on the underlying inode, per
    /// spec §4.5's "open on an executable that is the current process's own
    /// binary applies a write-deny".
    pub fn open(&mut self, fs: &Fs<D>, path: &str, deny_write_if_own_binary: bool) -> Result<i32> {
        self.check_relative(path)?;
        if let Ok(dir) = fs.open_dir(&self.cwd, path) {
            let fd = self.alloc_fd();
            self.descriptors.insert(fd, Descriptor::Dir(dir));
            return Ok(fd);
        }
        let inode = fs.open_file(&self.cwd, path)?;
        if inode.kind()? != InodeType::File {
            inode.close();
            return Err(Error::Invalid);
        }
        if deny_write_if_own_binary {
            inode.deny_write();
        }
        let fd = self.alloc_fd();
        self.descriptors.insert(
            fd,
            Descriptor::File {
                inode,
                pos: 0,
                write_denied: deny_write_if_own_binary,
            },
        );
        Ok(fd)
    }

    fn file(&self, fd: i32) -> Result<(&InodeHandle<D>, u64)> {
        match self.descriptors.get(&fd) {
            Some(Descriptor::File { inode, pos, .. }) => Ok((inode, *pos)),
            _ => Err(Error::BadDescriptor),
        }
    }

    pub fn filesize(&self, fd: i32) -> Result<u64> {
        self.file(fd)?.0.length()
    }

    pub fn read(&mut self, fd: i32, buf: &mut [u8]) -> Result<usize> {
        let (inode, pos) = match self.descriptors.get(&fd) {
            Some(Descriptor::File { inode, pos, .. }) => (inode, *pos),
            _ => return Err(Error::BadDescriptor),
        };
        let n = inode.read_at(pos, buf)?;
        if let Some(Descriptor::File { pos, .. }) = self.descriptors.get_mut(&fd) {
            *pos += n as u64;
        }
        Ok(n)
    }

    pub fn write(&mut self, fd: i32, buf: &[u8]) -> Result<usize> {
        let (inode, pos) = match self.descriptors.get(&fd) {
            Some(Descriptor::File { inode, pos, .. }) => (inode, *pos),
            _ => return Err(Error::BadDescriptor),
        };
        let n = inode.write_at(pos, buf)?;
        if let Some(Descriptor::File { pos, .. }) = self.descriptors.get_mut(&fd) {
            *pos += n as u64;
        }
        Ok(n)
    }

    pub fn seek(&mut self, fd: i32, new_pos: u64) -> Result<()> {
        match self.descriptors.get_mut(&fd) {
            Some(Descriptor::File { pos, .. }) => {
                *pos = new_pos;
                Ok(())
            }
            _ => Err(Error::BadDescriptor),
        }
    }

    pub fn tell(&self, fd: i32) -> Result<u64> {
        Ok(self.file(fd)?.1)
    }

    /// Closes `fd`, releasing the underlying handle. Freeing a removed
    /// inode's sectors (if this was the last handle) happens automatically
    /// via `InodeHandle`'s `Drop`.
    pub fn close(&mut self, fd: i32) -> Result<()> {
        match self.descriptors.remove(&fd) {
            Some(Descriptor::File { inode, write_denied, .. }) => {
                if write_denied {
                    inode.allow_write();
                }
                inode.close();
                Ok(())
            }
            Some(Descriptor::Dir(dir)) => {
                dir.close();
                Ok(())
            }
            None => Err(Error::BadDescriptor),
        }
    }

    pub fn mkdir(&self, fs: &Fs<D>, path: &str) -> Result<()> {
        self.check_relative(path)?;
        fs.mkdir(&self.cwd, path)
    }

    /// Changes this session's current directory to `path`. Clears the
    /// `dir_removed` sticky flag: the new cwd is, by construction, live.
    pub fn chdir(&mut self, fs: &Fs<D>, path: &str) -> Result<()> {
        self.check_relative(path)?;
        let new_cwd = fs.open_dir(&self.cwd, path)?;
        let old_cwd = std::mem::replace(&mut self.cwd, new_cwd);
        old_cwd.close();
        self.cwd_removed = false;
        Ok(())
    }

    /// Reads the next entry name from a directory descriptor, or `Ok(None)`
    /// at end-of-directory.
    pub fn readdir(&self, fd: i32) -> Result<Option<String>> {
        match self.descriptors.get(&fd) {
            Some(Descriptor::Dir(dir)) => dir.readdir(),
            _ => Err(Error::BadDescriptor),
        }
    }

    pub fn isdir(&self, fd: i32) -> Result<bool> {
        match self.descriptors.get(&fd) {
            Some(Descriptor::Dir(_)) => Ok(true),
            Some(Descriptor::File { .. }) => Ok(false),
            None => Err(Error::BadDescriptor),
        }
    }

    /// The underlying inode's sector number — stable across opens/closes,
    /// usable as a cheap "same file" identity check (spec scenario 2).
    pub fn inumber(&self, fd: i32) -> Result<u32> {
        match self.descriptors.get(&fd) {
            Some(Descriptor::File { inode, .. }) => Ok(inode.sector()),
            Some(Descriptor::Dir(dir)) => Ok(dir.sector()),
            None => Err(Error::BadDescriptor),
        }
    }

    /// Closes every still-open descriptor. Called on process teardown (spec
    /// §4.5); descriptors already closed individually are simply absent.
    pub fn close_all(&mut self) {
        let fds: Vec<i32> = self.descriptors.keys().copied().collect();
        for fd in fds {
            let _ = self.close(fd);
        }
    }
}

impl<D: BlockDevice> Drop for Session<D> {
    fn drop(&mut self) {
        // `close_all` needs `&mut self` and runs on explicit teardown, but a
        // session dropped without it must still not leak held handles: walk
        // the table here too, same as `close_all`, just without the `Fs`
        // argument neither path actually needs.
        for (_, descriptor) in self.descriptors.drain() {
            match descriptor {
                Descriptor::File { inode, write_denied, .. } => {
                    if write_denied {
                        inode.allow_write();
                    }
                    inode.close();
                }
                Descriptor::Dir(dir) => dir.close(),
            }
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
    fn end_to_end_scenario_one() {
        let fs = fresh(512);
        let mut session = Session::new(&fs).unwrap();
        session.create(&fs, "/a", 0).unwrap();
        let fd = session.open(&fs, "/a", false).unwrap();
        assert_eq!(fd, FIRST_FD);
        assert_eq!(session.write(fd, b"hello").unwrap(), 5);
        session.seek(fd, 0).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(session.read(fd, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(session.tell(fd).unwrap(), 5);
        assert_eq!(session.filesize(fd).unwrap(), 5);
        session.close(fd).unwrap();
    }

    #[test]
    fn end_to_end_scenario_two() {
        let fs = fresh(512);
        let mut session = Session::new(&fs).unwrap();
        session.mkdir(&fs, "/d").unwrap();
        session.create(&fs, "/d/x", 10).unwrap();
        session.chdir(&fs, "/d").unwrap();
        let via_relative = session.open(&fs, "x", false).unwrap();
        let via_absolute = session.open(&fs, "/d/x", false).unwrap();
        assert_eq!(session.inumber(via_relative).unwrap(), session.inumber(via_absolute).unwrap());
        session.close(via_relative).unwrap();
        session.close(via_absolute).unwrap();

        assert!(matches!(session.remove(&fs, "/d"), Err(Error::NotEmpty)));
        session.remove(&fs, "/d/x").unwrap();
        session.remove(&fs, "/d").unwrap();
    }

    #[test]
    fn end_to_end_scenario_five() {
        let fs = fresh(512);
        let mut session = Session::new(&fs).unwrap();
        session.create(&fs, "/a", 0).unwrap();
        let fd = session.open(&fs, "/a", false).unwrap();
        session.remove(&fs, "/a").unwrap();
        assert_eq!(session.write(fd, b"x").unwrap(), 1);
        session.close(fd).unwrap();
        assert!(matches!(session.open(&fs, "/a", false), Err(Error::NotFound)));
    }

    #[test]
    fn open_on_own_binary_denies_writes() {
        let fs = fresh(512);
        let mut session = Session::new(&fs).unwrap();
        session.create(&fs, "/bin", 4).unwrap();
        let fd = session.open(&fs, "/bin", true).unwrap();
        assert!(matches!(session.write(fd, b"x"), Err(Error::WriteDenied)));
        session.close(fd).unwrap();
        let fd2 = session.open(&fs, "/bin", false).unwrap();
        assert!(session.write(fd2, b"x").is_ok());
        session.close(fd2).unwrap();
    }

    #[test]
    fn removing_cwd_blocks_relative_resolution() {
        let fs = fresh(512);
        let mut session = Session::new(&fs).unwrap();
        session.mkdir(&fs, "/d").unwrap();
        session.chdir(&fs, "/d").unwrap();
        session.remove(&fs, "/d").unwrap();
        assert!(matches!(session.create(&fs, "x", 0), Err(Error::Invalid)));
        // Absolute paths are unaffected.
        session.create(&fs, "/y", 0).unwrap();
    }

    #[test]
    fn close_all_releases_every_descriptor() {
        let fs = fresh(512);
        let mut session = Session::new(&fs).unwrap();
        session.create(&fs, "/a", 0).unwrap();
        session.create(&fs, "/b", 0).unwrap();
        let fd_a = session.open(&fs, "/a", false).unwrap();
        let fd_b = session.open(&fs, "/b", false).unwrap();
        session.close_all();
        assert!(matches!(session.read(fd_a, &mut [0u8; 1]), Err(Error::BadDescriptor)));
        assert!(matches!(session.tell(fd_b), Err(Error::BadDescriptor)));
    }
}
