//! Error kinds surfaced by the buffer cache, inode layer, directory layer,
//! and session-level syscall surface. See spec §7 for the kind table this
//! enum mirrors one-for-one.

use std::io;

/// Every fallible public operation in this crate returns `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Free-sector exhaustion: the free map could not satisfy a request for
    /// `n` contiguous clear bits.
    #[error("no space: free map has no {0} contiguous free sector(s)")]
    NoSpace(u32),

    /// A path component was not present in the directory it was looked up in.
    #[error("no such file or directory")]
    NotFound,

    /// An intermediate path component resolved to a file, not a directory.
    #[error("not a directory")]
    NotDir,

    /// `create`/`mkdir` target name is already present in its parent.
    #[error("file or directory already exists")]
    Exists,

    /// A directory-entry name exceeded `NAME_MAX` (14) characters.
    #[error("name exceeds {} characters", crate::layout::NAME_MAX)]
    NameTooLong,

    /// `remove` was asked to unlink a non-empty directory.
    #[error("directory not empty")]
    NotEmpty,

    /// `write_at` was attempted on an inode with `deny_write_count > 0`.
    #[error("write denied: file is open for execution")]
    WriteDenied,

    /// A descriptor did not map to an open file/directory, or was used for
    /// the wrong kind of operation (e.g. `readdir` on a file descriptor).
    #[error("bad file descriptor")]
    BadDescriptor,

    /// A caller-supplied argument was structurally invalid (empty path,
    /// path component too long, relative lookup from a removed cwd, ...).
    #[error("invalid argument")]
    Invalid,

    /// The underlying block device failed a read or write.
    #[error("device I/O error: {0}")]
    Device(#[from] io::Error),

    /// An on-disk inode's `magic` field did not match `INODE_MAGIC`.
    #[error("corrupt inode at sector {0}: bad magic")]
    CorruptInode(u32),
}
