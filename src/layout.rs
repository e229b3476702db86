//! On-disk layout: the inode struct, index-block struct, and directory-entry
//! struct, laid out byte-for-byte as spec §3/§6 require so that an image
//! written by one implementation is readable by another.
//!
//! Mirrors the teacher's `fs/inode.rs` `Dinode` (there, xv6's 12-direct +
//! 1-indirect layout); here widened to Pintos's 123-direct + indirect +
//! doubly-indirect layout. As in the teacher's `exec.rs`/`vm.rs`, on-disk
//! structs derive `zerocopy`'s `FromBytes`/`AsBytes` so a cache entry's raw
//! sector buffer can be reinterpreted in place instead of copied into a
//! separate heap allocation.

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

use crate::device::SECTOR_SIZE;

/// Number of direct block pointers held inline in an inode.
pub const DIRECT_COUNT: usize = 123;
/// Number of sector indices held in one index block (indirect or
/// doubly-indirect leaf).
pub const INDEX_ENTRIES: usize = 128;
/// Constant verifying on-disk inode structure; mismatch on load is fatal.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Largest offset (exclusive) addressable through the direct+indirect+
/// doubly-indirect chain: `(123 + 128 + 128*128) * 512`.
pub const MAX_FILE_SIZE: u64 =
    (DIRECT_COUNT + INDEX_ENTRIES + INDEX_ENTRIES * INDEX_ENTRIES) as u64 * SECTOR_SIZE as u64;

/// Maximum visible characters in a directory-entry name (the on-disk field
/// is one byte longer to hold the NUL terminator).
pub const NAME_MAX: usize = 14;

/// Fixed on-disk stride of one directory entry, per spec §3/§6.
pub const DIR_ENTRY_SIZE: usize = 22;

/// `ceil(a / b)`, shared by the cache's chain walker and the inode layer's
/// sector-count math.
pub(crate) fn ceil_div(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum InodeType {
    File = 0,
    Dir = 1,
}

impl InodeType {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(InodeType::File),
            1 => Some(InodeType::Dir),
            _ => None,
        }
    }
}

/// The on-disk inode: one full sector, exact byte layout per spec §3.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, AsBytes)]
pub struct OnDiskInode {
    pub length: u32,
    kind: u32,
    pub direct: [u32; DIRECT_COUNT],
    pub indirect: u32,
    pub doubly_indirect: u32,
    pub magic: u32,
}

const_assert_eq!(core::mem::size_of::<OnDiskInode>(), SECTOR_SIZE);

impl OnDiskInode {
    /// A freshly zeroed inode of the given type, ready to be committed to a
    /// sector. `length` starts at zero; callers extend it afterward.
    pub fn new(kind: InodeType) -> Self {
        Self {
            length: 0,
            kind: kind as u32,
            direct: [0; DIRECT_COUNT],
            indirect: 0,
            doubly_indirect: 0,
            magic: INODE_MAGIC,
        }
    }

    pub fn kind(&self) -> InodeType {
        InodeType::from_raw(self.kind).expect("on-disk inode type already validated by magic check")
    }

    /// Borrows `sector` (exactly [`SECTOR_SIZE`] bytes) as an `OnDiskInode`
    /// in place. Returns `None` if the magic does not match — callers
    /// translate that into [`crate::error::Error::CorruptInode`].
    pub fn view(sector: &[u8; SECTOR_SIZE]) -> Option<&OnDiskInode> {
        let (layout, _): (LayoutVerified<&[u8], OnDiskInode>, _) =
            LayoutVerified::new_from_prefix(&sector[..])?;
        let inode = layout.into_ref();
        (inode.magic == INODE_MAGIC).then(|| inode)
    }

    /// Mutably borrows `sector` as an `OnDiskInode` in place, without
    /// checking `magic` (used right after `new` is written into a fresh
    /// sector, and by callers that have already validated it via `view`).
    pub fn view_mut(sector: &mut [u8; SECTOR_SIZE]) -> &mut OnDiskInode {
        let (layout, _): (LayoutVerified<&mut [u8], OnDiskInode>, _) =
            LayoutVerified::new_from_prefix(&mut sector[..]).expect("sector is exactly one inode wide");
        layout.into_mut()
    }
}

/// An index block: 128 sector indices, no other fields, used for both the
/// single- and doubly-indirect levels.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, AsBytes)]
pub struct IndexBlock {
    pub entries: [u32; INDEX_ENTRIES],
}

const_assert_eq!(core::mem::size_of::<IndexBlock>(), SECTOR_SIZE);

impl IndexBlock {
    pub const fn zeroed() -> Self {
        Self {
            entries: [0; INDEX_ENTRIES],
        }
    }

    pub fn view(sector: &[u8; SECTOR_SIZE]) -> &IndexBlock {
        let (layout, _): (LayoutVerified<&[u8], IndexBlock>, _) =
            LayoutVerified::new_from_prefix(&sector[..]).expect("sector is exactly one index block wide");
        layout.into_ref()
    }

    pub fn view_mut(sector: &mut [u8; SECTOR_SIZE]) -> &mut IndexBlock {
        let (layout, _): (LayoutVerified<&mut [u8], IndexBlock>, _) =
            LayoutVerified::new_from_prefix(&mut sector[..]).expect("sector is exactly one index block wide");
        layout.into_mut()
    }
}

/// One packed directory entry. 22 bytes: 4-byte inode sector, a
/// NUL-terminated 15-byte name, a 1-byte `in_use` flag, and 2 reserved
/// padding bytes out to the specified stride (spec §3/§6).
#[repr(C)]
#[derive(Clone, Copy, FromBytes, AsBytes)]
pub struct DirEntryRaw {
    pub inode_sector: u32,
    name: [u8; NAME_MAX + 1],
    in_use: u8,
    _reserved: [u8; 2],
}

const_assert_eq!(core::mem::size_of::<DirEntryRaw>(), DIR_ENTRY_SIZE);

impl DirEntryRaw {
    pub const EMPTY: DirEntryRaw = DirEntryRaw {
        inode_sector: 0,
        name: [0; NAME_MAX + 1],
        in_use: 0,
        _reserved: [0; 2],
    };

    pub fn new(inode_sector: u32, name: &str) -> Self {
        debug_assert!(name.len() <= NAME_MAX);
        let mut raw = [0u8; NAME_MAX + 1];
        raw[..name.len()].copy_from_slice(name.as_bytes());
        Self {
            inode_sector,
            name: raw,
            in_use: 1,
            _reserved: [0; 2],
        }
    }

    pub fn in_use(&self) -> bool {
        self.in_use != 0
    }

    pub fn clear(&mut self) {
        self.in_use = 0;
    }

    /// The entry's name, stopping at the first NUL.
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..len]).expect("directory names are validated ASCII on write")
    }

    pub fn view(bytes: &[u8; DIR_ENTRY_SIZE]) -> &DirEntryRaw {
        let (layout, _): (LayoutVerified<&[u8], DirEntryRaw>, _) =
            LayoutVerified::new_from_prefix(&bytes[..]).expect("buffer is exactly one entry wide");
        layout.into_ref()
    }
}
