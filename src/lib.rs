//! `blockfs`: a bounded, write-back buffer cache; an indexed inode layer
//! addressing files up to ~8.1 MiB through direct, indirect, and
//! doubly-indirect sector chains; and a hierarchical directory layer mapped
//! onto inode content — layered over a fixed-size-sector block device.
//!
//! This crate is the core of a user-level file system, not a complete
//! operating system: the scheduler, program loader, virtual-memory
//! subsystem, and system-call dispatcher that would embed it are out of
//! scope (see `SPEC_FULL.md`). What it provides is everything those layers
//! would call through: [`Fs`](fs::Fs) for path-based operations and
//! [`Session`](session::Session) for the per-caller descriptor table and
//! current-working-directory bookkeeping a process layer would otherwise
//! have to build itself.
//!
//! # Layout
//!
//! - [`device`] — the `BlockDevice` trait and its `MemoryDevice`/`FileDevice`
//!   implementations.
//! - [`layout`] — exact on-disk byte layouts: inode, index block, directory
//!   entry.
//! - [`cache`] — the bounded buffer cache, clock eviction, pin guards.
//! - [`freemap`] — the persistent free-sector bitmap.
//! - [`inode`] — the in-memory inode table, index-chain translation,
//!   extension, read/write.
//! - [`path`] — path tokenization and name validation.
//! - [`directory`] — directories as inode content, path resolution.
//! - [`fs`] — [`Fs`](fs::Fs), the assembled file system.
//! - [`session`] — [`Session`](session::Session), the per-caller descriptor
//!   table and cwd.
//! - [`error`] — the [`Error`](error::Error) enum every fallible operation
//!   returns.

pub mod cache;
pub mod device;
pub mod directory;
pub mod error;
pub mod freemap;
pub mod fs;
pub mod inode;
pub mod layout;
pub mod path;
pub mod session;

pub use device::{BlockDevice, FileDevice, MemoryDevice, SECTOR_SIZE};
pub use error::{Error, Result};
pub use fs::Fs;
pub use session::Session;
