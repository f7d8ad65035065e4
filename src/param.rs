//! Fixed capacities and on-disk tunables.
//!
//! These mirror the teacher's `param.rs`: spec-mandated constants live
//! here as `pub const`s rather than runtime configuration, since they
//! are baked into the on-disk format and the concurrency design (bucket
//! count, pool sizes, indirect fan-out).

/// Size of one disk block, in bytes.
pub const BSIZE: usize = 1024;

/// Size of the in-memory buffer pool.
pub const NBUF: usize = 30;

/// Number of hash buckets the buffer cache is partitioned into. Prime,
/// per spec §4.1.
pub const NBUCKET: usize = 13;

/// Maximum number of simultaneously cached in-memory inodes.
pub const NINODE: usize = 50;

/// Direct block pointers per inode.
pub const NDIRECT: usize = 11;

/// Pointers per indirect block (BSIZE / size_of::<u32>()).
pub const NINDIRECT: usize = BSIZE / core::mem::size_of::<u32>();

/// Total addrs[] slots in an inode: direct + single-indirect + double-indirect.
pub const NADDRS: usize = NDIRECT + 2;

/// Largest file size, in blocks.
pub const MAXFILE: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;

/// Max data blocks in the on-disk log.
pub const LOGSIZE: usize = 30;

/// Max # of distinct blocks any single FS syscall writes.
pub const MAXOPBLOCKS: usize = 10;

/// Max length of a directory entry's name.
pub const DIRSIZ: usize = 14;

/// Inode number of the root directory.
pub const ROOTINO: u32 = 1;

/// Device number of the root file system.
pub const ROOTDEV: u32 = 1;

/// Symlink resolution depth limit.
pub const MAX_SYMLINK_DEPTH: u32 = 10;

/// Per-process open file limit (bookkeeping only; this crate does not
/// own a process table, see `SPEC_FULL.md`).
pub const NOFILE: usize = 16;

/// Maximum device major number (bookkeeping only; this crate does not
/// own a device-switch table, only validates `T_DEVICE` majors against
/// this bound the way `sys_open` does).
pub const NDEV: usize = 10;

/// Maximum path name length, used to bound symlink target reads.
pub const MAXPATH: usize = 128;
