//! Block/inode file system layered on the buffer cache and redo log
//! (spec §4.3). Five layers, same split as the teacher's `fs/ufs/mod.rs`:
//! blocks (this file), log (`crate::log`), inodes (`inode`), directories
//! (`inode`), and names (`path`).

pub mod dinode;
pub mod dirent;
mod inode;
mod ops;
mod path;
mod stat;
mod superblock;

pub use dinode::InodeType;
pub use inode::{Inode, InodeGuard};
pub use ops::{File, FileMode, OpenFlags};
pub use stat::Stat;
pub use superblock::Superblock;

use std::sync::Arc;

use num_iter::range_step;

use crate::bcache::{BufGuard, Bcache};
use crate::error::FsResult;
use crate::hal::BlockDevice;
use crate::log::Log;
use crate::param::ROOTINO;

use inode::Itable;
use path::{namei, nameiparent};
use superblock::bpb;

/// The mounted file-system state shared by every live [`Inode`]/[`File`]
/// handle. Never constructed directly; obtain one through
/// [`FileSystem::mount`].
pub(crate) struct FsInner<D> {
    pub(crate) bcache: Arc<Bcache<D>>,
    pub(crate) log: Log<D>,
    pub(crate) sb: Superblock,
    pub(crate) itable: Itable,
    pub(crate) dev: u32,
}

/// A mounted file system. Cheap to clone; clones share the same
/// underlying buffer cache, log, and inode table.
pub struct FileSystem<D> {
    pub(crate) inner: Arc<FsInner<D>>,
}

impl<D> Clone for FileSystem<D> {
    /// Only the `Arc` is cloned, so `D` itself need not be `Clone`
    /// (matching [`Inode`]'s own hand-written `Clone` impl below, for
    /// the same reason: `#[derive(Clone)]` would wrongly add a `D:
    /// Clone` bound that nothing here actually needs).
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<D: BlockDevice> FileSystem<D> {
    /// Mounts device `dev`, reading the superblock from block 1 and
    /// running log recovery (spec §4.2 "Recovery (at mount)").
    pub fn mount(device: Arc<D>, dev: u32) -> Self {
        let bcache = Arc::new(Bcache::new(device));
        let sb = {
            let buf = bcache.read(dev, 1);
            Superblock::decode(&buf.data()[..])
        };
        let log = Log::new(bcache.clone(), dev, sb.logstart, sb.nlog);
        let inner = Arc::new(FsInner {
            bcache,
            log,
            sb,
            itable: Itable::new(),
            dev,
        });
        Self { inner }
    }

    pub fn superblock(&self) -> &Superblock {
        &self.inner.sb
    }

    /// Returns a handle to the root directory (`ROOTINO`).
    pub fn root(&self) -> Inode<D> {
        inode::iget(&self.inner, self.inner.dev, ROOTINO)
    }

    pub fn begin_tx(&self) -> Tx<D> {
        begin_tx(&self.inner)
    }

    /// Resolves `path` to the inode it names (spec §4.3 `namei`).
    pub fn namei(&self, cwd: &Inode<D>, path: &str) -> FsResult<Inode<D>> {
        namei(&self.inner, path, cwd)
    }

    /// Resolves all but the last component of `path` (spec §4.3 `nameiparent`).
    pub fn nameiparent(&self, cwd: &Inode<D>, path: &str) -> FsResult<(Inode<D>, String)> {
        nameiparent(&self.inner, path, cwd)
    }

    /// `create(path, type, major, minor)` (spec §4.3 "Create").
    pub fn create(&self, cwd: &Inode<D>, path: &str, typ: InodeType, major: u16, minor: u16) -> FsResult<Inode<D>> {
        let _tx = self.begin_tx();
        ops::create(&self.inner, cwd, path, typ, major, minor)
    }

    /// `mkdir` (spec §6 syscall surface; spec §4.3 "Create" via type `T_DIR`).
    pub fn mkdir(&self, cwd: &Inode<D>, path: &str) -> FsResult<()> {
        let _tx = self.begin_tx();
        ops::create(&self.inner, cwd, path, InodeType::Dir, 0, 0).map(|_| ())
    }

    /// `mknod(path, major, minor)` (spec §6 syscall surface).
    pub fn mknod(&self, cwd: &Inode<D>, path: &str, major: u16, minor: u16) -> FsResult<()> {
        let _tx = self.begin_tx();
        ops::create(&self.inner, cwd, path, InodeType::Device, major, minor).map(|_| ())
    }

    /// `link(old, new)` (spec §4.3 "Hard links").
    pub fn link(&self, cwd: &Inode<D>, old: &str, new: &str) -> FsResult<()> {
        let _tx = self.begin_tx();
        ops::link(&self.inner, cwd, old, new)
    }

    /// `unlink(path)` (spec §4.3 "Unlink").
    pub fn unlink(&self, cwd: &Inode<D>, path: &str) -> FsResult<()> {
        let _tx = self.begin_tx();
        ops::unlink(&self.inner, cwd, path)
    }

    /// `symlink(target, path)` (spec §4.3 "Symbolic links").
    pub fn symlink(&self, cwd: &Inode<D>, target: &str, path: &str) -> FsResult<()> {
        let _tx = self.begin_tx();
        ops::symlink(&self.inner, cwd, target, path)
    }

    /// `open(path, mode)` (spec §4.3 "Open"). Symlink resolution happens
    /// within the same transaction as the rest of `open`, per spec §9's
    /// note that nesting `namei`'s own `iput`s inside `open`'s bracket
    /// is the intended (if fragile) behavior rather than a bug to route
    /// around.
    pub fn open(&self, cwd: &Inode<D>, path: &str, flags: OpenFlags) -> FsResult<File<D>> {
        let _tx = self.begin_tx();
        ops::open(&self.inner, cwd, path, flags)
    }
}

/// An open transaction bracket (spec §4.2: `log.begin`/`log.end`).
/// Every FS-mutating syscall-level operation runs inside one (spec §5
/// rule 4). Commits when dropped, unless the bracket is the last of a
/// nested group, matching `log.end`'s "last outstanding op" rule.
pub struct Tx<D> {
    fs: Arc<FsInner<D>>,
}

thread_local! {
    /// Addresses (`Arc::as_ptr`) of the `FsInner`s this thread currently
    /// holds an open [`Tx`] against, one entry per live bracket. Lets
    /// code that runs inside a `Drop` impl (`Inode::drop`'s `iput`, which
    /// may need to free blocks) tell "my own caller already opened a
    /// transaction on this fs" apart from "some other thread happens to
    /// have one open" — only the former is safe to piggyback on, since
    /// `Log::begin` blocks on a condvar that only the matching `Log::end`
    /// wakes, and a thread stuck in a second, nested `begin()` can never
    /// be the one to reach its own outer `end()`.
    static OPEN_TX: std::cell::RefCell<Vec<usize>> = std::cell::RefCell::new(Vec::new());
}

fn fs_addr<D>(fs: &Arc<FsInner<D>>) -> usize {
    Arc::as_ptr(fs) as *const () as usize
}

/// Whether this thread already holds an open [`Tx`] against `fs`.
pub(crate) fn tx_open_on_this_thread<D>(fs: &Arc<FsInner<D>>) -> bool {
    let addr = fs_addr(fs);
    OPEN_TX.with(|stack| stack.borrow().contains(&addr))
}

impl<D: BlockDevice> Drop for Tx<D> {
    fn drop(&mut self) {
        OPEN_TX.with(|stack| {
            let mut stack = stack.borrow_mut();
            let addr = fs_addr(&self.fs);
            if let Some(pos) = stack.iter().rposition(|&a| a == addr) {
                stack.remove(pos);
            }
        });
        self.fs.log.end();
    }
}

/// Admits a new op against `fs`'s log, for use by code (like
/// [`ops::File::write`]) that holds an `Arc<FsInner<D>>` rather than a
/// [`FileSystem`] handle.
pub(crate) fn begin_tx<D: BlockDevice>(fs: &Arc<FsInner<D>>) -> Tx<D> {
    fs.log.begin();
    OPEN_TX.with(|stack| stack.borrow_mut().push(fs_addr(fs)));
    Tx { fs: fs.clone() }
}

impl<D: BlockDevice> FsInner<D> {
    /// Registers `buf` with the log (spec: "FS primitives ... register
    /// them with LOG via `log_write`"). Must be called inside a `Tx`.
    pub(crate) fn log_write(&self, buf: &BufGuard<'_, D>) {
        self.log.write(buf.bno);
    }

    fn bzero(&self, bno: u32) {
        let mut bp = self.bcache.read(self.dev, bno);
        bp.data_mut().fill(0);
        bp.mark_valid();
        self.log_write(&bp);
    }

    /// Allocates a zeroed data block, or `None` if the device is full
    /// (spec §4.3 "Block allocator").
    pub(crate) fn balloc(&self) -> Option<u32> {
        for base in range_step(0u32, self.sb.size, bpb()) {
            let mut bp = self.bcache.read(self.dev, self.sb.bblock(base));
            let lim = core::cmp::min(bpb(), self.sb.size - base);
            for bi in 0..lim {
                let byte = (bi / 8) as usize;
                let mask = 1u8 << (bi % 8);
                if bp.data()[byte] & mask == 0 {
                    bp.data_mut()[byte] |= mask;
                    self.log_write(&bp);
                    drop(bp);
                    self.bzero(base + bi);
                    return Some(base + bi);
                }
            }
        }
        None
    }

    /// Clears the bitmap bit for `bno`. Fatal if it was already clear
    /// (spec §4.3 "Block allocator": "fatal if already clear").
    pub(crate) fn bfree(&self, bno: u32) {
        let mut bp = self.bcache.read(self.dev, self.sb.bblock(bno));
        let bi = bno % bpb();
        let byte = (bi / 8) as usize;
        let mask = 1u8 << (bi % 8);
        assert!(bp.data()[byte] & mask != 0, "bfree: block {bno} already free");
        bp.data_mut()[byte] &= !mask;
        self.log_write(&bp);
    }
}
