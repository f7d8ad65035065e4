//! In-memory inode table, lock/load protocol, block map, truncate,
//! read/write, and directory operations (spec §4.3).
//!
//! Grounded on the teacher's `fs/ufs/inode.rs` for the iget/ilock/iput
//! state machine and on `original_source/kernel/fs.c` for `bmap`'s
//! direct/single-indirect/double-indirect split and `itrunc`, which
//! the teacher's own inode.rs does not implement (it only goes one
//! level of indirection).

use std::convert::TryInto;
use std::mem::size_of;
use std::sync::Arc;

use zerocopy::{AsBytes, FromBytes};

use super::dinode::{Dinode, InodeType, T_FREE};
use super::dirent::{namecmp, Dirent};
use super::superblock::ipb;
use super::FsInner;
use crate::error::{FsError, FsResult};
use crate::hal::BlockDevice;
use crate::lock::{Sleeplock, SleeplockGuard, Spinlock};
use crate::param::{BSIZE, MAXFILE, NADDRS, NDIRECT, NINDIRECT, NINODE};

const DIRENT_SIZE: usize = size_of::<Dirent>();

fn dinode_offset(inum: u32) -> usize {
    (inum as usize % ipb()) * size_of::<Dinode>()
}

/// Reads the `idx`-th little-endian `u32` pointer out of an indirect
/// block's payload (spec §6 "Little-endian field encoding").
fn read_ptr(data: &[u8; BSIZE], idx: usize) -> u32 {
    u32::from_le_bytes(data[idx * 4..idx * 4 + 4].try_into().unwrap())
}

fn write_ptr(data: &mut [u8; BSIZE], idx: usize, val: u32) {
    data[idx * 4..idx * 4 + 4].copy_from_slice(&val.to_le_bytes());
}

/// In-memory fields of one cached inode (spec §3 "Inode (in-memory)"),
/// minus `dev`/`inum`/`ref`, which live in the table's `Identity`
/// instead (spec §5: "the table spinlock is never held across ...
/// sleep-lock acquisition").
pub(crate) struct InodeData {
    pub(crate) valid: bool,
    pub(crate) typ: u16,
    pub(crate) major: u16,
    pub(crate) minor: u16,
    pub(crate) nlink: u16,
    pub(crate) size: u32,
    pub(crate) addrs: [u32; NADDRS],
}

impl InodeData {
    const fn empty() -> Self {
        Self {
            valid: false,
            typ: T_FREE,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; NADDRS],
        }
    }
}

struct Identity {
    dev: u32,
    inum: u32,
    refcnt: u32,
}

/// Fixed `NINODE`-entry in-memory inode table (spec §4.3 "In-memory
/// inode table"). `table` is the single spinlock protecting every
/// entry's identity/refcount; `data` holds the per-entry sleep-locked
/// fields, indexed the same way.
pub(crate) struct Itable {
    table: Spinlock<Vec<Identity>>,
    data: Vec<Sleeplock<InodeData>>,
}

impl Itable {
    pub(crate) fn new() -> Self {
        let table = (0..NINODE)
            .map(|_| Identity {
                dev: 0,
                inum: 0,
                refcnt: 0,
            })
            .collect();
        let data = (0..NINODE).map(|_| Sleeplock::new("inode", InodeData::empty())).collect();
        Self {
            table: Spinlock::new("itable", table),
            data,
        }
    }
}

/// A long-term, reference-counted handle to an in-memory inode slot
/// (spec §4.3 `iget`/`idup`/`iput`). Cheap to clone (bumps the table
/// refcount); dropping the last clone runs `iput`, freeing the inode's
/// blocks on disk if `nlink` has reached zero (spec invariant 5).
pub struct Inode<D> {
    pub(crate) fs: Arc<FsInner<D>>,
    idx: usize,
    pub dev: u32,
    pub inum: u32,
}

/// Finds or creates the table entry for `(dev, inum)` and returns a
/// referenced, unlocked handle (spec §4.3 `iget`: "does not lock the
/// inode or read its fields from disk").
pub(crate) fn iget<D>(fs: &Arc<FsInner<D>>, dev: u32, inum: u32) -> Inode<D> {
    let mut table = fs.itable.table.lock();
    let mut empty = None;
    for (i, id) in table.iter_mut().enumerate() {
        if id.refcnt > 0 && id.dev == dev && id.inum == inum {
            id.refcnt += 1;
            return Inode {
                fs: fs.clone(),
                idx: i,
                dev,
                inum,
            };
        }
        if empty.is_none() && id.refcnt == 0 {
            empty = Some(i);
        }
    }
    let idx = empty.expect("iget: no free inode table entries");
    table[idx] = Identity { dev, inum, refcnt: 1 };
    drop(table);
    // Nobody else can match this identity until we release the table
    // lock above, and we just did, so this sleep-lock acquisition is
    // uncontended.
    fs.itable.data[idx].lock().valid = false;
    Inode {
        fs: fs.clone(),
        idx,
        dev,
        inum,
    }
}

/// Allocates a free on-disk inode of type `typ` and returns a
/// referenced handle to it, or `None` if every inode is taken (spec
/// §4.3 "Inode allocator").
pub(crate) fn ialloc<D: BlockDevice>(fs: &Arc<FsInner<D>>, dev: u32, typ: InodeType) -> Option<Inode<D>> {
    for inum in 1..fs.sb.ninodes {
        let mut buf = fs.bcache.read(dev, fs.sb.iblock(inum));
        let off = dinode_offset(inum);
        let dip = Dinode::read_from(&buf.data()[off..off + size_of::<Dinode>()]).expect("ialloc: decode");
        if dip.typ == T_FREE {
            let fresh = Dinode {
                typ: typ.to_raw(),
                major: 0,
                minor: 0,
                nlink: 0,
                size: 0,
                addrs: [0; NADDRS],
            };
            fresh
                .write_to(&mut buf.data_mut()[off..off + size_of::<Dinode>()])
                .expect("ialloc: encode");
            fs.log_write(&buf);
            drop(buf);
            return Some(iget(fs, dev, inum));
        }
    }
    None
}

impl<D: BlockDevice> Inode<D> {
    /// Acquires the inode's sleep-lock, loading its fields from disk
    /// on first lock (spec §4.3 "Lock/load protocol: lock").
    pub fn lock(&self) -> InodeGuard<'_, D> {
        {
            let table = self.fs.itable.table.lock();
            assert!(table[self.idx].refcnt >= 1, "ilock: inode has no references");
        }
        let mut data = self.fs.itable.data[self.idx].lock();
        if !data.valid {
            let buf = self.fs.bcache.read(self.dev, self.fs.sb.iblock(self.inum));
            let off = dinode_offset(self.inum);
            let dip = Dinode::read_from(&buf.data()[off..off + size_of::<Dinode>()]).expect("ilock: decode");
            assert_ne!(dip.typ, T_FREE, "ilock: no type for inum {}", self.inum);
            data.typ = dip.typ;
            data.major = dip.major;
            data.minor = dip.minor;
            data.nlink = dip.nlink;
            data.size = dip.size;
            data.addrs = dip.addrs;
            data.valid = true;
        }
        InodeGuard { inode: self, data }
    }
}

impl<D> Clone for Inode<D> {
    /// `idup`: bumps the table refcount without touching the sleep-lock.
    fn clone(&self) -> Self {
        let mut table = self.fs.itable.table.lock();
        table[self.idx].refcnt += 1;
        drop(table);
        Inode {
            fs: self.fs.clone(),
            idx: self.idx,
            dev: self.dev,
            inum: self.inum,
        }
    }
}

impl<D: BlockDevice> Drop for Inode<D> {
    /// `iput`: decrements the table refcount; if this was the last
    /// reference to an unlinked (`nlink == 0`) inode, truncates and
    /// frees it on disk (spec §4.3 "`put`": "must be called inside a
    /// transaction because it may free blocks"). Every call site that
    /// can drop the last reference already runs inside a `Tx` bracket
    /// (`FileSystem::unlink`'s `_tx`, `open`'s symlink-following loop,
    /// ...), so the common case here is to reuse that ambient
    /// transaction rather than open a second one: `Log::begin`'s
    /// blocking admission path can only be woken by the matching
    /// `Log::end`, and that `end` belongs to the very thread that would
    /// be stuck in a nested `begin`. Only when nothing is open already
    /// (an `Inode` outliving its mount's transactions, e.g. dropped
    /// from a test with no bracket at all) does this open its own.
    fn drop(&mut self) {
        let mut table = self.fs.itable.table.lock();
        assert!(table[self.idx].refcnt > 0, "iput: ref already zero");
        let should_free = table[self.idx].refcnt == 1 && {
            let data = self.fs.itable.data[self.idx].lock();
            data.valid && data.nlink == 0
        };
        if should_free {
            drop(table);
            if super::tx_open_on_this_thread(&self.fs) {
                self.lock().free_on_disk();
            } else {
                self.fs.log.begin();
                self.lock().free_on_disk();
                self.fs.log.end();
            }
            table = self.fs.itable.table.lock();
        }
        table[self.idx].refcnt -= 1;
    }
}

/// A sleep-locked, loaded view of one inode's fields (spec §4.3
/// "Lock/load protocol"). Borrows the [`Inode`] it was taken from;
/// dropping it releases the sleep-lock (the Rust equivalent of
/// `iunlock` — there is no separate `unlockput` function here, since
/// dropping the guard and then the owning `Inode` handle in sequence
/// does exactly what `iunlockput` does in the original).
pub struct InodeGuard<'a, D> {
    inode: &'a Inode<D>,
    data: SleeplockGuard<'a, InodeData>,
}

impl<'a, D: BlockDevice> InodeGuard<'a, D> {
    pub fn dev(&self) -> u32 {
        self.inode.dev
    }

    pub fn inum(&self) -> u32 {
        self.inode.inum
    }

    pub fn itype(&self) -> InodeType {
        InodeType::from_raw(self.data.typ)
    }

    pub fn set_type(&mut self, typ: InodeType) {
        self.data.typ = typ.to_raw();
    }

    pub fn nlink(&self) -> u16 {
        self.data.nlink
    }

    pub fn set_nlink(&mut self, nlink: u16) {
        self.data.nlink = nlink;
    }

    pub fn size(&self) -> u32 {
        self.data.size
    }

    pub fn major(&self) -> u16 {
        self.data.major
    }

    pub fn minor(&self) -> u16 {
        self.data.minor
    }

    pub fn set_major_minor(&mut self, major: u16, minor: u16) {
        self.data.major = major;
        self.data.minor = minor;
    }

    /// Returns an owned, referenced handle to the same inode (`idup`
    /// while locked), e.g. to hand the caller of `create` a handle
    /// that outlives this guard.
    pub fn dup_inode(&self) -> Inode<D> {
        self.inode.clone()
    }

    /// `iupdate`: copies the in-memory fields back to their on-disk
    /// inode via the log.
    pub fn update(&self) {
        let mut buf = self.inode.fs.bcache.read(self.inode.dev, self.inode.fs.sb.iblock(self.inode.inum));
        let dip = Dinode {
            typ: self.data.typ,
            major: self.data.major,
            minor: self.data.minor,
            nlink: self.data.nlink,
            size: self.data.size,
            addrs: self.data.addrs,
        };
        let off = dinode_offset(self.inode.inum);
        dip.write_to(&mut buf.data_mut()[off..off + size_of::<Dinode>()])
            .expect("iupdate: encode");
        self.inode.fs.log_write(&buf);
    }

    /// Used only from [`Inode::drop`]: truncates, marks the disk
    /// inode free, and invalidates the in-memory copy.
    fn free_on_disk(&mut self) {
        self.itrunc();
        self.data.typ = T_FREE;
        self.update();
        self.data.valid = false;
    }

    /// `bmap`: physical block number of logical block `bn`, allocating
    /// direct/single-indirect/double-indirect blocks on demand (spec
    /// §4.3 "Block map `bmap`"). Returns `None` if a required
    /// allocation fails (device full).
    fn bmap(&mut self, bn: u32) -> Option<u32> {
        if (bn as usize) < NDIRECT {
            let i = bn as usize;
            if self.data.addrs[i] == 0 {
                self.data.addrs[i] = self.inode.fs.balloc()?;
            }
            return Some(self.data.addrs[i]);
        }
        let bn = bn - NDIRECT as u32;

        if (bn as usize) < NINDIRECT {
            if self.data.addrs[NDIRECT] == 0 {
                self.data.addrs[NDIRECT] = self.inode.fs.balloc()?;
            }
            let indirect = self.data.addrs[NDIRECT];
            let mut buf = self.inode.fs.bcache.read(self.inode.dev, indirect);
            let i = bn as usize;
            let mut addr = read_ptr(buf.data(), i);
            if addr == 0 {
                addr = self.inode.fs.balloc()?;
                write_ptr(buf.data_mut(), i, addr);
                self.inode.fs.log_write(&buf);
            }
            return Some(addr);
        }
        let bn = bn - NINDIRECT as u32;

        if (bn as usize) < NINDIRECT * NINDIRECT {
            if self.data.addrs[NDIRECT + 1] == 0 {
                self.data.addrs[NDIRECT + 1] = self.inode.fs.balloc()?;
            }
            let outer = self.data.addrs[NDIRECT + 1];
            let outer_idx = bn as usize / NINDIRECT;
            let inner_idx = bn as usize % NINDIRECT;

            let mut obuf = self.inode.fs.bcache.read(self.inode.dev, outer);
            let mut inner = read_ptr(obuf.data(), outer_idx);
            if inner == 0 {
                inner = self.inode.fs.balloc()?;
                write_ptr(obuf.data_mut(), outer_idx, inner);
                self.inode.fs.log_write(&obuf);
            }
            drop(obuf);

            let mut ibuf = self.inode.fs.bcache.read(self.inode.dev, inner);
            let mut addr = read_ptr(ibuf.data(), inner_idx);
            if addr == 0 {
                addr = self.inode.fs.balloc()?;
                write_ptr(ibuf.data_mut(), inner_idx, addr);
                self.inode.fs.log_write(&ibuf);
            }
            return Some(addr);
        }

        panic!("bmap: logical block {bn} out of range");
    }

    /// `itrunc`: frees every data block reachable from this inode
    /// (direct, single-indirect, double-indirect) and zeros `size`.
    pub fn itrunc(&mut self) {
        for i in 0..NDIRECT {
            if self.data.addrs[i] != 0 {
                self.inode.fs.bfree(self.data.addrs[i]);
                self.data.addrs[i] = 0;
            }
        }
        if self.data.addrs[NDIRECT] != 0 {
            let buf = self.inode.fs.bcache.read(self.inode.dev, self.data.addrs[NDIRECT]);
            for i in 0..NINDIRECT {
                let a = read_ptr(buf.data(), i);
                if a != 0 {
                    self.inode.fs.bfree(a);
                }
            }
            drop(buf);
            self.inode.fs.bfree(self.data.addrs[NDIRECT]);
            self.data.addrs[NDIRECT] = 0;
        }
        if self.data.addrs[NDIRECT + 1] != 0 {
            let obuf = self.inode.fs.bcache.read(self.inode.dev, self.data.addrs[NDIRECT + 1]);
            for i in 0..NINDIRECT {
                let inner = read_ptr(obuf.data(), i);
                if inner != 0 {
                    let ibuf = self.inode.fs.bcache.read(self.inode.dev, inner);
                    for j in 0..NINDIRECT {
                        let a = read_ptr(ibuf.data(), j);
                        if a != 0 {
                            self.inode.fs.bfree(a);
                        }
                    }
                    drop(ibuf);
                    self.inode.fs.bfree(inner);
                }
            }
            drop(obuf);
            self.inode.fs.bfree(self.data.addrs[NDIRECT + 1]);
            self.data.addrs[NDIRECT + 1] = 0;
        }
        self.data.size = 0;
        self.update();
    }

    /// `readi`: copies up to `buf.len()` bytes starting at `off` into
    /// `buf`, clamped to the file's size. Returns the number of bytes
    /// actually read; a hole or an out-of-space `bmap` truncates the
    /// read early (spec §4.3 "Read and write").
    pub fn readi(&mut self, off: u32, buf: &mut [u8]) -> usize {
        let size = self.data.size;
        if off > size {
            return 0;
        }
        let n = core::cmp::min(buf.len() as u32, size - off) as usize;
        let mut tot = 0usize;
        let mut off = off;
        while tot < n {
            let bn = off / BSIZE as u32;
            let addr = match self.bmap(bn) {
                Some(a) => a,
                None => break,
            };
            let bp = self.inode.fs.bcache.read(self.inode.dev, addr);
            let begin = (off % BSIZE as u32) as usize;
            let m = core::cmp::min(n - tot, BSIZE - begin);
            buf[tot..tot + m].copy_from_slice(&bp.data()[begin..begin + m]);
            tot += m;
            off += m as u32;
        }
        tot
    }

    /// `writei`: copies `buf` into the file starting at `off`,
    /// allocating blocks as needed and extending `size` if the write
    /// reaches past the old end. Refuses writes that would grow the
    /// file past `MAXFILE` blocks.
    pub fn writei(&mut self, off: u32, buf: &[u8]) -> FsResult<usize> {
        if off as usize > self.data.size as usize {
            return Err(FsError::InvalidArgument);
        }
        if off as usize + buf.len() > MAXFILE * BSIZE {
            return Err(FsError::FileTooLarge);
        }
        let mut tot = 0usize;
        let mut off = off;
        while tot < buf.len() {
            let bn = off / BSIZE as u32;
            let addr = match self.bmap(bn) {
                Some(a) => a,
                None => break,
            };
            let mut bp = self.inode.fs.bcache.read(self.inode.dev, addr);
            let begin = (off % BSIZE as u32) as usize;
            let m = core::cmp::min(buf.len() - tot, BSIZE - begin);
            bp.data_mut()[begin..begin + m].copy_from_slice(&buf[tot..tot + m]);
            self.inode.fs.log_write(&bp);
            tot += m;
            off += m as u32;
        }
        if off > self.data.size {
            self.data.size = off;
        }
        // The inode is written back even if size didn't change: the
        // loop above may have filled in new addrs[] entries.
        self.update();
        Ok(tot)
    }

    /// `dirlookup`: linear scan for `name`, skipping free slots.
    /// Returns a referenced (not locked) handle plus the entry's byte
    /// offset.
    pub fn dirlookup(&mut self, name: &[u8]) -> Option<(Inode<D>, u32)> {
        assert_eq!(self.itype(), InodeType::Dir, "dirlookup: not a directory");
        let mut off = 0u32;
        let mut de = Dirent::empty();
        while off < self.data.size {
            let n = self.readi(off, de.as_bytes_mut());
            assert_eq!(n, DIRENT_SIZE, "dirlookup: short read at offset {off}");
            if de.inum != 0 && namecmp(de.name_bytes(), name) {
                let ip = iget(&self.inode.fs, self.inode.dev, de.inum as u32);
                return Some((ip, off));
            }
            off += DIRENT_SIZE as u32;
        }
        None
    }

    /// `dirlink`: writes a new entry `(name, inum)`, refusing if
    /// `name` is already present. Reuses the first free slot, or
    /// appends at the end.
    pub fn dirlink(&mut self, name: &[u8], inum: u32) -> FsResult<()> {
        if let Some((existing, _)) = self.dirlookup(name) {
            drop(existing);
            return Err(FsError::NameExists);
        }

        let mut off = 0u32;
        let mut de = Dirent::empty();
        let mut target = self.data.size;
        while off < self.data.size {
            let n = self.readi(off, de.as_bytes_mut());
            assert_eq!(n, DIRENT_SIZE, "dirlink: short read at offset {off}");
            if de.inum == 0 {
                target = off;
                break;
            }
            off += DIRENT_SIZE as u32;
        }

        let entry = Dirent::new(inum as u16, name);
        self.writei(target, entry.as_bytes())?;
        Ok(())
    }

    /// Is this directory empty except for `.` and `..`?
    pub fn is_dir_empty(&mut self) -> bool {
        let mut de = Dirent::empty();
        let mut off = 2 * DIRENT_SIZE as u32;
        while off < self.data.size {
            let n = self.readi(off, de.as_bytes_mut());
            assert_eq!(n, DIRENT_SIZE, "is_dir_empty: short read at offset {off}");
            if de.inum != 0 {
                return false;
            }
            off += DIRENT_SIZE as u32;
        }
        true
    }
}
