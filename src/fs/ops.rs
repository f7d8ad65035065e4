//! Hard links, unlink, create, symlinks, and open (spec §4.3 "Hard
//! links" / "Unlink" / "Create" / "Symbolic links" / "Open").
//!
//! Grounded on the teacher's `sysfile.rs` (`sys_link`/`sys_unlink`/the
//! `create` helper/`sys_open`/`sys_mkdir`/`sys_mknod`) for control flow,
//! and on `original_source/kernel/sysfile.c`'s `resolve_symlink` for the
//! symlink-following loop, since the teacher never grew symlinks.
//! `File::write`'s per-call chunking is grounded on `file.rs`'s
//! `File::write`, which splits a write into `MAXOPBLOCKS`-bounded pieces
//! so a single large write never overruns one transaction.

use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use zerocopy::AsBytes;

use super::dinode::InodeType;
use super::dirent::Dirent;
use super::inode::{ialloc, Inode};
use super::path::{namei, nameiparent};
use super::stat::Stat;
use super::{begin_tx, FsInner};
use crate::error::{FsError, FsResult};
use crate::hal::BlockDevice;
use crate::param::{BSIZE, MAXOPBLOCKS, MAXPATH, MAX_SYMLINK_DEPTH, NDEV};

bitflags! {
    /// `open`'s mode bits (spec §6 "Syscall surface").
    pub struct OpenFlags: u32 {
        const RDONLY = 0;
        const WRONLY = 1 << 0;
        const RDWR = 1 << 1;
        const CREATE = 1 << 2;
        const TRUNC = 1 << 3;
        const NOFOLLOW = 1 << 4;
    }
}

/// The readable/writable pair an open [`File`] was granted, derived once
/// from [`OpenFlags`] at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl FileMode {
    fn from_flags(flags: OpenFlags) -> Self {
        if flags.contains(OpenFlags::RDWR) {
            FileMode::ReadWrite
        } else if flags.contains(OpenFlags::WRONLY) {
            FileMode::WriteOnly
        } else {
            FileMode::ReadOnly
        }
    }

    pub fn readable(self) -> bool {
        !matches!(self, FileMode::WriteOnly)
    }

    pub fn writable(self) -> bool {
        matches!(self, FileMode::WriteOnly | FileMode::ReadWrite)
    }
}

/// An open file handle bound to an inode, with its own read/write
/// cursor (spec §6 `read`/`write`/`fstat`).
pub struct File<D> {
    ip: Inode<D>,
    mode: FileMode,
    off: Mutex<u32>,
}

impl<D: BlockDevice> File<D> {
    /// Reads up to `buf.len()` bytes starting at the file's current
    /// offset, advancing it by the number of bytes actually read.
    pub fn read(&self, buf: &mut [u8]) -> FsResult<usize> {
        if !self.mode.readable() {
            return Err(FsError::BadFileMode);
        }
        let mut off = self.off.lock().unwrap();
        let n = self.ip.lock().readi(*off, buf);
        *off += n as u32;
        Ok(n)
    }

    /// Writes `buf` at the file's current offset, advancing it. Splits
    /// the write into chunks no larger than what fits in one
    /// transaction, matching the teacher's `File::write` (spec §4.2
    /// `MAXOPBLOCKS`: i-node, indirect block, an allocation block, and
    /// slop for a non-block-aligned write).
    pub fn write(&self, buf: &[u8]) -> FsResult<usize> {
        if !self.mode.writable() {
            return Err(FsError::BadFileMode);
        }
        let max = ((MAXOPBLOCKS - 1 - 1 - 2) / 2 * BSIZE).max(1);
        let mut off = self.off.lock().unwrap();
        let mut total = 0usize;
        for chunk in buf.chunks(max) {
            let tx = begin_tx(&self.ip.fs);
            let n = self.ip.lock().writei(*off, chunk)?;
            drop(tx);
            *off += n as u32;
            total += n;
            if n < chunk.len() {
                break;
            }
        }
        Ok(total)
    }

    /// `fstat`: metadata snapshot of the underlying inode.
    pub fn stat(&self) -> Stat {
        let ip = self.ip.lock();
        Stat {
            dev: ip.dev(),
            ino: ip.inum(),
            typ: ip.itype(),
            nlink: ip.nlink(),
            size: ip.size(),
        }
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    /// The inode this file is open on (e.g. for `chdir`, which needs
    /// the resolved inode rather than a `File`).
    pub fn inode(&self) -> &Inode<D> {
        &self.ip
    }
}

/// `create`: finds or makes `path` as an inode of type `typ` (spec §4.3
/// "Create"). Returns the existing inode when `typ == File` and a
/// file/device of that name already exists (open-with-`O_CREAT`
/// semantics); otherwise allocates and links a fresh one.
pub(crate) fn create<D: BlockDevice>(
    fs: &Arc<FsInner<D>>,
    cwd: &Inode<D>,
    path: &str,
    typ: InodeType,
    major: u16,
    minor: u16,
) -> FsResult<Inode<D>> {
    let (parent, name) = nameiparent(fs, path, cwd)?;
    let mut dp = parent.lock();

    if let Some((existing, _off)) = dp.dirlookup(name.as_bytes()) {
        drop(dp);
        if typ == InodeType::File {
            let et = existing.lock().itype();
            if et == InodeType::File || et == InodeType::Device {
                return Ok(existing);
            }
        }
        return Err(FsError::NameExists);
    }

    let child = ialloc(fs, dp.dev(), typ).ok_or(FsError::NoInodes)?;
    let mut ip = child.lock();
    ip.set_major_minor(major, minor);
    ip.set_nlink(1);
    ip.update();

    let linked = (|| -> FsResult<()> {
        if typ == InodeType::Dir {
            dp.set_nlink(dp.nlink() + 1);
            dp.update();
            // No ip.nlink++ for ".": a self-reference would never drop
            // to zero and the inode would never be freed.
            ip.dirlink(b".", ip.inum())?;
            ip.dirlink(b"..", dp.inum())?;
        }
        dp.dirlink(name.as_bytes(), ip.inum())
    })();

    if let Err(e) = linked {
        ip.set_nlink(0);
        ip.update();
        return Err(e);
    }

    drop(ip);
    Ok(child)
}

/// `link`: makes `new` a second directory entry for the inode `old`
/// names (spec §4.3 "Hard links"). Rolls back the `nlink` bump if
/// linking the new name fails.
pub(crate) fn link<D: BlockDevice>(fs: &Arc<FsInner<D>>, cwd: &Inode<D>, old: &str, new: &str) -> FsResult<()> {
    let target = namei(fs, old, cwd)?;
    {
        let mut ip = target.lock();
        if ip.itype() == InodeType::Dir {
            return Err(FsError::IsADirectory);
        }
        ip.set_nlink(ip.nlink() + 1);
        ip.update();
    }

    let result = (|| -> FsResult<()> {
        let (parent, name) = nameiparent(fs, new, cwd)?;
        let mut dp = parent.lock();
        if dp.dev() != target.dev {
            return Err(FsError::CrossDevice);
        }
        dp.dirlink(name.as_bytes(), target.inum)
    })();

    if result.is_err() {
        let mut ip = target.lock();
        ip.set_nlink(ip.nlink() - 1);
        ip.update();
    }
    result
}

/// `unlink`: removes the directory entry `path` names (spec §4.3
/// "Unlink"). Refuses `.`/`..` and non-empty directories.
pub(crate) fn unlink<D: BlockDevice>(fs: &Arc<FsInner<D>>, cwd: &Inode<D>, path: &str) -> FsResult<()> {
    let (parent, name) = nameiparent(fs, path, cwd)?;
    if name == "." || name == ".." {
        return Err(FsError::InvalidArgument);
    }

    let mut dp = parent.lock();
    let (target, off) = dp.dirlookup(name.as_bytes()).ok_or(FsError::NotFound)?;
    let mut ip = target.lock();
    assert!(ip.nlink() >= 1, "unlink: nlink < 1 for inum {}", ip.inum());

    if ip.itype() == InodeType::Dir && !ip.is_dir_empty() {
        return Err(FsError::DirectoryNotEmpty);
    }

    let zero = Dirent::empty();
    let n = dp.writei(off, zero.as_bytes())?;
    assert_eq!(n, core::mem::size_of::<Dirent>(), "unlink: short dirent write");

    if ip.itype() == InodeType::Dir {
        dp.set_nlink(dp.nlink() - 1);
        dp.update();
    }
    ip.set_nlink(ip.nlink() - 1);
    ip.update();
    Ok(())
}

/// `symlink`: creates a `T_SYMLINK` inode at `path` whose payload is
/// `target`'s bytes (spec §4.3 "Symbolic links").
pub(crate) fn symlink<D: BlockDevice>(fs: &Arc<FsInner<D>>, cwd: &Inode<D>, target: &str, path: &str) -> FsResult<()> {
    let ip = create(fs, cwd, path, InodeType::Symlink, 0, 0)?;
    let mut guard = ip.lock();
    let n = guard.writei(0, target.as_bytes())?;
    if n != target.as_bytes().len() {
        return Err(FsError::NoSpace);
    }
    Ok(())
}

/// `open`: resolves or creates `path`, follows symlinks (unless
/// `NOFOLLOW`), validates directory/device constraints, optionally
/// truncates, and returns an open [`File`] (spec §4.3 "Open").
pub(crate) fn open<D: BlockDevice>(fs: &Arc<FsInner<D>>, cwd: &Inode<D>, path: &str, flags: OpenFlags) -> FsResult<File<D>> {
    let mut current = if flags.contains(OpenFlags::CREATE) {
        create(fs, cwd, path, InodeType::File, 0, 0)?
    } else {
        namei(fs, path, cwd)?
    };

    if !flags.contains(OpenFlags::NOFOLLOW) {
        let mut depth = 0u32;
        loop {
            let is_symlink = current.lock().itype() == InodeType::Symlink;
            if !is_symlink {
                break;
            }
            depth += 1;
            if depth > MAX_SYMLINK_DEPTH {
                return Err(FsError::SymlinkLoop);
            }
            let target = {
                let mut guard = current.lock();
                let mut raw = [0u8; MAXPATH];
                let n = guard.readi(0, &mut raw);
                String::from_utf8_lossy(&raw[..n]).into_owned()
            };
            current = namei(fs, &target, cwd)?;
        }
    }

    let mut guard = current.lock();
    let typ = guard.itype();

    if typ == InodeType::Dir && flags.intersects(OpenFlags::WRONLY | OpenFlags::RDWR) {
        return Err(FsError::IsADirectory);
    }

    if typ == InodeType::Device && guard.major() as usize >= NDEV {
        return Err(FsError::NoSuchDevice);
    }

    if flags.contains(OpenFlags::TRUNC) && typ == InodeType::File {
        guard.itrunc();
    }

    let mode = FileMode::from_flags(flags);
    drop(guard);

    Ok(File {
        ip: current,
        mode,
        off: Mutex::new(0),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::fs::FileSystem;
    use crate::mkfs;
    use crate::param::ROOTDEV;
    use crate::ramdisk::RamDisk;

    fn fresh() -> FileSystem<RamDisk> {
        let disk = Arc::new(RamDisk::new(4096));
        mkfs::format(&*disk, ROOTDEV, 4096, 200).expect("format");
        FileSystem::mount(disk, ROOTDEV)
    }

    #[test]
    fn create_write_read_round_trip() {
        let fs = fresh();
        let root = fs.root();
        let file = fs.open(&root, "/a", OpenFlags::CREATE | OpenFlags::RDWR).expect("open");
        let pattern = [0xABu8; 4096];
        assert_eq!(file.write(&pattern).unwrap(), pattern.len());

        let file2 = fs.open(&root, "/a", OpenFlags::RDONLY).expect("reopen");
        let mut out = [0u8; 4096];
        assert_eq!(file2.read(&mut out).unwrap(), pattern.len());
        assert_eq!(out, pattern);
    }

    #[test]
    fn link_then_unlink_original_keeps_contents() {
        let fs = fresh();
        let root = fs.root();
        let f = fs.open(&root, "/x", OpenFlags::CREATE | OpenFlags::RDWR).expect("open");
        f.write(b"hello").unwrap();
        drop(f);

        fs.link(&root, "/x", "/y").expect("link");
        fs.unlink(&root, "/x").expect("unlink");

        let g = fs.open(&root, "/y", OpenFlags::RDONLY).expect("open y");
        let mut buf = [0u8; 5];
        assert_eq!(g.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(g.stat().nlink, 1);
    }

    #[test]
    fn unlink_refuses_nonempty_directory() {
        let fs = fresh();
        let root = fs.root();
        fs.mkdir(&root, "/d").expect("mkdir");
        let dir = fs.namei(&root, "/d").expect("namei");
        fs.open(&dir, "f", OpenFlags::CREATE | OpenFlags::RDWR).expect("open");
        assert_eq!(fs.unlink(&root, "/d"), Err(FsError::DirectoryNotEmpty));
    }

    #[test]
    fn mkdir_then_unlink_updates_parent_nlink() {
        let fs = fresh();
        let root = fs.root();
        assert_eq!(root.lock().nlink(), 1);
        fs.mkdir(&root, "/d").expect("mkdir");
        assert_eq!(root.lock().nlink(), 2, "parent nlink should gain d's ..");
        fs.unlink(&root, "/d").expect("rmdir /d");
        assert_eq!(root.lock().nlink(), 1);
        assert!(fs.namei(&root, "/d").is_err());
    }

    #[test]
    fn symlink_chain_within_depth_resolves() {
        let fs = fresh();
        let root = fs.root();
        fs.open(&root, "/base", OpenFlags::CREATE | OpenFlags::RDWR)
            .unwrap()
            .write(b"data")
            .unwrap();
        fs.symlink(&root, "/base", "/l1").expect("symlink");
        fs.symlink(&root, "/l1", "/l2").expect("symlink");

        let f = fs.open(&root, "/l2", OpenFlags::RDONLY).expect("open through symlinks");
        let mut buf = [0u8; 4];
        assert_eq!(f.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"data");
    }

    #[test]
    fn symlink_chain_past_depth_limit_fails() {
        let fs = fresh();
        let root = fs.root();
        fs.symlink(&root, "/etc/hosts", "/a").expect("symlink 0");
        let mut prev = "a".to_string();
        for i in 0..10 {
            let name = format!("/{}", (b'b' + i) as char);
            fs.symlink(&root, &format!("/{prev}"), &name).expect("symlink chain");
            prev = name.trim_start_matches('/').to_string();
        }
        let last = format!("/{prev}");
        assert!(matches!(fs.open(&root, &last, OpenFlags::RDONLY), Err(FsError::SymlinkLoop)));
    }

    #[test]
    fn open_rejects_write_to_directory() {
        let fs = fresh();
        let root = fs.root();
        fs.mkdir(&root, "/d").unwrap();
        assert!(matches!(fs.open(&root, "/d", OpenFlags::WRONLY), Err(FsError::IsADirectory)));
    }
}
