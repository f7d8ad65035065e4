//! Black-box scenarios exercising crash consistency, link/unlink
//! accounting, large files, symlink depth, and concurrent group commit
//! against the public `FileSystem` surface, one test per named scenario.

use std::sync::Arc;
use std::thread;

use zerocopy::{AsBytes, FromBytes};

use rv6fs_core::fs::dinode::{Dinode, InodeType};
use rv6fs_core::fs::{FileSystem, OpenFlags};
use rv6fs_core::hal::BlockDevice;
use rv6fs_core::mkfs;
use rv6fs_core::param::{BSIZE, ROOTDEV};
use rv6fs_core::ramdisk::RamDisk;

const BLOCKS: u32 = 2048;
const NINODES: u32 = 200;

fn fresh_disk() -> Arc<RamDisk> {
    let disk = Arc::new(RamDisk::new(BLOCKS));
    mkfs::format(&*disk, ROOTDEV, BLOCKS, NINODES).expect("format");
    disk
}

/// S1: create("/a"), write 4096 bytes of 0xAB, close, crash before the
/// transaction's header ever commits. After recovery, `/a` does not
/// exist — an inode that was dirtied on disk but never linked from a
/// directory entry (because that dirent write is itself part of the
/// uncommitted transaction) is unreachable, which is what "does not
/// exist" means at this layer.
#[test]
fn s1_crash_before_commit_leaves_no_trace() {
    let disk = fresh_disk();

    // Fabricate exactly what a half-finished `create("/a")` would have
    // dirtied in its log buffers: an allocated-looking inode and a
    // full block of pattern bytes. Crucially, never touch root's
    // directory block, since that write is the one the real `create`
    // would also have deferred to the same (never-committed) header.
    {
        let fs = FileSystem::mount(disk.clone(), ROOTDEV);
        let sb = *fs.superblock();
        drop(fs);

        let orphan_inum = 2u32;
        // `bmapstart + 1` is root's own directory data block (laid
        // down by `mkfs::format`); pick the first block past it so
        // this doesn't clobber root's `.`/`..` entries.
        let orphan_block = sb.bmapstart + 2;

        let mut inode_buf = [0u8; BSIZE];
        disk.read_block(ROOTDEV, sb.iblock(orphan_inum), &mut inode_buf);
        let dinode = Dinode {
            typ: InodeType::File.to_raw(),
            major: 0,
            minor: 0,
            nlink: 1,
            size: 4096,
            addrs: {
                let mut a = [0u32; rv6fs_core::param::NADDRS];
                a[0] = orphan_block;
                a
            },
        };
        let off = (orphan_inum as usize % (BSIZE / core::mem::size_of::<Dinode>())) * core::mem::size_of::<Dinode>();
        inode_buf[off..off + core::mem::size_of::<Dinode>()].copy_from_slice(dinode.as_bytes());
        disk.write_block(ROOTDEV, sb.iblock(orphan_inum), &inode_buf);

        let pattern = [0xABu8; BSIZE];
        disk.write_block(ROOTDEV, orphan_block, &pattern);
    }

    // Remount: recovery sees a clean header (n == 0, never touched)
    // and does nothing. Root's directory still only has `.`/`..`.
    let fs = FileSystem::mount(disk, ROOTDEV);
    let root = fs.root();
    assert!(fs.namei(&root, "/a").is_err(), "an uncommitted create must not be reachable");
}

/// S2: same setup as S1, but this time the header write (the commit
/// point) succeeded before the crash — only the home-location install
/// (step 3) was interrupted. After recovery, `/a` contains the full
/// 4096 bytes.
#[test]
fn s2_crash_during_install_recovers_full_content() {
    let disk = fresh_disk();

    let inum;
    {
        let fs = FileSystem::mount(disk.clone(), ROOTDEV);
        let root = fs.root();
        let file = fs.open(&root, "/a", OpenFlags::CREATE | OpenFlags::RDWR).expect("create /a");
        inum = file.stat().ino;
        // Deliberately do not write any content yet: the only thing
        // committed so far is the inode allocation and its directory
        // link, exactly as happens before `write` is ever called.
    }

    let sb = {
        let fs = FileSystem::mount(disk.clone(), ROOTDEV);
        *fs.superblock()
    };
    let pattern = [0xABu8; 4096];
    let nblocks = pattern.len() / BSIZE;
    // `bmapstart + 1` is root's own directory data block; start past it.
    let data_blocks: Vec<u32> = (0..nblocks as u32).map(|i| sb.bmapstart + 2 + i).collect();

    // Build the post-write inode (size + direct addrs populated) as
    // the commit's log copy would look, without ever touching the
    // home inode block — that's the "crash mid-install" we're simulating.
    let mut home_inode_block = [0u8; BSIZE];
    disk.read_block(ROOTDEV, sb.iblock(inum), &mut home_inode_block);
    let ipb = BSIZE / core::mem::size_of::<Dinode>();
    let off = (inum as usize % ipb) * core::mem::size_of::<Dinode>();
    let mut dinode = Dinode::read_from(&home_inode_block[off..off + core::mem::size_of::<Dinode>()]).unwrap();
    dinode.size = pattern.len() as u32;
    for (i, &b) in data_blocks.iter().enumerate() {
        dinode.addrs[i] = b;
    }
    let mut logged_inode_block = home_inode_block;
    logged_inode_block[off..off + core::mem::size_of::<Dinode>()].copy_from_slice(dinode.as_bytes());

    // Write the log header (the atomic commit point) and one logged
    // copy per block — inode block first, then each data block — but
    // leave the home locations exactly as they were: install never ran.
    let mut logged_blocks = vec![sb.iblock(inum)];
    logged_blocks.extend_from_slice(&data_blocks);
    write_raw_log_header(&disk, &sb, &logged_blocks);
    disk.write_block(ROOTDEV, sb.logstart + 1, &logged_inode_block);
    for (i, chunk) in pattern.chunks(BSIZE).enumerate() {
        let mut buf = [0u8; BSIZE];
        buf[..chunk.len()].copy_from_slice(chunk);
        disk.write_block(ROOTDEV, sb.logstart + 2 + i as u32, &buf);
    }

    // Remount: recovery replays every logged block to its home
    // location before anything else can observe the file system.
    let fs = FileSystem::mount(disk, ROOTDEV);
    let root = fs.root();
    let file = fs.open(&root, "/a", OpenFlags::RDONLY).expect("reopen /a");
    let mut out = [0u8; 4096];
    let n = file.read(&mut out).expect("read /a");
    assert_eq!(n, pattern.len());
    assert_eq!(out[..n], pattern[..]);
}

fn write_raw_log_header<D: BlockDevice>(disk: &D, sb: &rv6fs_core::fs::Superblock, blocks: &[u32]) {
    // Mirrors `LogHeader`'s on-disk shape (`n: u32`, `block: [u32; LOGSIZE]`)
    // without depending on the private type: the formatter and the log
    // agree on this layout as a wire format, not as shared Rust code.
    let mut buf = [0u8; BSIZE];
    buf[0..4].copy_from_slice(&(blocks.len() as u32).to_ne_bytes());
    for (i, &b) in blocks.iter().enumerate() {
        let at = 4 + i * 4;
        buf[at..at + 4].copy_from_slice(&b.to_ne_bytes());
    }
    disk.write_block(ROOTDEV, sb.logstart, &buf);
}

/// S3: `link`/`unlink` round-trip — linking then removing the
/// original name leaves the content reachable under the new name with
/// `nlink == 1`.
#[test]
fn s3_link_unlink_round_trip() {
    let disk = fresh_disk();
    let fs = FileSystem::mount(disk, ROOTDEV);
    let root = fs.root();

    let f = fs.open(&root, "/x", OpenFlags::CREATE | OpenFlags::RDWR).expect("create /x");
    f.write(b"storage core").unwrap();
    drop(f);

    fs.link(&root, "/x", "/y").expect("link /x /y");
    fs.unlink(&root, "/x").expect("unlink /x");

    assert!(fs.namei(&root, "/x").is_err());
    let g = fs.open(&root, "/y", OpenFlags::RDONLY).expect("open /y");
    let mut buf = [0u8; 12];
    assert_eq!(g.read(&mut buf).unwrap(), 12);
    assert_eq!(&buf, b"storage core");
    assert_eq!(g.stat().nlink, 1);
}

/// S4: a 200,000-byte file touches direct, single-indirect, and
/// double-indirect blocks; every byte must round-trip.
#[test]
fn s4_large_file_round_trips_across_indirect_tiers() {
    let disk = fresh_disk();
    let fs = FileSystem::mount(disk, ROOTDEV);
    let root = fs.root();

    let pattern: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let f = fs.open(&root, "/big", OpenFlags::CREATE | OpenFlags::RDWR).expect("create /big");
    let mut written = 0;
    while written < pattern.len() {
        written += f.write(&pattern[written..]).expect("write /big");
    }
    drop(f);

    let g = fs.open(&root, "/big", OpenFlags::RDONLY).expect("reopen /big");
    let mut out = vec![0u8; pattern.len()];
    let mut read = 0;
    while read < out.len() {
        let n = g.read(&mut out[read..]).expect("read /big");
        if n == 0 {
            break;
        }
        read += n;
    }
    assert_eq!(read, pattern.len());
    assert_eq!(out, pattern);
}

/// S5: an 11-deep symlink chain exceeds `MAX_SYMLINK_DEPTH` (10);
/// opening the far end fails with a symlink-loop error rather than
/// resolving.
#[test]
fn s5_symlink_chain_past_depth_limit_fails_to_open() {
    let disk = fresh_disk();
    let fs = FileSystem::mount(disk, ROOTDEV);
    let root = fs.root();

    // symlink("/etc/hosts", "/a"); symlink("/a", "/b"); ...; symlink("/j", "/k")
    fs.symlink(&root, "/etc/hosts", "/a").expect("symlink /a");
    let names: Vec<String> = ('b'..='k').map(|c| format!("/{c}")).collect();
    let mut prev = "/a".to_string();
    for name in &names {
        fs.symlink(&root, &prev, name).unwrap_or_else(|e| panic!("symlink {name}: {e}"));
        prev = name.clone();
    }

    let result = fs.open(&root, "/k", OpenFlags::RDONLY);
    assert!(result.is_err(), "an 11-deep symlink chain must fail to open");
}

/// S6: ten threads concurrently `create`/`write`/close distinct files
/// under group commit; after they all join, every file exists with
/// its expected content.
#[test]
fn s6_concurrent_creates_group_commit_and_all_survive() {
    let disk = fresh_disk();
    let fs = FileSystem::mount(disk, ROOTDEV);
    let root = fs.root();

    let handles: Vec<_> = (0..10u8)
        .map(|n| {
            let fs = fs.clone();
            let root = root.clone();
            thread::spawn(move || {
                let path = format!("/t{n}");
                let content = vec![n; n as usize + 1];
                let f = fs.open(&root, &path, OpenFlags::CREATE | OpenFlags::RDWR).expect("create");
                f.write(&content).expect("write");
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for n in 0..10u8 {
        let path = format!("/t{n}");
        let f = fs.open(&root, &path, OpenFlags::RDONLY).unwrap_or_else(|e| panic!("open {path}: {e}"));
        let mut buf = vec![0u8; n as usize + 1];
        let read = f.read(&mut buf).expect("read");
        assert_eq!(read, buf.len());
        assert!(buf.iter().all(|&b| b == n), "file {path} has wrong content");
    }
}
