//! Write-ahead redo log providing crash-consistent group commit
//! (spec §4.2).
//!
//! Grounded on the teacher's `fs/ufs/log.rs`: the on-disk header
//! layout, the `write_log`/`write_head`/`install_trans` split inside
//! `commit`, and the `begin_op`/`end_op` admission formula are carried
//! over unchanged. `Sleepablelock` stands in for the teacher's own
//! type of the same name (see `SPEC_FULL.md` for the primitive swap).

use std::sync::Arc;

use arrayvec::ArrayVec;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::bcache::Bcache;
use crate::hal::BlockDevice;
use crate::lock::Sleepablelock;
use crate::param::{BSIZE, LOGSIZE, MAXOPBLOCKS};

/// On-disk and in-memory log header: occupies block 0 of the log
/// region (spec §3 "Log header").
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct LogHeader {
    n: u32,
    block: [u32; LOGSIZE],
}

const_assert!(core::mem::size_of::<LogHeader>() <= BSIZE);

struct LogState {
    /// How many FS syscalls are currently inside a `begin`/`end` bracket.
    outstanding: u32,
    /// Set while `commit()` runs; new transactions may not start.
    committing: bool,
    /// Destination block numbers of the current transaction, in the
    /// order they were first written (log absorption keeps this
    /// free of duplicates).
    blocks: ArrayVec<u32, LOGSIZE>,
}

/// Groups concurrent FS syscalls into a single on-disk transaction,
/// committed once the last outstanding one ends.
pub struct Log<D> {
    bcache: Arc<Bcache<D>>,
    dev: u32,
    start: u32,
    size: u32,
    state: Sleepablelock<LogState>,
}

impl<D: BlockDevice> Log<D> {
    /// Mounts the log region `[start, start+size)` of `dev` and runs
    /// recovery (spec §4.2 "Recovery (at mount)").
    pub fn new(bcache: Arc<Bcache<D>>, dev: u32, start: u32, size: u32) -> Self {
        let log = Self {
            bcache,
            dev,
            start,
            size,
            state: Sleepablelock::new(
                "log",
                LogState {
                    outstanding: 0,
                    committing: false,
                    blocks: ArrayVec::new(),
                },
            ),
        };
        log.recover();
        log
    }

    fn read_header(&self) -> LogHeader {
        let buf = self.bcache.read(self.dev, self.start);
        LogHeader::read_from_prefix(&buf.data()[..]).expect("log header decode")
    }

    fn write_header(&self, header: &LogHeader) {
        let mut buf = self.bcache.read(self.dev, self.start);
        buf.data_mut()[..core::mem::size_of::<LogHeader>()].copy_from_slice(header.as_bytes());
        self.bcache.write_through(&buf);
    }

    /// Copies `blocks[i]`'s payload from the cache to log block
    /// `start + 1 + i` and writes it synchronously (commit step 1).
    fn write_log(&self, blocks: &[u32]) {
        for (i, &bno) in blocks.iter().enumerate() {
            let src = self.bcache.read(self.dev, bno);
            let mut dst = self.bcache.read(self.dev, self.start + 1 + i as u32);
            *dst.data_mut() = *src.data();
            self.bcache.write_through(&dst);
        }
    }

    /// Copies log blocks to their home locations (commit step 3, and
    /// recovery). When `recovering` is true the buffers are not
    /// pinned, so nothing is unpinned either (spec §4.2 recovery note).
    fn install_trans(&self, blocks: &[u32], recovering: bool) {
        for (i, &bno) in blocks.iter().enumerate() {
            let src = self.bcache.read(self.dev, self.start + 1 + i as u32);
            let mut dst = self.bcache.read(self.dev, bno);
            *dst.data_mut() = *src.data();
            self.bcache.write_through(&dst);
            drop(dst);
            drop(src);
            if !recovering {
                self.bcache.unpin(self.dev, bno);
            }
        }
    }

    fn recover(&self) {
        let header = self.read_header();
        let n = header.n as usize;
        let blocks = &header.block[..n];
        if n > 0 {
            crate::diag!("log: recovering {} block(s) on dev {} from a committed transaction", n, self.dev);
        }
        self.install_trans(blocks, true);
        self.write_header(&LogHeader {
            n: 0,
            block: [0; LOGSIZE],
        });
    }

    fn commit(&self, blocks: &[u32]) {
        if blocks.is_empty() {
            return;
        }
        self.write_log(blocks);

        let mut header = LogHeader {
            n: blocks.len() as u32,
            block: [0; LOGSIZE],
        };
        header.block[..blocks.len()].copy_from_slice(blocks);
        // The atomic commit point: once this write lands, the
        // transaction is durable and will be replayed on recovery.
        self.write_header(&header);

        self.install_trans(blocks, false);

        // Marks the transaction complete so recovery will not replay it.
        self.write_header(&LogHeader {
            n: 0,
            block: [0; LOGSIZE],
        });
    }

    /// Admits a new op, blocking while a commit is in progress or
    /// while admitting it could overrun `LOGSIZE` (spec §4.2 `begin`).
    pub fn begin(&self) {
        let mut guard = self.state.lock();
        loop {
            let would_overrun =
                guard.blocks.len() as u32 + (guard.outstanding + 1) * MAXOPBLOCKS as u32 > LOGSIZE as u32;
            if guard.committing || would_overrun {
                guard.sleep();
            } else {
                guard.outstanding += 1;
                break;
            }
        }
    }

    /// Registers `bno`'s buffer with the current transaction, pinning
    /// it so it cannot be evicted before commit. Absorbs repeat writes
    /// to the same block within one transaction (spec §4.2 `write`).
    pub fn write(&self, bno: u32) {
        let mut guard = self.state.lock();
        assert!(guard.outstanding >= 1, "log write outside of a transaction");
        assert!(
            guard.blocks.len() < LOGSIZE && (guard.blocks.len() as u32) < self.size - 1,
            "too big a transaction"
        );
        if !guard.blocks.contains(&bno) {
            guard.blocks.push(bno);
            drop(guard);
            self.bcache.pin(self.dev, bno);
        }
    }

    /// Ends an op. Commits if this was the last outstanding one.
    pub fn end(&self) {
        let mut guard = self.state.lock();
        guard.outstanding -= 1;
        assert!(!guard.committing, "log end during an in-flight commit");

        if guard.outstanding == 0 {
            guard.committing = true;
            let blocks: Vec<u32> = guard.blocks.drain(..).collect();
            guard.unlocked(|| self.commit(&blocks));
            guard.committing = false;
        }
        // A newly freed slot (ours, or drained by our commit) may let
        // a blocked `begin` proceed.
        drop(guard);
        self.state.wakeup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ramdisk::RamDisk;

    const DEV: u32 = 1;
    const LOGSTART: u32 = 1;
    const DATA_START: u32 = LOGSTART + LOGSIZE as u32 + 1;

    fn mount(disk: Arc<RamDisk>) -> (Arc<Bcache<RamDisk>>, Log<RamDisk>) {
        let bcache = Arc::new(Bcache::new(disk));
        let log = Log::new(bcache.clone(), DEV, LOGSTART, LOGSIZE as u32);
        (bcache, log)
    }

    #[test]
    fn commit_makes_writes_durable() {
        let disk = Arc::new(RamDisk::new(256));
        let (bcache, log) = mount(disk.clone());

        log.begin();
        {
            let mut b = bcache.read(DEV, DATA_START);
            b.data_mut()[0] = 0xAB;
            log.write(b.bno);
        }
        log.end();

        // Fresh mount over the same physical bytes: recovery should
        // see a clean log (already installed) and the data should
        // still be there.
        drop(bcache);
        drop(log);
        let (bcache2, _log2) = mount(disk);
        let b = bcache2.read(DEV, DATA_START);
        assert_eq!(b.data()[0], 0xAB);
    }

    #[test]
    fn crash_before_commit_leaves_no_trace() {
        // Never call begin/write/end: nothing should ever reach the
        // home location, by construction. This documents S1's
        // expectation at the log layer: an uncommitted write never
        // lands on disk.
        let disk = Arc::new(RamDisk::new(256));
        let (bcache, _log) = mount(disk.clone());
        let mut raw = [0u8; BSIZE];
        disk.read_block(DEV, DATA_START, &mut raw);
        assert_eq!(raw[0], 0);
        drop(bcache);
    }

    #[test]
    fn recovery_replays_a_committed_but_uninstalled_transaction() {
        // Simulate a crash that happened after the header write (the
        // commit point) but before the home-location install: write
        // the header and log block directly, without running install,
        // then mount fresh and check recovery finishes the job (S2).
        let disk = Arc::new(RamDisk::new(256));
        {
            let bcache = Arc::new(Bcache::new(disk.clone()));
            let mut header = LogHeader {
                n: 1,
                block: [0; LOGSIZE],
            };
            header.block[0] = DATA_START;
            let mut hbuf = bcache.get(DEV, LOGSTART);
            hbuf.data_mut()[..core::mem::size_of::<LogHeader>()].copy_from_slice(header.as_bytes());
            bcache.write_through(&hbuf);
            drop(hbuf);

            let mut lbuf = bcache.get(DEV, LOGSTART + 1);
            lbuf.data_mut()[0] = 0xCD;
            bcache.write_through(&lbuf);
        }

        let (bcache, _log) = mount(disk);
        let b = bcache.read(DEV, DATA_START);
        assert_eq!(b.data()[0], 0xCD);
        let header = LogHeader::read_from_prefix(&bcache.read(DEV, LOGSTART).data()[..]).unwrap();
        assert_eq!(header.n, 0, "recovery must clear the header after replay");
    }

    #[test]
    fn log_absorption_keeps_only_the_latest_write() {
        let disk = Arc::new(RamDisk::new(256));
        let (bcache, log) = mount(disk);

        log.begin();
        {
            let mut b = bcache.read(DEV, DATA_START);
            b.data_mut()[0] = 1;
            log.write(b.bno);
        }
        {
            let mut b = bcache.read(DEV, DATA_START);
            b.data_mut()[0] = 2;
            log.write(b.bno);
        }
        log.end();

        let b = bcache.read(DEV, DATA_START);
        assert_eq!(b.data()[0], 2);
    }

    #[test]
    fn concurrent_ops_group_commit_and_all_survive() {
        use std::thread;

        let disk = Arc::new(RamDisk::new(512));
        let bcache = Arc::new(Bcache::new(disk));
        let log = Arc::new(Log::new(bcache.clone(), DEV, LOGSTART, LOGSIZE as u32));

        let handles: Vec<_> = (0..4u32)
            .map(|i| {
                let log = log.clone();
                let bcache = bcache.clone();
                thread::spawn(move || {
                    log.begin();
                    let mut b = bcache.read(DEV, DATA_START + i);
                    b.data_mut()[0] = i as u8 + 1;
                    log.write(b.bno);
                    drop(b);
                    log.end();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for i in 0..4u32 {
            let b = bcache.read(DEV, DATA_START + i);
            assert_eq!(b.data()[0], i as u8 + 1);
        }
    }

    #[test]
    #[should_panic(expected = "outside of a transaction")]
    fn write_outside_transaction_is_fatal() {
        let disk = Arc::new(RamDisk::new(256));
        let (bcache, log) = mount(disk);
        let b = bcache.read(DEV, DATA_START);
        log.write(b.bno);
    }
}
