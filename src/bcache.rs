//! Buffer cache: a fixed pool of block buffers hash-partitioned into
//! buckets, with LRU eviction and a deadlock-free lookup protocol
//! (spec §4.1).
//!
//! Grounded on the teacher's `bio.rs` for the public contract
//! (`get`/`read`/`write`/`release`/`pin`/`unpin`) and on
//! `kazukousen-xv6rs/kernel/src/bio.rs` for the RAII-guard shape
//! (`BufGuard` releases on `Drop` rather than requiring an explicit
//! call, the way `bread`/`brelse` pairs do in C).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use array_macro::array;

use crate::hal::BlockDevice;
use crate::lock::{Spinlock, SpinlockGuard};
use crate::param::{BSIZE, NBUCKET, NBUF};

/// Bookkeeping for one resident buffer: which block it holds and how
/// many holders/pins reference it. Lives inside whichever bucket
/// currently owns it (spec §4.1 "Layout").
struct BufMeta {
    dev: u32,
    bno: u32,
    /// Holders (`get`/`read` callers) plus pins (`Log::write`).
    refcnt: u32,
    /// Tick sampled when `refcnt` last dropped to zero.
    last_use: u64,
    /// Index into the fixed payload pool.
    idx: usize,
}

#[derive(Default)]
struct Bucket {
    entries: Vec<BufMeta>,
}

/// The payload half of a buffer: the 1024-byte block contents plus the
/// validity flag. Guarded by a per-slot sleeplock so that at most one
/// holder examines/mutates it at a time (invariant 1).
pub struct BufPayload {
    pub valid: bool,
    pub data: [u8; BSIZE],
}

impl BufPayload {
    const fn new() -> Self {
        Self {
            valid: false,
            data: [0; BSIZE],
        }
    }
}

/// A fixed pool of `NBUF` buffers, hash-partitioned into `NBUCKET`
/// buckets (spec §4.1).
pub struct Bcache<D> {
    device: Arc<D>,
    buckets: [Spinlock<Bucket>; NBUCKET],
    payload: Vec<crate::lock::Sleeplock<BufPayload>>,
    tick: AtomicU64,
}

impl<D: BlockDevice> Bcache<D> {
    pub fn new(device: Arc<D>) -> Self {
        let payload = (0..NBUF)
            .map(|_| crate::lock::Sleeplock::new("buffer", BufPayload::new()))
            .collect();
        let buckets: [Spinlock<Bucket>; NBUCKET] = array![i => Spinlock::new("bcache.bucket", Bucket::default()); NBUCKET];
        // All buffers start out unassigned; parking them all in bucket
        // 0 (as if every one cached block 0 of device 0) means the
        // first round of `get` calls finds real eviction candidates
        // without a separate free list, matching how the classic
        // bcache starts with every buf linked off one list.
        buckets[0].lock().entries.extend((0..NBUF).map(|idx| BufMeta {
            dev: 0,
            bno: 0,
            refcnt: 0,
            last_use: 0,
            idx,
        }));
        Self {
            device,
            buckets,
            payload,
            tick: AtomicU64::new(1),
        }
    }

    fn bucket_of(bno: u32) -> usize {
        (bno as usize) % NBUCKET
    }

    /// Returns a buffer for `(dev, bno)`, sleep-locked for the caller.
    /// Implements the deadlock-free lookup protocol of spec §4.1.
    pub fn get(&self, dev: u32, bno: u32) -> BufGuard<'_, D> {
        let b = Self::bucket_of(bno);

        // Step 1-2: try the single bucket lock first.
        {
            let mut bucket = self.buckets[b].lock();
            if let Some(m) = bucket.entries.iter_mut().find(|m| m.dev == dev && m.bno == bno) {
                m.refcnt += 1;
                let idx = m.idx;
                drop(bucket);
                return self.acquire(idx, dev, bno, b, false);
            }
        }

        // Step 3: miss. Acquire every bucket lock in ascending order.
        let mut guards: Vec<SpinlockGuard<'_, Bucket>> = Vec::with_capacity(NBUCKET);
        for bucket in &self.buckets {
            guards.push(bucket.lock());
        }

        if let Some(m) = guards[b].entries.iter_mut().find(|m| m.dev == dev && m.bno == bno) {
            m.refcnt += 1;
            let idx = m.idx;
            Self::release_descending(guards);
            return self.acquire(idx, dev, bno, b, false);
        }

        // Step 4: confirmed miss. Pick the LRU victim with refcnt == 0
        // across every bucket.
        let mut victim: Option<(usize, usize, u64)> = None;
        for (i, bucket) in guards.iter().enumerate() {
            for (pos, m) in bucket.entries.iter().enumerate() {
                if m.refcnt == 0 && victim.map_or(true, |(_, _, lu)| m.last_use < lu) {
                    victim = Some((i, pos, m.last_use));
                }
            }
        }
        if victim.is_none() {
            crate::diag!(
                "bcache: pool exhausted, no refcnt==0 victim for (dev={}, bno={}) across {} buckets",
                dev,
                bno,
                NBUCKET
            );
        }
        let (vb, vpos, _) = victim.expect("bcache: no free buffers (pool exhausted)");
        let mut meta = guards[vb].entries.remove(vpos);
        meta.dev = dev;
        meta.bno = bno;
        meta.refcnt = 1;
        let idx = meta.idx;
        guards[b].entries.push(meta);

        Self::release_descending(guards);
        self.acquire(idx, dev, bno, b, true)
    }

    fn release_descending(mut guards: Vec<SpinlockGuard<'_, Bucket>>) {
        while let Some(g) = guards.pop() {
            drop(g);
        }
    }

    fn acquire(&self, idx: usize, dev: u32, bno: u32, bucket: usize, evicted: bool) -> BufGuard<'_, D> {
        let mut payload = self.payload[idx].lock();
        if evicted {
            payload.valid = false;
        }
        BufGuard {
            bcache: self,
            idx,
            dev,
            bno,
            bucket,
            payload: Some(payload),
        }
    }

    /// Like [`Bcache::get`], additionally guaranteeing the payload has
    /// been loaded from disk.
    pub fn read(&self, dev: u32, bno: u32) -> BufGuard<'_, D> {
        let mut buf = self.get(dev, bno);
        if !buf.payload().valid {
            let mut data = [0u8; BSIZE];
            self.device.read_block(dev, bno, &mut data);
            let payload = buf.payload_mut();
            payload.data = data;
            payload.valid = true;
        }
        buf
    }

    /// Writes `buf`'s payload to disk immediately. Caller must hold
    /// the sleep-lock (enforced by taking `&BufGuard`). Used only by
    /// the log machinery; ordinary FS code calls `Log::write` instead.
    pub fn write_through(&self, buf: &BufGuard<'_, D>) {
        self.device.write_block(buf.dev, buf.bno, &buf.payload().data);
    }

    /// Increments the reference count of `(dev, bno)` without touching
    /// the sleep-lock, pinning it against eviction. The caller must
    /// already hold a reference (e.g. a live `BufGuard`) so the entry
    /// is guaranteed to exist.
    pub fn pin(&self, dev: u32, bno: u32) {
        let b = Self::bucket_of(bno);
        let mut bucket = self.buckets[b].lock();
        let m = bucket
            .entries
            .iter_mut()
            .find(|m| m.dev == dev && m.bno == bno)
            .expect("pin: buffer not resident");
        m.refcnt += 1;
    }

    /// Inverse of [`Bcache::pin`].
    pub fn unpin(&self, dev: u32, bno: u32) {
        let b = Self::bucket_of(bno);
        let mut bucket = self.buckets[b].lock();
        let m = bucket
            .entries
            .iter_mut()
            .find(|m| m.dev == dev && m.bno == bno)
            .expect("unpin: buffer not resident");
        assert!(m.refcnt > 0, "unpin: refcnt already zero");
        m.refcnt -= 1;
        if m.refcnt == 0 {
            m.last_use = self.tick.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn release(&self, idx: usize, dev: u32, bno: u32, bucket: usize) {
        let mut b = self.buckets[bucket].lock();
        let m = b
            .entries
            .iter_mut()
            .find(|m| m.idx == idx && m.dev == dev && m.bno == bno)
            .expect("release: buffer vanished from its bucket");
        assert!(m.refcnt > 0, "release: refcnt already zero");
        m.refcnt -= 1;
        if m.refcnt == 0 {
            m.last_use = self.tick.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// A sleep-locked handle to one cached block. Releases the sleep-lock
/// and decrements the reference count on drop (spec §9: "a guard
/// object whose destructor performs release is the natural encoding").
pub struct BufGuard<'a, D> {
    bcache: &'a Bcache<D>,
    idx: usize,
    pub dev: u32,
    pub bno: u32,
    bucket: usize,
    payload: Option<crate::lock::SleeplockGuard<'a, BufPayload>>,
}

impl<'a, D> BufGuard<'a, D> {
    fn payload(&self) -> &BufPayload {
        self.payload.as_ref().expect("buf already released")
    }

    fn payload_mut(&mut self) -> &mut BufPayload {
        self.payload.as_mut().expect("buf already released")
    }

    pub fn data(&self) -> &[u8; BSIZE] {
        &self.payload().data
    }

    pub fn data_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.payload_mut().data
    }

    pub fn is_valid(&self) -> bool {
        self.payload().valid
    }

    pub fn mark_valid(&mut self) {
        self.payload_mut().valid = true;
    }
}

impl<D: BlockDevice> Drop for BufGuard<'_, D> {
    fn drop(&mut self) {
        self.payload.take();
        self.bcache.release(self.idx, self.dev, self.bno, self.bucket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ramdisk::RamDisk;

    fn new_bcache(nblocks: u32) -> Bcache<RamDisk> {
        Bcache::new(Arc::new(RamDisk::new(nblocks)))
    }

    #[test]
    fn read_then_write_round_trips() {
        let bc = new_bcache(64);
        {
            let mut b = bc.read(1, 5);
            b.data_mut()[0] = 0xAB;
            bc.write_through(&b);
        }
        let b = bc.read(1, 5);
        assert_eq!(b.data()[0], 0xAB);
    }

    #[test]
    fn identity_uniqueness_across_many_blocks() {
        // More distinct blocks than NBUF: forces eviction, and every
        // get() must still return the right content for its block.
        let bc = new_bcache(200);
        for bno in 0..100u32 {
            let mut b = bc.read(1, bno);
            b.data_mut()[0] = bno as u8;
            bc.write_through(&b);
        }
        for bno in 0..100u32 {
            let b = bc.read(1, bno);
            assert_eq!(b.data()[0], bno as u8, "bno {bno} lost its content across eviction");
        }
    }

    #[test]
    fn pinned_buffer_survives_eviction_pressure() {
        let bc = new_bcache(4096);
        let pinned = bc.get(1, 0);
        bc.pin(1, 0);
        drop(pinned);
        // Touch far more distinct blocks than NBUF so eviction must
        // run repeatedly; the pin should keep (1,0) resident.
        for bno in 1..(NBUF as u32 * 4) {
            drop(bc.read(1, bno));
        }
        let b = bc.get(1, 0);
        assert_eq!(b.bno, 0);
        drop(b);
        bc.unpin(1, 0);
    }

    #[test]
    #[should_panic(expected = "no free buffers")]
    fn pool_exhaustion_is_fatal() {
        let bc = new_bcache(4096);
        let mut held = Vec::new();
        for bno in 0..(NBUF as u32 + 1) {
            held.push(bc.get(1, bno));
        }
    }
}
