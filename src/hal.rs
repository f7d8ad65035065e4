//! Block device adapter.
//!
//! Thin wrapper around a block driver (spec §2, §1 Non-goals: "the
//! physical disk driver ... abstracted as a blocking block device").
//! Corresponds to the teacher's `hal.rs`/`virtio_disk.rs`, minus the
//! actual virtio ring handling, which is out of scope here.

use crate::param::BSIZE;

/// A synchronous block device: `read_block`/`write_block` each move
/// exactly one `BSIZE`-byte block and do not return until the I/O is
/// complete. Implementors may be backed by a file, a RAM region, or an
/// actual disk; the storage core never assumes more than this.
pub trait BlockDevice: Send + Sync {
    /// Reads block `bno` of device `dev` into `out`.
    fn read_block(&self, dev: u32, bno: u32, out: &mut [u8; BSIZE]);

    /// Writes `data` to block `bno` of device `dev`.
    fn write_block(&self, dev: u32, bno: u32, data: &[u8; BSIZE]);
}
