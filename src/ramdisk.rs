//! An in-memory [`BlockDevice`], the hosted stand-in for the teacher's
//! `virtio_disk` driver. Used by tests and by anything that wants a
//! disposable file system without a real disk underneath.

use std::sync::Mutex;

use crate::hal::BlockDevice;
use crate::param::BSIZE;

pub struct RamDisk {
    blocks: Mutex<Vec<[u8; BSIZE]>>,
}

impl RamDisk {
    pub fn new(nblocks: u32) -> Self {
        Self {
            blocks: Mutex::new(vec![[0u8; BSIZE]; nblocks as usize]),
        }
    }

    pub fn len_blocks(&self) -> u32 {
        self.blocks.lock().unwrap().len() as u32
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, _dev: u32, bno: u32, out: &mut [u8; BSIZE]) {
        let blocks = self.blocks.lock().unwrap();
        *out = blocks[bno as usize];
    }

    fn write_block(&self, _dev: u32, bno: u32, data: &[u8; BSIZE]) {
        let mut blocks = self.blocks.lock().unwrap();
        blocks[bno as usize] = *data;
    }
}
