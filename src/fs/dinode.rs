//! On-disk inode layout (spec §3, §6).

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::param::NADDRS;

/// Raw on-disk type tag. Kept as a bare `u16` (rather than an enum) so
/// the struct can be decoded byte-for-byte with `zerocopy`; callers
/// convert through [`InodeType`].
pub const T_FREE: u16 = 0;
pub const T_FILE: u16 = 1;
pub const T_DIR: u16 = 2;
pub const T_DEVICE: u16 = 3;
pub const T_SYMLINK: u16 = 4;

/// Interpreted form of a [`Dinode`]'s `typ` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
    Free,
    File,
    Dir,
    Device,
    Symlink,
}

impl InodeType {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            T_FREE => InodeType::Free,
            T_FILE => InodeType::File,
            T_DIR => InodeType::Dir,
            T_DEVICE => InodeType::Device,
            T_SYMLINK => InodeType::Symlink,
            other => panic!("corrupt inode: unknown on-disk type {other}"),
        }
    }

    pub fn to_raw(self) -> u16 {
        match self {
            InodeType::Free => T_FREE,
            InodeType::File => T_FILE,
            InodeType::Dir => T_DIR,
            InodeType::Device => T_DEVICE,
            InodeType::Symlink => T_SYMLINK,
        }
    }
}

/// 64-byte on-disk inode; `IPB = BSIZE / size_of::<Dinode>()` inodes per block.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct Dinode {
    pub typ: u16,
    pub major: u16,
    pub minor: u16,
    pub nlink: u16,
    pub size: u32,
    pub addrs: [u32; NADDRS],
}

const_assert!(core::mem::size_of::<Dinode>() == 64);

impl Dinode {
    pub const fn free() -> Self {
        Self {
            typ: T_FREE,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; NADDRS],
        }
    }
}
