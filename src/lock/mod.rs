//! Lock flavors used throughout the storage core.
//!
//! Two flavors, per spec §5: a non-sleeping **spinlock** held only
//! across short critical sections, and a **sleeplock** that may block
//! the caller, used for buffers and inodes. A third, **sleepablelock**,
//! is a short critical section that can additionally park a caller
//! until woken -- the log's coordinator state needs exactly that.
//!
//! See `SPEC_FULL.md` for why these map onto `spin::Mutex` and
//! `std::sync::{Mutex, Condvar}` respectively instead of the teacher's
//! own interrupt-disabling / scheduler-coupled primitives.

mod sleepablelock;
mod sleeplock;
mod spinlock;

pub use sleepablelock::{Sleepablelock, SleepablelockGuard};
pub use sleeplock::{Sleeplock, SleeplockGuard};
pub use spinlock::{Spinlock, SpinlockGuard};
