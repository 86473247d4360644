#![forbid(unsafe_code)]
//! Volume lock: the OS-supplied lock hooks plus owner tracking.
//!
//! Every public [`Volume`](crate::Volume) entry point takes the lock exactly
//! once. Internals run on a [`Locked`] token, so a non-locking internal can
//! only be reached from a section that already holds the lock. Entering
//! again from the owning thread fails with [`DnxError::Reentrant`] instead
//! of deadlocking.

use dnx_error::{DnxError, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::trace;

/// Lock and unlock hooks supplied at mount time.
///
/// `lock` blocks until the calling thread owns the lock; `unlock` is only
/// called by the owner.
pub trait OsLock: Send + Sync {
    fn lock(&self);
    fn unlock(&self);
}

/// Default [`OsLock`]: a flag guarded by a mutex with a condition variable
/// for waiters.
#[derive(Debug, Default)]
pub struct CondvarLock {
    locked: Mutex<bool>,
    released: Condvar,
}

impl OsLock for CondvarLock {
    fn lock(&self) {
        let mut locked = self.locked.lock();
        while *locked {
            self.released.wait(&mut locked);
        }
        *locked = true;
    }

    fn unlock(&self) {
        let mut locked = self.locked.lock();
        *locked = false;
        drop(locked);
        self.released.notify_one();
    }
}

pub(crate) struct VolumeLock {
    os: Arc<dyn OsLock>,
    owner: Mutex<Option<ThreadId>>,
}

impl std::fmt::Debug for VolumeLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeLock")
            .field("owner", &*self.owner.lock())
            .finish_non_exhaustive()
    }
}

impl VolumeLock {
    pub(crate) fn new(os: Arc<dyn OsLock>) -> Self {
        Self {
            os,
            owner: Mutex::new(None),
        }
    }

    pub(crate) fn acquire(&self) -> Result<LockToken<'_>> {
        let me = thread::current().id();
        if *self.owner.lock() == Some(me) {
            return Err(DnxError::Reentrant);
        }
        self.os.lock();
        *self.owner.lock() = Some(me);
        trace!("volume_lock");
        Ok(LockToken { lock: self })
    }

    #[cfg(test)]
    pub(crate) fn is_held(&self) -> bool {
        self.owner.lock().is_some()
    }
}

/// Proof that the volume lock is held; unlocks on drop.
pub(crate) struct LockToken<'a> {
    lock: &'a VolumeLock,
}

impl Drop for LockToken<'_> {
    fn drop(&mut self) {
        *self.lock.owner.lock() = None;
        self.lock.os.unlock();
        trace!("volume_unlock");
    }
}

/// A volume whose lock is held. All non-locking internals hang off this.
pub(crate) struct Locked<'v> {
    pub(crate) vol: &'v crate::Volume,
    _token: LockToken<'v>,
}

impl<'v> Locked<'v> {
    pub(crate) fn new(vol: &'v crate::Volume, token: LockToken<'v>) -> Self {
        Self { vol, _token: token }
    }

    pub(crate) fn fs(&self) -> &'v dnx_inode::Ext2Fs {
        &self.vol.fs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingLock {
        inner: CondvarLock,
        locks: AtomicUsize,
        unlocks: AtomicUsize,
    }

    impl OsLock for CountingLock {
        fn lock(&self) {
            self.inner.lock();
            self.locks.fetch_add(1, Ordering::SeqCst);
        }

        fn unlock(&self) {
            self.unlocks.fetch_add(1, Ordering::SeqCst);
            self.inner.unlock();
        }
    }

    #[test]
    fn nested_acquire_on_same_thread_is_reentrant() {
        let lock = VolumeLock::new(Arc::new(CondvarLock::default()));
        let token = lock.acquire().unwrap();
        assert!(matches!(lock.acquire(), Err(DnxError::Reentrant)));
        drop(token);
        assert!(!lock.is_held());
        drop(lock.acquire().unwrap());
    }

    #[test]
    fn hooks_are_paired() {
        let os = Arc::new(CountingLock::default());
        let lock = VolumeLock::new(Arc::clone(&os) as Arc<dyn OsLock>);
        for _ in 0..3 {
            let token = lock.acquire().unwrap();
            assert!(lock.is_held());
            drop(token);
        }
        drop(lock.acquire().unwrap());
        drop(lock.acquire().unwrap());
        assert_eq!(os.locks.load(Ordering::SeqCst), 5);
        assert_eq!(os.unlocks.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn other_threads_wait_for_the_owner() {
        let lock = VolumeLock::new(Arc::new(CondvarLock::default()));
        let counter = Mutex::new(0_u32);
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..100 {
                        let _token = lock.acquire().unwrap();
                        let value = *counter.lock();
                        thread::yield_now();
                        *counter.lock() = value + 1;
                    }
                });
            }
        });
        assert_eq!(*counter.lock(), 400);
        assert!(!lock.is_held());
    }
}
