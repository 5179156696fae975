/*
 * Copyright 2025 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! Shared/exclusive lock serializing external requests against layer
//! topology changes.
//!
//! Requests take the lock shared; snapshot creation and deletion take it
//! exclusive. The lock is writer-preferring so a pending snapshot deletion
//! cannot be starved by a stream of readers.

use std::cell::UnsafeCell;

/// `glibc`'s `PTHREAD_RWLOCK_PREFER_WRITER_NONRECURSIVE_NP`, not exposed by the
/// `libc` crate for this target.
const PTHREAD_RWLOCK_PREFER_WRITER_NONRECURSIVE_NP: libc::c_int = 2;

/// A writer-preferring readers-writer lock with explicit unlock.
///
/// Unlike `std::sync::RwLock`, acquisition and release are not tied to a
/// guard's lifetime: a layer is locked when a request starts and unlocked
/// when it completes, potentially on a different call path.
pub struct RwLock {
    /// The underlying pthread lock, boxed so the structure stays movable
    /// after initialization.
    lock: Box<UnsafeCell<libc::pthread_rwlock_t>>,
}

unsafe impl Send for RwLock {}
unsafe impl Sync for RwLock {}

impl std::fmt::Debug for RwLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwLock").finish_non_exhaustive()
    }
}

impl RwLock {
    pub fn new() -> Self {
        let lock = Box::new(UnsafeCell::new(libc::PTHREAD_RWLOCK_INITIALIZER));
        unsafe {
            let mut attr: libc::pthread_rwlockattr_t = std::mem::zeroed();
            libc::pthread_rwlockattr_init(&mut attr);
            libc::pthread_rwlockattr_setkind_np(
                &mut attr,
                PTHREAD_RWLOCK_PREFER_WRITER_NONRECURSIVE_NP,
            );
            libc::pthread_rwlock_init(lock.get(), &attr);
            libc::pthread_rwlockattr_destroy(&mut attr);
        }
        Self { lock }
    }

    /// Acquires the lock in shared mode, blocking until available.
    pub fn read_lock(&self) {
        unsafe {
            libc::pthread_rwlock_rdlock(self.lock.get());
        }
    }

    /// Acquires the lock in exclusive mode, blocking until available.
    pub fn write_lock(&self) {
        unsafe {
            libc::pthread_rwlock_wrlock(self.lock.get());
        }
    }

    /// Releases the lock, whichever mode it is held in.
    pub fn unlock(&self) {
        unsafe {
            libc::pthread_rwlock_unlock(self.lock.get());
        }
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RwLock {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_rwlock_destroy(self.lock.get());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn shared_readers_run_in_parallel() {
        let lock = Arc::new(RwLock::new());
        let readers = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                let readers = readers.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    lock.read_lock();
                    let n = readers.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(n, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(50));
                    readers.fetch_sub(1, Ordering::SeqCst);
                    lock.unlock();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = Arc::new(RwLock::new());
        let value = Arc::new(AtomicU32::new(0));

        lock.write_lock();
        let reader = {
            let lock = lock.clone();
            let value = value.clone();
            thread::spawn(move || {
                lock.read_lock();
                let v = value.load(Ordering::SeqCst);
                lock.unlock();
                v
            })
        };
        thread::sleep(Duration::from_millis(50));
        value.store(1, Ordering::SeqCst);
        lock.unlock();
        // The reader must observe the write made while the lock was held
        assert_eq!(reader.join().unwrap(), 1);
    }

    #[test]
    fn unlock_fully_releases_both_modes() {
        let lock = RwLock::new();
        lock.read_lock();
        lock.unlock();
        lock.write_lock();
        lock.unlock();
        lock.read_lock();
        lock.unlock();
    }
}
