//! Process-shared synchronization primitives that live inside the mapped
//! region itself.
//!
//! Both types are thin wrappers over the POSIX objects (`pthread_mutex_t`
//! with `PTHREAD_PROCESS_SHARED`, and an unnamed `sem_t` with `pshared = 1`).
//! They are never constructed by value: the server initializes them in place
//! inside a zeroed region, and every attached process uses them through a
//! shared reference into that region.

use crate::error::SyncError;
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::time::Duration;

/// Mutual-exclusion lock usable across unrelated processes.
#[repr(transparent)]
pub struct ShmMutex(UnsafeCell<libc::pthread_mutex_t>);

unsafe impl Send for ShmMutex {}
unsafe impl Sync for ShmMutex {}

impl ShmMutex {
    /// Initializes the mutex in place.
    ///
    /// # Safety
    ///
    /// `this` must point to writable memory large enough for a `ShmMutex` that
    /// no other thread or process is using yet.
    pub(crate) unsafe fn init(this: *mut ShmMutex) -> Result<(), SyncError> {
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            let rc = libc::pthread_mutexattr_init(&mut attr);
            if rc != 0 {
                return Err(SyncError::from_code("pthread_mutexattr_init", rc));
            }

            let rc = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            if rc != 0 {
                libc::pthread_mutexattr_destroy(&mut attr);
                return Err(SyncError::from_code("pthread_mutexattr_setpshared", rc));
            }

            let rc = libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
            if rc != 0 {
                libc::pthread_mutexattr_destroy(&mut attr);
                return Err(SyncError::from_code("pthread_mutexattr_setrobust", rc));
            }

            let rc = libc::pthread_mutex_init(this.cast::<libc::pthread_mutex_t>(), &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
            if rc != 0 {
                return Err(SyncError::from_code("pthread_mutex_init", rc));
            }
        }
        Ok(())
    }

    /// Blocks until the lock is held by the caller.
    ///
    /// The mutex is robust: if its holder died, this returns `EOWNERDEAD`
    /// and every later call `ENOTRECOVERABLE`. The state it guarded may be
    /// half-written, so it is never marked consistent again.
    pub fn lock(&self) -> Result<ShmMutexGuard<'_>, SyncError> {
        let rc = unsafe { libc::pthread_mutex_lock(self.0.get()) };
        if rc == libc::EOWNERDEAD {
            unsafe { libc::pthread_mutex_unlock(self.0.get()) };
            return Err(SyncError::from_code("pthread_mutex_lock", rc));
        }
        if rc != 0 {
            return Err(SyncError::from_code("pthread_mutex_lock", rc));
        }
        Ok(ShmMutexGuard {
            mutex: self,
            locked: true,
            _not_send: PhantomData,
        })
    }

    /// # Safety
    ///
    /// No process may use the mutex afterwards.
    pub(crate) unsafe fn destroy(&self) {
        unsafe {
            libc::pthread_mutex_destroy(self.0.get());
        }
    }
}

/// Holds a [`ShmMutex`]; the lock is released on drop or by [`ShmMutexGuard::unlock`].
pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
    locked: bool,
    // pthread mutexes must be unlocked by the thread that locked them
    _not_send: PhantomData<*const ()>,
}

impl ShmMutexGuard<'_> {
    /// Releases the lock, reporting a failed unlock instead of panicking.
    pub fn unlock(mut self) -> Result<(), SyncError> {
        self.locked = false;
        let rc = unsafe { libc::pthread_mutex_unlock(self.mutex.0.get()) };
        if rc != 0 {
            return Err(SyncError::from_code("pthread_mutex_unlock", rc));
        }
        Ok(())
    }
}

impl Drop for ShmMutexGuard<'_> {
    /// # Panics
    ///
    /// Panics if the unlock fails. Other processes would otherwise block on the
    /// lock forever, so this is treated as unrecoverable.
    fn drop(&mut self) {
        if self.locked {
            let rc = unsafe { libc::pthread_mutex_unlock(self.mutex.0.get()) };
            if rc != 0 {
                panic!(
                    "pthread_mutex_unlock failed: {}",
                    std::io::Error::from_raw_os_error(rc)
                );
            }
        }
    }
}

/// Counting semaphore usable across unrelated processes.
#[repr(transparent)]
pub struct ShmSemaphore(UnsafeCell<libc::sem_t>);

unsafe impl Send for ShmSemaphore {}
unsafe impl Sync for ShmSemaphore {}

impl ShmSemaphore {
    /// Initializes the semaphore in place with the given count.
    ///
    /// # Safety
    ///
    /// Same requirements as [`ShmMutex::init`].
    pub(crate) unsafe fn init(this: *mut ShmSemaphore, value: u32) -> Result<(), SyncError> {
        if unsafe { libc::sem_init(this.cast::<libc::sem_t>(), 1, value) } == -1 {
            return Err(SyncError::last_os_error("sem_init"));
        }
        Ok(())
    }

    pub fn post(&self) -> Result<(), SyncError> {
        if unsafe { libc::sem_post(self.0.get()) } == -1 {
            return Err(SyncError::last_os_error("sem_post"));
        }
        Ok(())
    }

    /// Blocks until the count is positive, then decrements it.
    ///
    /// Interrupted waits are restarted.
    pub fn wait(&self) -> Result<(), SyncError> {
        loop {
            if unsafe { libc::sem_wait(self.0.get()) } == 0 {
                return Ok(());
            }
            let err = SyncError::last_os_error("sem_wait");
            if err.source.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }

    /// Like [`ShmSemaphore::wait`] but gives up after `timeout`.
    ///
    /// Returns `Ok(false)` when the timeout expires or a signal interrupts the
    /// wait, so the caller gets a chance to re-check its own state.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, SyncError> {
        let deadline = realtime_deadline(timeout)?;
        if unsafe { libc::sem_timedwait(self.0.get(), &deadline) } == 0 {
            return Ok(true);
        }
        let err = SyncError::last_os_error("sem_timedwait");
        match err.source.raw_os_error() {
            Some(libc::ETIMEDOUT) | Some(libc::EINTR) => Ok(false),
            _ => Err(err),
        }
    }

    /// Decrements the count if it is positive, without blocking.
    pub fn try_wait(&self) -> Result<bool, SyncError> {
        if unsafe { libc::sem_trywait(self.0.get()) } == 0 {
            return Ok(true);
        }
        let err = SyncError::last_os_error("sem_trywait");
        match err.source.raw_os_error() {
            Some(libc::EAGAIN) => Ok(false),
            _ => Err(err),
        }
    }

    pub fn value(&self) -> Result<i32, SyncError> {
        let mut value: libc::c_int = 0;
        if unsafe { libc::sem_getvalue(self.0.get(), &mut value) } == -1 {
            return Err(SyncError::last_os_error("sem_getvalue"));
        }
        Ok(value)
    }

    /// # Safety
    ///
    /// No process may use the semaphore afterwards.
    pub(crate) unsafe fn destroy(&self) {
        unsafe {
            libc::sem_destroy(self.0.get());
        }
    }
}

/// `sem_timedwait` takes an absolute `CLOCK_REALTIME` deadline.
fn realtime_deadline(timeout: Duration) -> Result<libc::timespec, SyncError> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } == -1 {
        return Err(SyncError::last_os_error("clock_gettime"));
    }

    let mut sec = now.tv_sec + timeout.as_secs() as libc::time_t;
    let mut nsec = now.tv_nsec + timeout.subsec_nanos() as libc::c_long;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    Ok(libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    })
}
