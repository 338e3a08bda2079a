//! Process-shared mutex and condition variable.
//!
//! These wrap `libc::pthread_mutex_t` / `libc::pthread_cond_t` with the
//! `PTHREAD_PROCESS_SHARED` attribute so that independent processes
//! mapping the same segment can lock/wait/signal through ordinary
//! memory rather than a kernel object keyed by fd. Per §9, the mutex
//! is deliberately non-robust: a writer that crashes while holding it
//! wedges the topic until an administrator unlinks the segment. A
//! robust-mutex mode is a known limitation, not part of this crate.
//!
//! Both types are `#[repr(C)]` and meant to be placed directly inside
//! a `#[repr(C)]` header mapped over shared memory; they must be
//! initialized in place with [`SharedMutex::init_in_place`] /
//! [`SharedCondvar::init_in_place`] exactly once, under the lazy-init
//! CAS gate in `ring.rs`. Initializing them twice corrupts the
//! underlying pthread primitive.

use std::cell::UnsafeCell;
use std::io;
use std::time::Duration;

/// A `pthread_mutex_t` configured with `PTHREAD_PROCESS_SHARED`,
/// suitable for embedding in a shared-memory header.
#[repr(C)]
pub struct SharedMutex {
    raw: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: the pthread mutex itself provides the synchronization; the
// Rust type is just a typed view over it.
unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    /// Initialize a process-shared mutex in place.
    ///
    /// # Safety
    ///
    /// - `this` must point to valid, writable memory for a `SharedMutex`.
    /// - Must be called exactly once per segment, by the single winner
    ///   of the lazy-init CAS race, before any other party reads the
    ///   `initialized` flag as `READY`.
    pub unsafe fn init_in_place(this: *mut SharedMutex) -> io::Result<()> {
        let raw = unsafe { (*this).raw.get() };
        let mut attr: libc::pthread_mutexattr_t = unsafe { std::mem::zeroed() };
        // SAFETY: `attr` is a valid, uninitialized attr object on the stack.
        check(unsafe { libc::pthread_mutexattr_init(&mut attr) })?;
        // SAFETY: `attr` was just initialized above.
        let pshared_result =
            unsafe { libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED) };
        if pshared_result != 0 {
            unsafe { libc::pthread_mutexattr_destroy(&mut attr) };
            return Err(io::Error::from_raw_os_error(pshared_result));
        }
        // SAFETY: `raw` points into caller-provided memory; `attr` is valid.
        let init_result = unsafe { libc::pthread_mutex_init(raw, &attr) };
        // SAFETY: `attr` is still valid; destroying it does not affect
        // the mutex it was used to initialize.
        unsafe { libc::pthread_mutexattr_destroy(&mut attr) };
        check(init_result)
    }

    /// Lock the mutex, blocking until it is available.
    pub fn lock(&self) -> SharedMutexGuard<'_> {
        // SAFETY: the mutex was initialized exactly once under the
        // lazy-init gate before this call could observe `READY`.
        let rc = unsafe { libc::pthread_mutex_lock(self.raw.get()) };
        debug_assert_eq!(rc, 0, "pthread_mutex_lock failed: {rc}");
        SharedMutexGuard { mutex: self }
    }

    /// Raw pointer to the condvar's companion mutex, for `pthread_cond_timedwait`.
    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.raw.get()
    }
}

/// RAII guard released on drop. Does not dereference to protected
/// data — callers use [`crate::ring::RingBuffer`]'s own methods while
/// holding the guard, the way the header's other fields (timestamps,
/// slots) are addressed by offset rather than by typed field.
pub struct SharedMutexGuard<'a> {
    mutex: &'a SharedMutex,
}

impl Drop for SharedMutexGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: this guard is only constructed after a successful lock.
        let rc = unsafe { libc::pthread_mutex_unlock(self.mutex.raw.get()) };
        debug_assert_eq!(rc, 0, "pthread_mutex_unlock failed: {rc}");
    }
}

/// A `pthread_cond_t` configured with `PTHREAD_PROCESS_SHARED` and a
/// `CLOCK_MONOTONIC` wait clock.
#[repr(C)]
pub struct SharedCondvar {
    raw: UnsafeCell<libc::pthread_cond_t>,
}

unsafe impl Send for SharedCondvar {}
unsafe impl Sync for SharedCondvar {}

impl SharedCondvar {
    /// Initialize a process-shared condition variable in place.
    ///
    /// # Safety
    ///
    /// Same contract as [`SharedMutex::init_in_place`].
    pub unsafe fn init_in_place(this: *mut SharedCondvar) -> io::Result<()> {
        let raw = unsafe { (*this).raw.get() };
        let mut attr: libc::pthread_condattr_t = unsafe { std::mem::zeroed() };
        // SAFETY: `attr` is a valid, uninitialized attr object on the stack.
        check(unsafe { libc::pthread_condattr_init(&mut attr) })?;
        // SAFETY: `attr` was just initialized above.
        let pshared_result =
            unsafe { libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED) };
        if pshared_result != 0 {
            unsafe { libc::pthread_condattr_destroy(&mut attr) };
            return Err(io::Error::from_raw_os_error(pshared_result));
        }
        #[cfg(target_os = "linux")]
        {
            // SAFETY: `attr` is valid; CLOCK_MONOTONIC is always supported on Linux.
            let clock_result =
                unsafe { libc::pthread_condattr_setclock(&mut attr, libc::CLOCK_MONOTONIC) };
            if clock_result != 0 {
                unsafe { libc::pthread_condattr_destroy(&mut attr) };
                return Err(io::Error::from_raw_os_error(clock_result));
            }
        }
        // SAFETY: `raw` points into caller-provided memory; `attr` is valid.
        let init_result = unsafe { libc::pthread_cond_init(raw, &attr) };
        // SAFETY: `attr` remains valid until destroyed here.
        unsafe { libc::pthread_condattr_destroy(&mut attr) };
        check(init_result)
    }

    /// Wait for a signal, with a timeout expressed in microseconds.
    ///
    /// Returns `true` if woken by [`SharedCondvar::notify_all`] (which
    /// includes spurious wakeups — callers must re-check their
    /// condition), `false` on timeout.
    pub fn wait_timeout(&self, guard: &SharedMutexGuard<'_>, timeout_micros: u64) -> bool {
        let deadline = deadline_from_now(timeout_micros);
        // SAFETY: `guard` proves the companion mutex is held by this
        // thread; `pthread_cond_timedwait` atomically releases it for
        // the duration of the wait and reacquires it before returning.
        let rc = unsafe {
            libc::pthread_cond_timedwait(self.raw.get(), guard.mutex.raw(), &deadline)
        };
        rc == 0
    }

    /// Wake every thread/process blocked in [`SharedCondvar::wait_timeout`].
    pub fn notify_all(&self) {
        // SAFETY: the condvar was initialized exactly once under the
        // lazy-init gate.
        unsafe {
            libc::pthread_cond_broadcast(self.raw.get());
        }
    }
}

#[cfg(target_os = "linux")]
fn deadline_from_now(timeout_micros: u64) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid, writable timespec.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now);
    }
    add_micros(now, timeout_micros)
}

#[cfg(not(target_os = "linux"))]
fn deadline_from_now(timeout_micros: u64) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid, writable timespec.
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
    }
    add_micros(now, timeout_micros)
}

fn add_micros(base: libc::timespec, micros: u64) -> libc::timespec {
    let add_sec = (micros / 1_000_000) as i64;
    let add_nsec = ((micros % 1_000_000) * 1_000) as i64;
    let mut tv_sec = base.tv_sec + add_sec;
    let mut tv_nsec = base.tv_nsec + add_nsec;
    if tv_nsec >= 1_000_000_000 {
        tv_nsec -= 1_000_000_000;
        tv_sec += 1;
    }
    libc::timespec { tv_sec, tv_nsec }
}

fn check(rc: i32) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    struct Pair {
        mutex: SharedMutex,
        cond: SharedCondvar,
    }

    fn new_pair() -> Box<Pair> {
        let mut uninit: Box<MaybeUninit<Pair>> = Box::new(MaybeUninit::uninit());
        let ptr = uninit.as_mut_ptr();
        unsafe {
            let mutex_ptr = std::ptr::addr_of_mut!((*ptr).mutex) as *mut SharedMutex;
            let cond_ptr = std::ptr::addr_of_mut!((*ptr).cond) as *mut SharedCondvar;
            SharedMutex::init_in_place(mutex_ptr).unwrap();
            SharedCondvar::init_in_place(cond_ptr).unwrap();
            Box::from_raw(Box::into_raw(uninit) as *mut Pair)
        }
    }

    #[test]
    fn lock_unlock_roundtrip() {
        let pair = new_pair();
        {
            let _guard = pair.mutex.lock();
        }
        let _guard = pair.mutex.lock();
    }

    #[test]
    fn wait_timeout_expires() {
        let pair = new_pair();
        let guard = pair.mutex.lock();
        let start = std::time::Instant::now();
        let woken = pair.cond.wait_timeout(&guard, 20_000);
        assert!(!woken);
        assert!(start.elapsed() >= StdDuration::from_micros(15_000));
    }

    #[test]
    fn notify_wakes_waiter() {
        let pair = Arc::new(new_pair());
        let pair2 = pair.clone();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(StdDuration::from_millis(20));
            let _guard = pair2.mutex.lock();
            pair2.cond.notify_all();
        });

        let guard = pair.mutex.lock();
        let woken = pair.cond.wait_timeout(&guard, 1_000_000);
        drop(guard);
        handle.join().unwrap();
        assert!(woken);
    }
}
