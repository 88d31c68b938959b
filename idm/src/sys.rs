// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! OS primitives for the development transport backend.
//!
//! A [`SharedRegion`] is a named POSIX shared-memory object mapped into this
//! process; a [`Notifier`] is a named POSIX semaphore. Both are keyed by
//! zone id (the transport layer picks the names), which is how two
//! processes attach to the same ring without descriptor passing. This is
//! the same shape a hypervisor backend gets from grant references and
//! event channels.

use std::ffi::CString;
use std::ptr::null_mut;

use crate::ring::RingMemory;
use crate::Errno;
use crate::IdmError;
use crate::Result;

fn cstring(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| IdmError::TransportInit(Errno::new(libc::EINVAL)))
}

/// A named shared-memory object mapped read/write into this process.
pub struct SharedRegion {
    addr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is plain memory; concurrent access discipline is the
// ring's concern, not the mapping's.
unsafe impl Send for SharedRegion {}

impl SharedRegion {
    /// Opens (creating if absent) the object `name` and maps `len` bytes of
    /// it. `name` must begin with `/`.
    pub fn open(name: &str, len: usize) -> Result<SharedRegion> {
        let cname = cstring(name)?;

        // SAFETY: cname is a valid NUL-terminated string and the flags are
        // constant.
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_RDWR | libc::O_CREAT,
                0o600 as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(IdmError::TransportInit(Errno::last()));
        }

        // SAFETY: fd is a valid descriptor owned by this function.
        let ret = unsafe { libc::ftruncate(fd, len as libc::off_t) };
        if ret < 0 {
            let err = Errno::last();
            // SAFETY: fd is valid and unused after this point.
            unsafe { libc::close(fd) };
            return Err(IdmError::TransportInit(err));
        }

        // SAFETY: the arguments describe a fresh shared mapping of a
        // descriptor we own; the result is checked before use.
        let addr = unsafe {
            libc::mmap(
                null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        // The descriptor is not needed once the mapping exists.
        // SAFETY: fd is valid and unused after this point.
        unsafe { libc::close(fd) };
        if addr == libc::MAP_FAILED {
            return Err(IdmError::TransportInit(Errno::last()));
        }

        Ok(SharedRegion {
            addr: addr as *mut u8,
            len,
        })
    }

    /// Removes the named object. Attached mappings stay valid until
    /// unmapped.
    pub fn unlink(name: &str) -> Result<()> {
        let cname = cstring(name)?;
        // SAFETY: cname is a valid NUL-terminated string.
        let ret = unsafe { libc::shm_unlink(cname.as_ptr()) };
        if ret < 0 {
            return Err(IdmError::SysError(Errno::last()));
        }
        Ok(())
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: addr/len describe a live mapping created in open().
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.len);
        }
    }
}

// SAFETY: the mapping is page-aligned, read/write, and lives until drop.
unsafe impl RingMemory for SharedRegion {
    fn base(&self) -> *mut u8 {
        self.addr
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// A named POSIX semaphore used as the cross-zone notification primitive.
pub struct Notifier {
    sem: *mut libc::sem_t,
}

// SAFETY: named semaphores are process- and thread-shareable by design.
unsafe impl Send for Notifier {}

impl Notifier {
    /// Opens (creating if absent, initially unsignalled) the semaphore
    /// `name`, which must begin with `/`.
    pub fn open(name: &str) -> Result<Notifier> {
        let cname = cstring(name)?;
        // SAFETY: cname is a valid NUL-terminated string; O_CREAT takes the
        // mode and initial value through varargs.
        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT,
                0o600 as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(IdmError::TransportInit(Errno::last()));
        }
        Ok(Notifier { sem })
    }

    /// Signals the owning zone that a message was published.
    pub fn post(&self) -> Result<()> {
        // SAFETY: sem is a live semaphore handle.
        let ret = unsafe { libc::sem_post(self.sem) };
        if ret < 0 {
            return Err(IdmError::SysError(Errno::last()));
        }
        Ok(())
    }

    /// Waits for a signal. Negative `timeout_ms` blocks indefinitely, zero
    /// polls, positive bounds the wait. Expired waits return `TimedOut`.
    pub fn wait(&self, timeout_ms: i64) -> Result<()> {
        if timeout_ms < 0 {
            loop {
                // SAFETY: sem is a live semaphore handle.
                if unsafe { libc::sem_wait(self.sem) } == 0 {
                    return Ok(());
                }
                match Errno::last().errno() {
                    libc::EINTR => continue,
                    _ => return Err(IdmError::SysError(Errno::last())),
                }
            }
        }

        if timeout_ms == 0 {
            // SAFETY: sem is a live semaphore handle.
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return Ok(());
            }
            return match Errno::last().errno() {
                libc::EAGAIN => Err(IdmError::TimedOut),
                _ => Err(IdmError::SysError(Errno::last())),
            };
        }

        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: ts is a valid out-pointer.
        if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) } < 0 {
            return Err(IdmError::SysError(Errno::last()));
        }
        ts.tv_sec += (timeout_ms / 1000) as libc::time_t;
        ts.tv_nsec += ((timeout_ms % 1000) * 1_000_000) as libc::c_long;
        if ts.tv_nsec >= 1_000_000_000 {
            ts.tv_sec += 1;
            ts.tv_nsec -= 1_000_000_000;
        }

        loop {
            // SAFETY: sem is live and ts is a valid absolute deadline.
            if unsafe { libc::sem_timedwait(self.sem, &ts) } == 0 {
                return Ok(());
            }
            match Errno::last().errno() {
                libc::EINTR => continue,
                libc::ETIMEDOUT => return Err(IdmError::TimedOut),
                _ => return Err(IdmError::SysError(Errno::last())),
            }
        }
    }

    /// Removes the named semaphore. Open handles stay valid until closed.
    pub fn unlink(name: &str) -> Result<()> {
        let cname = cstring(name)?;
        // SAFETY: cname is a valid NUL-terminated string.
        let ret = unsafe { libc::sem_unlink(cname.as_ptr()) };
        if ret < 0 {
            return Err(IdmError::SysError(Errno::last()));
        }
        Ok(())
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        // SAFETY: sem is a live semaphore handle opened in open().
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;
    use std::time::Instant;

    use super::*;

    static NAME_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn unique_name(tag: &str) -> String {
        format!(
            "/idm_sys_test_{}_{}_{}",
            std::process::id(),
            tag,
            NAME_COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn shared_region_maps_and_persists_writes() {
        let name = unique_name("shm");
        let region = SharedRegion::open(&name, 8192).unwrap();
        // SAFETY: the mapping spans 8192 writable bytes.
        unsafe {
            *region.base() = 0xab;
            *region.base().add(8191) = 0xcd;
        }

        // A second attachment of the same object sees the bytes.
        let peer = SharedRegion::open(&name, 8192).unwrap();
        // SAFETY: as above.
        unsafe {
            assert_eq!(*peer.base(), 0xab);
            assert_eq!(*peer.base().add(8191), 0xcd);
        }

        drop(region);
        drop(peer);
        SharedRegion::unlink(&name).unwrap();
    }

    #[test]
    fn notifier_poll_and_post() {
        let name = unique_name("sem");
        let notifier = Notifier::open(&name).unwrap();

        assert!(matches!(notifier.wait(0), Err(IdmError::TimedOut)));
        notifier.post().unwrap();
        notifier.wait(0).unwrap();

        drop(notifier);
        Notifier::unlink(&name).unwrap();
    }

    #[test]
    fn notifier_timed_wait_expires() {
        let name = unique_name("sem");
        let notifier = Notifier::open(&name).unwrap();

        let start = Instant::now();
        assert!(matches!(notifier.wait(50), Err(IdmError::TimedOut)));
        assert!(start.elapsed() >= Duration::from_millis(40));

        drop(notifier);
        Notifier::unlink(&name).unwrap();
    }

    #[test]
    fn notifier_wakes_cross_thread() {
        let name = unique_name("sem");
        let waiter = Notifier::open(&name).unwrap();
        let poster = Notifier::open(&name).unwrap();

        let handle = thread::spawn(move || waiter.wait(5000));
        thread::sleep(Duration::from_millis(10));
        poster.post().unwrap();
        handle.join().unwrap().unwrap();

        drop(poster);
        Notifier::unlink(&name).unwrap();
    }
}
