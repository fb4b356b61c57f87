//! Named POSIX semaphores.
//!
//! A [`Semaphore`] is a kernel-named, one-shot binary lock shared between
//! processes. The owner creates the object with an initial count of 1 and
//! unlinks it on drop; non-owners open the existing object and only close
//! their handle. [`Semaphore::post`] clamps the count at 1, so two posts
//! without an intervening wait collapse into one: the semaphore models a
//! mutex, not a counter.
//!
//! Construction never fails. An invalid name or a failed `sem_open` is
//! logged and leaves the handle inert; `wait` and `post` on an inert handle
//! are no-ops. Callers that need to know use [`Semaphore::exists`] first.

use std::ffi::CString;
use std::io;
use std::ptr;

use tracing::error;

use crate::error::{validate_name, IpcError, Result};

const RESOURCE: &str = "semaphore";

/// A named cross-process binary semaphore.
pub struct Semaphore {
    name: String,
    is_owner: bool,
    sem: *mut libc::sem_t,
}

// The handle wraps a kernel object; sem_wait/sem_post are thread-safe.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// Probe whether a semaphore named `name` currently exists.
    ///
    /// The result can be stale the moment it returns: a concurrently
    /// dropping owner may unlink the object right after the probe.
    pub fn exists(name: &str) -> Result<()> {
        validate_name(RESOURCE, name)?;
        let named = name_cstring(name)?;

        let sem = unsafe { libc::sem_open(named.as_ptr(), libc::O_RDONLY) };
        if sem == libc::SEM_FAILED {
            return Err(IpcError::last_os("semaphore open error"));
        }
        unsafe { libc::sem_close(sem) };
        Ok(())
    }

    /// Create (owner) or open (non-owner) the semaphore named `name`.
    ///
    /// The owner unlinks any stale object of the same name first and
    /// creates the new one with an initial count of 1.
    pub fn new(name: &str, is_owner: bool) -> Self {
        let mut handle = Self {
            name: name.to_string(),
            is_owner,
            sem: ptr::null_mut(),
        };

        let named = match validate_name(RESOURCE, name).and_then(|_| name_cstring(name)) {
            Ok(named) => named,
            Err(e) => {
                error!("semaphore creation error [{}]", e);
                return handle;
            }
        };

        if is_owner {
            unsafe { libc::sem_unlink(named.as_ptr()) };
        }

        let sem = unsafe {
            if is_owner {
                libc::sem_open(
                    named.as_ptr(),
                    libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                    (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint,
                    1 as libc::c_uint,
                )
            } else {
                libc::sem_open(named.as_ptr(), libc::O_RDWR)
            }
        };

        if sem == libc::SEM_FAILED {
            error!(
                "semaphore creation error [{}]",
                io::Error::last_os_error()
            );
            return handle;
        }

        handle.sem = sem;
        handle
    }

    /// The semaphore's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until the count is positive, then decrement it.
    ///
    /// No-op on an inert handle. Ties between concurrent waiters are
    /// resolved by the OS scheduler, without fairness.
    pub fn wait(&self) {
        if self.sem.is_null() {
            return;
        }
        loop {
            let ret = unsafe { libc::sem_wait(self.sem) };
            if ret == 0 {
                return;
            }
            if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                return;
            }
        }
    }

    /// Increment the count, but only when it is currently below 1.
    ///
    /// No-op on an inert handle.
    pub fn post(&self) {
        if self.sem.is_null() {
            return;
        }
        let mut value: libc::c_int = 0;
        unsafe {
            libc::sem_getvalue(self.sem, &mut value);
            if value < 1 {
                libc::sem_post(self.sem);
            }
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        if self.sem.is_null() {
            return;
        }
        unsafe {
            libc::sem_close(self.sem);
            if self.is_owner {
                if let Ok(named) = name_cstring(&self.name) {
                    libc::sem_unlink(named.as_ptr());
                }
            }
        }
    }
}

fn name_cstring(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| IpcError::InvalidName {
        resource: RESOURCE,
        name: name.to_string(),
        reason: "embedded nul byte",
    })
}
