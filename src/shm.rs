//! Named shared memory with embedded locking.
//!
//! A [`SharedMemory`] region pairs a POSIX shared memory object with a
//! [`Semaphore`] created under the same name, so one name identifies both
//! the bytes and their lock and the two are created and destroyed together.
//! [`SharedLock`] brackets typed access: it waits on the semaphore when
//! built, dereferences to the mapped value, and posts on drop.
//!
//! [`SharedMemoryContext`] caches regions by name and owns every region it
//! hands out; binding a name twice returns the first region instead of
//! creating a second mapping.
//!
//! # Thread Safety
//!
//! Regions are `Send + Sync`; the paired semaphore is the mutual exclusion
//! token for the mapped bytes, in this process and across processes alike.
//! All access must go through [`SharedLock`] or a manual
//! [`SharedMemory::wait`]/[`SharedMemory::post`] bracket.

use std::collections::HashMap;
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use tracing::error;

use crate::error::{validate_name, IpcError, Result};
use crate::semaphore::Semaphore;

const RESOURCE: &str = "shared memory";

/// Marker for types that may live in shared memory.
///
/// # Safety
///
/// Implementors must be trivially copyable with every bit pattern valid:
/// no references, no pointers into this process, no padding whose content
/// matters, no drop logic. `#[repr(C)]` structs of such fields qualify.
pub unsafe trait Plain: Copy {}

unsafe impl Plain for u8 {}
unsafe impl Plain for i8 {}
unsafe impl Plain for u16 {}
unsafe impl Plain for i16 {}
unsafe impl Plain for u32 {}
unsafe impl Plain for i32 {}
unsafe impl Plain for u64 {}
unsafe impl Plain for i64 {}
unsafe impl Plain for f32 {}
unsafe impl Plain for f64 {}

struct Mapping {
    ptr: NonNull<c_void>,
    size: usize,
}

/// A named shared memory region with its paired semaphore.
pub struct SharedMemory {
    name: String,
    is_owner: bool,
    map: Option<Mapping>,
    semaphore: Option<Semaphore>,
}

// The mapping is MAP_SHARED memory guarded by the paired semaphore.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Probe whether a region named `name` currently exists.
    ///
    /// The result can be stale the moment it returns: an owner dropping
    /// concurrently may unlink the object right after the probe. Callers
    /// that need certainty must own the region or synchronize externally.
    pub fn exists(name: &str) -> Result<()> {
        validate_name(RESOURCE, name)?;
        let fd = shm_open(name, OFlag::O_RDONLY, Mode::S_IRUSR)
            .map_err(|e| os_error("shared memory open error", e))?;
        drop(fd);
        Ok(())
    }

    /// Create (owner) or open (non-owner) the region named `name`.
    ///
    /// The owner unlinks any stale object first, creates the new one and
    /// sizes it to `size` bytes; a non-owner opens the region as it is. The
    /// mapping is read/write and shared. The paired semaphore is created
    /// with the same name and the same owner flag.
    ///
    /// Construction never fails: errors are logged and the handle is left
    /// inert, with `wait`/`post` as no-ops and [`SharedLock`] reporting
    /// `NotFound`.
    pub fn new(name: &str, size: usize, is_owner: bool) -> Self {
        let mut region = Self {
            name: name.to_string(),
            is_owner,
            map: None,
            semaphore: None,
        };

        if let Err(e) = validate_name(RESOURCE, name) {
            error!("shared memory creation error [{}]", e);
            return region;
        }
        let Some(len) = NonZeroUsize::new(size) else {
            error!("shared memory creation error [size is 0]");
            return region;
        };

        if is_owner {
            let _ = shm_unlink(name);
        }

        let flags = if is_owner {
            OFlag::O_CREAT | OFlag::O_RDWR | OFlag::O_EXCL
        } else {
            OFlag::O_RDWR
        };
        let fd = match shm_open(name, flags, Mode::S_IRUSR | Mode::S_IWUSR) {
            Ok(fd) => fd,
            Err(e) => {
                error!("shared memory creation error [{}]", e);
                return region;
            }
        };

        if is_owner {
            if let Err(e) = ftruncate(&fd, size as libc::off_t) {
                error!("shared memory data truncate error [{}]", e);
            }
        }

        let ptr = match unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        } {
            Ok(ptr) => ptr,
            Err(e) => {
                error!("shared memory map error [{}]", e);
                return region;
            }
        };

        region.map = Some(Mapping { ptr, size });
        region.semaphore = Some(Semaphore::new(name, is_owner));
        region
    }

    /// The region's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The mapped size in bytes, 0 when inert.
    pub fn size(&self) -> usize {
        self.map.as_ref().map_or(0, |m| m.size)
    }

    /// Acquire the paired semaphore. No-op on an inert region.
    pub fn wait(&self) {
        if self.map.is_some() {
            if let Some(sem) = &self.semaphore {
                sem.wait();
            }
        }
    }

    /// Release the paired semaphore. No-op on an inert region.
    pub fn post(&self) {
        if self.map.is_some() {
            if let Some(sem) = &self.semaphore {
                sem.post();
            }
        }
    }

    /// Lock the region and view it as a `T`.
    pub fn lock<T: Plain>(&self) -> Result<SharedLock<'_, T>> {
        SharedLock::new(self)
    }

    fn data_ptr<T: Plain>(&self) -> Result<NonNull<T>> {
        let Some(map) = &self.map else {
            return Err(IpcError::NotFound {
                resource: RESOURCE,
                name: self.name.clone(),
            });
        };
        let need = std::mem::size_of::<T>();
        if map.size < need {
            return Err(IpcError::RegionTooSmall {
                need,
                have: map.size,
            });
        }
        Ok(map.ptr.cast::<T>())
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        if let Some(map) = self.map.take() {
            if let Err(e) = unsafe { munmap(map.ptr, map.size) } {
                error!("shared memory unmap error [{}]", e);
            }
            if self.is_owner {
                let _ = shm_unlink(self.name.as_str());
            }
        }
    }
}

fn os_error(context: &'static str, errno: nix::errno::Errno) -> IpcError {
    IpcError::Os {
        context,
        source: std::io::Error::from_raw_os_error(errno as i32),
    }
}

/// Scoped lock over a [`SharedMemory`] region viewed as a `T`.
///
/// Construction waits on the region's semaphore; drop posts it, optionally
/// yielding the CPU afterwards so a peer blocked on the same lock gets a
/// chance to run.
///
/// ```rust,ignore
/// let mut guard = SharedLock::<u64>::new(&region)?;
/// *guard += 1;
/// ```
pub struct SharedLock<'a, T: Plain> {
    memory: &'a SharedMemory,
    data: NonNull<T>,
    yield_on_unlock: bool,
}

impl<'a, T: Plain> SharedLock<'a, T> {
    /// Lock `memory` for the guard's lifetime.
    pub fn new(memory: &'a SharedMemory) -> Result<Self> {
        Self::build(memory, false)
    }

    /// Like [`new`], and additionally yield the CPU after unlocking.
    ///
    /// [`new`]: SharedLock::new
    pub fn with_yield(memory: &'a SharedMemory) -> Result<Self> {
        Self::build(memory, true)
    }

    fn build(memory: &'a SharedMemory, yield_on_unlock: bool) -> Result<Self> {
        let data = memory.data_ptr::<T>()?;
        memory.wait();
        Ok(Self {
            memory,
            data,
            yield_on_unlock,
        })
    }
}

impl<T: Plain> Deref for SharedLock<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.data.as_ref() }
    }
}

impl<T: Plain> DerefMut for SharedLock<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.data.as_mut() }
    }
}

impl<T: Plain> Drop for SharedLock<'_, T> {
    fn drop(&mut self) {
        self.memory.post();
        if self.yield_on_unlock {
            std::thread::yield_now();
        }
    }
}

/// An owning cache of shared memory regions, keyed by name.
#[derive(Default)]
pub struct SharedMemoryContext {
    regions: HashMap<String, SharedMemory>,
}

impl SharedMemoryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a region sized for `T`.
    ///
    /// A name bound before returns the cached region. Otherwise an owner
    /// creates the region; a non-owner probes for it first and gets `None`
    /// while it does not exist yet (the probe repeats on the next call, so
    /// a late-starting owner is picked up). Returned regions stay owned by
    /// the context and die with it.
    pub fn bind<T: Plain>(&mut self, name: &str, is_owner: bool) -> Option<&SharedMemory> {
        self.bind_sized(name, std::mem::size_of::<T>(), is_owner)
    }

    /// Bind a region of an explicit byte size.
    pub fn bind_sized(&mut self, name: &str, size: usize, is_owner: bool) -> Option<&SharedMemory> {
        if !self.regions.contains_key(name) {
            if !is_owner && SharedMemory::exists(name).is_err() {
                return None;
            }
            self.regions
                .insert(name.to_string(), SharedMemory::new(name, size, is_owner));
        }
        self.regions.get(name)
    }
}
