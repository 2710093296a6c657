//! Shared memory regions, identified by the file descriptor that backs them.
//!
//! A controller creates the region and hands its fd to the target through the
//! environment. The target resizes and maps the same fd, so both sides (and
//! every child the target forks) see the same bytes.

use core::{
    fmt::{self, Debug, Display},
    mem::{align_of, size_of, ManuallyDrop},
    ops::{Deref, DerefMut},
    ptr, slice,
};
use std::os::fd::RawFd;

use libc::{
    c_void, close, ftruncate, mmap, munmap, off_t, MAP_FAILED, MAP_SHARED, PROT_READ, PROT_WRITE,
};
use serde::{Deserialize, Serialize};

use crate::Error;

/// The id describing a shared memory mapping: the file descriptor backing it.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ShMemId {
    fd: RawFd,
}

impl ShMemId {
    /// Create a new id from a file descriptor
    #[must_use]
    pub const fn from_fd(fd: RawFd) -> Self {
        Self { fd }
    }

    /// Parse an id from its string form, as found in the environment.
    pub fn from_string(val: &str) -> Result<Self, Error> {
        let fd: RawFd = val.trim().parse()?;
        if fd < 0 {
            return Err(Error::illegal_argument(format!(
                "Shared memory fd must not be negative, got {fd}"
            )));
        }
        Ok(Self { fd })
    }

    /// The file descriptor
    #[must_use]
    pub const fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Display for ShMemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fd)
    }
}

/// A [`ShMem`] is an interface to a (possibly) shared map.
pub trait ShMem: Sized + Debug + DerefMut<Target = [u8]> {
    /// Get the id of this shared memory mapping, `None` if it is not shareable
    fn id(&self) -> Option<ShMemId>;

    /// Whether writes to this map are visible to other processes
    fn is_shared(&self) -> bool {
        self.id().is_some()
    }

    /// Convert to a mut ptr of a given type, checking the size and alignment.
    /// If the map is too small or misaligned, returns `None`
    fn as_mut_ptr_of<T: Sized>(&mut self) -> Option<*mut T> {
        if self.len() >= size_of::<T>() && (self.as_ptr() as usize) % align_of::<T>() == 0 {
            Some(self.as_mut_ptr() as *mut T)
        } else {
            None
        }
    }
}

/// A map backed by a file descriptor, mapped `MAP_SHARED`.
#[derive(Debug)]
pub struct FdShMem {
    id: ShMemId,
    map: *mut u8,
    map_size: usize,
    /// Whether we created the fd and have to close it on drop
    owns_fd: bool,
}

impl FdShMem {
    /// Create a fresh anonymous `memfd` of `map_size` bytes and map it.
    ///
    /// The fd is created without `CLOEXEC`, so an `exec`ed target inherits it.
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    pub fn new(map_size: usize) -> Result<Self, Error> {
        use std::os::fd::IntoRawFd;

        use nix::sys::memfd::{memfd_create, MemFdCreateFlag};

        let fd = memfd_create(c"rofl", MemFdCreateFlag::empty())
            .map_err(|errno| Error::os_error(errno.into(), "Failed to create memfd"))?
            .into_raw_fd();
        match Self::from_fd_and_size(fd, map_size) {
            Ok(mut shmem) => {
                shmem.owns_fd = true;
                Ok(shmem)
            }
            Err(err) => {
                unsafe { close(fd) };
                Err(err)
            }
        }
    }

    /// Map an existing fd, after resizing the object behind it to `map_size`.
    pub fn from_fd_and_size(fd: RawFd, map_size: usize) -> Result<Self, Error> {
        if map_size == 0 {
            return Err(Error::illegal_argument("Cannot map zero bytes"));
        }
        let len: off_t = map_size.try_into()?;
        unsafe {
            /* configure the size of the shared memory segment */
            if ftruncate(fd, len) != 0 {
                return Err(Error::last_os_error(format!(
                    "ftruncate() failed for map with fd {fd}"
                )));
            }

            /* map the shared memory segment to the address space of the process */
            let map = mmap(
                ptr::null_mut(),
                map_size,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                fd,
                0,
            );
            if ptr::addr_eq(map, MAP_FAILED) {
                return Err(Error::last_os_error(format!(
                    "mmap() failed for map with fd {fd}"
                )));
            }

            Ok(Self {
                id: ShMemId::from_fd(fd),
                map: map as *mut u8,
                map_size,
                owns_fd: false,
            })
        }
    }
}

impl ShMem for FdShMem {
    fn id(&self) -> Option<ShMemId> {
        Some(self.id)
    }
}

impl Deref for FdShMem {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // # Safety
        // The map stays valid until drop.
        unsafe { slice::from_raw_parts(self.map, self.map_size) }
    }
}

impl DerefMut for FdShMem {
    fn deref_mut(&mut self) -> &mut [u8] {
        // # Safety
        // The map stays valid until drop, and we hold the only Rust reference.
        unsafe { slice::from_raw_parts_mut(self.map, self.map_size) }
    }
}

/// [`Drop`] implementation for [`FdShMem`], which unmaps the memory and closes fds we created.
impl Drop for FdShMem {
    fn drop(&mut self) {
        unsafe {
            munmap(self.map as *mut c_void, self.map_size);
            if self.owns_fd {
                close(self.id.fd());
            }
        }
    }
}

/// A zeroed, process-private map. Nothing outside this process ever sees it.
///
/// The backing store is a `Vec<u64>`, so the map is aligned for any
/// structure with an alignment of up to 8 bytes.
#[derive(Debug, Clone, Default)]
pub struct PrivateShMem {
    buf: Vec<u64>,
    len: usize,
}

impl PrivateShMem {
    /// Allocate `map_size` zeroed bytes
    #[must_use]
    pub fn new(map_size: usize) -> Self {
        Self {
            buf: vec![0; map_size.div_ceil(size_of::<u64>())],
            len: map_size,
        }
    }
}

impl ShMem for PrivateShMem {
    fn id(&self) -> Option<ShMemId> {
        None
    }
}

impl Deref for PrivateShMem {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.buf.as_ptr() as *const u8, self.len) }
    }
}

impl DerefMut for PrivateShMem {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.buf.as_mut_ptr() as *mut u8, self.len) }
    }
}

/// Consume a map, and get the raw pointer to it, typed as `T`.
///
/// The map is never unmapped or freed afterwards: it lives as long as the
/// process does.
pub fn shmem_into_raw<T: Sized, SHM: ShMem>(shmem: SHM) -> Result<*mut T, Error> {
    let mut manually_dropped = ManuallyDrop::new(shmem);
    match manually_dropped.as_mut_ptr_of::<T>() {
        Some(ptr) => Ok(ptr),
        None => {
            let len = manually_dropped.len();
            // Nobody got a pointer, so we can still clean up.
            unsafe { ManuallyDrop::drop(&mut manually_dropped) };
            Err(Error::illegal_argument(format!(
                "Map of {len} bytes cannot hold a {} of {} bytes",
                core::any::type_name::<T>(),
                size_of::<T>()
            )))
        }
    }
}
