//! Resolves the controller-supplied descriptor into a shared mapping.

use std::os::fd::RawFd;

use rofl_bolts::shmem::FdShMem;

/// Resize the object behind `shm_fd` to `size` bytes and map it shared.
///
/// Returns `None` if no descriptor was supplied, or if resizing or mapping
/// failed. Failures are logged; the caller falls back to private memory.
#[must_use]
pub fn map_shared_region(shm_fd: Option<RawFd>, size: usize) -> Option<FdShMem> {
    let fd = shm_fd?;
    match FdShMem::from_fd_and_size(fd, size) {
        Ok(shmem) => {
            log::debug!("Mapped {} shared bytes from fd {fd}", shmem.len());
            Some(shmem)
        }
        Err(err) => {
            log::error!("Could not map the feedback segment, running standalone: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::map_shared_region;

    #[test]
    fn test_no_fd_no_region() {
        assert!(map_shared_region(None, 4096).is_none());
    }

    #[test]
    fn test_bad_fd_no_region() {
        assert!(map_shared_region(Some(-1), 4096).is_none());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    fn test_region_is_shared_with_creator() {
        use rofl_bolts::shmem::{FdShMem, ShMem};

        let creator = FdShMem::new(64).unwrap();
        let fd = creator.id().unwrap().fd();
        let mut region = map_shared_region(Some(fd), 128).unwrap();
        assert_eq!(region.len(), 128);
        region[100] = 0xaa;

        let view = FdShMem::from_fd_and_size(fd, 128).unwrap();
        assert_eq!(view[100], 0xaa);
    }
}
