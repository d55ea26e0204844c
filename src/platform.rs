//! Platform-specific shared-memory interface.
//!
//! This module provides an abstraction over the operating system's named
//! shared-memory APIs:
//! - **Linux**: `shm_open`/`mmap` via `rustix`, with `MAP_POPULATE` and
//!   `MADV_DONTFORK` where available.
//! - **Other Unix (macOS, BSD)**: `shm_open`/`mmap` via `libc`, with a
//!   manual page-touching prefault pass (no portable populate-on-map flag).

use std::io;

use rustix::fd::OwnedFd;

/// Result of a successful mapping: the base address and whether the
/// large-page request was actually honoured.
pub struct Mapped {
    pub addr: usize,
    pub used_large_pages: bool,
}

/// Platform-specific shared-memory functions.
pub mod sys {
    use super::*;

    /// Create a new SHM object exclusively. Fails if the name already exists.
    #[cfg(target_os = "linux")]
    pub fn create_exclusive(name: &str) -> io::Result<OwnedFd> {
        use rustix::fs::Mode;
        use rustix::shm::{shm_open, ShmOFlags};

        shm_open(
            name,
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(io::Error::from)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn create_exclusive(name: &str) -> io::Result<OwnedFd> {
        use std::ffi::CString;
        use std::os::fd::FromRawFd;

        let cname = CString::new(name).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Open an existing SHM object read/write.
    #[cfg(target_os = "linux")]
    pub fn open_existing(name: &str) -> io::Result<OwnedFd> {
        use rustix::fs::Mode;
        use rustix::shm::{shm_open, ShmOFlags};

        shm_open(name, ShmOFlags::RDWR, Mode::empty()).map_err(io::Error::from)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn open_existing(name: &str) -> io::Result<OwnedFd> {
        use std::ffi::CString;
        use std::os::fd::FromRawFd;

        let cname = CString::new(name).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0o600) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Resize the SHM object to exactly `size` bytes.
    pub fn resize(fd: &OwnedFd, size: usize) -> io::Result<()> {
        rustix::fs::ftruncate(fd, size as u64).map_err(io::Error::from)
    }

    /// Query the current size of an open SHM object.
    pub fn query_size(fd: &OwnedFd) -> io::Result<usize> {
        let stat = rustix::fs::fstat(fd).map_err(io::Error::from)?;
        Ok(stat.st_size as usize)
    }

    /// Map `size` bytes of `fd` read/write, shared across processes.
    ///
    /// `populate` requests eager population on platforms that support it
    /// (Linux `MAP_POPULATE`); elsewhere the caller must fall back to
    /// [`prefault_write_pass`]. `large_pages` requests `MAP_HUGETLB` on
    /// Linux; on failure (no reserved hugepage pool, unaligned size,
    /// etc) this retries without it and reports the downgrade via
    /// `Mapped::used_large_pages`.
    #[cfg(target_os = "linux")]
    pub fn map(fd: &OwnedFd, size: usize, populate: bool, large_pages: bool) -> io::Result<Mapped> {
        use rustix::mm::{mmap, MapFlags, ProtFlags};
        use std::ptr;

        let mut flags = MapFlags::SHARED;
        if populate {
            flags |= MapFlags::POPULATE;
        }

        if large_pages {
            if let Ok(addr) = unsafe {
                mmap(
                    ptr::null_mut(),
                    size,
                    ProtFlags::READ | ProtFlags::WRITE,
                    flags | MapFlags::HUGETLB,
                    fd,
                    0,
                )
            } {
                return Ok(Mapped {
                    addr: addr as usize,
                    used_large_pages: true,
                });
            }
        }

        let addr = unsafe {
            mmap(
                ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                flags,
                fd,
                0,
            )
        }
        .map_err(io::Error::from)?;

        Ok(Mapped {
            addr: addr as usize,
            used_large_pages: false,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn map(fd: &OwnedFd, size: usize, _populate: bool, _large_pages: bool) -> io::Result<Mapped> {
        use std::os::fd::AsRawFd;
        use std::ptr;

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Mapped {
            addr: addr as usize,
            used_large_pages: false,
        })
    }

    /// Unmap a previously mapped region.
    pub fn unmap(addr: usize, size: usize) {
        #[cfg(target_os = "linux")]
        {
            use rustix::mm::munmap;
            let _ = unsafe { munmap(addr as *mut std::ffi::c_void, size) };
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = unsafe { libc::munmap(addr as *mut libc::c_void, size) };
        }
    }

    /// Remove an SHM object's name from the host namespace. Owner-only.
    #[cfg(target_os = "linux")]
    pub fn unlink(name: &str) -> io::Result<()> {
        rustix::shm::shm_unlink(name).map_err(io::Error::from)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn unlink(name: &str) -> io::Result<()> {
        use std::ffi::CString;

        let cname = CString::new(name).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let rc = unsafe { libc::shm_unlink(cname.as_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Advise the kernel not to duplicate this mapping across `fork`, to
    /// avoid tens-of-GiB of copy-on-write page tables in a forking parent.
    /// Linux-only; other platforms have no equivalent and are a no-op.
    #[cfg(target_os = "linux")]
    pub fn advise_dontfork(addr: usize, size: usize) {
        use rustix::mm::{madvise, Advice};
        let _ = unsafe { madvise(addr as *mut std::ffi::c_void, size, Advice::LinuxDontFork) };
    }

    #[cfg(not(target_os = "linux"))]
    pub fn advise_dontfork(_addr: usize, _size: usize) {}

    /// Whether `map`'s `populate` argument is honoured natively on this
    /// platform. When false, callers must run [`prefault_write_pass`]
    /// themselves to get the same foreign-DMA-safety guarantee.
    pub const fn populate_is_native() -> bool {
        cfg!(target_os = "linux")
    }

    /// Touch every page of `[addr, addr+size)` with a write, guaranteeing
    /// physical backing before any foreign-DMA access. Fallback for hosts
    /// that don't honour eager population on map.
    pub fn prefault_write_pass(addr: usize, size: usize) {
        let page_size = page_size();
        let base = addr as *mut u8;
        let mut off = 0usize;
        while off < size {
            unsafe { std::ptr::write_volatile(base.add(off), 0) };
            off += page_size;
        }
    }

    /// The host's page size, used to stride the prefault write pass.
    pub fn page_size() -> usize {
        rustix::param::page_size()
    }
}
