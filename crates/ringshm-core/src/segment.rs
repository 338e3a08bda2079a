//! POSIX shared-memory segment: create/open/map/unlink (§4.1).

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

use crate::error::SegmentError;

/// POSIX file-mode permission bits applied at creation. Default `0666`
/// per §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions(pub libc::mode_t);

impl Default for Permissions {
    fn default() -> Self {
        Permissions(0o666)
    }
}

/// A named, memory-mapped shared-memory region.
///
/// A `Segment` owns nothing persistent beyond the mapping: dropping it
/// unmaps the memory but never removes the segment from the OS
/// namespace (§4.1 rationale — the segment is the rendezvous point for
/// processes that may arrive, or crash, in arbitrary order).
pub struct Segment {
    name: String,
    fd: RawFd,
    base: *mut u8,
    size: u64,
    is_creator: bool,
    dev: libc::dev_t,
    ino: libc::ino_t,
}

// SAFETY: the mapped memory is shared by design; synchronization over
// its contents is the responsibility of whatever is layered on top
// (the ring buffer's mutex/condvar protocol).
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Attach to `name` if it exists (requiring its size to equal
    /// `size`), otherwise create it at `size` bytes with `perm`.
    pub fn open_or_create(
        name: &str,
        size: u64,
        perm: Permissions,
    ) -> Result<Self, SegmentError> {
        validate_name(name)?;
        let c_name = shm_cstring(name)?;

        // Try to be the creator first (O_EXCL), falling back to attach.
        // SAFETY: `c_name` is a valid, NUL-terminated C string.
        let create_fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                perm.0,
            )
        };

        if create_fd >= 0 {
            // SAFETY: `create_fd` is an owned, valid fd for a freshly
            // created object; it is the only process touching its size.
            if let Err(e) = unsafe { ftruncate(create_fd, size) } {
                unsafe {
                    libc::close(create_fd);
                    libc::shm_unlink(c_name.as_ptr());
                }
                return Err(SegmentError::from_os_error(name, e));
            }

            let (dev, ino, _) = match unsafe { fd_identity(create_fd) } {
                Ok(identity) => identity,
                Err(e) => {
                    unsafe {
                        libc::close(create_fd);
                        libc::shm_unlink(c_name.as_ptr());
                    }
                    return Err(SegmentError::from_os_error(name, e));
                }
            };

            let base = match unsafe { map(create_fd, size) } {
                Ok(ptr) => ptr,
                Err(e) => {
                    unsafe {
                        libc::close(create_fd);
                        libc::shm_unlink(c_name.as_ptr());
                    }
                    return Err(SegmentError::from_os_error(name, e));
                }
            };

            tracing::debug!(name, size, "created shared-memory segment");
            return Ok(Segment {
                name: name.to_string(),
                fd: create_fd,
                base,
                size,
                is_creator: true,
                dev,
                ino,
            });
        }

        let create_err = io::Error::last_os_error();
        if create_err.raw_os_error() != Some(libc::EEXIST) {
            return Err(SegmentError::from_os_error(name, create_err));
        }

        // Someone else won the creation race; attach to the existing segment.
        // SAFETY: `c_name` is a valid, NUL-terminated C string.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(SegmentError::from_os_error(name, io::Error::last_os_error()));
        }

        let (dev, ino, existing_size) = match unsafe { fd_identity(fd) } {
            Ok(identity) => identity,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(SegmentError::from_os_error(name, e));
            }
        };
        if existing_size != size {
            unsafe { libc::close(fd) };
            return Err(SegmentError::SizeMismatch {
                name: name.to_string(),
                existing: existing_size,
                requested: size,
            });
        }

        let base = match unsafe { map(fd, size) } {
            Ok(ptr) => ptr,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(SegmentError::from_os_error(name, e));
            }
        };

        tracing::debug!(name, size, "attached to existing shared-memory segment");
        Ok(Segment {
            name: name.to_string(),
            fd,
            base,
            size,
            is_creator: false,
            dev,
            ino,
        })
    }

    /// Attach to an existing segment, discovering its size from the OS.
    /// Fails with [`SegmentError::NotFound`] if `name` does not exist.
    pub fn open_read_write(name: &str) -> Result<Self, SegmentError> {
        validate_name(name)?;
        let c_name = shm_cstring(name)?;

        // SAFETY: `c_name` is a valid, NUL-terminated C string.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(SegmentError::from_os_error(name, io::Error::last_os_error()));
        }

        let (dev, ino, size) = match unsafe { fd_identity(fd) } {
            Ok(identity) => identity,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(SegmentError::from_os_error(name, e));
            }
        };

        let base = match unsafe { map(fd, size) } {
            Ok(ptr) => ptr,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(SegmentError::from_os_error(name, e));
            }
        };

        Ok(Segment {
            name: name.to_string(),
            fd,
            base,
            size,
            is_creator: false,
            dev,
            ino,
        })
    }

    /// Size of the mapping in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Raw pointer to the start of the mapping.
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Whether this handle created the segment's OS object (won the
    /// `shm_open(O_EXCL)` race), as opposed to attaching to one that
    /// already existed.
    pub fn is_creator(&self) -> bool {
        self.is_creator
    }

    /// Name this segment was opened/created under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the OS object backing this mapping is still the one
    /// named `self.name()` — false once an administrator or publisher
    /// has unlinked it (with or without a replacement created under
    /// the same name since), per §4.2.6. Re-opens `name` and compares
    /// device/inode against what was recorded at attach time, so a
    /// same-size same-name replacement (a fresh `shm_open` object) is
    /// still correctly detected as a different segment.
    pub fn is_current(&self) -> bool {
        let Ok(c_name) = shm_cstring(&self.name) else {
            return false;
        };
        // SAFETY: `c_name` is a valid, NUL-terminated C string.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd < 0 {
            return false;
        }
        // SAFETY: `fd` was just opened successfully above.
        let identity = unsafe { fd_identity(fd) };
        unsafe { libc::close(fd) };
        match identity {
            Ok((dev, ino, _)) => dev == self.dev && ino == self.ino,
            Err(_) => false,
        }
    }

    /// Administrative removal from the shared-memory namespace.
    ///
    /// Safe to call with live handles elsewhere: the name vanishes,
    /// but existing mappings remain valid until each holder drops.
    pub fn unlink(name: &str) -> Result<(), SegmentError> {
        validate_name(name)?;
        let c_name = shm_cstring(name)?;
        // SAFETY: `c_name` is a valid, NUL-terminated C string.
        let rc = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Err(SegmentError::NotFound {
                    name: name.to_string(),
                });
            }
            return Err(SegmentError::from_os_error(name, err));
        }
        tracing::debug!(name, "unlinked shared-memory segment");
        Ok(())
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: `self.base`/`self.size` describe a mapping this
        // `Segment` owns exclusively.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size as usize);
            libc::close(self.fd);
        }
    }
}

fn validate_name(name: &str) -> Result<(), SegmentError> {
    if name.is_empty() || name.len() > 64 || name.contains('\0') {
        return Err(SegmentError::InvalidName {
            name: name.to_string(),
        });
    }
    #[cfg(target_os = "linux")]
    {
        // Linux's shm namespace forbids an embedded '/' beyond a single
        // leading one.
        if name.matches('/').count() > 1 || !name.starts_with('/') {
            return Err(SegmentError::InvalidName {
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

fn shm_cstring(name: &str) -> Result<CString, SegmentError> {
    CString::new(name).map_err(|_| SegmentError::InvalidName {
        name: name.to_string(),
    })
}

/// # Safety
/// `fd` must be a valid, owned file descriptor not shared with any
/// concurrent resize.
unsafe fn ftruncate(fd: RawFd, size: u64) -> io::Result<()> {
    // SAFETY: caller guarantees `fd` validity.
    let rc = unsafe { libc::ftruncate(fd, size as libc::off_t) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// # Safety
/// `fd` must reference an open shared-memory object.
unsafe fn fd_identity(fd: RawFd) -> io::Result<(libc::dev_t, libc::ino_t, u64)> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: `stat` is valid, writable storage; `fd` is caller-checked.
    let rc = unsafe { libc::fstat(fd, &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((stat.st_dev, stat.st_ino, stat.st_size as u64))
}

/// # Safety
/// `fd` must be open for read/write and reference an object at least
/// `size` bytes long.
unsafe fn map(fd: RawFd, size: u64) -> io::Result<*mut u8> {
    // SAFETY: caller guarantees `fd` validity and sizing.
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size as usize,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        Err(io::Error::last_os_error())
    } else {
        Ok(ptr as *mut u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!(
            "/ringshm-test-{}-{}-{}",
            tag,
            std::process::id(),
            crate::clock::now_micros()
        )
    }

    #[test]
    fn create_then_attach_same_size() {
        let name = unique_name("create-attach");
        let a = Segment::open_or_create(&name, 4096, Permissions::default()).unwrap();
        assert!(a.is_creator());
        assert_eq!(a.size(), 4096);

        let b = Segment::open_or_create(&name, 4096, Permissions::default()).unwrap();
        assert!(!b.is_creator());
        assert_eq!(b.size(), 4096);

        drop(a);
        drop(b);
        Segment::unlink(&name).unwrap();
    }

    #[test]
    fn size_mismatch_rejected() {
        let name = unique_name("size-mismatch");
        let a = Segment::open_or_create(&name, 4096, Permissions::default()).unwrap();
        let err = Segment::open_or_create(&name, 8192, Permissions::default()).unwrap_err();
        assert!(matches!(err, SegmentError::SizeMismatch { .. }));
        drop(a);
        Segment::unlink(&name).unwrap();
    }

    #[test]
    fn open_read_write_missing_is_not_found() {
        let name = unique_name("missing");
        let err = Segment::open_read_write(&name).unwrap_err();
        assert!(matches!(err, SegmentError::NotFound { .. }));
    }

    #[test]
    fn survives_creator_drop_without_unlink() {
        let name = unique_name("crash-safe");
        let a = Segment::open_or_create(&name, 4096, Permissions::default()).unwrap();
        drop(a); // simulates a publisher that exits without unlinking

        let b = Segment::open_read_write(&name).unwrap();
        assert_eq!(b.size(), 4096);
        drop(b);
        Segment::unlink(&name).unwrap();
    }

    #[test]
    fn empty_name_is_invalid() {
        let err = Segment::open_or_create("", 4096, Permissions::default()).unwrap_err();
        assert!(matches!(err, SegmentError::InvalidName { .. }));
    }

    #[test]
    fn is_current_true_while_untouched() {
        let name = unique_name("current");
        let a = Segment::open_or_create(&name, 4096, Permissions::default()).unwrap();
        assert!(a.is_current());
        drop(a);
        Segment::unlink(&name).unwrap();
    }

    #[test]
    fn is_current_false_after_unlink() {
        let name = unique_name("unlinked");
        let a = Segment::open_or_create(&name, 4096, Permissions::default()).unwrap();
        Segment::unlink(&name).unwrap();
        assert!(!a.is_current());
    }

    #[test]
    fn is_current_false_after_unlink_and_recreate() {
        let name = unique_name("recreated");
        let a = Segment::open_or_create(&name, 4096, Permissions::default()).unwrap();
        Segment::unlink(&name).unwrap();
        let b = Segment::open_or_create(&name, 8192, Permissions::default()).unwrap();
        assert!(!a.is_current());
        assert!(b.is_current());
        drop(a);
        drop(b);
        Segment::unlink(&name).unwrap();
    }
}
