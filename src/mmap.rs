use std::ffi::CString;
use std::io;
use std::ptr::NonNull;

fn c_name(shared_memory_name: &str) -> io::Result<CString> {
    CString::new(shared_memory_name).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "shared memory name contains a NUL byte",
        )
    })
}

fn map_fd(fd: libc::c_int, size: usize) -> io::Result<NonNull<u8>> {
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(addr as *mut u8).ok_or_else(|| io::Error::other("mmap returned a null mapping"))
}

/// Creates a new segment of exactly `size` bytes and maps it.
///
/// Fails with `AlreadyExists` if a segment with this name is already present;
/// callers that want to replace a stale segment unlink it first. The fresh
/// segment is zero-filled by `ftruncate`.
pub(crate) fn create_shared_memory(
    shared_memory_name: &str,
    size: usize,
) -> io::Result<NonNull<u8>> {
    let name = c_name(shared_memory_name)?;

    unsafe {
        let fd = libc::shm_open(
            name.as_ptr(),
            libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
            0o600,
        );
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        if libc::ftruncate(fd, size as libc::off_t) == -1 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            libc::shm_unlink(name.as_ptr());
            return Err(err);
        }

        let mapped = map_fd(fd, size);
        libc::close(fd); // mapping stays valid
        if mapped.is_err() {
            libc::shm_unlink(name.as_ptr());
        }
        mapped
    }
}

/// Opens an existing segment without creating it.
///
/// Returns the mapping together with the segment's size. When the size differs
/// from `expected_size` nothing is mapped and `Ok(Err(found))` is returned so the
/// caller can report the mismatch.
pub(crate) fn open_shared_memory(
    shared_memory_name: &str,
    expected_size: usize,
) -> io::Result<Result<NonNull<u8>, usize>> {
    let name = c_name(shared_memory_name)?;

    unsafe {
        let fd = libc::shm_open(name.as_ptr(), libc::O_RDWR, 0);
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        let mut stat: libc::stat = std::mem::zeroed();
        if libc::fstat(fd, &mut stat) == -1 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let found = stat.st_size as usize;
        if found != expected_size {
            libc::close(fd);
            return Ok(Err(found));
        }

        let mapped = map_fd(fd, expected_size);
        libc::close(fd);
        mapped.map(Ok)
    }
}

pub(crate) unsafe fn unmap_shared_memory(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
    unsafe {
        if libc::munmap(ptr.as_ptr().cast(), size) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Removes the segment name. Returns `false` when no such segment existed.
pub(crate) fn unlink_shared_memory(shared_memory_name: &str) -> io::Result<bool> {
    let name = c_name(shared_memory_name)?;
    if unsafe { libc::shm_unlink(name.as_ptr()) } == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/shm_keyset_mmap_{}_{}", tag, std::process::id())
    }

    #[test]
    fn create_open_and_unlink() {
        let name = unique_name("roundtrip");
        let _ = unlink_shared_memory(&name);

        let ptr = create_shared_memory(&name, 4096).unwrap();
        unsafe { ptr.as_ptr().add(10).write(0xAB) };

        let other = open_shared_memory(&name, 4096).unwrap().unwrap();
        assert_eq!(unsafe { other.as_ptr().add(10).read() }, 0xAB);

        unsafe {
            unmap_shared_memory(other, 4096).unwrap();
            unmap_shared_memory(ptr, 4096).unwrap();
        }
        assert!(unlink_shared_memory(&name).unwrap());
        assert!(!unlink_shared_memory(&name).unwrap());
    }

    #[test]
    fn create_is_exclusive() {
        let name = unique_name("exclusive");
        let _ = unlink_shared_memory(&name);

        let ptr = create_shared_memory(&name, 4096).unwrap();
        let err = create_shared_memory(&name, 4096).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);

        unsafe { unmap_shared_memory(ptr, 4096).unwrap() };
        unlink_shared_memory(&name).unwrap();
    }

    #[test]
    fn open_reports_size_mismatch() {
        let name = unique_name("mismatch");
        let _ = unlink_shared_memory(&name);

        let ptr = create_shared_memory(&name, 4096).unwrap();
        assert_eq!(open_shared_memory(&name, 8192).unwrap(), Err(4096));

        unsafe { unmap_shared_memory(ptr, 4096).unwrap() };
        unlink_shared_memory(&name).unwrap();
    }

    #[test]
    fn open_missing_segment_fails() {
        let err = open_shared_memory(&unique_name("missing"), 4096).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn rejects_nul_in_name() {
        let err = create_shared_memory("/bad\0name", 4096).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
