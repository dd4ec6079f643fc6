//! Thin wrappers over descriptor-level libc calls
//!
//! Descriptors handed out by the disk backend are plain integers the caller
//! may close at any time, so these helpers never take ownership and report
//! a stale descriptor as `Error::BadDescriptor` instead of panicking.

use std::io;
use std::os::unix::io::RawFd;

use libc::c_void;

use crate::error::{Error, Result};

fn retry<F: FnMut() -> isize>(mut call: F) -> Result<usize> {
    loop {
        let n = call();
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(Error::from_io(err));
        }
    }
}

/// Write the whole buffer at the current file position.
pub fn write_all(fd: RawFd, buf: &[u8]) -> Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        let rest = &buf[written..];
        let n = retry(|| unsafe { libc::write(fd, rest.as_ptr() as *const c_void, rest.len()) })?;
        if n == 0 {
            return Err(Error::Io(io::Error::from(io::ErrorKind::WriteZero)));
        }
        written += n;
    }
    Ok(written)
}

/// Positional read; 0 at or past end of file.
///
/// Empty buffers and offsets beyond `off_t` read nothing; the descriptor
/// is still checked.
pub fn pread(fd: RawFd, buf: &mut [u8], offset: u64) -> Result<usize> {
    let offset = match libc::off_t::try_from(offset) {
        Ok(offset) if !buf.is_empty() => offset,
        _ => {
            size(fd)?;
            return Ok(0);
        }
    };
    retry(|| unsafe {
        libc::pread(
            fd,
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            offset,
        )
    })
}

/// Size of the file behind the descriptor.
pub fn size(fd: RawFd) -> Result<u64> {
    let mut info: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut info) } < 0 {
        return Err(Error::last_os_error());
    }
    Ok(info.st_size as u64)
}

/// Flush file data and metadata to stable storage.
pub fn sync(fd: RawFd) -> Result<()> {
    if unsafe { libc::fsync(fd) } < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Truncate to zero and rewind the file position.
pub fn truncate(fd: RawFd) -> Result<()> {
    if unsafe { libc::ftruncate(fd, 0) } < 0 {
        return Err(Error::last_os_error());
    }
    if unsafe { libc::lseek(fd, 0, libc::SEEK_SET) } < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Close the descriptor; a second close reports `BadDescriptor`.
pub fn close(fd: RawFd) -> Result<()> {
    if unsafe { libc::close(fd) } < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}
